//! BER-encoded ASN.1 decoder (C6, `spec.md` §4.6).
//!
//! Grounded in `examples/original_source/src/asn1/ut-asn1-ber-decoder-test.c`
//! for exact error strings and test vectors, and in
//! `examples/original_source/src/asn1/ut-asn1-type.c` for the
//! tag-class/universal-tag vocabulary. The C source keeps a single decoder
//! object that latches its first error and lets every subsequent call on it
//! return a stale value; here each `decode_*` call independently returns a
//! [`Result`], which is the idiomatic Rust shape for "this call may fail"
//! and preserves the same observable behavior (the first failing call is
//! the one whose message callers see).

use crate::error::{Error, Result};

/// The four ASN.1 tag classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    Universal,
    Application,
    ContextSpecific,
    Private,
}

/// Universal tag numbers this decoder knows how to interpret.
pub mod universal_tag {
    pub const BOOLEAN: u32 = 1;
    pub const INTEGER: u32 = 2;
    pub const BIT_STRING: u32 = 3;
    pub const OCTET_STRING: u32 = 4;
    pub const NULL: u32 = 5;
    pub const OBJECT_IDENTIFIER: u32 = 6;
    pub const ENUMERATED: u32 = 10;
    pub const UTF8_STRING: u32 = 12;
    pub const RELATIVE_OID: u32 = 13;
    pub const SEQUENCE: u32 = 16;
    pub const SET: u32 = 17;
    pub const NUMERIC_STRING: u32 = 18;
    pub const PRINTABLE_STRING: u32 = 19;
    pub const IA5_STRING: u32 = 22;
    pub const VISIBLE_STRING: u32 = 26;
}

/// One decoded BER tag-length-value: the identifier octet(s), constructed
/// bit, and a borrowed view of the content octets.
pub struct BerDecoder<'a> {
    tag_class: TagClass,
    identifier_number: u32,
    constructed: bool,
    content: &'a [u8],
    /// Byte offset in the original buffer immediately after this TLV, for
    /// callers (like SEQUENCE/SET) that need to step to the next sibling.
    next_offset: usize,
}

impl<'a> BerDecoder<'a> {
    /// Parse one TLV starting at the beginning of `data`.
    pub fn new(data: &'a [u8]) -> Result<Self> {
        let mut offset = 0usize;
        let identifier = *data
            .get(offset)
            .ok_or_else(|| Error::protocol("Insufficient data"))?;
        offset += 1;

        let tag_class = match identifier >> 6 {
            0 => TagClass::Universal,
            1 => TagClass::Application,
            2 => TagClass::ContextSpecific,
            _ => TagClass::Private,
        };
        let constructed = identifier & 0x20 != 0;
        let mut identifier_number = (identifier & 0x1f) as u32;
        if identifier_number == 0x1f {
            identifier_number = 0;
            loop {
                let b = *data
                    .get(offset)
                    .ok_or_else(|| Error::protocol("Insufficient data"))?;
                offset += 1;
                identifier_number = (identifier_number << 7) | (b & 0x7f) as u32;
                if b & 0x80 == 0 {
                    break;
                }
            }
        }

        let length_byte = *data
            .get(offset)
            .ok_or_else(|| Error::protocol("Insufficient data"))?;
        offset += 1;
        let length: usize = if length_byte & 0x80 == 0 {
            length_byte as usize
        } else {
            let n_bytes = (length_byte & 0x7f) as usize;
            if n_bytes == 0 {
                return Err(Error::protocol("Indefinite length not supported"));
            }
            let mut len = 0usize;
            for _ in 0..n_bytes {
                let b = *data
                    .get(offset)
                    .ok_or_else(|| Error::protocol("Insufficient data"))?;
                offset += 1;
                len = (len << 8) | b as usize;
            }
            len
        };

        let content = data
            .get(offset..offset + length)
            .ok_or_else(|| Error::protocol("Insufficient data"))?;
        let next_offset = offset + length;

        Ok(Self {
            tag_class,
            identifier_number,
            constructed,
            content,
            next_offset,
        })
    }

    /// The tag class of this TLV.
    pub fn tag_class(&self) -> TagClass {
        self.tag_class
    }

    /// The tag (identifier) number.
    pub fn identifier_number(&self) -> u32 {
        self.identifier_number
    }

    /// Whether the constructed bit was set.
    pub fn is_constructed(&self) -> bool {
        self.constructed
    }

    /// Byte offset, in the buffer this decoder was built from, just past
    /// this TLV's content.
    pub fn next_offset(&self) -> usize {
        self.next_offset
    }

    /// BOOLEAN: false iff the single content byte is zero.
    pub fn decode_boolean(&self) -> Result<bool> {
        if self.constructed {
            return Err(Error::protocol("Boolean does not have constructed form"));
        }
        if self.content.len() != 1 {
            return Err(Error::protocol("Invalid boolean data length"));
        }
        Ok(self.content[0] != 0)
    }

    fn decode_signed_integer(&self, constructed_msg: &str) -> Result<i64> {
        if self.constructed {
            return Err(Error::protocol(constructed_msg));
        }
        if self.content.is_empty() {
            return Err(Error::protocol("Invalid integer data length"));
        }
        if self.content.len() > 8 {
            return Err(Error::capacity("Only 64 bit integers supported"));
        }
        let mut value: i64 = if self.content[0] & 0x80 != 0 { -1 } else { 0 };
        for &b in self.content {
            value = (value << 8) | b as i64;
        }
        Ok(value)
    }

    /// INTEGER: a signed two's-complement value up to 64 bits.
    pub fn decode_integer(&self) -> Result<i64> {
        self.decode_signed_integer("Integer does not have constructed form")
    }

    /// ENUMERATED: same encoding as INTEGER.
    pub fn decode_enumerated(&self) -> Result<i64> {
        self.decode_signed_integer("Integer does not have constructed form")
    }

    /// OCTET STRING: the raw content bytes. The primitive form only;
    /// constructed OCTET STRING (concatenation of child OCTET STRINGs) is
    /// not supported, matching the source.
    pub fn decode_octet_string(&self) -> Result<Vec<u8>> {
        if self.constructed {
            return Err(Error::protocol("Constructed octet string not supported"));
        }
        Ok(self.content.to_vec())
    }

    /// NULL: content must be empty.
    pub fn decode_null(&self) -> Result<()> {
        if self.constructed {
            return Err(Error::protocol("Null does not have constructed form"));
        }
        if !self.content.is_empty() {
            return Err(Error::protocol("Invalid null data length"));
        }
        Ok(())
    }

    fn decode_base128_subidentifiers(&self) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        let mut value: u32 = 0;
        let mut have_byte = false;
        for &b in self.content {
            value = value
                .checked_shl(7)
                .map(|v| v | (b & 0x7f) as u32)
                .unwrap_or(u32::MAX);
            have_byte = true;
            if b & 0x80 == 0 {
                out.push(value);
                value = 0;
                have_byte = false;
            }
        }
        if have_byte {
            return Err(Error::protocol("truncated sub-identifier"));
        }
        Ok(out)
    }

    /// OBJECT IDENTIFIER: `{first, second, rest...}`, where the first
    /// content sub-identifier encodes `first*40 + second`.
    pub fn decode_object_identifier(&self) -> Result<Vec<u32>> {
        if self.constructed {
            return Err(Error::protocol(
                "Object identifier does not have constructed form",
            ));
        }
        if self.content.is_empty() {
            return Err(Error::protocol("Invalid object identifier"));
        }
        let subids = self
            .decode_base128_subidentifiers()
            .map_err(|_| Error::protocol("Invalid object identifier"))?;
        let mut iter = subids.into_iter();
        let first_encoded = iter.next().ok_or_else(|| Error::protocol("Invalid object identifier"))?;
        let first = (first_encoded / 40).min(2);
        let second = first_encoded - first * 40;
        let mut out = vec![first, second];
        out.extend(iter);
        Ok(out)
    }

    /// RELATIVE-OID: a list of sub-identifiers with no `first*40 + second`
    /// decomposition; an empty value decodes to an empty list, not an
    /// error.
    pub fn decode_relative_oid(&self) -> Result<Vec<u32>> {
        if self.constructed {
            return Err(Error::protocol(
                "Relative object identifier does not have constructed form",
            ));
        }
        if self.content.is_empty() {
            return Ok(Vec::new());
        }
        self.decode_base128_subidentifiers()
            .map_err(|_| Error::protocol("Invalid relative object identifier"))
    }

    /// UTF8String.
    pub fn decode_utf8_string(&self) -> Result<String> {
        if self.constructed {
            return Err(Error::protocol("Constructed UTF8 string not supported"));
        }
        std::str::from_utf8(self.content)
            .map(str::to_owned)
            .map_err(|_| Error::protocol("Invalid UTF8 string"))
    }

    /// NumericString: digits and space only.
    pub fn decode_numeric_string(&self) -> Result<String> {
        if self.constructed {
            return Err(Error::protocol("Constructed numeric string not supported"));
        }
        if !self.content.iter().all(|&b| b.is_ascii_digit() || b == b' ') {
            return Err(Error::protocol("Invalid numeric string"));
        }
        Ok(self.content.iter().map(|&b| b as char).collect())
    }

    /// PrintableString: the ASN.1 printable-string character set.
    pub fn decode_printable_string(&self) -> Result<String> {
        if self.constructed {
            return Err(Error::protocol(
                "Constructed printable string not supported",
            ));
        }
        const EXTRA: &[u8] = b" '()+,-./:=?";
        if !self
            .content
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || EXTRA.contains(&b))
        {
            return Err(Error::protocol("Invalid printable string"));
        }
        Ok(self.content.iter().map(|&b| b as char).collect())
    }

    /// IA5String: 7-bit ASCII.
    pub fn decode_ia5_string(&self) -> Result<String> {
        if self.constructed {
            return Err(Error::protocol("Constructed IA5 string not supported"));
        }
        if !self.content.iter().all(|&b| b <= 0x7f) {
            return Err(Error::protocol("Invalid IA5 string"));
        }
        Ok(self.content.iter().map(|&b| b as char).collect())
    }

    /// VisibleString: printable ASCII, 0x20-0x7e.
    pub fn decode_visible_string(&self) -> Result<String> {
        if self.constructed {
            return Err(Error::protocol("Constructed visible string not supported"));
        }
        if !self.content.iter().all(|&b| (0x20..=0x7e).contains(&b)) {
            return Err(Error::protocol("Invalid visible string"));
        }
        Ok(self.content.iter().map(|&b| b as char).collect())
    }

    /// SEQUENCE: a recursively-decoded, ordered list of child TLVs sharing
    /// the parent's content buffer (`spec.md` §9's "borrowed sub-decoders
    /// with a lifetime tied to the parent" choice).
    pub fn decode_sequence(&self) -> Result<Vec<BerDecoder<'a>>> {
        if !self.constructed {
            return Err(Error::protocol("Sequence must be constructed"));
        }
        self.decode_children()
    }

    /// SET: same encoding as SEQUENCE, un-ordered by convention only.
    pub fn decode_set(&self) -> Result<Vec<BerDecoder<'a>>> {
        if !self.constructed {
            return Err(Error::protocol("Set must be constructed"));
        }
        self.decode_children()
    }

    fn decode_children(&self) -> Result<Vec<BerDecoder<'a>>> {
        let mut children = Vec::new();
        let mut rest = self.content;
        while !rest.is_empty() {
            let child = BerDecoder::new(rest)?;
            let consumed = child.next_offset;
            children.push(child);
            rest = &rest[consumed..];
        }
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn boolean_false_true_and_errors() {
        assert!(!BerDecoder::new(&hex("010100")).unwrap().decode_boolean().unwrap());
        assert!(BerDecoder::new(&hex("0101ff")).unwrap().decode_boolean().unwrap());
        assert!(BerDecoder::new(&hex("010101")).unwrap().decode_boolean().unwrap());
        assert_eq!(
            BerDecoder::new(&hex("0100")).unwrap().decode_boolean().unwrap_err().to_string(),
            "Invalid boolean data length"
        );
        assert_eq!(
            BerDecoder::new(&hex("01020000")).unwrap().decode_boolean().unwrap_err().to_string(),
            "Invalid boolean data length"
        );
        assert_eq!(
            BerDecoder::new(&hex("210100")).unwrap().decode_boolean().unwrap_err().to_string(),
            "Boolean does not have constructed form"
        );
    }

    #[test]
    fn integer_values_and_limits() {
        assert_eq!(BerDecoder::new(&hex("020100")).unwrap().decode_integer().unwrap(), 0);
        assert_eq!(BerDecoder::new(&hex("020101")).unwrap().decode_integer().unwrap(), 1);
        assert_eq!(BerDecoder::new(&hex("02017f")).unwrap().decode_integer().unwrap(), 127);
        assert_eq!(BerDecoder::new(&hex("02020080")).unwrap().decode_integer().unwrap(), 128);
        assert_eq!(BerDecoder::new(&hex("020180")).unwrap().decode_integer().unwrap(), -128);
        assert_eq!(BerDecoder::new(&hex("0201ff")).unwrap().decode_integer().unwrap(), -1);
        assert_eq!(
            BerDecoder::new(&hex("02087fffffffffffffff")).unwrap().decode_integer().unwrap(),
            i64::MAX
        );
        assert_eq!(
            BerDecoder::new(&hex("02088000000000000000")).unwrap().decode_integer().unwrap(),
            i64::MIN
        );
        assert_eq!(
            BerDecoder::new(&hex("02080123456789abcdef")).unwrap().decode_integer().unwrap(),
            0x0123456789abcdefu64 as i64
        );
        assert_eq!(
            BerDecoder::new(&hex("0210ffffffffffffffffffffffffffffffff"))
                .unwrap()
                .decode_integer()
                .unwrap_err()
                .to_string(),
            "Only 64 bit integers supported"
        );
        assert_eq!(
            BerDecoder::new(&hex("0200")).unwrap().decode_integer().unwrap_err().to_string(),
            "Invalid integer data length"
        );
        assert_eq!(
            BerDecoder::new(&hex("220100")).unwrap().decode_integer().unwrap_err().to_string(),
            "Integer does not have constructed form"
        );
    }

    #[test]
    fn octet_string_lengths() {
        assert_eq!(BerDecoder::new(&hex("0400")).unwrap().decode_octet_string().unwrap(), Vec::<u8>::new());
        assert_eq!(
            BerDecoder::new(&hex("04080123456789abcdef")).unwrap().decode_octet_string().unwrap(),
            hex("0123456789abcdef")
        );
        let mut data4 = hex("047f");
        data4.resize(2 + 127, 0);
        assert_eq!(BerDecoder::new(&data4).unwrap().decode_octet_string().unwrap().len(), 127);

        let mut data5 = hex("04820080");
        data5.resize(4 + 128, 0);
        assert_eq!(BerDecoder::new(&data5).unwrap().decode_octet_string().unwrap().len(), 128);
    }

    #[test]
    fn null_value() {
        BerDecoder::new(&hex("0500")).unwrap().decode_null().unwrap();
        assert_eq!(
            BerDecoder::new(&hex("050100")).unwrap().decode_null().unwrap_err().to_string(),
            "Invalid null data length"
        );
        assert_eq!(
            BerDecoder::new(&hex("2500")).unwrap().decode_null().unwrap_err().to_string(),
            "Null does not have constructed form"
        );
    }

    #[test]
    fn object_identifier_decomposition() {
        assert_eq!(
            BerDecoder::new(&hex("0603883703")).unwrap().decode_object_identifier().unwrap(),
            vec![2, 999, 3]
        );
        assert_eq!(
            BerDecoder::new(&hex("0600")).unwrap().decode_object_identifier().unwrap_err().to_string(),
            "Invalid object identifier"
        );
        assert_eq!(
            BerDecoder::new(&hex("060188")).unwrap().decode_object_identifier().unwrap_err().to_string(),
            "Invalid object identifier"
        );
    }

    #[test]
    fn relative_oid_empty_is_not_an_error() {
        assert_eq!(
            BerDecoder::new(&hex("0d04c27b0302")).unwrap().decode_relative_oid().unwrap(),
            vec![8571, 3, 2]
        );
        assert_eq!(
            BerDecoder::new(&hex("0d00")).unwrap().decode_relative_oid().unwrap(),
            Vec::<u32>::new()
        );
        assert_eq!(
            BerDecoder::new(&hex("0d0188")).unwrap().decode_relative_oid().unwrap_err().to_string(),
            "Invalid relative object identifier"
        );
    }

    #[test]
    fn utf8_string_decode() {
        let d = BerDecoder::new(&hex("0c0a48656c6c6f20f09f9880")).unwrap();
        assert_eq!(d.decode_utf8_string().unwrap(), "Hello \u{1F600}");
        assert_eq!(BerDecoder::new(&hex("0c00")).unwrap().decode_utf8_string().unwrap(), "");
    }

    #[test]
    fn sequence_and_set_of_mixed_types() {
        let seq = BerDecoder::new(&hex("30060101ff02012a")).unwrap();
        let children = seq.decode_sequence().unwrap();
        assert_eq!(children.len(), 2);
        assert!(children[0].decode_boolean().unwrap());
        assert_eq!(children[1].decode_integer().unwrap(), 42);

        assert_eq!(
            BerDecoder::new(&hex("1000")).unwrap().decode_sequence().unwrap_err().to_string(),
            "Sequence must be constructed"
        );
        assert_eq!(
            BerDecoder::new(&hex("1100")).unwrap().decode_set().unwrap_err().to_string(),
            "Set must be constructed"
        );
    }

    #[test]
    fn numeric_printable_ia5_visible_strings() {
        assert_eq!(
            BerDecoder::new(&hex("120b3132333435203637383930")).unwrap().decode_numeric_string().unwrap(),
            "12345 67890"
        );
        assert_eq!(
            BerDecoder::new(&hex("120b48656c6c6f20576f726c64"))
                .unwrap()
                .decode_numeric_string()
                .unwrap_err()
                .to_string(),
            "Invalid numeric string"
        );
        assert_eq!(
            BerDecoder::new(&hex("130b48656c6c6f20576f726c64")).unwrap().decode_printable_string().unwrap(),
            "Hello World"
        );
        assert_eq!(
            BerDecoder::new(&hex("160b48656c6c6f20576f726c64")).unwrap().decode_ia5_string().unwrap(),
            "Hello World"
        );
        assert_eq!(
            BerDecoder::new(&hex("1601ff")).unwrap().decode_ia5_string().unwrap_err().to_string(),
            "Invalid IA5 string"
        );
        assert_eq!(
            BerDecoder::new(&hex("1a0b48656c6c6f20576f726c64")).unwrap().decode_visible_string().unwrap(),
            "Hello World"
        );
        assert_eq!(
            BerDecoder::new(&hex("160101")).unwrap().decode_visible_string().unwrap_err().to_string(),
            "Invalid visible string"
        );
    }
}
