//! The string capability (`spec.md` §3/§4.2).
//!
//! Canonical storage is UTF-8 (a plain `String`); UTF-16, ASCII and
//! Latin-1 are *derived views*, computed on demand rather than stored
//! redundantly. Encoding out of UTF-8 into a narrower charset fails with
//! `invalid-code-points` if any code point doesn't fit; decoding into
//! UTF-8 from UTF-16 never fails — unpaired surrogates become U+FFFD —
//! and decoding from ASCII/Latin-1 never fails either, since every byte
//! 0..=255 is a valid Latin-1 code point.

use crate::error::Error;

/// A UTF-8 text value with an optional mutability bit.
#[derive(Debug, Clone)]
pub struct RtString {
    text: String,
    mutable: bool,
}

impl RtString {
    /// A new, mutable string.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            mutable: true,
        }
    }

    /// A new, immutable string (e.g. decoded from a wire format).
    pub fn immutable(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            mutable: false,
        }
    }

    /// Borrow the canonical UTF-8 text.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Whether `append`/`prepend`/`clear` are available.
    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// Append to a mutable string.
    ///
    /// # Panics
    /// If the string is not mutable.
    pub fn append(&mut self, s: &str) {
        assert!(self.mutable, "append on immutable string");
        self.text.push_str(s);
    }

    /// Prepend to a mutable string.
    ///
    /// # Panics
    /// If the string is not mutable.
    pub fn prepend(&mut self, s: &str) {
        assert!(self.mutable, "prepend on immutable string");
        self.text = format!("{s}{}", self.text);
    }

    /// Clear a mutable string.
    ///
    /// # Panics
    /// If the string is not mutable.
    pub fn clear(&mut self) {
        assert!(self.mutable, "clear on immutable string");
        self.text.clear();
    }

    /// Derived view: Unicode code points.
    pub fn code_points(&self) -> Vec<char> {
        self.text.chars().collect()
    }

    /// Derived view: UTF-16 code units. Always representable — UTF-8 can
    /// encode every Unicode scalar value, and every scalar value has a
    /// UTF-16 encoding — so this never fails.
    pub fn to_utf16(&self) -> Vec<u16> {
        self.text.encode_utf16().collect()
    }

    /// Derived view: 7-bit ASCII bytes. Fails with `invalid-code-points`
    /// if any character is outside `0x00..=0x7F`.
    pub fn to_ascii(&self) -> crate::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.text.len());
        for c in self.text.chars() {
            let cp = c as u32;
            if cp > 0x7F {
                return Err(Error::protocol("invalid-code-points"));
            }
            out.push(cp as u8);
        }
        Ok(out)
    }

    /// Derived view: Latin-1 (ISO-8859-1) bytes. Fails with
    /// `invalid-code-points` if any character is outside `0x00..=0xFF`.
    pub fn to_latin1(&self) -> crate::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.text.len());
        for c in self.text.chars() {
            let cp = c as u32;
            if cp > 0xFF {
                return Err(Error::protocol("invalid-code-points"));
            }
            out.push(cp as u8);
        }
        Ok(out)
    }

    /// Decode from UTF-16 code units. Unpaired surrogates become U+FFFD;
    /// this never fails.
    pub fn from_utf16(units: &[u16]) -> Self {
        let text: String = char::decode_utf16(units.iter().copied())
            .map(|r| r.unwrap_or('\u{FFFD}'))
            .collect();
        Self::new(text)
    }

    /// Decode from Latin-1/ASCII bytes. Every byte 0..=255 is a valid
    /// Unicode scalar value under Latin-1, so this never fails.
    pub fn from_latin1(bytes: &[u8]) -> Self {
        let text: String = bytes.iter().map(|&b| b as char).collect();
        Self::new(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_ascii() {
        let s = RtString::new("hello");
        assert_eq!(s.to_ascii().unwrap(), b"hello");
        assert_eq!(s.to_latin1().unwrap(), b"hello");
        assert_eq!(s.to_utf16(), vec![104, 101, 108, 108, 111]);
    }

    #[test]
    fn ascii_encode_fails_on_non_ascii() {
        let s = RtString::new("héllo");
        assert!(s.to_ascii().is_err());
        assert!(s.to_latin1().is_ok());
    }

    #[test]
    fn latin1_encode_fails_beyond_0xff() {
        let s = RtString::new("\u{1F600}"); // emoji, far beyond Latin-1
        assert!(s.to_latin1().is_err());
    }

    #[test]
    fn utf16_decode_replaces_unpaired_surrogate() {
        let units = [0xD800u16]; // lone high surrogate, never paired
        let s = RtString::from_utf16(&units);
        assert_eq!(s.as_str(), "\u{FFFD}");
    }

    #[test]
    fn latin1_decode_never_fails() {
        let bytes: Vec<u8> = (0..=255).collect();
        let s = RtString::from_latin1(&bytes);
        assert_eq!(s.code_points().len(), 256);
    }

    #[test]
    #[should_panic(expected = "append on immutable")]
    fn immutable_string_rejects_mutation() {
        let mut s = RtString::immutable("fixed");
        s.append("!");
    }
}
