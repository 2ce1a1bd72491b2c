//! Canonical Huffman table reconstruction for JPEG DC/AC coefficients
//! (C8, `spec.md` §4.8 "DHT payload").
//!
//! Grounded in ITU-T T.81 Annex C (`ut-jpeg-decoder.c`'s
//! `decode_define_huffman_table` parses exactly the per-length symbol
//! counts and symbol bytes this module consumes, then hands them to
//! `ut_huffman_decoder_new_canonical` whose body isn't in the retrieved
//! source). Reconstructed directly from the standard's canonical-code
//! assignment algorithm: codes of each bit length are consecutive, and the
//! first code of each length is `2 * (first code of the previous length +
//! count at the previous length)`.

use crate::error::{Error, Result};

/// A decoded symbol lookup built from per-length counts and symbol bytes.
pub struct HuffmanDecoder {
    // Keyed by (code_width, code) to the symbol byte.
    codes: std::collections::HashMap<(u8, u16), u8>,
}

impl HuffmanDecoder {
    /// `counts[i]` is the number of codes of bit length `i + 1` (1..=16);
    /// `symbols` lists the symbol for each code in length-then-arrival
    /// order, `counts.iter().sum()` long.
    pub fn new_canonical(counts: &[u8; 16], symbols: &[u8]) -> Result<Self> {
        let mut codes = std::collections::HashMap::new();
        let mut code: u16 = 0;
        let mut k = 0usize;
        for (i, &count) in counts.iter().enumerate() {
            let length = (i + 1) as u8;
            for _ in 0..count {
                let symbol = *symbols
                    .get(k)
                    .ok_or_else(|| Error::protocol("Invalid JPEG Huffman table"))?;
                codes.insert((length, code), symbol);
                code += 1;
                k += 1;
            }
            code <<= 1;
        }
        if k != symbols.len() {
            return Err(Error::protocol("Invalid JPEG Huffman table"));
        }
        Ok(Self { codes })
    }

    /// Look up the symbol for `code` read MSB-first as `width` bits, or
    /// `None` if no code of that width matches yet (keep reading bits).
    pub fn get_symbol(&self, code: u16, width: u8) -> Option<u8> {
        self.codes.get(&(width, code)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_symbol_one_bit_code() {
        let mut counts = [0u8; 16];
        counts[0] = 1; // one code of length 1
        let decoder = HuffmanDecoder::new_canonical(&counts, &[0x05]).unwrap();
        assert_eq!(decoder.get_symbol(0, 1), Some(0x05));
        assert_eq!(decoder.get_symbol(1, 1), None);
    }

    #[test]
    fn two_lengths_assigned_canonically() {
        // Two 2-bit codes then one 1-bit code of the remaining space:
        // classic DC luma-style table shape.
        let mut counts = [0u8; 16];
        counts[1] = 2; // length 2: codes 00, 01
        counts[2] = 1; // length 3: code 100 (0b100), since code<<=1 after len2 block: (2<<1)=4
        let decoder = HuffmanDecoder::new_canonical(&counts, &[0, 1, 2]).unwrap();
        assert_eq!(decoder.get_symbol(0b00, 2), Some(0));
        assert_eq!(decoder.get_symbol(0b01, 2), Some(1));
        assert_eq!(decoder.get_symbol(0b100, 3), Some(2));
    }

    #[test]
    fn truncated_symbol_list_is_an_error() {
        let mut counts = [0u8; 16];
        counts[0] = 2;
        assert!(HuffmanDecoder::new_canonical(&counts, &[1]).is_err());
    }
}
