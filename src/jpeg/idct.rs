//! Zig-zag coefficient ordering and the separable inverse DCT (C8,
//! `spec.md` §4.8 "IDCT and placement").
//!
//! `examples/original_source/src/jpeg/ut-jpeg-decoder.c` calls
//! `jpeg_build_data_unit_order`, `jpeg_build_dct_values` and
//! `jpeg_inverse_dct` but their bodies live outside the retrieved source
//! (they're declared in a sibling translation unit the retrieval pack
//! doesn't include). Reconstructed here straight from ITU-T T.81 Annex A
//! (zig-zag permutation, Figure A.6) and Annex A.3.3 (the reference IDCT
//! formula), using the field names (`dct_alpha`, `dct_cos`,
//! `data_unit_order`) the decoder struct already uses for them.

/// The 8x8 zig-zag scan order: `order[k]` is the natural (row-major) index
/// that the `k`-th coefficient read off the wire lands at.
pub fn build_zigzag_order() -> [u8; 64] {
    let mut order = [0u8; 64];
    let mut natural = 0usize;
    let mut row = 0i32;
    let mut col = 0i32;
    let mut going_up = true;
    while natural < 64 {
        order[natural] = (row * 8 + col) as u8;
        natural += 1;
        if going_up {
            if col == 7 {
                row += 1;
                going_up = false;
            } else if row == 0 {
                col += 1;
                going_up = false;
            } else {
                row -= 1;
                col += 1;
            }
        } else if row == 7 {
            col += 1;
            going_up = true;
        } else if col == 0 {
            row += 1;
            going_up = true;
        } else {
            row += 1;
            col -= 1;
        }
    }
    order
}

/// Precomputed constants for the 2-D inverse DCT: `alpha[k] = 1/sqrt(2)`
/// for `k == 0`, else `1`; `cos[n * 8 + k] = cos((2n+1) k pi / 16)`.
pub struct Idct {
    alpha: [f32; 8],
    cos: [f32; 64],
}

impl Idct {
    pub fn new() -> Self {
        let mut alpha = [1.0f32; 8];
        alpha[0] = std::f32::consts::FRAC_1_SQRT_2;

        let mut cos = [0.0f32; 64];
        for n in 0..8usize {
            for k in 0..8usize {
                let angle = ((2 * n + 1) as f32) * (k as f32) * std::f32::consts::PI / 16.0;
                cos[n * 8 + k] = angle.cos();
            }
        }

        Self { alpha, cos }
    }

    /// Inverse DCT of a data unit stored in natural (row-major) order, each
    /// coefficient already dequantized. Output is centered on zero, as in
    /// the source (`+128` and clamping to `[0, 255]` happen at placement
    /// time, not here).
    pub fn inverse(&self, coefficients: &[i16; 64]) -> [i16; 64] {
        let mut output = [0i16; 64];
        for y in 0..8usize {
            for x in 0..8usize {
                let mut sum = 0.0f32;
                for v in 0..8usize {
                    for u in 0..8usize {
                        let f = coefficients[v * 8 + u] as f32;
                        sum += self.alpha[u] * self.alpha[v] * f * self.cos[x * 8 + u] * self.cos[y * 8 + v];
                    }
                }
                output[y * 8 + x] = (sum / 4.0).round() as i16;
            }
        }
        output
    }
}

impl Default for Idct {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zigzag_order_starts_and_covers_all_positions() {
        let order = build_zigzag_order();
        assert_eq!(order[0], 0);
        assert_eq!(order[1], 1); // (0,1)
        assert_eq!(order[2], 8); // (1,0)
        let mut seen = [false; 64];
        for &pos in &order {
            assert!(!seen[pos as usize], "position {pos} hit twice");
            seen[pos as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn dc_only_block_is_flat() {
        let idct = Idct::new();
        let mut coefficients = [0i16; 64];
        coefficients[0] = 8; // DC-only: every output sample equals DC/8
        let out = idct.inverse(&coefficients);
        for &sample in &out {
            assert!((sample - 1).abs() <= 1, "expected ~1, got {sample}");
        }
    }

    #[test]
    fn zero_block_is_zero() {
        let idct = Idct::new();
        let out = idct.inverse(&[0i16; 64]);
        assert!(out.iter().all(|&s| s == 0));
    }
}
