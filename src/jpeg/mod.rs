//! Baseline JPEG decoding (C8, `spec.md` §4.8).
//!
//! Grounded in `examples/original_source/src/jpeg/ut-jpeg-decoder.c`: a
//! marker-driven state machine ([`decoder`]) built on a canonical Huffman
//! table reconstruction ([`huffman`]), a zig-zag/inverse-DCT pair
//! ([`idct`]), and a plain decoded-raster type ([`image`]).

pub mod decoder;
pub mod huffman;
pub mod idct;
pub mod image;

pub use decoder::JpegDecoder;
pub use image::Image;
