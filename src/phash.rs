//! Perceptual hashing for card imagery.
//!
//! Fixed, deterministic pipeline: resize to 32x32 (fill), grayscale, 2-D
//! DCT-II, take the top-left 8x8 block minus the DC coefficient (63
//! coefficients), threshold each against their median, pack row-major into
//! 64 bits rendered as 16 hex characters. Same bytes always produce the
//! same hash.

use image::imageops::FilterType;
use thiserror::Error;

const DCT_SIZE: usize = 32;
const BLOCK: usize = 8;

#[derive(Debug, Error)]
pub enum PhashError {
    #[error("image decode failed: {0}")]
    Decode(String),
    #[error("hash length mismatch: {a} vs {b}")]
    LengthMismatch { a: usize, b: usize },
    #[error("invalid hash digit: {0}")]
    InvalidDigit(char),
}

/// A 64-bit perceptual hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PHash(pub u64);

impl PHash {
    pub fn to_hex(self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn hamming_distance(self, other: PHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }
}

impl std::fmt::Display for PHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Computes the perceptual hash of an encoded image.
pub fn hash_image(bytes: &[u8]) -> Result<PHash, PhashError> {
    let img = image::load_from_memory(bytes).map_err(|e| PhashError::Decode(e.to_string()))?;
    let gray = img
        .resize_exact(DCT_SIZE as u32, DCT_SIZE as u32, FilterType::Triangle)
        .to_luma8();

    let mut pixels = [[0f64; DCT_SIZE]; DCT_SIZE];
    for (x, y, p) in gray.enumerate_pixels() {
        pixels[y as usize][x as usize] = p.0[0] as f64;
    }

    let dct = dct_2d_top_block(&pixels);

    // Row-major (u, v) coefficients of the 8x8 block, DC excluded.
    let mut coeffs = [0f64; BLOCK * BLOCK - 1];
    let mut i = 0;
    for u in 0..BLOCK {
        for v in 0..BLOCK {
            if u == 0 && v == 0 {
                continue;
            }
            coeffs[i] = dct[u][v];
            i += 1;
        }
    }

    let mut sorted = coeffs;
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = sorted[sorted.len() / 2];

    let mut bits: u64 = 0;
    for c in coeffs {
        bits = (bits << 1) | u64::from(c > median);
    }
    Ok(PHash(bits))
}

/// Orthonormal 2-D DCT-II restricted to the top-left 8x8 output block.
/// alpha(0) = 1/sqrt(2), alpha(k) = 1 for k > 0.
fn dct_2d_top_block(pixels: &[[f64; DCT_SIZE]; DCT_SIZE]) -> [[f64; BLOCK]; BLOCK] {
    let n = DCT_SIZE as f64;
    let mut cos_table = [[0f64; DCT_SIZE]; BLOCK];
    for (k, row) in cos_table.iter_mut().enumerate() {
        for (i, c) in row.iter_mut().enumerate() {
            *c = (((2 * i + 1) as f64) * (k as f64) * std::f64::consts::PI / (2.0 * n)).cos();
        }
    }

    // Separable transform: rows first, then columns.
    let mut rows = [[0f64; BLOCK]; DCT_SIZE];
    for (i, px_row) in pixels.iter().enumerate() {
        for v in 0..BLOCK {
            let mut sum = 0.0;
            for (j, px) in px_row.iter().enumerate() {
                sum += px * cos_table[v][j];
            }
            rows[i][v] = sum;
        }
    }

    let mut out = [[0f64; BLOCK]; BLOCK];
    for u in 0..BLOCK {
        for v in 0..BLOCK {
            let mut sum = 0.0;
            for (i, row) in rows.iter().enumerate() {
                sum += row[v] * cos_table[u][i];
            }
            let alpha_u = if u == 0 { std::f64::consts::FRAC_1_SQRT_2 } else { 1.0 };
            let alpha_v = if v == 0 { std::f64::consts::FRAC_1_SQRT_2 } else { 1.0 };
            out[u][v] = alpha_u * alpha_v * sum;
        }
    }
    out
}

/// Hamming distance between two hex-rendered hashes of equal length.
pub fn hamming_distance(a: &str, b: &str) -> Result<u32, PhashError> {
    if a.len() != b.len() {
        return Err(PhashError::LengthMismatch { a: a.len(), b: b.len() });
    }
    let mut distance = 0;
    for (ca, cb) in a.chars().zip(b.chars()) {
        let na = ca.to_digit(16).ok_or(PhashError::InvalidDigit(ca))?;
        let nb = cb.to_digit(16).ok_or(PhashError::InvalidDigit(cb))?;
        distance += (na ^ nb).count_ones();
    }
    Ok(distance)
}

/// Maps a Hamming distance onto a [0,1] similarity score.
pub fn similarity(distance: u32, max_distance: u32) -> f64 {
    if max_distance == 0 {
        return 0.0;
    }
    (1.0 - distance as f64 / max_distance as f64).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageOutputFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn encode_png(img: &RgbImage) -> Vec<u8> {
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img.clone())
            .write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)
            .unwrap();
        buf
    }

    fn gradient_image() -> Vec<u8> {
        let img = RgbImage::from_fn(64, 64, |x, y| {
            Rgb([(x * 4) as u8, (y * 4) as u8, ((x + y) * 2) as u8])
        });
        encode_png(&img)
    }

    fn checker_image() -> Vec<u8> {
        let img = RgbImage::from_fn(64, 64, |x, y| {
            if (x / 8 + y / 8) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        });
        encode_png(&img)
    }

    #[test]
    fn same_bytes_same_hash() {
        let bytes = gradient_image();
        let a = hash_image(&bytes).unwrap();
        let b = hash_image(&bytes).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_hex(), b.to_hex());
        assert_eq!(a.to_hex().len(), 16);
    }

    #[test]
    fn distinct_content_distinct_hash() {
        let a = hash_image(&gradient_image()).unwrap();
        let b = hash_image(&checker_image()).unwrap();
        assert_ne!(a, b);
        assert!(a.hamming_distance(b) > 0);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(matches!(
            hash_image(b"definitely not an image"),
            Err(PhashError::Decode(_))
        ));
    }

    #[test]
    fn hamming_symmetry_and_identity() {
        let a = hash_image(&gradient_image()).unwrap().to_hex();
        let b = hash_image(&checker_image()).unwrap().to_hex();
        assert_eq!(
            hamming_distance(&a, &b).unwrap(),
            hamming_distance(&b, &a).unwrap()
        );
        assert_eq!(hamming_distance(&a, &a).unwrap(), 0);
    }

    #[test]
    fn hamming_length_mismatch() {
        assert!(matches!(
            hamming_distance("abcd", "abc"),
            Err(PhashError::LengthMismatch { a: 4, b: 3 })
        ));
    }

    #[test]
    fn similarity_bounds() {
        assert_eq!(similarity(0, 64), 1.0);
        assert_eq!(similarity(64, 64), 0.0);
        assert_eq!(similarity(96, 64), 0.0);
        let mid = similarity(32, 64);
        assert!(mid > 0.0 && mid < 1.0);
    }
}
