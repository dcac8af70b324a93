//! Native sample-format conversion.
//!
//! The audio callback always renders interleaved f32. These routines move that
//! scratch buffer into (and capture data out of) the device's native layout.
//! All conversions are little-endian and allocation-free.

use serde::{Deserialize, Serialize};

const I16_SCALE: f32 = 32_767.0;
const I24_SCALE: f32 = 8_388_607.0;

/// Native sample layouts, in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    /// IEEE float, 32-bit.
    F32,
    /// Signed 24-bit PCM packed in 3 bytes.
    I24,
    /// Signed 16-bit PCM.
    I16,
}

impl SampleFormat {
    pub const PREFERENCE: [SampleFormat; 3] = [Self::F32, Self::I24, Self::I16];

    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::I24 => 3,
            Self::I16 => 2,
        }
    }

    pub fn bits_per_sample(self) -> u16 {
        (self.bytes_per_sample() * 8) as u16
    }
}

#[inline]
fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * I16_SCALE) as i16
}

#[inline]
fn to_i24(sample: f32) -> i32 {
    (sample.clamp(-1.0, 1.0) * I24_SCALE) as i32
}

/// Write `src` into `dst` in `format`.
///
/// Converts `min(src.len(), dst.len() / bytes_per_sample)` samples and returns
/// that count. NaN is written as silence.
#[inline]
pub fn encode(src: &[f32], dst: &mut [u8], format: SampleFormat) -> usize {
    let width = format.bytes_per_sample();
    let count = src.len().min(dst.len() / width);

    match format {
        SampleFormat::F32 => {
            for (sample, out) in src.iter().zip(dst.chunks_exact_mut(4)) {
                let value = if sample.is_nan() { 0.0 } else { *sample };
                out.copy_from_slice(&value.to_le_bytes());
            }
        }
        SampleFormat::I16 => {
            for (sample, out) in src.iter().zip(dst.chunks_exact_mut(2)) {
                let value = if sample.is_nan() { 0 } else { to_i16(*sample) };
                out.copy_from_slice(&value.to_le_bytes());
            }
        }
        SampleFormat::I24 => {
            for (sample, out) in src.iter().zip(dst.chunks_exact_mut(3)) {
                let value = if sample.is_nan() { 0 } else { to_i24(*sample) };
                let bytes = value.to_le_bytes();
                out.copy_from_slice(&bytes[..3]);
            }
        }
    }
    count
}

/// Read native samples from `src` into `dst` as f32 in -1..=1.
#[inline]
pub fn decode(src: &[u8], dst: &mut [f32], format: SampleFormat) -> usize {
    let width = format.bytes_per_sample();
    let count = dst.len().min(src.len() / width);

    match format {
        SampleFormat::F32 => {
            for (chunk, out) in src.chunks_exact(4).zip(dst.iter_mut()) {
                *out = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
        }
        SampleFormat::I16 => {
            for (chunk, out) in src.chunks_exact(2).zip(dst.iter_mut()) {
                *out = i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / I16_SCALE;
            }
        }
        SampleFormat::I24 => {
            for (chunk, out) in src.chunks_exact(3).zip(dst.iter_mut()) {
                // Sign-extend through the top byte
                let value = i32::from_le_bytes([0, chunk[0], chunk[1], chunk[2]]) >> 8;
                *out = value as f32 / I24_SCALE;
            }
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_i16_saturates() {
        let src = [2.0f32, -2.0, 0.0, 0.5];
        let mut dst = [0u8; 8];
        assert_eq!(encode(&src, &mut dst, SampleFormat::I16), 4);

        let words: Vec<i16> = dst
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(words, vec![32_767, -32_767, 0, 16_383]);
    }

    #[test]
    fn test_i24_packs_three_bytes_little_endian() {
        let src = [1.0f32, -1.0];
        let mut dst = [0u8; 6];
        encode(&src, &mut dst, SampleFormat::I24);
        assert_eq!(&dst[..3], &[0xFF, 0xFF, 0x7F]);
        assert_eq!(&dst[3..], &[0x01, 0x00, 0x80]);
    }

    #[test]
    fn test_i24_decode_sign_extends() {
        let src = [0x01u8, 0x00, 0x80, 0xFF, 0xFF, 0x7F];
        let mut dst = [0.0f32; 2];
        decode(&src, &mut dst, SampleFormat::I24);
        assert_abs_diff_eq!(dst[0], -1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(dst[1], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_f32_is_bit_exact() {
        let src = [0.123_456_78f32, -0.75, 1.5];
        let mut bytes = [0u8; 12];
        encode(&src, &mut bytes, SampleFormat::F32);
        let mut back = [0.0f32; 3];
        decode(&bytes, &mut back, SampleFormat::F32);
        assert_eq!(back, src);
    }

    #[test]
    fn test_short_destination_is_not_overrun() {
        let src = [0.5f32; 4];
        let mut dst = [0u8; 5];
        assert_eq!(encode(&src, &mut dst, SampleFormat::I16), 2);
        assert_eq!(dst[4], 0);
    }

    #[test]
    fn test_nan_becomes_silence() {
        let src = [f32::NAN];
        let mut dst = [0xAAu8; 2];
        encode(&src, &mut dst, SampleFormat::I16);
        assert_eq!(dst, [0, 0]);
    }
}
