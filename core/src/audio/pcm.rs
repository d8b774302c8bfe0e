//! PCM mapping: wire-format conversion and channel-layout conversion.
//!
//! The pipeline works on interleaved f32 internally. Packet encoders and
//! decoders map between f32 and the wire formats; the channel mapper converts
//! between layouts (duplication mono→stereo, averaging stereo→mono, truncate
//! or zero-fill for multitrack).

use byteorder::{BigEndian, ByteOrder};

use crate::audio::sample_spec::{ChannelLayout, SampleFormat};
use crate::error::{Error, Result};

/// Encodes interleaved f32 samples into the given wire format, appending to
/// `out`. Integer formats saturate out-of-range samples.
pub fn encode_samples(format: SampleFormat, samples: &[f32], out: &mut Vec<u8>) {
    match format {
        SampleFormat::F32Be => {
            for &s in samples {
                out.extend_from_slice(&s.to_be_bytes());
            }
        }
        SampleFormat::S16Be => {
            for &s in samples {
                let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
        SampleFormat::S32Be => {
            for &s in samples {
                let v = (s.clamp(-1.0, 1.0) as f64 * i32::MAX as f64).round() as i32;
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
    }
}

/// Decodes wire-format bytes into interleaved f32 samples, appending to
/// `out`. Fails with `BadPacket` when the byte count is not sample-aligned.
pub fn decode_samples(format: SampleFormat, bytes: &[u8], out: &mut Vec<f32>) -> Result<()> {
    let size = format.sample_size();
    if bytes.len() % size != 0 {
        return Err(Error::BadPacket);
    }
    match format {
        SampleFormat::F32Be => {
            for chunk in bytes.chunks_exact(4) {
                out.push(f32::from_bits(BigEndian::read_u32(chunk)));
            }
        }
        SampleFormat::S16Be => {
            for chunk in bytes.chunks_exact(2) {
                out.push(BigEndian::read_i16(chunk) as f32 / i16::MAX as f32);
            }
        }
        SampleFormat::S32Be => {
            for chunk in bytes.chunks_exact(4) {
                out.push((BigEndian::read_i32(chunk) as f64 / i32::MAX as f64) as f32);
            }
        }
    }
    Ok(())
}

/// Converts interleaved samples between channel layouts, appending to `out`.
///
/// Mono→stereo duplicates, stereo→mono averages, multitrack conversions copy
/// the overlapping tracks and zero-fill the rest. Identity layouts copy
/// through.
pub fn map_channels(src: ChannelLayout, dst: ChannelLayout, samples: &[f32], out: &mut Vec<f32>) {
    let src_ch = src.num_channels() as usize;
    let dst_ch = dst.num_channels() as usize;
    debug_assert!(src_ch > 0 && samples.len() % src_ch == 0);

    if src_ch == dst_ch {
        out.extend_from_slice(samples);
        return;
    }

    match (src, dst) {
        (ChannelLayout::Mono, ChannelLayout::Stereo) => {
            for &s in samples {
                out.push(s);
                out.push(s);
            }
        }
        (ChannelLayout::Stereo, ChannelLayout::Mono) => {
            for pair in samples.chunks_exact(2) {
                out.push((pair[0] + pair[1]) * 0.5);
            }
        }
        _ => {
            // Generic track mapping: copy overlap, zero-fill the remainder.
            for frame in samples.chunks_exact(src_ch) {
                let n = src_ch.min(dst_ch);
                out.extend_from_slice(&frame[..n]);
                out.extend(std::iter::repeat(0.0).take(dst_ch - n));
            }
        }
    }
}

/// In-place mapper from one layout to another with a reusable scratch
/// buffer.
#[derive(Debug)]
pub struct ChannelMapper {
    src: ChannelLayout,
    dst: ChannelLayout,
    scratch: Vec<f32>,
}

impl ChannelMapper {
    /// Creates a mapper between two layouts.
    pub fn new(src: ChannelLayout, dst: ChannelLayout) -> Self {
        ChannelMapper {
            src,
            dst,
            scratch: Vec::new(),
        }
    }

    /// True when mapping is the identity.
    pub fn is_passthrough(&self) -> bool {
        self.src.num_channels() == self.dst.num_channels()
    }

    /// Maps `samples` (interleaved at the source layout) into the
    /// destination layout, returning a slice valid until the next call.
    pub fn map<'a>(&'a mut self, samples: &'a [f32]) -> &'a [f32] {
        if self.is_passthrough() {
            return samples;
        }
        self.scratch.clear();
        map_channels(self.src, self.dst, samples, &mut self.scratch);
        &self.scratch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s16_round_trip_is_exact() {
        let samples: Vec<f32> = (0..64).map(|i| (i as f32 - 32.0) / 32.0 * 0.9).collect();
        let mut bytes = Vec::new();
        encode_samples(SampleFormat::S16Be, &samples, &mut bytes);
        let mut decoded = Vec::new();
        decode_samples(SampleFormat::S16Be, &bytes, &mut decoded).unwrap();
        let mut bytes2 = Vec::new();
        encode_samples(SampleFormat::S16Be, &decoded, &mut bytes2);
        // Integer encodings round-trip bit-exactly once quantized.
        assert_eq!(bytes, bytes2);
        for (a, b) in samples.iter().zip(&decoded) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_f32_round_trip_bit_exact() {
        let samples = vec![0.0f32, -1.0, 1.0, 0.12345, -0.98765];
        let mut bytes = Vec::new();
        encode_samples(SampleFormat::F32Be, &samples, &mut bytes);
        let mut decoded = Vec::new();
        decode_samples(SampleFormat::F32Be, &bytes, &mut decoded).unwrap();
        assert_eq!(samples, decoded);
    }

    #[test]
    fn test_s16_saturates() {
        let mut bytes = Vec::new();
        encode_samples(SampleFormat::S16Be, &[2.0, -2.0], &mut bytes);
        let mut decoded = Vec::new();
        decode_samples(SampleFormat::S16Be, &bytes, &mut decoded).unwrap();
        assert!((decoded[0] - 1.0).abs() < 1e-4);
        assert!((decoded[1] + 1.0).abs() < 1.1e-4);
    }

    #[test]
    fn test_misaligned_payload_rejected() {
        let mut out = Vec::new();
        assert_eq!(
            decode_samples(SampleFormat::S16Be, &[0u8; 3], &mut out),
            Err(Error::BadPacket)
        );
    }

    #[test]
    fn test_mono_stereo_mono_is_identity() {
        let samples = vec![0.1f32, -0.2, 0.3];
        let mut stereo = Vec::new();
        map_channels(
            ChannelLayout::Mono,
            ChannelLayout::Stereo,
            &samples,
            &mut stereo,
        );
        assert_eq!(stereo, vec![0.1, 0.1, -0.2, -0.2, 0.3, 0.3]);
        let mut mono = Vec::new();
        map_channels(
            ChannelLayout::Stereo,
            ChannelLayout::Mono,
            &stereo,
            &mut mono,
        );
        for (a, b) in samples.iter().zip(&mono) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_multitrack_zero_fill() {
        let mut out = Vec::new();
        map_channels(
            ChannelLayout::Stereo,
            ChannelLayout::Multitrack(4),
            &[0.5, -0.5],
            &mut out,
        );
        assert_eq!(out, vec![0.5, -0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_mapper_passthrough() {
        let mut mapper = ChannelMapper::new(ChannelLayout::Stereo, ChannelLayout::Stereo);
        let samples = [0.1f32, 0.2];
        assert!(mapper.is_passthrough());
        assert_eq!(mapper.map(&samples), &samples);
    }
}
