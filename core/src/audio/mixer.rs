//! Mixer: sums per-session frames into the receiver output.

use crate::audio::frame::Frame;
use crate::time::Nanos;

/// Add-mixer over f32 frames.
///
/// Flags of the inputs are OR-ed into the output. The output capture
/// timestamp is the earliest one among contributing non-blank frames, 0 when
/// no input knows its capture time. Samples are summed without clamping;
/// saturation is applied by the PCM mapper when leaving the float domain.
#[derive(Debug)]
pub struct Mixer {
    num_channels: u16,
}

impl Mixer {
    /// Creates a mixer for frames of `num_channels` interleaved channels.
    pub fn new(num_channels: u16) -> Self {
        Mixer { num_channels }
    }

    /// Mixes `inputs` into one frame of `len` per-channel samples.
    ///
    /// Every input must already be at the output rate and channel layout;
    /// feeding a frame of a different shape is a programmer error.
    pub fn mix(&self, inputs: &[Frame], len: usize) -> Frame {
        let mut out = Frame::silence(len, self.num_channels);
        let mut flags = 0u8;
        let mut capture_ts: Option<Nanos> = None;

        for input in inputs {
            assert_eq!(
                input.num_channels, self.num_channels,
                "mixer: input channel layout mismatch"
            );
            assert_eq!(input.len(), len, "mixer: input length mismatch");

            for (acc, &s) in out.samples.iter_mut().zip(&input.samples) {
                *acc += s;
            }
            flags |= input.flags();

            if input.has_flags(Frame::NOT_BLANK) && input.capture_timestamp != 0 {
                capture_ts = Some(match capture_ts {
                    Some(ct) => ct.min(input.capture_timestamp),
                    None => input.capture_timestamp,
                });
            }
        }

        out.set_flags(flags);
        out.capture_timestamp = capture_ts.unwrap_or(0);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(value: f32, ct: Nanos, flags: u8) -> Frame {
        let mut f = Frame::silence(8, 2);
        f.samples.fill(value);
        f.capture_timestamp = ct;
        f.set_flags(flags);
        f
    }

    #[test]
    fn test_sums_samples() {
        let mixer = Mixer::new(2);
        let out = mixer.mix(
            &[
                frame(0.25, 0, Frame::NOT_BLANK),
                frame(0.5, 0, Frame::NOT_BLANK),
            ],
            8,
        );
        assert!(out.samples.iter().all(|&s| (s - 0.75).abs() < 1e-6));
    }

    #[test]
    fn test_no_inputs_is_silence() {
        let mixer = Mixer::new(2);
        let out = mixer.mix(&[], 8);
        assert!(out.samples.iter().all(|&s| s == 0.0));
        assert_eq!(out.flags(), 0);
        assert_eq!(out.capture_timestamp, 0);
    }

    #[test]
    fn test_flags_are_ored() {
        let mixer = Mixer::new(2);
        let out = mixer.mix(
            &[
                frame(0.0, 0, Frame::NOT_COMPLETE),
                frame(0.1, 0, Frame::NOT_BLANK | Frame::PACKET_DROPS),
            ],
            8,
        );
        assert_eq!(
            out.flags(),
            Frame::NOT_BLANK | Frame::NOT_COMPLETE | Frame::PACKET_DROPS
        );
    }

    #[test]
    fn test_capture_ts_is_earliest_active() {
        let mixer = Mixer::new(2);
        let out = mixer.mix(
            &[
                frame(0.1, 2_000, Frame::NOT_BLANK),
                frame(0.1, 1_000, Frame::NOT_BLANK),
                // Blank frames never contribute their timestamp.
                frame(0.0, 5, 0),
            ],
            8,
        );
        assert_eq!(out.capture_timestamp, 1_000);
    }
}
