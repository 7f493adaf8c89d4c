//! Format negotiation shared by [`crate::capture::CaptureEndpoint`] and
//! [`crate::render::RenderEndpoint`] (spec.md §4.3/§4.4).
//!
//! Shared mode always takes the device's mix format. Exclusive mode walks
//! the fixed priority list (spec.md §4.3), trying an optional preferred
//! format first (render's "maximize resampler-bypass chance" hint), and
//! retries once per candidate on a buffer-size-misalignment error with the
//! device's own required frame count (spec.md Open Question (a): only one
//! retry, matching the original).

use std::time::Duration;

use crate::backend::{AudioEndpointBackend, InitParams, ShareMode};
use crate::format::{candidate_format, AudioFormat, EXCLUSIVE_FORMAT_PRIORITY};
use crate::{Error, Result};

/// Result of a successful negotiation: the format the device accepted and
/// its period, in frames.
pub struct Negotiated {
    /// The format the backend was initialized with.
    pub format: AudioFormat,
    /// Device period, in frames, as reported after initialization.
    pub buffer_frames: u32,
}

/// Shared-mode negotiation: query the mix format, promote it if the
/// backend reported a plain (non-extensible) form, and initialize.
pub fn negotiate_shared(backend: &mut dyn AudioEndpointBackend) -> Result<Negotiated> {
    // `mix_format` returns the already-promoted extensible `AudioFormat`;
    // backends that only learn a plain (non-extensible) form from the OS
    // are expected to promote it themselves (via `from_plain_shared` or by
    // reading the extensible fields directly, as `wasapi_backend` does)
    // before returning, mirroring `initShared`'s `WAVEFORMATEX` ->
    // `WAVEFORMATEXTENSIBLE` promotion in the original implementation.
    let format = backend.mix_format()?;

    let params = InitParams {
        share_mode: ShareMode::Shared,
        event_driven: true,
        requested_period_frames: 0,
        format,
    };
    backend.initialize(&params)?;
    Ok(Negotiated {
        format,
        buffer_frames: backend.device_period_frames(),
    })
}

/// Exclusive-mode negotiation: try `preferred` (if given) then the fixed
/// priority list (spec.md §4.3), stopping at the first candidate the
/// device accepts. Each candidate gets exactly one
/// buffer-size-not-aligned retry.
pub fn negotiate_exclusive(
    backend: &mut dyn AudioEndpointBackend,
    preferred: Option<AudioFormat>,
) -> Result<Negotiated> {
    let mut candidates: Vec<AudioFormat> = Vec::with_capacity(EXCLUSIVE_FORMAT_PRIORITY.len() + 1);
    if let Some(p) = preferred {
        candidates.push(p);
    }
    candidates.extend(
        EXCLUSIVE_FORMAT_PRIORITY
            .iter()
            .map(|&(ch, sr, vb, enc)| candidate_format(ch, sr, vb, enc)),
    );

    for format in candidates {
        if !backend.probe_format(&format)? {
            continue;
        }

        let period = backend.device_period_frames().max(1);
        let params = InitParams {
            share_mode: ShareMode::Exclusive,
            event_driven: true,
            requested_period_frames: period,
            format,
        };

        match backend.initialize(&params) {
            Ok(()) => {
                return Ok(Negotiated {
                    format,
                    buffer_frames: backend.device_period_frames(),
                });
            }
            Err(Error::BufferSizeNotAligned { required_frames }) => {
                tracing::debug!(
                    ?format,
                    required_frames,
                    "buffer size not aligned, retrying with device-reported period"
                );
                let retry = InitParams {
                    requested_period_frames: required_frames,
                    ..params
                };
                if backend.initialize(&retry).is_ok() {
                    return Ok(Negotiated {
                        format,
                        buffer_frames: backend.device_period_frames(),
                    });
                }
                tracing::debug!(?format, "retry after alignment also failed, trying next candidate");
            }
            Err(e) => {
                tracing::debug!(?format, error = %e, "candidate rejected");
            }
        }
    }

    Err(Error::UnsupportedFormat)
}

/// Converts an aligned frame count into the hundred-nanosecond duration
/// WASAPI's `Initialize` expects, rounding up (spec.md §4.3: `⌈10⁷ ·
/// alignedFrames / sampleRate⌉`).
pub fn aligned_duration_hns(aligned_frames: u32, sample_rate: u32) -> u64 {
    let numerator = 10_000_000u64 * u64::from(aligned_frames);
    numerator.div_ceil(u64::from(sample_rate.max(1)))
}

/// Spin-poll interval used by the pre-buffering gate and the pump's idle
/// wait (spec.md §4.6 step 8, §4.5 step 2).
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleEncoding;

    #[test]
    fn aligned_duration_rounds_up() {
        // 192 frames @ 48kHz = exactly 4ms = 40000 hns.
        assert_eq!(aligned_duration_hns(192, 48_000), 40_000);
        // A rate that doesn't divide evenly must round up, not truncate.
        assert_eq!(aligned_duration_hns(1, 3), 3_333_334);
    }

    #[test]
    fn priority_list_candidate_matches_spec_table() {
        let fmt = candidate_format(2, 48_000, 32, SampleEncoding::Float);
        assert_eq!(fmt.sample_rate, 48_000);
        assert_eq!(fmt.channels, 2);
    }
}
