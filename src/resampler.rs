//! Stateful format/rate/channel converter (spec.md §4.2), realized as a
//! thin wrapper over [`rubato::SincFixedIn`] — the pack's only real
//! streaming-resampler usage is
//! `Niche-Knack-Apps-clip-dr/.../audio_clean/neural.rs`, which drives
//! rubato's sinc resampler the same push-some-frames/pull-some-frames way
//! this module does.
//!
//! Internally everything runs on deinterleaved `f32`: input bytes are
//! decoded per [`AudioFormat`] on `push`, converted to the output channel
//! count (mono↔stereo duplication/averaging) *before* the sinc stage so
//! rubato only ever sees a single, fixed channel count, then resampled and
//! re-encoded to the output format's byte layout on `drain`.

use rubato::{
    Resampler as _, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::format::{AudioFormat, SampleEncoding};
use crate::{Error, Result};

/// Outcome of [`Resampler::configure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResamplerOutcome {
    /// `inFmt ≡ outFmt`; caller should skip resampling entirely (spec.md
    /// §8 invariant 3).
    NoOp,
    /// Configured and ready to `push`/`drain`.
    Ready,
    /// The requested conversion is not realizable by this implementation.
    Unsupported,
}

/// Sinc filter quality: long FIR, matching spec.md §4.2 "Quality should be
/// set to the highest available (long FIR filter length)".
fn quality_params() -> SincInterpolationParameters {
    SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        oversampling_factor: 256,
        interpolation: SincInterpolationType::Cubic,
        window: WindowFunction::BlackmanHarris2,
    }
}

/// Fixed chunk size, in frames, rubato consumes per `process` call. Small
/// enough to keep `push`/`drain` latency low (spec.md §4.2 "must not block
/// for longer than a few milliseconds").
const CHUNK_FRAMES: usize = 1024;

/// Stateful resampler: format in, format out, `push`/`drain`/`flush`
/// (spec.md §4.2).
pub struct Resampler {
    in_fmt: Option<AudioFormat>,
    out_fmt: Option<AudioFormat>,
    out_channels: u16,
    engine: Option<SincFixedIn<f32>>,
    /// Deinterleaved pending input, already converted to `out_channels`
    /// but still at `in_fmt.sample_rate`, one `Vec<f32>` per channel.
    pending: Vec<Vec<f32>>,
}

impl Default for Resampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Resampler {
    /// Constructs an unconfigured resampler. Call [`Self::configure`]
    /// before `push`/`drain`.
    pub fn new() -> Self {
        Self {
            in_fmt: None,
            out_fmt: None,
            out_channels: 0,
            engine: None,
            pending: Vec::new(),
        }
    }

    /// Configures (or reconfigures) the resampler for a `in_fmt -> out_fmt`
    /// conversion (spec.md §4.2).
    pub fn configure(&mut self, in_fmt: AudioFormat, out_fmt: AudioFormat) -> ResamplerOutcome {
        if in_fmt.equivalent(&out_fmt) {
            self.in_fmt = None;
            self.out_fmt = None;
            self.engine = None;
            self.pending.clear();
            return ResamplerOutcome::NoOp;
        }

        if !matches!(in_fmt.channels, 1 | 2) || !matches!(out_fmt.channels, 1 | 2) {
            tracing::warn!(
                in_channels = in_fmt.channels,
                out_channels = out_fmt.channels,
                "resampler only supports mono/stereo"
            );
            return ResamplerOutcome::Unsupported;
        }

        let ratio = f64::from(out_fmt.sample_rate) / f64::from(in_fmt.sample_rate);
        let channels = usize::from(out_fmt.channels);
        match SincFixedIn::<f32>::new(ratio, 2.0, quality_params(), CHUNK_FRAMES, channels) {
            Ok(engine) => {
                self.in_fmt = Some(in_fmt);
                self.out_fmt = Some(out_fmt);
                self.out_channels = out_fmt.channels;
                self.engine = Some(engine);
                self.pending = vec![Vec::new(); channels];
                ResamplerOutcome::Ready
            }
            Err(e) => {
                tracing::warn!(error = %e, "rubato rejected the requested conversion ratio");
                ResamplerOutcome::Unsupported
            }
        }
    }

    /// Feeds `in_bytes` (a whole number of `in_fmt.block_align()` frames;
    /// any short trailing remainder is dropped, not buffered, since the
    /// contract requires byte-aligned input) into the internal
    /// accumulator. Does not itself produce output; call [`Self::drain`]
    /// afterwards.
    pub fn push(&mut self, in_bytes: &[u8]) -> Result<()> {
        let Some(in_fmt) = self.in_fmt else {
            return Err(Error::ResamplerInit("push called before configure".into()));
        };
        let block_align = in_fmt.block_align() as usize;
        if block_align == 0 {
            return Ok(());
        }
        let usable_frames = in_bytes.len() / block_align;
        if usable_frames == 0 {
            return Ok(());
        }

        let in_channels = usize::from(in_fmt.channels);
        let out_channels = usize::from(self.out_channels);

        for frame in in_bytes[..usable_frames * block_align].chunks_exact(block_align) {
            let mut samples = [0f32; 2];
            for (ch, chunk) in frame.chunks_exact(block_align / in_channels).enumerate().take(in_channels) {
                samples[ch] = decode_sample(chunk, in_fmt);
            }
            match (in_channels, out_channels) {
                (1, 1) | (2, 2) => {
                    for ch in 0..out_channels {
                        self.pending[ch].push(samples[ch]);
                    }
                }
                (1, 2) => {
                    self.pending[0].push(samples[0]);
                    self.pending[1].push(samples[0]);
                }
                (2, 1) => {
                    self.pending[0].push(0.5 * (samples[0] + samples[1]));
                }
                _ => unreachable!("configure rejects channel counts outside mono/stereo"),
            }
        }
        Ok(())
    }

    /// Pulls all currently available output bytes into `out_sink`
    /// (appended). Must be called after every `push` until the engine
    /// needs more input (spec.md §4.2).
    pub fn drain(&mut self, out_sink: &mut Vec<u8>) -> Result<()> {
        let (Some(out_fmt), Some(engine)) = (self.out_fmt, self.engine.as_mut()) else {
            return Err(Error::ResamplerInit("drain called before configure".into()));
        };

        while self.pending[0].len() >= engine.input_frames_next() {
            let needed = engine.input_frames_next();
            let chunks: Vec<&[f32]> = self.pending.iter().map(|ch| &ch[..needed]).collect();
            let output = engine
                .process(&chunks, None)
                .map_err(|e| Error::InitFailed(format!("resample failed: {e}")))?;
            encode_planar(&output, out_fmt, out_sink);
            for ch in &mut self.pending {
                ch.drain(..needed);
            }
        }
        Ok(())
    }

    /// Signals end-of-stream and drains residual samples shorter than a
    /// full chunk, zero-padding internally (spec.md §4.2 "Used on Router
    /// shutdown only").
    pub fn flush(&mut self, out_sink: &mut Vec<u8>) -> Result<()> {
        self.drain(out_sink)?;

        let (Some(out_fmt), Some(engine)) = (self.out_fmt, self.engine.as_mut()) else {
            return Ok(());
        };
        if self.pending[0].is_empty() {
            return Ok(());
        }

        let chunks: Vec<&[f32]> = self.pending.iter().map(Vec::as_slice).collect();
        let output = engine
            .process_partial(Some(&chunks), None)
            .map_err(|e| Error::InitFailed(format!("resample flush failed: {e}")))?;
        encode_planar(&output, out_fmt, out_sink);
        for ch in &mut self.pending {
            ch.clear();
        }
        Ok(())
    }
}

/// Decodes one sample's worth of bytes (container width given by
/// `fmt.container_bits`) into `[-1.0, 1.0]`-normalized `f32`.
fn decode_sample(bytes: &[u8], fmt: AudioFormat) -> f32 {
    match (fmt.encoding, fmt.container_bits) {
        (SampleEncoding::Float, 32) => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        (SampleEncoding::Int, 16) => i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / f32::from(i16::MAX),
        (SampleEncoding::Int, 32) => {
            let raw = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            // 24-in-32: valid_bits is checked by the caller's format
            // negotiation; here we always treat the container as the full
            // 32-bit range, matching the original's sign-extended sample path.
            raw as f32 / i32::MAX as f32
        }
        _ => 0.0,
    }
}

/// Encodes one sample from normalized `f32` into `fmt`'s byte layout,
/// appending to `out`.
fn encode_sample(value: f32, fmt: AudioFormat, out: &mut Vec<u8>) {
    match (fmt.encoding, fmt.container_bits) {
        (SampleEncoding::Float, 32) => out.extend_from_slice(&value.to_le_bytes()),
        (SampleEncoding::Int, 16) => {
            let clamped = value.clamp(-1.0, 1.0);
            let sample = (clamped * f32::from(i16::MAX)) as i16;
            out.extend_from_slice(&sample.to_le_bytes());
        }
        (SampleEncoding::Int, 32) => {
            let clamped = value.clamp(-1.0, 1.0);
            let sample = (clamped * i32::MAX as f32) as i32;
            out.extend_from_slice(&sample.to_le_bytes());
        }
        _ => out.extend_from_slice(&[0u8; 4]),
    }
}

/// Re-interleaves rubato's planar (one `Vec<f32>` per channel) output and
/// encodes it into `fmt`'s byte layout.
fn encode_planar(planar: &[Vec<f32>], fmt: AudioFormat, out: &mut Vec<u8>) {
    if planar.is_empty() {
        return;
    }
    let frames = planar[0].len();
    for frame in 0..frames {
        for channel in planar {
            encode_sample(channel[frame], fmt, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleEncoding;

    fn stereo_f32(rate: u32) -> AudioFormat {
        AudioFormat::new(rate, 2, 32, 32, SampleEncoding::Float)
    }

    #[test]
    fn equivalent_formats_configure_as_noop() {
        let mut r = Resampler::new();
        let fmt = stereo_f32(48_000);
        assert_eq!(r.configure(fmt, fmt), ResamplerOutcome::NoOp);
    }

    #[test]
    fn rate_mismatch_configures_ready() {
        let mut r = Resampler::new();
        let outcome = r.configure(stereo_f32(44_100), stereo_f32(48_000));
        assert_eq!(outcome, ResamplerOutcome::Ready);
    }

    #[test]
    fn surround_channel_counts_are_unsupported() {
        let mut r = Resampler::new();
        let surround = AudioFormat::new(48_000, 6, 32, 32, SampleEncoding::Float);
        assert_eq!(r.configure(stereo_f32(48_000), surround), ResamplerOutcome::Unsupported);
    }

    #[test]
    fn push_then_drain_produces_output_close_to_expected_ratio() {
        let mut r = Resampler::new();
        let in_fmt = stereo_f32(44_100);
        let out_fmt = stereo_f32(48_000);
        assert_eq!(r.configure(in_fmt, out_fmt), ResamplerOutcome::Ready);

        // One second of a 440Hz tone, interleaved stereo f32.
        let frames = 44_100usize;
        let mut bytes = Vec::with_capacity(frames * in_fmt.block_align() as usize);
        for i in 0..frames {
            let s = (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 44_100.0).sin();
            bytes.extend_from_slice(&s.to_le_bytes());
            bytes.extend_from_slice(&s.to_le_bytes());
        }

        r.push(&bytes).unwrap();
        let mut out = Vec::new();
        r.drain(&mut out).unwrap();
        r.flush(&mut out).unwrap();

        let out_frames = out.len() / out_fmt.block_align() as usize;
        let expected = 48_000usize;
        let tolerance = expected / 20; // 5%
        assert!(
            out_frames.abs_diff(expected) <= tolerance,
            "out_frames={out_frames} expected~={expected}"
        );
    }
}
