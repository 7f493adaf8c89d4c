//! PCM stream description.

/// WASAPI-style channel bitmask (`SPEAKER_FRONT_LEFT`, etc). Opaque to this
/// crate beyond equality and the mono/stereo constructors below — routing
/// never interprets individual bits.
const SPEAKER_FRONT_LEFT: u32 = 0x1;
const SPEAKER_FRONT_RIGHT: u32 = 0x2;
const SPEAKER_FRONT_CENTER: u32 = 0x4;

/// Sample encoding: signed integer PCM or IEEE float.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleEncoding {
    /// Signed integer PCM, left-justified within the container.
    Int,
    /// IEEE 754 float, always 32-bit container in practice.
    Float,
}

/// Describes a PCM stream. Two formats are *equivalent* iff every field
/// matches byte-exact; equivalence determines whether the resampler is
/// engaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count.
    pub channels: u16,
    /// Container width in bits (e.g. 32 for 24-bit-in-32 packing).
    pub container_bits: u16,
    /// Valid bits per sample (may be less than `container_bits`, e.g. 24-in-32).
    pub valid_bits: u16,
    /// Sample encoding.
    pub encoding: SampleEncoding,
    /// Channel layout bitmask.
    pub channel_mask: u32,
}

impl AudioFormat {
    /// Constructs a format with a channel mask inferred from `channels`
    /// (mono → front-center, stereo → front-left|front-right).
    pub fn new(
        sample_rate: u32,
        channels: u16,
        container_bits: u16,
        valid_bits: u16,
        encoding: SampleEncoding,
    ) -> Self {
        let channel_mask = default_channel_mask(channels);
        Self {
            sample_rate,
            channels,
            container_bits,
            valid_bits,
            encoding,
            channel_mask,
        }
    }

    /// Block alignment: bytes consumed by one frame (one sample per channel).
    pub fn block_align(&self) -> u32 {
        u32::from(self.channels) * u32::from(self.container_bits) / 8
    }

    /// Bytes per second at this format's nominal rate.
    pub fn avg_bytes_per_sec(&self) -> u32 {
        self.sample_rate * self.block_align()
    }

    /// Whether `self` and `other` are byte-exact equivalent. Equivalent
    /// formats bypass the resampler.
    pub fn equivalent(&self, other: &AudioFormat) -> bool {
        self == other
    }
}

fn default_channel_mask(channels: u16) -> u32 {
    match channels {
        1 => SPEAKER_FRONT_CENTER,
        2 => SPEAKER_FRONT_LEFT | SPEAKER_FRONT_RIGHT,
        _ => 0,
    }
}

/// The exclusive-mode negotiation priority list: stereo variants precede
/// mono, float 48 kHz is tried first. Each tuple is
/// `(channels, sample_rate, valid_bits, encoding)`; the container width is
/// 32 bits whenever `valid_bits` is 24 or 32, otherwise equal to `valid_bits`.
pub const EXCLUSIVE_FORMAT_PRIORITY: &[(u16, u32, u16, SampleEncoding)] = &[
    (2, 48_000, 32, SampleEncoding::Float),
    (2, 48_000, 24, SampleEncoding::Int),
    (2, 48_000, 16, SampleEncoding::Int),
    (2, 44_100, 32, SampleEncoding::Float),
    (2, 44_100, 24, SampleEncoding::Int),
    (2, 44_100, 16, SampleEncoding::Int),
    (1, 48_000, 16, SampleEncoding::Int),
    (1, 44_100, 16, SampleEncoding::Int),
];

/// Builds the `AudioFormat` for one priority-list candidate.
pub fn candidate_format(channels: u16, sample_rate: u32, valid_bits: u16, encoding: SampleEncoding) -> AudioFormat {
    let container_bits = if valid_bits == 24 { 32 } else { valid_bits };
    AudioFormat::new(sample_rate, channels, container_bits, valid_bits, encoding)
}

/// Promotes a plain (non-extensible) mix format report into the full
/// representation this crate uses everywhere, inferring channel mask from
/// channel count and encoding from container width. Mirrors the
/// `WAVEFORMATEX` to `WAVEFORMATEXTENSIBLE` promotion WASAPI performs
/// internally for shared-mode streams.
pub fn from_plain_shared(sample_rate: u32, channels: u16, container_bits: u16) -> AudioFormat {
    let encoding = if container_bits == 32 {
        SampleEncoding::Float
    } else {
        SampleEncoding::Int
    };
    AudioFormat::new(sample_rate, channels, container_bits, container_bits, encoding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_align_stereo_f32() {
        let fmt = AudioFormat::new(48_000, 2, 32, 32, SampleEncoding::Float);
        assert_eq!(fmt.block_align(), 8);
    }

    #[test]
    fn block_align_24_in_32() {
        let fmt = candidate_format(2, 48_000, 24, SampleEncoding::Int);
        assert_eq!(fmt.container_bits, 32);
        assert_eq!(fmt.block_align(), 8);
    }

    #[test]
    fn equivalence_requires_every_field() {
        let a = AudioFormat::new(48_000, 2, 32, 32, SampleEncoding::Float);
        let b = AudioFormat::new(48_000, 2, 32, 32, SampleEncoding::Float);
        assert!(a.equivalent(&b));

        let c = AudioFormat::new(48_000, 2, 32, 24, SampleEncoding::Float);
        assert!(!a.equivalent(&c));
    }

    #[test]
    fn default_channel_mask_mono_stereo() {
        assert_eq!(default_channel_mask(1), SPEAKER_FRONT_CENTER);
        assert_eq!(default_channel_mask(2), SPEAKER_FRONT_LEFT | SPEAKER_FRONT_RIGHT);
    }

    #[test]
    fn priority_list_stereo_before_mono_and_float_first() {
        let (ch0, _, _, enc0) = EXCLUSIVE_FORMAT_PRIORITY[0];
        assert_eq!(ch0, 2);
        assert_eq!(enc0, SampleEncoding::Float);
        let last_stereo = EXCLUSIVE_FORMAT_PRIORITY
            .iter()
            .rposition(|(ch, ..)| *ch == 2)
            .unwrap();
        let first_mono = EXCLUSIVE_FORMAT_PRIORITY
            .iter()
            .position(|(ch, ..)| *ch == 1)
            .unwrap();
        assert!(last_stereo < first_mono);
    }
}
