//! Negotiated media format and byte/duration conversions.

/// PCM media format negotiated on a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MediaFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
    /// Bytes per single-channel sample (2 for 16-bit PCM).
    pub bytes_per_sample: u16,
}

impl MediaFormat {
    /// Creates a format, e.g. `MediaFormat::new(48_000, 2, 2)` for 16-bit
    /// stereo at 48 kHz.
    pub fn new(sample_rate: u32, channels: u16, bytes_per_sample: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bytes_per_sample,
        }
    }

    /// Bytes occupied by one sample across all channels.
    #[inline]
    pub fn frame_bytes(&self) -> usize {
        usize::from(self.channels) * usize::from(self.bytes_per_sample)
    }

    /// Bytes occupied by `samples` per-channel samples.
    #[inline]
    pub fn bytes_for_samples(&self, samples: u32) -> usize {
        samples as usize * self.frame_bytes()
    }

    /// Per-channel samples contained in `bytes` (truncating).
    #[inline]
    pub fn samples_for_bytes(&self, bytes: usize) -> u32 {
        (bytes / self.frame_bytes()) as u32
    }

    /// Duration in µs of `bytes` of interleaved data (truncating).
    pub fn duration_us_for_bytes(&self, bytes: usize) -> i64 {
        let samples = bytes as i64 / self.frame_bytes() as i64;
        samples * 1_000_000 / i64::from(self.sample_rate)
    }

    /// Bytes covering `duration_us` of audio (truncating to whole samples).
    pub fn bytes_for_duration_us(&self, duration_us: i64) -> usize {
        let samples = duration_us * i64::from(self.sample_rate) / 1_000_000;
        self.bytes_for_samples(samples.max(0) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stereo_16bit_48k_conversions() {
        let fmt = MediaFormat::new(48_000, 2, 2);
        assert_eq!(fmt.frame_bytes(), 4);
        assert_eq!(fmt.bytes_for_samples(480), 1920);
        assert_eq!(fmt.samples_for_bytes(1920), 480);
        // 480 samples at 48 kHz is exactly 10 ms.
        assert_eq!(fmt.duration_us_for_bytes(1920), 10_000);
        assert_eq!(fmt.bytes_for_duration_us(10_000), 1920);
    }

    #[test]
    fn mono_8k_round_trip() {
        let fmt = MediaFormat::new(8_000, 1, 2);
        let bytes = fmt.bytes_for_duration_us(20_000);
        assert_eq!(fmt.duration_us_for_bytes(bytes), 20_000);
    }
}
