//! # PCM Format Description
//!
//! The bridge never transcodes: clients send raw signed 16-bit little-endian
//! PCM and the recognizer receives exactly the same bytes. This module only
//! describes the format and derives byte-level sizes from it.

use crate::config::AudioSettings;
use serde::{Deserialize, Serialize};

/// Fixed PCM framing parameters shared by the client and recognizer sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Recognizer encoding name (`linear16`)
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            encoding: "linear16".to_string(),
            sample_rate: 8000,
            channels: 1,
            bit_depth: 16,
        }
    }
}

impl From<&AudioSettings> for AudioFormat {
    fn from(settings: &AudioSettings) -> Self {
        Self {
            encoding: settings.encoding.clone(),
            sample_rate: settings.sample_rate,
            channels: settings.channels,
            bit_depth: settings.bit_depth,
        }
    }
}

impl AudioFormat {
    /// Bytes per second of audio: sample_rate × channels × bytes per sample.
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * (self.bit_depth as usize / 8)
    }

    /// Byte count equal to `duration_ms` of audio, rounded down to a whole
    /// sample frame so a flushed frame never splits a sample.
    ///
    /// ## Example:
    /// 100 ms at 8 kHz / 16-bit / mono = 8000 × 1 × 2 × 0.1 = 1600 bytes
    pub fn bytes_for_duration(&self, duration_ms: u32) -> usize {
        let frame_size = self.channels as usize * (self.bit_depth as usize / 8);
        let raw = self.bytes_per_second() * duration_ms as usize / 1000;
        if frame_size == 0 {
            return raw;
        }
        raw - raw % frame_size
    }

    /// Duration in milliseconds represented by `bytes` of audio.
    pub fn duration_ms(&self, bytes: usize) -> u64 {
        match self.bytes_per_second() {
            0 => 0,
            bps => (bytes as u64 * 1000) / bps as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telephony_flush_threshold() {
        let format = AudioFormat::default();
        assert_eq!(format.bytes_per_second(), 16_000);
        assert_eq!(format.bytes_for_duration(100), 1600);
        assert_eq!(format.duration_ms(1600), 100);
    }

    #[test]
    fn test_threshold_is_sample_aligned() {
        let format = AudioFormat {
            sample_rate: 11025,
            channels: 2,
            ..AudioFormat::default()
        };
        // 11025 * 2 * 2 * 0.1 = 4410 bytes -> aligned down to 4408
        assert_eq!(format.bytes_for_duration(100), 4408);
        // 11025 * 2 * 2 * 0.033 = 1455.3 -> 1455 -> aligned down to 1452
        assert_eq!(format.bytes_for_duration(33), 1452);
    }
}
