//! # Audio Handling
//!
//! Raw call audio arrives as base64 PCM inside `media` events and is relayed
//! to the recognizer unchanged, only re-framed.
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 8 kHz
//! - **Bit Depth**: 16-bit signed PCM, little-endian
//! - **Channels**: Mono
//!
//! ## Key Components:
//! - **format**: describes the PCM format and derives byte sizes from it
//! - **buffer**: accumulates chunks into fixed 100 ms frames

pub mod buffer;
pub mod format;

pub use buffer::AudioAccumulator;
pub use format::AudioFormat;
