//! Text-to-speech clients

mod sarvam;

pub use sarvam::{SarvamTts, SarvamTtsConfig};
