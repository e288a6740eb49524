//! Speech-to-text clients

mod sarvam;

pub use sarvam::{SarvamStt, SarvamSttConfig};
