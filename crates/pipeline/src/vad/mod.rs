//! Voice Activity Detection

mod energy;

pub use energy::{EnergyVad, EnergyVadConfig, VadState};
