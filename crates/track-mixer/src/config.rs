use serde::{Deserialize, Serialize};

use crate::error::MixerError;
use crate::graph::CONTEXT_CONSTRUCTORS;

const MIN_FFT_SIZE: u32 = 32;
const MAX_FFT_SIZE: u32 = 32768;

/// Configuration for a track mixer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    /// Build the analysis tap used by `mixed_track_volume`.
    pub level_meter: bool,
    /// Analyser window. The level buffer holds half this many samples.
    pub analyser_fft_size: u32,
    /// Context constructor names, tried in priority order.
    pub context_constructors: Vec<String>,
    /// Clamp volume levels to 0..=100 before applying them.
    pub clamp_volume: bool,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            level_meter: true,
            analyser_fft_size: 2048,
            context_constructors: CONTEXT_CONSTRUCTORS.iter().map(|s| (*s).to_string()).collect(),
            clamp_volume: true,
        }
    }
}

impl MixerConfig {
    pub fn validate(&self) -> Result<(), MixerError> {
        let fft = self.analyser_fft_size;
        if !fft.is_power_of_two() || !(MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&fft) {
            return Err(MixerError::InvalidConfig(format!(
                "analyser_fft_size must be a power of two in {MIN_FFT_SIZE}..={MAX_FFT_SIZE}, got {fft}"
            )));
        }
        if self.context_constructors.is_empty() {
            return Err(MixerError::InvalidConfig(
                "context_constructors must not be empty".into(),
            ));
        }
        Ok(())
    }
}
