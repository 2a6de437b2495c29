pub mod config;
pub mod error;
pub mod graph;
pub mod memory;
pub mod meter;
pub mod mixer;
#[cfg(target_arch = "wasm32")]
pub mod web;

pub use config::MixerConfig;
pub use error::MixerError;
pub use graph::{
    extract_audio_tracks, AudioGraph, AudioHost, ContextState, MediaStream, MediaTrack, TrackKind,
};
pub use mixer::TrackMixer;

/// Crate version, as published.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Mixer over the browser's Web Audio API.
///
/// Audio pipeline:
///
/// ```text
/// mic track ──────▶ source ─▶ gain ─┐
///                                   ├─▶ destination ─▶ mixed track ─▶ peer connection
/// screen track ───▶ source ─▶ gain ─┘
/// ```
///
/// Build one with `TrackMixer::new(&web::WebHost::new()?, MixerConfig::default())`.
#[cfg(target_arch = "wasm32")]
pub type WebMixer = TrackMixer<web::WebGraph>;
