use thiserror::Error;

use crate::graph::TrackKind;

#[derive(Debug, Error)]
pub enum MixerError {
    #[error("the environment does not support mixing audio tracks: {0}")]
    UnsupportedEnvironment(String),

    #[error("not an audio track (id: {id}, kind: {kind})")]
    InvalidTrackKind { id: String, kind: TrackKind },

    #[error("audio track (id: {0}) has already been added")]
    DuplicateTrack(String),

    #[error("invalid mixer config: {0}")]
    InvalidConfig(String),

    #[error("audio graph error: {0}")]
    Graph(String),
}
