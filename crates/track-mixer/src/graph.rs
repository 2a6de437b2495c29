//! Host audio-graph capabilities consumed by the mixer.
//!
//! The mixer never touches samples itself. Everything it does is expressed as
//! calls against these traits, which a host implements over its own audio
//! subsystem (`web::WebHost` for browsers, `memory::MemoryHost` in-process).

use std::fmt;

use futures::future::LocalBoxFuture;

use crate::error::MixerError;

/// Context constructor names, tried in priority order.
pub const CONTEXT_CONSTRUCTORS: [&str; 5] = [
    "AudioContext",
    "webkitAudioContext",
    "mozAudioContext",
    "msAudioContext",
    "oAudioContext",
];

/// Media kind reported by a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
    Other(String),
}

impl TrackKind {
    /// Map a host kind string (`"audio"`, `"video"`, ...) to a kind.
    pub fn from_kind_str(kind: &str) -> Self {
        match kind {
            "audio" => Self::Audio,
            "video" => Self::Video,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Other(kind) => kind,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state reported by an audio-processing context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Suspended,
    Running,
    /// Reported by some browsers when the OS takes the audio session away,
    /// e.g. while switching screens.
    Interrupted,
    Closed,
}

impl ContextState {
    /// Map a host state string to a state. Unknown strings read as suspended.
    pub fn from_state_str(state: &str) -> Self {
        match state {
            "running" => Self::Running,
            "interrupted" => Self::Interrupted,
            "closed" => Self::Closed,
            _ => Self::Suspended,
        }
    }
}

/// A live media track handle owned by the caller.
///
/// Handles are cheap clones referring to the same underlying track, so
/// toggling `enabled` through any clone is visible through all of them.
pub trait MediaTrack: Clone {
    /// Unique identifier of the track.
    fn id(&self) -> String;
    fn kind(&self) -> TrackKind;
    fn enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
}

/// A container grouping one or more tracks.
pub trait MediaStream: Clone {
    type Track: MediaTrack;

    fn tracks(&self) -> Vec<Self::Track>;

    fn audio_tracks(&self) -> Vec<Self::Track> {
        self.tracks()
            .into_iter()
            .filter(|track| track.kind() == TrackKind::Audio)
            .collect()
    }
}

/// Filter the audio tracks out of a stream.
pub fn extract_audio_tracks<S: MediaStream>(stream: &S) -> Vec<S::Track> {
    stream.audio_tracks()
}

/// Handler invoked with the context whenever it changes state.
pub type StateHandler<G> = Box<dyn Fn(&G, ContextState)>;

/// An audio-processing context: node factory plus edge bookkeeping.
///
/// Implementations are handles; clones refer to the same context. Node types
/// expose their common node view through `AsRef<Self::Node>` so edges can be
/// made between any pair of them.
pub trait AudioGraph: Clone + 'static {
    type Track: MediaTrack;
    type Stream: MediaStream<Track = Self::Track>;
    /// Common view shared by every node kind.
    type Node;
    type Source: AsRef<Self::Node>;
    type Gain: AsRef<Self::Node>;
    type Destination: AsRef<Self::Node>;
    type Analyser: AsRef<Self::Node>;

    fn state(&self) -> ContextState;

    /// Ask the context to resume processing. Completion is not awaited.
    fn resume(&self) -> Result<(), MixerError>;

    /// Install the state-change handler, replacing any previous one.
    fn on_state_change(&self, handler: StateHandler<Self>);

    /// Whether the context can create a stream destination sink.
    fn supports_destination(&self) -> bool;

    /// Wrap a single track in a new stream container.
    fn wrap_track(&self, track: &Self::Track) -> Result<Self::Stream, MixerError>;

    fn create_source(&self, stream: &Self::Stream) -> Result<Self::Source, MixerError>;

    /// Create a gain node at unity gain.
    fn create_gain(&self) -> Result<Self::Gain, MixerError>;

    fn set_gain(&self, gain: &Self::Gain, factor: f32);

    fn gain(&self, gain: &Self::Gain) -> f32;

    fn create_destination(&self) -> Result<Self::Destination, MixerError>;

    /// The stream the destination sink produces.
    fn destination_stream(&self, destination: &Self::Destination) -> Self::Stream;

    fn create_analyser(&self, fft_size: u32) -> Result<Self::Analyser, MixerError>;

    /// Number of time-domain samples one read yields.
    fn sample_count(&self, analyser: &Self::Analyser) -> usize;

    /// Copy the current time-domain waveform as unsigned bytes centred on 128.
    fn read_time_domain(&self, analyser: &Self::Analyser, samples: &mut [u8]);

    fn connect(&self, from: &Self::Node, to: &Self::Node) -> Result<(), MixerError>;

    fn disconnect(&self, from: &Self::Node, to: &Self::Node) -> Result<(), MixerError>;

    /// Release the context. The future resolves once the host has finished.
    fn close(&self) -> LocalBoxFuture<'static, Result<(), MixerError>>;
}

/// Environment able to construct audio contexts by constructor name.
pub trait AudioHost {
    type Graph: AudioGraph;

    /// Whether a context constructor is exposed under `name`.
    fn has_constructor(&self, name: &str) -> bool;

    fn instantiate(&self, name: &str) -> Result<Self::Graph, MixerError>;
}
