use std::collections::HashMap;
use std::future::Future;

use crate::config::MixerConfig;
use crate::error::MixerError;
use crate::graph::{
    extract_audio_tracks, AudioGraph, AudioHost, ContextState, MediaStream, MediaTrack, TrackKind,
};
use crate::meter::LevelMeter;

/// Graph wiring for one registered input track.
struct TrackEntry<G: AudioGraph> {
    track: G::Track,
    /// Single-track container the source node was derived from.
    stream: G::Stream,
    source: G::Source,
    gain: G::Gain,
    volume: u32,
}

/// Mixes any number of live audio tracks into one output track.
///
/// ```text
/// track ─▶ stream ─▶ source ─▶ gain ─┐
/// track ─▶ stream ─▶ source ─▶ gain ─┼─▶ destination ─▶ mixed stream
/// track ─▶ stream ─▶ source ─▶ gain ─┘                      │
///                                         source ─▶ analyser ◀┘
/// ```
///
/// Each registered track owns its own source and gain nodes; all gains feed the
/// single destination created at construction. Every call leaves an entry
/// either fully wired and registered or fully torn down and absent.
pub struct TrackMixer<G: AudioGraph> {
    graph: G,
    config: MixerConfig,
    destination: G::Destination,
    output: G::Stream,
    mixed: G::Track,
    meter: Option<LevelMeter<G>>,
    entries: HashMap<String, TrackEntry<G>>,
}

impl<G: AudioGraph> TrackMixer<G> {
    /// Create a mixer on a context built by `host`.
    ///
    /// The first constructor in `config.context_constructors` the host exposes
    /// is used. Fails with `UnsupportedEnvironment` when none is exposed or the
    /// context cannot create a destination sink.
    pub fn new<H>(host: &H, config: MixerConfig) -> Result<Self, MixerError>
    where
        H: AudioHost<Graph = G>,
    {
        config.validate()?;

        let constructor = config
            .context_constructors
            .iter()
            .find(|name| host.has_constructor(name))
            .ok_or_else(|| {
                MixerError::UnsupportedEnvironment("no audio context constructor available".into())
            })?;
        let graph = host.instantiate(constructor)?;

        // Some browsers expose the constructor but not the destination sink.
        if !graph.supports_destination() {
            return Err(MixerError::UnsupportedEnvironment(format!(
                "{constructor} cannot create a media stream destination"
            )));
        }

        let destination = graph.create_destination()?;
        let output = graph.destination_stream(&destination);
        let mixed = output.audio_tracks().into_iter().next().ok_or_else(|| {
            MixerError::UnsupportedEnvironment("destination produced no audio track".into())
        })?;

        let meter = if config.level_meter {
            Some(LevelMeter::attach(&graph, &output, config.analyser_fft_size)?)
        } else {
            None
        };

        graph.on_state_change(Box::new(|context: &G, state: ContextState| {
            if state == ContextState::Interrupted {
                tracing::warn!("audio context interrupted, resuming");
                if let Err(e) = context.resume() {
                    tracing::warn!(error = %e, "failed to resume interrupted audio context");
                }
            }
        }));

        tracing::info!(
            constructor = %constructor,
            level_meter = meter.is_some(),
            "track mixer ready"
        );

        Ok(Self {
            graph,
            config,
            destination,
            output,
            mixed,
            meter,
            entries: HashMap::new(),
        })
    }

    /// Register `track` and wire source→gain→destination at unity gain.
    ///
    /// Returns the mixer so calls can be chained with `?`.
    pub fn add(&mut self, track: &G::Track) -> Result<&mut Self, MixerError> {
        let id = ensure_audio(track)?;
        if self.entries.contains_key(&id) {
            return Err(MixerError::DuplicateTrack(id));
        }

        let entry = self.wire(track)?;
        self.entries.insert(id.clone(), entry);
        tracing::debug!(track = %id, tracks = self.entries.len(), "track added to mixer");
        Ok(self)
    }

    fn wire(&self, track: &G::Track) -> Result<TrackEntry<G>, MixerError> {
        let stream = self.graph.wrap_track(track)?;
        let source = self.graph.create_source(&stream)?;
        let gain = self.graph.create_gain()?;
        self.graph.set_gain(&gain, 1.0);

        self.graph.connect(source.as_ref(), gain.as_ref())?;
        if let Err(e) = self.graph.connect(gain.as_ref(), self.destination.as_ref()) {
            // Undo the first edge so a failed add leaves nothing behind.
            if let Err(undo) = self.graph.disconnect(source.as_ref(), gain.as_ref()) {
                tracing::warn!(error = %undo, "failed to undo partial track wiring");
            }
            return Err(e);
        }

        Ok(TrackEntry {
            track: track.clone(),
            stream,
            source,
            gain,
            volume: 100,
        })
    }

    /// Unregister `track`, detaching gain→destination before source→gain.
    ///
    /// Removing a track that was never added is a no-op.
    pub fn remove(&mut self, track: &G::Track) -> Result<&mut Self, MixerError> {
        let id = ensure_audio(track)?;
        if let Some(entry) = self.entries.remove(&id) {
            self.unwire(&entry)?;
            tracing::debug!(track = %id, tracks = self.entries.len(), "track removed from mixer");
        }
        Ok(self)
    }

    /// Attempt both disconnects, returning the first failure.
    fn unwire(&self, entry: &TrackEntry<G>) -> Result<(), MixerError> {
        let downstream = self
            .graph
            .disconnect(entry.gain.as_ref(), self.destination.as_ref());
        let upstream = self.graph.disconnect(entry.source.as_ref(), entry.gain.as_ref());
        for result in [&downstream, &upstream] {
            if let Err(e) = result {
                tracing::warn!(track = %entry.track.id(), error = %e, "failed to disconnect track");
            }
        }
        downstream.and(upstream)
    }

    /// Set the gain of a registered track to `level / 100`.
    ///
    /// `level` is a percentage. With `clamp_volume` (the default) anything
    /// above 100 is applied as 100. Unregistered tracks are ignored.
    pub fn set_volume(&mut self, track: &G::Track, level: u32) -> Result<(), MixerError> {
        let id = ensure_audio(track)?;
        let level = if self.config.clamp_volume {
            level.min(100)
        } else {
            level
        };
        if let Some(entry) = self.entries.get_mut(&id) {
            #[allow(clippy::cast_precision_loss)] // percentages are far below f32 mantissa range
            let factor = level as f32 / 100.0;
            self.graph.set_gain(&entry.gain, factor);
            entry.volume = level;
            tracing::debug!(track = %id, level, "track volume set");
        }
        Ok(())
    }

    /// Disable a registered track. Returns `false` if it is not registered.
    ///
    /// The gain is left alone, so `unmute` restores the last volume.
    pub fn mute(&mut self, track: &G::Track) -> Result<bool, MixerError> {
        self.set_enabled(track, false)
    }

    /// Re-enable a registered track. Returns `false` if it is not registered.
    pub fn unmute(&mut self, track: &G::Track) -> Result<bool, MixerError> {
        self.set_enabled(track, true)
    }

    fn set_enabled(&mut self, track: &G::Track, enabled: bool) -> Result<bool, MixerError> {
        let id = ensure_audio(track)?;
        match self.entries.get(&id) {
            Some(entry) => {
                entry.track.set_enabled(enabled);
                tracing::debug!(track = %id, muted = !enabled, "track mute toggled");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Handles of every registered track, in no particular order.
    pub fn tracks(&self) -> Vec<G::Track> {
        self.entries.values().map(|entry| entry.track.clone()).collect()
    }

    pub fn contains(&self, track: &G::Track) -> bool {
        self.entries.contains_key(&track.id())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Last volume percentage applied to a registered track.
    pub fn volume(&self, track: &G::Track) -> Option<u32> {
        self.entries.get(&track.id()).map(|entry| entry.volume)
    }

    /// Current linear gain factor of a registered track.
    pub fn track_gain(&self, track: &G::Track) -> Option<f32> {
        self.entries
            .get(&track.id())
            .map(|entry| self.graph.gain(&entry.gain))
    }

    /// Whether a registered track is currently disabled.
    pub fn is_muted(&self, track: &G::Track) -> Option<bool> {
        self.entries
            .get(&track.id())
            .map(|entry| !entry.track.enabled())
    }

    /// The single-track container wrapping a registered track.
    pub fn track_stream(&self, track: &G::Track) -> Option<&G::Stream> {
        self.entries.get(&track.id()).map(|entry| &entry.stream)
    }

    /// The mixed output track. Silent until a track is added.
    pub fn mixed_track(&self) -> &G::Track {
        &self.mixed
    }

    /// The stream containing the mixed output track.
    pub fn mixed_stream(&self) -> &G::Stream {
        &self.output
    }

    /// Peak level of the mixed output in 0..=100, or 0 without a level meter.
    pub fn mixed_track_volume(&mut self) -> u8 {
        match self.meter.as_mut() {
            Some(meter) => meter.level(&self.graph),
            None => 0,
        }
    }

    pub fn context_state(&self) -> ContextState {
        self.graph.state()
    }

    /// The underlying context handle.
    pub fn context(&self) -> &G {
        &self.graph
    }

    pub fn config(&self) -> &MixerConfig {
        &self.config
    }

    /// Filter the audio tracks out of a stream.
    pub fn extract_audio_tracks(stream: &G::Stream) -> Vec<G::Track> {
        extract_audio_tracks(stream)
    }

    /// Tear down every track's wiring and release the context.
    ///
    /// Teardown is best-effort: a failed disconnect is logged and the
    /// remaining entries are still torn down. The registry is emptied before
    /// this returns; the future resolves once the host has released the context.
    pub fn destroy(mut self) -> impl Future<Output = Result<(), MixerError>> {
        let entries = std::mem::take(&mut self.entries);
        for (id, entry) in &entries {
            if let Err(e) = self.unwire(entry) {
                tracing::debug!(track = %id, error = %e, "continuing teardown after disconnect failure");
            }
        }
        if let Some(meter) = self.meter.take() {
            if let Err(e) = meter.detach(&self.graph) {
                tracing::warn!(error = %e, "failed to detach level meter");
            }
        }
        tracing::info!(tracks = entries.len(), "track mixer destroyed, releasing audio context");
        self.graph.close()
    }
}

/// Reject anything that is not an audio track, returning its id otherwise.
fn ensure_audio<T: MediaTrack>(track: &T) -> Result<String, MixerError> {
    let id = track.id();
    match track.kind() {
        TrackKind::Audio => Ok(id),
        kind => Err(MixerError::InvalidTrackKind { id, kind }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryGraph, MemoryHost, MemoryStream, MemoryTrack, NodeKind};

    fn mixer() -> TrackMixer<MemoryGraph> {
        TrackMixer::new(&MemoryHost::new(), MixerConfig::default()).unwrap()
    }

    fn ids(tracks: &[MemoryTrack]) -> Vec<String> {
        let mut ids: Vec<String> = tracks.iter().map(MediaTrack::id).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_new_picks_first_available_constructor() {
        let host = MemoryHost::with_constructors(["mozAudioContext", "webkitAudioContext"]);
        let mixer = TrackMixer::new(&host, MixerConfig::default()).unwrap();
        assert_eq!(mixer.context().constructor(), "webkitAudioContext");
        assert!(mixer.is_empty());
    }

    #[test]
    fn test_new_without_constructor_is_unsupported() {
        let host = MemoryHost::with_constructors(Vec::<&str>::new());
        let result = TrackMixer::new(&host, MixerConfig::default());
        assert!(matches!(result, Err(MixerError::UnsupportedEnvironment(_))));
    }

    #[test]
    fn test_new_without_destination_is_unsupported() {
        let host = MemoryHost::new().without_destination_support();
        let result = TrackMixer::new(&host, MixerConfig::default());
        assert!(matches!(result, Err(MixerError::UnsupportedEnvironment(_))));
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = MixerConfig {
            analyser_fft_size: 100,
            ..MixerConfig::default()
        };
        let result = TrackMixer::new(&MemoryHost::new(), config);
        assert!(matches!(result, Err(MixerError::InvalidConfig(_))));
    }

    #[test]
    fn test_add_wires_source_gain_destination() {
        let mut mixer = mixer();
        let track = MemoryTrack::audio("a1");
        mixer.add(&track).unwrap();

        let entry = &mixer.entries["a1"];
        let graph = mixer.context();
        assert!(graph.is_connected(&entry.source, &entry.gain));
        assert!(graph.is_connected(&entry.gain, &mixer.destination));
        assert!((graph.gain(&entry.gain) - 1.0).abs() < f32::EPSILON);
        assert_eq!(graph.source_stream(&entry.source).unwrap().tracks(), vec![track.clone()]);
        assert_eq!(mixer.volume(&track), Some(100));
    }

    #[test]
    fn test_add_chains() {
        let mut mixer = mixer();
        let a = MemoryTrack::audio("a1");
        let b = MemoryTrack::audio("a2");
        mixer.add(&a).unwrap().add(&b).unwrap();
        assert_eq!(ids(&mixer.tracks()), vec!["a1", "a2"]);
    }

    #[test]
    fn test_add_duplicate_is_rejected() {
        let mut mixer = mixer();
        let track = MemoryTrack::audio("a1");
        mixer.add(&track).unwrap();
        let edges = mixer.context().edge_count();

        let result = mixer.add(&track);
        assert!(matches!(result, Err(MixerError::DuplicateTrack(id)) if id == "a1"));
        assert_eq!(mixer.len(), 1);
        assert_eq!(mixer.context().edge_count(), edges);
    }

    #[test]
    fn test_video_track_rejected_everywhere() {
        let mut mixer = mixer();
        let video = MemoryTrack::video("v1");
        let edges = mixer.context().edge_count();

        assert!(matches!(mixer.add(&video), Err(MixerError::InvalidTrackKind { .. })));
        assert!(matches!(mixer.remove(&video), Err(MixerError::InvalidTrackKind { .. })));
        assert!(matches!(
            mixer.set_volume(&video, 50),
            Err(MixerError::InvalidTrackKind { .. })
        ));
        assert!(matches!(mixer.mute(&video), Err(MixerError::InvalidTrackKind { .. })));
        assert!(matches!(mixer.unmute(&video), Err(MixerError::InvalidTrackKind { .. })));

        assert!(mixer.is_empty());
        assert!(video.enabled());
        assert_eq!(mixer.context().edge_count(), edges);
    }

    #[test]
    fn test_failed_connect_rolls_back() {
        let mut mixer = mixer();
        let edges = mixer.context().edge_count();
        mixer.context().fail_connections_to(Some(NodeKind::Destination));

        let track = MemoryTrack::audio("a1");
        assert!(matches!(mixer.add(&track), Err(MixerError::Graph(_))));
        assert!(!mixer.contains(&track));
        assert_eq!(mixer.context().edge_count(), edges);

        mixer.context().fail_connections_to(None);
        mixer.add(&track).unwrap();
        assert!(mixer.contains(&track));
    }

    #[test]
    fn test_remove_disconnects_and_unregisters() {
        let mut mixer = mixer();
        let track = MemoryTrack::audio("a1");
        mixer.add(&track).unwrap();
        let (source, gain) = {
            let entry = &mixer.entries["a1"];
            (entry.source.clone(), entry.gain.clone())
        };

        mixer.remove(&track).unwrap();
        let graph = mixer.context();
        assert!(!graph.is_connected(&source, &gain));
        assert!(!graph.is_connected(&gain, &mixer.destination));
        assert!(mixer.tracks().is_empty());

        // Gain leaves the destination before the source leaves the gain.
        assert_eq!(
            graph.recent_disconnects(),
            vec![
                (gain.id(), mixer.destination.id()),
                (source.id(), gain.id()),
            ]
        );
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let mut mixer = mixer();
        let a = MemoryTrack::audio("a1");
        mixer.add(&a).unwrap();
        mixer.remove(&MemoryTrack::audio("ghost")).unwrap();
        assert_eq!(mixer.len(), 1);
    }

    #[test]
    fn test_set_volume_applies_last_level() {
        let mut mixer = mixer();
        let track = MemoryTrack::audio("a1");
        mixer.add(&track).unwrap();

        mixer.set_volume(&track, 0).unwrap();
        mixer.set_volume(&track, 100).unwrap();
        mixer.set_volume(&track, 50).unwrap();
        assert_eq!(mixer.track_gain(&track), Some(0.5));
        assert_eq!(mixer.volume(&track), Some(50));

        mixer.set_volume(&track, 0).unwrap();
        assert_eq!(mixer.track_gain(&track), Some(0.0));
    }

    #[test]
    fn test_set_volume_clamps_by_default() {
        let mut mixer = mixer();
        let track = MemoryTrack::audio("a1");
        mixer.add(&track).unwrap();
        mixer.set_volume(&track, 150).unwrap();
        assert_eq!(mixer.track_gain(&track), Some(1.0));
        assert_eq!(mixer.volume(&track), Some(100));
    }

    #[test]
    fn test_set_volume_passthrough_when_unclamped() {
        let config = MixerConfig {
            clamp_volume: false,
            ..MixerConfig::default()
        };
        let mut mixer = TrackMixer::new(&MemoryHost::new(), config).unwrap();
        let track = MemoryTrack::audio("a1");
        mixer.add(&track).unwrap();
        mixer.set_volume(&track, 150).unwrap();
        assert_eq!(mixer.track_gain(&track), Some(1.5));
    }

    #[test]
    fn test_set_volume_unknown_is_noop() {
        let mut mixer = mixer();
        let ghost = MemoryTrack::audio("ghost");
        mixer.set_volume(&ghost, 30).unwrap();
        assert_eq!(mixer.track_gain(&ghost), None);
    }

    #[test]
    fn test_mute_toggles_enabled_not_gain() {
        let mut mixer = mixer();
        let track = MemoryTrack::audio("a1");
        mixer.add(&track).unwrap();
        mixer.set_volume(&track, 40).unwrap();

        assert!(mixer.mute(&track).unwrap());
        assert!(!track.enabled());
        assert_eq!(mixer.is_muted(&track), Some(true));
        assert_eq!(mixer.track_gain(&track), Some(0.4));

        assert!(mixer.unmute(&track).unwrap());
        assert!(track.enabled());
        assert_eq!(mixer.track_gain(&track), Some(0.4));
    }

    #[test]
    fn test_mute_unknown_returns_false() {
        let mut mixer = mixer();
        let ghost = MemoryTrack::audio("ghost");
        assert!(!mixer.mute(&ghost).unwrap());
        assert!(!mixer.unmute(&ghost).unwrap());
        assert!(ghost.enabled());
    }

    #[test]
    fn test_mixed_output_exists_before_any_track() {
        let mixer = mixer();
        assert_eq!(mixer.mixed_track().kind(), TrackKind::Audio);
        assert_eq!(mixer.mixed_stream().audio_tracks(), vec![mixer.mixed_track().clone()]);
    }

    #[test]
    fn test_mixed_track_volume() {
        let mut mixer = mixer();
        assert_eq!(mixer.mixed_track_volume(), 0);

        mixer.context().set_waveform(vec![128, 160, 96, 128]);
        assert_eq!(mixer.mixed_track_volume(), 25);

        mixer.context().set_waveform(vec![0, 255]);
        assert_eq!(mixer.mixed_track_volume(), 100);
    }

    #[test]
    fn test_mixed_track_volume_without_meter() {
        let config = MixerConfig {
            level_meter: false,
            ..MixerConfig::default()
        };
        let mut mixer = TrackMixer::new(&MemoryHost::new(), config).unwrap();
        mixer.context().set_waveform(vec![0]);
        assert_eq!(mixer.mixed_track_volume(), 0);
        assert_eq!(mixer.context().edge_count(), 0);
    }

    #[test]
    fn test_interrupted_context_is_resumed() {
        let mixer = mixer();
        let graph = mixer.context().clone();

        graph.emit_state(ContextState::Suspended);
        assert_eq!(graph.resume_count(), 0);

        graph.emit_state(ContextState::Interrupted);
        assert_eq!(graph.resume_count(), 1);
        assert_eq!(mixer.context_state(), ContextState::Running);
    }

    #[test]
    fn test_extract_audio_tracks() {
        let stream = MemoryStream::from_tracks(vec![
            MemoryTrack::audio("mic"),
            MemoryTrack::video("cam"),
        ]);
        let tracks = TrackMixer::<MemoryGraph>::extract_audio_tracks(&stream);
        assert_eq!(ids(&tracks), vec!["mic"]);
    }

    #[tokio::test]
    async fn test_destroy_tears_down_and_releases() {
        let mut mixer = mixer();
        mixer
            .add(&MemoryTrack::audio("a1"))
            .unwrap()
            .add(&MemoryTrack::audio("a2"))
            .unwrap();
        let graph = mixer.context().clone();
        let dest = mixer.destination.id();
        let mut expected: Vec<_> = mixer
            .entries
            .values()
            .map(|entry| {
                vec![
                    (entry.gain.id(), dest),
                    (entry.source.id(), entry.gain.id()),
                ]
            })
            .collect();

        let release = mixer.destroy();
        assert_eq!(graph.edge_count(), 0);

        // Per entry: gain→destination, then source→gain. The level meter goes last.
        let log = graph.recent_disconnects();
        assert_eq!(log.len(), 5);
        let mut torn_down: Vec<_> = log[..4].chunks(2).map(<[_]>::to_vec).collect();
        torn_down.sort();
        expected.sort();
        assert_eq!(torn_down, expected);
        assert_eq!(graph.gain_count(), 0);

        release.await.unwrap();
        assert_eq!(graph.state(), ContextState::Closed);
    }
}
