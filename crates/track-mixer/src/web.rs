//! Browser backend over the Web Audio API.
//!
//! Contexts are constructed through whichever constructor the page's global
//! object exposes, looked up by name so vendor-prefixed builds still work.

use std::cell::RefCell;
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use js_sys::{Array, Function, Reflect};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;
use web_sys::{
    AnalyserNode, AudioContext, AudioNode, GainNode, MediaStreamAudioDestinationNode,
    MediaStreamAudioSourceNode, MediaStreamTrack,
};

use crate::error::MixerError;
use crate::graph::{AudioGraph, AudioHost, ContextState, MediaStream, MediaTrack, StateHandler, TrackKind};

fn js_error(op: &str, err: &JsValue) -> MixerError {
    MixerError::Graph(format!("{op}: {err:?}"))
}

impl MediaTrack for MediaStreamTrack {
    fn id(&self) -> String {
        MediaStreamTrack::id(self)
    }

    fn kind(&self) -> TrackKind {
        TrackKind::from_kind_str(&MediaStreamTrack::kind(self))
    }

    fn enabled(&self) -> bool {
        MediaStreamTrack::enabled(self)
    }

    fn set_enabled(&self, enabled: bool) {
        MediaStreamTrack::set_enabled(self, enabled);
    }
}

fn into_tracks(tracks: &Array) -> Vec<MediaStreamTrack> {
    tracks
        .iter()
        .map(|value| value.unchecked_into::<MediaStreamTrack>())
        .collect()
}

impl MediaStream for web_sys::MediaStream {
    type Track = MediaStreamTrack;

    fn tracks(&self) -> Vec<MediaStreamTrack> {
        into_tracks(&self.get_tracks())
    }

    fn audio_tracks(&self) -> Vec<MediaStreamTrack> {
        into_tracks(&self.get_audio_tracks())
    }
}

/// Owns the context's `onstatechange` closure. Dropped with the last owning
/// handle: the listener is uninstalled before it is freed, and a context that
/// was never closed through [`AudioGraph::close`] is closed here.
struct ContextGuard {
    context: AudioContext,
    state_listener: Option<Closure<dyn FnMut(web_sys::Event)>>,
    released: bool,
}

impl ContextGuard {
    fn detach_listener(&mut self) {
        if let Some(listener) = self.state_listener.take() {
            self.context.set_onstatechange(None);
            drop(listener);
        }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.detach_listener();
        if self.released {
            return;
        }
        tracing::debug!("audio context dropped without close, releasing it");
        if let Err(e) = self.context.close() {
            tracing::warn!(error = ?e, "failed to close dropped audio context");
        }
    }
}

/// Handle to a browser `AudioContext` (or a vendor-prefixed equivalent).
#[derive(Clone)]
pub struct WebGraph {
    context: AudioContext,
    /// Shared by every clone of an owning handle. `None` for the borrowed
    /// handle passed to state listeners.
    guard: Option<Rc<RefCell<ContextGuard>>>,
}

impl WebGraph {
    pub fn new(context: AudioContext) -> Self {
        let guard = ContextGuard {
            context: context.clone(),
            state_listener: None,
            released: false,
        };
        Self {
            context,
            guard: Some(Rc::new(RefCell::new(guard))),
        }
    }

    fn unguarded(context: AudioContext) -> Self {
        Self {
            context,
            guard: None,
        }
    }

    /// The raw context, for hosts that build further nodes on it.
    pub fn context(&self) -> &AudioContext {
        &self.context
    }
}

/// Read `state` as a string so non-standard values like `"interrupted"` survive.
fn read_state(context: &AudioContext) -> ContextState {
    Reflect::get(context, &JsValue::from_str("state"))
        .ok()
        .and_then(|value| value.as_string())
        .map_or(ContextState::Suspended, |state| {
            ContextState::from_state_str(&state)
        })
}

impl AudioGraph for WebGraph {
    type Track = MediaStreamTrack;
    type Stream = web_sys::MediaStream;
    type Node = AudioNode;
    type Source = MediaStreamAudioSourceNode;
    type Gain = GainNode;
    type Destination = MediaStreamAudioDestinationNode;
    type Analyser = AnalyserNode;

    fn state(&self) -> ContextState {
        read_state(&self.context)
    }

    fn resume(&self) -> Result<(), MixerError> {
        self.context
            .resume()
            .map(|_| ())
            .map_err(|e| js_error("resume", &e))
    }

    fn on_state_change(&self, handler: StateHandler<Self>) {
        // The listener's handle carries no guard, so the closure does not keep
        // itself alive through a reference cycle.
        let target = WebGraph::unguarded(self.context.clone());
        let listener = Closure::wrap(Box::new(move |_: web_sys::Event| {
            let state = read_state(&target.context);
            handler(&target, state);
        }) as Box<dyn FnMut(web_sys::Event)>);

        self.context
            .set_onstatechange(Some(listener.as_ref().unchecked_ref()));
        match &self.guard {
            Some(guard) => guard.borrow_mut().state_listener = Some(listener),
            // Nothing owns the context from here; it must outlive the page.
            None => listener.forget(),
        }
    }

    fn supports_destination(&self) -> bool {
        Reflect::get(&self.context, &JsValue::from_str("createMediaStreamDestination"))
            .map(|value| value.is_function())
            .unwrap_or(false)
    }

    fn wrap_track(&self, track: &MediaStreamTrack) -> Result<web_sys::MediaStream, MixerError> {
        let stream = web_sys::MediaStream::new().map_err(|e| js_error("new MediaStream", &e))?;
        stream.add_track(track);
        Ok(stream)
    }

    fn create_source(
        &self,
        stream: &web_sys::MediaStream,
    ) -> Result<MediaStreamAudioSourceNode, MixerError> {
        self.context
            .create_media_stream_source(stream)
            .map_err(|e| js_error("createMediaStreamSource", &e))
    }

    fn create_gain(&self) -> Result<GainNode, MixerError> {
        self.context
            .create_gain()
            .map_err(|e| js_error("createGain", &e))
    }

    fn set_gain(&self, gain: &GainNode, factor: f32) {
        gain.gain().set_value(factor);
    }

    fn gain(&self, gain: &GainNode) -> f32 {
        gain.gain().value()
    }

    fn create_destination(&self) -> Result<MediaStreamAudioDestinationNode, MixerError> {
        self.context
            .create_media_stream_destination()
            .map_err(|e| js_error("createMediaStreamDestination", &e))
    }

    fn destination_stream(&self, destination: &MediaStreamAudioDestinationNode) -> web_sys::MediaStream {
        destination.stream()
    }

    fn create_analyser(&self, fft_size: u32) -> Result<AnalyserNode, MixerError> {
        let analyser = self
            .context
            .create_analyser()
            .map_err(|e| js_error("createAnalyser", &e))?;
        analyser.set_fft_size(fft_size);
        Ok(analyser)
    }

    fn sample_count(&self, analyser: &AnalyserNode) -> usize {
        usize::try_from(analyser.frequency_bin_count()).unwrap_or(0)
    }

    fn read_time_domain(&self, analyser: &AnalyserNode, samples: &mut [u8]) {
        analyser.get_byte_time_domain_data(samples);
    }

    fn connect(&self, from: &AudioNode, to: &AudioNode) -> Result<(), MixerError> {
        from.connect_with_audio_node(to)
            .map(|_| ())
            .map_err(|e| js_error("connect", &e))
    }

    fn disconnect(&self, from: &AudioNode, to: &AudioNode) -> Result<(), MixerError> {
        from.disconnect_with_audio_node(to)
            .map_err(|e| js_error("disconnect", &e))
    }

    fn close(&self) -> LocalBoxFuture<'static, Result<(), MixerError>> {
        if let Some(guard) = &self.guard {
            let mut guard = guard.borrow_mut();
            guard.released = true;
            guard.detach_listener();
        }

        let closing = self.context.close();
        Box::pin(async move {
            let promise = closing.map_err(|e| js_error("close", &e))?;
            JsFuture::from(promise)
                .await
                .map_err(|e| js_error("close", &e))?;
            tracing::debug!("audio context released");
            Ok(())
        })
    }
}

/// The page's global object, searched for audio context constructors.
pub struct WebHost {
    window: web_sys::Window,
}

impl WebHost {
    pub fn new() -> Result<Self, MixerError> {
        web_sys::window()
            .map(|window| Self { window })
            .ok_or_else(|| MixerError::UnsupportedEnvironment("no global window".into()))
    }

    fn constructor(&self, name: &str) -> Option<Function> {
        Reflect::get(&self.window, &JsValue::from_str(name))
            .ok()?
            .dyn_into::<Function>()
            .ok()
    }
}

impl AudioHost for WebHost {
    type Graph = WebGraph;

    fn has_constructor(&self, name: &str) -> bool {
        self.constructor(name).is_some()
    }

    fn instantiate(&self, name: &str) -> Result<WebGraph, MixerError> {
        let constructor = self.constructor(name).ok_or_else(|| {
            MixerError::UnsupportedEnvironment(format!("{name} is not available"))
        })?;
        let context = Reflect::construct(&constructor, &Array::new())
            .map_err(|e| js_error(name, &e))?;
        tracing::debug!(constructor = name, "audio context created");
        // Prefixed constructors fail an `instanceof AudioContext` check but
        // expose the same interface.
        Ok(WebGraph::new(context.unchecked_into::<AudioContext>()))
    }
}
