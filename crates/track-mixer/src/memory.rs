//! In-process audio graph.
//!
//! Keeps the node/edge bookkeeping of a real context without producing any
//! audio. Headless hosts use it to drive the mixer, and the test suites use it
//! to observe wiring, gain factors and context state. The analyser replays a
//! waveform set with [`MemoryGraph::set_waveform`].

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::rc::Rc;

use futures::future::LocalBoxFuture;

use crate::error::MixerError;
use crate::graph::{AudioGraph, AudioHost, ContextState, MediaStream, MediaTrack, StateHandler, TrackKind};
use crate::meter::MIDPOINT;

const DISCONNECT_LOG_LEN: usize = 64;

#[derive(Debug)]
struct TrackInner {
    id: String,
    kind: TrackKind,
    enabled: Cell<bool>,
}

/// Track handle; clones share the enabled flag.
#[derive(Debug, Clone)]
pub struct MemoryTrack {
    inner: Rc<TrackInner>,
}

impl MemoryTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            inner: Rc::new(TrackInner {
                id: id.into(),
                kind,
                enabled: Cell::new(true),
            }),
        }
    }

    pub fn audio(id: impl Into<String>) -> Self {
        Self::new(id, TrackKind::Audio)
    }

    pub fn video(id: impl Into<String>) -> Self {
        Self::new(id, TrackKind::Video)
    }
}

impl PartialEq for MemoryTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for MemoryTrack {}

impl MediaTrack for MemoryTrack {
    fn id(&self) -> String {
        self.inner.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.inner.kind.clone()
    }

    fn enabled(&self) -> bool {
        self.inner.enabled.get()
    }

    fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.set(enabled);
    }
}

/// Stream container; clones share the track list.
#[derive(Debug, Clone, Default)]
pub struct MemoryStream {
    tracks: Rc<RefCell<Vec<MemoryTrack>>>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tracks(tracks: Vec<MemoryTrack>) -> Self {
        Self {
            tracks: Rc::new(RefCell::new(tracks)),
        }
    }

    pub fn add_track(&self, track: MemoryTrack) {
        self.tracks.borrow_mut().push(track);
    }
}

impl MediaStream for MemoryStream {
    type Track = MemoryTrack;

    fn tracks(&self) -> Vec<MemoryTrack> {
        self.tracks.borrow().clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Source,
    Gain,
    Destination,
    Analyser,
}

#[derive(Debug, Clone)]
pub struct MemoryNode {
    id: NodeId,
    kind: NodeKind,
}

impl MemoryNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }
}

impl AsRef<MemoryNode> for MemoryNode {
    fn as_ref(&self) -> &MemoryNode {
        self
    }
}

struct GraphState {
    constructor: String,
    state: ContextState,
    supports_destination: bool,
    next_id: u64,
    edges: BTreeSet<(NodeId, NodeId)>,
    gains: HashMap<NodeId, f32>,
    sources: HashMap<NodeId, MemoryStream>,
    outputs: HashMap<NodeId, MemoryStream>,
    analysers: HashMap<NodeId, usize>,
    waveform: Vec<u8>,
    handler: Option<Rc<dyn Fn(&MemoryGraph, ContextState)>>,
    resume_count: usize,
    failing_target: Option<NodeKind>,
    disconnects: VecDeque<(NodeId, NodeId)>,
}

impl GraphState {
    fn ensure_open(&self) -> Result<(), MixerError> {
        if self.state == ContextState::Closed {
            return Err(MixerError::Graph("context is closed".into()));
        }
        Ok(())
    }

    fn alloc(&mut self, kind: NodeKind) -> Result<MemoryNode, MixerError> {
        self.ensure_open()?;
        let id = NodeId(self.next_id);
        self.next_id += 1;
        Ok(MemoryNode { id, kind })
    }

    /// Forget per-node state of a source or gain once it has no edges left.
    fn release_if_detached(&mut self, node: &MemoryNode) {
        let attached = self
            .edges
            .iter()
            .any(|&(from, to)| from == node.id || to == node.id);
        if attached {
            return;
        }
        match node.kind {
            NodeKind::Source => {
                self.sources.remove(&node.id);
            }
            NodeKind::Gain => {
                self.gains.remove(&node.id);
            }
            NodeKind::Destination | NodeKind::Analyser => {}
        }
    }
}

/// Context handle; clones refer to the same graph.
#[derive(Clone)]
pub struct MemoryGraph {
    inner: Rc<RefCell<GraphState>>,
}

impl MemoryGraph {
    pub fn new(constructor: impl Into<String>, supports_destination: bool) -> Self {
        Self {
            inner: Rc::new(RefCell::new(GraphState {
                constructor: constructor.into(),
                state: ContextState::Running,
                supports_destination,
                next_id: 0,
                edges: BTreeSet::new(),
                gains: HashMap::new(),
                sources: HashMap::new(),
                outputs: HashMap::new(),
                analysers: HashMap::new(),
                waveform: Vec::new(),
                handler: None,
                resume_count: 0,
                failing_target: None,
                disconnects: VecDeque::new(),
            })),
        }
    }

    /// Constructor name this context was instantiated through.
    pub fn constructor(&self) -> String {
        self.inner.borrow().constructor.clone()
    }

    pub fn is_connected(&self, from: &MemoryNode, to: &MemoryNode) -> bool {
        self.inner.borrow().edges.contains(&(from.id, to.id))
    }

    pub fn edge_count(&self) -> usize {
        self.inner.borrow().edges.len()
    }

    /// Stream a source node was derived from.
    pub fn source_stream(&self, source: &MemoryNode) -> Option<MemoryStream> {
        self.inner.borrow().sources.get(&source.id).cloned()
    }

    /// Gain nodes whose factor is still tracked.
    pub fn gain_count(&self) -> usize {
        self.inner.borrow().gains.len()
    }

    /// Source nodes whose stream is still tracked.
    pub fn source_count(&self) -> usize {
        self.inner.borrow().sources.len()
    }

    /// Most recent successful disconnects, oldest first.
    pub fn recent_disconnects(&self) -> Vec<(NodeId, NodeId)> {
        self.inner.borrow().disconnects.iter().copied().collect()
    }

    pub fn resume_count(&self) -> usize {
        self.inner.borrow().resume_count
    }

    /// Waveform replayed (cyclically) by every analyser. Empty means silence.
    pub fn set_waveform(&self, waveform: Vec<u8>) {
        self.inner.borrow_mut().waveform = waveform;
    }

    /// Make every `connect` into a node of `kind` fail until cleared.
    pub fn fail_connections_to(&self, kind: Option<NodeKind>) {
        self.inner.borrow_mut().failing_target = kind;
    }

    /// Move the context to `state` and notify the installed handler.
    pub fn emit_state(&self, state: ContextState) {
        let handler = {
            let mut inner = self.inner.borrow_mut();
            inner.state = state;
            inner.handler.clone()
        };
        if let Some(handler) = handler {
            handler(self, state);
        }
    }
}

impl AudioGraph for MemoryGraph {
    type Track = MemoryTrack;
    type Stream = MemoryStream;
    type Node = MemoryNode;
    type Source = MemoryNode;
    type Gain = MemoryNode;
    type Destination = MemoryNode;
    type Analyser = MemoryNode;

    fn state(&self) -> ContextState {
        self.inner.borrow().state
    }

    fn resume(&self) -> Result<(), MixerError> {
        let mut inner = self.inner.borrow_mut();
        inner.ensure_open()?;
        inner.state = ContextState::Running;
        inner.resume_count += 1;
        Ok(())
    }

    fn on_state_change(&self, handler: StateHandler<Self>) {
        self.inner.borrow_mut().handler = Some(Rc::from(handler));
    }

    fn supports_destination(&self) -> bool {
        self.inner.borrow().supports_destination
    }

    fn wrap_track(&self, track: &MemoryTrack) -> Result<MemoryStream, MixerError> {
        self.inner.borrow().ensure_open()?;
        Ok(MemoryStream::from_tracks(vec![track.clone()]))
    }

    fn create_source(&self, stream: &MemoryStream) -> Result<MemoryNode, MixerError> {
        let mut inner = self.inner.borrow_mut();
        let node = inner.alloc(NodeKind::Source)?;
        inner.sources.insert(node.id, stream.clone());
        Ok(node)
    }

    fn create_gain(&self) -> Result<MemoryNode, MixerError> {
        let mut inner = self.inner.borrow_mut();
        let node = inner.alloc(NodeKind::Gain)?;
        inner.gains.insert(node.id, 1.0);
        Ok(node)
    }

    fn set_gain(&self, gain: &MemoryNode, factor: f32) {
        self.inner.borrow_mut().gains.insert(gain.id, factor);
    }

    fn gain(&self, gain: &MemoryNode) -> f32 {
        self.inner.borrow().gains.get(&gain.id).copied().unwrap_or(1.0)
    }

    fn create_destination(&self) -> Result<MemoryNode, MixerError> {
        let mut inner = self.inner.borrow_mut();
        if !inner.supports_destination {
            return Err(MixerError::Graph(
                "createMediaStreamDestination is not available".into(),
            ));
        }
        let node = inner.alloc(NodeKind::Destination)?;
        let output = MemoryStream::from_tracks(vec![MemoryTrack::audio(format!(
            "mixed-{}",
            node.id.0
        ))]);
        inner.outputs.insert(node.id, output);
        Ok(node)
    }

    fn destination_stream(&self, destination: &MemoryNode) -> MemoryStream {
        self.inner
            .borrow()
            .outputs
            .get(&destination.id)
            .cloned()
            .unwrap_or_default()
    }

    fn create_analyser(&self, fft_size: u32) -> Result<MemoryNode, MixerError> {
        let mut inner = self.inner.borrow_mut();
        let node = inner.alloc(NodeKind::Analyser)?;
        let count = usize::try_from(fft_size / 2)
            .map_err(|e| MixerError::Graph(format!("analyser size: {e}")))?;
        inner.analysers.insert(node.id, count);
        Ok(node)
    }

    fn sample_count(&self, analyser: &MemoryNode) -> usize {
        self.inner
            .borrow()
            .analysers
            .get(&analyser.id)
            .copied()
            .unwrap_or(0)
    }

    fn read_time_domain(&self, _analyser: &MemoryNode, samples: &mut [u8]) {
        let inner = self.inner.borrow();
        if inner.waveform.is_empty() {
            samples.fill(MIDPOINT);
            return;
        }
        for (sample, value) in samples.iter_mut().zip(inner.waveform.iter().cycle()) {
            *sample = *value;
        }
    }

    fn connect(&self, from: &MemoryNode, to: &MemoryNode) -> Result<(), MixerError> {
        let mut inner = self.inner.borrow_mut();
        inner.ensure_open()?;
        if inner.failing_target == Some(to.kind) {
            return Err(MixerError::Graph(format!("connect to {:?} refused", to.kind)));
        }
        inner.edges.insert((from.id, to.id));
        Ok(())
    }

    fn disconnect(&self, from: &MemoryNode, to: &MemoryNode) -> Result<(), MixerError> {
        let mut inner = self.inner.borrow_mut();
        inner.ensure_open()?;
        if !inner.edges.remove(&(from.id, to.id)) {
            return Err(MixerError::Graph(format!(
                "{:?} {:?} is not connected to {:?} {:?}",
                from.kind, from.id, to.kind, to.id
            )));
        }
        if inner.disconnects.len() == DISCONNECT_LOG_LEN {
            inner.disconnects.pop_front();
        }
        inner.disconnects.push_back((from.id, to.id));
        inner.release_if_detached(from);
        inner.release_if_detached(to);
        Ok(())
    }

    fn close(&self) -> LocalBoxFuture<'static, Result<(), MixerError>> {
        let graph = self.clone();
        Box::pin(async move {
            {
                let inner = graph.inner.borrow();
                inner.ensure_open()?;
            }
            graph.emit_state(ContextState::Closed);
            Ok(())
        })
    }
}

/// Environment exposing a configurable set of context constructors.
pub struct MemoryHost {
    constructors: Vec<String>,
    supports_destination: bool,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHost {
    /// A host exposing the standard `AudioContext` constructor.
    pub fn new() -> Self {
        Self::with_constructors(["AudioContext"])
    }

    pub fn with_constructors<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            constructors: names.into_iter().map(String::from).collect(),
            supports_destination: true,
        }
    }

    /// Contexts from this host cannot create a destination sink.
    pub fn without_destination_support(mut self) -> Self {
        self.supports_destination = false;
        self
    }
}

impl AudioHost for MemoryHost {
    type Graph = MemoryGraph;

    fn has_constructor(&self, name: &str) -> bool {
        self.constructors.iter().any(|c| c == name)
    }

    fn instantiate(&self, name: &str) -> Result<MemoryGraph, MixerError> {
        if !self.has_constructor(name) {
            return Err(MixerError::UnsupportedEnvironment(format!(
                "no constructor named {name}"
            )));
        }
        Ok(MemoryGraph::new(name, self.supports_destination))
    }
}
