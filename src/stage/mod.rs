//! Stages: the processing units of a pipeline.
//!
//! A [`Stage`] is the capability trait applications implement: a set of
//! callbacks for format handling, data processing, production, lifecycle
//! and flushing, with defaults for everything a given stage does not do.
//!
//! A [`StageNode`] wraps a boxed stage and owns everything around it: its
//! pads, its position in the state machine, its streaming thread (for
//! stages that produce), and the bus handle. All calls into the stage's
//! callbacks are serialized through the node's stage lock.
//!
//! Stages reach back into the engine only through [`StageContext`]: push
//! on their own source pads, post bus messages, commit async state
//! changes, park for preroll. No ambient globals.

pub mod pad;

use crate::buffer::Buffer;
use crate::bus::{Bus, MessageKind};
use crate::caps::Caps;
use crate::error::StateChangeError;
use crate::state::{State, StateChangeResult, StateSnapshot, StateTracker, Transition};
use pad::{FlowResult, Pad, PadDirection, PadPresence, PadTemplate};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

// ============================================================================
// The Stage trait
// ============================================================================

/// What a source stage produced when asked.
#[derive(Debug)]
pub enum Produced {
    /// A buffer to push downstream.
    Buffer(Buffer),
    /// The stream is finished.
    Eos,
    /// Nothing right now; ask again later (live stages waiting for
    /// Playing, intermittent sources).
    Idle,
    /// Production failed fatally.
    Error(String),
}

/// The capability set of a processing stage.
///
/// Every method has a default standing for "this stage does not have
/// that capability": formats are accepted as proposed, state changes
/// succeed synchronously, there is nothing to produce, flush is a no-op.
/// A stage implements exactly the callbacks matching what it does.
pub trait Stage: Send {
    /// The pads this stage exposes. Templates with
    /// [`PadPresence::Always`] are instantiated when the stage is added;
    /// [`PadPresence::Request`] templates via [`Stage::request_pad`].
    fn pad_templates(&self) -> Vec<PadTemplate>;

    /// A format was proposed for `pad` during negotiation. Return true
    /// to accept. Proposals are fixed caps, except on a fully
    /// unconstrained link where [`Caps::any`] is proposed.
    fn set_format(&mut self, pad: &str, caps: &Caps) -> bool {
        let _ = (pad, caps);
        true
    }

    /// Asked for a counter-proposal after rejecting a format. `offered`
    /// is the current round's caps; the answer must be a non-empty
    /// subset of it. `None` ends the negotiation in failure.
    fn propose_format(&mut self, pad: &str, offered: &Caps) -> Option<Caps> {
        let _ = (pad, offered);
        None
    }

    /// A buffer arrived on sink pad `pad`. Ownership of the buffer
    /// transfers to the stage. Output is emitted by pushing on the
    /// stage's own source pads through the [`StageContext`].
    fn process(&mut self, pad: &str, buffer: Buffer) -> FlowResult {
        let _ = (pad, buffer);
        FlowResult::Ok
    }

    /// Produce the next item. Called in a loop on the stage's streaming
    /// thread; only stages without sink pads are driven this way.
    fn produce(&mut self) -> Produced {
        Produced::Idle
    }

    /// Serve `size` bytes at `offset` for a pull-mode link. The default
    /// cannot serve ranges.
    fn pull_range(&mut self, offset: u64, size: usize) -> Result<Buffer, FlowResult> {
        let _ = (offset, size);
        Err(FlowResult::Error)
    }

    /// Whether this stage can serve byte ranges through
    /// [`Stage::pull_range`]. Activating pull mode on a link is refused
    /// when the upstream stage reports false (the default).
    fn supports_pull(&self) -> bool {
        false
    }

    /// Perform one lifecycle transition.
    fn change_state(&mut self, transition: Transition) -> StateChangeResult {
        let _ = transition;
        StateChangeResult::Success
    }

    /// Create a pad from the request template named `template`.
    /// Returns the template to instantiate, or `None` when unsupported.
    fn request_pad(&mut self, template: &str) -> Option<PadTemplate> {
        let _ = template;
        None
    }

    /// End of stream arrived on sink pad `pad`. Returning
    /// [`FlowResult::Eos`] (the default) lets the node forward EOS
    /// downstream, or post it on the bus for a stage with no source
    /// pads. Stages that queue EOS for later forwarding return
    /// [`FlowResult::Ok`] instead.
    fn end_of_stream(&mut self, pad: &str) -> FlowResult {
        let _ = pad;
        FlowResult::Eos
    }

    /// Discard buffered data. Called on flush and on downward state
    /// changes out of Paused.
    fn flush(&mut self) {}

    /// Whether this stage produces data that only exists at capture time
    /// (cannot preroll in Paused).
    fn is_live(&self) -> bool {
        false
    }

    /// Whether the stage can adopt a new format mid-stream.
    fn supports_renegotiation(&self) -> bool {
        false
    }

    /// Called once when the stage is wrapped in a node; gives the stage
    /// its handle back into the engine.
    fn attach(&mut self, ctx: StageContext) {
        let _ = ctx;
    }
}

// ============================================================================
// Node control block
// ============================================================================

#[derive(Debug)]
struct ControlInner {
    target: State,
    flushing: bool,
}

/// State-intent shared between the node's control side and its streaming
/// side without going through the stage lock. This is what lets a stage
/// block inside `process` (preroll, full queue) and still be woken by a
/// state change or flush.
#[derive(Debug)]
struct NodeControl {
    inner: Mutex<ControlInner>,
    cond: Condvar,
}

impl NodeControl {
    fn new() -> Self {
        Self {
            inner: Mutex::new(ControlInner {
                target: State::Null,
                flushing: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn target(&self) -> State {
        self.inner.lock().unwrap().target
    }

    fn set_target(&self, target: State) {
        self.inner.lock().unwrap().target = target;
        self.cond.notify_all();
    }

    fn set_flushing(&self, flushing: bool) {
        self.inner.lock().unwrap().flushing = flushing;
        self.cond.notify_all();
    }

    /// Block until the node is headed for Playing or flushing starts.
    /// True means go ahead and render.
    fn park_until_playing(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        while inner.target < State::Playing && !inner.flushing {
            inner = self.cond.wait(inner).unwrap();
        }
        !inner.flushing
    }
}

// ============================================================================
// StageContext
// ============================================================================

type FlushHandler = Box<dyn Fn(bool) + Send + Sync>;
type CommitHook = Box<dyn Fn(State) + Send + Sync>;

/// A stage's handle back into the engine.
///
/// Cloneable; a stage typically stores it in [`Stage::attach`] and uses
/// it from `process`/`produce` and its streaming threads.
#[derive(Clone)]
pub struct StageContext {
    node: Weak<StageNode>,
    name: String,
}

impl StageContext {
    /// The owning stage's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Push a buffer on the stage's own source pad `pad`.
    pub fn push(&self, pad: &str, buffer: Buffer) -> FlowResult {
        match self.node.upgrade().and_then(|n| n.find_pad(pad)) {
            Some(p) => p.push(buffer),
            None => FlowResult::NotLinked,
        }
    }

    /// Signal end of stream on the stage's own source pad `pad`.
    pub fn push_eos(&self, pad: &str) -> FlowResult {
        match self.node.upgrade().and_then(|n| n.find_pad(pad)) {
            Some(p) => p.push_eos(),
            None => FlowResult::NotLinked,
        }
    }

    /// Post a message on the bus.
    pub fn post(&self, kind: MessageKind) {
        if let Some(node) = self.node.upgrade() {
            node.bus.post(&node.name, kind);
        }
    }

    /// Post an error message on the bus.
    pub fn post_error(&self, message: impl Into<String>) {
        self.post(MessageKind::Error {
            message: message.into(),
        });
    }

    /// Complete a previously [`StateChangeResult::Async`] transition:
    /// commit `to` as the stage's state, post `StateChanged`, and resume
    /// any interrupted walk towards a higher target.
    pub fn commit_state(&self, to: State) {
        if let Some(node) = self.node.upgrade() {
            node.commit_state(to);
        }
    }

    /// The stage's committed state.
    pub fn current_state(&self) -> State {
        self.node
            .upgrade()
            .map(|n| n.tracker.current())
            .unwrap_or(State::Null)
    }

    /// The caps negotiated on the stage's pad `pad`, if any.
    pub fn negotiated_caps(&self, pad: &str) -> Option<Arc<Caps>> {
        self.node
            .upgrade()
            .and_then(|n| n.find_pad(pad))
            .and_then(|p| p.negotiated_caps())
    }

    /// Block until the node is headed for Playing. Returns false when
    /// flushing or shutting down instead; the caller should give the
    /// buffer up and return [`FlowResult::Flushing`].
    ///
    /// This is the preroll primitive for sinks: safe to call while
    /// blocked inside [`Stage::process`].
    pub fn park_until_playing(&self) -> bool {
        match self.node.upgrade() {
            Some(node) => node.control.park_until_playing(),
            None => false,
        }
    }

    /// Register a handler invoked with `true` when the node starts
    /// flushing (flush event or downward state change) and `false` when
    /// flushing stops. The handler runs outside the stage lock, so a
    /// stage blocked in `process` can be woken by it.
    pub fn set_flush_handler(&self, handler: FlushHandler) {
        if let Some(node) = self.node.upgrade() {
            *node.flush_handler.lock().unwrap() = Some(handler);
        }
    }
}

impl fmt::Debug for StageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("name", &self.name)
            .finish()
    }
}

// ============================================================================
// StageNode
// ============================================================================

/// A stage mounted in the engine: the stage itself, its pads, its state
/// machine position, its streaming thread and its bus handle.
pub struct StageNode {
    name: String,
    stage: Mutex<Box<dyn Stage>>,
    pads: Mutex<Vec<Arc<Pad>>>,
    request_pad_seq: AtomicUsize,
    tracker: StateTracker,
    transition: Mutex<()>,
    control: NodeControl,
    bus: Bus,
    flush_handler: Mutex<Option<FlushHandler>>,
    committed_hook: Mutex<Option<CommitHook>>,
    actor: Mutex<Option<JoinHandle<()>>>,
    actor_run: Arc<AtomicBool>,
}

impl StageNode {
    /// Mount `stage` under `name`, instantiating its always-present pads
    /// and handing it its [`StageContext`].
    pub fn new(name: impl Into<String>, stage: Box<dyn Stage>, bus: Bus) -> Arc<Self> {
        let name = name.into();
        let templates = stage.pad_templates();
        let node = Arc::new_cyclic(|weak: &Weak<StageNode>| {
            let pads = templates
                .iter()
                .filter(|t| t.presence == PadPresence::Always)
                .map(|t| Pad::new(t, t.name.clone(), weak.clone(), name.clone()))
                .collect();
            StageNode {
                name: name.clone(),
                stage: Mutex::new(stage),
                pads: Mutex::new(pads),
                request_pad_seq: AtomicUsize::new(0),
                tracker: StateTracker::new(),
                transition: Mutex::new(()),
                control: NodeControl::new(),
                bus,
                flush_handler: Mutex::new(None),
                committed_hook: Mutex::new(None),
                actor: Mutex::new(None),
                actor_run: Arc::new(AtomicBool::new(false)),
            }
        });
        let ctx = StageContext {
            node: Arc::downgrade(&node),
            name: node.name.clone(),
        };
        node.stage.lock().unwrap().attach(ctx);
        node
    }

    /// The stage's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bus this node posts to.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Find a pad by name.
    pub fn find_pad(&self, name: &str) -> Option<Arc<Pad>> {
        self.pads
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    /// All pads, in creation order.
    pub fn pads(&self) -> Vec<Arc<Pad>> {
        self.pads.lock().unwrap().clone()
    }

    /// The source pads.
    pub fn source_pads(&self) -> Vec<Arc<Pad>> {
        self.pads
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.direction() == PadDirection::Source)
            .cloned()
            .collect()
    }

    /// The sink pads.
    pub fn sink_pads(&self) -> Vec<Arc<Pad>> {
        self.pads
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.direction() == PadDirection::Sink)
            .cloned()
            .collect()
    }

    /// Whether this stage only produces (no sink pads). Such stages get
    /// a streaming thread driving [`Stage::produce`].
    pub fn is_source(&self) -> bool {
        let pads = self.pads.lock().unwrap();
        pads.iter().any(|p| p.direction() == PadDirection::Source)
            && !pads.iter().any(|p| p.direction() == PadDirection::Sink)
    }

    /// Instantiate a pad from the stage's request template `template`.
    /// `%u` in the template name is replaced with a running number.
    pub fn request_pad(self: &Arc<Self>, template: &str) -> Option<Arc<Pad>> {
        let tmpl = self.stage.lock().unwrap().request_pad(template)?;
        let seq = self.request_pad_seq.fetch_add(1, Ordering::Relaxed);
        let name = tmpl.name.replace("%u", &seq.to_string());
        let pad = Pad::new(&tmpl, name, Arc::downgrade(self), self.name.clone());
        self.pads.lock().unwrap().push(pad.clone());
        Some(pad)
    }

    pub(crate) fn set_committed_hook(&self, hook: CommitHook) {
        *self.committed_hook.lock().unwrap() = Some(hook);
    }

    // ========================================================================
    // State handling
    // ========================================================================

    /// The committed state.
    pub fn current_state(&self) -> State {
        self.tracker.current()
    }

    /// Target of an in-flight async state change, if any.
    pub fn pending_state(&self) -> Option<State> {
        self.tracker.pending()
    }

    /// Wait until no state change is pending, up to `timeout`.
    pub fn get_state(&self, timeout: Duration) -> Result<StateSnapshot, StateChangeError> {
        self.tracker.wait_for(&self.name, timeout)
    }

    /// Request a state change towards `target`, walking through the
    /// intermediate states one transition at a time.
    ///
    /// Returns the aggregated result of the steps taken. A concurrent
    /// request on the same node fails with
    /// [`StateChangeError::TransitionInProgress`], leaving the state
    /// untouched.
    pub fn set_state(self: &Arc<Self>, target: State) -> Result<StateChangeResult, StateChangeError> {
        let _guard = self
            .transition
            .try_lock()
            .map_err(|_| StateChangeError::TransitionInProgress {
                stage: self.name.clone(),
            })?;

        // Publish the intent first: parked streaming threads check it.
        self.control.set_target(target);

        let mut current = self.tracker.current();
        if let Some(pending) = self.tracker.pending() {
            if target >= pending {
                // An async change towards this target is already in
                // flight; the commit will resume the walk.
                return Ok(StateChangeResult::Async);
            }
            // Downward past a pending upward change: abandon the pending
            // state and walk down from the committed one.
            tracing::debug!(stage = %self.name, %pending, "cancelling pending state");
        }

        if current == target {
            return Ok(if self.tracker.is_no_preroll() && target == State::Paused {
                StateChangeResult::NoPreroll
            } else {
                StateChangeResult::Success
            });
        }

        let mut overall = StateChangeResult::Success;
        while current != target {
            let next = current.step_towards(target);
            let transition = match Transition::between(current, next) {
                Some(t) => t,
                None => break,
            };
            self.pre_transition(transition);

            let result = self.stage.lock().unwrap().change_state(transition);
            tracing::debug!(stage = %self.name, %transition, ?result, "transition");
            match result {
                StateChangeResult::Failure => {
                    self.tracker.record(next, StateChangeResult::Failure);
                    self.bus.post(
                        &self.name,
                        MessageKind::Error {
                            message: format!("state change {transition} failed"),
                        },
                    );
                    return Err(StateChangeError::Failed {
                        stage: self.name.clone(),
                        transition,
                    });
                }
                StateChangeResult::Async => {
                    self.tracker.record(next, StateChangeResult::Async);
                    self.post_transition(transition);
                    return Ok(StateChangeResult::Async);
                }
                StateChangeResult::NoPreroll => {
                    self.tracker.record(next, StateChangeResult::NoPreroll);
                    self.post_state_changed(current, next);
                    overall = StateChangeResult::NoPreroll;
                }
                StateChangeResult::Success => {
                    self.tracker.record(next, StateChangeResult::Success);
                    self.post_state_changed(current, next);
                    if self.tracker.is_no_preroll() {
                        overall = StateChangeResult::NoPreroll;
                    }
                }
            }
            self.post_transition(transition);
            current = next;
        }
        Ok(overall)
    }

    /// Node side effects before the stage sees the transition.
    fn pre_transition(self: &Arc<Self>, transition: Transition) {
        match transition {
            Transition::ReadyToPaused => {
                self.control.set_flushing(false);
                self.run_flush_handler(false);
                for pad in self.pads() {
                    pad.set_flushing(false);
                }
            }
            Transition::PausedToReady => {
                // Unblock anything waiting in the streaming path before
                // taking the stage lock for the callback.
                self.actor_run.store(false, Ordering::Release);
                self.control.set_flushing(true);
                self.run_flush_handler(true);
                for pad in self.pads() {
                    pad.set_flushing(true);
                }
            }
            _ => {}
        }
    }

    /// Node side effects after the stage performed the transition.
    fn post_transition(self: &Arc<Self>, transition: Transition) {
        match transition {
            Transition::ReadyToPaused => {
                if self.is_source() {
                    self.spawn_actor();
                }
            }
            Transition::PausedToReady => {
                self.join_actor();
            }
            _ => {}
        }
    }

    fn post_state_changed(&self, old: State, new: State) {
        self.bus.post(
            &self.name,
            MessageKind::StateChanged {
                old,
                new,
                pending: self.tracker.pending(),
            },
        );
    }

    /// Commit a pending async change and resume the walk towards the
    /// node's target if it lies beyond `to`.
    pub fn commit_state(self: &Arc<Self>, to: State) {
        let old = self.tracker.current();
        self.tracker.commit(to);
        tracing::debug!(stage = %self.name, state = %to, "async state committed");
        self.post_state_changed(old, to);
        if let Some(hook) = &*self.committed_hook.lock().unwrap() {
            hook(to);
        }
        let target = self.control.target();
        if target > to {
            // Resuming needs the stage lock; the committing thread may be
            // inside `process` holding it, so continue from a fresh
            // thread.
            let node = self.clone();
            std::thread::spawn(move || {
                if let Err(err) = node.set_state(target) {
                    tracing::warn!(stage = %node.name, %err, "async continuation failed");
                }
            });
        }
    }

    fn run_flush_handler(&self, flushing: bool) {
        if let Some(handler) = &*self.flush_handler.lock().unwrap() {
            handler(flushing);
        }
    }

    pub(crate) fn supports_renegotiation(&self) -> bool {
        self.stage.lock().unwrap().supports_renegotiation()
    }

    pub(crate) fn supports_pull(&self) -> bool {
        self.stage.lock().unwrap().supports_pull()
    }

    pub(crate) fn accepts_format(&self, pad: &str, caps: &Caps) -> bool {
        self.stage.lock().unwrap().set_format(pad, caps)
    }

    pub(crate) fn counter_format(&self, pad: &str, offered: &Caps) -> Option<Caps> {
        self.stage.lock().unwrap().propose_format(pad, offered)
    }

    // ========================================================================
    // Data plane entry points (called from pads)
    // ========================================================================

    pub(crate) fn handle_buffer(self: &Arc<Self>, pad: &str, buffer: Buffer) -> FlowResult {
        self.stage.lock().unwrap().process(pad, buffer)
    }

    pub(crate) fn handle_eos(self: &Arc<Self>, pad: &str) -> FlowResult {
        let result = self.stage.lock().unwrap().end_of_stream(pad);
        if result == FlowResult::Eos {
            let sources = self.source_pads();
            if sources.is_empty() {
                self.bus.post(&self.name, MessageKind::Eos);
            } else {
                for p in sources {
                    p.push_eos();
                }
            }
            return FlowResult::Ok;
        }
        result
    }

    pub(crate) fn handle_pull(&self, offset: u64, size: usize) -> Result<Buffer, FlowResult> {
        self.stage.lock().unwrap().pull_range(offset, size)
    }

    pub(crate) fn handle_flush_start(self: &Arc<Self>, _pad: &str) {
        self.control.set_flushing(true);
        self.run_flush_handler(true);
        self.stage.lock().unwrap().flush();
        for p in self.source_pads() {
            p.flush_start();
        }
    }

    pub(crate) fn handle_flush_stop(self: &Arc<Self>, _pad: &str) {
        self.control.set_flushing(false);
        self.run_flush_handler(false);
        for p in self.source_pads() {
            p.flush_stop();
        }
    }

    pub(crate) fn post_error(&self, message: impl Into<String>) {
        self.bus.post(
            &self.name,
            MessageKind::Error {
                message: message.into(),
            },
        );
    }

    // ========================================================================
    // Streaming thread
    // ========================================================================

    fn spawn_actor(self: &Arc<Self>) {
        let mut slot = self.actor.lock().unwrap();
        if slot.is_some() {
            return;
        }
        self.actor_run.store(true, Ordering::Release);
        let node = self.clone();
        let run = self.actor_run.clone();
        *slot = Some(std::thread::spawn(move || actor_loop(node, run)));
    }

    fn join_actor(&self) {
        self.actor_run.store(false, Ordering::Release);
        if let Some(handle) = self.actor.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl fmt::Debug for StageNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageNode")
            .field("name", &self.name)
            .field("state", &self.tracker.current())
            .finish()
    }
}

impl Drop for StageNode {
    fn drop(&mut self) {
        self.actor_run.store(false, Ordering::Release);
        self.control.set_flushing(true);
        if let Some(handle) = self.actor.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// Drive a producing stage: ask for output, push it on the source pads,
/// stop on EOS or fatal flow results.
fn actor_loop(node: Arc<StageNode>, run: Arc<AtomicBool>) {
    tracing::debug!(stage = %node.name, "streaming thread started");
    while run.load(Ordering::Acquire) {
        let produced = {
            let mut stage = node.stage.lock().unwrap();
            if stage.is_live() && node.tracker.current() < State::Playing {
                // Live data only exists while playing.
                Produced::Idle
            } else {
                stage.produce()
            }
        };
        match produced {
            Produced::Buffer(buffer) => {
                let mut result = FlowResult::Ok;
                for pad in node.source_pads() {
                    result = pad.push(buffer.clone());
                    if !result.is_ok() {
                        break;
                    }
                }
                match result {
                    FlowResult::Ok => {}
                    FlowResult::Flushing => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    FlowResult::Eos | FlowResult::NotLinked => {
                        tracing::debug!(stage = %node.name, %result, "production stopped");
                        break;
                    }
                    fatal => {
                        tracing::error!(stage = %node.name, result = %fatal, "fatal flow result");
                        node.post_error(format!("data flow failed: {fatal}"));
                        break;
                    }
                }
            }
            Produced::Eos => {
                for pad in node.source_pads() {
                    pad.push_eos();
                }
                break;
            }
            Produced::Idle => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Produced::Error(message) => {
                node.post_error(message);
                break;
            }
        }
    }
    tracing::debug!(stage = %node.name, "streaming thread stopped");
}
