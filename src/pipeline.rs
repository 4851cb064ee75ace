//! The pipeline: the container stages live in.
//!
//! A [`Pipeline`] owns a set of named [`StageNode`]s, the links between
//! their pads, one shared [`Bus`], and an aggregate state machine. A
//! state change request walks the pipeline through intermediate states
//! one step at a time; at each step every child is driven and the
//! results aggregate by severity (Failure over Async over NoPreroll over
//! Success).
//!
//! Every step drives children in reverse insertion order, so with the
//! usual source-to-sink add order the sinks change first: upward they
//! are ready to accept data before their upstreams start, downward they
//! release blocked producers before those producers are stopped.
//!
//! ```rust,ignore
//! let pipeline = Pipeline::new("player");
//! pipeline.add("src", TestSource::new(100))?;
//! pipeline.add("sink", CollectorSink::new())?;
//! pipeline.link_stages("src", "sink")?;
//! pipeline.set_state(State::Playing)?;
//! while let Some(msg) = pipeline.bus().poll(Duration::from_secs(1)) { /* .. */ }
//! ```

use crate::bus::{Bus, MessageKind};
use crate::error::{Error, Result, StateChangeError};
use crate::registry::StageRegistry;
use crate::stage::pad::{link, Link};
use crate::stage::{Stage, StageNode};
use crate::state::{State, StateChangeResult, StateSnapshot, StateTracker};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// A toplevel container of stages with a shared bus and an aggregate
/// state machine. Cheap to clone; clones share the same pipeline.
#[derive(Debug, Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

#[derive(Debug)]
struct PipelineInner {
    name: String,
    bus: Bus,
    children: Mutex<Vec<Arc<StageNode>>>,
    tracker: StateTracker,
    transition: Mutex<()>,
    target: Mutex<State>,
    registry: Option<StageRegistry>,
}

impl Pipeline {
    /// Create an empty pipeline.
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name, None)
    }

    /// Create an empty pipeline that can instantiate stages from
    /// `registry` via [`Pipeline::create`].
    pub fn with_registry(name: impl Into<String>, registry: StageRegistry) -> Self {
        Self::build(name, Some(registry))
    }

    fn build(name: impl Into<String>, registry: Option<StageRegistry>) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                name: name.into(),
                bus: Bus::new(),
                children: Mutex::new(Vec::new()),
                tracker: StateTracker::new(),
                transition: Mutex::new(()),
                target: Mutex::new(State::Null),
                registry,
            }),
        }
    }

    /// The pipeline's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The shared message bus.
    pub fn bus(&self) -> Bus {
        self.inner.bus.clone()
    }

    /// Add a stage under `name`.
    pub fn add(&self, name: impl Into<String>, stage: impl Stage + 'static) -> Result<Arc<StageNode>> {
        self.add_boxed(name, Box::new(stage))
    }

    /// Add an already-boxed stage under `name`.
    pub fn add_boxed(&self, name: impl Into<String>, stage: Box<dyn Stage>) -> Result<Arc<StageNode>> {
        let name = name.into();
        let mut children = self.inner.children.lock().unwrap();
        if children.iter().any(|c| c.name() == name) {
            return Err(Error::DuplicateStage(name));
        }
        let node = StageNode::new(name, stage, self.inner.bus.clone());
        let weak: Weak<PipelineInner> = Arc::downgrade(&self.inner);
        node.set_committed_hook(Box::new(move |_state| {
            if let Some(inner) = weak.upgrade() {
                inner.check_async_done();
            }
        }));
        children.push(node.clone());
        Ok(node)
    }

    /// Instantiate a stage type from the registry and add it.
    pub fn create(&self, stage_type: &str, name: impl Into<String>) -> Result<Arc<StageNode>> {
        let registry = self
            .inner
            .registry
            .as_ref()
            .ok_or_else(|| Error::StageNotFound(stage_type.to_string()))?;
        let stage = registry
            .create(stage_type)
            .ok_or_else(|| Error::StageNotFound(stage_type.to_string()))?;
        self.add_boxed(name, stage)
    }

    /// Look a stage up by name.
    pub fn get(&self, name: &str) -> Option<Arc<StageNode>> {
        self.inner
            .children
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// Link the "src" pad of `src` to the "sink" pad of `sink`.
    pub fn link_stages(&self, src: &str, sink: &str) -> Result<Link> {
        self.link_pads(src, "src", sink, "sink")
    }

    /// Link `src_pad` of stage `src` to `sink_pad` of stage `sink`.
    pub fn link_pads(
        &self,
        src: &str,
        src_pad: &str,
        sink: &str,
        sink_pad: &str,
    ) -> Result<Link> {
        let src_node = self
            .get(src)
            .ok_or_else(|| Error::StageNotFound(src.to_string()))?;
        let sink_node = self
            .get(sink)
            .ok_or_else(|| Error::StageNotFound(sink.to_string()))?;
        let src_pad = src_node
            .find_pad(src_pad)
            .ok_or_else(|| Error::PadNotFound(format!("{src}:{src_pad}")))?;
        let sink_pad = sink_node
            .find_pad(sink_pad)
            .ok_or_else(|| Error::PadNotFound(format!("{sink}:{sink_pad}")))?;
        Ok(link(&src_pad, &sink_pad)?)
    }

    /// Request a state change towards `target`.
    ///
    /// See the module docs for step aggregation. An Async result means
    /// the pipeline will keep moving towards `target` on its own as
    /// children commit; wait with [`Pipeline::get_state`].
    pub fn set_state(&self, target: State) -> std::result::Result<StateChangeResult, StateChangeError> {
        self.inner.set_state(target)
    }

    /// Wait until no pipeline state change is pending, up to `timeout`.
    pub fn get_state(&self, timeout: Duration) -> std::result::Result<StateSnapshot, StateChangeError> {
        self.inner.tracker.wait_for(&self.inner.name, timeout)
    }

    /// The pipeline's committed state.
    pub fn current_state(&self) -> State {
        self.inner.tracker.current()
    }
}

fn severity(result: StateChangeResult) -> u8 {
    match result {
        StateChangeResult::Success => 0,
        StateChangeResult::NoPreroll => 1,
        StateChangeResult::Async => 2,
        StateChangeResult::Failure => 3,
    }
}

impl PipelineInner {
    fn set_state(
        self: &Arc<Self>,
        target: State,
    ) -> std::result::Result<StateChangeResult, StateChangeError> {
        let _guard = self
            .transition
            .try_lock()
            .map_err(|_| StateChangeError::TransitionInProgress {
                stage: self.name.clone(),
            })?;
        *self.target.lock().unwrap() = target;

        let mut current = self.tracker.current();
        if let Some(pending) = self.tracker.pending() {
            if target >= pending {
                return Ok(StateChangeResult::Async);
            }
            tracing::debug!(pipeline = %self.name, %pending, "cancelling pending state");
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
            // Sinks first in both directions (with the usual
            // source-to-sink add order): upward so downstream is ready
            // before data starts, downward so consumers release blocked
            // producers before the producers are stopped.
            let mut children = self.children.lock().unwrap().clone();
            children.reverse();

            let mut aggregate = StateChangeResult::Success;
            for child in &children {
                let result = child.set_state(next)?;
                if severity(result) > severity(aggregate) {
                    aggregate = result;
                }
            }

            match aggregate {
                StateChangeResult::Success => {
                    self.tracker.record(next, StateChangeResult::Success);
                    self.post_state_changed(current, next);
                    if self.tracker.is_no_preroll() {
                        overall = StateChangeResult::NoPreroll;
                    }
                }
                StateChangeResult::NoPreroll => {
                    self.tracker.record(next, StateChangeResult::NoPreroll);
                    self.post_state_changed(current, next);
                    overall = StateChangeResult::NoPreroll;
                }
                StateChangeResult::Async => {
                    // Commit happens when the pending children report in,
                    // see check_async_done.
                    self.tracker.record(next, StateChangeResult::Async);
                    drop(_guard);
                    // A child may have committed before the pending state
                    // was recorded; re-check so its commit is not missed.
                    self.check_async_done();
                    return Ok(StateChangeResult::Async);
                }
                // Failures surface as errors from the child above.
                StateChangeResult::Failure => unreachable!("failures return early"),
            }
            current = next;
        }
        Ok(overall)
    }

    /// Called whenever a child commits an async state change: when every
    /// child reached the pipeline's pending state, commit it and resume
    /// the walk towards the stored target.
    fn check_async_done(self: &Arc<Self>) {
        let pending = match self.tracker.pending() {
            Some(p) => p,
            None => return,
        };
        let children = self.children.lock().unwrap().clone();
        let all_there = children
            .iter()
            .all(|c| c.pending_state().is_none() && c.current_state() >= pending);
        if !all_there {
            return;
        }

        let old = self.tracker.current();
        // Two children may report in at once; only one caller commits.
        if !self.tracker.commit_if_pending(pending) {
            return;
        }
        tracing::debug!(pipeline = %self.name, state = %pending, "async state committed");
        self.post_state_changed(old, pending);

        let target = *self.target.lock().unwrap();
        if target > pending {
            let inner = self.clone();
            std::thread::spawn(move || {
                if let Err(err) = inner.set_state(target) {
                    tracing::warn!(pipeline = %inner.name, %err, "async continuation failed");
                }
            });
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
}

impl Drop for PipelineInner {
    fn drop(&mut self) {
        // Streaming threads hold their nodes alive; tear them down.
        let children = self.children.lock().unwrap().clone();
        for child in children.iter().rev() {
            if let Err(err) = child.set_state(State::Null) {
                tracing::warn!(stage = %child.name(), %err, "shutdown state change failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{CollectorSink, TestSource};

    #[test]
    fn test_add_and_lookup() {
        let pipeline = Pipeline::new("p");
        pipeline.add("src", TestSource::new(1)).unwrap();
        assert!(pipeline.get("src").is_some());
        assert!(pipeline.get("nope").is_none());
        assert!(matches!(
            pipeline.add("src", TestSource::new(1)).unwrap_err(),
            Error::DuplicateStage(_)
        ));
    }

    #[test]
    fn test_link_stages_by_name() {
        let pipeline = Pipeline::new("p");
        pipeline.add("src", TestSource::new(1)).unwrap();
        pipeline.add("sink", CollectorSink::new()).unwrap();
        let link = pipeline.link_stages("src", "sink").unwrap();
        assert!(link.caps().is_none());

        assert!(matches!(
            pipeline.link_stages("src", "missing").unwrap_err(),
            Error::StageNotFound(_)
        ));
    }

    #[test]
    fn test_state_walk_without_data() {
        let pipeline = Pipeline::new("p");
        pipeline
            .add("sink", CollectorSink::new().preroll(false))
            .unwrap();
        assert_eq!(
            pipeline.set_state(State::Playing).unwrap(),
            StateChangeResult::Success
        );
        assert_eq!(pipeline.current_state(), State::Playing);
        pipeline.set_state(State::Null).unwrap();
        assert_eq!(pipeline.current_state(), State::Null);
    }
}
