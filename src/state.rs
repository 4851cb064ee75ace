//! Lifecycle states and state tracking.
//!
//! Every stage and every pipeline moves through four ordered states:
//! Null, Ready, Paused, Playing. A requested change always walks through
//! the intermediate states one [`Transition`] at a time, so a stage only
//! ever observes adjacent-state transitions.
//!
//! A transition may complete asynchronously: the stage returns
//! [`StateChangeResult::Async`] and commits the state later (typically
//! when the first buffer arrives at a sink). [`StateTracker`] holds the
//! (result, current, pending) triple and lets callers wait for the
//! pending state to resolve.

use crate::error::StateChangeError;
use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Lifecycle state of a stage or pipeline.
///
/// Ordered: `Null < Ready < Paused < Playing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    /// Initial and final state. No resources held.
    Null,
    /// Resources allocated (devices probed, files checked), no data flow.
    Ready,
    /// Data can flow but the clock does not advance; sinks hold the first
    /// buffer without rendering (preroll).
    Paused,
    /// Data flows and is rendered against the clock.
    Playing,
}

impl State {
    /// The state one step closer to `target`, or `self` when already there.
    pub fn step_towards(self, target: State) -> State {
        use State::*;
        match (self.cmp(&target), self) {
            (std::cmp::Ordering::Equal, _) => self,
            (std::cmp::Ordering::Less, Null) => Ready,
            (std::cmp::Ordering::Less, Ready) => Paused,
            (std::cmp::Ordering::Less, _) => Playing,
            (std::cmp::Ordering::Greater, Playing) => Paused,
            (std::cmp::Ordering::Greater, Paused) => Ready,
            (std::cmp::Ordering::Greater, _) => Null,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Null => "null",
            State::Ready => "ready",
            State::Paused => "paused",
            State::Playing => "playing",
        };
        write!(f, "{s}")
    }
}

/// A single step between adjacent states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    /// Null to Ready: allocate resources.
    NullToReady,
    /// Ready to Paused: open data flow, start preroll.
    ReadyToPaused,
    /// Paused to Playing: start the clock, render.
    PausedToPlaying,
    /// Playing to Paused: stop the clock, keep flow open.
    PlayingToPaused,
    /// Paused to Ready: close data flow, keep resources.
    PausedToReady,
    /// Ready to Null: release resources.
    ReadyToNull,
}

impl Transition {
    /// The transition between two adjacent states, if they are adjacent.
    pub fn between(from: State, to: State) -> Option<Transition> {
        use State::*;
        match (from, to) {
            (Null, Ready) => Some(Transition::NullToReady),
            (Ready, Paused) => Some(Transition::ReadyToPaused),
            (Paused, Playing) => Some(Transition::PausedToPlaying),
            (Playing, Paused) => Some(Transition::PlayingToPaused),
            (Paused, Ready) => Some(Transition::PausedToReady),
            (Ready, Null) => Some(Transition::ReadyToNull),
            _ => None,
        }
    }

    /// State this transition starts from.
    pub fn current(self) -> State {
        match self {
            Transition::NullToReady => State::Null,
            Transition::ReadyToPaused => State::Ready,
            Transition::PausedToPlaying => State::Paused,
            Transition::PlayingToPaused => State::Playing,
            Transition::PausedToReady => State::Paused,
            Transition::ReadyToNull => State::Ready,
        }
    }

    /// State this transition ends at.
    pub fn next(self) -> State {
        match self {
            Transition::NullToReady => State::Ready,
            Transition::ReadyToPaused => State::Paused,
            Transition::PausedToPlaying => State::Playing,
            Transition::PlayingToPaused => State::Paused,
            Transition::PausedToReady => State::Ready,
            Transition::ReadyToNull => State::Null,
        }
    }

    /// Whether this transition moves towards Playing.
    pub fn is_upward(self) -> bool {
        self.next() > self.current()
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.current(), self.next())
    }
}

/// Outcome of a state change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChangeResult {
    /// The state change completed.
    Success,
    /// The state change will complete later; the new state is pending.
    Async,
    /// The state change completed, but the stage is live and cannot
    /// preroll in Paused. Callers should not wait for preroll.
    NoPreroll,
    /// The state change failed.
    Failure,
}

/// Snapshot of a tracker: last result, committed state, pending target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    /// Result of the most recent transition step.
    pub result: StateChangeResult,
    /// The committed state.
    pub current: State,
    /// Target of an in-flight async change, if any.
    pub pending: Option<State>,
}

#[derive(Debug)]
struct TrackerInner {
    result: StateChangeResult,
    current: State,
    pending: Option<State>,
    no_preroll: bool,
}

/// Thread-safe (result, current, pending) triple with wait support.
///
/// One tracker per stage node and one per pipeline. Writers commit under
/// the lock and notify; [`StateTracker::wait_for`] blocks until the
/// pending state resolves or the deadline passes.
#[derive(Debug)]
pub struct StateTracker {
    inner: Mutex<TrackerInner>,
    resolved: Condvar,
}

impl StateTracker {
    /// New tracker starting at [`State::Null`].
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                result: StateChangeResult::Success,
                current: State::Null,
                pending: None,
                no_preroll: false,
            }),
            resolved: Condvar::new(),
        }
    }

    /// Snapshot of the triple.
    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.lock().unwrap();
        StateSnapshot {
            result: inner.result,
            current: inner.current,
            pending: inner.pending,
        }
    }

    /// The committed state.
    pub fn current(&self) -> State {
        self.inner.lock().unwrap().current
    }

    /// Target of an in-flight async change, if any.
    pub fn pending(&self) -> Option<State> {
        self.inner.lock().unwrap().pending
    }

    /// Whether the stage reported [`StateChangeResult::NoPreroll`] on its
    /// last upward change into Paused. Sticky until the stage leaves
    /// Paused downward.
    pub fn is_no_preroll(&self) -> bool {
        self.inner.lock().unwrap().no_preroll
    }

    /// Record the outcome of one transition step.
    ///
    /// `Success` and `NoPreroll` commit `to` immediately. `Async` leaves
    /// the current state and marks `to` pending. `Failure` clears any
    /// pending state without committing.
    pub fn record(&self, to: State, result: StateChangeResult) {
        let mut inner = self.inner.lock().unwrap();
        inner.result = result;
        match result {
            StateChangeResult::Success => {
                inner.current = to;
                inner.pending = None;
                if to < State::Paused {
                    inner.no_preroll = false;
                }
            }
            StateChangeResult::NoPreroll => {
                inner.current = to;
                inner.pending = None;
                inner.no_preroll = true;
            }
            StateChangeResult::Async => {
                // The commit may already have raced in; do not resurrect
                // a resolved pending state.
                if inner.current < to {
                    inner.pending = Some(to);
                }
            }
            StateChangeResult::Failure => {
                inner.pending = None;
            }
        }
        drop(inner);
        self.resolved.notify_all();
    }

    /// Commit a previously async change to `to`.
    pub fn commit(&self, to: State) {
        let mut inner = self.inner.lock().unwrap();
        inner.current = to;
        inner.pending = None;
        inner.result = StateChangeResult::Success;
        drop(inner);
        self.resolved.notify_all();
    }

    /// Commit a previously async change to `to`, only if it is still the
    /// pending state. Returns whether this call performed the commit, so
    /// racing committers resolve to exactly one winner.
    pub fn commit_if_pending(&self, to: State) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.pending != Some(to) {
            return false;
        }
        inner.current = to;
        inner.pending = None;
        inner.result = StateChangeResult::Success;
        drop(inner);
        self.resolved.notify_all();
        true
    }

    /// Block until no change is pending, up to `timeout`.
    ///
    /// Returns the final snapshot, or [`StateChangeError::Timeout`] when
    /// the pending state did not resolve in time.
    pub fn wait_for(
        &self,
        stage: &str,
        timeout: Duration,
    ) -> Result<StateSnapshot, StateChangeError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        while inner.pending.is_some() {
            let now = Instant::now();
            if now >= deadline {
                return Err(StateChangeError::Timeout {
                    stage: stage.to_string(),
                    target: inner.pending.unwrap(),
                });
            }
            let (guard, _) = self
                .resolved
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
        }
        Ok(StateSnapshot {
            result: inner.result,
            current: inner.current,
            pending: inner.pending,
        })
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_state_ordering() {
        assert!(State::Null < State::Ready);
        assert!(State::Ready < State::Paused);
        assert!(State::Paused < State::Playing);
    }

    #[test]
    fn test_step_towards_walks_one_state() {
        assert_eq!(State::Null.step_towards(State::Playing), State::Ready);
        assert_eq!(State::Ready.step_towards(State::Playing), State::Paused);
        assert_eq!(State::Playing.step_towards(State::Null), State::Paused);
        assert_eq!(State::Paused.step_towards(State::Paused), State::Paused);
    }

    #[test]
    fn test_transition_between_adjacent_only() {
        assert_eq!(
            Transition::between(State::Null, State::Ready),
            Some(Transition::NullToReady)
        );
        assert_eq!(Transition::between(State::Null, State::Playing), None);
        assert_eq!(Transition::between(State::Ready, State::Ready), None);
    }

    #[test]
    fn test_tracker_async_then_commit() {
        let tracker = StateTracker::new();
        tracker.record(State::Ready, StateChangeResult::Success);
        tracker.record(State::Paused, StateChangeResult::Async);

        let snap = tracker.snapshot();
        assert_eq!(snap.current, State::Ready);
        assert_eq!(snap.pending, Some(State::Paused));

        tracker.commit(State::Paused);
        let snap = tracker.snapshot();
        assert_eq!(snap.current, State::Paused);
        assert_eq!(snap.pending, None);
    }

    #[test]
    fn test_commit_if_pending_only_once() {
        let tracker = StateTracker::new();
        tracker.record(State::Ready, StateChangeResult::Success);
        tracker.record(State::Paused, StateChangeResult::Async);

        assert!(tracker.commit_if_pending(State::Paused));
        assert!(!tracker.commit_if_pending(State::Paused));
        assert_eq!(tracker.current(), State::Paused);
        assert_eq!(tracker.pending(), None);
    }

    #[test]
    fn test_no_preroll_sticky_until_downward() {
        let tracker = StateTracker::new();
        tracker.record(State::Ready, StateChangeResult::Success);
        tracker.record(State::Paused, StateChangeResult::NoPreroll);
        assert!(tracker.is_no_preroll());

        tracker.record(State::Playing, StateChangeResult::Success);
        assert!(tracker.is_no_preroll());

        tracker.record(State::Paused, StateChangeResult::NoPreroll);
        tracker.record(State::Ready, StateChangeResult::Success);
        assert!(!tracker.is_no_preroll());
    }

    #[test]
    fn test_wait_for_resolves_from_other_thread() {
        let tracker = Arc::new(StateTracker::new());
        tracker.record(State::Ready, StateChangeResult::Success);
        tracker.record(State::Paused, StateChangeResult::Async);

        let waiter = {
            let tracker = tracker.clone();
            thread::spawn(move || tracker.wait_for("t", Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        tracker.commit(State::Paused);

        let snap = waiter.join().unwrap().unwrap();
        assert_eq!(snap.current, State::Paused);
    }

    #[test]
    fn test_wait_for_times_out() {
        let tracker = StateTracker::new();
        tracker.record(State::Ready, StateChangeResult::Async);
        let err = tracker.wait_for("t", Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, StateChangeError::Timeout { .. }));
    }
}
