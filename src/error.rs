//! Error types for Aqueduct.

use crate::state::{State, Transition};
use thiserror::Error;

/// Result type alias using Aqueduct's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Aqueduct operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Format negotiation failed on a link.
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    /// Linking two pads failed.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// A state transition failed.
    #[error(transparent)]
    StateChange(#[from] StateChangeError),

    /// A queue rejected data under a non-blocking overflow policy.
    #[error(transparent)]
    QueueOverflow(#[from] QueueOverflow),

    /// A stage was not found by name.
    #[error("stage not found: {0}")]
    StageNotFound(String),

    /// A stage with this name already exists in the pipeline.
    #[error("duplicate stage name: {0}")]
    DuplicateStage(String),

    /// A pad was not found on a stage.
    #[error("pad not found: {0}")]
    PadNotFound(String),

    /// I/O error (spill files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error during format negotiation on a link.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// No common format between the linked pads.
    #[error("no common format between {src} and {sink}: {explanation}")]
    NoCommonFormat {
        /// Full name of the upstream (source) pad.
        src: String,
        /// Full name of the downstream (sink) pad.
        sink: String,
        /// Detailed explanation.
        explanation: String,
    },

    /// Downstream rejected every proposal within the round limit.
    #[error("negotiation between {src} and {sink} did not converge after {rounds} rounds")]
    NoConvergence {
        /// Full name of the upstream (source) pad.
        src: String,
        /// Full name of the downstream (sink) pad.
        sink: String,
        /// Number of rounds attempted.
        rounds: usize,
    },

    /// A counter-proposal was not a subset of the previous round's caps.
    #[error("counter-proposal from {sink} widens the negotiated caps (must be a subset)")]
    WidenedCounterProposal {
        /// Full name of the downstream (sink) pad that countered.
        sink: String,
    },

    /// Cannot fixate the intersection to a concrete format.
    #[error("cannot fixate caps for link {src} -> {sink}: {reason}")]
    CannotFixate {
        /// Full name of the upstream (source) pad.
        src: String,
        /// Full name of the downstream (sink) pad.
        sink: String,
        /// Reason for failure.
        reason: String,
    },

    /// Mid-stream format change requested but a pad does not support it.
    #[error("renegotiation not supported on link {src} -> {sink}")]
    RenegotiationUnsupported {
        /// Full name of the upstream (source) pad.
        src: String,
        /// Full name of the downstream (sink) pad.
        sink: String,
    },
}

/// Error establishing or tearing down a link between two pads.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    /// Both pads have the same direction.
    #[error("cannot link two {0} pads")]
    SameDirection(&'static str),

    /// A pad is already linked to another peer.
    #[error("pad {0} is already linked")]
    AlreadyLinked(String),

    /// The pads' template caps have no overlap.
    #[error("templates of {src} and {sink} have no common format")]
    Incompatible {
        /// Full name of the source pad.
        src: String,
        /// Full name of the sink pad.
        sink: String,
    },

    /// The pad is not linked.
    #[error("pad {0} is not linked")]
    NotLinked(String),

    /// Pull mode requested but the upstream stage cannot serve ranges.
    #[error("pull mode not supported by {src}")]
    PullUnsupported {
        /// Full name of the source pad.
        src: String,
    },
}

/// Error during a lifecycle state transition.
#[derive(Debug, Error)]
pub enum StateChangeError {
    /// The stage failed to perform a transition.
    #[error("stage {stage} failed transition {transition}")]
    Failed {
        /// Name of the failing stage.
        stage: String,
        /// The transition that failed.
        transition: Transition,
    },

    /// Another transition is already in flight on this stage.
    #[error("stage {stage} already has a transition in progress")]
    TransitionInProgress {
        /// Name of the busy stage.
        stage: String,
    },

    /// Waiting for an async transition timed out.
    #[error("timed out waiting for {stage} to reach {target:?}")]
    Timeout {
        /// Name of the pending stage.
        stage: String,
        /// The state that was awaited.
        target: State,
    },
}

/// A queue rejected or dropped data under a non-blocking overflow policy.
#[derive(Debug, Error)]
#[error("queue {queue} overflowed: {dropped} buffer(s) dropped")]
pub struct QueueOverflow {
    /// Name of the overflowing queue stage.
    pub queue: String,
    /// Number of buffers dropped so far.
    pub dropped: u64,
}
