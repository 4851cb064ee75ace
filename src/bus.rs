//! Message bus for out-of-band delivery from streaming threads.
//!
//! Stages post [`Message`]s (errors, warnings, state changes, end of
//! stream) from their streaming threads; the application drains them from
//! its own thread via [`Bus::poll`] or [`Bus::try_pop`]. Delivery
//! preserves per-producer order; messages from different producers may
//! interleave.
//!
//! ```rust
//! use aqueduct::bus::{Bus, MessageKind};
//!
//! let bus = Bus::new();
//! bus.post("src", MessageKind::Eos);
//! let msg = bus.try_pop().unwrap();
//! assert_eq!(msg.source, "src");
//! assert!(matches!(msg.kind, MessageKind::Eos));
//! ```

use crate::state::State;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Bus construction options.
#[derive(Debug, Clone, Default)]
pub struct BusConfig {
    /// Maximum queued messages. `None` means unbounded. When the bound is
    /// reached, further posts are dropped with a warning.
    pub capacity: Option<usize>,
}

/// Payload of a bus message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    /// A fatal error occurred in a stage. Data flow from the posting
    /// stage has stopped.
    Error {
        /// Human-readable description.
        message: String,
    },
    /// A non-fatal problem worth surfacing.
    Warning {
        /// Human-readable description.
        message: String,
    },
    /// A stage or the pipeline committed a state change.
    StateChanged {
        /// State before the change.
        old: State,
        /// Committed state.
        new: State,
        /// Target still pending after this commit, if any.
        pending: Option<State>,
    },
    /// End of stream reached all sinks.
    Eos,
    /// Stage-defined message.
    Custom {
        /// Message name.
        name: String,
        /// Free-form detail.
        detail: String,
    },
}

/// A message travelling on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Name of the stage (or "pipeline") that posted this.
    pub source: String,
    /// The payload.
    pub kind: MessageKind,
}

/// The bus itself. Cheap to clone; all clones share one queue.
///
/// Posting never blocks. Popping from multiple threads is allowed but
/// each message is delivered to exactly one popper.
#[derive(Debug, Clone)]
pub struct Bus {
    tx: Sender<Message>,
    rx: Receiver<Message>,
    flushing: Arc<AtomicBool>,
}

impl Bus {
    /// Create an unbounded bus.
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    /// Create a bus with explicit options.
    pub fn with_config(config: BusConfig) -> Self {
        let (tx, rx) = match config.capacity {
            Some(cap) => bounded(cap),
            None => unbounded(),
        };
        Self {
            tx,
            rx,
            flushing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Post a message. Never blocks; the message is dropped when the bus
    /// is flushing or a bounded bus is full.
    pub fn post(&self, source: impl Into<String>, kind: MessageKind) {
        let msg = Message {
            source: source.into(),
            kind,
        };
        if self.flushing.load(Ordering::Acquire) {
            tracing::debug!(source = %msg.source, "bus flushing, message dropped");
            return;
        }
        tracing::debug!(source = %msg.source, kind = ?msg.kind, "bus message");
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                tracing::warn!(source = %msg.source, "bus full, message dropped");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Start flushing: queued messages are discarded and further posts
    /// are dropped until [`Bus::stop_flushing`].
    pub fn set_flushing(&self) {
        self.flushing.store(true, Ordering::Release);
        while self.rx.try_recv().is_ok() {}
    }

    /// Stop flushing; posts are accepted again.
    pub fn stop_flushing(&self) {
        self.flushing.store(false, Ordering::Release);
    }

    /// Pop the next message without blocking.
    pub fn try_pop(&self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Block until a message arrives or `timeout` passes.
    pub fn poll(&self, timeout: Duration) -> Option<Message> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Some(msg),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Drain and return everything currently queued.
    pub fn drain(&self) -> Vec<Message> {
        self.rx.try_iter().collect()
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether the bus is empty.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}
