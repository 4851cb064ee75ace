//! Aqueduct is a pluggable media-processing pipeline engine.
//!
//! Discrete, time-stamped [`Buffer`](buffer::Buffer)s flow through a
//! graph of processing [`Stage`](stage::Stage)s. Stages connect through
//! directed [`Pad`](stage::pad::Pad)s; a link agrees on a shared data
//! format through bounded-round [negotiation](negotiation) before data
//! flows. Lifecycle is a four-state machine
//! (Null/Ready/Paused/Playing, [`state`]), cross-thread backpressure is
//! a [`DecouplingQueue`](queue::DecouplingQueue), and out-of-band
//! messages reach the application over the [`Bus`](bus::Bus).
//!
//! # Quick start
//!
//! ```rust
//! use aqueduct::prelude::*;
//! use std::time::Duration;
//!
//! # fn main() -> aqueduct::Result<()> {
//! let pipeline = Pipeline::new("demo");
//! pipeline.add("src", TestSource::new(8))?;
//! pipeline.add("sink", CollectorSink::new())?;
//! pipeline.link_stages("src", "sink")?;
//!
//! pipeline.set_state(State::Playing)?;
//! pipeline.get_state(Duration::from_secs(5))?;
//!
//! // Drain messages until end of stream.
//! let bus = pipeline.bus();
//! while let Some(msg) = bus.poll(Duration::from_secs(1)) {
//!     if matches!(msg.kind, MessageKind::Eos) {
//!         break;
//!     }
//! }
//! pipeline.set_state(State::Null)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`caps`]: format descriptors with intersection, subset and
//!   deterministic fixation.
//! - [`buffer`]: reference-counted copy-on-write data buffers.
//! - [`stage`]: the [`Stage`](stage::Stage) capability trait, pads,
//!   links and flow results.
//! - [`negotiation`]: the per-link format agreement protocol.
//! - [`state`]: lifecycle states and transition tracking.
//! - [`queue`]: the bounded decoupling queue with overflow policies.
//! - [`pipeline`]: the toplevel container and state aggregation.
//! - [`bus`], [`clock`], [`registry`], [`stages`]: messaging, time,
//!   stage factories and built-in utility stages.

#![warn(missing_docs)]

pub mod buffer;
pub mod bus;
pub mod caps;
pub mod clock;
pub mod error;
pub mod negotiation;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod stage;
pub mod stages;
pub mod state;

pub use error::{Error, Result};

/// The common imports for building and running pipelines.
pub mod prelude {
    pub use crate::buffer::{Buffer, BufferFlags};
    pub use crate::bus::{Bus, Message, MessageKind};
    pub use crate::caps::{Caps, FieldSpec, Structure, Value};
    pub use crate::clock::{Clock, ClockTime, SystemClock};
    pub use crate::error::{Error, Result};
    pub use crate::pipeline::Pipeline;
    pub use crate::queue::{DecouplingQueue, OverflowPolicy, QueueConfig};
    pub use crate::registry::{StageRegistry, StageTemplate};
    pub use crate::stage::pad::{
        link, FlowResult, Link, Pad, PadDirection, PadMode, PadPresence, PadTemplate,
    };
    pub use crate::stage::{Produced, Stage, StageContext, StageNode};
    pub use crate::stages::{ByteRangeSource, CollectorSink, PassThrough, TestSource};
    pub use crate::state::{State, StateChangeResult, StateSnapshot, Transition};
}
