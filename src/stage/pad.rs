//! Pads: the connection points data flows through.
//!
//! Every stage exposes named, directed pads. A source pad of one stage
//! links to a sink pad of another; buffers travel over the link by
//! [`Pad::push`] (ownership transfer) or [`Pad::pull`] (demand driven).
//!
//! A link fixes no data format. The first push negotiates one lazily, see
//! [`crate::negotiation`]. Once negotiated, the agreed caps are attached
//! to every buffer that crosses the link without caps of its own.

use crate::buffer::Buffer;
use crate::caps::Caps;
use crate::clock::ClockTime;
use crate::error::{LinkError, NegotiationError};
use crate::negotiation;
use crate::stage::StageNode;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

// ============================================================================
// Flow results
// ============================================================================

/// Result of pushing or pulling a buffer over a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowResult {
    /// The buffer was accepted; keep producing.
    Ok,
    /// The pad has no peer.
    NotLinked,
    /// The pad is flushing; the buffer was discarded.
    Flushing,
    /// Downstream already saw end of stream; no more data wanted.
    Eos,
    /// No format has been agreed and negotiation failed.
    NotNegotiated,
    /// A fatal error occurred downstream.
    Error,
}

impl FlowResult {
    /// Whether data flow may continue.
    pub fn is_ok(self) -> bool {
        self == FlowResult::Ok
    }

    /// Whether this result signals an unrecoverable problem, as opposed
    /// to an expected stop such as [`FlowResult::Eos`] or
    /// [`FlowResult::Flushing`].
    pub fn is_fatal(self) -> bool {
        matches!(self, FlowResult::Error | FlowResult::NotNegotiated)
    }
}

impl fmt::Display for FlowResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlowResult::Ok => "ok",
            FlowResult::NotLinked => "not-linked",
            FlowResult::Flushing => "flushing",
            FlowResult::Eos => "eos",
            FlowResult::NotNegotiated => "not-negotiated",
            FlowResult::Error => "error",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// Templates
// ============================================================================

/// Direction of a pad, from the owning stage's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadDirection {
    /// Data leaves the stage through this pad.
    Source,
    /// Data enters the stage through this pad.
    Sink,
}

impl fmt::Display for PadDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PadDirection::Source => write!(f, "source"),
            PadDirection::Sink => write!(f, "sink"),
        }
    }
}

/// When a pad described by a template exists on the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadPresence {
    /// The pad always exists.
    Always,
    /// The pad appears during data flow (e.g. demuxer outputs).
    Sometimes,
    /// The pad is created on request, see
    /// [`Stage::request_pad`](crate::stage::Stage::request_pad).
    Request,
}

/// Blueprint for a pad: name, direction, presence, and the template caps
/// describing every format the pad could ever carry.
#[derive(Debug, Clone)]
pub struct PadTemplate {
    /// Pad name, unique within the stage ("src", "sink", "src_%u").
    pub name: String,
    /// Pad direction.
    pub direction: PadDirection,
    /// When the pad exists.
    pub presence: PadPresence,
    /// Everything the pad could carry. Negotiation never goes outside
    /// these caps.
    pub caps: Arc<Caps>,
}

impl PadTemplate {
    /// Create a template with [`PadPresence::Always`].
    pub fn new(name: impl Into<String>, direction: PadDirection, caps: Caps) -> Self {
        Self {
            name: name.into(),
            direction,
            presence: PadPresence::Always,
            caps: Arc::new(caps),
        }
    }

    /// Set the presence (builder style).
    #[must_use]
    pub fn presence(mut self, presence: PadPresence) -> Self {
        self.presence = presence;
        self
    }
}

/// Data transport discipline on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PadMode {
    /// Upstream drives: buffers arrive by push.
    #[default]
    Push,
    /// Downstream drives: the sink pulls byte ranges on demand.
    Pull,
}

// ============================================================================
// Pad
// ============================================================================

#[derive(Debug)]
struct PadState {
    peer: Weak<Pad>,
    negotiated: Option<Arc<Caps>>,
    flushing: bool,
    eos: bool,
    last_pts: ClockTime,
    mode: PadMode,
}

/// A connection point on a stage. Shared as `Arc<Pad>`; all mutable state
/// sits behind one internal lock and is only touched through the methods
/// here.
#[derive(Debug)]
pub struct Pad {
    name: String,
    direction: PadDirection,
    template_caps: Arc<Caps>,
    owner: Weak<StageNode>,
    owner_name: String,
    state: Mutex<PadState>,
}

impl Pad {
    pub(crate) fn new(
        template: &PadTemplate,
        name: impl Into<String>,
        owner: Weak<StageNode>,
        owner_name: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            direction: template.direction,
            template_caps: template.caps.clone(),
            owner,
            owner_name: owner_name.into(),
            state: Mutex::new(PadState {
                peer: Weak::new(),
                negotiated: None,
                flushing: false,
                eos: false,
                last_pts: ClockTime::NONE,
                mode: PadMode::Push,
            }),
        })
    }

    /// Create a pad with no owning stage. Useful for exercising link and
    /// negotiation logic in isolation; delivery needs an owner.
    pub fn detached(template: &PadTemplate) -> Arc<Self> {
        Self::new(template, template.name.clone(), Weak::new(), "<detached>")
    }

    /// Pad name within its stage.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pad direction.
    pub fn direction(&self) -> PadDirection {
        self.direction
    }

    /// "stage:pad" name for diagnostics.
    pub fn full_name(&self) -> String {
        format!("{}:{}", self.owner_name, self.name)
    }

    /// The template caps this pad was created from.
    pub fn template_caps(&self) -> &Arc<Caps> {
        &self.template_caps
    }

    /// The peer pad, if linked.
    pub fn peer(&self) -> Option<Arc<Pad>> {
        self.state.lock().unwrap().peer.upgrade()
    }

    /// Whether this pad is linked to a peer.
    pub fn is_linked(&self) -> bool {
        self.peer().is_some()
    }

    /// The caps agreed by negotiation, if any.
    pub fn negotiated_caps(&self) -> Option<Arc<Caps>> {
        self.state.lock().unwrap().negotiated.clone()
    }

    pub(crate) fn set_negotiated_caps(&self, caps: Option<Arc<Caps>>) {
        self.state.lock().unwrap().negotiated = caps;
    }

    /// Whether the pad is currently flushing.
    pub fn is_flushing(&self) -> bool {
        self.state.lock().unwrap().flushing
    }

    /// Whether end of stream has passed through this pad.
    pub fn is_eos(&self) -> bool {
        self.state.lock().unwrap().eos
    }

    /// The transport mode of this pad.
    pub fn mode(&self) -> PadMode {
        self.state.lock().unwrap().mode
    }

    pub(crate) fn owner(&self) -> Option<Arc<StageNode>> {
        self.owner.upgrade()
    }

    // ========================================================================
    // Push flow
    // ========================================================================

    /// Push a buffer downstream over the link. Source pads only.
    ///
    /// Ownership of the buffer transfers downstream; it is never handed
    /// back. The first push negotiates the link format lazily.
    /// Timestamps must be monotonically non-decreasing per pad unless the
    /// buffer carries the `discont` flag.
    pub fn push(self: &Arc<Self>, mut buffer: Buffer) -> FlowResult {
        if self.direction != PadDirection::Source {
            tracing::error!(pad = %self.full_name(), "push on a sink pad");
            return FlowResult::Error;
        }

        let (peer, negotiated) = {
            let state = self.state.lock().unwrap();
            if state.flushing {
                return FlowResult::Flushing;
            }
            if state.eos {
                return FlowResult::Eos;
            }
            if state.mode == PadMode::Pull {
                tracing::error!(pad = %self.full_name(), "push on a pull-mode pad");
                return FlowResult::Error;
            }
            match state.peer.upgrade() {
                Some(peer) => (peer, state.negotiated.clone()),
                None => return FlowResult::NotLinked,
            }
        };

        let caps = match negotiated {
            Some(caps) => caps,
            None => match negotiation::negotiate(self, &peer) {
                Ok(caps) => caps,
                Err(err) => {
                    tracing::error!(pad = %self.full_name(), %err, "negotiation failed");
                    if let Some(owner) = self.owner.upgrade() {
                        owner.post_error(err.to_string());
                    }
                    return FlowResult::NotNegotiated;
                }
            },
        };

        {
            let mut state = self.state.lock().unwrap();
            let pts = buffer.pts();
            if pts.is_some() && state.last_pts.is_some() {
                if pts < state.last_pts && !buffer.flags().discont {
                    tracing::warn!(
                        pad = %self.full_name(),
                        %pts,
                        last = %state.last_pts,
                        "timestamp went backwards without discont"
                    );
                    return FlowResult::Error;
                }
            }
            if pts.is_some() {
                state.last_pts = pts;
            }
        }

        if buffer.caps().is_none() && !caps.is_any() {
            buffer.set_caps(caps);
        }
        peer.deliver(buffer)
    }

    /// Accept a buffer arriving from the peer. Sink pads only.
    fn deliver(self: &Arc<Self>, buffer: Buffer) -> FlowResult {
        {
            let state = self.state.lock().unwrap();
            if state.flushing {
                return FlowResult::Flushing;
            }
            if state.eos {
                return FlowResult::Eos;
            }
        }
        match self.owner.upgrade() {
            Some(owner) => owner.handle_buffer(&self.name, buffer),
            None => FlowResult::NotLinked,
        }
    }

    /// Signal end of stream downstream. Source pads only.
    ///
    /// Marks this pad EOS; later pushes return [`FlowResult::Eos`].
    pub fn push_eos(self: &Arc<Self>) -> FlowResult {
        if self.direction != PadDirection::Source {
            tracing::error!(pad = %self.full_name(), "push_eos on a sink pad");
            return FlowResult::Error;
        }
        let peer = {
            let mut state = self.state.lock().unwrap();
            if state.flushing {
                return FlowResult::Flushing;
            }
            if state.eos {
                return FlowResult::Eos;
            }
            state.eos = true;
            state.peer.upgrade()
        };
        match peer {
            Some(peer) => peer.deliver_eos(),
            None => FlowResult::NotLinked,
        }
    }

    fn deliver_eos(self: &Arc<Self>) -> FlowResult {
        {
            let mut state = self.state.lock().unwrap();
            if state.flushing {
                return FlowResult::Flushing;
            }
            if state.eos {
                return FlowResult::Eos;
            }
            state.eos = true;
        }
        match self.owner.upgrade() {
            Some(owner) => owner.handle_eos(&self.name),
            None => FlowResult::NotLinked,
        }
    }

    // ========================================================================
    // Pull flow
    // ========================================================================

    /// Pull `size` bytes at `offset` from the peer. Sink pads only, and
    /// only after [`Pad::activate_pull`]; the upstream stage serves the
    /// range through [`Stage::pull_range`](crate::stage::Stage::pull_range).
    ///
    /// The first pull negotiates the link format like the first push
    /// does; pulled buffers without caps of their own carry the agreed
    /// caps.
    pub fn pull(self: &Arc<Self>, offset: u64, size: usize) -> Result<Buffer, FlowResult> {
        if self.direction != PadDirection::Sink {
            return Err(FlowResult::Error);
        }
        let (peer, negotiated) = {
            let state = self.state.lock().unwrap();
            if state.flushing {
                return Err(FlowResult::Flushing);
            }
            if state.mode != PadMode::Pull {
                tracing::error!(pad = %self.full_name(), "pull on a pad not activated for pull");
                return Err(FlowResult::Error);
            }
            let peer = state.peer.upgrade().ok_or(FlowResult::NotLinked)?;
            (peer, state.negotiated.clone())
        };

        let caps = match negotiated {
            Some(caps) => caps,
            None => negotiation::negotiate(&peer, self).map_err(|err| {
                tracing::error!(pad = %self.full_name(), %err, "negotiation failed");
                FlowResult::NotNegotiated
            })?,
        };

        let owner = peer.owner.upgrade().ok_or(FlowResult::NotLinked)?;
        let mut buffer = owner.handle_pull(offset, size)?;
        if buffer.caps().is_none() && !caps.is_any() {
            buffer.set_caps(caps);
        }
        Ok(buffer)
    }

    /// Switch the link to pull mode. Sink pads only; fails when unlinked
    /// or when the upstream stage cannot serve byte ranges.
    pub fn activate_pull(self: &Arc<Self>) -> Result<(), LinkError> {
        if self.direction != PadDirection::Sink {
            return Err(LinkError::PullUnsupported {
                src: self.full_name(),
            });
        }
        let peer = self
            .state
            .lock()
            .unwrap()
            .peer
            .upgrade()
            .ok_or_else(|| LinkError::NotLinked(self.full_name()))?;
        if let Some(owner) = peer.owner.upgrade() {
            if !owner.supports_pull() {
                return Err(LinkError::PullUnsupported {
                    src: peer.full_name(),
                });
            }
        }
        // Lock order: source before sink, everywhere.
        peer.state.lock().unwrap().mode = PadMode::Pull;
        self.state.lock().unwrap().mode = PadMode::Pull;
        Ok(())
    }

    // ========================================================================
    // Flushing
    // ========================================================================

    /// Enter flushing: in-flight and future pushes return
    /// [`FlowResult::Flushing`] until [`Pad::flush_stop`]. Propagates to
    /// the peer and, through it, downstream.
    pub fn flush_start(self: &Arc<Self>) {
        let peer = {
            let mut state = self.state.lock().unwrap();
            if state.flushing {
                return;
            }
            state.flushing = true;
            state.peer.upgrade()
        };
        tracing::debug!(pad = %self.full_name(), "flush start");
        if let Some(owner) = self.owner.upgrade() {
            if self.direction == PadDirection::Sink {
                owner.handle_flush_start(&self.name);
            }
        }
        if self.direction == PadDirection::Source {
            if let Some(peer) = peer {
                peer.flush_start();
            }
        }
    }

    /// Leave flushing and reset stream bookkeeping (EOS flag, timestamp
    /// tracking). Negotiated caps survive a flush.
    pub fn flush_stop(self: &Arc<Self>) {
        let peer = {
            let mut state = self.state.lock().unwrap();
            if !state.flushing {
                return;
            }
            state.flushing = false;
            state.eos = false;
            state.last_pts = ClockTime::NONE;
            state.peer.upgrade()
        };
        tracing::debug!(pad = %self.full_name(), "flush stop");
        if let Some(owner) = self.owner.upgrade() {
            if self.direction == PadDirection::Sink {
                owner.handle_flush_stop(&self.name);
            }
        }
        if self.direction == PadDirection::Source {
            if let Some(peer) = peer {
                peer.flush_stop();
            }
        }
    }

    pub(crate) fn set_flushing(&self, flushing: bool) {
        let mut state = self.state.lock().unwrap();
        state.flushing = flushing;
        if !flushing {
            state.eos = false;
            state.last_pts = ClockTime::NONE;
        }
    }
}

impl fmt::Display for Pad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_name())
    }
}

// ============================================================================
// Links
// ============================================================================

/// Connect a source pad to a sink pad.
///
/// Both pads must be unlinked and of opposite directions, and their
/// template caps must overlap. No format is agreed here; that happens
/// lazily on the first push, or eagerly via [`Link::negotiate`].
pub fn link(src: &Arc<Pad>, sink: &Arc<Pad>) -> Result<Link, LinkError> {
    if src.direction == sink.direction {
        return Err(LinkError::SameDirection(match src.direction {
            PadDirection::Source => "source",
            PadDirection::Sink => "sink",
        }));
    }
    // Callers pass (source, sink); a swapped pair is caught here.
    if src.direction != PadDirection::Source {
        return Err(LinkError::SameDirection("sink"));
    }

    if src.template_caps.intersect(&sink.template_caps).is_empty() {
        return Err(LinkError::Incompatible {
            src: src.full_name(),
            sink: sink.full_name(),
        });
    }

    // Lock order: source before sink, everywhere.
    let mut src_state = src.state.lock().unwrap();
    let mut sink_state = sink.state.lock().unwrap();
    if src_state.peer.upgrade().is_some() {
        return Err(LinkError::AlreadyLinked(src.full_name()));
    }
    if sink_state.peer.upgrade().is_some() {
        return Err(LinkError::AlreadyLinked(sink.full_name()));
    }
    src_state.peer = Arc::downgrade(sink);
    sink_state.peer = Arc::downgrade(src);
    drop(sink_state);
    drop(src_state);

    tracing::debug!(src = %src.full_name(), sink = %sink.full_name(), "linked");
    Ok(Link {
        src: src.clone(),
        sink: sink.clone(),
    })
}

/// An established connection between a source pad and a sink pad.
#[derive(Debug, Clone)]
pub struct Link {
    src: Arc<Pad>,
    sink: Arc<Pad>,
}

impl Link {
    /// The upstream pad.
    pub fn src(&self) -> &Arc<Pad> {
        &self.src
    }

    /// The downstream pad.
    pub fn sink(&self) -> &Arc<Pad> {
        &self.sink
    }

    /// The caps agreed on this link, if negotiation has happened.
    pub fn caps(&self) -> Option<Arc<Caps>> {
        self.src.negotiated_caps()
    }

    /// Run negotiation now instead of waiting for the first push.
    pub fn negotiate(&self) -> Result<Arc<Caps>, NegotiationError> {
        if let Some(caps) = self.src.negotiated_caps() {
            return Ok(caps);
        }
        negotiation::negotiate(&self.src, &self.sink)
    }

    /// Re-run negotiation mid-stream.
    ///
    /// Both stages must report
    /// [`supports_renegotiation`](crate::stage::Stage::supports_renegotiation);
    /// otherwise a format change requires unlinking and re-linking.
    pub fn renegotiate(&self) -> Result<Arc<Caps>, NegotiationError> {
        let supported = |pad: &Arc<Pad>| match pad.owner() {
            Some(node) => node.supports_renegotiation(),
            // Detached pads have no stage to object.
            None => true,
        };
        if !supported(&self.src) || !supported(&self.sink) {
            return Err(NegotiationError::RenegotiationUnsupported {
                src: self.src.full_name(),
                sink: self.sink.full_name(),
            });
        }
        self.src.set_negotiated_caps(None);
        self.sink.set_negotiated_caps(None);
        negotiation::negotiate(&self.src, &self.sink)
    }

    /// Disconnect the pads and clear the negotiated format.
    pub fn unlink(&self) {
        let mut src_state = self.src.state.lock().unwrap();
        let mut sink_state = self.sink.state.lock().unwrap();
        src_state.peer = Weak::new();
        src_state.negotiated = None;
        src_state.eos = false;
        src_state.last_pts = ClockTime::NONE;
        sink_state.peer = Weak::new();
        sink_state.negotiated = None;
        sink_state.eos = false;
        sink_state.last_pts = ClockTime::NONE;
        drop(sink_state);
        drop(src_state);
        tracing::debug!(src = %self.src.full_name(), sink = %self.sink.full_name(), "unlinked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::Structure;

    fn src_template(rates: std::ops::RangeInclusive<i64>) -> PadTemplate {
        PadTemplate::new(
            "src",
            PadDirection::Source,
            Caps::from(Structure::new("audio/x-test").field("rate", rates)),
        )
    }

    fn sink_template(rates: std::ops::RangeInclusive<i64>) -> PadTemplate {
        PadTemplate::new(
            "sink",
            PadDirection::Sink,
            Caps::from(Structure::new("audio/x-test").field("rate", rates)),
        )
    }

    #[test]
    fn test_link_opposite_directions_compatible() {
        let src = Pad::detached(&src_template(1..=100));
        let sink = Pad::detached(&sink_template(50..=200));
        let link = link(&src, &sink).unwrap();
        assert!(src.is_linked());
        assert!(sink.is_linked());
        // No format fixed at link time.
        assert!(link.caps().is_none());
    }

    #[test]
    fn test_link_same_direction_rejected() {
        let a = Pad::detached(&src_template(1..=100));
        let b = Pad::detached(&src_template(1..=100));
        assert_eq!(link(&a, &b).unwrap_err(), LinkError::SameDirection("source"));
    }

    #[test]
    fn test_link_incompatible_templates_rejected() {
        let src = Pad::detached(&src_template(1..=10));
        let sink = Pad::detached(&sink_template(20..=30));
        assert!(matches!(
            link(&src, &sink).unwrap_err(),
            LinkError::Incompatible { .. }
        ));
    }

    #[test]
    fn test_link_already_linked_rejected() {
        let src = Pad::detached(&src_template(1..=100));
        let sink = Pad::detached(&sink_template(1..=100));
        let other = Pad::detached(&sink_template(1..=100));
        link(&src, &sink).unwrap();
        assert!(matches!(
            link(&src, &other).unwrap_err(),
            LinkError::AlreadyLinked(_)
        ));
    }

    #[test]
    fn test_unlink_clears_peers_and_caps() {
        let src = Pad::detached(&src_template(1..=100));
        let sink = Pad::detached(&sink_template(1..=100));
        let l = link(&src, &sink).unwrap();
        l.negotiate().unwrap();
        assert!(l.caps().is_some());

        l.unlink();
        assert!(!src.is_linked());
        assert!(!sink.is_linked());
        assert!(src.negotiated_caps().is_none());
    }

    #[test]
    fn test_push_unlinked() {
        let src = Pad::detached(&src_template(1..=100));
        assert_eq!(src.push(Buffer::empty()), FlowResult::NotLinked);
    }

    #[test]
    fn test_push_while_flushing() {
        let src = Pad::detached(&src_template(1..=100));
        let sink = Pad::detached(&sink_template(1..=100));
        link(&src, &sink).unwrap();
        src.flush_start();
        assert_eq!(src.push(Buffer::empty()), FlowResult::Flushing);
        src.flush_stop();
        assert!(!src.is_flushing());
    }

    #[test]
    fn test_push_after_eos() {
        let src = Pad::detached(&src_template(1..=100));
        let sink = Pad::detached(&sink_template(1..=100));
        link(&src, &sink).unwrap();
        src.push_eos();
        assert_eq!(src.push(Buffer::empty()), FlowResult::Eos);
    }

    #[test]
    fn test_pull_requires_activation() {
        let src = Pad::detached(&src_template(1..=100));
        let sink = Pad::detached(&sink_template(1..=100));
        link(&src, &sink).unwrap();
        assert_eq!(sink.pull(0, 4).unwrap_err(), FlowResult::Error);
    }

    #[test]
    fn test_push_on_pull_mode_pad_rejected() {
        let src = Pad::detached(&src_template(1..=100));
        let sink = Pad::detached(&sink_template(1..=100));
        link(&src, &sink).unwrap();
        // Detached pads have no stage to veto pull activation.
        sink.activate_pull().unwrap();
        assert_eq!(src.mode(), PadMode::Pull);
        assert_eq!(src.push(Buffer::empty()), FlowResult::Error);
    }

    #[test]
    fn test_activate_pull_unlinked_rejected() {
        let sink = Pad::detached(&sink_template(1..=100));
        assert!(matches!(
            sink.activate_pull().unwrap_err(),
            LinkError::NotLinked(_)
        ));
    }

    #[test]
    fn test_flush_propagates_to_peer() {
        let src = Pad::detached(&src_template(1..=100));
        let sink = Pad::detached(&sink_template(1..=100));
        link(&src, &sink).unwrap();
        src.flush_start();
        assert!(sink.is_flushing());
        src.flush_stop();
        assert!(!sink.is_flushing());
    }
}
