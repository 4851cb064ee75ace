//! Built-in utility stages.
//!
//! Small stages used by applications and the test suite: a configurable
//! test source, a counting pass-through, a collecting sink with preroll,
//! and a pull-mode byte range source.

use crate::buffer::Buffer;
use crate::caps::Caps;
use crate::clock::ClockTime;
use crate::stage::pad::{FlowResult, PadDirection, PadTemplate};
use crate::stage::{Produced, Stage, StageContext};
use crate::state::{StateChangeResult, Transition};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

// ============================================================================
// TestSource
// ============================================================================

/// Produces a fixed number of timestamped buffers, then end of stream.
///
/// Live mode makes the source report [`StateChangeResult::NoPreroll`]
/// when entering Paused and hold production until Playing.
#[derive(Debug)]
pub struct TestSource {
    caps: Caps,
    num_buffers: u64,
    payload_size: usize,
    pts_step: ClockTime,
    live: bool,
    produced: u64,
}

impl TestSource {
    /// A source producing `num_buffers` buffers.
    pub fn new(num_buffers: u64) -> Self {
        Self {
            caps: Caps::any(),
            num_buffers,
            payload_size: 16,
            pts_step: ClockTime::from_millis(10),
            live: false,
            produced: 0,
        }
    }

    /// Set the caps advertised on the source pad (builder style).
    #[must_use]
    pub fn with_caps(mut self, caps: Caps) -> Self {
        self.caps = caps;
        self
    }

    /// Set the payload size per buffer (builder style).
    #[must_use]
    pub fn payload_size(mut self, size: usize) -> Self {
        self.payload_size = size;
        self
    }

    /// Set the timestamp step between buffers (builder style).
    #[must_use]
    pub fn pts_step(mut self, step: ClockTime) -> Self {
        self.pts_step = step;
        self
    }

    /// Make the source live (builder style).
    #[must_use]
    pub fn live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }
}

impl Stage for TestSource {
    fn pad_templates(&self) -> Vec<PadTemplate> {
        vec![PadTemplate::new(
            "src",
            PadDirection::Source,
            self.caps.clone(),
        )]
    }

    fn produce(&mut self) -> Produced {
        if self.produced >= self.num_buffers {
            return Produced::Eos;
        }
        let n = self.produced;
        self.produced += 1;
        let pts = ClockTime::from_nanos(self.pts_step.nanos().saturating_mul(n));
        Produced::Buffer(
            Buffer::from_bytes(vec![n as u8; self.payload_size])
                .with_pts(pts)
                .with_duration(self.pts_step),
        )
    }

    fn change_state(&mut self, transition: Transition) -> StateChangeResult {
        match transition {
            Transition::ReadyToPaused | Transition::PlayingToPaused if self.live => {
                StateChangeResult::NoPreroll
            }
            Transition::ReadyToPaused => {
                self.produced = 0;
                StateChangeResult::Success
            }
            _ => StateChangeResult::Success,
        }
    }

    fn is_live(&self) -> bool {
        self.live
    }
}

// ============================================================================
// PassThrough
// ============================================================================

/// Forwards buffers unchanged and counts them.
#[derive(Debug, Default)]
pub struct PassThrough {
    ctx: Option<StageContext>,
    count: Arc<AtomicU64>,
}

impl PassThrough {
    /// A fresh pass-through.
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle observing how many buffers passed.
    pub fn counter(&self) -> Arc<AtomicU64> {
        self.count.clone()
    }
}

impl Stage for PassThrough {
    fn pad_templates(&self) -> Vec<PadTemplate> {
        vec![
            PadTemplate::new("sink", PadDirection::Sink, Caps::any()),
            PadTemplate::new("src", PadDirection::Source, Caps::any()),
        ]
    }

    fn attach(&mut self, ctx: StageContext) {
        self.ctx = Some(ctx);
    }

    fn process(&mut self, _pad: &str, buffer: Buffer) -> FlowResult {
        self.count.fetch_add(1, Ordering::Relaxed);
        match &self.ctx {
            Some(ctx) => ctx.push("src", buffer),
            None => FlowResult::Error,
        }
    }
}

// ============================================================================
// CollectorSink
// ============================================================================

/// Collects every received buffer; the terminal stage of test pipelines.
///
/// With preroll enabled (the default) the sink completes Ready-to-Paused
/// asynchronously: it returns [`StateChangeResult::Async`], commits
/// Paused when the first buffer arrives, and holds buffers until the
/// pipeline reaches Playing.
#[derive(Debug)]
pub struct CollectorSink {
    ctx: Option<StageContext>,
    collected: Arc<Mutex<Vec<Buffer>>>,
    preroll: bool,
    awaiting_first: bool,
    restrict: Option<Caps>,
}

impl CollectorSink {
    /// A collecting sink with preroll enabled.
    pub fn new() -> Self {
        Self {
            ctx: None,
            collected: Arc::new(Mutex::new(Vec::new())),
            preroll: true,
            awaiting_first: false,
            restrict: None,
        }
    }

    /// Enable or disable preroll (builder style). Pipelines fed by live
    /// sources need it off: live data cannot arrive in Paused.
    #[must_use]
    pub fn preroll(mut self, preroll: bool) -> Self {
        self.preroll = preroll;
        self
    }

    /// Restrict accepted formats (builder style). Proposals outside
    /// `caps` are rejected with a counter-proposal narrowed to `caps`.
    #[must_use]
    pub fn restrict(mut self, caps: Caps) -> Self {
        self.restrict = Some(caps);
        self
    }

    /// A handle onto everything collected so far.
    pub fn collected(&self) -> Arc<Mutex<Vec<Buffer>>> {
        self.collected.clone()
    }
}

impl Default for CollectorSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for CollectorSink {
    fn pad_templates(&self) -> Vec<PadTemplate> {
        let caps = self.restrict.clone().unwrap_or_else(Caps::any);
        vec![PadTemplate::new("sink", PadDirection::Sink, caps)]
    }

    fn attach(&mut self, ctx: StageContext) {
        self.ctx = Some(ctx);
    }

    fn set_format(&mut self, _pad: &str, caps: &Caps) -> bool {
        match &self.restrict {
            Some(restrict) => caps.is_subset(restrict),
            None => true,
        }
    }

    fn propose_format(&mut self, _pad: &str, offered: &Caps) -> Option<Caps> {
        self.restrict
            .as_ref()
            .map(|restrict| offered.intersect(restrict))
    }

    fn process(&mut self, _pad: &str, buffer: Buffer) -> FlowResult {
        let ctx = match &self.ctx {
            Some(ctx) => ctx.clone(),
            None => return FlowResult::Error,
        };
        if self.awaiting_first {
            self.awaiting_first = false;
            ctx.commit_state(crate::state::State::Paused);
        }
        if self.preroll && ctx.current_state() < crate::state::State::Playing {
            // Hold the preroll buffer until Playing or flush.
            if !ctx.park_until_playing() {
                return FlowResult::Flushing;
            }
        }
        self.collected.lock().unwrap().push(buffer);
        FlowResult::Ok
    }

    fn change_state(&mut self, transition: Transition) -> StateChangeResult {
        match transition {
            Transition::ReadyToPaused if self.preroll => {
                self.awaiting_first = true;
                StateChangeResult::Async
            }
            Transition::PausedToReady => {
                self.awaiting_first = false;
                StateChangeResult::Success
            }
            _ => StateChangeResult::Success,
        }
    }

    fn flush(&mut self) {
        self.awaiting_first = false;
    }
}

// ============================================================================
// ByteRangeSource
// ============================================================================

/// Serves byte ranges of an in-memory blob for pull-mode links.
#[derive(Debug)]
pub struct ByteRangeSource {
    data: Bytes,
}

impl ByteRangeSource {
    /// A range source over `data`.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

impl Stage for ByteRangeSource {
    fn pad_templates(&self) -> Vec<PadTemplate> {
        vec![PadTemplate::new("src", PadDirection::Source, Caps::any())]
    }

    fn supports_pull(&self) -> bool {
        true
    }

    fn pull_range(&mut self, offset: u64, size: usize) -> Result<Buffer, FlowResult> {
        let len = self.data.len() as u64;
        if offset >= len {
            return Err(FlowResult::Eos);
        }
        let start = offset as usize;
        let end = (offset + size as u64).min(len) as usize;
        Ok(Buffer::from_bytes(self.data.slice(start..end)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::stage::StageNode;
    use crate::state::State;

    #[test]
    fn test_test_source_produces_then_eos() {
        let mut src = TestSource::new(2).payload_size(4);
        assert!(matches!(src.produce(), Produced::Buffer(_)));
        match src.produce() {
            Produced::Buffer(b) => {
                assert_eq!(b.pts(), ClockTime::from_millis(10));
                assert_eq!(b.len(), 4);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(src.produce(), Produced::Eos));
    }

    #[test]
    fn test_live_source_no_preroll() {
        let mut src = TestSource::new(10).live(true);
        assert_eq!(
            src.change_state(Transition::ReadyToPaused),
            StateChangeResult::NoPreroll
        );
        assert_eq!(
            src.change_state(Transition::PausedToPlaying),
            StateChangeResult::Success
        );
        assert_eq!(
            src.change_state(Transition::PlayingToPaused),
            StateChangeResult::NoPreroll
        );
    }

    #[test]
    fn test_byte_range_source_serves_ranges() {
        let node = StageNode::new(
            "blob",
            Box::new(ByteRangeSource::new(vec![0u8, 1, 2, 3, 4, 5, 6, 7])),
            Bus::new(),
        );
        let sink = crate::stage::pad::Pad::detached(&PadTemplate::new(
            "sink",
            PadDirection::Sink,
            Caps::any(),
        ));
        let src = node.find_pad("src").unwrap();
        crate::stage::pad::link(&src, &sink).unwrap();
        sink.activate_pull().unwrap();

        let buf = sink.pull(2, 3).unwrap();
        assert_eq!(buf.as_bytes(), &[2, 3, 4]);
        // Short read at the tail, EOS past it.
        assert_eq!(sink.pull(6, 10).unwrap().as_bytes(), &[6, 7]);
        assert_eq!(sink.pull(8, 1).unwrap_err(), FlowResult::Eos);
    }

    #[test]
    fn test_activate_pull_refused_without_range_support() {
        let node = StageNode::new("src0", Box::new(TestSource::new(4)), Bus::new());
        let sink = crate::stage::pad::Pad::detached(&PadTemplate::new(
            "sink",
            PadDirection::Sink,
            Caps::any(),
        ));
        let src = node.find_pad("src").unwrap();
        crate::stage::pad::link(&src, &sink).unwrap();
        assert!(matches!(
            sink.activate_pull().unwrap_err(),
            crate::error::LinkError::PullUnsupported { .. }
        ));
    }

    #[test]
    fn test_pulled_buffers_carry_negotiated_caps() {
        let node = StageNode::new(
            "blob",
            Box::new(ByteRangeSource::new(vec![0u8, 1, 2, 3])),
            Bus::new(),
        );
        let sink = crate::stage::pad::Pad::detached(&PadTemplate::new(
            "sink",
            PadDirection::Sink,
            Caps::from(crate::caps::Structure::new("audio/x-test").field("rate", 1i64..=100)),
        ));
        let src = node.find_pad("src").unwrap();
        crate::stage::pad::link(&src, &sink).unwrap();
        sink.activate_pull().unwrap();

        let buf = sink.pull(0, 4).unwrap();
        let caps = buf.caps().unwrap().clone();
        assert!(caps.is_fixed());
        assert_eq!(sink.negotiated_caps(), Some(caps));
    }

    #[test]
    fn test_collector_without_preroll_accepts_in_paused() {
        let sink = CollectorSink::new().preroll(false);
        let collected = sink.collected();
        let node = StageNode::new("sink0", Box::new(sink), Bus::new());
        node.set_state(State::Paused).unwrap();

        let src = crate::stage::pad::Pad::detached(&PadTemplate::new(
            "src",
            PadDirection::Source,
            Caps::any(),
        ));
        let pad = node.find_pad("sink").unwrap();
        crate::stage::pad::link(&src, &pad).unwrap();
        assert_eq!(src.push(Buffer::from_bytes(vec![9u8])), FlowResult::Ok);
        assert_eq!(collected.lock().unwrap().len(), 1);
        node.set_state(State::Null).unwrap();
    }
}
