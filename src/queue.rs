//! Decoupling queue stage.
//!
//! A [`DecouplingQueue`] is a two-pad stage that moves the thread
//! boundary: its sink side enqueues from the upstream streaming thread,
//! its own drain thread dequeues and pushes downstream. The queue is the
//! one required synchronization point between chains.
//!
//! Capacity is bounded by buffers, bytes and queued duration (any limit
//! set to zero is disabled). When full, the [`OverflowPolicy`] decides:
//! block the producer, drop the newest buffer, or spill to a storage
//! file. Spilling preserves arrival order and exact payload boundaries;
//! once spilling starts, everything new goes through the file until it
//! drains, so readers never observe reordering.
//!
//! Flush (or a downward state change out of Paused) atomically discards
//! queued data and wakes both sides.

use crate::buffer::Buffer;
use crate::bus::MessageKind;
use crate::caps::Caps;
use crate::clock::ClockTime;
use crate::error::QueueOverflow;
use crate::stage::pad::{FlowResult, PadDirection, PadTemplate};
use crate::stage::{Stage, StageContext};
use crate::state::{StateChangeResult, Transition};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

// ============================================================================
// Configuration
// ============================================================================

/// What happens when a full queue receives another buffer.
#[derive(Debug, Clone)]
pub enum OverflowPolicy {
    /// Block the pushing thread until space frees up (backpressure).
    Block,
    /// Drop the incoming buffer and count it.
    DropNewest,
    /// Append overflow to a storage file at the given path; drained back
    /// in order before anything newer.
    SpillToStorage(PathBuf),
}

/// Queue capacity limits and overflow behavior.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum queued buffers. 0 disables this limit.
    pub max_buffers: usize,
    /// Maximum queued payload bytes. 0 disables this limit.
    pub max_bytes: usize,
    /// Maximum queued duration (sum of buffer durations).
    /// [`ClockTime::ZERO`] disables this limit.
    pub max_time: ClockTime,
    /// Behavior when every enabled limit is hit.
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_buffers: 200,
            max_bytes: 10 * 1024 * 1024,
            max_time: ClockTime::from_secs(1),
            overflow: OverflowPolicy::Block,
        }
    }
}

impl QueueConfig {
    /// Set the buffer-count limit (builder style).
    #[must_use]
    pub fn max_buffers(mut self, n: usize) -> Self {
        self.max_buffers = n;
        self
    }

    /// Set the byte limit (builder style).
    #[must_use]
    pub fn max_bytes(mut self, n: usize) -> Self {
        self.max_bytes = n;
        self
    }

    /// Set the duration limit (builder style).
    #[must_use]
    pub fn max_time(mut self, t: ClockTime) -> Self {
        self.max_time = t;
        self
    }

    /// Set the overflow policy (builder style).
    #[must_use]
    pub fn overflow(mut self, policy: OverflowPolicy) -> Self {
        self.overflow = policy;
        self
    }
}

// ============================================================================
// Spill file
// ============================================================================

/// Length-prefixed record file for overflow.
///
/// Record layout: `u32` payload length, `u64` pts, `u64` duration, `u8`
/// flags, payload bytes. All little endian. Read-back reconstructs exact
/// payload boundaries and timestamps.
#[derive(Debug)]
struct SpillFile {
    file: File,
    read_pos: u64,
    write_pos: u64,
    pending: u64,
}

const FLAG_DISCONT: u8 = 1;
const FLAG_SYNC_POINT: u8 = 2;
const FLAG_GAP: u8 = 4;

impl SpillFile {
    fn create(path: &PathBuf) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file,
            read_pos: 0,
            write_pos: 0,
            pending: 0,
        })
    }

    fn append(&mut self, buffer: &Buffer) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(self.write_pos))?;
        let payload = buffer.as_bytes();
        let flags = buffer.flags();
        let mut flag_byte = 0u8;
        if flags.discont {
            flag_byte |= FLAG_DISCONT;
        }
        if flags.sync_point {
            flag_byte |= FLAG_SYNC_POINT;
        }
        if flags.gap {
            flag_byte |= FLAG_GAP;
        }
        self.file.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.file.write_all(&buffer.pts().nanos().to_le_bytes())?;
        self.file.write_all(&buffer.duration().nanos().to_le_bytes())?;
        self.file.write_all(&[flag_byte])?;
        self.file.write_all(payload)?;
        self.write_pos = self.file.stream_position()?;
        self.pending += 1;
        Ok(())
    }

    fn read_next(&mut self) -> io::Result<Option<Buffer>> {
        if self.pending == 0 {
            return Ok(None);
        }
        self.file.seek(SeekFrom::Start(self.read_pos))?;
        let mut header = [0u8; 21];
        self.file.read_exact(&mut header)?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let pts = u64::from_le_bytes(header[4..12].try_into().unwrap_or([0; 8]));
        let duration = u64::from_le_bytes(header[12..20].try_into().unwrap_or([0; 8]));
        let flag_byte = header[20];
        let mut payload = vec![0u8; len];
        self.file.read_exact(&mut payload)?;
        self.read_pos = self.file.stream_position()?;
        self.pending -= 1;

        let mut buffer = Buffer::from_bytes(payload)
            .with_pts(ClockTime::from_nanos(pts))
            .with_duration(ClockTime::from_nanos(duration));
        let mut flags = buffer.flags();
        flags.discont = flag_byte & FLAG_DISCONT != 0;
        flags.sync_point = flag_byte & FLAG_SYNC_POINT != 0;
        flags.gap = flag_byte & FLAG_GAP != 0;
        buffer.set_flags(flags);
        Ok(Some(buffer))
    }
}

// ============================================================================
// Shared queue state
// ============================================================================

#[derive(Debug)]
enum QueueItem {
    Buffer(Buffer),
    Eos,
}

#[derive(Debug)]
struct QueueState {
    items: VecDeque<QueueItem>,
    bytes: usize,
    time: ClockTime,
    spill: Option<SpillFile>,
    flushing: bool,
    latched: Option<FlowResult>,
    dropped: u64,
}

#[derive(Debug)]
struct QueueInner {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    config: QueueConfig,
}

impl QueueInner {
    fn new(config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                bytes: 0,
                time: ClockTime::ZERO,
                spill: None,
                flushing: false,
                latched: None,
                dropped: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            config,
        }
    }

    fn is_full(&self, state: &QueueState) -> bool {
        let cfg = &self.config;
        (cfg.max_buffers > 0 && state.items.len() >= cfg.max_buffers)
            || (cfg.max_bytes > 0 && state.bytes >= cfg.max_bytes)
            || (cfg.max_time > ClockTime::ZERO && state.time >= cfg.max_time)
    }

    fn enqueue(&self, state: &mut QueueState, buffer: Buffer) {
        state.bytes += buffer.len();
        if buffer.duration().is_some() {
            state.time = state.time.saturating_add(buffer.duration());
        }
        state.items.push_back(QueueItem::Buffer(buffer));
        self.not_empty.notify_one();
    }

    fn push(&self, buffer: Buffer) -> FlowResult {
        let mut state = self.state.lock().unwrap();
        if state.flushing {
            return FlowResult::Flushing;
        }
        if let Some(latched) = state.latched {
            return latched;
        }

        // Once a spill is active, every new buffer goes through it so
        // the drain side sees arrival order.
        let spilling = state.spill.as_ref().map(|s| s.pending > 0).unwrap_or(false);
        if spilling || self.is_full(&state) {
            match &self.config.overflow {
                OverflowPolicy::Block => {
                    while self.is_full(&state) && !state.flushing {
                        state = self.not_full.wait(state).unwrap();
                    }
                    if state.flushing {
                        return FlowResult::Flushing;
                    }
                    self.enqueue(&mut state, buffer);
                }
                OverflowPolicy::DropNewest => {
                    state.dropped += 1;
                    tracing::warn!(dropped = state.dropped, "queue full, buffer dropped");
                }
                OverflowPolicy::SpillToStorage(path) => {
                    if state.spill.is_none() {
                        match SpillFile::create(path) {
                            Ok(spill) => {
                                tracing::debug!(path = %path.display(), "queue spilling to storage");
                                state.spill = Some(spill);
                            }
                            Err(err) => {
                                tracing::error!(%err, "cannot create spill file");
                                return FlowResult::Error;
                            }
                        }
                    }
                    if let Some(spill) = state.spill.as_mut() {
                        if let Err(err) = spill.append(&buffer) {
                            tracing::error!(%err, "spill write failed");
                            return FlowResult::Error;
                        }
                    }
                    self.not_empty.notify_one();
                }
            }
        } else {
            self.enqueue(&mut state, buffer);
        }
        FlowResult::Ok
    }

    fn push_eos(&self) {
        let mut state = self.state.lock().unwrap();
        state.items.push_back(QueueItem::Eos);
        self.not_empty.notify_one();
    }

    /// Blocking dequeue. `None` means flushing or shut down.
    fn pop(&self) -> Option<QueueItem> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.flushing {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                if let QueueItem::Buffer(buffer) = &item {
                    state.bytes -= buffer.len();
                    if buffer.duration().is_some() {
                        state.time = state.time.saturating_sub(buffer.duration());
                    }
                }
                self.not_full.notify_one();
                return Some(item);
            }
            // Memory side empty; drain the spill next so order holds.
            let mut spill_done = false;
            let mut spilled = None;
            if let Some(spill) = state.spill.as_mut() {
                match spill.read_next() {
                    Ok(Some(buffer)) => {
                        spill_done = spill.pending == 0;
                        spilled = Some(buffer);
                    }
                    Ok(None) => spill_done = true,
                    Err(err) => {
                        tracing::error!(%err, "spill read failed");
                        spill_done = true;
                    }
                }
            }
            if spill_done {
                state.spill = None;
            }
            if let Some(buffer) = spilled {
                return Some(QueueItem::Buffer(buffer));
            }
            state = self.not_empty.wait(state).unwrap();
        }
    }

    fn latch(&self, result: FlowResult) {
        self.state.lock().unwrap().latched = Some(result);
    }

    fn set_flushing(&self, flushing: bool) {
        let mut state = self.state.lock().unwrap();
        state.flushing = flushing;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.items.clear();
        state.bytes = 0;
        state.time = ClockTime::ZERO;
        state.spill = None;
        state.latched = None;
        self.not_full.notify_all();
    }

    fn level(&self) -> (usize, usize, ClockTime) {
        let state = self.state.lock().unwrap();
        let spilled = state.spill.as_ref().map(|s| s.pending as usize).unwrap_or(0);
        (state.items.len() + spilled, state.bytes, state.time)
    }

    fn dropped(&self) -> u64 {
        self.state.lock().unwrap().dropped
    }
}

// ============================================================================
// The stage
// ============================================================================

/// Observation handle onto a queue's fill level, usable after the queue
/// has been added to a pipeline.
#[derive(Debug, Clone)]
pub struct QueueWatch {
    inner: Arc<QueueInner>,
}

impl QueueWatch {
    /// Current fill level as (buffers incl. spilled, bytes, duration).
    pub fn level(&self) -> (usize, usize, ClockTime) {
        self.inner.level()
    }

    /// Buffers dropped so far under [`OverflowPolicy::DropNewest`].
    pub fn dropped(&self) -> u64 {
        self.inner.dropped()
    }
}

/// The decoupling queue stage. See the module docs.
#[derive(Debug)]
pub struct DecouplingQueue {
    inner: Arc<QueueInner>,
    ctx: Option<StageContext>,
    drain: Option<JoinHandle<()>>,
    overflow_reported: bool,
}

impl DecouplingQueue {
    /// Create a queue with the given limits and overflow policy.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(QueueInner::new(config)),
            ctx: None,
            drain: None,
            overflow_reported: false,
        }
    }

    /// Create a handle for observing this queue's fill level.
    pub fn watch(&self) -> QueueWatch {
        QueueWatch {
            inner: self.inner.clone(),
        }
    }

    fn stop_drain(&mut self) {
        self.inner.set_flushing(true);
        if let Some(handle) = self.drain.take() {
            let _ = handle.join();
        }
    }
}

impl Default for DecouplingQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl Stage for DecouplingQueue {
    fn pad_templates(&self) -> Vec<PadTemplate> {
        vec![
            PadTemplate::new("sink", PadDirection::Sink, Caps::any()),
            PadTemplate::new("src", PadDirection::Source, Caps::any()),
        ]
    }

    fn attach(&mut self, ctx: StageContext) {
        // Flushes and downward state changes must be able to wake a
        // producer blocked in process(); that signal cannot take the
        // stage lock, so it goes through the flush handler.
        let inner = self.inner.clone();
        ctx.set_flush_handler(Box::new(move |flushing| {
            inner.set_flushing(flushing);
        }));
        self.ctx = Some(ctx);
    }

    fn process(&mut self, _pad: &str, buffer: Buffer) -> FlowResult {
        let result = self.inner.push(buffer);
        let dropped = self.inner.dropped();
        if dropped > 0 && !self.overflow_reported {
            // Surface the first overflow; the watch handle tracks the
            // running count.
            self.overflow_reported = true;
            if let Some(ctx) = &self.ctx {
                let overflow = QueueOverflow {
                    queue: ctx.name().to_string(),
                    dropped,
                };
                ctx.post(MessageKind::Warning {
                    message: overflow.to_string(),
                });
            }
        }
        result
    }

    fn end_of_stream(&mut self, _pad: &str) -> FlowResult {
        // Queued behind the data; the drain thread forwards it last.
        self.inner.push_eos();
        FlowResult::Ok
    }

    fn change_state(&mut self, transition: Transition) -> StateChangeResult {
        match transition {
            Transition::ReadyToPaused => {
                let ctx = match &self.ctx {
                    Some(ctx) => ctx.clone(),
                    None => return StateChangeResult::Failure,
                };
                self.inner.set_flushing(false);
                let inner = self.inner.clone();
                self.drain = Some(std::thread::spawn(move || drain_loop(inner, ctx)));
            }
            Transition::PausedToReady => {
                self.stop_drain();
                self.inner.clear();
            }
            _ => {}
        }
        StateChangeResult::Success
    }

    fn flush(&mut self) {
        self.inner.clear();
    }
}

impl Drop for DecouplingQueue {
    fn drop(&mut self) {
        self.stop_drain();
    }
}

/// Dequeue and push downstream until EOS, flush or a fatal result.
fn drain_loop(inner: Arc<QueueInner>, ctx: StageContext) {
    tracing::debug!(stage = %ctx.name(), "queue drain thread started");
    while let Some(item) = inner.pop() {
        match item {
            QueueItem::Buffer(buffer) => match ctx.push("src", buffer) {
                FlowResult::Ok => {}
                FlowResult::Flushing => {
                    // Downstream flushing; our own flush will stop us.
                }
                other => {
                    // Hand the result to the producer on its next push.
                    inner.latch(other);
                    if other.is_fatal() {
                        ctx.post_error(format!("downstream returned {other}"));
                    }
                    break;
                }
            },
            QueueItem::Eos => {
                ctx.push_eos("src");
                break;
            }
        }
    }
    tracing::debug!(stage = %ctx.name(), "queue drain thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn buf(n: u8) -> Buffer {
        Buffer::from_bytes(vec![n; 4]).with_pts(ClockTime::from_millis(n as u64))
    }

    fn payload_first_byte(item: QueueItem) -> u8 {
        match item {
            QueueItem::Buffer(b) => b.as_bytes()[0],
            QueueItem::Eos => panic!("unexpected eos"),
        }
    }

    #[test]
    fn test_fifo_order() {
        let inner = QueueInner::new(QueueConfig::default());
        for n in 0..5 {
            assert_eq!(inner.push(buf(n)), FlowResult::Ok);
        }
        for n in 0..5 {
            assert_eq!(payload_first_byte(inner.pop().unwrap()), n);
        }
    }

    #[test]
    fn test_blocking_push_waits_for_space() {
        let inner = Arc::new(QueueInner::new(
            QueueConfig::default().max_buffers(2).max_bytes(0).max_time(ClockTime::ZERO),
        ));
        inner.push(buf(0));
        inner.push(buf(1));

        let pusher = {
            let inner = inner.clone();
            thread::spawn(move || inner.push(buf(2)))
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!pusher.is_finished());

        assert_eq!(payload_first_byte(inner.pop().unwrap()), 0);
        assert_eq!(pusher.join().unwrap(), FlowResult::Ok);
        assert_eq!(payload_first_byte(inner.pop().unwrap()), 1);
        assert_eq!(payload_first_byte(inner.pop().unwrap()), 2);
    }

    #[test]
    fn test_flush_wakes_blocked_producer() {
        let inner = Arc::new(QueueInner::new(
            QueueConfig::default().max_buffers(1).max_bytes(0).max_time(ClockTime::ZERO),
        ));
        inner.push(buf(0));

        let pusher = {
            let inner = inner.clone();
            thread::spawn(move || inner.push(buf(1)))
        };
        thread::sleep(Duration::from_millis(30));
        inner.set_flushing(true);
        assert_eq!(pusher.join().unwrap(), FlowResult::Flushing);
    }

    #[test]
    fn test_flush_wakes_blocked_consumer() {
        let inner = Arc::new(QueueInner::new(QueueConfig::default()));
        let popper = {
            let inner = inner.clone();
            thread::spawn(move || inner.pop())
        };
        thread::sleep(Duration::from_millis(30));
        inner.set_flushing(true);
        assert!(popper.join().unwrap().is_none());
    }

    #[test]
    fn test_drop_newest_counts_drops() {
        let inner = QueueInner::new(
            QueueConfig::default()
                .max_buffers(2)
                .max_bytes(0)
                .max_time(ClockTime::ZERO)
                .overflow(OverflowPolicy::DropNewest),
        );
        inner.push(buf(0));
        inner.push(buf(1));
        assert_eq!(inner.push(buf(2)), FlowResult::Ok);
        assert_eq!(inner.push(buf(3)), FlowResult::Ok);
        assert_eq!(inner.dropped(), 2);

        // The survivors are the oldest two.
        assert_eq!(payload_first_byte(inner.pop().unwrap()), 0);
        assert_eq!(payload_first_byte(inner.pop().unwrap()), 1);
    }

    #[test]
    fn test_spill_preserves_order_and_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let inner = QueueInner::new(
            QueueConfig::default()
                .max_buffers(2)
                .max_bytes(0)
                .max_time(ClockTime::ZERO)
                .overflow(OverflowPolicy::SpillToStorage(dir.path().join("spill.bin"))),
        );
        // Two in memory, three spilled.
        for n in 0..5 {
            assert_eq!(
                inner.push(Buffer::from_bytes(vec![n; (n + 1) as usize])
                    .with_pts(ClockTime::from_millis(n as u64))),
                FlowResult::Ok
            );
        }
        for n in 0..5u8 {
            let item = inner.pop().unwrap();
            let buffer = match item {
                QueueItem::Buffer(b) => b,
                QueueItem::Eos => panic!("unexpected eos"),
            };
            assert_eq!(buffer.len(), (n + 1) as usize);
            assert_eq!(buffer.as_bytes(), vec![n; (n + 1) as usize].as_slice());
            assert_eq!(buffer.pts(), ClockTime::from_millis(n as u64));
        }
    }

    #[test]
    fn test_spill_keeps_order_with_interleaved_pushes() {
        let dir = tempfile::tempdir().unwrap();
        let inner = QueueInner::new(
            QueueConfig::default()
                .max_buffers(1)
                .max_bytes(0)
                .max_time(ClockTime::ZERO)
                .overflow(OverflowPolicy::SpillToStorage(dir.path().join("spill.bin"))),
        );
        inner.push(buf(0)); // memory
        inner.push(buf(1)); // spill starts
        assert_eq!(payload_first_byte(inner.pop().unwrap()), 0);
        // Still spilling; a new push must not overtake the spilled one.
        inner.push(buf(2));
        assert_eq!(payload_first_byte(inner.pop().unwrap()), 1);
        assert_eq!(payload_first_byte(inner.pop().unwrap()), 2);
    }

    #[test]
    fn test_latched_result_returned_to_producer() {
        let inner = QueueInner::new(QueueConfig::default());
        inner.latch(FlowResult::Error);
        assert_eq!(inner.push(buf(0)), FlowResult::Error);
        inner.clear();
        assert_eq!(inner.push(buf(0)), FlowResult::Ok);
    }

    #[test]
    fn test_overflow_surfaces_as_bus_warning_once() {
        let bus = crate::bus::Bus::new();
        let queue = DecouplingQueue::new(
            QueueConfig::default()
                .max_buffers(1)
                .max_bytes(0)
                .max_time(ClockTime::ZERO)
                .overflow(OverflowPolicy::DropNewest),
        );
        let node = crate::stage::StageNode::new("q0", Box::new(queue), bus.clone());
        let src = crate::stage::pad::Pad::detached(&PadTemplate::new(
            "src",
            PadDirection::Source,
            Caps::any(),
        ));
        let sink = node.find_pad("sink").unwrap();
        crate::stage::pad::link(&src, &sink).unwrap();

        assert_eq!(src.push(buf(0)), FlowResult::Ok);
        assert_eq!(src.push(buf(1)), FlowResult::Ok);
        assert_eq!(src.push(buf(2)), FlowResult::Ok);

        let warnings: Vec<String> = bus
            .drain()
            .into_iter()
            .filter_map(|m| match m.kind {
                MessageKind::Warning { message } => Some(message),
                _ => None,
            })
            .collect();
        // Two drops, one warning; the running count lives on the watch.
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("q0"));
        assert!(warnings[0].contains("overflowed"));
    }

    #[test]
    fn test_eos_delivered_after_data() {
        let inner = QueueInner::new(QueueConfig::default());
        inner.push(buf(0));
        inner.push_eos();
        assert!(matches!(inner.pop().unwrap(), QueueItem::Buffer(_)));
        assert!(matches!(inner.pop().unwrap(), QueueItem::Eos));
    }
}
