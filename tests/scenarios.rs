//! End-to-end pipeline scenarios.

use aqueduct::prelude::*;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Poll until `cond` holds or `timeout` passes.
fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn wait_for_eos(bus: &Bus, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match bus.poll(remaining.min(Duration::from_millis(50))) {
            Some(msg) if matches!(msg.kind, MessageKind::Eos) => return true,
            Some(_) => {}
            None => {}
        }
    }
    false
}

fn audio_caps(rates: std::ops::RangeInclusive<i64>) -> Caps {
    Caps::from(Structure::new("audio/x-test").field("rate", rates))
}

// ============================================================================
// Scenario 1: preroll and playback
// ============================================================================

#[test]
fn scenario_preroll_and_playback() {
    init_tracing();
    let pipeline = Pipeline::new("playback");
    pipeline.add("src", TestSource::new(4).payload_size(8)).unwrap();
    pipeline.add("fwd", PassThrough::new()).unwrap();
    let collected = {
        let sink = CollectorSink::new();
        let handle = sink.collected();
        pipeline.add("sink", sink).unwrap();
        handle
    };
    pipeline.link_stages("src", "fwd").unwrap();
    pipeline.link_stages("fwd", "sink").unwrap();

    // The prerolling sink makes the change asynchronous; the pipeline
    // finishes it on its own once the first buffer arrives.
    let result = pipeline.set_state(State::Playing).unwrap();
    assert_eq!(result, StateChangeResult::Async);

    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.current_state() == State::Playing
    }));
    assert!(wait_for_eos(&pipeline.bus(), Duration::from_secs(5)));

    let buffers = collected.lock().unwrap();
    assert_eq!(buffers.len(), 4);
    for (n, buffer) in buffers.iter().enumerate() {
        assert_eq!(buffer.as_bytes()[0], n as u8);
        assert_eq!(buffer.pts(), ClockTime::from_millis(10 * n as u64));
    }
    drop(buffers);

    pipeline.set_state(State::Null).unwrap();
    assert_eq!(pipeline.current_state(), State::Null);
}

// ============================================================================
// Scenario 2: format agreement
// ============================================================================

#[test]
fn scenario_negotiation_picks_overlap() {
    init_tracing();
    let pipeline = Pipeline::new("nego");
    pipeline
        .add("src", TestSource::new(1).with_caps(audio_caps(1..=100)))
        .unwrap();
    let sink = CollectorSink::new()
        .preroll(false)
        .restrict(audio_caps(50..=200));
    let collected = sink.collected();
    pipeline.add("sink", sink).unwrap();
    let link = pipeline.link_stages("src", "sink").unwrap();
    assert!(link.caps().is_none());

    pipeline.set_state(State::Playing).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        !collected.lock().unwrap().is_empty()
    }));

    // The agreed format is the deterministic fixation of the overlap.
    let caps = link.caps().unwrap();
    assert!(caps.is_fixed());
    let clause = caps.preferred().unwrap().clone();
    assert_eq!(clause.name(), "audio/x-test");
    assert_eq!(clause.get("rate").unwrap().as_fixed_int(), Some(50));

    // Buffers crossing the link carry the agreed caps.
    let buffers = collected.lock().unwrap();
    assert_eq!(buffers[0].caps(), Some(&caps));
    drop(buffers);

    pipeline.set_state(State::Null).unwrap();
}

// ============================================================================
// Scenario 3: negotiation failure surfaces on the bus
// ============================================================================

struct RejectingSink;

impl Stage for RejectingSink {
    fn pad_templates(&self) -> Vec<PadTemplate> {
        vec![PadTemplate::new("sink", PadDirection::Sink, Caps::any())]
    }

    fn set_format(&mut self, _pad: &str, _caps: &Caps) -> bool {
        false
    }
}

#[test]
fn scenario_negotiation_failure_reported() {
    init_tracing();
    let pipeline = Pipeline::new("nego-fail");
    pipeline
        .add("src", TestSource::new(10).with_caps(audio_caps(1..=100)))
        .unwrap();
    pipeline.add("sink", RejectingSink).unwrap();
    pipeline.link_stages("src", "sink").unwrap();

    pipeline.set_state(State::Playing).unwrap();

    // The first push fails to negotiate; the source stops and an error
    // message reaches the application.
    let bus = pipeline.bus();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut saw_error = false;
    while Instant::now() < deadline {
        if let Some(msg) = bus.poll(Duration::from_millis(50)) {
            if let MessageKind::Error { message } = msg.kind {
                assert!(message.contains("src"));
                saw_error = true;
                break;
            }
        }
    }
    assert!(saw_error, "no error message on the bus");

    pipeline.set_state(State::Null).unwrap();
}

#[test]
fn scenario_incompatible_templates_fail_at_link_time() {
    let pipeline = Pipeline::new("bad-link");
    pipeline
        .add("src", TestSource::new(1).with_caps(audio_caps(1..=100)))
        .unwrap();
    pipeline
        .add(
            "sink",
            CollectorSink::new().restrict(Caps::from(
                Structure::new("video/x-test").field("rate", 1i64..=100),
            )),
        )
        .unwrap();
    assert!(matches!(
        pipeline.link_stages("src", "sink").unwrap_err(),
        Error::Link(_)
    ));
}

// ============================================================================
// Scenario 4: bounded queue with backpressure
// ============================================================================

#[test]
fn scenario_queue_backpressure_loses_nothing() {
    init_tracing();
    let pipeline = Pipeline::new("queued");
    pipeline
        .add(
            "src",
            TestSource::new(100)
                .payload_size(4)
                .pts_step(ClockTime::from_millis(1)),
        )
        .unwrap();
    let queue = DecouplingQueue::new(
        QueueConfig::default()
            .max_buffers(3)
            .max_bytes(0)
            .max_time(ClockTime::ZERO),
    );
    let watch = queue.watch();
    pipeline.add("queue", queue).unwrap();
    let sink = CollectorSink::new().preroll(false);
    let collected = sink.collected();
    pipeline.add("sink", sink).unwrap();
    pipeline.link_stages("src", "queue").unwrap();
    pipeline.link_stages("queue", "sink").unwrap();

    pipeline.set_state(State::Playing).unwrap();
    assert!(wait_for_eos(&pipeline.bus(), Duration::from_secs(10)));

    // Every buffer crossed the thread boundary, in order, none dropped.
    let buffers = collected.lock().unwrap();
    assert_eq!(buffers.len(), 100);
    for (n, buffer) in buffers.iter().enumerate() {
        assert_eq!(buffer.as_bytes()[0], n as u8);
    }
    drop(buffers);
    assert_eq!(watch.dropped(), 0);

    pipeline.set_state(State::Null).unwrap();
}

#[test]
fn scenario_shutdown_mid_stream_does_not_hang() {
    init_tracing();
    let pipeline = Pipeline::new("teardown");
    pipeline
        .add("src", TestSource::new(1_000_000).pts_step(ClockTime::from_nanos(1)))
        .unwrap();
    pipeline
        .add(
            "queue",
            DecouplingQueue::new(
                QueueConfig::default()
                    .max_buffers(2)
                    .max_bytes(0)
                    .max_time(ClockTime::ZERO),
            ),
        )
        .unwrap();
    pipeline.add("sink", CollectorSink::new().preroll(false)).unwrap();
    pipeline.link_stages("src", "queue").unwrap();
    pipeline.link_stages("queue", "sink").unwrap();

    pipeline.set_state(State::Playing).unwrap();
    std::thread::sleep(Duration::from_millis(50));

    // The producer is likely blocked on the full queue right now; the
    // downward change must unblock and join everything.
    pipeline.set_state(State::Null).unwrap();
    assert_eq!(pipeline.current_state(), State::Null);
}

// ============================================================================
// Scenario 5: live pipelines and NoPreroll
// ============================================================================

#[test]
fn scenario_live_source_no_preroll_is_idempotent() {
    init_tracing();
    let pipeline = Pipeline::new("live");
    pipeline
        .add("src", TestSource::new(100).live(true))
        .unwrap();
    pipeline
        .add("sink", CollectorSink::new().preroll(false))
        .unwrap();
    pipeline.link_stages("src", "sink").unwrap();

    assert_eq!(
        pipeline.set_state(State::Paused).unwrap(),
        StateChangeResult::NoPreroll
    );
    // Asking again is answered the same way, without re-running anything.
    assert_eq!(
        pipeline.set_state(State::Paused).unwrap(),
        StateChangeResult::NoPreroll
    );
    assert_eq!(
        pipeline.set_state(State::Null).unwrap(),
        StateChangeResult::Success
    );
}

// ============================================================================
// Renegotiation
// ============================================================================

#[test]
fn renegotiation_requires_both_sides() {
    let pipeline = Pipeline::new("renego");
    pipeline
        .add("src", TestSource::new(1).with_caps(audio_caps(1..=100)))
        .unwrap();
    pipeline.add("sink", CollectorSink::new().preroll(false)).unwrap();
    let link = pipeline.link_stages("src", "sink").unwrap();
    link.negotiate().unwrap();

    // Neither built-in stage supports mid-stream format changes; the
    // agreed format stays in place.
    assert!(link.renegotiate().is_err());
    assert!(link.caps().is_some());
}

// ============================================================================
// Pass-through counting across a running pipeline
// ============================================================================

#[test]
fn passthrough_sees_every_buffer() {
    init_tracing();
    let pipeline = Pipeline::new("count");
    pipeline.add("src", TestSource::new(25)).unwrap();
    let counter = {
        let fwd = PassThrough::new();
        let counter = fwd.counter();
        pipeline.add("fwd", fwd).unwrap();
        counter
    };
    let sink = CollectorSink::new().preroll(false);
    let collected = sink.collected();
    pipeline.add("sink", sink).unwrap();
    pipeline.link_stages("src", "fwd").unwrap();
    pipeline.link_stages("fwd", "sink").unwrap();

    pipeline.set_state(State::Playing).unwrap();
    assert!(wait_for_eos(&pipeline.bus(), Duration::from_secs(5)));
    assert_eq!(counter.load(Ordering::Relaxed), 25);
    assert_eq!(collected.lock().unwrap().len(), 25);

    pipeline.set_state(State::Null).unwrap();
}
