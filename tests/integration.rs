//! End-to-end scenarios driving [`Router`] against
//! [`audiobridge_core::mock::MockAudioEndpointBackend`] instead of real
//! hardware.

use std::sync::Arc;
use std::time::{Duration, Instant};

use audiobridge_core::mock::{MockAudioEndpointBackend, MockDeviceEnumerator, MockDeviceState};
use audiobridge_core::{AudioFormat, Router, RouterConfig, RouterState, SampleEncoding};

fn stereo_f32(rate: u32) -> AudioFormat {
    AudioFormat::new(rate, 2, 32, 32, SampleEncoding::Float)
}

fn stereo_s16(rate: u32) -> AudioFormat {
    AudioFormat::new(rate, 2, 16, 16, SampleEncoding::Int)
}

/// Feeds `chunk_bytes` into `state` every `period` until `stop` is set,
/// simulating a capture device streaming continuously at its own clock
/// rather than dumping an entire clip into the mock queue at once.
fn spawn_feeder(
    state: Arc<MockDeviceState>,
    chunk_bytes: usize,
    period: Duration,
    stop: Arc<std::sync::atomic::AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let chunk = vec![0u8; chunk_bytes];
        while !stop.load(std::sync::atomic::Ordering::Acquire) {
            state.push_capture_bytes(&chunk);
            std::thread::sleep(period);
        }
    })
}

#[test]
fn format_match_steady_clocks_passes_bytes_through_without_resampling() {
    let capture_state = MockDeviceState::new(stereo_f32(48_000), 480);
    let render_state = MockDeviceState::new(stereo_f32(48_000), 480);

    let enumerator = MockDeviceEnumerator::new();
    enumerator.register("capture", Arc::clone(&capture_state));
    enumerator.register("render", Arc::clone(&render_state));

    // Feeds 10ms (480-frame) chunks continuously, matching render's own
    // period, so the steady-clock scenario never runs the source dry.
    let stop_feeder = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let feeder = spawn_feeder(Arc::clone(&capture_state), 480 * 8, Duration::from_millis(10), Arc::clone(&stop_feeder));

    let mut router = Router::new();
    router
        .start(
            &enumerator,
            &RouterConfig {
                capture_id: "capture".into(),
                render_id: "render".into(),
                exclusive: false,
                ring_capacity_bytes: None,
            },
        )
        .expect("router should start with matching formats");

    std::thread::sleep(Duration::from_millis(1200));
    stop_feeder.store(true, std::sync::atomic::Ordering::Release);
    feeder.join().expect("feeder thread should not panic");

    let status = router.status();
    assert_eq!(status.state, RouterState::Running);
    assert!(!status.resampler_active);
    assert_eq!(status.underruns, 0);
    assert!(
        render_state.rendered_len() >= 480_000,
        "render only consumed {} bytes",
        render_state.rendered_len()
    );

    router.stop();
}

#[test]
fn format_mismatch_engages_resampler_and_converts_rate() {
    let capture_state = MockDeviceState::new(stereo_s16(44_100), 441);
    let render_state = MockDeviceState::new(stereo_f32(48_000), 480);

    let enumerator = MockDeviceEnumerator::new();
    enumerator.register("capture", Arc::clone(&capture_state));
    enumerator.register("render", Arc::clone(&render_state));

    let stop_feeder = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let feeder = spawn_feeder(Arc::clone(&capture_state), 441 * 4, Duration::from_millis(10), Arc::clone(&stop_feeder));

    let mut router = Router::new();
    router
        .start(
            &enumerator,
            &RouterConfig {
                capture_id: "capture".into(),
                render_id: "render".into(),
                exclusive: false,
                ring_capacity_bytes: None,
            },
        )
        .expect("router should start across a format mismatch");

    std::thread::sleep(Duration::from_millis(1300));
    stop_feeder.store(true, std::sync::atomic::Ordering::Release);
    feeder.join().expect("feeder thread should not panic");

    let status = router.status();
    assert!(status.resampler_active);

    let expected = 384_000usize;
    let tolerance = expected / 50; // 2%
    let got = render_state.rendered_len();
    assert!(
        got + tolerance >= expected,
        "render consumed {got} bytes, expected at least ~{expected}"
    );

    router.stop();
}

#[test]
fn render_starvation_counts_underruns_without_stopping() {
    let capture_state = MockDeviceState::new(stereo_f32(48_000), 480);
    let render_state = MockDeviceState::new(stereo_f32(48_000), 480);

    let enumerator = MockDeviceEnumerator::new();
    enumerator.register("capture", Arc::clone(&capture_state));
    enumerator.register("render", Arc::clone(&render_state));

    let mut router = Router::new();
    router
        .start(
            &enumerator,
            &RouterConfig {
                capture_id: "capture".into(),
                render_id: "render".into(),
                exclusive: false,
                ring_capacity_bytes: None,
            },
        )
        .expect("router should start");

    let feeder_state = Arc::clone(&capture_state);
    let stop_feeder = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let feeder_stop = Arc::clone(&stop_feeder);
    let feeder = std::thread::spawn(move || {
        while !feeder_stop.load(std::sync::atomic::Ordering::Acquire) {
            feeder_state.push_capture_bytes(&vec![0u8; 8 * 480]);
            std::thread::sleep(Duration::from_millis(200));
        }
    });

    std::thread::sleep(Duration::from_millis(1200));
    stop_feeder.store(true, std::sync::atomic::Ordering::Release);
    feeder.join().expect("feeder thread should not panic");

    let status = router.status();
    assert_eq!(status.state, RouterState::Running);
    assert!(status.underruns > 0, "expected at least one underrun from the 200ms capture bursts");

    router.stop();
}

#[test]
fn capture_overrun_drops_excess_without_corrupting_the_ring() {
    let capture_state = MockDeviceState::new(stereo_f32(48_000), 480);
    let render_state = MockDeviceState::new(stereo_f32(48_000), 48_000);

    let enumerator = MockDeviceEnumerator::new();
    enumerator.register("capture", Arc::clone(&capture_state));
    enumerator.register("render", Arc::clone(&render_state));

    let mut router = Router::new();
    router
        .start(
            &enumerator,
            &RouterConfig {
                capture_id: "capture".into(),
                render_id: "render".into(),
                exclusive: false,
                // A small ring so a single large burst overruns it, standing
                // in for render stalling for an extended period while
                // capture keeps producing.
                ring_capacity_bytes: Some(4096),
            },
        )
        .expect("router should start");

    // One burst far larger than the ring can hold.
    capture_state.push_capture_bytes(&vec![0u8; 200_000]);
    std::thread::sleep(Duration::from_millis(300));

    let status = router.status();
    assert_eq!(status.state, RouterState::Running, "an overrun must not crash or stall the session");

    // Stream should keep making progress after the burst.
    capture_state.push_capture_bytes(&vec![0u8; 8000]);
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(router.status().state, RouterState::Running);

    router.stop();
}

#[test]
fn cold_stop_while_busy_always_joins_within_budget() {
    let capture_state = MockDeviceState::new(stereo_f32(48_000), 480);
    let render_state = MockDeviceState::new(stereo_f32(48_000), 480);

    let enumerator = MockDeviceEnumerator::new();
    enumerator.register("capture", Arc::clone(&capture_state));
    enumerator.register("render", Arc::clone(&render_state));

    // Keeps the capture queue topped up so `wait_ready` never blocks for
    // its full 2s timeout mid-iteration, matching the spirit of a live
    // device that is continuously producing.
    capture_state.push_capture_bytes(&vec![0u8; 4 * 480 * 8]);

    let suite_start = Instant::now();
    for i in 0..100 {
        let mut router = Router::new();
        router
            .start(
                &enumerator,
                &RouterConfig {
                    capture_id: "capture".into(),
                    render_id: "render".into(),
                    exclusive: false,
                    ring_capacity_bytes: Some(8192),
                },
            )
            .unwrap_or_else(|e| panic!("start iteration {i} failed: {e}"));

        std::thread::sleep(Duration::from_millis(10));
        capture_state.push_capture_bytes(&vec![0u8; 480 * 8]);

        let iter_start = Instant::now();
        router.stop();
        assert!(
            iter_start.elapsed() < Duration::from_secs(5),
            "iteration {i} exceeded the per-join timeout budget"
        );
    }

    assert!(
        suite_start.elapsed() < Duration::from_secs(60),
        "100 start/stop cycles took unexpectedly long: {:?}",
        suite_start.elapsed()
    );
}

#[test]
fn exclusive_mode_alignment_retry_recovers_with_device_reported_period() {
    let capture_state = MockDeviceState::new(stereo_f32(48_000), 192);
    let render_state = MockDeviceState::new(stereo_f32(48_000), 192);
    MockAudioEndpointBackend::with_misalignment_once(&capture_state, 192);

    let enumerator = MockDeviceEnumerator::new();
    enumerator.register("capture", Arc::clone(&capture_state));
    enumerator.register("render", Arc::clone(&render_state));

    let mut router = Router::new();
    router
        .start(
            &enumerator,
            &RouterConfig {
                capture_id: "capture".into(),
                render_id: "render".into(),
                exclusive: true,
                ring_capacity_bytes: None,
            },
        )
        .expect("router should recover from a single buffer-size-not-aligned rejection");

    let status = router.status();
    assert_eq!(status.state, RouterState::Running);
    assert_eq!(status.capture_buffer_frames, 192);

    router.stop();
}
