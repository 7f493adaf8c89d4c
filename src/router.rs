//! Supervisor that composes [`crate::capture::CaptureEndpoint`],
//! [`crate::render::RenderEndpoint`], [`crate::ring_buffer::RingBuffer`],
//! [`crate::resampler::Resampler`] and [`crate::pump::ResamplerPump`],
//! negotiates formats, and owns the whole session's lifecycle (spec.md
//! §4.6).

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::backend::{DeviceEnumerator, Flow};
use crate::capture::CaptureEndpoint;
use crate::format::AudioFormat;
use crate::pump::ResamplerPump;
use crate::render::{NegotiatedRender, RenderEndpoint};
use crate::resampler::{Resampler, ResamplerOutcome};
use crate::ring_buffer::RingBuffer;
use crate::{Error, Result};

/// ~500ms of 48kHz stereo 32-bit float: the one constant ring-buffer size
/// sized to absorb clock drift between two independent hardware clocks
/// (spec.md §4.6 step 3).
const RING_CAPACITY_BYTES: usize = {
    const SAMPLE_RATE: usize = 48_000;
    const BLOCK_ALIGN: usize = 2 * 4; // stereo, 32-bit float
    const MILLIS: usize = 500;
    SAMPLE_RATE * BLOCK_ALIGN * MILLIS / 1_000
};

/// Upper bound on the pre-buffering gate before starting the render device
/// (spec.md §4.6 step 8).
const PRE_BUFFER_MAX_WAIT: Duration = Duration::from_millis(500);

/// Timeout each worker join is given during `stop` (spec.md §4.6, §5).
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Arguments to [`Router::start`] (ambient addition: spec.md's `start`
/// takes three positional arguments; bundled into a struct here so tests
/// can override the ring capacity without touching the public
/// three-argument shape spec.md describes for the shell).
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Opaque id of the capture device to open.
    pub capture_id: String,
    /// Opaque id of the render device to open.
    pub render_id: String,
    /// Whether to negotiate exclusive mode (vs. shared/mix format).
    pub exclusive: bool,
    /// Overrides [`RING_CAPACITY_BYTES`]; `None` uses the spec default.
    /// Exists so tests can run scenarios at a smaller capacity than 500ms
    /// of real audio without waiting real wall-clock time.
    pub ring_capacity_bytes: Option<usize>,
}

/// The four settings keys the shell persists across launches (spec.md §6
/// "Persisted state"). This crate never reads or writes storage itself —
/// the shell owns that — but names the keys so callers building a
/// `RouterConfig` from persisted settings have a single shared vocabulary
/// instead of ad hoc strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistedSettingsKey {
    /// Opaque id of the last-selected capture device.
    CaptureDevice,
    /// Opaque id of the last-selected render device.
    RenderDevice,
    /// Whether exclusive mode was selected.
    ExclusiveMode,
    /// Whether the shell should start routing automatically on launch.
    AutoStart,
}

/// Router state machine (spec.md §3 "Router state", §4.6). The spec's
/// separate `state` + `errorMessage` fields are merged into one
/// enum-with-payload, matching Rust idiom; [`RouterStatus`] flattens it
/// back out for API parity with spec.md's `getStatus`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterState {
    /// No active session.
    Stopped,
    /// Capture and render threads are live.
    Running,
    /// A session failed to start, or a worker hit a runtime error.
    Error,
}

/// Read-only snapshot returned by [`Router::status`] (spec.md §4.6
/// `getStatus`). Safe to call from any thread concurrently with the audio
/// threads.
#[derive(Debug, Clone)]
pub struct RouterStatus {
    /// Current state.
    pub state: RouterState,
    /// Human-readable error message, set iff `state == Error`.
    pub error_message: Option<String>,
    /// Negotiated capture format, if a session is or was running.
    pub capture_format: Option<AudioFormat>,
    /// Negotiated render format, if a session is or was running.
    pub render_format: Option<AudioFormat>,
    /// Capture device period, in frames.
    pub capture_buffer_frames: u32,
    /// Render device period, in frames.
    pub render_buffer_frames: u32,
    /// Render underrun count (spec.md §8 invariant 4): monotonic, reset
    /// only by a fresh `start`.
    pub underruns: u64,
    /// Whether the resampler/pump stage is active for this session.
    pub resampler_active: bool,
}

struct Session {
    capture: CaptureEndpoint,
    render: RenderEndpoint,
    pump: Option<ResamplerPump>,
    _resampler: Option<Arc<Mutex<Resampler>>>,
    _ring_a: Arc<RingBuffer>,
    _ring_b: Option<Arc<RingBuffer>>,
    resampler_active: bool,
}

/// Supervisor: negotiates formats, allocates ring buffers, and owns the
/// lifecycle of the capture/render/pump threads (spec.md §4.6).
pub struct Router {
    state: RouterState,
    error_message: Option<String>,
    session: Option<Session>,
    last_capture_format: Option<AudioFormat>,
    last_render_format: Option<AudioFormat>,
    last_capture_buffer_frames: u32,
    last_render_buffer_frames: u32,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Constructs a router in the `Stopped` state.
    pub fn new() -> Self {
        Self {
            state: RouterState::Stopped,
            error_message: None,
            session: None,
            last_capture_format: None,
            last_render_format: None,
            last_capture_buffer_frames: 0,
            last_render_buffer_frames: 0,
        }
    }

    /// Starts a routing session (spec.md §4.6 `start`). Any previous
    /// session is torn down first. On any initialization failure, all
    /// resources allocated so far are released and the router transitions
    /// to `Error` with a descriptive message.
    pub fn start(&mut self, enumerator: &dyn DeviceEnumerator, config: &RouterConfig) -> Result<()> {
        self.stop();

        match self.start_inner(enumerator, config) {
            Ok(session) => {
                self.last_capture_buffer_frames = session.capture.buffer_frames();
                self.last_render_buffer_frames = session.render.buffer_frames();
                self.last_capture_format = Some(session.capture.format());
                self.last_render_format = Some(session.render.format());
                self.session = Some(session);
                self.state = RouterState::Running;
                self.error_message = None;
                Ok(())
            }
            Err(e) => {
                self.state = RouterState::Error;
                self.error_message = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn start_inner(&mut self, enumerator: &dyn DeviceEnumerator, config: &RouterConfig) -> Result<Session> {
        let ring_capacity = config.ring_capacity_bytes.unwrap_or(RING_CAPACITY_BYTES);
        let ring_a = Arc::new(RingBuffer::new(ring_capacity));

        let capture_backend = enumerator.open(&config.capture_id, Flow::Capture)?;
        let capture = CaptureEndpoint::start(capture_backend, config.exclusive, Arc::clone(&ring_a))?;

        let render_backend = match enumerator.open(&config.render_id, Flow::Render) {
            Ok(b) => b,
            Err(e) => {
                let _ = capture.stop(JOIN_TIMEOUT);
                return Err(e);
            }
        };

        // Negotiate render's format (without starting its device yet) so
        // the resampler decision can be made first, and the device is
        // only ever started against the ring it will actually read from
        // (spec.md §4.6 steps 5-6).
        let negotiated_render = match NegotiatedRender::negotiate(render_backend, config.exclusive, Some(capture.format())) {
            Ok(n) => n,
            Err(e) => {
                let _ = capture.stop(JOIN_TIMEOUT);
                return Err(e);
            }
        };

        let mut resampler = Resampler::new();
        let outcome = resampler.configure(capture.format(), negotiated_render.format());

        match outcome {
            ResamplerOutcome::NoOp => {
                // Pre-buffering gate (spec.md §4.6 step 8): wait for ring
                // #1 — render's source ring in this path — to hold at
                // least two periods, or 500ms, before starting render.
                pre_buffer_gate(
                    &ring_a,
                    negotiated_render.buffer_frames(),
                    negotiated_render.format().block_align(),
                );
                let render = match negotiated_render.start(Arc::clone(&ring_a)) {
                    Ok(r) => r,
                    Err(e) => {
                        let _ = capture.stop(JOIN_TIMEOUT);
                        return Err(e);
                    }
                };
                Ok(Session {
                    capture,
                    render,
                    pump: None,
                    _resampler: None,
                    _ring_a: ring_a,
                    _ring_b: None,
                    resampler_active: false,
                })
            }
            ResamplerOutcome::Ready => {
                let ring_b = Arc::new(RingBuffer::new(ring_capacity));
                let resampler = Arc::new(Mutex::new(resampler));
                let pump = ResamplerPump::start(
                    Arc::clone(&ring_a),
                    Arc::clone(&ring_b),
                    Arc::clone(&resampler),
                    capture.format(),
                );

                // Render's source ring is now ring #2, fed by the pump.
                pre_buffer_gate(&ring_b, negotiated_render.buffer_frames(), negotiated_render.format().block_align());

                let render = match negotiated_render.start(Arc::clone(&ring_b)) {
                    Ok(r) => r,
                    Err(e) => {
                        if pump.stop(JOIN_TIMEOUT).is_none() {
                            tracing::warn!("pump thread join timed out during rollback");
                        }
                        let _ = capture.stop(JOIN_TIMEOUT);
                        return Err(e);
                    }
                };

                Ok(Session {
                    capture,
                    render,
                    pump: Some(pump),
                    _resampler: Some(resampler),
                    _ring_a: ring_a,
                    _ring_b: Some(ring_b),
                    resampler_active: true,
                })
            }
            ResamplerOutcome::Unsupported => {
                let _ = capture.stop(JOIN_TIMEOUT);
                Err(Error::UnsupportedFormat)
            }
        }
    }

    /// Idempotent: tears down any active session (spec.md §4.6 `stop`
    /// ordering — pump, then capture, then render, then drop ring
    /// buffers). Always transitions to `Stopped`.
    pub fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            if let Some(pump) = session.pump {
                if pump.stop(JOIN_TIMEOUT).is_none() {
                    tracing::warn!("pump thread join timed out during stop");
                }
            }
            if session.capture.stop(JOIN_TIMEOUT).is_none() {
                tracing::warn!("capture thread join timed out during stop");
            }
            if session.render.stop(JOIN_TIMEOUT).is_none() {
                tracing::warn!("render thread join timed out during stop");
            }
            // `_ring_a`/`_ring_b` drop here, once no thread still holds
            // them (spec.md §4.6 "drop ring buffers").
        }
        self.state = RouterState::Stopped;
        self.error_message = None;
    }

    /// Read-only status snapshot (spec.md §4.6 `getStatus`). Safe to call
    /// concurrently with an active session's audio threads.
    pub fn status(&self) -> RouterStatus {
        let underruns = self.session.as_ref().map_or(0, |s| s.render.underrun_count());
        let resampler_active = self.session.as_ref().is_some_and(|s| s.resampler_active);
        RouterStatus {
            state: self.state.clone(),
            error_message: self.error_message.clone(),
            capture_format: self.last_capture_format,
            render_format: self.last_render_format,
            capture_buffer_frames: self.last_capture_buffer_frames,
            render_buffer_frames: self.last_render_buffer_frames,
            underruns,
            resampler_active,
        }
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spin-waits (polling at 1ms) until `ring` holds at least two render
/// periods worth of bytes, or `PRE_BUFFER_MAX_WAIT` elapses, whichever
/// comes first (spec.md §4.6 step 8, §9 "Pre-buffering gate"). Prevents an
/// immediate underrun on the render device's first period.
fn pre_buffer_gate(ring: &RingBuffer, buffer_frames: u32, block_align: u32) {
    let target = 2 * buffer_frames as usize * block_align as usize;
    if target == 0 {
        return;
    }
    let deadline = Instant::now() + PRE_BUFFER_MAX_WAIT;
    while ring.available_read() < target && Instant::now() < deadline {
        std::thread::sleep(crate::negotiate::POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleEncoding;
    use crate::mock::{MockDeviceEnumerator, MockDeviceState};

    fn stereo_f32(rate: u32) -> AudioFormat {
        AudioFormat::new(rate, 2, 32, 32, SampleEncoding::Float)
    }

    fn matched_enumerator() -> (MockDeviceEnumerator, Arc<MockDeviceState>, Arc<MockDeviceState>) {
        let capture_state = MockDeviceState::new(stereo_f32(48_000), 480);
        let render_state = MockDeviceState::new(stereo_f32(48_000), 480);
        let enumerator = MockDeviceEnumerator::new();
        enumerator.register("capture", Arc::clone(&capture_state));
        enumerator.register("render", Arc::clone(&render_state));
        (enumerator, capture_state, render_state)
    }

    fn config() -> RouterConfig {
        RouterConfig {
            capture_id: "capture".into(),
            render_id: "render".into(),
            exclusive: false,
            ring_capacity_bytes: Some(8192),
        }
    }

    /// Spec.md §8 invariant 5: `stop()` from `Stopped` is a no-op.
    #[test]
    fn stop_from_stopped_is_idempotent() {
        let mut router = Router::new();
        assert_eq!(router.status().state, RouterState::Stopped);
        router.stop();
        router.stop();
        assert_eq!(router.status().state, RouterState::Stopped);
    }

    /// Spec.md §8 invariant 5: `stop()` from `Error` is a no-op and leaves
    /// the router `Stopped`.
    #[test]
    fn stop_from_error_is_idempotent() {
        let (enumerator, _capture, _render) = matched_enumerator();
        let mut router = Router::new();
        let bad_config = RouterConfig {
            capture_id: "does-not-exist".into(),
            render_id: "render".into(),
            exclusive: false,
            ring_capacity_bytes: Some(8192),
        };
        let err = router.start(&enumerator, &bad_config);
        assert!(err.is_err());
        assert_eq!(router.status().state, RouterState::Error);

        router.stop();
        router.stop();
        assert_eq!(router.status().state, RouterState::Stopped);
        assert!(router.status().error_message.is_none());
    }

    /// Spec.md §8 invariant 6: after `start; stop; start` with identical
    /// arguments, status equals the first `Running` status except for
    /// `underruns`, which resets to 0.
    #[test]
    fn start_stop_start_round_trip_resets_underruns_only() {
        let (enumerator, capture_state, _render_state) = matched_enumerator();
        let cfg = config();

        let mut router = Router::new();
        router.start(&enumerator, &cfg).expect("first start should succeed");
        capture_state.push_capture_bytes(&vec![0u8; 8 * 4 * 480]);
        std::thread::sleep(Duration::from_millis(50));
        let first = router.status();
        assert_eq!(first.state, RouterState::Running);
        assert!(!first.resampler_active);

        router.stop();
        assert_eq!(router.status().state, RouterState::Stopped);

        // Pre-fill the capture queue before the second `start` so the
        // pre-buffering gate clears quickly and render never starves
        // before this test reads the fresh session's `underruns`.
        capture_state.push_capture_bytes(&vec![0u8; 8 * 480 * 10]);
        router.start(&enumerator, &cfg).expect("second start should succeed");
        let second = router.status();

        assert_eq!(second.state, first.state);
        assert_eq!(second.capture_format, first.capture_format);
        assert_eq!(second.render_format, first.render_format);
        assert_eq!(second.capture_buffer_frames, first.capture_buffer_frames);
        assert_eq!(second.render_buffer_frames, first.render_buffer_frames);
        assert_eq!(second.resampler_active, first.resampler_active);
        assert_eq!(second.underruns, 0);

        router.stop();
    }

    /// Spec.md §8 invariant 3: equivalent formats mean no resampler/pump.
    #[test]
    fn matched_formats_never_engage_the_resampler() {
        let (enumerator, _capture, _render) = matched_enumerator();
        let mut router = Router::new();
        router.start(&enumerator, &config()).expect("start should succeed");
        assert!(!router.status().resampler_active);
        router.stop();
    }
}
