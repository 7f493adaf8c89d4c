//! In-memory [`AudioEndpointBackend`] driven by a configurable frame clock,
//! used by this crate's own unit tests and by the `tests/` integration
//! suite's end-to-end scenarios (spec.md §8 "driver uses mock endpoints
//! that produce/consume bytes at configurable rates").
//!
//! Gated behind `#[cfg(any(test, feature = "mock"))]` (Cargo.toml) so it
//! never ships in a release build that doesn't need it, but is reachable
//! from the separate `tests/` compilation unit via the `mock` feature.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::backend::{
    AudioEndpointBackend, CapturePacket, DeviceEnumerator, DeviceInfo, Flow, InitParams, RenderBuffer, ShareMode,
    WaitOutcome,
};
use crate::format::AudioFormat;
use crate::{Error, Result};

/// Shared knobs for a [`MockAudioEndpointBackend`], set up before a test
/// starts a `Router` session and inspected afterward.
pub struct MockDeviceState {
    /// Bytes fed into the capture side; `push_capture_bytes` appends here,
    /// the capture backend drains it on each `for_each_capture_packet`.
    capture_queue: Mutex<VecDeque<u8>>,
    capture_cvar: Condvar,
    /// Bytes written by the render side, for the test driver to inspect.
    rendered: Mutex<Vec<u8>>,
    /// Format this device will report/accept.
    format: AudioFormat,
    /// Device period, in frames.
    period_frames: u32,
    /// When set, the first `initialize` call returns
    /// `BufferSizeNotAligned { required_frames }` and the second succeeds
    /// (spec.md §8 scenario 6).
    misalign_once: AtomicBool,
    required_aligned_frames: AtomicU32,
    /// If true, every `wait_ready`/capture/render call returns `RuntimeLost`.
    device_lost: AtomicBool,
    /// How many times `render_cycle` read nothing at all from the caller's
    /// `fill` closure (i.e. how many underruns the render side drove into
    /// its backend); useful for tests asserting on starvation without
    /// reaching into `RenderEndpoint` internals.
    empty_render_cycles: AtomicU64,
}

impl MockDeviceState {
    /// Creates shared state for a device of the given format and period.
    pub fn new(format: AudioFormat, period_frames: u32) -> Arc<Self> {
        Arc::new(Self {
            capture_queue: Mutex::new(VecDeque::new()),
            capture_cvar: Condvar::new(),
            rendered: Mutex::new(Vec::new()),
            format,
            period_frames,
            misalign_once: AtomicBool::new(false),
            required_aligned_frames: AtomicU32::new(0),
            device_lost: AtomicBool::new(false),
            empty_render_cycles: AtomicU64::new(0),
        })
    }

    /// Appends bytes the capture backend should hand out on its next
    /// packet drain, waking any thread waiting in `wait_ready`.
    pub fn push_capture_bytes(&self, bytes: &[u8]) {
        let mut q = self.capture_queue.lock().expect("mock capture queue poisoned");
        q.extend(bytes.iter().copied());
        self.capture_cvar.notify_all();
    }

    /// Total bytes the render side has ever written downstream.
    pub fn rendered_len(&self) -> usize {
        self.rendered.lock().expect("mock render buffer poisoned").len()
    }

    /// Simulates a device disappearing mid-stream.
    pub fn set_lost(&self) {
        self.device_lost.store(true, Ordering::Release);
        self.capture_cvar.notify_all();
    }

    fn is_lost(&self) -> bool {
        self.device_lost.load(Ordering::Acquire)
    }
}

/// One opened mock device handle: a [`Flow`] plus a reference to the
/// shared [`MockDeviceState`] the test driver configures.
pub struct MockAudioEndpointBackend {
    flow: Flow,
    state: Arc<MockDeviceState>,
    negotiated_format: Option<AudioFormat>,
    negotiated_period: u32,
    share_mode: ShareMode,
    already_retried_alignment: bool,
}

impl MockAudioEndpointBackend {
    /// Wraps `state` as a backend handle for `flow`.
    pub fn new(flow: Flow, state: Arc<MockDeviceState>) -> Self {
        Self {
            flow,
            state,
            negotiated_format: None,
            negotiated_period: 0,
            share_mode: ShareMode::Shared,
            already_retried_alignment: false,
        }
    }

    /// Configures this device (by way of its shared state, so both ends of
    /// a test see it) to fail the first `initialize` in exclusive mode
    /// with `BufferSizeNotAligned`, then succeed on the retry — spec.md §8
    /// scenario 6.
    pub fn with_misalignment_once(state: &Arc<MockDeviceState>, required_aligned_frames: u32) {
        state.required_aligned_frames.store(required_aligned_frames, Ordering::Release);
        state.misalign_once.store(true, Ordering::Release);
    }
}

impl AudioEndpointBackend for MockAudioEndpointBackend {
    fn probe_format(&mut self, format: &AudioFormat) -> Result<bool> {
        Ok(format.equivalent(&self.state.format))
    }

    fn mix_format(&mut self) -> Result<AudioFormat> {
        Ok(self.state.format)
    }

    fn initialize(&mut self, params: &InitParams) -> Result<()> {
        if params.share_mode == ShareMode::Exclusive
            && self.state.misalign_once.load(Ordering::Acquire)
            && !self.already_retried_alignment
        {
            self.already_retried_alignment = true;
            return Err(Error::BufferSizeNotAligned {
                required_frames: self.state.required_aligned_frames.load(Ordering::Acquire),
            });
        }

        self.negotiated_format = Some(params.format);
        self.negotiated_period = if params.requested_period_frames > 0 {
            params.requested_period_frames
        } else {
            self.state.period_frames
        };
        self.share_mode = params.share_mode;
        Ok(())
    }

    fn device_period_frames(&self) -> u32 {
        if self.negotiated_period > 0 {
            self.negotiated_period
        } else {
            self.state.period_frames
        }
    }

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn wait_ready(&self, timeout: Duration) -> WaitOutcome {
        if self.state.is_lost() {
            return WaitOutcome::Lost("mock device invalidated".into());
        }

        match self.flow {
            Flow::Capture => {
                let q = self.state.capture_queue.lock().expect("mock capture queue poisoned");
                if !q.is_empty() {
                    return WaitOutcome::Ready;
                }
                let (_guard, result) = self
                    .state
                    .capture_cvar
                    .wait_timeout(q, timeout)
                    .expect("mock capture condvar poisoned");
                if self.state.is_lost() {
                    WaitOutcome::Lost("mock device invalidated".into())
                } else if result.timed_out() {
                    WaitOutcome::Timeout
                } else {
                    WaitOutcome::Ready
                }
            }
            Flow::Render => {
                // Render is always "ready" at its own pace; a real timer
                // would page this, but the test driver's render thread
                // simply paces itself by sleeping one period per cycle
                // (see `render_cycle`), so `wait_ready` never needs to
                // block here.
                std::thread::sleep(Duration::from_micros(200));
                WaitOutcome::Ready
            }
        }
    }

    fn current_padding(&self) -> Result<u32> {
        Ok(0)
    }

    fn for_each_capture_packet(&mut self, sink: &mut dyn FnMut(CapturePacket<'_>)) -> Result<()> {
        if self.state.is_lost() {
            return Err(Error::RuntimeLost("mock device invalidated".into()));
        }
        let format = self.negotiated_format.unwrap_or(self.state.format);
        let block_align = format.block_align().max(1) as usize;

        let mut q = self.state.capture_queue.lock().expect("mock capture queue poisoned");
        let usable = (q.len() / block_align) * block_align;
        if usable == 0 {
            return Ok(());
        }
        let bytes: Vec<u8> = q.drain(..usable).collect();
        drop(q);

        let frames = (bytes.len() / block_align) as u32;
        sink(CapturePacket {
            bytes: &bytes,
            frames,
            flags: crate::backend::BufferFlags::default(),
        });
        Ok(())
    }

    fn render_cycle(&mut self, frames: u32, fill: &mut dyn FnMut(RenderBuffer<'_>) -> usize) -> Result<()> {
        if self.state.is_lost() {
            return Err(Error::RuntimeLost("mock device invalidated".into()));
        }
        let format = self.negotiated_format.unwrap_or(self.state.format);
        let block_align = format.block_align().max(1) as usize;
        let mut buf = vec![0u8; frames as usize * block_align];

        let wrote = fill(RenderBuffer {
            bytes: &mut buf,
            frames,
        });
        if wrote == 0 {
            self.state.empty_render_cycles.fetch_add(1, Ordering::Relaxed);
        }

        let mut rendered = self.state.rendered.lock().expect("mock render buffer poisoned");
        rendered.extend_from_slice(&buf);
        drop(rendered);

        // Pace the mock render device to roughly real time so tests that
        // assert on wall-clock-bounded throughput behave like a real
        // device's period cadence, without needing an actual audio clock.
        let period = Duration::from_secs_f64(f64::from(frames) / f64::from(format.sample_rate.max(1)));
        std::thread::sleep(period);
        Ok(())
    }
}

/// Enumerates and opens [`MockAudioEndpointBackend`] instances against a
/// fixed set of named devices, each backed by caller-provided
/// [`MockDeviceState`].
#[derive(Default)]
pub struct MockDeviceEnumerator {
    devices: Mutex<std::collections::HashMap<String, Arc<MockDeviceState>>>,
}

impl MockDeviceEnumerator {
    /// Creates an empty enumerator; register devices with
    /// [`Self::register`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a device under `id`, reachable by both
    /// `enumerate_capture`/`enumerate_render` (the mock doesn't
    /// distinguish direction at the enumeration level) and `open`.
    pub fn register(&self, id: impl Into<String>, state: Arc<MockDeviceState>) {
        self.devices
            .lock()
            .expect("mock enumerator poisoned")
            .insert(id.into(), state);
    }
}

impl DeviceEnumerator for MockDeviceEnumerator {
    fn enumerate_capture(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self
            .devices
            .lock()
            .expect("mock enumerator poisoned")
            .keys()
            .map(|id| DeviceInfo {
                id: id.clone(),
                name: id.clone(),
            })
            .collect())
    }

    fn enumerate_render(&self) -> Result<Vec<DeviceInfo>> {
        self.enumerate_capture()
    }

    fn open(&self, id: &str, flow: Flow) -> Result<Box<dyn AudioEndpointBackend>> {
        let devices = self.devices.lock().expect("mock enumerator poisoned");
        let state = devices.get(id).cloned().ok_or_else(|| Error::DeviceNotFound(id.to_string()))?;
        drop(devices);
        Ok(Box::new(MockAudioEndpointBackend::new(flow, state)))
    }
}

/// Time elapsed since `start`, used by tests asserting on wall-clock
/// budgets (spec.md §8 end-to-end scenarios, e.g. "after 1.2s wall time").
pub fn elapsed_since(start: Instant) -> Duration {
    Instant::now().duration_since(start)
}
