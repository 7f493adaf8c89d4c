//! Render endpoint: owns a device render client and continuously pulls
//! bytes from a bound [`RingBuffer`] into the device's output buffer
//! (spec.md §4.4).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::backend::{AudioEndpointBackend, ShareMode, WaitOutcome};
use crate::capture::join_with_timeout;
use crate::format::AudioFormat;
use crate::negotiate::{negotiate_exclusive, negotiate_shared, Negotiated};
use crate::ring_buffer::RingBuffer;
use crate::{Error, Result};

const READY_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// A render endpoint whose format has been negotiated but whose device has
/// not yet been started. Exists so the [`Router`](crate::router::Router)
/// can decide, from the negotiated format, whether a resampler is needed
/// — and therefore which ring buffer to bind — *before* committing the
/// device to a particular ring (spec.md §4.6 step 5-6: render negotiation
/// happens before the resampler decision, but nothing should consume from
/// the wrong ring while that decision is pending).
pub struct NegotiatedRender {
    backend: Box<dyn AudioEndpointBackend>,
    negotiated: Negotiated,
    share_mode: ShareMode,
}

impl NegotiatedRender {
    /// Negotiates a format on `backend` without starting the device
    /// (trying `preferred` first in exclusive mode, to maximize the
    /// chance of matching capture and bypassing the resampler — spec.md
    /// §4.4 "Initialization").
    pub fn negotiate(mut backend: Box<dyn AudioEndpointBackend>, exclusive: bool, preferred: Option<AudioFormat>) -> Result<Self> {
        let negotiated = if exclusive {
            negotiate_exclusive(backend.as_mut(), preferred)?
        } else {
            negotiate_shared(backend.as_mut())?
        };
        let share_mode = if exclusive { ShareMode::Exclusive } else { ShareMode::Shared };
        Ok(Self {
            backend,
            negotiated,
            share_mode,
        })
    }

    /// The format this endpoint negotiated.
    pub fn format(&self) -> AudioFormat {
        self.negotiated.format
    }

    /// The device period, in frames, as negotiated.
    pub fn buffer_frames(&self) -> u32 {
        self.negotiated.buffer_frames
    }

    /// Pre-rolls silence, starts the device, and spawns the render thread
    /// pulling from `ring` (spec.md §4.4 "Pre-roll", "Runtime").
    pub fn start(mut self, ring: Arc<RingBuffer>) -> Result<RenderEndpoint> {
        let format = self.negotiated.format;
        let buffer_frames = self.negotiated.buffer_frames;

        // Pre-roll: fill the entire device buffer with silence before the
        // device starts, so the first period is defined silence rather
        // than whatever the pump produces in its first milliseconds
        // (spec.md §4.4 "Pre-roll").
        self.backend.render_cycle(buffer_frames, &mut |buf| {
            buf.bytes.fill(0);
            0
        })?;

        self.backend.start()?;

        let stop = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));
        let underrun_count = Arc::new(AtomicU64::new(0));

        let thread_stop = Arc::clone(&stop);
        let thread_running = Arc::clone(&running);
        let thread_underruns = Arc::clone(&underrun_count);
        let thread_ring = ring;
        let block_align = format.block_align() as usize;
        let share_mode = self.share_mode;
        let mut backend = self.backend;
        let sample_rate = format.sample_rate;
        let thread = std::thread::Builder::new()
            .name("audiobridge-render".into())
            .spawn(move || {
                if let Err(e) = audio_thread_priority::promote_current_thread_to_real_time(buffer_frames, sample_rate) {
                    tracing::warn!(error = ?e, "failed to promote render thread to real-time priority");
                }
                let result = render_loop(
                    backend.as_mut(),
                    &thread_ring,
                    &thread_stop,
                    &thread_underruns,
                    share_mode,
                    buffer_frames,
                    block_align,
                );
                thread_running.store(false, Ordering::Release);
                result
            })
            .map_err(|e| Error::InitFailed(format!("failed to spawn render thread: {e}")))?;

        Ok(RenderEndpoint {
            format,
            buffer_frames,
            stop,
            running,
            underrun_count,
            thread: Some(thread),
        })
    }
}

/// A running render session: a dedicated thread pulling bytes from its
/// bound ring buffer into device buffers until [`RenderEndpoint::stop`] is
/// called.
pub struct RenderEndpoint {
    format: AudioFormat,
    buffer_frames: u32,
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    underrun_count: Arc<AtomicU64>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl RenderEndpoint {
    /// Negotiates and starts a render endpoint in one step, bound directly
    /// to `ring`. Convenience for the format-match path, where no
    /// resampler decision needs to happen between negotiation and start.
    pub fn start(
        backend: Box<dyn AudioEndpointBackend>,
        exclusive: bool,
        preferred: Option<AudioFormat>,
        ring: Arc<RingBuffer>,
    ) -> Result<Self> {
        NegotiatedRender::negotiate(backend, exclusive, preferred)?.start(ring)
    }

    /// The negotiated render format.
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// The device period, in frames.
    pub fn buffer_frames(&self) -> u32 {
        self.buffer_frames
    }

    /// Whether the render thread is still alive.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of render periods that were short-read from the ring buffer
    /// (spec.md §8 invariant 4). Monotonically increasing.
    pub fn underrun_count(&self) -> u64 {
        self.underrun_count.load(Ordering::Relaxed)
    }

    /// Signals the render thread to exit and joins it within `timeout`.
    pub fn stop(mut self, timeout: Duration) -> Option<Result<()>> {
        self.stop.store(true, Ordering::Release);
        join_with_timeout(self.thread.take(), timeout)
    }
}

impl Drop for RenderEndpoint {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn render_loop(
    backend: &mut dyn AudioEndpointBackend,
    ring: &RingBuffer,
    stop: &AtomicBool,
    underrun_count: &AtomicU64,
    share_mode: ShareMode,
    device_period_frames: u32,
    block_align: usize,
) -> Result<()> {
    loop {
        if stop.load(Ordering::Acquire) {
            return Ok(());
        }

        match backend.wait_ready(READY_WAIT_TIMEOUT) {
            WaitOutcome::Timeout => continue,
            WaitOutcome::Lost(msg) => {
                tracing::warn!(error = %msg, "render device lost");
                return Err(Error::RuntimeLost(msg));
            }
            WaitOutcome::Ready => {}
        }

        if stop.load(Ordering::Acquire) {
            return Ok(());
        }

        let frames_available = match share_mode {
            ShareMode::Exclusive => device_period_frames,
            ShareMode::Shared => {
                let padding = backend.current_padding()?;
                device_period_frames.saturating_sub(padding)
            }
        };
        if frames_available == 0 {
            continue;
        }

        let mut any_read = false;
        let mut short = false;
        backend.render_cycle(frames_available, &mut |buf| {
            let needed = (frames_available as usize * block_align).min(buf.bytes.len());
            let got = ring.read(&mut buf.bytes[..needed]);
            if got > 0 {
                any_read = true;
            }
            if got < needed {
                short = true;
                // Silence substitution for the short tail, never
                // hold-last-sample (spec.md §4.4 "Under-run policy": this
                // avoids DC thumps).
                buf.bytes[got..needed].fill(0);
            }
            got
        })?;

        if short {
            underrun_count.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                underruns = underrun_count.load(Ordering::Relaxed),
                any_read,
                "render period short-read"
            );
        }
    }
}
