//! Capture endpoint: owns a device capture client and continuously copies
//! device-provided PCM frames into a bound [`RingBuffer`] (spec.md §4.3).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::backend::{AudioEndpointBackend, WaitOutcome};
use crate::format::AudioFormat;
use crate::negotiate::{negotiate_exclusive, negotiate_shared};
use crate::ring_buffer::RingBuffer;
use crate::{Error, Result};

/// How long the capture/render worker waits for the device-ready event
/// before treating the wake as spurious and looping (spec.md §4.3 step 1).
const READY_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// A running capture session: a dedicated thread draining device packets
/// into `ring` until [`CaptureEndpoint::stop`] is called.
pub struct CaptureEndpoint {
    format: AudioFormat,
    buffer_frames: u32,
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl CaptureEndpoint {
    /// Negotiates a format on `backend` (exclusive walks the priority
    /// list, shared takes the mix format), then starts the device and the
    /// capture thread, which writes into `ring` until stopped (spec.md
    /// §4.3 "Initialization" and "Runtime").
    pub fn start(mut backend: Box<dyn AudioEndpointBackend>, exclusive: bool, ring: Arc<RingBuffer>) -> Result<Self> {
        let negotiated = if exclusive {
            negotiate_exclusive(backend.as_mut(), None)?
        } else {
            negotiate_shared(backend.as_mut())?
        };

        backend.start()?;

        let stop = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));
        let format = negotiated.format;
        let block_align = format.block_align() as usize;
        // Silence substitution buffer: allocated once here, at startup, so
        // the capture loop itself never allocates (spec.md §5).
        let silence = vec![0u8; block_align * negotiated.buffer_frames.max(1) as usize];

        let thread_stop = Arc::clone(&stop);
        let thread_running = Arc::clone(&running);
        let thread_ring = ring;
        let buffer_frames = negotiated.buffer_frames;
        let sample_rate = format.sample_rate;
        let thread = std::thread::Builder::new()
            .name("audiobridge-capture".into())
            .spawn(move || {
                if let Err(e) = audio_thread_priority::promote_current_thread_to_real_time(buffer_frames, sample_rate) {
                    tracing::warn!(error = ?e, "failed to promote capture thread to real-time priority");
                }
                let result = capture_loop(backend.as_mut(), &thread_ring, &thread_stop, &silence);
                thread_running.store(false, Ordering::Release);
                result
            })
            .map_err(|e| Error::InitFailed(format!("failed to spawn capture thread: {e}")))?;

        Ok(Self {
            format,
            buffer_frames: negotiated.buffer_frames,
            stop,
            running,
            thread: Some(thread),
        })
    }

    /// The negotiated capture format.
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// The device period, in frames.
    pub fn buffer_frames(&self) -> u32 {
        self.buffer_frames
    }

    /// Whether the capture thread is still alive (it exits on `stop()` or
    /// on a `RuntimeLost` failure).
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Signals the capture thread to exit and joins it, waiting up to
    /// `timeout`. Returns the thread's result if it finished in time, or
    /// `Ok(None)` if the join timed out (spec.md §4.6 "Each join has a 5s
    /// timeout; hitting the timeout is logged but does not block further
    /// teardown").
    pub fn stop(mut self, timeout: Duration) -> Option<Result<()>> {
        self.stop.store(true, Ordering::Release);
        join_with_timeout(self.thread.take(), timeout)
    }
}

impl Drop for CaptureEndpoint {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Joins `thread` within `timeout`, polling briefly rather than blocking
/// forever; `std::thread::JoinHandle` has no timed join, so this is the
/// idiomatic workaround (spec.md §4.6/§5 "5 second timeout").
pub(crate) fn join_with_timeout<T: Send + 'static>(
    thread: Option<JoinHandle<T>>,
    timeout: Duration,
) -> Option<T> {
    let thread = thread?;
    if thread.is_finished() {
        return thread.join().ok();
    }
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if thread.is_finished() {
            return thread.join().ok();
        }
        if std::time::Instant::now() >= deadline {
            tracing::warn!("worker thread join timed out; abandoning (cooperative cancellation only)");
            return None;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn capture_loop(
    backend: &mut dyn AudioEndpointBackend,
    ring: &RingBuffer,
    stop: &AtomicBool,
    silence: &[u8],
) -> Result<()> {
    loop {
        if stop.load(Ordering::Acquire) {
            return Ok(());
        }

        match backend.wait_ready(READY_WAIT_TIMEOUT) {
            WaitOutcome::Timeout => continue,
            WaitOutcome::Lost(msg) => {
                tracing::warn!(error = %msg, "capture device lost");
                return Err(Error::RuntimeLost(msg));
            }
            WaitOutcome::Ready => {}
        }

        if stop.load(Ordering::Acquire) {
            return Ok(());
        }

        backend.for_each_capture_packet(&mut |packet| {
            let bytes = if packet.flags.silent {
                &silence[..packet.bytes.len().min(silence.len())]
            } else {
                packet.bytes
            };
            let wrote = ring.write(bytes);
            if wrote < bytes.len() {
                // Consumer is behind: drop the excess rather than
                // back-pressure the device (spec.md §4.3 step 3, §9).
                tracing::debug!(
                    dropped = bytes.len() - wrote,
                    "capture ring buffer full, dropping excess bytes"
                );
            }
        })?;
    }
}
