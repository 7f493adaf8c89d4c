//! Worker that moves bytes from one [`RingBuffer`] through the [`Resampler`]
//! into another, activated only when capture and render formats disagree.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::capture::join_with_timeout;
use crate::format::AudioFormat;
use crate::resampler::Resampler;
use crate::ring_buffer::RingBuffer;
use crate::Result;

/// Chunk size the pump reads from the source ring per iteration, rounded
/// down to a whole number of input frames (must stay a multiple of the
/// input block alignment).
const CHUNK_BYTES: usize = 4096;

/// How long the pump waits on an empty source ring before polling again.
const IDLE_WAIT: Duration = Duration::from_millis(1);

/// Ordinary-priority worker thread coupling two ring buffers through a
/// [`Resampler`]. Not on the audio-thread hot path.
pub struct ResamplerPump {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl ResamplerPump {
    /// Starts the pump thread, reading from `source` and writing into
    /// `sink` through `resampler` until [`Self::stop`] is called.
    pub fn start(
        source: Arc<RingBuffer>,
        sink: Arc<RingBuffer>,
        resampler: Arc<Mutex<Resampler>>,
        in_fmt: AudioFormat,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let in_block_align = in_fmt.block_align() as usize;
        let chunk_bytes = (CHUNK_BYTES / in_block_align.max(1)).max(1) * in_block_align.max(1);

        let thread = std::thread::Builder::new()
            .name("audiobridge-pump".into())
            .spawn(move || pump_loop(&source, &sink, &resampler, &thread_stop, chunk_bytes))
            .expect("failed to spawn pump thread");

        Self {
            stop,
            thread: Some(thread),
        }
    }

    /// Signals the pump to exit and joins it within `timeout`.
    pub fn stop(mut self, timeout: Duration) -> Option<Result<()>> {
        self.stop.store(true, Ordering::Release);
        join_with_timeout(self.thread.take(), timeout)
    }
}

impl Drop for ResamplerPump {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn pump_loop(
    source: &RingBuffer,
    sink: &RingBuffer,
    resampler: &Mutex<Resampler>,
    stop: &AtomicBool,
    chunk_bytes: usize,
) -> Result<()> {
    let mut scratch = vec![0u8; chunk_bytes];
    let mut out_scratch = Vec::with_capacity(chunk_bytes * 2);

    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }

        let available = source.available_read();
        if available == 0 {
            std::thread::sleep(IDLE_WAIT);
            continue;
        }

        let to_read = available.min(chunk_bytes);
        let got = source.read(&mut scratch[..to_read]);
        if got == 0 {
            continue;
        }

        out_scratch.clear();
        {
            let mut r = resampler.lock().expect("resampler mutex poisoned");
            r.push(&scratch[..got])?;
            r.drain(&mut out_scratch)?;
        }

        if !out_scratch.is_empty() {
            let wrote = sink.write(&out_scratch);
            if wrote < out_scratch.len() {
                tracing::debug!(
                    dropped = out_scratch.len() - wrote,
                    "render ring full, pump dropping resampled bytes"
                );
            }
        }
    }

    // Flush residual samples on shutdown only.
    let mut r = resampler.lock().expect("resampler mutex poisoned");
    out_scratch.clear();
    r.flush(&mut out_scratch)?;
    drop(r);
    if !out_scratch.is_empty() {
        let _ = sink.write(&out_scratch);
    }
    Ok(())
}
