//! Real-time audio bridge core.
//!
//! Continuously copies a live PCM stream from one host audio endpoint
//! (capture) to another (render), correcting for differences in sample
//! rate, channel count, and sample format when the two endpoints disagree.
//!
//! # Architecture
//!
//! ```text
//! CaptureEndpoint ──▶ RingBuffer A ──▶ RenderEndpoint            (formats match)
//! CaptureEndpoint ──▶ RingBuffer A ──▶ ResamplerPump ──▶ RingBuffer B ──▶ RenderEndpoint
//! ```
//!
//! [`Router`] is the supervisor: it negotiates formats, allocates the ring
//! buffer(s), and owns the lifecycle of the capture thread, render thread,
//! and (when formats disagree) the resampler pump thread. Two independent
//! hardware clocks are coupled only through lock-free [`RingBuffer`]s sized
//! to absorb their drift; no mutex sits on an audio thread's hot path.
//!
//! This crate ships one concrete [`backend::AudioEndpointBackend`]: a
//! WASAPI implementation (Windows only, via the `wasapi` crate). Other
//! platforms can add a backend without touching the routing pipeline.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use audiobridge_core::{Router, RouterConfig, WasapiDeviceEnumerator};
//!
//! let enumerator = WasapiDeviceEnumerator::new()?;
//! let mut router = Router::new();
//! router.start(&enumerator, &RouterConfig {
//!     capture_id: "capture-device-id".into(),
//!     render_id: "render-device-id".into(),
//!     exclusive: true,
//!     ring_capacity_bytes: None,
//! })?;
//!
//! let status = router.status();
//! println!("{:?}", status.state);
//!
//! router.stop();
//! # Ok::<(), audiobridge_core::Error>(())
//! ```

mod backend;
mod capture;
mod format;
mod negotiate;
mod pump;
mod render;
mod resampler;
mod ring_buffer;
mod router;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

#[cfg(target_os = "windows")]
mod wasapi_backend;

pub use backend::{
    AudioEndpointBackend, BufferFlags, CapturePacket, DeviceEnumerator, DeviceInfo, Flow,
    InitParams, RenderBuffer, ShareMode, WaitOutcome,
};
pub use format::{AudioFormat, SampleEncoding};
pub use resampler::{Resampler, ResamplerOutcome};
pub use ring_buffer::RingBuffer;
pub use router::{PersistedSettingsKey, Router, RouterConfig, RouterState, RouterStatus};

#[cfg(target_os = "windows")]
pub use wasapi_backend::{WasapiBackend, WasapiDeviceEnumerator};

/// Error kinds surfaced by the core (spec.md §7).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Enumerator could not resolve the given device id.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Exclusive-mode open was rejected because another client owns the device.
    #[error("device busy: {0}")]
    DeviceBusy(String),

    /// No candidate format could be negotiated with the device.
    #[error("unsupported format")]
    UnsupportedFormat,

    /// Generic initialization failure, with the underlying platform code.
    #[error("initialization failed: {0}")]
    InitFailed(String),

    /// The device disappeared mid-stream (a wait or packet call failed).
    #[error("runtime lost: {0}")]
    RuntimeLost(String),

    /// The resampler could not be configured for the requested conversion.
    #[error("resampler construction failed: {0}")]
    ResamplerInit(String),

    /// Exclusive-mode initialization rejected the requested period; the
    /// device reports the frame count it requires instead (spec.md §4.3
    /// "buffer size not aligned" retry).
    #[error("buffer size not aligned: device requires {required_frames} frames")]
    BufferSizeNotAligned {
        /// The aligned period, in frames, the device requires.
        required_frames: u32,
    },
}

/// Convenience result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
