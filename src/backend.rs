//! The platform audio client, made explicit as a Rust trait so the routing
//! pipeline is backend-agnostic and unit testable against
//! [`crate::mock::MockAudioEndpointBackend`] without real hardware. The
//! concrete Windows backend ([`crate::wasapi_backend`]) wraps the `wasapi`
//! crate behind this same trait.
//!
//! Capture and render share one trait because WASAPI's own `IAudioClient`
//! does; callers simply never invoke the render-only or capture-only
//! methods for the other flow.

use std::time::Duration;

use crate::format::AudioFormat;
use crate::Result;

/// Which direction a device handle serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// A capture (recording) endpoint.
    Capture,
    /// A render (playback) endpoint.
    Render,
}

/// Shared mode goes through the OS mixer at its mix format; exclusive mode
/// bypasses the mixer and owns the hardware path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareMode {
    /// Goes through the OS mixer using its mix format.
    Shared,
    /// Owns the device hardware path exclusively; lowest latency.
    Exclusive,
}

/// An enumerated device: an opaque id plus a display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Opaque device id, stable for the lifetime of this enumeration pass.
    pub id: String,
    /// Human-readable name for display.
    pub name: String,
}

/// Parameters for [`AudioEndpointBackend::initialize`].
#[derive(Debug, Clone, Copy)]
pub struct InitParams {
    /// Shared vs. exclusive mode.
    pub share_mode: ShareMode,
    /// Whether the client should be event-driven (always true in this
    /// crate; polling mode is not used).
    pub event_driven: bool,
    /// Requested device period, in frames. Zero lets the backend pick its
    /// own default (used for shared mode).
    pub requested_period_frames: u32,
    /// The format to initialize with.
    pub format: AudioFormat,
}

/// One captured packet's silence flag: the device reports "silent" when it
/// has no real signal to offer (e.g. a muted exclusive-mode source), in
/// which case the caller should treat the packet's bytes as undefined and
/// substitute zeros rather than trust them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFlags {
    /// True when the device flagged this packet/buffer as silent.
    pub silent: bool,
}

/// Borrowed view of one capture packet, handed to the sink closure passed
/// to [`AudioEndpointBackend::for_each_capture_packet`].
pub struct CapturePacket<'a> {
    /// Raw interleaved PCM bytes for this packet, `frames * block_align` long.
    pub bytes: &'a [u8],
    /// Frame count this packet carries.
    pub frames: u32,
    /// Silence flag reported by the device for this packet.
    pub flags: BufferFlags,
}

/// Borrowed mutable view of a render buffer, handed to the fill closure
/// passed to [`AudioEndpointBackend::render_cycle`].
pub struct RenderBuffer<'a> {
    /// Interleaved PCM byte buffer the caller must fill (or partially
    /// fill) with output samples, `frames * block_align` bytes long.
    pub bytes: &'a mut [u8],
    /// Frame count this buffer was sized for.
    pub frames: u32,
}

/// Outcome of waiting for the device-ready event. The stop signal itself is
/// observed by the endpoint loop around this wait, not inside it; `Lost`
/// surfaces a runtime failure in the wait call itself.
#[derive(Debug)]
pub enum WaitOutcome {
    /// The device signaled it is ready to be serviced.
    Ready,
    /// No signal arrived within the timeout; treated as spurious and the
    /// caller's loop continues.
    Timeout,
    /// The underlying wait failed; the device is presumed gone.
    Lost(String),
}

/// An opened, not-yet-initialized handle to one audio device, bound to one
/// [`Flow`]. Obtained from [`DeviceEnumerator::open`].
///
/// Methods are grouped by which phase of the device's lifecycle they serve:
/// format negotiation, then `initialize`, then the steady-state loop
/// (`start` → repeated `wait_ready` + `for_each_capture_packet`/
/// `render_cycle` → `stop`). The steady-state methods never allocate after
/// `initialize` returns: scratch buffers are sized once during `initialize`
/// and reused on every call.
pub trait AudioEndpointBackend: Send {
    /// Probes whether `format` is supported without committing to it
    /// (WASAPI's `IsFormatSupported`). Used by exclusive-mode negotiation
    /// to find the first candidate the device accepts.
    fn probe_format(&mut self, format: &AudioFormat) -> Result<bool>;

    /// Queries the device's current mix format (shared mode only).
    fn mix_format(&mut self) -> Result<AudioFormat>;

    /// Initializes the client with the given parameters. On exclusive-mode
    /// misalignment, returns `Error::BufferSizeNotAligned` so the caller
    /// can recompute the period and retry once.
    fn initialize(&mut self, params: &InitParams) -> Result<()>;

    /// The device's period, in frames, as negotiated by the last
    /// successful `initialize` call.
    fn device_period_frames(&self) -> u32;

    /// Starts the device clock. Must follow a successful `initialize`.
    fn start(&mut self) -> Result<()>;

    /// Stops the device clock. Idempotent.
    fn stop(&mut self) -> Result<()>;

    /// Blocks up to `timeout` for the device-ready event.
    fn wait_ready(&self, timeout: Duration) -> WaitOutcome;

    /// Shared-mode only: frames of the device's internal buffer not yet
    /// consumed by hardware. Used to compute how many frames a render
    /// cycle may safely write.
    fn current_padding(&self) -> Result<u32>;

    /// Capture only: invokes `sink` once per packet currently queued by the
    /// device, draining it completely. The device may report a packet
    /// "silent", in which case `bytes` has undefined
    /// content and callers should synthesize zeros instead of copying it.
    fn for_each_capture_packet(&mut self, sink: &mut dyn FnMut(CapturePacket<'_>)) -> Result<()>;

    /// Render only: hands a `frames`-frame buffer to `fill`, which writes
    /// output bytes starting at offset 0 and returns how many bytes it
    /// wrote. The backend zero-fills any remaining tail and releases the
    /// buffer, flagged silent iff `fill` wrote zero bytes.
    fn render_cycle(&mut self, frames: u32, fill: &mut dyn FnMut(RenderBuffer<'_>) -> usize) -> Result<()>;
}

/// Device-enumeration collaborator, out of scope for this crate's core
/// logic but required to obtain an [`AudioEndpointBackend`].
pub trait DeviceEnumerator: Send + Sync {
    /// Lists capture devices as `(id, friendly name)` pairs.
    fn enumerate_capture(&self) -> Result<Vec<DeviceInfo>>;

    /// Lists render devices as `(id, friendly name)` pairs.
    fn enumerate_render(&self) -> Result<Vec<DeviceInfo>>;

    /// Opens a device by its opaque id for the given flow, returning an
    /// un-initialized backend handle.
    fn open(&self, id: &str, flow: Flow) -> Result<Box<dyn AudioEndpointBackend>>;
}
