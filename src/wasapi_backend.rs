//! WASAPI implementation of [`AudioEndpointBackend`] and
//! [`DeviceEnumerator`], built on the `wasapi` crate (spec.md §6, §4.3/§4.4
//! "platform audio client collaborator"). Windows only.

use std::collections::VecDeque;
use std::time::Duration;

use wasapi::{
    DeviceCollection, Direction, SampleType, ShareMode as WasapiShareMode, StreamMode, WaveFormat,
};

use crate::backend::{
    AudioEndpointBackend, BufferFlags, CapturePacket, DeviceEnumerator, DeviceInfo, Flow,
    InitParams, RenderBuffer, ShareMode, WaitOutcome,
};
use crate::format::{AudioFormat, SampleEncoding};
use crate::{Error, Result};

fn to_wasapi_format(format: &AudioFormat) -> WaveFormat {
    let sample_type = match format.encoding {
        SampleEncoding::Int => &SampleType::Int,
        SampleEncoding::Float => &SampleType::Float,
    };
    WaveFormat::new(
        format.container_bits as usize,
        format.valid_bits as usize,
        sample_type,
        format.sample_rate as usize,
        format.channels as usize,
        Some(format.channel_mask),
    )
}

fn from_wasapi_format(format: &WaveFormat) -> AudioFormat {
    let container_bits = (format.get_blockalign() as u16 * 8) / format.get_nchannels().max(1) as u16;
    // The mix format WASAPI reports is always IEEE float in practice
    // (spec.md §4.3 "Shared mode"); promoting a plain WAVEFORMATEX this
    // way mirrors `format::from_plain_shared`.
    let encoding = if container_bits == 32 {
        SampleEncoding::Float
    } else {
        SampleEncoding::Int
    };
    AudioFormat {
        sample_rate: format.get_samplespersec() as u32,
        channels: format.get_nchannels() as u16,
        container_bits,
        valid_bits: format.get_validbitspersample() as u16,
        encoding,
        channel_mask: format.get_channelmask() as u32,
    }
}

fn is_invalidated(msg: &str) -> bool {
    let upper = msg.to_uppercase();
    upper.contains("AUDCLNT_E_DEVICE_INVALIDATED")
        || upper.contains("AUDCLNT_E_SERVICE_NOT_RUNNING")
        || upper.contains("88890004")
        || upper.contains("88890010")
}

fn is_buffer_size_error(msg: &str) -> bool {
    msg.to_uppercase().contains("AUDCLNT_E_BUFFER_SIZE_NOT_ALIGNED")
}

enum ClientHandle {
    Capture(wasapi::AudioCaptureClient),
    Render(wasapi::AudioRenderClient),
}

/// One opened WASAPI endpoint, bound to a [`Flow`]. Carries the device
/// itself plus whatever client handles `initialize` produces; `start`
/// allocates scratch buffers once so the steady-state loop never
/// allocates again (spec.md §5).
pub struct WasapiBackend {
    flow: Flow,
    device: wasapi::Device,
    audio_client: Option<wasapi::AudioClient>,
    event_handle: Option<wasapi::Handle>,
    client: Option<ClientHandle>,
    negotiated_period_frames: u32,
    negotiated_block_align: usize,
    scratch: VecDeque<u8>,
}

impl WasapiBackend {
    fn new(flow: Flow, device: wasapi::Device) -> Self {
        Self {
            flow,
            device,
            audio_client: None,
            event_handle: None,
            client: None,
            negotiated_period_frames: 0,
            negotiated_block_align: 0,
            scratch: VecDeque::new(),
        }
    }

    fn direction(&self) -> Direction {
        match self.flow {
            Flow::Capture => Direction::Capture,
            Flow::Render => Direction::Render,
        }
    }
}

impl AudioEndpointBackend for WasapiBackend {
    fn probe_format(&mut self, format: &AudioFormat) -> Result<bool> {
        let wave_format = to_wasapi_format(format);
        let mut client = self
            .device
            .get_iaudioclient()
            .map_err(|e| Error::InitFailed(format!("get_iaudioclient: {e:?}")))?;
        Ok(client
            .is_supported(&wave_format, &WasapiShareMode::Exclusive)
            .map_err(|e| Error::InitFailed(format!("is_supported: {e:?}")))?
            .is_some())
    }

    fn mix_format(&mut self) -> Result<AudioFormat> {
        let mut client = self
            .device
            .get_iaudioclient()
            .map_err(|e| Error::InitFailed(format!("get_iaudioclient: {e:?}")))?;
        let mix = client
            .get_mixformat()
            .map_err(|e| Error::InitFailed(format!("get_mixformat: {e:?}")))?;
        Ok(from_wasapi_format(&mix))
    }

    fn initialize(&mut self, params: &InitParams) -> Result<()> {
        let mut client = self
            .device
            .get_iaudioclient()
            .map_err(|e| Error::InitFailed(format!("get_iaudioclient: {e:?}")))?;
        let wave_format = to_wasapi_format(&params.format);

        let (share_mode, buffer_duration_hns) = match params.share_mode {
            ShareMode::Shared => {
                let (_, min_period_hns) = client
                    .get_periods()
                    .map_err(|e| Error::InitFailed(format!("get_periods: {e:?}")))?;
                (WasapiShareMode::Shared, min_period_hns)
            }
            ShareMode::Exclusive => {
                let hns = crate::negotiate::aligned_duration_hns(
                    params.requested_period_frames,
                    params.format.sample_rate,
                );
                (WasapiShareMode::Exclusive, hns as i64)
            }
        };

        let stream_mode = match share_mode {
            WasapiShareMode::Shared => StreamMode::EventsShared {
                autoconvert: false,
                buffer_duration_hns,
            },
            WasapiShareMode::Exclusive => StreamMode::EventsExclusive {
                buffer_duration_hns,
            },
        };

        if let Err(e) = client.initialize_client(&wave_format, &self.direction(), &stream_mode) {
            let msg = format!("{e:?}");
            if is_buffer_size_error(&msg) {
                let required = client
                    .get_bufferframecount()
                    .map_err(|e2| Error::InitFailed(format!("get_bufferframecount: {e2:?}")))?;
                return Err(Error::BufferSizeNotAligned {
                    required_frames: required as u32,
                });
            }
            return Err(Error::InitFailed(format!("initialize_client: {msg}")));
        }

        let event_handle = client
            .set_get_eventhandle()
            .map_err(|e| Error::InitFailed(format!("set_get_eventhandle: {e:?}")))?;

        let period_frames = client
            .get_bufferframecount()
            .map_err(|e| Error::InitFailed(format!("get_bufferframecount: {e:?}")))? as u32;

        let client_handle = match self.flow {
            Flow::Capture => ClientHandle::Capture(
                client
                    .get_audiocaptureclient()
                    .map_err(|e| Error::InitFailed(format!("get_audiocaptureclient: {e:?}")))?,
            ),
            Flow::Render => ClientHandle::Render(
                client
                    .get_audiorenderclient()
                    .map_err(|e| Error::InitFailed(format!("get_audiorenderclient: {e:?}")))?,
            ),
        };

        self.negotiated_period_frames = period_frames;
        self.negotiated_block_align = params.format.block_align() as usize;
        self.scratch = VecDeque::with_capacity(period_frames as usize * self.negotiated_block_align);
        self.event_handle = Some(event_handle);
        self.client = Some(client_handle);
        self.audio_client = Some(client);
        Ok(())
    }

    fn device_period_frames(&self) -> u32 {
        self.negotiated_period_frames
    }

    fn start(&mut self) -> Result<()> {
        self.audio_client
            .as_ref()
            .expect("initialize must precede start")
            .start_stream()
            .map_err(|e| Error::InitFailed(format!("start_stream: {e:?}")))
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(client) = &self.audio_client {
            client
                .stop_stream()
                .map_err(|e| Error::RuntimeLost(format!("stop_stream: {e:?}")))?;
        }
        Ok(())
    }

    fn wait_ready(&self, timeout: Duration) -> WaitOutcome {
        let Some(event) = &self.event_handle else {
            return WaitOutcome::Lost("device not initialized".into());
        };
        match event.wait_for_event(timeout.as_millis() as u32) {
            Ok(()) => WaitOutcome::Ready,
            Err(e) => {
                let msg = format!("{e:?}");
                if is_invalidated(&msg) {
                    WaitOutcome::Lost(msg)
                } else {
                    WaitOutcome::Timeout
                }
            }
        }
    }

    fn current_padding(&self) -> Result<u32> {
        let client = self.audio_client.as_ref().expect("initialize must precede current_padding");
        client
            .get_current_padding()
            .map(|p| p as u32)
            .map_err(|e| Error::RuntimeLost(format!("get_current_padding: {e:?}")))
    }

    fn for_each_capture_packet(&mut self, sink: &mut dyn FnMut(CapturePacket<'_>)) -> Result<()> {
        let Some(ClientHandle::Capture(capture_client)) = &self.client else {
            return Err(Error::InitFailed("endpoint is not a capture client".into()));
        };

        self.scratch.clear();
        let (_frames_read, flags) = capture_client
            .read_from_device_to_deque(&mut self.scratch)
            .map_err(|e| {
                let msg = format!("{e:?}");
                if is_invalidated(&msg) {
                    Error::RuntimeLost(msg)
                } else {
                    Error::RuntimeLost(format!("read_from_device_to_deque: {msg}"))
                }
            })?;

        if self.scratch.is_empty() {
            return Ok(());
        }
        let bytes: Vec<u8> = self.scratch.iter().copied().collect();
        let frames = (bytes.len() / self.negotiated_block_align.max(1)) as u32;

        sink(CapturePacket {
            bytes: &bytes,
            frames,
            flags: BufferFlags { silent: flags.silent },
        });
        Ok(())
    }

    fn render_cycle(&mut self, frames: u32, fill: &mut dyn FnMut(RenderBuffer<'_>) -> usize) -> Result<()> {
        let Some(ClientHandle::Render(render_client)) = &self.client else {
            return Err(Error::InitFailed("endpoint is not a render client".into()));
        };

        let mut buf = vec![0u8; frames as usize * self.negotiated_block_align.max(1)];
        let wrote = fill(RenderBuffer {
            bytes: &mut buf,
            frames,
        });
        if wrote < buf.len() {
            buf[wrote..].fill(0);
        }

        let mut deque: VecDeque<u8> = buf.into();
        render_client
            .write_to_device_from_deque(&mut deque)
            .map_err(|e| Error::RuntimeLost(format!("write_to_device_from_deque: {e:?}")))?;
        Ok(())
    }
}

/// Enumerates WASAPI endpoints via the default device collection
/// (spec.md §6 `listDevices`/`openById`).
pub struct WasapiDeviceEnumerator;

impl WasapiDeviceEnumerator {
    /// Initializes COM for the calling thread in multithreaded-apartment
    /// mode, as WASAPI requires, then returns an enumerator handle.
    pub fn new() -> Result<Self> {
        wasapi::initialize_mta()
            .map_err(|e| Error::InitFailed(format!("COM MTA initialization failed: {e:?}")))?;
        Ok(Self)
    }

    fn collection(direction: Direction) -> Result<DeviceCollection> {
        DeviceCollection::new(&direction).map_err(|e| Error::InitFailed(format!("DeviceCollection::new: {e:?}")))
    }

    fn list(direction: Direction) -> Result<Vec<DeviceInfo>> {
        let collection = Self::collection(direction)?;
        let count = collection
            .get_nbr_devices()
            .map_err(|e| Error::InitFailed(format!("get_nbr_devices: {e:?}")))?;
        let mut out = Vec::with_capacity(count as usize);
        for i in 0..count {
            let device = collection
                .get_device_at_index(i)
                .map_err(|e| Error::InitFailed(format!("get_device_at_index: {e:?}")))?;
            let id = device.get_id().map_err(|e| Error::InitFailed(format!("get_id: {e:?}")))?;
            let name = device
                .get_friendlyname()
                .map_err(|e| Error::InitFailed(format!("get_friendlyname: {e:?}")))?;
            out.push(DeviceInfo { id, name });
        }
        Ok(out)
    }
}

impl DeviceEnumerator for WasapiDeviceEnumerator {
    fn enumerate_capture(&self) -> Result<Vec<DeviceInfo>> {
        Self::list(Direction::Capture)
    }

    fn enumerate_render(&self) -> Result<Vec<DeviceInfo>> {
        Self::list(Direction::Render)
    }

    fn open(&self, id: &str, flow: Flow) -> Result<Box<dyn AudioEndpointBackend>> {
        let direction = match flow {
            Flow::Capture => Direction::Capture,
            Flow::Render => Direction::Render,
        };
        let collection = Self::collection(direction)?;
        let count = collection
            .get_nbr_devices()
            .map_err(|e| Error::InitFailed(format!("get_nbr_devices: {e:?}")))?;
        for i in 0..count {
            let device = collection
                .get_device_at_index(i)
                .map_err(|e| Error::InitFailed(format!("get_device_at_index: {e:?}")))?;
            let device_id = device.get_id().map_err(|e| Error::InitFailed(format!("get_id: {e:?}")))?;
            if device_id == id {
                return Ok(Box::new(WasapiBackend::new(flow, device)));
            }
        }
        Err(Error::DeviceNotFound(id.to_string()))
    }
}
