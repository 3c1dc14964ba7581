//! Output through cpal
//!
//! cpal streams aren't `Send` on every platform, so each one is built, played and
//! dropped on an owner thread of its own and controlled over a channel. The render
//! closure lives inside cpal's data callback behind a [`Gate`]; stopping closes the
//! gate and waits for an in-flight call to leave.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::backend::{
    frames_for, Backend, BackendDevice, BackendEvent, BackendStream, EventSender, RenderFn,
    StreamRequest,
};
use crate::device::DeviceInfo;
use crate::error::{Error, ErrorCode, Result};
use crate::format::{ChannelLayout, SampleFormat, SampleRateRange, StreamFormat};

const DEFAULT_LATENCY: Duration = Duration::from_millis(50);

/// Frames rendered per call; larger cpal buffers are rendered in several calls.
const CHUNK_FRAMES: usize = 4096;

/// Real hardware via the platform's default cpal host.
pub struct CpalBackend {
    app_name: String,
    host_id: Option<cpal::HostId>,
    devices: Vec<(String, cpal::Device)>,
    default_index: Option<usize>,
    streams: Vec<Weak<CpalShared>>,
}

impl CpalBackend {
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            host_id: None,
            devices: Vec::new(),
            default_index: None,
            streams: Vec::new(),
        }
    }

    fn host(&self) -> Result<cpal::Host> {
        let id = self
            .host_id
            .ok_or_else(|| Error::disconnected("cpal backend is not connected"))?;
        cpal::host_from_id(id).map_err(|e| {
            Error::new(
                ErrorCode::BackendUnavailable,
                format!("cpal host {} unavailable: {e}", id.name()),
            )
        })
    }
}

impl Backend for CpalBackend {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn connect(&mut self) -> Result<()> {
        if self.host_id.is_some() {
            return Err(Error::invalid("cpal backend is already connected"));
        }
        let host = cpal::default_host();
        host.output_devices().map_err(|e| {
            Error::new(
                ErrorCode::BackendInitFailed,
                format!("cpal host {} has no usable devices: {e}", host.id().name()),
            )
        })?;
        tracing::debug!(host = host.id().name(), app = %self.app_name, "cpal host selected");
        self.host_id = Some(host.id());
        Ok(())
    }

    fn disconnect(&mut self) {
        for weak in self.streams.drain(..) {
            if let Some(shared) = weak.upgrade() {
                shared.detach();
            }
        }
        self.devices.clear();
        self.default_index = None;
        self.host_id = None;
    }

    fn output_devices(&mut self) -> Result<Vec<BackendDevice>> {
        let host = self.host()?;
        let default_name = host.default_output_device().and_then(|d| d.name().ok());
        let devices = host.output_devices().map_err(|e| {
            Error::new(ErrorCode::BackendDisconnected, format!("cpal device query failed: {e}"))
        })?;

        self.devices.clear();
        self.default_index = None;
        let mut infos: Vec<BackendDevice> = Vec::new();
        for device in devices {
            let Some(mut info) = describe(&device) else {
                continue;
            };
            // cpal has no stable ids; names are unique enough once deduplicated
            let duplicates = infos
                .iter()
                .filter(|d: &&BackendDevice| d.info.name == info.name)
                .count();
            if duplicates > 0 {
                info.id = format!("{}#{}", info.id, duplicates);
            }
            if self.default_index.is_none() && default_name.as_deref() == Some(info.name.as_str()) {
                self.default_index = Some(infos.len());
            }
            self.devices.push((info.id.clone(), device));
            infos.push(BackendDevice::unmanaged(info));
        }
        Ok(infos)
    }

    fn default_output_device(&self) -> Option<usize> {
        self.default_index
    }

    fn open_output(
        &mut self,
        device: &DeviceInfo,
        request: &StreamRequest,
        render: RenderFn,
        events: EventSender,
    ) -> Result<Box<dyn BackendStream>> {
        let (_, cpal_device) = self
            .devices
            .iter()
            .find(|(id, _)| *id == device.id)
            .ok_or_else(|| {
                Error::new(ErrorCode::DeviceNotFound, format!("no cpal device '{}'", device.id))
            })?;
        let sample_format = to_cpal(request.format).ok_or_else(|| {
            Error::new(
                ErrorCode::IncompatibleDevice,
                format!("cpal can't play {}", request.format.name()),
            )
        })?;

        let config = cpal::StreamConfig {
            channels: request.layout.channel_count() as u16,
            sample_rate: cpal::SampleRate(request.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let format = StreamFormat {
            sample_format: request.format,
            sample_rate: request.sample_rate,
            layout: request.layout.clone(),
            period_frames: frames_for(request.software_latency, request.sample_rate).max(1),
            software_latency: request.software_latency,
        };

        let shared = Arc::new(CpalShared {
            name: request.name.clone(),
            gate: Gate::default(),
            paused: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            events: events.clone(),
            owner: Mutex::new(None),
        });

        let (ready_tx, ready_rx) = bounded(1);
        let (commands, command_rx) = bounded(4);
        let owner_device = cpal_device.clone();
        let owner_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name(format!("soundout-cpal-{}", request.name))
            .spawn(move || {
                let built = build_stream(
                    &owner_device,
                    &config,
                    sample_format,
                    render,
                    owner_shared,
                    events,
                );
                owner_main(built, ready_tx, command_rx);
            })
            .map_err(|e| {
                Error::new(
                    ErrorCode::SystemResourceExhausted,
                    format!("failed to spawn cpal owner thread: {e}"),
                )
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(Error::new(
                    ErrorCode::DeviceOpenFailed,
                    "cpal owner thread exited before the stream was built",
                ));
            }
        }
        *shared.owner.lock() = Some(Owner { commands, handle });

        self.streams.retain(|weak| weak.strong_count() > 0);
        self.streams.push(Arc::downgrade(&shared));
        Ok(Box::new(CpalStream { shared, format }))
    }
}

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const BUSY: u8 = 2;

/// Lets the data callback into the render closure only while the stream is started.
#[derive(Default)]
struct Gate(AtomicU8);

impl Gate {
    fn enter(&self) -> bool {
        self.0
            .compare_exchange(OPEN, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn leave(&self) {
        self.0.store(OPEN, Ordering::Release);
    }

    fn open(&self) {
        self.0.store(OPEN, Ordering::Release);
    }

    /// Returns once no render call is in flight and none will start.
    fn close(&self) {
        loop {
            match self
                .0
                .compare_exchange(OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) | Err(CLOSED) => return,
                Err(_) => std::thread::yield_now(),
            }
        }
    }
}

enum Command {
    Play(Sender<Result<()>>),
    Pause,
    Close,
}

struct Owner {
    commands: Sender<Command>,
    handle: JoinHandle<()>,
}

struct CpalShared {
    name: String,
    gate: Gate,
    paused: AtomicBool,
    detached: AtomicBool,
    events: EventSender,
    owner: Mutex<Option<Owner>>,
}

impl CpalShared {
    fn shutdown(&self) {
        self.gate.close();
        if let Some(owner) = self.owner.lock().take() {
            let _ = owner.commands.send(Command::Close);
            if owner.handle.join().is_err() {
                tracing::error!(stream = %self.name, "cpal owner thread panicked");
            }
        }
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::Release);
        self.shutdown();
        self.events.send(BackendEvent::Disconnected);
    }
}

struct CpalStream {
    shared: Arc<CpalShared>,
    format: StreamFormat,
}

impl BackendStream for CpalStream {
    fn format(&self) -> &StreamFormat {
        &self.format
    }

    fn start(&mut self) -> Result<()> {
        if self.shared.detached.load(Ordering::Acquire) {
            return Err(Error::disconnected(format!(
                "stream '{}' belongs to a disconnected backend",
                self.shared.name
            )));
        }
        let (ack_tx, ack_rx) = bounded(1);
        {
            let owner = self.shared.owner.lock();
            let owner = owner
                .as_ref()
                .ok_or_else(|| Error::new(ErrorCode::StreamingError, "cpal stream is closed"))?;
            self.shared.gate.open();
            owner
                .commands
                .send(Command::Play(ack_tx))
                .map_err(|_| Error::new(ErrorCode::StreamingError, "cpal owner thread is gone"))?;
        }
        match ack_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(Error::new(ErrorCode::StreamingError, "cpal owner thread is gone")),
        }
    }

    fn pause(&mut self, paused: bool) -> Result<()> {
        self.shared.paused.store(paused, Ordering::Release);
        Ok(())
    }

    fn clear_buffer(&mut self) -> Result<()> {
        // cpal doesn't expose the device queue; the ring is cleared by the engine
        Ok(())
    }

    fn stop(&mut self) {
        self.shared.gate.close();
        if let Some(owner) = self.shared.owner.lock().as_ref() {
            let _ = owner.commands.send(Command::Pause);
        }
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

fn owner_main(
    built: Result<cpal::Stream>,
    ready: Sender<Result<()>>,
    commands: Receiver<Command>,
) {
    let stream = match built {
        Ok(stream) => {
            let _ = ready.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    for command in commands.iter() {
        match command {
            Command::Play(ack) => {
                let _ = ack.send(stream.play().map_err(|e| match e {
                    cpal::PlayStreamError::DeviceNotAvailable => {
                        Error::disconnected("cpal device went away")
                    }
                    other => Error::new(ErrorCode::StreamingError, other.to_string()),
                }));
            }
            Command::Pause => {
                if let Err(e) = stream.pause() {
                    tracing::warn!(error = %e, "cpal stream refused to pause");
                }
            }
            Command::Close => break,
        }
    }
    drop(stream);
}

fn build_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    render: RenderFn,
    shared: Arc<CpalShared>,
    events: EventSender,
) -> Result<cpal::Stream> {
    let built = match sample_format {
        cpal::SampleFormat::I8 => {
            build_typed(device, config, render, shared, events, |b: &[u8]| i8::from_ne_bytes([b[0]]))
        }
        cpal::SampleFormat::U8 => build_typed(device, config, render, shared, events, |b: &[u8]| b[0]),
        cpal::SampleFormat::I16 => build_typed(device, config, render, shared, events, |b: &[u8]| {
            i16::from_ne_bytes([b[0], b[1]])
        }),
        cpal::SampleFormat::U16 => build_typed(device, config, render, shared, events, |b: &[u8]| {
            u16::from_ne_bytes([b[0], b[1]])
        }),
        cpal::SampleFormat::I32 => build_typed(device, config, render, shared, events, |b: &[u8]| {
            i32::from_ne_bytes([b[0], b[1], b[2], b[3]])
        }),
        cpal::SampleFormat::F32 => build_typed(device, config, render, shared, events, |b: &[u8]| {
            f32::from_ne_bytes([b[0], b[1], b[2], b[3]])
        }),
        cpal::SampleFormat::F64 => build_typed(device, config, render, shared, events, |b: &[u8]| {
            f64::from_ne_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        }),
        other => {
            return Err(Error::new(
                ErrorCode::IncompatibleDevice,
                format!("unsupported cpal sample format {other:?}"),
            ))
        }
    };
    built.map_err(|e| {
        let code = match e {
            cpal::BuildStreamError::DeviceNotAvailable => ErrorCode::DeviceNotFound,
            cpal::BuildStreamError::StreamConfigNotSupported => ErrorCode::IncompatibleDevice,
            cpal::BuildStreamError::InvalidArgument => ErrorCode::InvalidArgument,
            cpal::BuildStreamError::StreamIdOverflow => ErrorCode::SystemResourceExhausted,
            _ => ErrorCode::DeviceOpenFailed,
        };
        Error::new(code, format!("cpal failed to build the stream: {e}"))
    })
}

/// Renders into a byte area in the stream's native-endian format, then copies it
/// out as `T`.
fn build_typed<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut render: RenderFn,
    shared: Arc<CpalShared>,
    events: EventSender,
    decode: fn(&[u8]) -> T,
) -> std::result::Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample + Send + 'static,
{
    let channels = usize::from(config.channels).max(1);
    let bytes_per_sample = std::mem::size_of::<T>();
    let mut area = vec![0u8; CHUNK_FRAMES * channels * bytes_per_sample];
    let panic_events = events.clone();

    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            if shared.paused.load(Ordering::Acquire) || !shared.gate.enter() {
                data.fill(<T as cpal::Sample>::EQUILIBRIUM);
                return;
            }

            let rendered = catch_unwind(AssertUnwindSafe(|| {
                render_chunked(data, &mut area, channels, &mut render, decode)
            }));
            if rendered.is_err() {
                // keep the callback out for good; the stream is failed by the engine
                shared.paused.store(true, Ordering::Release);
                data.fill(<T as cpal::Sample>::EQUILIBRIUM);
                panic_events.send(BackendEvent::Error(ErrorCode::StreamingError));
            }
            shared.gate.leave();
        },
        move |err| {
            let code = match err {
                cpal::StreamError::DeviceNotAvailable => ErrorCode::BackendDisconnected,
                _ => ErrorCode::StreamingError,
            };
            tracing::warn!(error = %err, "cpal stream error");
            events.send(BackendEvent::Error(code));
        },
        None,
    )
}

/// Fills `data` through `area`, at most [`CHUNK_FRAMES`] frames per render call.
/// `area` is never grown.
fn render_chunked<T>(
    data: &mut [T],
    area: &mut [u8],
    channels: usize,
    render: &mut RenderFn,
    decode: fn(&[u8]) -> T,
) {
    let bytes_per_sample = std::mem::size_of::<T>();
    for chunk in data.chunks_mut(CHUNK_FRAMES * channels) {
        let frames = chunk.len() / channels;
        let bytes = chunk.len() * bytes_per_sample;
        render(&mut area[..bytes], frames, frames);
        for (out, raw) in chunk.iter_mut().zip(area[..bytes].chunks_exact(bytes_per_sample)) {
            *out = decode(raw);
        }
    }
}

fn from_cpal(format: cpal::SampleFormat) -> Option<SampleFormat> {
    let little = cfg!(target_endian = "little");
    let pick = |le, be| if little { le } else { be };
    Some(match format {
        cpal::SampleFormat::I8 => SampleFormat::S8,
        cpal::SampleFormat::U8 => SampleFormat::U8,
        cpal::SampleFormat::I16 => SampleFormat::S16_NE,
        cpal::SampleFormat::U16 => pick(SampleFormat::U16Le, SampleFormat::U16Be),
        cpal::SampleFormat::I32 => pick(SampleFormat::S32Le, SampleFormat::S32Be),
        cpal::SampleFormat::F32 => SampleFormat::F32_NE,
        cpal::SampleFormat::F64 => pick(SampleFormat::F64Le, SampleFormat::F64Be),
        _ => return None,
    })
}

fn to_cpal(format: SampleFormat) -> Option<cpal::SampleFormat> {
    [
        cpal::SampleFormat::I8,
        cpal::SampleFormat::U8,
        cpal::SampleFormat::I16,
        cpal::SampleFormat::U16,
        cpal::SampleFormat::I32,
        cpal::SampleFormat::F32,
        cpal::SampleFormat::F64,
    ]
    .into_iter()
    .find(|&c| from_cpal(c) == Some(format))
}

/// `None` for devices cpal can't describe, which are skipped.
fn describe(device: &cpal::Device) -> Option<DeviceInfo> {
    let name = device.name().ok()?;
    let default = device.default_output_config().ok()?;
    let ranges: Vec<_> = device.supported_output_configs().ok()?.collect();

    let mut formats = Vec::new();
    let mut sample_rates = Vec::new();
    let mut layouts: Vec<ChannelLayout> = Vec::new();
    let mut min_frames = u32::MAX;
    let mut max_frames = 0u32;
    for range in &ranges {
        if let Some(format) = from_cpal(range.sample_format()) {
            if !formats.contains(&format) {
                formats.push(format);
            }
        }
        let rates = SampleRateRange::new(range.min_sample_rate().0, range.max_sample_rate().0);
        if !sample_rates.contains(&rates) {
            sample_rates.push(rates);
        }
        if let Some(layout) = ChannelLayout::default_for(usize::from(range.channels())) {
            if !layouts.contains(&layout) {
                layouts.push(layout);
            }
        }
        if let cpal::SupportedBufferSize::Range { min, max } = range.buffer_size() {
            min_frames = min_frames.min(*min);
            max_frames = max_frames.max(*max);
        }
    }

    let current_format = from_cpal(default.sample_format())?;
    let current_sample_rate = default.sample_rate().0;
    let current_layout = ChannelLayout::default_for(usize::from(default.channels()))?;
    let to_latency =
        |frames: u32| Duration::from_secs_f64(f64::from(frames) / f64::from(current_sample_rate.max(1)));
    let (latency_min, latency_max) = if max_frames >= min_frames && max_frames > 0 {
        (to_latency(min_frames), to_latency(max_frames))
    } else {
        (Duration::from_millis(1), Duration::from_secs(2))
    };

    Some(DeviceInfo {
        id: name.clone(),
        is_raw: name.starts_with("hw:"),
        name,
        formats,
        sample_rates,
        layouts,
        current_format,
        current_layout,
        current_sample_rate,
        software_latency_min: latency_min,
        software_latency_max: latency_max,
        software_latency_current: DEFAULT_LATENCY.clamp(latency_min, latency_max.max(latency_min)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpal_format_mapping() {
        assert_eq!(from_cpal(cpal::SampleFormat::F32), Some(SampleFormat::F32_NE));
        assert_eq!(from_cpal(cpal::SampleFormat::I16), Some(SampleFormat::S16_NE));
        assert_eq!(to_cpal(SampleFormat::F32_NE), Some(cpal::SampleFormat::F32));
        assert_eq!(to_cpal(SampleFormat::S24Le), None);
    }

    #[test]
    fn test_large_buffers_render_in_chunks() {
        let mut area = vec![0u8; CHUNK_FRAMES * 2 * 2];
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        let mut render: RenderFn = Box::new(move |area, min, max| {
            seen.lock().push((min, max));
            for (i, sample) in area[..max * 4].chunks_exact_mut(2).enumerate() {
                sample.copy_from_slice(&(i as i16).to_ne_bytes());
            }
            max
        });

        let mut data = vec![0i16; (CHUNK_FRAMES * 2 + 100) * 2];
        render_chunked(&mut data, &mut area, 2, &mut render, |b: &[u8]| {
            i16::from_ne_bytes([b[0], b[1]])
        });

        assert_eq!(
            *calls.lock(),
            vec![
                (CHUNK_FRAMES, CHUNK_FRAMES),
                (CHUNK_FRAMES, CHUNK_FRAMES),
                (100, 100)
            ]
        );
        assert_eq!(area.len(), CHUNK_FRAMES * 2 * 2);
        assert_eq!(data[CHUNK_FRAMES * 2 + 5], 5);
    }

    #[test]
    fn test_gate_blocks_after_close() {
        let gate = Gate::default();
        assert!(!gate.enter());
        gate.open();
        assert!(gate.enter());
        gate.leave();
        gate.close();
        assert!(!gate.enter());
    }
}
