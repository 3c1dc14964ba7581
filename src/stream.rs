//! Output streams and the write-callback engine
//!
//! An [`OutputStream`] is configured, opened against its device, then started. Once
//! running, the backend's real-time thread calls the stream's write callback every
//! period with a [`WriteContext`] that wraps the backend's buffer area and the
//! stream's ring buffer. The application feeds the ring buffer with
//! [`OutputStream::write`] from its own thread, or produces audio directly in the
//! callback.
//!
//! The callback, the ring consumer and everything else the real-time side touches
//! live in one render closure owned by the backend thread. Stopping a stream joins
//! that thread, so when `stop`, `destroy` or `drop` return the callback is not
//! running and never will again.
//!
//! # Example
//!
//! ```no_run
//! use soundout::{AudioContext, SampleFormat};
//!
//! let mut ctx = AudioContext::create()?;
//! ctx.connect()?;
//! let device = ctx.default_output_device()?;
//!
//! let mut stream = device.create_output_stream()?;
//! stream.set_format(SampleFormat::F32_NE)?;
//! let mut phase = 0.0f32;
//! stream.set_write_callback(move |out, _min, max| {
//!     let step = 440.0 / out.format().sample_rate as f32;
//!     out.write_frames(max, |_frame, channel| {
//!         let value = (phase * std::f32::consts::TAU).sin() * 0.2;
//!         if channel == 0 {
//!             phase = (phase + step).fract();
//!         }
//!         value
//!     });
//! })?;
//! stream.open()?;
//!
//! let token = stream.stop_token();
//! std::thread::spawn(move || {
//!     std::thread::sleep(std::time::Duration::from_secs(1));
//!     token.stop();
//! });
//! stream.run()?;
//! # Ok::<(), soundout::Error>(())
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};

use crate::backend::{
    frames_for, BackendEvent, BackendStream, EventSender, RenderFn, StreamRequest,
};
use crate::config::StreamConfig;
use crate::context::ContextState;
use crate::device::Device;
use crate::error::{Error, ErrorCode, Result};
use crate::format::{ChannelLayout, SampleFormat, StreamFormat};
use crate::ring_buffer::{ring_buffer, RingReader, RingWriter};

/// Backend events buffered between two polls.
const EVENT_QUEUE: usize = 64;

/// Sample rate asked for when none is configured.
const PREFERRED_SAMPLE_RATE: u32 = 48000;

/// Longest ring buffer a stream may ask for.
pub const MAX_RING_LATENCY: Duration = Duration::from_secs(60);

/// The real-time write callback: `(context, min_frames, max_frames)`.
pub type WriteCallback = Box<dyn FnMut(&mut WriteContext<'_>, usize, usize) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Created,
    Opened,
    Running,
    Stopped,
    Failed,
}

/// Counters kept by a stream since it was opened.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub callbacks: u64,
    pub frames_written: u64,
    /// Periods the callback came up short plus underflows the backend reported.
    pub underflows: u64,
    /// Bytes offered to [`OutputStream::write`] that didn't fit.
    pub overflowed_bytes: u64,
}

/// Cancels a blocking [`OutputStream::run`] from any thread.
#[derive(Clone, Debug, Default)]
pub struct StopToken {
    stopped: Arc<AtomicBool>,
}

impl StopToken {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn reset(&self) {
        self.stopped.store(false, Ordering::Release);
    }
}

/// Touched from both sides; atomics only.
#[derive(Default)]
struct Shared {
    /// Writer position the ring is to be discarded up to.
    clear_mark: AtomicU64,
    /// Native code of the first error the callback signalled, 0 if none.
    callback_error: AtomicU8,
    callbacks: AtomicU64,
    frames_written: AtomicU64,
    underflows: AtomicU64,
}

/// What the write callback gets to fill one period.
pub struct WriteContext<'a> {
    area: &'a mut [u8],
    ring: &'a mut RingReader,
    format: &'a StreamFormat,
    shared: &'a Shared,
    min_frames: usize,
    max_frames: usize,
    written: usize,
}

impl<'a> WriteContext<'a> {
    /// Frames that must be written this period to avoid an underflow.
    #[inline]
    pub fn min_frames(&self) -> usize {
        self.min_frames
    }

    /// Frames that fit this period.
    #[inline]
    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    #[inline]
    pub fn format(&self) -> &StreamFormat {
        self.format
    }

    /// Frames written so far in this call.
    #[inline]
    pub fn frames_written(&self) -> usize {
        self.written
    }

    #[inline]
    pub fn remaining_frames(&self) -> usize {
        self.max_frames - self.written
    }

    /// Whole frames waiting in the ring buffer.
    pub fn ring_frames(&self) -> usize {
        self.ring.filled() / self.format.bytes_per_frame()
    }

    /// Moves up to `frames` from the ring buffer into the output. Returns frames moved.
    pub fn fill_from_ring(&mut self, frames: usize) -> usize {
        let n = frames.min(self.remaining_frames()).min(self.ring_frames());
        let bpf = self.format.bytes_per_frame();
        let start = self.written * bpf;
        self.ring.read(&mut self.area[start..start + n * bpf]);
        self.written += n;
        n
    }

    /// Writes up to `frames` frames, asking `sample(frame, channel)` for every
    /// sample. `frame` counts from zero within this call.
    pub fn write_frames<F>(&mut self, frames: usize, mut sample: F) -> usize
    where
        F: FnMut(usize, usize) -> f32,
    {
        let n = frames.min(self.remaining_frames());
        let sample_format = self.format.sample_format;
        let bps = sample_format.bytes_per_sample();
        let channels = self.format.channels();
        let start = self.written * bps * channels;

        for (frame, out) in self.area[start..start + n * bps * channels]
            .chunks_exact_mut(bps * channels)
            .enumerate()
        {
            for (channel, out) in out.chunks_exact_mut(bps).enumerate() {
                sample_format.encode(sample(frame, channel), out);
            }
        }
        self.written += n;
        n
    }

    pub fn write_silence(&mut self, frames: usize) -> usize {
        let n = frames.min(self.remaining_frames());
        let bpf = self.format.bytes_per_frame();
        let start = self.written * bpf;
        self.format
            .sample_format
            .fill_silence(&mut self.area[start..start + n * bpf]);
        self.written += n;
        n
    }

    /// Reports an error to the application thread. Only the first one sticks until
    /// it is taken.
    pub fn signal_error(&self, code: ErrorCode) {
        let _ = self.shared.callback_error.compare_exchange(
            0,
            code.to_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

fn drain_ring(ctx: &mut WriteContext<'_>, _min: usize, max: usize) {
    ctx.fill_from_ring(max);
}

/// Real-time half of a stream.
struct Renderer {
    callback: WriteCallback,
    ring: RingReader,
    format: StreamFormat,
    shared: Arc<Shared>,
}

impl Renderer {
    fn render(&mut self, area: &mut [u8], min: usize, max: usize) -> usize {
        let mark = self.shared.clear_mark.load(Ordering::Acquire);
        if mark > self.ring.position() {
            self.ring.discard_until(mark);
        }

        let mut ctx = WriteContext {
            area: &mut *area,
            ring: &mut self.ring,
            format: &self.format,
            shared: &self.shared,
            min_frames: min,
            max_frames: max,
            written: 0,
        };
        (self.callback)(&mut ctx, min, max);
        let mut written = ctx.written.min(max);

        if written < min {
            let bpf = self.format.bytes_per_frame();
            self.format
                .sample_format
                .fill_silence(&mut area[written * bpf..min * bpf]);
            written = min;
            self.shared.underflows.fetch_add(1, Ordering::Relaxed);
        }

        self.shared.callbacks.fetch_add(1, Ordering::Relaxed);
        self.shared
            .frames_written
            .fetch_add(written as u64, Ordering::Relaxed);
        written
    }
}

/// The closure handed to the backend. The [`Renderer`] arrives over `setup` once the
/// backend has negotiated a format; until then it plays silence.
fn render_fn(setup: Receiver<Renderer>, sample_format: SampleFormat) -> RenderFn {
    let mut renderer: Option<Renderer> = None;
    Box::new(move |area, min, max| {
        if renderer.is_none() {
            renderer = setup.try_recv().ok();
        }
        match renderer.as_mut() {
            Some(renderer) => renderer.render(area, min, max),
            None => {
                sample_format.fill_silence(area);
                min
            }
        }
    })
}

/// An output stream on one device.
pub struct OutputStream {
    device: Device,
    config: StreamConfig,
    state: StreamState,
    callback: Option<WriteCallback>,
    format: Option<StreamFormat>,
    writer: Option<RingWriter>,
    backend: Option<Box<dyn BackendStream>>,
    events: Receiver<BackendEvent>,
    event_tx: EventSender,
    shared: Arc<Shared>,
    stop: StopToken,
    backend_underflows: u64,
}

impl OutputStream {
    /// A stream on `device` with the default configuration.
    pub fn create(device: &Device) -> Result<Self> {
        Self::with_config(device, StreamConfig::default())
    }

    pub fn with_config(device: &Device, config: StreamConfig) -> Result<Self> {
        check_name(&config.name)?;
        check_ring_latency(config.ring_latency)?;
        let (event_tx, events) = EventSender::bounded(EVENT_QUEUE);
        Ok(Self {
            device: device.clone(),
            config,
            state: StreamState::Created,
            callback: None,
            format: None,
            writer: None,
            backend: None,
            events,
            event_tx,
            shared: Arc::new(Shared::default()),
            stop: StopToken::default(),
            backend_underflows: 0,
        })
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// The negotiated format, once open.
    pub fn format(&self) -> Option<&StreamFormat> {
        self.format.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.state == StreamState::Running
    }

    pub fn set_format(&mut self, format: SampleFormat) -> Result<()> {
        self.ensure_created("set_format")?;
        self.config.format = Some(format);
        Ok(())
    }

    pub fn set_sample_rate(&mut self, rate: u32) -> Result<()> {
        self.ensure_created("set_sample_rate")?;
        if rate == 0 {
            return Err(Error::invalid("sample rate must be positive"));
        }
        self.config.sample_rate = Some(rate);
        Ok(())
    }

    pub fn set_layout(&mut self, layout: ChannelLayout) -> Result<()> {
        self.ensure_created("set_layout")?;
        if layout.channel_count() == 0 {
            return Err(Error::invalid("channel layout has no channels"));
        }
        self.config.layout = Some(layout);
        Ok(())
    }

    pub fn set_software_latency(&mut self, latency: Duration) -> Result<()> {
        self.ensure_created("set_software_latency")?;
        self.config.software_latency = Some(latency);
        Ok(())
    }

    pub fn set_ring_latency(&mut self, latency: Duration) -> Result<()> {
        self.ensure_created("set_ring_latency")?;
        check_ring_latency(latency)?;
        self.config.ring_latency = latency;
        Ok(())
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> Result<()> {
        self.ensure_created("set_name")?;
        let name = name.into();
        check_name(&name)?;
        self.config.name = name;
        Ok(())
    }

    /// Registers the real-time callback. Without one, the stream plays whatever
    /// was written to its ring buffer.
    ///
    /// The callback runs on the backend's real-time thread and must not block.
    pub fn set_write_callback<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(&mut WriteContext<'_>, usize, usize) + Send + 'static,
    {
        self.ensure_created("set_write_callback")?;
        self.callback = Some(Box::new(callback));
        Ok(())
    }

    /// Negotiates the format with the device and opens the backend stream.
    pub fn open(&mut self) -> Result<()> {
        self.ensure_created("open")?;

        let request = match self.negotiate() {
            Ok(request) => request,
            Err(e) => return Err(self.fail(e)),
        };

        let (setup_tx, setup_rx) = bounded(1);
        let render = render_fn(setup_rx, request.format);
        let opened = self.device.context().open_output(
            self.device.generation(),
            self.device.info(),
            &request,
            render,
            self.event_tx.clone(),
        );
        let backend = match opened {
            Ok(backend) => backend,
            Err(e) => return Err(self.fail(e)),
        };

        let format = backend.format().clone();
        let bpf = format.bytes_per_frame();
        let ring_frames = frames_for(self.config.ring_latency, format.sample_rate)
            .max(format.period_frames)
            .max(1);
        let Some(ring_bytes) = ring_frames.checked_mul(bpf) else {
            drop(backend);
            return Err(self.fail(Error::invalid(format!(
                "ring buffer of {ring_frames} frames is too large"
            ))));
        };
        let (writer, reader) = ring_buffer(ring_bytes);

        let callback = self
            .callback
            .take()
            .unwrap_or_else(|| Box::new(drain_ring));
        let _ = setup_tx.send(Renderer {
            callback,
            ring: reader,
            format: format.clone(),
            shared: self.shared.clone(),
        });

        tracing::info!(
            stream = %self.config.name,
            device = %self.device.id(),
            format = format.sample_format.name(),
            sample_rate = format.sample_rate,
            channels = format.channels(),
            period_frames = format.period_frames,
            ring_frames,
            "output stream opened"
        );

        self.format = Some(format);
        self.writer = Some(writer);
        self.backend = Some(backend);
        self.state = StreamState::Opened;
        Ok(())
    }

    fn negotiate(&self) -> Result<StreamRequest> {
        let info = self.device.info();
        let incompatible = |what: String| {
            Error::new(
                ErrorCode::IncompatibleDevice,
                format!("device '{}' does not support {}", info.id, what),
            )
        };

        let sample_rate = match self.config.sample_rate {
            Some(rate) if info.supports_sample_rate(rate) => rate,
            Some(rate) => return Err(incompatible(format!("{rate} Hz"))),
            None => info
                .nearest_sample_rate(PREFERRED_SAMPLE_RATE)
                .ok_or_else(|| incompatible("any sample rate".to_string()))?,
        };

        let format = match self.config.format {
            Some(format) if info.supports_format(format) => format,
            Some(format) => return Err(incompatible(format!("sample format {}", format.name()))),
            None if info.supports_format(SampleFormat::F32_NE) => SampleFormat::F32_NE,
            None => *info
                .formats
                .first()
                .ok_or_else(|| incompatible("any sample format".to_string()))?,
        };

        let layout = match &self.config.layout {
            Some(layout) if info.supports_layout(layout) => layout.clone(),
            Some(layout) => return Err(incompatible(format!("layout {}", layout.name()))),
            None => info.current_layout.clone(),
        };

        let software_latency = info.clamp_latency(
            self.config
                .software_latency
                .unwrap_or(info.software_latency_current),
        );

        Ok(StreamRequest {
            name: self.config.name.clone(),
            format,
            sample_rate,
            layout,
            software_latency,
        })
    }

    /// Starts the real-time thread.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            StreamState::Opened | StreamState::Stopped => {}
            StreamState::Running => return Ok(()),
            StreamState::Created => return Err(Error::invalid("start() before open()")),
            StreamState::Failed => return Err(Error::invalid("stream has failed")),
        }

        let context = self.device.context();
        if !context.is_current(self.device.generation()) {
            let reason = if context.state() == ContextState::Destroyed {
                "context was destroyed"
            } else {
                "context was disconnected since this stream was opened"
            };
            return Err(self.fail(Error::disconnected(reason)));
        }

        let Some(backend) = self.backend.as_mut() else {
            return Err(Error::invalid("stream has no backend stream"));
        };
        if let Err(e) = backend.start() {
            return Err(self.fail(e));
        }
        self.state = StreamState::Running;
        tracing::info!(stream = %self.config.name, "output stream started");
        Ok(())
    }

    /// Stops the real-time thread and waits for it.
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            StreamState::Running => {}
            StreamState::Stopped => return Ok(()),
            state => return Err(Error::invalid(format!("stop() in state {state:?}"))),
        }
        if let Some(backend) = self.backend.as_mut() {
            backend.stop();
        }
        self.state = StreamState::Stopped;
        tracing::info!(stream = %self.config.name, "output stream stopped");
        Ok(())
    }

    /// A paused stream keeps its device clock running but the callback isn't called.
    pub fn pause(&mut self, paused: bool) -> Result<()> {
        if self.state != StreamState::Running {
            return Err(Error::invalid("pause() needs a running stream"));
        }
        match self.backend.as_mut() {
            Some(backend) => backend.pause(paused),
            None => Err(Error::invalid("stream has no backend stream")),
        }
    }

    /// Drops everything queued in the ring buffer so far and asks the backend to
    /// drop what it has buffered. Audio written afterwards is kept.
    ///
    /// The ring is drained on the real-time side at its next period. Nothing is
    /// dropped if the backend rejects the request.
    pub fn clear_buffer(&mut self) -> Result<()> {
        if !matches!(self.state, StreamState::Opened | StreamState::Running) {
            return Err(Error::invalid(format!(
                "clear_buffer() in state {:?}",
                self.state
            )));
        }
        if let Some(backend) = self.backend.as_mut() {
            backend.clear_buffer()?;
        }
        if let Some(writer) = self.writer.as_ref() {
            self.shared
                .clear_mark
                .fetch_max(writer.position(), Ordering::AcqRel);
        }
        Ok(())
    }

    /// Queues raw frames in the stream's sample format. Trailing bytes that don't
    /// make up a whole frame are ignored. Returns the bytes accepted.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        let bpf = self.ready_format()?.bytes_per_frame();
        let whole = bytes.len() - bytes.len() % bpf;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::invalid("write() before open()"))?;
        Ok(writer.write(&bytes[..whole]))
    }

    /// Encodes interleaved samples into the stream format and queues them.
    /// Returns the samples accepted, always a whole number of frames.
    pub fn write_samples(&mut self, samples: &[f32]) -> Result<usize> {
        let format = self.ready_format()?;
        let sample_format = format.sample_format;
        let bps = sample_format.bytes_per_sample();
        let channels = format.channels();

        let whole = samples.len() - samples.len() % channels;
        let mut bytes = vec![0u8; whole * bps];
        for (sample, out) in samples[..whole].iter().zip(bytes.chunks_exact_mut(bps)) {
            sample_format.encode(*sample, out);
        }
        Ok(self.write(&bytes)? / bps)
    }

    /// Bytes that can be written without dropping any.
    pub fn writable_bytes(&self) -> usize {
        self.writer.as_ref().map_or(0, |w| w.free())
    }

    /// Whether any write dropped bytes since the last call.
    pub fn take_overflow(&mut self) -> bool {
        self.writer.as_mut().map_or(false, |w| w.take_overflow())
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            callbacks: self.shared.callbacks.load(Ordering::Relaxed),
            frames_written: self.shared.frames_written.load(Ordering::Relaxed),
            underflows: self.shared.underflows.load(Ordering::Relaxed) + self.backend_underflows,
            overflowed_bytes: self.writer.as_ref().map_or(0, |w| w.dropped_bytes()),
        }
    }

    /// The error the callback signalled, if any. Clears it.
    pub fn take_callback_error(&self) -> Option<ErrorCode> {
        ErrorCode::from_u8(self.shared.callback_error.swap(0, Ordering::AcqRel))
    }

    /// A handle that makes [`run`](Self::run) return.
    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    /// Handles the backend events and callback errors that arrived so far without
    /// blocking. Fails the stream on anything fatal.
    pub fn poll_events(&mut self) -> Result<()> {
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event)?;
        }
        self.check_backend_fatal()?;
        self.check_callback_error()
    }

    /// Starts the stream if needed and blocks until the stop token fires or the
    /// stream fails.
    ///
    /// Underflows are counted, not fatal. The stop token is checked once per period.
    pub fn run(&mut self) -> Result<()> {
        match self.state {
            StreamState::Opened | StreamState::Stopped => self.start()?,
            StreamState::Running => {}
            state => return Err(Error::invalid(format!("run() in state {state:?}"))),
        }

        let period = self
            .format
            .as_ref()
            .map_or(Duration::from_millis(10), |f| f.period_duration())
            .max(Duration::from_millis(1));

        loop {
            if self.stop.is_stopped() {
                self.stop.reset();
                return self.stop();
            }
            self.check_backend_fatal()?;
            self.check_callback_error()?;

            match self.events.recv_timeout(period) {
                Ok(event) => self.handle_event(event)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(self.fail(Error::disconnected("backend event queue closed")));
                }
            }
        }
    }

    fn handle_event(&mut self, event: BackendEvent) -> Result<()> {
        match event {
            BackendEvent::Underflow | BackendEvent::Error(ErrorCode::Underflow) => {
                self.backend_underflows += 1;
                tracing::trace!(stream = %self.config.name, "backend underflow");
                Ok(())
            }
            BackendEvent::Error(_) | BackendEvent::Disconnected => {
                // the latch holds the same event, or an earlier fatal one
                let code = self
                    .event_tx
                    .take_fatal()
                    .or_else(|| event.fatal_code())
                    .unwrap_or(ErrorCode::StreamingError);
                Err(self.fatal(code))
            }
        }
    }

    /// Fails on a fatal backend event even if the queue dropped it.
    fn check_backend_fatal(&mut self) -> Result<()> {
        if self.state == StreamState::Failed {
            return Ok(());
        }
        match self.event_tx.take_fatal() {
            Some(code) => Err(self.fatal(code)),
            None => Ok(()),
        }
    }

    fn fatal(&mut self, code: ErrorCode) -> Error {
        let message = if code == ErrorCode::BackendDisconnected {
            format!("backend went away under stream '{}'", self.config.name)
        } else {
            format!("backend reported an error on stream '{}'", self.config.name)
        };
        self.fail(Error::new(code, message))
    }

    fn check_callback_error(&mut self) -> Result<()> {
        match self.take_callback_error() {
            Some(code) => Err(self.fail(Error::new(code, "signalled by the write callback"))),
            None => Ok(()),
        }
    }

    /// Halts and releases everything. The callback has returned for the last time
    /// when this returns.
    pub fn destroy(self) {}

    fn fail(&mut self, error: Error) -> Error {
        if let Some(backend) = self.backend.as_mut() {
            backend.stop();
        }
        self.state = StreamState::Failed;
        tracing::error!(stream = %self.config.name, %error, "output stream failed");
        error
    }

    fn ensure_created(&self, op: &str) -> Result<()> {
        if self.state != StreamState::Created {
            return Err(Error::invalid(format!(
                "{op}() is only valid before open(), stream is {:?}",
                self.state
            )));
        }
        Ok(())
    }

    fn ready_format(&self) -> Result<&StreamFormat> {
        match (&self.state, &self.format) {
            (StreamState::Failed, _) => Err(Error::invalid("stream has failed")),
            (_, Some(format)) => Ok(format),
            (_, None) => Err(Error::invalid("stream is not open")),
        }
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.stop();
            drop(backend);
            tracing::debug!(stream = %self.config.name, "output stream destroyed");
        }
    }
}

impl fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputStream")
            .field("name", &self.config.name)
            .field("device", &self.device.id())
            .field("state", &self.state)
            .field("format", &self.format)
            .finish()
    }
}

fn check_ring_latency(latency: Duration) -> Result<()> {
    if latency > MAX_RING_LATENCY {
        return Err(Error::invalid(format!(
            "ring latency {latency:?} is longer than {MAX_RING_LATENCY:?}"
        )));
    }
    Ok(())
}

fn check_name(name: &str) -> Result<()> {
    if name.contains('\0') {
        return Err(Error::new(
            ErrorCode::EncodingError,
            "stream name contains a NUL byte",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FakeBackend;
    use crate::context::AudioContext;

    fn setup() -> (FakeBackend, AudioContext, Device) {
        let fake = FakeBackend::new(vec![FakeBackend::stereo_device("out", "Out")]);
        fake.set_period_frames(64);
        let mut ctx = AudioContext::with_backend(fake.clone()).unwrap();
        ctx.connect().unwrap();
        let device = ctx.output_device(0).unwrap();
        (fake, ctx, device)
    }

    #[test]
    fn test_negotiation_defaults() {
        let (_fake, _ctx, device) = setup();
        let mut stream = device.create_output_stream().unwrap();
        stream.open().unwrap();

        let format = stream.format().unwrap();
        assert_eq!(format.sample_rate, 48000);
        assert_eq!(format.sample_format, SampleFormat::F32_NE);
        assert_eq!(format.channels(), 2);
        assert_eq!(format.software_latency, Duration::from_millis(20));
        assert_eq!(stream.state(), StreamState::Opened);
    }

    #[test]
    fn test_latency_is_clamped() {
        let (_fake, _ctx, device) = setup();
        let mut stream = device.create_output_stream().unwrap();
        stream.set_software_latency(Duration::from_secs(30)).unwrap();
        stream.open().unwrap();
        assert_eq!(stream.format().unwrap().software_latency, Duration::from_secs(1));
    }

    #[test]
    fn test_unsupported_rate_fails_stream() {
        let (_fake, _ctx, device) = setup();
        let mut stream = device.create_output_stream().unwrap();
        stream.set_sample_rate(22050).unwrap();
        let err = stream.open().unwrap_err();
        assert_eq!(err.code(), ErrorCode::IncompatibleDevice);
        assert_eq!(stream.state(), StreamState::Failed);
    }

    #[test]
    fn test_unsupported_layout() {
        let (_fake, _ctx, device) = setup();
        let mut stream = device.create_output_stream().unwrap();
        stream.set_layout(ChannelLayout::surround_5_1()).unwrap();
        assert_eq!(
            stream.open().unwrap_err().code(),
            ErrorCode::IncompatibleDevice
        );
    }

    #[test]
    fn test_setters_rejected_after_open() {
        let (_fake, _ctx, device) = setup();
        let mut stream = device.create_output_stream().unwrap();
        stream.open().unwrap();

        assert_eq!(
            stream.set_format(SampleFormat::S16Le).unwrap_err().code(),
            ErrorCode::InvalidArgument
        );
        assert_eq!(
            stream.set_write_callback(|_, _, _| {}).unwrap_err().code(),
            ErrorCode::InvalidArgument
        );
        assert_eq!(stream.open().unwrap_err().code(), ErrorCode::InvalidArgument);
        assert_eq!(stream.state(), StreamState::Opened);
    }

    #[test]
    fn test_name_with_nul() {
        let (_fake, _ctx, device) = setup();
        let mut stream = device.create_output_stream().unwrap();
        assert_eq!(
            stream.set_name("bad\0name").unwrap_err().code(),
            ErrorCode::EncodingError
        );
        let config = StreamConfig::default().with_name("x\0");
        assert_eq!(
            OutputStream::with_config(&device, config).unwrap_err().code(),
            ErrorCode::EncodingError
        );
    }

    #[test]
    fn test_start_before_open() {
        let (_fake, _ctx, device) = setup();
        let mut stream = device.create_output_stream().unwrap();
        assert_eq!(stream.start().unwrap_err().code(), ErrorCode::InvalidArgument);
        assert_eq!(stream.state(), StreamState::Created);
        assert_eq!(
            stream.write(&[0; 8]).unwrap_err().code(),
            ErrorCode::InvalidArgument
        );
        assert_eq!(
            stream.clear_buffer().unwrap_err().code(),
            ErrorCode::InvalidArgument
        );
    }

    #[test]
    fn test_default_callback_drains_ring() {
        let (fake, _ctx, device) = setup();
        let mut stream = device.create_output_stream().unwrap();
        stream.set_format(SampleFormat::S16Le).unwrap();
        stream.open().unwrap();

        // 100 frames of stereo s16
        let accepted = stream.write(&[1u8; 401]).unwrap();
        assert_eq!(accepted, 400);

        stream.start().unwrap();
        fake.run_periods(1);

        let records = fake.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].frames_written, 100);

        // ring is empty now, second period is padded to min
        fake.run_periods(1);
        let stats = stream.stats();
        assert_eq!(stats.callbacks, 2);
        assert_eq!(stats.underflows, 1);
        stream.stop().unwrap();
    }

    #[test]
    fn test_short_callback_is_padded() {
        let (fake, _ctx, device) = setup();
        let mut stream = device.create_output_stream().unwrap();
        stream.set_write_callback(|out, _, _| {
            out.write_frames(3, |_, _| 0.5);
        }).unwrap();
        stream.open().unwrap();
        stream.start().unwrap();
        fake.run_periods(1);
        stream.stop().unwrap();

        let record = &fake.records()[0];
        assert_eq!(record.frames_written, record.min_frames);
        assert_eq!(stream.stats().underflows, 1);
    }

    #[test]
    fn test_callback_error_is_taken_once() {
        let (fake, _ctx, device) = setup();
        let mut stream = device.create_output_stream().unwrap();
        stream.set_write_callback(|out, min, _| {
            out.write_silence(min);
            out.signal_error(ErrorCode::StreamingError);
            out.signal_error(ErrorCode::Interrupted);
        }).unwrap();
        stream.open().unwrap();
        stream.start().unwrap();
        fake.run_periods(1);

        assert_eq!(stream.take_callback_error(), Some(ErrorCode::StreamingError));
        assert_eq!(stream.take_callback_error(), None);
    }

    #[test]
    fn test_write_samples_counts_whole_frames() {
        let (_fake, _ctx, device) = setup();
        let mut stream = device.create_output_stream().unwrap();
        stream.set_format(SampleFormat::S16Le).unwrap();
        stream.open().unwrap();
        assert_eq!(stream.write_samples(&[0.1, 0.2, 0.3]).unwrap(), 2);
    }

    #[test]
    fn test_overflow_is_reported() {
        let (_fake, _ctx, device) = setup();
        let mut stream = device.create_output_stream().unwrap();
        stream.set_format(SampleFormat::S16Le).unwrap();
        stream.set_ring_latency(Duration::ZERO).unwrap();
        stream.open().unwrap();

        // ring holds one period of 64 frames
        let capacity = stream.writable_bytes();
        assert_eq!(capacity, 64 * 4);
        assert_eq!(stream.write(&vec![0u8; capacity + 8]).unwrap(), capacity);
        assert!(stream.take_overflow());
        assert!(!stream.take_overflow());
        assert_eq!(stream.stats().overflowed_bytes, 8);
    }

    #[test]
    fn test_oversized_ring_latency_is_rejected() {
        let (_fake, _ctx, device) = setup();
        let mut stream = device.create_output_stream().unwrap();
        let huge = Duration::from_secs(u64::MAX / 4);
        assert_eq!(
            stream.set_ring_latency(huge).unwrap_err().code(),
            ErrorCode::InvalidArgument
        );
        assert_eq!(stream.config().ring_latency, Duration::from_millis(200));

        let config = StreamConfig::default().with_ring_latency(huge);
        assert_eq!(
            OutputStream::with_config(&device, config).unwrap_err().code(),
            ErrorCode::InvalidArgument
        );

        stream.set_ring_latency(MAX_RING_LATENCY).unwrap();
        stream.set_format(SampleFormat::S16Le).unwrap();
        stream.open().unwrap();
        assert_eq!(stream.writable_bytes(), 60 * 48000 * 4);
    }

    #[test]
    fn test_pause_only_when_running() {
        let (fake, _ctx, device) = setup();
        let mut stream = device.create_output_stream().unwrap();
        stream.open().unwrap();
        assert_eq!(stream.pause(true).unwrap_err().code(), ErrorCode::InvalidArgument);

        stream.start().unwrap();
        stream.pause(true).unwrap();
        fake.run_periods(3);
        assert_eq!(stream.stats().callbacks, 0);

        stream.pause(false).unwrap();
        fake.run_periods(1);
        assert_eq!(stream.stats().callbacks, 1);
    }

    #[test]
    fn test_stop_and_restart() {
        let (fake, _ctx, device) = setup();
        let mut stream = device.create_output_stream().unwrap();
        stream.open().unwrap();
        stream.start().unwrap();
        fake.run_periods(2);
        stream.stop().unwrap();
        assert_eq!(stream.state(), StreamState::Stopped);
        fake.run_periods(2);
        assert_eq!(stream.stats().callbacks, 2);

        stream.start().unwrap();
        fake.run_periods(1);
        assert_eq!(stream.stats().callbacks, 3);
    }

    #[test]
    fn test_backend_open_failure() {
        let (fake, _ctx, device) = setup();
        fake.fail_next_open(ErrorCode::DeviceOpenFailed);
        let mut stream = device.create_output_stream().unwrap();
        assert_eq!(stream.open().unwrap_err().code(), ErrorCode::DeviceOpenFailed);
        assert_eq!(stream.state(), StreamState::Failed);
        assert_eq!(stream.start().unwrap_err().code(), ErrorCode::InvalidArgument);
    }
}
