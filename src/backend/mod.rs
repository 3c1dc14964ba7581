//! The boundary to the platform audio system
//!
//! A [`Backend`] enumerates devices and opens output streams. Each opened stream is a
//! [`BackendStream`] that owns the real-time thread calling the render closure handed
//! to it by the engine. Everything behind this trait speaks bytes and frame counts;
//! typing, ring buffers and callbacks live in [`crate::stream`].
//!
//! Implementations:
//! - [`DummyBackend`]: software clock, always available
//! - [`FakeBackend`]: manually clocked and instrumented, for tests
//! - `CpalBackend`: real hardware through cpal (feature `cpal_backend`)

use std::any::Any;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::device::DeviceInfo;
use crate::error::{ErrorCode, Result};
use crate::format::{ChannelLayout, SampleFormat, StreamFormat};

#[cfg(feature = "cpal_backend")]
mod cpal;
mod driver;
mod dummy;
mod fake;

#[cfg(feature = "cpal_backend")]
pub use self::cpal::CpalBackend;
pub(crate) use driver::frames_for;
pub use dummy::{DummyBackend, DummyConfig};
pub use fake::{FakeBackend, PeriodRecord};

/// Fills `area` (room for `max_frames`) and returns the frames written,
/// somewhere in `min_frames..=max_frames`.
///
/// Called on the backend's real-time thread only.
pub type RenderFn = Box<dyn FnMut(&mut [u8], usize, usize) -> usize + Send>;

/// Backend-side reference to a device, released when dropped.
pub type DeviceHandle = Box<dyn Any + Send + Sync>;

/// Out-of-band notifications from a running stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendEvent {
    /// The device ran out of audio for a period.
    Underflow,
    /// The stream hit an error; it keeps running unless the code is fatal.
    Error(ErrorCode),
    /// The backend went away. The stream is already halted when this arrives.
    Disconnected,
}

impl BackendEvent {
    /// The error this event ends the stream with, if it is fatal.
    pub fn fatal_code(&self) -> Option<ErrorCode> {
        match *self {
            BackendEvent::Underflow | BackendEvent::Error(ErrorCode::Underflow) => None,
            BackendEvent::Error(code) => Some(code),
            BackendEvent::Disconnected => Some(ErrorCode::BackendDisconnected),
        }
    }
}

/// Where the real-time side reports [`BackendEvent`]s.
///
/// The queue is bounded and never blocks, so events are dropped when it is full.
/// The first fatal event is also latched in a slot of its own, which a full queue
/// can't lose.
#[derive(Clone)]
pub struct EventSender {
    queue: Sender<BackendEvent>,
    fatal: Arc<AtomicU8>,
}

impl EventSender {
    /// A sender with room for `capacity` queued events, and its receiving end.
    pub fn bounded(capacity: usize) -> (Self, Receiver<BackendEvent>) {
        let (queue, rx) = crossbeam_channel::bounded(capacity);
        (
            Self {
                queue,
                fatal: Arc::new(AtomicU8::new(0)),
            },
            rx,
        )
    }

    /// Never blocks or allocates; safe on the real-time thread.
    pub fn send(&self, event: BackendEvent) {
        if let Some(code) = event.fatal_code() {
            let _ = self.fatal.compare_exchange(
                0,
                code.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        let _ = self.queue.try_send(event);
    }

    /// The latched fatal error, if any. Clears it.
    pub(crate) fn take_fatal(&self) -> Option<ErrorCode> {
        ErrorCode::from_u8(self.fatal.swap(0, Ordering::AcqRel))
    }
}

/// A device as the backend reports it.
pub struct BackendDevice {
    pub info: DeviceInfo,
    pub handle: DeviceHandle,
}

impl BackendDevice {
    /// A device without backend-side resources.
    pub fn unmanaged(info: DeviceInfo) -> Self {
        Self {
            info,
            handle: Box::new(()),
        }
    }
}

/// What the engine asks for when opening a stream. Already validated against the
/// device's capabilities.
#[derive(Clone, Debug)]
pub struct StreamRequest {
    pub name: String,
    pub format: SampleFormat,
    pub sample_rate: u32,
    pub layout: ChannelLayout,
    pub software_latency: Duration,
}

/// Backends the context knows how to construct on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    #[cfg(feature = "cpal_backend")]
    Cpal,
    Dummy,
}

impl BackendKind {
    /// Preference order used when none is configured.
    pub fn defaults() -> Vec<BackendKind> {
        vec![
            #[cfg(feature = "cpal_backend")]
            BackendKind::Cpal,
            BackendKind::Dummy,
        ]
    }

    pub(crate) fn instantiate(self, app_name: &str) -> Result<Box<dyn Backend>> {
        match self {
            #[cfg(feature = "cpal_backend")]
            BackendKind::Cpal => Ok(Box::new(CpalBackend::new(app_name))),
            BackendKind::Dummy => {
                let _ = app_name;
                Ok(Box::new(DummyBackend::new(DummyConfig::default())))
            }
        }
    }
}

/// A platform audio system.
///
/// One instance belongs to exactly one context. Calls come from the application
/// thread, serialized by the context.
pub trait Backend: Send {
    /// Short name, e.g. "dummy" or "ALSA".
    fn name(&self) -> &'static str;

    /// Initialize the connection to the audio system.
    fn connect(&mut self) -> Result<()>;

    /// Tear the connection down.
    ///
    /// Every stream opened through this backend must have stopped calling its
    /// render closure before this returns. Streams receive
    /// [`BackendEvent::Disconnected`].
    fn disconnect(&mut self);

    /// Snapshot of the output devices.
    fn output_devices(&mut self) -> Result<Vec<BackendDevice>>;

    /// Index of the default output device in the last snapshot.
    fn default_output_device(&self) -> Option<usize>;

    /// Open an output stream on `device`.
    ///
    /// The stream must not call `render` before [`BackendStream::start`].
    fn open_output(
        &mut self,
        device: &DeviceInfo,
        request: &StreamRequest,
        render: RenderFn,
        events: EventSender,
    ) -> Result<Box<dyn BackendStream>>;
}

/// An opened output stream.
pub trait BackendStream: Send {
    /// What was actually negotiated.
    fn format(&self) -> &StreamFormat;

    /// Start calling the render closure on the real-time thread.
    fn start(&mut self) -> Result<()>;

    /// While paused the clock keeps running but the render closure is not called.
    fn pause(&mut self, paused: bool) -> Result<()>;

    /// Discard audio the backend has queued but not played.
    fn clear_buffer(&mut self) -> Result<()>;

    /// Stop the real-time thread and wait for it.
    ///
    /// When this returns the render closure is not running and won't be called
    /// again until the next `start`.
    fn stop(&mut self);
}
