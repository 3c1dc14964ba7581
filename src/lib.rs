//! Real-time audio output.
//!
//! Connect an [`AudioContext`] to a backend, pick a [`Device`], open an
//! [`OutputStream`] on it and either push audio into its ring buffer with
//! [`OutputStream::write`] or produce it in a write callback that the backend's
//! real-time thread calls once per period.
//!
//! ```no_run
//! use soundout::AudioContext;
//!
//! let mut ctx = AudioContext::create()?;
//! ctx.connect()?;
//! let device = ctx.default_output_device()?;
//! let mut stream = device.create_output_stream()?;
//! stream.open()?;
//! stream.write_samples(&vec![0.0; 4800])?;
//! stream.start()?;
//! # Ok::<(), soundout::Error>(())
//! ```

pub mod backend;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod format;
pub mod ring_buffer;
pub mod stream;

pub use backend::{Backend, BackendEvent, BackendKind, BackendStream, DummyBackend, FakeBackend};
pub use config::{ContextConfig, StreamConfig};
pub use context::{AudioContext, ContextState};
pub use device::{Device, DeviceInfo};
pub use error::{Error, ErrorCode, Result};
pub use format::{ChannelId, ChannelLayout, SampleFormat, SampleRateRange, StreamFormat};
pub use stream::{OutputStream, StopToken, StreamState, StreamStats, WriteCallback, WriteContext};

// TODO: input streams
