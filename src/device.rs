//! Output device discovery results.
//!
//! A [`Device`] is an immutable snapshot of one output device taken when the
//! context last refreshed its device list. It is reference counted: clones are
//! cheap, and the backend's handle for the device is released exactly once, when
//! the last clone goes away.
//!
//! # Example
//!
//! ```no_run
//! use soundout::AudioContext;
//!
//! let mut ctx = AudioContext::create()?;
//! ctx.connect()?;
//! for (i, device) in ctx.list_output_devices()?.iter().enumerate() {
//!     println!("[{}] {} ({} Hz)", i, device.name(), device.current_sample_rate());
//! }
//! # Ok::<(), soundout::Error>(())
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::DeviceHandle;
use crate::context::{ContextShared, HandleLease};
use crate::error::Result;
use crate::format::{ChannelLayout, SampleFormat, SampleRateRange};
use crate::stream::OutputStream;

/// Capabilities of an output device as reported by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    /// Unique within one backend session.
    pub id: String,
    /// Human-readable device name
    pub name: String,
    /// Opened directly, without a sound server in between.
    pub is_raw: bool,
    pub formats: Vec<SampleFormat>,
    pub sample_rates: Vec<SampleRateRange>,
    pub layouts: Vec<ChannelLayout>,
    pub current_format: SampleFormat,
    pub current_layout: ChannelLayout,
    pub current_sample_rate: u32,
    pub software_latency_min: Duration,
    pub software_latency_max: Duration,
    /// Latency the device runs at by default.
    pub software_latency_current: Duration,
}

impl DeviceInfo {
    pub fn supports_format(&self, format: SampleFormat) -> bool {
        self.formats.contains(&format)
    }

    pub fn supports_layout(&self, layout: &ChannelLayout) -> bool {
        self.layouts
            .iter()
            .any(|l| l.channels() == layout.channels())
    }

    pub fn supports_sample_rate(&self, rate: u32) -> bool {
        self.sample_rates.iter().any(|r| r.contains(rate))
    }

    /// The smallest supported rate at or above `target`, falling back to the
    /// largest supported rate. `None` if the device lists no rates.
    pub fn nearest_sample_rate(&self, target: u32) -> Option<u32> {
        if self.supports_sample_rate(target) {
            return Some(target);
        }
        self.sample_rates
            .iter()
            .filter(|r| r.min > target)
            .map(|r| r.min)
            .min()
            .or_else(|| self.sample_rates.iter().map(|r| r.max).max())
    }

    pub fn clamp_latency(&self, latency: Duration) -> Duration {
        latency.clamp(
            self.software_latency_min,
            self.software_latency_max.max(self.software_latency_min),
        )
    }
}

pub(crate) struct DeviceInner {
    info: DeviceInfo,
    // released when the last Device clone drops
    _handle: DeviceHandle,
    generation: u64,
}

/// A discovered output device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
    lease: HandleLease,
}

impl Device {
    pub(crate) fn new(
        info: DeviceInfo,
        handle: DeviceHandle,
        lease: HandleLease,
        generation: u64,
    ) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                info,
                _handle: handle,
                generation,
            }),
            lease,
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.info.id
    }

    pub fn name(&self) -> &str {
        &self.inner.info.name
    }

    pub fn is_raw(&self) -> bool {
        self.inner.info.is_raw
    }

    pub fn formats(&self) -> &[SampleFormat] {
        &self.inner.info.formats
    }

    pub fn sample_rates(&self) -> &[SampleRateRange] {
        &self.inner.info.sample_rates
    }

    pub fn layouts(&self) -> &[ChannelLayout] {
        &self.inner.info.layouts
    }

    pub fn current_format(&self) -> SampleFormat {
        self.inner.info.current_format
    }

    pub fn current_layout(&self) -> &ChannelLayout {
        &self.inner.info.current_layout
    }

    pub fn current_sample_rate(&self) -> u32 {
        self.inner.info.current_sample_rate
    }

    /// `(min, max)` software latency the device accepts.
    pub fn software_latency_range(&self) -> (Duration, Duration) {
        (
            self.inner.info.software_latency_min,
            self.inner.info.software_latency_max,
        )
    }

    /// Default-latency hint.
    pub fn software_latency(&self) -> Duration {
        self.inner.info.software_latency_current
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.inner.info
    }

    pub fn supports_format(&self, format: SampleFormat) -> bool {
        self.inner.info.supports_format(format)
    }

    pub fn supports_layout(&self, layout: &ChannelLayout) -> bool {
        self.inner.info.supports_layout(layout)
    }

    pub fn supports_sample_rate(&self, rate: u32) -> bool {
        self.inner.info.supports_sample_rate(rate)
    }

    pub fn nearest_sample_rate(&self, target: u32) -> Option<u32> {
        self.inner.info.nearest_sample_rate(target)
    }

    /// Creates an output stream bound to this device.
    pub fn create_output_stream(&self) -> Result<OutputStream> {
        OutputStream::create(self)
    }

    /// Gives up this reference. Same as dropping it; spelled out for call sites
    /// that want the release to be visible.
    pub fn release(self) {}

    /// `true` if both values refer to the same snapshot entry.
    pub fn same_handle(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn context(&self) -> &Arc<ContextShared> {
        self.lease.context()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.inner.generation
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.inner.info.id)
            .field("name", &self.inner.info.name)
            .field("is_raw", &self.inner.info.is_raw)
            .finish()
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.inner.info.id == other.inner.info.id && self.inner.generation == other.inner.generation
    }
}
