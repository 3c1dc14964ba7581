//! Backend with no hardware behind it
//!
//! Audio is consumed by a software clock at the negotiated rate and thrown away.
//! Always connects, so it is the last resort in the default backend order.

use std::sync::Weak;
use std::time::Duration;

use crate::backend::driver::{frames_for, Clock, Driver, DriverInner, DriverStream, PeriodModel};
use crate::backend::{Backend, BackendDevice, BackendStream, EventSender, RenderFn, StreamRequest};
use crate::device::DeviceInfo;
use crate::error::{Error, Result};
use crate::format::{ChannelLayout, SampleFormat, SampleRateRange, StreamFormat};

/// Settings for [`DummyBackend`].
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// Wall-clock length of one period.
    pub period: Duration,
    pub device_name: String,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(10),
            device_name: "Dummy Output Device".to_string(),
        }
    }
}

pub struct DummyBackend {
    config: DummyConfig,
    connected: bool,
    streams: Vec<Weak<DriverInner>>,
}

impl DummyBackend {
    pub fn new(config: DummyConfig) -> Self {
        Self {
            config,
            connected: false,
            streams: Vec::new(),
        }
    }

    fn device(&self) -> DeviceInfo {
        DeviceInfo {
            id: "dummy-out".to_string(),
            name: self.config.device_name.clone(),
            is_raw: false,
            formats: SampleFormat::ALL.to_vec(),
            sample_rates: vec![SampleRateRange::new(8000, 384_000)],
            layouts: vec![
                ChannelLayout::mono(),
                ChannelLayout::stereo(),
                ChannelLayout::quad(),
                ChannelLayout::surround_5_1(),
                ChannelLayout::surround_7_1(),
            ],
            current_format: SampleFormat::F32_NE,
            current_layout: ChannelLayout::stereo(),
            current_sample_rate: 48000,
            software_latency_min: Duration::from_millis(1),
            software_latency_max: Duration::from_secs(4),
            software_latency_current: Duration::from_millis(100),
        }
    }
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new(DummyConfig::default())
    }
}

impl Backend for DummyBackend {
    fn name(&self) -> &'static str {
        "dummy"
    }

    fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Err(Error::invalid("dummy backend is already connected"));
        }
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        for weak in self.streams.drain(..) {
            if let Some(driver) = Driver::upgrade(&weak) {
                driver.detach();
            }
        }
        self.connected = false;
    }

    fn output_devices(&mut self) -> Result<Vec<BackendDevice>> {
        if !self.connected {
            return Err(Error::disconnected("dummy backend is not connected"));
        }
        Ok(vec![BackendDevice::unmanaged(self.device())])
    }

    fn default_output_device(&self) -> Option<usize> {
        self.connected.then_some(0)
    }

    fn open_output(
        &mut self,
        _device: &DeviceInfo,
        request: &StreamRequest,
        render: RenderFn,
        events: EventSender,
    ) -> Result<Box<dyn BackendStream>> {
        if !self.connected {
            return Err(Error::disconnected("dummy backend is not connected"));
        }

        let period_frames = frames_for(self.config.period, request.sample_rate).max(1);
        let capacity = frames_for(request.software_latency, request.sample_rate).max(period_frames * 2);
        let format = StreamFormat {
            sample_format: request.format,
            sample_rate: request.sample_rate,
            layout: request.layout.clone(),
            period_frames,
            software_latency: request.software_latency,
        };

        let driver = Driver::new(
            request.name.clone(),
            Clock::Realtime,
            format,
            PeriodModel::new(period_frames, capacity),
            render,
            None,
            events,
        );
        self.streams.retain(|weak| weak.strong_count() > 0);
        self.streams.push(driver.downgrade());

        Ok(Box::new(DriverStream::new(driver)))
    }
}
