//! Instrumented backend for tests
//!
//! Periods only happen when the test asks for them, every render call is recorded,
//! and device handles are counted so leaks show up as a non-zero
//! [`FakeBackend::live_handles`]. Failures and events can be injected.
//!
//! Clones share state: move one clone into a context and keep another to drive it.
//! The period hook records on the real-time thread with a lock, which is fine for a
//! test double and nothing else.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::driver::{
    frames_for, Clock, Driver, DriverInner, DriverStream, PeriodHook, PeriodModel,
};
use crate::backend::{
    Backend, BackendDevice, BackendEvent, BackendStream, EventSender, RenderFn, StreamRequest,
};
use crate::device::DeviceInfo;
use crate::error::{Error, ErrorCode, Result};
use crate::format::{ChannelLayout, SampleFormat, SampleRateRange, StreamFormat};

/// One render call as seen by the fake backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeriodRecord {
    pub stream: String,
    pub min_frames: usize,
    pub max_frames: usize,
    pub frames_written: usize,
    /// What the stream rendered, `frames_written` frames in the stream format.
    pub bytes: Vec<u8>,
}

struct StreamEntry {
    name: String,
    driver: Weak<DriverInner>,
    events: EventSender,
}

struct FakeInner {
    connected: bool,
    devices: Vec<DeviceInfo>,
    default_index: Option<usize>,
    period_frames: usize,
    fail_connect: Option<ErrorCode>,
    fail_open: Option<ErrorCode>,
    reject_clear: Option<ErrorCode>,
    clear_requests: usize,
    streams: Vec<StreamEntry>,
}

struct FakeState {
    inner: Mutex<FakeInner>,
    live_handles: Arc<AtomicUsize>,
    records: Arc<Mutex<Vec<PeriodRecord>>>,
}

/// Releases one counted device handle on drop.
struct Lease(Arc<AtomicUsize>);

impl Lease {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct FakeBackend {
    state: Arc<FakeState>,
}

impl FakeBackend {
    /// A backend exposing `devices`; the first one is the default.
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        let default_index = if devices.is_empty() { None } else { Some(0) };
        Self {
            state: Arc::new(FakeState {
                inner: Mutex::new(FakeInner {
                    connected: false,
                    devices,
                    default_index,
                    period_frames: 256,
                    fail_connect: None,
                    fail_open: None,
                    reject_clear: None,
                    clear_requests: 0,
                    streams: Vec::new(),
                }),
                live_handles: Arc::new(AtomicUsize::new(0)),
                records: Arc::new(Mutex::new(Vec::new())),
            }),
        }
    }

    /// A typical stereo device: S16/F32, 44.1 and 48 kHz.
    pub fn stereo_device(id: &str, name: &str) -> DeviceInfo {
        DeviceInfo {
            id: id.to_string(),
            name: name.to_string(),
            is_raw: false,
            formats: vec![SampleFormat::S16Le, SampleFormat::F32Le],
            sample_rates: vec![
                SampleRateRange::exactly(44100),
                SampleRateRange::exactly(48000),
            ],
            layouts: vec![ChannelLayout::stereo(), ChannelLayout::mono()],
            current_format: SampleFormat::F32Le,
            current_layout: ChannelLayout::stereo(),
            current_sample_rate: 48000,
            software_latency_min: Duration::from_millis(2),
            software_latency_max: Duration::from_secs(1),
            software_latency_current: Duration::from_millis(20),
        }
    }

    pub fn set_period_frames(&self, frames: usize) {
        self.state.inner.lock().period_frames = frames.max(1);
    }

    pub fn set_default_index(&self, index: Option<usize>) {
        self.state.inner.lock().default_index = index;
    }

    /// Hot-plugs a device; visible after the next refresh.
    pub fn add_device(&self, device: DeviceInfo) {
        let mut inner = self.state.inner.lock();
        inner.devices.push(device);
        if inner.default_index.is_none() {
            inner.default_index = Some(0);
        }
    }

    pub fn remove_device(&self, id: &str) {
        let mut inner = self.state.inner.lock();
        inner.devices.retain(|d| d.id != id);
        if inner.devices.is_empty() {
            inner.default_index = None;
        }
    }

    /// The next `connect` fails with `code`.
    pub fn fail_next_connect(&self, code: ErrorCode) {
        self.state.inner.lock().fail_connect = Some(code);
    }

    /// The next `open_output` fails with `code`.
    pub fn fail_next_open(&self, code: ErrorCode) {
        self.state.inner.lock().fail_open = Some(code);
    }

    /// While set, `clear_buffer` is rejected with `code`.
    pub fn reject_clear(&self, code: Option<ErrorCode>) {
        self.state.inner.lock().reject_clear = code;
    }

    /// Runs `n` periods on every started stream, returning once all were rendered.
    pub fn run_periods(&self, n: usize) {
        for _ in 0..n {
            for driver in self.drivers() {
                driver.tick(true);
            }
        }
    }

    /// Starts one period on every started stream without waiting for it.
    pub fn tick_async(&self) {
        for driver in self.drivers() {
            driver.tick(false);
        }
    }

    /// Delivers `event` to every open stream.
    pub fn inject_event(&self, event: BackendEvent) {
        let inner = self.state.inner.lock();
        for entry in &inner.streams {
            entry.events.send(event);
        }
    }

    /// Simulates the audio server going away.
    pub fn simulate_disconnect(&self) {
        self.detach_all();
    }

    fn detach_all(&self) {
        let drivers = {
            let mut inner = self.state.inner.lock();
            inner.connected = false;
            inner
                .streams
                .drain(..)
                .filter_map(|entry| Driver::upgrade(&entry.driver))
                .collect::<Vec<_>>()
        };
        for driver in drivers {
            driver.detach();
        }
    }

    pub fn records(&self) -> Vec<PeriodRecord> {
        self.state.records.lock().clone()
    }

    pub fn records_for(&self, stream: &str) -> Vec<PeriodRecord> {
        self.state
            .records
            .lock()
            .iter()
            .filter(|r| r.stream == stream)
            .cloned()
            .collect()
    }

    /// Device handles handed out and not yet released.
    pub fn live_handles(&self) -> usize {
        self.state.live_handles.load(Ordering::SeqCst)
    }

    /// Streams whose real-time thread is currently running.
    pub fn running_streams(&self) -> usize {
        self.drivers().iter().filter(|d| d.is_running()).count()
    }

    /// Streams opened and not yet dropped.
    pub fn open_streams(&self) -> usize {
        self.drivers().len()
    }

    pub fn is_connected(&self) -> bool {
        self.state.inner.lock().connected
    }

    pub fn clear_requests(&self) -> usize {
        self.state.inner.lock().clear_requests
    }

    fn drivers(&self) -> Vec<Driver> {
        self.state
            .inner
            .lock()
            .streams
            .iter()
            .filter_map(|entry| Driver::upgrade(&entry.driver))
            .collect()
    }
}

impl Backend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn connect(&mut self) -> Result<()> {
        let mut inner = self.state.inner.lock();
        if let Some(code) = inner.fail_connect.take() {
            return Err(Error::new(code, "fake backend refused to connect"));
        }
        if inner.connected {
            return Err(Error::invalid("fake backend already has a connected client"));
        }
        inner.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.detach_all();
    }

    fn output_devices(&mut self) -> Result<Vec<BackendDevice>> {
        let inner = self.state.inner.lock();
        if !inner.connected {
            return Err(Error::disconnected("fake backend is not connected"));
        }
        Ok(inner
            .devices
            .iter()
            .map(|info| BackendDevice {
                info: info.clone(),
                handle: Box::new(Lease::acquire(&self.state.live_handles)),
            })
            .collect())
    }

    fn default_output_device(&self) -> Option<usize> {
        let inner = self.state.inner.lock();
        if inner.connected {
            inner.default_index
        } else {
            None
        }
    }

    fn open_output(
        &mut self,
        device: &DeviceInfo,
        request: &StreamRequest,
        render: RenderFn,
        events: EventSender,
    ) -> Result<Box<dyn BackendStream>> {
        let mut inner = self.state.inner.lock();
        if !inner.connected {
            return Err(Error::disconnected("fake backend is not connected"));
        }
        if let Some(code) = inner.fail_open.take() {
            return Err(Error::new(code, format!("fake backend refused to open '{}'", device.id)));
        }
        if !inner.devices.iter().any(|d| d.id == device.id) {
            return Err(Error::new(
                ErrorCode::DeviceNotFound,
                format!("device '{}' was unplugged", device.id),
            ));
        }

        let period_frames = inner.period_frames;
        let capacity = frames_for(request.software_latency, request.sample_rate).max(period_frames * 2);
        let format = StreamFormat {
            sample_format: request.format,
            sample_rate: request.sample_rate,
            layout: request.layout.clone(),
            period_frames,
            software_latency: request.software_latency,
        };

        let records = self.state.records.clone();
        let stream_name = request.name.clone();
        let hook: PeriodHook = Box::new(move |bytes, min_frames, max_frames, frames_written| {
            records.lock().push(PeriodRecord {
                stream: stream_name.clone(),
                min_frames,
                max_frames,
                frames_written,
                bytes: bytes.to_vec(),
            });
        });

        let driver = Driver::new(
            request.name.clone(),
            Clock::Manual,
            format,
            PeriodModel::new(period_frames, capacity),
            render,
            Some(hook),
            events.clone(),
        );
        inner.streams.retain(|entry| entry.driver.strong_count() > 0);
        inner.streams.push(StreamEntry {
            name: request.name.clone(),
            driver: driver.downgrade(),
            events,
        });

        Ok(Box::new(FakeStream {
            inner: DriverStream::new(driver),
            state: self.state.clone(),
        }))
    }
}

struct FakeStream {
    inner: DriverStream,
    state: Arc<FakeState>,
}

impl BackendStream for FakeStream {
    fn format(&self) -> &StreamFormat {
        self.inner.format()
    }

    fn start(&mut self) -> Result<()> {
        self.inner.start()
    }

    fn pause(&mut self, paused: bool) -> Result<()> {
        self.inner.pause(paused)
    }

    fn clear_buffer(&mut self) -> Result<()> {
        {
            let mut inner = self.state.inner.lock();
            if let Some(code) = inner.reject_clear {
                return Err(Error::new(code, "fake backend rejected clear request"));
            }
            inner.clear_requests += 1;
        }
        self.inner.clear_buffer()
    }

    fn stop(&mut self) {
        self.inner.stop();
    }
}

impl std::fmt::Debug for FakeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.state.inner.lock();
        f.debug_struct("FakeBackend")
            .field("connected", &inner.connected)
            .field("devices", &inner.devices.len())
            .field(
                "streams",
                &inner.streams.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            )
            .field("live_handles", &self.live_handles())
            .finish()
    }
}
