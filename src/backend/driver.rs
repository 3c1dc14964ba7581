//! Real-time thread shared by the software-clocked backends
//!
//! The thread owns the render closure while it runs. Stopping joins the thread and
//! takes the closure back, so nothing the closure references can be released while
//! a render call is in flight.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::backend::{BackendEvent, BackendStream, EventSender, RenderFn};
use crate::error::{Error, ErrorCode, Result};
use crate::format::StreamFormat;

/// Called after every period with the rendered bytes and
/// `(min_frames, max_frames, frames_written)`.
pub(crate) type PeriodHook = Box<dyn FnMut(&[u8], usize, usize, usize) + Send>;

/// What paces the periods.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Clock {
    /// One period per period duration of wall time.
    Realtime,
    /// One period per [`Driver::tick`].
    Manual,
}

enum Command {
    Tick(Option<Sender<()>>),
    Pause(bool),
    Clear,
    Stop,
}

/// Device-side buffer bookkeeping, in frames.
///
/// Before every period the render closure is asked for enough frames to cover the
/// next period (`min`) and at most what fits (`max`); then one period is played.
#[derive(Clone, Debug)]
pub(crate) struct PeriodModel {
    period_frames: usize,
    capacity_frames: usize,
    fill_frames: usize,
}

impl PeriodModel {
    pub(crate) fn new(period_frames: usize, capacity_frames: usize) -> Self {
        let period_frames = period_frames.max(1);
        Self {
            period_frames,
            capacity_frames: capacity_frames.max(period_frames),
            fill_frames: 0,
        }
    }

    #[inline]
    pub(crate) fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    /// `(min_frames, max_frames)` for the next render call.
    pub(crate) fn request(&self) -> (usize, usize) {
        (
            self.period_frames.saturating_sub(self.fill_frames),
            self.capacity_frames - self.fill_frames,
        )
    }

    pub(crate) fn commit(&mut self, frames: usize) {
        self.fill_frames = (self.fill_frames + frames).min(self.capacity_frames);
    }

    /// Plays one period. Returns `true` if there wasn't enough to play.
    pub(crate) fn play(&mut self) -> bool {
        let underflow = self.fill_frames < self.period_frames;
        self.fill_frames -= self.fill_frames.min(self.period_frames);
        underflow
    }

    pub(crate) fn clear(&mut self) {
        self.fill_frames = 0;
    }
}

/// Everything the thread needs, parked here while it isn't running.
struct Parked {
    render: RenderFn,
    hook: Option<PeriodHook>,
    model: PeriodModel,
}

struct Running {
    commands: Sender<Command>,
    handle: JoinHandle<Parked>,
}

#[derive(Default)]
struct DriverState {
    parked: Option<Parked>,
    running: Option<Running>,
    paused: bool,
}

pub(crate) struct DriverInner {
    name: String,
    clock: Clock,
    format: StreamFormat,
    events: EventSender,
    detached: AtomicBool,
    state: Mutex<DriverState>,
}

/// Handle to one stream's real-time thread. Cheap to clone; backends keep weak
/// references so they can halt every stream on disconnect.
#[derive(Clone)]
pub(crate) struct Driver {
    inner: Arc<DriverInner>,
}

impl Driver {
    pub(crate) fn new(
        name: impl Into<String>,
        clock: Clock,
        format: StreamFormat,
        model: PeriodModel,
        render: RenderFn,
        hook: Option<PeriodHook>,
        events: EventSender,
    ) -> Self {
        Self {
            inner: Arc::new(DriverInner {
                name: name.into(),
                clock,
                format,
                events,
                detached: AtomicBool::new(false),
                state: Mutex::new(DriverState {
                    parked: Some(Parked {
                        render,
                        hook,
                        model,
                    }),
                    ..Default::default()
                }),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<DriverInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<DriverInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn format(&self) -> &StreamFormat {
        &self.inner.format
    }

    pub(crate) fn is_running(&self) -> bool {
        self.inner.state.lock().running.is_some()
    }

    pub(crate) fn start(&self) -> Result<()> {
        if self.inner.detached.load(Ordering::Acquire) {
            return Err(Error::disconnected(format!(
                "stream '{}' belongs to a disconnected backend",
                self.inner.name
            )));
        }

        let mut state = self.inner.state.lock();
        if state.running.is_some() {
            return Ok(());
        }
        let parked = state.parked.take().ok_or_else(|| {
            Error::new(
                ErrorCode::StreamingError,
                format!("stream '{}' lost its render callback", self.inner.name),
            )
        })?;

        let (commands, rx) = bounded(16);
        let clock = self.inner.clock;
        let format = self.inner.format.clone();
        let events = self.inner.events.clone();
        let paused = state.paused;

        let handle = std::thread::Builder::new()
            .name(format!("soundout-{}", self.inner.name))
            .spawn(move || thread_main(parked, rx, clock, format, events, paused))
            .map_err(|e| {
                Error::new(
                    ErrorCode::SystemResourceExhausted,
                    format!("failed to spawn real-time thread: {e}"),
                )
            })?;

        state.running = Some(Running { commands, handle });
        tracing::debug!(stream = %self.inner.name, "real-time thread started");
        Ok(())
    }

    /// Stops the thread, waits for it and parks the render closure again.
    pub(crate) fn halt(&self) {
        let mut state = self.inner.state.lock();
        let Some(running) = state.running.take() else {
            return;
        };
        let _ = running.commands.send(Command::Stop);
        match running.handle.join() {
            Ok(parked) => state.parked = Some(parked),
            Err(_) => {
                tracing::error!(stream = %self.inner.name, "real-time thread panicked");
            }
        }
        tracing::debug!(stream = %self.inner.name, "real-time thread joined");
    }

    /// Halts for good; later `start` calls fail with `BackendDisconnected`.
    pub(crate) fn detach(&self) {
        self.inner.detached.store(true, Ordering::Release);
        self.halt();
        self.inner.events.send(BackendEvent::Disconnected);
    }

    pub(crate) fn pause(&self, paused: bool) {
        let mut state = self.inner.state.lock();
        state.paused = paused;
        if let Some(running) = &state.running {
            let _ = running.commands.send(Command::Pause(paused));
        }
    }

    pub(crate) fn clear(&self) {
        let mut state = self.inner.state.lock();
        if let Some(running) = &state.running {
            let _ = running.commands.send(Command::Clear);
        } else if let Some(parked) = state.parked.as_mut() {
            parked.model.clear();
        }
    }

    /// Runs one period. With `wait`, returns only once the period has been rendered.
    ///
    /// Does nothing unless the driver is running on a manual clock.
    pub(crate) fn tick(&self, wait: bool) {
        let (ack_tx, ack_rx) = bounded(1);
        {
            let state = self.inner.state.lock();
            let Some(running) = &state.running else {
                return;
            };
            let ack = if wait { Some(ack_tx) } else { None };
            if running.commands.send(Command::Tick(ack)).is_err() {
                return;
            }
        }
        if wait {
            let _ = ack_rx.recv();
        }
    }
}

fn thread_main(
    mut parked: Parked,
    commands: Receiver<Command>,
    clock: Clock,
    format: StreamFormat,
    events: EventSender,
    mut paused: bool,
) -> Parked {
    let bytes_per_frame = format.bytes_per_frame();
    let period = format.period_duration();
    let mut area = vec![0u8; parked.model.capacity_frames() * bytes_per_frame];
    let mut deadline = Instant::now() + period;

    loop {
        let command = match clock {
            Clock::Realtime => match commands.recv_deadline(deadline) {
                Ok(command) => Some(command),
                Err(RecvTimeoutError::Timeout) => {
                    deadline += period;
                    None
                }
                Err(RecvTimeoutError::Disconnected) => break,
            },
            Clock::Manual => match commands.recv() {
                Ok(command) => Some(command),
                Err(_) => break,
            },
        };

        let alive = match command {
            None => run_period(&mut parked, &mut area, bytes_per_frame, paused, &events),
            Some(Command::Tick(ack)) => {
                let alive = run_period(&mut parked, &mut area, bytes_per_frame, paused, &events);
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                alive
            }
            Some(Command::Pause(p)) => {
                paused = p;
                true
            }
            Some(Command::Clear) => {
                parked.model.clear();
                true
            }
            Some(Command::Stop) => break,
        };
        if !alive {
            break;
        }

        if matches!(clock, Clock::Realtime) && Instant::now() > deadline + period * 4 {
            // fell too far behind to catch up, resync instead of bursting
            deadline = Instant::now() + period;
        }
    }

    parked
}

/// Renders and plays one period. Returns `false` once the render closure has
/// panicked; the thread then stops rendering and waits to be joined.
fn run_period(
    parked: &mut Parked,
    area: &mut [u8],
    bytes_per_frame: usize,
    paused: bool,
    events: &EventSender,
) -> bool {
    if paused {
        parked.model.clear();
        return true;
    }

    let (min, max) = parked.model.request();
    let written = if max == 0 {
        0
    } else {
        let render = &mut parked.render;
        let out = &mut area[..max * bytes_per_frame];
        match catch_unwind(AssertUnwindSafe(|| render(out, min, max))) {
            Ok(written) => written.min(max),
            Err(_) => {
                events.send(BackendEvent::Error(ErrorCode::StreamingError));
                return false;
            }
        }
    };
    parked.model.commit(written);

    if let Some(hook) = parked.hook.as_mut() {
        hook(&area[..written * bytes_per_frame], min, max, written);
    }

    if parked.model.play() {
        events.send(BackendEvent::Underflow);
    }
    true
}

/// [`BackendStream`] on top of a [`Driver`].
pub(crate) struct DriverStream {
    driver: Driver,
}

impl DriverStream {
    pub(crate) fn new(driver: Driver) -> Self {
        Self { driver }
    }
}

impl BackendStream for DriverStream {
    fn format(&self) -> &StreamFormat {
        self.driver.format()
    }

    fn start(&mut self) -> Result<()> {
        self.driver.start()
    }

    fn pause(&mut self, paused: bool) -> Result<()> {
        self.driver.pause(paused);
        Ok(())
    }

    fn clear_buffer(&mut self) -> Result<()> {
        self.driver.clear();
        Ok(())
    }

    fn stop(&mut self) {
        self.driver.halt();
    }
}

impl Drop for DriverStream {
    fn drop(&mut self) {
        self.driver.halt();
    }
}

/// Frames covered by `latency` at `sample_rate`.
pub(crate) fn frames_for(latency: Duration, sample_rate: u32) -> usize {
    (latency.as_secs_f64() * f64::from(sample_rate)).round() as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ChannelLayout, SampleFormat};
    use std::sync::atomic::AtomicUsize;

    fn test_format() -> StreamFormat {
        StreamFormat {
            sample_format: SampleFormat::S16Le,
            sample_rate: 48000,
            layout: ChannelLayout::stereo(),
            period_frames: 64,
            software_latency: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_period_model_requests() {
        let mut model = PeriodModel::new(64, 256);
        assert_eq!(model.request(), (64, 256));

        model.commit(256);
        assert!(!model.play());
        assert_eq!(model.request(), (0, 64));

        model.commit(0);
        assert!(!model.play());
        assert!(!model.play());
        assert!(!model.play());
        assert!(model.play());
        assert_eq!(model.request(), (64, 256));
    }

    #[test]
    fn test_period_model_capacity_covers_a_period() {
        let model = PeriodModel::new(128, 16);
        assert_eq!(model.capacity_frames(), 128);
    }

    #[test]
    fn test_manual_driver_ticks_and_parks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let render: RenderFn = Box::new(move |area, min, _max| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            area.fill(1);
            min
        });
        let (events, _rx) = EventSender::bounded(8);
        let driver = Driver::new(
            "test",
            Clock::Manual,
            test_format(),
            PeriodModel::new(64, 128),
            render,
            None,
            events,
        );

        driver.tick(true);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        driver.start().unwrap();
        driver.tick(true);
        driver.tick(true);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        driver.halt();
        assert!(!driver.is_running());

        driver.start().unwrap();
        driver.tick(true);
        driver.halt();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_detached_driver_refuses_start() {
        let (events, rx) = EventSender::bounded(8);
        let driver = Driver::new(
            "test",
            Clock::Manual,
            test_format(),
            PeriodModel::new(64, 128),
            Box::new(|_, min, _| min),
            None,
            events,
        );
        driver.start().unwrap();
        driver.detach();

        assert_eq!(rx.try_recv(), Ok(BackendEvent::Disconnected));
        let err = driver.start().unwrap_err();
        assert_eq!(err.code(), ErrorCode::BackendDisconnected);
    }

    #[test]
    fn test_panicking_render_ends_the_thread() {
        let (events, rx) = EventSender::bounded(8);
        let driver = Driver::new(
            "panics",
            Clock::Manual,
            test_format(),
            PeriodModel::new(64, 128),
            Box::new(|_, _, _| -> usize { panic!("render failed") }),
            None,
            events,
        );
        driver.start().unwrap();
        driver.tick(true);
        assert_eq!(
            rx.try_recv(),
            Ok(BackendEvent::Error(ErrorCode::StreamingError))
        );

        // the thread is gone; further ticks return instead of hanging
        driver.tick(true);
        driver.halt();
        assert!(!driver.is_running());
    }

    #[test]
    fn test_realtime_driver_runs_periods() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let (events, _rx) = EventSender::bounded(64);
        let mut format = test_format();
        format.period_frames = 48; // 1ms
        let driver = Driver::new(
            "realtime",
            Clock::Realtime,
            format,
            PeriodModel::new(48, 96),
            Box::new(move |_, min, _| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                min
            }),
            None,
            events,
        );

        driver.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        driver.halt();

        let seen = calls.load(Ordering::SeqCst);
        assert!(seen > 5, "only {seen} periods in 50ms");
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(calls.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn test_frames_for() {
        assert_eq!(frames_for(Duration::from_millis(10), 48000), 480);
        assert_eq!(frames_for(Duration::ZERO, 44100), 0);
    }
}
