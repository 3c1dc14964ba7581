//! The top-level audio context: one backend connection and its device list.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{Backend, BackendStream, EventSender, RenderFn, StreamRequest};
use crate::config::ContextConfig;
use crate::device::{Device, DeviceInfo};
use crate::error::{Error, ErrorCode, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextState {
    Created,
    Connected,
    Disconnected,
    Destroyed,
}

struct Inner {
    backend: Option<Box<dyn Backend>>,
    state: ContextState,
    /// Bumped on every successful connect; devices and streams from an older
    /// connection are refused.
    generation: u64,
}

/// State shared by a context and every device and stream derived from it.
pub(crate) struct ContextShared {
    inner: Mutex<Inner>,
    handles: AtomicUsize,
}

impl ContextShared {
    pub(crate) fn state(&self) -> ContextState {
        self.inner.lock().state
    }

    /// `true` while the connection `generation` came from is still up.
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        let inner = self.inner.lock();
        inner.state == ContextState::Connected && inner.generation == generation
    }

    /// Opens a stream through the backend, if `generation` is still connected.
    pub(crate) fn open_output(
        &self,
        generation: u64,
        device: &DeviceInfo,
        request: &StreamRequest,
        render: RenderFn,
        events: EventSender,
    ) -> Result<Box<dyn BackendStream>> {
        let mut inner = self.inner.lock();
        if inner.state != ContextState::Connected || inner.generation != generation {
            return Err(Error::disconnected(format!(
                "device '{}' belongs to a connection that is gone",
                device.id
            )));
        }
        let backend = inner
            .backend
            .as_mut()
            .ok_or_else(|| Error::disconnected("no backend selected"))?;
        backend.open_output(device, request, render, events)
    }
}

/// Counts one live device or stream handle against its context.
pub(crate) struct HandleLease {
    context: Arc<ContextShared>,
}

impl HandleLease {
    pub(crate) fn new(context: Arc<ContextShared>) -> Self {
        context.handles.fetch_add(1, Ordering::SeqCst);
        Self { context }
    }

    pub(crate) fn context(&self) -> &Arc<ContextShared> {
        &self.context
    }
}

impl Clone for HandleLease {
    fn clone(&self) -> Self {
        Self::new(self.context.clone())
    }
}

impl Drop for HandleLease {
    fn drop(&mut self) {
        self.context.handles.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Owns the connection to one audio backend.
///
/// # Example
///
/// ```no_run
/// use soundout::AudioContext;
///
/// let mut ctx = AudioContext::create()?;
/// ctx.connect()?;
/// let index = ctx.default_output_device_index()?;
/// let device = ctx.output_device(index)?;
/// println!("default output: {}", device.name());
/// device.release();
/// ctx.destroy()?;
/// # Ok::<(), soundout::Error>(())
/// ```
pub struct AudioContext {
    config: ContextConfig,
    shared: Arc<ContextShared>,
    devices: Vec<Device>,
    default_index: Option<usize>,
}

impl AudioContext {
    /// A context that will pick a backend from the default list on `connect`.
    pub fn create() -> Result<Self> {
        Self::with_config(ContextConfig::default())
    }

    pub fn with_config(config: ContextConfig) -> Result<Self> {
        Ok(Self::build(config, None))
    }

    /// A context bound to `backend` instead of the configured list.
    pub fn with_backend<B: Backend + 'static>(backend: B) -> Result<Self> {
        Ok(Self::build(ContextConfig::default(), Some(Box::new(backend))))
    }

    fn build(config: ContextConfig, backend: Option<Box<dyn Backend>>) -> Self {
        Self {
            config,
            shared: Arc::new(ContextShared {
                inner: Mutex::new(Inner {
                    backend,
                    state: ContextState::Created,
                    generation: 0,
                }),
                handles: AtomicUsize::new(0),
            }),
            devices: Vec::new(),
            default_index: None,
        }
    }

    pub fn state(&self) -> ContextState {
        self.shared.state()
    }

    /// Name of the selected backend, once there is one.
    pub fn backend_name(&self) -> Option<&'static str> {
        self.shared.inner.lock().backend.as_ref().map(|b| b.name())
    }

    /// Connects to a backend and takes the first device snapshot.
    pub fn connect(&mut self) -> Result<()> {
        {
            let mut inner = self.shared.inner.lock();
            if inner.state == ContextState::Connected {
                return Err(Error::invalid("context is already connected"));
            }

            match inner.backend.as_mut() {
                Some(backend) => backend.connect()?,
                None => inner.backend = Some(self.select_backend()?),
            }

            inner.state = ContextState::Connected;
            inner.generation += 1;
            if let Some(backend) = inner.backend.as_ref() {
                tracing::info!(backend = backend.name(), "audio context connected");
            }
        }
        self.flush_events()
    }

    fn select_backend(&self) -> Result<Box<dyn Backend>> {
        let mut last_err = Error::new(ErrorCode::BackendUnavailable, "no backends configured");
        for kind in &self.config.backends {
            let mut backend = match kind.instantiate(&self.config.app_name) {
                Ok(backend) => backend,
                Err(e) => {
                    tracing::warn!(?kind, error = %e, "backend unavailable");
                    last_err = e;
                    continue;
                }
            };
            match backend.connect() {
                Ok(()) => return Ok(backend),
                Err(e) => {
                    tracing::warn!(backend = backend.name(), error = %e, "backend failed to connect");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Releases the backend connection, halting every stream it drives first.
    /// Does nothing unless connected.
    pub fn disconnect(&mut self) {
        {
            let mut inner = self.shared.inner.lock();
            if inner.state != ContextState::Connected {
                return;
            }
            if let Some(backend) = inner.backend.as_mut() {
                backend.disconnect();
            }
            inner.state = ContextState::Disconnected;
        }
        self.devices.clear();
        self.default_index = None;
        tracing::info!("audio context disconnected");
    }

    /// Re-reads the device list from the backend.
    pub fn flush_events(&mut self) -> Result<()> {
        let (raw, default_index, generation) = {
            let mut inner = self.shared.inner.lock();
            if inner.state != ContextState::Connected {
                return Err(Error::disconnected("context is not connected"));
            }
            let generation = inner.generation;
            let backend = inner
                .backend
                .as_mut()
                .ok_or_else(|| Error::disconnected("no backend selected"))?;
            (backend.output_devices()?, backend.default_output_device(), generation)
        };

        let devices: Vec<Device> = raw
            .into_iter()
            .map(|d| {
                Device::new(
                    d.info,
                    d.handle,
                    HandleLease::new(self.shared.clone()),
                    generation,
                )
            })
            .collect();
        self.default_index = default_index.filter(|&i| i < devices.len());
        tracing::debug!(count = devices.len(), default = ?self.default_index, "output devices refreshed");
        self.devices = devices;
        Ok(())
    }

    /// Refreshes and returns the output devices.
    pub fn list_output_devices(&mut self) -> Result<Vec<Device>> {
        self.flush_events()?;
        Ok(self.devices.clone())
    }

    /// Number of devices in the current snapshot.
    pub fn output_device_count(&self) -> Result<usize> {
        self.ensure_connected()?;
        Ok(self.devices.len())
    }

    /// A device from the current snapshot.
    pub fn output_device(&self, index: usize) -> Result<Device> {
        self.ensure_connected()?;
        self.devices.get(index).cloned().ok_or_else(|| {
            Error::new(
                ErrorCode::DeviceNotFound,
                format!("no output device at index {index} ({} known)", self.devices.len()),
            )
        })
    }

    pub fn default_output_device_index(&self) -> Result<usize> {
        self.ensure_connected()?;
        self.default_index
            .ok_or_else(|| Error::new(ErrorCode::DeviceNotFound, "no default output device"))
    }

    pub fn default_output_device(&self) -> Result<Device> {
        self.output_device(self.default_output_device_index()?)
    }

    /// Devices and streams from this context that are still alive outside of it.
    pub fn outstanding_handles(&self) -> usize {
        self.shared
            .handles
            .load(Ordering::SeqCst)
            .saturating_sub(self.devices.len())
    }

    /// Disconnects and releases the context.
    ///
    /// Every device and stream obtained from it should be released first. If some
    /// are still alive this returns `InvalidArgument`; the backend stays alive until
    /// they go, so nothing dangles, but they can no longer open or start streams.
    pub fn destroy(mut self) -> Result<()> {
        let outstanding = self.outstanding_handles();
        self.teardown();
        if outstanding > 0 {
            tracing::warn!(outstanding, "audio context destroyed with live handles");
            return Err(Error::invalid(format!(
                "{outstanding} device or stream handles outlive the context"
            )));
        }
        Ok(())
    }

    fn teardown(&mut self) {
        if self.state() == ContextState::Destroyed {
            return;
        }
        self.disconnect();
        self.devices.clear();
        self.shared.inner.lock().state = ContextState::Destroyed;
        tracing::debug!("audio context destroyed");
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.state() != ContextState::Connected {
            return Err(Error::disconnected("context is not connected"));
        }
        Ok(())
    }
}

impl Drop for AudioContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DummyBackend, FakeBackend};

    fn fake_with_two() -> FakeBackend {
        FakeBackend::new(vec![
            FakeBackend::stereo_device("a", "Device A"),
            FakeBackend::stereo_device("b", "Device B"),
        ])
    }

    #[test]
    fn test_context_lifecycle() {
        let fake = fake_with_two();
        let mut ctx = AudioContext::with_backend(fake.clone()).unwrap();
        assert_eq!(ctx.state(), ContextState::Created);

        ctx.connect().unwrap();
        assert_eq!(ctx.state(), ContextState::Connected);
        assert_eq!(ctx.backend_name(), Some("fake"));

        ctx.disconnect();
        assert_eq!(ctx.state(), ContextState::Disconnected);
        ctx.disconnect();
        assert_eq!(ctx.state(), ContextState::Disconnected);
        assert!(!fake.is_connected());

        ctx.connect().unwrap();
        ctx.destroy().unwrap();
        assert_eq!(fake.live_handles(), 0);
    }

    #[test]
    fn test_connect_twice_is_rejected() {
        let mut ctx = AudioContext::with_backend(fake_with_two()).unwrap();
        ctx.connect().unwrap();
        assert_eq!(
            ctx.connect().unwrap_err().code(),
            ErrorCode::InvalidArgument
        );
    }

    #[test]
    fn test_connect_failure_is_reported() {
        let fake = fake_with_two();
        fake.fail_next_connect(ErrorCode::BackendInitFailed);
        let mut ctx = AudioContext::with_backend(fake).unwrap();
        assert_eq!(
            ctx.connect().unwrap_err().code(),
            ErrorCode::BackendInitFailed
        );
        assert_eq!(ctx.state(), ContextState::Created);
    }

    #[test]
    fn test_default_config_falls_back_to_dummy() {
        let config = ContextConfig::default().with_backends(vec![crate::BackendKind::Dummy]);
        let mut ctx = AudioContext::with_config(config).unwrap();
        ctx.connect().unwrap();
        assert_eq!(ctx.backend_name(), Some("dummy"));
        assert_eq!(ctx.output_device_count().unwrap(), 1);
    }

    #[test]
    fn test_empty_backend_list() {
        let config = ContextConfig::default().with_backends(Vec::new());
        let mut ctx = AudioContext::with_config(config).unwrap();
        assert_eq!(
            ctx.connect().unwrap_err().code(),
            ErrorCode::BackendUnavailable
        );
    }

    #[test]
    fn test_device_access_requires_connection() {
        let ctx = AudioContext::with_backend(DummyBackend::default()).unwrap();
        assert_eq!(
            ctx.output_device(0).unwrap_err().code(),
            ErrorCode::BackendDisconnected
        );
        assert_eq!(
            ctx.default_output_device_index().unwrap_err().code(),
            ErrorCode::BackendDisconnected
        );
    }

    #[test]
    fn test_list_and_index() {
        let mut ctx = AudioContext::with_backend(fake_with_two()).unwrap();
        ctx.connect().unwrap();

        let devices = ctx.list_output_devices().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].name(), "Device B");
        assert_eq!(ctx.default_output_device_index().unwrap(), 0);
        assert_eq!(ctx.output_device(1).unwrap().id(), "b");
        assert_eq!(
            ctx.output_device(2).unwrap_err().code(),
            ErrorCode::DeviceNotFound
        );
    }

    #[test]
    fn test_no_default_device() {
        let mut ctx = AudioContext::with_backend(FakeBackend::new(Vec::new())).unwrap();
        ctx.connect().unwrap();
        assert!(ctx.list_output_devices().unwrap().is_empty());
        assert_eq!(
            ctx.default_output_device_index().unwrap_err().code(),
            ErrorCode::DeviceNotFound
        );
    }

    #[test]
    fn test_snapshot_is_not_live() {
        let fake = fake_with_two();
        let mut ctx = AudioContext::with_backend(fake.clone()).unwrap();
        ctx.connect().unwrap();

        fake.add_device(FakeBackend::stereo_device("c", "Device C"));
        assert_eq!(ctx.output_device_count().unwrap(), 2);
        assert_eq!(ctx.list_output_devices().unwrap().len(), 3);
    }

    #[test]
    fn test_outstanding_handles() {
        let fake = fake_with_two();
        let mut ctx = AudioContext::with_backend(fake.clone()).unwrap();
        ctx.connect().unwrap();
        assert_eq!(ctx.outstanding_handles(), 0);

        let a = ctx.output_device(0).unwrap();
        let a2 = a.clone();
        assert_eq!(ctx.outstanding_handles(), 2);

        a.release();
        a2.release();
        assert_eq!(ctx.outstanding_handles(), 0);
    }

    #[test]
    fn test_destroy_with_live_device_is_detected() {
        let fake = fake_with_two();
        let mut ctx = AudioContext::with_backend(fake.clone()).unwrap();
        ctx.connect().unwrap();
        let leaked = ctx.output_device(1).unwrap();

        let err = ctx.destroy().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        assert_eq!(fake.live_handles(), 1);

        drop(leaked);
        assert_eq!(fake.live_handles(), 0);
    }
}
