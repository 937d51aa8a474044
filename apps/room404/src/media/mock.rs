//! Capture devices for driving the controller without hardware.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{CaptureDevice, LocalMedia, MediaError, SampleTrackDevice};

/// Always refuses, like a user dismissing the permission prompt.
#[derive(Debug, Default, Clone)]
pub struct DeniedDevice {
    opens: Arc<AtomicUsize>,
}

impl DeniedDevice {
    /// How many times the prompt was shown.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureDevice for DeniedDevice {
    async fn open(&self) -> Result<LocalMedia, MediaError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Err(MediaError::PermissionDenied)
    }
}

/// Holds every `open()` until the paired [`DeviceGate`] is opened.
pub struct GatedDevice {
    notify: Arc<Notify>,
    opens: Arc<AtomicUsize>,
    inner: SampleTrackDevice,
}

#[derive(Clone)]
pub struct DeviceGate {
    notify: Arc<Notify>,
}

impl DeviceGate {
    /// Lets one pending or future `open()` through.
    pub fn open(&self) {
        self.notify.notify_one();
    }
}

impl GatedDevice {
    pub fn new() -> (Self, DeviceGate) {
        let notify = Arc::new(Notify::new());
        let device = Self {
            notify: Arc::clone(&notify),
            opens: Arc::new(AtomicUsize::new(0)),
            inner: SampleTrackDevice::default(),
        };
        (device, DeviceGate { notify })
    }

    pub fn opens(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.opens)
    }
}

#[async_trait]
impl CaptureDevice for GatedDevice {
    async fn open(&self) -> Result<LocalMedia, MediaError> {
        self.notify.notified().await;
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.open().await
    }
}
