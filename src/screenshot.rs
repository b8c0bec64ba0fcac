//! Best-effort device frame feed, independent of task execution.
//!
//! At most one capture is in flight; a poll that finds one outstanding
//! returns immediately instead of queueing.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::agent::{DeviceControl, RawFrame};
use crate::error::SessionError;

#[derive(Clone, Debug, PartialEq)]
pub struct ScreenshotFrame {
    pub captured_at: DateTime<Utc>,
    pub image: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub is_sensitive: bool,
    pub error: Option<String>,
}

pub trait SensitivityClassifier: Send + Sync {
    fn is_sensitive(&self, frame: &RawFrame) -> bool;
}

/// Flags frames the device refused to capture.
#[derive(Clone, Copy, Default)]
pub struct SecureWindowClassifier;

impl SensitivityClassifier for SecureWindowClassifier {
    fn is_sensitive(&self, frame: &RawFrame) -> bool {
        frame.secure || frame.png.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PollOutcome {
    Updated,
    Skipped,
    NoDevice,
    Failed(String),
}

pub struct ScreenshotPoller {
    device: RwLock<Option<Arc<dyn DeviceControl>>>,
    latest: RwLock<Option<ScreenshotFrame>>,
    busy: AtomicBool,
    generation: AtomicU64,
    classifier: Box<dyn SensitivityClassifier>,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for ScreenshotPoller {
    fn default() -> Self {
        Self::new(Box::new(SecureWindowClassifier))
    }
}

impl ScreenshotPoller {
    pub fn new(classifier: Box<dyn SensitivityClassifier>) -> Self {
        Self {
            device: RwLock::new(None),
            latest: RwLock::new(None),
            busy: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            classifier,
        }
    }

    /// Points the poller at `device`. Frames from a different device are
    /// dropped, including any capture still in flight. Re-attaching the same
    /// device keeps the current frame.
    pub fn attach(&self, device: Arc<dyn DeviceControl>) {
        let current = self.device_id();
        let same_device = current.is_some() && current == device.device_id();
        if let Ok(mut slot) = self.device.write() {
            *slot = Some(device);
        }
        if same_device {
            return;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut latest) = self.latest.write() {
            *latest = None;
        }
    }

    pub fn device_id(&self) -> Option<String> {
        self.device
            .read()
            .ok()
            .and_then(|d| d.as_ref().and_then(|d| d.device_id()))
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub async fn poll_once(&self) -> PollOutcome {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("screenshot poll skipped, capture in flight");
            return PollOutcome::Skipped;
        }
        let _guard = BusyGuard(&self.busy);

        let device = match self.device.read().ok().and_then(|d| d.clone()) {
            Some(d) => d,
            None => return PollOutcome::NoDevice,
        };
        let generation = self.generation.load(Ordering::SeqCst);
        let result = device.capture().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            return PollOutcome::Skipped;
        }

        let Ok(mut latest) = self.latest.write() else {
            return PollOutcome::Failed("frame store poisoned".into());
        };
        match result {
            Ok(raw) => {
                let is_sensitive = self.classifier.is_sensitive(&raw);
                *latest = Some(ScreenshotFrame {
                    captured_at: Utc::now(),
                    image: raw.png,
                    width: raw.width,
                    height: raw.height,
                    is_sensitive,
                    error: None,
                });
                PollOutcome::Updated
            }
            Err(err) => {
                let message = err.to_string();
                warn!("screenshot capture failed: {}", message);
                // Keep showing the last good image, tagged with the failure.
                if let Some(frame) = latest.as_mut() {
                    frame.error = Some(message.clone());
                }
                PollOutcome::Failed(message)
            }
        }
    }

    pub fn latest(&self) -> Result<ScreenshotFrame, SessionError> {
        self.latest
            .read()
            .ok()
            .and_then(|f| f.clone())
            .ok_or(SessionError::ScreenshotUnavailable)
    }

    /// Polls every `period` on its own task; ticks that find a capture in
    /// flight are dropped.
    pub fn spawn(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let poller = self.clone();
                tokio::spawn(async move {
                    poller.poll_once().await;
                });
            }
        })
    }
}
