//! The process-wide automation session.
//!
//! `PhoneSession` owns the lifecycle status, the conversation history, the
//! screenshot poller and the single active task. Task runs are serialized:
//! a run started right after a reset waits for the cancelled one to reach
//! its checkpoint before touching the device.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adb::AdbDevice;
use crate::agent::{AgentModel, BackendFactory, DeviceControl, RunOutcome, StepExecutor};
use crate::config::{SessionConfig, SCREENSHOT_INTERVAL};
use crate::error::SessionError;
use crate::history::{ConversationHistory, Turn};
use crate::model::ModelClient;
use crate::screenshot::{ScreenshotFrame, ScreenshotPoller};
use crate::stream::{self, StepStream, StreamEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Uninitialized,
    Ready,
    Executing,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: SessionStatus,
    pub initialized: bool,
    pub step_count: usize,
}

/// Outcome of the blocking task form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub result: String,
    pub steps: usize,
    pub success: bool,
}

#[derive(Clone)]
struct Backends {
    model: Arc<dyn AgentModel>,
    device: Arc<dyn DeviceControl>,
}

struct TaskTicket {
    epoch: u64,
    step_count: Arc<AtomicUsize>,
    backends: Backends,
    max_steps: usize,
}

/// Lifecycle state. Every transition bumps `epoch` except task
/// start/finish, so a stale run can never flip a newer session's status.
struct SessionState {
    status: SessionStatus,
    config: Option<SessionConfig>,
    backends: Option<Backends>,
    step_count: Arc<AtomicUsize>,
    epoch: u64,
}

impl SessionState {
    fn new() -> Self {
        Self {
            status: SessionStatus::Uninitialized,
            config: None,
            backends: None,
            step_count: Arc::new(AtomicUsize::new(0)),
            epoch: 0,
        }
    }

    fn initialized(&mut self, config: SessionConfig, backends: Backends) {
        self.status = SessionStatus::Ready;
        self.config = Some(config);
        self.backends = Some(backends);
        self.step_count = Arc::new(AtomicUsize::new(0));
        self.epoch += 1;
    }

    fn failed(&mut self) {
        self.status = SessionStatus::Failed;
        self.config = None;
        self.backends = None;
        self.step_count = Arc::new(AtomicUsize::new(0));
        self.epoch += 1;
    }

    fn begin_task(&mut self) -> Result<TaskTicket, SessionError> {
        match self.status {
            SessionStatus::Ready => {}
            SessionStatus::Executing => return Err(SessionError::Busy),
            SessionStatus::Uninitialized | SessionStatus::Failed => {
                return Err(SessionError::NotInitialized)
            }
        }
        let (Some(backends), Some(config)) = (self.backends.clone(), self.config.as_ref()) else {
            return Err(SessionError::NotInitialized);
        };
        self.status = SessionStatus::Executing;
        self.step_count.store(0, Ordering::SeqCst);
        Ok(TaskTicket {
            epoch: self.epoch,
            step_count: self.step_count.clone(),
            backends,
            max_steps: config.max_steps,
        })
    }

    fn finish_task(&mut self, epoch: u64) {
        if self.epoch == epoch && self.status == SessionStatus::Executing {
            self.status = SessionStatus::Ready;
        }
    }

    fn reset(&mut self) {
        self.status = if self.config.is_some() {
            SessionStatus::Ready
        } else {
            SessionStatus::Uninitialized
        };
        self.step_count = Arc::new(AtomicUsize::new(0));
        self.epoch += 1;
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            status: self.status,
            initialized: self.config.is_some(),
            step_count: self.step_count.load(Ordering::SeqCst),
        }
    }
}

struct Inner {
    factory: Arc<dyn BackendFactory>,
    state: Mutex<SessionState>,
    history: Arc<Mutex<ConversationHistory>>,
    poller: Arc<ScreenshotPoller>,
    active: Mutex<Option<CancellationToken>>,
    run_lock: Arc<tokio::sync::Mutex<()>>,
}

#[derive(Clone)]
pub struct PhoneSession {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PhoneSession {
    pub fn new(factory: Arc<dyn BackendFactory>) -> Self {
        Self::with_poller(factory, Arc::new(ScreenshotPoller::default()))
    }

    pub fn with_poller(factory: Arc<dyn BackendFactory>, poller: Arc<ScreenshotPoller>) -> Self {
        // Screenshots work before init, against the default device.
        match factory.device(None) {
            Ok(device) => poller.attach(device),
            Err(err) => warn!("default device unavailable: {}", err),
        }
        Self {
            inner: Arc::new(Inner {
                factory,
                state: Mutex::new(SessionState::new()),
                history: Arc::new(Mutex::new(ConversationHistory::new())),
                poller,
                active: Mutex::new(None),
                run_lock: Arc::new(tokio::sync::Mutex::new(())),
            }),
        }
    }

    pub fn poller(&self) -> Arc<ScreenshotPoller> {
        self.inner.poller.clone()
    }

    pub fn spawn_screenshot_loop(&self) -> JoinHandle<()> {
        self.inner.poller.clone().spawn(SCREENSHOT_INTERVAL)
    }

    /// Replaces any previous session. A config error leaves the current
    /// state untouched; a backend that cannot be built leaves it `Failed`.
    pub fn initialize(&self, config: SessionConfig) -> Result<(), SessionError> {
        config.validate()?;
        let built = self.inner.factory.model(&config).and_then(|model| {
            let device = self.inner.factory.device(config.device_id.as_deref())?;
            Ok(Backends { model, device })
        });

        self.cancel_active();
        lock(&self.inner.history).clear();
        let backends = match built {
            Ok(b) => b,
            Err(err) => {
                warn!(model = %config.model_name, "backend construction failed: {}", err);
                lock(&self.inner.state).failed();
                return Err(match err {
                    SessionError::BackendUnavailable(_) => err,
                    other => SessionError::BackendUnavailable(other.to_string()),
                });
            }
        };

        self.inner.poller.attach(backends.device.clone());
        info!(
            base_url = %config.base_url,
            model = %config.model_name,
            device = ?config.device_id,
            max_steps = config.max_steps,
            "session initialized"
        );
        lock(&self.inner.state).initialized(config, backends);
        Ok(())
    }

    pub fn status(&self) -> StatusSnapshot {
        lock(&self.inner.state).snapshot()
    }

    pub fn history(&self) -> Vec<Turn> {
        lock(&self.inner.history).turns().to_vec()
    }

    /// Starts a task and returns its event stream. Delivered events are
    /// folded into the history turn opened for this task.
    pub fn open_stream(&self, message: &str) -> Result<StepStream, SessionError> {
        let task = message.trim().to_string();
        if task.is_empty() {
            return Err(SessionError::Config("message must not be empty".into()));
        }
        let ticket = lock(&self.inner.state).begin_task()?;

        // The previous run has already ended; its stream may still be
        // draining buffered events, so its token is left alone.
        let cancel = CancellationToken::new();
        *lock(&self.inner.active) = Some(cancel.clone());

        let turn_id = {
            let mut history = lock(&self.inner.history);
            history.push_user(task.clone());
            history.open_agent_turn()
        };
        let history = self.inner.history.clone();
        let observer_turn = turn_id.clone();
        let (mut sink, stream) = stream::channel(cancel.clone());
        let stream = stream.with_observer(Box::new(move |event: &StreamEvent| {
            if let Err(err) = lock(&history).apply(&observer_turn, event) {
                warn!(turn = %observer_turn, "history update rejected: {}", err);
            }
        }));

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _run = inner.run_lock.clone().lock_owned().await;
            let executor = StepExecutor::new(
                ticket.backends.model.clone(),
                ticket.backends.device.clone(),
                ticket.max_steps,
            );
            let outcome = executor.run(&task, &mut sink, &cancel, &ticket.step_count).await;
            lock(&inner.state).finish_task(ticket.epoch);
            match outcome {
                RunOutcome::Completed { steps, success, .. } => {
                    info!(turn = %turn_id, steps, success, "task finished")
                }
                RunOutcome::Failed { message } => warn!(turn = %turn_id, "task failed: {}", message),
                RunOutcome::Cancelled { steps } => info!(turn = %turn_id, steps, "task cancelled"),
            }
        });

        Ok(stream)
    }

    /// Blocking form of `open_stream`: drains the stream to its terminal event.
    pub async fn run_task(&self, message: &str) -> Result<ChatResponse, SessionError> {
        let mut stream = self.open_stream(message)?;
        let mut delivered = 0;
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Step { .. } => delivered += 1,
                StreamEvent::Done { message, steps, success } => {
                    return Ok(ChatResponse { result: message, steps, success })
                }
                StreamEvent::Error { message } => {
                    return Ok(ChatResponse { result: message, steps: delivered, success: false })
                }
            }
        }
        Err(SessionError::StreamAborted)
    }

    pub async fn screenshot(&self, device_id: Option<&str>) -> Result<ScreenshotFrame, SessionError> {
        let poller = &self.inner.poller;
        if let Some(id) = device_id.filter(|id| !id.trim().is_empty()) {
            if poller.device_id().as_deref() != Some(id) {
                let device = self.inner.factory.device(Some(id))?;
                poller.attach(device);
                poller.poll_once().await;
            }
        }
        poller.latest()
    }

    /// Cancels any in-flight task and clears the conversation.
    pub fn reset(&self) {
        self.cancel_active();
        lock(&self.inner.history).clear();
        let mut state = lock(&self.inner.state);
        state.reset();
        info!(status = ?state.status, "session reset");
    }

    fn cancel_active(&self) {
        if let Some(token) = lock(&self.inner.active).take() {
            token.cancel();
        }
    }
}

/// Builds real collaborators: an HTTP model client and an ADB device.
pub struct LiveBackends {
    adb_path: String,
    default_device: Option<String>,
}

impl LiveBackends {
    pub fn new(adb_path: impl Into<String>, default_device: Option<String>) -> Self {
        Self { adb_path: adb_path.into(), default_device }
    }
}

impl BackendFactory for LiveBackends {
    fn model(&self, cfg: &SessionConfig) -> Result<Arc<dyn AgentModel>, SessionError> {
        let client = ModelClient::new(cfg).map_err(|e| SessionError::BackendUnavailable(e.to_string()))?;
        Ok(Arc::new(client))
    }

    fn device(&self, device_id: Option<&str>) -> Result<Arc<dyn DeviceControl>, SessionError> {
        let serial = device_id.map(str::to_string).or_else(|| self.default_device.clone());
        Ok(Arc::new(AdbDevice::new(self.adb_path.clone(), serial)))
    }
}
