use async_trait::async_trait;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::history::StepRecord;
use crate::stream::{EventSink, StreamEvent};

// ========================= Core Types =========================

/// One device operation chosen by the model. Coordinates are relative,
/// on a 0..=999 grid in both axes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    OpenApp { name: String },
    Tap { x: i32, y: i32 },
    DoubleTap { x: i32, y: i32 },
    LongPress { x: i32, y: i32 },
    Swipe { from: [i32; 2], to: [i32; 2] },
    Type { text: String },
    Back,
    Home,
    Wait { seconds: f64 },
    TakeOver { message: String },
    Finish { message: String },
    Unknown { raw: String },
}

impl Action {
    /// Actions that end the task without touching the device.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::Finish { .. })
    }
}

/// Raw capture as returned by the device bridge.
#[derive(Clone, Debug, Default)]
pub struct RawFrame {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// The device refused the capture (secure window, payment screen).
    pub secure: bool,
}

#[derive(Clone, Debug)]
pub struct DecisionRequest<'a> {
    pub task: &'a str,
    pub frame: &'a RawFrame,
    pub current_app: Option<&'a str>,
    pub steps: &'a [StepRecord],
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub thinking: String,
    pub action: Action,
    pub finished: bool,
    pub message: Option<String>,
}

// ========================= Collaborators =========================

#[async_trait]
pub trait AgentModel: Send + Sync {
    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, SessionError>;
}

/// Device bridge. Implementations serialize physical gestures themselves;
/// `capture` may run concurrently with `perform`.
#[async_trait]
pub trait DeviceControl: Send + Sync {
    fn device_id(&self) -> Option<String>;
    async fn capture(&self) -> Result<RawFrame, SessionError>;
    async fn current_app(&self) -> Result<String, SessionError>;
    async fn perform(&self, action: &Action, width: u32, height: u32) -> Result<(), SessionError>;
}

pub trait BackendFactory: Send + Sync {
    fn model(&self, cfg: &SessionConfig) -> Result<Arc<dyn AgentModel>, SessionError>;
    fn device(&self, device_id: Option<&str>) -> Result<Arc<dyn DeviceControl>, SessionError>;
}

// ========================= Step Executor =========================

#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    Completed { message: String, steps: usize, success: bool },
    Failed { message: String },
    Cancelled { steps: usize },
}

pub struct StepExecutor {
    model: Arc<dyn AgentModel>,
    device: Arc<dyn DeviceControl>,
    max_steps: usize,
}

impl StepExecutor {
    pub fn new(model: Arc<dyn AgentModel>, device: Arc<dyn DeviceControl>, max_steps: usize) -> Self {
        Self { model, device, max_steps }
    }

    /// Drives one task. Emits one `Step` per model decision and, unless
    /// cancelled, exactly one terminal event.
    pub async fn run(
        &self,
        task: &str,
        sink: &mut EventSink,
        cancel: &CancellationToken,
        step_count: &AtomicUsize,
    ) -> RunOutcome {
        let run_id = nanoid!();
        let start = Instant::now();
        let mut steps: Vec<StepRecord> = Vec::new();
        step_count.store(0, Ordering::SeqCst);
        info!(run_id = %run_id, task = %task, max_steps = self.max_steps, "task started");

        for _ in 0..self.max_steps {
            // Only checkpoint: an in-flight gesture is never interrupted.
            if cancel.is_cancelled() {
                info!(run_id = %run_id, steps = steps.len(), "task cancelled");
                return RunOutcome::Cancelled { steps: steps.len() };
            }

            let (decision, screen) = match self.next_decision(task, &steps).await {
                Ok(d) => d,
                Err(err) => return self.fail(&run_id, sink, err),
            };
            let index = step_count.fetch_add(1, Ordering::SeqCst) + 1;
            info!(run_id = %run_id, step = index, action = ?decision.action, finished = decision.finished, "agent step");

            let success = if decision.action.is_terminal() {
                true
            } else {
                match self.device.perform(&decision.action, screen.0, screen.1).await {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(run_id = %run_id, step = index, "action failed: {}", err);
                        false
                    }
                }
            };

            let record = StepRecord {
                index,
                thinking: decision.thinking.clone(),
                action: decision.action.clone(),
                step_success: success,
            };
            sink.emit(StreamEvent::step(&record, decision.finished));
            steps.push(record);

            if decision.finished {
                let message = decision
                    .message
                    .or_else(|| match &decision.action {
                        Action::Finish { message } if !message.is_empty() => Some(message.clone()),
                        _ => None,
                    })
                    .unwrap_or_else(|| "Task completed".to_string());
                info!(run_id = %run_id, steps = index, elapsed_ms = start.elapsed().as_millis() as u64, "task completed");
                sink.emit(StreamEvent::Done { message: message.clone(), steps: index, success: true });
                return RunOutcome::Completed { message, steps: index, success: true };
            }
        }

        let total = steps.len();
        info!(run_id = %run_id, steps = total, "step budget exhausted");
        let message = "Max steps reached".to_string();
        sink.emit(StreamEvent::Done { message: message.clone(), steps: total, success: false });
        RunOutcome::Completed { message, steps: total, success: false }
    }

    async fn next_decision(
        &self,
        task: &str,
        steps: &[StepRecord],
    ) -> Result<(Decision, (u32, u32)), SessionError> {
        let frame = self.device.capture().await?;
        let current_app = match self.device.current_app().await {
            Ok(app) => Some(app),
            Err(err) => {
                warn!("current app lookup failed: {}", err);
                None
            }
        };
        let decision = self
            .model
            .decide(DecisionRequest {
                task,
                frame: &frame,
                current_app: current_app.as_deref(),
                steps,
            })
            .await?;
        // A refused capture still carries the last known screen size.
        Ok((decision, (frame.width, frame.height)))
    }

    fn fail(&self, run_id: &str, sink: &mut EventSink, err: SessionError) -> RunOutcome {
        warn!(run_id = %run_id, "task failed: {}", err);
        let message = err.user_message();
        sink.emit(StreamEvent::Error { message: message.clone() });
        RunOutcome::Failed { message }
    }
}
