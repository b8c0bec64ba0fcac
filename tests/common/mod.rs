#![allow(dead_code)]

use async_trait::async_trait;
use phone_hands::agent::{Action, AgentModel, BackendFactory, Decision, DecisionRequest, DeviceControl, RawFrame};
use phone_hands::config::SessionConfig;
use phone_hands::session::{PhoneSession, SessionStatus};
use phone_hands::SessionError;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub enum Scripted {
    Decide(Decision),
    Fail(SessionError),
    /// Blocks until the gate is notified, then decides.
    Gated(Arc<Notify>, Decision),
}

#[derive(Default)]
pub struct ScriptedModel {
    script: Mutex<VecDeque<Scripted>>,
    pub calls: AtomicUsize,
    pub seen_steps: Mutex<Vec<usize>>,
}

impl ScriptedModel {
    pub fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self { script: Mutex::new(script.into()), ..Default::default() })
    }
}

#[async_trait]
impl AgentModel for ScriptedModel {
    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, SessionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_steps.lock().unwrap().push(request.steps.len());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Decide(d)) => Ok(d),
            Some(Scripted::Fail(e)) => Err(e),
            Some(Scripted::Gated(gate, d)) => {
                gate.notified().await;
                Ok(d)
            }
            None => Err(SessionError::ModelFailure("script exhausted".into())),
        }
    }
}

pub struct FakeDevice {
    id: Option<String>,
    /// 1-based `perform` calls that fail.
    failing: HashSet<usize>,
    pub performed: Mutex<Vec<Action>>,
    pub captures: AtomicUsize,
}

impl FakeDevice {
    pub fn new() -> Arc<Self> {
        Self::failing_on(&[])
    }

    pub fn failing_on(calls: &[usize]) -> Arc<Self> {
        Arc::new(Self {
            id: Some("emulator-5554".into()),
            failing: calls.iter().copied().collect(),
            performed: Mutex::new(Vec::new()),
            captures: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl DeviceControl for FakeDevice {
    fn device_id(&self) -> Option<String> {
        self.id.clone()
    }

    async fn capture(&self) -> Result<RawFrame, SessionError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        Ok(RawFrame { png: vec![0x89, b'P', b'N', b'G'], width: 1080, height: 2400, secure: false })
    }

    async fn current_app(&self) -> Result<String, SessionError> {
        Ok("System Home".into())
    }

    async fn perform(&self, action: &Action, _width: u32, _height: u32) -> Result<(), SessionError> {
        let mut performed = self.performed.lock().unwrap();
        performed.push(action.clone());
        if self.failing.contains(&performed.len()) {
            return Err(SessionError::ActionFailure("tap missed".into()));
        }
        Ok(())
    }
}

pub struct FakeBackends {
    pub model: Arc<ScriptedModel>,
    pub device: Arc<FakeDevice>,
    pub model_unavailable: bool,
}

impl BackendFactory for FakeBackends {
    fn model(&self, _cfg: &SessionConfig) -> Result<Arc<dyn AgentModel>, SessionError> {
        if self.model_unavailable {
            return Err(SessionError::BackendUnavailable("connection refused".into()));
        }
        Ok(self.model.clone() as Arc<dyn AgentModel>)
    }

    fn device(&self, _device_id: Option<&str>) -> Result<Arc<dyn DeviceControl>, SessionError> {
        Ok(self.device.clone() as Arc<dyn DeviceControl>)
    }
}

pub fn decision(thinking: &str, action: Action, finished: bool) -> Decision {
    Decision { thinking: thinking.into(), action, finished, message: None }
}

pub fn tap(x: i32, y: i32) -> Action {
    Action::Tap { x, y }
}

pub fn valid_config() -> SessionConfig {
    SessionConfig::new("http://localhost:8080/v1", "autoglm-phone-9b")
}

pub fn session_with(model: Arc<ScriptedModel>, device: Arc<FakeDevice>) -> PhoneSession {
    PhoneSession::new(Arc::new(FakeBackends { model, device, model_unavailable: false }))
}

pub fn ready_session(script: Vec<Scripted>) -> (PhoneSession, Arc<ScriptedModel>, Arc<FakeDevice>) {
    let model = ScriptedModel::new(script);
    let device = FakeDevice::new();
    let session = session_with(model.clone(), device.clone());
    session.initialize(valid_config()).expect("init");
    (session, model, device)
}

pub async fn wait_for_status(session: &PhoneSession, status: SessionStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while session.status().status != status {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("status never reached");
}
