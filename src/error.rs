use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("config error: {0}")]
    Config(String),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("action failed: {0}")]
    ActionFailure(String),
    #[error("model failure: {0}")]
    ModelFailure(String),
    #[error("stream aborted")]
    StreamAborted,
    #[error("agent not initialized")]
    NotInitialized,
    #[error("a task is already executing")]
    Busy,
    #[error("screenshot not available")]
    ScreenshotUnavailable,
}

impl SessionError {
    /// Text shown to the operator for a terminal failure.
    pub fn user_message(&self) -> String {
        match self {
            SessionError::Config(msg) => msg.clone(),
            SessionError::BackendUnavailable(_) => {
                "Device or model backend is unavailable, please retry later".to_string()
            }
            SessionError::ActionFailure(msg) => format!("Action failed: {msg}"),
            SessionError::ModelFailure(msg) => format!("Model request failed: {msg}"),
            SessionError::StreamAborted => "Task cancelled".to_string(),
            SessionError::NotInitialized => {
                "Agent not initialized. Call /api/init first.".to_string()
            }
            SessionError::Busy => "A task is already running".to_string(),
            SessionError::ScreenshotUnavailable => "not available".to_string(),
        }
    }
}
