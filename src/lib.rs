pub mod adb;
pub mod agent;
pub mod config;
pub mod error;
pub mod history;
pub mod model;
pub mod screenshot;
pub mod server;
pub mod session;
pub mod stream;

pub use agent::{Action, AgentModel, BackendFactory, DeviceControl, StepExecutor};
pub use config::{ServerConfig, SessionConfig};
pub use error::SessionError;
pub use session::{PhoneSession, SessionStatus};
