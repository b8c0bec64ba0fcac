use crate::error::SessionError;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

/// Period of the background screenshot poller.
pub const SCREENSHOT_INTERVAL: Duration = Duration::from_secs(3);

/// Parameters accepted by `init`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

fn default_base_url() -> String {
    "http://localhost:8080/v1".into()
}

fn default_api_key() -> String {
    "EMPTY".into()
}

fn default_max_steps() -> usize {
    100
}

impl SessionConfig {
    pub fn new(base_url: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model_name: model_name.into(),
            api_key: default_api_key(),
            device_id: None,
            max_steps: default_max_steps(),
        }
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.model_name.trim().is_empty() {
            return Err(SessionError::Config("model_name is required".into()));
        }
        let url = Url::parse(self.base_url.trim())
            .map_err(|e| SessionError::Config(format!("invalid base_url '{}': {e}", self.base_url)))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(SessionError::Config(format!(
                "base_url must be an http(s) URL, got '{}'",
                self.base_url
            )));
        }
        if self.max_steps == 0 {
            return Err(SessionError::Config("max_steps must be at least 1".into()));
        }
        if let Some(id) = &self.device_id {
            if id.trim().is_empty() {
                return Err(SessionError::Config("device_id must not be blank".into()));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub adb_path: String,
    pub default_device: Option<String>,
    pub cors_origin: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            adb_path: "adb".into(),
            default_device: None,
            cors_origin: "http://localhost:3000".into(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut cfg = Self::default();
        if let Ok(addr) = env::var("PHONE_HANDS_ADDR") {
            cfg.addr = addr
                .parse()
                .map_err(|e| anyhow::anyhow!("PHONE_HANDS_ADDR '{addr}': {e}"))?;
        }
        if let Ok(adb) = env::var("PHONE_HANDS_ADB") {
            cfg.adb_path = adb;
        }
        cfg.default_device = env::var("PHONE_HANDS_DEVICE").ok().filter(|s| !s.trim().is_empty());
        if let Ok(origin) = env::var("PHONE_HANDS_CORS_ORIGIN") {
            cfg.cors_origin = origin;
        }
        Ok(cfg)
    }
}
