use anyhow::Result;
use phone_hands::config::ServerConfig;
use phone_hands::server;
use phone_hands::session::{LiveBackends, PhoneSession};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = ServerConfig::from_env()?;
    let backends = LiveBackends::new(cfg.adb_path.clone(), cfg.default_device.clone());
    let session = PhoneSession::new(Arc::new(backends));
    let _screenshots = session.spawn_screenshot_loop();

    server::serve(&cfg, session).await
}
