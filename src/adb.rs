use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::process::Output;
use std::sync::{Mutex as StdMutex, OnceLock};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::agent::{Action, DeviceControl, RawFrame};
use crate::error::SessionError;

/// Used until the first successful capture reports the real size.
const FALLBACK_SIZE: (u32, u32) = (1080, 2400);

const APP_PACKAGES: &[(&str, &str)] = &[
    ("Settings", "com.android.settings"),
    ("Chrome", "com.android.chrome"),
    ("Camera", "com.android.camera"),
    ("Clock", "com.android.deskclock"),
    ("Contacts", "com.android.contacts"),
    ("Calendar", "com.android.calendar"),
    ("Messages", "com.google.android.apps.messaging"),
    ("Gmail", "com.google.android.gm"),
    ("Maps", "com.google.android.apps.maps"),
    ("YouTube", "com.google.android.youtube"),
    ("Photos", "com.google.android.apps.photos"),
    ("Play Store", "com.android.vending"),
    ("WeChat", "com.tencent.mm"),
    ("Alipay", "com.eg.android.AlipayGphone"),
    ("Taobao", "com.taobao.taobao"),
];

pub fn package_for(app: &str) -> Option<String> {
    let app = app.trim();
    APP_PACKAGES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(app))
        .map(|(_, pkg)| pkg.to_string())
        .or_else(|| app.contains('.').then(|| app.to_string()))
}

fn app_for(package: &str) -> String {
    APP_PACKAGES
        .iter()
        .find(|(_, pkg)| *pkg == package)
        .map(|(name, _)| name.to_string())
        .unwrap_or_else(|| package.to_string())
}

/// Relative 0..=999 coordinate to device pixels.
fn to_pixels(rel: i32, size: u32) -> i64 {
    let rel = rel.clamp(0, 999) as i64;
    rel * size as i64 / 1000
}

/// Width and height from a PNG IHDR chunk.
pub fn png_dimensions(png: &[u8]) -> Option<(u32, u32)> {
    const SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";
    if png.len() < 24 || &png[..8] != SIGNATURE || &png[12..16] != b"IHDR" {
        return None;
    }
    let w = u32::from_be_bytes(png[16..20].try_into().ok()?);
    let h = u32::from_be_bytes(png[20..24].try_into().ok()?);
    Some((w, h))
}

/// Quotes text for `input text`, which runs through the device shell.
fn shell_quote_text(text: &str) -> String {
    let escaped = text.replace('\'', "'\\''").replace(' ', "%s");
    format!("'{escaped}'")
}

pub struct AdbDevice {
    adb: String,
    serial: Option<String>,
    gesture: Mutex<()>,
    last_size: StdMutex<(u32, u32)>,
}

impl AdbDevice {
    pub fn new(adb: impl Into<String>, serial: Option<String>) -> Self {
        Self {
            adb: adb.into(),
            serial,
            gesture: Mutex::new(()),
            last_size: StdMutex::new(FALLBACK_SIZE),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.adb);
        if let Some(serial) = &self.serial {
            cmd.arg("-s").arg(serial);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    async fn run(&self, args: &[&str]) -> Result<Output> {
        let out = self
            .command()
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to spawn {}", self.adb))?;
        if !out.status.success() {
            bail!(
                "adb {} exited with {}: {}",
                args.join(" "),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(out)
    }

    pub async fn shell(&self, args: &[&str]) -> Result<String> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        let out = self.run(&full).await?;
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    pub async fn screencap(&self) -> Result<RawFrame> {
        let out = self.run(&["exec-out", "screencap", "-p"]).await?;
        let stderr = String::from_utf8_lossy(&out.stderr);
        let size = self.last_size.lock().map(|s| *s).unwrap_or(FALLBACK_SIZE);
        // Secure surfaces make screencap report a failed status instead of pixels.
        if stderr.contains("Status: -1") || stderr.contains("Failed") || out.stdout.is_empty() {
            debug!("screencap refused, treating screen as secure");
            return Ok(RawFrame { png: Vec::new(), width: size.0, height: size.1, secure: true });
        }
        let (width, height) = png_dimensions(&out.stdout).context("screencap did not return a PNG")?;
        if let Ok(mut last) = self.last_size.lock() {
            *last = (width, height);
        }
        Ok(RawFrame { png: out.stdout, width, height, secure: false })
    }

    pub async fn tap(&self, x: i64, y: i64) -> Result<()> {
        self.shell(&["input", "tap", &x.to_string(), &y.to_string()]).await?;
        Ok(())
    }

    pub async fn double_tap(&self, x: i64, y: i64) -> Result<()> {
        self.tap(x, y).await?;
        sleep(Duration::from_millis(100)).await;
        self.tap(x, y).await
    }

    pub async fn long_press(&self, x: i64, y: i64) -> Result<()> {
        let (x, y) = (x.to_string(), y.to_string());
        self.shell(&["input", "swipe", &x, &y, &x, &y, "3000"]).await?;
        Ok(())
    }

    pub async fn swipe(&self, from: (i64, i64), to: (i64, i64)) -> Result<()> {
        self.shell(&[
            "input",
            "swipe",
            &from.0.to_string(),
            &from.1.to_string(),
            &to.0.to_string(),
            &to.1.to_string(),
            "500",
        ])
        .await?;
        Ok(())
    }

    pub async fn type_text(&self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.shell(&["input", "text", &shell_quote_text(text)]).await?;
        Ok(())
    }

    pub async fn keyevent(&self, code: u32) -> Result<()> {
        self.shell(&["input", "keyevent", &code.to_string()]).await?;
        Ok(())
    }

    pub async fn launch(&self, app: &str) -> Result<()> {
        let Some(package) = package_for(app) else {
            bail!("unknown app '{}'", app);
        };
        let out = self
            .shell(&["monkey", "-p", &package, "-c", "android.intent.category.LAUNCHER", "1"])
            .await?;
        if out.contains("No activities found") {
            bail!("{} is not installed", package);
        }
        Ok(())
    }

    pub async fn foreground_package(&self) -> Result<Option<String>> {
        static FOCUS: OnceLock<Regex> = OnceLock::new();
        let re = FOCUS.get_or_init(|| {
            Regex::new(r"(?:mCurrentFocus|mFocusedApp)=.*?\s([A-Za-z0-9_]+(?:\.[A-Za-z0-9_]+)+)/")
                .expect("valid focus regex")
        });
        let dump = self.shell(&["dumpsys", "window"]).await?;
        Ok(dump
            .lines()
            .find_map(|line| re.captures(line).map(|c| c[1].to_string())))
    }

    pub async fn wait_for_settle(&self) {
        sleep(Duration::from_millis(500)).await;
    }

    async fn perform_inner(&self, action: &Action, width: u32, height: u32) -> Result<()> {
        let px = |x: i32, y: i32| (to_pixels(x, width), to_pixels(y, height));
        match action {
            Action::OpenApp { name } => self.launch(name).await?,
            Action::Tap { x, y } => {
                let (x, y) = px(*x, *y);
                self.tap(x, y).await?
            }
            Action::DoubleTap { x, y } => {
                let (x, y) = px(*x, *y);
                self.double_tap(x, y).await?
            }
            Action::LongPress { x, y } => {
                let (x, y) = px(*x, *y);
                self.long_press(x, y).await?
            }
            Action::Swipe { from, to } => self.swipe(px(from[0], from[1]), px(to[0], to[1])).await?,
            Action::Type { text } => self.type_text(text).await?,
            Action::Back => self.keyevent(4).await?,
            Action::Home => self.keyevent(3).await?,
            Action::Wait { seconds } => {
                let seconds = if seconds.is_finite() { seconds.clamp(0.0, 30.0) } else { 1.0 };
                sleep(Duration::from_secs_f64(seconds)).await;
                return Ok(());
            }
            Action::TakeOver { message } => {
                warn!(message = %message, "agent requested manual takeover");
                return Ok(());
            }
            Action::Finish { .. } => return Ok(()),
            Action::Unknown { raw } => bail!("unsupported action: {}", raw),
        }
        self.wait_for_settle().await;
        Ok(())
    }
}

#[async_trait]
impl DeviceControl for AdbDevice {
    fn device_id(&self) -> Option<String> {
        self.serial.clone()
    }

    async fn capture(&self) -> Result<RawFrame, SessionError> {
        self.screencap()
            .await
            .map_err(|e| SessionError::BackendUnavailable(e.to_string()))
    }

    async fn current_app(&self) -> Result<String, SessionError> {
        let pkg = self
            .foreground_package()
            .await
            .map_err(|e| SessionError::BackendUnavailable(e.to_string()))?;
        Ok(pkg.map(|p| app_for(&p)).unwrap_or_else(|| "System Home".to_string()))
    }

    async fn perform(&self, action: &Action, width: u32, height: u32) -> Result<(), SessionError> {
        let _gesture = self.gesture.lock().await;
        self.perform_inner(action, width, height)
            .await
            .map_err(|e| SessionError::ActionFailure(e.to_string()))
    }
}
