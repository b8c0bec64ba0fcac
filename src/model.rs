use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

use crate::agent::{Action, AgentModel, Decision, DecisionRequest};
use crate::config::SessionConfig;
use crate::error::SessionError;

const SYSTEM_PROMPT: &str = "You operate an Android phone to complete the user's task. \
Each turn you receive the current screenshot and the foreground app. \
Think inside <think></think>, then answer inside <answer></answer> with exactly one call:\n\
do(action=\"Launch\", app=\"Settings\")\n\
do(action=\"Tap\", element=[x,y])\n\
do(action=\"Double Tap\", element=[x,y])\n\
do(action=\"Long Press\", element=[x,y])\n\
do(action=\"Swipe\", start=[x1,y1], end=[x2,y2])\n\
do(action=\"Type\", text=\"...\")\n\
do(action=\"Back\")\n\
do(action=\"Home\")\n\
do(action=\"Wait\", duration=\"2 seconds\")\n\
do(action=\"Take_over\", message=\"why a human is needed\")\n\
finish(message=\"summary for the user\")\n\
Coordinates are relative: 0..999 from the top-left corner in both axes.";

#[derive(Clone)]
pub struct ModelClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl ModelClient {
    pub fn new(cfg: &SessionConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            model: cfg.model_name.clone(),
        })
    }

    pub async fn complete(&self, messages: Vec<Value>) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let req = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": 3000,
            "temperature": 0.0,
        });
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("model endpoint error {}: {}", status, text);
        }
        let v: Value = serde_json::from_str(&text).context("failed to parse model response JSON")?;
        v.pointer("/choices/0/message/content")
            .and_then(|x| x.as_str())
            .map(|s| s.to_string())
            .context("missing choices[0].message.content")
    }

    fn build_messages(request: &DecisionRequest<'_>) -> Vec<Value> {
        let mut messages = vec![json!({ "role": "system", "content": SYSTEM_PROMPT })];
        messages.push(json!({ "role": "user", "content": format!("Task: {}", request.task) }));
        // Earlier screenshots are not replayed, only what the agent did.
        for step in request.steps {
            let action = serde_json::to_string(&step.action).unwrap_or_default();
            messages.push(json!({
                "role": "assistant",
                "content": format!("<think>{}</think><answer>{}</answer>", step.thinking, action),
            }));
            let outcome = if step.step_success { "succeeded" } else { "failed" };
            messages.push(json!({ "role": "user", "content": format!("Step {} {}.", step.index, outcome) }));
        }

        let screen_info = format!(
            "current_app={}",
            request.current_app.unwrap_or("unknown")
        );
        let mut content = vec![json!({ "type": "text", "text": screen_info })];
        if request.frame.png.is_empty() || request.frame.secure {
            content.push(json!({ "type": "text", "text": "The screen is protected and could not be captured." }));
        } else {
            content.push(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:image/png;base64,{}", STANDARD.encode(&request.frame.png)) }
            }));
        }
        messages.push(json!({ "role": "user", "content": content }));
        messages
    }

    /// Splits a `<think>..</think><answer>..</answer>` reply into a decision.
    pub fn parse_response(content: &str) -> Decision {
        let (thinking, answer) = split_reply(content);
        let answer = answer.trim();

        let do_at = answer.find("do(");
        let finish_at = answer.find("finish(");
        let is_finish = match (finish_at, do_at) {
            (Some(f), Some(d)) => f < d,
            (Some(_), None) => true,
            _ => false,
        };

        if let Some(args) = call_args(answer, "finish").filter(|_| is_finish) {
            let message = parse_kwargs(args).remove("message").unwrap_or_default();
            return Decision {
                thinking,
                action: Action::Finish { message: message.clone() },
                finished: true,
                message: Some(message).filter(|m| !m.is_empty()),
            };
        }

        if let Some(args) = call_args(answer, "do") {
            let action = decode_action(args, answer);
            return Decision { thinking, action, finished: false, message: None };
        }

        // Plain text with no call: the model is talking to the user.
        let text = if answer.is_empty() { content.trim() } else { answer };
        Decision {
            thinking,
            action: Action::Finish { message: text.to_string() },
            finished: true,
            message: Some(text.to_string()),
        }
    }
}

#[async_trait]
impl AgentModel for ModelClient {
    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, SessionError> {
        let messages = Self::build_messages(&request);
        let content = self
            .complete(messages)
            .await
            .map_err(|e| SessionError::ModelFailure(e.to_string()))?;
        debug!(reply = %content, "model reply");
        Ok(Self::parse_response(&content))
    }
}

fn split_reply(content: &str) -> (String, String) {
    let thinking = between(content, "<think>", "</think>");
    let answer = between(content, "<answer>", "</answer>");
    match (thinking, answer) {
        (Some(t), Some(a)) => (t.trim().to_string(), a.to_string()),
        (Some(t), None) => {
            let rest = content.split("</think>").nth(1).unwrap_or_default();
            (t.trim().to_string(), rest.to_string())
        }
        (None, Some(a)) => {
            let before = content.split("<answer>").next().unwrap_or_default();
            (before.trim().to_string(), a.to_string())
        }
        (None, None) => {
            // Bare replies put the call last: everything before it is reasoning.
            let cut = ["do(", "finish("]
                .iter()
                .filter_map(|p| content.find(p))
                .min();
            match cut {
                Some(i) => (content[..i].trim().to_string(), content[i..].to_string()),
                None => (String::new(), content.to_string()),
            }
        }
    }
}

fn between<'a>(s: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = s.find(open)? + open.len();
    let end = s[start..].find(close).map(|i| start + i).unwrap_or(s.len());
    Some(&s[start..end])
}

fn call_args<'a>(answer: &'a str, name: &str) -> Option<&'a str> {
    let start = answer.find(&format!("{name}("))? + name.len() + 1;
    let end = answer.rfind(')').filter(|&e| e >= start)?;
    Some(&answer[start..end])
}

fn kwarg_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(\w+)\s*=\s*("(?:[^"\\]|\\.)*"|\[[^\]]*\]|[^,\s)]+)"#).expect("valid kwarg regex")
    })
}

fn parse_kwargs(args: &str) -> std::collections::HashMap<String, String> {
    kwarg_regex()
        .captures_iter(args)
        .map(|c| {
            let raw = c[2].trim();
            let value = if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
                raw[1..raw.len() - 1].replace("\\\"", "\"").replace("\\n", "\n")
            } else {
                raw.to_string()
            };
            (c[1].to_string(), value)
        })
        .collect()
}

fn parse_point(v: Option<&String>) -> Option<[i32; 2]> {
    let v = v?;
    let nums: Vec<i32> = v
        .trim_matches(|c| c == '[' || c == ']')
        .split(',')
        .filter_map(|n| n.trim().parse::<f64>().ok())
        .map(|n| n.round() as i32)
        .collect();
    match nums.as_slice() {
        [x, y] => Some([*x, *y]),
        _ => None,
    }
}

fn parse_seconds(v: Option<&String>) -> f64 {
    v.and_then(|s| s.split_whitespace().next().and_then(|n| n.parse::<f64>().ok()))
        .unwrap_or(1.0)
}

fn decode_action(args: &str, raw: &str) -> Action {
    let kw = parse_kwargs(args);
    let kind = kw.get("action").map(|s| s.to_lowercase()).unwrap_or_default();
    let unknown = || Action::Unknown { raw: raw.to_string() };
    match kind.as_str() {
        "launch" => match kw.get("app") {
            Some(app) => Action::OpenApp { name: app.clone() },
            None => unknown(),
        },
        "tap" => parse_point(kw.get("element")).map_or_else(unknown, |[x, y]| Action::Tap { x, y }),
        "double tap" | "double_tap" => {
            parse_point(kw.get("element")).map_or_else(unknown, |[x, y]| Action::DoubleTap { x, y })
        }
        "long press" | "long_press" => {
            parse_point(kw.get("element")).map_or_else(unknown, |[x, y]| Action::LongPress { x, y })
        }
        "swipe" => match (parse_point(kw.get("start")), parse_point(kw.get("end"))) {
            (Some(from), Some(to)) => Action::Swipe { from, to },
            _ => unknown(),
        },
        "type" | "type_name" => Action::Type { text: kw.get("text").cloned().unwrap_or_default() },
        "back" => Action::Back,
        "home" => Action::Home,
        "wait" => Action::Wait { seconds: parse_seconds(kw.get("duration")) },
        "take_over" | "takeover" => Action::TakeOver {
            message: kw.get("message").cloned().unwrap_or_default(),
        },
        _ => unknown(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::RawFrame;
    use crate::history::StepRecord;

    #[test]
    fn parses_tap_with_think_block() {
        let d = ModelClient::parse_response(
            "<think>The settings icon is at the bottom.</think><answer>do(action=\"Tap\", element=[500, 873])</answer>",
        );
        assert_eq!(d.thinking, "The settings icon is at the bottom.");
        assert_eq!(d.action, Action::Tap { x: 500, y: 873 });
        assert!(!d.finished);
    }

    #[test]
    fn parses_launch_and_swipe() {
        let d = ModelClient::parse_response("<answer>do(action=\"Launch\", app=\"Settings\")</answer>");
        assert_eq!(d.action, Action::OpenApp { name: "Settings".into() });

        let d = ModelClient::parse_response("scroll down\ndo(action=\"Swipe\", start=[500,800], end=[500,200])");
        assert_eq!(d.thinking, "scroll down");
        assert_eq!(d.action, Action::Swipe { from: [500, 800], to: [500, 200] });
    }

    #[test]
    fn type_text_keeps_commas_and_quotes() {
        let d = ModelClient::parse_response(r#"<answer>do(action="Type", text="hi, \"bob\"")</answer>"#);
        assert_eq!(d.action, Action::Type { text: "hi, \"bob\"".into() });
    }

    #[test]
    fn finish_is_terminal_with_message() {
        let d = ModelClient::parse_response("<think>done</think><answer>finish(message=\"Wi-Fi is on\")</answer>");
        assert!(d.finished);
        assert_eq!(d.message.as_deref(), Some("Wi-Fi is on"));
        assert_eq!(d.action, Action::Finish { message: "Wi-Fi is on".into() });
    }

    #[test]
    fn wait_reads_duration_and_unknown_is_kept_raw() {
        let d = ModelClient::parse_response("do(action=\"Wait\", duration=\"2.5 seconds\")");
        assert_eq!(d.action, Action::Wait { seconds: 2.5 });
        let d = ModelClient::parse_response("do(action=\"Teleport\")");
        assert!(matches!(d.action, Action::Unknown { .. }));
        assert!(!d.finished);
    }

    #[test]
    fn plain_text_reply_finishes_the_task() {
        let d = ModelClient::parse_response("I cannot find that app on this phone.");
        assert!(d.finished);
        assert_eq!(d.message.as_deref(), Some("I cannot find that app on this phone."));
    }

    #[test]
    fn messages_carry_history_and_screenshot() {
        let frame = RawFrame { png: vec![1, 2, 3], width: 10, height: 20, secure: false };
        let steps = vec![StepRecord { index: 1, thinking: "open".into(), action: Action::Home, step_success: false }];
        let req = DecisionRequest { task: "open settings", frame: &frame, current_app: Some("Launcher"), steps: &steps };
        let messages = ModelClient::build_messages(&req);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[3]["content"], "Step 1 failed.");
        let last = messages.last().unwrap();
        assert_eq!(last["content"][0]["text"], "current_app=Launcher");
        assert!(last["content"][1]["image_url"]["url"].as_str().unwrap().starts_with("data:image/png;base64,"));
    }
}
