use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::action::ActionKind;
use crate::agent::{Screenshot, StepRecord};
use crate::config::{ImageDetail, OracleConfig};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

const SYSTEM_PROMPT: &str = "You operate a macOS desktop on behalf of a user. \
Each turn you receive the task, the step counter, the outcome of the previous action, \
a short history and a fresh screenshot. Choose exactly ONE next action. \
Coordinates are screen pixels measured from the top-left corner of the screenshot. \
When the task is complete, or cannot be completed, use the `done` tool \
with a status (success, partial or failed) and a summary. \
Reply with a single JSON object: \
{\"reasoning\": string, \"action\": {\"tool\": string, \"parameters\": object}}.";

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("decision oracle credential missing (set OPENAI_API_KEY)")]
    MissingCredential,
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("oracle returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unparseable decision: {0}")]
    Parse(String),
}

/// Everything the oracle sees besides the screenshot.
#[derive(Clone, Debug, Serialize)]
pub struct DecisionContext {
    pub task: String,
    pub step: u32,
    pub max_steps: u32,
    pub last_result: Option<String>,
    pub history: Vec<StepRecord>,
}

impl DecisionContext {
    pub fn render(&self) -> String {
        let mut s = String::new();
        s.push_str("Task: ");
        s.push_str(&self.task);
        s.push_str(&format!("\nStep {} of {}", self.step, self.max_steps));
        s.push_str("\nPrevious result: ");
        s.push_str(self.last_result.as_deref().unwrap_or("none (first step)"));
        if !self.history.is_empty() {
            s.push_str("\nRecent steps:\n");
            for rec in &self.history {
                s.push_str(&format!(
                    "{}. {} {} -> {}\n",
                    rec.index, rec.tool, rec.params, rec.result
                ));
            }
        }
        s.push_str("\nAvailable tools:\n");
        for kind in ActionKind::ALL {
            s.push_str("- ");
            s.push_str(kind.usage());
            s.push('\n');
        }
        s
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ProposedAction {
    pub tool: ActionKind,
    #[serde(default)]
    pub parameters: Value,
}

/// A single next action. Any extra keys (e.g. a batched `actions` list) are
/// ignored; only `action` is honoured.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Decision {
    #[serde(default)]
    pub reasoning: String,
    pub action: ProposedAction,
}

#[async_trait]
pub trait Oracle: Send + Sync {
    async fn decide(
        &self,
        ctx: &DecisionContext,
        screenshot: &Screenshot,
    ) -> Result<Decision, OracleError>;
}

#[async_trait]
impl<T: Oracle + ?Sized> Oracle for Arc<T> {
    async fn decide(
        &self,
        ctx: &DecisionContext,
        screenshot: &Screenshot,
    ) -> Result<Decision, OracleError> {
        (**self).decide(ctx, screenshot).await
    }
}

#[derive(Clone)]
pub struct DecisionClient {
    http: Client,
    api_base: String,
    api_key: String,
    model: String,
    image_detail: ImageDetail,
}

impl DecisionClient {
    pub fn new(cfg: &OracleConfig) -> Result<Self, OracleError> {
        let api_key = cfg.api_key.clone().ok_or(OracleError::MissingCredential)?;
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            api_base: cfg.api_base.clone(),
            api_key,
            model: cfg.model.clone(),
            image_detail: cfg.image_detail,
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_image_detail(mut self, detail: ImageDetail) -> Self {
        self.image_detail = detail;
        self
    }

    fn build_request(&self, ctx: &DecisionContext, screenshot: &Screenshot) -> Value {
        json!({
            "model": self.model,
            "instructions": SYSTEM_PROMPT,
            "input": [{
                "role": "user",
                "content": [
                    { "type": "input_text", "text": ctx.render() },
                    {
                        "type": "input_image",
                        "image_url": screenshot.data_url(),
                        "detail": self.image_detail.as_str()
                    }
                ]
            }],
            "text": {
                "format": {
                    "type": "json_schema",
                    "name": "next_action",
                    "strict": false,
                    "schema": decision_schema()
                }
            }
        })
    }

    /// Concatenate every `output_text` fragment of a Responses API payload.
    fn parse_output(v: &Value) -> Result<String, OracleError> {
        if let Some(text) = v.get("output_text").and_then(|x| x.as_str()) {
            return Ok(text.to_string());
        }
        let outputs = v
            .get("output")
            .and_then(|x| x.as_array())
            .ok_or_else(|| OracleError::Parse("response has no output".into()))?;
        let mut text = String::new();
        for item in outputs {
            if item.get("type").and_then(|x| x.as_str()) != Some("message") {
                continue;
            }
            let parts = item.get("content").and_then(|x| x.as_array());
            for part in parts.into_iter().flatten() {
                if let Some(t) = part.get("text").and_then(|x| x.as_str()) {
                    text.push_str(t);
                }
            }
        }
        if text.trim().is_empty() {
            return Err(OracleError::Parse("response contained no text".into()));
        }
        Ok(text)
    }
}

#[async_trait]
impl Oracle for DecisionClient {
    async fn decide(
        &self,
        ctx: &DecisionContext,
        screenshot: &Screenshot,
    ) -> Result<Decision, OracleError> {
        let url = format!("{}/responses", self.api_base);
        debug!(
            step = ctx.step,
            model = %self.model,
            image_bytes = screenshot.encoded_len(),
            "requesting decision"
        );
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&self.build_request(ctx, screenshot))
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(OracleError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| OracleError::Parse(format!("response is not JSON: {e}")))?;
        parse_decision(&Self::parse_output(&v)?)
    }
}

pub fn decision_schema() -> Value {
    let tools: Vec<&str> = ActionKind::ALL.iter().map(|k| k.as_str()).collect();
    json!({
        "type": "object",
        "properties": {
            "reasoning": { "type": "string" },
            "action": {
                "type": "object",
                "properties": {
                    "tool": { "type": "string", "enum": tools },
                    "parameters": { "type": "object" }
                },
                "required": ["tool", "parameters"]
            }
        },
        "required": ["reasoning", "action"]
    })
}

/// Parse the oracle's reply, tolerating prose or code fences around the JSON.
pub fn parse_decision(text: &str) -> Result<Decision, OracleError> {
    let body = extract_json_object(text)
        .ok_or_else(|| OracleError::Parse(format!("no JSON object in reply: {}", preview(text))))?;
    serde_json::from_str(body).map_err(|e| OracleError::Parse(format!("{e}: {}", preview(body))))
}

fn preview(text: &str) -> String {
    text.chars().take(200).collect()
}

/// Extract the first balanced `{...}` from `text`, skipping braces that
/// appear inside string literals.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in text[start..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_object_wrapped_in_prose() {
        let reply = r#"Sure! Here is my move:
```json
{"reasoning": "open {menu}", "action": {"tool": "click", "parameters": {"x": 10, "y": 20}}}
```
Good luck."#;
        let decision = parse_decision(reply).unwrap();
        assert_eq!(decision.reasoning, "open {menu}");
        assert_eq!(decision.action.tool, ActionKind::Click);
        assert_eq!(decision.action.parameters, json!({"x": 10, "y": 20}));
    }

    #[test]
    fn handles_escaped_quotes_and_unbalanced_input() {
        assert_eq!(
            extract_json_object(r#"x {"a": "say \"}\""} y"#),
            Some(r#"{"a": "say \"}\""}"#)
        );
        assert_eq!(extract_json_object("{\"a\": 1"), None);
        assert_eq!(extract_json_object("no json"), None);
    }

    #[test]
    fn rejects_tools_outside_the_vocabulary() {
        let reply = r#"{"reasoning": "", "action": {"tool": "rm_rf", "parameters": {}}}"#;
        let err = parse_decision(reply).unwrap_err();
        assert!(matches!(err, OracleError::Parse(_)));
    }

    #[test]
    fn batched_actions_are_ignored_in_favour_of_the_single_action() {
        let decision = parse_decision(
            r#"{"reasoning": "r", "action": {"tool": "wait", "parameters": {"ms": 10}},
               "actions": [{"tool": "click"}, {"tool": "type"}]}"#,
        )
        .unwrap();
        assert_eq!(decision.action.tool, ActionKind::Wait);
    }

    #[test]
    fn missing_credential_is_reported() {
        let cfg = OracleConfig {
            api_base: "https://api.example.com/v1".into(),
            api_key: None,
            model: "m".into(),
            image_detail: ImageDetail::Low,
        };
        assert!(matches!(DecisionClient::new(&cfg), Err(OracleError::MissingCredential)));
    }

    #[test]
    fn collects_output_text_from_message_items() {
        let v = json!({
            "id": "resp_1",
            "output": [
                {"type": "reasoning", "summary": []},
                {"type": "message", "content": [
                    {"type": "output_text", "text": "{\"reasoning\": \"r\", "},
                    {
                        "type": "output_text",
                        "text": "\"action\": {\"tool\": \"done\", \"parameters\": {}}}"
                    }
                ]}
            ]
        });
        let text = DecisionClient::parse_output(&v).unwrap();
        assert_eq!(parse_decision(&text).unwrap().action.tool, ActionKind::Done);
    }

    #[test]
    fn request_carries_image_detail_and_tool_enum() {
        let cfg = OracleConfig {
            api_base: "https://api.example.com/v1".into(),
            api_key: Some("k".into()),
            model: "vision-model".into(),
            image_detail: ImageDetail::High,
        };
        let client = DecisionClient::new(&cfg).unwrap().with_image_detail(ImageDetail::Low);
        let ctx = DecisionContext {
            task: "open notes".into(),
            step: 2,
            max_steps: 5,
            last_result: Some("click -> ok".into()),
            history: vec![],
        };
        let req = client.build_request(&ctx, &Screenshot::png("AAAA".into()));
        assert_eq!(req["model"], "vision-model");
        assert_eq!(req["input"][0]["content"][1]["detail"], "low");
        assert_eq!(req["input"][0]["content"][1]["image_url"], "data:image/png;base64,AAAA");
        let text = req["input"][0]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("Step 2 of 5"));
        assert!(text.contains("click -> ok"));
        let action = &req["text"]["format"]["schema"]["properties"]["action"];
        let tools = &action["properties"]["tool"]["enum"];
        assert_eq!(tools.as_array().unwrap().len(), ActionKind::ALL.len());
    }
}
