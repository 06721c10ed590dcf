//! Tool catalogue advertised over `tools/list`, and the handlers behind
//! `tools/call`. Each tool has a typed parameter record; handlers return a
//! [`ToolOutput`] which is normalized into a single text content entry.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use nanoid::nanoid;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::action::{
    self, ActionError, BrowserClickParams, BrowserExtractParams, BrowserTypeParams,
    ScrollParams, UrlParams, Validate,
};
use crate::agent::{AgentConfig, ComputerAgent, Desktop, JobOutcome, JobStatus, Screenshot};
use crate::browser::BrowserSession;
use crate::config::{AgentDefaults, ImageDetail, OracleConfig, MAX_STEPS_LIMIT};
use crate::effectors::{self, EffectorOutput};
use crate::oracle::{DecisionClient, Oracle, OracleError};
use crate::remote::{RemoteClient, RemoteError, RemoteResponse};
use crate::rpc::JsonRpcNotification;

pub const TASK_RESULT_METHOD: &str = "notifications/task_result";
const DEFAULT_PAGE_SIZE: u32 = 25;
/// String fields longer than this under a binary-looking key are dropped
/// from tool text.
const INLINE_BINARY_LIMIT: usize = 4_096;
const BINARY_KEYS: [&str; 5] = ["data_base64", "base64", "image", "screenshot", "data_url"];

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error(transparent)]
    InvalidParams(#[from] ActionError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("remote service returned status {status}")]
    RemoteStatus { status: u16, data: Value },
    #[error("A computer_use task is already running. Wait for it to finish and retry.")]
    Busy,
    #[error("browser error: {0}")]
    Browser(String),
}

impl ToolError {
    pub fn payload(&self) -> Value {
        match self {
            ToolError::RemoteStatus { status, data } => json!({
                "error": self.to_string(),
                "status": status,
                "details": data,
            }),
            _ => json!({ "error": self.to_string() }),
        }
    }
}

// ========================= Normalized results =========================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text { text: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub content: Vec<ToolContent>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl ToolCallResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    pub fn error(payload: Value) -> Self {
        Self {
            content: vec![ToolContent::Text {
                text: payload.to_string(),
            }],
            is_error: true,
        }
    }

    pub fn first_text(&self) -> &str {
        match self.content.first() {
            Some(ToolContent::Text { text }) => text,
            None => "",
        }
    }
}

/// What a handler produced, before normalization.
#[derive(Clone, Debug)]
pub enum ToolOutput {
    Simple(Value),
    Job(JobOutcome),
}

impl ToolOutput {
    pub fn into_call_result(self) -> ToolCallResult {
        match self {
            ToolOutput::Simple(Value::String(text)) => ToolCallResult::text(text),
            ToolOutput::Simple(mut value) => {
                strip_binary(&mut value);
                let text =
                    serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
                ToolCallResult::text(text)
            }
            ToolOutput::Job(outcome) => {
                if let Some(shot) = &outcome.final_screenshot {
                    debug!(bytes = shot.encoded_len(), "final screenshot omitted from tool text");
                }
                let mut text = format!(
                    "Status: {}\nSummary: {}",
                    outcome.status.as_str(),
                    outcome.summary
                );
                if let Some(next) = &outcome.next_steps {
                    text.push_str(&format!("\nNext steps: {next}"));
                }
                if let Some(path) = &outcome.screenshot_path {
                    text.push_str(&format!("\nScreenshot: {path}"));
                }
                ToolCallResult::text(text)
            }
        }
    }
}

/// Replace oversized inline binary strings with a size marker.
pub fn strip_binary(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                let oversized = matches!(v, Value::String(s) if s.len() > INLINE_BINARY_LIMIT);
                if oversized && BINARY_KEYS.contains(&key.as_str()) {
                    let len = v.as_str().map(str::len).unwrap_or_default();
                    debug!(key = %key, chars = len, "stripping binary payload from tool result");
                    *v = Value::String(format!("[binary omitted: {len} chars]"));
                } else {
                    strip_binary(v);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(strip_binary),
        _ => {}
    }
}

// ========================= Context & notifications =========================

/// Capability to push unsolicited messages down the caller's connection.
/// Only the duplex transport hands one out.
#[derive(Clone, Debug)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<String>,
}

impl Notifier {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    pub fn push_notification(&self, method: &str, params: Value) -> bool {
        match serde_json::to_string(&JsonRpcNotification::new(method, params)) {
            Ok(frame) => self.tx.send(frame).is_ok(),
            Err(_) => false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ToolContext {
    pub notifier: Option<Notifier>,
}

// ========================= Catalogue =========================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ToolName {
    ListChats,
    SearchChats,
    GetMessages,
    SendMessage,
    CreateChat,
    React,
    RenameChat,
    MarkRead,
    ApiRequest,
    GetAttachment,
    ComputerUse,
    BrowserNavigate,
    BrowserClick,
    BrowserType,
    BrowserScroll,
    BrowserExtract,
    BrowserScreenshot,
}

impl ToolName {
    pub const ALL: [ToolName; 17] = [
        ToolName::ListChats,
        ToolName::SearchChats,
        ToolName::GetMessages,
        ToolName::SendMessage,
        ToolName::CreateChat,
        ToolName::React,
        ToolName::RenameChat,
        ToolName::MarkRead,
        ToolName::ApiRequest,
        ToolName::GetAttachment,
        ToolName::ComputerUse,
        ToolName::BrowserNavigate,
        ToolName::BrowserClick,
        ToolName::BrowserType,
        ToolName::BrowserScroll,
        ToolName::BrowserExtract,
        ToolName::BrowserScreenshot,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::ListChats => "list_chats",
            ToolName::SearchChats => "search_chats",
            ToolName::GetMessages => "get_messages",
            ToolName::SendMessage => "send_message",
            ToolName::CreateChat => "create_chat",
            ToolName::React => "react",
            ToolName::RenameChat => "rename_chat",
            ToolName::MarkRead => "mark_read",
            ToolName::ApiRequest => "api_request",
            ToolName::GetAttachment => "get_attachment",
            ToolName::ComputerUse => "computer_use",
            ToolName::BrowserNavigate => "browser_navigate",
            ToolName::BrowserClick => "browser_click",
            ToolName::BrowserType => "browser_type",
            ToolName::BrowserScroll => "browser_scroll",
            ToolName::BrowserExtract => "browser_extract",
            ToolName::BrowserScreenshot => "browser_screenshot",
        }
    }

    pub fn lookup(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == name)
    }

    pub fn descriptor(self) -> ToolDescriptor {
        let (description, schema) = match self {
            ToolName::ListChats => (
                "List recent chats, newest first.",
                object(
                    json!({
                        "limit": int("Page size (default 25)"),
                        "offset": int("Items to skip")
                    }),
                    &[],
                ),
            ),
            ToolName::SearchChats => (
                "Search chats by participant, name, or handle.",
                object(
                    json!({
                        "query": string("Search text"),
                        "limit": int("Maximum results")
                    }),
                    &["query"],
                ),
            ),
            ToolName::GetMessages => (
                "Fetch messages from a chat by id, \
                 or by a fuzzy handle (phone, email, contact name).",
                object(
                    json!({
                        "chatId": string("Chat identifier"),
                        "handle": string("Phone number, email, or contact name"),
                        "limit": int("Maximum messages (default 25)")
                    }),
                    &[],
                ),
            ),
            ToolName::SendMessage => (
                "Send a text message to a handle or chat id.",
                object(
                    json!({
                        "to": string("Recipient handle or chat id"),
                        "text": string("Message body")
                    }),
                    &["to", "text"],
                ),
            ),
            ToolName::CreateChat => (
                "Create a new chat with one or more participants.",
                object(
                    json!({
                        "participants": {
                            "type": "array",
                            "items": { "type": "string" },
                            "minItems": 1
                        },
                        "name": string("Optional group name"),
                        "message": string("Optional first message")
                    }),
                    &["participants"],
                ),
            ),
            ToolName::React => (
                "React to a message with a tapback.",
                object(
                    json!({
                        "chatId": string("Chat identifier"),
                        "messageId": string("Message identifier"),
                        "reaction": {
                            "type": "string",
                            "enum": ["love", "like", "dislike", "laugh", "emphasize", "question"]
                        }
                    }),
                    &["chatId", "messageId", "reaction"],
                ),
            ),
            ToolName::RenameChat => (
                "Rename a group chat.",
                object(
                    json!({
                        "chatId": string("Chat identifier"),
                        "name": string("New name")
                    }),
                    &["chatId", "name"],
                ),
            ),
            ToolName::MarkRead => (
                "Mark every message in a chat as read.",
                object(json!({ "chatId": string("Chat identifier") }), &["chatId"]),
            ),
            ToolName::ApiRequest => (
                "Raw passthrough to the messaging backend. Returns {status, data}.",
                object(
                    json!({
                        "path": string("Path starting with '/'"),
                        "method": {
                            "type": "string",
                            "enum": ["GET", "POST", "PUT", "PATCH", "DELETE"],
                            "default": "GET"
                        },
                        "body": { "type": "object" }
                    }),
                    &["path"],
                ),
            ),
            ToolName::GetAttachment => (
                "Fetch attachment metadata.",
                object(
                    json!({ "attachmentId": string("Attachment identifier") }),
                    &["attachmentId"],
                ),
            ),
            ToolName::ComputerUse => (
                "Operate the desktop autonomously: screenshot, decide, act, repeat until done. \
                 Only one task runs at a time.",
                object(
                    json!({
                        "task": string("What to accomplish, in plain language"),
                        "maxSteps": { "type": "integer", "minimum": 1, "maximum": MAX_STEPS_LIMIT },
                        "model": string("Override the decision model"),
                        "imageDetail": { "type": "string", "enum": ["low", "high", "auto"] },
                        "postActionWaitMs": { "type": "integer", "minimum": 0, "maximum": 10000 },
                        "includeFinalScreenshot": { "type": "boolean", "default": false },
                        "background": { "type": "boolean", "default": false },
                        "notifyTarget":
                            string("Handle to message with the result when a background task ends")
                    }),
                    &["task"],
                ),
            ),
            ToolName::BrowserNavigate => (
                "Open a URL in the automation browser.",
                object(json!({ "url": string("Absolute http(s) URL") }), &["url"]),
            ),
            ToolName::BrowserClick => (
                "Click an element by CSS selector, or a point by x/y.",
                object(
                    json!({
                        "selector": string("CSS selector"),
                        "x": int("Viewport x"),
                        "y": int("Viewport y")
                    }),
                    &[],
                ),
            ),
            ToolName::BrowserType => (
                "Type text into the focused element, or into a selector.",
                object(
                    json!({
                        "text": string("Text to insert"),
                        "selector": string("CSS selector to focus first")
                    }),
                    &["text"],
                ),
            ),
            ToolName::BrowserScroll => (
                "Scroll the page.",
                object(
                    json!({
                        "direction": { "type": "string", "enum": ["up", "down", "left", "right"] },
                        "amount": int("Scroll units (default 3)")
                    }),
                    &["direction"],
                ),
            ),
            ToolName::BrowserExtract => (
                "Extract visible text from the page or a selector.",
                object(
                    json!({
                        "selector": string("CSS selector"),
                        "maxChars": int("Truncate after this many characters")
                    }),
                    &[],
                ),
            ),
            ToolName::BrowserScreenshot => (
                "Capture the browser viewport to a PNG file and return its path.",
                object(json!({}), &[]),
            ),
        };
        ToolDescriptor {
            name: self.as_str().to_string(),
            description: description.to_string(),
            input_schema: schema,
        }
    }
}

pub fn catalogue() -> Vec<ToolDescriptor> {
    ToolName::ALL.iter().map(|t| t.descriptor()).collect()
}

fn object(properties: Value, required: &[&str]) -> Value {
    json!({ "type": "object", "properties": properties, "required": required })
}

fn string(description: &str) -> Value {
    json!({ "type": "string", "description": description })
}

fn int(description: &str) -> Value {
    json!({ "type": "integer", "description": description })
}

// ========================= Parameter records =========================

fn required(tool: &'static str, param: &'static str, value: &str) -> Result<(), ActionError> {
    if value.trim().is_empty() {
        Err(ActionError::Missing { tool, param })
    } else {
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct ListChatsParams {
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

impl Validate for ListChatsParams {
    fn validate(&self, _tool: &'static str) -> Result<(), ActionError> {
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchChatsParams {
    pub query: String,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl Validate for SearchChatsParams {
    fn validate(&self, tool: &'static str) -> Result<(), ActionError> {
        required(tool, "query", &self.query)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetMessagesParams {
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl Validate for GetMessagesParams {
    fn validate(&self, tool: &'static str) -> Result<(), ActionError> {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        if present(&self.chat_id) || present(&self.handle) {
            Ok(())
        } else {
            Err(ActionError::InvalidParams {
                tool,
                reason: "provide chatId or handle".into(),
            })
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SendMessageParams {
    pub to: String,
    pub text: String,
}

impl Validate for SendMessageParams {
    fn validate(&self, tool: &'static str) -> Result<(), ActionError> {
        required(tool, "to", &self.to)?;
        required(tool, "text", &self.text)
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateChatParams {
    pub participants: Vec<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Validate for CreateChatParams {
    fn validate(&self, tool: &'static str) -> Result<(), ActionError> {
        if self.participants.iter().all(|p| p.trim().is_empty()) {
            return Err(ActionError::Missing { tool, param: "participants" });
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reaction {
    Love,
    Like,
    Dislike,
    Laugh,
    Emphasize,
    Question,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactParams {
    pub chat_id: String,
    pub message_id: String,
    pub reaction: Reaction,
}

impl Validate for ReactParams {
    fn validate(&self, tool: &'static str) -> Result<(), ActionError> {
        required(tool, "chatId", &self.chat_id)?;
        required(tool, "messageId", &self.message_id)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameChatParams {
    pub chat_id: String,
    pub name: String,
}

impl Validate for RenameChatParams {
    fn validate(&self, tool: &'static str) -> Result<(), ActionError> {
        required(tool, "chatId", &self.chat_id)?;
        required(tool, "name", &self.name)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatIdParams {
    pub chat_id: String,
}

impl Validate for ChatIdParams {
    fn validate(&self, tool: &'static str) -> Result<(), ActionError> {
        required(tool, "chatId", &self.chat_id)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl From<HttpMethod> for Method {
    fn from(m: HttpMethod) -> Self {
        match m {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ApiRequestParams {
    pub path: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub body: Option<Value>,
}

impl Validate for ApiRequestParams {
    fn validate(&self, tool: &'static str) -> Result<(), ActionError> {
        if !self.path.starts_with('/') {
            return Err(ActionError::InvalidParams {
                tool,
                reason: "path must start with '/'".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentParams {
    pub attachment_id: String,
}

impl Validate for AttachmentParams {
    fn validate(&self, tool: &'static str) -> Result<(), ActionError> {
        required(tool, "attachmentId", &self.attachment_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputerUseParams {
    pub task: String,
    #[serde(default)]
    pub max_steps: Option<u32>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub image_detail: Option<ImageDetail>,
    #[serde(default)]
    pub post_action_wait_ms: Option<u64>,
    #[serde(default)]
    pub include_final_screenshot: bool,
    #[serde(default)]
    pub background: bool,
    #[serde(default)]
    pub notify_target: Option<String>,
}

impl Validate for ComputerUseParams {
    fn validate(&self, tool: &'static str) -> Result<(), ActionError> {
        required(tool, "task", &self.task)?;
        if let Some(steps) = self.max_steps {
            if steps == 0 || steps > MAX_STEPS_LIMIT {
                return Err(ActionError::InvalidParams {
                    tool,
                    reason: format!("maxSteps must be between 1 and {MAX_STEPS_LIMIT}"),
                });
            }
        }
        if self.post_action_wait_ms.is_some_and(|ms| ms > 10_000) {
            return Err(ActionError::InvalidParams {
                tool,
                reason: "postActionWaitMs must be at most 10000".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct NoParams {}

impl Validate for NoParams {
    fn validate(&self, _tool: &'static str) -> Result<(), ActionError> {
        Ok(())
    }
}

// ========================= Oracle provisioning =========================

/// Builds the decision oracle for one job, applying per-job overrides.
pub trait OracleProvider: Send + Sync {
    fn oracle(
        &self,
        model: Option<&str>,
        detail: Option<ImageDetail>,
    ) -> Result<Arc<dyn Oracle>, OracleError>;
}

impl OracleProvider for OracleConfig {
    fn oracle(
        &self,
        model: Option<&str>,
        detail: Option<ImageDetail>,
    ) -> Result<Arc<dyn Oracle>, OracleError> {
        let mut client = DecisionClient::new(self)?;
        if let Some(model) = model {
            client = client.with_model(model);
        }
        if let Some(detail) = detail {
            client = client.with_image_detail(detail);
        }
        Ok(Arc::new(client))
    }
}

// ========================= Toolbox =========================

#[derive(Clone)]
pub struct Toolbox {
    remote: RemoteClient,
    guard: crate::guard::JobGuard,
    desktop: Arc<dyn Desktop>,
    browser: Arc<BrowserSession>,
    oracles: Arc<dyn OracleProvider>,
    defaults: AgentDefaults,
    artifacts_dir: PathBuf,
}

impl Toolbox {
    pub fn new(
        remote: RemoteClient,
        desktop: Arc<dyn Desktop>,
        browser: Arc<BrowserSession>,
        oracles: Arc<dyn OracleProvider>,
        defaults: AgentDefaults,
        artifacts_dir: PathBuf,
    ) -> Self {
        Self {
            remote,
            guard: crate::guard::JobGuard::new(),
            desktop,
            browser,
            oracles,
            defaults,
            artifacts_dir,
        }
    }

    pub fn guard(&self) -> &crate::guard::JobGuard {
        &self.guard
    }

    pub async fn call(
        &self,
        name: &str,
        arguments: Option<Value>,
        ctx: ToolContext,
    ) -> ToolCallResult {
        let Some(tool) = ToolName::lookup(name) else {
            warn!(tool = name, "unknown tool requested");
            return ToolCallResult::error(ToolError::UnknownTool(name.to_string()).payload());
        };
        let args = arguments.unwrap_or_else(|| json!({}));
        match self.dispatch(tool, args, ctx).await {
            Ok(output) => output.into_call_result(),
            Err(err) => {
                warn!(tool = tool.as_str(), error = %err, "tool call failed");
                ToolCallResult::error(err.payload())
            }
        }
    }

    async fn dispatch(
        &self,
        tool: ToolName,
        args: Value,
        ctx: ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let name = tool.as_str();
        match tool {
            ToolName::ListChats => {
                let p: ListChatsParams = action::decode(name, args)?;
                remote_data(
                    self.remote
                        .list_chats(p.limit.unwrap_or(DEFAULT_PAGE_SIZE), p.offset.unwrap_or(0))
                        .await?,
                )
            }
            ToolName::SearchChats => {
                let p: SearchChatsParams = action::decode(name, args)?;
                remote_data(
                    self.remote
                        .search_chats(&p.query, p.limit.unwrap_or(DEFAULT_PAGE_SIZE))
                        .await?,
                )
            }
            ToolName::GetMessages => {
                let p: GetMessagesParams = action::decode(name, args)?;
                let limit = p.limit.unwrap_or(DEFAULT_PAGE_SIZE);
                let chat_id = p.chat_id.as_deref().filter(|s| !s.trim().is_empty());
                let resp = match (chat_id, p.handle.as_deref()) {
                    (Some(chat_id), _) => self.remote.chat_messages(chat_id, limit).await?,
                    (None, Some(handle)) => self.remote.handle_messages(handle, limit).await?,
                    (None, None) => missing_target(name)?,
                };
                remote_data(resp)
            }
            ToolName::SendMessage => {
                let p: SendMessageParams = action::decode(name, args)?;
                remote_data(self.remote.send_message(&p.to, &p.text).await?)
            }
            ToolName::CreateChat => {
                let p: CreateChatParams = action::decode(name, args)?;
                remote_data(
                    self.remote
                        .create_chat(&p.participants, p.name.as_deref(), p.message.as_deref())
                        .await?,
                )
            }
            ToolName::React => {
                let p: ReactParams = action::decode(name, args)?;
                let reaction = serde_json::to_value(p.reaction)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                remote_data(self.remote.react(&p.chat_id, &p.message_id, &reaction).await?)
            }
            ToolName::RenameChat => {
                let p: RenameChatParams = action::decode(name, args)?;
                remote_data(self.remote.rename_chat(&p.chat_id, &p.name).await?)
            }
            ToolName::MarkRead => {
                let p: ChatIdParams = action::decode(name, args)?;
                remote_data(self.remote.mark_read(&p.chat_id).await?)
            }
            ToolName::ApiRequest => {
                let p: ApiRequestParams = action::decode(name, args)?;
                let resp = self
                    .remote
                    .call(&p.path, p.method.into(), p.body.as_ref())
                    .await?;
                Ok(ToolOutput::Simple(serde_json::to_value(resp).unwrap_or(Value::Null)))
            }
            ToolName::GetAttachment => {
                let p: AttachmentParams = action::decode(name, args)?;
                remote_data(self.remote.attachment(&p.attachment_id).await?)
            }
            ToolName::ComputerUse => {
                let p: ComputerUseParams = action::decode(name, args)?;
                self.computer_use(p, ctx).await
            }
            ToolName::BrowserNavigate => {
                let p: UrlParams = action::decode(name, args)?;
                effector_text(effectors::browser_navigate(&self.browser, &p.url).await)
            }
            ToolName::BrowserClick => {
                let p: BrowserClickParams = action::decode(name, args)?;
                effector_text(effectors::browser_click(&self.browser, &p).await)
            }
            ToolName::BrowserType => {
                let p: BrowserTypeParams = action::decode(name, args)?;
                effector_text(effectors::browser_type(&self.browser, &p).await)
            }
            ToolName::BrowserScroll => {
                let p: ScrollParams = action::decode(name, args)?;
                effector_text(effectors::browser_scroll(&self.browser, &p).await)
            }
            ToolName::BrowserExtract => {
                let p: BrowserExtractParams = action::decode(name, args)?;
                effector_text(effectors::browser_extract(&self.browser, &p).await)
            }
            ToolName::BrowserScreenshot => {
                let _: NoParams = action::decode(name, args)?;
                self.browser_screenshot().await
            }
        }
    }

    async fn browser_screenshot(&self) -> Result<ToolOutput, ToolError> {
        let browser = self
            .browser
            .get()
            .await
            .map_err(|e| ToolError::Browser(format!("{e:#}")))?;
        let b64 = browser
            .screenshot_b64()
            .await
            .map_err(|e| ToolError::Browser(format!("{e:#}")))?;
        let url = browser.url().await.unwrap_or_default();
        let shot = Screenshot::png(b64);
        let path = persist_screenshot(&self.artifacts_dir.join("browser"), &nanoid!(), &shot)
            .await
            .map_err(|e| ToolError::Browser(format!("saving screenshot: {e}")))?;
        info!(path = %path.display(), bytes = shot.encoded_len(), "browser screenshot saved");
        Ok(ToolOutput::Simple(json!({
            "path": path.display().to_string(),
            "url": url,
            "base64Chars": shot.encoded_len(),
        })))
    }

    async fn computer_use(
        &self,
        p: ComputerUseParams,
        ctx: ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        // Checked and set before the first await in this handler.
        let Some(permit) = self.guard.try_acquire() else {
            info!(task = %p.task, "rejected computer_use: another task is running");
            return Err(ToolError::Busy);
        };
        let job_id = nanoid!();

        if p.background {
            let this = self.clone();
            let id = job_id.clone();
            let task = p.task.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let outcome = this.run_job(&id, &p).await;
                this.deliver(&id, &p, &outcome, ctx.notifier.as_ref()).await;
            });
            info!(job = %job_id, task = %task, "computer_use accepted in background");
            return Ok(ToolOutput::Job(JobOutcome {
                status: JobStatus::Running,
                summary: format!("Task accepted as job {job_id} and running in the background."),
                next_steps: Some(
                    "The result is delivered as a notifications/task_result message on a \
                     streaming connection, or to notifyTarget if one was given."
                        .into(),
                ),
                steps: Vec::new(),
                final_screenshot: None,
                screenshot_path: None,
            }));
        }

        // The job owns the permit, so a caller that goes away only loses the reply.
        let this = self.clone();
        let id = job_id.clone();
        let job = tokio::spawn(async move {
            let _permit = permit;
            this.run_job(&id, &p).await
        });
        match job.await {
            Ok(outcome) => Ok(ToolOutput::Job(outcome)),
            Err(err) => {
                warn!(job = %job_id, error = %err, "computer_use job aborted");
                Ok(ToolOutput::Job(JobOutcome::failed(
                    format!("Job {job_id} aborted: {err}"),
                    Vec::new(),
                )))
            }
        }
    }

    async fn run_job(&self, job_id: &str, p: &ComputerUseParams) -> JobOutcome {
        let oracle = match self.oracles.oracle(p.model.as_deref(), p.image_detail) {
            Ok(oracle) => oracle,
            Err(err) => {
                warn!(job = %job_id, error = %err, "cannot start computer_use job");
                return JobOutcome::failed(err.to_string(), Vec::new());
            }
        };
        let cfg = AgentConfig {
            max_steps: p
                .max_steps
                .unwrap_or(self.defaults.max_steps)
                .clamp(1, MAX_STEPS_LIMIT),
            history_window: self.defaults.history_window,
            settle_delay: p
                .post_action_wait_ms
                .map(Duration::from_millis)
                .unwrap_or(self.defaults.post_action_delay),
            include_final_screenshot: p.include_final_screenshot,
        };
        info!(job = %job_id, task = %p.task, max_steps = cfg.max_steps, "computer_use job started");
        let agent = ComputerAgent::new(Arc::clone(&self.desktop), oracle, cfg);
        let mut outcome = agent.run(job_id, &p.task).await;
        info!(
            job = %job_id,
            status = outcome.status.as_str(),
            steps = outcome.steps.len(),
            "computer_use job finished"
        );

        if let Some(shot) = &outcome.final_screenshot {
            match persist_screenshot(&self.artifacts_dir.join(job_id), "final", shot).await {
                Ok(path) => {
                    info!(
                        job = %job_id,
                        path = %path.display(),
                        bytes = shot.encoded_len(),
                        "final screenshot saved"
                    );
                    outcome.screenshot_path = Some(path.display().to_string());
                }
                Err(err) => warn!(job = %job_id, error = %err, "failed to save final screenshot"),
            }
        }
        outcome
    }

    async fn deliver(
        &self,
        job_id: &str,
        p: &ComputerUseParams,
        outcome: &JobOutcome,
        notifier: Option<&Notifier>,
    ) {
        if let Some(notifier) = notifier {
            let mut params = json!({
                "task": p.task,
                "status": outcome.status.as_str(),
                "summary": outcome.summary,
            });
            if let Some(next) = &outcome.next_steps {
                params["next_steps"] = json!(next);
            }
            if !notifier.push_notification(TASK_RESULT_METHOD, params) {
                warn!(job = %job_id, "connection closed before task result could be pushed");
            }
        }
        if let Some(target) = p.notify_target.as_deref().filter(|t| !t.trim().is_empty()) {
            let text = format!("[{}] {}: {}", outcome.status.as_str(), p.task, outcome.summary);
            match self.remote.send_message(target, &text).await {
                Ok(resp) if resp.is_success() => {
                    info!(job = %job_id, target, "task result messaged")
                }
                Ok(resp) => {
                    warn!(job = %job_id, status = resp.status, "task result message rejected")
                }
                Err(err) => warn!(job = %job_id, error = %err, "failed to message task result"),
            }
        }
    }
}

fn missing_target(tool: &'static str) -> Result<RemoteResponse, ToolError> {
    Err(ToolError::InvalidParams(ActionError::InvalidParams {
        tool,
        reason: "provide chatId or handle".into(),
    }))
}

fn remote_data(resp: RemoteResponse) -> Result<ToolOutput, ToolError> {
    if resp.is_success() {
        Ok(ToolOutput::Simple(resp.data))
    } else {
        Err(ToolError::RemoteStatus {
            status: resp.status,
            data: resp.data,
        })
    }
}

fn effector_text(out: EffectorOutput) -> Result<ToolOutput, ToolError> {
    if out.is_success() {
        Ok(ToolOutput::Simple(Value::String(out.output)))
    } else {
        Err(ToolError::Browser(out.summary()))
    }
}

async fn persist_screenshot(dir: &Path, name: &str, shot: &Screenshot) -> std::io::Result<PathBuf> {
    let bytes = STANDARD
        .decode(&shot.data_base64)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{name}.png"));
    tokio::fs::write(&path, &bytes).await?;
    Ok(path)
}
