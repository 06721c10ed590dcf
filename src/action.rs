//! Typed action vocabulary shared by the automation loop and the direct tools.
//!
//! The decision oracle names an [`ActionKind`] and supplies a loosely typed
//! parameter object; [`Action::from_parts`] turns that pair into a strongly
//! typed [`Action`], validating every field before any effector runs.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::agent::JobStatus;

pub const MAX_SHELL_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_SHELL_TIMEOUT_MS: u64 = 30_000;
pub const MAX_WAIT_MS: u64 = 30_000;
pub const DEFAULT_SCROLL_AMOUNT: u32 = 3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("invalid parameters for {tool}: {reason}")]
    InvalidParams { tool: &'static str, reason: String },
    #[error("missing required parameter {param} for {tool}")]
    Missing { tool: &'static str, param: &'static str },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    DoubleClick,
    RightClick,
    Drag,
    Scroll,
    Type,
    Key,
    #[serde(rename = "applescript")]
    AppleScript,
    Shell,
    OpenApp,
    OpenUrl,
    Wait,
    BrowserNavigate,
    BrowserClick,
    BrowserType,
    BrowserScroll,
    BrowserExtract,
    Done,
}

impl ActionKind {
    pub const ALL: [ActionKind; 18] = [
        ActionKind::Click,
        ActionKind::DoubleClick,
        ActionKind::RightClick,
        ActionKind::Drag,
        ActionKind::Scroll,
        ActionKind::Type,
        ActionKind::Key,
        ActionKind::AppleScript,
        ActionKind::Shell,
        ActionKind::OpenApp,
        ActionKind::OpenUrl,
        ActionKind::Wait,
        ActionKind::BrowserNavigate,
        ActionKind::BrowserClick,
        ActionKind::BrowserType,
        ActionKind::BrowserScroll,
        ActionKind::BrowserExtract,
        ActionKind::Done,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Click => "click",
            ActionKind::DoubleClick => "double_click",
            ActionKind::RightClick => "right_click",
            ActionKind::Drag => "drag",
            ActionKind::Scroll => "scroll",
            ActionKind::Type => "type",
            ActionKind::Key => "key",
            ActionKind::AppleScript => "applescript",
            ActionKind::Shell => "shell",
            ActionKind::OpenApp => "open_app",
            ActionKind::OpenUrl => "open_url",
            ActionKind::Wait => "wait",
            ActionKind::BrowserNavigate => "browser_navigate",
            ActionKind::BrowserClick => "browser_click",
            ActionKind::BrowserType => "browser_type",
            ActionKind::BrowserScroll => "browser_scroll",
            ActionKind::BrowserExtract => "browser_extract",
            ActionKind::Done => "done",
        }
    }

    /// One-line usage hint rendered into the oracle's instructions.
    pub fn usage(self) -> &'static str {
        match self {
            ActionKind::Click => "click {x, y}: left click at screen pixel coordinates",
            ActionKind::DoubleClick => "double_click {x, y}",
            ActionKind::RightClick => "right_click {x, y}",
            ActionKind::Drag => "drag {fromX, fromY, toX, toY}",
            ActionKind::Scroll => "scroll {direction: up|down|left|right, amount?, x?, y?}",
            ActionKind::Type => "type {text}: type text into the focused element",
            ActionKind::Key => "key {combo}: e.g. \"enter\", \"cmd+c\", \"cmd+shift+4\"",
            ActionKind::AppleScript => "applescript {script}",
            ActionKind::Shell => "shell {command, timeoutMs?}",
            ActionKind::OpenApp => "open_app {name}",
            ActionKind::OpenUrl => "open_url {url}: open in the default browser",
            ActionKind::Wait => "wait {ms}",
            ActionKind::BrowserNavigate => "browser_navigate {url}: automation browser",
            ActionKind::BrowserClick => "browser_click {selector} or {x, y}",
            ActionKind::BrowserType => "browser_type {text, selector?}",
            ActionKind::BrowserScroll => "browser_scroll {direction, amount?}",
            ActionKind::BrowserExtract => "browser_extract {selector?, maxChars?}",
            ActionKind::Done => "done {status?: success|partial|failed, summary, nextSteps?}",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointParams {
    pub x: i64,
    pub y: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DragParams {
    pub from_x: i64,
    pub from_y: i64,
    pub to_x: i64,
    pub to_y: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    /// Signed (dx, dy) for `amount` units, positive meaning right/down.
    pub fn delta(self, amount: i64) -> (i64, i64) {
        match self {
            ScrollDirection::Up => (0, -amount),
            ScrollDirection::Down => (0, amount),
            ScrollDirection::Left => (-amount, 0),
            ScrollDirection::Right => (amount, 0),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrollParams {
    pub direction: ScrollDirection,
    #[serde(default)]
    pub amount: Option<u32>,
    #[serde(default)]
    pub x: Option<i64>,
    #[serde(default)]
    pub y: Option<i64>,
}

impl ScrollParams {
    pub fn amount(&self) -> i64 {
        i64::from(self.amount.unwrap_or(DEFAULT_SCROLL_AMOUNT))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextParams {
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyParams {
    pub combo: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptParams {
    pub script: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellParams {
    pub command: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ShellParams {
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
            .unwrap_or(DEFAULT_SHELL_TIMEOUT_MS)
            .min(MAX_SHELL_TIMEOUT_MS)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppParams {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlParams {
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitParams {
    pub ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserClickParams {
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub x: Option<i64>,
    #[serde(default)]
    pub y: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserTypeParams {
    pub text: String,
    #[serde(default)]
    pub selector: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserExtractParams {
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub max_chars: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneParams {
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub next_steps: Option<String>,
}

/// Checks performed after deserialization and before any side effect.
pub trait Validate {
    fn validate(&self, tool: &'static str) -> Result<(), ActionError>;
}

fn non_empty(tool: &'static str, param: &'static str, value: &str) -> Result<(), ActionError> {
    if value.trim().is_empty() {
        Err(ActionError::Missing { tool, param })
    } else {
        Ok(())
    }
}

fn non_negative(tool: &'static str, coords: &[i64]) -> Result<(), ActionError> {
    if coords.iter().any(|c| *c < 0) {
        return Err(ActionError::InvalidParams {
            tool,
            reason: "coordinates must be non-negative pixels".into(),
        });
    }
    Ok(())
}

pub(crate) fn check_url(tool: &'static str, raw: &str) -> Result<(), ActionError> {
    non_empty(tool, "url", raw)?;
    let parsed = url::Url::parse(raw).map_err(|e| ActionError::InvalidParams {
        tool,
        reason: format!("invalid url {raw:?}: {e}"),
    })?;
    match parsed.scheme() {
        "http" | "https" | "file" | "about" => Ok(()),
        other => Err(ActionError::InvalidParams {
            tool,
            reason: format!("unsupported url scheme {other:?}"),
        }),
    }
}

impl Validate for PointParams {
    fn validate(&self, tool: &'static str) -> Result<(), ActionError> {
        non_negative(tool, &[self.x, self.y])
    }
}

impl Validate for DragParams {
    fn validate(&self, tool: &'static str) -> Result<(), ActionError> {
        non_negative(tool, &[self.from_x, self.from_y, self.to_x, self.to_y])
    }
}

impl Validate for ScrollParams {
    fn validate(&self, tool: &'static str) -> Result<(), ActionError> {
        if self.amount == Some(0) {
            return Err(ActionError::InvalidParams {
                tool,
                reason: "amount must be at least 1".into(),
            });
        }
        match (self.x, self.y) {
            (Some(x), Some(y)) => non_negative(tool, &[x, y]),
            (None, None) => Ok(()),
            _ => Err(ActionError::InvalidParams {
                tool,
                reason: "x and y must be given together".into(),
            }),
        }
    }
}

impl Validate for TextParams {
    fn validate(&self, tool: &'static str) -> Result<(), ActionError> {
        if self.text.is_empty() {
            return Err(ActionError::Missing { tool, param: "text" });
        }
        Ok(())
    }
}

impl Validate for KeyParams {
    fn validate(&self, tool: &'static str) -> Result<(), ActionError> {
        KeyCombo::parse(&self.combo)
            .map(|_| ())
            .map_err(|reason| ActionError::InvalidParams { tool, reason })
    }
}

impl Validate for ScriptParams {
    fn validate(&self, tool: &'static str) -> Result<(), ActionError> {
        non_empty(tool, "script", &self.script)
    }
}

impl Validate for ShellParams {
    fn validate(&self, tool: &'static str) -> Result<(), ActionError> {
        non_empty(tool, "command", &self.command)?;
        if self.timeout_ms == Some(0) {
            return Err(ActionError::InvalidParams {
                tool,
                reason: "timeoutMs must be positive".into(),
            });
        }
        Ok(())
    }
}

impl Validate for AppParams {
    fn validate(&self, tool: &'static str) -> Result<(), ActionError> {
        non_empty(tool, "name", &self.name)
    }
}

impl Validate for UrlParams {
    fn validate(&self, tool: &'static str) -> Result<(), ActionError> {
        check_url(tool, &self.url)
    }
}

impl Validate for WaitParams {
    fn validate(&self, tool: &'static str) -> Result<(), ActionError> {
        if self.ms > MAX_WAIT_MS {
            return Err(ActionError::InvalidParams {
                tool,
                reason: format!("ms must be at most {MAX_WAIT_MS}"),
            });
        }
        Ok(())
    }
}

impl Validate for BrowserClickParams {
    fn validate(&self, tool: &'static str) -> Result<(), ActionError> {
        match (&self.selector, self.x, self.y) {
            (Some(selector), _, _) => non_empty(tool, "selector", selector),
            (None, Some(x), Some(y)) => non_negative(tool, &[x, y]),
            _ => Err(ActionError::InvalidParams {
                tool,
                reason: "provide a selector or both x and y".into(),
            }),
        }
    }
}

impl Validate for BrowserTypeParams {
    fn validate(&self, tool: &'static str) -> Result<(), ActionError> {
        if self.text.is_empty() {
            return Err(ActionError::Missing { tool, param: "text" });
        }
        if let Some(selector) = &self.selector {
            non_empty(tool, "selector", selector)?;
        }
        Ok(())
    }
}

impl Validate for BrowserExtractParams {
    fn validate(&self, tool: &'static str) -> Result<(), ActionError> {
        if self.max_chars == Some(0) {
            return Err(ActionError::InvalidParams {
                tool,
                reason: "maxChars must be positive".into(),
            });
        }
        Ok(())
    }
}

impl Validate for DoneParams {
    fn validate(&self, tool: &'static str) -> Result<(), ActionError> {
        // A finished job cannot report itself as still running.
        if self.status == Some(JobStatus::Running) {
            return Err(ActionError::InvalidParams {
                tool,
                reason: "status must be success, partial or failed".into(),
            });
        }
        Ok(())
    }
}

/// Deserialize a parameter object into `T` and validate it.
pub fn decode<T>(tool: &'static str, params: Value) -> Result<T, ActionError>
where
    T: DeserializeOwned + Validate,
{
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params
    };
    let typed: T = serde_json::from_value(params).map_err(|e| ActionError::InvalidParams {
        tool,
        reason: e.to_string(),
    })?;
    typed.validate(tool)?;
    Ok(typed)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Click(PointParams),
    DoubleClick(PointParams),
    RightClick(PointParams),
    Drag(DragParams),
    Scroll(ScrollParams),
    Type(TextParams),
    Key(KeyParams),
    AppleScript(ScriptParams),
    Shell(ShellParams),
    OpenApp(AppParams),
    OpenUrl(UrlParams),
    Wait(WaitParams),
    BrowserNavigate(UrlParams),
    BrowserClick(BrowserClickParams),
    BrowserType(BrowserTypeParams),
    BrowserScroll(ScrollParams),
    BrowserExtract(BrowserExtractParams),
    Done(DoneParams),
}

impl Action {
    pub fn from_parts(kind: ActionKind, params: Value) -> Result<Self, ActionError> {
        let tool = kind.as_str();
        Ok(match kind {
            ActionKind::Click => Action::Click(decode(tool, params)?),
            ActionKind::DoubleClick => Action::DoubleClick(decode(tool, params)?),
            ActionKind::RightClick => Action::RightClick(decode(tool, params)?),
            ActionKind::Drag => Action::Drag(decode(tool, params)?),
            ActionKind::Scroll => Action::Scroll(decode(tool, params)?),
            ActionKind::Type => Action::Type(decode(tool, params)?),
            ActionKind::Key => Action::Key(decode(tool, params)?),
            ActionKind::AppleScript => Action::AppleScript(decode(tool, params)?),
            ActionKind::Shell => Action::Shell(decode(tool, params)?),
            ActionKind::OpenApp => Action::OpenApp(decode(tool, params)?),
            ActionKind::OpenUrl => Action::OpenUrl(decode(tool, params)?),
            ActionKind::Wait => Action::Wait(decode(tool, params)?),
            ActionKind::BrowserNavigate => Action::BrowserNavigate(decode(tool, params)?),
            ActionKind::BrowserClick => Action::BrowserClick(decode(tool, params)?),
            ActionKind::BrowserType => Action::BrowserType(decode(tool, params)?),
            ActionKind::BrowserScroll => Action::BrowserScroll(decode(tool, params)?),
            ActionKind::BrowserExtract => Action::BrowserExtract(decode(tool, params)?),
            ActionKind::Done => Action::Done(decode(tool, params)?),
        })
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Click(_) => ActionKind::Click,
            Action::DoubleClick(_) => ActionKind::DoubleClick,
            Action::RightClick(_) => ActionKind::RightClick,
            Action::Drag(_) => ActionKind::Drag,
            Action::Scroll(_) => ActionKind::Scroll,
            Action::Type(_) => ActionKind::Type,
            Action::Key(_) => ActionKind::Key,
            Action::AppleScript(_) => ActionKind::AppleScript,
            Action::Shell(_) => ActionKind::Shell,
            Action::OpenApp(_) => ActionKind::OpenApp,
            Action::OpenUrl(_) => ActionKind::OpenUrl,
            Action::Wait(_) => ActionKind::Wait,
            Action::BrowserNavigate(_) => ActionKind::BrowserNavigate,
            Action::BrowserClick(_) => ActionKind::BrowserClick,
            Action::BrowserType(_) => ActionKind::BrowserType,
            Action::BrowserScroll(_) => ActionKind::BrowserScroll,
            Action::BrowserExtract(_) => ActionKind::BrowserExtract,
            Action::Done(_) => ActionKind::Done,
        }
    }
}

// ========================= Key combos =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Modifier {
    Cmd,
    Shift,
    Ctrl,
    Alt,
    Fn,
}

impl Modifier {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "cmd" | "command" | "meta" | "super" => Some(Modifier::Cmd),
            "shift" => Some(Modifier::Shift),
            "ctrl" | "control" => Some(Modifier::Ctrl),
            "alt" | "option" | "opt" => Some(Modifier::Alt),
            "fn" => Some(Modifier::Fn),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Modifier::Cmd => "cmd",
            Modifier::Shift => "shift",
            Modifier::Ctrl => "ctrl",
            Modifier::Alt => "alt",
            Modifier::Fn => "fn",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyEvent {
    Down(Modifier),
    Press,
    Up(Modifier),
}

/// A `+`-joined chord such as `cmd+shift+4`: modifiers in press order plus
/// one main key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyCombo {
    pub modifiers: Vec<Modifier>,
    pub key: String,
}

impl KeyCombo {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let parts: Vec<String> = raw
            .split('+')
            .map(|p| p.trim().to_ascii_lowercase())
            .collect();
        let Some((key, modifiers)) = parts.split_last() else {
            return Err("empty key combo".into());
        };
        if key.is_empty() {
            return Err(format!("key combo {raw:?} has no main key"));
        }
        let modifiers = modifiers
            .iter()
            .map(|m| Modifier::parse(m).ok_or_else(|| format!("unknown modifier {m:?} in {raw:?}")))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            modifiers,
            key: normalize_key(key).to_string(),
        })
    }

    pub fn presses(&self) -> Vec<KeyEvent> {
        self.modifiers.iter().copied().map(KeyEvent::Down).collect()
    }

    pub fn releases(&self) -> Vec<KeyEvent> {
        self.modifiers.iter().rev().copied().map(KeyEvent::Up).collect()
    }

    /// Full event sequence: presses, main key, releases.
    pub fn events(&self) -> Vec<KeyEvent> {
        let mut events = self.presses();
        events.push(KeyEvent::Press);
        events.extend(self.releases());
        events
    }

    /// Whether the main key is a named key rather than a literal character.
    pub fn is_named_key(&self) -> bool {
        self.key.chars().count() > 1
    }
}

fn normalize_key(key: &str) -> &str {
    match key {
        "enter" | "return" => "return",
        "esc" | "escape" => "esc",
        "backspace" | "delete" => "delete",
        "del" | "forwarddelete" | "forward_delete" => "fwd-delete",
        "space" => "space",
        "up" | "arrowup" => "arrow-up",
        "down" | "arrowdown" => "arrow-down",
        "left" | "arrowleft" => "arrow-left",
        "right" | "arrowright" => "arrow-right",
        "pageup" | "page_up" => "page-up",
        "pagedown" | "page_down" => "page-down",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn combo_releases_in_reverse_press_order() {
        let combo = KeyCombo::parse("cmd+shift+4").unwrap();
        assert_eq!(
            combo.presses(),
            vec![KeyEvent::Down(Modifier::Cmd), KeyEvent::Down(Modifier::Shift)]
        );
        assert_eq!(combo.key, "4");
        assert_eq!(
            combo.releases(),
            vec![KeyEvent::Up(Modifier::Shift), KeyEvent::Up(Modifier::Cmd)]
        );
        assert_eq!(combo.events().len(), 5);
    }

    #[test]
    fn single_named_key_has_no_modifiers() {
        let combo = KeyCombo::parse("Enter").unwrap();
        assert!(combo.modifiers.is_empty());
        assert_eq!(combo.key, "return");
        assert!(combo.is_named_key());
        assert_eq!(combo.events(), vec![KeyEvent::Press]);
    }

    #[test]
    fn rejects_unknown_modifiers_and_dangling_plus() {
        assert!(KeyCombo::parse("hyper+a").is_err());
        assert!(KeyCombo::parse("cmd+").is_err());
        assert!(KeyCombo::parse("").is_err());
    }

    #[test]
    fn oracle_names_round_trip_through_serde() {
        for kind in ActionKind::ALL {
            let encoded = serde_json::to_value(kind).unwrap();
            assert_eq!(encoded, json!(kind.as_str()));
        }
        assert!(serde_json::from_value::<ActionKind>(json!("format_disk")).is_err());
    }

    #[test]
    fn validates_before_dispatch() {
        let err = Action::from_parts(ActionKind::Click, json!({"x": 10})).unwrap_err();
        assert!(matches!(err, ActionError::InvalidParams { tool: "click", .. }));

        let err = Action::from_parts(ActionKind::Type, json!({"text": ""})).unwrap_err();
        assert_eq!(err, ActionError::Missing { tool: "type", param: "text" });

        let err = Action::from_parts(ActionKind::OpenUrl, json!({"url": "javascript:alert(1)"}))
            .unwrap_err();
        assert!(matches!(err, ActionError::InvalidParams { tool: "open_url", .. }));

        let err = Action::from_parts(ActionKind::Wait, json!({"ms": 3_600_000})).unwrap_err();
        assert!(matches!(err, ActionError::InvalidParams { tool: "wait", .. }));

        let drag = json!({"fromX": 1, "fromY": 2, "toX": 3, "toY": 4});
        let ok = Action::from_parts(ActionKind::Drag, drag).unwrap();
        assert_eq!(ok.kind(), ActionKind::Drag);
    }

    #[test]
    fn done_defaults_are_empty() {
        let action = Action::from_parts(ActionKind::Done, Value::Null).unwrap();
        assert_eq!(
            action,
            Action::Done(DoneParams { status: None, summary: None, next_steps: None })
        );
    }

    #[test]
    fn done_only_accepts_terminal_statuses() {
        let err = Action::from_parts(ActionKind::Done, json!({"status": "running"})).unwrap_err();
        assert!(err.to_string().contains("success, partial or failed"));

        let action =
            Action::from_parts(ActionKind::Done, json!({"status": "partial", "summary": "half"}))
                .unwrap();
        let Action::Done(done) = action else {
            panic!("expected done action");
        };
        assert_eq!(done.status, Some(JobStatus::Partial));
    }

    #[test]
    fn shell_timeout_is_capped() {
        let Action::Shell(params) =
            Action::from_parts(ActionKind::Shell, json!({"command": "ls", "timeoutMs": 999_999}))
                .unwrap()
        else {
            panic!("expected shell action");
        };
        assert_eq!(params.timeout_ms(), MAX_SHELL_TIMEOUT_MS);
    }
}
