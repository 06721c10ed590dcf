//! OS-level effectors: pointer and keyboard through `cliclick`, scripted
//! control through `osascript`, shell commands, launch/open, waits and screen
//! capture. Every effector returns an [`EffectorOutput`] instead of failing.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::action::{
    Action, BrowserClickParams, BrowserExtractParams, BrowserTypeParams, DragParams, KeyCombo,
    KeyEvent, PointParams, ScrollParams, MAX_WAIT_MS,
};
use crate::agent::{AgentError, Desktop, Screenshot};
use crate::browser::{BrowserSession, DEFAULT_EXTRACT_CHARS};

/// Timeout for helper binaries (cliclick, osascript, open, screencapture).
const CMD_TIMEOUT: Duration = Duration::from_secs(15);
/// Extra slack granted to a `wait` action before the safety timeout fires.
pub const MAX_OUTPUT_CHARS: usize = 8_000;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectorOutput {
    pub output: String,
    pub error: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

impl EffectorOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            exit_code: 1,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_empty() && self.exit_code == 0 && !self.timed_out
    }

    /// One-line description fed back to the decision oracle.
    pub fn summary(&self) -> String {
        if self.timed_out {
            return format!("timed out: {}", first_non_empty(&self.error, &self.output));
        }
        if !self.is_success() {
            let detail = first_non_empty(&self.error, &self.output);
            return format!("error (exit {}): {}", self.exit_code, detail);
        }
        if self.output.trim().is_empty() {
            "ok".to_string()
        } else {
            self.output.trim().to_string()
        }
    }
}

fn first_non_empty<'a>(a: &'a str, b: &'a str) -> &'a str {
    if a.trim().is_empty() {
        b.trim()
    } else {
        a.trim()
    }
}

#[derive(Clone, Copy, Debug)]
pub enum ClickKind {
    Left,
    Double,
    Right,
}

impl ClickKind {
    fn cliclick_prefix(self) -> &'static str {
        match self {
            ClickKind::Left => "c",
            ClickKind::Double => "dc",
            ClickKind::Right => "rc",
        }
    }
}

pub struct Effectors {
    pointer_override: Option<PathBuf>,
    pointer_binary: OnceCell<PathBuf>,
    max_output: usize,
}

impl Effectors {
    pub fn new(pointer_override: Option<PathBuf>) -> Self {
        Self {
            pointer_override,
            pointer_binary: OnceCell::new(),
            max_output: MAX_OUTPUT_CHARS,
        }
    }

    /// Locate `cliclick` once and cache the path for the life of the process.
    async fn pointer(&self) -> Result<&Path, String> {
        let path = self
            .pointer_binary
            .get_or_try_init(|| async {
                if let Some(path) = &self.pointer_override {
                    if path.exists() {
                        return Ok(path.clone());
                    }
                    return Err(format!("cliclick not found at {}", path.display()));
                }
                which::which("cliclick").map_err(|_| {
                    "cliclick not found. Install with: brew install cliclick".to_string()
                })
            })
            .await?;
        Ok(path.as_path())
    }

    async fn cliclick(&self, args: &[String]) -> EffectorOutput {
        let binary = match self.pointer().await {
            Ok(path) => path.to_path_buf(),
            Err(e) => return EffectorOutput::failed(e),
        };
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_command(&binary, &args, CMD_TIMEOUT, self.max_output).await
    }

    pub async fn click(&self, kind: ClickKind, p: &PointParams) -> EffectorOutput {
        let out = self
            .cliclick(&[format!("{}:{},{}", kind.cliclick_prefix(), p.x, p.y)])
            .await;
        with_success_text(out, format!("{kind:?} click at ({}, {})", p.x, p.y))
    }

    pub async fn drag(&self, p: &DragParams) -> EffectorOutput {
        let out = self
            .cliclick(&[
                format!("dd:{},{}", p.from_x, p.from_y),
                format!("dm:{},{}", p.to_x, p.to_y),
                format!("du:{},{}", p.to_x, p.to_y),
            ])
            .await;
        with_success_text(
            out,
            format!("dragged ({}, {}) -> ({}, {})", p.from_x, p.from_y, p.to_x, p.to_y),
        )
    }

    pub async fn scroll(&self, p: &ScrollParams) -> EffectorOutput {
        if let (Some(x), Some(y)) = (p.x, p.y) {
            let moved = self.cliclick(&[format!("m:{x},{y}")]).await;
            if !moved.is_success() {
                return moved;
            }
        }
        let (dx, dy) = p.direction.delta(p.amount());
        // Wheel deltas are positive for up/left, the reverse of screen axes.
        let script = format!(
            "ObjC.import('CoreGraphics'); \
             $.CGEventPost(0, $.CGEventCreateScrollWheelEvent(null, 1, 2, {}, {}));",
            -dy, -dx
        );
        let out = run_command(
            Path::new("osascript"),
            &["-l", "JavaScript", "-e", &script],
            CMD_TIMEOUT,
            self.max_output,
        )
        .await;
        with_success_text(out, format!("scrolled {:?} by {}", p.direction, p.amount()))
    }

    pub async fn type_text(&self, text: &str) -> EffectorOutput {
        let out = self.cliclick(&[format!("t:{text}")]).await;
        with_success_text(out, format!("typed {} characters", text.chars().count()))
    }

    pub async fn key(&self, combo: &str) -> EffectorOutput {
        let parsed = match KeyCombo::parse(combo) {
            Ok(parsed) => parsed,
            Err(e) => return EffectorOutput::failed(e),
        };
        let out = self.cliclick(&cliclick_key_args(&parsed)).await;
        with_success_text(out, format!("pressed {combo}"))
    }

    pub async fn applescript(&self, script: &str) -> EffectorOutput {
        run_command(Path::new("osascript"), &["-e", script], CMD_TIMEOUT, self.max_output).await
    }

    pub async fn shell(&self, command: &str, timeout: Duration) -> EffectorOutput {
        info!(
            command = %truncate(command, 120),
            timeout_ms = timeout.as_millis() as u64,
            "shell effector"
        );
        run_command(Path::new("/bin/sh"), &["-c", command], timeout, self.max_output).await
    }

    pub async fn open_app(&self, name: &str) -> EffectorOutput {
        let out = run_command(Path::new("open"), &["-a", name], CMD_TIMEOUT, self.max_output).await;
        with_success_text(out, format!("opened application {name}"))
    }

    pub async fn open_url(&self, url: &str) -> EffectorOutput {
        let out = run_command(Path::new("open"), &[url], CMD_TIMEOUT, self.max_output).await;
        with_success_text(out, format!("opened {url}"))
    }

    pub async fn wait(&self, ms: u64) -> EffectorOutput {
        let ms = ms.min(MAX_WAIT_MS);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        EffectorOutput::ok(format!("waited {ms}ms"))
    }

    pub async fn screenshot(&self) -> Result<Screenshot, AgentError> {
        let file = tempfile::Builder::new()
            .prefix("glass-shot-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| AgentError::Screenshot(format!("temp file: {e}")))?;
        let path = file.path().to_string_lossy().into_owned();
        let out = run_command(
            Path::new("screencapture"),
            &["-x", "-t", "png", &path],
            CMD_TIMEOUT,
            self.max_output,
        )
        .await;
        if !out.is_success() {
            return Err(AgentError::Screenshot(out.summary()));
        }
        let bytes = tokio::fs::read(file.path())
            .await
            .map_err(|e| AgentError::Screenshot(format!("read capture: {e}")))?;
        if bytes.is_empty() {
            // Missing Screen Recording permission yields an empty file.
            return Err(AgentError::Screenshot(
                "screen capture is empty; grant Screen Recording permission".into(),
            ));
        }
        debug!(bytes = bytes.len(), "captured screen");
        Ok(Screenshot::png(STANDARD.encode(bytes)))
    }
}

fn with_success_text(mut out: EffectorOutput, text: String) -> EffectorOutput {
    if out.is_success() && out.output.trim().is_empty() {
        out.output = text;
    }
    out
}

/// Translate a parsed combo into cliclick's `kd:`/`kp:`/`t:`/`ku:` commands.
pub fn cliclick_key_args(combo: &KeyCombo) -> Vec<String> {
    combo
        .events()
        .into_iter()
        .map(|event| match event {
            KeyEvent::Down(m) => format!("kd:{}", m.as_str()),
            KeyEvent::Up(m) => format!("ku:{}", m.as_str()),
            KeyEvent::Press if combo.is_named_key() => format!("kp:{}", combo.key),
            KeyEvent::Press => format!("t:{}", combo.key),
        })
        .collect()
}

pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("…[truncated]");
    out
}

/// Output kept from one pipe. Bytes land in `bytes` as they are read, so a
/// timed out command still reports what it printed.
#[derive(Default)]
struct Captured {
    bytes: Vec<u8>,
    dropped: u64,
}

impl Captured {
    async fn fill<R>(&mut self, reader: Option<R>, limit: usize)
    where
        R: AsyncRead + Unpin,
    {
        let Some(mut reader) = reader else {
            return;
        };
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    // Past the limit the pipe is still drained so the child never blocks.
                    let keep = n.min(limit.saturating_sub(self.bytes.len()));
                    self.bytes.extend_from_slice(&chunk[..keep]);
                    self.dropped += (n - keep) as u64;
                }
                Err(e) => {
                    warn!(error = %e, "failed to read process output");
                    break;
                }
            }
        }
    }

    fn text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.dropped > 0 {
            text.push_str(&format!("\n…[{} more bytes truncated]", self.dropped));
        }
        text.trim().to_string()
    }
}

pub async fn run_command(
    program: &Path,
    args: &[&str],
    timeout: Duration,
    max_output: usize,
) -> EffectorOutput {
    let mut child = match Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            return EffectorOutput::failed(format!(
                "failed to execute {}: {e}",
                program.display()
            ))
        }
    };
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let mut output = Captured::default();
    let mut error = Captured::default();
    let work = async {
        tokio::join!(
            output.fill(stdout, max_output),
            error.fill(stderr, max_output)
        );
        child.wait().await
    };

    let finished = tokio::time::timeout(timeout, work).await;
    match finished {
        Ok(Ok(status)) => EffectorOutput {
            output: output.text(),
            error: if status.success() {
                String::new()
            } else {
                error.text()
            },
            exit_code: status.code().unwrap_or(-1),
            timed_out: false,
        },
        Ok(Err(e)) => EffectorOutput {
            output: output.text(),
            error: format!("failed to wait for {}: {e}", program.display()),
            exit_code: -1,
            timed_out: false,
        },
        Err(_) => {
            if let Err(e) = child.kill().await {
                warn!(
                    error = %e,
                    program = %program.display(),
                    "failed to kill timed out process"
                );
            }
            let mut message =
                format!("{} timed out after {}ms", program.display(), timeout.as_millis());
            let stderr = error.text();
            if !stderr.is_empty() {
                message.push_str(&format!(": {stderr}"));
            }
            EffectorOutput {
                output: output.text(),
                error: message,
                exit_code: -1,
                timed_out: true,
            }
        }
    }
}

// ========================= Local desktop =========================

/// The real machine: effectors for the desktop plus the shared browser session.
pub struct LocalDesktop {
    effectors: Arc<Effectors>,
    browser: Arc<BrowserSession>,
}

impl LocalDesktop {
    pub fn new(effectors: Arc<Effectors>, browser: Arc<BrowserSession>) -> Self {
        Self { effectors, browser }
    }
}

pub async fn browser_click(session: &BrowserSession, p: &BrowserClickParams) -> EffectorOutput {
    let browser = match session.get().await {
        Ok(b) => b,
        Err(e) => return EffectorOutput::failed(format!("browser unavailable: {e:#}")),
    };
    let result = match (&p.selector, p.x, p.y) {
        (Some(selector), _, _) => browser
            .click_selector(selector)
            .await
            .map(|_| format!("clicked {selector}")),
        (None, Some(x), Some(y)) => browser
            .click(x, y)
            .await
            .map(|_| format!("clicked ({x}, {y})")),
        _ => Err(anyhow::anyhow!("provide a selector or both x and y")),
    };
    into_output(result)
}

pub async fn browser_navigate(session: &BrowserSession, url: &str) -> EffectorOutput {
    let browser = match session.get().await {
        Ok(b) => b,
        Err(e) => return EffectorOutput::failed(format!("browser unavailable: {e:#}")),
    };
    let result = async {
        browser.goto(url).await?;
        let title = browser.title().await.unwrap_or_default();
        Ok::<_, anyhow::Error>(format!("navigated to {} (title: {title})", browser.url().await?))
    }
    .await;
    into_output(result)
}

pub async fn browser_type(session: &BrowserSession, p: &BrowserTypeParams) -> EffectorOutput {
    let browser = match session.get().await {
        Ok(b) => b,
        Err(e) => return EffectorOutput::failed(format!("browser unavailable: {e:#}")),
    };
    let result = browser
        .type_text(p.selector.as_deref(), &p.text)
        .await
        .map(|_| format!("typed {} characters", p.text.chars().count()));
    into_output(result)
}

pub async fn browser_scroll(session: &BrowserSession, p: &ScrollParams) -> EffectorOutput {
    let browser = match session.get().await {
        Ok(b) => b,
        Err(e) => return EffectorOutput::failed(format!("browser unavailable: {e:#}")),
    };
    // One scroll unit is roughly a wheel notch of 100px.
    let (dx, dy) = p.direction.delta(p.amount() * 100);
    let result = browser
        .scroll(dx, dy)
        .await
        .map(|_| format!("scrolled {:?} by {}", p.direction, p.amount()));
    into_output(result)
}

pub async fn browser_extract(session: &BrowserSession, p: &BrowserExtractParams) -> EffectorOutput {
    let browser = match session.get().await {
        Ok(b) => b,
        Err(e) => return EffectorOutput::failed(format!("browser unavailable: {e:#}")),
    };
    let max = p.max_chars.unwrap_or(DEFAULT_EXTRACT_CHARS);
    into_output(browser.extract_text(p.selector.as_deref(), max).await)
}

fn into_output(result: anyhow::Result<String>) -> EffectorOutput {
    match result {
        Ok(text) => EffectorOutput::ok(text),
        Err(e) => EffectorOutput::failed(format!("{e:#}")),
    }
}

#[async_trait]
impl Desktop for LocalDesktop {
    async fn screenshot(&self) -> Result<Screenshot, AgentError> {
        self.effectors.screenshot().await
    }

    async fn perform(&self, action: &Action) -> EffectorOutput {
        let fx = &self.effectors;
        match action {
            Action::Click(p) => fx.click(ClickKind::Left, p).await,
            Action::DoubleClick(p) => fx.click(ClickKind::Double, p).await,
            Action::RightClick(p) => fx.click(ClickKind::Right, p).await,
            Action::Drag(p) => fx.drag(p).await,
            Action::Scroll(p) => fx.scroll(p).await,
            Action::Type(p) => fx.type_text(&p.text).await,
            Action::Key(p) => fx.key(&p.combo).await,
            Action::AppleScript(p) => fx.applescript(&p.script).await,
            Action::Shell(p) => fx.shell(&p.command, Duration::from_millis(p.timeout_ms())).await,
            Action::OpenApp(p) => fx.open_app(&p.name).await,
            Action::OpenUrl(p) => fx.open_url(&p.url).await,
            Action::Wait(p) => fx.wait(p.ms).await,
            Action::BrowserNavigate(p) => browser_navigate(&self.browser, &p.url).await,
            Action::BrowserClick(p) => browser_click(&self.browser, p).await,
            Action::BrowserType(p) => browser_type(&self.browser, p).await,
            Action::BrowserScroll(p) => browser_scroll(&self.browser, p).await,
            Action::BrowserExtract(p) => browser_extract(&self.browser, p).await,
            Action::Done(_) => EffectorOutput::failed("done is not an executable action"),
        }
    }
}
