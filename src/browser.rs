use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType, InsertTextParams, MouseButton,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::layout::Point;
use chromiumoxide::page::{Page, ScreenshotParamsBuilder};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info};

const VIEWPORT: (i64, i64) = (1280, 800);
pub const DEFAULT_EXTRACT_CHARS: usize = 4_000;

#[derive(Clone, Debug, Default)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    /// Attach to an existing Chromium over CDP instead of launching one.
    pub ws_url: Option<String>,
}

pub struct Browser {
    page: Page,
    _browser: OxideBrowser,
}

fn viewport_params() -> Result<SetDeviceMetricsOverrideParams> {
    SetDeviceMetricsOverrideParams::builder()
        .width(VIEWPORT.0)
        .height(VIEWPORT.1)
        .device_scale_factor(1.0)
        .mobile(false)
        .build()
        .map_err(|e| anyhow!(e))
}

impl Browser {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // Unique profile per launch avoids ProcessSingleton lock conflicts on quick restarts.
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("glass-bridge-profile-{}-{}", std::process::id(), ts));
        std::fs::create_dir_all(&profile_dir)
            .with_context(|| format!("create profile dir {}", profile_dir.display()))?;
        builder = builder
            .user_data_dir(profile_dir)
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        Self::with_page(browser, cfg.user_agent).await
    }

    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (browser, mut handler) = OxideBrowser::connect(ws_url)
            .await
            .with_context(|| format!("connect to browser at {ws_url}"))?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        Self::with_page(browser, None).await
    }

    async fn with_page(browser: OxideBrowser, user_agent: Option<String>) -> Result<Self> {
        let page = browser.new_page("about:blank").await?;
        if let Some(ua) = user_agent {
            page.set_user_agent(ua).await?;
        }
        // Non-zero viewport, otherwise screenshots fail with 0-width errors.
        page.execute(viewport_params()?).await?;
        Ok(Self { page, _browser: browser })
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    pub async fn url(&self) -> Result<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    pub async fn title(&self) -> Result<String> {
        Ok(self.page.get_title().await?.unwrap_or_default())
    }

    pub async fn click(&self, x: i64, y: i64) -> Result<()> {
        let cmd = DispatchMouseEventParams::builder()
            .x(x as f64)
            .y(y as f64)
            .button(MouseButton::Left)
            .click_count(1);
        let pressed = cmd
            .clone()
            .r#type(DispatchMouseEventType::MousePressed)
            .build()
            .map_err(|e| anyhow!(e))?;
        let released = cmd
            .r#type(DispatchMouseEventType::MouseReleased)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page
            .move_mouse(Point { x: x as f64, y: y as f64 })
            .await?
            .execute(pressed)
            .await?;
        self.page.execute(released).await?;
        Ok(())
    }

    pub async fn click_selector(&self, selector: &str) -> Result<()> {
        self.page
            .find_element(selector)
            .await
            .with_context(|| format!("no element matches {selector:?}"))?
            .click()
            .await?;
        Ok(())
    }

    pub async fn scroll(&self, dx: i64, dy: i64) -> Result<()> {
        self.evaluate(format!("window.scrollBy({dx}, {dy});")).await?;
        Ok(())
    }

    /// Insert text into `selector` (focused first) or into the active element.
    pub async fn type_text(&self, selector: Option<&str>, text: &str) -> Result<()> {
        if let Some(selector) = selector {
            self.page
                .find_element(selector)
                .await
                .with_context(|| format!("no element matches {selector:?}"))?
                .click()
                .await?;
        }
        self.page
            .execute(InsertTextParams { text: text.to_string() })
            .await?;
        Ok(())
    }

    pub async fn extract_text(&self, selector: Option<&str>, max_chars: usize) -> Result<String> {
        let target = match selector {
            Some(s) => format!("document.querySelector({})", serde_json::to_string(s)?),
            None => "document.body".to_string(),
        };
        let script = format!(
            "(function() {{ const el = {target}; \
             return el ? (el.innerText || el.textContent || '') : null; }})()"
        );
        let value = self.evaluate(script).await?;
        let text = match value {
            serde_json::Value::String(s) => s,
            serde_json::Value::Null => {
                return Err(anyhow!("no element matches {:?}", selector.unwrap_or("body")))
            }
            other => other.to_string(),
        };
        Ok(text.chars().take(max_chars).collect())
    }

    pub async fn screenshot_b64(&self) -> Result<String> {
        let take = || async {
            self.page
                .screenshot(ScreenshotParamsBuilder::default().full_page(false).build())
                .await
        };
        match take().await {
            Ok(bytes) => Ok(STANDARD.encode(bytes)),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("0 width") || msg.contains("0 height") {
                    self.page.execute(viewport_params()?).await?;
                    sleep(Duration::from_millis(50)).await;
                    let bytes = take().await?;
                    return Ok(STANDARD.encode(bytes));
                }
                Err(anyhow!(e))
            }
        }
    }

    async fn evaluate(&self, expression: String) -> Result<serde_json::Value> {
        let eval = EvaluateParams::builder()
            .expression(expression)
            .return_by_value(true)
            .build()
            .map_err(|e| anyhow!(e))?;
        let resp = self.page.execute(eval).await?;
        Ok(resp.result.result.value.clone().unwrap_or(serde_json::Value::Null))
    }
}

/// Process-wide browser handle, launched on first use and reused afterwards.
pub struct BrowserSession {
    cfg: BrowserConfig,
    inner: Mutex<Option<Arc<Browser>>>,
}

impl BrowserSession {
    pub fn new(cfg: BrowserConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(None),
        }
    }

    pub async fn get(&self) -> Result<Arc<Browser>> {
        let mut slot = self.inner.lock().await;
        if let Some(browser) = slot.as_ref() {
            debug!("reusing browser session");
            return Ok(Arc::clone(browser));
        }
        let browser = match &self.cfg.ws_url {
            Some(ws) => Browser::connect(ws).await?,
            None => Browser::launch(self.cfg.clone()).await?,
        };
        info!(
            headless = self.cfg.headless,
            attached = self.cfg.ws_url.is_some(),
            "browser session started"
        );
        let browser = Arc::new(browser);
        *slot = Some(Arc::clone(&browser));
        Ok(browser)
    }
}
