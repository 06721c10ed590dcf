use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_ORACLE_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4.1";
pub const DEFAULT_MAX_STEPS: u32 = 25;
pub const MAX_STEPS_LIMIT: u32 = 100;
pub const DEFAULT_POST_ACTION_DELAY_MS: u64 = 750;
pub const DEFAULT_HISTORY_WINDOW: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Detail level requested for the screenshot sent to the decision oracle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageDetail {
    Low,
    #[default]
    High,
    Auto,
}

impl ImageDetail {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageDetail::Low => "low",
            ImageDetail::High => "high",
            ImageDetail::Auto => "auto",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "low" => Some(ImageDetail::Low),
            "high" => Some(ImageDetail::High),
            "auto" => Some(ImageDetail::Auto),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct OracleConfig {
    pub api_base: String,
    /// `None` when no credential is configured; jobs then fail at setup.
    pub api_key: Option<String>,
    pub model: String,
    pub image_detail: ImageDetail,
}

#[derive(Clone, Debug)]
pub struct AgentDefaults {
    pub max_steps: u32,
    pub post_action_delay: Duration,
    pub history_window: usize,
}

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub port: u16,
    pub auth_token: String,
    pub remote_base_url: String,
    pub remote_token: String,
    pub oracle: OracleConfig,
    pub agent: AgentDefaults,
    pub cliclick_path: Option<PathBuf>,
    pub chrome_ws_url: Option<String>,
    pub browser_headless: bool,
    pub artifacts_dir: PathBuf,
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key).and_then(|v| {
                let trimmed = v.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            })
        };

        let mut missing = Vec::new();
        let mut require = |key: &'static str| {
            let value = get(key);
            if value.is_none() {
                missing.push(key);
            }
            value.unwrap_or_default()
        };
        let auth_token = require("MCP_AUTH_TOKEN");
        let remote_base_url = require("REMOTE_BASE_URL");
        let remote_token = require("REMOTE_API_TOKEN");
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        url::Url::parse(&remote_base_url).map_err(|e| ConfigError::Invalid {
            name: "REMOTE_BASE_URL",
            reason: e.to_string(),
        })?;

        let port = parse_or("PORT", get("PORT"), DEFAULT_PORT)?;
        let max_steps: u32 =
            parse_or("AGENT_MAX_STEPS", get("AGENT_MAX_STEPS"), DEFAULT_MAX_STEPS)?;
        let delay_ms = parse_or(
            "AGENT_POST_ACTION_DELAY_MS",
            get("AGENT_POST_ACTION_DELAY_MS"),
            DEFAULT_POST_ACTION_DELAY_MS,
        )?;
        let history_window: usize = parse_or(
            "AGENT_HISTORY_WINDOW",
            get("AGENT_HISTORY_WINDOW"),
            DEFAULT_HISTORY_WINDOW,
        )?;
        let image_detail = match get("AGENT_IMAGE_DETAIL") {
            Some(raw) => ImageDetail::parse(&raw).ok_or_else(|| ConfigError::Invalid {
                name: "AGENT_IMAGE_DETAIL",
                reason: format!("expected low, high or auto, got {raw:?}"),
            })?,
            None => ImageDetail::default(),
        };
        let browser_headless = match get("BROWSER_HEADLESS") {
            Some(raw) => matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
            None => false,
        };

        Ok(Self {
            port,
            auth_token,
            remote_base_url: remote_base_url.trim_end_matches('/').to_string(),
            remote_token,
            oracle: OracleConfig {
                api_base: get("OPENAI_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_ORACLE_BASE.into())
                    .trim_end_matches('/')
                    .to_string(),
                api_key: get("OPENAI_API_KEY"),
                model: get("AGENT_MODEL").unwrap_or_else(|| DEFAULT_MODEL.into()),
                image_detail,
            },
            agent: AgentDefaults {
                max_steps: max_steps.clamp(1, MAX_STEPS_LIMIT),
                post_action_delay: Duration::from_millis(delay_ms),
                history_window: history_window.max(1),
            },
            cliclick_path: get("CLICLICK_PATH").map(PathBuf::from),
            chrome_ws_url: get("CHROME_WS_URL"),
            browser_headless,
            artifacts_dir: get("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| env::temp_dir().join("glass-bridge")),
        })
    }
}

fn parse_or<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("MCP_AUTH_TOKEN", "secret"),
        ("REMOTE_BASE_URL", "https://messages.example.com/"),
        ("REMOTE_API_TOKEN", "remote"),
    ];

    #[test]
    fn reports_every_missing_secret() {
        let err = BridgeConfig::from_lookup(lookup(&[("REMOTE_API_TOKEN", "x")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing(vec!["MCP_AUTH_TOKEN", "REMOTE_BASE_URL"]));
    }

    #[test]
    fn blank_values_count_as_missing() {
        let err = BridgeConfig::from_lookup(lookup(&[
            ("MCP_AUTH_TOKEN", "  "),
            ("REMOTE_BASE_URL", "https://x.test"),
            ("REMOTE_API_TOKEN", "x"),
        ]))
        .unwrap_err();
        assert_eq!(err, ConfigError::Missing(vec!["MCP_AUTH_TOKEN"]));
    }

    #[test]
    fn applies_defaults() {
        let cfg = BridgeConfig::from_lookup(lookup(&REQUIRED)).unwrap();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.remote_base_url, "https://messages.example.com");
        assert_eq!(cfg.oracle.api_key, None);
        assert_eq!(cfg.oracle.model, DEFAULT_MODEL);
        assert_eq!(cfg.oracle.image_detail, ImageDetail::High);
        assert_eq!(cfg.agent.max_steps, DEFAULT_MAX_STEPS);
        assert_eq!(cfg.agent.history_window, 8);
        assert!(!cfg.browser_headless);
    }

    #[test]
    fn clamps_step_budget_and_rejects_bad_detail() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("AGENT_MAX_STEPS", "500"));
        let cfg = BridgeConfig::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(cfg.agent.max_steps, MAX_STEPS_LIMIT);

        pairs.push(("AGENT_IMAGE_DETAIL", "ultra"));
        let err = BridgeConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "AGENT_IMAGE_DETAIL", .. }));
    }

    #[test]
    fn rejects_unparseable_remote_url() {
        let err = BridgeConfig::from_lookup(lookup(&[
            ("MCP_AUTH_TOKEN", "a"),
            ("REMOTE_BASE_URL", "not a url"),
            ("REMOTE_API_TOKEN", "b"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "REMOTE_BASE_URL", .. }));
    }
}
