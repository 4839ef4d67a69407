use std::env;
use std::path::PathBuf;

use tracing::info;

use crate::error::EngageError;

const DEFAULT_API_BASE_URL: &str = "https://www.instagram.com/api/v1";
const DEFAULT_WEB_BASE_URL: &str = "https://www.instagram.com";
const DEFAULT_APP_ID: &str = "936619743392459";
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const DEFAULT_REALTIME_HOST: &str = "edge-chat.instagram.com";

/// Application configuration loaded from environment variables.
#[derive(Clone)]
pub struct Config {
    /// Username of the automated account.
    pub account: String,
    /// Raw `Cookie` header captured at login.
    pub session_cookies: String,

    pub api_base_url: String,
    pub web_base_url: String,
    pub app_id: String,
    pub user_agent: String,

    /// DevTools websocket (local Chrome or Browserless).
    pub browser_ws_url: String,
    /// Host of the realtime messaging socket, watched for TLS failures.
    pub realtime_host: String,

    /// Analysis + comment generation service.
    pub analysis_url: String,

    /// Postgres; the in-memory store is used when unset.
    pub database_url: Option<String>,
    pub media_dir: PathBuf,
    pub story_pacing_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, EngageError> {
        Ok(Self {
            account: required_env("ENGAGE_ACCOUNT")?,
            session_cookies: required_env("SESSION_COOKIES")?,
            api_base_url: env_or("API_BASE_URL", DEFAULT_API_BASE_URL),
            web_base_url: env_or("WEB_BASE_URL", DEFAULT_WEB_BASE_URL),
            app_id: env_or("API_APP_ID", DEFAULT_APP_ID),
            user_agent: env_or("USER_AGENT", DEFAULT_USER_AGENT),
            browser_ws_url: required_env("BROWSER_WS_URL")?,
            realtime_host: env_or("REALTIME_HOST", DEFAULT_REALTIME_HOST),
            analysis_url: required_env("ANALYSIS_URL")?,
            database_url: env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            media_dir: PathBuf::from(env_or("MEDIA_DIR", "./media")),
            story_pacing_ms: env_or("STORY_PACING_MS", "2500")
                .parse()
                .map_err(|_| EngageError::Config("STORY_PACING_MS must be a number".into()))?,
        })
    }

    /// Log the effective configuration without secrets.
    pub fn log_redacted(&self) {
        info!(
            account = %self.account,
            api_base_url = %self.api_base_url,
            browser_ws_url = %redact_url(&self.browser_ws_url),
            analysis_url = %self.analysis_url,
            database = self.database_url.is_some(),
            media_dir = %self.media_dir.display(),
            story_pacing_ms = self.story_pacing_ms,
            "Loaded configuration"
        );
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("account", &self.account)
            .field("api_base_url", &self.api_base_url)
            .field("browser_ws_url", &redact_url(&self.browser_ws_url))
            .field("analysis_url", &self.analysis_url)
            .field("media_dir", &self.media_dir)
            .finish_non_exhaustive()
    }
}

fn required_env(key: &str) -> Result<String, EngageError> {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| EngageError::Config(format!("{key} environment variable is required")))
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Browserless URLs carry the token as a query parameter.
fn redact_url(raw: &str) -> String {
    match raw.split_once('?') {
        Some((base, _)) => format!("{base}?<redacted>"),
        None => raw.to_string(),
    }
}
