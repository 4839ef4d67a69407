// Dual-channel send: programmatic API attempt first, UI attempt second.
//
// The UI path has to prove itself. After submission we poll for the text to
// leave the compose box AND show up as a rendered outgoing item. Failure
// markers and TLS trust errors on the realtime host end the wait early.
// Running out of time without either signal is a failure.

use std::future::Future;
use std::time::Duration;

use browser_session::BrowserError;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::probe::PageProbe;

/// Alert text that means the send was refused.
const FAILURE_MARKERS: &[(&str, &str)] = &[
    ("couldn't send", "send_failed_marker"),
    ("could not send", "send_failed_marker"),
    ("failed to send", "send_failed_marker"),
    ("not delivered", "send_failed_marker"),
    ("try again later", "rate_limited_marker"),
    ("message request", "request_interstitial"),
    ("we restrict certain activity", "restricted_activity"),
];

const TLS_ERROR_MARKERS: &[&str] = &["err_cert", "err_ssl", "certificate"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SendMethod {
    Api,
    Ui,
}

impl SendMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendMethod::Api => "api",
            SendMethod::Ui => "ui",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub posted: bool,
    /// The last channel attempted.
    pub method: Option<SendMethod>,
    /// Failure reason of the last attempt; `None` on success.
    pub reason: Option<String>,
    /// Why the API attempt was abandoned, when the UI path ran.
    pub api_reason: Option<String>,
    pub guidance: Option<String>,
}

/// Result of one UI attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiOutcome {
    Verified,
    NotSubmitted(String),
    Rejected(String),
    TransportBlocked { host: String, guidance: String },
    Unverified(String),
}

#[derive(Debug, Clone)]
pub struct VerifyConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub realtime_host: String,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(750),
            realtime_host: "edge-chat.instagram.com".to_string(),
        }
    }
}

/// Run `api` and, when it does not come back ok, the UI attempt built by
/// `ui`. The UI future is only created on fallback. Browser disconnects
/// propagate so the session-recovery layer can see them.
pub async fn execute<T, A, U, F>(action: &str, api: A, ui: U) -> browser_session::Result<ExecutionResult>
where
    A: Future<Output = story_api_client::Result<T>>,
    U: FnOnce() -> F,
    F: Future<Output = browser_session::Result<UiOutcome>>,
{
    let api_reason = match api.await {
        Ok(_) => {
            info!(action, method = "api", "Action posted");
            return Ok(ExecutionResult {
                posted: true,
                method: Some(SendMethod::Api),
                reason: None,
                api_reason: None,
                guidance: None,
            });
        }
        Err(e) => {
            let reason = e.reason_code();
            warn!(action, reason = %reason, "API attempt failed, falling back to UI");
            reason
        }
    };

    let outcome = match ui().await {
        Ok(outcome) => outcome,
        Err(e) if e.is_disconnect() => return Err(e),
        Err(e) => UiOutcome::NotSubmitted(format!("ui_error:{}", ui_error_code(&e))),
    };

    let mut result = ExecutionResult {
        posted: false,
        method: Some(SendMethod::Ui),
        reason: None,
        api_reason: Some(api_reason),
        guidance: None,
    };
    match outcome {
        UiOutcome::Verified => {
            result.posted = true;
            info!(action, method = "ui", "Action posted and verified");
        }
        UiOutcome::NotSubmitted(reason) => {
            result.reason = Some(format!("ui_not_submitted:{reason}"));
        }
        UiOutcome::Rejected(reason) => {
            result.reason = Some(format!("ui_rejected:{reason}"));
        }
        UiOutcome::TransportBlocked { host, guidance } => {
            warn!(action, host = %host, guidance = %guidance, "UI send blocked by TLS failure");
            result.reason = Some("ui_transport_blocked".to_string());
            result.guidance = Some(guidance);
        }
        UiOutcome::Unverified(reason) => {
            result.reason = Some(format!("ui_unverified:{reason}"));
        }
    }
    if !result.posted {
        warn!(action, reason = ?result.reason, "Action not posted");
    }
    Ok(result)
}

fn ui_error_code(e: &BrowserError) -> &'static str {
    match e {
        BrowserError::Disconnected(_) => "disconnected",
        BrowserError::Navigation { .. } => "navigation",
        BrowserError::Script(_) => "script",
        BrowserError::Protocol(_) => "protocol",
    }
}

/// Submit through `submit`, then verify.
pub async fn submit_and_verify<S>(
    probe: &dyn PageProbe,
    text: &str,
    submit: S,
    config: &VerifyConfig,
) -> browser_session::Result<UiOutcome>
where
    S: Future<Output = browser_session::Result<bool>>,
{
    if !submit.await? {
        return Ok(UiOutcome::NotSubmitted("compose_box_missing".to_string()));
    }
    verify_ui_send(probe, text, config).await
}

/// Poll until the send is proven, refused, or the window runs out.
pub async fn verify_ui_send(
    probe: &dyn PageProbe,
    text: &str,
    config: &VerifyConfig,
) -> browser_session::Result<UiOutcome> {
    let deadline = Instant::now() + config.timeout;
    let wanted = text.trim();

    loop {
        let alerts = probe.alert_text().await?;
        if let Some(reason) = failure_marker(&alerts) {
            return Ok(UiOutcome::Rejected(reason.to_string()));
        }

        let logs = probe.browser_logs().await?;
        if logs
            .iter()
            .any(|entry| is_tls_failure_on(&entry.message, entry.url.as_deref(), &config.realtime_host))
        {
            return Ok(UiOutcome::TransportBlocked {
                host: config.realtime_host.clone(),
                guidance: format!(
                    "TLS trust error on {}: the browser does not trust the realtime \
                     messaging certificate chain. Fix the browser's certificate store or \
                     remove the intercepting proxy before retrying UI sends.",
                    config.realtime_host
                ),
            });
        }

        let cleared = probe
            .compose_text()
            .await?
            .map_or(true, |current| !current.contains(wanted) || wanted.is_empty());
        let rendered = probe.outgoing_rendered(wanted).await?;
        if cleared && rendered {
            return Ok(UiOutcome::Verified);
        }

        if Instant::now() >= deadline {
            let reason = if cleared {
                "no_rendered_item"
            } else {
                "compose_not_cleared"
            };
            return Ok(UiOutcome::Unverified(reason.to_string()));
        }
        tokio::time::sleep(config.poll_interval).await;
    }
}

fn failure_marker(alerts: &[String]) -> Option<&'static str> {
    alerts.iter().find_map(|alert| {
        let lower = alert.to_lowercase().replace('\u{2019}', "'");
        FAILURE_MARKERS
            .iter()
            .find(|(marker, _)| lower.contains(marker))
            .map(|(_, reason)| *reason)
    })
}

fn is_tls_failure_on(message: &str, url: Option<&str>, host: &str) -> bool {
    let lower = message.to_lowercase();
    let host = host.to_lowercase();
    let on_host = lower.contains(&host) || url.is_some_and(|u| u.to_lowercase().contains(&host));
    on_host && TLS_ERROR_MARKERS.iter().any(|m| lower.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_markers_normalize_apostrophes() {
        let alerts = vec!["Couldn\u{2019}t send message. Tap to retry.".to_string()];
        assert_eq!(failure_marker(&alerts), Some("send_failed_marker"));
        assert_eq!(failure_marker(&["Sent".to_string()]), None);
    }

    #[test]
    fn tls_failure_must_be_on_realtime_host() {
        let host = "edge-chat.instagram.com";
        assert!(is_tls_failure_on(
            "WebSocket connection to 'wss://edge-chat.instagram.com/chat' failed: net::ERR_CERT_AUTHORITY_INVALID",
            None,
            host
        ));
        assert!(is_tls_failure_on(
            "net::ERR_SSL_PROTOCOL_ERROR",
            Some("wss://edge-chat.instagram.com/chat"),
            host
        ));
        assert!(!is_tls_failure_on(
            "net::ERR_CERT_DATE_INVALID",
            Some("https://cdn.example.com/a.jpg"),
            host
        ));
        assert!(!is_tls_failure_on("socket closed", Some("wss://edge-chat.instagram.com"), host));
    }
}
