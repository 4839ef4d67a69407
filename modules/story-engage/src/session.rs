// Recoverable-session wrapper. The only place in the pipeline that retries:
// a browser disconnect is retried after reconnecting, everything else is
// returned to the caller on the first failure.

use std::future::Future;
use std::time::Duration;

use browser_session::Result;
use tracing::{info, warn};

use crate::probe::PageProbe;

#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff: Duration::from_secs(1),
        }
    }
}

pub async fn with_session_recovery<T, F, Fut>(
    probe: &dyn PageProbe,
    label: &str,
    policy: &RecoveryPolicy,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_disconnect() && attempt + 1 < max_attempts => {
                attempt += 1;
                warn!(
                    label,
                    attempt,
                    error = %e,
                    "Browser session disconnected, reconnecting"
                );
                tokio::time::sleep(policy.backoff).await;
                if let Err(reconnect_err) = probe.reconnect().await {
                    warn!(label, error = %reconnect_err, "Reconnect failed");
                    return Err(reconnect_err);
                }
                info!(label, "Browser session reconnected");
            }
            other => return other,
        }
    }
}
