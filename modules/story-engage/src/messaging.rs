// Direct messages through the same dual-channel executor as story replies,
// gated by the `direct_message` interaction channel.

use std::sync::Arc;

use anyhow::Result;
use engage_common::{InteractionChannel, InteractionStatus, LedgerKind};
use serde_json::json;
use story_api_client::ApiError;
use tracing::info;

use crate::context::RunContext;
use crate::executor::{self, ExecutionResult, UiOutcome, VerifyConfig};
use crate::gate::InteractionGate;
use crate::ledger::EngagementLedger;
use crate::probe::PageProbe;
use crate::resolver::StoryResolver;
use crate::store::EngagementStore;
use crate::traits::StoryApi;
use crate::traversal::thread_for;

/// UI reason meaning the profile offers no message entry point.
const THREAD_UNAVAILABLE: &str = "thread_unavailable";

pub struct DirectMessenger {
    api: Arc<dyn StoryApi>,
    probe: Arc<dyn PageProbe>,
    gate: InteractionGate,
    ledger: EngagementLedger,
    verify: VerifyConfig,
}

impl DirectMessenger {
    pub fn new(
        api: Arc<dyn StoryApi>,
        probe: Arc<dyn PageProbe>,
        store: Arc<dyn EngagementStore>,
        verify: VerifyConfig,
    ) -> Self {
        Self {
            api,
            probe,
            gate: InteractionGate::new(store.clone(), std::time::Duration::from_secs(6)),
            ledger: EngagementLedger::new(store),
            verify,
        }
    }

    pub async fn send(
        &self,
        ctx: &mut RunContext,
        username: &str,
        text: &str,
    ) -> Result<ExecutionResult> {
        if self
            .gate
            .is_backing_off(username, InteractionChannel::DirectMessage)
            .await?
        {
            info!(username, "Direct message skipped, backoff active");
            return Ok(ExecutionResult {
                posted: false,
                method: None,
                reason: Some("backoff_active".to_string()),
                api_reason: None,
                guidance: None,
            });
        }

        let resolver = StoryResolver::new(self.api.as_ref());
        let user_id = resolver.user_id(ctx, username).await;

        let api = self.api.as_ref();
        let api_attempt = async move {
            let user_id = user_id.ok_or(ApiError::MissingCredential("user_id"))?;
            let thread_id = thread_for(api, ctx, &user_id).await?;
            api.send_text(&thread_id, text).await
        };

        let probe = self.probe.as_ref();
        let verify = &self.verify;
        let result = executor::execute("direct_message", api_attempt, move || async move {
            if !probe.open_direct_thread(username).await? {
                return Ok(UiOutcome::NotSubmitted(THREAD_UNAVAILABLE.to_string()));
            }
            executor::submit_and_verify(probe, text, probe.submit_direct_message(text), verify)
                .await
        })
        .await?;

        let metadata = json!({
            "method": result.method,
            "reason": result.reason,
            "api_reason": result.api_reason,
            "guidance": result.guidance,
            "text": text,
        });

        if result.posted {
            self.ledger
                .record(username, LedgerKind::DirectMessageSent, username, metadata)
                .await;
            self.gate
                .mark_state(
                    username,
                    InteractionChannel::DirectMessage,
                    InteractionStatus::Messageable,
                    "dm_sent",
                    None,
                )
                .await?;
        } else {
            self.ledger
                .record(username, LedgerKind::DirectMessageFailed, username, metadata)
                .await;
            let unavailable = result
                .reason
                .as_deref()
                .is_some_and(|r| r.ends_with(THREAD_UNAVAILABLE));
            let (status, reason) = if unavailable {
                (InteractionStatus::Unavailable, "not_messageable")
            } else {
                (
                    InteractionStatus::Unknown,
                    result.reason.as_deref().unwrap_or("dm_not_sent"),
                )
            };
            self.gate
                .mark_state(username, InteractionChannel::DirectMessage, status, reason, None)
                .await?;
        }
        Ok(result)
    }
}
