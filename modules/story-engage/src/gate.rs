// Per-target, per-channel interaction state with time-boxed backoff.
//
// Reply capability resolves in three tiers: the API's `can_reply` flag, a
// short DOM probe for the reply box, then text markers in the viewer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use engage_common::{
    hard_negative_backoff, InteractionChannel, InteractionState, InteractionStatus, StoryItem,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::probe::{PageProbe, Probe};
use crate::store::EngagementStore;

/// Reasons that back off for the full window.
const HARD_NEGATIVES: &[&str] = &["api_can_reply_false", "replies_not_allowed", "not_messageable"];

/// Viewer text markers, checked in order.
const VIEWER_MARKERS: &[(&str, &str)] = &[
    ("replies turned off", "replies_not_allowed"),
    ("can't reply", "replies_not_allowed"),
    ("cannot reply", "replies_not_allowed"),
    ("not allowed to reply", "replies_not_allowed"),
    ("replies aren't available", "replies_not_allowed"),
    ("story unavailable", "story_unavailable"),
    ("no longer available", "story_unavailable"),
    ("unavailable", "reply_unavailable"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyCapability {
    /// Whether any tier gave a definite answer.
    pub known: bool,
    pub possible: bool,
    pub reason_code: String,
    pub status: InteractionStatus,
}

impl ReplyCapability {
    fn possible(reason: &str) -> Self {
        Self {
            known: true,
            possible: true,
            reason_code: reason.to_string(),
            status: InteractionStatus::ReplyAvailable,
        }
    }

    fn impossible(known: bool, reason: &str) -> Self {
        let status = if is_hard_negative(reason) {
            InteractionStatus::Unavailable
        } else {
            InteractionStatus::Unknown
        };
        Self {
            known,
            possible: false,
            reason_code: reason.to_string(),
            status,
        }
    }
}

pub fn is_hard_negative(reason: &str) -> bool {
    HARD_NEGATIVES.contains(&reason)
}

/// `true` while a hard negative is backing off.
pub fn retry_pending(state: &InteractionState, now: DateTime<Utc>) -> bool {
    state.retry_pending(now)
}

/// The state a transition produces. Hard negatives set `retry_after`;
/// every other status clears it.
pub fn next_state(
    status: InteractionStatus,
    reason: &str,
    reaction_available: Option<bool>,
    now: DateTime<Utc>,
) -> InteractionState {
    let retry_after =
        (status == InteractionStatus::Unavailable).then(|| now + hard_negative_backoff());
    InteractionState {
        status,
        reason: Some(reason.to_string()),
        checked_at: Some(now),
        retry_after,
        reaction_available,
    }
}

pub struct InteractionGate {
    store: Arc<dyn EngagementStore>,
    dom_timeout: Duration,
}

impl InteractionGate {
    pub fn new(store: Arc<dyn EngagementStore>, dom_timeout: Duration) -> Self {
        Self { store, dom_timeout }
    }

    pub async fn state(&self, subject: &str, channel: InteractionChannel) -> Result<InteractionState> {
        Ok(self
            .store
            .interaction_state(subject, channel)
            .await?
            .unwrap_or_default())
    }

    pub async fn is_backing_off(&self, subject: &str, channel: InteractionChannel) -> Result<bool> {
        let state = self.state(subject, channel).await?;
        Ok(retry_pending(&state, Utc::now()))
    }

    pub async fn mark_state(
        &self,
        subject: &str,
        channel: InteractionChannel,
        status: InteractionStatus,
        reason: &str,
        reaction_available: Option<bool>,
    ) -> Result<InteractionState> {
        let state = next_state(status, reason, reaction_available, Utc::now());
        self.store
            .save_interaction_state(subject, channel, &state)
            .await?;
        info!(
            subject,
            channel = channel.as_str(),
            status = status.as_str(),
            reason,
            retry_after = ?state.retry_after,
            "Interaction state updated"
        );
        Ok(state)
    }

    pub async fn reply_capability(
        &self,
        probe: &dyn PageProbe,
        item: &StoryItem,
    ) -> browser_session::Result<ReplyCapability> {
        if let Some(can_reply) = item.can_reply {
            return Ok(if can_reply {
                ReplyCapability::possible("api_can_reply_true")
            } else {
                ReplyCapability::impossible(true, "api_can_reply_false")
            });
        }

        match probe.reply_affordance(self.dom_timeout).await? {
            Probe::Found(()) => return Ok(ReplyCapability::possible("reply_box_found")),
            Probe::Ambiguous(detail) => {
                debug!(story_id = %item.story_id, detail, "Ambiguous reply affordance");
            }
            Probe::NotFound => {}
        }

        let text = probe.viewer_text().await?.unwrap_or_default();
        Ok(match viewer_marker(&text) {
            Some(reason) => ReplyCapability::impossible(true, reason),
            None => ReplyCapability::impossible(false, "reply_box_not_found"),
        })
    }
}

fn viewer_marker(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase().replace('\u{2019}', "'");
    VIEWER_MARKERS
        .iter()
        .find(|(marker, _)| lower.contains(marker))
        .map(|(_, reason)| *reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn hard_negative_sets_three_day_backoff() {
        let now = Utc::now();
        let state = next_state(InteractionStatus::Unavailable, "api_can_reply_false", Some(false), now);
        assert_eq!(state.retry_after, Some(now + ChronoDuration::days(3)));
        assert!(retry_pending(&state, now));
        assert!(retry_pending(&state, now + ChronoDuration::days(2)));
        assert!(!retry_pending(&state, now + ChronoDuration::days(3)));
    }

    #[test]
    fn soft_outcomes_clear_backoff() {
        let now = Utc::now();
        for status in [
            InteractionStatus::Unknown,
            InteractionStatus::ReactionOnly,
            InteractionStatus::ReplyAvailable,
        ] {
            let state = next_state(status, "x", None, now);
            assert_eq!(state.retry_after, None);
            assert!(!retry_pending(&state, now));
        }
    }

    #[test]
    fn viewer_markers_map_to_reasons() {
        assert_eq!(viewer_marker("Replies turned off"), Some("replies_not_allowed"));
        assert_eq!(viewer_marker("You can\u{2019}t reply to this story"), Some("replies_not_allowed"));
        assert_eq!(viewer_marker("This story is no longer available"), Some("story_unavailable"));
        assert_eq!(viewer_marker("alice 3h"), None);
    }

    #[test]
    fn capability_status_follows_reason_severity() {
        assert_eq!(
            ReplyCapability::impossible(true, "api_can_reply_false").status,
            InteractionStatus::Unavailable
        );
        assert_eq!(
            ReplyCapability::impossible(false, "reply_box_not_found").status,
            InteractionStatus::Unknown
        );
    }
}
