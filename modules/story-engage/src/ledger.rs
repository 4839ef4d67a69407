// Append-only outcome log. The ledger is the only record of "already acted
// on this story"; duplicate suppression is done by the caller through
// `prior_reply`, which matches on four independent keys.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use engage_common::{normalize_media_url, CarouselContext, LedgerEntry, LedgerKind, StoryItem};
use serde_json::{json, Value};
use tracing::warn;

use crate::ranker::HISTORY_WINDOW;
use crate::store::EngagementStore;

/// How far back reply entries are scanned for duplicates.
const PRIOR_REPLY_SCAN: usize = 500;

/// The four identities a story can be re-seen under.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyKeys {
    pub story_id: Option<String>,
    pub story_ref: Option<String>,
    pub permalink: Option<String>,
    pub media_key: Option<String>,
}

impl ReplyKeys {
    pub fn for_story(item: &StoryItem, context: Option<&CarouselContext>) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self {
            story_id: non_empty(&item.story_id),
            story_ref: context
                .and_then(|c| c.story_ref.clone())
                .filter(|r| !r.is_empty()),
            permalink: non_empty(&item.permalink),
            media_key: item
                .media_url
                .as_deref()
                .or(context.and_then(|c| c.media_url.as_deref()))
                .and_then(normalize_media_url),
        }
    }

    /// Metadata fields written on reply entries so later runs can match them.
    pub fn to_metadata(&self) -> Value {
        json!({
            "story_id": self.story_id,
            "story_ref": self.story_ref,
            "permalink": self.permalink,
            "media_key": self.media_key,
        })
    }

    /// Name of the first key that matches `metadata`, in id, ref, permalink,
    /// media order.
    pub fn matches(&self, metadata: &Value) -> Option<&'static str> {
        let field = |name: &str| metadata.get(name).and_then(Value::as_str);
        let same = |mine: &Option<String>, name: &str| {
            mine.as_deref().is_some_and(|m| field(name) == Some(m))
        };
        if same(&self.story_id, "story_id") {
            return Some("story_id");
        }
        if let Some(r) = self.story_ref.as_deref() {
            if field("story_ref") == Some(r) || field("story_id") == Some(r) {
                return Some("story_ref");
            }
        }
        if same(&self.permalink, "permalink") {
            return Some("permalink");
        }
        if same(&self.media_key, "media_key") {
            return Some("media_url");
        }
        None
    }
}

/// `kind:story_id` for kinds that happen once per story; everything else
/// gets a microsecond suffix.
pub fn external_id(kind: LedgerKind, key: &str, at: DateTime<Utc>) -> String {
    if kind.is_unique_per_story() {
        format!("{}:{}", kind.as_str(), key)
    } else {
        format!("{}:{}:{}", kind.as_str(), key, at.timestamp_micros())
    }
}

#[derive(Clone)]
pub struct EngagementLedger {
    store: Arc<dyn EngagementStore>,
}

impl EngagementLedger {
    pub fn new(store: Arc<dyn EngagementStore>) -> Self {
        Self { store }
    }

    pub async fn append(
        &self,
        subject: &str,
        kind: LedgerKind,
        external_id: String,
        occurred_at: DateTime<Utc>,
        metadata: Value,
    ) -> Result<bool> {
        let entry = LedgerEntry {
            subject: subject.to_string(),
            kind,
            external_id,
            occurred_at,
            metadata,
        };
        self.store.append_entry(&entry).await
    }

    /// Append with a derived external id. A failed write is logged, not
    /// propagated; the outcome it describes has already happened.
    pub async fn record(&self, subject: &str, kind: LedgerKind, key: &str, metadata: Value) -> bool {
        let now = Utc::now();
        let id = external_id(kind, key, now);
        match self.append(subject, kind, id, now, metadata).await {
            Ok(written) => written,
            Err(e) => {
                warn!(subject, kind = %kind, error = %e, "Failed to record ledger entry");
                false
            }
        }
    }

    /// A prior successful reply to the same story, with the key that matched.
    pub async fn prior_reply(
        &self,
        subject: &str,
        keys: &ReplyKeys,
    ) -> Result<Option<(LedgerEntry, &'static str)>> {
        let entries = self
            .store
            .entries(subject, LedgerKind::StoryReplySent, PRIOR_REPLY_SCAN)
            .await?;
        Ok(entries
            .into_iter()
            .find_map(|e| keys.matches(&e.metadata).map(|k| (e, k))))
    }

    /// Most recent sent comment texts for a target, newest first.
    pub async fn recent_comments(&self, subject: &str) -> Result<Vec<String>> {
        let entries = self
            .store
            .entries(subject, LedgerKind::StoryReplySent, HISTORY_WINDOW)
            .await?;
        Ok(entries
            .into_iter()
            .filter_map(|e| {
                e.metadata
                    .get("comment_text")
                    .and_then(Value::as_str)
                    .map(String::from)
            })
            .collect())
    }

    /// Attach the sent comment to the story's download entry.
    pub async fn annotate_download(&self, subject: &str, story_id: &str, comment: &str) -> bool {
        let id = external_id(LedgerKind::StoryMediaDownloaded, story_id, Utc::now());
        match self
            .store
            .annotate_entry(
                subject,
                LedgerKind::StoryMediaDownloaded,
                &id,
                &json!({ "comment_text": comment }),
            )
            .await
        {
            Ok(found) => found,
            Err(e) => {
                warn!(subject, story_id, error = %e, "Failed to annotate download entry");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use engage_common::{ItemSource, MediaType};

    fn item(story_id: &str, media_url: &str) -> StoryItem {
        StoryItem {
            story_id: story_id.into(),
            owner_username: "alice".into(),
            owner_user_id: Some("1".into()),
            media_type: MediaType::Image,
            media_url: Some(media_url.into()),
            image_url: Some(media_url.into()),
            video_url: None,
            width: None,
            height: None,
            can_reply: None,
            can_reshare: None,
            taken_at: None,
            expiring_at: None,
            permalink: engage_common::story_permalink("alice", story_id),
            attribution_targets: Vec::new(),
            source: ItemSource::Api,
            raw: Value::Null,
        }
    }

    #[test]
    fn unique_kinds_have_stable_ids() {
        let now = Utc::now();
        assert_eq!(
            external_id(LedgerKind::StoryReplySent, "33", now),
            "story_reply_sent:33"
        );
        let skipped = external_id(LedgerKind::StorySkipped, "33", now);
        assert!(skipped.starts_with("story_skipped:33:"));
        assert!(skipped.ends_with(&now.timestamp_micros().to_string()));
    }

    #[tokio::test]
    async fn prior_reply_matches_any_of_four_keys() {
        let ledger = EngagementLedger::new(Arc::new(MemoryStore::new()));
        let sent = ReplyKeys::for_story(&item("100", "https://cdn-a.example.com/v/p.jpg?x=1"), None);
        let mut meta = sent.to_metadata();
        meta["comment_text"] = json!("love it");
        ledger
            .record("alice", LedgerKind::StoryReplySent, "100", meta)
            .await;

        // Same story id.
        let same = ReplyKeys::for_story(&item("100", "https://other/x.jpg"), None);
        assert_eq!(ledger.prior_reply("alice", &same).await.unwrap().unwrap().1, "story_id");

        // Different id, same media path on another CDN host.
        let moved = ReplyKeys::for_story(&item("999", "https://cdn-b.example.com/v/P.jpg?x=2"), None);
        assert_eq!(ledger.prior_reply("alice", &moved).await.unwrap().unwrap().1, "media_url");

        let fresh = ReplyKeys::for_story(&item("555", "https://cdn.example.com/v/q.jpg"), None);
        assert!(ledger.prior_reply("alice", &fresh).await.unwrap().is_none());
        assert!(ledger.prior_reply("bob", &same).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn story_ref_matches_stored_id() {
        let ledger = EngagementLedger::new(Arc::new(MemoryStore::new()));
        let sent = ReplyKeys::for_story(&item("100", "https://cdn/a.jpg"), None);
        ledger
            .record("alice", LedgerKind::StoryReplySent, "100", sent.to_metadata())
            .await;

        let keys = ReplyKeys {
            story_ref: Some("100".into()),
            ..Default::default()
        };
        assert_eq!(ledger.prior_reply("alice", &keys).await.unwrap().unwrap().1, "story_ref");
    }

    #[tokio::test]
    async fn recent_comments_and_annotation() {
        let store = Arc::new(MemoryStore::new());
        let ledger = EngagementLedger::new(store.clone());
        ledger
            .record(
                "alice",
                LedgerKind::StoryMediaDownloaded,
                "7",
                json!({"story_id": "7"}),
            )
            .await;
        ledger
            .record(
                "alice",
                LedgerKind::StoryReplySent,
                "7",
                json!({"story_id": "7", "comment_text": "what a view"}),
            )
            .await;
        assert!(ledger.annotate_download("alice", "7", "what a view").await);

        assert_eq!(
            ledger.recent_comments("alice").await.unwrap(),
            vec!["what a view".to_string()]
        );
        let downloaded = store
            .all_entries()
            .into_iter()
            .find(|e| e.kind == LedgerKind::StoryMediaDownloaded)
            .unwrap();
        assert_eq!(downloaded.metadata["comment_text"], "what a view");
    }

    #[tokio::test]
    async fn re_recording_a_reply_does_not_change_dedup_answer() {
        let ledger = EngagementLedger::new(Arc::new(MemoryStore::new()));
        let keys = ReplyKeys::for_story(&item("100", "https://cdn/a.jpg"), None);
        assert!(ledger
            .record("alice", LedgerKind::StoryReplySent, "100", keys.to_metadata())
            .await);
        assert!(!ledger
            .record("alice", LedgerKind::StoryReplySent, "100", keys.to_metadata())
            .await);
        assert!(ledger.prior_reply("alice", &keys).await.unwrap().is_some());
    }
}
