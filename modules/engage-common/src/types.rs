use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// --- Story snapshots ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
}

/// Where a `StoryItem` came from. `Dom` items are built from the live view
/// when the API lookup returned nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemSource {
    Api,
    Dom,
}

/// Immutable snapshot of one story. Identity is `(owner_username, story_id)`.
/// Rebuilt on every resolution; never persisted directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryItem {
    pub story_id: String,
    pub owner_username: String,
    pub owner_user_id: Option<String>,
    pub media_type: MediaType,
    pub media_url: Option<String>,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// `None` means the API did not say.
    pub can_reply: Option<bool>,
    pub can_reshare: Option<bool>,
    pub taken_at: Option<DateTime<Utc>>,
    pub expiring_at: Option<DateTime<Utc>>,
    pub permalink: String,
    pub attribution_targets: Vec<String>,
    pub source: ItemSource,
    /// Raw API entry, kept for structural attribution checks.
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl StoryItem {
    pub fn is_video(&self) -> bool {
        self.media_type == MediaType::Video
    }

    /// Build a best-effort item from the live carousel view.
    pub fn from_context(ctx: &CarouselContext) -> Option<Self> {
        let username = ctx.username.clone()?;
        let story_id = ctx
            .story_id
            .clone()
            .or_else(|| ctx.story_key())
            .unwrap_or_default();
        let media_type = if ctx.is_video {
            MediaType::Video
        } else {
            MediaType::Image
        };
        Some(Self {
            permalink: story_permalink(&username, &story_id),
            story_id,
            owner_username: username,
            owner_user_id: None,
            media_type,
            media_url: ctx.media_url.clone(),
            image_url: (!ctx.is_video).then(|| ctx.media_url.clone()).flatten(),
            video_url: ctx.is_video.then(|| ctx.media_url.clone()).flatten(),
            width: None,
            height: None,
            can_reply: None,
            can_reshare: None,
            taken_at: None,
            expiring_at: None,
            attribution_targets: Vec::new(),
            source: ItemSource::Dom,
            raw: serde_json::Value::Null,
        })
    }
}

pub fn story_permalink(username: &str, story_id: &str) -> String {
    format!("https://www.instagram.com/stories/{username}/{story_id}/")
}

/// Transient view of "the story currently on screen", derived every tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CarouselContext {
    /// Story reference as exposed by the viewer (usually the URL path id).
    pub story_ref: Option<String>,
    pub username: Option<String>,
    pub story_id: Option<String>,
    pub url: Option<String>,
    pub media_url: Option<String>,
    pub media_signature: Option<String>,
    pub is_video: bool,
    pub viewer_active: bool,
    pub frame_visually_present: bool,
}

impl CarouselContext {
    /// Usable for processing: viewer open and an owner is known.
    pub fn is_resolved(&self) -> bool {
        self.viewer_active && self.username.as_deref().is_some_and(|u| !u.is_empty())
    }

    /// Dedup identity. Prefers the story id; falls back to owner plus a
    /// signature of the rendered media.
    pub fn story_key(&self) -> Option<String> {
        let username = self.username.as_deref().filter(|u| !u.is_empty())?;
        if let Some(id) = self.story_id.as_deref().filter(|id| !id.is_empty()) {
            return Some(format!("{username}:{id}"));
        }
        let signature = self.media_signature.clone().or_else(|| {
            self.media_url
                .as_deref()
                .and_then(normalize_media_url)
                .map(|u| format!("{:016x}", content_hash(&u)))
        })?;
        Some(format!("{username}:sig:{signature}"))
    }
}

// --- Interaction state ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionChannel {
    StoryReply,
    DirectMessage,
}

impl InteractionChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionChannel::StoryReply => "story_reply",
            InteractionChannel::DirectMessage => "direct_message",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "story_reply" => Some(InteractionChannel::StoryReply),
            "direct_message" => Some(InteractionChannel::DirectMessage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionStatus {
    #[default]
    Unknown,
    ReplyAvailable,
    ReactionOnly,
    Unavailable,
    Messageable,
}

impl InteractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionStatus::Unknown => "unknown",
            InteractionStatus::ReplyAvailable => "reply_available",
            InteractionStatus::ReactionOnly => "reaction_only",
            InteractionStatus::Unavailable => "unavailable",
            InteractionStatus::Messageable => "messageable",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "reply_available" => InteractionStatus::ReplyAvailable,
            "reaction_only" => InteractionStatus::ReactionOnly,
            "unavailable" => InteractionStatus::Unavailable,
            "messageable" => InteractionStatus::Messageable,
            _ => InteractionStatus::Unknown,
        }
    }
}

/// Per target, per channel. Persists across runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionState {
    pub status: InteractionStatus,
    pub reason: Option<String>,
    pub checked_at: Option<DateTime<Utc>>,
    pub retry_after: Option<DateTime<Utc>>,
    pub reaction_available: Option<bool>,
}

impl InteractionState {
    /// True while a hard negative is still backing off.
    pub fn retry_pending(&self, now: DateTime<Utc>) -> bool {
        self.status == InteractionStatus::Unavailable
            && self.retry_after.is_some_and(|at| at > now)
    }
}

// --- Ledger ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    StoryReplySent,
    StoryReplyFailed,
    StoryReactionSent,
    StoryReactionFailed,
    StorySkipped,
    StoryMediaDownloaded,
    StoryProcessingFailed,
    TraversalEnded,
    DirectMessageSent,
    DirectMessageFailed,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::StoryReplySent => "story_reply_sent",
            LedgerKind::StoryReplyFailed => "story_reply_failed",
            LedgerKind::StoryReactionSent => "story_reaction_sent",
            LedgerKind::StoryReactionFailed => "story_reaction_failed",
            LedgerKind::StorySkipped => "story_skipped",
            LedgerKind::StoryMediaDownloaded => "story_media_downloaded",
            LedgerKind::StoryProcessingFailed => "story_processing_failed",
            LedgerKind::TraversalEnded => "traversal_ended",
            LedgerKind::DirectMessageSent => "direct_message_sent",
            LedgerKind::DirectMessageFailed => "direct_message_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "story_reply_sent" => LedgerKind::StoryReplySent,
            "story_reply_failed" => LedgerKind::StoryReplyFailed,
            "story_reaction_sent" => LedgerKind::StoryReactionSent,
            "story_reaction_failed" => LedgerKind::StoryReactionFailed,
            "story_skipped" => LedgerKind::StorySkipped,
            "story_media_downloaded" => LedgerKind::StoryMediaDownloaded,
            "story_processing_failed" => LedgerKind::StoryProcessingFailed,
            "traversal_ended" => LedgerKind::TraversalEnded,
            "direct_message_sent" => LedgerKind::DirectMessageSent,
            "direct_message_failed" => LedgerKind::DirectMessageFailed,
            _ => return None,
        })
    }

    /// Kinds whose id is the story id alone; the rest get a timestamp suffix.
    pub fn is_unique_per_story(&self) -> bool {
        matches!(
            self,
            LedgerKind::StoryReplySent
                | LedgerKind::StoryReactionSent
                | LedgerKind::StoryMediaDownloaded
        )
    }
}

impl fmt::Display for LedgerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only outcome record. `subject` is the target account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub subject: String,
    pub kind: LedgerKind,
    pub external_id: String,
    pub occurred_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

// --- Media + profiles ---

/// Downloaded media, consumed immediately by storage and the quality filter.
#[derive(Debug, Clone)]
pub struct MediaAsset {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub filename: String,
    pub final_url: String,
}

/// Persisted profile facts the pipeline reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub username: String,
    pub user_id: Option<String>,
    pub following: bool,
    pub follows_you: bool,
    pub auto_reply: bool,
}

impl ProfileRecord {
    pub fn in_network(&self) -> bool {
        self.following || self.follows_you
    }
}

// --- Helpers ---

/// Host- and query-insensitive identity of a media URL (lowercased path).
pub fn normalize_media_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let path = match url::Url::parse(raw) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => raw
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };
    let path = path.trim_end_matches('/').to_lowercase();
    (!path.is_empty()).then_some(path)
}

pub fn content_hash(content: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}

/// Hard-negative backoff window.
pub fn hard_negative_backoff() -> Duration {
    Duration::days(3)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(username: &str) -> CarouselContext {
        CarouselContext {
            username: Some(username.to_string()),
            viewer_active: true,
            ..Default::default()
        }
    }

    #[test]
    fn story_key_prefers_story_id() {
        let mut c = ctx("alice");
        c.story_id = Some("3301".into());
        c.media_signature = Some("abcd".into());
        assert_eq!(c.story_key().as_deref(), Some("alice:3301"));
    }

    #[test]
    fn story_key_falls_back_to_signature_then_media_url() {
        let mut c = ctx("alice");
        c.media_signature = Some("ffee".into());
        assert_eq!(c.story_key().as_deref(), Some("alice:sig:ffee"));

        let mut a = ctx("alice");
        a.media_url = Some("https://cdn-a.example.com/v/t51/1.jpg?x=1".into());
        let mut b = ctx("alice");
        b.media_url = Some("https://cdn-b.example.com/v/t51/1.jpg?x=2".into());
        assert_eq!(a.story_key(), b.story_key());
        assert!(a.story_key().is_some());
    }

    #[test]
    fn story_key_requires_username() {
        let c = CarouselContext {
            story_id: Some("1".into()),
            ..Default::default()
        };
        assert_eq!(c.story_key(), None);
        assert!(!c.is_resolved());
    }

    #[test]
    fn retry_pending_only_for_future_unavailable() {
        let now = Utc::now();
        let mut state = InteractionState {
            status: InteractionStatus::Unavailable,
            retry_after: Some(now + Duration::hours(1)),
            ..Default::default()
        };
        assert!(state.retry_pending(now));

        state.retry_after = Some(now - Duration::seconds(1));
        assert!(!state.retry_pending(now));

        state.retry_after = Some(now + Duration::hours(1));
        state.status = InteractionStatus::ReactionOnly;
        assert!(!state.retry_pending(now));
    }

    #[test]
    fn normalize_media_url_drops_host_and_query() {
        assert_eq!(
            normalize_media_url("https://Scontent.Example.com/V/abc.JPG?stp=1#f").as_deref(),
            Some("/v/abc.jpg")
        );
        assert_eq!(normalize_media_url("  "), None);
        assert_eq!(normalize_media_url("/v/x.jpg?y").as_deref(), Some("/v/x.jpg"));
    }

    #[test]
    fn ledger_kind_round_trips_through_str() {
        for kind in [
            LedgerKind::StoryReplySent,
            LedgerKind::StorySkipped,
            LedgerKind::TraversalEnded,
            LedgerKind::DirectMessageFailed,
        ] {
            assert_eq!(LedgerKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(LedgerKind::parse("nope"), None);
    }

    #[test]
    fn item_from_context_marks_dom_source() {
        let mut c = ctx("bob");
        c.story_id = Some("77".into());
        c.media_url = Some("https://cdn.example.com/a.mp4".into());
        c.is_video = true;
        let item = StoryItem::from_context(&c).unwrap();
        assert_eq!(item.source, ItemSource::Dom);
        assert!(item.is_video());
        assert_eq!(item.video_url.as_deref(), Some("https://cdn.example.com/a.mp4"));
        assert_eq!(item.image_url, None);
        assert_eq!(item.permalink, "https://www.instagram.com/stories/bob/77/");
    }
}
