// Resolves a target's current stories through the API and normalizes each
// raw reel entry into a `StoryItem`.
//
// Lookups are memoized on the RunContext. Any failure yields an empty list,
// which callers treat as "unknown", not "no stories".

use chrono::{DateTime, Utc};
use engage_common::{story_permalink, ItemSource, MediaType, StoryItem};
use serde_json::Value;
use story_api_client::ProfileInfo;
use tracing::{debug, warn};

use crate::attribution;
use crate::context::RunContext;
use crate::traits::StoryApi;

pub struct StoryResolver<'a> {
    api: &'a dyn StoryApi,
}

impl<'a> StoryResolver<'a> {
    pub fn new(api: &'a dyn StoryApi) -> Self {
        Self { api }
    }

    /// Profile lookup, memoized per run. `None` on any API failure.
    pub async fn profile(&self, ctx: &mut RunContext, username: &str) -> Option<ProfileInfo> {
        if let Some(profile) = ctx.profiles.get(username) {
            return Some(profile.clone());
        }
        match self.api.profile_info(username).await {
            Ok(profile) => {
                ctx.profiles.insert(username.to_string(), profile.clone());
                Some(profile)
            }
            Err(e) => {
                warn!(username, reason = %e.reason_code(), "Profile lookup failed");
                None
            }
        }
    }

    pub async fn user_id(&self, ctx: &mut RunContext, username: &str) -> Option<String> {
        self.profile(ctx, username).await.map(|p| p.user_id)
    }

    pub async fn resolve_items(&self, ctx: &mut RunContext, username: &str) -> Vec<StoryItem> {
        if let Some(items) = ctx.stories.get(username) {
            return items.clone();
        }

        let Some(user_id) = self.user_id(ctx, username).await else {
            return Vec::new();
        };

        let payload = match self.api.reels_media(&user_id).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(username, reason = %e.reason_code(), "Reel lookup failed");
                return Vec::new();
            }
        };

        let Some(reel) = reel_for_user(&payload, &user_id) else {
            debug!(username, "No reel in payload");
            return Vec::new();
        };

        let items = normalize_reel(reel, username, &user_id);
        debug!(username, count = items.len(), "Resolved stories");
        if !items.is_empty() {
            ctx.stories.insert(username.to_string(), items.clone());
        }
        items
    }
}

/// Find the reel for `user_id` in either payload shape, falling back to the
/// only reel present when key matching fails.
pub fn reel_for_user<'v>(payload: &'v Value, user_id: &str) -> Option<&'v Value> {
    if let Some(reels) = payload.get("reels").and_then(Value::as_object) {
        if let Some(reel) = reels.get(user_id) {
            return Some(reel);
        }
        if reels.len() == 1 {
            return reels.values().next();
        }
    }

    if let Some(list) = payload.get("reels_media").and_then(Value::as_array) {
        let matched = list.iter().find(|reel| {
            id_of(reel.get("id")).as_deref() == Some(user_id)
                || id_of(reel.get("user").and_then(|u| u.get("pk"))).as_deref() == Some(user_id)
        });
        if matched.is_some() {
            return matched;
        }
        if list.len() == 1 {
            return list.first();
        }
    }

    None
}

pub fn normalize_reel(reel: &Value, owner_username: &str, owner_user_id: &str) -> Vec<StoryItem> {
    let owner_username = reel
        .get("user")
        .and_then(|u| u.get("username"))
        .and_then(Value::as_str)
        .unwrap_or(owner_username);

    reel.get("items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|raw| normalize_item(raw, owner_username, owner_user_id))
                .collect()
        })
        .unwrap_or_default()
}

pub fn normalize_item(raw: &Value, owner_username: &str, owner_user_id: &str) -> Option<StoryItem> {
    let story_id = story_id_of(raw)?;
    let primary = primary_media(raw)?;

    let video_url = first_url(primary.get("video_versions"));
    let image_url = first_url(
        primary
            .get("image_versions2")
            .and_then(|v| v.get("candidates")),
    );
    let is_video =
        primary.get("media_type").and_then(Value::as_i64) == Some(2) || video_url.is_some();
    let media_type = if is_video {
        MediaType::Video
    } else {
        MediaType::Image
    };
    let media_url = if is_video {
        video_url.clone().or_else(|| image_url.clone())
    } else {
        image_url.clone()
    };

    let first_candidate = primary
        .get("image_versions2")
        .and_then(|v| v.get("candidates"))
        .and_then(Value::as_array)
        .and_then(|c| c.first());
    let dimension = |own: &str, candidate: &str| {
        primary
            .get(own)
            .and_then(Value::as_u64)
            .or_else(|| first_candidate.and_then(|c| c.get(candidate)).and_then(Value::as_u64))
            .and_then(|v| u32::try_from(v).ok())
    };

    let attribution_targets =
        attribution::external_attribution(raw, owner_username, Some(owner_user_id))
            .map(|hit| hit.targets)
            .unwrap_or_default();

    Some(StoryItem {
        permalink: story_permalink(owner_username, &story_id),
        story_id,
        owner_username: owner_username.to_string(),
        owner_user_id: Some(owner_user_id.to_string()),
        media_type,
        media_url,
        image_url,
        video_url,
        width: dimension("original_width", "width"),
        height: dimension("original_height", "height"),
        can_reply: raw.get("can_reply").and_then(Value::as_bool),
        can_reshare: raw.get("can_reshare").and_then(Value::as_bool),
        taken_at: timestamp(raw.get("taken_at")),
        expiring_at: timestamp(raw.get("expiring_at")),
        attribution_targets,
        source: ItemSource::Api,
        raw: raw.clone(),
    })
}

/// Root entry if it carries media, else the first video carousel entry,
/// else the first carousel entry with any media.
fn primary_media(raw: &Value) -> Option<&Value> {
    if has_media(raw) {
        return Some(raw);
    }
    let children = raw.get("carousel_media").and_then(Value::as_array)?;
    children
        .iter()
        .find(|c| first_url(c.get("video_versions")).is_some())
        .or_else(|| children.iter().find(|c| has_media(c)))
}

fn has_media(v: &Value) -> bool {
    first_url(v.get("video_versions")).is_some()
        || first_url(v.get("image_versions2").and_then(|i| i.get("candidates"))).is_some()
}

fn first_url(list: Option<&Value>) -> Option<String> {
    list?
        .as_array()?
        .iter()
        .find_map(|v| v.get("url").and_then(Value::as_str))
        .filter(|u| !u.is_empty())
        .map(String::from)
}

fn story_id_of(raw: &Value) -> Option<String> {
    id_of(raw.get("pk")).or_else(|| {
        raw.get("id")
            .and_then(Value::as_str)
            .and_then(|id| id.split('_').next())
            .filter(|id| !id.is_empty())
            .map(String::from)
    })
}

fn id_of(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(value?.as_i64()?, 0)
}
