// Attribution analysis: is this story an ad, or someone else's content?
//
// Ad detection is layered: structural API markers, then text markers in the
// viewer's header zone, then a lower-confidence look at the media URL. Only
// high confidence skips.
//
// External attribution walks the raw API item as generic JSON, collecting
// user references from attribution-bearing structures and comparing them
// against the reel owner.

use std::sync::LazyLock;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use engage_common::{ItemSource, StoryItem};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::probe::PageProbe;

/// Implicated users recorded per hit.
pub const MAX_TARGETS: usize = 12;

static AD_PHRASES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(sponsored|promoted|paid partnership|advertisement)\b")
        .expect("static ad phrase regex")
});

const MEDIA_ATTRIBUTION_KEYS: &[&str] = &[
    "media_attributions_data",
    "story_app_attribution",
    "reshared_story_media_author",
    "attribution_user",
];
const REEL_MENTION_KEYS: &[&str] = &["reel_mentions"];
const STORY_FEED_MEDIA_KEYS: &[&str] = &["story_feed_media"];

const HIGH_URL_MARKERS: &[&str] = &["ads_", "\"ad_id\"", "sponsored", "promoted", "ad_creative"];
const LOW_URL_MARKERS: &[&str] = &["/ads/", "_ads", "adsmanager", "ad_"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdConfidence {
    High,
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdSignal {
    pub confidence: AdConfidence,
    pub source: &'static str,
    pub marker: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributionHit {
    pub reason: &'static str,
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributionVerdict {
    Clear,
    Ad(AdSignal),
    External(AttributionHit),
}

/// Run both detectors. Either hit makes the story non-engageable.
pub async fn analyze(
    probe: &dyn PageProbe,
    item: &StoryItem,
) -> browser_session::Result<AttributionVerdict> {
    if let Some(signal) = detect_ad(probe, item).await? {
        if signal.confidence == AdConfidence::High {
            return Ok(AttributionVerdict::Ad(signal));
        }
        debug!(
            story_id = %item.story_id,
            marker = %signal.marker,
            "Low-confidence ad marker ignored"
        );
    }

    let owner_id = item.owner_user_id.as_deref();
    if item.source == ItemSource::Api {
        if let Some(hit) = external_attribution(&item.raw, &item.owner_username, owner_id) {
            return Ok(AttributionVerdict::External(hit));
        }
    } else {
        let linked = probe.linked_usernames(&item.owner_username).await?;
        let targets: Vec<String> = linked
            .into_iter()
            .filter(|u| !u.eq_ignore_ascii_case(&item.owner_username))
            .take(MAX_TARGETS)
            .collect();
        if !targets.is_empty() {
            return Ok(AttributionVerdict::External(AttributionHit {
                reason: "dom_linked_account",
                targets,
            }));
        }
    }

    Ok(AttributionVerdict::Clear)
}

async fn detect_ad(
    probe: &dyn PageProbe,
    item: &StoryItem,
) -> browser_session::Result<Option<AdSignal>> {
    if let Some(signal) = api_ad_marker(&item.raw) {
        return Ok(Some(signal));
    }
    let header = probe.header_zone_text().await?;
    if let Some(signal) = header_ad_marker(&header) {
        return Ok(Some(signal));
    }
    Ok(item.media_url.as_deref().and_then(media_url_ad_marker))
}

/// Paid-partnership and ad fields on the raw item.
pub fn api_ad_marker(raw: &Value) -> Option<AdSignal> {
    let high = |marker: &str| AdSignal {
        confidence: AdConfidence::High,
        source: "api_marker",
        marker: marker.to_string(),
    };
    if raw.get("is_paid_partnership").and_then(Value::as_bool) == Some(true) {
        return Some(high("is_paid_partnership"));
    }
    if raw.get("ad_id").is_some_and(|v| !v.is_null()) {
        return Some(high("ad_id"));
    }
    if raw
        .get("sponsor_tags")
        .and_then(Value::as_array)
        .is_some_and(|tags| !tags.is_empty())
    {
        return Some(high("sponsor_tags"));
    }
    None
}

/// Explicit phrases in the header zone text.
pub fn header_ad_marker(lines: &[String]) -> Option<AdSignal> {
    lines.iter().find_map(|line| {
        AD_PHRASES.find(line).map(|m| AdSignal {
            confidence: AdConfidence::High,
            source: "dom_header",
            marker: m.as_str().to_lowercase(),
        })
    })
}

/// Media URL heuristics, including the base64url-encoded `efg` parameter.
pub fn media_url_ad_marker(raw_url: &str) -> Option<AdSignal> {
    let parsed = url::Url::parse(raw_url).ok()?;
    for (key, value) in parsed.query_pairs() {
        if key == "ad_id" || key == "ad_token" {
            return Some(AdSignal {
                confidence: AdConfidence::High,
                source: "media_url_param",
                marker: key.to_string(),
            });
        }
        if key == "efg" {
            if let Some(decoded) = decode_base64url(&value) {
                let lower = decoded.to_lowercase();
                if let Some(m) = HIGH_URL_MARKERS.iter().find(|m| lower.contains(*m)) {
                    return Some(AdSignal {
                        confidence: AdConfidence::High,
                        source: "media_url_efg",
                        marker: m.to_string(),
                    });
                }
                if let Some(m) = LOW_URL_MARKERS.iter().find(|m| lower.contains(*m)) {
                    return Some(AdSignal {
                        confidence: AdConfidence::Low,
                        source: "media_url_efg",
                        marker: m.to_string(),
                    });
                }
            }
        }
    }
    let lower = raw_url.to_lowercase();
    LOW_URL_MARKERS
        .iter()
        .find(|m| lower.contains(*m))
        .map(|m| AdSignal {
            confidence: AdConfidence::Low,
            source: "media_url",
            marker: m.to_string(),
        })
}

fn decode_base64url(value: &str) -> Option<String> {
    let trimmed = value.trim().trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD.decode(value.trim()))
        .ok()?;
    String::from_utf8(bytes).ok()
}

// ---------------------------------------------------------------------------
// External attribution
// ---------------------------------------------------------------------------

/// A user reference found somewhere in the item JSON.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UserRef {
    Id(String),
    Username(String),
}

impl UserRef {
    fn is_owner(&self, owner_username: &str, owner_id: Option<&str>) -> bool {
        match self {
            UserRef::Id(id) => owner_id == Some(id.as_str()),
            UserRef::Username(u) => u.eq_ignore_ascii_case(owner_username),
        }
    }

    fn label(&self) -> String {
        match self {
            UserRef::Id(id) => id.clone(),
            UserRef::Username(u) => u.clone(),
        }
    }
}

/// First matching reason wins: owner mismatch, text-post reshare, reshared
/// feed media, media attribution, reel mention.
pub fn external_attribution(
    raw: &Value,
    owner_username: &str,
    owner_id: Option<&str>,
) -> Option<AttributionHit> {
    if !raw.is_object() {
        return None;
    }

    // Declared media owner vs reel owner.
    for key in ["user", "owner"] {
        if let Some(declared) = raw.get(key) {
            let mut refs = Vec::new();
            push_user_like(declared, &mut refs);
            let foreign = foreign_targets(&refs, owner_username, owner_id);
            if !foreign.is_empty() {
                return Some(AttributionHit {
                    reason: "owner_mismatch",
                    targets: foreign,
                });
            }
        }
    }

    if is_text_post_reshare(raw) {
        return Some(AttributionHit {
            reason: "text_post_reshare",
            targets: Vec::new(),
        });
    }

    let checks: [(&'static str, &[&str]); 3] = [
        ("story_feed_media", STORY_FEED_MEDIA_KEYS),
        ("media_attribution", MEDIA_ATTRIBUTION_KEYS),
        ("reel_mention", REEL_MENTION_KEYS),
    ];
    for (reason, keys) in checks {
        let mut refs = Vec::new();
        for subtree in find_keys(raw, keys) {
            collect_user_refs(subtree, &mut refs);
        }
        let foreign = foreign_targets(&refs, owner_username, owner_id);
        if !foreign.is_empty() {
            return Some(AttributionHit {
                reason,
                targets: foreign,
            });
        }
    }

    None
}

fn is_text_post_reshare(raw: &Value) -> bool {
    raw.get("is_reshare_of_text_post_app_media_in_ig")
        .and_then(Value::as_bool)
        .unwrap_or(false)
        || raw
            .get("text_post_share_to_ig_story_stickers")
            .and_then(Value::as_array)
            .is_some_and(|a| !a.is_empty())
}

fn foreign_targets(refs: &[UserRef], owner_username: &str, owner_id: Option<&str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for r in refs {
        if r.is_owner(owner_username, owner_id) {
            continue;
        }
        // An id we cannot compare (owner id unknown) is not evidence.
        if matches!(r, UserRef::Id(_)) && owner_id.is_none() {
            continue;
        }
        let label = r.label();
        if !out.contains(&label) {
            out.push(label);
        }
        if out.len() >= MAX_TARGETS {
            break;
        }
    }
    out
}

/// All subtrees stored under any of `keys`, at any depth.
fn find_keys<'a>(value: &'a Value, keys: &[&str]) -> Vec<&'a Value> {
    let mut found = Vec::new();
    let mut stack = vec![value];
    while let Some(v) = stack.pop() {
        match v {
            Value::Object(map) => {
                for (k, child) in map {
                    if keys.contains(&k.as_str()) {
                        found.push(child);
                    } else {
                        stack.push(child);
                    }
                }
            }
            Value::Array(items) => stack.extend(items.iter()),
            _ => {}
        }
    }
    found
}

/// Recursive visitor collecting user references from a subtree.
pub fn collect_user_refs(value: &Value, out: &mut Vec<UserRef>) {
    match value {
        Value::Object(map) => {
            push_user_like(value, out);
            for (key, child) in map {
                if key == "media_id" {
                    if let Some(owner) = child.as_str().and_then(media_id_owner) {
                        out.push(UserRef::Id(owner));
                    }
                }
                if matches!(key.as_str(), "user" | "owner") {
                    push_user_like(child, out);
                }
                collect_user_refs(child, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_user_refs(item, out);
            }
        }
        _ => {}
    }
}

/// Push username and id of an object that looks like a user.
fn push_user_like(value: &Value, out: &mut Vec<UserRef>) {
    let Some(map) = value.as_object() else {
        return;
    };
    let username = map.get("username").and_then(Value::as_str);
    if let Some(u) = username.filter(|u| !u.is_empty()) {
        let r = UserRef::Username(u.to_string());
        if !out.contains(&r) {
            out.push(r);
        }
    }
    if username.is_some() || map.contains_key("pk") {
        for key in ["pk", "pk_id", "id"] {
            if let Some(id) = id_string(map.get(key)) {
                let r = UserRef::Id(id);
                if !out.contains(&r) {
                    out.push(r);
                }
                break;
            }
        }
    }
}

fn id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `"<media pk>_<owner pk>"` → owner pk.
fn media_id_owner(media_id: &str) -> Option<String> {
    let (media, owner) = media_id.split_once('_')?;
    let numeric = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    (numeric(media) && numeric(owner)).then(|| owner.to_string())
}
