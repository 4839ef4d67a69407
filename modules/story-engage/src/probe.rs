// PageProbe: every DOM question the pipeline asks, behind one capability
// interface. Absence is a value (`Probe::NotFound`, `None`, `false`), never
// an error; errors are reserved for the browser session itself.
//
// DomProbe is the implementation for the current web surface. Selectors are
// expected to drift; swap or patch the probe without touching the engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use browser_session::{BrowserLogEntry, BrowserSession, Result};
use engage_common::CarouselContext;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

/// Outcome of a DOM lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Probe<T> {
    Found(T),
    NotFound,
    Ambiguous(String),
}

impl<T> Probe<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Probe::Found(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Probe::Found(_))
    }
}

#[async_trait]
pub trait PageProbe: Send + Sync {
    /// Open the story tray and enter the first story. `false` if no tray.
    async fn open_carousel(&self) -> Result<bool>;

    async fn carousel_context(&self) -> Result<Probe<CarouselContext>>;

    /// Navigate straight to one account's story root (`/stories/<user>/`).
    async fn open_story_root(&self, username: &str) -> Result<()>;

    /// Move to the next story. `false` when nothing changed.
    async fn advance(&self) -> Result<bool>;

    /// Visible text in the top band of the story viewer.
    async fn header_zone_text(&self) -> Result<Vec<String>>;

    /// Usernames linked from the story overlay other than `owner`.
    async fn linked_usernames(&self, owner: &str) -> Result<Vec<String>>;

    async fn reply_affordance(&self, timeout: Duration) -> Result<Probe<()>>;

    /// Full visible text of the story viewer, for marker scans.
    async fn viewer_text(&self) -> Result<Option<String>>;

    /// Tap the quick reaction. `true` once the reaction visibly registered.
    async fn send_reaction(&self) -> Result<bool>;

    /// Type and submit a story reply. `true` when submission was triggered.
    async fn submit_story_reply(&self, text: &str) -> Result<bool>;

    async fn open_direct_thread(&self, username: &str) -> Result<bool>;

    async fn submit_direct_message(&self, text: &str) -> Result<bool>;

    /// Current compose-box contents (reply box or DM composer).
    async fn compose_text(&self) -> Result<Option<String>>;

    /// Whether `text` shows up as a rendered outgoing item.
    async fn outgoing_rendered(&self, text: &str) -> Result<bool>;

    /// Text of visible alerts, dialogs and toasts.
    async fn alert_text(&self) -> Result<Vec<String>>;

    async fn browser_logs(&self) -> Result<Vec<BrowserLogEntry>>;

    async fn reconnect(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// DomProbe
// ---------------------------------------------------------------------------

const TRAY_SELECTOR: &str = "div[role='menu'] canvas, ul li div[role='button'] canvas";
const REPLY_BOX_SELECTOR: &str =
    "section textarea[placeholder], form textarea[placeholder*='eply' i]";
const DM_COMPOSER_SELECTOR: &str = "div[role='textbox'][contenteditable='true']";

const CONTEXT_SCRIPT: &str = r#"
const path = location.pathname;
const m = path.match(/^\/stories\/([^\/]+)\/(\d+)?/);
const viewer = document.querySelector('section') || document.body;
const media = Array.from(viewer.querySelectorAll('video, img'))
  .map(el => ({ el, r: el.getBoundingClientRect() }))
  .filter(x => x.r.width > 80 && x.r.height > 80)
  .sort((a, b) => (b.r.width * b.r.height) - (a.r.width * a.r.height));
const primary = media.length ? media[0] : null;
let src = null, isVideo = false, signature = null;
if (primary) {
  isVideo = primary.el.tagName === 'VIDEO';
  src = isVideo ? (primary.el.currentSrc || primary.el.src || null)
                : (primary.el.currentSrc || primary.el.src || null);
  try {
    const c = document.createElement('canvas');
    c.width = 8; c.height = 8;
    const g = c.getContext('2d');
    g.drawImage(primary.el, 0, 0, 8, 8);
    const d = g.getImageData(0, 0, 8, 8).data;
    const lum = [];
    for (let i = 0; i < d.length; i += 4) lum.push((d[i] + d[i + 1] + d[i + 2]) / 3);
    const avg = lum.reduce((a, b) => a + b, 0) / lum.length;
    let bits = '';
    for (const v of lum) bits += v >= avg ? '1' : '0';
    signature = BigInt('0b' + bits).toString(16).padStart(16, '0');
  } catch (e) { signature = null; }
}
const owners = new Set();
if (m) owners.add(decodeURIComponent(m[1]));
if (!m) {
  viewer.querySelectorAll('header a[href^="/"]').forEach(a => {
    const u = a.getAttribute('href').split('/').filter(Boolean)[0];
    if (u) owners.add(u);
  });
}
const status = owners.size === 0 ? 'not_found' : (owners.size > 1 ? 'ambiguous' : 'found');
return {
  status,
  username: owners.size === 1 ? Array.from(owners)[0] : null,
  candidates: Array.from(owners),
  story_id: m && m[2] ? m[2] : null,
  story_ref: m && m[2] ? m[2] : null,
  url: location.href,
  media_url: src,
  media_signature: signature,
  is_video: isVideo,
  viewer_active: path.startsWith('/stories/'),
  frame_visually_present: !!primary && primary.r.width > 0 && primary.r.height > 0,
};
"#;

const OPEN_TRAY_SCRIPT: &str = r#"
const ring = document.querySelector(args.selector);
if (!ring) return false;
const button = ring.closest('[role="button"], button, a') || ring;
button.click();
return true;
"#;

const ADVANCE_SCRIPT: &str = r#"
const before = location.pathname + '|' + ((document.querySelector('section video, section img') || {}).currentSrc || '');
const next = document.querySelector('button[aria-label="Next"], div[role="button"][aria-label="Next"]');
if (next) { next.click(); }
else {
  document.dispatchEvent(new KeyboardEvent('keydown', { key: 'ArrowRight', code: 'ArrowRight', keyCode: 39, bubbles: true }));
}
const deadline = Date.now() + args.timeout_ms;
while (Date.now() < deadline) {
  await new Promise(r => setTimeout(r, 200));
  const now = location.pathname + '|' + ((document.querySelector('section video, section img') || {}).currentSrc || '');
  if (now !== before) return true;
}
return false;
"#;

const HEADER_ZONE_SCRIPT: &str = r#"
const limit = window.innerHeight * args.fraction;
const viewer = document.querySelector('section') || document.body;
const out = [];
const walker = document.createTreeWalker(viewer, NodeFilter.SHOW_TEXT);
while (walker.nextNode()) {
  const node = walker.currentNode;
  const text = (node.textContent || '').trim();
  if (!text || !node.parentElement) continue;
  const r = node.parentElement.getBoundingClientRect();
  if (r.height > 0 && r.top < limit) out.push(text);
}
return out.slice(0, 80);
"#;

const LINKED_USERS_SCRIPT: &str = r#"
const viewer = document.querySelector('section') || document.body;
const seen = new Set();
viewer.querySelectorAll('a[href^="/"]').forEach(a => {
  if (a.closest('header')) return;
  const parts = a.getAttribute('href').split('/').filter(Boolean);
  if (parts.length !== 1) return;
  const u = parts[0];
  if (u && u !== args.owner && !['explore', 'direct', 'stories', 'accounts'].includes(u)) seen.add(u);
});
return Array.from(seen).slice(0, 12);
"#;

const VIEWER_TEXT_SCRIPT: &str = r#"
const viewer = document.querySelector('section');
return viewer ? viewer.innerText : null;
"#;

const REACTION_SCRIPT: &str = r#"
const like = document.querySelector('section [aria-label="Like"]');
if (!like) return false;
(like.closest('[role="button"], button') || like).click();
const deadline = Date.now() + args.timeout_ms;
while (Date.now() < deadline) {
  await new Promise(r => setTimeout(r, 150));
  if (document.querySelector('section [aria-label="Unlike"]')) return true;
}
return false;
"#;

const SUBMIT_REPLY_SCRIPT: &str = r#"
const box = document.querySelector(args.selector);
if (!box) return false;
box.focus();
const setter = Object.getOwnPropertyDescriptor(HTMLTextAreaElement.prototype, 'value').set;
setter.call(box, args.text);
box.dispatchEvent(new Event('input', { bubbles: true }));
await new Promise(r => setTimeout(r, 300));
const form = box.closest('form') || box.parentElement;
const send = form && Array.from(form.querySelectorAll('[role="button"], button'))
  .find(b => /^(send|post)$/i.test((b.innerText || b.getAttribute('aria-label') || '').trim()));
if (send) { send.click(); return true; }
box.dispatchEvent(new KeyboardEvent('keydown', { key: 'Enter', code: 'Enter', keyCode: 13, bubbles: true }));
return true;
"#;

const SUBMIT_DM_SCRIPT: &str = r#"
const box = document.querySelector(args.selector);
if (!box) return false;
box.focus();
document.execCommand('insertText', false, args.text);
await new Promise(r => setTimeout(r, 300));
const send = Array.from(document.querySelectorAll('div[role="button"], button'))
  .find(b => /^send$/i.test((b.innerText || b.getAttribute('aria-label') || '').trim()));
if (send) { send.click(); return true; }
box.dispatchEvent(new KeyboardEvent('keydown', { key: 'Enter', code: 'Enter', keyCode: 13, bubbles: true }));
return true;
"#;

const OPEN_DM_SCRIPT: &str = r#"
const btn = Array.from(document.querySelectorAll('div[role="button"], button'))
  .find(b => /^message$/i.test((b.innerText || '').trim()));
if (!btn) return false;
btn.click();
return true;
"#;

const COMPOSE_TEXT_SCRIPT: &str = r#"
const box = document.querySelector(args.reply) || document.querySelector(args.dm);
if (!box) return null;
return box.value !== undefined ? box.value : (box.innerText || '');
"#;

const OUTGOING_SCRIPT: &str = r#"
const norm = s => (s || '').replace(/\s+/g, ' ').trim().toLowerCase();
const want = norm(args.text);
if (!want) return false;
const nodes = document.querySelectorAll('[role="row"], [role="gridcell"], [data-testid*="message"], [role="status"]');
for (const n of nodes) {
  if (norm(n.innerText).includes(want)) return true;
}
return false;
"#;

const ALERT_TEXT_SCRIPT: &str = r#"
return Array.from(document.querySelectorAll('[role="alert"], [role="dialog"], [role="status"]'))
  .map(n => (n.innerText || '').trim())
  .filter(Boolean)
  .slice(0, 20);
"#;

#[derive(Debug, Deserialize)]
struct RawContext {
    status: String,
    username: Option<String>,
    #[serde(default)]
    candidates: Vec<String>,
    story_id: Option<String>,
    story_ref: Option<String>,
    url: Option<String>,
    media_url: Option<String>,
    media_signature: Option<String>,
    #[serde(default)]
    is_video: bool,
    #[serde(default)]
    viewer_active: bool,
    #[serde(default)]
    frame_visually_present: bool,
}

fn parse_context(value: Value) -> Probe<CarouselContext> {
    let raw: RawContext = match serde_json::from_value(value) {
        Ok(raw) => raw,
        Err(_) => return Probe::NotFound,
    };
    match raw.status.as_str() {
        "found" => Probe::Found(CarouselContext {
            story_ref: raw.story_ref,
            username: raw.username,
            story_id: raw.story_id,
            url: raw.url,
            media_url: raw.media_url,
            media_signature: raw.media_signature,
            is_video: raw.is_video,
            viewer_active: raw.viewer_active,
            frame_visually_present: raw.frame_visually_present,
        }),
        "ambiguous" => Probe::Ambiguous(raw.candidates.join(",")),
        _ => Probe::NotFound,
    }
}

fn string_list(value: Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

pub struct DomProbe {
    session: Arc<dyn BrowserSession>,
    web_base_url: String,
    /// Fraction of the viewport treated as the header zone.
    header_fraction: f64,
}

impl DomProbe {
    pub fn new(session: Arc<dyn BrowserSession>, web_base_url: &str) -> Self {
        Self {
            session,
            web_base_url: web_base_url.trim_end_matches('/').to_string(),
            header_fraction: 0.38,
        }
    }
}

#[async_trait]
impl PageProbe for DomProbe {
    async fn open_carousel(&self) -> Result<bool> {
        self.session
            .navigate(&format!("{}/", self.web_base_url))
            .await?;
        if !self
            .session
            .wait_for(TRAY_SELECTOR, Duration::from_secs(15))
            .await?
        {
            debug!("Story tray not found");
            return Ok(false);
        }
        let clicked = self
            .session
            .run_script(OPEN_TRAY_SCRIPT, json!({ "selector": TRAY_SELECTOR }))
            .await?;
        if !clicked.as_bool().unwrap_or(false) {
            return Ok(false);
        }
        self.session
            .wait_for("section video, section img", Duration::from_secs(10))
            .await
    }

    async fn carousel_context(&self) -> Result<Probe<CarouselContext>> {
        let value = self.session.run_script(CONTEXT_SCRIPT, Value::Null).await?;
        Ok(parse_context(value))
    }

    async fn open_story_root(&self, username: &str) -> Result<()> {
        self.session
            .navigate(&format!("{}/stories/{}/", self.web_base_url, username))
            .await?;
        self.session
            .wait_for("section video, section img", Duration::from_secs(10))
            .await?;
        Ok(())
    }

    async fn advance(&self) -> Result<bool> {
        let moved = self
            .session
            .run_async_script(ADVANCE_SCRIPT, json!({ "timeout_ms": 6000 }))
            .await?;
        Ok(moved.as_bool().unwrap_or(false))
    }

    async fn header_zone_text(&self) -> Result<Vec<String>> {
        let value = self
            .session
            .run_script(HEADER_ZONE_SCRIPT, json!({ "fraction": self.header_fraction }))
            .await?;
        Ok(string_list(value))
    }

    async fn linked_usernames(&self, owner: &str) -> Result<Vec<String>> {
        let value = self
            .session
            .run_script(LINKED_USERS_SCRIPT, json!({ "owner": owner }))
            .await?;
        Ok(string_list(value))
    }

    async fn reply_affordance(&self, timeout: Duration) -> Result<Probe<()>> {
        if self.session.wait_for(REPLY_BOX_SELECTOR, timeout).await? {
            Ok(Probe::Found(()))
        } else {
            Ok(Probe::NotFound)
        }
    }

    async fn viewer_text(&self) -> Result<Option<String>> {
        let value = self.session.run_script(VIEWER_TEXT_SCRIPT, Value::Null).await?;
        Ok(value.as_str().map(String::from))
    }

    async fn send_reaction(&self) -> Result<bool> {
        let value = self
            .session
            .run_async_script(REACTION_SCRIPT, json!({ "timeout_ms": 3000 }))
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn submit_story_reply(&self, text: &str) -> Result<bool> {
        let value = self
            .session
            .run_async_script(
                SUBMIT_REPLY_SCRIPT,
                json!({ "selector": REPLY_BOX_SELECTOR, "text": text }),
            )
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn open_direct_thread(&self, username: &str) -> Result<bool> {
        self.session
            .navigate(&format!("{}/{}/", self.web_base_url, username))
            .await?;
        let clicked = self.session.run_script(OPEN_DM_SCRIPT, Value::Null).await?;
        if !clicked.as_bool().unwrap_or(false) {
            return Ok(false);
        }
        self.session
            .wait_for(DM_COMPOSER_SELECTOR, Duration::from_secs(12))
            .await
    }

    async fn submit_direct_message(&self, text: &str) -> Result<bool> {
        let value = self
            .session
            .run_async_script(
                SUBMIT_DM_SCRIPT,
                json!({ "selector": DM_COMPOSER_SELECTOR, "text": text }),
            )
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn compose_text(&self) -> Result<Option<String>> {
        let value = self
            .session
            .run_script(
                COMPOSE_TEXT_SCRIPT,
                json!({ "reply": REPLY_BOX_SELECTOR, "dm": DM_COMPOSER_SELECTOR }),
            )
            .await?;
        Ok(value.as_str().map(String::from))
    }

    async fn outgoing_rendered(&self, text: &str) -> Result<bool> {
        let value = self
            .session
            .run_script(OUTGOING_SCRIPT, json!({ "text": text }))
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn alert_text(&self) -> Result<Vec<String>> {
        let value = self.session.run_script(ALERT_TEXT_SCRIPT, Value::Null).await?;
        Ok(string_list(value))
    }

    async fn browser_logs(&self) -> Result<Vec<BrowserLogEntry>> {
        self.session.read_logs().await
    }

    async fn reconnect(&self) -> Result<()> {
        self.session.reconnect().await
    }
}
