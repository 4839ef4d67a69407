// Test mocks for the story pipeline.
//
// One mock per trait boundary:
// - MockProbe (PageProbe): scripted carousel frames, advance plan, UI send behavior
// - MockApi (StoryApi): profiles, reels, media, configurable send failures
// - MockGenerator (CommentGenerator): fixed suggestions
// - RecordingSink (MediaSink): remembers what was stored
//
// Plus builders for reel payloads and contexts.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use browser_session::{BrowserError, BrowserLogEntry};
use engage_common::CarouselContext;
use serde_json::{json, Value};
use story_api_client::{ApiError, BroadcastAck, MediaDownload, ProfileInfo};

use crate::analysis::CommentSuggestions;
use crate::executor::VerifyConfig;
use crate::probe::{PageProbe, Probe};
use crate::session::RecoveryPolicy;
use crate::store::EngagementStore;
use crate::traits::{CommentGenerator, MediaSink, StoryApi};
use crate::traversal::{EngineDeps, StoryEngine, TraversalConfig};

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Resolved context for `username`'s story `story_id`.
pub fn story_context(username: &str, story_id: &str) -> CarouselContext {
    CarouselContext {
        story_ref: Some(story_id.to_string()),
        username: Some(username.to_string()),
        story_id: Some(story_id.to_string()),
        url: Some(format!("https://www.instagram.com/stories/{username}/{story_id}/")),
        media_url: Some(media_url(story_id)),
        media_signature: None,
        is_video: false,
        viewer_active: true,
        frame_visually_present: true,
    }
}

pub fn media_url(story_id: &str) -> String {
    format!("https://cdn.example.com/v/t51/{story_id}.jpg?stp=dst-jpg")
}

/// Raw API entry for an image story.
pub fn image_item(story_id: &str, owner_id: &str, owner: &str) -> Value {
    json!({
        "pk": story_id,
        "id": format!("{story_id}_{owner_id}"),
        "media_type": 1,
        "taken_at": 1_760_000_000,
        "expiring_at": 1_760_086_400,
        "original_width": 1080,
        "original_height": 1920,
        "image_versions2": {"candidates": [{"url": media_url(story_id), "width": 1080, "height": 1920}]},
        "user": {"pk": owner_id, "username": owner}
    })
}

/// Raw API entry for a video story.
pub fn video_item(story_id: &str, owner_id: &str, owner: &str) -> Value {
    json!({
        "pk": story_id,
        "media_type": 2,
        "video_versions": [{"url": format!("https://cdn.example.com/v/t50/{story_id}.mp4")}],
        "image_versions2": {"candidates": [{"url": media_url(story_id)}]},
        "user": {"pk": owner_id, "username": owner}
    })
}

/// `reels` map payload with one reel.
pub fn reel_payload(owner_id: &str, owner: &str, items: Vec<Value>) -> Value {
    json!({
        "reels": {
            owner_id: {"id": owner_id, "user": {"pk": owner_id, "username": owner}, "items": items}
        }
    })
}

pub fn followed_profile(username: &str, user_id: &str) -> ProfileInfo {
    ProfileInfo {
        user_id: user_id.to_string(),
        username: username.to_string(),
        full_name: None,
        is_private: false,
        followed_by_viewer: true,
        follows_viewer: false,
    }
}

/// Deterministic high-entropy bytes (xorshift).
pub fn noise(len: usize) -> Vec<u8> {
    let mut state: u64 = 0x2545_F491_4F6C_DD1D;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 32) as u8
        })
        .collect()
}

/// Pipeline config with no pacing and a short verification window.
pub fn fast_config() -> TraversalConfig {
    TraversalConfig {
        pacing: Duration::ZERO,
        pacing_jitter: Duration::ZERO,
        reply_probe_timeout: Duration::from_millis(10),
        verify: VerifyConfig {
            timeout: Duration::from_millis(40),
            poll_interval: Duration::from_millis(5),
            realtime_host: "edge-chat.instagram.com".to_string(),
        },
        recovery: RecoveryPolicy {
            max_attempts: 2,
            backoff: Duration::ZERO,
        },
        ..TraversalConfig::default()
    }
}

pub fn test_engine(
    probe: Arc<MockProbe>,
    api: Arc<MockApi>,
    generator: Arc<MockGenerator>,
    store: Arc<dyn EngagementStore>,
) -> (StoryEngine, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let engine = StoryEngine::new(
        "me",
        EngineDeps {
            probe,
            api,
            generator,
            sink: sink.clone(),
            store,
        },
        fast_config(),
    );
    (engine, sink)
}

// ---------------------------------------------------------------------------
// MockProbe
// ---------------------------------------------------------------------------

/// One scripted carousel position.
#[derive(Debug, Clone)]
pub struct Frame {
    pub context: Probe<CarouselContext>,
    /// Returned after `open_story_root` when `context` is ambiguous.
    pub after_root: Option<CarouselContext>,
    pub header: Vec<String>,
    pub linked: Vec<String>,
    pub reply_box: bool,
    pub viewer_text: Option<String>,
}

impl Frame {
    pub fn story(username: &str, story_id: &str) -> Self {
        Self {
            context: Probe::Found(story_context(username, story_id)),
            after_root: None,
            header: vec![username.to_string()],
            linked: Vec::new(),
            reply_box: true,
            viewer_text: None,
        }
    }

    pub fn unresolved() -> Self {
        Self {
            context: Probe::NotFound,
            after_root: None,
            header: Vec::new(),
            linked: Vec::new(),
            reply_box: false,
            viewer_text: None,
        }
    }

    pub fn with_header(mut self, line: &str) -> Self {
        self.header.push(line.to_string());
        self
    }

    pub fn without_reply_box(mut self, viewer_text: Option<&str>) -> Self {
        self.reply_box = false;
        self.viewer_text = viewer_text.map(String::from);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Move,
    Stay,
    Fail,
}

/// What the page does after a UI submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiSendBehavior {
    /// Compose box clears and the item renders.
    Deliver,
    /// Compose box clears, nothing renders.
    ClearOnly,
    /// Text stays in the compose box.
    Stuck,
    /// An alert with this text appears.
    Alert(String),
    /// TLS error logged against the realtime host.
    TlsError,
    /// No compose box to submit into.
    NoComposeBox,
}

struct ProbeState {
    frames: Vec<Frame>,
    position: usize,
    root_opened: bool,
    advance_plan: VecDeque<Advance>,
    compose: Option<String>,
    rendered: Vec<String>,
    alerts: Vec<String>,
    logs: Vec<BrowserLogEntry>,
    submitted: Vec<String>,
    reactions: u32,
    disconnects_pending: u32,
    header_disconnects_pending: u32,
    script_errors_pending: u32,
    reconnects: u32,
    roots_opened: Vec<String>,
    advances: u32,
}

pub struct MockProbe {
    state: Mutex<ProbeState>,
    carousel_opens: bool,
    reaction_ok: bool,
    ui_send: UiSendBehavior,
    dm_thread_available: bool,
}

impl MockProbe {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            state: Mutex::new(ProbeState {
                frames,
                position: 0,
                root_opened: false,
                advance_plan: VecDeque::new(),
                compose: None,
                rendered: Vec::new(),
                alerts: Vec::new(),
                logs: Vec::new(),
                submitted: Vec::new(),
                reactions: 0,
                disconnects_pending: 0,
                header_disconnects_pending: 0,
                script_errors_pending: 0,
                reconnects: 0,
                roots_opened: Vec::new(),
                advances: 0,
            }),
            carousel_opens: true,
            reaction_ok: true,
            ui_send: UiSendBehavior::Deliver,
            dm_thread_available: true,
        }
    }

    /// Advance results, consumed in order. Once exhausted, advancing moves
    /// while frames remain and fails at the end.
    pub fn advance_plan(self, plan: Vec<Advance>) -> Self {
        self.state.lock().unwrap().advance_plan = plan.into();
        self
    }

    pub fn ui_send(mut self, behavior: UiSendBehavior) -> Self {
        self.ui_send = behavior;
        self
    }

    pub fn reaction_ok(mut self, ok: bool) -> Self {
        self.reaction_ok = ok;
        self
    }

    pub fn carousel_opens(mut self, opens: bool) -> Self {
        self.carousel_opens = opens;
        self
    }

    pub fn dm_thread_available(mut self, available: bool) -> Self {
        self.dm_thread_available = available;
        self
    }

    /// The next `n` context reads fail with a disconnect.
    pub fn disconnect_times(self, n: u32) -> Self {
        self.state.lock().unwrap().disconnects_pending = n;
        self
    }

    /// The next `n` header reads fail with a disconnect.
    pub fn header_disconnects(self, n: u32) -> Self {
        self.state.lock().unwrap().header_disconnects_pending = n;
        self
    }

    /// The next `n` context reads fail with a page script error.
    pub fn context_script_errors(self, n: u32) -> Self {
        self.state.lock().unwrap().script_errors_pending = n;
        self
    }

    pub fn submitted(&self) -> Vec<String> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn reactions(&self) -> u32 {
        self.state.lock().unwrap().reactions
    }

    pub fn reconnects(&self) -> u32 {
        self.state.lock().unwrap().reconnects
    }

    pub fn roots_opened(&self) -> Vec<String> {
        self.state.lock().unwrap().roots_opened.clone()
    }

    pub fn advances(&self) -> u32 {
        self.state.lock().unwrap().advances
    }

    fn frame(&self) -> Option<Frame> {
        let state = self.state.lock().unwrap();
        state.frames.get(state.position).cloned()
    }

    fn submit(&self, text: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if self.ui_send == UiSendBehavior::NoComposeBox {
            return false;
        }
        state.submitted.push(text.to_string());
        match &self.ui_send {
            UiSendBehavior::Deliver => {
                state.compose = Some(String::new());
                state.rendered.push(text.to_string());
            }
            UiSendBehavior::ClearOnly => state.compose = Some(String::new()),
            UiSendBehavior::Stuck => state.compose = Some(text.to_string()),
            UiSendBehavior::Alert(alert) => {
                state.compose = Some(text.to_string());
                state.alerts.push(alert.clone());
            }
            UiSendBehavior::TlsError => {
                state.compose = Some(String::new());
                state.logs.push(BrowserLogEntry {
                    level: "error".into(),
                    source: "network".into(),
                    message: "WebSocket connection failed: net::ERR_CERT_AUTHORITY_INVALID".into(),
                    url: Some("wss://edge-chat.instagram.com/chat".into()),
                });
            }
            UiSendBehavior::NoComposeBox => {}
        }
        true
    }
}

#[async_trait]
impl PageProbe for MockProbe {
    async fn open_carousel(&self) -> browser_session::Result<bool> {
        Ok(self.carousel_opens)
    }

    async fn carousel_context(&self) -> browser_session::Result<Probe<CarouselContext>> {
        {
            let mut state = self.state.lock().unwrap();
            if state.disconnects_pending > 0 {
                state.disconnects_pending -= 1;
                return Err(BrowserError::Disconnected("mock websocket closed".into()));
            }
            if state.script_errors_pending > 0 {
                state.script_errors_pending -= 1;
                return Err(BrowserError::Script(
                    "TypeError: Cannot read properties of null".into(),
                ));
            }
        }
        let root_opened = self.state.lock().unwrap().root_opened;
        Ok(match self.frame() {
            Some(frame) => match (&frame.context, root_opened, frame.after_root) {
                (Probe::Ambiguous(_), true, Some(ctx)) => Probe::Found(ctx),
                (context, _, _) => context.clone(),
            },
            None => Probe::NotFound,
        })
    }

    async fn open_story_root(&self, username: &str) -> browser_session::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.root_opened = true;
        state.roots_opened.push(username.to_string());
        Ok(())
    }

    async fn advance(&self) -> browser_session::Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.advances += 1;
        state.root_opened = false;
        let step = state.advance_plan.pop_front().unwrap_or_else(|| {
            if state.position + 1 < state.frames.len() {
                Advance::Move
            } else {
                Advance::Fail
            }
        });
        Ok(match step {
            Advance::Move => {
                state.position += 1;
                state.compose = None;
                true
            }
            Advance::Stay => true,
            Advance::Fail => false,
        })
    }

    async fn header_zone_text(&self) -> browser_session::Result<Vec<String>> {
        {
            let mut state = self.state.lock().unwrap();
            if state.header_disconnects_pending > 0 {
                state.header_disconnects_pending -= 1;
                return Err(BrowserError::Disconnected("mock websocket closed".into()));
            }
        }
        Ok(self.frame().map(|f| f.header).unwrap_or_default())
    }

    async fn linked_usernames(&self, owner: &str) -> browser_session::Result<Vec<String>> {
        Ok(self
            .frame()
            .map(|f| f.linked.into_iter().filter(|u| u != owner).collect())
            .unwrap_or_default())
    }

    async fn reply_affordance(&self, _timeout: Duration) -> browser_session::Result<Probe<()>> {
        Ok(match self.frame() {
            Some(f) if f.reply_box => Probe::Found(()),
            _ => Probe::NotFound,
        })
    }

    async fn viewer_text(&self) -> browser_session::Result<Option<String>> {
        Ok(self.frame().and_then(|f| f.viewer_text))
    }

    async fn send_reaction(&self) -> browser_session::Result<bool> {
        if self.reaction_ok {
            self.state.lock().unwrap().reactions += 1;
        }
        Ok(self.reaction_ok)
    }

    async fn submit_story_reply(&self, text: &str) -> browser_session::Result<bool> {
        Ok(self.submit(text))
    }

    async fn open_direct_thread(&self, _username: &str) -> browser_session::Result<bool> {
        Ok(self.dm_thread_available)
    }

    async fn submit_direct_message(&self, text: &str) -> browser_session::Result<bool> {
        Ok(self.submit(text))
    }

    async fn compose_text(&self) -> browser_session::Result<Option<String>> {
        Ok(self.state.lock().unwrap().compose.clone())
    }

    async fn outgoing_rendered(&self, text: &str) -> browser_session::Result<bool> {
        Ok(self.state.lock().unwrap().rendered.iter().any(|r| r == text))
    }

    async fn alert_text(&self) -> browser_session::Result<Vec<String>> {
        Ok(self.state.lock().unwrap().alerts.clone())
    }

    async fn browser_logs(&self) -> browser_session::Result<Vec<BrowserLogEntry>> {
        Ok(std::mem::take(&mut self.state.lock().unwrap().logs))
    }

    async fn reconnect(&self) -> browser_session::Result<()> {
        self.state.lock().unwrap().reconnects += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockApi
// ---------------------------------------------------------------------------

/// How the API answers a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiSendBehavior {
    Ok,
    HttpStatus(u16),
    NotOk(String),
}

impl ApiSendBehavior {
    fn result(&self, thread_id: &str) -> story_api_client::Result<BroadcastAck> {
        match self {
            ApiSendBehavior::Ok => Ok(BroadcastAck {
                thread_id: thread_id.to_string(),
                client_context: "ctx".to_string(),
                item_id: Some("item-1".to_string()),
            }),
            ApiSendBehavior::HttpStatus(status) => Err(ApiError::Http {
                status: *status,
                message: "forbidden".to_string(),
            }),
            ApiSendBehavior::NotOk(status) => Err(ApiError::NotOk {
                status: status.clone(),
                message: String::new(),
            }),
        }
    }
}

pub struct MockApi {
    profiles: HashMap<String, ProfileInfo>,
    reels: HashMap<String, Value>,
    media: HashMap<String, MediaDownload>,
    default_media: Option<MediaDownload>,
    send: ApiSendBehavior,
    sent_replies: Mutex<Vec<(String, String)>>,
    sent_texts: Mutex<Vec<(String, String)>>,
    threads_created: Mutex<u32>,
    reel_calls: Mutex<u32>,
}

impl MockApi {
    pub fn new() -> Self {
        Self {
            profiles: HashMap::new(),
            reels: HashMap::new(),
            media: HashMap::new(),
            default_media: None,
            send: ApiSendBehavior::Ok,
            sent_replies: Mutex::new(Vec::new()),
            sent_texts: Mutex::new(Vec::new()),
            threads_created: Mutex::new(0),
            reel_calls: Mutex::new(0),
        }
    }

    pub fn on_profile(mut self, profile: ProfileInfo) -> Self {
        self.profiles.insert(profile.username.clone(), profile);
        self
    }

    pub fn on_reel(mut self, user_id: &str, payload: Value) -> Self {
        self.reels.insert(user_id.to_string(), payload);
        self
    }

    pub fn on_media(mut self, url: &str, bytes: Vec<u8>, content_type: &str) -> Self {
        self.media.insert(
            url.to_string(),
            MediaDownload {
                bytes,
                content_type: Some(content_type.to_string()),
                final_url: url.to_string(),
            },
        );
        self
    }

    /// Served for any URL without a specific entry.
    pub fn default_media(mut self, bytes: Vec<u8>, content_type: &str) -> Self {
        self.default_media = Some(MediaDownload {
            bytes,
            content_type: Some(content_type.to_string()),
            final_url: String::new(),
        });
        self
    }

    pub fn send_behavior(mut self, behavior: ApiSendBehavior) -> Self {
        self.send = behavior;
        self
    }

    pub fn sent_replies(&self) -> Vec<(String, String)> {
        self.sent_replies.lock().unwrap().clone()
    }

    pub fn sent_texts(&self) -> Vec<(String, String)> {
        self.sent_texts.lock().unwrap().clone()
    }

    pub fn threads_created(&self) -> u32 {
        *self.threads_created.lock().unwrap()
    }

    pub fn reel_calls(&self) -> u32 {
        *self.reel_calls.lock().unwrap()
    }
}

impl Default for MockApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoryApi for MockApi {
    async fn profile_info(&self, username: &str) -> story_api_client::Result<ProfileInfo> {
        self.profiles.get(username).cloned().ok_or(ApiError::Http {
            status: 404,
            message: format!("no profile {username}"),
        })
    }

    async fn reels_media(&self, user_id: &str) -> story_api_client::Result<Value> {
        *self.reel_calls.lock().unwrap() += 1;
        self.reels
            .get(user_id)
            .cloned()
            .ok_or(ApiError::NonJson { content_type: Some("text/html".into()) })
    }

    async fn create_thread(&self, user_id: &str) -> story_api_client::Result<String> {
        *self.threads_created.lock().unwrap() += 1;
        Ok(format!("thread-{user_id}"))
    }

    async fn send_story_reply(
        &self,
        story_id: &str,
        _owner_user_id: &str,
        thread_id: &str,
        text: &str,
    ) -> story_api_client::Result<BroadcastAck> {
        let result = self.send.result(thread_id);
        if result.is_ok() {
            self.sent_replies
                .lock()
                .unwrap()
                .push((story_id.to_string(), text.to_string()));
        }
        result
    }

    async fn send_text(&self, thread_id: &str, text: &str) -> story_api_client::Result<BroadcastAck> {
        let result = self.send.result(thread_id);
        if result.is_ok() {
            self.sent_texts
                .lock()
                .unwrap()
                .push((thread_id.to_string(), text.to_string()));
        }
        result
    }

    async fn download_media(&self, url: &str) -> story_api_client::Result<MediaDownload> {
        if let Some(download) = self.media.get(url) {
            return Ok(download.clone());
        }
        match &self.default_media {
            Some(download) => Ok(MediaDownload {
                final_url: url.to_string(),
                ..download.clone()
            }),
            None => Err(ApiError::Http {
                status: 404,
                message: "no media".into(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// MockGenerator
// ---------------------------------------------------------------------------

pub struct MockGenerator {
    suggestions: CommentSuggestions,
    calls: Mutex<u32>,
    failures: Mutex<u32>,
}

impl MockGenerator {
    pub fn suggesting(texts: &[&str]) -> Self {
        Self {
            suggestions: CommentSuggestions {
                description: Some("a story".to_string()),
                topics: Vec::new(),
                suggestions: texts.iter().map(|t| t.to_string()).collect(),
                ready: true,
            },
            calls: Mutex::new(0),
            failures: Mutex::new(0),
        }
    }

    pub fn not_ready() -> Self {
        Self {
            suggestions: CommentSuggestions {
                ready: false,
                ..Default::default()
            },
            calls: Mutex::new(0),
            failures: Mutex::new(0),
        }
    }

    /// The first `n` generations fail.
    pub fn failing_first(self, n: u32) -> Self {
        *self.failures.lock().unwrap() = n;
        self
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl CommentGenerator for MockGenerator {
    async fn generate(
        &self,
        _media: &[u8],
        _content_type: Option<&str>,
        _context: &Value,
    ) -> Result<CommentSuggestions> {
        *self.calls.lock().unwrap() += 1;
        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            anyhow::bail!("analysis service unavailable");
        }
        Ok(self.suggestions.clone())
    }
}

// ---------------------------------------------------------------------------
// RecordingSink
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingSink {
    stored: Mutex<Vec<(String, String, String, usize)>>,
}

impl RecordingSink {
    /// `(subject, story_id, filename, byte_len)` per stored asset.
    pub fn stored(&self) -> Vec<(String, String, String, usize)> {
        self.stored.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaSink for RecordingSink {
    async fn store(
        &self,
        subject: &str,
        story_id: &str,
        filename: &str,
        bytes: &[u8],
        _content_type: Option<&str>,
    ) -> Result<Option<String>> {
        self.stored.lock().unwrap().push((
            subject.to_string(),
            story_id.to_string(),
            filename.to_string(),
            bytes.len(),
        ));
        Ok(Some(format!("{subject}/{filename}")))
    }
}
