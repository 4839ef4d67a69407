pub mod error;
pub mod types;

pub use error::{ApiError, Result};
pub use types::{
    BroadcastAck, MediaDownload, ProfileInfo, SessionCredentials, DEFAULT_APP_ID,
    DEFAULT_USER_AGENT,
};

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, COOKIE, REFERER, USER_AGENT};
use serde_json::Value;
use types::WebProfileEnvelope;

pub const DEFAULT_BASE_URL: &str = "https://www.instagram.com/api/v1";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    credentials: SessionCredentials,
}

impl ApiClient {
    pub fn new(base_url: &str, credentials: SessionCredentials) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    pub fn credentials(&self) -> &SessionCredentials {
        &self.credentials
    }

    fn headers(&self) -> Result<HeaderMap> {
        let csrf = self
            .credentials
            .csrf_token()
            .ok_or(ApiError::MissingCredential("csrftoken"))?;

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, header_value(&self.credentials.user_agent)?);
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/plain, */*"),
        );
        headers.insert("x-ig-app-id", header_value(&self.credentials.app_id)?);
        headers.insert("x-csrftoken", header_value(csrf)?);
        headers.insert("x-requested-with", HeaderValue::from_static("XMLHttpRequest"));
        headers.insert(COOKIE, header_value(&self.credentials.cookie_header())?);
        if let Some(origin) = origin_of(&self.base_url) {
            headers.insert(REFERER, header_value(&format!("{origin}/"))?);
        }
        Ok(headers)
    }

    async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .query(query)
            .send()
            .await?;
        decode_json(resp).await
    }

    async fn post_form(&self, path: &str, form: &[(&str, &str)]) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .form(form)
            .send()
            .await?;
        let body = decode_json(resp).await?;
        ensure_ok(&body)?;
        Ok(body)
    }

    /// Resolve a username to its numeric id and relationship flags.
    pub async fn web_profile_info(&self, username: &str) -> Result<ProfileInfo> {
        tracing::debug!(username, "Fetching web profile info");
        let body = self
            .get_json("/users/web_profile_info/", &[("username", username)])
            .await?;
        let envelope: WebProfileEnvelope = serde_json::from_value(body)?;
        envelope
            .data
            .and_then(|d| d.user)
            .map(ProfileInfo::from)
            .ok_or_else(|| ApiError::Parse(format!("no user in profile payload for {username}")))
    }

    /// Raw story reel payload for one account. The shape varies between
    /// `reels` keyed by id and a `reels_media` array; callers normalize.
    pub async fn reels_media(&self, user_id: &str) -> Result<Value> {
        tracing::debug!(user_id, "Fetching reels media");
        self.get_json("/feed/reels_media/", &[("reel_ids", user_id)])
            .await
    }

    /// Create (or fetch the existing) one-to-one thread with a user.
    pub async fn create_group_thread(&self, user_id: &str) -> Result<String> {
        let recipients = serde_json::to_string(&[user_id])?;
        let body = self
            .post_form(
                "/direct_v2/create_group_thread/",
                &[("recipient_users", recipients.as_str())],
            )
            .await?;
        thread_id_of(&body).ok_or_else(|| ApiError::Parse("no thread_id in response".into()))
    }

    /// Reply to a story item in the owner's direct thread.
    pub async fn broadcast_reel_share(
        &self,
        story_id: &str,
        owner_user_id: &str,
        thread_id: &str,
        text: &str,
    ) -> Result<BroadcastAck> {
        let client_context = new_client_context();
        let media_id = format!("{story_id}_{owner_user_id}");
        let thread_ids = format!("[{thread_id}]");
        let body = self
            .post_form(
                "/direct_v2/threads/broadcast/reel_share/",
                &[
                    ("media_id", media_id.as_str()),
                    ("reel_id", owner_user_id),
                    ("thread_id", thread_id),
                    ("thread_ids", thread_ids.as_str()),
                    ("text", text),
                    ("client_context", client_context.as_str()),
                    ("offline_threading_id", client_context.as_str()),
                ],
            )
            .await?;
        Ok(BroadcastAck {
            thread_id: thread_id.to_string(),
            client_context,
            item_id: item_id_of(&body),
        })
    }

    /// Send a plain text message to a thread.
    pub async fn broadcast_text(&self, thread_id: &str, text: &str) -> Result<BroadcastAck> {
        let client_context = new_client_context();
        let thread_ids = format!("[{thread_id}]");
        let body = self
            .post_form(
                "/direct_v2/threads/broadcast/text/",
                &[
                    ("thread_ids", thread_ids.as_str()),
                    ("text", text),
                    ("client_context", client_context.as_str()),
                    ("offline_threading_id", client_context.as_str()),
                ],
            )
            .await?;
        Ok(BroadcastAck {
            thread_id: thread_id.to_string(),
            client_context,
            item_id: item_id_of(&body),
        })
    }

    /// Download a media file. Any content type is accepted.
    pub async fn download_media(&self, url: &str) -> Result<MediaDownload> {
        let resp = self
            .client
            .get(url)
            .header(USER_AGENT, header_value(&self.credentials.user_agent)?)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ApiError::Http {
                status: status.as_u16(),
                message: format!("media download failed for {url}"),
            });
        }

        let final_url = resp.url().to_string();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let bytes = resp.bytes().await?.to_vec();

        Ok(MediaDownload {
            bytes,
            content_type,
            final_url,
        })
    }
}

/// Check status + content type, then parse. Non-2xx and non-JSON bodies are
/// classified errors, never panics.
async fn decode_json(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    if !status.is_success() {
        let message = resp.text().await.unwrap_or_default();
        return Err(ApiError::Http {
            status: status.as_u16(),
            message: truncate(&message, 300),
        });
    }

    if !is_json_content_type(content_type.as_deref()) {
        return Err(ApiError::NonJson { content_type });
    }

    let text = resp.text().await?;
    Ok(serde_json::from_str(&text)?)
}

fn ensure_ok(body: &Value) -> Result<()> {
    let status = body.get("status").and_then(Value::as_str).unwrap_or("");
    if status == "ok" {
        return Ok(());
    }
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Err(ApiError::NotOk {
        status: status.to_string(),
        message,
    })
}

pub fn is_json_content_type(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| {
            let ct = ct.to_ascii_lowercase();
            ct.starts_with("application/json") || ct.contains("+json")
        })
        .unwrap_or(false)
}

fn thread_id_of(body: &Value) -> Option<String> {
    ["thread_id", "thread_v2_id"].iter().find_map(|key| {
        let v = body.get(*key)?;
        v.as_str()
            .map(String::from)
            .or_else(|| v.as_u64().map(|n| n.to_string()))
            .filter(|s| !s.is_empty())
    })
}

fn item_id_of(body: &Value) -> Option<String> {
    body.pointer("/payload/item_id")
        .and_then(Value::as_str)
        .map(String::from)
}

fn new_client_context() -> String {
    // Numeric context, as produced by the web client.
    let n = uuid::Uuid::new_v4().as_u128() >> 66;
    n.to_string()
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| ApiError::Parse(format!("invalid header value: {e}")))
}

fn origin_of(base_url: &str) -> Option<String> {
    let rest = base_url.split_once("://")?;
    let host = rest.1.split('/').next()?;
    Some(format!("{}://{}", rest.0, host))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}
