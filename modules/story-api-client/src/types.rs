use serde::{Deserialize, Serialize};

/// Default web app id sent as `X-IG-App-ID`.
pub const DEFAULT_APP_ID: &str = "936619743392459";

/// Desktop Chrome user agent used when none is configured.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Authenticated session material captured from a logged-in browser.
#[derive(Clone)]
pub struct SessionCredentials {
    cookies: Vec<(String, String)>,
    pub app_id: String,
    pub user_agent: String,
}

impl SessionCredentials {
    /// Build credentials from a raw `Cookie` header (`name=value; name2=value2`).
    pub fn from_cookie_header(header: &str, app_id: &str, user_agent: &str) -> Self {
        let cookies = header
            .split(';')
            .filter_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                Some((name.to_string(), value.trim().to_string()))
            })
            .collect();

        Self {
            cookies,
            app_id: app_id.to_string(),
            user_agent: user_agent.to_string(),
        }
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    }

    /// CSRF token sourced from the `csrftoken` cookie.
    pub fn csrf_token(&self) -> Option<&str> {
        self.cookie("csrftoken")
    }

    /// Numeric id of the logged-in account, if the jar carries it.
    pub fn viewer_id(&self) -> Option<&str> {
        self.cookie("ds_user_id")
    }

    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(n, v)| format!("{n}={v}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl std::fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.cookies.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("SessionCredentials")
            .field("cookies", &names)
            .field("app_id", &self.app_id)
            .finish()
    }
}

/// Account id and relationship flags from `web_profile_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileInfo {
    pub user_id: String,
    pub username: String,
    pub full_name: Option<String>,
    pub is_private: bool,
    pub followed_by_viewer: bool,
    pub follows_viewer: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WebProfileEnvelope {
    pub data: Option<WebProfileData>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WebProfileData {
    pub user: Option<WebProfileUser>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WebProfileUser {
    pub id: String,
    pub username: String,
    pub full_name: Option<String>,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub followed_by_viewer: bool,
    #[serde(default)]
    pub follows_viewer: bool,
}

impl From<WebProfileUser> for ProfileInfo {
    fn from(u: WebProfileUser) -> Self {
        Self {
            user_id: u.id,
            username: u.username,
            full_name: u.full_name,
            is_private: u.is_private,
            followed_by_viewer: u.followed_by_viewer,
            follows_viewer: u.follows_viewer,
        }
    }
}

/// Acknowledgement of a direct broadcast (story reply or text message).
#[derive(Debug, Clone)]
pub struct BroadcastAck {
    pub thread_id: String,
    pub client_context: String,
    pub item_id: Option<String>,
}

/// Raw bytes of a downloaded media file.
#[derive(Debug, Clone)]
pub struct MediaDownload {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub final_url: String,
}
