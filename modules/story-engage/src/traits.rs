// Trait seams for the pipeline's collaborators.
//
// StoryApi: the private JSON API (ApiClient in production).
// CommentGenerator: external analysis + comment generation.
// MediaSink: object storage / archival hand-off for downloaded media.
//
// Mocks for all three live in `testing`, so the traversal engine can be
// exercised with no network and no browser.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use story_api_client::{ApiClient, BroadcastAck, MediaDownload, ProfileInfo};

use crate::analysis::CommentSuggestions;

// ---------------------------------------------------------------------------
// StoryApi
// ---------------------------------------------------------------------------

#[async_trait]
pub trait StoryApi: Send + Sync {
    async fn profile_info(&self, username: &str) -> story_api_client::Result<ProfileInfo>;

    /// Raw reel payload; shape normalization happens in the resolver.
    async fn reels_media(&self, user_id: &str) -> story_api_client::Result<Value>;

    async fn create_thread(&self, user_id: &str) -> story_api_client::Result<String>;

    async fn send_story_reply(
        &self,
        story_id: &str,
        owner_user_id: &str,
        thread_id: &str,
        text: &str,
    ) -> story_api_client::Result<BroadcastAck>;

    async fn send_text(&self, thread_id: &str, text: &str)
        -> story_api_client::Result<BroadcastAck>;

    async fn download_media(&self, url: &str) -> story_api_client::Result<MediaDownload>;
}

#[async_trait]
impl StoryApi for ApiClient {
    async fn profile_info(&self, username: &str) -> story_api_client::Result<ProfileInfo> {
        self.web_profile_info(username).await
    }

    async fn reels_media(&self, user_id: &str) -> story_api_client::Result<Value> {
        ApiClient::reels_media(self, user_id).await
    }

    async fn create_thread(&self, user_id: &str) -> story_api_client::Result<String> {
        self.create_group_thread(user_id).await
    }

    async fn send_story_reply(
        &self,
        story_id: &str,
        owner_user_id: &str,
        thread_id: &str,
        text: &str,
    ) -> story_api_client::Result<BroadcastAck> {
        self.broadcast_reel_share(story_id, owner_user_id, thread_id, text)
            .await
    }

    async fn send_text(
        &self,
        thread_id: &str,
        text: &str,
    ) -> story_api_client::Result<BroadcastAck> {
        self.broadcast_text(thread_id, text).await
    }

    async fn download_media(&self, url: &str) -> story_api_client::Result<MediaDownload> {
        ApiClient::download_media(self, url).await
    }
}

// ---------------------------------------------------------------------------
// CommentGenerator
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CommentGenerator: Send + Sync {
    /// Analyze media and propose candidate comments. Plain data in, plain data out.
    async fn generate(
        &self,
        media: &[u8],
        content_type: Option<&str>,
        context: &Value,
    ) -> Result<CommentSuggestions>;
}

// ---------------------------------------------------------------------------
// MediaSink
// ---------------------------------------------------------------------------

#[async_trait]
pub trait MediaSink: Send + Sync {
    /// Persist downloaded bytes; returns a storage key when one was assigned.
    async fn store(
        &self,
        subject: &str,
        story_id: &str,
        filename: &str,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<Option<String>>;
}
