// Local-directory media sink. Files land under `<root>/<subject>/<filename>`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::traits::MediaSink;

pub struct LocalDirSink {
    root: PathBuf,
}

impl LocalDirSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, subject: &str, filename: &str) -> PathBuf {
        self.root
            .join(sanitize_component(subject))
            .join(sanitize_component(filename))
    }
}

#[async_trait]
impl MediaSink for LocalDirSink {
    async fn store(
        &self,
        subject: &str,
        _story_id: &str,
        filename: &str,
        bytes: &[u8],
        _content_type: Option<&str>,
    ) -> Result<Option<String>> {
        let path = self.path_for(subject, filename);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        debug!(path = %path.display(), bytes = bytes.len(), "Stored media");
        Ok(Some(relative_key(&self.root, &path)))
    }
}

/// Build a download filename from story id and content type.
pub fn media_filename(story_id: &str, content_type: Option<&str>, is_video: bool) -> String {
    let ext = match content_type.map(|ct| ct.split(';').next().unwrap_or("").trim()) {
        Some("image/png") => "png",
        Some("image/webp") => "webp",
        Some("image/heic") => "heic",
        Some("video/mp4") => "mp4",
        Some(ct) if ct.starts_with("video/") => "mp4",
        Some(ct) if ct.starts_with("image/") => "jpg",
        _ if is_video => "mp4",
        _ => "jpg",
    };
    format!("story_{}.{ext}", sanitize_component(story_id))
}

fn sanitize_component(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

fn relative_key(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}
