use std::collections::{HashMap, HashSet};

use engage_common::StoryItem;
use story_api_client::ProfileInfo;

/// Run-lifetime state. Created at the start of a traversal and dropped at
/// the end; nothing in here is shared between runs or accounts.
#[derive(Debug, Default)]
pub struct RunContext {
    /// Story keys already seen this run.
    pub visited: HashSet<String>,
    pub(crate) stories: HashMap<String, Vec<StoryItem>>,
    pub(crate) profiles: HashMap<String, ProfileInfo>,
    /// user id -> direct thread id
    pub(crate) thread_ids: HashMap<String, String>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the key was already visited.
    pub fn mark_visited(&mut self, story_key: &str) -> bool {
        self.visited.insert(story_key.to_string())
    }

    pub fn is_visited(&self, story_key: &str) -> bool {
        self.visited.contains(story_key)
    }

    pub fn cached_thread(&self, user_id: &str) -> Option<&str> {
        self.thread_ids.get(user_id).map(String::as_str)
    }

    pub fn remember_thread(&mut self, user_id: &str, thread_id: &str) {
        self.thread_ids
            .insert(user_id.to_string(), thread_id.to_string());
    }
}
