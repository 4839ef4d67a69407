use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use engage_common::{InteractionChannel, InteractionState, LedgerEntry, LedgerKind, ProfileRecord};
use serde_json::Value;

use super::{merge_metadata, EngagementStore};

/// In-process store. Used by tests and when no `DATABASE_URL` is set, in
/// which case nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: Vec<LedgerEntry>,
    states: HashMap<(String, InteractionChannel), InteractionState>,
    profiles: HashMap<String, ProfileRecord>,
    locks: HashSet<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profiles(profiles: impl IntoIterator<Item = ProfileRecord>) -> Self {
        let store = Self::default();
        for profile in profiles {
            store.put_profile(profile);
        }
        store
    }

    pub fn put_profile(&self, profile: ProfileRecord) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.profiles.insert(profile.username.clone(), profile);
        }
    }

    /// Every entry in insertion order.
    pub fn all_entries(&self) -> Vec<LedgerEntry> {
        self.inner
            .lock()
            .map(|inner| inner.entries.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("memory store mutex poisoned"))
    }
}

#[async_trait]
impl EngagementStore for MemoryStore {
    async fn append_entry(&self, entry: &LedgerEntry) -> Result<bool> {
        let mut inner = self.lock()?;
        let exists = inner
            .entries
            .iter()
            .any(|e| e.kind == entry.kind && e.external_id == entry.external_id);
        if exists {
            return Ok(false);
        }
        inner.entries.push(entry.clone());
        Ok(true)
    }

    async fn entries(
        &self,
        subject: &str,
        kind: LedgerKind,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let inner = self.lock()?;
        let mut matching: Vec<LedgerEntry> = inner
            .entries
            .iter()
            .filter(|e| e.subject == subject && e.kind == kind)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps; reverse after.
        matching.sort_by_key(|e| e.occurred_at);
        matching.reverse();
        matching.truncate(limit);
        Ok(matching)
    }

    async fn annotate_entry(
        &self,
        subject: &str,
        kind: LedgerKind,
        external_id: &str,
        patch: &Value,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        let found = inner
            .entries
            .iter_mut()
            .find(|e| e.subject == subject && e.kind == kind && e.external_id == external_id);
        match found {
            Some(entry) => {
                merge_metadata(&mut entry.metadata, patch);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn interaction_state(
        &self,
        subject: &str,
        channel: InteractionChannel,
    ) -> Result<Option<InteractionState>> {
        let inner = self.lock()?;
        Ok(inner.states.get(&(subject.to_string(), channel)).cloned())
    }

    async fn save_interaction_state(
        &self,
        subject: &str,
        channel: InteractionChannel,
        state: &InteractionState,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        inner
            .states
            .insert((subject.to_string(), channel), state.clone());
        Ok(())
    }

    async fn profile(&self, username: &str) -> Result<Option<ProfileRecord>> {
        let inner = self.lock()?;
        Ok(inner.profiles.get(username).cloned())
    }

    async fn acquire_run_lock(&self, account: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        Ok(inner.locks.insert(account.to_string()))
    }

    async fn release_run_lock(&self, account: &str) -> Result<()> {
        let mut inner = self.lock()?;
        inner.locks.remove(account);
        Ok(())
    }
}
