// Persistence seam for the only durable state the pipeline owns: the
// engagement ledger, per-target interaction state, and the per-account run
// lock. Profiles are read-only here; follow-graph sync writes them.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use anyhow::Result;
use async_trait::async_trait;
use engage_common::{InteractionChannel, InteractionState, LedgerEntry, LedgerKind, ProfileRecord};
use serde_json::Value;

#[async_trait]
pub trait EngagementStore: Send + Sync {
    /// Insert unless `(kind, external_id)` already exists. Returns whether a
    /// row was written.
    async fn append_entry(&self, entry: &LedgerEntry) -> Result<bool>;

    /// Entries of one kind for a subject, most recent first.
    async fn entries(&self, subject: &str, kind: LedgerKind, limit: usize)
        -> Result<Vec<LedgerEntry>>;

    /// Merge `patch` (an object) into an existing entry's metadata.
    async fn annotate_entry(
        &self,
        subject: &str,
        kind: LedgerKind,
        external_id: &str,
        patch: &Value,
    ) -> Result<bool>;

    async fn interaction_state(
        &self,
        subject: &str,
        channel: InteractionChannel,
    ) -> Result<Option<InteractionState>>;

    async fn save_interaction_state(
        &self,
        subject: &str,
        channel: InteractionChannel,
        state: &InteractionState,
    ) -> Result<()>;

    async fn profile(&self, username: &str) -> Result<Option<ProfileRecord>>;

    /// `false` when another run holds the lock.
    async fn acquire_run_lock(&self, account: &str) -> Result<bool>;

    async fn release_run_lock(&self, account: &str) -> Result<()>;
}

/// Shallow JSON object merge; non-object patches are ignored.
pub(crate) fn merge_metadata(target: &mut Value, patch: &Value) {
    let Some(patch) = patch.as_object() else {
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Some(map) = target.as_object_mut() {
        for (k, v) in patch {
            map.insert(k.clone(), v.clone());
        }
    }
}
