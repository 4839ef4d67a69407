// Postgres persistence for the ledger, interaction state, and run locks.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engage_common::{InteractionChannel, InteractionState, InteractionStatus, LedgerEntry, LedgerKind, ProfileRecord};
use serde_json::Value;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use super::EngagementStore;

/// Locks older than this are treated as left behind by a crashed run.
const STALE_LOCK_HOURS: i32 = 6;

pub struct PgStore {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct LedgerRow {
    subject: String,
    kind: String,
    external_id: String,
    occurred_at: DateTime<Utc>,
    metadata: Value,
}

#[derive(Debug, sqlx::FromRow)]
struct StateRow {
    status: String,
    reason: Option<String>,
    checked_at: Option<DateTime<Utc>>,
    retry_after: Option<DateTime<Utc>>,
    reaction_available: Option<bool>,
}

#[derive(Debug, sqlx::FromRow)]
struct ProfileRow {
    username: String,
    user_id: Option<String>,
    following: bool,
    follows_you: bool,
    auto_reply: bool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to Postgres")?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        Ok(())
    }
}

#[async_trait]
impl EngagementStore for PgStore {
    async fn append_entry(&self, entry: &LedgerEntry) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO engagement_ledger
                (id, subject, kind, external_id, occurred_at, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (kind, external_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&entry.subject)
        .bind(entry.kind.as_str())
        .bind(&entry.external_id)
        .bind(entry.occurred_at)
        .bind(&entry.metadata)
        .execute(&self.pool)
        .await
        .context("inserting ledger entry")?;

        Ok(result.rows_affected() == 1)
    }

    async fn entries(
        &self,
        subject: &str,
        kind: LedgerKind,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, LedgerRow>(
            r#"
            SELECT subject, kind, external_id, occurred_at, metadata
            FROM engagement_ledger
            WHERE subject = $1 AND kind = $2
            ORDER BY occurred_at DESC
            LIMIT $3
            "#,
        )
        .bind(subject)
        .bind(kind.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match LedgerKind::parse(&row.kind) {
                Some(kind) => Some(LedgerEntry {
                    subject: row.subject,
                    kind,
                    external_id: row.external_id,
                    occurred_at: row.occurred_at,
                    metadata: row.metadata,
                }),
                None => {
                    warn!(kind = %row.kind, "Unknown ledger kind in database");
                    None
                }
            })
            .collect())
    }

    async fn annotate_entry(
        &self,
        subject: &str,
        kind: LedgerKind,
        external_id: &str,
        patch: &Value,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE engagement_ledger
            SET metadata = COALESCE(metadata, '{}'::jsonb) || $4
            WHERE subject = $1 AND kind = $2 AND external_id = $3
            "#,
        )
        .bind(subject)
        .bind(kind.as_str())
        .bind(external_id)
        .bind(patch)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn interaction_state(
        &self,
        subject: &str,
        channel: InteractionChannel,
    ) -> Result<Option<InteractionState>> {
        let row = sqlx::query_as::<_, StateRow>(
            r#"
            SELECT status, reason, checked_at, retry_after, reaction_available
            FROM interaction_states
            WHERE subject = $1 AND channel = $2
            "#,
        )
        .bind(subject)
        .bind(channel.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| InteractionState {
            status: InteractionStatus::parse(&r.status),
            reason: r.reason,
            checked_at: r.checked_at,
            retry_after: r.retry_after,
            reaction_available: r.reaction_available,
        }))
    }

    async fn save_interaction_state(
        &self,
        subject: &str,
        channel: InteractionChannel,
        state: &InteractionState,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO interaction_states
                (subject, channel, status, reason, checked_at, retry_after, reaction_available)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (subject, channel) DO UPDATE SET
                status = EXCLUDED.status,
                reason = EXCLUDED.reason,
                checked_at = EXCLUDED.checked_at,
                retry_after = EXCLUDED.retry_after,
                reaction_available = EXCLUDED.reaction_available
            "#,
        )
        .bind(subject)
        .bind(channel.as_str())
        .bind(state.status.as_str())
        .bind(&state.reason)
        .bind(state.checked_at)
        .bind(state.retry_after)
        .bind(state.reaction_available)
        .execute(&self.pool)
        .await
        .context("saving interaction state")?;
        Ok(())
    }

    async fn profile(&self, username: &str) -> Result<Option<ProfileRecord>> {
        let row = sqlx::query_as::<_, ProfileRow>(
            r#"
            SELECT username, user_id, following, follows_you, auto_reply
            FROM profiles
            WHERE username = $1
            "#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ProfileRecord {
            username: r.username,
            user_id: r.user_id,
            following: r.following,
            follows_you: r.follows_you,
            auto_reply: r.auto_reply,
        }))
    }

    async fn acquire_run_lock(&self, account: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO run_locks (account, acquired_at)
            VALUES ($1, now())
            ON CONFLICT (account) DO UPDATE SET acquired_at = now()
            WHERE run_locks.acquired_at < now() - make_interval(hours => $2)
            "#,
        )
        .bind(account)
        .bind(STALE_LOCK_HOURS)
        .execute(&self.pool)
        .await
        .context("acquiring run lock")?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_run_lock(&self, account: &str) -> Result<()> {
        sqlx::query("DELETE FROM run_locks WHERE account = $1")
            .bind(account)
            .execute(&self.pool)
            .await
            .context("releasing run lock")?;
        Ok(())
    }
}
