// Carousel traversal: the state machine that walks the story carousel one
// story at a time.
//
// Each tick: resolve what is on screen, dedupe by story key, resolve the
// authoritative item, run the checks (network, backoff, attribution, reply
// capability, video, prior reply, media quality), generate and rank a
// comment, send it through the dual-channel executor, record, advance.
//
// Per-story errors are counted and recorded, never fatal. A browser
// disconnect that survives session recovery ends the run. Every run ends
// with a `traversal_ended` ledger entry carrying the stats.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use browser_session::BrowserError;
use chrono::Utc;
use engage_common::{
    CarouselContext, EngageError, InteractionChannel, InteractionStatus, LedgerKind, MediaAsset,
    StoryItem,
};
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use story_api_client::ApiError;
use tracing::{debug, info, warn};

use crate::attribution::{self, AttributionVerdict};
use crate::context::RunContext;
use crate::executor::{self, ExecutionResult, VerifyConfig};
use crate::gate::InteractionGate;
use crate::ledger::{EngagementLedger, ReplyKeys};
use crate::media::media_filename;
use crate::probe::{PageProbe, Probe};
use crate::quality;
use crate::ranker;
use crate::resolver::StoryResolver;
use crate::session::{with_session_recovery, RecoveryPolicy};
use crate::store::EngagementStore;
use crate::traits::{CommentGenerator, MediaSink, StoryApi};

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StoryLimitReached,
    StoryContextUnresolved,
    AdvanceFailed,
    DuplicateStoryKeyNoProgress,
    StoryLoopDetected,
    SafetyLimitReached,
    CarouselNotOpened,
    SessionLost,
    BrowserFailure,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StoryLimitReached => "story_limit_reached",
            ExitReason::StoryContextUnresolved => "story_context_unresolved",
            ExitReason::AdvanceFailed => "advance_failed",
            ExitReason::DuplicateStoryKeyNoProgress => "duplicate_story_key_no_progress",
            ExitReason::StoryLoopDetected => "story_loop_detected",
            ExitReason::SafetyLimitReached => "safety_limit_reached",
            ExitReason::CarouselNotOpened => "carousel_not_opened",
            ExitReason::SessionLost => "session_lost",
            ExitReason::BrowserFailure => "browser_failure",
        }
    }
}

/// Stats from a traversal run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct TraversalStats {
    /// Unique story keys processed.
    pub visited: u32,
    pub commented: u32,
    pub reacted: u32,
    pub downloaded: u32,
    pub reply_failed: u32,
    /// Unexpected per-story errors.
    pub failed: u32,
    /// `skipped_<reason>` -> count
    pub skipped: BTreeMap<String, u32>,
    pub exit_reason: Option<ExitReason>,
}

impl TraversalStats {
    pub fn skipped(&self, reason: &str) -> u32 {
        self.skipped
            .get(&format!("skipped_{reason}"))
            .copied()
            .unwrap_or(0)
    }

    fn count_skip(&mut self, reason: &str) {
        *self.skipped.entry(format!("skipped_{reason}")).or_default() += 1;
    }
}

impl std::fmt::Display for TraversalStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== Story Traversal Complete ===")?;
        writeln!(
            f,
            "Exit reason:  {}",
            self.exit_reason.map(|r| r.as_str()).unwrap_or("none")
        )?;
        writeln!(f, "Visited:      {}", self.visited)?;
        writeln!(f, "Commented:    {}", self.commented)?;
        writeln!(f, "Reacted:      {}", self.reacted)?;
        writeln!(f, "Downloaded:   {}", self.downloaded)?;
        writeln!(f, "Reply failed: {}", self.reply_failed)?;
        writeln!(f, "Failed:       {}", self.failed)?;
        if !self.skipped.is_empty() {
            writeln!(f, "\nSkipped:")?;
            for (reason, count) in &self.skipped {
                writeln!(f, "  {reason}: {count}")?;
            }
        }
        Ok(())
    }
}

/// Pipeline tunables.
#[derive(Debug, Clone)]
pub struct TraversalConfig {
    pub pacing: Duration,
    pub pacing_jitter: Duration,
    /// How long the DOM reply-box probe waits.
    pub reply_probe_timeout: Duration,
    /// Consecutive revisits tolerated while advancing still works.
    pub max_revisits: u32,
    /// `safety_limit = story_limit * safety_factor`
    pub safety_factor: usize,
    pub verify: VerifyConfig,
    pub recovery: RecoveryPolicy,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            pacing: Duration::from_millis(2500),
            pacing_jitter: Duration::from_millis(1500),
            reply_probe_timeout: Duration::from_secs(6),
            max_revisits: 3,
            safety_factor: 5,
            verify: VerifyConfig::default(),
            recovery: RecoveryPolicy::default(),
        }
    }
}

/// Collaborators the engine is built from.
pub struct EngineDeps {
    pub probe: Arc<dyn PageProbe>,
    pub api: Arc<dyn StoryApi>,
    pub generator: Arc<dyn CommentGenerator>,
    pub sink: Arc<dyn MediaSink>,
    pub store: Arc<dyn EngagementStore>,
}

pub struct StoryEngine {
    account: String,
    probe: Arc<dyn PageProbe>,
    api: Arc<dyn StoryApi>,
    generator: Arc<dyn CommentGenerator>,
    sink: Arc<dyn MediaSink>,
    store: Arc<dyn EngagementStore>,
    ledger: EngagementLedger,
    gate: InteractionGate,
    config: TraversalConfig,
}

/// True when a browser disconnect is anywhere in the error chain.
pub fn is_disconnect(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<BrowserError>()
            .is_some_and(BrowserError::is_disconnect)
    })
}

impl StoryEngine {
    pub fn new(account: &str, deps: EngineDeps, config: TraversalConfig) -> Self {
        Self {
            account: account.to_string(),
            ledger: EngagementLedger::new(deps.store.clone()),
            gate: InteractionGate::new(deps.store.clone(), config.reply_probe_timeout),
            probe: deps.probe,
            api: deps.api,
            generator: deps.generator,
            sink: deps.sink,
            store: deps.store,
            config,
        }
    }

    pub fn ledger(&self) -> &EngagementLedger {
        &self.ledger
    }

    /// Walk the carousel for up to `story_limit` new stories. Holds the
    /// account's run lock for the duration.
    pub async fn run(
        &self,
        story_limit: usize,
        auto_reply_only: bool,
    ) -> Result<TraversalStats, EngageError> {
        let acquired = self
            .store
            .acquire_run_lock(&self.account)
            .await
            .map_err(|e| EngageError::Database(e.to_string()))?;
        if !acquired {
            return Err(EngageError::RunLockConflict(self.account.clone()));
        }

        let stats = self.run_inner(story_limit, auto_reply_only).await;

        if let Err(e) = self.store.release_run_lock(&self.account).await {
            warn!(account = %self.account, error = %e, "Failed to release run lock");
        }

        Ok(stats)
    }

    async fn run_inner(&self, story_limit: usize, auto_reply_only: bool) -> TraversalStats {
        info!(
            account = %self.account,
            story_limit,
            auto_reply_only,
            "Starting story traversal"
        );
        let mut ctx = RunContext::new();
        let mut stats = TraversalStats::default();

        let exit = match self
            .traverse(&mut ctx, &mut stats, story_limit, auto_reply_only)
            .await
        {
            Ok(exit) => exit,
            Err(e) if is_disconnect(&e) => {
                warn!(error = %e, "Browser session lost beyond recovery");
                ExitReason::SessionLost
            }
            Err(e) => {
                warn!(error = %e, "Traversal aborted by browser failure");
                ExitReason::BrowserFailure
            }
        };
        stats.exit_reason = Some(exit);

        let mut metadata = serde_json::to_value(&stats).unwrap_or_else(|_| json!({}));
        metadata["exit_reason"] = json!(exit.as_str());
        metadata["story_limit"] = json!(story_limit);
        metadata["auto_reply_only"] = json!(auto_reply_only);
        self.ledger
            .record(&self.account, LedgerKind::TraversalEnded, "run", metadata)
            .await;

        info!("{stats}");
        stats
    }

    async fn traverse(
        &self,
        ctx: &mut RunContext,
        stats: &mut TraversalStats,
        story_limit: usize,
        auto_reply_only: bool,
    ) -> Result<ExitReason> {
        if story_limit == 0 {
            return Ok(ExitReason::StoryLimitReached);
        }
        let probe = self.probe.as_ref();
        let policy = &self.config.recovery;

        let opened = with_session_recovery(probe, "open_carousel", policy, || probe.open_carousel())
            .await?;
        if !opened {
            return Ok(ExitReason::CarouselNotOpened);
        }

        let safety_limit = story_limit.saturating_mul(self.config.safety_factor).max(1);
        let mut unresolved_streak = 0u32;
        let mut revisit_streak = 0u32;

        for tick in 0..safety_limit {
            let context = self.resolve_context().await?;
            let resolved = context
                .filter(CarouselContext::is_resolved)
                .and_then(|c| c.story_key().map(|key| (c, key)));

            let Some((context, story_key)) = resolved else {
                unresolved_streak += 1;
                debug!(tick, unresolved_streak, "Story context unresolved");
                if unresolved_streak >= 2 {
                    return Ok(ExitReason::StoryContextUnresolved);
                }
                self.pace().await;
                continue;
            };
            unresolved_streak = 0;

            if ctx.is_visited(&story_key) {
                revisit_streak += 1;
                debug!(story_key = %story_key, revisit_streak, "Story already visited");
                if revisit_streak > self.config.max_revisits {
                    return Ok(ExitReason::StoryLoopDetected);
                }
                if !self.advance().await? {
                    return Ok(ExitReason::DuplicateStoryKeyNoProgress);
                }
                continue;
            }
            revisit_streak = 0;
            ctx.mark_visited(&story_key);
            stats.visited += 1;

            if let Err(e) = self
                .process_story(ctx, &context, &story_key, stats, auto_reply_only)
                .await
            {
                if is_disconnect(&e) {
                    return Err(e);
                }
                stats.failed += 1;
                warn!(story_key = %story_key, error = %e, "Story processing failed");
                let subject = context.username.as_deref().unwrap_or_default();
                self.ledger
                    .record(
                        subject,
                        LedgerKind::StoryProcessingFailed,
                        &story_key,
                        json!({
                            "story_key": story_key,
                            "story_ref": context.story_ref,
                            "error": e.to_string(),
                            "error_chain": e.chain().skip(1).map(|c| c.to_string()).collect::<Vec<_>>(),
                        }),
                    )
                    .await;
            }

            if stats.visited as usize >= story_limit {
                return Ok(ExitReason::StoryLimitReached);
            }

            self.pace().await;
            if !self.advance().await? {
                return Ok(ExitReason::AdvanceFailed);
            }
        }

        Ok(ExitReason::SafetyLimitReached)
    }

    /// Current context, with one URL-based recovery when ownership is ambiguous.
    async fn resolve_context(&self) -> Result<Option<CarouselContext>> {
        let probe = self.probe.as_ref();
        let policy = &self.config.recovery;
        let first = match with_session_recovery(probe, "carousel_context", policy, || {
            probe.carousel_context()
        })
        .await
        {
            Ok(found) => found,
            Err(e) if e.is_disconnect() => return Err(e.into()),
            // A page script failing on a drifting DOM reads as "unresolved".
            Err(e) => {
                warn!(error = %e, "Story context read failed");
                return Ok(None);
            }
        };

        match first {
            Probe::Found(context) => Ok(Some(context)),
            Probe::NotFound => Ok(None),
            Probe::Ambiguous(candidates) => {
                let Some(target) = candidates.split(',').map(str::trim).find(|c| !c.is_empty())
                else {
                    return Ok(None);
                };
                info!(target, candidates = %candidates, "Ambiguous story owner, opening story root");
                with_session_recovery(probe, "open_story_root", policy, || {
                    probe.open_story_root(target)
                })
                .await?;
                match with_session_recovery(probe, "carousel_context", policy, || {
                    probe.carousel_context()
                })
                .await
                {
                    Ok(retry) => Ok(retry.found()),
                    Err(e) if e.is_disconnect() => Err(e.into()),
                    Err(e) => {
                        warn!(error = %e, "Story context re-read failed");
                        Ok(None)
                    }
                }
            }
        }
    }

    async fn advance(&self) -> Result<bool> {
        let probe = self.probe.as_ref();
        Ok(with_session_recovery(probe, "advance", &self.config.recovery, || probe.advance()).await?)
    }

    async fn pace(&self) {
        let jitter_ms = self.config.pacing_jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        let delay = self.config.pacing + jitter;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    async fn process_story(
        &self,
        ctx: &mut RunContext,
        context: &CarouselContext,
        story_key: &str,
        stats: &mut TraversalStats,
        auto_reply_only: bool,
    ) -> Result<()> {
        let username = context.username.clone().unwrap_or_default();
        let resolver = StoryResolver::new(self.api.as_ref());

        // Authoritative item; the live view stands in when the API gave nothing.
        let items = resolver.resolve_items(ctx, &username).await;
        let Some(item) = match_item(&items, context).or_else(|| StoryItem::from_context(context))
        else {
            self.skip(stats, &username, story_key, "unresolved_item", json!({}))
                .await;
            return Ok(());
        };
        debug!(
            username = %username,
            story_id = %item.story_id,
            source = ?item.source,
            "Processing story"
        );

        if !self.in_network(ctx, &resolver, &username).await? {
            self.skip_item(stats, &item, "not_in_network", json!({})).await;
            return Ok(());
        }

        let reply_state = self
            .gate
            .state(&username, InteractionChannel::StoryReply)
            .await?;
        if reply_state.retry_pending(Utc::now()) {
            self.skip_item(
                stats,
                &item,
                "backoff",
                json!({
                    "retry_after": reply_state.retry_after,
                    "state_reason": reply_state.reason,
                }),
            )
            .await;
            return Ok(());
        }

        let probe = self.probe.as_ref();
        let policy = &self.config.recovery;
        let item_ref = &item;
        let verdict = with_session_recovery(probe, "attribution", policy, move || {
            attribution::analyze(probe, item_ref)
        })
        .await?;
        match verdict {
            AttributionVerdict::Clear => {}
            AttributionVerdict::Ad(signal) => {
                info!(username = %username, story_id = %item.story_id, marker = %signal.marker, "Ad story skipped");
                self.skip_item(stats, &item, "ad", json!({ "ad": signal })).await;
                return Ok(());
            }
            AttributionVerdict::External(hit) => {
                info!(
                    username = %username,
                    story_id = %item.story_id,
                    reason = hit.reason,
                    "Externally attributed story skipped"
                );
                self.skip_item(stats, &item, "external_attribution", json!({ "attribution": hit }))
                    .await;
                return Ok(());
            }
        }

        let gate = &self.gate;
        let capability = with_session_recovery(probe, "reply_capability", policy, move || {
            gate.reply_capability(probe, item_ref)
        })
        .await?;
        if !capability.possible {
            self.react_instead(stats, &item, &capability.reason_code, capability.status)
                .await?;
            return Ok(());
        }

        if item.is_video() {
            // Archived, never replied to.
            self.download(stats, &item).await?;
            self.skip_item(stats, &item, "video", json!({})).await;
            return Ok(());
        }

        let keys = ReplyKeys::for_story(&item, Some(context));
        if let Some((prior, matched)) = self.ledger.prior_reply(&username, &keys).await? {
            self.skip_item(
                stats,
                &item,
                "already_replied",
                json!({ "matched_key": matched, "prior_external_id": prior.external_id }),
            )
            .await;
            return Ok(());
        }

        let Some(asset) = self.download(stats, &item).await? else {
            self.skip_item(stats, &item, "media_unavailable", json!({})).await;
            return Ok(());
        };

        let verdict = quality::evaluate(
            &asset.bytes,
            asset.content_type.as_deref(),
            item.width,
            item.height,
        );
        if verdict.skip {
            self.skip_item(
                stats,
                &item,
                "low_quality",
                json!({ "quality_reason": verdict.reason, "entropy": verdict.entropy, "bytes": asset.bytes.len() }),
            )
            .await;
            return Ok(());
        }

        if auto_reply_only && !self.auto_reply_enabled(&username).await? {
            self.skip_item(stats, &item, "auto_reply_disabled", json!({})).await;
            return Ok(());
        }

        let payload = json!({
            "account": self.account,
            "username": username,
            "story_id": item.story_id,
            "permalink": item.permalink,
            "media_type": item.media_type,
            "taken_at": item.taken_at,
        });
        let suggestions = self
            .generator
            .generate(&asset.bytes, asset.content_type.as_deref(), &payload)
            .await?;
        if !suggestions.ready {
            self.skip_item(stats, &item, "analysis_not_ready", json!({})).await;
            return Ok(());
        }

        let history = self.ledger.recent_comments(&username).await?;
        let Some(comment) = ranker::select(&suggestions.suggestions, &history) else {
            self.skip_item(stats, &item, "no_comment", json!({})).await;
            return Ok(());
        };

        let result = self.send_reply(ctx, &resolver, &item, &comment.text).await?;
        let mut metadata = keys.to_metadata();
        metadata["method"] = json!(result.method);
        metadata["api_reason"] = json!(result.api_reason);
        metadata["similarity"] = json!(comment.max_similarity);

        if result.posted {
            stats.commented += 1;
            metadata["comment_text"] = json!(comment.text);
            self.ledger
                .record(&username, LedgerKind::StoryReplySent, &item.story_id, metadata)
                .await;
            self.ledger
                .annotate_download(&username, &item.story_id, &comment.text)
                .await;
            self.gate
                .mark_state(
                    &username,
                    InteractionChannel::StoryReply,
                    InteractionStatus::ReplyAvailable,
                    "reply_sent",
                    reply_state.reaction_available,
                )
                .await?;
            info!(username = %username, story_id = %item.story_id, method = ?result.method, "Story reply sent");
        } else {
            stats.reply_failed += 1;
            metadata["reason"] = json!(result.reason);
            metadata["guidance"] = json!(result.guidance);
            metadata["comment_text"] = json!(comment.text);
            self.ledger
                .record(&username, LedgerKind::StoryReplyFailed, &item.story_id, metadata)
                .await;
        }
        Ok(())
    }

    /// Stored profile first, then the API's follow flags.
    async fn in_network(
        &self,
        ctx: &mut RunContext,
        resolver: &StoryResolver<'_>,
        username: &str,
    ) -> Result<bool> {
        if let Some(profile) = self.store.profile(username).await? {
            return Ok(profile.in_network());
        }
        Ok(resolver
            .profile(ctx, username)
            .await
            .is_some_and(|p| p.followed_by_viewer || p.follows_viewer))
    }

    async fn auto_reply_enabled(&self, username: &str) -> Result<bool> {
        Ok(self
            .store
            .profile(username)
            .await?
            .is_some_and(|p| p.auto_reply))
    }

    /// Consolation path when a reply is impossible.
    async fn react_instead(
        &self,
        stats: &mut TraversalStats,
        item: &StoryItem,
        reason: &str,
        status: InteractionStatus,
    ) -> Result<()> {
        let username = item.owner_username.as_str();
        let probe = self.probe.as_ref();
        let reacted = with_session_recovery(probe, "send_reaction", &self.config.recovery, || {
            probe.send_reaction()
        })
        .await?;
        let metadata = json!({
            "story_id": item.story_id,
            "permalink": item.permalink,
            "reply_reason": reason,
        });

        // Hard negatives keep their backoff even when the reaction landed.
        let next = match (reacted, status) {
            (_, InteractionStatus::Unavailable) => InteractionStatus::Unavailable,
            (true, _) => InteractionStatus::ReactionOnly,
            (false, other) => other,
        };
        if reacted {
            stats.reacted += 1;
            self.ledger
                .record(username, LedgerKind::StoryReactionSent, &item.story_id, metadata)
                .await;
        } else {
            self.ledger
                .record(username, LedgerKind::StoryReactionFailed, &item.story_id, metadata)
                .await;
        }
        self.gate
            .mark_state(username, InteractionChannel::StoryReply, next, reason, Some(reacted))
            .await?;
        stats.count_skip("unreplyable");
        info!(username, story_id = %item.story_id, reason, reacted, "Reply unavailable");
        Ok(())
    }

    /// Download, hand to the sink, record. `None` when the media could not
    /// be fetched.
    async fn download(&self, stats: &mut TraversalStats, item: &StoryItem) -> Result<Option<MediaAsset>> {
        let url = if item.is_video() {
            item.video_url.as_deref().or(item.media_url.as_deref())
        } else {
            item.media_url.as_deref().or(item.image_url.as_deref())
        };
        let Some(url) = url else {
            return Ok(None);
        };

        let download = match self.api.download_media(url).await {
            Ok(d) => d,
            Err(e) => {
                warn!(story_id = %item.story_id, reason = %e.reason_code(), "Media download failed");
                return Ok(None);
            }
        };

        let asset = MediaAsset {
            filename: media_filename(&item.story_id, download.content_type.as_deref(), item.is_video()),
            bytes: download.bytes,
            content_type: download.content_type,
            final_url: download.final_url,
        };

        let storage_key = match self
            .sink
            .store(
                &item.owner_username,
                &item.story_id,
                &asset.filename,
                &asset.bytes,
                asset.content_type.as_deref(),
            )
            .await
        {
            Ok(key) => key,
            Err(e) => {
                warn!(story_id = %item.story_id, error = %e, "Failed to store media");
                None
            }
        };

        stats.downloaded += 1;
        self.ledger
            .record(
                &item.owner_username,
                LedgerKind::StoryMediaDownloaded,
                &item.story_id,
                json!({
                    "story_id": item.story_id,
                    "permalink": item.permalink,
                    "media_type": item.media_type,
                    "content_type": asset.content_type,
                    "bytes": asset.bytes.len(),
                    "final_url": asset.final_url,
                    "storage_key": storage_key,
                }),
            )
            .await;
        Ok(Some(asset))
    }

    async fn send_reply(
        &self,
        ctx: &mut RunContext,
        resolver: &StoryResolver<'_>,
        item: &StoryItem,
        text: &str,
    ) -> Result<ExecutionResult> {
        let owner_id = match item.owner_user_id.clone() {
            Some(id) => Some(id),
            None => resolver.user_id(ctx, &item.owner_username).await,
        };

        let api = self.api.as_ref();
        let story_id = item.story_id.as_str();
        let api_attempt = async move {
            let owner_id = owner_id.ok_or(ApiError::MissingCredential("user_id"))?;
            let thread_id = thread_for(api, ctx, &owner_id).await?;
            api.send_story_reply(story_id, &owner_id, &thread_id, text)
                .await
        };

        let probe = self.probe.as_ref();
        let verify = &self.config.verify;
        let result = executor::execute("story_reply", api_attempt, move || {
            executor::submit_and_verify(probe, text, probe.submit_story_reply(text), verify)
        })
        .await?;
        Ok(result)
    }

    async fn skip_item(&self, stats: &mut TraversalStats, item: &StoryItem, reason: &str, extra: Value) {
        let mut metadata = json!({
            "story_id": item.story_id,
            "permalink": item.permalink,
            "source": item.source,
        });
        if let (Some(meta), Some(extra)) = (metadata.as_object_mut(), extra.as_object()) {
            meta.extend(extra.clone());
        }
        self.skip(stats, &item.owner_username, &item.story_id, reason, metadata)
            .await;
    }

    async fn skip(&self, stats: &mut TraversalStats, subject: &str, key: &str, reason: &str, mut metadata: Value) {
        stats.count_skip(reason);
        debug!(subject, key, reason, "Story skipped");
        metadata["reason"] = json!(reason);
        self.ledger
            .record(subject, LedgerKind::StorySkipped, key, metadata)
            .await;
    }
}

/// Thread id for a user, created once per run.
pub(crate) async fn thread_for(
    api: &dyn StoryApi,
    ctx: &mut RunContext,
    user_id: &str,
) -> story_api_client::Result<String> {
    if let Some(thread_id) = ctx.cached_thread(user_id) {
        return Ok(thread_id.to_string());
    }
    let thread_id = api.create_thread(user_id).await?;
    ctx.remember_thread(user_id, &thread_id);
    Ok(thread_id)
}

/// The resolved item for what is on screen: by story id, else by media path.
fn match_item(items: &[StoryItem], context: &CarouselContext) -> Option<StoryItem> {
    if let Some(id) = context.story_id.as_deref().or(context.story_ref.as_deref()) {
        if let Some(item) = items.iter().find(|i| i.story_id == id) {
            return Some(item.clone());
        }
    }
    let wanted = context
        .media_url
        .as_deref()
        .and_then(engage_common::normalize_media_url)?;
    items
        .iter()
        .find(|i| {
            i.media_url
                .as_deref()
                .and_then(engage_common::normalize_media_url)
                .as_deref()
                == Some(wanted.as_str())
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_display_lists_skips() {
        let mut stats = TraversalStats::default();
        stats.visited = 3;
        stats.count_skip("ad");
        stats.count_skip("ad");
        stats.exit_reason = Some(ExitReason::AdvanceFailed);
        let text = stats.to_string();
        assert!(text.contains("advance_failed"));
        assert!(text.contains("skipped_ad: 2"));
        assert_eq!(stats.skipped("ad"), 2);
        assert_eq!(stats.skipped("video"), 0);
    }

    #[test]
    fn stats_serialize_exit_reason_snake_case() {
        let stats = TraversalStats {
            exit_reason: Some(ExitReason::DuplicateStoryKeyNoProgress),
            ..Default::default()
        };
        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["exit_reason"], "duplicate_story_key_no_progress");
    }

    #[test]
    fn disconnect_detected_through_context() {
        let err = anyhow::Error::from(BrowserError::Disconnected("ws closed".into()))
            .context("advancing");
        assert!(is_disconnect(&err));
        let other = anyhow::Error::from(BrowserError::Script("boom".into()));
        assert!(!is_disconnect(&other));
    }

    #[test]
    fn unknown_story_id_falls_back_to_media_match() {
        use crate::resolver::normalize_item;
        use crate::testing::{image_item, media_url, story_context};

        let items: Vec<StoryItem> = normalize_item(&image_item("200", "1", "alice"), "alice", "1")
            .into_iter()
            .collect();
        let mut context = story_context("alice", "999");
        context.media_url = Some(media_url("200"));

        let matched = match_item(&items, &context).unwrap();
        assert_eq!(matched.story_id, "200");

        context.media_url = Some(media_url("300"));
        assert!(match_item(&items, &context).is_none());
    }
}
