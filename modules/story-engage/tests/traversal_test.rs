//! End-to-end carousel runs against the mock probe, API, and generator,
//! backed by the in-memory store.

use std::sync::Arc;

use chrono::{Duration, Utc};
use engage_common::{
    EngageError, InteractionChannel, InteractionState, InteractionStatus, LedgerEntry, LedgerKind,
    ProfileRecord,
};
use serde_json::{json, Value};
use story_engage::probe::Probe;
use story_engage::store::{EngagementStore, MemoryStore};
use story_engage::testing::*;
use story_engage::{EngineDeps, ExitReason, StoryEngine, TraversalConfig};

fn alice_api(items: Vec<Value>) -> MockApi {
    MockApi::new()
        .on_profile(followed_profile("alice", "1"))
        .on_reel("1", reel_payload("1", "alice", items))
        .default_media(noise(60_000), "image/jpeg")
}

fn entries_of(store: &MemoryStore, kind: LedgerKind) -> Vec<LedgerEntry> {
    store
        .all_entries()
        .into_iter()
        .filter(|e| e.kind == kind)
        .collect()
}

fn skip_reasons(store: &MemoryStore) -> Vec<String> {
    entries_of(store, LedgerKind::StorySkipped)
        .into_iter()
        .filter_map(|e| e.metadata["reason"].as_str().map(String::from))
        .collect()
}

#[tokio::test]
async fn replies_to_story_through_api() {
    let probe = Arc::new(MockProbe::new(vec![Frame::story("alice", "100")]));
    let api = Arc::new(alice_api(vec![image_item("100", "1", "alice")]));
    let generator = Arc::new(MockGenerator::suggesting(&["Love this!"]));
    let store = Arc::new(MemoryStore::new());
    let (engine, sink) = test_engine(probe.clone(), api.clone(), generator.clone(), store.clone());

    let stats = engine.run(1, false).await.unwrap();

    assert_eq!(stats.exit_reason, Some(ExitReason::StoryLimitReached));
    assert_eq!(stats.visited, 1);
    assert_eq!(stats.commented, 1);
    assert_eq!(stats.downloaded, 1);
    assert_eq!(api.sent_replies(), vec![("100".to_string(), "Love this!".to_string())]);
    assert_eq!(api.threads_created(), 1);
    assert!(probe.submitted().is_empty(), "UI path should not run when the API posts");

    let stored = sink.stored();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].0, "alice");
    assert_eq!(stored[0].3, 60_000);

    let sent = entries_of(&store, LedgerKind::StoryReplySent);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].external_id, "story_reply_sent:100");
    assert_eq!(sent[0].metadata["method"], "api");
    assert_eq!(sent[0].metadata["comment_text"], "Love this!");
    assert_eq!(sent[0].metadata["media_key"], "/v/t51/100.jpg");

    let downloads = entries_of(&store, LedgerKind::StoryMediaDownloaded);
    assert_eq!(downloads[0].metadata["comment_text"], "Love this!");

    let state = store
        .interaction_state("alice", InteractionChannel::StoryReply)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, InteractionStatus::ReplyAvailable);
    assert_eq!(state.retry_after, None);

    let ended = entries_of(&store, LedgerKind::TraversalEnded);
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].subject, "me");
    assert_eq!(ended[0].metadata["exit_reason"], "story_limit_reached");
}

#[tokio::test]
async fn unreplyable_story_gets_reaction_instead() {
    let mut item = image_item("100", "1", "alice");
    item["can_reply"] = json!(false);
    let probe = Arc::new(MockProbe::new(vec![Frame::story("alice", "100")]));
    let api = Arc::new(alice_api(vec![item]));
    let generator = Arc::new(MockGenerator::suggesting(&["Love this!"]));
    let store = Arc::new(MemoryStore::new());
    let (engine, _sink) = test_engine(probe.clone(), api.clone(), generator.clone(), store.clone());

    let stats = engine.run(1, false).await.unwrap();

    assert_eq!(stats.reacted, 1);
    assert_eq!(stats.skipped("unreplyable"), 1);
    assert_eq!(stats.commented, 0);
    assert_eq!(probe.reactions(), 1);
    assert!(api.sent_replies().is_empty());
    assert!(probe.submitted().is_empty());
    assert_eq!(generator.calls(), 0);

    let reactions = entries_of(&store, LedgerKind::StoryReactionSent);
    assert_eq!(reactions.len(), 1);
    assert_eq!(reactions[0].metadata["reply_reason"], "api_can_reply_false");

    // Hard negative: backoff is set even though the reaction landed.
    let state = store
        .interaction_state("alice", InteractionChannel::StoryReply)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, InteractionStatus::Unavailable);
    assert_eq!(state.reaction_available, Some(true));
    assert!(state.retry_after.is_some_and(|at| at > Utc::now() + Duration::days(2)));
}

#[tokio::test]
async fn missing_reply_box_with_marker_reacts() {
    let frame = Frame::story("alice", "100").without_reply_box(Some("Replies turned off"));
    let probe = Arc::new(MockProbe::new(vec![frame]).reaction_ok(false));
    let api = Arc::new(alice_api(vec![image_item("100", "1", "alice")]));
    let generator = Arc::new(MockGenerator::suggesting(&["Love this!"]));
    let store = Arc::new(MemoryStore::new());
    let (engine, _sink) = test_engine(probe, api, generator, store.clone());

    let stats = engine.run(1, false).await.unwrap();

    assert_eq!(stats.reacted, 0);
    assert_eq!(stats.skipped("unreplyable"), 1);
    let failed = entries_of(&store, LedgerKind::StoryReactionFailed);
    assert_eq!(failed[0].metadata["reply_reason"], "replies_not_allowed");
}

#[tokio::test]
async fn same_story_key_without_progress_ends_run() {
    let probe = Arc::new(
        MockProbe::new(vec![Frame::story("alice", "100")])
            .advance_plan(vec![Advance::Stay, Advance::Fail]),
    );
    let api = Arc::new(alice_api(vec![image_item("100", "1", "alice")]));
    let generator = Arc::new(MockGenerator::suggesting(&["Love this!"]));
    let store = Arc::new(MemoryStore::new());
    let (engine, _sink) = test_engine(probe.clone(), api.clone(), generator.clone(), store);

    let stats = engine.run(5, false).await.unwrap();

    assert_eq!(stats.exit_reason, Some(ExitReason::DuplicateStoryKeyNoProgress));
    assert_eq!(stats.visited, 1);
    assert_eq!(api.sent_replies().len(), 1, "second tick must not re-process");
    assert_eq!(generator.calls(), 1);
    assert_eq!(probe.advances(), 2);
}

#[tokio::test]
async fn repeated_revisits_end_as_loop() {
    let probe = Arc::new(
        MockProbe::new(vec![Frame::story("alice", "100")]).advance_plan(vec![Advance::Stay; 4]),
    );
    let api = Arc::new(alice_api(vec![image_item("100", "1", "alice")]));
    let generator = Arc::new(MockGenerator::suggesting(&["Love this!"]));
    let (engine, _sink) = test_engine(probe.clone(), api, generator, Arc::new(MemoryStore::new()));

    let stats = engine.run(5, false).await.unwrap();

    assert_eq!(stats.exit_reason, Some(ExitReason::StoryLoopDetected));
    assert_eq!(stats.visited, 1);
    assert_eq!(probe.advances(), 4);
}

#[tokio::test]
async fn low_entropy_media_skipped_before_generation() {
    let flat: Vec<u8> = (0..38_000).map(|i| (i % 9) as u8).collect();
    let probe = Arc::new(MockProbe::new(vec![Frame::story("alice", "100")]));
    let api = Arc::new(
        MockApi::new()
            .on_profile(followed_profile("alice", "1"))
            .on_reel("1", reel_payload("1", "alice", vec![image_item("100", "1", "alice")]))
            .on_media(&media_url("100"), flat, "image/jpeg"),
    );
    let generator = Arc::new(MockGenerator::suggesting(&["Love this!"]));
    let store = Arc::new(MemoryStore::new());
    let (engine, _sink) = test_engine(probe, api.clone(), generator.clone(), store.clone());

    let stats = engine.run(1, false).await.unwrap();

    assert_eq!(stats.skipped("low_quality"), 1);
    assert_eq!(stats.downloaded, 1);
    assert_eq!(generator.calls(), 0);
    assert!(api.sent_replies().is_empty());

    let skips = entries_of(&store, LedgerKind::StorySkipped);
    assert_eq!(skips[0].metadata["quality_reason"], "low_entropy_small_image");
    assert_eq!(skips[0].metadata["bytes"], 38_000);
}

#[tokio::test]
async fn api_rejection_falls_back_to_ui_and_reports_ui_failure() {
    let probe = Arc::new(
        MockProbe::new(vec![Frame::story("alice", "100")]).ui_send(UiSendBehavior::ClearOnly),
    );
    let api = Arc::new(
        alice_api(vec![image_item("100", "1", "alice")])
            .send_behavior(ApiSendBehavior::HttpStatus(403)),
    );
    let generator = Arc::new(MockGenerator::suggesting(&["Love this!"]));
    let store = Arc::new(MemoryStore::new());
    let (engine, _sink) = test_engine(probe.clone(), api, generator, store.clone());

    let stats = engine.run(1, false).await.unwrap();

    assert_eq!(stats.commented, 0);
    assert_eq!(stats.reply_failed, 1);
    assert_eq!(probe.submitted(), vec!["Love this!".to_string()]);

    let failed = entries_of(&store, LedgerKind::StoryReplyFailed);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].metadata["method"], "ui");
    assert_eq!(failed[0].metadata["api_reason"], "api_http_403");
    assert_eq!(failed[0].metadata["reason"], "ui_unverified:no_rendered_item");
    assert!(entries_of(&store, LedgerKind::StoryReplySent).is_empty());
}

#[tokio::test]
async fn api_rejection_with_verified_ui_send_counts_as_reply() {
    let probe = Arc::new(MockProbe::new(vec![Frame::story("alice", "100")]));
    let api = Arc::new(
        alice_api(vec![image_item("100", "1", "alice")])
            .send_behavior(ApiSendBehavior::NotOk("fail".into())),
    );
    let generator = Arc::new(MockGenerator::suggesting(&["Love this!"]));
    let store = Arc::new(MemoryStore::new());
    let (engine, _sink) = test_engine(probe.clone(), api, generator, store.clone());

    let stats = engine.run(1, false).await.unwrap();

    assert_eq!(stats.commented, 1);
    let sent = entries_of(&store, LedgerKind::StoryReplySent);
    assert_eq!(sent[0].metadata["method"], "ui");
}

#[tokio::test]
async fn second_run_does_not_reply_again() {
    let api = Arc::new(alice_api(vec![image_item("100", "1", "alice")]));
    let generator = Arc::new(MockGenerator::suggesting(&["Love this!"]));
    let store = Arc::new(MemoryStore::new());

    let first = Arc::new(MockProbe::new(vec![Frame::story("alice", "100")]));
    let (engine, _sink) = test_engine(first, api.clone(), generator.clone(), store.clone());
    assert_eq!(engine.run(1, false).await.unwrap().commented, 1);

    let second = Arc::new(MockProbe::new(vec![Frame::story("alice", "100")]));
    let (engine, _sink) = test_engine(second, api.clone(), generator.clone(), store.clone());
    let stats = engine.run(1, false).await.unwrap();

    assert_eq!(stats.commented, 0);
    assert_eq!(stats.skipped("already_replied"), 1);
    assert_eq!(api.sent_replies().len(), 1);
    assert_eq!(generator.calls(), 1);
    let skips = entries_of(&store, LedgerKind::StorySkipped);
    assert_eq!(skips[0].metadata["matched_key"], "story_id");
}

#[tokio::test]
async fn same_media_under_new_story_id_is_a_duplicate() {
    let mut reposted = image_item("200", "1", "alice");
    reposted["image_versions2"] = json!({"candidates": [{"url": media_url("100")}]});
    let api = Arc::new(alice_api(vec![image_item("100", "1", "alice"), reposted]));
    let generator = Arc::new(MockGenerator::suggesting(&["Love this!"]));
    let store = Arc::new(MemoryStore::new());

    let first = Arc::new(MockProbe::new(vec![Frame::story("alice", "100")]));
    let (engine, _sink) = test_engine(first, api.clone(), generator.clone(), store.clone());
    engine.run(1, false).await.unwrap();

    let second = Arc::new(MockProbe::new(vec![Frame::story("alice", "200")]));
    let (engine, _sink) = test_engine(second, api.clone(), generator, store.clone());
    let stats = engine.run(1, false).await.unwrap();

    assert_eq!(stats.skipped("already_replied"), 1);
    let skips = entries_of(&store, LedgerKind::StorySkipped);
    assert_eq!(skips[0].metadata["matched_key"], "media_url");
    assert_eq!(api.sent_replies().len(), 1);
}

#[tokio::test]
async fn active_backoff_blocks_every_engagement() {
    let store = Arc::new(MemoryStore::new());
    store
        .save_interaction_state(
            "alice",
            InteractionChannel::StoryReply,
            &InteractionState {
                status: InteractionStatus::Unavailable,
                reason: Some("api_can_reply_false".into()),
                checked_at: Some(Utc::now()),
                retry_after: Some(Utc::now() + Duration::days(1)),
                reaction_available: Some(true),
            },
        )
        .await
        .unwrap();
    let probe = Arc::new(MockProbe::new(vec![Frame::story("alice", "100")]));
    let api = Arc::new(alice_api(vec![image_item("100", "1", "alice")]));
    let generator = Arc::new(MockGenerator::suggesting(&["Love this!"]));
    let (engine, sink) = test_engine(probe.clone(), api.clone(), generator.clone(), store.clone());

    let stats = engine.run(1, false).await.unwrap();

    assert_eq!(stats.skipped("backoff"), 1);
    assert_eq!(probe.reactions(), 0);
    assert!(probe.submitted().is_empty());
    assert!(api.sent_replies().is_empty());
    assert!(sink.stored().is_empty());
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn expired_backoff_allows_reply() {
    let store = Arc::new(MemoryStore::new());
    store
        .save_interaction_state(
            "alice",
            InteractionChannel::StoryReply,
            &InteractionState {
                status: InteractionStatus::Unavailable,
                reason: Some("api_can_reply_false".into()),
                checked_at: Some(Utc::now() - Duration::days(4)),
                retry_after: Some(Utc::now() - Duration::seconds(1)),
                reaction_available: None,
            },
        )
        .await
        .unwrap();
    let probe = Arc::new(MockProbe::new(vec![Frame::story("alice", "100")]));
    let api = Arc::new(alice_api(vec![image_item("100", "1", "alice")]));
    let generator = Arc::new(MockGenerator::suggesting(&["Love this!"]));
    let (engine, _sink) = test_engine(probe, api, generator, store.clone());

    let stats = engine.run(1, false).await.unwrap();

    assert_eq!(stats.commented, 1);
    let state = store
        .interaction_state("alice", InteractionChannel::StoryReply)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, InteractionStatus::ReplyAvailable);
    assert_eq!(state.retry_after, None);
}

#[tokio::test]
async fn sponsored_header_is_never_engaged() {
    let frame = Frame::story("alice", "100").with_header("Sponsored");
    let probe = Arc::new(MockProbe::new(vec![frame]));
    let api = Arc::new(alice_api(vec![image_item("100", "1", "alice")]));
    let generator = Arc::new(MockGenerator::suggesting(&["Love this!"]));
    let store = Arc::new(MemoryStore::new());
    let (engine, sink) = test_engine(probe.clone(), api.clone(), generator.clone(), store.clone());

    let stats = engine.run(1, false).await.unwrap();

    assert_eq!(stats.skipped("ad"), 1);
    assert_eq!(generator.calls(), 0);
    assert_eq!(probe.reactions(), 0);
    assert!(probe.submitted().is_empty());
    assert!(api.sent_replies().is_empty());
    assert!(sink.stored().is_empty());
    let skips = entries_of(&store, LedgerKind::StorySkipped);
    assert_eq!(skips[0].metadata["ad"]["source"], "dom_header");
}

#[tokio::test]
async fn paid_partnership_flag_is_an_ad() {
    let mut item = image_item("100", "1", "alice");
    item["is_paid_partnership"] = json!(true);
    let probe = Arc::new(MockProbe::new(vec![Frame::story("alice", "100")]));
    let api = Arc::new(alice_api(vec![item]));
    let generator = Arc::new(MockGenerator::suggesting(&["Love this!"]));
    let (engine, _sink) = test_engine(probe, api, generator.clone(), Arc::new(MemoryStore::new()));

    let stats = engine.run(1, false).await.unwrap();

    assert_eq!(stats.skipped("ad"), 1);
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn mentioned_account_story_is_skipped() {
    let mut item = image_item("100", "1", "alice");
    item["reel_mentions"] = json!([{"user": {"pk": "9", "username": "brand"}}]);
    let probe = Arc::new(MockProbe::new(vec![Frame::story("alice", "100")]));
    let api = Arc::new(alice_api(vec![item]));
    let generator = Arc::new(MockGenerator::suggesting(&["Love this!"]));
    let store = Arc::new(MemoryStore::new());
    let (engine, _sink) = test_engine(probe.clone(), api.clone(), generator.clone(), store.clone());

    let stats = engine.run(1, false).await.unwrap();

    assert_eq!(stats.skipped("external_attribution"), 1);
    assert_eq!(generator.calls(), 0);
    assert_eq!(probe.reactions(), 0);
    let skips = entries_of(&store, LedgerKind::StorySkipped);
    assert_eq!(skips[0].metadata["attribution"]["reason"], "reel_mention");
    let targets = skips[0].metadata["attribution"]["targets"].as_array().unwrap();
    assert!(targets.contains(&json!("brand")));
    assert!(!targets.contains(&json!("alice")));
}

#[tokio::test]
async fn live_view_stands_in_when_reel_lookup_fails() {
    // Profile resolves, reel lookup does not.
    let probe = Arc::new(MockProbe::new(vec![Frame::story("alice", "100")]));
    let api = Arc::new(
        MockApi::new()
            .on_profile(followed_profile("alice", "1"))
            .default_media(noise(60_000), "image/jpeg"),
    );
    let generator = Arc::new(MockGenerator::suggesting(&["Love this!"]));
    let store = Arc::new(MemoryStore::new());
    let (engine, _sink) = test_engine(probe, api.clone(), generator, store.clone());

    let stats = engine.run(1, false).await.unwrap();

    assert_eq!(stats.commented, 1);
    assert_eq!(api.sent_replies(), vec![("100".to_string(), "Love this!".to_string())]);
    let sent = entries_of(&store, LedgerKind::StoryReplySent);
    assert_eq!(sent[0].metadata["story_ref"], "100");
}

#[tokio::test]
async fn live_view_linked_account_is_external() {
    let mut frame = Frame::story("alice", "100");
    frame.linked = vec!["alice".into(), "brand".into()];
    let probe = Arc::new(MockProbe::new(vec![frame]));
    let api = Arc::new(MockApi::new().on_profile(followed_profile("alice", "1")));
    let generator = Arc::new(MockGenerator::suggesting(&["Love this!"]));
    let store = Arc::new(MemoryStore::new());
    let (engine, _sink) = test_engine(probe, api, generator.clone(), store.clone());

    let stats = engine.run(1, false).await.unwrap();

    assert_eq!(stats.skipped("external_attribution"), 1);
    let skips = entries_of(&store, LedgerKind::StorySkipped);
    assert_eq!(skips[0].metadata["attribution"]["reason"], "dom_linked_account");
    assert_eq!(skips[0].metadata["source"], "dom");
}

#[tokio::test]
async fn video_is_archived_not_replied() {
    let probe = Arc::new(MockProbe::new(vec![Frame::story("alice", "100")]));
    let api = Arc::new(alice_api(vec![video_item("100", "1", "alice")]));
    let generator = Arc::new(MockGenerator::suggesting(&["Love this!"]));
    let store = Arc::new(MemoryStore::new());
    let (engine, sink) = test_engine(probe, api.clone(), generator.clone(), store.clone());

    let stats = engine.run(1, false).await.unwrap();

    assert_eq!(stats.skipped("video"), 1);
    assert_eq!(stats.downloaded, 1);
    assert_eq!(sink.stored().len(), 1);
    assert_eq!(generator.calls(), 0);
    assert!(api.sent_replies().is_empty());
    let downloads = entries_of(&store, LedgerKind::StoryMediaDownloaded);
    assert_eq!(downloads[0].metadata["final_url"], "https://cdn.example.com/v/t50/100.mp4");
}

#[tokio::test]
async fn stranger_story_is_skipped() {
    let mut profile = followed_profile("alice", "1");
    profile.followed_by_viewer = false;
    let probe = Arc::new(MockProbe::new(vec![Frame::story("alice", "100")]));
    let api = Arc::new(
        MockApi::new()
            .on_profile(profile)
            .on_reel("1", reel_payload("1", "alice", vec![image_item("100", "1", "alice")])),
    );
    let generator = Arc::new(MockGenerator::suggesting(&["Love this!"]));
    let (engine, _sink) = test_engine(probe, api, generator.clone(), Arc::new(MemoryStore::new()));

    let stats = engine.run(1, false).await.unwrap();

    assert_eq!(stats.skipped("not_in_network"), 1);
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn auto_reply_only_respects_stored_profile() {
    let store = Arc::new(MemoryStore::with_profiles([ProfileRecord {
        username: "alice".into(),
        user_id: Some("1".into()),
        following: true,
        follows_you: false,
        auto_reply: false,
    }]));
    let probe = Arc::new(MockProbe::new(vec![Frame::story("alice", "100")]));
    let api = Arc::new(alice_api(vec![image_item("100", "1", "alice")]));
    let generator = Arc::new(MockGenerator::suggesting(&["Love this!"]));
    let (engine, sink) = test_engine(probe, api.clone(), generator.clone(), store.clone());

    let stats = engine.run(1, true).await.unwrap();

    assert_eq!(stats.skipped("auto_reply_disabled"), 1);
    assert_eq!(sink.stored().len(), 1, "media is archived before the auto-reply check");
    assert_eq!(generator.calls(), 0);
    assert!(api.sent_replies().is_empty());
}

#[tokio::test]
async fn unready_analysis_skips_story() {
    let probe = Arc::new(MockProbe::new(vec![Frame::story("alice", "100")]));
    let api = Arc::new(alice_api(vec![image_item("100", "1", "alice")]));
    let generator = Arc::new(MockGenerator::not_ready());
    let store = Arc::new(MemoryStore::new());
    let (engine, _sink) = test_engine(probe, api.clone(), generator.clone(), store.clone());

    let stats = engine.run(1, false).await.unwrap();

    assert_eq!(stats.skipped("analysis_not_ready"), 1);
    assert_eq!(generator.calls(), 1);
    assert!(api.sent_replies().is_empty());
}

#[tokio::test]
async fn repeated_comment_to_same_target_is_avoided() {
    let probe = Arc::new(MockProbe::new(vec![
        Frame::story("alice", "100"),
        Frame::story("alice", "101"),
    ]));
    let api = Arc::new(alice_api(vec![
        image_item("100", "1", "alice"),
        image_item("101", "1", "alice"),
    ]));
    let generator = Arc::new(MockGenerator::suggesting(&["Love this!", "What a view"]));
    let store = Arc::new(MemoryStore::new());
    let (engine, _sink) = test_engine(probe, api.clone(), generator, store);

    let stats = engine.run(5, false).await.unwrap();

    assert_eq!(stats.commented, 2);
    assert_eq!(stats.exit_reason, Some(ExitReason::AdvanceFailed));
    // Only one reel lookup for both stories.
    assert_eq!(api.reel_calls(), 1);
    // One thread per target per run.
    assert_eq!(api.threads_created(), 1);
    assert_eq!(
        api.sent_replies(),
        vec![
            ("100".to_string(), "Love this!".to_string()),
            ("101".to_string(), "What a view".to_string()),
        ]
    );
}

#[tokio::test]
async fn unresolved_twice_ends_run() {
    let probe = Arc::new(MockProbe::new(vec![Frame::unresolved()]));
    let store = Arc::new(MemoryStore::new());
    let (engine, _sink) = test_engine(
        probe.clone(),
        Arc::new(MockApi::new()),
        Arc::new(MockGenerator::suggesting(&[])),
        store.clone(),
    );

    let stats = engine.run(3, false).await.unwrap();

    assert_eq!(stats.exit_reason, Some(ExitReason::StoryContextUnresolved));
    assert_eq!(stats.visited, 0);
    assert_eq!(probe.advances(), 0);
    let ended = entries_of(&store, LedgerKind::TraversalEnded);
    assert_eq!(ended[0].metadata["exit_reason"], "story_context_unresolved");
}

#[tokio::test]
async fn closed_tray_ends_run_immediately() {
    let probe = Arc::new(MockProbe::new(vec![Frame::story("alice", "100")]).carousel_opens(false));
    let store = Arc::new(MemoryStore::new());
    let (engine, _sink) = test_engine(
        probe,
        Arc::new(MockApi::new()),
        Arc::new(MockGenerator::suggesting(&[])),
        store.clone(),
    );

    let stats = engine.run(3, false).await.unwrap();

    assert_eq!(stats.exit_reason, Some(ExitReason::CarouselNotOpened));
    assert_eq!(entries_of(&store, LedgerKind::TraversalEnded).len(), 1);
}

#[tokio::test]
async fn ambiguous_owner_recovered_through_story_root() {
    let frame = Frame {
        context: Probe::Ambiguous("alice, bob".into()),
        after_root: Some(story_context("alice", "100")),
        ..Frame::story("alice", "100")
    };
    let probe = Arc::new(MockProbe::new(vec![frame]));
    let api = Arc::new(alice_api(vec![image_item("100", "1", "alice")]));
    let generator = Arc::new(MockGenerator::suggesting(&["Love this!"]));
    let (engine, _sink) = test_engine(probe.clone(), api, generator, Arc::new(MemoryStore::new()));

    let stats = engine.run(1, false).await.unwrap();

    assert_eq!(probe.roots_opened(), vec!["alice".to_string()]);
    assert_eq!(stats.commented, 1);
}

#[tokio::test]
async fn transient_disconnect_is_recovered() {
    let probe = Arc::new(MockProbe::new(vec![Frame::story("alice", "100")]).disconnect_times(1));
    let api = Arc::new(alice_api(vec![image_item("100", "1", "alice")]));
    let generator = Arc::new(MockGenerator::suggesting(&["Love this!"]));
    let (engine, _sink) = test_engine(probe.clone(), api, generator, Arc::new(MemoryStore::new()));

    let stats = engine.run(1, false).await.unwrap();

    assert_eq!(probe.reconnects(), 1);
    assert_eq!(stats.commented, 1);
    assert_eq!(stats.exit_reason, Some(ExitReason::StoryLimitReached));
}

#[tokio::test]
async fn persistent_disconnect_ends_run_as_session_lost() {
    let probe = Arc::new(MockProbe::new(vec![Frame::story("alice", "100")]).disconnect_times(10));
    let store = Arc::new(MemoryStore::new());
    let (engine, _sink) = test_engine(
        probe.clone(),
        Arc::new(MockApi::new()),
        Arc::new(MockGenerator::suggesting(&[])),
        store.clone(),
    );

    let stats = engine.run(1, false).await.unwrap();

    assert_eq!(stats.exit_reason, Some(ExitReason::SessionLost));
    assert_eq!(probe.reconnects(), 1);
    let ended = entries_of(&store, LedgerKind::TraversalEnded);
    assert_eq!(ended[0].metadata["exit_reason"], "session_lost");
}

#[tokio::test]
async fn concurrent_run_is_refused() {
    let store = Arc::new(MemoryStore::new());
    assert!(store.acquire_run_lock("me").await.unwrap());
    let (engine, _sink) = test_engine(
        Arc::new(MockProbe::new(vec![Frame::story("alice", "100")])),
        Arc::new(MockApi::new()),
        Arc::new(MockGenerator::suggesting(&[])),
        store.clone(),
    );

    let err = engine.run(1, false).await.unwrap_err();
    assert!(matches!(err, EngageError::RunLockConflict(ref account) if account == "me"));

    store.release_run_lock("me").await.unwrap();
    assert!(engine.run(1, false).await.is_ok());
    assert!(store.acquire_run_lock("me").await.unwrap(), "run releases its lock");
}

#[tokio::test]
async fn zero_limit_does_nothing() {
    let probe = Arc::new(MockProbe::new(vec![Frame::story("alice", "100")]));
    let (engine, _sink) = test_engine(
        probe.clone(),
        Arc::new(MockApi::new()),
        Arc::new(MockGenerator::suggesting(&[])),
        Arc::new(MemoryStore::new()),
    );

    let stats = engine.run(0, false).await.unwrap();

    assert_eq!(stats.exit_reason, Some(ExitReason::StoryLimitReached));
    assert_eq!(stats.visited, 0);
    assert_eq!(probe.advances(), 0);
}

#[tokio::test]
async fn disconnect_while_reading_story_is_recovered() {
    let probe = Arc::new(
        MockProbe::new(vec![Frame::story("alice", "100"), Frame::story("alice", "101")])
            .header_disconnects(1),
    );
    let api = Arc::new(alice_api(vec![
        image_item("100", "1", "alice"),
        image_item("101", "1", "alice"),
    ]));
    let generator = Arc::new(MockGenerator::suggesting(&["Love this!", "What a view"]));
    let store = Arc::new(MemoryStore::new());
    let (engine, _sink) = test_engine(probe.clone(), api.clone(), generator, store);

    let stats = engine.run(2, false).await.unwrap();

    assert_eq!(stats.exit_reason, Some(ExitReason::StoryLimitReached));
    assert_eq!(probe.reconnects(), 1);
    assert_eq!(stats.visited, 2);
    assert_eq!(stats.commented, 2);
    assert_eq!(stats.failed, 0);
    assert_eq!(api.sent_replies().len(), 2);
}

#[tokio::test]
async fn context_script_error_is_treated_as_unresolved() {
    let probe = Arc::new(
        MockProbe::new(vec![Frame::story("alice", "100")]).context_script_errors(1),
    );
    let api = Arc::new(alice_api(vec![image_item("100", "1", "alice")]));
    let generator = Arc::new(MockGenerator::suggesting(&["Love this!"]));
    let (engine, _sink) = test_engine(probe.clone(), api, generator, Arc::new(MemoryStore::new()));

    let stats = engine.run(1, false).await.unwrap();

    assert_eq!(stats.exit_reason, Some(ExitReason::StoryLimitReached));
    assert_eq!(stats.visited, 1);
    assert_eq!(stats.commented, 1);
    assert_eq!(probe.reconnects(), 0, "script errors are not disconnects");
}

#[tokio::test]
async fn failed_story_is_recorded_and_run_continues() {
    let probe = Arc::new(MockProbe::new(vec![
        Frame::story("alice", "100"),
        Frame::story("alice", "101"),
    ]));
    let api = Arc::new(alice_api(vec![
        image_item("100", "1", "alice"),
        image_item("101", "1", "alice"),
    ]));
    let generator = Arc::new(MockGenerator::suggesting(&["Love this!"]).failing_first(1));
    let store = Arc::new(MemoryStore::new());
    let (engine, _sink) = test_engine(probe.clone(), api.clone(), generator.clone(), store.clone());

    let stats = engine.run(2, false).await.unwrap();

    assert_eq!(stats.exit_reason, Some(ExitReason::StoryLimitReached));
    assert_eq!(stats.visited, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.commented, 1);
    assert_eq!(generator.calls(), 2);
    assert_eq!(api.sent_replies(), vec![("101".to_string(), "Love this!".to_string())]);

    let failed = entries_of(&store, LedgerKind::StoryProcessingFailed);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].subject, "alice");
    assert!(failed[0].metadata["error"]
        .as_str()
        .unwrap()
        .contains("analysis service unavailable"));
    assert_eq!(failed[0].metadata["story_ref"], "100");
}

#[tokio::test]
async fn stalled_carousel_stops_at_safety_limit() {
    let probe = Arc::new(
        MockProbe::new(vec![Frame::story("alice", "100")]).advance_plan(vec![Advance::Stay; 3]),
    );
    let api = Arc::new(alice_api(vec![image_item("100", "1", "alice")]));
    let engine = StoryEngine::new(
        "me",
        EngineDeps {
            probe: probe.clone(),
            api,
            generator: Arc::new(MockGenerator::suggesting(&["Love this!"])),
            sink: Arc::new(RecordingSink::default()),
            store: Arc::new(MemoryStore::new()),
        },
        TraversalConfig {
            safety_factor: 1,
            ..fast_config()
        },
    );

    let stats = engine.run(3, false).await.unwrap();

    assert_eq!(stats.exit_reason, Some(ExitReason::SafetyLimitReached));
    assert_eq!(stats.visited, 1);
    assert_eq!(probe.advances(), 3);
}
