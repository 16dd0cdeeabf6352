//! Engine behavior as seen by callers: validation, identity, embedding,
//! patches, deletes, reads.

mod common;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use common::{harness, harness_with, test_settings, FailingEmbedder};
use std::sync::Arc;
use whisper_sync::{
    Config, OpenStore, PrimaryStore, SqliteGraphStore, SqliteWhisperStore, SyncEngine, SyncError,
    ValidationError, WhisperDraft, WhisperFilter, WhisperId, WhisperPatch,
};

#[tokio::test]
async fn first_upsert_mints_id_second_keeps_it() {
    let h = harness().await;

    let first = h
        .engine
        .upsert(WhisperDraft::new("/a.md", "hello").with_tags(["B", "b", " A"]))
        .await
        .unwrap();
    assert_eq!(first.tag_list(), vec!["a", "b"]);
    assert!(WhisperId::parse(first.id.as_str()).is_ok());
    assert_eq!(first.revision, 1);

    let second = h
        .engine
        .upsert(WhisperDraft::new("/a.md", "hello again").with_tags(["b", "a"]))
        .await
        .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.created_at, first.created_at);
    assert_eq!(second.raw_text, "hello again");
    assert_eq!(second.revision, 2);
    assert!(second.updated_at >= first.updated_at);
}

#[tokio::test]
async fn supplied_created_at_only_applies_on_insert() {
    let h = harness().await;
    let jan = Utc.with_ymd_and_hms(2021, 1, 2, 3, 4, 5).unwrap();

    let w = h
        .engine
        .upsert(WhisperDraft::new("/old.md", "old note").with_created_at(jan))
        .await
        .unwrap();
    assert_eq!(w.created_at, jan);

    let again = h
        .engine
        .upsert(
            WhisperDraft::new("/old.md", "old note, edited")
                .with_created_at(jan + ChronoDuration::days(365)),
        )
        .await
        .unwrap();
    assert_eq!(again.created_at, jan);
}

#[tokio::test]
async fn supplied_embedding_skips_embedder() {
    let h = harness().await;
    let w = h
        .engine
        .upsert(WhisperDraft::new("/a.md", "hello").with_embedding(vec![9.0, 8.0]))
        .await
        .unwrap();
    assert_eq!(h.embedder.calls(), 0);
    assert_eq!(w.embedding, Some(vec![9.0, 8.0]));

    h.engine
        .upsert(WhisperDraft::new("/b.md", "world"))
        .await
        .unwrap();
    assert_eq!(h.embedder.calls(), 1);
}

#[tokio::test]
async fn embedder_input_is_truncated() {
    let mut settings = test_settings(3);
    settings.embedding.max_input_chars = 5;
    let h = harness_with(settings).await;

    let w = h
        .engine
        .upsert(WhisperDraft::new("/long.md", "ab€defghij"))
        .await
        .unwrap();
    assert_eq!(h.embedder.inputs(), vec!["ab€de".to_string()]);
    // The stored text is never truncated
    assert_eq!(w.raw_text, "ab€defghij");
}

#[tokio::test]
async fn embedding_failure_writes_nothing() {
    let primary = Arc::new(SqliteWhisperStore::open_in_memory().unwrap());
    primary.ensure_indexes().await.unwrap();
    let mirror = Arc::new(SqliteGraphStore::open_in_memory().unwrap());
    let engine = SyncEngine::new(
        primary.clone(),
        mirror,
        Arc::new(FailingEmbedder),
        test_settings(1),
    );

    let err = engine
        .upsert(WhisperDraft::new("/a.md", "hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Embedding(_)));
    assert!(primary.find_by_source_path("/a.md").await.unwrap().is_none());
    assert_eq!(engine.stats().submitted, 0);
}

#[tokio::test]
async fn invalid_drafts_are_rejected() {
    let h = harness().await;

    let err = h
        .engine
        .upsert(WhisperDraft::new("/a.md", " \n\t"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Validation(ValidationError::EmptyText)));

    let err = h
        .engine
        .upsert(WhisperDraft::new("", "text"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Validation(ValidationError::EmptySourcePath)));

    let err = h
        .engine
        .upsert(WhisperDraft::new("/a.md", "text").with_embedding(Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Validation(ValidationError::EmptyEmbedding)));

    assert_eq!(h.embedder.calls(), 0);
    assert_eq!(h.engine.stats().submitted, 0);
}

#[tokio::test]
async fn empty_patch_changes_nothing() {
    let h = harness().await;
    let w = h
        .engine
        .upsert(WhisperDraft::new("/a.md", "hello").with_tags(["x"]))
        .await
        .unwrap();
    h.engine.drain().await;
    let submitted = h.engine.stats().submitted;

    let same = h
        .engine
        .update(w.id.as_str(), WhisperPatch::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(same, w);
    assert_eq!(h.engine.stats().submitted, submitted);
}

#[tokio::test]
async fn tag_patch_clears_or_keeps() {
    let h = harness().await;
    let w = h
        .engine
        .upsert(WhisperDraft::new("/a.md", "hello").with_tags(["x", "y"]))
        .await
        .unwrap();

    let kept = h
        .engine
        .update(w.id.as_str(), WhisperPatch::new().with_tokens(42))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(kept.tag_list(), vec!["x", "y"]);
    assert_eq!(kept.tokens, Some(42));

    let cleared = h
        .engine
        .update(w.id.as_str(), WhisperPatch::clear_tags())
        .await
        .unwrap()
        .unwrap();
    assert!(cleared.tags.is_empty());
    assert_eq!(cleared.tokens, Some(42));

    let retagged = h
        .engine
        .update(w.id.as_str(), WhisperPatch::new().with_tags([" Z ", "z"]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(retagged.tag_list(), vec!["z"]);
}

#[tokio::test]
async fn patch_never_clears_embedding() {
    let h = harness().await;
    let w = h
        .engine
        .upsert(WhisperDraft::new("/a.md", "hello"))
        .await
        .unwrap();
    let before = w.embedding.clone();
    assert!(before.is_some());

    let patched = h
        .engine
        .update(w.id.as_str(), WhisperPatch::new().with_tags(["t"]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(patched.embedding, before);

    let err = h
        .engine
        .update(w.id.as_str(), WhisperPatch::new().with_embedding(Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Validation(ValidationError::EmptyEmbedding)));
}

#[tokio::test]
async fn update_unknown_id_is_none() {
    let h = harness().await;
    let result = h
        .engine
        .update(WhisperId::mint().as_str(), WhisperPatch::new().with_tags(["a"]))
        .await
        .unwrap();
    assert!(result.is_none());

    let err = h
        .engine
        .update("not-a-uuid", WhisperPatch::new().with_tags(["a"]))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Validation(ValidationError::MalformedId(_))));
}

#[tokio::test]
async fn delete_unknown_id_is_false_and_harmless() {
    let h = harness().await;
    let existed = h.engine.delete(WhisperId::mint().as_str()).await.unwrap();
    assert!(!existed);

    h.engine.drain().await;
    assert!(h.engine.abandoned().is_empty());
    assert_eq!(h.engine.stats().abandoned, 0);
}

#[tokio::test]
async fn delete_removes_primary_record() {
    let h = harness().await;
    let w = h
        .engine
        .upsert(WhisperDraft::new("/a.md", "hello"))
        .await
        .unwrap();

    assert!(h.engine.delete(w.id.as_str()).await.unwrap());
    assert!(h.engine.get(w.id.as_str()).await.unwrap().is_none());
    assert!(h.engine.get_by_source_path("/a.md").await.unwrap().is_none());
    assert!(!h.engine.delete(w.id.as_str()).await.unwrap());
}

#[tokio::test]
async fn reads_by_id_path_filter_and_text() {
    let h = harness().await;
    let jan = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let feb = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();

    let a = h
        .engine
        .upsert(
            WhisperDraft::new("/a.md", "rust ownership and borrowing")
                .with_tags(["rust"])
                .with_created_at(jan),
        )
        .await
        .unwrap();
    let b = h
        .engine
        .upsert(
            WhisperDraft::new("/b.md", "async rust with tokio")
                .with_tags(["Rust", "async"])
                .with_created_at(feb),
        )
        .await
        .unwrap();

    assert_eq!(h.engine.get(a.id.as_str()).await.unwrap(), Some(a.clone()));
    assert_eq!(
        h.engine.get_by_source_path("/b.md").await.unwrap().map(|w| w.id),
        Some(b.id.clone())
    );

    let rust = h
        .engine
        .find(&WhisperFilter::new().with_tag("rust"))
        .await
        .unwrap();
    let ids: Vec<_> = rust.iter().map(|w| w.id.clone()).collect();
    assert_eq!(ids, vec![b.id.clone(), a.id.clone()]);

    let january = h
        .engine
        .find(&WhisperFilter::new().created_before(feb))
        .await
        .unwrap();
    assert_eq!(january.len(), 1);
    assert_eq!(january[0].id, a.id);

    let hits = h.engine.search_text("tokio", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, b.id);
}

#[tokio::test]
async fn connect_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage.primary_db = Some(dir.path().join("data/primary.db"));
    config.storage.mirror_db = Some(dir.path().join("data/mirror.db"));
    config.storage.partition = "test".to_string();

    let embedder = Arc::new(whisper_sync::HashingEmbedder::new(32));
    let id = {
        let engine = SyncEngine::connect(&config, embedder.clone()).await.unwrap();
        let w = engine
            .upsert(WhisperDraft::new("/persist.md", "kept on disk").with_tags(["disk"]))
            .await
            .unwrap();
        engine.shutdown().await;
        w.id
    };

    let engine = SyncEngine::connect(&config, embedder).await.unwrap();
    let w = engine.get(id.as_str()).await.unwrap().unwrap();
    assert_eq!(w.source_path, "/persist.md");
    assert_eq!(w.embedding.as_ref().map(Vec::len), Some(32));

    let view = engine.mirror_view(id.as_str()).await.unwrap().unwrap();
    assert_eq!(view.tags, vec!["disk"]);
    assert_eq!(engine.search_text("disk", 5).await.unwrap().len(), 1);
}
