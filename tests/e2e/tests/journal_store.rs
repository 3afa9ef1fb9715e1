//! Journal durability tests
//!
//! Round-trips across close/reopen, crash-truncated tails, fold
//! equivalence at every journal prefix, and the prebuild marker state
//! machine.

use std::collections::HashMap;
use std::sync::Arc;

use reverie_core::memory::Document;
use reverie_core::store::{JournalRecord, StoreError};
use reverie_e2e_tests::harness::StoreHarness;
use reverie_e2e_tests::mocks::{MockEmbedder, ShortBatchEmbedder, ZeroEmbedder};

const DIM: usize = 64;

fn harness() -> StoreHarness {
    StoreHarness::new(Arc::new(MockEmbedder::new(DIM)))
}

#[tokio::test]
async fn empty_journal_roundtrip() {
    let harness = harness();

    let store = harness.open().await;
    store
        .add(vec![
            Document::new("User likes hiking").with_id("m1"),
            Document::new("User cooked pasta").with_id("m2"),
        ])
        .await
        .unwrap();
    store.close().await.unwrap();

    let store = harness.open().await;
    let hits = store.similarity_search("hiking", 1).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].entry.id, "m1");
    assert!(hits[0].metadata.get("score").is_some());

    store.delete(&["m1".to_string()]).await.unwrap();
    store.close().await.unwrap();

    let store = harness.open().await;
    let hits = store.similarity_search("hiking", 2).await.unwrap();
    assert!(hits.iter().all(|h| h.entry.id != "m1"));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn crash_truncated_tail_is_skipped() {
    let harness = harness();

    let store = harness.open().await;
    store
        .add(vec![
            Document::new("alpha memory").with_id("a"),
            Document::new("beta memory").with_id("b"),
            Document::new("gamma memory").with_id("c"),
        ])
        .await
        .unwrap();
    store.close().await.unwrap();

    // A crash mid-append leaves an unterminated, unparseable tail
    harness.append_raw(b"{\"op\":\"upsert\",\"id\":\"d\",\"pageCon");

    let store = harness.open().await;
    assert_eq!(store.len(), 3);

    // The store keeps working and the journal extends past the junk
    store
        .add(vec![Document::new("delta memory").with_id("d")])
        .await
        .unwrap();
    store.close().await.unwrap();

    let store = harness.open().await;
    assert_eq!(store.len(), 4);
    let hits = store.similarity_search("delta memory", 1).await.unwrap();
    assert_eq!(hits[0].entry.id, "d");
}

#[tokio::test]
async fn every_journal_prefix_reproduces_its_fold() {
    let harness = harness();

    let store = harness.open().await;
    store
        .add(vec![
            Document::new("first entry").with_id("x"),
            Document::new("second entry").with_id("y"),
        ])
        .await
        .unwrap();
    store.delete(&["x".to_string()]).await.unwrap();
    store
        .add(vec![Document::new("first entry rewritten").with_id("x")])
        .await
        .unwrap();
    store.close().await.unwrap();

    let journal = harness.read_journal();
    let lines: Vec<&str> = journal.lines().collect();
    assert_eq!(lines.len(), 4);

    for prefix_len in 0..=lines.len() {
        let prefix_harness = StoreHarness::new(Arc::new(MockEmbedder::new(DIM)));
        let mut contents = lines[..prefix_len].join("\n");
        if !contents.is_empty() {
            contents.push('\n');
        }
        prefix_harness.write_journal(&contents);

        // Reference fold over the same prefix
        let mut expected: HashMap<String, String> = HashMap::new();
        for line in &lines[..prefix_len] {
            match serde_json::from_str::<JournalRecord>(line).unwrap() {
                JournalRecord::Upsert { id, page_content, .. } => {
                    expected.insert(id, page_content);
                }
                JournalRecord::Delete { id } => {
                    expected.remove(&id);
                }
            }
        }

        let store = prefix_harness.open().await;
        assert_eq!(store.len(), expected.len(), "prefix {prefix_len}");
        for (id, content) in &expected {
            let hits = store.similarity_search(content, 10).await.unwrap();
            assert!(
                hits.iter().any(|h| &h.entry.id == id),
                "prefix {prefix_len}: {id} missing from fold"
            );
        }
    }
}

#[tokio::test]
async fn delete_unknown_id_is_noop() {
    let harness = harness();
    let store = harness.open().await;
    store
        .add(vec![Document::new("only entry").with_id("m1")])
        .await
        .unwrap();

    store.delete(&["ghost".to_string()]).await.unwrap();
    store.close().await.unwrap();

    // No delete record was journaled for the unknown id
    let journal = harness.read_journal();
    assert!(!journal.contains("ghost"));
    assert_eq!(journal.lines().count(), 1);
}

#[tokio::test]
async fn derived_ids_are_stable_and_echoed() {
    let harness = harness();
    let store = harness.open().await;

    let ids = store
        .add(vec![Document::new("no explicit id here")])
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);
    assert!(ids[0].starts_with("doc-"));
    assert_eq!(ids[0].len(), 28);

    let hits = store.similarity_search("no explicit id here", 1).await.unwrap();
    assert_eq!(
        hits[0].metadata.get("id").and_then(|v| v.as_str()),
        Some(ids[0].as_str())
    );
}

#[tokio::test]
async fn ties_break_by_insertion_order() {
    let harness = StoreHarness::new(Arc::new(ZeroEmbedder::new(DIM)));
    let store = harness.open().await;

    // Every vector is zero, so every score is 0.0 and order must be
    // insertion order.
    store
        .add(vec![
            Document::new("first").with_id("m1"),
            Document::new("second").with_id("m2"),
            Document::new("third").with_id("m3"),
        ])
        .await
        .unwrap();

    let hits = store.similarity_search("anything", 3).await.unwrap();
    let ids: Vec<&str> = hits.iter().map(|h| h.entry.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2", "m3"]);
    assert!(hits.iter().all(|h| h.relevance_score == 0.0));
}

#[tokio::test]
async fn embedding_count_mismatch_fails_add() {
    let harness = StoreHarness::new(Arc::new(ShortBatchEmbedder::new(DIM)));
    let store = harness.open().await;

    let err = store
        .add(vec![
            Document::new("one").with_id("m1"),
            Document::new("two").with_id("m2"),
        ])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::EmbeddingCountMismatch { expected: 2, got: 1 }
    ));

    // Nothing was journaled
    assert_eq!(store.len(), 0);
    assert!(harness.read_journal().is_empty());
}

#[tokio::test]
async fn upsert_overwrites_by_id() {
    let harness = harness();
    let store = harness.open().await;

    store
        .add(vec![Document::new("original content").with_id("m1")])
        .await
        .unwrap();
    store
        .add(vec![Document::new("replacement content").with_id("m1")])
        .await
        .unwrap();

    assert_eq!(store.len(), 1);
    let hits = store.similarity_search("replacement content", 1).await.unwrap();
    assert_eq!(hits[0].entry.topic_summary, "replacement content");
}

#[tokio::test]
async fn prebuild_marker_state_machine() {
    use reverie_core::store::PrebuildMarker;

    let harness = harness();
    let store = harness.open().await;

    // empty -> in-progress
    assert!(store.prebuild_progress().await.is_none());
    assert!(store.prebuild_complete().await.is_none());

    let mut marker = PrebuildMarker::new("reflective", "q-1", "single-hop", 4);
    marker.sessions_processed = 2;
    marker.updated_at = Some(chrono::Utc::now());
    store.mark_prebuild_progress(&marker).await.unwrap();
    assert_eq!(
        store.prebuild_progress().await.unwrap().sessions_processed,
        2
    );

    // in-progress -> complete; progress marker disappears
    marker.sessions_processed = 4;
    marker.updated_at = None;
    marker.completed_at = Some(chrono::Utc::now());
    store.mark_prebuild_complete(&marker).await.unwrap();
    assert!(store.prebuild_progress().await.is_none());
    let complete = store.prebuild_complete().await.unwrap();
    assert_eq!(complete.sessions_processed, 4);
    assert!(complete.completed_at.is_some());

    // clearing progress when absent stays fine
    store.clear_prebuild_progress().await.unwrap();
}

#[tokio::test]
async fn reopen_is_idempotent_across_states() {
    let harness = harness();

    // Open/close with no writes at all
    let store = harness.open().await;
    store.close().await.unwrap();

    let store = harness.open().await;
    assert!(store.is_empty());
    store
        .add(vec![Document::new("sole entry").with_id("m1")])
        .await
        .unwrap();
    store.close().await.unwrap();

    // Two reopen cycles see identical state
    for _ in 0..2 {
        let store = harness.open().await;
        assert_eq!(store.len(), 1);
        store.close().await.unwrap();
    }
}

#[tokio::test]
async fn stats_reflect_index_and_appends() {
    let harness = harness();
    let store = harness.open().await;
    store
        .add(vec![
            Document::new("stat one").with_id("m1"),
            Document::new("stat two").with_id("m2"),
        ])
        .await
        .unwrap();
    store.delete(&["m1".to_string()]).await.unwrap();

    let stats = store.stats();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.records_appended, 3);
    assert_eq!(stats.dimension, Some(DIM));
}

#[tokio::test]
async fn concurrent_adds_keep_journal_order_consistent() {
    let harness = harness();
    let store = Arc::new(harness.open().await);

    let mut handles = Vec::new();
    for batch in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .add(vec![
                    Document::new(format!("batch {batch} entry")).with_id(format!("b{batch}")),
                ])
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // All eight writes landed and the journal replays to the same index
    assert_eq!(store.len(), 8);
    drop(store);
    let store = harness.open().await;
    assert_eq!(store.len(), 8);
}
