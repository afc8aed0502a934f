mod common;

use std::sync::Arc;

use common::{flat, fund, harness, nested, step, RecordingDispatcher, StaleReads};
use kbadmin::{
    Coordinator, EmbeddingIndex, KbError, MemoryStore, RecordStore, SourceKind, SourceRef,
};
use pretty_assertions::assert_eq;
use serde_json::json;

fn manual(chunk_id: i32) -> SourceRef {
    SourceRef::new(SourceKind::Manual, chunk_id)
}

#[tokio::test]
async fn force_delete_strips_token_and_regenerates_multi_reference_step() {
    let h = harness();
    h.store.seed_fund(fund("F-007", "ABC")).await;
    h.store.seed_step(step(42, Some("ABC XYZ"))).await;
    h.store.seed_embedding(flat("manual", "42")).await;
    h.store.seed_embedding(nested("chunk_id", json!(42))).await;
    h.store.seed_embedding(flat("funds", "F-007")).await;

    let outcome = h.coordinator.delete_fund("F-007", true).await.expect("delete");
    assert_eq!(outcome.fund_id, "F-007");
    assert_eq!(outcome.updated_steps, vec![42]);
    assert!(outcome.deleted_steps.is_empty());

    let remaining = h.store.step(42).await.expect("read").expect("step kept");
    assert_eq!(remaining.fund_abbr.as_deref(), Some("XYZ"));
    assert!(h.store.fund("F-007").await.expect("read").is_none());

    let index = EmbeddingIndex::default();
    assert!(h.store.embeddings_at(&index.address(&manual(42))).await.is_empty());
    let fund_source = SourceRef::new(SourceKind::Fund, "F-007");
    assert!(h.store.embeddings_at(&index.address(&fund_source)).await.is_empty());
    assert_eq!(h.store.embedding_count().await, 0);

    let requests = h.dispatcher.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].source(), &manual(42));
    assert!(requests[0].text.contains("Fund: XYZ"));
    assert!(!requests[0].text.contains("ABC"));
}

#[tokio::test]
async fn preview_reports_dependents_without_writing() {
    let h = harness();
    h.store.seed_fund(fund("F-001", "ABC")).await;
    h.store.seed_step(step(1, Some("ABC"))).await;
    h.store.seed_step(step(2, Some("XYZ, ABC"))).await;
    h.store.seed_step(step(3, Some("XYZ"))).await;
    h.store.seed_embedding(flat("manual", "1")).await;

    let conflict = match h.coordinator.delete_fund("F-001", false).await {
        Err(KbError::Conflict(conflict)) => conflict,
        other => panic!("expected conflict, got {other:?}"),
    };
    assert_eq!(conflict.fund_abbr, "ABC");
    let ids: Vec<i32> = conflict.steps.iter().map(|s| s.chunk_id).collect();
    assert_eq!(ids, vec![1, 2]);
    assert_eq!(conflict.steps[1].fund_abbr.as_deref(), Some("XYZ, ABC"));

    let preview = h.coordinator.fund_dependents("F-001").await.expect("preview");
    assert_eq!(preview, conflict);

    assert!(h.store.fund("F-001").await.expect("read").is_some());
    assert_eq!(
        h.store.step(2).await.expect("read").expect("step").fund_abbr.as_deref(),
        Some("XYZ, ABC")
    );
    assert_eq!(h.store.embedding_count().await, 1);
    assert!(h.dispatcher.requests().is_empty());
}

#[tokio::test]
async fn sole_reference_step_is_deleted_with_its_embeddings() {
    let h = harness();
    h.store.seed_fund(fund("F-002", "ABC")).await;
    h.store.seed_step(step(5, Some("ABC"))).await;
    h.store.seed_step(step(6, Some("ABC, ABC"))).await;
    h.store.seed_embedding(flat("manual", "5")).await;
    h.store.seed_embedding(nested("chunk_id", json!("6"))).await;
    h.store.seed_embedding(flat("manual", "9")).await;

    let outcome = h.coordinator.delete_fund("F-002", true).await.expect("delete");
    assert_eq!(outcome.deleted_steps, vec![5, 6]);
    assert!(outcome.updated_steps.is_empty());
    assert!(h.store.step(5).await.expect("read").is_none());
    assert!(h.store.step(6).await.expect("read").is_none());
    assert!(h.store.fund("F-002").await.expect("read").is_none());

    // unrelated step embeddings survive
    assert_eq!(h.store.embedding_count().await, 1);
    assert!(h.dispatcher.requests().is_empty());
}

#[tokio::test]
async fn substring_and_case_variants_are_not_dependents() {
    let h = harness();
    h.store.seed_fund(fund("F-003", "AB")).await;
    h.store.seed_step(step(10, Some("ABC"))).await;
    h.store.seed_step(step(11, Some("XAB, ab"))).await;

    assert!(h.coordinator.dependents("AB").await.expect("dependents").is_empty());
    let outcome = h.coordinator.delete_fund("F-003", false).await.expect("delete");
    assert!(outcome.deleted_steps.is_empty());
    assert!(outcome.updated_steps.is_empty());
    assert_eq!(
        h.store.step(11).await.expect("read").expect("step").fund_abbr.as_deref(),
        Some("XAB, ab")
    );
}

#[tokio::test]
async fn fund_without_dependents_deletes_without_force() {
    let h = harness();
    h.store.seed_fund(fund("F-004", "LONE")).await;
    h.store.seed_embedding(flat("funds", "F-004")).await;
    h.store.seed_embedding(nested("source_id", json!("F-004"))).await;

    h.coordinator.delete_fund("F-004", false).await.expect("delete");
    assert_eq!(h.store.embedding_count().await, 0);

    let err = h.coordinator.delete_fund("F-004", true).await.unwrap_err();
    assert!(matches!(err, KbError::NotFound { .. }), "{err:?}");
}

#[tokio::test]
async fn invalidation_is_idempotent() {
    let h = harness();
    h.store.seed_embedding(flat("manual", "42")).await;
    h.store.seed_embedding(nested("chunk_id", json!(42))).await;
    h.store.seed_embedding(flat("scenario", "42")).await;

    assert_eq!(h.coordinator.invalidate(&manual(42)).await.expect("first"), 2);
    assert_eq!(h.coordinator.invalidate(&manual(42)).await.expect("second"), 0);
    assert_eq!(h.store.embedding_count().await, 1);
}

#[tokio::test]
async fn legacy_cleanup_can_be_disabled() {
    let h = harness();
    h.store.seed_embedding(flat("manual", "42")).await;
    h.store.seed_embedding(nested("chunk_id", json!(42))).await;

    let flat_only = EmbeddingIndex::new(false);
    let removed = flat_only
        .invalidate(&*h.store, &manual(42))
        .await
        .expect("invalidate");
    assert_eq!(removed, 1);
    assert_eq!(h.store.embedding_count().await, 1);
}

#[tokio::test]
async fn interrupted_cascade_resumes_on_retry() {
    let h = harness();
    h.store.seed_fund(fund("F-005", "ABC")).await;
    h.store.seed_step(step(1, Some("ABC XYZ"))).await;
    h.store.seed_step(step(2, Some("ABC"))).await;
    h.store.seed_step(step(3, Some("ABC QRS"))).await;
    for id in ["1", "2", "3"] {
        h.store.seed_embedding(flat("manual", id)).await;
    }

    h.store.fail_commit_after(1).await;
    let err = h.coordinator.delete_fund("F-005", true).await.unwrap_err();
    assert!(matches!(err, KbError::Internal(_)), "{err:?}");

    // step 1 committed; step 2 and the fund did not
    let first = h.store.step(1).await.expect("read").expect("step 1");
    assert_eq!(first.fund_abbr.as_deref(), Some("XYZ"));
    assert!(h.store.step(2).await.expect("read").is_some());
    assert!(h.store.fund("F-005").await.expect("read").is_some());
    assert_eq!(h.store.embedding_count().await, 2);

    let preview = h.coordinator.fund_dependents("F-005").await.expect("preview");
    let ids: Vec<i32> = preview.steps.iter().map(|s| s.chunk_id).collect();
    assert_eq!(ids, vec![2, 3]);

    let outcome = h.coordinator.delete_fund("F-005", true).await.expect("retry");
    assert_eq!(outcome.deleted_steps, vec![2]);
    assert_eq!(outcome.updated_steps, vec![3]);
    assert!(h.store.fund("F-005").await.expect("read").is_none());
    assert_eq!(
        h.store.step(3).await.expect("read").expect("step 3").fund_abbr.as_deref(),
        Some("QRS")
    );
    assert_eq!(h.store.embedding_count().await, 0);

    let regenerated: Vec<String> = h
        .dispatcher
        .requests()
        .iter()
        .map(|req| req.source().id().to_string())
        .collect();
    assert_eq!(regenerated, vec!["1", "3"]);
}

#[tokio::test]
async fn missing_fund_is_not_found() {
    let h = harness();
    let err = h.coordinator.delete_fund("F-404", true).await.unwrap_err();
    assert!(matches!(err, KbError::NotFound { .. }), "{err:?}");
    let err = h.coordinator.fund_dependents("F-404").await.unwrap_err();
    assert!(matches!(err, KbError::NotFound { .. }), "{err:?}");
}

#[tokio::test]
async fn steps_removed_concurrently_are_left_out_of_the_report() {
    let memory = Arc::new(MemoryStore::new());
    memory.seed_fund(fund("F-006", "ABC")).await;
    memory.seed_step(step(1, Some("ABC"))).await;
    memory.seed_embedding(flat("manual", "2")).await;
    let mut store = StaleReads::new(memory.clone());
    store.vanished_steps = vec![step(2, Some("ABC")), step(3, Some("ABC XYZ"))];
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let coordinator = Coordinator::new(Arc::new(store), EmbeddingIndex::default(), dispatcher.clone());

    let outcome = coordinator.delete_fund("F-006", true).await.expect("delete");
    assert_eq!(outcome.deleted_steps, vec![1]);
    assert!(outcome.updated_steps.is_empty());
    assert!(memory.fund("F-006").await.expect("read").is_none());
    // the stale step's embeddings are still cleared
    assert_eq!(memory.embedding_count().await, 0);
    assert!(dispatcher.requests().is_empty());
}
