//! End-to-end document flows: relational store, embedding and vector index.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use tenant_vault::config::RetrievalConfig;
use tenant_vault::documents::{self, ChunkInput, IndexRequest, SearchRequest};
use tenant_vault::registry::TenantRegistry;
use tenant_vault::vault::Vault;
use tenant_vault::vector::Predicate;
use tenant_vault_core::embedding::Embedder;
use tenant_vault_core::models::{ChunkPosition, Scope};

const DIMS: usize = 16;

/// Bag-of-words embedder: each word bumps one bucket. Texts sharing words
/// end up close under cosine distance. Fails on any text containing
/// `poison`.
struct WordEmbedder {
    calls: AtomicUsize,
}

impl WordEmbedder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Embedder for WordEmbedder {
    fn model_name(&self) -> &str {
        "words"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if text.contains("poison") {
            anyhow::bail!("embedding service returned 500");
        }
        let mut v = vec![0.01f32; DIMS];
        for word in text.split_whitespace() {
            let bucket = word
                .bytes()
                .fold(7usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize))
                % DIMS;
            v[bucket] += 1.0;
        }
        Ok(v)
    }
}

fn vault(tmp: &TempDir, embedder: Arc<WordEmbedder>) -> Vault {
    let registry = Arc::new(TenantRegistry::new(tmp.path(), Duration::from_secs(10)));
    Vault::new(registry, Some(embedder), 4, RetrievalConfig::default())
}

fn pages(texts: &[&str]) -> Vec<ChunkInput> {
    texts
        .iter()
        .enumerate()
        .map(|(i, t)| ChunkInput {
            position: ChunkPosition::Page { page_id: i as i64 },
            content: t.to_string(),
        })
        .collect()
}

fn request(doc_id: &str, table: &str, chunks: Vec<ChunkInput>) -> IndexRequest {
    IndexRequest {
        doc_id: Some(doc_id.to_string()),
        title: Some(format!("{} title", doc_id)),
        file_type: "pdf".to_string(),
        table: table.to_string(),
        display_date: Some(Utc::now() - ChronoDuration::days(1)),
        expire_date: None,
        chunks,
    }
}

async fn relational_counts(v: &Vault, scope: &Scope, doc_id: &str) -> (i64, i64) {
    let (mut conn, _) = v.registry().open(scope).await.unwrap();
    let c = conn.ready().await.unwrap();
    let docs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE doc_id = ?")
        .bind(doc_id)
        .fetch_one(&mut *c)
        .await
        .unwrap();
    let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks WHERE doc_id = ?")
        .bind(doc_id)
        .fetch_one(&mut *c)
        .await
        .unwrap();
    conn.close().await.unwrap();
    (docs, chunks)
}

#[tokio::test]
async fn test_index_then_search_in_tenant_scope() {
    let tmp = TempDir::new().unwrap();
    let v = vault(&tmp, WordEmbedder::new());
    let u1 = Scope::tenant("u1").unwrap();

    let report = documents::index_document(
        &v,
        &u1,
        request(
            "doc-a",
            "KnowledgeObject_table",
            pages(&["apples and pears", "ships sail the sea", "tax forms due soon"]),
        ),
    )
    .await
    .unwrap();
    assert_eq!(report.chunks, 3);
    assert_eq!(report.replaced, 0);

    let hits = documents::search(
        &v,
        &u1,
        &SearchRequest {
            table: "KnowledgeObject_table".to_string(),
            query: "ships sail the sea".to_string(),
            k: Some(2),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].content, "ships sail the sea");
    assert_eq!(hits[0].doc_id, "doc-a");
    assert_eq!(hits[0].user_id, "u1");
    assert_eq!(hits[0].position, ChunkPosition::Page { page_id: 1 });
    assert!(hits[0].distance <= hits[1].distance);

    // Nothing leaks into another tenant.
    let other = Scope::tenant("u2").unwrap();
    let hits = documents::search(
        &v,
        &other,
        &SearchRequest {
            table: "KnowledgeObject_table".to_string(),
            query: "ships".to_string(),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn test_reindexing_a_document_replaces_its_rows() {
    let tmp = TempDir::new().unwrap();
    let v = vault(&tmp, WordEmbedder::new());
    let u1 = Scope::tenant("u1").unwrap();

    documents::index_document(&v, &u1, request("doc-a", "kb", pages(&["one", "two", "three"])))
        .await
        .unwrap();
    let report =
        documents::index_document(&v, &u1, request("doc-a", "kb", pages(&["only page"])))
            .await
            .unwrap();
    assert_eq!(report.replaced, 3);

    assert_eq!(v.vectors().count(&u1, "kb", None).await.unwrap(), 1);
    assert_eq!(relational_counts(&v, &u1, "doc-a").await, (1, 1));
}

#[tokio::test]
async fn test_moving_a_document_between_tables() {
    let tmp = TempDir::new().unwrap();
    let v = vault(&tmp, WordEmbedder::new());
    let u1 = Scope::tenant("u1").unwrap();

    documents::index_document(&v, &u1, request("doc-a", "drafts", pages(&["a", "b"])))
        .await
        .unwrap();
    let report = documents::index_document(&v, &u1, request("doc-a", "published", pages(&["a"])))
        .await
        .unwrap();

    assert_eq!(report.replaced, 2);
    assert_eq!(v.vectors().count(&u1, "drafts", None).await.unwrap(), 0);
    assert_eq!(v.vectors().count(&u1, "published", None).await.unwrap(), 1);
}

#[tokio::test]
async fn test_delete_cascades_to_chunks_and_vectors() {
    let tmp = TempDir::new().unwrap();
    let v = vault(&tmp, WordEmbedder::new());
    let u1 = Scope::tenant("u1").unwrap();

    documents::index_document(&v, &u1, request("doc-a", "kb", pages(&["x y", "y z"])))
        .await
        .unwrap();
    documents::index_document(&v, &u1, request("doc-b", "kb", pages(&["keep me"])))
        .await
        .unwrap();

    let report = documents::delete_document(&v, &u1, "doc-a").await.unwrap();
    assert_eq!(report.chunks, 2);
    assert_eq!(report.vectors, 2);

    assert_eq!(relational_counts(&v, &u1, "doc-a").await, (0, 0));
    assert_eq!(v.vectors().count(&u1, "kb", None).await.unwrap(), 1);
    assert_eq!(
        v.vectors()
            .count(&u1, "kb", Some(&Predicate::doc_id("doc-b")))
            .await
            .unwrap(),
        1
    );

    let err = documents::delete_document(&v, &u1, "doc-a").await.err().unwrap();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn test_embedding_failure_writes_nothing() {
    let tmp = TempDir::new().unwrap();
    let embedder = WordEmbedder::new();
    let v = vault(&tmp, embedder.clone());
    let u1 = Scope::tenant("u1").unwrap();

    let err = documents::index_document(
        &v,
        &u1,
        request("doc-bad", "kb", pages(&["fine", "poison pill", "also fine"])),
    )
    .await
    .err()
    .unwrap();

    assert_eq!(err.kind(), "embedding_request_failed");
    assert!(err.to_string().contains("page:1"));
    assert_eq!(relational_counts(&v, &u1, "doc-bad").await, (0, 0));
    assert!(v.vectors().table_schema(&u1, "kb").await.unwrap().is_none());
}

#[tokio::test]
async fn test_shared_table_schema_mismatch_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let v = vault(&tmp, WordEmbedder::new());

    documents::index_document(
        &v,
        &Scope::Shared,
        request("master-1", "KnowledgeObject_table", pages(&["shared page"])),
    )
    .await
    .unwrap();

    let mut timed = request(
        "lecture-1",
        "KnowledgeObject_table",
        vec![ChunkInput {
            position: ChunkPosition::Span {
                chunk_id: 0,
                start: 0.0,
                end: 12.5,
            },
            content: "welcome to the lecture".to_string(),
        }],
    );
    timed.file_type = "video".to_string();

    let err = documents::index_document(&v, &Scope::Shared, timed)
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), "schema_mismatch");

    // Rejected before the relational write.
    assert_eq!(relational_counts(&v, &Scope::Shared, "lecture-1").await, (0, 0));
    assert_eq!(
        v.vectors()
            .count(&Scope::Shared, "KnowledgeObject_table", None)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_search_respects_validity_window() {
    let tmp = TempDir::new().unwrap();
    let v = vault(&tmp, WordEmbedder::new());
    let u1 = Scope::tenant("u1").unwrap();
    let now = Utc::now();

    let mut expired = request("old", "kb", pages(&["quarterly report"]));
    expired.display_date = Some(now - ChronoDuration::days(30));
    expired.expire_date = Some(now - ChronoDuration::days(1));
    documents::index_document(&v, &u1, expired).await.unwrap();

    let mut future = request("upcoming", "kb", pages(&["quarterly report draft"]));
    future.display_date = Some(now + ChronoDuration::days(7));
    documents::index_document(&v, &u1, future).await.unwrap();

    documents::index_document(&v, &u1, request("current", "kb", pages(&["quarterly numbers"])))
        .await
        .unwrap();

    let all = SearchRequest {
        table: "kb".to_string(),
        query: "quarterly report".to_string(),
        k: Some(10),
        ..Default::default()
    };
    assert_eq!(documents::search(&v, &u1, &all).await.unwrap().len(), 3);

    let visible = SearchRequest {
        valid_at: Some(now),
        ..all.clone()
    };
    let hits = documents::search(&v, &u1, &visible).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].doc_id, "current");
    assert!(hits[0].window.display_date <= now && now < hits[0].window.expire_date);
}

#[tokio::test]
async fn test_reindex_rebuilds_table_from_relational_rows() {
    let tmp = TempDir::new().unwrap();
    let embedder = WordEmbedder::new();
    let v = vault(&tmp, embedder.clone());
    let u1 = Scope::tenant("u1").unwrap();

    documents::index_document(&v, &u1, request("doc-a", "kb", pages(&["alpha", "beta"])))
        .await
        .unwrap();
    documents::index_document(&v, &u1, request("doc-b", "kb", pages(&["gamma"])))
        .await
        .unwrap();

    // Simulate a lagging index: drop doc-b's rows behind the store's back.
    v.vectors()
        .delete_where(&u1, "kb", &Predicate::doc_id("doc-b"))
        .await
        .unwrap();
    assert_eq!(v.vectors().count(&u1, "kb", None).await.unwrap(), 2);

    let before = embedder.calls.load(Ordering::SeqCst);
    let report = documents::reindex(&v, &u1, "kb").await.unwrap();
    assert_eq!(report.documents, 2);
    assert_eq!(report.chunks, 3);
    assert_eq!(report.removed, 2);
    assert_eq!(embedder.calls.load(Ordering::SeqCst) - before, 3);
    assert_eq!(v.vectors().count(&u1, "kb", None).await.unwrap(), 3);
}

#[tokio::test]
async fn test_disabled_embedder_rejects_indexing() {
    let tmp = TempDir::new().unwrap();
    let registry = Arc::new(TenantRegistry::new(tmp.path(), Duration::from_secs(10)));
    let v = Vault::new(registry, None, 4, RetrievalConfig::default());

    let err = documents::index_document(
        &v,
        &Scope::tenant("u1").unwrap(),
        request("doc-a", "kb", pages(&["text"])),
    )
    .await
    .err()
    .unwrap();
    assert_eq!(err.kind(), "bad_request");
}

#[tokio::test]
async fn test_concurrent_index_of_one_document_keeps_one_row_per_chunk() {
    let tmp = TempDir::new().unwrap();
    let v = vault(&tmp, WordEmbedder::new());
    let u1 = Scope::tenant("u1").unwrap();

    for _ in 0..3 {
        let (a, b) = tokio::join!(
            documents::index_document(&v, &u1, request("doc-a", "kb", pages(&["one", "two", "three"]))),
            documents::index_document(&v, &u1, request("doc-a", "kb", pages(&["one", "two", "three"]))),
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(
            v.vectors()
                .count(&u1, "kb", Some(&Predicate::doc_id("doc-a")))
                .await
                .unwrap(),
            3
        );
        assert_eq!(relational_counts(&v, &u1, "doc-a").await, (1, 3));
    }
}

#[tokio::test]
async fn test_reindex_alongside_new_document_keeps_its_rows() {
    let tmp = TempDir::new().unwrap();
    let v = vault(&tmp, WordEmbedder::new());
    let u1 = Scope::tenant("u1").unwrap();

    documents::index_document(&v, &u1, request("doc-a", "kb", pages(&["alpha", "beta"])))
        .await
        .unwrap();

    let (rebuilt, added) = tokio::join!(
        documents::reindex(&v, &u1, "kb"),
        documents::index_document(&v, &u1, request("doc-b", "kb", pages(&["gamma"]))),
    );
    rebuilt.unwrap();
    added.unwrap();

    assert_eq!(
        v.vectors()
            .count(&u1, "kb", Some(&Predicate::doc_id("doc-b")))
            .await
            .unwrap(),
        1
    );
    assert_eq!(v.vectors().count(&u1, "kb", None).await.unwrap(), 3);
}

#[tokio::test]
async fn test_search_provisions_and_migrates_the_store() {
    let tmp = TempDir::new().unwrap();
    let v = vault(&tmp, WordEmbedder::new());
    let fresh = Scope::tenant("newcomer").unwrap();
    assert!(!v.registry().store_exists(&fresh));

    let hits = documents::search(
        &v,
        &fresh,
        &SearchRequest {
            table: "kb".to_string(),
            query: "anything".to_string(),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert!(hits.is_empty());

    let store = v.registry().resolve(&fresh).await.unwrap();
    let mut conn = store.connect().await.unwrap();
    let status = v.registry().migrator().status(&mut conn).await.unwrap();
    conn.close().await.unwrap();
    assert!(status.is_current());
}

#[tokio::test]
async fn test_table_stats_reports_lagging_index() {
    let tmp = TempDir::new().unwrap();
    let v = vault(&tmp, WordEmbedder::new());
    let u1 = Scope::tenant("u1").unwrap();

    documents::index_document(&v, &u1, request("doc-a", "kb", pages(&["alpha", "beta"])))
        .await
        .unwrap();
    let mut later = request("doc-b", "kb", pages(&["gamma"]));
    later.display_date = Some(Utc::now() + ChronoDuration::days(3));
    documents::index_document(&v, &u1, later).await.unwrap();

    let stats = documents::table_stats(&v, &u1, "kb").await.unwrap();
    assert_eq!(stats.documents, 2);
    assert_eq!(stats.chunks, 3);
    assert_eq!(stats.vectors, 3);
    assert_eq!(stats.visible, 2);
    assert!(stats.in_sync);
    assert_eq!(stats.schema.map(|s| s.dims), Some(DIMS));

    v.vectors()
        .delete_where(&u1, "kb", &Predicate::doc_id("doc-a"))
        .await
        .unwrap();
    let stats = documents::table_stats(&v, &u1, "kb").await.unwrap();
    assert_eq!(stats.vectors, 1);
    assert!(!stats.in_sync);

    let err = documents::table_stats(&v, &u1, "nothing_here").await.err().unwrap();
    assert_eq!(err.kind(), "not_found");
}
