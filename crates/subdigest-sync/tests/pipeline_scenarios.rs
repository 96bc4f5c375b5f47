use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arrow_array::{Array, StringArray, TimestampMillisecondArray};
use async_trait::async_trait;
use chrono::{Datelike, TimeZone, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use subdigest_adapters::{
    FeedWindows, ForumSource, ListingPage, ModelError, SourceError, Summarizer, SummarizerConfig,
    SummaryModel,
};
use arrow_array::ListArray;
use chrono::DateTime;
use subdigest_core::{CandidateWindow, PostCandidate, ProcessedMarker, RunStatus};
use subdigest_storage::{
    BackoffPolicy, DedupStore, DedupStoreError, FsObjectStore, MemoryDedupStore, ObjectStore,
    ObjectStoreError, StoredObject,
};
use subdigest_sync::{Orchestrator, PipelineError, RecordWriter, RunSettings};
use tempfile::TempDir;
use tokio::sync::Barrier;

fn post(n: usize, comment_count: u32) -> PostCandidate {
    PostCandidate {
        id: format!("p{n}"),
        subreddit: "aws".into(),
        title: format!("How do I fix thing {n}?"),
        body: format!("Details about thing {n}"),
        author: "asker".into(),
        url: format!("https://www.reddit.com/r/aws/comments/p{n}/"),
        score: 3,
        created_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap(),
        comment_count,
        window: CandidateWindow::Recent,
    }
}

struct FakeForum {
    posts: Mutex<Vec<PostCandidate>>,
    fail_comments_for: Option<String>,
}

impl FakeForum {
    fn with_posts(count: usize, comment_count: u32) -> Arc<Self> {
        Arc::new(Self {
            posts: Mutex::new((0..count).map(|n| post(n, comment_count)).collect()),
            fail_comments_for: None,
        })
    }

    fn set_comment_count(&self, id: &str, count: u32) {
        let mut posts = self.posts.lock().unwrap();
        if let Some(post) = posts.iter_mut().find(|p| p.id == id) {
            post.comment_count = count;
        }
    }
}

#[async_trait]
impl ForumSource for FakeForum {
    async fn list_new(
        &self,
        _subreddit: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<ListingPage, SourceError> {
        let posts = self.posts.lock().unwrap().clone();
        let start = after
            .and_then(|a| posts.iter().position(|p| p.id == a))
            .map(|i| i + 1)
            .unwrap_or(0);
        let end = (start + limit).min(posts.len());
        let page = posts[start..end].to_vec();
        let after = (end < posts.len()).then(|| posts[end - 1].id.clone());
        Ok(ListingPage { posts: page, after })
    }

    async fn top_comments(&self, post_id: &str, limit: usize) -> Result<Vec<String>, SourceError> {
        if self.fail_comments_for.as_deref() == Some(post_id) {
            return Err(SourceError::Fetch("503 from comments endpoint".into()));
        }
        Ok((0..limit.min(2))
            .map(|i| format!("answer {i} for {post_id}"))
            .collect())
    }
}

/// Listing calls fail with the given error; nothing is ever served.
struct FailingForum(SourceError);

#[async_trait]
impl ForumSource for FailingForum {
    async fn list_new(
        &self,
        _subreddit: &str,
        _after: Option<&str>,
        _limit: usize,
    ) -> Result<ListingPage, SourceError> {
        Err(self.0.clone())
    }

    async fn top_comments(&self, _post_id: &str, _limit: usize) -> Result<Vec<String>, SourceError> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct FakeModel {
    calls: AtomicUsize,
    always_throttle: HashSet<String>,
    barrier: Option<Arc<Barrier>>,
    reply_json: bool,
}

#[async_trait]
impl SummaryModel for FakeModel {
    async fn summarize(&self, _model_id: &str, input: &str) -> Result<String, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(barrier) = &self.barrier {
            barrier.wait().await;
        }
        if self.always_throttle.iter().any(|t| input.contains(t.as_str())) {
            return Err(ModelError::Throttled("429 Too Many Requests".into()));
        }
        if self.reply_json {
            return Ok(r#"{"problem_summary": "Cannot fix thing.", "problem_explanation": {"primary_concepts": [{"name": "IAM", "definition": "Access control", "use_case": "Permissions", "how_it_functions": "Policies"}], "explanation": "Missing permission."}, "solution_summary": "Grant access.", "solution_explanation": "Attach a policy.", "suggested_categories": ["IAM", "Security"]}"#.into());
        }
        Ok(format!("summary of {}", input.lines().next().unwrap_or_default()))
    }
}

fn pool_timeout() -> DedupStoreError {
    DedupStoreError::Database(sqlx::Error::PoolTimedOut)
}

/// Memory markers behind a database that fails on chosen calls.
#[derive(Default)]
struct FlakyDedup {
    inner: MemoryDedupStore,
    batch_down: bool,
    lookup_fails_for: HashSet<String>,
    create_fails_for: HashSet<String>,
}

#[async_trait]
impl DedupStore for FlakyDedup {
    async fn lookup(&self, id: &str) -> Result<Option<ProcessedMarker>, DedupStoreError> {
        if self.lookup_fails_for.contains(id) {
            return Err(pool_timeout());
        }
        self.inner.lookup(id).await
    }

    async fn lookup_many(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, ProcessedMarker>, DedupStoreError> {
        if self.batch_down {
            return Err(pool_timeout());
        }
        self.inner.lookup_many(ids).await
    }

    async fn create_if_absent(&self, marker: &ProcessedMarker) -> Result<bool, DedupStoreError> {
        if self.create_fails_for.contains(&marker.id) {
            return Err(pool_timeout());
        }
        self.inner.create_if_absent(marker).await
    }

    async fn update(
        &self,
        id: &str,
        comment_count: u32,
        at: DateTime<Utc>,
    ) -> Result<(), DedupStoreError> {
        self.inner.update(id, comment_count, at).await
    }
}

struct BrokenStore;

#[async_trait]
impl ObjectStore for BrokenStore {
    async fn put(&self, _key: &str, _bytes: &[u8]) -> Result<StoredObject, ObjectStoreError> {
        Err(ObjectStoreError::Io(anyhow::anyhow!("bucket unreachable")))
    }
}

fn settings(post_limit: usize) -> RunSettings {
    RunSettings {
        subreddit: "aws".into(),
        windows: FeedWindows {
            post_limit,
            new_post_check_limit: post_limit,
        },
        comment_limit: 10,
        reprocess_threshold: 2,
        min_comments: 0,
        model_id: "test-model".into(),
        run_timeout: Duration::from_secs(60),
        flush_reserve: Duration::ZERO,
        summarize_concurrency: 4,
    }
}

fn orchestrator(
    forum: Arc<dyn ForumSource>,
    dedup: Arc<dyn DedupStore>,
    model: Arc<FakeModel>,
    store: Arc<dyn ObjectStore>,
    settings: RunSettings,
) -> Orchestrator {
    let summarizer = Summarizer::new(
        model,
        SummarizerConfig {
            backoff: BackoffPolicy::immediate(2),
            ..SummarizerConfig::new(settings.model_id.clone())
        },
    );
    let writer = RecordWriter::new(store, "reddit-analysis").with_backoff(BackoffPolicy::immediate(1));
    Orchestrator::new(forum, dedup, summarizer, writer, settings)
}

fn fs_store() -> (TempDir, Arc<dyn ObjectStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(dir.path()));
    (dir, store)
}

#[tokio::test]
async fn fresh_posts_are_written_once_then_skipped() {
    let (dir, store) = fs_store();
    let forum = FakeForum::with_posts(5, 1);
    let dedup = Arc::new(MemoryDedupStore::new());
    let model = Arc::new(FakeModel::default());

    let first = orchestrator(forum.clone(), dedup.clone(), model.clone(), store.clone(), settings(5))
        .run()
        .await
        .unwrap();
    assert_eq!(first.fetched, 5);
    assert_eq!(first.written, 5);
    assert_eq!(first.created, 5);
    assert_eq!(first.skipped_duplicate, 0);
    assert_eq!(first.partitions.len(), 1);
    assert_eq!(first.status(), RunStatus::Completed);
    assert!(dir.path().join(&first.partitions[0]).exists());
    let markers_after_first = dedup.snapshot().await;
    assert_eq!(markers_after_first.len(), 5);

    let second = orchestrator(forum, dedup.clone(), model.clone(), store, settings(5))
        .run()
        .await
        .unwrap();
    assert_eq!(second.fetched, 5);
    assert_eq!(second.skipped_duplicate, 5);
    assert_eq!(second.written, 0);
    assert!(second.partitions.is_empty());
    assert_eq!(dedup.snapshot().await, markers_after_first);
    assert_eq!(model.calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn comment_growth_past_threshold_reprocesses() {
    let (_dir, store) = fs_store();
    let forum = FakeForum::with_posts(1, 3);
    let dedup = Arc::new(MemoryDedupStore::new());
    let earlier = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).single().unwrap();
    dedup.insert(ProcessedMarker::first("p0", 3, earlier)).await;

    forum.set_comment_count("p0", 4);
    let report = orchestrator(
        forum.clone(),
        dedup.clone(),
        Arc::new(FakeModel::default()),
        store.clone(),
        settings(1),
    )
    .run()
    .await
    .unwrap();
    assert_eq!(report.skipped_duplicate, 1);
    assert_eq!(report.written, 0);

    forum.set_comment_count("p0", 6);
    let report = orchestrator(
        forum,
        dedup.clone(),
        Arc::new(FakeModel::default()),
        store,
        settings(1),
    )
    .run()
    .await
    .unwrap();
    assert_eq!(report.reprocessed, 1);
    assert_eq!(report.written, 1);

    let marker = dedup.snapshot().await.remove("p0").unwrap();
    assert_eq!(marker.comment_count, 6);
    assert_eq!(marker.first_processed_at, earlier);
    assert!(marker.last_processed_at > earlier);
}

#[tokio::test]
async fn throttled_item_is_written_without_summary() {
    let (dir, store) = fs_store();
    let forum = FakeForum::with_posts(5, 1);
    let dedup = Arc::new(MemoryDedupStore::new());
    let model = Arc::new(FakeModel {
        always_throttle: HashSet::from(["thing 2?".to_string()]),
        ..FakeModel::default()
    });

    let report = orchestrator(forum, dedup.clone(), model.clone(), store, settings(5))
        .run()
        .await
        .unwrap();
    assert_eq!(report.summarization_failed, 1);
    assert_eq!(report.written, 5);
    assert_eq!(report.created, 5);
    assert_eq!(report.status(), RunStatus::Partial);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].id, "p2");
    assert_eq!(model.calls.load(Ordering::SeqCst), 4 + 3);

    let file = std::fs::File::open(dir.path().join(&report.partitions[0])).unwrap();
    let batch = ParquetRecordBatchReaderBuilder::try_new(file)
        .unwrap()
        .build()
        .unwrap()
        .next()
        .unwrap()
        .unwrap();
    let ids = batch.column(0).as_any().downcast_ref::<StringArray>().unwrap();
    let summaries = batch.column(10).as_any().downcast_ref::<StringArray>().unwrap();
    assert_eq!(summaries.null_count(), 1);
    for row in 0..batch.num_rows() {
        assert_eq!(summaries.is_null(row), ids.value(row) == "p2");
    }
}

#[tokio::test]
async fn write_failure_aborts_without_marking() {
    let forum = FakeForum::with_posts(5, 1);
    let dedup = Arc::new(MemoryDedupStore::new());

    let err = orchestrator(
        forum.clone(),
        dedup.clone(),
        Arc::new(FakeModel::default()),
        Arc::new(BrokenStore),
        settings(5),
    )
    .run()
    .await
    .unwrap_err();
    assert!(matches!(err, PipelineError::Write(_)));
    assert!(dedup.snapshot().await.is_empty());

    let (_dir, store) = fs_store();
    let retry = orchestrator(forum, dedup.clone(), Arc::new(FakeModel::default()), store, settings(5))
        .run()
        .await
        .unwrap();
    assert_eq!(retry.written, 5);
    assert_eq!(retry.created, 5);
}

#[tokio::test]
async fn partition_path_matches_ingestion_date() {
    let (dir, store) = fs_store();
    let report = orchestrator(
        FakeForum::with_posts(3, 1),
        Arc::new(MemoryDedupStore::new()),
        Arc::new(FakeModel::default()),
        store,
        settings(3),
    )
    .run()
    .await
    .unwrap();

    for key in &report.partitions {
        let file = std::fs::File::open(dir.path().join(key)).unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap();
        for batch in reader {
            let batch = batch.unwrap();
            let ingested = batch
                .column(12)
                .as_any()
                .downcast_ref::<TimestampMillisecondArray>()
                .unwrap();
            for row in 0..batch.num_rows() {
                let date = Utc
                    .timestamp_millis_opt(ingested.value(row))
                    .single()
                    .unwrap()
                    .date_naive();
                let expected = format!(
                    "year={:04}/month={:02}/day={:02}/",
                    date.year(),
                    date.month(),
                    date.day()
                );
                assert!(key.contains(&expected), "{key} does not match {expected}");
            }
        }
    }
}

#[tokio::test]
async fn comment_fetch_failure_skips_only_that_item() {
    let (_dir, store) = fs_store();
    let forum = Arc::new(FakeForum {
        posts: Mutex::new((0..3).map(|n| post(n, 1)).collect()),
        fail_comments_for: Some("p1".into()),
    });
    let dedup = Arc::new(MemoryDedupStore::new());
    let report = orchestrator(forum, dedup.clone(), Arc::new(FakeModel::default()), store, settings(3))
        .run()
        .await
        .unwrap();
    assert_eq!(report.written, 2);
    assert_eq!(report.failures[0].id, "p1");
    assert!(!dedup.snapshot().await.contains_key("p1"));
}

#[tokio::test]
async fn low_comment_posts_are_not_processed() {
    let (_dir, store) = fs_store();
    let forum = FakeForum::with_posts(2, 1);
    forum.set_comment_count("p1", 5);
    let mut settings = settings(2);
    settings.min_comments = 2;
    let report = orchestrator(
        forum,
        Arc::new(MemoryDedupStore::new()),
        Arc::new(FakeModel::default()),
        store,
        settings,
    )
    .run()
    .await
    .unwrap();
    assert_eq!(report.skipped_low_comments, 1);
    assert_eq!(report.written, 1);
}

#[tokio::test]
async fn spent_budget_leaves_candidates_not_attempted() {
    let (_dir, store) = fs_store();
    let dedup = Arc::new(MemoryDedupStore::new());
    let model = Arc::new(FakeModel::default());
    let mut settings = settings(5);
    settings.run_timeout = Duration::ZERO;

    let report = orchestrator(FakeForum::with_posts(5, 1), dedup.clone(), model.clone(), store, settings)
        .run()
        .await
        .unwrap();
    assert_eq!(report.not_attempted, 5);
    assert_eq!(report.written, 0);
    assert_eq!(report.status(), RunStatus::Completed);
    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    assert!(dedup.snapshot().await.is_empty());
}

#[tokio::test]
async fn racing_runs_create_exactly_one_marker() {
    let forum = FakeForum::with_posts(1, 1);
    let dedup = Arc::new(MemoryDedupStore::new());
    let barrier = Arc::new(Barrier::new(2));
    let model = || {
        Arc::new(FakeModel {
            barrier: Some(barrier.clone()),
            ..FakeModel::default()
        })
    };
    let (_dir_a, store_a) = fs_store();
    let (_dir_b, store_b) = fs_store();

    let mut run_a = orchestrator(forum.clone(), dedup.clone(), model(), store_a, settings(1));
    let mut run_b = orchestrator(forum, dedup.clone(), model(), store_b, settings(1));
    let (a, b) = tokio::join!(run_a.run(), run_b.run());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.written + b.written, 2);
    assert_eq!(a.created + b.created, 1);
    assert_eq!(a.lost_races + b.lost_races, 1);
    assert_eq!(dedup.snapshot().await.len(), 1);
}

#[tokio::test]
async fn wider_check_window_does_not_widen_new_work() {
    let (_dir, store) = fs_store();
    let dedup = Arc::new(MemoryDedupStore::new());
    let model = Arc::new(FakeModel::default());
    let mut settings = settings(5);
    settings.windows.new_post_check_limit = 50;

    let report = orchestrator(FakeForum::with_posts(50, 1), dedup.clone(), model.clone(), store, settings)
        .run()
        .await
        .unwrap();
    assert_eq!(report.fetched, 5);
    assert_eq!(report.outside_window, 45);
    assert_eq!(report.written, 5);
    assert_eq!(report.created, 5);
    assert_eq!(model.calls.load(Ordering::SeqCst), 5);

    let markers = dedup.snapshot().await;
    assert_eq!(markers.len(), 5);
    assert!((0..5).all(|n| markers.contains_key(&format!("p{n}"))));
}

#[tokio::test]
async fn grown_post_beyond_the_recent_window_is_reprocessed() {
    let (_dir, store) = fs_store();
    let forum = FakeForum::with_posts(10, 1);
    let dedup = Arc::new(MemoryDedupStore::new());
    let earlier = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).single().unwrap();
    dedup.insert(ProcessedMarker::first("p7", 1, earlier)).await;
    dedup.insert(ProcessedMarker::first("p8", 1, earlier)).await;
    forum.set_comment_count("p7", 5);
    let mut settings = settings(2);
    settings.windows.new_post_check_limit = 10;

    let report = orchestrator(forum, dedup.clone(), Arc::new(FakeModel::default()), store, settings)
        .run()
        .await
        .unwrap();
    assert_eq!(report.fetched, 4);
    assert_eq!(report.outside_window, 6);
    assert_eq!(report.created, 2);
    assert_eq!(report.reprocessed, 1);
    assert_eq!(report.skipped_duplicate, 1);
    assert_eq!(report.written, 3);
    assert_eq!(dedup.snapshot().await["p7"].comment_count, 5);
}

#[tokio::test]
async fn failed_marker_lookup_leaves_candidate_indeterminate() {
    let (_dir, store) = fs_store();
    let dedup = Arc::new(FlakyDedup {
        batch_down: true,
        lookup_fails_for: HashSet::from(["p1".to_string()]),
        ..FlakyDedup::default()
    });
    let model = Arc::new(FakeModel::default());

    let report = orchestrator(FakeForum::with_posts(3, 1), dedup.clone(), model.clone(), store, settings(3))
        .run()
        .await
        .unwrap();
    assert_eq!(report.indeterminate, 1);
    assert_eq!(report.written, 2);
    assert_eq!(report.created, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].id, "p1");
    assert_eq!(report.status(), RunStatus::Partial);
    assert_eq!(model.calls.load(Ordering::SeqCst), 2);

    let markers = dedup.inner.snapshot().await;
    assert!(!markers.contains_key("p1"));
    assert_eq!(markers.len(), 2);
}

#[tokio::test]
async fn marker_failure_after_commit_keeps_the_partition() {
    let (dir, store) = fs_store();
    let dedup = Arc::new(FlakyDedup {
        create_fails_for: HashSet::from(["p1".to_string()]),
        ..FlakyDedup::default()
    });

    let report = orchestrator(
        FakeForum::with_posts(3, 1),
        dedup.clone(),
        Arc::new(FakeModel::default()),
        store,
        settings(3),
    )
    .run()
    .await
    .unwrap();
    assert_eq!(report.written, 3);
    assert_eq!(report.created, 2);
    assert_eq!(report.mark_failed, 1);
    assert_eq!(report.status(), RunStatus::Partial);
    assert!(dir.path().join(&report.partitions[0]).exists());

    let markers = dedup.inner.snapshot().await;
    assert_eq!(markers.len(), 2);
    assert!(!markers.contains_key("p1"));
}

#[tokio::test]
async fn auth_failure_aborts_before_any_work() {
    let (dir, store) = fs_store();
    let dedup = Arc::new(MemoryDedupStore::new());
    let model = Arc::new(FakeModel::default());
    let forum = Arc::new(FailingForum(SourceError::Auth("401 invalid_grant".into())));

    let err = orchestrator(forum, dedup.clone(), model.clone(), store, settings(5))
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Auth(reason) if reason.contains("invalid_grant")));
    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    assert!(dedup.snapshot().await.is_empty());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn unreachable_forum_fails_the_run() {
    let (_dir, store) = fs_store();
    let dedup = Arc::new(MemoryDedupStore::new());
    let forum = Arc::new(FailingForum(SourceError::Fetch("502 Bad Gateway".into())));

    let err = orchestrator(forum, dedup.clone(), Arc::new(FakeModel::default()), store, settings(5))
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Fetch(reason) if reason.contains("502")));
    assert!(dedup.snapshot().await.is_empty());
}

#[tokio::test]
async fn structured_analysis_reaches_the_partition() {
    let (dir, store) = fs_store();
    let model = Arc::new(FakeModel {
        reply_json: true,
        ..FakeModel::default()
    });

    let report = orchestrator(
        FakeForum::with_posts(2, 1),
        Arc::new(MemoryDedupStore::new()),
        model,
        store,
        settings(2),
    )
    .run()
    .await
    .unwrap();
    assert_eq!(report.written, 2);

    let file = std::fs::File::open(dir.path().join(&report.partitions[0])).unwrap();
    let batch = ParquetRecordBatchReaderBuilder::try_new(file)
        .unwrap()
        .build()
        .unwrap()
        .next()
        .unwrap()
        .unwrap();
    let summaries = batch
        .column_by_name("summary")
        .unwrap()
        .as_any()
        .downcast_ref::<StringArray>()
        .unwrap();
    assert_eq!(summaries.value(0), "Problem: Cannot fix thing.\nSolution: Grant access.");
    let categories = batch
        .column_by_name("suggested_categories")
        .unwrap()
        .as_any()
        .downcast_ref::<ListArray>()
        .unwrap();
    let first = categories.value(0);
    let first = first.as_any().downcast_ref::<StringArray>().unwrap();
    assert_eq!(first.value(1), "Security");
}
