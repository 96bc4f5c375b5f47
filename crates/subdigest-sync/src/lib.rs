//! Run orchestration: fetch candidates, check dedup markers, summarize, commit
//! partitions, then mark. Markers are only written after the data they vouch
//! for is durable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use subdigest_adapters::{
    CandidateFeed, ChatModelConfig, FeedWindows, ForumSource, OpenAiChatModel, RedditSource,
    SourceError, Summarizer, SummarizerConfig, Summary,
};
use subdigest_core::{
    CandidateWindow, ItemFailure, PostCandidate, PostRecord, ProcessedMarker, RunReport,
};
use subdigest_storage::{
    CredentialProvider, DedupStore, EnvSecretSource, FileSecretSource, FsObjectStore,
    HttpClientConfig, HttpFetcher, MemoryDedupStore, PgDedupStore, SecretSource,
    TokenBucketConfig,
};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;
mod writer;

pub use config::{ConfigError, DedupBackend, PipelineConfig, RawConfig};
pub use writer::{
    encode_partition, partition_key, record_schema, CommittedPartition, RecordWriter, WriteError,
    SCHEMA_VERSION,
};

pub const CRATE_NAME: &str = "subdigest-sync";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("no candidates could be fetched: {0}")]
    Fetch(String),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error("pipeline setup failed: {0:#}")]
    Setup(#[from] anyhow::Error),
}

/// The subset of [`PipelineConfig`] a single run consults.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub subreddit: String,
    pub windows: FeedWindows,
    pub comment_limit: usize,
    pub reprocess_threshold: u32,
    pub min_comments: u32,
    pub model_id: String,
    pub run_timeout: Duration,
    pub flush_reserve: Duration,
    pub summarize_concurrency: usize,
}

impl From<&PipelineConfig> for RunSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            subreddit: config.subreddit_name.clone(),
            windows: FeedWindows {
                post_limit: config.post_limit,
                new_post_check_limit: config.new_post_check_limit,
            },
            comment_limit: config.comment_limit,
            reprocess_threshold: config.reprocess_comment_threshold,
            min_comments: config.min_comments_to_process,
            model_id: config.model_id.clone(),
            run_timeout: config.run_timeout,
            flush_reserve: config.flush_reserve,
            summarize_concurrency: config.summarize_concurrency,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Fetching,
    Processing,
    Flush,
    MarkAll,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupDecision {
    New,
    Reprocess { previous: u32 },
    Skip,
}

/// New when unmarked; reprocessed only when comments grew by at least `threshold`.
pub fn decide(comment_count: u32, marker: Option<&ProcessedMarker>, threshold: u32) -> DedupDecision {
    match marker {
        None => DedupDecision::New,
        Some(marker) if comment_count.saturating_sub(marker.comment_count) >= threshold => {
            DedupDecision::Reprocess {
                previous: marker.comment_count,
            }
        }
        Some(_) => DedupDecision::Skip,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkAction {
    Create,
    Update,
}

struct Admitted {
    order: usize,
    candidate: PostCandidate,
    action: MarkAction,
}

struct Staged {
    order: usize,
    record: PostRecord,
    action: MarkAction,
}

enum ItemOutcome {
    Ready {
        order: usize,
        candidate: PostCandidate,
        action: MarkAction,
        comments: Vec<String>,
        summary: Result<Summary, String>,
    },
    CommentsFailed {
        order: usize,
        candidate: PostCandidate,
        reason: String,
    },
}

pub struct Orchestrator {
    source: Arc<dyn ForumSource>,
    dedup: Arc<dyn DedupStore>,
    summarizer: Summarizer,
    writer: RecordWriter,
    settings: RunSettings,
    state: RunState,
}

impl Orchestrator {
    pub fn new(
        source: Arc<dyn ForumSource>,
        dedup: Arc<dyn DedupStore>,
        summarizer: Summarizer,
        writer: RecordWriter,
        settings: RunSettings,
    ) -> Self {
        Self {
            source,
            dedup,
            summarizer,
            writer,
            settings,
            state: RunState::Init,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn enter(&mut self, next: RunState) {
        debug!(from = ?self.state, to = ?next, "run state transition");
        self.state = next;
    }

    pub async fn run(&mut self) -> Result<RunReport, PipelineError> {
        self.run_with_id(Uuid::new_v4()).await
    }

    pub async fn run_with_id(&mut self, run_id: Uuid) -> Result<RunReport, PipelineError> {
        let span = info_span!("pipeline_run", %run_id, subreddit = %self.settings.subreddit);
        self.execute(run_id).instrument(span).await
    }

    async fn execute(&mut self, run_id: Uuid) -> Result<RunReport, PipelineError> {
        self.state = RunState::Init;
        let deadline = Instant::now() + self.settings.run_timeout;
        let mut report = RunReport::new(run_id, self.settings.subreddit.clone(), Utc::now());

        self.enter(RunState::Fetching);
        let mut feed = CandidateFeed::new(
            self.source.clone(),
            self.settings.subreddit.clone(),
            self.settings.windows,
        );
        let candidates = feed.collect_all().await.map_err(|err| match err {
            SourceError::Auth(reason) => PipelineError::Auth(reason),
            other => PipelineError::Fetch(other.to_string()),
        })?;
        report.fetch_errors = feed.fetch_errors().to_vec();
        if candidates.is_empty() && !report.fetch_errors.is_empty() {
            return Err(PipelineError::Fetch(report.fetch_errors.join("; ")));
        }
        let seen = candidates.len();

        self.enter(RunState::Processing);
        let admitted = self.check_dedup(candidates, &mut report).await;
        report.fetched = seen - report.outside_window;
        info!(
            fetched = report.fetched,
            outside_window = report.outside_window,
            admitted = admitted.len(),
            "candidates checked"
        );
        let staged = self.process(admitted, deadline, &mut report).await;

        self.enter(RunState::Flush);
        let records: Vec<PostRecord> = staged.iter().map(|s| s.record.clone()).collect();
        if !records.is_empty() {
            let committed = self.writer.commit(run_id, &records).await?;
            report.written = committed.iter().map(|p| p.rows).sum();
            report.partitions = committed.into_iter().map(|p| p.key).collect();
        }

        self.enter(RunState::MarkAll);
        self.mark_all(&staged, &mut report).await;

        self.enter(RunState::Done);
        report.finished_at = Utc::now();
        info!(
            status = ?report.status(),
            fetched = report.fetched,
            outside_window = report.outside_window,
            skipped_duplicate = report.skipped_duplicate,
            skipped_low_comments = report.skipped_low_comments,
            indeterminate = report.indeterminate,
            created = report.created,
            reprocessed = report.reprocessed,
            summarization_failed = report.summarization_failed,
            written = report.written,
            not_attempted = report.not_attempted,
            lost_races = report.lost_races,
            mark_failed = report.mark_failed,
            "run finished"
        );
        Ok(report)
    }

    async fn check_dedup(
        &self,
        candidates: Vec<PostCandidate>,
        report: &mut RunReport,
    ) -> Vec<Admitted> {
        let ids: Vec<String> = candidates.iter().map(|c| c.id.clone()).collect();
        let batched = match self.dedup.lookup_many(&ids).await {
            Ok(found) => Some(found),
            Err(err) => {
                warn!(error = %err, "batched marker lookup failed; falling back to single lookups");
                None
            }
        };

        let mut admitted = Vec::new();
        for (order, candidate) in candidates.into_iter().enumerate() {
            let marker = match &batched {
                Some(found) => found.get(&candidate.id).cloned(),
                None => match self.dedup.lookup(&candidate.id).await {
                    Ok(marker) => marker,
                    Err(err) => {
                        warn!(id = %candidate.id, error = %err, "marker lookup failed; skipping");
                        report.indeterminate += 1;
                        report.record_failure(ItemFailure::new(
                            candidate.id.clone(),
                            &candidate.title,
                            format!("dedup lookup failed: {err}"),
                        ));
                        continue;
                    }
                },
            };

            // The recheck window only looks for growth on posts already processed.
            if marker.is_none() && candidate.window == CandidateWindow::Recheck {
                report.outside_window += 1;
                continue;
            }

            let action = match decide(
                candidate.comment_count,
                marker.as_ref(),
                self.settings.reprocess_threshold,
            ) {
                DedupDecision::Skip => {
                    debug!(id = %candidate.id, "already processed; skipping");
                    report.skipped_duplicate += 1;
                    continue;
                }
                DedupDecision::New => MarkAction::Create,
                DedupDecision::Reprocess { previous } => {
                    debug!(
                        id = %candidate.id,
                        previous,
                        current = candidate.comment_count,
                        "comment growth crossed threshold; reprocessing"
                    );
                    MarkAction::Update
                }
            };

            if candidate.comment_count < self.settings.min_comments {
                debug!(id = %candidate.id, comments = candidate.comment_count, "below comment minimum");
                report.skipped_low_comments += 1;
                continue;
            }
            admitted.push(Admitted {
                order,
                candidate,
                action,
            });
        }
        admitted
    }

    async fn process(
        &self,
        admitted: Vec<Admitted>,
        deadline: Instant,
        report: &mut RunReport,
    ) -> Vec<Staged> {
        let permits = Arc::new(Semaphore::new(self.settings.summarize_concurrency.max(1)));
        let backoff_deadline = deadline
            .checked_sub(self.settings.flush_reserve)
            .map(Instant::into_std);
        let mut tasks = JoinSet::new();
        let mut in_flight: HashMap<usize, (String, String)> = HashMap::new();
        let total = admitted.len();

        for (spawned, item) in admitted.into_iter().enumerate() {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            if Instant::now() + self.settings.flush_reserve >= deadline {
                report.not_attempted = total - spawned;
                warn!(
                    not_attempted = report.not_attempted,
                    "run budget nearly spent; no further candidates admitted"
                );
                break;
            }

            in_flight.insert(
                item.order,
                (item.candidate.id.clone(), item.candidate.title.clone()),
            );
            let source = self.source.clone();
            let summarizer = self.summarizer.clone();
            let comment_limit = self.settings.comment_limit;
            tasks.spawn(async move {
                let _permit = permit;
                let Admitted {
                    order,
                    candidate,
                    action,
                } = item;
                let comments = match source.top_comments(&candidate.id, comment_limit).await {
                    Ok(comments) => comments,
                    Err(err) => {
                        return ItemOutcome::CommentsFailed {
                            order,
                            candidate,
                            reason: format!("comment fetch failed: {err}"),
                        }
                    }
                };
                let summary = summarizer
                    .summarize_until(&candidate.title, &candidate.body, &comments, backoff_deadline)
                    .await
                    .map_err(|e| e.to_string());
                ItemOutcome::Ready {
                    order,
                    candidate,
                    action,
                    comments,
                    summary,
                }
            });
        }

        let mut staged = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(error = %err, "candidate task did not complete");
                    continue;
                }
            };
            match outcome {
                ItemOutcome::CommentsFailed {
                    order,
                    candidate,
                    reason,
                } => {
                    in_flight.remove(&order);
                    warn!(id = %candidate.id, %reason, "candidate not staged");
                    report.record_failure(ItemFailure::new(candidate.id, &candidate.title, reason));
                }
                ItemOutcome::Ready {
                    order,
                    candidate,
                    action,
                    comments,
                    summary,
                } => {
                    in_flight.remove(&order);
                    let (summary, analysis) = match summary {
                        Ok(Summary { text, analysis }) => (Some(text), analysis),
                        Err(reason) => {
                            warn!(id = %candidate.id, %reason, "staging without summary");
                            report.summarization_failed += 1;
                            report.record_failure(ItemFailure::new(
                                candidate.id.clone(),
                                &candidate.title,
                                reason,
                            ));
                            (None, None)
                        }
                    };
                    let record = PostRecord::from_candidate(
                        &candidate,
                        comments,
                        summary,
                        self.settings.model_id.clone(),
                        Utc::now(),
                    )
                    .with_analysis(analysis);
                    staged.push(Staged {
                        order,
                        record,
                        action,
                    });
                }
            }
        }

        for (_, (id, title)) in in_flight {
            report.record_failure(ItemFailure::new(id, &title, "candidate task aborted"));
        }
        staged.sort_by_key(|s| s.order);
        staged
    }

    async fn mark_all(&self, staged: &[Staged], report: &mut RunReport) {
        for item in staged {
            let record = &item.record;
            let result = match item.action {
                MarkAction::Create => {
                    let marker = ProcessedMarker::first(
                        record.id.clone(),
                        record.comment_count,
                        record.ingested_at,
                    );
                    self.dedup.create_if_absent(&marker).await.map(|created| {
                        if created {
                            report.created += 1;
                        } else {
                            warn!(id = %record.id, "marker created concurrently by another run");
                            report.lost_races += 1;
                        }
                    })
                }
                MarkAction::Update => self
                    .dedup
                    .update(&record.id, record.comment_count, record.ingested_at)
                    .await
                    .map(|()| report.reprocessed += 1),
            };
            if let Err(err) = result {
                warn!(id = %record.id, error = %err, "marker write failed after commit");
                report.mark_failed += 1;
            }
        }
    }
}

fn secret_source(config: &PipelineConfig) -> Arc<dyn SecretSource> {
    match &config.secrets_dir {
        Some(dir) => Arc::new(FileSecretSource::new(dir.clone())),
        None => Arc::new(EnvSecretSource),
    }
}

async fn dedup_store(config: &PipelineConfig) -> Result<Arc<dyn DedupStore>, PipelineError> {
    match &config.dedup {
        DedupBackend::Postgres { database_url } => {
            let store = PgDedupStore::connect(database_url)
                .await
                .map_err(anyhow::Error::from)?;
            store.migrate().await.map_err(anyhow::Error::from)?;
            Ok(Arc::new(store))
        }
        DedupBackend::Memory => {
            warn!("using in-memory dedup markers; nothing persists past this process");
            Ok(Arc::new(MemoryDedupStore::new()))
        }
    }
}

/// Wires the production adapters from `config` and performs a single run.
pub async fn run_once(config: &PipelineConfig) -> Result<RunReport, PipelineError> {
    let credentials = Arc::new(CredentialProvider::new(
        secret_source(config),
        config.secret_name.clone(),
    ));
    credentials
        .credentials()
        .await
        .map_err(|e| PipelineError::Auth(e.to_string()))?;

    let forum_http = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout,
        concurrency: 2,
        token_bucket: Some(TokenBucketConfig {
            capacity: 10,
            refill_every: Duration::from_secs(1),
        }),
        ..HttpClientConfig::default()
    })?);
    let llm_http = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout.max(Duration::from_secs(60)),
        concurrency: config.summarize_concurrency,
        ..HttpClientConfig::default()
    })?);

    let source = Arc::new(RedditSource::new(forum_http, credentials));
    let model = Arc::new(OpenAiChatModel::new(
        llm_http,
        ChatModelConfig {
            structured: config.structured_analysis,
            ..ChatModelConfig::new(config.llm_api_base.clone(), config.llm_api_key.clone())
        },
    ));
    let summarizer = Summarizer::new(
        model,
        SummarizerConfig {
            char_budget: config.summary_input_char_budget,
            prompt_comment_limit: config.prompt_comment_limit,
            ..SummarizerConfig::new(config.model_id.clone())
        },
    );
    let dedup = dedup_store(config).await?;
    let store = Arc::new(FsObjectStore::new(config.object_store_root.clone()));
    let writer = RecordWriter::new(store, config.object_key_prefix.clone());

    Orchestrator::new(source, dedup, summarizer, writer, RunSettings::from(config))
        .run()
        .await
}

pub async fn run_once_from_env() -> Result<RunReport, PipelineError> {
    let config = PipelineConfig::from_env()?;
    run_once(&config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn marker(count: u32) -> ProcessedMarker {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap();
        ProcessedMarker::first("p1", count, at)
    }

    #[test]
    fn unmarked_posts_are_new() {
        assert_eq!(decide(0, None, 2), DedupDecision::New);
    }

    #[test]
    fn growth_below_threshold_is_skipped() {
        assert_eq!(decide(4, Some(&marker(3)), 2), DedupDecision::Skip);
        assert_eq!(decide(3, Some(&marker(3)), 2), DedupDecision::Skip);
    }

    #[test]
    fn growth_at_threshold_is_reprocessed() {
        assert_eq!(
            decide(5, Some(&marker(3)), 2),
            DedupDecision::Reprocess { previous: 3 }
        );
    }

    #[test]
    fn shrinking_counts_never_reprocess() {
        assert_eq!(decide(1, Some(&marker(9)), 1), DedupDecision::Skip);
    }

    #[test]
    fn settings_follow_config() {
        let config = RawConfig {
            model_id: Some("m".into()),
            object_store_root: Some("/tmp/out".into()),
            llm_api_base: Some("http://llm".into()),
            dedup_backend: Some("memory".into()),
            post_limit: Some(8),
            ..RawConfig::default()
        }
        .resolve()
        .unwrap();
        let settings = RunSettings::from(&config);
        assert_eq!(settings.windows.post_limit, 8);
        assert_eq!(settings.windows.new_post_check_limit, 50);
        assert_eq!(settings.reprocess_threshold, 2);
        assert_eq!(settings.model_id, "m");
    }
}
