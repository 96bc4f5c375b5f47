//! Core domain model for subdigest: candidates, committed records, dedup markers and run reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "subdigest-core";

/// Author handle recorded when the forum no longer exposes one.
pub const DELETED_AUTHOR: &str = "[deleted]";

/// Which fetch pass produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateWindow {
    /// The most recent `post_limit` posts.
    Recent,
    /// The wider `new_post_check_limit` window used to detect comment growth.
    Recheck,
}

/// Raw post as seen on the forum at fetch time. Comments are fetched later,
/// only for candidates that pass the dedup check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostCandidate {
    pub id: String,
    pub subreddit: String,
    pub title: String,
    pub body: String,
    pub author: String,
    pub url: String,
    pub score: i64,
    pub created_at: DateTime<Utc>,
    pub comment_count: u32,
    pub window: CandidateWindow,
}

/// A technology the analysis explains for readers new to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptNote {
    pub name: String,
    pub definition: String,
    pub use_case: String,
    pub how_it_functions: String,
}

/// Structured reading of a thread: the problem, the concepts behind it, the
/// answers offered and up to three topic categories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostAnalysis {
    pub problem_summary: String,
    pub problem_explanation: String,
    pub primary_concepts: Vec<ConceptNote>,
    pub solution_summary: String,
    pub solution_explanation: String,
    pub suggested_categories: Vec<String>,
}

/// Immutable record committed to the object store. One per (identifier, run).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRecord {
    pub id: String,
    pub subreddit: String,
    pub title: String,
    pub body: String,
    pub author: String,
    pub url: String,
    pub score: i64,
    pub created_at: DateTime<Utc>,
    pub comment_count: u32,
    pub comments: Vec<String>,
    pub summary: Option<String>,
    pub analysis: Option<PostAnalysis>,
    pub model_id: String,
    pub ingested_at: DateTime<Utc>,
}

impl PostRecord {
    pub fn from_candidate(
        candidate: &PostCandidate,
        comments: Vec<String>,
        summary: Option<String>,
        model_id: impl Into<String>,
        ingested_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: candidate.id.clone(),
            subreddit: candidate.subreddit.clone(),
            title: candidate.title.clone(),
            body: candidate.body.clone(),
            author: candidate.author.clone(),
            url: candidate.url.clone(),
            score: candidate.score,
            created_at: candidate.created_at,
            comment_count: candidate.comment_count,
            comments,
            summary,
            analysis: None,
            model_id: model_id.into(),
            ingested_at,
        }
    }

    pub fn with_analysis(mut self, analysis: Option<PostAnalysis>) -> Self {
        self.analysis = analysis;
        self
    }
}

/// Persisted proof that an identifier has been committed at least once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedMarker {
    pub id: String,
    pub first_processed_at: DateTime<Utc>,
    pub last_processed_at: DateTime<Utc>,
    pub comment_count: u32,
}

impl ProcessedMarker {
    pub fn first(id: impl Into<String>, comment_count: u32, at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            first_processed_at: at,
            last_processed_at: at,
            comment_count,
        }
    }
}

/// A per-item failure that did not abort the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub id: String,
    pub title: String,
    pub reason: String,
}

impl ItemFailure {
    pub fn new(id: impl Into<String>, title: &str, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.chars().take(50).collect(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Partial,
}

/// Counters for a single invocation. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub subreddit: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Recent posts plus already-marked posts from the recheck window.
    pub fetched: usize,
    /// Unmarked posts seen only in the recheck window. They are neither work
    /// for this run nor counted as fetched.
    pub outside_window: usize,
    pub skipped_duplicate: usize,
    pub skipped_low_comments: usize,
    /// Candidates whose marker lookup failed; skipped rather than risk a reprocessing loop.
    pub indeterminate: usize,
    pub created: usize,
    pub reprocessed: usize,
    pub summarization_failed: usize,
    pub written: usize,
    /// Candidates left untouched because the run budget ran out.
    pub not_attempted: usize,
    /// Rows written whose marker was created by a concurrent run first.
    pub lost_races: usize,
    pub mark_failed: usize,
    pub fetch_errors: Vec<String>,
    pub partitions: Vec<String>,
    pub failures: Vec<ItemFailure>,
}

impl RunReport {
    pub fn new(run_id: Uuid, subreddit: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            subreddit: subreddit.into(),
            started_at,
            finished_at: started_at,
            fetched: 0,
            outside_window: 0,
            skipped_duplicate: 0,
            skipped_low_comments: 0,
            indeterminate: 0,
            created: 0,
            reprocessed: 0,
            summarization_failed: 0,
            written: 0,
            not_attempted: 0,
            lost_races: 0,
            mark_failed: 0,
            fetch_errors: Vec::new(),
            partitions: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn record_failure(&mut self, failure: ItemFailure) {
        self.failures.push(failure);
    }

    pub fn status(&self) -> RunStatus {
        if self.failures.is_empty() && self.fetch_errors.is_empty() && self.mark_failed == 0 {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        }
    }
}
