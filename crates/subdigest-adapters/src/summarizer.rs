use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use subdigest_core::PostAnalysis;
use subdigest_storage::BackoffPolicy;
use thiserror::Error;
use tracing::{debug, warn};

use crate::analysis::{parse_analysis, summary_text};

/// Appended when input was cut to fit the character budget.
pub const TRUNCATION_MARKER: &str = "\n[truncated]";

/// Per-comment cap applied while building the model input.
pub const COMMENT_CHAR_CAP: usize = 1500;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("throttled: {0}")]
    Throttled(String),
    #[error("{0}")]
    Permanent(String),
}

/// External text-summarization capability.
#[async_trait]
pub trait SummaryModel: Send + Sync {
    async fn summarize(&self, model_id: &str, input: &str) -> Result<String, ModelError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SummarizationError {
    #[error("still throttled after {attempts} attempts: {last}")]
    ThrottlingExhausted { attempts: usize, last: String },
    #[error("summarization failed: {0}")]
    Permanent(String),
}

/// Model output for one thread. `analysis` is present when the reply held a
/// JSON analysis object; `text` is the reply itself otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub text: String,
    pub analysis: Option<PostAnalysis>,
}

impl Summary {
    pub fn from_reply(reply: &str) -> Self {
        match parse_analysis(reply) {
            Some(analysis) => Self {
                text: summary_text(&analysis),
                analysis: Some(analysis),
            },
            None => Self {
                text: reply.trim().to_string(),
                analysis: None,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    pub model_id: String,
    pub char_budget: usize,
    pub prompt_comment_limit: usize,
    pub max_attempts: usize,
    pub backoff: BackoffPolicy,
}

impl SummarizerConfig {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            char_budget: 12_000,
            prompt_comment_limit: 3,
            max_attempts: 3,
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: std::time::Duration::from_secs(1),
                max_delay: std::time::Duration::from_secs(8),
            },
        }
    }
}

fn cap_chars(text: &str, cap: usize) -> Cow<'_, str> {
    if text.chars().count() <= cap {
        Cow::Borrowed(text)
    } else {
        let mut out: String = text.chars().take(cap).collect();
        out.push_str("...");
        Cow::Owned(out)
    }
}

/// Title first so truncation from the end keeps it.
pub fn build_summary_input(title: &str, body: &str, comments: &[String], comment_limit: usize) -> String {
    let title = title.replace('{', "(").replace('}', ")");
    let body = body.replace('{', "(").replace('}', ")");

    let mut input = format!("Title: {title}\n\nBody:\n{body}\n\nTop comments:\n");
    let picked: Vec<&String> = comments.iter().take(comment_limit).collect();
    if picked.is_empty() {
        input.push_str("(none)\n");
    }
    for (idx, comment) in picked.into_iter().enumerate() {
        input.push_str(&format!(
            "Comment {}:\n{}\n---\n",
            idx + 1,
            cap_chars(comment, COMMENT_CHAR_CAP)
        ));
    }
    input
}

/// Cuts `text` from the end to at most `budget` characters, including the marker.
pub fn truncate_to_budget(text: &str, budget: usize) -> Cow<'_, str> {
    if text.chars().count() <= budget {
        return Cow::Borrowed(text);
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    if budget <= marker_len {
        return Cow::Owned(text.chars().take(budget).collect());
    }
    let mut out: String = text.chars().take(budget - marker_len).collect();
    out.push_str(TRUNCATION_MARKER);
    Cow::Owned(out)
}

/// Truncation plus bounded retry on throttling around a [`SummaryModel`].
#[derive(Clone)]
pub struct Summarizer {
    model: Arc<dyn SummaryModel>,
    config: SummarizerConfig,
}

impl Summarizer {
    pub fn new(model: Arc<dyn SummaryModel>, config: SummarizerConfig) -> Self {
        Self { model, config }
    }

    pub fn config(&self) -> &SummarizerConfig {
        &self.config
    }

    pub fn prepare_input(&self, title: &str, body: &str, comments: &[String]) -> String {
        let input = build_summary_input(title, body, comments, self.config.prompt_comment_limit);
        truncate_to_budget(&input, self.config.char_budget).into_owned()
    }

    pub async fn summarize(
        &self,
        title: &str,
        body: &str,
        comments: &[String],
    ) -> Result<Summary, SummarizationError> {
        self.summarize_until(title, body, comments, None).await
    }

    /// As [`Summarizer::summarize`], but a throttling backoff that would end
    /// after `deadline` is not slept; the item fails as exhausted instead.
    pub async fn summarize_until(
        &self,
        title: &str,
        body: &str,
        comments: &[String],
        deadline: Option<Instant>,
    ) -> Result<Summary, SummarizationError> {
        let input = self.prepare_input(title, body, comments);
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 0usize;

        loop {
            match self.model.summarize(&self.config.model_id, &input).await {
                Ok(reply) => return Ok(Summary::from_reply(&reply)),
                Err(ModelError::Permanent(reason)) => {
                    return Err(SummarizationError::Permanent(reason));
                }
                Err(ModelError::Throttled(reason)) => {
                    attempt += 1;
                    let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
                    let delay = if attempt < attempts {
                        self.config.backoff.delay_within(attempt - 1, None, remaining)
                    } else {
                        None
                    };
                    let Some(delay) = delay else {
                        warn!(attempt, reason = %reason, "summarization throttling exhausted");
                        return Err(SummarizationError::ThrottlingExhausted {
                            attempts: attempt,
                            last: reason,
                        });
                    };
                    debug!(attempt, ?delay, "summarization throttled; backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
