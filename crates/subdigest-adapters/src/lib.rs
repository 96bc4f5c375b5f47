//! Forum source and summarization adapter contracts, plus the candidate feed
//! that turns paginated listings into a finite sequence of posts.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use subdigest_core::{CandidateWindow, PostCandidate};
use thiserror::Error;
use tracing::{debug, warn};

mod analysis;
mod chat;
mod reddit;
mod summarizer;

pub use analysis::{parse_analysis, summary_text, MISSING_FIELD};
pub use chat::{ChatModelConfig, OpenAiChatModel, ANALYSIS_SYSTEM_PROMPT, SUMMARY_SYSTEM_PROMPT};
pub use reddit::{parse_comments, parse_listing, RedditEndpoints, RedditSource};
pub use summarizer::{
    build_summary_input, truncate_to_budget, ModelError, SummarizationError, Summarizer,
    SummarizerConfig, Summary, SummaryModel, COMMENT_CHAR_CAP, TRUNCATION_MARKER,
};

pub const CRATE_NAME: &str = "subdigest-adapters";

/// Largest page the listing endpoint serves.
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("forum authentication failed: {0}")]
    Auth(String),
    #[error("forum fetch failed: {0}")]
    Fetch(String),
    #[error("forum response could not be decoded: {0}")]
    Decode(String),
}

impl SourceError {
    pub fn is_auth(&self) -> bool {
        matches!(self, SourceError::Auth(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingPage {
    pub posts: Vec<PostCandidate>,
    /// Cursor for the next page; `None` when the listing is exhausted.
    pub after: Option<String>,
}

#[async_trait]
pub trait ForumSource: Send + Sync {
    /// Newest-first listing for `subreddit`, starting after `after`.
    async fn list_new(
        &self,
        subreddit: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<ListingPage, SourceError>;

    /// Top-sorted, non-empty comment bodies for a post, at most `limit`.
    async fn top_comments(&self, post_id: &str, limit: usize) -> Result<Vec<String>, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedWindows {
    pub post_limit: usize,
    pub new_post_check_limit: usize,
}

#[derive(Debug, Default)]
struct FeedState {
    pass: usize,
    walked_in_pass: usize,
    after: Option<String>,
    listing_done: bool,
    buffer: VecDeque<PostCandidate>,
    seen: HashSet<String>,
    fetch_errors: Vec<String>,
}

/// Lazy, finite, restartable sequence of post candidates.
///
/// Pass one walks the newest `post_limit` posts; pass two walks the newest
/// `new_post_check_limit` posts so already-processed posts can be checked for
/// comment growth. An identifier is yielded at most once; the first pass wins.
/// A fetch failure ends only the pass it happened in.
pub struct CandidateFeed {
    source: Arc<dyn ForumSource>,
    subreddit: String,
    windows: FeedWindows,
    state: FeedState,
}

impl CandidateFeed {
    pub fn new(source: Arc<dyn ForumSource>, subreddit: impl Into<String>, windows: FeedWindows) -> Self {
        Self {
            source,
            subreddit: subreddit.into(),
            windows,
            state: FeedState::default(),
        }
    }

    fn passes(&self) -> [(CandidateWindow, usize); 2] {
        [
            (CandidateWindow::Recent, self.windows.post_limit),
            (CandidateWindow::Recheck, self.windows.new_post_check_limit),
        ]
    }

    pub fn restart(&mut self) {
        self.state = FeedState::default();
    }

    pub fn fetch_errors(&self) -> &[String] {
        &self.state.fetch_errors
    }

    fn advance_pass(&mut self) {
        self.state.pass += 1;
        self.state.walked_in_pass = 0;
        self.state.after = None;
        self.state.listing_done = false;
        self.state.buffer.clear();
    }

    /// Next unseen candidate, `Ok(None)` once both passes are done.
    /// Only authentication failures are returned as errors.
    pub async fn next(&mut self) -> Result<Option<PostCandidate>, SourceError> {
        loop {
            let passes = self.passes();
            let Some(&(window, limit)) = passes.get(self.state.pass) else {
                return Ok(None);
            };

            if let Some(mut candidate) = self.state.buffer.pop_front() {
                self.state.walked_in_pass += 1;
                if self.state.seen.insert(candidate.id.clone()) {
                    candidate.window = window;
                    return Ok(Some(candidate));
                }
                continue;
            }

            let remaining = limit.saturating_sub(self.state.walked_in_pass);
            if remaining == 0 || self.state.listing_done {
                self.advance_pass();
                continue;
            }

            let page_size = remaining.min(MAX_PAGE_SIZE);
            match self
                .source
                .list_new(&self.subreddit, self.state.after.as_deref(), page_size)
                .await
            {
                Ok(page) => {
                    debug!(
                        subreddit = %self.subreddit,
                        ?window,
                        posts = page.posts.len(),
                        "listing page fetched"
                    );
                    self.state.listing_done = page.after.is_none() || page.posts.is_empty();
                    self.state.after = page.after;
                    self.state
                        .buffer
                        .extend(page.posts.into_iter().take(remaining));
                }
                Err(err) if err.is_auth() => return Err(err),
                Err(err) => {
                    warn!(subreddit = %self.subreddit, ?window, error = %err, "ending fetch pass early");
                    self.state
                        .fetch_errors
                        .push(format!("{window:?} window: {err}"));
                    self.advance_pass();
                }
            }
        }
    }

    pub async fn collect_all(&mut self) -> Result<Vec<PostCandidate>, SourceError> {
        let mut out = Vec::new();
        while let Some(candidate) = self.next().await? {
            out.push(candidate);
        }
        Ok(out)
    }
}
