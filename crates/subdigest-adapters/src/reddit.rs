//! Reddit OAuth (application-only) adapter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::USER_AGENT;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use subdigest_core::{CandidateWindow, PostCandidate, DELETED_AUTHOR};
use subdigest_storage::{CredentialProvider, FetchError, ForumCredentials, HttpFetcher};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{ForumSource, ListingPage, SourceError};

#[derive(Debug, Clone)]
pub struct RedditEndpoints {
    pub token_url: String,
    pub api_base: String,
    pub web_base: String,
}

impl Default for RedditEndpoints {
    fn default() -> Self {
        Self {
            token_url: "https://www.reddit.com/api/v1/access_token".to_string(),
            api_base: "https://oauth.reddit.com".to_string(),
            web_base: "https://www.reddit.com".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expiry")]
    expires_in: u64,
}

fn default_expiry() -> u64 {
    3600
}

/// Tokens are refreshed this long before the provider says they expire.
const TOKEN_SLACK: Duration = Duration::from_secs(60);

pub struct RedditSource {
    http: Arc<HttpFetcher>,
    credentials: Arc<CredentialProvider>,
    endpoints: RedditEndpoints,
    token: Mutex<Option<AccessToken>>,
}

impl RedditSource {
    pub fn new(http: Arc<HttpFetcher>, credentials: Arc<CredentialProvider>) -> Self {
        Self::with_endpoints(http, credentials, RedditEndpoints::default())
    }

    pub fn with_endpoints(
        http: Arc<HttpFetcher>,
        credentials: Arc<CredentialProvider>,
        endpoints: RedditEndpoints,
    ) -> Self {
        Self {
            http,
            credentials,
            endpoints,
            token: Mutex::new(None),
        }
    }

    async fn creds(&self) -> Result<&ForumCredentials, SourceError> {
        self.credentials
            .credentials()
            .await
            .map_err(|e| SourceError::Auth(e.to_string()))
    }

    async fn access_token(&self) -> Result<String, SourceError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let creds = self.creds().await?;
        let response = self
            .http
            .send("reddit_token", |client| {
                client
                    .post(&self.endpoints.token_url)
                    .header(USER_AGENT, &creds.user_agent)
                    .basic_auth(&creds.client_id, Some(&creds.client_secret))
                    .form(&[("grant_type", "client_credentials")])
            })
            .await
            .map_err(|e| map_fetch_error("token", e))?;
        let parsed: TokenResponse = response
            .json()
            .map_err(|e| SourceError::Auth(format!("token response: {e}")))?;

        let lifetime = Duration::from_secs(parsed.expires_in).saturating_sub(TOKEN_SLACK);
        info!(expires_in = parsed.expires_in, "reddit access token acquired");
        *guard = Some(AccessToken {
            value: parsed.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(parsed.access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    /// Authenticated GET; one token refresh is attempted on a 401.
    async fn get_json(&self, label: &str, path_and_query: &str) -> Result<JsonValue, SourceError> {
        let url = format!("{}{}", self.endpoints.api_base, path_and_query);
        let user_agent = self.creds().await?.user_agent.clone();

        for refreshed in [false, true] {
            let token = self.access_token().await?;
            let result = self
                .http
                .send(label, |client| {
                    client
                        .get(&url)
                        .header(USER_AGENT, &user_agent)
                        .bearer_auth(&token)
                })
                .await;
            match result {
                Ok(response) => {
                    return response
                        .json()
                        .map_err(|e| SourceError::Decode(format!("{label}: {e}")));
                }
                Err(err) if err.status() == Some(401) && !refreshed => {
                    debug!(label, "access token rejected; refreshing");
                    self.invalidate_token().await;
                }
                Err(err) => return Err(map_fetch_error(label, err)),
            }
        }
        Err(SourceError::Auth(format!("{label}: token rejected after refresh")))
    }
}

fn map_fetch_error(label: &str, err: FetchError) -> SourceError {
    if err.is_auth_failure() {
        SourceError::Auth(format!("{label}: {err}"))
    } else {
        SourceError::Fetch(format!("{label}: {err}"))
    }
}

#[async_trait]
impl ForumSource for RedditSource {
    async fn list_new(
        &self,
        subreddit: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<ListingPage, SourceError> {
        let mut path = format!("/r/{subreddit}/new?limit={limit}&raw_json=1");
        if let Some(after) = after {
            path.push_str("&after=");
            path.push_str(after);
        }
        let value = self.get_json("reddit_listing", &path).await?;
        parse_listing(&self.endpoints.web_base, subreddit, &value)
    }

    async fn top_comments(&self, post_id: &str, limit: usize) -> Result<Vec<String>, SourceError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let path = format!("/comments/{post_id}?sort=top&limit={limit}&depth=1&raw_json=1");
        let value = self.get_json("reddit_comments", &path).await?;
        parse_comments(&value, limit)
    }
}

#[derive(Debug, Deserialize)]
struct Listing<T> {
    data: ListingData<T>,
}

#[derive(Debug, Deserialize)]
struct ListingData<T> {
    #[serde(default)]
    after: Option<String>,
    #[serde(default = "Vec::new")]
    children: Vec<Thing<T>>,
}

#[derive(Debug, Deserialize)]
struct Thing<T> {
    kind: String,
    data: T,
}

#[derive(Debug, Deserialize)]
struct RawPost {
    id: String,
    #[serde(default)]
    subreddit: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    selftext: String,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    permalink: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    created_utc: f64,
    #[serde(default)]
    num_comments: u32,
}

pub fn parse_listing(
    web_base: &str,
    subreddit: &str,
    value: &JsonValue,
) -> Result<ListingPage, SourceError> {
    let listing: Listing<JsonValue> = serde_json::from_value(value.clone())
        .map_err(|e| SourceError::Decode(format!("listing: {e}")))?;

    let mut posts = Vec::with_capacity(listing.data.children.len());
    for thing in listing.data.children {
        if thing.kind != "t3" {
            continue;
        }
        let raw: RawPost = serde_json::from_value(thing.data)
            .map_err(|e| SourceError::Decode(format!("post: {e}")))?;
        let created_at = DateTime::<Utc>::from_timestamp(raw.created_utc as i64, 0)
            .ok_or_else(|| SourceError::Decode(format!("post {}: bad created_utc", raw.id)))?;
        let url = match (raw.permalink, raw.url) {
            (Some(permalink), _) => format!("{web_base}{permalink}"),
            (None, Some(url)) => url,
            (None, None) => format!("{web_base}/comments/{}", raw.id),
        };
        let author = raw
            .author
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| DELETED_AUTHOR.to_string());

        posts.push(PostCandidate {
            id: raw.id,
            subreddit: raw.subreddit.unwrap_or_else(|| subreddit.to_string()),
            title: raw.title,
            body: raw.selftext,
            author,
            url,
            score: raw.score,
            created_at,
            comment_count: raw.num_comments,
            window: CandidateWindow::Recent,
        });
    }

    Ok(ListingPage {
        posts,
        after: listing.data.after.filter(|a| !a.is_empty()),
    })
}

#[derive(Debug, Deserialize)]
struct RawComment {
    #[serde(default)]
    body: Option<String>,
}

fn usable_comment(body: &str) -> bool {
    !body.is_empty() && body != "[deleted]" && body != "[removed]"
}

/// Comment endpoint returns `[post_listing, comment_listing]`.
pub fn parse_comments(value: &JsonValue, limit: usize) -> Result<Vec<String>, SourceError> {
    let comment_listing = value
        .as_array()
        .and_then(|parts| parts.get(1))
        .ok_or_else(|| SourceError::Decode("comments: expected two listings".to_string()))?;
    let listing: Listing<JsonValue> = serde_json::from_value(comment_listing.clone())
        .map_err(|e| SourceError::Decode(format!("comments: {e}")))?;

    Ok(listing
        .data
        .children
        .into_iter()
        .filter(|thing| thing.kind == "t1")
        .filter_map(|thing| serde_json::from_value::<RawComment>(thing.data).ok())
        .filter_map(|c| c.body.map(|b| b.trim().to_string()))
        .filter(|body| usable_comment(body))
        .take(limit)
        .collect())
}
