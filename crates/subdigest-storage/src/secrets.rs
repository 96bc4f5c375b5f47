//! Forum API credential resolution.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::info;

pub const DEFAULT_USER_AGENT: &str = "subdigest/0.1";

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret {0:?} not found")]
    NotFound(String),
    #[error("reading secret {name:?}: {source}")]
    Read {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("secret {name:?} is not a valid credential bundle: {reason}")]
    Invalid { name: String, reason: String },
}

/// Read-only lookup of a named secret string.
#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn fetch(&self, name: &str) -> Result<String, SecretError>;
}

/// Reads `SUBDIGEST_SECRET_<NAME>` where `<NAME>` is the upper-cased secret name.
#[derive(Debug, Clone, Default)]
pub struct EnvSecretSource;

impl EnvSecretSource {
    pub fn var_name(name: &str) -> String {
        let suffix = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect::<String>();
        format!("SUBDIGEST_SECRET_{suffix}")
    }
}

#[async_trait]
impl SecretSource for EnvSecretSource {
    async fn fetch(&self, name: &str) -> Result<String, SecretError> {
        std::env::var(Self::var_name(name)).map_err(|_| SecretError::NotFound(name.to_string()))
    }
}

/// Reads `<dir>/<name>.json`.
#[derive(Debug, Clone)]
pub struct FileSecretSource {
    dir: PathBuf,
}

impl FileSecretSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SecretSource for FileSecretSource {
    async fn fetch(&self, name: &str) -> Result<String, SecretError> {
        let path = self.dir.join(format!("{name}.json"));
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(SecretError::NotFound(name.to_string()))
            }
            Err(source) => Err(SecretError::Read {
                name: name.to_string(),
                source,
            }),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ForumCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub user_agent: String,
}

impl fmt::Debug for ForumCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForumCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct CredentialBundle {
    #[serde(rename = "REDDIT_CLIENT_ID", alias = "client_id")]
    client_id: Option<String>,
    #[serde(rename = "REDDIT_CLIENT_SECRET", alias = "client_secret")]
    client_secret: Option<String>,
    #[serde(rename = "REDDIT_USER_AGENT", alias = "user_agent")]
    user_agent: Option<String>,
}

impl ForumCredentials {
    pub fn parse(name: &str, raw: &str) -> Result<Self, SecretError> {
        let invalid = |reason: String| SecretError::Invalid {
            name: name.to_string(),
            reason,
        };
        let bundle: CredentialBundle =
            serde_json::from_str(raw).map_err(|e| invalid(e.to_string()))?;
        let non_empty = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

        let client_id = non_empty(bundle.client_id)
            .ok_or_else(|| invalid("missing REDDIT_CLIENT_ID".to_string()))?;
        let client_secret = non_empty(bundle.client_secret)
            .ok_or_else(|| invalid("missing REDDIT_CLIENT_SECRET".to_string()))?;
        let user_agent =
            non_empty(bundle.user_agent).unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());

        Ok(Self {
            client_id,
            client_secret,
            user_agent,
        })
    }
}

/// Resolves forum credentials once and caches them for the life of the run.
pub struct CredentialProvider {
    source: Arc<dyn SecretSource>,
    secret_name: String,
    cached: OnceCell<ForumCredentials>,
}

impl CredentialProvider {
    pub fn new(source: Arc<dyn SecretSource>, secret_name: impl Into<String>) -> Self {
        Self {
            source,
            secret_name: secret_name.into(),
            cached: OnceCell::new(),
        }
    }

    pub async fn credentials(&self) -> Result<&ForumCredentials, SecretError> {
        self.cached
            .get_or_try_init(|| async {
                let raw = self.source.fetch(&self.secret_name).await?;
                let creds = ForumCredentials::parse(&self.secret_name, &raw)?;
                info!(secret = %self.secret_name, client_id = %creds.client_id, "forum credentials resolved");
                Ok::<_, SecretError>(creds)
            })
            .await
    }
}
