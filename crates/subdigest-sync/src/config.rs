//! Run parameters, resolved once at startup.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("reading config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupBackend {
    Postgres { database_url: String },
    /// Process-local markers; only meaningful for tests and dry runs.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub subreddit_name: String,
    pub post_limit: usize,
    pub comment_limit: usize,
    pub new_post_check_limit: usize,
    pub reprocess_comment_threshold: u32,
    pub min_comments_to_process: u32,
    pub prompt_comment_limit: usize,
    pub model_id: String,
    pub run_timeout: Duration,
    pub flush_reserve: Duration,
    pub summarize_concurrency: usize,
    pub summary_input_char_budget: usize,
    /// Request the JSON thread analysis rather than a prose summary.
    pub structured_analysis: bool,
    pub object_store_root: PathBuf,
    pub object_key_prefix: String,
    pub dedup: DedupBackend,
    pub secret_name: String,
    pub secrets_dir: Option<PathBuf>,
    pub llm_api_base: String,
    pub llm_api_key: Option<String>,
    pub http_timeout: Duration,
}

/// Unvalidated settings as read from a YAML file or the environment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    pub subreddit_name: Option<String>,
    pub post_limit: Option<usize>,
    pub comment_limit: Option<usize>,
    pub new_post_check_limit: Option<usize>,
    pub reprocess_comment_threshold: Option<u32>,
    pub min_comments_to_process: Option<u32>,
    pub prompt_comment_limit: Option<usize>,
    pub model_id: Option<String>,
    pub run_timeout_secs: Option<u64>,
    pub flush_reserve_secs: Option<u64>,
    pub summarize_concurrency: Option<usize>,
    pub summary_input_char_budget: Option<usize>,
    pub structured_analysis: Option<bool>,
    pub object_store_root: Option<PathBuf>,
    pub object_key_prefix: Option<String>,
    pub dedup_backend: Option<String>,
    pub database_url: Option<String>,
    pub secret_name: Option<String>,
    pub secrets_dir: Option<PathBuf>,
    pub llm_api_base: Option<String>,
    pub llm_api_key: Option<String>,
    pub http_timeout_secs: Option<u64>,
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
    }
}

impl RawConfig {
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            subreddit_name: parse_var(&lookup, "SUBREDDIT_NAME")?,
            post_limit: parse_var(&lookup, "POST_LIMIT")?,
            comment_limit: parse_var(&lookup, "COMMENT_LIMIT")?,
            new_post_check_limit: parse_var(&lookup, "NEW_POST_CHECK_LIMIT")?,
            reprocess_comment_threshold: parse_var(&lookup, "REPROCESS_COMMENT_THRESHOLD")?,
            min_comments_to_process: parse_var(&lookup, "MIN_COMMENTS_TO_PROCESS")?,
            prompt_comment_limit: parse_var(&lookup, "PROMPT_COMMENT_LIMIT")?,
            model_id: parse_var(&lookup, "MODEL_ID")?,
            run_timeout_secs: parse_var(&lookup, "RUN_TIMEOUT_SECS")?,
            flush_reserve_secs: parse_var(&lookup, "FLUSH_RESERVE_SECS")?,
            summarize_concurrency: parse_var(&lookup, "SUMMARIZE_CONCURRENCY")?,
            summary_input_char_budget: parse_var(&lookup, "SUMMARY_INPUT_CHAR_BUDGET")?,
            structured_analysis: parse_var(&lookup, "STRUCTURED_ANALYSIS")?,
            object_store_root: parse_var(&lookup, "OBJECT_STORE_ROOT")?,
            object_key_prefix: parse_var(&lookup, "OBJECT_KEY_PREFIX")?,
            dedup_backend: parse_var(&lookup, "DEDUP_BACKEND")?,
            database_url: parse_var(&lookup, "DATABASE_URL")?,
            secret_name: parse_var(&lookup, "SECRET_NAME")?,
            secrets_dir: parse_var(&lookup, "SECRETS_DIR")?,
            llm_api_base: parse_var(&lookup, "LLM_API_BASE")?,
            llm_api_key: parse_var(&lookup, "LLM_API_KEY")?,
            http_timeout_secs: parse_var(&lookup, "HTTP_TIMEOUT_SECS")?,
        })
    }

    /// Values set in `other` win.
    pub fn overlay(self, other: RawConfig) -> RawConfig {
        macro_rules! pick {
            ($($field:ident),* $(,)?) => {
                RawConfig { $($field: other.$field.or(self.$field)),* }
            };
        }
        pick!(
            subreddit_name,
            post_limit,
            comment_limit,
            new_post_check_limit,
            reprocess_comment_threshold,
            min_comments_to_process,
            prompt_comment_limit,
            model_id,
            run_timeout_secs,
            flush_reserve_secs,
            summarize_concurrency,
            summary_input_char_budget,
            structured_analysis,
            object_store_root,
            object_key_prefix,
            dedup_backend,
            database_url,
            secret_name,
            secrets_dir,
            llm_api_base,
            llm_api_key,
            http_timeout_secs,
        )
    }

    pub fn resolve(self) -> Result<PipelineConfig, ConfigError> {
        let positive = |key: &'static str, value: usize| {
            if value == 0 {
                Err(ConfigError::Invalid {
                    key,
                    value: value.to_string(),
                    reason: "must be positive".to_string(),
                })
            } else {
                Ok(value)
            }
        };
        let required = |key: &'static str, value: Option<String>| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::Missing(key))
        };

        let post_limit = positive("POST_LIMIT", self.post_limit.unwrap_or(5))?;
        let new_post_check_limit =
            positive("NEW_POST_CHECK_LIMIT", self.new_post_check_limit.unwrap_or(50))?;
        let reprocess_comment_threshold = positive(
            "REPROCESS_COMMENT_THRESHOLD",
            self.reprocess_comment_threshold.unwrap_or(2) as usize,
        )? as u32;
        let summarize_concurrency = self.summarize_concurrency.unwrap_or(4);
        if !(1..=8).contains(&summarize_concurrency) {
            return Err(ConfigError::Invalid {
                key: "SUMMARIZE_CONCURRENCY",
                value: summarize_concurrency.to_string(),
                reason: "must be between 1 and 8".to_string(),
            });
        }
        let summary_input_char_budget = self.summary_input_char_budget.unwrap_or(12_000);
        if summary_input_char_budget < 200 {
            return Err(ConfigError::Invalid {
                key: "SUMMARY_INPUT_CHAR_BUDGET",
                value: summary_input_char_budget.to_string(),
                reason: "must be at least 200".to_string(),
            });
        }
        let run_timeout = Duration::from_secs(self.run_timeout_secs.unwrap_or(300));
        let flush_reserve = Duration::from_secs(self.flush_reserve_secs.unwrap_or(30));
        if run_timeout <= flush_reserve {
            return Err(ConfigError::Invalid {
                key: "RUN_TIMEOUT_SECS",
                value: run_timeout.as_secs().to_string(),
                reason: format!("must exceed the {}s flush reserve", flush_reserve.as_secs()),
            });
        }

        let dedup = match self.dedup_backend.as_deref().unwrap_or("postgres") {
            "postgres" => DedupBackend::Postgres {
                database_url: required("DATABASE_URL", self.database_url)?,
            },
            "memory" => DedupBackend::Memory,
            other => {
                return Err(ConfigError::Invalid {
                    key: "DEDUP_BACKEND",
                    value: other.to_string(),
                    reason: "expected postgres or memory".to_string(),
                })
            }
        };

        let config = PipelineConfig {
            subreddit_name: required("SUBREDDIT_NAME", self.subreddit_name.or(Some("aws".into())))?,
            post_limit,
            comment_limit: self.comment_limit.unwrap_or(10),
            new_post_check_limit,
            reprocess_comment_threshold,
            min_comments_to_process: self.min_comments_to_process.unwrap_or(0),
            prompt_comment_limit: self.prompt_comment_limit.unwrap_or(3),
            model_id: required("MODEL_ID", self.model_id)?,
            run_timeout,
            flush_reserve,
            summarize_concurrency,
            summary_input_char_budget,
            structured_analysis: self.structured_analysis.unwrap_or(true),
            object_store_root: self
                .object_store_root
                .ok_or(ConfigError::Missing("OBJECT_STORE_ROOT"))?,
            object_key_prefix: self
                .object_key_prefix
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| "reddit-analysis".to_string()),
            dedup,
            secret_name: self.secret_name.unwrap_or_else(|| "reddit_api".to_string()),
            secrets_dir: self.secrets_dir,
            llm_api_base: required("LLM_API_BASE", self.llm_api_base)?,
            llm_api_key: self.llm_api_key,
            http_timeout: Duration::from_secs(self.http_timeout_secs.unwrap_or(20)),
        };

        if config.new_post_check_limit < config.post_limit && config.min_comments_to_process > 0 {
            warn!(
                new_post_check_limit = config.new_post_check_limit,
                post_limit = config.post_limit,
                min_comments = config.min_comments_to_process,
                "check window is smaller than the post window; eligible posts may run short"
            );
        }
        Ok(config)
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        RawConfig::from_lookup(|key| std::env::var(key).ok())?.resolve()
    }

    /// YAML file values, with any environment variable taking precedence.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let file: RawConfig = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        let env = RawConfig::from_lookup(|key| std::env::var(key).ok())?;
        file.overlay(env).resolve()
    }
}
