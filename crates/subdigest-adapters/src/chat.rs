//! OpenAI-compatible chat-completions adapter for [`SummaryModel`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use subdigest_storage::{BackoffPolicy, FetchError, HttpFetcher};

use crate::summarizer::{ModelError, SummaryModel};

pub const SUMMARY_SYSTEM_PROMPT: &str = "\
You summarize Reddit threads for people learning the technology being discussed.
In at most five sentences of plain text: state the core problem or question from
the original post, then the main solutions or advice offered in the comments.
If the comments offer no solution, say so. Do not add any preamble.";

pub const ANALYSIS_SYSTEM_PROMPT: &str = r#"You analyze Reddit threads for people learning the technology being discussed.
Reply with one JSON object and nothing else, using exactly these keys:
"problem_summary": one or two sentences naming the core problem or question.
"problem_explanation": an object with "primary_concepts", a list of objects with string
values "name", "definition", "use_case" and "how_it_functions" for the key technologies
behind the problem, and "explanation", a string tying them back to the problem.
"solution_summary": the main solutions or advice from the comments, or a note that none were offered.
"solution_explanation": a short plain-language string explaining those solutions.
"suggested_categories": a list of at most 3 strings naming relevant services or topics."#;

#[derive(Debug, Clone)]
pub struct ChatModelConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
    /// Ask for the JSON analysis object instead of a prose summary.
    pub structured: bool,
}

impl ChatModelConfig {
    pub fn new(api_base: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            api_base: api_base.into(),
            api_key,
            max_tokens: 800,
            temperature: 0.2,
            top_p: 0.9,
            structured: true,
        }
    }

    fn system_prompt(&self) -> &'static str {
        if self.structured {
            ANALYSIS_SYSTEM_PROMPT
        } else {
            SUMMARY_SYSTEM_PROMPT
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    top_p: f64,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

impl<'a> ChatRequest<'a> {
    fn new(config: &ChatModelConfig, model: &'a str, input: &'a str) -> Self {
        Self {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: config.system_prompt(),
                },
                ChatMessage {
                    role: "user",
                    content: input,
                },
            ],
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
            response_format: config.structured.then_some(ResponseFormat {
                kind: "json_object",
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiChatModel {
    http: Arc<HttpFetcher>,
    config: ChatModelConfig,
}

impl OpenAiChatModel {
    pub fn new(http: Arc<HttpFetcher>, config: ChatModelConfig) -> Self {
        Self { http, config }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.api_base.trim_end_matches('/'))
    }
}

fn classify(err: FetchError) -> ModelError {
    if err.is_throttled() {
        ModelError::Throttled(err.to_string())
    } else {
        ModelError::Permanent(err.to_string())
    }
}

/// First non-blank choice content.
fn extract_summary(body: &[u8]) -> Result<String, ModelError> {
    let parsed: ChatResponse = serde_json::from_slice(body)
        .map_err(|e| ModelError::Permanent(format!("unparseable completion: {e}")))?;
    parsed
        .choices
        .into_iter()
        .filter_map(|c| c.message.content)
        .find(|c| !c.trim().is_empty())
        .ok_or_else(|| ModelError::Permanent("completion contained no text".to_string()))
}

#[async_trait]
impl SummaryModel for OpenAiChatModel {
    async fn summarize(&self, model_id: &str, input: &str) -> Result<String, ModelError> {
        let request = ChatRequest::new(&self.config, model_id, input);
        let url = self.endpoint();

        // Throttling retries belong to the Summarizer; a single attempt here.
        let response = self
            .http
            .send_with_backoff("chat_completion", BackoffPolicy::immediate(0), |client| {
                let mut builder = client.post(&url).json(&request);
                if let Some(key) = &self.config.api_key {
                    builder = builder.bearer_auth(key);
                }
                builder
            })
            .await
            .map_err(classify)?;

        extract_summary(&response.body)
    }
}
