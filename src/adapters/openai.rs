//! OpenAI-compatible batch backend.
//!
//! A whole batch of emails goes out as one chat completion. The model is
//! asked for a JSON array with one object per email, tagged with the
//! email's index so the answer can be put back in submission order.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{EmailAnalysis, EmailAnalysisRequest};
use crate::batch::BatchExecutor;
use crate::config::BackendConfig;
use crate::error::BatchError;

/// Body characters sent per email.
const MAX_BODY_CHARS: usize = 4000;

const SYSTEM_PROMPT: &str = "You triage email. For each numbered email, return one JSON object with: \
\"index\" (the email's number), \"urgency\" (low|medium|high|critical), \"urgency_score\" (0.0 to 1.0), \
\"sentiment\" (positive|neutral|negative), \"tasks\" (array of short action items, may be empty), \
\"summary\" (one sentence). Respond with a JSON array only, one object per email, in order.";

pub struct OpenAiBatchBackend {
    client: reqwest::Client,
    config: BackendConfig,
    api_key: String,
}

impl OpenAiBatchBackend {
    /// Build from config, reading the key from `config.api_key_env`.
    pub fn new(config: BackendConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .with_context(|| format!("Environment variable {} is not set", config.api_key_env))?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: BackendConfig, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            config,
            api_key: api_key.into(),
        })
    }

    async fn complete(&self, emails: &[EmailAnalysisRequest]) -> Result<Vec<EmailAnalysis>> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let start = std::time::Instant::now();

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": &self.config.model,
                "messages": [
                    {"role": "system", "content": SYSTEM_PROMPT},
                    {"role": "user", "content": build_prompt(emails)},
                ],
                "max_tokens": self.config.max_tokens,
                "temperature": 0.0,
            }))
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;

        let status = resp.status().as_u16();
        if status != 200 {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Analysis backend failed ({}): {}", status, truncate(&body, 500));
        }

        let body: serde_json::Value = resp.json().await.context("Backend returned non-JSON body")?;
        let text = body["choices"][0]["message"]["content"].as_str().unwrap_or("");
        debug!(
            batch_size = emails.len(),
            latency_ms = start.elapsed().as_millis() as u64,
            input_tokens = body["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens = body["usage"]["completion_tokens"].as_u64().unwrap_or(0),
            "Batch analysis completed"
        );

        Ok(parse_batch_response(text, emails.len())?)
    }
}

#[async_trait]
impl BatchExecutor<EmailAnalysisRequest, EmailAnalysis> for OpenAiBatchBackend {
    async fn execute(&self, payloads: Vec<EmailAnalysisRequest>) -> Result<Vec<EmailAnalysis>, BatchError> {
        self.complete(&payloads).await.map_err(|e| match e.downcast::<BatchError>() {
            Ok(batch_err) => batch_err,
            Err(other) => BatchError::executor(format!("{:#}", other)),
        })
    }
}

fn build_prompt(emails: &[EmailAnalysisRequest]) -> String {
    let mut prompt = String::new();
    for (i, email) in emails.iter().enumerate() {
        prompt.push_str(&format!(
            "### Email {}\nFrom: {}\nSubject: {}\n\n{}\n\n",
            i,
            email.sender,
            email.subject,
            truncate(&email.body, MAX_BODY_CHARS)
        ));
    }
    prompt
}

#[derive(Deserialize)]
struct IndexedAnalysis {
    #[serde(default)]
    index: Option<usize>,
    #[serde(flatten)]
    analysis: EmailAnalysis,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BatchReply {
    List(Vec<IndexedAnalysis>),
    Wrapped { results: Vec<IndexedAnalysis> },
}

/// Parse the model's reply into exactly `expected` analyses in submission
/// order. Accepts a bare array or `{"results": [...]}`, optionally inside a
/// markdown code fence.
pub fn parse_batch_response(text: &str, expected: usize) -> Result<Vec<EmailAnalysis>, BatchError> {
    let json_str = strip_code_fence(text);
    let reply: BatchReply = serde_json::from_str(json_str)
        .map_err(|e| BatchError::executor(format!("malformed backend reply: {}", e)))?;
    let mut items = match reply {
        BatchReply::List(items) | BatchReply::Wrapped { results: items } => items,
    };

    if items.len() != expected {
        return Err(BatchError::LengthMismatch {
            expected,
            actual: items.len(),
        });
    }

    // Reorder by index when the model tagged every item
    if items.iter().all(|item| item.index.is_some()) {
        items.sort_by_key(|item| item.index);
        let in_order = items.iter().enumerate().all(|(i, item)| item.index == Some(i));
        if !in_order {
            return Err(BatchError::executor("backend reply has duplicate or out-of-range indices"));
        }
    }

    Ok(items
        .into_iter()
        .map(|item| {
            let mut analysis = item.analysis;
            analysis.urgency_score = analysis.urgency_score.clamp(0.0, 1.0);
            analysis
        })
        .collect())
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|inner| inner.strip_suffix("```").unwrap_or(inner))
        .unwrap_or(trimmed)
        .trim()
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{Sentiment, Urgency};

    const TWO_ITEMS: &str = r#"[
        {"index": 0, "urgency": "high", "urgency_score": 0.9, "sentiment": "negative", "tasks": ["call back"], "summary": "Angry client"},
        {"index": 1, "urgency": "low", "urgency_score": 0.1, "sentiment": "positive", "tasks": [], "summary": "Thanks note"}
    ]"#;

    #[test]
    fn test_parse_plain_array() {
        let parsed = parse_batch_response(TWO_ITEMS, 2).unwrap();
        assert_eq!(parsed[0].urgency, Urgency::High);
        assert_eq!(parsed[0].tasks, vec!["call back".to_string()]);
        assert_eq!(parsed[1].sentiment, Sentiment::Positive);
    }

    #[test]
    fn test_parse_fenced_and_wrapped() {
        let fenced = format!("```json\n{}\n```", TWO_ITEMS);
        assert_eq!(parse_batch_response(&fenced, 2).unwrap().len(), 2);

        let wrapped = format!("{{\"results\": {}}}", TWO_ITEMS);
        assert_eq!(parse_batch_response(&wrapped, 2).unwrap().len(), 2);
    }

    #[test]
    fn test_parse_restores_submission_order() {
        let reversed = r#"[
            {"index": 1, "urgency": "low", "urgency_score": 0.2, "sentiment": "neutral"},
            {"index": 0, "urgency": "critical", "urgency_score": 1.0, "sentiment": "negative"}
        ]"#;
        let parsed = parse_batch_response(reversed, 2).unwrap();
        assert_eq!(parsed[0].urgency, Urgency::Critical);
        assert_eq!(parsed[1].urgency, Urgency::Low);
    }

    #[test]
    fn test_parse_rejects_length_mismatch() {
        assert_eq!(
            parse_batch_response(TWO_ITEMS, 3).unwrap_err(),
            BatchError::LengthMismatch { expected: 3, actual: 2 }
        );
    }

    #[test]
    fn test_parse_rejects_bad_indices_and_garbage() {
        let dup = r#"[
            {"index": 0, "urgency": "low", "urgency_score": 0.2, "sentiment": "neutral"},
            {"index": 0, "urgency": "low", "urgency_score": 0.2, "sentiment": "neutral"}
        ]"#;
        assert!(matches!(parse_batch_response(dup, 2), Err(BatchError::Executor(_))));
        assert!(matches!(
            parse_batch_response("I could not analyze these emails.", 1),
            Err(BatchError::Executor(_))
        ));
    }

    #[test]
    fn test_scores_clamped() {
        let raw = r#"[{"urgency": "high", "urgency_score": 7.5, "sentiment": "neutral"}]"#;
        assert_eq!(parse_batch_response(raw, 1).unwrap()[0].urgency_score, 1.0);
    }

    #[test]
    fn test_prompt_numbers_emails_and_truncates_bodies() {
        let emails = vec![
            EmailAnalysisRequest {
                message_id: None,
                sender: "a@x.io".into(),
                subject: "First".into(),
                body: "é".repeat(MAX_BODY_CHARS + 10),
            },
            EmailAnalysisRequest {
                message_id: None,
                sender: "b@x.io".into(),
                subject: "Second".into(),
                body: "short".into(),
            },
        ];
        let prompt = build_prompt(&emails);
        assert!(prompt.contains("### Email 0\nFrom: a@x.io\nSubject: First"));
        assert!(prompt.contains("### Email 1\nFrom: b@x.io\nSubject: Second"));
        assert!(!prompt.contains(&"é".repeat(MAX_BODY_CHARS + 1)));
    }

    #[test]
    fn test_missing_api_key_env_is_an_error() {
        let config = BackendConfig {
            api_key_env: "MAILWISE_TEST_KEY_THAT_IS_NEVER_SET".into(),
            ..Default::default()
        };
        assert!(OpenAiBatchBackend::new(config).is_err());
    }
}
