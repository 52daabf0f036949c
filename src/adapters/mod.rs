//! Email analysis domain types and backend adapters.
//!
//! The middleware itself is generic; these are the concrete request and
//! result types the daemon serves, plus the HTTP backend that analyzes a
//! whole batch of emails in one completion call.

pub mod openai;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::optimizer::Fingerprint;

// ── Core Types ──────────────────────────────────────────────────────

/// One inbound email to analyze.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailAnalysisRequest {
    /// Caller's identifier. Not part of the fingerprint: the same email
    /// delivered twice is the same work.
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub subject: String,
    pub body: String,
}

impl Fingerprint for EmailAnalysisRequest {
    fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        // NUL separators keep ("ab", "c") and ("a", "bc") apart
        hasher.update(self.sender.trim().to_lowercase().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.subject.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.body.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn content(&self) -> String {
        format!("{}\n{}", self.subject, self.body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

/// Backend verdict for a single email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailAnalysis {
    pub urgency: Urgency,
    /// 0.0 (ignorable) to 1.0 (drop everything).
    pub urgency_score: f64,
    pub sentiment: Sentiment,
    #[serde(default)]
    pub tasks: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email(subject: &str, body: &str) -> EmailAnalysisRequest {
        EmailAnalysisRequest {
            message_id: Some("m-1".into()),
            sender: "Alice@Example.com".into(),
            subject: subject.into(),
            body: body.into(),
        }
    }

    #[test]
    fn test_fingerprint_ignores_message_id_and_sender_case() {
        let a = email("Invoice", "Please pay by Friday");
        let mut b = a.clone();
        b.message_id = Some("m-2".into());
        b.sender = "alice@example.com ".into();
        assert_eq!(a.cache_key(), b.cache_key());
        assert_eq!(a.cache_key().len(), 64);
    }

    #[test]
    fn test_fingerprint_separates_fields() {
        let a = email("ab", "c");
        let b = email("a", "bc");
        assert_ne!(a.cache_key(), b.cache_key());
        assert_eq!(a.content(), "ab\nc");
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let req: EmailAnalysisRequest = serde_json::from_str(r#"{"body":"hi"}"#).unwrap();
        assert_eq!(req.subject, "");
        assert!(req.message_id.is_none());
    }

    #[test]
    fn test_analysis_wire_format() {
        let analysis: EmailAnalysis = serde_json::from_str(
            r#"{"urgency":"high","urgency_score":0.8,"sentiment":"negative","tasks":["reply"]}"#,
        )
        .unwrap();
        assert_eq!(analysis.urgency, Urgency::High);
        assert_eq!(analysis.sentiment, Sentiment::Negative);
        assert_eq!(analysis.summary, "");
    }
}
