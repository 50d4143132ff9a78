//! Contracts for the collaborators the core talks to, and the timeout/retry
//! boundary every call to them goes through.

use crate::error::{Result, StatementInsightError};
use async_trait::async_trait;
use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::time::Duration;

/// Opaque text-in/text-out language model.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn invoke(&self, prompt: &str) -> Result<String>;
}

/// Opaque batch text classifier. Must answer with one label per input, in order;
/// `None` means the classifier had no opinion for that row.
#[async_trait]
pub trait TransactionClassifier: Send + Sync {
    fn model_name(&self) -> &str;

    async fn classify(&self, descriptions: &[String]) -> Result<Vec<Option<String>>>;
}

/// One candidate table as returned by the extraction collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedTable {
    /// Raw grid; re-validated by the core before use.
    pub table: serde_json::Value,
    #[serde(default)]
    pub blurb: String,
    #[serde(default = "unknown_table_number")]
    pub table_number: i64,
    #[serde(default)]
    pub user_information: serde_json::Map<String, serde_json::Value>,
}

fn unknown_table_number() -> i64 {
    -1
}

/// PDF → candidate tables. May return zero tables.
#[async_trait]
pub trait StatementExtractor: Send + Sync {
    async fn extract(&self, document: &Path) -> Result<Vec<ExtractedTable>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Runs `operation` under the policy's timeout, retrying retryable failures
/// with exponential backoff. Non-retryable errors are returned immediately.
pub async fn call_with_policy<T, F, Fut>(
    service: &str,
    policy: &CallPolicy,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    let mut delay = policy.backoff;

    loop {
        let outcome = match tokio::time::timeout(policy.timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(StatementInsightError::Timeout {
                service: service.to_string(),
                waited: policy.timeout,
            }),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                warn!(
                    "{} call failed (attempt {}/{}): {}; retrying in {:?}",
                    service, attempt, policy.max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Returns the text between `<tag>` and `</tag>`, if both delimiters are present.
pub fn extract_delimited<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    Some(text[start..end].trim())
}

/// Extracts a delimiter-wrapped JSON payload; a missing delimiter or bad JSON
/// is an external-service failure of that call.
pub fn parse_delimited_json<T: DeserializeOwned>(service: &str, text: &str, tag: &str) -> Result<T> {
    let payload = extract_delimited(text, tag).ok_or_else(|| {
        StatementInsightError::external(service, format!("response is missing <{}> delimiters", tag))
    })?;
    let payload = strip_code_fence(payload);
    serde_json::from_str(payload).map_err(|e| {
        StatementInsightError::external(service, format!("malformed JSON inside <{}>: {}", tag, e))
    })
}

fn strip_code_fence(payload: &str) -> &str {
    let trimmed = payload.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
