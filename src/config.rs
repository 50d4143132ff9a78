use crate::error::{Result, StatementInsightError};
use crate::services::CallPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for the normalization pipeline and the external-call boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Labels treated as "unresolved" after stage-1 classification (compared case-insensitively).
    pub generic_labels: Vec<String>,
    /// Label written when neither classification stage produced one.
    pub fallback_label: String,
    /// A description must occur strictly more often than this to be reported as frequent.
    pub frequent_description_threshold: usize,
    pub call_timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub table_extraction_workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            generic_labels: vec![
                "uncategorized".to_string(),
                "uncategorised".to_string(),
                "other".to_string(),
                "others".to_string(),
                "misc".to_string(),
                "miscellaneous".to_string(),
                "unknown".to_string(),
                "general".to_string(),
            ],
            fallback_label: "uncategorized".to_string(),
            frequent_description_threshold: 3,
            call_timeout_secs: 120,
            max_attempts: 3,
            retry_backoff_ms: 500,
            table_extraction_workers: 8,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(StatementInsightError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.call_timeout_secs == 0 {
            return Err(StatementInsightError::Config(
                "call_timeout_secs must be positive".to_string(),
            ));
        }
        if self.table_extraction_workers == 0 {
            return Err(StatementInsightError::Config(
                "table_extraction_workers must be at least 1".to_string(),
            ));
        }
        if self.fallback_label.trim().is_empty() {
            return Err(StatementInsightError::Config(
                "fallback_label must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn call_policy(&self) -> CallPolicy {
        CallPolicy {
            timeout: Duration::from_secs(self.call_timeout_secs),
            max_attempts: self.max_attempts,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

#[cfg(feature = "remote")]
pub use remote::*;

#[cfg(feature = "remote")]
mod remote {
    use crate::error::{Result, StatementInsightError};

    pub const DEFAULT_EXTRACTION_MODEL: &str = "gemini-2.5-flash";
    pub const DEFAULT_SUMMARY_MODEL: &str = "gemini-2.0-flash";
    pub const DEFAULT_CLASSIFIER_MODEL: &str =
        "wanadzhar913/debertav3-finetuned-banking-transaction-classification-text-only";

    #[derive(Debug, Clone)]
    pub struct GeminiConfig {
        pub api_key: String,
        /// Model used for table extraction.
        pub extraction_model: String,
        /// Model used for user-information summaries and table inventories.
        pub summary_model: String,
        /// Model used for category repair and recommendations.
        pub reasoning_model: String,
    }

    impl GeminiConfig {
        pub fn from_env() -> Result<Self> {
            let api_key = std::env::var("GEMINI_API_KEY").map_err(|_| {
                StatementInsightError::Config("GEMINI_API_KEY must be set".to_string())
            })?;
            let model = |var: &str, default: &str| {
                std::env::var(var).unwrap_or_else(|_| default.to_string())
            };
            Ok(Self {
                api_key,
                extraction_model: model("GEMINI_EXTRACTION_MODEL", DEFAULT_EXTRACTION_MODEL),
                summary_model: model("GEMINI_SUMMARY_MODEL", DEFAULT_SUMMARY_MODEL),
                reasoning_model: model("GEMINI_REASONING_MODEL", DEFAULT_EXTRACTION_MODEL),
            })
        }
    }

    #[derive(Debug, Clone)]
    pub struct HuggingFaceConfig {
        pub api_token: String,
        pub model: String,
    }

    impl HuggingFaceConfig {
        pub fn from_env() -> Result<Self> {
            let api_token = std::env::var("HF_API_TOKEN").map_err(|_| {
                StatementInsightError::Config("HF_API_TOKEN must be set".to_string())
            })?;
            Ok(Self {
                api_token,
                model: std::env::var("HF_CLASSIFIER_MODEL")
                    .unwrap_or_else(|_| DEFAULT_CLASSIFIER_MODEL.to_string()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            PipelineConfig::from_json_str(r#"{"frequent_description_threshold": 5}"#).unwrap();
        assert_eq!(config.frequent_description_threshold, 5);
        assert_eq!(config.fallback_label, "uncategorized");
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let result = PipelineConfig::from_json_str(r#"{"max_attempts": 0}"#);
        assert!(matches!(result, Err(StatementInsightError::Config(_))));
    }

    #[test]
    fn test_call_policy_reflects_config() {
        let config = PipelineConfig {
            call_timeout_secs: 7,
            retry_backoff_ms: 20,
            ..PipelineConfig::default()
        };
        let policy = config.call_policy();
        assert_eq!(policy.timeout, Duration::from_secs(7));
        assert_eq!(policy.backoff, Duration::from_millis(20));
    }
}
