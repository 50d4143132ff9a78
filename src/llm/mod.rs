pub mod classifier;
pub mod client;
pub mod extractor;
pub mod prompts;
pub mod types;

pub use classifier::*;
pub use client::*;
pub use extractor::*;
pub use types::*;

use crate::config::{GeminiConfig, HuggingFaceConfig, PipelineConfig};
use crate::error::Result;
use crate::ingestion::Services;
use std::sync::Arc;

/// Wires the hosted collaborators from environment configuration.
pub fn services_from_env(config: &PipelineConfig) -> Result<Services> {
    let gemini = GeminiConfig::from_env()?;
    let hugging_face = HuggingFaceConfig::from_env()?;
    let client = GeminiClient::new(gemini.api_key.clone());

    Ok(Services {
        extractor: Arc::new(GeminiStatementExtractor::new(
            client.clone(),
            gemini.extraction_model,
            gemini.summary_model,
        )
        .with_policy(config.call_policy())
        .with_workers(config.table_extraction_workers)),
        classifier: Arc::new(HuggingFaceClassifier::new(hugging_face)),
        language_model: Arc::new(client.model(gemini.reasoning_model)),
    })
}
