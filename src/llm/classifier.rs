use crate::config::HuggingFaceConfig;
use crate::error::{Result, StatementInsightError};
use crate::services::TransactionClassifier;
use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

const SERVICE: &str = "huggingface";
const HF_INFERENCE_URL: &str = "https://api-inference.huggingface.co/models";

/// Text-classification model served by the Hugging Face inference API.
#[derive(Clone)]
pub struct HuggingFaceClassifier {
    client: Client,
    api_token: String,
    model: String,
    base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LabelScore {
    label: String,
    score: f64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ClassificationResponse {
    /// One ranked list of labels per input.
    Batched(Vec<Vec<LabelScore>>),
    /// One top label per input.
    Flat(Vec<LabelScore>),
}

impl HuggingFaceClassifier {
    pub fn new(config: HuggingFaceConfig) -> Self {
        Self {
            client: Client::new(),
            api_token: config.api_token,
            model: config.model,
            base_url: HF_INFERENCE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl TransactionClassifier for HuggingFaceClassifier {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn classify(&self, descriptions: &[String]) -> Result<Vec<Option<String>>> {
        if descriptions.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/{}", self.base_url, self.model);
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&json!({ "inputs": descriptions }))
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let err_text = res.text().await?;
            return Err(StatementInsightError::external(
                SERVICE,
                format!("{} returned status {}: {}", self.model, status, err_text),
            ));
        }

        let body: ClassificationResponse = res.json().await?;
        let labels = top_labels(body);
        debug!("{} labelled {} descriptions", self.model, labels.len());
        Ok(labels)
    }
}

fn top_labels(response: ClassificationResponse) -> Vec<Option<String>> {
    match response {
        ClassificationResponse::Batched(rows) => rows
            .into_iter()
            .map(|ranked| {
                ranked
                    .into_iter()
                    .max_by(|a, b| a.score.total_cmp(&b.score))
                    .map(|best| best.label)
            })
            .collect(),
        ClassificationResponse::Flat(rows) => rows.into_iter().map(|row| Some(row.label)).collect(),
    }
}
