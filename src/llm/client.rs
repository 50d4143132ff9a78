use crate::error::{Result, StatementInsightError};
use crate::llm::types::*;
use crate::services::LanguageModel;
use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tokio::time::sleep;

const SERVICE: &str = "gemini";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const GEMINI_UPLOAD_URL: &str = "https://generativelanguage.googleapis.com/upload/v1beta/files";
const MAX_PROCESSING_POLLS: usize = 60;
const PROCESSING_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: GEMINI_BASE_URL.to_string(),
        }
    }

    /// A [`LanguageModel`] handle bound to one model id.
    pub fn model(&self, model: impl Into<String>) -> GeminiModel {
        GeminiModel {
            client: self.clone(),
            model: model.into(),
        }
    }

    /// Uploads a statement with the resumable upload protocol and waits until
    /// the file API reports it as `ACTIVE`.
    pub async fn upload_document(&self, path: &Path) -> Result<RemoteDocument> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StatementInsightError::external(SERVICE, "invalid file name"))?;

        let file_size = fs::metadata(path).await?.len();
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .to_string();
        let file_bytes = fs::read(path).await?;

        let start_url = format!("{}?key={}", GEMINI_UPLOAD_URL, self.api_key);
        let metadata = json!({ "file": { "display_name": file_name } });

        let init_res = self
            .client
            .post(&start_url)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", file_size.to_string())
            .header("X-Goog-Upload-Header-Content-Type", &mime_type)
            .header("Content-Type", "application/json")
            .json(&metadata)
            .send()
            .await?;

        let init_status = init_res.status();
        if !init_status.is_success() {
            let error_text = init_res.text().await?;
            return Err(StatementInsightError::external(
                SERVICE,
                format!("upload init failed (status {}): {}", init_status, error_text),
            ));
        }

        let upload_url = init_res
            .headers()
            .get("x-goog-upload-url")
            .ok_or_else(|| StatementInsightError::external(SERVICE, "no upload URL in headers"))?
            .to_str()
            .map_err(|e| StatementInsightError::external(SERVICE, e.to_string()))?
            .to_string();

        let upload_res = self
            .client
            .post(&upload_url)
            .header("Content-Length", file_size.to_string())
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(file_bytes)
            .send()
            .await?;

        let upload_status = upload_res.status();
        if !upload_status.is_success() {
            let error_text = upload_res.text().await?;
            return Err(StatementInsightError::external(
                SERVICE,
                format!("file upload failed (status {}): {}", upload_status, error_text),
            ));
        }

        let upload_body: serde_json::Value = upload_res.json().await?;
        let file_obj = upload_body
            .get("file")
            .ok_or_else(|| StatementInsightError::external(SERVICE, "upload response missing 'file'"))?;

        let field = |key: &str| {
            file_obj
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    StatementInsightError::external(SERVICE, format!("upload response missing {}", key))
                })
        };
        let uri = field("uri")?;
        let name = field("name")?;

        let mut state = file_obj
            .get("state")
            .and_then(|v| v.as_str())
            .unwrap_or("PROCESSING")
            .to_string();

        let mut polls = 0;
        while state != "ACTIVE" {
            if polls >= MAX_PROCESSING_POLLS {
                return Err(StatementInsightError::Timeout {
                    service: SERVICE.to_string(),
                    waited: PROCESSING_POLL_INTERVAL * MAX_PROCESSING_POLLS as u32,
                });
            }
            polls += 1;

            let check_url = format!("{}/{}?key={}", self.base_url, name, self.api_key);
            let check_res = self.client.get(&check_url).send().await?;
            let check_json: serde_json::Value = check_res.json().await?;
            let file_obj = check_json.get("file").unwrap_or(&check_json);
            state = file_obj
                .get("state")
                .and_then(|v| v.as_str())
                .unwrap_or("PROCESSING")
                .to_string();

            match state.as_str() {
                "ACTIVE" => break,
                "FAILED" => {
                    return Err(StatementInsightError::external(
                        SERVICE,
                        format!("Google failed to process {}", file_name),
                    ))
                }
                _ => sleep(PROCESSING_POLL_INTERVAL).await,
            }
        }

        debug!("Uploaded {} as {}", file_name, name);

        Ok(RemoteDocument {
            uri,
            name,
            display_name: file_name.to_string(),
            mime_type,
            state,
        })
    }

    /// Single `generateContent` call; returns the concatenated text parts of
    /// the first candidate.
    pub async fn generate_content(
        &self,
        model: &str,
        system_prompt: Option<&str>,
        contents: Vec<Content>,
    ) -> Result<String> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        );

        let payload = GenerateContentRequest {
            contents,
            system_instruction: system_prompt.map(Content::user_text),
            generation_config: GenerationConfig {
                temperature: Some(0.0),
                ..GenerationConfig::default()
            },
        };

        let res = self.client.post(&url).json(&payload).send().await?;
        let status = res.status();

        if !status.is_success() {
            let err_text = res.text().await?;
            return Err(StatementInsightError::external(
                SERVICE,
                format!("{} returned status {}: {}", model, status, err_text),
            ));
        }

        let body: GenerateContentResponse = res.json().await?;
        let candidate = body
            .candidates
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| StatementInsightError::external(SERVICE, "no candidates returned"))?;

        let text: String = candidate
            .content
            .map(|content| content.parts)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|part| match part {
                Part::Text { text } => Some(text),
                Part::FileData { .. } => None,
            })
            .collect();

        if text.trim().is_empty() {
            return Err(StatementInsightError::external(
                SERVICE,
                format!(
                    "{} returned no text (finish reason {:?})",
                    model, candidate.finish_reason
                ),
            ));
        }
        Ok(text)
    }
}

/// Text-in/text-out handle on one Gemini model.
#[derive(Clone)]
pub struct GeminiModel {
    client: GeminiClient,
    model: String,
}

#[async_trait]
impl LanguageModel for GeminiModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn invoke(&self, prompt: &str) -> Result<String> {
        self.client
            .generate_content(&self.model, None, vec![Content::user_text(prompt)])
            .await
    }
}
