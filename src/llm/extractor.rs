use crate::error::Result;
use crate::llm::client::GeminiClient;
use crate::llm::prompts::*;
use crate::llm::types::*;
use crate::schema::DEFAULT_TITLE;
use crate::services::{
    call_with_policy, parse_delimited_json, CallPolicy, ExtractedTable, StatementExtractor,
};
use crate::validator::is_valid_table;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use serde_json::{Map, Value};
use std::path::Path;
use tokio::sync::mpsc::Sender;

/// Reads statements through Gemini: one upload, a user-information summary
/// and a table inventory in parallel, then one extraction call per table.
pub struct GeminiStatementExtractor {
    client: GeminiClient,
    extraction_model: String,
    summary_model: String,
    policy: CallPolicy,
    workers: usize,
    progress: Option<Sender<ExtractionEvent>>,
}

impl GeminiStatementExtractor {
    pub fn new(
        client: GeminiClient,
        extraction_model: impl Into<String>,
        summary_model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            extraction_model: extraction_model.into(),
            summary_model: summary_model.into(),
            policy: CallPolicy::default(),
            workers: 8,
            progress: None,
        }
    }

    pub fn with_policy(mut self, policy: CallPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_progress(mut self, progress: Sender<ExtractionEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    async fn send_event(&self, event: ExtractionEvent) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(event).await;
        }
    }

    async fn ask(&self, model: &str, document: &RemoteDocument, prompt: String) -> Result<String> {
        let client = &self.client;
        let prompt = prompt.as_str();
        call_with_policy(model, &self.policy, move || async move {
            client
                .generate_content(
                    model,
                    Some(SYSTEM_PROMPT_STATEMENT_READER),
                    vec![Content::user_with_document(prompt, document)],
                )
                .await
        })
        .await
    }

    /// Degrades to an empty object; a statement without holder details is
    /// still worth extracting because its account number may match later.
    async fn user_information(&self, document: &RemoteDocument) -> Map<String, Value> {
        self.send_event(ExtractionEvent::ReadingUserInformation).await;
        let result = self
            .ask(&self.summary_model, document, user_information_prompt())
            .await
            .and_then(|text| {
                parse_delimited_json::<Map<String, Value>>(
                    &self.summary_model,
                    &text,
                    USER_INFORMATION_TAG,
                )
            });
        match result {
            Ok(info) => info,
            Err(e) => {
                warn!("Could not read user information from {}: {}", document.display_name, e);
                Map::new()
            }
        }
    }

    async fn table_inventory(&self, document: &RemoteDocument) -> Vec<TableLocation> {
        self.send_event(ExtractionEvent::ListingTables).await;
        let result = self
            .ask(&self.summary_model, document, table_inventory_prompt())
            .await
            .and_then(|text| {
                parse_delimited_json::<Vec<TableLocation>>(&self.summary_model, &text, TABLES_TAG)
            });
        match result {
            Ok(tables) => tables,
            Err(e) => {
                warn!("Could not list tables in {}: {}", document.display_name, e);
                Vec::new()
            }
        }
    }

    async fn extract_table(
        &self,
        document: &RemoteDocument,
        location: Option<&TableLocation>,
    ) -> Result<Value> {
        let text = self
            .ask(&self.extraction_model, document, table_extraction_prompt(location))
            .await?;
        let parsed: JsonTable = parse_delimited_json(&self.extraction_model, &text, JSON_TABLE_TAG)?;
        Ok(parsed.table)
    }
}

#[async_trait]
impl StatementExtractor for GeminiStatementExtractor {
    async fn extract(&self, document: &Path) -> Result<Vec<ExtractedTable>> {
        let filename = document.display().to_string();
        self.send_event(ExtractionEvent::Uploading {
            filename: filename.clone(),
        })
        .await;
        let remote = self.client.upload_document(document).await?;

        let (user_information, inventory) =
            tokio::join!(self.user_information(&remote), self.table_inventory(&remote));

        let locations: Vec<Option<TableLocation>> = if inventory.is_empty() {
            info!("No table inventory for {}; reading it as one table", filename);
            vec![None]
        } else {
            inventory.into_iter().map(Some).collect()
        };

        let filename = filename.as_str();
        let remote = &remote;
        let user_information = &user_information;
        let mut tables: Vec<ExtractedTable> = stream::iter(locations)
            .map(|location| async move {
                let table_number = location.as_ref().map_or(-1, |l| l.table_number);
                let blurb = location
                    .as_ref()
                    .map_or_else(|| DEFAULT_TITLE.to_string(), |l| l.blurb.clone());
                self.send_event(ExtractionEvent::ExtractingTable { table_number })
                    .await;

                match self.extract_table(remote, location.as_ref()).await {
                    Ok(table) if is_valid_table(&table) => Some(ExtractedTable {
                        table,
                        blurb,
                        table_number,
                        user_information: user_information.clone(),
                    }),
                    Ok(_) => {
                        warn!("Table #{} of {} is not a valid grid", table_number, filename);
                        self.send_event(ExtractionEvent::TableFailed {
                            table_number,
                            reason: "invalid grid".to_string(),
                        })
                        .await;
                        None
                    }
                    Err(e) => {
                        warn!("Table #{} of {} failed: {}", table_number, filename, e);
                        self.send_event(ExtractionEvent::TableFailed {
                            table_number,
                            reason: e.to_string(),
                        })
                        .await;
                        None
                    }
                }
            })
            .buffer_unordered(self.workers)
            .filter_map(|table| async move { table })
            .collect()
            .await;

        tables.sort_by_key(|t| t.table_number);
        debug!("{}: extracted {} tables", filename, tables.len());
        self.send_event(ExtractionEvent::Finished {
            tables: tables.len(),
        })
        .await;
        Ok(tables)
    }
}
