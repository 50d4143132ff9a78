use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Progress notifications emitted while a statement is being extracted.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionEvent {
    Uploading { filename: String },
    ReadingUserInformation,
    ListingTables,
    ExtractingTable { table_number: i64 },
    TableFailed { table_number: i64, reason: String },
    Finished { tables: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            parts: vec![Part::Text { text: text.into() }],
        }
    }

    /// The document part goes first so the instructions read as referring to it.
    pub fn user_with_document(text: impl Into<String>, document: &RemoteDocument) -> Self {
        Self {
            role: "user".to_string(),
            parts: vec![
                Part::FileData {
                    file_data: FileData {
                        mime_type: document.mime_type.clone(),
                        file_uri: document.uri.clone(),
                    },
                },
                Part::Text { text: text.into() },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    Text {
        text: String,
    },
    FileData {
        #[serde(rename = "fileData")]
        file_data: FileData,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub mime_type: String,
    pub file_uri: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    pub generation_config: GenerationConfig,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateContentResponse {
    pub candidates: Option<Vec<Candidate>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub content: Option<Content>,
    pub finish_reason: Option<String>,
}

/// A file uploaded to the Gemini file API, ready to be referenced in prompts.
#[derive(Debug, Clone)]
pub struct RemoteDocument {
    pub uri: String,
    pub name: String,
    pub display_name: String,
    pub mime_type: String,
    pub state: String,
}

/// One entry of the table inventory a model returns for a statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TableLocation {
    #[serde(default = "unknown_table_number")]
    pub table_number: i64,
    /// Short description of what sets this table apart from the others.
    #[serde(default)]
    pub blurb: String,
    /// First phrase or row of the table, used to locate it.
    #[serde(default)]
    pub start_phrase: String,
}

fn unknown_table_number() -> i64 {
    -1
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct JsonTable {
    pub table: serde_json::Value,
}
