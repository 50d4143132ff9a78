//! Scripted service doubles shared by the unit tests.

use crate::error::{Result, StatementInsightError};
use crate::services::{ExtractedTable, LanguageModel, StatementExtractor, TransactionClassifier};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

enum ClassifierMode {
    Labels(Vec<Option<String>>),
    Uniform(String),
    Failing,
}

pub(crate) struct FixedClassifier {
    mode: ClassifierMode,
    calls: AtomicUsize,
}

impl FixedClassifier {
    /// Always answers with exactly these labels, whatever the input length.
    pub(crate) fn new(labels: Vec<Option<&str>>) -> Self {
        Self::with_mode(ClassifierMode::Labels(
            labels.into_iter().map(|l| l.map(str::to_string)).collect(),
        ))
    }

    pub(crate) fn uniform(label: &str) -> Self {
        Self::with_mode(ClassifierMode::Uniform(label.to_string()))
    }

    pub(crate) fn failing() -> Self {
        Self::with_mode(ClassifierMode::Failing)
    }

    fn with_mode(mode: ClassifierMode) -> Self {
        Self {
            mode,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionClassifier for FixedClassifier {
    fn model_name(&self) -> &str {
        "fixed-classifier"
    }

    async fn classify(&self, descriptions: &[String]) -> Result<Vec<Option<String>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            ClassifierMode::Labels(labels) => Ok(labels.clone()),
            ClassifierMode::Uniform(label) => Ok(vec![Some(label.clone()); descriptions.len()]),
            ClassifierMode::Failing => Err(StatementInsightError::external(
                "fixed-classifier",
                "model is cold",
            )),
        }
    }
}

/// Replays canned responses in order and records every prompt it receives.
pub(crate) struct ScriptedModel {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub(crate) fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(str::to_string).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted-model"
    }

    async fn invoke(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| StatementInsightError::external("scripted-model", "script exhausted"))
    }
}

#[derive(Default)]
pub(crate) struct StaticExtractor {
    documents: HashMap<PathBuf, Vec<ExtractedTable>>,
}

impl StaticExtractor {
    pub(crate) fn with_document(mut self, path: &str, tables: Vec<ExtractedTable>) -> Self {
        self.documents.insert(PathBuf::from(path), tables);
        self
    }
}

#[async_trait]
impl StatementExtractor for StaticExtractor {
    async fn extract(&self, document: &Path) -> Result<Vec<ExtractedTable>> {
        Ok(self.documents.get(document).cloned().unwrap_or_default())
    }
}

pub(crate) fn extracted(
    table: serde_json::Value,
    blurb: &str,
    user_information: serde_json::Value,
) -> ExtractedTable {
    ExtractedTable {
        table,
        blurb: blurb.to_string(),
        table_number: 0,
        user_information: user_information.as_object().cloned().unwrap_or_default(),
    }
}
