//! Two-stage transaction categorization.
//!
//! Stage 1 runs a cheap batch classifier over every description. Rows it
//! leaves empty or labels with a generic bucket ("other", "uncategorized")
//! are escalated to a language model in a single batch-repair call whose
//! answer must echo the request row for row.

use crate::config::PipelineConfig;
use crate::error::{Result, StatementInsightError};
use crate::ledger::TransformationStep;
use crate::prompts::{category_repair_prompt, CATEGORIZED_ROWS_TAG};
use crate::services::{
    call_with_policy, parse_delimited_json, CallPolicy, LanguageModel, TransactionClassifier,
};
use async_trait::async_trait;
use log::{debug, info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

/// One row as seen by the resolver. `fields` carries the rest of the source
/// row so the repair model has context beyond the description.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryRecord {
    pub index: usize,
    pub description: String,
    pub category: Option<String>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl CategoryRecord {
    pub fn new(index: usize, description: impl Into<String>) -> Self {
        Self {
            index,
            description: description.into(),
            category: None,
            fields: serde_json::Map::new(),
        }
    }
}

/// One row of the repair model's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RepairedCategory {
    /// Copied unchanged from the request row.
    pub index: usize,
    /// Copied unchanged from the request row.
    pub description: String,
    /// Lowercase category label.
    pub category: String,
}

/// What a strict resolution did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionReport {
    pub classified: usize,
    pub repaired: usize,
}

pub struct CategoryResolver {
    classifier: Arc<dyn TransactionClassifier>,
    model: Arc<dyn LanguageModel>,
    generic_labels: HashSet<String>,
    fallback_label: String,
    policy: CallPolicy,
}

impl CategoryResolver {
    pub fn new(
        classifier: Arc<dyn TransactionClassifier>,
        model: Arc<dyn LanguageModel>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            classifier,
            model,
            generic_labels: config
                .generic_labels
                .iter()
                .map(|l| l.trim().to_lowercase())
                .collect(),
            fallback_label: config.fallback_label.clone(),
            policy: config.call_policy(),
        }
    }

    pub fn fallback_label(&self) -> &str {
        &self.fallback_label
    }

    /// Empty, missing and generic labels all count as unresolved.
    pub fn is_unresolved(&self, label: Option<&str>) -> bool {
        match label.map(str::trim) {
            None | Some("") => true,
            Some(label) => self.generic_labels.contains(&label.to_lowercase()),
        }
    }

    /// Stage 1: one classifier call for the whole column.
    pub async fn classify_bulk(&self, descriptions: &[String]) -> Result<Vec<Option<String>>> {
        if descriptions.is_empty() {
            return Ok(Vec::new());
        }
        let classifier = &self.classifier;
        let service = classifier.model_name();

        call_with_policy(service, &self.policy, move || async move {
            let labels = classifier.classify(descriptions).await?;
            if labels.len() != descriptions.len() {
                return Err(StatementInsightError::external(
                    service,
                    format!(
                        "classifier returned {} labels for {} descriptions",
                        labels.len(),
                        descriptions.len()
                    ),
                ));
            }
            Ok(labels)
        })
        .await
    }

    /// Stage 2: asks the language model to categorize `pending` and checks the
    /// answer echoes every request row in order. Returns one label per row.
    pub async fn repair(
        &self,
        pending: &[CategoryRecord],
        known_labels: &[String],
    ) -> Result<Vec<String>> {
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        let rows_json = serde_json::to_string_pretty(pending)?;
        let prompt = category_repair_prompt(&rows_json, known_labels);
        let model = &self.model;
        let service = model.model_name();
        let prompt = prompt.as_str();

        call_with_policy(service, &self.policy, move || async move {
            let response = model.invoke(prompt).await?;
            let repaired: Vec<RepairedCategory> =
                parse_delimited_json(service, &response, CATEGORIZED_ROWS_TAG)?;
            verify_repair(service, pending, repaired)
        })
        .await
    }

    /// Runs both stages and writes labels only if both succeed. Stage 2 is
    /// skipped entirely when stage 1 resolved every row.
    pub async fn resolve(&self, records: &mut [CategoryRecord]) -> Result<ResolutionReport> {
        let descriptions: Vec<String> = records.iter().map(|r| r.description.clone()).collect();
        let mut labels = self.classify_bulk(&descriptions).await?;

        let pending = self.pending_rows(records, &labels);
        let repaired = if pending.is_empty() {
            Vec::new()
        } else {
            let known = self.known_labels(&labels);
            self.repair(&pending, &known).await?
        };

        for (record, label) in pending.iter().zip(&repaired) {
            if let Some(position) = records.iter().position(|r| r.index == record.index) {
                labels[position] = Some(label.clone());
            }
        }
        for (record, label) in records.iter_mut().zip(labels) {
            record.category = label;
        }

        Ok(ResolutionReport {
            classified: descriptions.len(),
            repaired: repaired.len(),
        })
    }

    /// Degrading variant used by the table normalizer: a failed stage leaves
    /// the affected rows unresolved, and anything still unresolved at the end
    /// gets the fallback label. Returns the steps taken for the audit log.
    pub async fn resolve_lenient(&self, records: &mut [CategoryRecord]) -> Vec<TransformationStep> {
        let mut steps = Vec::new();
        let descriptions: Vec<String> = records.iter().map(|r| r.description.clone()).collect();
        let classifier_name = self.classifier.model_name().to_string();

        let mut labels = match self.classify_bulk(&descriptions).await {
            Ok(labels) => {
                steps.push(TransformationStep::Classified {
                    model: classifier_name,
                    rows: labels.len(),
                });
                labels
            }
            Err(e) => {
                warn!("Stage-1 classification failed, all rows escalate: {}", e);
                steps.push(TransformationStep::ClassificationFailed {
                    model: classifier_name,
                    reason: e.to_string(),
                });
                vec![None; records.len()]
            }
        };

        let pending = self.pending_rows(records, &labels);
        if pending.is_empty() {
            debug!("All {} rows resolved by stage 1", records.len());
        } else {
            let known = self.known_labels(&labels);
            match self.repair(&pending, &known).await {
                Ok(repaired) => {
                    info!("Repaired {} categories with {}", repaired.len(), self.model.model_name());
                    for (record, label) in pending.iter().zip(repaired) {
                        if let Some(position) = records.iter().position(|r| r.index == record.index) {
                            labels[position] = Some(label);
                        }
                    }
                    steps.push(TransformationStep::CategoriesRepaired {
                        model: self.model.model_name().to_string(),
                        rows: pending.len(),
                    });
                }
                Err(e) => {
                    warn!(
                        "Category repair failed for {} rows, leaving them unresolved: {}",
                        pending.len(),
                        e
                    );
                    steps.push(TransformationStep::CategoryRepairSkipped {
                        reason: e.to_string(),
                        rows: pending.len(),
                    });
                }
            }
        }

        let mut fallbacks = 0;
        for (record, label) in records.iter_mut().zip(labels) {
            record.category = if self.is_unresolved(label.as_deref()) {
                fallbacks += 1;
                Some(self.fallback_label.clone())
            } else {
                label
            };
        }
        if fallbacks > 0 {
            steps.push(TransformationStep::FallbackLabelApplied {
                label: self.fallback_label.clone(),
                rows: fallbacks,
            });
        }

        steps
    }

    fn pending_rows(
        &self,
        records: &[CategoryRecord],
        labels: &[Option<String>],
    ) -> Vec<CategoryRecord> {
        records
            .iter()
            .zip(labels)
            .filter(|(_, label)| self.is_unresolved(label.as_deref()))
            .map(|(record, label)| CategoryRecord {
                category: label.clone(),
                ..record.clone()
            })
            .collect()
    }

    fn known_labels(&self, labels: &[Option<String>]) -> Vec<String> {
        labels
            .iter()
            .flatten()
            .filter(|l| !self.is_unresolved(Some(l)))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

fn verify_repair(
    service: &str,
    pending: &[CategoryRecord],
    repaired: Vec<RepairedCategory>,
) -> Result<Vec<String>> {
    if repaired.len() != pending.len() {
        return Err(StatementInsightError::external(
            service,
            format!(
                "category repair returned {} rows for {} requested",
                repaired.len(),
                pending.len()
            ),
        ));
    }

    pending
        .iter()
        .zip(repaired)
        .enumerate()
        .map(|(position, (request, answer))| {
            if answer.index != request.index
                || answer.description.trim() != request.description.trim()
            {
                return Err(StatementInsightError::external(
                    service,
                    format!(
                        "category repair row {} does not match the request (index {} '{}' vs {} '{}')",
                        position, answer.index, answer.description, request.index, request.description
                    ),
                ));
            }
            let category = answer.category.trim().to_lowercase();
            if category.is_empty() {
                return Err(StatementInsightError::external(
                    service,
                    format!("category repair left row {} empty", request.index),
                ));
            }
            Ok(category)
        })
        .collect()
}

/// Offline stage-1 classifier built from ordered keyword rules. The first
/// rule whose keyword appears in the description wins; unmatched rows are
/// left unresolved so they escalate to stage 2.
pub struct KeywordClassifier {
    rules: Vec<(String, Vec<String>)>,
}

const DEFAULT_RULES: &[(&str, &[&str])] = &[
    ("salary", &["salary", "payroll", "wages", "pay slip"]),
    ("rent", &["rent", "landlord", "lease"]),
    ("cash withdrawal", &["atm", "cash withdrawal"]),
    ("transfer", &["transfer", "trf", "zelle", "duitnow", "ibg"]),
    ("loan repayment", &["loan", "mortgage", "instalment", "installment"]),
    ("interest", &["interest"]),
    ("fees", &["fee", "charge", "penalty"]),
    ("insurance", &["insurance", "takaful"]),
    ("utilities", &["electric", "water bill", "utility", "internet", "telco", "mobile"]),
    ("subscriptions", &["netflix", "spotify", "subscription", "icloud", "youtube"]),
    ("groceries", &["grocery", "supermarket", "tesco", "aeon", "walmart", "mart"]),
    ("dining", &["restaurant", "cafe", "coffee", "mcdonald", "kfc", "food"]),
    ("transport", &["grab", "uber", "petrol", "fuel", "shell", "parking", "toll"]),
];

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new(
            DEFAULT_RULES
                .iter()
                .map(|(label, keywords)| (label.to_string(), keywords.iter().map(|k| k.to_string()).collect()))
                .collect(),
        )
    }
}

impl KeywordClassifier {
    pub fn new(rules: Vec<(String, Vec<String>)>) -> Self {
        let rules = rules
            .into_iter()
            .map(|(label, keywords)| {
                (label, keywords.into_iter().map(|k| k.to_lowercase()).collect())
            })
            .collect();
        Self { rules }
    }

    /// Keywords must start at a word boundary, so "fee" does not match "coffee".
    pub fn label_for(&self, description: &str) -> Option<&str> {
        let words: Vec<String> = description
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();
        let haystack = format!(" {}", words.join(" "));
        self.rules
            .iter()
            .find(|(_, keywords)| {
                keywords
                    .iter()
                    .any(|k| haystack.contains(&format!(" {}", k)))
            })
            .map(|(label, _)| label.as_str())
    }
}

#[async_trait]
impl TransactionClassifier for KeywordClassifier {
    fn model_name(&self) -> &str {
        "keyword-rules"
    }

    async fn classify(&self, descriptions: &[String]) -> Result<Vec<Option<String>>> {
        Ok(descriptions
            .iter()
            .map(|d| self.label_for(d).map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FixedClassifier, ScriptedModel};

    fn records(descriptions: &[&str]) -> Vec<CategoryRecord> {
        descriptions
            .iter()
            .enumerate()
            .map(|(i, d)| CategoryRecord::new(i, *d))
            .collect()
    }

    fn resolver(labels: Vec<Option<&str>>, model: Arc<ScriptedModel>) -> CategoryResolver {
        let config = PipelineConfig {
            max_attempts: 1,
            ..PipelineConfig::default()
        };
        CategoryResolver::new(Arc::new(FixedClassifier::new(labels)), model, &config)
    }

    #[tokio::test]
    async fn test_stage_two_skipped_when_all_resolved() {
        let model = Arc::new(ScriptedModel::new(vec![]));
        let classifier = Arc::new(FixedClassifier::new(vec![Some("groceries"), Some("rent")]));
        let resolver = CategoryResolver::new(classifier.clone(), model.clone(), &PipelineConfig::default());
        let mut rows = records(&["TESCO", "LANDLORD"]);

        let report = resolver.resolve(&mut rows).await.unwrap();

        assert_eq!(report.repaired, 0);
        assert_eq!(classifier.calls(), 1);
        assert_eq!(model.calls(), 0);
        assert_eq!(rows[0].category.as_deref(), Some("groceries"));
        assert_eq!(rows[1].category.as_deref(), Some("rent"));
    }

    #[tokio::test]
    async fn test_repairs_generic_and_missing_labels() {
        let model = Arc::new(ScriptedModel::new(vec![
            r#"<categorized_rows>[
                {"index": 1, "description": "POS 8812", "category": "Dining"},
                {"index": 2, "description": "XFER 99", "category": "transfer"}
            ]</categorized_rows>"#,
        ]));
        let resolver = resolver(vec![Some("salary"), Some("Other"), None], model.clone());
        let mut rows = records(&["PAYROLL", "POS 8812", "XFER 99"]);

        let report = resolver.resolve(&mut rows).await.unwrap();

        assert_eq!(report.repaired, 2);
        assert_eq!(model.calls(), 1);
        let labels: Vec<_> = rows.iter().map(|r| r.category.clone().unwrap()).collect();
        assert_eq!(labels, vec!["salary", "dining", "transfer"]);
        assert!(model.prompts()[0].contains("POS 8812"));
        assert!(!model.prompts()[0].contains("PAYROLL"));
    }

    #[tokio::test]
    async fn test_mismatched_repair_fails_without_mutation() {
        let model = Arc::new(ScriptedModel::new(vec![
            r#"<categorized_rows>[
                {"index": 2, "description": "XFER 99", "category": "transfer"},
                {"index": 1, "description": "POS 8812", "category": "dining"}
            ]</categorized_rows>"#,
        ]));
        let resolver = resolver(vec![Some("salary"), None, Some("misc")], model);
        let mut rows = records(&["PAYROLL", "POS 8812", "XFER 99"]);
        let before = rows.clone();

        let result = resolver.resolve(&mut rows).await;

        assert!(matches!(
            result,
            Err(StatementInsightError::ExternalService { .. })
        ));
        assert_eq!(rows, before);
    }

    #[tokio::test]
    async fn test_changed_description_is_rejected() {
        let model = Arc::new(ScriptedModel::new(vec![
            r#"<categorized_rows>[{"index": 0, "description": "Coffee", "category": "dining"}]</categorized_rows>"#,
        ]));
        let resolver = resolver(vec![None], model);
        let mut rows = records(&["COFFEE BEAN 22"]);

        assert!(resolver.resolve(&mut rows).await.is_err());
        assert_eq!(rows[0].category, None);
    }

    #[tokio::test]
    async fn test_lenient_resolution_degrades_to_fallback() {
        let model = Arc::new(ScriptedModel::new(vec!["no delimiters here"]));
        let resolver = resolver(vec![Some("rent"), Some("uncategorized")], model.clone());
        let mut rows = records(&["LANDLORD", "MYSTERY"]);

        let steps = resolver.resolve_lenient(&mut rows).await;

        assert_eq!(model.calls(), 1);
        assert_eq!(rows[0].category.as_deref(), Some("rent"));
        assert_eq!(rows[1].category.as_deref(), Some("uncategorized"));
        assert!(steps
            .iter()
            .any(|s| matches!(s, TransformationStep::CategoryRepairSkipped { rows: 1, .. })));
    }

    #[tokio::test]
    async fn test_lenient_resolution_survives_classifier_failure() {
        let model = Arc::new(ScriptedModel::new(vec![
            r#"<categorized_rows>[{"index": 0, "description": "LANDLORD", "category": "rent"}]</categorized_rows>"#,
        ]));
        let config = PipelineConfig {
            max_attempts: 1,
            ..PipelineConfig::default()
        };
        let resolver = CategoryResolver::new(Arc::new(FixedClassifier::failing()), model, &config);
        let mut rows = records(&["LANDLORD"]);

        let steps = resolver.resolve_lenient(&mut rows).await;

        assert_eq!(rows[0].category.as_deref(), Some("rent"));
        assert!(matches!(
            steps.first(),
            Some(TransformationStep::ClassificationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_keyword_classifier() {
        let classifier = KeywordClassifier::default();
        let labels = classifier
            .classify(&[
                "MONTHLY PAYROLL ACME".to_string(),
                "ATM WITHDRAWAL 0042".to_string(),
                "POS 8812".to_string(),
                "COFFEE BEAN KLCC".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(
            labels,
            vec![
                Some("salary".to_string()),
                Some("cash withdrawal".to_string()),
                None,
                Some("dining".to_string()),
            ]
        );
    }
}
