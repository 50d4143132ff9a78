use crate::error::{Result, StatementInsightError};
use crate::features::BaseInsights;
use crate::prompts::{
    recommendation_prompt, EVIDENCE_TAG, REASONING_TAG, RECOMMENDATION_TAG, STRENGTHS_TAG,
    WEAKNESSES_TAG,
};
use crate::schema::{TitledTable, TransactionRecord};
use crate::services::{call_with_policy, extract_delimited, CallPolicy, LanguageModel};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Accept,
    Reject,
    Defer,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Accept => "ACCEPT",
            Decision::Reject => "REJECT",
            Decision::Defer => "DEFER",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = String;

    /// Accepts text that names exactly one decision, e.g. `"**ACCEPT**"`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let upper = s.to_uppercase();
        let words: Vec<&str> = upper
            .split(|c: char| !c.is_ascii_alphabetic())
            .filter(|w| !w.is_empty())
            .collect();
        let found: Vec<Decision> = [Decision::Accept, Decision::Reject, Decision::Defer]
            .into_iter()
            .filter(|d| words.contains(&d.as_str()))
            .collect();
        match found.as_slice() {
            [decision] => Ok(*decision),
            [] => Err(format!("no decision found in '{}'", s.trim())),
            _ => Err(format!("ambiguous decision '{}'", s.trim())),
        }
    }
}

/// Everything the assembler reads, snapshotted from an account holder.
#[derive(Debug, Clone, Serialize)]
pub struct RecommendationInput {
    pub holder_name: String,
    pub base_insights: Option<BaseInsights>,
    pub descriptive_tables: Vec<TitledTable>,
    pub transactions: Option<Vec<TransactionRecord>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub holder: String,
    pub recommendation: Decision,
    pub reasoning: String,
    pub strengths: String,
    pub weaknesses: String,
    pub evidence: String,
    pub model: String,
}

pub struct RecommendationAssembler {
    model: Arc<dyn LanguageModel>,
    policy: CallPolicy,
}

impl RecommendationAssembler {
    pub fn new(model: Arc<dyn LanguageModel>, policy: CallPolicy) -> Self {
        Self { model, policy }
    }

    /// Fails with `InsufficientData` before calling the model when base
    /// insights, the transaction ledger or descriptive tables are missing.
    /// Only the model call itself is retried; a response without a usable
    /// recommendation section is a hard failure.
    pub async fn recommend(&self, input: &RecommendationInput) -> Result<Recommendation> {
        let insights = input.base_insights.as_ref().ok_or_else(|| {
            StatementInsightError::InsufficientData(format!(
                "no base insights for '{}'",
                input.holder_name
            ))
        })?;
        let transactions = input
            .transactions
            .as_ref()
            .filter(|rows| !rows.is_empty())
            .ok_or_else(|| {
                StatementInsightError::InsufficientData(format!(
                    "no transaction ledger for '{}'",
                    input.holder_name
                ))
            })?;
        if input.descriptive_tables.is_empty() {
            return Err(StatementInsightError::InsufficientData(format!(
                "no descriptive tables for '{}'",
                input.holder_name
            )));
        }

        let prompt = recommendation_prompt(
            &input.holder_name,
            &serde_json::to_string_pretty(insights)?,
            &serde_json::to_string_pretty(&input.descriptive_tables)?,
            &serde_json::to_string_pretty(transactions)?,
        );

        let model = &self.model;
        let service = model.model_name();
        let prompt = prompt.as_str();
        let response =
            call_with_policy(service, &self.policy, move || async move { model.invoke(prompt).await })
                .await?;

        let recommendation = parse_response(service, &input.holder_name, &response)?;
        info!(
            "Recommendation for '{}': {}",
            input.holder_name, recommendation.recommendation
        );
        Ok(recommendation)
    }
}

/// Splits a model response into its sections. Only the recommendation is
/// mandatory; other missing sections come back empty.
pub fn parse_response(service: &str, holder: &str, response: &str) -> Result<Recommendation> {
    let decision_text = extract_delimited(response, RECOMMENDATION_TAG).ok_or_else(|| {
        StatementInsightError::external(
            service,
            format!("response is missing <{}> delimiters", RECOMMENDATION_TAG),
        )
    })?;
    let recommendation = decision_text
        .parse::<Decision>()
        .map_err(|e| StatementInsightError::external(service, e))?;

    let section = |tag: &str| {
        extract_delimited(response, tag)
            .map(str::to_string)
            .unwrap_or_else(|| {
                warn!("Recommendation response has no <{}> section", tag);
                String::new()
            })
    };

    Ok(Recommendation {
        holder: holder.to_string(),
        recommendation,
        reasoning: section(REASONING_TAG),
        strengths: section(STRENGTHS_TAG),
        weaknesses: section(WEAKNESSES_TAG),
        evidence: section(EVIDENCE_TAG),
        model: service.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedModel;

    #[test]
    fn test_decision_parsing() {
        assert_eq!("ACCEPT".parse::<Decision>(), Ok(Decision::Accept));
        assert_eq!(" **defer** ".parse::<Decision>(), Ok(Decision::Defer));
        assert!("ACCEPT | REJECT".parse::<Decision>().is_err());
        assert!("maybe".parse::<Decision>().is_err());
    }

    #[test]
    fn test_optional_sections_default_to_empty() {
        let response = "<recommendation>REJECT</recommendation>\n<reasoning>Overdrawn.</reasoning>";
        let parsed = parse_response("model", "Jane", response).unwrap();
        assert_eq!(parsed.recommendation, Decision::Reject);
        assert_eq!(parsed.reasoning, "Overdrawn.");
        assert_eq!(parsed.strengths, "");
        assert_eq!(parsed.evidence, "");
    }

    #[test]
    fn test_missing_recommendation_is_a_failure() {
        let result = parse_response("model", "Jane", "<reasoning>Looks fine</reasoning>");
        assert!(matches!(
            result,
            Err(StatementInsightError::ExternalService { .. })
        ));
    }

    #[tokio::test]
    async fn test_insufficient_data_skips_model() {
        let model = Arc::new(ScriptedModel::new(vec!["<recommendation>ACCEPT</recommendation>"]));
        let assembler = RecommendationAssembler::new(model.clone(), CallPolicy::default());
        let input = RecommendationInput {
            holder_name: "Jane".to_string(),
            base_insights: None,
            descriptive_tables: Vec::new(),
            transactions: Some(Vec::new()),
        };

        let result = assembler.recommend(&input).await;

        assert!(matches!(
            result,
            Err(StatementInsightError::InsufficientData(_))
        ));
        assert_eq!(model.calls(), 0);
    }
}
