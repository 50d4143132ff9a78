//! Prompts for the two language-model calls the core makes: category repair
//! and the final recommendation. Each asks for delimiter-wrapped output.

use crate::categories::RepairedCategory;
use crate::recommendation::Decision;
use schemars::schema_for;

pub const CATEGORIZED_ROWS_TAG: &str = "categorized_rows";

pub const RECOMMENDATION_TAG: &str = "recommendation";
pub const REASONING_TAG: &str = "reasoning";
pub const STRENGTHS_TAG: &str = "strengths";
pub const WEAKNESSES_TAG: &str = "weaknesses";
pub const EVIDENCE_TAG: &str = "evidence";

const CATEGORY_REPAIR_INSTRUCTIONS: &str = r#"
You are a bank-transaction categorisation specialist.

The rows below could not be categorised by the bulk classifier. Assign each row
a short, specific spending or income category (e.g. "groceries", "salary",
"rent", "transfer", "fuel"). Prefer the labels already in use when one fits.

## RULES
- Return EXACTLY one output row per input row, in the SAME ORDER.
- Copy `index` and `description` from the input row unchanged.
- `category` must be a non-empty lowercase label. Never answer "uncategorized",
  "other" or "unknown"; pick the closest real category instead.
- Do not add, drop, merge or reorder rows.

## OUTPUT FORMAT
Wrap a JSON array matching the schema below in <categorized_rows></categorized_rows>.
Nothing else inside the delimiters.
"#;

const RECOMMENDATION_INSTRUCTIONS: &str = r#"
You are a credit analyst reviewing a loan applicant's bank statements.

You receive three inputs:
1. BASE INSIGHTS: grouped statistics over the applicant's transactions
   (frequent descriptions, per-category, per-month and per-week aggregates).
2. DESCRIPTIVE TABLES: account summaries and other non-transaction tables
   found in the statements.
3. TRANSACTIONS: the normalised transaction ledger.

Judge income stability, spending discipline, recurring obligations, overdraft
or bounced-payment signals and balance trends. Base every claim on the data.

## OUTPUT FORMAT
Answer with the following sections, each wrapped in its delimiters:

<recommendation>ACCEPT | REJECT | DEFER</recommendation>
<reasoning>Two or three paragraphs explaining the decision.</reasoning>
<strengths>Bullet list of positive signals.</strengths>
<weaknesses>Bullet list of risk signals.</weaknesses>
<evidence>Bullet list of concrete figures (amounts, dates, counts) backing the decision.</evidence>

The recommendation section must contain exactly one of ACCEPT, REJECT or DEFER.
Use DEFER when the data is too thin or contradictory to decide.
"#;

pub fn category_repair_prompt(rows_json: &str, known_labels: &[String]) -> String {
    let schema = schema_for!(Vec<RepairedCategory>);
    let schema_json = serde_json::to_string_pretty(&schema).unwrap_or_default();
    let labels = if known_labels.is_empty() {
        "(none yet)".to_string()
    } else {
        known_labels.join(", ")
    };

    format!(
        "{}\n## OUTPUT SCHEMA\n{}\n\n## LABELS ALREADY IN USE\n{}\n\n## ROWS TO CATEGORISE\n{}\n",
        CATEGORY_REPAIR_INSTRUCTIONS, schema_json, labels, rows_json
    )
}

pub fn recommendation_prompt(
    holder_name: &str,
    insights_json: &str,
    descriptive_json: &str,
    transactions_json: &str,
) -> String {
    let choices = [Decision::Accept, Decision::Reject, Decision::Defer]
        .iter()
        .map(Decision::as_str)
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "{}\nAllowed decisions: {}\n\n## APPLICANT\n{}\n\n## BASE INSIGHTS\n{}\n\n## DESCRIPTIVE TABLES\n{}\n\n## TRANSACTIONS\n{}\n",
        RECOMMENDATION_INSTRUCTIONS,
        choices,
        holder_name,
        insights_json,
        descriptive_json,
        transactions_json
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repair_prompt_embeds_schema_and_rows() {
        let prompt = category_repair_prompt(
            r#"[{"index":0,"description":"TESCO 123"}]"#,
            &["rent".to_string()],
        );
        assert!(prompt.contains("<categorized_rows>"));
        assert!(prompt.contains("TESCO 123"));
        assert!(prompt.contains("\"description\""));
        assert!(prompt.contains("rent"));
    }

    #[test]
    fn test_recommendation_prompt_lists_all_sections() {
        let prompt = recommendation_prompt("Jane Doe", "{}", "[]", "[]");
        for tag in [
            RECOMMENDATION_TAG,
            REASONING_TAG,
            STRENGTHS_TAG,
            WEAKNESSES_TAG,
            EVIDENCE_TAG,
        ] {
            assert!(prompt.contains(&format!("<{}>", tag)), "missing {}", tag);
        }
        assert!(prompt.contains("ACCEPT, REJECT, DEFER"));
    }
}
