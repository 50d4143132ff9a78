//! Per-table pipeline: raw validated grid in, typed [`Ledger`] out.

use crate::categories::{CategoryRecord, CategoryResolver};
use crate::dates::normalize_dates;
use crate::ledger::{
    CoercionFailure, DescriptiveTable, Ledger, LedgerBody, LedgerKind, TransactionTable,
    TransformationStep,
};
use crate::schema::{
    Cell, RawTable, TransactionRecord, UserInformation, AMOUNT_COLUMN, BALANCE_COLUMN,
    CLASSIFIED_COLUMN, DATE_COLUMN, DESCRIPTION_COLUMN, TAG_COLUMN, TITLE_KEY,
};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

const AMOUNT_ALIASES: &[&str] = &[AMOUNT_COLUMN, "amount", "transaction amount"];
const CREDIT_ALIASES: &[&str] = &[
    "credit",
    "credits",
    "deposit",
    "deposits",
    "money in",
    "paid in",
];
const DEBIT_ALIASES: &[&str] = &[
    "debit",
    "debits",
    "withdrawal",
    "withdrawals",
    "money out",
    "paid out",
];

/// Where a table came from and what the extractor knew about it.
#[derive(Debug, Clone, Default)]
pub struct Provenance {
    pub source: String,
    pub title: String,
    pub user_information: UserInformation,
}

/// How the transaction amount of each row is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AmountSource {
    Column(usize),
    CreditDebit {
        credit: Option<usize>,
        debit: Option<usize>,
    },
    BalanceDiff(usize),
    Unavailable,
}

pub struct TableNormalizer {
    resolver: Arc<CategoryResolver>,
}

impl TableNormalizer {
    pub fn new(resolver: Arc<CategoryResolver>) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &CategoryResolver {
        &self.resolver
    }

    /// Builds a ledger from a validated table.
    ///
    /// Tables without a `date` column stay descriptive; tables with a date but
    /// no `description` only get their dates repaired. Everything else becomes
    /// a transaction table exposing `date`, `description`, `transaction_amount`
    /// and `tag`. External-service failures degrade the result, they never
    /// fail the table.
    pub async fn normalize(&self, raw: RawTable, provenance: Provenance) -> Ledger {
        let Provenance {
            source,
            title,
            mut user_information,
        } = provenance;
        if !title.trim().is_empty() {
            user_information.set(TITLE_KEY, title);
        }

        let (mut columns, rows) = raw.into_normalized_parts();
        let mut history = vec![
            TransformationStep::StageEntered {
                kind: LedgerKind::Raw,
            },
            TransformationStep::HeadersLowercased {
                columns: columns.clone(),
            },
        ];

        let date_idx = columns.iter().position(|c| c == DATE_COLUMN);
        let description_idx = columns.iter().position(|c| c == DESCRIPTION_COLUMN);

        let (date_idx, description_idx) = match (date_idx, description_idx) {
            (None, _) => {
                history.push(TransformationStep::StageEntered {
                    kind: LedgerKind::Descriptive,
                });
                debug!("Table from {} has no date column, kept descriptive", source);
                let body = LedgerBody::Descriptive(DescriptiveTable::new(columns, rows));
                return Ledger::new(body, user_information, source, history);
            }
            (Some(_), None) => {
                let mut table = DescriptiveTable::new(columns, rows);
                history.extend(table.normalize_dates());
                history.push(TransformationStep::StageEntered {
                    kind: LedgerKind::PartiallyNormalized,
                });
                debug!("Table from {} has dates but no descriptions", source);
                let body = LedgerBody::Descriptive(table);
                return Ledger::new(body, user_information, source, history);
            }
            (Some(date), Some(description)) => (date, description),
        };

        history.push(TransformationStep::StageEntered {
            kind: LedgerKind::Transaction,
        });

        for column in columns.iter_mut() {
            if column == TAG_COLUMN || column == CLASSIFIED_COLUMN {
                let renamed = format!("source_{}", column);
                history.push(TransformationStep::ColumnRenamed {
                    from: column.clone(),
                    to: renamed.clone(),
                });
                *column = renamed;
            }
        }

        let mut category_records = category_records(&columns, &rows, description_idx);
        history.extend(self.resolver.resolve_lenient(&mut category_records).await);

        let raw_dates: Vec<Option<String>> = rows
            .iter()
            .map(|row| row[date_idx].as_text().map(|t| t.into_owned()))
            .collect();
        let dates = normalize_dates(&raw_dates);
        history.push(TransformationStep::DatesNormalized {
            column: DATE_COLUMN.to_string(),
            missing: dates.iter().filter(|d| d.is_none()).count(),
        });

        let balance_idx = columns.iter().position(|c| c == BALANCE_COLUMN);
        let amount_source = detect_amount_source(&columns, balance_idx);
        let (amounts, step) = derive_amounts(&columns, &rows, amount_source);
        if matches!(step, TransformationStep::AmountsUnavailable) {
            warn!(
                "Transaction table from {} has no amount, credit/debit or balance column",
                source
            );
        }
        history.push(step);

        history.push(TransformationStep::ColumnRenamed {
            from: CLASSIFIED_COLUMN.to_string(),
            to: TAG_COLUMN.to_string(),
        });

        let mut consumed = vec![date_idx, description_idx];
        consumed.extend(balance_idx);
        if let AmountSource::Column(idx) = amount_source {
            consumed.push(idx);
        }

        let fallback = self.resolver.fallback_label();
        let records: Vec<TransactionRecord> = rows
            .into_iter()
            .zip(dates)
            .zip(amounts)
            .zip(category_records)
            .map(|(((row, date), amount), category)| {
                let balance = balance_idx.and_then(|idx| row[idx].as_number());
                let extra: BTreeMap<String, Cell> = columns
                    .iter()
                    .zip(row)
                    .enumerate()
                    .filter(|(idx, (name, cell))| {
                        !consumed.contains(idx) && !name.is_empty() && !cell.is_empty()
                    })
                    .map(|(_, (name, cell))| (name.clone(), cell))
                    .collect();
                TransactionRecord {
                    date,
                    description: category.description,
                    transaction_amount: amount,
                    tag: category.category.unwrap_or_else(|| fallback.to_string()),
                    balance,
                    extra,
                }
            })
            .collect();

        info!(
            "Normalized transaction table '{}' from {} ({} rows)",
            user_information.title().unwrap_or_default(),
            source,
            records.len()
        );

        let body = LedgerBody::Transaction(TransactionTable::new(records));
        Ledger::new(body, user_information, source, history)
    }
}

/// Resolver input: one record per row, description plus the remaining
/// non-empty cells as context.
fn category_records(
    columns: &[String],
    rows: &[Vec<Cell>],
    description_idx: usize,
) -> Vec<CategoryRecord> {
    rows.iter()
        .enumerate()
        .map(|(index, row)| {
            let mut record = CategoryRecord::new(
                index,
                row[description_idx]
                    .as_text()
                    .map(|t| t.trim().to_string())
                    .unwrap_or_default(),
            );
            for (idx, (name, cell)) in columns.iter().zip(row).enumerate() {
                if idx == description_idx || name.is_empty() || cell.is_empty() {
                    continue;
                }
                let key = match name.as_str() {
                    "index" => continue,
                    "category" => "source_category",
                    other => other,
                };
                record.fields.insert(key.to_string(), cell.to_json());
            }
            record
        })
        .collect()
}

fn find_column(columns: &[String], aliases: &[&str]) -> Option<usize> {
    aliases
        .iter()
        .find_map(|alias| columns.iter().position(|c| c == alias))
}

fn detect_amount_source(columns: &[String], balance_idx: Option<usize>) -> AmountSource {
    if let Some(idx) = find_column(columns, AMOUNT_ALIASES) {
        return AmountSource::Column(idx);
    }
    let credit = find_column(columns, CREDIT_ALIASES);
    let debit = find_column(columns, DEBIT_ALIASES);
    if credit.is_some() || debit.is_some() {
        return AmountSource::CreditDebit { credit, debit };
    }
    match balance_idx {
        Some(idx) => AmountSource::BalanceDiff(idx),
        None => AmountSource::Unavailable,
    }
}

/// Parses one numeric column, recording every non-empty cell that is not a number.
fn coerce_column(
    columns: &[String],
    rows: &[Vec<Cell>],
    idx: usize,
    failures: &mut Vec<CoercionFailure>,
) -> Vec<Option<f64>> {
    rows.iter()
        .enumerate()
        .map(|(row_idx, row)| {
            let cell = &row[idx];
            let value = cell.as_number();
            if value.is_none() && !cell.is_empty() {
                failures.push(CoercionFailure {
                    row: row_idx,
                    column: columns[idx].clone(),
                    raw: cell.to_string(),
                });
            }
            value
        })
        .collect()
}

fn derive_amounts(
    columns: &[String],
    rows: &[Vec<Cell>],
    source: AmountSource,
) -> (Vec<Option<f64>>, TransformationStep) {
    let mut failures = Vec::new();
    match source {
        AmountSource::Column(idx) => {
            let amounts = coerce_column(columns, rows, idx, &mut failures);
            log_failures(&failures);
            (
                amounts,
                TransformationStep::AmountsParsed {
                    column: columns[idx].clone(),
                    failures,
                },
            )
        }
        AmountSource::CreditDebit { credit, debit } => {
            let credits = credit.map(|idx| coerce_column(columns, rows, idx, &mut failures));
            let debits = debit.map(|idx| coerce_column(columns, rows, idx, &mut failures));
            let amounts = (0..rows.len())
                .map(|i| {
                    let c = credits.as_ref().and_then(|v| v[i]);
                    let d = debits.as_ref().and_then(|v| v[i]);
                    match (c, d) {
                        (None, None) => None,
                        (c, d) => Some(c.unwrap_or(0.0) - d.unwrap_or(0.0).abs()),
                    }
                })
                .collect();
            log_failures(&failures);
            let from = [credit, debit]
                .into_iter()
                .flatten()
                .map(|idx| columns[idx].clone())
                .collect();
            (amounts, TransformationStep::AmountsDerived { from, failures })
        }
        AmountSource::BalanceDiff(idx) => {
            let balances = coerce_column(columns, rows, idx, &mut failures);
            let amounts = balances_to_amounts(&balances);
            log_failures(&failures);
            (
                amounts,
                TransformationStep::AmountsDerived {
                    from: vec![columns[idx].clone()],
                    failures,
                },
            )
        }
        AmountSource::Unavailable => (vec![None; rows.len()], TransformationStep::AmountsUnavailable),
    }
}

/// `amount[i] = balance[i] - balance[i-1]`; the first row, and any row next
/// to a missing balance, has no amount.
pub fn balances_to_amounts(balances: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut amounts = Vec::with_capacity(balances.len());
    if !balances.is_empty() {
        amounts.push(None);
    }
    amounts.extend(balances.windows(2).map(|pair| match (pair[0], pair[1]) {
        (Some(prev), Some(curr)) => Some(curr - prev),
        _ => None,
    }));
    amounts
}

fn log_failures(failures: &[CoercionFailure]) {
    for failure in failures {
        warn!(
            "Could not read '{}' in column '{}' row {} as a number",
            failure.raw, failure.column, failure.row
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::testing::{FixedClassifier, ScriptedModel};
    use crate::validator::validate_table;
    use chrono::NaiveDate;
    use serde_json::json;

    fn normalizer(label: &str) -> TableNormalizer {
        let resolver = CategoryResolver::new(
            Arc::new(FixedClassifier::uniform(label)),
            Arc::new(ScriptedModel::new(vec![])),
            &PipelineConfig::default(),
        );
        TableNormalizer::new(Arc::new(resolver))
    }

    fn provenance(title: &str) -> Provenance {
        Provenance {
            source: "statement.pdf".to_string(),
            title: title.to_string(),
            user_information: UserInformation::new(),
        }
    }

    async fn normalize(table: serde_json::Value) -> Ledger {
        let raw = validate_table(&table).unwrap();
        normalizer("groceries").normalize(raw, provenance("main table")).await
    }

    #[test]
    fn test_balances_to_amounts() {
        assert_eq!(
            balances_to_amounts(&[Some(100.0), Some(150.0), Some(140.0)]),
            vec![None, Some(50.0), Some(-10.0)]
        );
        assert_eq!(
            balances_to_amounts(&[Some(100.0), None, Some(140.0)]),
            vec![None, None, None]
        );
        assert!(balances_to_amounts(&[]).is_empty());
    }

    #[tokio::test]
    async fn test_derives_amounts_from_balance() {
        let ledger = normalize(json!([
            ["Date", "Description", "Balance"],
            ["Jan 1 2023", "Opening", "100.00"],
            ["Jan 2", "Deposit", "150.00"],
            ["Jan 3", "Coffee", "140.00"]
        ]))
        .await;

        assert_eq!(ledger.kind(), LedgerKind::Transaction);
        let records = ledger.transactions().unwrap().records();
        let amounts: Vec<Option<f64>> = records.iter().map(|r| r.transaction_amount).collect();
        assert_eq!(amounts, vec![None, Some(50.0), Some(-10.0)]);
        assert_eq!(records[1].date, NaiveDate::from_ymd_opt(2023, 1, 2));
        assert_eq!(records[2].balance, Some(140.0));
        assert!(records.iter().all(|r| r.tag == "groceries"));
        assert!(ledger.history().contains(&TransformationStep::ColumnRenamed {
            from: CLASSIFIED_COLUMN.to_string(),
            to: TAG_COLUMN.to_string(),
        }));
    }

    #[tokio::test]
    async fn test_unparseable_balances_are_recorded() {
        let ledger = normalize(json!([
            ["date", "description", "balance"],
            ["2023-01-01", "Opening", "100"],
            ["2023-01-02", "Smudged", "1O5"],
            ["2023-01-03", "Coffee", "95"]
        ]))
        .await;

        let amounts: Vec<Option<f64>> = ledger
            .transactions()
            .unwrap()
            .records()
            .iter()
            .map(|r| r.transaction_amount)
            .collect();
        assert_eq!(amounts, vec![None, None, None]);

        let failures = ledger
            .history()
            .iter()
            .find_map(|step| match step {
                TransformationStep::AmountsDerived { failures, .. } => Some(failures.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            failures,
            vec![CoercionFailure {
                row: 1,
                column: "balance".to_string(),
                raw: "1O5".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_credit_debit_columns() {
        let ledger = normalize(json!([
            ["Date", "Description", "Debit", "Credit", "Balance"],
            ["2023-01-01", "Salary", "", "2,500.00", "2600"],
            ["2023-01-02", "Rent", "900.00", "", "1700"]
        ]))
        .await;

        let records = ledger.transactions().unwrap().records();
        assert_eq!(records[0].transaction_amount, Some(2500.0));
        assert_eq!(records[1].transaction_amount, Some(-900.0));
        assert_eq!(records[1].extra.get("debit"), Some(&Cell::Text("900.00".into())));
    }

    #[tokio::test]
    async fn test_existing_amount_column_and_source_tags() {
        let ledger = normalize(json!([
            ["DATE", "Description", "Amount", "Tag", "Ref"],
            ["2023-05-01", "Tesco", "(12.40)", "Food", "A1"],
            ["2023-05-02", "Refund", "12.40", "", "A2"]
        ]))
        .await;

        let records = ledger.transactions().unwrap().records();
        assert_eq!(records[0].transaction_amount, Some(-12.4));
        assert_eq!(records[0].tag, "groceries");
        assert_eq!(records[0].extra.get("source_tag"), Some(&Cell::Text("Food".into())));
        assert_eq!(records[0].extra.get("ref"), Some(&Cell::Text("A1".into())));
        assert!(!records[0].extra.contains_key("amount"));
    }

    #[tokio::test]
    async fn test_table_without_amount_source_still_exposes_amounts() {
        let ledger = normalize(json!([
            ["date", "description"],
            ["2023-01-01", "Mystery"]
        ]))
        .await;

        let records = ledger.transactions().unwrap().records();
        assert_eq!(records[0].transaction_amount, None);
        assert!(ledger
            .history()
            .contains(&TransformationStep::AmountsUnavailable));
    }

    #[tokio::test]
    async fn test_descriptive_tables() {
        let summary = normalize(json!([
            ["Account Type", "Opening Balance"],
            ["Savings", "1,000.00"]
        ]))
        .await;
        assert_eq!(summary.kind(), LedgerKind::Descriptive);
        assert_eq!(summary.title(), "main table");
        assert_eq!(
            summary.descriptive().unwrap().columns(),
            ["account type", "opening balance"]
        );

        let dated = normalize(json!([
            ["Date", "Closing Balance"],
            ["Mar 31 2023", "500"],
            ["Apr 30", "650"]
        ]))
        .await;
        assert_eq!(dated.kind(), LedgerKind::PartiallyNormalized);
        assert_eq!(
            dated.descriptive().unwrap().rows()[1][0],
            Cell::Date(NaiveDate::from_ymd_opt(2023, 4, 30).unwrap())
        );
    }
}
