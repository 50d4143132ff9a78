use crate::dates::normalize_dates;
use crate::error::{Result, StatementInsightError};
use crate::features::{BaseInsights, FeatureAggregator};
use crate::schema::{Cell, TitledTable, TransactionRecord, UserInformation, DATE_COLUMN, DEFAULT_TITLE};
use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, info};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};

/// Where a table sits in the normalization state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    /// Validated but untouched.
    Raw,
    /// Has a date column that was repaired, but no description column.
    PartiallyNormalized,
    Descriptive,
    Transaction,
}

/// A normalization step applied to a ledger, kept for traceability only.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum TransformationStep {
    HeadersLowercased {
        columns: Vec<String>,
    },
    StageEntered {
        kind: LedgerKind,
    },
    Classified {
        model: String,
        rows: usize,
    },
    ClassificationFailed {
        model: String,
        reason: String,
    },
    CategoriesRepaired {
        model: String,
        rows: usize,
    },
    CategoryRepairSkipped {
        reason: String,
        rows: usize,
    },
    FallbackLabelApplied {
        label: String,
        rows: usize,
    },
    DatesNormalized {
        column: String,
        missing: usize,
    },
    AmountsParsed {
        column: String,
        failures: Vec<CoercionFailure>,
    },
    AmountsDerived {
        from: Vec<String>,
        failures: Vec<CoercionFailure>,
    },
    AmountsUnavailable,
    ColumnRenamed {
        from: String,
        to: String,
    },
    Unified {
        sources: Vec<String>,
        duplicates_removed: usize,
    },
    TransactionsAppended {
        rows: usize,
        duplicates_removed: usize,
    },
}

/// A cell that should have been numeric but was not. The row keeps a
/// missing value; the failure is recorded here rather than dropped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoercionFailure {
    pub row: usize,
    pub column: String,
    pub raw: String,
}

/// A cached feature bundle, stamped with the ledger revision it was computed from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsightSnapshot {
    pub revision: u64,
    pub generated_at: DateTime<Utc>,
    pub insights: BaseInsights,
}

/// A non-transaction table: account summaries, balance overviews and the like.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DescriptiveTable {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl DescriptiveTable {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Repairs the `date` column in place, if there is one.
    pub(crate) fn normalize_dates(&mut self) -> Option<TransformationStep> {
        let idx = self.column_index(DATE_COLUMN)?;
        let raw: Vec<Option<String>> = self
            .rows
            .iter()
            .map(|row| row[idx].as_text().map(|t| t.into_owned()))
            .collect();
        let parsed = normalize_dates(&raw);
        let missing = parsed.iter().filter(|d| d.is_none()).count();
        for (row, date) in self.rows.iter_mut().zip(parsed) {
            row[idx] = date.map(Cell::Date).unwrap_or(Cell::Empty);
        }
        Some(TransformationStep::DatesNormalized {
            column: DATE_COLUMN.to_string(),
            missing,
        })
    }

    fn row_date(&self, row: &[Cell]) -> Option<NaiveDate> {
        let idx = self.column_index(DATE_COLUMN)?;
        match row.get(idx) {
            Some(Cell::Date(d)) => Some(*d),
            _ => None,
        }
    }

    fn sort_by_date(&mut self) {
        if self.column_index(DATE_COLUMN).is_none() {
            return;
        }
        let mut keyed: Vec<(Option<NaiveDate>, Vec<Cell>)> = std::mem::take(&mut self.rows)
            .into_iter()
            .map(|row| (self.row_date(&row), row))
            .collect();
        keyed.sort_by(|(a, _), (b, _)| compare_dates(a, b));
        self.rows = keyed.into_iter().map(|(_, row)| row).collect();
    }

    fn dedupe(&mut self) -> usize {
        let before = self.rows.len();
        let mut seen = HashSet::new();
        self.rows
            .retain(|row| seen.insert(row.iter().map(Cell::dedupe_key).collect::<Vec<_>>()));
        before - self.rows.len()
    }

    /// Re-shapes the rows onto `columns`, filling absent columns with empty cells.
    fn project(&self, columns: &[String]) -> Vec<Vec<Cell>> {
        let mapping: Vec<Option<usize>> = columns.iter().map(|c| self.column_index(c)).collect();
        self.rows
            .iter()
            .map(|row| {
                mapping
                    .iter()
                    .map(|idx| idx.and_then(|i| row.get(i).cloned()).unwrap_or_default())
                    .collect()
            })
            .collect()
    }
}

/// The canonical transaction ledger.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransactionTable {
    records: Vec<TransactionRecord>,
}

impl TransactionTable {
    pub fn new(records: Vec<TransactionRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[TransactionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Appends, removes exact duplicates and re-sorts by date. Returns the
    /// number of duplicates removed.
    fn append(&mut self, other: TransactionTable) -> usize {
        self.records.extend(other.records);
        let before = self.records.len();
        let mut seen = HashSet::new();
        self.records.retain(|record| seen.insert(record.dedupe_key()));
        self.records
            .sort_by(|a, b| compare_dates(&a.date, &b.date));
        before - self.records.len()
    }
}

/// Ascending by date with missing dates last. Used with stable sorts so that
/// rows on the same day keep their source order.
fn compare_dates(a: &Option<NaiveDate>, b: &Option<NaiveDate>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LedgerBody {
    Descriptive(DescriptiveTable),
    Transaction(TransactionTable),
}

/// A normalized per-source table plus everything known about where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Ledger {
    body: LedgerBody,
    user_information: UserInformation,
    source_documents: BTreeSet<String>,
    insights: Vec<InsightSnapshot>,
    history: Vec<TransformationStep>,
    revision: u64,
}

impl Ledger {
    pub fn new(
        body: LedgerBody,
        user_information: UserInformation,
        source: impl Into<String>,
        history: Vec<TransformationStep>,
    ) -> Self {
        Self {
            body,
            user_information,
            source_documents: BTreeSet::from([source.into()]),
            insights: Vec::new(),
            history,
            revision: 0,
        }
    }

    pub fn body(&self) -> &LedgerBody {
        &self.body
    }

    pub fn kind(&self) -> LedgerKind {
        match &self.body {
            LedgerBody::Transaction(_) => LedgerKind::Transaction,
            LedgerBody::Descriptive(table) if table.column_index(DATE_COLUMN).is_some() => {
                LedgerKind::PartiallyNormalized
            }
            LedgerBody::Descriptive(_) => LedgerKind::Descriptive,
        }
    }

    pub fn is_transaction_table(&self) -> bool {
        matches!(self.body, LedgerBody::Transaction(_))
    }

    pub fn transactions(&self) -> Option<&TransactionTable> {
        match &self.body {
            LedgerBody::Transaction(table) => Some(table),
            LedgerBody::Descriptive(_) => None,
        }
    }

    pub fn descriptive(&self) -> Option<&DescriptiveTable> {
        match &self.body {
            LedgerBody::Descriptive(table) => Some(table),
            LedgerBody::Transaction(_) => None,
        }
    }

    pub fn user_information(&self) -> &UserInformation {
        &self.user_information
    }

    pub fn source_documents(&self) -> &BTreeSet<String> {
        &self.source_documents
    }

    pub fn insights(&self) -> &[InsightSnapshot] {
        &self.insights
    }

    pub fn history(&self) -> &[TransformationStep] {
        &self.history
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn title(&self) -> &str {
        self.user_information.title().unwrap_or(DEFAULT_TITLE)
    }

    pub fn len(&self) -> usize {
        match &self.body {
            LedgerBody::Descriptive(table) => table.len(),
            LedgerBody::Transaction(table) => table.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Descriptive ledger as a titled table for consumers.
    pub fn titled_table(&self) -> Option<TitledTable> {
        self.descriptive().map(|table| TitledTable {
            title: self.title().to_string(),
            columns: table.columns().to_vec(),
            rows: table.rows().to_vec(),
        })
    }

    /// Lossless merge of two descriptive ledgers.
    ///
    /// Columns are unioned (first ledger's order first), rows concatenated,
    /// exact duplicates dropped and the result sorted by date with missing
    /// dates last. Fails if either side is a transaction table.
    pub fn unify(first: &Ledger, second: &Ledger) -> Result<Ledger> {
        let (a, b) = match (&first.body, &second.body) {
            (LedgerBody::Descriptive(a), LedgerBody::Descriptive(b)) => (a, b),
            _ => {
                return Err(StatementInsightError::Precondition(
                    "only descriptive tables can be unified; transaction tables must be appended"
                        .to_string(),
                ))
            }
        };

        let mut columns = a.columns().to_vec();
        for column in b.columns() {
            if !columns.contains(column) {
                columns.push(column.clone());
            }
        }

        let mut rows = a.project(&columns);
        rows.extend(b.project(&columns));
        let mut table = DescriptiveTable::new(columns, rows);
        let duplicates_removed = table.dedupe();
        table.sort_by_date();

        let source_documents: BTreeSet<String> = first
            .source_documents
            .union(&second.source_documents)
            .cloned()
            .collect();

        let mut insights = first.insights.clone();
        for snapshot in &second.insights {
            if !insights.contains(snapshot) {
                insights.push(snapshot.clone());
            }
        }

        let mut history = first.history.clone();
        history.extend(second.history.iter().cloned());
        history.push(TransformationStep::Unified {
            sources: source_documents.iter().cloned().collect(),
            duplicates_removed,
        });

        debug!(
            "Unified descriptive tables '{}' and '{}' into {} rows ({} duplicates removed)",
            first.title(),
            second.title(),
            table.len(),
            duplicates_removed
        );

        Ok(Ledger {
            body: LedgerBody::Descriptive(table),
            user_information: first.user_information.union(&second.user_information),
            source_documents,
            insights,
            history,
            revision: first.revision.max(second.revision) + 1,
        })
    }

    /// Accumulates another transaction ledger into this one: append, dedupe,
    /// re-sort by date. Both sides must be transaction tables.
    pub fn append_transactions(&mut self, other: Ledger) -> Result<()> {
        let incoming = match other.body {
            LedgerBody::Transaction(table) => table,
            LedgerBody::Descriptive(_) => {
                return Err(StatementInsightError::Precondition(
                    "cannot append a descriptive table to a transaction ledger".to_string(),
                ))
            }
        };
        let LedgerBody::Transaction(table) = &mut self.body else {
            return Err(StatementInsightError::Precondition(
                "cannot append transactions to a descriptive table".to_string(),
            ));
        };

        let rows = incoming.len();
        let duplicates_removed = table.append(incoming);
        info!(
            "Appended {} transactions ({} duplicates removed), ledger now has {} rows",
            rows,
            duplicates_removed,
            table.len()
        );

        self.user_information = self.user_information.union(&other.user_information);
        self.source_documents.extend(other.source_documents);
        self.history.extend(other.history);
        self.history.push(TransformationStep::TransactionsAppended {
            rows,
            duplicates_removed,
        });
        self.revision += 1;
        Ok(())
    }

    /// Computes the feature bundle. Only valid on a transaction table.
    pub fn extract_transaction_features(
        &self,
        aggregator: &FeatureAggregator,
    ) -> Result<BaseInsights> {
        match &self.body {
            LedgerBody::Transaction(table) => Ok(aggregator.aggregate(table)),
            LedgerBody::Descriptive(_) => Err(StatementInsightError::Precondition(format!(
                "feature extraction requires a transaction table, '{}' is descriptive",
                self.title()
            ))),
        }
    }

    /// Cached feature bundle. Recomputed when `refresh` is set or when the
    /// ledger changed since the last snapshot. Descriptive tables are skipped.
    pub fn base_insights(
        &mut self,
        aggregator: &FeatureAggregator,
        refresh: bool,
    ) -> Option<BaseInsights> {
        if !self.is_transaction_table() {
            debug!("Skipping feature extraction for descriptive table '{}'", self.title());
            return None;
        }

        if !refresh {
            if let Some(snapshot) = self.insights.last() {
                if snapshot.revision == self.revision {
                    return Some(snapshot.insights.clone());
                }
            }
        }

        let insights = self.extract_transaction_features(aggregator).ok()?;
        self.insights.push(InsightSnapshot {
            revision: self.revision,
            generated_at: Utc::now(),
            insights: insights.clone(),
        });
        Some(insights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn text(s: &str) -> Cell {
        Cell::Text(s.to_string())
    }

    fn descriptive(source: &str, rows: Vec<Vec<Cell>>) -> Ledger {
        let mut table = DescriptiveTable::new(vec!["date".into(), "item".into()], rows);
        table.normalize_dates();
        Ledger::new(
            LedgerBody::Descriptive(table),
            UserInformation::new(),
            source,
            Vec::new(),
        )
    }

    fn record(date: &str, description: &str, amount: f64) -> TransactionRecord {
        TransactionRecord {
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").ok(),
            description: description.to_string(),
            transaction_amount: Some(amount),
            tag: "groceries".to_string(),
            balance: None,
            extra: BTreeMap::new(),
        }
    }

    fn transactions(source: &str, records: Vec<TransactionRecord>) -> Ledger {
        Ledger::new(
            LedgerBody::Transaction(TransactionTable::new(records)),
            UserInformation::new(),
            source,
            Vec::new(),
        )
    }

    #[test]
    fn test_unify_collapses_shared_rows() {
        let a = vec![text("2023-01-01"), text("A")];
        let b = vec![text("2023-01-02"), text("B")];
        let c = vec![text("2023-01-03"), text("C")];
        let first = descriptive("one.pdf", vec![b.clone(), a]);
        let second = descriptive("two.pdf", vec![b, c]);

        let unified = Ledger::unify(&first, &second).unwrap();
        let table = unified.descriptive().unwrap();
        let items: Vec<String> = table.rows().iter().map(|r| r[1].to_string()).collect();

        assert_eq!(items, vec!["A", "B", "C"]);
        assert_eq!(
            unified.source_documents().iter().collect::<Vec<_>>(),
            vec!["one.pdf", "two.pdf"]
        );
        assert!(matches!(
            unified.history().last(),
            Some(TransformationStep::Unified { duplicates_removed: 1, .. })
        ));
    }

    #[test]
    fn test_unify_unions_columns_and_puts_undated_rows_last() {
        let first = descriptive("one.pdf", vec![vec![text("2023-03-01"), text("late")]]);
        let table = DescriptiveTable::new(
            vec!["item".into(), "note".into()],
            vec![vec![text("undated"), text("n")]],
        );
        let second = Ledger::new(
            LedgerBody::Descriptive(table),
            UserInformation::new(),
            "two.pdf",
            Vec::new(),
        );

        let unified = Ledger::unify(&second, &first).unwrap();
        let table = unified.descriptive().unwrap();
        assert_eq!(table.columns(), ["item", "note", "date"]);
        assert_eq!(table.rows()[0][0], text("late"));
        assert_eq!(table.rows()[1][0], text("undated"));
        assert_eq!(table.rows()[1][2], Cell::Empty);
    }

    #[test]
    fn test_unify_rejects_transaction_tables() {
        let txn = transactions("one.pdf", vec![record("2023-01-01", "Coffee", -3.0)]);
        let desc = descriptive("two.pdf", vec![vec![text("2023-01-01"), text("A")]]);

        assert!(matches!(
            Ledger::unify(&txn, &desc),
            Err(StatementInsightError::Precondition(_))
        ));
        assert!(matches!(
            Ledger::unify(&desc, &txn),
            Err(StatementInsightError::Precondition(_))
        ));
    }

    #[test]
    fn test_append_transactions_dedupes_and_sorts() {
        let mut ledger = transactions(
            "march.pdf",
            vec![
                record("2023-03-02", "Rent", -900.0),
                record("2023-03-05", "Coffee", -3.0),
            ],
        );
        let other = transactions(
            "feb.pdf",
            vec![
                record("2023-02-27", "Salary", 2500.0),
                record("2023-03-05", "Coffee", -3.0),
            ],
        );

        ledger.append_transactions(other).unwrap();

        let descriptions: Vec<&str> = ledger
            .transactions()
            .unwrap()
            .records()
            .iter()
            .map(|r| r.description.as_str())
            .collect();
        assert_eq!(descriptions, vec!["Salary", "Rent", "Coffee"]);
        assert_eq!(ledger.source_documents().len(), 2);
        assert_eq!(ledger.revision(), 1);
    }

    #[test]
    fn test_feature_extraction_requires_transactions() {
        let aggregator = FeatureAggregator::default();
        let mut desc = descriptive("one.pdf", vec![vec![text("2023-01-01"), text("A")]]);

        assert!(matches!(
            desc.extract_transaction_features(&aggregator),
            Err(StatementInsightError::Precondition(_))
        ));
        assert!(desc.base_insights(&aggregator, false).is_none());
    }

    #[test]
    fn test_base_insights_cached_until_ledger_changes() {
        let aggregator = FeatureAggregator::default();
        let mut ledger = transactions("a.pdf", vec![record("2023-01-01", "Coffee", -3.0)]);

        ledger.base_insights(&aggregator, false).unwrap();
        ledger.base_insights(&aggregator, false).unwrap();
        assert_eq!(ledger.insights().len(), 1);

        ledger.base_insights(&aggregator, true).unwrap();
        assert_eq!(ledger.insights().len(), 2);

        ledger
            .append_transactions(transactions("b.pdf", vec![record("2023-01-02", "Tea", -2.0)]))
            .unwrap();
        let fresh = ledger.base_insights(&aggregator, false).unwrap();
        assert_eq!(fresh.metadata.transaction_count, 2);
        assert_eq!(ledger.insights().len(), 3);
    }

    #[test]
    fn test_duplicate_rows_compare_by_value_and_type() {
        let rows = vec![
            vec![text("2023-01-01"), Cell::Number(1.0)],
            vec![text("2023-01-01"), text("1")],
            vec![text("2023-01-01"), Cell::Number(1.0)],
            vec![text("2023-01-01"), Cell::Number(0.1 + 0.2)],
            vec![text("2023-01-01"), Cell::Number(0.3)],
        ];
        let mut table = DescriptiveTable::new(vec!["date".into(), "item".into()], rows);

        assert_eq!(table.dedupe(), 1);
        assert_eq!(table.len(), 4);
        assert_eq!(table.rows()[1][1], text("1"));
    }

    #[test]
    fn test_append_treats_signed_zero_amounts_as_equal() {
        let mut ledger = transactions("a.pdf", vec![record("2023-01-01", "Fee reversal", 0.0)]);
        let mut other = record("2023-01-01", "Fee reversal", -0.0);
        other
            .extra
            .insert("reference".to_string(), Cell::Text("A1".to_string()));
        let twin = record("2023-01-01", "Fee reversal", -0.0);

        ledger
            .append_transactions(transactions("b.pdf", vec![other, twin]))
            .unwrap();

        let records = ledger.transactions().unwrap().records();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[1].extra.get("reference"),
            Some(&Cell::Text("A1".to_string()))
        );
    }
}
