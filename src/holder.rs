use crate::error::Result;
use crate::features::{BaseInsights, FeatureAggregator};
use crate::ledger::Ledger;
use crate::recommendation::RecommendationInput;
use crate::schema::{TitledTable, TransactionRecord};
use log::debug;
use std::collections::BTreeSet;

/// Identity bucket for one customer: every ledger attributed to them.
#[derive(Debug, Clone, Default)]
pub struct AccountHolder {
    name: Option<String>,
    account_ids: BTreeSet<String>,
    descriptive_tables: Vec<Ledger>,
    transaction_table: Option<Ledger>,
}

impl AccountHolder {
    pub fn new(name: Option<String>) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn account_ids(&self) -> &BTreeSet<String> {
        &self.account_ids
    }

    pub fn descriptive_tables(&self) -> &[Ledger] {
        &self.descriptive_tables
    }

    pub fn transaction_table(&self) -> Option<&Ledger> {
        self.transaction_table.as_ref()
    }

    /// Routes a ledger by kind and back-fills the name and account ids from
    /// its user information. A second transaction ledger is appended to the
    /// first (append, dedupe, re-sort), never unified.
    pub fn add_table(&mut self, ledger: Ledger) -> Result<()> {
        let info = ledger.user_information();
        if self.name.is_none() {
            self.name = info.name().map(str::to_string);
        }
        self.account_ids.extend(info.account_numbers());

        if !ledger.is_transaction_table() {
            self.descriptive_tables.push(ledger);
            return Ok(());
        }

        match self.transaction_table.as_mut() {
            Some(existing) => existing.append_transactions(ledger)?,
            None => self.transaction_table = Some(ledger),
        }
        Ok(())
    }

    pub fn base_insights(
        &mut self,
        aggregator: &FeatureAggregator,
        refresh: bool,
    ) -> Option<BaseInsights> {
        self.transaction_table
            .as_mut()
            .and_then(|ledger| ledger.base_insights(aggregator, refresh))
    }

    pub fn transaction_rows(&self) -> Option<Vec<TransactionRecord>> {
        self.transaction_table
            .as_ref()
            .and_then(Ledger::transactions)
            .map(|table| table.records().to_vec())
    }

    pub fn descriptive_tables_view(&self) -> Vec<TitledTable> {
        self.descriptive_tables
            .iter()
            .filter_map(Ledger::titled_table)
            .collect()
    }

    /// Unifies descriptive tables that share a title and the same set of
    /// columns. Returns how many tables were merged away.
    pub fn consolidate_descriptive_tables(&mut self) -> Result<usize> {
        let mut consolidated: Vec<Ledger> = Vec::with_capacity(self.descriptive_tables.len());
        let mut merged = 0;

        for ledger in std::mem::take(&mut self.descriptive_tables) {
            let key = consolidation_key(&ledger);
            match consolidated
                .iter_mut()
                .find(|existing| consolidation_key(existing) == key)
            {
                Some(existing) => {
                    *existing = Ledger::unify(existing, &ledger)?;
                    merged += 1;
                }
                None => consolidated.push(ledger),
            }
        }

        debug!(
            "Consolidated descriptive tables for {:?}: {} merged, {} remain",
            self.name,
            merged,
            consolidated.len()
        );
        self.descriptive_tables = consolidated;
        Ok(merged)
    }

    /// Snapshot of everything the recommendation needs. Computes (or reuses)
    /// the cached base insights on the way.
    pub fn recommendation_input(&mut self, aggregator: &FeatureAggregator) -> RecommendationInput {
        RecommendationInput {
            holder_name: self.name.clone().unwrap_or_default(),
            base_insights: self.base_insights(aggregator, false),
            descriptive_tables: self.descriptive_tables_view(),
            transactions: self.transaction_rows(),
        }
    }
}

fn consolidation_key(ledger: &Ledger) -> (String, BTreeSet<String>) {
    let columns = ledger
        .descriptive()
        .map(|table| table.columns().iter().cloned().collect())
        .unwrap_or_default();
    (ledger.title().to_string(), columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{DescriptiveTable, LedgerBody, TransactionTable};
    use crate::schema::{Cell, UserInformation, TITLE_KEY};
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn info(pairs: &[(&str, &str)]) -> UserInformation {
        let mut info = UserInformation::new();
        for (key, value) in pairs {
            info.insert(key, *value);
        }
        info
    }

    fn txn_ledger(source: &str, day: u32, user: UserInformation) -> Ledger {
        let record = TransactionRecord {
            date: NaiveDate::from_ymd_opt(2023, 1, day),
            description: format!("Purchase {}", day),
            transaction_amount: Some(-10.0),
            tag: "shopping".to_string(),
            balance: None,
            extra: BTreeMap::new(),
        };
        Ledger::new(
            LedgerBody::Transaction(TransactionTable::new(vec![record])),
            user,
            source,
            Vec::new(),
        )
    }

    fn summary(source: &str, title: &str, value: &str) -> Ledger {
        let table = DescriptiveTable::new(
            vec!["field".into(), "value".into()],
            vec![vec![Cell::Text("closing".into()), Cell::Text(value.into())]],
        );
        Ledger::new(
            LedgerBody::Descriptive(table),
            info(&[(TITLE_KEY, title)]),
            source,
            Vec::new(),
        )
    }

    #[test]
    fn test_add_table_routes_and_backfills() {
        let mut holder = AccountHolder::new(None);
        holder
            .add_table(summary("a.pdf", "account summary", "10"))
            .unwrap();
        assert_eq!(holder.name(), None);

        holder
            .add_table(txn_ledger(
                "a.pdf",
                2,
                info(&[("name", "Jane Doe"), ("account_number", "12-34")]),
            ))
            .unwrap();
        holder
            .add_table(txn_ledger("b.pdf", 1, info(&[("name", "J. Doe")])))
            .unwrap();

        assert_eq!(holder.name(), Some("Jane Doe"));
        assert!(holder.account_ids().contains("1234"));
        assert_eq!(holder.descriptive_tables().len(), 1);

        let rows = holder.transaction_rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].description, "Purchase 1");
    }

    #[test]
    fn test_consolidates_matching_descriptive_tables() {
        let mut holder = AccountHolder::new(Some("Jane Doe".into()));
        holder.add_table(summary("a.pdf", "account summary", "10")).unwrap();
        holder.add_table(summary("b.pdf", "account summary", "20")).unwrap();
        holder.add_table(summary("c.pdf", "fees", "1")).unwrap();

        assert_eq!(holder.consolidate_descriptive_tables().unwrap(), 1);

        let view = holder.descriptive_tables_view();
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].title, "account summary");
        assert_eq!(view[0].rows.len(), 2);
        assert_eq!(view[1].title, "fees");
    }

    #[test]
    fn test_recommendation_input_snapshot() {
        let aggregator = FeatureAggregator::default();
        let mut holder = AccountHolder::new(Some("Jane Doe".into()));
        let empty = holder.recommendation_input(&aggregator);
        assert!(empty.base_insights.is_none());
        assert!(empty.transactions.is_none());

        holder
            .add_table(txn_ledger("a.pdf", 3, UserInformation::new()))
            .unwrap();
        let input = holder.recommendation_input(&aggregator);
        assert_eq!(input.holder_name, "Jane Doe");
        assert_eq!(input.base_insights.unwrap().metadata.transaction_count, 1);
    }
}
