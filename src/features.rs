//! Grouped statistics over a holder's canonical transaction ledger.

use crate::config::PipelineConfig;
use crate::ledger::TransactionTable;
use crate::schema::TransactionRecord;
use crate::utils::{month_key, week_key};
use chrono::NaiveDate;
use log::debug;
use serde::Serialize;
use std::collections::BTreeMap;

/// Group key used for rows without a date in the month/week breakdowns.
pub const UNDATED_GROUP: &str = "undated";

/// Aggregate over one group. `count` is the number of rows in the group;
/// the numeric fields only consider rows with a known amount.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupStats {
    pub group: String,
    pub count: usize,
    pub sum: f64,
    pub mean: Option<f64>,
    pub max: Option<f64>,
    pub min: Option<f64>,
    /// Sample standard deviation; needs at least two amounts.
    pub std: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsightMetadata {
    pub transaction_count: usize,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub frequent_description_threshold: usize,
    pub undated_rows: usize,
    pub unpriced_rows: usize,
    pub total_inflow: f64,
    pub total_outflow: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BaseInsights {
    /// Only descriptions occurring more than the threshold, most frequent first.
    pub frequent_descriptions: Vec<GroupStats>,
    pub tags: Vec<GroupStats>,
    pub monthly: Vec<GroupStats>,
    pub weekly: Vec<GroupStats>,
    pub metadata: InsightMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureAggregator {
    frequent_description_threshold: usize,
}

impl Default for FeatureAggregator {
    fn default() -> Self {
        Self::new(3)
    }
}

impl FeatureAggregator {
    pub fn new(frequent_description_threshold: usize) -> Self {
        Self {
            frequent_description_threshold,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.frequent_description_threshold)
    }

    pub fn aggregate(&self, table: &TransactionTable) -> BaseInsights {
        let records = table.records();

        let mut frequent_descriptions: Vec<GroupStats> =
            group_by(records, |r| r.description.trim().to_string())
                .into_iter()
                .filter(|stats| stats.count > self.frequent_description_threshold)
                .collect();
        frequent_descriptions.sort_by(|a, b| b.count.cmp(&a.count).then(a.group.cmp(&b.group)));

        let tags = group_by(records, |r| r.tag.clone());
        let monthly = group_by(records, |r| {
            r.date.map(month_key).unwrap_or_else(|| UNDATED_GROUP.to_string())
        });
        let weekly = group_by(records, |r| {
            r.date.map(week_key).unwrap_or_else(|| UNDATED_GROUP.to_string())
        });

        let amounts: Vec<f64> = records.iter().filter_map(|r| r.transaction_amount).collect();
        let metadata = InsightMetadata {
            transaction_count: records.len(),
            first_date: records.iter().filter_map(|r| r.date).min(),
            last_date: records.iter().filter_map(|r| r.date).max(),
            frequent_description_threshold: self.frequent_description_threshold,
            undated_rows: records.iter().filter(|r| r.date.is_none()).count(),
            unpriced_rows: records.len() - amounts.len(),
            total_inflow: amounts.iter().filter(|a| **a > 0.0).sum(),
            total_outflow: amounts.iter().filter(|a| **a < 0.0).sum(),
        };

        debug!(
            "Aggregated {} transactions into {} tags, {} months, {} weeks, {} frequent descriptions",
            metadata.transaction_count,
            tags.len(),
            monthly.len(),
            weekly.len(),
            frequent_descriptions.len()
        );

        BaseInsights {
            frequent_descriptions,
            tags,
            monthly,
            weekly,
            metadata,
        }
    }
}

fn group_by<F>(records: &[TransactionRecord], key: F) -> Vec<GroupStats>
where
    F: Fn(&TransactionRecord) -> String,
{
    let mut groups: BTreeMap<String, (usize, Vec<f64>)> = BTreeMap::new();
    for record in records {
        let entry = groups.entry(key(record)).or_default();
        entry.0 += 1;
        if let Some(amount) = record.transaction_amount {
            entry.1.push(amount);
        }
    }

    groups
        .into_iter()
        .map(|(group, (count, values))| stats(group, count, &values))
        .collect()
}

fn stats(group: String, count: usize, values: &[f64]) -> GroupStats {
    let n = values.len();
    let sum: f64 = values.iter().sum();
    let mean = (n > 0).then(|| sum / n as f64);
    let std = match mean {
        Some(mean) if n > 1 => {
            let variance =
                values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
            Some(variance.sqrt())
        }
        _ => None,
    };

    GroupStats {
        group,
        count,
        sum,
        mean,
        max: values.iter().copied().reduce(f64::max),
        min: values.iter().copied().reduce(f64::min),
        std,
    }
}
