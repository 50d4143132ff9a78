use crate::utils::{collapse_whitespace, normalize_account_number, parse_amount};
use chrono::NaiveDate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize, Serializer};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub const DATE_COLUMN: &str = "date";
pub const DESCRIPTION_COLUMN: &str = "description";
pub const AMOUNT_COLUMN: &str = "transaction_amount";
pub const BALANCE_COLUMN: &str = "balance";
pub const TAG_COLUMN: &str = "tag";
/// Column the stage-1 classifier writes into before it is renamed to [`TAG_COLUMN`].
pub const CLASSIFIED_COLUMN: &str = "txn_category";

pub const NAME_KEY: &str = "name";
pub const ACCOUNT_NUMBER_KEY: &str = "account_number";
pub const TITLE_KEY: &str = "title";
pub const DEFAULT_TITLE: &str = "main table";

/// A single table cell as it travels through the pipeline.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Cell {
    #[default]
    Empty,
    Text(String),
    Number(f64),
    Date(NaiveDate),
}

impl Cell {
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Cell::Empty,
            serde_json::Value::Bool(b) => Cell::Text(b.to_string()),
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => Cell::Number(f),
                None => Cell::Text(n.to_string()),
            },
            serde_json::Value::String(s) => {
                if s.trim().is_empty() {
                    Cell::Empty
                } else {
                    Cell::Text(s.clone())
                }
            }
            other => Cell::Text(other.to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Cell::Empty)
    }

    /// Text form of the cell; dates render as ISO `YYYY-MM-DD`.
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Cell::Empty => None,
            Cell::Text(s) => Some(Cow::Borrowed(s.as_str())),
            Cell::Number(n) => Some(Cow::Owned(n.to_string())),
            Cell::Date(d) => Some(Cow::Owned(d.format("%Y-%m-%d").to_string())),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Cell::Number(n) => Some(*n),
            Cell::Text(s) => parse_amount(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Cell::Empty => serde_json::Value::Null,
            Cell::Text(s) => serde_json::Value::String(s.clone()),
            Cell::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Cell::Date(d) => serde_json::Value::String(d.format("%Y-%m-%d").to_string()),
        }
    }
}

/// Hashable identity of a cell used when collapsing duplicate rows.
/// Numbers compare by bit pattern, with `-0.0` folded into `0.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum CellKey {
    Empty,
    Text(String),
    Number(u64),
    Date(NaiveDate),
}

fn number_bits(n: f64) -> u64 {
    if n == 0.0 {
        0.0f64.to_bits()
    } else {
        n.to_bits()
    }
}

impl Cell {
    pub(crate) fn dedupe_key(&self) -> CellKey {
        match self {
            Cell::Empty => CellKey::Empty,
            Cell::Text(s) => CellKey::Text(s.clone()),
            Cell::Number(n) => CellKey::Number(number_bits(*n)),
            Cell::Date(d) => CellKey::Date(*d),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_text() {
            Some(text) => f.write_str(&text),
            None => Ok(()),
        }
    }
}

impl Serialize for Cell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Cell::Empty => serializer.serialize_none(),
            Cell::Text(s) => serializer.serialize_str(s),
            Cell::Number(n) => serializer.serialize_f64(*n),
            Cell::Date(d) => serializer.collect_str(&d.format("%Y-%m-%d")),
        }
    }
}

/// A table that passed the shape check: a header row plus at least one data
/// row, every row the same width. Only [`crate::validator`] constructs these.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTable {
    pub(crate) header: Vec<Cell>,
    pub(crate) rows: Vec<Vec<Cell>>,
}

impl RawTable {
    pub fn header(&self) -> &[Cell] {
        &self.header
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn width(&self) -> usize {
        self.header.len()
    }

    /// Splits the table into lowercased, trimmed column names and data rows.
    pub fn into_normalized_parts(self) -> (Vec<String>, Vec<Vec<Cell>>) {
        let columns = self
            .header
            .iter()
            .map(|cell| {
                cell.as_text()
                    .map(|t| collapse_whitespace(&t).to_lowercase())
                    .unwrap_or_default()
            })
            .collect();
        (columns, self.rows)
    }
}

/// A user-information value: one string, or the set of strings collected
/// when several sources disagreed on the same key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(BTreeSet<String>),
}

impl OneOrMany {
    pub fn values(&self) -> Vec<&str> {
        match self {
            OneOrMany::One(v) => vec![v.as_str()],
            OneOrMany::Many(set) => set.iter().map(String::as_str).collect(),
        }
    }

    pub fn first(&self) -> Option<&str> {
        self.values().into_iter().next()
    }

    pub fn contains(&self, value: &str) -> bool {
        self.values().contains(&value)
    }

    /// Set union; collapses back to `One` when only a single distinct value remains.
    pub fn union(&self, other: &OneOrMany) -> OneOrMany {
        let mut merged: BTreeSet<String> = self.values().into_iter().map(String::from).collect();
        merged.extend(other.values().into_iter().map(String::from));
        Self::from_set(merged)
    }

    fn from_set(mut set: BTreeSet<String>) -> OneOrMany {
        if set.len() == 1 {
            if let Some(only) = set.pop_first() {
                return OneOrMany::One(only);
            }
        }
        OneOrMany::Many(set)
    }
}

/// Free-form facts about the account holder attached to a table
/// (name, account number, account type, period balances, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct UserInformation(BTreeMap<String, OneOrMany>);

impl UserInformation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds from an extractor's JSON object. Keys are lowercased, empty and
    /// null values are dropped (extractors report unfound fields as `""`).
    pub fn from_json_object(object: &serde_json::Map<String, serde_json::Value>) -> Self {
        let mut info = Self::new();
        for (key, value) in object {
            match value {
                serde_json::Value::Array(items) => {
                    for item in items {
                        if let Some(text) = json_scalar_text(item) {
                            info.insert(key, text);
                        }
                    }
                }
                other => {
                    if let Some(text) = json_scalar_text(other) {
                        info.insert(key, text);
                    }
                }
            }
        }
        info
    }

    /// Adds a value under `key`, unioning with anything already present.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        let value = value.trim();
        let key = key.trim().to_lowercase();
        if value.is_empty() || key.is_empty() {
            return;
        }
        let incoming = OneOrMany::One(value.to_string());
        let merged = match self.0.get(&key) {
            Some(existing) => existing.union(&incoming),
            None => incoming,
        };
        self.0.insert(key, merged);
    }

    /// Replaces whatever is stored under `key`.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.0.remove(&key.trim().to_lowercase());
        self.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&OneOrMany> {
        self.0.get(key)
    }

    pub fn name(&self) -> Option<&str> {
        self.get(NAME_KEY).and_then(OneOrMany::first)
    }

    pub fn title(&self) -> Option<&str> {
        self.get(TITLE_KEY).and_then(OneOrMany::first)
    }

    /// Account numbers with spacing and separators removed.
    pub fn account_numbers(&self) -> Vec<String> {
        self.get(ACCOUNT_NUMBER_KEY)
            .map(|v| {
                v.values()
                    .into_iter()
                    .filter_map(normalize_account_number)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn union(&self, other: &UserInformation) -> UserInformation {
        let mut merged = self.0.clone();
        for (key, value) in &other.0 {
            let combined = match merged.get(key) {
                Some(existing) => existing.union(value),
                None => value.clone(),
            };
            merged.insert(key.clone(), combined);
        }
        UserInformation(merged)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OneOrMany)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn json_scalar_text(value: &serde_json::Value) -> Option<String> {
    let text = match value {
        serde_json::Value::Null => return None,
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// One row of the canonical transaction ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionRecord {
    pub date: Option<NaiveDate>,
    pub description: String,
    pub transaction_amount: Option<f64>,
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<f64>,
    /// Source columns outside the canonical schema, kept verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Cell>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct RecordKey {
    date: Option<NaiveDate>,
    description: String,
    transaction_amount: Option<u64>,
    tag: String,
    balance: Option<u64>,
    extra: Vec<(String, CellKey)>,
}

impl TransactionRecord {
    /// Two records with equal keys are the same transaction seen twice.
    pub(crate) fn dedupe_key(&self) -> RecordKey {
        RecordKey {
            date: self.date,
            description: self.description.clone(),
            transaction_amount: self.transaction_amount.map(number_bits),
            tag: self.tag.clone(),
            balance: self.balance.map(number_bits),
            extra: self
                .extra
                .iter()
                .map(|(column, cell)| (column.clone(), cell.dedupe_key()))
                .collect(),
        }
    }
}

/// A descriptive table as exposed to consumers, tagged with its title.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TitledTable {
    pub title: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl TitledTable {
    /// Rows as column-name → cell records.
    pub fn records(&self) -> Vec<BTreeMap<String, Cell>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }
}
