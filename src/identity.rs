//! Grouping ledgers into account holders without a stable customer key.
//!
//! A document is attributed to a holder as soon as any of its ledgers
//! carries a name, or an account number already tied to a name. Documents
//! that only carry unknown account numbers are parked until a later document
//! ties one of those numbers to a name.

use crate::error::{Result, StatementInsightError};
use crate::holder::AccountHolder;
use crate::ledger::Ledger;
use crate::utils::{collapse_whitespace, normalize_account_number};
use log::{error, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Two documents tied the same account number to different names. The first
/// registration is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityConflict {
    pub account_number: String,
    pub kept: String,
    pub rejected: String,
    pub document: String,
}

/// Account number → holder name, first seen wins.
#[derive(Debug, Clone, Default)]
pub struct IdentityIndex {
    names: HashMap<String, String>,
    conflicts: Vec<IdentityConflict>,
}

impl IdentityIndex {
    pub fn lookup(&self, account_number: &str) -> Option<&str> {
        self.names.get(account_number).map(String::as_str)
    }

    /// Returns false when the number already belongs to someone else.
    pub fn register(&mut self, account_number: &str, name: &str, document: &str) -> bool {
        match self.names.get(account_number) {
            None => {
                self.names
                    .insert(account_number.to_string(), name.to_string());
                true
            }
            Some(existing) if existing == name => true,
            Some(existing) => {
                warn!(
                    "Account {} is registered to '{}', ignoring '{}' from {}",
                    account_number, existing, name, document
                );
                self.conflicts.push(IdentityConflict {
                    account_number: account_number.to_string(),
                    kept: existing.clone(),
                    rejected: name.to_string(),
                    document: document.to_string(),
                });
                false
            }
        }
    }

    pub fn conflicts(&self) -> &[IdentityConflict] {
        &self.conflicts
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The document (and any parked documents it unlocked) went to `holder`.
    Attributed {
        holder: String,
        tables: usize,
        released_documents: Vec<String>,
    },
    /// No name yet; the document waits for one of its account numbers to be claimed.
    Deferred {
        document: String,
        account_numbers: Vec<String>,
    },
}

#[derive(Debug, Clone)]
struct DeferredDocument {
    source: String,
    account_numbers: Vec<String>,
    ledgers: Vec<Ledger>,
}

/// All holders plus the index and the parked documents. Callers serialize
/// access to it; nothing in here is safe to run concurrently.
#[derive(Debug, Default)]
pub struct AccountRegistry {
    holders: BTreeMap<String, AccountHolder>,
    index: IdentityIndex,
    deferred: Vec<DeferredDocument>,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attributes one document's ledgers (in document order) to a holder.
    pub fn resolve_document(&mut self, source: &str, ledgers: Vec<Ledger>) -> Result<IngestOutcome> {
        let mut account_numbers: Vec<String> = Vec::new();
        let mut name: Option<String> = None;

        for ledger in &ledgers {
            let numbers = ledger.user_information().account_numbers();
            if name.is_none() {
                name = ledger
                    .user_information()
                    .name()
                    .map(clean_name)
                    .filter(|n| !n.is_empty())
                    .or_else(|| {
                        numbers
                            .iter()
                            .find_map(|n| self.index.lookup(n).map(str::to_string))
                    });
            }
            for number in numbers {
                if !account_numbers.contains(&number) {
                    account_numbers.push(number);
                }
            }
        }

        match name {
            Some(name) => {
                let tables = ledgers.len();
                self.attribute(&name, source, &account_numbers, ledgers)?;
                let released_documents = self.release_deferred()?;
                info!(
                    "Attributed {} tables from {} to '{}'{}",
                    tables,
                    source,
                    name,
                    if released_documents.is_empty() {
                        String::new()
                    } else {
                        format!(", released {:?}", released_documents)
                    }
                );
                Ok(IngestOutcome::Attributed {
                    holder: name,
                    tables,
                    released_documents,
                })
            }
            None if !account_numbers.is_empty() => {
                info!(
                    "No holder name for {} yet, deferring on account numbers {:?}",
                    source, account_numbers
                );
                self.deferred.push(DeferredDocument {
                    source: source.to_string(),
                    account_numbers: account_numbers.clone(),
                    ledgers,
                });
                Ok(IngestOutcome::Deferred {
                    document: source.to_string(),
                    account_numbers,
                })
            }
            None => {
                error!(
                    "Discarding {} tables from {}: no holder name or account number",
                    ledgers.len(),
                    source
                );
                Err(StatementInsightError::IdentityResolution {
                    document: source.to_string(),
                })
            }
        }
    }

    fn attribute(
        &mut self,
        name: &str,
        source: &str,
        account_numbers: &[String],
        ledgers: Vec<Ledger>,
    ) -> Result<()> {
        for number in account_numbers {
            self.index.register(number, name, source);
        }
        let holder = self
            .holders
            .entry(name.to_string())
            .or_insert_with(|| AccountHolder::new(Some(name.to_string())));
        for ledger in ledgers {
            holder.add_table(ledger)?;
        }
        Ok(())
    }

    /// Attributes every parked document whose account number now has a
    /// name. Repeats until nothing more resolves, since a released document
    /// can register numbers that unlock another.
    fn release_deferred(&mut self) -> Result<Vec<String>> {
        let mut released = Vec::new();
        loop {
            let ready = self.deferred.iter().position(|doc| {
                doc.account_numbers
                    .iter()
                    .any(|n| self.index.lookup(n).is_some())
            });
            let Some(position) = ready else {
                break;
            };
            let doc = self.deferred.remove(position);
            let Some(name) = doc
                .account_numbers
                .iter()
                .find_map(|n| self.index.lookup(n).map(str::to_string))
            else {
                continue;
            };
            self.attribute(&name, &doc.source, &doc.account_numbers, doc.ledgers)?;
            released.push(doc.source);
        }
        Ok(released)
    }

    /// Gives up on every parked document, reporting each as unresolved.
    pub fn expire_deferred(&mut self) -> Vec<StatementInsightError> {
        self.deferred
            .drain(..)
            .map(|doc| {
                error!(
                    "Discarding {} tables from {}: account numbers {:?} never matched a name",
                    doc.ledgers.len(),
                    doc.source,
                    doc.account_numbers
                );
                StatementInsightError::IdentityResolution {
                    document: doc.source,
                }
            })
            .collect()
    }

    pub fn deferred_documents(&self) -> Vec<String> {
        self.deferred.iter().map(|doc| doc.source.clone()).collect()
    }

    pub fn holder_names(&self) -> Vec<String> {
        self.holders.keys().cloned().collect()
    }

    pub fn holder(&self, name: &str) -> Result<&AccountHolder> {
        self.holders
            .get(name)
            .ok_or_else(|| StatementInsightError::HolderNotFound(name.to_string()))
    }

    pub fn holder_mut(&mut self, name: &str) -> Result<&mut AccountHolder> {
        self.holders
            .get_mut(name)
            .ok_or_else(|| StatementInsightError::HolderNotFound(name.to_string()))
    }

    pub fn holder_for_account(&self, account_number: &str) -> Option<&str> {
        normalize_account_number(account_number).and_then(|n| self.index.lookup(&n))
    }

    pub fn index(&self) -> &IdentityIndex {
        &self.index
    }
}

fn clean_name(name: &str) -> String {
    collapse_whitespace(name.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{DescriptiveTable, LedgerBody};
    use crate::schema::{Cell, UserInformation};

    fn ledger(source: &str, pairs: &[(&str, &str)]) -> Ledger {
        let mut info = UserInformation::new();
        for (key, value) in pairs {
            info.insert(key, *value);
        }
        let table = DescriptiveTable::new(
            vec!["field".into()],
            vec![vec![Cell::Text(source.to_string())]],
        );
        Ledger::new(LedgerBody::Descriptive(table), info, source, Vec::new())
    }

    #[test]
    fn test_name_later_in_document_claims_earlier_tables() {
        let mut registry = AccountRegistry::new();
        let outcome = registry
            .resolve_document(
                "a.pdf",
                vec![
                    ledger("a.pdf", &[]),
                    ledger("a.pdf", &[("name", "Jane  Doe"), ("account_number", "111")]),
                ],
            )
            .unwrap();

        assert_eq!(
            outcome,
            IngestOutcome::Attributed {
                holder: "Jane Doe".to_string(),
                tables: 2,
                released_documents: vec![],
            }
        );
        assert_eq!(
            registry.holder("Jane Doe").unwrap().descriptive_tables().len(),
            2
        );
        assert_eq!(registry.holder_for_account("1-11"), Some("Jane Doe"));
    }

    #[test]
    fn test_account_number_resolves_through_index() {
        let mut registry = AccountRegistry::new();
        registry
            .resolve_document("a.pdf", vec![ledger("a.pdf", &[("name", "Jane Doe"), ("account_number", "111")])])
            .unwrap();
        let outcome = registry
            .resolve_document("b.pdf", vec![ledger("b.pdf", &[("account_number", "111")])])
            .unwrap();

        assert!(matches!(outcome, IngestOutcome::Attributed { ref holder, .. } if holder == "Jane Doe"));
        assert_eq!(registry.holder_names(), vec!["Jane Doe".to_string()]);
    }

    #[test]
    fn test_deferred_document_released_by_later_name() {
        let mut registry = AccountRegistry::new();
        let first = registry
            .resolve_document("a.pdf", vec![ledger("a.pdf", &[("account_number", "222")])])
            .unwrap();
        assert!(matches!(first, IngestOutcome::Deferred { .. }));
        assert_eq!(registry.deferred_documents(), vec!["a.pdf".to_string()]);
        assert!(registry.holder_names().is_empty());

        let second = registry
            .resolve_document(
                "b.pdf",
                vec![ledger("b.pdf", &[("name", "Ali Bin Abu"), ("account_number", "222")])],
            )
            .unwrap();

        assert_eq!(
            second,
            IngestOutcome::Attributed {
                holder: "Ali Bin Abu".to_string(),
                tables: 1,
                released_documents: vec!["a.pdf".to_string()],
            }
        );
        assert!(registry.deferred_documents().is_empty());
        assert_eq!(
            registry.holder("Ali Bin Abu").unwrap().descriptive_tables().len(),
            2
        );
    }

    #[test]
    fn test_unidentifiable_document_fails() {
        let mut registry = AccountRegistry::new();
        let result = registry.resolve_document("x.pdf", vec![ledger("x.pdf", &[])]);

        match result {
            Err(StatementInsightError::IdentityResolution { document }) => {
                assert_eq!(document, "x.pdf")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(registry.holder_names().is_empty());
    }

    #[test]
    fn test_first_seen_name_wins_on_conflict() {
        let mut registry = AccountRegistry::new();
        registry
            .resolve_document("a.pdf", vec![ledger("a.pdf", &[("name", "Jane Doe"), ("account_number", "333")])])
            .unwrap();
        registry
            .resolve_document("b.pdf", vec![ledger("b.pdf", &[("name", "John Roe"), ("account_number", "333")])])
            .unwrap();

        assert_eq!(registry.holder_for_account("333"), Some("Jane Doe"));
        assert_eq!(registry.index().conflicts().len(), 1);
        assert_eq!(registry.index().conflicts()[0].rejected, "John Roe");
    }

    #[test]
    fn test_expire_deferred_reports_each_document() {
        let mut registry = AccountRegistry::new();
        registry
            .resolve_document("a.pdf", vec![ledger("a.pdf", &[("account_number", "9")])])
            .unwrap();
        registry
            .resolve_document("b.pdf", vec![ledger("b.pdf", &[("account_number", "8")])])
            .unwrap();

        let errors = registry.expire_deferred();
        assert_eq!(errors.len(), 2);
        assert!(registry.deferred_documents().is_empty());
    }
}
