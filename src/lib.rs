//! # Statement Insight Builder
//!
//! A library for turning tables extracted from bank-statement PDFs (via LLM)
//! into per-account-holder transaction ledgers, summary statistics and loan
//! recommendations.
//!
//! ## Core Concepts
//!
//! - **Raw Table**: A rectangular grid whose first row is the header, as returned by extraction
//! - **Ledger**: A normalized table plus the user information, source documents and
//!   transformation history that produced it
//! - **Transaction Table**: A ledger with dated, described, categorized and priced rows
//! - **Descriptive Table**: Any other table (balances, account summaries, fee schedules)
//! - **Account Holder**: Everything attributed to one name; account numbers link documents
//!   that don't print the name
//! - **Base Insights**: Grouped statistics over a holder's transactions, cached per revision
//!
//! ## Example
//!
//! ```rust,ignore
//! use statement_insight_builder::*;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let config = PipelineConfig::default();
//! let services = llm::services_from_env(&config)?;
//! let controller = AccountsController::new(services, &config)?;
//!
//! controller.ingest_document(Path::new("statements/march.pdf")).await?;
//! for name in controller.holder_names().await {
//!     let insights = controller.base_insights(&name, false).await?;
//!     println!("{}: {} transactions", name, insights.metadata.transaction_count);
//!     let recommendation = controller.recommendation(&name).await?;
//!     println!("{}", recommendation.recommendation);
//! }
//! ```

pub mod categories;
pub mod config;
pub mod dates;
pub mod error;
pub mod features;
pub mod holder;
pub mod identity;
pub mod ingestion;
pub mod ledger;
pub mod normalizer;
pub mod prompts;
pub mod recommendation;
pub mod schema;
pub mod services;
pub mod utils;
pub mod validator;

#[cfg(feature = "remote")]
pub mod llm;

#[cfg(test)]
mod testing;

pub use categories::{CategoryRecord, CategoryResolver, KeywordClassifier, RepairedCategory};
pub use config::PipelineConfig;
pub use dates::{normalize_dates, DateNormalizer};
pub use error::{ErrorKind, ErrorPayload, Result, StatementInsightError};
pub use features::{BaseInsights, FeatureAggregator, GroupStats, InsightMetadata};
pub use holder::AccountHolder;
pub use identity::{AccountRegistry, IdentityConflict, IdentityIndex, IngestOutcome};
pub use ingestion::{AccountsController, Services};
pub use ledger::{
    DescriptiveTable, Ledger, LedgerBody, LedgerKind, TransactionTable, TransformationStep,
};
pub use normalizer::{balances_to_amounts, Provenance, TableNormalizer};
pub use recommendation::{Decision, Recommendation, RecommendationAssembler, RecommendationInput};
pub use schema::*;
pub use services::{
    call_with_policy, CallPolicy, ExtractedTable, LanguageModel, StatementExtractor,
    TransactionClassifier,
};
pub use validator::{is_valid_table, validate_table};
