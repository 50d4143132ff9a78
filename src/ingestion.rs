use crate::categories::CategoryResolver;
use crate::config::PipelineConfig;
use crate::error::{Result, StatementInsightError};
use crate::features::{BaseInsights, FeatureAggregator};
use crate::identity::{AccountRegistry, IdentityConflict, IngestOutcome};
use crate::normalizer::{Provenance, TableNormalizer};
use crate::recommendation::{Recommendation, RecommendationAssembler};
use crate::schema::{RawTable, TitledTable, TransactionRecord, UserInformation, DEFAULT_TITLE};
use crate::services::{ExtractedTable, LanguageModel, StatementExtractor, TransactionClassifier};
use crate::validator::validate_table;
use futures::future::join_all;
use log::{debug, info, warn};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Service handles created once by the host and shared by every request.
#[derive(Clone)]
pub struct Services {
    pub extractor: Arc<dyn StatementExtractor>,
    pub classifier: Arc<dyn TransactionClassifier>,
    pub language_model: Arc<dyn LanguageModel>,
}

/// Entry point for the HTTP/CLI layer: ingests documents and answers
/// per-holder queries.
pub struct AccountsController {
    extractor: Arc<dyn StatementExtractor>,
    normalizer: TableNormalizer,
    assembler: RecommendationAssembler,
    aggregator: FeatureAggregator,
    registry: Mutex<AccountRegistry>,
}

impl AccountsController {
    pub fn new(services: Services, config: &PipelineConfig) -> Result<Self> {
        config.validate()?;
        let resolver = CategoryResolver::new(
            services.classifier,
            services.language_model.clone(),
            config,
        );
        Ok(Self {
            extractor: services.extractor,
            normalizer: TableNormalizer::new(Arc::new(resolver)),
            assembler: RecommendationAssembler::new(services.language_model, config.call_policy()),
            aggregator: FeatureAggregator::from_config(config),
            registry: Mutex::new(AccountRegistry::new()),
        })
    }

    /// Extracts, normalizes and attributes one document. Fails the whole
    /// document when no holder can be identified.
    pub async fn ingest_document(&self, document: &Path) -> Result<IngestOutcome> {
        let source = document.display().to_string();
        info!("Ingesting {}", source);
        let tables = self.extractor.extract(document).await?;
        self.ingest_extracted(&source, tables).await
    }

    /// Same as [`Self::ingest_document`] for tables that were already extracted.
    pub async fn ingest_extracted(
        &self,
        source: &str,
        tables: Vec<ExtractedTable>,
    ) -> Result<IngestOutcome> {
        let candidates = tables.len();
        let prepared: Vec<(RawTable, Provenance)> = tables
            .into_iter()
            .filter_map(|table| prepare(source, table))
            .collect();
        debug!(
            "{}: {} of {} extracted tables passed validation",
            source,
            prepared.len(),
            candidates
        );

        let ledgers = join_all(
            prepared
                .into_iter()
                .map(|(raw, provenance)| self.normalizer.normalize(raw, provenance)),
        )
        .await;

        let mut registry = self.registry.lock().await;
        registry.resolve_document(source, ledgers)
    }

    pub async fn holder_names(&self) -> Vec<String> {
        self.registry.lock().await.holder_names()
    }

    pub async fn holder_for_account(&self, account_number: &str) -> Option<String> {
        self.registry
            .lock()
            .await
            .holder_for_account(account_number)
            .map(str::to_string)
    }

    pub async fn base_insights(&self, name: &str, refresh: bool) -> Result<BaseInsights> {
        let mut registry = self.registry.lock().await;
        registry
            .holder_mut(name)?
            .base_insights(&self.aggregator, refresh)
            .ok_or_else(|| no_transactions(name))
    }

    /// The holder's canonical ledger, sorted by date.
    pub async fn transaction_table(&self, name: &str) -> Result<Vec<TransactionRecord>> {
        let registry = self.registry.lock().await;
        registry
            .holder(name)?
            .transaction_rows()
            .ok_or_else(|| no_transactions(name))
    }

    pub async fn descriptive_tables(&self, name: &str) -> Result<Vec<TitledTable>> {
        let registry = self.registry.lock().await;
        Ok(registry.holder(name)?.descriptive_tables_view())
    }

    /// Snapshots the holder under the lock, then calls the model without it.
    pub async fn recommendation(&self, name: &str) -> Result<Recommendation> {
        let input = {
            let mut registry = self.registry.lock().await;
            registry
                .holder_mut(name)?
                .recommendation_input(&self.aggregator)
        };
        self.assembler.recommend(&input).await
    }

    pub async fn consolidate(&self, name: &str) -> Result<usize> {
        let mut registry = self.registry.lock().await;
        registry.holder_mut(name)?.consolidate_descriptive_tables()
    }

    pub async fn deferred_documents(&self) -> Vec<String> {
        self.registry.lock().await.deferred_documents()
    }

    /// Drops every document still waiting for a name; one error per document.
    pub async fn expire_deferred(&self) -> Vec<StatementInsightError> {
        self.registry.lock().await.expire_deferred()
    }

    pub async fn identity_conflicts(&self) -> Vec<IdentityConflict> {
        self.registry.lock().await.index().conflicts().to_vec()
    }
}

fn prepare(source: &str, table: ExtractedTable) -> Option<(RawTable, Provenance)> {
    let raw = match validate_table(&table.table) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(
                "Skipping table #{} ('{}') from {}: {}",
                table.table_number, table.blurb, source, e
            );
            return None;
        }
    };
    let title = match table.blurb.trim() {
        "" => DEFAULT_TITLE.to_string(),
        blurb => blurb.to_string(),
    };
    Some((
        raw,
        Provenance {
            source: source.to_string(),
            title,
            user_information: UserInformation::from_json_object(&table.user_information),
        },
    ))
}

fn no_transactions(name: &str) -> StatementInsightError {
    StatementInsightError::InsufficientData(format!("'{}' has no transaction table", name))
}
