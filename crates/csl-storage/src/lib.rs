//! Persistence for the CSL mirror: the store contract plus Postgres and in-memory backends.

use async_trait::async_trait;
use csl_core::{EntityUpsert, LocalSearch, NewSearchQuery, ScreeningEntity, SearchQuery};
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryScreeningStore;
pub use postgres::PgScreeningStore;

pub const CRATE_NAME: &str = "csl-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("search query {0} not found")]
    SearchQueryNotFound(Uuid),
}

/// Result of reconciling one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub entity: ScreeningEntity,
    pub created: bool,
}

/// Storage contract for the mirror.
///
/// `upsert_entity` must be atomic: the find-or-create, scalar overwrite and
/// child replacement are never observable half-done.
#[async_trait]
pub trait ScreeningStore: Send + Sync {
    async fn upsert_entity(&self, upsert: EntityUpsert) -> Result<UpsertOutcome, StoreError>;

    async fn get_entity(&self, id: Uuid) -> Result<Option<ScreeningEntity>, StoreError>;

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<ScreeningEntity>, StoreError>;

    async fn count_entities(&self) -> Result<i64, StoreError>;

    async fn search_local(&self, search: &LocalSearch) -> Result<Vec<ScreeningEntity>, StoreError>;

    /// Distinct source list codes present in the mirror, sorted.
    async fn source_lists(&self) -> Result<Vec<String>, StoreError>;

    /// Distinct non-empty address countries, sorted.
    async fn countries(&self) -> Result<Vec<String>, StoreError>;

    /// Persist an audit row with `results_count = 0`.
    async fn record_search(&self, query: NewSearchQuery) -> Result<SearchQuery, StoreError>;

    async fn update_results_count(&self, id: Uuid, results_count: i64) -> Result<(), StoreError>;

    /// Audit rows, newest first.
    async fn search_history(&self, limit: u32) -> Result<Vec<SearchQuery>, StoreError>;
}
