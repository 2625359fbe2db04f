use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use csl_core::{EntityUpsert, LocalSearch, NewSearchQuery, ScreeningEntity, SearchQuery};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{ScreeningStore, StoreError, UpsertOutcome};

/// Process-local store. Each operation runs under one lock, so an upsert is atomic
/// with respect to every other caller.
#[derive(Debug, Default)]
pub struct MemoryScreeningStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    entities: Vec<ScreeningEntity>,
    searches: Vec<SearchQuery>,
}

impl MemoryScreeningStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches_local(entity: &ScreeningEntity, search: &LocalSearch) -> bool {
    if let Some(q) = search.q.as_deref().filter(|q| !q.is_empty()) {
        let needle = q.to_lowercase();
        let hit = entity.fields.name.to_lowercase().contains(&needle)
            || entity
                .fields
                .alt_names
                .iter()
                .any(|alt| alt.to_lowercase().contains(&needle));
        if !hit {
            return false;
        }
    }
    if let Some(source_list) = search.source_list.as_deref().filter(|s| !s.is_empty()) {
        if entity.fields.source_list != source_list {
            return false;
        }
    }
    if let Some(country) = search.country.as_deref().filter(|c| !c.is_empty()) {
        let hit = entity.addresses.iter().any(|a| {
            a.country
                .as_deref()
                .is_some_and(|c| c.to_lowercase() == country.to_lowercase())
        });
        if !hit {
            return false;
        }
    }
    true
}

#[async_trait]
impl ScreeningStore for MemoryScreeningStore {
    async fn upsert_entity(&self, upsert: EntityUpsert) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let EntityUpsert {
            external_id,
            fields,
            addresses,
            ids,
        } = upsert;

        if let Some(entity) = state
            .entities
            .iter_mut()
            .find(|e| e.external_id == external_id)
        {
            let entity_id = entity.id;
            entity.fields = fields;
            entity.updated_at = now;
            entity.addresses = addresses
                .into_iter()
                .map(|a| a.into_address(entity_id))
                .collect();
            entity.ids = ids.into_iter().map(|d| d.into_document(entity_id)).collect();
            return Ok(UpsertOutcome {
                entity: entity.clone(),
                created: false,
            });
        }

        let entity_id = Uuid::new_v4();
        let entity = ScreeningEntity {
            id: entity_id,
            external_id,
            fields,
            created_at: now,
            updated_at: now,
            addresses: addresses
                .into_iter()
                .map(|a| a.into_address(entity_id))
                .collect(),
            ids: ids.into_iter().map(|d| d.into_document(entity_id)).collect(),
        };
        state.entities.push(entity.clone());
        Ok(UpsertOutcome {
            entity,
            created: true,
        })
    }

    async fn get_entity(&self, id: Uuid) -> Result<Option<ScreeningEntity>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.entities.iter().find(|e| e.id == id).cloned())
    }

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<ScreeningEntity>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .entities
            .iter()
            .find(|e| e.external_id == external_id)
            .cloned())
    }

    async fn count_entities(&self) -> Result<i64, StoreError> {
        Ok(self.state.lock().await.entities.len() as i64)
    }

    async fn search_local(&self, search: &LocalSearch) -> Result<Vec<ScreeningEntity>, StoreError> {
        let state = self.state.lock().await;
        let mut hits = state
            .entities
            .iter()
            .filter(|e| matches_local(e, search))
            .cloned()
            .collect::<Vec<_>>();
        hits.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        hits.truncate(search.effective_limit() as usize);
        Ok(hits)
    }

    async fn source_lists(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        let lists = state
            .entities
            .iter()
            .map(|e| e.fields.source_list.clone())
            .collect::<BTreeSet<_>>();
        Ok(lists.into_iter().collect())
    }

    async fn countries(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        let countries = state
            .entities
            .iter()
            .flat_map(|e| e.addresses.iter())
            .filter_map(|a| a.country.clone())
            .filter(|c| !c.is_empty())
            .collect::<BTreeSet<_>>();
        Ok(countries.into_iter().collect())
    }

    async fn record_search(&self, query: NewSearchQuery) -> Result<SearchQuery, StoreError> {
        let row = SearchQuery {
            id: Uuid::new_v4(),
            query_text: query.query_text,
            results_count: 0,
            user: query.user,
            timestamp: Utc::now(),
            search_params: query.search_params,
        };
        self.state.lock().await.searches.push(row.clone());
        Ok(row)
    }

    async fn update_results_count(&self, id: Uuid, results_count: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let row = state
            .searches
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(StoreError::SearchQueryNotFound(id))?;
        row.results_count = results_count;
        Ok(())
    }

    async fn search_history(&self, limit: u32) -> Result<Vec<SearchQuery>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .searches
            .iter()
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }
}
