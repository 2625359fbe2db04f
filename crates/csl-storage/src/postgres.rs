use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use csl_core::{
    Address, EntityFields, EntityUpsert, IdentityDocument, LocalSearch, NewSearchQuery,
    ScreeningEntity, SearchParams, SearchQuery,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::{ScreeningStore, StoreError, UpsertOutcome};

const ENTITY_COLUMNS: &str = r#"
    id, external_id, name, alt_names, source_list, source_information_url,
    source_list_url, programs, federal_register_notice, start_date, end_date,
    remarks, entity_number, sdn_type, score, created_at, updated_at
"#;

/// Postgres-backed store. Schema lives in `migrations/`.
#[derive(Debug, Clone)]
pub struct PgScreeningStore {
    pool: PgPool,
}

impl PgScreeningStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn upsert_in_tx(&self, upsert: EntityUpsert) -> Result<UpsertOutcome, StoreError> {
        let EntityUpsert {
            external_id,
            fields,
            addresses,
            ids,
        } = upsert;

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO screening_entities (
                id, external_id, name, alt_names, source_list, source_information_url,
                source_list_url, programs, federal_register_notice, start_date, end_date,
                remarks, entity_number, sdn_type, score, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, NOW(), NOW())
            ON CONFLICT (external_id) DO UPDATE
               SET name = EXCLUDED.name,
                   alt_names = EXCLUDED.alt_names,
                   source_list = EXCLUDED.source_list,
                   source_information_url = EXCLUDED.source_information_url,
                   source_list_url = EXCLUDED.source_list_url,
                   programs = EXCLUDED.programs,
                   federal_register_notice = EXCLUDED.federal_register_notice,
                   start_date = EXCLUDED.start_date,
                   end_date = EXCLUDED.end_date,
                   remarks = EXCLUDED.remarks,
                   entity_number = EXCLUDED.entity_number,
                   sdn_type = EXCLUDED.sdn_type,
                   score = EXCLUDED.score,
                   updated_at = NOW()
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&external_id)
        .bind(&fields.name)
        .bind(Json(&fields.alt_names))
        .bind(&fields.source_list)
        .bind(&fields.source_information_url)
        .bind(&fields.source_list_url)
        .bind(Json(&fields.programs))
        .bind(&fields.federal_register_notice)
        .bind(fields.start_date)
        .bind(fields.end_date)
        .bind(&fields.remarks)
        .bind(&fields.entity_number)
        .bind(&fields.sdn_type)
        .bind(fields.score)
        .fetch_one(&mut *tx)
        .await?;

        let entity_id: Uuid = row.try_get("id")?;
        let created: bool = row.try_get("inserted")?;

        if !created {
            let removed_addresses = sqlx::query("DELETE FROM addresses WHERE entity_id = $1")
                .bind(entity_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            let removed_ids = sqlx::query("DELETE FROM entity_ids WHERE entity_id = $1")
                .bind(entity_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            debug!(%entity_id, removed_addresses, removed_ids, "cleared child rows");
        }

        for (ordinal, address) in addresses.into_iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO addresses (id, entity_id, ordinal, address, city, state, country, postal_code)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(entity_id)
            .bind(ordinal as i32)
            .bind(address.address)
            .bind(address.city)
            .bind(address.state)
            .bind(address.country)
            .bind(address.postal_code)
            .execute(&mut *tx)
            .await?;
        }

        for (ordinal, document) in ids.into_iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO entity_ids (
                    id, entity_id, ordinal, id_type, id_number, id_country, issue_date, expiration_date
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(entity_id)
            .bind(ordinal as i32)
            .bind(document.id_type)
            .bind(document.id_number)
            .bind(document.id_country)
            .bind(document.issue_date)
            .bind(document.expiration_date)
            .execute(&mut *tx)
            .await?;
        }

        let entity = load_entity_by_id(&mut *tx, entity_id)
            .await?
            .ok_or(StoreError::Database(sqlx::Error::RowNotFound))?;
        tx.commit().await?;

        Ok(UpsertOutcome { entity, created })
    }
}

fn entity_from_row(row: &PgRow) -> Result<ScreeningEntity, StoreError> {
    let alt_names: Json<Vec<String>> = row.try_get("alt_names")?;
    let programs: Json<Vec<String>> = row.try_get("programs")?;
    Ok(ScreeningEntity {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        fields: EntityFields {
            name: row.try_get("name")?,
            alt_names: alt_names.0,
            source_list: row.try_get("source_list")?,
            source_information_url: row.try_get("source_information_url")?,
            source_list_url: row.try_get("source_list_url")?,
            programs: programs.0,
            federal_register_notice: row.try_get("federal_register_notice")?,
            start_date: row.try_get::<Option<NaiveDate>, _>("start_date")?,
            end_date: row.try_get::<Option<NaiveDate>, _>("end_date")?,
            remarks: row.try_get("remarks")?,
            entity_number: row.try_get("entity_number")?,
            sdn_type: row.try_get("sdn_type")?,
            score: row.try_get("score")?,
        },
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        addresses: Vec::new(),
        ids: Vec::new(),
    })
}

fn search_query_from_row(row: &PgRow) -> Result<SearchQuery, StoreError> {
    let params: Json<SearchParams> = row.try_get("search_params")?;
    Ok(SearchQuery {
        id: row.try_get("id")?,
        query_text: row.try_get("query_text")?,
        results_count: row.try_get("results_count")?,
        user: row.try_get("username")?,
        timestamp: row.try_get("timestamp")?,
        search_params: params.0,
    })
}

/// Attach addresses and identity documents to already-loaded entities, preserving
/// insertion order.
async fn attach_children(
    conn: &mut PgConnection,
    entities: &mut [ScreeningEntity],
) -> Result<(), StoreError> {
    if entities.is_empty() {
        return Ok(());
    }
    let ids = entities.iter().map(|e| e.id).collect::<Vec<_>>();

    let address_rows = sqlx::query(
        r#"
        SELECT id, entity_id, address, city, state, country, postal_code
          FROM addresses
         WHERE entity_id = ANY($1)
         ORDER BY entity_id, ordinal
        "#,
    )
    .bind(ids.as_slice())
    .fetch_all(&mut *conn)
    .await?;

    let mut addresses: HashMap<Uuid, Vec<Address>> = HashMap::new();
    for row in address_rows {
        let entity_id: Uuid = row.try_get("entity_id")?;
        addresses.entry(entity_id).or_default().push(Address {
            id: row.try_get("id")?,
            entity_id,
            address: row.try_get("address")?,
            city: row.try_get("city")?,
            state: row.try_get("state")?,
            country: row.try_get("country")?,
            postal_code: row.try_get("postal_code")?,
        });
    }

    let document_rows = sqlx::query(
        r#"
        SELECT id, entity_id, id_type, id_number, id_country, issue_date, expiration_date
          FROM entity_ids
         WHERE entity_id = ANY($1)
         ORDER BY entity_id, ordinal
        "#,
    )
    .bind(ids.as_slice())
    .fetch_all(&mut *conn)
    .await?;

    let mut documents: HashMap<Uuid, Vec<IdentityDocument>> = HashMap::new();
    for row in document_rows {
        let entity_id: Uuid = row.try_get("entity_id")?;
        documents.entry(entity_id).or_default().push(IdentityDocument {
            id: row.try_get("id")?,
            entity_id,
            id_type: row.try_get("id_type")?,
            id_number: row.try_get("id_number")?,
            id_country: row.try_get("id_country")?,
            issue_date: row.try_get("issue_date")?,
            expiration_date: row.try_get("expiration_date")?,
        });
    }

    for entity in entities.iter_mut() {
        entity.addresses = addresses.remove(&entity.id).unwrap_or_default();
        entity.ids = documents.remove(&entity.id).unwrap_or_default();
    }
    Ok(())
}

async fn load_entity_by_id(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<ScreeningEntity>, StoreError> {
    let sql = format!("SELECT {ENTITY_COLUMNS} FROM screening_entities WHERE id = $1");
    let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
    with_children(conn, row).await
}

async fn load_entity_by_external_id(
    conn: &mut PgConnection,
    external_id: &str,
) -> Result<Option<ScreeningEntity>, StoreError> {
    let sql = format!("SELECT {ENTITY_COLUMNS} FROM screening_entities WHERE external_id = $1");
    let row = sqlx::query(&sql)
        .bind(external_id)
        .fetch_optional(&mut *conn)
        .await?;
    with_children(conn, row).await
}

async fn with_children(
    conn: &mut PgConnection,
    row: Option<PgRow>,
) -> Result<Option<ScreeningEntity>, StoreError> {
    let Some(row) = row else {
        return Ok(None);
    };
    let mut entities = vec![entity_from_row(&row)?];
    attach_children(conn, &mut entities).await?;
    Ok(entities.pop())
}

/// Escape LIKE metacharacters so user input matches literally.
fn like_pattern(q: &str) -> String {
    let escaped = q
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

#[async_trait]
impl ScreeningStore for PgScreeningStore {
    async fn upsert_entity(&self, upsert: EntityUpsert) -> Result<UpsertOutcome, StoreError> {
        let span = info_span!("pg_upsert_entity", external_id = %upsert.external_id);
        self.upsert_in_tx(upsert).instrument(span).await
    }

    async fn get_entity(&self, id: Uuid) -> Result<Option<ScreeningEntity>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        load_entity_by_id(&mut *conn, id).await
    }

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<ScreeningEntity>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        load_entity_by_external_id(&mut *conn, external_id).await
    }

    async fn count_entities(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM screening_entities")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn search_local(&self, search: &LocalSearch) -> Result<Vec<ScreeningEntity>, StoreError> {
        let pattern = search
            .q
            .as_deref()
            .filter(|q| !q.is_empty())
            .map(like_pattern);
        let source_list = search.source_list.as_deref().filter(|s| !s.is_empty());
        let country = search.country.as_deref().filter(|c| !c.is_empty());

        let sql = format!(
            r#"
            SELECT {ENTITY_COLUMNS}
              FROM screening_entities e
             WHERE ($1::text IS NULL OR e.name ILIKE $1 OR EXISTS (
                       SELECT 1 FROM jsonb_array_elements_text(e.alt_names) n
                        WHERE n ILIKE $1))
               AND ($2::text IS NULL OR e.source_list = $2)
               AND ($3::text IS NULL OR EXISTS (
                       SELECT 1 FROM addresses a
                        WHERE a.entity_id = e.id
                          AND LOWER(a.country) = LOWER($3)))
             ORDER BY e.updated_at DESC
             LIMIT $4
            "#
        );

        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&sql)
            .bind(pattern)
            .bind(source_list)
            .bind(country)
            .bind(i64::from(search.effective_limit()))
            .fetch_all(&mut *conn)
            .await?;

        let mut entities = rows
            .iter()
            .map(entity_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        attach_children(&mut conn, &mut entities).await?;
        Ok(entities)
    }

    async fn source_lists(&self) -> Result<Vec<String>, StoreError> {
        let lists: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT source_list FROM screening_entities ORDER BY source_list",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(lists)
    }

    async fn countries(&self) -> Result<Vec<String>, StoreError> {
        let countries: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT country
              FROM addresses
             WHERE country IS NOT NULL AND country <> ''
             ORDER BY country
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(countries)
    }

    async fn record_search(&self, query: NewSearchQuery) -> Result<SearchQuery, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO search_queries (id, query_text, results_count, username, timestamp, search_params)
            VALUES ($1, $2, 0, $3, NOW(), $4)
            RETURNING id, query_text, results_count, username, timestamp, search_params
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&query.query_text)
        .bind(&query.user)
        .bind(Json(&query.search_params))
        .fetch_one(&self.pool)
        .await?;
        search_query_from_row(&row)
    }

    async fn update_results_count(&self, id: Uuid, results_count: i64) -> Result<(), StoreError> {
        let updated = sqlx::query("UPDATE search_queries SET results_count = $2 WHERE id = $1")
            .bind(id)
            .bind(results_count)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(StoreError::SearchQueryNotFound(id));
        }
        Ok(())
    }

    async fn search_history(&self, limit: u32) -> Result<Vec<SearchQuery>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, query_text, results_count, username, timestamp, search_params
              FROM search_queries
             ORDER BY timestamp DESC
             LIMIT $1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(search_query_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csl_core::NewAddress;

    #[test]
    fn like_pattern_escapes_metacharacters() {
        assert_eq!(like_pattern("acme"), "%acme%");
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
    }

    async fn store_from_env() -> Option<PgScreeningStore> {
        let url = std::env::var("CSL_TEST_DATABASE_URL").ok()?;
        let store = PgScreeningStore::connect(&url).await.ok()?;
        store.migrate().await.ok()?;
        Some(store)
    }

    #[tokio::test]
    async fn pg_upsert_is_idempotent_and_replaces_addresses() {
        let Some(store) = store_from_env().await else {
            return;
        };
        let external_id = format!("test-{}", Uuid::new_v4());
        let mk = |countries: &[&str]| EntityUpsert {
            external_id: external_id.clone(),
            fields: EntityFields {
                name: "Acme Corp".into(),
                source_list: "SDN".into(),
                ..Default::default()
            },
            addresses: countries
                .iter()
                .map(|c| NewAddress {
                    country: Some(c.to_string()),
                    ..Default::default()
                })
                .collect(),
            ids: vec![],
        };

        let first = store.upsert_entity(mk(&["IR", "RU"])).await.expect("first");
        let again = store.upsert_entity(mk(&["IR", "RU"])).await.expect("again");
        assert!(first.created);
        assert!(!again.created);
        assert_eq!(first.entity.id, again.entity.id);
        assert_eq!(again.entity.addresses.len(), 2);

        let replaced = store.upsert_entity(mk(&["SY"])).await.expect("replace");
        let countries = replaced
            .entity
            .addresses
            .iter()
            .filter_map(|a| a.country.clone())
            .collect::<Vec<_>>();
        assert_eq!(countries, vec!["SY".to_string()]);

        let loaded = store
            .find_by_external_id(&external_id)
            .await
            .expect("lookup")
            .expect("present");
        assert_eq!(loaded.addresses.len(), 1);
    }

    #[tokio::test]
    async fn pg_local_search_matches_alt_name_elements() {
        let Some(store) = store_from_env().await else {
            return;
        };
        let tag = Uuid::new_v4().simple().to_string();
        store
            .upsert_entity(EntityUpsert {
                external_id: format!("test-{tag}"),
                fields: EntityFields {
                    name: "Primary".into(),
                    alt_names: vec![format!("O\"Brien {tag}"), format!("Back\\slash {tag}")],
                    source_list: "SDN".into(),
                    ..Default::default()
                },
                addresses: vec![],
                ids: vec![],
            })
            .await
            .expect("upsert");

        let search = |q: String| LocalSearch {
            q: Some(q),
            ..Default::default()
        };
        let quoted = store
            .search_local(&search(format!("o\"brien {tag}")))
            .await
            .expect("quoted");
        assert_eq!(quoted.len(), 1);
        let backslash = store
            .search_local(&search(format!("back\\slash {tag}")))
            .await
            .expect("backslash");
        assert_eq!(backslash.len(), 1);
        let across = store
            .search_local(&search(format!("{tag}\", \"back")))
            .await
            .expect("across");
        assert!(across.is_empty());
    }
}
