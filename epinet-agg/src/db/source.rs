//! sqlx-backed [`EpinetSource`]
//!
//! Tables read:
//! - `epinets (id, title, options_payload)`
//! - `heldbeliefs (belief_id, fingerprint_id, verb, object, updated_at)` joined
//!   with `beliefs (id)`
//! - `actions (object_id, object_type, fingerprint_id, verb, created_at)`
//! - `storyfragments (id, title)` and `panes (id, title)` for titles
//!
//! Timestamps are compared through `datetime()` so that both
//! `YYYY-MM-DD HH:MM:SS` and ISO-8601 column values bucket correctly.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use epinet_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::aggregate::MatchCriteria;
use crate::funnel::StoredFunnel;
use crate::source::{ActionEvent, BeliefEvent, ContentMap, EpinetSource, SourceProvider};

const SQL_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn sql_time(instant: DateTime<Utc>) -> String {
    instant.format(SQL_TIME_FORMAT).to_string()
}

fn utc_column(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>> {
    let naive: NaiveDateTime = row.try_get(column)?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// One tenant's database
#[derive(Debug, Clone)]
pub struct SqliteSource {
    pool: SqlitePool,
}

impl SqliteSource {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn titles_from(&self, table: &str) -> Result<Vec<(String, String)>> {
        let sql = format!("SELECT id, title FROM {table} WHERE title IS NOT NULL");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> Result<(String, String)> { Ok((row.try_get("id")?, row.try_get("title")?)) })
            .collect()
    }
}

#[async_trait]
impl EpinetSource for SqliteSource {
    async fn load_funnel_rows(&self) -> Result<Vec<StoredFunnel>> {
        let rows = sqlx::query("SELECT id, title, options_payload FROM epinets ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<StoredFunnel> {
                Ok(StoredFunnel {
                    id: row.try_get("id")?,
                    title: row.try_get::<Option<String>, _>("title")?.unwrap_or_default(),
                    options_payload: row.try_get("options_payload")?,
                })
            })
            .collect()
    }

    async fn belief_events(
        &self,
        criteria: &MatchCriteria,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<BeliefEvent>> {
        if !criteria.has_belief_criteria() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT datetime(h.updated_at) AS updated_at, h.fingerprint_id, h.verb, h.object, \
             h.belief_id \
             FROM heldbeliefs h JOIN beliefs b ON h.belief_id = b.id \
             WHERE datetime(h.updated_at) >= ",
        );
        qb.push_bind(sql_time(start));
        qb.push(" AND datetime(h.updated_at) < ");
        qb.push_bind(sql_time(end));
        qb.push(" AND (");

        let mut first = true;
        if !criteria.belief_values.is_empty() {
            qb.push("h.verb IN (");
            let mut values = qb.separated(", ");
            for value in &criteria.belief_values {
                values.push_bind(value.clone());
            }
            values.push_unseparated(")");
            first = false;
        }
        if !criteria.identify_as_values.is_empty() {
            if !first {
                qb.push(" OR ");
            }
            qb.push("h.object IN (");
            let mut values = qb.separated(", ");
            for value in &criteria.identify_as_values {
                values.push_bind(value.clone());
            }
            values.push_unseparated(")");
        }
        qb.push(")");

        let rows = qb.build().fetch_all(&self.pool).await?;
        debug!(rows = rows.len(), "Polled heldbeliefs");

        rows.iter()
            .map(|row| -> Result<BeliefEvent> {
                Ok(BeliefEvent {
                    updated_at: utc_column(row, "updated_at")?,
                    fingerprint_id: row.try_get("fingerprint_id")?,
                    verb: row.try_get("verb")?,
                    object: row.try_get("object")?,
                    belief_id: row.try_get("belief_id")?,
                })
            })
            .collect()
    }

    async fn action_events(
        &self,
        criteria: &MatchCriteria,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ActionEvent>> {
        if !criteria.has_action_criteria() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT datetime(created_at) AS created_at, object_id, object_type, fingerprint_id, \
             verb FROM actions WHERE datetime(created_at) >= ",
        );
        qb.push_bind(sql_time(start));
        qb.push(" AND datetime(created_at) < ");
        qb.push_bind(sql_time(end));

        qb.push(" AND verb IN (");
        let mut verbs = qb.separated(", ");
        for verb in &criteria.action_verbs {
            verbs.push_bind(verb.clone());
        }
        verbs.push_unseparated(")");

        if let Some(object_types) = criteria.action_object_types.as_ref().filter(|t| !t.is_empty()) {
            qb.push(" AND object_type IN (");
            let mut types = qb.separated(", ");
            for object_type in object_types {
                types.push_bind(object_type.clone());
            }
            types.push_unseparated(")");
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        debug!(rows = rows.len(), "Polled actions");

        rows.iter()
            .map(|row| -> Result<ActionEvent> {
                Ok(ActionEvent {
                    created_at: utc_column(row, "created_at")?,
                    object_id: row.try_get("object_id")?,
                    object_type: row.try_get("object_type")?,
                    fingerprint_id: row.try_get("fingerprint_id")?,
                    verb: row.try_get("verb")?,
                })
            })
            .collect()
    }

    async fn content_titles(&self) -> Result<ContentMap> {
        let mut content = ContentMap::new();
        for table in ["storyfragments", "panes"] {
            match self.titles_from(table).await {
                Ok(titles) => {
                    for (id, title) in titles {
                        content.insert(id, title);
                    }
                }
                Err(e) => warn!(table, error = %e, "Could not read content titles"),
            }
        }
        Ok(content)
    }
}

/// Maps tenant ids to their databases
#[derive(Debug, Clone, Default)]
pub struct SqliteSourceProvider {
    sources: HashMap<String, Arc<SqliteSource>>,
}

impl SqliteSourceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>, pool: SqlitePool) -> Self {
        self.sources
            .insert(tenant.into(), Arc::new(SqliteSource::new(pool)));
        self
    }

    pub fn tenants(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }
}

#[async_trait]
impl SourceProvider for SqliteSourceProvider {
    async fn source_for(&self, tenant_id: &str) -> Result<Arc<dyn EpinetSource>> {
        match self.sources.get(tenant_id) {
            Some(source) => Ok(Arc::clone(source) as Arc<dyn EpinetSource>),
            None => Err(Error::NotFound(format!("Unknown tenant: {tenant_id}"))),
        }
    }
}
