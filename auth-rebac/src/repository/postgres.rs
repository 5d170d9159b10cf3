//! PostgreSQL-backed ReBAC tuple repository
//!
//! This implementation stores relationship tuples in PostgreSQL with:
//! - Zone isolation via `zone_id` on every row
//! - A per-zone revision counter bumped in the same transaction as the write
//! - A sequence-numbered changelog consumed by the bitmap updater
//! - Consumer checkpoints for replay after a crash
//! - Time-based expiration support

use crate::{error::RebacError, models::*, repository::TupleRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{PgConnection, Row};
use std::collections::BTreeSet;
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS rebac_tuples (
        id UUID PRIMARY KEY,
        zone_id TEXT NOT NULL,
        subject_zone_id TEXT NOT NULL,
        subject_type TEXT NOT NULL,
        subject_id TEXT NOT NULL,
        subject_relation TEXT NOT NULL DEFAULT '',
        relation TEXT NOT NULL,
        object_type TEXT NOT NULL,
        object_id TEXT NOT NULL,
        expires_at TIMESTAMPTZ,
        conditions TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        UNIQUE (zone_id, subject_zone_id, subject_type, subject_id, subject_relation,
                relation, object_type, object_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS rebac_tuples_object_idx ON rebac_tuples (zone_id, object_type, object_id, relation)",
    "CREATE INDEX IF NOT EXISTS rebac_tuples_subject_idx ON rebac_tuples (zone_id, subject_type, subject_id, relation)",
    r#"
    CREATE TABLE IF NOT EXISTS rebac_zone_revisions (
        zone_id TEXT PRIMARY KEY,
        revision BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rebac_changelog (
        zone_id TEXT NOT NULL,
        sequence BIGINT NOT NULL,
        kind TEXT NOT NULL,
        tuple TEXT NOT NULL,
        recorded_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (zone_id, sequence)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rebac_checkpoints (
        consumer TEXT NOT NULL,
        zone_id TEXT NOT NULL,
        sequence BIGINT NOT NULL,
        PRIMARY KEY (consumer, zone_id)
    )
    "#,
];

const TUPLE_COLUMNS: &str = "id, zone_id, subject_zone_id, subject_type, subject_id, subject_relation, \
     relation, object_type, object_id, expires_at, conditions, created_at";

const KEY_PREDICATE: &str = "zone_id = $1 AND subject_zone_id = $2 AND subject_type = $3 \
     AND subject_id = $4 AND subject_relation = $5 AND relation = $6 \
     AND object_type = $7 AND object_id = $8";

/// PostgreSQL-backed tuple repository
pub struct PostgresTupleRepository {
    pool: PgPool,
}

impl PostgresTupleRepository {
    /// Create a new PostgreSQL repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create with connection string
    pub async fn from_connection_string(connection_string: &str) -> Result<Self, RebacError> {
        let pool = PgPool::connect(connection_string)
            .await
            .map_err(|e| store_error("connect", e))?;

        Ok(Self::new(pool))
    }

    /// Create the tables this repository needs if they are missing.
    pub async fn ensure_schema(&self) -> Result<(), RebacError> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| store_error("create schema", e))?;
        }
        info!("ReBAC tables ready");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn store_error(action: &str, error: sqlx::Error) -> RebacError {
    RebacError::StoreUnavailable(format!("Failed to {}: {}", action, error))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Exact match and LIKE pattern for "this path or anything beneath it".
fn prefix_patterns(prefix: &str) -> (String, String) {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        ("/".to_string(), "/%".to_string())
    } else {
        (trimmed.to_string(), format!("{}/%", escape_like(trimmed)))
    }
}

fn row_to_tuple(row: &PgRow) -> Result<RelationshipTuple, RebacError> {
    let decode = |e: sqlx::Error| store_error("decode tuple row", e);

    let subject_relation: String = row.try_get("subject_relation").map_err(decode)?;
    let conditions: Option<String> = row.try_get("conditions").map_err(decode)?;
    let conditions = match conditions {
        Some(raw) => Some(
            serde_json::from_str::<Conditions>(&raw)
                .map_err(|e| RebacError::StoreUnavailable(format!("Corrupt conditions: {}", e)))?,
        ),
        None => None,
    };

    Ok(RelationshipTuple {
        id: row.try_get("id").map_err(decode)?,
        subject: Subject {
            subject_type: row.try_get("subject_type").map_err(decode)?,
            subject_id: row.try_get("subject_id").map_err(decode)?,
            relation: (!subject_relation.is_empty()).then_some(subject_relation),
        },
        subject_zone_id: row.try_get("subject_zone_id").map_err(decode)?,
        relation: row.try_get("relation").map_err(decode)?,
        object: Object {
            object_type: row.try_get("object_type").map_err(decode)?,
            object_id: row.try_get("object_id").map_err(decode)?,
        },
        zone_id: row.try_get("zone_id").map_err(decode)?,
        expires_at: row.try_get("expires_at").map_err(decode)?,
        conditions,
        created_at: row.try_get("created_at").map_err(decode)?,
    })
}

/// Bump the zone revision and append a changelog entry, inside the caller's transaction.
async fn append_change(
    conn: &mut PgConnection,
    kind: ChangeKind,
    tuple: &RelationshipTuple,
) -> Result<u64, RebacError> {
    let revision: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO rebac_zone_revisions (zone_id, revision) VALUES ($1, 1)
        ON CONFLICT (zone_id) DO UPDATE SET revision = rebac_zone_revisions.revision + 1
        RETURNING revision
        "#,
    )
    .bind(&tuple.zone_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| store_error("bump zone revision", e))?;

    let payload = serde_json::to_string(tuple)
        .map_err(|e| RebacError::Internal(anyhow::anyhow!("serialize tuple: {}", e)))?;
    let kind = match kind {
        ChangeKind::Write => "write",
        ChangeKind::Delete => "delete",
    };

    sqlx::query(
        "INSERT INTO rebac_changelog (zone_id, sequence, kind, tuple, recorded_at) VALUES ($1, $2, $3, $4, NOW())",
    )
    .bind(&tuple.zone_id)
    .bind(revision)
    .bind(kind)
    .bind(payload)
    .execute(&mut *conn)
    .await
    .map_err(|e| store_error("append changelog", e))?;

    Ok(to_u64(revision))
}

fn bind_key<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    tuple: &'q RelationshipTuple,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(&tuple.zone_id)
        .bind(&tuple.subject_zone_id)
        .bind(&tuple.subject.subject_type)
        .bind(&tuple.subject.subject_id)
        .bind(tuple.subject.relation.as_deref().unwrap_or(""))
        .bind(&tuple.relation)
        .bind(&tuple.object.object_type)
        .bind(&tuple.object.object_id)
}

/// Build the WHERE clause for a filter, returning the SQL and its string binds.
fn filter_clause(filter: &TupleFilter) -> (String, Vec<String>) {
    let mut clause = String::from(" WHERE 1 = 1");
    let mut binds = Vec::new();
    let mut push = |clause: &mut String, column_sql: &str, value: String| {
        binds.push(value);
        clause.push_str(&column_sql.replace("{}", &format!("${}", binds.len())));
    };

    if !filter.include_expired {
        clause.push_str(" AND (expires_at IS NULL OR expires_at > NOW())");
    }
    if let Some(ref zone) = filter.zone_id {
        push(&mut clause, " AND zone_id = {}", zone.clone());
    }
    if let Some(ref s) = filter.subject {
        push(&mut clause, " AND subject_type = {}", s.subject_type.clone());
        push(&mut clause, " AND subject_id = {}", s.subject_id.clone());
        push(
            &mut clause,
            " AND subject_relation = {}",
            s.relation.clone().unwrap_or_default(),
        );
    }
    if let Some(ref e) = filter.subject_entity {
        push(&mut clause, " AND subject_type = {}", e.object_type.clone());
        push(&mut clause, " AND subject_id = {}", e.object_id.clone());
    }
    if let Some(ref zone) = filter.subject_zone_id {
        push(&mut clause, " AND subject_zone_id = {}", zone.clone());
    }
    if let Some(ref r) = filter.relation {
        push(&mut clause, " AND relation = {}", r.clone());
    }
    if let Some(ref o) = filter.object {
        push(&mut clause, " AND object_type = {}", o.object_type.clone());
        push(&mut clause, " AND object_id = {}", o.object_id.clone());
    }
    if let Some(ref t) = filter.object_type {
        push(&mut clause, " AND object_type = {}", t.clone());
    }
    if let Some(ref prefix) = filter.object_id_prefix {
        let (exact, like) = prefix_patterns(prefix);
        push(&mut clause, " AND (object_id = {}", exact);
        push(&mut clause, " OR object_id LIKE {})", like);
    }
    if filter.usersets_only {
        clause.push_str(" AND subject_relation <> ''");
    }
    (clause, binds)
}

#[async_trait]
impl TupleRepository for PostgresTupleRepository {
    async fn write_tuple(&self, tuple: RelationshipTuple) -> Result<WriteOutcome, RebacError> {
        debug!("Writing tuple to PostgreSQL: {}", tuple);

        let conditions = tuple
            .conditions
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RebacError::InvalidTuple(format!("conditions: {}", e)))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_error("start transaction", e))?;

        // An expired tuple holding the natural key is removed first.
        let expired_sql = format!(
            "DELETE FROM rebac_tuples WHERE {} AND expires_at IS NOT NULL AND expires_at <= NOW() RETURNING {}",
            KEY_PREDICATE, TUPLE_COLUMNS
        );
        let expired_rows = bind_key(sqlx::query(&expired_sql), &tuple)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| store_error("clear expired tuple", e))?;
        for row in &expired_rows {
            let expired = row_to_tuple(row)?;
            append_change(&mut tx, ChangeKind::Delete, &expired).await?;
        }

        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO rebac_tuples (
                id, zone_id, subject_zone_id,
                subject_type, subject_id, subject_relation,
                relation, object_type, object_id,
                expires_at, conditions, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (zone_id, subject_zone_id, subject_type, subject_id, subject_relation,
                         relation, object_type, object_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(tuple.id)
        .bind(&tuple.zone_id)
        .bind(&tuple.subject_zone_id)
        .bind(&tuple.subject.subject_type)
        .bind(&tuple.subject.subject_id)
        .bind(tuple.subject.relation.as_deref().unwrap_or(""))
        .bind(&tuple.relation)
        .bind(&tuple.object.object_type)
        .bind(&tuple.object.object_id)
        .bind(tuple.expires_at)
        .bind(conditions)
        .bind(tuple.created_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| store_error("write tuple", e))?;

        let outcome = match inserted {
            Some(tuple_id) => {
                let revision = append_change(&mut tx, ChangeKind::Write, &tuple).await?;
                WriteOutcome {
                    tuple_id,
                    revision,
                    created: true,
                }
            }
            None => {
                let existing_sql = format!("SELECT id FROM rebac_tuples WHERE {}", KEY_PREDICATE);
                let existing: Uuid = bind_key(sqlx::query(&existing_sql), &tuple)
                    .fetch_one(&mut *tx)
                    .await
                    .and_then(|row| row.try_get("id"))
                    .map_err(|e| store_error("read existing tuple", e))?;
                let revision: Option<i64> = sqlx::query_scalar(
                    "SELECT revision FROM rebac_zone_revisions WHERE zone_id = $1",
                )
                .bind(&tuple.zone_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| store_error("read zone revision", e))?;
                WriteOutcome {
                    tuple_id: existing,
                    revision: revision.map_or(0, to_u64),
                    created: false,
                }
            }
        };

        tx.commit()
            .await
            .map_err(|e| store_error("commit transaction", e))?;

        info!(tuple_id = %outcome.tuple_id, revision = outcome.revision, created = outcome.created, "Tuple written");
        Ok(outcome)
    }

    async fn delete_tuple(&self, id: Uuid) -> Result<Option<DeleteOutcome>, RebacError> {
        debug!("Deleting tuple from PostgreSQL: {}", id);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_error("start transaction", e))?;

        let sql = format!("DELETE FROM rebac_tuples WHERE id = $1 RETURNING {}", TUPLE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| store_error("delete tuple", e))?;

        let outcome = match row {
            Some(row) => {
                let tuple = row_to_tuple(&row)?;
                let revision = append_change(&mut tx, ChangeKind::Delete, &tuple).await?;
                Some(DeleteOutcome { tuple, revision })
            }
            None => None,
        };

        tx.commit()
            .await
            .map_err(|e| store_error("commit transaction", e))?;
        Ok(outcome)
    }

    async fn get_tuple(&self, id: Uuid) -> Result<Option<RelationshipTuple>, RebacError> {
        let sql = format!("SELECT {} FROM rebac_tuples WHERE id = $1", TUPLE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_error("read tuple", e))?;
        row.as_ref().map(row_to_tuple).transpose()
    }

    async fn read_tuples(&self, filter: &TupleFilter) -> Result<Vec<RelationshipTuple>, RebacError> {
        debug!(?filter, "Reading tuples");

        let (clause, binds) = filter_clause(filter);
        let sql = format!(
            "SELECT {} FROM rebac_tuples{} ORDER BY created_at, id",
            TUPLE_COLUMNS, clause
        );
        let mut query = sqlx::query(&sql);
        for bind in binds {
            query = query.bind(bind);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| store_error("read tuples", e))?;
        rows.iter().map(row_to_tuple).collect()
    }

    async fn query_tuples(
        &self,
        filter: &TupleFilter,
        pagination: Pagination,
    ) -> Result<TuplePage, RebacError> {
        let (clause, binds) = filter_clause(filter);
        let sql = format!(
            "SELECT {} FROM rebac_tuples{} ORDER BY created_at, id LIMIT {} OFFSET {}",
            TUPLE_COLUMNS,
            clause,
            pagination.limit.saturating_add(1),
            pagination.offset
        );
        let mut query = sqlx::query(&sql);
        for bind in binds {
            query = query.bind(bind);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| store_error("query tuples", e))?;
        let has_more = rows.len() > pagination.limit;
        let tuples = rows
            .iter()
            .take(pagination.limit)
            .map(row_to_tuple)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TuplePage {
            next_offset: has_more.then(|| pagination.offset.saturating_add(tuples.len())),
            tuples,
        })
    }

    async fn list_objects_of_type(
        &self,
        zone_id: &str,
        object_type: &str,
        path_prefix: Option<String>,
    ) -> Result<Vec<Object>, RebacError> {
        let rows = sqlx::query(
            r#"
            SELECT object_id AS id FROM rebac_tuples
             WHERE zone_id = $1 AND object_type = $2
               AND (expires_at IS NULL OR expires_at > NOW())
            UNION
            SELECT subject_id AS id FROM rebac_tuples
             WHERE zone_id = $1 AND subject_type = $2 AND subject_relation = ''
               AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(zone_id)
        .bind(object_type)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_error("list objects", e))?;

        let mut objects = BTreeSet::new();
        for row in rows {
            let id: String = row
                .try_get("id")
                .map_err(|e| store_error("decode object id", e))?;
            let object = Object::new(object_type, &id);
            if path_prefix.as_deref().map_or(true, |p| object.is_under(p)) {
                objects.insert(object);
            }
        }
        Ok(objects.into_iter().collect())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<DeleteOutcome>, RebacError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_error("start transaction", e))?;

        let sql = format!(
            "DELETE FROM rebac_tuples WHERE expires_at IS NOT NULL AND expires_at <= $1 RETURNING {}",
            TUPLE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| store_error("purge expired tuples", e))?;

        let mut expired = rows.iter().map(row_to_tuple).collect::<Result<Vec<_>, _>>()?;
        expired.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let mut outcomes = Vec::with_capacity(expired.len());
        for tuple in expired {
            let revision = append_change(&mut tx, ChangeKind::Delete, &tuple).await?;
            outcomes.push(DeleteOutcome { tuple, revision });
        }

        tx.commit()
            .await
            .map_err(|e| store_error("commit transaction", e))?;
        info!(purged = outcomes.len(), "Expired tuples purged");
        Ok(outcomes)
    }

    async fn current_revision(&self, zone_id: &str) -> Result<u64, RebacError> {
        let revision: Option<i64> =
            sqlx::query_scalar("SELECT revision FROM rebac_zone_revisions WHERE zone_id = $1")
                .bind(zone_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| store_error("read zone revision", e))?;
        Ok(revision.map_or(0, to_u64))
    }

    async fn read_changes(
        &self,
        zone_id: &str,
        after: u64,
        limit: usize,
    ) -> Result<Vec<ChangeEntry>, RebacError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, kind, tuple, recorded_at FROM rebac_changelog
             WHERE zone_id = $1 AND sequence > $2
             ORDER BY sequence
             LIMIT $3
            "#,
        )
        .bind(zone_id)
        .bind(to_i64(after))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_error("read changelog", e))?;

        rows.iter()
            .map(|row| {
                let decode = |e: sqlx::Error| store_error("decode changelog row", e);
                let sequence: i64 = row.try_get("sequence").map_err(decode)?;
                let kind: String = row.try_get("kind").map_err(decode)?;
                let payload: String = row.try_get("tuple").map_err(decode)?;
                let tuple: RelationshipTuple = serde_json::from_str(&payload).map_err(|e| {
                    RebacError::StoreUnavailable(format!("Corrupt changelog entry: {}", e))
                })?;
                Ok(ChangeEntry {
                    sequence: to_u64(sequence),
                    zone_id: zone_id.to_string(),
                    kind: if kind == "delete" {
                        ChangeKind::Delete
                    } else {
                        ChangeKind::Write
                    },
                    tuple,
                    recorded_at: row.try_get("recorded_at").map_err(decode)?,
                })
            })
            .collect()
    }

    async fn load_checkpoint(&self, consumer: &str, zone_id: &str) -> Result<u64, RebacError> {
        let sequence: Option<i64> = sqlx::query_scalar(
            "SELECT sequence FROM rebac_checkpoints WHERE consumer = $1 AND zone_id = $2",
        )
        .bind(consumer)
        .bind(zone_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("load checkpoint", e))?;
        Ok(sequence.map_or(0, to_u64))
    }

    async fn save_checkpoint(
        &self,
        consumer: &str,
        zone_id: &str,
        sequence: u64,
    ) -> Result<(), RebacError> {
        sqlx::query(
            r#"
            INSERT INTO rebac_checkpoints (consumer, zone_id, sequence) VALUES ($1, $2, $3)
            ON CONFLICT (consumer, zone_id)
            DO UPDATE SET sequence = GREATEST(rebac_checkpoints.sequence, EXCLUDED.sequence)
            "#,
        )
        .bind(consumer)
        .bind(zone_id)
        .bind(to_i64(sequence))
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("save checkpoint", e))?;
        Ok(())
    }

    async fn zones(&self) -> Result<Vec<String>, RebacError> {
        sqlx::query_scalar("SELECT zone_id FROM rebac_zone_revisions ORDER BY zone_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| store_error("list zones", e))
    }
}
