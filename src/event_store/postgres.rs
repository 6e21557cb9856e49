//! PostgreSQL storage
//!
//! [`EventStorage`] on a `sqlx` connection pool. Expects the tables from
//! `migrations/0001_event_store.sql`; the `UNIQUE (aggregate_id,
//! sequence_number)` constraint on `events` is what detects concurrent
//! appends.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{BoxStream, StreamExt};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use uuid::Uuid;

use crate::domain::{Command, EventStream, StoredCommand};

use super::storage::{
    EventStorage, NewEventRecord, StorageError, StorageTransaction, StoredEvent, StoredHistory,
    StoredSnapshot,
};
use super::ReplayQuery;

fn outdated_after_secs(duration: Option<Duration>) -> Option<i64> {
    duration.map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

fn stream_from_row(row: &PgRow) -> Result<EventStream, sqlx::Error> {
    let outdated_after: Option<i64> = row.try_get("snapshot_outdated_after_secs")?;
    Ok(EventStream {
        aggregate_type: row.try_get("aggregate_type")?,
        aggregate_id: row.try_get("aggregate_id")?,
        snapshot_threshold: row.try_get("snapshot_threshold")?,
        snapshot_outdated_after: outdated_after
            .and_then(|secs| u64::try_from(secs).ok())
            .map(Duration::from_secs),
    })
}

fn event_from_row(row: &PgRow) -> Result<StoredEvent, sqlx::Error> {
    Ok(StoredEvent {
        id: row.try_get("id")?,
        aggregate_id: row.try_get("aggregate_id")?,
        sequence_number: row.try_get("sequence_number")?,
        created_at: row.try_get("created_at")?,
        command_id: row.try_get("command_id")?,
        event_type: row.try_get("event_type")?,
        payload: row.try_get("payload")?,
    })
}

fn snapshot_from_row(row: &PgRow) -> Result<StoredSnapshot, sqlx::Error> {
    Ok(StoredSnapshot {
        aggregate_id: row.try_get("aggregate_id")?,
        sequence_number: row.try_get("sequence_number")?,
        created_at: row.try_get("created_at")?,
        snapshot_type: row.try_get("snapshot_type")?,
        payload: row.try_get("payload")?,
    })
}

fn command_from_row(row: &PgRow) -> Result<StoredCommand, sqlx::Error> {
    Ok(StoredCommand {
        id: row.try_get("id")?,
        command_type: row.try_get("command_type")?,
        aggregate_id: row.try_get("aggregate_id")?,
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Fold history rows (ordered by aggregate, then sequence, snapshot first)
/// into one [`StoredHistory`] per aggregate
fn histories_from_rows(rows: &[PgRow]) -> Result<Vec<StoredHistory>, sqlx::Error> {
    let mut histories: Vec<StoredHistory> = Vec::new();

    for row in rows {
        let aggregate_id: Uuid = row.try_get("aggregate_id")?;
        if histories.last().map(|h| h.aggregate_id) != Some(aggregate_id) {
            histories.push(StoredHistory::empty(aggregate_id));
        }
        let Some(history) = histories.last_mut() else {
            continue;
        };

        let sequence_number: i64 = row.try_get("sequence_number")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        let type_tag: String = row.try_get("type_tag")?;
        let payload: serde_json::Value = row.try_get("payload")?;

        if row.try_get::<bool, _>("is_snapshot")? {
            history.snapshot = Some(StoredSnapshot {
                aggregate_id,
                sequence_number,
                created_at,
                snapshot_type: type_tag,
                payload,
            });
        } else {
            history.events.push(StoredEvent {
                id: row.try_get("id")?,
                aggregate_id,
                sequence_number,
                created_at,
                command_id: row.try_get("command_id")?,
                event_type: type_tag,
                payload,
            });
        }
    }

    Ok(histories)
}

/// PostgreSQL-backed event storage
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Create a new storage with a database pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// An open PostgreSQL transaction; dropped without commit means rolled back
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StorageTransaction for PostgresTransaction {
    async fn insert_stream(&mut self, stream: &EventStream) -> Result<String, StorageError> {
        sqlx::query(
            r#"
            INSERT INTO event_streams (
                aggregate_id, aggregate_type, snapshot_threshold, snapshot_outdated_after_secs
            )
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (aggregate_id) DO NOTHING
            "#,
        )
        .bind(stream.aggregate_id)
        .bind(&stream.aggregate_type)
        .bind(stream.snapshot_threshold)
        .bind(outdated_after_secs(stream.snapshot_outdated_after))
        .execute(&mut *self.tx)
        .await?;

        let aggregate_type: String =
            sqlx::query_scalar("SELECT aggregate_type FROM event_streams WHERE aggregate_id = $1")
                .bind(stream.aggregate_id)
                .fetch_one(&mut *self.tx)
                .await?;

        Ok(aggregate_type)
    }

    async fn insert_command(&mut self, command: &Command) -> Result<i64, StorageError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO commands (aggregate_id, command_type, payload)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(command.aggregate_id)
        .bind(&command.command_type)
        .bind(&command.payload)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(id)
    }

    async fn insert_events(
        &mut self,
        command_id: i64,
        events: &[NewEventRecord],
    ) -> Result<Vec<i64>, StorageError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO events (aggregate_id, sequence_number, created_at, command_id, event_type, payload) ",
        );
        qb.push_values(events, |mut b, record| {
            b.push_bind(record.aggregate_id)
                .push_bind(record.sequence_number)
                .push_bind(record.created_at)
                .push_bind(command_id)
                .push_bind(record.event_type.clone())
                .push_bind(record.payload.clone());
        });
        qb.push(" RETURNING id");

        let positions: Vec<i64> = qb
            .build_query_scalar()
            .fetch_all(&mut *self.tx)
            .await?;

        Ok(positions)
    }

    async fn delete_stream(&mut self, aggregate_id: Uuid) -> Result<bool, StorageError> {
        sqlx::query("DELETE FROM snapshot_events WHERE aggregate_id = $1")
            .bind(aggregate_id)
            .execute(&mut *self.tx)
            .await?;

        sqlx::query("DELETE FROM events WHERE aggregate_id = $1")
            .bind(aggregate_id)
            .execute(&mut *self.tx)
            .await?;

        let result = sqlx::query("DELETE FROM event_streams WHERE aggregate_id = $1")
            .bind(aggregate_id)
            .execute(&mut *self.tx)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn commit(self) -> Result<(), StorageError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StorageError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl EventStorage for PostgresStorage {
    type Transaction = PostgresTransaction;

    async fn begin(&self) -> Result<Self::Transaction, StorageError> {
        let tx = self.pool.begin().await?;
        Ok(PostgresTransaction { tx })
    }

    async fn find_streams(&self, aggregate_ids: &[Uuid]) -> Result<Vec<EventStream>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT aggregate_id, aggregate_type, snapshot_threshold, snapshot_outdated_after_secs
            FROM event_streams
            WHERE aggregate_id = ANY($1)
            "#,
        )
        .bind(aggregate_ids)
        .fetch_all(&self.pool)
        .await?;

        let streams = rows
            .iter()
            .map(stream_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(streams)
    }

    async fn stream_exists(&self, aggregate_id: Uuid) -> Result<bool, StorageError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM event_streams WHERE aggregate_id = $1)",
        )
        .bind(aggregate_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn events_exist(&self, aggregate_id: Uuid) -> Result<bool, StorageError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM events WHERE aggregate_id = $1)")
                .bind(aggregate_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(exists)
    }

    async fn update_snapshot_policy(
        &self,
        aggregate_id: Uuid,
        snapshot_threshold: Option<i32>,
        snapshot_outdated_after: Option<Duration>,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE event_streams
            SET snapshot_threshold = $2, snapshot_outdated_after_secs = $3
            WHERE aggregate_id = $1
            "#,
        )
        .bind(aggregate_id)
        .bind(snapshot_threshold)
        .bind(outdated_after_secs(snapshot_outdated_after))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn load_histories(&self, aggregate_ids: &[Uuid]) -> Result<Vec<StoredHistory>, StorageError> {
        let rows = sqlx::query(
            r#"
            WITH latest_snapshots AS (
                SELECT DISTINCT ON (aggregate_id)
                    aggregate_id, sequence_number, created_at, snapshot_type, payload
                FROM snapshot_events
                WHERE aggregate_id = ANY($1)
                ORDER BY aggregate_id, sequence_number DESC
            )
            SELECT aggregate_id, sequence_number, created_at, snapshot_type AS type_tag, payload,
                   TRUE AS is_snapshot, NULL::BIGINT AS id, NULL::BIGINT AS command_id
            FROM latest_snapshots
            UNION ALL
            SELECT e.aggregate_id, e.sequence_number, e.created_at, e.event_type, e.payload,
                   FALSE, e.id, e.command_id
            FROM events e
            LEFT JOIN latest_snapshots ls ON ls.aggregate_id = e.aggregate_id
            WHERE e.aggregate_id = ANY($1)
              AND e.sequence_number > COALESCE(ls.sequence_number, 0)
            ORDER BY aggregate_id, sequence_number, is_snapshot DESC
            "#,
        )
        .bind(aggregate_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(histories_from_rows(&rows)?)
    }

    async fn load_event(
        &self,
        aggregate_id: Uuid,
        sequence_number: i64,
    ) -> Result<Option<StoredEvent>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT e.id, e.aggregate_id, e.sequence_number, e.created_at, e.command_id,
                   e.event_type, e.payload
            FROM events e
            WHERE e.aggregate_id = $1 AND e.sequence_number = $2
            "#,
        )
        .bind(aggregate_id)
        .bind(sequence_number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(event_from_row).transpose()?)
    }

    fn stream_events(
        &self,
        aggregate_id: Uuid,
        until: Option<DateTime<Utc>>,
    ) -> BoxStream<'_, Result<StoredEvent, StorageError>> {
        sqlx::query(
            r#"
            SELECT e.id, e.aggregate_id, e.sequence_number, e.created_at, e.command_id,
                   e.event_type, e.payload
            FROM events e
            WHERE e.aggregate_id = $1
              AND ($2::timestamptz IS NULL OR e.created_at <= $2)
            ORDER BY e.sequence_number
            "#,
        )
        .bind(aggregate_id)
        .bind(until)
        .fetch(&self.pool)
        .map(|row| row.and_then(|row| event_from_row(&row)).map_err(StorageError::from))
        .boxed()
    }

    fn stream_replay(&self, query: &ReplayQuery) -> BoxStream<'_, Result<StoredEvent, StorageError>> {
        sqlx::query(
            r#"
            SELECT e.id, e.aggregate_id, e.sequence_number, e.created_at, e.command_id,
                   e.event_type, e.payload
            FROM events e
            JOIN event_streams s ON s.aggregate_id = e.aggregate_id
            WHERE ($1::uuid[] IS NULL OR e.aggregate_id = ANY($1))
              AND ($2::text[] IS NULL OR s.aggregate_type = ANY($2))
              AND ($3::text[] IS NULL OR e.event_type = ANY($3))
              AND ($4::timestamptz IS NULL OR e.created_at >= $4)
              AND ($5::timestamptz IS NULL OR e.created_at <= $5)
              AND ($6::bigint IS NULL OR e.id > $6)
            ORDER BY e.id
            "#,
        )
        .bind(query.aggregate_ids.clone())
        .bind(query.aggregate_types.clone())
        .bind(query.event_types.clone())
        .bind(query.created_from)
        .bind(query.created_until)
        .bind(query.after_position)
        .fetch(&self.pool)
        .map(|row| row.and_then(|row| event_from_row(&row)).map_err(StorageError::from))
        .boxed()
    }

    async fn events_since_latest_snapshot(&self, aggregate_id: Uuid) -> Result<i64, StorageError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM events e
            WHERE e.aggregate_id = $1
              AND e.sequence_number > COALESCE(
                  (SELECT MAX(sequence_number) FROM snapshot_events WHERE aggregate_id = $1),
                  0
              )
            "#,
        )
        .bind(aggregate_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn aggregates_that_need_snapshots(
        &self,
        aggregate_type: Option<&str>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, StorageError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT s.aggregate_id
            FROM event_streams s
            LEFT JOIN LATERAL (
                SELECT sn.sequence_number, sn.created_at
                FROM snapshot_events sn
                WHERE sn.aggregate_id = s.aggregate_id
                ORDER BY sn.sequence_number DESC
                LIMIT 1
            ) latest ON TRUE
            WHERE s.snapshot_threshold IS NOT NULL
              AND ($1::text IS NULL OR s.aggregate_type = $1)
              AND (
                  (
                      SELECT COUNT(*)
                      FROM events e
                      WHERE e.aggregate_id = s.aggregate_id
                        AND e.sequence_number > COALESCE(latest.sequence_number, 0)
                  ) >= s.snapshot_threshold
                  OR (
                      s.snapshot_outdated_after_secs IS NOT NULL
                      AND latest.created_at < $2::timestamptz
                          - make_interval(secs => s.snapshot_outdated_after_secs::double precision)
                  )
              )
            ORDER BY s.aggregate_id
            LIMIT $3
            "#,
        )
        .bind(aggregate_type)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn insert_snapshots(&self, snapshots: &[StoredSnapshot]) -> Result<(), StorageError> {
        if snapshots.is_empty() {
            return Ok(());
        }

        // a single multi-row INSERT is all-or-nothing on its own
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO snapshot_events (aggregate_id, sequence_number, created_at, snapshot_type, payload) ",
        );
        qb.push_values(snapshots, |mut b, snapshot| {
            b.push_bind(snapshot.aggregate_id)
                .push_bind(snapshot.sequence_number)
                .push_bind(snapshot.created_at)
                .push_bind(snapshot.snapshot_type.clone())
                .push_bind(snapshot.payload.clone());
        });

        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn latest_snapshot(&self, aggregate_id: Uuid) -> Result<Option<StoredSnapshot>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT aggregate_id, sequence_number, created_at, snapshot_type, payload
            FROM snapshot_events
            WHERE aggregate_id = $1
            ORDER BY sequence_number DESC
            LIMIT 1
            "#,
        )
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(snapshot_from_row).transpose()?)
    }

    async fn delete_snapshots_before(
        &self,
        aggregate_id: Uuid,
        sequence_number: i64,
    ) -> Result<u64, StorageError> {
        let result = sqlx::query(
            "DELETE FROM snapshot_events WHERE aggregate_id = $1 AND sequence_number < $2",
        )
        .bind(aggregate_id)
        .bind(sequence_number)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn commands_for_aggregate(&self, aggregate_id: Uuid) -> Result<Vec<StoredCommand>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, command_type, aggregate_id, payload, created_at
            FROM commands
            WHERE aggregate_id = $1
            ORDER BY id
            "#,
        )
        .bind(aggregate_id)
        .fetch_all(&self.pool)
        .await?;

        let commands = rows
            .iter()
            .map(command_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(commands)
    }

    async fn delete_commands_without_events(
        &self,
        aggregate_id: Option<Uuid>,
    ) -> Result<u64, StorageError> {
        let result = sqlx::query(
            r#"
            DELETE FROM commands c
            WHERE ($1::uuid IS NULL OR c.aggregate_id = $1)
              AND NOT EXISTS (SELECT 1 FROM events e WHERE e.command_id = c.id)
            "#,
        )
        .bind(aggregate_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
