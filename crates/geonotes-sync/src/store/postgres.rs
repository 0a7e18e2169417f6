//! PostgreSQL store
//!
//! Shared counters are single rows updated under row locks; cursors only
//! move forward through `GREATEST`; locks are leased rows that an expired
//! holder loses on the next acquisition attempt.

use super::{ApplySummary, LeaseLocks, NoteRepository, ProgressStore, SchedulerLedger};
use crate::config::DatabaseConfig;
use crate::error::{Result, SyncError};
use crate::models::{
    Coordinates, NoteId, NoteRecord, Partition, QueueState, Region, RegionAssignment,
    RegionBoundary, StoredNote, SyncStatusRecord, Ticket, Watermark,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct NoteRow {
    id: i64,
    lat: f64,
    lon: f64,
    updated_at: DateTime<Utc>,
    status: String,
    region_state: String,
    region_id: Option<i64>,
}

impl TryFrom<NoteRow> for StoredNote {
    type Error = SyncError;

    fn try_from(row: NoteRow) -> Result<Self> {
        Ok(StoredNote {
            id: row.id,
            location: Coordinates::new(row.lat, row.lon)?,
            updated_at: row.updated_at,
            status: row.status.parse()?,
            region: RegionAssignment::from_columns(&row.region_state, row.region_id)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PartitionRow {
    partition_id: i32,
    start_offset: i64,
    end_offset: i64,
    state: String,
}

impl TryFrom<PartitionRow> for Partition {
    type Error = SyncError;

    fn try_from(row: PartitionRow) -> Result<Self> {
        let convert = |v: i64| {
            u64::try_from(v).map_err(|_| SyncError::Consistency(format!("negative offset {v}")))
        };
        Ok(Partition {
            id: u32::try_from(row.partition_id)
                .map_err(|_| SyncError::Consistency(format!("invalid partition id {}", row.partition_id)))?,
            start: convert(row.start_offset)?,
            end: convert(row.end_offset)?,
            state: row.state.parse()?,
        })
    }
}

fn offset(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| SyncError::DataValidation(format!("offset {value} out of range")))
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .connect(&config.url)
            .await?;
        info!(max_connections = config.max_connections, "Connected to database");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Release `seq` inside `tx`; with `only_current` nothing happens unless it is being served
    async fn release_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        queue: &str,
        seq: i64,
        only_current: bool,
    ) -> Result<bool> {
        let counters: Option<(i64, i64)> = sqlx::query_as(
            "SELECT now_serving, next_ticket FROM scheduler_queues WHERE name = $1 FOR UPDATE",
        )
        .bind(queue)
        .fetch_optional(&mut **tx)
        .await?;

        let Some((now_serving, next_ticket)) = counters else {
            return Ok(false);
        };
        if seq < now_serving || seq >= next_ticket || (only_current && seq != now_serving) {
            return Ok(false);
        }

        sqlx::query(
            "UPDATE scheduler_tickets SET released_at = NOW(), expired = $3 \
             WHERE queue = $1 AND seq = $2 AND released_at IS NULL",
        )
        .bind(queue)
        .bind(seq)
        .bind(only_current)
        .execute(&mut **tx)
        .await?;

        if seq == now_serving {
            sqlx::query(
                r#"
                UPDATE scheduler_queues q
                SET now_serving = COALESCE(
                        (SELECT MIN(t.seq) FROM scheduler_tickets t
                         WHERE t.queue = q.name AND t.seq >= q.now_serving AND t.released_at IS NULL),
                        q.next_ticket),
                    serving_since = NOW()
                WHERE q.name = $1
                "#,
            )
            .bind(queue)
            .execute(&mut **tx)
            .await?;

            sqlx::query(
                "DELETE FROM scheduler_tickets t USING scheduler_queues q \
                 WHERE t.queue = $1 AND q.name = t.queue AND t.seq < q.now_serving",
            )
            .bind(queue)
            .execute(&mut **tx)
            .await?;
        }
        Ok(true)
    }
}

#[async_trait]
impl NoteRepository for PgStore {
    async fn apply_notes(&self, notes: &[NoteRecord]) -> Result<ApplySummary> {
        let mut tx = self.pool.begin().await?;
        let mut summary = ApplySummary::default();

        for note in notes {
            let inserted: Option<bool> = sqlx::query_scalar(
                r#"
                INSERT INTO notes (id, lat, lon, created_at, updated_at, closed_at, status)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (id) DO UPDATE SET
                    lat = EXCLUDED.lat,
                    lon = EXCLUDED.lon,
                    created_at = EXCLUDED.created_at,
                    updated_at = EXCLUDED.updated_at,
                    closed_at = EXCLUDED.closed_at,
                    status = EXCLUDED.status,
                    region_state = CASE WHEN notes.lat = EXCLUDED.lat AND notes.lon = EXCLUDED.lon
                                        THEN notes.region_state ELSE 'unknown' END,
                    region_id = CASE WHEN notes.lat = EXCLUDED.lat AND notes.lon = EXCLUDED.lon
                                     THEN notes.region_id ELSE NULL END
                WHERE notes.updated_at <= EXCLUDED.updated_at
                RETURNING (xmax = 0)
                "#,
            )
            .bind(note.id)
            .bind(note.location.lat)
            .bind(note.location.lon)
            .bind(note.created_at)
            .bind(note.updated_at)
            .bind(note.closed_at)
            .bind(note.status.as_str())
            .fetch_optional(&mut *tx)
            .await?;

            match inserted {
                None => {
                    summary.skipped_stale += 1;
                    continue;
                },
                Some(true) => summary.inserted += 1,
                Some(false) => summary.updated += 1,
            }

            for comment in &note.comments {
                sqlx::query(
                    r#"
                    INSERT INTO note_comments (note_id, seq, action, created_at, author, body)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (note_id, seq) DO UPDATE SET
                        action = EXCLUDED.action,
                        created_at = EXCLUDED.created_at,
                        author = EXCLUDED.author,
                        body = EXCLUDED.body
                    "#,
                )
                .bind(note.id)
                .bind(comment.seq)
                .bind(&comment.action)
                .bind(comment.created_at)
                .bind(&comment.author)
                .bind(&comment.text)
                .execute(&mut *tx)
                .await?;
                summary.comments += 1;
            }
        }

        tx.commit().await?;
        Ok(summary)
    }

    async fn get_note(&self, id: NoteId) -> Result<Option<StoredNote>> {
        let row: Option<NoteRow> = sqlx::query_as(
            "SELECT id, lat, lon, updated_at, status, region_state, region_id FROM notes WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(StoredNote::try_from).transpose()
    }

    async fn note_id_bounds(&self) -> Result<Option<(NoteId, NoteId)>> {
        let (min, max): (Option<i64>, Option<i64>) =
            sqlx::query_as("SELECT MIN(id), MAX(id) FROM notes")
                .fetch_one(&self.pool)
                .await?;
        Ok(min.zip(max))
    }

    async fn notes_in_range(&self, start: NoteId, end: NoteId) -> Result<Vec<StoredNote>> {
        let rows: Vec<NoteRow> = sqlx::query_as(
            "SELECT id, lat, lon, updated_at, status, region_state, region_id FROM notes \
             WHERE id BETWEEN $1 AND $2 ORDER BY id",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(StoredNote::try_from).collect()
    }

    async fn invalidate_regions(&self, ids: &[NoteId]) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE notes SET region_state = 'unknown', region_id = NULL \
             WHERE id = ANY($1) AND region_state <> 'unknown'",
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn assign_regions(&self, assignments: &[(NoteId, RegionAssignment)]) -> Result<u64> {
        let mut ids = Vec::with_capacity(assignments.len());
        let mut states = Vec::with_capacity(assignments.len());
        let mut region_ids: Vec<Option<i64>> = Vec::with_capacity(assignments.len());
        for (id, assignment) in assignments {
            let (state, region_id) = assignment.to_columns();
            ids.push(*id);
            states.push(state.to_string());
            region_ids.push(region_id);
        }

        let result = sqlx::query(
            r#"
            UPDATE notes n
            SET region_state = a.state, region_id = a.region_id
            FROM UNNEST($1::BIGINT[], $2::TEXT[], $3::BIGINT[]) AS a(id, state, region_id)
            WHERE n.id = a.id AND n.region_state = 'unknown'
            "#,
        )
        .bind(&ids)
        .bind(&states)
        .bind(&region_ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn load_regions(&self) -> Result<Vec<Region>> {
        let rows: Vec<(i64, String, Json<Vec<Vec<Vec<[f64; 2]>>>>)> =
            sqlx::query_as("SELECT id, name, boundary FROM regions ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(id, name, Json(polygons))| RegionBoundary { id, name, polygons }.into_region())
            .collect()
    }

    async fn upsert_regions(&self, regions: &[RegionBoundary]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut changed = 0;
        for region in regions {
            let result = sqlx::query(
                "INSERT INTO regions (id, name, boundary) VALUES ($1, $2, $3) \
                 ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, \
                 boundary = EXCLUDED.boundary, updated_at = NOW() \
                 WHERE regions.name IS DISTINCT FROM EXCLUDED.name \
                 OR regions.boundary IS DISTINCT FROM EXCLUDED.boundary",
            )
            .bind(region.id)
            .bind(&region.name)
            .bind(Json(&region.polygons))
            .execute(&mut *tx)
            .await?;
            changed += result.rows_affected();
        }
        tx.commit().await?;
        Ok(changed)
    }
}

#[async_trait]
impl ProgressStore for PgStore {
    async fn read_watermark(&self, feed: &str) -> Result<Option<Watermark>> {
        let value: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT value FROM sync_watermarks WHERE feed = $1")
                .bind(feed)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.map(Watermark))
    }

    async fn advance_watermark(
        &self,
        feed: &str,
        expected: Option<Watermark>,
        new: Watermark,
    ) -> Result<Watermark> {
        let mut tx = self.pool.begin().await?;

        let current: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT value FROM sync_watermarks WHERE feed = $1 FOR UPDATE")
                .bind(feed)
                .fetch_optional(&mut *tx)
                .await?;
        let current = current.map(Watermark);
        if current < expected {
            return Err(SyncError::Consistency(format!(
                "watermark for {feed} regressed: expected at least {expected:?}, found {current:?}"
            )));
        }

        let stored: DateTime<Utc> = sqlx::query_scalar(
            "INSERT INTO sync_watermarks (feed, value) VALUES ($1, $2) \
             ON CONFLICT (feed) DO UPDATE SET value = GREATEST(sync_watermarks.value, EXCLUDED.value), \
             updated_at = NOW() RETURNING value",
        )
        .bind(feed)
        .bind(new.0)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Watermark(stored))
    }

    async fn read_chunk_cursor(&self, pass: &str) -> Result<i64> {
        let value: Option<i64> = sqlx::query_scalar("SELECT value FROM chunk_cursors WHERE pass = $1")
            .bind(pass)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value.unwrap_or(0))
    }

    async fn advance_chunk_cursor(&self, pass: &str, to: i64) -> Result<i64> {
        let value: i64 = sqlx::query_scalar(
            "INSERT INTO chunk_cursors (pass, value) VALUES ($1, $2) \
             ON CONFLICT (pass) DO UPDATE SET value = GREATEST(chunk_cursors.value, EXCLUDED.value), \
             updated_at = NOW() RETURNING value",
        )
        .bind(pass)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;
        Ok(value)
    }

    async fn reset_chunk_cursor(&self, pass: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO chunk_cursors (pass, value) VALUES ($1, 0) \
             ON CONFLICT (pass) DO UPDATE SET value = 0, updated_at = NOW()",
        )
        .bind(pass)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_partition(&self, batch_id: &str, partition: &Partition) -> Result<()> {
        let partition_id = i32::try_from(partition.id)
            .map_err(|_| SyncError::DataValidation(format!("partition id {} out of range", partition.id)))?;
        sqlx::query(
            "INSERT INTO ingest_partitions (batch_id, partition_id, start_offset, end_offset, state) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (batch_id, partition_id) DO UPDATE SET start_offset = EXCLUDED.start_offset, \
             end_offset = EXCLUDED.end_offset, state = EXCLUDED.state, updated_at = NOW()",
        )
        .bind(batch_id)
        .bind(partition_id)
        .bind(offset(partition.start)?)
        .bind(offset(partition.end)?)
        .bind(partition.state.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_partitions(&self, batch_id: &str) -> Result<Vec<Partition>> {
        let rows: Vec<PartitionRow> = sqlx::query_as(
            "SELECT partition_id, start_offset, end_offset, state FROM ingest_partitions \
             WHERE batch_id = $1 ORDER BY partition_id",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Partition::try_from).collect()
    }

    async fn write_status(&self, status: &SyncStatusRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_status (instance, record) VALUES ($1, $2) \
             ON CONFLICT (instance) DO UPDATE SET record = EXCLUDED.record, updated_at = NOW()",
        )
        .bind(&status.instance)
        .bind(Json(status))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_status(&self, instance: &str) -> Result<Option<SyncStatusRecord>> {
        let record: Option<Json<SyncStatusRecord>> =
            sqlx::query_scalar("SELECT record FROM sync_status WHERE instance = $1")
                .bind(instance)
                .fetch_optional(&self.pool)
                .await?;
        Ok(record.map(|Json(r)| r))
    }
}

#[async_trait]
impl SchedulerLedger for PgStore {
    async fn issue_ticket(&self, queue: &str, holder: &str) -> Result<Ticket> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO scheduler_queues (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(queue)
            .execute(&mut *tx)
            .await?;

        let seq: i64 = sqlx::query_scalar(
            "UPDATE scheduler_queues SET next_ticket = next_ticket + 1, \
             serving_since = CASE WHEN now_serving = next_ticket THEN NOW() ELSE serving_since END \
             WHERE name = $1 RETURNING next_ticket - 1",
        )
        .bind(queue)
        .fetch_one(&mut *tx)
        .await?;

        let issued_at: DateTime<Utc> = sqlx::query_scalar(
            "INSERT INTO scheduler_tickets (queue, seq, holder) VALUES ($1, $2, $3) RETURNING issued_at",
        )
        .bind(queue)
        .bind(seq)
        .bind(holder)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Ticket {
            queue: queue.to_string(),
            seq,
            issued_at,
        })
    }

    async fn queue_state(&self, queue: &str) -> Result<QueueState> {
        let row: Option<(i64, i64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT now_serving, next_ticket, serving_since FROM scheduler_queues WHERE name = $1",
        )
        .bind(queue)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((now_serving, next_ticket, serving_since)) => QueueState {
                now_serving,
                next_ticket,
                serving_since,
            },
            None => QueueState {
                now_serving: 1,
                next_ticket: 1,
                serving_since: Utc::now(),
            },
        })
    }

    async fn release_ticket(&self, queue: &str, seq: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::release_in_tx(&mut tx, queue, seq, false).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn expire_ticket(&self, queue: &str, seq: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let expired = Self::release_in_tx(&mut tx, queue, seq, true).await?;
        tx.commit().await?;
        Ok(expired)
    }

    async fn renew_ticket(&self, queue: &str, seq: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE scheduler_queues SET serving_since = NOW() \
             WHERE name = $1 AND now_serving = $2 AND next_ticket > $2",
        )
        .bind(queue)
        .bind(seq)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl LeaseLocks for PgStore {
    async fn try_acquire_lock(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_locks (name, holder, acquired_at, expires_at)
            VALUES ($1, $2, NOW(), NOW() + make_interval(secs => $3))
            ON CONFLICT (name) DO UPDATE SET
                holder = EXCLUDED.holder,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
            WHERE sync_locks.expires_at < NOW() OR sync_locks.holder = EXCLUDED.holder
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn renew_lock(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sync_locks SET expires_at = NOW() + make_interval(secs => $3) \
             WHERE name = $1 AND holder = $2",
        )
        .bind(name)
        .bind(holder)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(&self, name: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM sync_locks WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
