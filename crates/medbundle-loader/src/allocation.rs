//! Work allocation against the shared relational store
//!
//! All cross-worker coordination runs through the `AllocationStore`
//! contract. The claim is one atomic update-then-select keyed on "currently
//! unclaimed": no two concurrent calls can stamp the same WorkItem, no
//! matter how many workers race. `AllocationCoordinator` is the Postgres
//! implementation; every operation is a single statement (or a statement
//! pair whose first half is the atomic claim), so a terminated call leaves
//! no partial state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::AllocationError;
use crate::models::{
    AllocatedItem, FileType, InstanceStatus, LoaderInstance, LogicalResourceRecord, PathFilter,
    WorkItem,
};

/// Access contract for the shared coordination tables
#[async_trait]
pub trait AllocationStore: Send + Sync {
    /// Register this worker process at startup
    async fn register_instance(&self, instance: &LoaderInstance) -> Result<(), AllocationError>;

    /// Refresh this worker's liveness timestamp
    async fn touch_heartbeat(&self, instance_id: Uuid) -> Result<(), AllocationError>;

    /// Move this worker through its lifecycle states
    async fn set_instance_status(
        &self,
        instance_id: Uuid,
        status: InstanceStatus,
    ) -> Result<(), AllocationError>;

    /// Atomically claim up to `max_count` unclaimed WorkItems for one worker
    ///
    /// Items are stamped with a fresh single-use allocation run id and the
    /// claiming instance, ordered by last-modified time then item id. One
    /// LoadAttempt row is created per stamped item. Zero matches is an empty
    /// result, not an error.
    async fn allocate_work(
        &self,
        file_type: FileType,
        instance_id: Uuid,
        max_count: i64,
        path_filters: &[PathFilter],
    ) -> Result<Vec<AllocatedItem>, AllocationError>;

    /// Byte size of a WorkItem, for progress reporting
    async fn work_item_size(&self, work_item_id: i64) -> Result<i64, AllocationError>;

    /// Persist a partition's opaque checkpoint blob on its LoadAttempt
    async fn save_checkpoint(
        &self,
        load_attempt_id: i64,
        blob: &serde_json::Value,
    ) -> Result<(), AllocationError>;

    /// Newest persisted checkpoint blob for a WorkItem, if any
    async fn load_checkpoint(
        &self,
        work_item_id: i64,
    ) -> Result<Option<serde_json::Value>, AllocationError>;

    /// Mark a LoadAttempt finished with its final counters
    async fn complete_attempt(
        &self,
        load_attempt_id: i64,
        rows_processed: i64,
        failure_count: i64,
    ) -> Result<(), AllocationError>;

    /// Append one audit record; returns false when the (type, id) pair
    /// already exists from a prior attempt
    async fn append_resource_record(
        &self,
        record: &LogicalResourceRecord,
    ) -> Result<bool, AllocationError>;
}

/// Postgres-backed allocation coordinator
#[derive(Clone)]
pub struct AllocationCoordinator {
    pool: PgPool,
}

impl AllocationCoordinator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build the single-statement claim for one allocation run
    fn claim_query<'a>(
        allocation_id: i64,
        file_type: FileType,
        instance_id: Uuid,
        max_count: i64,
        path_filters: &'a [PathFilter],
    ) -> QueryBuilder<'a, Postgres> {
        let mut builder = QueryBuilder::new("UPDATE work_items SET allocation_id = ");
        builder.push_bind(allocation_id);
        builder.push(", loader_instance_id = ");
        builder.push_bind(instance_id);
        builder.push(
            " WHERE id IN (SELECT id FROM work_items WHERE allocation_id IS NULL AND file_type = ",
        );
        builder.push_bind(file_type.as_str().to_string());

        if !path_filters.is_empty() {
            builder.push(" AND (");
            for (i, filter) in path_filters.iter().enumerate() {
                if i > 0 {
                    builder.push(" OR ");
                }
                builder.push("(bucket = ");
                builder.push_bind(&filter.bucket);
                builder.push(" AND object_path LIKE ");
                builder.push_bind(format!("{}%", filter.path_prefix));
                builder.push(")");
            }
            builder.push(")");
        }

        // Deterministic order: fairness across racing coordinators and a
        // fixed lock order between them.
        builder.push(" ORDER BY last_modified, id LIMIT ");
        builder.push_bind(max_count);
        builder.push(" FOR UPDATE SKIP LOCKED)");
        builder
    }
}

#[async_trait]
impl AllocationStore for AllocationCoordinator {
    #[instrument(skip(self, instance), fields(instance_id = %instance.id))]
    async fn register_instance(&self, instance: &LoaderInstance) -> Result<(), AllocationError> {
        sqlx::query(
            r#"
            INSERT INTO loader_instances (id, hostname, pid, heartbeat, status)
            VALUES ($1, $2, $3, NOW(), $4)
            "#,
        )
        .bind(instance.id)
        .bind(&instance.hostname)
        .bind(instance.pid)
        .bind(instance.status.as_str())
        .execute(&self.pool)
        .await?;

        info!(
            hostname = %instance.hostname,
            pid = instance.pid,
            "Registered loader instance"
        );

        Ok(())
    }

    async fn touch_heartbeat(&self, instance_id: Uuid) -> Result<(), AllocationError> {
        sqlx::query("UPDATE loader_instances SET heartbeat = NOW() WHERE id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn set_instance_status(
        &self,
        instance_id: Uuid,
        status: InstanceStatus,
    ) -> Result<(), AllocationError> {
        sqlx::query("UPDATE loader_instances SET status = $1, heartbeat = NOW() WHERE id = $2")
            .bind(status.as_str())
            .bind(instance_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    #[instrument(skip(self, path_filters), fields(filters = path_filters.len()))]
    async fn allocate_work(
        &self,
        file_type: FileType,
        instance_id: Uuid,
        max_count: i64,
        path_filters: &[PathFilter],
    ) -> Result<Vec<AllocatedItem>, AllocationError> {
        if max_count <= 0 {
            return Ok(Vec::new());
        }

        // A fresh run id from the shared sequence; single-use by construction.
        let allocation_id: i64 = sqlx::query_scalar("SELECT nextval('allocation_run_seq')")
            .fetch_one(&self.pool)
            .await?;

        let mut claim =
            Self::claim_query(allocation_id, file_type, instance_id, max_count, path_filters);
        let claimed = claim
            .build()
            .execute(&self.pool)
            .await?
            .rows_affected();

        if claimed == 0 {
            debug!(allocation_id, "No unclaimed work items matched");
            return Ok(Vec::new());
        }

        sqlx::query(
            r#"
            INSERT INTO load_attempts
                (work_item_id, allocation_id, loader_instance_id, item_version, started_at)
            SELECT id, allocation_id, loader_instance_id, version, NOW()
            FROM work_items
            WHERE allocation_id = $1
            "#,
        )
        .bind(allocation_id)
        .execute(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT w.id, w.bucket, w.object_path, w.object_name, w.size_bytes,
                   w.file_type, w.etag, w.last_modified, w.version,
                   w.allocation_id, w.loader_instance_id,
                   a.id AS load_attempt_id
            FROM work_items w
            JOIN load_attempts a
              ON a.work_item_id = w.id AND a.allocation_id = w.allocation_id
            WHERE w.allocation_id = $1
            ORDER BY w.last_modified, w.id
            "#,
        )
        .bind(allocation_id)
        .fetch_all(&self.pool)
        .await?;

        info!(allocation_id, claimed = rows.len(), "Claimed work items");

        rows.into_iter()
            .map(|row| {
                let item = WorkItem {
                    id: row.try_get("id")?,
                    bucket: row.try_get("bucket")?,
                    object_path: row.try_get("object_path")?,
                    object_name: row.try_get("object_name")?,
                    size_bytes: row.try_get("size_bytes")?,
                    file_type: FileType::from(row.try_get::<String, _>("file_type")?),
                    etag: row.try_get("etag")?,
                    last_modified: row.try_get::<DateTime<Utc>, _>("last_modified")?,
                    version: row.try_get("version")?,
                    allocation_id: row.try_get("allocation_id")?,
                    loader_instance_id: row.try_get("loader_instance_id")?,
                };
                Ok(AllocatedItem {
                    item,
                    load_attempt_id: row.try_get("load_attempt_id")?,
                })
            })
            .collect()
    }

    async fn work_item_size(&self, work_item_id: i64) -> Result<i64, AllocationError> {
        let size: i64 = sqlx::query_scalar("SELECT size_bytes FROM work_items WHERE id = $1")
            .bind(work_item_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(size)
    }

    async fn save_checkpoint(
        &self,
        load_attempt_id: i64,
        blob: &serde_json::Value,
    ) -> Result<(), AllocationError> {
        sqlx::query("UPDATE load_attempts SET checkpoint = $1 WHERE id = $2")
            .bind(blob)
            .bind(load_attempt_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn load_checkpoint(
        &self,
        work_item_id: i64,
    ) -> Result<Option<serde_json::Value>, AllocationError> {
        let blob: Option<serde_json::Value> = sqlx::query_scalar(
            r#"
            SELECT checkpoint FROM load_attempts
            WHERE work_item_id = $1 AND checkpoint IS NOT NULL
            ORDER BY started_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(work_item_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(blob)
    }

    async fn complete_attempt(
        &self,
        load_attempt_id: i64,
        rows_processed: i64,
        failure_count: i64,
    ) -> Result<(), AllocationError> {
        sqlx::query(
            r#"
            UPDATE load_attempts
            SET completed_at = NOW(), rows_processed = $1, failure_count = $2
            WHERE id = $3
            "#,
        )
        .bind(rows_processed)
        .bind(failure_count)
        .bind(load_attempt_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_resource_record(
        &self,
        record: &LogicalResourceRecord,
    ) -> Result<bool, AllocationError> {
        let result = sqlx::query(
            r#"
            INSERT INTO logical_resource_records
                (resource_type, logical_id, work_item_id, allocation_id,
                 line_number, response_time_ms)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (resource_type, logical_id) DO NOTHING
            "#,
        )
        .bind(&record.resource_type)
        .bind(&record.logical_id)
        .bind(record.work_item_id)
        .bind(record.allocation_id)
        .bind(record.line_number)
        .bind(record.response_time_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
