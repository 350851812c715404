//! Request store trait and SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{CacheFileRepo, FileRefRepo, GroupRepo, JobRepo, LockRepo, RequestRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Maximum bind parameters per IN (...) batch.
const BATCH_SIZE: usize = 500;

/// Combined request store trait.
#[async_trait]
pub trait MetadataStore:
    RequestRepo + GroupRepo + FileRefRepo + CacheFileRepo + JobRepo + LockRepo + Send + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based request store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    query_timeout_secs: u64,
}

impl SqliteStore {
    /// Create a new SQLite store and apply the schema.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let query_timeout_secs = query_timeout_secs.unwrap_or(600);

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // SQLite permits limited write concurrency; a single connection serializes
            // bookkeeping writes within one process.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            query_timeout_secs,
        };
        store.migrate().await?;

        tracing::debug!(
            path = %path.display(),
            query_timeout_secs = store.query_timeout_secs,
            "SQLite request store opened"
        );

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// "?, ?, ?" with `n` placeholders.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Current time as unix milliseconds.
fn now_unix_ms() -> i64 {
    i64::try_from(time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000)
        .unwrap_or(i64::MAX)
}

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::repos::{JobState, RequestPatch};
    use sqlx::sqlite::SqliteConnection;
    use std::collections::{BTreeMap, BTreeSet, HashMap};
    use stowage_core::{
        FileRequest, NewFileRequest, RequestId, RequestKind, RequestResultInfo, RequestStatus,
    };
    use time::OffsetDateTime;
    use uuid::Uuid;

    // =========================================================================
    // Helpers
    // =========================================================================

    impl SqliteStore {
        /// Attach group ids and owners to request rows.
        async fn hydrate(&self, rows: Vec<FileRequestRow>) -> MetadataResult<Vec<FileRequest>> {
            if rows.is_empty() {
                return Ok(Vec::new());
            }

            let ids: Vec<i64> = rows.iter().map(|r| r.request_id).collect();
            let mut groups: HashMap<i64, BTreeSet<String>> = HashMap::new();
            let mut owners: HashMap<i64, BTreeSet<String>> = HashMap::new();

            for batch in ids.chunks(BATCH_SIZE) {
                let query = format!(
                    "SELECT request_id, group_id FROM file_request_groups WHERE request_id IN ({})",
                    placeholders(batch.len())
                );
                let mut q = sqlx::query_as::<_, (i64, String)>(&query);
                for id in batch {
                    q = q.bind(id);
                }
                for (id, group_id) in q.fetch_all(&self.pool).await? {
                    groups.entry(id).or_default().insert(group_id);
                }

                let query = format!(
                    "SELECT request_id, owner FROM file_request_owners WHERE request_id IN ({})",
                    placeholders(batch.len())
                );
                let mut q = sqlx::query_as::<_, (i64, String)>(&query);
                for id in batch {
                    q = q.bind(id);
                }
                for (id, owner) in q.fetch_all(&self.pool).await? {
                    owners.entry(id).or_default().insert(owner);
                }
            }

            rows.into_iter()
                .map(|row| {
                    let id = row.request_id;
                    row.into_request(
                        groups.remove(&id).unwrap_or_default(),
                        owners.remove(&id).unwrap_or_default(),
                    )
                })
                .collect()
        }

        async fn file_ref_owners(
            &self,
            checksum: &str,
            backend: &str,
        ) -> MetadataResult<BTreeSet<String>> {
            let owners: Vec<String> = sqlx::query_scalar(
                "SELECT owner FROM file_reference_owners WHERE checksum = ? AND backend = ?",
            )
            .bind(checksum)
            .bind(backend)
            .fetch_all(&self.pool)
            .await?;
            Ok(owners.into_iter().collect())
        }
    }

    /// Resolve a failed versioned write into `StaleWrite` or `NotFound`.
    async fn version_conflict(
        conn: &mut SqliteConnection,
        request_id: RequestId,
        expected_version: i64,
    ) -> MetadataError {
        let current: Result<Option<i64>, sqlx::Error> =
            sqlx::query_scalar("SELECT version FROM file_requests WHERE request_id = ?")
                .bind(request_id)
                .fetch_optional(&mut *conn)
                .await;
        match current {
            Ok(Some(actual)) => MetadataError::StaleWrite {
                entity: format!("request {request_id}"),
                expected: expected_version,
                actual,
            },
            Ok(None) => MetadataError::NotFound(format!("request {request_id} not found")),
            Err(e) => e.into(),
        }
    }

    async fn apply_patch(
        conn: &mut SqliteConnection,
        request_id: RequestId,
        expected_version: i64,
        patch: &RequestPatch,
        now: OffsetDateTime,
    ) -> MetadataResult<i64> {
        let result = sqlx::query(
            r#"
            UPDATE file_requests SET
                status = COALESCE(?, status),
                job_id = CASE WHEN ? THEN ? ELSE job_id END,
                error_cause = CASE WHEN ? THEN ? ELSE error_cause END,
                force_delete = COALESCE(?, force_delete),
                cache_group_id = CASE WHEN ? THEN ? ELSE cache_group_id END,
                storage_group_id = CASE WHEN ? THEN ? ELSE storage_group_id END,
                version = version + 1,
                updated_at = ?
            WHERE request_id = ? AND version = ?
            "#,
        )
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.job_id.is_some())
        .bind(patch.job_id.flatten())
        .bind(patch.error_cause.is_some())
        .bind(patch.error_cause.clone().flatten())
        .bind(patch.force_delete)
        .bind(patch.cache_group_id.is_some())
        .bind(patch.cache_group_id.clone().flatten())
        .bind(patch.storage_group_id.is_some())
        .bind(patch.storage_group_id.clone().flatten())
        .bind(now)
        .bind(request_id)
        .bind(expected_version)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(version_conflict(conn, request_id, expected_version).await);
        }

        for group_id in &patch.add_group_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO file_request_groups (request_id, group_id) VALUES (?, ?)",
            )
            .bind(request_id)
            .bind(group_id)
            .execute(&mut *conn)
            .await?;
        }
        for owner in &patch.add_owners {
            sqlx::query("INSERT OR IGNORE INTO file_request_owners (request_id, owner) VALUES (?, ?)")
                .bind(request_id)
                .bind(owner)
                .execute(&mut *conn)
                .await?;
        }

        Ok(expected_version + 1)
    }

    fn status_list(statuses: &[RequestStatus]) -> Vec<&'static str> {
        statuses.iter().map(|s| s.as_str()).collect()
    }

    // =========================================================================
    // File requests
    // =========================================================================

    #[async_trait]
    impl RequestRepo for SqliteStore {
        async fn create_request(&self, request: &NewFileRequest) -> MetadataResult<FileRequest> {
            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;

            let result = sqlx::query(
                r#"
                INSERT INTO file_requests (
                    kind, checksum, backend, status, session_owner, session, job_id,
                    error_cause, file_name, origin_url, file_size, storage_subdirectory,
                    force_delete, expiration_date, cache_group_id, storage_group_id,
                    version, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, NULL, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
                "#,
            )
            .bind(request.kind.as_str())
            .bind(&request.checksum)
            .bind(&request.backend)
            .bind(request.status.as_str())
            .bind(&request.session_owner)
            .bind(&request.session)
            .bind(&request.error_cause)
            .bind(&request.file_name)
            .bind(&request.origin_url)
            .bind(request.file_size)
            .bind(&request.storage_subdirectory)
            .bind(request.force_delete)
            .bind(request.expiration_date)
            .bind(&request.cache_group_id)
            .bind(&request.storage_group_id)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            let request_id = result.last_insert_rowid();

            for group_id in &request.group_ids {
                sqlx::query("INSERT INTO file_request_groups (request_id, group_id) VALUES (?, ?)")
                    .bind(request_id)
                    .bind(group_id)
                    .execute(&mut *tx)
                    .await?;
            }
            for owner in &request.owners {
                sqlx::query("INSERT INTO file_request_owners (request_id, owner) VALUES (?, ?)")
                    .bind(request_id)
                    .bind(owner)
                    .execute(&mut *tx)
                    .await?;
            }

            tx.commit().await?;

            Ok(FileRequest {
                id: request_id,
                kind: request.kind,
                checksum: request.checksum.clone(),
                backend: request.backend.clone(),
                status: request.status,
                group_ids: request.group_ids.clone(),
                owners: request.owners.clone(),
                session_owner: request.session_owner.clone(),
                session: request.session.clone(),
                job_id: None,
                error_cause: request.error_cause.clone(),
                file_name: request.file_name.clone(),
                origin_url: request.origin_url.clone(),
                file_size: request.file_size,
                storage_subdirectory: request.storage_subdirectory.clone(),
                force_delete: request.force_delete,
                expiration_date: request.expiration_date,
                cache_group_id: request.cache_group_id.clone(),
                storage_group_id: request.storage_group_id.clone(),
                version: 0,
                created_at: now,
                updated_at: now,
            })
        }

        async fn get_request(&self, request_id: RequestId) -> MetadataResult<Option<FileRequest>> {
            let row = sqlx::query_as::<_, FileRequestRow>(
                "SELECT * FROM file_requests WHERE request_id = ?",
            )
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;

            match row {
                Some(row) => Ok(self.hydrate(vec![row]).await?.pop()),
                None => Ok(None),
            }
        }

        async fn get_requests(&self, request_ids: &[RequestId]) -> MetadataResult<Vec<FileRequest>> {
            let mut rows = Vec::with_capacity(request_ids.len());
            for batch in request_ids.chunks(BATCH_SIZE) {
                let query = format!(
                    "SELECT * FROM file_requests WHERE request_id IN ({}) ORDER BY request_id",
                    placeholders(batch.len())
                );
                let mut q = sqlx::query_as::<_, FileRequestRow>(&query);
                for id in batch {
                    q = q.bind(id);
                }
                rows.extend(q.fetch_all(&self.pool).await?);
            }
            rows.sort_by_key(|r| r.request_id);
            self.hydrate(rows).await
        }

        async fn find_requests_by_checksums(
            &self,
            kind: RequestKind,
            checksums: &[String],
        ) -> MetadataResult<Vec<FileRequest>> {
            let mut rows = Vec::new();
            for batch in checksums.chunks(BATCH_SIZE) {
                let query = format!(
                    "SELECT * FROM file_requests WHERE kind = ? AND checksum IN ({}) ORDER BY request_id",
                    placeholders(batch.len())
                );
                let mut q = sqlx::query_as::<_, FileRequestRow>(&query).bind(kind.as_str());
                for checksum in batch {
                    q = q.bind(checksum);
                }
                rows.extend(q.fetch_all(&self.pool).await?);
            }
            rows.sort_by_key(|r| r.request_id);
            self.hydrate(rows).await
        }

        async fn list_requests_page(
            &self,
            kind: RequestKind,
            backend: &str,
            status: RequestStatus,
            after_id: RequestId,
            limit: u32,
        ) -> MetadataResult<Vec<FileRequest>> {
            let rows = sqlx::query_as::<_, FileRequestRow>(
                r#"
                SELECT * FROM file_requests
                WHERE kind = ? AND backend = ? AND status = ? AND request_id > ?
                ORDER BY request_id
                LIMIT ?
                "#,
            )
            .bind(kind.as_str())
            .bind(backend)
            .bind(status.as_str())
            .bind(after_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            self.hydrate(rows).await
        }

        async fn list_backends_with_status(
            &self,
            kind: RequestKind,
            status: RequestStatus,
        ) -> MetadataResult<Vec<String>> {
            let backends = sqlx::query_scalar::<_, String>(
                "SELECT DISTINCT backend FROM file_requests WHERE kind = ? AND status = ? ORDER BY backend",
            )
            .bind(kind.as_str())
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
            Ok(backends)
        }

        async fn exists_request(
            &self,
            kinds: &[RequestKind],
            checksum: &str,
            backend: Option<&str>,
            statuses: &[RequestStatus],
            exclude_id: Option<RequestId>,
        ) -> MetadataResult<bool> {
            if kinds.is_empty() || statuses.is_empty() {
                return Ok(false);
            }

            let mut query = format!(
                "SELECT EXISTS(SELECT 1 FROM file_requests WHERE checksum = ? AND kind IN ({}) AND status IN ({})",
                placeholders(kinds.len()),
                placeholders(statuses.len())
            );
            if backend.is_some() {
                query.push_str(" AND backend = ?");
            }
            if exclude_id.is_some() {
                query.push_str(" AND request_id != ?");
            }
            query.push(')');

            let mut q = sqlx::query_scalar::<_, bool>(&query).bind(checksum);
            for kind in kinds {
                q = q.bind(kind.as_str());
            }
            for status in status_list(statuses) {
                q = q.bind(status);
            }
            if let Some(backend) = backend {
                q = q.bind(backend);
            }
            if let Some(id) = exclude_id {
                q = q.bind(id);
            }
            Ok(q.fetch_one(&self.pool).await?)
        }

        async fn list_requests_by_group(
            &self,
            kind: Option<RequestKind>,
            group_id: &str,
        ) -> MetadataResult<Vec<FileRequest>> {
            let rows = match kind {
                Some(kind) => {
                    sqlx::query_as::<_, FileRequestRow>(
                        r#"
                        SELECT r.* FROM file_requests r
                        JOIN file_request_groups g ON g.request_id = r.request_id
                        WHERE g.group_id = ? AND r.kind = ?
                        ORDER BY r.request_id
                        "#,
                    )
                    .bind(group_id)
                    .bind(kind.as_str())
                    .fetch_all(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query_as::<_, FileRequestRow>(
                        r#"
                        SELECT r.* FROM file_requests r
                        JOIN file_request_groups g ON g.request_id = r.request_id
                        WHERE g.group_id = ?
                        ORDER BY r.request_id
                        "#,
                    )
                    .bind(group_id)
                    .fetch_all(&self.pool)
                    .await?
                }
            };
            self.hydrate(rows).await
        }

        async fn list_requests_by_owners(
            &self,
            kind: RequestKind,
            owners: &[String],
            status: RequestStatus,
        ) -> MetadataResult<Vec<FileRequest>> {
            let mut rows: BTreeMap<i64, FileRequestRow> = BTreeMap::new();
            for batch in owners.chunks(BATCH_SIZE) {
                let query = format!(
                    r#"
                    SELECT DISTINCT r.* FROM file_requests r
                    JOIN file_request_owners o ON o.request_id = r.request_id
                    WHERE r.kind = ? AND r.status = ? AND o.owner IN ({})
                    "#,
                    placeholders(batch.len())
                );
                let mut q = sqlx::query_as::<_, FileRequestRow>(&query)
                    .bind(kind.as_str())
                    .bind(status.as_str());
                for owner in batch {
                    q = q.bind(owner);
                }
                for row in q.fetch_all(&self.pool).await? {
                    rows.insert(row.request_id, row);
                }
            }
            self.hydrate(rows.into_values().collect()).await
        }

        async fn list_requests_by_job(&self, job_id: Uuid) -> MetadataResult<Vec<FileRequest>> {
            let rows = sqlx::query_as::<_, FileRequestRow>(
                "SELECT * FROM file_requests WHERE job_id = ? ORDER BY request_id",
            )
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
            self.hydrate(rows).await
        }

        async fn list_requests_by_status(
            &self,
            kind: RequestKind,
            status: RequestStatus,
            limit: u32,
        ) -> MetadataResult<Vec<FileRequest>> {
            let rows = sqlx::query_as::<_, FileRequestRow>(
                "SELECT * FROM file_requests WHERE kind = ? AND status = ? ORDER BY request_id LIMIT ?",
            )
            .bind(kind.as_str())
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            self.hydrate(rows).await
        }

        async fn find_copy_requests_by_stage_group(
            &self,
            group_id: &str,
        ) -> MetadataResult<Vec<FileRequest>> {
            let rows = sqlx::query_as::<_, FileRequestRow>(
                r#"
                SELECT * FROM file_requests
                WHERE kind = 'copy' AND (cache_group_id = ? OR storage_group_id = ?)
                ORDER BY request_id
                "#,
            )
            .bind(group_id)
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;
            self.hydrate(rows).await
        }

        async fn patch_request(
            &self,
            request_id: RequestId,
            expected_version: i64,
            patch: &RequestPatch,
        ) -> MetadataResult<i64> {
            let mut tx = self.pool.begin().await?;
            let version = apply_patch(
                &mut tx,
                request_id,
                expected_version,
                patch,
                OffsetDateTime::now_utc(),
            )
            .await?;
            tx.commit().await?;
            Ok(version)
        }

        async fn patch_requests(
            &self,
            patches: &[(RequestId, i64, RequestPatch)],
        ) -> MetadataResult<()> {
            if patches.is_empty() {
                return Ok(());
            }
            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;
            for (request_id, expected_version, patch) in patches {
                // Dropping the transaction on error rolls back earlier patches.
                apply_patch(&mut tx, *request_id, *expected_version, patch, now).await?;
            }
            tx.commit().await?;
            Ok(())
        }

        async fn delete_request(
            &self,
            request_id: RequestId,
            expected_version: i64,
        ) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            let result =
                sqlx::query("DELETE FROM file_requests WHERE request_id = ? AND version = ?")
                    .bind(request_id)
                    .bind(expected_version)
                    .execute(&mut *tx)
                    .await?;

            if result.rows_affected() == 0 {
                return Err(version_conflict(&mut tx, request_id, expected_version).await);
            }
            tx.commit().await?;
            Ok(())
        }

        async fn delete_requests_by_backend(
            &self,
            kind: RequestKind,
            backend: &str,
            status: Option<RequestStatus>,
        ) -> MetadataResult<Vec<FileRequest>> {
            let rows = match status {
                Some(status) => {
                    sqlx::query_as::<_, FileRequestRow>(
                        "SELECT * FROM file_requests WHERE kind = ? AND backend = ? AND status = ? ORDER BY request_id",
                    )
                    .bind(kind.as_str())
                    .bind(backend)
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query_as::<_, FileRequestRow>(
                        "SELECT * FROM file_requests WHERE kind = ? AND backend = ? ORDER BY request_id",
                    )
                    .bind(kind.as_str())
                    .bind(backend)
                    .fetch_all(&self.pool)
                    .await?
                }
            };
            let requests = self.hydrate(rows).await?;

            let mut deleted = Vec::with_capacity(requests.len());
            let mut tx = self.pool.begin().await?;
            for request in requests {
                let result =
                    sqlx::query("DELETE FROM file_requests WHERE request_id = ? AND version = ?")
                        .bind(request.id)
                        .bind(request.version)
                        .execute(&mut *tx)
                        .await?;
                // Rows changed since the read are left for the next purge.
                if result.rows_affected() == 1 {
                    deleted.push(request);
                }
            }
            tx.commit().await?;
            Ok(deleted)
        }

        async fn sum_request_sizes(
            &self,
            kind: RequestKind,
            statuses: &[RequestStatus],
        ) -> MetadataResult<i64> {
            if statuses.is_empty() {
                return Ok(0);
            }
            let query = format!(
                "SELECT COALESCE(SUM(file_size), 0) FROM file_requests WHERE kind = ? AND status IN ({})",
                placeholders(statuses.len())
            );
            let mut q = sqlx::query_scalar::<_, i64>(&query).bind(kind.as_str());
            for status in status_list(statuses) {
                q = q.bind(status);
            }
            Ok(q.fetch_one(&self.pool).await?)
        }

        async fn count_requests_by_status(&self) -> MetadataResult<Vec<(String, String, i64)>> {
            let rows = sqlx::query_as::<_, (String, String, i64)>(
                "SELECT kind, status, COUNT(*) FROM file_requests GROUP BY kind, status ORDER BY kind, status",
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    // =========================================================================
    // Groups
    // =========================================================================

    #[async_trait]
    impl GroupRepo for SqliteStore {
        async fn create_group(&self, group: &GroupRow) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                INSERT INTO tracked_groups (group_id, kind, expected_count, expires_at, created_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(group_id) DO NOTHING
                "#,
            )
            .bind(&group.group_id)
            .bind(&group.kind)
            .bind(group.expected_count)
            .bind(group.expires_at)
            .bind(group.created_at)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn get_group(&self, group_id: &str) -> MetadataResult<Option<GroupRow>> {
            let row =
                sqlx::query_as::<_, GroupRow>("SELECT * FROM tracked_groups WHERE group_id = ?")
                    .bind(group_id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn record_group_result(&self, result: &RequestResultInfo) -> MetadataResult<bool> {
            let row = GroupResultRow::from_info(result)?;
            let inserted = sqlx::query(
                r#"
                INSERT OR IGNORE INTO group_results (
                    group_id, kind, checksum, backend, owners_json, is_error,
                    error_cause, result_file, created_at
                )
                SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?
                WHERE EXISTS (SELECT 1 FROM tracked_groups WHERE group_id = ?)
                "#,
            )
            .bind(&row.group_id)
            .bind(&row.kind)
            .bind(&row.checksum)
            .bind(&row.backend)
            .bind(&row.owners_json)
            .bind(row.is_error)
            .bind(&row.error_cause)
            .bind(&row.result_file)
            .bind(row.created_at)
            .bind(&row.group_id)
            .execute(&self.pool)
            .await?;
            Ok(inserted.rows_affected() == 1)
        }

        async fn list_group_results(&self, group_id: &str) -> MetadataResult<Vec<RequestResultInfo>> {
            let rows = sqlx::query_as::<_, GroupResultRow>(
                "SELECT * FROM group_results WHERE group_id = ? ORDER BY checksum, backend",
            )
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(GroupResultRow::into_info).collect()
        }

        async fn list_completed_groups(&self, now_unix: i64, limit: u32) -> MetadataResult<Vec<GroupRow>> {
            let rows = sqlx::query_as::<_, GroupRow>(
                r#"
                SELECT g.* FROM tracked_groups g
                WHERE g.expires_at > ?
                  AND (SELECT COUNT(*) FROM group_results r WHERE r.group_id = g.group_id) >= g.expected_count
                ORDER BY g.created_at, g.group_id
                LIMIT ?
                "#,
            )
            .bind(now_unix)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn take_completed_group(
            &self,
            group_id: &str,
            now_unix: i64,
        ) -> MetadataResult<Option<(GroupRow, Vec<RequestResultInfo>)>> {
            let mut tx = self.pool.begin().await?;

            let Some(group) = sqlx::query_as::<_, GroupRow>(
                "SELECT * FROM tracked_groups WHERE group_id = ? AND expires_at > ?",
            )
            .bind(group_id)
            .bind(now_unix)
            .fetch_optional(&mut *tx)
            .await?
            else {
                return Ok(None);
            };

            let rows = sqlx::query_as::<_, GroupResultRow>(
                "SELECT * FROM group_results WHERE group_id = ? ORDER BY checksum, backend",
            )
            .bind(group_id)
            .fetch_all(&mut *tx)
            .await?;

            if i64::try_from(rows.len()).unwrap_or(i64::MAX) < group.expected_count {
                return Ok(None);
            }

            let deleted = sqlx::query("DELETE FROM tracked_groups WHERE group_id = ?")
                .bind(group_id)
                .execute(&mut *tx)
                .await?;
            if deleted.rows_affected() != 1 {
                return Ok(None);
            }
            // Results go with the group through ON DELETE CASCADE.
            tx.commit().await?;

            let results = rows
                .into_iter()
                .map(GroupResultRow::into_info)
                .collect::<MetadataResult<Vec<_>>>()?;
            Ok(Some((group, results)))
        }

        async fn list_expired_groups(&self, now_unix: i64, limit: u32) -> MetadataResult<Vec<GroupRow>> {
            let rows = sqlx::query_as::<_, GroupRow>(
                "SELECT * FROM tracked_groups WHERE expires_at <= ? ORDER BY expires_at, group_id LIMIT ?",
            )
            .bind(now_unix)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_group(&self, group_id: &str) -> MetadataResult<bool> {
            let result = sqlx::query("DELETE FROM tracked_groups WHERE group_id = ?")
                .bind(group_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn count_groups(&self) -> MetadataResult<i64> {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tracked_groups")
                .fetch_one(&self.pool)
                .await?;
            Ok(count)
        }
    }

    // =========================================================================
    // File reference catalog
    // =========================================================================

    #[async_trait]
    impl FileRefRepo for SqliteStore {
        async fn get_file_ref(
            &self,
            checksum: &str,
            backend: &str,
        ) -> MetadataResult<Option<FileReference>> {
            let row = sqlx::query_as::<_, FileRefRow>(
                "SELECT * FROM file_references WHERE checksum = ? AND backend = ?",
            )
            .bind(checksum)
            .bind(backend)
            .fetch_optional(&self.pool)
            .await?;

            match row {
                Some(row) => {
                    let owners = self.file_ref_owners(checksum, backend).await?;
                    Ok(Some(FileReference::from_row(row, owners)))
                }
                None => Ok(None),
            }
        }

        async fn find_file_refs(&self, checksums: &[String]) -> MetadataResult<Vec<FileReference>> {
            let mut refs = Vec::new();
            for batch in checksums.chunks(BATCH_SIZE) {
                let query = format!(
                    "SELECT * FROM file_references WHERE checksum IN ({}) ORDER BY checksum, backend",
                    placeholders(batch.len())
                );
                let mut q = sqlx::query_as::<_, FileRefRow>(&query);
                for checksum in batch {
                    q = q.bind(checksum);
                }
                let rows = q.fetch_all(&self.pool).await?;

                let query = format!(
                    "SELECT checksum, backend, owner FROM file_reference_owners WHERE checksum IN ({})",
                    placeholders(batch.len())
                );
                let mut q = sqlx::query_as::<_, (String, String, String)>(&query);
                for checksum in batch {
                    q = q.bind(checksum);
                }
                let mut owners: HashMap<(String, String), BTreeSet<String>> = HashMap::new();
                for (checksum, backend, owner) in q.fetch_all(&self.pool).await? {
                    owners.entry((checksum, backend)).or_default().insert(owner);
                }

                for row in rows {
                    let key = (row.checksum.clone(), row.backend.clone());
                    let row_owners = owners.remove(&key).unwrap_or_default();
                    refs.push(FileReference::from_row(row, row_owners));
                }
            }
            Ok(refs)
        }

        async fn upsert_file_ref(&self, reference: &FileReference) -> MetadataResult<FileReference> {
            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                r#"
                INSERT INTO file_references (checksum, backend, file_name, file_size, location_url, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(checksum, backend) DO UPDATE SET updated_at = excluded.updated_at
                "#,
            )
            .bind(&reference.checksum)
            .bind(&reference.backend)
            .bind(&reference.file_name)
            .bind(reference.file_size)
            .bind(&reference.location_url)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            for owner in &reference.owners {
                sqlx::query(
                    "INSERT OR IGNORE INTO file_reference_owners (checksum, backend, owner) VALUES (?, ?, ?)",
                )
                .bind(&reference.checksum)
                .bind(&reference.backend)
                .bind(owner)
                .execute(&mut *tx)
                .await?;
            }

            let row = sqlx::query_as::<_, FileRefRow>(
                "SELECT * FROM file_references WHERE checksum = ? AND backend = ?",
            )
            .bind(&reference.checksum)
            .bind(&reference.backend)
            .fetch_one(&mut *tx)
            .await?;
            let owners: Vec<String> = sqlx::query_scalar(
                "SELECT owner FROM file_reference_owners WHERE checksum = ? AND backend = ?",
            )
            .bind(&reference.checksum)
            .bind(&reference.backend)
            .fetch_all(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(FileReference::from_row(row, owners.into_iter().collect()))
        }

        async fn remove_file_ref_owner(
            &self,
            checksum: &str,
            backend: &str,
            owner: &str,
        ) -> MetadataResult<Option<usize>> {
            let mut tx = self.pool.begin().await?;

            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM file_references WHERE checksum = ? AND backend = ?)",
            )
            .bind(checksum)
            .bind(backend)
            .fetch_one(&mut *tx)
            .await?;
            if !exists {
                return Ok(None);
            }

            sqlx::query(
                "DELETE FROM file_reference_owners WHERE checksum = ? AND backend = ? AND owner = ?",
            )
            .bind(checksum)
            .bind(backend)
            .bind(owner)
            .execute(&mut *tx)
            .await?;

            let remaining: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM file_reference_owners WHERE checksum = ? AND backend = ?",
            )
            .bind(checksum)
            .bind(backend)
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(Some(usize::try_from(remaining).unwrap_or(0)))
        }

        async fn delete_file_ref(&self, checksum: &str, backend: &str) -> MetadataResult<bool> {
            let result = sqlx::query("DELETE FROM file_references WHERE checksum = ? AND backend = ?")
                .bind(checksum)
                .bind(backend)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() == 1)
        }
    }

    // =========================================================================
    // Cache entries
    // =========================================================================

    #[async_trait]
    impl CacheFileRepo for SqliteStore {
        async fn get_cache_file(&self, checksum: &str) -> MetadataResult<Option<CacheFile>> {
            let Some(row) =
                sqlx::query_as::<_, CacheFileRow>("SELECT * FROM cache_files WHERE checksum = ?")
                    .bind(checksum)
                    .fetch_optional(&self.pool)
                    .await?
            else {
                return Ok(None);
            };

            let group_ids: Vec<String> =
                sqlx::query_scalar("SELECT group_id FROM cache_file_groups WHERE checksum = ?")
                    .bind(checksum)
                    .fetch_all(&self.pool)
                    .await?;

            Ok(Some(CacheFile {
                checksum: row.checksum,
                file_size: row.file_size,
                location_url: row.location_url,
                expiration_date: row.expiration_date,
                group_ids: group_ids.into_iter().collect(),
            }))
        }

        async fn upsert_cache_file(&self, file: &CacheFile) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;

            let existing: Option<OffsetDateTime> =
                sqlx::query_scalar("SELECT expiration_date FROM cache_files WHERE checksum = ?")
                    .bind(&file.checksum)
                    .fetch_optional(&mut *tx)
                    .await?;
            let expiration = existing
                .map(|current| current.max(file.expiration_date))
                .unwrap_or(file.expiration_date);

            sqlx::query(
                r#"
                INSERT INTO cache_files (checksum, file_size, location_url, expiration_date, created_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(checksum) DO UPDATE SET
                    file_size = excluded.file_size,
                    location_url = excluded.location_url,
                    expiration_date = excluded.expiration_date
                "#,
            )
            .bind(&file.checksum)
            .bind(file.file_size)
            .bind(&file.location_url)
            .bind(expiration)
            .bind(OffsetDateTime::now_utc())
            .execute(&mut *tx)
            .await?;

            for group_id in &file.group_ids {
                sqlx::query(
                    "INSERT OR IGNORE INTO cache_file_groups (checksum, group_id) VALUES (?, ?)",
                )
                .bind(&file.checksum)
                .bind(group_id)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            Ok(())
        }

        async fn hold_cache_file(
            &self,
            checksum: &str,
            group_ids: &[String],
            expiration: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let mut tx = self.pool.begin().await?;

            let Some(current) =
                sqlx::query_scalar::<_, OffsetDateTime>(
                    "SELECT expiration_date FROM cache_files WHERE checksum = ?",
                )
                .bind(checksum)
                .fetch_optional(&mut *tx)
                .await?
            else {
                return Ok(false);
            };

            if expiration > current {
                sqlx::query("UPDATE cache_files SET expiration_date = ? WHERE checksum = ?")
                    .bind(expiration)
                    .bind(checksum)
                    .execute(&mut *tx)
                    .await?;
            }

            for group_id in group_ids {
                sqlx::query(
                    "INSERT OR IGNORE INTO cache_file_groups (checksum, group_id) VALUES (?, ?)",
                )
                .bind(checksum)
                .bind(group_id)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            Ok(true)
        }

        async fn release_cache_file(
            &self,
            checksum: &str,
            group_id: &str,
        ) -> MetadataResult<Option<usize>> {
            let mut tx = self.pool.begin().await?;

            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM cache_files WHERE checksum = ?)")
                    .bind(checksum)
                    .fetch_one(&mut *tx)
                    .await?;
            if !exists {
                return Ok(None);
            }

            sqlx::query("DELETE FROM cache_file_groups WHERE checksum = ? AND group_id = ?")
                .bind(checksum)
                .bind(group_id)
                .execute(&mut *tx)
                .await?;

            let remaining: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM cache_file_groups WHERE checksum = ?")
                    .bind(checksum)
                    .fetch_one(&mut *tx)
                    .await?;

            tx.commit().await?;
            Ok(Some(usize::try_from(remaining).unwrap_or(0)))
        }

        async fn delete_cache_file(&self, checksum: &str) -> MetadataResult<bool> {
            let result = sqlx::query("DELETE FROM cache_files WHERE checksum = ?")
                .bind(checksum)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn total_cache_size(&self) -> MetadataResult<i64> {
            let total: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(file_size), 0) FROM cache_files")
                .fetch_one(&self.pool)
                .await?;
            Ok(total)
        }
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    #[async_trait]
    impl JobRepo for SqliteStore {
        async fn create_job(&self, job: &JobRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO jobs (job_id, kind, backend, payload_json, state, error, created_at, started_at, finished_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(job.job_id)
            .bind(&job.kind)
            .bind(&job.backend)
            .bind(&job.payload_json)
            .bind(&job.state)
            .bind(&job.error)
            .bind(job.created_at)
            .bind(job.started_at)
            .bind(job.finished_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get_job(&self, job_id: Uuid) -> MetadataResult<Option<JobRow>> {
            let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE job_id = ?")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn claim_queued_jobs(&self, limit: u32) -> MetadataResult<Vec<JobRow>> {
            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;

            let candidates = sqlx::query_as::<_, JobRow>(
                "SELECT * FROM jobs WHERE state = 'queued' ORDER BY created_at, job_id LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&mut *tx)
            .await?;

            let mut claimed = Vec::with_capacity(candidates.len());
            for mut job in candidates {
                let result = sqlx::query(
                    "UPDATE jobs SET state = 'running', started_at = ? WHERE job_id = ? AND state = 'queued'",
                )
                .bind(now)
                .bind(job.job_id)
                .execute(&mut *tx)
                .await?;
                if result.rows_affected() == 1 {
                    job.state = JobState::Running.as_str().to_string();
                    job.started_at = Some(now);
                    claimed.push(job);
                }
            }

            tx.commit().await?;
            Ok(claimed)
        }

        async fn transition_job(
            &self,
            job_id: Uuid,
            from: &[JobState],
            state: JobState,
            error: Option<&str>,
        ) -> MetadataResult<bool> {
            if from.is_empty() {
                return Ok(false);
            }
            let query = format!(
                r#"
                UPDATE jobs SET
                    state = ?,
                    error = COALESCE(?, error),
                    finished_at = CASE WHEN ? THEN ? ELSE finished_at END
                WHERE job_id = ? AND state IN ({})
                "#,
                placeholders(from.len())
            );
            let mut q = sqlx::query(&query)
                .bind(state.as_str())
                .bind(error)
                .bind(state.is_terminal())
                .bind(OffsetDateTime::now_utc())
                .bind(job_id);
            for s in from {
                q = q.bind(s.as_str());
            }
            let result = q.execute(&self.pool).await?;
            Ok(result.rows_affected() == 1)
        }

        async fn list_jobs_by_state(&self, state: JobState) -> MetadataResult<Vec<JobRow>> {
            let rows = sqlx::query_as::<_, JobRow>(
                "SELECT * FROM jobs WHERE state = ? ORDER BY created_at, job_id",
            )
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    // =========================================================================
    // Cluster locks
    // =========================================================================

    #[async_trait]
    impl LockRepo for SqliteStore {
        async fn try_acquire_lock(
            &self,
            name: &str,
            holder: &str,
            ttl: Duration,
        ) -> MetadataResult<bool> {
            let now = now_unix_ms();
            let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            let locked_until = now.saturating_add(ttl_ms);

            // The upsert only overwrites an expired lock or our own.
            let result = sqlx::query(
                r#"
                INSERT INTO cluster_locks (lock_name, holder, locked_until_ms)
                VALUES (?, ?, ?)
                ON CONFLICT(lock_name) DO UPDATE SET
                    holder = excluded.holder,
                    locked_until_ms = excluded.locked_until_ms
                WHERE cluster_locks.locked_until_ms <= ? OR cluster_locks.holder = excluded.holder
                "#,
            )
            .bind(name)
            .bind(holder)
            .bind(locked_until)
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn release_lock(&self, name: &str, holder: &str) -> MetadataResult<bool> {
            let result = sqlx::query("DELETE FROM cluster_locks WHERE lock_name = ? AND holder = ?")
                .bind(name)
                .bind(holder)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn get_lock(&self, name: &str) -> MetadataResult<Option<LockRow>> {
            let row = sqlx::query_as::<_, LockRow>("SELECT * FROM cluster_locks WHERE lock_name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }
    }
}

const SCHEMA_SQL: &str = r#"
-- File requests of every kind. Terminal success deletes the row.
CREATE TABLE IF NOT EXISTS file_requests (
    request_id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    checksum TEXT NOT NULL,
    backend TEXT NOT NULL,
    status TEXT NOT NULL,
    session_owner TEXT NOT NULL DEFAULT '',
    session TEXT NOT NULL DEFAULT '',
    job_id BLOB,
    error_cause TEXT,
    file_name TEXT,
    origin_url TEXT,
    file_size INTEGER NOT NULL DEFAULT 0,
    storage_subdirectory TEXT,
    force_delete INTEGER NOT NULL DEFAULT 0,
    expiration_date TEXT,
    cache_group_id TEXT,
    storage_group_id TEXT,
    version INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_file_requests_schedule ON file_requests(kind, backend, status, request_id);
CREATE INDEX IF NOT EXISTS idx_file_requests_checksum ON file_requests(checksum, kind, status);
CREATE INDEX IF NOT EXISTS idx_file_requests_job ON file_requests(job_id) WHERE job_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_file_requests_cache_group ON file_requests(cache_group_id) WHERE cache_group_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_file_requests_storage_group ON file_requests(storage_group_id) WHERE storage_group_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS file_request_groups (
    request_id INTEGER NOT NULL REFERENCES file_requests(request_id) ON DELETE CASCADE,
    group_id TEXT NOT NULL,
    PRIMARY KEY (request_id, group_id)
);
CREATE INDEX IF NOT EXISTS idx_file_request_groups_group ON file_request_groups(group_id);

CREATE TABLE IF NOT EXISTS file_request_owners (
    request_id INTEGER NOT NULL REFERENCES file_requests(request_id) ON DELETE CASCADE,
    owner TEXT NOT NULL,
    PRIMARY KEY (request_id, owner)
);
CREATE INDEX IF NOT EXISTS idx_file_request_owners_owner ON file_request_owners(owner);

-- Live request groups and the results recorded for them
CREATE TABLE IF NOT EXISTS tracked_groups (
    group_id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    expected_count INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tracked_groups_expires ON tracked_groups(expires_at);

CREATE TABLE IF NOT EXISTS group_results (
    group_id TEXT NOT NULL REFERENCES tracked_groups(group_id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    checksum TEXT NOT NULL,
    backend TEXT NOT NULL DEFAULT '',
    owners_json TEXT NOT NULL DEFAULT '[]',
    is_error INTEGER NOT NULL DEFAULT 0,
    error_cause TEXT,
    result_file TEXT,
    created_at TEXT NOT NULL,
    PRIMARY KEY (group_id, checksum, backend)
);

-- File reference catalog
CREATE TABLE IF NOT EXISTS file_references (
    checksum TEXT NOT NULL,
    backend TEXT NOT NULL,
    file_name TEXT,
    file_size INTEGER NOT NULL DEFAULT 0,
    location_url TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (checksum, backend)
);

CREATE TABLE IF NOT EXISTS file_reference_owners (
    checksum TEXT NOT NULL,
    backend TEXT NOT NULL,
    owner TEXT NOT NULL,
    PRIMARY KEY (checksum, backend, owner),
    FOREIGN KEY (checksum, backend) REFERENCES file_references(checksum, backend) ON DELETE CASCADE
);

-- Cache entries
CREATE TABLE IF NOT EXISTS cache_files (
    checksum TEXT PRIMARY KEY,
    file_size INTEGER NOT NULL,
    location_url TEXT NOT NULL,
    expiration_date TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cache_file_groups (
    checksum TEXT NOT NULL REFERENCES cache_files(checksum) ON DELETE CASCADE,
    group_id TEXT NOT NULL,
    PRIMARY KEY (checksum, group_id)
);

-- Persisted jobs
CREATE TABLE IF NOT EXISTS jobs (
    job_id BLOB PRIMARY KEY,
    kind TEXT NOT NULL,
    backend TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'queued',
    error TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state, created_at);

-- Cluster-wide named locks
CREATE TABLE IF NOT EXISTS cluster_locks (
    lock_name TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    locked_until_ms INTEGER NOT NULL
);
"#;
