use crate::store::record::AssignmentAttempt;
use crate::store::{parse_timestamp, StoreError, StoreResult};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

/// Upper bound on a single retry sweep chunk.
pub const MAX_RETRY_CHUNK: usize = 1000;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

const SELECT_COLUMNS: &str = "id, file_id, file_owner, classification_name, source_policy_id, \
     file_name, applied, attempts, error_forbidden, error_no_identity, error_message, \
     created_at, updated_at";

const RETRY_PREDICATE: &str = "applied = 0 \
     AND COALESCE(error_forbidden, 0) = 0 \
     AND COALESCE(error_no_identity, 0) = 0";

/// Durable log of assignment attempts plus the retry-eligibility query.
#[derive(Debug, Clone)]
pub struct AttemptStore {
    pool: SqlitePool,
    max_attempts: u32,
}

impl AttemptStore {
    pub fn new(pool: SqlitePool, max_attempts: u32) -> Self {
        Self {
            pool,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Builds an in-memory record for a newly observed trigger. Nothing is
    /// written until [`AttemptStore::bulk_persist`].
    pub fn create_pending(
        &self,
        file_id: &str,
        file_owner: &str,
        classification: &str,
        policy_id: &str,
    ) -> AssignmentAttempt {
        AssignmentAttempt::pending(file_id, file_owner, classification, policy_id, Utc::now())
    }

    /// Upserts `records` in one transaction.
    ///
    /// Unsaved records are inserted and receive their row id; saved ones are
    /// updated in place. Ids and `updated_at` are written back into `records`
    /// only once the transaction commits, so a failed batch leaves the caller's
    /// records exactly as they were.
    pub async fn bulk_persist(&self, records: &mut [AssignmentAttempt]) -> StoreResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let stamp = now.to_rfc3339();
        let mut ids = Vec::with_capacity(records.len());

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(StoreError::database("begin bulk persist"))?;

        for record in records.iter() {
            let result = sqlx::query(
                r#"
INSERT INTO label_assignments
  (id, file_id, file_owner, classification_name, source_policy_id, file_name, applied,
   attempts, error_forbidden, error_no_identity, error_message, created_at, updated_at)
VALUES
  (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
ON CONFLICT(id) DO UPDATE SET
  file_name = COALESCE(excluded.file_name, label_assignments.file_name),
  applied = excluded.applied,
  attempts = excluded.attempts,
  error_forbidden = excluded.error_forbidden,
  error_no_identity = excluded.error_no_identity,
  error_message = excluded.error_message,
  updated_at = excluded.updated_at
"#,
            )
            .bind(record.id)
            .bind(&record.file_id)
            .bind(&record.file_owner)
            .bind(&record.classification)
            .bind(&record.policy_id)
            .bind(&record.file_name)
            .bind(record.applied)
            .bind(i64::from(record.attempts))
            .bind(record.error_forbidden)
            .bind(record.error_no_identity)
            .bind(&record.error_message)
            .bind(record.created_at.to_rfc3339())
            .bind(&stamp)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::database("upsert attempt"))?;

            ids.push(record.id.unwrap_or_else(|| result.last_insert_rowid()));
        }

        tx.commit()
            .await
            .map_err(StoreError::database("commit bulk persist"))?;

        for (record, id) in records.iter_mut().zip(ids) {
            record.id = Some(id);
            record.updated_at = now;
        }

        tracing::debug!(records = records.len(), "persisted attempt batch");
        Ok(())
    }

    /// Lazily walks every retry-eligible record in id order, `chunk_size` at
    /// a time (clamped to `1..=MAX_RETRY_CHUNK`).
    pub fn retry_eligible(&self, chunk_size: usize) -> RetrySweep {
        RetrySweep {
            pool: self.pool.clone(),
            chunk_size: chunk_size.clamp(1, MAX_RETRY_CHUNK),
            max_attempts: self.max_attempts,
            after_id: 0,
            exhausted: false,
        }
    }

    /// Unapplied records that ran out of attempts without a terminal marker.
    pub async fn count_exhausted(&self) -> StoreResult<u64> {
        let sql = format!(
            "SELECT COUNT(*) AS total FROM label_assignments WHERE {RETRY_PREDICATE} AND attempts >= ?1"
        );
        let row = sqlx::query(&sql)
            .bind(i64::from(self.max_attempts))
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::database("count exhausted attempts"))?;
        Ok(row.get::<i64, _>("total").max(0) as u64)
    }

    pub async fn get(&self, id: i64) -> StoreResult<Option<AssignmentAttempt>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM label_assignments WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::database("get attempt"))?;
        row.as_ref().map(row_to_attempt).transpose()
    }

    pub async fn count(&self) -> StoreResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM label_assignments")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::database("count attempts"))?;
        Ok(row.get::<i64, _>("total").max(0) as u64)
    }

    pub async fn list_for_file(&self, file_id: &str) -> StoreResult<Vec<AssignmentAttempt>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM label_assignments WHERE file_id = ?1 ORDER BY id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(file_id)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::database("list attempts for file"))?;
        rows.iter().map(row_to_attempt).collect()
    }
}

/// Keyset-paginated cursor over retry-eligible records.
///
/// Each chunk starts after the highest id of the previous one, so records
/// updated while the sweep is in progress are never visited twice.
#[derive(Debug)]
pub struct RetrySweep {
    pool: SqlitePool,
    chunk_size: usize,
    max_attempts: u32,
    after_id: i64,
    exhausted: bool,
}

impl RetrySweep {
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Next chunk of eligible records, or `None` once the sweep is done.
    pub async fn next_chunk(&mut self) -> StoreResult<Option<Vec<AssignmentAttempt>>> {
        if self.exhausted {
            return Ok(None);
        }

        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM label_assignments \
             WHERE {RETRY_PREDICATE} AND attempts < ?1 AND id > ?2 \
             ORDER BY id ASC LIMIT ?3"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(self.max_attempts))
            .bind(self.after_id)
            .bind(self.chunk_size as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::database("select retry chunk"))?;

        if rows.len() < self.chunk_size {
            self.exhausted = true;
        }
        if rows.is_empty() {
            return Ok(None);
        }

        let chunk = rows
            .iter()
            .map(row_to_attempt)
            .collect::<StoreResult<Vec<_>>>()?;
        if let Some(last) = chunk.last().and_then(|record| record.id) {
            self.after_id = last;
        }
        Ok(Some(chunk))
    }
}

fn row_to_attempt(row: &SqliteRow) -> StoreResult<AssignmentAttempt> {
    const OPERATION: &str = "decode attempt";

    let attempts: i64 = row.get("attempts");
    let attempts = u32::try_from(attempts)
        .map_err(|_| StoreError::corrupt(OPERATION, format!("invalid attempts {attempts}")))?;
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(AssignmentAttempt {
        id: Some(row.get("id")),
        file_id: row.get("file_id"),
        file_owner: row.get("file_owner"),
        classification: row.get("classification_name"),
        policy_id: row.get("source_policy_id"),
        file_name: row.get("file_name"),
        applied: row.get("applied"),
        attempts,
        error_forbidden: row.get("error_forbidden"),
        error_no_identity: row.get("error_no_identity"),
        error_message: row.get("error_message"),
        created_at: parse_timestamp(OPERATION, &created_at)?,
        updated_at: parse_timestamp(OPERATION, &updated_at)?,
    })
}
