use crate::runtime::config::PolicyMapping;
use crate::store::{parse_timestamp, StoreError, StoreResult};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

/// Pagination position for one policy mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyCursor {
    pub policy_id: String,
    pub classification: String,
    pub offset: u64,
    pub last_drained_at: Option<DateTime<Utc>>,
}

impl PolicyCursor {
    pub fn from_mapping(mapping: &PolicyMapping) -> Self {
        Self {
            policy_id: mapping.policy_id.clone(),
            classification: mapping.classification.clone(),
            offset: mapping.initial_offset,
            last_drained_at: mapping.initial_drained_at,
        }
    }

    pub fn advance(&mut self) {
        self.offset = self.offset.saturating_add(1);
    }

    pub fn mark_drained(&mut self, at: DateTime<Utc>) {
        self.last_drained_at = Some(at);
    }
}

/// Durable per-policy cursors, keyed by `(policy_id, classification)`.
#[derive(Debug, Clone)]
pub struct CursorStore {
    pool: SqlitePool,
}

impl CursorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn load(
        &self,
        policy_id: &str,
        classification: &str,
    ) -> StoreResult<Option<PolicyCursor>> {
        let row = sqlx::query(
            r#"
SELECT policy_id, classification_name, pagination_offset, last_drained_at
FROM policy_cursors
WHERE policy_id = ?1 AND classification_name = ?2
"#,
        )
        .bind(policy_id)
        .bind(classification)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database("load cursor"))?;

        row.as_ref().map(row_to_cursor).transpose()
    }

    /// Returns the stored cursor for `mapping`, seeding it from the
    /// configured starting position the first time the mapping is seen.
    pub async fn load_or_seed(&self, mapping: &PolicyMapping) -> StoreResult<PolicyCursor> {
        if let Some(cursor) = self.load(&mapping.policy_id, &mapping.classification).await? {
            return Ok(cursor);
        }

        let cursor = PolicyCursor::from_mapping(mapping);
        self.save(&cursor).await?;
        tracing::info!(
            policy_id = %cursor.policy_id,
            classification = %cursor.classification,
            offset = cursor.offset,
            "seeded policy cursor from configuration"
        );
        Ok(cursor)
    }

    pub async fn save(&self, cursor: &PolicyCursor) -> StoreResult<()> {
        let offset = i64::try_from(cursor.offset).map_err(|_| {
            StoreError::corrupt("save cursor", format!("offset {} out of range", cursor.offset))
        })?;

        sqlx::query(
            r#"
INSERT INTO policy_cursors
  (policy_id, classification_name, pagination_offset, last_drained_at, updated_at)
VALUES
  (?1, ?2, ?3, ?4, ?5)
ON CONFLICT(policy_id, classification_name) DO UPDATE SET
  pagination_offset = excluded.pagination_offset,
  last_drained_at = excluded.last_drained_at,
  updated_at = excluded.updated_at
"#,
        )
        .bind(&cursor.policy_id)
        .bind(&cursor.classification)
        .bind(offset)
        .bind(cursor.last_drained_at.map(|at| at.to_rfc3339()))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(StoreError::database("save cursor"))?;
        Ok(())
    }

    pub async fn list(&self) -> StoreResult<Vec<PolicyCursor>> {
        let rows = sqlx::query(
            r#"
SELECT policy_id, classification_name, pagination_offset, last_drained_at
FROM policy_cursors
ORDER BY policy_id ASC, classification_name ASC
"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::database("list cursors"))?;

        rows.iter().map(row_to_cursor).collect()
    }
}

fn row_to_cursor(row: &SqliteRow) -> StoreResult<PolicyCursor> {
    const OPERATION: &str = "decode cursor";

    let offset: i64 = row.get("pagination_offset");
    let offset = u64::try_from(offset)
        .map_err(|_| StoreError::corrupt(OPERATION, format!("negative offset {offset}")))?;
    let last_drained_at: Option<String> = row.get("last_drained_at");

    Ok(PolicyCursor {
        policy_id: row.get("policy_id"),
        classification: row.get("classification_name"),
        offset,
        last_drained_at: last_drained_at
            .as_deref()
            .map(|raw| parse_timestamp(OPERATION, raw))
            .transpose()?,
    })
}
