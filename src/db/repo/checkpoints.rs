//! Checkpoint operations for the repository.

use crate::db::store::{CheckpointPersistError, CheckpointStore, PendingDelivery, StoredCheckpoint};
use crate::domain::{
    Address, BoundedFingerprintSet, Checkpoint, CheckpointAdvance, FillRecord, Fingerprint, TimeMs,
};
use async_trait::async_trait;
use sqlx::Row;
use tracing::{debug, warn};

use super::Repository;

impl Repository {
    /// Load the stored checkpoint row and fingerprints for a user.
    ///
    /// # Errors
    /// Returns an error if the query fails or the pending fill cannot be decoded.
    pub async fn load_checkpoint(
        &self,
        user: &Address,
        capacity: usize,
    ) -> Result<StoredCheckpoint, CheckpointPersistError> {
        let row = sqlx::query(
            r#"
            SELECT last_processed_time_ms, pending_fingerprint, pending_fill_json
            FROM checkpoints
            WHERE user = ?
            "#,
        )
        .bind(user.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let fingerprint_rows = sqlx::query(
            r#"
            SELECT fingerprint
            FROM checkpoint_fingerprints
            WHERE user = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(user.as_str())
        .fetch_all(&self.pool)
        .await?;

        let recent = BoundedFingerprintSet::from_oldest_first(
            capacity,
            fingerprint_rows
                .iter()
                .map(|r| Fingerprint::from_stored(r.get::<String, _>("fingerprint"))),
        );

        let Some(row) = row else {
            return Ok(StoredCheckpoint {
                checkpoint: Checkpoint::from_parts(TimeMs::default(), recent),
                pending: None,
            });
        };

        let last_processed = TimeMs::new(row.get::<i64, _>("last_processed_time_ms"));
        let pending_fp: Option<String> = row.get("pending_fingerprint");
        let pending_json: Option<String> = row.get("pending_fill_json");
        let pending = match (pending_fp, pending_json) {
            (Some(fp), Some(json)) => Some(PendingDelivery {
                fingerprint: Fingerprint::from_stored(fp),
                fill: serde_json::from_str::<FillRecord>(&json)?,
            }),
            (None, None) => None,
            _ => {
                warn!(user = %user, "Half-written pending delivery slot ignored");
                None
            }
        };

        Ok(StoredCheckpoint {
            checkpoint: Checkpoint::from_parts(last_processed, recent),
            pending,
        })
    }

    /// Apply a checkpoint advance and set the pending delivery in one transaction.
    ///
    /// # Errors
    /// Returns an error if the transaction fails; nothing is written in that case.
    pub async fn commit_checkpoint(
        &self,
        user: &Address,
        advance: &CheckpointAdvance,
        capacity: usize,
        fill: &FillRecord,
    ) -> Result<(), CheckpointPersistError> {
        let fill_json = serde_json::to_string(fill)?;
        let now = chrono::Utc::now().timestamp_millis();
        let capacity = capacity.max(1) as i64;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO checkpoints (
                user, last_processed_time_ms, pending_fingerprint, pending_fill_json, updated_at
            ) VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user) DO UPDATE SET
                last_processed_time_ms = MAX(last_processed_time_ms, excluded.last_processed_time_ms),
                pending_fingerprint = excluded.pending_fingerprint,
                pending_fill_json = excluded.pending_fill_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user.as_str())
        .bind(advance.last_processed.as_i64())
        .bind(advance.added.as_str())
        .bind(fill_json.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO checkpoint_fingerprints (user, seq, fingerprint)
            VALUES (
                ?,
                COALESCE((SELECT MAX(seq) FROM checkpoint_fingerprints WHERE user = ?), 0) + 1,
                ?
            )
            ON CONFLICT(user, fingerprint) DO NOTHING
            "#,
        )
        .bind(user.as_str())
        .bind(user.as_str())
        .bind(advance.added.as_str())
        .execute(&mut *tx)
        .await?;

        let trimmed = sqlx::query(
            r#"
            DELETE FROM checkpoint_fingerprints
            WHERE user = ?
              AND seq <= (SELECT MAX(seq) FROM checkpoint_fingerprints WHERE user = ?) - ?
            "#,
        )
        .bind(user.as_str())
        .bind(user.as_str())
        .bind(capacity)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            user = %user,
            fingerprint = %advance.added,
            last_processed = advance.last_processed.as_i64(),
            evicted = trimmed.rows_affected(),
            "Checkpoint committed"
        );
        Ok(())
    }

    /// Clear the pending delivery slot if it holds `fingerprint`.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn clear_pending_delivery(
        &self,
        user: &Address,
        fingerprint: &Fingerprint,
    ) -> Result<(), CheckpointPersistError> {
        sqlx::query(
            r#"
            UPDATE checkpoints
            SET pending_fingerprint = NULL, pending_fill_json = NULL
            WHERE user = ? AND pending_fingerprint = ?
            "#,
        )
        .bind(user.as_str())
        .bind(fingerprint.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for Repository {
    async fn load(
        &self,
        user: &Address,
        capacity: usize,
    ) -> Result<StoredCheckpoint, CheckpointPersistError> {
        self.load_checkpoint(user, capacity).await
    }

    async fn commit(
        &self,
        user: &Address,
        advance: &CheckpointAdvance,
        capacity: usize,
        fill: &FillRecord,
    ) -> Result<(), CheckpointPersistError> {
        self.commit_checkpoint(user, advance, capacity, fill).await
    }

    async fn clear_pending(
        &self,
        user: &Address,
        fingerprint: &Fingerprint,
    ) -> Result<(), CheckpointPersistError> {
        self.clear_pending_delivery(user, fingerprint).await
    }
}
