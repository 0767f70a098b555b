//! Database queries for Remedy.

use remedy_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{RepositoryRow, TaskRecordRow};
use crate::task::{RepositoryRef, TaskSnapshot};

#[allow(clippy::cast_possible_wrap)]
const fn to_i64(value: u64) -> i64 {
    value as i64
}

impl Database {
    // =========================================================================
    // Repository queries
    // =========================================================================

    /// Register a repository.
    pub async fn insert_repository(
        &self,
        id: &str,
        repo: &RepositoryRef,
    ) -> Result<RepositoryRow, DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO repositories (id, owner, name, full_name, created_at)
            VALUES (?, ?, ?, ?, ?)
            ",
        )
        .bind(id)
        .bind(&repo.owner)
        .bind(&repo.name)
        .bind(repo.full_name())
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        self.get_repository(id).await
    }

    /// Get a repository by ID.
    pub async fn get_repository(&self, id: &str) -> Result<RepositoryRow, DatabaseError> {
        sqlx::query_as::<_, RepositoryRow>("SELECT * FROM repositories WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Repository {id}")))
    }

    /// Find a repository by `owner/name`, ignoring case.
    pub async fn find_repository(
        &self,
        repo: &RepositoryRef,
    ) -> Result<Option<RepositoryRow>, DatabaseError> {
        let row = sqlx::query_as::<_, RepositoryRow>(
            "SELECT * FROM repositories WHERE full_name = ? COLLATE NOCASE",
        )
        .bind(repo.full_name())
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// List repositories, oldest first.
    pub async fn list_repositories(&self) -> Result<Vec<RepositoryRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, RepositoryRow>(
            "SELECT * FROM repositories ORDER BY created_at ASC, full_name ASC",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Delete a repository. Returns whether a row was removed.
    pub async fn delete_repository(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM repositories WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Task record queries
    // =========================================================================

    /// Insert or refresh the record for a task snapshot.
    pub async fn upsert_task_record(&self, snapshot: &TaskSnapshot) -> Result<(), DatabaseError> {
        let result = snapshot
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Query(format!("Failed to encode task result: {e}")))?;

        sqlx::query(
            r"
            INSERT INTO task_records
                (id, repository, kind, issue_number, state, created_at,
                 started_at, finished_at, output_len, result, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at,
                output_len = excluded.output_len,
                result = excluded.result,
                updated_at = excluded.updated_at
            ",
        )
        .bind(snapshot.id.to_string())
        .bind(snapshot.repository.full_name())
        .bind(snapshot.kind.as_str())
        .bind(snapshot.issue_number.map(to_i64))
        .bind(snapshot.state.as_str())
        .bind(snapshot.created_at.timestamp())
        .bind(snapshot.started_at.map(|t| t.timestamp()))
        .bind(snapshot.finished_at.map(|t| t.timestamp()))
        .bind(to_i64(snapshot.output_len))
        .bind(result)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Get a task record by task ID.
    pub async fn get_task_record(&self, id: &str) -> Result<TaskRecordRow, DatabaseError> {
        sqlx::query_as::<_, TaskRecordRow>("SELECT * FROM task_records WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Task {id}")))
    }

    /// Task records of one repository, oldest first.
    pub async fn list_task_records(
        &self,
        repo: &RepositoryRef,
    ) -> Result<Vec<TaskRecordRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, TaskRecordRow>(
            r"
            SELECT * FROM task_records
            WHERE repository = ? COLLATE NOCASE
            ORDER BY created_at ASC, rowid ASC
            ",
        )
        .bind(repo.full_name())
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
