//! Artifact store — immutable outputs of successful runs.
//!
//! Artifacts are append-only: created once at successful completion, linked
//! to their run in the same transaction, never mutated. A failed link must
//! fail the whole insert so no orphan artifact backs a "succeeded" run.

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::sqlite::now_rfc3339;
use super::DatabaseError;

/// Immutable persisted output of a successful run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DiagnosisArtifact {
    pub id: String,
    pub organization_id: String,
    pub artifact_type: String,
    pub artifact_name: String,
    pub artifact_data: serde_json::Value,
    pub created_at: String,
}

/// Parameters for creating an artifact.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub organization_id: String,
    pub artifact_type: String,
    pub artifact_name: String,
    pub artifact_data: serde_json::Value,
}

/// SQLite-backed store for `diagnosis_artifacts` and the run link table.
pub struct ArtifactStore;

impl ArtifactStore {
    pub fn new() -> Self {
        Self
    }

    /// Insert an artifact and link it to its run atomically.
    pub fn insert_linked(
        &self,
        conn: &Connection,
        new: &NewArtifact,
        run_id: &str,
        sequence_order: u32,
    ) -> Result<DiagnosisArtifact, DatabaseError> {
        let tx = conn.unchecked_transaction()?;

        let id = Uuid::new_v4().to_string();
        let created_at = now_rfc3339();

        tx.execute(
            "INSERT INTO diagnosis_artifacts
             (id, organization_id, artifact_type, artifact_name, artifact_data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                new.organization_id,
                new.artifact_type,
                new.artifact_name,
                new.artifact_data.to_string(),
                created_at,
            ],
        )?;

        tx.execute(
            "INSERT INTO diagnosis_run_artifacts (run_id, artifact_id, sequence_order)
             VALUES (?1, ?2, ?3)",
            params![run_id, id, sequence_order],
        )?;

        tx.commit()?;

        Ok(DiagnosisArtifact {
            id,
            organization_id: new.organization_id.clone(),
            artifact_type: new.artifact_type.clone(),
            artifact_name: new.artifact_name.clone(),
            artifact_data: new.artifact_data.clone(),
            created_at,
        })
    }

    /// Whether any artifact is linked to the run.
    pub fn run_has_artifact(&self, conn: &Connection, run_id: &str) -> Result<bool, DatabaseError> {
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM diagnosis_run_artifacts WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// The first artifact linked to a run (sequence order 0 today).
    pub fn first_for_run(
        &self,
        conn: &Connection,
        run_id: &str,
    ) -> Result<Option<DiagnosisArtifact>, DatabaseError> {
        let row = conn
            .query_row(
                "SELECT a.id, a.organization_id, a.artifact_type, a.artifact_name,
                        a.artifact_data, a.created_at
                 FROM diagnosis_artifacts a
                 JOIN diagnosis_run_artifacts l ON l.artifact_id = a.id
                 WHERE l.run_id = ?1
                 ORDER BY l.sequence_order ASC
                 LIMIT 1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((id, organization_id, artifact_type, artifact_name, raw_data, created_at)) => {
                let artifact_data =
                    serde_json::from_str(&raw_data).map_err(|e| DatabaseError::JsonColumn {
                        column: "artifact_data".to_string(),
                        reason: e.to_string(),
                    })?;
                Ok(Some(DiagnosisArtifact {
                    id,
                    organization_id,
                    artifact_type,
                    artifact_name,
                    artifact_data,
                    created_at,
                }))
            }
        }
    }
}

impl Default for ArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}
