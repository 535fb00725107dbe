//! Patient context-pack provider.
//!
//! Context assembly is an upstream collaborator; the pipeline only depends
//! on the bundle's shape. The shipped SQLite provider reads the local
//! `patients` stand-in table; production deployments plug in their own.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::db::sqlite::now_rfc3339;

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Patient not found: {0}")]
    PatientNotFound(String),

    #[error("Context source error: {0}")]
    Source(String),
}

/// Everything the diagnosis prompt is built from, for one patient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPack {
    pub patient_id: String,
    pub demographics: serde_json::Value,
    pub current_measures: serde_json::Value,
    pub anamnesis: serde_json::Value,
    pub funnel_runs: serde_json::Value,
    pub metadata: ContextMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMetadata {
    /// Fingerprint of the inputs the pack was built from, for audit trails.
    pub inputs_hash: String,
    pub built_at: String,
}

/// Seam for the upstream context assembly step.
pub trait ContextPackProvider: Send + Sync {
    fn build_context_pack(
        &self,
        conn: &Connection,
        patient_id: &str,
    ) -> Result<ContextPack, ContextError>;
}

/// Provider backed by the local `patients` table.
pub struct SqliteContextProvider;

impl SqliteContextProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SqliteContextProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextPackProvider for SqliteContextProvider {
    fn build_context_pack(
        &self,
        conn: &Connection,
        patient_id: &str,
    ) -> Result<ContextPack, ContextError> {
        let row = conn
            .query_row(
                "SELECT demographics, current_measures, anamnesis, funnel_runs
                 FROM patients WHERE id = ?1",
                params![patient_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| ContextError::Source(e.to_string()))?;

        let (demographics, current_measures, anamnesis, funnel_runs) =
            row.ok_or_else(|| ContextError::PatientNotFound(patient_id.to_string()))?;

        let demographics = parse_column("demographics", &demographics)?;
        let current_measures = parse_column("current_measures", &current_measures)?;
        let anamnesis = parse_column("anamnesis", &anamnesis)?;
        let funnel_runs = parse_column("funnel_runs", &funnel_runs)?;

        let inputs_hash = hash_inputs(&[
            patient_id,
            &demographics.to_string(),
            &current_measures.to_string(),
            &anamnesis.to_string(),
            &funnel_runs.to_string(),
        ]);

        Ok(ContextPack {
            patient_id: patient_id.to_string(),
            demographics,
            current_measures,
            anamnesis,
            funnel_runs,
            metadata: ContextMetadata {
                inputs_hash,
                built_at: now_rfc3339(),
            },
        })
    }
}

fn parse_column(column: &str, raw: &str) -> Result<serde_json::Value, ContextError> {
    serde_json::from_str(raw)
        .map_err(|e| ContextError::Source(format!("bad JSON in patients.{column}: {e}")))
}

/// 128-bit hex fingerprint over the pack inputs.
fn hash_inputs(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;

    fn insert_patient(conn: &Connection, id: &str, measures: &str) {
        conn.execute(
            "INSERT INTO patients
             (id, organization_id, demographics, current_measures, anamnesis, funnel_runs, created_at)
             VALUES (?1, 'org-1', '{\"age\": 54}', ?2, '{}', '[]', ?3)",
            params![id, measures, now_rfc3339()],
        )
        .unwrap();
    }

    #[test]
    fn builds_pack_for_known_patient() {
        let conn = open_memory_database().unwrap();
        insert_patient(&conn, "p-1", r#"{"bp": "140/90"}"#);

        let pack = SqliteContextProvider::new()
            .build_context_pack(&conn, "p-1")
            .unwrap();
        assert_eq!(pack.patient_id, "p-1");
        assert_eq!(pack.demographics["age"], 54);
        assert_eq!(pack.current_measures["bp"], "140/90");
        assert_eq!(pack.metadata.inputs_hash.len(), 32);
    }

    #[test]
    fn missing_patient_is_an_explicit_error() {
        let conn = open_memory_database().unwrap();
        match SqliteContextProvider::new().build_context_pack(&conn, "ghost") {
            Err(ContextError::PatientNotFound(id)) => assert_eq!(id, "ghost"),
            other => panic!("expected PatientNotFound, got {other:?}"),
        }
    }

    #[test]
    fn inputs_hash_tracks_inputs() {
        let conn = open_memory_database().unwrap();
        insert_patient(&conn, "p-1", r#"{"bp": "140/90"}"#);
        insert_patient(&conn, "p-2", r#"{"bp": "120/80"}"#);

        let provider = SqliteContextProvider::new();
        let a = provider.build_context_pack(&conn, "p-1").unwrap();
        let a_again = provider.build_context_pack(&conn, "p-1").unwrap();
        let b = provider.build_context_pack(&conn, "p-2").unwrap();

        assert_eq!(a.metadata.inputs_hash, a_again.metadata.inputs_hash);
        assert_ne!(a.metadata.inputs_hash, b.metadata.inputs_hash);
    }
}
