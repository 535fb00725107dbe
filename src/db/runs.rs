//! Run store — persistence for the diagnosis run state machine.
//!
//! Every state transition is a conditional UPDATE keyed on the expected
//! prior status. Zero rows affected means another writer got there first;
//! callers treat that as a lost race, never as an error. This is the only
//! concurrency-control mechanism in the pipeline.

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::sqlite::now_rfc3339;
use super::DatabaseError;
use crate::worker::types::{DiagnosisRun, ErrorCode, RunStatus};

/// Parameters for enqueueing a new run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub patient_id: String,
    pub organization_id: String,
    pub input_config: serde_json::Value,
    pub max_retries: u32,
}

/// SQLite-backed store for `diagnosis_runs`.
pub struct RunStore;

impl RunStore {
    pub fn new() -> Self {
        Self
    }

    /// Insert a new run in `queued` state and return it.
    pub fn enqueue(&self, conn: &Connection, new: &NewRun) -> Result<DiagnosisRun, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let input_json = new.input_config.to_string();

        conn.execute(
            "INSERT INTO diagnosis_runs
             (id, patient_id, organization_id, status, retry_count, max_retries,
              input_config, created_at)
             VALUES (?1, ?2, ?3, 'queued', 0, ?4, ?5, ?6)",
            params![
                id,
                new.patient_id,
                new.organization_id,
                new.max_retries,
                input_json,
                now,
            ],
        )?;

        self.get(conn, &id)
    }

    /// Fetch one run by id.
    pub fn get(&self, conn: &Connection, id: &str) -> Result<DiagnosisRun, DatabaseError> {
        let row = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM diagnosis_runs WHERE id = ?1"),
                params![id],
                map_run_row,
            )
            .optional()?;

        match row {
            Some(row) => run_from_row(row),
            None => Err(DatabaseError::NotFound {
                entity_type: "diagnosis_runs".to_string(),
                id: id.to_string(),
            }),
        }
    }

    /// Attempt the optimistic claim: `queued → running`.
    ///
    /// Returns `true` if this caller won the run, `false` if another worker
    /// claimed it first (or it was never queued). Losing is an expected
    /// outcome under contention, not an error.
    pub fn try_claim(&self, conn: &Connection, id: &str) -> Result<bool, DatabaseError> {
        let affected = conn.execute(
            "UPDATE diagnosis_runs
             SET status = 'running', started_at = ?1
             WHERE id = ?2 AND status = 'queued'",
            params![now_rfc3339(), id],
        )?;
        Ok(affected == 1)
    }

    /// Ids of queued runs, oldest first. A scheduling heuristic only; claim
    /// order is decided by `try_claim`.
    pub fn queued_ids(&self, conn: &Connection, limit: u32) -> Result<Vec<String>, DatabaseError> {
        let mut stmt = conn.prepare(
            "SELECT id FROM diagnosis_runs
             WHERE status = 'queued'
             ORDER BY created_at ASC, id ASC
             LIMIT ?1",
        )?;
        let ids = stmt
            .query_map(params![limit], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Finalize a running run as succeeded, attaching its output data.
    /// Conditional on `status = 'running'`; returns whether it applied.
    pub fn finalize_succeeded(
        &self,
        conn: &Connection,
        id: &str,
        output_data: &serde_json::Value,
    ) -> Result<bool, DatabaseError> {
        let affected = conn.execute(
            "UPDATE diagnosis_runs
             SET status = 'succeeded', completed_at = ?1, output_data = ?2
             WHERE id = ?3 AND status = 'running'",
            params![now_rfc3339(), output_data.to_string(), id],
        )?;
        Ok(affected == 1)
    }

    /// Move a run to `failed` with a taxonomy code, conditional on the
    /// expected prior status (running for the worker, succeeded/running for
    /// reconciliation). Returns whether it applied.
    pub fn mark_failed_from(
        &self,
        conn: &Connection,
        id: &str,
        expected: RunStatus,
        code: ErrorCode,
        message: &str,
    ) -> Result<bool, DatabaseError> {
        let affected = conn.execute(
            "UPDATE diagnosis_runs
             SET status = 'failed', completed_at = ?1, error_code = ?2, error_message = ?3
             WHERE id = ?4 AND status = ?5",
            params![now_rfc3339(), code.as_str(), message, id, expected.as_str()],
        )?;
        Ok(affected == 1)
    }

    /// Reconciliation repair: put a terminal run back in the queue with an
    /// incremented retry count and a clean slate. Conditional on the expected
    /// prior status so a concurrent repair is a no-op.
    pub fn requeue_from(
        &self,
        conn: &Connection,
        id: &str,
        expected: RunStatus,
    ) -> Result<bool, DatabaseError> {
        let affected = conn.execute(
            "UPDATE diagnosis_runs
             SET status = 'queued', retry_count = retry_count + 1,
                 started_at = NULL, completed_at = NULL,
                 error_code = NULL, error_message = NULL, output_data = NULL
             WHERE id = ?1 AND status = ?2",
            params![id, expected.as_str()],
        )?;
        Ok(affected == 1)
    }

    /// Backfill an error code on a failed run that is missing one.
    pub fn backfill_error_code(
        &self,
        conn: &Connection,
        id: &str,
        code: ErrorCode,
    ) -> Result<bool, DatabaseError> {
        let affected = conn.execute(
            "UPDATE diagnosis_runs
             SET error_code = ?1
             WHERE id = ?2 AND status = 'failed' AND error_code IS NULL",
            params![code.as_str(), id],
        )?;
        Ok(affected == 1)
    }

    // ── Reconciliation scans ────────────────────────────────

    /// Succeeded runs with no linked artifact: the "succeeded without a
    /// result" inconsistency reconciliation exists to repair.
    pub fn succeeded_without_artifact(
        &self,
        conn: &Connection,
        limit: u32,
    ) -> Result<Vec<DiagnosisRun>, DatabaseError> {
        self.query_runs(
            conn,
            &format!(
                "SELECT {RUN_COLUMNS} FROM diagnosis_runs r
                 WHERE r.status = 'succeeded'
                   AND NOT EXISTS (
                       SELECT 1 FROM diagnosis_run_artifacts a WHERE a.run_id = r.id)
                 ORDER BY r.created_at ASC, r.id ASC
                 LIMIT ?1"
            ),
            limit,
        )
    }

    /// Failed runs missing their taxonomy code.
    pub fn failed_without_error_code(
        &self,
        conn: &Connection,
        limit: u32,
    ) -> Result<Vec<DiagnosisRun>, DatabaseError> {
        self.query_runs(
            conn,
            &format!(
                "SELECT {RUN_COLUMNS} FROM diagnosis_runs
                 WHERE status = 'failed' AND error_code IS NULL
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?1"
            ),
            limit,
        )
    }

    /// Runs stuck in `running` since before the cutoff — abandoned by a dead
    /// process. Only reconciliation ever reclaims these.
    pub fn running_started_before(
        &self,
        conn: &Connection,
        cutoff_rfc3339: &str,
        limit: u32,
    ) -> Result<Vec<DiagnosisRun>, DatabaseError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM diagnosis_runs
             WHERE status = 'running' AND started_at IS NOT NULL AND started_at < ?1
             ORDER BY started_at ASC, id ASC
             LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![cutoff_rfc3339, limit], map_run_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(run_from_row).collect()
    }

    /// Per-status run counts, for the health endpoint.
    pub fn count_by_status(
        &self,
        conn: &Connection,
    ) -> Result<Vec<(RunStatus, u32)>, DatabaseError> {
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM diagnosis_runs GROUP BY status ORDER BY status ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(status, count)| {
                let status =
                    RunStatus::from_str(&status).ok_or_else(|| DatabaseError::InvalidEnum {
                        field: "status".to_string(),
                        value: status,
                    })?;
                Ok((status, count))
            })
            .collect()
    }

    fn query_runs(
        &self,
        conn: &Connection,
        sql: &str,
        limit: u32,
    ) -> Result<Vec<DiagnosisRun>, DatabaseError> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![limit], map_run_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(run_from_row).collect()
    }
}

impl Default for RunStore {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════
// Internal row mapping
// ═══════════════════════════════════════════

const RUN_COLUMNS: &str = "id, patient_id, organization_id, status, retry_count, max_retries, \
     started_at, completed_at, error_code, error_message, output_data, input_config, created_at";

struct RunRow {
    id: String,
    patient_id: String,
    organization_id: String,
    status: String,
    retry_count: u32,
    max_retries: u32,
    started_at: Option<String>,
    completed_at: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    output_data: Option<String>,
    input_config: String,
    created_at: String,
}

fn map_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        organization_id: row.get(2)?,
        status: row.get(3)?,
        retry_count: row.get(4)?,
        max_retries: row.get(5)?,
        started_at: row.get(6)?,
        completed_at: row.get(7)?,
        error_code: row.get(8)?,
        error_message: row.get(9)?,
        output_data: row.get(10)?,
        input_config: row.get(11)?,
        created_at: row.get(12)?,
    })
}

fn run_from_row(row: RunRow) -> Result<DiagnosisRun, DatabaseError> {
    let status = RunStatus::from_str(&row.status).ok_or_else(|| DatabaseError::InvalidEnum {
        field: "status".to_string(),
        value: row.status.clone(),
    })?;

    let error_code = match row.error_code {
        None => None,
        Some(code) => Some(ErrorCode::from_str(&code).ok_or_else(|| {
            DatabaseError::InvalidEnum {
                field: "error_code".to_string(),
                value: code,
            }
        })?),
    };

    let output_data = match row.output_data {
        None => None,
        Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| DatabaseError::JsonColumn {
            column: "output_data".to_string(),
            reason: e.to_string(),
        })?),
    };

    let input_config =
        serde_json::from_str(&row.input_config).map_err(|e| DatabaseError::JsonColumn {
            column: "input_config".to_string(),
            reason: e.to_string(),
        })?;

    Ok(DiagnosisRun {
        id: row.id,
        patient_id: row.patient_id,
        organization_id: row.organization_id,
        status,
        retry_count: row.retry_count,
        max_retries: row.max_retries,
        started_at: row.started_at,
        completed_at: row.completed_at,
        error_code,
        error_message: row.error_message,
        output_data,
        input_config,
        created_at: row.created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;

    fn new_run(patient: &str) -> NewRun {
        NewRun {
            patient_id: patient.to_string(),
            organization_id: "org-1".to_string(),
            input_config: serde_json::json!({"locale": "en"}),
            max_retries: 2,
        }
    }

    #[test]
    fn enqueue_creates_queued_run() {
        let conn = open_memory_database().unwrap();
        let store = RunStore::new();

        let run = store.enqueue(&conn, &new_run("p-1")).unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.retry_count, 0);
        assert_eq!(run.max_retries, 2);
        assert!(run.started_at.is_none());
        assert_eq!(run.input_config["locale"], "en");
    }

    #[test]
    fn get_missing_run_is_not_found() {
        let conn = open_memory_database().unwrap();
        let store = RunStore::new();
        match store.get(&conn, "nope") {
            Err(DatabaseError::NotFound { entity_type, .. }) => {
                assert_eq!(entity_type, "diagnosis_runs");
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn claim_succeeds_exactly_once() {
        let conn = open_memory_database().unwrap();
        let store = RunStore::new();
        let run = store.enqueue(&conn, &new_run("p-1")).unwrap();

        assert!(store.try_claim(&conn, &run.id).unwrap());
        // Every further attempt observes zero rows affected.
        for _ in 0..5 {
            assert!(!store.try_claim(&conn, &run.id).unwrap());
        }

        let claimed = store.get(&conn, &run.id).unwrap();
        assert_eq!(claimed.status, RunStatus::Running);
        assert!(claimed.started_at.is_some());
    }

    #[test]
    fn concurrent_claims_one_winner() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        // Shared on-disk db so multiple connections contend for one row.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("claims.db");
        let conn = crate::db::open_database(&path).unwrap();
        let run = RunStore::new().enqueue(&conn, &new_run("p-1")).unwrap();
        drop(conn);

        let wins = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let path = path.clone();
            let id = run.id.clone();
            let wins = Arc::clone(&wins);
            handles.push(std::thread::spawn(move || {
                let conn = crate::db::open_database(&path).unwrap();
                if RunStore::new().try_claim(&conn, &id).unwrap() {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1, "exactly one claim must win");
    }

    #[test]
    fn queued_ids_oldest_first() {
        let conn = open_memory_database().unwrap();
        let store = RunStore::new();
        let first = store.enqueue(&conn, &new_run("p-1")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = store.enqueue(&conn, &new_run("p-2")).unwrap();

        let ids = store.queued_ids(&conn, 10).unwrap();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[test]
    fn finalize_succeeded_requires_running() {
        let conn = open_memory_database().unwrap();
        let store = RunStore::new();
        let run = store.enqueue(&conn, &new_run("p-1")).unwrap();
        let output = serde_json::json!({"artifact_id": "a-1"});

        // Still queued — no transition.
        assert!(!store.finalize_succeeded(&conn, &run.id, &output).unwrap());

        assert!(store.try_claim(&conn, &run.id).unwrap());
        assert!(store.finalize_succeeded(&conn, &run.id, &output).unwrap());

        let done = store.get(&conn, &run.id).unwrap();
        assert_eq!(done.status, RunStatus::Succeeded);
        assert!(done.completed_at.is_some());
        assert_eq!(done.output_data.unwrap()["artifact_id"], "a-1");
    }

    #[test]
    fn mark_failed_records_taxonomy_code() {
        let conn = open_memory_database().unwrap();
        let store = RunStore::new();
        let run = store.enqueue(&conn, &new_run("p-1")).unwrap();
        assert!(store.try_claim(&conn, &run.id).unwrap());

        assert!(store
            .mark_failed_from(
                &conn,
                &run.id,
                RunStatus::Running,
                ErrorCode::ValidationError,
                "summary missing",
            )
            .unwrap());

        let failed = store.get(&conn, &run.id).unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.error_code, Some(ErrorCode::ValidationError));
        assert_eq!(failed.error_message.as_deref(), Some("summary missing"));
    }

    #[test]
    fn requeue_resets_state_and_counts_retry() {
        let conn = open_memory_database().unwrap();
        let store = RunStore::new();
        let run = store.enqueue(&conn, &new_run("p-1")).unwrap();
        assert!(store.try_claim(&conn, &run.id).unwrap());
        store
            .finalize_succeeded(&conn, &run.id, &serde_json::json!({"artifact_id": "ghost"}))
            .unwrap();

        assert!(store
            .requeue_from(&conn, &run.id, RunStatus::Succeeded)
            .unwrap());
        // Second attempt from the same expected state is a no-op.
        assert!(!store
            .requeue_from(&conn, &run.id, RunStatus::Succeeded)
            .unwrap());

        let requeued = store.get(&conn, &run.id).unwrap();
        assert_eq!(requeued.status, RunStatus::Queued);
        assert_eq!(requeued.retry_count, 1);
        assert!(requeued.started_at.is_none());
        assert!(requeued.completed_at.is_none());
        assert!(requeued.output_data.is_none());
        assert!(requeued.error_code.is_none());
    }

    #[test]
    fn backfill_only_touches_missing_codes() {
        let conn = open_memory_database().unwrap();
        let store = RunStore::new();
        let run = store.enqueue(&conn, &new_run("p-1")).unwrap();
        assert!(store.try_claim(&conn, &run.id).unwrap());

        // Simulate a failed row written without a code.
        conn.execute(
            "UPDATE diagnosis_runs SET status='failed', completed_at=?1 WHERE id=?2",
            params![now_rfc3339(), run.id],
        )
        .unwrap();

        assert!(store
            .backfill_error_code(&conn, &run.id, ErrorCode::UnknownError)
            .unwrap());
        // Idempotent: already has a code now.
        assert!(!store
            .backfill_error_code(&conn, &run.id, ErrorCode::UnknownError)
            .unwrap());

        let fixed = store.get(&conn, &run.id).unwrap();
        assert_eq!(fixed.error_code, Some(ErrorCode::UnknownError));
    }

    #[test]
    fn succeeded_without_artifact_scan() {
        let conn = open_memory_database().unwrap();
        let store = RunStore::new();
        let run = store.enqueue(&conn, &new_run("p-1")).unwrap();
        assert!(store.try_claim(&conn, &run.id).unwrap());
        store
            .finalize_succeeded(&conn, &run.id, &serde_json::json!({}))
            .unwrap();

        let broken = store.succeeded_without_artifact(&conn, 10).unwrap();
        assert_eq!(broken.len(), 1);
        assert_eq!(broken[0].id, run.id);
    }

    #[test]
    fn failed_without_error_code_scan() {
        let conn = open_memory_database().unwrap();
        let store = RunStore::new();
        let run = store.enqueue(&conn, &new_run("p-1")).unwrap();
        conn.execute(
            "UPDATE diagnosis_runs SET status='failed' WHERE id=?1",
            params![run.id],
        )
        .unwrap();

        let broken = store.failed_without_error_code(&conn, 10).unwrap();
        assert_eq!(broken.len(), 1);
        assert_eq!(broken[0].id, run.id);
    }

    #[test]
    fn running_started_before_cutoff() {
        let conn = open_memory_database().unwrap();
        let store = RunStore::new();
        let run = store.enqueue(&conn, &new_run("p-1")).unwrap();
        conn.execute(
            "UPDATE diagnosis_runs SET status='running', started_at='2020-01-01T00:00:00.000Z'
             WHERE id=?1",
            params![run.id],
        )
        .unwrap();

        let stuck = store
            .running_started_before(&conn, &now_rfc3339(), 10)
            .unwrap();
        assert_eq!(stuck.len(), 1);

        let none = store
            .running_started_before(&conn, "2019-01-01T00:00:00.000Z", 10)
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn count_by_status_groups() {
        let conn = open_memory_database().unwrap();
        let store = RunStore::new();
        store.enqueue(&conn, &new_run("p-1")).unwrap();
        store.enqueue(&conn, &new_run("p-2")).unwrap();
        let run = store.enqueue(&conn, &new_run("p-3")).unwrap();
        assert!(store.try_claim(&conn, &run.id).unwrap());

        let counts = store.count_by_status(&conn).unwrap();
        assert!(counts.contains(&(RunStatus::Queued, 2)));
        assert!(counts.contains(&(RunStatus::Running, 1)));
    }
}
