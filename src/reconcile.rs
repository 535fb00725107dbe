//! Reconciliation sweep — out-of-band repair of inconsistent run states.
//!
//! The worker finalizes every run it claims, so inconsistent states only
//! appear through process death or partial writes: `succeeded` with no
//! linked artifact, `failed` with no error code, `running` long past its
//! start. The sweep detects each class, repairs it through the same
//! conditional UPDATEs the worker uses, and reports every decision.
//! Re-running it on a repaired set matches nothing; a lost repair race is
//! recorded as a skip, never an error.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db::artifacts::ArtifactStore;
use crate::db::runs::RunStore;
use crate::db::DatabaseError;
use crate::worker::types::{DiagnosisRun, ErrorCode, RunStatus};

/// Options for one sweep. All fields default so an operator request body of
/// `{}` is a safe dry run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileOptions {
    /// Classify and report without mutating any row.
    pub dry_run: bool,
    /// Batch size per scanned inconsistency class.
    pub limit: u32,
    /// Requeue repairable runs that still have retry budget. Without this,
    /// broken succeeded runs are finalized as failed instead.
    pub retry: bool,
    /// Backfill `UNKNOWN_ERROR` on failed runs missing a code.
    pub include_failed_without_error: bool,
    /// Reclaim runs stuck in `running` past the TTL. Off by default; only
    /// this sweep ever touches abandoned running runs.
    pub include_stuck_running: bool,
    /// Pause before each requeue, to keep a retry burst from hammering the
    /// LLM service the moment workers pick the runs back up.
    pub backoff_ms: u64,
    /// Cap on each per-action id list in the summary.
    pub max_ids: usize,
    /// Minutes in `running` before a run counts as stuck.
    pub stuck_ttl_minutes: i64,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        let config = crate::config::Config::default();
        Self {
            dry_run: true,
            limit: config.reconcile_limit,
            retry: false,
            include_failed_without_error: true,
            include_stuck_running: false,
            backoff_ms: 0,
            max_ids: config.reconcile_max_ids,
            stuck_ttl_minutes: config.stuck_ttl_minutes,
        }
    }
}

/// What one sweep did (or, on a dry run, would have done).
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileSummary {
    pub dry_run: bool,
    pub scanned: u32,
    pub requeued: u32,
    pub marked_failed: u32,
    pub fixed_error_code: u32,
    pub skipped: u32,
    pub requeued_ids: Vec<String>,
    pub marked_failed_ids: Vec<String>,
    pub fixed_error_code_ids: Vec<String>,
    pub skipped_ids: Vec<String>,
    /// At least one id list hit `max_ids` and dropped entries.
    pub ids_truncated: bool,
}

impl ReconcileSummary {
    fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            scanned: 0,
            requeued: 0,
            marked_failed: 0,
            fixed_error_code: 0,
            skipped: 0,
            requeued_ids: Vec::new(),
            marked_failed_ids: Vec::new(),
            fixed_error_code_ids: Vec::new(),
            skipped_ids: Vec::new(),
            ids_truncated: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Requeued,
    MarkedFailed,
    FixedErrorCode,
    Skipped,
}

impl Action {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Requeued => "requeued",
            Self::MarkedFailed => "marked_failed",
            Self::FixedErrorCode => "fixed_error_code",
            Self::Skipped => "skipped",
        }
    }
}

/// Run one reconciliation sweep.
pub fn reconcile(
    conn: &Connection,
    options: &ReconcileOptions,
) -> Result<ReconcileSummary, DatabaseError> {
    let runs = RunStore::new();
    let artifacts = ArtifactStore::new();
    let mut summary = ReconcileSummary::new(options.dry_run);

    tracing::info!(
        dry_run = options.dry_run,
        retry = options.retry,
        include_stuck_running = options.include_stuck_running,
        limit = options.limit,
        "Starting reconciliation sweep"
    );

    // Succeeded runs whose artifact never materialized.
    for run in runs.succeeded_without_artifact(conn, options.limit)? {
        summary.scanned += 1;
        // The scan query is not transactional with the repair; re-check so a
        // concurrently-attached artifact is not clobbered.
        if artifacts.run_has_artifact(conn, &run.id)? {
            record(&mut summary, options, Action::Skipped, &run.id, "artifact appeared since scan");
            continue;
        }
        repair_missing_result(conn, &runs, options, &mut summary, &run, RunStatus::Succeeded)?;
    }

    // Failed runs with no taxonomy code.
    if options.include_failed_without_error {
        for run in runs.failed_without_error_code(conn, options.limit)? {
            summary.scanned += 1;
            let applied = options.dry_run
                || runs.backfill_error_code(conn, &run.id, ErrorCode::UnknownError)?;
            if applied {
                record(
                    &mut summary,
                    options,
                    Action::FixedErrorCode,
                    &run.id,
                    "failed run had no error code",
                );
            } else {
                record(&mut summary, options, Action::Skipped, &run.id, "code set since scan");
            }
        }
    }

    // Runs abandoned in `running` by a dead process.
    if options.include_stuck_running {
        let cutoff = (chrono::Utc::now() - chrono::Duration::minutes(options.stuck_ttl_minutes))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        for run in runs.running_started_before(conn, &cutoff, options.limit)? {
            summary.scanned += 1;
            repair_missing_result(conn, &runs, options, &mut summary, &run, RunStatus::Running)?;
        }
    }

    tracing::info!(
        scanned = summary.scanned,
        requeued = summary.requeued,
        marked_failed = summary.marked_failed,
        fixed_error_code = summary.fixed_error_code,
        skipped = summary.skipped,
        dry_run = summary.dry_run,
        "Reconciliation sweep finished"
    );
    Ok(summary)
}

/// Shared repair decision for a run with no usable result: requeue it if
/// retries are allowed and budget remains, otherwise finalize it as failed.
fn repair_missing_result(
    conn: &Connection,
    runs: &RunStore,
    options: &ReconcileOptions,
    summary: &mut ReconcileSummary,
    run: &DiagnosisRun,
    expected: RunStatus,
) -> Result<(), DatabaseError> {
    let reason = match expected {
        RunStatus::Succeeded => "succeeded run has no linked artifact",
        _ => "run stuck in running past TTL",
    };

    if options.retry && run.retry_budget_left() {
        if options.dry_run {
            record(summary, options, Action::Requeued, &run.id, reason);
            return Ok(());
        }
        if options.backoff_ms > 0 {
            std::thread::sleep(std::time::Duration::from_millis(options.backoff_ms));
        }
        if runs.requeue_from(conn, &run.id, expected)? {
            record(summary, options, Action::Requeued, &run.id, reason);
        } else {
            record(summary, options, Action::Skipped, &run.id, "state changed since scan");
        }
        return Ok(());
    }

    let code = match expected {
        RunStatus::Succeeded => ErrorCode::CompletedNoResult,
        _ => ErrorCode::UnknownError,
    };
    let applied =
        options.dry_run || runs.mark_failed_from(conn, &run.id, expected, code, reason)?;
    if applied {
        record(summary, options, Action::MarkedFailed, &run.id, reason);
    } else {
        record(summary, options, Action::Skipped, &run.id, "state changed since scan");
    }
    Ok(())
}

fn record(
    summary: &mut ReconcileSummary,
    options: &ReconcileOptions,
    action: Action,
    run_id: &str,
    reason: &str,
) {
    tracing::info!(
        run_id = %run_id,
        action = action.as_str(),
        reason = %reason,
        dry_run = options.dry_run,
        "Reconcile decision"
    );

    let (count, ids) = match action {
        Action::Requeued => (&mut summary.requeued, &mut summary.requeued_ids),
        Action::MarkedFailed => (&mut summary.marked_failed, &mut summary.marked_failed_ids),
        Action::FixedErrorCode => (
            &mut summary.fixed_error_code,
            &mut summary.fixed_error_code_ids,
        ),
        Action::Skipped => (&mut summary.skipped, &mut summary.skipped_ids),
    };
    *count += 1;
    if ids.len() < options.max_ids {
        ids.push(run_id.to_string());
    } else {
        summary.ids_truncated = true;
    }
}
