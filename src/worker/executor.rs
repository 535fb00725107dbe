//! Run executor — claims queued runs and drives them to a terminal state.
//!
//! Every pipeline step failure is converted into a `failed` run with a
//! taxonomy code; the executor returns `Err` only for infrastructure faults
//! (the database itself). A claimed run therefore always ends up terminal
//! unless the process dies mid-flight, which is reconciliation's job.

use std::sync::Arc;

use rusqlite::Connection;
use thiserror::Error;

use super::draft::{draft_sections, validate_draft};
use super::prompt::{diagnosis_system_prompt, diagnosis_user_prompt};
use super::types::{DiagnosisRun, ErrorCode, RunOutcome, RunStatus};
use crate::context::ContextPackProvider;
use crate::db::artifacts::{ArtifactStore, NewArtifact};
use crate::db::runs::RunStore;
use crate::db::DatabaseError;
use crate::llm::{extract_json_block, LlmClient, LlmRequest};
use crate::rules::{evaluate_sections, RuleRegistry};
use crate::safety::SafetyEvaluator;

/// How many queued candidates one claim attempt scans before giving up.
const CLAIM_SCAN_LIMIT: u32 = 16;

/// Stored error messages are truncated to keep rows bounded.
const MAX_ERROR_MESSAGE_LEN: usize = 2000;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Executes diagnosis runs: claim, build context, generate, validate, gate,
/// persist.
pub struct RunWorker {
    llm: Arc<dyn LlmClient>,
    context_provider: Arc<dyn ContextPackProvider>,
    registry: &'static RuleRegistry,
    safety: SafetyEvaluator,
    run_store: RunStore,
    artifact_store: ArtifactStore,
    model: String,
    max_tokens: u32,
}

impl RunWorker {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        context_provider: Arc<dyn ContextPackProvider>,
        registry: &'static RuleRegistry,
        model: &str,
        max_tokens: u32,
    ) -> Self {
        let safety = SafetyEvaluator::new(Arc::clone(&llm), model, max_tokens);
        Self {
            llm,
            context_provider,
            registry,
            safety,
            run_store: RunStore::new(),
            artifact_store: ArtifactStore::new(),
            model: model.to_string(),
            max_tokens,
        }
    }

    /// Claim and execute the oldest available queued run.
    ///
    /// Returns `None` when the queue is empty or every scanned candidate was
    /// claimed by someone else first.
    pub fn execute_next(&self, conn: &Connection) -> Result<Option<RunOutcome>, WorkerError> {
        for id in self.run_store.queued_ids(conn, CLAIM_SCAN_LIMIT)? {
            if self.run_store.try_claim(conn, &id)? {
                let run = self.run_store.get(conn, &id)?;
                return Ok(Some(self.execute_claimed(conn, &run)?));
            }
            tracing::debug!(run_id = %id, "Lost claim race, trying next candidate");
        }
        Ok(None)
    }

    /// Claim and execute one specific run.
    ///
    /// Returns `None` when the claim did not apply — the run is not queued
    /// (already claimed, or terminal). The caller decides how to report that;
    /// a missing run surfaces as `DatabaseError::NotFound`.
    pub fn execute_run(
        &self,
        conn: &Connection,
        run_id: &str,
    ) -> Result<Option<RunOutcome>, WorkerError> {
        // Existence check first so missing ids are NotFound, not a silent
        // lost claim.
        self.run_store.get(conn, run_id)?;

        if !self.run_store.try_claim(conn, run_id)? {
            return Ok(None);
        }
        let run = self.run_store.get(conn, run_id)?;
        Ok(Some(self.execute_claimed(conn, &run)?))
    }

    /// Drive one claimed (`running`) run to a terminal state.
    fn execute_claimed(
        &self,
        conn: &Connection,
        run: &DiagnosisRun,
    ) -> Result<RunOutcome, WorkerError> {
        tracing::info!(
            run_id = %run.id,
            patient_id = %run.patient_id,
            retry_count = run.retry_count,
            "Executing diagnosis run"
        );

        let pack = match self.context_provider.build_context_pack(conn, &run.patient_id) {
            Ok(pack) => pack,
            Err(e) => {
                return self.finalize_failed(conn, run, ErrorCode::ContextBuildError, &e.to_string())
            }
        };

        let user_prompt = diagnosis_user_prompt(&pack, &run.input_config);
        let raw = match self.llm.generate(&LlmRequest {
            model: &self.model,
            system_prompt: diagnosis_system_prompt(),
            user_prompt: &user_prompt,
            max_tokens: self.max_tokens,
        }) {
            Ok(raw) => raw,
            Err(e) => {
                return self.finalize_failed(conn, run, ErrorCode::ExecutionError, &e.to_string())
            }
        };

        let json = match extract_json_block(&raw) {
            Some(json) => json,
            None => {
                return self.finalize_failed(
                    conn,
                    run,
                    ErrorCode::ExecutionError,
                    "no JSON object found in LLM response",
                )
            }
        };

        let value: serde_json::Value = match serde_json::from_str(&json) {
            Ok(value) => value,
            Err(e) => {
                return self.finalize_failed(
                    conn,
                    run,
                    ErrorCode::ExecutionError,
                    &format!("malformed JSON in LLM response: {e}"),
                )
            }
        };

        let draft = match validate_draft(&value) {
            Ok(draft) => draft,
            Err(violations) => {
                return self.finalize_failed(
                    conn,
                    run,
                    ErrorCode::ValidationError,
                    &violations.join("; "),
                )
            }
        };

        // Review gates. Both are advisory: their verdicts travel with the
        // output for clinician review, they never flip the run's status.
        let sections = draft_sections(&draft);
        let rule_findings = evaluate_sections(self.registry, &sections);
        let safety = self.safety.evaluate(&sections);

        if !rule_findings.is_empty() {
            tracing::info!(
                run_id = %run.id,
                findings = rule_findings.len(),
                "Validation rules flagged the draft"
            );
        }
        if safety.requires_review() {
            tracing::warn!(
                run_id = %run.id,
                action = safety.recommended_action.as_str(),
                fallback_used = safety.metadata.fallback_used,
                "Safety gate held the draft for review"
            );
        }

        let artifact = match self.artifact_store.insert_linked(
            conn,
            &NewArtifact {
                organization_id: run.organization_id.clone(),
                artifact_type: "diagnosis".to_string(),
                artifact_name: format!("diagnosis-{}", run.patient_id),
                artifact_data: serde_json::json!({
                    "diagnosis": draft,
                    "context_inputs_hash": pack.metadata.inputs_hash,
                }),
            },
            &run.id,
            0,
        ) {
            Ok(artifact) => artifact,
            Err(e) => {
                return self.finalize_failed(
                    conn,
                    run,
                    ErrorCode::ArtifactCreationFailed,
                    &e.to_string(),
                )
            }
        };

        let output = serde_json::json!({
            "artifact_id": artifact.id,
            "summary": draft.summary,
            "diagnosis": draft,
            "review": {
                "ruleset_hash": self.registry.ruleset_hash(),
                "rule_findings": rule_findings,
                "safety": safety,
            },
        });

        if !self.run_store.finalize_succeeded(conn, &run.id, &output)? {
            // The run left `running` under us (a reclaim raced this worker).
            // The artifact stays linked; reconciliation owns the repair.
            tracing::warn!(run_id = %run.id, "Run was no longer running at finalize");
        }

        tracing::info!(run_id = %run.id, artifact_id = %artifact.id, "Diagnosis run succeeded");
        Ok(RunOutcome::Succeeded {
            run_id: run.id.clone(),
            artifact_id: artifact.id,
        })
    }

    /// Record a step failure as a terminal `failed` state and return it as a
    /// normal outcome.
    fn finalize_failed(
        &self,
        conn: &Connection,
        run: &DiagnosisRun,
        code: ErrorCode,
        message: &str,
    ) -> Result<RunOutcome, WorkerError> {
        let message = truncate(message, MAX_ERROR_MESSAGE_LEN);
        tracing::warn!(
            run_id = %run.id,
            error_code = code.as_str(),
            error = %message,
            "Diagnosis run failed"
        );

        if !self
            .run_store
            .mark_failed_from(conn, &run.id, RunStatus::Running, code, &message)?
        {
            tracing::warn!(run_id = %run.id, "Run was no longer running at failure finalize");
        }

        Ok(RunOutcome::Failed {
            run_id: run.id.clone(),
            error_code: code,
            error_message: message,
        })
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextError, ContextMetadata, ContextPack};
    use crate::db::open_memory_database;
    use crate::db::runs::NewRun;
    use crate::llm::LlmError;
    use crate::rules::default_registry;
    use crate::worker::types::RiskLevel;
    use rusqlite::params;

    // Answers draft and safety calls differently, keyed on the system prompt.
    struct ScriptedLlm {
        draft_response: Result<String, LlmError>,
        safety_response: Result<String, LlmError>,
    }

    impl LlmClient for ScriptedLlm {
        fn generate(&self, request: &LlmRequest<'_>) -> Result<String, LlmError> {
            let response = if request.system_prompt.contains("safety classifier") {
                &self.safety_response
            } else {
                &self.draft_response
            };
            match response {
                Ok(s) => Ok(s.clone()),
                Err(_) => Err(LlmError::Connection("http://localhost:11434".into())),
            }
        }
    }

    fn passing_safety() -> String {
        r#"{"safety_score": 95, "overall_severity": "none",
            "recommended_action": "PASS", "findings": []}"#
            .to_string()
    }

    fn moderate_draft() -> String {
        serde_json::json!({
            "summary": "Blood pressure is elevated but controlled.",
            "findings": ["systolic 150 mmHg"],
            "recommendations": ["follow up with your clinician in two weeks"],
            "risk_level": "moderate",
            "confidence_score": 0.85
        })
        .to_string()
    }

    fn worker(draft: Result<String, LlmError>, safety: Result<String, LlmError>) -> RunWorker {
        RunWorker::new(
            Arc::new(ScriptedLlm {
                draft_response: draft,
                safety_response: safety,
            }),
            Arc::new(crate::context::SqliteContextProvider::new()),
            default_registry(),
            "medgemma:4b",
            1024,
        )
    }

    fn seed_patient(conn: &Connection, id: &str) {
        conn.execute(
            "INSERT INTO patients
             (id, organization_id, demographics, current_measures, anamnesis, funnel_runs, created_at)
             VALUES (?1, 'org-1', '{\"age\": 61}', '{\"bp\": \"150/95\"}', '{}', '[]',
                     '2026-01-01T00:00:00.000Z')",
            params![id],
        )
        .unwrap();
    }

    fn enqueue(conn: &Connection, patient_id: &str) -> DiagnosisRun {
        RunStore::new()
            .enqueue(
                conn,
                &NewRun {
                    patient_id: patient_id.to_string(),
                    organization_id: "org-1".to_string(),
                    input_config: serde_json::json!({}),
                    max_retries: 2,
                },
            )
            .unwrap()
    }

    #[test]
    fn successful_run_produces_linked_artifact_and_output() {
        let conn = open_memory_database().unwrap();
        seed_patient(&conn, "p-1");
        let run = enqueue(&conn, "p-1");

        let worker = worker(Ok(moderate_draft()), Ok(passing_safety()));
        let outcome = worker.execute_next(&conn).unwrap().expect("one run queued");

        let artifact_id = match outcome {
            RunOutcome::Succeeded { artifact_id, .. } => artifact_id,
            other => panic!("expected success, got {other:?}"),
        };

        let done = RunStore::new().get(&conn, &run.id).unwrap();
        assert_eq!(done.status, RunStatus::Succeeded);
        assert!(done.completed_at.is_some());
        assert!(done.error_code.is_none());

        let output = done.output_data.unwrap();
        assert_eq!(output["artifact_id"], artifact_id);
        assert_eq!(output["diagnosis"]["risk_level"], "moderate");
        assert_eq!(output["diagnosis"]["confidence_score"], 0.85);
        assert_eq!(
            output["review"]["ruleset_hash"],
            default_registry().ruleset_hash()
        );
        assert_eq!(output["review"]["safety"]["recommended_action"], "PASS");

        assert!(ArtifactStore::new().run_has_artifact(&conn, &run.id).unwrap());
        let artifact = ArtifactStore::new()
            .first_for_run(&conn, &run.id)
            .unwrap()
            .unwrap();
        assert_eq!(artifact.id, artifact_id);
        assert_eq!(
            artifact.artifact_data["diagnosis"]["risk_level"],
            RiskLevel::Moderate.as_str()
        );
    }

    #[test]
    fn out_of_range_confidence_fails_validation_without_artifact() {
        let conn = open_memory_database().unwrap();
        seed_patient(&conn, "p-1");
        let run = enqueue(&conn, "p-1");

        let bad_draft = serde_json::json!({
            "summary": "ok",
            "findings": [],
            "recommendations": [],
            "confidence_score": 1.5
        })
        .to_string();
        let worker = worker(Ok(bad_draft), Ok(passing_safety()));

        let outcome = worker.execute_next(&conn).unwrap().unwrap();
        match outcome {
            RunOutcome::Failed {
                error_code,
                error_message,
                ..
            } => {
                assert_eq!(error_code, ErrorCode::ValidationError);
                assert!(error_message.contains("1.5"));
            }
            other => panic!("expected failure, got {other:?}"),
        }

        let failed = RunStore::new().get(&conn, &run.id).unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.error_code, Some(ErrorCode::ValidationError));
        assert!(failed.output_data.is_none());
        assert!(!ArtifactStore::new().run_has_artifact(&conn, &run.id).unwrap());
    }

    #[test]
    fn missing_patient_is_context_build_error() {
        let conn = open_memory_database().unwrap();
        let run = enqueue(&conn, "ghost");

        let worker = worker(Ok(moderate_draft()), Ok(passing_safety()));
        let outcome = worker.execute_next(&conn).unwrap().unwrap();

        match outcome {
            RunOutcome::Failed { error_code, .. } => {
                assert_eq!(error_code, ErrorCode::ContextBuildError);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        let failed = RunStore::new().get(&conn, &run.id).unwrap();
        assert_eq!(failed.error_code, Some(ErrorCode::ContextBuildError));
    }

    #[test]
    fn dead_llm_is_execution_error() {
        let conn = open_memory_database().unwrap();
        seed_patient(&conn, "p-1");
        enqueue(&conn, "p-1");

        let worker = worker(
            Err(LlmError::Connection("http://localhost:11434".into())),
            Ok(passing_safety()),
        );
        match worker.execute_next(&conn).unwrap().unwrap() {
            RunOutcome::Failed { error_code, .. } => {
                assert_eq!(error_code, ErrorCode::ExecutionError)
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn prose_without_json_is_execution_error() {
        let conn = open_memory_database().unwrap();
        seed_patient(&conn, "p-1");
        enqueue(&conn, "p-1");

        let worker = worker(
            Ok("I cannot produce a diagnosis for this patient.".to_string()),
            Ok(passing_safety()),
        );
        match worker.execute_next(&conn).unwrap().unwrap() {
            RunOutcome::Failed {
                error_code,
                error_message,
                ..
            } => {
                assert_eq!(error_code, ErrorCode::ExecutionError);
                assert!(error_message.contains("no JSON object"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn safety_fallback_still_succeeds_with_review_marker() {
        // Draft generation works, the safety call dies. The run still
        // succeeds; the output carries the fail-closed verdict.
        let conn = open_memory_database().unwrap();
        seed_patient(&conn, "p-1");
        let run = enqueue(&conn, "p-1");

        let worker = worker(
            Ok(moderate_draft()),
            Err(LlmError::Connection("http://localhost:11434".into())),
        );
        let outcome = worker.execute_next(&conn).unwrap().unwrap();
        assert!(matches!(outcome, RunOutcome::Succeeded { .. }));

        let done = RunStore::new().get(&conn, &run.id).unwrap();
        let safety = &done.output_data.unwrap()["review"]["safety"];
        assert_eq!(safety["recommended_action"], "UNKNOWN");
        assert_eq!(safety["overall_severity"], "critical");
        assert_eq!(safety["metadata"]["fallback_used"], true);
    }

    #[test]
    fn critical_rule_findings_travel_with_a_succeeded_run() {
        let conn = open_memory_database().unwrap();
        seed_patient(&conn, "p-1");
        let run = enqueue(&conn, "p-1");

        let risky_draft = serde_json::json!({
            "summary": "High cardiac strain observed.",
            "findings": ["sustained tachycardia"],
            "recommendations": ["begin vigorous exercise immediately"],
            "risk_level": "critical",
            "confidence_score": 0.9
        })
        .to_string();
        let worker = worker(Ok(risky_draft), Ok(passing_safety()));
        let outcome = worker.execute_next(&conn).unwrap().unwrap();
        assert!(matches!(outcome, RunOutcome::Succeeded { .. }));

        let done = RunStore::new().get(&conn, &run.id).unwrap();
        assert_eq!(done.status, RunStatus::Succeeded);
        let findings = done.output_data.unwrap()["review"]["rule_findings"]
            .as_array()
            .unwrap()
            .clone();
        assert!(
            findings
                .iter()
                .any(|f| f["rule_id"] == "contra-critical-exertion"),
            "expected contraindication finding, got {findings:?}"
        );
    }

    #[test]
    fn execute_next_on_empty_queue_is_idle() {
        let conn = open_memory_database().unwrap();
        let worker = worker(Ok(moderate_draft()), Ok(passing_safety()));
        assert!(worker.execute_next(&conn).unwrap().is_none());
    }

    #[test]
    fn execute_run_refuses_non_queued_run() {
        let conn = open_memory_database().unwrap();
        seed_patient(&conn, "p-1");
        let run = enqueue(&conn, "p-1");

        let worker = worker(Ok(moderate_draft()), Ok(passing_safety()));
        let outcome = worker.execute_run(&conn, &run.id).unwrap();
        assert!(outcome.is_some());

        // Terminal now; a second targeted execution loses the claim.
        assert!(worker.execute_run(&conn, &run.id).unwrap().is_none());
    }

    #[test]
    fn execute_run_missing_id_is_not_found() {
        let conn = open_memory_database().unwrap();
        let worker = worker(Ok(moderate_draft()), Ok(passing_safety()));
        match worker.execute_run(&conn, "no-such-run") {
            Err(WorkerError::Database(DatabaseError::NotFound { .. })) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn oldest_queued_run_is_executed_first() {
        let conn = open_memory_database().unwrap();
        seed_patient(&conn, "p-1");
        seed_patient(&conn, "p-2");
        let first = enqueue(&conn, "p-1");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let _second = enqueue(&conn, "p-2");

        let worker = worker(Ok(moderate_draft()), Ok(passing_safety()));
        let outcome = worker.execute_next(&conn).unwrap().unwrap();
        assert_eq!(outcome.run_id(), first.id);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "ü".repeat(100);
        let t = truncate(&s, 7);
        assert!(t.len() <= 7);
        assert!(s.starts_with(&t));
    }
}
