//! Diagnosis run execution pipeline.
//!
//! One claimed run flows context → generation → extraction → structural
//! validation → review gates → artifact persistence → finalize.

pub mod draft;
pub mod executor;
pub mod prompt;
pub mod types;

pub use executor::{RunWorker, WorkerError};
pub use types::{DiagnosisDraft, DiagnosisRun, ErrorCode, RiskLevel, RunOutcome, RunStatus};
