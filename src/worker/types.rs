//! Domain types for the diagnosis run state machine.
//!
//! A run moves monotonically along `queued → running → {succeeded, failed}`.
//! Only the conditional claim UPDATE moves a run to `running`; only the
//! worker finalizes it; only reconciliation repairs broken terminal states.

use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════
// Run status
// ═══════════════════════════════════════════════════════════

/// Lifecycle state of a diagnosis run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal states are only ever touched again by reconciliation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════
// Error taxonomy
// ═══════════════════════════════════════════════════════════

/// Taxonomy code stamped on every failed run.
///
/// `CompletedNoResult` and `UnknownError` are only ever assigned by
/// reconciliation; the worker assigns the other four.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ContextBuildError,
    ExecutionError,
    ValidationError,
    ArtifactCreationFailed,
    CompletedNoResult,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContextBuildError => "CONTEXT_BUILD_ERROR",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::ArtifactCreationFailed => "ARTIFACT_CREATION_FAILED",
            Self::CompletedNoResult => "COMPLETED_NO_RESULT",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "CONTEXT_BUILD_ERROR" => Some(Self::ContextBuildError),
            "EXECUTION_ERROR" => Some(Self::ExecutionError),
            "VALIDATION_ERROR" => Some(Self::ValidationError),
            "ARTIFACT_CREATION_FAILED" => Some(Self::ArtifactCreationFailed),
            "COMPLETED_NO_RESULT" => Some(Self::CompletedNoResult),
            "UNKNOWN_ERROR" => Some(Self::UnknownError),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════
// DiagnosisRun
// ═══════════════════════════════════════════════════════════

/// One LLM-generation attempt for one patient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisRun {
    pub id: String,
    pub patient_id: String,
    pub organization_id: String,
    pub status: RunStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    /// Artifact reference plus diagnosis summary, set on success.
    pub output_data: Option<serde_json::Value>,
    pub input_config: serde_json::Value,
    pub created_at: String,
}

impl DiagnosisRun {
    /// Whether reconciliation may requeue this run one more time.
    pub fn retry_budget_left(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Terminal outcome of executing one claimed run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded {
        run_id: String,
        artifact_id: String,
    },
    Failed {
        run_id: String,
        error_code: ErrorCode,
        error_message: String,
    },
}

impl RunOutcome {
    pub fn run_id(&self) -> &str {
        match self {
            Self::Succeeded { run_id, .. } | Self::Failed { run_id, .. } => run_id,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Diagnosis draft
// ═══════════════════════════════════════════════════════════

/// Risk level the model may assign to a draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Moderate => "moderate",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "moderate" => Some(Self::Moderate),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Structurally validated diagnosis draft extracted from the LLM response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisDraft {
    pub summary: String,
    pub findings: Vec<String>,
    pub recommendations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
}
