//! Types for the LLM-based safety classifier.

use serde::{Deserialize, Serialize};

/// Overall severity the classifier assigns to a content set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetySeverity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl SafetySeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// What the classifier recommends doing with the content.
///
/// `Unknown` is the fail-closed value: the check could not run or could not
/// be understood, so the content must be treated as unreviewed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecommendedAction {
    Pass,
    Flag,
    Block,
    Unknown,
}

impl RecommendedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Flag => "FLAG",
            Self::Block => "BLOCK",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PASS" => Some(Self::Pass),
            "FLAG" => Some(Self::Flag),
            "BLOCK" => Some(Self::Block),
            "UNKNOWN" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// One issue the classifier (or the fallback path) reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyFinding {
    pub category: String,
    pub severity: SafetySeverity,
    pub reason: String,
}

/// Provenance of a safety result: which model, how long, and whether the
/// fail-closed fallback produced it instead of the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyMetadata {
    pub model: String,
    pub max_tokens: u32,
    pub duration_ms: u64,
    pub fallback_used: bool,
}

/// Immutable verdict for one evaluated content set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyCheckResult {
    /// 0 (unsafe) to 100 (safe).
    pub safety_score: u8,
    pub overall_severity: SafetySeverity,
    pub recommended_action: RecommendedAction,
    pub findings: Vec<SafetyFinding>,
    pub metadata: SafetyMetadata,
}

impl SafetyCheckResult {
    /// The content may reach a clinician without human review.
    pub fn is_passing(&self) -> bool {
        self.recommended_action == RecommendedAction::Pass
    }

    /// The content must be held for human review. FLAG is deliberately not
    /// included: it is surfaced but not blocking.
    pub fn requires_review(&self) -> bool {
        matches!(
            self.recommended_action,
            RecommendedAction::Block | RecommendedAction::Unknown
        )
    }
}
