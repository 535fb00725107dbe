//! LLM-based safety gate with fail-closed semantics.

pub mod evaluator;
pub mod types;

pub use evaluator::SafetyEvaluator;
pub use types::{
    RecommendedAction, SafetyCheckResult, SafetyFinding, SafetyMetadata, SafetySeverity,
};
