//! Deterministic, versioned medical validation rule engine.
//!
//! Pure logic with no I/O: a registry of immutable `(rule_id, version)`
//! rules, a pure evaluator, and a compiled-in default catalog.

pub mod catalog;
pub mod evaluator;
pub mod registry;
pub mod types;

pub use catalog::default_registry;
pub use evaluator::{evaluate_section, evaluate_sections};
pub use registry::{RegistryError, RuleRegistry};
pub use types::{
    Finding, FlagType, GeneratedSection, KeywordMode, RuleLogic, Severity, ValidationRule,
    SECTION_ALL,
};
