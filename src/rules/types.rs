//! Types for the deterministic validation rule engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Section key matching any section.
pub const SECTION_ALL: &str = "all";

/// How serious a triggered rule is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// What kind of problem the rule detects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagType {
    Contraindication,
    Plausibility,
    OutOfBounds,
    Safety,
}

impl FlagType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contraindication => "contraindication",
            Self::Plausibility => "plausibility",
            Self::OutOfBounds => "out_of_bounds",
            Self::Safety => "safety",
        }
    }
}

/// Direction of a keyword rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordMode {
    /// Any keyword appearing in the text is a violation.
    PresenceIsViolation,
    /// No keyword appearing in the text is a violation.
    AbsenceIsViolation,
}

/// Closed sum of rule logic variants. Adding a variant is a compile-checked
/// exercise: the evaluator matches exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleLogic {
    /// Triggers when a named risk signal co-occurs with any conflicting
    /// textual pattern.
    Contraindication {
        risk_signal: String,
        conflicting_patterns: Vec<String>,
    },
    /// Regex match against the section text.
    Pattern { pattern: String },
    /// Keyword presence/absence check over the section text.
    Keyword {
        keywords: Vec<String>,
        mode: KeywordMode,
    },
    /// Numeric range check against a named field in the section scores.
    OutOfBounds {
        field: String,
        min_value: f64,
        max_value: f64,
    },
}

impl RuleLogic {
    /// Stable tag used in the ruleset hash rendering.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Contraindication { .. } => "contraindication",
            Self::Pattern { .. } => "pattern",
            Self::Keyword { .. } => "keyword",
            Self::OutOfBounds { .. } => "out_of_bounds",
        }
    }
}

/// A versioned, immutable unit of deterministic validation logic.
///
/// Rules are never edited in place: a fix is published as a new version and
/// the old one is deactivated, so any historical finding can be traced to
/// the exact logic that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub rule_id: String,
    /// Semantic version string, e.g. "1.0.0".
    pub version: String,
    /// Target section key, or [`SECTION_ALL`].
    pub section_key: String,
    pub severity: Severity,
    pub flag_type: FlagType,
    pub is_active: bool,
    pub description: String,
    pub logic: RuleLogic,
}

/// Output of applying one rule to one section. Transient, not persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub rule_id: String,
    pub rule_version: String,
    pub section_key: String,
    pub severity: Severity,
    pub flag_type: FlagType,
    pub message: String,
}

/// One generated content section as seen by the rule engine.
///
/// `scores` is a BTreeMap so iteration order never leaks nondeterminism
/// into findings or logs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GeneratedSection {
    pub key: String,
    pub text: String,
    /// Named risk signals attached to the section (e.g. the draft's
    /// risk level).
    pub signals: Vec<String>,
    pub scores: BTreeMap<String, f64>,
}

impl GeneratedSection {
    pub fn new(key: &str, text: &str) -> Self {
        Self {
            key: key.to_string(),
            text: text.to_string(),
            signals: Vec::new(),
            scores: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logic_serializes_with_kind_tag() {
        let logic = RuleLogic::OutOfBounds {
            field: "confidence_score".into(),
            min_value: 0.0,
            max_value: 1.0,
        };
        let json = serde_json::to_value(&logic).unwrap();
        assert_eq!(json["kind"], "out_of_bounds");
        assert_eq!(json["field"], "confidence_score");
    }

    #[test]
    fn logic_kind_matches_serde_tag() {
        let variants = vec![
            RuleLogic::Contraindication {
                risk_signal: "critical".into(),
                conflicting_patterns: vec![],
            },
            RuleLogic::Pattern { pattern: "x".into() },
            RuleLogic::Keyword {
                keywords: vec!["x".into()],
                mode: KeywordMode::PresenceIsViolation,
            },
            RuleLogic::OutOfBounds {
                field: "f".into(),
                min_value: 0.0,
                max_value: 1.0,
            },
        ];
        for logic in variants {
            let json = serde_json::to_value(&logic).unwrap();
            assert_eq!(json["kind"], logic.kind());
        }
    }

    #[test]
    fn severity_strings() {
        assert_eq!(Severity::Warning.as_str(), "warning");
        assert_eq!(FlagType::OutOfBounds.as_str(), "out_of_bounds");
    }
}
