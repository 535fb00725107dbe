//! Built-in validation ruleset.
//!
//! The registry is compiled into the binary, not persisted: the ruleset that
//! evaluated a draft is exactly the ruleset this build ships, and
//! `ruleset_hash()` fingerprints it for the audit trail. Fixing a rule means
//! adding a new version here and deactivating the old one.

use std::sync::LazyLock;

use super::registry::RuleRegistry;
use super::types::{FlagType, KeywordMode, RuleLogic, Severity, ValidationRule, SECTION_ALL};

static DEFAULT_REGISTRY: LazyLock<RuleRegistry> = LazyLock::new(|| {
    RuleRegistry::new(built_in_rules()).expect("built-in ruleset must compile")
});

/// The registry shipped with this build.
pub fn default_registry() -> &'static RuleRegistry {
    &DEFAULT_REGISTRY
}

/// All built-in rules, including deactivated historical versions.
pub fn built_in_rules() -> Vec<ValidationRule> {
    vec![
        ValidationRule {
            rule_id: "contra-critical-exertion".into(),
            version: "1.0.0".into(),
            section_key: "recommendations".into(),
            severity: Severity::Warning,
            flag_type: FlagType::Contraindication,
            is_active: true,
            description: "Exertion advice conflicts with a critical risk level".into(),
            logic: RuleLogic::Contraindication {
                risk_signal: "critical".into(),
                conflicting_patterns: vec![
                    "vigorous exercise".into(),
                    "high-intensity training".into(),
                    "strenuous activity".into(),
                ],
            },
        },
        ValidationRule {
            rule_id: "contra-high-unsupervised".into(),
            version: "1.0.0".into(),
            section_key: "recommendations".into(),
            severity: Severity::Warning,
            flag_type: FlagType::Contraindication,
            is_active: true,
            description: "Unsupervised self-management advice conflicts with high risk".into(),
            logic: RuleLogic::Contraindication {
                risk_signal: "high".into(),
                conflicting_patterns: vec![
                    "no follow-up needed".into(),
                    "self-manage at home".into(),
                ],
            },
        },
        ValidationRule {
            rule_id: "plaus-contradictory-risk".into(),
            version: "1.0.0".into(),
            section_key: SECTION_ALL.into(),
            severity: Severity::Warning,
            flag_type: FlagType::Plausibility,
            is_active: true,
            description: "Self-contradictory risk-level language".into(),
            logic: RuleLogic::Pattern {
                pattern: r"(?i)\b(?:no|low|minimal)\s+risk\b[\s\S]*\b(?:critical|severe|life-threatening)\b".into(),
            },
        },
        // v1.0.0 matched only "definitive diagnosis"; v1.1.0 widened the
        // list. The old version stays, deactivated, for audit traceability.
        ValidationRule {
            rule_id: "safety-diagnostic-claims".into(),
            version: "1.0.0".into(),
            section_key: SECTION_ALL.into(),
            severity: Severity::Critical,
            flag_type: FlagType::Safety,
            is_active: false,
            description: "Definitive diagnostic-claim language is forbidden".into(),
            logic: RuleLogic::Keyword {
                keywords: vec!["definitive diagnosis".into()],
                mode: KeywordMode::PresenceIsViolation,
            },
        },
        ValidationRule {
            rule_id: "safety-diagnostic-claims".into(),
            version: "1.1.0".into(),
            section_key: SECTION_ALL.into(),
            severity: Severity::Critical,
            flag_type: FlagType::Safety,
            is_active: true,
            description: "Definitive diagnostic-claim language is forbidden".into(),
            logic: RuleLogic::Keyword {
                keywords: vec![
                    "definitive diagnosis".into(),
                    "confirmed diagnosis".into(),
                    "you certainly have".into(),
                    "there is no doubt".into(),
                ],
                mode: KeywordMode::PresenceIsViolation,
            },
        },
        ValidationRule {
            rule_id: "safety-clinician-referral".into(),
            version: "1.0.0".into(),
            section_key: "recommendations".into(),
            severity: Severity::Info,
            flag_type: FlagType::Safety,
            is_active: true,
            description: "Recommendations should reference clinician follow-up".into(),
            logic: RuleLogic::Keyword {
                keywords: vec![
                    "clinician".into(),
                    "physician".into(),
                    "doctor".into(),
                    "follow-up".into(),
                ],
                mode: KeywordMode::AbsenceIsViolation,
            },
        },
        ValidationRule {
            rule_id: "bounds-confidence-score".into(),
            version: "1.0.0".into(),
            section_key: SECTION_ALL.into(),
            severity: Severity::Critical,
            flag_type: FlagType::OutOfBounds,
            is_active: true,
            description: "Model confidence must be a probability".into(),
            logic: RuleLogic::OutOfBounds {
                field: "confidence_score".into(),
                min_value: 0.0,
                max_value: 1.0,
            },
        },
        ValidationRule {
            rule_id: "bounds-symptom-severity".into(),
            version: "1.0.0".into(),
            section_key: "findings".into(),
            severity: Severity::Warning,
            flag_type: FlagType::OutOfBounds,
            is_active: true,
            description: "Reported symptom severity must stay on the 0-10 scale".into(),
            logic: RuleLogic::OutOfBounds {
                field: "symptom_severity".into(),
                min_value: 0.0,
                max_value: 10.0,
            },
        },
    ]
}
