//! Pure rule evaluation over generated sections.
//!
//! No I/O, no clock, no randomness: the same registry and sections always
//! produce the same findings in the same order.

use super::registry::{CompiledRule, RuleRegistry};
use super::types::{Finding, GeneratedSection, KeywordMode, RuleLogic, SECTION_ALL};

/// Apply every active rule targeting the section (or `all`) and collect
/// findings in registry order.
pub fn evaluate_section(registry: &RuleRegistry, section: &GeneratedSection) -> Vec<Finding> {
    registry
        .compiled()
        .iter()
        .filter(|c| {
            c.rule.is_active
                && (c.rule.section_key == section.key || c.rule.section_key == SECTION_ALL)
        })
        .filter_map(|c| evaluate_rule(c, section))
        .collect()
}

/// Evaluate a whole content set, section by section.
pub fn evaluate_sections(
    registry: &RuleRegistry,
    sections: &[GeneratedSection],
) -> Vec<Finding> {
    sections
        .iter()
        .flat_map(|s| evaluate_section(registry, s))
        .collect()
}

fn evaluate_rule(compiled: &CompiledRule, section: &GeneratedSection) -> Option<Finding> {
    let rule = &compiled.rule;
    let message = match &rule.logic {
        RuleLogic::Contraindication {
            risk_signal,
            conflicting_patterns: _,
        } => {
            let signal_present = section
                .signals
                .iter()
                .any(|s| s.eq_ignore_ascii_case(risk_signal));
            if !signal_present {
                return None;
            }
            let matched = compiled.regexes.iter().find(|re| re.is_match(&section.text))?;
            format!(
                "risk signal '{risk_signal}' co-occurs with conflicting content ({})",
                matched.as_str()
            )
        }
        RuleLogic::Pattern { pattern } => {
            let re = compiled.regexes.first()?;
            if !re.is_match(&section.text) {
                return None;
            }
            format!("text matches pattern '{pattern}'")
        }
        RuleLogic::Keyword { keywords, mode } => {
            let text_lower = section.text.to_lowercase();
            let hit = keywords
                .iter()
                .find(|k| text_lower.contains(&k.to_lowercase()));
            match (mode, hit) {
                (KeywordMode::PresenceIsViolation, Some(keyword)) => {
                    format!("forbidden keyword present: '{keyword}'")
                }
                (KeywordMode::AbsenceIsViolation, None) => {
                    format!("none of the required keywords present: {}", keywords.join(", "))
                }
                _ => return None,
            }
        }
        RuleLogic::OutOfBounds {
            field,
            min_value,
            max_value,
        } => {
            // A missing field is not a bounds violation; structural
            // validation owns required-field checks.
            let value = *section.scores.get(field)?;
            if value >= *min_value && value <= *max_value {
                return None;
            }
            format!("{field} = {value} outside [{min_value}, {max_value}]")
        }
    };

    Some(Finding {
        rule_id: rule.rule_id.clone(),
        rule_version: rule.version.clone(),
        section_key: section.key.clone(),
        severity: rule.severity,
        flag_type: rule.flag_type,
        message,
    })
}
