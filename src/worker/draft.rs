//! Structural validation of the drafted diagnosis.
//!
//! The LLM's JSON is untrusted input: every required field and every value
//! constraint is checked, and all violations are collected (not just the
//! first) so operators see the full shape of a bad response.

use crate::rules::GeneratedSection;
use crate::worker::types::{DiagnosisDraft, RiskLevel};

/// Validate the extracted JSON object against the draft schema.
///
/// Returns the typed draft, or every violated field constraint.
pub fn validate_draft(value: &serde_json::Value) -> Result<DiagnosisDraft, Vec<String>> {
    let mut violations = Vec::new();

    let object = match value.as_object() {
        Some(o) => o,
        None => return Err(vec!["response is not a JSON object".to_string()]),
    };

    let summary = match object.get("summary").and_then(|v| v.as_str()) {
        Some(s) if !s.trim().is_empty() => s.to_string(),
        Some(_) => {
            violations.push("summary: must be a non-empty string".to_string());
            String::new()
        }
        None => {
            violations.push("summary: required string field missing".to_string());
            String::new()
        }
    };

    let findings = string_array(object, "findings", &mut violations);
    let recommendations = string_array(object, "recommendations", &mut violations);

    let risk_level = match object.get("risk_level") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => match RiskLevel::from_str(s) {
            Some(level) => Some(level),
            None => {
                violations.push(format!(
                    "risk_level: '{s}' not one of low|moderate|high|critical"
                ));
                None
            }
        },
        Some(other) => {
            violations.push(format!("risk_level: expected string, got {other}"));
            None
        }
    };

    let confidence_score = match object.get("confidence_score") {
        None | Some(serde_json::Value::Null) => None,
        Some(value) => match value.as_f64() {
            Some(score) if (0.0..=1.0).contains(&score) => Some(score),
            Some(score) => {
                violations.push(format!("confidence_score: {score} outside [0, 1]"));
                None
            }
            None => {
                violations.push(format!("confidence_score: expected number, got {value}"));
                None
            }
        },
    };

    if violations.is_empty() {
        Ok(DiagnosisDraft {
            summary,
            findings,
            recommendations,
            risk_level,
            confidence_score,
        })
    } else {
        Err(violations)
    }
}

fn string_array(
    object: &serde_json::Map<String, serde_json::Value>,
    field: &str,
    violations: &mut Vec<String>,
) -> Vec<String> {
    match object.get(field) {
        None => {
            violations.push(format!("{field}: required string array missing"));
            Vec::new()
        }
        Some(serde_json::Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                match item.as_str() {
                    Some(s) => out.push(s.to_string()),
                    None => violations.push(format!("{field}[{i}]: expected string, got {item}")),
                }
            }
            out
        }
        Some(other) => {
            violations.push(format!("{field}: expected array, got {other}"));
            Vec::new()
        }
    }
}

/// Project a validated draft into the sections the rule and safety gates
/// evaluate. Signals carry the risk level to every section; the confidence
/// score is attached to the summary section only, so bounds rules fire once.
pub fn draft_sections(draft: &DiagnosisDraft) -> Vec<GeneratedSection> {
    let signals: Vec<String> = draft
        .risk_level
        .map(|level| vec![level.as_str().to_string()])
        .unwrap_or_default();

    let mut summary = GeneratedSection::new("summary", &draft.summary);
    summary.signals = signals.clone();
    if let Some(score) = draft.confidence_score {
        summary.scores.insert("confidence_score".to_string(), score);
    }

    let mut findings = GeneratedSection::new("findings", &draft.findings.join("\n"));
    findings.signals = signals.clone();

    let mut recommendations =
        GeneratedSection::new("recommendations", &draft.recommendations.join("\n"));
    recommendations.signals = signals;

    vec![summary, findings, recommendations]
}
