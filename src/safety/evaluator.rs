//! Fail-closed LLM safety evaluation.
//!
//! `evaluate` is total: it returns a `SafetyCheckResult` for every input,
//! including empty content and a dead LLM service. On any failure it
//! synthesizes the maximum-severity verdict (`UNKNOWN` / `critical`,
//! `fallback_used = true`) instead of propagating the error, so callers
//! always have a deterministic, maximally-cautious answer to act on.

use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;

use super::types::{
    RecommendedAction, SafetyCheckResult, SafetyFinding, SafetyMetadata, SafetySeverity,
};
use crate::llm::{extract_json_block, LlmClient, LlmRequest};
use crate::rules::GeneratedSection;

const SAFETY_SYSTEM_PROMPT: &str = "You are a clinical content safety classifier. You review \
    machine-drafted diagnosis content before it reaches a clinician. Respond with valid JSON \
    only, no prose: {\"safety_score\": 0-100, \"overall_severity\": \
    \"none|low|medium|high|critical\", \"recommended_action\": \"PASS|FLAG|BLOCK\", \
    \"findings\": [{\"category\": string, \"severity\": string, \"reason\": string}]}";

/// Safety classifier over a fixed prompt and the shared LLM client.
pub struct SafetyEvaluator {
    llm: Arc<dyn LlmClient>,
    model: String,
    max_tokens: u32,
}

impl SafetyEvaluator {
    pub fn new(llm: Arc<dyn LlmClient>, model: &str, max_tokens: u32) -> Self {
        Self {
            llm,
            model: model.to_string(),
            max_tokens,
        }
    }

    /// Classify a generated content set. Never fails; see module docs.
    pub fn evaluate(&self, sections: &[GeneratedSection]) -> SafetyCheckResult {
        let prompt = build_safety_prompt(sections);
        let started = Instant::now();

        let raw = match self.llm.generate(&LlmRequest {
            model: &self.model,
            system_prompt: SAFETY_SYSTEM_PROMPT,
            user_prompt: &prompt,
            max_tokens: self.max_tokens,
        }) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "Safety check LLM call failed, failing closed");
                return self.fallback(
                    "llm_unavailable",
                    "LLM safety check unavailable",
                    started.elapsed().as_millis() as u64,
                );
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match parse_safety_response(&raw) {
            Some(parsed) => SafetyCheckResult {
                safety_score: parsed.safety_score,
                overall_severity: parsed.overall_severity,
                recommended_action: parsed.recommended_action,
                findings: parsed.findings,
                metadata: SafetyMetadata {
                    model: self.model.clone(),
                    max_tokens: self.max_tokens,
                    duration_ms,
                    fallback_used: false,
                },
            },
            None => {
                tracing::warn!(
                    response_len = raw.len(),
                    "Unparseable safety response, failing closed"
                );
                self.fallback(
                    "parse_failure",
                    "Failed to parse safety response",
                    duration_ms,
                )
            }
        }
    }

    fn fallback(&self, category: &str, reason: &str, duration_ms: u64) -> SafetyCheckResult {
        SafetyCheckResult {
            safety_score: 0,
            overall_severity: SafetySeverity::Critical,
            recommended_action: RecommendedAction::Unknown,
            findings: vec![SafetyFinding {
                category: category.to_string(),
                severity: SafetySeverity::Critical,
                reason: reason.to_string(),
            }],
            metadata: SafetyMetadata {
                model: self.model.clone(),
                max_tokens: self.max_tokens,
                duration_ms,
                fallback_used: true,
            },
        }
    }
}

fn build_safety_prompt(sections: &[GeneratedSection]) -> String {
    let mut prompt = String::from("Review the following drafted diagnosis content:\n");
    for section in sections {
        prompt.push_str(&format!("\n## {}\n{}\n", section.key, section.text));
    }
    prompt.push_str("\nClassify its safety for clinician review.");
    prompt
}

struct ParsedSafety {
    safety_score: u8,
    overall_severity: SafetySeverity,
    recommended_action: RecommendedAction,
    findings: Vec<SafetyFinding>,
}

/// Parse and schema-validate the classifier's response. `None` means the
/// caller must fail closed.
fn parse_safety_response(raw: &str) -> Option<ParsedSafety> {
    #[derive(Deserialize)]
    struct RawResponse {
        safety_score: f64,
        overall_severity: String,
        recommended_action: String,
        #[serde(default)]
        findings: Vec<RawFinding>,
    }

    #[derive(Deserialize)]
    struct RawFinding {
        #[serde(default)]
        category: String,
        #[serde(default)]
        severity: Option<String>,
        reason: String,
    }

    let json = extract_json_block(raw)?;
    let parsed: RawResponse = serde_json::from_str(&json).ok()?;

    if !(0.0..=100.0).contains(&parsed.safety_score) {
        return None;
    }
    let overall_severity = SafetySeverity::from_str(&parsed.overall_severity)?;
    let recommended_action = RecommendedAction::from_str(&parsed.recommended_action)?;

    let findings = parsed
        .findings
        .into_iter()
        .map(|f| SafetyFinding {
            category: f.category,
            severity: f
                .severity
                .as_deref()
                .and_then(SafetySeverity::from_str)
                .unwrap_or(overall_severity),
            reason: f.reason,
        })
        .collect();

    Some(ParsedSafety {
        safety_score: parsed.safety_score.round() as u8,
        overall_severity,
        recommended_action,
        findings,
    })
}
