//! Prompt builders for diagnosis drafting.
//!
//! Pure functions from a context pack to the fixed system/user prompt pair.
//! Prompt text is part of the pipeline's behavior surface; change it in one
//! place only.

use crate::context::ContextPack;

/// Fixed system prompt for the diagnosis drafter.
pub fn diagnosis_system_prompt() -> &'static str {
    "You are a clinical decision support assistant drafting a preliminary diagnosis summary \
     for clinician review. You never address the patient directly and never make definitive \
     diagnostic claims. Respond with valid JSON only, no prose, using exactly this schema: \
     {\"summary\": string, \"findings\": [string], \"recommendations\": [string], \
     \"risk_level\": \"low|moderate|high|critical\", \"confidence_score\": number 0-1}"
}

/// User prompt built from the patient's context pack and the run's input
/// configuration.
pub fn diagnosis_user_prompt(pack: &ContextPack, input_config: &serde_json::Value) -> String {
    let mut prompt = String::from("Draft a preliminary diagnosis from this patient context.\n");

    prompt.push_str(&format!("\n## Demographics\n{}\n", pack.demographics));
    prompt.push_str(&format!("\n## Current measures\n{}\n", pack.current_measures));
    prompt.push_str(&format!("\n## Anamnesis\n{}\n", pack.anamnesis));
    prompt.push_str(&format!("\n## Questionnaire results\n{}\n", pack.funnel_runs));

    if let Some(config) = input_config.as_object() {
        if !config.is_empty() {
            prompt.push_str(&format!(
                "\n## Run configuration\n{}\n",
                serde_json::Value::Object(config.clone())
            ));
        }
    }

    prompt.push_str("\nRespond with the JSON object only.");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextMetadata;

    fn pack() -> ContextPack {
        ContextPack {
            patient_id: "p-1".into(),
            demographics: serde_json::json!({"age": 61}),
            current_measures: serde_json::json!({"bp": "150/95"}),
            anamnesis: serde_json::json!({"history": "hypertension"}),
            funnel_runs: serde_json::json!([{"funnel": "cardio", "score": 7}]),
            metadata: ContextMetadata {
                inputs_hash: "abc".into(),
                built_at: "2026-01-01T00:00:00Z".into(),
            },
        }
    }

    #[test]
    fn user_prompt_includes_all_context_blocks() {
        let prompt = diagnosis_user_prompt(&pack(), &serde_json::json!({}));
        assert!(prompt.contains("Demographics"));
        assert!(prompt.contains("150/95"));
        assert!(prompt.contains("hypertension"));
        assert!(prompt.contains("cardio"));
        // Empty config is omitted entirely.
        assert!(!prompt.contains("Run configuration"));
    }

    #[test]
    fn user_prompt_includes_non_empty_config() {
        let prompt = diagnosis_user_prompt(&pack(), &serde_json::json!({"locale": "de"}));
        assert!(prompt.contains("Run configuration"));
        assert!(prompt.contains("locale"));
    }

    #[test]
    fn system_prompt_pins_the_schema() {
        let system = diagnosis_system_prompt();
        assert!(system.contains("\"summary\""));
        assert!(system.contains("\"findings\""));
        assert!(system.contains("\"recommendations\""));
        assert!(system.contains("risk_level"));
        assert!(system.contains("confidence_score"));
    }
}
