//! Immutable, versioned rule registry.
//!
//! The registry is built once from a rule list, validates every rule at
//! construction (a malformed rule is a defect, not a runtime error path),
//! and exposes deterministic listings plus a stable content hash — the
//! audit fingerprint for "which ruleset produced this finding".

use regex::{Regex, RegexBuilder};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::types::{KeywordMode, RuleLogic, ValidationRule, SECTION_ALL};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Duplicate rule: {rule_id} v{version}")]
    DuplicateRule { rule_id: String, version: String },

    #[error("Invalid version for rule {rule_id}: {version}")]
    InvalidVersion { rule_id: String, version: String },

    #[error("Invalid pattern in rule {rule_id} v{version}: {reason}")]
    InvalidPattern {
        rule_id: String,
        version: String,
        reason: String,
    },

    #[error("Rule {rule_id} v{version} has no keywords")]
    EmptyKeywords { rule_id: String, version: String },

    #[error("Rule {rule_id} v{version} has min {min} > max {max}")]
    InvalidBounds {
        rule_id: String,
        version: String,
        min: f64,
        max: f64,
    },
}

/// A rule with its logic compiled for evaluation.
pub(crate) struct CompiledRule {
    pub(crate) rule: ValidationRule,
    pub(crate) version_key: (u64, u64, u64),
    /// Compiled regexes: the `pattern` variant's regex, or one
    /// case-insensitive literal matcher per contraindication pattern.
    pub(crate) regexes: Vec<Regex>,
}

/// Immutable registry keyed by `(rule_id, version)`.
pub struct RuleRegistry {
    rules: Vec<CompiledRule>,
    hash: String,
}

impl RuleRegistry {
    /// Build a registry, validating and compiling every rule.
    pub fn new(rules: Vec<ValidationRule>) -> Result<Self, RegistryError> {
        let mut compiled: Vec<CompiledRule> = rules
            .into_iter()
            .map(compile_rule)
            .collect::<Result<_, _>>()?;

        // Raw byte order on rule_id, numeric order on version: identical
        // across calls, restarts, and platforms. No locale-aware compares.
        compiled.sort_by(|a, b| {
            a.rule
                .rule_id
                .as_bytes()
                .cmp(b.rule.rule_id.as_bytes())
                .then(a.version_key.cmp(&b.version_key))
        });

        for pair in compiled.windows(2) {
            if pair[0].rule.rule_id == pair[1].rule.rule_id
                && pair[0].rule.version == pair[1].rule.version
            {
                return Err(RegistryError::DuplicateRule {
                    rule_id: pair[1].rule.rule_id.clone(),
                    version: pair[1].rule.version.clone(),
                });
            }
        }

        let hash = ruleset_hash(&compiled);
        Ok(Self {
            rules: compiled,
            hash,
        })
    }

    /// Look up one exact rule version.
    pub fn get_rule(&self, rule_id: &str, version: &str) -> Option<&ValidationRule> {
        self.rules
            .iter()
            .map(|c| &c.rule)
            .find(|r| r.rule_id == rule_id && r.version == version)
    }

    /// The highest version of a rule, active or not.
    pub fn get_latest_rule(&self, rule_id: &str) -> Option<&ValidationRule> {
        // Rules are sorted by (rule_id, version), so the last match wins.
        self.rules
            .iter()
            .filter(|c| c.rule.rule_id == rule_id)
            .next_back()
            .map(|c| &c.rule)
    }

    /// All active rules, in stable (rule_id, version) order.
    pub fn list_active_rules(&self) -> Vec<&ValidationRule> {
        self.rules
            .iter()
            .map(|c| &c.rule)
            .filter(|r| r.is_active)
            .collect()
    }

    /// Active rules targeting a section (or `all`), in stable order.
    pub fn list_rules_by_section(&self, section_key: &str) -> Vec<&ValidationRule> {
        self.rules
            .iter()
            .map(|c| &c.rule)
            .filter(|r| r.is_active && (r.section_key == section_key || r.section_key == SECTION_ALL))
            .collect()
    }

    /// Stable 128-bit hex fingerprint of the full rule set content. Any
    /// rule addition or edit changes the hash.
    pub fn ruleset_hash(&self) -> &str {
        &self.hash
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub(crate) fn compiled(&self) -> &[CompiledRule] {
        &self.rules
    }
}

fn compile_rule(rule: ValidationRule) -> Result<CompiledRule, RegistryError> {
    let version_key =
        parse_version(&rule.version).ok_or_else(|| RegistryError::InvalidVersion {
            rule_id: rule.rule_id.clone(),
            version: rule.version.clone(),
        })?;

    let regexes = match &rule.logic {
        RuleLogic::Pattern { pattern } => {
            vec![Regex::new(pattern).map_err(|e| RegistryError::InvalidPattern {
                rule_id: rule.rule_id.clone(),
                version: rule.version.clone(),
                reason: e.to_string(),
            })?]
        }
        RuleLogic::Contraindication {
            conflicting_patterns,
            ..
        } => conflicting_patterns
            .iter()
            .map(|p| {
                RegexBuilder::new(&regex::escape(p))
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| RegistryError::InvalidPattern {
                        rule_id: rule.rule_id.clone(),
                        version: rule.version.clone(),
                        reason: e.to_string(),
                    })
            })
            .collect::<Result<_, _>>()?,
        RuleLogic::Keyword { keywords, .. } => {
            if keywords.is_empty() {
                return Err(RegistryError::EmptyKeywords {
                    rule_id: rule.rule_id.clone(),
                    version: rule.version.clone(),
                });
            }
            Vec::new()
        }
        RuleLogic::OutOfBounds {
            min_value,
            max_value,
            ..
        } => {
            if min_value > max_value {
                return Err(RegistryError::InvalidBounds {
                    rule_id: rule.rule_id.clone(),
                    version: rule.version.clone(),
                    min: *min_value,
                    max: *max_value,
                });
            }
            Vec::new()
        }
    };

    Ok(CompiledRule {
        rule,
        version_key,
        regexes,
    })
}

fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

/// SHA-256 over a canonical line-per-rule rendering, truncated to 128 bits
/// of hex. The rendering covers every field that affects evaluation, so any
/// rule change changes the hash.
fn ruleset_hash(rules: &[CompiledRule]) -> String {
    let mut hasher = Sha256::new();
    for compiled in rules {
        let r = &compiled.rule;
        let logic = match &r.logic {
            RuleLogic::Contraindication {
                risk_signal,
                conflicting_patterns,
            } => format!(
                "contraindication:{risk_signal}:{}",
                conflicting_patterns.join("\u{1f}")
            ),
            RuleLogic::Pattern { pattern } => format!("pattern:{pattern}"),
            RuleLogic::Keyword { keywords, mode } => {
                let mode = match mode {
                    KeywordMode::PresenceIsViolation => "presence",
                    KeywordMode::AbsenceIsViolation => "absence",
                };
                format!("keyword:{mode}:{}", keywords.join("\u{1f}"))
            }
            RuleLogic::OutOfBounds {
                field,
                min_value,
                max_value,
            } => format!("out_of_bounds:{field}:{min_value}:{max_value}"),
        };
        let line = format!(
            "{}|{}|{}|{}|{}|{}|{logic}\n",
            r.rule_id,
            r.version,
            r.section_key,
            r.severity.as_str(),
            r.flag_type.as_str(),
            r.is_active,
        );
        hasher.update(line.as_bytes());
    }
    let digest = hasher.finalize();
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}
