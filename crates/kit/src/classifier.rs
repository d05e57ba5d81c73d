//! Installer output classification
//!
//! The installer payload emits free-form text. Every line is mapped to a
//! [`Tag`] by an ordered, declarative [`Ruleset`]: critical-error rules are
//! always evaluated before phase-marker rules, and a line matching nothing
//! is informational. Classification is a pure function of the line, so the
//! rules can be tested against captured log lines directly.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::phase::Phase;

/// Marker name that moves a run out of the Install phase.
pub const INSTALL_COMPLETE: &str = "install-complete";

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("valid ANSI regex"));

/// Classification of one line of output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "value")]
pub enum Tag {
    Informational,
    /// A named milestone was reached.
    PhaseMarker(String),
    /// A fatal condition; carries the pattern that matched.
    CriticalError(String),
}

/// A classified line, stamped with when it was seen and during which phase.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub raw: String,
    pub timestamp: DateTime<Utc>,
    pub tag: Tag,
    pub phase: Phase,
}

/// Rule class as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleKind {
    Critical,
    Marker,
}

/// One `[[rule]]` entry from the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    pub pattern: String,
    pub tag: RuleKind,
    /// Marker name emitted by `marker` rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<String>,
    /// Higher values are evaluated first within the same rule class.
    #[serde(default)]
    pub priority: i32,
}

impl RuleSpec {
    fn critical(pattern: &str, priority: i32) -> Self {
        Self {
            pattern: pattern.to_owned(),
            tag: RuleKind::Critical,
            marker: None,
            priority,
        }
    }

    fn marker(pattern: &str, marker: &str, priority: i32) -> Self {
        Self {
            pattern: pattern.to_owned(),
            tag: RuleKind::Marker,
            marker: Some(marker.to_owned()),
            priority,
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    regex: Regex,
    kind: RuleKind,
    marker: Option<String>,
    priority: i32,
}

/// An ordered, compiled set of classification rules.
#[derive(Debug, Clone)]
pub struct Ruleset {
    rules: Vec<Rule>,
}

/// Rules recognised when the configuration does not provide any.
pub fn default_rules() -> Vec<RuleSpec> {
    vec![
        // Structured `::KIND::message` lines emitted by instrumented payloads
        RuleSpec::critical(r"^::ERROR::", 100),
        RuleSpec::critical(r"error: Disko partitioning failed", 50),
        RuleSpec::critical(r"kernel panic", 50),
        RuleSpec::critical(r"out of memory", 50),
        RuleSpec::critical(r"CRITICAL ERROR", 50),
        RuleSpec::critical(r"Installation failed", 50),
        RuleSpec::critical(r"No suitable .*disk found", 50),
        RuleSpec::marker(r"^::SUCCESS::.*install", INSTALL_COMPLETE, 100),
        RuleSpec::marker(
            r"Installation complete(d)?( successfully)?",
            INSTALL_COMPLETE,
            50,
        ),
        RuleSpec::marker(r"Setting up disk partitioning", "partitioning", 10),
        RuleSpec::marker(r"Installing NixOS configuration", "installing", 10),
        RuleSpec::marker(r"Building configuration", "building", 10),
    ]
}

fn structured_phase(line: &str) -> Option<String> {
    let rest = line.strip_prefix("::PHASE::")?;
    let name = rest.trim().to_lowercase().replace('_', "-");
    (!name.is_empty()).then_some(name)
}

impl Ruleset {
    /// Compile rules, ordering critical rules before marker rules and by
    /// descending priority within each class. Ties keep declaration order.
    pub fn new(specs: &[RuleSpec]) -> Result<Self> {
        let mut rules = specs
            .iter()
            .enumerate()
            .map(|(idx, spec)| {
                let regex = RegexBuilder::new(&spec.pattern)
                    .case_insensitive(true)
                    .build()
                    .with_context(|| format!("Invalid pattern in rule {idx}: {}", spec.pattern))?;
                let marker = match (spec.tag, spec.marker.as_deref()) {
                    (RuleKind::Marker, Some(m)) if !m.trim().is_empty() => Some(m.trim().to_owned()),
                    (RuleKind::Marker, _) => {
                        return Err(eyre!(
                            "Marker rule {idx} ({}) must name a marker",
                            spec.pattern
                        ))
                    }
                    (RuleKind::Critical, _) => None,
                };
                Ok(Rule {
                    regex,
                    kind: spec.tag,
                    marker,
                    priority: spec.priority,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        // sort_by is stable
        rules.sort_by(|a, b| {
            class_rank(a.kind)
                .cmp(&class_rank(b.kind))
                .then(b.priority.cmp(&a.priority))
        });
        Ok(Self { rules })
    }

    pub fn default_set() -> Result<Self> {
        Self::new(&default_rules())
    }

    /// Whether any marker rule produces `name`.
    pub fn emits_marker(&self, name: &str) -> bool {
        self.rules
            .iter()
            .any(|r| r.marker.as_deref() == Some(name))
    }

    /// Map one line to its tag. Total: never fails for any input.
    pub fn tag(&self, line: &str) -> Tag {
        let cleaned = ANSI_ESCAPE.replace_all(line, "");
        let line = cleaned.trim();
        let mut structured_checked = false;
        for rule in &self.rules {
            if rule.kind == RuleKind::Marker && !structured_checked {
                // `::PHASE::NAME` ranks with marker rules, after all critical rules
                structured_checked = true;
                if let Some(name) = structured_phase(line) {
                    return Tag::PhaseMarker(name);
                }
            }
            if rule.regex.is_match(line) {
                return match rule.kind {
                    RuleKind::Critical => Tag::CriticalError(rule.regex.as_str().to_owned()),
                    RuleKind::Marker => {
                        Tag::PhaseMarker(rule.marker.clone().unwrap_or_default())
                    }
                };
            }
        }
        if !structured_checked {
            if let Some(name) = structured_phase(line) {
                return Tag::PhaseMarker(name);
            }
        }
        Tag::Informational
    }

    /// Classify one line observed during `phase`.
    pub fn classify(&self, line: &str, phase: Phase) -> StreamEvent {
        StreamEvent {
            raw: line.to_owned(),
            timestamp: Utc::now(),
            tag: self.tag(line),
            phase,
        }
    }
}

fn class_rank(kind: RuleKind) -> u8 {
    match kind {
        RuleKind::Critical => 0,
        RuleKind::Marker => 1,
    }
}
