//! Instrumentation scoping rules.
//!
//! Compiles a comma-separated list of glob patterns into an
//! [`InstrumentationFilter`], the predicate deciding whether a definition loaded
//! into an isolated execution context is passed through the instrumentation
//! agent.
//!
//! ## Pattern syntax
//!
//! Names are `.`-separated segment paths (`com.example.Parser$Inner`).
//!
//! | Pattern | Matches |
//! |---------|---------|
//! | `com.example.Parser` | exactly that name |
//! | `com.example.*` | one segment below `com.example` |
//! | `com.example.Pars*` | `*` inside a segment matches any non-`.` characters |
//! | `com.example.**` | `com.example` itself and everything nested below it |
//! | `!com.example.internal.**` | the same glob, as an exclude rule |
//!
//! Rules are evaluated in declaration order and the last matching rule wins.
//! A name no rule matches is not instrumented.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Prefix turning a rule into an exclude rule.
pub const EXCLUDE_PREFIX: char = '!';

/// What a matching rule decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleEffect {
    Include,
    Exclude,
}

/// One compiled glob with its effect.
#[derive(Debug, Clone)]
pub struct InstrumentationRule {
    pattern: String,
    effect: RuleEffect,
    regex: Regex,
}

impl InstrumentationRule {
    /// Compile a single glob (without the `!` prefix).
    pub fn new(pattern: &str, effect: RuleEffect) -> Result<Self, ConfigurationError> {
        let regex = compile_glob(pattern).map_err(|reason| ConfigurationError::MalformedPattern {
            pattern: pattern.to_string(),
            reason,
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            effect,
            regex,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn effect(&self) -> RuleEffect {
        self.effect
    }

    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }
}

/// Ordered, immutable rule set. Matching is a pure function of the rules and
/// the name.
#[derive(Debug, Clone, Default)]
pub struct InstrumentationFilter {
    rules: Vec<InstrumentationRule>,
}

impl InstrumentationFilter {
    /// A filter that instruments nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compile a rule string such as `com.example.**,!com.example.generated.**`.
    ///
    /// Empty entries (a trailing comma, surrounding whitespace) are ignored.
    pub fn compile(list: &str) -> Result<Self, ConfigurationError> {
        let mut filter = Self::empty();
        filter.push_rules(list, RuleEffect::Include)?;
        Ok(filter)
    }

    /// Compile an include list followed by an exclude list.
    ///
    /// Every entry of `excludes` becomes an exclude rule regardless of a `!`
    /// prefix, and because the excludes come last they override any include.
    pub fn from_parts(includes: &str, excludes: &str) -> Result<Self, ConfigurationError> {
        let mut filter = Self::compile(includes)?;
        filter.push_rules(excludes, RuleEffect::Exclude)?;
        Ok(filter)
    }

    fn push_rules(&mut self, list: &str, default_effect: RuleEffect) -> Result<(), ConfigurationError> {
        for entry in list.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (pattern, effect) = match entry.strip_prefix(EXCLUDE_PREFIX) {
                Some(rest) => (rest, RuleEffect::Exclude),
                None => (entry, default_effect),
            };
            if pattern.is_empty() {
                return Err(ConfigurationError::MalformedPattern {
                    pattern: entry.to_string(),
                    reason: "exclude marker without a pattern".into(),
                });
            }
            self.rules.push(InstrumentationRule::new(pattern, effect)?);
        }
        Ok(())
    }

    /// Whether a definition with this fully-qualified name is instrumented.
    pub fn should_instrument(&self, name: &str) -> bool {
        self.rules
            .iter()
            .rev()
            .find(|rule| rule.matches(name))
            .map(|rule| rule.effect() == RuleEffect::Include)
            .unwrap_or(false)
    }

    /// The last rule matching `name`, if any.
    pub fn matching_rule(&self, name: &str) -> Option<&InstrumentationRule> {
        self.rules.iter().rev().find(|rule| rule.matches(name))
    }

    pub fn rules(&self) -> &[InstrumentationRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Translate one glob into an anchored regex.
fn compile_glob(pattern: &str) -> Result<Regex, String> {
    if pattern.split('.').all(|segment| segment == "**") {
        return Regex::new("^.*$").map_err(|e| e.to_string());
    }

    let mut out = String::from("^");
    // Whether the regex built so far ends right after a name segment.
    let mut after_segment = false;
    let mut previous_double_star = false;

    for segment in pattern.split('.') {
        if segment.is_empty() {
            return Err("empty name segment".into());
        }
        if let Some(c) = segment
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '-' | '*')))
        {
            return Err(format!("unexpected character {c:?}"));
        }

        if segment == "**" {
            // `**.**` matches the same names as `**`.
            if previous_double_star {
                continue;
            }
            previous_double_star = true;
            if after_segment {
                out.push_str(r"(?:\.[^.]+)*");
            } else {
                out.push_str(r"(?:[^.]+\.)*");
            }
            continue;
        }
        if segment.contains("**") {
            return Err("`**` must be a whole segment".into());
        }
        previous_double_star = false;

        if after_segment {
            out.push_str(r"\.");
        }
        if segment == "*" {
            out.push_str("[^.]+");
        } else {
            let parts: Vec<String> = segment.split('*').map(regex::escape).collect();
            out.push_str(&parts.join("[^.]*"));
        }
        after_segment = true;
    }

    out.push('$');
    Regex::new(&out).map_err(|e| e.to_string())
}
