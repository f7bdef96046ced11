// src/interception/policy.rs
//! Rewrite policy: which modules get their exit calls rewritten
//!
//! Module names are `/`-separated paths (e.g. `app/cli/main`). Rules are
//! glob patterns:
//!
//! - `*` matches within one path segment
//! - `**` matches across segments, `**/` matches zero or more segments
//! - `?` matches one character
//! - no wildcard means an exact match
//!
//! A policy string is a comma-separated list of rules: `+pat` or
//! `include:pat` includes, `-pat` or `exclude:pat` excludes, and a bare
//! pattern includes.
//!
//! The most specific matching rule wins. Exact patterns beat globs, then
//! the pattern with more literal characters wins, and a tie goes to the
//! exclude rule. When no rule matches, a module is eligible unless the
//! policy lists at least one include rule.

use crate::utils::errors::{InterceptError, Result};
use regex::Regex;
use std::cmp::Ordering;
use std::fmt;
use tracing::debug;

/// Excludes that protect the engine and the host test framework from
/// rewriting themselves. User rules cannot override these.
pub const SEALED_EXCLUDES: &[&str] = &[
    "exit_intercept/**",
    "wasi/**",
    "std/**",
    "core/**",
    "libtest/**",
];

/// What a rule does with a matching module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Include,
    Exclude,
}

/// A compiled module-name pattern
#[derive(Debug, Clone)]
pub enum ModulePattern {
    Exact(String),
    Glob { original: String, regex: Regex },
}

impl ModulePattern {
    /// Compile a pattern string
    pub fn compile(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(InterceptError::PolicyError("empty pattern".to_string()));
        }

        if pattern.contains('*') || pattern.contains('?') {
            let regex = glob_to_regex(pattern)?;
            Ok(ModulePattern::Glob {
                original: pattern.to_string(),
                regex,
            })
        } else {
            Ok(ModulePattern::Exact(pattern.to_string()))
        }
    }

    pub fn matches(&self, module_name: &str) -> bool {
        match self {
            ModulePattern::Exact(s) => s == module_name,
            ModulePattern::Glob { regex, .. } => regex.is_match(module_name),
        }
    }

    pub fn original(&self) -> &str {
        match self {
            ModulePattern::Exact(s) => s,
            ModulePattern::Glob { original, .. } => original,
        }
    }

    /// Ranking key: exact patterns first, then by literal characters
    fn specificity(&self) -> (bool, usize) {
        match self {
            ModulePattern::Exact(s) => (true, s.chars().count()),
            ModulePattern::Glob { original, .. } => (
                false,
                original.chars().filter(|c| *c != '*' && *c != '?').count(),
            ),
        }
    }
}

/// A single policy rule
#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub pattern: ModulePattern,
    pub action: RuleAction,
    pub sealed: bool,
}

impl PolicyRule {
    pub fn include(pattern: &str) -> Result<Self> {
        Ok(Self {
            pattern: ModulePattern::compile(pattern)?,
            action: RuleAction::Include,
            sealed: false,
        })
    }

    pub fn exclude(pattern: &str) -> Result<Self> {
        Ok(Self {
            pattern: ModulePattern::compile(pattern)?,
            action: RuleAction::Exclude,
            sealed: false,
        })
    }

    /// Order two matching rules; `Greater` means `self` takes precedence
    fn precedence(&self, other: &PolicyRule) -> Ordering {
        self.pattern
            .specificity()
            .cmp(&other.pattern.specificity())
            .then_with(|| match (self.action, other.action) {
                (RuleAction::Exclude, RuleAction::Include) => Ordering::Greater,
                (RuleAction::Include, RuleAction::Exclude) => Ordering::Less,
                _ => Ordering::Equal,
            })
    }
}

/// Outcome of evaluating a module name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub eligible: bool,

    /// Pattern of the deciding rule, `None` when the default applied
    pub rule: Option<String>,
}

/// Module eligibility policy, fixed at agent attach time
#[derive(Debug, Clone)]
pub struct RewritePolicy {
    sealed: Vec<PolicyRule>,
    rules: Vec<PolicyRule>,
}

impl RewritePolicy {
    /// Policy with only the sealed excludes: every other module is eligible
    pub fn with_defaults() -> Self {
        let sealed = SEALED_EXCLUDES
            .iter()
            .map(|p| PolicyRule {
                pattern: ModulePattern::compile(p).expect("sealed patterns are valid"),
                action: RuleAction::Exclude,
                sealed: true,
            })
            .collect();

        Self {
            sealed,
            rules: Vec::new(),
        }
    }

    /// Parse a policy string on top of the sealed excludes
    pub fn parse(text: &str) -> Result<Self> {
        let mut policy = Self::with_defaults();

        for entry in text.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let rule = if let Some(p) = entry.strip_prefix("include:") {
                PolicyRule::include(p.trim())?
            } else if let Some(p) = entry.strip_prefix("exclude:") {
                PolicyRule::exclude(p.trim())?
            } else if let Some(p) = entry.strip_prefix('+') {
                PolicyRule::include(p.trim())?
            } else if let Some(p) = entry.strip_prefix('-') {
                PolicyRule::exclude(p.trim())?
            } else {
                PolicyRule::include(entry)?
            };
            policy.rules.push(rule);
        }

        debug!("Parsed rewrite policy: {}", policy);
        Ok(policy)
    }

    /// Parse an optional policy string, defaulting to [`Self::with_defaults`]
    pub fn from_option(text: Option<&str>) -> Result<Self> {
        match text {
            Some(text) => Self::parse(text),
            None => Ok(Self::with_defaults()),
        }
    }

    /// Add a rule after construction
    pub fn push(&mut self, rule: PolicyRule) {
        self.rules.push(rule);
    }

    /// Decide whether `module_name` may be rewritten
    pub fn decide(&self, module_name: &str) -> Decision {
        if let Some(rule) = self.sealed.iter().find(|r| r.pattern.matches(module_name)) {
            return Decision {
                eligible: false,
                rule: Some(rule.pattern.original().to_string()),
            };
        }

        let winner = self
            .rules
            .iter()
            .filter(|r| r.pattern.matches(module_name))
            .max_by(|a, b| a.precedence(b));

        match winner {
            Some(rule) => Decision {
                eligible: rule.action == RuleAction::Include,
                rule: Some(rule.pattern.original().to_string()),
            },
            None => Decision {
                eligible: !self.has_includes(),
                rule: None,
            },
        }
    }

    pub fn is_eligible(&self, module_name: &str) -> bool {
        self.decide(module_name).eligible
    }

    fn has_includes(&self) -> bool {
        self.rules.iter().any(|r| r.action == RuleAction::Include)
    }
}

impl Default for RewritePolicy {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Display for RewritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .rules
            .iter()
            .map(|r| match r.action {
                RuleAction::Include => format!("+{}", r.pattern.original()),
                RuleAction::Exclude => format!("-{}", r.pattern.original()),
            })
            .collect();
        write!(f, "{}", rendered.join(","))
    }
}

/// Convert a module-name glob to an anchored regex
fn glob_to_regex(glob: &str) -> Result<Regex> {
    let mut regex = String::from("^");
    let chars: Vec<char> = glob.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    regex.push_str("(.*/)?");
                    i += 3;
                } else {
                    regex.push_str(".*");
                    i += 2;
                }
            }
            '*' => {
                regex.push_str("[^/]*");
                i += 1;
            }
            '?' => {
                regex.push_str("[^/]");
                i += 1;
            }
            c => {
                regex.push_str(&regex::escape(&c.to_string()));
                i += 1;
            }
        }
    }

    regex.push('$');

    Regex::new(&regex).map_err(|e| {
        InterceptError::PolicyError(format!("pattern '{}' is invalid: {}", glob, e))
    })
}
