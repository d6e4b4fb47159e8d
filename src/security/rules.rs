/// Pattern rules for the static source screen.
///
/// A rule is data: an id, a regex, a severity and a message. The builtin
/// set flags direct calls that escape the interpreter (`eval(`, `exec(`,
/// `os.system(`, raw `subprocess.` / `socket.` use); deployments append
/// their own rules through `[[security.rules]]` in the config file.
///
/// Matching is purely textual. Obfuscated calls slip through and a flagged
/// substring inside a string literal is still reported; both are known
/// limits of a heuristic screen, not bugs.
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScriptError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Reported, does not reject the script.
    Warning,
    /// Rejects the script.
    Error,
}

/// Rule as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub id: String,
    pub pattern: String,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    pub message: String,
}

fn default_severity() -> Severity {
    Severity::Error
}

#[derive(Debug, Clone)]
pub struct PatternRule {
    pub id: String,
    pattern: Regex,
    pub severity: Severity,
    pub message: String,
}

impl PatternRule {
    pub fn new(id: &str, pattern: &str, severity: Severity, message: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| ScriptError::Config(format!("invalid pattern for rule '{id}': {e}")))?;
        Ok(Self {
            id: id.to_string(),
            pattern,
            severity,
            message: message.to_string(),
        })
    }

    pub fn is_match(&self, line: &str) -> bool {
        self.pattern.is_match(line)
    }
}

impl TryFrom<&RuleConfig> for PatternRule {
    type Error = ScriptError;

    fn try_from(config: &RuleConfig) -> Result<Self> {
        PatternRule::new(&config.id, &config.pattern, config.severity, &config.message)
    }
}

/// A rule hit at a 1-based source line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
    pub line: usize,
}

const BUILTIN_RULES: &[(&str, &str, Severity, &str)] = &[
    ("eval", r"\beval\s*\(", Severity::Error, "call to eval() is not allowed"),
    ("exec", r"\bexec\s*\(", Severity::Error, "call to exec() is not allowed"),
    ("os-system", r"\bos\.system\s*\(", Severity::Error, "call to os.system() is not allowed"),
    ("os-popen", r"\bos\.popen\s*\(", Severity::Error, "call to os.popen() is not allowed"),
    ("subprocess", r"\bsubprocess\.", Severity::Error, "direct use of subprocess is not allowed"),
    ("socket", r"\bsocket\.", Severity::Error, "direct use of socket is not allowed"),
    (
        "dynamic-import",
        r"\b__import__\s*\(",
        Severity::Error,
        "dynamic __import__() is not allowed",
    ),
    (
        "pickle-load",
        r"\bpickle\.loads?\s*\(",
        Severity::Warning,
        "unpickling data can execute arbitrary code",
    ),
];

#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<PatternRule>,
}

impl RuleSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Result<Self> {
        let rules = BUILTIN_RULES
            .iter()
            .map(|(id, pattern, severity, message)| {
                PatternRule::new(id, pattern, *severity, message)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Builtin rules followed by the configured extras.
    pub fn with_extra(extra: &[RuleConfig]) -> Result<Self> {
        let mut set = Self::builtin()?;
        for config in extra {
            set.push(PatternRule::try_from(config)?);
        }
        Ok(set)
    }

    pub fn push(&mut self, rule: PatternRule) {
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Every rule hit, line by line. Whole-line `#` comments are skipped.
    pub fn scan(&self, source: &str) -> Vec<RuleMatch> {
        let mut matches = Vec::new();
        for (idx, line) in source.lines().enumerate() {
            if line.trim_start().starts_with('#') {
                continue;
            }
            for rule in &self.rules {
                if rule.is_match(line) {
                    matches.push(RuleMatch {
                        rule_id: rule.id.clone(),
                        severity: rule.severity,
                        message: rule.message.clone(),
                        line: idx + 1,
                    });
                }
            }
        }
        matches
    }
}
