//! Regex rules that classify log lines
//!
//! Rules are evaluated in configuration order and the first matching rule wins
//! for each line, so one line produces at most one [`Hit`].

use regex::Regex;
use serde::Serialize;

use crate::Severity;
use crate::config::PatternRuleConfig;
use crate::error::{AgentError, AgentResult};
use crate::util::truncate_chars;

/// Upper bound for the text carried by a hit
pub const MAX_HIT_CHARS: usize = 2000;

#[derive(Debug, Clone)]
pub struct PatternRule {
    pub name: String,
    pub regex: Regex,
    pub severity: Severity,
    pub context_lines: usize,
}

impl PatternRule {
    pub fn compile(config: &PatternRuleConfig) -> AgentResult<Self> {
        let regex = Regex::new(&config.regex).map_err(|source| AgentError::InvalidPattern {
            rule: config.name.clone(),
            source,
        })?;

        Ok(Self {
            name: config.name.clone(),
            regex,
            severity: config.severity,
            context_lines: config.context_lines,
        })
    }
}

/// A line that matched a rule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hit {
    pub line_number: u64,
    pub rule: String,
    pub severity: Severity,
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PatternMatcher {
    rules: Vec<PatternRule>,
}

impl PatternMatcher {
    /// Compile all rules. Any invalid regex fails the whole matcher.
    pub fn new(configs: &[PatternRuleConfig]) -> AgentResult<Self> {
        let rules = configs
            .iter()
            .map(PatternRule::compile)
            .collect::<AgentResult<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Scan lines numbered from 1.
    pub fn scan_lines(&self, lines: &[String]) -> Vec<Hit> {
        self.scan_lines_at(lines, 1)
    }

    /// Scan lines where `lines[0]` has line number `first_line`.
    pub fn scan_lines_at(&self, lines: &[String], first_line: u64) -> Vec<Hit> {
        lines
            .iter()
            .enumerate()
            .filter_map(|(idx, line)| {
                let rule = self.rules.iter().find(|rule| rule.regex.is_match(line))?;
                Some(Hit {
                    line_number: first_line + idx as u64,
                    rule: rule.name.clone(),
                    severity: rule.severity,
                    text: truncate_chars(line, MAX_HIT_CHARS),
                    context: context_around(lines, idx, rule.context_lines),
                })
            })
            .collect()
    }
}

fn context_around(lines: &[String], idx: usize, radius: usize) -> Vec<String> {
    if radius == 0 {
        return vec![];
    }
    let start = idx.saturating_sub(radius);
    let end = (idx + radius + 1).min(lines.len());
    lines[start..end]
        .iter()
        .map(|line| truncate_chars(line, MAX_HIT_CHARS))
        .collect()
}
