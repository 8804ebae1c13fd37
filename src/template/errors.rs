//! Errors raised while rendering action command templates

use std::fmt;
use thiserror::Error;

/// Where in a command template rendering failed
#[derive(Debug, Clone, Default)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}:{}", self.line, self.column)
    }
}

#[derive(Debug, Error)]
pub enum TemplateError {
    /// A `{{ params.x }}` reference with no matching parameter
    #[error("undefined variable '{name}' at {location}{}", .suggestion.as_ref().map(|s| format!(", did you mean '{}'?", s)).unwrap_or_default())]
    UndefinedVariable {
        name: String,
        location: SourceLocation,
        suggestion: Option<String>,
    },

    #[error("syntax error at {location}: {message}")]
    SyntaxError {
        message: String,
        location: SourceLocation,
    },

    #[error("filter '{filter}' failed: {message}")]
    FilterError { filter: String, message: String },
}

impl TemplateError {
    /// Undefined reference, with a "did you mean" drawn from `known_vars`
    pub fn undefined_variable_at(
        name: impl Into<String>,
        line: usize,
        column: usize,
        known_vars: &[&str],
    ) -> Self {
        let name = name.into();
        let suggestion = suggest_correction(&name, known_vars);
        Self::UndefinedVariable {
            name,
            location: SourceLocation { line, column },
            suggestion,
        }
    }

    pub fn syntax(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self::SyntaxError {
            message: message.into(),
            location: SourceLocation { line, column },
        }
    }

    pub fn filter(filter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FilterError {
            filter: filter.into(),
            message: message.into(),
        }
    }
}

/// Closest name in `candidates` to a misspelt `typo`
///
/// Only names within half the typo's length (and at least two edits) qualify.
/// Exact matches are ignored since they are not typos.
pub fn suggest_correction(typo: &str, candidates: &[&str]) -> Option<String> {
    let budget = (typo.len() / 2).max(2);
    candidates
        .iter()
        .filter(|name| **name != typo)
        .map(|name| (edit_distance(typo, name), *name))
        .filter(|(distance, _)| *distance <= budget)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, name)| name.to_string())
}

/// Levenshtein distance, computed over a single reusable row
fn edit_distance(from: &str, to: &str) -> usize {
    let target: Vec<char> = to.chars().collect();
    let mut row: Vec<usize> = (0..=target.len()).collect();

    for (i, source_char) in from.chars().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, target_char) in target.iter().enumerate() {
            let substitution = diagonal + usize::from(source_char != *target_char);
            diagonal = row[j + 1];
            row[j + 1] = substitution.min(row[j] + 1).min(diagonal + 1);
        }
    }

    row[target.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("flush_dns", "flsuh_dns"), 2);
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("abc", ""), 3);
        assert_eq!(edit_distance("W3SVC", "W3SVC"), 0);
    }

    #[test]
    fn test_suggest_correction() {
        let candidates = ["flush_dns", "renew_ip", "ping_host", "adapters"];

        assert_eq!(
            suggest_correction("flush_dn", &candidates),
            Some("flush_dns".into())
        );
        assert_eq!(
            suggest_correction("renwe_ip", &candidates),
            Some("renew_ip".into())
        );
        assert_eq!(
            suggest_correction("completely_different", &candidates),
            None
        );
        assert_eq!(suggest_correction("anything", &[]), None);
    }

    #[test]
    fn test_error_display() {
        let err = TemplateError::undefined_variable_at("params.hots", 1, 0, &["params.host"]);
        let msg = err.to_string();
        assert!(msg.contains("undefined variable 'params.hots'"));
        assert!(msg.contains("line 1:0"));
        assert!(msg.contains("did you mean 'params.host'"));
    }
}
