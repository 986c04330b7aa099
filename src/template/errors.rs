//! Template error types with suggestions

use thiserror::Error;

/// Template rendering and expression errors
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Referenced variable doesn't exist
    #[error("undefined variable '{name}'{}", .suggestion.as_ref().map(|s| format!(", did you mean '{}'?", s)).unwrap_or_default())]
    UndefinedVariable {
        name: String,
        suggestion: Option<String>,
    },

    /// Template syntax error
    #[error("syntax error at line {line}: {message}")]
    SyntaxError { message: String, line: usize },

    /// Expression evaluation error
    #[error("expression error: {message}")]
    ExpressionError { message: String },

    /// Wrapped minijinja error
    #[error("template error: {0}")]
    Internal(#[from] minijinja::Error),
}

impl TemplateError {
    /// Create an undefined variable error with optional suggestion
    pub fn undefined_variable(name: impl Into<String>, known_vars: &[&str]) -> Self {
        let name = name.into();
        let suggestion = suggest_correction(&name, known_vars);
        Self::UndefinedVariable { name, suggestion }
    }

    pub fn syntax(message: impl Into<String>, line: usize) -> Self {
        Self::SyntaxError {
            message: message.into(),
            line,
        }
    }

    pub fn expression(message: impl Into<String>) -> Self {
        Self::ExpressionError {
            message: message.into(),
        }
    }
}

/// Extract the variable name from a minijinja undefined-value message
pub(crate) fn extract_undefined_name(msg: &str) -> String {
    // Messages look like: "undefined value (in <string>:1): variable is `metadata.foo`"
    if let Some(start) = msg.find('`') {
        if let Some(end) = msg[start + 1..].find('`') {
            return msg[start + 1..start + 1 + end].to_string();
        }
    }
    "unknown".to_string()
}

/// Suggest a correction for a typo using Levenshtein distance
pub fn suggest_correction(typo: &str, candidates: &[&str]) -> Option<String> {
    let root = typo.split('.').next().unwrap_or(typo);
    let max_distance = (root.len() / 2).max(2);

    candidates
        .iter()
        .map(|c| (levenshtein_distance(root, c), c))
        .filter(|(d, _)| *d <= max_distance)
        .min_by_key(|(d, _)| *d)
        .map(|(_, c)| c.to_string())
}

fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();

    for i in 1..=a.len() {
        let mut row = vec![i; b.len() + 1];
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            row[j] = (prev[j] + 1).min(row[j - 1] + 1).min(prev[j - 1] + cost);
        }
        prev = row;
    }

    prev[b.len()]
}
