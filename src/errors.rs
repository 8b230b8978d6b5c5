// File: src/errors.rs
//
// Error handling and reporting for the Lumen programming language.
// Provides structured error types with source location information
// and pretty-printed, colored error messages, used by both the compiler
// (one `LumenError` per diagnostic) and the VM (a single error plus a
// rendered call-stack trace).

use colored::Colorize;
use std::fmt;

/// Source location information for tracking where code appears in a file.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLocation {
    pub line: u32,
    pub file: Option<String>,
}

impl SourceLocation {
    pub fn new(line: u32) -> Self {
        Self { line, file: None }
    }

    pub fn with_file(line: u32, file: String) -> Self {
        Self { line, file: Some(file) }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{}:{}", file, self.line),
            None => write!(f, "line {}", self.line),
        }
    }
}

/// Broad category of error. Lex and parse errors are collapsed into one
/// "compile" bucket, since both are reported the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Compile,
    Runtime,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::Compile => write!(f, "Compile Error"),
            ErrorKind::Runtime => write!(f, "Runtime Error"),
        }
    }
}

/// A structured error with location information and, for runtime errors,
/// a frame-by-frame call stack.
#[derive(Debug, Clone)]
pub struct LumenError {
    pub kind: ErrorKind,
    pub message: String,
    pub location: SourceLocation,
    pub call_stack: Vec<String>,
    pub suggestion: Option<String>,
}

impl LumenError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, location: SourceLocation) -> Self {
        Self {
            kind,
            message: message.into(),
            location,
            call_stack: Vec::new(),
            suggestion: None,
        }
    }

    pub fn compile(message: impl Into<String>, line: u32) -> Self {
        Self::new(ErrorKind::Compile, message, SourceLocation::new(line))
    }

    pub fn runtime(message: impl Into<String>, line: u32) -> Self {
        Self::new(ErrorKind::Runtime, message, SourceLocation::new(line))
    }

    pub fn with_call_stack(mut self, frames: Vec<String>) -> Self {
        self.call_stack = frames;
        self
    }

    pub fn with_suggestion(mut self, suggestion: String) -> Self {
        self.suggestion = Some(suggestion);
        self
    }
}

impl fmt::Display for LumenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}: {}", self.kind.to_string().red().bold(), self.message.bold())?;
        writeln!(f, "{}", format!("  --> {}", self.location).bright_blue())?;

        if let Some(suggestion) = &self.suggestion {
            writeln!(
                f,
                "  {} {}",
                "=".bright_green(),
                format!("Did you mean '{}'?", suggestion).bright_green()
            )?;
        }

        for (depth, frame) in self.call_stack.iter().enumerate() {
            writeln!(f, "  {} at {}", format!("#{depth}").dimmed(), frame)?;
        }

        Ok(())
    }
}

impl std::error::Error for LumenError {}

/// Computes the Levenshtein distance between two strings, used for
/// "did you mean?" suggestions on undefined globals/properties.
pub fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let len1 = s1.chars().count();
    let len2 = s2.chars().count();

    if len1 == 0 {
        return len2;
    }
    if len2 == 0 {
        return len1;
    }

    let mut matrix = vec![vec![0; len2 + 1]; len1 + 1];
    for (i, row) in matrix.iter_mut().enumerate().take(len1 + 1) {
        row[0] = i;
    }
    for (j, cell) in matrix[0].iter_mut().enumerate().take(len2 + 1) {
        *cell = j;
    }

    let s1_chars: Vec<char> = s1.chars().collect();
    let s2_chars: Vec<char> = s2.chars().collect();

    for i in 1..=len1 {
        for j in 1..=len2 {
            let cost = if s1_chars[i - 1] == s2_chars[j - 1] { 0 } else { 1 };
            matrix[i][j] = std::cmp::min(
                std::cmp::min(matrix[i - 1][j] + 1, matrix[i][j - 1] + 1),
                matrix[i - 1][j - 1] + cost,
            );
        }
    }

    matrix[len1][len2]
}

/// Finds the closest match from a list of candidates using Levenshtein
/// distance; returns `None` if nothing is within distance 3.
pub fn find_closest_match<'a>(target: &str, candidates: &[&'a str]) -> Option<&'a str> {
    let mut best_match = None;
    let mut best_distance = usize::MAX;

    for &candidate in candidates {
        let distance = levenshtein_distance(target, candidate);
        if distance <= 3 && distance < best_distance {
            best_distance = distance;
            best_match = Some(candidate);
        }
    }

    best_match
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_have_zero_distance() {
        assert_eq!(levenshtein_distance("hello", "hello"), 0);
    }

    #[test]
    fn finds_close_match() {
        let candidates = ["length", "width", "height"];
        assert_eq!(find_closest_match("lenght", &candidates), Some("length"));
    }

    #[test]
    fn no_match_when_too_far() {
        let candidates = ["alpha", "beta"];
        assert_eq!(find_closest_match("zzzzzzzz", &candidates), None);
    }
}
