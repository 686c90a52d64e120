use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::detectors::language::Language;

/* ---------- source model ---------- */

/// One function (or the whole file, when extraction degraded) that a
/// generated test must exercise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionSignature {
    pub name: String,
    pub params: Vec<String>,
    pub return_type: Option<String>,
    pub qualifiers: Vec<String>,
    /// Declaration text up to the body.
    pub signature: String,
    /// Full definition, used as prompt context.
    pub source: String,
    pub whole_unit: bool,
}

impl FunctionSignature {
    pub fn whole_unit(file: &str, source: &str) -> Self {
        Self {
            name: format!("<{file}>"),
            params: Vec::new(),
            return_type: None,
            qualifiers: Vec::new(),
            signature: String::new(),
            source: source.to_string(),
            whole_unit: true,
        }
    }

    pub fn display(&self) -> String {
        if self.whole_unit {
            return self.name.clone();
        }
        if !self.signature.is_empty() {
            return self.signature.clone();
        }
        format!("{}({})", self.name, self.params.join(", "))
    }
}

/// One source file, the unit of test generation.
#[derive(Debug, Clone)]
pub struct SourceUnit {
    /// Path relative to the project root, `/`-separated.
    pub path: String,
    pub abs_path: PathBuf,
    pub language: Language,
    pub source: String,
    pub content_hash: String,
    pub signatures: Vec<FunctionSignature>,
}

/* ---------- generation ---------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pending,
    SyntaxFail,
    CompileFail,
    Pass,
}

impl Verdict {
    pub fn is_failure(self) -> bool {
        matches!(self, Verdict::SyntaxFail | Verdict::CompileFail)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Pending => "PENDING",
            Verdict::SyntaxFail => "SYNTAX_FAIL",
            Verdict::CompileFail => "COMPILE_FAIL",
            Verdict::Pass => "PASS",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationAttempt {
    pub number: u32,
    pub prompt: String,
    pub response: String,
    pub candidate: String,
    pub verdict: Verdict,
    pub diagnostic: String,
}

impl GenerationAttempt {
    pub fn new(number: u32, prompt: String) -> Self {
        Self {
            number,
            prompt,
            response: String::new(),
            candidate: String::new(),
            verdict: Verdict::Pending,
            diagnostic: String::new(),
        }
    }
}

/* ---------- artifacts ---------- */

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: String,
    pub source_hash: String,
    /// test case name -> attempt number that produced it (0 = pre-existing).
    pub cases: BTreeMap<String, u32>,
}

#[derive(Debug, Clone)]
pub struct TestArtifact {
    pub path: PathBuf,
    pub content: String,
    pub case_names: Vec<String>,
    pub provenance: Provenance,
    pub unresolved: Vec<String>,
}

/* ---------- coverage ---------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageResult {
    pub source: String,
    pub line_percent: f64,
    pub branch_percent: Option<f64>,
    pub lines_total: usize,
    pub lines_covered: usize,
    pub uncovered_lines: Vec<usize>,
    pub passed: bool,
}

impl CoverageResult {
    pub fn from_lines(source: impl Into<String>, lines_total: usize, lines_covered: usize, uncovered_lines: Vec<usize>) -> Self {
        let line_percent = if lines_total == 0 {
            0.0
        } else {
            lines_covered as f64 / lines_total as f64 * 100.0
        };

        Self {
            source: source.into(),
            line_percent,
            branch_percent: None,
            lines_total,
            lines_covered,
            uncovered_lines,
            passed: false,
        }
    }
}
