//! testgen/validate.rs
//!
//! Classifies a candidate test file. Syntax first (in-process, cheap),
//! then compilation (external, expensive). Owns no retry logic.

use std::io::Write;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;

use crate::config::TestFramework;
use crate::control::Semaphore;
use crate::detectors::ast::{first_error_line, line_of, mask_code, parse_source};
use crate::detectors::language::{test_language, Language};
use crate::state::Verdict;
use crate::testgen::runner::{CompileRequest, ToolchainRunner};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub verdict: Verdict,
    pub diagnostic: String,
}

impl Validation {
    fn pass() -> Self {
        Self {
            verdict: Verdict::Pass,
            diagnostic: String::new(),
        }
    }

    fn fail(verdict: Verdict, diagnostic: impl Into<String>) -> Self {
        Self {
            verdict,
            diagnostic: diagnostic.into(),
        }
    }
}

pub struct Validator<'a> {
    pub framework: TestFramework,
    pub check_syntax: bool,
    pub check_compilation: bool,
    pub toolchain: &'a dyn ToolchainRunner,
    pub compile_slots: &'a Semaphore,
    pub project_root: PathBuf,
    pub sources: Vec<PathBuf>,
    pub include_dirs: Vec<PathBuf>,
}

impl Validator<'_> {
    pub fn validate(&self, candidate: &str) -> Validation {
        if self.check_syntax {
            if let Err(diagnostic) = check_syntax(candidate, self.framework) {
                return Validation::fail(Verdict::SyntaxFail, diagnostic);
            }
        }

        if self.check_compilation {
            if let Err(diagnostic) = self.compile(candidate) {
                return Validation::fail(Verdict::CompileFail, diagnostic);
            }
        }

        Validation::pass()
    }

    fn compile(&self, candidate: &str) -> Result<(), String> {
        let suffix = match self.framework {
            TestFramework::Gtest => ".cpp",
            TestFramework::Pytest => ".py",
            TestFramework::Cargo => ".rs",
        };

        let mut file = tempfile::Builder::new()
            .prefix("testsmith_candidate_")
            .suffix(suffix)
            .tempfile()
            .map_err(|e| format!("cannot stage candidate: {e}"))?;
        file.write_all(candidate.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| format!("cannot stage candidate: {e}"))?;

        let req = CompileRequest {
            framework: self.framework,
            project_root: self.project_root.clone(),
            test_file: file.path().to_path_buf(),
            sources: self.sources.clone(),
            include_dirs: self.include_dirs.clone(),
        };

        let output = {
            let _slot = self.compile_slots.acquire();
            self.toolchain.compile(&req)
        };

        match output {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(out.diagnostic()),
            Err(e) => Err(format!("compiler could not be run: {e}")),
        }
    }
}

/* ============================================================
   Syntax
   ============================================================ */

fn gtest_include_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?m)^\s*#\s*include\s*[<"]gtest/gtest\.h[>"]"#).expect("static regex"))
}

fn gtest_case_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bTEST(?:_F|_P)?\s*\(").expect("static regex"))
}

pub fn check_syntax(candidate: &str, framework: TestFramework) -> Result<(), String> {
    if candidate.trim().is_empty() {
        return Err("empty candidate: the reply contained no code".into());
    }

    check_source_syntax(candidate, test_language(framework))?;
    check_structure(candidate, framework)
}

/// Parse check for production code in its own language.
pub fn check_source_syntax(code: &str, language: Language) -> Result<(), String> {
    if code.trim().is_empty() {
        return Err("empty file".into());
    }
    match language {
        Language::Rust | Language::Python => {
            let tree = parse_source(language, code)
                .ok_or_else(|| format!("{language} parser unavailable"))?;
            match first_error_line(&tree) {
                Some(line) => Err(format!("syntax error near line {line}")),
                None => Ok(()),
            }
        }
        _ => check_delimiters(code, language),
    }
}

fn check_delimiters(candidate: &str, language: Language) -> Result<(), String> {
    let masked = mask_code(candidate, language);
    let mut stack: Vec<(u8, usize)> = Vec::new();

    for (i, b) in masked.bytes().enumerate() {
        match b {
            b'(' | b'{' | b'[' => stack.push((b, i)),
            b')' | b'}' | b']' => {
                let want = match b {
                    b')' => b'(',
                    b'}' => b'{',
                    _ => b'[',
                };
                match stack.pop() {
                    Some((open, _)) if open == want => {}
                    Some((open, at)) => {
                        return Err(format!(
                            "mismatched '{}' at line {} (opened '{}' at line {})",
                            b as char,
                            line_of(candidate, i),
                            open as char,
                            line_of(candidate, at)
                        ))
                    }
                    None => {
                        return Err(format!(
                            "unexpected '{}' at line {}",
                            b as char,
                            line_of(candidate, i)
                        ))
                    }
                }
            }
            _ => {}
        }
    }

    match stack.pop() {
        Some((open, at)) => Err(format!(
            "unclosed '{}' opened at line {}",
            open as char,
            line_of(candidate, at)
        )),
        None => Ok(()),
    }
}

fn check_structure(candidate: &str, framework: TestFramework) -> Result<(), String> {
    let mut issues = Vec::new();

    match framework {
        TestFramework::Gtest => {
            if !gtest_include_regex().is_match(candidate) {
                issues.push("missing required #include <gtest/gtest.h>");
            }
            if !gtest_case_regex().is_match(candidate) {
                issues.push("no TEST cases found");
            }
        }
        TestFramework::Pytest => {
            if !candidate.lines().any(|l| {
                let l = l.trim_start();
                l.starts_with("def test") || l.starts_with("async def test")
            }) {
                issues.push("no test_ functions found");
            }
        }
        TestFramework::Cargo => {
            if !candidate.contains("#[test]") {
                issues.push("no #[test] functions found");
            }
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues.join("; "))
    }
}
