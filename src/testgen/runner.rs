// Executes compiler commands and returns raw status + output.
// No parsing. No interpretation.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

use crate::config::TestFramework;

#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub framework: TestFramework,
    pub project_root: PathBuf,
    pub test_file: PathBuf,
    pub sources: Vec<PathBuf>,
    pub include_dirs: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// What a human (or a model) needs to see to fix the failure.
    pub fn diagnostic(&self) -> String {
        let mut combined = String::new();

        if !self.stderr.trim().is_empty() {
            combined.push_str(self.stderr.trim());
        }

        if !self.stdout.trim().is_empty() {
            if !combined.is_empty() {
                combined.push_str("\n=== STDOUT ===\n");
            }
            combined.push_str(self.stdout.trim());
        }

        if combined.is_empty() {
            combined = format!("exited with status {}", self.exit_code);
        }
        combined
    }
}

/// External compiler toolchain.
pub trait ToolchainRunner: Send + Sync {
    fn compile(&self, req: &CompileRequest) -> io::Result<ToolOutput>;
}

/// Runs a configurable command line.
///
/// Placeholders: `{test}`, `{root}` (substituted inside any argument),
/// `{sources}`, `{includes}` (expanded to several arguments; must stand alone).
pub struct ProcessToolchain {
    command: Option<Vec<String>>,
}

impl ProcessToolchain {
    pub fn new(command: Option<Vec<String>>) -> Self {
        Self { command }
    }

    fn template(&self, framework: TestFramework) -> Option<Vec<String>> {
        if let Some(cmd) = &self.command {
            return Some(cmd.clone());
        }

        let default: &[&str] = match framework {
            TestFramework::Gtest => &["g++", "-std=c++17", "-fsyntax-only", "{includes}", "{test}"],
            TestFramework::Pytest => &["python3", "-m", "py_compile", "{test}"],
            // Integration tests only compile inside their crate; needs an explicit command.
            TestFramework::Cargo => return None,
        };
        Some(default.iter().map(|s| s.to_string()).collect())
    }
}

impl ToolchainRunner for ProcessToolchain {
    fn compile(&self, req: &CompileRequest) -> io::Result<ToolOutput> {
        let Some(template) = self.template(req.framework) else {
            tracing::debug!(framework = ?req.framework, "no compile command configured, skipping");
            return Ok(ToolOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            });
        };

        let args = expand(&template, req);
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty compile command"))?;

        let started = Instant::now();
        let out = Command::new(program)
            .args(rest)
            .current_dir(&req.project_root)
            .env("PYTHONPATH", &req.project_root)
            .output()?;

        tracing::debug!(
            command = %args.join(" "),
            status = out.status.code().unwrap_or(-1),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "compiler finished"
        );

        Ok(ToolOutput {
            exit_code: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

fn expand(template: &[String], req: &CompileRequest) -> Vec<String> {
    let path = |p: &Path| p.to_string_lossy().into_owned();
    let mut out = Vec::new();

    for arg in template {
        match arg.as_str() {
            "{sources}" => out.extend(req.sources.iter().map(|p| path(p))),
            "{includes}" => out.extend(req.include_dirs.iter().map(|p| format!("-I{}", path(p)))),
            _ => out.push(
                arg.replace("{test}", &path(&req.test_file))
                    .replace("{root}", &path(&req.project_root)),
            ),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> CompileRequest {
        CompileRequest {
            framework: TestFramework::Gtest,
            project_root: PathBuf::from("/p"),
            test_file: PathBuf::from("/tmp/t.cpp"),
            sources: vec![PathBuf::from("/p/a.cpp"), PathBuf::from("/p/b.cpp")],
            include_dirs: vec![PathBuf::from("/p"), PathBuf::from("/p/src")],
        }
    }

    #[test]
    fn placeholders_expand() {
        let template: Vec<String> = ["cc", "{includes}", "{sources}", "-o{root}/out", "{test}"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        assert_eq!(
            expand(&template, &req()),
            vec!["cc", "-I/p", "-I/p/src", "/p/a.cpp", "/p/b.cpp", "-o/p/out", "/tmp/t.cpp"]
        );
    }

    #[test]
    fn diagnostic_prefers_stderr() {
        let out = ToolOutput {
            exit_code: 1,
            stdout: "noise".into(),
            stderr: "error: expected ';'".into(),
        };
        assert!(out.diagnostic().starts_with("error: expected ';'"));

        let silent = ToolOutput {
            exit_code: 2,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(silent.diagnostic(), "exited with status 2");
    }

    #[test]
    fn cargo_without_command_is_skipped() {
        let tc = ProcessToolchain::new(None);
        let out = tc
            .compile(&CompileRequest {
                framework: TestFramework::Cargo,
                ..req()
            })
            .unwrap();
        assert!(out.success());
    }
}
