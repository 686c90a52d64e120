//! Scripted collaborators and scratch projects for driving a whole run.

#![allow(dead_code)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tempfile::TempDir;

use testsmith::config::{TestFramework, TestGenConfig};
use testsmith::error::{CoverageError, GatewayError};
use testsmith::llm::backend::ModelGateway;
use testsmith::llm::prompt::LlmPrompt;
use testsmith::coverage::CoverageRunner;
use testsmith::state::{CoverageResult, SourceUnit};
use testsmith::testgen::runner::{CompileRequest, ToolOutput, ToolchainRunner};

pub const ADD_SOURCE: &str = "int add(int a, int b) {\n    return a + b;\n}\n";

pub const ADD_TEST: &str = "```cpp
#include <gtest/gtest.h>
#include \"src/math.h\"

TEST(AddTest, PositiveNumbers) {
    EXPECT_EQ(add(2, 3), 5);
}
```";

pub const ADD_EDGE_TEST: &str = "```cpp
#include <gtest/gtest.h>
#include \"src/math.h\"

TEST(AddTest, NegativeNumbers) {
    EXPECT_EQ(add(-2, -3), -5);
}
```";

/// A project with `src/math.cpp` (+ header).
pub fn add_project() -> TempDir {
    let tmp = tempfile::tempdir().unwrap();
    write(tmp.path(), "src/math.cpp", ADD_SOURCE);
    write(tmp.path(), "src/math.h", "int add(int a, int b);\n");
    tmp
}

pub fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

pub fn gtest_config() -> TestGenConfig {
    TestGenConfig {
        test_framework: TestFramework::Gtest,
        max_tests_per_function: 2,
        use_coverage: false,
        gateway_backoff_ms: 1,
        max_concurrent_units: 2,
        ..TestGenConfig::default()
    }
}

/// Every file under `root`, relative path -> bytes.
pub fn snapshot(root: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    let mut out: Vec<(PathBuf, Vec<u8>)> = walkdir::WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            (
                e.path().strip_prefix(root).unwrap().to_path_buf(),
                fs::read(e.path()).unwrap(),
            )
        })
        .collect();
    out.sort();
    out
}

/* ---------- gateway ---------- */

type Reply = Box<dyn Fn(&LlmPrompt, usize) -> Result<String, GatewayError> + Send + Sync>;

/// Answers with a closure of (prompt, call index) and records every prompt.
pub struct FakeGateway {
    reply: Reply,
    prompts: Mutex<Vec<String>>,
}

impl FakeGateway {
    pub fn new(
        reply: impl Fn(&LlmPrompt, usize) -> Result<String, GatewayError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            reply: Box::new(reply),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn always(text: &'static str) -> Self {
        Self::new(move |_, _| Ok(text.to_string()))
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl ModelGateway for FakeGateway {
    fn complete(&self, prompt: &LlmPrompt) -> Result<String, GatewayError> {
        let index = {
            let mut p = self.prompts.lock().unwrap();
            p.push(prompt.text());
            p.len() - 1
        };
        (self.reply)(prompt, index)
    }
}

/* ---------- toolchain ---------- */

pub struct FakeToolchain {
    pub exit_code: i32,
    pub calls: AtomicUsize,
}

impl FakeToolchain {
    pub fn passing() -> Self {
        Self {
            exit_code: 0,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ToolchainRunner for FakeToolchain {
    fn compile(&self, _req: &CompileRequest) -> io::Result<ToolOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ToolOutput {
            exit_code: self.exit_code,
            stdout: String::new(),
            stderr: if self.exit_code == 0 {
                String::new()
            } else {
                "error: use of undeclared identifier".into()
            },
        })
    }
}

/* ---------- coverage ---------- */

/// Reports the next percentage from `script` per call, repeating the last.
pub struct FakeCoverage {
    script: Vec<f64>,
    pub calls: AtomicUsize,
}

impl FakeCoverage {
    pub fn new(script: Vec<f64>) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CoverageRunner for FakeCoverage {
    fn measure(
        &self,
        _project_root: &Path,
        units: &[&SourceUnit],
        _test_files: &[PathBuf],
    ) -> Result<Vec<CoverageResult>, CoverageError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let percent = self.script[n.min(self.script.len() - 1)];
        let covered = percent as usize;
        let uncovered: Vec<usize> = (covered + 1..=100).collect();

        Ok(units
            .iter()
            .map(|u| CoverageResult::from_lines(u.path.clone(), 100, covered, uncovered.clone()))
            .collect())
    }
}
