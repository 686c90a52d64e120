//! detectors/language.rs
//!
//! Language detection from file extensions.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::TestFramework;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    C,
    Cpp,
    Rust,
    Python,
    Unknown,
}

/* ============================================================
   Public API
   ============================================================ */

impl Language {
    pub fn from_path(path: &Path) -> Language {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("c") => Language::C,
            Some("cc" | "cpp" | "cxx" | "c++" | "h" | "hh" | "hpp" | "hxx") => Language::Cpp,
            Some("rs") => Language::Rust,
            Some("py") => Language::Python,
            _ => Language::Unknown,
        }
    }

    /// Uses braces and the C preprocessor.
    pub fn is_c_family(self) -> bool {
        matches!(self, Language::C | Language::Cpp)
    }

    /// Info strings accepted on a fenced code block, best match first.
    pub fn fence_tags(self) -> &'static [&'static str] {
        match self {
            Language::C => &["c", "cpp", "c++"],
            Language::Cpp => &["cpp", "c++", "cc", "cxx"],
            Language::Rust => &["rust", "rs"],
            Language::Python => &["python", "py", "python3"],
            Language::Unknown => &[],
        }
    }

    pub fn default_framework(self) -> TestFramework {
        match self {
            Language::Rust => TestFramework::Cargo,
            Language::Python => TestFramework::Pytest,
            _ => TestFramework::Gtest,
        }
    }
}

/// Test files for the gtest framework are always C++, even for C sources.
pub fn test_language(framework: TestFramework) -> Language {
    match framework {
        TestFramework::Gtest => Language::Cpp,
        TestFramework::Pytest => Language::Python,
        TestFramework::Cargo => Language::Rust,
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Language::C => "c",
            Language::Cpp => "c++",
            Language::Rust => "rust",
            Language::Python => "python",
            Language::Unknown => "unknown",
        };
        f.write_str(s)
    }
}
