//! config.rs
//!
//! Run configuration. Loaded once at startup and passed by reference into
//! every component; nothing reads it from ambient state.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestFramework {
    Gtest,
    Pytest,
    Cargo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverageFormat {
    Html,
    Xml,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// OpenAI-compatible chat completions (GitHub Models, Azure, local servers).
    Chat,
    /// OpenAI responses API.
    OpenAI,
    Anthropic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TestGenConfig {
    /* llm */
    pub llm_provider: Provider,
    pub llm_model: String,
    pub llm_base_url: Option<String>,
    pub llm_api_key_env: String,
    pub llm_temperature: f32,
    pub llm_top_p: f32,
    pub llm_max_retries: u32,
    pub gateway_retries: u32,
    pub gateway_backoff_ms: u64,
    pub request_timeout_secs: u64,

    /* generation rules */
    pub test_framework: TestFramework,
    pub target_coverage: f64,
    pub include_edge_cases: bool,
    pub include_performance_tests: bool,
    pub max_tests_per_function: u32,

    /* files */
    pub excluded_dirs: Vec<String>,
    pub supported_extensions: Vec<String>,
    pub output_test_dir: String,
    pub output_refactored_dir: String,
    pub refactor_sources: bool,
    pub skip_unchanged: bool,

    /* validation */
    pub validate_syntax: bool,
    pub validate_compilation: bool,
    pub auto_fix_issues: bool,
    pub compile_command: Option<Vec<String>>,
    pub include_dirs: Vec<String>,

    /* coverage */
    pub use_coverage: bool,
    pub coverage_format: CoverageFormat,
    pub coverage_threshold: f64,
    pub coverage_passes: u32,

    /* scheduling */
    pub max_concurrent_units: usize,
    pub max_concurrent_requests: usize,
    pub max_concurrent_compiles: usize,
}

impl Default for TestGenConfig {
    fn default() -> Self {
        Self {
            llm_provider: Provider::Chat,
            llm_model: "xai/grok-3".into(),
            llm_base_url: None,
            llm_api_key_env: "GITHUB_TOKEN".into(),
            llm_temperature: 0.7,
            llm_top_p: 0.95,
            llm_max_retries: 3,
            gateway_retries: 3,
            gateway_backoff_ms: 350,
            request_timeout_secs: 60,

            test_framework: TestFramework::Gtest,
            target_coverage: 80.0,
            include_edge_cases: true,
            include_performance_tests: false,
            max_tests_per_function: 5,

            excluded_dirs: ["tests", "refactored", ".git", "build"]
                .map(String::from)
                .to_vec(),
            supported_extensions: [".cpp", ".cc", ".c"].map(String::from).to_vec(),
            output_test_dir: "tests".into(),
            output_refactored_dir: "refactored".into(),
            refactor_sources: false,
            skip_unchanged: true,

            validate_syntax: true,
            validate_compilation: true,
            auto_fix_issues: true,
            compile_command: None,
            include_dirs: Vec::new(),

            use_coverage: true,
            coverage_format: CoverageFormat::Html,
            coverage_threshold: 75.0,
            coverage_passes: 1,

            max_concurrent_units: 4,
            max_concurrent_requests: 2,
            max_concurrent_compiles: 1,
        }
    }
}

impl TestGenConfig {
    /// Load from YAML, or TOML when the file ends in `.toml`, then validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let cfg = if path.extension().and_then(|e| e.to_str()) == Some("toml") {
            toml::from_str::<Self>(&raw).map_err(|source| ConfigError::Toml {
                path: path.to_path_buf(),
                source,
            })?
        } else if raw.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str::<Self>(&raw).map_err(|source| ConfigError::Yaml {
                path: path.to_path_buf(),
                source,
            })?
        };

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        let text = if path.extension().and_then(|e| e.to_str()) == Some("toml") {
            toml::to_string_pretty(self)
                .map_err(|e| write_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?
        } else {
            serde_yaml::to_string(self)
                .map_err(|e| write_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?
        };

        fs::write(path, text).map_err(write_err)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &'static str, reason: &str| {
            Err(ConfigError::Invalid {
                key,
                reason: reason.to_string(),
            })
        };

        if self.llm_model.trim().is_empty() {
            return invalid("llm_model", "must not be empty");
        }
        if self.llm_max_retries == 0 {
            return invalid("llm_max_retries", "must be at least 1");
        }
        if self.gateway_retries == 0 {
            return invalid("gateway_retries", "must be at least 1");
        }
        if !(0.0..=2.0).contains(&self.llm_temperature) {
            return invalid("llm_temperature", "must be within 0.0..=2.0");
        }
        if !(0.0..=1.0).contains(&self.llm_top_p) {
            return invalid("llm_top_p", "must be within 0.0..=1.0");
        }
        if self.max_tests_per_function == 0 {
            return invalid("max_tests_per_function", "must be at least 1");
        }
        for (key, value) in [
            ("target_coverage", self.target_coverage),
            ("coverage_threshold", self.coverage_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return invalid(key, "must be a percentage within 0..=100");
            }
        }
        if self.supported_extensions.is_empty() {
            return invalid("supported_extensions", "must list at least one extension");
        }
        if self.output_test_dir.trim().is_empty() {
            return invalid("output_test_dir", "must not be empty");
        }
        if self.max_concurrent_units == 0
            || self.max_concurrent_requests == 0
            || self.max_concurrent_compiles == 0
        {
            return invalid("max_concurrent_*", "concurrency limits must be at least 1");
        }
        if let Some(cmd) = &self.compile_command {
            if cmd.is_empty() {
                return invalid("compile_command", "must name a program");
            }
        }

        Ok(())
    }

    /// Extensions normalised to a leading dot, lowercase.
    pub fn extensions(&self) -> Vec<String> {
        self.supported_extensions
            .iter()
            .map(|e| {
                let e = e.trim().to_ascii_lowercase();
                if e.starts_with('.') {
                    e
                } else {
                    format!(".{e}")
                }
            })
            .collect()
    }

    pub fn test_dir(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.output_test_dir)
    }

    pub fn refactored_dir(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.output_refactored_dir)
    }
}

/// Write the default configuration next to the current directory.
pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
    TestGenConfig::default().save(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "llm_max_retries: 5\ntest_framework: pytest\n").unwrap();

        let cfg = TestGenConfig::load(&path).unwrap();
        assert_eq!(cfg.llm_max_retries, 5);
        assert_eq!(cfg.test_framework, TestFramework::Pytest);
        assert_eq!(cfg.coverage_threshold, 75.0);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "no_such_option: true\n").unwrap();

        assert!(matches!(
            TestGenConfig::load(&path),
            Err(ConfigError::Yaml { .. })
        ));
    }

    #[test]
    fn zero_retries_is_invalid() {
        let cfg = TestGenConfig {
            llm_max_retries: 0,
            ..TestGenConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { key: "llm_max_retries", .. })
        ));
    }

    #[test]
    fn toml_round_trips_through_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let cfg = TestGenConfig {
            coverage_format: CoverageFormat::Json,
            ..TestGenConfig::default()
        };
        cfg.save(&path).unwrap();

        assert_eq!(TestGenConfig::load(&path).unwrap(), cfg);
    }

    #[test]
    fn extensions_are_normalised() {
        let cfg = TestGenConfig {
            supported_extensions: vec!["CPP".into(), ".rs".into()],
            ..TestGenConfig::default()
        };
        assert_eq!(cfg.extensions(), vec![".cpp", ".rs"]);
    }
}
