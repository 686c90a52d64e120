//! llm/prompt.rs
//!
//! Prompt construction. Pure: identical inputs give identical prompts.

use crate::config::{TestFramework, TestGenConfig};
use crate::detectors::language::{test_language, Language};
use crate::state::{FunctionSignature, Verdict};

const DIAGNOSTIC_LIMIT: usize = 6_000;
const UNIT_CONTEXT_LIMIT: usize = 12_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmPrompt {
    pub system: String,
    pub user: String,
}

impl LlmPrompt {
    /// Flattened form stored on each attempt.
    pub fn text(&self) -> String {
        format!(
            "=== SYSTEM PROMPT ===\n{}\n\n=== USER PROMPT ===\n{}",
            self.system, self.user
        )
    }
}

/// Generation rules taken from the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSet {
    pub framework: TestFramework,
    pub include_edge_cases: bool,
    pub include_performance_tests: bool,
    pub max_tests_per_function: u32,
    pub target_coverage: f64,
}

impl RuleSet {
    pub fn from_config(cfg: &TestGenConfig) -> Self {
        Self {
            framework: cfg.test_framework,
            include_edge_cases: cfg.include_edge_cases,
            include_performance_tests: cfg.include_performance_tests,
            max_tests_per_function: cfg.max_tests_per_function,
            target_coverage: cfg.target_coverage,
        }
    }
}

/// What the unit under test looks like from the generated test's side.
#[derive(Debug, Clone)]
pub struct UnitContext<'a> {
    pub path: &'a str,
    pub language: Language,
    pub source: &'a str,
    /// How the test reaches the code under test, e.g. `#include "src/math.h"`.
    pub import_hint: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PromptHint {
    None,
    /// Follow-up after a failed attempt.
    Corrective {
        attempt: u32,
        candidate: String,
        verdict: Verdict,
        diagnostic: String,
        /// Ask for a rewrite instead of a minimal fix.
        escalate: bool,
    },
    /// Coverage came in under the threshold.
    Coverage {
        measured: f64,
        threshold: f64,
        uncovered_lines: Vec<usize>,
    },
}

pub fn build_prompt(
    unit: &UnitContext,
    sig: &FunctionSignature,
    rules: &RuleSet,
    hint: &PromptHint,
) -> LlmPrompt {
    LlmPrompt {
        system: system_prompt(rules.framework),
        user: user_prompt(unit, sig, rules, hint),
    }
}

/* ============================================================
   System prompt (stable, reused)
   ============================================================ */

fn system_prompt(framework: TestFramework) -> String {
    let lang = test_language(framework);
    format!(
        r#"
You are an expert software engineer writing {} unit tests with {}.

Rules:
- Test only the behavior visible through the given function's contract
- Do NOT modify or re-implement production code
- Tests must be deterministic, isolated and readable
- Every test name must be unique and describe the scenario
- Do not repeat tests or add unused includes/imports
- Reply with exactly one fenced ```{} code block containing the complete test file
"#,
        lang,
        framework_name(framework),
        lang.fence_tags().first().copied().unwrap_or("")
    )
    .trim()
    .to_string()
}

/* ============================================================
   User prompt
   ============================================================ */

fn user_prompt(
    unit: &UnitContext,
    sig: &FunctionSignature,
    rules: &RuleSet,
    hint: &PromptHint,
) -> String {
    let mut out = String::new();

    /* ---------- CONTEXT ---------- */
    out.push_str("CONTEXT\n");
    out.push_str(&format!("File: {}\n", unit.path));
    out.push_str(&format!("Language: {}\n", unit.language));
    out.push_str(&format!("Test Framework: {}\n", framework_name(rules.framework)));

    if sig.whole_unit {
        out.push_str("Target: every public function in the file\n");
    } else {
        out.push_str(&format!("Target: function `{}`\n", sig.name));
        out.push_str(&format!("Signature: {}\n", sig.display()));
        if !sig.params.is_empty() {
            out.push_str(&format!("Parameter types: {}\n", sig.params.join(", ")));
        }
        if let Some(ret) = &sig.return_type {
            out.push_str(&format!("Return type: {}\n", ret));
        }
        if !sig.qualifiers.is_empty() {
            out.push_str(&format!("Qualifiers: {}\n", sig.qualifiers.join(" ")));
        }
    }
    out.push_str(&format!("Access: {}\n\n", unit.import_hint));

    /* ---------- CODE ---------- */
    let fence = unit.language.fence_tags().first().copied().unwrap_or("");
    if sig.whole_unit {
        out.push_str("CODE UNDER TEST\n");
        push_fenced(&mut out, fence, &truncate(unit.source, UNIT_CONTEXT_LIMIT));
    } else {
        out.push_str("FUNCTION UNDER TEST\n");
        push_fenced(&mut out, fence, &sig.source);

        out.push_str("SURROUNDING FILE (context only)\n");
        push_fenced(&mut out, fence, &truncate(unit.source, UNIT_CONTEXT_LIMIT));
    }

    /* ---------- RULES ---------- */
    out.push_str("RULES\n");
    out.push_str(&format!(
        "- Write at most {} test case(s) for this target\n",
        rules.max_tests_per_function
    ));
    out.push_str(&naming_rule(rules.framework, sig));
    if rules.include_edge_cases {
        out.push_str("- Include edge cases: boundary values, empty inputs, invalid inputs\n");
    } else {
        out.push_str("- Focus on the main behavior; skip exotic edge cases\n");
    }
    if rules.include_performance_tests {
        out.push_str("- Add one lightweight performance sanity test with a generous bound\n");
    } else {
        out.push_str("- Do NOT write performance or timing tests\n");
    }
    out.push_str(&format!(
        "- Aim for at least {:.0}% line coverage of the target\n",
        rules.target_coverage
    ));
    out.push_str(&framework_rules(rules.framework));

    /* ---------- HINT ---------- */
    match hint {
        PromptHint::None => {}
        PromptHint::Corrective {
            attempt,
            candidate,
            verdict,
            diagnostic,
            escalate,
        } => {
            out.push_str(&format!(
                "\nPREVIOUS ATTEMPT {} FAILED ({})\n",
                attempt, verdict
            ));
            out.push_str("Previous test file:\n");
            push_fenced(&mut out, test_fence(rules.framework), candidate);
            out.push_str("Diagnostics:\n");
            push_fenced(&mut out, "", &truncate(diagnostic, DIAGNOSTIC_LIMIT));
            if *escalate {
                out.push_str(
                    "Earlier fixes did not work. Discard the previous file and write a new, \
                     simpler one: fewer tests, only APIs you can see in the code above.\n",
                );
            } else {
                out.push_str("Fix every reported problem. Keep the tests that were already correct.\n");
            }
        }
        PromptHint::Coverage {
            measured,
            threshold,
            uncovered_lines,
        } => {
            out.push_str(&format!(
                "\nCOVERAGE\nExisting tests reach {:.1}% line coverage, below the {:.1}% threshold.\n",
                measured, threshold
            ));
            if !uncovered_lines.is_empty() {
                let lines: Vec<String> = uncovered_lines.iter().take(50).map(|l| l.to_string()).collect();
                out.push_str(&format!("Uncovered lines: {}\n", lines.join(", ")));
            }
            out.push_str(
                "Write additional edge-case tests that exercise the uncovered branches. \
                 Use new test names; do not repeat existing tests.\n",
            );
        }
    }

    /* ---------- OUTPUT ---------- */
    out.push_str("\nOUTPUT REQUIREMENTS\n");
    out.push_str(&format!(
        "- One ```{} block with the complete, compilable test file\n- No explanations outside the block\n",
        test_fence(rules.framework)
    ));

    out
}

/* ============================================================
   Refactor prompts
   ============================================================ */

pub fn build_refactor_prompt(unit: &UnitContext, previous: Option<(&str, &str)>) -> LlmPrompt {
    let fence = unit.language.fence_tags().first().copied().unwrap_or("");

    let system = format!(
        "You are an expert {} engineer. Refactor code for clarity and maintainability \
         without changing its logic or observable behavior. Reply with exactly one fenced \
         ```{} block containing the complete file.",
        unit.language, fence
    );

    let mut user = String::new();
    user.push_str(&format!("File: {}\n\n", unit.path));
    user.push_str("Refactor this file. Keep every public signature unchanged. ");
    user.push_str("Do not modify global structure unless absolutely necessary.\n\n");
    push_fenced(&mut user, fence, unit.source);

    if let Some((candidate, diagnostic)) = previous {
        user.push_str("\nYour previous refactoring did not parse:\n");
        push_fenced(&mut user, fence, candidate);
        user.push_str("Diagnostics:\n");
        push_fenced(&mut user, "", &truncate(diagnostic, DIAGNOSTIC_LIMIT));
    }

    LlmPrompt { system, user }
}

/* ============================================================
   Helpers
   ============================================================ */

/// How a generated test reaches the unit under test.
pub fn import_hint(unit_path: &str, framework: TestFramework, header: Option<&str>) -> String {
    match framework {
        TestFramework::Gtest => format!(
            "#include \"{}\" (the project root is on the include path)",
            header.unwrap_or(unit_path)
        ),
        TestFramework::Pytest => {
            let module = unit_path
                .trim_end_matches(".py")
                .replace('/', ".");
            format!("from {} import ... (the project root is on PYTHONPATH)", module)
        }
        TestFramework::Cargo => {
            "use the crate's public API (`use <crate_name>::...`) from an integration test".into()
        }
    }
}

pub fn framework_name(framework: TestFramework) -> &'static str {
    match framework {
        TestFramework::Gtest => "GoogleTest",
        TestFramework::Pytest => "pytest",
        TestFramework::Cargo => "the built-in Rust test harness",
    }
}

fn test_fence(framework: TestFramework) -> &'static str {
    test_language(framework).fence_tags().first().copied().unwrap_or("")
}

fn naming_rule(framework: TestFramework, sig: &FunctionSignature) -> String {
    if sig.whole_unit {
        return "- Name tests after the function they exercise\n".into();
    }
    let base = sig.name.rsplit([':', '.']).next().unwrap_or(&sig.name);
    match framework {
        TestFramework::Gtest => format!("- Use `{}Test` as the test suite name\n", camel_case(base)),
        TestFramework::Pytest => format!("- Name every test `test_{}_<scenario>`\n", base),
        TestFramework::Cargo => format!("- Name every test `{}_<scenario>`\n", base),
    }
}

fn framework_rules(framework: TestFramework) -> String {
    match framework {
        TestFramework::Gtest => "- Start with #include <gtest/gtest.h>\n\
                                 - Use TEST/TEST_F macros only; do not define main()\n"
            .into(),
        TestFramework::Pytest => "- Plain pytest functions; use pytest.raises for errors\n\
                                  - No unittest.TestCase classes\n"
            .into(),
        TestFramework::Cargo => "- Top-level #[test] functions, no surrounding mod\n\
                                 - Use assert!/assert_eq!, no external test crates\n"
            .into(),
    }
}

fn camel_case(name: &str) -> String {
    name.split('_')
        .filter(|p| !p.is_empty())
        .map(|p| {
            let mut c = p.chars();
            match c.next() {
                Some(first) => first.to_uppercase().collect::<String>() + c.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

fn push_fenced(out: &mut String, tag: &str, body: &str) {
    out.push_str("```");
    out.push_str(tag);
    out.push('\n');
    out.push_str(body.trim_end());
    out.push_str("\n```\n\n");
}

fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... [truncated {} bytes]", &s[..end], s.len() - end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_sig() -> FunctionSignature {
        FunctionSignature {
            name: "add".into(),
            params: vec!["int".into(), "int".into()],
            return_type: Some("int".into()),
            qualifiers: vec![],
            signature: "int add(int a, int b)".into(),
            source: "int add(int a, int b) { return a + b; }".into(),
            whole_unit: false,
        }
    }

    fn unit() -> UnitContext<'static> {
        UnitContext {
            path: "src/math.cpp",
            language: Language::Cpp,
            source: "int add(int a, int b) { return a + b; }",
            import_hint: import_hint("src/math.cpp", TestFramework::Gtest, Some("src/math.h")),
        }
    }

    fn rules() -> RuleSet {
        RuleSet::from_config(&TestGenConfig {
            max_tests_per_function: 2,
            ..TestGenConfig::default()
        })
    }

    #[test]
    fn prompt_is_deterministic() {
        let a = build_prompt(&unit(), &add_sig(), &rules(), &PromptHint::None);
        let b = build_prompt(&unit(), &add_sig(), &rules(), &PromptHint::None);
        assert_eq!(a, b);
    }

    #[test]
    fn prompt_carries_rules_and_signature() {
        let p = build_prompt(&unit(), &add_sig(), &rules(), &PromptHint::None);
        assert!(p.user.contains("at most 2 test case(s)"));
        assert!(p.user.contains("Signature: int add(int a, int b)"));
        assert!(p.user.contains("`AddTest`"));
        assert!(p.user.contains("#include \"src/math.h\""));
        assert!(p.user.contains("Include edge cases"));
        assert!(p.system.contains("GoogleTest"));
    }

    #[test]
    fn corrective_hint_embeds_diagnostic_and_candidate() {
        let hint = PromptHint::Corrective {
            attempt: 1,
            candidate: "TEST(AddTest, Broken) {".into(),
            verdict: Verdict::SyntaxFail,
            diagnostic: "unbalanced braces at line 1".into(),
            escalate: false,
        };
        let p = build_prompt(&unit(), &add_sig(), &rules(), &hint);
        assert!(p.user.contains("PREVIOUS ATTEMPT 1 FAILED (SYNTAX_FAIL)"));
        assert!(p.user.contains("unbalanced braces at line 1"));
        assert!(p.user.contains("TEST(AddTest, Broken) {"));
        assert!(p.user.contains("Fix every reported problem"));
    }

    #[test]
    fn coverage_hint_requests_edge_cases() {
        let hint = PromptHint::Coverage {
            measured: 40.0,
            threshold: 75.0,
            uncovered_lines: vec![3, 7],
        };
        let p = build_prompt(&unit(), &add_sig(), &rules(), &hint);
        assert!(p.user.contains("40.0% line coverage, below the 75.0% threshold"));
        assert!(p.user.contains("Uncovered lines: 3, 7"));
        assert!(p.user.contains("edge-case tests"));
    }

    #[test]
    fn long_diagnostics_are_truncated_on_char_boundary() {
        let s = "é".repeat(DIAGNOSTIC_LIMIT);
        let t = truncate(&s, DIAGNOSTIC_LIMIT);
        assert!(t.contains("[truncated"));
    }
}
