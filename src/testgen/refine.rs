//! testgen/refine.rs
//!
//! Merges passing candidates (and the artifact already on disk) into one
//! test file per unit.
//!
//! A file is split into includes, support items, test cases and `main`.
//! First write wins for a test name, and for a named helper (function,
//! class, fixture); a later item with the same name and a different body is
//! a conflict. Rendering is a fixpoint:
//! `render(parse(render(x))) == render(x)`.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use tree_sitter::Node;

use crate::config::TestFramework;
use crate::detectors::ast::{mask_code, parse_source};
use crate::detectors::language::{test_language, Language};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub name: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestFile {
    pub includes: Vec<String>,
    pub support: Vec<String>,
    /// Name of each support item, when it defines one.
    support_names: Vec<Option<String>>,
    pub cases: Vec<TestCase>,
    pub main: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Two items shared a name but not a body. `case` names the test case or
/// helper.
pub struct Conflict {
    pub case: String,
    pub kept_from: String,
    pub dropped_from: String,
}

impl TestFile {
    pub fn parse(content: &str, framework: TestFramework) -> Self {
        let mut file = TestFile::default();
        for item in split_items(content, framework) {
            file.push(item);
        }
        file
    }

    pub fn render(&self) -> String {
        let mut out = String::new();

        if !self.includes.is_empty() {
            out.push_str(&self.includes.join("\n"));
            out.push_str("\n\n");
        }

        let body: Vec<&str> = self
            .support
            .iter()
            .map(String::as_str)
            .chain(self.cases.iter().map(|c| c.text.as_str()))
            .chain(self.main.as_deref())
            .collect();
        out.push_str(&body.join("\n\n"));

        let mut out = out.trim_end().to_string();
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }

    pub fn case_names(&self) -> Vec<String> {
        self.cases.iter().map(|c| c.name.clone()).collect()
    }

    fn support_named(&self, name: Option<&str>) -> Option<&str> {
        let name = name?;
        self.support_names
            .iter()
            .position(|n| n.as_deref() == Some(name))
            .map(|i| self.support[i].as_str())
    }

    fn push(&mut self, item: Item) {
        match item {
            Item::Include(text) => {
                if !self.includes.contains(&text) {
                    self.includes.push(text);
                }
            }
            Item::Support { name, text } => {
                if self.support_named(name.as_deref()).is_some() || self.support.contains(&text) {
                    return;
                }
                self.support.push(text);
                self.support_names.push(name);
            }
            Item::Main(text) => {
                if self.main.is_none() {
                    self.main = Some(text);
                }
            }
            Item::Case(case) => {
                if !self.cases.iter().any(|c| c.name == case.name) {
                    self.cases.push(case);
                }
            }
        }
    }
}

/* ============================================================
   Merge
   ============================================================ */

pub struct Refiner {
    framework: TestFramework,
    merged: TestFile,
    /// case name -> (attempt, origin label)
    origins: BTreeMap<String, (u32, String)>,
    /// helper name -> origin label
    support_origins: BTreeMap<String, String>,
    conflicts: Vec<Conflict>,
}

impl Refiner {
    pub fn new(framework: TestFramework) -> Self {
        Self {
            framework,
            merged: TestFile::default(),
            origins: BTreeMap::new(),
            support_origins: BTreeMap::new(),
            conflicts: Vec::new(),
        }
    }

    /// Seeds the merge with the artifact already on disk. `prior` carries
    /// the attempt numbers recorded for its cases; unknown cases get 0.
    pub fn seed(&mut self, existing: &str, prior: &BTreeMap<String, u32>) {
        for item in split_items(existing, self.framework) {
            match &item {
                Item::Case(case) => {
                    let attempt = prior.get(&case.name).copied().unwrap_or(0);
                    self.origins
                        .entry(case.name.clone())
                        .or_insert((attempt, "existing".to_string()));
                }
                Item::Support { name: Some(name), .. } => {
                    self.support_origins
                        .entry(name.clone())
                        .or_insert_with(|| "existing".to_string());
                }
                _ => {}
            }
            self.merged.push(item);
        }
    }

    pub fn merge(&mut self, candidate: &str, attempt: u32, origin: &str) {
        for item in split_items(candidate, self.framework) {
            match &item {
                Item::Case(case) => {
                    if let Some(kept) = self.merged.cases.iter().find(|c| c.name == case.name) {
                        if kept.text != case.text {
                            let kept_from = self
                                .origins
                                .get(&case.name)
                                .map(|(_, label)| label.clone())
                                .unwrap_or_default();
                            self.conflict(&case.name, kept_from, origin);
                        }
                        continue;
                    }
                    self.origins
                        .insert(case.name.clone(), (attempt, origin.to_string()));
                }
                Item::Support { name: Some(name), text } => {
                    if let Some(kept) = self.merged.support_named(Some(name.as_str())) {
                        if kept != text.as_str() {
                            let kept_from = self.support_origins.get(name).cloned().unwrap_or_default();
                            self.conflict(name, kept_from, origin);
                        }
                        continue;
                    }
                    self.support_origins.insert(name.clone(), origin.to_string());
                }
                _ => {}
            }
            self.merged.push(item);
        }
    }

    /// Removes the named cases, e.g. tests of functions that no longer exist.
    pub fn drop_cases(&mut self, names: &[String]) {
        self.merged.cases.retain(|c| !names.contains(&c.name));
        for name in names {
            self.origins.remove(name);
        }
    }

    fn conflict(&mut self, name: &str, kept_from: String, dropped_from: &str) {
        tracing::warn!(item = name, kept = %kept_from, dropped = dropped_from, "name conflict");
        self.conflicts.push(Conflict {
            case: name.to_string(),
            kept_from,
            dropped_from: dropped_from.to_string(),
        });
    }

    pub fn file(&self) -> &TestFile {
        &self.merged
    }

    pub fn render(&self) -> String {
        self.merged.render()
    }

    pub fn conflicts(&self) -> &[Conflict] {
        &self.conflicts
    }

    /// test case name -> attempt number that produced it.
    pub fn case_attempts(&self) -> BTreeMap<String, u32> {
        self.merged
            .cases
            .iter()
            .map(|c| {
                let attempt = self.origins.get(&c.name).map(|(a, _)| *a).unwrap_or(0);
                (c.name.clone(), attempt)
            })
            .collect()
    }
}

/* ============================================================
   Splitting
   ============================================================ */

#[derive(Debug, Clone, PartialEq, Eq)]
enum Item {
    Include(String),
    Support { name: Option<String>, text: String },
    Case(TestCase),
    Main(String),
}

fn split_items(content: &str, framework: TestFramework) -> Vec<Item> {
    match test_language(framework) {
        Language::Python => split_python(content),
        Language::Rust => split_rust(content),
        _ => split_c_family(content),
    }
}

fn gtest_case_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^TEST(?:_F|_P)?\s*\(\s*(\w+)\s*,\s*(\w+)\s*\)").expect("static regex")
    })
}

fn c_main_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^int\s+main\s*\(").expect("static regex"))
}

/// Top-level chunks end at `;` or at the `}` that returns to depth zero.
/// Preprocessor lines are their own chunk. Comments travel with the
/// chunk that follows them, except before directives.
fn c_type_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:template\s*<[^>]*>\s*)?(?:typedef\s+)?(?:class|struct|union|enum)(?:\s+class)?\s+(\w+)\s*(?::[^{;]*)?\{")
            .expect("static regex")
    })
}

fn c_function_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:[^{;=(]*?[\s*&])?((?:\w+::)*~?\w+)\s*\([^{;]*\)[^{;]*\{")
            .expect("static regex")
    })
}

/// Name of a helper type or function defined by a masked top-level chunk.
fn c_definition_name(code: &str) -> Option<String> {
    c_type_regex()
        .captures(code)
        .or_else(|| c_function_regex().captures(code))
        .map(|c| c[1].to_string())
}

fn split_c_family(content: &str) -> Vec<Item> {
    let masked = mask_code(content, Language::Cpp);
    let bytes = masked.as_bytes();
    let mut items = Vec::new();
    let mut start = 0;
    let mut depth = 0usize;
    let mut i = 0;

    let push_chunk = |items: &mut Vec<Item>, from: usize, to: usize| {
        let code = masked[from..to].trim();
        if code.is_empty() {
            return;
        }
        let text = content[from..to].trim().to_string();
        if let Some(c) = gtest_case_regex().captures(code) {
            items.push(Item::Case(TestCase {
                name: format!("{}.{}", &c[1], &c[2]),
                text,
            }));
        } else if c_main_regex().is_match(code) {
            items.push(Item::Main(text));
        } else {
            items.push(Item::Support {
                name: c_definition_name(code),
                text,
            });
        }
    };

    while i < bytes.len() {
        let b = bytes[i];

        if depth == 0 && b == b'#' && at_line_start(bytes, i) {
            if !masked[start..i].trim().is_empty() {
                push_chunk(&mut items, start, i);
            }
            let end = directive_end(bytes, i);
            let directive = content[i..end].trim();
            if !directive.is_empty() {
                items.push(Item::Include(directive.to_string()));
            }
            i = end;
            start = end;
            continue;
        }

        match b {
            b'{' | b'(' | b'[' => depth += 1,
            b')' | b']' => depth = depth.saturating_sub(1),
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let mut end = i + 1;
                    let mut j = end;
                    while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                        j += 1;
                    }
                    if bytes.get(j) == Some(&b';') {
                        end = j + 1;
                    }
                    push_chunk(&mut items, start, end);
                    start = end;
                    i = end;
                    continue;
                }
            }
            b';' if depth == 0 => {
                push_chunk(&mut items, start, i + 1);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }

    if start < bytes.len() {
        push_chunk(&mut items, start, bytes.len());
    }

    items
}

fn at_line_start(bytes: &[u8], i: usize) -> bool {
    bytes[..i]
        .iter()
        .rev()
        .take_while(|b| **b != b'\n')
        .all(|b| b.is_ascii_whitespace())
}

fn directive_end(bytes: &[u8], from: usize) -> usize {
    let mut i = from;
    while i < bytes.len() {
        if bytes[i] == b'\n' && (i == 0 || bytes[i - 1] != b'\\') {
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn node_text<'a>(node: Node, source: &'a str) -> &'a str {
    &source[node.start_byte()..node.end_byte()]
}

fn field_name<'a>(node: Node, source: &'a str) -> &'a str {
    node.child_by_field_name("name")
        .map(|n| node_text(n, source))
        .unwrap_or("")
}

fn unparsed(content: &str) -> Vec<Item> {
    let text = content.trim();
    if text.is_empty() {
        Vec::new()
    } else {
        vec![Item::Support {
            name: None,
            text: text.to_string(),
        }]
    }
}

fn split_rust(content: &str) -> Vec<Item> {
    let Some(tree) = parse_source(Language::Rust, content) else {
        return unparsed(content);
    };
    let root = tree.root_node();
    let mut items = Vec::new();
    // start of the first attribute/comment waiting for its item
    let mut pending: Option<usize> = None;
    let mut is_test = false;

    for i in 0..root.named_child_count() {
        let Some(node) = root.named_child(i) else {
            continue;
        };

        match node.kind() {
            "line_comment" | "block_comment" => {
                pending.get_or_insert(node.start_byte());
            }
            "attribute_item" => {
                pending.get_or_insert(node.start_byte());
                if node_text(node, content).trim_end().ends_with("test]") {
                    is_test = true;
                }
            }
            "use_declaration" | "extern_crate_declaration" | "inner_attribute_item" => {
                items.push(Item::Include(node_text(node, content).trim().to_string()));
                pending = None;
                is_test = false;
            }
            kind => {
                let from = pending.take().unwrap_or(node.start_byte());
                let text = content[from..node.end_byte()].trim().to_string();
                let name = field_name(node, content);

                let item = if kind == "function_item" && is_test {
                    Item::Case(TestCase {
                        name: name.to_string(),
                        text,
                    })
                } else if kind == "function_item" && name == "main" {
                    Item::Main(text)
                } else {
                    Item::Support {
                        name: (!name.is_empty()).then(|| name.to_string()),
                        text,
                    }
                };
                items.push(item);
                is_test = false;
            }
        }
    }

    items
}

fn split_python(content: &str) -> Vec<Item> {
    let Some(tree) = parse_source(Language::Python, content) else {
        return unparsed(content);
    };
    let root = tree.root_node();
    let mut items = Vec::new();
    let mut pending: Option<usize> = None;

    for i in 0..root.named_child_count() {
        let Some(node) = root.named_child(i) else {
            continue;
        };

        match node.kind() {
            "comment" => {
                pending.get_or_insert(node.start_byte());
            }
            "import_statement" | "import_from_statement" | "future_import_statement" => {
                items.push(Item::Include(node_text(node, content).trim().to_string()));
                pending = None;
            }
            kind => {
                let from = pending.take().unwrap_or(node.start_byte());
                let text = content[from..node.end_byte()].trim().to_string();

                let definition = if kind == "decorated_definition" {
                    node.child_by_field_name("definition").unwrap_or(node)
                } else {
                    node
                };
                let name = field_name(definition, content);

                let is_case = match definition.kind() {
                    "function_definition" => name.starts_with("test"),
                    "class_definition" => name.starts_with("Test"),
                    _ => false,
                };

                let item = if is_case {
                    Item::Case(TestCase {
                        name: name.to_string(),
                        text,
                    })
                } else if kind == "if_statement" && text.contains("__name__") {
                    Item::Main(text)
                } else {
                    let named = matches!(definition.kind(), "function_definition" | "class_definition");
                    Item::Support {
                        name: (named && !name.is_empty()).then(|| name.to_string()),
                        text,
                    }
                };
                items.push(item);
            }
        }
    }

    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const GTEST_A: &str = r#"#include <gtest/gtest.h>
#include "src/math.h"

// helper
static int twice(int x) { return 2 * x; }

TEST(AddTest, T1) {
    EXPECT_EQ(add(1, 2), 3);
}

TEST(AddTest, Negative) {
    EXPECT_EQ(add(-1, -2), -3);
}

int main(int argc, char **argv) {
    ::testing::InitGoogleTest(&argc, argv);
    return RUN_ALL_TESTS();
}
"#;

    const GTEST_B: &str = r#"#include <gtest/gtest.h>
#include <climits>

TEST(AddTest, T1) {
    EXPECT_EQ(add(2, 2), 4);
}

TEST(AddTest, Overflow) {
    EXPECT_EQ(add(INT_MAX, 0), INT_MAX);
}
"#;

    #[test]
    fn gtest_file_splits_into_sections() {
        let file = TestFile::parse(GTEST_A, TestFramework::Gtest);

        assert_eq!(
            file.includes,
            vec!["#include <gtest/gtest.h>", "#include \"src/math.h\""]
        );
        assert_eq!(file.support, vec!["// helper\nstatic int twice(int x) { return 2 * x; }"]);
        assert_eq!(file.case_names(), vec!["AddTest.T1", "AddTest.Negative"]);
        assert!(file.main.as_deref().unwrap_or("").starts_with("int main"));
    }

    #[test]
    fn duplicate_name_with_different_body_is_a_conflict() {
        let mut r = Refiner::new(TestFramework::Gtest);
        r.merge(GTEST_A, 1, "add attempt 1");
        r.merge(GTEST_B, 2, "sub attempt 2");

        let file = r.file();
        assert_eq!(
            file.case_names(),
            vec!["AddTest.T1", "AddTest.Negative", "AddTest.Overflow"]
        );
        assert!(file.cases[0].text.contains("add(1, 2)"));

        assert_eq!(
            r.conflicts(),
            &[Conflict {
                case: "AddTest.T1".into(),
                kept_from: "add attempt 1".into(),
                dropped_from: "sub attempt 2".into(),
            }]
        );
        assert_eq!(
            file.includes,
            vec![
                "#include <gtest/gtest.h>",
                "#include \"src/math.h\"",
                "#include <climits>"
            ]
        );
    }

    #[test]
    fn helper_redefinition_keeps_the_first_and_records_a_conflict() {
        let a = "#include <gtest/gtest.h>\n\nstatic int fixture() { return 1; }\n\nTEST(AddTest, One) {\n    EXPECT_EQ(add(fixture(), 0), 1);\n}\n";
        let b = "#include <gtest/gtest.h>\n\nstatic int fixture() { return 7; }\n\nTEST(SubTest, Seven) {\n    EXPECT_EQ(sub(fixture(), 0), 7);\n}\n";

        let mut r = Refiner::new(TestFramework::Gtest);
        r.merge(a, 1, "add attempt 1");
        r.merge(b, 1, "sub attempt 1");

        let rendered = r.render();
        assert_eq!(rendered.matches("static int fixture()").count(), 1);
        assert!(rendered.contains("return 1;"));
        assert!(!rendered.contains("return 7;"));
        assert_eq!(r.file().case_names(), vec!["AddTest.One", "SubTest.Seven"]);
        assert_eq!(
            r.conflicts(),
            &[Conflict {
                case: "fixture".into(),
                kept_from: "add attempt 1".into(),
                dropped_from: "sub attempt 1".into(),
            }]
        );
    }

    #[test]
    fn helper_names_cover_types_and_qualified_functions() {
        assert_eq!(c_definition_name("static int twice(int x) { return 2 * x; }").as_deref(), Some("twice"));
        assert_eq!(c_definition_name("struct Point { int x; int y; };").as_deref(), Some("Point"));
        assert_eq!(c_definition_name("Foo::~Foo() {}").as_deref(), Some("Foo::~Foo"));
        assert_eq!(c_definition_name("int* make(void) { return 0; }").as_deref(), Some("make"));
        assert_eq!(c_definition_name("static const int limit = 3;"), None);
        assert_eq!(c_definition_name("namespace { int n; }"), None);
    }

    #[test]
    fn python_helpers_with_one_name_conflict() {
        let a = "import pytest\n\n\n@pytest.fixture\ndef sample():\n    return [1, 2]\n\n\ndef test_len(sample):\n    assert len(sample) == 2\n";
        let b = "import pytest\n\n\n@pytest.fixture\ndef sample():\n    return [3]\n\n\ndef test_first(sample):\n    assert sample[0] == 3\n";

        let mut r = Refiner::new(TestFramework::Pytest);
        r.merge(a, 1, "a");
        r.merge(b, 1, "b");

        assert_eq!(r.render().matches("def sample()").count(), 1);
        assert_eq!(r.conflicts().len(), 1);
        assert_eq!(r.conflicts()[0].case, "sample");
    }

    #[test]
    fn dropped_cases_leave_the_rendered_file() {
        let mut r = Refiner::new(TestFramework::Gtest);
        r.seed(GTEST_A, &BTreeMap::new());
        r.drop_cases(&["AddTest.Negative".to_string()]);

        assert_eq!(r.file().case_names(), vec!["AddTest.T1"]);
        assert!(!r.case_attempts().contains_key("AddTest.Negative"));
        assert!(!r.render().contains("Negative"));
    }

    #[test]
    fn identical_duplicates_are_dropped_silently() {
        let mut r = Refiner::new(TestFramework::Gtest);
        r.merge(GTEST_B, 1, "a");
        r.merge(GTEST_B, 1, "b");

        assert!(r.conflicts().is_empty());
        assert_eq!(r.file().cases.len(), 2);
        assert_eq!(r.render(), TestFile::parse(GTEST_B, TestFramework::Gtest).render());
    }

    #[test]
    fn main_renders_last_and_rendering_is_a_fixpoint() {
        let mut r = Refiner::new(TestFramework::Gtest);
        r.merge(GTEST_A, 1, "a");
        r.merge(GTEST_B, 1, "b");

        let once = r.render();
        assert!(once.trim_end().ends_with('}'));
        assert!(once.rfind("int main").unwrap() > once.rfind("TEST(AddTest, Overflow)").unwrap());

        let twice = TestFile::parse(&once, TestFramework::Gtest).render();
        assert_eq!(once, twice);
    }

    #[test]
    fn seeded_cases_keep_their_recorded_attempts() {
        let mut prior = BTreeMap::new();
        prior.insert("AddTest.T1".to_string(), 2);

        let mut r = Refiner::new(TestFramework::Gtest);
        r.seed(GTEST_B, &prior);
        r.merge(GTEST_B, 1, "add attempt 1");

        let attempts = r.case_attempts();
        assert_eq!(attempts["AddTest.T1"], 2);
        assert_eq!(attempts["AddTest.Overflow"], 0);
        assert!(r.conflicts().is_empty());
    }

    #[test]
    fn pytest_cases_and_imports() {
        let a = "import pytest\nfrom geo import area\n\n\ndef test_area_unit():\n    assert area(1, 1) == 1\n";
        let b = "from geo import area\n\n# grouped\nclass TestArea:\n    def test_zero(self):\n        assert area(0, 3) == 0\n\n\n@pytest.mark.parametrize(\"w\", [1, 2])\ndef test_area_scales(w):\n    assert area(w, 2) == 2 * w\n";

        let mut r = Refiner::new(TestFramework::Pytest);
        r.merge(a, 1, "a");
        r.merge(b, 1, "b");

        let file = r.file();
        assert_eq!(file.includes, vec!["import pytest", "from geo import area"]);
        assert_eq!(
            file.case_names(),
            vec!["test_area_unit", "TestArea", "test_area_scales"]
        );
        assert!(file.cases[1].text.starts_with("# grouped"));

        let rendered = r.render();
        assert_eq!(TestFile::parse(&rendered, TestFramework::Pytest).render(), rendered);
    }

    #[test]
    fn cargo_cases_need_a_test_attribute() {
        let src = "use mycrate::parse;\n\nfn fixture() -> &'static str { \"42\" }\n\n#[test]\nfn parse_reads_digits() {\n    assert_eq!(parse(fixture()), Some(42));\n}\n";
        let file = TestFile::parse(src, TestFramework::Cargo);

        assert_eq!(file.includes, vec!["use mycrate::parse;"]);
        assert_eq!(file.support.len(), 1);
        assert_eq!(file.case_names(), vec!["parse_reads_digits"]);
        assert!(file.cases[0].text.starts_with("#[test]"));
    }
}
