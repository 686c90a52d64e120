//! detectors/ast.rs
//!
//! Function extraction. Rust and Python go through tree-sitter, the C
//! family through a definition regex plus brace matching. Anything that
//! cannot be parsed degrades to a single whole-unit signature.

use std::cell::RefCell;
use std::sync::OnceLock;

use regex::Regex;
use tree_sitter::{Node, Parser, Tree};

use crate::detectors::language::Language;
use crate::error::ExtractionError;
use crate::state::FunctionSignature;

thread_local! {
    static PY_PARSER: RefCell<Option<Parser>> = RefCell::new(make_parser(&tree_sitter_python::language()));
    static RS_PARSER: RefCell<Option<Parser>> = RefCell::new(make_parser(&tree_sitter_rust::language()));
}

fn make_parser(language: &tree_sitter::Language) -> Option<Parser> {
    let mut p = Parser::new();
    p.set_language(language).ok()?;
    Some(p)
}

const C_KEYWORDS: &[&str] = &[
    "if", "for", "while", "switch", "return", "else", "catch", "sizeof", "do", "main",
];

const C_TYPE_WORDS: &[&str] = &[
    "int", "char", "long", "short", "double", "float", "bool", "unsigned", "signed", "void",
    "size_t", "auto",
];

fn c_function_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?m)^[ \t]*(?P<quals>(?:(?:static|inline|extern|virtual|constexpr)\s+)*)(?P<ret>(?:const\s+)?(?:unsigned\s+|signed\s+|struct\s+|long\s+)?[A-Za-z_][\w:]*(?:<[^<>;{}()]*>)?(?:\s*[*&]+\s*|\s+))(?P<name>[A-Za-z_][\w:~]*)\s*\((?P<params>[^;{}()]*)\)\s*(?P<cv>const)?\s*(?:noexcept\s*)?\{",
        )
        .expect("static regex")
    })
}

fn c_param_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<ty>.*?)(?P<name>[A-Za-z_]\w*)\s*(?P<arr>\[\s*\w*\s*\])?$")
            .expect("static regex")
    })
}

/* ============================================================
   Public API
   ============================================================ */

/// Ordered signatures for a unit, never empty. Falls back to whole-unit
/// granularity on any extraction error.
pub fn extract_signatures(file: &str, language: Language, source: &str) -> Vec<FunctionSignature> {
    match extract_functions(file, language, source) {
        Ok(sigs) => sigs,
        Err(e) => {
            tracing::warn!(file, error = %e, "extraction degraded to whole unit");
            vec![FunctionSignature::whole_unit(file, source)]
        }
    }
}

pub fn extract_functions(
    file: &str,
    language: Language,
    source: &str,
) -> Result<Vec<FunctionSignature>, ExtractionError> {
    let sigs = match language {
        Language::Rust | Language::Python => extract_tree_sitter(file, language, source)?,
        Language::C | Language::Cpp => extract_c_family(file, source)?,
        Language::Unknown => {
            return Err(ExtractionError::UnsupportedLanguage { file: file.into() })
        }
    };

    if sigs.is_empty() {
        return Err(ExtractionError::NoFunctions { file: file.into() });
    }
    Ok(sigs)
}

pub fn parse_source(language: Language, source: &str) -> Option<Tree> {
    let parse = |p: &RefCell<Option<Parser>>| {
        p.borrow_mut().as_mut().and_then(|p| p.parse(source, None))
    };

    match language {
        Language::Python => PY_PARSER.with(parse),
        Language::Rust => RS_PARSER.with(parse),
        _ => None,
    }
}

/// 1-based line of the first syntax error in a tree-sitter tree.
pub fn first_error_line(tree: &Tree) -> Option<usize> {
    fn walk(node: Node) -> Option<usize> {
        if node.is_error() || node.is_missing() {
            return Some(node.start_position().row + 1);
        }
        if !node.has_error() {
            return None;
        }
        let mut cursor = node.walk();
        let children: Vec<Node> = node.children(&mut cursor).collect();
        children.into_iter().find_map(walk)
    }

    walk(tree.root_node())
}

/// Same-length copy of `src` with comment bodies and string contents
/// blanked, so brace matching and regexes never see them.
pub fn mask_code(src: &str, language: Language) -> String {
    let bytes = src.as_bytes();
    let mut out = bytes.to_vec();
    let mut i = 0;

    let blank = |out: &mut Vec<u8>, from: usize, to: usize| {
        for b in &mut out[from..to] {
            if *b != b'\n' {
                *b = b' ';
            }
        }
    };

    while i < bytes.len() {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied();

        if language == Language::Python && b == b'#' {
            let end = find_line_end(bytes, i);
            blank(&mut out, i, end);
            i = end;
        } else if language != Language::Python && b == b'/' && next == Some(b'/') {
            let end = find_line_end(bytes, i);
            blank(&mut out, i, end);
            i = end;
        } else if language != Language::Python && b == b'/' && next == Some(b'*') {
            let end = find_sub(bytes, i + 2, b"*/").map(|p| p + 2).unwrap_or(bytes.len());
            blank(&mut out, i, end);
            i = end;
        } else if b == b'"' || (b == b'\'' && is_char_literal(bytes, i, language)) {
            let end = find_string_end(bytes, i + 1, b);
            if end > i + 1 {
                blank(&mut out, i + 1, end.saturating_sub(1).max(i + 1));
            }
            i = end;
        } else {
            i += 1;
        }
    }

    String::from_utf8(out).unwrap_or_else(|_| src.to_string())
}

/// Byte offset one past the brace matching the `{` at `open`.
pub fn matching_brace(masked: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, b) in masked.bytes().enumerate().skip(open) {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/* ============================================================
   tree-sitter (Rust / Python)
   ============================================================ */

fn extract_tree_sitter(
    file: &str,
    language: Language,
    source: &str,
) -> Result<Vec<FunctionSignature>, ExtractionError> {
    let tree = parse_source(language, source)
        .ok_or_else(|| ExtractionError::UnsupportedLanguage { file: file.into() })?;

    if let Some(line) = first_error_line(&tree) {
        return Err(ExtractionError::Unparseable {
            file: file.into(),
            line,
        });
    }

    let mut out = Vec::new();
    collect_functions(tree.root_node(), source, language, None, &mut out);
    Ok(out)
}

fn collect_functions(
    node: Node,
    source: &str,
    language: Language,
    owner: Option<&str>,
    out: &mut Vec<FunctionSignature>,
) {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match (language, child.kind()) {
            (Language::Rust, "function_item") => {
                if let Some(sig) = rust_signature(child, source, owner) {
                    out.push(sig);
                }
            }
            (Language::Rust, "impl_item") => {
                let ty = child
                    .child_by_field_name("type")
                    .and_then(|n| n.utf8_text(source.as_bytes()).ok());
                if let Some(body) = child.child_by_field_name("body") {
                    collect_functions(body, source, language, ty, out);
                }
            }
            (Language::Rust, "mod_item") => {
                let name = child
                    .child_by_field_name("name")
                    .and_then(|n| n.utf8_text(source.as_bytes()).ok());
                if name == Some("tests") {
                    continue;
                }
                if let Some(body) = child.child_by_field_name("body") {
                    collect_functions(body, source, language, owner, out);
                }
            }
            (Language::Python, "function_definition") => {
                if let Some(sig) = python_signature(child, child, source, owner) {
                    out.push(sig);
                }
            }
            (Language::Python, "decorated_definition") => {
                if let Some(def) = child.child_by_field_name("definition") {
                    if def.kind() == "function_definition" {
                        if let Some(sig) = python_signature(def, child, source, owner) {
                            out.push(sig);
                        }
                    } else if def.kind() == "class_definition" {
                        collect_python_class(def, source, out);
                    }
                }
            }
            (Language::Python, "class_definition") => collect_python_class(child, source, out),
            _ => {}
        }
    }
}

fn collect_python_class(node: Node, source: &str, out: &mut Vec<FunctionSignature>) {
    let name = node
        .child_by_field_name("name")
        .and_then(|n| n.utf8_text(source.as_bytes()).ok());
    if name.is_some_and(|n| n.starts_with("Test")) {
        return;
    }
    if let Some(body) = node.child_by_field_name("body") {
        collect_functions(body, source, Language::Python, name, out);
    }
}

fn text<'a>(node: Node, source: &'a str) -> &'a str {
    node.utf8_text(source.as_bytes()).unwrap_or_default()
}

fn rust_signature(node: Node, source: &str, owner: Option<&str>) -> Option<FunctionSignature> {
    let name = text(node.child_by_field_name("name")?, source);

    if let Some(prev) = node.prev_named_sibling() {
        if prev.kind() == "attribute_item" && text(prev, source).contains("test") {
            return None;
        }
    }

    let mut qualifiers = Vec::new();
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match child.kind() {
            "visibility_modifier" | "function_modifiers" => {
                qualifiers.extend(text(child, source).split_whitespace().map(String::from))
            }
            _ => {}
        }
    }

    let mut params = Vec::new();
    if let Some(list) = node.child_by_field_name("parameters") {
        let mut cursor = list.walk();
        for p in list.named_children(&mut cursor) {
            match p.kind() {
                "parameter" => {
                    if let Some(ty) = p.child_by_field_name("type") {
                        params.push(text(ty, source).to_string());
                    }
                }
                "self_parameter" => qualifiers.push(text(p, source).to_string()),
                _ => {}
            }
        }
    }

    let return_type = node
        .child_by_field_name("return_type")
        .map(|n| text(n, source).to_string());

    let body_start = node
        .child_by_field_name("body")
        .map(|b| b.start_byte())
        .unwrap_or(node.end_byte());

    Some(FunctionSignature {
        name: qualified(owner, name, "::"),
        params,
        return_type,
        qualifiers,
        signature: source[node.start_byte()..body_start].trim().to_string(),
        source: text(node, source).to_string(),
        whole_unit: false,
    })
}

fn python_signature(
    def: Node,
    outer: Node,
    source: &str,
    owner: Option<&str>,
) -> Option<FunctionSignature> {
    let name = text(def.child_by_field_name("name")?, source);
    if name.starts_with("test") || (name.starts_with("__") && name != "__init__") {
        return None;
    }

    let mut qualifiers = Vec::new();
    if outer.kind() == "decorated_definition" {
        let mut cursor = outer.walk();
        for child in outer.named_children(&mut cursor) {
            if child.kind() == "decorator" {
                qualifiers.push(text(child, source).to_string());
            }
        }
    }
    if text(def, source).starts_with("async") {
        qualifiers.push("async".into());
    }

    let mut params = Vec::new();
    if let Some(list) = def.child_by_field_name("parameters") {
        let mut cursor = list.walk();
        for p in list.named_children(&mut cursor) {
            let entry = match p.kind() {
                "identifier" => text(p, source).to_string(),
                "typed_parameter" | "typed_default_parameter" => p
                    .child_by_field_name("type")
                    .map(|t| text(t, source).to_string())
                    .unwrap_or_else(|| text(p, source).to_string()),
                "default_parameter" => p
                    .child_by_field_name("name")
                    .map(|n| text(n, source).to_string())
                    .unwrap_or_default(),
                _ => text(p, source).to_string(),
            };
            if entry != "self" && entry != "cls" && !entry.is_empty() {
                params.push(entry);
            }
        }
    }

    let return_type = def
        .child_by_field_name("return_type")
        .map(|n| text(n, source).to_string());

    let body_start = def
        .child_by_field_name("body")
        .map(|b| b.start_byte())
        .unwrap_or(def.end_byte());

    Some(FunctionSignature {
        name: qualified(owner, name, "."),
        params,
        return_type,
        qualifiers,
        signature: source[def.start_byte()..body_start]
            .trim()
            .trim_end_matches(':')
            .to_string(),
        source: text(outer, source).to_string(),
        whole_unit: false,
    })
}

fn qualified(owner: Option<&str>, name: &str, sep: &str) -> String {
    match owner {
        Some(o) => format!("{o}{sep}{name}"),
        None => name.to_string(),
    }
}

/* ============================================================
   C family
   ============================================================ */

fn extract_c_family(file: &str, source: &str) -> Result<Vec<FunctionSignature>, ExtractionError> {
    let masked = mask_code(source, Language::Cpp);

    if let Some(line) = unbalanced_brace_line(&masked) {
        return Err(ExtractionError::Unparseable {
            file: file.into(),
            line,
        });
    }

    let mut out = Vec::new();
    let mut resume = 0usize;

    for caps in c_function_regex().captures_iter(&masked) {
        let whole = caps.get(0).expect("group 0 always matches");
        if whole.start() < resume {
            continue;
        }

        let name = &caps["name"];
        if C_KEYWORDS.contains(&name) {
            continue;
        }

        let open = whole.end() - 1;
        let Some(close) = matching_brace(&masked, open) else {
            return Err(ExtractionError::Unparseable {
                file: file.into(),
                line: line_of(source, open),
            });
        };
        // Nested definitions (lambdas, local structs) stay inside this body.
        resume = close;

        let start = whole.start() + (whole.as_str().len() - whole.as_str().trim_start().len());

        let mut qualifiers: Vec<String> = caps["quals"].split_whitespace().map(String::from).collect();
        if caps.name("cv").is_some() {
            qualifiers.push("const".into());
        }

        out.push(FunctionSignature {
            name: name.to_string(),
            params: c_param_types(&source[caps.name("params").map_or(0..0, |m| m.range())]),
            return_type: Some(normalize_ws(&caps["ret"])),
            qualifiers,
            signature: normalize_ws(&source[start..open]),
            source: source[start..close].to_string(),
            whole_unit: false,
        });
    }

    Ok(out)
}

fn c_param_types(params: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();

    for ch in params.chars() {
        match ch {
            '<' => depth += 1,
            '>' => depth -= 1,
            ',' if depth == 0 => {
                out.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    out.push(current);

    out.into_iter()
        .filter_map(|p| {
            let p = p.split('=').next().unwrap_or("").trim().to_string();
            if p.is_empty() || p == "void" {
                return None;
            }
            let caps = c_param_regex().captures(&p)?;
            let ty = caps["ty"].trim();
            let name = &caps["name"];
            if ty.is_empty() || C_TYPE_WORDS.contains(&name) || ty.ends_with("::") {
                return Some(normalize_ws(&p));
            }
            let arr = if caps.name("arr").is_some() { "[]" } else { "" };
            Some(format!("{}{}", normalize_ws(ty), arr))
        })
        .collect()
}

fn unbalanced_brace_line(masked: &str) -> Option<usize> {
    let mut depth = 0i64;
    for (i, b) in masked.bytes().enumerate() {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth < 0 {
                    return Some(line_of(masked, i));
                }
            }
            _ => {}
        }
    }
    (depth != 0).then(|| masked.lines().count().max(1))
}

/* ============================================================
   Helpers
   ============================================================ */

pub fn line_of(src: &str, byte: usize) -> usize {
    src.as_bytes()[..byte.min(src.len())]
        .iter()
        .filter(|b| **b == b'\n')
        .count()
        + 1
}

fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn find_line_end(bytes: &[u8], from: usize) -> usize {
    bytes[from..]
        .iter()
        .position(|b| *b == b'\n')
        .map(|p| from + p)
        .unwrap_or(bytes.len())
}

fn find_sub(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from >= bytes.len() {
        return None;
    }
    bytes[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| from + p)
}

/// Index one past the closing quote; stops at end of line for unterminated literals.
fn find_string_end(bytes: &[u8], mut i: usize, quote: u8) -> usize {
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\n' => return i,
            b if b == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

fn is_char_literal(bytes: &[u8], i: usize, language: Language) -> bool {
    match language {
        // Lifetimes and labels share the quote in Rust.
        Language::Rust => {
            bytes.get(i + 1) == Some(&b'\\') || bytes.get(i + 2) == Some(&b'\'')
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CPP: &str = r#"
#include <string>

// int fake(int x) { return x; }
static int add(int a, int b) {
    return a + b;
}

const char* greet(const std::string &name, int times = 1) {
    if (times > 0) {
        return "{";
    }
    return "";
}

int main() {
    return add(1, 2);
}
"#;

    #[test]
    fn c_family_functions_in_declaration_order() {
        let sigs = extract_functions("math.cpp", Language::Cpp, CPP).unwrap();
        let names: Vec<_> = sigs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["add", "greet"]);

        assert_eq!(sigs[0].params, vec!["int", "int"]);
        assert_eq!(sigs[0].return_type.as_deref(), Some("int"));
        assert_eq!(sigs[0].qualifiers, vec!["static"]);
        assert!(sigs[0].source.ends_with('}'));

        assert_eq!(sigs[1].params, vec!["const std::string &", "int"]);
    }

    #[test]
    fn unbalanced_source_degrades_to_whole_unit() {
        let src = "int broken(int a) {\n  if (a) {\n    return 1;\n";
        assert!(matches!(
            extract_functions("b.c", Language::C, src),
            Err(ExtractionError::Unparseable { .. })
        ));

        let sigs = extract_signatures("b.c", Language::C, src);
        assert_eq!(sigs.len(), 1);
        assert!(sigs[0].whole_unit);
        assert_eq!(sigs[0].source, src);
    }

    #[test]
    fn rust_functions_and_methods() {
        let src = r#"
pub fn parse(input: &str, strict: bool) -> Option<u32> { input.parse().ok() }

struct Counter;

impl Counter {
    pub async fn bump(&mut self, by: u32) {}
}

#[cfg(test)]
mod tests {
    #[test]
    fn it_works() {}
}
"#;
        let sigs = extract_functions("lib.rs", Language::Rust, src).unwrap();
        let names: Vec<_> = sigs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["parse", "Counter::bump"]);
        assert_eq!(sigs[0].params, vec!["&str", "bool"]);
        assert_eq!(sigs[0].return_type.as_deref(), Some("Option<u32>"));
        assert!(sigs[1].qualifiers.contains(&"async".to_string()));
    }

    #[test]
    fn python_functions_skip_tests() {
        let src = "def area(w: int, h: int) -> int:\n    return w * h\n\ndef test_area():\n    assert area(1, 2) == 2\n";
        let sigs = extract_functions("geo.py", Language::Python, src).unwrap();
        assert_eq!(sigs.len(), 1);
        assert_eq!(sigs[0].name, "area");
        assert_eq!(sigs[0].params, vec!["int", "int"]);
    }

    #[test]
    fn python_syntax_error_degrades() {
        let sigs = extract_signatures("bad.py", Language::Python, "def f(:\n  pass\n");
        assert_eq!(sigs.len(), 1);
        assert!(sigs[0].whole_unit);
    }

    #[test]
    fn mask_keeps_offsets() {
        let src = "a /* { */ \"}\" // {\nb";
        let masked = mask_code(src, Language::Cpp);
        assert_eq!(masked.len(), src.len());
        assert!(!masked.contains('{'));
        assert!(masked.ends_with("\nb"));
    }
}
