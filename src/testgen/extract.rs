//! testgen/extract.rs
//!
//! Pulls the candidate file out of a free-form model reply.
//! Policy: language-tagged fence, else any fence, else the whole reply.

use std::sync::OnceLock;

use regex::Regex;

use crate::detectors::language::Language;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionSource {
    TaggedFence,
    AnyFence,
    WholeReply,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedCode {
    pub code: String,
    pub source: ExtractionSource,
}

fn fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```[ \t]*([A-Za-z0-9_+#.-]*)[^\n]*\n(.*?)```").expect("static regex")
    })
}

pub fn extract_code(reply: &str, language: Language) -> ExtractedCode {
    let blocks: Vec<(String, &str)> = fence_regex()
        .captures_iter(reply)
        .filter_map(|c| {
            let tag = c.get(1)?.as_str().to_ascii_lowercase();
            let body = c.get(2)?.as_str();
            Some((tag, body))
        })
        .collect();

    let tags = language.fence_tags();

    // Longest tagged block wins: models sometimes add a short usage snippet.
    let tagged = blocks
        .iter()
        .filter(|(tag, _)| tags.contains(&tag.as_str()))
        .max_by_key(|(_, body)| body.trim().len());

    if let Some((_, body)) = tagged {
        return ExtractedCode {
            code: normalize(body),
            source: ExtractionSource::TaggedFence,
        };
    }

    if let Some((_, body)) = blocks.first() {
        return ExtractedCode {
            code: normalize(body),
            source: ExtractionSource::AnyFence,
        };
    }

    ExtractedCode {
        code: normalize(reply),
        source: ExtractionSource::WholeReply,
    }
}

fn normalize(code: &str) -> String {
    let mut s = code.trim().replace("\r\n", "\n");
    if !s.is_empty() {
        s.push('\n');
    }
    s
}
