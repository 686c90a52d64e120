//! detectors/scan.rs
//!
//! Project scanning: every source file under a supported extension,
//! outside excluded directories, in a stable order.

use std::path::{Path, PathBuf};

use walkdir::{DirEntry, WalkDir};

use crate::error::RunError;

pub fn find_source_files(
    root: &Path,
    extensions: &[String],
    excluded_dirs: &[String],
) -> Result<Vec<PathBuf>, RunError> {
    let mut out = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_excluded(e, excluded_dirs));

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            // Unreadable root is fatal, unreadable children are skipped.
            Err(e) if e.depth() == 0 => {
                return Err(RunError::Scan {
                    path: root.to_path_buf(),
                    source: e,
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        if has_extension(entry.path(), extensions) {
            out.push(entry.into_path());
        }
    }

    Ok(out)
}

/* ============================================================
   Helpers
   ============================================================ */

fn is_excluded(entry: &DirEntry, excluded_dirs: &[String]) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }

    let name = entry.file_name().to_string_lossy();
    matches!(name.as_ref(), "target" | "node_modules" | ".venv")
        || excluded_dirs.iter().any(|d| d.trim_matches('/') == name)
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    let dotted = format!(".{}", ext.to_ascii_lowercase());
    extensions.iter().any(|e| *e == dotted)
}

/// `/`-separated path relative to `root`; falls back to the full path.
pub fn relative_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Header next to a C-family source (`math.cpp` -> `math.h`), or the
/// file itself when it already is a header.
pub fn sibling_header(path: &Path) -> Option<PathBuf> {
    const HEADERS: [&str; 4] = ["h", "hpp", "hh", "hxx"];

    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if HEADERS.contains(&ext.as_str()) {
        return Some(path.to_path_buf());
    }

    HEADERS
        .iter()
        .map(|h| path.with_extension(h))
        .find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn skips_excluded_dirs_and_foreign_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("src/nested")).unwrap();
        fs::create_dir_all(root.join("build")).unwrap();
        fs::write(root.join("src/b.cpp"), "").unwrap();
        fs::write(root.join("src/nested/a.cc"), "").unwrap();
        fs::write(root.join("src/notes.txt"), "").unwrap();
        fs::write(root.join("build/gen.cpp"), "").unwrap();

        let files = find_source_files(
            root,
            &[".cpp".to_string(), ".cc".to_string()],
            &["build".to_string()],
        )
        .unwrap();

        let rel: Vec<_> = files.iter().map(|p| relative_path(root, p)).collect();
        assert_eq!(rel, vec!["src/b.cpp", "src/nested/a.cc"]);
    }

    #[test]
    fn finds_sibling_headers() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("math.cpp");
        fs::write(&src, "").unwrap();
        assert_eq!(sibling_header(&src), None);

        fs::write(dir.path().join("math.hpp"), "").unwrap();
        assert_eq!(sibling_header(&src), Some(dir.path().join("math.hpp")));
        assert_eq!(
            sibling_header(&dir.path().join("util.h")),
            Some(dir.path().join("util.h"))
        );
    }
}
