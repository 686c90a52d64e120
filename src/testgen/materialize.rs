use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::config::TestFramework;
use crate::error::IntegrationError;

/* ============================================================
   Public entry
   ============================================================ */

/// `<test_dir>/<relative dir>/<prefix><stem><suffix>` for a unit at
/// `unit_path` (relative, `/`-separated).
pub fn artifact_path(test_dir: &Path, framework: TestFramework, unit_path: &str) -> PathBuf {
    let rel = Path::new(unit_path);
    let stem = sanitize_name(
        rel.file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unit"),
    );
    place(test_dir, framework, rel, &stem)
}

/// Artifact paths for every unit of a run, one distinct file per unit.
///
/// Units whose plain paths collide (`math.c` next to `math.cpp`) keep their
/// extension in the stem (`test_math_c.cpp`, `test_math_cpp.cpp`). Anything
/// still taken gets a numeric suffix, assigned in path order.
pub fn artifact_paths<'a, I>(
    test_dir: &Path,
    framework: TestFramework,
    unit_paths: I,
) -> BTreeMap<String, PathBuf>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut by_base: BTreeMap<PathBuf, Vec<&str>> = BTreeMap::new();
    for unit in unit_paths {
        let group = by_base
            .entry(artifact_path(test_dir, framework, unit))
            .or_default();
        if !group.contains(&unit) {
            group.push(unit);
        }
    }

    let mut taken: BTreeSet<PathBuf> = by_base
        .iter()
        .filter(|(_, group)| group.len() == 1)
        .map(|(base, _)| base.clone())
        .collect();
    let mut out = BTreeMap::new();

    for (base, mut group) in by_base {
        if group.len() == 1 {
            out.insert(group[0].to_string(), base);
            continue;
        }

        group.sort_unstable();
        tracing::warn!(artifact = %base.display(), units = ?group, "units share a test file name, keeping extensions");

        for unit in group {
            let rel = Path::new(unit);
            let stem = sanitize_name(
                rel.file_name()
                    .and_then(|s| s.to_str())
                    .unwrap_or("unit"),
            );

            let mut path = place(test_dir, framework, rel, &stem);
            let mut n = 2;
            while taken.contains(&path) {
                path = place(test_dir, framework, rel, &format!("{stem}_{n}"));
                n += 1;
            }
            taken.insert(path.clone());
            out.insert(unit.to_string(), path);
        }
    }

    out
}

fn place(test_dir: &Path, framework: TestFramework, rel: &Path, stem: &str) -> PathBuf {
    let file = match framework {
        TestFramework::Gtest => format!("test_{stem}.cpp"),
        TestFramework::Pytest => format!("test_{stem}.py"),
        TestFramework::Cargo => format!("{stem}_test.rs"),
    };

    match rel.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(dir) => test_dir.join(dir).join(file),
        None => test_dir.join(file),
    }
}

/// Atomically replaces `path` with `content`. A failed write is retried
/// once. Returns whether the file changed.
pub fn integrate(path: &Path, content: &str) -> Result<bool, IntegrationError> {
    match write_atomic(path, content) {
        Ok(changed) => Ok(changed),
        Err(first) => {
            tracing::warn!(path = %path.display(), error = %first, "artifact write failed, retrying once");
            write_atomic(path, content).map_err(|source| IntegrationError::Write {
                path: path.to_path_buf(),
                source,
            })
        }
    }
}

/// Temp file in the same directory, then rename. Identical content is a
/// no-op so mtimes survive reruns.
pub fn write_atomic(path: &Path, content: &str) -> io::Result<bool> {
    if fs::read_to_string(path).is_ok_and(|existing| existing == content) {
        tracing::debug!(path = %path.display(), "artifact unchanged");
        return Ok(false);
    }

    ensure_parent_dir(path)?;
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "artifact path has no parent"))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".testsmith-")
        .tempfile_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;

    tracing::info!(path = %path.display(), bytes = content.len(), "artifact written");
    Ok(true)
}

/* ============================================================
   Helpers
   ============================================================ */

pub fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn sanitize_name(stem: &str) -> String {
    let name: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    if name.is_empty() {
        "unit".into()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_paths_mirror_the_source_tree() {
        let dir = Path::new("/p/tests");
        assert_eq!(
            artifact_path(dir, TestFramework::Gtest, "src/math.cpp"),
            PathBuf::from("/p/tests/src/test_math.cpp")
        );
        assert_eq!(
            artifact_path(dir, TestFramework::Pytest, "geo.py"),
            PathBuf::from("/p/tests/test_geo.py")
        );
        assert_eq!(
            artifact_path(dir, TestFramework::Cargo, "src/io-utils.rs"),
            PathBuf::from("/p/tests/src/io_utils_test.rs")
        );
    }

    #[test]
    fn sibling_units_with_one_stem_get_distinct_artifacts() {
        let dir = Path::new("/p/tests");
        let paths = artifact_paths(
            dir,
            TestFramework::Gtest,
            ["src/math.cpp", "src/math.c", "src/geo.cpp", "src/math_c.cpp"],
        );

        assert_eq!(paths["src/geo.cpp"], PathBuf::from("/p/tests/src/test_geo.cpp"));
        assert_eq!(paths["src/math.c"], PathBuf::from("/p/tests/src/test_math_c_2.cpp"));
        assert_eq!(paths["src/math.cpp"], PathBuf::from("/p/tests/src/test_math_cpp.cpp"));
        assert_eq!(paths["src/math_c.cpp"], PathBuf::from("/p/tests/src/test_math_c.cpp"));

        let distinct: BTreeSet<_> = paths.values().collect();
        assert_eq!(distinct.len(), paths.len());
    }

    #[test]
    fn units_without_collisions_keep_their_plain_names() {
        let dir = Path::new("/p/tests");
        let paths = artifact_paths(dir, TestFramework::Pytest, ["geo.py", "pkg/geo.py"]);

        assert_eq!(paths["geo.py"], artifact_path(dir, TestFramework::Pytest, "geo.py"));
        assert_eq!(paths["pkg/geo.py"], PathBuf::from("/p/tests/pkg/test_geo.py"));
    }

    #[test]
    fn identical_content_is_not_rewritten() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a/b/test_x.cpp");

        assert!(integrate(&path, "one\n").unwrap());
        assert!(!integrate(&path, "one\n").unwrap());
        assert!(integrate(&path, "two\n").unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "two\n");

        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".testsmith-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn unwritable_target_is_an_integration_error() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("file");
        fs::write(&blocker, "x").unwrap();

        let err = integrate(&blocker.join("test_x.cpp"), "y").unwrap_err();
        assert!(matches!(err, IntegrationError::Write { .. }));
    }
}
