// src/testgen/cache.rs
//
// Provenance manifest and idempotency keys.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::IntegrationError;
use crate::state::{FunctionSignature, SourceUnit};
use crate::testgen::materialize::write_atomic;

pub const MANIFEST_FILE: &str = ".testsmith-manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SemanticKey {
    pub file: String,
    pub symbol: Option<String>,
    pub code_hash: String,
}

impl SemanticKey {
    pub fn for_signature(unit: &SourceUnit, sig: &FunctionSignature) -> Self {
        Self {
            file: unit.path.clone(),
            symbol: (!sig.whole_unit).then(|| sig.name.clone()),
            code_hash: hash_str(&sig.source),
        }
    }

    /// Stable cache key
    pub fn to_cache_key(&self) -> String {
        let mut h = Sha256::new();
        h.update(self.file.as_bytes());
        if let Some(sym) = &self.symbol {
            h.update(sym.as_bytes());
        }
        h.update(self.code_hash.as_bytes());
        hex::encode(h.finalize())
    }
}

pub fn hash_str(s: &str) -> String {
    let mut h = Sha256::new();
    h.update(s.as_bytes());
    hex::encode(h.finalize())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Artifact path relative to the test directory.
    pub artifact: String,
    pub source_hash: String,
    /// test case name -> attempt number
    pub cases: BTreeMap<String, u32>,
    /// signature name -> semantic key, for signatures with passing tests
    pub resolved: BTreeMap<String, String>,
    pub unresolved: Vec<String>,
    /// test case name -> signature it was generated for
    #[serde(default)]
    pub owners: BTreeMap<String, String>,
}

/// Maps unit path -> entry. Serialized sorted and without timestamps.
pub struct Manifest {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, ManifestEntry>>,
}

impl Manifest {
    /// A missing or unreadable manifest starts empty.
    pub fn load(test_dir: &Path) -> Self {
        let path = test_dir.join(MANIFEST_FILE);
        let entries = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt manifest");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };

        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, unit: &str) -> Option<ManifestEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(unit)
            .cloned()
    }

    /// Unchanged source, nothing left unresolved, artifact still on disk.
    pub fn is_current(&self, unit: &SourceUnit, artifact: &Path) -> bool {
        self.get(&unit.path).is_some_and(|e| {
            e.source_hash == unit.content_hash && e.unresolved.is_empty() && artifact.is_file()
        })
    }

    /// Records `entry` and rewrites the manifest while holding the lock.
    pub fn record(&self, unit: &str, entry: ManifestEntry) -> Result<(), IntegrationError> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.insert(unit.to_string(), entry);

        let mut json = serde_json::to_string_pretty(&*entries)
            .map_err(|e| IntegrationError::Manifest {
                path: self.path.clone(),
                source: e.into(),
            })?;
        json.push('\n');

        write_atomic(&self.path, &json).map_err(|source| IntegrationError::Manifest {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }
}
