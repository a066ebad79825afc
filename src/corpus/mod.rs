//! Reference corpus loading and snapshot management.
//!
//! The corpus is a JSON registry of previously catalogued samples. Two shapes
//! are accepted: a bare array of records (legacy), or an object carrying a
//! `samples` array plus optional `metadata`. A loaded `CorpusIndex` is
//! immutable; `CorpusHandle` owns the active snapshot and swaps it atomically
//! on reload so in-flight searches keep the snapshot they already acquired.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::model::{Family, SampleRecord};

/// Errors raised while loading the corpus file. Fatal at startup.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to read corpus file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse corpus file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("corpus file {path} has an unrecognized top-level shape")]
    UnknownShape { path: PathBuf },

    #[error("corpus record {index} is missing required field `{field}`")]
    MissingField { index: usize, field: &'static str },
}

/// Integrity problem found by validation. Reported, never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    /// The record's artifact file does not exist on disk.
    MissingArtifact { index: usize, path: PathBuf },
    /// Two records share the same hash; the later one is flagged.
    DuplicateHash { index: usize, hash: String },
    /// The hash field is not a 64-char hex digest.
    MalformedHash { index: usize, hash: String },
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationIssue::MissingArtifact { index, path } => {
                write!(f, "record {index}: artifact not found: {}", path.display())
            }
            ValidationIssue::DuplicateHash { index, hash } => {
                write!(f, "record {index}: duplicate hash {hash}")
            }
            ValidationIssue::MalformedHash { index, hash } => {
                write!(f, "record {index}: malformed hash {hash:?}")
            }
        }
    }
}

/// Family-distribution statistics for a snapshot.
#[derive(Debug, Clone)]
pub struct CorpusStats {
    pub total_samples: usize,
    pub per_family_counts: BTreeMap<Family, usize>,
}

impl CorpusStats {
    pub fn family_list(&self) -> Vec<Family> {
        self.per_family_counts.keys().cloned().collect()
    }
}

/// An immutable snapshot of the reference sample registry.
///
/// Record order is load order; a record's index doubles as its identity for
/// deterministic tie-breaking in search results.
#[derive(Debug)]
pub struct CorpusIndex {
    records: Vec<SampleRecord>,
    source: PathBuf,
}

#[derive(Deserialize)]
struct RawRecord {
    family: Option<String>,
    hash: Option<String>,
    path: Option<String>,
}

impl CorpusIndex {
    /// Load a corpus from disk, failing closed on unreadable input, malformed
    /// JSON, or a record missing a required field. Unknown extra fields are
    /// tolerated at both the top level and per record.
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let text = fs::read_to_string(path).map_err(|source| LoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let value: Value = serde_json::from_str(&text).map_err(|source| LoadError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let raw_samples = match &value {
            Value::Array(items) => items.clone(),
            Value::Object(map) => match map.get("samples") {
                Some(Value::Array(items)) => {
                    if let Some(meta) = map.get("metadata") {
                        info!(corpus = %path.display(), metadata = %meta, "corpus carries metadata");
                    }
                    items.clone()
                }
                _ => {
                    return Err(LoadError::UnknownShape {
                        path: path.to_path_buf(),
                    })
                }
            },
            _ => {
                return Err(LoadError::UnknownShape {
                    path: path.to_path_buf(),
                })
            }
        };

        let mut records = Vec::with_capacity(raw_samples.len());
        for (index, item) in raw_samples.into_iter().enumerate() {
            let raw: RawRecord =
                serde_json::from_value(item).map_err(|source| LoadError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?;
            let family = raw
                .family
                .ok_or(LoadError::MissingField {
                    index,
                    field: "family",
                })
                .map(Family::from)?;
            let hash = raw.hash.ok_or(LoadError::MissingField {
                index,
                field: "hash",
            })?;
            let artifact = raw.path.ok_or(LoadError::MissingField {
                index,
                field: "path",
            })?;
            records.push(SampleRecord {
                family,
                hash,
                path: PathBuf::from(artifact),
            });
        }

        let index = Self {
            records,
            source: path.to_path_buf(),
        };
        let stats = index.stats();
        info!(
            corpus = %path.display(),
            samples = stats.total_samples,
            families = stats.per_family_counts.len(),
            "corpus loaded"
        );
        Ok(index)
    }

    /// Build a snapshot directly from records. Used by tests and reload paths
    /// that already hold parsed data.
    pub fn from_records(records: Vec<SampleRecord>) -> Self {
        Self {
            records,
            source: PathBuf::new(),
        }
    }

    pub fn records(&self) -> &[SampleRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Family-distribution stats. Pure read.
    pub fn stats(&self) -> CorpusStats {
        let mut per_family_counts: BTreeMap<Family, usize> = BTreeMap::new();
        for record in &self.records {
            *per_family_counts.entry(record.family.clone()).or_default() += 1;
        }
        CorpusStats {
            total_samples: self.records.len(),
            per_family_counts,
        }
    }

    /// Check integrity: missing artifact files, duplicate hashes, malformed
    /// hashes. Never fails; the search layer simply skips unusable records.
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for (index, record) in self.records.iter().enumerate() {
            if !record.path.exists() {
                issues.push(ValidationIssue::MissingArtifact {
                    index,
                    path: record.path.clone(),
                });
            }
            if record.hash.len() != 64 || !record.hash.bytes().all(|b| b.is_ascii_hexdigit()) {
                issues.push(ValidationIssue::MalformedHash {
                    index,
                    hash: record.hash.clone(),
                });
            }
            if !seen.insert(record.hash.to_ascii_lowercase()) {
                issues.push(ValidationIssue::DuplicateHash {
                    index,
                    hash: record.hash.clone(),
                });
            }
        }
        if !issues.is_empty() {
            warn!(count = issues.len(), "corpus validation found issues");
        }
        issues
    }
}

/// Owner of the active corpus snapshot.
///
/// Reload builds a fresh `CorpusIndex` and swaps the active reference;
/// searches that already cloned the `Arc` are unaffected mid-flight.
pub struct CorpusHandle {
    active: RwLock<Arc<CorpusIndex>>,
    path: PathBuf,
}

impl CorpusHandle {
    pub fn open(path: &Path) -> Result<Self, LoadError> {
        let index = CorpusIndex::load(path)?;
        Ok(Self {
            active: RwLock::new(Arc::new(index)),
            path: path.to_path_buf(),
        })
    }

    /// Wrap an already-built snapshot (tests, in-memory corpora).
    pub fn from_index(index: CorpusIndex) -> Self {
        let path = index.source().to_path_buf();
        Self {
            active: RwLock::new(Arc::new(index)),
            path,
        }
    }

    /// The current snapshot. Cheap to clone; safe to hold across a reload.
    pub fn snapshot(&self) -> Arc<CorpusIndex> {
        self.active.read().clone()
    }

    /// Re-read the corpus file and atomically replace the active snapshot.
    /// On failure the previous snapshot stays active.
    pub fn reload(&self) -> Result<(), LoadError> {
        let fresh = Arc::new(CorpusIndex::load(&self.path)?);
        *self.active.write() = fresh;
        info!(corpus = %self.path.display(), "corpus snapshot replaced");
        Ok(())
    }
}
