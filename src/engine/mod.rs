//! Diff-engine adapter: the pairwise comparison oracle.
//!
//! The engine is an external collaborator. The core never looks inside it;
//! it prepares one diff-ready artifact per query and asks for one comparison
//! per (query, candidate) pair. Two implementations ship: an external-process
//! adapter around a configured diff tool, and a deterministic in-process
//! hash engine used when no tool is available (and by the test suites), in
//! the same spirit as falling back from a quality model to a hash model.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Why a single compare (or the query preparation) failed.
///
/// `ServiceUnavailable` is the only retryable variant; everything else is
/// local to the candidate and simply excluded from ranking.
#[derive(Error, Debug)]
pub enum CompareError {
    #[error("diff tool not found: {0}")]
    ServiceUnavailable(String),

    #[error("artifact is malformed or unreadable: {path}: {reason}")]
    MalformedArtifact { path: PathBuf, reason: String },

    #[error("diff engine crashed: {0}")]
    EngineCrash(String),

    #[error("compare timed out for candidate {path}")]
    Timeout { path: PathBuf },
}

impl CompareError {
    /// Transient failures that a batch job may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CompareError::ServiceUnavailable(_))
    }
}

/// One engine-reported comparison between a query and a candidate.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Comparison {
    /// Whole-binary similarity in [0, 1].
    pub similarity: f64,
    /// Engine-reported reliability of the similarity estimate, in [0, 1].
    pub confidence: f64,
    /// Number of matched functions behind the global score.
    #[serde(default)]
    pub matched_function_count: u64,
}

/// The diffing-ready representation of the query binary, prepared once per
/// search and reused across every candidate compare.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// The original query file as submitted.
    pub source: PathBuf,
    /// The prepared artifact inside the job's working directory.
    pub prepared: PathBuf,
}

/// Pairwise comparison oracle. Called exactly once per (query, candidate)
/// pair per search; treated as the dominant cost per candidate.
pub trait DiffEngine: Send + Sync {
    /// Convert the query binary into its diff-ready artifact under `work_dir`.
    fn prepare(&self, query: &Path, work_dir: &Path) -> Result<Artifact, CompareError>;

    /// Compare the prepared query artifact against one candidate artifact.
    fn compare(&self, query: &Artifact, candidate: &Path) -> Result<Comparison, CompareError>;
}

/// Adapter around an external diff tool.
///
/// Contract: `<tool> compare <query-artifact> <candidate>` prints a JSON
/// object `{"similarity": f, "confidence": f, "matched_function_count": n}`
/// on stdout and exits zero. `<tool> export <query> <output>` produces the
/// diff-ready artifact.
#[derive(Debug)]
pub struct ExternalEngine {
    tool: PathBuf,
}

impl ExternalEngine {
    /// Use an explicitly configured tool path, or find `bindiff` on PATH.
    pub fn locate(configured: Option<&Path>) -> Result<Self, CompareError> {
        let tool = match configured {
            Some(path) if path.exists() => path.to_path_buf(),
            Some(path) => {
                return Err(CompareError::ServiceUnavailable(format!(
                    "configured diff tool does not exist: {}",
                    path.display()
                )))
            }
            None => which::which("bindiff")
                .map_err(|e| CompareError::ServiceUnavailable(format!("bindiff: {e}")))?,
        };
        Ok(Self { tool })
    }

    fn run(&self, args: &[&std::ffi::OsStr]) -> Result<Vec<u8>, CompareError> {
        let output = Command::new(&self.tool).args(args).output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CompareError::ServiceUnavailable(self.tool.display().to_string())
            } else {
                CompareError::EngineCrash(e.to_string())
            }
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CompareError::EngineCrash(format!(
                "{} exited with {}: {}",
                self.tool.display(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

impl DiffEngine for ExternalEngine {
    fn prepare(&self, query: &Path, work_dir: &Path) -> Result<Artifact, CompareError> {
        let prepared = work_dir.join("query.BinExport");
        debug!(query = %query.display(), out = %prepared.display(), "exporting query artifact");
        self.run(&[
            "export".as_ref(),
            query.as_os_str(),
            prepared.as_os_str(),
        ])?;
        if !prepared.exists() {
            return Err(CompareError::MalformedArtifact {
                path: query.to_path_buf(),
                reason: "export produced no artifact".to_string(),
            });
        }
        Ok(Artifact {
            source: query.to_path_buf(),
            prepared,
        })
    }

    fn compare(&self, query: &Artifact, candidate: &Path) -> Result<Comparison, CompareError> {
        let stdout = self.run(&[
            "compare".as_ref(),
            query.prepared.as_os_str(),
            candidate.as_os_str(),
        ])?;
        serde_json::from_slice(&stdout).map_err(|e| {
            warn!(candidate = %candidate.display(), error = %e, "unparseable engine output");
            CompareError::MalformedArtifact {
                path: candidate.to_path_buf(),
                reason: format!("unparseable engine output: {e}"),
            }
        })
    }
}

/// Deterministic in-process engine scoring by content digest overlap.
///
/// No diffing accuracy is claimed; it exists so the pipeline runs end to end
/// without an installed diff tool, and so tests get repeatable scores.
pub struct HashEngine;

impl HashEngine {
    fn digest(bytes: &[u8]) -> u64 {
        // FNV-1a, enough for a stable pseudo-score.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for b in bytes {
            hash ^= u64::from(*b);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        hash
    }

    fn read(path: &Path) -> Result<Vec<u8>, CompareError> {
        fs::read(path).map_err(|e| CompareError::MalformedArtifact {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

impl DiffEngine for HashEngine {
    fn prepare(&self, query: &Path, work_dir: &Path) -> Result<Artifact, CompareError> {
        let bytes = Self::read(query)?;
        let prepared = work_dir.join("query.digest");
        fs::write(&prepared, format!("{:016x}", Self::digest(&bytes))).map_err(|e| {
            CompareError::MalformedArtifact {
                path: prepared.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(Artifact {
            source: query.to_path_buf(),
            prepared,
        })
    }

    fn compare(&self, query: &Artifact, candidate: &Path) -> Result<Comparison, CompareError> {
        let query_digest = u64::from_str_radix(
            Self::read(&query.prepared)
                .map(|b| String::from_utf8_lossy(&b).into_owned())?
                .trim(),
            16,
        )
        .map_err(|e| CompareError::MalformedArtifact {
            path: query.prepared.clone(),
            reason: e.to_string(),
        })?;
        let candidate_digest = Self::digest(&Self::read(candidate)?);

        // Fraction of agreeing nibbles between the two digests.
        let agreeing = (0..16)
            .filter(|shift| {
                (query_digest >> (shift * 4)) & 0xf == (candidate_digest >> (shift * 4)) & 0xf
            })
            .count();
        let similarity = agreeing as f64 / 16.0;
        Ok(Comparison {
            similarity,
            confidence: 1.0 - similarity / 2.0,
            matched_function_count: agreeing as u64,
        })
    }
}
