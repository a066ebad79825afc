//! Normalized entity structs shared across the corpus, search, and batch layers.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Malware family attribution carried by a corpus record.
///
/// The set of well-known families is closed; anything else the corpus tags a
/// sample with is preserved verbatim in `Other`. A record that carries no
/// usable label maps to `Unknown`. Attribution always comes from the record
/// field, never from file names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(from = "String", into = "String")]
pub enum Family {
    Patchwork,
    Apt29,
    Lazarus,
    Turla,
    Winnti,
    Other(String),
    Unknown,
}

impl Family {
    /// Canonical label as it appears in the corpus file and reports.
    pub fn label(&self) -> &str {
        match self {
            Family::Patchwork => "Patchwork",
            Family::Apt29 => "APT29",
            Family::Lazarus => "Lazarus",
            Family::Turla => "Turla",
            Family::Winnti => "Winnti",
            Family::Other(s) => s,
            Family::Unknown => "Unknown",
        }
    }
}

impl From<String> for Family {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Patchwork" => Family::Patchwork,
            "APT29" => Family::Apt29,
            "Lazarus" => Family::Lazarus,
            "Turla" => Family::Turla,
            "Winnti" => Family::Winnti,
            "" | "Unknown" => Family::Unknown,
            _ => Family::Other(s),
        }
    }
}

impl From<&str> for Family {
    fn from(s: &str) -> Self {
        Family::from(s.to_string())
    }
}

impl From<Family> for String {
    fn from(f: Family) -> Self {
        f.label().to_string()
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.label())
    }
}

/// One catalogued sample in the reference corpus. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleRecord {
    pub family: Family,
    /// 64-char hex digest; the unique key within a corpus snapshot.
    pub hash: String,
    /// Path to the diffing-ready artifact for this sample.
    pub path: PathBuf,
}

/// A single ranked hit from one search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub family: Family,
    pub hash: String,
    pub path: PathBuf,
    pub similarity: f64,
    pub confidence: f64,
    pub matched_function_count: u64,
    /// 1-based position in the ranked list.
    pub rank: usize,
}

/// The immutable result of ranking one query against a corpus snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOutcome {
    /// Identity of the query file as submitted.
    pub query: PathBuf,
    /// Ordered best-first, at most `k` entries.
    pub matches: Vec<MatchResult>,
    pub duration_ms: u64,
    /// Epoch milliseconds at completion.
    pub timestamp_ms: i64,
    /// Size of the corpus snapshot the search ran against.
    pub corpus_size: usize,
    /// Candidates whose compare call failed and were excluded from ranking.
    pub engine_failure_count: usize,
}

/// Terminal disposition of one batch job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    Failed,
    TimedOut,
    /// Never dispatched because the batch was cancelled or timed out.
    Skipped,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::TimedOut => write!(f, "timed_out"),
            JobStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Per-file entry in a batch report, in discovery order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReportEntry {
    pub file_path: PathBuf,
    pub success: bool,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<SearchOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Run-level metadata stitched onto a finished batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMetadata {
    pub total_files: usize,
    pub successful_files: usize,
    pub failed_files: usize,
    pub skipped_files: usize,
    /// Epoch milliseconds when the report was generated.
    pub generation_time: i64,
    pub client_version: String,
}

/// The aggregated outcome of one batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub results: Vec<FileReportEntry>,
    pub metadata: BatchMetadata,
}

/// Current epoch time in milliseconds.
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
