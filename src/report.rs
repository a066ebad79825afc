//! Batch report persistence and post-hoc filtering.
//!
//! Reports are written as pretty-printed JSON next to wherever the caller
//! points. Filtering never mutates a stored report; it derives a new view in
//! which successful entries whose matches all fall outside the criteria are
//! downgraded to failed.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use thiserror::Error;
use tracing::info;

use crate::model::types::now_ms;
use crate::model::{BatchMetadata, BatchReport, Family, FileReportEntry, JobStatus};
use crate::search::filtered_view;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("failed to read report {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to write report {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("report is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Write a report as pretty JSON. Parent directories are created as needed.
pub fn save(report: &BatchReport, path: &Path) -> Result<(), ReportError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| ReportError::Write {
                path: path.display().to_string(),
                source,
            })?;
        }
    }
    let json = serde_json::to_string_pretty(report)?;
    fs::write(path, json).map_err(|source| ReportError::Write {
        path: path.display().to_string(),
        source,
    })?;
    info!(
        path = %path.display(),
        entries = report.results.len(),
        "report saved"
    );
    Ok(())
}

pub fn load(path: &Path) -> Result<BatchReport, ReportError> {
    let raw = fs::read_to_string(path).map_err(|source| ReportError::Read {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_json::from_str(&raw)?)
}

/// Derive a filtered view of a finished report.
///
/// Matches below `min_similarity` or outside `families` are dropped from each
/// successful entry; an entry left with no matches becomes a failed one. The
/// metadata counters are recomputed for the view. The input report is left
/// untouched.
pub fn filter_report(
    report: &BatchReport,
    min_similarity: Option<f64>,
    families: Option<&BTreeSet<Family>>,
) -> BatchReport {
    let results: Vec<FileReportEntry> = report
        .results
        .iter()
        .map(|entry| {
            let Some(data) = entry.data.as_ref().filter(|_| entry.success) else {
                return entry.clone();
            };
            let surviving = filtered_view(data, min_similarity, families);
            if surviving.is_empty() {
                FileReportEntry {
                    file_path: entry.file_path.clone(),
                    success: false,
                    status: JobStatus::Failed,
                    data: None,
                    error: Some("No results match filter criteria".to_string()),
                }
            } else {
                let mut data = data.clone();
                data.matches = surviving;
                FileReportEntry {
                    data: Some(data),
                    ..entry.clone()
                }
            }
        })
        .collect();

    let successful = results
        .iter()
        .filter(|e| e.status == JobStatus::Succeeded)
        .count();
    let skipped = results
        .iter()
        .filter(|e| e.status == JobStatus::Skipped)
        .count();
    let total = results.len();
    BatchReport {
        results,
        metadata: BatchMetadata {
            total_files: total,
            successful_files: successful,
            failed_files: total - successful - skipped,
            skipped_files: skipped,
            generation_time: now_ms(),
            client_version: report.metadata.client_version.clone(),
        },
    }
}
