pub mod types;

pub use types::{
    BatchMetadata, BatchReport, Family, FileReportEntry, JobStatus, MatchResult, SampleRecord,
    SearchOutcome,
};
