//! Concurrent batch orchestration.
//!
//! Fans a set of query files out across a fixed-size worker pool. Workers
//! pull jobs from a FIFO channel; every job runs with its own deadline and a
//! private scoped working directory that is removed on every exit path.
//! Completion order is reconciled back to job identity, so the final report
//! is always in discovery order.
//!
//! Job lifecycle: `Queued → Running → {Succeeded | Failed | TimedOut} →
//! Cleaned` (the working directory drop). Jobs never dispatched because the
//! batch was cancelled or timed out are marked `Skipped`.

pub mod scanner;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::corpus::CorpusIndex;
use crate::engine::DiffEngine;
use crate::model::types::now_ms;
use crate::model::{
    BatchMetadata, BatchReport, FileReportEntry, JobStatus, SearchOutcome,
};
use crate::search::{SearchCoordinator, SearchRequest};
use scanner::ScanOptions;

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Tunables for one batch run.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub scan: ScanOptions,
    /// Worker pool size.
    pub workers: usize,
    /// Deadline applied independently to each job attempt.
    pub job_timeout: Duration,
    /// Optional whole-batch deadline; on expiry undispatched jobs are skipped.
    pub batch_timeout: Option<Duration>,
    /// Retry budget for transient (service-unavailable) failures.
    pub retries: u32,
    /// Base backoff, doubled per attempt.
    pub retry_backoff: Duration,
    /// Search parameters applied to every job.
    pub request: SearchRequest,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            scan: ScanOptions::default(),
            workers: DEFAULT_WORKERS,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            batch_timeout: None,
            retries: DEFAULT_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            request: SearchRequest::default(),
        }
    }
}

#[derive(Debug)]
struct Job {
    id: usize,
    path: PathBuf,
    attempt: u32,
}

#[derive(Debug)]
enum Verdict {
    Succeeded(Box<SearchOutcome>),
    /// Transient failure; may re-enter the queue.
    Retryable(String),
    Failed(String),
    TimedOut,
    Skipped,
}

#[derive(Debug)]
struct JobDone {
    id: usize,
    attempt: u32,
    verdict: Verdict,
}

#[derive(Default)]
struct Progress {
    completed: usize,
    failed: usize,
}

/// Runs batches of query jobs against one corpus snapshot.
pub struct BatchOrchestrator<'a> {
    engine: &'a dyn DiffEngine,
    corpus: Arc<CorpusIndex>,
    cancel: Arc<AtomicBool>,
}

impl<'a> BatchOrchestrator<'a> {
    pub fn new(engine: &'a dyn DiffEngine, corpus: Arc<CorpusIndex>) -> Self {
        Self {
            engine,
            corpus,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle that lets another thread cancel this batch. Cancellation stops
    /// dispatching; in-flight jobs finish or hit their own timeout.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Discover candidates under `root` and process them.
    pub fn run(&self, root: &Path, options: &BatchOptions) -> std::io::Result<BatchReport> {
        let files = scanner::scan_directory(root, &options.scan)?;
        Ok(self.run_files(files, options))
    }

    /// Process an explicit file list. Every input file appears in the report
    /// exactly once, in the given order, with an explicit outcome.
    pub fn run_files(&self, files: Vec<PathBuf>, options: &BatchOptions) -> BatchReport {
        let total = files.len();
        let workers = options.workers.max(1);
        info!(total, workers, "starting batch");

        let mut slots: Vec<Option<FileReportEntry>> = Vec::new();
        slots.resize_with(total, || None);

        if total > 0 {
            let (jobs_tx, jobs_rx) = unbounded::<Job>();
            let (done_tx, done_rx) = unbounded::<JobDone>();
            let progress = Arc::new(Mutex::new(Progress::default()));

            thread::scope(|scope| {
                for worker_id in 0..workers {
                    let jobs_rx = jobs_rx.clone();
                    let done_tx = done_tx.clone();
                    let progress = progress.clone();
                    let cancel = self.cancel.clone();
                    let corpus = self.corpus.clone();
                    let engine = self.engine;
                    let request = options.request.clone();
                    let job_timeout = options.job_timeout;
                    let retry_backoff = options.retry_backoff;
                    scope.spawn(move || {
                        worker_loop(
                            worker_id,
                            engine,
                            &corpus,
                            &request,
                            job_timeout,
                            retry_backoff,
                            &cancel,
                            &jobs_rx,
                            &done_tx,
                            &progress,
                            total,
                        );
                    });
                }
                drop(done_tx);
                drop(jobs_rx);

                for (id, path) in files.iter().enumerate() {
                    let _ = jobs_tx.send(Job {
                        id,
                        path: path.clone(),
                        attempt: 0,
                    });
                }

                self.collect(&files, options, &jobs_tx, &done_rx, &mut slots);
                drop(jobs_tx);
            });
        }

        let results: Vec<FileReportEntry> = slots
            .into_iter()
            .zip(files)
            .map(|(slot, path)| {
                // Unreachable in practice: collect() accounts for every id.
                slot.unwrap_or_else(|| FileReportEntry {
                    file_path: path,
                    success: false,
                    status: JobStatus::Failed,
                    data: None,
                    error: Some("job produced no outcome".to_string()),
                })
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
        let failed = total - successful - skipped;

        info!(total, successful, failed, skipped, "batch complete");
        BatchReport {
            results,
            metadata: BatchMetadata {
                total_files: total,
                successful_files: successful,
                failed_files: failed,
                skipped_files: skipped,
                generation_time: now_ms(),
                client_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }

    fn collect(
        &self,
        files: &[PathBuf],
        options: &BatchOptions,
        jobs_tx: &Sender<Job>,
        done_rx: &Receiver<JobDone>,
        slots: &mut [Option<FileReportEntry>],
    ) {
        let batch_deadline = options.batch_timeout.map(|d| Instant::now() + d);
        let mut pending = files.len();

        while pending > 0 {
            if let Some(deadline) = batch_deadline {
                if Instant::now() >= deadline && !self.cancel.load(AtomicOrdering::SeqCst) {
                    warn!("batch deadline reached; cancelling undispatched jobs");
                    self.cancel.store(true, AtomicOrdering::SeqCst);
                }
            }

            let done = match done_rx.recv_timeout(Duration::from_millis(50)) {
                Ok(done) => done,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let path = files[done.id].clone();
            let entry = match done.verdict {
                Verdict::Succeeded(outcome) => FileReportEntry {
                    file_path: path,
                    success: true,
                    status: JobStatus::Succeeded,
                    data: Some(*outcome),
                    error: None,
                },
                Verdict::Retryable(reason) => {
                    let cancelled = self.cancel.load(AtomicOrdering::SeqCst);
                    let budget_left = done.attempt < options.retries;
                    if budget_left && !cancelled {
                        info!(
                            file = %path.display(),
                            attempt = done.attempt + 1,
                            reason,
                            "transient failure; job re-queued"
                        );
                        let _ = jobs_tx.send(Job {
                            id: done.id,
                            path,
                            attempt: done.attempt + 1,
                        });
                        continue;
                    }
                    let error = if budget_left {
                        format!("batch cancelled before retry: {reason}")
                    } else {
                        format!(
                            "retries exhausted after {} attempts: {reason}",
                            done.attempt + 1
                        )
                    };
                    FileReportEntry {
                        file_path: path,
                        success: false,
                        status: JobStatus::Failed,
                        data: None,
                        error: Some(error),
                    }
                }
                Verdict::Failed(reason) => FileReportEntry {
                    file_path: path,
                    success: false,
                    status: JobStatus::Failed,
                    data: None,
                    error: Some(reason),
                },
                Verdict::TimedOut => FileReportEntry {
                    file_path: path,
                    success: false,
                    status: JobStatus::TimedOut,
                    data: None,
                    error: Some(format!(
                        "job exceeded its {}s timeout",
                        options.job_timeout.as_secs()
                    )),
                },
                Verdict::Skipped => FileReportEntry {
                    file_path: path,
                    success: false,
                    status: JobStatus::Skipped,
                    data: None,
                    error: Some("batch cancelled before the job started".to_string()),
                },
            };
            slots[done.id] = Some(entry);
            pending -= 1;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    worker_id: usize,
    engine: &dyn DiffEngine,
    corpus: &CorpusIndex,
    request: &SearchRequest,
    job_timeout: Duration,
    retry_backoff: Duration,
    cancel: &AtomicBool,
    jobs_rx: &Receiver<Job>,
    done_tx: &Sender<JobDone>,
    progress: &Mutex<Progress>,
    total: usize,
) {
    debug!(worker_id, "worker started");
    while let Ok(job) = jobs_rx.recv() {
        let verdict = if cancel.load(AtomicOrdering::SeqCst) {
            Verdict::Skipped
        } else {
            if job.attempt > 0 {
                // Exponential backoff before a retry attempt.
                let delay = retry_backoff * 2u32.saturating_pow(job.attempt - 1);
                thread::sleep(delay);
            }
            run_job(engine, corpus, request, job_timeout, &job)
        };

        {
            let mut p = progress.lock();
            p.completed += 1;
            if !matches!(verdict, Verdict::Succeeded(_) | Verdict::Retryable(_)) {
                p.failed += 1;
            }
            if matches!(
                verdict,
                Verdict::Succeeded(_) | Verdict::Failed(_) | Verdict::TimedOut
            ) {
                info!(
                    file = %job.path.display(),
                    completed = p.completed,
                    total,
                    failed = p.failed,
                    "job finished"
                );
            }
        }

        if done_tx
            .send(JobDone {
                id: job.id,
                attempt: job.attempt,
                verdict,
            })
            .is_err()
        {
            break;
        }
    }
    debug!(worker_id, "worker stopped");
}

/// Run one job attempt end to end.
///
/// The scoped working directory is created first and dropped on every return
/// path, so the job always reaches `Cleaned` no matter how it ended.
fn run_job(
    engine: &dyn DiffEngine,
    corpus: &CorpusIndex,
    request: &SearchRequest,
    job_timeout: Duration,
    job: &Job,
) -> Verdict {
    let deadline = Instant::now() + job_timeout;

    let work_dir = match TempDir::new() {
        Ok(dir) => dir,
        Err(err) => {
            error!(file = %job.path.display(), error = %err, "failed to create working directory");
            return Verdict::Failed(format!("failed to create working directory: {err}"));
        }
    };
    debug!(
        file = %job.path.display(),
        work_dir = %work_dir.path().display(),
        attempt = job.attempt,
        "job running"
    );

    let artifact = match engine.prepare(&job.path, work_dir.path()) {
        Ok(artifact) => artifact,
        Err(err) if err.is_retryable() => return Verdict::Retryable(err.to_string()),
        Err(err) => return Verdict::Failed(err.to_string()),
    };

    let coordinator = SearchCoordinator::new(engine);
    match coordinator.search(&artifact, request, corpus, Some(deadline)) {
        Ok(outcome) => Verdict::Succeeded(Box::new(outcome)),
        Err(_) => Verdict::TimedOut,
    }
    // work_dir drops here: Cleaned on success, failure, and timeout alike.
}
