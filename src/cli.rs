//! Command-line interface.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::batch::scanner::ScanOptions;
use crate::batch::{BatchOptions, BatchOrchestrator};
use crate::config::AppConfig;
use crate::corpus::CorpusHandle;
use crate::engine::{CompareError, DiffEngine, ExternalEngine, HashEngine};
use crate::report;
use crate::search::{filtered_view, FilterPolicy, SearchCoordinator, SearchRequest};

#[derive(Parser, Debug)]
#[command(name = "binsim", version, about = "Binary similarity search against a reference corpus")]
pub struct Cli {
    /// Alternate config file (default: ~/.config/binsim/config.toml).
    #[arg(long, global = true, env = "BINSIM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Corpus description file.
    #[arg(long, global = true, env = "BINSIM_CORPUS")]
    pub corpus: Option<PathBuf>,

    /// Explicit diff tool path; falls back to PATH lookup, then to the
    /// in-process hash engine.
    #[arg(long, global = true, env = "BINSIM_DIFF_TOOL")]
    pub diff_tool: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Rank one binary against the corpus.
    Search {
        /// Query binary.
        query: PathBuf,

        /// Requested result count (1..=50; anything else uses the default).
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Only report matches from these families (repeatable).
        #[arg(long = "family")]
        families: Vec<String>,

        /// Drop matches below this similarity.
        #[arg(long)]
        min_similarity: Option<f64>,

        /// Apply family/similarity filters before top-K truncation instead
        /// of to the finished ranking.
        #[arg(long)]
        pre_filter: bool,

        /// Write the outcome as JSON here instead of printing a summary.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Process every executable under a directory.
    Batch {
        /// Directory to scan for query binaries.
        input_dir: PathBuf,

        /// Scan the top level only.
        #[arg(long)]
        no_recursive: bool,

        /// Worker pool size.
        #[arg(short, long)]
        workers: Option<usize>,

        /// Per-job timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,

        /// Whole-batch timeout in seconds.
        #[arg(long)]
        batch_timeout: Option<u64>,

        /// Retry budget for transient engine failures.
        #[arg(long)]
        retries: Option<u32>,

        /// Stop discovery after this many candidates.
        #[arg(long)]
        max_files: Option<usize>,

        /// Requested result count per file.
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Report destination.
        #[arg(short, long, default_value = "binsim_report.json")]
        output: PathBuf,
    },

    /// Corpus inspection.
    #[command(subcommand)]
    Corpus(CorpusCommands),

    /// Operations on saved batch reports.
    #[command(subcommand)]
    Report(ReportCommands),
}

#[derive(Subcommand, Debug)]
pub enum CorpusCommands {
    /// Show family counts and totals.
    Info,
    /// Check records for missing artifacts, duplicate or malformed hashes.
    Validate,
}

#[derive(Subcommand, Debug)]
pub enum ReportCommands {
    /// Derive a filtered view of a saved report.
    Filter {
        /// Saved report to filter.
        report: PathBuf,

        /// Drop matches below this similarity.
        #[arg(long)]
        min_similarity: Option<f64>,

        /// Only keep matches from these families (repeatable).
        #[arg(long = "family")]
        families: Vec<String>,

        /// Where to write the filtered report.
        #[arg(short, long)]
        output: PathBuf,
    },
}

pub fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => AppConfig::load().context("loading config")?,
    };
    if cli.corpus.is_some() {
        config.corpus_path = cli.corpus.clone();
    }
    if cli.diff_tool.is_some() {
        config.diff_tool = cli.diff_tool.clone();
    }

    match cli.command {
        Commands::Search {
            query,
            top_k,
            families,
            min_similarity,
            pre_filter,
            output,
        } => {
            let corpus = open_corpus(&config)?;
            let engine = select_engine(&config);
            let request = SearchRequest {
                k: top_k.or(config.top_k),
                family_filter: family_set(&families, &config),
                min_similarity: min_similarity.or(config.min_similarity),
                policy: if pre_filter {
                    FilterPolicy::PreTruncation
                } else {
                    FilterPolicy::PostTruncation
                },
            };

            let snapshot = corpus.snapshot();
            let work_dir = tempfile::TempDir::new().context("creating working directory")?;
            let artifact = engine
                .prepare(&query, work_dir.path())
                .with_context(|| format!("preparing query {}", query.display()))?;
            let coordinator = SearchCoordinator::new(engine.as_ref());
            let outcome = match coordinator.search(&artifact, &request, &snapshot, None) {
                Ok(outcome) => outcome,
                Err(_) => bail!("search aborted by deadline"),
            };

            let matches = if request.policy == FilterPolicy::PostTruncation {
                filtered_view(
                    &outcome,
                    request.min_similarity,
                    request.family_filter.as_ref(),
                )
            } else {
                outcome.matches.clone()
            };

            if let Some(path) = output {
                // The written outcome carries the same view the console
                // would show, not the unfiltered ranking.
                let mut written = outcome.clone();
                written.matches = matches;
                let json = serde_json::to_string_pretty(&written)?;
                std::fs::write(&path, json)
                    .with_context(|| format!("writing {}", path.display()))?;
                info!(path = %path.display(), "outcome written");
            } else {
                println!(
                    "query: {} ({} candidates, {} compare failures, {} ms)",
                    outcome.query.display(),
                    outcome.corpus_size,
                    outcome.engine_failure_count,
                    outcome.duration_ms
                );
                if matches.is_empty() {
                    println!("no matches");
                }
                for m in &matches {
                    println!(
                        "{:>3}. {:<12} sim={:.4} conf={:.4} funcs={:>5} {}",
                        m.rank, m.family, m.similarity, m.confidence, m.matched_function_count, m.hash
                    );
                }
            }
            Ok(())
        }

        Commands::Batch {
            input_dir,
            no_recursive,
            workers,
            timeout,
            batch_timeout,
            retries,
            max_files,
            top_k,
            output,
        } => {
            let corpus = open_corpus(&config)?;
            let engine = select_engine(&config);
            let options = BatchOptions {
                scan: ScanOptions {
                    recursive: !no_recursive,
                    max_files,
                    max_input_bytes: config.max_input_bytes,
                },
                workers: workers.unwrap_or(config.workers),
                job_timeout: Duration::from_secs(timeout.unwrap_or(config.job_timeout_secs)),
                batch_timeout: batch_timeout.map(Duration::from_secs),
                retries: retries.unwrap_or(config.retries),
                retry_backoff: crate::batch::DEFAULT_RETRY_BACKOFF,
                request: SearchRequest {
                    k: top_k.or(config.top_k),
                    ..Default::default()
                },
            };

            let orchestrator = BatchOrchestrator::new(engine.as_ref(), corpus.snapshot());
            let batch_report = orchestrator
                .run(&input_dir, &options)
                .with_context(|| format!("scanning {}", input_dir.display()))?;
            report::save(&batch_report, &output)?;

            let m = &batch_report.metadata;
            println!(
                "batch complete: {} files, {} succeeded, {} failed, {} skipped",
                m.total_files, m.successful_files, m.failed_files, m.skipped_files
            );
            println!("report: {}", output.display());
            Ok(())
        }

        Commands::Corpus(command) => {
            let corpus = open_corpus(&config)?;
            let snapshot = corpus.snapshot();
            match command {
                CorpusCommands::Info => {
                    let stats = snapshot.stats();
                    println!("corpus: {}", snapshot.source().display());
                    println!("samples: {}", stats.total_samples);
                    for (family, count) in &stats.per_family_counts {
                        println!("  {family:<16} {count}");
                    }
                }
                CorpusCommands::Validate => {
                    let issues = snapshot.validate();
                    if issues.is_empty() {
                        println!("corpus ok: {} samples", snapshot.len());
                    } else {
                        for issue in &issues {
                            println!("{issue}");
                        }
                        bail!("{} validation issue(s) found", issues.len());
                    }
                }
            }
            Ok(())
        }

        Commands::Report(ReportCommands::Filter {
            report: report_path,
            min_similarity,
            families,
            output,
        }) => {
            let loaded = report::load(&report_path)?;
            let families = family_set(&families, &config);
            let view = report::filter_report(
                &loaded,
                min_similarity.or(config.min_similarity),
                families.as_ref(),
            );
            report::save(&view, &output)?;
            let m = &view.metadata;
            println!(
                "filtered report: {} succeeded, {} failed, {} skipped",
                m.successful_files, m.failed_files, m.skipped_files
            );
            Ok(())
        }
    }
}

fn open_corpus(config: &AppConfig) -> Result<CorpusHandle> {
    let path = config
        .corpus_path
        .as_deref()
        .context("no corpus configured; pass --corpus or set corpus_path in the config file")?;
    let handle =
        CorpusHandle::open(path).with_context(|| format!("loading corpus {}", path.display()))?;
    Ok(handle)
}

/// Pick the best available engine: configured tool, then PATH lookup, then
/// the in-process fallback.
fn select_engine(config: &AppConfig) -> Box<dyn DiffEngine> {
    match ExternalEngine::locate(config.diff_tool.as_deref()) {
        Ok(engine) => Box::new(engine),
        Err(CompareError::ServiceUnavailable(reason)) => {
            warn!(reason, "no external diff tool; using the hash engine");
            Box::new(HashEngine)
        }
        Err(err) => {
            warn!(error = %err, "diff tool unusable; using the hash engine");
            Box::new(HashEngine)
        }
    }
}

fn family_set(
    cli_families: &[String],
    config: &AppConfig,
) -> Option<BTreeSet<crate::model::Family>> {
    let source: &[String] = if cli_families.is_empty() {
        &config.families
    } else {
        cli_families
    };
    if source.is_empty() {
        return None;
    }
    Some(source.iter().map(|s| s.as_str().into()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn search_args_parse() {
        let cli = Cli::parse_from([
            "binsim",
            "--corpus",
            "/data/corpus.json",
            "search",
            "/tmp/query.exe",
            "-k",
            "20",
            "--family",
            "APT29",
            "--family",
            "Lazarus",
            "--min-similarity",
            "0.5",
        ]);
        match cli.command {
            Commands::Search {
                top_k,
                families,
                min_similarity,
                ..
            } => {
                assert_eq!(top_k, Some(20));
                assert_eq!(families, vec!["APT29", "Lazarus"]);
                assert_eq!(min_similarity, Some(0.5));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn batch_args_have_defaults() {
        let cli = Cli::parse_from(["binsim", "batch", "/samples"]);
        match cli.command {
            Commands::Batch {
                workers,
                output,
                no_recursive,
                ..
            } => {
                assert_eq!(workers, None);
                assert!(!no_recursive);
                assert_eq!(output, PathBuf::from("binsim_report.json"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn family_set_prefers_cli_over_config() {
        let config = AppConfig {
            families: vec!["Turla".to_string()],
            ..Default::default()
        };
        let cli_families = vec!["APT29".to_string()];
        let set = family_set(&cli_families, &config).unwrap();
        assert!(set.contains(&crate::model::Family::Apt29));
        assert!(!set.contains(&crate::model::Family::Turla));

        let fallback = family_set(&[], &config).unwrap();
        assert!(fallback.contains(&crate::model::Family::Turla));
    }
}
