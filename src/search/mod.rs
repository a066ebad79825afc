//! Ranking one query against a corpus snapshot.
//!
//! The coordinator fans the per-candidate compares out over a bounded rayon
//! pool, aggregates by candidate index (never by completion order), then
//! applies the deterministic ordering rule: similarity descending, ties by
//! confidence descending, remaining ties by corpus insertion index ascending.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::corpus::CorpusIndex;
use crate::engine::{Artifact, DiffEngine};
use crate::model::types::now_ms;
use crate::model::{Family, MatchResult, SearchOutcome};

/// Requested result count bounds.
pub const MAX_TOP_K: usize = 50;
pub const DEFAULT_TOP_K: usize = 10;

/// Whether similarity/family filters apply before or after top-K truncation.
///
/// The server-side ranking historically returned an unfiltered top-K and the
/// caller filtered afterwards, so `PostTruncation` is the default. Callers
/// who want K surviving matches pick `PreTruncation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterPolicy {
    #[default]
    PostTruncation,
    PreTruncation,
}

/// Parameters for one search.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub k: Option<usize>,
    pub family_filter: Option<BTreeSet<Family>>,
    pub min_similarity: Option<f64>,
    pub policy: FilterPolicy,
}

impl SearchRequest {
    /// Effective K. A request inside `1..=50` is honored verbatim; zero or
    /// anything above the cap resets to the default rather than clamping.
    pub fn effective_k(&self) -> usize {
        match self.k {
            Some(k) if (1..=MAX_TOP_K).contains(&k) => k,
            _ => DEFAULT_TOP_K,
        }
    }
}

/// The job's deadline was reached while compares were still pending.
#[derive(Debug)]
pub struct DeadlineExceeded;

/// Ranks queries against corpus snapshots using a borrowed engine.
pub struct SearchCoordinator<'a> {
    engine: &'a dyn DiffEngine,
}

impl<'a> SearchCoordinator<'a> {
    pub fn new(engine: &'a dyn DiffEngine) -> Self {
        Self { engine }
    }

    /// Score `query` against every eligible candidate in `snapshot` and
    /// return the ranked top-K outcome.
    ///
    /// Individual compare failures are counted and skipped, never fatal.
    /// If `deadline` passes before all candidates were compared, the search
    /// aborts with `DeadlineExceeded`; a compare already in flight is not
    /// interrupted mid-call.
    pub fn search(
        &self,
        query: &Artifact,
        request: &SearchRequest,
        snapshot: &CorpusIndex,
        deadline: Option<Instant>,
    ) -> Result<SearchOutcome, DeadlineExceeded> {
        let started = Instant::now();
        let k = request.effective_k();

        // Family restriction before any engine call saves the dominant cost,
        // but only when the caller asked for pre-truncation semantics; the
        // default ranks the whole corpus and filters afterwards.
        let candidates: Vec<(usize, &crate::model::SampleRecord)> = snapshot
            .records()
            .iter()
            .enumerate()
            .filter(|(_, record)| match (&request.policy, &request.family_filter) {
                (FilterPolicy::PreTruncation, Some(allow)) => allow.contains(&record.family),
                _ => true,
            })
            .collect();

        debug!(
            query = %query.source.display(),
            candidates = candidates.len(),
            k,
            "starting similarity search"
        );

        let failures = AtomicUsize::new(0);
        let timed_out = AtomicBool::new(false);

        let mut scored: Vec<(usize, MatchResult)> = candidates
            .par_iter()
            .filter_map(|(index, record)| {
                if timed_out.load(AtomicOrdering::Relaxed) {
                    return None;
                }
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        timed_out.store(true, AtomicOrdering::Relaxed);
                        return None;
                    }
                }
                if !record.path.exists() {
                    // Flagged by validation; degraded coverage, not an error.
                    warn!(candidate = %record.path.display(), "skipping missing artifact");
                    failures.fetch_add(1, AtomicOrdering::Relaxed);
                    return None;
                }
                let compared = self.engine.compare(query, &record.path);
                // A compare in flight is never interrupted, so the deadline
                // is re-checked once it returns.
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        timed_out.store(true, AtomicOrdering::Relaxed);
                        return None;
                    }
                }
                match compared {
                    Ok(cmp) => Some((
                        *index,
                        MatchResult {
                            family: record.family.clone(),
                            hash: record.hash.clone(),
                            path: record.path.clone(),
                            similarity: cmp.similarity,
                            confidence: cmp.confidence,
                            matched_function_count: cmp.matched_function_count,
                            rank: 0,
                        },
                    )),
                    Err(err) => {
                        warn!(
                            candidate = %record.path.display(),
                            error = %err,
                            "compare failed; candidate excluded"
                        );
                        failures.fetch_add(1, AtomicOrdering::Relaxed);
                        None
                    }
                }
            })
            .collect();

        if timed_out.load(AtomicOrdering::Relaxed) {
            return Err(DeadlineExceeded);
        }

        if let (FilterPolicy::PreTruncation, Some(floor)) =
            (request.policy, request.min_similarity)
        {
            scored.retain(|(_, m)| m.similarity >= floor);
        }

        // Deterministic order: similarity desc, confidence desc, insertion
        // index asc. total_cmp keeps the float sort totally ordered.
        scored.sort_by(|(ia, a), (ib, b)| {
            b.similarity
                .total_cmp(&a.similarity)
                .then(b.confidence.total_cmp(&a.confidence))
                .then(ia.cmp(ib))
        });
        scored.truncate(k);

        let matches: Vec<MatchResult> = scored
            .into_iter()
            .enumerate()
            .map(|(position, (_, mut m))| {
                m.rank = position + 1;
                m
            })
            .collect();

        let outcome = SearchOutcome {
            query: query.source.clone(),
            matches,
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp_ms: now_ms(),
            corpus_size: snapshot.len(),
            engine_failure_count: failures.load(AtomicOrdering::Relaxed),
        };
        info!(
            query = %outcome.query.display(),
            matches = outcome.matches.len(),
            failures = outcome.engine_failure_count,
            duration_ms = outcome.duration_ms,
            "search complete"
        );
        Ok(outcome)
    }
}

/// Apply min-similarity and family filters to an already-ranked outcome,
/// producing a filtered view without mutating the raw matches. Ranks are
/// renumbered within the view.
pub fn filtered_view(
    outcome: &SearchOutcome,
    min_similarity: Option<f64>,
    family_filter: Option<&BTreeSet<Family>>,
) -> Vec<MatchResult> {
    outcome
        .matches
        .iter()
        .filter(|m| min_similarity.is_none_or(|floor| m.similarity >= floor))
        .filter(|m| family_filter.is_none_or(|allow| allow.contains(&m.family)))
        .cloned()
        .enumerate()
        .map(|(position, mut m)| {
            m.rank = position + 1;
            m
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Artifact, CompareError, Comparison};
    use crate::model::SampleRecord;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    /// Engine scripted per candidate path; unknown paths fail the compare.
    struct ScriptedEngine {
        scores: HashMap<PathBuf, (f64, f64, u64)>,
    }

    impl ScriptedEngine {
        fn new(entries: &[(&Path, f64, f64, u64)]) -> Self {
            Self {
                scores: entries
                    .iter()
                    .map(|(p, s, c, f)| (p.to_path_buf(), (*s, *c, *f)))
                    .collect(),
            }
        }
    }

    impl DiffEngine for ScriptedEngine {
        fn prepare(&self, query: &Path, work_dir: &Path) -> Result<Artifact, CompareError> {
            Ok(Artifact {
                source: query.to_path_buf(),
                prepared: work_dir.join("query.prepared"),
            })
        }

        fn compare(&self, _query: &Artifact, candidate: &Path) -> Result<Comparison, CompareError> {
            match self.scores.get(candidate) {
                Some((similarity, confidence, matched)) => Ok(Comparison {
                    similarity: *similarity,
                    confidence: *confidence,
                    matched_function_count: *matched,
                }),
                None => Err(CompareError::EngineCrash("unscripted candidate".into())),
            }
        }
    }

    fn corpus_with_existing_paths(
        dir: &tempfile::TempDir,
        specs: &[(Family, u8)],
    ) -> (CorpusIndex, Vec<PathBuf>) {
        let mut records = Vec::new();
        let mut paths = Vec::new();
        for (i, (family, seed)) in specs.iter().enumerate() {
            let path = dir.path().join(format!("sample-{i}.BinExport"));
            std::fs::write(&path, [*seed]).unwrap();
            records.push(SampleRecord {
                family: family.clone(),
                hash: format!("{seed:02x}").repeat(32),
                path: path.clone(),
            });
            paths.push(path);
        }
        (CorpusIndex::from_records(records), paths)
    }

    fn query_artifact() -> Artifact {
        Artifact {
            source: PathBuf::from("/tmp/query.exe"),
            prepared: PathBuf::from("/tmp/work/query.prepared"),
        }
    }

    #[test]
    fn confidence_breaks_similarity_ties() {
        let dir = tempfile::TempDir::new().unwrap();
        let (corpus, paths) = corpus_with_existing_paths(
            &dir,
            &[(Family::Patchwork, 1), (Family::Patchwork, 2)],
        );
        let engine = ScriptedEngine::new(&[
            (&paths[0], 0.90, 0.80, 10),
            (&paths[1], 0.90, 0.95, 12),
        ]);
        let coordinator = SearchCoordinator::new(&engine);

        let request = SearchRequest {
            k: Some(5),
            ..Default::default()
        };
        let outcome = coordinator
            .search(&query_artifact(), &request, &corpus, None)
            .unwrap();

        assert_eq!(outcome.matches[0].hash, "02".repeat(32));
        assert_eq!(outcome.matches[0].rank, 1);
        assert_eq!(outcome.matches[1].hash, "01".repeat(32));
    }

    #[test]
    fn k_of_one_returns_only_the_tie_break_winner() {
        let dir = tempfile::TempDir::new().unwrap();
        let (corpus, paths) = corpus_with_existing_paths(
            &dir,
            &[(Family::Patchwork, 1), (Family::Patchwork, 2)],
        );
        let engine = ScriptedEngine::new(&[
            (&paths[0], 0.90, 0.80, 10),
            (&paths[1], 0.90, 0.95, 12),
        ]);
        let coordinator = SearchCoordinator::new(&engine);

        let request = SearchRequest {
            k: Some(1),
            ..Default::default()
        };
        let outcome = coordinator
            .search(&query_artifact(), &request, &corpus, None)
            .unwrap();

        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].hash, "02".repeat(32));
        assert_eq!(outcome.matches[0].rank, 1);
    }

    #[test]
    fn insertion_index_breaks_full_ties() {
        let dir = tempfile::TempDir::new().unwrap();
        let (corpus, paths) = corpus_with_existing_paths(
            &dir,
            &[(Family::Turla, 3), (Family::Turla, 4), (Family::Turla, 5)],
        );
        let engine = ScriptedEngine::new(&[
            (&paths[0], 0.7, 0.5, 1),
            (&paths[1], 0.7, 0.5, 1),
            (&paths[2], 0.7, 0.5, 1),
        ]);
        let coordinator = SearchCoordinator::new(&engine);

        let outcome = coordinator
            .search(&query_artifact(), &SearchRequest::default(), &corpus, None)
            .unwrap();
        let hashes: Vec<&str> = outcome.matches.iter().map(|m| m.hash.as_str()).collect();
        let expected = ["03".repeat(32), "04".repeat(32), "05".repeat(32)];
        assert_eq!(
            hashes,
            expected.iter().map(String::as_str).collect::<Vec<_>>()
        );
    }

    #[test]
    fn k_larger_than_corpus_returns_all_without_padding() {
        let dir = tempfile::TempDir::new().unwrap();
        let (corpus, paths) = corpus_with_existing_paths(
            &dir,
            &[(Family::Apt29, 6), (Family::Apt29, 7), (Family::Apt29, 8)],
        );
        let engine = ScriptedEngine::new(&[
            (&paths[0], 0.3, 0.9, 2),
            (&paths[1], 0.2, 0.9, 2),
            (&paths[2], 0.1, 0.9, 2),
        ]);
        let coordinator = SearchCoordinator::new(&engine);

        let request = SearchRequest {
            k: Some(10),
            ..Default::default()
        };
        let outcome = coordinator
            .search(&query_artifact(), &request, &corpus, None)
            .unwrap();
        assert_eq!(outcome.matches.len(), 3);
    }

    #[test]
    fn empty_corpus_yields_empty_non_error_outcome() {
        let corpus = CorpusIndex::from_records(Vec::new());
        let engine = ScriptedEngine::new(&[]);
        let coordinator = SearchCoordinator::new(&engine);

        let outcome = coordinator
            .search(&query_artifact(), &SearchRequest::default(), &corpus, None)
            .unwrap();
        assert!(outcome.matches.is_empty());
        assert_eq!(outcome.corpus_size, 0);
        assert_eq!(outcome.engine_failure_count, 0);
    }

    #[test]
    fn compare_failure_skips_candidate_and_counts_it() {
        let dir = tempfile::TempDir::new().unwrap();
        let (corpus, paths) =
            corpus_with_existing_paths(&dir, &[(Family::Lazarus, 9), (Family::Lazarus, 10)]);
        // Only the second candidate is scripted; the first fails.
        let engine = ScriptedEngine::new(&[(&paths[1], 0.8, 0.8, 4)]);
        let coordinator = SearchCoordinator::new(&engine);

        let outcome = coordinator
            .search(&query_artifact(), &SearchRequest::default(), &corpus, None)
            .unwrap();
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].hash, "0a".repeat(32));
        assert_eq!(outcome.engine_failure_count, 1);
    }

    #[test]
    fn all_compares_failing_is_not_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let (corpus, _paths) =
            corpus_with_existing_paths(&dir, &[(Family::Winnti, 11), (Family::Winnti, 12)]);
        let engine = ScriptedEngine::new(&[]);
        let coordinator = SearchCoordinator::new(&engine);

        let outcome = coordinator
            .search(&query_artifact(), &SearchRequest::default(), &corpus, None)
            .unwrap();
        assert!(outcome.matches.is_empty());
        assert_eq!(outcome.engine_failure_count, 2);
    }

    #[test]
    fn repeated_searches_are_deterministic() {
        let dir = tempfile::TempDir::new().unwrap();
        let specs: Vec<(Family, u8)> = (0..20u8).map(|i| (Family::Patchwork, i + 20)).collect();
        let (corpus, paths) = corpus_with_existing_paths(&dir, &specs);
        let entries: Vec<(&Path, f64, f64, u64)> = paths
            .iter()
            .enumerate()
            .map(|(i, p)| (p.as_path(), 0.5 + (i % 3) as f64 * 0.1, 0.5, 1))
            .collect();
        let engine = ScriptedEngine::new(&entries);
        let coordinator = SearchCoordinator::new(&engine);

        let a = coordinator
            .search(&query_artifact(), &SearchRequest::default(), &corpus, None)
            .unwrap();
        let b = coordinator
            .search(&query_artifact(), &SearchRequest::default(), &corpus, None)
            .unwrap();
        let order_a: Vec<&str> = a.matches.iter().map(|m| m.hash.as_str()).collect();
        let order_b: Vec<&str> = b.matches.iter().map(|m| m.hash.as_str()).collect();
        assert_eq!(order_a, order_b);
    }

    #[test]
    fn pre_truncation_family_filter_restricts_candidates() {
        let dir = tempfile::TempDir::new().unwrap();
        let (corpus, paths) = corpus_with_existing_paths(
            &dir,
            &[(Family::Patchwork, 30), (Family::Apt29, 31)],
        );
        let engine = ScriptedEngine::new(&[
            (&paths[0], 0.9, 0.9, 5),
            (&paths[1], 0.99, 0.9, 5),
        ]);
        let coordinator = SearchCoordinator::new(&engine);

        let request = SearchRequest {
            family_filter: Some([Family::Patchwork].into_iter().collect()),
            policy: FilterPolicy::PreTruncation,
            ..Default::default()
        };
        let outcome = coordinator
            .search(&query_artifact(), &request, &corpus, None)
            .unwrap();
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].family, Family::Patchwork);
    }

    #[test]
    fn post_truncation_ranks_unfiltered_and_view_filters() {
        let dir = tempfile::TempDir::new().unwrap();
        let (corpus, paths) = corpus_with_existing_paths(
            &dir,
            &[(Family::Patchwork, 32), (Family::Apt29, 33)],
        );
        let engine = ScriptedEngine::new(&[
            (&paths[0], 0.9, 0.9, 5),
            (&paths[1], 0.99, 0.9, 5),
        ]);
        let coordinator = SearchCoordinator::new(&engine);

        let request = SearchRequest {
            family_filter: Some([Family::Patchwork].into_iter().collect()),
            ..Default::default()
        };
        let outcome = coordinator
            .search(&query_artifact(), &request, &corpus, None)
            .unwrap();
        // Raw ranking is unfiltered under the default policy.
        assert_eq!(outcome.matches.len(), 2);
        assert_eq!(outcome.matches[0].family, Family::Apt29);

        let view = filtered_view(&outcome, None, request.family_filter.as_ref());
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].family, Family::Patchwork);
        assert_eq!(view[0].rank, 1);
    }

    #[test]
    fn neutral_filter_view_equals_raw_ranking() {
        let dir = tempfile::TempDir::new().unwrap();
        let (corpus, paths) = corpus_with_existing_paths(
            &dir,
            &[(Family::Turla, 34), (Family::Winnti, 35)],
        );
        let engine = ScriptedEngine::new(&[
            (&paths[0], 0.4, 0.6, 1),
            (&paths[1], 0.6, 0.6, 1),
        ]);
        let coordinator = SearchCoordinator::new(&engine);

        let outcome = coordinator
            .search(&query_artifact(), &SearchRequest::default(), &corpus, None)
            .unwrap();
        let view = filtered_view(&outcome, Some(0.0), None);
        let raw: Vec<&str> = outcome.matches.iter().map(|m| m.hash.as_str()).collect();
        let filtered: Vec<String> = view.iter().map(|m| m.hash.clone()).collect();
        assert_eq!(raw, filtered.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[test]
    fn expired_deadline_aborts_with_timeout() {
        let dir = tempfile::TempDir::new().unwrap();
        let (corpus, paths) =
            corpus_with_existing_paths(&dir, &[(Family::Turla, 36), (Family::Turla, 37)]);
        let engine = ScriptedEngine::new(&[
            (&paths[0], 0.4, 0.6, 1),
            (&paths[1], 0.6, 0.6, 1),
        ]);
        let coordinator = SearchCoordinator::new(&engine);

        let deadline = Instant::now() - std::time::Duration::from_millis(1);
        let result = coordinator.search(
            &query_artifact(),
            &SearchRequest::default(),
            &corpus,
            Some(deadline),
        );
        assert!(result.is_err());
    }

    #[test]
    fn effective_k_resets_out_of_range_requests() {
        let request = |k| SearchRequest {
            k: Some(k),
            ..Default::default()
        };
        assert_eq!(request(1).effective_k(), 1);
        assert_eq!(request(MAX_TOP_K).effective_k(), MAX_TOP_K);
        assert_eq!(request(0).effective_k(), DEFAULT_TOP_K);
        assert_eq!(request(500).effective_k(), DEFAULT_TOP_K);
        assert_eq!(SearchRequest::default().effective_k(), DEFAULT_TOP_K);
    }
}
