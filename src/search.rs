use rayon::prelude::*;
use rustc_hash::FxHashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use thousands::Separable;

use crate::bucket::TableBlock;
use crate::error::{DlshError, Result};
use crate::family::HashFamily;
use crate::params::LshParams;
use crate::storage::{IndexStore, RoundState};
use crate::topk::{Candidate, CandidateTopK};
use crate::utils::PointSet;

/// The base radius of the ladder.
pub const THRESHOLD_RADIUS: i64 = 1;

///////////////////
// Radius ladder //
///////////////////

/// The geometric sequence of search radii
///
/// `radius[0] = 1`, `radius[i] = c · radius[i-1]`, so the ladder for
/// ratio 2 and three levels is `[1, 2, 4]`.
///
/// ### Params
///
/// * `ratio` - Approximation ratio c
/// * `n_radii` - Number of levels, fixed at build time
///
/// ### Returns
///
/// The radii in ascending order.
pub fn radius_ladder(ratio: i64, n_radii: usize) -> Vec<i64> {
    let mut radii = Vec::with_capacity(n_radii);
    if n_radii == 0 {
        return radii;
    }
    radii.push(THRESHOLD_RADIUS);
    for i in 1..n_radii {
        radii.push(ratio * radii[i - 1]);
    }
    radii
}

//////////////////
// Search state //
//////////////////

/// State of one query's radius-expanding search
///
/// A query leaves `Searching` only by collecting `k` neighbours
/// (`Converged`) or running out of radii (`Exhausted`). Exhaustion is a
/// normal, reportable outcome, not an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchState {
    Searching,
    Converged,
    Exhausted,
}

/// Final per-query result handed to the caller
///
/// Neighbours are in ascending-distance order. A query that exhausted the
/// ladder reports whatever it accumulated; the caller marks it "missing"
/// when fewer than `k` neighbours were found.
#[derive(Clone, Debug)]
pub struct SearchOutcome {
    pub query_id: usize,
    pub state: SearchState,
    pub neighbours: Vec<Candidate>,
}

impl SearchOutcome {
    /// True when the query exhausted the ladder short of `k` neighbours.
    pub fn is_missing(&self) -> bool {
        self.state == SearchState::Exhausted
    }
}

/// Aggregate counts over a batch of search outcomes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SearchReport {
    pub converged: usize,
    pub missing: usize,
}

/// Summarise a batch of outcomes into converged/missing counts.
pub fn summarise(outcomes: &[SearchOutcome]) -> SearchReport {
    let mut report = SearchReport::default();
    for outcome in outcomes {
        if outcome.is_missing() {
            report.missing += 1;
        } else {
            report.converged += 1;
        }
    }
    report
}

//////////////////////
// Radius expansion //
//////////////////////

/// The radius-expanding search over a built bucket index
///
/// Drives every query through increasing radii. At each radius level the
/// query is hashed into every table in block order, collided indices are
/// collected under the prune budget, exact distances are checked per
/// dataset split into partial top-k structures and merged into the carried
/// state, and the convergence rule decides whether the query stops or
/// advances carrying its accumulated candidates. Queries are independent
/// and run fully concurrently; within one query, radius rounds are
/// strictly sequential.
///
/// ### Fields
///
/// * `params` - Finalised LSH parameters
/// * `family` - Read-only hash family, shared across all query tasks
/// * `blocks` - Bucket indexes as `[radius_level][block]`, read-only
/// * `points` - The dataset, for exact distance evaluation
/// * `k` - Number of neighbours to find per query
/// * `prune_factor` - Cap multiplier on collision inspections per radius
/// * `split_count` - Dataset splits for the distance-check fan-out
/// * `verbose` - Controls progress printing
pub struct RadiusSearch<'a> {
    params: &'a LshParams,
    family: &'a HashFamily,
    blocks: &'a [Vec<TableBlock>],
    points: &'a PointSet,
    k: usize,
    prune_factor: usize,
    split_count: usize,
    verbose: bool,
}

impl<'a> RadiusSearch<'a> {
    /// Set up a search over a built index
    ///
    /// ### Params
    ///
    /// * `params` - Finalised LSH parameters
    /// * `family` - The hash family the index was built with
    /// * `blocks` - Bucket indexes per radius level and block
    /// * `points` - The dataset
    /// * `k` - Neighbours to find per query
    /// * `prune_factor` - Accuracy/performance budget, at least 1
    /// * `split_count` - Dataset splits for distance checking, at least 1
    /// * `verbose` - Print progress information
    ///
    /// ### Returns
    ///
    /// The configured search, or a fatal parameter error.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: &'a LshParams,
        family: &'a HashFamily,
        blocks: &'a [Vec<TableBlock>],
        points: &'a PointSet,
        k: usize,
        prune_factor: usize,
        split_count: usize,
        verbose: bool,
    ) -> Result<Self> {
        if k < 1 {
            return Err(DlshError::InvalidParameter("k must be positive".to_string()));
        }
        if prune_factor < 1 {
            return Err(DlshError::InvalidParameter(
                "pruneFactor must be positive".to_string(),
            ));
        }
        if split_count < 1 {
            return Err(DlshError::InvalidParameter(
                "split count must be positive".to_string(),
            ));
        }
        if blocks.is_empty() {
            return Err(DlshError::InvalidParameter(
                "bucket index has no radius levels".to_string(),
            ));
        }
        Ok(Self {
            params,
            family,
            blocks,
            points,
            k,
            prune_factor,
            split_count,
            verbose,
        })
    }

    /// The maximum number of raw collision inspections per radius round.
    pub fn search_threshold(&self) -> usize {
        self.prune_factor * self.params.table_count + self.k
    }

    /// Run the search for a whole query set
    ///
    /// Radius rounds proceed in ladder order; within a round all still
    /// searching queries run concurrently. Intermediate candidate state
    /// for queries that neither converged nor exhausted is persisted to
    /// the store after each round and reloaded at the next, so the round
    /// boundary matches the distributed realisation.
    ///
    /// ### Params
    ///
    /// * `store` - Store for per-round intermediate state
    /// * `queries` - The query set; query IDs are row indices
    ///
    /// ### Returns
    ///
    /// One outcome per query, indexed by query ID.
    pub fn run(&self, store: &IndexStore, queries: &PointSet) -> Result<Vec<SearchOutcome>> {
        assert!(
            queries.dim == self.points.dim,
            "Query dimensionality mismatch"
        );

        let n_radii = self.blocks.len();
        let radii = radius_ladder(self.params.ratio, n_radii);
        let counter = AtomicUsize::new(0);

        let mut active: Vec<usize> = (0..queries.n).collect();
        let mut finished: Vec<Option<SearchOutcome>> = (0..queries.n).map(|_| None).collect();

        for (radius_level, &radius) in radii.iter().enumerate() {
            if active.is_empty() {
                break;
            }
            if self.verbose {
                println!(
                    "Radius level {} (radius {}): {} queries searching.",
                    radius_level,
                    radius,
                    active.len().separate_with_underscores()
                );
            }

            let ratio_radius = (self.params.ratio * radius) as f64;

            let round: Vec<(usize, Option<SearchOutcome>)> = active
                .par_iter()
                .map(|&query_id| {
                    let outcome = self.search_round(
                        store,
                        queries,
                        query_id,
                        radius_level,
                        radius,
                        ratio_radius,
                        n_radii,
                    )?;

                    if self.verbose {
                        let count = counter.fetch_add(1, Ordering::Relaxed) + 1;
                        if count.is_multiple_of(100_000) {
                            println!(
                                "  Processed {} query rounds.",
                                count.separate_with_underscores()
                            );
                        }
                    }
                    Ok((query_id, outcome))
                })
                .collect::<Result<Vec<_>>>()?;

            let mut still_active = Vec::with_capacity(active.len());
            for (query_id, outcome) in round {
                match outcome {
                    Some(outcome) => finished[query_id] = Some(outcome),
                    None => still_active.push(query_id),
                }
            }
            active = still_active;
        }

        let outcomes: Vec<SearchOutcome> = finished.into_iter().flatten().collect();
        debug_assert_eq!(outcomes.len(), queries.n);
        Ok(outcomes)
    }

    /// One radius round for one query
    ///
    /// Returns the final outcome when the query converged or exhausted,
    /// or `None` after persisting the carried state for the next round.
    #[allow(clippy::too_many_arguments)]
    fn search_round(
        &self,
        store: &IndexStore,
        queries: &PointSet,
        query_id: usize,
        radius_level: usize,
        radius: i64,
        ratio_radius: f64,
        n_radii: usize,
    ) -> Result<Option<SearchOutcome>> {
        let query = queries.point(query_id);

        // Round r+1 starts from round r's persisted state; the evaluated
        // set comes back reconstructed from the kept candidates only.
        let mut carried = if radius_level == 0 {
            CandidateTopK::new(query_id, self.k)
        } else {
            store
                .load_round_state(radius_level - 1, query_id)?
                .into_topk()
        };

        let (candidates, _search_count) = self.collect_candidates(radius_level, radius, query)?;
        self.check_candidates(query_id, query, &candidates, ratio_radius, &mut carried);

        if carried.len() == self.k {
            return Ok(Some(SearchOutcome {
                query_id,
                state: SearchState::Converged,
                neighbours: carried.sorted(),
            }));
        }
        if radius_level + 1 == n_radii {
            // Out of radii: report whatever accumulated as a partial
            // result.
            return Ok(Some(SearchOutcome {
                query_id,
                state: SearchState::Exhausted,
                neighbours: carried.sorted(),
            }));
        }

        // Still searching. Queries without any collision this round also
        // persist state so they are searched again at the next radius.
        store.save_round_state(radius_level, &RoundState::from_topk(self.params.dim, &carried))?;
        Ok(None)
    }

    /// Collect collided point indices for one query at one radius
    ///
    /// Walks the tables in block order, fetches the query's bucket in
    /// each and gathers the indices found there. Every bucket entry
    /// counts against the prune threshold `pruneFactor · L + k` before
    /// deduplication; once the threshold is reached the scan stops, even
    /// mid-table.
    ///
    /// ### Params
    ///
    /// * `radius_level` - Index into the radius ladder
    /// * `radius` - The radius at this level
    /// * `query` - The query point
    ///
    /// ### Returns
    ///
    /// The deduplicated candidate set and the raw collision count.
    fn collect_candidates(
        &self,
        radius_level: usize,
        radius: i64,
        query: &[i32],
    ) -> Result<(FxHashSet<usize>, usize)> {
        let threshold = self.search_threshold();
        let mut collected = FxHashSet::default();
        let mut search_count = 0usize;

        'tables: for block in &self.blocks[radius_level] {
            for local_table in 0..block.table_count() {
                let table = block.table_offset + local_table;
                let bucket_id = self.family.bucket_id(self.params, table, radius, query)?;

                for &index in block.get(local_table, bucket_id) {
                    search_count += 1;
                    collected.insert(index);
                    if search_count >= threshold {
                        break 'tables;
                    }
                }
            }
        }

        Ok((collected, search_count))
    }

    /// Check collected candidates and merge into the carried state
    ///
    /// Candidates are grouped by dataset split; each split produces an
    /// independent partial top-k (exact distances, acceptance bound
    /// `c · radius`), and the partials merge into the carried state in
    /// split order. Indices the carried state already evaluated are
    /// skipped by the merge.
    fn check_candidates(
        &self,
        query_id: usize,
        query: &[i32],
        candidates: &FxHashSet<usize>,
        ratio_radius: f64,
        carried: &mut CandidateTopK,
    ) {
        let chunk = self.points.n.div_ceil(self.split_count);
        let mut splits: Vec<Vec<usize>> = vec![Vec::new(); self.split_count];
        for &index in candidates {
            splits[index / chunk].push(index);
        }

        let partials: Vec<CandidateTopK> = splits
            .par_iter()
            .map(|split| {
                let mut partial = CandidateTopK::new(query_id, self.k);
                for &index in split {
                    partial.update(index, self.points.point(index), query, ratio_radius);
                }
                partial
            })
            .collect();

        for partial in partials {
            carried.merge(partial);
        }
    }
}

///////////
// Tests //
///////////
