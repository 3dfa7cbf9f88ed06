#![allow(clippy::needless_range_loop)] // I want these loops!

pub mod bucket;
pub mod error;
pub mod family;
pub mod params;
pub mod search;
pub mod storage;
pub mod topk;
pub mod utils;

use thousands::Separable;

use crate::bucket::{build_blocks, divide_tables};
pub use crate::bucket::{BucketTable, TableBlock};
pub use crate::error::{DlshError, Result};
pub use crate::family::HashFamily;
pub use crate::params::{DatasetStats, LshParams, WIDTH};
pub use crate::search::{
    radius_ladder, summarise, RadiusSearch, SearchOutcome, SearchReport, SearchState,
};
pub use crate::storage::{IndexStore, ParameterBlob, RoundState};
pub use crate::topk::{Candidate, CandidateTopK};
pub use crate::utils::PointSet;

///////////
// Build //
///////////

/// Build and persist a p-stable LSH index for a dataset
///
/// Derives the family parameters from the dataset statistics, generates
/// the hash family, finalises the bit widths against the generated
/// projections, then constructs the bucket indexes for every radius level
/// with the tables divided into `block_count` blocks built in parallel.
/// Everything the search side consumes is persisted to the store: the
/// statistics, the parameter blob, the block layout and one bucket blob
/// per (radius level, block).
///
/// ### Params
///
/// * `points` - The dataset
/// * `stats` - Dataset statistics from the statistics collaborator; must
///   agree with `points`
/// * `ratio` - Approximation ratio c, at least 2
/// * `block_count` - Number of table blocks for parallel construction
/// * `seed` - Random seed for reproducibility
/// * `store` - Destination store
/// * `verbose` - Print the derived parameters and progress
///
/// ### Returns
///
/// The finalised parameters and the generated hash family.
#[allow(clippy::too_many_arguments)]
pub fn build_lsh_index(
    points: &PointSet,
    stats: &DatasetStats,
    ratio: i64,
    block_count: usize,
    seed: u64,
    store: &IndexStore,
    verbose: bool,
) -> Result<(LshParams, HashFamily)> {
    if stats.dim != points.dim || stats.cardinality != points.n {
        return Err(DlshError::InvalidParameter(format!(
            "statistics ({} x {}) do not describe the dataset ({} x {})",
            stats.cardinality, stats.dim, points.n, points.dim
        )));
    }
    if stats.n_radii < 1 {
        return Err(DlshError::InvalidParameter(
            "nRadii must be positive".to_string(),
        ));
    }

    let mut lsh_params = LshParams::derive(stats, ratio)?;
    let family = HashFamily::generate(&lsh_params, seed);
    lsh_params.finalise(family.max_hash_value(lsh_params.max_coordinate, lsh_params.width))?;

    if verbose {
        println!("Parameters:");
        println!("  origVecBitWidth (f) = {}", lsh_params.orig_vec_bit_width);
        println!("  p1 = {:.9}", lsh_params.p1);
        println!("  p2 = {:.9}", lsh_params.p2);
        println!("  projDim (m) = {}", lsh_params.proj_dim);
        println!("  hashTableSize (L) = {}", lsh_params.table_count);
        println!("  hashVecBitWidth (u) = {}", lsh_params.hash_vec_bit_width);
        println!("  maxShifted (U) = {:.1}", lsh_params.max_shifted_proj);
    }

    store.save_stats(stats)?;
    store.save_parameters(&ParameterBlob {
        params: lsh_params.clone(),
        family: family.clone(),
    })?;

    let radii = radius_ladder(ratio, stats.n_radii);
    let layout = divide_tables(lsh_params.table_count, block_count)?;
    store.save_block_layout(&layout)?;

    let blocks = build_blocks(&lsh_params, &family, points, &radii, &layout)?;
    for level in &blocks {
        for block in level {
            store.save_table_block(block)?;
        }
    }

    if verbose {
        println!(
            "Hashed {} points into {} tables over {} radius levels.",
            points.n.separate_with_underscores(),
            lsh_params.table_count,
            stats.n_radii
        );
    }

    Ok((lsh_params, family))
}

////////////
// Search //
////////////

/// Search a persisted LSH index for a batch of queries
///
/// Loads the statistics, parameter blob, block layout and every bucket
/// blob from the store, then drives each query through the
/// radius-expanding search. Queries run concurrently; per-round
/// intermediate state for queries that have not yet converged goes
/// through the same store.
///
/// ### Params
///
/// * `store` - Store holding a built index
/// * `points` - The dataset the index was built over
/// * `queries` - The query set; query IDs are row indices
/// * `k` - Number of neighbours to find per query
/// * `prune_factor` - Cap multiplier on collision inspections per radius
/// * `split_count` - Dataset splits for the distance-check fan-out
/// * `verbose` - Print per-round progress and the final summary
///
/// ### Returns
///
/// One outcome per query, ascending by distance within each, with
/// exhausted queries reported as partial ("missing") results.
pub fn search_lsh_index(
    store: &IndexStore,
    points: &PointSet,
    queries: &PointSet,
    k: usize,
    prune_factor: usize,
    split_count: usize,
    verbose: bool,
) -> Result<Vec<SearchOutcome>> {
    let stats = store.load_stats()?;
    let blob = store.load_parameters()?;
    let layout = store.load_block_layout()?;

    let mut blocks = Vec::with_capacity(stats.n_radii);
    for radius_level in 0..stats.n_radii {
        let mut level = Vec::with_capacity(layout.len());
        for block_id in 0..layout.len() {
            level.push(store.load_table_block(radius_level, block_id)?);
        }
        blocks.push(level);
    }

    let search = RadiusSearch::new(
        &blob.params,
        &blob.family,
        &blocks,
        points,
        k,
        prune_factor,
        split_count,
        verbose,
    )?;
    let outcomes = search.run(store, queries)?;

    if verbose {
        let report = summarise(&outcomes);
        println!(
            "Search finished: {} converged, {} missing.",
            report.converged.separate_with_underscores(),
            report.missing.separate_with_underscores()
        );
    }

    Ok(outcomes)
}

///////////
// Tests //
///////////
