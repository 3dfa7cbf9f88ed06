use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{DlshError, Result};
use crate::family::HashFamily;
use crate::params::LshParams;
use crate::utils::PointSet;

const EMPTY_BUCKET: &[usize] = &[];

//////////////////
// Bucket table //
//////////////////

/// One hash table at one radius level: bucket ID → point indices
///
/// Append-only during construction, read-only during search. A point may
/// legitimately appear once per table, so no deduplication happens here.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketTable {
    buckets: FxHashMap<u32, Vec<usize>>,
}

impl BucketTable {
    /// Append a point index to a bucket.
    pub fn add(&mut self, bucket_id: u32, index: usize) {
        self.buckets.entry(bucket_id).or_default().push(index);
    }

    /// Look up a bucket
    ///
    /// A missing bucket is a normal outcome, not an error: the caller
    /// still gets an (empty) answer and can register "no collision found"
    /// for its convergence bookkeeping.
    ///
    /// ### Params
    ///
    /// * `bucket_id` - The bucket to fetch
    ///
    /// ### Returns
    ///
    /// The point indices hashed to this bucket, possibly empty.
    pub fn get(&self, bucket_id: u32) -> &[usize] {
        self.buckets
            .get(&bucket_id)
            .map(Vec::as_slice)
            .unwrap_or(EMPTY_BUCKET)
    }

    /// Returns the number of non-empty buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/////////////////
// Table block //
/////////////////

/// A block of hash tables for one radius level
///
/// The `L` tables of a radius level are divided into contiguous blocks so
/// that construction and storage parallelise; a block knows which global
/// tables it covers. The table count is explicit metadata and is persisted
/// alongside the buckets.
///
/// ### Fields
///
/// * `radius_level` - Index into the radius ladder
/// * `block_id` - Position of this block in the level's block layout
/// * `table_offset` - Global index of the block's first table
/// * `tables` - The block's bucket tables, in global table order
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableBlock {
    pub radius_level: usize,
    pub block_id: usize,
    pub table_offset: usize,
    tables: Vec<BucketTable>,
}

impl TableBlock {
    /// Create an empty block covering `table_count` tables.
    pub fn new(
        radius_level: usize,
        block_id: usize,
        table_offset: usize,
        table_count: usize,
    ) -> Self {
        Self {
            radius_level,
            block_id,
            table_offset,
            tables: vec![BucketTable::default(); table_count],
        }
    }

    /// Returns the number of tables in this block.
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Append a point index to a bucket of one block-local table.
    pub fn add(&mut self, local_table: usize, bucket_id: u32, index: usize) {
        self.tables[local_table].add(bucket_id, index);
    }

    /// Look up a bucket in one block-local table, empty on miss.
    pub fn get(&self, local_table: usize, bucket_id: u32) -> &[usize] {
        self.tables[local_table].get(bucket_id)
    }
}

////////////////////
// Block division //
////////////////////

/// Divide the L hash tables into contiguous blocks
///
/// This is the basic unit of distributed construction and storage: every
/// block gets `L / block_count` tables and the last block additionally
/// takes the remainder.
///
/// ### Params
///
/// * `table_count` - Total number of tables, that is L
/// * `block_count` - Number of blocks to divide into
///
/// ### Returns
///
/// `(table_offset, table_count)` per block, or a fatal parameter error
/// when a block would end up empty.
pub fn divide_tables(table_count: usize, block_count: usize) -> Result<Vec<(usize, usize)>> {
    if block_count == 0 {
        return Err(DlshError::InvalidParameter(
            "block count must be positive".to_string(),
        ));
    }
    let block_size = table_count / block_count;
    if block_size < 1 {
        return Err(DlshError::InvalidParameter(format!(
            "block size can not be smaller than 1 ({table_count} tables over {block_count} blocks)"
        )));
    }

    let mut layout = Vec::with_capacity(block_count);
    for block_id in 0..block_count - 1 {
        layout.push((block_id * block_size, block_size));
    }
    // the last block takes the remainder
    layout.push((
        (block_count - 1) * block_size,
        table_count - (block_count - 1) * block_size,
    ));
    Ok(layout)
}

/// Build the bucket indexes for every radius level, blocks in parallel
///
/// For every radius in the ladder and every table, hashes every point and
/// appends its global index to the matching bucket. Blocks of one level
/// build concurrently; levels proceed in ladder order.
///
/// ### Params
///
/// * `params` - Finalised LSH parameters
/// * `family` - The generated hash family
/// * `points` - The dataset
/// * `radii` - The radius ladder
/// * `layout` - Block layout from `divide_tables`
///
/// ### Returns
///
/// `blocks[radius_level][block_id]`, or the first fatal hashing error.
pub fn build_blocks(
    params: &LshParams,
    family: &HashFamily,
    points: &PointSet,
    radii: &[i64],
    layout: &[(usize, usize)],
) -> Result<Vec<Vec<TableBlock>>> {
    let mut all_levels = Vec::with_capacity(radii.len());

    for (radius_level, &radius) in radii.iter().enumerate() {
        let level_blocks: Vec<TableBlock> = layout
            .par_iter()
            .enumerate()
            .map(|(block_id, &(table_offset, table_count))| {
                let mut block = TableBlock::new(radius_level, block_id, table_offset, table_count);

                for local_table in 0..table_count {
                    let table = table_offset + local_table;
                    for index in 0..points.n {
                        let bucket_id =
                            family.bucket_id(params, table, radius, points.point(index))?;
                        block.add(local_table, bucket_id, index);
                    }
                }
                Ok(block)
            })
            .collect::<Result<Vec<TableBlock>>>()?;

        all_levels.push(level_blocks);
    }

    Ok(all_levels)
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::DatasetStats;
    use crate::search::radius_ladder;

    fn small_setup() -> (LshParams, HashFamily, PointSet) {
        let points = PointSet::from_rows(&[
            vec![0, 0],
            vec![1, 0],
            vec![0, 1],
            vec![10, 10],
        ]);
        let stats = DatasetStats {
            dim: 2,
            max_coordinate: 10,
            cardinality: 4,
            n_radii: 3,
        };
        let mut params = LshParams::derive(&stats, 2).unwrap();
        let family = HashFamily::generate(&params, 42);
        params
            .finalise(family.max_hash_value(params.max_coordinate, params.width))
            .unwrap();
        (params, family, points)
    }

    #[test]
    fn test_bucket_table_add_get() {
        let mut table = BucketTable::default();
        table.add(17, 0);
        table.add(17, 3);
        table.add(99, 1);

        assert_eq!(table.get(17), &[0, 3]);
        assert_eq!(table.get(99), &[1]);
        assert_eq!(table.bucket_count(), 2);
    }

    #[test]
    fn test_missing_bucket_is_empty_not_error() {
        let table = BucketTable::default();
        assert!(table.get(12345).is_empty());
    }

    #[test]
    fn test_no_dedup_within_bucket() {
        // The same index may be appended repeatedly; dedup is the
        // searcher's job.
        let mut table = BucketTable::default();
        table.add(5, 2);
        table.add(5, 2);
        assert_eq!(table.get(5), &[2, 2]);
    }

    #[test]
    fn test_divide_tables_even() {
        let layout = divide_tables(8, 4).unwrap();
        assert_eq!(layout, vec![(0, 2), (2, 2), (4, 2), (6, 2)]);
    }

    #[test]
    fn test_divide_tables_remainder_to_last() {
        let layout = divide_tables(10, 3).unwrap();
        assert_eq!(layout, vec![(0, 3), (3, 3), (6, 4)]);
    }

    #[test]
    fn test_divide_tables_single_block() {
        let layout = divide_tables(5, 1).unwrap();
        assert_eq!(layout, vec![(0, 5)]);
    }

    #[test]
    fn test_divide_tables_too_many_blocks() {
        let err = divide_tables(3, 4).unwrap_err();
        assert!(matches!(err, DlshError::InvalidParameter(_)));
    }

    #[test]
    fn test_build_blocks_shapes() {
        let (params, family, points) = small_setup();
        let radii = radius_ladder(params.ratio, 3);
        let layout = divide_tables(params.table_count, 1).unwrap();

        let blocks = build_blocks(&params, &family, &points, &radii, &layout).unwrap();

        assert_eq!(blocks.len(), 3);
        for level in &blocks {
            assert_eq!(level.len(), 1);
            assert_eq!(level[0].table_count(), params.table_count);
        }
    }

    #[test]
    fn test_build_blocks_every_point_in_every_table() {
        let (params, family, points) = small_setup();
        let radii = radius_ladder(params.ratio, 2);
        let layout = divide_tables(params.table_count, 1).unwrap();

        let blocks = build_blocks(&params, &family, &points, &radii, &layout).unwrap();

        for level in &blocks {
            let block = &level[0];
            for local_table in 0..block.table_count() {
                let total: usize = (0..points.n)
                    .map(|index| {
                        let table = block.table_offset + local_table;
                        let radius = radii[block.radius_level];
                        let bucket_id = family
                            .bucket_id(&params, table, radius, points.point(index))
                            .unwrap();
                        usize::from(block.get(local_table, bucket_id).contains(&index))
                    })
                    .sum();
                assert_eq!(total, points.n);
            }
        }
    }

    #[test]
    fn test_point_colocated_with_itself() {
        // A query identical to a stored point always lands in its bucket.
        let (params, family, points) = small_setup();
        let radii = radius_ladder(params.ratio, 1);
        let layout = divide_tables(params.table_count, 1).unwrap();
        let blocks = build_blocks(&params, &family, &points, &radii, &layout).unwrap();

        let block = &blocks[0][0];
        for local_table in 0..block.table_count() {
            let bucket_id = family
                .bucket_id(&params, local_table, 1, &[0, 0])
                .unwrap();
            assert!(block.get(local_table, bucket_id).contains(&0));
        }
    }

    #[test]
    fn test_block_roundtrip() {
        let (params, family, points) = small_setup();
        let radii = radius_ladder(params.ratio, 1);
        let layout = divide_tables(params.table_count, 1).unwrap();
        let blocks = build_blocks(&params, &family, &points, &radii, &layout).unwrap();

        let bytes = bincode::serialize(&blocks[0][0]).unwrap();
        let back: TableBlock = bincode::deserialize(&bytes).unwrap();
        assert_eq!(blocks[0][0], back);
    }
}
