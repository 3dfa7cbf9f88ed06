use rand::prelude::*;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{DlshError, Result};
use crate::params::LshParams;
use crate::utils::bounded_digit_uniform;

// Exclusive upper bound for the standard-hash coefficients, 2^29.
const MAX_HASH_BASE: u64 = 1 << 29;
// Lower 32 bits of the running bucket-ID accumulator.
const MASK: u64 = 0xFFFF_FFFF;
// Mersenne prime 2^31 − 1, the modulus of the bucket-ID hash.
const PRIME: u64 = 0x7FFF_FFFF;

/////////////////
// Hash family //
/////////////////

/// The p-stable LSH hash family for one dataset
///
/// Holds, for each of the `L` tables, a projection matrix of independent
/// standard-normal draws (p-stable for Euclidean distance) and a shift
/// vector drawn digit-uniformly from the amplified range `[0, 2^f · W]`,
/// plus one `standard_hash` vector shared by all tables that combines the
/// m quantised projections into a single bucket ID. Generated once at
/// build time, persisted, and reloaded read-only during search.
///
/// ### Fields
///
/// * `proj` - Projection entries, flattened as
///   `[table * m * d + i * d + j]`
/// * `shift` - Shift entries, flattened as `[table * m + i]`
/// * `standard_hash` - Shared combination coefficients in `[1, 2^29)`
/// * `table_count` - Number of tables, that is L
/// * `proj_dim` - Projected dimensionality, that is m
/// * `dim` - Original dimensionality, that is d
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HashFamily {
    proj: Vec<f64>,
    shift: Vec<f64>,
    standard_hash: Vec<u64>,
    table_count: usize,
    proj_dim: usize,
    dim: usize,
}

impl HashFamily {
    /// Generate the hash family for a derived parameter set
    ///
    /// Draws all projection entries i.i.d. from N(0, 1), all shift entries
    /// digit-uniformly from `[0, 2^f · W]` and the shared standard-hash
    /// coefficients uniformly from `[1, 2^29)`. Generation is fully
    /// deterministic in the seed.
    ///
    /// ### Params
    ///
    /// * `params` - Derived LSH parameters (m, L, d and the shift range)
    /// * `seed` - Random seed for reproducibility
    ///
    /// ### Returns
    ///
    /// The generated family.
    pub fn generate(params: &LshParams, seed: u64) -> Self {
        let table_count = params.table_count;
        let proj_dim = params.proj_dim;
        let dim = params.dim;
        let max_shift = params.max_shift();

        let mut rng = StdRng::seed_from_u64(seed);

        let proj: Vec<f64> = (0..table_count * proj_dim * dim)
            .map(|_| rng.sample(StandardNormal))
            .collect();

        let shift: Vec<f64> = (0..table_count * proj_dim)
            .map(|_| bounded_digit_uniform(&mut rng, 0.0, max_shift))
            .collect();

        let standard_hash: Vec<u64> = (0..proj_dim)
            .map(|_| rng.random_range(1..MAX_HASH_BASE))
            .collect();

        Self {
            proj,
            shift,
            standard_hash,
            table_count,
            proj_dim,
            dim,
        }
    }

    /// Returns the number of tables in the family.
    pub fn table_count(&self) -> usize {
        self.table_count
    }

    /// Maximum possible pre-quantisation hash magnitude
    ///
    /// Scans every generated projection row: the worst case over points
    /// with coordinates bounded by `max_coordinate` is
    /// `2 · (Σ_j |a[i][j]| · t + b[i]) / W`. Feeds the derivation of the
    /// hashed-vector bit width u.
    ///
    /// ### Params
    ///
    /// * `max_coordinate` - Largest coordinate magnitude in the dataset
    /// * `width` - Quantisation interval width W
    ///
    /// ### Returns
    ///
    /// The maximum hash magnitude over all tables and projections.
    pub fn max_hash_value(&self, max_coordinate: i32, width: f64) -> f64 {
        let mut max_hash_value = 0.0f64;

        for table in 0..self.table_count {
            for i in 0..self.proj_dim {
                let base = (table * self.proj_dim + i) * self.dim;
                let sum: f64 = self.proj[base..base + self.dim]
                    .iter()
                    .map(|a| a.abs())
                    .sum();

                let hash_value = 2.0
                    * (sum * max_coordinate as f64 + self.shift[table * self.proj_dim + i])
                    / width;
                if hash_value > max_hash_value {
                    max_hash_value = hash_value;
                }
            }
        }
        max_hash_value
    }

    /// Hash a point into a bucket ID for one table at one radius
    ///
    /// Projects the point onto the table's m rows, shifts each projection,
    /// quantises with interval `W · radius` after moving the domain
    /// `U/2` units right to make it non-negative, then folds the m
    /// quantised coordinates into a single bucket ID with the 64-bit
    /// Mersenne-prime rolling hash. The fold adds `q[i] · standard_hash[i]`
    /// per step and rebalances with
    /// `acc = (acc & 0xFFFFFFFF) + 5 · (acc >> 32); acc %= 2^31 − 1`,
    /// which keeps the running sum inside 64 bits while mixing the high
    /// bits back in.
    ///
    /// A quantised coordinate outside `[0, 2^u)` is a fatal configuration
    /// error: it means the parameter derivation and the hashing radius are
    /// inconsistent, which must never happen for a correctly derived
    /// parameter set.
    ///
    /// ### Params
    ///
    /// * `params` - Finalised LSH parameters (provides W, u and U)
    /// * `table` - Table index in `0..L`
    /// * `radius` - Current search radius from the radius ladder
    /// * `point` - The point or query to hash
    ///
    /// ### Returns
    ///
    /// The bucket ID in `[0, 2^31 − 2]`.
    pub fn bucket_id(
        &self,
        params: &LshParams,
        table: usize,
        radius: i64,
        point: &[i32],
    ) -> Result<u32> {
        assert!(
            point.len() == self.dim,
            "Point dimensionality mismatch in bucket_id"
        );

        let limit = 1u64 << params.hash_vec_bit_width;
        let cell = params.width * radius as f64;
        let half_domain = params.max_shifted_proj / 2.0;

        let mut acc = 0u64;
        for i in 0..self.proj_dim {
            let base = (table * self.proj_dim + i) * self.dim;
            let mut hash_value = 0.0f64;
            for (j, &coordinate) in point.iter().enumerate() {
                hash_value += self.proj[base + j] * coordinate as f64;
            }
            hash_value += self.shift[table * self.proj_dim + i];

            // Move the projection half the domain towards the right to
            // make it non-negative, then quantise.
            let quantised = ((hash_value + half_domain) / cell).floor();
            if quantised < 0.0 || quantised >= limit as f64 {
                return Err(DlshError::QuantisedOutOfRange {
                    table,
                    radius,
                    value: quantised as i64,
                    limit,
                });
            }

            acc += quantised as u64 * self.standard_hash[i];
            acc = (acc & MASK) + 5 * (acc >> 32);
            acc %= PRIME;
        }

        Ok(acc as u32)
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::DatasetStats;

    fn test_family() -> (LshParams, HashFamily) {
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
        (params, family)
    }

    #[test]
    fn test_generation_shapes() {
        let (params, family) = test_family();

        assert_eq!(family.table_count(), params.table_count);
        assert_eq!(
            family.proj.len(),
            params.table_count * params.proj_dim * params.dim
        );
        assert_eq!(family.shift.len(), params.table_count * params.proj_dim);
        assert_eq!(family.standard_hash.len(), params.proj_dim);
    }

    #[test]
    fn test_shift_range() {
        let (params, family) = test_family();
        let max_shift = params.max_shift();

        for &shift in &family.shift {
            assert!(shift >= 0.0);
            assert!(shift <= max_shift);
        }
    }

    #[test]
    fn test_standard_hash_range() {
        let (_, family) = test_family();

        for &coefficient in &family.standard_hash {
            assert!(coefficient >= 1);
            assert!(coefficient < MAX_HASH_BASE);
        }
    }

    #[test]
    fn test_deterministic_with_seed() {
        let (params, family1) = test_family();
        let family2 = HashFamily::generate(&params, 42);

        assert_eq!(family1.proj, family2.proj);
        assert_eq!(family1.shift, family2.shift);
        assert_eq!(family1.standard_hash, family2.standard_hash);
    }

    #[test]
    fn test_different_seeds_differ() {
        let (params, family1) = test_family();
        let family2 = HashFamily::generate(&params, 43);

        assert_ne!(family1.proj, family2.proj);
    }

    #[test]
    fn test_bucket_id_deterministic() {
        let (params, family) = test_family();
        let point = [3, 7];

        for table in 0..params.table_count {
            let first = family.bucket_id(&params, table, 1, &point).unwrap();
            let second = family.bucket_id(&params, table, 1, &point).unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_identical_points_collide() {
        let (params, family) = test_family();

        let a = family.bucket_id(&params, 0, 1, &[5, 5]).unwrap();
        let b = family.bucket_id(&params, 0, 1, &[5, 5]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_bucket_id_below_prime() {
        let (params, family) = test_family();

        for table in 0..params.table_count {
            for point in [[0, 0], [10, 10], [-10, 10], [3, -4]] {
                let id = family.bucket_id(&params, table, 1, &point).unwrap();
                assert!((id as u64) < PRIME);
            }
        }
    }

    #[test]
    fn test_all_ladder_radii_stay_in_range() {
        let (params, family) = test_family();

        // A larger radius shrinks the quantised coordinates, so the whole
        // ladder must hash without range errors.
        for radius in [1i64, 2, 4, 8] {
            for table in 0..params.table_count {
                family.bucket_id(&params, table, radius, &[10, -10]).unwrap();
            }
        }
    }

    #[test]
    fn test_unfinalised_params_rejected() {
        let stats = DatasetStats {
            dim: 2,
            max_coordinate: 10,
            cardinality: 4,
            n_radii: 3,
        };
        let params = LshParams::derive(&stats, 2).unwrap();
        let family = HashFamily::generate(&params, 42);

        // Without finalise, u = 0 leaves no quantisation headroom at all,
        // which must surface as the fatal range error.
        let result = family.bucket_id(&params, 0, 1, &[10, 10]);
        assert!(matches!(
            result,
            Err(DlshError::QuantisedOutOfRange { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "dimensionality mismatch")]
    fn test_dimension_mismatch_panics() {
        let (params, family) = test_family();
        let _ = family.bucket_id(&params, 0, 1, &[1, 2, 3]);
    }

    #[test]
    fn test_serde_roundtrip_bit_identical() {
        let (_, family) = test_family();

        let bytes = bincode::serialize(&family).unwrap();
        let back: HashFamily = bincode::deserialize(&bytes).unwrap();

        assert_eq!(family, back);
    }
}
