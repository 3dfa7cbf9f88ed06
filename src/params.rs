use serde::{Deserialize, Serialize};

use crate::error::{DlshError, Result};

/// Width of the quantisation interval, or the "bucket", that is W.
pub const WIDTH: f64 = 4.0;

// Integration step and lower bound for the standard normal CDF.
const CDF_STEP: f64 = 1e-4;
const CDF_LOWER_BOUND: f64 = -10.0;

////////////////////////
// Dataset statistics //
////////////////////////

/// Statistics of a dataset, produced by the statistics collaborator
///
/// ### Fields
///
/// * `dim` - Dimensionality of the points, that is d
/// * `max_coordinate` - Largest absolute coordinate value, that is t
/// * `cardinality` - Number of points in the dataset, that is n
/// * `n_radii` - Length of the radius ladder fixed at build time
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetStats {
    pub dim: usize,
    pub max_coordinate: i32,
    pub cardinality: usize,
    pub n_radii: usize,
}

////////////////////
// LSH parameters //
////////////////////

/// Derived parameters of the p-stable LSH family
///
/// `p1` and `p2` are the collision probabilities at the base radius and at
/// `c` times it; `proj_dim` (m) and `table_count` (L) are the classical
/// amplification parameters trading false negatives against table count.
/// The two bit widths exist solely to keep the bucket-ID hash inside safe
/// integer ranges for any input magnitude.
///
/// ### Fields
///
/// * `dim` - Dimensionality, that is d
/// * `max_coordinate` - Largest coordinate, that is t
/// * `cardinality` - Dataset cardinality, that is n
/// * `ratio` - Approximation ratio, that is c
/// * `width` - Quantisation interval width, that is W
/// * `orig_vec_bit_width` - Bits per component of an original vector, that
///   is f
/// * `p1` - Collision probability for points within radius 1
/// * `p2` - Collision probability for points beyond radius c
/// * `proj_dim` - Dimensionality after projection, that is m
/// * `table_count` - Number of hash tables, that is L
/// * `hash_vec_bit_width` - Bits per component of a hashed vector, that is
///   u; zero until `finalise` has run
/// * `max_shifted_proj` - Max value of a shifted projection, that is U;
///   each hashed dimension has domain `[-U/2, U/2]`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LshParams {
    pub dim: usize,
    pub max_coordinate: i32,
    pub cardinality: usize,
    pub ratio: i64,
    pub width: f64,
    pub orig_vec_bit_width: u32,
    pub p1: f64,
    pub p2: f64,
    pub proj_dim: usize,
    pub table_count: usize,
    pub hash_vec_bit_width: u32,
    pub max_shifted_proj: f64,
}

impl LshParams {
    /// Derive the LSH family parameters from dataset statistics
    ///
    /// Computes `f`, `p1`, `p2`, `m` and `L`. The hashed-vector bit width
    /// `u` and `U = 2^u · W` depend on the generated projections and are
    /// filled in by `finalise` once the hash family exists.
    ///
    /// ### Params
    ///
    /// * `stats` - Dataset statistics (d, t, n)
    /// * `ratio` - Approximation ratio c, at least 2
    ///
    /// ### Returns
    ///
    /// The partially derived parameters, or a fatal derivation error.
    pub fn derive(stats: &DatasetStats, ratio: i64) -> Result<Self> {
        if ratio < 2 {
            return Err(DlshError::InvalidParameter(format!(
                "ratio must be at least 2, got {ratio}"
            )));
        }
        if stats.dim < 1 || stats.max_coordinate < 1 {
            return Err(DlshError::InvalidParameter(format!(
                "dim ({}) and maxCoordinate ({}) must be positive",
                stats.dim, stats.max_coordinate
            )));
        }
        if stats.cardinality < 2 {
            return Err(DlshError::InvalidParameter(format!(
                "cardinality must be at least 2, got {}",
                stats.cardinality
            )));
        }

        let orig_vec_bit_width =
            ((stats.dim as f64).log2() + (stats.max_coordinate as f64).log2()).ceil() as u32;
        if orig_vec_bit_width > 60 {
            return Err(DlshError::OrigVecBitWidthOverflow {
                bits: orig_vec_bit_width,
            });
        }

        let p1 = lsh_probability(WIDTH);
        let p2 = lsh_probability(WIDTH / ratio as f64);

        // m = ln(n) / ln(1/p2)
        let proj_dim = ((stats.cardinality as f64).ln() / (1.0 / p2).ln()).ceil() as usize;
        // L = 1 / p1^m
        let table_count = (1.0 / p1.powi(proj_dim as i32)).ceil() as usize;

        Ok(Self {
            dim: stats.dim,
            max_coordinate: stats.max_coordinate,
            cardinality: stats.cardinality,
            ratio,
            width: WIDTH,
            orig_vec_bit_width,
            p1,
            p2,
            proj_dim,
            table_count,
            hash_vec_bit_width: 0,
            max_shifted_proj: 0.0,
        })
    }

    /// The amplified shift range `2^f · W`
    ///
    /// Shifts are drawn from `[0, max_shift]` rather than `[0, W]` as in
    /// the original scheme so that the same shift parameters stay valid
    /// when the search radius is enlarged. Must be a multiple of the
    /// width.
    pub fn max_shift(&self) -> f64 {
        (1i64 << self.orig_vec_bit_width) as f64 * self.width
    }

    /// Fill in the hashed-vector bit width from the generated family
    ///
    /// `max_hash_value` is the largest pre-quantisation hash magnitude
    /// over all generated projections, floored at `2^f`. Fails fatally if
    /// the resulting `u` exceeds 30 since the bucket-ID fold could then
    /// overflow.
    ///
    /// ### Params
    ///
    /// * `max_hash_value` - Max hash magnitude scanned from the family
    pub fn finalise(&mut self, max_hash_value: f64) -> Result<()> {
        let floor = (1i64 << self.orig_vec_bit_width) as f64;
        let max_hash_value = max_hash_value.max(floor);

        let hash_vec_bit_width = (max_hash_value.log2() - 1.0).ceil() as u32 + 1;
        if hash_vec_bit_width > 30 {
            return Err(DlshError::HashVecBitWidthOverflow {
                bits: hash_vec_bit_width,
            });
        }

        self.hash_vec_bit_width = hash_vec_bit_width;
        self.max_shifted_proj = (1u64 << hash_vec_bit_width) as f64 * self.width;
        Ok(())
    }
}

///////////////////
// Probabilities //
///////////////////

/// Collision probability of the p-stable LSH family at interval width `x`
///
/// `p(x) = 1 − 2Φ(−x) − (2 / (x·sqrt(2π))) · (1 − e^(−x²/2))` with Φ the
/// standard normal CDF.
fn lsh_probability(x: f64) -> f64 {
    use std::f64::consts::PI;

    let mut prob = 1.0;
    prob -= 2.0 * standard_normal_cdf(-x);
    prob -= (2.0 / ((2.0 * PI).sqrt() * x)) * (1.0 - (-(x * x) / 2.0).exp());
    prob
}

/// Probability density of the standard normal distribution
fn normal_pdf(x: f64) -> f64 {
    use std::f64::consts::PI;

    (-(x * x) / 2.0).exp() / (2.0 * PI).sqrt()
}

/// Standard normal CDF by fixed-step numerical integration from −10
fn standard_normal_cdf(x: f64) -> f64 {
    let mut result = 0.0;
    let mut i = CDF_LOWER_BOUND;

    while i < x {
        result += CDF_STEP * normal_pdf(i);
        i += CDF_STEP;
    }
    result
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    fn small_stats() -> DatasetStats {
        DatasetStats {
            dim: 2,
            max_coordinate: 10,
            cardinality: 4,
            n_radii: 3,
        }
    }

    #[test]
    fn test_standard_normal_cdf() {
        // Φ(0) = 0.5, Φ(−1.96) ≈ 0.025
        assert!((standard_normal_cdf(0.0) - 0.5).abs() < 1e-3);
        assert!((standard_normal_cdf(-1.96) - 0.025).abs() < 1e-3);
        assert!(standard_normal_cdf(-10.0) < 1e-6);
    }

    #[test]
    fn test_lsh_probability_monotone() {
        // Wider intervals collide more often.
        let p_narrow = lsh_probability(1.0);
        let p_wide = lsh_probability(4.0);

        assert!(p_wide > p_narrow);
        assert!(p_narrow > 0.0);
        assert!(p_wide < 1.0);
    }

    #[test]
    fn test_derive_probability_ordering() {
        let params = LshParams::derive(&small_stats(), 2).unwrap();

        assert!(params.p2 > 0.0);
        assert!(params.p1 > params.p2);
        assert!(params.p1 < 1.0);
        assert!(params.proj_dim >= 1);
        assert!(params.table_count >= 1);
    }

    #[test]
    fn test_derive_ordering_holds_for_larger_ratios() {
        for ratio in [2i64, 3, 4, 8] {
            let stats = DatasetStats {
                dim: 16,
                max_coordinate: 255,
                cardinality: 10_000,
                n_radii: 5,
            };
            let params = LshParams::derive(&stats, ratio).unwrap();

            assert!(0.0 < params.p2);
            assert!(params.p2 < params.p1);
            assert!(params.p1 < 1.0);
            assert!(params.proj_dim >= 1);
            assert!(params.table_count >= 1);
        }
    }

    #[test]
    fn test_derive_bit_width() {
        // f = ceil(log2(2) + log2(10)) = ceil(4.32) = 5
        let params = LshParams::derive(&small_stats(), 2).unwrap();
        assert_eq!(params.orig_vec_bit_width, 5);
        assert_eq!(params.max_shift(), 32.0 * 4.0);
    }

    #[test]
    fn test_derive_rejects_small_ratio() {
        let err = LshParams::derive(&small_stats(), 1).unwrap_err();
        assert!(matches!(err, DlshError::InvalidParameter(_)));
    }

    #[test]
    fn test_derive_rejects_tiny_cardinality() {
        let mut stats = small_stats();
        stats.cardinality = 1;
        let err = LshParams::derive(&stats, 2).unwrap_err();
        assert!(matches!(err, DlshError::InvalidParameter(_)));
    }

    #[test]
    fn test_derive_overflow_guard() {
        // log2(2^40) + log2(2^30) > 60
        let stats = DatasetStats {
            dim: 1 << 40,
            max_coordinate: 1 << 30,
            cardinality: 100,
            n_radii: 3,
        };
        let err = LshParams::derive(&stats, 2).unwrap_err();
        assert!(matches!(err, DlshError::OrigVecBitWidthOverflow { .. }));
    }

    #[test]
    fn test_finalise_floors_at_orig_bit_width() {
        let mut params = LshParams::derive(&small_stats(), 2).unwrap();
        // A tiny scan result is floored at 2^f = 32, so
        // u = ceil(log2(32) − 1) + 1 = 5.
        params.finalise(1.0).unwrap();

        assert_eq!(params.hash_vec_bit_width, 5);
        assert_eq!(params.max_shifted_proj, 32.0 * 4.0);
    }

    #[test]
    fn test_finalise_overflow_guard() {
        let mut params = LshParams::derive(&small_stats(), 2).unwrap();
        let err = params.finalise((1u64 << 40) as f64).unwrap_err();
        assert!(matches!(err, DlshError::HashVecBitWidthOverflow { .. }));
    }

    #[test]
    fn test_stats_roundtrip() {
        let stats = small_stats();
        let bytes = bincode::serialize(&stats).unwrap();
        let back: DatasetStats = bincode::deserialize(&bytes).unwrap();
        assert_eq!(stats, back);
    }
}
