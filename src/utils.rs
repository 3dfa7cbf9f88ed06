use rand::Rng;

///////////////
// Point set //
///////////////

/// An immutable set of integer points stored flat, row-major
///
/// Points are fixed-length `i32` vectors identified by their row index.
/// The flat layout keeps neighbouring coordinates contiguous for cache
/// efficiency during the projection loops.
///
/// ### Fields
///
/// * `points_flat` - Coordinates, flattened row-major
/// * `dim` - Dimensionality of every point
/// * `n` - Number of points
#[derive(Clone, Debug)]
pub struct PointSet {
    pub points_flat: Vec<i32>,
    pub dim: usize,
    pub n: usize,
}

impl PointSet {
    /// Construct a point set from a flat coordinate buffer
    ///
    /// ### Params
    ///
    /// * `points_flat` - Coordinates, row-major; length must be a multiple
    ///   of `dim`
    /// * `dim` - Dimensionality
    ///
    /// ### Returns
    ///
    /// The `PointSet`.
    pub fn new(points_flat: Vec<i32>, dim: usize) -> Self {
        assert!(dim > 0, "Point dimensionality must be positive");
        assert!(
            points_flat.len() % dim == 0,
            "Flat buffer length must be a multiple of dim"
        );
        let n = points_flat.len() / dim;
        Self {
            points_flat,
            dim,
            n,
        }
    }

    /// Construct a point set from row vectors
    ///
    /// ### Params
    ///
    /// * `rows` - One vector per point; all rows must share a length
    ///
    /// ### Returns
    ///
    /// The `PointSet`.
    pub fn from_rows(rows: &[Vec<i32>]) -> Self {
        assert!(!rows.is_empty(), "Point set must not be empty");
        let dim = rows[0].len();
        let mut points_flat = Vec::with_capacity(rows.len() * dim);
        for row in rows {
            assert!(row.len() == dim, "Row dimensionality mismatch");
            points_flat.extend_from_slice(row);
        }
        Self::new(points_flat, dim)
    }

    /// Borrow one point as a slice
    #[inline]
    pub fn point(&self, index: usize) -> &[i32] {
        let start = index * self.dim;
        &self.points_flat[start..start + self.dim]
    }
}

///////////////
// Distances //
///////////////

/// Exact Euclidean distance between two integer points
///
/// Coordinates promote exactly to `f64`, so the result is the true L2
/// distance with no hashing involved.
///
/// ### Params
///
/// * `a` - The first point
/// * `b` - The second point
///
/// ### Returns
///
/// The L2 distance.
#[inline]
pub fn l2_distance(a: &[i32], b: &[i32]) -> f64 {
    debug_assert!(a.len() == b.len(), "Point dimensionality mismatch");
    let mut distance = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let difference = (x - y) as f64;
        distance += difference * difference;
    }
    distance.sqrt()
}

////////////////////////
// Digit-uniform draw //
////////////////////////

/// Generate a number where each decimal digit is uniform in `[0, 9]`
///
/// ### Params
///
/// * `rng` - Random source
/// * `num_digits` - How many decimal digits to draw
///
/// ### Returns
///
/// The assembled non-negative number.
pub fn digit_uniform<R: Rng>(rng: &mut R, num_digits: usize) -> f64 {
    let mut base = 1.0f64;
    let mut sum = 0.0f64;

    for _ in 0..num_digits {
        let digit = rng.random_range(0..10);
        sum += base * digit as f64;
        base *= 10.0;
    }
    sum
}

/// Generate a 10-digit digit-uniform number rescaled into `[min, max]`
///
/// Each of the 10 decimal digits is independently uniform, which gives
/// full-range coverage of wide intervals without float-precision bias.
/// Used for the LSH shift parameters whose range is amplified to
/// `[0, 2^f · W]`.
///
/// ### Params
///
/// * `rng` - Random source
/// * `min` - Lower bound
/// * `max` - Upper bound
///
/// ### Returns
///
/// A value in `[min, max]`.
pub fn bounded_digit_uniform<R: Rng>(rng: &mut R, min: f64, max: f64) -> f64 {
    let base = 9999999999.0f64;
    let result = digit_uniform(rng, 10);

    result / base * (max - min) + min
}

///////////
// Tests //
///////////
