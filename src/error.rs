use std::path::PathBuf;
use thiserror::Error;

////////////////
// Error type //
////////////////

/// Errors produced while deriving parameters, building bucket indexes or
/// searching.
///
/// Configuration and derivation errors signal an internal inconsistency
/// between the derived parameters and the data. They are fatal for the
/// whole job and must not be retried. Missing or malformed persisted
/// artifacts are fatal for the task that needed them and are never
/// silently defaulted. A query that exhausts the radius ladder without
/// finding `k` neighbours is NOT an error and is reported through
/// `SearchOutcome` instead.
#[derive(Debug, Error)]
pub enum DlshError {
    /// The original vector bit width would overflow a 64-bit shift.
    #[error("origVecBitWidth f = {bits} exceeds 60, the 64-bit shift would overflow")]
    OrigVecBitWidthOverflow { bits: u32 },

    /// The hashed vector bit width would overflow the bucket-ID hash.
    #[error("hashVecBitWidth u = {bits} exceeds 30")]
    HashVecBitWidthOverflow { bits: u32 },

    /// A quantised coordinate fell outside `[0, 2^u)`. This means the
    /// derived parameters and the hashing radius are inconsistent.
    #[error(
        "illegal coordinate {value} in the hash space (limit {limit}) \
         for table {table} at radius {radius}"
    )]
    QuantisedOutOfRange {
        table: usize,
        radius: i64,
        value: i64,
        limit: u64,
    },

    /// A required parameter was zero, negative or otherwise unusable.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// An expected persisted artifact does not exist.
    #[error("artifact not found: {path:?}")]
    MissingArtifact { path: PathBuf },

    /// A persisted artifact exists but could not be decoded.
    #[error("malformed artifact {path:?}: {source}")]
    MalformedArtifact {
        path: PathBuf,
        source: bincode::Error,
    },

    /// An io failure while reading or writing an artifact.
    #[error("io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, DlshError>;

///////////
// Tests //
///////////
