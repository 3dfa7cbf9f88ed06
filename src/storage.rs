use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use crate::bucket::TableBlock;
use crate::error::{DlshError, Result};
use crate::family::HashFamily;
use crate::params::{DatasetStats, LshParams};
use crate::topk::{Candidate, CandidateTopK};

////////////////////////
// Persisted artifacts //
////////////////////////

/// The persisted parameter record: derived parameters plus the full hash
/// family (projection matrix, shift vector, shared standard hash).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterBlob {
    pub params: LshParams,
    pub family: HashFamily,
}

/// Per-round intermediate candidate state for one not-yet-converged query
///
/// Carries the kept candidates only. The evaluated-index set is implicit:
/// it is reconstructed from the candidate list on reload, so indices that
/// were evaluated but discarded before persisting may be re-scored in a
/// later round.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoundState {
    pub dim: usize,
    pub query_id: usize,
    pub k: usize,
    pub candidates: Vec<Candidate>,
}

impl RoundState {
    /// Snapshot a top-k structure for persistence between rounds.
    pub fn from_topk(dim: usize, topk: &CandidateTopK) -> Self {
        Self {
            dim,
            query_id: topk.query_id(),
            k: topk.k(),
            candidates: topk.sorted(),
        }
    }

    /// Rebuild the carried top-k structure for the next round.
    pub fn into_topk(self) -> CandidateTopK {
        CandidateTopK::from_candidates(self.query_id, self.k, self.candidates)
    }
}

/////////////////
// Index store //
/////////////////

/// Directory-backed store for every artifact the pipeline persists
///
/// Layout under the base directory:
///
/// ```text
/// final.stat                       dataset statistics
/// hash_param/family.lshb           parameter blob (params + hash family)
/// hash_param/blocks.info           block layout (offset, table count)*
/// radius_<r>/<b>.tables            bucket-index blob per (level, block)
/// radius_<r>/intermediate/<q>.cand per-round candidate state
/// ```
///
/// A missing artifact or a decode failure is fatal for the task that
/// needed it; nothing is silently defaulted.
#[derive(Clone, Debug)]
pub struct IndexStore {
    base: PathBuf,
}

impl IndexStore {
    /// Create (or reuse) a store rooted at `base`.
    pub fn create<P: AsRef<Path>>(base: P) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).map_err(|source| DlshError::Io {
            path: base.clone(),
            source,
        })?;
        Ok(Self { base })
    }

    /// Open an existing store.
    pub fn open<P: AsRef<Path>>(base: P) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        if !base.is_dir() {
            return Err(DlshError::MissingArtifact { path: base });
        }
        Ok(Self { base })
    }

    /// Returns the base directory.
    pub fn base(&self) -> &Path {
        &self.base
    }

    ////////////////
    // Statistics //
    ////////////////

    pub fn save_stats(&self, stats: &DatasetStats) -> Result<()> {
        self.write_blob(&self.base.join("final.stat"), stats)
    }

    pub fn load_stats(&self) -> Result<DatasetStats> {
        self.read_blob(&self.base.join("final.stat"))
    }

    ////////////////
    // Parameters //
    ////////////////

    pub fn save_parameters(&self, blob: &ParameterBlob) -> Result<()> {
        self.write_blob(&self.base.join("hash_param").join("family.lshb"), blob)
    }

    pub fn load_parameters(&self) -> Result<ParameterBlob> {
        self.read_blob(&self.base.join("hash_param").join("family.lshb"))
    }

    /// Persist the block layout, the per-block table counts.
    pub fn save_block_layout(&self, layout: &[(usize, usize)]) -> Result<()> {
        self.write_blob(
            &self.base.join("hash_param").join("blocks.info"),
            &layout.to_vec(),
        )
    }

    pub fn load_block_layout(&self) -> Result<Vec<(usize, usize)>> {
        self.read_blob(&self.base.join("hash_param").join("blocks.info"))
    }

    ///////////////////
    // Bucket blocks //
    ///////////////////

    pub fn save_table_block(&self, block: &TableBlock) -> Result<()> {
        let path = self.table_block_path(block.radius_level, block.block_id);
        self.write_blob(&path, block)
    }

    pub fn load_table_block(&self, radius_level: usize, block_id: usize) -> Result<TableBlock> {
        self.read_blob(&self.table_block_path(radius_level, block_id))
    }

    /////////////////
    // Round state //
    /////////////////

    pub fn save_round_state(&self, radius_level: usize, state: &RoundState) -> Result<()> {
        let path = self.round_state_path(radius_level, state.query_id);
        self.write_blob(&path, state)
    }

    pub fn load_round_state(&self, radius_level: usize, query_id: usize) -> Result<RoundState> {
        self.read_blob(&self.round_state_path(radius_level, query_id))
    }

    /// Whether intermediate state exists for a query at a radius level.
    pub fn has_round_state(&self, radius_level: usize, query_id: usize) -> bool {
        self.round_state_path(radius_level, query_id).is_file()
    }

    /////////////
    // Helpers //
    /////////////

    fn table_block_path(&self, radius_level: usize, block_id: usize) -> PathBuf {
        self.base
            .join(format!("radius_{radius_level}"))
            .join(format!("{block_id}.tables"))
    }

    fn round_state_path(&self, radius_level: usize, query_id: usize) -> PathBuf {
        self.base
            .join(format!("radius_{radius_level}"))
            .join("intermediate")
            .join(format!("{query_id}.cand"))
    }

    fn write_blob<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| DlshError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let file = File::create(path).map_err(|source| DlshError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        bincode::serialize_into(BufWriter::new(file), value).map_err(|source| {
            DlshError::MalformedArtifact {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    fn read_blob<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        if !path.is_file() {
            return Err(DlshError::MissingArtifact {
                path: path.to_path_buf(),
            });
        }

        let file = File::open(path).map_err(|source| DlshError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        bincode::deserialize_from(BufReader::new(file)).map_err(|source| {
            DlshError::MalformedArtifact {
                path: path.to_path_buf(),
                source,
            }
        })
    }
}

///////////
// Tests //
///////////
