//! Error taxonomy for a pipeline run.
//!
//! Row-level problems (bad data) never surface here - the normalizer absorbs
//! and counts them. These variants are the partition-level failures that end
//! a run: bad parameters, an unreachable source, an unwritable warehouse, a
//! failed or cancelled chunk.

use std::path::PathBuf;

use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("invalid parameter: {reason}")]
    InvalidParameter { reason: String },

    #[error("fetch of {url} failed after {attempts} attempt(s): {reason}")]
    Fetch {
        url: String,
        attempts: u32,
        reason: String,
    },

    #[error("staging io at {}: {}", .path.display(), .source)]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("source schema: {0}")]
    SourceSchema(String),

    #[error("warehouse: {0}")]
    Store(#[from] StoreError),

    #[error("load failed on chunk {chunk_index} (rows {offset_start}-{offset_end}): {reason}")]
    Load {
        chunk_index: u32,
        offset_start: u64,
        offset_end: u64,
        reason: String,
    },

    #[error("run cancelled before chunk {chunk_index} (rows {offset_start}-{offset_end})")]
    Cancelled {
        chunk_index: u32,
        offset_start: u64,
        offset_end: u64,
    },
}

impl IngestError {
    /// Stable label for run bookkeeping and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidParameter { .. } => "invalid_parameter",
            Self::Fetch { .. } => "fetch",
            Self::Staging { .. } => "staging",
            Self::SourceSchema(_) => "source_schema",
            Self::Store(_) => "store",
            Self::Load { .. } => "load",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}
