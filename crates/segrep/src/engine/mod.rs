//! Engines: the primary-side segment writer collaborator and the replica-side
//! near-real-time reader manager.

use serde::{Deserialize, Serialize};

use crate::error::{SegrepError, SegrepResult};

pub mod nrt;
pub mod primary;

pub use nrt::{FileRefTracker, NrtReplicationEngine, NrtStats, ReaderState, ReaderView};
pub use primary::{InMemoryPrimaryEngine, PrimaryEngine};

/// A stored document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Document id.
    pub id: String,
    /// Source body.
    pub source: String,
}

impl Document {
    /// Create a document.
    pub fn new(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
        }
    }
}

/// Encode a segment file.
pub(crate) fn encode_segment(docs: &[Document]) -> SegrepResult<Vec<u8>> {
    Ok(bincode::serialize(docs)?)
}

/// Decode a segment file.
pub(crate) fn decode_segment(name: &str, data: &[u8]) -> SegrepResult<Vec<Document>> {
    bincode::deserialize(data)
        .map_err(|e| SegrepError::corrupt(format!("unreadable segment file [{}]: {}", name, e)))
}
