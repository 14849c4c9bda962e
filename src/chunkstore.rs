//! Content-addressed chunk store interface for delta transport
//! (casync/desync-style), specified only as an interface per spec.md
//! §6 — an external collaborator, not something this crate implements.

use crate::error::Result;

/// A single chunk's content-address.
pub type Digest = [u8; 32];

/// An index mapping file offsets to chunk digests, as produced by the
/// external chunking tool.
#[derive(Debug, Clone)]
pub struct ChunkIndex {
    pub entries: Vec<ChunkIndexEntry>,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkIndexEntry {
    pub offset: u64,
    pub length: u32,
    pub digest: Digest,
}

/// Implemented by whatever delta-transport backend is configured
/// (`[casync]`/`[streaming]`); this crate only consumes it.
pub trait ChunkStore: Send + Sync {
    fn has_chunk(&self, digest: &Digest) -> bool;
    fn fetch_chunk(&self, digest: &Digest) -> Result<Vec<u8>>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct MockChunkStore {
        pub chunks: HashMap<Digest, Vec<u8>>,
    }

    impl ChunkStore for MockChunkStore {
        fn has_chunk(&self, digest: &Digest) -> bool {
            self.chunks.contains_key(digest)
        }

        fn fetch_chunk(&self, digest: &Digest) -> Result<Vec<u8>> {
            self.chunks
                .get(digest)
                .cloned()
                .ok_or_else(|| crate::error::Error::Other("chunk not found".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockChunkStore;
    use super::*;

    #[test]
    fn missing_chunk_is_an_error() {
        let store = MockChunkStore::default();
        assert!(store.fetch_chunk(&[0u8; 32]).is_err());
    }
}
