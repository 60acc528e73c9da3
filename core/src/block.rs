use alloy::{
    primitives::B256,
    rpc::types::{Block, Header},
};
use serde::{Deserialize, Serialize};

/// The subset of a block that the submitter cares about.
///
/// Normalised from whatever the transport hands us (a `newHeads` notification
/// followed by a block fetch, or a polled `latest` block).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub number: u64,
    pub hash: B256,
    pub timestamp: u64,
    pub transaction_hashes: Vec<B256>,
}

impl BlockHeader {
    /// Header-only view, for when the transaction list is not available.
    pub fn from_rpc_header(header: &Header) -> Self {
        Self {
            number: header.inner.number,
            hash: header.hash,
            timestamp: header.inner.timestamp,
            transaction_hashes: Vec::new(),
        }
    }

    pub fn contains_transaction(&self, hash: &B256) -> bool {
        self.transaction_hashes.contains(hash)
    }
}

impl From<&Block> for BlockHeader {
    fn from(block: &Block) -> Self {
        Self {
            number: block.header.inner.number,
            hash: block.header.hash,
            timestamp: block.header.inner.timestamp,
            transaction_hashes: block.transactions.hashes().collect(),
        }
    }
}

impl From<Block> for BlockHeader {
    fn from(block: Block) -> Self {
        Self::from(&block)
    }
}
