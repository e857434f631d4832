use serde::{Deserialize, Serialize};

use crate::common::{Hash, ZERO_HASH};

/// A proposal window: the next block height comes from `block_height + 1`,
/// `number` counts retries within the height, and `total_txs` is the chain's
/// cumulative transaction count at the round's base block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub block_height: u64,
    pub number: u64,
    pub prev_block_hash: Hash,
    pub total_txs: u64,
}

impl Round {
    pub fn new(block_height: u64, number: u64, prev_block_hash: Hash, total_txs: u64) -> Round {
        Round {
            block_height,
            number,
            prev_block_hash,
            total_txs,
        }
    }
}

impl Default for Round {
    fn default() -> Self {
        Round {
            block_height: 0,
            number: 0,
            prev_block_hash: ZERO_HASH,
            total_txs: 0,
        }
    }
}
