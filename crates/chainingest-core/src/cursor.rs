//! Indexer cursor: tracks the current position in the chain.

use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;
use crate::types::BlockRef;

/// The indexer's current position in the chain.
///
/// The cursor knows:
/// - Which block was last committed (if any)
/// - Which block number must be processed next
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    last: Option<BlockRef>,
    next: u64,
}

impl Cursor {
    /// Resume after `checkpoint`, or start at `start` when there is none.
    pub fn resume(checkpoint: Option<&Checkpoint>, start: u64) -> Self {
        match checkpoint {
            Some(cp) => Self {
                last: Some(cp.last_processed),
                next: cp.last_processed.number + 1,
            },
            None => Self { last: None, next: start },
        }
    }

    /// Returns the next block to process.
    pub fn next_block(&self) -> u64 {
        self.next
    }

    pub fn last(&self) -> Option<&BlockRef> {
        self.last.as_ref()
    }

    /// Returns `true` if `block` is the next block and links to the last one.
    pub fn accepts(&self, block: &BlockRef) -> bool {
        block.number == self.next && self.last.map_or(true, |last| block.extends(&last))
    }

    /// Advance the cursor past a committed block.
    pub fn advance(&mut self, block: BlockRef) {
        self.last = Some(block);
        self.next = block.number + 1;
    }

    /// Move the cursor back after a rollback to `ancestor`.
    pub fn rewind_to(&mut self, ancestor: BlockRef) {
        self.advance(ancestor);
    }

    /// Blocks between the last committed block and `head`.
    pub fn lag(&self, head: u64) -> u64 {
        head.saturating_add(1).saturating_sub(self.next)
    }
}
