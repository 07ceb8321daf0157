//! Block abstractions for the paged KV cache.
//!
//! The KV cache is divided into fixed-size blocks, similar to how an
//! operating system manages virtual memory with pages. Each stream owns a
//! [`BlockTable`] mapping its logical positions onto physical block ids.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::error::{Error, Result};

/// Physical block identifier (index into the pool arena).
pub type BlockId = usize;

/// Compute a cumulative hash for a block of tokens including its prefix chain.
///
/// The hash includes the parent block's hash, so blocks at the same position
/// with different prefixes hash differently.
///
/// # Example
///
/// ```
/// use nano_batch::core::block::hash_token_block;
///
/// let tokens = [1u32, 2, 3, 4];
/// let hash1 = hash_token_block(&tokens, None);
/// let hash2 = hash_token_block(&tokens, Some(hash1));
///
/// // Same tokens but different prefix chain -> different hash
/// assert_ne!(hash1, hash2);
/// ```
pub fn hash_token_block(token_ids: &[u32], parent_hash: Option<u64>) -> u64 {
    let mut hasher = DefaultHasher::new();

    if let Some(ph) = parent_hash {
        ph.hash(&mut hasher);
    }

    for &token in token_ids {
        token.hash(&mut hasher);
    }

    hasher.finish()
}

/// Content signature of a token prefix.
///
/// Chains [`hash_token_block`] over `block_size` chunks, with the trailing
/// partial chunk hashed last. Prefixes of different lengths never collide by
/// construction of the chain, and two identical prefixes always agree.
///
/// ```
/// use nano_batch::core::block::prefix_signature;
///
/// let system_prompt = [7u32, 7, 7, 7, 1, 2];
/// assert_eq!(prefix_signature(&system_prompt, 4), prefix_signature(&[7, 7, 7, 7, 1, 2], 4));
/// assert_ne!(prefix_signature(&system_prompt, 4), prefix_signature(&system_prompt[..5], 4));
/// ```
pub fn prefix_signature(token_ids: &[u32], block_size: usize) -> u64 {
    let mut parent = None;
    for chunk in token_ids.chunks(block_size.max(1)) {
        parent = Some(hash_token_block(chunk, parent));
    }
    // Mix in the length so an empty prefix has a stable, distinct value.
    hash_token_block(&[token_ids.len() as u32], parent)
}

/// Pool slot for one physical block.
///
/// A block is free iff nothing references it: no stream (`ref_count`) and no
/// prefix-registry entry (`registry_pins`).
#[derive(Debug, Clone, Default)]
pub struct Block {
    /// Unique identifier for this physical block.
    block_id: BlockId,
    /// Number of streams currently referencing this block.
    ref_count: usize,
    /// Number of prefix-registry chains that keep this block cached.
    registry_pins: usize,
    /// Leading slots whose content some pinning chain covers.
    pinned_extent: usize,
}

impl Block {
    /// Create a free block slot with the given id.
    pub fn new(block_id: BlockId) -> Self {
        Self {
            block_id,
            ref_count: 0,
            registry_pins: 0,
            pinned_extent: 0,
        }
    }

    /// Get the block ID.
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// Number of streams referencing this block.
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Number of registry chains pinning this block.
    pub fn registry_pins(&self) -> usize {
        self.registry_pins
    }

    /// Whether any stream or registry entry holds this block.
    pub fn is_owned(&self) -> bool {
        self.ref_count > 0 || self.registry_pins > 0
    }

    /// Whether more than one stream reads this block.
    pub fn is_shared(&self) -> bool {
        self.ref_count > 1
    }

    /// Leading slots protected by registry pins (0 when unpinned).
    pub fn pinned_extent(&self) -> usize {
        self.pinned_extent
    }

    /// Whether a write starting at slot `write_offset` must go to a private
    /// copy: another stream reads the block, or a cached prefix covers the
    /// slots being written.
    pub fn needs_fork(&self, write_offset: usize) -> bool {
        self.ref_count > 1 || (self.registry_pins > 0 && write_offset < self.pinned_extent)
    }

    /// Whether only the registry keeps this block alive.
    pub fn is_idle_cached(&self) -> bool {
        self.ref_count == 0 && self.registry_pins > 0
    }

    /// Increment the stream reference count.
    pub fn increment_ref(&mut self) -> usize {
        self.ref_count += 1;
        self.ref_count
    }

    /// Decrement the stream reference count.
    ///
    /// Returns `None` on underflow, which indicates broken accounting.
    pub fn decrement_ref(&mut self) -> Option<usize> {
        self.ref_count = self.ref_count.checked_sub(1)?;
        Some(self.ref_count)
    }

    /// Add a registry pin covering the first `extent` slots.
    pub fn pin(&mut self, extent: usize) {
        self.registry_pins += 1;
        self.pinned_extent = self.pinned_extent.max(extent);
    }

    /// Remove a registry pin. `None` on underflow.
    ///
    /// The extent only resets once the last pin is gone.
    pub fn unpin(&mut self) -> Option<usize> {
        self.registry_pins = self.registry_pins.checked_sub(1)?;
        if self.registry_pins == 0 {
            self.pinned_extent = 0;
        }
        Some(self.registry_pins)
    }
}

/// Request to duplicate a block's KV content before a stream writes to it.
///
/// Produced by fork-on-extend; the compute collaborator performs the copy
/// before running the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCopy {
    /// Shared block the content is read from.
    pub src: BlockId,
    /// Freshly allocated private block.
    pub dst: BlockId,
}

/// Maps a stream's logical positions to physical block IDs.
///
/// Token at position `p` is stored in:
/// - Logical block: `p / block_size`
/// - Slot within block: `p % block_size`
/// - Physical block: `block_ids[p / block_size]`
///
/// # Example
///
/// ```
/// use nano_batch::core::block::BlockTable;
///
/// let mut table = BlockTable::new(16);
/// table.append_block(5);   // Tokens 0-15
/// table.append_block(12);  // Tokens 16-31
/// table.append_block(3);   // Tokens 32-47
///
/// // Token 20 -> logical block 1 -> physical block 12
/// assert_eq!(table.get_block_id(1).unwrap(), 12);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockTable {
    /// Physical block IDs in logical order.
    block_ids: Vec<BlockId>,
    /// Number of tokens per block.
    block_size: usize,
}

impl BlockTable {
    /// Create a new empty block table.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_ids: Vec::new(),
            block_size,
        }
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get physical block ID for a logical block index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceUnavailable`] if the logical block index is
    /// not allocated.
    pub fn get_block_id(&self, logical_block_idx: usize) -> Result<BlockId> {
        self.block_ids.get(logical_block_idx).copied().ok_or_else(|| {
            Error::ResourceUnavailable(format!(
                "logical block {logical_block_idx} not allocated ({} blocks)",
                self.block_ids.len()
            ))
        })
    }

    /// Add a new physical block to the table.
    pub fn append_block(&mut self, block_id: BlockId) {
        self.block_ids.push(block_id);
    }

    /// Swap the physical block behind a logical index (fork-on-extend).
    pub(crate) fn replace_block(&mut self, logical_block_idx: usize, block_id: BlockId) {
        if let Some(slot) = self.block_ids.get_mut(logical_block_idx) {
            *slot = block_id;
        }
    }

    /// Number of blocks allocated to this stream.
    pub fn num_blocks(&self) -> usize {
        self.block_ids.len()
    }

    /// Number of token positions the allocated blocks can hold.
    pub fn capacity(&self) -> usize {
        self.block_ids.len() * self.block_size
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    /// Get all physical block IDs for this stream.
    pub fn get_physical_block_ids(&self) -> &[BlockId] {
        &self.block_ids
    }

    /// Get physical slot indices for the positions `start..end`.
    ///
    /// Global slot = `block_id * block_size + slot_within_block`. Positions
    /// past the allocated capacity are skipped.
    pub fn get_slot_mapping(&self, start: usize, end: usize) -> Vec<usize> {
        (start..end)
            .filter_map(|pos| {
                self.block_ids
                    .get(pos / self.block_size)
                    .map(|&physical| physical * self.block_size + pos % self.block_size)
            })
            .collect()
    }

    /// Remove and return all blocks.
    pub fn take_blocks(&mut self) -> Vec<BlockId> {
        std::mem::take(&mut self.block_ids)
    }
}

/// Compute number of blocks needed for a sequence of given length.
///
/// # Example
///
/// ```
/// use nano_batch::core::block::compute_num_blocks;
///
/// assert_eq!(compute_num_blocks(35, 16), 3);  // 35 tokens -> 3 blocks
/// assert_eq!(compute_num_blocks(32, 16), 2);  // 32 tokens -> 2 blocks exactly
/// assert_eq!(compute_num_blocks(0, 16), 0);   // 0 tokens -> 0 blocks
/// ```
pub fn compute_num_blocks(seq_len: usize, block_size: usize) -> usize {
    seq_len.div_ceil(block_size)
}
