//! KV cache block pool.
//!
//! The [`CacheManager`] owns a fixed arena of cache blocks and is the only
//! component that mutates block ownership. Scheduler and executor call into
//! it under its internal lock, so the free list and reference counts always
//! change together.
//!
//! ## Ownership model
//!
//! ```text
//!                 allocate / extend            release
//!   free list  ───────────────────────►  owned  ─────────►  free list
//!                                        │   ▲
//!                      register_prefix   │   │  reuse
//!                                        ▼   │
//!                               prefix registry (pins)
//! ```
//!
//! - `ref_count`: number of streams whose [`BlockTable`] holds the block.
//! - `registry_pins`: number of cached prefix chains keeping it alive.
//!
//! A block is on the free list iff both are zero. Writing into a block that
//! someone else can read (another stream or the registry) first forks it
//! into a private copy.
//!
//! ## Example
//!
//! ```
//! use nano_batch::core::block::BlockTable;
//! use nano_batch::core::cache_manager::CacheManager;
//! use nano_batch::CacheConfig;
//!
//! let config = CacheConfig { block_size: 4, num_blocks: 8, ..Default::default() };
//! let manager = CacheManager::new(&config);
//!
//! let mut table = BlockTable::new(4);
//! manager.extend(&mut table, 0, 10).unwrap(); // 10 positions -> 3 blocks
//! assert_eq!(manager.num_free_blocks(), 5);
//!
//! manager.release(&mut table).unwrap();
//! assert_eq!(manager.num_free_blocks(), 8);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::CacheConfig;
use crate::core::block::{compute_num_blocks, prefix_signature, Block, BlockCopy, BlockId, BlockTable};
use crate::error::{Error, Result};

/// A cached prefix: the blocks holding the KV of its first `num_tokens`
/// positions.
#[derive(Debug, Clone)]
struct PrefixChain {
    block_ids: Vec<BlockId>,
    num_tokens: usize,
    /// Input the chain was registered from; its first `num_tokens` are the
    /// prefix itself.
    source: Arc<[u32]>,
    last_access: u64,
}

impl PrefixChain {
    fn matches(&self, prefix: &[u32]) -> bool {
        self.source.get(..self.num_tokens) == Some(prefix)
    }
}

/// Result of a successful [`CacheManager::reuse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixMatch {
    /// Signature that matched.
    pub signature: u64,
    /// Shared blocks, in logical order. Their ref counts were incremented.
    pub block_ids: Vec<BlockId>,
    /// Positions already computed in those blocks.
    pub num_tokens: usize,
}

/// Outcome of admitting a stream's input into the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Admission {
    /// Leading input positions served from the prefix registry.
    pub reuse_len: usize,
    /// Copies required before the stream's first round.
    pub copies: Vec<BlockCopy>,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Pool capacity.
    pub total: usize,
    /// Blocks on the free list.
    pub free: usize,
    /// Blocks held by a stream or the registry.
    pub used: usize,
    /// Used blocks that eviction could reclaim right now.
    pub evictable: usize,
    /// Entries in the prefix registry.
    pub cached_prefixes: usize,
}

/// Manages allocation, sharing and release of KV cache blocks.
#[derive(Debug)]
pub struct CacheManager {
    block_size: usize,
    num_blocks: usize,
    enable_reuse: bool,
    enable_eviction: bool,
    state: Mutex<PoolState>,
}

#[derive(Debug)]
struct PoolState {
    /// All blocks indexed by block_id.
    blocks: Vec<Block>,
    /// Free block IDs.
    free_list: VecDeque<BlockId>,
    /// Prefix signature -> cached chain.
    registry: HashMap<u64, PrefixChain>,
    /// Monotonic counter for LRU ordering of registry entries.
    access_counter: u64,
}

impl CacheManager {
    /// Create a manager for a pool of `config.num_blocks` blocks.
    pub fn new(config: &CacheConfig) -> Self {
        let num_blocks = config.num_blocks;
        Self {
            block_size: config.block_size,
            num_blocks,
            enable_reuse: config.enable_reuse,
            enable_eviction: config.enable_prefix_eviction,
            state: Mutex::new(PoolState {
                blocks: (0..num_blocks).map(Block::new).collect(),
                free_list: (0..num_blocks).collect(),
                registry: HashMap::new(),
                access_counter: 0,
            }),
        }
    }

    /// Tokens per block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Pool capacity in blocks.
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Whether prefix reuse is enabled.
    pub fn reuse_enabled(&self) -> bool {
        self.enable_reuse
    }

    /// Blocks needed to hold `num_positions` positions.
    pub fn blocks_for(&self, num_positions: usize) -> usize {
        compute_num_blocks(num_positions, self.block_size)
    }

    /// Number of blocks on the free list.
    pub fn num_free_blocks(&self) -> usize {
        self.state.lock().free_list.len()
    }

    /// Free blocks plus blocks that eviction could reclaim.
    pub fn num_available_blocks(&self) -> usize {
        let state = self.state.lock();
        let evictable = if self.enable_eviction {
            state.num_evictable()
        } else {
            0
        };
        state.free_list.len() + evictable
    }

    /// Stream reference count of a block (0 if free or out of range).
    pub fn ref_count(&self, block_id: BlockId) -> usize {
        self.state
            .lock()
            .blocks
            .get(block_id)
            .map_or(0, Block::ref_count)
    }

    /// Number of cached prefixes.
    pub fn num_cached_prefixes(&self) -> usize {
        self.state.lock().registry.len()
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let free = state.free_list.len();
        CacheStats {
            total: self.num_blocks,
            free,
            used: self.num_blocks - free,
            evictable: state.num_evictable(),
            cached_prefixes: state.registry.len(),
        }
    }

    /// Allocate `block_count` private blocks with ref count 1.
    ///
    /// Idle cached prefixes are evicted first if the free list is short and
    /// eviction is enabled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheExhausted`] without side effects if the demand
    /// cannot be met.
    pub fn allocate(&self, block_count: usize) -> Result<Vec<BlockId>> {
        let mut state = self.state.lock();
        self.reserve(&mut state, block_count)?;
        state.take_free(block_count)
    }

    /// Look up the cached chain for exactly `prefix_tokens`.
    ///
    /// The chain is found by [`prefix_signature`] and then compared token by
    /// token, so a signature collision is a miss. On a hit every block in the
    /// chain gains one stream reference, which the caller must eventually
    /// give back through [`release`](Self::release).
    pub fn reuse(&self, prefix_tokens: &[u32]) -> Option<PrefixMatch> {
        if !self.enable_reuse || prefix_tokens.is_empty() {
            return None;
        }
        let signature = prefix_signature(prefix_tokens, self.block_size);
        let mut state = self.state.lock();
        state.reuse(signature, prefix_tokens)
    }

    /// Make `table` cover `required_positions` positions, writing from
    /// position `write_from` onwards.
    ///
    /// Any block at or after `write_from` that another reader can see is
    /// replaced by a private copy (fork-on-extend); the returned copies must
    /// be applied before the write. The other sharers keep the original
    /// chain untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheExhausted`] without side effects if there are
    /// not enough blocks for the forks plus the new tail.
    pub fn extend(
        &self,
        table: &mut BlockTable,
        write_from: usize,
        required_positions: usize,
    ) -> Result<Vec<BlockCopy>> {
        let mut state = self.state.lock();
        self.extend_locked(&mut state, table, write_from, required_positions)
    }

    /// Admit a stream's input: reuse the longest cached prefix, fork the
    /// reused tail the stream will write into, and allocate blocks for the
    /// rest of the input. All or nothing.
    ///
    /// `declared_prefix_len` (e.g. a system prompt) is tried before
    /// block-aligned prefixes. At least one input position is always left to
    /// compute so the stream gets logits for its first token.
    pub fn admit(
        &self,
        table: &mut BlockTable,
        tokens: &[u32],
        declared_prefix_len: Option<usize>,
    ) -> Result<Admission> {
        let mut state = self.state.lock();

        let matched = if self.enable_reuse && tokens.len() > 1 {
            self.candidate_lengths(tokens, declared_prefix_len)
                .into_iter()
                .find_map(|len| {
                    let prefix = &tokens[..len];
                    state.reuse(prefix_signature(prefix, self.block_size), prefix)
                })
        } else {
            None
        };

        let reuse_len = match &matched {
            Some(m) => {
                for &block_id in &m.block_ids {
                    table.append_block(block_id);
                }
                m.num_tokens.min(tokens.len() - 1)
            }
            None => 0,
        };

        match self.extend_locked(&mut state, table, reuse_len, tokens.len()) {
            Ok(copies) => {
                if let Some(m) = matched {
                    debug!(
                        signature = m.signature,
                        reuse_len,
                        shared_blocks = m.block_ids.len(),
                        "reused cached prefix"
                    );
                }
                Ok(Admission { reuse_len, copies })
            }
            Err(err) => {
                // Undo the references taken by reuse.
                let taken = table.take_blocks();
                state.release_blocks(&taken)?;
                Err(err)
            }
        }
    }

    /// Return every block in `table` to the pool.
    ///
    /// Blocks still referenced by other streams or pinned by the registry
    /// stay owned. Returns the number of blocks that went back to the free
    /// list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheCorrupted`] if a block's reference count would
    /// underflow.
    pub fn release(&self, table: &mut BlockTable) -> Result<usize> {
        let block_ids = table.take_blocks();
        if block_ids.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.lock();
        state.release_blocks(&block_ids)
    }

    /// Record the computed prefixes of `tokens` (held in `table`) so later
    /// streams can reuse them.
    ///
    /// Registers the declared prefix, if any, and every block-aligned prefix.
    /// Existing entries are only refreshed.
    pub fn register_prefix(
        &self,
        tokens: &[u32],
        table: &BlockTable,
        declared_prefix_len: Option<usize>,
    ) {
        if !self.enable_reuse {
            return;
        }
        let mut state = self.state.lock();
        let block_ids = table.get_physical_block_ids();
        let source: Arc<[u32]> = Arc::from(tokens);

        let mut lengths: Vec<usize> = (1..=tokens.len() / self.block_size)
            .map(|k| k * self.block_size)
            .collect();
        if let Some(p) = declared_prefix_len.filter(|&p| p > 0 && p <= tokens.len()) {
            lengths.push(p);
        }

        for num_tokens in lengths {
            let num_chain_blocks = self.blocks_for(num_tokens);
            if num_chain_blocks > block_ids.len() {
                continue;
            }
            let signature = prefix_signature(&tokens[..num_tokens], self.block_size);
            state.register(
                signature,
                &block_ids[..num_chain_blocks],
                num_tokens,
                &source,
                self.block_size,
            );
        }
    }

    /// Evict up to `count` blocks worth of idle cached prefixes (LRU first).
    ///
    /// Returns the number of blocks that went back to the free list.
    pub fn evict_idle_prefixes(&self, count: usize) -> usize {
        let mut state = self.state.lock();
        state.evict_idle(count)
    }

    /// Drop every registry entry. Blocks still used by streams stay owned.
    pub fn clear_prefix_cache(&self) -> usize {
        let mut state = self.state.lock();
        state.evict_idle(usize::MAX);
        let signatures: Vec<u64> = state.registry.keys().copied().collect();
        let mut freed = 0;
        for signature in signatures {
            freed += state.drop_chain(signature);
        }
        freed
    }

    /// Verify the block accounting.
    ///
    /// `stream_holdings` lists the blocks currently held by every live stream
    /// (duplicates allowed across streams for shared prefixes). Checks:
    /// - owned + free == capacity, with no block both free and owned
    /// - no owned block is missing from every holder (leak)
    /// - each block's ref count equals the number of streams holding it
    /// - registry pins match the registry content
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheCorrupted`] describing the first mismatch.
    pub fn check_invariants(&self, stream_holdings: &[Vec<BlockId>]) -> Result<()> {
        let state = self.state.lock();

        let mut on_free_list = vec![false; self.num_blocks];
        for &block_id in &state.free_list {
            let slot = on_free_list.get_mut(block_id).ok_or_else(|| {
                Error::CacheCorrupted(format!("free list holds unknown block {block_id}"))
            })?;
            if *slot {
                return Err(Error::CacheCorrupted(format!(
                    "block {block_id} is on the free list twice"
                )));
            }
            *slot = true;
        }

        let mut expected_refs = vec![0usize; self.num_blocks];
        for &block_id in stream_holdings.iter().flatten() {
            let slot = expected_refs.get_mut(block_id).ok_or_else(|| {
                Error::CacheCorrupted(format!("stream holds unknown block {block_id}"))
            })?;
            *slot += 1;
        }

        let mut expected_pins = vec![0usize; self.num_blocks];
        for chain in state.registry.values() {
            for &block_id in &chain.block_ids {
                if let Some(slot) = expected_pins.get_mut(block_id) {
                    *slot += 1;
                }
            }
        }

        let mut owned = 0;
        for block in &state.blocks {
            let id = block.block_id();
            if block.is_owned() {
                owned += 1;
                if on_free_list[id] {
                    return Err(Error::CacheCorrupted(format!(
                        "block {id} is both free and owned"
                    )));
                }
            } else if !on_free_list[id] {
                return Err(Error::CacheCorrupted(format!(
                    "block {id} is unowned but not on the free list"
                )));
            }
            if block.ref_count() != expected_refs[id] {
                return Err(Error::CacheCorrupted(format!(
                    "block {id} has ref count {} but {} streams hold it",
                    block.ref_count(),
                    expected_refs[id]
                )));
            }
            if block.registry_pins() != expected_pins[id] {
                return Err(Error::CacheCorrupted(format!(
                    "block {id} has {} pins but {} registry chains use it",
                    block.registry_pins(),
                    expected_pins[id]
                )));
            }
        }

        if owned + state.free_list.len() != self.num_blocks {
            return Err(Error::CacheCorrupted(format!(
                "owned {owned} + free {} != capacity {}",
                state.free_list.len(),
                self.num_blocks
            )));
        }
        Ok(())
    }

    /// Make sure `count` blocks sit on the free list, evicting if allowed.
    fn reserve(&self, state: &mut PoolState, count: usize) -> Result<()> {
        if state.free_list.len() < count && self.enable_eviction {
            let shortfall = count - state.free_list.len();
            let freed = state.evict_idle(shortfall);
            if freed > 0 {
                debug!(freed, requested = count, "evicted idle cached prefixes");
            }
        }
        if state.free_list.len() < count {
            return Err(Error::CacheExhausted {
                requested: count,
                available: state.free_list.len(),
            });
        }
        Ok(())
    }

    fn extend_locked(
        &self,
        state: &mut PoolState,
        table: &mut BlockTable,
        write_from: usize,
        required_positions: usize,
    ) -> Result<Vec<BlockCopy>> {
        let first_written = write_from / self.block_size;
        let to_fork: Vec<usize> = (first_written..table.num_blocks())
            .filter(|&idx| {
                let block_id = table.get_physical_block_ids()[idx];
                let write_offset = if idx == first_written {
                    write_from % self.block_size
                } else {
                    0
                };
                state.blocks[block_id].needs_fork(write_offset)
            })
            .collect();
        let fresh = self
            .blocks_for(required_positions)
            .saturating_sub(table.num_blocks());

        self.reserve(state, to_fork.len() + fresh)?;

        let mut copies = Vec::with_capacity(to_fork.len());
        for idx in to_fork {
            let src = table.get_physical_block_ids()[idx];
            let dst = state.take_one()?;
            state.blocks[src].decrement_ref().ok_or_else(|| {
                Error::CacheCorrupted(format!("block {src} forked with zero references"))
            })?;
            table.replace_block(idx, dst);
            copies.push(BlockCopy { src, dst });
        }
        if !copies.is_empty() {
            debug!(forks = copies.len(), "forked shared blocks before write");
        }

        for block_id in state.take_free(fresh)? {
            table.append_block(block_id);
        }
        Ok(copies)
    }

    /// Prefix lengths to try at admission, best first.
    fn candidate_lengths(&self, tokens: &[u32], declared_prefix_len: Option<usize>) -> Vec<usize> {
        let mut lengths = Vec::new();
        if let Some(p) = declared_prefix_len.filter(|&p| p > 0 && p <= tokens.len()) {
            lengths.push(p);
        }
        lengths.extend(
            (1..=tokens.len() / self.block_size)
                .rev()
                .map(|k| k * self.block_size),
        );
        lengths
    }
}

impl PoolState {
    fn take_one(&mut self) -> Result<BlockId> {
        let block_id = self.free_list.pop_front().ok_or(Error::CacheExhausted {
            requested: 1,
            available: 0,
        })?;
        self.blocks[block_id].increment_ref();
        Ok(block_id)
    }

    fn take_free(&mut self, count: usize) -> Result<Vec<BlockId>> {
        if self.free_list.len() < count {
            return Err(Error::CacheExhausted {
                requested: count,
                available: self.free_list.len(),
            });
        }
        (0..count).map(|_| self.take_one()).collect()
    }

    fn release_blocks(&mut self, block_ids: &[BlockId]) -> Result<usize> {
        let mut freed = 0;
        for &block_id in block_ids {
            let block = self.blocks.get_mut(block_id).ok_or_else(|| {
                Error::CacheCorrupted(format!("release of unknown block {block_id}"))
            })?;
            block.decrement_ref().ok_or_else(|| {
                Error::CacheCorrupted(format!("block {block_id} released more than held"))
            })?;
            if !block.is_owned() {
                self.free_list.push_back(block_id);
                freed += 1;
            }
        }
        Ok(freed)
    }

    fn reuse(&mut self, signature: u64, prefix: &[u32]) -> Option<PrefixMatch> {
        self.access_counter += 1;
        let access = self.access_counter;
        let chain = self.registry.get_mut(&signature)?;
        if !chain.matches(prefix) {
            debug!(signature, "prefix signature collision, not reusing");
            return None;
        }
        chain.last_access = access;
        let block_ids = chain.block_ids.clone();
        let num_tokens = chain.num_tokens;
        for &block_id in &block_ids {
            self.blocks[block_id].increment_ref();
        }
        Some(PrefixMatch {
            signature,
            block_ids,
            num_tokens,
        })
    }

    /// Pin `block_ids` as the chain for `source[..num_tokens]`. Each block is
    /// pinned only over the slots the prefix covers.
    fn register(
        &mut self,
        signature: u64,
        block_ids: &[BlockId],
        num_tokens: usize,
        source: &Arc<[u32]>,
        block_size: usize,
    ) {
        self.access_counter += 1;
        let access = self.access_counter;
        if let Some(chain) = self.registry.get_mut(&signature) {
            chain.last_access = access;
            return;
        }
        for (idx, &block_id) in block_ids.iter().enumerate() {
            let extent = num_tokens.saturating_sub(idx * block_size).min(block_size);
            self.blocks[block_id].pin(extent);
        }
        self.registry.insert(
            signature,
            PrefixChain {
                block_ids: block_ids.to_vec(),
                num_tokens,
                source: Arc::clone(source),
                last_access: access,
            },
        );
    }

    /// Remove a registry entry, returning how many blocks became free.
    fn drop_chain(&mut self, signature: u64) -> usize {
        let Some(chain) = self.registry.remove(&signature) else {
            return 0;
        };
        let mut freed = 0;
        for block_id in chain.block_ids {
            let block = &mut self.blocks[block_id];
            if block.unpin().is_some() && !block.is_owned() {
                self.free_list.push_back(block_id);
                freed += 1;
            }
        }
        freed
    }

    fn is_idle(&self, chain: &PrefixChain) -> bool {
        chain
            .block_ids
            .iter()
            .all(|&block_id| self.blocks[block_id].ref_count() == 0)
    }

    /// Evict idle chains in LRU order until `needed` blocks were freed.
    fn evict_idle(&mut self, needed: usize) -> usize {
        let mut idle: Vec<(u64, u64)> = self
            .registry
            .iter()
            .filter(|(_, chain)| self.is_idle(chain))
            .map(|(&signature, chain)| (chain.last_access, signature))
            .collect();
        idle.sort_unstable();

        let mut freed = 0;
        for (_, signature) in idle {
            if freed >= needed {
                break;
            }
            freed += self.drop_chain(signature);
        }
        freed
    }

    /// Blocks that evicting every idle chain would return to the free list.
    fn num_evictable(&self) -> usize {
        let mut idle_pins: HashMap<BlockId, usize> = HashMap::new();
        for chain in self.registry.values().filter(|c| self.is_idle(c)) {
            for &block_id in &chain.block_ids {
                *idle_pins.entry(block_id).or_default() += 1;
            }
        }
        idle_pins
            .into_iter()
            .filter(|&(block_id, pins)| {
                let block = &self.blocks[block_id];
                block.ref_count() == 0 && block.registry_pins() == pins
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(num_blocks: usize, block_size: usize, reuse: bool) -> CacheManager {
        CacheManager::new(&CacheConfig {
            block_size,
            num_blocks,
            enable_reuse: reuse,
            enable_prefix_eviction: true,
        })
    }

    fn holdings(tables: &[&BlockTable]) -> Vec<Vec<BlockId>> {
        tables
            .iter()
            .map(|t| t.get_physical_block_ids().to_vec())
            .collect()
    }

    #[test]
    fn test_manager_creation() {
        let manager = manager(100, 16, false);
        assert_eq!(manager.num_blocks(), 100);
        assert_eq!(manager.block_size(), 16);
        assert_eq!(manager.num_free_blocks(), 100);
        assert_eq!(manager.stats().used, 0);
        manager.check_invariants(&[]).unwrap();
    }

    #[test]
    fn test_allocate_exhaustion_has_no_side_effects() {
        let manager = manager(4, 16, false);
        let blocks = manager.allocate(3).unwrap();
        assert_eq!(blocks.len(), 3);

        let err = manager.allocate(2).unwrap_err();
        assert!(matches!(
            err,
            Error::CacheExhausted {
                requested: 2,
                available: 1
            }
        ));
        assert_eq!(manager.num_free_blocks(), 1);
        manager.check_invariants(&[blocks]).unwrap();
    }

    #[test]
    fn test_extend_grows_tail() {
        let manager = manager(8, 4, false);
        let mut table = BlockTable::new(4);

        assert!(manager.extend(&mut table, 0, 6).unwrap().is_empty());
        assert_eq!(table.num_blocks(), 2);

        // Still within capacity: nothing allocated
        manager.extend(&mut table, 6, 8).unwrap();
        assert_eq!(table.num_blocks(), 2);

        manager.extend(&mut table, 8, 9).unwrap();
        assert_eq!(table.num_blocks(), 3);
        assert_eq!(manager.num_free_blocks(), 5);
    }

    #[test]
    fn test_release_returns_to_free_list() {
        let manager = manager(8, 4, false);
        let mut table = BlockTable::new(4);
        manager.extend(&mut table, 0, 12).unwrap();

        assert_eq!(manager.release(&mut table).unwrap(), 3);
        assert!(table.is_empty());
        assert_eq!(manager.num_free_blocks(), 8);

        // Releasing an empty table is a no-op
        assert_eq!(manager.release(&mut table).unwrap(), 0);
    }

    #[test]
    fn test_register_and_reuse() {
        let manager = manager(8, 4, true);
        let tokens: Vec<u32> = (0..8).collect();
        let mut first = BlockTable::new(4);
        manager.admit(&mut first, &tokens, None).unwrap();
        manager.register_prefix(&tokens, &first, None);
        assert_eq!(manager.num_cached_prefixes(), 2);

        let hit = manager.reuse(&tokens).unwrap();
        assert_eq!(hit.block_ids, first.get_physical_block_ids());
        assert_eq!(hit.num_tokens, 8);
        for &block_id in &hit.block_ids {
            assert_eq!(manager.ref_count(block_id), 2);
        }

        assert!(manager.reuse(&[9, 9]).is_none());
    }

    #[test]
    fn test_reuse_disabled() {
        let manager = manager(8, 4, false);
        let tokens: Vec<u32> = (0..8).collect();
        let mut table = BlockTable::new(4);
        manager.admit(&mut table, &tokens, None).unwrap();
        manager.register_prefix(&tokens, &table, None);
        assert_eq!(manager.num_cached_prefixes(), 0);
        assert!(manager.reuse(&tokens).is_none());
    }

    #[test]
    fn test_admit_reuses_and_forks_written_tail() {
        let manager = manager(8, 4, true);
        let tokens: Vec<u32> = (0..8).collect();

        let mut first = BlockTable::new(4);
        let admission = manager.admit(&mut first, &tokens, None).unwrap();
        assert_eq!(admission.reuse_len, 0);
        manager.register_prefix(&tokens, &first, None);

        // Identical input: everything cached, but the last position must be
        // recomputed, so the last block is forked.
        let mut second = BlockTable::new(4);
        let admission = manager.admit(&mut second, &tokens, None).unwrap();
        assert_eq!(admission.reuse_len, 7);
        assert_eq!(admission.copies.len(), 1);

        let shared = first.get_physical_block_ids()[0];
        assert_eq!(second.get_physical_block_ids()[0], shared);
        assert_eq!(manager.ref_count(shared), 2);
        assert_eq!(admission.copies[0].src, first.get_physical_block_ids()[1]);
        assert_eq!(admission.copies[0].dst, second.get_physical_block_ids()[1]);
        assert_eq!(manager.ref_count(first.get_physical_block_ids()[1]), 1);

        manager.check_invariants(&holdings(&[&first, &second])).unwrap();
    }

    #[test]
    fn test_declared_prefix_is_preferred() {
        let manager = manager(16, 4, true);
        let system: Vec<u32> = vec![7, 7, 7, 7, 7, 7];
        let mut a_tokens = system.clone();
        a_tokens.extend([1, 2, 3]);
        let mut b_tokens = system.clone();
        b_tokens.extend([4, 5]);

        let mut a = BlockTable::new(4);
        manager.admit(&mut a, &a_tokens, Some(6)).unwrap();
        manager.register_prefix(&a_tokens, &a, Some(6));

        let mut b = BlockTable::new(4);
        let admission = manager.admit(&mut b, &b_tokens, Some(6)).unwrap();
        assert_eq!(admission.reuse_len, 6);
        // Block 0 shared, block 1 (holds positions 4..8) forked for writing 6..
        assert_eq!(b.get_physical_block_ids()[0], a.get_physical_block_ids()[0]);
        assert_eq!(admission.copies.len(), 1);
        manager.check_invariants(&holdings(&[&a, &b])).unwrap();
    }

    #[test]
    fn test_release_keeps_shared_blocks() {
        let manager = manager(8, 4, true);
        let tokens: Vec<u32> = (0..9).collect();
        let mut first = BlockTable::new(4);
        manager.admit(&mut first, &tokens, None).unwrap();
        manager.register_prefix(&tokens, &first, None);

        let mut second = BlockTable::new(4);
        let admission = manager.admit(&mut second, &tokens, None).unwrap();
        assert_eq!(admission.reuse_len, 8);
        assert!(admission.copies.is_empty());

        // First stream's private tail is freed; shared blocks remain
        assert_eq!(manager.release(&mut first).unwrap(), 1);
        let shared = second.get_physical_block_ids()[0];
        assert_eq!(manager.ref_count(shared), 1);
        manager.check_invariants(&holdings(&[&second])).unwrap();

        manager.release(&mut second).unwrap();
        let stats = manager.stats();
        assert_eq!(stats.free + stats.used, stats.total);
        assert_eq!(stats.used, 2); // pinned by the registry only
        assert_eq!(stats.evictable, 2);
        manager.check_invariants(&[]).unwrap();
    }

    #[test]
    fn test_eviction_reclaims_idle_prefixes() {
        let manager = manager(4, 4, true);
        let tokens: Vec<u32> = (0..8).collect();
        let mut table = BlockTable::new(4);
        manager.admit(&mut table, &tokens, None).unwrap();
        manager.register_prefix(&tokens, &table, None);
        manager.release(&mut table).unwrap();
        assert_eq!(manager.num_free_blocks(), 2);
        assert_eq!(manager.num_available_blocks(), 4);

        // Needs the whole pool: idle prefixes are evicted
        let blocks = manager.allocate(4).unwrap();
        assert_eq!(blocks.len(), 4);
        assert_eq!(manager.num_cached_prefixes(), 0);
        manager.check_invariants(&[blocks]).unwrap();
    }

    #[test]
    fn test_no_eviction_when_disabled() {
        let manager = CacheManager::new(&CacheConfig {
            block_size: 4,
            num_blocks: 4,
            enable_reuse: true,
            enable_prefix_eviction: false,
        });
        let tokens: Vec<u32> = (0..8).collect();
        let mut table = BlockTable::new(4);
        manager.admit(&mut table, &tokens, None).unwrap();
        manager.register_prefix(&tokens, &table, None);
        manager.release(&mut table).unwrap();

        assert_eq!(manager.num_available_blocks(), 2);
        assert!(matches!(
            manager.allocate(3),
            Err(Error::CacheExhausted { .. })
        ));
        assert_eq!(manager.num_cached_prefixes(), 2);
    }

    #[test]
    fn test_failed_admit_rolls_back_reuse() {
        let manager = manager(3, 4, true);
        let tokens: Vec<u32> = (0..4).collect();
        let mut first = BlockTable::new(4);
        manager.admit(&mut first, &tokens, None).unwrap();
        manager.register_prefix(&tokens, &first, None);
        let hog = manager.allocate(2).unwrap();

        // Shares block 0 but needs 2 more blocks for positions 4..12
        let mut longer: Vec<u32> = tokens.clone();
        longer.extend(4..12);
        let mut second = BlockTable::new(4);
        assert!(manager.admit(&mut second, &longer, None).is_err());
        assert!(second.is_empty());
        assert_eq!(manager.ref_count(first.get_physical_block_ids()[0]), 1);
        manager
            .check_invariants(&[first.get_physical_block_ids().to_vec(), hog])
            .unwrap();
    }

    #[test]
    fn test_owner_writes_past_declared_prefix_in_place() {
        let manager = manager(4, 4, true);
        let tokens: Vec<u32> = (0..7).collect();
        let mut owner = BlockTable::new(4);
        manager.admit(&mut owner, &tokens, Some(6)).unwrap();
        manager.register_prefix(&tokens, &owner, Some(6));
        let before = owner.get_physical_block_ids().to_vec();

        // Position 7 is past the 6 cached positions of the tail block
        assert!(manager.extend(&mut owner, 7, 8).unwrap().is_empty());
        assert_eq!(owner.get_physical_block_ids(), &before[..]);
        assert_eq!(manager.num_free_blocks(), 2);

        // Rewriting a cached slot still forks
        let copies = manager.extend(&mut owner, 5, 8).unwrap();
        assert_eq!(
            copies,
            vec![BlockCopy {
                src: before[1],
                dst: owner.get_physical_block_ids()[1],
            }]
        );
        manager.check_invariants(&holdings(&[&owner])).unwrap();
    }

    #[test]
    fn test_signature_collision_is_a_miss() {
        let manager = manager(8, 4, true);
        let wanted: Vec<u32> = vec![1, 2, 3, 4];
        let other: Vec<u32> = vec![5, 6, 7, 8];
        let mut holder = BlockTable::new(4);
        manager.extend(&mut holder, 0, 4).unwrap();

        // Chain for `other` filed under the signature of `wanted`
        {
            let mut state = manager.state.lock();
            let source: Arc<[u32]> = Arc::from(&other[..]);
            state.register(
                prefix_signature(&wanted, 4),
                holder.get_physical_block_ids(),
                4,
                &source,
                4,
            );
        }

        assert!(manager.reuse(&wanted).is_none());
        assert_eq!(manager.ref_count(holder.get_physical_block_ids()[0]), 1);

        let mut input = wanted.clone();
        input.push(9);
        let mut table = BlockTable::new(4);
        assert_eq!(manager.admit(&mut table, &input, None).unwrap().reuse_len, 0);
        manager.check_invariants(&holdings(&[&holder, &table])).unwrap();
    }

    #[test]
    fn test_check_invariants_detects_mismatch() {
        let manager = manager(4, 4, false);
        let blocks = manager.allocate(2).unwrap();
        // Claim only one holder
        let err = manager.check_invariants(&[vec![blocks[0]]]).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_clear_prefix_cache() {
        let manager = manager(8, 4, true);
        let tokens: Vec<u32> = (0..8).collect();
        let mut table = BlockTable::new(4);
        manager.admit(&mut table, &tokens, None).unwrap();
        manager.register_prefix(&tokens, &table, None);

        // Still referenced by the stream: clearing unpins but frees nothing
        assert_eq!(manager.clear_prefix_cache(), 0);
        assert_eq!(manager.num_cached_prefixes(), 0);
        manager.check_invariants(&holdings(&[&table])).unwrap();

        assert_eq!(manager.release(&mut table).unwrap(), 2);
        assert_eq!(manager.num_free_blocks(), 8);
    }
}
