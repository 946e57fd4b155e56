//! Heap walkers: statistics collection and the full consistency check.
use super::map::mapping;
use super::*;

/// Heap statistics collected by walking every block.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Total free payload bytes available.
    pub total_free: usize,
    /// Largest contiguous free block.
    pub largest_free: usize,
    /// Total payload bytes in allocated blocks.
    pub total_used: usize,
    /// Total number of blocks, used and free.
    pub block_count: usize,
    /// Number of free blocks; a fragmentation indicator.
    pub free_count: usize,
    /// Metadata bytes: block headers plus the end sentinel.
    pub overhead: usize,
}

impl<'pool, S: PoolSource, const FLLEN: usize, const SPLIT: usize> Tlsf<'pool, S, FLLEN, SPLIT> {
    /// The first block's header address. The pool must not be empty.
    fn first_block(&mut self) -> Option<NonNull<BlockHdr>> {
        debug_assert!(self.size != 0);
        let base = match self.arena {
            Some(arena) => arena,
            // Safety: An idempotent query; the source must return the
            //         current base without side effects
            None => unsafe { self.source.resize(self.size)? },
        };
        Some(base.cast())
    }

    /// Collect heap statistics by walking every block.
    ///
    /// For dynamic pools this relies on the [`PoolSource`] idempotent-query
    /// contract to recover the arena base; `None` is returned when the
    /// source refuses. An empty pool yields all-zero statistics.
    pub fn stats(&mut self) -> Option<PoolStats> {
        let mut stats = PoolStats::default();
        if self.size == 0 {
            return Some(stats);
        }

        let mut block = self.first_block()?;

        // Safety: The physical chain is terminated by the end sentinel, so
        //         the walk stays within the pool
        unsafe {
            while block.as_ref().size() != 0 {
                let bsize = block.as_ref().size();
                stats.block_count += 1;
                stats.overhead += BLOCK_OVERHEAD;

                if block.as_ref().is_free() {
                    stats.free_count += 1;
                    stats.total_free += bsize;
                    if bsize > stats.largest_free {
                        stats.largest_free = bsize;
                    }
                } else {
                    stats.total_used += bsize;
                }

                block = block_next(block);
            }
        }

        // The end sentinel's header.
        stats.overhead += BLOCK_OVERHEAD;

        Some(stats)
    }

    /// Validate the pool, panicking on the first violated invariant.
    ///
    /// Three passes:
    ///
    /// 1. A physical walk from the first block to the end sentinel checks
    ///    sizes, alignment, the `PREV_FREE` bits against the actual state
    ///    of each predecessor, the coalescing invariant, and that block
    ///    sizes sum to the pool size.
    /// 2. Every bin's free list is walked, cross-checking the bitmaps
    ///    against list emptiness, each member's bin membership, linkage,
    ///    and physical neighbors. Floyd's tortoise-and-hare runs alongside
    ///    to detect cycles with O(1) state.
    /// 3. The free-block counts from the two walks must match.
    ///
    /// Intended for debug builds and tests; an empty pool is valid.
    pub fn check(&mut self) {
        if self.size == 0 {
            return;
        }

        let first = self.first_block().expect("failed to get arena pointer");
        assert!(
            first.as_ptr() as usize % ALIGN_SIZE == 0,
            "arena not aligned"
        );

        // Phase 1: walk all blocks from the pool start to the sentinel.
        let mut block = first;
        let mut prev_block: Option<NonNull<BlockHdr>> = None;
        let mut prev_was_free = false;
        let mut walk_free_count = 0usize;
        let mut total_size = 0usize;

        // Safety: The chain is terminated by the end sentinel; all headers
        //         walked are owned by `self`
        unsafe {
            while block.as_ref().size() != 0 {
                let bsize = block.as_ref().size();

                assert!(bsize >= BLOCK_SIZE_MIN, "block smaller than minimum size");
                assert!(bsize <= Self::BLOCK_SIZE_MAX, "block exceeds maximum size");
                assert!(bsize % ALIGN_SIZE == 0, "block size not aligned");
                assert!(
                    block.as_ptr() as usize % ALIGN_SIZE == 0,
                    "block pointer not aligned"
                );

                if let Some(prev) = prev_block {
                    assert!(
                        block.as_ref().is_prev_free() == prev_was_free,
                        "prev_free bit mismatch with actual previous block state"
                    );
                    if prev_was_free {
                        assert!(
                            block_prev(block) == prev,
                            "previous-block slot doesn't match the previous block"
                        );
                    }
                }

                if block.as_ref().is_free() {
                    walk_free_count += 1;
                    assert!(!prev_was_free, "consecutive free blocks (coalescing failed)");
                    prev_was_free = true;
                } else {
                    prev_was_free = false;
                }

                total_size += bsize + BLOCK_OVERHEAD;
                prev_block = Some(block);
                block = block_next(block);
            }

            // `block` is now the end sentinel.
            assert!(!block.as_ref().is_free(), "sentinel marked as free");
            assert!(
                block.as_ref().is_prev_free() == prev_was_free,
                "sentinel prev_free bit mismatch"
            );
            if prev_was_free {
                if let Some(prev) = prev_block {
                    assert!(
                        block_prev(block) == prev,
                        "sentinel previous-block slot incorrect"
                    );
                }
            }
        }

        total_size += BLOCK_OVERHEAD;
        assert!(total_size == self.size, "block sizes don't sum to pool size");

        // Phase 2: walk every bin's free list and validate the bitmaps.
        let sentinel = self.sentinel_ptr();
        let mut list_free_count = 0usize;

        for i in 0..FLLEN {
            let fl_bit = self.fl_bitmap & (1 << i);
            let sl_map = self.sl_bitmap[i];

            if fl_bit == 0 {
                assert!(sl_map == 0, "SL bitmap non-zero but FL bit is clear");
                for j in 0..SL_COUNT {
                    assert!(
                        self.heads[i][j] == sentinel,
                        "bin head not sentinel but FL bit is clear"
                    );
                }
                continue;
            }

            assert!(sl_map != 0, "FL bit set but SL bitmap is empty");

            for j in 0..SL_COUNT {
                let sl_bit = sl_map & (1 << j);
                let mut list_block = self.heads[i][j];

                if sl_bit == 0 {
                    assert!(
                        list_block == sentinel,
                        "bin head not sentinel but SL bit is clear"
                    );
                    continue;
                }

                assert!(list_block != sentinel, "SL bit set but bin is empty");

                // Floyd's tortoise-and-hare runs in parallel with the
                // walk: the fast pointer advances two steps per iteration,
                // so any cycle collides with it within one lap.
                //
                // Safety: Every list member is a free block owned by
                //         `self`, whose `FreeBlockHdr` view is valid
                unsafe {
                    let mut list_prev = sentinel;
                    let mut fast = list_block;
                    while list_block != sentinel {
                        list_free_count += 1;
                        let hdr = list_block.cast::<BlockHdr>();

                        assert!(hdr.as_ref().is_free(), "block in free list not free");

                        let (fl, sl) = mapping(hdr.as_ref().size());
                        assert!(fl as usize == i && sl as usize == j, "block in wrong bin");

                        assert!(
                            hdr.as_ref().size() >= BLOCK_SIZE_MIN,
                            "free block below minimum size"
                        );
                        assert!(
                            !hdr.as_ref().is_prev_free(),
                            "free block has free predecessor (coalescing violated)"
                        );

                        let next_phys = block_next(hdr);
                        assert!(
                            !next_phys.as_ref().is_free(),
                            "free block has free successor (coalescing violated)"
                        );
                        assert!(
                            next_phys.as_ref().is_prev_free(),
                            "successor doesn't know this block is free"
                        );

                        assert!(
                            list_block.as_ref().prev_free == list_prev,
                            "free list prev pointer incorrect"
                        );
                        if list_prev != sentinel {
                            assert!(
                                list_prev.as_ref().next_free == list_block,
                                "free list next pointer incorrect"
                            );
                        }

                        list_prev = list_block;
                        list_block = list_block.as_ref().next_free;

                        if fast != sentinel {
                            fast = fast.as_ref().next_free;
                        }
                        if fast != sentinel {
                            fast = fast.as_ref().next_free;
                        }
                        assert!(
                            list_block == sentinel || list_block != fast,
                            "cycle in free list (duplicate block or double free)"
                        );
                    }
                }
            }
        }

        // Phase 3: cross-validation.
        assert!(
            walk_free_count == list_free_count,
            "free block count mismatch between block walk and free list walk"
        );
    }
}
