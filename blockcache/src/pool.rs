//! A fixed pool of block-sized buffers and the metadata describing what each one holds.
//!
//! The pool is allocated once, up front, and never grows. Blocks are addressed by their index
//! (their _slot_) and are lent to the backend while a read fills them.
//!
//! # Recycling
//!
//! When a block is needed for new data, the pool selects the block with the oldest `touched`
//! timestamp among blocks that are not in flight, breaking ties by the lowest slot. Blocks that
//! have never been used (or were reset) carry the oldest possible timestamp, so they are always
//! chosen before any block holding data. The chosen block is claimed for its new identity
//! immediately, before the read that fills it has completed.

use crate::{backend::ReadId, split::Section, Error};
use bytes::BytesMut;
use std::sync::Arc;
use tracing::trace;

/// The file and block-aligned offset whose bytes occupy a block.
pub type Owner = (Arc<str>, u64);

struct Block {
    /// The cached bytes, or `None` while lent to the backend.
    data: Option<BytesMut>,

    /// The identity of the cached bytes, or `None` if the block is unused.
    owner: Option<Owner>,

    /// The number of valid bytes in `data`.
    len: usize,

    /// Logical timestamp of the last hit or fill. Zero if never touched.
    touched: u64,

    /// The backend read currently filling this block.
    in_flight: Option<ReadId>,

    /// Reset the block once its in-flight read completes.
    discard: bool,
}

impl Block {
    fn reset(&mut self) {
        self.owner = None;
        self.len = 0;
        self.touched = 0;
        self.in_flight = None;
        self.discard = false;
    }
}

/// A fixed number of fixed-size cache blocks.
pub struct Pool {
    blocks: Vec<Block>,
    block_size: usize,

    /// The last logical timestamp handed out.
    tick: u64,
}

impl Pool {
    /// Allocate `count` blocks of `block_size` bytes each in a single allocation.
    pub fn new(block_size: usize, count: usize) -> Self {
        let mut arena = BytesMut::zeroed(block_size * count);
        let blocks = (0..count)
            .map(|_| Block {
                data: Some(arena.split_to(block_size)),
                owner: None,
                len: 0,
                touched: 0,
                in_flight: None,
                discard: false,
            })
            .collect();
        Self {
            blocks,
            block_size,
            tick: 0,
        }
    }

    /// The number of blocks in the pool.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the pool has no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// The size of each block.
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Find the block holding (or being filled with) `offset` of `path`.
    ///
    /// Blocks flushed while in flight are skipped: only sections that attached before the flush
    /// may read them.
    pub fn find(&self, path: &str, offset: u64) -> Option<usize> {
        self.blocks.iter().position(|block| {
            !block.discard
                && block
                    .owner
                    .as_ref()
                    .is_some_and(|(owner, at)| *at == offset && **owner == *path)
        })
    }

    /// The read currently filling `slot`, if any.
    pub fn in_flight(&self, slot: usize) -> Option<ReadId> {
        self.blocks[slot].in_flight
    }

    /// Mark `slot` as recently used.
    pub fn touch(&mut self, slot: usize) {
        let tick = self.next_tick();
        self.blocks[slot].touched = tick;
    }

    /// Copy the bytes `section` wants from `slot` into `out`.
    pub fn copy(&self, slot: usize, section: &Section, out: &mut [u8]) -> Result<(), Error> {
        let block = &self.blocks[slot];
        let Some(data) = block.data.as_ref() else {
            return Err(Error::Internal("copy from a block that is in flight"));
        };
        let end = section.block_offset + section.copy_size;
        if end > block.len || out.len() != section.copy_size {
            return Err(Error::Internal("copy outside of cached bytes"));
        }
        out.copy_from_slice(&data[section.block_offset..end]);
        Ok(())
    }

    /// Claim the oldest block that is not in flight for `(path, offset)`.
    ///
    /// Returns the claimed slot along with the identity it previously held, or `None` if every
    /// block is in flight.
    pub fn recycle(&mut self, path: &Arc<str>, offset: u64) -> Option<(usize, Option<Owner>)> {
        let mut oldest: Option<usize> = None;
        for (slot, block) in self.blocks.iter().enumerate() {
            if block.in_flight.is_some() {
                continue;
            }
            match oldest {
                Some(current) if self.blocks[current].touched <= block.touched => {}
                _ => oldest = Some(slot),
            }
        }
        let slot = oldest?;

        let tick = self.next_tick();
        let block = &mut self.blocks[slot];
        let evicted = block.owner.replace((path.clone(), offset));
        block.len = 0;
        block.touched = tick;
        block.discard = false;
        trace!(slot, ?evicted, offset, "recycled block");
        Some((slot, evicted))
    }

    /// Lend the buffer of `slot` to a backend read that will fill `len` bytes.
    ///
    /// `read` receives the buffer and returns the id of the read it issued, which marks the
    /// block as in flight until [Pool::restore] is called.
    pub fn lend(
        &mut self,
        slot: usize,
        len: usize,
        read: impl FnOnce(BytesMut) -> ReadId,
    ) -> Result<ReadId, Error> {
        let block = &mut self.blocks[slot];
        if block.in_flight.is_some() {
            return Err(Error::Internal("block is already in flight"));
        }
        if len > self.block_size {
            block.reset();
            return Err(Error::Internal("read larger than a block"));
        }
        let Some(data) = block.data.take() else {
            return Err(Error::Internal("block has no buffer"));
        };
        let id = read(data);
        block.in_flight = Some(id);
        block.len = len;
        Ok(id)
    }

    /// Return the buffer of `slot` once its read has completed.
    ///
    /// On success the block becomes available for hits (unless it was flushed while in flight).
    /// On failure the block is reset so it can be recycled immediately.
    pub fn restore(
        &mut self,
        slot: usize,
        mut buffer: BytesMut,
        success: bool,
    ) -> Result<(), Error> {
        let tick = self.next_tick();
        let block = &mut self.blocks[slot];
        block.in_flight = None;
        if buffer.len() != self.block_size {
            buffer.resize(self.block_size, 0);
            block.data = Some(buffer);
            block.reset();
            return Err(Error::Internal("backend returned a buffer of the wrong size"));
        }
        block.data = Some(buffer);
        if success {
            block.touched = tick;
        } else {
            block.reset();
        }
        Ok(())
    }

    /// Reset `slot` if it was flushed while in flight. Returns whether it was reset.
    pub fn discard_flushed(&mut self, slot: usize) -> bool {
        let block = &mut self.blocks[slot];
        if !block.discard || block.in_flight.is_some() {
            return false;
        }
        block.reset();
        true
    }

    /// Invalidate every block holding data of `path`. Returns the number of blocks reset
    /// immediately; blocks still in flight are reset when their read completes.
    pub fn flush(&mut self, path: &str) -> usize {
        self.flush_where(|owner| *owner.0 == *path)
    }

    /// Invalidate every block. Returns the number of blocks reset immediately.
    pub fn flush_all(&mut self) -> usize {
        self.flush_where(|_| true)
    }

    fn flush_where(&mut self, matches: impl Fn(&Owner) -> bool) -> usize {
        let mut reset = 0;
        for block in &mut self.blocks {
            if !block.owner.as_ref().is_some_and(&matches) {
                continue;
            }
            if block.in_flight.is_some() {
                block.discard = true;
            } else {
                block.reset();
                reset += 1;
            }
        }
        reset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;

    const BLOCK: usize = 16;

    fn path(name: &str) -> Arc<str> {
        Arc::from(name)
    }

    /// Lend `slot` to a read with the given `id`, returning the lent buffer.
    fn lend(pool: &mut Pool, slot: usize, id: ReadId) -> BytesMut {
        let mut lent = None;
        let issued = pool
            .lend(slot, BLOCK, |buf| {
                lent = Some(buf);
                id
            })
            .unwrap();
        assert_eq!(issued, id);
        lent.unwrap()
    }

    /// Claim a block for `offset` and simulate a successful fill with `value`.
    fn fill(pool: &mut Pool, name: &str, offset: u64, value: u8, id: ReadId) -> usize {
        let (slot, _) = pool.recycle(&path(name), offset).unwrap();
        let mut buf = lend(pool, slot, id);
        buf.fill(value);
        pool.restore(slot, buf, true).unwrap();
        slot
    }

    #[test_traced]
    fn test_pool_fill_and_copy() {
        let mut pool = Pool::new(BLOCK, 2);
        assert_eq!(pool.len(), 2);
        assert!(pool.find("a", 0).is_none());

        let slot = fill(&mut pool, "a", 0, 7, 0);
        assert_eq!(pool.find("a", 0), Some(slot));
        assert!(pool.find("a", BLOCK as u64).is_none());
        assert!(pool.find("b", 0).is_none());

        let section = Section {
            read_offset: 0,
            read_size: BLOCK,
            block_offset: 4,
            output: 0,
            copy_size: 8,
        };
        let mut out = [0u8; 8];
        pool.copy(slot, &section, &mut out).unwrap();
        assert_eq!(out, [7; 8]);

        // Copies past the valid bytes are rejected.
        let section = Section {
            block_offset: 12,
            ..section
        };
        assert!(matches!(
            pool.copy(slot, &section, &mut out),
            Err(Error::Internal(_))
        ));
    }

    #[test_traced]
    fn test_pool_recycle_oldest() {
        let mut pool = Pool::new(BLOCK, 3);

        // Unused blocks are taken in slot order.
        assert_eq!(fill(&mut pool, "a", 0, 0, 0), 0);
        assert_eq!(fill(&mut pool, "a", 16, 1, 1), 1);
        assert_eq!(fill(&mut pool, "a", 32, 2, 2), 2);

        // Touching the oldest block protects it.
        pool.touch(0);
        let (slot, evicted) = pool.recycle(&path("a"), 48).unwrap();
        assert_eq!(slot, 1);
        assert_eq!(evicted, Some((path("a"), 16)));

        // The block is claimed for its new identity before it is filled.
        assert_eq!(pool.find("a", 48), Some(1));
        assert!(pool.find("a", 16).is_none());
    }

    #[test_traced]
    fn test_pool_recycle_skips_in_flight() {
        let mut pool = Pool::new(BLOCK, 2);
        let (first, _) = pool.recycle(&path("a"), 0).unwrap();
        let _buf = lend(&mut pool, first, 0);
        assert_eq!(pool.in_flight(first), Some(0));

        let (second, _) = pool.recycle(&path("a"), 16).unwrap();
        assert_ne!(first, second);
        let _buf2 = lend(&mut pool, second, 1);

        // Every block is in flight.
        assert!(pool.recycle(&path("a"), 32).is_none());

        // Copies from an in-flight block are rejected.
        let section = Section::direct(0, 4, 0);
        let mut out = [0u8; 4];
        assert!(pool.copy(first, &section, &mut out).is_err());
    }

    #[test_traced]
    fn test_pool_failed_fill_resets() {
        let mut pool = Pool::new(BLOCK, 2);
        let resident = fill(&mut pool, "a", 0, 9, 0);

        let (slot, _) = pool.recycle(&path("a"), 16).unwrap();
        let buf = lend(&mut pool, slot, 1);
        pool.restore(slot, buf, false).unwrap();

        // The failed block is unused and the resident block is intact.
        assert!(pool.find("a", 16).is_none());
        assert!(pool.in_flight(slot).is_none());
        assert_eq!(pool.find("a", 0), Some(resident));
        let mut out = [0u8; BLOCK];
        pool.copy(resident, &Section::direct(0, BLOCK, 0), &mut out)
            .unwrap();
        assert_eq!(out, [9; BLOCK]);

        // The failed block is chosen before the resident one.
        let (next, _) = pool.recycle(&path("b"), 0).unwrap();
        assert_eq!(next, slot);
    }

    #[test_traced]
    fn test_pool_wrong_buffer_size() {
        let mut pool = Pool::new(BLOCK, 1);
        let (slot, _) = pool.recycle(&path("a"), 0).unwrap();
        let _ = lend(&mut pool, slot, 0);
        assert!(pool.restore(slot, BytesMut::zeroed(3), true).is_err());
        assert!(pool.find("a", 0).is_none());

        // The block is usable again.
        let (next, _) = pool.recycle(&path("a"), 0).unwrap();
        assert_eq!(next, slot);
        let buf = lend(&mut pool, slot, 1);
        assert_eq!(buf.len(), BLOCK);

        // Reads larger than a block are rejected and release the claim.
        pool.restore(slot, buf, true).unwrap();
        let (slot, _) = pool.recycle(&path("a"), 16).unwrap();
        assert!(matches!(
            pool.lend(slot, BLOCK + 1, |_| 0),
            Err(Error::Internal(_))
        ));
        assert!(pool.find("a", 16).is_none());
    }

    #[test_traced]
    fn test_pool_flush() {
        let mut pool = Pool::new(BLOCK, 3);
        fill(&mut pool, "a", 0, 1, 0);
        fill(&mut pool, "b", 0, 2, 1);
        let (in_flight, _) = pool.recycle(&path("a"), 16).unwrap();
        let buf = lend(&mut pool, in_flight, 2);

        // Only the resident block of "a" is reset immediately.
        assert_eq!(pool.flush("a"), 1);
        assert!(pool.find("a", 0).is_none());
        assert!(pool.find("b", 0).is_some());
        assert_eq!(pool.in_flight(in_flight), Some(2));

        // The in-flight block no longer matches lookups, so the offset is claimed again.
        assert!(pool.find("a", 16).is_none());
        let (reclaimed, _) = pool.recycle(&path("a"), 16).unwrap();
        assert_ne!(reclaimed, in_flight);
        assert_eq!(pool.find("a", 16), Some(reclaimed));

        // The flushed block is reset once its read completes.
        pool.restore(in_flight, buf, true).unwrap();
        assert!(pool.discard_flushed(in_flight));
        assert_eq!(pool.find("a", 16), Some(reclaimed));

        assert_eq!(pool.flush_all(), 2);
        assert!(pool.find("b", 0).is_none());
        assert!(pool.find("a", 16).is_none());
    }
}
