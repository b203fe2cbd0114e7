//! Page cache with CLOCK eviction
//!
//! A fixed number of frames hold page buffers. Each frame carries a reference
//! bit, a pin count and a dirty flag; the cache also owns the
//! [`DirtyPageSet`], which always names exactly the frames whose dirty flag
//! is set.
//!
//! How a victim is chosen:
//! 1. Use an empty frame if there is one
//! 2. Otherwise sweep the hand at most twice around the frames
//! 3. Skip pinned frames
//! 4. A set reference bit is cleared and the hand moves on
//! 5. The first unpinned frame found with a clear bit is the victim
//!
//! Dirty victims are written through the caller's [`PageIo`] before the
//! frame is reused; if the write fails the frame keeps its page.

use std::collections::BTreeSet;

use ahash::AHashMap;
use bytes::Bytes;
use tracing::trace;

use crate::error::{AtlasError, Result};

/// Backing storage the cache loads from and writes back to
pub trait PageIo {
    /// Read (and validate) a page that is not cached
    fn load(&mut self, page_id: u32) -> Result<Bytes>;

    /// Write a page back
    fn store(&mut self, page_id: u32, data: &Bytes) -> Result<()>;
}

/// Pages mutated since they were last written
#[derive(Debug, Default, Clone)]
pub struct DirtyPageSet {
    pages: BTreeSet<u32>,
}

impl DirtyPageSet {
    pub fn insert(&mut self, page_id: u32) -> bool {
        self.pages.insert(page_id)
    }

    pub fn remove(&mut self, page_id: u32) -> bool {
        self.pages.remove(&page_id)
    }

    pub fn contains(&self, page_id: u32) -> bool {
        self.pages.contains(&page_id)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Page ids in ascending order
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.pages.iter().copied()
    }
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Dirty pages written back to make room
    pub writebacks: u64,
}

#[derive(Debug, Default)]
struct Frame {
    page_id: Option<u32>,
    data: Bytes,
    ref_bit: bool,
    pin_count: u32,
    dirty: bool,
}

/// Bounded page cache
pub struct PageCache {
    frames: Vec<Frame>,
    lookup: AHashMap<u32, usize>,
    hand: usize,
    dirty: DirtyPageSet,
    stats: CacheStats,
}

impl PageCache {
    /// Create a cache holding at most `capacity` pages
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: (0..capacity).map(|_| Frame::default()).collect(),
            lookup: AHashMap::with_capacity(capacity),
            hand: 0,
            dirty: DirtyPageSet::default(),
            stats: CacheStats::default(),
        }
    }

    /// Cached buffer for `page_id`, setting its reference bit
    pub fn get(&mut self, page_id: u32) -> Option<Bytes> {
        match self.lookup.get(&page_id) {
            Some(&idx) => {
                let frame = &mut self.frames[idx];
                frame.ref_bit = true;
                self.stats.hits += 1;
                Some(frame.data.clone())
            }
            None => None,
        }
    }

    /// Cached buffer without touching the reference bit or counters
    pub fn peek(&self, page_id: u32) -> Option<Bytes> {
        self.lookup.get(&page_id).map(|&idx| self.frames[idx].data.clone())
    }

    /// Cached buffer for `page_id`, loading it on a miss
    ///
    /// A failed load leaves the cache untouched, so a page that fails
    /// validation is never served.
    pub fn get_or_load(&mut self, page_id: u32, io: &mut impl PageIo) -> Result<Bytes> {
        if let Some(data) = self.get(page_id) {
            return Ok(data);
        }
        self.stats.misses += 1;
        let data = io.load(page_id)?;
        self.install(page_id, data.clone(), false, io)?;
        Ok(data)
    }

    /// Store `data` for `page_id`, evicting another page if needed
    pub fn put(&mut self, page_id: u32, data: Bytes, dirty: bool, io: &mut impl PageIo) -> Result<()> {
        if let Some(&idx) = self.lookup.get(&page_id) {
            let frame = &mut self.frames[idx];
            frame.data = data;
            frame.ref_bit = true;
            if dirty {
                frame.dirty = true;
                self.dirty.insert(page_id);
            }
            return Ok(());
        }
        self.install(page_id, data, dirty, io)
    }

    /// Put back an earlier image of a cached page along with its dirty state
    pub fn restore(&mut self, page_id: u32, data: Bytes, dirty: bool) -> bool {
        let Some(&idx) = self.lookup.get(&page_id) else {
            return false;
        };
        let frame = &mut self.frames[idx];
        frame.data = data;
        frame.dirty = dirty;
        if dirty {
            self.dirty.insert(page_id);
        } else {
            self.dirty.remove(page_id);
        }
        true
    }

    /// Drop `page_id` without writing it back
    pub fn discard(&mut self, page_id: u32) {
        if let Some(idx) = self.lookup.remove(&page_id) {
            self.frames[idx] = Frame::default();
            self.dirty.remove(page_id);
        }
    }

    /// Protect a cached page from eviction
    pub fn pin(&mut self, page_id: u32) -> bool {
        match self.lookup.get(&page_id) {
            Some(&idx) => {
                self.frames[idx].pin_count += 1;
                true
            }
            None => false,
        }
    }

    pub fn unpin(&mut self, page_id: u32) -> bool {
        match self.lookup.get(&page_id) {
            Some(&idx) if self.frames[idx].pin_count > 0 => {
                self.frames[idx].pin_count -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn is_pinned(&self, page_id: u32) -> bool {
        self.lookup
            .get(&page_id)
            .map_or(false, |&idx| self.frames[idx].pin_count > 0)
    }

    pub fn contains(&self, page_id: u32) -> bool {
        self.lookup.contains_key(&page_id)
    }

    /// Write the given dirty pages and mark them clean
    ///
    /// Stops at the first failure; pages not yet written stay dirty.
    pub fn flush_pages(&mut self, pages: &[u32], io: &mut impl PageIo) -> Result<usize> {
        let mut written = 0;
        for &page_id in pages {
            let Some(&idx) = self.lookup.get(&page_id) else {
                continue;
            };
            if !self.frames[idx].dirty {
                continue;
            }
            io.store(page_id, &self.frames[idx].data)?;
            self.frames[idx].dirty = false;
            self.dirty.remove(page_id);
            written += 1;
        }
        Ok(written)
    }

    /// Write every dirty page and mark it clean
    pub fn flush_all(&mut self, io: &mut impl PageIo) -> Result<usize> {
        let pages: Vec<u32> = self.dirty.iter().collect();
        self.flush_pages(&pages, io)
    }

    pub fn dirty_pages(&self) -> &DirtyPageSet {
        &self.dirty
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Number of cached pages
    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    fn install(&mut self, page_id: u32, data: Bytes, dirty: bool, io: &mut impl PageIo) -> Result<()> {
        let idx = self.find_frame(io)?;
        self.frames[idx] = Frame {
            page_id: Some(page_id),
            data,
            ref_bit: true,
            pin_count: 0,
            dirty,
        };
        self.lookup.insert(page_id, idx);
        if dirty {
            self.dirty.insert(page_id);
        }
        Ok(())
    }

    /// Empty frame, or an evicted one
    fn find_frame(&mut self, io: &mut impl PageIo) -> Result<usize> {
        if self.lookup.len() < self.frames.len() {
            if let Some(idx) = self.frames.iter().position(|f| f.page_id.is_none()) {
                return Ok(idx);
            }
        }

        let num_frames = self.frames.len();
        for _ in 0..2 * num_frames {
            let idx = self.hand;
            self.hand = (self.hand + 1) % num_frames;

            let frame = &mut self.frames[idx];
            if frame.pin_count > 0 {
                continue;
            }
            if frame.ref_bit {
                frame.ref_bit = false;
                continue;
            }

            let Some(victim) = frame.page_id else {
                return Ok(idx);
            };
            if frame.dirty {
                io.store(victim, &frame.data)?;
                self.stats.writebacks += 1;
                self.dirty.remove(victim);
            }
            trace!(page_id = victim, "Evicted page");
            self.lookup.remove(&victim);
            self.frames[idx] = Frame::default();
            self.stats.evictions += 1;
            return Ok(idx);
        }

        Err(AtlasError::CapacityExceeded(format!(
            "all {} cache frames are pinned",
            num_frames
        )))
    }
}
