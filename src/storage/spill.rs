//! Spill file
//!
//! Holds pages that an open batch modified but that the cache had to evict.
//! They cannot go to the page file before the batch's WAL submission is
//! durable, so they are sealed into fixed-size slots of a side file instead.
//!
//! ```text
//!   {table}.spill
//!   ┌──────────┬──────────┬──────────┐
//!   │ slot 0   │ slot 1   │ slot 2   │  each slot: one sealed page
//!   └──────────┴──────────┴──────────┘
//!   page id ──► slot (in memory only)
//! ```
//!
//! The file is created on first use and removed once emptied. Its contents
//! are never needed after a crash: an uncommitted batch is simply gone and a
//! committed one is replayed from the WAL.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::crypto::Cipher;
use crate::error::Result;

use super::file::{seal_page, unseal_page};

#[derive(Debug, Clone, Copy)]
struct Slot {
    index: u64,
    /// Set once the owning batch committed; `Some` carries the LSN to stamp
    committed: Option<Option<u64>>,
}

/// Side file for evicted, uncommitted batch pages
pub struct SpillFile {
    path: PathBuf,
    file: Option<File>,
    page_size: usize,
    physical_page_size: usize,
    cipher: Option<Arc<dyn Cipher>>,

    slots: AHashMap<u32, Slot>,
    free: Vec<u64>,
    next_slot: u64,

    /// Pages the open batch has touched; their write-backs land here
    owned: BTreeSet<u32>,

    writes: u64,
}

impl SpillFile {
    /// Spill file that would sit next to the page file at `pages_path`
    pub fn path_for(pages_path: &Path) -> PathBuf {
        pages_path.with_extension("spill")
    }

    pub fn new(
        pages_path: &Path,
        page_size: usize,
        physical_page_size: usize,
        cipher: Option<Arc<dyn Cipher>>,
    ) -> Self {
        Self {
            path: Self::path_for(pages_path),
            file: None,
            page_size,
            physical_page_size,
            cipher,
            slots: AHashMap::new(),
            free: Vec::new(),
            next_slot: 0,
            owned: BTreeSet::new(),
            writes: 0,
        }
    }

    /// Remove a spill file left behind by a crash
    pub fn discard_stale(pages_path: &Path) -> Result<()> {
        let path = Self::path_for(pages_path);
        if path.exists() {
            warn!(path = %path.display(), "Removing spill file of an interrupted batch");
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Route future write-backs of `page_id` here
    pub fn own(&mut self, page_id: u32) {
        self.owned.insert(page_id);
    }

    /// Whether a write-back of `page_id` belongs in this file
    pub fn holds(&self, page_id: u32) -> bool {
        self.owned.contains(&page_id) || self.slots.contains_key(&page_id)
    }

    /// Whether this file has an image of `page_id`
    pub fn contains(&self, page_id: u32) -> bool {
        self.slots.contains_key(&page_id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn write(&mut self, page_id: u32, data: &[u8]) -> Result<()> {
        let sealed = seal_page(data, self.cipher.as_ref())?;
        // A page of a committed batch stays committed when rewritten
        let (index, committed) = match self.slots.get(&page_id) {
            Some(slot) if !self.owned.contains(&page_id) => (slot.index, slot.committed),
            Some(slot) => (slot.index, None),
            None => {
                let index = self.free.pop().unwrap_or_else(|| {
                    self.next_slot += 1;
                    self.next_slot - 1
                });
                (index, None)
            }
        };

        let offset = index * self.physical_page_size as u64;
        let file = self.open_file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&sealed)?;

        self.slots.insert(page_id, Slot { index, committed });
        self.writes += 1;
        Ok(())
    }

    pub fn read(&mut self, page_id: u32) -> Result<Option<Bytes>> {
        let Some(slot) = self.slots.get(&page_id).copied() else {
            return Ok(None);
        };
        let Some(file) = self.file.as_mut() else {
            return Ok(None);
        };

        let mut raw = vec![0u8; self.physical_page_size];
        file.seek(SeekFrom::Start(slot.index * self.physical_page_size as u64))?;
        file.read_exact(&mut raw)?;

        let unit = format!("spilled page {}", page_id);
        let plain = unseal_page(raw, self.cipher.as_ref(), page_id, self.page_size, &unit)?;
        Ok(Some(Bytes::from(plain)))
    }

    /// The batch committed: its spilled pages may now reach the page file
    pub fn commit(&mut self, commit_lsn: Option<u64>) {
        for slot in self.slots.values_mut() {
            if slot.committed.is_none() {
                slot.committed = Some(commit_lsn);
            }
        }
        self.owned.clear();
    }

    /// Committed pages ready to move to the page file, with their LSN
    pub fn committed(&self) -> Vec<(u32, Option<u64>)> {
        let mut pages: Vec<_> = self
            .slots
            .iter()
            .filter_map(|(&page_id, slot)| slot.committed.map(|lsn| (page_id, lsn)))
            .collect();
        pages.sort_unstable_by_key(|&(page_id, _)| page_id);
        pages
    }

    /// Forget `page_id`'s image, removing the file once nothing is left
    pub fn release(&mut self, page_id: u32) -> Result<()> {
        if let Some(slot) = self.slots.remove(&page_id) {
            self.free.push(slot.index);
        }
        if self.slots.is_empty() && self.owned.is_empty() {
            self.remove_file()?;
        }
        Ok(())
    }

    /// Drop every image and ownership, as when the batch aborts
    pub fn clear(&mut self) -> Result<()> {
        let dropped = self.slots.len();
        self.slots.clear();
        self.owned.clear();
        self.remove_file()?;
        if dropped > 0 {
            debug!(path = %self.path.display(), dropped, "Discarded spilled pages");
        }
        Ok(())
    }

    fn open_file(&mut self) -> Result<&mut File> {
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                let file = OpenOptions::new()
                    .create(true)
                    .read(true)
                    .write(true)
                    .truncate(true)
                    .open(&self.path)?;
                debug!(path = %self.path.display(), "Opened spill file");
                file
            }
        };
        Ok(self.file.insert(file))
    }

    fn remove_file(&mut self) -> Result<()> {
        self.free.clear();
        self.next_slot = 0;
        if self.file.take().is_some() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

impl std::fmt::Debug for SpillFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpillFile")
            .field("path", &self.path)
            .field("pages", &self.slots.len())
            .field("owned", &self.owned.len())
            .finish()
    }
}
