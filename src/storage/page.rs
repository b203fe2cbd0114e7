//! Slotted data pages
//!
//! ## Page Layout
//! ```text
//! ┌────────────────┬──────────────┬───────────────┬─────────────────────┐
//! │ Header (32)    │ Slot array → │  free space   │ ← tuples            │
//! └────────────────┴──────────────┴───────────────┴─────────────────────┘
//!                  ^ HEADER       ^ free_start    ^ free_end            ^ page_size
//! ```
//!
//! ## Header Layout (32 bytes, little endian)
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//!   0       2   magic (0x4154)
//!   2       1   page_type
//!   3       1   flags
//!   4       4   page_id
//!   8       4   next_page_id
//!  12       8   lsn (last WAL record applied)
//!  20       4   checksum (CRC32 of the page, excluding this field)
//!  24       2   slot_count
//!  26       2   free_start
//!  28       2   free_end
//!  30       2   free_space (total reclaimable bytes)
//! ```
//!
//! Each slot is `offset (2) | len (2)`; offset 0 marks an empty slot. Slot
//! numbers are stable for the life of a tuple, which is what makes
//! `(page, slot)` usable as a row position.

use crate::error::{AtlasError, Result};

/// Size of the page header in bytes
pub const PAGE_HEADER_SIZE: usize = 32;

/// Size of one slot array entry
pub const SLOT_SIZE: usize = 4;

/// Magic number at the start of every data page ("AT")
pub const PAGE_MAGIC: u16 = 0x4154;

/// Page id meaning "no page"
pub const NO_PAGE: u32 = 0;

const CHECKSUM_OFFSET: usize = 20;

/// Kind of page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Free = 0,
    Data = 1,
}

impl PageType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(PageType::Free),
            1 => Some(PageType::Data),
            _ => None,
        }
    }
}

/// Computes a checksum for a page, excluding the checksum field itself.
pub fn compute_page_checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&data[..CHECKSUM_OFFSET]);
    hasher.update(&data[CHECKSUM_OFFSET + 4..]);
    hasher.finalize()
}

/// Largest tuple a page of `page_size` bytes can hold
pub fn max_tuple_size(page_size: usize) -> usize {
    page_size - PAGE_HEADER_SIZE - SLOT_SIZE
}

/// A page buffer
///
/// `Page<Vec<u8>>` is an owned, mutable page; any other `B` is a read-only
/// view, typically over a cached `Bytes`.
#[derive(Clone, PartialEq, Eq)]
pub struct Page<B = Vec<u8>> {
    data: B,
}

impl Page {
    /// Initialize an empty data page
    pub fn new(page_id: u32, page_size: usize) -> Self {
        let mut page = Self {
            data: vec![0u8; page_size],
        };
        page.put_u16(0, PAGE_MAGIC);
        page.data[2] = PageType::Data as u8;
        page.put_u32(4, page_id);
        page.put_u32(8, NO_PAGE);
        page.set_free_start(PAGE_HEADER_SIZE as u16);
        page.set_free_end(page_size as u16);
        page.set_free_space((page_size - PAGE_HEADER_SIZE) as u16);
        page
    }

    /// Wrap bytes read from disk without validation
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Validate raw bytes as page `page_id`
    pub fn validate(data: &[u8], page_id: u32) -> Result<()> {
        let unit = || format!("page {}", page_id);

        if data.len() < PAGE_HEADER_SIZE {
            return Err(AtlasError::corruption(unit(), format!("short page: {} bytes", data.len())));
        }

        let stored = u32::from_le_bytes(read_array(&data[CHECKSUM_OFFSET..]));
        let computed = compute_page_checksum(data);
        if stored != computed {
            return Err(AtlasError::corruption(
                unit(),
                format!("checksum mismatch: stored {:08x}, computed {:08x}", stored, computed),
            ));
        }

        let magic = u16::from_le_bytes(read_array(&data[0..]));
        if magic != PAGE_MAGIC {
            return Err(AtlasError::corruption(unit(), format!("bad magic {:04x}", magic)));
        }

        let found = u32::from_le_bytes(read_array(&data[4..]));
        if found != page_id {
            return Err(AtlasError::corruption(unit(), format!("header names page {}", found)));
        }

        Ok(())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn set_next_page_id(&mut self, next: u32) {
        self.put_u32(8, next);
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        self.data[12..20].copy_from_slice(&lsn.to_le_bytes());
    }

    /// Store the checksum of the current contents
    pub fn seal(&mut self) {
        let checksum = compute_page_checksum(&self.data);
        self.put_u32(CHECKSUM_OFFSET, checksum);
    }

    fn set_slot_count(&mut self, count: u16) {
        self.put_u16(24, count);
    }

    fn set_free_start(&mut self, v: u16) {
        self.put_u16(26, v);
    }

    fn set_free_end(&mut self, v: u16) {
        self.put_u16(28, v);
    }

    fn set_free_space(&mut self, v: u16) {
        self.put_u16(30, v);
    }

    /// Store `tuple` in the first empty slot (or a new one)
    ///
    /// Returns `None` when the page is full.
    pub fn insert_tuple(&mut self, tuple: &[u8]) -> Option<u16> {
        let slot = self.first_empty_slot().unwrap_or_else(|| self.slot_count());
        if self.put_tuple(slot, tuple) {
            Some(slot)
        } else {
            None
        }
    }

    /// Store `tuple` in `slot`, replacing whatever is there
    ///
    /// Extends the slot array with empty slots when `slot` is past its end.
    /// Returns false (leaving the page untouched) when the tuple does not fit.
    pub fn put_tuple(&mut self, slot: u16, tuple: &[u8]) -> bool {
        let old = self.slot(slot).filter(|(offset, _)| *offset != 0);
        let old_len = old.map(|(_, len)| len as usize).unwrap_or(0);
        let count = self.slot_count();
        let new_slots = if slot >= count { (slot - count + 1) as usize } else { 0 };

        if tuple.len() + new_slots * SLOT_SIZE > self.free_space() + old_len {
            return false;
        }

        // Shrinking or same-size replacement stays where it is
        if let Some((offset, len)) = old {
            if tuple.len() <= len as usize {
                let start = offset as usize;
                self.data[start..start + tuple.len()].copy_from_slice(tuple);
                self.set_slot(slot, offset, tuple.len() as u16);
                self.set_free_space((self.free_space() + old_len - tuple.len()) as u16);
                return true;
            }
            self.set_slot(slot, 0, 0);
            self.set_free_space((self.free_space() + old_len) as u16);
        }

        if self.contiguous_free_space() < tuple.len() + new_slots * SLOT_SIZE {
            self.compact();
        }

        if new_slots > 0 {
            let start = self.free_start() as usize;
            let added = new_slots * SLOT_SIZE;
            self.data[start..start + added].fill(0);
            self.set_free_start((start + added) as u16);
            self.set_slot_count(slot + 1);
            self.set_free_space((self.free_space() - added) as u16);
        }

        let end = self.free_end() as usize - tuple.len();
        self.data[end..end + tuple.len()].copy_from_slice(tuple);
        self.set_free_end(end as u16);
        self.set_slot(slot, end as u16, tuple.len() as u16);
        self.set_free_space((self.free_space() - tuple.len()) as u16);
        true
    }

    /// Empty `slot`, returning whether it held a tuple
    pub fn remove_tuple(&mut self, slot: u16) -> bool {
        match self.slot(slot) {
            Some((offset, len)) if offset != 0 => {
                self.set_slot(slot, 0, 0);
                self.set_free_space((self.free_space() + len as usize) as u16);
                true
            }
            _ => false,
        }
    }

    /// Move all live tuples to the end of the page, closing gaps
    pub fn compact(&mut self) {
        let live: Vec<(u16, Vec<u8>)> = self.tuples().map(|(s, t)| (s, t.to_vec())).collect();
        let mut end = self.data.len();
        for (slot, tuple) in live {
            end -= tuple.len();
            self.data[end..end + tuple.len()].copy_from_slice(&tuple);
            self.set_slot(slot, end as u16, tuple.len() as u16);
        }
        let start = self.free_start() as usize;
        self.data[start..end].fill(0);
        self.set_free_end(end as u16);
    }

    fn set_slot(&mut self, slot: u16, offset: u16, len: u16) {
        let at = PAGE_HEADER_SIZE + slot as usize * SLOT_SIZE;
        self.put_u16(at, offset);
        self.put_u16(at + 2, len);
    }

    fn put_u16(&mut self, at: usize, v: u16) {
        self.data[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u32(&mut self, at: usize, v: u32) {
        self.data[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }
}

impl<B: AsRef<[u8]>> Page<B> {
    /// Read-only view over an existing page buffer
    pub fn view(data: B) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_ref()
    }

    // =========================================================================
    // Header fields
    // =========================================================================

    pub fn page_id(&self) -> u32 {
        self.get_u32(4)
    }

    pub fn page_type(&self) -> PageType {
        PageType::from_u8(self.as_bytes()[2]).unwrap_or(PageType::Free)
    }

    pub fn next_page_id(&self) -> u32 {
        self.get_u32(8)
    }

    /// LSN of the last WAL record applied to this page
    pub fn lsn(&self) -> u64 {
        u64::from_le_bytes(read_array(&self.as_bytes()[12..]))
    }

    pub fn checksum(&self) -> u32 {
        self.get_u32(CHECKSUM_OFFSET)
    }

    pub fn verify_checksum(&self) -> bool {
        self.checksum() == compute_page_checksum(self.as_bytes())
    }

    pub fn slot_count(&self) -> u16 {
        self.get_u16(24)
    }

    /// Bytes available after compaction
    pub fn free_space(&self) -> usize {
        self.get_u16(30) as usize
    }

    /// Bytes available without compaction
    pub fn contiguous_free_space(&self) -> usize {
        (self.free_end() - self.free_start()) as usize
    }

    fn free_start(&self) -> u16 {
        self.get_u16(26)
    }

    fn free_end(&self) -> u16 {
        self.get_u16(28)
    }

    // =========================================================================
    // Tuples
    // =========================================================================

    /// Tuple stored in `slot`, if any
    pub fn tuple(&self, slot: u16) -> Option<&[u8]> {
        let (offset, len) = self.slot(slot)?;
        if offset == 0 {
            return None;
        }
        let start = offset as usize;
        self.as_bytes().get(start..start + len as usize)
    }

    /// Live tuples in slot order
    pub fn tuples(&self) -> impl Iterator<Item = (u16, &[u8])> + '_ {
        (0..self.slot_count()).filter_map(move |slot| self.tuple(slot).map(|t| (slot, t)))
    }

    pub fn live_count(&self) -> usize {
        self.tuples().count()
    }

    /// Whether `len` more bytes fit in a new slot
    pub fn can_fit(&self, len: usize) -> bool {
        let slot_cost = if self.first_empty_slot().is_some() { 0 } else { SLOT_SIZE };
        len + slot_cost <= self.free_space()
    }

    fn first_empty_slot(&self) -> Option<u16> {
        (0..self.slot_count()).find(|&s| matches!(self.slot(s), Some((0, _))))
    }

    fn slot(&self, slot: u16) -> Option<(u16, u16)> {
        if slot >= self.slot_count() {
            return None;
        }
        let at = PAGE_HEADER_SIZE + slot as usize * SLOT_SIZE;
        Some((self.get_u16(at), self.get_u16(at + 2)))
    }

    fn get_u16(&self, at: usize) -> u16 {
        u16::from_le_bytes(read_array(&self.as_bytes()[at..]))
    }

    fn get_u32(&self, at: usize) -> u32 {
        u32::from_le_bytes(read_array(&self.as_bytes()[at..]))
    }
}

impl<B: AsRef<[u8]>> std::fmt::Debug for Page<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("page_id", &self.page_id())
            .field("lsn", &self.lsn())
            .field("slot_count", &self.slot_count())
            .field("free_space", &self.free_space())
            .finish()
    }
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}
