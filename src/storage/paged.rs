//! Page-based row store
//!
//! Rows are encoded tuples in slotted pages, updated and deleted in place.
//! Pages flow through the [`PageCache`]; a mutation only marks its page
//! dirty, and dirty pages reach the file on eviction or an explicit flush.
//!
//! Mutations happen inside a unit (one WAL submission). A statement unit
//! pins every page it touches and keeps before-images in memory, so
//! uncommitted bytes never reach the file:
//! - the first touch of a page records its before-image
//! - newly allocated pages are remembered so a rollback can discard them
//!
//! A batch unit may touch more pages than the cache holds, so it pins
//! nothing. On first touch the committed image is written to the page file,
//! and from then on evictions of that page go to the [`SpillFile`]. Rolling
//! back drops the spill and the cached copies; committing lets the spilled
//! pages drain into the page file with the next flush.
//!
//! `commit_unit` stamps each touched page with the commit LSN and unpins it;
//! `rollback_unit` puts the before-images back. A statement unit can also be
//! detached while its submission is in flight and finished or undone later.
//!
//! Pages that fail validation when the store is opened are recorded as
//! damaged. Reading one fails with `StorageCorruption`; the rest of the
//! store stays usable.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::crypto::Cipher;
use crate::error::{AtlasError, Result};
use crate::row::{decode_row, encode_row, Row, RowPosition, Schema};
use crate::wal::LogOperation;

use super::cache::{CacheStats, PageCache, PageIo};
use super::file::PageFile;
use super::page::{max_tuple_size, Page, SLOT_SIZE};
use super::spill::SpillFile;
use super::FlushReport;

/// Counters for a page store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageStoreStats {
    pub page_count: u32,
    pub live_rows: u64,
    pub dirty_pages: usize,
    pub cached_pages: usize,
    pub cache: CacheStats,
    pub page_writes: u64,
    pub syncs: u64,
    /// Pages found damaged when the store was opened
    pub damaged_pages: usize,
    /// Batch pages evicted to the spill file
    pub spill_writes: u64,
}

/// Free bytes per page, searchable by size
#[derive(Debug, Default)]
struct SpaceMap {
    by_page: AHashMap<u32, usize>,
    by_space: BTreeSet<(usize, u32)>,
}

impl SpaceMap {
    fn set(&mut self, page_id: u32, free: usize) {
        if let Some(old) = self.by_page.insert(page_id, free) {
            self.by_space.remove(&(old, page_id));
        }
        self.by_space.insert((free, page_id));
    }

    fn remove(&mut self, page_id: u32) {
        if let Some(old) = self.by_page.remove(&page_id) {
            self.by_space.remove(&(old, page_id));
        }
    }

    /// Page with the least free space that still holds `needed` bytes
    fn find(&self, needed: usize) -> Option<u32> {
        self.by_space
            .range((needed, 0)..)
            .next()
            .map(|&(_, page_id)| page_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitKind {
    Statement,
    Batch,
}

/// What a page looked like before the unit touched it
#[derive(Debug)]
enum Before {
    /// Cached image and its dirty flag; the page stays pinned
    Image { data: Bytes, dirty: bool },
    /// Allocated inside the unit
    Allocated,
    /// Batch page whose committed image sits in the page file
    OnDisk { free: usize },
}

/// Before-images of one unit
#[derive(Debug)]
struct PageUnit {
    kind: UnitKind,
    before: BTreeMap<u32, Before>,
    page_count: u32,
    live_rows: u64,
}

/// A statement unit taken out of the store while its submission is in flight
///
/// Its pages stay pinned until it is passed to [`PageStore::finish_unit`] or
/// [`PageStore::undo_unit`]. Detached units must be undone newest first.
#[derive(Debug)]
pub struct PageUndo {
    unit: PageUnit,
}

/// Everything behind the cache: page file, spill file, damaged pages
struct DiskIo {
    file: PageFile,
    spill: SpillFile,
    /// Page id to the reason it failed validation
    damaged: BTreeMap<u32, String>,
}

impl PageIo for DiskIo {
    fn load(&mut self, page_id: u32) -> Result<Bytes> {
        if let Some(reason) = self.damaged.get(&page_id) {
            return Err(AtlasError::corruption(
                format!("page {} of '{}'", page_id, self.file.table()),
                reason.clone(),
            ));
        }
        if let Some(data) = self.spill.read(page_id)? {
            return Ok(data);
        }
        Ok(match self.file.read_page(page_id)? {
            Some(data) => Bytes::from(data),
            None => Bytes::from(Page::new(page_id, self.file.page_size()).into_bytes()),
        })
    }

    fn store(&mut self, page_id: u32, data: &Bytes) -> Result<()> {
        if self.spill.holds(page_id) {
            return self.spill.write(page_id, data);
        }
        self.file.write_page(page_id, data)
    }
}

/// Reason to record for a page that failed validation on open
fn damage_reason(error: &AtlasError) -> Option<String> {
    match error {
        AtlasError::StorageCorruption { reason, .. } => Some(reason.clone()),
        AtlasError::AuthenticationFailure(reason) => {
            Some(format!("authentication failed: {}", reason))
        }
        _ => None,
    }
}

/// Row store over fixed-size slotted pages
pub struct PageStore {
    table: String,
    schema: Schema,
    page_size: usize,

    io: Mutex<DiskIo>,
    cache: Mutex<PageCache>,

    /// Highest allocated page id
    page_count: u32,
    space: SpaceMap,
    live_rows: u64,

    unit: Option<PageUnit>,

    /// Bumped on every page mutation
    mutation_seq: u64,
}

impl PageStore {
    /// Create an empty store at `path`
    pub fn create(
        path: &Path,
        table: &str,
        schema: Schema,
        page_size: usize,
        cache_capacity: usize,
        cipher: Option<Arc<dyn Cipher>>,
    ) -> Result<Self> {
        let file = PageFile::create(path, table, page_size, cipher)?;
        SpillFile::discard_stale(path)?;
        info!(table, page_size, "Created page store");
        Ok(Self::from_file(path, file, schema, cache_capacity))
    }

    /// Open an existing store and build its free-space map
    ///
    /// Pages that fail validation are recorded as damaged instead of failing
    /// the open, unless no page authenticates at all (a wrong key).
    pub fn open(
        path: &Path,
        schema: Schema,
        cache_capacity: usize,
        cipher: Option<Arc<dyn Cipher>>,
    ) -> Result<Self> {
        let file = PageFile::open(path, cipher)?;
        SpillFile::discard_stale(path)?;
        let mut store = Self::from_file(path, file, schema, cache_capacity);

        // Scan straight from the file so the cache starts cold
        let io = store.io.get_mut();
        let mut live_rows = 0;
        let mut authenticated = 0u32;
        let mut key_failure = None;
        for page_id in 1..=store.page_count {
            match io.file.read_page(page_id) {
                Ok(Some(data)) => {
                    let page = Page::view(&data[..]);
                    live_rows += page.live_count() as u64;
                    store.space.set(page_id, page.free_space());
                    authenticated += 1;
                }
                Ok(None) => {
                    let page = Page::new(page_id, store.page_size);
                    store.space.set(page_id, page.free_space());
                }
                Err(e) => {
                    let Some(reason) = damage_reason(&e) else {
                        return Err(e);
                    };
                    warn!(table = %store.table, page_id, error = %e, "Damaged page, its rows are unavailable");
                    io.damaged.insert(page_id, reason);
                    if matches!(e, AtlasError::AuthenticationFailure(_)) && key_failure.is_none() {
                        key_failure = Some(e);
                    }
                }
            }
        }
        if authenticated == 0 {
            if let Some(e) = key_failure {
                return Err(e);
            }
        }
        store.live_rows = live_rows;

        info!(
            table = %store.table,
            pages = store.page_count,
            rows = store.live_rows,
            damaged = io.damaged.len(),
            "Opened page store"
        );
        Ok(store)
    }

    fn from_file(path: &Path, file: PageFile, schema: Schema, cache_capacity: usize) -> Self {
        let spill = SpillFile::new(
            path,
            file.page_size(),
            file.physical_page_size(),
            file.cipher().cloned(),
        );
        Self {
            table: file.table().to_string(),
            page_size: file.page_size(),
            page_count: file.page_count(),
            io: Mutex::new(DiskIo {
                file,
                spill,
                damaged: BTreeMap::new(),
            }),
            cache: Mutex::new(PageCache::new(cache_capacity)),
            schema,
            space: SpaceMap::default(),
            live_rows: 0,
            unit: None,
            mutation_seq: 0,
        }
    }

    // =========================================================================
    // Page access
    // =========================================================================

    /// Read page `page_id` through the cache
    ///
    /// The bytes are checksum-validated (and decrypted) when they come from
    /// disk; a page that fails validation is never cached. A cache hit does
    /// not touch the file lock.
    pub fn read(&self, page_id: u32) -> Result<Bytes> {
        self.check_page_id(page_id)?;
        let mut cache = self.cache.lock();
        if let Some(data) = cache.get(page_id) {
            return Ok(data);
        }
        let mut io = self.io.lock();
        cache.get_or_load(page_id, &mut *io)
    }

    /// Replace page `page_id` and mark it dirty without flushing
    pub fn write(&mut self, page_id: u32, data: Bytes) -> Result<()> {
        self.check_page_id(page_id)?;
        if data.len() != self.page_size {
            return Err(AtlasError::InvalidPosition(u64::from(page_id)));
        }
        self.load_for_write(page_id)?;
        let free = Page::view(&data[..]).free_space();
        let cache = self.cache.get_mut();
        let io = self.io.get_mut();
        cache.put(page_id, data, true, io)?;
        self.space.set(page_id, free);
        self.mutation_seq += 1;
        Ok(())
    }

    fn check_page_id(&self, page_id: u32) -> Result<()> {
        if page_id == 0 || page_id > self.page_count {
            return Err(AtlasError::InvalidPosition(u64::from(page_id)));
        }
        Ok(())
    }

    /// Load a page for mutation and record its before-image
    fn load_for_write(&mut self, page_id: u32) -> Result<Bytes> {
        let cache = self.cache.get_mut();
        let io = self.io.get_mut();
        let data = cache.get_or_load(page_id, io)?;

        let Some(unit) = &mut self.unit else {
            return Ok(data);
        };
        if unit.before.contains_key(&page_id) {
            return Ok(data);
        }
        match unit.kind {
            UnitKind::Statement => {
                let dirty = cache.dirty_pages().contains(page_id);
                cache.pin(page_id);
                unit.before.insert(
                    page_id,
                    Before::Image {
                        data: data.clone(),
                        dirty,
                    },
                );
            }
            UnitKind::Batch => {
                // The page file must hold the committed image before write-backs divert
                cache.flush_pages(&[page_id], io)?;
                io.spill.own(page_id);
                let free = Page::view(&data[..]).free_space();
                unit.before.insert(page_id, Before::OnDisk { free });
            }
        }
        Ok(data)
    }

    /// Apply `f` to a copy of the page and install the result if it succeeds
    fn modify<T>(&mut self, page_id: u32, f: impl FnOnce(&mut Page) -> Result<T>) -> Result<T> {
        let data = self.load_for_write(page_id)?;
        let mut page = Page::from_bytes(data.to_vec());
        let out = f(&mut page)?;

        let free = page.free_space();
        let cache = self.cache.get_mut();
        let io = self.io.get_mut();
        cache.put(page_id, Bytes::from(page.into_bytes()), true, io)?;
        self.space.set(page_id, free);
        self.mutation_seq += 1;
        Ok(out)
    }

    /// Append a fresh, empty page
    fn allocate(&mut self) -> Result<u32> {
        let page_id = self
            .page_count
            .checked_add(1)
            .ok_or_else(|| AtlasError::CapacityExceeded("page id space exhausted".to_string()))?;
        let page = Page::new(page_id, self.page_size);
        let free = page.free_space();

        let cache = self.cache.get_mut();
        let io = self.io.get_mut();
        if let Some(UnitKind::Batch) = self.unit.as_ref().map(|unit| unit.kind) {
            io.spill.own(page_id);
        }
        cache.put(page_id, Bytes::from(page.into_bytes()), true, io)?;
        if let Some(unit) = &mut self.unit {
            if unit.kind == UnitKind::Statement {
                cache.pin(page_id);
            }
            unit.before.insert(page_id, Before::Allocated);
        }

        self.page_count = page_id;
        self.space.set(page_id, free);
        self.mutation_seq += 1;
        Ok(page_id)
    }

    // =========================================================================
    // Rows
    // =========================================================================

    /// Encode `row`, rejecting tuples that cannot fit in an empty page
    pub fn encode(&self, row: &Row) -> Result<Vec<u8>> {
        let tuple = encode_row(&self.schema, row)?;
        let max = max_tuple_size(self.page_size);
        if tuple.len() > max {
            return Err(AtlasError::RowTooLarge {
                size: tuple.len(),
                max,
            });
        }
        Ok(tuple)
    }

    /// Place a row in the fullest page that has room for it
    pub fn insert(&mut self, row: &Row) -> Result<RowPosition> {
        let tuple = self.encode(row)?;
        self.insert_tuple(&tuple)
    }

    fn insert_tuple(&mut self, tuple: &[u8]) -> Result<RowPosition> {
        if let Some(page_id) = self.space.find(tuple.len() + SLOT_SIZE) {
            if let Some(slot) = self.modify(page_id, |page| Ok(page.insert_tuple(tuple)))? {
                self.live_rows += 1;
                return Ok(RowPosition::from_page_slot(page_id, slot));
            }
        }

        let page_id = self.allocate()?;
        let slot = self.modify(page_id, |page| {
            page.insert_tuple(tuple).ok_or(AtlasError::RowTooLarge {
                size: tuple.len(),
                max: max_tuple_size(page.as_bytes().len()),
            })
        })?;
        self.live_rows += 1;
        Ok(RowPosition::from_page_slot(page_id, slot))
    }

    /// Replace the row at `position`
    ///
    /// Stays in place when the new tuple fits in its page; otherwise the row
    /// moves and the new position is returned.
    pub fn update(&mut self, position: RowPosition, row: &Row) -> Result<RowPosition> {
        let tuple = self.encode(row)?;
        let (page_id, slot) = self.locate(position)?;

        let placed = self.modify(page_id, |page| {
            if page.tuple(slot).is_none() {
                return Err(AtlasError::InvalidPosition(position.as_u64()));
            }
            Ok(page.put_tuple(slot, &tuple))
        })?;
        if placed {
            return Ok(position);
        }

        self.modify(page_id, |page| Ok(page.remove_tuple(slot)))?;
        self.live_rows -= 1;
        let moved = self.insert_tuple(&tuple)?;
        debug!(table = %self.table, from = %position, to = %moved, "Row moved on update");
        Ok(moved)
    }

    /// Remove the row at `position`, returning it
    pub fn delete(&mut self, position: RowPosition) -> Result<Row> {
        let (page_id, slot) = self.locate(position)?;
        let schema = &self.schema;
        let old = {
            let data = self.read(page_id)?;
            let page = Page::view(&data[..]);
            let tuple = page
                .tuple(slot)
                .ok_or(AtlasError::InvalidPosition(position.as_u64()))?;
            decode_row(schema, tuple)?
        };
        self.modify(page_id, |page| Ok(page.remove_tuple(slot)))?;
        self.live_rows -= 1;
        Ok(old)
    }

    /// Row at `position`, if one is stored there
    pub fn get(&self, position: RowPosition) -> Result<Option<Row>> {
        let (page_id, slot) = match self.locate(position) {
            Ok(location) => location,
            Err(_) => return Ok(None),
        };
        let data = self.read(page_id)?;
        let page = Page::view(&data[..]);
        page.tuple(slot)
            .map(|tuple| decode_row(&self.schema, tuple))
            .transpose()
    }

    /// Every live row, in page then slot order
    pub fn scan(&self) -> Result<Vec<(RowPosition, Row)>> {
        let mut rows = Vec::with_capacity(self.live_rows as usize);
        for page_id in 1..=self.page_count {
            let data = self.read(page_id)?;
            let page = Page::view(&data[..]);
            for (slot, tuple) in page.tuples() {
                rows.push((
                    RowPosition::from_page_slot(page_id, slot),
                    decode_row(&self.schema, tuple)?,
                ));
            }
        }
        Ok(rows)
    }

    /// Every live row on pages that are not damaged
    pub fn scan_intact(&self) -> Result<Vec<(RowPosition, Row)>> {
        let damaged = self.damaged_pages();
        if damaged.is_empty() {
            return self.scan();
        }
        let mut rows = Vec::with_capacity(self.live_rows as usize);
        for page_id in (1..=self.page_count).filter(|id| damaged.binary_search(id).is_err()) {
            let data = self.read(page_id)?;
            let page = Page::view(&data[..]);
            for (slot, tuple) in page.tuples() {
                rows.push((
                    RowPosition::from_page_slot(page_id, slot),
                    decode_row(&self.schema, tuple)?,
                ));
            }
        }
        Ok(rows)
    }

    fn locate(&self, position: RowPosition) -> Result<(u32, u16)> {
        let page_id = position.page_id();
        if page_id == 0 || page_id > self.page_count {
            return Err(AtlasError::InvalidPosition(position.as_u64()));
        }
        Ok((page_id, position.slot()))
    }

    // =========================================================================
    // Units
    // =========================================================================

    /// Open a statement unit: touched pages are pinned until it ends
    pub fn begin_unit(&mut self) -> Result<()> {
        self.open_unit(UnitKind::Statement)
    }

    /// Open a batch unit, which may touch more pages than the cache holds
    ///
    /// Spilled pages of an earlier batch are moved to the page file first.
    pub fn begin_batch_unit(&mut self) -> Result<()> {
        if self.unit.is_none() {
            self.drain_spill()?;
        }
        self.open_unit(UnitKind::Batch)
    }

    fn open_unit(&mut self, kind: UnitKind) -> Result<()> {
        if self.unit.is_some() {
            return Err(AtlasError::BatchState(format!(
                "unit already open on '{}'",
                self.table
            )));
        }
        self.unit = Some(PageUnit {
            kind,
            before: BTreeMap::new(),
            page_count: self.page_count,
            live_rows: self.live_rows,
        });
        Ok(())
    }

    pub fn in_unit(&self) -> bool {
        self.unit.is_some()
    }

    /// Publish the unit: stamp touched pages with `commit_lsn` and unpin them
    ///
    /// Returns the touched page ids in ascending order.
    pub fn commit_unit(&mut self, commit_lsn: Option<u64>) -> Result<Vec<u32>> {
        match self.unit.take() {
            Some(unit) => self.finish(unit, commit_lsn),
            None => Ok(Vec::new()),
        }
    }

    /// Undo every page change made since `begin_unit`
    pub fn rollback_unit(&mut self) {
        if let Some(unit) = self.unit.take() {
            self.undo(unit);
        }
    }

    /// Take the open unit out so another one can begin
    pub fn detach_unit(&mut self) -> Option<PageUndo> {
        self.unit.take().map(|unit| PageUndo { unit })
    }

    /// Publish a detached unit once its submission is durable
    pub fn finish_unit(&mut self, undo: PageUndo, commit_lsn: Option<u64>) -> Result<Vec<u32>> {
        self.finish(undo.unit, commit_lsn)
    }

    /// Undo a detached unit whose submission failed
    pub fn undo_unit(&mut self, undo: PageUndo) {
        self.undo(undo.unit);
    }

    fn finish(&mut self, unit: PageUnit, commit_lsn: Option<u64>) -> Result<Vec<u32>> {
        let cache = self.cache.get_mut();
        let io = self.io.get_mut();
        let mut touched = Vec::with_capacity(unit.before.len());
        let mut first_error = None;

        for &page_id in unit.before.keys() {
            if let (Some(lsn), Some(data)) = (commit_lsn, cache.peek(page_id)) {
                let mut page = Page::from_bytes(data.to_vec());
                if page.lsn() < lsn {
                    page.set_lsn(lsn);
                    if let Err(e) = cache.put(page_id, Bytes::from(page.into_bytes()), true, io) {
                        first_error.get_or_insert(e);
                    }
                }
            }
            if unit.kind == UnitKind::Statement {
                cache.unpin(page_id);
            }
            touched.push(page_id);
        }
        if unit.kind == UnitKind::Batch {
            io.spill.commit(commit_lsn);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(touched),
        }
    }

    fn undo(&mut self, unit: PageUnit) {
        let cache = self.cache.get_mut();
        let io = self.io.get_mut();
        if unit.kind == UnitKind::Batch {
            // Before any discarded page can be reloaded from it
            if let Err(e) = io.spill.clear() {
                warn!(table = %self.table, error = %e, "Failed to remove spill file");
            }
        }

        for (page_id, before) in unit.before {
            match before {
                Before::Image { data, dirty } => {
                    let free = Page::view(&data[..]).free_space();
                    cache.restore(page_id, data, dirty);
                    cache.unpin(page_id);
                    self.space.set(page_id, free);
                }
                Before::Allocated => {
                    cache.discard(page_id);
                    self.space.remove(page_id);
                }
                Before::OnDisk { free } => {
                    cache.discard(page_id);
                    self.space.set(page_id, free);
                }
            }
        }

        self.page_count = unit.page_count;
        self.live_rows = unit.live_rows;
        self.mutation_seq += 1;
        debug!(table = %self.table, kind = ?unit.kind, "Rolled back page store unit");
    }

    pub fn mutation_seq(&self) -> u64 {
        self.mutation_seq
    }

    // =========================================================================
    // Flush & recovery
    // =========================================================================

    /// Write the given pages (if dirty) and committed spilled pages, then sync once
    pub fn flush_pages(&mut self, pages: &[u32]) -> Result<FlushReport> {
        let drained = self.drain_spill()?;
        let cache = self.cache.get_mut();
        let io = self.io.get_mut();
        let flushed = cache.flush_pages(pages, io)?;
        io.file.sync()?;
        Ok(FlushReport {
            pages_written: drained + flushed,
            syncs: 1,
        })
    }

    /// Write every dirty page and sync
    pub fn flush(&mut self) -> Result<FlushReport> {
        let drained = self.drain_spill()?;
        let cache = self.cache.get_mut();
        let io = self.io.get_mut();
        let flushed = cache.flush_all(io)?;
        io.file.sync()?;
        let pages_written = drained + flushed;
        debug!(table = %self.table, pages_written, "Flushed page store");
        Ok(FlushReport {
            pages_written,
            syncs: 1,
        })
    }

    /// Move pages of committed batches from the spill file to the page file
    ///
    /// A page that is dirty in the cache is newer than its spilled image and
    /// will be written from there.
    fn drain_spill(&mut self) -> Result<usize> {
        let cache = self.cache.get_mut();
        let io = self.io.get_mut();
        let mut drained = 0;

        for (page_id, commit_lsn) in io.spill.committed() {
            if cache.dirty_pages().contains(page_id) {
                io.spill.release(page_id)?;
                continue;
            }
            let Some(data) = io.spill.read(page_id)? else {
                io.spill.release(page_id)?;
                continue;
            };
            let mut page = Page::from_bytes(data.to_vec());
            if let Some(lsn) = commit_lsn {
                if page.lsn() < lsn {
                    page.set_lsn(lsn);
                }
            }
            let data = Bytes::from(page.into_bytes());
            io.file.write_page(page_id, &data)?;
            cache.restore(page_id, data, false);
            io.spill.release(page_id)?;
            drained += 1;
        }

        if drained > 0 {
            debug!(table = %self.table, drained, "Drained spilled pages");
        }
        Ok(drained)
    }

    /// Re-apply a logged operation unless the page already reflects it
    ///
    /// Returns whether the page changed.
    pub fn redo(&mut self, op: &LogOperation, lsn: u64) -> Result<bool> {
        let position = op.position();
        let page_id = position.page_id();
        let slot = position.slot();
        if page_id == 0 {
            return Err(AtlasError::WalCorruption(format!(
                "record {} names page 0 of '{}'",
                lsn, self.table
            )));
        }
        while self.page_count < page_id {
            self.allocate()?;
        }

        let tuple = match op {
            LogOperation::Insert { row, .. } | LogOperation::Update { row, .. } => {
                Some(encode_row(&self.schema, row)?)
            }
            LogOperation::Delete { .. } => None,
        };

        let table = self.table.clone();
        let delta = self.modify(page_id, |page| {
            if page.lsn() >= lsn {
                return Ok(None);
            }
            let had = page.tuple(slot).is_some();
            let delta = match &tuple {
                Some(tuple) => {
                    if !page.put_tuple(slot, tuple) {
                        return Err(AtlasError::corruption(
                            format!("page {} of '{}'", page_id, table),
                            format!("redo of lsn {} does not fit in slot {}", lsn, slot),
                        ));
                    }
                    i64::from(!had)
                }
                None => -i64::from(page.remove_tuple(slot)),
            };
            page.set_lsn(lsn);
            Ok(Some(delta))
        })?;

        match delta {
            Some(delta) => {
                self.live_rows = self.live_rows.saturating_add_signed(delta);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn live_rows(&self) -> u64 {
        self.live_rows
    }

    /// Pages mutated since they were last written
    pub fn dirty_pages(&self) -> Vec<u32> {
        self.cache.lock().dirty_pages().iter().collect()
    }

    /// Pages found damaged on open, ascending
    pub fn damaged_pages(&self) -> Vec<u32> {
        self.io.lock().damaged.keys().copied().collect()
    }

    pub fn stats(&self) -> PageStoreStats {
        let cache = self.cache.lock();
        let io = self.io.lock();
        PageStoreStats {
            page_count: self.page_count,
            live_rows: self.live_rows,
            dirty_pages: cache.dirty_pages().len(),
            cached_pages: cache.len(),
            cache: cache.stats(),
            page_writes: io.file.page_writes(),
            syncs: io.file.syncs(),
            damaged_pages: io.damaged.len(),
            spill_writes: io.spill.writes(),
        }
    }
}

impl std::fmt::Debug for PageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageStore")
            .field("table", &self.table)
            .field("page_count", &self.page_count)
            .field("live_rows", &self.live_rows)
            .finish()
    }
}
