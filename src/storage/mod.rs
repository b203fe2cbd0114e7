//! Storage Module
//!
//! The two table storage strategies and the page machinery under them.
//!
//! ## Responsibilities
//! - Slotted pages with checksummed headers
//! - Page files, sealed through the cipher when encryption is on
//! - Bounded page cache with CLOCK eviction and dirty-page tracking
//! - Page-based row store (in-place update/delete)
//! - Spill file for batches larger than the page cache
//! - Append-only row store (tombstones) and column-major snapshots
//!
//! ## Page Layout
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Header (32)                                              │
//! │ ┌───────┬────┬─────┬──────┬──────┬─────┬─────┬─────────┐ │
//! │ │Magic 2│Type│Flags│PageId│NextId│LSN 8│CRC 4│Slots/Free│ │
//! │ └───────┴────┴─────┴──────┴──────┴─────┴─────┴─────────┘ │
//! ├──────────────────────────────────────────────────────────┤
//! │ Slot array (offset u16, len u16) ───►                    │
//! │                                                          │
//! │                            ◄─── tuples, packed from end  │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod append;
mod cache;
mod columnar;
mod file;
mod page;
mod paged;
mod spill;

pub use append::{
    AppendEntry, AppendStore, AppendStoreStats, AppendUndo, APPEND_MAGIC, APPEND_VERSION,
};
pub use cache::{CacheStats, DirtyPageSet, PageCache, PageIo};
pub use columnar::{transpose, ColumnData, ColumnarSnapshot};
pub use file::{PageFile, PAGE_FILE_MAGIC, PAGE_FILE_VERSION};
pub use page::{
    compute_page_checksum, max_tuple_size, Page, PageType, NO_PAGE, PAGE_HEADER_SIZE, PAGE_MAGIC,
    SLOT_SIZE,
};
pub use paged::{PageStore, PageStoreStats, PageUndo};
pub use spill::SpillFile;

/// Work done by one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Pages (or append frames) written
    pub pages_written: usize,
    /// Hardware syncs issued
    pub syncs: usize,
}

impl FlushReport {
    pub fn merge(self, other: FlushReport) -> FlushReport {
        FlushReport {
            pages_written: self.pages_written + other.pages_written,
            syncs: self.syncs + other.syncs,
        }
    }
}
