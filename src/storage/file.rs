//! Page file
//!
//! Fixed-size pages on disk, preceded by a plaintext header page.
//!
//! ## File Format
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ Page 0: Header                                             │
//! │ ┌──────────┬──────────┬───────────┬───────────┬──────────┐ │
//! │ │"ATDB" (4)│Version(2)│PageSize(4)│PageCount(4)│Encrypted│ │
//! │ └──────────┴──────────┴───────────┴───────────┴──────────┘ │
//! │ NameLen (2) | Name | CRC (4) | zero padding                │
//! ├────────────────────────────────────────────────────────────┤
//! │ Page 1 (page_size bytes, or page_size + overhead sealed)   │
//! ├────────────────────────────────────────────────────────────┤
//! │ Page 2 ...                                                 │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Page `n` lives at offset `n * physical_page_size`. Pages are sealed
//! (checksummed, then encrypted when a cipher is configured) on the way out
//! and validated on the way in.
//!
//! The header's page count covers only pages that were actually written:
//! it is the longest run `1..=n` with every page written at least once. A
//! page inside that run that reads back missing or all zeros is corruption.
//! Past it, such a page is a hole left by a later page being written first.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::crypto::Cipher;
use crate::error::{AtlasError, Result};

use super::page::Page;

/// Magic bytes identifying a page file
pub const PAGE_FILE_MAGIC: &[u8; 4] = b"ATDB";

/// Current page file format version
pub const PAGE_FILE_VERSION: u16 = 1;

/// Fixed part of the header: magic, version, page size, page count, encrypted, name length
const HEADER_FIXED: usize = 4 + 2 + 4 + 4 + 1 + 2;

/// Page-granular access to one table's file
pub struct PageFile {
    path: PathBuf,
    file: File,
    table: String,
    page_size: usize,
    physical_page_size: usize,

    /// Number of data pages (ids `1..=page_count`)
    page_count: u32,

    /// Every page in `1..=written_prefix` has been written
    written_prefix: u32,
    /// Written pages past the prefix
    written_above: BTreeSet<u32>,
    /// Page count last recorded in the header
    header_count: u32,

    cipher: Option<Arc<dyn Cipher>>,

    /// Pages written since open
    page_writes: u64,
    syncs: u64,
}

impl PageFile {
    /// Create a new page file for `table`
    pub fn create(
        path: &Path,
        table: &str,
        page_size: usize,
        cipher: Option<Arc<dyn Cipher>>,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let physical_page_size = page_size + cipher.as_ref().map_or(0, |c| c.overhead());
        let mut page_file = Self {
            path: path.to_path_buf(),
            file,
            table: table.to_string(),
            page_size,
            physical_page_size,
            page_count: 0,
            written_prefix: 0,
            written_above: BTreeSet::new(),
            header_count: 0,
            cipher,
            page_writes: 0,
            syncs: 0,
        };
        page_file.write_header()?;
        page_file.file.sync_all()?;
        Ok(page_file)
    }

    /// Open an existing page file
    ///
    /// The page size comes from the header. Whether the file is encrypted must
    /// match whether a cipher is supplied.
    pub fn open(path: &Path, cipher: Option<Arc<dyn Cipher>>) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len();

        let mut fixed = [0u8; HEADER_FIXED];
        file.read_exact(&mut fixed).map_err(|_| {
            AtlasError::corruption(path.display().to_string(), "header page truncated")
        })?;

        if &fixed[0..4] != PAGE_FILE_MAGIC {
            return Err(AtlasError::corruption(
                path.display().to_string(),
                format!("invalid magic {:?}", &fixed[0..4]),
            ));
        }
        let version = u16::from_le_bytes([fixed[4], fixed[5]]);
        if version != PAGE_FILE_VERSION {
            return Err(AtlasError::corruption(
                path.display().to_string(),
                format!("unsupported version {}", version),
            ));
        }
        let page_size = u32::from_le_bytes([fixed[6], fixed[7], fixed[8], fixed[9]]) as usize;
        let header_count = u32::from_le_bytes([fixed[10], fixed[11], fixed[12], fixed[13]]);
        let encrypted = fixed[14] != 0;
        let name_len = u16::from_le_bytes([fixed[15], fixed[16]]) as usize;

        let mut rest = vec![0u8; name_len + 4];
        file.read_exact(&mut rest).map_err(|_| {
            AtlasError::corruption(path.display().to_string(), "header page truncated")
        })?;
        let stored_crc = u32::from_le_bytes([
            rest[name_len],
            rest[name_len + 1],
            rest[name_len + 2],
            rest[name_len + 3],
        ]);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&fixed);
        hasher.update(&rest[..name_len]);
        if hasher.finalize() != stored_crc {
            return Err(AtlasError::corruption(
                path.display().to_string(),
                "header checksum mismatch",
            ));
        }
        let table = String::from_utf8_lossy(&rest[..name_len]).into_owned();

        if encrypted != cipher.is_some() {
            return Err(AtlasError::Config(format!(
                "table '{}' is {}encrypted but {} key was supplied",
                table,
                if encrypted { "" } else { "not " },
                if cipher.is_some() { "a" } else { "no" }
            )));
        }

        let physical_page_size = page_size + cipher.as_ref().map_or(0, |c| c.overhead());

        // Pages written back by eviction may lie past the last synced header
        let on_disk = (file_len / physical_page_size as u64).saturating_sub(1) as u32;
        let page_count = header_count.max(on_disk);

        debug!(table = %table, page_size, page_count, "Opened page file");

        Ok(Self {
            path: path.to_path_buf(),
            file,
            table,
            page_size,
            physical_page_size,
            page_count,
            written_prefix: header_count,
            written_above: BTreeSet::new(),
            header_count,
            cipher,
            page_writes: 0,
            syncs: 0,
        })
    }

    /// Read and validate page `page_id`
    ///
    /// Returns `None` for a hole: a page past the written prefix that was
    /// allocated but never written.
    pub fn read_page(&mut self, page_id: u32) -> Result<Option<Vec<u8>>> {
        let offset = self.offset_of(page_id)?;
        let file_len = self.file.metadata()?.len();
        let missing = offset + self.physical_page_size as u64 > file_len;

        let raw = if missing {
            None
        } else {
            let mut raw = vec![0u8; self.physical_page_size];
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.read_exact(&mut raw)?;
            if raw.iter().all(|&b| b == 0) {
                None
            } else {
                Some(raw)
            }
        };

        let Some(raw) = raw else {
            if page_id <= self.written_prefix {
                return Err(AtlasError::corruption(
                    format!("page {} of '{}'", page_id, self.table),
                    if missing {
                        "page is past the end of the file"
                    } else {
                        "page is all zeros"
                    },
                ));
            }
            return Ok(None);
        };

        let unit = format!("page {} of '{}'", page_id, self.table);
        let plain = unseal_page(raw, self.cipher.as_ref(), page_id, self.page_size, &unit)?;
        self.note_written(page_id);
        Ok(Some(plain))
    }

    /// Seal and write `data` as page `page_id`
    pub fn write_page(&mut self, page_id: u32, data: &[u8]) -> Result<()> {
        let offset = self.offset_of(page_id)?;
        if data.len() != self.page_size {
            return Err(AtlasError::corruption(
                format!("page {}", page_id),
                format!("refusing to write {} bytes", data.len()),
            ));
        }
        let sealed = seal_page(data, self.cipher.as_ref())?;

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&sealed)?;
        self.page_writes += 1;
        self.page_count = self.page_count.max(page_id);
        self.note_written(page_id);
        Ok(())
    }

    fn note_written(&mut self, page_id: u32) {
        if page_id <= self.written_prefix {
            return;
        }
        self.written_above.insert(page_id);
        while self.written_above.remove(&(self.written_prefix + 1)) {
            self.written_prefix += 1;
        }
    }

    /// Force written pages to disk, then record the written prefix
    ///
    /// The header is only rewritten (and synced a second time) when the
    /// prefix grew, so it never names a page whose bytes are not durable.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        if self.written_prefix != self.header_count {
            self.write_header()?;
            self.file.sync_data()?;
            self.header_count = self.written_prefix;
        }
        self.syncs += 1;
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let name = self.table.as_bytes();
        let mut header = Vec::with_capacity(self.physical_page_size);
        header.extend_from_slice(PAGE_FILE_MAGIC);
        header.extend_from_slice(&PAGE_FILE_VERSION.to_le_bytes());
        header.extend_from_slice(&(self.page_size as u32).to_le_bytes());
        header.extend_from_slice(&self.written_prefix.to_le_bytes());
        header.push(u8::from(self.cipher.is_some()));
        header.extend_from_slice(&(name.len() as u16).to_le_bytes());
        header.extend_from_slice(name);
        let crc = crc32fast::hash(&header);
        header.extend_from_slice(&crc.to_le_bytes());
        if header.len() > self.physical_page_size {
            return Err(AtlasError::Config(format!(
                "table name '{}' does not fit in the header page",
                self.table
            )));
        }
        header.resize(self.physical_page_size, 0);

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        Ok(())
    }

    fn offset_of(&self, page_id: u32) -> Result<u64> {
        if page_id == 0 {
            return Err(AtlasError::InvalidPosition(0));
        }
        Ok(u64::from(page_id) * self.physical_page_size as u64)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    /// Pages `1..=n` known to have been written
    pub fn written_prefix(&self) -> u32 {
        self.written_prefix
    }

    pub fn cipher(&self) -> Option<&Arc<dyn Cipher>> {
        self.cipher.as_ref()
    }

    pub fn physical_page_size(&self) -> usize {
        self.physical_page_size
    }

    pub fn page_writes(&self) -> u64 {
        self.page_writes
    }

    pub fn syncs(&self) -> u64 {
        self.syncs
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Checksum `data` as a page and encrypt it when a cipher is given
pub(crate) fn seal_page(data: &[u8], cipher: Option<&Arc<dyn Cipher>>) -> Result<Vec<u8>> {
    let mut page = Page::from_bytes(data.to_vec());
    page.seal();
    match cipher {
        Some(cipher) => cipher.encrypt(page.as_bytes()),
        None => Ok(page.into_bytes()),
    }
}

/// Reverse [`seal_page`], validating the result as page `page_id`
pub(crate) fn unseal_page(
    raw: Vec<u8>,
    cipher: Option<&Arc<dyn Cipher>>,
    page_id: u32,
    page_size: usize,
    unit: &str,
) -> Result<Vec<u8>> {
    let plain = match cipher {
        Some(cipher) => cipher.decrypt(&raw).map_err(|e| match e {
            AtlasError::AuthenticationFailure(reason) => {
                AtlasError::AuthenticationFailure(format!("{}: {}", unit, reason))
            }
            other => other,
        })?,
        None => raw,
    };
    if plain.len() != page_size {
        return Err(AtlasError::corruption(
            unit,
            format!("expected {} bytes, found {}", page_size, plain.len()),
        ));
    }
    Page::validate(&plain, page_id)?;
    Ok(plain)
}
