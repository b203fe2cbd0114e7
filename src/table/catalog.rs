//! Table catalog
//!
//! The descriptors of every table, persisted as one file:
//! `"ATCT" (4) | Version (2) | CRC (4) | bincode(descriptors)`.
//! Saves go through a temp file and a rename so a crash leaves either the old
//! or the new catalog.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{AtlasError, Result};

use super::TableDescriptor;

/// Magic bytes identifying a catalog file
pub const CATALOG_MAGIC: &[u8; 4] = b"ATCT";

const CATALOG_VERSION: u16 = 1;
const HEADER_SIZE: usize = 4 + 2 + 4;

/// Descriptors of all tables, by name
#[derive(Debug)]
pub struct Catalog {
    path: PathBuf,
    tables: BTreeMap<String, TableDescriptor>,
}

impl Catalog {
    /// Load the catalog at `path`; a missing file is an empty catalog
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                path: path.to_path_buf(),
                tables: BTreeMap::new(),
            });
        }

        let data = fs::read(path)?;
        let corrupt = |reason: &str| AtlasError::corruption(path.display().to_string(), reason);
        if data.len() < HEADER_SIZE || &data[0..4] != CATALOG_MAGIC {
            return Err(corrupt("invalid catalog header"));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != CATALOG_VERSION {
            return Err(corrupt("unsupported catalog version"));
        }
        let crc = u32::from_le_bytes([data[6], data[7], data[8], data[9]]);
        let body = &data[HEADER_SIZE..];
        if crc32fast::hash(body) != crc {
            return Err(corrupt("catalog checksum mismatch"));
        }

        let descriptors: Vec<TableDescriptor> = bincode::deserialize(body)?;
        debug!(tables = descriptors.len(), "Loaded catalog");
        Ok(Self {
            path: path.to_path_buf(),
            tables: descriptors
                .into_iter()
                .map(|d| (d.name.clone(), d))
                .collect(),
        })
    }

    /// Persist the catalog atomically
    pub fn save(&self) -> Result<()> {
        let descriptors: Vec<&TableDescriptor> = self.tables.values().collect();
        let body = bincode::serialize(&descriptors)?;

        let mut data = Vec::with_capacity(HEADER_SIZE + body.len());
        data.extend_from_slice(CATALOG_MAGIC);
        data.extend_from_slice(&CATALOG_VERSION.to_le_bytes());
        data.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        data.extend_from_slice(&body);

        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn insert(&mut self, descriptor: TableDescriptor) {
        self.tables.insert(descriptor.name.clone(), descriptor);
    }

    pub fn remove(&mut self, name: &str) -> Option<TableDescriptor> {
        self.tables.remove(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.values()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
