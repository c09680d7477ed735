use chrono::{DateTime, Utc};
use serde::Serialize;

use super::fingerprint::{ConfigFingerprint, FINGERPRINT_SIZE};
use crate::arena::{ByteReader, WriteArena};
use crate::error::{CacheError, Result};
use crate::index::{ENTRY_SIZE, EntryKind, SEARCH_KEY_SIZE};

pub const MAGIC: u32 = u32::from_le_bytes(*b"CCCH");
pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 96;

/// A table inside the container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Region {
    pub count: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindCounts {
    pub adapters: u32,
    pub stubs: u32,
    pub blobs: u32,
    pub code: u32,
}

impl KindCounts {
    pub fn record(&mut self, kind: EntryKind) {
        match kind {
            EntryKind::Adapter => self.adapters += 1,
            EntryKind::Stub => self.stubs += 1,
            EntryKind::SharedBlob | EntryKind::Tier1Blob | EntryKind::Tier2Blob => self.blobs += 1,
            EntryKind::Code => self.code += 1,
            EntryKind::None => {}
        }
    }
}

/// Fixed-size container header, written last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheHeader {
    pub version: u32,
    pub cache_size: u32,
    /// Seconds since the Unix epoch.
    pub created_at: u64,
    pub strings: Region,
    pub entries: Region,
    /// Search table; one key per entry.
    pub search_offset: u32,
    pub preload: Region,
    pub counts: KindCounts,
    pub fingerprint: ConfigFingerprint,
}

impl CacheHeader {
    pub fn new(fingerprint: ConfigFingerprint) -> Self {
        Self {
            version: FORMAT_VERSION,
            cache_size: 0,
            created_at: u64::try_from(Utc::now().timestamp()).unwrap_or_default(),
            strings: Region::default(),
            entries: Region::default(),
            search_offset: 0,
            preload: Region::default(),
            counts: KindCounts::default(),
            fingerprint,
        }
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(i64::try_from(self.created_at).ok()?, 0)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut arena = WriteArena::with_capacity(HEADER_SIZE);
        arena.write_u32(MAGIC)?;
        arena.write_u32(self.version)?;
        arena.write_u32(self.cache_size)?;
        arena.write_u32(0)?;
        arena.write_u64(self.created_at)?;
        for region in [self.strings, self.entries] {
            arena.write_u32(region.count)?;
            arena.write_u32(region.offset)?;
        }
        arena.write_u32(self.search_offset)?;
        arena.write_u32(self.preload.count)?;
        arena.write_u32(self.preload.offset)?;
        arena.write_u32(self.counts.adapters)?;
        arena.write_u32(self.counts.stubs)?;
        arena.write_u32(self.counts.blobs)?;
        arena.write_u32(self.counts.code)?;
        self.fingerprint.write(&mut arena)?;
        arena.reserve(HEADER_SIZE - arena.position())?;
        Ok(arena.into_bytes())
    }

    /// Parses and checks the header against the mapped size. Checks run in
    /// order: magic, version, declared size, then table bounds. The
    /// fingerprint is left to the caller.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(CacheError::SizeMismatch {
                declared: HEADER_SIZE,
                actual: data.len(),
            });
        }
        let mut reader = ByteReader::new(data);
        if reader.read_u32()? != MAGIC {
            return Err(CacheError::BadMagic);
        }
        let version = reader.read_u32()?;
        if version != FORMAT_VERSION {
            return Err(CacheError::VersionMismatch {
                found: version,
                expected: FORMAT_VERSION,
            });
        }
        let cache_size = reader.read_u32()?;
        if cache_size as usize != data.len() {
            return Err(CacheError::SizeMismatch {
                declared: cache_size as usize,
                actual: data.len(),
            });
        }
        reader.read_u32()?;
        let created_at = reader.read_u64()?;
        let mut region = || -> Result<Region> {
            Ok(Region {
                count: reader.read_u32()?,
                offset: reader.read_u32()?,
            })
        };
        let strings = region()?;
        let entries = region()?;
        let search_offset = reader.read_u32()?;
        let preload = Region {
            count: reader.read_u32()?,
            offset: reader.read_u32()?,
        };
        let counts = KindCounts {
            adapters: reader.read_u32()?,
            stubs: reader.read_u32()?,
            blobs: reader.read_u32()?,
            code: reader.read_u32()?,
        };
        let fingerprint = ConfigFingerprint::read(&mut reader)?;

        let header = Self {
            version,
            cache_size,
            created_at,
            strings,
            entries,
            search_offset,
            preload,
            counts,
            fingerprint,
        };
        header.check_bounds()?;
        Ok(header)
    }

    fn check_bounds(&self) -> Result<()> {
        let size = u64::from(self.cache_size);
        let tables = [
            ("entry", self.entries.offset, self.entries.count, ENTRY_SIZE),
            ("search", self.search_offset, self.entries.count, SEARCH_KEY_SIZE),
            ("preload", self.preload.offset, self.preload.count, 4),
        ];
        for (name, offset, count, item) in tables {
            let end = u64::from(offset) + u64::from(count) * item as u64;
            if u64::from(offset) < HEADER_SIZE as u64 || end > size {
                return Err(CacheError::Layout(format!(
                    "{name} table [{offset}, {end}) outside {size} byte container"
                )));
            }
        }
        if u64::from(self.strings.offset) > size {
            return Err(CacheError::Layout(format!(
                "string table at {} outside {size} byte container",
                self.strings.offset
            )));
        }
        let total = [
            self.counts.adapters,
            self.counts.stubs,
            self.counts.blobs,
            self.counts.code,
        ]
        .into_iter()
        .map(u64::from)
        .sum::<u64>();
        if total != u64::from(self.entries.count) {
            return Err(CacheError::Layout(format!(
                "kind counts sum to {total}, header declares {} entries",
                self.entries.count
            )));
        }
        Ok(())
    }
}

const _: () = assert!(40 + 4 + 8 + 16 + FINGERPRINT_SIZE <= HEADER_SIZE);
