use std::ffi::CString;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::fingerprint::ConfigFingerprint;
use super::header::{CacheHeader, HEADER_SIZE, KindCounts, Region};
use crate::arena::{ReadBuffer, WriteArena, align_up};
use crate::error::{CacheError, Result};
use crate::index::{
    ENTRY_SIZE, Entry, EntryIndex, MergedEntries, SEARCH_KEY_SIZE, SearchKey,
};

/// A finalized container, mapped read-only.
#[derive(Debug)]
pub struct ContainerImage {
    buffer: ReadBuffer,
    header: CacheHeader,
}

impl ContainerImage {
    /// Maps `path` and checks it against this process's fingerprint.
    pub fn open(path: &Path, fingerprint: &ConfigFingerprint) -> Result<Self> {
        let image = Self::open_unchecked(path)?;
        fingerprint.verify(&image.header.fingerprint)?;
        debug!(
            path = %path.display(),
            entries = image.header.entries.count,
            size = image.header.cache_size,
            "mapped code cache container"
        );
        Ok(image)
    }

    /// Maps `path` and validates its structure without comparing the
    /// fingerprint. Suitable for inspection only.
    pub fn open_unchecked(path: &Path) -> Result<Self> {
        Self::from_buffer(ReadBuffer::map(path)?)
    }

    pub fn from_buffer(buffer: ReadBuffer) -> Result<Self> {
        let header = CacheHeader::decode(buffer.as_slice())?;
        Ok(Self { buffer, header })
    }

    pub fn header(&self) -> &CacheHeader {
        &self.header
    }

    pub fn bytes(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    pub fn path(&self) -> Option<&Path> {
        self.buffer.path()
    }

    pub fn strings(&self) -> Result<Vec<CString>> {
        let mut reader = self.buffer.reader_at(self.header.strings.offset as usize)?;
        let mut strings = Vec::with_capacity(self.header.strings.count as usize);
        for _ in 0..self.header.strings.count {
            let text = reader.read_cstr()?;
            let string = CString::new(text)
                .map_err(|err| CacheError::corrupt(format!("interned string: {err}")))?;
            strings.push(string);
        }
        Ok(strings)
    }

    /// Decodes the entry array. Every payload must lie inside the container.
    pub fn entries(&self) -> Result<Vec<Entry>> {
        let mut reader = self.buffer.reader_at(self.header.entries.offset as usize)?;
        let mut entries = Vec::with_capacity(self.header.entries.count as usize);
        for _ in 0..self.header.entries.count {
            let entry = Entry::decode(&mut reader)?;
            self.payload(&entry)?;
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn search_keys(&self) -> Result<Vec<SearchKey>> {
        let mut reader = self.buffer.reader_at(self.header.search_offset as usize)?;
        (0..self.header.entries.count)
            .map(|_| SearchKey::decode(&mut reader))
            .collect()
    }

    pub fn preload_indices(&self) -> Result<Vec<u32>> {
        let mut reader = self.buffer.reader_at(self.header.preload.offset as usize)?;
        (0..self.header.preload.count)
            .map(|_| reader.read_u32())
            .collect()
    }

    /// Bytes of one entry's artifact.
    pub fn payload(&self, entry: &Entry) -> Result<&[u8]> {
        self.buffer
            .read_at(entry.offset as usize, entry.size as usize)
    }

    pub fn load_index(&self) -> Result<EntryIndex> {
        EntryIndex::from_loaded(self.entries()?, self.search_keys()?, self.preload_indices()?)
    }
}

fn offset32(offset: usize) -> Result<u32> {
    u32::try_from(offset)
        .map_err(|_| CacheError::Layout(format!("container offset {offset} exceeds u32")))
}

/// Lays out a container:
/// `[header][strings][preload][search][entries][payloads]`, each table
/// aligned. The header is produced last, once every offset is known.
pub fn build_image(
    strings: &[CString],
    merged: MergedEntries,
    fingerprint: ConfigFingerprint,
) -> Result<Vec<u8>> {
    let strings_size: usize = strings.iter().map(|s| s.as_bytes_with_nul().len()).sum();
    let estimate = HEADER_SIZE
        + align_up(strings_size)
        + align_up(merged.preload.len() * 4)
        + merged.search.len() * SEARCH_KEY_SIZE
        + merged.entries.len() * ENTRY_SIZE
        + merged.payload.len()
        + 64;
    let mut arena = WriteArena::with_capacity(estimate);
    let mut header = CacheHeader::new(fingerprint);
    arena.reserve(HEADER_SIZE)?;

    header.strings = Region {
        count: offset32(strings.len())?,
        offset: offset32(arena.position())?,
    };
    for string in strings {
        arena.write(string.as_bytes_with_nul())?;
    }
    arena.align()?;

    header.preload = Region {
        count: offset32(merged.preload.len())?,
        offset: offset32(arena.position())?,
    };
    for &index in &merged.preload {
        arena.write_u32(index)?;
    }
    arena.align()?;

    header.search_offset = offset32(arena.position())?;
    for key in &merged.search {
        arena.write(&key.encode())?;
    }
    arena.align()?;

    let entries_offset = arena.position();
    let payload_offset = align_up(entries_offset + merged.entries.len() * ENTRY_SIZE);
    header.entries = Region {
        count: offset32(merged.entries.len())?,
        offset: offset32(entries_offset)?,
    };
    let mut counts = KindCounts::default();
    for entry in &merged.entries {
        let mut rebased = entry.clone();
        rebased.offset = offset32(payload_offset + entry.offset as usize)?;
        counts.record(entry.kind);
        arena.write(&rebased.encode())?;
    }
    header.counts = counts;
    arena.align()?;
    arena.write(&merged.payload)?;

    header.cache_size = offset32(arena.position())?;
    let mut image = arena.into_bytes();
    image[..HEADER_SIZE].copy_from_slice(&header.encode()?);
    Ok(image)
}

/// Writes `image` next to `path` and renames it into place, so a reader
/// sees either the previous container or the complete new one.
pub fn persist(path: &Path, image: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|err| CacheError::io(dir, err))?;
    let mut file = NamedTempFile::new_in(dir).map_err(|err| CacheError::io(dir, err))?;
    file.write_all(image).map_err(|err| CacheError::io(path, err))?;
    file.as_file()
        .sync_all()
        .map_err(|err| CacheError::io(path, err))?;
    file.persist(path)
        .map_err(|err| CacheError::io(path, err.error))?;
    info!(path = %path.display(), bytes = image.len(), "wrote code cache container");
    Ok(())
}
