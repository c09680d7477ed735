use super::entry::{Entry, EntryKind};
use crate::arena::ByteReader;
use crate::error::{CacheError, Result};

/// One row of the persisted search table: an entry id and the position of
/// the entry in the finalized entry array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchKey {
    pub id: u32,
    pub index: u32,
}

pub const SEARCH_KEY_SIZE: usize = 8;

impl SearchKey {
    pub fn encode(&self) -> [u8; SEARCH_KEY_SIZE] {
        let mut out = [0u8; SEARCH_KEY_SIZE];
        out[..4].copy_from_slice(&self.id.to_ne_bytes());
        out[4..].copy_from_slice(&self.index.to_ne_bytes());
        out
    }

    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            id: reader.read_u32()?,
            index: reader.read_u32()?,
        })
    }
}

/// Sorts keys by id, keeping insertion order among equal ids.
pub fn sort_keys(keys: &mut [SearchKey]) {
    keys.sort_by_key(|key| key.id);
}

/// Checks the invariants a loaded search table must satisfy before it is
/// trusted for binary search.
pub fn validate(keys: &[SearchKey], entries: &[Entry]) -> Result<()> {
    if keys.len() != entries.len() {
        return Err(CacheError::Layout(format!(
            "search table has {} rows for {} entries",
            keys.len(),
            entries.len()
        )));
    }
    for (position, pair) in keys.windows(2).enumerate() {
        if pair[0].id > pair[1].id {
            return Err(CacheError::Layout(format!(
                "search table unsorted at row {}",
                position + 1
            )));
        }
    }
    for key in keys {
        let entry = entries.get(key.index as usize).ok_or_else(|| {
            CacheError::Layout(format!("search row points at missing entry {}", key.index))
        })?;
        if entry.id != key.id {
            return Err(CacheError::Layout(format!(
                "search row id {} disagrees with entry {} id {}",
                key.id, key.index, entry.id
            )));
        }
    }
    Ok(())
}

/// Binary search over `keys`, then a scan of the neighbours sharing the id.
///
/// Distinct artifacts (other levels, decompile counts, chain links) may
/// share an id, so the first hit is not necessarily the match.
pub fn find(
    keys: &[SearchKey],
    entries: &[Entry],
    kind: EntryKind,
    id: u32,
    comp_level: u8,
    decompile: u32,
) -> Option<u32> {
    let hit = keys.binary_search_by_key(&id, |key| key.id).ok()?;
    let matches = |key: &SearchKey| {
        entries
            .get(key.index as usize)
            .is_some_and(|entry| entry.matches(kind, id, comp_level, decompile))
    };

    if matches(&keys[hit]) {
        return Some(keys[hit].index);
    }
    let before = keys[..hit]
        .iter()
        .rev()
        .take_while(|key| key.id == id)
        .find(|key| matches(*key));
    if let Some(key) = before {
        return Some(key.index);
    }
    keys[hit + 1..]
        .iter()
        .take_while(|key| key.id == id)
        .find(|key| matches(*key))
        .map(|key| key.index)
}
