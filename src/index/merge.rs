use tracing::{debug, trace};

use super::entry::{Entry, EntryFlags, EntryKind};
use super::search::{SearchKey, sort_keys};
use crate::arena::align_up;
use crate::error::{CacheError, Result};

/// Entries surviving finalization, with their payloads packed back to back.
///
/// Entry offsets are relative to the start of `payload`; the container
/// rebases them once it knows where the payload region lands.
#[derive(Debug, Default)]
pub struct MergedEntries {
    pub entries: Vec<Entry>,
    pub payload: Vec<u8>,
    pub search: Vec<SearchKey>,
    pub preload: Vec<u32>,
    pub skipped: usize,
}

impl MergedEntries {
    fn absorb(&mut self, entry: &Entry, source: &[u8]) -> Result<()> {
        if entry.load_fail() {
            trace!(id = entry.id, kind = entry.kind.name(), "dropping entry that failed to load");
            self.skipped += 1;
            return Ok(());
        }

        let mut copy = entry.clone();
        if entry.not_entrant() {
            // Preload code may carry dependency assumptions that no longer
            // hold; anything else gets another chance next run.
            if entry.for_preload() {
                debug!(id = entry.id, "dropping invalidated preload entry");
                self.skipped += 1;
                return Ok(());
            }
            copy.flags.remove(EntryFlags::NOT_ENTRANT);
        } else if entry.for_preload() && entry.kind == EntryKind::Code {
            self.preload.push(self.entries.len() as u32);
        }

        let start = entry.offset as usize;
        let bytes = start
            .checked_add(entry.size as usize)
            .and_then(|end| source.get(start..end))
            .ok_or_else(|| {
                CacheError::corrupt(format!(
                    "entry {} payload [{start}, +{}) outside source of {} bytes",
                    entry.id,
                    entry.size,
                    source.len()
                ))
            })?;

        let offset = self.payload.len();
        self.payload.extend_from_slice(bytes);
        self.payload.resize(align_up(self.payload.len()), 0);

        copy.offset = u32::try_from(offset)
            .map_err(|_| CacheError::Layout(format!("payload offset {offset} exceeds u32")))?;
        copy.flags &= EntryFlags::PERSISTENT;
        copy.next = None;

        self.search.push(SearchKey {
            id: copy.id,
            index: self.entries.len() as u32,
        });
        self.entries.push(copy);
        Ok(())
    }
}

/// Combines the entries of a previously loaded container with the entries
/// written during this run.
///
/// Loaded entries come first, in their finalized order; `stored` must be in
/// allocation order so the oldest new artifact lands first. Offsets of
/// loaded entries index `loaded_image`, offsets of stored entries index
/// `stored_payload`.
pub fn merge_entries(
    loaded: &[Entry],
    loaded_image: &[u8],
    stored: &[Entry],
    stored_payload: &[u8],
) -> Result<MergedEntries> {
    let mut merged = MergedEntries::default();
    for entry in loaded {
        merged.absorb(entry, loaded_image)?;
    }
    for entry in stored {
        merged.absorb(entry, stored_payload)?;
    }
    sort_keys(&mut merged.search);
    debug!(
        kept = merged.entries.len(),
        skipped = merged.skipped,
        preload = merged.preload.len(),
        payload_bytes = merged.payload.len(),
        "merged cache entries"
    );
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::EntryId;

    fn entry(kind: EntryKind, id: u32, offset: u32, size: u32) -> Entry {
        let mut entry = Entry::new(kind, id);
        entry.offset = offset;
        entry.size = size;
        entry
    }

    #[test]
    fn loaded_entries_precede_stored_ones() {
        let image = [1u8; 16];
        let arena = [2u8; 24];
        let loaded = vec![entry(EntryKind::Stub, 9, 8, 8)];
        let stored = vec![
            entry(EntryKind::Stub, 3, 0, 8),
            entry(EntryKind::Adapter, 1, 8, 16),
        ];

        let merged = merge_entries(&loaded, &image, &stored, &arena).unwrap();
        let ids: Vec<_> = merged.entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![9, 3, 1]);
        let offsets: Vec<_> = merged.entries.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![0, 8, 16]);
        assert_eq!(&merged.payload[..8], &[1u8; 8]);
        assert_eq!(&merged.payload[8..], &[2u8; 24]);

        let keys: Vec<_> = merged.search.iter().map(|k| (k.id, k.index)).collect();
        assert_eq!(keys, vec![(1, 2), (3, 1), (9, 0)]);
    }

    #[test]
    fn invalidation_and_failure_rules() {
        let arena = [0u8; 64];
        let mut failed = entry(EntryKind::Code, 1, 0, 8);
        failed.flags |= EntryFlags::LOAD_FAIL;
        let mut stale_preload = entry(EntryKind::Code, 2, 8, 8);
        stale_preload.flags |= EntryFlags::NOT_ENTRANT | EntryFlags::FOR_PRELOAD;
        let mut stale = entry(EntryKind::Code, 3, 16, 8);
        stale.flags |= EntryFlags::NOT_ENTRANT | EntryFlags::LOADED;
        stale.next = Some(EntryId::Stored(0));
        let mut preload = entry(EntryKind::Code, 4, 24, 8);
        preload.flags |= EntryFlags::FOR_PRELOAD;

        let merged =
            merge_entries(&[], &[], &[failed, stale_preload, stale, preload], &arena).unwrap();
        assert_eq!(merged.skipped, 2);
        let ids: Vec<_> = merged.entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4]);
        assert!(merged.entries[0].is_entrant());
        assert!(!merged.entries[0].loaded());
        assert_eq!(merged.entries[0].next, None);
        assert_eq!(merged.preload, vec![1]);
    }

    #[test]
    fn sizes_are_padded_to_alignment() {
        let arena = [7u8; 16];
        let stored = vec![
            entry(EntryKind::Stub, 1, 0, 3),
            entry(EntryKind::Stub, 2, 8, 5),
        ];
        let merged = merge_entries(&[], &[], &stored, &arena).unwrap();
        assert_eq!(merged.entries[1].offset, 8);
        assert_eq!(merged.payload.len(), 16);
        assert_eq!(&merged.payload[3..8], &[0u8; 5]);
    }

    #[test]
    fn out_of_range_payload_is_corrupt() {
        let stored = vec![entry(EntryKind::Stub, 1, 4, 8)];
        assert!(matches!(
            merge_entries(&[], &[], &stored, &[0u8; 8]),
            Err(CacheError::Corrupt(_))
        ));
    }
}
