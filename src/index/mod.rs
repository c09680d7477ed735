//! Entry index: where every cached artifact lives and how it is found.
//!
//! A run sees two populations of entries. Those of the container mapped at
//! startup are immutable apart from their run-local flags and are searched
//! through the persisted, id-sorted [`SearchKey`] table. Those written
//! during the run are appended to a stack accounted against the high end of
//! the write arena and only become searchable after finalization merges both
//! populations into a new container.

mod entry;
mod merge;
mod search;

use tracing::{debug, trace};

pub use entry::{ENTRY_SIZE, Entry, EntryFlags, EntryId, EntryKind};
pub use merge::{MergedEntries, merge_entries};
pub use search::{SEARCH_KEY_SIZE, SearchKey, sort_keys};

use crate::arena::WriteArena;
use crate::error::{CacheError, Result};

#[derive(Debug, Default)]
pub struct EntryIndex {
    loaded: Vec<Entry>,
    search: Vec<SearchKey>,
    preload: Vec<u32>,
    stored: Vec<Entry>,
}

impl EntryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index over a finalized container. The search table is validated
    /// before it is trusted.
    pub fn from_loaded(entries: Vec<Entry>, search: Vec<SearchKey>, preload: Vec<u32>) -> Result<Self> {
        search::validate(&search, &entries)?;
        if let Some(bad) = preload.iter().find(|&&index| index as usize >= entries.len()) {
            return Err(CacheError::Layout(format!(
                "preload index {bad} past {} entries",
                entries.len()
            )));
        }
        Ok(Self {
            loaded: entries,
            search,
            preload,
            stored: Vec::new(),
        })
    }

    pub fn loaded_entries(&self) -> &[Entry] {
        &self.loaded
    }

    /// Entries written this run, oldest first.
    pub fn stored_entries(&self) -> &[Entry] {
        &self.stored
    }

    pub fn search_keys(&self) -> &[SearchKey] {
        &self.search
    }

    pub fn preload_indices(&self) -> &[u32] {
        &self.preload
    }

    pub fn len(&self) -> usize {
        self.loaded.len() + self.stored.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: EntryId) -> Option<&Entry> {
        match id {
            EntryId::Loaded(index) => self.loaded.get(index as usize),
            EntryId::Stored(index) => self.stored.get(index as usize),
        }
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
        match id {
            EntryId::Loaded(index) => self.loaded.get_mut(index as usize),
            EntryId::Stored(index) => self.stored.get_mut(index as usize),
        }
    }

    /// Looks up a reusable artifact in the loaded container. Entries written
    /// this run are not visible until the next run.
    pub fn find(&self, kind: EntryKind, id: u32, comp_level: u8, decompile: u32) -> Option<EntryId> {
        search::find(&self.search, &self.loaded, kind, id, comp_level, decompile)
            .map(EntryId::Loaded)
    }

    /// Records a freshly written artifact, charging its descriptor against
    /// the tail of `arena`.
    ///
    /// A regular compiled method stored while a barrier version of the same
    /// id exists becomes the head of a chain ending in that version.
    pub fn add_entry(&mut self, arena: &mut WriteArena, mut entry: Entry) -> Result<EntryId> {
        arena.reserve_tail(ENTRY_SIZE)?;
        if entry.kind == EntryKind::Code && !entry.has_init_barriers() && entry.next.is_none() {
            entry.next = self.barrier_version(entry.id);
        }
        let index = u32::try_from(self.stored.len())
            .map_err(|_| CacheError::Layout("too many entries".into()))?;
        trace!(
            kind = entry.kind.name(),
            id = entry.id,
            index,
            chained = entry.next.is_some(),
            "added cache entry"
        );
        self.stored.push(entry);
        Ok(EntryId::Stored(index))
    }

    /// Most recent entrant entry with initialization barriers for `id`.
    fn barrier_version(&self, id: u32) -> Option<EntryId> {
        let is_barrier = |entry: &Entry| {
            entry.kind == EntryKind::Code
                && entry.id == id
                && entry.has_init_barriers()
                && entry.is_entrant()
        };
        let stored = self
            .stored
            .iter()
            .rposition(is_barrier)
            .map(|index| EntryId::Stored(index as u32));
        stored.or_else(|| {
            self.loaded
                .iter()
                .rposition(is_barrier)
                .map(|index| EntryId::Loaded(index as u32))
        })
    }

    /// Marks `id` and every chained continuation not entrant. Stops at the
    /// first entry that already is, so repeated calls are no-ops. Returns
    /// how many entries changed.
    pub fn invalidate(&mut self, id: EntryId) -> usize {
        let mut changed = 0;
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(entry) = self.get_mut(current) else {
                break;
            };
            if entry.not_entrant() {
                break;
            }
            entry.flags.insert(EntryFlags::NOT_ENTRANT);
            changed += 1;
            cursor = entry.next;
        }
        if changed > 0 {
            debug!(entry = ?id, changed, "invalidated cache entries");
        }
        changed
    }

    pub fn mark_loaded(&mut self, id: EntryId) {
        if let Some(entry) = self.get_mut(id) {
            entry.flags.insert(EntryFlags::LOADED);
        }
    }

    /// A failed load is permanent for the run and drops the entry at
    /// finalization.
    pub fn mark_load_fail(&mut self, id: EntryId) {
        if let Some(entry) = self.get_mut(id) {
            entry.flags.insert(EntryFlags::LOAD_FAIL);
        }
    }

    /// Merges both populations; see [`merge_entries`].
    pub fn merge(&self, loaded_image: &[u8], stored_payload: &[u8]) -> Result<MergedEntries> {
        merge_entries(&self.loaded, loaded_image, &self.stored, stored_payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(id: u32, barriers: bool) -> Entry {
        let mut entry = Entry::new(EntryKind::Code, id);
        entry.comp_level = 4;
        if barriers {
            entry.flags |= EntryFlags::HAS_INIT_BARRIERS;
        }
        entry
    }

    #[test]
    fn entries_are_charged_to_the_arena_tail() {
        let mut arena = WriteArena::with_capacity(4 * ENTRY_SIZE);
        let mut index = EntryIndex::new();
        for id in 0..4 {
            index.add_entry(&mut arena, Entry::new(EntryKind::Stub, id)).unwrap();
        }
        assert_eq!(arena.tail_len(), 4 * ENTRY_SIZE);
        let err = index.add_entry(&mut arena, Entry::new(EntryKind::Stub, 9)).unwrap_err();
        assert!(matches!(err, CacheError::ArenaExhausted { .. }));
        assert_eq!(index.stored_entries().len(), 4);
    }

    #[test]
    fn regular_code_chains_to_barrier_version() {
        let mut arena = WriteArena::with_capacity(1 << 12);
        let mut index = EntryIndex::new();
        let barrier = index.add_entry(&mut arena, code(11, true)).unwrap();
        let unrelated = index.add_entry(&mut arena, code(12, false)).unwrap();
        let regular = index.add_entry(&mut arena, code(11, false)).unwrap();

        assert_eq!(index.get(regular).unwrap().next, Some(barrier));
        assert_eq!(index.get(unrelated).unwrap().next, None);
        assert_eq!(index.get(barrier).unwrap().next, None);
    }

    #[test]
    fn invalidation_cascades_once() {
        let mut arena = WriteArena::with_capacity(1 << 12);
        let mut index = EntryIndex::new();
        let barrier = index.add_entry(&mut arena, code(11, true)).unwrap();
        let regular = index.add_entry(&mut arena, code(11, false)).unwrap();

        assert_eq!(index.invalidate(regular), 2);
        assert!(index.get(barrier).unwrap().not_entrant());
        assert_eq!(index.invalidate(regular), 0);
        assert_eq!(index.invalidate(barrier), 0);
    }

    #[test]
    fn find_only_sees_loaded_entries() {
        let loaded = vec![code(3, false), code(1, false)];
        let mut keys = vec![SearchKey { id: 3, index: 0 }, SearchKey { id: 1, index: 1 }];
        sort_keys(&mut keys);
        let mut index = EntryIndex::from_loaded(loaded, keys, vec![]).unwrap();

        let mut arena = WriteArena::with_capacity(1 << 12);
        index.add_entry(&mut arena, code(7, false)).unwrap();

        assert_eq!(index.find(EntryKind::Code, 1, 4, 0), Some(EntryId::Loaded(1)));
        assert_eq!(index.find(EntryKind::Code, 7, 4, 0), None);

        index.invalidate(EntryId::Loaded(1));
        assert_eq!(index.find(EntryKind::Code, 1, 4, 0), None);
    }

    #[test]
    fn bad_preload_index_is_rejected() {
        let loaded = vec![code(3, false)];
        let keys = vec![SearchKey { id: 3, index: 0 }];
        assert!(matches!(
            EntryIndex::from_loaded(loaded, keys, vec![1]),
            Err(CacheError::Layout(_))
        ));
    }
}
