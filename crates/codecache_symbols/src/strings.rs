use std::ffi::{CStr, CString};

use ahash::AHashMap;

use crate::address::{Address, C_STRINGS_MAX};
use crate::error::SymbolError;

/// Deduplicated copies of diagnostic C strings embedded in generated code.
///
/// Each interned string owns a heap copy whose address stays fixed for the
/// lifetime of the table, so the copy can stand in for the original pointer
/// when code is loaded in a later process. Copies are never dropped before
/// the table, even when a load renumbers them.
#[derive(Debug, Default)]
pub struct CStringTable {
    copies: Vec<CString>,
    /// Id of each copy, indexed like `copies`.
    slot_ids: Vec<Option<u32>>,
    /// Copy slot of each id.
    ids: Vec<usize>,
    by_content: AHashMap<Vec<u8>, u32>,
    by_copy: AHashMap<Address, usize>,
    /// Caller pointers passed to `intern`. Only as fresh as the last call.
    aliases: AHashMap<Address, usize>,
    /// Leading ids fixed by `load`.
    pinned: usize,
}

impl CStringTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Number of leading ids that came from a persisted table.
    pub fn pinned(&self) -> usize {
        self.pinned
    }

    /// Interns `s` and returns its index.
    ///
    /// Lookup is by pointer identity first, then by content. A pointer hit
    /// only counts when the content still matches; a content hit records the
    /// pointer as an alias of the existing copy, replacing any stale alias.
    pub fn intern(&mut self, s: &CStr) -> Result<u32, SymbolError> {
        let addr = s.as_ptr() as Address;
        let known = self
            .by_copy
            .get(&addr)
            .or_else(|| self.aliases.get(&addr))
            .filter(|&&slot| self.copies[slot].as_bytes() == s.to_bytes())
            .and_then(|&slot| self.slot_ids[slot]);
        if let Some(index) = known {
            return Ok(index);
        }

        if let Some(&index) = self.by_content.get(s.to_bytes()) {
            self.aliases.insert(addr, self.ids[index as usize]);
            return Ok(index);
        }

        if self.ids.len() >= C_STRINGS_MAX as usize {
            return Err(SymbolError::StringTableFull { max: C_STRINGS_MAX });
        }
        let slot = self.push_copy(s.to_owned());
        self.aliases.insert(addr, slot);
        Ok(self.assign(slot))
    }

    fn push_copy(&mut self, copy: CString) -> usize {
        let slot = self.copies.len();
        self.by_copy.insert(copy.as_ptr() as Address, slot);
        self.copies.push(copy);
        self.slot_ids.push(None);
        slot
    }

    fn assign(&mut self, slot: usize) -> u32 {
        let index = self.ids.len() as u32;
        self.ids.push(slot);
        self.slot_ids[slot] = Some(index);
        self.by_content
            .entry(self.copies[slot].as_bytes().to_vec())
            .or_insert(index);
        index
    }

    /// Finds an interned string by either its original pointer or the
    /// address of its copy.
    pub fn index_of_address(&self, addr: Address) -> Option<u32> {
        let slot = self.by_copy.get(&addr).or_else(|| self.aliases.get(&addr))?;
        self.slot_ids.get(*slot).copied().flatten()
    }

    pub fn address_of(&self, index: u32) -> Option<Address> {
        self.get(index).map(|s| s.as_ptr() as Address)
    }

    pub fn get(&self, index: u32) -> Option<&CStr> {
        let slot = *self.ids.get(index as usize)?;
        Some(self.copies[slot].as_c_str())
    }

    /// Seeds the table with strings persisted by a previous run so their ids
    /// keep their meaning.
    ///
    /// Loaded strings take the leading ids. Strings interned locally before
    /// the load are renumbered after them; their copies stay where they are.
    /// A second load must agree with the ids an earlier load pinned.
    pub fn load(&mut self, strings: Vec<CString>) -> Result<(), SymbolError> {
        let pinned = self.pinned.max(strings.len());
        let local = self.ids.len() - self.pinned;
        if pinned + local > C_STRINGS_MAX as usize {
            return Err(SymbolError::StringTableFull { max: C_STRINGS_MAX });
        }
        let shared = self.pinned.min(strings.len());
        if let Some(index) =
            (0..shared).find(|&i| self.copies[self.ids[i]].as_bytes() != strings[i].as_bytes())
        {
            return Err(SymbolError::StringIdConflict {
                index: index as u32,
            });
        }

        let previous = std::mem::take(&mut self.ids);
        let mut spare: AHashMap<Vec<u8>, usize> = previous[self.pinned..]
            .iter()
            .map(|&slot| (self.copies[slot].as_bytes().to_vec(), slot))
            .collect();
        self.by_content.clear();
        self.slot_ids.fill(None);

        let mut strings = strings.into_iter();
        for position in 0..pinned {
            let slot = match strings.next() {
                Some(_) if position < shared => previous[position],
                Some(s) => match spare.remove(s.as_bytes()) {
                    Some(slot) => slot,
                    None => self.push_copy(s),
                },
                None => previous[position],
            };
            self.assign(slot);
        }
        for &slot in &previous[self.pinned..] {
            if self.slot_ids[slot].is_none() {
                self.assign(slot);
            }
        }
        for slot in 0..self.copies.len() {
            if self.slot_ids[slot].is_none() {
                self.slot_ids[slot] = self.by_content.get(self.copies[slot].as_bytes()).copied();
            }
        }
        self.pinned = pinned;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &CStr> {
        self.ids.iter().map(|&slot| self.copies[slot].as_c_str())
    }
}
