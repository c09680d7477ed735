use std::ffi::{CStr, CString};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::address::{
    ANCHOR_BASE, Address, AddressSet, AddressTable, BlobTier, C_STRINGS_BASE, C_STRINGS_MAX,
    MAX_ANCHOR_OFFSET, TablePhase,
};
use crate::error::SymbolError;
use crate::strings::CStringTable;

/// Compact replacement for an absolute address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolRef {
    /// Bucket member or interned string.
    Id(u32),
    /// Distance from the start of the process image anchor.
    AnchorOffset(u32),
}

impl SymbolRef {
    /// Persisted form: anchor offsets live above every bucket and string id.
    pub const fn to_raw(self) -> u32 {
        match self {
            Self::Id(id) => id,
            Self::AnchorOffset(offset) => ANCHOR_BASE + offset,
        }
    }

    pub const fn from_raw(raw: u32) -> Self {
        if raw >= ANCHOR_BASE {
            Self::AnchorOffset(raw - ANCHOR_BASE)
        } else {
            Self::Id(raw)
        }
    }
}

/// Region of the process image that raw diagnostic string pointers may point
/// into. Addresses inside it that no bucket knows about are encoded relative
/// to `start`.
///
/// This is a compatibility hazard: the encoding only round-trips when the
/// loading process lays out the same image with the same relative offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorRegion {
    pub start: Address,
    pub len: usize,
}

impl AnchorRegion {
    pub const fn new(start: Address, len: usize) -> Self {
        Self { start, len }
    }

    pub const fn none() -> Self {
        Self { start: 0, len: 0 }
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr - self.start < self.len
    }
}

/// Bidirectional address/id mapping plus the interned string table.
///
/// Address buckets are written during startup phases and read concurrently
/// afterwards. Interning runs under its own mutex because compiler threads
/// intern strings independently of the cache's write lock.
#[derive(Debug)]
pub struct SymbolTable {
    addresses: RwLock<AddressTable>,
    strings: Mutex<CStringTable>,
    anchor: AnchorRegion,
}

impl SymbolTable {
    pub fn new(anchor: AnchorRegion) -> Self {
        Self {
            addresses: RwLock::new(AddressTable::new()),
            strings: Mutex::new(CStringTable::new()),
            anchor,
        }
    }

    pub fn anchor(&self) -> AnchorRegion {
        self.anchor
    }

    pub fn phase(&self) -> TablePhase {
        self.addresses.read().phase()
    }

    pub fn is_complete(&self) -> bool {
        self.phase() == TablePhase::Complete
    }

    pub fn install_early(&self, set: &AddressSet) -> Result<(), SymbolError> {
        self.addresses.write().install_early(set)
    }

    pub fn install_runtime(&self, set: &AddressSet) -> Result<(), SymbolError> {
        self.addresses.write().install_runtime(set)
    }

    pub fn install_tier_blobs(&self, tier: BlobTier, blobs: &[Address]) -> Result<(), SymbolError> {
        self.addresses.write().install_tier_blobs(tier, blobs)
    }

    pub fn add_c_string(&self, s: &CStr) -> Result<(), SymbolError> {
        self.strings.lock().intern(s).map(|_| ())
    }

    pub fn id_for_c_string(&self, s: &CStr) -> Result<u32, SymbolError> {
        let index = self.strings.lock().intern(s)?;
        Ok(C_STRINGS_BASE + index)
    }

    /// Encodes an address embedded in generated code.
    ///
    /// Interned strings are checked first, then the buckets in priority
    /// order, and only then the anchor region.
    pub fn id_for_address(&self, addr: Address) -> Result<SymbolRef, SymbolError> {
        if let Some(index) = self.strings.lock().index_of_address(addr) {
            return Ok(SymbolRef::Id(C_STRINGS_BASE + index));
        }

        let addresses = self.addresses.read();
        if let Some(id) = addresses.lookup(addr) {
            return Ok(SymbolRef::Id(id));
        }

        if self.anchor.contains(addr) {
            let offset = addr - self.anchor.start;
            if offset > MAX_ANCHOR_OFFSET as usize {
                return Err(SymbolError::AnchorOutOfRange { offset });
            }
            trace!(addr = format_args!("{addr:#x}"), offset, "encoded address relative to anchor");
            return Ok(SymbolRef::AnchorOffset(offset as u32));
        }

        match addresses.phase() {
            TablePhase::Complete => Err(SymbolError::UnknownAddress { addr }),
            phase => Err(SymbolError::Incomplete { addr, phase }),
        }
    }

    pub fn address_for(&self, symbol: SymbolRef) -> Result<Address, SymbolError> {
        match symbol {
            SymbolRef::AnchorOffset(offset) => Ok(self.anchor.start + offset as usize),
            SymbolRef::Id(id) if id >= C_STRINGS_BASE => {
                if id >= C_STRINGS_BASE + C_STRINGS_MAX {
                    return Err(SymbolError::UnknownId { id });
                }
                self.strings
                    .lock()
                    .address_of(id - C_STRINGS_BASE)
                    .ok_or(SymbolError::UnknownId { id })
            }
            SymbolRef::Id(id) => self.addresses.read().address(id),
        }
    }

    pub fn address_for_id(&self, raw: u32) -> Result<Address, SymbolError> {
        self.address_for(SymbolRef::from_raw(raw))
    }

    /// Restores strings persisted by the run that produced a loaded cache.
    /// Strings interned before this call move to ids after the loaded ones.
    pub fn load_strings(&self, strings: Vec<CString>) -> Result<(), SymbolError> {
        let count = strings.len();
        self.strings.lock().load(strings)?;
        debug!(count, "loaded interned strings");
        Ok(())
    }

    pub fn string_count(&self) -> usize {
        self.strings.lock().len()
    }

    /// Copies out every interned string in id order.
    pub fn strings_snapshot(&self) -> Vec<CString> {
        self.strings.lock().iter().map(CStr::to_owned).collect()
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new(AnchorRegion::none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Bucket;

    fn complete_table(anchor: AnchorRegion) -> SymbolTable {
        let table = SymbolTable::new(anchor);
        table
            .install_early(&AddressSet {
                externals: vec![0x1000],
                stubs: vec![0x2000],
                shared_blobs: Vec::new(),
            })
            .unwrap();
        table
            .install_runtime(&AddressSet {
                externals: vec![0x1100],
                stubs: vec![0x2100],
                shared_blobs: vec![0x3000],
            })
            .unwrap();
        table.install_tier_blobs(BlobTier::Tier1, &[0x4000]).unwrap();
        table.install_tier_blobs(BlobTier::Tier2, &[0x5000]).unwrap();
        table
    }

    #[test]
    fn address_round_trips_through_ids() {
        let table = complete_table(AnchorRegion::none());
        for addr in [0x1000, 0x1100, 0x2000, 0x2100, 0x3000, 0x4000, 0x5000] {
            let symbol = table.id_for_address(addr).unwrap();
            assert!(matches!(symbol, SymbolRef::Id(_)));
            assert_eq!(table.address_for(symbol).unwrap(), addr);
            assert_eq!(table.address_for_id(symbol.to_raw()).unwrap(), addr);
        }
        assert_eq!(
            table.id_for_address(0x2000).unwrap(),
            SymbolRef::Id(Bucket::Stub.base())
        );
    }

    #[test]
    fn strings_are_checked_before_buckets() {
        let table = complete_table(AnchorRegion::none());
        let message: &CStr = c"uncommon trap";
        let id = table.id_for_c_string(message).unwrap();
        assert_eq!(id, C_STRINGS_BASE);
        assert_eq!(
            table.id_for_address(message.as_ptr() as Address).unwrap(),
            SymbolRef::Id(id)
        );

        let copy = table.address_for_id(id).unwrap();
        // SAFETY: the table owns the copy and outlives this borrow.
        let text = unsafe { CStr::from_ptr(copy as *const std::ffi::c_char) };
        assert_eq!(text, message);
    }

    #[test]
    fn unknown_address_is_fatal_only_when_complete() {
        let partial = SymbolTable::default();
        partial.install_runtime(&AddressSet::default()).unwrap();
        let err = partial.id_for_address(0xdead).unwrap_err();
        assert!(matches!(err, SymbolError::Incomplete { .. }));
        assert!(!err.is_fatal());

        let complete = complete_table(AnchorRegion::none());
        let err = complete.id_for_address(0xdead).unwrap_err();
        assert_eq!(err, SymbolError::UnknownAddress { addr: 0xdead });
        assert!(err.is_fatal());
    }

    #[test]
    fn anchor_fallback_sits_above_all_ranges() {
        let anchor = AnchorRegion::new(0x10_0000, 0x1_0000);
        let table = complete_table(anchor);

        let at_start = table.id_for_address(0x10_0000).unwrap();
        assert_eq!(at_start, SymbolRef::AnchorOffset(0));
        assert_eq!(at_start.to_raw(), ANCHOR_BASE);

        let last = table.id_for_address(0x10_ffff).unwrap();
        assert_eq!(last, SymbolRef::AnchorOffset(0xffff));
        assert_eq!(SymbolRef::from_raw(last.to_raw()), last);
        assert_eq!(table.address_for(last).unwrap(), 0x10_ffff);

        // One past the region is no longer an anchor address.
        assert!(table.id_for_address(0x11_0000).is_err());
    }

    #[test]
    fn anchor_offsets_beyond_the_id_space_are_rejected() {
        let span = MAX_ANCHOR_OFFSET as usize + 2;
        let table = complete_table(AnchorRegion::new(0, span));
        let max = table.id_for_address(MAX_ANCHOR_OFFSET as usize).unwrap();
        assert_eq!(max.to_raw(), u32::MAX - 1);
        assert!(matches!(
            table.id_for_address(MAX_ANCHOR_OFFSET as usize + 1),
            Err(SymbolError::AnchorOutOfRange { .. })
        ));
    }

    #[test]
    fn loaded_strings_keep_their_ids() {
        let table = SymbolTable::default();
        table
            .load_strings(vec![CString::new("old").unwrap()])
            .unwrap();
        assert_eq!(table.id_for_c_string(c"new").unwrap(), C_STRINGS_BASE + 1);
        assert_eq!(table.id_for_c_string(c"old").unwrap(), C_STRINGS_BASE);
        assert_eq!(table.strings_snapshot().len(), 2);
    }

    #[test]
    fn strings_interned_before_loading_are_kept() {
        let table = SymbolTable::default();
        let early: &CStr = c"early diagnostic";
        table.add_c_string(early).unwrap();
        let copy = table.address_for_id(C_STRINGS_BASE).unwrap();

        table
            .load_strings(vec![CString::new("old").unwrap()])
            .unwrap();
        assert_eq!(table.id_for_c_string(c"old").unwrap(), C_STRINGS_BASE);
        assert_eq!(table.id_for_c_string(early).unwrap(), C_STRINGS_BASE + 1);
        assert_eq!(table.address_for_id(C_STRINGS_BASE + 1).unwrap(), copy);
        assert_eq!(
            table.id_for_address(copy).unwrap(),
            SymbolRef::Id(C_STRINGS_BASE + 1)
        );
    }
}
