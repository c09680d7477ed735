use ahash::AHashMap;
use tracing::debug;

use crate::error::SymbolError;

/// Raw process address of a runtime routine, stub or blob.
pub type Address = usize;

const EXTERNALS_MAX: u32 = 512;
const STUBS_MAX: u32 = 256;
const SHARED_BLOBS_MAX: u32 = 64;
const TIER1_BLOBS_MAX: u32 = 128;
const TIER2_BLOBS_MAX: u32 = 128;

const EXTERNALS_BASE: u32 = 0;
const STUBS_BASE: u32 = EXTERNALS_BASE + EXTERNALS_MAX;
const SHARED_BLOBS_BASE: u32 = STUBS_BASE + STUBS_MAX;
const TIER1_BLOBS_BASE: u32 = SHARED_BLOBS_BASE + SHARED_BLOBS_MAX;
const TIER2_BLOBS_BASE: u32 = TIER1_BLOBS_BASE + TIER1_BLOBS_MAX;

/// First id of the interned C-string range.
pub const C_STRINGS_BASE: u32 = TIER2_BLOBS_BASE + TIER2_BLOBS_MAX;
/// Maximum number of interned C strings.
pub const C_STRINGS_MAX: u32 = 1024;
/// First id of the anchor-relative range. Every id at or above this value is
/// `ANCHOR_BASE + distance`, never a bucket or string member.
pub const ANCHOR_BASE: u32 = C_STRINGS_BASE + C_STRINGS_MAX;
/// `u32::MAX` stays reserved for callers that need an out-of-band sentinel.
pub const MAX_ANCHOR_OFFSET: u32 = u32::MAX - 1 - ANCHOR_BASE;

/// Disjoint address ranges the table partitions its ids into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    External,
    Stub,
    SharedBlob,
    Tier1Blob,
    Tier2Blob,
}

impl Bucket {
    pub const ALL: [Self; 5] = [
        Self::External,
        Self::Stub,
        Self::SharedBlob,
        Self::Tier1Blob,
        Self::Tier2Blob,
    ];

    /// Stub routines first, generated blobs by tier, generic runtime
    /// functions last.
    pub const SEARCH_ORDER: [Self; 5] = [
        Self::Stub,
        Self::SharedBlob,
        Self::Tier1Blob,
        Self::Tier2Blob,
        Self::External,
    ];

    pub const fn base(self) -> u32 {
        match self {
            Self::External => EXTERNALS_BASE,
            Self::Stub => STUBS_BASE,
            Self::SharedBlob => SHARED_BLOBS_BASE,
            Self::Tier1Blob => TIER1_BLOBS_BASE,
            Self::Tier2Blob => TIER2_BLOBS_BASE,
        }
    }

    pub const fn max(self) -> u32 {
        match self {
            Self::External => EXTERNALS_MAX,
            Self::Stub => STUBS_MAX,
            Self::SharedBlob => SHARED_BLOBS_MAX,
            Self::Tier1Blob => TIER1_BLOBS_MAX,
            Self::Tier2Blob => TIER2_BLOBS_MAX,
        }
    }

    pub fn for_id(id: u32) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|bucket| id >= bucket.base() && id < bucket.base() + bucket.max())
    }

    const fn slot(self) -> usize {
        match self {
            Self::External => 0,
            Self::Stub => 1,
            Self::SharedBlob => 2,
            Self::Tier1Blob => 3,
            Self::Tier2Blob => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobTier {
    Tier1,
    Tier2,
}

impl BlobTier {
    const fn bucket(self) -> Bucket {
        match self {
            Self::Tier1 => Bucket::Tier1Blob,
            Self::Tier2 => Bucket::Tier2Blob,
        }
    }
}

/// Initialization phases, in the order the runtime makes addresses available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TablePhase {
    Empty,
    /// Addresses used by the minimal stub set generated before the runtime
    /// is fully initialized.
    Early,
    /// Full runtime-function set, all stubs and the shared blobs.
    Runtime,
    /// Both compiler tiers have registered their blobs.
    Complete,
}

/// One batch of addresses handed over by the runtime in a single phase.
#[derive(Debug, Clone, Default)]
pub struct AddressSet {
    pub externals: Vec<Address>,
    pub stubs: Vec<Address>,
    pub shared_blobs: Vec<Address>,
}

#[derive(Debug, Default)]
struct BucketTable {
    addresses: Vec<Address>,
    index: AHashMap<Address, u32>,
}

/// Address buckets populated phase by phase.
///
/// Ids are positional, so two processes that register the same addresses in
/// the same order agree on every id even though the addresses differ.
#[derive(Debug)]
pub struct AddressTable {
    phase: TablePhase,
    buckets: [BucketTable; 5],
    tier1_installed: bool,
    tier2_installed: bool,
}

impl AddressTable {
    pub fn new() -> Self {
        Self {
            phase: TablePhase::Empty,
            buckets: Default::default(),
            tier1_installed: false,
            tier2_installed: false,
        }
    }

    pub fn phase(&self) -> TablePhase {
        self.phase
    }

    pub fn len(&self, bucket: Bucket) -> usize {
        self.buckets[bucket.slot()].addresses.len()
    }

    pub fn install_early(&mut self, set: &AddressSet) -> Result<(), SymbolError> {
        if self.phase != TablePhase::Empty {
            return Err(SymbolError::PhaseOrder {
                found: self.phase,
                requested: "early",
            });
        }
        self.install_set(set)?;
        self.phase = TablePhase::Early;
        debug!(
            externals = set.externals.len(),
            stubs = set.stubs.len(),
            "installed early symbol set"
        );
        Ok(())
    }

    /// The early phase is optional; a runtime that generates no early stubs
    /// may go straight from `Empty` to `Runtime`.
    pub fn install_runtime(&mut self, set: &AddressSet) -> Result<(), SymbolError> {
        if self.phase > TablePhase::Early {
            return Err(SymbolError::PhaseOrder {
                found: self.phase,
                requested: "runtime",
            });
        }
        self.install_set(set)?;
        self.phase = TablePhase::Runtime;
        debug!(
            externals = self.len(Bucket::External),
            stubs = self.len(Bucket::Stub),
            shared_blobs = self.len(Bucket::SharedBlob),
            "installed runtime symbol set"
        );
        Ok(())
    }

    pub fn install_tier_blobs(
        &mut self,
        tier: BlobTier,
        blobs: &[Address],
    ) -> Result<(), SymbolError> {
        let installed = match tier {
            BlobTier::Tier1 => self.tier1_installed,
            BlobTier::Tier2 => self.tier2_installed,
        };
        if self.phase < TablePhase::Runtime || installed {
            return Err(SymbolError::PhaseOrder {
                found: self.phase,
                requested: match tier {
                    BlobTier::Tier1 => "tier 1 blob",
                    BlobTier::Tier2 => "tier 2 blob",
                },
            });
        }

        for &addr in blobs {
            self.insert(tier.bucket(), addr)?;
        }
        match tier {
            BlobTier::Tier1 => self.tier1_installed = true,
            BlobTier::Tier2 => self.tier2_installed = true,
        }
        if self.tier1_installed && self.tier2_installed {
            self.phase = TablePhase::Complete;
        }
        debug!(?tier, count = blobs.len(), phase = ?self.phase, "installed blob symbols");
        Ok(())
    }

    fn install_set(&mut self, set: &AddressSet) -> Result<(), SymbolError> {
        for &addr in &set.externals {
            self.insert(Bucket::External, addr)?;
        }
        for &addr in &set.stubs {
            self.insert(Bucket::Stub, addr)?;
        }
        for &addr in &set.shared_blobs {
            self.insert(Bucket::SharedBlob, addr)?;
        }
        Ok(())
    }

    fn insert(&mut self, bucket: Bucket, addr: Address) -> Result<(), SymbolError> {
        for other in Bucket::ALL {
            if other != bucket && self.buckets[other.slot()].index.contains_key(&addr) {
                return Err(SymbolError::Ambiguous {
                    addr,
                    first: other,
                    second: bucket,
                });
            }
        }

        let table = &mut self.buckets[bucket.slot()];
        let position = table.addresses.len() as u32;
        if position >= bucket.max() {
            return Err(SymbolError::BucketFull {
                bucket,
                max: bucket.max(),
            });
        }
        // Duplicates still take a slot so later positions stay stable; the
        // first registration wins lookups.
        table.addresses.push(addr);
        table.index.entry(addr).or_insert(position);
        Ok(())
    }

    /// Searches the buckets in [`Bucket::SEARCH_ORDER`] and returns the id of
    /// the first hit.
    pub fn lookup(&self, addr: Address) -> Option<u32> {
        Bucket::SEARCH_ORDER.into_iter().find_map(|bucket| {
            self.buckets[bucket.slot()]
                .index
                .get(&addr)
                .map(|position| bucket.base() + position)
        })
    }

    /// Returns the address registered under a bucket-range id.
    pub fn address(&self, id: u32) -> Result<Address, SymbolError> {
        let bucket = Bucket::for_id(id).ok_or(SymbolError::UnknownId { id })?;
        let position = (id - bucket.base()) as usize;
        match self.buckets[bucket.slot()].addresses.get(position) {
            Some(&addr) => Ok(addr),
            None if self.phase == TablePhase::Complete => Err(SymbolError::UnknownId { id }),
            None => Err(SymbolError::NotInstalled {
                id,
                phase: self.phase,
            }),
        }
    }
}

impl Default for AddressTable {
    fn default() -> Self {
        Self::new()
    }
}
