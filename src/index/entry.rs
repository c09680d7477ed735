use bitflags::bitflags;
use serde::Serialize;

use crate::arena::ByteReader;
use crate::error::{CacheError, Result};

/// What an entry holds. Persisted as a `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u32)]
pub enum EntryKind {
    None = 0,
    Adapter = 1,
    Stub = 2,
    SharedBlob = 3,
    Tier1Blob = 4,
    Tier2Blob = 5,
    Code = 6,
}

impl EntryKind {
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Adapter),
            2 => Some(Self::Stub),
            3 => Some(Self::SharedBlob),
            4 => Some(Self::Tier1Blob),
            5 => Some(Self::Tier2Blob),
            6 => Some(Self::Code),
            _ => None,
        }
    }

    pub const fn is_blob(self) -> bool {
        matches!(self, Self::SharedBlob | Self::Tier1Blob | Self::Tier2Blob)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Adapter => "adapter",
            Self::Stub => "stub",
            Self::SharedBlob => "shared-blob",
            Self::Tier1Blob => "tier1-blob",
            Self::Tier2Blob => "tier2-blob",
            Self::Code => "code",
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EntryFlags: u32 {
        /// Superseded or invalidated; never returned by lookups.
        const NOT_ENTRANT = 1 << 0;
        /// Successfully reused in this run.
        const LOADED = 1 << 1;
        /// Reuse was attempted and failed in this run.
        const LOAD_FAIL = 1 << 2;
        /// May be installed before the first call.
        const FOR_PRELOAD = 1 << 3;
        /// Compiled with class-initialization barriers.
        const HAS_INIT_BARRIERS = 1 << 4;
        /// Produced without running the application; decompile counts are
        /// meaningless.
        const IGNORE_DECOMPILE = 1 << 5;
    }
}

impl EntryFlags {
    /// Flags that describe the artifact rather than this run's use of it.
    pub const PERSISTENT: Self = Self::NOT_ENTRANT
        .union(Self::FOR_PRELOAD)
        .union(Self::HAS_INIT_BARRIERS)
        .union(Self::IGNORE_DECOMPILE);
}

/// Handle to an entry: one of the finalized entries of the loaded
/// container, or one written during this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryId {
    Loaded(u32),
    Stored(u32),
}

pub const ENTRY_SIZE: usize = 56;

/// Fixed-size descriptor of one cached artifact.
///
/// `name_offset` and `code_offset` are relative to `offset`, the start of
/// the artifact's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub kind: EntryKind,
    pub id: u32,
    pub offset: u32,
    pub size: u32,
    pub name_offset: u32,
    pub name_size: u32,
    pub code_offset: u32,
    pub code_size: u32,
    pub comp_level: u8,
    pub comp_id: u32,
    pub decompile: u32,
    pub num_inlined_bytecodes: u32,
    pub flags: EntryFlags,
    /// Barrier continuation invalidated together with this entry. Never
    /// persisted.
    pub next: Option<EntryId>,
}

impl Entry {
    pub fn new(kind: EntryKind, id: u32) -> Self {
        Self {
            kind,
            id,
            offset: 0,
            size: 0,
            name_offset: 0,
            name_size: 0,
            code_offset: 0,
            code_size: 0,
            comp_level: 0,
            comp_id: 0,
            decompile: 0,
            num_inlined_bytecodes: 0,
            flags: EntryFlags::empty(),
            next: None,
        }
    }

    pub fn is_entrant(&self) -> bool {
        !self.flags.contains(EntryFlags::NOT_ENTRANT)
    }

    pub fn not_entrant(&self) -> bool {
        self.flags.contains(EntryFlags::NOT_ENTRANT)
    }

    pub fn load_fail(&self) -> bool {
        self.flags.contains(EntryFlags::LOAD_FAIL)
    }

    pub fn loaded(&self) -> bool {
        self.flags.contains(EntryFlags::LOADED)
    }

    pub fn for_preload(&self) -> bool {
        self.flags.contains(EntryFlags::FOR_PRELOAD)
    }

    pub fn has_init_barriers(&self) -> bool {
        self.flags.contains(EntryFlags::HAS_INIT_BARRIERS)
    }

    pub fn ignore_decompile(&self) -> bool {
        self.flags.contains(EntryFlags::IGNORE_DECOMPILE)
    }

    /// Lookup predicate. Entries that failed to load this run never match.
    /// Compiled methods must additionally be entrant,
    /// barrier-free, at the requested level and (unless produced offline)
    /// at the requested decompile count.
    pub fn matches(&self, kind: EntryKind, id: u32, comp_level: u8, decompile: u32) -> bool {
        if self.kind != kind || self.id != id || self.load_fail() {
            return false;
        }
        if kind != EntryKind::Code {
            return true;
        }
        self.is_entrant()
            && !self.has_init_barriers()
            && self.comp_level == comp_level
            && (self.ignore_decompile() || self.decompile == decompile)
    }

    pub fn encode(&self) -> [u8; ENTRY_SIZE] {
        let persisted = self.flags & EntryFlags::PERSISTENT;
        let fields = [
            self.kind as u32,
            self.id,
            self.offset,
            self.size,
            self.name_offset,
            self.name_size,
            self.code_offset,
            self.code_size,
            u32::from(self.comp_level),
            self.comp_id,
            self.decompile,
            self.num_inlined_bytecodes,
            persisted.bits(),
        ];
        let mut out = [0u8; ENTRY_SIZE];
        for (slot, value) in out.chunks_exact_mut(4).zip(fields) {
            slot.copy_from_slice(&value.to_ne_bytes());
        }
        out
    }

    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        let start = reader.position();
        let raw_kind = reader.read_u32()?;
        let kind = EntryKind::from_raw(raw_kind)
            .ok_or_else(|| CacheError::corrupt(format!("unknown entry kind {raw_kind}")))?;
        let mut entry = Self::new(kind, reader.read_u32()?);
        entry.offset = reader.read_u32()?;
        entry.size = reader.read_u32()?;
        entry.name_offset = reader.read_u32()?;
        entry.name_size = reader.read_u32()?;
        entry.code_offset = reader.read_u32()?;
        entry.code_size = reader.read_u32()?;
        let level = reader.read_u32()?;
        entry.comp_level = u8::try_from(level)
            .map_err(|_| CacheError::corrupt(format!("compilation level {level}")))?;
        entry.comp_id = reader.read_u32()?;
        entry.decompile = reader.read_u32()?;
        entry.num_inlined_bytecodes = reader.read_u32()?;
        entry.flags = EntryFlags::from_bits_truncate(reader.read_u32()?) & EntryFlags::PERSISTENT;
        reader.seek(start + ENTRY_SIZE)?;
        Ok(entry)
    }
}
