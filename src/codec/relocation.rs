use codecache_symbols::{Address, SymbolRef};

use super::CodecContext;
use super::artifact::CodeSection;
use super::reference::{EmbeddedValue, Reference};
use crate::arena::{ByteReader, WriteArena};
use crate::error::{CacheError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RelocKind {
    None = 0,
    Oop = 1,
    Metadata = 2,
    VirtualCall = 3,
    OptVirtualCall = 4,
    StaticCall = 5,
    RuntimeCall = 6,
    ExternalWord = 7,
    InternalWord = 8,
    Poll = 9,
    PollReturn = 10,
    PostCallNop = 11,
    TrampolineStub = 12,
}

/// What the auxiliary word of a relocation means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operand {
    Nothing,
    /// Absolute address encoded through the symbol table.
    Target,
    /// Object or metadata constant, inline or via the reference table.
    Constant,
    /// Offset inside the artifact's own code.
    Internal,
}

impl RelocKind {
    pub const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::None,
            1 => Self::Oop,
            2 => Self::Metadata,
            3 => Self::VirtualCall,
            4 => Self::OptVirtualCall,
            5 => Self::StaticCall,
            6 => Self::RuntimeCall,
            7 => Self::ExternalWord,
            8 => Self::InternalWord,
            9 => Self::Poll,
            10 => Self::PollReturn,
            11 => Self::PostCallNop,
            12 => Self::TrampolineStub,
            _ => return None,
        })
    }

    pub const fn is_call(self) -> bool {
        matches!(
            self,
            Self::VirtualCall | Self::OptVirtualCall | Self::StaticCall | Self::RuntimeCall
        )
    }

    const fn operand(self) -> Operand {
        match self {
            Self::VirtualCall
            | Self::OptVirtualCall
            | Self::StaticCall
            | Self::RuntimeCall
            | Self::ExternalWord => Operand::Target,
            Self::Oop | Self::Metadata => Operand::Constant,
            Self::InternalWord | Self::TrampolineStub => Operand::Internal,
            Self::None | Self::Poll | Self::PollReturn | Self::PostCallNop => Operand::Nothing,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelocValue {
    None,
    /// Absolute target in the current process.
    Address(Address),
    /// Call whose target is its own patch site; left untouched on load.
    SelfReference,
    /// Constant materialized directly in the instruction stream.
    Immediate(EmbeddedValue),
    /// Index into the artifact's reference table.
    Recorded(u32),
    /// Offset within the artifact's code.
    Internal(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Relocation {
    pub kind: RelocKind,
    /// Patch site, relative to the section start.
    pub offset: u32,
    /// Instruction-format variant; carried through untouched.
    pub format: u8,
    pub value: RelocValue,
}

/// On-disk size of one relocation record, excluding its auxiliary word.
pub const RECORD_SIZE: usize = 8;

/// Auxiliary word for a self-referencing call, or for a constant stored
/// inline after the auxiliary array. No symbol id or table index reaches it.
const MARKER: u32 = u32::MAX;

impl CodecContext<'_> {
    /// Writes one section's relocation stream: count, locations point, the
    /// raw records, one auxiliary word per record and finally the inline
    /// constants in record order.
    pub(crate) fn write_relocations(
        &self,
        arena: &mut WriteArena,
        section: &CodeSection,
        reference_count: usize,
    ) -> Result<()> {
        let count = u32::try_from(section.relocations.len())
            .map_err(|_| CacheError::Malformed("too many relocations".into()))?;
        arena.write_u32(count)?;
        arena.write_u32(section.locs_point)?;

        for reloc in &section.relocations {
            if reloc.offset as usize >= section.bytes.len().max(1) {
                return Err(CacheError::Malformed(format!(
                    "{:?} relocation at {} outside {} byte section",
                    reloc.kind,
                    reloc.offset,
                    section.bytes.len()
                )));
            }
            arena.write_u8(reloc.kind as u8)?;
            arena.write_u8(reloc.format)?;
            arena.write_u16(0)?;
            arena.write_u32(reloc.offset)?;
        }

        let mut inline = Vec::new();
        for reloc in &section.relocations {
            let aux = match (reloc.kind.operand(), &reloc.value) {
                (Operand::Nothing, RelocValue::None) => 0,
                (Operand::Target, RelocValue::SelfReference) => MARKER,
                (Operand::Target, RelocValue::Address(addr)) => {
                    if reloc.kind.is_call() && *addr == section.origin + reloc.offset as usize {
                        MARKER
                    } else {
                        self.symbols.id_for_address(*addr)?.to_raw()
                    }
                }
                (Operand::Constant, RelocValue::Immediate(value)) => {
                    inline.push(self.encode_value(value)?);
                    MARKER
                }
                (Operand::Constant, RelocValue::Recorded(index))
                    if (*index as usize) < reference_count =>
                {
                    *index
                }
                (Operand::Internal, RelocValue::Internal(offset)) => *offset,
                (_, value) => {
                    return Err(CacheError::Malformed(format!(
                        "{:?} relocation at {} cannot carry {value:?}",
                        reloc.kind, reloc.offset
                    )));
                }
            };
            arena.write_u32(aux)?;
        }

        for reference in &inline {
            reference.write(arena)?;
        }
        Ok(())
    }

    /// Reads one section's relocation stream, re-binding every target
    /// through the symbol table. Returns the relocations and the locations
    /// point.
    pub(crate) fn read_relocations(
        &self,
        reader: &mut ByteReader<'_>,
        section_len: usize,
        reference_count: usize,
    ) -> Result<(Vec<Relocation>, u32)> {
        let count = reader.read_count(RECORD_SIZE + 4)?;
        let locs_point = reader.read_u32()?;

        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            let raw = reader.read_u8()?;
            let kind = RelocKind::from_raw(raw)
                .ok_or_else(|| CacheError::corrupt(format!("unknown relocation kind {raw}")))?;
            let format = reader.read_u8()?;
            reader.read_u16()?;
            let offset = reader.read_u32()?;
            if offset as usize >= section_len.max(1) {
                return Err(CacheError::corrupt(format!(
                    "relocation at {offset} outside {section_len} byte section"
                )));
            }
            records.push((kind, format, offset));
        }

        let mut auxiliary = Vec::with_capacity(count);
        for _ in 0..count {
            auxiliary.push(reader.read_u32()?);
        }

        let mut relocations = Vec::with_capacity(count);
        for ((kind, format, offset), aux) in records.into_iter().zip(auxiliary) {
            let value = match kind.operand() {
                Operand::Nothing => RelocValue::None,
                Operand::Target if aux == MARKER => RelocValue::SelfReference,
                Operand::Target => {
                    RelocValue::Address(self.symbols.address_for(SymbolRef::from_raw(aux))?)
                }
                Operand::Constant if aux == MARKER => {
                    RelocValue::Immediate(self.decode_value(&Reference::read(reader)?)?)
                }
                Operand::Constant if (aux as usize) < reference_count => RelocValue::Recorded(aux),
                Operand::Constant => {
                    return Err(CacheError::corrupt(format!(
                        "relocation references entry {aux} of {reference_count}"
                    )));
                }
                Operand::Internal => RelocValue::Internal(aux),
            };
            relocations.push(Relocation {
                kind,
                offset,
                format,
                value,
            });
        }
        Ok((relocations, locs_point))
    }
}
