use codecache_symbols::Address;
use tracing::trace;

use super::CodecContext;
use super::artifact::{
    CodeSection, CompileInfo, CompiledArtifact, DebugInfo, ExceptionHandler, FrameLayout,
    ImplicitNullCheck, OopMap, PcDesc, SECTION_COUNT, SectionKind,
};
use super::reference::Reference;
use crate::arena::ByteReader;
use crate::error::{CacheError, Result};
use crate::index::{Entry, EntryKind};

/// Persisted description of one code section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionDescriptor {
    pub kind: SectionKind,
    pub size: u32,
    pub origin: Address,
    /// Relative to the artifact start.
    pub offset: u32,
}

const DESCRIPTOR_SIZE: usize = 24;

fn read_descriptors(reader: &mut ByteReader<'_>) -> Result<Vec<SectionDescriptor>> {
    let mut descriptors = Vec::with_capacity(SECTION_COUNT);
    for expected in SectionKind::ALL {
        let start = reader.position();
        let raw = reader.read_u32()?;
        if SectionKind::from_raw(raw) != Some(expected) {
            return Err(CacheError::corrupt(format!(
                "section descriptor {raw} where {expected:?} was expected"
            )));
        }
        descriptors.push(SectionDescriptor {
            kind: expected,
            size: reader.read_u32()?,
            origin: reader.read_address()?,
            offset: reader.read_u32()?,
        });
        reader.seek(start + DESCRIPTOR_SIZE)?;
    }
    Ok(descriptors)
}

fn read_vec<T>(
    reader: &mut ByteReader<'_>,
    min_size: usize,
    mut read: impl FnMut(&mut ByteReader<'_>) -> Result<T>,
) -> Result<Vec<T>> {
    let count = reader.read_count(min_size)?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(read(reader)?);
    }
    Ok(items)
}

fn read_blob(reader: &mut ByteReader<'_>) -> Result<Vec<u8>> {
    let len = reader.read_count(1)?;
    Ok(reader.read_bytes(len)?.to_vec())
}

/// Reads an entry's display name without decoding anything else.
pub fn peek_name<'a>(payload: &'a [u8], entry: &Entry) -> Result<&'a str> {
    let name = ByteReader::at(payload, entry.name_offset as usize)?.read_cstr()?;
    if name.len() + 1 != entry.name_size as usize {
        return Err(CacheError::corrupt(format!(
            "entry {} name is {} bytes, descriptor says {}",
            entry.id,
            name.len() + 1,
            entry.name_size
        )));
    }
    Ok(name)
}

/// Reads and checks the section descriptors of an entry's payload: every
/// section must lie inside the payload and the sizes must add up to the
/// entry's code size. Needs no runtime collaborators.
pub fn peek_sections(payload: &[u8], entry: &Entry) -> Result<Vec<SectionDescriptor>> {
    let mut reader = ByteReader::at(payload, entry.code_offset as usize)?;
    let descriptors = read_descriptors(&mut reader)?;
    let mut total = 0u64;
    for descriptor in &descriptors {
        let end = u64::from(descriptor.offset) + u64::from(descriptor.size);
        if end > payload.len() as u64 {
            return Err(CacheError::corrupt(format!(
                "{:?} section of entry {} ends at {end}, payload is {} bytes",
                descriptor.kind,
                entry.id,
                payload.len()
            )));
        }
        total += u64::from(descriptor.size);
    }
    if total != u64::from(entry.code_size) {
        return Err(CacheError::corrupt(format!(
            "entry {} sections hold {total} bytes, descriptor says {}",
            entry.id, entry.code_size
        )));
    }
    Ok(descriptors)
}

impl CodecContext<'_> {
    /// Rebuilds the artifact stored in `payload`, the bytes of `entry`.
    ///
    /// Every relocation target is re-bound to this process and every
    /// embedded value re-resolved; the first value that cannot be fails the
    /// whole artifact.
    pub fn read_artifact(&self, payload: &[u8], entry: &Entry) -> Result<CompiledArtifact> {
        let name = peek_name(payload, entry)?;
        let descriptors = peek_sections(payload, entry)?;

        let mut reader = ByteReader::at(payload, entry.code_offset as usize)?;
        reader.seek(reader.position() + SECTION_COUNT * DESCRIPTOR_SIZE)?;
        let mut sections = Vec::with_capacity(SECTION_COUNT);
        for descriptor in &descriptors {
            reader.align()?;
            if reader.position() != descriptor.offset as usize {
                return Err(CacheError::corrupt(format!(
                    "{:?} section of entry {} at {}, expected {}",
                    descriptor.kind,
                    entry.id,
                    descriptor.offset,
                    reader.position()
                )));
            }
            let bytes = reader.read_bytes(descriptor.size as usize)?.to_vec();
            sections.push(CodeSection {
                kind: descriptor.kind,
                origin: descriptor.origin,
                bytes,
                locs_point: 0,
                relocations: Vec::new(),
            });
        }
        reader.align()?;

        let reference_count = reader.read_count(4)?;
        for section in &mut sections {
            let (relocations, locs_point) =
                self.read_relocations(&mut reader, section.bytes.len(), reference_count)?;
            section.relocations = relocations;
            section.locs_point = locs_point;
        }
        reader.align()?;

        let frame = FrameLayout {
            frame_size: reader.read_u32()?,
            entry_offsets: read_vec(&mut reader, 4, |r| r.read_u32())?,
        };
        let oop_maps = read_vec(&mut reader, 8, |r| {
            Ok(OopMap {
                pc_offset: r.read_u32()?,
                slots: read_vec(r, 4, |r| r.read_u32())?,
            })
        })?;
        let debug_info = DebugInfo {
            pc_descs: read_vec(&mut reader, 16, |r| {
                Ok(PcDesc {
                    pc_offset: r.read_u32()?,
                    scope_offset: r.read_i32()?,
                    obj_offset: r.read_i32()?,
                    flags: r.read_u32()?,
                })
            })?,
            scopes: read_blob(&mut reader)?,
        };
        let exception_handlers = read_vec(&mut reader, 12, |r| {
            Ok(ExceptionHandler {
                pc_offset: r.read_u32()?,
                handler_offset: r.read_u32()?,
                scope_depth: r.read_u32()?,
            })
        })?;
        let null_checks = read_vec(&mut reader, 8, |r| {
            Ok(ImplicitNullCheck {
                exec_offset: r.read_u32()?,
                continuation_offset: r.read_u32()?,
            })
        })?;

        let mut references = Vec::with_capacity(reference_count);
        for _ in 0..reference_count {
            references.push(self.decode_value(&Reference::read(&mut reader)?)?);
        }

        let dependencies = if entry.kind == EntryKind::Code {
            read_blob(&mut reader)?
        } else {
            Vec::new()
        };

        let sections: [CodeSection; SECTION_COUNT] = sections
            .try_into()
            .map_err(|_| CacheError::corrupt("section count"))?;
        trace!(name, id = entry.id, "decoded cached artifact");

        Ok(CompiledArtifact {
            kind: entry.kind,
            id: entry.id,
            name: name.to_owned(),
            sections,
            frame,
            oop_maps,
            debug_info,
            exception_handlers,
            null_checks,
            references,
            dependencies,
            compile: CompileInfo {
                comp_level: entry.comp_level,
                comp_id: entry.comp_id,
                decompile: entry.decompile,
                num_inlined_bytecodes: entry.num_inlined_bytecodes,
                for_preload: entry.for_preload(),
                has_init_barriers: entry.has_init_barriers(),
            },
        })
    }
}
