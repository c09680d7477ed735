use tracing::{debug, trace};

use super::CodecContext;
use super::artifact::{CompiledArtifact, SectionKind};
use crate::arena::WriteArena;
use crate::error::{CacheError, Result};
use crate::index::EntryKind;

/// Where a written artifact landed. `offset` is absolute in the arena; the
/// name and code offsets are relative to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactLayout {
    pub offset: usize,
    pub size: usize,
    pub name_offset: u32,
    pub name_size: u32,
    pub code_offset: u32,
    pub code_size: u32,
}

fn len32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| CacheError::Malformed(format!("{what} of {len} exceeds u32")))
}

fn write_count(arena: &mut WriteArena, len: usize, what: &str) -> Result<()> {
    arena.write_u32(len32(len, what)?)?;
    Ok(())
}

fn write_blob(arena: &mut WriteArena, bytes: &[u8], what: &str) -> Result<()> {
    write_count(arena, bytes.len(), what)?;
    arena.write(bytes)?;
    Ok(())
}

impl CodecContext<'_> {
    /// Serializes `artifact` at the arena's write cursor.
    ///
    /// On any failure the cursor is rewound to where the artifact started,
    /// so nothing of a half-written artifact survives.
    pub fn write_artifact(
        &self,
        arena: &mut WriteArena,
        artifact: &CompiledArtifact,
    ) -> Result<ArtifactLayout> {
        arena.align()?;
        let start = arena.position();
        match self.write_payload(arena, artifact, start) {
            Ok(layout) => {
                trace!(
                    kind = artifact.kind.name(),
                    id = artifact.id,
                    size = layout.size,
                    "wrote artifact payload"
                );
                Ok(layout)
            }
            Err(err) => {
                arena.truncate(start);
                debug!(name = %artifact.name, error = %err, "discarded partially written artifact");
                Err(err)
            }
        }
    }

    fn write_payload(
        &self,
        arena: &mut WriteArena,
        artifact: &CompiledArtifact,
        start: usize,
    ) -> Result<ArtifactLayout> {
        let relative = |position: usize| len32(position - start, "artifact offset");

        let (name_at, name_size) = arena.write_cstr(&artifact.name)?;
        arena.align()?;
        let code_offset = relative(arena.position())?;

        let mut offset_slots = Vec::with_capacity(artifact.sections.len());
        for (section, expected) in artifact.sections.iter().zip(SectionKind::ALL) {
            if section.kind != expected {
                return Err(CacheError::Malformed(format!(
                    "{:?} section in the {expected:?} slot",
                    section.kind
                )));
            }
            arena.write_u32(section.kind as u32)?;
            arena.write_u32(len32(section.bytes.len(), "section")?)?;
            arena.write_address(section.origin)?;
            offset_slots.push(arena.write_u32(0)?);
            arena.write_u32(0)?;
        }
        for (section, slot) in artifact.sections.iter().zip(offset_slots) {
            arena.align()?;
            let offset = relative(arena.position())?;
            arena.write(&section.bytes)?;
            arena.patch_u32(slot, offset)?;
        }
        arena.align()?;

        let reference_count = artifact.references.len();
        write_count(arena, reference_count, "reference table")?;
        for section in &artifact.sections {
            self.write_relocations(arena, section, reference_count)?;
        }
        arena.align()?;

        let frame = &artifact.frame;
        arena.write_u32(frame.frame_size)?;
        write_count(arena, frame.entry_offsets.len(), "entry points")?;
        for &offset in &frame.entry_offsets {
            arena.write_u32(offset)?;
        }

        write_count(arena, artifact.oop_maps.len(), "oop maps")?;
        for map in &artifact.oop_maps {
            arena.write_u32(map.pc_offset)?;
            write_count(arena, map.slots.len(), "oop map slots")?;
            for &slot in &map.slots {
                arena.write_u32(slot)?;
            }
        }

        let debug_info = &artifact.debug_info;
        write_count(arena, debug_info.pc_descs.len(), "pc descriptors")?;
        for desc in &debug_info.pc_descs {
            arena.write_u32(desc.pc_offset)?;
            arena.write_i32(desc.scope_offset)?;
            arena.write_i32(desc.obj_offset)?;
            arena.write_u32(desc.flags)?;
        }
        write_blob(arena, &debug_info.scopes, "scope stream")?;

        write_count(arena, artifact.exception_handlers.len(), "exception table")?;
        for handler in &artifact.exception_handlers {
            arena.write_u32(handler.pc_offset)?;
            arena.write_u32(handler.handler_offset)?;
            arena.write_u32(handler.scope_depth)?;
        }

        write_count(arena, artifact.null_checks.len(), "null check table")?;
        for check in &artifact.null_checks {
            arena.write_u32(check.exec_offset)?;
            arena.write_u32(check.continuation_offset)?;
        }

        for value in &artifact.references {
            self.encode_value(value)?.write(arena)?;
        }

        if artifact.kind == EntryKind::Code {
            write_blob(arena, &artifact.dependencies, "dependencies")?;
        }

        Ok(ArtifactLayout {
            offset: start,
            size: arena.position() - start,
            name_offset: relative(name_at)?,
            name_size: len32(name_size, "name")?,
            code_offset,
            code_size: len32(artifact.code_size(), "code")?,
        })
    }
}
