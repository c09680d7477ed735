//! Artifact codec: turns a [`CompiledArtifact`] into position-independent
//! bytes and back.
//!
//! Absolute addresses inside generated code go through the symbol table;
//! embedded runtime values go through the metadata resolver or, when they
//! live in the base image, become image offsets. Anything that cannot be
//! carried across processes fails only the artifact being processed.
//!
//! Payload layout, every part starting on an aligned boundary:
//!
//! ```text
//! name\0
//! section descriptors   3 x { kind, size, origin, offset }
//! section bytes         consts, insts, stubs
//! reference count
//! relocations           per section: count, locs point, records, aux words, inline constants
//! frame layout, oop maps, debug info, exception table, null checks
//! reference table
//! dependencies          compiled methods only
//! ```

mod artifact;
mod reader;
mod reference;
mod relocation;
mod writer;

pub use artifact::{
    CodeSection, CompileInfo, CompiledArtifact, DebugInfo, ExceptionHandler, FrameLayout,
    ImplicitNullCheck, OopMap, PcDesc, SECTION_COUNT, SectionKind, content_id,
};
pub use reader::{SectionDescriptor, peek_name, peek_sections};
pub use reference::{EmbeddedValue, MethodDescriptor, PrimitiveType, Reference, TypeDescriptor};
pub use relocation::{RECORD_SIZE, RelocKind, RelocValue, Relocation};
pub use writer::ArtifactLayout;

use codecache_symbols::SymbolTable;

use crate::runtime::{BaseImage, MetadataResolver};

/// Collaborators one encode or decode pass needs.
#[derive(Clone, Copy)]
pub struct CodecContext<'a> {
    pub symbols: &'a SymbolTable,
    pub image: &'a dyn BaseImage,
    pub resolver: &'a dyn MetadataResolver,
    /// The artifact is (or will be) installed before its first call, so
    /// only entities every process agrees on may be referenced.
    pub for_preload: bool,
}

impl std::fmt::Debug for CodecContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecContext")
            .field("symbols", &self.symbols.phase())
            .field("image_mapped", &self.image.is_mapped())
            .field("for_preload", &self.for_preload)
            .finish_non_exhaustive()
    }
}
