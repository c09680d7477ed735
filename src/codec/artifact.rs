use codecache_symbols::Address;
use sha1::{Digest, Sha1};

use super::reference::EmbeddedValue;
use super::relocation::{RelocKind, RelocValue, Relocation};
use crate::index::EntryKind;

/// Code sections in the order they are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SectionKind {
    Consts = 0,
    Insts = 1,
    Stubs = 2,
}

impl SectionKind {
    pub const ALL: [Self; SECTION_COUNT] = [Self::Consts, Self::Insts, Self::Stubs];

    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Consts),
            1 => Some(Self::Insts),
            2 => Some(Self::Stubs),
            _ => None,
        }
    }
}

pub const SECTION_COUNT: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct CodeSection {
    pub kind: SectionKind,
    /// Address the section was generated at. Self-referencing relocations
    /// are detected against it.
    pub origin: Address,
    pub bytes: Vec<u8>,
    /// End of the relocation-covered range within the section.
    pub locs_point: u32,
    pub relocations: Vec<Relocation>,
}

impl CodeSection {
    pub fn new(kind: SectionKind) -> Self {
        Self {
            kind,
            origin: 0,
            bytes: Vec::new(),
            locs_point: 0,
            relocations: Vec::new(),
        }
    }

    pub fn with_code(kind: SectionKind, origin: Address, bytes: Vec<u8>) -> Self {
        let locs_point = bytes.len() as u32;
        Self {
            kind,
            origin,
            bytes,
            locs_point,
            relocations: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn push_relocation(&mut self, kind: RelocKind, offset: u32, value: RelocValue) {
        self.relocations.push(Relocation {
            kind,
            offset,
            format: 0,
            value,
        });
    }
}

/// Frame size plus the entry points into the code (adapters have several).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameLayout {
    pub frame_size: u32,
    pub entry_offsets: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OopMap {
    pub pc_offset: u32,
    pub slots: Vec<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PcDesc {
    pub pc_offset: u32,
    pub scope_offset: i32,
    pub obj_offset: i32,
    pub flags: u32,
}

/// Debug information recorder output: pc descriptors and the opaque scope
/// stream they index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugInfo {
    pub pc_descs: Vec<PcDesc>,
    pub scopes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub pc_offset: u32,
    pub handler_offset: u32,
    pub scope_depth: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImplicitNullCheck {
    pub exec_offset: u32,
    pub continuation_offset: u32,
}

/// Compilation metadata copied into the entry rather than the payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileInfo {
    pub comp_level: u8,
    pub comp_id: u32,
    pub decompile: u32,
    pub num_inlined_bytecodes: u32,
    pub for_preload: bool,
    pub has_init_barriers: bool,
}

/// Everything the compiler hands over for one piece of generated code, and
/// everything a later run gets back.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledArtifact {
    pub kind: EntryKind,
    pub id: u32,
    pub name: String,
    pub sections: [CodeSection; SECTION_COUNT],
    pub frame: FrameLayout,
    pub oop_maps: Vec<OopMap>,
    pub debug_info: DebugInfo,
    pub exception_handlers: Vec<ExceptionHandler>,
    pub null_checks: Vec<ImplicitNullCheck>,
    /// Object and metadata table referenced by `RelocValue::Recorded`.
    pub references: Vec<EmbeddedValue>,
    /// Dependency records; only persisted for compiled methods.
    pub dependencies: Vec<u8>,
    pub compile: CompileInfo,
}

impl CompiledArtifact {
    pub fn new(kind: EntryKind, id: u32, name: impl Into<String>) -> Self {
        Self {
            kind,
            id,
            name: name.into(),
            sections: SectionKind::ALL.map(CodeSection::new),
            frame: FrameLayout::default(),
            oop_maps: Vec::new(),
            debug_info: DebugInfo::default(),
            exception_handlers: Vec::new(),
            null_checks: Vec::new(),
            references: Vec::new(),
            dependencies: Vec::new(),
            compile: CompileInfo::default(),
        }
    }

    /// Runtime stub keyed by its intrinsic id.
    pub fn stub(id: u32, name: impl Into<String>) -> Self {
        Self::new(EntryKind::Stub, id, name)
    }

    pub fn blob(kind: EntryKind, id: u32, name: impl Into<String>) -> Self {
        debug_assert!(kind.is_blob());
        Self::new(kind, id, name)
    }

    pub fn adapter(id: u32, name: impl Into<String>, entry_offsets: Vec<u32>) -> Self {
        let mut artifact = Self::new(EntryKind::Adapter, id, name);
        artifact.frame.entry_offsets = entry_offsets;
        artifact
    }

    /// Compiled method keyed by a hash of its full name.
    pub fn method(name: impl Into<String>, comp_level: u8, decompile: u32) -> Self {
        let name = name.into();
        let mut artifact = Self::new(EntryKind::Code, content_id(&name), name);
        artifact.compile.comp_level = comp_level;
        artifact.compile.decompile = decompile;
        artifact
    }

    pub fn section(&self, kind: SectionKind) -> &CodeSection {
        &self.sections[kind as usize]
    }

    pub fn section_mut(&mut self, kind: SectionKind) -> &mut CodeSection {
        &mut self.sections[kind as usize]
    }

    /// Total code bytes over all sections.
    pub fn code_size(&self) -> usize {
        self.sections.iter().map(|section| section.bytes.len()).sum()
    }

    /// Writes every resolved external-word target back into the code bytes
    /// at its patch site. Returns the number of words patched.
    pub fn patch_external_words(&mut self) -> usize {
        let mut patched = 0;
        for section in &mut self.sections {
            for reloc in &section.relocations {
                let (RelocKind::ExternalWord, RelocValue::Address(target)) =
                    (reloc.kind, &reloc.value)
                else {
                    continue;
                };
                let word = target.to_ne_bytes();
                let start = reloc.offset as usize;
                if let Some(slot) = section.bytes.get_mut(start..start + word.len()) {
                    slot.copy_from_slice(&word);
                    patched += 1;
                }
            }
        }
        patched
    }
}

/// Stable 32-bit id derived from a method's full name.
pub fn content_id(name: &str) -> u32 {
    let digest = Sha1::digest(name.as_bytes());
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}
