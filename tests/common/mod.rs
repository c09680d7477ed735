#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use codecache::cache::CacheRuntime;
use codecache::codec::{CodeSection, DebugInfo, OopMap, PcDesc, SectionKind};
use codecache::runtime::{
    LoaderKind, MethodHandle, MethodInfo, MetadataResolver, ObjectHandle, TypeHandle, TypeInfo,
    TypeState,
};
use codecache::symbols::{Address, AddressSet, BlobTier, SymbolTable};
use codecache::{CacheConfig, CompiledArtifact, EmbeddedValue, RelocKind, RelocValue};

pub const EXTERNALS: usize = 4;
pub const STUBS: usize = 2;

const TYPE_OFFSET: usize = 0x40_0000;
const STRING_OFFSET: usize = 0x50_0000;

/// One simulated runtime process. Everything it registers lives at a
/// `base`-relative address, so two processes with different bases agree on
/// symbol ids but not on addresses.
pub struct Process {
    pub base: Address,
    pub symbols: Arc<SymbolTable>,
    pub metadata: Arc<Metadata>,
}

impl Process {
    pub fn new(base: Address) -> Self {
        let symbols = SymbolTable::default();
        symbols
            .install_runtime(&AddressSet {
                externals: (0..EXTERNALS).map(|i| base + 0x100 * i).collect(),
                stubs: (0..STUBS).map(|i| base + 0x1_0000 + 0x100 * i).collect(),
                shared_blobs: vec![base + 0x2_0000],
            })
            .expect("runtime symbols");
        symbols
            .install_tier_blobs(BlobTier::Tier1, &[base + 0x3_0000])
            .expect("tier 1 blobs");
        symbols
            .install_tier_blobs(BlobTier::Tier2, &[base + 0x3_1000])
            .expect("tier 2 blobs");

        Self {
            base,
            symbols: Arc::new(symbols),
            metadata: Arc::new(Metadata::new(base)),
        }
    }

    pub fn runtime(&self) -> CacheRuntime {
        CacheRuntime::new(self.symbols.clone(), self.metadata.clone())
    }

    pub fn external(&self, index: usize) -> Address {
        self.base + 0x100 * index
    }

    pub fn type_handle(&self, name: &str) -> TypeHandle {
        self.metadata
            .find_type(name, LoaderKind::App)
            .expect("known type")
    }

    pub fn string(&self, text: &str) -> ObjectHandle {
        self.metadata.intern_string(text).expect("known string")
    }

    /// The `memset` stub: 16 bytes of code calling one runtime routine.
    pub fn memset_stub(&self) -> CompiledArtifact {
        let mut stub = CompiledArtifact::stub(7, "memset_stub");
        let insts = stub.section_mut(SectionKind::Insts);
        *insts = CodeSection::with_code(SectionKind::Insts, self.base + 0x8000, vec![0x90; 16]);
        insts.push_relocation(RelocKind::RuntimeCall, 4, RelocValue::Address(self.external(2)));
        stub.frame.frame_size = 16;
        stub
    }

    /// A compiled method with constants, calls and the usual side tables.
    pub fn method(&self, name: &str, comp_level: u8, decompile: u32) -> CompiledArtifact {
        let mut method = CompiledArtifact::method(name, comp_level, decompile);
        method.compile.comp_id = 42;
        method.compile.num_inlined_bytecodes = 17;

        *method.section_mut(SectionKind::Consts) =
            CodeSection::with_code(SectionKind::Consts, self.base + 0x9000, vec![0xcc; 8]);
        let insts = method.section_mut(SectionKind::Insts);
        *insts = CodeSection::with_code(SectionKind::Insts, self.base + 0x9100, vec![0x90; 64]);
        insts.push_relocation(RelocKind::RuntimeCall, 0, RelocValue::Address(self.external(1)));
        insts.push_relocation(RelocKind::StaticCall, 8, RelocValue::SelfReference);
        insts.push_relocation(RelocKind::Oop, 16, RelocValue::Recorded(0));
        insts.push_relocation(
            RelocKind::Oop,
            24,
            RelocValue::Immediate(EmbeddedValue::String(self.string("hello"))),
        );
        insts.push_relocation(RelocKind::InternalWord, 32, RelocValue::Internal(48));
        insts.push_relocation(RelocKind::Poll, 56, RelocValue::None);

        method.frame.frame_size = 48;
        method.frame.entry_offsets = vec![0, 8];
        method.oop_maps.push(OopMap {
            pc_offset: 12,
            slots: vec![1, 3],
        });
        method.debug_info = DebugInfo {
            pc_descs: vec![PcDesc {
                pc_offset: 12,
                scope_offset: 0,
                obj_offset: -1,
                flags: 1,
            }],
            scopes: vec![1, 2, 3, 4, 5],
        };
        method.references = vec![
            EmbeddedValue::Type(self.type_handle("app/Main")),
            EmbeddedValue::Null,
        ];
        method.dependencies = vec![9, 9, 9];
        method
    }
}

/// Types and strings of one process, keyed by `base`-relative handles.
#[derive(Debug)]
pub struct Metadata {
    types: Vec<(TypeHandle, TypeInfo)>,
    strings: Vec<(ObjectHandle, String)>,
}

impl Metadata {
    fn new(base: Address) -> Self {
        let ty = |offset: usize, name: &str, loader, state| {
            (
                TypeHandle(base + TYPE_OFFSET + offset),
                TypeInfo {
                    name: name.into(),
                    loader,
                    state,
                    hidden: false,
                },
            )
        };
        Self {
            types: vec![
                ty(0x000, "app/Main", LoaderKind::App, TypeState::Initialized),
                ty(0x100, "app/Lazy", LoaderKind::App, TypeState::Loaded),
                ty(0x200, "plugin/Ext", LoaderKind::Custom, TypeState::Linked),
            ],
            strings: vec![
                (ObjectHandle(base + STRING_OFFSET), "hello".into()),
                (ObjectHandle(base + STRING_OFFSET + 0x40), "world".into()),
            ],
        }
    }
}

impl MetadataResolver for Metadata {
    fn describe_type(&self, ty: TypeHandle) -> Option<TypeInfo> {
        self.types
            .iter()
            .find(|(handle, _)| *handle == ty)
            .map(|(_, info)| info.clone())
    }

    fn describe_method(&self, method: MethodHandle) -> Option<MethodInfo> {
        let holder = TypeHandle(method.0 & !0xff);
        self.describe_type(holder)?;
        Some(MethodInfo {
            holder,
            name: "run".into(),
            signature: "()V".into(),
        })
    }

    fn describe_string(&self, string: ObjectHandle) -> Option<String> {
        self.strings
            .iter()
            .find(|(handle, _)| *handle == string)
            .map(|(_, text)| text.clone())
    }

    fn find_type(&self, name: &str, loader: LoaderKind) -> Option<TypeHandle> {
        self.types
            .iter()
            .find(|(_, info)| info.name == name && info.loader == loader)
            .map(|(handle, _)| *handle)
    }

    fn find_method(&self, holder: TypeHandle, name: &str, signature: &str) -> Option<MethodHandle> {
        (name == "run" && signature == "()V").then_some(MethodHandle(holder.0 + 8))
    }

    fn intern_string(&self, text: &str) -> Option<ObjectHandle> {
        self.strings
            .iter()
            .find(|(_, s)| s == text)
            .map(|(handle, _)| *handle)
    }
}

pub fn temp_cache_dir() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("codecache-test")
        .tempdir()
        .expect("failed to create temp dir")
}

pub fn container(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.ccache"))
}

pub fn store_config(path: &Path) -> CacheConfig {
    CacheConfig {
        store_path: Some(path.to_path_buf()),
        ..CacheConfig::default()
    }
}

pub fn load_config(path: &Path) -> CacheConfig {
    CacheConfig {
        load_path: Some(path.to_path_buf()),
        ..CacheConfig::default()
    }
}

pub fn load_and_store_config(load: &Path, store: &Path) -> CacheConfig {
    CacheConfig {
        load_path: Some(load.to_path_buf()),
        store_path: Some(store.to_path_buf()),
        ..CacheConfig::default()
    }
}
