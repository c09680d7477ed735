use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use codecache_symbols::SymbolTable;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::container::{self, ContainerImage};
use super::fingerprint::ConfigFingerprint;
use super::header::CacheHeader;
use crate::arena::WriteArena;
use crate::codec::{CodecContext, CompiledArtifact, peek_name};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result, Severity};
use crate::guard::Guarded;
use crate::index::{Entry, EntryFlags, EntryId, EntryIndex, EntryKind};
use crate::runtime::{BaseImage, MetadataResolver, NoBaseImage};
use crate::stats::{CacheStats, CacheStatsSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Closed,
    OpenForRead,
    OpenForWrite,
    OpenForBoth,
    Closing,
}

impl CacheState {
    pub fn can_read(self) -> bool {
        matches!(self, Self::OpenForRead | Self::OpenForBoth)
    }

    pub fn can_write(self) -> bool {
        matches!(self, Self::OpenForWrite | Self::OpenForBoth)
    }
}

/// Process services the cache relies on.
#[derive(Clone)]
pub struct CacheRuntime {
    pub symbols: Arc<SymbolTable>,
    pub image: Arc<dyn BaseImage>,
    pub resolver: Arc<dyn MetadataResolver>,
}

impl CacheRuntime {
    pub fn new(symbols: Arc<SymbolTable>, resolver: Arc<dyn MetadataResolver>) -> Self {
        Self {
            symbols,
            image: Arc::new(NoBaseImage),
            resolver,
        }
    }

    pub fn with_image(mut self, image: Arc<dyn BaseImage>) -> Self {
        self.image = image;
        self
    }
}

/// One process's code cache: the container loaded at startup, the arena
/// new artifacts are written to, and the index over both.
pub struct CodeCache {
    config: CacheConfig,
    fingerprint: ConfigFingerprint,
    runtime: CacheRuntime,
    loaded: Guarded<ContainerImage>,
    writer: Mutex<Option<WriteArena>>,
    index: RwLock<EntryIndex>,
    state: Mutex<CacheState>,
    failed: AtomicBool,
    stats: CacheStats,
}

impl CodeCache {
    /// Opens the cache as `config` asks.
    ///
    /// A container that is missing is not an error. One that cannot be used
    /// disables the cache (or panics under `strict`).
    pub fn open(
        config: CacheConfig,
        fingerprint: ConfigFingerprint,
        runtime: CacheRuntime,
    ) -> Self {
        let mut cache = Self {
            config,
            fingerprint,
            runtime,
            loaded: Guarded::new(None),
            writer: Mutex::new(None),
            index: RwLock::new(EntryIndex::new()),
            state: Mutex::new(CacheState::Closed),
            failed: AtomicBool::new(false),
            stats: CacheStats::new(),
        };

        let mut readable = false;
        if let Some(path) = cache.config.load_path.clone() {
            match cache.map_container(&path) {
                Ok(Some((image, index))) => {
                    info!(
                        path = %path.display(),
                        entries = index.loaded_entries().len(),
                        "loaded code cache"
                    );
                    cache.loaded = Guarded::new(Some(image));
                    cache.index = RwLock::new(index);
                    readable = true;
                }
                Ok(None) => info!(path = %path.display(), "no code cache to load"),
                Err(err) => cache.report(&err, "open"),
            }
        }

        let writable = cache.config.store_path.is_some() && !cache.is_failed();
        if writable {
            *cache.writer.get_mut() = Some(WriteArena::with_capacity(cache.config.capacity));
        }

        *cache.state.get_mut() = match (readable && !cache.is_failed(), writable) {
            (true, true) => CacheState::OpenForBoth,
            (true, false) => CacheState::OpenForRead,
            (false, true) => CacheState::OpenForWrite,
            (false, false) => CacheState::Closed,
        };
        debug!(state = ?cache.state(), "code cache opened");
        cache
    }

    fn map_container(&self, path: &std::path::Path) -> Result<Option<(ContainerImage, EntryIndex)>> {
        let image = match ContainerImage::open(path, &self.fingerprint) {
            Ok(image) => image,
            Err(CacheError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        let index = image.load_index()?;
        self.runtime
            .symbols
            .load_strings(image.strings()?)
            .map_err(CacheError::StringSeed)?;
        Ok(Some((image, index)))
    }

    /// Applies the failure policy: fatal errors always panic, strict mode
    /// panics on anything but a routine lookup miss, and cache-wide errors
    /// disable the cache.
    fn report(&self, err: &CacheError, operation: &'static str) {
        let severity = err.severity();
        let routine = matches!(err, CacheError::LookupFailed(_));
        if severity == Severity::Fatal || (self.config.strict && !routine) {
            panic!("code cache {operation} failed: {err}");
        }
        match severity {
            Severity::Cache => {
                if !self.failed.swap(true, Ordering::AcqRel) {
                    warn!(operation, error = %err, "code cache disabled");
                }
            }
            _ => debug!(operation, error = %err, "code cache artifact skipped"),
        }
    }

    fn codec(&self, for_preload: bool) -> CodecContext<'_> {
        CodecContext {
            symbols: &self.runtime.symbols,
            image: self.runtime.image.as_ref(),
            resolver: self.runtime.resolver.as_ref(),
            for_preload,
        }
    }

    fn check_usable(&self) -> Result<()> {
        if self.is_failed() {
            return Err(CacheError::Disabled);
        }
        Ok(())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn fingerprint(&self) -> &ConfigFingerprint {
        &self.fingerprint
    }

    pub fn symbols(&self) -> &Arc<SymbolTable> {
        &self.runtime.symbols
    }

    pub fn state(&self) -> CacheState {
        *self.state.lock()
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn loaded_header(&self) -> Option<CacheHeader> {
        self.loaded.enter().map(|image| *image.header())
    }

    /// Serializes `artifact` into the write arena and records its entry.
    ///
    /// A failure discards this artifact only, unless it exhausts the arena
    /// (which disables the cache) or reveals an inconsistent symbol table
    /// (which panics).
    pub fn store_artifact(&self, artifact: &CompiledArtifact) -> Result<EntryId> {
        self.check_usable()?;
        let mut writer = self.writer.lock();
        let arena = writer.as_mut().ok_or(CacheError::NotOpen("write"))?;

        let result = self.store_locked(arena, artifact);
        match &result {
            Ok(id) => {
                self.stats.record_store(artifact.kind);
                debug!(
                    kind = artifact.kind.name(),
                    id = artifact.id,
                    name = %artifact.name,
                    entry = ?id,
                    "stored artifact"
                );
            }
            Err(err) => {
                self.stats.record_store_failure();
                self.report(err, "store");
            }
        }
        result
    }

    fn store_locked(&self, arena: &mut WriteArena, artifact: &CompiledArtifact) -> Result<EntryId> {
        if artifact.kind == EntryKind::None {
            return Err(CacheError::Malformed("artifact without a kind".into()));
        }
        let compile = &artifact.compile;
        let layout = self
            .codec(compile.for_preload)
            .write_artifact(arena, artifact)?;

        let mut entry = Entry::new(artifact.kind, artifact.id);
        entry.offset = u32::try_from(layout.offset)
            .map_err(|_| CacheError::Layout(format!("arena offset {}", layout.offset)))?;
        entry.size = u32::try_from(layout.size)
            .map_err(|_| CacheError::Layout(format!("artifact of {} bytes", layout.size)))?;
        entry.name_offset = layout.name_offset;
        entry.name_size = layout.name_size;
        entry.code_offset = layout.code_offset;
        entry.code_size = layout.code_size;
        entry.comp_level = compile.comp_level;
        entry.comp_id = compile.comp_id;
        entry.decompile = compile.decompile;
        entry.num_inlined_bytecodes = compile.num_inlined_bytecodes;
        entry.flags.set(EntryFlags::FOR_PRELOAD, compile.for_preload);
        entry.flags.set(EntryFlags::HAS_INIT_BARRIERS, compile.has_init_barriers);
        entry.flags.set(
            EntryFlags::IGNORE_DECOMPILE,
            self.config.offline && artifact.kind == EntryKind::Code,
        );

        self.index.write().add_entry(arena, entry).inspect_err(|_| {
            arena.truncate(layout.offset);
        })
    }

    /// Searches the loaded container for a reusable artifact.
    pub fn find(&self, kind: EntryKind, id: u32, comp_level: u8, decompile: u32) -> Option<EntryId> {
        if self.is_failed() {
            return None;
        }
        let _reader = self.loaded.enter()?;
        let hit = self.index.read().find(kind, id, comp_level, decompile);
        self.stats.record_lookup(hit.is_some());
        hit
    }

    pub fn entry(&self, id: EntryId) -> Option<Entry> {
        self.index.read().get(id).cloned()
    }

    pub fn entry_name(&self, id: EntryId) -> Option<String> {
        let entry = self.entry(id)?;
        match id {
            EntryId::Loaded(_) => {
                let image = self.loaded.enter()?;
                let payload = image.payload(&entry).ok()?;
                peek_name(payload, &entry).ok().map(str::to_owned)
            }
            EntryId::Stored(_) => {
                let writer = self.writer.lock();
                let bytes = writer.as_ref()?.bytes();
                let start = entry.offset as usize;
                let payload = bytes.get(start..start + entry.size as usize)?;
                peek_name(payload, &entry).ok().map(str::to_owned)
            }
        }
    }

    /// Rebuilds a loaded artifact for installation in this process.
    ///
    /// Failure marks the entry so it is neither retried this run nor kept
    /// at finalization.
    pub fn load_artifact(&self, id: EntryId) -> Result<CompiledArtifact> {
        let EntryId::Loaded(_) = id else {
            return Err(CacheError::NotOpen("loading entries stored this run"));
        };
        self.check_usable()?;
        let image = self.loaded.enter().ok_or(CacheError::NotOpen("read"))?;
        let entry = match self.entry(id) {
            Some(entry) => entry,
            None => {
                let err = CacheError::corrupt(format!("no entry for {id:?}"));
                self.report(&err, "load");
                return Err(err);
            }
        };
        if entry.load_fail() {
            return Err(CacheError::PreviouslyFailed(entry.id));
        }

        let result = image
            .payload(&entry)
            .and_then(|payload| self.codec(entry.for_preload()).read_artifact(payload, &entry));
        drop(image);

        match result {
            Ok(artifact) => {
                self.index.write().mark_loaded(id);
                self.stats.record_load();
                Ok(artifact)
            }
            Err(err) => {
                self.index.write().mark_load_fail(id);
                self.stats.record_load_failure();
                warn!(entry = ?id, id = entry.id, error = %err, "failed to load cached artifact");
                self.report(&err, "load");
                Err(err)
            }
        }
    }

    /// `find` followed by `load_artifact`.
    pub fn lookup(
        &self,
        kind: EntryKind,
        id: u32,
        comp_level: u8,
        decompile: u32,
    ) -> Option<CompiledArtifact> {
        let entry = self.find(kind, id, comp_level, decompile)?;
        self.load_artifact(entry).ok()
    }

    /// Entrant compiled methods the loaded container marks for installation
    /// before their first call.
    pub fn preload_entries(&self) -> Vec<EntryId> {
        if !self.config.preload || self.is_failed() {
            return Vec::new();
        }
        let Some(_reader) = self.loaded.enter() else {
            return Vec::new();
        };
        let index = self.index.read();
        index
            .preload_indices()
            .iter()
            .map(|&i| EntryId::Loaded(i))
            .filter(|&id| index.get(id).is_some_and(Entry::is_entrant))
            .collect()
    }

    pub fn invalidate(&self, id: EntryId) -> usize {
        let changed = self.index.write().invalidate(id);
        self.stats.record_invalidations(changed);
        changed
    }

    /// Drains readers, unmaps the loaded container and, if the cache was
    /// writing, finalizes the new container.
    ///
    /// Returns the path written, or `None` when nothing was written: the
    /// cache was read-only, disabled, or no entry survived the merge.
    pub fn close(&self) -> Result<Option<PathBuf>> {
        {
            let mut state = self.state.lock();
            if matches!(*state, CacheState::Closing | CacheState::Closed) {
                return Ok(None);
            }
            *state = CacheState::Closing;
        }

        let loaded = self.loaded.close_and_take();
        let arena = self.writer.lock().take();
        let result = match arena {
            Some(arena) if !self.is_failed() => self.finalize(&arena, loaded.as_ref()),
            _ => Ok(None),
        };
        drop(loaded);

        *self.state.lock() = CacheState::Closed;
        if let Err(err) = &result {
            self.report(err, "finalize");
        }
        result
    }

    fn finalize(&self, arena: &WriteArena, loaded: Option<&ContainerImage>) -> Result<Option<PathBuf>> {
        let Some(path) = self.config.store_path.clone() else {
            return Ok(None);
        };
        let loaded_bytes = loaded.map_or(&[][..], ContainerImage::bytes);
        let merged = self.index.read().merge(loaded_bytes, arena.bytes())?;
        if merged.entries.is_empty() {
            info!(path = %path.display(), "no cache entries to write");
            return Ok(None);
        }

        let entries = merged.entries.len();
        let strings = self.runtime.symbols.strings_snapshot();
        let image = container::build_image(&strings, merged, self.fingerprint)?;
        container::persist(&path, &image)?;
        info!(
            path = %path.display(),
            entries,
            strings = strings.len(),
            bytes = image.len(),
            "finalized code cache"
        );
        Ok(Some(path))
    }
}

impl Drop for CodeCache {
    fn drop(&mut self) {
        if std::thread::panicking() || self.state() == CacheState::Closed {
            return;
        }
        if let Err(err) = self.close() {
            warn!(error = %err, "code cache close failed");
        }
    }
}

impl std::fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeCache")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("failed", &self.is_failed())
            .finish_non_exhaustive()
    }
}
