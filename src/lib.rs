//! Persistent, memory-mappable cache of generated machine code.
//!
//! A managed runtime compiles the same stubs, adapters and hot methods on
//! every start. [`CodeCache`] stores those artifacts in a single container
//! file at shutdown and lets the next run with an identical configuration
//! reuse them instead of compiling again.

pub mod arena;
pub mod cache;
pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod guard;
pub mod index;
pub mod runtime;
pub mod stats;
pub mod utils;

pub use cache::{CacheRuntime, CacheState, CodeCache, ConfigFingerprint, ContainerImage};
pub use codec::{CompiledArtifact, EmbeddedValue, RelocKind, RelocValue};
pub use codecache_symbols as symbols;
pub use config::CacheConfig;
pub use error::{CacheError, LookupFailure, Result, Severity};
pub use index::{Entry, EntryFlags, EntryId, EntryKind};
