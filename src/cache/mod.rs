//! The cache container and the per-process manager around it.
//!
//! A container is written once, at close, and mapped read-only by later
//! runs:
//!
//! ```text
//! [header][interned strings][preload index][search table][entries][payloads]
//! ```
//!
//! The header goes in last and the file is renamed into place, so a reader
//! sees either a complete container or none.

pub mod container;
pub mod fingerprint;
pub mod header;
pub mod manager;
pub mod path;

pub use container::ContainerImage;
pub use fingerprint::{ConfigFingerprint, ConfigFlags, GcKind};
pub use header::{CacheHeader, FORMAT_VERSION, HEADER_SIZE, KindCounts, MAGIC, Region};
pub use manager::{CacheRuntime, CacheState, CodeCache};
