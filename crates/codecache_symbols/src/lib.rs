//! Address and string compaction for position-independent cached code.
//!
//! Generated code embeds absolute addresses of runtime routines, stubs and
//! blobs. None of those addresses survive a process restart, so the cache
//! stores a small dense id instead and maps it back on load. The id space is
//! partitioned into fixed ranges, one per [`Bucket`], followed by the
//! interned C-string range and finally the anchor-relative range used for raw
//! pointers into the process image.

pub mod address;
pub mod error;
pub mod strings;
pub mod table;

pub use address::{
    ANCHOR_BASE, Address, AddressSet, AddressTable, BlobTier, Bucket, C_STRINGS_BASE,
    C_STRINGS_MAX, MAX_ANCHOR_OFFSET, TablePhase,
};
pub use error::SymbolError;
pub use strings::CStringTable;
pub use table::{AnchorRegion, SymbolRef, SymbolTable};
