use thiserror::Error;

use crate::address::{Address, Bucket, TablePhase};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SymbolError {
    #[error("cannot install {requested} addresses while the table is in phase {found:?}")]
    PhaseOrder {
        found: TablePhase,
        requested: &'static str,
    },
    #[error("{bucket:?} bucket is full ({max} addresses)")]
    BucketFull { bucket: Bucket, max: u32 },
    #[error("address {addr:#x} is registered in both {first:?} and {second:?}")]
    Ambiguous {
        addr: Address,
        first: Bucket,
        second: Bucket,
    },
    #[error("address {addr:#x} is not known while the table is in phase {phase:?}")]
    Incomplete { addr: Address, phase: TablePhase },
    #[error("address {addr:#x} is missing from the symbol table")]
    UnknownAddress { addr: Address },
    #[error("symbol id {id} is not installed while the table is in phase {phase:?}")]
    NotInstalled { id: u32, phase: TablePhase },
    #[error("symbol id {id} does not name any address")]
    UnknownId { id: u32 },
    #[error("interned string table is full ({max} strings)")]
    StringTableFull { max: u32 },
    #[error("anchor offset {offset:#x} exceeds the encodable range")]
    AnchorOutOfRange { offset: usize },
    #[error("loaded string {index} differs from the one already pinned at that id")]
    StringIdConflict { index: u32 },
}

impl SymbolError {
    /// Fatal errors mean the table was built inconsistently with the data it
    /// is asked to encode or decode. The others only concern the artifact
    /// currently being processed.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Incomplete { .. }
                | Self::NotInstalled { .. }
                | Self::StringTableFull { .. }
                | Self::StringIdConflict { .. }
        )
    }
}
