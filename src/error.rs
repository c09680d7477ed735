use std::io;
use std::path::PathBuf;

use codecache_symbols::SymbolError;
use thiserror::Error;

/// How far a failure reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Only the artifact being stored or loaded is abandoned.
    Artifact,
    /// The whole cache is disabled, or the process aborts in strict mode.
    Cache,
    /// The binary format or the symbol table is inconsistent; always aborts.
    Fatal,
}

/// Why an embedded type, method or string could not be carried across runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupFailure {
    #[error("type `{0}` is not loaded")]
    NotLoaded(String),
    #[error("type `{0}` is not linked")]
    NotLinked(String),
    #[error("type `{0}` is hidden")]
    Hidden(String),
    #[error("type `{0}` is defined by a non-builtin loader")]
    NonBuiltinLoader(String),
    #[error("method `{holder}.{name}{signature}` not found")]
    MethodNotFound {
        holder: String,
        name: String,
        signature: String,
    },
    #[error("string `{0}` is unavailable")]
    StringUnavailable(String),
    #[error("shared string #{0} is not in the base image")]
    SharedStringMissing(u32),
    #[error("base image is not mapped")]
    BaseImageUnavailable,
    #[error("runtime cannot describe {0}")]
    Undescribable(&'static str),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("lookup failed: {0}")]
    LookupFailed(#[from] LookupFailure),
    #[error("malformed artifact: {0}")]
    Malformed(String),
    #[error("entry {0} already failed to load in this run")]
    PreviouslyFailed(u32),
    #[error("symbol table: {0}")]
    Symbol(#[from] SymbolError),
    #[error("cannot restore interned strings: {0}")]
    StringSeed(SymbolError),
    #[error("cache arena exhausted: requested {requested} bytes with {remaining} remaining")]
    ArenaExhausted { requested: usize, remaining: usize },
    #[error("cache arena is in failed state")]
    ArenaFailed,
    #[error("not a code cache container")]
    BadMagic,
    #[error("container version {found} does not match expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("container declares {declared} bytes but {actual} are mapped")]
    SizeMismatch { declared: usize, actual: usize },
    #[error("config fingerprint mismatch in `{field}`: cached {cached}, current {current}")]
    FingerprintMismatch {
        field: &'static str,
        cached: String,
        current: String,
    },
    #[error("invalid container layout: {0}")]
    Layout(String),
    #[error("corrupt cache data: {0}")]
    Corrupt(String),
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cache is not open for {0}")]
    NotOpen(&'static str),
    #[error("cache is disabled after an earlier failure")]
    Disabled,
}

impl CacheError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::LookupFailed(_) | Self::Malformed(_) | Self::PreviouslyFailed(_) => {
                Severity::Artifact
            }
            Self::Symbol(err) if !err.is_fatal() => Severity::Artifact,
            Self::Symbol(_) | Self::Corrupt(_) => Severity::Fatal,
            Self::ArenaExhausted { .. }
            | Self::ArenaFailed
            | Self::BadMagic
            | Self::VersionMismatch { .. }
            | Self::SizeMismatch { .. }
            | Self::FingerprintMismatch { .. }
            | Self::Layout(_)
            | Self::StringSeed(_)
            | Self::Io { .. }
            | Self::NotOpen(_)
            | Self::Disabled => Severity::Cache,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt(message.into())
    }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
