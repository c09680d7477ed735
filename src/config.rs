use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default write arena size.
pub const DEFAULT_CAPACITY: usize = 16 * 1024 * 1024;

/// Cache policy toggles.
///
/// Using a cache and creating one are independent: a run may load from
/// `load_path`, store into `store_path`, both (possibly the same file) or
/// neither.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Container to reuse code from.
    pub load_path: Option<PathBuf>,
    /// Container to write at close.
    pub store_path: Option<PathBuf>,
    /// Promote any load or store failure to a panic.
    pub strict: bool,
    /// Write arena size in bytes.
    pub capacity: usize,
    /// Code is being produced without running the target application, so
    /// decompile counts are not meaningful.
    pub offline: bool,
    /// Honour the preload index of a loaded container.
    pub preload: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            load_path: None,
            store_path: None,
            strict: false,
            capacity: DEFAULT_CAPACITY,
            offline: false,
            preload: true,
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from `CODECACHE_*` variables supplied by
    /// `lookup`. Unparsable values are reported and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(path) = lookup("CODECACHE_LOAD").filter(|v| !v.is_empty()) {
            config.load_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("CODECACHE_STORE").filter(|v| !v.is_empty()) {
            config.store_path = Some(PathBuf::from(path));
        }
        if let Some(val) = lookup("CODECACHE_STRICT") {
            config.strict = parse_flag("CODECACHE_STRICT", &val).unwrap_or(config.strict);
        }
        if let Some(val) = lookup("CODECACHE_OFFLINE") {
            config.offline = parse_flag("CODECACHE_OFFLINE", &val).unwrap_or(config.offline);
        }
        if let Some(val) = lookup("CODECACHE_PRELOAD") {
            config.preload = parse_flag("CODECACHE_PRELOAD", &val).unwrap_or(config.preload);
        }
        if let Some(val) = lookup("CODECACHE_SIZE") {
            match parse_size(&val) {
                Some(size) => config.capacity = size,
                None => warn!(value = %val, "ignoring invalid CODECACHE_SIZE"),
            }
        }
        config
    }

    pub fn is_enabled(&self) -> bool {
        self.load_path.is_some() || self.store_path.is_some()
    }

    #[cfg(feature = "toml-config")]
    pub fn from_toml_file(path: &std::path::Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read cache config {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("failed to parse cache config {}", path.display()))
    }
}

fn parse_flag(name: &str, value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!(%name, %value, "ignoring invalid boolean");
            None
        }
    }
}

/// Byte count with an optional `k`, `m` or `g` suffix.
fn parse_size(value: &str) -> Option<usize> {
    let value = value.trim();
    let (digits, shift) = match value.char_indices().last()? {
        (at, 'k' | 'K') => (&value[..at], 10),
        (at, 'm' | 'M') => (&value[..at], 20),
        (at, 'g' | 'G') => (&value[..at], 30),
        _ => (value, 0),
    };
    let size: usize = digits.trim().parse().ok()?;
    size.checked_mul(1 << shift).filter(|&size| size > 0)
}
