use codecache_symbols::Address;
use serde::{Deserialize, Serialize};

/// Live type descriptor in the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeHandle(pub Address);

/// Live method descriptor in the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodHandle(pub Address);

/// Live heap object (strings, mirrors, loaders).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle(pub Address);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum LoaderKind {
    Boot = 0,
    Platform = 1,
    App = 2,
    Custom = 3,
}

impl LoaderKind {
    /// Boot, platform and application loaders exist in every process and
    /// resolve the same names the same way.
    pub const fn is_builtin(self) -> bool {
        !matches!(self, Self::Custom)
    }

    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Boot),
            1 => Some(Self::Platform),
            2 => Some(Self::App),
            3 => Some(Self::Custom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TypeState {
    Allocated,
    Loaded,
    Linked,
    Initialized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    pub name: String,
    pub loader: LoaderKind,
    pub state: TypeState,
    pub hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub holder: TypeHandle,
    pub name: String,
    pub signature: String,
}

/// Runtime type/method resolution used by the artifact codec.
///
/// `describe_*` runs while storing, on entities the compiler embedded.
/// `find_*` and `intern_string` run while loading, possibly in a different
/// process, and return `None` when the entity does not exist there yet.
pub trait MetadataResolver: Send + Sync {
    fn describe_type(&self, ty: TypeHandle) -> Option<TypeInfo>;

    fn describe_method(&self, method: MethodHandle) -> Option<MethodInfo>;

    fn describe_string(&self, string: ObjectHandle) -> Option<String>;

    fn find_type(&self, name: &str, loader: LoaderKind) -> Option<TypeHandle>;

    fn find_method(&self, holder: TypeHandle, name: &str, signature: &str)
    -> Option<MethodHandle>;

    fn intern_string(&self, text: &str) -> Option<ObjectHandle>;
}
