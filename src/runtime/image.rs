use codecache_symbols::Address;

use super::ObjectHandle;

/// Address-stable shared region whose contents can be referenced by offset.
pub trait BaseImage: Send + Sync {
    fn is_mapped(&self) -> bool;

    fn origin(&self) -> Address;

    /// Whether `addr` lives in the image and may be stored as an offset.
    fn contains(&self, addr: Address) -> bool;

    fn delta_from_base(&self, addr: Address) -> Option<u32> {
        if !self.contains(addr) {
            return None;
        }
        u32::try_from(addr - self.origin()).ok()
    }

    fn offset_to_pointer(&self, offset: u32) -> Address {
        self.origin() + offset as usize
    }

    /// Index of an archived string object, if the image carries it.
    fn string_index(&self, string: ObjectHandle) -> Option<u32>;

    fn string_at(&self, index: u32) -> Option<ObjectHandle>;
}

/// Process without a shared image; every reference is stored by name.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBaseImage;

impl BaseImage for NoBaseImage {
    fn is_mapped(&self) -> bool {
        false
    }

    fn origin(&self) -> Address {
        0
    }

    fn contains(&self, _addr: Address) -> bool {
        false
    }

    fn string_index(&self, _string: ObjectHandle) -> Option<u32> {
        None
    }

    fn string_at(&self, _index: u32) -> Option<ObjectHandle> {
        None
    }
}

/// Image mapped at `origin` spanning `size` bytes, with an archived string
/// table.
#[derive(Debug, Clone, Default)]
pub struct MappedBaseImage {
    origin: Address,
    size: usize,
    strings: Vec<ObjectHandle>,
}

impl MappedBaseImage {
    pub fn new(origin: Address, size: usize) -> Self {
        Self {
            origin,
            size,
            strings: Vec::new(),
        }
    }

    pub fn with_strings(mut self, strings: Vec<ObjectHandle>) -> Self {
        self.strings = strings;
        self
    }
}

impl BaseImage for MappedBaseImage {
    fn is_mapped(&self) -> bool {
        self.size > 0
    }

    fn origin(&self) -> Address {
        self.origin
    }

    fn contains(&self, addr: Address) -> bool {
        addr >= self.origin && addr - self.origin < self.size
    }

    fn string_index(&self, string: ObjectHandle) -> Option<u32> {
        self.strings
            .iter()
            .position(|&s| s == string)
            .and_then(|index| u32::try_from(index).ok())
    }

    fn string_at(&self, index: u32) -> Option<ObjectHandle> {
        self.strings.get(index as usize).copied()
    }
}
