//! Byte storage for the cache.
//!
//! Writing goes through [`WriteArena`], a bounded append buffer whose high
//! end is carved into entry slots. Reading goes through [`ReadBuffer`], a
//! mapped (or owned) immutable image walked with a [`ByteReader`].
//!
//! All integers are fixed width in native byte order; a container is never
//! expected to move between architectures.

mod buffer;

pub use buffer::{ByteReader, ReadBuffer};

use tracing::warn;

use crate::error::{CacheError, Result};

/// Every artifact, table and entry payload starts on this boundary.
pub const DATA_ALIGNMENT: usize = 8;

pub const fn align_up(value: usize) -> usize {
    (value + DATA_ALIGNMENT - 1) & !(DATA_ALIGNMENT - 1)
}

/// Bounded append buffer.
///
/// Payload bytes grow upward from offset zero while entry slots are carved
/// downward from `capacity`; the two may never cross. The first failed
/// reservation poisons the arena and every later write is refused, so a
/// caller that ignores one error cannot produce a torn artifact.
#[derive(Debug)]
pub struct WriteArena {
    bytes: Vec<u8>,
    capacity: usize,
    tail: usize,
    failed: bool,
}

impl WriteArena {
    /// Maximum eager allocation; the buffer grows on demand up to `capacity`.
    const PREALLOC_MAX_BYTES: usize = 1024 * 1024;

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity.min(Self::PREALLOC_MAX_BYTES)),
            capacity,
            tail: 0,
            failed: false,
        }
    }

    pub fn position(&self) -> usize {
        self.bytes.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes still available between the write cursor and the entry slots.
    pub fn remaining(&self) -> usize {
        self.capacity
            .saturating_sub(self.tail)
            .saturating_sub(self.bytes.len())
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    fn ensure(&mut self, requested: usize) -> Result<()> {
        if self.failed {
            return Err(CacheError::ArenaFailed);
        }
        let remaining = self.remaining();
        if requested > remaining {
            self.failed = true;
            warn!(requested, remaining, capacity = self.capacity, "cache arena exhausted");
            return Err(CacheError::ArenaExhausted {
                requested,
                remaining,
            });
        }
        Ok(())
    }

    /// Hands out exactly `n` zeroed bytes at the write cursor.
    pub fn reserve(&mut self, n: usize) -> Result<&mut [u8]> {
        self.ensure(n)?;
        let start = self.bytes.len();
        self.bytes.resize(start + n, 0);
        Ok(&mut self.bytes[start..])
    }

    /// Appends `data`, returning the offset it was written at.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        let offset = self.position();
        self.reserve(data.len())?.copy_from_slice(data);
        Ok(offset)
    }

    pub fn write_u8(&mut self, value: u8) -> Result<usize> {
        self.write(&[value])
    }

    pub fn write_u16(&mut self, value: u16) -> Result<usize> {
        self.write(&value.to_ne_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<usize> {
        self.write(&value.to_ne_bytes())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<usize> {
        self.write(&value.to_ne_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<usize> {
        self.write(&value.to_ne_bytes())
    }

    /// Addresses are always stored as 64-bit values.
    pub fn write_address(&mut self, addr: usize) -> Result<usize> {
        self.write_u64(addr as u64)
    }

    /// Length-prefixed UTF-8.
    pub fn write_str(&mut self, s: &str) -> Result<usize> {
        let len = u32::try_from(s.len())
            .map_err(|_| CacheError::Malformed(format!("string of {} bytes", s.len())))?;
        let offset = self.write_u32(len)?;
        self.write(s.as_bytes())?;
        Ok(offset)
    }

    /// Nul-terminated string; returns the offset and the size including the
    /// terminator.
    pub fn write_cstr(&mut self, s: &str) -> Result<(usize, usize)> {
        if s.as_bytes().contains(&0) {
            return Err(CacheError::Malformed(format!("name `{s}` contains a nul byte")));
        }
        let size = s.len() + 1;
        let offset = self.position();
        let slot = self.reserve(size)?;
        slot[..s.len()].copy_from_slice(s.as_bytes());
        Ok((offset, size))
    }

    pub fn align(&mut self) -> Result<()> {
        let padding = align_up(self.position()) - self.position();
        if padding > 0 {
            self.reserve(padding)?;
        }
        Ok(())
    }

    /// Overwrites four already written bytes, typically a count placeholder.
    pub fn patch_u32(&mut self, at: usize, value: u32) -> Result<()> {
        let slot = self
            .bytes
            .get_mut(at..at + 4)
            .ok_or_else(|| CacheError::corrupt(format!("patch at {at} past write cursor")))?;
        slot.copy_from_slice(&value.to_ne_bytes());
        Ok(())
    }

    /// Rewinds the write cursor, discarding everything after `position`.
    /// The failed state is sticky and survives a rewind.
    pub fn truncate(&mut self, position: usize) {
        self.bytes.truncate(position);
    }

    /// Carves `n` bytes off the high end of the arena and returns the
    /// offset of the new slot. Slots are handed out top-down, so the most
    /// recent one has the lowest offset.
    pub fn reserve_tail(&mut self, n: usize) -> Result<usize> {
        self.ensure(n)?;
        self.tail += n;
        Ok(self.capacity - self.tail)
    }

    pub fn tail_len(&self) -> usize {
        self.tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_pads_to_boundary() {
        let mut arena = WriteArena::with_capacity(64);
        arena.write_u8(1).unwrap();
        arena.align().unwrap();
        assert_eq!(arena.position(), DATA_ALIGNMENT);
        arena.align().unwrap();
        assert_eq!(arena.position(), DATA_ALIGNMENT);
    }

    #[test]
    fn failure_is_sticky() {
        let mut arena = WriteArena::with_capacity(8);
        arena.write_u32(7).unwrap();
        let err = arena.write_u64(1).unwrap_err();
        assert!(matches!(err, CacheError::ArenaExhausted { requested: 8, remaining: 4 }));
        assert!(arena.is_failed());

        // Even a write that would fit is refused now.
        assert!(matches!(arena.write_u8(0), Err(CacheError::ArenaFailed)));
        assert_eq!(arena.position(), 4);
    }

    #[test]
    fn tail_slots_shrink_payload_space() {
        let mut arena = WriteArena::with_capacity(64);
        assert_eq!(arena.reserve_tail(16).unwrap(), 48);
        assert_eq!(arena.reserve_tail(16).unwrap(), 32);
        assert_eq!(arena.remaining(), 32);
        arena.reserve(32).unwrap();
        assert!(arena.write_u8(0).is_err());
    }

    #[test]
    fn cstr_and_patch() {
        let mut arena = WriteArena::with_capacity(64);
        let (offset, size) = arena.write_cstr("stub").unwrap();
        assert_eq!((offset, size), (0, 5));
        assert_eq!(&arena.bytes()[..5], b"stub\0");

        let at = arena.write_u32(0).unwrap();
        arena.patch_u32(at, 9).unwrap();
        assert_eq!(&arena.bytes()[at..at + 4], &9u32.to_ne_bytes());
        assert!(arena.write_cstr("a\0b").is_err());
    }

    #[test]
    fn truncate_rewinds_cursor() {
        let mut arena = WriteArena::with_capacity(64);
        arena.write_u64(1).unwrap();
        let mark = arena.position();
        arena.write_u64(2).unwrap();
        arena.truncate(mark);
        assert_eq!(arena.position(), mark);
    }
}
