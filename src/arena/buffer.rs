use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use super::align_up;
use crate::error::{CacheError, Result};

#[derive(Debug)]
enum Backing {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

/// Immutable container image, either memory-mapped from disk or owned.
#[derive(Debug)]
pub struct ReadBuffer {
    backing: Backing,
    path: Option<PathBuf>,
}

impl ReadBuffer {
    pub fn map(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|err| CacheError::io(path, err))?;
        // SAFETY: the container is only ever replaced by an atomic rename, so
        // the mapped file is never truncated underneath us.
        let map = unsafe { Mmap::map(&file) }.map_err(|err| CacheError::io(path, err))?;
        Ok(Self {
            backing: Backing::Mapped(map),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            backing: Backing::Owned(bytes),
            path: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped(map) => &map[..],
            Backing::Owned(bytes) => bytes.as_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrowed view of `n` bytes at `offset`.
    pub fn read_at(&self, offset: usize, n: usize) -> Result<&[u8]> {
        let data = self.as_slice();
        offset
            .checked_add(n)
            .and_then(|end| data.get(offset..end))
            .ok_or_else(|| {
                CacheError::corrupt(format!(
                    "read of {n} bytes at {offset} exceeds mapped size {}",
                    data.len()
                ))
            })
    }

    pub fn reader_at(&self, offset: usize) -> Result<ByteReader<'_>> {
        ByteReader::at(self.as_slice(), offset)
    }
}

/// Forward cursor over a byte slice. The cursor only moves forward on reads
/// and can be repositioned explicitly with [`ByteReader::seek`].
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn at(data: &'a [u8], pos: usize) -> Result<Self> {
        let mut reader = Self::new(data);
        reader.seek(pos)?;
        Ok(reader)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(CacheError::corrupt(format!(
                "seek to {pos} past end {}",
                self.data.len()
            )));
        }
        self.pos = pos;
        Ok(())
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                CacheError::corrupt(format!(
                    "read of {n} bytes at {} exceeds {}",
                    self.pos,
                    self.data.len()
                ))
            })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_ne_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_ne_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_ne_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_ne_bytes(self.read_array()?))
    }

    pub fn read_address(&mut self) -> Result<usize> {
        let raw = self.read_u64()?;
        usize::try_from(raw)
            .map_err(|_| CacheError::corrupt(format!("address {raw:#x} exceeds host width")))
    }

    /// Reads a `u32` count and checks that `count * min_size` bytes remain,
    /// so corrupt counts cannot trigger huge allocations.
    pub fn read_count(&mut self, min_size: usize) -> Result<usize> {
        let count = self.read_u32()? as usize;
        if count.saturating_mul(min_size) > self.remaining() {
            return Err(CacheError::corrupt(format!(
                "count {count} at {} exceeds remaining {} bytes",
                self.pos,
                self.remaining()
            )));
        }
        Ok(count)
    }

    pub fn read_str(&mut self) -> Result<&'a str> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes).map_err(|err| CacheError::corrupt(format!("string: {err}")))
    }

    /// Reads up to and including a nul terminator.
    pub fn read_cstr(&mut self) -> Result<&'a str> {
        let rest = &self.data[self.pos..];
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| CacheError::corrupt(format!("unterminated string at {}", self.pos)))?;
        let bytes = self.read_bytes(len + 1)?;
        std::str::from_utf8(&bytes[..len])
            .map_err(|err| CacheError::corrupt(format!("string: {err}")))
    }

    pub fn align(&mut self) -> Result<()> {
        self.seek(align_up(self.pos))
    }
}
