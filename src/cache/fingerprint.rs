use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::arena::{ByteReader, WriteArena};
use crate::error::{CacheError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum GcKind {
    Serial = 1,
    Parallel = 2,
    G1 = 3,
    Z = 4,
    Shenandoah = 5,
    Epsilon = 6,
}

impl GcKind {
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Serial),
            2 => Some(Self::Parallel),
            3 => Some(Self::G1),
            4 => Some(Self::Z),
            5 => Some(Self::Shenandoah),
            6 => Some(Self::Epsilon),
            _ => None,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ConfigFlags: u32 {
        const DEBUG_BUILD = 1 << 0;
        const COMPRESSED_OOPS = 1 << 1;
        const COMPRESSED_CLASS_POINTERS = 1 << 2;
        const SYSTEM_CLASS_ASSERTIONS = 1 << 3;
        const USER_CLASS_ASSERTIONS = 1 << 4;
        const ENABLE_CONTENDED_PADDING = 1 << 5;
        const RESTRICT_CONTENDED_PADDING = 1 << 6;
        const USE_TLAB = 1 << 7;
    }
}

/// Process settings that shape generated code. Cached code is only valid
/// in a process with an identical fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigFingerprint {
    pub gc: GcKind,
    pub compressed_oop_shift: u32,
    pub compressed_klass_shift: u32,
    pub object_alignment: u32,
    pub contended_padding_width: u32,
    pub flags: ConfigFlags,
}

pub const FINGERPRINT_SIZE: usize = 24;

impl Default for ConfigFingerprint {
    fn default() -> Self {
        let mut flags = ConfigFlags::COMPRESSED_OOPS
            | ConfigFlags::COMPRESSED_CLASS_POINTERS
            | ConfigFlags::ENABLE_CONTENDED_PADDING
            | ConfigFlags::RESTRICT_CONTENDED_PADDING
            | ConfigFlags::USE_TLAB;
        if cfg!(debug_assertions) {
            flags |= ConfigFlags::DEBUG_BUILD;
        }
        Self {
            gc: GcKind::G1,
            compressed_oop_shift: 3,
            compressed_klass_shift: 0,
            object_alignment: 8,
            contended_padding_width: 128,
            flags,
        }
    }
}

impl ConfigFingerprint {
    /// Compares a cached fingerprint against this process's, reporting the
    /// first field that differs.
    pub fn verify(&self, cached: &Self) -> Result<()> {
        fn check<T: PartialEq + std::fmt::Debug>(
            field: &'static str,
            cached: T,
            current: T,
        ) -> Result<()> {
            if cached == current {
                return Ok(());
            }
            Err(CacheError::FingerprintMismatch {
                field,
                cached: format!("{cached:?}"),
                current: format!("{current:?}"),
            })
        }

        check("gc", cached.gc, self.gc)?;
        check(
            "compressed_oop_shift",
            cached.compressed_oop_shift,
            self.compressed_oop_shift,
        )?;
        check(
            "compressed_klass_shift",
            cached.compressed_klass_shift,
            self.compressed_klass_shift,
        )?;
        check("object_alignment", cached.object_alignment, self.object_alignment)?;
        check(
            "contended_padding_width",
            cached.contended_padding_width,
            self.contended_padding_width,
        )?;
        for flag in ConfigFlags::all().iter() {
            if cached.flags.contains(flag) != self.flags.contains(flag) {
                let name = ConfigFlags::all()
                    .iter_names()
                    .find(|(_, value)| *value == flag)
                    .map_or("flags", |(name, _)| name);
                return check(name, cached.flags.contains(flag), self.flags.contains(flag));
            }
        }
        check("flags", cached.flags.bits(), self.flags.bits())
    }

    pub fn write(&self, arena: &mut WriteArena) -> Result<()> {
        arena.write_u32(self.gc as u32)?;
        arena.write_u32(self.compressed_oop_shift)?;
        arena.write_u32(self.compressed_klass_shift)?;
        arena.write_u32(self.object_alignment)?;
        arena.write_u32(self.contended_padding_width)?;
        arena.write_u32(self.flags.bits())?;
        Ok(())
    }

    pub fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        let raw_gc = reader.read_u32()?;
        let gc = GcKind::from_raw(raw_gc)
            .ok_or_else(|| CacheError::corrupt(format!("unknown collector {raw_gc}")))?;
        Ok(Self {
            gc,
            compressed_oop_shift: reader.read_u32()?,
            compressed_klass_shift: reader.read_u32()?,
            object_alignment: reader.read_u32()?,
            contended_padding_width: reader.read_u32()?,
            flags: ConfigFlags::from_bits_retain(reader.read_u32()?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_fingerprints_verify() {
        let current = ConfigFingerprint::default();
        current.verify(&current).unwrap();
    }

    #[test]
    fn each_field_is_checked() {
        let current = ConfigFingerprint::default();

        let mut cached = current;
        cached.object_alignment = 16;
        match current.verify(&cached) {
            Err(CacheError::FingerprintMismatch { field, cached, current }) => {
                assert_eq!(field, "object_alignment");
                assert_eq!(cached, "16");
                assert_eq!(current, "8");
            }
            other => panic!("expected mismatch, got {other:?}"),
        }

        let mut cached = current;
        cached.flags.toggle(ConfigFlags::USER_CLASS_ASSERTIONS);
        let err = current.verify(&cached).unwrap_err();
        assert!(matches!(
            err,
            CacheError::FingerprintMismatch {
                field: "USER_CLASS_ASSERTIONS",
                ..
            }
        ));

        let mut cached = current;
        cached.gc = GcKind::Z;
        assert!(current.verify(&cached).is_err());
    }

    #[test]
    fn survives_the_wire() {
        let mut fingerprint = ConfigFingerprint::default();
        fingerprint.gc = GcKind::Shenandoah;
        fingerprint.compressed_klass_shift = 3;
        let mut arena = WriteArena::with_capacity(FINGERPRINT_SIZE);
        fingerprint.write(&mut arena).unwrap();
        assert_eq!(arena.position(), FINGERPRINT_SIZE);
        let back = ConfigFingerprint::read(&mut ByteReader::new(arena.bytes())).unwrap();
        assert_eq!(back, fingerprint);
    }
}
