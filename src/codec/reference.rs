use tracing::trace;

use super::CodecContext;
use crate::arena::{ByteReader, WriteArena};
use crate::error::{CacheError, LookupFailure, Result};
use crate::runtime::{LoaderKind, MethodHandle, ObjectHandle, TypeHandle, TypeInfo, TypeState};

/// Primitive type mirrors the compiler may embed as constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PrimitiveType {
    Boolean = 4,
    Char = 5,
    Float = 6,
    Double = 7,
    Byte = 8,
    Short = 9,
    Int = 10,
    Long = 11,
    Void = 14,
}

impl PrimitiveType {
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            4 => Some(Self::Boolean),
            5 => Some(Self::Char),
            6 => Some(Self::Float),
            7 => Some(Self::Double),
            8 => Some(Self::Byte),
            9 => Some(Self::Short),
            10 => Some(Self::Int),
            11 => Some(Self::Long),
            14 => Some(Self::Void),
            _ => None,
        }
    }
}

/// A runtime value embedded in generated code, as the live process sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmbeddedValue {
    Null,
    /// Placeholder slot with no value behind it.
    NoData,
    Type(TypeHandle),
    Method(MethodHandle),
    String(ObjectHandle),
    Primitive(PrimitiveType),
    SystemLoader,
    PlatformLoader,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub name: String,
    pub loader: LoaderKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub holder: TypeDescriptor,
    pub name: String,
    pub signature: String,
}

/// Persisted form of an [`EmbeddedValue`].
///
/// The `Shared*` forms are offsets into the base image and are only valid
/// while the same image is mapped; everything else is re-resolved by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    NoData,
    Null,
    Type(TypeDescriptor),
    Method(MethodDescriptor),
    String(String),
    Primitive(PrimitiveType),
    SystemLoader,
    PlatformLoader,
    SharedType(u32),
    SharedMethod(u32),
    SharedString(u32),
}

mod tag {
    pub const NO_DATA: i32 = -1;
    pub const NULL: i32 = 0;
    pub const TYPE: i32 = 1;
    pub const METHOD: i32 = 2;
    pub const STRING: i32 = 3;
    pub const PRIMITIVE: i32 = 4;
    pub const SYSTEM_LOADER: i32 = 7;
    pub const PLATFORM_LOADER: i32 = 8;
    pub const SHARED_TYPE: i32 = 9;
    pub const SHARED_METHOD: i32 = 10;
    pub const SHARED_STRING: i32 = 11;
}

impl Reference {
    fn tag(&self) -> i32 {
        match self {
            Self::NoData => tag::NO_DATA,
            Self::Null => tag::NULL,
            Self::Type(_) => tag::TYPE,
            Self::Method(_) => tag::METHOD,
            Self::String(_) => tag::STRING,
            Self::Primitive(_) => tag::PRIMITIVE,
            Self::SystemLoader => tag::SYSTEM_LOADER,
            Self::PlatformLoader => tag::PLATFORM_LOADER,
            Self::SharedType(_) => tag::SHARED_TYPE,
            Self::SharedMethod(_) => tag::SHARED_METHOD,
            Self::SharedString(_) => tag::SHARED_STRING,
        }
    }

    pub fn write(&self, arena: &mut WriteArena) -> Result<()> {
        arena.write_i32(self.tag())?;
        match self {
            Self::NoData | Self::Null | Self::SystemLoader | Self::PlatformLoader => {}
            Self::Type(ty) => write_type(arena, ty)?,
            Self::Method(method) => {
                write_type(arena, &method.holder)?;
                arena.write_str(&method.name)?;
                arena.write_str(&method.signature)?;
            }
            Self::String(text) => {
                arena.write_str(text)?;
            }
            Self::Primitive(primitive) => {
                arena.write_u8(*primitive as u8)?;
            }
            Self::SharedType(offset) | Self::SharedMethod(offset) | Self::SharedString(offset) => {
                arena.write_u32(*offset)?;
            }
        }
        Ok(())
    }

    /// An unknown tag means the stream is out of step with its writer.
    pub fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        let tag = reader.read_i32()?;
        Ok(match tag {
            tag::NO_DATA => Self::NoData,
            tag::NULL => Self::Null,
            tag::TYPE => Self::Type(read_type(reader)?),
            tag::METHOD => Self::Method(MethodDescriptor {
                holder: read_type(reader)?,
                name: reader.read_str()?.to_owned(),
                signature: reader.read_str()?.to_owned(),
            }),
            tag::STRING => Self::String(reader.read_str()?.to_owned()),
            tag::PRIMITIVE => {
                let raw = reader.read_u8()?;
                Self::Primitive(PrimitiveType::from_raw(raw).ok_or_else(|| {
                    CacheError::corrupt(format!("unknown primitive type {raw}"))
                })?)
            }
            tag::SYSTEM_LOADER => Self::SystemLoader,
            tag::PLATFORM_LOADER => Self::PlatformLoader,
            tag::SHARED_TYPE => Self::SharedType(reader.read_u32()?),
            tag::SHARED_METHOD => Self::SharedMethod(reader.read_u32()?),
            tag::SHARED_STRING => Self::SharedString(reader.read_u32()?),
            other => return Err(CacheError::corrupt(format!("unknown reference tag {other}"))),
        })
    }
}

fn write_type(arena: &mut WriteArena, ty: &TypeDescriptor) -> Result<()> {
    arena.write_u32(ty.loader as u32)?;
    arena.write_str(&ty.name)?;
    Ok(())
}

fn read_type(reader: &mut ByteReader<'_>) -> Result<TypeDescriptor> {
    let raw = reader.read_u32()?;
    let loader = LoaderKind::from_raw(raw)
        .ok_or_else(|| CacheError::corrupt(format!("unknown loader kind {raw}")))?;
    Ok(TypeDescriptor {
        loader,
        name: reader.read_str()?.to_owned(),
    })
}

impl CodecContext<'_> {
    /// Chooses the persisted form for a value about to be stored.
    pub fn encode_value(&self, value: &EmbeddedValue) -> Result<Reference> {
        Ok(match *value {
            EmbeddedValue::Null => Reference::Null,
            EmbeddedValue::NoData => Reference::NoData,
            EmbeddedValue::Primitive(primitive) => Reference::Primitive(primitive),
            EmbeddedValue::SystemLoader => Reference::SystemLoader,
            EmbeddedValue::PlatformLoader => Reference::PlatformLoader,
            EmbeddedValue::Type(ty) => match self.image.delta_from_base(ty.0) {
                Some(offset) => Reference::SharedType(offset),
                None => Reference::Type(self.describe_type(ty)?),
            },
            EmbeddedValue::Method(method) => match self.image.delta_from_base(method.0) {
                Some(offset) => Reference::SharedMethod(offset),
                None => {
                    let info = self
                        .resolver
                        .describe_method(method)
                        .ok_or(LookupFailure::Undescribable("method"))?;
                    Reference::Method(MethodDescriptor {
                        holder: self.describe_type(info.holder)?,
                        name: info.name,
                        signature: info.signature,
                    })
                }
            },
            EmbeddedValue::String(string) => match self.image.string_index(string) {
                Some(index) if self.image.is_mapped() => Reference::SharedString(index),
                _ => Reference::String(
                    self.resolver
                        .describe_string(string)
                        .ok_or(LookupFailure::Undescribable("string"))?,
                ),
            },
        })
    }

    fn describe_type(&self, ty: TypeHandle) -> Result<TypeDescriptor> {
        let info = self
            .resolver
            .describe_type(ty)
            .ok_or(LookupFailure::Undescribable("type"))?;
        self.check_type(&info)?;
        Ok(TypeDescriptor {
            name: info.name,
            loader: info.loader,
        })
    }

    fn check_type(&self, info: &TypeInfo) -> Result<(), LookupFailure> {
        if info.hidden {
            return Err(LookupFailure::Hidden(info.name.clone()));
        }
        if self.for_preload && !info.loader.is_builtin() {
            return Err(LookupFailure::NonBuiltinLoader(info.name.clone()));
        }
        Ok(())
    }

    /// Re-materializes a persisted value in the current process.
    pub fn decode_value(&self, reference: &Reference) -> Result<EmbeddedValue> {
        Ok(match reference {
            Reference::Null => EmbeddedValue::Null,
            Reference::NoData => EmbeddedValue::NoData,
            Reference::Primitive(primitive) => EmbeddedValue::Primitive(*primitive),
            Reference::SystemLoader => EmbeddedValue::SystemLoader,
            Reference::PlatformLoader => EmbeddedValue::PlatformLoader,
            Reference::SharedType(offset) => {
                EmbeddedValue::Type(TypeHandle(self.shared_pointer(*offset)?))
            }
            Reference::SharedMethod(offset) => {
                EmbeddedValue::Method(MethodHandle(self.shared_pointer(*offset)?))
            }
            Reference::SharedString(index) => {
                if !self.image.is_mapped() {
                    return Err(LookupFailure::BaseImageUnavailable.into());
                }
                EmbeddedValue::String(
                    self.image
                        .string_at(*index)
                        .ok_or(LookupFailure::SharedStringMissing(*index))?,
                )
            }
            Reference::Type(ty) => EmbeddedValue::Type(self.resolve_type(ty)?),
            Reference::Method(method) => {
                let holder = self.resolve_type(&method.holder)?;
                let found = self
                    .resolver
                    .find_method(holder, &method.name, &method.signature)
                    .ok_or_else(|| LookupFailure::MethodNotFound {
                        holder: method.holder.name.clone(),
                        name: method.name.clone(),
                        signature: method.signature.clone(),
                    })?;
                EmbeddedValue::Method(found)
            }
            Reference::String(text) => EmbeddedValue::String(
                self.resolver
                    .intern_string(text)
                    .ok_or_else(|| LookupFailure::StringUnavailable(text.clone()))?,
            ),
        })
    }

    fn shared_pointer(&self, offset: u32) -> Result<usize> {
        if !self.image.is_mapped() {
            return Err(LookupFailure::BaseImageUnavailable.into());
        }
        Ok(self.image.offset_to_pointer(offset))
    }

    fn resolve_type(&self, ty: &TypeDescriptor) -> Result<TypeHandle> {
        let handle = self
            .resolver
            .find_type(&ty.name, ty.loader)
            .ok_or_else(|| LookupFailure::NotLoaded(ty.name.clone()))?;
        let info = self
            .resolver
            .describe_type(handle)
            .ok_or_else(|| LookupFailure::NotLoaded(ty.name.clone()))?;
        self.check_type(&info)?;
        if info.state < TypeState::Linked {
            return Err(LookupFailure::NotLinked(ty.name.clone()).into());
        }
        trace!(name = %ty.name, "resolved cached type reference");
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use codecache_symbols::SymbolTable;

    use super::*;
    use crate::runtime::{BaseImage, MappedBaseImage, MethodInfo, MetadataResolver, NoBaseImage};

    #[derive(Default)]
    struct Types {
        types: HashMap<usize, TypeInfo>,
        strings: HashMap<usize, String>,
    }

    impl Types {
        fn with_type(mut self, addr: usize, name: &str, loader: LoaderKind, state: TypeState) -> Self {
            self.types.insert(
                addr,
                TypeInfo {
                    name: name.into(),
                    loader,
                    state,
                    hidden: false,
                },
            );
            self
        }
    }

    impl MetadataResolver for Types {
        fn describe_type(&self, ty: TypeHandle) -> Option<TypeInfo> {
            self.types.get(&ty.0).cloned()
        }

        fn describe_method(&self, method: MethodHandle) -> Option<MethodInfo> {
            Some(MethodInfo {
                holder: TypeHandle(method.0 & !0xff),
                name: "run".into(),
                signature: "()V".into(),
            })
        }

        fn describe_string(&self, string: ObjectHandle) -> Option<String> {
            self.strings.get(&string.0).cloned()
        }

        fn find_type(&self, name: &str, loader: LoaderKind) -> Option<TypeHandle> {
            self.types
                .iter()
                .find(|(_, info)| info.name == name && info.loader == loader)
                .map(|(addr, _)| TypeHandle(*addr))
        }

        fn find_method(&self, holder: TypeHandle, name: &str, _signature: &str) -> Option<MethodHandle> {
            (name == "run").then_some(MethodHandle(holder.0 + 8))
        }

        fn intern_string(&self, text: &str) -> Option<ObjectHandle> {
            self.strings
                .iter()
                .find(|(_, s)| s.as_str() == text)
                .map(|(addr, _)| ObjectHandle(*addr))
        }
    }

    fn context<'a>(
        symbols: &'a SymbolTable,
        image: &'a dyn BaseImage,
        resolver: &'a dyn MetadataResolver,
        for_preload: bool,
    ) -> CodecContext<'a> {
        CodecContext {
            symbols,
            image,
            resolver,
            for_preload,
        }
    }

    fn wire(reference: &Reference) -> Reference {
        let mut arena = WriteArena::with_capacity(256);
        reference.write(&mut arena).unwrap();
        Reference::read(&mut ByteReader::new(arena.bytes())).unwrap()
    }

    #[test]
    fn named_type_survives_the_wire() {
        let symbols = SymbolTable::default();
        let resolver = Types::default().with_type(0x4000, "app/Main", LoaderKind::App, TypeState::Linked);
        let ctx = context(&symbols, &NoBaseImage, &resolver, false);

        let reference = ctx.encode_value(&EmbeddedValue::Type(TypeHandle(0x4000))).unwrap();
        assert_eq!(
            reference,
            Reference::Type(TypeDescriptor {
                name: "app/Main".into(),
                loader: LoaderKind::App
            })
        );
        let decoded = ctx.decode_value(&wire(&reference)).unwrap();
        assert_eq!(decoded, EmbeddedValue::Type(TypeHandle(0x4000)));
    }

    #[test]
    fn image_types_are_stored_as_offsets() {
        let symbols = SymbolTable::default();
        let resolver = Types::default();
        let image = MappedBaseImage::new(0x8000_0000, 0x10_0000);
        let ctx = context(&symbols, &image, &resolver, false);

        let reference = ctx
            .encode_value(&EmbeddedValue::Type(TypeHandle(0x8000_0040)))
            .unwrap();
        assert_eq!(reference, Reference::SharedType(0x40));

        let unmapped = context(&symbols, &NoBaseImage, &resolver, false);
        let err = unmapped.decode_value(&reference).unwrap_err();
        assert!(matches!(err, CacheError::LookupFailed(LookupFailure::BaseImageUnavailable)));
    }

    #[test]
    fn unlinked_types_fail_only_the_lookup() {
        let symbols = SymbolTable::default();
        let resolver =
            Types::default().with_type(0x4000, "app/Lazy", LoaderKind::App, TypeState::Loaded);
        let ctx = context(&symbols, &NoBaseImage, &resolver, false);

        let reference = Reference::Type(TypeDescriptor {
            name: "app/Lazy".into(),
            loader: LoaderKind::App,
        });
        let err = ctx.decode_value(&reference).unwrap_err();
        assert!(matches!(err, CacheError::LookupFailed(LookupFailure::NotLinked(_))));

        let missing = Reference::Type(TypeDescriptor {
            name: "app/Gone".into(),
            loader: LoaderKind::App,
        });
        let err = ctx.decode_value(&missing).unwrap_err();
        assert!(matches!(err, CacheError::LookupFailed(LookupFailure::NotLoaded(_))));
    }

    #[test]
    fn preload_rejects_custom_loaders() {
        let symbols = SymbolTable::default();
        let resolver =
            Types::default().with_type(0x4000, "plugin/X", LoaderKind::Custom, TypeState::Linked);
        let regular = context(&symbols, &NoBaseImage, &resolver, false);
        let preload = context(&symbols, &NoBaseImage, &resolver, true);
        let value = EmbeddedValue::Type(TypeHandle(0x4000));

        assert!(regular.encode_value(&value).is_ok());
        let err = preload.encode_value(&value).unwrap_err();
        assert!(matches!(err, CacheError::LookupFailed(LookupFailure::NonBuiltinLoader(_))));
    }

    #[test]
    fn methods_resolve_through_their_holder() {
        let symbols = SymbolTable::default();
        let resolver =
            Types::default().with_type(0x4000, "app/Task", LoaderKind::Boot, TypeState::Initialized);
        let ctx = context(&symbols, &NoBaseImage, &resolver, false);

        let reference = ctx
            .encode_value(&EmbeddedValue::Method(MethodHandle(0x4010)))
            .unwrap();
        let decoded = ctx.decode_value(&wire(&reference)).unwrap();
        assert_eq!(decoded, EmbeddedValue::Method(MethodHandle(0x4008)));
    }

    #[test]
    fn strings_and_singletons() {
        let symbols = SymbolTable::default();
        let mut resolver = Types::default();
        resolver.strings.insert(0x9000, "hello".into());
        let image = MappedBaseImage::new(0x1000, 0x100).with_strings(vec![ObjectHandle(0x1010)]);
        let ctx = context(&symbols, &image, &resolver, false);

        let archived = ctx.encode_value(&EmbeddedValue::String(ObjectHandle(0x1010))).unwrap();
        assert_eq!(archived, Reference::SharedString(0));
        let heap = ctx.encode_value(&EmbeddedValue::String(ObjectHandle(0x9000))).unwrap();
        assert_eq!(heap, Reference::String("hello".into()));
        assert_eq!(
            ctx.decode_value(&wire(&heap)).unwrap(),
            EmbeddedValue::String(ObjectHandle(0x9000))
        );

        for value in [
            EmbeddedValue::Null,
            EmbeddedValue::NoData,
            EmbeddedValue::SystemLoader,
            EmbeddedValue::PlatformLoader,
            EmbeddedValue::Primitive(PrimitiveType::Long),
        ] {
            let reference = wire(&ctx.encode_value(&value).unwrap());
            assert_eq!(ctx.decode_value(&reference).unwrap(), value);
        }
    }

    #[test]
    fn unknown_tag_is_corrupt() {
        let mut arena = WriteArena::with_capacity(16);
        arena.write_i32(42).unwrap();
        let err = Reference::read(&mut ByteReader::new(arena.bytes())).unwrap_err();
        assert!(matches!(err, CacheError::Corrupt(_)));
    }
}
