//! Interfaces to the managed runtime the cache serves.
//!
//! The cache never owns runtime metadata. It asks a [`MetadataResolver`] to
//! describe live types, methods and strings when storing, and to find them
//! again by description when loading. Entities that live in the shared
//! [`BaseImage`] skip the by-name round trip and are stored as offsets.

mod image;
mod resolver;

pub use image::{BaseImage, MappedBaseImage, NoBaseImage};
pub use resolver::{
    LoaderKind, MethodHandle, MethodInfo, MetadataResolver, ObjectHandle, TypeHandle, TypeInfo,
    TypeState,
};
