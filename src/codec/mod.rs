//! # Schema-Driven Codecs
//!
//! Declarative type definitions compiled into `read` / `write` / `size_of` codecs.
//!
//! ## Components
//! - **Primitives**: fixed-width numbers, varints, zigzag varints, strings
//! - **Extensions**: uuid, rest-of-buffer, tagged trees, bit flags
//! - **Compiler**: resolves a schema once into an immutable [`CodecSet`]
//!
//! A [`CodecSet`] has no interior state and is safe to share across threads.

pub mod compiler;
pub mod extensions;
pub mod nbt;
pub mod primitives;
pub mod schema;
pub mod value;

pub use compiler::{compile, compile_with, Codec, CodecSet, CompiledCodec, Compiler, TypeId};
pub use extensions::{ContextType, ExtensionRegistry, NativeType, ParametrizedType};
pub use nbt::{NamedTag, Tag, TagType};
pub use primitives::Primitive;
pub use schema::{parse_schema, ProtocolDef, Schema, TypeDef};
pub use value::Value;
