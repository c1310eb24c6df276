//! Familiar Schema Compiler
//!
//! Compiles JSON Schema (draft-07) documents into validating functions,
//! resolving `$id`/`$ref` across documents held by a [`SchemaRegistry`].
//!
//! ## Features
//!
//! - **Reference resolution**: `$ref` to other documents, to JSON pointers
//!   and to nested `$id`s, including recursive and mutually recursive schemas
//! - **Compiled validators**: every document compiles once; structurally
//!   equal documents share one validator through a content-addressed cache
//! - **Pluggable vocabularies**: custom keywords with ordering constraints,
//!   value meta-schemas, macros and asynchronous checks
//! - **Meta-schema validation**: documents are checked against their
//!   `$schema` (draft-07 is built in)
//! - **Async loading**: missing documents are fetched, deduplicated, and
//!   the compile retried
//!
//! ## Example
//!
//! ```no_run
//! use familiar_schemac::{Options, SchemaRegistry};
//! use serde_json::json;
//!
//! # fn main() -> familiar_schemac::Result<()> {
//! let mut registry = SchemaRegistry::new(Options::default())?;
//! registry.add_schema(json!({"$id": "B", "type": "number"}), None)?;
//! let validator = registry.compile(json!({
//!     "$id": "A",
//!     "properties": {"x": {"$ref": "B"}}
//! }))?;
//! assert!(validator.is_valid(&json!({"x": 1})));
//! assert!(!validator.is_valid(&json!({"x": "s"})));
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod checksum;
pub mod compiler;
pub mod config;
pub mod error;
pub mod formats;
pub mod keywords;
pub mod loader;
pub mod registry;
pub mod resolver;
pub mod schema;
pub mod validator;
pub mod vocabulary;

pub use cache::{CacheKey, KeySerializer, SchemaCache};
pub use checksum::Checksum;
pub use compiler::KeywordContext;
pub use config::{
    ExtendRefs, MissingMetaPolicy, Options, SchemaConfig, UnknownFormats, UnknownKeywords,
    ValidateSchema,
};
pub use error::{Result, SchemaError};
pub use formats::{Format, FormatRegistry};
pub use loader::{FileLoader, SchemaFetcher, SchemaLoader};
pub use registry::{AddOptions, RemoveTarget, SchemaRegistry, DRAFT07_META};
pub use schema::{CompilationState, EntryId, SchemaEntry};
pub use validator::{
    check, Check, Outcome, Scope, Subschema, ValidationError, ValidationErrors, Validator,
};
pub use vocabulary::{
    AsyncKeyword, JsonType, KeywordBehavior, KeywordCompiler, KeywordDefinition, SubschemaKind,
    Vocabulary, VocabularyRegistry,
};
