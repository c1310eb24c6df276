//! Schema Registry
//!
//! The engine object. Owns every table (schemas, refs, fragments, cache,
//! compiled slots) together with the vocabulary and format registries, so
//! independent registries never share state.

use include_dir::{include_dir, Dir};
use regex::Regex;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::compiler::Compiler;
use crate::config::{MissingMetaPolicy, Options, SchemaConfig, ValidateSchema};
use crate::error::{Result, SchemaError};
use crate::formats::{Format, FormatRegistry};
use crate::keywords;
use crate::resolver::{self, index_local_refs, normalize_id, split_fragment, Resolved};
use crate::schema::{CompilationState, EntryId, SchemaEntry, SchemaStore};
use crate::validator::{ValidationError, ValidationErrors, Validator};
use crate::vocabulary::{KeywordDefinition, Vocabulary, VocabularyRegistry};

/// Meta-schemas shipped with the crate
static META_DIR: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/meta");

/// Identifier of the draft-07 meta-schema
pub const DRAFT07_META: &str = "http://json-schema.org/draft-07/schema";

/// How [`SchemaRegistry::add_schema_with`] registers a document
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// Name to register under; defaults to the document's `$id`
    pub key: Option<String>,
    /// Don't check the document against its meta-schema
    pub skip_validation: bool,
    pub is_meta: bool,
}

/// What [`SchemaRegistry::remove_schema`] removes
#[derive(Debug, Clone)]
pub enum RemoveTarget {
    /// Every schema except meta-schemas
    All,
    /// The schema registered under this key or id, meta-schemas included
    Key(String),
    /// Non-meta schemas whose key or id matches
    Pattern(Regex),
    /// The schema with this document's cache key or `$id`
    Document(Value),
}

pub struct SchemaRegistry {
    options: Options,
    meta_options: Options,
    vocabulary: VocabularyRegistry,
    formats: FormatRegistry,
    store: SchemaStore,
    /// Meta-schema used when neither `$schema` nor `default_meta` applies
    default_meta: Option<String>,
    /// Errors of the last `validate*` call
    errors: Option<ValidationErrors>,
}

impl SchemaRegistry {
    /// Create a registry with the draft-07 vocabularies, formats and (when
    /// `options.meta` is set) meta-schema installed
    pub fn new(options: Options) -> Result<Self> {
        let mut vocabulary = VocabularyRegistry::new(options.overwrite_keywords);
        for vocab in keywords::draft07() {
            vocabulary.add_vocabulary(vocab)?;
        }

        let mut registry = Self {
            meta_options: options.for_meta(),
            options,
            vocabulary,
            formats: FormatRegistry::draft07()?,
            store: SchemaStore::default(),
            default_meta: None,
            errors: None,
        };
        if registry.options.meta {
            registry.add_default_meta()?;
        }
        Ok(registry)
    }

    /// Create a registry from loaded configuration
    pub fn from_config(config: &SchemaConfig) -> Result<Self> {
        Self::new(config.options())
    }

    fn add_default_meta(&mut self) -> Result<()> {
        let file = META_DIR.get_file("draft-07.json").ok_or_else(|| {
            SchemaError::MalformedSchema("embedded draft-07 meta-schema is missing".to_string())
        })?;
        let document: Value = serde_json::from_slice(file.contents())?;
        self.add_schema_with(
            document,
            AddOptions {
                key: None,
                skip_validation: true,
                is_meta: true,
            },
        )?;
        self.default_meta = Some(DRAFT07_META.to_string());
        Ok(())
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    // =========================================================================
    // Adding schemas
    // =========================================================================

    /// Add a schema under `key` (or its `$id`), checking it against its
    /// meta-schema first
    pub fn add_schema(&mut self, document: impl Into<Arc<Value>>, key: Option<&str>) -> Result<EntryId> {
        self.add_schema_with(
            document,
            AddOptions {
                key: key.map(str::to_string),
                ..AddOptions::default()
            },
        )
    }

    /// Add several schemas, each under its `$id`
    pub fn add_schemas(&mut self, documents: Vec<Value>) -> Result<Vec<EntryId>> {
        documents
            .into_iter()
            .map(|document| self.add_schema(document, None))
            .collect()
    }

    /// Add a schema other schemas can use as `$schema`
    pub fn add_meta_schema(&mut self, document: impl Into<Arc<Value>>, key: Option<&str>) -> Result<EntryId> {
        self.add_schema_with(
            document,
            AddOptions {
                key: key.map(str::to_string),
                skip_validation: false,
                is_meta: true,
            },
        )
    }

    pub fn add_schema_with(&mut self, document: impl Into<Arc<Value>>, options: AddOptions) -> Result<EntryId> {
        let document = document.into();
        let id = schema_id(&document)?;
        let key = normalize_id(options.key.as_deref().unwrap_or(&id));
        if !key.is_empty() && self.store.is_taken(&key) {
            return Err(SchemaError::DuplicateIdentifier(key));
        }

        let entry = self.add_entry(
            document,
            id,
            options.is_meta,
            !options.skip_validation,
            true,
        )?;
        if !key.is_empty() {
            self.store.schemas.insert(key.clone(), entry);
        }
        tracing::debug!(%key, entry = %entry, meta = options.is_meta, "schema added");
        Ok(entry)
    }

    /// Register a document, reusing the entry of an equal document when
    /// the cache has one
    fn add_entry(
        &mut self,
        document: Arc<Value>,
        id: String,
        is_meta: bool,
        validate: bool,
        register_id: bool,
    ) -> Result<EntryId> {
        let cache_key = self.options.serialize.key(&document);
        if let Some(entry) = self.store.cache.get(&cache_key) {
            if let Some(existing) = self.store.get(entry) {
                tracing::debug!(entry = %entry, "schema cache hit");
                if is_meta && !existing.is_meta {
                    self.promote_to_meta(entry);
                }
                return Ok(entry);
            }
        }
        if register_id && !id.is_empty() && self.store.is_taken(&id) {
            return Err(SchemaError::DuplicateIdentifier(id));
        }

        let validate = validate && self.options.validate_schema != ValidateSchema::Disabled;
        // A schema that is its own meta-schema can only be checked once registered
        let recursive_meta = !id.is_empty()
            && document
                .get("$schema")
                .and_then(Value::as_str)
                .map(normalize_id)
                .as_deref()
                == Some(id.as_str());
        if validate && !recursive_meta {
            self.validate_schema(&document, true)?;
        }

        let index = index_local_refs(&document, &id, &self.vocabulary)?;
        let entry = self.store.insert(|entry| SchemaEntry {
            id: id.clone(),
            document: document.clone(),
            local_refs: index.local_refs,
            ref_targets: index.ref_targets,
            cache_key: Some(cache_key.clone()),
            is_meta,
            root: entry,
            pointer: String::new(),
            state: CompilationState::NotStarted,
            refs: Default::default(),
        });
        self.store.cache.put(cache_key, entry);
        if register_id && !id.is_empty() {
            self.store.refs.insert(id, entry);
        }

        if validate && recursive_meta {
            if let Err(err) = self.validate_against(entry, &document, true) {
                self.store.remove(entry);
                return Err(err);
            }
        }
        Ok(entry)
    }

    /// Mark an entry and the fragments cut from it as meta-schemas and
    /// reset them, so they recompile under the meta option set
    fn promote_to_meta(&mut self, root: EntryId) {
        let members: Vec<EntryId> = self
            .store
            .live()
            .filter(|id| self.store.get(*id).map(|e| e.root == root).unwrap_or(false))
            .collect();
        for id in members {
            if let Some(entry) = self.store.get_mut(id) {
                entry.is_meta = true;
            }
            self.store.invalidate(id);
        }
        tracing::debug!(entry = %root, "schema promoted to meta-schema");
    }

    // =========================================================================
    // Compiling and lookup
    // =========================================================================

    /// Compile a document into a validator. Structurally equal documents
    /// share one entry and therefore one validator.
    pub fn compile(&mut self, document: impl Into<Arc<Value>>) -> Result<Validator> {
        let document = document.into();
        let id = schema_id(&document)?;
        let cached = self.store.cache.get(&self.options.serialize.key(&document));
        let entry = self.add_entry(document, id, false, true, self.options.add_used_schema)?;
        let created = cached != Some(entry);

        match self.compile_entry(entry) {
            Ok(validator) => Ok(validator),
            Err(err) => {
                if created {
                    self.store.remove(entry);
                }
                Err(err)
            }
        }
    }

    fn compile_entry(&mut self, entry: EntryId) -> Result<Validator> {
        let state = self.store.get(entry).map(SchemaEntry::state);
        if state != Some(CompilationState::Done) {
            Compiler::new(
                &mut self.store,
                &self.vocabulary,
                &self.formats,
                &self.options,
                &self.meta_options,
            )
            .compile(entry)?;
        }
        Ok(self.validator(entry))
    }

    fn validator(&self, entry: EntryId) -> Validator {
        let is_async = self
            .store
            .get(entry)
            .and_then(|e| self.store.get(e.root))
            .map(SchemaEntry::is_async)
            .unwrap_or(false);
        Validator::new(entry, self.store.table.clone(), is_async, self.options.all_errors)
    }

    /// Validator for a key, an id, or a reference into a known document
    pub fn get_schema(&mut self, key: &str) -> Result<Option<Validator>> {
        let key = normalize_id(key);
        if let Some(entry) = self.store.lookup(&key) {
            return self.compile_entry(entry).map(Some);
        }

        let (doc, _) = split_fragment(&key);
        let Some(owner) = self.store.lookup(doc) else {
            return Ok(None);
        };
        let (entry, created) = match resolver::resolve(&self.store, owner, &key) {
            Resolved::Entry(entry) => (entry, false),
            Resolved::Fragment {
                root,
                base,
                pointer,
                schema,
            } => self.store.fragment(root, base, pointer, schema),
            Resolved::Missing { .. } => return Ok(None),
        };
        match self.compile_entry(entry) {
            Ok(validator) => Ok(Some(validator)),
            Err(err) => {
                if created {
                    self.store.remove(entry);
                }
                Err(err)
            }
        }
    }

    /// Entry registered under a key or id
    pub fn schema_entry(&self, key: &str) -> Option<&SchemaEntry> {
        self.store
            .lookup(&normalize_id(key))
            .and_then(|id| self.store.get(id))
    }

    pub fn entry(&self, id: EntryId) -> Option<&SchemaEntry> {
        self.store.get(id)
    }

    /// Documents `document` refers to that the registry doesn't know
    pub(crate) fn missing_documents(&self, document: &Value) -> Result<Vec<String>> {
        let id = schema_id(document)?;
        let index = index_local_refs(document, &id, &self.vocabulary)?;
        let mut missing: Vec<String> = index
            .ref_targets
            .iter()
            .map(|target| split_fragment(target).0.to_string())
            .filter(|doc| {
                !doc.is_empty()
                    && *doc != id
                    && !index.local_refs.contains_key(doc)
                    && self.store.lookup(doc).is_none()
            })
            .collect();
        missing.sort();
        missing.dedup();
        Ok(missing)
    }

    /// Number of cached documents
    pub fn cache_len(&self) -> usize {
        self.store.cache.len()
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Remove schemas, evicting their cache entries, validator slots and
    /// fragments. Returns how many entries were removed.
    pub fn remove_schema(&mut self, target: RemoveTarget) -> usize {
        let victims: Vec<EntryId> = match target {
            RemoveTarget::All => self
                .store
                .live()
                .filter(|id| {
                    self.store
                        .get(*id)
                        .map(|e| !e.is_meta && !e.is_fragment())
                        .unwrap_or(false)
                })
                .collect(),
            RemoveTarget::Key(key) => self.store.lookup(&normalize_id(&key)).into_iter().collect(),
            RemoveTarget::Pattern(pattern) => {
                let mut ids: Vec<EntryId> = self
                    .store
                    .schemas
                    .iter()
                    .chain(self.store.refs.iter())
                    .filter(|(key, _)| pattern.is_match(key))
                    .map(|(_, id)| *id)
                    .filter(|id| self.store.get(*id).map(|e| !e.is_meta).unwrap_or(false))
                    .collect();
                ids.sort();
                ids.dedup();
                ids
            }
            RemoveTarget::Document(document) => {
                let document = Arc::new(document);
                let mut ids: Vec<EntryId> = self
                    .store
                    .cache
                    .get(&self.options.serialize.key(&document))
                    .into_iter()
                    .collect();
                if let Ok(id) = schema_id(&document) {
                    if !id.is_empty() {
                        ids.extend(self.store.lookup(&id));
                    }
                }
                ids.sort();
                ids.dedup();
                ids
            }
        };

        let removed = victims
            .into_iter()
            .filter(|id| self.store.remove(*id).is_some())
            .count();
        tracing::debug!(removed, "schemas removed");
        removed
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Check a schema document against its meta-schema.
    ///
    /// With `throw`, an invalid document fails with `SchemaInvalid` (or is
    /// only logged when `validate_schema` is `log`). Without it the result
    /// is reported as `false` and the errors kept for [`Self::errors`].
    pub fn validate_schema(&mut self, document: &Value, throw: bool) -> Result<bool> {
        let meta = document
            .get("$schema")
            .and_then(Value::as_str)
            .map(normalize_id)
            .or_else(|| self.options.default_meta.as_deref().map(normalize_id))
            .or_else(|| self.default_meta.clone());
        let entry = meta.as_deref().and_then(|m| self.store.lookup(m));
        let Some(entry) = entry else {
            return self.missing_meta(meta.as_deref().unwrap_or(""), throw);
        };
        self.validate_against(entry, document, throw)
    }

    fn validate_against(&mut self, meta: EntryId, document: &Value, throw: bool) -> Result<bool> {
        let validator = self.compile_entry(meta)?;
        match validator.validate(document) {
            Ok(()) => {
                self.errors = None;
                Ok(true)
            }
            Err(errors) => {
                self.errors = Some(errors.clone());
                if !throw {
                    return Ok(false);
                }
                match self.options.validate_schema {
                    ValidateSchema::Log => {
                        tracing::warn!(%errors, "schema is invalid");
                        Ok(false)
                    }
                    _ => Err(SchemaError::SchemaInvalid { errors }),
                }
            }
        }
    }

    fn missing_meta(&mut self, meta: &str, throw: bool) -> Result<bool> {
        match self.options.missing_meta {
            MissingMetaPolicy::Permissive => {
                tracing::warn!(meta_schema = %meta, "meta-schema not available, schema not validated");
                Ok(true)
            }
            MissingMetaPolicy::Strict => {
                let errors = ValidationErrors::new(vec![ValidationError {
                    keyword: "$schema".to_string(),
                    data_path: String::new(),
                    schema_path: "#/$schema".to_string(),
                    message: format!("can't resolve meta-schema {meta:?}"),
                    params: json!({ "metaSchema": meta }),
                }]);
                self.errors = Some(errors.clone());
                if throw {
                    Err(SchemaError::SchemaInvalid { errors })
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Validate data against the schema registered under `key`
    pub fn validate(&mut self, key: &str, data: &Value) -> Result<bool> {
        let validator = self.get_schema(key)?.ok_or_else(|| SchemaError::MissingReference {
            reference: key.to_string(),
            schema: split_fragment(key).0.to_string(),
        })?;
        Ok(self.record(validator.validate(data)))
    }

    /// Compile `schema` (or reuse its cached entry) and validate data
    pub fn validate_value(&mut self, schema: impl Into<Arc<Value>>, data: &Value) -> Result<bool> {
        let validator = self.compile(schema)?;
        Ok(self.record(validator.validate(data)))
    }

    fn record(&mut self, result: std::result::Result<(), ValidationErrors>) -> bool {
        match result {
            Ok(()) => {
                self.errors = None;
                true
            }
            Err(errors) => {
                self.errors = Some(errors);
                false
            }
        }
    }

    /// Errors of the last validation through the registry
    pub fn errors(&self) -> Option<&ValidationErrors> {
        self.errors.as_ref()
    }

    pub fn errors_text(&self) -> String {
        match &self.errors {
            Some(errors) => errors.text("data"),
            None => "No errors".to_string(),
        }
    }

    // =========================================================================
    // Keywords and formats
    // =========================================================================

    /// Add (or overwrite) a keyword. Its `meta_schema`, if any, is
    /// compiled here and checked against every use of the keyword.
    pub fn add_keyword(&mut self, definition: KeywordDefinition) -> Result<()> {
        let name = definition.name.clone();
        let value_validator = match &definition.meta_schema {
            Some(schema) => Some(self.compile_keyword_schema(schema)?),
            None => None,
        };
        self.vocabulary.add_keyword(definition)?;
        if let Some(validator) = value_validator {
            self.vocabulary.set_value_validator(&name, validator);
        }
        Ok(())
    }

    pub fn add_vocabulary(&mut self, vocabulary: Vocabulary) -> Result<()> {
        let mut value_validators = Vec::new();
        for definition in &vocabulary.keywords {
            if let Some(schema) = &definition.meta_schema {
                value_validators.push((definition.name.clone(), self.compile_keyword_schema(schema)?));
            }
        }
        self.vocabulary.add_vocabulary(vocabulary)?;
        for (name, validator) in value_validators {
            self.vocabulary.set_value_validator(&name, validator);
        }
        Ok(())
    }

    /// Keyword value schemas are kept as meta entries so removing user
    /// schemas leaves them in place
    fn compile_keyword_schema(&mut self, schema: &Value) -> Result<Validator> {
        let document = Arc::new(schema.clone());
        let id = schema_id(&document)?;
        let entry = self.add_entry(document, id, true, true, false)?;
        self.compile_entry(entry)
    }

    pub fn remove_keyword(&mut self, name: &str) -> Result<Option<Arc<KeywordDefinition>>> {
        self.vocabulary.remove_keyword(name)
    }

    pub fn remove_vocabulary(&mut self, name: &str) -> Result<bool> {
        self.vocabulary.remove_vocabulary(name)
    }

    pub fn get_keyword(&self, name: &str) -> Option<&Arc<KeywordDefinition>> {
        self.vocabulary.get_keyword(name)
    }

    pub fn add_format(&mut self, name: impl Into<String>, format: Format) {
        self.formats.add(name, format);
    }
}

/// Normalized `$id` of a document, rejecting values that can't be schemas
fn schema_id(document: &Value) -> Result<String> {
    match document {
        Value::Bool(_) => Ok(String::new()),
        Value::Object(map) => match map.get("$id") {
            None => Ok(String::new()),
            Some(Value::String(id)) => Ok(normalize_id(id)),
            Some(_) => Err(SchemaError::MalformedSchema("$id must be a string".to_string())),
        },
        _ => Err(SchemaError::MalformedSchema(
            "schema should be an object or a boolean".to_string(),
        )),
    }
}
