//! Schema compiler
//!
//! Turns the document of a [`SchemaEntry`] into a [`Node`] tree stored in
//! the entry's validator slot. Each entry moves through
//! `NotStarted -> InProgress -> Done`; a `$ref` always compiles to a slot
//! proxy, so reaching an entry that is still `InProgress` (a recursive
//! schema) needs no special casing beyond not re-entering it.
//!
//! A top-level compile is one transaction: if it fails, every entry it
//! started goes back to `NotStarted` and every fragment it materialized is
//! dropped, so a retry (for instance after the loader fetched a missing
//! document) starts from a clean slate.

use serde_json::{Map, Value};
use std::sync::Arc;

use crate::config::{ExtendRefs, Options, UnknownKeywords};
use crate::error::{Result, SchemaError};
use crate::formats::{Format, FormatRegistry};
use crate::resolver::{self, child_pointer, resolve_url, split_fragment, Resolved};
use crate::schema::{CompilationState, EntryId, SchemaEntry, SchemaStore};
use crate::validator::{check, Node, Rule, RuleKind, Subschema};
use crate::vocabulary::{KeywordBehavior, KeywordDefinition, VocabularyRegistry};

/// Where a subschema sits while it is compiled
#[derive(Debug, Clone)]
struct NodeScope {
    /// Entry whose document contains the subschema
    entry: EntryId,
    /// Base URI in effect, before the subschema's own `$id`
    base: String,
    schema_path: String,
    /// False for the root of an entry, whose `$id` is already its base
    apply_id: bool,
}

pub(crate) struct Compiler<'r> {
    store: &'r mut SchemaStore,
    vocabulary: &'r VocabularyRegistry,
    formats: &'r FormatRegistry,
    options: &'r Options,
    meta_options: &'r Options,
    /// Number of meta entries on the compile stack
    meta_depth: usize,
    started: Vec<EntryId>,
    created: Vec<EntryId>,
}

impl<'r> Compiler<'r> {
    pub fn new(
        store: &'r mut SchemaStore,
        vocabulary: &'r VocabularyRegistry,
        formats: &'r FormatRegistry,
        options: &'r Options,
        meta_options: &'r Options,
    ) -> Self {
        Self {
            store,
            vocabulary,
            formats,
            options,
            meta_options,
            meta_depth: 0,
            started: Vec::new(),
            created: Vec::new(),
        }
    }

    /// Compile `id` and everything it references, or nothing at all
    pub fn compile(mut self, id: EntryId) -> Result<()> {
        match self.compile_entry(id) {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::debug!(entry = %id, error = %err, "compilation failed, rolling back");
                self.rollback(id);
                Err(err)
            }
        }
    }

    fn rollback(&mut self, failed: EntryId) {
        for id in self.created.drain(..).rev() {
            self.store.remove(id);
        }
        for id in self.started.drain(..) {
            self.store.table.clear(id);
            if let Some(entry) = self.store.get_mut(id) {
                entry.refs.clear();
                entry.state = if id == failed {
                    CompilationState::Failed
                } else {
                    CompilationState::NotStarted
                };
            }
        }
    }

    /// Options governing the schema currently being compiled
    fn options(&self) -> &'r Options {
        if self.meta_depth > 0 {
            self.meta_options
        } else {
            self.options
        }
    }

    fn compile_entry(&mut self, id: EntryId) -> Result<()> {
        let entry = self.store.get_mut(id).ok_or_else(|| {
            SchemaError::MalformedSchema(format!("schema entry {id} no longer exists"))
        })?;
        match entry.state {
            CompilationState::Done | CompilationState::InProgress => return Ok(()),
            CompilationState::NotStarted | CompilationState::Failed => {}
        }
        entry.state = CompilationState::InProgress;
        entry.refs.clear();
        let document = entry.document.clone();
        let scope = NodeScope {
            entry: id,
            base: entry.id.clone(),
            schema_path: "#".to_string(),
            apply_id: entry.is_fragment(),
        };
        let is_meta = entry.is_meta;
        self.started.push(id);

        if is_meta {
            self.meta_depth += 1;
        }
        let result = self.compile_node(&document, &scope);
        if is_meta {
            self.meta_depth -= 1;
        }
        let node = result?;

        self.store.table.set(id, Arc::new(node));
        if let Some(entry) = self.store.get_mut(id) {
            entry.state = CompilationState::Done;
        }
        tracing::debug!(entry = %id, meta = is_meta, "schema compiled");
        Ok(())
    }

    fn compile_node(&mut self, schema: &Value, scope: &NodeScope) -> Result<Node> {
        let map = match schema {
            Value::Bool(b) => return Ok(Node::Bool(*b)),
            Value::Object(map) => map,
            _ => {
                return Err(SchemaError::MalformedSchema(format!(
                    "schema at {} must be an object or a boolean",
                    scope.schema_path
                )))
            }
        };

        let mut base = scope.base.clone();
        if scope.apply_id {
            if let Some(id) = map.get("$id") {
                let id = id.as_str().ok_or_else(|| {
                    SchemaError::MalformedSchema(format!("$id at {} must be a string", scope.schema_path))
                })?;
                base = split_fragment(&resolve_url(&base, id)).0.to_string();
            }
        }
        let scope = NodeScope {
            base,
            apply_id: true,
            ..scope.clone()
        };

        let mut rules = Vec::new();
        if let Some(reference) = map.get("$ref") {
            let node = self.compile_ref(reference, &scope)?;
            let siblings = map.keys().any(|k| self.is_rule(k));
            match self.options().extend_refs {
                ExtendRefs::Ignore => {
                    if siblings {
                        tracing::warn!(
                            schema_path = %scope.schema_path,
                            "$ref: keywords ignored in schema at path"
                        );
                    }
                    return Ok(node);
                }
                ExtendRefs::Fail if siblings => {
                    return Err(SchemaError::compilation(
                        "$ref",
                        format!(
                            "validation keywords used next to $ref at {} (see option extend_refs)",
                            scope.schema_path
                        ),
                    ));
                }
                ExtendRefs::Fail => return Ok(node),
                ExtendRefs::Apply => {
                    let target = Subschema(Arc::new(node));
                    rules.push(Rule {
                        keyword: Arc::from("$ref"),
                        schema_path: Arc::from(child_pointer(&scope.schema_path, "$ref").as_str()),
                        types: None,
                        kind: RuleKind::Check(check(move |data, s| s.validate(&target, data))),
                    });
                }
            }
        }

        self.check_unknown_keywords(map, &scope)?;

        let vocabulary = self.vocabulary;
        for def in vocabulary.ordered() {
            if def.name == "$ref" {
                continue;
            }
            let Some(value) = map.get(&def.name) else {
                continue;
            };
            if let Some(rule) = self.compile_keyword(def, value, map, &scope)? {
                rules.push(rule);
            }
        }

        if rules.is_empty() {
            Ok(Node::Bool(true))
        } else {
            Ok(Node::Rules(rules))
        }
    }

    /// True when `keyword` produces a rule (used for `$ref` siblings)
    fn is_rule(&self, keyword: &str) -> bool {
        keyword != "$ref"
            && self
                .vocabulary
                .get_keyword(keyword)
                .map(|def| !matches!(def.behavior, KeywordBehavior::Annotation))
                .unwrap_or(false)
    }

    fn check_unknown_keywords(&self, map: &Map<String, Value>, scope: &NodeScope) -> Result<()> {
        let policy = self.options().unknown_keywords;
        if policy == UnknownKeywords::Ignore {
            return Ok(());
        }
        for keyword in map.keys().filter(|k| !self.vocabulary.contains(k)) {
            match policy {
                UnknownKeywords::Fail => {
                    return Err(SchemaError::compilation(
                        keyword.as_str(),
                        format!("unknown keyword at {}", scope.schema_path),
                    ))
                }
                _ => tracing::warn!(%keyword, schema_path = %scope.schema_path, "unknown keyword"),
            }
        }
        Ok(())
    }

    fn compile_keyword(
        &mut self,
        def: &KeywordDefinition,
        value: &Value,
        parent: &Map<String, Value>,
        scope: &NodeScope,
    ) -> Result<Option<Rule>> {
        if let Some(missing) = def.requires.iter().find(|r| !parent.contains_key(*r)) {
            return Err(SchemaError::compilation(
                def.name.as_str(),
                format!("parent schema must have all required keywords: {missing}"),
            ));
        }
        if let Some(validator) = self.vocabulary.value_validator(&def.name) {
            if let Err(errors) = validator.validate(value) {
                return Err(SchemaError::compilation(
                    def.name.as_str(),
                    format!("keyword value is invalid: {errors}"),
                ));
            }
        }

        let schema_path = child_pointer(&scope.schema_path, &def.name);
        let kind = match &def.behavior {
            KeywordBehavior::Annotation => return Ok(None),
            KeywordBehavior::Validate(validate) => {
                let validate = validate.clone();
                let value = value.clone();
                RuleKind::Check(check(move |data, _| validate(&value, data)))
            }
            KeywordBehavior::Compile(compiler) => {
                let mut ctx = KeywordContext {
                    compiler: self,
                    keyword: &def.name,
                    value,
                    parent,
                    parent_path: &scope.schema_path,
                    entry: scope.entry,
                    base: &scope.base,
                    schema_path: &schema_path,
                };
                RuleKind::Check(compiler.compile(&mut ctx)?)
            }
            KeywordBehavior::Macro(expand) => {
                let expanded = expand(value, parent);
                let node = self.compile_node(
                    &expanded,
                    &NodeScope {
                        schema_path: schema_path.clone(),
                        ..scope.clone()
                    },
                )?;
                let target = Subschema(Arc::new(node));
                RuleKind::Check(check(move |data, s| s.validate(&target, data)))
            }
            KeywordBehavior::Async(check) => {
                if !self.root_is_async(scope.entry) {
                    return Err(SchemaError::compilation(
                        def.name.as_str(),
                        "async keyword in sync schema",
                    ));
                }
                RuleKind::Deferred {
                    check: check.clone(),
                    schema: Arc::new(value.clone()),
                }
            }
        };

        Ok(Some(Rule {
            keyword: Arc::from(def.name.as_str()),
            schema_path: Arc::from(schema_path.as_str()),
            types: def.types.clone(),
            kind,
        }))
    }

    fn compile_ref(&mut self, reference: &Value, scope: &NodeScope) -> Result<Node> {
        let reference = reference.as_str().ok_or_else(|| {
            SchemaError::MalformedSchema(format!("$ref at {} must be a string", scope.schema_path))
        })?;
        let (target, absolute) = self.resolve_ref(scope.entry, &scope.base, reference)?;
        self.compile_entry(target)?;

        if self.root_is_async(target) && !self.root_is_async(scope.entry) {
            return Err(SchemaError::compilation(
                "$ref",
                format!("synchronous schema can't reference asynchronous schema {absolute}"),
            ));
        }
        Ok(Node::Ref {
            target,
            reference: Arc::from(absolute.as_str()),
        })
    }

    /// Resolve a reference made from `from`, memoizing the target entry
    fn resolve_ref(&mut self, from: EntryId, base: &str, reference: &str) -> Result<(EntryId, String)> {
        let absolute = resolve_url(base, reference);
        let known = self
            .store
            .get(from)
            .and_then(|e| e.refs.get(&absolute))
            .copied()
            .filter(|id| self.store.get(*id).is_some());
        if let Some(target) = known {
            return Ok((target, absolute));
        }

        let target = match resolver::resolve(self.store, from, &absolute) {
            Resolved::Entry(id) => id,
            Resolved::Fragment {
                root,
                base,
                pointer,
                schema,
            } => {
                let (id, created) = self.store.fragment(root, base, pointer, schema);
                if created {
                    self.created.push(id);
                }
                id
            }
            Resolved::Missing { reference, schema } => {
                return Err(SchemaError::MissingReference { reference, schema })
            }
        };
        if let Some(entry) = self.store.get_mut(from) {
            entry.refs.insert(absolute.clone(), target);
        }
        Ok((target, absolute))
    }

    fn root_is_async(&self, id: EntryId) -> bool {
        self.store
            .get(id)
            .and_then(|e| self.store.get(e.root))
            .map(SchemaEntry::is_async)
            .unwrap_or(false)
    }
}

// =============================================================================
// Keyword compilation context
// =============================================================================

/// What a [`KeywordCompiler`](crate::vocabulary::KeywordCompiler) sees of
/// the schema being compiled
pub struct KeywordContext<'c, 'r> {
    compiler: &'c mut Compiler<'r>,
    keyword: &'c str,
    value: &'c Value,
    parent: &'c Map<String, Value>,
    parent_path: &'c str,
    entry: EntryId,
    base: &'c str,
    schema_path: &'c str,
}

impl<'c, 'r> KeywordContext<'c, 'r> {
    pub fn keyword(&self) -> &'c str {
        self.keyword
    }

    /// The keyword's value
    pub fn value(&self) -> &'c Value {
        self.value
    }

    /// The schema object containing the keyword
    pub fn parent(&self) -> &'c Map<String, Value> {
        self.parent
    }

    pub fn schema_path(&self) -> &'c str {
        self.schema_path
    }

    /// Options in effect; the restricted meta option set while compiling
    /// meta-schemas
    pub fn options(&self) -> &'r Options {
        self.compiler.options()
    }

    /// Compile a nested schema found at `path` below this keyword
    pub fn subschema(&mut self, schema: &Value, path: &[&str]) -> Result<Subschema> {
        let schema_path = path
            .iter()
            .fold(self.schema_path.to_string(), |acc, segment| child_pointer(&acc, segment));
        let scope = NodeScope {
            entry: self.entry,
            base: self.base.to_string(),
            schema_path,
            apply_id: true,
        };
        let node = self.compiler.compile_node(schema, &scope)?;
        Ok(Subschema(Arc::new(node)))
    }

    /// Compile the sibling keyword `keyword` of the parent schema, if present
    pub fn sibling_subschema(&mut self, keyword: &str) -> Result<Option<Subschema>> {
        let Some(schema) = self.parent.get(keyword) else {
            return Ok(None);
        };
        let scope = NodeScope {
            entry: self.entry,
            base: self.base.to_string(),
            schema_path: child_pointer(self.parent_path, keyword),
            apply_id: true,
        };
        let node = self.compiler.compile_node(schema, &scope)?;
        Ok(Some(Subschema(Arc::new(node))))
    }

    pub fn format(&self, name: &str) -> Option<Format> {
        self.compiler.formats.get(name).cloned()
    }

    /// `CompilationFailure` for this keyword
    pub fn error(&self, message: impl Into<String>) -> SchemaError {
        SchemaError::compilation(self.keyword, message)
    }
}
