//! Compiled validators
//!
//! A compiled schema is a tree of [`Node`]s. References between schemas are
//! not pointers into other trees but slot numbers into the shared
//! [`ValidatorTable`], so recursive and mutually recursive schemas compile
//! into acyclic data and a reference can be taken before its target has
//! finished compiling.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

use crate::schema::EntryId;
use crate::vocabulary::{AsyncKeyword, JsonType};

/// Consecutive `$ref` hops at one data location beyond this fail instead
/// of overflowing the stack
pub const MAX_REF_DEPTH: usize = 512;

// =============================================================================
// Error records
// =============================================================================

/// One reason a value failed validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub keyword: String,
    /// JSON pointer to the failing part of the data ("" for the root)
    pub data_path: String,
    /// Location of the failing keyword in the schema
    pub schema_path: String,
    pub message: String,
    pub params: Value,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "data{} {}", self.data_path, self.message)
    }
}

/// Ordered errors from one validation run
#[derive(Debug, Clone, Default, PartialEq, Error, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidationErrors(Vec<ValidationError>);

impl ValidationErrors {
    pub fn new(errors: Vec<ValidationError>) -> Self {
        Self(errors)
    }

    pub fn into_vec(self) -> Vec<ValidationError> {
        self.0
    }

    /// Render as "data/x should be number, data/y ..." with a custom
    /// name for the data root
    pub fn text(&self, data_var: &str) -> String {
        self.0
            .iter()
            .map(|e| format!("{}{} {}", data_var, e.data_path, e.message))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("No errors")
        } else {
            f.write_str(&self.text("data"))
        }
    }
}

impl Deref for ValidationErrors {
    type Target = [ValidationError];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl IntoIterator for ValidationErrors {
    type Item = ValidationError;
    type IntoIter = std::vec::IntoIter<ValidationError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

// =============================================================================
// Compiled nodes
// =============================================================================

/// Validation logic produced by a keyword compiler
pub trait Check: Send + Sync {
    /// Return false when `data` fails. Detailed errors go through
    /// [`Scope::report`]; a failing check that reports nothing gets a
    /// generic error for its keyword.
    fn check(&self, data: &Value, scope: &mut Scope<'_>) -> bool;
}

impl<F> Check for F
where
    F: Fn(&Value, &mut Scope<'_>) -> bool + Send + Sync,
{
    fn check(&self, data: &Value, scope: &mut Scope<'_>) -> bool {
        self(data, scope)
    }
}

/// Box a closure as a [`Check`]
pub fn check<F>(f: F) -> Box<dyn Check>
where
    F: Fn(&Value, &mut Scope<'_>) -> bool + Send + Sync + 'static,
{
    Box::new(f)
}

pub(crate) enum Node {
    Bool(bool),
    /// Proxy to whatever the target slot holds at call time
    Ref {
        target: EntryId,
        reference: Arc<str>,
    },
    Rules(Vec<Rule>),
}

pub(crate) struct Rule {
    pub keyword: Arc<str>,
    pub schema_path: Arc<str>,
    pub types: Option<Vec<JsonType>>,
    pub kind: RuleKind,
}

pub(crate) enum RuleKind {
    Check(Box<dyn Check>),
    Deferred {
        check: Arc<dyn AsyncKeyword>,
        schema: Arc<Value>,
    },
}

/// Handle to a compiled nested schema, obtained from
/// `KeywordContext::subschema` and applied through [`Scope`]
#[derive(Clone)]
pub struct Subschema(pub(crate) Arc<Node>);

impl Subschema {
    /// True for the `true` schema, which needs no evaluation
    pub fn is_trivially_valid(&self) -> bool {
        matches!(*self.0, Node::Bool(true))
    }
}

impl fmt::Debug for Subschema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            Node::Bool(b) => write!(f, "Subschema({b})"),
            Node::Ref { reference, .. } => write!(f, "Subschema($ref {reference})"),
            Node::Rules(rules) => write!(f, "Subschema({} rules)", rules.len()),
        }
    }
}

// =============================================================================
// Validator table
// =============================================================================

type Slots = Vec<Option<Arc<Node>>>;

/// Compiled root node of every entry, indexed by [`EntryId`]
#[derive(Clone, Default)]
pub(crate) struct ValidatorTable(Arc<RwLock<Slots>>);

impl ValidatorTable {
    pub fn read(&self) -> RwLockReadGuard<'_, Slots> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Slots> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, id: EntryId, node: Arc<Node>) {
        let mut slots = self.write();
        if slots.len() <= id.0 {
            slots.resize(id.0 + 1, None);
        }
        slots[id.0] = Some(node);
    }

    pub fn clear(&self, id: EntryId) {
        if let Some(slot) = self.write().get_mut(id.0) {
            *slot = None;
        }
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ValidatorTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.read();
        let compiled = slots.iter().filter(|s| s.is_some()).count();
        write!(f, "ValidatorTable({compiled}/{})", slots.len())
    }
}

// =============================================================================
// Validation scope
// =============================================================================

/// Segment of a data path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathChunk {
    Key(String),
    Index(usize),
}

impl From<&str> for PathChunk {
    fn from(key: &str) -> Self {
        Self::Key(key.to_string())
    }
}

impl From<&String> for PathChunk {
    fn from(key: &String) -> Self {
        Self::Key(key.clone())
    }
}

impl From<usize> for PathChunk {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

/// Position in the error and deferred-check lists, for discarding the
/// output of a tentative evaluation
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint {
    errors: usize,
    deferred: usize,
}

pub(crate) struct DeferredCheck {
    keyword: Arc<str>,
    schema_path: Arc<str>,
    data_path: String,
    check: Arc<dyn AsyncKeyword>,
    schema: Arc<Value>,
    data: Value,
}

impl DeferredCheck {
    fn into_error(self) -> ValidationError {
        ValidationError {
            message: format!("should pass \"{}\" keyword validation", self.keyword),
            params: json!({ "keyword": &*self.keyword }),
            keyword: self.keyword.to_string(),
            data_path: self.data_path,
            schema_path: self.schema_path.to_string(),
        }
    }
}

/// State of one validation call: data path, collected errors, deferred
/// async checks, and read access to the compiled slots
pub struct Scope<'v> {
    table: &'v [Option<Arc<Node>>],
    path: Vec<PathChunk>,
    errors: Vec<ValidationError>,
    deferred: Vec<DeferredCheck>,
    all_errors: bool,
    current: Option<(Arc<str>, Arc<str>)>,
    /// `$ref` hops taken since the data path last changed
    depth: usize,
}

impl<'v> Scope<'v> {
    fn new(table: &'v [Option<Arc<Node>>], all_errors: bool) -> Self {
        Self {
            table,
            path: Vec::new(),
            errors: Vec::new(),
            deferred: Vec::new(),
            all_errors,
            current: None,
            depth: 0,
        }
    }

    /// Whether checks should keep going after the first failure
    pub fn all_errors(&self) -> bool {
        self.all_errors
    }

    /// JSON pointer of the value currently being validated
    pub fn data_path(&self) -> String {
        let mut out = String::new();
        for chunk in &self.path {
            out.push('/');
            match chunk {
                PathChunk::Key(key) => out.push_str(&key.replace('~', "~0").replace('/', "~1")),
                PathChunk::Index(index) => out.push_str(&index.to_string()),
            }
        }
        out
    }

    /// Record an error for the keyword being evaluated
    pub fn report(&mut self, message: impl Into<String>, params: Value) {
        let (keyword, schema_path) = match &self.current {
            Some((keyword, schema_path)) => (keyword.to_string(), schema_path.to_string()),
            None => (String::new(), "#".to_string()),
        };
        self.push_error(keyword, schema_path, message.into(), params);
    }

    fn push_error(&mut self, keyword: String, schema_path: String, message: String, params: Value) {
        let data_path = self.data_path();
        self.errors.push(ValidationError {
            keyword,
            data_path,
            schema_path,
            message,
            params,
        });
    }

    /// Apply a subschema to `data` at the current location
    pub fn validate(&mut self, schema: &Subschema, data: &Value) -> bool {
        self.run(&schema.0, data)
    }

    /// Apply a subschema to a child value, extending the data path
    pub fn validate_child(
        &mut self,
        schema: &Subschema,
        data: &Value,
        chunk: impl Into<PathChunk>,
    ) -> bool {
        self.descend(chunk.into(), |scope| scope.run(&schema.0, data))
    }

    /// Evaluate a subschema without keeping any errors it produces
    pub fn test(&mut self, schema: &Subschema, data: &Value) -> bool {
        let checkpoint = self.checkpoint();
        let valid = self.run(&schema.0, data);
        self.rollback(checkpoint);
        valid
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            errors: self.errors.len(),
            deferred: self.deferred.len(),
        }
    }

    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        self.errors.truncate(checkpoint.errors);
        self.deferred.truncate(checkpoint.deferred);
    }

    /// Run a closure with `chunk` appended to the data path
    pub fn at<T>(&mut self, chunk: impl Into<PathChunk>, f: impl FnOnce(&mut Self) -> T) -> T {
        self.descend(chunk.into(), f)
    }

    fn descend<T>(&mut self, chunk: PathChunk, f: impl FnOnce(&mut Self) -> T) -> T {
        self.path.push(chunk);
        let depth = std::mem::replace(&mut self.depth, 0);
        let out = f(self);
        self.depth = depth;
        self.path.pop();
        out
    }

    fn run(&mut self, node: &Node, data: &Value) -> bool {
        match node {
            Node::Bool(true) => true,
            Node::Bool(false) => {
                let schema_path = self
                    .current
                    .as_ref()
                    .map(|(_, path)| path.to_string())
                    .unwrap_or_else(|| "#".to_string());
                self.push_error(
                    "false schema".to_string(),
                    schema_path,
                    "boolean schema is false".to_string(),
                    json!({}),
                );
                false
            }
            Node::Ref { target, reference } => self.follow(*target, reference, data),
            Node::Rules(rules) => self.apply_rules(rules, data),
        }
    }

    fn follow(&mut self, target: EntryId, reference: &str, data: &Value) -> bool {
        if self.depth >= MAX_REF_DEPTH {
            self.push_error(
                "$ref".to_string(),
                "#".to_string(),
                format!("maximum reference depth exceeded at {reference}"),
                json!({ "ref": reference }),
            );
            return false;
        }
        let table = self.table;
        match table.get(target.0).and_then(Option::as_ref) {
            Some(node) => {
                self.depth += 1;
                let valid = self.run(node, data);
                self.depth -= 1;
                valid
            }
            None => {
                self.push_error(
                    "$ref".to_string(),
                    "#".to_string(),
                    format!("can't resolve reference {reference}"),
                    json!({ "ref": reference }),
                );
                false
            }
        }
    }

    fn apply_rules(&mut self, rules: &[Rule], data: &Value) -> bool {
        let mut valid = true;
        for rule in rules {
            if let Some(types) = &rule.types {
                if !types.iter().any(|t| t.matches(data)) {
                    continue;
                }
            }

            let saved = self
                .current
                .replace((rule.keyword.clone(), rule.schema_path.clone()));
            let before = self.errors.len();
            let ok = match &rule.kind {
                RuleKind::Check(check) => check.check(data, self),
                RuleKind::Deferred { check, schema } => {
                    self.deferred.push(DeferredCheck {
                        keyword: rule.keyword.clone(),
                        schema_path: rule.schema_path.clone(),
                        data_path: self.data_path(),
                        check: check.clone(),
                        schema: schema.clone(),
                        data: data.clone(),
                    });
                    true
                }
            };
            if !ok && self.errors.len() == before {
                self.report(
                    format!("should pass \"{}\" keyword validation", rule.keyword),
                    json!({ "keyword": &*rule.keyword }),
                );
            }
            self.current = saved;

            if !ok {
                valid = false;
                if !self.all_errors {
                    break;
                }
            }
        }
        valid
    }
}

// =============================================================================
// Validator
// =============================================================================

/// Result of [`Validator::call`]
pub enum Outcome {
    Ready(Result<(), ValidationErrors>),
    /// Asynchronous schemas resolve to the validated data
    Deferred(BoxFuture<'static, Result<Value, ValidationErrors>>),
}

/// Executable validating function for one compiled schema entry.
///
/// Cheap to clone; two validators are equal when they run the same entry
/// of the same registry.
#[derive(Clone)]
pub struct Validator {
    entry: EntryId,
    table: ValidatorTable,
    is_async: bool,
    all_errors: bool,
}

impl Validator {
    pub(crate) fn new(entry: EntryId, table: ValidatorTable, is_async: bool, all_errors: bool) -> Self {
        Self {
            entry,
            table,
            is_async,
            all_errors,
        }
    }

    pub fn entry(&self) -> EntryId {
        self.entry
    }

    /// True for schemas declaring `"$async": true`
    pub fn is_async(&self) -> bool {
        self.is_async
    }

    /// Validate synchronously. Asynchronous schemas always fail here;
    /// use [`Validator::validate_async`] or [`Validator::call`].
    pub fn validate(&self, data: &Value) -> Result<(), ValidationErrors> {
        if self.is_async {
            return Err(ValidationErrors(vec![ValidationError {
                keyword: "$async".to_string(),
                data_path: String::new(),
                schema_path: "#/$async".to_string(),
                message: "asynchronous schema must be validated with validate_async".to_string(),
                params: json!({}),
            }]));
        }
        let (errors, _) = self.run(data);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(errors))
        }
    }

    pub fn is_valid(&self, data: &Value) -> bool {
        self.validate(data).is_ok()
    }

    /// Validate, yielding a deferred outcome for asynchronous schemas
    pub fn call(&self, data: &Value) -> Outcome {
        if self.is_async {
            Outcome::Deferred(self.validate_async(data.clone()))
        } else {
            Outcome::Ready(self.validate(data))
        }
    }

    /// Run synchronous checks now and asynchronous keyword checks when the
    /// returned future is polled. Resolves to the data on success.
    pub fn validate_async(&self, data: Value) -> BoxFuture<'static, Result<Value, ValidationErrors>> {
        let (mut errors, deferred) = self.run(&data);
        let all_errors = self.all_errors;
        async move {
            if all_errors || errors.is_empty() {
                for check in deferred {
                    if !check.check.validate(&check.schema, &check.data).await {
                        errors.push(check.into_error());
                        if !all_errors {
                            break;
                        }
                    }
                }
            }
            if errors.is_empty() {
                Ok(data)
            } else {
                Err(ValidationErrors(errors))
            }
        }
        .boxed()
    }

    fn run(&self, data: &Value) -> (Vec<ValidationError>, Vec<DeferredCheck>) {
        let slots = self.table.read();
        let mut scope = Scope::new(&slots, self.all_errors);
        scope.follow(self.entry, "#", data);
        (scope.errors, scope.deferred)
    }
}

impl PartialEq for Validator {
    fn eq(&self, other: &Self) -> bool {
        self.entry == other.entry && self.table.ptr_eq(&other.table)
    }
}

impl Eq for Validator {}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validator")
            .field("entry", &self.entry)
            .field("is_async", &self.is_async)
            .finish()
    }
}
