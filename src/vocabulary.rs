//! Keyword definitions and the vocabulary registry
//!
//! The registry only stores definitions and their evaluation order; the
//! compiler asks it which rules exist and runs their behaviors. Ordering
//! constraints (`before`/`after`) are resolved into one stable order each
//! time the keyword set changes, never during compilation.

use async_trait::async_trait;
use petgraph::algo::kosaraju_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::compiler::KeywordContext;
use crate::error::{Result, SchemaError};
use crate::validator::{Check, Validator};

// =============================================================================
// JSON types
// =============================================================================

/// JSON value kinds a keyword can apply to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JsonType {
    Null,
    Boolean,
    Object,
    Array,
    Number,
    Integer,
    String,
}

impl JsonType {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "null" => Some(Self::Null),
            "boolean" => Some(Self::Boolean),
            "object" => Some(Self::Object),
            "array" => Some(Self::Array),
            "number" => Some(Self::Number),
            "integer" => Some(Self::Integer),
            "string" => Some(Self::String),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::String => "string",
        }
    }

    /// Integral numbers match both `Number` and `Integer`
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Null, Value::Null) => true,
            (Self::Boolean, Value::Bool(_)) => true,
            (Self::Object, Value::Object(_)) => true,
            (Self::Array, Value::Array(_)) => true,
            (Self::Number, Value::Number(_)) => true,
            (Self::Integer, Value::Number(n)) => {
                n.is_i64() || n.is_u64() || n.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false)
            }
            (Self::String, Value::String(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JsonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Keyword behaviors
// =============================================================================

/// Where nested schemas sit inside a keyword's value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubschemaKind {
    /// The value is data, never traversed
    #[default]
    None,
    /// The value is a schema
    Schema,
    /// The value is an array of schemas
    Array,
    /// The value is an object whose values are schemas (non-schema values
    /// such as string lists are skipped)
    Map,
    /// A schema or an array of schemas (`items`)
    SchemaOrArray,
}

/// Compile-time behavior producing a [`Check`]
pub trait KeywordCompiler: Send + Sync {
    fn compile(&self, ctx: &mut KeywordContext<'_, '_>) -> Result<Box<dyn Check>>;
}

impl<F> KeywordCompiler for F
where
    F: Fn(&mut KeywordContext<'_, '_>) -> Result<Box<dyn Check>> + Send + Sync,
{
    fn compile(&self, ctx: &mut KeywordContext<'_, '_>) -> Result<Box<dyn Check>> {
        self(ctx)
    }
}

/// Check that cannot complete synchronously; only allowed in schemas
/// declaring `"$async": true`
#[async_trait]
pub trait AsyncKeyword: Send + Sync {
    async fn validate(&self, schema: &Value, data: &Value) -> bool;
}

/// `(keyword value, data) -> valid`
pub type ValidateFn = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

/// `(keyword value, parent schema) -> schema applied in place`
pub type MacroFn = Arc<dyn Fn(&Value, &Map<String, Value>) -> Value + Send + Sync>;

#[derive(Clone)]
pub enum KeywordBehavior {
    /// Recognized, but produces no rule
    Annotation,
    Validate(ValidateFn),
    Compile(Arc<dyn KeywordCompiler>),
    /// Expands into a schema compiled at the keyword's location
    Macro(MacroFn),
    Async(Arc<dyn AsyncKeyword>),
}

impl fmt::Debug for KeywordBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Annotation => "Annotation",
            Self::Validate(_) => "Validate",
            Self::Compile(_) => "Compile",
            Self::Macro(_) => "Macro",
            Self::Async(_) => "Async",
        };
        f.write_str(name)
    }
}

/// A keyword: its name, applicability, ordering hints and behavior
#[derive(Debug, Clone)]
pub struct KeywordDefinition {
    pub name: String,
    /// `None` applies to every type
    pub types: Option<Vec<JsonType>>,
    /// Keywords this one must run before
    pub before: Vec<String>,
    /// Keywords this one must run after
    pub after: Vec<String>,
    /// Sibling keywords that must be present alongside this one
    pub requires: Vec<String>,
    pub subschemas: SubschemaKind,
    /// Schema the keyword's value must satisfy
    pub meta_schema: Option<Value>,
    pub behavior: KeywordBehavior,
}

impl KeywordDefinition {
    pub fn new(name: impl Into<String>, behavior: KeywordBehavior) -> Self {
        Self {
            name: name.into(),
            types: None,
            before: Vec::new(),
            after: Vec::new(),
            requires: Vec::new(),
            subschemas: SubschemaKind::None,
            meta_schema: None,
            behavior,
        }
    }

    pub fn annotation(name: impl Into<String>) -> Self {
        Self::new(name, KeywordBehavior::Annotation)
    }

    pub fn validate<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    {
        Self::new(name, KeywordBehavior::Validate(Arc::new(f)))
    }

    pub fn compile<C>(name: impl Into<String>, compiler: C) -> Self
    where
        C: KeywordCompiler + 'static,
    {
        Self::new(name, KeywordBehavior::Compile(Arc::new(compiler)))
    }

    /// Macro keyword: its value expands into a schema
    pub fn expand<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value, &Map<String, Value>) -> Value + Send + Sync + 'static,
    {
        Self::new(name, KeywordBehavior::Macro(Arc::new(f)))
    }

    pub fn asynchronous<K>(name: impl Into<String>, keyword: K) -> Self
    where
        K: AsyncKeyword + 'static,
    {
        Self::new(name, KeywordBehavior::Async(Arc::new(keyword)))
    }

    pub fn types(mut self, types: impl IntoIterator<Item = JsonType>) -> Self {
        self.types = Some(types.into_iter().collect());
        self
    }

    pub fn before(mut self, keyword: impl Into<String>) -> Self {
        self.before.push(keyword.into());
        self
    }

    pub fn after(mut self, keyword: impl Into<String>) -> Self {
        self.after.push(keyword.into());
        self
    }

    pub fn requires(mut self, keyword: impl Into<String>) -> Self {
        self.requires.push(keyword.into());
        self
    }

    pub fn subschemas(mut self, kind: SubschemaKind) -> Self {
        self.subschemas = kind;
        self
    }

    pub fn meta_schema(mut self, schema: Value) -> Self {
        self.meta_schema = Some(schema);
        self
    }

    pub fn is_async(&self) -> bool {
        matches!(self.behavior, KeywordBehavior::Async(_))
    }
}

/// Named bundle of keywords, added and removed as a unit
#[derive(Debug, Clone)]
pub struct Vocabulary {
    pub name: String,
    pub keywords: Vec<KeywordDefinition>,
    /// Keywords of a protected vocabulary can't be overwritten or removed
    pub protected: bool,
}

impl Vocabulary {
    pub fn new(name: impl Into<String>, keywords: Vec<KeywordDefinition>) -> Self {
        Self {
            name: name.into(),
            keywords,
            protected: false,
        }
    }

    pub fn protected(mut self) -> Self {
        self.protected = true;
        self
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Keyword table plus its resolved evaluation order
#[derive(Debug, Clone, Default)]
pub struct VocabularyRegistry {
    keywords: HashMap<String, Arc<KeywordDefinition>>,
    /// Names in first-insertion order; ties in the ordering keep this order
    insertion: Vec<String>,
    /// Keyword -> vocabulary that added it
    owners: HashMap<String, String>,
    vocabularies: Vec<String>,
    protected: HashSet<String>,
    ordered: Vec<Arc<KeywordDefinition>>,
    value_validators: HashMap<String, Validator>,
    overwrite: bool,
}

impl VocabularyRegistry {
    pub fn new(overwrite: bool) -> Self {
        Self {
            overwrite,
            ..Self::default()
        }
    }

    /// Add every keyword of a vocabulary, or none of them
    pub fn add_vocabulary(&mut self, vocabulary: Vocabulary) -> Result<()> {
        if self.vocabularies.contains(&vocabulary.name) {
            return Err(SchemaError::KeywordConflict(format!(
                "vocabulary {}",
                vocabulary.name
            )));
        }
        let mut seen = HashSet::new();
        for def in &vocabulary.keywords {
            if !seen.insert(def.name.as_str()) {
                return Err(SchemaError::InvalidKeyword(format!(
                    "{} is defined twice in vocabulary {}",
                    def.name, vocabulary.name
                )));
            }
        }

        let mut next = self.clone();
        for def in vocabulary.keywords {
            let name = def.name.clone();
            next.stage(def, Some(&vocabulary.name))?;
            if vocabulary.protected {
                next.protected.insert(name);
            }
        }
        next.vocabularies.push(vocabulary.name.clone());
        next.reorder()?;
        tracing::debug!(vocabulary = %vocabulary.name, "vocabulary added");
        *self = next;
        Ok(())
    }

    pub fn add_keyword(&mut self, def: KeywordDefinition) -> Result<()> {
        let mut next = self.clone();
        next.stage(def, None)?;
        next.reorder()?;
        *self = next;
        Ok(())
    }

    /// Remove an unprotected keyword, returning its definition
    pub fn remove_keyword(&mut self, name: &str) -> Result<Option<Arc<KeywordDefinition>>> {
        if self.protected.contains(name) {
            return Err(SchemaError::KeywordConflict(format!(
                "{name} is protected and can't be removed"
            )));
        }
        let removed = self.keywords.remove(name);
        if removed.is_some() {
            self.insertion.retain(|n| n != name);
            self.owners.remove(name);
            self.value_validators.remove(name);
            self.reorder()?;
        }
        Ok(removed)
    }

    /// Remove every keyword a vocabulary added
    pub fn remove_vocabulary(&mut self, name: &str) -> Result<bool> {
        if !self.vocabularies.iter().any(|v| v == name) {
            return Ok(false);
        }
        let members: Vec<String> = self
            .owners
            .iter()
            .filter(|(_, owner)| owner.as_str() == name)
            .map(|(keyword, _)| keyword.clone())
            .collect();
        if let Some(protected) = members.iter().find(|k| self.protected.contains(*k)) {
            return Err(SchemaError::KeywordConflict(format!(
                "{protected} is protected and can't be removed"
            )));
        }
        for keyword in &members {
            self.keywords.remove(keyword);
            self.owners.remove(keyword);
            self.value_validators.remove(keyword);
        }
        self.insertion.retain(|n| !members.contains(n));
        self.vocabularies.retain(|v| v != name);
        self.reorder()?;
        Ok(true)
    }

    pub fn get_keyword(&self, name: &str) -> Option<&Arc<KeywordDefinition>> {
        self.keywords.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.keywords.contains_key(name)
    }

    pub fn is_protected(&self, name: &str) -> bool {
        self.protected.contains(name)
    }

    /// All keywords in evaluation order
    pub fn ordered(&self) -> &[Arc<KeywordDefinition>] {
        &self.ordered
    }

    pub fn vocabularies(&self) -> &[String] {
        &self.vocabularies
    }

    /// How nested schemas sit in the value of `name`, if it is known
    pub fn subschema_kind(&self, name: &str) -> Option<SubschemaKind> {
        self.keywords.get(name).map(|def| def.subschemas)
    }

    pub(crate) fn set_value_validator(&mut self, name: &str, validator: Validator) {
        self.value_validators.insert(name.to_string(), validator);
    }

    pub(crate) fn value_validator(&self, name: &str) -> Option<&Validator> {
        self.value_validators.get(name)
    }

    fn stage(&mut self, def: KeywordDefinition, owner: Option<&str>) -> Result<()> {
        check_keyword_name(&def.name)?;
        if self.protected.contains(&def.name) {
            return Err(SchemaError::KeywordConflict(def.name));
        }
        if self.keywords.contains_key(&def.name) {
            if !self.overwrite {
                return Err(SchemaError::KeywordConflict(def.name));
            }
            tracing::debug!(keyword = %def.name, "overwriting keyword definition");
            self.insertion.retain(|n| n != &def.name);
            self.value_validators.remove(&def.name);
        }
        match owner {
            Some(owner) => self.owners.insert(def.name.clone(), owner.to_string()),
            None => self.owners.remove(&def.name),
        };
        self.insertion.push(def.name.clone());
        self.keywords.insert(def.name.clone(), Arc::new(def));
        Ok(())
    }

    fn reorder(&mut self) -> Result<()> {
        self.ordered = compute_order(&self.keywords, &self.insertion)?;
        Ok(())
    }
}

/// Names must look like `$ref`, `minLength` or `x-range`
fn check_keyword_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' || first == '$' => {
            chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '-'))
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(SchemaError::InvalidKeyword(format!(
            "keyword name {name:?} must start with a letter, _ or $"
        )))
    }
}

/// Stable topological order: insertion order wherever `before`/`after`
/// leave a choice. Unknown names in ordering hints are ignored.
fn compute_order(
    keywords: &HashMap<String, Arc<KeywordDefinition>>,
    insertion: &[String],
) -> Result<Vec<Arc<KeywordDefinition>>> {
    let mut graph: DiGraph<&str, ()> = DiGraph::with_capacity(insertion.len(), insertion.len());
    let mut index: HashMap<&str, NodeIndex> = HashMap::with_capacity(insertion.len());
    for name in insertion {
        index.insert(name.as_str(), graph.add_node(name.as_str()));
    }

    for name in insertion {
        let Some(def) = keywords.get(name) else { continue };
        let node = index[name.as_str()];
        for other in &def.before {
            if let Some(&target) = index.get(other.as_str()) {
                graph.update_edge(node, target, ());
            }
        }
        for other in &def.after {
            if let Some(&source) = index.get(other.as_str()) {
                graph.update_edge(source, node, ());
            }
        }
    }

    let mut cyclic: Vec<String> = kosaraju_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .flatten()
        .map(|idx| graph[idx].to_string())
        .collect();
    if !cyclic.is_empty() {
        cyclic.sort();
        return Err(SchemaError::KeywordCycle(cyclic));
    }

    let mut indegree: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();
    let mut ready: BTreeSet<NodeIndex> = graph
        .node_indices()
        .filter(|n| indegree[n.index()] == 0)
        .collect();
    let mut order = Vec::with_capacity(insertion.len());
    while let Some(node) = ready.pop_first() {
        if let Some(def) = keywords.get(graph[node]) {
            order.push(def.clone());
        }
        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            indegree[next.index()] -= 1;
            if indegree[next.index()] == 0 {
                ready.insert(next);
            }
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(registry: &VocabularyRegistry) -> Vec<&str> {
        registry.ordered().iter().map(|d| d.name.as_str()).collect()
    }

    #[test]
    fn test_integer_matching() {
        assert!(JsonType::Integer.matches(&json!(3)));
        assert!(JsonType::Integer.matches(&json!(3.0)));
        assert!(!JsonType::Integer.matches(&json!(3.5)));
        assert!(JsonType::Number.matches(&json!(3)));
        assert!(!JsonType::String.matches(&json!(3)));
    }

    #[test]
    fn test_insertion_order_is_default() {
        let mut registry = VocabularyRegistry::new(true);
        registry.add_keyword(KeywordDefinition::annotation("b")).unwrap();
        registry.add_keyword(KeywordDefinition::annotation("a")).unwrap();
        registry.add_keyword(KeywordDefinition::annotation("c")).unwrap();
        assert_eq!(names(&registry), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_before_and_after_constraints() {
        let mut registry = VocabularyRegistry::new(true);
        registry.add_keyword(KeywordDefinition::annotation("content")).unwrap();
        registry.add_keyword(KeywordDefinition::annotation("shape")).unwrap();
        registry
            .add_keyword(KeywordDefinition::annotation("narrow").before("content"))
            .unwrap();
        registry
            .add_keyword(KeywordDefinition::annotation("first").before("narrow"))
            .unwrap();
        registry
            .add_keyword(KeywordDefinition::annotation("late").after("shape"))
            .unwrap();
        let order = names(&registry);
        let pos = |n: &str| order.iter().position(|x| *x == n).unwrap();
        assert!(pos("first") < pos("narrow"));
        assert!(pos("narrow") < pos("content"));
        assert!(pos("shape") < pos("late"));
    }

    #[test]
    fn test_cycle_is_rejected_without_changes() {
        let mut registry = VocabularyRegistry::new(true);
        registry
            .add_keyword(KeywordDefinition::annotation("a").before("b"))
            .unwrap();
        let err = registry
            .add_keyword(KeywordDefinition::annotation("b").before("a"))
            .unwrap_err();
        match err {
            SchemaError::KeywordCycle(members) => assert_eq!(members, vec!["a", "b"]),
            other => panic!("Expected KeywordCycle, got {:?}", other),
        }
        assert!(!registry.contains("b"));
        assert_eq!(names(&registry), vec!["a"]);
    }

    #[test]
    fn test_protected_keywords() {
        let mut registry = VocabularyRegistry::new(true);
        registry
            .add_vocabulary(Vocabulary::new("core", vec![KeywordDefinition::annotation("$ref")]).protected())
            .unwrap();
        assert!(registry.is_protected("$ref"));
        assert!(matches!(
            registry.add_keyword(KeywordDefinition::annotation("$ref")),
            Err(SchemaError::KeywordConflict(_))
        ));
        assert!(registry.remove_keyword("$ref").is_err());
        assert!(registry.remove_vocabulary("core").is_err());
    }

    #[test]
    fn test_overwrite_policy() {
        let mut registry = VocabularyRegistry::new(true);
        registry.add_keyword(KeywordDefinition::annotation("range")).unwrap();
        registry
            .add_keyword(KeywordDefinition::annotation("range").subschemas(SubschemaKind::Schema))
            .unwrap();
        assert_eq!(registry.subschema_kind("range"), Some(SubschemaKind::Schema));

        let mut strict = VocabularyRegistry::new(false);
        strict.add_keyword(KeywordDefinition::annotation("range")).unwrap();
        assert!(matches!(
            strict.add_keyword(KeywordDefinition::annotation("range")),
            Err(SchemaError::KeywordConflict(_))
        ));
    }

    #[test]
    fn test_invalid_names() {
        let mut registry = VocabularyRegistry::new(true);
        assert!(registry.add_keyword(KeywordDefinition::annotation("")).is_err());
        assert!(registry.add_keyword(KeywordDefinition::annotation("1st")).is_err());
        assert!(registry.add_keyword(KeywordDefinition::annotation("has space")).is_err());
        assert!(registry.add_keyword(KeywordDefinition::annotation("x-range")).is_ok());
    }

    #[test]
    fn test_vocabulary_add_and_remove() {
        let mut registry = VocabularyRegistry::new(true);
        let vocab = Vocabulary::new(
            "ranges",
            vec![
                KeywordDefinition::annotation("range"),
                KeywordDefinition::annotation("exclusiveRange"),
            ],
        );
        registry.add_vocabulary(vocab.clone()).unwrap();
        assert!(registry.add_vocabulary(vocab).is_err());
        assert!(registry.contains("exclusiveRange"));

        assert!(registry.remove_vocabulary("ranges").unwrap());
        assert!(!registry.contains("range"));
        assert!(registry.ordered().is_empty());
        assert!(!registry.remove_vocabulary("ranges").unwrap());
    }

    #[test]
    fn test_vocabulary_with_duplicate_names_is_rejected() {
        let mut registry = VocabularyRegistry::new(true);
        let vocab = Vocabulary::new(
            "dup",
            vec![KeywordDefinition::annotation("a"), KeywordDefinition::annotation("a")],
        );
        assert!(matches!(
            registry.add_vocabulary(vocab),
            Err(SchemaError::InvalidKeyword(_))
        ));
        assert!(registry.ordered().is_empty());
    }
}
