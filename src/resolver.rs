//! Identifier normalization and `$ref` resolution
//!
//! References are always resolved against the document that owns the
//! referring schema: its own `$id`, then identifiers declared inside it,
//! then every schema the registry knows. Resolution never fails hard; an
//! unknown target comes back as [`Resolved::Missing`] so the caller can
//! decide between failing and loading the document.

use serde_json::Value;
use std::collections::HashMap;
use url::Url;

use crate::error::{Result, SchemaError};
use crate::schema::{EntryId, SchemaStore};
use crate::vocabulary::{SubschemaKind, VocabularyRegistry};

/// Canonical form of an identifier: no empty fragment, absolute URLs
/// re-serialized. Anonymous schemas normalize to `""`.
pub fn normalize_id(raw: &str) -> String {
    let raw = raw.strip_suffix('#').unwrap_or(raw);
    match Url::parse(raw) {
        Ok(url) => {
            let out = url.to_string();
            out.strip_suffix('#').map(str::to_string).unwrap_or(out)
        }
        Err(_) => raw.to_string(),
    }
}

/// Resolve `reference` against `base`
pub fn resolve_url(base: &str, reference: &str) -> String {
    if let Ok(url) = Url::parse(reference) {
        return normalize_id(url.as_str());
    }
    if let Ok(base_url) = Url::parse(base) {
        if let Ok(joined) = base_url.join(reference) {
            return normalize_id(joined.as_str());
        }
    }

    let (base_doc, _) = split_fragment(base);
    let joined = if reference.is_empty() {
        base_doc.to_string()
    } else if reference.starts_with('#') {
        format!("{base_doc}{reference}")
    } else if reference.starts_with('/') {
        reference.to_string()
    } else {
        match base_doc.rfind('/') {
            Some(idx) => format!("{}{}", &base_doc[..=idx], reference),
            None => reference.to_string(),
        }
    };
    normalize_id(&joined)
}

/// Split `doc#fragment` into `("doc", "fragment")`
pub fn split_fragment(reference: &str) -> (&str, &str) {
    match reference.split_once('#') {
        Some((doc, fragment)) => (doc, fragment),
        None => (reference, ""),
    }
}

/// Append an escaped segment to a JSON pointer
pub fn child_pointer(pointer: &str, segment: &str) -> String {
    format!("{}/{}", pointer, segment.replace('~', "~0").replace('/', "~1"))
}

/// Decode the segments of a JSON pointer fragment, undoing percent
/// encoding as well as `~1`/`~0` escapes. `None` when the percent-decoded
/// fragment is not UTF-8.
pub fn pointer_segments(pointer: &str) -> Option<Vec<String>> {
    let decoded = urlencoding::decode(pointer).ok()?;
    Some(
        decoded
            .split('/')
            .skip(1)
            .map(|s| s.replace("~1", "/").replace("~0", "~"))
            .collect(),
    )
}

// =============================================================================
// Local identifier index
// =============================================================================

/// Identifiers declared inside a document and the references it makes
#[derive(Debug, Default)]
pub(crate) struct LocalIndex {
    /// Nested identifier (absolute, or `base#anchor`) -> JSON pointer
    pub local_refs: HashMap<String, String>,
    /// Every `$ref`, resolved against the base in effect where it appears
    pub ref_targets: Vec<String>,
}

/// Collect nested `$id`s and `$ref` targets in one pass. Only values the
/// vocabulary declares as subschemas are descended into.
pub(crate) fn index_local_refs(
    document: &Value,
    base: &str,
    vocabulary: &VocabularyRegistry,
) -> Result<LocalIndex> {
    let mut indexer = Indexer {
        vocabulary,
        root_id: base,
        index: LocalIndex::default(),
    };
    indexer.walk(document, base, "", true)?;
    Ok(indexer.index)
}

struct Indexer<'a> {
    vocabulary: &'a VocabularyRegistry,
    root_id: &'a str,
    index: LocalIndex,
}

impl Indexer<'_> {
    fn walk(&mut self, schema: &Value, base: &str, pointer: &str, is_root: bool) -> Result<()> {
        let Value::Object(map) = schema else {
            return Ok(());
        };

        let mut base = base.to_string();
        if let Some(id) = map.get("$id") {
            let id = id.as_str().ok_or_else(|| {
                SchemaError::MalformedSchema(format!("$id at #{pointer} must be a string"))
            })?;
            // The root's own id is already the base
            if !is_root || id.starts_with('#') {
                let resolved = resolve_url(&base, id);
                base = split_fragment(&resolved).0.to_string();
                self.declare(resolved, pointer)?;
            }
        }

        if let Some(reference) = map.get("$ref").and_then(Value::as_str) {
            let target = resolve_url(&base, reference);
            if !self.index.ref_targets.contains(&target) {
                self.index.ref_targets.push(target);
            }
        }

        for (keyword, value) in map {
            let Some(kind) = self.vocabulary.subschema_kind(keyword) else {
                continue;
            };
            let at = child_pointer(pointer, keyword);
            match (kind, value) {
                (SubschemaKind::Schema, _) => self.walk(value, &base, &at, false)?,
                (SubschemaKind::Array | SubschemaKind::SchemaOrArray, Value::Array(items)) => {
                    for (i, item) in items.iter().enumerate() {
                        self.walk(item, &base, &child_pointer(&at, &i.to_string()), false)?;
                    }
                }
                (SubschemaKind::SchemaOrArray, _) => self.walk(value, &base, &at, false)?,
                (SubschemaKind::Map, Value::Object(members)) => {
                    for (name, member) in members {
                        self.walk(member, &base, &child_pointer(&at, name), false)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn declare(&mut self, id: String, pointer: &str) -> Result<()> {
        if id == self.root_id || self.index.local_refs.contains_key(&id) {
            return Err(SchemaError::DuplicateIdentifier(id));
        }
        self.index.local_refs.insert(id, pointer.to_string());
        Ok(())
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Outcome of resolving an absolute reference
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Resolved {
    /// The reference names a whole registered document
    Entry(EntryId),
    /// A subschema inside the document of `root`
    Fragment {
        root: EntryId,
        /// Base URI in effect at the subschema, before its own `$id`
        base: String,
        pointer: String,
        schema: Value,
    },
    Missing {
        reference: String,
        /// Document that would have to be loaded
        schema: String,
    },
}

/// Resolve an absolute `reference` made from inside entry `from`
pub(crate) fn resolve(store: &SchemaStore, from: EntryId, reference: &str) -> Resolved {
    let missing = || {
        let (doc, _) = split_fragment(reference);
        Resolved::Missing {
            reference: reference.to_string(),
            schema: doc.to_string(),
        }
    };

    let (doc_id, fragment) = split_fragment(reference);
    let Some(owner) = store.get(from).map(|e| e.root) else {
        return missing();
    };
    let Some(owner_entry) = store.get(owner) else {
        return missing();
    };

    // Local declarations shadow registered schemas with the same id
    let (target, start) = if doc_id == owner_entry.id {
        (owner, String::new())
    } else if let Some(pointer) = owner_entry.local_refs.get(doc_id) {
        (owner, pointer.clone())
    } else if let Some(found) = store.lookup(doc_id) {
        let root = store.get(found).map(|e| e.root).unwrap_or(found);
        (root, String::new())
    } else {
        return missing();
    };
    let Some(target_entry) = store.get(target) else {
        return missing();
    };

    let pointer = if fragment.is_empty() {
        start
    } else if fragment.starts_with('/') {
        format!("{start}{fragment}")
    } else {
        let anchor = format!("{doc_id}#{fragment}");
        match target_entry.local_refs.get(&anchor) {
            Some(pointer) => pointer.clone(),
            None => return missing(),
        }
    };
    if pointer.is_empty() {
        return Resolved::Entry(target);
    }

    match walk_pointer(&target_entry.document, &target_entry.id, &pointer) {
        Some((schema, base)) => Resolved::Fragment {
            root: target,
            base,
            pointer,
            schema: schema.clone(),
        },
        None => missing(),
    }
}

/// Follow `pointer` from `document`, applying the `$id`s of the schemas
/// passed through (neither the start nor the target's own)
fn walk_pointer<'v>(document: &'v Value, base: &str, pointer: &str) -> Option<(&'v Value, String)> {
    let segments = pointer_segments(pointer)?;
    let mut node = document;
    let mut base = base.to_string();
    for (i, segment) in segments.iter().enumerate() {
        node = match node {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
        if i + 1 < segments.len() {
            if let Some(id) = node.get("$id").and_then(Value::as_str) {
                if !id.starts_with('#') {
                    base = split_fragment(&resolve_url(&base, id)).0.to_string();
                }
            }
        }
    }
    Some((node, base))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CompilationState, SchemaEntry};
    use crate::vocabulary::KeywordDefinition;
    use serde_json::json;
    use std::sync::Arc;

    fn vocabulary() -> VocabularyRegistry {
        let mut vocab = VocabularyRegistry::new(true);
        vocab
            .add_keyword(KeywordDefinition::annotation("definitions").subschemas(SubschemaKind::Map))
            .unwrap();
        vocab
            .add_keyword(KeywordDefinition::annotation("properties").subschemas(SubschemaKind::Map))
            .unwrap();
        vocab
            .add_keyword(KeywordDefinition::annotation("items").subschemas(SubschemaKind::SchemaOrArray))
            .unwrap();
        vocab
    }

    fn add(store: &mut SchemaStore, id: &str, document: Value) -> EntryId {
        let index = index_local_refs(&document, id, &vocabulary()).unwrap();
        let entry = store.insert(|entry| SchemaEntry {
            id: id.to_string(),
            document: Arc::new(document),
            local_refs: index.local_refs,
            ref_targets: index.ref_targets,
            cache_key: None,
            is_meta: false,
            root: entry,
            pointer: String::new(),
            state: CompilationState::NotStarted,
            refs: HashMap::new(),
        });
        if !id.is_empty() {
            store.refs.insert(id.to_string(), entry);
        }
        entry
    }

    #[test]
    fn test_normalize_id() {
        assert_eq!(normalize_id(""), "");
        assert_eq!(normalize_id("#"), "");
        assert_eq!(normalize_id("A#"), "A");
        assert_eq!(
            normalize_id("http://json-schema.org/draft-07/schema#"),
            "http://json-schema.org/draft-07/schema"
        );
        assert_eq!(normalize_id("HTTP://Example.COM/a"), "http://example.com/a");
    }

    #[test]
    fn test_resolve_url() {
        assert_eq!(resolve_url("A", "B"), "B");
        assert_eq!(resolve_url("dir/a.json", "b.json"), "dir/b.json");
        assert_eq!(resolve_url("", "#/definitions/x"), "#/definitions/x");
        assert_eq!(resolve_url("A", "#"), "A");
        assert_eq!(
            resolve_url("http://example.com/schemas/a.json", "b.json#/x"),
            "http://example.com/schemas/b.json#/x"
        );
        assert_eq!(
            resolve_url("A", "http://example.com/b.json"),
            "http://example.com/b.json"
        );
    }

    #[test]
    fn test_pointer_segments_decoding() {
        assert_eq!(pointer_segments("/a~1b/c~0d").unwrap(), vec!["a/b", "c~d"]);
        assert_eq!(pointer_segments("/with%20space").unwrap(), vec!["with space"]);
        assert_eq!(pointer_segments("/bad%zz").unwrap(), vec!["bad%zz"]);
        assert!(pointer_segments("/%FF").is_none());
        assert_eq!(child_pointer("/properties", "a/b"), "/properties/a~1b");
    }

    #[test]
    fn test_index_collects_ids_and_refs() {
        let doc = json!({
            "$id": "http://example.com/root.json",
            "definitions": {
                "item": {"$id": "item.json", "properties": {"next": {"$ref": "#"}}},
                "named": {"$id": "#named"}
            },
            "properties": {"a": {"$ref": "#/definitions/item"}},
            "enum": [{"$id": "ignored.json"}]
        });
        let index = index_local_refs(&doc, "http://example.com/root.json", &vocabulary()).unwrap();
        assert_eq!(
            index.local_refs.get("http://example.com/item.json").map(String::as_str),
            Some("/definitions/item")
        );
        assert_eq!(
            index.local_refs.get("http://example.com/root.json#named").map(String::as_str),
            Some("/definitions/named")
        );
        assert!(!index.local_refs.contains_key("http://example.com/ignored.json"));
        assert!(index
            .ref_targets
            .contains(&"http://example.com/item.json".to_string()));
        assert!(index
            .ref_targets
            .contains(&"http://example.com/root.json#/definitions/item".to_string()));
    }

    #[test]
    fn test_index_rejects_duplicates_and_bad_ids() {
        let doc = json!({"definitions": {"a": {"$id": "x"}, "b": {"$id": "x"}}});
        assert!(matches!(
            index_local_refs(&doc, "", &vocabulary()),
            Err(SchemaError::DuplicateIdentifier(_))
        ));

        let doc = json!({"definitions": {"a": {"$id": 5}}});
        assert!(matches!(
            index_local_refs(&doc, "", &vocabulary()),
            Err(SchemaError::MalformedSchema(_))
        ));

        assert!(index_local_refs(&json!(true), "", &vocabulary()).unwrap().local_refs.is_empty());
    }

    #[test]
    fn test_resolve_entry_fragment_and_missing() {
        let mut store = SchemaStore::default();
        let a = add(
            &mut store,
            "A",
            json!({"definitions": {"n": {"type": "number"}}, "$ref": "B"}),
        );
        let b = add(&mut store, "B", json!({"type": "number"}));

        assert_eq!(resolve(&store, a, "B"), Resolved::Entry(b));
        assert_eq!(resolve(&store, a, "A"), Resolved::Entry(a));
        match resolve(&store, a, "A#/definitions/n") {
            Resolved::Fragment { root, pointer, schema, .. } => {
                assert_eq!(root, a);
                assert_eq!(pointer, "/definitions/n");
                assert_eq!(schema, json!({"type": "number"}));
            }
            other => panic!("Expected fragment, got {:?}", other),
        }
        assert_eq!(
            resolve(&store, a, "C#/x"),
            Resolved::Missing {
                reference: "C#/x".to_string(),
                schema: "C".to_string()
            }
        );
        assert!(matches!(
            resolve(&store, a, "A#/definitions/none"),
            Resolved::Missing { .. }
        ));
        // Not UTF-8 once decoded
        assert!(matches!(
            resolve(&store, a, "A#/definitions/%FF"),
            Resolved::Missing { .. }
        ));
    }

    #[test]
    fn test_local_declaration_wins() {
        let mut store = SchemaStore::default();
        let _global = add(&mut store, "http://example.com/b.json", json!({"type": "string"}));
        let root = add(
            &mut store,
            "http://example.com/a.json",
            json!({"definitions": {"b": {"$id": "b.json", "type": "number"}}}),
        );
        match resolve(&store, root, "http://example.com/b.json") {
            Resolved::Fragment { root: owner, pointer, base, .. } => {
                assert_eq!(owner, root);
                assert_eq!(pointer, "/definitions/b");
                assert_eq!(base, "http://example.com/a.json");
            }
            other => panic!("Expected local fragment, got {:?}", other),
        }
    }

    #[test]
    fn test_resolve_anchor_and_nested_base() {
        let mut store = SchemaStore::default();
        let root = add(
            &mut store,
            "http://example.com/a.json",
            json!({
                "definitions": {
                    "tagged": {"$id": "#tagged", "type": "integer"},
                    "nested": {
                        "$id": "nested/",
                        "definitions": {"leaf": {"type": "null"}}
                    }
                }
            }),
        );
        match resolve(&store, root, "http://example.com/a.json#tagged") {
            Resolved::Fragment { pointer, .. } => assert_eq!(pointer, "/definitions/tagged"),
            other => panic!("Expected anchor fragment, got {:?}", other),
        }
        match resolve(&store, root, "http://example.com/a.json#/definitions/nested/definitions/leaf") {
            Resolved::Fragment { base, .. } => assert_eq!(base, "http://example.com/nested/"),
            other => panic!("Expected nested fragment, got {:?}", other),
        }
    }
}
