//! End-to-end tests for the schema registry
//!
//! Compiles fixture schemas and checks validation results, reference
//! resolution, meta-schema handling, removal and custom vocabularies.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use familiar_schemac::{
    CompilationState, Format, KeySerializer, KeywordDefinition, Options, RemoveTarget,
    SchemaError, SchemaRegistry, UnknownKeywords, ValidateSchema, Vocabulary,
};

fn fixture(name: &str) -> Value {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    let content = std::fs::read_to_string(&path).unwrap();
    serde_json::from_str(&content).unwrap()
}

fn registry() -> SchemaRegistry {
    SchemaRegistry::new(Options::default()).unwrap()
}

// =============================================================================
// References
// =============================================================================

#[test]
fn test_cross_document_reference() {
    let mut registry = registry();
    registry.add_schema(fixture("schema_b.json"), None).unwrap();
    let validator = registry.compile(fixture("schema_a.json")).unwrap();

    assert!(validator.is_valid(&json!({"x": 1})));
    let errors = validator.validate(&json!({"x": "s"})).unwrap_err();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].data_path, "/x");
    assert_eq!(errors[0].keyword, "type");
    assert_eq!(errors.to_string(), "data/x should be number");
}

#[test]
fn test_recursive_tree_schema() {
    let mut registry = registry();
    let validator = registry.compile(fixture("tree.json")).unwrap();

    let tree = json!({
        "value": 1,
        "children": [
            {"value": 2, "children": []},
            {"value": 3, "children": [{"value": 4}]}
        ]
    });
    assert!(validator.is_valid(&tree));

    let bad = json!({"value": 1, "children": [{"value": 2, "children": [{"value": "four"}]}]});
    let errors = validator.validate(&bad).unwrap_err();
    assert_eq!(errors[0].data_path, "/children/0/children/0/value");

    let missing = json!({"value": 1, "children": [{}]});
    let errors = validator.validate(&missing).unwrap_err();
    assert_eq!(errors[0].keyword, "required");
    assert_eq!(errors[0].params["missingProperty"], "value");
}

#[test]
fn test_mutually_recursive_documents() {
    let mut registry = registry();
    registry
        .add_schema(
            json!({"$id": "list", "anyOf": [{"type": "null"}, {"$ref": "node"}]}),
            None,
        )
        .unwrap();
    registry
        .add_schema(
            json!({
                "$id": "node",
                "type": "object",
                "properties": {"head": {"type": "integer"}, "tail": {"$ref": "list"}},
                "required": ["head"]
            }),
            None,
        )
        .unwrap();

    let list = registry.get_schema("list").unwrap().unwrap();
    assert!(list.is_valid(&json!(null)));
    assert!(list.is_valid(&json!({"head": 1, "tail": {"head": 2, "tail": null}})));
    assert!(!list.is_valid(&json!({"head": 1, "tail": {"head": "two"}})));

    // Both ends compiled in one pass
    assert_eq!(registry.schema_entry("node").unwrap().state(), CompilationState::Done);
}

#[test]
fn test_missing_reference_leaves_nothing_behind() {
    let mut registry = registry();
    let before = registry.cache_len();

    let err = registry
        .compile(json!({"properties": {"a": {"$ref": "missing.json#/definitions/a"}}}))
        .unwrap_err();
    match err {
        SchemaError::MissingReference { reference, schema } => {
            assert_eq!(reference, "missing.json#/definitions/a");
            assert_eq!(schema, "missing.json");
        }
        other => panic!("Expected MissingReference, got {:?}", other),
    }
    assert_eq!(registry.cache_len(), before);
}

#[test]
fn test_fragment_and_anchor_references() {
    let mut registry = registry();
    registry.add_schema(fixture("definitions.json"), None).unwrap();

    let validator = registry
        .compile(json!({
            "type": "object",
            "properties": {
                "count": {"$ref": "http://example.com/definitions.json#/definitions/int"},
                "label": {"$ref": "http://example.com/definitions.json#/definitions/str"}
            }
        }))
        .unwrap();
    assert!(validator.is_valid(&json!({"count": 3, "label": "a"})));
    assert!(!validator.is_valid(&json!({"count": 3.5})));
    assert!(!validator.is_valid(&json!({"label": ""})));

    let nested = registry
        .get_schema("http://example.com/definitions.json#/definitions/nested")
        .unwrap()
        .unwrap();
    assert!(nested.is_valid(&json!({"enabled": true})));
    assert!(!nested.is_valid(&json!({"enabled": 1})));
}

#[test]
fn test_reference_loop_without_progress_fails() {
    let mut registry = registry();
    let validator = registry.compile(json!({"$id": "loop", "$ref": "#"})).unwrap();
    let errors = validator.validate(&json!(1)).unwrap_err();
    assert_eq!(errors[0].keyword, "$ref");
}

#[test]
fn test_deep_recursive_data_is_valid() {
    let mut registry = registry();
    let validator = registry.compile(fixture("tree.json")).unwrap();

    let mut tree = json!({"value": 0});
    for depth in 1..=600 {
        tree = json!({"value": depth, "children": [tree]});
    }
    let mut bad_leaf = json!({"value": "leaf"});
    for depth in 1..=600 {
        bad_leaf = json!({"value": depth, "children": [bad_leaf]});
    }

    // Each level of data costs a few frames; leave room for debug builds
    let (valid, errors) = std::thread::Builder::new()
        .stack_size(256 * 1024 * 1024)
        .spawn(move || (validator.validate(&tree), validator.validate(&bad_leaf)))
        .unwrap()
        .join()
        .unwrap();
    assert!(valid.is_ok(), "{:?}", valid);
    let errors = errors.unwrap_err();
    assert_eq!(errors[0].keyword, "type");
    assert!(errors[0].data_path.ends_with("/children/0/value"));
}

#[test]
fn test_failed_compile_rolls_back() {
    let mut registry = registry();
    registry
        .add_schema(
            json!({
                "$id": "defs",
                "definitions": {
                    "good": {"type": "string"},
                    "bad": {"type": "string", "format": "postcode"}
                }
            }),
            None,
        )
        .unwrap();
    let document = json!({
        "allOf": [
            {"$ref": "defs#/definitions/good"},
            {"$ref": "defs#/definitions/bad"}
        ]
    });

    assert!(matches!(
        registry.compile(document.clone()),
        Err(SchemaError::UnknownFormat(name)) if name == "postcode"
    ));
    assert_eq!(registry.schema_entry("defs").unwrap().state(), CompilationState::NotStarted);

    registry.add_format("postcode", Format::func(|s| s.len() == 5));
    let validator = registry.compile(document).unwrap();
    assert!(validator.is_valid(&json!("12345")));
    assert!(!validator.is_valid(&json!("123")));
}

// =============================================================================
// Caching and removal
// =============================================================================

#[test]
fn test_equal_documents_share_validator() {
    let mut registry = registry();
    let a = registry.compile(fixture("tree.json")).unwrap();
    let b = registry.compile(fixture("tree.json")).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_remove_then_recompile() {
    let mut registry = registry();
    registry.add_schema(fixture("schema_b.json"), None).unwrap();
    registry.compile(fixture("schema_a.json")).unwrap();

    assert_eq!(registry.remove_schema(RemoveTarget::Key("B".to_string())), 1);
    assert!(registry.get_schema("B").unwrap().is_none());

    registry.remove_schema(RemoveTarget::Key("A".to_string()));
    assert!(registry.compile(fixture("schema_a.json")).unwrap_err().is_missing_reference());

    registry.add_schema(json!({"$id": "B", "type": "string"}), None).unwrap();
    let validator = registry.compile(fixture("schema_a.json")).unwrap();
    assert!(validator.is_valid(&json!({"x": "s"})));
    assert!(!validator.is_valid(&json!({"x": 1})));
}

#[test]
fn test_dependents_recover_after_referenced_schema_is_readded() {
    let mut registry = registry();
    registry.add_schema(fixture("schema_b.json"), None).unwrap();
    registry.add_schema(fixture("schema_a.json"), None).unwrap();
    let validator = registry.get_schema("A").unwrap().unwrap();
    assert!(registry.validate("A", &json!({"x": 5})).unwrap());

    registry.remove_schema(RemoveTarget::Key("B".to_string()));
    assert_eq!(registry.schema_entry("A").unwrap().state(), CompilationState::NotStarted);
    assert!(registry.validate("A", &json!({"x": 5})).unwrap_err().is_missing_reference());

    registry.add_schema(fixture("schema_b.json"), None).unwrap();
    assert!(registry.validate("A", &json!({"x": 5})).unwrap());
    assert!(!registry.validate("A", &json!({"x": "five"})).unwrap());
    // Validators handed out earlier see the recompiled slot
    assert!(validator.is_valid(&json!({"x": 5})));
}

#[test]
fn test_disabled_serializer_keys_by_allocation() {
    let mut registry = SchemaRegistry::new(Options {
        serialize: KeySerializer::Disabled,
        ..Options::default()
    })
    .unwrap();
    let a = registry.compile(json!({"type": "string"})).unwrap();
    let b = registry.compile(json!({"type": "string"})).unwrap();
    assert_ne!(a, b);

    let shared = Arc::new(json!({"type": "number"}));
    let c = registry.compile(shared.clone()).unwrap();
    let d = registry.compile(shared).unwrap();
    assert_eq!(c, d);
}

// =============================================================================
// Options
// =============================================================================

#[test]
fn test_compiled_ids_not_referenceable_without_add_used_schema() {
    let mut registry = SchemaRegistry::new(Options {
        add_used_schema: false,
        ..Options::default()
    })
    .unwrap();
    registry
        .compile(json!({"$id": "http://example.com/used", "type": "string"}))
        .unwrap();
    assert!(registry.schema_entry("http://example.com/used").is_none());
    assert!(registry
        .compile(json!({"$ref": "http://example.com/used"}))
        .unwrap_err()
        .is_missing_reference());

    let mut default = SchemaRegistry::new(Options::default()).unwrap();
    default
        .compile(json!({"$id": "http://example.com/used", "type": "string"}))
        .unwrap();
    let validator = default.compile(json!({"$ref": "http://example.com/used"})).unwrap();
    assert!(!validator.is_valid(&json!(1)));
}

#[test]
fn test_schema_validation_disabled() {
    let mut registry = SchemaRegistry::new(Options {
        validate_schema: ValidateSchema::Disabled,
        ..Options::default()
    })
    .unwrap();
    registry.add_schema(json!({"minLength": "three"}), Some("loose")).unwrap();
    assert!(registry.schema_entry("loose").is_some());

    let mut checked = SchemaRegistry::new(Options::default()).unwrap();
    assert!(matches!(
        checked.add_schema(json!({"minLength": "three"}), Some("loose")),
        Err(SchemaError::SchemaInvalid { .. })
    ));
}

#[test]
fn test_unknown_keywords_fail() {
    let mut registry = SchemaRegistry::new(Options {
        unknown_keywords: UnknownKeywords::Fail,
        ..Options::default()
    })
    .unwrap();
    assert!(matches!(
        registry.compile(json!({"properties": {"a": {"colour": "red"}}})),
        Err(SchemaError::CompilationFailure { keyword, .. }) if keyword == "colour"
    ));
    registry.compile(json!({"type": "string", "title": "known"})).unwrap();

    let mut lenient = SchemaRegistry::new(Options::default()).unwrap();
    assert!(lenient.compile(json!({"colour": "red"})).is_ok());
}

#[test]
fn test_add_schemas() {
    let mut registry = registry();
    let ids = registry
        .add_schemas(vec![fixture("schema_b.json"), fixture("schema_a.json")])
        .unwrap();
    assert_eq!(ids.len(), 2);
    assert!(registry.validate("A", &json!({"x": 1})).unwrap());
    assert!(!registry.validate("A", &json!({"x": "s"})).unwrap());

    assert!(matches!(
        registry.add_schemas(vec![json!({"$id": "C"}), json!({"$id": "B", "type": "string"})]),
        Err(SchemaError::DuplicateIdentifier(id)) if id == "B"
    ));
}

#[test]
fn test_meta_schemas_compile_with_meta_options() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();

    let mut registry = SchemaRegistry::new(Options {
        use_defaults: true,
        ..Options::default()
    })
    .unwrap();
    registry
        .add_keyword(KeywordDefinition::compile(
            "tracked",
            move |ctx: &mut familiar_schemac::KeywordContext<'_, '_>| {
                log.lock().unwrap().push(ctx.options().use_defaults);
                Ok(familiar_schemac::check(|_, _| true))
            },
        ))
        .unwrap();
    registry
        .add_meta_schema(json!({"$id": "http://example.com/tracked-meta", "tracked": true}), None)
        .unwrap();

    registry
        .compile(json!({"$schema": "http://example.com/tracked-meta", "tracked": true}))
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![false, true]);
}

// =============================================================================
// Meta-schemas
// =============================================================================

#[test]
fn test_self_describing_meta_schema() {
    let mut registry = registry();
    registry.add_meta_schema(fixture("strict_meta.json"), None).unwrap();

    registry
        .add_schema(
            json!({
                "$schema": "http://example.com/strict-meta",
                "type": "object",
                "properties": {"name": {"type": "string"}}
            }),
            Some("ok"),
        )
        .unwrap();

    let err = registry
        .add_schema(
            json!({
                "$schema": "http://example.com/strict-meta",
                "type": "object",
                "properties": {"age": {"type": "number"}}
            }),
            Some("rejected"),
        )
        .unwrap_err();
    match err {
        SchemaError::SchemaInvalid { errors } => {
            assert_eq!(errors[0].data_path, "/properties/age/type");
        }
        other => panic!("Expected SchemaInvalid, got {:?}", other),
    }
    assert!(registry.schema_entry("rejected").is_none());
}

#[test]
fn test_validate_schema_reports_errors() {
    let mut registry = registry();
    assert!(registry.validate_schema(&fixture("tree.json"), false).unwrap());
    assert!(!registry
        .validate_schema(&json!({"properties": {"a": {"minItems": "three"}}}), false)
        .unwrap());
    let errors = registry.errors().unwrap();
    assert_eq!(errors[0].data_path, "/properties/a/minItems");
}

// =============================================================================
// Vocabularies
// =============================================================================

#[test]
fn test_custom_vocabulary_ordering() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let recorder = |name: &'static str| {
        let log = log.clone();
        move |_: &Value, _: &Value| {
            log.lock().unwrap().push(name);
            true
        }
    };

    let mut registry = registry();
    registry
        .add_vocabulary(Vocabulary::new(
            "audit",
            vec![
                KeywordDefinition::validate("alpha", recorder("alpha")),
                KeywordDefinition::validate("omega", recorder("omega")).before("alpha"),
            ],
        ))
        .unwrap();

    let validator = registry.compile(json!({"alpha": true, "omega": true})).unwrap();
    assert!(validator.is_valid(&json!({})));
    assert_eq!(*log.lock().unwrap(), vec!["omega", "alpha"]);
}

#[test]
fn test_keyword_compiled_once_per_occurrence() {
    static COMPILED: AtomicUsize = AtomicUsize::new(0);

    let mut registry = registry();
    registry
        .add_keyword(KeywordDefinition::compile(
            "even",
            |ctx: &mut familiar_schemac::KeywordContext<'_, '_>| {
                COMPILED.fetch_add(1, Ordering::SeqCst);
                let enabled = ctx.value().as_bool().unwrap_or(false);
                Ok(familiar_schemac::check(move |data, scope| {
                    let odd = data.as_i64().map(|n| n % 2 != 0).unwrap_or(false);
                    if enabled && odd {
                        scope.report("should be even", json!({}));
                        return false;
                    }
                    true
                }))
            },
        ))
        .unwrap();

    let schema = json!({"properties": {"a": {"even": true}, "b": {"even": true}}});
    let validator = registry.compile(schema.clone()).unwrap();
    registry.compile(schema).unwrap();
    assert_eq!(COMPILED.load(Ordering::SeqCst), 2);

    let errors = validator.validate(&json!({"a": 2, "b": 3})).unwrap_err();
    assert_eq!(errors[0].keyword, "even");
    assert_eq!(errors[0].data_path, "/b");
    assert_eq!(errors[0].message, "should be even");
}

#[test]
fn test_macro_keyword() {
    let mut registry = registry();
    registry
        .add_keyword(KeywordDefinition::expand("range", |value, _| {
            json!({"minimum": value[0], "maximum": value[1]})
        }))
        .unwrap();
    let validator = registry.compile(json!({"range": [1, 3]})).unwrap();
    assert!(validator.is_valid(&json!(2)));
    assert!(!validator.is_valid(&json!(4)));
}

#[test]
fn test_protected_keywords_cannot_be_replaced() {
    let mut registry = registry();
    assert!(registry
        .add_keyword(KeywordDefinition::validate("$ref", |_, _| true))
        .is_err());
    assert!(registry.remove_keyword("$id").is_err());
}

#[test]
fn test_removed_keyword_is_ignored() {
    let mut registry = registry();
    assert!(registry.remove_keyword("minLength").unwrap().is_some());
    let validator = registry.compile(json!({"minLength": 3})).unwrap();
    assert!(validator.is_valid(&json!("a")));
}

#[test]
fn test_all_errors_collects_everything() {
    let mut registry = SchemaRegistry::new(Options {
        all_errors: true,
        ..Options::default()
    })
    .unwrap();
    let validator = registry.compile(fixture("item.json")).unwrap();
    let errors = validator
        .validate(&json!({"sku": "abc", "quantity": 0}))
        .unwrap_err();
    let mut keywords: Vec<&str> = errors.iter().map(|e| e.keyword.as_str()).collect();
    keywords.sort();
    assert_eq!(keywords, vec!["minimum", "pattern"]);
}
