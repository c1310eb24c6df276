//! Keywords applying subschemas to the data or parts of it

use regex::Regex;
use serde_json::{json, Map, Value};

use crate::compiler::KeywordContext;
use crate::error::Result;
use crate::validator::{check, Check, Subschema};
use crate::vocabulary::{JsonType, KeywordDefinition, SubschemaKind, Vocabulary};

pub fn applicator() -> Vocabulary {
    use JsonType::{Array, Object};

    Vocabulary::new(
        "applicator",
        vec![
            KeywordDefinition::compile("properties", compile_properties)
                .types([Object])
                .subschemas(SubschemaKind::Map),
            KeywordDefinition::compile("patternProperties", compile_pattern_properties)
                .types([Object])
                .subschemas(SubschemaKind::Map),
            KeywordDefinition::compile("additionalProperties", compile_additional_properties)
                .types([Object])
                .after("properties")
                .after("patternProperties")
                .subschemas(SubschemaKind::Schema),
            KeywordDefinition::compile("propertyNames", compile_property_names)
                .types([Object])
                .subschemas(SubschemaKind::Schema),
            KeywordDefinition::compile("dependencies", compile_dependencies)
                .types([Object])
                .subschemas(SubschemaKind::Map),
            KeywordDefinition::compile("items", compile_items)
                .types([Array])
                .subschemas(SubschemaKind::SchemaOrArray),
            KeywordDefinition::compile("additionalItems", compile_additional_items)
                .types([Array])
                .after("items")
                .subschemas(SubschemaKind::Schema),
            KeywordDefinition::compile("contains", compile_contains)
                .types([Array])
                .subschemas(SubschemaKind::Schema),
            KeywordDefinition::compile("allOf", compile_all_of).subschemas(SubschemaKind::Array),
            KeywordDefinition::compile("anyOf", compile_any_of).subschemas(SubschemaKind::Array),
            KeywordDefinition::compile("oneOf", compile_one_of).subschemas(SubschemaKind::Array),
            KeywordDefinition::compile("not", compile_not).subschemas(SubschemaKind::Schema),
            KeywordDefinition::compile("if", compile_if).subschemas(SubschemaKind::Schema),
            KeywordDefinition::annotation("then").subschemas(SubschemaKind::Schema),
            KeywordDefinition::annotation("else").subschemas(SubschemaKind::Schema),
        ],
    )
}

fn object_value<'c>(ctx: &KeywordContext<'c, '_>) -> Result<&'c Map<String, Value>> {
    ctx.value()
        .as_object()
        .ok_or_else(|| ctx.error("value must be an object"))
}

fn schema_list(ctx: &mut KeywordContext<'_, '_>) -> Result<Vec<Subschema>> {
    let schemas = ctx
        .value()
        .as_array()
        .filter(|a| !a.is_empty())
        .ok_or_else(|| ctx.error("value must be a non-empty array of schemas"))?;
    schemas
        .iter()
        .enumerate()
        .map(|(i, schema)| ctx.subschema(schema, &[&i.to_string()]))
        .collect()
}

fn compile_patterns(ctx: &KeywordContext<'_, '_>, patterns: &Map<String, Value>) -> Result<Vec<Regex>> {
    patterns
        .keys()
        .map(|p| Regex::new(p).map_err(|e| ctx.error(format!("invalid pattern {p:?}: {e}"))))
        .collect()
}

// =============================================================================
// Objects
// =============================================================================

fn compile_properties(ctx: &mut KeywordContext<'_, '_>) -> Result<Box<dyn Check>> {
    let mut properties = Vec::new();
    for (name, schema) in object_value(ctx)? {
        let sub = ctx.subschema(schema, &[name.as_str()])?;
        if !sub.is_trivially_valid() {
            properties.push((name.clone(), sub));
        }
    }
    Ok(check(move |data, scope| {
        let Some(map) = data.as_object() else {
            return true;
        };
        let mut valid = true;
        for (name, sub) in &properties {
            if let Some(value) = map.get(name) {
                if !scope.validate_child(sub, value, name) {
                    valid = false;
                    if !scope.all_errors() {
                        break;
                    }
                }
            }
        }
        valid
    }))
}

fn compile_pattern_properties(ctx: &mut KeywordContext<'_, '_>) -> Result<Box<dyn Check>> {
    let patterns = object_value(ctx)?;
    let regexes = compile_patterns(ctx, patterns)?;
    let mut rules = Vec::with_capacity(regexes.len());
    for (re, (pattern, schema)) in regexes.into_iter().zip(patterns) {
        rules.push((re, ctx.subschema(schema, &[pattern.as_str()])?));
    }
    Ok(check(move |data, scope| {
        let Some(map) = data.as_object() else {
            return true;
        };
        let mut valid = true;
        for (re, sub) in &rules {
            for (key, value) in map.iter().filter(|(k, _)| re.is_match(k)) {
                if !scope.validate_child(sub, value, key) {
                    valid = false;
                    if !scope.all_errors() {
                        return false;
                    }
                }
            }
        }
        valid
    }))
}

fn compile_additional_properties(ctx: &mut KeywordContext<'_, '_>) -> Result<Box<dyn Check>> {
    let parent = ctx.parent();
    let known: Vec<String> = parent
        .get("properties")
        .and_then(Value::as_object)
        .map(|p| p.keys().cloned().collect())
        .unwrap_or_default();
    let patterns = match parent.get("patternProperties").and_then(Value::as_object) {
        Some(patterns) => compile_patterns(ctx, patterns)?,
        None => Vec::new(),
    };
    let value = ctx.value();
    let forbidden = value == &Value::Bool(false);
    let sub = ctx.subschema(value, &[])?;

    Ok(check(move |data, scope| {
        let Some(map) = data.as_object() else {
            return true;
        };
        let mut valid = true;
        let extra = map
            .iter()
            .filter(|(k, _)| !known.contains(*k) && !patterns.iter().any(|re| re.is_match(k)));
        for (key, value) in extra {
            let ok = if forbidden {
                scope.at(key, |scope| {
                    scope.report(
                        "should NOT have additional properties",
                        json!({ "additionalProperty": key }),
                    )
                });
                false
            } else {
                scope.validate_child(&sub, value, key)
            };
            if !ok {
                valid = false;
                if !scope.all_errors() {
                    break;
                }
            }
        }
        valid
    }))
}

fn compile_property_names(ctx: &mut KeywordContext<'_, '_>) -> Result<Box<dyn Check>> {
    let value = ctx.value();
    let sub = ctx.subschema(value, &[])?;
    Ok(check(move |data, scope| {
        let Some(map) = data.as_object() else {
            return true;
        };
        let mut valid = true;
        for key in map.keys() {
            if !scope.validate(&sub, &Value::String(key.clone())) {
                scope.report(
                    format!("property name '{key}' is invalid"),
                    json!({ "propertyName": key }),
                );
                valid = false;
                if !scope.all_errors() {
                    break;
                }
            }
        }
        valid
    }))
}

enum Dependency {
    Properties(Vec<String>),
    Schema(Subschema),
}

fn compile_dependencies(ctx: &mut KeywordContext<'_, '_>) -> Result<Box<dyn Check>> {
    let mut dependencies = Vec::new();
    for (property, dependency) in object_value(ctx)? {
        let dependency = match dependency {
            Value::Array(names) => Dependency::Properties(
                names
                    .iter()
                    .map(|n| {
                        n.as_str()
                            .map(str::to_string)
                            .ok_or_else(|| ctx.error("property dependencies must be strings"))
                    })
                    .collect::<Result<_>>()?,
            ),
            schema => Dependency::Schema(ctx.subschema(schema, &[property.as_str()])?),
        };
        dependencies.push((property.clone(), dependency));
    }

    Ok(check(move |data, scope| {
        let Some(map) = data.as_object() else {
            return true;
        };
        let mut valid = true;
        for (property, dependency) in dependencies.iter().filter(|(p, _)| map.contains_key(p)) {
            let ok = match dependency {
                Dependency::Properties(names) => {
                    let missing: Vec<&String> = names.iter().filter(|n| !map.contains_key(*n)).collect();
                    for name in &missing {
                        scope.report(
                            format!("should have property {name} when property {property} is present"),
                            json!({
                                "property": property,
                                "missingProperty": name,
                                "depsCount": names.len(),
                                "deps": names.join(", "),
                            }),
                        );
                        if !scope.all_errors() {
                            break;
                        }
                    }
                    missing.is_empty()
                }
                Dependency::Schema(sub) => scope.validate(sub, data),
            };
            if !ok {
                valid = false;
                if !scope.all_errors() {
                    break;
                }
            }
        }
        valid
    }))
}

// =============================================================================
// Arrays
// =============================================================================

enum Items {
    Each(Subschema),
    Tuple(Vec<Subschema>),
}

fn compile_items(ctx: &mut KeywordContext<'_, '_>) -> Result<Box<dyn Check>> {
    let items = match ctx.value() {
        Value::Array(schemas) => Items::Tuple(
            schemas
                .iter()
                .enumerate()
                .map(|(i, schema)| ctx.subschema(schema, &[&i.to_string()]))
                .collect::<Result<_>>()?,
        ),
        schema => Items::Each(ctx.subschema(schema, &[])?),
    };
    Ok(check(move |data, scope| {
        let Some(values) = data.as_array() else {
            return true;
        };
        let mut valid = true;
        for (i, value) in values.iter().enumerate() {
            let sub = match &items {
                Items::Each(sub) => sub,
                Items::Tuple(subs) => match subs.get(i) {
                    Some(sub) => sub,
                    None => break,
                },
            };
            if !scope.validate_child(sub, value, i) {
                valid = false;
                if !scope.all_errors() {
                    break;
                }
            }
        }
        valid
    }))
}

fn compile_additional_items(ctx: &mut KeywordContext<'_, '_>) -> Result<Box<dyn Check>> {
    // Only meaningful next to an array form of `items`
    let Some(offset) = ctx.parent().get("items").and_then(Value::as_array).map(Vec::len) else {
        return Ok(check(|_, _| true));
    };
    let value = ctx.value();
    let forbidden = value == &Value::Bool(false);
    let sub = ctx.subschema(value, &[])?;
    Ok(check(move |data, scope| {
        let Some(values) = data.as_array() else {
            return true;
        };
        if forbidden && values.len() > offset {
            scope.report(
                format!("should NOT have more than {offset} items"),
                json!({ "limit": offset }),
            );
            return false;
        }
        let mut valid = true;
        for (i, value) in values.iter().enumerate().skip(offset) {
            if !scope.validate_child(&sub, value, i) {
                valid = false;
                if !scope.all_errors() {
                    break;
                }
            }
        }
        valid
    }))
}

fn compile_contains(ctx: &mut KeywordContext<'_, '_>) -> Result<Box<dyn Check>> {
    let value = ctx.value();
    let sub = ctx.subschema(value, &[])?;
    Ok(check(move |data, scope| {
        let Some(values) = data.as_array() else {
            return true;
        };
        let found = values
            .iter()
            .enumerate()
            .any(|(i, value)| scope.at(i, |scope| scope.test(&sub, value)));
        if found {
            return true;
        }
        scope.report("should contain a valid item", json!({}));
        false
    }))
}

// =============================================================================
// Combinators
// =============================================================================

fn compile_all_of(ctx: &mut KeywordContext<'_, '_>) -> Result<Box<dyn Check>> {
    let schemas = schema_list(ctx)?;
    Ok(check(move |data, scope| {
        let mut valid = true;
        for sub in &schemas {
            if !scope.validate(sub, data) {
                valid = false;
                if !scope.all_errors() {
                    break;
                }
            }
        }
        valid
    }))
}

fn compile_any_of(ctx: &mut KeywordContext<'_, '_>) -> Result<Box<dyn Check>> {
    let schemas = schema_list(ctx)?;
    Ok(check(move |data, scope| {
        let checkpoint = scope.checkpoint();
        for sub in &schemas {
            if scope.validate(sub, data) {
                scope.rollback(checkpoint);
                return true;
            }
        }
        scope.report("should match some schema in anyOf", json!({}));
        false
    }))
}

fn compile_one_of(ctx: &mut KeywordContext<'_, '_>) -> Result<Box<dyn Check>> {
    let schemas = schema_list(ctx)?;
    Ok(check(move |data, scope| {
        let checkpoint = scope.checkpoint();
        let mut passing = Vec::new();
        for (i, sub) in schemas.iter().enumerate() {
            if scope.validate(sub, data) {
                passing.push(i);
                if passing.len() > 1 {
                    break;
                }
            }
        }
        if passing.len() == 1 {
            scope.rollback(checkpoint);
            return true;
        }
        if !passing.is_empty() {
            scope.rollback(checkpoint);
        }
        let passing_schemas = if passing.is_empty() { Value::Null } else { json!(passing) };
        scope.report(
            "should match exactly one schema in oneOf",
            json!({ "passingSchemas": passing_schemas }),
        );
        false
    }))
}

fn compile_not(ctx: &mut KeywordContext<'_, '_>) -> Result<Box<dyn Check>> {
    let value = ctx.value();
    let sub = ctx.subschema(value, &[])?;
    Ok(check(move |data, scope| {
        if !scope.test(&sub, data) {
            return true;
        }
        scope.report("should NOT be valid", json!({}));
        false
    }))
}

fn compile_if(ctx: &mut KeywordContext<'_, '_>) -> Result<Box<dyn Check>> {
    let value = ctx.value();
    let condition = ctx.subschema(value, &[])?;
    let then = ctx.sibling_subschema("then")?;
    let otherwise = ctx.sibling_subschema("else")?;
    if then.is_none() && otherwise.is_none() {
        return Ok(check(|_, _| true));
    }
    Ok(check(move |data, scope| {
        let (branch, keyword) = if scope.test(&condition, data) {
            (&then, "then")
        } else {
            (&otherwise, "else")
        };
        let Some(branch) = branch else {
            return true;
        };
        if scope.validate(branch, data) {
            return true;
        }
        scope.report(
            format!("should match \"{keyword}\" schema"),
            json!({ "failingKeyword": keyword }),
        );
        false
    }))
}
