//! Type, numeric, string, array and object constraints

use regex::Regex;
use serde_json::{json, Value};

use super::{json_eq, limit, number};
use crate::compiler::KeywordContext;
use crate::error::Result;
use crate::validator::{check, Check, Scope};
use crate::vocabulary::{JsonType, KeywordCompiler, KeywordDefinition, Vocabulary};

pub fn validation() -> Vocabulary {
    use JsonType::{Array, Number, Object, String};

    Vocabulary::new(
        "validation",
        vec![
            KeywordDefinition::compile("type", compile_type),
            KeywordDefinition::compile("enum", compile_enum),
            KeywordDefinition::compile("const", compile_const),
            KeywordDefinition::compile("minimum", Bound::Minimum).types([Number]),
            KeywordDefinition::compile("maximum", Bound::Maximum).types([Number]),
            KeywordDefinition::compile("exclusiveMinimum", Bound::ExclusiveMinimum).types([Number]),
            KeywordDefinition::compile("exclusiveMaximum", Bound::ExclusiveMaximum).types([Number]),
            KeywordDefinition::compile("multipleOf", compile_multiple_of).types([Number]),
            KeywordDefinition::compile("minLength", Count::MinLength).types([String]),
            KeywordDefinition::compile("maxLength", Count::MaxLength).types([String]),
            KeywordDefinition::compile("pattern", compile_pattern).types([String]),
            KeywordDefinition::compile("minItems", Count::MinItems).types([Array]),
            KeywordDefinition::compile("maxItems", Count::MaxItems).types([Array]),
            KeywordDefinition::compile("uniqueItems", compile_unique_items).types([Array]),
            KeywordDefinition::compile("required", compile_required).types([Object]),
            KeywordDefinition::compile("minProperties", Count::MinProperties).types([Object]),
            KeywordDefinition::compile("maxProperties", Count::MaxProperties).types([Object]),
        ],
    )
}

fn compile_type(ctx: &mut KeywordContext<'_, '_>) -> Result<Box<dyn Check>> {
    let names: Vec<&str> = match ctx.value() {
        Value::String(name) => vec![name.as_str()],
        Value::Array(names) => names
            .iter()
            .map(|n| n.as_str().ok_or_else(|| ctx.error("type names must be strings")))
            .collect::<Result<_>>()?,
        _ => return Err(ctx.error("value must be a string or an array of strings")),
    };
    let types = names
        .iter()
        .map(|n| JsonType::parse(n).ok_or_else(|| ctx.error(format!("unknown type {n:?}"))))
        .collect::<Result<Vec<_>>>()?;
    let expected = names.join(",");

    Ok(check(move |data, scope| {
        if types.iter().any(|t| t.matches(data)) {
            return true;
        }
        scope.report(format!("should be {expected}"), json!({ "type": expected }));
        false
    }))
}

fn compile_enum(ctx: &mut KeywordContext<'_, '_>) -> Result<Box<dyn Check>> {
    let allowed = ctx
        .value()
        .as_array()
        .cloned()
        .ok_or_else(|| ctx.error("value must be an array"))?;
    Ok(check(move |data, scope| {
        if allowed.iter().any(|v| json_eq(v, data)) {
            return true;
        }
        scope.report(
            "should be equal to one of the allowed values",
            json!({ "allowedValues": allowed }),
        );
        false
    }))
}

fn compile_const(ctx: &mut KeywordContext<'_, '_>) -> Result<Box<dyn Check>> {
    let expected = ctx.value().clone();
    Ok(check(move |data, scope| {
        if json_eq(&expected, data) {
            return true;
        }
        scope.report("should be equal to constant", json!({ "allowedValue": expected }));
        false
    }))
}

#[derive(Clone, Copy)]
enum Bound {
    Minimum,
    Maximum,
    ExclusiveMinimum,
    ExclusiveMaximum,
}

impl Bound {
    fn comparison(self) -> &'static str {
        match self {
            Self::Minimum => ">=",
            Self::Maximum => "<=",
            Self::ExclusiveMinimum => ">",
            Self::ExclusiveMaximum => "<",
        }
    }

    fn holds(self, value: f64, limit: f64) -> bool {
        match self {
            Self::Minimum => value >= limit,
            Self::Maximum => value <= limit,
            Self::ExclusiveMinimum => value > limit,
            Self::ExclusiveMaximum => value < limit,
        }
    }
}

impl KeywordCompiler for Bound {
    fn compile(&self, ctx: &mut KeywordContext<'_, '_>) -> Result<Box<dyn Check>> {
        compile_bound(ctx, *self)
    }
}

fn compile_bound(ctx: &mut KeywordContext<'_, '_>, bound: Bound) -> Result<Box<dyn Check>> {
    let limit = number(ctx)?;
    let exclusive = matches!(bound, Bound::ExclusiveMinimum | Bound::ExclusiveMaximum);
    Ok(check(move |data, scope| {
        let Some(value) = data.as_f64() else {
            return true;
        };
        if bound.holds(value, limit) {
            return true;
        }
        let comparison = bound.comparison();
        scope.report(
            format!("should be {comparison} {limit}"),
            json!({ "comparison": comparison, "limit": limit, "exclusive": exclusive }),
        );
        false
    }))
}

fn compile_multiple_of(ctx: &mut KeywordContext<'_, '_>) -> Result<Box<dyn Check>> {
    let divisor = number(ctx)?;
    if divisor <= 0.0 {
        return Err(ctx.error("value must be strictly greater than 0"));
    }
    let integral = ctx.value().as_u64();
    Ok(check(move |data, scope| {
        let valid = match (data.as_i64(), integral) {
            (Some(value), Some(divisor)) => value.unsigned_abs() % divisor == 0,
            _ => data
                .as_f64()
                .map(|value| (value / divisor).fract() == 0.0)
                .unwrap_or(true),
        };
        if !valid {
            scope.report(
                format!("should be multiple of {divisor}"),
                json!({ "multipleOf": divisor }),
            );
        }
        valid
    }))
}

#[derive(Clone, Copy)]
enum Count {
    MinLength,
    MaxLength,
    MinItems,
    MaxItems,
    MinProperties,
    MaxProperties,
}

impl Count {
    fn measure(self, data: &Value) -> Option<u64> {
        let n = match (self, data) {
            (Self::MinLength | Self::MaxLength, Value::String(s)) => s.chars().count(),
            (Self::MinItems | Self::MaxItems, Value::Array(items)) => items.len(),
            (Self::MinProperties | Self::MaxProperties, Value::Object(map)) => map.len(),
            _ => return None,
        };
        Some(n as u64)
    }

    fn is_min(self) -> bool {
        matches!(self, Self::MinLength | Self::MinItems | Self::MinProperties)
    }

    fn message(self, limit: u64) -> String {
        match self {
            Self::MinLength => format!("should NOT be shorter than {limit} characters"),
            Self::MaxLength => format!("should NOT be longer than {limit} characters"),
            Self::MinItems => format!("should NOT have fewer than {limit} items"),
            Self::MaxItems => format!("should NOT have more than {limit} items"),
            Self::MinProperties => format!("should NOT have fewer than {limit} properties"),
            Self::MaxProperties => format!("should NOT have more than {limit} properties"),
        }
    }
}

impl KeywordCompiler for Count {
    fn compile(&self, ctx: &mut KeywordContext<'_, '_>) -> Result<Box<dyn Check>> {
        compile_count(ctx, *self)
    }
}

fn compile_count(ctx: &mut KeywordContext<'_, '_>, count: Count) -> Result<Box<dyn Check>> {
    let limit = limit(ctx)?;
    Ok(check(move |data, scope| {
        let Some(n) = count.measure(data) else {
            return true;
        };
        let valid = if count.is_min() { n >= limit } else { n <= limit };
        if !valid {
            scope.report(count.message(limit), json!({ "limit": limit }));
        }
        valid
    }))
}

fn compile_pattern(ctx: &mut KeywordContext<'_, '_>) -> Result<Box<dyn Check>> {
    let pattern = ctx
        .value()
        .as_str()
        .ok_or_else(|| ctx.error("value must be a string"))?;
    let re = Regex::new(pattern).map_err(|e| ctx.error(format!("invalid pattern: {e}")))?;
    Ok(check(move |data, scope| {
        let Some(s) = data.as_str() else {
            return true;
        };
        if re.is_match(s) {
            return true;
        }
        scope.report(
            format!("should match pattern \"{}\"", re.as_str()),
            json!({ "pattern": re.as_str() }),
        );
        false
    }))
}

fn compile_unique_items(ctx: &mut KeywordContext<'_, '_>) -> Result<Box<dyn Check>> {
    let enabled = ctx
        .value()
        .as_bool()
        .ok_or_else(|| ctx.error("value must be a boolean"))?;
    Ok(check(move |data, scope| {
        let Some(items) = data.as_array().filter(|_| enabled) else {
            return true;
        };
        for i in (0..items.len()).rev() {
            if let Some(j) = (0..i).rev().find(|&j| json_eq(&items[i], &items[j])) {
                scope.report(
                    format!("should NOT have duplicate items (items ## {j} and {i} are identical)"),
                    json!({ "i": i, "j": j }),
                );
                return false;
            }
        }
        true
    }))
}

fn compile_required(ctx: &mut KeywordContext<'_, '_>) -> Result<Box<dyn Check>> {
    let required: Vec<String> = ctx
        .value()
        .as_array()
        .ok_or_else(|| ctx.error("value must be an array of strings"))?
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| ctx.error("value must be an array of strings"))
        })
        .collect::<Result<_>>()?;
    Ok(check(move |data, scope| {
        let Some(map) = data.as_object() else {
            return true;
        };
        let mut valid = true;
        for name in required.iter().filter(|n| !map.contains_key(*n)) {
            report_missing(scope, name);
            valid = false;
            if !scope.all_errors() {
                break;
            }
        }
        valid
    }))
}

fn report_missing(scope: &mut Scope<'_>, name: &str) {
    scope.report(
        format!("should have required property '{name}'"),
        json!({ "missingProperty": name }),
    );
}
