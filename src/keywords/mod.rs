//! Built-in draft-07 vocabularies
//!
//! The compiler knows nothing about individual keywords; everything below
//! reaches it through [`Vocabulary`] definitions, exactly like keywords
//! added by callers.

mod applicator;
mod core;
mod format;
mod validation;

use serde_json::Value;

use crate::compiler::KeywordContext;
use crate::error::Result;
use crate::vocabulary::Vocabulary;

pub use self::core::{annotations, core};
pub use applicator::applicator;
pub use format::format;
pub use validation::validation;

/// Vocabularies installed in every registry, in evaluation order
pub fn draft07() -> Vec<Vocabulary> {
    vec![core(), validation(), applicator(), format(), annotations()]
}

/// Structural equality where `1` and `1.0` are the same number
pub fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => match (x.as_u64(), y.as_u64()) {
                (Some(x), Some(y)) => x == y,
                _ => x.as_f64() == y.as_f64(),
            },
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| json_eq(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(key, a)| y.get(key).map(|b| json_eq(a, b)).unwrap_or(false))
        }
        _ => a == b,
    }
}

/// Keyword value as a non-negative integer limit
fn limit(ctx: &KeywordContext<'_, '_>) -> Result<u64> {
    ctx.value()
        .as_u64()
        .or_else(|| {
            ctx.value()
                .as_f64()
                .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                .map(|f| f as u64)
        })
        .ok_or_else(|| ctx.error("value must be a non-negative integer"))
}

/// Keyword value as a number
fn number(ctx: &KeywordContext<'_, '_>) -> Result<f64> {
    ctx.value()
        .as_f64()
        .ok_or_else(|| ctx.error("value must be a number"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_eq_numbers() {
        assert!(json_eq(&json!(1), &json!(1.0)));
        assert!(json_eq(&json!({"a": [1, 2.0]}), &json!({"a": [1.0, 2]})));
        assert!(!json_eq(&json!(1), &json!("1")));
        assert!(!json_eq(&json!([1]), &json!([1, 1])));
        assert!(!json_eq(&json!({"a": 1}), &json!({"b": 1})));
    }

    #[test]
    fn test_vocabulary_layout() {
        let names: Vec<String> = draft07().into_iter().map(|v| v.name).collect();
        assert_eq!(names, vec!["core", "validation", "applicator", "format", "annotations"]);
        assert!(draft07()[0].protected);
    }
}
