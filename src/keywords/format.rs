use serde_json::json;

use crate::compiler::KeywordContext;
use crate::config::UnknownFormats;
use crate::error::{Result, SchemaError};
use crate::validator::{check, Check};
use crate::vocabulary::{JsonType, KeywordDefinition, Vocabulary};

pub fn format() -> Vocabulary {
    Vocabulary::new(
        "format",
        vec![KeywordDefinition::compile("format", compile_format).types([JsonType::String])],
    )
}

fn compile_format(ctx: &mut KeywordContext<'_, '_>) -> Result<Box<dyn Check>> {
    let name = ctx
        .value()
        .as_str()
        .ok_or_else(|| ctx.error("value must be a string"))?;
    let Some(format) = ctx.format(name) else {
        return match ctx.options().unknown_formats {
            UnknownFormats::Fail => Err(SchemaError::UnknownFormat(name.to_string())),
            UnknownFormats::Ignore => {
                tracing::warn!(format = %name, "unknown format ignored");
                Ok(check(|_, _| true))
            }
        };
    };
    let name = name.to_string();
    Ok(check(move |data, scope| {
        let Some(s) = data.as_str() else {
            return true;
        };
        if format.is_match(s) {
            return true;
        }
        scope.report(
            format!("should match format \"{name}\""),
            json!({ "format": name }),
        );
        false
    }))
}
