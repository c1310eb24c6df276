//! Configuration for the schema compiler
//!
//! [`Options`] is the option bag consumed by the registry and compiler.
//! [`SchemaConfig`] is its file/environment form, loaded from:
//! - Default values
//! - Config file (schemac.toml)
//! - Environment variables (SCHEMAC__*)
//!
//! ## Example config file (schemac.toml):
//! ```toml
//! [compiler]
//! validate_schema = "log"
//! all_errors = true
//! extend_refs = "ignore"
//! missing_meta = "strict"
//!
//! [loader]
//! schema_dir = "./schemas"
//! base_uri = "https://schemas.familiar.dev/"
//! ```

use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::cache::KeySerializer;

/// Whether added schemas are checked against their meta-schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "ValidateSchemaRepr", into = "ValidateSchemaRepr")]
pub enum ValidateSchema {
    /// Check and fail with `SchemaInvalid`
    #[default]
    Enabled,
    /// Never check
    Disabled,
    /// Check, but only log failures
    Log,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ValidateSchemaRepr {
    Flag(bool),
    Mode(String),
}

impl TryFrom<ValidateSchemaRepr> for ValidateSchema {
    type Error = String;

    fn try_from(repr: ValidateSchemaRepr) -> Result<Self, Self::Error> {
        match repr {
            ValidateSchemaRepr::Flag(true) => Ok(Self::Enabled),
            ValidateSchemaRepr::Flag(false) => Ok(Self::Disabled),
            ValidateSchemaRepr::Mode(mode) => match mode.as_str() {
                "log" => Ok(Self::Log),
                "true" => Ok(Self::Enabled),
                "false" => Ok(Self::Disabled),
                other => Err(format!("validate_schema must be true, false or \"log\", got {other:?}")),
            },
        }
    }
}

impl From<ValidateSchema> for ValidateSchemaRepr {
    fn from(mode: ValidateSchema) -> Self {
        match mode {
            ValidateSchema::Enabled => Self::Flag(true),
            ValidateSchema::Disabled => Self::Flag(false),
            ValidateSchema::Log => Self::Mode("log".to_string()),
        }
    }
}

/// Treatment of keywords next to `$ref`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtendRefs {
    /// Ignore siblings of `$ref` and log a warning
    #[default]
    Ignore,
    /// Reject schemas with siblings of `$ref`
    Fail,
    /// Validate siblings of `$ref` as well
    Apply,
}

/// Treatment of keywords no vocabulary defines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownKeywords {
    #[default]
    Ignore,
    Log,
    Fail,
}

/// Treatment of `format` values with no registered format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownFormats {
    #[default]
    Fail,
    Ignore,
}

/// What `validate_schema` does when no meta-schema can be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingMetaPolicy {
    /// Log a warning and treat the document as valid
    #[default]
    Permissive,
    /// Treat the document as invalid
    Strict,
}

/// Option bag governing the registry and compiler
#[derive(Debug, Clone)]
pub struct Options {
    pub validate_schema: ValidateSchema,
    /// Register compiled schemas under their `$id`
    pub add_used_schema: bool,
    pub serialize: KeySerializer,
    /// Collect every error instead of stopping at the first
    pub all_errors: bool,
    pub extend_refs: ExtendRefs,
    pub unknown_keywords: UnknownKeywords,
    pub unknown_formats: UnknownFormats,
    pub missing_meta: MissingMetaPolicy,
    /// Meta-schema used for documents without `$schema`
    pub default_meta: Option<String>,
    /// Install the draft-07 meta-schema
    pub meta: bool,
    /// Allow `add_keyword` to replace an unprotected keyword
    pub overwrite_keywords: bool,
    pub use_defaults: bool,
    pub coerce_types: bool,
    pub remove_additional: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            validate_schema: ValidateSchema::Enabled,
            add_used_schema: true,
            serialize: KeySerializer::Canonical,
            all_errors: false,
            extend_refs: ExtendRefs::Ignore,
            unknown_keywords: UnknownKeywords::Ignore,
            unknown_formats: UnknownFormats::Fail,
            missing_meta: MissingMetaPolicy::Permissive,
            default_meta: None,
            meta: true,
            overwrite_keywords: true,
            use_defaults: false,
            coerce_types: false,
            remove_additional: false,
        }
    }
}

impl Options {
    /// Options active while compiling meta-schemas: never mutate data.
    pub fn for_meta(&self) -> Self {
        Self {
            use_defaults: false,
            coerce_types: false,
            remove_additional: false,
            ..self.clone()
        }
    }

    /// True when any data-mutating option is on
    pub fn mutates_data(&self) -> bool {
        self.use_defaults || self.coerce_types || self.remove_additional
    }
}

/// Main configuration file for the schema compiler
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaConfig {
    #[serde(default)]
    pub compiler: CompilerConfig,

    #[serde(default)]
    pub loader: LoaderConfig,
}

/// Serializable subset of [`Options`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerConfig {
    #[serde(default)]
    pub validate_schema: ValidateSchema,

    #[serde(default = "default_true")]
    pub add_used_schema: bool,

    /// `false` disables structural cache keys
    #[serde(default = "default_true")]
    pub serialize: bool,

    #[serde(default)]
    pub all_errors: bool,

    #[serde(default)]
    pub extend_refs: ExtendRefs,

    #[serde(default)]
    pub unknown_keywords: UnknownKeywords,

    #[serde(default)]
    pub unknown_formats: UnknownFormats,

    #[serde(default)]
    pub missing_meta: MissingMetaPolicy,

    #[serde(default)]
    pub default_meta: Option<String>,

    #[serde(default = "default_true")]
    pub meta: bool,

    #[serde(default = "default_true")]
    pub overwrite_keywords: bool,
}

/// Where the async loader finds referenced documents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Directory holding referenced schema documents
    #[serde(default)]
    pub schema_dir: Option<PathBuf>,

    /// URI prefix mapped onto `schema_dir`
    #[serde(default)]
    pub base_uri: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            validate_schema: ValidateSchema::Enabled,
            add_used_schema: true,
            serialize: true,
            all_errors: false,
            extend_refs: ExtendRefs::Ignore,
            unknown_keywords: UnknownKeywords::Ignore,
            unknown_formats: UnknownFormats::Fail,
            missing_meta: MissingMetaPolicy::Permissive,
            default_meta: None,
            meta: true,
            overwrite_keywords: true,
        }
    }
}

impl From<&CompilerConfig> for Options {
    fn from(config: &CompilerConfig) -> Self {
        Self {
            validate_schema: config.validate_schema,
            add_used_schema: config.add_used_schema,
            serialize: if config.serialize {
                KeySerializer::Canonical
            } else {
                KeySerializer::Disabled
            },
            all_errors: config.all_errors,
            extend_refs: config.extend_refs,
            unknown_keywords: config.unknown_keywords,
            unknown_formats: config.unknown_formats,
            missing_meta: config.missing_meta,
            default_meta: config.default_meta.clone(),
            meta: config.meta,
            overwrite_keywords: config.overwrite_keywords,
            ..Options::default()
        }
    }
}

impl SchemaConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from a specific file
    pub fn load_from(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        let config_locations = ["schemac.toml", ".schemac.toml", "config/schemac.toml"];

        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        // XDG config directory
        if let Some(config_dir) = directories::ProjectDirs::from("dev", "familiar", "schemac") {
            let xdg_config = config_dir.config_dir().join("schemac.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // SCHEMAC__COMPILER__ALL_ERRORS=true
        builder = builder.add_source(
            Environment::with_prefix("SCHEMAC")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Save configuration to a file
    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Compiler options described by this configuration
    pub fn options(&self) -> Options {
        Options::from(&self.compiler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SchemaConfig::default();
        let options = config.options();
        assert_eq!(options.validate_schema, ValidateSchema::Enabled);
        assert!(options.add_used_schema);
        assert!(matches!(options.serialize, KeySerializer::Canonical));
        assert!(options.meta);
    }

    #[test]
    fn test_serialize_config() {
        let config = SchemaConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[compiler]"));
        assert!(toml_str.contains("validate_schema = true"));
    }

    #[test]
    fn test_validate_schema_log_mode() {
        let config: SchemaConfig = toml::from_str(
            r#"
            [compiler]
            validate_schema = "log"
            serialize = false
            missing_meta = "strict"
            "#,
        )
        .unwrap();
        let options = config.options();
        assert_eq!(options.validate_schema, ValidateSchema::Log);
        assert!(matches!(options.serialize, KeySerializer::Disabled));
        assert_eq!(options.missing_meta, MissingMetaPolicy::Strict);
    }

    #[test]
    fn test_validate_schema_rejects_unknown_mode() {
        let parsed: Result<SchemaConfig, _> = toml::from_str(
            r#"
            [compiler]
            validate_schema = "sometimes"
            "#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn test_meta_options_disable_mutation() {
        let options = Options {
            use_defaults: true,
            coerce_types: true,
            remove_additional: true,
            all_errors: true,
            ..Options::default()
        };
        assert!(options.mutates_data());
        let meta = options.for_meta();
        assert!(!meta.mutates_data());
        assert!(meta.all_errors);
    }
}
