//! Asynchronous schema loading
//!
//! Compilation itself never suspends. [`SchemaRegistry::compile_async`]
//! retries the synchronous compile, loading whatever documents the previous
//! attempt found missing through a [`SchemaFetcher`].

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;

use crate::config::LoaderConfig;
use crate::error::{Result, SchemaError};
use crate::registry::SchemaRegistry;
use crate::resolver::normalize_id;
use crate::validator::Validator;

/// Source of schema documents referenced but not yet added
#[async_trait]
pub trait SchemaLoader: Send + Sync {
    async fn load(&self, uri: &str) -> Result<Value>;
}

/// Loads documents from a directory, mapping `base_uri` onto it
#[derive(Debug, Clone)]
pub struct FileLoader {
    dir: PathBuf,
    base_uri: Option<String>,
}

impl FileLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            base_uri: None,
        }
    }

    pub fn with_base_uri(mut self, base_uri: impl Into<String>) -> Self {
        self.base_uri = Some(base_uri.into());
        self
    }

    /// Loader described by the `[loader]` section, if it names a directory
    pub fn from_config(config: &LoaderConfig) -> Option<Self> {
        let dir = config.schema_dir.as_ref()?;
        let loader = Self::new(dir);
        Some(match &config.base_uri {
            Some(base) => loader.with_base_uri(base.clone()),
            None => loader,
        })
    }

    /// File holding `uri`. Only paths below `dir` are allowed.
    fn path_for(&self, uri: &str) -> Result<PathBuf> {
        let relative = match self.base_uri.as_deref().and_then(|b| uri.strip_prefix(b)) {
            Some(rest) => rest.to_string(),
            None => match url::Url::parse(uri) {
                Ok(url) => url.path().to_string(),
                Err(_) => uri.to_string(),
            },
        };
        let relative = Path::new(relative.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(SchemaError::LoadFailed {
                uri: uri.to_string(),
                message: "path escapes the schema directory".to_string(),
            });
        }

        let path = self.dir.join(relative);
        if path.extension().is_none() && !path.exists() {
            return Ok(path.with_extension("json"));
        }
        Ok(path)
    }
}

#[async_trait]
impl SchemaLoader for FileLoader {
    async fn load(&self, uri: &str) -> Result<Value> {
        let path = self.path_for(uri)?;
        let failed = |message: String| SchemaError::LoadFailed {
            uri: uri.to_string(),
            message,
        };
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| failed(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&content).map_err(|e| failed(e.to_string()))
    }
}

type Shared = std::result::Result<Arc<Value>, String>;

/// Wraps a loader so concurrent requests for one URI share a single load
pub struct SchemaFetcher<L> {
    loader: L,
    inflight: Mutex<HashMap<String, Arc<OnceCell<Shared>>>>,
}

impl<L: SchemaLoader> SchemaFetcher<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Load `uri` once; every caller waiting on it gets the same result.
    /// A failed load is forgotten so a later call can try again.
    pub async fn fetch(&self, uri: &str) -> Result<Arc<Value>> {
        let cell = self
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(uri.to_string())
            .or_default()
            .clone();

        let result = cell
            .get_or_init(|| async {
                tracing::debug!(%uri, "loading schema");
                self.loader
                    .load(uri)
                    .await
                    .map(Arc::new)
                    .map_err(|e| e.to_string())
            })
            .await
            .clone();

        result.map_err(|message| {
            self.inflight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(uri);
            SchemaError::LoadFailed {
                uri: uri.to_string(),
                message,
            }
        })
    }
}

impl SchemaRegistry {
    /// Compile a document, loading referenced documents that aren't known
    /// yet. Each round prefetches every missing document concurrently and
    /// retries; a reference into an already known document that still
    /// can't be resolved is an error.
    pub async fn compile_async<L: SchemaLoader>(
        &mut self,
        document: impl Into<Arc<Value>>,
        fetcher: &SchemaFetcher<L>,
    ) -> Result<Validator> {
        let document = document.into();
        loop {
            let (reference, schema) = match self.compile(document.clone()) {
                Err(SchemaError::MissingReference { reference, schema }) => (reference, schema),
                other => return other,
            };
            if schema.is_empty() || self.schema_entry(&schema).is_some() {
                return Err(SchemaError::MissingReference { reference, schema });
            }

            let mut wanted = self.missing_documents(&document)?;
            if !wanted.contains(&schema) {
                wanted.push(schema);
            }
            tracing::debug!(count = wanted.len(), "prefetching referenced schemas");

            let loaded = join_all(wanted.iter().map(|uri| fetcher.fetch(uri))).await;
            for (uri, loaded) in wanted.iter().zip(loaded) {
                self.add_loaded(uri, loaded?, fetcher).await?;
            }
        }
    }

    /// Add a fetched document under its URI, loading its meta-schema first
    /// when that is unknown too
    async fn add_loaded<L: SchemaLoader>(
        &mut self,
        uri: &str,
        document: Arc<Value>,
        fetcher: &SchemaFetcher<L>,
    ) -> Result<()> {
        if self.schema_entry(uri).is_some() {
            return Ok(());
        }
        let meta = document
            .get("$schema")
            .and_then(Value::as_str)
            .map(normalize_id);
        if let Some(meta) = meta.filter(|m| m != uri && self.schema_entry(m).is_none()) {
            let meta_document = fetcher.fetch(&meta).await?;
            self.add_meta_schema(meta_document, Some(&meta))?;
        }
        self.add_schema(document, Some(uri))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_for_base_uri() {
        let loader = FileLoader::new("/schemas").with_base_uri("https://example.com/");
        assert_eq!(
            loader.path_for("https://example.com/user.json").unwrap(),
            PathBuf::from("/schemas/user.json")
        );
        assert_eq!(
            loader.path_for("https://other.org/a/b.json").unwrap(),
            PathBuf::from("/schemas/a/b.json")
        );
    }

    #[test]
    fn test_path_for_rejects_escape() {
        let loader = FileLoader::new("/schemas");
        assert!(loader.path_for("../secret.json").is_err());
    }

    #[test]
    fn test_from_config_requires_dir() {
        assert!(FileLoader::from_config(&LoaderConfig::default()).is_none());
        let config = LoaderConfig {
            schema_dir: Some(PathBuf::from("schemas")),
            base_uri: Some("https://example.com/".to_string()),
        };
        let loader = FileLoader::from_config(&config).unwrap();
        assert_eq!(loader.base_uri.as_deref(), Some("https://example.com/"));
    }
}
