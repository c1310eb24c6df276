//! Schema entries and the arena that owns them

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::cache::{CacheKey, SchemaCache};
use crate::validator::ValidatorTable;

/// Stable index of a schema entry in the registry arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub(crate) usize);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Compilation state of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilationState {
    NotStarted,
    InProgress,
    Done,
    Failed,
}

/// A schema document known to the registry (explicitly added, compiled,
/// or materialized from a resolved fragment)
#[derive(Debug, Clone)]
pub struct SchemaEntry {
    /// Normalized `$id`; empty for anonymous schemas. Doubles as base URI.
    pub(crate) id: String,
    pub(crate) document: Arc<Value>,
    /// Nested identifier -> JSON pointer inside `document`
    pub(crate) local_refs: HashMap<String, String>,
    /// Absolute `$ref` targets found while indexing
    pub(crate) ref_targets: Vec<String>,
    pub(crate) cache_key: Option<CacheKey>,
    pub(crate) is_meta: bool,
    /// Entry owning the document this one was cut from (itself for roots)
    pub(crate) root: EntryId,
    /// Pointer of this entry inside its root document
    pub(crate) pointer: String,
    pub(crate) state: CompilationState,
    /// Absolute reference -> entry it resolved to while compiling
    pub(crate) refs: HashMap<String, EntryId>,
}

impl SchemaEntry {
    pub fn id(&self) -> Option<&str> {
        if self.id.is_empty() {
            None
        } else {
            Some(&self.id)
        }
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    pub fn local_refs(&self) -> &HashMap<String, String> {
        &self.local_refs
    }

    pub fn ref_targets(&self) -> &[String] {
        &self.ref_targets
    }

    pub fn cache_key(&self) -> Option<&CacheKey> {
        self.cache_key.as_ref()
    }

    pub fn is_meta(&self) -> bool {
        self.is_meta
    }

    pub fn state(&self) -> CompilationState {
        self.state
    }

    pub fn refs(&self) -> &HashMap<String, EntryId> {
        &self.refs
    }

    pub fn root(&self) -> EntryId {
        self.root
    }

    pub fn is_fragment(&self) -> bool {
        !self.pointer.is_empty()
    }

    /// True when the document declares `"$async": true`
    pub fn is_async(&self) -> bool {
        self.document
            .get("$async")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Location of a fragment entry: root entry plus pointer inside it
pub(crate) type FragmentKey = (EntryId, String);

/// Arena of entries plus the lookup tables over it
#[derive(Debug, Default)]
pub(crate) struct SchemaStore {
    pub entries: Vec<Option<SchemaEntry>>,
    /// Schemas named by explicit key (or `$id`) via `add_schema`
    pub schemas: HashMap<String, EntryId>,
    /// Schemas registered under their `$id`
    pub refs: HashMap<String, EntryId>,
    pub fragments: HashMap<FragmentKey, EntryId>,
    pub cache: SchemaCache,
    pub table: ValidatorTable,
}

impl SchemaStore {
    pub fn get(&self, id: EntryId) -> Option<&SchemaEntry> {
        self.entries.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut SchemaEntry> {
        self.entries.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Insert an entry built from the id it is about to receive
    pub fn insert(&mut self, build: impl FnOnce(EntryId) -> SchemaEntry) -> EntryId {
        let id = EntryId(self.entries.len());
        self.entries.push(Some(build(id)));
        id
    }

    /// Look up a schema by key or `$id`
    pub fn lookup(&self, key: &str) -> Option<EntryId> {
        self.schemas
            .get(key)
            .or_else(|| self.refs.get(key))
            .copied()
            .filter(|id| self.get(*id).is_some())
    }

    pub fn is_taken(&self, key: &str) -> bool {
        self.schemas.contains_key(key) || self.refs.contains_key(key)
    }

    /// Drop an entry from every table, evicting cache and validator slot.
    /// Fragments cut from it go too, and entries that referenced any of
    /// them are reset so they resolve again on their next compile.
    pub fn remove(&mut self, id: EntryId) -> Option<SchemaEntry> {
        let mut removed = Vec::new();
        let entry = self.detach(id, &mut removed)?;
        self.invalidate_dependents(removed);
        Some(entry)
    }

    fn detach(&mut self, id: EntryId, removed: &mut Vec<EntryId>) -> Option<SchemaEntry> {
        let entry = self.entries.get_mut(id.0)?.take()?;
        removed.push(id);
        if let Some(key) = &entry.cache_key {
            if self.cache.get(key) == Some(id) {
                self.cache.delete(key);
            }
        }
        self.table.clear(id);
        self.schemas.retain(|_, target| *target != id);
        self.refs.retain(|_, target| *target != id);

        let orphans: Vec<EntryId> = self
            .fragments
            .iter()
            .filter(|((root, _), fragment)| *root == id || **fragment == id)
            .map(|(_, fragment)| *fragment)
            .collect();
        self.fragments
            .retain(|(root, _), fragment| *root != id && *fragment != id);
        for orphan in orphans {
            if orphan != id {
                self.detach(orphan, removed);
            }
        }
        Some(entry)
    }

    /// Reset an entry to `NotStarted`, together with every entry whose
    /// compiled references lead to it
    pub fn invalidate(&mut self, id: EntryId) {
        if let Some(entry) = self.get_mut(id) {
            entry.state = CompilationState::NotStarted;
            entry.refs.clear();
        }
        self.table.clear(id);
        self.invalidate_dependents(vec![id]);
    }

    fn invalidate_dependents(&mut self, mut pending: Vec<EntryId>) {
        while let Some(target) = pending.pop() {
            for (index, slot) in self.entries.iter_mut().enumerate() {
                let Some(entry) = slot else {
                    continue;
                };
                if !entry.refs.values().any(|id| *id == target) {
                    continue;
                }
                entry.state = CompilationState::NotStarted;
                entry.refs.clear();
                let id = EntryId(index);
                self.table.clear(id);
                tracing::debug!(entry = %id, target = %target, "dependent schema reset");
                pending.push(id);
            }
        }
    }

    /// Entry for the subschema at `pointer` inside the document of `root`,
    /// created on first use. The flag is true when it was just created.
    pub fn fragment(&mut self, root: EntryId, base: String, pointer: String, schema: Value) -> (EntryId, bool) {
        let key = (root, pointer);
        if let Some(&id) = self.fragments.get(&key) {
            if self.get(id).is_some() {
                return (id, false);
            }
        }
        let is_meta = self.get(root).map(|e| e.is_meta).unwrap_or(false);
        let pointer = key.1.clone();
        let id = self.insert(|_| SchemaEntry {
            id: base,
            document: Arc::new(schema),
            local_refs: HashMap::new(),
            ref_targets: Vec::new(),
            cache_key: None,
            is_meta,
            root,
            pointer,
            state: CompilationState::NotStarted,
            refs: HashMap::new(),
        });
        self.fragments.insert(key, id);
        tracing::debug!(entry = %id, root = %root, "fragment materialized");
        (id, true)
    }

    /// Ids of all live entries
    pub fn live(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_some())
            .map(|(i, _)| EntryId(i))
    }
}
