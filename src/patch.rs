use crate::document::{DocumentPath, DocumentSource, NodeIdentity};
use crate::{Version, statics};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("failed to read patch file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file exists but does not parse. Never treated as "no patches": the user may have
    /// hand-edited it and would lose every override on the next save.
    #[error("malformed patch file {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: json5::Error,
    },

    #[error("failed to serialize patches: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write patch file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("identity key {0:?} does not have the form name,virtual_path,xpath,attribute")]
pub struct BadIdentityKey(pub String);

/// The stable four-part key patches are stored under: name, virtual path, xpath, attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub name: String,
    pub path: DocumentPath,
}

impl IdentityKey {
    pub fn new(name: &str, path: &DocumentPath) -> Self {
        Self {
            name: name.to_string(),
            path: path.clone(),
        }
    }

    /// Names and virtual paths never contain the separator; xpaths may (inside predicates),
    /// and attributes are taken from the last field.
    pub fn parse(key: &str) -> Result<Self, BadIdentityKey> {
        let bad = || BadIdentityKey(key.to_string());
        let sep = statics::IDENTITY_KEY_SEPARATOR;
        let (name, rest) = key.split_once(sep).ok_or_else(bad)?;
        let (virtual_path, rest) = rest.split_once(sep).ok_or_else(bad)?;
        let (xpath, attribute) = rest.rsplit_once(sep).ok_or_else(bad)?;
        Ok(Self {
            name: name.to_string(),
            path: DocumentPath::new(virtual_path, xpath, attribute),
        })
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sep = statics::IDENTITY_KEY_SEPARATOR;
        write!(
            f,
            "{}{sep}{}{sep}{}{sep}{}",
            self.name, self.path.virtual_path, self.path.xpath, self.path.attribute
        )
    }
}

/// A persisted user override for one editable item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub identity_key: String,
    /// Parsed from the identity key; `None` for keys that do not parse.
    pub path: Option<DocumentPath>,
    pub value: String,
    pub node_identity: Option<NodeIdentity>,
}

impl Patch {
    pub fn new(identity_key: &str, value: &str, node_identity: Option<NodeIdentity>) -> Self {
        Self {
            identity_key: identity_key.to_string(),
            path: IdentityKey::parse(identity_key).ok().map(|k| k.path),
            value: value.to_string(),
            node_identity,
        }
    }

    fn fallback_key(&self) -> Option<FallbackKey> {
        let path = self.path.as_ref()?;
        Some((
            path.virtual_path.clone(),
            self.node_identity?,
            path.attribute.clone(),
        ))
    }
}

type FallbackKey = (String, NodeIdentity, String);

/// On-disk layout: `{ "patches": { "<identity key>": "<value>" } }`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PatchFile {
    #[serde(default)]
    patches: IndexMap<String, String>,
}

/// User edits indexed by identity key, with a secondary (virtual path, node identity, attribute)
/// index for items whose identity key changed between tool versions.
#[derive(Debug, Default)]
pub struct PatchStore {
    patches: IndexMap<String, Patch>,
    fallback: HashMap<FallbackKey, String>,
}

impl PatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `path`, resolving each patch's node identity against the live `Merged` document.
    /// A missing file is an empty store; a malformed one is an error.
    pub fn load(path: &Path, doc: &dyn DocumentSource) -> Result<Self, PatchError> {
        let mut store = Self::new();
        if !path.exists() {
            tracing::info!(path = %path.display(), "no patch file; starting with zero patches");
            return Ok(store);
        }

        let text = fs::read_to_string(path).map_err(|source| PatchError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: PatchFile = json5::from_str(&text).map_err(|source| PatchError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;

        for (key, value) in file.patches {
            let mut patch = Patch::new(&key, &value, None);
            match &patch.path {
                Some(doc_path) => {
                    patch.node_identity = doc
                        .find_nodes(&doc_path.virtual_path, &doc_path.xpath, Version::Merged)
                        .first()
                        .and_then(|node| doc.node_identity(*node));
                }
                None => {
                    tracing::warn!(key = %key, "patch key does not parse; no fallback matching")
                }
            }
            store.insert(patch);
        }

        tracing::info!(path = %path.display(), count = store.len(), "loaded patches");
        Ok(store)
    }

    pub fn save(&self, path: &Path) -> Result<(), PatchError> {
        let file = PatchFile {
            patches: self
                .patches
                .values()
                .map(|p| (p.identity_key.clone(), p.value.clone()))
                .collect(),
        };
        let mut text = serde_json::to_string_pretty(&file)?;
        text.push('\n');
        fs::write(path, text).map_err(|source| PatchError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), count = self.len(), "saved patches");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Patch> {
        self.patches.values()
    }

    pub fn get(&self, identity_key: &str) -> Option<&Patch> {
        self.patches.get(identity_key)
    }

    pub fn find_fallback(
        &self,
        virtual_path: &str,
        node_identity: NodeIdentity,
        attribute: &str,
    ) -> Option<&Patch> {
        let key = (virtual_path.to_string(), node_identity, attribute.to_string());
        self.patches.get(self.fallback.get(&key)?)
    }

    /// Insert or replace the patch stored under `patch.identity_key`.
    /// A replaced patch keeps its position in the file.
    pub fn insert(&mut self, patch: Patch) {
        if let Some(previous) = self.patches.get(&patch.identity_key) {
            if let Some(fallback) = previous.fallback_key() {
                if self.fallback.get(&fallback) == Some(&patch.identity_key) {
                    self.fallback.remove(&fallback);
                }
            }
        }
        if let Some(fallback) = patch.fallback_key() {
            if let Some(previous) = self.fallback.insert(fallback, patch.identity_key.clone()) {
                tracing::warn!(
                    previous = %previous,
                    key = %patch.identity_key,
                    "two patches resolve to the same document node"
                );
            }
        }
        self.patches.insert(patch.identity_key.clone(), patch);
    }

    pub fn remove(&mut self, identity_key: &str) -> Option<Patch> {
        let patch = self.patches.shift_remove(identity_key)?;
        if let Some(fallback) = patch.fallback_key() {
            if self.fallback.get(&fallback).map(String::as_str) == Some(identity_key) {
                self.fallback.remove(&fallback);
            }
        }
        Some(patch)
    }

    /// Re-key the patch at `old_key` to `new_key`, keeping its value.
    pub fn migrate(
        &mut self,
        old_key: &str,
        new_key: &str,
        node_identity: Option<NodeIdentity>,
    ) -> Option<&Patch> {
        let old = self.remove(old_key)?;
        let node_identity = node_identity.or(old.node_identity);
        self.insert(Patch::new(new_key, &old.value, node_identity));
        self.patches.get(new_key)
    }
}
