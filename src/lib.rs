//! Core library for a versioned game-object editor.
//! Loads objects from XML documents as named items with four value versions (original, merged,
//! computed, edited), keeps derived values consistent through a lazy dependency graph, follows
//! references between objects, and persists user overrides as a keyed patch file.

pub mod document;
mod expand;
mod graph;
mod item;
mod object;
mod patch;
mod registry;
pub mod statics;
mod version;
pub mod xml;
mod xpath;

pub use document::{DocumentPath, DocumentSource, NodeIdentity, NodeRef};
pub use expand::{
    ComputedDescriptor, Descriptor, EditableDescriptor, ExpandError, Expander, GroupDescriptor,
    join_xpath,
};
pub use graph::DisplayRows;
pub use item::{
    ComputeArgs, ComputeError, ComputeFn, ComputedItem, EditableItem, Item, ItemKind, ViewFn,
    format_number,
};
pub use object::{ItemRef, Object, ObjectId};
pub use patch::{BadIdentityKey, IdentityKey, Patch, PatchError, PatchStore};
pub use registry::{CategoryBuilder, Registry, RegistryConfig, RegistryError};
pub use version::{Version, VersionMap};
pub use xml::{DocumentFile, FileFormat, XmlDocument};
pub use xpath::XPathError;
