use crate::Version;

/// A stable token identifying one logical document node across versions.
/// Survives path-expression changes (a node moving or gaining siblings), not renames of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIdentity(pub u64);

impl std::fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle to a node returned by a [`DocumentSource`]. Opaque to the graph; only the
/// source that produced it knows how to interpret the fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub file: usize,
    pub version: Version,
    pub index: usize,
}

/// Where an editable item's value lives: a virtual file, a path expression inside it,
/// and the attribute read from the matched node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentPath {
    pub virtual_path: String,
    pub xpath: String,
    pub attribute: String,
}

impl DocumentPath {
    pub fn new(
        virtual_path: impl Into<String>,
        xpath: impl Into<String>,
        attribute: impl Into<String>,
    ) -> Self {
        Self {
            virtual_path: virtual_path.into(),
            xpath: xpath.into(),
            attribute: attribute.into(),
        }
    }
}

/// Read access to the versioned game-data documents.
///
/// Implementations must distinguish at least the `Original`, `Merged` and `Computed`
/// views of a file. `Edited` has no document view; callers never request it.
pub trait DocumentSource {
    /// All nodes matching `xpath` in `virtual_path` for `version`, in document order.
    /// An unknown file or a path matching nothing yields an empty list.
    fn find_nodes(&self, virtual_path: &str, xpath: &str, version: Version) -> Vec<NodeRef>;

    /// Attribute value of `node`, if present.
    fn attribute(&self, node: NodeRef, name: &str) -> Option<String>;

    /// Stable identity attached to `node`, if the source tracks one.
    fn node_identity(&self, node: NodeRef) -> Option<NodeIdentity>;

    /// `node.get(attribute, default)`.
    fn attribute_or(&self, node: NodeRef, name: &str, default: &str) -> String {
        self.attribute(node, name)
            .unwrap_or_else(|| default.to_string())
    }
}
