use crate::document::{DocumentPath, DocumentSource, NodeIdentity};
use crate::object::ItemRef;
use crate::{Version, VersionMap, statics};
use indexmap::IndexSet;
use std::rc::Rc;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ComputeError {
    #[error("dependency {index} is missing")]
    MissingDependency { index: usize },
    #[error("dependency {index} is not a number: {value:?}")]
    NotANumber { index: usize, value: String },
    #[error("{0}")]
    Invalid(String),
}

/// Values of a computed item's dependencies, positionally matching its dependency names.
/// An entry is `None` when the dependency could not be resolved (e.g. a missing reference target).
#[derive(Debug, Clone, Copy)]
pub struct ComputeArgs<'a> {
    values: &'a [Option<String>],
}

impl<'a> ComputeArgs<'a> {
    pub fn new(values: &'a [Option<String>]) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&'a str> {
        self.values.get(index)?.as_deref()
    }

    pub fn text(&self, index: usize) -> Result<&'a str, ComputeError> {
        self.get(index)
            .ok_or(ComputeError::MissingDependency { index })
    }

    pub fn number(&self, index: usize) -> Result<f64, ComputeError> {
        let text = self.text(index)?;
        text.trim()
            .parse::<f64>()
            .map_err(|_| ComputeError::NotANumber {
                index,
                value: text.to_string(),
            })
    }
}

pub type ComputeFn = Rc<dyn Fn(ComputeArgs<'_>) -> Result<String, ComputeError>>;

/// Presentation binding: called with the version and the freshly computed value.
pub type ViewFn = Box<dyn FnMut(Version, &str)>;

/// Integral values print without a fraction ("30"), everything else via ryu.
pub fn format_number(value: f64) -> String {
    if !value.is_finite() {
        return value.to_string();
    }
    if value.fract() == 0.0 && value.abs() < 1e15 {
        return format!("{}", value as i64);
    }
    let mut buf = ryu::Buffer::new();
    buf.format(value).to_string()
}

pub struct EditableItem {
    pub(crate) path: DocumentPath,
    pub(crate) identity_key: String,
    pub(crate) node_identity: Option<NodeIdentity>,
    pub(crate) is_reference: bool,
}

impl EditableItem {
    pub fn path(&self) -> &DocumentPath {
        &self.path
    }

    pub fn identity_key(&self) -> &str {
        &self.identity_key
    }

    pub fn node_identity(&self) -> Option<NodeIdentity> {
        self.node_identity
    }

    pub fn is_reference(&self) -> bool {
        self.is_reference
    }
}

pub struct ComputedItem {
    pub(crate) compute: ComputeFn,
    pub(crate) dependency_names: Vec<String>,
    pub(crate) dependencies: VersionMap<Vec<Option<ItemRef>>>,
}

impl ComputedItem {
    pub fn dependency_names(&self) -> &[String] {
        &self.dependency_names
    }

    pub fn dependencies(&self, version: Version) -> &[Option<ItemRef>] {
        &self.dependencies[version]
    }
}

pub enum ItemKind {
    Editable(EditableItem),
    Computed(ComputedItem),
    Placeholder { separator: bool },
}

/// A single named attribute with a cached value per version.
pub struct Item {
    name: String,
    display_name: String,
    description: String,
    read_only: bool,
    hidden: bool,
    kind: ItemKind,
    pub(crate) cache: VersionMap<Option<String>>,
    pub(crate) dependents: VersionMap<IndexSet<ItemRef>>,
    pub(crate) view: Option<ViewFn>,
}

impl std::fmt::Debug for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            ItemKind::Editable(_) => "editable",
            ItemKind::Computed(_) => "computed",
            ItemKind::Placeholder { .. } => "placeholder",
        };
        f.debug_struct("Item")
            .field("name", &self.name)
            .field("kind", &kind)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl Item {
    fn with_kind(name: impl Into<String>, kind: ItemKind) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            description: String::new(),
            read_only: !matches!(kind, ItemKind::Editable(_)),
            hidden: false,
            kind,
            cache: VersionMap::default(),
            dependents: VersionMap::default(),
            view: None,
        }
    }

    /// An item backed by `path`. The `Original` and `Merged` values are read eagerly;
    /// the node identity is captured from the `Merged` node.
    pub fn editable(doc: &dyn DocumentSource, name: impl Into<String>, path: DocumentPath) -> Self {
        let name = name.into();
        let identity_key = crate::patch::IdentityKey::new(&name, &path).to_string();
        let node_identity = doc
            .find_nodes(&path.virtual_path, &path.xpath, Version::Merged)
            .first()
            .and_then(|node| doc.node_identity(*node));

        let mut item = Self::with_kind(
            name,
            ItemKind::Editable(EditableItem {
                path,
                identity_key,
                node_identity,
                is_reference: false,
            }),
        );
        for version in [Version::Original, Version::Merged] {
            let value = item.read_document(doc, version);
            item.cache[version] = value;
        }
        item
    }

    /// A read-only item whose value is `compute` applied to the named dependencies' values.
    pub fn computed<F>(name: impl Into<String>, dependency_names: &[&str], compute: F) -> Self
    where
        F: Fn(ComputeArgs<'_>) -> Result<String, ComputeError> + 'static,
    {
        Self::computed_rc(
            name,
            dependency_names.iter().map(|d| d.to_string()).collect(),
            Rc::new(compute),
        )
    }

    pub fn computed_rc(
        name: impl Into<String>,
        dependency_names: Vec<String>,
        compute: ComputeFn,
    ) -> Self {
        Self::with_kind(
            name,
            ItemKind::Computed(ComputedItem {
                compute,
                dependency_names,
                dependencies: VersionMap::default(),
            }),
        )
    }

    pub fn placeholder(name: impl Into<String>) -> Self {
        Self::with_kind(name, ItemKind::Placeholder { separator: false })
    }

    pub fn separator(name: impl Into<String>) -> Self {
        let mut item = Self::with_kind(name, ItemKind::Placeholder { separator: true });
        item.hidden = true;
        item
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Computed and placeholder items stay read-only regardless.
    pub fn read_only(mut self, read_only: bool) -> Self {
        if matches!(self.kind, ItemKind::Editable(_)) {
            self.read_only = read_only;
        }
        self
    }

    pub fn hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }

    /// Mark an editable item as naming another object; resolving or setting its value rewires
    /// the owning object's reference.
    pub fn reference(mut self, is_reference: bool) -> Self {
        if let ItemKind::Editable(editable) = &mut self.kind {
            editable.is_reference = is_reference;
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn kind(&self) -> &ItemKind {
        &self.kind
    }

    pub(crate) fn kind_mut(&mut self) -> &mut ItemKind {
        &mut self.kind
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.kind, ItemKind::Placeholder { .. })
    }

    pub fn is_separator(&self) -> bool {
        matches!(self.kind, ItemKind::Placeholder { separator: true })
    }

    pub fn is_reference(&self) -> bool {
        matches!(&self.kind, ItemKind::Editable(e) if e.is_reference)
    }

    pub fn as_editable(&self) -> Option<&EditableItem> {
        match &self.kind {
            ItemKind::Editable(editable) => Some(editable),
            _ => None,
        }
    }

    pub fn as_computed(&self) -> Option<&ComputedItem> {
        match &self.kind {
            ItemKind::Computed(computed) => Some(computed),
            _ => None,
        }
    }

    pub fn cached(&self, version: Version) -> Option<&str> {
        self.cache[version].as_deref()
    }

    pub fn has_view(&self) -> bool {
        self.view.is_some()
    }

    /// Read this item's attribute from the document view for `version`.
    /// Returns `None` for non-document items and for `Edited`, which never comes from the document.
    pub(crate) fn read_document(
        &self,
        doc: &dyn DocumentSource,
        version: Version,
    ) -> Option<String> {
        let ItemKind::Editable(editable) = &self.kind else {
            return None;
        };
        if version == Version::Edited {
            return None;
        }

        let path = &editable.path;
        let nodes = doc.find_nodes(&path.virtual_path, &path.xpath, version);
        if nodes.len() > 1 {
            tracing::warn!(
                item = %self.name,
                xpath = %path.xpath,
                matches = nodes.len(),
                "path matched more than one node; using the first"
            );
        }
        Some(match nodes.first() {
            Some(node) => doc.attribute_or(*node, &path.attribute, statics::EMPTY_VALUE),
            None => statics::EMPTY_VALUE.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{ComputeArgs, ComputeError, Item, format_number};
    use crate::Version;
    use crate::document::DocumentPath;
    use crate::xml::XmlDocument;

    #[test]
    fn format_number_drops_integral_fraction() {
        assert_eq!(format_number(30.0), "30");
        assert_eq!(format_number(-4.0), "-4");
        assert_eq!(format_number(2.5), "2.5");
        assert_eq!(format_number(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(format_number(f64::INFINITY), "inf");
    }

    #[test]
    fn compute_args_report_missing_and_malformed_inputs() {
        let values = vec![Some("2".to_string()), None, Some("x".to_string())];
        let args = ComputeArgs::new(&values);
        assert_eq!(args.number(0), Ok(2.0));
        assert_eq!(args.number(1), Err(ComputeError::MissingDependency { index: 1 }));
        assert!(matches!(args.number(2), Err(ComputeError::NotANumber { index: 2, .. })));
        assert_eq!(args.text(5), Err(ComputeError::MissingDependency { index: 5 }));
    }

    #[test]
    fn editable_reads_original_and_merged_eagerly() {
        let mut doc = XmlDocument::new();
        doc.insert_str("w.xml", r#"<w><damage value="10"/><damage value="11"/></w>"#)
            .unwrap();
        doc.file_mut("w.xml")
            .unwrap()
            .set_attribute(Version::Merged, "./damage[1]", "value", "12")
            .unwrap();

        let path = DocumentPath::new("w.xml", "./damage[1]", "value");
        let item = Item::editable(&doc, "damage", path);
        assert_eq!(item.cached(Version::Original), Some("10"));
        assert_eq!(item.cached(Version::Merged), Some("12"));
        assert_eq!(item.cached(Version::Edited), None);
        assert!(item.as_editable().unwrap().node_identity().is_some());
        assert_eq!(
            item.as_editable().unwrap().identity_key(),
            "damage,w.xml,./damage[1],value"
        );

        // Multiple matches are tolerated and read from the first node.
        let item = Item::editable(&doc, "any", DocumentPath::new("w.xml", "./damage", "value"));
        assert_eq!(item.cached(Version::Original), Some("10"));
    }

    #[test]
    fn computed_and_placeholders_are_read_only() {
        let item = Item::computed("dps", &["rate"], |_| Ok(String::new())).read_only(false);
        assert!(item.is_read_only());
        assert!(Item::placeholder("gap").is_read_only());
        assert!(Item::separator("sep").is_hidden());
        assert!(Item::separator("sep").is_separator());
    }
}
