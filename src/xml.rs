use crate::document::{DocumentSource, NodeIdentity, NodeRef};
use crate::xpath::{Anchor, Axis, NodeTest, PathExpr, Predicate, Step, XPathError};
use crate::{Version, statics};
use anyhow::{Context, bail};
use flate2::read::GzDecoder;
use indexmap::IndexMap;
use quick_xml::{Reader, events::BytesStart, events::Event};
use std::{collections::HashSet, fs, io::Read, path::Path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Xml,
    GzipXml,
}

impl FileFormat {
    /// A `.gz` extension (any case) or gzip leading bytes mean compressed.
    pub fn detect(path: &Path, bytes: &[u8]) -> Self {
        let gz_extension = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"));
        if gz_extension || bytes.starts_with(&statics::GZIP_MAGIC) {
            FileFormat::GzipXml
        } else {
            FileFormat::Xml
        }
    }
}

#[derive(Debug, Clone)]
pub struct XmlNode {
    pub tag: String,
    pub attributes: IndexMap<String, String>,
    children: Vec<usize>,
    parent: Option<usize>,
    identity: NodeIdentity,
}

impl XmlNode {
    pub fn identity(&self) -> NodeIdentity {
        self.identity
    }
}

/// One version of a parsed file. Node 0 is the root element.
/// `None` stands for the document node above the root when walking paths.
#[derive(Debug, Clone)]
pub struct XmlTree {
    nodes: Vec<XmlNode>,
}

impl XmlTree {
    fn parse(text: &str, next_identity: &mut u64) -> anyhow::Result<Self> {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut nodes: Vec<XmlNode> = Vec::new();
        let mut open: Vec<usize> = Vec::new();

        loop {
            let event = reader
                .read_event()
                .with_context(|| format!("parsing XML at byte {}", reader.buffer_position()))?;
            let (start, closes) = match event {
                Event::Start(start) => (start, false),
                Event::Empty(start) => (start, true),
                Event::End(_) => {
                    open.pop();
                    continue;
                }
                Event::Eof => break,
                _ => continue,
            };

            let parent = open.last().copied();
            if parent.is_none() && !nodes.is_empty() {
                bail!("XML has more than one root element");
            }

            let index = nodes.len();
            nodes.push(XmlNode {
                tag: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
                attributes: read_attributes(&reader, &start)?,
                children: Vec::new(),
                parent,
                identity: NodeIdentity(*next_identity),
            });
            *next_identity += 1;
            if let Some(parent) = parent {
                nodes[parent].children.push(index);
            }
            if !closes {
                open.push(index);
            }
        }

        if !open.is_empty() {
            bail!("XML ended with {} unclosed element(s)", open.len());
        }
        if nodes.is_empty() {
            bail!("XML has no root element");
        }
        Ok(Self { nodes })
    }

    pub fn node(&self, index: usize) -> Option<&XmlNode> {
        self.nodes.get(index)
    }

    pub fn select(&self, xpath: &str) -> Result<Vec<usize>, XPathError> {
        let expr = PathExpr::parse(xpath)?;
        Ok(self.evaluate(&expr))
    }

    fn evaluate(&self, expr: &PathExpr) -> Vec<usize> {
        let mut current: Vec<Option<usize>> = match expr.anchor {
            Anchor::Document => vec![None],
            Anchor::Context => vec![Some(0)],
        };

        for step in &expr.steps {
            let mut seen = HashSet::new();
            let mut next = Vec::new();
            for context in &current {
                for found in self.apply_step(*context, step) {
                    if seen.insert(found) {
                        next.push(found);
                    }
                }
            }
            current = next;
        }

        current.into_iter().flatten().collect()
    }

    fn apply_step(&self, context: Option<usize>, step: &Step) -> Vec<Option<usize>> {
        let bases = match step.axis {
            Axis::Child => vec![context],
            Axis::Descendant => self.descendants_or_self(context),
        };

        let mut out = Vec::new();
        for base in bases {
            match &step.test {
                NodeTest::SelfNode => out.push(base),
                NodeTest::Parent => {
                    if let Some(index) = base {
                        out.push(self.nodes[index].parent);
                    }
                }
                NodeTest::Any | NodeTest::Tag(_) => {
                    let matched: Vec<usize> = self
                        .children(base)
                        .into_iter()
                        .filter(|&c| match &step.test {
                            NodeTest::Tag(tag) => self.nodes[c].tag == *tag,
                            _ => true,
                        })
                        .collect();
                    out.extend(self.filter(matched, &step.predicates).into_iter().map(Some));
                }
            }
        }
        out
    }

    fn filter(&self, mut matched: Vec<usize>, predicates: &[Predicate]) -> Vec<usize> {
        for predicate in predicates {
            matched = match predicate {
                Predicate::Position(n) => matched.get(n - 1).copied().into_iter().collect(),
                Predicate::Last => matched.last().copied().into_iter().collect(),
                Predicate::HasAttribute(name) => matched
                    .into_iter()
                    .filter(|&i| self.nodes[i].attributes.contains_key(name))
                    .collect(),
                Predicate::AttributeEquals(name, value) => matched
                    .into_iter()
                    .filter(|&i| self.nodes[i].attributes.get(name) == Some(value))
                    .collect(),
            };
        }
        matched
    }

    fn children(&self, node: Option<usize>) -> Vec<usize> {
        match node {
            None => vec![0],
            Some(index) => self.nodes[index].children.clone(),
        }
    }

    fn descendants_or_self(&self, node: Option<usize>) -> Vec<Option<usize>> {
        let mut out = vec![node];
        let mut stack: Vec<usize> = self.children(node).into_iter().rev().collect();
        while let Some(index) = stack.pop() {
            out.push(Some(index));
            stack.extend(self.nodes[index].children.iter().rev());
        }
        out
    }
}

/// A virtual file with one tree per document version.
/// Later versions start as clones of the original, so node identities are shared.
#[derive(Debug, Clone)]
pub struct DocumentFile {
    original: XmlTree,
    merged: XmlTree,
    computed: XmlTree,
    next_identity: u64,
}

impl DocumentFile {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut next_identity = 0;
        let original = XmlTree::parse(text, &mut next_identity)?;
        Ok(Self {
            merged: original.clone(),
            computed: original.clone(),
            original,
            next_identity,
        })
    }

    pub fn tree(&self, version: Version) -> &XmlTree {
        match version {
            Version::Original => &self.original,
            Version::Merged => &self.merged,
            Version::Computed | Version::Edited => &self.computed,
        }
    }

    fn tree_mut(&mut self, version: Version) -> &mut XmlTree {
        match version {
            Version::Original => &mut self.original,
            Version::Merged => &mut self.merged,
            Version::Computed | Version::Edited => &mut self.computed,
        }
    }

    /// Replace `to` with a copy of `from`, e.g. to carry merged extensions into the computed view.
    pub fn derive(&mut self, from: Version, to: Version) {
        let tree = self.tree(from).clone();
        *self.tree_mut(to) = tree;
    }

    /// Set `name` on every node matching `xpath`. Returns the number of nodes changed.
    pub fn set_attribute(
        &mut self,
        version: Version,
        xpath: &str,
        name: &str,
        value: &str,
    ) -> Result<usize, XPathError> {
        let tree = self.tree_mut(version);
        let matched = tree.select(xpath)?;
        for &index in &matched {
            tree.nodes[index]
                .attributes
                .insert(name.to_string(), value.to_string());
        }
        Ok(matched.len())
    }

    pub fn rename(
        &mut self,
        version: Version,
        xpath: &str,
        tag: &str,
    ) -> Result<usize, XPathError> {
        let tree = self.tree_mut(version);
        let matched = tree.select(xpath)?;
        for &index in &matched {
            tree.nodes[index].tag = tag.to_string();
        }
        Ok(matched.len())
    }

    /// Append a new child under every node matching `parent_xpath`; each gets a fresh identity.
    pub fn insert_child(
        &mut self,
        version: Version,
        parent_xpath: &str,
        tag: &str,
        attributes: &[(&str, &str)],
    ) -> Result<usize, XPathError> {
        let mut next_identity = self.next_identity;
        let tree = self.tree_mut(version);
        let parents = tree.select(parent_xpath)?;
        for &parent in &parents {
            let index = tree.nodes.len();
            tree.nodes.push(XmlNode {
                tag: tag.to_string(),
                attributes: attributes
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                children: Vec::new(),
                parent: Some(parent),
                identity: NodeIdentity(next_identity),
            });
            next_identity += 1;
            tree.nodes[parent].children.push(index);
        }
        self.next_identity = next_identity;
        Ok(parents.len())
    }
}

/// In-memory document store keyed by virtual path.
#[derive(Debug, Clone, Default)]
pub struct XmlDocument {
    files: IndexMap<String, DocumentFile>,
}

impl XmlDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_str(&mut self, virtual_path: &str, text: &str) -> anyhow::Result<()> {
        let file = DocumentFile::parse(text).with_context(|| format!("parsing {virtual_path}"))?;
        self.files.insert(virtual_path.to_string(), file);
        Ok(())
    }

    pub fn load_path(&mut self, virtual_path: &str, path: &Path) -> anyhow::Result<()> {
        let bytes = fs::read(path).with_context(|| format!("reading {path:?}"))?;
        let text_bytes = match FileFormat::detect(path, &bytes) {
            FileFormat::Xml => bytes,
            FileFormat::GzipXml => {
                let mut decoder = GzDecoder::new(&bytes[..]);
                let mut out = Vec::new();
                decoder.read_to_end(&mut out).context("gzip decompress")?;
                out
            }
        };
        let text = std::str::from_utf8(&text_bytes)
            .with_context(|| format!("{path:?} is not valid UTF-8"))?;
        self.insert_str(virtual_path, text)
    }

    pub fn file(&self, virtual_path: &str) -> Option<&DocumentFile> {
        self.files.get(virtual_path)
    }

    pub fn file_mut(&mut self, virtual_path: &str) -> Option<&mut DocumentFile> {
        self.files.get_mut(virtual_path)
    }

    fn node(&self, node: NodeRef) -> Option<&XmlNode> {
        let (_, file) = self.files.get_index(node.file)?;
        file.tree(node.version).node(node.index)
    }
}

impl DocumentSource for XmlDocument {
    fn find_nodes(&self, virtual_path: &str, xpath: &str, version: Version) -> Vec<NodeRef> {
        let Some((file_index, _, file)) = self.files.get_full(virtual_path) else {
            return Vec::new();
        };
        match file.tree(version).select(xpath) {
            Ok(found) => found
                .into_iter()
                .map(|index| NodeRef {
                    file: file_index,
                    version,
                    index,
                })
                .collect(),
            Err(err) => {
                tracing::warn!(virtual_path, %err, "path expression rejected");
                Vec::new()
            }
        }
    }

    fn attribute(&self, node: NodeRef, name: &str) -> Option<String> {
        self.node(node)?.attributes.get(name).cloned()
    }

    fn node_identity(&self, node: NodeRef) -> Option<NodeIdentity> {
        self.node(node).map(XmlNode::identity)
    }
}

fn read_attributes(
    reader: &Reader<&[u8]>,
    start: &BytesStart<'_>,
) -> anyhow::Result<IndexMap<String, String>> {
    let mut attributes = IndexMap::new();
    for attr in start.attributes() {
        let attr = attr.context("malformed attribute")?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .decode_and_unescape_value(reader.decoder())
            .with_context(|| format!("attribute {key}"))?
            .into_owned();
        attributes.insert(key, value);
    }
    Ok(attributes)
}


#[cfg(test)]
mod tests {
    use super::{DocumentFile, FileFormat, XmlDocument};
    use crate::Version;
    use crate::document::DocumentSource;
    use flate2::{Compression, write::GzEncoder};
    use std::{io::Write, path::Path};

    const WARES: &str = r#"<?xml version="1.0"?>
<macros>
  <macro name="weapon_a" class="weapon">
    <properties>
      <damage value="10" />
      <rate value="2" />
    </properties>
    <wares>
      <ware id="energy" amount="5" />
      <ware id="ore" amount="7" />
    </wares>
  </macro>
  <macro name="weapon_b" class="weapon">
    <properties><damage value="4" /></properties>
  </macro>
</macros>
"#;

    fn tags(file: &DocumentFile, xpath: &str) -> Vec<String> {
        let tree = file.tree(Version::Original);
        tree.select(xpath)
            .unwrap()
            .into_iter()
            .map(|i| tree.node(i).unwrap().tag.clone())
            .collect()
    }

    #[test]
    fn select_supports_descendants_and_predicates() {
        let file = DocumentFile::parse(WARES).unwrap();
        assert_eq!(tags(&file, ".//damage").len(), 2);
        assert_eq!(tags(&file, "//macro[@name='weapon_b']/properties/damage").len(), 1);
        assert_eq!(tags(&file, "/macros/macro[1]/wares/ware[2]"), vec!["ware"]);
        assert_eq!(tags(&file, "/macros/macro[last()]"), vec!["macro"]);
        assert_eq!(tags(&file, "//ware/.."), vec!["wares"]);
        assert_eq!(tags(&file, "."), vec!["macros"]);
        assert!(tags(&file, "/other").is_empty());
    }

    #[test]
    fn positions_are_per_parent() {
        let file = DocumentFile::parse(WARES).unwrap();
        // First <damage> under each <properties>, not the first in the document.
        assert_eq!(tags(&file, "//properties/damage[1]").len(), 2);
    }

    #[test]
    fn versions_share_identities_until_new_nodes_are_inserted() {
        let mut doc = XmlDocument::new();
        doc.insert_str("libraries/weapons.xml", WARES).unwrap();

        let file = doc.file_mut("libraries/weapons.xml").unwrap();
        file.set_attribute(Version::Merged, "//macro[@name='weapon_a']//damage", "value", "12")
            .unwrap();
        let wares_path = "//macro[@name='weapon_a']/wares";
        file.insert_child(Version::Merged, wares_path, "ware", &[("id", "gas")])
            .unwrap();

        let vp = "libraries/weapons.xml";
        let original = doc.find_nodes(vp, "//macro[1]//damage", Version::Original);
        let merged = doc.find_nodes(vp, "//macro[1]//damage", Version::Merged);
        assert_eq!(doc.attribute(original[0], "value").as_deref(), Some("10"));
        assert_eq!(doc.attribute(merged[0], "value").as_deref(), Some("12"));
        assert_eq!(doc.node_identity(original[0]), doc.node_identity(merged[0]));

        let wares = doc.find_nodes(vp, "//macro[1]/wares/ware", Version::Merged);
        assert_eq!(wares.len(), 3);
        let identities: std::collections::HashSet<_> =
            wares.iter().filter_map(|w| doc.node_identity(*w)).collect();
        assert_eq!(identities.len(), 3);
        assert_eq!(doc.attribute_or(wares[2], "amount", "0"), "0");
    }

    #[test]
    fn unknown_files_and_bad_paths_match_nothing() {
        let mut doc = XmlDocument::new();
        doc.insert_str("a.xml", "<root/>").unwrap();
        assert!(doc.find_nodes("b.xml", ".", Version::Original).is_empty());
        assert!(doc.find_nodes("a.xml", "a[0]", Version::Original).is_empty());
        assert_eq!(doc.find_nodes("a.xml", ".", Version::Edited).len(), 1);
    }

    #[test]
    fn parse_rejects_unbalanced_documents() {
        assert!(DocumentFile::parse("<a><b></a>").is_err());
        assert!(DocumentFile::parse("<a/><b/>").is_err());
        assert!(DocumentFile::parse("").is_err());
    }

    #[test]
    fn load_path_reads_plain_and_compressed_files() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("weapons.xml");
        std::fs::write(&plain, WARES).unwrap();

        // No .gz suffix: detected from the stream header.
        let packed = dir.path().join("weapons.dat");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(WARES.as_bytes()).unwrap();
        std::fs::write(&packed, encoder.finish().unwrap()).unwrap();

        let mut doc = XmlDocument::new();
        doc.load_path("plain.xml", &plain).unwrap();
        doc.load_path("packed.xml", &packed).unwrap();
        for virtual_path in ["plain.xml", "packed.xml"] {
            let rates = doc.find_nodes(virtual_path, "//rate", Version::Original);
            assert_eq!(doc.attribute(rates[0], "value").as_deref(), Some("2"));
        }

        assert_eq!(
            FileFormat::detect(Path::new("WEAPONS.XML.GZ"), b"<a/>"),
            FileFormat::GzipXml
        );
        assert_eq!(FileFormat::detect(&plain, b"<a/>"), FileFormat::Xml);
    }
}
