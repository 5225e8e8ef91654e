use crate::document::DocumentPath;
use crate::item::Item;
use crate::{Version, VersionMap, statics};
use indexmap::IndexMap;

/// Index of an object in its registry. Never reused: after a rebuild or `Registry::reset` an old
/// id resolves to nothing through `Registry::try_object`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub(crate) usize);

/// An item addressed by its owning object and its slot in that object's item map.
/// Slots are stable: replacing an item by name reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemRef {
    pub object: ObjectId,
    pub slot: usize,
}

/// A named bag of items plus per-version links to other objects.
#[derive(Debug, Default)]
pub struct Object {
    name: String,
    category: String,
    source: Option<DocumentPath>,
    pub(crate) items: IndexMap<String, Item>,
    pub(crate) references: IndexMap<String, VersionMap<Option<ObjectId>>>,
}

impl Object {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Remember the document node the object was built from (attribute left empty).
    pub fn with_source(mut self, virtual_path: &str, xpath: &str) -> Self {
        self.source = Some(DocumentPath::new(virtual_path, xpath, ""));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub(crate) fn set_category(&mut self, category: &str) {
        self.category = category.to_string();
    }

    pub fn source(&self) -> Option<&DocumentPath> {
        self.source.as_ref()
    }

    /// Register `item` by name. A later item with the same name replaces the earlier one.
    pub fn add_item(&mut self, item: Item) -> usize {
        let (slot, _) = self.items.insert_full(item.name().to_string(), item);
        slot
    }

    pub fn item(&self, name: &str) -> Option<&Item> {
        self.items.get(name)
    }

    pub fn item_slot(&self, name: &str) -> Option<usize> {
        self.items.get_index_of(name)
    }

    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Item names with a recorded reference, in declaration order.
    pub fn reference_names(&self) -> impl Iterator<Item = &str> {
        self.references.keys().map(String::as_str)
    }

    pub fn reference(&self, item_name: &str, version: Version) -> Option<ObjectId> {
        self.references.get(item_name)?[version]
    }

    /// Declare `item_name` as a reference slot ahead of resolution, fixing its position in
    /// the lookup order. Declaring the same name twice keeps the first declaration.
    pub fn declare_reference(&mut self, item_name: &str) {
        if self.references.contains_key(item_name) {
            tracing::warn!(
                object = %self.name,
                item = item_name,
                "duplicate reference declaration ignored"
            );
            return;
        }
        self.references
            .insert(item_name.to_string(), VersionMap::default());
        self.ensure_separator(item_name);
    }

    /// Record the target for one (item, version) pair, returning whether anything changed.
    pub(crate) fn set_reference(
        &mut self,
        item_name: &str,
        version: Version,
        target: Option<ObjectId>,
    ) -> bool {
        if !self.references.contains_key(item_name) {
            self.references
                .insert(item_name.to_string(), VersionMap::default());
            self.ensure_separator(item_name);
        }
        let Some(slots) = self.references.get_mut(item_name) else {
            return false;
        };
        let changed = slots[version] != target;
        slots[version] = target;
        changed
    }

    pub(crate) fn separator_name(item_name: &str) -> String {
        format!("{}{item_name}", statics::SEPARATOR_ITEM_PREFIX)
    }

    fn ensure_separator(&mut self, item_name: &str) {
        let name = Self::separator_name(item_name);
        if !self.items.contains_key(&name) {
            let display = self
                .items
                .get(item_name)
                .map(|i| i.display_name().to_string())
                .unwrap_or_else(|| item_name.to_string());
            self.add_item(Item::separator(name).with_display_name(display));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Object, ObjectId};
    use crate::Version;
    use crate::item::Item;

    #[test]
    fn add_item_replaces_by_name_and_keeps_slot() {
        let mut object = Object::new("weapon_a");
        let first = object.add_item(Item::placeholder("damage"));
        object.add_item(Item::placeholder("rate"));
        let replaced = object.add_item(Item::placeholder("damage").with_display_name("Damage"));
        assert_eq!(first, replaced);
        assert_eq!(object.len(), 2);
        assert_eq!(object.item("damage").unwrap().display_name(), "Damage");
    }

    #[test]
    fn references_are_per_version_and_add_a_separator() {
        let mut object = Object::new("weapon_a");
        assert!(object.set_reference("bullet", Version::Edited, Some(ObjectId(3))));
        assert!(!object.set_reference("bullet", Version::Edited, Some(ObjectId(3))));
        assert_eq!(object.reference("bullet", Version::Edited), Some(ObjectId(3)));
        assert_eq!(object.reference("bullet", Version::Merged), None);

        let separator = object.item(&Object::separator_name("bullet")).unwrap();
        assert!(separator.is_separator());
        assert!(separator.is_hidden());

        object.declare_reference("bullet");
        assert_eq!(object.reference_names().count(), 1);
    }
}
