use crate::document::{DocumentPath, DocumentSource, NodeIdentity};
use crate::item::Item;
use crate::object::{ItemRef, Object, ObjectId};
use crate::patch::{Patch, PatchError, PatchStore};
use crate::{Version, statics};
use indexmap::{IndexMap, IndexSet};
use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    rc::Rc,
};

/// Produces the objects of one category. Receives the registry so it can reach the document
/// and request other categories whose objects it references.
pub type CategoryBuilder = Rc<dyn Fn(&mut Registry) -> anyhow::Result<Vec<Object>>>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no builder registered for category {0:?}")]
    UnknownCategory(String),

    #[error("building category {category:?} failed: {source}")]
    Builder {
        category: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Patch(#[from] PatchError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Where user patches are loaded from and saved to.
    pub patch_path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            patch_path: PathBuf::from(statics::DEFAULT_PATCH_FILE_NAME),
        }
    }
}

impl RegistryConfig {
    pub fn with_patch_path(patch_path: impl Into<PathBuf>) -> Self {
        Self {
            patch_path: patch_path.into(),
        }
    }
}

/// Owns every object (grouped by category) and the patch store.
///
/// Lifecycle: `new` -> `load_patches` (or implicitly on the first category build) ->
/// `category_objects` as needed -> optional `reset` -> `save_patches`.
pub struct Registry {
    config: RegistryConfig,
    pub(crate) document: Rc<dyn DocumentSource>,
    pub(crate) objects: Vec<Object>,
    categories: IndexMap<String, IndexMap<String, ObjectId>>,
    pub(crate) by_name: HashMap<String, ObjectId>,
    builders: IndexMap<String, CategoryBuilder>,
    patches: PatchStore,
    patches_loaded: bool,
    live_keys: HashSet<String>,
    retired: HashSet<ObjectId>,
    pub(crate) computing: HashSet<(ItemRef, Version)>,
}

impl Registry {
    pub fn new(document: Rc<dyn DocumentSource>, config: RegistryConfig) -> Self {
        Self {
            config,
            document,
            objects: Vec::new(),
            categories: IndexMap::new(),
            by_name: HashMap::new(),
            builders: IndexMap::new(),
            patches: PatchStore::new(),
            patches_loaded: false,
            live_keys: HashSet::new(),
            retired: HashSet::new(),
            computing: HashSet::new(),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn document(&self) -> Rc<dyn DocumentSource> {
        Rc::clone(&self.document)
    }

    pub fn patch_path(&self) -> &Path {
        &self.config.patch_path
    }

    pub fn patches(&self) -> &PatchStore {
        &self.patches
    }

    pub fn register_category_builder(
        &mut self,
        category: &str,
        builder: impl Fn(&mut Registry) -> anyhow::Result<Vec<Object>> + 'static,
    ) {
        self.builders.insert(category.to_string(), Rc::new(builder));
    }

    /// Categories built so far, in build order.
    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(String::as_str)
    }

    /// Retired objects (replaced by a rebuild or dropped by a reset) read as empty;
    /// use [`Registry::try_object`] when a handle may be stale.
    pub fn object(&self, id: ObjectId) -> &Object {
        &self.objects[id.0]
    }

    pub fn try_object(&self, id: ObjectId) -> Option<&Object> {
        if self.retired.contains(&id) {
            return None;
        }
        self.objects.get(id.0)
    }

    pub fn try_item(&self, item: ItemRef) -> Option<&Item> {
        let (_, item) = self.try_object(item.object)?.items.get_index(item.slot)?;
        Some(item)
    }

    pub fn object_by_name(&self, name: &str) -> Option<ObjectId> {
        self.by_name.get(name).copied()
    }

    pub fn item(&self, item: ItemRef) -> &Item {
        &self.objects[item.object.0].items[item.slot]
    }

    pub(crate) fn item_mut(&mut self, item: ItemRef) -> &mut Item {
        &mut self.objects[item.object.0].items[item.slot]
    }

    /// The object's own item called `name`; see [`Registry::get_item`] to search references.
    pub fn find_item(&self, object: ObjectId, name: &str) -> Option<ItemRef> {
        let slot = self.object(object).item_slot(name)?;
        Some(ItemRef { object, slot })
    }

    /// Objects of `category`, building them on first use (or always, with `rebuild`).
    ///
    /// Builders may request other categories; that is how reference targets get loaded, so a
    /// builder must request its targets' categories before its objects are registered.
    pub fn category_objects(
        &mut self,
        category: &str,
        rebuild: bool,
    ) -> Result<Vec<ObjectId>, RegistryError> {
        if !rebuild {
            if let Some(ids) = self.categories.get(category) {
                return Ok(ids.values().copied().collect());
            }
        }

        self.ensure_patches_loaded()?;
        let builder = self
            .builders
            .get(category)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownCategory(category.to_string()))?;

        let mut previous = Vec::new();
        if self.categories.contains_key(category) {
            // Keep live edits: they are reapplied to the rebuilt objects from the patch store.
            self.update_patches();
            previous = self.detach_category(category);
        }

        let objects = builder(self).map_err(|source| RegistryError::Builder {
            category: category.to_string(),
            source,
        })?;

        let mut ids = IndexMap::new();
        for object in objects {
            let name = object.name().to_string();
            let id = self.register(object, category);
            if ids.insert(name.clone(), id).is_some() {
                tracing::warn!(category, object = %name, "duplicate object name in category");
            }
        }
        self.categories.insert(category.to_string(), ids.clone());

        for id in ids.values() {
            self.delayed_init(*id);
        }
        for id in ids.values() {
            self.attach_patches(*id);
        }
        if !previous.is_empty() {
            self.retarget(&previous);
            self.retire(&previous);
        }

        tracing::info!(category, count = ids.len(), "built category");
        Ok(ids.into_values().collect())
    }

    fn register(&mut self, mut object: Object, category: &str) -> ObjectId {
        object.set_category(category);
        let id = ObjectId(self.objects.len());

        for item in object.items() {
            if let Some(editable) = item.as_editable() {
                self.live_keys.insert(editable.identity_key().to_string());
            }
        }
        if let Some(previous) = self.by_name.insert(object.name().to_string(), id) {
            tracing::warn!(
                object = %object.name(),
                previous_category = %self.objects[previous.0].category(),
                category,
                "object name already registered; references now resolve to the newer object"
            );
        }

        self.objects.push(object);
        id
    }

    fn detach_category(&mut self, category: &str) -> Vec<ObjectId> {
        let Some(ids) = self.categories.shift_remove(category) else {
            return Vec::new();
        };
        let detached = ids.values().copied().collect();
        for (name, id) in ids {
            if self.by_name.get(&name) == Some(&id) {
                self.by_name.remove(&name);
            }
            for item in self.objects[id.0].items() {
                if let Some(editable) = item.as_editable() {
                    self.live_keys.remove(editable.identity_key());
                }
            }
        }
        detached
    }

    /// Point every live reference at `stale` objects to their rebuilt namesakes, and rewire
    /// computed items that resolved a dependency through them.
    fn retarget(&mut self, stale: &[ObjectId]) {
        let stale: HashSet<ObjectId> = stale.iter().copied().collect();
        let live: Vec<ObjectId> = (0..self.objects.len())
            .map(ObjectId)
            .filter(|id| !stale.contains(id) && !self.retired.contains(id))
            .collect();

        let mut references = Vec::new();
        for &id in &live {
            for (item_name, targets) in &self.object(id).references {
                for (version, target) in targets.iter() {
                    if let Some(target) = target.filter(|t| stale.contains(t)) {
                        let target_name = self.object(target).name().to_string();
                        references.push((id, item_name.clone(), version, target_name));
                    }
                }
            }
        }
        for (id, item_name, version, target_name) in references {
            tracing::debug!(
                object = %self.object(id).name(),
                item = %item_name,
                target = %target_name,
                %version,
                "reference retargeted to rebuilt object"
            );
            self.update_reference(id, &item_name, version, &target_name);
        }

        let mut rewire = IndexSet::new();
        for &id in &live {
            for item in self.object(id).items() {
                let Some(computed) = item.as_computed() else {
                    continue;
                };
                for version in Version::ALL {
                    let through_stale = computed
                        .dependencies(version)
                        .iter()
                        .flatten()
                        .any(|dependency| stale.contains(&dependency.object));
                    if through_stale {
                        rewire.insert((id, version));
                    }
                }
            }
        }
        for (id, version) in rewire {
            self.rebuild_dependencies(id, version);
        }
    }

    /// Unlink the objects from the live graph and drop their items. Their ids are never reused.
    fn retire(&mut self, ids: &[ObjectId]) {
        let mut links = Vec::new();
        for &id in ids {
            for (slot, item) in self.object(id).items().enumerate() {
                let Some(computed) = item.as_computed() else {
                    continue;
                };
                let me = ItemRef { object: id, slot };
                for version in Version::ALL {
                    for dependency in computed.dependencies(version).iter().flatten() {
                        links.push((*dependency, version, me));
                    }
                }
            }
        }
        for (dependency, version, me) in links {
            if let Some(object) = self.objects.get_mut(dependency.object.0) {
                if let Some(item) = object.items.get_index_mut(dependency.slot) {
                    item.1.dependents[version].shift_remove(&me);
                }
            }
        }

        for &id in ids {
            self.objects[id.0] = Object::default();
            self.retired.insert(id);
        }
    }

    /// Resolve every version's dependency graph once, then resolve every reference.
    fn delayed_init(&mut self, id: ObjectId) {
        for version in Version::ALL {
            self.rebuild_dependencies(id, version);
        }

        let references: Vec<(usize, String)> = self
            .object(id)
            .items()
            .enumerate()
            .filter(|(_, item)| item.is_reference())
            .map(|(slot, item)| (slot, item.name().to_string()))
            .collect();
        for (slot, name) in references {
            for version in Version::ALL {
                let target = self.value(ItemRef { object: id, slot }, version);
                self.update_reference(id, &name, version, &target);
            }
        }
    }

    /// Apply stored patches to the object's editable items: by identity key first, then by
    /// document node. A node match re-keys the patch to the item's current identity.
    fn attach_patches(&mut self, id: ObjectId) {
        for (item, key, path, node) in self.editables(id) {
            if let Some(patch) = self.patches.get(&key) {
                let value = patch.value.clone();
                self.set_value(item, Version::Edited, value);
                continue;
            }

            let Some(node) = node else {
                continue;
            };
            let Some(patch) = self
                .patches
                .find_fallback(&path.virtual_path, node, &path.attribute)
            else {
                continue;
            };
            if self.live_keys.contains(&patch.identity_key) {
                // Still owned by a live item; not a rename.
                continue;
            }

            let old_key = patch.identity_key.clone();
            let value = patch.value.clone();
            self.set_value(item, Version::Edited, value);
            self.patches.migrate(&old_key, &key, Some(node));
            tracing::info!(
                old = %old_key,
                new = %key,
                "patch format upgraded to current identity key"
            );
        }
    }

    fn editables(
        &self,
        id: ObjectId,
    ) -> Vec<(ItemRef, String, DocumentPath, Option<NodeIdentity>)> {
        self.object(id)
            .items()
            .enumerate()
            .filter_map(|(slot, item)| {
                let editable = item.as_editable()?;
                Some((
                    ItemRef { object: id, slot },
                    editable.identity_key().to_string(),
                    editable.path().clone(),
                    editable.node_identity(),
                ))
            })
            .collect()
    }

    fn live_editables(&self) -> Vec<ItemRef> {
        self.categories
            .values()
            .flat_map(|ids| ids.values())
            .flat_map(|id| self.editables(*id))
            .map(|(item, ..)| item)
            .collect()
    }

    /// Every modified editable item across the built categories.
    pub fn modified_items(&mut self) -> Vec<ItemRef> {
        self.live_editables()
            .into_iter()
            .filter(|item| self.is_modified(*item))
            .collect()
    }

    /// Drop the user override: `Edited` goes back to the `Merged` value.
    pub fn revert_item(&mut self, item: ItemRef) {
        let merged = self.value(item, Version::Merged);
        self.set_value(item, Version::Edited, merged);
    }

    /// Bring the patch store in line with the live items. Patches for items that are not
    /// currently loaded are kept.
    pub fn update_patches(&mut self) {
        for item in self.live_editables() {
            let Some(editable) = self.item(item).as_editable() else {
                continue;
            };
            let key = editable.identity_key().to_string();
            let node = editable.node_identity();

            if self.is_modified(item) {
                let value = self.value(item, Version::Edited);
                self.patches.insert(Patch::new(&key, &value, node));
            } else if self.patches.get(&key).is_some() {
                self.patches.remove(&key);
            }
        }
    }

    /// (Re)load the patch file. Fails if the file exists but is malformed.
    pub fn load_patches(&mut self) -> Result<(), RegistryError> {
        self.patches = PatchStore::load(&self.config.patch_path, self.document.as_ref())?;
        self.patches_loaded = true;
        Ok(())
    }

    fn ensure_patches_loaded(&mut self) -> Result<(), RegistryError> {
        if !self.patches_loaded {
            self.load_patches()?;
        }
        Ok(())
    }

    pub fn save_patches(&mut self) -> Result<(), RegistryError> {
        self.ensure_patches_loaded()?;
        self.update_patches();
        self.patches.save(&self.config.patch_path)?;
        Ok(())
    }

    /// Flush patches, then drop every object. Builders stay registered; handles taken before the
    /// reset are detected by [`Registry::try_object`] and never alias a newer object.
    pub fn reset(&mut self) -> Result<(), RegistryError> {
        self.save_patches()?;
        for index in 0..self.objects.len() {
            self.objects[index] = Object::default();
            self.retired.insert(ObjectId(index));
        }
        self.categories.clear();
        self.by_name.clear();
        self.live_keys.clear();
        self.computing.clear();
        Ok(())
    }
}
