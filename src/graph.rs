//! Value-graph operations. Items are addressed by [`ItemRef`] and all mutation goes through
//! the registry, which owns every object and therefore every item.
//!
//! Invalidation is a synchronous depth-first cascade over `dependents`; nothing is recomputed
//! until it is read again, except for items with an attached view, which are refreshed once
//! the whole cascade has finished.

use crate::item::{ComputeArgs, ComputeFn, Item, ItemKind};
use crate::object::{ItemRef, Object, ObjectId};
use crate::{Registry, Version, statics};
use indexmap::{IndexMap, IndexSet};
use std::collections::HashSet;
use std::rc::Rc;

/// Index-aligned rows per version, as returned by [`Registry::display_rows`].
pub type DisplayRows = IndexMap<Version, Vec<Option<ItemRef>>>;

enum Resolve {
    Cached(String),
    Empty,
    Document,
    SeedFromMerged,
    Compute(Vec<Option<ItemRef>>, ComputeFn),
}

impl Registry {
    /// The item's value for `version`, computing and caching it on a miss.
    pub fn value(&mut self, item: ItemRef, version: Version) -> String {
        let resolve = match self.item(item).cached(version) {
            Some(cached) => Resolve::Cached(cached.to_string()),
            None => match self.item(item).kind() {
                ItemKind::Placeholder { .. } => Resolve::Empty,
                ItemKind::Editable(_) if version == Version::Edited => Resolve::SeedFromMerged,
                ItemKind::Editable(_) => Resolve::Document,
                ItemKind::Computed(computed) => Resolve::Compute(
                    computed.dependencies[version].clone(),
                    Rc::clone(&computed.compute),
                ),
            },
        };

        let value = match resolve {
            Resolve::Cached(value) => return value,
            Resolve::Empty => return statics::EMPTY_VALUE.to_string(),
            Resolve::SeedFromMerged => self.value(item, Version::Merged),
            Resolve::Document => {
                let doc = Rc::clone(&self.document);
                self.item(item)
                    .read_document(doc.as_ref(), version)
                    .unwrap_or_default()
            }
            Resolve::Compute(dependencies, compute) => {
                self.compute(item, version, &dependencies, &compute)
            }
        };

        self.item_mut(item).cache[version] = Some(value.clone());
        if self.item(item).is_reference() {
            self.update_reference_from(item, version, &value);
        }
        value
    }

    fn compute(
        &mut self,
        item: ItemRef,
        version: Version,
        dependencies: &[Option<ItemRef>],
        compute: &ComputeFn,
    ) -> String {
        if !self.computing.insert((item, version)) {
            tracing::error!(
                item = %self.item(item).name(),
                %version,
                "dependency cycle while computing"
            );
            return statics::ERROR_VALUE.to_string();
        }

        let values: Vec<Option<String>> = dependencies
            .iter()
            .map(|dependency| dependency.map(|d| self.value(d, version)))
            .collect();
        self.computing.remove(&(item, version));

        match compute(ComputeArgs::new(&values)) {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(item = %self.item(item).name(), %version, %err, "compute failed");
                statics::ERROR_VALUE.to_string()
            }
        }
    }

    /// Overwrite the cached value and invalidate (not recompute) every dependent for `version`.
    pub fn set_value(&mut self, item: ItemRef, version: Version, value: impl Into<String>) {
        if self.item(item).is_placeholder() {
            return;
        }
        let value = value.into();
        self.item_mut(item).cache[version] = Some(value.clone());

        let mut visited = IndexSet::new();
        visited.insert(item);
        self.reset_dependents(item, version, &mut visited);

        if self.item(item).is_reference() {
            self.update_reference_from(item, version, &value);
        }
        self.refresh_views(visited, version);
    }

    /// Clear the cached value for `version` only, and every dependent's for that version.
    pub fn reset_item(&mut self, item: ItemRef, version: Version) {
        let mut visited = IndexSet::new();
        self.reset_cascade(item, version, &mut visited);
        self.refresh_views(visited, version);
    }

    fn reset_cascade(&mut self, item: ItemRef, version: Version, visited: &mut IndexSet<ItemRef>) {
        if !visited.insert(item) || self.item(item).is_placeholder() {
            return;
        }
        self.item_mut(item).cache[version] = None;
        self.reset_dependents(item, version, visited);
    }

    fn reset_dependents(
        &mut self,
        item: ItemRef,
        version: Version,
        visited: &mut IndexSet<ItemRef>,
    ) {
        let dependents: Vec<ItemRef> = self.item(item).dependents[version]
            .iter()
            .copied()
            .collect();
        for dependent in dependents {
            self.reset_cascade(dependent, version, visited);
        }
    }

    fn refresh_views(&mut self, items: IndexSet<ItemRef>, version: Version) {
        for item in items {
            let Some(mut view) = self.item_mut(item).view.take() else {
                continue;
            };
            let value = self.value(item, version);
            view(version, &value);
            let slot = &mut self.item_mut(item).view;
            if slot.is_none() {
                *slot = Some(view);
            }
        }
    }

    /// Bind a presentation callback; it replaces any previous one.
    pub fn attach_view(&mut self, item: ItemRef, view: impl FnMut(Version, &str) + 'static) {
        self.item_mut(item).view = Some(Box::new(view));
    }

    pub fn detach_view(&mut self, item: ItemRef) {
        self.item_mut(item).view = None;
    }

    /// Editable: the edited value differs from the merged one.
    /// Computed: the edited and merged dependency sets differ (a reference was swapped), or the
    /// item has a non-empty value and any dependency is modified.
    pub fn is_modified(&mut self, item: ItemRef) -> bool {
        self.is_modified_inner(item, &mut HashSet::new())
    }

    fn is_modified_inner(&mut self, item: ItemRef, visited: &mut HashSet<ItemRef>) -> bool {
        if !visited.insert(item) {
            return false;
        }
        let dependencies = match self.item(item).kind() {
            ItemKind::Placeholder { .. } => return false,
            ItemKind::Editable(_) => None,
            ItemKind::Computed(computed) => Some((
                computed.dependencies[Version::Edited].clone(),
                computed.dependencies[Version::Merged].clone(),
            )),
        };
        let Some((edited, merged)) = dependencies else {
            return self.value(item, Version::Edited) != self.value(item, Version::Merged);
        };

        if edited != merged {
            return true;
        }
        if self.value(item, Version::Edited).is_empty() {
            return false;
        }
        edited
            .into_iter()
            .flatten()
            .any(|dependency| self.is_modified_inner(dependency, visited))
    }

    fn update_reference_from(&mut self, item: ItemRef, version: Version, target_name: &str) {
        let item_name = self.item(item).name().to_string();
        self.update_reference(item.object, &item_name, version, target_name);
    }

    /// Point `item_name`'s reference for `version` at the object named `target_name` (or at
    /// nothing if no such object is registered), then rewire the object's computed items.
    pub fn update_reference(
        &mut self,
        object: ObjectId,
        item_name: &str,
        version: Version,
        target_name: &str,
    ) {
        let target = self.by_name.get(target_name).copied();
        if target.is_none() && !target_name.is_empty() {
            tracing::debug!(
                object = %self.object(object).name(),
                item = item_name,
                target = target_name,
                %version,
                "reference target not registered"
            );
        }
        self.objects[object.0].set_reference(item_name, version, target);
        self.rebuild_dependencies(object, version);
    }

    /// Re-resolve every computed item of `object` for `version` and relink both directions.
    /// Unresolvable names keep their position as `None`.
    pub fn rebuild_dependencies(&mut self, object: ObjectId, version: Version) {
        let computed: Vec<(usize, Vec<String>)> = self
            .object(object)
            .items
            .values()
            .enumerate()
            .filter_map(|(slot, item)| {
                item.as_computed()
                    .map(|c| (slot, c.dependency_names().to_vec()))
            })
            .collect();

        for (slot, names) in computed {
            let me = ItemRef { object, slot };
            let old = match self.item_mut(me).kind_mut() {
                ItemKind::Computed(c) => std::mem::take(&mut c.dependencies[version]),
                _ => continue,
            };
            for dependency in old.into_iter().flatten() {
                self.item_mut(dependency).dependents[version].shift_remove(&me);
            }

            let new: Vec<Option<ItemRef>> = names
                .iter()
                .map(|name| self.get_item(object, name, version, false))
                .collect();
            for dependency in new.iter().flatten() {
                self.item_mut(*dependency).dependents[version].insert(me);
            }
            if let ItemKind::Computed(c) = self.item_mut(me).kind_mut() {
                c.dependencies[version] = new;
            }

            self.reset_item(me, version);
        }
    }

    /// Local item first, then each reference target for `version` in declaration order.
    /// Placeholders are skipped unless `allow_placeholders`.
    pub fn get_item(
        &self,
        object: ObjectId,
        name: &str,
        version: Version,
        allow_placeholders: bool,
    ) -> Option<ItemRef> {
        let mut path = Vec::new();
        self.get_item_inner(object, name, version, allow_placeholders, &mut path)
    }

    fn get_item_inner(
        &self,
        object: ObjectId,
        name: &str,
        version: Version,
        allow_placeholders: bool,
        path: &mut Vec<ObjectId>,
    ) -> Option<ItemRef> {
        if path.contains(&object) {
            tracing::error!(
                object = %self.object(object).name(),
                item = name,
                %version,
                "reference cycle; lookup pruned"
            );
            return None;
        }

        let current = self.object(object);
        if let Some((slot, _, item)) = current.items.get_full(name) {
            if allow_placeholders || !item.is_placeholder() {
                return Some(ItemRef { object, slot });
            }
        }

        path.push(object);
        let found = current
            .references
            .values()
            .filter_map(|targets| targets[version])
            .find_map(|target| {
                self.get_item_inner(target, name, version, allow_placeholders, path)
            });
        path.pop();
        found
    }

    /// Parallel rows for rendering one table with a column per version.
    ///
    /// Own visible items come first, identical in every version. Each reference then adds a
    /// separator row followed by the union of its targets' visible items, matched by name and
    /// padded with `None` where a version's target lacks the item (or has no target).
    pub fn display_rows(
        &self,
        object: ObjectId,
        skip_names: &[&str],
        include_refs: bool,
        version: Option<Version>,
    ) -> DisplayRows {
        let versions: Vec<Version> = match version {
            Some(version) => vec![version],
            None => Version::ALL.to_vec(),
        };
        let mut rows: DisplayRows = versions.iter().map(|v| (*v, Vec::new())).collect();
        let visible = |item: &Item| {
            !item.is_hidden() && !skip_names.iter().any(|skip| *skip == item.name())
        };

        let current = self.object(object);
        for (slot, item) in current.items.values().enumerate() {
            if visible(item) {
                for list in rows.values_mut() {
                    list.push(Some(ItemRef { object, slot }));
                }
            }
        }

        if !include_refs {
            return rows;
        }

        for (ref_name, targets) in &current.references {
            let mut names: IndexSet<&str> = IndexSet::new();
            for version in &versions {
                if let Some(target) = targets[*version] {
                    names.extend(
                        self.object(target)
                            .items
                            .values()
                            .filter(|&item| visible(item))
                            .map(|item| item.name()),
                    );
                }
            }
            if names.is_empty() {
                continue;
            }

            if let Some(slot) = current.item_slot(&Object::separator_name(ref_name)) {
                for list in rows.values_mut() {
                    list.push(Some(ItemRef { object, slot }));
                }
            }
            for name in names {
                for version in &versions {
                    let entry = targets[*version].and_then(|target| {
                        self.object(target)
                            .item_slot(name)
                            .map(|slot| ItemRef { object: target, slot })
                    });
                    rows[version].push(entry);
                }
            }
        }

        debug_assert!(self.rows_are_aligned(&rows));
        rows
    }

    /// Every version has the same number of rows, and every row has at least one item, all
    /// sharing a name.
    pub fn rows_are_aligned(&self, rows: &DisplayRows) -> bool {
        let Some(len) = rows.values().next().map(Vec::len) else {
            return true;
        };
        if rows.values().any(|list| list.len() != len) {
            return false;
        }
        (0..len).all(|index| {
            let names: IndexSet<&str> = rows
                .values()
                .filter_map(|list| list[index])
                .map(|item| self.item(item).name())
                .collect();
            names.len() == 1
        })
    }
}
