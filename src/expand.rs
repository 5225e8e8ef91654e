//! Declarative object construction.
//!
//! A descriptor list says which document attributes become editable items, which functions
//! become computed items, and which repeated child structures become indexed item groups:
//!
//! ```text
//! editable  damage   ./bullet/damage  value
//! computed  dps      [rate, damage]
//! group     ./wares  ware  prefix "ware"
//!   editable  amount  .  amount        -> ware0_amount, ware1_amount, ...
//! end
//! ```

use crate::document::{DocumentPath, DocumentSource};
use crate::item::{ComputeArgs, ComputeError, ComputeFn, Item};
use crate::object::Object;
use crate::{Version, statics};
use indexmap::IndexMap;
use std::collections::HashSet;
use std::rc::Rc;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExpandError {
    #[error("group end at descriptor {index} has no matching group start")]
    UnmatchedGroupEnd { index: usize },
    #[error("group start at descriptor {index} is never closed")]
    UnclosedGroup { index: usize },
}

#[derive(Debug, Clone)]
pub struct EditableDescriptor {
    pub name: String,
    pub xpath: String,
    pub attribute: String,
    pub display_name: Option<String>,
    pub description: String,
    pub read_only: bool,
    pub is_reference: bool,
    pub hidden: bool,
}

impl EditableDescriptor {
    pub fn new(name: &str, xpath: &str, attribute: &str) -> Self {
        Self {
            name: name.to_string(),
            xpath: xpath.to_string(),
            attribute: attribute.to_string(),
            display_name: None,
            description: String::new(),
            read_only: false,
            is_reference: false,
            hidden: false,
        }
    }

    pub fn display(mut self, display_name: &str) -> Self {
        self.display_name = Some(display_name.to_string());
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// The attribute names another object; see [`Item::reference`].
    pub fn reference(mut self) -> Self {
        self.is_reference = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }
}

#[derive(Clone)]
pub struct ComputedDescriptor {
    pub name: String,
    pub display_name: Option<String>,
    pub description: String,
    /// Names of the items whose values are passed to `compute`, in order.
    pub dependencies: Vec<String>,
    pub compute: ComputeFn,
    pub hidden: bool,
}

impl std::fmt::Debug for ComputedDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputedDescriptor")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

impl ComputedDescriptor {
    pub fn new<F>(name: &str, dependencies: &[&str], compute: F) -> Self
    where
        F: Fn(ComputeArgs<'_>) -> Result<String, ComputeError> + 'static,
    {
        Self {
            name: name.to_string(),
            display_name: None,
            description: String::new(),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            compute: Rc::new(compute),
            hidden: false,
        }
    }

    pub fn display(mut self, display_name: &str) -> Self {
        self.display_name = Some(display_name.to_string());
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }
}

/// Opens a repeated structure: every `child_tag` child of the node at `xpath` gets its own copy
/// of the descriptors up to the matching [`Descriptor::GroupEnd`].
#[derive(Debug, Clone)]
pub struct GroupDescriptor {
    pub xpath: String,
    pub child_tag: String,
    pub name_prefix: String,
    pub display_prefix: Option<String>,
}

impl GroupDescriptor {
    pub fn new(xpath: &str, child_tag: &str, name_prefix: &str) -> Self {
        Self {
            xpath: xpath.to_string(),
            child_tag: child_tag.to_string(),
            name_prefix: name_prefix.to_string(),
            display_prefix: None,
        }
    }

    pub fn display(mut self, display_prefix: &str) -> Self {
        self.display_prefix = Some(display_prefix.to_string());
        self
    }
}

#[derive(Debug, Clone)]
pub enum Descriptor {
    Editable(EditableDescriptor),
    Computed(ComputedDescriptor),
    GroupStart(GroupDescriptor),
    GroupEnd,
}

impl From<EditableDescriptor> for Descriptor {
    fn from(d: EditableDescriptor) -> Self {
        Descriptor::Editable(d)
    }
}

impl From<ComputedDescriptor> for Descriptor {
    fn from(d: ComputedDescriptor) -> Self {
        Descriptor::Computed(d)
    }
}

impl From<GroupDescriptor> for Descriptor {
    fn from(d: GroupDescriptor) -> Self {
        Descriptor::GroupStart(d)
    }
}

/// Names introduced at one group level, and the prefix they get there.
struct Scope {
    prefix: String,
    names: HashSet<String>,
}

/// Expands descriptor lists against one virtual file.
pub struct Expander<'a> {
    doc: &'a dyn DocumentSource,
    virtual_path: String,
    replacements: IndexMap<String, String>,
}

impl<'a> Expander<'a> {
    pub fn new(doc: &'a dyn DocumentSource, virtual_path: &str) -> Self {
        Self {
            doc,
            virtual_path: virtual_path.to_string(),
            replacements: IndexMap::new(),
        }
    }

    /// Substitute `token` with `value` in every path expression before resolution, so one
    /// descriptor list can bind to differently named containers.
    pub fn replace(mut self, token: &str, value: &str) -> Self {
        self.replacements
            .insert(token.to_string(), value.to_string());
        self
    }

    /// Add the items described by `descriptors` to `object`, resolving relative paths
    /// against `base_xpath`.
    pub fn expand(
        &self,
        object: &mut Object,
        base_xpath: &str,
        descriptors: &[Descriptor],
    ) -> Result<(), ExpandError> {
        check_balanced(descriptors)?;
        let mut scopes = vec![Scope {
            prefix: String::new(),
            names: level_names(descriptors),
        }];
        self.expand_level(object, base_xpath, descriptors, &mut scopes, "");
        Ok(())
    }

    fn expand_level(
        &self,
        object: &mut Object,
        base_xpath: &str,
        descriptors: &[Descriptor],
        scopes: &mut Vec<Scope>,
        display_prefix: &str,
    ) {
        let prefix = scopes
            .last()
            .map(|s| s.prefix.clone())
            .unwrap_or_default();

        let mut index = 0;
        while index < descriptors.len() {
            match &descriptors[index] {
                Descriptor::Editable(d) => {
                    self.add_editable(object, base_xpath, d, &prefix, display_prefix);
                }
                Descriptor::Computed(d) => {
                    self.add_computed(object, d, scopes, &prefix, display_prefix);
                }
                Descriptor::GroupStart(group) => {
                    let end = matching_end(descriptors, index);
                    let body = &descriptors[index + 1..end];
                    self.expand_group(object, base_xpath, group, body, scopes, display_prefix);
                    index = end;
                }
                Descriptor::GroupEnd => {}
            }
            index += 1;
        }
    }

    fn expand_group(
        &self,
        object: &mut Object,
        base_xpath: &str,
        group: &GroupDescriptor,
        body: &[Descriptor],
        scopes: &mut Vec<Scope>,
        display_prefix: &str,
    ) {
        let group_xpath = join_xpath(base_xpath, &self.substitute(&group.xpath));
        let groups = self.find(&group_xpath);
        if groups.is_empty() {
            tracing::debug!(
                object = %object.name(),
                xpath = %group_xpath,
                "group node absent; skipped"
            );
            return;
        }
        if groups.len() > 1 {
            tracing::warn!(
                object = %object.name(),
                xpath = %group_xpath,
                matches = groups.len(),
                "group path matched more than one node"
            );
        }

        let child_xpath = format!("{group_xpath}/{}", self.substitute(&group.child_tag));
        let count = self.find(&child_xpath).len();
        let outer_prefix = scopes
            .last()
            .map(|s| s.prefix.clone())
            .unwrap_or_default();
        let label = group
            .display_prefix
            .as_deref()
            .unwrap_or(&group.name_prefix);

        for index in 0..count {
            let prefix = format!(
                "{outer_prefix}{}{index}{}",
                group.name_prefix,
                statics::GROUP_NAME_JOINER
            );
            let display = format!(
                "{display_prefix}{label} {index}{}",
                statics::GROUP_DISPLAY_JOINER
            );
            let indexed_xpath = format!("{child_xpath}[{}]", index + 1);

            scopes.push(Scope {
                prefix,
                names: level_names(body),
            });
            self.expand_level(object, &indexed_xpath, body, scopes, &display);
            scopes.pop();
        }
    }

    fn add_editable(
        &self,
        object: &mut Object,
        base_xpath: &str,
        d: &EditableDescriptor,
        prefix: &str,
        display_prefix: &str,
    ) {
        let xpath = join_xpath(base_xpath, &self.substitute(&d.xpath));
        let name = format!("{prefix}{}", d.name);
        let display = format!(
            "{display_prefix}{}",
            d.display_name.as_deref().unwrap_or(&d.name)
        );

        let resolved = !self.find(&xpath).is_empty();
        let item = if resolved {
            let path = DocumentPath::new(&self.virtual_path, &xpath, &d.attribute);
            Item::editable(self.doc, &name, path)
                .read_only(d.read_only)
                .reference(d.is_reference)
        } else {
            Item::placeholder(&name)
        };

        object.add_item(
            item.with_display_name(display)
                .with_description(&d.description)
                .hidden(d.hidden),
        );
        if resolved && d.is_reference {
            object.declare_reference(&name);
        }
    }

    fn add_computed(
        &self,
        object: &mut Object,
        d: &ComputedDescriptor,
        scopes: &[Scope],
        prefix: &str,
        display_prefix: &str,
    ) {
        let dependencies = d
            .dependencies
            .iter()
            .map(|dependency| {
                scopes
                    .iter()
                    .rev()
                    .find(|scope| scope.names.contains(dependency))
                    .map(|scope| format!("{}{dependency}", scope.prefix))
                    .unwrap_or_else(|| dependency.clone())
            })
            .collect();
        let display = format!(
            "{display_prefix}{}",
            d.display_name.as_deref().unwrap_or(&d.name)
        );

        object.add_item(
            Item::computed_rc(format!("{prefix}{}", d.name), dependencies, Rc::clone(&d.compute))
                .with_display_name(display)
                .with_description(&d.description)
                .hidden(d.hidden),
        );
    }

    fn find(&self, xpath: &str) -> Vec<crate::document::NodeRef> {
        self.doc
            .find_nodes(&self.virtual_path, xpath, Version::Merged)
    }

    fn substitute(&self, text: &str) -> String {
        self.replacements
            .iter()
            .fold(text.to_string(), |acc, (token, value)| acc.replace(token, value))
    }
}

/// Resolve `relative` against `base`. `.` is the base itself, `./x` and `.//x` descend from it,
/// and a leading `/` is already absolute.
pub fn join_xpath(base: &str, relative: &str) -> String {
    let relative = relative.trim();
    if base.is_empty() || relative.starts_with('/') {
        return relative.to_string();
    }
    if relative.is_empty() || relative == "." {
        return base.to_string();
    }
    match relative.strip_prefix("./") {
        Some(rest) => format!("{base}/{rest}"),
        None => format!("{base}/{relative}"),
    }
}

/// Names defined directly at this level (not inside nested groups).
fn level_names(descriptors: &[Descriptor]) -> HashSet<String> {
    let mut names = HashSet::new();
    let mut depth = 0usize;
    for descriptor in descriptors {
        match descriptor {
            Descriptor::GroupStart(_) => depth += 1,
            Descriptor::GroupEnd => depth = depth.saturating_sub(1),
            Descriptor::Editable(d) if depth == 0 => {
                names.insert(d.name.clone());
            }
            Descriptor::Computed(d) if depth == 0 => {
                names.insert(d.name.clone());
            }
            _ => {}
        }
    }
    names
}

fn check_balanced(descriptors: &[Descriptor]) -> Result<(), ExpandError> {
    let mut open = Vec::new();
    for (index, descriptor) in descriptors.iter().enumerate() {
        match descriptor {
            Descriptor::GroupStart(_) => open.push(index),
            Descriptor::GroupEnd => {
                open.pop()
                    .ok_or(ExpandError::UnmatchedGroupEnd { index })?;
            }
            _ => {}
        }
    }
    match open.pop() {
        Some(index) => Err(ExpandError::UnclosedGroup { index }),
        None => Ok(()),
    }
}

/// Index of the `GroupEnd` closing the `GroupStart` at `start`. Callers check balance first.
fn matching_end(descriptors: &[Descriptor], start: usize) -> usize {
    let mut depth = 0usize;
    for (index, descriptor) in descriptors.iter().enumerate().skip(start) {
        match descriptor {
            Descriptor::GroupStart(_) => depth += 1,
            Descriptor::GroupEnd => {
                depth -= 1;
                if depth == 0 {
                    return index;
                }
            }
            _ => {}
        }
    }
    descriptors.len()
}

#[cfg(test)]
mod tests {
    use super::{
        ComputedDescriptor, Descriptor, EditableDescriptor, ExpandError, Expander, GroupDescriptor,
        join_xpath,
    };
    use crate::Version;
    use crate::item::format_number;
    use crate::object::Object;
    use crate::xml::XmlDocument;

    const WEAPONS: &str = r#"<macros>
  <macro name="weapon_a">
    <properties>
      <damage value="10" />
      <rate value="2" />
    </properties>
    <production>
      <wares>
        <ware id="energy" amount="5" />
        <ware id="ore" amount="7" />
      </wares>
    </production>
  </macro>
</macros>"#;

    fn doc() -> XmlDocument {
        let mut doc = XmlDocument::new();
        doc.insert_str("weapons.xml", WEAPONS).unwrap();
        doc
    }

    #[test]
    fn join_xpath_handles_relative_forms() {
        assert_eq!(join_xpath("//m", "."), "//m");
        assert_eq!(join_xpath("//m", "./a/b"), "//m/a/b");
        assert_eq!(join_xpath("//m", ".//b"), "//m//b");
        assert_eq!(join_xpath("//m", "a"), "//m/a");
        assert_eq!(join_xpath("//m", "/abs"), "/abs");
        assert_eq!(join_xpath("", "./a"), "./a");
    }

    #[test]
    fn missing_paths_become_placeholders() {
        let doc = doc();
        let mut object = Object::new("weapon_a");
        let descriptors: Vec<Descriptor> = vec![
            EditableDescriptor::new("damage", ".//damage", "value").display("Damage").into(),
            EditableDescriptor::new("range", ".//range", "max").into(),
        ];
        Expander::new(&doc, "weapons.xml")
            .expand(&mut object, "//macro[@name='weapon_a']", &descriptors)
            .unwrap();

        let damage = object.item("damage").unwrap();
        assert_eq!(damage.display_name(), "Damage");
        assert_eq!(
            damage.as_editable().unwrap().path().xpath,
            "//macro[@name='weapon_a']//damage"
        );
        assert!(object.item("range").unwrap().is_placeholder());
    }

    #[test]
    fn groups_index_names_paths_and_local_dependencies() {
        let doc = doc();
        let mut object = Object::new("weapon_a");
        let descriptors: Vec<Descriptor> = vec![
            EditableDescriptor::new("rate", "./properties/rate", "value").into(),
            GroupDescriptor::new("./$container/wares", "ware", "ware")
                .display("Ware")
                .into(),
            EditableDescriptor::new("amount", ".", "amount").display("Amount").into(),
            ComputedDescriptor::new("per_shot", &["amount", "rate"], |args| {
                Ok(format_number(args.number(0)? / args.number(1)?))
            })
            .into(),
            Descriptor::GroupEnd,
        ];
        Expander::new(&doc, "weapons.xml")
            .replace("$container", "production")
            .expand(&mut object, "//macro[@name='weapon_a']", &descriptors)
            .unwrap();

        let amount = object.item("ware1_amount").unwrap();
        assert_eq!(amount.display_name(), "Ware 1: Amount");
        assert_eq!(
            amount.as_editable().unwrap().path().xpath,
            "//macro[@name='weapon_a']/production/wares/ware[2]"
        );
        assert_eq!(
            object
                .item("ware0_per_shot")
                .unwrap()
                .as_computed()
                .unwrap()
                .dependency_names(),
            ["ware0_amount".to_string(), "rate".to_string()]
        );
        assert!(object.item("ware2_amount").is_none());
    }

    #[test]
    fn nested_groups_compose_prefixes_and_paths() {
        let mut doc = XmlDocument::new();
        doc.insert_str(
            "turrets.xml",
            r#"<macro name="turret">
  <slots>
    <slot><ammo><a n="1" /><a n="2" /></ammo></slot>
    <slot><ammo><a n="3" /></ammo></slot>
  </slots>
</macro>"#,
        )
        .unwrap();
        let mut object = Object::new("turret");
        let descriptors: Vec<Descriptor> = vec![
            GroupDescriptor::new("./slots", "slot", "slot").display("Slot").into(),
            GroupDescriptor::new("./ammo", "a", "a").display("Ammo").into(),
            EditableDescriptor::new("n", ".", "n").into(),
            ComputedDescriptor::new("twice", &["n"], |args| {
                Ok(format_number(args.number(0)? * 2.0))
            })
            .into(),
            Descriptor::GroupEnd,
            Descriptor::GroupEnd,
        ];
        Expander::new(&doc, "turrets.xml")
            .expand(&mut object, ".", &descriptors)
            .unwrap();

        let first = object.item("slot0_a0_n").unwrap();
        assert_eq!(first.display_name(), "Slot 0: Ammo 0: n");
        assert_eq!(
            first.as_editable().unwrap().path().xpath,
            "./slots/slot[1]/ammo/a[1]"
        );
        assert_eq!(
            object.item("slot1_a0_n").unwrap().cached(Version::Original),
            Some("3")
        );
        assert!(object.item("slot0_a1_n").is_some());
        assert!(object.item("slot1_a1_n").is_none());
        assert_eq!(
            object
                .item("slot1_a0_twice")
                .unwrap()
                .as_computed()
                .unwrap()
                .dependency_names(),
            ["slot1_a0_n".to_string()]
        );
    }

    #[test]
    fn absent_group_is_skipped_and_unbalanced_markers_are_rejected() {
        let doc = doc();
        let mut object = Object::new("weapon_a");
        let descriptors: Vec<Descriptor> = vec![
            GroupDescriptor::new("./missing", "ware", "ware").into(),
            EditableDescriptor::new("amount", ".", "amount").into(),
            Descriptor::GroupEnd,
        ];
        let expander = Expander::new(&doc, "weapons.xml");
        expander
            .expand(&mut object, "//macro[@name='weapon_a']", &descriptors)
            .unwrap();
        assert!(object.is_empty());

        assert_eq!(
            expander.expand(&mut object, ".", &[Descriptor::GroupEnd]),
            Err(ExpandError::UnmatchedGroupEnd { index: 0 })
        );
        assert_eq!(
            expander.expand(
                &mut object,
                ".",
                &[Descriptor::GroupStart(GroupDescriptor::new(".", "x", "x"))]
            ),
            Err(ExpandError::UnclosedGroup { index: 0 })
        );
    }
}
