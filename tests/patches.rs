use objedit::{
    Descriptor, DocumentSource, EditableDescriptor, Expander, Object, PatchError, Registry,
    RegistryConfig, RegistryError, Version, XmlDocument,
};
use pretty_assertions::assert_eq;
use std::{path::Path, rc::Rc};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

const SHIPS: &str = r#"<macros>
  <macro name="ship_a">
    <properties>
      <hull max="1000" />
      <speed forward="250" />
    </properties>
  </macro>
  <macro name="ship_b">
    <properties>
      <hull max="4000" />
      <speed forward="90" />
    </properties>
  </macro>
</macros>"#;

const HULL_KEY: &str = "hull,ships.xml,//macro[@name='ship_a']/properties/hull,max";

fn ship_registry(patch_path: &Path) -> Result<Registry> {
    let mut doc = XmlDocument::new();
    doc.insert_str("ships.xml", SHIPS)?;
    let mut registry = Registry::new(Rc::new(doc), RegistryConfig::with_patch_path(patch_path));
    registry.register_category_builder("ships", |registry| {
        let doc = registry.document();
        let descriptors: Vec<Descriptor> = vec![
            EditableDescriptor::new("hull", "./properties/hull", "max").into(),
            EditableDescriptor::new("speed", "./properties/speed", "forward").into(),
        ];
        let mut objects = Vec::new();
        for node in doc.find_nodes("ships.xml", "//macro", Version::Merged) {
            let Some(name) = doc.attribute(node, "name") else {
                continue;
            };
            let base = format!("//macro[@name='{name}']");
            let mut object = Object::new(name);
            Expander::new(doc.as_ref(), "ships.xml").expand(&mut object, &base, &descriptors)?;
            objects.push(object);
        }
        Ok(objects)
    });
    Ok(registry)
}

fn edited(registry: &mut Registry, object: &str, name: &str) -> Result<String> {
    let id = registry.object_by_name(object).ok_or("object missing")?;
    let item = registry.find_item(id, name).ok_or("item missing")?;
    Ok(registry.value(item, Version::Edited))
}

#[test]
fn edits_survive_save_reset_and_a_fresh_registry() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("patches.json");

    let mut registry = ship_registry(&path)?;
    registry.category_objects("ships", false)?;
    let ship = registry.object_by_name("ship_a").ok_or("ship_a")?;
    let hull = registry.find_item(ship, "hull").ok_or("hull")?;
    registry.set_value(hull, Version::Edited, "1500");

    registry.reset()?;
    assert_eq!(registry.categories().count(), 0);
    let saved: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    assert_eq!(saved["patches"][HULL_KEY], "1500");
    assert_eq!(saved["patches"].as_object().map(|m| m.len()), Some(1));

    registry.category_objects("ships", false)?;
    assert_eq!(edited(&mut registry, "ship_a", "hull")?, "1500");

    let mut fresh = ship_registry(&path)?;
    fresh.category_objects("ships", false)?;
    assert_eq!(edited(&mut fresh, "ship_a", "hull")?, "1500");
    assert_eq!(edited(&mut fresh, "ship_b", "hull")?, "4000");
    Ok(())
}

#[test]
fn rebuilding_a_category_keeps_unsaved_edits() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut registry = ship_registry(&dir.path().join("patches.json"))?;
    registry.category_objects("ships", false)?;
    let ship = registry.object_by_name("ship_b").ok_or("ship_b")?;
    let speed = registry.find_item(ship, "speed").ok_or("speed")?;
    registry.set_value(speed, Version::Edited, "120");

    registry.category_objects("ships", true)?;
    assert_eq!(edited(&mut registry, "ship_b", "speed")?, "120");
    let key = "speed,ships.xml,//macro[@name='ship_b']/properties/speed,forward";
    assert!(registry.patches().get(key).is_some());
    Ok(())
}

#[test]
fn reverted_items_drop_their_patch() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("patches.json");
    std::fs::write(&path, format!("{{ \"patches\": {{ \"{HULL_KEY}\": \"900\" }} }}"))?;

    let mut registry = ship_registry(&path)?;
    registry.category_objects("ships", false)?;
    assert_eq!(edited(&mut registry, "ship_a", "hull")?, "900");

    let ship = registry.object_by_name("ship_a").ok_or("ship_a")?;
    let hull = registry.find_item(ship, "hull").ok_or("hull")?;
    registry.revert_item(hull);
    registry.save_patches()?;
    assert!(registry.patches().is_empty());
    Ok(())
}

#[test]
fn patches_under_an_outdated_key_migrate_by_node_identity() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("patches.json");
    let old_key = "hull,ships.xml,//macro[@name='ship_a']//hull,max";
    std::fs::write(
        &path,
        format!(
            "{{\n  // written by an older layout\n  patches: {{ \"{old_key}\": \"1200\", }},\n}}\n"
        ),
    )?;

    let mut registry = ship_registry(&path)?;
    registry.category_objects("ships", false)?;
    assert_eq!(edited(&mut registry, "ship_a", "hull")?, "1200");
    assert!(registry.patches().get(old_key).is_none());
    assert_eq!(registry.patches().get(HULL_KEY).map(|p| p.value.as_str()), Some("1200"));

    registry.save_patches()?;
    let saved = std::fs::read_to_string(&path)?;
    assert!(saved.contains(HULL_KEY));
    assert!(!saved.contains(old_key));
    Ok(())
}

#[test]
fn patches_for_unloaded_items_are_kept() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("patches.json");
    let foreign = "shield,shields.xml,//macro[@name='s']/recharge,rate";
    std::fs::write(&path, format!("{{ \"patches\": {{ \"{foreign}\": \"7\" }} }}"))?;

    let mut registry = ship_registry(&path)?;
    registry.category_objects("ships", false)?;
    registry.save_patches()?;
    assert_eq!(registry.patches().get(foreign).map(|p| p.value.as_str()), Some("7"));
    Ok(())
}

#[test]
fn malformed_patch_file_fails_the_build() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("patches.json");
    std::fs::write(&path, "{ patches: { \"a,b,c,d\": ")?;

    let mut registry = ship_registry(&path)?;
    let err = registry.category_objects("ships", false).unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Patch(PatchError::Malformed { .. })
    ));
    assert_eq!(std::fs::read_to_string(&path)?, "{ patches: { \"a,b,c,d\": ");
    Ok(())
}
