use crate::statics;
use std::ops::{Index, IndexMut};

/// One of the four evaluation stages an item value can independently exist in.
/// The order is the order in which a value is derived, but the stages are not interchangeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Version {
    /// The unmodified document.
    Original,
    /// After external, non-interactive extensions were applied.
    Merged,
    /// After interactive or script processing.
    Computed,
    /// The user override layer.
    Edited,
}

impl Version {
    pub const ALL: [Version; 4] = [
        Version::Original,
        Version::Merged,
        Version::Computed,
        Version::Edited,
    ];

    fn slot(self) -> usize {
        match self {
            Version::Original => 0,
            Version::Merged => 1,
            Version::Computed => 2,
            Version::Edited => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Version::Original => statics::EN_VERSION_ORIGINAL,
            Version::Merged => statics::EN_VERSION_MERGED,
            Version::Computed => statics::EN_VERSION_COMPUTED,
            Version::Edited => statics::EN_VERSION_EDITED,
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A fixed map holding one `T` per [`Version`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionMap<T>([T; 4]);

impl<T> VersionMap<T> {
    pub fn from_fn(mut f: impl FnMut(Version) -> T) -> Self {
        Self(Version::ALL.map(&mut f))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Version, &T)> {
        Version::ALL.into_iter().zip(self.0.iter())
    }
}

impl<T> Index<Version> for VersionMap<T> {
    type Output = T;

    fn index(&self, version: Version) -> &T {
        &self.0[version.slot()]
    }
}

impl<T> IndexMut<Version> for VersionMap<T> {
    fn index_mut(&mut self, version: Version) -> &mut T {
        &mut self.0[version.slot()]
    }
}

#[cfg(test)]
mod tests {
    use super::{Version, VersionMap};

    #[test]
    fn version_map_slots_are_independent() {
        let mut map: VersionMap<Option<u32>> = VersionMap::default();
        map[Version::Edited] = Some(3);
        assert_eq!(map[Version::Edited], Some(3));
        assert_eq!(map[Version::Original], None);
        assert_eq!(map[Version::Merged], None);

        let labels: Vec<_> = VersionMap::from_fn(|v| v.label())
            .iter()
            .map(|(_, l)| *l)
            .collect();
        assert_eq!(labels, vec!["original", "merged", "computed", "edited"]);
    }
}
