use std::collections::HashMap;

use smol_str::SmolStr;

use crate::tag::Tag;

/// Per-session mapping from entity tag to access level, embedded in minted
/// JWTs under the `access` claim. Rebuilt on every login and never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct AccessMap(HashMap<Tag, SmolStr>);

/// Ordering of the known access levels; unknown levels are opaque and rank
/// below everything known so that a known grant is never downgraded.
fn level_rank(level: &str) -> u8 {
    match level {
        "superuser" => 5,
        "admin" | "administrator" => 4,
        "write" => 3,
        "read" => 2,
        "consume" => 1,
        _ => 0,
    }
}

impl AccessMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, tag: &Tag) -> Option<&str> {
        self.0.get(tag).map(SmolStr::as_str)
    }

    pub fn insert(&mut self, tag: Tag, level: impl AsRef<str>) {
        self.0.insert(tag, SmolStr::new(level.as_ref()));
    }

    /// Merges `requested` in, keeping the stronger level per tag.
    /// Unknown levels pass through unchanged when no stronger known level is
    /// already present.
    pub fn merge_max(&mut self, requested: &AccessMap) {
        for (tag, level) in &requested.0 {
            match self.0.get(tag) {
                Some(existing) if level_rank(existing) >= level_rank(level) => {}
                _ => {
                    self.0.insert(tag.clone(), level.clone());
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Tag, &str)> {
        self.0.iter().map(|(tag, level)| (tag, level.as_str()))
    }
}

impl FromIterator<(Tag, SmolStr)> for AccessMap {
    fn from_iter<I: IntoIterator<Item = (Tag, SmolStr)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
