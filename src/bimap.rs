use std::collections::btree_map::{IntoIter, Iter};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fmt::Formatter;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::{DeserializeOwned, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::digest::HexDigest;

/// A bidirectional map between digests and sets of paths. A digest may map to many paths, but
/// a path maps to exactly one digest. Both sides are kept in sorted order so that serialized
/// inventories are deterministic.
#[derive(Debug, Clone)]
pub struct PathBiMap<P>
where
    P: Eq + Ord + DeserializeOwned + Serialize,
{
    digest_to_paths: BTreeMap<Arc<HexDigest>, BTreeSet<Arc<P>>>,
    path_to_digest: BTreeMap<Arc<P>, Arc<HexDigest>>,
}

impl<P> PathBiMap<P>
where
    P: Eq + Ord + DeserializeOwned + Serialize,
{
    pub fn new() -> Self {
        Self {
            digest_to_paths: BTreeMap::new(),
            path_to_digest: BTreeMap::new(),
        }
    }

    /// Inserts a new digest to path mapping. If the path already has a mapping, the existing
    /// mapping is removed first.
    pub fn insert(&mut self, digest: HexDigest, path: P) {
        self.insert_arc(Arc::new(digest), Arc::new(path));
    }

    /// Same as `insert`, but accepts shared values
    pub fn insert_arc(&mut self, digest: Arc<HexDigest>, path: Arc<P>) {
        if self.path_to_digest.contains_key(&path) {
            self.remove_path(&path);
        }

        let digest = match self.digest_to_paths.get_key_value(&digest) {
            Some((existing, _)) => existing.clone(),
            None => digest,
        };

        self.digest_to_paths
            .entry(digest.clone())
            .or_default()
            .insert(path.clone());

        self.path_to_digest.insert(path, digest);
    }

    /// Inserts all of the path mappings for a digest. Used during deserialization.
    fn insert_multiple(&mut self, digest: HexDigest, paths: Vec<P>) {
        if paths.is_empty() {
            return;
        }

        let digest = Arc::new(digest);

        let set = self.digest_to_paths.entry(digest.clone()).or_default();

        for path in paths {
            let path = Arc::new(path);
            set.insert(path.clone());
            self.path_to_digest.insert(path, digest.clone());
        }
    }

    /// Gets all of the paths associated with a digest
    pub fn get_paths(&self, digest: &HexDigest) -> Option<&BTreeSet<Arc<P>>> {
        self.digest_to_paths.get(digest)
    }

    /// Gets the digest associated with a path
    pub fn get_digest(&self, path: &P) -> Option<&Arc<HexDigest>> {
        self.path_to_digest.get(path)
    }

    /// Gets the shared value of the specified digest, if it exists
    pub fn get_digest_arc(&self, digest: &HexDigest) -> Option<&Arc<HexDigest>> {
        self.digest_to_paths
            .get_key_value(digest)
            .map(|(digest, _)| digest)
    }

    /// True if a mapping exists for the path
    pub fn contains_path(&self, path: &P) -> bool {
        self.path_to_digest.contains_key(path)
    }

    /// True if a mapping exists for the digest
    pub fn contains_digest(&self, digest: &HexDigest) -> bool {
        self.digest_to_paths.contains_key(digest)
    }

    pub fn is_empty(&self) -> bool {
        self.digest_to_paths.is_empty()
    }

    /// Removes a path mapping, dropping the digest entirely when its last path is removed
    pub fn remove_path(&mut self, path: &P) -> Option<(Arc<P>, Arc<HexDigest>)> {
        if let Some((path, digest)) = self.path_to_digest.remove_entry(path) {
            let mut remove = false;
            if let Some(paths) = self.digest_to_paths.get_mut(&digest) {
                paths.remove(path.as_ref());
                remove = paths.is_empty();
            }
            if remove {
                self.digest_to_paths.remove(&digest);
            }
            Some((path, digest))
        } else {
            None
        }
    }

    /// Returns an iterator over all path-digest pairs, in path order
    pub fn iter(&self) -> Iter<Arc<P>, Arc<HexDigest>> {
        self.path_to_digest.iter()
    }

    /// Returns an iterator over digest-paths pairs
    pub fn iter_digest_paths(&self) -> Iter<Arc<HexDigest>, BTreeSet<Arc<P>>> {
        self.digest_to_paths.iter()
    }

    /// Returns the number of path-digest pairs in the map
    pub fn len(&self) -> usize {
        self.path_to_digest.len()
    }
}

impl<P> Default for PathBiMap<P>
where
    P: Eq + Ord + DeserializeOwned + Serialize,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<P> PartialEq for PathBiMap<P>
where
    P: Eq + Ord + DeserializeOwned + Serialize,
{
    fn eq(&self, other: &Self) -> bool {
        self.path_to_digest == other.path_to_digest
    }
}

impl<P> Eq for PathBiMap<P> where P: Eq + Ord + DeserializeOwned + Serialize {}

impl<P> IntoIterator for PathBiMap<P>
where
    P: Eq + Ord + DeserializeOwned + Serialize,
{
    type Item = (Arc<P>, Arc<HexDigest>);
    type IntoIter = IntoIter<Arc<P>, Arc<HexDigest>>;

    fn into_iter(self) -> Self::IntoIter {
        self.path_to_digest.into_iter()
    }
}

impl<'a, P> IntoIterator for &'a PathBiMap<P>
where
    P: Eq + Ord + DeserializeOwned + Serialize,
{
    type Item = (&'a Arc<P>, &'a Arc<HexDigest>);
    type IntoIter = Iter<'a, Arc<P>, Arc<HexDigest>>;

    fn into_iter(self) -> Self::IntoIter {
        self.path_to_digest.iter()
    }
}

struct PathBiMapVisitor<P>
where
    P: Eq + Ord + DeserializeOwned + Serialize,
{
    brand: PhantomData<P>,
}

impl<'a, P> Visitor<'a> for PathBiMapVisitor<P>
where
    P: Eq + Ord + DeserializeOwned + Serialize,
{
    type Value = PathBiMap<P>;

    fn expecting(&self, formatter: &mut Formatter) -> fmt::Result {
        formatter.write_str("a map of digests to arrays of paths")
    }

    fn visit_map<M: MapAccess<'a>>(self, mut access: M) -> Result<Self::Value, M::Error> {
        let mut map = PathBiMap::new();

        while let Some((key, value)) = access.next_entry()? {
            map.insert_multiple(key, value);
        }

        Ok(map)
    }
}

impl<'a, P> Deserialize<'a> for PathBiMap<P>
where
    P: Eq + Ord + DeserializeOwned + Serialize,
{
    fn deserialize<D: Deserializer<'a>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(PathBiMapVisitor {
            brand: Default::default(),
        })
    }
}

impl<P> Serialize for PathBiMap<P>
where
    P: Eq + Ord + DeserializeOwned + Serialize,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.digest_to_paths.iter())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::convert::TryInto;
    use std::sync::Arc;

    use super::PathBiMap;
    use crate::digest::HexDigest;
    use crate::paths::LogicalPath;

    #[test]
    fn insert_retrieve_remove() {
        let mut map = PathBiMap::new();
        map.insert("abcd".into(), path("foo/bar"));
        map.insert("efgh".into(), path("foo/baz"));
        map.insert("abcd".into(), path("a2"));

        assert_eq!(
            &set(vec![path_arc("a2"), path_arc("foo/bar")]),
            map.get_paths(&"abcd".into()).unwrap()
        );

        assert_eq!(&digest_arc("abcd"), map.get_digest(&path("a2")).unwrap());
        assert_eq!(
            &digest_arc("efgh"),
            map.get_digest(&path("foo/baz")).unwrap()
        );

        assert_eq!(None, map.get_digest(&path("bogus")));
        assert_eq!(None, map.get_paths(&"bogus".into()));

        map.remove_path(&path("foo/baz"));

        assert!(!map.contains_digest(&"efgh".into()));
        assert!(!map.contains_path(&path("foo/baz")));

        map.remove_path(&path("foo/bar"));

        assert_eq!(
            &set(vec![path_arc("a2")]),
            map.get_paths(&"abcd".into()).unwrap()
        );
    }

    #[test]
    fn insert_existing_path_replaces_mapping() {
        let mut map = PathBiMap::new();
        map.insert("abcd".into(), path("foo/bar"));
        map.insert("a123".into(), path("foo/bar"));

        assert!(!map.contains_digest(&"abcd".into()));
        assert_eq!(&digest_arc("a123"), map.get_digest(&path("foo/bar")).unwrap());
    }

    #[test]
    fn serialize_deterministically() {
        let mut map = PathBiMap::new();
        map.insert("efgh".into(), path("foo/baz"));
        map.insert("abcd".into(), path("foo/bar"));
        map.insert("abcd".into(), path("a2"));

        let json = serde_json::to_string(&map).unwrap();

        assert_eq!(r#"{"abcd":["a2","foo/bar"],"efgh":["foo/baz"]}"#, json);

        let value: PathBiMap<LogicalPath> = serde_json::from_str(&json).unwrap();
        assert_eq!(map, value);
    }

    #[test]
    fn serialize_empty() {
        let map: PathBiMap<LogicalPath> = PathBiMap::new();

        let json = serde_json::to_string(&map).unwrap();

        assert_eq!("{}", json);
    }

    fn set<T: Ord>(vec: Vec<T>) -> BTreeSet<T> {
        vec.into_iter().collect()
    }

    fn path(p: &str) -> LogicalPath {
        p.try_into().unwrap()
    }

    fn path_arc(p: &str) -> Arc<LogicalPath> {
        Arc::new(path(p))
    }

    fn digest_arc(d: &str) -> Arc<HexDigest> {
        Arc::new(HexDigest::from(d))
    }
}
