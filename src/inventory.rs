//! The in-memory inventory model.

use std::collections::btree_map::Iter as BTreeIter;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::bimap::PathBiMap;
use crate::consts::{DEFAULT_CONTENT_DIR, MUTABLE_HEAD_DIR};
use crate::digest::{DigestAlgorithm, HexDigest};
use crate::error::{not_found, OcflError, Result};
use crate::paths::{ContentPath, LogicalPath};
use crate::types::{RevisionNum, SpecVersion, VersionDetails, VersionInfo, VersionNum, VersionRef};

/// OCFL inventory serialization object. An inventory records the state of every version of an
/// object along with the manifest of all of the content files the versions reference.
///
/// Persisted inventories are immutable. Mutations are always expressed by building a new
/// inventory with `InventoryUpdater`.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Inventory {
    pub id: String,
    #[serde(rename = "type")]
    pub type_declaration: String,
    pub digest_algorithm: DigestAlgorithm,
    pub head: VersionNum,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_directory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fixity: Option<BTreeMap<DigestAlgorithm, PathBiMap<ContentPath>>>,
    manifest: PathBiMap<ContentPath>,
    pub versions: BTreeMap<VersionNum, Version>,

    /// Path to the object's root relative the storage root, using `/` separators
    #[serde(skip)]
    pub object_root: String,
    /// Physical path to the object's root
    #[serde(skip)]
    pub storage_path: String,
    /// The current mutable HEAD revision, present iff a mutable HEAD is active
    #[serde(skip)]
    pub revision_num: Option<RevisionNum>,
    /// The digest of this inventory as serialized on disk
    #[serde(skip)]
    pub current_digest: Option<HexDigest>,
    /// The digest the previous head inventory had when this inventory was derived from it.
    /// Used to detect concurrent writers at commit time.
    #[serde(skip)]
    pub previous_digest: Option<HexDigest>,
}

/// OCFL version serialization object
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Version {
    #[serde(with = "created_format")]
    pub created: DateTime<Local>,
    state: PathBiMap<LogicalPath>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
}

/// OCFL user serialization object
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct User {
    pub name: Option<String>,
    pub address: Option<String>,
}

impl Inventory {
    /// Creates the inventory for a brand new object containing a single empty version
    pub fn new_object(
        id: &str,
        spec_version: SpecVersion,
        digest_algorithm: DigestAlgorithm,
        content_directory: &str,
        created: DateTime<Local>,
        version_info: &VersionInfo,
    ) -> Result<Self> {
        if !digest_algorithm.is_inventory_algorithm() {
            return Err(OcflError::IllegalArgument(format!(
                "The inventory digest algorithm must be sha512 or sha256. Found: {}",
                digest_algorithm
            )));
        }

        let mut versions = BTreeMap::new();
        let head = VersionNum::new(1);
        versions.insert(head, Version::new(created, PathBiMap::new(), version_info));

        let inventory = Self {
            id: id.to_string(),
            type_declaration: spec_version.inventory_type().to_string(),
            digest_algorithm,
            head,
            content_directory: Some(content_directory.to_string()),
            fixity: None,
            manifest: PathBiMap::new(),
            versions,
            object_root: String::new(),
            storage_path: String::new(),
            revision_num: None,
            current_digest: None,
            previous_digest: None,
        };

        inventory.validate()?;
        Ok(inventory)
    }

    /// The OCFL spec version the inventory conforms to
    pub fn spec_version(&self) -> Result<SpecVersion> {
        SpecVersion::try_from_inventory_type(&self.type_declaration)
    }

    /// Returns true if the object only has a single version
    pub fn is_new(&self) -> bool {
        self.head.number() == 1
    }

    /// Returns true if the object has an active mutable HEAD
    pub fn has_mutable_head(&self) -> bool {
        self.revision_num.is_some()
    }

    /// Returns a reference to the HEAD version
    pub fn head_version(&self) -> &Version {
        // The head version is validated to exist when the inventory is created
        self.versions.get(&self.head).unwrap()
    }

    /// Returns a mutable reference to the HEAD version
    pub(crate) fn head_version_mut(&mut self) -> &mut Version {
        self.versions.get_mut(&self.head).unwrap()
    }

    /// Returns a reference to the specified version, or a `NotFound` error
    pub fn get_version(&self, version_num: VersionNum) -> Result<&Version> {
        match self.versions.get(&version_num) {
            Some(v) => Ok(v),
            None => Err(not_found(&self.id, Some(version_num))),
        }
    }

    pub fn defaulted_content_dir(&self) -> &str {
        match &self.content_directory {
            Some(dir) => dir.as_str(),
            None => DEFAULT_CONTENT_DIR,
        }
    }

    pub fn manifest(&self) -> &PathBiMap<ContentPath> {
        &self.manifest
    }

    pub(crate) fn manifest_mut(&mut self) -> &mut PathBiMap<ContentPath> {
        &mut self.manifest
    }

    pub fn fixity(&self) -> Option<&BTreeMap<DigestAlgorithm, PathBiMap<ContentPath>>> {
        self.fixity.as_ref()
    }

    /// Records a secondary fixity digest for a content path
    pub(crate) fn add_fixity_entry(
        &mut self,
        algorithm: DigestAlgorithm,
        digest: HexDigest,
        content_path: ContentPath,
    ) {
        self.fixity
            .get_or_insert_with(BTreeMap::new)
            .entry(algorithm)
            .or_default()
            .insert(digest, content_path);
    }

    /// Removes all fixity entries referencing the content path
    pub(crate) fn remove_fixity_entries(&mut self, content_path: &ContentPath) {
        if let Some(fixity) = &mut self.fixity {
            for block in fixity.values_mut() {
                block.remove_path(content_path);
            }
            fixity.retain(|_, block| !block.is_empty());
            if fixity.is_empty() {
                self.fixity = None;
            }
        }
    }

    /// Returns the first content path associated with the digest, or an error if there is none.
    ///
    /// The content path must exist in the specified version or earlier. When `logical_path` is
    /// provided and the digest maps to multiple content paths, the path that mirrors the
    /// logical path is preferred.
    pub fn content_path_for_digest(
        &self,
        digest: &HexDigest,
        version_num: VersionRef,
        logical_path: Option<&LogicalPath>,
    ) -> Result<&Arc<ContentPath>> {
        let version_num = version_num.resolve(self.head);

        match self.manifest.get_paths(digest) {
            Some(paths) => {
                let matches: Vec<&Arc<ContentPath>> = paths
                    .iter()
                    .filter(|path| path.version <= version_num)
                    .collect();

                if matches.is_empty() {
                    return Err(OcflError::CorruptObject {
                        object_id: self.id.clone(),
                        message: format!(
                            "Digest {} is not mapped to any content paths in {} or earlier",
                            digest, version_num
                        ),
                    });
                }

                if matches.len() > 1 {
                    if let Some(logical_path) = logical_path {
                        let suffix = format!("/{}", logical_path);
                        for path in &matches {
                            if path.as_str().ends_with(&suffix) {
                                return Ok(path);
                            }
                        }
                    }
                }

                Ok(matches[0])
            }
            None => Err(OcflError::CorruptObject {
                object_id: self.id.clone(),
                message: format!("Digest {} not found in manifest", digest),
            }),
        }
    }

    /// Resolves a logical path within a version to its content path
    pub fn content_path_for_logical_path(
        &self,
        logical_path: &LogicalPath,
        version_num: VersionRef,
    ) -> Result<&Arc<ContentPath>> {
        let version_num = version_num.resolve(self.head);
        let version = self.get_version(version_num)?;

        let digest = match version.lookup_digest(logical_path) {
            Some(digest) => digest,
            None => {
                return Err(OcflError::NotFound(format!(
                    "Path {} not found in object {} version {}",
                    logical_path, self.id, version_num
                )))
            }
        };

        self.content_path_for_digest(digest, version_num.into(), Some(logical_path))
    }

    /// Maps a content path to its location relative the object root. Content belonging to an
    /// active mutable HEAD physically lives under the extension directory rather than under
    /// the version directory its path names. Note a logical path may legitimately produce a
    /// content path that merely looks like a revision path, so the head version and revision
    /// state are consulted, not just the path's shape.
    pub fn content_path_storage_rel(&self, content_path: &ContentPath) -> String {
        let in_mutable_head = self.has_mutable_head()
            && content_path.version == self.head
            && content_path
                .revision(self.defaulted_content_dir())
                .is_some();

        if in_mutable_head {
            let version_prefix = content_path.version.to_string();
            format!(
                "{}{}",
                MUTABLE_HEAD_DIR,
                &content_path.as_str()[version_prefix.len()..]
            )
        } else {
            content_path.as_str().to_string()
        }
    }

    /// Performs a shallow validation of the inventory. This is not an exhaustive OCFL
    /// validation, but it enforces the engine's core invariants.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| -> Result<()> {
            Err(OcflError::InvalidInventory(format!(
                "Object {}: {}",
                self.id, message
            )))
        };

        if self.id.is_empty() {
            return invalid("id may not be empty".to_string());
        }

        self.spec_version()?;

        if !self.digest_algorithm.is_inventory_algorithm() {
            return invalid(format!(
                "digest algorithm must be sha512 or sha256; found {}",
                self.digest_algorithm
            ));
        }

        if let Some(content_dir) = &self.content_directory {
            if content_dir.is_empty() || content_dir.contains('/') || content_dir.contains('\\') {
                return invalid(format!("invalid content directory '{}'", content_dir));
            }
        }

        // Version keys must be exactly v1..head
        let mut expected = 1;
        for version_num in self.versions.keys() {
            if version_num.number() != expected {
                return invalid(format!(
                    "version directories are not contiguous; expected v{} but found {}",
                    expected, version_num
                ));
            }
            expected += 1;
        }

        if self.versions.keys().next_back() != Some(&self.head) {
            return invalid(format!("head version {} was not found", self.head));
        }

        // Every state digest must appear in the manifest
        for (version_num, version) in &self.versions {
            for (path, digest) in version.state_iter() {
                if !self.manifest.contains_digest(digest) {
                    return invalid(format!(
                        "state path {} in {} references digest {} that is not in the manifest",
                        path, version_num, digest
                    ));
                }
            }
        }

        // Every manifest path must be within an existing version
        for (path, _digest) in self.manifest.iter() {
            if path.version > self.head {
                return invalid(format!(
                    "manifest path {} references a version beyond the head {}",
                    path, self.head
                ));
            }
        }

        if let Some(revision_num) = self.revision_num {
            let content_dir = self.defaulted_content_dir();
            let in_revision = self.manifest.iter().any(|(path, _)| {
                path.version == self.head
                    && path
                        .revision(content_dir)
                        .map_or(false, |r| r <= revision_num)
            });

            if !in_revision {
                return invalid(format!(
                    "mutable HEAD revision {} has no content in the manifest",
                    revision_num
                ));
            }
        }

        Ok(())
    }

    /// Computes the changes the specified version applied relative its predecessor.
    /// For `v1` every path is an add.
    pub fn version_changes(
        &self,
        version_num: VersionNum,
    ) -> Result<Vec<(Arc<LogicalPath>, Option<Arc<HexDigest>>)>> {
        let version = self.get_version(version_num)?;
        let mut changes = Vec::new();

        let previous = match version_num.previous() {
            Ok(previous_num) => Some(self.get_version(previous_num)?),
            Err(_) => None,
        };

        for (path, digest) in version.state_iter() {
            let changed = match previous {
                Some(previous) => previous.lookup_digest(path) != Some(digest),
                None => true,
            };
            if changed {
                changes.push((path.clone(), Some(digest.clone())));
            }
        }

        if let Some(previous) = previous {
            for (path, _digest) in previous.state_iter() {
                if version.lookup_digest(path).is_none() {
                    changes.push((path.clone(), None));
                }
            }
        }

        changes.sort_by(|(left, _), (right, _)| left.cmp(right));

        Ok(changes)
    }
}

impl Version {
    /// Creates a new version with the specified state and metadata
    pub(crate) fn new(
        created: DateTime<Local>,
        state: PathBiMap<LogicalPath>,
        version_info: &VersionInfo,
    ) -> Self {
        let user = version_info.user_name.as_ref().map(|name| User {
            name: Some(name.clone()),
            address: version_info.user_address.clone(),
        });

        Self {
            created,
            state,
            message: version_info.message.clone(),
            user,
        }
    }

    pub fn state(&self) -> &PathBiMap<LogicalPath> {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut PathBiMap<LogicalPath> {
        &mut self.state
    }

    /// Returns an iterator over the version's state, in logical path order
    pub fn state_iter(&self) -> BTreeIter<Arc<LogicalPath>, Arc<HexDigest>> {
        self.state.iter()
    }

    /// Returns the digest associated with a logical path, or None if the path does not exist
    pub fn lookup_digest(&self, logical_path: &LogicalPath) -> Option<&Arc<HexDigest>> {
        self.state.get_digest(logical_path)
    }

    /// Returns true if the path exists as a logical file in the version
    pub fn is_file(&self, path: &LogicalPath) -> bool {
        self.state.contains_path(path)
    }

    /// Returns true if the path is a logical directory, ie a prefix of some logical file
    pub fn is_dir(&self, path: &LogicalPath) -> bool {
        let prefix = format!("{}/", path.as_str());
        self.state.iter().any(|(p, _)| p.starts_with(&prefix))
    }

    /// Returns an error if the path would conflict with the existing state by requiring a
    /// path segment to be interpreted as both a file and a directory.
    pub fn validate_non_conflicting(&self, path: &LogicalPath) -> Result<()> {
        if self.is_dir(path) {
            return Err(OcflError::IllegalState(format!(
                "Conflicting logical path {}: the path is already in use as a directory",
                path
            )));
        }

        let path_str = path.as_str();
        let mut end = path_str.rfind('/');

        while let Some(index) = end {
            let parent = LogicalPath::try_from(&path_str[..index])?;
            if self.is_file(&parent) {
                return Err(OcflError::IllegalState(format!(
                    "Conflicting logical path {}: the segment {} is an existing logical file",
                    path, parent
                )));
            }
            end = path_str[..index].rfind('/');
        }

        Ok(())
    }

    /// Returns every logical path under the specified logical directory prefix
    pub fn paths_with_prefix(&self, prefix: &str) -> Vec<Arc<LogicalPath>> {
        let prefix = if !prefix.ends_with('/') && !prefix.is_empty() {
            format!("{}/", prefix)
        } else {
            prefix.to_string()
        };

        self.state
            .iter()
            .filter(|(path, _)| path.starts_with(&prefix))
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Creates a `VersionDetails` projection of this version
    pub fn details(&self, version_num: VersionNum) -> VersionDetails {
        let (user_name, user_address) = match &self.user {
            Some(user) => (user.name.clone(), user.address.clone()),
            None => (None, None),
        };

        VersionDetails {
            version_num,
            created: self.created,
            user_name,
            user_address,
            message: self.message.clone(),
        }
    }

    /// The set of digests referenced by the version's state
    pub fn digests(&self) -> BTreeSet<Arc<HexDigest>> {
        self.state.iter().map(|(_, digest)| digest.clone()).collect()
    }
}

impl User {
    pub fn new(name: String, address: Option<String>) -> Self {
        Self {
            name: Some(name),
            address,
        }
    }
}

/// Serializes `created` timestamps at second precision, which is what the OCFL community
/// tooling emits, and accepts any RFC 3339 timestamp on read.
mod created_format {
    use chrono::{DateTime, Local, SecondsFormat};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(created: &DateTime<Local>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&created.to_rfc3339_opts(SecondsFormat::Secs, false))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Local>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&value)
            .map(|parsed| parsed.with_timezone(&Local))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::convert::TryInto;

    use chrono::{Local, TimeZone};

    use super::Inventory;
    use crate::bimap::PathBiMap;
    use crate::digest::DigestAlgorithm;
    use crate::error::OcflError;
    use crate::types::{SpecVersion, VersionInfo, VersionNum};

    fn empty_inventory() -> Inventory {
        Inventory::new_object(
            "urn:example:1",
            SpecVersion::Ocfl1_1,
            DigestAlgorithm::Sha512,
            "content",
            Local.with_ymd_and_hms(2023, 5, 1, 12, 0, 0).unwrap(),
            &VersionInfo::new(),
        )
        .unwrap()
    }

    #[test]
    fn new_object_inventory_is_valid() {
        let inventory = empty_inventory();
        assert_eq!(VersionNum::new(1), inventory.head);
        assert!(inventory.is_new());
        assert!(!inventory.has_mutable_head());
        assert!(inventory.head_version().state().is_empty());
    }

    #[test]
    fn reject_non_inventory_digest_algorithms() {
        let result = Inventory::new_object(
            "urn:example:1",
            SpecVersion::Ocfl1_1,
            DigestAlgorithm::Md5,
            "content",
            Local::now(),
            &VersionInfo::new(),
        );

        assert!(matches!(result, Err(OcflError::IllegalArgument(_))));
    }

    #[test]
    fn serialized_created_has_second_precision() {
        let inventory = empty_inventory();
        let json = serde_json::to_string(&inventory).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let created = value["versions"]["v1"]["created"].as_str().unwrap();
        assert!(!created.contains('.'), "expected no sub-seconds: {}", created);
    }

    #[test]
    fn validate_detects_state_digest_missing_from_manifest() {
        let mut inventory = empty_inventory();
        let mut state = PathBiMap::new();
        state.insert("abc123".into(), "a.txt".try_into().unwrap());
        *inventory.head_version_mut().state_mut() = state;

        assert!(matches!(
            inventory.validate(),
            Err(OcflError::InvalidInventory(_))
        ));
    }

    #[test]
    fn validate_detects_manifest_path_beyond_head() {
        let mut inventory = empty_inventory();
        inventory
            .manifest_mut()
            .insert("abc123".into(), "v2/content/a.txt".try_into().unwrap());

        assert!(matches!(
            inventory.validate(),
            Err(OcflError::InvalidInventory(_))
        ));
    }

    #[test]
    fn mutable_head_content_paths_remap_to_the_extension_dir() {
        let mut inventory = empty_inventory();
        inventory.revision_num = Some(crate::types::RevisionNum::new(1));

        let mutable_path = "v1/content/r1/a.txt".try_into().unwrap();
        assert_eq!(
            "extensions/0005-mutable-head/head/content/r1/a.txt",
            inventory.content_path_storage_rel(&mutable_path)
        );

        let plain_path = "v1/content/a.txt".try_into().unwrap();
        assert_eq!(
            "v1/content/a.txt",
            inventory.content_path_storage_rel(&plain_path)
        );
    }

    #[test]
    fn revision_like_paths_are_not_remapped_without_a_mutable_head() {
        let inventory = empty_inventory();

        // A logical path named r1/a.txt produces a content path that looks like a
        // revision path but is not one
        let path = "v1/content/r1/a.txt".try_into().unwrap();
        assert_eq!(
            "v1/content/r1/a.txt",
            inventory.content_path_storage_rel(&path)
        );
    }
}
