//! Single-use builder that accumulates the mutations of one pending version and emits the
//! next immutable inventory.

use std::sync::Arc;

use chrono::{DateTime, Local, Timelike};

use crate::digest::{DigestAlgorithm, HexDigest};
use crate::error::{OcflError, Result};
use crate::inventory::{Inventory, Version};
use crate::paths::{sanitize_content_suffix, ContentPath, LogicalPath, PathConstraints};
use crate::types::{RevisionNum, SpecVersion, VersionInfo, VersionNum};

/// Accumulates add/remove/rename/reinstate mutations against a pending version. The updater
/// is single-use and must not be shared between threads; the orchestrator applies mutations
/// serially in enumeration order so identical inputs always produce identical inventories.
pub struct InventoryUpdater {
    inventory: Inventory,
    revision: Option<RevisionNum>,
    constraints: PathConstraints,
}

/// The outcome of adding a file to the pending version
#[derive(Debug)]
pub struct AddResult {
    /// True if the content is new to the object and must be copied into staging
    pub is_new: bool,
    /// The content path the manifest maps the file's digest to
    pub content_path: ContentPath,
    /// Staged content paths orphaned by an overwrite; the orchestrator deletes them
    pub removed_staged: Vec<ContentPath>,
}

impl InventoryUpdater {
    /// Starts an updater for a brand new object. The pending version is `v1` with an empty
    /// state.
    pub fn new_object(
        object_id: &str,
        spec_version: SpecVersion,
        digest_algorithm: DigestAlgorithm,
        content_directory: &str,
        version_info: &VersionInfo,
        constraints: PathConstraints,
    ) -> Result<Self> {
        let inventory = Inventory::new_object(
            object_id,
            spec_version,
            digest_algorithm,
            content_directory,
            resolve_created(version_info),
            version_info,
        )?;

        Ok(Self {
            inventory,
            revision: None,
            constraints,
        })
    }

    /// Starts an updater for a brand new object whose first version is a mutable HEAD.
    /// The pending version is `v1` at revision `r1`; nothing is committed immutably until
    /// the mutable HEAD is sealed.
    pub fn new_object_mutable(
        object_id: &str,
        spec_version: SpecVersion,
        digest_algorithm: DigestAlgorithm,
        content_directory: &str,
        version_info: &VersionInfo,
        constraints: PathConstraints,
    ) -> Result<Self> {
        let mut updater = Self::new_object(
            object_id,
            spec_version,
            digest_algorithm,
            content_directory,
            version_info,
            constraints,
        )?;

        let revision = RevisionNum::new(1);
        updater.inventory.revision_num = Some(revision);
        updater.revision = Some(revision);

        Ok(updater)
    }

    /// Starts an updater whose pending version has an empty state
    pub fn blank_state(
        base: &Inventory,
        version_info: &VersionInfo,
        constraints: PathConstraints,
    ) -> Result<Self> {
        Self::next_version(base, None, version_info, constraints)
    }

    /// Starts an updater whose pending version copies the head version's state
    pub fn copy_state(
        base: &Inventory,
        version_info: &VersionInfo,
        constraints: PathConstraints,
    ) -> Result<Self> {
        Self::next_version(base, Some(base.head), version_info, constraints)
    }

    /// Starts an updater whose pending version copies the state of the specified version
    pub fn copy_state_from(
        base: &Inventory,
        src_version: VersionNum,
        version_info: &VersionInfo,
        constraints: PathConstraints,
    ) -> Result<Self> {
        Self::next_version(base, Some(src_version), version_info, constraints)
    }

    /// Starts an updater writing under the object's mutable HEAD. When no mutable HEAD is
    /// active yet, the pending version advances the head and starts at revision `r1`;
    /// otherwise the head is unchanged and only the revision advances. New content is
    /// written under `vH/<contentDir>/rK/`.
    pub fn copy_state_mutable(
        base: &Inventory,
        version_info: &VersionInfo,
        constraints: PathConstraints,
    ) -> Result<Self> {
        let mut inventory = base.clone();
        inventory.previous_digest = base.current_digest.clone();
        inventory.current_digest = None;

        let revision = match base.revision_num {
            Some(revision) => {
                // Replace the accumulating mutable version with a fresh version object that
                // carries the new metadata but keeps the accumulated state
                let state = base.head_version().state().clone();
                inventory.versions.insert(
                    inventory.head,
                    Version::new(resolve_created(version_info), state, version_info),
                );
                revision.next()
            }
            None => {
                let state = base.head_version().state().clone();
                let head = inventory.head.next()?;
                inventory.versions.insert(
                    head,
                    Version::new(resolve_created(version_info), state, version_info),
                );
                inventory.head = head;
                RevisionNum::new(1)
            }
        };

        inventory.revision_num = Some(revision);

        Ok(Self {
            inventory,
            revision: Some(revision),
            constraints,
        })
    }

    fn next_version(
        base: &Inventory,
        copy_state_of: Option<VersionNum>,
        version_info: &VersionInfo,
        constraints: PathConstraints,
    ) -> Result<Self> {
        if base.has_mutable_head() {
            return Err(OcflError::IllegalState(format!(
                "Cannot update object {} because it has an active mutable HEAD",
                base.id
            )));
        }

        let mut inventory = base.clone();
        inventory.previous_digest = base.current_digest.clone();
        inventory.current_digest = None;

        let state = match copy_state_of {
            Some(version_num) => inventory.get_version(version_num)?.state().clone(),
            None => Default::default(),
        };

        let head = inventory.head.next()?;
        inventory.versions.insert(
            head,
            Version::new(resolve_created(version_info), state, version_info),
        );
        inventory.head = head;

        Ok(Self {
            inventory,
            revision: None,
            constraints,
        })
    }

    /// The version number of the pending version
    pub fn head(&self) -> VersionNum {
        self.inventory.head
    }

    /// The revision the updater is writing, when staging under a mutable HEAD
    pub fn revision(&self) -> Option<RevisionNum> {
        self.revision
    }

    pub fn content_directory(&self) -> &str {
        self.inventory.defaulted_content_dir()
    }

    pub fn digest_algorithm(&self) -> DigestAlgorithm {
        self.inventory.digest_algorithm
    }

    /// Returns true if the pending state contains the logical path
    pub fn contains_logical_path(&self, logical_path: &LogicalPath) -> bool {
        self.inventory.head_version().is_file(logical_path)
    }

    /// Adds the `digest -> logical_path` binding to the pending state. When the digest is
    /// not already in the manifest, a content path is chosen for it and `is_new` is true;
    /// otherwise the existing content is reused.
    pub fn add_file(
        &mut self,
        digest: HexDigest,
        logical_path: LogicalPath,
        overwrite: bool,
    ) -> Result<AddResult> {
        let mut removed_staged = Vec::new();

        if self.contains_logical_path(&logical_path) {
            if !overwrite {
                return Err(OcflError::Overwrite(logical_path.to_string()));
            }
            removed_staged = self.remove_file(&logical_path)?;
        }

        self.inventory
            .head_version()
            .validate_non_conflicting(&logical_path)?;

        let (is_new, content_path) = match self.inventory.manifest().get_digest_arc(&digest) {
            Some(existing) => {
                let existing = existing.clone();
                let content_path = self
                    .inventory
                    .content_path_for_digest(&existing, self.inventory.head.into(), None)?
                    .as_ref()
                    .clone();

                self.inventory
                    .head_version_mut()
                    .state_mut()
                    .insert_arc(existing, Arc::new(logical_path));

                (false, content_path)
            }
            None => {
                let content_path = self.choose_content_path(&logical_path)?;

                let digest = Arc::new(digest);
                self.inventory
                    .manifest_mut()
                    .insert_arc(digest.clone(), Arc::new(content_path.clone()));
                self.inventory
                    .head_version_mut()
                    .state_mut()
                    .insert_arc(digest, Arc::new(logical_path));

                (true, content_path)
            }
        };

        Ok(AddResult {
            is_new,
            content_path,
            removed_staged,
        })
    }

    /// Removes the logical path from the pending state. When the removal orphans content
    /// that was added earlier in this same update, the orphaned content paths are returned
    /// so the orchestrator can delete them from the staging tree. Removing a path that does
    /// not exist is a no-op.
    pub fn remove_file(&mut self, logical_path: &LogicalPath) -> Result<Vec<ContentPath>> {
        let removed = self
            .inventory
            .head_version_mut()
            .state_mut()
            .remove_path(logical_path);

        match removed {
            Some((_path, digest)) => Ok(self.collect_orphaned_content(&digest)),
            None => Ok(Vec::new()),
        }
    }

    /// Moves the logical binding from `src` to `dst`. The manifest is untouched.
    pub fn rename_file(
        &mut self,
        src: &LogicalPath,
        dst: LogicalPath,
        overwrite: bool,
    ) -> Result<Vec<ContentPath>> {
        let digest = match self.inventory.head_version().lookup_digest(src) {
            Some(digest) => digest.clone(),
            None => {
                return Err(OcflError::NotFound(format!(
                    "Path {} not found in object {}",
                    src, self.inventory.id
                )))
            }
        };

        let mut removed_staged = Vec::new();

        if self.contains_logical_path(&dst) {
            if !overwrite {
                return Err(OcflError::Overwrite(dst.to_string()));
            }
            removed_staged = self.remove_file(&dst)?;
        }

        self.inventory.head_version().validate_non_conflicting(&dst)?;

        let head = self.inventory.head_version_mut();
        head.state_mut().remove_path(src);
        head.state_mut().insert_arc(digest, Arc::new(dst));

        Ok(removed_staged)
    }

    /// Binds `dst` to the digest that `src` had in `src_version`. The referenced content
    /// must still exist in the manifest; no content is copied.
    pub fn reinstate_file(
        &mut self,
        src_version: VersionNum,
        src: &LogicalPath,
        dst: LogicalPath,
        overwrite: bool,
    ) -> Result<Vec<ContentPath>> {
        let digest = match self.inventory.get_version(src_version)?.lookup_digest(src) {
            Some(digest) => digest.clone(),
            None => {
                return Err(OcflError::NotFound(format!(
                    "Path {} not found in object {} version {}",
                    src, self.inventory.id, src_version
                )))
            }
        };

        if !self.inventory.manifest().contains_digest(&digest) {
            return Err(OcflError::CorruptObject {
                object_id: self.inventory.id.clone(),
                message: format!(
                    "Digest {} of {} in {} is not in the manifest",
                    digest, src, src_version
                ),
            });
        }

        let mut removed_staged = Vec::new();

        if self.contains_logical_path(&dst) {
            if !overwrite {
                return Err(OcflError::Overwrite(dst.to_string()));
            }
            removed_staged = self.remove_file(&dst)?;
        }

        self.inventory.head_version().validate_non_conflicting(&dst)?;

        self.inventory
            .head_version_mut()
            .state_mut()
            .insert_arc(digest, Arc::new(dst));

        Ok(removed_staged)
    }

    /// Records a secondary fixity digest for a content path that is in the manifest
    pub fn add_fixity(
        &mut self,
        content_path: &ContentPath,
        algorithm: DigestAlgorithm,
        digest: HexDigest,
    ) -> Result<()> {
        if !self.inventory.manifest().contains_path(content_path) {
            return Err(OcflError::IllegalArgument(format!(
                "Cannot add fixity for {} because it is not in the manifest",
                content_path
            )));
        }

        self.inventory
            .add_fixity_entry(algorithm, digest, content_path.clone());

        Ok(())
    }

    /// Finalizes the pending version and returns the new inventory. The inventory is
    /// shallow-validated before it is returned.
    pub fn build_new_inventory(self) -> Result<Inventory> {
        self.inventory.validate()?;
        Ok(self.inventory)
    }

    /// Chooses the content path for new content: the sanitized logical path under the
    /// pending version's content directory, disambiguated when sanitization collides with
    /// an existing manifest entry.
    fn choose_content_path(&self, logical_path: &LogicalPath) -> Result<ContentPath> {
        let suffix = sanitize_content_suffix(logical_path);
        self.constraints.apply(&suffix)?;

        let content_dir = self.inventory.defaulted_content_dir();

        let mut candidate =
            ContentPath::build(self.inventory.head, content_dir, self.revision, &suffix);
        let mut attempt = 0;

        while self.inventory.manifest().contains_path(&candidate) {
            attempt += 1;
            candidate = ContentPath::build(
                self.inventory.head,
                content_dir,
                self.revision,
                &format!("{}-{}", suffix, attempt),
            );
        }

        Ok(candidate)
    }

    /// Returns the manifest content paths of the digest that belong to the pending version
    /// (or revision), provided the pending state no longer references the digest at all.
    /// These entries are removed from the manifest and the fixity block.
    fn collect_orphaned_content(&mut self, digest: &HexDigest) -> Vec<ContentPath> {
        if self.inventory.head_version().state().contains_digest(digest) {
            return Vec::new();
        }

        let content_dir = self.inventory.defaulted_content_dir().to_string();
        let head = self.inventory.head;
        let revision = self.revision;

        let candidates: Vec<ContentPath> = match self.inventory.manifest().get_paths(digest) {
            Some(paths) => paths
                .iter()
                .filter(|path| {
                    // Content belongs to this update if it is in the pending version and,
                    // under a mutable HEAD, in the pending revision. Earlier revisions are
                    // already persisted and are only pruned when the HEAD is sealed.
                    path.version == head
                        && match revision {
                            Some(revision) => path.revision(&content_dir) == Some(revision),
                            None => true,
                        }
                })
                .map(|path| path.as_ref().clone())
                .collect(),
            None => Vec::new(),
        };

        for path in &candidates {
            self.inventory.manifest_mut().remove_path(path);
            self.inventory.remove_fixity_entries(path);
        }

        candidates
    }
}

fn resolve_created(version_info: &VersionInfo) -> DateTime<Local> {
    let created = version_info.created.unwrap_or_else(Local::now);
    // Second precision; the serializer drops sub-seconds anyway
    created.with_nanosecond(0).unwrap_or(created)
}

#[cfg(test)]
mod tests {
    use std::convert::TryInto;

    use super::InventoryUpdater;
    use crate::digest::DigestAlgorithm;
    use crate::error::OcflError;
    use crate::paths::{LogicalPath, PathConstraints};
    use crate::types::{SpecVersion, VersionInfo, VersionNum};

    fn new_updater(id: &str) -> InventoryUpdater {
        InventoryUpdater::new_object(
            id,
            SpecVersion::Ocfl1_1,
            DigestAlgorithm::Sha512,
            "content",
            &VersionInfo::new(),
            PathConstraints::default(),
        )
        .unwrap()
    }

    fn logical(path: &str) -> LogicalPath {
        path.try_into().unwrap()
    }

    #[test]
    fn add_new_file_creates_manifest_entry() {
        let mut updater = new_updater("o1");

        let result = updater
            .add_file("aaa111".into(), logical("dir/a.txt"), false)
            .unwrap();

        assert!(result.is_new);
        assert_eq!("v1/content/dir/a.txt", result.content_path.as_str());

        let inventory = updater.build_new_inventory().unwrap();
        assert!(inventory.manifest().contains_digest(&"aaa111".into()));
        assert!(inventory.head_version().is_file(&logical("dir/a.txt")));
    }

    #[test]
    fn adding_duplicate_content_dedups_against_manifest() {
        let mut updater = new_updater("o1");

        let first = updater
            .add_file("aaa111".into(), logical("a.txt"), false)
            .unwrap();
        let second = updater
            .add_file("aaa111".into(), logical("copy/a.txt"), false)
            .unwrap();

        assert!(first.is_new);
        assert!(!second.is_new);
        assert_eq!(first.content_path, second.content_path);

        let inventory = updater.build_new_inventory().unwrap();
        assert_eq!(
            1,
            inventory.manifest().get_paths(&"aaa111".into()).unwrap().len()
        );
    }

    #[test]
    fn add_existing_logical_path_requires_overwrite() {
        let mut updater = new_updater("o1");

        updater
            .add_file("aaa111".into(), logical("a.txt"), false)
            .unwrap();

        let result = updater.add_file("bbb222".into(), logical("a.txt"), false);
        assert!(matches!(result, Err(OcflError::Overwrite(_))));

        let result = updater
            .add_file("bbb222".into(), logical("a.txt"), true)
            .unwrap();
        assert!(result.is_new);
        // The overwritten content was new to this version and is now orphaned
        assert_eq!(1, result.removed_staged.len());
        assert_eq!("v1/content/a.txt", result.removed_staged[0].as_str());
    }

    #[test]
    fn remove_file_returns_staged_content_for_cleanup() {
        let mut updater = new_updater("o1");

        updater
            .add_file("aaa111".into(), logical("a.txt"), false)
            .unwrap();

        let removed = updater.remove_file(&logical("a.txt")).unwrap();

        assert_eq!(1, removed.len());
        assert_eq!("v1/content/a.txt", removed[0].as_str());

        let inventory = updater.build_new_inventory().unwrap();
        assert!(!inventory.manifest().contains_digest(&"aaa111".into()));
    }

    #[test]
    fn remove_file_keeps_content_still_referenced() {
        let mut updater = new_updater("o1");

        updater
            .add_file("aaa111".into(), logical("a.txt"), false)
            .unwrap();
        updater
            .add_file("aaa111".into(), logical("b.txt"), false)
            .unwrap();

        let removed = updater.remove_file(&logical("a.txt")).unwrap();
        assert!(removed.is_empty());

        let inventory = updater.build_new_inventory().unwrap();
        assert!(inventory.manifest().contains_digest(&"aaa111".into()));
    }

    #[test]
    fn remove_missing_file_is_a_noop() {
        let mut updater = new_updater("o1");
        assert!(updater.remove_file(&logical("nope.txt")).unwrap().is_empty());
    }

    #[test]
    fn rename_moves_the_logical_binding_only() {
        let mut updater = new_updater("o1");

        updater
            .add_file("aaa111".into(), logical("a.txt"), false)
            .unwrap();
        updater
            .rename_file(&logical("a.txt"), logical("b.txt"), false)
            .unwrap();

        let inventory = updater.build_new_inventory().unwrap();
        assert!(!inventory.head_version().is_file(&logical("a.txt")));
        assert!(inventory.head_version().is_file(&logical("b.txt")));
        // Content path still reflects the original name
        assert_eq!(
            "v1/content/a.txt",
            inventory
                .content_path_for_logical_path(&logical("b.txt"), crate::types::VersionRef::Head)
                .unwrap()
                .as_str()
        );
    }

    #[test]
    fn rename_missing_source_fails() {
        let mut updater = new_updater("o1");
        assert!(matches!(
            updater.rename_file(&logical("a.txt"), logical("b.txt"), false),
            Err(OcflError::NotFound(_))
        ));
    }

    #[test]
    fn reinstate_binds_old_digest_without_new_content() {
        let mut updater = new_updater("o1");
        updater
            .add_file("aaa111".into(), logical("a.txt"), false)
            .unwrap();
        let v1 = updater.build_new_inventory().unwrap();

        let mut updater =
            InventoryUpdater::copy_state(&v1, &VersionInfo::new(), PathConstraints::default())
                .unwrap();
        updater.remove_file(&logical("a.txt")).unwrap();
        let v2 = updater.build_new_inventory().unwrap();

        let mut updater =
            InventoryUpdater::copy_state(&v2, &VersionInfo::new(), PathConstraints::default())
                .unwrap();
        updater
            .reinstate_file(
                VersionNum::new(1),
                &logical("a.txt"),
                logical("restored/a.txt"),
                false,
            )
            .unwrap();
        let v3 = updater.build_new_inventory().unwrap();

        assert_eq!(VersionNum::new(3), v3.head);
        assert!(v3.head_version().is_file(&logical("restored/a.txt")));
        assert_eq!(
            "v1/content/a.txt",
            v3.content_path_for_logical_path(
                &logical("restored/a.txt"),
                crate::types::VersionRef::Head
            )
            .unwrap()
            .as_str()
        );
    }

    #[test]
    fn sanitized_collisions_are_disambiguated() {
        let mut updater = new_updater("o1");

        let first = updater
            .add_file("aaa111".into(), logical("a\\b.txt"), false)
            .unwrap();
        let second = updater
            .add_file("bbb222".into(), logical("a/b.txt"), false)
            .unwrap();

        assert_eq!("v1/content/a/b.txt", first.content_path.as_str());
        assert_eq!("v1/content/a/b.txt-1", second.content_path.as_str());
    }

    #[test]
    fn mutable_updater_writes_revision_content_paths() {
        let mut updater = new_updater("o1");
        updater
            .add_file("aaa111".into(), logical("a.txt"), false)
            .unwrap();
        let v1 = updater.build_new_inventory().unwrap();

        let mut updater = InventoryUpdater::copy_state_mutable(
            &v1,
            &VersionInfo::new(),
            PathConstraints::default(),
        )
        .unwrap();

        assert_eq!(VersionNum::new(2), updater.head());
        assert_eq!(1, updater.revision().unwrap().number());

        let result = updater
            .add_file("bbb222".into(), logical("b.txt"), false)
            .unwrap();
        assert_eq!("v2/content/r1/b.txt", result.content_path.as_str());

        let mutable = updater.build_new_inventory().unwrap();
        assert!(mutable.has_mutable_head());

        // A second mutable update keeps the head and advances the revision
        let mut updater = InventoryUpdater::copy_state_mutable(
            &mutable,
            &VersionInfo::new(),
            PathConstraints::default(),
        )
        .unwrap();

        assert_eq!(VersionNum::new(2), updater.head());
        assert_eq!(2, updater.revision().unwrap().number());

        let result = updater
            .add_file("ccc333".into(), logical("c.txt"), false)
            .unwrap();
        assert_eq!("v2/content/r2/c.txt", result.content_path.as_str());
    }

    #[test]
    fn immutable_update_of_mutable_head_is_rejected() {
        let mut updater = new_updater("o1");
        updater
            .add_file("aaa111".into(), logical("a.txt"), false)
            .unwrap();
        let v1 = updater.build_new_inventory().unwrap();

        let mut mutable = InventoryUpdater::copy_state_mutable(
            &v1,
            &VersionInfo::new(),
            PathConstraints::default(),
        )
        .unwrap();
        mutable
            .add_file("bbb222".into(), logical("b.txt"), false)
            .unwrap();
        let inventory = mutable.build_new_inventory().unwrap();

        assert!(matches!(
            InventoryUpdater::copy_state(&inventory, &VersionInfo::new(), PathConstraints::default()),
            Err(OcflError::IllegalState(_))
        ));
    }

    #[test]
    fn fixity_requires_manifest_entry() {
        let mut updater = new_updater("o1");
        let result = updater
            .add_file("aaa111".into(), logical("a.txt"), false)
            .unwrap();

        updater
            .add_fixity(&result.content_path, DigestAlgorithm::Md5, "ffff".into())
            .unwrap();

        let bogus = "v1/content/bogus.txt".try_into().unwrap();
        assert!(matches!(
            updater.add_fixity(&bogus, DigestAlgorithm::Md5, "ffff".into()),
            Err(OcflError::IllegalArgument(_))
        ));

        let inventory = updater.build_new_inventory().unwrap();
        let fixity = inventory.fixity().unwrap();
        assert!(fixity
            .get(&DigestAlgorithm::Md5)
            .unwrap()
            .contains_digest(&"ffff".into()));
    }
}
