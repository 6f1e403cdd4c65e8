//! The mutable HEAD extension: in-place staging revisions that accumulate inside a single
//! version directory until they are sealed into an immutable version.

use std::collections::{BTreeSet, HashSet};
use std::convert::TryFrom;
use std::sync::Arc;

use chrono::Timelike;
use log::{error, info};

use crate::consts::{
    EXTENSIONS_DIR, MUTABLE_HEAD_DIR, MUTABLE_HEAD_EXT_DIR, MUTABLE_HEAD_REVISIONS_DIR,
};
use crate::digest::DigestAlgorithm;
use crate::error::{OcflError, Result};
use crate::inventory::Inventory;
use crate::paths::ContentPath;
use crate::store::Storage;
use crate::types::{RevisionNum, VersionInfo};
use crate::util;
use crate::writer::{publish_inventory_files, read_sidecar_digest, sidecar_name};

/// The name of the snapshot of the object-root inventory sidecar kept inside the mutable
/// HEAD, eg `root-inventory.json.sha512`
pub fn root_sidecar_snapshot_name(algorithm: DigestAlgorithm) -> String {
    format!("root-{}", sidecar_name(algorithm))
}

pub(crate) struct MutableHeadController<'a> {
    storage: &'a dyn Storage,
}

impl<'a> MutableHeadController<'a> {
    pub fn new(storage: &'a dyn Storage) -> Self {
        Self { storage }
    }

    fn head_dir(&self, object_root: &str) -> String {
        util::join(object_root, MUTABLE_HEAD_DIR)
    }

    fn ext_dir(&self, object_root: &str) -> String {
        util::join(object_root, MUTABLE_HEAD_EXT_DIR)
    }

    fn revisions_dir(&self, object_root: &str) -> String {
        util::join(object_root, MUTABLE_HEAD_REVISIONS_DIR)
    }

    /// Returns the highest committed revision, determined by the revision marker files
    pub fn current_revision(&self, object_root: &str) -> Result<Option<RevisionNum>> {
        let mut max: Option<RevisionNum> = None;

        for listing in self.storage.list_dir(&self.revisions_dir(object_root))? {
            if let Ok(revision) = RevisionNum::try_from(listing.path()) {
                if max.map_or(true, |current| revision > current) {
                    max = Some(revision);
                }
            }
        }

        Ok(max)
    }

    /// Verifies that the object root has not been modified underneath the mutable HEAD by
    /// comparing the root sidecar snapshot taken when the mutable HEAD was created to the
    /// current root sidecar. Objects whose first version is the mutable HEAD have neither
    /// a snapshot nor a root sidecar.
    pub fn check_sync(&self, inventory: &Inventory) -> Result<()> {
        let snapshot_path = util::join(
            &self.head_dir(&inventory.object_root),
            &root_sidecar_snapshot_name(inventory.digest_algorithm),
        );
        let root_sidecar = util::join(
            &inventory.object_root,
            &sidecar_name(inventory.digest_algorithm),
        );

        let out_of_sync = |message: &str| -> Result<()> {
            Err(OcflError::ObjectOutOfSync {
                object_id: inventory.id.clone(),
                message: message.to_string(),
            })
        };

        match (
            self.storage.file_exists(&snapshot_path)?,
            self.storage.file_exists(&root_sidecar)?,
        ) {
            (false, false) => Ok(()),
            (false, true) => {
                out_of_sync("a base version appeared beneath the object's mutable HEAD")
            }
            (true, false) => out_of_sync("the object's base version disappeared"),
            (true, true) => {
                let snapshot = self.storage.read_to_string(&snapshot_path)?;
                let snapshot_digest = match snapshot.split_whitespace().next() {
                    Some(digest) => crate::digest::HexDigest::from(digest),
                    None => {
                        return Err(OcflError::CorruptObject {
                            object_id: inventory.id.clone(),
                            message: format!(
                                "Root sidecar snapshot at {} is empty",
                                snapshot_path
                            ),
                        })
                    }
                };

                let current = read_sidecar_digest(
                    self.storage,
                    &inventory.object_root,
                    inventory.digest_algorithm,
                )?;

                if current != snapshot_digest {
                    return out_of_sync(
                        "the object's base version changed beneath its mutable HEAD",
                    );
                }

                Ok(())
            }
        }
    }

    /// Persists one staged revision. The inventory must have been built by a mutable
    /// updater, and the staged content (if any) must be at `<staging_dir>/<contentDir>`.
    /// The caller holds the object's write lock.
    pub fn stage_revision(&self, inventory: &Inventory, staging_dir: &str) -> Result<()> {
        let revision = inventory.revision_num.ok_or_else(|| {
            OcflError::IllegalState("The inventory does not have a mutable HEAD".to_string())
        })?;

        let object_root = &inventory.object_root;
        let head_dir = self.head_dir(object_root);

        info!(
            "Staging revision {} of object {} mutable HEAD",
            revision, inventory.id
        );

        // The marker file is atomic proof the revision is claimed; losing the race means a
        // concurrent writer staged this revision first
        let marker = util::join(&self.revisions_dir(object_root), &revision.to_string());
        match self.storage.write_new(&marker, b"") {
            Ok(()) => (),
            Err(OcflError::AlreadyExists(_)) => {
                return Err(OcflError::ObjectOutOfSync {
                    object_id: inventory.id.clone(),
                    message: format!("revision {} was staged by another writer", revision),
                });
            }
            Err(e) => return Err(e),
        }

        if revision.previous().is_none() {
            self.snapshot_root_sidecar(inventory)?;
        }

        let staged_content = util::join(staging_dir, inventory.defaulted_content_dir());
        if self.storage.physical_path(&staged_content).is_dir() {
            let revision_content = util::join(
                &util::join(&head_dir, inventory.defaulted_content_dir()),
                &revision.to_string(),
            );

            match self.storage.move_dir_internal(&staged_content, &revision_content) {
                Ok(()) => (),
                Err(OcflError::AlreadyExists(_)) => {
                    return Err(OcflError::ObjectOutOfSync {
                        object_id: inventory.id.clone(),
                        message: format!("revision {} content already exists", revision),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        publish_inventory_files(
            self.storage,
            staging_dir,
            &head_dir,
            inventory.digest_algorithm,
        )?;

        self.intra_revision_cleanup(inventory)?;

        Ok(())
    }

    /// Seals the mutable HEAD into the immutable version it has been accumulating. Returns
    /// the sealed inventory. The caller holds the object's write lock.
    pub fn commit(
        &self,
        inventory: &Inventory,
        version_info: &VersionInfo,
    ) -> Result<Inventory> {
        self.check_sync(inventory)?;

        let object_root = inventory.object_root.clone();
        let head_dir = self.head_dir(&object_root);
        let content_dir = inventory.defaulted_content_dir().to_string();

        info!(
            "Committing mutable HEAD of object {} as {}",
            inventory.id, inventory.head
        );

        let (mut sealed, moves) = seal_inventory(inventory, version_info)?;

        // Flatten the revision directories on disk to match the rewritten manifest
        for (old_path, new_path) in &moves {
            let src = util::join(&head_dir, &strip_version(old_path));
            let dst = util::join(&head_dir, &strip_version(new_path));
            self.storage.copy_file_internal(&src, &dst)?;
            self.storage.delete_file(&src)?;
        }

        // Everything left under an rN directory is stale
        let content_root = util::join(&head_dir, &content_dir);
        for listing in self.storage.list_dir(&content_root)? {
            if listing.is_dir() && RevisionNum::try_from(listing.path()).is_ok() {
                self.storage
                    .delete_dir(&util::join(&content_root, listing.path()))?;
            }
        }
        self.storage.delete_empty_dirs_down(&content_root)?;

        // The mutable HEAD bookkeeping does not belong in the sealed version
        self.storage.delete_dir(&self.revisions_dir(&object_root))?;
        self.storage.delete_file(&util::join(
            &head_dir,
            &root_sidecar_snapshot_name(inventory.digest_algorithm),
        ))?;

        crate::writer::write_inventory_files(
            &mut sealed,
            &self.storage.physical_path(&head_dir),
        )?;

        let version_dir = util::join(&object_root, &sealed.head.to_string());

        match self.storage.move_dir_internal(&head_dir, &version_dir) {
            Ok(()) => (),
            Err(OcflError::AlreadyExists(_)) => {
                return Err(OcflError::ObjectOutOfSync {
                    object_id: inventory.id.clone(),
                    message: format!("version {} already exists", sealed.head),
                });
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = publish_inventory_files(
            self.storage,
            &version_dir,
            &object_root,
            sealed.digest_algorithm,
        ) {
            self.restore_after_failed_publish(&sealed, &object_root);
            return Err(e);
        }

        self.purge(&object_root);

        Ok(sealed)
    }

    /// Deletes the mutable HEAD extension subtree. Failures are logged, not raised.
    pub fn purge(&self, object_root: &str) {
        if let Err(e) = self.storage.delete_dir(&self.ext_dir(object_root)) {
            error!(
                "Failed to delete the mutable HEAD extension of the object at {}: {}",
                object_root, e
            );
            return;
        }

        let extensions = util::join(object_root, EXTENSIONS_DIR);
        match self.storage.dir_is_empty(&extensions) {
            Ok(true) => {
                if let Err(e) = self.storage.delete_dir(&extensions) {
                    error!("Failed to delete the empty extensions dir {}: {}", extensions, e);
                }
            }
            _ => (),
        }
    }

    fn snapshot_root_sidecar(&self, inventory: &Inventory) -> Result<()> {
        let src = util::join(
            &inventory.object_root,
            &sidecar_name(inventory.digest_algorithm),
        );

        // Objects created directly into a mutable HEAD have no base version to snapshot
        if !self.storage.file_exists(&src)? {
            return Ok(());
        }

        let dst = util::join(
            &self.head_dir(&inventory.object_root),
            &root_sidecar_snapshot_name(inventory.digest_algorithm),
        );

        self.storage.copy_file_internal(&src, &dst)
    }

    /// Deletes files in the mutable HEAD content directory that the manifest no longer
    /// references
    fn intra_revision_cleanup(&self, inventory: &Inventory) -> Result<()> {
        let head_dir = self.head_dir(&inventory.object_root);
        let content_root = util::join(&head_dir, inventory.defaulted_content_dir());
        let version_prefix = util::join(
            &inventory.head.to_string(),
            inventory.defaulted_content_dir(),
        );

        for listing in self.storage.list_recursive(&content_root)? {
            if !listing.is_file() {
                continue;
            }

            let content_path = ContentPath::try_from(util::join(&version_prefix, listing.path()))?;

            if !inventory.manifest().contains_path(&content_path) {
                let full = util::join(&content_root, listing.path());
                info!("Deleting unreferenced mutable HEAD file {}", full);
                self.storage.delete_file(&full)?;
            }
        }

        self.storage.delete_empty_dirs_down(&content_root)?;

        Ok(())
    }

    fn restore_after_failed_publish(&self, sealed: &Inventory, object_root: &str) {
        let attempt = || -> Result<()> {
            match sealed.head.previous() {
                Ok(previous) => publish_inventory_files(
                    self.storage,
                    &util::join(object_root, &previous.to_string()),
                    object_root,
                    sealed.digest_algorithm,
                ),
                Err(_) => Ok(()),
            }
        };

        if let Err(e) = attempt() {
            error!(
                "Failed to restore the root inventory of object {} after a failed mutable HEAD \
                 commit. Manual intervention may be required: {}",
                sealed.id, e
            );
        }
    }
}

/// Builds the sealed inventory: revision bookkeeping cleared, unreferenced mutable content
/// pruned, and every `vH/<contentDir>/rK/...` manifest path rewritten to the flattened
/// `vH/<contentDir>/...` layout. Returns the sealed inventory along with the list of
/// `(old, new)` content path moves the storage layer must mirror.
fn seal_inventory(
    inventory: &Inventory,
    version_info: &VersionInfo,
) -> Result<(Inventory, Vec<(ContentPath, ContentPath)>)> {
    let mut sealed = inventory.clone();
    sealed.revision_num = None;
    sealed.current_digest = None;

    let content_dir = sealed.defaulted_content_dir().to_string();
    let head = sealed.head;

    // Collect the mutable content paths, dropping entries no version references any more
    let mut referenced = BTreeSet::new();
    for version in sealed.versions.values() {
        referenced.extend(version.digests());
    }

    let mutable_paths: Vec<(ContentPath, Arc<crate::digest::HexDigest>)> = sealed
        .manifest()
        .iter()
        .filter(|(path, _)| path.version == head && path.revision(&content_dir).is_some())
        .map(|(path, digest)| (path.as_ref().clone(), digest.clone()))
        .collect();

    let mut moves = Vec::new();
    let mut used: HashSet<String> = HashSet::new();

    for (old_path, digest) in mutable_paths {
        sealed.manifest_mut().remove_path(&old_path);

        if !referenced.contains(&digest) {
            sealed.remove_fixity_entries(&old_path);
            continue;
        }

        let suffix = old_path.suffix(&content_dir).ok_or_else(|| {
            OcflError::CorruptObject {
                object_id: sealed.id.clone(),
                message: format!("Malformed mutable HEAD content path {}", old_path),
            }
        })?;

        let mut candidate = suffix.to_string();
        let mut attempt = 0;
        while used.contains(&candidate) {
            attempt += 1;
            candidate = format!("{}-{}", suffix, attempt);
        }
        used.insert(candidate.clone());

        let new_path = ContentPath::build(head, &content_dir, None, &candidate);

        // Carry fixity entries over to the rewritten path
        if let Some(fixity) = inventory.fixity() {
            for (algorithm, block) in fixity {
                if let Some(fixity_digest) = block.get_digest(&old_path) {
                    let fixity_digest = fixity_digest.as_ref().clone();
                    sealed.remove_fixity_entries(&old_path);
                    sealed.add_fixity_entry(*algorithm, fixity_digest, new_path.clone());
                }
            }
        }

        sealed
            .manifest_mut()
            .insert_arc(digest, Arc::new(new_path.clone()));

        moves.push((old_path, new_path));
    }

    // The sealed version carries the commit's metadata
    let state = sealed.head_version().state().clone();
    let created = version_info.created.unwrap_or_else(chrono::Local::now);
    let created = created.with_nanosecond(0).unwrap_or(created);
    sealed.versions.insert(
        head,
        crate::inventory::Version::new(created, state, version_info),
    );

    sealed.validate()?;

    Ok((sealed, moves))
}

/// Strips the leading version directory from a content path, leaving the path relative the
/// version directory
fn strip_version(path: &ContentPath) -> String {
    let prefix = format!("{}/", path.version);
    path.as_str()[prefix.len()..].to_string()
}

#[cfg(test)]
mod tests {
    use super::root_sidecar_snapshot_name;
    use crate::digest::DigestAlgorithm;

    #[test]
    fn snapshot_name_mirrors_the_sidecar_name() {
        assert_eq!(
            "root-inventory.json.sha512",
            root_sidecar_snapshot_name(DigestAlgorithm::Sha512)
        );
        assert_eq!(
            "root-inventory.json.sha256",
            root_sidecar_snapshot_name(DigestAlgorithm::Sha256)
        );
    }
}
