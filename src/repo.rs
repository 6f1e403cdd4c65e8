//! The repository facade.

use std::collections::HashMap;
use std::convert::TryInto;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::cache::InventoryCache;
use crate::config::RepoConfig;
use crate::consts::{
    EXTENSIONS_CONFIG_FILE, EXTENSIONS_DIR, INVENTORY_FILE, MUTABLE_HEAD_DIR, OCFL_LAYOUT_FILE,
};
use crate::digest::DigestAlgorithm;
use crate::error::{not_found, OcflError, Result};
use crate::inventory::Inventory;
use crate::lock::LockManager;
use crate::mutable::MutableHeadController;
use crate::paths::LogicalPath;
use crate::processor::{self, AddOptions, WorkerPools};
use crate::store::fs::FsStorage;
use crate::store::Storage;
use crate::types::{
    FileChange, FileChangeType, ObjectDetails, ObjectVersion, SpecVersion, VersionDetails,
    VersionInfo, VersionNum, VersionRef,
};
use crate::updater::InventoryUpdater;
use crate::util;
use crate::validate::{self, ValidationReport};
use crate::writer::{self, VersionWriter};

/// ocfl_layout.json serialization object
#[derive(Deserialize, Serialize, Debug)]
struct OcflLayout {
    extension: crate::layout::LayoutExtensionName,
    description: String,
}

/// Interface for interacting with an OCFL repository
pub struct OcflRepo {
    storage: Box<dyn Storage>,
    config: RepoConfig,
    lock_manager: LockManager,
    cache: InventoryCache,
    pools: WorkerPools,
    closed: AtomicBool,
}

impl std::fmt::Debug for OcflRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OcflRepo").finish_non_exhaustive()
    }
}

impl OcflRepo {
    /// Opens an existing repository rooted at `storage_root` on the local filesystem
    pub fn fs_repo(storage_root: impl AsRef<Path>) -> Result<Self> {
        Self::fs_repo_with_config(storage_root, RepoConfig::default())
    }

    /// Opens an existing repository with custom options. The repository's namaste and
    /// layout configuration are re-validated; mismatches fail with `RepositoryConfig`.
    pub fn fs_repo_with_config(
        storage_root: impl AsRef<Path>,
        config: RepoConfig,
    ) -> Result<Self> {
        config.validate()?;

        let root = storage_root.as_ref();

        if !root.exists() {
            return Err(OcflError::RepositoryConfig(format!(
                "Storage root {} does not exist",
                root.to_string_lossy()
            )));
        } else if !root.is_dir() {
            return Err(OcflError::RepositoryConfig(format!(
                "Storage root {} is not a directory",
                root.to_string_lossy()
            )));
        }

        let storage = FsStorage::new(root);

        let spec_version = detect_root_spec_version(&storage)?;
        let layout = load_layout(&storage)?;
        check_extensions(&storage)?;

        let mut config = config;
        config.spec_version = spec_version;
        config.layout = layout;

        Self::build(Box::new(storage), config)
    }

    /// Initializes a new repository at `storage_root`, which must be empty or absent
    pub fn init_fs_repo(storage_root: impl AsRef<Path>, config: RepoConfig) -> Result<Self> {
        config.validate()?;

        let root = storage_root.as_ref();

        if root.exists() {
            if !root.is_dir() {
                return Err(OcflError::RepositoryConfig(format!(
                    "Cannot create a repository at {} because it is not a directory",
                    root.to_string_lossy()
                )));
            }
            if !util::dir_is_empty(root)? {
                return Err(OcflError::RepositoryConfig(format!(
                    "Cannot create a repository at {} because it is not empty",
                    root.to_string_lossy()
                )));
            }
        }

        fs::create_dir_all(root)?;

        info!(
            "Initializing OCFL storage root at {}",
            root.to_string_lossy()
        );

        let storage = FsStorage::new(root);

        let namaste = config.spec_version.root_namaste_file();
        storage.write_new(&namaste, SpecVersion::namaste_content(&namaste).as_bytes())?;

        let layout_decl = OcflLayout {
            extension: config.layout.extension_name(),
            description: format!(
                "See the {} extension specification",
                config.layout.extension_name()
            ),
        };
        storage.write_new(OCFL_LAYOUT_FILE, &serde_json::to_vec_pretty(&layout_decl)?)?;

        let config_path = format!(
            "{}/{}/{}",
            EXTENSIONS_DIR,
            config.layout.extension_name(),
            EXTENSIONS_CONFIG_FILE
        );
        storage.write_new(&config_path, &config.layout.serialize_config()?)?;

        Self::build(Box::new(storage), config)
    }

    fn build(storage: Box<dyn Storage>, config: RepoConfig) -> Result<Self> {
        let pools = WorkerPools::new(config.digest_pool_size, config.copy_pool_size)?;

        Ok(Self {
            lock_manager: LockManager::new(config.lock_timeout),
            cache: InventoryCache::new(config.inventory_cache_size, config.inventory_cache_ttl),
            pools,
            storage,
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// Instructs the repository to reject new operations. Worker pools drain when the
    /// repository is dropped.
    pub fn close(&self) {
        info!("Closing OCFL repository");
        self.closed.store(true, Ordering::Release);
    }

    /// Creates a new version of the object whose state is derived entirely from the
    /// contents of `src_path`. If the object does not exist it is created. Content already
    /// present in the object is deduplicated against the manifest.
    ///
    /// Fails with `IllegalState` if the object has an active mutable HEAD.
    pub fn put_object(
        &self,
        object_id: &str,
        src_path: impl AsRef<Path>,
        version_info: VersionInfo,
    ) -> Result<()> {
        self.ensure_open()?;
        let object_id = validated_id(object_id)?;

        self.write_op(object_id, |repo| {
            let updater = match repo.load_inventory_fresh(object_id) {
                Ok(inventory) => InventoryUpdater::blank_state(
                    &inventory,
                    &version_info,
                    repo.config.path_constraints.clone(),
                )?,
                Err(OcflError::NotFound(_)) => InventoryUpdater::new_object(
                    object_id,
                    repo.config.spec_version,
                    repo.config.digest_algorithm,
                    &repo.config.content_directory,
                    &version_info,
                    repo.config.path_constraints.clone(),
                )?,
                Err(e) => return Err(e),
            };

            let adds = processor::enumerate_source(src_path.as_ref(), None)?;

            repo.stage_and_commit(object_id, updater, |repo, updater, staging_physical| {
                processor::process_adds(
                    &repo.pools,
                    updater,
                    staging_physical,
                    adds,
                    &AddOptions {
                        fixity_algorithms: repo.config.fixity_algorithms.clone(),
                        ..Default::default()
                    },
                )
            })
        })
    }

    /// Creates a new version of the object by copying the current head state and applying
    /// the mutations the callback makes through the supplied [`ObjectUpdater`].
    pub fn update_object<F>(
        &self,
        object_id: &str,
        version_info: VersionInfo,
        f: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut ObjectUpdater) -> Result<()>,
    {
        self.ensure_open()?;
        let object_id = validated_id(object_id)?;

        self.write_op(object_id, |repo| {
            let inventory = repo.load_inventory_fresh(object_id)?;
            let updater = InventoryUpdater::copy_state(
                &inventory,
                &version_info,
                repo.config.path_constraints.clone(),
            )?;

            repo.stage_and_commit(object_id, updater, |repo, updater, staging_physical| {
                let mut object_updater = ObjectUpdater {
                    updater,
                    pools: &repo.pools,
                    staging_dir: staging_physical.to_path_buf(),
                    fixity_algorithms: repo.config.fixity_algorithms.clone(),
                };
                f(&mut object_updater)
            })
        })
    }

    /// Reconstructs a version's logical tree at `out_path`, which must not exist yet (its
    /// parent must). Every file is copied through a digest-verifying reader; corrupt
    /// content fails the operation with `Fixity`.
    pub fn get_object(
        &self,
        object_id: &str,
        version: impl Into<VersionRef>,
        out_path: impl AsRef<Path>,
    ) -> Result<()> {
        self.ensure_open()?;
        let object_id = validated_id(object_id)?;
        let version = version.into();
        let out_path = out_path.as_ref();

        if out_path.exists() {
            return Err(OcflError::IllegalArgument(format!(
                "The output path {} must not exist",
                out_path.to_string_lossy()
            )));
        }

        match out_path.parent() {
            Some(parent) if parent.as_os_str().is_empty() || parent.exists() => (),
            _ => {
                return Err(OcflError::IllegalArgument(format!(
                    "The parent of the output path {} must exist",
                    out_path.to_string_lossy()
                )))
            }
        }

        self.lock_manager.do_in_read_lock(object_id, || {
            let inventory = self.load_inventory(object_id)?;
            let object_version = self.object_version(&inventory, version)?;

            fs::create_dir_all(out_path)?;

            for (logical_path, details) in &object_version.state {
                let target = out_path.join(logical_path.as_str());
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }

                let storage_rel = util::join(
                    &inventory.object_root,
                    &inventory.content_path_storage_rel(&details.content_path),
                );

                let mut reader = inventory
                    .digest_algorithm
                    .reader(self.storage.read(&storage_rel)?);
                let mut out = fs::File::create(&target)?;
                std::io::copy(&mut reader, &mut out)?;

                let actual = reader.finalize_hex();
                if actual != *details.digest {
                    return Err(OcflError::Fixity {
                        path: details.content_path.to_string(),
                        expected: details.digest.to_string(),
                        actual: actual.to_string(),
                    });
                }
            }

            Ok(())
        })
    }

    /// Returns a view of a version of an object: a map of logical paths to lazily
    /// retrievable files plus version metadata.
    pub fn get_object_version(
        &self,
        object_id: &str,
        version: impl Into<VersionRef>,
    ) -> Result<ObjectVersion> {
        self.ensure_open()?;
        let object_id = validated_id(object_id)?;
        let version = version.into();

        self.lock_manager.do_in_read_lock(object_id, || {
            let inventory = self.load_inventory(object_id)?;
            self.object_version(&inventory, version)
        })
    }

    /// Opens a digest-verifying reader over a single logical file in a version
    pub fn get_object_file(
        &self,
        object_id: &str,
        logical_path: &str,
        version: impl Into<VersionRef>,
        sink: &mut dyn std::io::Write,
    ) -> Result<()> {
        self.ensure_open()?;
        let object_id = validated_id(object_id)?;
        let version = version.into();
        let logical_path: LogicalPath = logical_path.try_into()?;

        self.lock_manager.do_in_read_lock(object_id, || {
            let inventory = self.load_inventory(object_id)?;
            let content_path = inventory.content_path_for_logical_path(&logical_path, version)?;
            let storage_rel = util::join(
                &inventory.object_root,
                &inventory.content_path_storage_rel(content_path),
            );

            let expected = inventory
                .manifest()
                .get_digest(content_path)
                .expect("content path resolved from the manifest")
                .clone();

            let mut reader = inventory
                .digest_algorithm
                .reader(self.storage.read(&storage_rel)?);
            std::io::copy(&mut reader, sink)?;

            let actual = reader.finalize_hex();
            if actual != *expected {
                return Err(OcflError::Fixity {
                    path: content_path.to_string(),
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }

            Ok(())
        })
    }

    /// Returns metadata about an object's head version
    pub fn describe_object(&self, object_id: &str) -> Result<ObjectDetails> {
        self.ensure_open()?;
        let object_id = validated_id(object_id)?;

        self.lock_manager.do_in_read_lock(object_id, || {
            let inventory = self.load_inventory(object_id)?;

            Ok(ObjectDetails {
                id: inventory.id.clone(),
                object_root: inventory.object_root.clone(),
                digest_algorithm: inventory.digest_algorithm,
                has_staged_changes: inventory.has_mutable_head(),
                version_details: inventory.head_version().details(inventory.head),
            })
        })
    }

    /// Returns metadata about a single version of an object
    pub fn describe_version(
        &self,
        object_id: &str,
        version: impl Into<VersionRef>,
    ) -> Result<VersionDetails> {
        self.ensure_open()?;
        let object_id = validated_id(object_id)?;
        let version = version.into();

        self.lock_manager.do_in_read_lock(object_id, || {
            let inventory = self.load_inventory(object_id)?;
            let version_num = version.resolve(inventory.head);
            Ok(inventory.get_version(version_num)?.details(version_num))
        })
    }

    /// Returns the metadata of every version of the object, in ascending order
    pub fn list_object_versions(&self, object_id: &str) -> Result<Vec<VersionDetails>> {
        self.ensure_open()?;
        let object_id = validated_id(object_id)?;

        self.lock_manager.do_in_read_lock(object_id, || {
            let inventory = self.load_inventory(object_id)?;
            Ok(inventory
                .versions
                .iter()
                .map(|(version_num, version)| version.details(*version_num))
                .collect())
        })
    }

    /// Walks every version of the object and emits one entry per change to the logical
    /// path, in ascending version order.
    pub fn file_change_history(
        &self,
        object_id: &str,
        logical_path: &str,
    ) -> Result<Vec<FileChange>> {
        self.ensure_open()?;
        let object_id = validated_id(object_id)?;
        let logical_path: LogicalPath = logical_path.try_into()?;

        self.lock_manager.do_in_read_lock(object_id, || {
            let inventory = self.load_inventory(object_id)?;
            let path = Arc::new(logical_path.clone());

            let mut changes: Vec<FileChange> = Vec::new();
            let mut current: Option<Arc<crate::digest::HexDigest>> = None;

            for (version_num, version) in &inventory.versions {
                match version.lookup_digest(&logical_path) {
                    Some(digest) => {
                        if current.as_ref() != Some(digest) {
                            let change_type = if current.is_none() {
                                FileChangeType::Added
                            } else {
                                FileChangeType::Modified
                            };
                            changes.push(FileChange {
                                change_type,
                                path: path.clone(),
                                version_details: version.details(*version_num),
                                digest: Some(digest.clone()),
                            });
                            current = Some(digest.clone());
                        }
                    }
                    None => {
                        if current.is_some() {
                            changes.push(FileChange {
                                change_type: FileChangeType::Removed,
                                path: path.clone(),
                                version_details: version.details(*version_num),
                                digest: None,
                            });
                            current = None;
                        }
                    }
                }
            }

            if changes.is_empty() {
                return Err(OcflError::NotFound(format!(
                    "Path {} not found in object {}",
                    logical_path, object_id
                )));
            }

            Ok(changes)
        })
    }

    /// Computes the changes a version applied relative its predecessor
    pub fn version_changes(
        &self,
        object_id: &str,
        version: impl Into<VersionRef>,
    ) -> Result<Vec<FileChange>> {
        self.ensure_open()?;
        let object_id = validated_id(object_id)?;
        let version = version.into();

        self.lock_manager.do_in_read_lock(object_id, || {
            let inventory = self.load_inventory(object_id)?;
            let version_num = version.resolve(inventory.head);
            let details = inventory.get_version(version_num)?.details(version_num);

            Ok(inventory
                .version_changes(version_num)?
                .into_iter()
                .map(|(path, digest)| {
                    let change_type = match &digest {
                        Some(_) => {
                            let previously_present = version_num
                                .previous()
                                .ok()
                                .and_then(|previous| inventory.versions.get(&previous))
                                .map_or(false, |previous| previous.lookup_digest(&path).is_some());
                            if previously_present {
                                FileChangeType::Modified
                            } else {
                                FileChangeType::Added
                            }
                        }
                        None => FileChangeType::Removed,
                    };

                    FileChange {
                        change_type,
                        path,
                        version_details: details.clone(),
                        digest,
                    }
                })
                .collect())
        })
    }

    /// Returns true if the object exists in the repository
    pub fn contains_object(&self, object_id: &str) -> Result<bool> {
        self.ensure_open()?;
        let object_id = validated_id(object_id)?;

        let object_root = self.config.layout.map_object_id(object_id);
        self.object_exists_at(&object_root)
    }

    /// Deletes the object from the repository, pruning any emptied parent directories.
    /// Purging an object that does not exist is a no-op.
    pub fn purge_object(&self, object_id: &str) -> Result<()> {
        self.ensure_open()?;
        let object_id = validated_id(object_id)?;

        self.lock_manager.do_in_write_lock(object_id, || {
            self.cache.invalidate(object_id);

            let object_root = self.config.layout.map_object_id(object_id);

            info!("Purging object {} at {}", object_id, object_root);

            if let Err(e) = self.storage.delete_dir(&object_root) {
                return Err(OcflError::CorruptObject {
                    object_id: object_id.to_string(),
                    message: format!(
                        "Failed to purge the object at {}. It may need to be removed manually: {}",
                        object_root, e
                    ),
                });
            }

            if let Some((parent, _)) = object_root.rsplit_once('/') {
                if let Err(e) = self.storage.delete_empty_dirs_up(parent) {
                    error!(
                        "Failed to clean up dangling directories above {}: {}",
                        object_root, e
                    );
                }
            }

            Ok(())
        })
    }

    /// Rewinds the object to the specified version: versions above it are deleted, its
    /// inventory becomes the root inventory, and any mutable HEAD is discarded. A failure
    /// partway through leaves the object corrupt and reports it as such.
    pub fn rollback_to_version(
        &self,
        object_id: &str,
        version: impl Into<VersionRef>,
    ) -> Result<()> {
        self.ensure_open()?;
        let object_id = validated_id(object_id)?;
        let version = version.into();

        self.lock_manager.do_in_write_lock(object_id, || {
            self.cache.invalidate(object_id);

            let object_root = self.config.layout.map_object_id(object_id);

            if !self
                .storage
                .file_exists(&util::join(&object_root, INVENTORY_FILE))?
            {
                return Err(not_found(object_id, None));
            }

            // The root inventory, never the mutable HEAD inventory: rollback discards
            // staged changes entirely
            let root_inventory = self.parse_inventory_at(&object_root, Some(object_id), false)?;
            let target = version.resolve(root_inventory.head);

            if !root_inventory.versions.contains_key(&target) {
                return Err(not_found(object_id, Some(target)));
            }

            info!("Rolling back object {} to {}", object_id, target);

            MutableHeadController::new(self.storage.as_ref()).purge(&object_root);

            if target == root_inventory.head {
                return Ok(());
            }

            let corrupt = |message: String| OcflError::CorruptObject {
                object_id: object_id.to_string(),
                message,
            };

            let mut to_delete = root_inventory.head;
            while to_delete > target {
                self.storage
                    .delete_dir(&util::join(&object_root, &to_delete.to_string()))
                    .map_err(|e| {
                        corrupt(format!(
                            "rollback failed while deleting {}. Manual intervention is \
                             required: {}",
                            to_delete, e
                        ))
                    })?;
                to_delete = to_delete.previous()?;
            }

            writer::publish_inventory_files(
                self.storage.as_ref(),
                &util::join(&object_root, &target.to_string()),
                &object_root,
                root_inventory.digest_algorithm,
            )
            .map_err(|e| {
                corrupt(format!(
                    "rollback failed while restoring the {} inventory. Manual intervention \
                     is required: {}",
                    target, e
                ))
            })?;

            Ok(())
        })
    }

    /// Creates a new version whose state equals the specified version's. No content is
    /// written; everything is reused from prior versions.
    pub fn replicate_version_as_head(
        &self,
        object_id: &str,
        version: impl Into<VersionRef>,
        version_info: VersionInfo,
    ) -> Result<()> {
        self.ensure_open()?;
        let object_id = validated_id(object_id)?;
        let version = version.into();

        self.write_op(object_id, |repo| {
            let inventory = repo.load_inventory_fresh(object_id)?;
            let src_version = version.resolve(inventory.head);

            let updater = InventoryUpdater::copy_state_from(
                &inventory,
                src_version,
                &version_info,
                repo.config.path_constraints.clone(),
            )?;

            repo.stage_and_commit(object_id, updater, |_, _, _| Ok(()))
        })
    }

    /// Returns an iterator over the IDs of every object in the repository
    pub fn list_object_ids(&self) -> Result<Box<dyn Iterator<Item = Result<String>> + '_>> {
        self.ensure_open()?;

        #[derive(Deserialize)]
        struct IdOnly {
            id: String,
        }

        let iter = self.storage.iterate_objects()?.map(move |object_root| {
            let object_root = object_root?;

            // Objects staged directly into a mutable HEAD have no root inventory yet
            let mut reader = match self.storage.read(&util::join(&object_root, INVENTORY_FILE)) {
                Ok(reader) => reader,
                Err(OcflError::NotFound(_)) => self.storage.read(&util::join(
                    &util::join(&object_root, MUTABLE_HEAD_DIR),
                    INVENTORY_FILE,
                ))?,
                Err(e) => return Err(e),
            };
            let mut bytes = Vec::new();
            reader.read_to_end(&mut bytes)?;

            let id_only: IdOnly = serde_json::from_slice(&bytes).map_err(|e| {
                OcflError::InvalidInventory(format!(
                    "Failed to read the inventory at {}: {}",
                    object_root, e
                ))
            })?;

            Ok(id_only.id)
        });

        Ok(Box::new(iter))
    }

    /// Copies a version directory out of the repository to `dst`, which must not exist.
    /// The exported inventory is verified against its sidecar after the copy.
    pub fn export_version(
        &self,
        object_id: &str,
        version: impl Into<VersionRef>,
        dst: impl AsRef<Path>,
    ) -> Result<()> {
        self.ensure_open()?;
        let object_id = validated_id(object_id)?;
        let version = version.into();
        let dst = dst.as_ref();

        validate_export_dst(dst)?;

        self.lock_manager.do_in_write_lock(object_id, || {
            let inventory = self.load_inventory_fresh(object_id)?;
            let version_num = version.resolve(inventory.head);

            if inventory.has_mutable_head() && version_num == inventory.head {
                return Err(OcflError::IllegalState(format!(
                    "Cannot export version {} of object {} because it is an uncommitted \
                     mutable HEAD",
                    version_num, object_id
                )));
            }

            if !inventory.versions.contains_key(&version_num) {
                return Err(not_found(object_id, Some(version_num)));
            }

            let version_dir = util::join(&inventory.object_root, &version_num.to_string());
            self.storage.copy_dir_out(&version_dir, dst)?;

            verify_exported_inventory(dst, inventory.digest_algorithm)
        })
    }

    /// Copies the entire object root out of the repository to `dst`, which must not exist.
    /// The export is structurally validated afterwards.
    pub fn export_object(&self, object_id: &str, dst: impl AsRef<Path>) -> Result<()> {
        self.ensure_open()?;
        let object_id = validated_id(object_id)?;
        let dst = dst.as_ref();

        validate_export_dst(dst)?;

        self.lock_manager.do_in_write_lock(object_id, || {
            let inventory = self.load_inventory_fresh(object_id)?;

            self.storage.copy_dir_out(&inventory.object_root, dst)?;

            let export_storage = FsStorage::new(dst);
            let exported = parse_inventory(&export_storage, "", Some(object_id), false, false)?;
            let report =
                validate::validate_object(&export_storage, "", Some(object_id), &exported, false)?;

            if report.has_issues() {
                return Err(OcflError::Validation(format!(
                    "{}: exported copy failed validation: {}",
                    object_id,
                    report
                        .issues
                        .iter()
                        .map(|issue| issue.to_string())
                        .collect::<Vec<_>>()
                        .join("; ")
                )));
            }

            Ok(())
        })
    }

    /// Imports a complete OCFL object rooted at `src_path`. The object must validate and
    /// must not already exist in the repository. Objects with a mutable HEAD cannot be
    /// imported.
    pub fn import_object(&self, src_path: impl AsRef<Path>) -> Result<()> {
        self.ensure_open()?;
        let src = src_path.as_ref();

        let src_storage = FsStorage::new(src);

        if src_storage
            .file_exists(&util::join(MUTABLE_HEAD_DIR, INVENTORY_FILE))?
        {
            return Err(OcflError::IllegalState(
                "Cannot import an object that has an active mutable HEAD".to_string(),
            ));
        }

        let incoming = parse_inventory(&src_storage, "", None, false, false)?;
        let object_id = incoming.id.clone();

        let report =
            validate::validate_object(&src_storage, "", Some(&object_id), &incoming, false)?;
        if report.has_issues() {
            return Err(OcflError::Validation(format!(
                "{}: cannot import: {}",
                object_id,
                report
                    .issues
                    .iter()
                    .map(|issue| issue.to_string())
                    .collect::<Vec<_>>()
                    .join("; ")
            )));
        }

        self.lock_manager.do_in_write_lock(&object_id, || {
            if self.contains_object(&object_id)? {
                return Err(OcflError::AlreadyExists(format!("Object {}", object_id)));
            }

            let object_root = self.config.layout.map_object_id(&object_id);

            info!("Importing object {} at {}", object_id, object_root);

            // Copy into staging first so a failed import never leaves a partial object
            let staging = writer::new_staging_dir(&object_id);
            let staging_physical = self.storage.physical_path(&staging);

            let attempt = || -> Result<()> {
                if let Some(parent) = staging_physical.parent() {
                    fs::create_dir_all(parent)?;
                }
                copy_tree(src, &staging_physical)?;

                match self.storage.move_dir_internal(&staging, &object_root) {
                    Ok(()) => Ok(()),
                    Err(OcflError::AlreadyExists(_)) => Err(OcflError::ObjectOutOfSync {
                        object_id: object_id.clone(),
                        message: "another writer created the object first".to_string(),
                    }),
                    Err(e) => Err(e),
                }
            };

            let result = attempt();
            VersionWriter::new(self.storage.as_ref(), false).cleanup_staging(&staging);
            result
        })
    }

    /// Imports a version directory as the object's next version. The directory must hold
    /// the inventory snapshot for exactly the version that follows the current head, and
    /// the inventory's earlier versions must agree with the object's history.
    pub fn import_version(&self, object_id: &str, src_path: impl AsRef<Path>) -> Result<()> {
        self.ensure_open()?;
        let object_id = validated_id(object_id)?;
        let src = src_path.as_ref();

        self.write_op(object_id, |repo| {
            let current = repo.load_inventory_fresh(object_id)?;

            if current.has_mutable_head() {
                return Err(OcflError::IllegalState(format!(
                    "Cannot import a version into object {} because it has an active mutable \
                     HEAD",
                    object_id
                )));
            }

            let src_storage = FsStorage::new(src);
            let mut incoming = parse_inventory(&src_storage, "", Some(object_id), false, false)?;

            let expected_head = current.head.next()?;
            if incoming.head != expected_head {
                return Err(OcflError::IllegalState(format!(
                    "Cannot import version {} into object {} because the next version is {}",
                    incoming.head, object_id, expected_head
                )));
            }

            // The imported history must match what the object already has
            for (version_num, version) in &current.versions {
                let imported = incoming.get_version(*version_num)?;
                if imported.state() != version.state() {
                    return Err(OcflError::IllegalState(format!(
                        "Cannot import version {} into object {} because its record of {} \
                         does not match the object's history",
                        incoming.head, object_id, version_num
                    )));
                }
            }

            incoming.object_root = repo.config.layout.map_object_id(object_id);
            incoming.previous_digest = current.current_digest.clone();

            let staging = writer::new_staging_dir(object_id);
            let staging_physical = repo.storage.physical_path(&staging);

            let attempt = || -> Result<()> {
                if let Some(parent) = staging_physical.parent() {
                    fs::create_dir_all(parent)?;
                }
                copy_tree(src, &staging_physical)?;

                let version_writer = VersionWriter::new(
                    repo.storage.as_ref(),
                    repo.config.check_new_version_fixity,
                );
                version_writer.commit_version(&incoming, &staging)
            };

            let result = attempt();
            VersionWriter::new(repo.storage.as_ref(), false).cleanup_staging(&staging);
            result?;

            repo.cache.put(Arc::new(incoming));
            Ok(())
        })
    }

    /// Cross-checks the object's on-disk state against its inventory. When `full` is true
    /// the digest of every content file is recomputed.
    pub fn validate_object(&self, object_id: &str, full: bool) -> Result<ValidationReport> {
        self.ensure_open()?;
        let object_id = validated_id(object_id)?;

        let object_root = self.config.layout.map_object_id(object_id);

        if !self.object_exists_at(&object_root)? {
            return Err(not_found(object_id, None));
        }

        let inventory = self.parse_inventory_at(&object_root, Some(object_id), true)?;

        validate::validate_object(
            self.storage.as_ref(),
            &object_root,
            Some(object_id),
            &inventory,
            full,
        )
    }

    /// Stages a revision of the object's mutable HEAD. When the object does not exist,
    /// the mutable HEAD becomes its `v1`. The staged changes only become an immutable
    /// version when [`OcflRepo::commit_staged_changes`] is called.
    pub fn stage_changes<F>(
        &self,
        object_id: &str,
        version_info: VersionInfo,
        f: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut ObjectUpdater) -> Result<()>,
    {
        self.ensure_open()?;
        let object_id = validated_id(object_id)?;

        self.write_op(object_id, |repo| {
            let controller = MutableHeadController::new(repo.storage.as_ref());

            let (updater, new_object) = match repo.load_inventory_fresh(object_id) {
                Ok(inventory) => {
                    if inventory.has_mutable_head() {
                        controller.check_sync(&inventory)?;
                    }

                    (
                        InventoryUpdater::copy_state_mutable(
                            &inventory,
                            &version_info,
                            repo.config.path_constraints.clone(),
                        )?,
                        false,
                    )
                }
                Err(OcflError::NotFound(_)) => (
                    InventoryUpdater::new_object_mutable(
                        object_id,
                        repo.config.spec_version,
                        repo.config.digest_algorithm,
                        &repo.config.content_directory,
                        &version_info,
                        repo.config.path_constraints.clone(),
                    )?,
                    true,
                ),
                Err(e) => return Err(e),
            };

            let staging = writer::new_staging_dir(object_id);
            let staging_physical = repo.storage.physical_path(&staging);
            fs::create_dir_all(&staging_physical)?;

            let attempt = || -> Result<()> {
                let mut updater = updater;

                let mut object_updater = ObjectUpdater {
                    updater: &mut updater,
                    pools: &repo.pools,
                    staging_dir: staging_physical.clone(),
                    fixity_algorithms: repo.config.fixity_algorithms.clone(),
                };
                f(&mut object_updater)?;

                let mut new_inventory = updater.build_new_inventory()?;
                new_inventory.object_root = repo.config.layout.map_object_id(object_id);

                if new_object {
                    VersionWriter::new(repo.storage.as_ref(), false)
                        .create_object_root(&new_inventory)?;
                }

                writer::write_inventory_files(&mut new_inventory, &staging_physical)?;

                controller.stage_revision(&new_inventory, &staging)?;

                repo.cache.put(Arc::new(new_inventory));
                Ok(())
            };

            let result = attempt();
            VersionWriter::new(repo.storage.as_ref(), false).cleanup_staging(&staging);
            result
        })
    }

    /// Seals the object's staged changes into an immutable version. A no-op when the
    /// object has no staged changes.
    pub fn commit_staged_changes(
        &self,
        object_id: &str,
        version_info: VersionInfo,
    ) -> Result<()> {
        self.ensure_open()?;
        let object_id = validated_id(object_id)?;

        self.write_op(object_id, |repo| {
            let inventory = repo.load_inventory_fresh(object_id)?;

            if !inventory.has_mutable_head() {
                return Ok(());
            }

            let controller = MutableHeadController::new(repo.storage.as_ref());
            let sealed = controller.commit(&inventory, &version_info)?;

            repo.cache.put(Arc::new(sealed));
            Ok(())
        })
    }

    /// Discards the object's staged changes by deleting the mutable HEAD extension
    pub fn purge_staged_changes(&self, object_id: &str) -> Result<()> {
        self.ensure_open()?;
        let object_id = validated_id(object_id)?;

        self.lock_manager.do_in_write_lock(object_id, || {
            self.cache.invalidate(object_id);

            let object_root = self.config.layout.map_object_id(object_id);
            MutableHeadController::new(self.storage.as_ref()).purge(&object_root);

            // An object whose only version was the mutable HEAD no longer exists
            if !self
                .storage
                .file_exists(&util::join(&object_root, INVENTORY_FILE))?
            {
                self.storage.delete_dir(&object_root)?;
                if let Some((parent, _)) = object_root.rsplit_once('/') {
                    self.storage.delete_empty_dirs_up(parent)?;
                }
            }

            Ok(())
        })
    }

    /// Returns true if the object has an active mutable HEAD. Fails with `NotFound` when
    /// the object does not exist.
    pub fn has_staged_changes(&self, object_id: &str) -> Result<bool> {
        self.ensure_open()?;
        let object_id = validated_id(object_id)?;

        self.lock_manager.do_in_read_lock(object_id, || {
            let inventory = self.load_inventory(object_id)?;
            Ok(inventory.has_mutable_head())
        })
    }

    // ---- internals ----

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(OcflError::Closed)
        } else {
            Ok(())
        }
    }

    /// Runs a write operation under the object's write lock, invalidating the cache when
    /// the operation loses an optimistic concurrency race.
    fn write_op<T>(
        &self,
        object_id: &str,
        f: impl FnOnce(&Self) -> Result<T>,
    ) -> Result<T> {
        let result = self.lock_manager.do_in_write_lock(object_id, || f(self));

        if let Err(OcflError::ObjectOutOfSync { .. }) = &result {
            self.cache.invalidate(object_id);
        }

        result
    }

    /// Stages the updater's pending version into a fresh staging directory via `populate`,
    /// then finalizes and commits it. The staging directory is always cleaned up.
    fn stage_and_commit<F>(
        &self,
        object_id: &str,
        mut updater: InventoryUpdater,
        populate: F,
    ) -> Result<()>
    where
        F: FnOnce(&Self, &mut InventoryUpdater, &Path) -> Result<()>,
    {
        let staging = writer::new_staging_dir(object_id);
        let staging_physical = self.storage.physical_path(&staging);
        fs::create_dir_all(&staging_physical)?;

        let attempt = || -> Result<()> {
            populate(self, &mut updater, &staging_physical)?;

            let mut inventory = updater.build_new_inventory()?;
            inventory.object_root = self.config.layout.map_object_id(object_id);

            writer::write_inventory_files(&mut inventory, &staging_physical)?;

            let version_writer =
                VersionWriter::new(self.storage.as_ref(), self.config.check_new_version_fixity);
            version_writer.commit_version(&inventory, &staging)?;

            self.cache.put(Arc::new(inventory));
            Ok(())
        };

        let result = attempt();
        VersionWriter::new(self.storage.as_ref(), false).cleanup_staging(&staging);
        result
    }

    /// Loads an inventory, preferring the cache
    fn load_inventory(&self, object_id: &str) -> Result<Arc<Inventory>> {
        if let Some(inventory) = self.cache.get(object_id) {
            return Ok(inventory);
        }

        let inventory = Arc::new(self.load_inventory_fresh(object_id)?);
        self.cache.put(inventory.clone());
        Ok(inventory)
    }

    /// Loads an inventory directly from storage, bypassing the cache
    fn load_inventory_fresh(&self, object_id: &str) -> Result<Inventory> {
        let object_root = self.config.layout.map_object_id(object_id);

        if !self.object_exists_at(&object_root)? {
            return Err(not_found(object_id, None));
        }

        self.parse_inventory_at(&object_root, Some(object_id), true)
    }

    /// An object exists when it has a root inventory or, for objects created directly into
    /// a mutable HEAD, a mutable HEAD inventory
    fn object_exists_at(&self, object_root: &str) -> Result<bool> {
        if self
            .storage
            .file_exists(&util::join(object_root, INVENTORY_FILE))?
        {
            return Ok(true);
        }

        self.storage.file_exists(&util::join(
            &util::join(object_root, MUTABLE_HEAD_DIR),
            INVENTORY_FILE,
        ))
    }

    fn parse_inventory_at(
        &self,
        object_root: &str,
        expected_id: Option<&str>,
        resolve_mutable_head: bool,
    ) -> Result<Inventory> {
        parse_inventory(
            self.storage.as_ref(),
            object_root,
            expected_id,
            resolve_mutable_head,
            self.config.verify_inventory_digest,
        )
    }

    /// Builds the `ObjectVersion` projection: each logical path mapped to its content
    /// path, physical location, and the version that last changed it.
    fn object_version(
        &self,
        inventory: &Inventory,
        version: VersionRef,
    ) -> Result<ObjectVersion> {
        let version_num = version.resolve(inventory.head);
        let version = inventory.get_version(version_num)?;

        let mut details_cache: HashMap<VersionNum, Arc<VersionDetails>> = HashMap::new();
        let mut state = HashMap::new();

        for (logical_path, digest) in version.state_iter() {
            // Walk backwards to the version that introduced this digest at this path
            let mut last_update = version_num;
            while let Ok(previous_num) = last_update.previous() {
                let previous = inventory.get_version(previous_num)?;
                if previous.lookup_digest(logical_path) == Some(digest) {
                    last_update = previous_num;
                } else {
                    break;
                }
            }

            let last_details = match details_cache.get(&last_update) {
                Some(details) => details.clone(),
                None => {
                    let details =
                        Arc::new(inventory.get_version(last_update)?.details(last_update));
                    details_cache.insert(last_update, details.clone());
                    details
                }
            };

            let content_path = inventory
                .content_path_for_digest(digest, version_num.into(), Some(logical_path))?
                .clone();

            let storage_path = self
                .storage
                .physical_path(&util::join(
                    &inventory.object_root,
                    &inventory.content_path_storage_rel(&content_path),
                ))
                .to_string_lossy()
                .to_string();

            state.insert(
                logical_path.clone(),
                crate::types::FileDetails {
                    digest: digest.clone(),
                    digest_algorithm: inventory.digest_algorithm,
                    content_path,
                    storage_path,
                    last_update: last_details,
                },
            );
        }

        Ok(ObjectVersion {
            id: inventory.id.clone(),
            object_root: inventory.object_root.clone(),
            digest_algorithm: inventory.digest_algorithm,
            version_details: version.details(version_num),
            state,
        })
    }
}

/// Applies add/remove/rename/reinstate mutations to an in-flight version on behalf of a
/// user callback. New content is written into the staging directory as it is added.
pub struct ObjectUpdater<'a> {
    updater: &'a mut InventoryUpdater,
    pools: &'a WorkerPools,
    staging_dir: PathBuf,
    fixity_algorithms: Vec<DigestAlgorithm>,
}

impl<'a> ObjectUpdater<'a> {
    /// Adds the file or directory tree at `src_path` under the logical path `dst`.
    /// Existing logical paths are only replaced when `overwrite` is set.
    pub fn add_file(
        &mut self,
        src_path: impl AsRef<Path>,
        dst: &str,
        overwrite: bool,
    ) -> Result<()> {
        let adds = processor::enumerate_source(src_path.as_ref(), Some(dst))?;

        processor::process_adds(
            self.pools,
            self.updater,
            &self.staging_dir,
            adds,
            &AddOptions {
                overwrite,
                fixity_algorithms: self.fixity_algorithms.clone(),
                ..Default::default()
            },
        )
    }

    /// Same as [`ObjectUpdater::add_file`], but moves the source files into the staging
    /// directory instead of copying them. The emptied source tree is deleted.
    pub fn move_file(
        &mut self,
        src_path: impl AsRef<Path>,
        dst: &str,
        overwrite: bool,
    ) -> Result<()> {
        let src = src_path.as_ref();
        let adds = processor::enumerate_source(src, Some(dst))?;

        processor::process_adds(
            self.pools,
            self.updater,
            &self.staging_dir,
            adds,
            &AddOptions {
                move_source: true,
                overwrite,
                fixity_algorithms: self.fixity_algorithms.clone(),
            },
        )?;

        processor::clean_source_tree(src)
    }

    /// Removes the logical path from the pending version. Content remains available in
    /// prior versions.
    pub fn remove_file(&mut self, logical_path: &str) -> Result<()> {
        let logical_path: LogicalPath = logical_path.try_into()?;
        let removed = self.updater.remove_file(&logical_path)?;
        self.delete_staged(&removed)
    }

    /// Renames a logical path within the pending version
    pub fn rename_file(&mut self, src: &str, dst: &str, overwrite: bool) -> Result<()> {
        let src: LogicalPath = src.try_into()?;
        let dst: LogicalPath = dst.try_into()?;
        let removed = self.updater.rename_file(&src, dst, overwrite)?;
        self.delete_staged(&removed)
    }

    /// Restores the file a logical path referenced in an earlier version under a new
    /// logical path, without rewriting any content
    pub fn reinstate_file(
        &mut self,
        version: VersionNum,
        src: &str,
        dst: &str,
        overwrite: bool,
    ) -> Result<()> {
        let src: LogicalPath = src.try_into()?;
        let dst: LogicalPath = dst.try_into()?;
        let removed = self.updater.reinstate_file(version, &src, dst, overwrite)?;
        self.delete_staged(&removed)
    }

    fn delete_staged(&self, removed: &[crate::paths::ContentPath]) -> Result<()> {
        for content_path in removed {
            processor::remove_staged_file(
                &self.staging_dir,
                self.updater.content_directory(),
                content_path,
            )?;
        }
        Ok(())
    }
}

fn validated_id(object_id: &str) -> Result<&str> {
    let trimmed = object_id.trim();

    if trimmed.is_empty() {
        return Err(OcflError::IllegalArgument(
            "Object IDs may not be blank".to_string(),
        ));
    }

    Ok(object_id)
}

fn detect_root_spec_version(storage: &FsStorage) -> Result<SpecVersion> {
    for listing in storage.list_dir("")? {
        if listing.is_file() && listing.path().starts_with("0=ocfl_") {
            return SpecVersion::try_from_root_namaste(listing.path());
        }
    }

    Err(OcflError::RepositoryConfig(
        "The storage root does not contain an OCFL namaste file".to_string(),
    ))
}

/// Warns about storage root extensions this implementation does not understand
fn check_extensions(storage: &FsStorage) -> Result<()> {
    for listing in storage.list_dir(EXTENSIONS_DIR)? {
        if listing.is_dir() && !crate::consts::SUPPORTED_EXTENSIONS.contains(&listing.path()) {
            warn!(
                "Storage root extension {} is not supported at this time",
                listing.path()
            );
        }
    }

    Ok(())
}

fn load_layout(storage: &FsStorage) -> Result<crate::layout::StorageLayout> {
    if !storage.file_exists(OCFL_LAYOUT_FILE)? {
        return Err(OcflError::RepositoryConfig(
            "The storage root does not declare a storage layout".to_string(),
        ));
    }

    let declaration: OcflLayout = serde_json::from_str(&storage.read_to_string(OCFL_LAYOUT_FILE)?)
        .map_err(|e| {
            OcflError::RepositoryConfig(format!("Failed to parse {}: {}", OCFL_LAYOUT_FILE, e))
        })?;

    let config_path = format!(
        "{}/{}/{}",
        EXTENSIONS_DIR, declaration.extension, EXTENSIONS_CONFIG_FILE
    );

    let config_bytes = if storage.file_exists(&config_path)? {
        let mut reader = storage.read(&config_path)?;
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Some(bytes)
    } else {
        None
    };

    crate::layout::StorageLayout::new(declaration.extension, config_bytes.as_deref())
}

/// Parses the inventory of the object rooted at `object_root`. When the object has an
/// active mutable HEAD (and `resolve_mutable_head` is set), the mutable HEAD inventory is
/// the one that is returned, with its revision number resolved from the revision markers.
fn parse_inventory(
    storage: &dyn Storage,
    object_root: &str,
    expected_id: Option<&str>,
    resolve_mutable_head: bool,
    verify_digest: bool,
) -> Result<Inventory> {
    let mutable_inventory = util::join(
        &util::join(object_root, MUTABLE_HEAD_DIR),
        INVENTORY_FILE,
    );

    let (inventory_dir, mutable_head) =
        if resolve_mutable_head && storage.file_exists(&mutable_inventory)? {
            (util::join(object_root, MUTABLE_HEAD_DIR), true)
        } else {
            (object_root.to_string(), false)
        };

    let mut reader = storage.read(&util::join(&inventory_dir, INVENTORY_FILE))?;
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;

    let mut inventory: Inventory = serde_json::from_slice(&bytes).map_err(|e| {
        OcflError::InvalidInventory(format!(
            "Failed to parse the inventory at {}: {}",
            inventory_dir, e
        ))
    })?;

    let sidecar_digest =
        writer::read_sidecar_digest(storage, &inventory_dir, inventory.digest_algorithm)?;

    if verify_digest {
        let mut hasher = inventory.digest_algorithm.reader(bytes.as_slice());
        std::io::copy(&mut hasher, &mut std::io::sink())?;
        let computed = hasher.finalize_hex();

        if computed != sidecar_digest {
            return Err(OcflError::CorruptObject {
                object_id: inventory.id.clone(),
                message: format!(
                    "The inventory digest {} does not match its sidecar {}",
                    computed, sidecar_digest
                ),
            });
        }
    }

    inventory.object_root = object_root.to_string();
    inventory.storage_path = storage
        .physical_path(object_root)
        .to_string_lossy()
        .to_string();
    inventory.current_digest = Some(sidecar_digest);

    if mutable_head {
        let controller = MutableHeadController::new(storage);
        inventory.revision_num = match controller.current_revision(object_root)? {
            Some(revision) => Some(revision),
            None => {
                return Err(OcflError::CorruptObject {
                    object_id: inventory.id.clone(),
                    message: "the mutable HEAD has no revision markers".to_string(),
                })
            }
        };
    }

    inventory.validate()?;

    if let Some(expected_id) = expected_id {
        if inventory.id != expected_id {
            return Err(OcflError::CorruptObject {
                object_id: expected_id.to_string(),
                message: format!(
                    "Expected the object at {} to be {} but found {}",
                    object_root, expected_id, inventory.id
                ),
            });
        }
    }

    Ok(inventory)
}

fn validate_export_dst(dst: &Path) -> Result<()> {
    if dst.exists() {
        return Err(OcflError::IllegalArgument(format!(
            "The export destination {} must not exist",
            dst.to_string_lossy()
        )));
    }

    match dst.parent() {
        Some(parent) if parent.as_os_str().is_empty() || parent.exists() => Ok(()),
        _ => Err(OcflError::IllegalArgument(format!(
            "The parent of the export destination {} must exist",
            dst.to_string_lossy()
        ))),
    }
}

fn verify_exported_inventory(dir: &Path, algorithm: DigestAlgorithm) -> Result<()> {
    let exported = FsStorage::new(dir);
    let recorded = writer::read_sidecar_digest(&exported, "", algorithm)?;

    let computed = algorithm.hash_file(dir.join(INVENTORY_FILE))?;

    if computed != recorded {
        return Err(OcflError::Fixity {
            path: dir.join(INVENTORY_FILE).to_string_lossy().to_string(),
            expected: recorded.to_string(),
            actual: computed.to_string(),
        });
    }

    Ok(())
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry?;
        let relative = pathdiff::diff_paths(entry.path(), src).unwrap_or_default();
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}
