//! Staging-directory construction and the atomic commit protocol.

use std::convert::TryFrom;
use std::fs::File;
use std::path::Path;
use std::thread;
use std::time::Duration;

use log::{error, info};
use rand::Rng;
use uuid::Uuid;

use crate::consts::{INVENTORY_FILE, STAGING_EXT_DIR};
use crate::digest::{DigestAlgorithm, HexDigest};
use crate::error::{OcflError, Result};
use crate::inventory::Inventory;
use crate::paths::ContentPath;
use crate::store::Storage;
use crate::util;

const PUBLISH_ATTEMPTS: u32 = 5;
const BACKOFF_START: Duration = Duration::from_millis(5);
const BACKOFF_CAP: Duration = Duration::from_millis(200);
const BACKOFF_JITTER_MS: i64 = 10;

/// Returns the name of an inventory sidecar file for the algorithm, eg `inventory.json.sha512`
pub fn sidecar_name(algorithm: DigestAlgorithm) -> String {
    format!("{}.{}", INVENTORY_FILE, algorithm)
}

/// Allocates a unique staging directory for the object, relative the storage root. The
/// object ID is hashed so that any ID maps to a safe directory name.
pub fn new_staging_dir(object_id: &str) -> String {
    let id_hash = DigestAlgorithm::Sha256
        .hash_hex(&mut object_id.as_bytes())
        .expect("hashing a string cannot fail");

    format!("{}/{}/{}", STAGING_EXT_DIR, id_hash, Uuid::new_v4())
}

/// Serializes the inventory into `dir/inventory.json`, records the digest of the serialized
/// bytes as the inventory's current digest, and writes the matching sidecar.
pub fn write_inventory_files(inventory: &mut Inventory, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;

    let inventory_path = dir.join(INVENTORY_FILE);
    let mut writer = inventory
        .digest_algorithm
        .writer(File::create(&inventory_path)?);

    serde_json::to_writer_pretty(&mut writer, inventory)?;

    let digest = writer.finalize_hex();

    let sidecar_path = dir.join(sidecar_name(inventory.digest_algorithm));
    std::fs::write(
        &sidecar_path,
        format!("{}\t{}\n", digest, INVENTORY_FILE),
    )?;

    inventory.current_digest = Some(digest);

    Ok(())
}

/// Reads the digest recorded in the inventory sidecar within the specified directory
pub fn read_sidecar_digest(
    storage: &dyn Storage,
    dir: &str,
    algorithm: DigestAlgorithm,
) -> Result<HexDigest> {
    let path = util::join(dir, &sidecar_name(algorithm));
    let contents = storage.read_to_string(&path)?;

    match contents.split_whitespace().next() {
        Some(digest) => Ok(digest.into()),
        None => Err(OcflError::CorruptObject {
            object_id: dir.to_string(),
            message: format!("Inventory sidecar at {} is empty", path),
        }),
    }
}

/// Copies `inventory.json` and its sidecar from one repository directory to another,
/// retrying transient IO failures with exponential backoff. The sidecar is copied last so
/// that a partial publish leaves the prior sidecar valid.
pub fn publish_inventory_files(
    storage: &dyn Storage,
    src_dir: &str,
    dst_dir: &str,
    algorithm: DigestAlgorithm,
) -> Result<()> {
    with_retries(|| {
        storage.copy_file_internal(
            &util::join(src_dir, INVENTORY_FILE),
            &util::join(dst_dir, INVENTORY_FILE),
        )
    })?;

    with_retries(|| {
        storage.copy_file_internal(
            &util::join(src_dir, &sidecar_name(algorithm)),
            &util::join(dst_dir, &sidecar_name(algorithm)),
        )
    })
}

fn with_retries(mut f: impl FnMut() -> Result<()>) -> Result<()> {
    let mut delay = BACKOFF_START;

    for attempt in 1..=PUBLISH_ATTEMPTS {
        match f() {
            Ok(()) => return Ok(()),
            Err(e @ OcflError::Io(_)) if attempt < PUBLISH_ATTEMPTS => {
                info!("Retrying inventory publish after IO error: {}", e);
                let jitter = rand::thread_rng().gen_range(-BACKOFF_JITTER_MS..=BACKOFF_JITTER_MS);
                let millis = (delay.as_millis() as i64 + jitter).max(0) as u64;
                thread::sleep(Duration::from_millis(millis));
                delay = (delay * 2).min(BACKOFF_CAP);
            }
            Err(e) => return Err(e),
        }
    }

    unreachable!("the final attempt either returned or errored")
}

/// Publishes staged immutable versions. The caller must hold the object's write lock for
/// the duration of `commit_version`.
pub(crate) struct VersionWriter<'a> {
    storage: &'a dyn Storage,
    check_new_version_fixity: bool,
}

impl<'a> VersionWriter<'a> {
    pub fn new(storage: &'a dyn Storage, check_new_version_fixity: bool) -> Self {
        Self {
            storage,
            check_new_version_fixity,
        }
    }

    /// Moves the staged version directory into the object root and publishes the new root
    /// inventory. On failure the object is restored to its prior state: the new version
    /// directory never survives a failed commit.
    pub fn commit_version(&self, inventory: &Inventory, staging_dir: &str) -> Result<()> {
        let object_root = inventory.object_root.clone();
        let version_dir = util::join(&object_root, &inventory.head.to_string());

        if inventory.is_new() {
            self.create_object_root(inventory)?;
        }

        info!(
            "Committing version {} of object {}",
            inventory.head, inventory.id
        );

        match self.storage.move_dir_internal(staging_dir, &version_dir) {
            Ok(()) => (),
            Err(OcflError::AlreadyExists(_)) => {
                return Err(OcflError::ObjectOutOfSync {
                    object_id: inventory.id.clone(),
                    message: format!("version {} already exists", inventory.head),
                });
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = self.verify_and_publish(inventory, &object_root, &version_dir) {
            self.rollback_version_dir(inventory, &version_dir, staging_dir);
            return Err(e);
        }

        Ok(())
    }

    /// Deletes a staging directory, pruning emptied parents. Failures are logged, not raised.
    pub fn cleanup_staging(&self, staging_dir: &str) {
        if let Err(e) = self.storage.delete_dir(staging_dir) {
            error!("Failed to clean up staging directory {}: {}", staging_dir, e);
            return;
        }

        let parent = match staging_dir.rsplit_once('/') {
            Some((parent, _)) => parent.to_string(),
            None => return,
        };

        if let Err(e) = self.storage.delete_empty_dirs_up(&parent) {
            error!(
                "Failed to clean up staging directory parents {}: {}",
                parent, e
            );
        }
    }

    /// Creates an object root containing only its namaste file. Losing the creation race
    /// to a concurrent writer surfaces as `ObjectOutOfSync`.
    pub(crate) fn create_object_root(&self, inventory: &Inventory) -> Result<()> {
        let spec_version = inventory.spec_version()?;
        let namaste_file = spec_version.object_namaste_file();

        self.storage.create_directories(&inventory.object_root)?;

        let namaste_path = util::join(&inventory.object_root, &namaste_file);
        match self.storage.write_new(
            &namaste_path,
            crate::types::SpecVersion::namaste_content(&namaste_file).as_bytes(),
        ) {
            Ok(()) => Ok(()),
            Err(OcflError::AlreadyExists(_)) => Err(OcflError::ObjectOutOfSync {
                object_id: inventory.id.clone(),
                message: "another writer created the object first".to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    fn verify_and_publish(
        &self,
        inventory: &Inventory,
        object_root: &str,
        version_dir: &str,
    ) -> Result<()> {
        // Optimistic concurrency: the root sidecar must still carry the digest the update
        // was based on
        if let Some(previous_digest) = &inventory.previous_digest {
            let root_digest =
                read_sidecar_digest(self.storage, object_root, inventory.digest_algorithm)?;

            if &root_digest != previous_digest {
                return Err(OcflError::ObjectOutOfSync {
                    object_id: inventory.id.clone(),
                    message: "the object was modified by another writer".to_string(),
                });
            }
        }

        if self.check_new_version_fixity {
            self.verify_version_content(inventory, version_dir)?;
        }

        if let Err(e) = publish_inventory_files(
            self.storage,
            version_dir,
            object_root,
            inventory.digest_algorithm,
        ) {
            self.restore_root_inventory(inventory, object_root);
            return Err(e);
        }

        Ok(())
    }

    /// Recomputes the digest of every file in the new version's content directory and
    /// compares it to the manifest
    fn verify_version_content(&self, inventory: &Inventory, version_dir: &str) -> Result<()> {
        let content_dir = util::join(version_dir, inventory.defaulted_content_dir());
        let version_prefix = util::join(
            &inventory.head.to_string(),
            inventory.defaulted_content_dir(),
        );

        for listing in self.storage.list_recursive(&content_dir)? {
            if !listing.is_file() {
                continue;
            }

            let content_path =
                ContentPath::try_from(util::join(&version_prefix, listing.path()))?;

            let expected = match inventory.manifest().get_digest(&content_path) {
                Some(digest) => digest.clone(),
                None => {
                    return Err(OcflError::CorruptObject {
                        object_id: inventory.id.clone(),
                        message: format!("File {} is not in the manifest", content_path),
                    })
                }
            };

            let mut reader = inventory
                .digest_algorithm
                .reader(self.storage.read(&util::join(&content_dir, listing.path()))?);
            std::io::copy(&mut reader, &mut std::io::sink())?;
            let actual = reader.finalize_hex();

            if actual != *expected {
                return Err(OcflError::Fixity {
                    path: content_path.to_string(),
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Returns the object to its pre-commit state after a failure, best-effort
    fn rollback_version_dir(&self, inventory: &Inventory, version_dir: &str, staging_dir: &str) {
        info!(
            "Rolling back version {} of object {}",
            inventory.head, inventory.id
        );

        if let Err(e) = self.storage.move_dir_internal(version_dir, staging_dir) {
            error!(
                "Failed to roll back version directory {}; attempting to delete it: {}",
                version_dir, e
            );
            if let Err(e) = self.storage.delete_dir(version_dir) {
                error!(
                    "Failed to delete partial version directory {}. Manual intervention may be \
                     required: {}",
                    version_dir, e
                );
            }
        }
    }

    /// Restores the root inventory after a failed publish: from the prior version's
    /// snapshot, or, for brand new objects without a root inventory yet, by purging the
    /// object root entirely.
    fn restore_root_inventory(&self, inventory: &Inventory, object_root: &str) {
        let attempt = || -> Result<()> {
            if inventory.is_new() {
                let root_inventory = util::join(object_root, INVENTORY_FILE);
                if !self.storage.file_exists(&root_inventory)? {
                    self.storage.delete_dir(object_root)?;
                    self.storage.delete_empty_dirs_up(object_root)?;
                }
                return Ok(());
            }

            let previous_dir = util::join(
                object_root,
                &inventory.head.previous()?.to_string(),
            );

            publish_inventory_files(
                self.storage,
                &previous_dir,
                object_root,
                inventory.digest_algorithm,
            )
        };

        if let Err(e) = attempt() {
            error!(
                "Failed to restore the root inventory of object {}. The object may be corrupt: {}",
                inventory.id, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Local;
    use tempfile::TempDir;

    use super::{read_sidecar_digest, sidecar_name, write_inventory_files};
    use crate::digest::DigestAlgorithm;
    use crate::inventory::Inventory;
    use crate::store::fs::FsStorage;
    use crate::types::{SpecVersion, VersionInfo};

    #[test]
    fn sidecar_names_include_the_algorithm() {
        assert_eq!("inventory.json.sha512", sidecar_name(DigestAlgorithm::Sha512));
        assert_eq!("inventory.json.sha256", sidecar_name(DigestAlgorithm::Sha256));
    }

    #[test]
    fn staging_dirs_are_unique_per_call() {
        let first = super::new_staging_dir("o1");
        let second = super::new_staging_dir("o1");

        assert_ne!(first, second);
        assert!(first.starts_with("extensions/ocflkit-staging/"));
    }

    #[test]
    fn written_sidecar_matches_inventory_digest() {
        let temp = TempDir::new().unwrap();
        let storage = FsStorage::new(temp.path());

        let mut inventory = Inventory::new_object(
            "o1",
            SpecVersion::Ocfl1_1,
            DigestAlgorithm::Sha512,
            "content",
            Local::now(),
            &VersionInfo::new(),
        )
        .unwrap();

        write_inventory_files(&mut inventory, temp.path()).unwrap();

        let recorded = read_sidecar_digest(&storage, "", DigestAlgorithm::Sha512).unwrap();
        assert_eq!(inventory.current_digest.clone().unwrap(), recorded);

        // The sidecar digest matches a fresh hash of the inventory file
        let computed = DigestAlgorithm::Sha512
            .hash_file(temp.path().join("inventory.json"))
            .unwrap();
        assert_eq!(computed, recorded);

        // Sidecar format: "<digest>\tinventory.json\n"
        let raw = std::fs::read_to_string(temp.path().join("inventory.json.sha512")).unwrap();
        assert!(raw.ends_with("\tinventory.json\n"));
    }
}
