//! Structural validation of on-disk objects against their inventories.

use core::fmt;
use std::convert::TryFrom;
use std::fmt::{Display, Formatter};

use crate::consts::{EXTENSIONS_DIR, INVENTORY_FILE, OBJECT_NAMASTE_PREFIX};
use crate::error::Result;
use crate::inventory::Inventory;
use crate::store::Storage;
use crate::types::VersionNum;
use crate::util;
use crate::writer::sidecar_name;

/// The kinds of problems the validator reports
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum IssueCode {
    MissingNamaste,
    InventoryParse,
    InventoryInvalid,
    IdMismatch,
    SidecarMissing,
    SidecarMismatch,
    MissingVersionDir,
    UnexpectedVersionDir,
    MissingContentFile,
    UnreferencedFile,
    DigestMismatch,
}

/// A single problem found while validating an object
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub code: IssueCode,
    pub message: String,
}

/// The outcome of validating an object. An empty issue list means the object passed.
#[derive(Debug)]
pub struct ValidationReport {
    pub object_id: String,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn has_issues(&self) -> bool {
        !self.issues.is_empty()
    }

    fn issue(&mut self, code: IssueCode, message: String) {
        self.issues.push(ValidationIssue { code, message });
    }
}

impl Display for ValidationIssue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.code, self.message)
    }
}

/// Cross-checks the on-disk state of an object against its inventory. When `fixity_check`
/// is true, the digest of every content file is recomputed.
pub(crate) fn validate_object(
    storage: &dyn Storage,
    object_root: &str,
    expected_id: Option<&str>,
    inventory: &Inventory,
    fixity_check: bool,
) -> Result<ValidationReport> {
    let mut report = ValidationReport {
        object_id: inventory.id.clone(),
        issues: Vec::new(),
    };

    check_namaste(storage, object_root, &mut report)?;

    if let Some(expected_id) = expected_id {
        if expected_id != inventory.id {
            report.issue(
                IssueCode::IdMismatch,
                format!(
                    "inventory declares id {} but {} was expected",
                    inventory.id, expected_id
                ),
            );
        }
    }

    if let Err(e) = inventory.validate() {
        report.issue(IssueCode::InventoryInvalid, e.to_string());
    }

    check_sidecar(storage, object_root, inventory, &mut report)?;
    check_version_dirs(storage, object_root, inventory, &mut report)?;
    check_content(storage, object_root, inventory, fixity_check, &mut report)?;

    Ok(report)
}

fn check_namaste(
    storage: &dyn Storage,
    object_root: &str,
    report: &mut ValidationReport,
) -> Result<()> {
    let has_namaste = storage.list_dir(object_root)?.iter().any(|listing| {
        listing.is_file() && listing.path().starts_with(OBJECT_NAMASTE_PREFIX)
    });

    if !has_namaste {
        report.issue(
            IssueCode::MissingNamaste,
            format!("object root {} has no object namaste file", object_root),
        );
    }

    Ok(())
}

fn check_sidecar(
    storage: &dyn Storage,
    object_root: &str,
    inventory: &Inventory,
    report: &mut ValidationReport,
) -> Result<()> {
    let sidecar_path = util::join(object_root, &sidecar_name(inventory.digest_algorithm));

    if !storage.file_exists(&sidecar_path)? {
        report.issue(
            IssueCode::SidecarMissing,
            format!("inventory sidecar {} is missing", sidecar_path),
        );
        return Ok(());
    }

    let recorded = storage
        .read_to_string(&sidecar_path)?
        .split_whitespace()
        .next()
        .map(crate::digest::HexDigest::from);

    let mut reader = inventory
        .digest_algorithm
        .reader(storage.read(&util::join(object_root, INVENTORY_FILE))?);
    std::io::copy(&mut reader, &mut std::io::sink())?;
    let computed = reader.finalize_hex();

    match recorded {
        Some(recorded) if recorded == computed => (),
        Some(recorded) => report.issue(
            IssueCode::SidecarMismatch,
            format!(
                "sidecar records {} but the inventory digest is {}",
                recorded, computed
            ),
        ),
        None => report.issue(
            IssueCode::SidecarMismatch,
            format!("sidecar {} is empty", sidecar_path),
        ),
    }

    Ok(())
}

fn check_version_dirs(
    storage: &dyn Storage,
    object_root: &str,
    inventory: &Inventory,
    report: &mut ValidationReport,
) -> Result<()> {
    // The head version of a mutable HEAD lives under the extensions dir, not in a version dir
    let expect_head_dir = !inventory.has_mutable_head();

    for version_num in inventory.versions.keys() {
        if *version_num == inventory.head && !expect_head_dir {
            continue;
        }

        let version_dir = util::join(object_root, &version_num.to_string());
        if !storage.file_exists(&util::join(&version_dir, INVENTORY_FILE))? {
            report.issue(
                IssueCode::MissingVersionDir,
                format!("version directory {} is missing or has no inventory", version_num),
            );
        }
    }

    for listing in storage.list_dir(object_root)? {
        if !listing.is_dir() || listing.path() == EXTENSIONS_DIR {
            continue;
        }

        match VersionNum::try_from(listing.path()) {
            Ok(version_num) => {
                if !inventory.versions.contains_key(&version_num) {
                    report.issue(
                        IssueCode::UnexpectedVersionDir,
                        format!("version directory {} is not in the inventory", version_num),
                    );
                }
            }
            Err(_) => report.issue(
                IssueCode::UnexpectedVersionDir,
                format!("unexpected directory {} in the object root", listing.path()),
            ),
        }
    }

    Ok(())
}

fn check_content(
    storage: &dyn Storage,
    object_root: &str,
    inventory: &Inventory,
    fixity_check: bool,
    report: &mut ValidationReport,
) -> Result<()> {
    // Every manifest entry must resolve to a file on disk
    for (content_path, digest) in inventory.manifest().iter() {
        let storage_rel = util::join(
            object_root,
            &inventory.content_path_storage_rel(content_path),
        );

        if !storage.file_exists(&storage_rel)? {
            report.issue(
                IssueCode::MissingContentFile,
                format!("content file {} is missing", content_path),
            );
            continue;
        }

        if fixity_check {
            let mut reader = inventory.digest_algorithm.reader(storage.read(&storage_rel)?);
            std::io::copy(&mut reader, &mut std::io::sink())?;
            let computed = reader.finalize_hex();

            if computed != **digest {
                report.issue(
                    IssueCode::DigestMismatch,
                    format!(
                        "content file {} has digest {} but the manifest records {}",
                        content_path, computed, digest
                    ),
                );
            }
        }
    }

    // Files in version content directories that the manifest does not reference
    for version_num in inventory.versions.keys() {
        if *version_num == inventory.head && inventory.has_mutable_head() {
            continue;
        }

        let content_rel = util::join(
            &version_num.to_string(),
            inventory.defaulted_content_dir(),
        );

        for listing in storage.list_recursive(&util::join(object_root, &content_rel))? {
            if !listing.is_file() {
                continue;
            }

            let content_path =
                crate::paths::ContentPath::try_from(util::join(&content_rel, listing.path()))?;

            if !inventory.manifest().contains_path(&content_path) {
                report.issue(
                    IssueCode::UnreferencedFile,
                    format!("file {} is not referenced by the manifest", content_path),
                );
            }
        }
    }

    Ok(())
}
