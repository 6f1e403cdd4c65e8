//! An embeddable engine for [OCFL repositories](https://ocfl.io/): a content-addressed,
//! versioned object store persisting immutable, append-only object versions on a local
//! filesystem, with support for the
//! [mutable HEAD extension](https://ocfl.github.io/extensions/0005-mutable-head.html).
//!
//! Open or create a repository with [`OcflRepo`]:
//!
//! ```no_run
//! use ocflkit::{OcflRepo, RepoConfig, VersionInfo};
//!
//! # fn main() -> ocflkit::Result<()> {
//! let repo = OcflRepo::init_fs_repo("path/to/storage/root", RepoConfig::default())?;
//! repo.put_object("urn:example:1", "path/to/files", VersionInfo::new())?;
//! # Ok(())
//! # }
//! ```

pub use self::config::RepoConfig;
pub use self::digest::{DigestAlgorithm, HexDigest};
pub use self::error::{MultiError, OcflError, Result};
pub use self::inventory::{Inventory, Version};
pub use self::layout::{LayoutExtensionName, StorageLayout};
pub use self::paths::{ContentPath, LogicalPath, PathConstraints};
pub use self::repo::{ObjectUpdater, OcflRepo};
pub use self::store::fs::FsStorage;
pub use self::store::{Listing, Storage};
pub use self::types::{
    FileChange, FileChangeType, FileDetails, ObjectDetails, ObjectVersion, RevisionNum,
    SpecVersion, VersionDetails, VersionInfo, VersionNum, VersionRef,
};
pub use self::validate::{IssueCode, ValidationIssue, ValidationReport};

mod bimap;
mod cache;
mod config;
mod consts;
mod digest;
mod error;
mod inventory;
mod layout;
mod lock;
mod mutable;
mod paths;
mod processor;
mod repo;
mod store;
mod types;
mod updater;
mod util;
mod validate;
mod writer;
