//! The storage protocol. Implementations are responsible for the byte-level operations the
//! engine composes into atomic version publishes.

use std::io::Read;
use std::path::{Path, PathBuf};

pub mod fs;

use crate::error::Result;

/// Byte-level storage operations over a rooted namespace. All `&str` paths are relative the
/// storage root and use `/` as their separator. `Path` arguments refer to locations outside
/// the rooted namespace, such as staging directories.
pub trait Storage: Send + Sync {
    /// Lists the direct children of the directory. Missing directories list as empty.
    fn list_dir(&self, path: &str) -> Result<Vec<Listing>>;

    /// Lists all files beneath the directory, plus an entry for every empty directory.
    /// Missing directories list as empty.
    fn list_recursive(&self, path: &str) -> Result<Vec<Listing>>;

    /// Returns true if the directory exists and has no children
    fn dir_is_empty(&self, path: &str) -> Result<bool>;

    /// Returns true if a regular file exists at the path
    fn file_exists(&self, path: &str) -> Result<bool>;

    /// Opens the file for reading
    fn read(&self, path: &str) -> Result<Box<dyn Read>>;

    /// Reads the file into a string
    fn read_to_string(&self, path: &str) -> Result<String>;

    /// Writes the bytes to the path. Fails with `AlreadyExists` if a file is already present.
    /// The write is all-or-nothing with respect to readers.
    fn write_new(&self, path: &str, bytes: &[u8]) -> Result<()>;

    /// Creates the directory and any missing parents. Idempotent.
    fn create_directories(&self, path: &str) -> Result<()>;

    /// Copies an external file into the repository, replacing any existing file
    fn copy_file_in(&self, src: &Path, dst: &str) -> Result<()>;

    /// Copies a file within the repository, replacing any existing file
    fn copy_file_internal(&self, src: &str, dst: &str) -> Result<()>;

    /// Recursively copies a repository directory to an external location
    fn copy_dir_out(&self, src: &str, dst: &Path) -> Result<()>;

    /// Moves an external directory into the repository. Fails with `AlreadyExists` if the
    /// destination exists. The move is atomic when source and destination share a volume;
    /// otherwise it falls back to copy-then-delete while preserving the existence check.
    fn move_dir_in(&self, src: &Path, dst: &str) -> Result<()>;

    /// Moves a directory within the repository, with the same semantics as `move_dir_in`
    fn move_dir_internal(&self, src: &str, dst: &str) -> Result<()>;

    /// Deletes the file if it exists
    fn delete_file(&self, path: &str) -> Result<()>;

    /// Deletes all of the files, continuing on failure and reporting every path that could
    /// not be deleted
    fn delete_files(&self, paths: &[String]) -> Result<()>;

    /// Recursively deletes the directory if it exists
    fn delete_dir(&self, path: &str) -> Result<()>;

    /// Removes every empty directory beneath the path, including the path itself when it
    /// ends up empty
    fn delete_empty_dirs_down(&self, path: &str) -> Result<()>;

    /// Removes the directory and its ancestors for as long as they are empty
    fn delete_empty_dirs_up(&self, path: &str) -> Result<()>;

    /// Iterates over the repository's object roots, identified by their object namaste files.
    /// Yields paths relative the storage root.
    fn iterate_objects(&self) -> Result<Box<dyn Iterator<Item = Result<String>> + '_>>;

    /// Maps a repository-relative path to its physical location
    fn physical_path(&self, path: &str) -> PathBuf;
}

/// A directory entry
#[derive(Debug, Hash, Eq, PartialEq, Clone)]
pub enum Listing {
    /// A regular file
    File(String),
    /// A directory
    Directory(String),
    /// Anything that is not a regular file or directory, eg a symlink
    Other(String),
}

impl Listing {
    pub fn path(&self) -> &str {
        match self {
            Listing::File(path) => path,
            Listing::Directory(path) => path,
            Listing::Other(path) => path,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Listing::File(_))
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Listing::Directory(_))
    }
}
