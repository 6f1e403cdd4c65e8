//! Local filesystem storage implementation.

use std::fs::{self, File, ReadDir};
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use log::info;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::consts::{EXTENSIONS_DIR, OBJECT_NAMASTE_PREFIX};
use crate::error::{MultiError, OcflError, Result};
use crate::store::{Listing, Storage};
use crate::util;

/// Storage over a local filesystem directory. Directory moves rely on `rename`, which the
/// engine requires to be atomic; when source and destination are on different volumes the
/// implementation falls back to copying into a hidden sibling and renaming it into place.
pub struct FsStorage {
    storage_root: PathBuf,
}

impl FsStorage {
    pub fn new(storage_root: impl AsRef<Path>) -> Self {
        Self {
            storage_root: storage_root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.storage_root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.storage_root.join(path)
    }

    fn move_dir(&self, src: &Path, dst: &str) -> Result<()> {
        let dst_path = self.resolve(dst);

        if dst_path.exists() {
            return Err(OcflError::AlreadyExists(dst.to_string()));
        }

        if let Some(parent) = dst_path.parent() {
            fs::create_dir_all(parent)?;
        }

        match fs::rename(src, &dst_path) {
            Ok(()) => Ok(()),
            Err(e) if is_cross_device(&e) => {
                // Copy into a hidden sibling first so the final rename stays atomic
                let staged = dst_path.with_file_name(format!(
                    ".{}.{}",
                    dst_path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default(),
                    Uuid::new_v4()
                ));

                copy_dir_recursive(src, &staged)?;

                if let Err(e) = fs::rename(&staged, &dst_path) {
                    let _ = fs::remove_dir_all(&staged);
                    return Err(e.into());
                }

                fs::remove_dir_all(src)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Storage for FsStorage {
    fn list_dir(&self, path: &str) -> Result<Vec<Listing>> {
        let root = self.resolve(path);
        let mut listings = Vec::new();

        if fs::metadata(&root).is_err() {
            return Ok(listings);
        }

        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let file_type = entry.file_type()?;

            if file_type.is_file() {
                listings.push(Listing::File(name));
            } else if file_type.is_dir() {
                listings.push(Listing::Directory(name));
            } else {
                listings.push(Listing::Other(name));
            }
        }

        Ok(listings)
    }

    fn list_recursive(&self, path: &str) -> Result<Vec<Listing>> {
        let root = self.resolve(path);
        let mut listings = Vec::new();

        if fs::metadata(&root).is_err() {
            return Ok(listings);
        }

        for entry in WalkDir::new(&root).contents_first(true) {
            let entry = entry?;

            let relative = pathdiff::diff_paths(entry.path(), &root)
                .unwrap_or_default()
                .to_string_lossy()
                .to_string();
            let relative = util::backslash_to_forward(&relative).to_string();

            if entry.file_type().is_file() {
                listings.push(Listing::File(relative));
            } else if entry.file_type().is_dir() {
                if entry.path() != root && util::dir_is_empty(entry.path())? {
                    listings.push(Listing::Directory(relative));
                }
            } else {
                listings.push(Listing::Other(relative));
            }
        }

        Ok(listings)
    }

    fn dir_is_empty(&self, path: &str) -> Result<bool> {
        util::dir_is_empty(self.resolve(path))
    }

    fn file_exists(&self, path: &str) -> Result<bool> {
        Ok(self.resolve(path).is_file())
    }

    fn read(&self, path: &str) -> Result<Box<dyn Read>> {
        match File::open(self.resolve(path)) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(OcflError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn read_to_string(&self, path: &str) -> Result<String> {
        let mut reader = self.read(path)?;
        let mut value = String::new();
        reader.read_to_string(&mut value)?;
        Ok(value)
    }

    fn write_new(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let dst = self.resolve(path);

        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write a temp file, then hard link it into place. The link fails atomically if the
        // destination already exists, and readers never observe a partial file.
        let temp = temp_sibling(&dst);
        File::create(&temp)?.write_all(bytes)?;

        let result = fs::hard_link(&temp, &dst);
        let _ = fs::remove_file(&temp);

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(OcflError::AlreadyExists(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn create_directories(&self, path: &str) -> Result<()> {
        fs::create_dir_all(self.resolve(path))?;
        Ok(())
    }

    fn copy_file_in(&self, src: &Path, dst: &str) -> Result<()> {
        let dst_path = self.resolve(dst);

        if let Some(parent) = dst_path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Copy to a temp sibling and rename so replacement is atomic
        let temp = temp_sibling(&dst_path);
        fs::copy(src, &temp)?;

        if let Err(e) = fs::rename(&temp, &dst_path) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }

        Ok(())
    }

    fn copy_file_internal(&self, src: &str, dst: &str) -> Result<()> {
        self.copy_file_in(&self.resolve(src), dst)
    }

    fn copy_dir_out(&self, src: &str, dst: &Path) -> Result<()> {
        copy_dir_recursive(&self.resolve(src), dst)
    }

    fn move_dir_in(&self, src: &Path, dst: &str) -> Result<()> {
        self.move_dir(src, dst)
    }

    fn move_dir_internal(&self, src: &str, dst: &str) -> Result<()> {
        self.move_dir(&self.resolve(src), dst)
    }

    fn delete_file(&self, path: &str) -> Result<()> {
        util::remove_file_ignore_not_found(self.resolve(path))?;
        Ok(())
    }

    fn delete_files(&self, paths: &[String]) -> Result<()> {
        let mut failures = Vec::new();

        for path in paths {
            if let Err(e) = util::remove_file_ignore_not_found(self.resolve(path)) {
                failures.push(format!("Failed to delete {}: {}", path, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(OcflError::Multiple(MultiError(failures)))
        }
    }

    fn delete_dir(&self, path: &str) -> Result<()> {
        let dir = self.resolve(path);

        if let Err(e) = fs::remove_dir_all(&dir) {
            if e.kind() != ErrorKind::NotFound {
                return Err(e.into());
            }
        }

        Ok(())
    }

    fn delete_empty_dirs_down(&self, path: &str) -> Result<()> {
        let root = self.resolve(path);

        if !root.exists() {
            return Ok(());
        }

        for entry in WalkDir::new(&root).contents_first(true) {
            let entry = entry?;
            if entry.file_type().is_dir() && util::dir_is_empty(entry.path())? {
                fs::remove_dir(entry.path())?;
            }
        }

        Ok(())
    }

    fn delete_empty_dirs_up(&self, path: &str) -> Result<()> {
        let mut current = self.resolve(path);

        while current.starts_with(&self.storage_root)
            && current != self.storage_root
            && current.is_dir()
            && util::dir_is_empty(&current)?
        {
            fs::remove_dir(&current)?;
            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => break,
            }
        }

        Ok(())
    }

    fn iterate_objects(&self) -> Result<Box<dyn Iterator<Item = Result<String>> + '_>> {
        Ok(Box::new(ObjectRootIter::new(&self.storage_root)?))
    }

    fn physical_path(&self, path: &str) -> PathBuf {
        self.resolve(path)
    }
}

/// Walks the storage root looking for directories containing an object namaste file.
/// Extension directories are not descended into.
struct ObjectRootIter {
    root: PathBuf,
    dir_iters: Vec<ReadDir>,
    current: Option<ReadDir>,
}

impl ObjectRootIter {
    fn new(root: &Path) -> Result<Self> {
        Ok(Self {
            root: root.to_path_buf(),
            dir_iters: Vec::new(),
            current: Some(fs::read_dir(root)?),
        })
    }

    fn handle_dir(&mut self, path: PathBuf) -> Option<Result<String>> {
        if path.file_name().unwrap_or_default() == EXTENSIONS_DIR {
            return None;
        }

        match is_object_root(&path) {
            Ok(true) => {
                let relative = pathdiff::diff_paths(&path, &self.root)
                    .unwrap_or_default()
                    .to_string_lossy()
                    .to_string();
                Some(Ok(util::backslash_to_forward(&relative).to_string()))
            }
            Ok(false) => match fs::read_dir(&path) {
                Ok(next) => {
                    if let Some(current) = self.current.take() {
                        self.dir_iters.push(current);
                    }
                    self.current = Some(next);
                    None
                }
                Err(e) => Some(Err(e.into())),
            },
            Err(e) => Some(Err(e)),
        }
    }
}

impl Iterator for ObjectRootIter {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                self.current = self.dir_iters.pop();
                self.current.as_ref()?;
            }

            let entry = self.current.as_mut().unwrap().next();

            match entry {
                None => {
                    self.current = None;
                }
                Some(Err(e)) => return Some(Err(e.into())),
                Some(Ok(entry)) => {
                    let file_type = match entry.file_type() {
                        Ok(file_type) => file_type,
                        Err(e) => return Some(Err(e.into())),
                    };

                    if file_type.is_dir() {
                        if let Some(result) = self.handle_dir(entry.path()) {
                            return Some(result);
                        }
                    }
                }
            }
        }
    }
}

/// Returns true if the directory contains an object namaste file
fn is_object_root(path: &Path) -> Result<bool> {
    for entry in fs::read_dir(path)? {
        let entry_path = entry?.path();
        if entry_path.is_file()
            && entry_path
                .file_name()
                .unwrap_or_default()
                .to_str()
                .map_or(false, |name| name.starts_with(OBJECT_NAMASTE_PREFIX))
        {
            return Ok(true);
        }
    }
    Ok(false)
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    info!(
        "Copying {} to {}",
        src.to_string_lossy(),
        dst.to_string_lossy()
    );

    for entry in WalkDir::new(src) {
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

fn temp_sibling(path: &Path) -> PathBuf {
    path.with_file_name(format!(
        ".{}.{}",
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        Uuid::new_v4()
    ))
}

fn is_cross_device(e: &io::Error) -> bool {
    #[cfg(unix)]
    {
        e.raw_os_error() == Some(18)
    }
    #[cfg(windows)]
    {
        e.raw_os_error() == Some(17)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = e;
        false
    }
}
