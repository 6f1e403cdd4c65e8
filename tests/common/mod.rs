use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use ocflkit::{OcflRepo, RepoConfig};
use tempfile::TempDir;

pub fn init_repo(temp: &TempDir) -> Result<OcflRepo> {
    Ok(OcflRepo::init_fs_repo(
        temp.path().join("root"),
        RepoConfig::default(),
    )?)
}

pub fn init_repo_with_config(temp: &TempDir, config: RepoConfig) -> Result<OcflRepo> {
    Ok(OcflRepo::init_fs_repo(temp.path().join("root"), config)?)
}

pub fn repo_root(temp: &TempDir) -> PathBuf {
    temp.path().join("root")
}

/// Writes the supplied `relative path -> content` pairs beneath `base`
pub fn write_tree(base: &Path, files: &[(&str, &str)]) -> Result<()> {
    for (path, content) in files {
        let full = base.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(full, content)?;
    }
    Ok(())
}

/// Reads every file beneath the directory into a `relative path -> content` map
pub fn read_tree(base: &Path) -> Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();

    for entry in walk(base)? {
        let relative = entry
            .strip_prefix(base)?
            .to_string_lossy()
            .replace('\\', "/");
        files.insert(relative, fs::read_to_string(&entry)?);
    }

    Ok(files)
}

fn walk(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            files.extend(walk(&entry.path())?);
        } else {
            files.push(entry.path());
        }
    }

    Ok(files)
}
