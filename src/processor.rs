//! Parallel ingest of files into a staging content directory.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use log::info;
use rayon::prelude::*;
use rayon::ThreadPool;
use walkdir::WalkDir;

use crate::digest::{DigestAlgorithm, HexDigest, MultiDigestWriter};
use crate::error::{OcflError, Result};
use crate::paths::LogicalPath;
use crate::updater::InventoryUpdater;
use crate::util;

/// The two bounded worker pools the engine shares across objects: one for digest
/// computation and one for copying or moving content files.
pub struct WorkerPools {
    digest_pool: ThreadPool,
    copy_pool: ThreadPool,
}

impl WorkerPools {
    pub fn new(digest_pool_size: usize, copy_pool_size: usize) -> Result<Self> {
        let digest_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(digest_pool_size)
            .thread_name(|i| format!("ocfl-digest-{}", i))
            .build()
            .map_err(|e| OcflError::RepositoryConfig(format!("Failed to build digest pool: {}", e)))?;

        let copy_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(copy_pool_size)
            .thread_name(|i| format!("ocfl-copy-{}", i))
            .build()
            .map_err(|e| OcflError::RepositoryConfig(format!("Failed to build copy pool: {}", e)))?;

        Ok(Self {
            digest_pool,
            copy_pool,
        })
    }
}

/// A single file queued for ingest
#[derive(Debug, Clone)]
pub struct FileAdd {
    pub source: PathBuf,
    pub logical_path: LogicalPath,
}

/// Options controlling a batch of file adds
#[derive(Debug, Default)]
pub struct AddOptions {
    /// Move files out of the source instead of copying them
    pub move_source: bool,
    /// Permit logical paths that already exist in the pending state to be replaced
    pub overwrite: bool,
    /// Secondary algorithms to record fixity for
    pub fixity_algorithms: Vec<DigestAlgorithm>,
}

/// Enumerates the regular files beneath `source` in sorted order, mapping each to a logical
/// path. When `source` is a single file it maps to `logical_base` directly (or its file
/// name); when it is a directory, files map to `logical_base` joined with their path
/// relative the source.
pub fn enumerate_source(source: &Path, logical_base: Option<&str>) -> Result<Vec<FileAdd>> {
    if !source.exists() {
        return Err(OcflError::NotFound(format!(
            "Source path {} does not exist",
            source.to_string_lossy()
        )));
    }

    let mut adds = Vec::new();

    if source.is_file() {
        let logical = match logical_base {
            Some(base) if !base.is_empty() => base.to_string(),
            _ => source
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        };

        adds.push(FileAdd {
            source: source.to_path_buf(),
            logical_path: logical.try_into()?,
        });

        return Ok(adds);
    }

    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = pathdiff::diff_paths(entry.path(), source)
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let relative = util::backslash_to_forward(&relative).to_string();

        let logical = match logical_base {
            Some(base) if !base.is_empty() => util::join(base, &relative),
            _ => relative,
        };

        adds.push(FileAdd {
            source: entry.path().to_path_buf(),
            logical_path: logical.try_into()?,
        });
    }

    Ok(adds)
}

/// Ingests a batch of files: digests are computed on the digest pool, inventory updates are
/// applied serially in enumeration order, and the files that are new to the object are
/// transferred into the staging version directory on the copy pool.
///
/// On failure the staging directory is left as-is; the orchestrator is responsible for
/// draining it before propagating the error.
pub fn process_adds(
    pools: &WorkerPools,
    updater: &mut InventoryUpdater,
    staging_version_dir: &Path,
    adds: Vec<FileAdd>,
    options: &AddOptions,
) -> Result<()> {
    if adds.is_empty() {
        return Ok(());
    }

    let algorithm = updater.digest_algorithm();
    let content_dir = updater.content_directory().to_string();

    // Digest in parallel; results are collected in enumeration order so that inventory
    // updates are deterministic
    let digests: Vec<HexDigest> = pools.digest_pool.install(|| {
        adds.par_iter()
            .map(|add| algorithm.hash_file(&add.source))
            .collect::<Result<Vec<_>>>()
    })?;

    // The updater is not thread safe; apply updates serially
    let mut new_files = Vec::new();

    for (add, digest) in adds.into_iter().zip(digests) {
        let result = updater.add_file(digest, add.logical_path, options.overwrite)?;

        for orphan in &result.removed_staged {
            remove_staged_file(staging_version_dir, &content_dir, orphan)?;
        }

        if result.is_new {
            new_files.push((add.source, result.content_path));
        }
    }

    // Secondary fixity, computed in parallel over the new files only
    if !options.fixity_algorithms.is_empty() {
        let fixity_digests = pools.digest_pool.install(|| {
            new_files
                .par_iter()
                .map(|(source, _)| {
                    let mut writer = MultiDigestWriter::new(&options.fixity_algorithms, io::sink());
                    io::copy(&mut File::open(source)?, &mut writer)?;
                    Ok(writer.finalize_hex())
                })
                .collect::<Result<Vec<_>>>()
        })?;

        for ((_, content_path), digests) in new_files.iter().zip(fixity_digests) {
            for (fixity_algorithm, digest) in digests {
                updater.add_fixity(content_path, fixity_algorithm, digest)?;
            }
        }
    }

    // Transfer new content into staging. Order does not matter because every destination
    // path is unique within the staging directory.
    let move_source = options.move_source;
    pools.copy_pool.install(|| {
        new_files
            .par_iter()
            .try_for_each(|(source, content_path)| -> Result<()> {
                let suffix = content_path.suffix(&content_dir).ok_or_else(|| {
                    OcflError::IllegalState(format!(
                        "Content path {} is not under the content directory",
                        content_path
                    ))
                })?;

                let destination = staging_version_dir.join(&content_dir).join(suffix);

                if let Some(parent) = destination.parent() {
                    fs::create_dir_all(parent)?;
                }

                if move_source {
                    move_file(source, &destination)?;
                } else {
                    fs::copy(source, &destination)?;
                }

                Ok(())
            })
    })?;

    Ok(())
}

/// Deletes a staged content file and prunes any directories its removal emptied
pub fn remove_staged_file(
    staging_version_dir: &Path,
    content_dir: &str,
    content_path: &crate::paths::ContentPath,
) -> Result<()> {
    if let Some(suffix) = content_path.suffix(content_dir) {
        let staged = staging_version_dir.join(content_dir).join(suffix);
        info!("Deleting staged file {}", staged.to_string_lossy());
        util::remove_file_ignore_not_found(&staged)?;

        let content_root = staging_version_dir.join(content_dir);
        let mut current = staged.parent();
        while let Some(dir) = current {
            if dir == content_root || !dir.is_dir() || !util::dir_is_empty(dir)? {
                break;
            }
            fs::remove_dir(dir)?;
            current = dir.parent();
        }
    }

    Ok(())
}

/// Recursively removes whatever remains of a moved source tree
pub fn clean_source_tree(source: &Path) -> Result<()> {
    if source.is_dir() {
        for entry in WalkDir::new(source).contents_first(true) {
            let entry = entry?;
            if entry.file_type().is_dir() && util::dir_is_empty(entry.path())? {
                fs::remove_dir(entry.path())?;
            }
        }
    }

    Ok(())
}

fn move_file(source: &Path, destination: &Path) -> Result<()> {
    match fs::rename(source, destination) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Source and destination are on different volumes
            fs::copy(source, destination)?;
            fs::remove_file(source)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::{enumerate_source, process_adds, AddOptions, WorkerPools};
    use crate::digest::DigestAlgorithm;
    use crate::paths::PathConstraints;
    use crate::types::{SpecVersion, VersionInfo};
    use crate::updater::InventoryUpdater;

    fn pools() -> WorkerPools {
        WorkerPools::new(2, 2).unwrap()
    }

    fn updater() -> InventoryUpdater {
        InventoryUpdater::new_object(
            "o1",
            SpecVersion::Ocfl1_1,
            DigestAlgorithm::Sha512,
            "content",
            &VersionInfo::new(),
            PathConstraints::default(),
        )
        .unwrap()
    }

    #[test]
    fn enumerate_directory_in_sorted_order() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("sub")).unwrap();
        fs::write(temp.path().join("b.txt"), "b").unwrap();
        fs::write(temp.path().join("a.txt"), "a").unwrap();
        fs::write(temp.path().join("sub/c.txt"), "c").unwrap();

        let adds = enumerate_source(temp.path(), None).unwrap();
        let logicals: Vec<String> = adds
            .iter()
            .map(|a| a.logical_path.as_str().to_string())
            .collect();

        assert_eq!(vec!["a.txt", "b.txt", "sub/c.txt"], logicals);
    }

    #[test]
    fn enumerate_single_file_uses_logical_base() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.txt"), "a").unwrap();

        let adds = enumerate_source(&temp.path().join("a.txt"), Some("dst/renamed.txt")).unwrap();
        assert_eq!(1, adds.len());
        assert_eq!("dst/renamed.txt", adds[0].logical_path.as_str());
    }

    #[test]
    fn process_adds_copies_new_content_into_staging() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("a.txt"), "hello\n").unwrap();
        fs::write(src.join("sub/b.txt"), "world\n").unwrap();
        fs::write(src.join("sub/dup.txt"), "hello\n").unwrap();

        let staging = temp.path().join("staging");
        let mut updater = updater();

        let adds = enumerate_source(&src, None).unwrap();
        process_adds(
            &pools(),
            &mut updater,
            &staging,
            adds,
            &AddOptions::default(),
        )
        .unwrap();

        // Duplicate content is deduplicated: only two physical files are staged
        assert!(staging.join("content/a.txt").is_file());
        assert!(staging.join("content/sub/b.txt").is_file());
        assert!(!staging.join("content/sub/dup.txt").exists());

        // Source untouched
        assert!(src.join("a.txt").is_file());

        let inventory = updater.build_new_inventory().unwrap();
        assert_eq!(3, inventory.head_version().state().len());
    }

    #[test]
    fn process_adds_moves_source_when_requested() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.txt"), "hello\n").unwrap();

        let staging = temp.path().join("staging");
        let mut updater = updater();

        let adds = enumerate_source(&src, None).unwrap();
        process_adds(
            &pools(),
            &mut updater,
            &staging,
            adds,
            &AddOptions {
                move_source: true,
                ..Default::default()
            },
        )
        .unwrap();

        assert!(staging.join("content/a.txt").is_file());
        assert!(!src.join("a.txt").exists());
    }

    #[test]
    fn process_adds_records_fixity() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.txt"), "testing\n").unwrap();

        let staging = temp.path().join("staging");
        let mut updater = updater();

        let adds = enumerate_source(&src, None).unwrap();
        process_adds(
            &pools(),
            &mut updater,
            &staging,
            adds,
            &AddOptions {
                fixity_algorithms: vec![DigestAlgorithm::Md5],
                ..Default::default()
            },
        )
        .unwrap();

        let inventory = updater.build_new_inventory().unwrap();
        let fixity = inventory.fixity().unwrap();
        assert!(fixity
            .get(&DigestAlgorithm::Md5)
            .unwrap()
            .contains_digest(&"eb1a3227cdc3fedbaec2fe38bf6c044a".into()));
    }
}
