//! Repository construction options.

use std::time::Duration;

use crate::consts::DEFAULT_CONTENT_DIR;
use crate::digest::DigestAlgorithm;
use crate::error::{OcflError, Result};
use crate::layout::{LayoutExtensionName, StorageLayout};
use crate::paths::PathConstraints;
use crate::types::SpecVersion;

/// Options controlling how a repository behaves. The defaults match the reference
/// implementation: sha512 digests, `content` content directories, digest workers sized to
/// the logical CPU count, and twice as many copy workers.
#[derive(Debug, Clone)]
pub struct RepoConfig {
    /// OCFL spec version written by new objects
    pub spec_version: SpecVersion,
    /// Digest algorithm used by new objects; must be sha256 or sha512
    pub digest_algorithm: DigestAlgorithm,
    /// Content directory name used by new objects; must not contain `/` or `\`
    pub content_directory: String,
    /// Secondary algorithms to record in the fixity block for new content
    pub fixity_algorithms: Vec<DigestAlgorithm>,
    /// Number of worker threads used to compute digests
    pub digest_pool_size: usize,
    /// Number of worker threads used to copy or move content files
    pub copy_pool_size: usize,
    /// Verify the digest of inventories against their sidecars when loading
    pub verify_inventory_digest: bool,
    /// Recompute content digests after moving a new version into the object root
    pub check_new_version_fixity: bool,
    /// How long to wait for an object lock before failing
    pub lock_timeout: Duration,
    /// Maximum number of inventories to cache
    pub inventory_cache_size: usize,
    /// How long cached inventories remain valid
    pub inventory_cache_ttl: Duration,
    /// Constraints applied to content paths
    pub path_constraints: PathConstraints,
    /// Storage layout used when initializing a new repository
    pub layout: StorageLayout,
}

impl Default for RepoConfig {
    fn default() -> Self {
        let digest_pool_size = num_cpus::get().max(1);

        Self {
            spec_version: SpecVersion::Ocfl1_1,
            digest_algorithm: DigestAlgorithm::Sha512,
            content_directory: DEFAULT_CONTENT_DIR.to_string(),
            fixity_algorithms: Vec::new(),
            digest_pool_size,
            copy_pool_size: 2 * digest_pool_size,
            verify_inventory_digest: false,
            check_new_version_fixity: false,
            lock_timeout: Duration::from_secs(10),
            inventory_cache_size: 512,
            inventory_cache_ttl: Duration::from_secs(60),
            path_constraints: PathConstraints::default(),
            layout: StorageLayout::new(LayoutExtensionName::HashedNTupleLayout, None)
                .expect("default layout config must be valid"),
        }
    }
}

impl RepoConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_spec_version(mut self, spec_version: SpecVersion) -> Self {
        self.spec_version = spec_version;
        self
    }

    pub fn with_digest_algorithm(mut self, algorithm: DigestAlgorithm) -> Self {
        self.digest_algorithm = algorithm;
        self
    }

    pub fn with_content_directory(mut self, content_directory: impl Into<String>) -> Self {
        self.content_directory = content_directory.into();
        self
    }

    pub fn with_fixity_algorithms(mut self, algorithms: Vec<DigestAlgorithm>) -> Self {
        self.fixity_algorithms = algorithms;
        self
    }

    pub fn with_digest_pool_size(mut self, size: usize) -> Self {
        self.digest_pool_size = size;
        self
    }

    pub fn with_copy_pool_size(mut self, size: usize) -> Self {
        self.copy_pool_size = size;
        self
    }

    pub fn with_verify_inventory_digest(mut self, verify: bool) -> Self {
        self.verify_inventory_digest = verify;
        self
    }

    pub fn with_check_new_version_fixity(mut self, check: bool) -> Self {
        self.check_new_version_fixity = check;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_layout(mut self, layout: StorageLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Validates that the options are internally consistent
    pub fn validate(&self) -> Result<()> {
        if !self.digest_algorithm.is_inventory_algorithm() {
            return Err(OcflError::RepositoryConfig(format!(
                "The default digest algorithm must be sha512 or sha256. Found: {}",
                self.digest_algorithm
            )));
        }

        if self.content_directory.is_empty()
            || self.content_directory == "."
            || self.content_directory == ".."
            || self.content_directory.contains('/')
            || self.content_directory.contains('\\')
        {
            return Err(OcflError::RepositoryConfig(format!(
                "The content directory may not be empty, '.', or '..', and may not contain \
                 slashes. Found: {}",
                self.content_directory
            )));
        }

        if self.digest_pool_size == 0 || self.copy_pool_size == 0 {
            return Err(OcflError::RepositoryConfig(
                "Worker pool sizes must be greater than 0".to_string(),
            ));
        }

        if self
            .fixity_algorithms
            .iter()
            .any(|a| *a == self.digest_algorithm)
        {
            return Err(OcflError::RepositoryConfig(
                "Fixity algorithms must differ from the inventory digest algorithm".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::RepoConfig;
    use crate::digest::DigestAlgorithm;

    #[test]
    fn default_config_is_valid() {
        assert!(RepoConfig::default().validate().is_ok());
    }

    #[test]
    fn reject_bad_content_directory() {
        assert!(RepoConfig::default()
            .with_content_directory("a/b")
            .validate()
            .is_err());
        assert!(RepoConfig::default()
            .with_content_directory("..")
            .validate()
            .is_err());
    }

    #[test]
    fn reject_md5_as_inventory_algorithm() {
        assert!(RepoConfig::default()
            .with_digest_algorithm(DigestAlgorithm::Md5)
            .validate()
            .is_err());
    }

    #[test]
    fn reject_zero_sized_pools() {
        assert!(RepoConfig::default()
            .with_digest_pool_size(0)
            .validate()
            .is_err());
    }

    #[test]
    fn reject_fixity_algorithm_equal_to_primary() {
        assert!(RepoConfig::default()
            .with_fixity_algorithms(vec![DigestAlgorithm::Sha512])
            .validate()
            .is_err());
    }
}
