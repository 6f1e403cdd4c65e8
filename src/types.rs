use core::fmt;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Local};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::digest::{DigestAlgorithm, HexDigest};
use crate::error::{OcflError, Result};
use crate::paths::{ContentPath, LogicalPath};

static VERSION_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^v\d+$"#).unwrap());
static REVISION_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^r\d+$"#).unwrap());

/// Represents an [OCFL version number](https://ocfl.io/1.1/spec/#version-directories),
/// rendered as `v1`, `v2`, etc. Zero-padded version numbers are supported.
#[derive(Deserialize, Serialize, Debug, Copy, Clone)]
#[serde(try_from = "&str")]
#[serde(into = "String")]
pub struct VersionNum {
    number: u32,
    width: u32,
}

/// Represents a mutable HEAD revision number, rendered as `r1`, `r2`, etc.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RevisionNum {
    number: u32,
}

/// Represents either a specific version or whatever the current head version is
#[derive(Debug, Copy, Clone)]
pub enum VersionRef {
    Number(VersionNum),
    Head,
}

/// The OCFL spec versions the engine understands
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SpecVersion {
    Ocfl1_0,
    Ocfl1_1,
}

impl VersionNum {
    /// Creates a new VersionNum with no zero-padding. Panics if `number` is 0.
    pub fn new(number: u32) -> Self {
        assert!(number > 0, "version numbers must be positive");
        Self { number, width: 0 }
    }

    /// Creates a new VersionNum with the specified zero-padded width
    pub fn with_width(number: u32, width: u32) -> Self {
        Self { number, width }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    /// Returns the previous version, or an error if this is `v1`
    pub fn previous(&self) -> Result<VersionNum> {
        if self.number == 1 {
            return Err(OcflError::IllegalState(
                "Version numbers cannot be less than 1".to_string(),
            ));
        }

        Ok(Self {
            number: self.number - 1,
            width: self.width,
        })
    }

    /// Returns the next version. Zero-padded version numbers have an upper bound.
    pub fn next(&self) -> Result<VersionNum> {
        let max = match self.width {
            0 => u32::MAX,
            _ => 10u32.pow(self.width) - 1,
        };

        if self.number + 1 > max {
            return Err(OcflError::IllegalState(format!(
                "Version cannot be greater than {}",
                max
            )));
        }

        Ok(Self {
            number: self.number + 1,
            width: self.width,
        })
    }
}

impl TryFrom<&str> for VersionNum {
    type Error = OcflError;

    /// Parses strings like `v1` or `v0002` into a `VersionNum`
    fn try_from(version: &str) -> Result<Self, Self::Error> {
        if !VERSION_REGEX.is_match(version) {
            return Err(OcflError::IllegalArgument(format!(
                "Invalid version {}",
                version
            )));
        }

        match version[1..].parse::<u32>() {
            Ok(num) => {
                if num < 1 {
                    return Err(OcflError::IllegalArgument(format!(
                        "Invalid version {}",
                        version
                    )));
                }

                let width = match version.starts_with("v0") {
                    true => version.len() - 1,
                    false => 0,
                };

                Ok(Self {
                    number: num,
                    width: width as u32,
                })
            }
            Err(_) => Err(OcflError::IllegalArgument(format!(
                "Invalid version {}",
                version
            ))),
        }
    }
}

impl TryFrom<u32> for VersionNum {
    type Error = OcflError;

    fn try_from(version: u32) -> Result<Self, Self::Error> {
        if version < 1 {
            return Err(OcflError::IllegalArgument(format!(
                "Invalid version number {}",
                version
            )));
        }

        Ok(Self {
            number: version,
            width: 0,
        })
    }
}

impl FromStr for VersionNum {
    type Err = OcflError;

    /// Interprets strings formatted like `v3`, `v00009`, or `8` as version numbers
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match VersionNum::try_from(s) {
            Ok(v) => Ok(v),
            Err(_) => match u32::from_str(s) {
                Ok(parsed) => Ok(VersionNum::try_from(parsed)?),
                Err(_) => Err(OcflError::IllegalArgument(format!(
                    "Invalid version number {}",
                    s
                ))),
            },
        }
    }
}

impl Display for VersionNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "v{:0width$}", self.number, width = self.width as usize)
    }
}

impl From<VersionNum> for String {
    fn from(version_num: VersionNum) -> Self {
        format!("{}", version_num)
    }
}

impl PartialEq for VersionNum {
    fn eq(&self, other: &Self) -> bool {
        self.number == other.number
    }
}

impl Eq for VersionNum {}

impl Hash for VersionNum {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.number.hash(state)
    }
}

impl PartialOrd for VersionNum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionNum {
    fn cmp(&self, other: &Self) -> Ordering {
        self.number.cmp(&other.number)
    }
}

impl RevisionNum {
    /// Creates a new RevisionNum. Panics if `number` is 0.
    pub fn new(number: u32) -> Self {
        assert!(number > 0, "revision numbers must be positive");
        Self { number }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    /// Returns the next revision
    pub fn next(&self) -> RevisionNum {
        Self {
            number: self.number + 1,
        }
    }

    /// Returns the previous revision, or None if this is `r1`
    pub fn previous(&self) -> Option<RevisionNum> {
        if self.number == 1 {
            None
        } else {
            Some(Self {
                number: self.number - 1,
            })
        }
    }
}

impl TryFrom<&str> for RevisionNum {
    type Error = OcflError;

    /// Parses strings like `r1` into a `RevisionNum`
    fn try_from(revision: &str) -> Result<Self, Self::Error> {
        if !REVISION_REGEX.is_match(revision) {
            return Err(OcflError::IllegalArgument(format!(
                "Invalid revision {}",
                revision
            )));
        }

        match revision[1..].parse::<u32>() {
            Ok(num) if num > 0 => Ok(Self { number: num }),
            _ => Err(OcflError::IllegalArgument(format!(
                "Invalid revision {}",
                revision
            ))),
        }
    }
}

impl Display for RevisionNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.number)
    }
}

impl From<RevisionNum> for String {
    fn from(revision_num: RevisionNum) -> Self {
        format!("{}", revision_num)
    }
}

impl VersionRef {
    pub fn resolve(&self, head_num: VersionNum) -> VersionNum {
        match self {
            VersionRef::Number(num) => *num,
            VersionRef::Head => head_num,
        }
    }
}

impl From<VersionNum> for VersionRef {
    fn from(num: VersionNum) -> Self {
        Self::Number(num)
    }
}

impl From<Option<VersionNum>> for VersionRef {
    fn from(num: Option<VersionNum>) -> Self {
        num.map_or(VersionRef::Head, VersionRef::Number)
    }
}

impl SpecVersion {
    /// The version string, eg `1.0`
    pub fn version(&self) -> &'static str {
        match self {
            SpecVersion::Ocfl1_0 => "1.0",
            SpecVersion::Ocfl1_1 => "1.1",
        }
    }

    /// The inventory `type` value for this spec version
    pub fn inventory_type(&self) -> &'static str {
        match self {
            SpecVersion::Ocfl1_0 => "https://ocfl.io/1.0/spec/#inventory",
            SpecVersion::Ocfl1_1 => "https://ocfl.io/1.1/spec/#inventory",
        }
    }

    /// The name of the storage root namaste file
    pub fn root_namaste_file(&self) -> String {
        format!("0=ocfl_{}", self.version())
    }

    /// The name of the object root namaste file
    pub fn object_namaste_file(&self) -> String {
        format!("0=ocfl_object_{}", self.version())
    }

    /// The content written into a namaste file with the specified name
    pub fn namaste_content(namaste_file: &str) -> String {
        format!("{}\n", &namaste_file[2..])
    }

    /// Maps an inventory `type` value to a spec version
    pub fn try_from_inventory_type(value: &str) -> Result<SpecVersion> {
        for version in [SpecVersion::Ocfl1_0, SpecVersion::Ocfl1_1] {
            if version.inventory_type() == value {
                return Ok(version);
            }
        }
        Err(OcflError::InvalidInventory(format!(
            "Unknown inventory type: {}",
            value
        )))
    }

    /// Maps a storage root namaste file name to a spec version
    pub fn try_from_root_namaste(name: &str) -> Result<SpecVersion> {
        for version in [SpecVersion::Ocfl1_0, SpecVersion::Ocfl1_1] {
            if version.root_namaste_file() == name {
                return Ok(version);
            }
        }
        Err(OcflError::RepositoryConfig(format!(
            "Unsupported OCFL spec version declared by {}",
            name
        )))
    }
}

/// Optional metadata describing a version, supplied when committing
#[derive(Debug, Eq, PartialEq, Clone, Default)]
pub struct VersionInfo {
    pub(crate) user_name: Option<String>,
    pub(crate) user_address: Option<String>,
    pub(crate) message: Option<String>,
    pub(crate) created: Option<DateTime<Local>>,
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the user. `name` must be provided if `address` is provided.
    pub fn with_user(mut self, name: Option<String>, address: Option<String>) -> Result<Self> {
        if address.is_some() && name.is_none() {
            return Err(OcflError::IllegalArgument(
                "User name must be set when user address is set.".to_string(),
            ));
        }
        self.user_name = name;
        self.user_address = address;
        Ok(self)
    }

    pub fn with_message(mut self, message: Option<String>) -> Self {
        self.message = message;
        self
    }

    pub fn with_created(mut self, created: Option<DateTime<Local>>) -> Self {
        self.created = created;
        self
    }
}

/// Metadata about a single version of an object
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct VersionDetails {
    pub version_num: VersionNum,
    pub created: DateTime<Local>,
    pub user_name: Option<String>,
    pub user_address: Option<String>,
    pub message: Option<String>,
}

/// Metadata about an object, not including any version state
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct ObjectDetails {
    /// The object's ID
    pub id: String,
    /// The path from the storage root to the object root
    pub object_root: String,
    /// The algorithm used to compute content digests
    pub digest_algorithm: DigestAlgorithm,
    /// True if the object has an active mutable HEAD
    pub has_staged_changes: bool,
    /// Metadata of the head version
    pub version_details: VersionDetails,
}

/// A complete view of a version of an object, mapping every logical path to details about
/// the file it references
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct ObjectVersion {
    /// The object's ID
    pub id: String,
    /// The path from the storage root to the object root
    pub object_root: String,
    /// The algorithm used to compute content digests
    pub digest_algorithm: DigestAlgorithm,
    /// Metadata about the version
    pub version_details: VersionDetails,
    /// Map of logical paths to file details
    pub state: HashMap<Arc<LogicalPath>, FileDetails>,
}

/// Details about a file within an object version
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct FileDetails {
    /// The file's digest
    pub digest: Arc<HexDigest>,
    /// The digest algorithm
    pub digest_algorithm: DigestAlgorithm,
    /// The path to the file relative the object root
    pub content_path: Arc<ContentPath>,
    /// The path to the file relative the storage root
    pub storage_path: String,
    /// The version metadata for when the file was last updated
    pub last_update: Arc<VersionDetails>,
}

/// The kind of change a version applied to a logical path
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum FileChangeType {
    Added,
    Modified,
    Removed,
}

/// A single entry in a file's change history
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct FileChange {
    pub change_type: FileChangeType,
    /// The logical path the change applies to
    pub path: Arc<LogicalPath>,
    /// The version the change was made in
    pub version_details: VersionDetails,
    /// The file's digest after the change; None for removals
    pub digest: Option<Arc<HexDigest>>,
}

impl Display for FileChangeType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FileChangeType::Added => write!(f, "added"),
            FileChangeType::Modified => write!(f, "modified"),
            FileChangeType::Removed => write!(f, "removed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::convert::TryFrom;

    use super::{RevisionNum, SpecVersion, VersionNum};

    #[test]
    fn parse_version_numbers() {
        let version = VersionNum::try_from("v3").unwrap();
        assert_eq!(3, version.number());
        assert_eq!(0, version.width());
        assert_eq!("v3", version.to_string());

        let padded = VersionNum::try_from("v0042").unwrap();
        assert_eq!(42, padded.number());
        assert_eq!(4, padded.width());
        assert_eq!("v0042", padded.to_string());
    }

    #[test]
    fn reject_invalid_version_numbers() {
        assert!(VersionNum::try_from("v0").is_err());
        assert!(VersionNum::try_from("3").is_err());
        assert!(VersionNum::try_from("vv3").is_err());
        assert!(VersionNum::try_from("v-1").is_err());
    }

    #[test]
    fn version_next_previous() {
        let version = VersionNum::try_from("v2").unwrap();
        assert_eq!("v3", version.next().unwrap().to_string());
        assert_eq!("v1", version.previous().unwrap().to_string());
        assert!(version.previous().unwrap().previous().is_err());
    }

    #[test]
    fn padded_versions_have_an_upper_bound() {
        let version = VersionNum::with_width(98, 2);
        assert_eq!("v99", version.next().unwrap().to_string());
        assert!(version.next().unwrap().next().is_err());
    }

    #[test]
    fn versions_compare_by_number_only() {
        assert_eq!(
            VersionNum::try_from("v002").unwrap(),
            VersionNum::try_from("v2").unwrap()
        );
        assert!(VersionNum::try_from("v1").unwrap() < VersionNum::try_from("v0002").unwrap());
    }

    #[test]
    fn parse_revision_numbers() {
        let revision = RevisionNum::try_from("r7").unwrap();
        assert_eq!(7, revision.number());
        assert_eq!("r8", revision.next().to_string());
        assert_eq!("r6", revision.previous().unwrap().to_string());
        assert_eq!(None, RevisionNum::new(1).previous());
    }

    #[test]
    fn reject_invalid_revision_numbers() {
        assert!(RevisionNum::try_from("r0").is_err());
        assert!(RevisionNum::try_from("1").is_err());
        assert!(RevisionNum::try_from("v1").is_err());
    }

    #[test]
    fn namaste_values() {
        assert_eq!("0=ocfl_1.0", SpecVersion::Ocfl1_0.root_namaste_file());
        assert_eq!(
            "0=ocfl_object_1.1",
            SpecVersion::Ocfl1_1.object_namaste_file()
        );
        assert_eq!(
            "ocfl_object_1.0\n",
            SpecVersion::namaste_content("0=ocfl_object_1.0")
        );
    }

    #[test]
    fn spec_version_from_inventory_type() {
        assert_eq!(
            SpecVersion::Ocfl1_1,
            SpecVersion::try_from_inventory_type("https://ocfl.io/1.1/spec/#inventory").unwrap()
        );
        assert!(SpecVersion::try_from_inventory_type("https://ocfl.io/2.0/spec/#inventory").is_err());
    }
}
