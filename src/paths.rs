//! Logical and content path types, sanitization, and path constraints.

use core::fmt;
use std::convert::TryFrom;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::str::Split;

use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{OcflError, Result};
use crate::types::{RevisionNum, VersionNum};

/// The logical path of a file within an object version. Logical paths are relative the object
/// root, use `/` as their separator, and may not contain `.`, `..`, or empty segments.
#[derive(Deserialize, Serialize, Debug, Eq, Ord, PartialOrd, PartialEq, Hash, Clone)]
#[serde(try_from = "String")]
#[serde(into = "String")]
pub struct LogicalPath(String);

/// A path to a content file, relative the object root. Content paths always begin with a
/// version directory, eg `v2/content/foo/bar.txt`. While a mutable HEAD is active, its
/// content paths additionally contain a revision directory, eg `v2/content/r1/foo/bar.txt`.
#[derive(Debug, Eq, Ord, PartialOrd, PartialEq, Hash, Clone)]
pub struct ContentPath {
    inner: String,
    /// The version the content path belongs to
    pub version: VersionNum,
}

impl LogicalPath {
    /// Returns an iterator over the `/` separated segments of the path
    pub fn parts(&self) -> Split<char> {
        self.0.split('/')
    }

    /// Returns the parent path, or an empty string if the path has no parent
    pub fn parent(&self) -> &str {
        match self.0.rfind('/') {
            Some(last_slash) => &self.0[..last_slash],
            None => "",
        }
    }

    /// Returns the part of the path after the final `/`, or the entire path if there is no `/`
    pub fn filename(&self) -> &str {
        match self.0.rfind('/') {
            Some(last_slash) => &self.0[last_slash + 1..],
            None => self.0.as_str(),
        }
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ContentPath {
    /// Builds the content path for a file stored within the specified version, and, when a
    /// mutable HEAD is active, revision.
    pub fn build(
        version: VersionNum,
        content_dir: &str,
        revision: Option<RevisionNum>,
        suffix: &str,
    ) -> Self {
        let inner = match revision {
            Some(revision) => format!("{}/{}/{}/{}", version, content_dir, revision, suffix),
            None => format!("{}/{}/{}", version, content_dir, suffix),
        };

        Self { inner, version }
    }

    /// Returns an iterator over the `/` separated segments of the path
    pub fn parts(&self) -> Split<char> {
        self.inner.split('/')
    }

    /// Returns the part of the path after the final `/`
    pub fn filename(&self) -> &str {
        match self.inner.rfind('/') {
            Some(last_slash) => &self.inner[last_slash + 1..],
            None => self.inner.as_str(),
        }
    }

    /// Returns the revision directory the path passes through, if the path is a mutable HEAD
    /// content path of the form `vN/<content_dir>/rK/...`.
    pub fn revision(&self, content_dir: &str) -> Option<RevisionNum> {
        let mut parts = self.parts();
        parts.next()?;

        if parts.next()? != content_dir {
            return None;
        }

        let candidate = parts.next()?;
        // Must not be the final segment: `vN/content/r1` names a file called r1
        parts.next()?;

        RevisionNum::try_from(candidate).ok()
    }

    /// Returns the portion of the path after the content directory (and revision directory,
    /// when one is present). This is the path's location within the version's logical layout.
    pub fn suffix(&self, content_dir: &str) -> Option<&str> {
        let prefix = format!("{}/{}/", self.version, content_dir);
        let rest = self.inner.strip_prefix(&prefix)?;

        if rest.is_empty() {
            return None;
        }

        match self.revision(content_dir) {
            Some(revision) => rest
                .strip_prefix(&revision.to_string())
                .and_then(|r| r.strip_prefix('/')),
            None => Some(rest),
        }
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.inner.starts_with(prefix)
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    pub fn as_path(&self) -> &Path {
        self.inner.as_ref()
    }
}

fn validate_segments(value: &str) -> Result<()> {
    let has_illegal_part = value
        .split('/')
        .any(|part| part == "." || part == ".." || part.is_empty());

    if has_illegal_part {
        return Err(OcflError::IllegalArgument(format!(
            "Paths may not contain '.', '..', or '' segments. Found: {}",
            value
        )));
    }

    Ok(())
}

impl TryFrom<&str> for LogicalPath {
    type Error = OcflError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let trimmed = value.trim_start_matches('/').trim_end_matches('/');

        if trimmed.is_empty() {
            return Err(OcflError::IllegalArgument(
                "Logical paths may not be empty".to_string(),
            ));
        }

        validate_segments(trimmed)?;

        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for LogicalPath {
    type Error = OcflError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.as_str().try_into()
    }
}

impl TryFrom<&String> for LogicalPath {
    type Error = OcflError;

    fn try_from(value: &String) -> Result<Self, Self::Error> {
        value.as_str().try_into()
    }
}

impl TryFrom<&str> for ContentPath {
    type Error = OcflError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let trimmed = value.trim_start_matches('/').trim_end_matches('/');

        validate_segments(trimmed)?;

        let version = match trimmed.find('/') {
            Some(index) => VersionNum::try_from(&trimmed[0..index])?,
            None => {
                return Err(OcflError::IllegalArgument(format!(
                    "Content paths must begin with a version directory. Found: {}",
                    value
                )));
            }
        };

        Ok(Self {
            inner: trimmed.to_string(),
            version,
        })
    }
}

impl TryFrom<String> for ContentPath {
    type Error = OcflError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<LogicalPath> for String {
    fn from(path: LogicalPath) -> Self {
        path.0
    }
}

impl From<ContentPath> for String {
    fn from(path: ContentPath) -> Self {
        path.inner
    }
}

impl AsRef<str> for LogicalPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ContentPath {
    fn as_ref(&self) -> &str {
        &self.inner
    }
}

impl AsRef<Path> for LogicalPath {
    fn as_ref(&self) -> &Path {
        self.0.as_ref()
    }
}

impl AsRef<Path> for ContentPath {
    fn as_ref(&self) -> &Path {
        self.inner.as_ref()
    }
}

impl Display for LogicalPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for ContentPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl Serialize for ContentPath {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ContentPath {
    fn deserialize<D>(deserializer: D) -> Result<ContentPath, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(ContentPathVisitor)
    }
}

struct ContentPathVisitor;

impl<'de> Visitor<'de> for ContentPathVisitor {
    type Value = ContentPath;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a valid OCFL content path")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        ContentPath::try_from(v).map_err(|e| E::custom(e.to_string()))
    }
}

/// Constraints applied to content paths before they are written to storage
#[derive(Debug, Clone)]
pub struct PathConstraints {
    /// Maximum number of bytes permitted in a single path segment
    pub max_segment_bytes: usize,
    /// Reject paths containing backslashes
    pub forbid_backslash: bool,
    /// Reject paths containing ASCII control characters
    pub forbid_control_chars: bool,
}

impl Default for PathConstraints {
    fn default() -> Self {
        Self {
            max_segment_bytes: 255,
            forbid_backslash: true,
            forbid_control_chars: true,
        }
    }
}

impl PathConstraints {
    /// Applies the constraints to the path, returning a `PathConstraint` error on the
    /// first violation.
    pub fn apply(&self, path: &str) -> Result<()> {
        for segment in path.split('/') {
            if segment.len() > self.max_segment_bytes {
                return Err(OcflError::PathConstraint {
                    path: path.to_string(),
                    message: format!(
                        "segment '{}' is longer than {} bytes",
                        segment, self.max_segment_bytes
                    ),
                });
            }
        }

        if self.forbid_backslash && path.contains('\\') {
            return Err(OcflError::PathConstraint {
                path: path.to_string(),
                message: "path contains a backslash".to_string(),
            });
        }

        if self.forbid_control_chars && path.chars().any(|c| c.is_ascii_control()) {
            return Err(OcflError::PathConstraint {
                path: path.to_string(),
                message: "path contains control characters".to_string(),
            });
        }

        Ok(())
    }
}

/// Maps a logical path to the suffix of a content path. Backslashes are converted to forward
/// slashes, control characters are replaced, and any segment that sanitization reduced to
/// `.`, `..`, or an empty string is replaced with `_`.
pub fn sanitize_content_suffix(logical_path: &LogicalPath) -> String {
    let converted = logical_path.as_str().replace('\\', "/");

    let mut segments = Vec::new();

    for segment in converted.split('/') {
        let cleaned: String = segment
            .chars()
            .map(|c| if c.is_ascii_control() { '_' } else { c })
            .collect();

        match cleaned.as_str() {
            "" | "." | ".." => segments.push("_".to_string()),
            _ => segments.push(cleaned),
        }
    }

    segments.join("/")
}

#[cfg(test)]
mod tests {
    use std::convert::TryFrom;

    use super::{sanitize_content_suffix, ContentPath, LogicalPath, PathConstraints};
    use crate::types::VersionNum;

    #[test]
    fn create_logical_path_when_valid() {
        let value = "foo/.bar/baz.txt";
        let path = LogicalPath::try_from(value).unwrap();
        assert_eq!(value, path.as_str());
    }

    #[test]
    fn remove_leading_and_trailing_slashes_from_logical_paths() {
        let path = LogicalPath::try_from("/foo/bar/baz/").unwrap();
        assert_eq!("foo/bar/baz", path.as_str());
    }

    #[test]
    #[should_panic(expected = "may not be empty")]
    fn reject_empty_logical_paths() {
        LogicalPath::try_from("/").unwrap();
    }

    #[test]
    #[should_panic(expected = "Paths may not contain")]
    fn reject_logical_paths_with_empty_parts() {
        LogicalPath::try_from("foo//bar/baz").unwrap();
    }

    #[test]
    #[should_panic(expected = "Paths may not contain")]
    fn reject_logical_paths_with_dot_parts() {
        LogicalPath::try_from("foo/bar/./baz").unwrap();
    }

    #[test]
    #[should_panic(expected = "Paths may not contain")]
    fn reject_logical_paths_with_double_dot_parts() {
        LogicalPath::try_from("../foo/bar/baz").unwrap();
    }

    #[test]
    fn parse_content_path_version() {
        let path = ContentPath::try_from("v3/content/dir/file.txt").unwrap();
        assert_eq!(VersionNum::new(3), path.version);
        assert_eq!("file.txt", path.filename());
        assert_eq!(None, path.revision("content"));
        assert_eq!(Some("dir/file.txt"), path.suffix("content"));
    }

    #[test]
    fn parse_mutable_head_content_path() {
        let path = ContentPath::try_from("v2/content/r4/file.txt").unwrap();
        assert_eq!(VersionNum::new(2), path.version);
        assert_eq!(Some(4), path.revision("content").map(|r| r.number()));
        assert_eq!(Some("file.txt"), path.suffix("content"));
    }

    #[test]
    fn file_named_like_revision_dir_is_not_a_revision() {
        let path = ContentPath::try_from("v2/content/r4").unwrap();
        assert_eq!(None, path.revision("content"));
        assert_eq!(Some("r4"), path.suffix("content"));
    }

    #[test]
    #[should_panic(expected = "must begin with a version directory")]
    fn reject_content_path_without_version() {
        ContentPath::try_from("file.txt").unwrap();
    }

    #[test]
    fn build_content_paths() {
        let plain = ContentPath::build(VersionNum::new(2), "content", None, "a/b.txt");
        assert_eq!("v2/content/a/b.txt", plain.as_str());

        let rev = ContentPath::build(
            VersionNum::new(2),
            "content",
            Some(crate::types::RevisionNum::new(3)),
            "a/b.txt",
        );
        assert_eq!("v2/content/r3/a/b.txt", rev.as_str());
    }

    #[test]
    fn sanitize_backslashes_and_controls() {
        let logical = LogicalPath::try_from("dir\\sub/fi\u{7}le.txt").unwrap();
        assert_eq!("dir/sub/fi_le.txt", sanitize_content_suffix(&logical));
    }

    #[test]
    fn constraints_reject_long_segments() {
        let constraints = PathConstraints {
            max_segment_bytes: 4,
            ..Default::default()
        };

        assert!(constraints.apply("ab/cd").is_ok());
        assert!(constraints.apply("ab/cdefg").is_err());
    }

    #[test]
    fn constraints_reject_control_chars() {
        let constraints = PathConstraints::default();
        assert!(constraints.apply("foo/ba\u{1}r").is_err());
        assert!(constraints.apply("foo/bar").is_ok());
    }
}
