use core::fmt;
use std::fmt::{Debug, Display, Formatter};
use std::{error, io};

use thiserror::Error;

use crate::VersionNum;

pub type Result<T, E = OcflError> = core::result::Result<T, E>;

/// Application errors
#[derive(Error)]
pub enum OcflError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Object {object_id} is out of sync: {message}")]
    ObjectOutOfSync { object_id: String, message: String },

    #[error("Path {0} already exists. Enable overwrite to replace it.")]
    Overwrite(String),

    #[error("Fixity check of {path} failed: expected {expected}; found {actual}")]
    Fixity {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Object {object_id} is corrupt: {message}")]
    CorruptObject { object_id: String, message: String },

    #[error("Invalid inventory: {0}")]
    InvalidInventory(String),

    #[error("Object {0} failed validation")]
    Validation(String),

    #[error("Path {path} violates path constraints: {message}")]
    PathConstraint { path: String, message: String },

    #[error("Invalid repository configuration: {0}")]
    RepositoryConfig(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Failed to acquire a lock on object {0} within the configured timeout")]
    LockAcquisition(String),

    #[error("The repository is closed")]
    Closed,

    #[error("{0}")]
    Multiple(MultiError),

    #[error("{0}")]
    Io(io::Error),

    #[error("{0}")]
    Wrapped(Box<dyn error::Error + Send + Sync>),
}

#[derive(Debug)]
pub struct MultiError(pub Vec<String>);

/// Constructs an `OcflError::NotFound` error for an object or object version
pub fn not_found(object_id: &str, version_num: Option<VersionNum>) -> OcflError {
    match version_num {
        Some(version) => OcflError::NotFound(format!("Object {} version {}", object_id, version)),
        None => OcflError::NotFound(format!("Object {}", object_id)),
    }
}

impl Debug for OcflError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl Display for MultiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", error)?;
        }
        Ok(())
    }
}

impl From<io::Error> for OcflError {
    fn from(e: io::Error) -> Self {
        OcflError::Io(e)
    }
}

impl From<serde_json::Error> for OcflError {
    fn from(e: serde_json::Error) -> Self {
        OcflError::Wrapped(Box::new(e))
    }
}

impl From<walkdir::Error> for OcflError {
    fn from(e: walkdir::Error) -> Self {
        OcflError::Wrapped(Box::new(e))
    }
}
