//! Storage layout extension implementations. A layout is a pure function mapping an object
//! ID to the object's root directory relative the storage root.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use strum_macros::{Display as EnumDisplay, EnumString};

use crate::digest::DigestAlgorithm;
use crate::error::{OcflError, Result};

const MAX_ENCAPSULATION_LENGTH: usize = 100;

static NON_ALPHA_PLUS: Lazy<AsciiSet> = Lazy::new(|| NON_ALPHANUMERIC.remove(b'-').remove(b'_'));

/// Enum of supported storage layout extensions
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, EnumString, EnumDisplay)]
pub enum LayoutExtensionName {
    #[strum(serialize = "0002-flat-direct-storage-layout")]
    #[serde(rename = "0002-flat-direct-storage-layout")]
    FlatDirectLayout,
    #[strum(serialize = "0003-hash-and-id-n-tuple-storage-layout")]
    #[serde(rename = "0003-hash-and-id-n-tuple-storage-layout")]
    HashedNTupleObjectIdLayout,
    #[strum(serialize = "0004-hashed-n-tuple-storage-layout")]
    #[serde(rename = "0004-hashed-n-tuple-storage-layout")]
    HashedNTupleLayout,
}

/// The storage layout maps object IDs to object root directories within the storage root
#[derive(Debug, Clone)]
pub enum StorageLayout {
    /// [0002-flat-direct-storage-layout](https://ocfl.github.io/extensions/0002-flat-direct-storage-layout.html)
    FlatDirect(FlatDirectLayoutConfig),
    /// [0003-hash-and-id-n-tuple-storage-layout](https://ocfl.github.io/extensions/0003-hash-and-id-n-tuple-storage-layout.html)
    HashedNTupleObjectId(HashedNTupleObjectIdLayoutConfig),
    /// [0004-hashed-n-tuple-storage-layout](https://ocfl.github.io/extensions/0004-hashed-n-tuple-storage-layout.html)
    HashedNTuple(HashedNTupleLayoutConfig),
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct FlatDirectLayoutConfig {
    extension_name: LayoutExtensionName,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct HashedNTupleObjectIdLayoutConfig {
    extension_name: LayoutExtensionName,
    digest_algorithm: DigestAlgorithm,
    tuple_size: usize,
    number_of_tuples: usize,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct HashedNTupleLayoutConfig {
    extension_name: LayoutExtensionName,
    digest_algorithm: DigestAlgorithm,
    tuple_size: usize,
    number_of_tuples: usize,
    short_object_root: bool,
}

impl Default for FlatDirectLayoutConfig {
    fn default() -> Self {
        Self {
            extension_name: LayoutExtensionName::FlatDirectLayout,
        }
    }
}

impl Default for HashedNTupleObjectIdLayoutConfig {
    fn default() -> Self {
        Self {
            extension_name: LayoutExtensionName::HashedNTupleObjectIdLayout,
            digest_algorithm: DigestAlgorithm::Sha256,
            tuple_size: 3,
            number_of_tuples: 3,
        }
    }
}

impl Default for HashedNTupleLayoutConfig {
    fn default() -> Self {
        Self {
            extension_name: LayoutExtensionName::HashedNTupleLayout,
            digest_algorithm: DigestAlgorithm::Sha256,
            tuple_size: 3,
            number_of_tuples: 3,
            short_object_root: false,
        }
    }
}

impl StorageLayout {
    /// Constructs a layout from its extension name and optional serialized config. When no
    /// config is supplied the extension's defaults are used.
    pub fn new(name: LayoutExtensionName, config_bytes: Option<&[u8]>) -> Result<Self> {
        let attempt = || -> Result<StorageLayout> {
            let layout = match name {
                LayoutExtensionName::FlatDirectLayout => {
                    let config: FlatDirectLayoutConfig = parse_config(config_bytes)?;
                    validate_extension_name(name, config.extension_name)?;
                    StorageLayout::FlatDirect(config)
                }
                LayoutExtensionName::HashedNTupleObjectIdLayout => {
                    let config: HashedNTupleObjectIdLayoutConfig = parse_config(config_bytes)?;
                    validate_extension_name(name, config.extension_name)?;
                    validate_tuple_config(
                        config.digest_algorithm,
                        config.tuple_size,
                        config.number_of_tuples,
                    )?;
                    StorageLayout::HashedNTupleObjectId(config)
                }
                LayoutExtensionName::HashedNTupleLayout => {
                    let config: HashedNTupleLayoutConfig = parse_config(config_bytes)?;
                    validate_extension_name(name, config.extension_name)?;
                    validate_tuple_config(
                        config.digest_algorithm,
                        config.tuple_size,
                        config.number_of_tuples,
                    )?;
                    StorageLayout::HashedNTuple(config)
                }
            };
            Ok(layout)
        };

        attempt().map_err(|e| {
            OcflError::RepositoryConfig(format!("Failed to load layout extension {}: {}", name, e))
        })
    }

    /// Maps an object ID to its object root directory
    pub fn map_object_id(&self, object_id: &str) -> String {
        match self {
            StorageLayout::FlatDirect(_) => object_id.to_string(),
            StorageLayout::HashedNTupleObjectId(config) => config.map_object_id(object_id),
            StorageLayout::HashedNTuple(config) => config.map_object_id(object_id),
        }
    }

    /// Returns the name of the extension in use
    pub fn extension_name(&self) -> LayoutExtensionName {
        match self {
            StorageLayout::FlatDirect(config) => config.extension_name,
            StorageLayout::HashedNTupleObjectId(config) => config.extension_name,
            StorageLayout::HashedNTuple(config) => config.extension_name,
        }
    }

    /// Serializes the layout's config for persistence at `extensions/<name>/config.json`
    pub fn serialize_config(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            StorageLayout::FlatDirect(config) => serde_json::to_vec_pretty(config)?,
            StorageLayout::HashedNTupleObjectId(config) => serde_json::to_vec_pretty(config)?,
            StorageLayout::HashedNTuple(config) => serde_json::to_vec_pretty(config)?,
        };
        Ok(bytes)
    }
}

impl HashedNTupleObjectIdLayoutConfig {
    /// Object IDs are hashed and divided into tuples, and the encapsulation directory is the
    /// percent-encoded object ID, truncated when overly long
    fn map_object_id(&self, object_id: &str) -> String {
        let digest: String = self
            .digest_algorithm
            .hash_hex(&mut object_id.as_bytes())
            .unwrap()
            .into();

        if self.tuple_size == 0 {
            return digest;
        }

        let mut path = to_tuples(&digest, self.tuple_size, self.number_of_tuples);

        let encoded = utf8_percent_encode(object_id, &NON_ALPHA_PLUS).to_string();
        let lower = lower_percent_escape(&encoded);

        if lower.len() <= MAX_ENCAPSULATION_LENGTH {
            path.push_str(&lower);
        } else {
            path.push_str(&lower[..MAX_ENCAPSULATION_LENGTH]);
            path.push('-');
            path.push_str(&digest);
        }

        path
    }
}

impl HashedNTupleLayoutConfig {
    /// Object IDs are hashed and divided into tuples to create a pair-tree like layout
    fn map_object_id(&self, object_id: &str) -> String {
        let digest: String = self
            .digest_algorithm
            .hash_hex(&mut object_id.as_bytes())
            .unwrap()
            .into();

        if self.tuple_size == 0 {
            return digest;
        }

        let mut path = to_tuples(&digest, self.tuple_size, self.number_of_tuples);

        if self.short_object_root {
            let start = self.tuple_size * self.number_of_tuples;
            path.push_str(&digest[start..]);
        } else {
            path.push_str(&digest);
        }

        path
    }
}

/// Splits the value into N tuples of M size, joined with a `/`, ending with a trailing `/`
fn to_tuples(value: &str, tuple_size: usize, number_of_tuples: usize) -> String {
    let mut path = String::new();

    for i in 0..number_of_tuples {
        let start = i * tuple_size;
        let end = start + tuple_size;
        path.push_str(&value[start..end]);
        path.push('/');
    }

    path
}

/// Transforms an uppercase percent encoded string to lower case, only touching characters that
/// are part of an escape sequence.
fn lower_percent_escape(original: &str) -> Cow<str> {
    if let Some(first) = original.find('%') {
        let start = first + 1;
        let mut out = Vec::with_capacity(original.len());
        out.extend_from_slice(original[..start].as_bytes());
        let search = original[start..].bytes();

        let mut count = 2;

        for c in search {
            let mut lc = c;

            if count > 0 {
                lc = c.to_ascii_lowercase();
                count -= 1;
            } else if c == b'%' {
                count = 2;
            }

            out.push(lc);
        }

        // Safe: the input was fully percent encoded above, so it is pure ASCII
        Cow::Owned(unsafe { String::from_utf8_unchecked(out) })
    } else {
        original.into()
    }
}

fn parse_config<'a, T: Deserialize<'a> + Default>(config_bytes: Option<&'a [u8]>) -> Result<T> {
    match config_bytes {
        Some(bytes) => Ok(serde_json::from_slice(bytes)?),
        None => Ok(T::default()),
    }
}

fn validate_extension_name(
    expected: LayoutExtensionName,
    actual: LayoutExtensionName,
) -> Result<()> {
    if actual != expected {
        Err(OcflError::RepositoryConfig(format!(
            "Expected layout extension name {}; found: {}",
            expected, actual
        )))
    } else {
        Ok(())
    }
}

fn validate_tuple_config(
    algorithm: DigestAlgorithm,
    tuple_size: usize,
    number_of_tuples: usize,
) -> Result<()> {
    if (tuple_size == 0) != (number_of_tuples == 0) {
        return Err(OcflError::RepositoryConfig(format!(
            "If tupleSize (={}) or numberOfTuples (={}) is 0, then both must be 0.",
            tuple_size, number_of_tuples
        )));
    }

    let digest: String = algorithm.hash_hex(&mut "test".as_bytes()).unwrap().into();
    let total_tuples_length = tuple_size * number_of_tuples;

    if digest.len() < total_tuples_length {
        return Err(OcflError::RepositoryConfig(format!(
            "tupleSize={} and numberOfTuples={} requires a minimum of {} characters, \
             but digest algorithm {} only produces {}.",
            tuple_size,
            number_of_tuples,
            total_tuples_length,
            algorithm,
            digest.len()
        )));
    }

    Ok(())
}
