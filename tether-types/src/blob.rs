//! Storage bucket paths.

use crate::{EntityId, Error, Result, TableId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Location of a blob: a bucket plus a file name inside it.
///
/// The string key form is `"<bucket>/<fileName>"`. The file name may itself
/// contain slashes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobPath {
    pub bucket: TableId,
    pub file_name: String,
}

impl BlobPath {
    pub fn new(bucket: TableId, file_name: impl Into<String>) -> Self {
        Self {
            bucket,
            file_name: file_name.into(),
        }
    }

    /// Path of a user's profile photo in `bucket`.
    pub fn profile_photo(bucket: TableId, user_id: EntityId, format: ImageFormat) -> Self {
        Self::new(bucket, format!("{user_id}.{}", format.extension()))
    }

    /// The `"<bucket>/<fileName>"` key.
    pub fn key(&self) -> String {
        format!("{}/{}", self.bucket, self.file_name)
    }

    /// Parses a key. Fails when it has fewer than two slash-delimited
    /// segments.
    pub fn parse(key: &str) -> Result<Self> {
        match key.split_once('/') {
            Some((bucket, file_name)) => Ok(Self::new(TableId::new(bucket), file_name)),
            None => Err(Error::InvalidBlobKey(key.to_string())),
        }
    }
}

impl fmt::Display for BlobPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.file_name)
    }
}

impl FromStr for BlobPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Reference to a remote file: either an absolute URL or a blob in storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRef {
    Url(String),
    Blob(BlobPath),
}

impl FileRef {
    /// Parses a stored reference. Strings with a URL scheme are URLs, anything
    /// else must be a blob key.
    pub fn parse(key: &str) -> Result<Self> {
        if has_scheme(key) {
            Ok(FileRef::Url(key.to_string()))
        } else {
            BlobPath::parse(key).map(FileRef::Blob)
        }
    }

    /// Cache key for the referenced file.
    pub fn key(&self) -> String {
        match self {
            FileRef::Url(url) => url.clone(),
            FileRef::Blob(path) => path.key(),
        }
    }
}

fn has_scheme(s: &str) -> bool {
    match s.split_once(':') {
        Some((scheme, _)) => {
            let mut chars = scheme.chars();
            chars.next().is_some_and(|c| c.is_ascii_alphabetic())
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

/// Encoding of an uploaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Jpg,
    Png,
}

impl ImageFormat {
    /// File extension without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Jpg => "jpg",
            ImageFormat::Png => "png",
        }
    }

    /// MIME content type, as sent with the upload.
    pub fn content_type(self) -> &'static str {
        match self {
            ImageFormat::Jpg => "image/jpg",
            ImageFormat::Png => "image/png",
        }
    }
}
