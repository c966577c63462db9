use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// The structured-data kinds held by the data cache. Each kind owns exactly one file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    MenuCategories,
    Pricing,
    DrinkConfiguration,
}

impl DataKind {
    pub const ALL: [DataKind; 3] = [
        DataKind::MenuCategories,
        DataKind::Pricing,
        DataKind::DrinkConfiguration,
    ];

    /// Fixed, filesystem-safe name used both as the file stem and the metadata key.
    pub const fn name(self) -> &'static str {
        match self {
            DataKind::MenuCategories => "menu_categories",
            DataKind::Pricing => "pricing",
            DataKind::DrinkConfiguration => "drink_configuration",
        }
    }

    /// Built-in time-to-live before a cached value is considered stale.
    pub const fn default_ttl(self) -> Duration {
        match self {
            DataKind::MenuCategories | DataKind::Pricing => DAY,
            DataKind::DrinkConfiguration => WEEK,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub(crate) fn file_name(self) -> String {
        format!("{}.bin", self.name())
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// On-disk image encoding, selected by content when the image is compressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    /// PNG, used for alpha-bearing assets.
    Lossless,
    /// JPEG at the configured quality, used for opaque assets.
    Lossy,
}

impl ImageFormat {
    pub const ALL: [ImageFormat; 2] = [ImageFormat::Lossless, ImageFormat::Lossy];

    pub const fn extension(self) -> &'static str {
        match self {
            ImageFormat::Lossless => "png",
            ImageFormat::Lossy => "jpg",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|format| format.extension() == ext)
    }
}

/// Content key for an image: the lowercase hex SHA-256 of its source URL.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageKey(String);

impl ImageKey {
    pub fn for_url(url: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Parses a previously produced digest, rejecting anything that is not 64 hex chars.
    pub fn from_digest(digest: &str) -> Option<Self> {
        let valid = digest.len() == 64
            && digest
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(digest.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name for this key stored in `format`, e.g. `<digest>.png`.
    pub fn file_name(&self, format: ImageFormat) -> String {
        format!("{}.{}", self.0, format.extension())
    }

    /// Inverse of [`Self::file_name`].
    pub fn parse_file_name(name: &str) -> Option<(Self, ImageFormat)> {
        let (digest, ext) = name.rsplit_once('.')?;
        Some((Self::from_digest(digest)?, ImageFormat::from_extension(ext)?))
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
