//! Blob store options

use crate::error::{BlobStoreError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::env;
use std::path::PathBuf;

pub const DEFAULT_CHECK_PERCENT: u8 = 10;

/// Options selecting and tuning a blob store variant.
///
/// No `cache_directory` means blobs are unsupported. With a directory,
/// `shared_directory` makes it the canonical store; otherwise it is a cache
/// of the remote store, optionally capped at `max_cache_bytes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobStoreOptions {
    pub cache_directory: Option<PathBuf>,
    pub shared_directory: bool,
    #[serde(deserialize_with = "deserialize_cache_size")]
    pub max_cache_bytes: Option<u64>,
    pub check_percent: u8,
    /// History-free storage keeps only the latest revision of each object
    pub keep_history: bool,
}

impl Default for BlobStoreOptions {
    fn default() -> Self {
        Self {
            cache_directory: None,
            shared_directory: false,
            max_cache_bytes: None,
            check_percent: DEFAULT_CHECK_PERCENT,
            keep_history: true,
        }
    }
}

impl BlobStoreOptions {
    /// Read options from `BLOB_CACHE_DIR`, `BLOB_SHARED_DIR`,
    /// `BLOB_CACHE_SIZE`, `BLOB_CACHE_SIZE_CHECK` and `KEEP_HISTORY`.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let cache_directory = env::var("BLOB_CACHE_DIR")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let shared_directory = env::var("BLOB_SHARED_DIR")
            .map(|v| parse_flag(&v))
            .unwrap_or(defaults.shared_directory);

        let max_cache_bytes = match env::var("BLOB_CACHE_SIZE") {
            Ok(v) => parse_byte_size(&v)?,
            Err(_) => defaults.max_cache_bytes,
        };

        let check_percent = match env::var("BLOB_CACHE_SIZE_CHECK") {
            Ok(v) => v.trim().parse::<u8>().map_err(|_| {
                BlobStoreError::InvalidConfig(format!(
                    "BLOB_CACHE_SIZE_CHECK must be a percentage, got {:?}",
                    v
                ))
            })?,
            Err(_) => defaults.check_percent,
        };

        let keep_history = env::var("KEEP_HISTORY")
            .map(|v| parse_flag(&v))
            .unwrap_or(defaults.keep_history);

        let options = Self {
            cache_directory,
            shared_directory,
            max_cache_bytes,
            check_percent,
            keep_history,
        };
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.check_percent >= 100 {
            return Err(BlobStoreError::InvalidConfig(format!(
                "check_percent must be below 100, got {}",
                self.check_percent
            )));
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Parse a byte count with an optional `KB`/`MB`/`GB` suffix.
///
/// `unbounded`, `none` and the empty string mean no cap.
pub fn parse_byte_size(value: &str) -> Result<Option<u64>> {
    let trimmed = value.trim();
    let lower = trimmed.to_ascii_lowercase();
    if lower.is_empty() || lower == "unbounded" || lower == "none" {
        return Ok(None);
    }

    let (digits, multiplier) = if let Some(n) = lower.strip_suffix("gb") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = lower.strip_suffix("mb") {
        (n, 1024 * 1024)
    } else if let Some(n) = lower.strip_suffix("kb") {
        (n, 1024)
    } else {
        (lower.as_str(), 1)
    };

    digits
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .map(Some)
        .ok_or_else(|| BlobStoreError::InvalidConfig(format!("invalid byte size {:?}", trimmed)))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CacheSizeRepr {
    Bytes(u64),
    Text(String),
}

fn deserialize_cache_size<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<CacheSizeRepr>::deserialize(deserializer)? {
        None => Ok(None),
        Some(CacheSizeRepr::Bytes(n)) => Ok(Some(n)),
        Some(CacheSizeRepr::Text(s)) => parse_byte_size(&s).map_err(serde::de::Error::custom),
    }
}
