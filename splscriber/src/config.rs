//! Runtime configuration, read from TOML.
//!
//! ```toml
//! image_host = "https://dailymed.nlm.nih.gov/dailymed/image.cfm"
//! ifu_form_scan_chars = 500
//!
//! [cache]
//! capacity = 64
//! ttl_secs = 3600
//! ```
//!
//! Every field is optional; missing fields take the defaults above.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SplError, SplResult};
use crate::images::{ImageUrlBuilder, DEFAULT_IMAGE_HOST};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SplConfig {
    /// Base URL of the image endpoint; `name` and `setid` are appended as query parameters.
    pub image_host: String,
    /// How many characters of an Instructions for Use section are searched for a dosage form.
    pub ifu_form_scan_chars: usize,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl Default for SplConfig {
    fn default() -> Self {
        Self {
            image_host: DEFAULT_IMAGE_HOST.to_string(),
            ifu_form_scan_chars: 500,
            cache: CacheConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            ttl_secs: 3600,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl SplConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> SplResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> SplResult<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SplResult<()> {
        if self.image_host.trim().is_empty() {
            return Err(SplError::InvalidConfig("image_host must not be empty".into()));
        }
        ImageUrlBuilder::new(&self.image_host)?;
        if self.cache.capacity == 0 {
            return Err(SplError::InvalidConfig("cache.capacity must be at least 1".into()));
        }
        Ok(())
    }

    pub fn url_builder(&self) -> SplResult<ImageUrlBuilder> {
        ImageUrlBuilder::new(&self.image_host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_gives_defaults() {
        assert_eq!(SplConfig::from_toml("").unwrap(), SplConfig::default());
    }

    #[test]
    fn partial_tables_keep_other_defaults() {
        let config = SplConfig::from_toml("[cache]\nttl_secs = 60\n").unwrap();
        assert_eq!(config.cache.ttl(), Duration::from_secs(60));
        assert_eq!(config.cache.capacity, 64);
        assert_eq!(config.image_host, DEFAULT_IMAGE_HOST);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            SplConfig::from_toml("image_host = \"not a url\""),
            Err(SplError::InvalidConfig(_))
        ));
        assert!(matches!(
            SplConfig::from_toml("[cache]\ncapacity = 0"),
            Err(SplError::InvalidConfig(_))
        ));
        assert!(matches!(SplConfig::from_toml("colour = 1"), Err(SplError::Toml(_))));
    }

    #[test]
    fn loads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "image_host = \"https://images.example.org/image.cfm\"").unwrap();
        writeln!(file, "ifu_form_scan_chars = 200").unwrap();
        let config = SplConfig::load(file.path()).unwrap();
        assert_eq!(config.ifu_form_scan_chars, 200);
        assert_eq!(
            config.url_builder().unwrap().primary("a", "b"),
            "https://images.example.org/image.cfm?name=a&setid=b"
        );
    }
}
