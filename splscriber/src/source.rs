//! Where label XML and its supplementary data come from.
//!
//! The parser only ever sees already-fetched values. A [`LabelSource`] gathers them for a
//! set id; [`DirectorySource`] reads them from files laid out as
//!
//! ```text
//! <dir>/<setId>.xml              label XML (required)
//! <dir>/<setId>.media.json       [MediaMetadata]
//! <dir>/<setId>.ndc.json         [NdcPackage]
//! <dir>/<setId>.rxnorm.json      [RxNormMapping]
//! <dir>/<setId>.pharmclass.json  [PharmacologicClass]
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::details::SupplementaryData;
use crate::error::{SplError, SplResult};

/// Everything needed to parse one label.
#[derive(Debug, Clone, Default)]
pub struct LabelInputs {
    pub xml: String,
    pub supplementary: SupplementaryData,
}

pub trait LabelSource: Send + Sync {
    /// Fetch the label XML and whatever supplementary data is available.
    ///
    /// Fails only when the label itself is unavailable; missing supplementary data comes
    /// back empty.
    fn fetch(&self, set_id: &str) -> SplResult<LabelInputs>;
}

#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file(&self, set_id: &str, suffix: &str) -> PathBuf {
        self.root.join(format!("{set_id}.{suffix}"))
    }

    /// A missing or unreadable sidecar is logged and treated as empty.
    fn sidecar<T: DeserializeOwned>(&self, set_id: &str, suffix: &str) -> Vec<T> {
        let path = self.file(set_id, suffix);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no supplementary file");
                return Vec::new();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read supplementary file");
                return Vec::new();
            }
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "ignoring malformed supplementary file");
            Vec::new()
        })
    }
}

/// Set ids are UUIDs; anything else could escape the directory.
fn valid_set_id(set_id: &str) -> bool {
    !set_id.is_empty() && set_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

impl LabelSource for DirectorySource {
    fn fetch(&self, set_id: &str) -> SplResult<LabelInputs> {
        if !valid_set_id(set_id) {
            return Err(SplError::NotFound(set_id.to_string()));
        }
        let xml = match fs::read_to_string(self.file(set_id, "xml")) {
            Ok(xml) => xml,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SplError::NotFound(set_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        Ok(LabelInputs {
            xml,
            supplementary: SupplementaryData {
                media: self.sidecar(set_id, "media.json"),
                packages: self.sidecar(set_id, "ndc.json"),
                rx_norm_mappings: self.sidecar(set_id, "rxnorm.json"),
                pharmacologic_class: self.sidecar(set_id, "pharmclass.json"),
            },
        })
    }
}
