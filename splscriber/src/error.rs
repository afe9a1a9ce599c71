//! Error types for SPL ingestion.
//!
//! Only the "cannot parse at all" family ever escapes [`crate::parse_label`]. Everything
//! else (unmapped codes, missing sections, unresolvable images, absent supplementary data)
//! degrades into a smaller result and is reported through `tracing`.

#[derive(Debug, thiserror::Error)]
pub enum SplError {
    #[error("malformed SPL document: {0}")]
    MalformedDocument(String),
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("LOINC code {code} maps to both `{first}` and `{second}`")]
    ConflictingLoincCode {
        code: String,
        first: String,
        second: String,
    },
    #[error("label not found for set id {0}")]
    NotFound(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type SplResult<T> = std::result::Result<T, SplError>;
