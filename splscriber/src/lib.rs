//! # Splscriber - SPL Drug Label Ingestion
//!
//! Turns a Structured Product Labeling (SPL) document, the XML format in which drug labels
//! are published, into a render-ready [`MedicationDetails`]: ordered sections of sanitized
//! HTML, a registry of resolved images, and those images partitioned for gallery and
//! Instructions for Use views.
//!
//! ## Pipeline Overview
//!
//! 1. **XML Parsing**: read the label once into an owned element tree ([`document`])
//! 2. **Image Registry**: index every media declaration of the document ([`images`])
//! 3. **Section Extraction**: map LOINC codes to section keys, merge subsections, suffix
//!    repeated Instructions for Use ([`loinc`], [`sections`])
//! 4. **Rendering**: SPL narrative markup to HTML, media references resolved ([`render`])
//! 5. **Critical-Section Rescue**: find Indications and Dosage under wrong codes ([`rescue`])
//! 6. **Image Categorization**: product, instruction, label and clinical buckets
//!    ([`categorize`])
//!
//! Parsing is pure: no I/O, no caching, no shared state. Fetching and caching live with
//! the caller ([`source`], [`cache`], [`service`]).
//!
//! ```
//! use splscriber::{parse_label, SplConfig, SupplementaryData};
//!
//! let xml = r#"<document><component><structuredBody><component><section>
//!     <code code="34067-9"/><title>INDICATIONS</title>
//!     <text><paragraph>Treats X.</paragraph></text>
//! </section></component></structuredBody></component></document>"#;
//!
//! let details = parse_label(xml, "set-1", &SupplementaryData::default(), &SplConfig::default())?;
//! assert_eq!(details.sections["indications"].html, "<p>Treats X.</p>");
//! # Ok::<(), splscriber::SplError>(())
//! ```

pub mod cache;
pub mod categorize;
pub mod config;
pub mod details;
pub mod document;
pub mod error;
pub mod images;
pub mod import;
pub mod loinc;
pub mod render;
pub mod rescue;
pub mod sections;
pub mod service;
pub mod source;
pub mod text;

pub use cache::DetailsCache;
pub use categorize::{categorize, CategorizedImages};
pub use config::SplConfig;
pub use details::{parse_label, MedicationDetails, SupplementaryData};
pub use document::RawLabelDocument;
pub use error::{SplError, SplResult};
pub use images::{ImageRecord, ImageRegistry, ImageType, ImageUrlBuilder};
pub use import::SavedMedication;
pub use loinc::LoincMapper;
pub use render::render_section_html;
pub use rescue::ensure_critical_sections;
pub use sections::{extract_sections, SectionMap, SectionRecord, SectionSource};
pub use service::LabelService;
pub use source::{DirectorySource, LabelInputs, LabelSource};
