//! Image registry: every media declaration of a label, resolved once.
//!
//! SPL declares images with `<observationMedia ID="..">` elements that may sit in any
//! section and be displayed from several others through `<renderMultiMedia
//! referencedObject="..">`. The registry indexes all declarations of the whole document
//! up front so every reference site reuses the same resolved record and URL.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::document::{Element, RawLabelDocument};
use crate::error::{SplError, SplResult};
use crate::render::figure_number;

pub const DEFAULT_IMAGE_HOST: &str = "https://dailymed.nlm.nih.gov/dailymed/image.cfm";

const IMAGE_EXTENSIONS: &[&str] = &[
    ".jpeg", ".jpg", ".png", ".gif", ".bmp", ".tiff", ".tif", ".svg", ".webp",
];

/// Shortest fragment the fuzzy matcher will compare; anything shorter matches too much.
const MIN_FUZZY_LEN: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    #[default]
    Package,
    Instruction,
    Label,
    Clinical,
}

/// One resolved embedded image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    /// Internal document reference key (the declaration's `ID`).
    pub id: String,
    /// Raw reference value as declared, e.g. `lantus-fig-01.jpg`.
    #[serde(rename = "ref")]
    pub reference: String,
    /// Canonical name: no leading `#`, no image extension.
    pub name: String,
    pub url: String,
    pub alternate_url: String,
    pub caption: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
    pub image_type: ImageType,
    pub used_in_sections: Vec<String>,
}

/// Media metadata as returned by the label registry's media endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMetadata {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

/// The single place image URLs are constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUrlBuilder {
    host: Url,
}

impl ImageUrlBuilder {
    /// # Errors
    ///
    /// [`SplError::InvalidConfig`] when `host` is not an absolute URL.
    pub fn new(host: &str) -> SplResult<Self> {
        let host = Url::parse(host)
            .map_err(|e| SplError::InvalidConfig(format!("invalid image host `{host}`: {e}")))?;
        Ok(Self { host })
    }

    /// `<host>?name=<name>&setid=<setId>`
    pub fn primary(&self, name: &str, set_id: &str) -> String {
        self.with_query(&[("name", name), ("setid", set_id)])
    }

    /// `<host>?setid=<setId>&name=<name>`, tried by the viewer when the primary 404s.
    pub fn alternate(&self, name: &str, set_id: &str) -> String {
        self.with_query(&[("setid", set_id), ("name", name)])
    }

    /// Percent-encoded query: a space is `%20`, never `+`.
    fn with_query(&self, pairs: &[(&str, &str)]) -> String {
        let mut url = self.host.clone();
        url.query_pairs_mut().clear().extend_pairs(pairs);
        // Form encoding writes a literal `+` as `%2B`, so every remaining `+` is a space.
        let query = url.query().map(|query| query.replace('+', "%20"));
        url.set_query(query.as_deref());
        url.to_string()
    }
}

impl Default for ImageUrlBuilder {
    fn default() -> Self {
        Self {
            host: Url::parse(DEFAULT_IMAGE_HOST).expect("default image host is a valid URL"),
        }
    }
}

/// Strip a leading `#`, any path, and a known image extension.
pub fn canonical_name(raw: &str) -> String {
    let trimmed = raw.trim().trim_start_matches('#');
    let file = trimmed.rsplit('/').next().unwrap_or(trimmed);
    let lower = file.to_ascii_lowercase();
    for ext in IMAGE_EXTENSIONS {
        if lower.ends_with(ext) {
            return file[..file.len() - ext.len()].to_string();
        }
    }
    file.to_string()
}

/// How a reference was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Fuzzy,
}

/// Outcome of resolving one media reference.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageResolution<'a> {
    Registered {
        record: &'a ImageRecord,
        matched: MatchKind,
    },
    /// Nothing in the registry matched; the URL is synthesized from the raw fragment.
    Fallback {
        name: String,
        url: String,
        alternate_url: String,
    },
}

impl ImageResolution<'_> {
    pub fn url(&self) -> &str {
        match self {
            ImageResolution::Registered { record, .. } => &record.url,
            ImageResolution::Fallback { url, .. } => url,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, ImageResolution::Fallback { .. })
    }
}

/// id → image index for one document.
#[derive(Debug, Clone)]
pub struct ImageRegistry {
    set_id: String,
    urls: ImageUrlBuilder,
    entries: IndexMap<String, ImageRecord>,
    linked_figures: BTreeSet<u32>,
}

impl ImageRegistry {
    /// Index every media declaration in `doc`, then merge `media` metadata.
    ///
    /// Declarations keep document order; the first declaration of a duplicated id wins.
    /// Metadata entries that match a declared name only contribute mime type and size;
    /// the rest are appended as records of their own.
    pub fn build(
        doc: &RawLabelDocument,
        set_id: &str,
        media: &[MediaMetadata],
        urls: &ImageUrlBuilder,
    ) -> Self {
        let mut registry = Self {
            set_id: set_id.to_string(),
            urls: urls.clone(),
            entries: IndexMap::new(),
            linked_figures: BTreeSet::new(),
        };

        for media_el in doc.root().descendants().filter(|el| el.name == "observationMedia") {
            let value = media_el.child("value");
            let Some(reference) = value
                .and_then(|v| v.child("reference"))
                .and_then(|r| r.attr("value"))
                .map(str::trim)
                .filter(|r| !r.is_empty())
            else {
                debug!(id = ?media_el.attr("ID"), "media declaration without a reference value");
                continue;
            };

            let name = canonical_name(reference);
            let id = media_el
                .attr("ID")
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| name.clone());
            if registry.entries.contains_key(&id) {
                debug!(%id, "duplicate media declaration ignored");
                continue;
            }

            let caption = media_el
                .child("text")
                .map(|t| t.text_content())
                .filter(|c| !c.is_empty());
            let mime_type = value
                .and_then(|v| v.attr("mediaType"))
                .map(str::to_string);

            let record = registry.new_record(id.clone(), reference.to_string(), name, caption, mime_type, None);
            registry.entries.insert(id, record);
        }

        for item in media {
            let name = canonical_name(&item.name);
            if name.is_empty() {
                continue;
            }
            let existing = registry
                .entries
                .values_mut()
                .find(|record| record.name.eq_ignore_ascii_case(&name));
            match existing {
                Some(record) => {
                    if record.mime_type.is_none() {
                        record.mime_type = item.mime_type.clone();
                    }
                    if record.size.is_none() {
                        record.size = item.size;
                    }
                }
                None => {
                    if registry.entries.contains_key(&name) {
                        continue;
                    }
                    let record = registry.new_record(
                        name.clone(),
                        item.name.clone(),
                        name.clone(),
                        None,
                        item.mime_type.clone(),
                        item.size,
                    );
                    registry.entries.insert(name, record);
                }
            }
        }

        registry.linked_figures = linked_figures(doc, &registry);
        registry
    }

    fn new_record(
        &self,
        id: String,
        reference: String,
        name: String,
        caption: Option<String>,
        mime_type: Option<String>,
        size: Option<u64>,
    ) -> ImageRecord {
        ImageRecord {
            url: self.urls.primary(&name, &self.set_id),
            alternate_url: self.urls.alternate(&name, &self.set_id),
            id,
            reference,
            name,
            caption,
            mime_type,
            size,
            image_type: ImageType::default(),
            used_in_sections: Vec::new(),
        }
    }

    pub fn set_id(&self) -> &str {
        &self.set_id
    }

    pub fn urls(&self) -> &ImageUrlBuilder {
        &self.urls
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ImageRecord> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Records in declaration order.
    pub fn records(&self) -> impl Iterator<Item = &ImageRecord> {
        self.entries.values()
    }

    pub fn into_records(self) -> Vec<ImageRecord> {
        self.entries.into_values().collect()
    }

    /// Resolve a reference: exact id, then case-insensitive substring match (either
    /// direction) against canonical names, then a URL synthesized from the raw fragment.
    pub fn resolve(&self, id: &str, raw_fragment: Option<&str>) -> ImageResolution<'_> {
        let id = id.trim().trim_start_matches('#');
        if let Some(record) = self.entries.get(id) {
            return ImageResolution::Registered {
                record,
                matched: MatchKind::Exact,
            };
        }

        let fragment = raw_fragment.filter(|f| !f.trim().is_empty()).unwrap_or(id);
        let wanted = canonical_name(fragment).to_lowercase();
        if let Some(record) = self.fuzzy_find(&wanted) {
            return ImageResolution::Registered {
                record,
                matched: MatchKind::Fuzzy,
            };
        }
        if fragment != id {
            if let Some(record) = self.fuzzy_find(&id.to_lowercase()) {
                return ImageResolution::Registered {
                    record,
                    matched: MatchKind::Fuzzy,
                };
            }
        }

        let name = canonical_name(fragment);
        debug!(%id, %name, "unresolved image reference, synthesizing URL");
        ImageResolution::Fallback {
            url: self.urls.primary(&name, &self.set_id),
            alternate_url: self.urls.alternate(&name, &self.set_id),
            name,
        }
    }

    fn fuzzy_find(&self, wanted: &str) -> Option<&ImageRecord> {
        if wanted.len() < MIN_FUZZY_LEN {
            return None;
        }
        self.entries.values().find(|record| {
            let name = record.name.to_lowercase();
            name.len() >= MIN_FUZZY_LEN && (name.contains(wanted) || wanted.contains(&name))
        })
    }

    /// Figure numbers some section of the document already shows through a media
    /// reference. A citation of any other number has no image anywhere in the label.
    pub fn linked_figures(&self) -> &BTreeSet<u32> {
        &self.linked_figures
    }

    /// The registered image that looks like figure `number` by name, id or caption.
    pub fn find_figure(&self, number: u32) -> Option<&ImageRecord> {
        self.entries.values().find(|record| {
            figure_number(&record.name) == Some(number)
                || figure_number(&record.id) == Some(number)
                || record
                    .caption
                    .as_deref()
                    .and_then(figure_number)
                    == Some(number)
        })
    }
}

/// Figure numbers carried by the media references inside section bodies, in document
/// order. A reference with no recognizable number stands for the next free number.
fn linked_figures(doc: &RawLabelDocument, registry: &ImageRegistry) -> BTreeSet<u32> {
    let mut numbered = BTreeSet::new();
    let mut unnumbered = 0;

    let bodies = doc.root().descendants().filter(|el| el.name == "text");
    for el in bodies.flat_map(Element::descendants) {
        let (id, fragment, caption) = match el.name.as_str() {
            "renderMultiMedia" => (
                el.attr("referencedObject"),
                None,
                el.child("caption").map(Element::text_content),
            ),
            "observationMedia" => {
                let reference = el.path(&["value", "reference"]).and_then(|r| r.attr("value"));
                (
                    el.attr("ID").or(reference),
                    reference,
                    el.child("text").map(Element::text_content),
                )
            }
            _ => continue,
        };
        let Some(id) = id.map(|id| id.trim().trim_start_matches('#')).filter(|id| !id.is_empty())
        else {
            continue;
        };

        let number = figure_number(id)
            .or_else(|| match registry.resolve(id, fragment) {
                ImageResolution::Registered { record, .. } => figure_number(&record.name)
                    .or_else(|| caption.as_deref().and_then(figure_number))
                    .or_else(|| record.caption.as_deref().and_then(figure_number)),
                ImageResolution::Fallback { name, .. } => {
                    figure_number(&name).or_else(|| caption.as_deref().and_then(figure_number))
                }
            });
        match number {
            Some(n) => {
                numbered.insert(n);
            }
            None => unnumbered += 1,
        }
    }

    let mut linked = numbered;
    let mut next = 1;
    for _ in 0..unnumbered {
        while linked.contains(&next) {
            next += 1;
        }
        linked.insert(next);
    }
    linked
}
