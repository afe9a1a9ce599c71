//! Section extraction: walk the label's section tree and produce one record per logical
//! section, keyed and ordered through the LOINC mapper.
//!
//! The walk is pre-order over `structuredBody` components. A section mapped to a child
//! kind (pregnancy, pharmacokinetics, ...) and an unmapped section nested inside an
//! emitted one are folded into their host as titled sub-blocks; everything else becomes
//! a record of its own. Records whose rendered body ends up empty are dropped.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::document::{Element, RawLabelDocument, SectionElement};
use crate::images::ImageRegistry;
use crate::loinc::{base_key, derive_key, LoincMapper, SectionKind};
use crate::render::{render_section, RenderedHtml};
use crate::text::{escape_attr, escape_text, format_key_title};

/// Sections with no known code or key sort after every known kind, in document order.
pub const UNMAPPED_ORDER_BASE: u32 = 1_000_000;

/// How a record came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionSource {
    /// Mapped LOINC code, found by the main walk.
    Primary,
    /// Unknown code, keyed from the display name or title.
    Unmapped,
    /// Recovered by the critical-section rescue pass.
    CriticalRescue,
    /// Mapped section with no body of its own, assembled from merged subsections.
    HtmlFallback,
    /// Placeholder parent created to host subsections whose parent is absent.
    Generated,
}

/// One logical section of a label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionRecord {
    pub key: String,
    pub title: String,
    pub loinc_code: Option<String>,
    pub display_name: Option<String>,
    pub html: String,
    pub order: u32,
    pub source: SectionSource,
    /// Document-order index of the `<section>` element the record was built from.
    #[serde(skip)]
    pub element_index: Option<usize>,
    /// Registry ids shown in `html`.
    #[serde(skip)]
    pub image_refs: Vec<String>,
}

impl SectionRecord {
    fn append_block(&mut self, html: &str, image_refs: &[String]) {
        self.html.push_str(html);
        for id in image_refs {
            if !self.image_refs.contains(id) {
                self.image_refs.push(id.clone());
            }
        }
    }
}

/// Records keyed by section key, plus which `<section>` elements are already accounted
/// for (emitted as a record, merged as a sub-block, or inside a skipped subtree).
#[derive(Debug, Clone, Default)]
pub struct SectionMap {
    records: IndexMap<String, SectionRecord>,
    claimed: HashMap<usize, String>,
    skipped: HashSet<usize>,
}

impl SectionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&SectionRecord> {
        self.records.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &SectionRecord> {
        self.records.values()
    }

    /// Insert or replace the record under its key, claiming its element.
    pub fn insert(&mut self, record: SectionRecord) -> Option<SectionRecord> {
        if let Some(index) = record.element_index {
            self.claimed.insert(index, record.key.clone());
        }
        self.records.insert(record.key.clone(), record)
    }

    /// Remove a record and release every element claimed on its behalf.
    pub fn remove(&mut self, key: &str) -> Option<SectionRecord> {
        self.remove_with_claims(key).map(|(record, _)| record)
    }

    /// Like [`SectionMap::remove`], also returning the released element indices in
    /// document order.
    pub fn remove_with_claims(&mut self, key: &str) -> Option<(SectionRecord, Vec<usize>)> {
        let removed = self.records.shift_remove(key)?;
        let mut released = Vec::new();
        self.claimed.retain(|index, owner| {
            if owner == key {
                released.push(*index);
                false
            } else {
                true
            }
        });
        released.sort_unstable();
        Some((removed, released))
    }

    /// Insert `record` and claim `indices` for it.
    pub fn restore(&mut self, record: SectionRecord, indices: &[usize]) {
        let key = record.key.clone();
        self.insert(record);
        for index in indices {
            self.claim(*index, &key);
        }
    }

    /// The record that emitted or absorbed the section element at `index`.
    pub fn owner(&self, index: usize) -> Option<&SectionRecord> {
        self.claimed.get(&index).and_then(|key| self.records.get(key))
    }

    pub fn is_claimed(&self, index: usize) -> bool {
        self.claimed.contains_key(&index)
    }

    /// Whether the element at `index` is a summary/navigation section or inside one.
    pub fn is_skipped(&self, index: usize) -> bool {
        self.skipped.contains(&index)
    }

    /// Stable sort by `order`; records with equal order keep insertion order.
    pub fn sort_by_order(&mut self) {
        self.records.sort_by(|_, a, _, b| a.order.cmp(&b.order));
    }

    pub fn into_records(self) -> IndexMap<String, SectionRecord> {
        self.records
    }

    /// Mark the element at `index` as shown by the record at `key`.
    pub fn claim(&mut self, index: usize, key: &str) {
        self.claimed.insert(index, key.to_string());
    }

    fn get_mut(&mut self, key: &str) -> Option<&mut SectionRecord> {
        self.records.get_mut(key)
    }

    fn drop_empty(&mut self) {
        let empty: Vec<String> = self
            .records
            .values()
            .filter(|record| record.html.trim().is_empty())
            .map(|record| record.key.clone())
            .collect();
        for key in empty {
            debug!(%key, "dropping section with empty body");
            self.remove(&key);
        }
    }
}

/// Extract every section of `doc` with the built-in LOINC table.
pub fn extract_sections(doc: &RawLabelDocument, set_id: &str, registry: &ImageRegistry) -> SectionMap {
    extract_sections_with(doc, set_id, registry, LoincMapper::global())
}

/// Extract every section of `doc`, returning records sorted by display order.
pub fn extract_sections_with(
    doc: &RawLabelDocument,
    set_id: &str,
    registry: &ImageRegistry,
    mapper: &LoincMapper,
) -> SectionMap {
    let mut extractor = Extractor {
        set_id,
        registry,
        mapper,
        map: SectionMap::new(),
        visited: HashSet::new(),
    };

    for section in doc.top_level_sections() {
        extractor.visit(section.element, None);
    }
    // Sections reachable only through unusual wrappers.
    for section in doc.sections() {
        if !extractor.visited.contains(&section.index()) {
            extractor.visit(section.element, None);
        }
    }

    let mut map = extractor.map;
    map.drop_empty();
    map.sort_by_order();
    debug!(sections = map.len(), "section extraction finished");
    map
}

/// Title precedence: `<title>`, then the code's display name, then the kind's heading,
/// then the key spelled out.
pub fn section_title(section: &SectionElement<'_>, kind: Option<&SectionKind>, key: &str) -> String {
    section
        .title()
        .or_else(|| section.display_name().map(str::to_string))
        .or_else(|| kind.map(|kind| kind.title.to_string()))
        .unwrap_or_else(|| format_key_title(key))
}

/// Markup for a section folded into its host. The subsection's own code is kept as a
/// data attribute.
pub fn sub_block(key: &str, code: Option<&str>, title: &str, body: &str) -> String {
    let mut html = format!(
        "<div class=\"spl-subsection\" data-section-key=\"{}\"",
        escape_attr(key)
    );
    if let Some(code) = code {
        html.push_str(&format!(" data-loinc=\"{}\"", escape_attr(code)));
    }
    html.push_str(&format!("><h4>{}</h4>{body}</div>", escape_text(title)));
    html
}

/// Render a section the way extraction would, folding in its nested sections that no
/// other record has taken. Used when a section is picked up outside the main walk.
pub fn render_with_subsections(
    section: SectionElement<'_>,
    set_id: &str,
    key: &str,
    registry: &ImageRegistry,
    map: &SectionMap,
    mapper: &LoincMapper,
) -> (RenderedHtml, Vec<usize>) {
    let mut rendered = section
        .content()
        .map(|content| render_section(content, set_id, key, registry))
        .unwrap_or_default();
    let mut absorbed = vec![section.index()];

    let mut stack: Vec<&Element> = section.subsections().into_iter().rev().collect();
    while let Some(element) = stack.pop() {
        let child = SectionElement::new(element);
        if map.is_claimed(child.index())
            || map.is_skipped(child.index())
            || mapper.is_skipped(child.code(), child.title().as_deref())
        {
            continue;
        }
        absorbed.push(child.index());
        let kind = child.code().and_then(|code| mapper.kind_for_code(code));
        let child_key = kind
            .map(|kind| kind.key.to_string())
            .unwrap_or_else(|| derive_key(child.display_name(), child.title().as_deref()));
        if let Some(content) = child.content() {
            let body = render_section(content, set_id, key, registry);
            if !body.html.is_empty() {
                let title = section_title(&child, kind, &child_key);
                rendered
                    .html
                    .push_str(&sub_block(&child_key, child.code(), &title, &body.html));
                for id in body.image_refs {
                    if !rendered.image_refs.contains(&id) {
                        rendered.image_refs.push(id);
                    }
                }
            }
        }
        stack.extend(child.subsections().into_iter().rev());
    }

    (rendered, absorbed)
}

struct Extractor<'a> {
    set_id: &'a str,
    registry: &'a ImageRegistry,
    mapper: &'a LoincMapper,
    map: SectionMap,
    visited: HashSet<usize>,
}

impl Extractor<'_> {
    /// `host` is the key of the nearest emitted ancestor record.
    fn visit(&mut self, element: &Element, host: Option<&str>) {
        if !self.visited.insert(element.index) {
            return;
        }
        let section = SectionElement::new(element);
        let code = section.code();
        let title = section.title();

        if self.mapper.is_skipped(code, title.as_deref()) {
            debug!(?code, ?title, "skipping summary section");
            self.skip_subtree(element);
            return;
        }

        let next_host = match code.and_then(|code| self.mapper.kind_for_code(code)) {
            Some(kind) => match kind.parent {
                Some(parent) => {
                    let target = host.map(str::to_string).unwrap_or_else(|| self.placeholder(parent));
                    self.merge(&section, Some(kind), kind.key, &target);
                    Some(target)
                }
                None => self.emit_mapped(&section, kind).or(host.map(str::to_string)),
            },
            None => {
                if let Some(code) = code {
                    debug!(%code, ?title, "unmapped section code");
                }
                match host {
                    Some(host) => {
                        let key = derive_key(section.display_name(), title.as_deref());
                        self.merge(&section, None, &key, host);
                        Some(host.to_string())
                    }
                    None => Some(self.emit_unmapped(&section)),
                }
            }
        };

        for child in section.subsections() {
            self.visit(child, next_host.as_deref());
        }
    }

    fn render(&self, section: &SectionElement<'_>, key: &str) -> RenderedHtml {
        match section.content() {
            Some(content) => render_section(content, self.set_id, key, self.registry),
            None => {
                debug!(%key, code = ?section.code(), "section has no content node");
                RenderedHtml::default()
            }
        }
    }

    /// Emit a record for a mapped top-level kind. Returns the key used, or `None` when
    /// the section duplicates a single-instance key.
    fn emit_mapped(&mut self, section: &SectionElement<'_>, kind: &'static SectionKind) -> Option<String> {
        let (key, order, displaced) = match self.map.get(kind.key) {
            None => (kind.key.to_string(), kind.instance_order(1), None),
            Some(existing)
                if matches!(existing.source, SectionSource::Unmapped | SectionSource::Generated) =>
            {
                let displaced = self.map.remove_with_claims(kind.key);
                (kind.key.to_string(), kind.instance_order(1), displaced)
            }
            Some(_) if kind.multi_instance => {
                let (key, n) = self.next_suffix(kind.key);
                (key, kind.instance_order(n), None)
            }
            Some(_) => {
                debug!(key = kind.key, index = section.index(), "duplicate single-instance section skipped");
                return None;
            }
        };

        let rendered = self.render(section, &key);
        let mut record = SectionRecord {
            title: section_title(section, Some(kind), &key),
            key: key.clone(),
            loinc_code: section.code().map(str::to_string),
            display_name: section.display_name().map(str::to_string),
            source: SectionSource::Primary,
            html: rendered.html,
            order,
            element_index: Some(section.index()),
            image_refs: rendered.image_refs,
        };

        let Some((previous, claims)) = displaced else {
            self.map.insert(record);
            return Some(key);
        };
        if !previous.html.trim().is_empty() {
            if record.html.trim().is_empty() {
                record.source = SectionSource::HtmlFallback;
            }
            match previous.source {
                // A heading-keyed section under the same key stays as a titled sub-block.
                SectionSource::Unmapped => {
                    debug!(key = %previous.key, "unmapped section folded into mapped section");
                    let block = sub_block(
                        &previous.key,
                        previous.loinc_code.as_deref(),
                        &previous.title,
                        &previous.html,
                    );
                    record.append_block(&block, &previous.image_refs);
                }
                // Sub-blocks merged into a placeholder before this section appeared.
                _ => record.append_block(&previous.html, &previous.image_refs),
            }
        }
        self.map.restore(record, &claims);
        Some(key)
    }

    fn emit_unmapped(&mut self, section: &SectionElement<'_>) -> String {
        let base = derive_key(section.display_name(), section.title().as_deref());
        let (key, instance) = if self.map.contains_key(&base) {
            self.next_suffix(&base)
        } else {
            (base, 1)
        };
        // A heading that spells a known key sorts with that kind.
        let order = match self.mapper.kind(base_key(&key)) {
            Some(kind) => kind.instance_order(instance),
            None => UNMAPPED_ORDER_BASE + section.index() as u32,
        };
        let rendered = self.render(section, &key);
        self.map.insert(SectionRecord {
            title: section_title(section, None, &key),
            key: key.clone(),
            loinc_code: section.code().map(str::to_string),
            display_name: section.display_name().map(str::to_string),
            html: rendered.html,
            order,
            source: SectionSource::Unmapped,
            element_index: Some(section.index()),
            image_refs: rendered.image_refs,
        });
        key
    }

    /// Fold a section into the record at `target` as a titled sub-block.
    fn merge(&mut self, section: &SectionElement<'_>, kind: Option<&SectionKind>, key: &str, target: &str) {
        let rendered = self.render(section, target);
        let title = section_title(section, kind, key);
        self.map.claim(section.index(), target);
        if rendered.html.is_empty() {
            return;
        }
        let block = sub_block(key, section.code(), &title, &rendered.html);
        if let Some(record) = self.map.get_mut(target) {
            if record.html.trim().is_empty() && record.source == SectionSource::Primary {
                record.source = SectionSource::HtmlFallback;
            }
            record.append_block(&block, &rendered.image_refs);
        }
    }

    /// Key of the record hosting children of `parent`, creating an empty placeholder when
    /// the document has no such section (yet).
    fn placeholder(&mut self, parent: &'static str) -> String {
        if !self.map.contains_key(parent) {
            let kind = self.mapper.kind(parent);
            debug!(key = parent, "creating placeholder parent section");
            self.map.insert(SectionRecord {
                key: parent.to_string(),
                title: kind
                    .map(|kind| kind.title.to_string())
                    .unwrap_or_else(|| format_key_title(parent)),
                loinc_code: None,
                display_name: None,
                html: String::new(),
                order: kind.map_or(UNMAPPED_ORDER_BASE, |kind| kind.instance_order(1)),
                source: SectionSource::Generated,
                element_index: None,
                image_refs: Vec::new(),
            });
        }
        parent.to_string()
    }

    /// First free `key{n}` with n >= 2.
    fn next_suffix(&self, key: &str) -> (String, u32) {
        let base = base_key(key);
        let mut n = 2;
        loop {
            let candidate = format!("{base}{n}");
            if !self.map.contains_key(&candidate) {
                return (candidate, n);
            }
            n += 1;
        }
    }

    fn skip_subtree(&mut self, element: &Element) {
        self.map.skipped.insert(element.index);
        for nested in element.descendants().filter(|el| el.name == "section") {
            self.visited.insert(nested.index);
            self.map.skipped.insert(nested.index);
        }
    }
}
