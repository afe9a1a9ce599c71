//! Recovery of must-have sections that the main walk did not produce.
//!
//! Labels sometimes carry Indications or Dosage under an alias or generic code. For every
//! critical key still missing after extraction, three searches run in order of
//! decreasing specificity and the first hit wins:
//!
//! 1. any section in the document coded with one of the key's LOINC codes,
//! 2. any section whose title or display name matches one of the key's heading patterns,
//! 3. any section whose rendered text matches one of the key's body patterns.
//!
//! Summary sections and sections already shown elsewhere are never candidates. A section
//! that was shown only as an unmapped record is taken over: an unmapped record of its own
//! is replaced, and an unmapped host it was folded into is rebuilt without it. An unmapped
//! record whose heading already spells the critical key counts as missing.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};

use crate::document::{RawLabelDocument, SectionElement};
use crate::images::ImageRegistry;
use crate::loinc::LoincMapper;
use crate::sections::{render_with_subsections, section_title, SectionMap, SectionRecord, SectionSource};
use crate::text::html_to_text;

/// A section the result should not go without.
#[derive(Debug)]
pub struct CriticalSection {
    pub key: &'static str,
    /// Patterns matched against titles and code display names.
    pub heading_patterns: Vec<Regex>,
    /// Patterns matched against rendered section text.
    pub body_patterns: Vec<Regex>,
    /// Absence is reported at `info` rather than `debug`.
    pub required: bool,
}

fn patterns(sources: &[&str]) -> Vec<Regex> {
    sources
        .iter()
        .map(|source| Regex::new(source).unwrap())
        .collect()
}

/// Indications, Dosage and the Boxed Warning (the label's summary of serious risks,
/// standing in for the excluded Highlights section).
pub static CRITICAL_SECTIONS: LazyLock<Vec<CriticalSection>> = LazyLock::new(|| {
    vec![
        CriticalSection {
            key: "indications",
            heading_patterns: patterns(&[
                r"(?i)\bindications?\s*(?:and|&)\s*usage\b",
                r"(?i)^\s*[\d.]*\s*indications?\b",
                r"(?i)^\s*[\d.]*\s*uses?\s*$",
            ]),
            body_patterns: patterns(&[
                r"(?i)\bindications?\s*(?:and|&)\s*usage\b",
                r"(?i)\bis indicated (?:for|as|in)\b",
            ]),
            required: true,
        },
        CriticalSection {
            key: "dosage",
            heading_patterns: patterns(&[
                r"(?i)\bdosage\s*(?:and|&)\s*administration\b",
                r"(?i)^\s*[\d.]*\s*(?:dosage|directions)\b",
            ]),
            body_patterns: patterns(&[
                r"(?i)\bdosage\s*(?:and|&)\s*administration\b",
                r"(?i)\brecommended (?:starting |initial )?dos(?:e|age)\b",
            ]),
            required: true,
        },
        CriticalSection {
            key: "boxedWarning",
            heading_patterns: patterns(&[r"(?i)\bboxed warning\b", r"(?i)^\s*warning\s*:"]),
            body_patterns: Vec::new(),
            required: false,
        },
    ]
});

/// Which search found a rescued section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescueStrategy {
    Code,
    Heading,
    FullText,
}

/// Fill in missing critical sections with the built-in tables.
pub fn ensure_critical_sections(
    doc: &RawLabelDocument,
    sections: &mut SectionMap,
    set_id: &str,
    registry: &ImageRegistry,
) {
    ensure_critical_sections_with(doc, sections, set_id, registry, LoincMapper::global(), &CRITICAL_SECTIONS);
}

pub fn ensure_critical_sections_with(
    doc: &RawLabelDocument,
    sections: &mut SectionMap,
    set_id: &str,
    registry: &ImageRegistry,
    mapper: &LoincMapper,
    critical: &[CriticalSection],
) {
    for target in critical {
        if let Some(existing) = sections.get(target.key) {
            if existing.source == SectionSource::Unmapped {
                let section = existing
                    .element_index
                    .and_then(|index| doc.sections().into_iter().find(|s| s.index() == index));
                if let Some(section) = section {
                    if take(doc, section, sections, set_id, registry, mapper, target.key) {
                        debug!(key = target.key, strategy = ?RescueStrategy::Heading, "rescued critical section");
                    }
                }
            }
            continue;
        }
        match rescue(doc, sections, set_id, registry, mapper, target) {
            Some(strategy) => debug!(key = target.key, ?strategy, "rescued critical section"),
            None if target.required => info!(key = target.key, "label provides no such section"),
            None => debug!(key = target.key, "no section found"),
        }
    }

    sections.sort_by_order();
}

fn rescue(
    doc: &RawLabelDocument,
    sections: &mut SectionMap,
    set_id: &str,
    registry: &ImageRegistry,
    mapper: &LoincMapper,
    target: &CriticalSection,
) -> Option<RescueStrategy> {
    let candidates: Vec<SectionElement<'_>> = doc
        .sections()
        .into_iter()
        .filter(|section| is_candidate(section, sections, mapper))
        .collect();
    let codes = mapper.codes_for(target.key);

    let by_code = candidates
        .iter()
        .find(|section| section.code().is_some_and(|code| codes.contains(&code)));
    if let Some(section) = by_code {
        if take(doc, *section, sections, set_id, registry, mapper, target.key) {
            return Some(RescueStrategy::Code);
        }
    }

    for section in &candidates {
        let title = section.title();
        let heading_match = [title.as_deref(), section.display_name()]
            .into_iter()
            .flatten()
            .any(|text| target.heading_patterns.iter().any(|p| p.is_match(text)));
        if heading_match && take(doc, *section, sections, set_id, registry, mapper, target.key) {
            return Some(RescueStrategy::Heading);
        }
    }

    if target.body_patterns.is_empty() {
        return None;
    }
    for section in &candidates {
        // Correctly coded sections are not reclassified by their prose.
        if section.code().and_then(|code| mapper.kind_for_code(code)).is_some() {
            continue;
        }
        let Some(content) = section.content() else {
            continue;
        };
        let text = html_to_text(&crate::render::render_section_html(content, set_id, target.key, registry));
        if target.body_patterns.iter().any(|p| p.is_match(&text))
            && take(doc, *section, sections, set_id, registry, mapper, target.key)
        {
            return Some(RescueStrategy::FullText);
        }
    }
    None
}

/// Unclaimed sections, or sections shown only through an unmapped record.
fn is_candidate(section: &SectionElement<'_>, sections: &SectionMap, mapper: &LoincMapper) -> bool {
    let index = section.index();
    if sections.is_skipped(index) || mapper.is_skipped(section.code(), section.title().as_deref()) {
        return false;
    }
    match sections.owner(index) {
        None => true,
        Some(owner) => owner.source == SectionSource::Unmapped,
    }
}

/// Build the rescued record. Returns false when the section renders empty.
fn take(
    doc: &RawLabelDocument,
    section: SectionElement<'_>,
    sections: &mut SectionMap,
    set_id: &str,
    registry: &ImageRegistry,
    mapper: &LoincMapper,
    key: &'static str,
) -> bool {
    // Release the unmapped owner first so the section and its nested sections can be
    // folded in again.
    let displaced = sections.owner(section.index()).map(|owner| owner.key.clone());
    let removed = displaced.and_then(|owner| sections.remove_with_claims(&owner));

    let (rendered, absorbed) = render_with_subsections(section, set_id, key, registry, sections, mapper);
    if rendered.html.is_empty() {
        if let Some((record, claims)) = removed {
            sections.restore(record, &claims);
        }
        return false;
    }

    let kind = mapper.kind(key);
    sections.insert(SectionRecord {
        key: key.to_string(),
        title: section_title(&section, kind, key),
        loinc_code: section.code().map(str::to_string),
        display_name: section.display_name().map(str::to_string),
        html: rendered.html,
        order: kind.map_or(0, |kind| kind.instance_order(1)),
        source: SectionSource::CriticalRescue,
        element_index: Some(section.index()),
        image_refs: rendered.image_refs,
    });
    for index in absorbed {
        sections.claim(index, key);
    }

    if let Some((host, _)) = removed {
        debug!(key = %host.key, rescued = key, "unmapped section taken over by rescue");
        if host.key != key && host.element_index != Some(section.index()) {
            rebuild_host(doc, host, sections, set_id, registry, mapper);
        }
    }
    true
}

/// Re-render an unmapped host after one of its folded-in sections was rescued out of it.
/// The rescued subtree is claimed by now, so only what remains is rendered.
fn rebuild_host(
    doc: &RawLabelDocument,
    host: SectionRecord,
    sections: &mut SectionMap,
    set_id: &str,
    registry: &ImageRegistry,
    mapper: &LoincMapper,
) {
    let Some(element) = host
        .element_index
        .and_then(|index| doc.sections().into_iter().find(|s| s.index() == index))
    else {
        return;
    };
    let (rendered, absorbed) = render_with_subsections(element, set_id, &host.key, registry, sections, mapper);
    if rendered.html.trim().is_empty() {
        debug!(key = %host.key, "unmapped host left empty after rescue");
        return;
    }
    let record = SectionRecord {
        html: rendered.html,
        image_refs: rendered.image_refs,
        ..host
    };
    sections.restore(record, &absorbed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::ImageUrlBuilder;
    use crate::sections::extract_sections;

    const SET_ID: &str = "set-1";

    fn run(body: &str) -> SectionMap {
        let xml = format!("<document><component><structuredBody>{body}</structuredBody></component></document>");
        let doc = RawLabelDocument::parse(&xml).unwrap();
        let registry = ImageRegistry::build(&doc, SET_ID, &[], &ImageUrlBuilder::default());
        let mut sections = extract_sections(&doc, SET_ID, &registry);
        ensure_critical_sections(&doc, &mut sections, SET_ID, &registry);
        sections
    }

    #[test]
    fn rescues_by_heading_and_replaces_the_unmapped_record() {
        let sections = run(
            r#"<component><section><code code="42229-5" displayName="SPL UNCLASSIFIED SECTION"/><title>1 INDICATIONS AND USAGE</title><text><paragraph>Treats X.</paragraph></text></section></component>"#,
        );
        let record = sections.get("indications").unwrap();
        assert_eq!(record.source, SectionSource::CriticalRescue);
        assert_eq!(record.html, "<p>Treats X.</p>");
        assert_eq!(record.title, "1 INDICATIONS AND USAGE");
        assert_eq!(sections.len(), 1);
    }

    #[test]
    fn unmapped_record_under_a_critical_key_is_taken_over() {
        let sections = run(
            r#"<component><section><code code="42229-5"/><title>INDICATIONS</title><text><paragraph>Treats X.</paragraph></text></section></component>
               <component><section><code code="34068-7"/><title>DOSAGE</title><text><paragraph>Take one.</paragraph></text></section></component>"#,
        );
        assert_eq!(sections.keys().collect::<Vec<_>>(), vec!["indications", "dosage"]);
        let record = sections.get("indications").unwrap();
        assert_eq!(record.source, SectionSource::CriticalRescue);
        assert_eq!(record.html, "<p>Treats X.</p>");
    }

    #[test]
    fn section_folded_into_an_unmapped_host_moves_out_of_it() {
        let sections = run(
            r#"<component><section><code code="42229-5"/><title>Preface</title><text><paragraph>Read first.</paragraph></text>
               <component><section><code code="42229-5"/><title>Indications and Usage</title><text><paragraph>Treats X.</paragraph></text></section></component>
               </section></component>"#,
        );
        assert_eq!(sections.keys().collect::<Vec<_>>(), vec!["indications", "preface"]);
        assert_eq!(sections.get("indications").unwrap().html, "<p>Treats X.</p>");

        let preface = sections.get("preface").unwrap();
        assert_eq!(preface.source, SectionSource::Unmapped);
        assert_eq!(preface.html, "<p>Read first.</p>");
    }

    #[test]
    fn rescues_by_code_into_an_empty_map() {
        let xml = r#"<document><component><structuredBody><component><section><title>Preface</title><text><paragraph>Read first.</paragraph></text>
            <component><section><code code="34068-7"/><title>Dose</title><text><paragraph>Take one.</paragraph></text></section></component>
            </section></component></structuredBody></component></document>"#;
        let doc = RawLabelDocument::parse(xml).unwrap();
        let registry = ImageRegistry::build(&doc, SET_ID, &[], &ImageUrlBuilder::default());
        let mut sections = SectionMap::new();
        ensure_critical_sections(&doc, &mut sections, SET_ID, &registry);

        let record = sections.get("dosage").unwrap();
        assert_eq!(record.source, SectionSource::CriticalRescue);
        assert_eq!(record.loinc_code.as_deref(), Some("34068-7"));
        assert_eq!(record.html, "<p>Take one.</p>");
        assert!(sections.get("indications").is_none());
    }

    #[test]
    fn rescues_by_full_text() {
        let sections = run(
            r#"<component><section><code code="42229-5" displayName="SPL UNCLASSIFIED SECTION"/><title>About</title><text><paragraph>Examplar is indicated for the treatment of X.</paragraph></text></section></component>"#,
        );
        let record = sections.get("indications").unwrap();
        assert_eq!(record.source, SectionSource::CriticalRescue);
        assert!(sections.get("about").is_none());
    }

    #[test]
    fn summary_sections_are_never_rescued() {
        let sections = run(
            r#"<component><section><code code="48780-1"/><title>HIGHLIGHTS</title><text><paragraph>INDICATIONS AND USAGE: treats X.</paragraph></text></section></component>"#,
        );
        assert!(sections.is_empty());
    }

    #[test]
    fn absent_sections_are_not_an_error() {
        let sections = run(
            r#"<component><section><code code="34088-5"/><title>OVERDOSAGE</title><text><paragraph>Call poison control.</paragraph></text></section></component>"#,
        );
        assert_eq!(sections.keys().collect::<Vec<_>>(), vec!["overdosage"]);
    }

    #[test]
    fn rescued_sections_take_their_canonical_order() {
        let sections = run(
            r#"<component><section><code code="34068-7"/><title>DOSAGE</title><text><paragraph>Take one.</paragraph></text></section></component>
               <component><section><title>Indications and Usage</title><text><paragraph>Treats X.</paragraph></text></section></component>"#,
        );
        assert_eq!(sections.keys().collect::<Vec<_>>(), vec!["indications", "dosage"]);
    }
}
