mod common;

use common::{image_sources, media, nested, LabelBuilder, SET_ID};
use pretty_assertions::assert_eq;
use splscriber::loinc::{base_key, SECTION_KINDS};
use splscriber::{
    extract_sections, ImageRegistry, ImageType, ImageUrlBuilder, LoincMapper, RawLabelDocument,
    SectionSource,
};

fn full_label() -> LabelBuilder {
    LabelBuilder::new()
        .section(
            "34066-1",
            "WARNING: SERIOUS RISKS",
            "<list><item>Risk one.</item><item>Risk two.</item></list>",
        )
        .section("34067-9", "1 INDICATIONS AND USAGE", "<paragraph>Treats X.</paragraph>")
        .section_with(
            "34068-7",
            "2 DOSAGE AND ADMINISTRATION",
            r#"<paragraph>Inject once daily (see Figure 1).</paragraph><renderMultiMedia referencedObject="MM1"/><paragraph>Rotate sites as shown in Figure 2.</paragraph>"#,
            &media("MM1", "examplar-fig-01.jpg"),
        )
        .section_with(
            "43684-0",
            "8 USE IN SPECIFIC POPULATIONS",
            "",
            &nested("42228-7", "8.1 Pregnancy", "<paragraph>Avoid.</paragraph>"),
        )
        .section(
            "34069-5",
            "16 HOW SUPPLIED",
            r#"<table><thead><tr><th>NDC</th></tr></thead><tbody><tr><td>0001-0002-03</td></tr></tbody></table><renderMultiMedia referencedObject="MM404"/>"#,
        )
        .section_with(
            "51945-4",
            "PRINCIPAL DISPLAY PANEL",
            r#"<renderMultiMedia referencedObject="MM2"/>"#,
            &media("MM2", "examplar-carton.jpg"),
        )
}

#[test]
fn extraction_is_idempotent() {
    let xml = full_label().xml();
    let doc = RawLabelDocument::parse(&xml).unwrap();
    let registry = ImageRegistry::build(&doc, SET_ID, &[], &ImageUrlBuilder::default());

    let first = extract_sections(&doc, SET_ID, &registry).into_records();
    let second = extract_sections(&doc, SET_ID, &registry).into_records();
    assert_eq!(first, second);

    let again = full_label().parse();
    assert_eq!(full_label().parse(), again);
}

#[test]
fn no_media_markers_survive_rendering() {
    let details = full_label().parse();
    assert!(!details.sections.is_empty());
    for section in details.sections.values() {
        for marker in ["renderMultiMedia", "referencedObject", "observationMedia"] {
            assert!(
                !section.html.contains(marker),
                "{} still contains {marker}: {}",
                section.key,
                section.html
            );
        }
    }

    let dosage = &details.sections["dosage"].html;
    assert_eq!(image_sources(dosage).len(), 2, "declared figure plus synthesized Figure 2");
    assert!(dosage.contains("spl-figure-references"));

    let supplied = &details.sections["howSupplied"].html;
    assert!(supplied.contains("data-fallback=\"true\""));
}

#[test]
fn sections_follow_canonical_order() {
    let details = full_label().parse();
    let canonical: Vec<(&str, u32)> = SECTION_KINDS.iter().map(|kind| (kind.key, kind.order)).collect();

    let present: Vec<(usize, u32)> = details
        .sections
        .values()
        .filter_map(|record| {
            canonical
                .iter()
                .position(|(key, _)| *key == record.key)
                .map(|position| (position, record.order))
        })
        .collect();
    assert!(present.len() >= 5);

    for (a_pos, a_order) in &present {
        for (b_pos, b_order) in &present {
            if a_pos < b_pos {
                assert!(a_order < b_order, "kind #{a_pos} must sort before kind #{b_pos}");
            }
        }
    }

    let orders: Vec<u32> = details.sections.values().map(|record| record.order).collect();
    let mut sorted = orders.clone();
    sorted.sort_unstable();
    assert_eq!(orders, sorted);
}

#[test]
fn single_instance_sections_are_not_duplicated() {
    let details = LabelBuilder::new()
        .section("34067-9", "INDICATIONS", "<paragraph>First.</paragraph>")
        .section("34068-7", "DOSAGE", "<paragraph>Take one.</paragraph>")
        .section("34067-9", "INDICATIONS (REPEATED)", "<paragraph>Second.</paragraph>")
        .parse();

    let mapper = LoincMapper::global();
    for key in details.sections.keys() {
        if base_key(key) != key.as_str() {
            assert!(mapper.is_multi_instance(key), "{key} was suffixed");
        }
    }
    assert!(!details.sections.contains_key("indications2"));
    assert_eq!(details.sections["indications"].html, "<p>First.</p>");
    assert_eq!(details.sections.len(), 2);
}

#[test]
fn instructions_for_use_sections_are_suffixed() {
    let details = LabelBuilder::new()
        .section(
            "59845-8",
            "Instructions for Use: Examplar Pen",
            "<paragraph>Remove the pen cap.</paragraph>",
        )
        .section(
            "59845-8",
            "Instructions for Use: Examplar Vial",
            "<paragraph>Wipe the vial stopper.</paragraph>",
        )
        .section(
            "59845-8",
            "Instructions for Use: Examplar Prefilled Syringe",
            "<paragraph>Hold the syringe by the barrel.</paragraph>",
        )
        .parse();

    let keys: Vec<&str> = details.sections.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["instructionsForUse", "instructionsForUse2", "instructionsForUse3"]);

    let bodies: Vec<&str> = details.sections.values().map(|s| s.html.as_str()).collect();
    assert!(bodies.iter().all(|html| !html.is_empty()));
    assert_ne!(bodies[0], bodies[1]);
    assert_ne!(bodies[1], bodies[2]);
    assert_ne!(bodies[0], bodies[2]);

    let orders: Vec<u32> = details.sections.values().map(|s| s.order).collect();
    assert!(orders[0] < orders[1] && orders[1] < orders[2]);
}

#[test]
fn indications_under_an_unlisted_code_are_rescued() {
    let details = LabelBuilder::new()
        .section("42229-5", "Indications and Usage", "<paragraph>Treats X in adults.</paragraph>")
        .section("34068-7", "DOSAGE", "<paragraph>Take one.</paragraph>")
        .parse();

    let indications = &details.sections["indications"];
    assert_eq!(indications.source, SectionSource::CriticalRescue);
    assert_eq!(indications.title, "Indications and Usage");
    assert_eq!(indications.loinc_code.as_deref(), Some("42229-5"));
    assert!(!indications.html.is_empty());
    assert!(indications.order < details.sections["dosage"].order);

    let holders = details
        .sections
        .values()
        .filter(|section| section.html.contains("Treats X"))
        .count();
    assert_eq!(holders, 1, "the unmapped record was taken over");
}

#[test]
fn unmapped_heading_spelling_a_critical_key_keeps_its_place() {
    let details = LabelBuilder::new()
        .section("42229-5", "INDICATIONS", "<paragraph>Treats X.</paragraph>")
        .section("34068-7", "DOSAGE", "<paragraph>Take one.</paragraph>")
        .parse();

    let keys: Vec<&str> = details.sections.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["indications", "dosage"]);
    let indications = &details.sections["indications"];
    assert_eq!(indications.source, SectionSource::CriticalRescue);
    assert!(indications.order < details.sections["dosage"].order);
}

#[test]
fn rescued_subsection_is_shown_once() {
    let details = LabelBuilder::new()
        .section_with(
            "42229-5",
            "Preface",
            "<paragraph>Read first.</paragraph>",
            &nested("42229-5", "Indications and Usage", "<paragraph>Treats X.</paragraph>"),
        )
        .section("34068-7", "DOSAGE", "<paragraph>Take one.</paragraph>")
        .parse();

    assert_eq!(details.sections["indications"].source, SectionSource::CriticalRescue);
    assert!(details.sections["preface"].html.contains("Read first."));
    let holders = details
        .sections
        .values()
        .filter(|section| section.html.contains("Treats X"))
        .count();
    assert_eq!(holders, 1);
}

#[test]
fn figure_shown_in_another_section_is_not_repeated() {
    let details = LabelBuilder::new()
        .section("34068-7", "DOSAGE", "<paragraph>Inject as shown in Figure 1.</paragraph>")
        .section_with(
            "59845-8",
            "Instructions for Use",
            r#"<paragraph>Hold the pen.</paragraph><renderMultiMedia referencedObject="MM1"/>"#,
            &media("MM1", "examplar-fig-01.jpg"),
        )
        .parse();

    let dosage = &details.sections["dosage"].html;
    assert!(!dosage.contains("spl-figure-references"));
    assert!(image_sources(dosage).is_empty());

    let figure = details.images.iter().find(|image| image.id == "MM1").unwrap();
    assert_eq!(figure.used_in_sections, vec!["instructionsForUse".to_string()]);
}

#[test]
fn shared_media_resolves_to_one_url() {
    let details = LabelBuilder::new()
        .section_with(
            "34068-7",
            "DOSAGE",
            r#"<paragraph>Use the pen.</paragraph><renderMultiMedia referencedObject="MM1"/>"#,
            &media("MM1", "examplar-pen-device.jpg"),
        )
        .section(
            "34069-5",
            "HOW SUPPLIED",
            r#"<paragraph>Supplied as a pen.</paragraph><renderMultiMedia referencedObject="MM1"/>"#,
        )
        .parse();

    assert_eq!(details.images.len(), 1);
    let image = &details.images[0];
    assert_eq!(image.used_in_sections, vec!["dosage".to_string(), "howSupplied".to_string()]);

    let dosage = image_sources(&details.sections["dosage"].html);
    let supplied = image_sources(&details.sections["howSupplied"].html);
    assert_eq!(dosage.len(), 1);
    assert_eq!(dosage, supplied);
    assert_eq!(dosage[0], image.url.replace('&', "&amp;"));
}

#[test]
fn unmatched_image_names_default_to_package() {
    let details = LabelBuilder::new()
        .section_with(
            "34068-7",
            "DOSAGE",
            r#"<paragraph>See below.</paragraph><renderMultiMedia referencedObject="MM1"/>"#,
            &format!("{}{}", media("MM1", "mx4471.jpg"), media("MM2", "zq-7781.jpg")),
        )
        .parse();

    assert_eq!(details.images.len(), 2);
    assert!(details.images.iter().all(|image| image.image_type == ImageType::Package));

    let categorized = &details.categorized_images;
    assert_eq!(categorized.len(), details.images.len());
    assert_eq!(categorized.product_gallery.len(), 1);
    assert_eq!(categorized.product_gallery[0].name, "mx4471");
    assert_eq!(categorized.other.len(), 1);
    assert_eq!(categorized.other[0].name, "zq-7781");
}

#[test]
fn indications_end_to_end() {
    let details = LabelBuilder::new()
        .section("34068-7", "DOSAGE AND ADMINISTRATION", "<paragraph>Take one.</paragraph>")
        .section("34067-9", "INDICATIONS", "<paragraph>Treats X.</paragraph>")
        .parse();

    let indications = &details.sections["indications"];
    assert_eq!(indications.title, "INDICATIONS");
    assert_eq!(indications.html, "<p>Treats X.</p>");
    assert_eq!(indications.source, SectionSource::Primary);
    assert!(indications.order < details.sections["dosage"].order);
    assert_eq!(details.sections.get_index(0).map(|(key, _)| key.as_str()), Some("indications"));
}

#[test]
fn highlights_never_become_sections() {
    let details = LabelBuilder::new()
        .section_with(
            "48780-1",
            "HIGHLIGHTS OF PRESCRIBING INFORMATION",
            "<paragraph>These highlights do not include all the information.</paragraph>",
            &nested("34067-9", "INDICATIONS AND USAGE", "<paragraph>Summary only.</paragraph>"),
        )
        .section("34067-9", "1 INDICATIONS AND USAGE", "<paragraph>Treats X.</paragraph>")
        .parse();

    assert!(!details.sections.contains_key("highlights"));
    assert!(details
        .sections
        .values()
        .all(|section| section.loinc_code.as_deref() != Some("48780-1")));
    assert_eq!(details.sections["indications"].html, "<p>Treats X.</p>");
    assert_eq!(details.sections.len(), 1);
}

#[test]
fn merged_subsections_keep_their_code() {
    let details = full_label().parse();
    let populations = &details.sections["specificPopulations"];
    assert_eq!(populations.source, SectionSource::HtmlFallback);
    assert!(populations.html.contains("data-loinc=\"42228-7\""));
    assert!(populations.html.contains("<h4>8.1 Pregnancy</h4>"));
    assert!(!details.sections.contains_key("pregnancy"));
}

#[test]
fn label_images_and_instruction_figures_are_bucketed() {
    let details = full_label().parse();
    let categorized = &details.categorized_images;

    let labeling: Vec<&str> = categorized.patient_labeling.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(labeling, vec!["examplar-carton"]);

    let figure = details.images.iter().find(|i| i.id == "MM1").unwrap();
    assert_eq!(figure.image_type, ImageType::Instruction);
    assert_eq!(categorized.len(), details.images.len());
}
