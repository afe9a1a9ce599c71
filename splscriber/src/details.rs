//! The aggregate result for one label and the pipeline that builds it.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use crate::categorize::{categorize, classify_image, CategorizedImages};
use crate::config::SplConfig;
use crate::document::RawLabelDocument;
use crate::error::SplResult;
use crate::images::{ImageRecord, ImageRegistry, MediaMetadata};
use crate::rescue::ensure_critical_sections;
use crate::sections::{extract_sections, SectionRecord};

/// One NDC package of the product.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NdcPackage {
    pub ndc: String,
    #[serde(default)]
    pub product_ndc: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RxNormMapping {
    pub rxcui: String,
    #[serde(default)]
    pub name: Option<String>,
    /// RxNorm term type, e.g. `SCD` or `SBD`.
    #[serde(default)]
    pub tty: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PharmacologicClass {
    pub name: String,
    /// `EPC`, `MoA`, `PE` or `CS`.
    #[serde(default)]
    pub class_type: Option<String>,
}

/// Data fetched alongside the label XML. Any part may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SupplementaryData {
    pub media: Vec<MediaMetadata>,
    pub packages: Vec<NdcPackage>,
    pub rx_norm_mappings: Vec<RxNormMapping>,
    pub pharmacologic_class: Vec<PharmacologicClass>,
}

/// Everything known about one label revision, ready for display.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MedicationDetails {
    pub set_id: String,
    pub title: Option<String>,
    pub brand_name: Option<String>,
    pub generic_name: Option<String>,
    pub labeler_name: Option<String>,
    pub effective_time: Option<String>,
    pub version: Option<String>,
    pub dosage_forms: Vec<String>,
    pub routes: Vec<String>,
    /// Sections in display order.
    pub sections: IndexMap<String, SectionRecord>,
    pub images: Vec<ImageRecord>,
    pub categorized_images: CategorizedImages,
    pub packages: Vec<NdcPackage>,
    pub rx_norm_mappings: Vec<RxNormMapping>,
    pub pharmacologic_class: Vec<PharmacologicClass>,
}

impl MedicationDetails {
    pub fn section(&self, key: &str) -> Option<&SectionRecord> {
        self.sections.get(key)
    }

    /// Name to show in lists: brand, then generic, then document title.
    pub fn display_name(&self) -> Option<&str> {
        self.brand_name
            .as_deref()
            .or(self.generic_name.as_deref())
            .or(self.title.as_deref())
    }
}

/// Parse one label into [`MedicationDetails`].
///
/// # Errors
///
/// Only when the XML cannot be parsed at all, or `config` names an unusable image host.
/// Unmapped sections, missing sections, unresolvable images and absent supplementary data
/// all produce a smaller result instead.
pub fn parse_label(
    xml: &str,
    set_id: &str,
    supplementary: &SupplementaryData,
    config: &SplConfig,
) -> SplResult<MedicationDetails> {
    let span = info_span!("parse_label", set_id);
    let _enter = span.enter();

    let urls = config.url_builder()?;
    let doc = RawLabelDocument::parse(xml)?;
    let metadata = doc.metadata();

    let set_id = match metadata.set_id.as_deref() {
        Some(declared) if declared != set_id => {
            if !set_id.is_empty() {
                warn!(requested = set_id, %declared, "document declares a different set id");
            }
            declared.to_string()
        }
        _ => set_id.to_string(),
    };

    let registry = ImageRegistry::build(&doc, &set_id, &supplementary.media, &urls);
    let mut sections = extract_sections(&doc, &set_id, &registry);
    ensure_critical_sections(&doc, &mut sections, &set_id, &registry);
    let sections = sections.into_records();

    let mut images = registry.into_records();
    link_images(&mut images, &sections);
    for image in &mut images {
        image.image_type = classify_image(image).image_type;
    }
    let categorized_images = categorize(&images, &sections, config.ifu_form_scan_chars);

    if supplementary.packages.is_empty() {
        debug!("no NDC package data");
    }
    if supplementary.rx_norm_mappings.is_empty() {
        debug!("no RxNorm mappings");
    }
    if supplementary.pharmacologic_class.is_empty() {
        debug!("no pharmacologic class data");
    }
    info!(sections = sections.len(), images = images.len(), "label parsed");

    Ok(MedicationDetails {
        set_id,
        title: metadata.title,
        brand_name: metadata.brand_name,
        generic_name: metadata.generic_name,
        labeler_name: metadata.labeler_name,
        effective_time: metadata.effective_time,
        version: metadata.version,
        dosage_forms: metadata.dosage_forms,
        routes: metadata.routes,
        sections,
        images,
        categorized_images,
        packages: supplementary.packages.clone(),
        rx_norm_mappings: supplementary.rx_norm_mappings.clone(),
        pharmacologic_class: supplementary.pharmacologic_class.clone(),
    })
}

/// Fill each image's `used_in_sections` from the sections that display it, in section order.
fn link_images(images: &mut [ImageRecord], sections: &IndexMap<String, SectionRecord>) {
    let positions: HashMap<String, usize> = images
        .iter()
        .enumerate()
        .map(|(i, image)| (image.id.clone(), i))
        .collect();
    for section in sections.values() {
        for id in &section.image_refs {
            if let Some(&i) = positions.get(id) {
                let used = &mut images[i].used_in_sections;
                if !used.contains(&section.key) {
                    used.push(section.key.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SplError;
    use crate::images::ImageType;

    const XML: &str = r#"<document xmlns="urn:hl7-org:v3">
  <setId root="set-abc"/>
  <versionNumber value="7"/>
  <title>EXAMPLAR (examplar) injection</title>
  <component><structuredBody>
    <component><section><code code="34067-9"/><title>1 INDICATIONS</title>
      <text><paragraph>Treats X.</paragraph></text></section></component>
    <component><section><code code="59845-8"/><title>Instructions for Use: Examplar Pen</title>
      <text><renderMultiMedia referencedObject="MM1"/></text>
      <component><observationMedia ID="MM1"><value><reference value="examplar-02.jpg"/></value></observationMedia></component>
    </section></component>
  </structuredBody></component>
</document>"#;

    #[test]
    fn builds_details_without_supplementary_data() {
        let details = parse_label(XML, "set-abc", &SupplementaryData::default(), &SplConfig::default()).unwrap();
        assert_eq!(details.set_id, "set-abc");
        assert_eq!(details.version.as_deref(), Some("7"));
        assert_eq!(details.sections.keys().collect::<Vec<_>>(), vec!["indications", "instructionsForUse"]);
        assert!(details.packages.is_empty());

        let image = &details.images[0];
        assert_eq!(image.used_in_sections, vec!["instructionsForUse".to_string()]);
        assert_eq!(image.image_type, ImageType::Instruction);
        assert_eq!(details.categorized_images.instructions_for_use["pen"].len(), 1);
    }

    #[test]
    fn document_set_id_wins() {
        let details = parse_label(XML, "", &SupplementaryData::default(), &SplConfig::default()).unwrap();
        assert_eq!(details.set_id, "set-abc");
        assert!(details.images[0].url.ends_with("setid=set-abc"));
    }

    #[test]
    fn supplementary_data_is_attached() {
        let supplementary = SupplementaryData {
            packages: vec![NdcPackage {
                ndc: "0000-0000-01".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let details = parse_label(XML, "set-abc", &supplementary, &SplConfig::default()).unwrap();
        assert_eq!(details.packages[0].ndc, "0000-0000-01");
    }

    #[test]
    fn unparseable_xml_is_the_only_failure() {
        let err = parse_label("<document><section>", "x", &SupplementaryData::default(), &SplConfig::default())
            .unwrap_err();
        assert!(matches!(err, SplError::MalformedDocument(_)));
    }

    #[test]
    fn details_round_trip_through_json() {
        let details = parse_label(XML, "set-abc", &SupplementaryData::default(), &SplConfig::default()).unwrap();
        let json = serde_json::to_string(&details).unwrap();
        assert!(json.contains("\"categorizedImages\""));
        assert!(json.contains("\"usedInSections\""));
        let back: MedicationDetails = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sections["indications"].html, "<p>Treats X.</p>");
    }
}
