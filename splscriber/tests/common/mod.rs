//! Label fixtures shared by the integration tests.
#![allow(dead_code)]

use splscriber::{parse_label, MedicationDetails, SplConfig, SupplementaryData};

pub const SET_ID: &str = "0f1e2d3c-0000-4000-8000-000000000001";

/// Builds SPL documents one top-level section at a time.
#[derive(Default)]
pub struct LabelBuilder {
    sections: Vec<String>,
}

impl LabelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A top-level section whose `<text>` holds `body`.
    pub fn section(self, code: &str, title: &str, body: &str) -> Self {
        self.section_with(code, title, body, "")
    }

    /// A top-level section followed by extra markup (nested components, media declarations).
    pub fn section_with(mut self, code: &str, title: &str, body: &str, nested: &str) -> Self {
        self.sections.push(format!(
            r#"<component><section><code code="{code}" codeSystem="2.16.840.1.113883.6.1"/><title>{title}</title><text>{body}</text>{nested}</section></component>"#
        ));
        self
    }

    pub fn xml(&self) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<document xmlns="urn:hl7-org:v3">
  <setId root="{SET_ID}"/>
  <versionNumber value="3"/>
  <title>EXAMPLAR (examplarin) injection</title>
  <component><structuredBody>{}</structuredBody></component>
</document>"#,
            self.sections.concat()
        )
    }

    pub fn parse(&self) -> MedicationDetails {
        parse_label(&self.xml(), SET_ID, &SupplementaryData::default(), &SplConfig::default())
            .expect("fixture label parses")
    }
}

/// A nested section, for use inside [`LabelBuilder::section_with`].
pub fn nested(code: &str, title: &str, body: &str) -> String {
    format!(
        r#"<component><section><code code="{code}"/><title>{title}</title><text>{body}</text></section></component>"#
    )
}

/// A media declaration, for use inside [`LabelBuilder::section_with`].
pub fn media(id: &str, file: &str) -> String {
    format!(
        r#"<component><observationMedia ID="{id}"><text>{id} caption</text><value mediaType="image/jpeg"><reference value="{file}"/></value></observationMedia></component>"#
    )
}

/// Every `src` attribute value in `html`, in order.
pub fn image_sources(html: &str) -> Vec<&str> {
    html.split("<img src=\"")
        .skip(1)
        .filter_map(|rest| rest.split('"').next())
        .collect()
}
