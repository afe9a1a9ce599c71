//! Flattening of [`MedicationDetails`] into the saved-medication record.

use serde::{Deserialize, Serialize};

use crate::details::MedicationDetails;
use crate::text::html_to_text;

/// A medication as stored in a user's list: plain-text excerpts of the clinically
/// relevant sections plus identifying fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SavedMedication {
    pub brand_name: String,
    pub generic_name: String,
    pub labeler_name: String,
    pub set_id: String,
    pub dosage_forms: Vec<String>,
    pub routes: Vec<String>,
    pub indications: String,
    pub dosage_instructions: String,
    pub warnings: String,
    pub contraindications: String,
    pub adverse_reactions: String,
    pub drug_interactions: String,
    pub storage: String,
    pub ndc_codes: Vec<String>,
    pub pharmacologic_class: Vec<String>,
}

impl SavedMedication {
    pub fn from_details(details: &MedicationDetails) -> Self {
        let text = |keys: &[&str]| {
            keys.iter()
                .filter_map(|key| details.section(key))
                .map(|section| html_to_text(&section.html))
                .find(|text| !text.is_empty())
                .unwrap_or_default()
        };

        let mut ndc_codes: Vec<String> = Vec::new();
        for package in &details.packages {
            let ndc = package.ndc.trim();
            if !ndc.is_empty() && !ndc_codes.iter().any(|c| c == ndc) {
                ndc_codes.push(ndc.to_string());
            }
        }

        Self {
            brand_name: details.brand_name.clone().unwrap_or_default(),
            generic_name: details.generic_name.clone().unwrap_or_default(),
            labeler_name: details.labeler_name.clone().unwrap_or_default(),
            set_id: details.set_id.clone(),
            dosage_forms: details.dosage_forms.clone(),
            routes: details.routes.clone(),
            indications: text(&["indications"]),
            dosage_instructions: text(&["dosage"]),
            warnings: text(&["warningsAndPrecautions", "warnings", "boxedWarning"]),
            contraindications: text(&["contraindications"]),
            adverse_reactions: text(&["adverseReactions"]),
            drug_interactions: text(&["drugInteractions"]),
            storage: text(&["storage", "howSupplied"]),
            ndc_codes,
            pharmacologic_class: details
                .pharmacologic_class
                .iter()
                .map(|class| class.name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect(),
        }
    }
}
