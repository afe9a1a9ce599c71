//! LOINC section code mapping.
//!
//! SPL classifies each section with a LOINC code. The mapper turns those codes into the
//! semantic keys the rest of the pipeline works with (`indications`, `dosage`, ...) plus a
//! display title and a canonical ordering number.
//!
//! The table is declared as two flat lists: one row per section kind, one row per code.
//! Synonymous codes from different SPL schema versions simply list the same key; the
//! builder rejects a code that is claimed by two different keys instead of letting the
//! last row win.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{SplError, SplResult};
use crate::text::camel_case_key;

/// One logical section kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionKind {
    pub key: &'static str,
    pub title: &'static str,
    /// Canonical rank among kinds. A record's sort order is [`SectionKind::instance_order`].
    pub order: u32,
    /// Kind this one is merged into when it has no emitted ancestor section.
    pub parent: Option<&'static str>,
    /// Several instances may coexist, disambiguated with numeric key suffixes.
    pub multi_instance: bool,
}

/// Room reserved after each kind rank for its suffixed instances.
pub const INSTANCE_STRIDE: u32 = 1000;

impl SectionKind {
    /// Sort order of the `instance`-th record of this kind (1 for the unsuffixed key).
    /// Every instance sorts after the previous one and before the next kind.
    pub fn instance_order(&self, instance: u32) -> u32 {
        self.order * INSTANCE_STRIDE + instance.saturating_sub(1).min(INSTANCE_STRIDE - 1)
    }
}

const fn kind(key: &'static str, title: &'static str, order: u32) -> SectionKind {
    SectionKind {
        key,
        title,
        order,
        parent: None,
        multi_instance: false,
    }
}

const fn child(
    key: &'static str,
    title: &'static str,
    order: u32,
    parent: &'static str,
) -> SectionKind {
    SectionKind {
        key,
        title,
        order,
        parent: Some(parent),
        multi_instance: false,
    }
}

const fn multi(key: &'static str, title: &'static str, order: u32) -> SectionKind {
    SectionKind {
        key,
        title,
        order,
        parent: None,
        multi_instance: true,
    }
}

pub static SECTION_KINDS: &[SectionKind] = &[
    kind("boxedWarning", "Boxed Warning", 10),
    kind("recentMajorChanges", "Recent Major Changes", 20),
    kind("indications", "Indications and Usage", 30),
    kind("dosage", "Dosage and Administration", 40),
    kind("dosageForms", "Dosage Forms and Strengths", 50),
    kind("contraindications", "Contraindications", 60),
    kind("warningsAndPrecautions", "Warnings and Precautions", 70),
    kind("warnings", "Warnings", 80),
    kind("precautions", "Precautions", 90),
    kind("adverseReactions", "Adverse Reactions", 100),
    kind("drugInteractions", "Drug Interactions", 110),
    child("drugLabInteractions", "Drug/Laboratory Test Interactions", 111, "drugInteractions"),
    kind("specificPopulations", "Use in Specific Populations", 120),
    child("pregnancy", "Pregnancy", 121, "specificPopulations"),
    child("lactation", "Lactation", 122, "specificPopulations"),
    child(
        "reproductivePotential",
        "Females and Males of Reproductive Potential",
        123,
        "specificPopulations",
    ),
    child("pediatricUse", "Pediatric Use", 124, "specificPopulations"),
    child("geriatricUse", "Geriatric Use", 125, "specificPopulations"),
    kind("drugAbuse", "Drug Abuse and Dependence", 130),
    child("controlledSubstance", "Controlled Substance", 131, "drugAbuse"),
    child("abuse", "Abuse", 132, "drugAbuse"),
    child("dependence", "Dependence", 133, "drugAbuse"),
    kind("overdosage", "Overdosage", 140),
    kind("description", "Description", 150),
    kind("clinicalPharmacology", "Clinical Pharmacology", 160),
    child("mechanismOfAction", "Mechanism of Action", 161, "clinicalPharmacology"),
    child("pharmacodynamics", "Pharmacodynamics", 162, "clinicalPharmacology"),
    child("pharmacokinetics", "Pharmacokinetics", 163, "clinicalPharmacology"),
    kind("nonclinicalToxicology", "Nonclinical Toxicology", 170),
    child(
        "carcinogenesis",
        "Carcinogenesis, Mutagenesis, Impairment of Fertility",
        171,
        "nonclinicalToxicology",
    ),
    child(
        "animalPharmacology",
        "Animal Toxicology and/or Pharmacology",
        172,
        "nonclinicalToxicology",
    ),
    kind("clinicalStudies", "Clinical Studies", 180),
    kind("references", "References", 190),
    kind("howSupplied", "How Supplied", 200),
    kind("storage", "Storage and Handling", 210),
    kind("patientCounseling", "Patient Counseling Information", 220),
    kind("medicationGuide", "Medication Guide", 230),
    kind("patientInfo", "Patient Information", 240),
    multi("instructionsForUse", "Instructions for Use", 250),
    multi("principalDisplayPanel", "Package Label - Principal Display Panel", 260),
    kind("activeIngredient", "Active Ingredient", 270),
    kind("purpose", "Purpose", 280),
    kind("inactiveIngredients", "Inactive Ingredients", 290),
    kind("keepOutOfReach", "Keep Out of Reach of Children", 300),
    kind("doNotUse", "Do Not Use", 310),
    kind("askDoctor", "Ask a Doctor", 320),
    kind("whenUsing", "When Using This Product", 330),
    kind("stopUse", "Stop Use", 340),
    kind("questions", "Questions", 350),
    kind("otherSafetyInformation", "Other Safety Information", 360),
];

/// LOINC code → section key. Aliases repeat a key.
pub static LOINC_CODES: &[(&str, &str)] = &[
    ("34066-1", "boxedWarning"),
    ("43683-2", "recentMajorChanges"),
    ("34067-9", "indications"),
    ("34068-7", "dosage"),
    ("43678-2", "dosageForms"),
    ("34070-3", "contraindications"),
    ("43685-7", "warningsAndPrecautions"),
    ("34071-1", "warnings"),
    ("42232-9", "precautions"),
    ("34084-4", "adverseReactions"),
    ("34073-7", "drugInteractions"),
    ("34074-5", "drugLabInteractions"),
    ("43684-0", "specificPopulations"),
    ("42228-7", "pregnancy"),
    ("77290-5", "lactation"),
    // Nursing Mothers, the pre-PLLR name of the lactation subsection
    ("34080-2", "lactation"),
    ("77291-3", "reproductivePotential"),
    ("34081-0", "pediatricUse"),
    ("34082-8", "geriatricUse"),
    ("42227-9", "drugAbuse"),
    ("34085-1", "controlledSubstance"),
    ("34086-9", "abuse"),
    ("34087-7", "dependence"),
    ("34088-5", "overdosage"),
    ("34089-3", "description"),
    ("34090-1", "clinicalPharmacology"),
    ("43679-0", "mechanismOfAction"),
    ("43681-6", "pharmacodynamics"),
    ("43682-4", "pharmacokinetics"),
    ("43680-8", "nonclinicalToxicology"),
    ("34083-6", "carcinogenesis"),
    ("34091-9", "animalPharmacology"),
    ("34092-7", "clinicalStudies"),
    ("34093-5", "references"),
    ("34069-5", "howSupplied"),
    ("44425-7", "storage"),
    // Information for Patients (older labels) and Patient Counseling Information
    ("34076-0", "patientCounseling"),
    ("88436-1", "patientCounseling"),
    ("42231-1", "medicationGuide"),
    ("42230-3", "patientInfo"),
    ("59845-8", "instructionsForUse"),
    ("51945-4", "principalDisplayPanel"),
    ("55106-9", "activeIngredient"),
    ("55105-1", "purpose"),
    ("51727-6", "inactiveIngredients"),
    ("50565-1", "keepOutOfReach"),
    ("50570-1", "doNotUse"),
    ("50569-3", "askDoctor"),
    ("50568-5", "askDoctor"),
    ("50567-7", "whenUsing"),
    ("50566-9", "stopUse"),
    ("53413-1", "questions"),
    ("60561-8", "otherSafetyInformation"),
];

/// Codes for summary and navigation sections that never become records.
pub static SKIPPED_CODES: &[(&str, &str)] = &[("48780-1", "highlights")];

static SKIPPED_TITLE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(table of contents|contents|full prescribing information\s*:?\s*contents|highlights of prescribing information)\b",
    )
    .unwrap()
});

static GENERIC_DISPLAY_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bunclassified\b").unwrap());

static LEADING_NUMBERING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[\d.]+\s*").unwrap());

/// Result of looking up a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionMapping {
    pub section_key: &'static str,
    pub title: &'static str,
    pub priority: u32,
}

impl From<&SectionKind> for SectionMapping {
    fn from(kind: &SectionKind) -> Self {
        Self {
            section_key: kind.key,
            title: kind.title,
            priority: kind.order,
        }
    }
}

/// Validated code → section lookup.
#[derive(Debug)]
pub struct LoincMapper {
    kinds: HashMap<&'static str, &'static SectionKind>,
    codes: HashMap<&'static str, &'static SectionKind>,
    skipped: HashMap<&'static str, &'static str>,
}

static GLOBAL_MAPPER: LazyLock<LoincMapper> = LazyLock::new(|| {
    LoincMapper::from_tables(SECTION_KINDS, LOINC_CODES, SKIPPED_CODES)
        .expect("built-in LOINC table is inconsistent")
});

impl LoincMapper {
    /// The mapper over the built-in tables, validated on first use.
    pub fn global() -> &'static LoincMapper {
        &GLOBAL_MAPPER
    }

    /// Build and validate a mapper.
    ///
    /// # Errors
    ///
    /// [`SplError::ConflictingLoincCode`] when one code is claimed by two different keys
    /// (or by a key and the skip list), [`SplError::InvalidConfig`] when a row refers to a
    /// section key or parent that is not declared.
    pub fn from_tables(
        kinds: &'static [SectionKind],
        codes: &'static [(&'static str, &'static str)],
        skipped: &'static [(&'static str, &'static str)],
    ) -> SplResult<Self> {
        let mut by_key: HashMap<&'static str, &'static SectionKind> = HashMap::new();
        for kind in kinds {
            if by_key.insert(kind.key, kind).is_some() {
                return Err(SplError::InvalidConfig(format!(
                    "section key `{}` is declared twice",
                    kind.key
                )));
            }
        }
        for kind in kinds {
            if let Some(parent) = kind.parent {
                if !by_key.contains_key(parent) {
                    return Err(SplError::InvalidConfig(format!(
                        "section `{}` names unknown parent `{parent}`",
                        kind.key
                    )));
                }
            }
        }

        let mut by_code: HashMap<&'static str, &'static SectionKind> = HashMap::new();
        for &(code, key) in codes {
            let kind = by_key.get(key).copied().ok_or_else(|| {
                SplError::InvalidConfig(format!("LOINC code {code} maps to unknown key `{key}`"))
            })?;
            if let Some(existing) = by_code.get(code) {
                if existing.key != key {
                    return Err(SplError::ConflictingLoincCode {
                        code: code.to_string(),
                        first: existing.key.to_string(),
                        second: key.to_string(),
                    });
                }
                continue;
            }
            by_code.insert(code, kind);
        }

        let mut skip = HashMap::new();
        for &(code, label) in skipped {
            if let Some(existing) = by_code.get(code) {
                return Err(SplError::ConflictingLoincCode {
                    code: code.to_string(),
                    first: existing.key.to_string(),
                    second: label.to_string(),
                });
            }
            skip.insert(code, label);
        }

        Ok(Self {
            kinds: by_key,
            codes: by_code,
            skipped: skip,
        })
    }

    /// Look up a section code. Skipped and unknown codes return `None`.
    pub fn map_code(&self, code: &str) -> Option<SectionMapping> {
        self.codes.get(code.trim()).map(|kind| SectionMapping::from(*kind))
    }

    pub fn kind_for_code(&self, code: &str) -> Option<&'static SectionKind> {
        self.codes.get(code.trim()).copied()
    }

    pub fn kind(&self, key: &str) -> Option<&'static SectionKind> {
        self.kinds.get(key).copied()
    }

    /// Every code that maps to `key`, sorted for stable iteration.
    pub fn codes_for(&self, key: &str) -> Vec<&'static str> {
        let mut codes: Vec<&'static str> = self
            .codes
            .iter()
            .filter(|(_, kind)| kind.key == key)
            .map(|(code, _)| *code)
            .collect();
        codes.sort_unstable();
        codes
    }

    /// Whether a section is a summary/navigation section that must not become a record.
    pub fn is_skipped(&self, code: Option<&str>, title: Option<&str>) -> bool {
        if let Some(code) = code {
            if self.skipped.contains_key(code.trim()) {
                return true;
            }
        }
        title.is_some_and(|title| SKIPPED_TITLE_PATTERN.is_match(title))
    }

    /// Whether `key` (possibly suffixed, e.g. `instructionsForUse2`) belongs to a
    /// multi-instance kind.
    pub fn is_multi_instance(&self, key: &str) -> bool {
        self.kind(base_key(key)).is_some_and(|kind| kind.multi_instance)
    }
}

/// Strip a numeric instance suffix: `instructionsForUse3` → `instructionsForUse`.
pub fn base_key(key: &str) -> &str {
    key.trim_end_matches(|c: char| c.is_ascii_digit())
}

/// Key for a section whose code is unknown: camelCase of the display name, or of the
/// title (numbering removed) when the display name is missing or the generic
/// "unclassified" label.
pub fn derive_key(display_name: Option<&str>, title: Option<&str>) -> String {
    if let Some(name) = display_name {
        if !name.trim().is_empty() && !GENERIC_DISPLAY_NAME.is_match(name) {
            return camel_case_key(name);
        }
    }
    if let Some(title) = title {
        let stripped = LEADING_NUMBERING.replace(title, "");
        if !stripped.trim().is_empty() {
            return camel_case_key(&stripped);
        }
    }
    "unclassifiedSection".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_table_is_consistent() {
        LoincMapper::from_tables(SECTION_KINDS, LOINC_CODES, SKIPPED_CODES).unwrap();
    }

    #[test]
    fn instances_stay_between_neighbouring_kinds() {
        let mapper = LoincMapper::global();
        let panels = mapper.kind("principalDisplayPanel").unwrap();
        let next = SECTION_KINDS
            .iter()
            .filter(|kind| kind.order > panels.order)
            .map(|kind| kind.instance_order(1))
            .min()
            .unwrap();
        let orders: Vec<u32> = (1..=12).map(|n| panels.instance_order(n)).collect();
        assert!(orders.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(orders.iter().all(|order| *order < next));
        assert!(panels.instance_order(5000) < next);
    }

    #[test]
    fn maps_known_codes() {
        let mapper = LoincMapper::global();
        let mapping = mapper.map_code("34067-9").unwrap();
        assert_eq!(mapping.section_key, "indications");
        assert_eq!(mapping.title, "Indications and Usage");
        assert!(mapping.priority < mapper.map_code("34068-7").unwrap().priority);
        assert_eq!(mapper.map_code(" 34068-7 ").unwrap().section_key, "dosage");
    }

    #[test]
    fn aliases_resolve_to_the_same_kind() {
        let mapper = LoincMapper::global();
        assert_eq!(mapper.map_code("34080-2"), mapper.map_code("77290-5"));
        assert_eq!(mapper.codes_for("patientCounseling"), vec!["34076-0", "88436-1"]);
    }

    #[test]
    fn highlights_and_unknown_codes_do_not_map() {
        let mapper = LoincMapper::global();
        assert!(mapper.map_code("48780-1").is_none());
        assert!(mapper.is_skipped(Some("48780-1"), None));
        assert!(mapper.map_code("99999-9").is_none());
        assert!(!mapper.is_skipped(Some("99999-9"), Some("Warnings")));
    }

    #[test]
    fn table_of_contents_titles_are_skipped() {
        let mapper = LoincMapper::global();
        assert!(mapper.is_skipped(None, Some("FULL PRESCRIBING INFORMATION: CONTENTS")));
        assert!(mapper.is_skipped(None, Some("Table of Contents")));
        assert!(!mapper.is_skipped(None, Some("Contraindications")));
    }

    #[test]
    fn conflicting_codes_fail_at_load_time() {
        static CODES: &[(&str, &str)] = &[("34067-9", "indications"), ("34067-9", "dosage")];
        let err = LoincMapper::from_tables(SECTION_KINDS, CODES, &[]).unwrap_err();
        assert!(matches!(err, SplError::ConflictingLoincCode { .. }));
    }

    #[test]
    fn repeated_alias_rows_are_allowed() {
        static CODES: &[(&str, &str)] = &[("34067-9", "indications"), ("34067-9", "indications")];
        LoincMapper::from_tables(SECTION_KINDS, CODES, &[]).unwrap();
    }

    #[test]
    fn skipped_code_cannot_also_map() {
        static SKIP: &[(&str, &str)] = &[("34067-9", "highlights")];
        let err = LoincMapper::from_tables(SECTION_KINDS, LOINC_CODES, SKIP).unwrap_err();
        assert!(matches!(err, SplError::ConflictingLoincCode { .. }));
    }

    #[test]
    fn multi_instance_keys_accept_suffixes() {
        let mapper = LoincMapper::global();
        assert!(mapper.is_multi_instance("instructionsForUse"));
        assert!(mapper.is_multi_instance("instructionsForUse3"));
        assert!(!mapper.is_multi_instance("indications"));
        assert_eq!(base_key("principalDisplayPanel12"), "principalDisplayPanel");
    }

    #[test]
    fn derives_keys_for_unknown_codes() {
        assert_eq!(derive_key(Some("HOW TO TAKE SECTION"), None), "howToTakeSection");
        assert_eq!(
            derive_key(Some("SPL UNCLASSIFIED SECTION"), Some("5.1 Hypoglycemia")),
            "hypoglycemia"
        );
        assert_eq!(derive_key(None, None), "unclassifiedSection");
    }
}
