//! Image classification for the gallery and Instructions for Use views.
//!
//! Rules are checked in a fixed order and the first match wins:
//!
//! 1. instruction tokens in the name (`ifu`, `fig`/`figure`, `step`, `injection`,
//!    `diagram`) or shown by an Instructions for Use section → [`ImageType::Instruction`]
//! 2. carton/label/panel/display tokens → [`ImageType::Label`]
//! 3. package/product tokens, dosage-form nouns, or the first two numbered images of a
//!    sequence (`-01`, `_2`) → [`ImageType::Package`]
//! 4. graph/chart/table/clinical tokens → [`ImageType::Clinical`]
//! 5. anything else → [`ImageType::Package`]
//!
//! Label precedes package, so `carton-01` is a label image.

use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::images::{ImageRecord, ImageType};
use crate::loinc::base_key;
use crate::sections::SectionRecord;
use crate::text::html_to_text;

const IFU_KEY: &str = "instructionsForUse";

/// Group for instruction images whose device cannot be told from anything.
pub const GENERAL_GROUP: &str = "general";

const INSTRUCTION_TOKENS: &[&str] = &["ifu", "fig", "figure", "step", "injection", "diagram"];
const LABEL_TOKENS: &[&str] = &["carton", "label", "panel", "display", "pdp"];
const PACKAGE_TOKENS: &[&str] = &["package", "packaging", "product", "pack", "container", "bottle", "blister"];
const DOSAGE_FORM_TOKENS: &[&str] = &[
    "tablet", "tablets", "capsule", "capsules", "pill", "caplet", "vial", "pen", "syringe",
    "inhaler", "cream", "ointment", "solution", "suspension", "injector", "autoinjector",
    "cartridge", "patch", "kit", "spray", "gel",
];
const CLINICAL_TOKENS: &[&str] = &["graph", "chart", "table", "clinical", "curve", "plot", "study"];

static LEADING_NUMBERED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[-_]0?[12]$").unwrap());

/// Dosage forms recognized in Instructions for Use titles and text, most specific first.
static DOSAGE_FORMS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("autoinjector", r"(?i)\bauto-?injectors?\b"),
        ("pen", r"(?i)\bpens?\b"),
        ("syringe", r"(?i)\bsyringes?\b"),
        ("vial", r"(?i)\bvials?\b"),
        ("inhaler", r"(?i)\binhalers?\b"),
        ("cartridge", r"(?i)\bcartridges?\b"),
        ("nasalSpray", r"(?i)\bnasal\s+spray\b"),
        ("kit", r"(?i)\bkits?\b"),
        ("patch", r"(?i)\bpatch(?:es)?\b"),
    ]
    .into_iter()
    .map(|(form, pattern)| (form, Regex::new(pattern).unwrap()))
    .collect()
});

/// Images partitioned for display.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorizedImages {
    pub product_gallery: Vec<ImageRecord>,
    /// Dosage form (or fallback section key) → figures, named forms first.
    pub instructions_for_use: IndexMap<String, Vec<ImageRecord>>,
    pub patient_labeling: Vec<ImageRecord>,
    pub clinical: Vec<ImageRecord>,
    /// Images that matched no rule and that no section displays.
    pub other: Vec<ImageRecord>,
}

impl CategorizedImages {
    pub fn len(&self) -> usize {
        self.product_gallery.len()
            + self.instructions_for_use.values().map(Vec::len).sum::<usize>()
            + self.patient_labeling.len()
            + self.clinical.len()
            + self.other.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of classifying one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub image_type: ImageType,
    /// No rule matched; the type is the default.
    pub defaulted: bool,
}

fn name_tokens(name: &str) -> Vec<String> {
    name.to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.trim_end_matches(|c: char| c.is_ascii_digit()).to_string())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Short words must be whole tokens; longer ones may appear inside a token
/// (`lantuscarton`).
fn has_token(tokens: &[String], words: &[&str]) -> bool {
    tokens.iter().any(|token| {
        words
            .iter()
            .any(|word| token == word || (word.len() >= 5 && token.contains(word)))
    })
}

fn shown_in_ifu(image: &ImageRecord) -> bool {
    image
        .used_in_sections
        .iter()
        .any(|key| base_key(key) == IFU_KEY)
}

/// Classify one image by name and the sections that display it.
pub fn classify_image(image: &ImageRecord) -> Classification {
    let tokens = name_tokens(&image.name);
    let found = |image_type| Classification {
        image_type,
        defaulted: false,
    };

    if has_token(&tokens, INSTRUCTION_TOKENS) || shown_in_ifu(image) {
        return found(ImageType::Instruction);
    }
    if has_token(&tokens, LABEL_TOKENS) {
        return found(ImageType::Label);
    }
    if has_token(&tokens, PACKAGE_TOKENS)
        || has_token(&tokens, DOSAGE_FORM_TOKENS)
        || LEADING_NUMBERED.is_match(&image.name)
    {
        return found(ImageType::Package);
    }
    if has_token(&tokens, CLINICAL_TOKENS) {
        return found(ImageType::Clinical);
    }
    Classification {
        image_type: ImageType::Package,
        defaulted: true,
    }
}

/// Dosage form named in a section's title or the first `scan_chars` characters of its text.
pub fn infer_dosage_form(section: &SectionRecord, scan_chars: usize) -> Option<&'static str> {
    let find = |text: &str| {
        DOSAGE_FORMS
            .iter()
            .find(|(_, pattern)| pattern.is_match(text))
            .map(|(form, _)| *form)
    };
    find(&section.title).or_else(|| {
        let text: String = html_to_text(&section.html).chars().take(scan_chars).collect();
        find(&text)
    })
}

/// Partition `images` into display buckets. Each image is classified and lands in
/// exactly one bucket with its `image_type` set.
pub fn categorize(
    images: &[ImageRecord],
    sections: &IndexMap<String, SectionRecord>,
    scan_chars: usize,
) -> CategorizedImages {
    let mut out = CategorizedImages::default();
    let mut named: IndexMap<String, Vec<ImageRecord>> = IndexMap::new();
    let mut fallback: IndexMap<String, Vec<ImageRecord>> = IndexMap::new();

    for image in images {
        let classification = classify_image(image);
        let mut record = image.clone();
        record.image_type = classification.image_type;

        match classification.image_type {
            ImageType::Instruction => {
                let owner = image
                    .used_in_sections
                    .iter()
                    .filter(|key| base_key(key) == IFU_KEY)
                    .find_map(|key| sections.get(key));
                match owner {
                    Some(section) => match infer_dosage_form(section, scan_chars) {
                        Some(form) => named.entry(form.to_string()).or_default().push(record),
                        None => fallback.entry(section.key.clone()).or_default().push(record),
                    },
                    None => fallback
                        .entry(GENERAL_GROUP.to_string())
                        .or_default()
                        .push(record),
                }
            }
            ImageType::Label => out.patient_labeling.push(record),
            ImageType::Clinical => out.clinical.push(record),
            ImageType::Package if classification.defaulted && image.used_in_sections.is_empty() => {
                out.other.push(record)
            }
            ImageType::Package => out.product_gallery.push(record),
        }
    }

    out.instructions_for_use = named.into_iter().chain(fallback).collect();
    out
}
