//! # Splscraper
//!
//! Flattens parsed label details (the `<setId>.json` files written by `splscriber`) into
//! saved-medication records and writes them as one deduplicated CSV.
//!
//! ## Pipeline Overview
//!
//! 1. **Data Loading**: read `MedicationDetails` JSON files (or every `*.json` in a directory)
//! 2. **Parallel Processing**: flatten sections to plain text and clean brand/generic names
//!    using all available CPU cores
//! 3. **Deduplication**: keep the first record of each (generic name, brand name) pair
//! 4. **Output Generation**: write the cleaned records to CSV
//!
//! ## Name Cleaning
//!
//! - **Unicode Normalization**: Latin-1 and extended Latin characters to ASCII
//! - **Symbol Removal**: trademark, registered and copyright signs
//! - **Parenthetical Removal**: dosage forms and routes in generic names, e.g. `(oral)`
//!
//! ## Usage
//!
//! ```bash
//! splscraper --out saved_medications.csv details/
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use clap::Parser;
use csv::Writer;
use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;
use splscriber::text::normalize_to_ascii;
use splscriber::{MedicationDetails, SavedMedication};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static PARENTHESES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*\([^)]*\)").unwrap());
static BRACKETS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*\[[^\]]*\]").unwrap());

#[derive(Parser, Debug)]
#[command(name = "splscraper")]
#[command(about = "Flatten parsed label details into a saved-medication CSV")]
#[command(version)]
struct Cli {
    /// Output CSV path
    #[arg(short, long, default_value = "saved_medications.csv")]
    out: PathBuf,

    /// Details JSON files, or directories of them
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

/// One CSV row. List fields are joined with `"; "`.
#[derive(Debug, Serialize)]
struct OutputRecord {
    #[serde(rename = "Set ID")]
    set_id: String,
    #[serde(rename = "Brand Name")]
    brand_name: String,
    #[serde(rename = "Generic Name")]
    generic_name: String,
    #[serde(rename = "Labeler")]
    labeler_name: String,
    #[serde(rename = "Dosage Forms")]
    dosage_forms: String,
    #[serde(rename = "Routes")]
    routes: String,
    #[serde(rename = "Indications")]
    indications: String,
    #[serde(rename = "Dosage Instructions")]
    dosage_instructions: String,
    #[serde(rename = "Warnings")]
    warnings: String,
    #[serde(rename = "Contraindications")]
    contraindications: String,
    #[serde(rename = "Adverse Reactions")]
    adverse_reactions: String,
    #[serde(rename = "Drug Interactions")]
    drug_interactions: String,
    #[serde(rename = "Storage")]
    storage: String,
    #[serde(rename = "NDC Codes")]
    ndc_codes: String,
    #[serde(rename = "Pharmacologic Class")]
    pharmacologic_class: String,
}

impl From<SavedMedication> for OutputRecord {
    fn from(saved: SavedMedication) -> Self {
        Self {
            set_id: saved.set_id,
            brand_name: clean_brand_name(&saved.brand_name),
            generic_name: clean_generic_name(&saved.generic_name),
            labeler_name: clean_brand_name(&saved.labeler_name),
            dosage_forms: saved.dosage_forms.join("; "),
            routes: saved.routes.join("; "),
            indications: saved.indications,
            dosage_instructions: saved.dosage_instructions,
            warnings: saved.warnings,
            contraindications: saved.contraindications,
            adverse_reactions: saved.adverse_reactions,
            drug_interactions: saved.drug_interactions,
            storage: saved.storage,
            ndc_codes: saved.ndc_codes.join("; "),
            pharmacologic_class: saved.pharmacologic_class.join("; "),
        }
    }
}

/// Drop trademark-style symbols, transliterate to ASCII and keep only the characters that
/// occur in drug names.
///
/// ```text
/// "Montélukast®" -> "Montelukast"
/// ```
fn remove_special_chars(text: &str) -> String {
    let stripped: String = text
        .chars()
        .filter(|c| !matches!(c, '®' | '™' | '©' | '℠'))
        .collect();
    normalize_to_ascii(&stripped)
        .chars()
        .filter(|c| {
            c.is_ascii_alphanumeric() || c.is_ascii_whitespace() || matches!(c, '-' | '/' | ',' | '.')
        })
        .collect()
}

/// Generic names carry dosage forms and routes in parentheses or brackets
/// (`"Insulin Glargine (injection)"`); combinations are spaced around the slash.
fn clean_generic_name(name: &str) -> String {
    let name = PARENTHESES.replace_all(name.trim(), "");
    let name = BRACKETS.replace_all(&name, "");
    let name = name.replace('/', " / ");
    let name = remove_special_chars(&name);
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn clean_brand_name(name: &str) -> String {
    let name = remove_special_chars(name.trim());
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Expand directories into the `*.json` files they contain, sorted.
fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut found = Vec::new();
            for entry in fs::read_dir(input).with_context(|| format!("reading {}", input.display()))? {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    found.push(path);
                }
            }
            found.sort();
            files.extend(found);
        } else {
            files.push(input.clone());
        }
    }
    Ok(files)
}

fn load_details(path: &Path) -> Result<MedicationDetails> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// Keep the first record of each (generic, brand) pair, compared case-insensitively.
fn dedup(records: Vec<OutputRecord>) -> (Vec<OutputRecord>, usize) {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    let mut duplicates = 0;
    for record in records {
        let key = (
            record.generic_name.to_lowercase(),
            record.brand_name.to_lowercase(),
        );
        if seen.insert(key) {
            unique.push(record);
        } else {
            duplicates += 1;
        }
    }
    (unique, duplicates)
}

fn write_csv(path: &Path, records: &[OutputRecord]) -> Result<()> {
    let mut writer = Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("splscraper=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let files = collect_inputs(&cli.inputs)?;
    if files.is_empty() {
        bail!("no details files found");
    }
    let total = files.len();
    info!(files = total, threads = rayon::current_num_threads(), "processing details");

    let counter = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);

    let records: Vec<OutputRecord> = files
        .par_iter()
        .filter_map(|path| {
            let count = counter.fetch_add(1, Ordering::Relaxed) + 1;
            if count % 1000 == 0 {
                info!("processed {count} / {total} files");
            }
            match load_details(path) {
                Ok(details) => Some(OutputRecord::from(SavedMedication::from_details(&details))),
                Err(e) => {
                    warn!("{e:#}");
                    failed.fetch_add(1, Ordering::Relaxed);
                    None
                }
            }
        })
        .collect();

    let (unique, duplicates) = dedup(records);
    write_csv(&cli.out, &unique)?;

    info!(
        total,
        failed = failed.load(Ordering::Relaxed),
        duplicates,
        written = unique.len(),
        out = %cli.out.display(),
        "processing complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_names_lose_parentheticals_and_symbols() {
        assert_eq!(clean_generic_name("Acetaminophen (oral)"), "Acetaminophen");
        assert_eq!(clean_generic_name("Amoxicillin/Clavulanate [obsolete]"), "Amoxicillin / Clavulanate");
        assert_eq!(clean_generic_name("  Montélukast®  sodium "), "Montelukast sodium");
    }

    #[test]
    fn brand_names_keep_their_words() {
        assert_eq!(clean_brand_name("Advil®"), "Advil");
        assert_eq!(clean_brand_name("Examplar™ SoloStar"), "Examplar SoloStar");
    }

    #[test]
    fn dedup_is_case_insensitive() {
        let record = |brand: &str| OutputRecord::from(SavedMedication {
            brand_name: brand.to_string(),
            generic_name: "examplarin".to_string(),
            ..Default::default()
        });
        let (unique, duplicates) = dedup(vec![record("Examplar"), record("EXAMPLAR"), record("Other")]);
        assert_eq!(unique.len(), 2);
        assert_eq!(duplicates, 1);
    }

    #[test]
    fn writes_csv_from_details_files() {
        let dir = tempfile::tempdir().unwrap();
        let details = MedicationDetails {
            set_id: "abc".into(),
            brand_name: Some("Examplar®".into()),
            generic_name: Some("examplarin (injection)".into()),
            dosage_forms: vec!["INJECTION, SOLUTION".into()],
            ..Default::default()
        };
        let json = dir.path().join("abc.json");
        fs::write(&json, serde_json::to_string(&details).unwrap()).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let files = collect_inputs(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(files, vec![json.clone()]);

        let record = OutputRecord::from(SavedMedication::from_details(&load_details(&json).unwrap()));
        let out = dir.path().join("out.csv");
        write_csv(&out, &[record]).unwrap();

        let csv = fs::read_to_string(out).unwrap();
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().starts_with("Set ID,Brand Name,Generic Name,"));
        assert!(lines.next().unwrap().starts_with("abc,Examplar,examplarin,,\"INJECTION, SOLUTION\""));
    }
}
