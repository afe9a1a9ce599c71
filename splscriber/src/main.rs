//! # Splscriber - batch SPL label parsing
//!
//! Reads label XML (plus optional media/NDC/RxNorm/pharmacologic-class sidecar files) from
//! a directory, parses every requested set id into `MedicationDetails`, and writes one
//! `<setId>.json` per label.
//!
//! ## Pipeline Overview
//!
//! 1. **Configuration**: TOML config (image host, cache sizing, IFU scan window)
//! 2. **Parallel Parsing**: each set id is fetched and parsed independently with Rayon
//! 3. **Output Generation**: pretty-printed JSON per label
//! 4. **Summary**: counts of parsed, missing and malformed labels
//!
//! ## Command-line Usage
//!
//! ```bash
//! splscriber --source data/labels --out data/details 0a1b2c3d-... 9f8e7d6c-...
//! RUST_LOG=splscriber=debug splscriber --source data/labels --all
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{bail, Context, Result};
use clap::Parser;
use rayon::prelude::*;
use splscriber::{DirectorySource, LabelService, SplConfig, SplError};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "splscriber")]
#[command(about = "Parse SPL drug label XML into render-ready medication details")]
#[command(version)]
struct Cli {
    /// Directory holding `<setId>.xml` and optional sidecar JSON files
    #[arg(short, long)]
    source: PathBuf,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output directory for `<setId>.json`
    #[arg(short, long, default_value = "details")]
    out: PathBuf,

    /// Parse every `*.xml` file in the source directory
    #[arg(long, conflicts_with = "set_ids")]
    all: bool,

    /// Set ids to parse
    set_ids: Vec<String>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("splscriber=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Set ids of every label file in `dir`, sorted.
fn discover_set_ids(dir: &Path) -> Result<Vec<String>> {
    let mut set_ids = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "xml") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                set_ids.push(stem.to_string());
            }
        }
    }
    set_ids.sort();
    Ok(set_ids)
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SplConfig::load(path).with_context(|| format!("loading config {}", path.display()))?,
        None => SplConfig::default(),
    };

    let set_ids = if cli.all {
        discover_set_ids(&cli.source)?
    } else {
        cli.set_ids.clone()
    };
    if set_ids.is_empty() {
        bail!("no set ids given (pass set ids or --all)");
    }

    fs::create_dir_all(&cli.out).with_context(|| format!("creating {}", cli.out.display()))?;
    let service = LabelService::new(DirectorySource::new(&cli.source), config);

    info!(
        labels = set_ids.len(),
        threads = rayon::current_num_threads(),
        "parsing labels"
    );

    let parsed = AtomicUsize::new(0);
    let missing = AtomicUsize::new(0);
    let malformed = AtomicUsize::new(0);
    let total = set_ids.len();

    let failures: Vec<(String, anyhow::Error)> = set_ids
        .par_iter()
        .filter_map(|set_id| {
            let result = service.details(set_id).map_err(|e| match e {
                SplError::NotFound(_) => {
                    missing.fetch_add(1, Ordering::Relaxed);
                    anyhow::Error::from(e)
                }
                SplError::MalformedDocument(_) | SplError::Xml(_) => {
                    malformed.fetch_add(1, Ordering::Relaxed);
                    anyhow::Error::from(e)
                }
                other => anyhow::Error::from(other),
            });
            let written = result.and_then(|details| {
                let path = cli.out.join(format!("{set_id}.json"));
                let json = serde_json::to_string_pretty(&*details)?;
                fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
                Ok(())
            });

            match written {
                Ok(()) => {
                    let count = parsed.fetch_add(1, Ordering::Relaxed) + 1;
                    if count % 100 == 0 {
                        info!("parsed {count} / {total} labels");
                    }
                    None
                }
                Err(e) => Some((set_id.clone(), e)),
            }
        })
        .collect();

    for (set_id, e) in &failures {
        warn!(%set_id, "{e:#}");
    }

    info!(
        total,
        parsed = parsed.load(Ordering::Relaxed),
        missing = missing.load(Ordering::Relaxed),
        malformed = malformed.load(Ordering::Relaxed),
        out = %cli.out.display(),
        "processing complete"
    );

    if failures.len() == total {
        error!("no label could be parsed");
        bail!("all {total} labels failed");
    }
    Ok(())
}
