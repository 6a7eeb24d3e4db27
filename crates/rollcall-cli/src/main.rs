use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use rollcall_core::{report, IdentityRegistry, LedgerRepository};
use rollcall_engine::{AttendanceService, Config, EvaluationSample, DEFAULT_SOURCE};
use rollcall_store::SqliteStore;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new identity from one or more photos
    Enroll {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(required = true)]
        photos: Vec<PathBuf>,
    },
    /// Replace the signature of an existing identity
    Reenroll {
        #[arg(long)]
        id: String,
        #[arg(required = true)]
        photos: Vec<PathBuf>,
    },
    /// Recognize faces in an image and reconcile the day's ledger
    Mark {
        image: PathBuf,
        /// Ledger date (YYYY-MM-DD), defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long, default_value = DEFAULT_SOURCE)]
        source: String,
    },
    /// Recognize faces in an image without touching the ledger
    Recognize { image: PathBuf },
    /// Show ledger rows for a date
    Ledger {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Present/absent counts for a date
    Summary {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Daily summaries for an inclusive date range
    SummaryRange {
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
    },
    /// List registered identities
    List,
    /// Remove an identity with its signature and ledger rows
    Remove { id: String },
    /// Measure recognition accuracy against a JSON manifest of labelled images
    Evaluate { manifest: PathBuf },
}

/// Manifest entry; relative image paths resolve against the manifest's directory.
#[derive(Deserialize)]
struct ManifestEntry {
    image: PathBuf,
    expected: Option<String>,
}

#[derive(Serialize)]
struct Removed<'a> {
    identity_id: &'a str,
    removed: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Enroll { id, name, photos } => {
            let service = AttendanceService::start(&config)?;
            let enrollment = service.enroll(id, name, read_all(&photos)?).await?;
            print_json(&enrollment)
        }
        Commands::Reenroll { id, photos } => {
            let service = AttendanceService::start(&config)?;
            let enrollment = service.reenroll(id, read_all(&photos)?).await?;
            print_json(&enrollment)
        }
        Commands::Mark { image, date, source } => {
            let service = AttendanceService::start(&config)?;
            let outcome = service
                .mark_from_image(read_image(&image)?, date.unwrap_or_else(today), source)
                .await?;
            print_json(&outcome)
        }
        Commands::Recognize { image } => {
            let service = AttendanceService::start(&config)?;
            print_json(&service.recognize(read_image(&image)?).await?)
        }
        Commands::Ledger { date } => {
            let store = open_store(&config)?;
            print_json(&store.ledger_for(date.unwrap_or_else(today))?)
        }
        Commands::Summary { date } => {
            let store = open_store(&config)?;
            print_json(&report::daily_summary(&store, &store, date.unwrap_or_else(today))?)
        }
        Commands::SummaryRange { from, to } => {
            let store = open_store(&config)?;
            print_json(&report::summary_range(&store, &store, from, to)?)
        }
        Commands::List => {
            let store = open_store(&config)?;
            print_json(&store.list()?)
        }
        Commands::Remove { id } => {
            let store = open_store(&config)?;
            let removed = store.remove(&id)?;
            print_json(&Removed {
                identity_id: &id,
                removed,
            })?;
            if !removed {
                bail!("identity not found: {id}");
            }
            Ok(())
        }
        Commands::Evaluate { manifest } => {
            let samples = load_manifest(&manifest)?;
            let service = AttendanceService::start(&config)?;
            print_json(&service.evaluate(samples).await?)
        }
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// Store-only commands skip model loading.
fn open_store(config: &Config) -> Result<SqliteStore> {
    SqliteStore::open(&config.db_path)
        .with_context(|| format!("failed to open database {}", config.db_path.display()))
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read image {}", path.display()))
}

fn read_all(paths: &[PathBuf]) -> Result<Vec<Vec<u8>>> {
    paths.iter().map(|p| read_image(p)).collect()
}

/// Unreadable images become empty samples, scored as having no prediction.
fn load_manifest(path: &Path) -> Result<Vec<EvaluationSample>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read manifest {}", path.display()))?;
    let entries: Vec<ManifestEntry> =
        serde_json::from_str(&raw).with_context(|| format!("invalid manifest {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    Ok(entries
        .into_iter()
        .map(|entry| {
            let image_path = base.join(&entry.image);
            let image = std::fs::read(&image_path).unwrap_or_else(|e| {
                tracing::warn!(path = %image_path.display(), error = %e, "manifest image unreadable");
                Vec::new()
            });
            EvaluationSample {
                image,
                expected: entry.expected,
            }
        })
        .collect())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_mark_with_date() {
        let cli = Cli::try_parse_from(["rollcall", "mark", "class.jpg", "--date", "2024-03-01"]).unwrap();
        match cli.command {
            Commands::Mark { image, date, source } => {
                assert_eq!(image, PathBuf::from("class.jpg"));
                assert_eq!(date, NaiveDate::from_ymd_opt(2024, 3, 1));
                assert_eq!(source, "image");
            }
            _ => panic!("expected mark"),
        }
    }

    #[test]
    fn test_enroll_requires_photos() {
        assert!(Cli::try_parse_from(["rollcall", "enroll", "--id", "STU001", "--name", "Alice"]).is_err());
    }

    #[test]
    fn test_manifest_paths_resolve_against_manifest_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.png"), b"bytes").unwrap();
        let manifest = dir.path().join("manifest.json");
        std::fs::write(
            &manifest,
            r#"[{"image": "a.png", "expected": "STU001"}, {"image": "missing.png", "expected": null}]"#,
        )
        .unwrap();

        let samples = load_manifest(&manifest).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].image, b"bytes");
        assert_eq!(samples[0].expected.as_deref(), Some("STU001"));
        assert!(samples[1].image.is_empty());
        assert!(samples[1].expected.is_none());
    }
}
