use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pixmatch_core::palette::{analyze_logo, ThemeMode};
use pixmatch_core::PhotoId;
use pixmatch_engine::{Config, Engine, EventGallery, QueryError, QueryOutcome, Upload};
use serde_json::json;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "pixmatch", about = "Pixmatch event photo retrieval CLI")]
struct Cli {
    /// TOML config file (default: PIXMATCH_* environment variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest event photos into the gallery
    Ingest {
        /// Photo files; each photo id is the file stem
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Photo id to use instead of the file stem (single file only)
        #[arg(long)]
        id: Option<String>,
    },
    /// Find the gallery photos that contain the face in a selfie
    Query {
        selfie: PathBuf,
    },
    /// Remove a photo and its faces from the gallery
    Retract {
        id: String,
    },
    /// Show photo and face counts
    Status,
    /// List photos and their ingestion state
    List,
    /// Delete every photo and face of the event
    Purge {
        /// Confirm the purge
        #[arg(long)]
        yes: bool,
    },
    /// Derive day and night palettes from a logo
    Palette {
        logo: PathBuf,
        /// Print only one palette
        #[arg(long, value_parser = ["day", "night"])]
        mode: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Ingest { files, id } => {
            if id.is_some() && files.len() > 1 {
                bail!("--id needs exactly one file, got {}", files.len());
            }
            let engine = Engine::from_config(&load_config(cli.config.as_deref())?)?;

            let mut uploads = Vec::with_capacity(files.len());
            for path in &files {
                let photo_id = match &id {
                    Some(id) => id.clone(),
                    None => file_stem(path)?,
                };
                uploads.push(Upload::new(photo_id, read(path)?).with_location(path.display().to_string()));
            }

            let reports = engine.ingest_batch(uploads).await;
            print_json(&reports)?;
        }
        Commands::Query { selfie } => {
            let engine = Engine::from_config(&load_config(cli.config.as_deref())?)?;
            let output = match engine.query(read(&selfie)?).await {
                Ok(QueryOutcome::Matches(result)) => {
                    let matches: Vec<_> = result
                        .matches
                        .iter()
                        .map(|m| {
                            json!({
                                "photo_id": m.photo_id,
                                "similarity": m.similarity,
                                "location": engine.photo(&m.photo_id).map(|e| e.photo.location),
                                "face": m.observation.bbox,
                            })
                        })
                        .collect();
                    json!({ "outcome": "matches", "matches": matches })
                }
                Ok(QueryOutcome::NoFaceDetected) => json!({ "outcome": "no_face_detected" }),
                Err(QueryError::AmbiguousQuery { faces }) => {
                    json!({ "outcome": "ambiguous_query", "faces": faces })
                }
                Err(err) => return Err(err.into()),
            };
            print_json(&output)?;
        }
        Commands::Retract { id } => {
            let gallery = EventGallery::open(&load_config(cli.config.as_deref())?)?;
            let retracted = gallery.retract(&PhotoId::from(id.as_str()))?;
            print_json(&json!({ "photo_id": id, "retracted": retracted }))?;
        }
        Commands::Status => {
            let config = load_config(cli.config.as_deref())?;
            let gallery = EventGallery::open(&config)?;
            print_json(&json!({
                "gallery": config.db_path,
                "threshold": config.similarity_threshold,
                "query_policy": config.query_policy,
                "stats": gallery.stats(),
            }))?;
        }
        Commands::List => {
            let gallery = EventGallery::open(&load_config(cli.config.as_deref())?)?;
            print_json(&gallery.photos())?;
        }
        Commands::Purge { yes } => {
            if !yes {
                bail!("purge deletes every photo and face of the event; pass --yes to confirm");
            }
            let gallery = EventGallery::open(&load_config(cli.config.as_deref())?)?;
            let before = gallery.stats();
            gallery.purge()?;
            print_json(&json!({ "purged": before }))?;
        }
        Commands::Palette { logo, mode } => {
            let image = pixmatch_core::decode_image(&read(&logo)?)
                .with_context(|| format!("decoding {}", logo.display()))?;
            let palettes = analyze_logo(&image);
            match mode.as_deref() {
                Some("day") => print_json(palettes.for_mode(ThemeMode::Day))?,
                Some("night") => print_json(palettes.for_mode(ThemeMode::Night))?,
                _ => print_json(&palettes)?,
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env(),
    };
    config.validate()?;
    Ok(config)
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn file_stem(path: &Path) -> Result<String> {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
