use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use vigil_core::dispatch::{AnalysisDispatcher, DrainOutcome, ProcessLauncher};
use vigil_core::embedder::OnnxEmbedder;
use vigil_core::registry::IdentityRegistry;
use vigil_core::state::{SharedStatePublisher, StatusSnapshot};
use vigil_core::store::{validate_name, IdentityStore, UNKNOWN_PREFIX};
use vigil_core::{Frame, VigilConfig};

#[derive(Parser)]
#[command(name = "vigil", about = "Vigil perception pipeline CLI")]
struct Cli {
    /// TOML config file (defaults to VIGIL_* environment variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List identities in the store
    Identities,
    /// Add reference images for a named identity
    Enroll {
        /// Identity name (also the store directory name)
        #[arg(short, long)]
        name: String,
        /// ArcFace ONNX model; when given, at least one image must embed
        #[arg(short, long)]
        model: Option<PathBuf>,
        /// Reference images
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Consume a pending analysis result into the shared state
    Drain,
    /// Show the latest analysis from the shared state
    Status {
        /// Refresh every SECS seconds until Ctrl-C
        #[arg(short, long, value_name = "SECS")]
        watch: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => VigilConfig::load(path)?,
        None => {
            let config = VigilConfig::from_env();
            config.validate()?;
            config
        }
    };

    match cli.command {
        Commands::Identities => {
            let store = IdentityStore::new(config.store_dir());
            let identities = store.scan()?;
            if identities.is_empty() {
                println!("No identities in {}", store.root().display());
            }
            for identity in identities {
                let kind = if identity.is_generated() { "generated" } else { "enrolled" };
                println!("{:<24} {:>3} image(s)  {kind}", identity.name, identity.images.len());
            }
        }
        Commands::Enroll { name, model, images } => {
            let written = enroll(&config, &name, &images, model.as_deref())?;
            println!("Enrolled {name} with {} image(s)", written.len());
        }
        Commands::Drain => match drain(&config)? {
            DrainOutcome::Empty => println!("No pending result"),
            DrainOutcome::Published { ok, run_id } => {
                println!("Published result (ok: {ok}, run: {})", run_id.as_deref().unwrap_or("-"))
            }
            DrainOutcome::Discarded { reason } => println!("Discarded unreadable result: {reason}"),
        },
        Commands::Status { watch: None } => print_status(&config.state_path()),
        Commands::Status { watch: Some(secs) } => watch_status(&config.state_path(), secs.max(1)).await?,
    }

    Ok(())
}

/// Check the images and copy them into the store under `name`.
fn enroll(config: &VigilConfig, name: &str, images: &[PathBuf], model: Option<&Path>) -> Result<Vec<PathBuf>> {
    validate_name(name)?;
    if name.starts_with(UNKNOWN_PREFIX) {
        bail!("names starting with {UNKNOWN_PREFIX} are reserved for generated identities");
    }

    let frames = images
        .iter()
        .map(|path| Frame::from_path(path).with_context(|| format!("cannot use {}", path.display())))
        .collect::<Result<Vec<_>>>()?;

    if let Some(model) = model {
        let mut embedder = OnnxEmbedder::load(model)?;
        let mut registry = IdentityRegistry::new(
            IdentityStore::new(config.store_dir()),
            config.registry_settings(),
            config.preprocessor(),
        )?;
        let used = registry.enroll(name, &frames, None, &mut embedder)?;
        if used == 0 {
            bail!("no usable face found in {} image(s)", frames.len());
        }
        tracing::info!(name, used, total = frames.len(), "enrollment images embedded");
    }

    let store = IdentityStore::new(config.store_dir());
    Ok(store.add_images(name, images)?)
}

fn drain(config: &VigilConfig) -> Result<DrainOutcome> {
    let mut dispatcher = AnalysisDispatcher::new(
        config.exchange_paths(),
        Box::new(ProcessLauncher::new(
            config.analyzer_program.clone(),
            config.analyzer_args.clone(),
        )),
        config.analysis_cooldown(),
        config.analysis_timeout(),
    );
    let publisher = SharedStatePublisher::new(config.state_path());
    Ok(dispatcher.drain_result(&publisher)?)
}

fn format_status(snapshot: Option<&StatusSnapshot>) -> String {
    let Some(s) = snapshot else {
        return "No analysis available yet".to_string();
    };
    let mut line = format!(
        "concentration: {}  sleeping: {}",
        s.concentration,
        if s.is_sleeping { "yes" } else { "no" }
    );
    if let Some(subject) = &s.subject_label {
        line.push_str(&format!("  subject: {subject}"));
    }
    if let Some(run_id) = &s.run_id {
        line.push_str(&format!("  run: {run_id}"));
    }
    if let Some(error) = &s.error {
        line.push_str(&format!("  error: {error}"));
    }
    line
}

fn print_status(path: &Path) {
    println!("{}", format_status(StatusSnapshot::read(path).as_ref()));
}

async fn watch_status(path: &Path, secs: u64) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs(secs));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => print_status(path),
            res = &mut ctrl_c => {
                res?;
                break;
            }
        }
    }
    Ok(())
}
