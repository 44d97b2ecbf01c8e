use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use leitor_core::{
    FileLibraryStore, Library, LibraryItem, LibraryStore, PanelDetector, ReaderError, Settings,
};
use leitor_detect::GeminiPanelDetector;
use leitor_render::FormatRouter;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

mod reader;

#[derive(Debug, Parser)]
#[command(
    name = "leitor",
    version,
    about = "Terminal reader for comic archives, EPUBs and PDFs with panel-by-panel navigation"
)]
struct Args {
    /// Directory holding the library and logs
    #[arg(long = "data-dir", global = true)]
    data_dir: Option<PathBuf>,

    /// Settings file (TOML)
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Add documents to the library
    Import {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Show library items
    List {
        /// Print items as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete an item from the library
    Remove { id: String },
    /// Change an item's title
    Rename { id: String, title: String },
    /// Open an item in the reader
    Read { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => Settings::project_dirs()
            .map(|dirs| dirs.config_dir().join("settings.toml"))
            .ok_or_else(|| anyhow!("unable to resolve platform config directory"))?,
    };
    let settings = Settings::load(&config_path)?;
    let data_dir = resolve_data_dir(args.data_dir.as_deref(), &settings)?;

    let interactive = matches!(args.command, Commands::Read { .. });
    let _log_guard = init_logging(&data_dir.join("logs"), !interactive)?;
    info!(data_dir = %data_dir.display(), "starting");

    let store: Arc<dyn LibraryStore> =
        Arc::new(FileLibraryStore::new(data_dir.join("library")).map_err(user_error)?);
    let library = Library::new(store, settings.render.thumbnail_size);

    match args.command {
        Commands::Import { files } => import(&library, &files).await,
        Commands::List { json } => list(&library, json),
        Commands::Remove { id } => {
            if !library.remove(&id).map_err(user_error)? {
                return Err(user_error(ReaderError::NotFound(id)));
            }
            println!("removed {id}");
            Ok(())
        }
        Commands::Rename { id, title } => {
            library.rename(&id, &title).map_err(user_error)?;
            println!("renamed {id} to {title:?}");
            Ok(())
        }
        Commands::Read { id } => {
            let source = library.source(&id).map_err(user_error)?;
            let provider = FormatRouter::new();
            let detector: Option<Arc<dyn PanelDetector>> =
                match GeminiPanelDetector::new(settings.detector.clone()) {
                    Ok(detector) => Some(Arc::new(detector)),
                    Err(err) => {
                        warn!("panel detection unavailable: {err:#}");
                        None
                    }
                };
            reader::run(source, &provider, detector, settings.render.quality_scale).await
        }
    }
}

fn resolve_data_dir(flag: Option<&Path>, settings: &Settings) -> Result<PathBuf> {
    if let Some(dir) = flag {
        return Ok(dir.to_path_buf());
    }
    if let Some(dir) = &settings.library.path {
        return Ok(dir.clone());
    }
    Settings::project_dirs()
        .map(|dirs| dirs.data_local_dir().to_path_buf())
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))
}

fn user_error(err: ReaderError) -> anyhow::Error {
    let message = err.user_message();
    anyhow::Error::new(err).context(message)
}

async fn import(library: &Library, files: &[PathBuf]) -> Result<()> {
    let provider = FormatRouter::new();
    let mut failures = 0usize;

    for path in files {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow!("invalid file name {:?}", path))?;
        let bytes = fs::read(path).with_context(|| format!("failed to read {:?}", path))?;
        match library.import(&provider, file_name, bytes).await {
            Ok(item) => println!(
                "imported {} ({}, {} pages) as {}",
                item.title, item.kind, item.page_count, item.id
            ),
            Err(err) => {
                warn!(%err, path = %path.display(), "import failed");
                eprintln!("{}: {}", path.display(), err.user_message());
                failures += 1;
            }
        }
    }

    if failures > 0 {
        return Err(anyhow!("{failures} of {} files could not be imported", files.len()));
    }
    Ok(())
}

fn list(library: &Library, json: bool) -> Result<()> {
    let items = library.items().map_err(user_error)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }
    if items.is_empty() {
        println!("library is empty");
        return Ok(());
    }
    for item in &items {
        println!("{}", format_item(item));
    }
    Ok(())
}

fn format_item(item: &LibraryItem) -> String {
    let cover = if item.cover_thumbnail.is_empty() {
        " "
    } else {
        "*"
    };
    format!(
        "{}  {:<13} {:>5}p {} {}",
        item.id, item.kind, item.page_count, cover, item.title
    )
}

/// Logs go to `log_dir/leitor.log`; stderr gets a copy unless the reader owns the terminal.
fn init_logging(log_dir: &Path, console: bool) -> Result<WorkerGuard> {
    fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "leitor.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    let console_layer = console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(EnvFilter::new("warn"))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
