use anyhow::Result;
use clap::{Parser, Subcommand};
use shelf_core::config;
use shelf_core::config::AppConfig;
use shelf_core::filter::{Filter, Sort};
use shelf_core::models::{FileKind, FileRecord, TagSource};
use shelf_core::store::Store;
use shelf_core::updater::{self, StoreUpdater};
use std::path::PathBuf;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let cfg = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Scan { roots, json } => run_scan(cfg, roots, json).await,
        Commands::Watch { roots } => run_watch(cfg, roots).await,
        Commands::Ls {
            root,
            tags,
            kinds,
            descending,
            json,
        } => run_ls(cfg, root, tags, kinds, descending, json).await,
        Commands::Tags { json } => run_tags(cfg, json).await,
        Commands::Roots => run_roots(cfg),
        Commands::Forget { root } => run_forget(cfg, root).await,
    }
}

#[derive(Parser)]
#[command(name = "shelf")]
#[command(about = "Indexes directory trees into a queryable catalogue", long_about = None)]
struct Cli {
    /// Path to config TOML
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile the catalogue with the filesystem once, without watching
    Scan {
        /// Roots to scan; defaults to the configured library roots
        roots: Vec<PathBuf>,
        /// Output JSON summary
        #[arg(long)]
        json: bool,
    },
    /// Reconcile, then keep the catalogue synchronized until interrupted
    Watch {
        /// Roots to watch; defaults to the configured library roots
        roots: Vec<PathBuf>,
    },
    /// List catalogued files
    Ls {
        /// Restrict to files under one root
        #[arg(long)]
        root: Option<PathBuf>,
        /// Require every listed tag (comma-separated)
        #[arg(long, value_delimiter = ',', num_args = 1.., default_values_t = Vec::<String>::new())]
        tags: Vec<String>,
        /// Restrict to kinds (comma-separated), e.g. image,video
        #[arg(long, value_delimiter = ',', num_args = 1.., default_values_t = Vec::<String>::new())]
        kinds: Vec<String>,
        /// Sort by display name descending
        #[arg(long, default_value_t = false)]
        descending: bool,
        /// Output JSON
        #[arg(long)]
        json: bool,
    },
    /// List known tags
    Tags {
        /// Output JSON
        #[arg(long)]
        json: bool,
    },
    /// List the configured library roots
    Roots,
    /// Drop everything catalogued under a root
    Forget {
        root: PathBuf,
    },
}

fn resolve_roots(cfg: &AppConfig, roots: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
    let roots = if roots.is_empty() {
        cfg.library.roots.clone()
    } else {
        roots
    };
    anyhow::ensure!(
        !roots.is_empty(),
        "no roots given and none configured under [library]"
    );
    Ok(roots)
}

async fn run_scan(cfg: AppConfig, roots: Vec<PathBuf>, json: bool) -> Result<()> {
    let roots = resolve_roots(&cfg, roots)?;
    let excludes = cfg.library.excludes()?;
    let store = Store::open(&cfg.database.path).await?;

    let mut summaries = Vec::new();
    for root in roots {
        let summary = updater::reconcile(&store, &root, &excludes).await?;
        summaries.push((root, summary));
    }
    if json {
        let vals: Vec<serde_json::Value> = summaries
            .iter()
            .map(|(root, s)| {
                serde_json::json!({
                    "root": root,
                    "inserted": s.inserted,
                    "removed": s.removed,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&vals)?);
    } else {
        for (root, summary) in &summaries {
            println!(
                "{}: inserted {}, removed {}",
                root.display(),
                summary.inserted,
                summary.removed
            );
        }
    }
    Ok(())
}

async fn run_watch(cfg: AppConfig, roots: Vec<PathBuf>) -> Result<()> {
    let roots = resolve_roots(&cfg, roots)?;
    let excludes = cfg.library.excludes()?;
    let store = Store::open(&cfg.database.path).await?;

    let mut updaters = Vec::new();
    for root in roots {
        let mut updater = StoreUpdater::new(store.clone(), root.clone(), excludes.clone());
        updater.start()?;
        info!(root = %root.display(), "watching");
        updaters.push(updater);
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for updater in &mut updaters {
        updater.stop().await;
    }
    Ok(())
}

async fn run_ls(
    cfg: AppConfig,
    root: Option<PathBuf>,
    tags: Vec<String>,
    kinds: Vec<String>,
    descending: bool,
    json: bool,
) -> Result<()> {
    let store = Store::open(&cfg.database.path).await?;

    let mut parts = Vec::new();
    if let Some(root) = root {
        parts.push(Filter::owner(root));
    }
    for tag in tags {
        parts.push(Filter::tagged(tag));
    }
    if !kinds.is_empty() {
        parts.push(Filter::kind_in(
            kinds.iter().map(|k| FileKind::from_str_lossy(k)),
        ));
    }
    let filter = Filter::all_of(parts);
    let sort = if descending {
        Sort::DisplayNameDescending
    } else {
        Sort::DisplayNameAscending
    };

    let files = store.files(&filter, sort).await?;
    if json {
        let vals: Vec<serde_json::Value> = files.iter().map(file_json).collect();
        println!("{}", serde_json::to_string_pretty(&vals)?);
    } else {
        for file in &files {
            println!(
                "{}  {}  {}",
                format_millis(file.modified_at),
                file.kind.as_str(),
                file.path.display()
            );
        }
    }
    Ok(())
}

async fn run_tags(cfg: AppConfig, json: bool) -> Result<()> {
    let store = Store::open(&cfg.database.path).await?;
    let tags = store.tags().await?;
    if json {
        let vals: Vec<serde_json::Value> = tags
            .iter()
            .map(|tag| {
                serde_json::json!({
                    "name": tag.name,
                    "source": match tag.source {
                        TagSource::Filename => "filename",
                        TagSource::External => "external",
                    },
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&vals)?);
    } else {
        for tag in &tags {
            println!("{}", tag.name);
        }
    }
    Ok(())
}

fn run_roots(cfg: AppConfig) -> Result<()> {
    for root in &cfg.library.roots {
        println!("{}", root.display());
    }
    Ok(())
}

async fn run_forget(cfg: AppConfig, root: PathBuf) -> Result<()> {
    let store = Store::open(&cfg.database.path).await?;
    store.remove_owner(&root).await?;
    println!("forgot {}", root.display());
    Ok(())
}

fn file_json(file: &FileRecord) -> serde_json::Value {
    serde_json::json!({
        "uuid": file.uuid.to_string(),
        "root": file.owner,
        "path": file.path,
        "name": file.name,
        "kind": file.kind.as_str(),
        "modified": format_millis(file.modified_at),
    })
}

fn format_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}
