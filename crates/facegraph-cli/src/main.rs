use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use facegraph_core::recognizer::MOBILEFACENET_MODEL_VERSION;
use facegraph_core::{ClusterEngine, Embedding, SyncConfig};
use facegraph_sync::{export, spawn_engine, DirectoryLibrary, FaceStore, SqliteStore};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "facegraph", about = "facegraph photo library face clustering CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Local paths; each falls back to the same `FACEGRAPH_*` variable the
/// daemon reads.
#[derive(Args)]
struct Paths {
    /// SQLite face store [env: FACEGRAPH_DB_PATH]
    #[arg(long)]
    db: Option<PathBuf>,
    /// TOML tunables file [env: FACEGRAPH_CONFIG]
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Paths {
    fn db(&self) -> PathBuf {
        self.db
            .clone()
            .or_else(|| env_path("FACEGRAPH_DB_PATH"))
            .unwrap_or_else(|| data_dir().join("faces.db"))
    }

    fn sync_config(&self) -> Result<SyncConfig> {
        match self.config.clone().or_else(|| env_path("FACEGRAPH_CONFIG")) {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                Ok(SyncConfig::from_toml_str(&text)?)
            }
            None => Ok(SyncConfig::default()),
        }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let db = self.db();
        SqliteStore::open(&db).with_context(|| format!("opening {}", db.display()))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Sync a library locally and print the resulting clusters
    Sync {
        /// Photo library root [env: FACEGRAPH_LIBRARY_ROOT]
        #[arg(short, long)]
        library: Option<PathBuf>,
        /// Directory with blazeface.onnx and mobilefacenet.onnx [env: FACEGRAPH_MODEL_DIR]
        #[arg(long)]
        models: Option<PathBuf>,
        #[command(flatten)]
        paths: Paths,
    },
    /// Re-cluster the stored embeddings with the given tunables
    Cluster {
        /// Override the single-linkage distance threshold
        #[arg(short, long)]
        threshold: Option<f32>,
        /// Override the minimum cluster size
        #[arg(short, long)]
        min_size: Option<usize>,
        /// Only cluster faces embedded by this model
        #[arg(long, default_value = MOBILEFACENET_MODEL_VERSION)]
        model_version: String,
        #[command(flatten)]
        paths: Paths,
    },
    /// Write a JSON debug export of the store
    Export {
        /// Output file
        output: PathBuf,
        #[command(flatten)]
        paths: Paths,
    },
    /// Load a JSON debug export into the store
    Import {
        /// Export file
        input: PathBuf,
        #[command(flatten)]
        paths: Paths,
    },
    /// Show daemon status
    Status,
    /// Arm the daemon's periodic sync
    Schedule,
    /// Stop the daemon's periodic sync
    Stop,
}

#[zbus::proxy(
    interface = "org.freedesktop.FaceGraph1",
    default_service = "org.freedesktop.FaceGraph1",
    default_path = "/org/freedesktop/FaceGraph1"
)]
trait FaceGraph {
    async fn schedule_next_sync(&self) -> zbus::Result<()>;
    async fn stop_sync(&self) -> zbus::Result<()>;
    async fn status(&self) -> zbus::Result<String>;
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().map(PathBuf::from)
}

fn data_dir() -> PathBuf {
    env_path("XDG_DATA_HOME")
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegraph")
}

async fn daemon() -> Result<FaceGraphProxy<'static>> {
    let conn = zbus::Connection::session().await?;
    FaceGraphProxy::new(&conn)
        .await
        .context("facegraphd is not reachable on the session bus")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Sync {
            library,
            models,
            paths,
        } => {
            let config = paths.sync_config()?;
            let library_root = library
                .or_else(|| env_path("FACEGRAPH_LIBRARY_ROOT"))
                .context("no library given (--library or FACEGRAPH_LIBRARY_ROOT)")?;
            let model_dir = models
                .or_else(|| env_path("FACEGRAPH_MODEL_DIR"))
                .unwrap_or_else(|| data_dir().join("models"));

            let engine = spawn_engine(
                &model_dir.join("blazeface.onnx").to_string_lossy(),
                &model_dir.join("mobilefacenet.onnx").to_string_lossy(),
                &config,
            )?;
            let store: Arc<dyn FaceStore> = Arc::new(paths.open_store()?);
            let library = Arc::new(DirectoryLibrary::new(&library_root)?);

            let result = facegraph_sync::sync(library, store, engine.clone(), config).await?;
            engine.dispose().await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Cluster {
            threshold,
            min_size,
            model_version,
            paths,
        } => {
            let mut config = paths.sync_config()?.clustering;
            if let Some(t) = threshold {
                config.distance_threshold = t;
            }
            if let Some(n) = min_size {
                config.min_cluster_size = n;
            }

            let store = paths.open_store()?;
            let embeddings: Vec<Embedding> = store
                .all_files()?
                .iter()
                .filter(|f| f.model_version == model_version)
                .flat_map(|f| f.embeddings())
                .collect();
            tracing::info!(faces = embeddings.len(), model_version = %model_version, "clustering stored faces");

            let result = ClusterEngine::new(config).cluster(&embeddings)?;
            store.set_cluster_result(&result)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Export { output, paths } => {
            let store = paths.open_store()?;
            let snapshot = export::export(&store)?;
            export::write_json(&snapshot, &output)?;
            println!(
                "Exported {} files and {} crops to {}",
                snapshot.files.len(),
                snapshot.crops.len(),
                output.display()
            );
        }
        Commands::Import { input, paths } => {
            let snapshot = export::read_json(&input)?;
            let store = paths.open_store()?;
            export::import(&store, &snapshot)?;
            println!("Imported {} files and {} crops", snapshot.files.len(), snapshot.crops.len());
        }
        Commands::Status => {
            let status = daemon().await?.status().await?;
            let value: serde_json::Value = serde_json::from_str(&status)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Schedule => {
            daemon().await?.schedule_next_sync().await?;
            println!("Sync scheduled");
        }
        Commands::Stop => {
            daemon().await?.stop_sync().await?;
            println!("Sync stopped");
        }
    }

    Ok(())
}
