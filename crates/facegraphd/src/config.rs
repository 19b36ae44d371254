use anyhow::{Context, Result};
use facegraph_core::SyncConfig;
use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite face store.
    pub db_path: PathBuf,
    /// Root of the photo library to sync.
    pub library_root: PathBuf,
    /// Optional TOML file with pipeline and job tunables.
    pub tunables_path: Option<PathBuf>,
    /// Arm the sync timer as soon as the daemon is up.
    pub schedule_on_start: bool,
    /// Pipeline and job tunables: TOML file first, then env overrides.
    pub sync: SyncConfig,
}

impl Config {
    /// Load configuration from `FACEGRAPH_*` environment variables with defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&home).join(".local/share"))
            .join("facegraph");

        let model_dir = var("FACEGRAPH_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("models"));
        let db_path = var("FACEGRAPH_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("faces.db"));
        let library_root = var("FACEGRAPH_LIBRARY_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&home).join("Pictures"));
        let tunables_path = var("FACEGRAPH_CONFIG").map(PathBuf::from);

        let mut sync = match &tunables_path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                SyncConfig::from_toml_str(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            None => SyncConfig::default(),
        };

        let job = &mut sync.job;
        job.batch_size = env_usize(&var, "FACEGRAPH_BATCH_SIZE", job.batch_size);
        job.file_timeout_secs = env_u64(&var, "FACEGRAPH_FILE_TIMEOUT_SECS", job.file_timeout_secs);
        job.interval_secs = env_u64(&var, "FACEGRAPH_SYNC_INTERVAL_SECS", job.interval_secs);
        job.max_interval_secs = env_u64(&var, "FACEGRAPH_MAX_SYNC_INTERVAL_SECS", job.max_interval_secs);
        sync.clustering.distance_threshold = env_f32(
            &var,
            "FACEGRAPH_CLUSTER_DISTANCE_THRESHOLD",
            sync.clustering.distance_threshold,
        );
        sync.clustering.min_cluster_size =
            env_usize(&var, "FACEGRAPH_MIN_CLUSTER_SIZE", sync.clustering.min_cluster_size);
        sync.validate().context("invalid FACEGRAPH_* override")?;

        Ok(Self {
            model_dir,
            db_path,
            library_root,
            tunables_path,
            schedule_on_start: var("FACEGRAPH_SCHEDULE_ON_START")
                .map(|v| v != "0")
                .unwrap_or(true),
            sync,
        })
    }

    /// Path to the BlazeFace detection model.
    pub fn blazeface_model_path(&self) -> String {
        self.model_dir
            .join("blazeface.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the MobileFaceNet embedding model.
    pub fn mobilefacenet_model_path(&self) -> String {
        self.model_dir
            .join("mobilefacenet.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn env_f32(var: &impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(var: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(var: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
