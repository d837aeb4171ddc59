use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::catalog::BoundingBox;
use crate::detect::{RawDetection, DEFAULT_IOU_THRESHOLD};
use crate::ingest::SourceSettings;
use crate::supervisor::{SupervisorPolicy, DEFAULT_DETECTION_DEADLINE, DEFAULT_JPEG_QUALITY};

const DEFAULT_DB_PATH: &str = "shelf_state.db";
const DEFAULT_CATALOG_PATH: &str = "product_coords.json";
const DEFAULT_BACKEND: &str = "stub";
const DEFAULT_VISUAL_KEEP: usize = 5;
const DEFAULT_HISTORY_RETENTION_SECS: u64 = 60 * 60 * 24 * 7;
const DEFAULT_MODEL_SIZE: u32 = 640;
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;

#[derive(Debug, Deserialize, Default)]
struct ShelfConfigFile {
    source: Option<SourceConfigFile>,
    catalog: Option<CatalogConfigFile>,
    detection: Option<DetectionConfigFile>,
    supervisor: Option<SupervisorConfigFile>,
    store: Option<StoreConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    uri: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct CatalogConfigFile {
    path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    backend: Option<String>,
    iou_threshold: Option<f64>,
    deadline_ms: Option<u64>,
    model_path: Option<PathBuf>,
    model_width: Option<u32>,
    model_height: Option<u32>,
    confidence_threshold: Option<f32>,
    stub_detections: Option<Vec<StubDetectionFile>>,
}

#[derive(Debug, Deserialize)]
struct StubDetectionFile {
    coords: [i32; 4],
    #[serde(default = "default_stub_confidence")]
    confidence: f32,
    label: Option<String>,
}

fn default_stub_confidence() -> f32 {
    1.0
}

#[derive(Debug, Deserialize, Default)]
struct SupervisorConfigFile {
    cycle_ms: Option<u64>,
    frame_timeout_ms: Option<u64>,
    failure_threshold: Option<u32>,
    failure_window_secs: Option<u64>,
    recovery_successes: Option<u32>,
    backoff_max_ms: Option<u64>,
    max_restarts: Option<u32>,
    restart_window_secs: Option<u64>,
    restart_jitter_ms: Option<u64>,
    stop_grace_ms: Option<u64>,
    health_log_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StoreConfigFile {
    db_path: Option<String>,
    visual_dir: Option<PathBuf>,
    visual_keep: Option<usize>,
    history_retention_secs: Option<u64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct ShelfConfig {
    pub source: SourceSettings,
    pub catalog_path: PathBuf,
    pub detection: DetectionSettings,
    pub supervisor: SupervisorPolicy,
    pub store: StoreSettings,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub backend: String,
    pub iou_threshold: f64,
    pub deadline: Duration,
    pub model_path: Option<PathBuf>,
    pub model_width: u32,
    pub model_height: u32,
    pub confidence_threshold: f32,
    /// Boxes reported by the `stub` backend.
    pub stub_detections: Vec<RawDetection>,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub db_path: String,
    pub visual_dir: Option<PathBuf>,
    pub visual_keep: usize,
    pub history_retention: Duration,
    pub jpeg_quality: u8,
}

impl Default for ShelfConfig {
    fn default() -> Self {
        // The empty file yields all defaults and cannot fail.
        Self::from_file(ShelfConfigFile::default())
    }
}

impl ShelfConfig {
    /// Defaults, then the file named by `SHELF_CONFIG`, then `SHELF_*`
    /// environment overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SHELF_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a specific file, still applying environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ShelfConfigFile) -> Self {
        let source_defaults = SourceSettings::default();
        let source_file = file.source.unwrap_or_default();
        let source = SourceSettings {
            uri: source_file.uri.unwrap_or(source_defaults.uri),
            width: source_file.width.unwrap_or(source_defaults.width),
            height: source_file.height.unwrap_or(source_defaults.height),
            target_fps: source_file.target_fps.unwrap_or(source_defaults.target_fps),
        };

        let catalog_path = file
            .catalog
            .and_then(|catalog| catalog.path)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CATALOG_PATH));

        let detection_file = file.detection.unwrap_or_default();
        let detection = DetectionSettings {
            backend: detection_file
                .backend
                .unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
            iou_threshold: detection_file.iou_threshold.unwrap_or(DEFAULT_IOU_THRESHOLD),
            deadline: detection_file
                .deadline_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_DETECTION_DEADLINE),
            model_path: detection_file.model_path,
            model_width: detection_file.model_width.unwrap_or(DEFAULT_MODEL_SIZE),
            model_height: detection_file.model_height.unwrap_or(DEFAULT_MODEL_SIZE),
            confidence_threshold: detection_file
                .confidence_threshold
                .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
            stub_detections: detection_file
                .stub_detections
                .unwrap_or_default()
                .into_iter()
                .map(|d| {
                    let [x1, y1, x2, y2] = d.coords;
                    RawDetection {
                        bbox: BoundingBox::new(x1, y1, x2, y2),
                        confidence: d.confidence,
                        label: d.label,
                    }
                })
                .collect(),
        };

        let defaults = SupervisorPolicy::default();
        let sup = file.supervisor.unwrap_or_default();
        let supervisor = SupervisorPolicy {
            cycle_period: ms_or(sup.cycle_ms, defaults.cycle_period),
            frame_timeout: ms_or(sup.frame_timeout_ms, defaults.frame_timeout),
            failure_threshold: sup.failure_threshold.unwrap_or(defaults.failure_threshold),
            failure_window: secs_or(sup.failure_window_secs, defaults.failure_window),
            recovery_successes: sup.recovery_successes.unwrap_or(defaults.recovery_successes),
            backoff_max: ms_or(sup.backoff_max_ms, defaults.backoff_max),
            max_restarts: sup.max_restarts.unwrap_or(defaults.max_restarts),
            restart_window: secs_or(sup.restart_window_secs, defaults.restart_window),
            restart_jitter: ms_or(sup.restart_jitter_ms, defaults.restart_jitter),
            stop_grace: ms_or(sup.stop_grace_ms, defaults.stop_grace),
            health_log_interval: secs_or(sup.health_log_secs, defaults.health_log_interval),
        };

        let store_file = file.store.unwrap_or_default();
        let store = StoreSettings {
            db_path: store_file
                .db_path
                .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            visual_dir: store_file.visual_dir,
            visual_keep: store_file.visual_keep.unwrap_or(DEFAULT_VISUAL_KEEP),
            history_retention: Duration::from_secs(
                store_file
                    .history_retention_secs
                    .unwrap_or(DEFAULT_HISTORY_RETENTION_SECS),
            ),
            jpeg_quality: store_file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
        };

        Self {
            source,
            catalog_path,
            detection,
            supervisor,
            store,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(uri) = env_nonempty("SHELF_SOURCE") {
            self.source.uri = uri;
        }
        if let Some(path) = env_nonempty("SHELF_CATALOG") {
            self.catalog_path = PathBuf::from(path);
        }
        if let Some(path) = env_nonempty("SHELF_DB_PATH") {
            self.store.db_path = path;
        }
        if let Some(dir) = env_nonempty("SHELF_VISUAL_DIR") {
            self.store.visual_dir = Some(PathBuf::from(dir));
        }
        if let Some(backend) = env_nonempty("SHELF_BACKEND") {
            self.detection.backend = backend;
        }
        if let Some(cycle) = env_nonempty("SHELF_CYCLE_MS") {
            let millis: u64 = cycle
                .parse()
                .map_err(|_| anyhow!("SHELF_CYCLE_MS must be an integer number of milliseconds"))?;
            self.supervisor.cycle_period = Duration::from_millis(millis);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.uri.trim().is_empty() {
            return Err(anyhow!("source uri must not be empty"));
        }
        if self.catalog_path.as_os_str().is_empty() {
            return Err(anyhow!("catalog path must not be empty"));
        }
        if self.detection.backend.trim().is_empty() {
            return Err(anyhow!("detection backend must not be empty"));
        }
        let iou = self.detection.iou_threshold;
        if !(0.0..1.0).contains(&iou) {
            return Err(anyhow!("iou threshold must be in [0, 1), got {}", iou));
        }
        if self.detection.deadline.is_zero() {
            return Err(anyhow!("detection deadline must be greater than zero"));
        }
        if self.detection.backend == "tract" && self.detection.model_path.is_none() {
            return Err(anyhow!("the tract backend needs detection.model_path"));
        }
        self.supervisor
            .validate()
            .map_err(|e| anyhow!("invalid supervisor settings: {}", e))?;
        if self.store.db_path.trim().is_empty() {
            return Err(anyhow!("store db_path must not be empty"));
        }
        if !(1..=100).contains(&self.store.jpeg_quality) {
            return Err(anyhow!("jpeg quality must be in 1..=100"));
        }
        if self.store.history_retention.is_zero() {
            return Err(anyhow!("history retention must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<ShelfConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn ms_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

fn secs_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_secs).unwrap_or(default)
}
