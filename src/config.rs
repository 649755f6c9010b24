//! Run configuration.
//!
//! One resolved YAML or JSON file, deserialized into a typed struct per
//! subsystem namespace and validated eagerly before anything gets built.
//! Every subsystem reads only its own namespace.

use std::{
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::{
    device::Device,
    error::{Result, TrainErr},
    model::SirenSpec,
    optimization::LrScheduler,
};

/// Top-level run configuration, one field per subsystem namespace.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub model: ModelConfig,
    pub data: DataConfig,
    pub train: TrainConfig,
    pub logger: LoggerConfig,
}

/// `device` namespace.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device token, e.g. `"cpu"`. Unset means best available.
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// `model` namespace.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub siren: SirenSpec,

    /// Checkpoint payload to restore parameters (and optimizer state) from.
    /// Also the filename the resume counters are parsed out of.
    pub ckpt_file: Option<PathBuf>,
}

/// `data` namespace.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub dataset: DatasetConfig,
    pub loader: LoaderConfig,
}

/// `data.dataset` namespace: toy-MC track generation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Number of tracks to generate.
    pub size: usize,

    /// Photon detector channels in the toy detector.
    pub n_channels: usize,

    /// Charge points sampled per track, inclusive bounds.
    pub points_min: usize,
    pub points_max: usize,

    /// Scale applied to per-point charge depositions.
    pub charge_scale: f32,

    /// Generation seed, independent of the training seed.
    pub seed: u64,

    /// Cache file; generated data is written here and reused when present.
    pub path: Option<PathBuf>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            size: 1024,
            n_channels: 32,
            points_min: 8,
            points_max: 24,
            charge_scale: 1.0,
            seed: 1,
            path: None,
        }
    }
}

/// `data.loader` namespace.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub batch_size: NonZeroUsize,
    pub shuffle: bool,
    pub drop_last: bool,

    /// Batches staged ahead by the background prefetch worker. 0 = collate
    /// inline on the training thread.
    pub prefetch: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: NonZeroUsize::new(32).unwrap(),
            shuffle: true,
            drop_last: false,
            prefetch: 0,
        }
    }
}

/// `train` namespace.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub optimizer_param: OptimizerParam,
    pub lr_scheduler: Option<SchedulerConfig>,

    /// Restore progress counters from the configured checkpoint's filename.
    pub resume: bool,

    /// Fraction of the dataset held out for validation.
    pub validation_split: f32,

    /// Seed for the shared generator driving split and shuffle order.
    pub seed: u64,

    /// Unset limits are unbounded.
    pub max_epochs: Option<u64>,
    pub max_iterations: Option<u64>,

    /// Unset means one full pass over the training loader.
    pub validate_every_iterations: Option<i64>,

    /// Sentinel <= 0 disables the periodic save.
    pub save_every_iterations: i64,
    pub save_every_epochs: i64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            optimizer_param: OptimizerParam::default(),
            lr_scheduler: None,
            resume: false,
            validation_split: 0.1,
            seed: 0,
            max_epochs: None,
            max_iterations: None,
            validate_every_iterations: None,
            save_every_iterations: -1,
            save_every_epochs: -1,
        }
    }
}

/// `train.optimizer_param` namespace (Adam hyperparameters).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OptimizerParam {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
}

impl Default for OptimizerParam {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

/// `train.lr_scheduler` namespace.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// One of the closed scheduler kinds; anything else is a config error.
    pub name: String,

    #[serde(default)]
    pub parameters: SchedulerParams,
}

/// Knobs shared by the scheduler kinds; each kind reads the fields it needs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerParams {
    pub factor: f32,
    pub patience: u32,
    pub threshold: f32,
    pub cooldown: u32,
    pub min_lr: f32,
    pub gamma: f32,
}

impl Default for SchedulerParams {
    fn default() -> Self {
        Self {
            factor: 0.1,
            patience: 10,
            threshold: 1e-4,
            cooldown: 0,
            min_lr: 0.0,
            gamma: 0.95,
        }
    }
}

/// `logger` namespace.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Run directory; metric log, snapshots and checkpoints land here.
    pub dir_name: PathBuf,

    /// Metric log file name inside the run directory.
    pub file_name: String,

    /// Spectrum snapshot cadence in iterations. Sentinel <= 0 disables.
    pub snapshot_every: i64,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            dir_name: PathBuf::from("logs"),
            file_name: "log.csv".into(),
            snapshot_every: 1000,
        }
    }
}

impl Config {
    /// Loads a configuration from a YAML (`.yaml`/`.yml`) or JSON (`.json`)
    /// file and validates it.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let cfg: Config = match ext {
            "yaml" | "yml" => {
                serde_yaml::from_str(&content).map_err(|e| TrainErr::Config {
                    what: format!("{}: {e}", path.display()),
                })?
            }
            "json" => serde_json::from_str(&content).map_err(|e| TrainErr::Config {
                what: format!("{}: {e}", path.display()),
            })?,
            other => {
                return Err(TrainErr::Config {
                    what: format!("unsupported config extension {other:?} (want yaml or json)"),
                })
            }
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Eager whole-config validation; construction refuses anything that
    /// fails here.
    pub fn validate(&self) -> Result<()> {
        if let Some(token) = &self.device.kind {
            Device::from_token(token)?;
        }

        self.model.siren.validate()?;
        if self.model.siren.in_features != 3 {
            return Err(TrainErr::Config {
                what: format!(
                    "model.siren.in_features must be 3 (x, y, z), got {}",
                    self.model.siren.in_features
                ),
            });
        }
        if self.model.siren.out_features != self.data.dataset.n_channels {
            return Err(TrainErr::Config {
                what: format!(
                    "model.siren.out_features ({}) must equal data.dataset.n_channels ({})",
                    self.model.siren.out_features, self.data.dataset.n_channels
                ),
            });
        }

        let ds = &self.data.dataset;
        if ds.size == 0 {
            return Err(TrainErr::Config {
                what: "data.dataset.size must be > 0".into(),
            });
        }
        if ds.n_channels == 0 {
            return Err(TrainErr::Config {
                what: "data.dataset.n_channels must be > 0".into(),
            });
        }
        if ds.points_min == 0 || ds.points_max < ds.points_min {
            return Err(TrainErr::Config {
                what: format!(
                    "data.dataset points range [{}, {}] must satisfy 1 <= min <= max",
                    ds.points_min, ds.points_max
                ),
            });
        }
        if !(ds.charge_scale.is_finite() && ds.charge_scale > 0.0) {
            return Err(TrainErr::Config {
                what: format!("data.dataset.charge_scale must be positive, got {}", ds.charge_scale),
            });
        }

        let opt = &self.train.optimizer_param;
        if !(opt.lr.is_finite() && opt.lr > 0.0) {
            return Err(TrainErr::Config {
                what: format!("train.optimizer_param.lr must be positive, got {}", opt.lr),
            });
        }
        for (name, beta) in [("beta1", opt.beta1), ("beta2", opt.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(TrainErr::Config {
                    what: format!("train.optimizer_param.{name} must be in [0, 1), got {beta}"),
                });
            }
        }
        if !(opt.eps.is_finite() && opt.eps > 0.0) {
            return Err(TrainErr::Config {
                what: format!("train.optimizer_param.eps must be positive, got {}", opt.eps),
            });
        }

        if !(0.0..=1.0).contains(&self.train.validation_split) {
            return Err(TrainErr::Config {
                what: format!(
                    "train.validation_split must be in [0, 1], got {}",
                    self.train.validation_split
                ),
            });
        }

        if let Some(sched) = &self.train.lr_scheduler {
            LrScheduler::from_config(sched)?;
        }

        if self.logger.file_name.is_empty() {
            return Err(TrainErr::Config {
                what: "logger.file_name must not be empty".into(),
            });
        }

        Ok(())
    }
}
