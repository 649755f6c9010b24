use crate::{
    config::SchedulerConfig,
    error::{Result, TrainErr},
    optimization::Adam,
};

/// Learning-rate schedule stepped once per validation pass with the
/// validation loss as its metric.
#[derive(Debug, Clone)]
pub enum LrScheduler {
    /// Multiplies the rate by `factor` once the metric has gone `patience`
    /// steps without improving by a relative `threshold`, floored at
    /// `min_lr`, then rests for `cooldown` steps.
    ReduceOnPlateau {
        factor: f32,
        patience: u32,
        threshold: f32,
        cooldown: u32,
        min_lr: f32,
        best: f32,
        num_bad: u32,
        cooldown_left: u32,
    },
    /// Multiplies the rate by `gamma` on every step; the metric is ignored.
    Exponential { gamma: f32 },
}

impl LrScheduler {
    /// Resolves a scheduler kind by name. `"plateau"` and `"exponential"`
    /// are the supported kinds; anything else is a configuration error.
    pub fn from_config(cfg: &SchedulerConfig) -> Result<Self> {
        let p = &cfg.parameters;
        match cfg.name.as_str() {
            "plateau" => {
                if !(p.factor > 0.0 && p.factor < 1.0) {
                    return Err(TrainErr::Config {
                        what: format!(
                            "lr_scheduler.parameters.factor must be in (0, 1), got {}",
                            p.factor
                        ),
                    });
                }
                if !(p.threshold.is_finite() && p.threshold >= 0.0) {
                    return Err(TrainErr::Config {
                        what: format!(
                            "lr_scheduler.parameters.threshold must be >= 0, got {}",
                            p.threshold
                        ),
                    });
                }
                if !(p.min_lr.is_finite() && p.min_lr >= 0.0) {
                    return Err(TrainErr::Config {
                        what: format!(
                            "lr_scheduler.parameters.min_lr must be >= 0, got {}",
                            p.min_lr
                        ),
                    });
                }
                Ok(Self::ReduceOnPlateau {
                    factor: p.factor,
                    patience: p.patience,
                    threshold: p.threshold,
                    cooldown: p.cooldown,
                    min_lr: p.min_lr,
                    best: f32::INFINITY,
                    num_bad: 0,
                    cooldown_left: 0,
                })
            }
            "exponential" => {
                if !(p.gamma > 0.0 && p.gamma <= 1.0) {
                    return Err(TrainErr::Config {
                        what: format!(
                            "lr_scheduler.parameters.gamma must be in (0, 1], got {}",
                            p.gamma
                        ),
                    });
                }
                Ok(Self::Exponential { gamma: p.gamma })
            }
            other => Err(TrainErr::Config {
                what: format!(
                    "unknown lr_scheduler.name {other:?} (supported: \"plateau\", \"exponential\")"
                ),
            }),
        }
    }

    /// Advances the schedule by one step. The scheduler decides internally
    /// whether to touch the optimizer's learning rate.
    pub fn step(&mut self, metric: f32, opt: &mut Adam) {
        match self {
            Self::ReduceOnPlateau {
                factor,
                patience,
                threshold,
                cooldown,
                min_lr,
                best,
                num_bad,
                cooldown_left,
            } => {
                // NaN metrics never count as an improvement
                if metric < *best * (1.0 - *threshold) {
                    *best = metric;
                    *num_bad = 0;
                } else {
                    *num_bad += 1;
                }

                if *cooldown_left > 0 {
                    *cooldown_left -= 1;
                    *num_bad = 0;
                }

                if *num_bad > *patience {
                    opt.set_lr((opt.lr() * *factor).max(*min_lr));
                    *cooldown_left = *cooldown;
                    *num_bad = 0;
                }
            }
            Self::Exponential { gamma } => {
                opt.set_lr(opt.lr() * *gamma);
            }
        }
    }
}
