pub mod adam;
pub mod scheduler;

pub use adam::Adam;
pub use scheduler::LrScheduler;

use crate::{checkpoint::CheckpointData, config::TrainConfig, error::Result};

/// Builds the optimizer over `num_params` parameters from the configured
/// hyperparameters, restoring its resumable state when a checkpoint payload
/// is given.
///
/// Returns the optimizer together with the payload's fractional epoch
/// marker (0 on a fresh start).
pub fn optimizer_factory(
    num_params: usize,
    cfg: &TrainConfig,
    ckpt: Option<&CheckpointData>,
) -> Result<(Adam, f64)> {
    let p = &cfg.optimizer_param;
    let mut opt = Adam::new(num_params, p.lr, p.beta1, p.beta2, p.eps);

    let mut epoch_count = 0.0;
    if let Some(data) = ckpt {
        opt.restore_state(
            &data.opt_m,
            &data.opt_v,
            (data.beta1_t, data.beta2_t),
            data.lr,
        )?;
        epoch_count = data.epoch_count;
    }

    Ok((opt, epoch_count))
}
