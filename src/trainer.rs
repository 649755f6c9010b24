//! Resumable training orchestration.

use std::{path::Path, sync::Arc, time::Instant};

use log::{debug, info, warn};
use ndarray::Array2;
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    checkpoint,
    config::Config,
    data::{random_split, Batch, DataLoader, TrackDataset},
    device::Device,
    error::Result,
    logger::{CsvLogger, METRIC_COLS},
    loss::PoissonMatchLoss,
    model::TrackModel,
    optimization::{optimizer_factory, Adam, LrScheduler},
    state::TrainState,
};

/// Drives the training of a [`TrackModel`] end to end: batching, gradient
/// steps, periodic validation and checkpointing, and the per-batch metric
/// log.
///
/// Construction wires the subsystems in a fixed order: device, model and
/// criterion, dataset and split, loaders, optimizer, progress counters,
/// logger, learning-rate schedule, loop limits. Restoring from a
/// checkpoint runs through the same path, so a fresh run and a resumed one
/// are built identically.
pub struct Trainer {
    device: Device,
    model: TrackModel,
    criterion: PoissonMatchLoss,
    train_loader: DataLoader,
    val_loader: DataLoader,
    opt: Adam,
    state: TrainState,
    logger: CsvLogger,
    scheduler: Option<LrScheduler>,
    rng: StdRng,

    max_iterations: u64,
    max_epochs: u64,
    validate_every_iterations: i64,
    save_every_iterations: i64,
    save_every_epochs: i64,
}

impl Trainer {
    pub fn new(cfg: Config) -> Result<Self> {
        cfg.validate()?;

        let device = match &cfg.device.kind {
            Some(token) => Device::from_token(token)?,
            None => Device::best_available(),
        };
        debug!("resolved device: {device}");

        // model and criterion; parameters come out of the payload when a
        // checkpoint is named
        let payload = cfg
            .model
            .ckpt_file
            .as_deref()
            .map(checkpoint::read)
            .transpose()?;
        let mut model = TrackModel::new(
            cfg.model.siren.clone(),
            &mut StdRng::seed_from_u64(cfg.train.seed),
        );
        model.to_device(device);
        if let Some(data) = &payload {
            model.restore_state(data)?;
        }
        let criterion = PoissonMatchLoss::new();

        // seeded split; the same generator then drives every shuffle
        let dataset = Arc::new(TrackDataset::from_config(&cfg.data.dataset)?);
        let mut rng = StdRng::seed_from_u64(cfg.train.seed);
        let (train_idx, val_idx) =
            random_split(dataset.len(), cfg.train.validation_split, &mut rng);
        debug!(train = train_idx.len(), val = val_idx.len(); "split dataset");

        // validation iterates its subset in order
        let loader = &cfg.data.loader;
        let train_loader = DataLoader::new(
            Arc::clone(&dataset),
            train_idx,
            loader.batch_size.get(),
            loader.shuffle,
            loader.drop_last,
            loader.prefetch,
        );
        let val_loader = DataLoader::new(
            dataset,
            val_idx,
            loader.batch_size.get(),
            false,
            loader.drop_last,
            loader.prefetch,
        );

        let (opt, epoch_count) =
            optimizer_factory(model.num_params(), &cfg.train, payload.as_ref())?;
        if payload.is_some() {
            // informational only; progress comes from the filename below
            debug!(epoch_count = epoch_count; "checkpoint carries a fractional epoch marker");
        }

        let state = if cfg.train.resume {
            match &cfg.model.ckpt_file {
                Some(path) => {
                    let (iteration, epoch) = checkpoint::parse_checkpoint_name(path)?;
                    info!(iteration = iteration, epoch = epoch; "resuming from checkpoint");
                    TrainState::new(iteration, epoch)
                }
                None => TrainState::default(),
            }
        } else {
            TrainState::default()
        };

        let logger = CsvLogger::from_config(&cfg.logger)?;

        let scheduler = cfg
            .train
            .lr_scheduler
            .as_ref()
            .map(LrScheduler::from_config)
            .transpose()?;

        // unbounded unless configured; validation defaults to once per
        // pass over the training loader
        let max_iterations = cfg.train.max_iterations.unwrap_or(u64::MAX);
        let max_epochs = cfg.train.max_epochs.unwrap_or(u64::MAX);
        let validate_every_iterations = cfg
            .train
            .validate_every_iterations
            .unwrap_or(train_loader.batches_per_epoch() as i64);

        Ok(Self {
            device,
            model,
            criterion,
            train_loader,
            val_loader,
            opt,
            state,
            logger,
            scheduler,
            rng,
            max_iterations,
            max_epochs,
            validate_every_iterations,
            save_every_iterations: cfg.train.save_every_iterations,
            save_every_epochs: cfg.train.save_every_epochs,
        })
    }

    #[inline]
    pub fn state(&self) -> TrainState {
        self.state
    }

    #[inline]
    pub fn device(&self) -> Device {
        self.device
    }

    #[inline]
    pub fn model(&self) -> &TrackModel {
        &self.model
    }

    #[inline]
    pub fn optimizer(&self) -> &Adam {
        &self.opt
    }

    #[inline]
    pub fn train_loader(&self) -> &DataLoader {
        &self.train_loader
    }

    #[inline]
    pub fn val_loader(&self) -> &DataLoader {
        &self.val_loader
    }

    /// The run directory metrics, snapshots and checkpoints land in.
    #[inline]
    pub fn log_dir(&self) -> &Path {
        self.logger.log_dir()
    }

    /// Runs the forward pass of one batch on the trainer's device.
    ///
    /// Returns `(target, prediction, loss)`. Pure with respect to training
    /// progress: counters, parameters and optimizer state stay untouched,
    /// so calling it twice on the same batch yields the same loss.
    pub fn step(&mut self, batch: &mut Batch) -> (Array2<f32>, Array2<f32>, f32) {
        batch.to_device(self.device);

        let out = self.model.forward(batch);
        let target = batch.pe_v.clone();
        let loss = self
            .criterion
            .loss(out.pe_v.view(), target.view(), batch.weights.view());
        (target, out.pe_v, loss)
    }

    /// Mean criterion loss over the validation subset, NaN when the subset
    /// is empty. Forward passes only; nothing the training loop owns is
    /// mutated.
    pub fn validate(&mut self) -> f32 {
        let mut total = 0.0f32;
        let mut batches = 0usize;
        for mut batch in self.val_loader.epoch(&mut self.rng) {
            let (_, _, loss) = self.step(&mut batch);
            total += loss;
            batches += 1;
        }

        if batches == 0 {
            warn!("validation subset is empty, reporting NaN");
            return f32::NAN;
        }
        total / batches as f32
    }

    /// Writes a checkpoint into the run directory, named after the current
    /// counters. `count` defaults to the iteration count over the train
    /// subset's sample count.
    pub fn save(&self, count: Option<f64>) -> Result<()> {
        let count = count
            .unwrap_or_else(|| self.state.iteration as f64 / self.train_loader.subset_len() as f64);
        let name = checkpoint::checkpoint_name(self.state.iteration, self.state.epoch);
        let path = self.logger.log_dir().join(name);
        self.model.save_state(&path, &self.opt, count)
    }

    /// Runs the training loop until an iteration or epoch limit is hit,
    /// then closes the metric log. The log is closed on error exits too.
    pub fn train(&mut self) -> Result<()> {
        let outcome = self.run();
        let closed = self.logger.close();
        outcome?;
        closed
    }

    fn run(&mut self) -> Result<()> {
        info!(
            iteration = self.state.iteration,
            epoch = self.state.epoch,
            train_batches = self.train_loader.batches_per_epoch();
            "training loop entered"
        );

        let mut stop_training = false;
        let mut val_loss = f64::NAN;
        let mut twait = Instant::now();

        while self.state.iteration < self.max_iterations && self.state.epoch < self.max_epochs {
            if self.train_loader.batches_per_epoch() == 0 {
                warn!("training subset yields no batches, stopping");
                break;
            }

            for mut batch in self.train_loader.epoch(&mut self.rng) {
                self.state.inc_iteration();
                let wait_s = twait.elapsed().as_secs_f64();

                let ttrain = Instant::now();
                let (target, pred, loss) = self.step(&mut batch);

                self.model.zero_grad();
                let d_pred = self
                    .criterion
                    .loss_prime(pred.view(), target.view(), batch.weights.view());
                self.model.backward(d_pred);
                let (params, grads) = self.model.params_and_grads();
                self.opt.update_params(grads, params)?;
                let train_s = ttrain.elapsed().as_secs_f64();

                self.logger.record(
                    &METRIC_COLS,
                    &[
                        self.state.iteration as f64,
                        self.state.epoch as f64,
                        f64::from(loss),
                        val_loss,
                        f64::from(self.opt.lr()),
                        train_s,
                        wait_s,
                    ],
                )?;
                twait = Instant::now();

                self.logger.step(self.state.iteration, &target, &pred)?;

                if self.validate_every_iterations > 0
                    && self.state.iteration % self.validate_every_iterations as u64 == 0
                {
                    val_loss = f64::from(self.validate());
                    if let Some(sched) = &mut self.scheduler {
                        sched.step(val_loss as f32, &mut self.opt);
                    }
                }

                if self.save_every_iterations > 0
                    && self.state.iteration % self.save_every_iterations as u64 == 0
                {
                    self.save(None)?;
                }

                if self.state.iteration >= self.max_iterations {
                    stop_training = true;
                    break;
                }
            }

            if stop_training {
                break;
            }

            self.state.inc_epoch();

            if self.save_every_epochs > 0 && self.state.epoch % self.save_every_epochs as u64 == 0 {
                // same iterations-over-samples marker save() defaults to
                let count =
                    self.state.iteration as f64 / self.train_loader.subset_len() as f64;
                self.save(Some(count))?;
            }
        }

        info!(iteration = self.state.iteration, epoch = self.state.epoch; "stopped training");
        Ok(())
    }
}
