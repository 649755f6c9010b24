use anyhow::Context;
use log::info;

use siren_train::{Config, Trainer};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        anyhow::bail!("usage: {} <config.yaml|config.json>", args[0]);
    }

    let cfg = Config::from_path(&args[1]).with_context(|| format!("loading config {}", args[1]))?;
    let mut trainer = Trainer::new(cfg).context("building trainer")?;

    info!("starting training run with config {}", args[1]);
    trainer.train().context("training run failed")?;

    let state = trainer.state();
    info!(iteration = state.iteration, epoch = state.epoch; "run finished");
    Ok(())
}
