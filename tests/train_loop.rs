use std::{fs, num::NonZeroUsize, path::Path};

use siren_train::{
    checkpoint,
    config::{Config, SchedulerConfig, SchedulerParams},
    data::TrackDataset,
    logger::METRIC_COLS,
    Trainer,
};

fn base_config(dir: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.data.dataset.size = 100;
    cfg.data.dataset.n_channels = 8;
    cfg.data.dataset.points_min = 2;
    cfg.data.dataset.points_max = 4;
    cfg.data.dataset.seed = 3;
    cfg.data.loader.batch_size = NonZeroUsize::new(10).unwrap();
    cfg.model.siren.out_features = 8;
    cfg.model.siren.hidden_features = 8;
    cfg.model.siren.hidden_layers = 1;
    cfg.train.validation_split = 0.2;
    cfg.train.seed = 11;
    cfg.logger.dir_name = dir.join("run");
    cfg.logger.snapshot_every = -1;
    cfg
}

fn ckpt_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".ckpt"))
        .collect();
    names.sort();
    names
}

fn metric_table(dir: &Path) -> (Vec<String>, Vec<Vec<f64>>) {
    let mut reader = csv::Reader::from_path(dir.join("log.csv")).unwrap();
    let header = reader
        .headers()
        .unwrap()
        .iter()
        .map(str::to_string)
        .collect();
    let rows = reader
        .records()
        .map(|r| {
            r.unwrap()
                .iter()
                .map(|v| v.parse::<f64>().unwrap())
                .collect()
        })
        .collect();
    (header, rows)
}

#[test]
fn split_is_deterministic_across_constructions() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = base_config(dir.path());

    let mut other = cfg.clone();
    other.logger.dir_name = dir.path().join("other");

    let a = Trainer::new(cfg).unwrap();
    let b = Trainer::new(other).unwrap();

    assert_eq!(a.train_loader().indices(), b.train_loader().indices());
    assert_eq!(a.val_loader().indices(), b.val_loader().indices());
    assert_eq!(a.model().params(), b.model().params());
}

#[test]
fn different_seeds_produce_different_splits() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = base_config(dir.path());

    let mut other = cfg.clone();
    other.logger.dir_name = dir.path().join("other");
    other.train.seed = 12;

    let a = Trainer::new(cfg).unwrap();
    let b = Trainer::new(other).unwrap();
    assert_ne!(a.train_loader().indices(), b.train_loader().indices());
}

#[test]
fn step_twice_on_one_batch_is_bit_identical() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = base_config(dir.path());
    let dataset = TrackDataset::from_config(&cfg.data.dataset).unwrap();
    let mut trainer = Trainer::new(cfg).unwrap();

    let mut batch = dataset.collate(&[0, 1, 2, 3, 4]);
    let before = trainer.state();
    let (_, pred_a, loss_a) = trainer.step(&mut batch);
    let (_, pred_b, loss_b) = trainer.step(&mut batch);

    assert_eq!(loss_a.to_bits(), loss_b.to_bits());
    assert_eq!(pred_a, pred_b);
    assert_eq!(trainer.state(), before);
}

#[test]
fn validate_leaves_training_state_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let mut trainer = Trainer::new(base_config(dir.path())).unwrap();

    let state = trainer.state();
    let params = trainer.model().params().to_vec();
    let (m, v) = trainer.optimizer().moments();
    let (m, v) = (m.to_vec(), v.to_vec());
    let lr = trainer.optimizer().lr();

    let val_loss = trainer.validate();
    assert!(val_loss.is_finite());

    assert_eq!(trainer.state(), state);
    assert_eq!(trainer.model().params(), params.as_slice());
    let (m2, v2) = trainer.optimizer().moments();
    assert_eq!(m2, m.as_slice());
    assert_eq!(v2, v.as_slice());
    assert_eq!(trainer.optimizer().lr(), lr);
}

#[test]
fn validation_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let mut trainer = Trainer::new(base_config(dir.path())).unwrap();
    let a = trainer.validate();
    let b = trainer.validate();
    assert_eq!(a.to_bits(), b.to_bits());
}

#[test]
fn stops_exactly_at_max_iterations() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = base_config(dir.path());
    cfg.train.max_iterations = Some(7);

    let mut trainer = Trainer::new(cfg).unwrap();
    trainer.train().unwrap();

    // 80 train samples in batches of 10, so the 7th batch is mid-epoch
    assert_eq!(trainer.state().iteration, 7);
    assert_eq!(trainer.state().epoch, 0);

    let (header, rows) = metric_table(trainer.log_dir());
    assert_eq!(header, METRIC_COLS.map(str::to_string).to_vec());
    assert_eq!(rows.len(), 7);
}

#[test]
fn stops_after_max_epochs() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = base_config(dir.path());
    cfg.train.max_epochs = Some(2);

    let mut trainer = Trainer::new(cfg).unwrap();
    trainer.train().unwrap();

    assert_eq!(trainer.state().epoch, 2);
    assert_eq!(trainer.state().iteration, 16);

    let (_, rows) = metric_table(trainer.log_dir());
    assert_eq!(rows.len(), 16);
    // epoch column: first pass logs 0, second logs 1
    assert!(rows[..8].iter().all(|r| r[1] == 0.0));
    assert!(rows[8..].iter().all(|r| r[1] == 1.0));
    assert!(rows.iter().all(|r| r[2].is_finite()));
}

#[test]
fn val_loss_column_carries_the_latest_validation() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = base_config(dir.path());
    cfg.train.max_iterations = Some(6);
    cfg.train.validate_every_iterations = Some(2);

    let mut trainer = Trainer::new(cfg).unwrap();
    trainer.train().unwrap();

    let (_, rows) = metric_table(trainer.log_dir());
    assert_eq!(rows.len(), 6);

    // iterations count up from one
    let iters: Vec<f64> = rows.iter().map(|r| r[0]).collect();
    assert_eq!(iters, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

    // rows before the first validation carry the NaN sentinel; later rows
    // repeat the most recent validation result
    assert!(rows[0][3].is_nan());
    assert!(rows[1][3].is_nan());
    assert!(rows[2][3].is_finite());
    assert_eq!(rows[2][3], rows[3][3]);
    assert!(rows[4][3].is_finite());
    assert_eq!(rows[4][3], rows[5][3]);
}

#[test]
fn iteration_checkpoints_land_on_cadence() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = base_config(dir.path());
    cfg.train.max_iterations = Some(12);
    cfg.train.save_every_iterations = 5;

    let mut trainer = Trainer::new(cfg).unwrap();
    trainer.train().unwrap();
    assert_eq!(trainer.state().iteration, 12);
    assert_eq!(trainer.state().epoch, 1);

    assert_eq!(
        ckpt_names(trainer.log_dir()),
        vec![
            "iteration-000005-epoch-0000.ckpt".to_string(),
            "iteration-000010-epoch-0001.ckpt".to_string(),
        ]
    );

    // the default fractional epoch marker is iterations over subset size
    let data = checkpoint::read(&trainer.log_dir().join("iteration-000010-epoch-0001.ckpt")).unwrap();
    assert_eq!(data.epoch_count, 10.0 / 80.0);
}

#[test]
fn epoch_checkpoints_use_the_incremented_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = base_config(dir.path());
    cfg.train.max_epochs = Some(2);
    cfg.train.save_every_epochs = 1;

    let mut trainer = Trainer::new(cfg).unwrap();
    trainer.train().unwrap();

    assert_eq!(
        ckpt_names(trainer.log_dir()),
        vec![
            "iteration-000008-epoch-0001.ckpt".to_string(),
            "iteration-000016-epoch-0002.ckpt".to_string(),
        ]
    );

    let data = checkpoint::read(&trainer.log_dir().join("iteration-000008-epoch-0001.ckpt")).unwrap();
    assert_eq!(data.epoch_count, 8.0 / 80.0);
}

#[test]
fn single_epoch_halt_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = base_config(dir.path());
    cfg.train.validation_split = 0.0;
    cfg.train.validate_every_iterations = Some(10);
    cfg.train.max_iterations = Some(10);
    cfg.train.save_every_iterations = -1;
    // patience 0 halves the rate on every non-improving validation, which
    // makes the number of validation passes observable
    cfg.train.lr_scheduler = Some(SchedulerConfig {
        name: "plateau".into(),
        parameters: SchedulerParams {
            factor: 0.5,
            patience: 0,
            cooldown: 0,
            ..SchedulerParams::default()
        },
    });
    let lr0 = cfg.train.optimizer_param.lr;

    let mut trainer = Trainer::new(cfg).unwrap();
    assert_eq!(trainer.val_loader().subset_len(), 0);

    trainer.train().unwrap();

    // halts after the 10th batch without finishing the epoch
    assert_eq!(trainer.state().iteration, 10);
    assert_eq!(trainer.state().epoch, 0);

    // no checkpoints were requested
    assert!(ckpt_names(trainer.log_dir()).is_empty());

    // the empty validation subset reports NaN, so every row keeps the
    // sentinel
    let (_, rows) = metric_table(trainer.log_dir());
    assert_eq!(rows.len(), 10);
    assert!(rows.iter().all(|r| r[3].is_nan()));

    // exactly one validation pass ran: the scheduler halved the rate once
    assert_eq!(trainer.optimizer().lr(), lr0 * 0.5);
}

#[test]
fn spectrum_snapshots_follow_their_own_cadence() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = base_config(dir.path());
    cfg.train.max_iterations = Some(5);
    cfg.logger.snapshot_every = 2;

    let mut trainer = Trainer::new(cfg).unwrap();
    trainer.train().unwrap();

    for (iteration, expected) in [(1, false), (2, true), (3, false), (4, true), (5, false)] {
        let name = format!("spectrum-iteration-{iteration:06}.csv");
        assert_eq!(trainer.log_dir().join(name).exists(), expected);
    }
}

#[test]
fn training_reduces_the_loss_on_a_tiny_problem() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = base_config(dir.path());
    cfg.train.max_epochs = Some(30);
    cfg.train.optimizer_param.lr = 3e-3;

    let mut trainer = Trainer::new(cfg).unwrap();
    trainer.train().unwrap();

    let (_, rows) = metric_table(trainer.log_dir());
    let first: f64 = rows[..8].iter().map(|r| r[2]).sum::<f64>() / 8.0;
    let last: f64 = rows[rows.len() - 8..].iter().map(|r| r[2]).sum::<f64>() / 8.0;
    assert!(
        last < first,
        "mean loss should fall over 30 epochs: first {first}, last {last}"
    );
}
