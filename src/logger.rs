//! Metric logging for one training run.
//!
//! Everything a run emits lands in one directory: the per-batch metric log
//! (CSV, one row per training batch), periodic spectrum snapshots, and the
//! checkpoints the trainer writes next to them.

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::debug;
use ndarray::Array2;

use crate::{config::LoggerConfig, error::Result};

/// Metric columns, in row order. `val_loss` carries the most recent
/// validation result and is NaN until the first validation pass.
pub const METRIC_COLS: [&str; 7] = ["iter", "epoch", "loss", "val_loss", "lr", "ttrain", "twait"];

/// CSV-backed metric logger rooted at the run directory.
///
/// The first [`record`] fixes the header; every later record must present
/// the same columns. [`close`] flushes and seals the log; dropping an
/// unclosed logger flushes best-effort.
///
/// [`record`]: CsvLogger::record
/// [`close`]: CsvLogger::close
pub struct CsvLogger {
    dir: PathBuf,
    writer: csv::Writer<fs::File>,
    header: Option<Vec<String>>,
    snapshot_every: i64,
    closed: bool,
}

impl CsvLogger {
    /// Creates the run directory and opens the metric log inside it.
    pub fn from_config(cfg: &LoggerConfig) -> Result<Self> {
        fs::create_dir_all(&cfg.dir_name)?;
        let path = cfg.dir_name.join(&cfg.file_name);
        let writer = csv::Writer::from_path(&path)?;
        debug!("opened metric log at {}", path.display());

        Ok(Self {
            dir: cfg.dir_name.clone(),
            writer,
            header: None,
            snapshot_every: cfg.snapshot_every,
            closed: false,
        })
    }

    /// The run directory metric log, snapshots and checkpoints live in.
    #[inline]
    pub fn log_dir(&self) -> &Path {
        &self.dir
    }

    /// Appends one metric row.
    ///
    /// # Panics
    /// If `cols` and `vals` disagree in length, the columns differ from the
    /// first record's, or the logger is already closed.
    pub fn record(&mut self, cols: &[&str], vals: &[f64]) -> Result<()> {
        assert!(!self.closed, "logger is closed");
        assert_eq!(cols.len(), vals.len(), "columns and values must pair up");

        match &self.header {
            None => {
                self.writer.write_record(cols)?;
                self.header = Some(cols.iter().map(|c| c.to_string()).collect());
            }
            Some(header) => {
                assert!(
                    header.iter().map(String::as_str).eq(cols.iter().copied()),
                    "record columns must match the header"
                );
            }
        }

        let row: Vec<String> = vals.iter().map(|v| v.to_string()).collect();
        self.writer.write_record(&row)?;
        Ok(())
    }

    /// Spectrum snapshot hook, called once per training batch and keyed by
    /// `iteration`. Writes target and predicted spectra side by side when
    /// the cadence hits; a no-op otherwise.
    pub fn step(&mut self, iteration: u64, target: &Array2<f32>, pred: &Array2<f32>) -> Result<()> {
        if self.snapshot_every <= 0 || iteration % self.snapshot_every as u64 != 0 {
            return Ok(());
        }

        let path = self.dir.join(format!("spectrum-iteration-{iteration:06}.csv"));
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(["track", "channel", "target", "pred"])?;
        for (track, (t_row, p_row)) in target.rows().into_iter().zip(pred.rows()).enumerate() {
            for (channel, (&t, &p)) in t_row.iter().zip(p_row.iter()).enumerate() {
                writer.write_record(&[
                    track.to_string(),
                    channel.to_string(),
                    t.to_string(),
                    p.to_string(),
                ])?;
            }
        }
        writer.flush()?;

        debug!(iteration = iteration; "wrote spectrum snapshot");
        Ok(())
    }

    /// Pushes buffered rows to disk without closing the log.
    pub fn write(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes and seals the log. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.writer.flush()?;
            self.closed = true;
        }
        Ok(())
    }
}

impl Drop for CsvLogger {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.writer.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn logger_in(dir: &Path, snapshot_every: i64) -> CsvLogger {
        CsvLogger::from_config(&LoggerConfig {
            dir_name: dir.join("run"),
            file_name: "log.csv".into(),
            snapshot_every,
        })
        .unwrap()
    }

    fn read_rows(path: &Path) -> Vec<Vec<String>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(path)
            .unwrap();
        reader
            .records()
            .map(|r| r.unwrap().iter().map(str::to_string).collect())
            .collect()
    }

    #[test]
    fn creates_the_run_directory() {
        let dir = tempfile::tempdir().unwrap();
        let logger = logger_in(dir.path(), -1);
        assert!(logger.log_dir().is_dir());
        assert!(logger.log_dir().join("log.csv").exists());
    }

    #[test]
    fn writes_header_once_then_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = logger_in(dir.path(), -1);

        logger.record(&METRIC_COLS, &[1.0, 0.0, 0.5, f64::NAN, 1e-3, 0.01, 0.001]).unwrap();
        logger.record(&METRIC_COLS, &[2.0, 0.0, 0.4, 0.45, 1e-3, 0.01, 0.001]).unwrap();
        logger.close().unwrap();

        let rows = read_rows(&logger.log_dir().join("log.csv"));
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], METRIC_COLS.map(str::to_string).to_vec());
        assert_eq!(rows[1][0], "1");
        assert_eq!(rows[1][3], "NaN");
        assert_eq!(rows[2][3], "0.45");
    }

    #[test]
    #[should_panic(expected = "pair up")]
    fn mismatched_arity_panics() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = logger_in(dir.path(), -1);
        let _ = logger.record(&METRIC_COLS, &[1.0, 2.0]);
    }

    #[test]
    #[should_panic(expected = "match the header")]
    fn changing_columns_panics() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = logger_in(dir.path(), -1);
        logger.record(&["a", "b"], &[1.0, 2.0]).unwrap();
        let _ = logger.record(&["a", "c"], &[1.0, 2.0]);
    }

    #[test]
    fn snapshots_follow_the_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = logger_in(dir.path(), 2);

        let target = arr2(&[[1.0f32, 2.0]]);
        let pred = arr2(&[[0.9f32, 2.1]]);
        logger.step(1, &target, &pred).unwrap();
        logger.step(2, &target, &pred).unwrap();
        logger.step(3, &target, &pred).unwrap();

        assert!(!logger.log_dir().join("spectrum-iteration-000001.csv").exists());
        assert!(logger.log_dir().join("spectrum-iteration-000002.csv").exists());
        assert!(!logger.log_dir().join("spectrum-iteration-000003.csv").exists());

        let rows = read_rows(&logger.log_dir().join("spectrum-iteration-000002.csv"));
        // header + one row per (track, channel) pair
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1], vec!["0", "0", "1", "0.9"]);
    }

    #[test]
    fn disabled_cadence_never_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = logger_in(dir.path(), -1);

        let spectra = arr2(&[[1.0f32]]);
        for iteration in 1..=5 {
            logger.step(iteration, &spectra, &spectra).unwrap();
        }

        let snapshots = fs::read_dir(logger.log_dir())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with("spectrum-")
            })
            .count();
        assert_eq!(snapshots, 0);
    }

    #[test]
    fn write_makes_rows_visible_before_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = logger_in(dir.path(), -1);
        logger.record(&METRIC_COLS, &[1.0; 7]).unwrap();
        logger.write().unwrap();

        // readable mid-run, and the log accepts more rows afterwards
        assert_eq!(read_rows(&logger.log_dir().join("log.csv")).len(), 2);
        logger.record(&METRIC_COLS, &[2.0; 7]).unwrap();
        logger.close().unwrap();
        assert_eq!(read_rows(&logger.log_dir().join("log.csv")).len(), 3);
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = logger_in(dir.path(), -1);
        logger.record(&METRIC_COLS, &[1.0; 7]).unwrap();
        logger.close().unwrap();
        logger.close().unwrap();
    }

    #[test]
    #[should_panic(expected = "closed")]
    fn record_after_close_panics() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = logger_in(dir.path(), -1);
        logger.close().unwrap();
        let _ = logger.record(&METRIC_COLS, &[1.0; 7]);
    }

    #[test]
    fn drop_flushes_unclosed_logs() {
        let dir = tempfile::tempdir().unwrap();
        let path;
        {
            let mut logger = logger_in(dir.path(), -1);
            path = logger.log_dir().join("log.csv");
            logger.record(&METRIC_COLS, &[1.0; 7]).unwrap();
        }
        assert_eq!(read_rows(&path).len(), 2);
    }
}
