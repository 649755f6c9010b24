use std::path::Path;

use log::debug;
use ndarray::{s, Array1, Array2};
use rand::Rng;

use crate::{
    checkpoint::{self, CheckpointData},
    data::Batch,
    device::Device,
    error::{Result, TrainErr},
    model::siren::{Siren, SirenSpec},
    optimization::Adam,
};

/// Forward-pass output: one predicted photo-electron spectrum per track.
#[derive(Debug, Clone)]
pub struct TrackOutput {
    pub pe_v: Array2<f32>,
}

/// The trainable model: a coordinate network over charge points, followed
/// by a charge-weighted segment sum that folds per-point visibilities into
/// per-track spectra.
///
/// Parameters and gradients live in flat buffers keyed by the network's
/// layout, so the optimizer walks them without knowing the architecture.
pub struct TrackModel {
    net: Siren,
    params: Vec<f32>,
    grads: Vec<f32>,
    device: Device,

    // forward metadata consumed by the backward scatter
    charges: Array1<f32>,
    charge_csum: Vec<usize>,
}

impl TrackModel {
    /// Builds the model with freshly initialized parameters drawn from
    /// `rng`.
    pub fn new<R: Rng>(spec: SirenSpec, rng: &mut R) -> Self {
        let net = Siren::new(spec);
        let mut params = vec![0.0; net.num_params()];
        net.init_params(&mut params, rng);
        let grads = vec![0.0; params.len()];

        Self {
            net,
            params,
            grads,
            device: Device::Cpu,
            charges: Array1::zeros(0),
            charge_csum: Vec::new(),
        }
    }

    #[inline]
    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    #[inline]
    pub fn params(&self) -> &[f32] {
        &self.params
    }

    #[inline]
    pub fn grads(&self) -> &[f32] {
        &self.grads
    }

    /// Mutable parameters with their matching gradients, for the update
    /// step.
    #[inline]
    pub fn params_and_grads(&mut self) -> (&mut [f32], &[f32]) {
        (&mut self.params, &self.grads)
    }

    /// Clears the gradient buffer ahead of a fresh backward pass.
    #[inline]
    pub fn zero_grad(&mut self) {
        self.grads.fill(0.0);
    }

    /// Moves the model to `device` (cpu buffers stay put; the marker flips
    /// so co-location stays checkable).
    pub fn to_device(&mut self, device: Device) {
        self.device = device;
    }

    /// Predicts the photo-electron spectrum of every track in `batch`.
    ///
    /// # Panics
    /// If the batch and the model sit on different devices.
    pub fn forward(&mut self, batch: &Batch) -> TrackOutput {
        assert_eq!(
            batch.device(),
            self.device,
            "batch and model must be co-located"
        );

        // charge points live in the unit cube; the network wants [-1, 1]
        let xyz = batch.qpt_v.slice(s![.., 0..3]).mapv(|v| 2.0 * v - 1.0);
        let q = batch.qpt_v.column(3).to_owned();

        let vis = self.net.forward(&self.params, xyz);

        let mut pe_v = Array2::zeros((batch.len(), vis.ncols()));
        for (track, span) in batch.charge_csum.windows(2).enumerate() {
            for p in span[0]..span[1] {
                let qp = q[p];
                pe_v.row_mut(track)
                    .zip_mut_with(&vis.row(p), |acc, &v| *acc += qp * v);
            }
        }

        self.charges = q;
        self.charge_csum.clone_from(&batch.charge_csum);
        TrackOutput { pe_v }
    }

    /// Scatters the spectrum gradient back onto the charge points of the
    /// last forward pass and backpropagates it into the parameter
    /// gradients. Coordinate gradients are discarded; positions are fixed.
    ///
    /// # Panics
    /// If `d_pe` does not cover the tracks of the last forward pass.
    pub fn backward(&mut self, d_pe: Array2<f32>) {
        assert_eq!(
            d_pe.nrows() + 1,
            self.charge_csum.len(),
            "gradient must match the tracks of the last forward pass"
        );

        let mut d_vis = Array2::zeros((self.charges.len(), d_pe.ncols()));
        for (track, span) in self.charge_csum.windows(2).enumerate() {
            for p in span[0]..span[1] {
                let qp = self.charges[p];
                d_vis
                    .row_mut(p)
                    .zip_mut_with(&d_pe.row(track), |d, &g| *d = qp * g);
            }
        }

        self.net.backward(&self.params, &mut self.grads, d_vis);
    }

    /// Writes parameters, optimizer state and the fractional epoch marker
    /// `count` to `path`.
    pub fn save_state(&self, path: &Path, opt: &Adam, count: f64) -> Result<()> {
        checkpoint::write(path, &self.params, opt, count)?;
        debug!(count = count; "wrote checkpoint {}", path.display());
        Ok(())
    }

    /// Overwrites the parameters with the payload's.
    pub fn restore_state(&mut self, data: &CheckpointData) -> Result<()> {
        if data.params.len() != self.params.len() {
            return Err(TrainErr::Shape {
                a: "checkpoint params",
                b: "model params",
                got: data.params.len(),
                expected: self.params.len(),
            });
        }
        self.params.copy_from_slice(&data.params);
        Ok(())
    }
}
