use std::{fmt, fs, io, path::Path};

use log::debug;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::Poisson;
use rayon::prelude::*;
use safetensors::{
    serialize_to_file,
    tensor::{Dtype, TensorView},
    SafeTensors,
};

use crate::{
    config::DatasetConfig,
    device::Device,
    error::{Result, TrainErr},
};

/// Columns of a `qpt` row: x, y, z, deposited charge.
pub const QPT_COLS: usize = 4;

// Closed-form visibility of the toy detector: channels sit on the axis
// through the volume center, response falls off with squared distance.
const VIS_SCALE: f32 = 0.01;
const VIS_EPS: f32 = 0.01;

fn visibility(p: &[f32; 3], channel: usize, n_channels: usize) -> f32 {
    let center = [0.5f32, 0.5, (channel as f32 + 0.5) / n_channels as f32];
    let d2 = (p[0] - center[0]).powi(2) + (p[1] - center[1]).powi(2) + (p[2] - center[2]).powi(2);
    VIS_SCALE / (d2 + VIS_EPS)
}

/// One track borrowed out of the dataset: charge points and the observed
/// photo-electron spectrum.
#[derive(Debug, Clone, Copy)]
pub struct SampleRef<'a> {
    pub qpt: ArrayView2<'a, f32>,
    pub pe: ArrayView1<'a, f32>,
}

/// An owned batch of collated tracks.
///
/// `qpt_v` concatenates the charge points of every track in the batch;
/// `q_sizes` holds per-track point counts and `charge_csum` their prefix
/// sums, so `qpt_v[charge_csum[i]..charge_csum[i + 1]]` are track `i`'s
/// points. All fields live on one device for the duration of a step.
#[derive(Debug, Clone)]
pub struct Batch {
    pub qpt_v: Array2<f32>,
    pub pe_v: Array2<f32>,
    pub q_sizes: Vec<usize>,
    pub weights: Array1<f32>,
    pub charge_csum: Vec<usize>,
    device: Device,
}

impl Batch {
    /// # Panics
    /// If the five fields disagree on the track or point count.
    pub fn new(
        qpt_v: Array2<f32>,
        pe_v: Array2<f32>,
        q_sizes: Vec<usize>,
        weights: Array1<f32>,
        charge_csum: Vec<usize>,
    ) -> Self {
        let n = pe_v.nrows();
        assert!(n > 0, "batch must be non-empty");
        assert_eq!(q_sizes.len(), n, "q_sizes must have one entry per track");
        assert_eq!(weights.len(), n, "weights must have one entry per track");
        assert_eq!(
            charge_csum.len(),
            n + 1,
            "charge_csum must bracket every track"
        );
        assert_eq!(charge_csum[0], 0, "charge_csum must start at 0");
        assert_eq!(
            *charge_csum.last().unwrap(),
            qpt_v.nrows(),
            "charge_csum must cover all qpt rows"
        );
        assert_eq!(qpt_v.ncols(), QPT_COLS, "qpt rows are (x, y, z, q)");

        Self {
            qpt_v,
            pe_v,
            q_sizes,
            weights,
            charge_csum,
            device: Device::Cpu,
        }
    }

    /// Number of tracks in the batch.
    #[inline]
    pub fn len(&self) -> usize {
        self.pe_v.nrows()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pe_v.nrows() == 0
    }

    #[inline]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Moves every field to `device`. Buffer migration is the identity on
    /// cpu; the marker still flips so co-location stays checkable.
    pub fn to_device(&mut self, device: Device) {
        self.device = device;
    }
}

/// Toy-MC dataset of straight-line tracks in a unit detector volume.
///
/// Point matrices of all tracks are stored concatenated with an offset
/// table, so samples borrow without copying. Generation is deterministic
/// given the config seed: each track derives its generator from
/// `seed + index`, making the result independent of thread scheduling.
pub struct TrackDataset {
    n_channels: usize,
    qpt: Array2<f32>,
    offsets: Vec<usize>,
    pe: Array2<f32>,
}

impl fmt::Debug for TrackDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackDataset")
            .field("tracks", &self.len())
            .field("points", &self.qpt.nrows())
            .field("n_channels", &self.n_channels)
            .finish()
    }
}

struct RawTrack {
    qpt: Vec<f32>,
    pe: Vec<f32>,
}

fn generate_track(cfg: &DatasetConfig, idx: usize) -> RawTrack {
    let mut rng = StdRng::seed_from_u64(cfg.seed.wrapping_add(idx as u64));

    let p0: [f32; 3] = [rng.random(), rng.random(), rng.random()];
    let p1: [f32; 3] = [rng.random(), rng.random(), rng.random()];
    let n_pts = rng.random_range(cfg.points_min..=cfg.points_max);

    let mut qpt = Vec::with_capacity(n_pts * QPT_COLS);
    let mut lambda = vec![0.0f32; cfg.n_channels];
    for k in 0..n_pts {
        let t = (k as f32 + 0.5) / n_pts as f32;
        let p = [
            p0[0] + t * (p1[0] - p0[0]),
            p0[1] + t * (p1[1] - p0[1]),
            p0[2] + t * (p1[2] - p0[2]),
        ];
        let q = cfg.charge_scale * (0.8 + 0.4 * rng.random::<f32>());
        qpt.extend_from_slice(&[p[0], p[1], p[2], q]);

        for (c, lam) in lambda.iter_mut().enumerate() {
            *lam += q * visibility(&p, c, cfg.n_channels);
        }
    }

    let pe = lambda
        .iter()
        .map(|&lam| {
            if lam > 0.0 {
                let pois = Poisson::new(f64::from(lam)).unwrap();
                rng.sample(pois) as f32
            } else {
                0.0
            }
        })
        .collect();

    RawTrack { qpt, pe }
}

fn cache_err(path: &Path, what: impl fmt::Display) -> TrainErr {
    TrainErr::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("dataset cache {}: {what}", path.display()),
    ))
}

impl TrackDataset {
    /// Builds the dataset for `cfg`: loaded from the configured cache file
    /// when present, generated (and cached) otherwise.
    pub fn from_config(cfg: &DatasetConfig) -> Result<Self> {
        if let Some(path) = &cfg.path {
            if path.exists() {
                let ds = Self::read_cache(path, cfg.n_channels)?;
                debug!(tracks = ds.len(); "loaded dataset cache from {}", path.display());
                return Ok(ds);
            }
        }

        let ds = Self::generate(cfg);
        debug!(tracks = ds.len(), points = ds.qpt.nrows(); "generated toy tracks");

        if let Some(path) = &cfg.path {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            ds.write_cache(path)?;
        }
        Ok(ds)
    }

    /// Generates `cfg.size` tracks, one seeded generator per track.
    pub fn generate(cfg: &DatasetConfig) -> Self {
        let tracks: Vec<RawTrack> = (0..cfg.size)
            .into_par_iter()
            .map(|idx| generate_track(cfg, idx))
            .collect();

        let total_pts: usize = tracks.iter().map(|t| t.qpt.len() / QPT_COLS).sum();
        let mut qpt_flat = Vec::with_capacity(total_pts * QPT_COLS);
        let mut pe_flat = Vec::with_capacity(cfg.size * cfg.n_channels);
        let mut offsets = Vec::with_capacity(cfg.size + 1);
        offsets.push(0);

        for track in &tracks {
            qpt_flat.extend_from_slice(&track.qpt);
            pe_flat.extend_from_slice(&track.pe);
            offsets.push(offsets.last().unwrap() + track.qpt.len() / QPT_COLS);
        }

        Self {
            n_channels: cfg.n_channels,
            qpt: Array2::from_shape_vec((total_pts, QPT_COLS), qpt_flat).unwrap(),
            offsets,
            pe: Array2::from_shape_vec((cfg.size, cfg.n_channels), pe_flat).unwrap(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pe.nrows()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pe.nrows() == 0
    }

    #[inline]
    pub fn n_channels(&self) -> usize {
        self.n_channels
    }

    /// Returns the track at `idx` (panics if out of bounds).
    #[inline]
    pub fn sample(&self, idx: usize) -> SampleRef<'_> {
        let (start, end) = (self.offsets[idx], self.offsets[idx + 1]);
        SampleRef {
            qpt: self.qpt.slice(s![start..end, ..]),
            pe: self.pe.row(idx),
        }
    }

    /// Collates the tracks at `indices` into one owned batch with unit
    /// per-track weights.
    ///
    /// # Panics
    /// If `indices` is empty or any index is out of bounds.
    pub fn collate(&self, indices: &[usize]) -> Batch {
        assert!(!indices.is_empty(), "cannot collate an empty batch");

        let mut qpt_flat = Vec::new();
        let mut q_sizes = Vec::with_capacity(indices.len());
        let mut charge_csum = Vec::with_capacity(indices.len() + 1);
        charge_csum.push(0);

        let mut pe_v = Array2::zeros((indices.len(), self.n_channels));
        for (row, &idx) in indices.iter().enumerate() {
            let sample = self.sample(idx);
            qpt_flat.extend(sample.qpt.iter().copied());
            q_sizes.push(sample.qpt.nrows());
            charge_csum.push(charge_csum.last().unwrap() + sample.qpt.nrows());
            pe_v.row_mut(row).assign(&sample.pe);
        }

        let total_pts = *charge_csum.last().unwrap();
        Batch::new(
            Array2::from_shape_vec((total_pts, QPT_COLS), qpt_flat).unwrap(),
            pe_v,
            q_sizes,
            Array1::ones(indices.len()),
            charge_csum,
        )
    }

    fn write_cache(&self, path: &Path) -> Result<()> {
        let sizes: Vec<u64> = self
            .offsets
            .windows(2)
            .map(|w| (w[1] - w[0]) as u64)
            .collect();

        let qpt_bytes = bytemuck::cast_slice::<f32, u8>(self.qpt.as_slice().unwrap());
        let pe_bytes = bytemuck::cast_slice::<f32, u8>(self.pe.as_slice().unwrap());
        let size_bytes = bytemuck::cast_slice::<u64, u8>(&sizes);

        let views = vec![
            (
                "qpt",
                TensorView::new(Dtype::F32, vec![self.qpt.nrows(), QPT_COLS], qpt_bytes)
                    .map_err(|e| cache_err(path, e))?,
            ),
            (
                "pe",
                TensorView::new(Dtype::F32, vec![self.pe.nrows(), self.n_channels], pe_bytes)
                    .map_err(|e| cache_err(path, e))?,
            ),
            (
                "sizes",
                TensorView::new(Dtype::U64, vec![sizes.len()], size_bytes)
                    .map_err(|e| cache_err(path, e))?,
            ),
        ];

        serialize_to_file(views, &None, path).map_err(|e| cache_err(path, e))?;
        Ok(())
    }

    fn read_cache(path: &Path, n_channels: usize) -> Result<Self> {
        let buf = fs::read(path)?;
        let st = SafeTensors::deserialize(&buf).map_err(|e| cache_err(path, e))?;

        let qpt_view = st.tensor("qpt").map_err(|e| cache_err(path, e))?;
        let pe_view = st.tensor("pe").map_err(|e| cache_err(path, e))?;
        let sizes_view = st.tensor("sizes").map_err(|e| cache_err(path, e))?;
        for (name, view, dtype) in [
            ("qpt", &qpt_view, Dtype::F32),
            ("pe", &pe_view, Dtype::F32),
            ("sizes", &sizes_view, Dtype::U64),
        ] {
            if view.dtype() != dtype {
                return Err(cache_err(path, format!("tensor {name} is not {dtype:?}")));
            }
        }

        let pe_shape = pe_view.shape();
        if pe_shape.len() != 2 || pe_shape[1] != n_channels {
            return Err(TrainErr::Config {
                what: format!(
                    "dataset cache {} has {:?} spectra, expected {} channels",
                    path.display(),
                    pe_shape,
                    n_channels
                ),
            });
        }

        let sizes: Vec<u64> = bytemuck::pod_collect_to_vec(sizes_view.data());
        if sizes.len() != pe_shape[0] {
            return Err(cache_err(path, "sizes and pe disagree on track count"));
        }
        let mut offsets = Vec::with_capacity(sizes.len() + 1);
        offsets.push(0usize);
        for s in &sizes {
            offsets.push(offsets.last().unwrap() + *s as usize);
        }

        let qpt_shape = qpt_view.shape();
        if qpt_shape.len() != 2
            || qpt_shape[1] != QPT_COLS
            || qpt_shape[0] != *offsets.last().unwrap()
        {
            return Err(cache_err(path, "qpt shape does not cover the size table"));
        }

        let qpt_flat: Vec<f32> = bytemuck::pod_collect_to_vec(qpt_view.data());
        let pe_flat: Vec<f32> = bytemuck::pod_collect_to_vec(pe_view.data());

        Ok(Self {
            n_channels,
            qpt: Array2::from_shape_vec((qpt_shape[0], QPT_COLS), qpt_flat).unwrap(),
            offsets,
            pe: Array2::from_shape_vec((pe_shape[0], n_channels), pe_flat).unwrap(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cfg() -> DatasetConfig {
        DatasetConfig {
            size: 12,
            n_channels: 8,
            points_min: 3,
            points_max: 6,
            charge_scale: 1.0,
            seed: 5,
            path: None,
        }
    }

    #[test]
    fn generation_is_deterministic() {
        let cfg = small_cfg();
        let a = TrackDataset::generate(&cfg);
        let b = TrackDataset::generate(&cfg);
        assert_eq!(a.qpt, b.qpt);
        assert_eq!(a.pe, b.pe);
        assert_eq!(a.offsets, b.offsets);
    }

    #[test]
    fn samples_have_expected_shapes() {
        let cfg = small_cfg();
        let ds = TrackDataset::generate(&cfg);
        assert_eq!(ds.len(), 12);
        assert_eq!(ds.n_channels(), 8);

        for idx in 0..ds.len() {
            let s = ds.sample(idx);
            assert!((3..=6).contains(&s.qpt.nrows()));
            assert_eq!(s.qpt.ncols(), QPT_COLS);
            assert_eq!(s.pe.len(), 8);
        }
    }

    #[test]
    fn collate_brackets_tracks() {
        let ds = TrackDataset::generate(&small_cfg());
        let batch = ds.collate(&[0, 3, 7]);

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.q_sizes.len(), 3);
        assert_eq!(batch.charge_csum.len(), 4);
        assert_eq!(batch.charge_csum[0], 0);
        assert_eq!(*batch.charge_csum.last().unwrap(), batch.qpt_v.nrows());
        assert_eq!(batch.pe_v.nrows(), 3);
        assert_eq!(batch.weights.len(), 3);

        // collated rows match the source samples
        let s3 = ds.sample(3);
        let rows = batch.qpt_v.slice(s![batch.charge_csum[1]..batch.charge_csum[2], ..]);
        assert_eq!(rows, s3.qpt);
        assert_eq!(batch.pe_v.row(1), s3.pe);
    }

    #[test]
    fn cache_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracks.safetensors");

        let mut cfg = small_cfg();
        cfg.path = Some(path.clone());

        let generated = TrackDataset::from_config(&cfg).unwrap();
        assert!(path.exists());

        let reloaded = TrackDataset::from_config(&cfg).unwrap();
        assert_eq!(generated.qpt, reloaded.qpt);
        assert_eq!(generated.pe, reloaded.pe);
        assert_eq!(generated.offsets, reloaded.offsets);
    }

    #[test]
    fn cache_channel_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracks.safetensors");

        let mut cfg = small_cfg();
        cfg.path = Some(path.clone());
        TrackDataset::from_config(&cfg).unwrap();

        cfg.n_channels = 16;
        assert!(TrackDataset::from_config(&cfg).is_err());
    }

    #[test]
    fn device_marker_flips() {
        let ds = TrackDataset::generate(&small_cfg());
        let mut batch = ds.collate(&[1, 2]);
        assert_eq!(batch.device(), Device::Cpu);
        batch.to_device(Device::Cpu);
        assert_eq!(batch.device(), Device::Cpu);
    }
}
