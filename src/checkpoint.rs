//! Checkpoint payloads and the filename contract.
//!
//! A checkpoint couples a safetensors payload (flat parameters plus
//! optimizer moments and scalar metadata) with a filename that encodes the
//! progress counters. The counters live in the name on purpose: resuming
//! parses them back out of `iteration-%06d-epoch-%04d.ckpt` instead of
//! trusting anything inside the payload.

use std::{collections::HashMap, fmt, fs, path::Path};

use safetensors::{
    serialize_to_file,
    tensor::{Dtype, TensorView},
    SafeTensorError, SafeTensors,
};

use crate::{
    error::{Result, TrainErr},
    optimization::Adam,
};

const PARAMS: &str = "params";
const OPT_M: &str = "opt.m";
const OPT_V: &str = "opt.v";

/// Everything a payload restores: flat model parameters, Adam moments and
/// the scalar metadata written next to them.
#[derive(Debug, Clone)]
pub struct CheckpointData {
    pub params: Vec<f32>,
    pub opt_m: Vec<f32>,
    pub opt_v: Vec<f32>,

    /// Fractional epoch marker recorded at save time. Informational only;
    /// resume counters come from the filename.
    pub epoch_count: f64,

    pub beta1_t: f32,
    pub beta2_t: f32,
    pub lr: f32,
}

/// Renders the canonical checkpoint filename for a pair of counters.
pub fn checkpoint_name(iteration: u64, epoch: u64) -> String {
    format!("iteration-{iteration:06}-epoch-{epoch:04}.ckpt")
}

/// Parses `(iteration, epoch)` back out of a checkpoint path.
///
/// Only the file-name component is inspected and it must match the
/// canonical pattern exactly; anything else is a [`TrainErr::CkptName`].
pub fn parse_checkpoint_name(path: &Path) -> Result<(u64, u64)> {
    let err = || TrainErr::CkptName {
        name: path.display().to_string(),
    };

    let name = path.file_name().and_then(|n| n.to_str()).ok_or_else(err)?;
    let rest = name.strip_prefix("iteration-").ok_or_else(err)?;
    let rest = rest.strip_suffix(".ckpt").ok_or_else(err)?;
    let (iteration, epoch) = rest.split_once("-epoch-").ok_or_else(err)?;

    for digits in [iteration, epoch] {
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
    }

    Ok((
        iteration.parse().map_err(|_| err())?,
        epoch.parse().map_err(|_| err())?,
    ))
}

fn payload_err(path: &Path, what: impl fmt::Display) -> TrainErr {
    TrainErr::Ckpt {
        path: path.to_path_buf(),
        what: what.to_string(),
    }
}

fn io_or_payload_err(path: &Path, e: SafeTensorError) -> TrainErr {
    match e {
        SafeTensorError::IoError(io) => TrainErr::Io(io),
        other => payload_err(path, other),
    }
}

/// Writes a payload for the given parameters and optimizer to `path`.
pub fn write(path: &Path, params: &[f32], opt: &Adam, count: f64) -> Result<()> {
    let (m, v) = opt.moments();
    if m.len() != params.len() {
        return Err(TrainErr::Shape {
            a: "optimizer moments",
            b: "parameters",
            got: m.len(),
            expected: params.len(),
        });
    }

    let (beta1_t, beta2_t) = opt.beta_powers();
    let metadata = HashMap::from([
        ("epoch_count".to_string(), count.to_string()),
        ("beta1_t".to_string(), beta1_t.to_string()),
        ("beta2_t".to_string(), beta2_t.to_string()),
        ("lr".to_string(), opt.lr().to_string()),
    ]);

    let views = vec![
        (PARAMS, f32_view(path, params)?),
        (OPT_M, f32_view(path, m)?),
        (OPT_V, f32_view(path, v)?),
    ];

    serialize_to_file(views, &Some(metadata), path).map_err(|e| io_or_payload_err(path, e))
}

/// Reads a payload back. Missing tensors, wrong dtypes and absent or
/// non-numeric metadata are all [`TrainErr::Ckpt`].
pub fn read(path: &Path) -> Result<CheckpointData> {
    let buf = fs::read(path)?;

    let (_, header) = SafeTensors::read_metadata(&buf).map_err(|e| payload_err(path, e))?;
    let metadata = header
        .metadata()
        .as_ref()
        .ok_or_else(|| payload_err(path, "payload carries no metadata"))?;
    let epoch_count: f64 = metadata_field(path, metadata, "epoch_count")?;
    let beta1_t: f32 = metadata_field(path, metadata, "beta1_t")?;
    let beta2_t: f32 = metadata_field(path, metadata, "beta2_t")?;
    let lr: f32 = metadata_field(path, metadata, "lr")?;

    let st = SafeTensors::deserialize(&buf).map_err(|e| payload_err(path, e))?;
    let params = f32_tensor(path, &st, PARAMS)?;
    let opt_m = f32_tensor(path, &st, OPT_M)?;
    let opt_v = f32_tensor(path, &st, OPT_V)?;
    if opt_m.len() != params.len() || opt_v.len() != params.len() {
        return Err(payload_err(path, "moment buffers do not match params"));
    }

    Ok(CheckpointData {
        params,
        opt_m,
        opt_v,
        epoch_count,
        beta1_t,
        beta2_t,
        lr,
    })
}

fn f32_view<'a>(path: &Path, data: &'a [f32]) -> Result<TensorView<'a>> {
    TensorView::new(Dtype::F32, vec![data.len()], bytemuck::cast_slice(data))
        .map_err(|e| payload_err(path, e))
}

fn f32_tensor(path: &Path, st: &SafeTensors, name: &str) -> Result<Vec<f32>> {
    let view = st.tensor(name).map_err(|e| payload_err(path, e))?;
    if view.dtype() != Dtype::F32 {
        return Err(payload_err(path, format!("tensor {name} is not F32")));
    }
    Ok(bytemuck::pod_collect_to_vec(view.data()))
}

fn metadata_field<T: std::str::FromStr>(
    path: &Path,
    metadata: &HashMap<String, String>,
    key: &str,
) -> Result<T> {
    metadata
        .get(key)
        .ok_or_else(|| payload_err(path, format!("missing metadata key {key:?}")))?
        .parse()
        .map_err(|_| payload_err(path, format!("metadata key {key:?} is not numeric")))
}
