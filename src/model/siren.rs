use std::ops::Range;

use ndarray::{linalg, prelude::*};
use rand::Rng;
use serde::Deserialize;

use crate::error::{Result, TrainErr};

/// Architecture of the coordinate network (`model.siren` namespace).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SirenSpec {
    pub in_features: usize,
    pub hidden_features: usize,
    pub hidden_layers: usize,
    pub out_features: usize,

    /// Sine frequency of the hidden layers.
    pub w0: f32,

    /// Sine frequency of the first layer.
    pub w0_first: f32,
}

impl Default for SirenSpec {
    fn default() -> Self {
        Self {
            in_features: 3,
            hidden_features: 64,
            hidden_layers: 3,
            out_features: 32,
            w0: 30.0,
            w0_first: 30.0,
        }
    }
}

impl SirenSpec {
    /// Per-layer `(fan_in, fan_out)` pairs, input to output.
    pub fn dims(&self) -> Vec<(usize, usize)> {
        let mut dims = Vec::with_capacity(self.hidden_layers + 2);
        dims.push((self.in_features, self.hidden_features));
        for _ in 0..self.hidden_layers {
            dims.push((self.hidden_features, self.hidden_features));
        }
        dims.push((self.hidden_features, self.out_features));
        dims
    }

    pub fn num_params(&self) -> usize {
        self.dims().iter().map(|&(n, m)| (n + 1) * m).sum()
    }

    pub fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("in_features", self.in_features),
            ("hidden_features", self.hidden_features),
            ("out_features", self.out_features),
        ] {
            if v == 0 {
                return Err(TrainErr::Config {
                    what: format!("model.siren.{name} must be > 0"),
                });
            }
        }
        for (name, w) in [("w0", self.w0), ("w0_first", self.w0_first)] {
            if !(w.is_finite() && w > 0.0) {
                return Err(TrainErr::Config {
                    what: format!("model.siren.{name} must be positive, got {w}"),
                });
            }
        }
        Ok(())
    }
}

/// The activations the network composes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    Sine { w0: f32 },
    Softplus,
}

impl Activation {
    pub fn f(&self, z: f32) -> f32 {
        match self {
            Activation::Sine { w0 } => (w0 * z).sin(),
            Activation::Softplus => z.max(0.0) + (-z.abs()).exp().ln_1p(),
        }
    }

    pub fn df(&self, z: f32) -> f32 {
        match self {
            Activation::Sine { w0 } => w0 * (w0 * z).cos(),
            Activation::Softplus => 1.0 / (1.0 + (-z).exp()),
        }
    }
}

/// Named slices of one layer inside the flat parameter buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerLayout {
    pub w: Range<usize>,
    pub b: Range<usize>,
}

impl LayerLayout {
    /// The layer's full extent, weights then biases.
    #[inline]
    pub fn span(&self) -> Range<usize> {
        self.w.start..self.b.end
    }
}

/// Maps the flat parameter buffer into named per-layer tensors.
/// This is the core "offsets + shapes" mechanism shared with the optimizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamLayout {
    layers: Vec<LayerLayout>,
}

impl ParamLayout {
    pub fn new(dims: &[(usize, usize)]) -> Self {
        let mut layers = Vec::with_capacity(dims.len());
        let mut offset = 0;
        for &(n, m) in dims {
            let w = offset..offset + n * m;
            let b = w.end..w.end + m;
            offset = b.end;
            layers.push(LayerLayout { w, b });
        }
        Self { layers }
    }

    #[inline]
    pub fn num_params(&self) -> usize {
        self.layers.last().map_or(0, |l| l.b.end)
    }

    #[inline]
    pub fn ranges(&self) -> &[LayerLayout] {
        &self.layers
    }

    /// Sanity check: ranges must be non-empty, contiguous and cover the
    /// whole buffer.
    pub fn validate(&self, total_params: usize) {
        let mut expected = 0;
        for (i, l) in self.layers.iter().enumerate() {
            assert!(l.w.start < l.w.end, "layer {i} w range must be non-empty");
            assert!(l.b.start < l.b.end, "layer {i} b range must be non-empty");
            assert_eq!(
                l.w.start, expected,
                "layer {i} must start where the previous layer ended"
            );
            assert_eq!(l.w.end, l.b.start, "layer {i} b must follow w");
            expected = l.b.end;
        }
        assert_eq!(expected, total_params, "layout must cover the whole buffer");
    }
}

/// One dense layer viewed over the flat buffer, activation fused.
#[derive(Debug, Clone)]
pub struct SirenLayer {
    dim: (usize, usize),
    act: Activation,
    size: usize,

    // Forward metadata for the backward pass
    x: Array2<f32>,
    z: Array2<f32>,
}

impl SirenLayer {
    pub fn new(dim: (usize, usize), act: Activation) -> Self {
        let zeros = Array2::zeros((0, 0));
        Self {
            dim,
            act,
            size: (dim.0 + 1) * dim.1,
            x: zeros.clone(),
            z: zeros,
        }
    }

    /// The amount of parameters this layer has.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn forward(&mut self, params: &[f32], x: Array2<f32>) -> Array2<f32> {
        let (w, b) = self.view_params(params);

        let mut z = Array2::zeros((x.nrows(), self.dim.1));
        linalg::general_mat_mul(1.0, &x, &w, 0.0, &mut z);
        z += &b;

        let act = self.act;
        let a = z.mapv(|v| act.f(v));

        self.x = x;
        self.z = z;
        a
    }

    /// Consumes this layer's output gradient, writes the layer's slice of
    /// `grad`, and returns the gradient flowing into the previous layer.
    pub fn backward(&mut self, params: &[f32], grad: &mut [f32], mut d: Array2<f32>) -> Array2<f32> {
        let act = self.act;
        d.zip_mut_with(&self.z, |d, &z| *d *= act.df(z));

        let (mut dw, mut db) = self.view_grad(grad);
        linalg::general_mat_mul(1.0, &self.x.t(), &d, 0.0, &mut dw);
        db.assign(&d.sum_axis(Axis(0)));

        let (w, _) = self.view_params(params);
        let mut d_prev = Array2::zeros((d.nrows(), self.dim.0));
        linalg::general_mat_mul(1.0, &d, &w.t(), 0.0, &mut d_prev);
        d_prev
    }

    /// Gives a view of the raw parameter slice as this layer's weights and
    /// biases.
    fn view_params<'a>(&self, params: &'a [f32]) -> (ArrayView2<'a, f32>, ArrayView1<'a, f32>) {
        let w_size = self.size - self.dim.1;
        let weights = ArrayView2::from_shape(self.dim, &params[..w_size]).unwrap();
        let biases = ArrayView1::from_shape(self.dim.1, &params[w_size..]).unwrap();
        (weights, biases)
    }

    /// Same split over the raw gradient slice.
    fn view_grad<'a>(&self, grad: &'a mut [f32]) -> (ArrayViewMut2<'a, f32>, ArrayViewMut1<'a, f32>) {
        let w_size = self.size - self.dim.1;
        let (dw_raw, db_raw) = grad.split_at_mut(w_size);
        let dw = ArrayViewMut2::from_shape(self.dim, dw_raw).unwrap();
        let db = ArrayViewMut1::from_shape(self.dim.1, db_raw).unwrap();
        (dw, db)
    }
}

/// The coordinate network: sine hidden layers, softplus output so predicted
/// visibilities stay strictly positive. All parameters live in one flat
/// buffer shared with the optimizer.
#[derive(Debug, Clone)]
pub struct Siren {
    spec: SirenSpec,
    layout: ParamLayout,
    layers: Vec<SirenLayer>,
}

impl Siren {
    pub fn new(spec: SirenSpec) -> Self {
        let dims = spec.dims();
        let layout = ParamLayout::new(&dims);
        let last = dims.len() - 1;

        let layers = dims
            .iter()
            .enumerate()
            .map(|(i, &dim)| {
                let act = if i == last {
                    Activation::Softplus
                } else if i == 0 {
                    Activation::Sine { w0: spec.w0_first }
                } else {
                    Activation::Sine { w0: spec.w0 }
                };
                SirenLayer::new(dim, act)
            })
            .collect();

        let net = Self {
            spec,
            layout,
            layers,
        };
        net.layout.validate(net.num_params());
        net
    }

    #[inline]
    pub fn spec(&self) -> &SirenSpec {
        &self.spec
    }

    #[inline]
    pub fn num_params(&self) -> usize {
        self.layout.num_params()
    }

    /// Sine-aware uniform init: the first layer draws from
    /// `U(-1/fan_in, 1/fan_in)`, every later layer from
    /// `U(-sqrt(6/fan_in)/w0, sqrt(6/fan_in)/w0)`.
    pub fn init_params<R: Rng>(&self, params: &mut [f32], rng: &mut R) {
        assert_eq!(params.len(), self.num_params());

        for (i, (layer, l)) in self.layers.iter().zip(self.layout.ranges()).enumerate() {
            let fan_in = layer.dim.0 as f32;
            let bound = if i == 0 {
                1.0 / fan_in
            } else {
                (6.0 / fan_in).sqrt() / self.spec.w0
            };
            for p in &mut params[l.span()] {
                *p = rng.random_range(-bound..bound);
            }
        }
    }

    /// Maps coordinates `[n, in_features]` to activations
    /// `[n, out_features]`, caching what the backward pass needs.
    pub fn forward(&mut self, params: &[f32], x: Array2<f32>) -> Array2<f32> {
        let mut x = x;
        for (layer, l) in self.layers.iter_mut().zip(self.layout.ranges()) {
            x = layer.forward(&params[l.span()], x);
        }
        x
    }

    /// Backpropagates `d_out` through the cached forward pass, writing
    /// parameter gradients into `grad`. Returns the input gradient.
    pub fn backward(&mut self, params: &[f32], grad: &mut [f32], d_out: Array2<f32>) -> Array2<f32> {
        let mut d = d_out;
        for (layer, l) in self.layers.iter_mut().zip(self.layout.ranges()).rev() {
            d = layer.backward(&params[l.span()], &mut grad[l.span()], d);
        }
        d
    }
}
