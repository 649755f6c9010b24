use ndarray::{Array2, ArrayView1, ArrayView2};

/// Rate floor that keeps `ln` away from zero predictions.
const RATE_FLOOR: f32 = 1e-8;

/// Poisson negative log-likelihood between a predicted photo-electron
/// spectrum and the observed counts, weighted per track.
///
/// For a predicted rate `lam` and observed count `k` the per-channel term
/// is `lam - k * ln(lam)`; channel terms are summed per track, scaled by
/// the track weight, and averaged over the batch.
#[derive(Default, Clone, Copy)]
pub struct PoissonMatchLoss;

impl PoissonMatchLoss {
    /// Returns a new `PoissonMatchLoss`.
    pub fn new() -> Self {
        Self
    }

    pub fn loss(
        &self,
        pred: ArrayView2<f32>,
        target: ArrayView2<f32>,
        weights: ArrayView1<f32>,
    ) -> f32 {
        assert_eq!(pred.dim(), target.dim(), "prediction and target must agree");
        assert_eq!(pred.nrows(), weights.len(), "one weight per track");

        let n = pred.nrows();
        if n == 0 {
            return 0.0;
        }

        let mut total = 0.0;
        for ((pred_row, target_row), &w) in pred
            .rows()
            .into_iter()
            .zip(target.rows())
            .zip(weights.iter())
        {
            let mut nll = 0.0;
            for (&lam, &k) in pred_row.iter().zip(target_row.iter()) {
                let lam = lam.max(RATE_FLOOR);
                nll += lam - k * lam.ln();
            }
            total += w * nll;
        }
        total / n as f32
    }

    /// Gradient of [`loss`](Self::loss) with respect to the prediction.
    pub fn loss_prime(
        &self,
        pred: ArrayView2<f32>,
        target: ArrayView2<f32>,
        weights: ArrayView1<f32>,
    ) -> Array2<f32> {
        assert_eq!(pred.dim(), target.dim(), "prediction and target must agree");
        assert_eq!(pred.nrows(), weights.len(), "one weight per track");

        let n = pred.nrows().max(1) as f32;
        Array2::from_shape_fn(pred.dim(), |(i, j)| {
            let lam = pred[(i, j)].max(RATE_FLOOR);
            weights[i] * (1.0 - target[(i, j)] / lam) / n
        })
    }
}
