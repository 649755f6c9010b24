use rand::{seq::SliceRandom, Rng};

/// Splits `0..len` into disjoint (train, validation) index sets.
///
/// The validation subset takes `round(len * val_fraction)` indices out of a
/// seeded shuffle; train keeps the rest. Exhaustive by construction, and
/// reproducible for a given generator state.
pub fn random_split<R: Rng>(
    len: usize,
    val_fraction: f32,
    rng: &mut R,
) -> (Vec<usize>, Vec<usize>) {
    let mut indices: Vec<usize> = (0..len).collect();
    indices.shuffle(rng);

    let n_val = ((len as f64) * f64::from(val_fraction)).round() as usize;
    let val = indices.split_off(len - n_val.min(len));

    (indices, val)
}
