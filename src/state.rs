/// Progress counters for one training run.
///
/// Owned exclusively by the trainer and monotonically non-decreasing for
/// the lifetime of the instance. On resume the counters are reconstructed
/// from the checkpoint filename, never from the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrainState {
    pub iteration: u64,
    pub epoch: u64,
}

impl TrainState {
    pub fn new(iteration: u64, epoch: u64) -> Self {
        Self { iteration, epoch }
    }

    #[inline]
    pub fn inc_iteration(&mut self) {
        self.iteration += 1;
    }

    #[inline]
    pub fn inc_epoch(&mut self) {
        self.epoch += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let state = TrainState::default();
        assert_eq!(state.iteration, 0);
        assert_eq!(state.epoch, 0);
    }

    #[test]
    fn increments_are_independent() {
        let mut state = TrainState::new(123, 4);
        state.inc_iteration();
        assert_eq!((state.iteration, state.epoch), (124, 4));
        state.inc_epoch();
        assert_eq!((state.iteration, state.epoch), (124, 5));
    }
}
