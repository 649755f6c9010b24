use std::fmt;

use crate::error::{Result, TrainErr};

/// The compute devices a run can be placed on.
///
/// This build is CPU-only; the enum exists so batches, model and trainer
/// can assert co-location without caring which backend is compiled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
}

impl Device {
    /// Picks the preferred device when the configuration does not name one.
    pub fn best_available() -> Self {
        Device::Cpu
    }

    /// Resolves a configuration token such as `"cpu"`.
    pub fn from_token(token: &str) -> Result<Self> {
        match token {
            "cpu" => Ok(Device::Cpu),
            other => Err(TrainErr::Config {
                what: format!("unknown device type {other:?}"),
            }),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_cpu_token() {
        assert_eq!(Device::from_token("cpu").unwrap(), Device::Cpu);
    }

    #[test]
    fn rejects_unknown_token() {
        assert!(Device::from_token("tpu").is_err());
    }
}
