//! Training core for a neural photon-propagation surrogate: a SIREN
//! coordinate network learns per-channel visibilities from toy-MC particle
//! tracks under a Poisson match loss, with resumable checkpoints and a
//! per-batch metric log.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod device;
pub mod error;
pub mod logger;
pub mod loss;
pub mod model;
pub mod optimization;
pub mod state;
pub mod trainer;

pub use config::Config;
pub use error::{Result, TrainErr};
pub use state::TrainState;
pub use trainer::Trainer;
