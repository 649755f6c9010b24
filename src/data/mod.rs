pub mod dataloader;
pub mod dataset;
pub mod split;

pub use dataloader::{Batches, DataLoader};
pub use dataset::{Batch, SampleRef, TrackDataset};
pub use split::random_split;
