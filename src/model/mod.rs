pub mod siren;
pub mod track;

pub use siren::{Siren, SirenSpec};
pub use track::{TrackModel, TrackOutput};
