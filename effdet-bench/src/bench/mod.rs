//! Detector benches wiring a network to anchors, loss and post-processing.

mod net;
mod predict;
mod train;
mod unwrap;

pub use net::*;
pub use predict::*;
pub use train::*;
pub use unwrap::*;
