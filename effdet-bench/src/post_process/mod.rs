//! Post-processing of raw network outputs into detections.

mod decode;
mod format;
mod top_k;

pub use decode::*;
pub use format::*;
pub use top_k::*;
