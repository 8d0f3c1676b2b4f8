//! The support benches of EfficientDet-style detectors.
//!
//! A bench wraps a backbone/head network with anchor generation, loss
//! computation and post-processing of the raw per-level outputs.

mod common;
pub mod anchors;
pub mod bench;
pub mod collate;
pub mod config;
pub mod loss;
pub mod post_process;

pub use anchors::{AnchorLabeler, AnchorLabelerInit, AnchorTargets, Anchors};
pub use bench::{
    DetBenchPredict, DetBenchTrain, DetectionNet, LevelOutputs, ModelWrapper, NetInput,
    TrainStepOutput,
};
pub use collate::{
    collate_images, BatchedTarget, Collator, CollatorInit, TargetRecord, TargetValue,
};
pub use config::{BenchConfig, LossConfig};
pub use loss::{DetectionLoss, DetectionLossInit, DetectionLossOutput};
pub use post_process::{
    DetectionDecoder, DetectionDecoderInit, ImageDetections, OutputFormatter,
    OutputFormatterInit, TopKOutput, TopKSelector, TopKSelectorInit,
};
