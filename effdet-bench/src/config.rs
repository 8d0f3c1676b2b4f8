//! Bench configuration format.

use crate::common::*;

/// The detector configuration consumed by the benches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// The lowest feature pyramid level.
    pub min_level: usize,
    /// The highest feature pyramid level, inclusive.
    pub max_level: usize,
    /// The number of anchor scales per octave.
    pub num_scales: usize,
    /// The (x, y) aspect ratio multipliers of anchors.
    pub aspect_ratios: Vec<(R64, R64)>,
    /// The base anchor size relative to the level stride.
    pub anchor_scale: R64,
    /// The side length of the square network input in pixels.
    pub image_size: usize,
    /// The number of object classes, excluding background.
    pub num_classes: usize,
    /// The number of (location, class) pairs kept by top-k selection.
    pub max_detection_points: usize,
    /// The maximum number of annotated instances per image.
    pub max_instances: usize,
    /// Detections below this score are dropped from formatted output.
    pub score_threshold: R64,
    /// The minimum IoU for an anchor to match a ground truth box.
    pub match_threshold: R64,
    /// If set, apply class-wise NMS with this IoU threshold in decoding.
    pub nms_iou_threshold: Option<R64>,
    /// The loss function configuration.
    pub loss: LossConfig,
}

impl BenchConfig {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = std::fs::read_to_string(path)?;
        let config: Self = json5::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn num_levels(&self) -> usize {
        self.max_level - self.min_level + 1
    }

    /// The number of anchors on each feature map cell.
    pub fn num_anchors(&self) -> usize {
        self.num_scales * self.aspect_ratios.len()
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.min_level <= self.max_level,
            "min_level must not exceed max_level"
        );
        ensure!(
            self.max_level < usize::BITS as usize,
            "max_level must be less than {}",
            usize::BITS
        );
        ensure!(self.image_size > 0, "image_size must be positive");
        ensure!(self.num_scales > 0, "num_scales must be positive");
        ensure!(
            !self.aspect_ratios.is_empty(),
            "aspect_ratios must not be empty"
        );
        ensure!(self.anchor_scale > 0.0, "anchor_scale must be positive");
        ensure!(self.num_classes > 0, "num_classes must be positive");
        ensure!(
            self.max_detection_points > 0,
            "max_detection_points must be positive"
        );
        ensure!(
            (0.0..=1.0).contains(&self.match_threshold.raw()),
            "match_threshold must be in range [0, 1]"
        );
        if let Some(iou_threshold) = self.nms_iou_threshold {
            ensure!(
                iou_threshold >= 0.0,
                "nms_iou_threshold must be non-negative"
            );
        }
        Ok(())
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            min_level: 3,
            max_level: 7,
            num_scales: 3,
            aspect_ratios: vec![(r64(1.0), r64(1.0)), (r64(1.4), r64(0.7)), (r64(0.7), r64(1.4))],
            anchor_scale: r64(4.0),
            image_size: 512,
            num_classes: 90,
            max_detection_points: 5000,
            max_instances: 75,
            score_threshold: r64(0.1),
            match_threshold: r64(0.5),
            nms_iou_threshold: None,
            loss: LossConfig::default(),
        }
    }
}

/// The loss function configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    /// The focal loss alpha coefficient.
    pub alpha: R64,
    /// The focal loss gamma coefficient.
    pub gamma: R64,
    /// The Huber loss delta.
    pub delta: R64,
    /// The weight of box loss in the total loss.
    pub box_loss_weight: R64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            alpha: r64(0.25),
            gamma: r64(1.5),
            delta: r64(0.1),
            box_loss_weight: r64(50.0),
        }
    }
}
