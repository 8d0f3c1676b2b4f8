use super::{FocalLoss, FocalLossInit, HuberLoss};
use crate::{bench::LevelOutputs, common::*, config::BenchConfig};

/// Detection loss initializer.
#[derive(Debug, Clone)]
pub struct DetectionLossInit {
    pub num_classes: usize,
    /// Focal loss alpha.
    pub alpha: f64,
    /// Focal loss gamma.
    pub gamma: f64,
    /// Huber loss delta.
    pub delta: f64,
    /// The weight of box loss in the total loss.
    pub box_loss_weight: f64,
}

impl DetectionLossInit {
    pub fn from_config(config: &BenchConfig) -> Self {
        let loss = &config.loss;
        Self {
            num_classes: config.num_classes,
            alpha: loss.alpha.raw(),
            gamma: loss.gamma.raw(),
            delta: loss.delta.raw(),
            box_loss_weight: loss.box_loss_weight.raw(),
        }
    }

    pub fn build(self) -> Result<DetectionLoss> {
        let Self {
            num_classes,
            alpha,
            gamma,
            delta,
            box_loss_weight,
        } = self;

        ensure!(num_classes > 0, "num_classes must be positive");
        ensure!(delta > 0.0, "delta must be positive");
        ensure!(box_loss_weight >= 0.0, "box_loss_weight must be non-negative");

        let focal_loss = FocalLossInit {
            alpha,
            gamma,
            reduction: Reduction::None,
        }
        .build()?;
        let huber_loss = HuberLoss::new(delta, Reduction::Sum);

        Ok(DetectionLoss {
            num_classes: num_classes as i64,
            box_loss_weight,
            focal_loss,
            huber_loss,
        })
    }
}

#[derive(Debug)]
pub struct DetectionLoss {
    num_classes: i64,
    box_loss_weight: f64,
    focal_loss: FocalLoss,
    huber_loss: HuberLoss,
}

#[derive(Debug, TensorLike)]
pub struct DetectionLossOutput {
    pub total_loss: Tensor,
    pub class_loss: Tensor,
    pub box_loss: Tensor,
}

impl DetectionLoss {
    /// Compute the loss of raw network outputs against labeled anchors.
    ///
    /// `cls_targets` has shape `[batch, anchors]` with 0-based classes, `-1`
    /// for background and `-2` for ignored anchors. `box_targets` has shape
    /// `[batch, anchors, 4]` and `num_positives` has shape `[batch]`.
    pub fn forward(
        &self,
        outputs: &LevelOutputs,
        cls_targets: &Tensor,
        box_targets: &Tensor,
        num_positives: &Tensor,
    ) -> Result<DetectionLossOutput> {
        let Self {
            num_classes,
            box_loss_weight,
            ref focal_loss,
            ref huber_loss,
        } = *self;

        let class_out = outputs.flatten_class(num_classes as usize)?;
        let box_out = outputs.flatten_box()?;
        ensure!(
            class_out.size()[0..2] == cls_targets.size()[..],
            "class outputs in shape {:?} do not match targets in shape {:?}",
            class_out.size(),
            cls_targets.size()
        );
        ensure!(
            box_out.size() == box_targets.size(),
            "box outputs in shape {:?} do not match targets in shape {:?}",
            box_out.size(),
            box_targets.size()
        );

        let normalizer = num_positives.to_kind(Kind::Float).sum(Kind::Float) + 1.0;

        let class_loss = {
            let cls_targets = cls_targets.to_kind(Kind::Int64);
            let positive = cls_targets.ge(0i64).to_kind(Kind::Float).unsqueeze(-1);
            let not_ignored = cls_targets.ne(-2i64).to_kind(Kind::Float).unsqueeze(-1);
            let one_hot = cls_targets
                .clamp_min(0i64)
                .one_hot(num_classes)
                .to_kind(Kind::Float)
                * positive;

            let loss = focal_loss.forward(&class_out.to_kind(Kind::Float), &one_hot)?;
            (loss * not_ignored).sum(Kind::Float) / &normalizer
        };

        let box_loss = {
            let box_targets = box_targets.to_kind(Kind::Float);
            let mask = box_targets.ne(0.0).to_kind(Kind::Float);
            let loss =
                huber_loss.forward(&box_out.to_kind(Kind::Float), &box_targets, Some(&mask))?;
            loss / (&normalizer * 4.0)
        };

        let total_loss = &class_loss + &box_loss * box_loss_weight;

        Ok(DetectionLossOutput {
            total_loss,
            class_loss,
            box_loss,
        })
    }
}
