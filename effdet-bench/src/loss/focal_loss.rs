use super::reduce;
use crate::common::*;

/// Focal loss initializer.
#[derive(Debug, Clone)]
pub struct FocalLossInit {
    /// The alpha coefficient.
    pub alpha: f64,
    /// The gamma coefficient.
    pub gamma: f64,
    /// The reduction method applied on output loss.
    pub reduction: Reduction,
}

impl FocalLossInit {
    pub fn default(reduction: Reduction) -> Self {
        Self {
            alpha: 0.25,
            gamma: 1.5,
            reduction,
        }
    }

    /// Build a focal loss calculator.
    pub fn build(self) -> Result<FocalLoss> {
        let Self {
            alpha,
            gamma,
            reduction,
        } = self;

        ensure!((0.0..=1.0).contains(&alpha), "alpha must be in range [0, 1]");
        ensure!(gamma >= 0.0, "gamma must be non-negative");

        Ok(FocalLoss {
            alpha,
            gamma,
            reduction,
        })
    }
}

/// Sigmoid focal loss calculator.
#[derive(Debug)]
pub struct FocalLoss {
    alpha: f64,
    gamma: f64,
    reduction: Reduction,
}

impl FocalLoss {
    /// Compute focal loss from logits against binary targets of the same shape.
    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Result<Tensor> {
        ensure!(
            input.size() == target.size(),
            "input and target shape must be equal, but get {:?} and {:?}",
            input.size(),
            target.size()
        );
        debug_assert!(
            bool::from(target.ge(0.0).logical_and(&target.le(1.0)).all()),
            "target values must be in range of [0.0, 1.0]"
        );

        // return zero tensor if (1) input is empty and (2) using mean reduction
        if input.numel() == 0 && self.reduction == Reduction::Mean {
            return Ok(Tensor::zeros(&[], (Kind::Float, input.device())).set_requires_grad(false));
        }

        let Self {
            alpha,
            gamma,
            reduction,
        } = *self;

        let orig_loss =
            input.binary_cross_entropy_with_logits::<Tensor>(target, None, None, Reduction::None);

        let input_prob = input.sigmoid();
        let p_t: Tensor = target * &input_prob + (1.0 - target) * (1.0 - &input_prob);
        let alpha_factor = target * alpha + (1.0 - target) * (1.0 - alpha);
        let modulating_factor = (-&p_t + 1.0).pow(&Tensor::from(gamma));
        let loss: Tensor = &orig_loss * &alpha_factor * &modulating_factor;

        reduce(loss, reduction)
    }
}
