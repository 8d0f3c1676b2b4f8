use super::reduce;
use crate::common::*;

#[derive(Debug)]
pub struct HuberLoss {
    delta: f64,
    reduction: Reduction,
}

impl HuberLoss {
    pub fn new(delta: f64, reduction: Reduction) -> Self {
        Self { delta, reduction }
    }

    pub fn forward(
        &self,
        input: &Tensor,
        target: &Tensor,
        weights: Option<&Tensor>,
    ) -> Result<Tensor> {
        ensure!(
            input.size() == target.size(),
            "input and target shape must be equal, but get {:?} and {:?}",
            input.size(),
            target.size()
        );

        // return zero tensor if (1) input is empty and (2) using mean reduction
        if input.numel() == 0 && self.reduction == Reduction::Mean {
            return Ok(Tensor::zeros(&[], (Kind::Float, input.device())).set_requires_grad(false));
        }

        let abs_error = (input - target).abs();
        let quadratic = abs_error.clamp_max(self.delta);
        let linear = &abs_error - &quadratic;
        let loss = quadratic.square() * 0.5 + linear * self.delta;
        let loss = match weights {
            Some(weights) => loss * weights,
            None => loss,
        };

        reduce(loss, self.reduction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quadratic_then_linear() -> Result<()> {
        let loss_fn = HuberLoss::new(0.1, Reduction::None);
        let input = Tensor::of_slice(&[0.05f32, 1.0, -0.5]);
        let target = Tensor::zeros(&[3], (Kind::Float, Device::Cpu));
        let loss = loss_fn.forward(&input, &target, None)?;

        assert_abs_diff_eq!(loss.double_value(&[0]), 0.5 * 0.05 * 0.05, epsilon = 1e-7);
        assert_abs_diff_eq!(loss.double_value(&[1]), 0.005 + 0.1 * 0.9, epsilon = 1e-6);
        assert_abs_diff_eq!(loss.double_value(&[2]), 0.005 + 0.1 * 0.4, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn weights_mask_elements() -> Result<()> {
        let loss_fn = HuberLoss::new(0.1, Reduction::Sum);
        let input = Tensor::of_slice(&[1f32, 1.0]);
        let target = Tensor::zeros(&[2], (Kind::Float, Device::Cpu));
        let weights = Tensor::of_slice(&[1f32, 0.0]);
        let loss = loss_fn.forward(&input, &target, Some(&weights))?;

        assert_abs_diff_eq!(loss.double_value(&[]), 0.095, epsilon = 1e-6);
        Ok(())
    }
}
