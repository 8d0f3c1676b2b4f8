use crate::{bench::LevelOutputs, common::*};

/// Top-k selector initializer.
#[derive(Debug, Clone)]
pub struct TopKSelectorInit {
    pub num_classes: usize,
    pub num_levels: usize,
    /// The number of (location, class) pairs to keep per image.
    pub max_detection_points: usize,
}

impl TopKSelectorInit {
    pub fn build(self) -> Result<TopKSelector> {
        let Self {
            num_classes,
            num_levels,
            max_detection_points,
        } = self;

        ensure!(num_classes > 0, "num_classes must be positive");
        ensure!(num_levels > 0, "num_levels must be positive");
        ensure!(
            max_detection_points > 0,
            "max_detection_points must be positive"
        );

        Ok(TopKSelector {
            num_classes: num_classes as i64,
            num_levels,
            max_detection_points: max_detection_points as i64,
        })
    }
}

/// The highest scoring (location, class) pairs of each image.
///
/// Every tensor has `K = max_detection_points` entries per image, ordered by
/// descending class logit. If the network produces fewer than `K` pairs, the
/// tail is padded with `-inf` logits, location 0, class 0 and zero boxes.
#[derive(Debug, TensorLike)]
pub struct TopKOutput {
    /// The selected class logits in shape `[batch, K, 1]`.
    pub class_out: Tensor,
    /// The box regressions at selected locations in shape `[batch, K, 4]`.
    pub box_out: Tensor,
    /// The selected indices into the flattened anchors in shape `[batch, K]`.
    pub indices: Tensor,
    /// The selected 0-based class indices in shape `[batch, K]`.
    pub classes: Tensor,
}

impl TopKOutput {
    pub fn batch_size(&self) -> i64 {
        self.indices.size()[0]
    }

    pub fn num_selected(&self) -> i64 {
        self.indices.size()[1]
    }
}

/// Selects the top-k class logits jointly over levels, locations and classes.
#[derive(Debug, Clone)]
pub struct TopKSelector {
    num_classes: i64,
    num_levels: usize,
    max_detection_points: i64,
}

impl TopKSelector {
    pub fn forward(&self, outputs: &LevelOutputs) -> Result<TopKOutput> {
        let Self {
            num_classes,
            num_levels,
            max_detection_points,
        } = *self;

        ensure!(
            outputs.class_out.len() == num_levels && outputs.box_out.len() == num_levels,
            "expect {} levels, but get {} class and {} box levels",
            num_levels,
            outputs.class_out.len(),
            outputs.box_out.len()
        );

        let class_all = outputs.flatten_class(num_classes as usize)?;
        let box_all = outputs.flatten_box()?;
        let (batch_size, num_locations, _) = class_all.size3()?;
        let (_, num_box_locations, _) = box_all.size3()?;
        ensure!(
            num_locations == num_box_locations,
            "class outputs have {} locations, but box outputs have {}",
            num_locations,
            num_box_locations
        );

        let num_selected = max_detection_points.min(num_locations * num_classes);
        let (_, flat_indices) = class_all
            .reshape(&[batch_size, -1])
            .topk(num_selected, 1, /* largest = */ true, /* sorted = */ true);
        let indices = flat_indices.floor_divide_scalar(num_classes);
        let classes = flat_indices.remainder(num_classes);

        let box_out = box_all.gather(1, &indices.unsqueeze(2).expand(&[-1, -1, 4], false), false);
        let class_out = class_all
            .gather(
                1,
                &indices.unsqueeze(2).expand(&[-1, -1, num_classes], false),
                false,
            )
            .gather(2, &classes.unsqueeze(2), false);

        let output = TopKOutput {
            class_out,
            box_out,
            indices,
            classes,
        };

        if num_selected < max_detection_points {
            let num_padding = max_detection_points - num_selected;
            trace!(
                "pad {} top-k entries for {} candidates",
                num_padding,
                num_locations * num_classes
            );
            Ok(pad_output(output, num_padding))
        } else {
            Ok(output)
        }
    }
}

fn pad_output(output: TopKOutput, num_padding: i64) -> TopKOutput {
    let TopKOutput {
        class_out,
        box_out,
        indices,
        classes,
    } = output;
    let batch_size = indices.size()[0];
    let device = indices.device();

    let class_pad = Tensor::full(
        &[batch_size, num_padding, 1],
        f64::NEG_INFINITY,
        (class_out.kind(), device),
    );
    let box_pad = Tensor::zeros(&[batch_size, num_padding, 4], (box_out.kind(), device));
    let index_pad = Tensor::zeros(&[batch_size, num_padding], (Kind::Int64, device));

    TopKOutput {
        class_out: Tensor::cat(&[class_out, class_pad], 1),
        box_out: Tensor::cat(&[box_out, box_pad], 1),
        indices: Tensor::cat(&[indices, index_pad.shallow_clone()], 1),
        classes: Tensor::cat(&[classes, index_pad], 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn random_outputs(batch_size: i64, num_classes: i64, sizes: &[i64]) -> LevelOutputs {
        let device = Device::Cpu;
        let class_out = sizes
            .iter()
            .map(|&size| {
                Tensor::randn(&[batch_size, num_classes, size, size], (Kind::Float, device))
            })
            .collect();
        let box_out = sizes
            .iter()
            .map(|&size| Tensor::randn(&[batch_size, 4, size, size], (Kind::Float, device)))
            .collect();
        LevelOutputs { class_out, box_out }
    }

    #[test]
    fn selection_matches_flattened_scores() -> Result<()> {
        let mut rng = rand::thread_rng();
        let num_classes = rng.gen_range(1..6);
        let outputs = random_outputs(2, num_classes, &[4, 2]);
        let selector = TopKSelectorInit {
            num_classes: num_classes as usize,
            num_levels: 2,
            max_detection_points: 7,
        }
        .build()?;

        let TopKOutput {
            class_out,
            box_out,
            indices,
            classes,
        } = selector.forward(&outputs)?;
        assert_eq!(class_out.size(), vec![2, 7, 1]);
        assert_eq!(box_out.size(), vec![2, 7, 4]);
        assert_eq!(indices.size(), vec![2, 7]);
        assert_eq!(classes.size(), vec![2, 7]);

        let class_all = outputs.flatten_class(num_classes as usize)?;
        let box_all = outputs.flatten_box()?;

        for batch in 0..2 {
            let (expect, _) = class_all.get(batch).reshape(&[-1]).topk(7, 0, true, true);
            let selected = class_out.get(batch).reshape(&[-1]);
            ensure!(bool::from((&selected - &expect).abs().le(1e-6).all()));

            // scores are in descending order
            let diff = selected.narrow(0, 0, 6) - selected.narrow(0, 1, 6);
            ensure!(bool::from(diff.ge(0.0).all()));

            for entry in 0..7 {
                let location = indices.int64_value(&[batch, entry]);
                let class = classes.int64_value(&[batch, entry]);
                assert_abs_diff_eq!(
                    class_all.double_value(&[batch, location, class]),
                    class_out.double_value(&[batch, entry, 0])
                );
                let expect_box = box_all.get(batch).get(location);
                ensure!(bool::from(
                    (box_out.get(batch).get(entry) - expect_box).abs().le(1e-6).all()
                ));
            }
        }
        Ok(())
    }

    #[test]
    fn pad_when_candidates_are_fewer_than_k() -> Result<()> {
        // 2 levels of 2x2 and 1x1 with 2 classes give 10 candidates
        let outputs = random_outputs(3, 2, &[2, 1]);
        let selector = TopKSelectorInit {
            num_classes: 2,
            num_levels: 2,
            max_detection_points: 16,
        }
        .build()?;
        let output = selector.forward(&outputs)?;

        assert_eq!(output.num_selected(), 16);
        assert_eq!(output.batch_size(), 3);

        let padding = output.class_out.i((.., 10.., 0));
        ensure!(bool::from(padding.isinf().all()));
        ensure!(bool::from(output.class_out.i((.., ..10, 0)).isfinite().all()));
        ensure!(bool::from(output.box_out.i((.., 10.., ..)).eq(0.0).all()));
        Ok(())
    }

    #[test]
    fn reject_level_count_mismatch() -> Result<()> {
        let outputs = random_outputs(1, 2, &[2]);
        let selector = TopKSelectorInit {
            num_classes: 2,
            num_levels: 2,
            max_detection_points: 4,
        }
        .build()?;
        assert!(selector.forward(&outputs).is_err());
        Ok(())
    }
}
