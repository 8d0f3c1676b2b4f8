use super::{encode_boxes, iou_matrix, Anchors};
use crate::common::*;

/// Anchor labeler initializer.
#[derive(Debug, Clone)]
pub struct AnchorLabelerInit {
    pub num_classes: usize,
    /// Anchors whose best IoU is at least this value are positive.
    pub match_threshold: f64,
}

impl AnchorLabelerInit {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            match_threshold: 0.5,
        }
    }

    pub fn build(self, anchors: &Anchors) -> Result<AnchorLabeler> {
        let Self {
            num_classes,
            match_threshold,
        } = self;

        ensure!(num_classes > 0, "num_classes must be positive");
        ensure!(
            (0.0..=1.0).contains(&match_threshold),
            "match_threshold must be in range [0, 1]"
        );

        Ok(AnchorLabeler {
            anchor_boxes: anchors.boxes().shallow_clone(),
            num_classes,
            match_threshold,
        })
    }
}

/// Assigns ground truth classes and box regression targets to anchors.
#[derive(Debug)]
pub struct AnchorLabeler {
    anchor_boxes: Tensor,
    num_classes: usize,
    match_threshold: f64,
}

/// The per-anchor training targets of a batch.
#[derive(Debug, TensorLike)]
pub struct AnchorTargets {
    /// 0-based class index per anchor in shape `[batch, anchors]`, `-1` for background.
    pub cls_targets: Tensor,
    /// Encoded box targets in shape `[batch, anchors, 4]`, zero for background.
    pub box_targets: Tensor,
    /// The number of positive anchors per image in shape `[batch]`.
    pub num_positives: Tensor,
}

impl AnchorLabeler {
    /// Label anchors for every image of a batch.
    ///
    /// `boxes` has shape `[batch, instances, 4]` in `[ymin, xmin, ymax, xmax]`
    /// order and `labels` has shape `[batch, instances]` with 1-based classes.
    /// Rows labeled 0 or below are padding and ignored.
    pub fn batch_label_anchors(
        &self,
        batch_size: usize,
        boxes: &Tensor,
        labels: &Tensor,
    ) -> Result<AnchorTargets> {
        let (boxes_batch, _, _) = boxes.size3()?;
        let (labels_batch, _) = labels.size2()?;
        ensure!(
            boxes_batch == batch_size as i64 && labels_batch == batch_size as i64,
            "expect batch size {}, but get {} boxes and {} labels",
            batch_size,
            boxes_batch,
            labels_batch
        );

        let (cls_vec, box_vec, num_positives_vec) = (0..batch_size as i64)
            .map(|index| self.label_anchors(&boxes.get(index), &labels.get(index)))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .unzip_n_vec();

        debug!(
            "labeled anchors with {:?} positives per image",
            num_positives_vec
        );

        let device = boxes.device();
        Ok(AnchorTargets {
            cls_targets: Tensor::stack(&cls_vec, 0),
            box_targets: Tensor::stack(&box_vec, 0),
            num_positives: Tensor::of_slice(&num_positives_vec).to_device(device),
        })
    }

    /// Label anchors for one image.
    ///
    /// Returns the class targets `[anchors]`, the box targets `[anchors, 4]`
    /// and the number of positive anchors.
    pub fn label_anchors(
        &self,
        gt_boxes: &Tensor,
        gt_labels: &Tensor,
    ) -> Result<(Tensor, Tensor, f32)> {
        let device = gt_boxes.device();
        let anchors = self.anchor_boxes.to_device(device);
        let (num_anchors, _) = anchors.size2()?;

        // drop padded instances
        let gt_labels = gt_labels.to_kind(Kind::Int64);
        let keep = gt_labels.gt(0i64).nonzero().view([-1]);
        let gt_boxes = gt_boxes.to_kind(Kind::Float).index_select(0, &keep);
        let gt_labels = gt_labels.index_select(0, &keep);
        let num_gt = keep.size1()?;

        if num_gt == 0 {
            let cls_targets = Tensor::full(&[num_anchors], -1i64, (Kind::Int64, device));
            let box_targets = Tensor::zeros(&[num_anchors, 4], (Kind::Float, device));
            return Ok((cls_targets, box_targets, 0.0));
        }

        let max_label = gt_labels.max().int64_value(&[]);
        ensure!(
            max_label <= self.num_classes as i64,
            "label {} exceeds the number of classes {}",
            max_label,
            self.num_classes
        );

        let matches = tch::no_grad(|| {
            let iou = iou_matrix(&gt_boxes, &anchors);

            // best ground truth per anchor
            let (best_iou, best_gt) = iou.max_dim(0, false);
            let best_iou = Vec::<f32>::from(&best_iou.to_device(Device::Cpu));
            let best_gt = Vec::<i64>::from(&best_gt.to_device(Device::Cpu));

            let mut matches: Vec<i64> = izip!(best_iou, best_gt)
                .map(|(iou, gt_index)| {
                    if iou as f64 >= self.match_threshold {
                        gt_index
                    } else {
                        -1
                    }
                })
                .collect();

            // every ground truth keeps at least its best anchor
            let (_, best_anchor) = iou.max_dim(1, false);
            Vec::<i64>::from(&best_anchor.to_device(Device::Cpu))
                .into_iter()
                .enumerate()
                .for_each(|(gt_index, anchor_index)| {
                    matches[anchor_index as usize] = gt_index as i64;
                });

            Tensor::of_slice(&matches).to_device(device)
        });

        let positive = matches.ge(0i64);
        let num_positives = i64::from(positive.sum(Kind::Int64)) as f32;
        let matched = matches.clamp_min(0i64);

        let positive_i64 = positive.to_kind(Kind::Int64);
        let cls_targets =
            (gt_labels.index_select(0, &matched) - 1i64) * &positive_i64 + (&positive_i64 - 1i64);

        let box_targets = encode_boxes(&gt_boxes.index_select(0, &matched), &anchors)
            * positive.to_kind(Kind::Float).unsqueeze(1);

        Ok((cls_targets, box_targets, num_positives))
    }
}
