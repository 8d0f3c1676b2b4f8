use super::TopKOutput;
use crate::{
    anchors::{clip_boxes_xyxy, decode_box_outputs},
    common::*,
};

/// Detection decoder initializer.
#[derive(Debug, Clone)]
pub struct DetectionDecoderInit {
    /// The number of detection rows per image.
    pub max_detection_points: usize,
    /// If set, run class-wise NMS with this IoU threshold.
    pub nms_iou_threshold: Option<f64>,
}

impl DetectionDecoderInit {
    pub fn new(max_detection_points: usize) -> Self {
        Self {
            max_detection_points,
            nms_iou_threshold: None,
        }
    }

    pub fn build(self) -> Result<DetectionDecoder> {
        let Self {
            max_detection_points,
            nms_iou_threshold,
        } = self;

        ensure!(
            max_detection_points > 0,
            "max_detection_points must be positive"
        );
        if let Some(iou_threshold) = nms_iou_threshold {
            ensure!(iou_threshold >= 0.0, "nms_iou_threshold must be non-negative");
        }

        Ok(DetectionDecoder {
            max_detection_points: max_detection_points as i64,
            nms_iou_threshold,
        })
    }
}

/// Decodes top-k selections into fixed-size detection tensors.
#[derive(Debug, Clone)]
pub struct DetectionDecoder {
    max_detection_points: i64,
    nms_iou_threshold: Option<f64>,
}

impl DetectionDecoder {
    /// Decode a batch of top-k selections.
    ///
    /// `anchor_boxes` are the `[ymin, xmin, ymax, xmax]` anchors indexed by
    /// the top-k locations, `img_scale` has shape `[batch]` and `img_size`
    /// has shape `[batch, 2]` in `(width, height)` order.
    ///
    /// The output has shape `[batch, K, 6]` with columns `[x1, y1, x2, y2,
    /// score, class + 1]`. Rows are sorted by descending score and unused
    /// rows are zero.
    pub fn forward(
        &self,
        top_k: &TopKOutput,
        anchor_boxes: &Tensor,
        img_scale: &Tensor,
        img_size: &Tensor,
    ) -> Result<Tensor> {
        let TopKOutput {
            class_out,
            box_out,
            indices,
            classes,
        } = top_k;
        let batch_size = top_k.batch_size();

        let img_scale = img_scale.to_kind(Kind::Float).reshape(&[-1]);
        let img_size = img_size.to_kind(Kind::Float);
        ensure!(
            img_scale.size() == [batch_size],
            "expect {} image scales, but get shape {:?}",
            batch_size,
            img_scale.size()
        );
        ensure!(
            img_size.size() == [batch_size, 2],
            "expect image sizes in shape [{}, 2], but get {:?}",
            batch_size,
            img_size.size()
        );

        // the batch is decoded image by image
        let detections: Vec<_> = (0..batch_size)
            .map(|index| {
                let scale = img_scale.double_value(&[index]);
                let width = img_size.double_value(&[index, 0]);
                let height = img_size.double_value(&[index, 1]);

                self.generate_detections(
                    &class_out.get(index),
                    &box_out.get(index),
                    anchor_boxes,
                    &indices.get(index),
                    &classes.get(index),
                    scale,
                    (width, height),
                )
            })
            .try_collect()?;

        Ok(Tensor::stack(&detections, 0))
    }

    /// Decode the top-k selection of one image into a `[K, 6]` tensor.
    #[allow(clippy::too_many_arguments)]
    pub fn generate_detections(
        &self,
        class_out: &Tensor,
        box_out: &Tensor,
        anchor_boxes: &Tensor,
        indices: &Tensor,
        classes: &Tensor,
        img_scale: f64,
        img_size: (f64, f64),
    ) -> Result<Tensor> {
        ensure!(
            img_scale > 0.0,
            "image scale must be positive, but get {}",
            img_scale
        );
        let (width, height) = img_size;
        let device = box_out.device();

        let anchors = anchor_boxes.to_device(device).index_select(0, indices);
        let boxes = decode_box_outputs(&box_out.to_kind(Kind::Float), &anchors);
        let boxes = clip_boxes_xyxy(&boxes, width / img_scale, height / img_scale);
        let scores = class_out.sigmoid().reshape(&[-1]).to_kind(Kind::Float);

        let (boxes, scores, classes) = match self.nms_iou_threshold {
            Some(iou_threshold) => {
                let keep = batched_nms(&boxes, &scores, classes, iou_threshold)?;
                (
                    boxes.index_select(0, &keep),
                    scores.index_select(0, &keep),
                    classes.index_select(0, &keep),
                )
            }
            None => (boxes, scores, classes.shallow_clone()),
        };

        let boxes = boxes * img_scale;
        let classes = (classes + 1i64).to_kind(Kind::Float);

        // zero the rows of padded top-k entries
        let valid = scores.gt(0.0).to_kind(Kind::Float).unsqueeze(1);
        let detections =
            Tensor::cat(&[boxes, scores.unsqueeze(1), classes.unsqueeze(1)], 1) * valid;

        let (num_detections, _) = detections.size2()?;
        let num_padding = self.max_detection_points - num_detections;
        ensure!(
            num_padding >= 0,
            "expect at most {} detections, but get {}",
            self.max_detection_points,
            num_detections
        );

        let detections = if num_padding > 0 {
            let padding = Tensor::zeros(&[num_padding, 6], (Kind::Float, device));
            Tensor::cat(&[detections, padding], 0)
        } else {
            detections
        };

        Ok(detections)
    }
}

/// Class-wise greedy non-maximum suppression on `[x1, y1, x2, y2]` boxes.
///
/// Returns the kept indices ordered by descending score.
pub fn batched_nms(
    boxes: &Tensor,
    scores: &Tensor,
    classes: &Tensor,
    iou_threshold: f64,
) -> Result<Tensor> {
    tch::no_grad(|| -> Result<_> {
        let (num_boxes, _) = boxes.size2()?;
        ensure!(
            scores.size() == [num_boxes] && classes.size() == [num_boxes],
            "boxes, scores and classes must have the same length"
        );
        let device = boxes.device();

        let coords = Vec::<f32>::from(&boxes.to_device(Device::Cpu).reshape(&[-1]));
        let scores = Vec::<f32>::from(&scores.to_device(Device::Cpu));
        let classes = Vec::<i64>::from(&classes.to_device(Device::Cpu));
        let boxes: Vec<[f32; 4]> = coords
            .chunks(4)
            .map(|chunk| [chunk[0], chunk[1], chunk[2], chunk[3]])
            .collect();

        let order: Vec<usize> = (0..num_boxes as usize)
            .sorted_by(|&lhs, &rhs| {
                scores[rhs]
                    .partial_cmp(&scores[lhs])
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .collect();

        let mut suppressed = vec![false; order.len()];
        let mut keep: Vec<i64> = vec![];

        for (rank, &li) in order.iter().enumerate() {
            if suppressed[rank] {
                continue;
            }
            keep.push(li as i64);

            for (other_rank, &ri) in order.iter().enumerate().skip(rank + 1) {
                if suppressed[other_rank] || classes[ri] != classes[li] {
                    continue;
                }
                if iou_xyxy(&boxes[li], &boxes[ri]) as f64 > iou_threshold {
                    suppressed[other_rank] = true;
                }
            }
        }

        Ok(Tensor::of_slice(&keep).to_device(device))
    })
}

fn iou_xyxy(lhs: &[f32; 4], rhs: &[f32; 4]) -> f32 {
    let area = |b: &[f32; 4]| (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let inner_w = (lhs[2].min(rhs[2]) - lhs[0].max(rhs[0])).max(0.0);
    let inner_h = (lhs[3].min(rhs[3]) - lhs[1].max(rhs[1])).max(0.0);
    let inter_area = inner_w * inner_h;
    let union_area = area(lhs) + area(rhs) - inter_area + 1e-8;
    inter_area / union_area
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_image_top_k(logits: &[f32], classes: &[i64], indices: &[i64]) -> TopKOutput {
        let k = logits.len() as i64;
        TopKOutput {
            class_out: Tensor::of_slice(logits).view([1, k, 1]),
            box_out: Tensor::zeros(&[1, k, 4], (Kind::Float, Device::Cpu)),
            indices: Tensor::of_slice(indices).view([1, k]),
            classes: Tensor::of_slice(classes).view([1, k]),
        }
    }

    fn anchors() -> Tensor {
        // [ymin, xmin, ymax, xmax]
        Tensor::of_slice(&[
            0f32, 0.0, 10.0, 20.0, //
            0.0, 1.0, 10.0, 21.0, //
            50.0, 50.0, 60.0, 60.0, //
            -10.0, -10.0, 10.0, 10.0,
        ])
        .view([4, 4])
    }

    #[test]
    fn decode_scale_and_shift_classes() -> Result<()> {
        let top_k = single_image_top_k(&[2.0, 1.0, 0.0], &[0, 4, 1], &[0, 2, 3]);
        let decoder = DetectionDecoderInit::new(3).build()?;
        let img_scale = Tensor::of_slice(&[2f32]);
        let img_size = Tensor::of_slice(&[200i64, 200]).view([1, 2]);

        let detections = decoder.forward(&top_k, &anchors(), &img_scale, &img_size)?;
        assert_eq!(detections.size(), vec![1, 3, 6]);

        let row = |entry: i64| -> Vec<f64> {
            (0..6)
                .map(|col| detections.double_value(&[0, entry, col]))
                .collect()
        };

        // anchor 0 decodes to xyxy [0, 0, 20, 10] and is scaled by 2
        let first = row(0);
        assert_abs_diff_eq!(first[0], 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(first[2], 40.0, epsilon = 1e-4);
        assert_abs_diff_eq!(first[3], 20.0, epsilon = 1e-4);
        assert_abs_diff_eq!(first[4], 1.0 / (1.0 + (-2f64).exp()), epsilon = 1e-6);
        assert_abs_diff_eq!(first[5], 1.0);

        assert_abs_diff_eq!(row(1)[5], 5.0);

        // anchor 3 is clipped at the image origin before scaling
        let third = row(2);
        assert_abs_diff_eq!(third[0], 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(third[1], 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(third[2], 20.0, epsilon = 1e-4);
        assert_abs_diff_eq!(third[4], 0.5, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn padded_entries_become_zero_rows() -> Result<()> {
        let top_k = single_image_top_k(&[1.0, f32::NEG_INFINITY], &[2, 0], &[0, 0]);
        let decoder = DetectionDecoderInit::new(2).build()?;
        let detections = decoder.forward(
            &top_k,
            &anchors(),
            &Tensor::of_slice(&[1f32]),
            &Tensor::of_slice(&[64i64, 64]).view([1, 2]),
        )?;

        ensure!(bool::from(detections.i((0, 1, ..)).eq(0.0).all()));
        assert_abs_diff_eq!(detections.double_value(&[0, 0, 5]), 3.0);
        Ok(())
    }

    #[test]
    fn nms_suppresses_same_class_overlap() -> Result<()> {
        // anchors 0 and 1 overlap heavily, anchor 2 is far away
        let top_k = single_image_top_k(&[3.0, 2.0, 1.0, 0.5], &[0, 0, 0, 1], &[0, 1, 2, 1]);
        let decoder = DetectionDecoderInit {
            max_detection_points: 4,
            nms_iou_threshold: Some(0.5),
        }
        .build()?;
        let detections = decoder.forward(
            &top_k,
            &anchors(),
            &Tensor::of_slice(&[1f32]),
            &Tensor::of_slice(&[100i64, 100]).view([1, 2]),
        )?;
        assert_eq!(detections.size(), vec![1, 4, 6]);

        let scores: Vec<f32> = Vec::from(&detections.i((0, .., 4)).contiguous());
        let classes: Vec<f32> = Vec::from(&detections.i((0, .., 5)).contiguous());

        // the second entry is suppressed, the class-1 entry survives
        assert_eq!(classes, vec![1.0, 1.0, 2.0, 0.0]);
        assert!(scores[0] > scores[1] && scores[1] > scores[2]);
        assert_eq!(scores[3], 0.0);
        Ok(())
    }

    #[test]
    fn reject_batch_size_mismatch() -> Result<()> {
        let top_k = single_image_top_k(&[1.0], &[0], &[0]);
        let decoder = DetectionDecoderInit::new(1).build()?;
        let result = decoder.forward(
            &top_k,
            &anchors(),
            &Tensor::of_slice(&[1f32, 1.0]),
            &Tensor::of_slice(&[64i64, 64]).view([1, 2]),
        );
        assert!(result.is_err());
        Ok(())
    }
}
