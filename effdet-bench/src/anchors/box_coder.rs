use crate::common::*;

const EPSILON: f64 = 1e-8;

/// Decode `[ty, tx, th, tw]` regressions against `[ymin, xmin, ymax, xmax]`
/// anchors into `[x1, y1, x2, y2]` boxes.
///
/// Both inputs have shape `[num_boxes, 4]`.
pub fn decode_box_outputs(rel_codes: &Tensor, anchors: &Tensor) -> Tensor {
    let (cy_a, cx_a, h_a, w_a) = center_size(anchors);

    let ty = rel_codes.select(1, 0);
    let tx = rel_codes.select(1, 1);
    let th = rel_codes.select(1, 2);
    let tw = rel_codes.select(1, 3);

    let w = tw.exp() * &w_a;
    let h = th.exp() * &h_a;
    let cy = ty * &h_a + &cy_a;
    let cx = tx * &w_a + &cx_a;

    let x1 = &cx - &w / 2.0;
    let y1 = &cy - &h / 2.0;
    let x2 = &cx + &w / 2.0;
    let y2 = &cy + &h / 2.0;

    Tensor::stack(&[x1, y1, x2, y2], 1)
}

/// Encode `[ymin, xmin, ymax, xmax]` boxes relative to anchors of the same
/// format into `[ty, tx, th, tw]` regression targets.
pub fn encode_boxes(boxes: &Tensor, anchors: &Tensor) -> Tensor {
    let (cy_a, cx_a, h_a, w_a) = center_size(anchors);
    let (cy, cx, h, w) = center_size(boxes);

    let h_a = h_a + EPSILON;
    let w_a = w_a + EPSILON;
    let h = h + EPSILON;
    let w = w + EPSILON;

    let ty = (cy - cy_a) / &h_a;
    let tx = (cx - cx_a) / &w_a;
    let th = (h / &h_a).log();
    let tw = (w / &w_a).log();

    Tensor::stack(&[ty, tx, th, tw], 1)
}

/// Clip `[x1, y1, x2, y2]` boxes into `[0, width] x [0, height]`.
pub fn clip_boxes_xyxy(boxes: &Tensor, width: f64, height: f64) -> Tensor {
    let boxes = boxes.clamp_min(0.0);
    let x1 = boxes.select(1, 0).clamp_max(width);
    let y1 = boxes.select(1, 1).clamp_max(height);
    let x2 = boxes.select(1, 2).clamp_max(width);
    let y2 = boxes.select(1, 3).clamp_max(height);
    Tensor::stack(&[x1, y1, x2, y2], 1)
}

/// Compute pairwise IoU of `[ymin, xmin, ymax, xmax]` boxes.
///
/// Returns a tensor in shape `[lhs_len, rhs_len]`.
pub fn iou_matrix(lhs: &Tensor, rhs: &Tensor) -> Tensor {
    let lhs_t = lhs.select(1, 0).unsqueeze(1);
    let lhs_l = lhs.select(1, 1).unsqueeze(1);
    let lhs_b = lhs.select(1, 2).unsqueeze(1);
    let lhs_r = lhs.select(1, 3).unsqueeze(1);

    let rhs_t = rhs.select(1, 0).unsqueeze(0);
    let rhs_l = rhs.select(1, 1).unsqueeze(0);
    let rhs_b = rhs.select(1, 2).unsqueeze(0);
    let rhs_r = rhs.select(1, 3).unsqueeze(0);

    let inner_h = (lhs_b.minimum(&rhs_b) - lhs_t.maximum(&rhs_t)).clamp_min(0.0);
    let inner_w = (lhs_r.minimum(&rhs_r) - lhs_l.maximum(&rhs_l)).clamp_min(0.0);
    let inter_area = inner_h * inner_w;

    let lhs_area = (&lhs_b - &lhs_t) * (&lhs_r - &lhs_l);
    let rhs_area = (&rhs_b - &rhs_t) * (&rhs_r - &rhs_l);
    let union_area = lhs_area + rhs_area - &inter_area;

    inter_area / union_area.clamp_min(EPSILON)
}

/// Split `[ymin, xmin, ymax, xmax]` boxes into center and size columns.
fn center_size(boxes: &Tensor) -> (Tensor, Tensor, Tensor, Tensor) {
    let t = boxes.select(1, 0);
    let l = boxes.select(1, 1);
    let b = boxes.select(1, 2);
    let r = boxes.select(1, 3);

    let cy = (&t + &b) / 2.0;
    let cx = (&l + &r) / 2.0;
    let h = b - t;
    let w = r - l;

    (cy, cx, h, w)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_regression_decodes_to_anchor() -> Result<()> {
        let anchors =
            Tensor::of_slice(&[0f32, 10.0, 20.0, 50.0, -4.0, -4.0, 4.0, 4.0]).view([2, 4]);
        let rel_codes = Tensor::zeros(&[2, 4], (Kind::Float, Device::Cpu));
        let decoded = decode_box_outputs(&rel_codes, &anchors);

        let expect = Tensor::of_slice(&[10f32, 0.0, 50.0, 20.0, -4.0, -4.0, 4.0, 4.0]).view([2, 4]);
        ensure!(
            bool::from((decoded - expect).abs().le(1e-5).all()),
            "decoded boxes differ from anchors"
        );
        Ok(())
    }

    #[test]
    fn decode_applies_offsets_and_scales() -> Result<()> {
        // anchor centered at (cy, cx) = (10, 20), h = 20, w = 40
        let anchors = Tensor::of_slice(&[0f32, 0.0, 20.0, 40.0]).view([1, 4]);
        let rel_codes =
            Tensor::of_slice(&[0.5f32, -0.25, 0.0, 2f32.ln()]).view([1, 4]);
        let decoded = decode_box_outputs(&rel_codes, &anchors);

        // cy = 20, cx = 10, h = 20, w = 80
        let values: Vec<f64> = (0..4).map(|col| decoded.double_value(&[0, col])).collect();
        assert_abs_diff_eq!(values[0], -30.0, epsilon = 1e-4);
        assert_abs_diff_eq!(values[1], 10.0, epsilon = 1e-4);
        assert_abs_diff_eq!(values[2], 50.0, epsilon = 1e-4);
        assert_abs_diff_eq!(values[3], 30.0, epsilon = 1e-4);
        Ok(())
    }

    #[test]
    fn encoded_box_decodes_back() -> Result<()> {
        let anchors = Tensor::of_slice(&[0f32, 0.0, 16.0, 16.0]).view([1, 4]);
        let boxes = Tensor::of_slice(&[2f32, 4.0, 14.0, 20.0]).view([1, 4]);
        let codes = encode_boxes(&boxes, &anchors);
        let decoded = decode_box_outputs(&codes, &anchors);

        // decoded boxes are in xyxy order
        let expect = Tensor::of_slice(&[4f32, 2.0, 20.0, 14.0]).view([1, 4]);
        ensure!(bool::from((decoded - expect).abs().le(1e-4).all()));
        Ok(())
    }

    #[test]
    fn clip_into_image() {
        let boxes = Tensor::of_slice(&[-5f32, 3.0, 120.0, 70.0]).view([1, 4]);
        let clipped = clip_boxes_xyxy(&boxes, 100.0, 64.0);
        let values: Vec<f64> = (0..4).map(|col| clipped.double_value(&[0, col])).collect();
        assert_eq!(values, vec![0.0, 3.0, 100.0, 64.0]);
    }

    #[test]
    fn iou_of_overlapping_boxes() {
        let lhs = Tensor::of_slice(&[0f32, 0.0, 10.0, 10.0]).view([1, 4]);
        let rhs = Tensor::of_slice(&[
            0f32, 0.0, 10.0, 10.0, //
            0.0, 5.0, 10.0, 15.0, //
            20.0, 20.0, 30.0, 30.0,
        ])
        .view([3, 4]);
        let iou = iou_matrix(&lhs, &rhs);

        assert_eq!(iou.size(), vec![1, 3]);
        assert_abs_diff_eq!(iou.double_value(&[0, 0]), 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(iou.double_value(&[0, 1]), 50.0 / 150.0, epsilon = 1e-6);
        assert_abs_diff_eq!(iou.double_value(&[0, 2]), 0.0, epsilon = 1e-6);
    }
}
