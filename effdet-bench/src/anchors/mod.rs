//! Anchor box generation, box coding and anchor labeling.

mod box_coder;
mod labeler;

pub use box_coder::*;
pub use labeler::*;

use crate::{common::*, config::BenchConfig};

/// The statistics of anchors on one pyramid level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelAnchorInfo {
    pub level: usize,
    pub stride: usize,
    pub grid_size: usize,
    pub num_anchors: usize,
}

/// The precomputed anchor boxes of a detector.
///
/// Boxes are stored in `[ymin, xmin, ymax, xmax]` order in absolute input
/// image coordinates. They are ordered by level, then feature map row, then
/// column, then anchor, which is the same order used to flatten per-level
/// network outputs.
#[derive(Debug, Getters)]
pub struct Anchors {
    /// The anchor boxes in shape `[num_anchors, 4]`.
    #[get = "pub"]
    boxes: Tensor,
    #[get = "pub"]
    levels: Vec<LevelAnchorInfo>,
}

impl Anchors {
    pub fn new(config: &BenchConfig) -> Result<Self> {
        let BenchConfig {
            min_level,
            max_level,
            num_scales,
            ref aspect_ratios,
            anchor_scale,
            image_size,
            ..
        } = *config;
        ensure!(min_level <= max_level, "min_level must not exceed max_level");
        ensure!(num_scales > 0, "num_scales must be positive");
        ensure!(image_size > 0, "image_size must be positive");

        // (octave scale, x ratio, y ratio) of each anchor on a cell
        let cell_configs: Vec<(f64, f64, f64)> = (0..num_scales)
            .flat_map(|octave| {
                let octave_scale = octave as f64 / num_scales as f64;
                aspect_ratios
                    .iter()
                    .map(move |&(ratio_x, ratio_y)| (octave_scale, ratio_x.raw(), ratio_y.raw()))
            })
            .collect();
        let anchor_scale = anchor_scale.raw();

        let per_level: Vec<(LevelAnchorInfo, Vec<f32>)> = (min_level..=max_level)
            .map(|level| -> Result<_> {
                let stride = 1usize
                    .checked_shl(level as u32)
                    .ok_or_else(|| format_err!("level {} is too large", level))?;
                ensure!(
                    image_size % stride == 0,
                    "image_size {} must be divisible by the stride {} of level {}",
                    image_size,
                    stride,
                    level
                );
                let grid_size = image_size / stride;
                let stride_f = stride as f64;

                let boxes: Vec<f32> = itertools::iproduct!(0..grid_size, 0..grid_size)
                    .flat_map(|(row, col)| {
                        let cy = stride_f * (row as f64 + 0.5);
                        let cx = stride_f * (col as f64 + 0.5);

                        cell_configs
                            .iter()
                            .flat_map(move |&(octave_scale, ratio_x, ratio_y)| {
                                let base_size = anchor_scale * stride_f * 2f64.powf(octave_scale);
                                let half_w = base_size * ratio_x / 2.0;
                                let half_h = base_size * ratio_y / 2.0;
                                [cy - half_h, cx - half_w, cy + half_h, cx + half_w]
                            })
                    })
                    .map(|value| value as f32)
                    .collect();

                let info = LevelAnchorInfo {
                    level,
                    stride,
                    grid_size,
                    num_anchors: boxes.len() / 4,
                };

                Ok((info, boxes))
            })
            .try_collect()?;
        let (levels, level_boxes): (Vec<_>, Vec<_>) = per_level.into_iter().unzip();

        let boxes: Vec<f32> = level_boxes.concat();
        let boxes = Tensor::of_slice(&boxes)
            .view([-1, 4])
            .set_requires_grad(false);

        info!(
            "generated {} anchors over levels {}..={}",
            boxes.size()[0],
            min_level,
            max_level
        );

        Ok(Self { boxes, levels })
    }

    pub fn num_anchors(&self) -> i64 {
        self.boxes.size()[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> BenchConfig {
        BenchConfig {
            min_level: 3,
            max_level: 4,
            num_scales: 2,
            aspect_ratios: vec![(r64(1.0), r64(1.0)), (r64(1.4), r64(0.7))],
            anchor_scale: r64(4.0),
            image_size: 32,
            num_classes: 3,
            ..Default::default()
        }
    }

    #[test]
    fn anchor_count_per_level() -> Result<()> {
        let anchors = Anchors::new(&small_config())?;

        // level 3: 4x4 cells, level 4: 2x2 cells, 4 anchors per cell
        assert_eq!(anchors.num_anchors(), (16 + 4) * 4);
        assert_eq!(anchors.boxes().size(), vec![80, 4]);

        let levels = anchors.levels();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].grid_size, 4);
        assert_eq!(levels[0].num_anchors, 64);
        assert_eq!(levels[1].stride, 16);
        assert_eq!(levels[1].num_anchors, 16);
        Ok(())
    }

    #[test]
    fn first_anchor_geometry() -> Result<()> {
        let anchors = Anchors::new(&small_config())?;
        let boxes = anchors.boxes();

        // the first anchor is centered at (4, 4) with size 4 * 8 = 32
        let first: Vec<f64> = (0..4).map(|col| boxes.double_value(&[0, col])).collect();
        assert_abs_diff_eq!(first[0], -12.0, epsilon = 1e-5);
        assert_abs_diff_eq!(first[1], -12.0, epsilon = 1e-5);
        assert_abs_diff_eq!(first[2], 20.0, epsilon = 1e-5);
        assert_abs_diff_eq!(first[3], 20.0, epsilon = 1e-5);

        // the second anchor on the cell uses the (1.4, 0.7) aspect ratio
        let width = boxes.double_value(&[1, 3]) - boxes.double_value(&[1, 1]);
        let height = boxes.double_value(&[1, 2]) - boxes.double_value(&[1, 0]);
        assert_abs_diff_eq!(width, 32.0 * 1.4, epsilon = 1e-4);
        assert_abs_diff_eq!(height, 32.0 * 0.7, epsilon = 1e-4);

        // the anchors of the next column are shifted by one stride
        let next_cx = (boxes.double_value(&[4, 1]) + boxes.double_value(&[4, 3])) / 2.0;
        assert_abs_diff_eq!(next_cx, 12.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn reject_indivisible_image_size() {
        let config = BenchConfig {
            image_size: 40,
            ..small_config()
        };
        assert!(Anchors::new(&config).is_err());
    }

    #[test]
    fn reject_overflowing_level() {
        let config = BenchConfig {
            min_level: 64,
            max_level: 70,
            ..small_config()
        };
        assert!(Anchors::new(&config).is_err());

        let config = BenchConfig {
            image_size: 0,
            ..small_config()
        };
        assert!(Anchors::new(&config).is_err());
    }
}
