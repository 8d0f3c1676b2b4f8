use crate::common::*;

/// Output formatter initializer.
#[derive(Debug, Clone)]
pub struct OutputFormatterInit {
    /// Detections scored below this value are dropped.
    pub score_threshold: f64,
}

impl Default for OutputFormatterInit {
    fn default() -> Self {
        Self {
            score_threshold: 0.1,
        }
    }
}

impl OutputFormatterInit {
    pub fn build(self) -> Result<OutputFormatter> {
        let Self { score_threshold } = self;
        ensure!(
            score_threshold.is_finite(),
            "score_threshold must be a finite number"
        );
        Ok(OutputFormatter { score_threshold })
    }
}

/// The surviving detections of one image.
#[derive(Debug, TensorLike)]
pub struct ImageDetections {
    /// The index of the image within the batch.
    #[tensor_like(copy)]
    pub batch_index: i64,
    /// Boxes in `[x1, y1, x2, y2]` order with shape `[n, 4]`.
    pub boxes: Tensor,
    /// 0-based class indices with shape `[n]`.
    pub labels: Tensor,
    /// Scores with shape `[n]`.
    pub scores: Tensor,
}

impl ImageDetections {
    pub fn len(&self) -> i64 {
        self.scores.size()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Converts `[batch, K, 6]` detection tensors into per-image records.
#[derive(Debug, Clone)]
pub struct OutputFormatter {
    score_threshold: f64,
}

impl OutputFormatter {
    pub fn score_threshold(&self) -> f64 {
        self.score_threshold
    }

    /// Format a batch of score-sorted detections.
    ///
    /// Each image keeps the detections before the first row scored below
    /// the threshold. Rows of the background label are dropped and images
    /// with no remaining detection are omitted from the output.
    pub fn forward(&self, detections: &Tensor) -> Result<Vec<ImageDetections>> {
        let (batch_size, _, num_cols) = detections.size3()?;
        ensure!(
            num_cols == 6,
            "expect 6 columns per detection, but get {}",
            num_cols
        );

        let outputs: Vec<_> = (0..batch_size)
            .filter_map(|batch_index| {
                self.format_image(batch_index, &detections.get(batch_index))
            })
            .collect();

        Ok(outputs)
    }

    fn format_image(&self, batch_index: i64, detections: &Tensor) -> Option<ImageDetections> {
        let scores = detections.select(1, 4);

        // rows are sorted by score, so stop at the first one below the threshold
        let num_kept = Vec::<f32>::from(&scores.to_device(Device::Cpu))
            .into_iter()
            .take_while(|&score| score as f64 >= self.score_threshold)
            .count() as i64;
        trace!(
            "image {} keeps {} detections above threshold {}",
            batch_index,
            num_kept,
            self.score_threshold
        );

        let kept = detections.narrow(0, 0, num_kept);
        let labels = kept.select(1, 5).to_kind(Kind::Int64) - 1i64;
        let foreground = labels.ne(-1i64).nonzero().view([-1]);
        if foreground.size()[0] == 0 {
            return None;
        }

        Some(ImageDetections {
            batch_index,
            boxes: kept.narrow(1, 0, 4).index_select(0, &foreground),
            labels: labels.index_select(0, &foreground),
            scores: kept.select(1, 4).index_select(0, &foreground),
        })
    }
}
