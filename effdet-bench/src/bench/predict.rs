use super::{DetectionNet, NetInput};
use crate::{
    anchors::Anchors,
    common::*,
    config::BenchConfig,
    post_process::{DetectionDecoder, DetectionDecoderInit, TopKSelector, TopKSelectorInit},
};

/// Inference bench producing fixed-size detection tensors.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct DetBenchPredict<N>
where
    N: DetectionNet,
{
    #[derivative(Debug = "ignore")]
    net: N,
    config: BenchConfig,
    anchors: Anchors,
    top_k: TopKSelector,
    decoder: DetectionDecoder,
}

impl<N> DetBenchPredict<N>
where
    N: DetectionNet,
{
    pub fn new(net: N, config: BenchConfig) -> Result<Self> {
        config.validate()?;

        let anchors = Anchors::new(&config)?;
        let top_k = TopKSelectorInit {
            num_classes: config.num_classes,
            num_levels: config.num_levels(),
            max_detection_points: config.max_detection_points,
        }
        .build()?;
        let decoder = DetectionDecoderInit {
            max_detection_points: config.max_detection_points,
            nms_iou_threshold: config.nms_iou_threshold.map(|iou| iou.raw()),
        }
        .build()?;

        info!(
            "built prediction bench with {} anchors and top {} selection",
            anchors.num_anchors(),
            config.max_detection_points
        );

        Ok(Self {
            net,
            config,
            anchors,
            top_k,
            decoder,
        })
    }

    /// Run detection on a batch of images or precomputed feature maps.
    ///
    /// `image_scales` has shape `[batch]` and `image_sizes` has shape
    /// `[batch, 2]` in `(width, height)` order. Returns a `[batch, K, 6]`
    /// tensor with columns `[x1, y1, x2, y2, score, class + 1]`.
    pub fn predict(
        &mut self,
        input: &NetInput,
        image_scales: &Tensor,
        image_sizes: &Tensor,
    ) -> Result<Tensor> {
        let batch_size = input.batch_size()?;
        ensure!(
            image_scales.numel() as i64 == batch_size,
            "expect {} image scales, but get {}",
            batch_size,
            image_scales.numel()
        );

        tch::no_grad(|| -> Result<_> {
            let outputs = self.net.forward_t(input, false)?;
            let top_k = self.top_k.forward(&outputs)?;
            let anchor_boxes = self.anchors.boxes().to_device(input.device());
            self.decoder
                .forward(&top_k, &anchor_boxes, image_scales, image_sizes)
        })
    }

    pub fn net(&self) -> &N {
        &self.net
    }

    pub fn net_mut(&mut self) -> &mut N {
        &mut self.net
    }

    pub fn into_inner(self) -> N {
        self.net
    }

    pub fn anchors(&self) -> &Anchors {
        &self.anchors
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }
}
