use super::{DetectionNet, NetInput};
use crate::{
    anchors::{AnchorLabeler, AnchorLabelerInit, AnchorTargets, Anchors},
    collate::{Collator, CollatorInit, TargetRecord},
    common::*,
    config::BenchConfig,
    loss::{DetectionLoss, DetectionLossInit, DetectionLossOutput},
    post_process::{
        DetectionDecoder, DetectionDecoderInit, ImageDetections, OutputFormatter,
        OutputFormatterInit, TopKSelector, TopKSelectorInit,
    },
};

/// The output of a training bench step.
#[derive(Debug)]
pub struct TrainStepOutput {
    /// The total loss scalar.
    pub loss: Tensor,
    pub class_loss: Tensor,
    pub box_loss: Tensor,
    /// Formatted detections, only produced in eval mode.
    pub detections: Option<Vec<ImageDetections>>,
}

/// Training bench computing the detection loss of a network.
///
/// The bench starts in training mode. In eval mode, a step additionally
/// decodes and formats the detections of the batch.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct DetBenchTrain<N>
where
    N: DetectionNet,
{
    #[derivative(Debug = "ignore")]
    net: N,
    config: BenchConfig,
    train: bool,
    anchors: Anchors,
    collator: Collator,
    labeler: AnchorLabeler,
    loss: DetectionLoss,
    top_k: TopKSelector,
    decoder: DetectionDecoder,
    formatter: OutputFormatter,
}

impl<N> DetBenchTrain<N>
where
    N: DetectionNet,
{
    pub fn new(net: N, config: BenchConfig) -> Result<Self> {
        config.validate()?;

        let anchors = Anchors::new(&config)?;
        let collator = CollatorInit {
            max_instances: config.max_instances,
        }
        .build()?;
        let labeler = AnchorLabelerInit {
            num_classes: config.num_classes,
            match_threshold: config.match_threshold.raw(),
        }
        .build(&anchors)?;
        let loss = DetectionLossInit::from_config(&config).build()?;
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
        let formatter = OutputFormatterInit {
            score_threshold: config.score_threshold.raw(),
        }
        .build()?;

        info!(
            "built training bench with {} anchors and {} classes",
            anchors.num_anchors(),
            config.num_classes
        );

        Ok(Self {
            net,
            config,
            train: true,
            anchors,
            collator,
            labeler,
            loss,
            top_k,
            decoder,
            formatter,
        })
    }

    pub fn set_train(&mut self, train: bool) {
        self.train = train;
    }

    pub fn is_train(&self) -> bool {
        self.train
    }

    /// Compute the loss of a batch against their annotations.
    ///
    /// The input is either an image batch or the precomputed feature maps
    /// of the batch. There is one target record per image.
    ///
    /// # Panics
    /// In eval mode, every `img_scale` must be 1.0.
    pub fn train_step(
        &mut self,
        input: &NetInput,
        targets: &[TargetRecord],
    ) -> Result<TrainStepOutput> {
        let batch_size = input.batch_size()? as usize;
        ensure!(
            batch_size == targets.len(),
            "expect one target per image, but get {} images and {} targets",
            batch_size,
            targets.len()
        );

        let device = input.device();
        let target = self.collator.collate_targets(targets)?.to_device(device);

        let outputs = self.net.forward_t(input, self.train)?;

        let AnchorTargets {
            cls_targets,
            box_targets,
            num_positives,
        } = self
            .labeler
            .batch_label_anchors(batch_size, target.boxes()?, target.labels()?)?;

        let DetectionLossOutput {
            total_loss,
            class_loss,
            box_loss,
        } = self
            .loss
            .forward(&outputs, &cls_targets, &box_targets, &num_positives)?;
        debug!(
            "step loss {:.5} (class {:.5}, box {:.5})",
            total_loss.double_value(&[]),
            class_loss.double_value(&[]),
            box_loss.double_value(&[])
        );

        let detections = if self.train {
            None
        } else {
            let img_scale = target.img_scale()?;
            assert!(
                bool::from(img_scale.eq(1.0).all()),
                "evaluation requires all image scales to be 1.0"
            );

            let detections = tch::no_grad(|| -> Result<_> {
                let top_k = self.top_k.forward(&outputs)?;
                let anchor_boxes = self.anchors.boxes().to_device(device);
                self.decoder
                    .forward(&top_k, &anchor_boxes, img_scale, target.img_size()?)
            })?;
            Some(self.formatter.forward(&detections)?)
        };

        Ok(TrainStepOutput {
            loss: total_loss,
            class_loss,
            box_loss,
            detections,
        })
    }

    /// Detect objects without annotations.
    ///
    /// Every image is assumed to have the configured image size.
    ///
    /// # Panics
    /// Every image scale must be 1.0.
    pub fn infer(
        &mut self,
        input: &NetInput,
        image_scales: &[f64],
    ) -> Result<Vec<ImageDetections>> {
        assert!(
            image_scales.iter().all(|&scale| scale == 1.0),
            "inference requires all image scales to be 1.0"
        );
        let batch_size = input.batch_size()?;
        ensure!(
            batch_size as usize == image_scales.len(),
            "expect one scale per image, but get {} images and {} scales",
            batch_size,
            image_scales.len()
        );

        let device = input.device();
        let image_size = self.config.image_size as i64;

        let detections = tch::no_grad(|| -> Result<_> {
            let outputs = self.net.forward_t(input, self.train)?;
            let top_k = self.top_k.forward(&outputs)?;
            let anchor_boxes = self.anchors.boxes().to_device(device);

            let img_scale = Tensor::of_slice(image_scales)
                .to_kind(Kind::Float)
                .to_device(device);
            let img_size = Tensor::of_slice(&[image_size, image_size])
                .view([1, 2])
                .repeat(&[batch_size, 1])
                .to_device(device);

            self.decoder
                .forward(&top_k, &anchor_boxes, &img_scale, &img_size)
        })?;

        self.formatter.forward(&detections)
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
