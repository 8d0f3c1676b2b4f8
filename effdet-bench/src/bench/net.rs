use crate::{collate::collate_images, common::*};

/// The input of a detection network.
#[derive(Debug, TensorLike)]
pub enum NetInput {
    /// A batch of images in shape `[batch, channels, height, width]`.
    Images(Tensor),
    /// Precomputed feature maps, one `[batch, channels, height, width]`
    /// tensor per pyramid level, fed directly to the head.
    Features(Vec<Tensor>),
}

impl NetInput {
    /// Stack per-image tensors into an image batch.
    pub fn from_images(images: &[Tensor]) -> Result<Self> {
        Ok(Self::Images(collate_images(images)?))
    }

    pub fn batch_size(&self) -> Result<i64> {
        let first = match self {
            Self::Images(images) => images,
            Self::Features(features) => features
                .first()
                .ok_or_else(|| format_err!("the feature map list is empty"))?,
        };
        let (batch_size, _, _, _) = first.size4()?;

        if let Self::Features(features) = self {
            for (index, feature) in features.iter().enumerate() {
                let (level_batch_size, _, _, _) = feature.size4()?;
                ensure!(
                    level_batch_size == batch_size,
                    "feature map {} has batch size {}, but {} is expected",
                    index,
                    level_batch_size,
                    batch_size
                );
            }
        }
        Ok(batch_size)
    }

    pub fn device(&self) -> Device {
        match self {
            Self::Images(images) => images.device(),
            Self::Features(features) => features
                .first()
                .map(|feature| feature.device())
                .unwrap_or(Device::Cpu),
        }
    }
}

impl From<Tensor> for NetInput {
    fn from(images: Tensor) -> Self {
        Self::Images(images)
    }
}

impl From<Vec<Tensor>> for NetInput {
    fn from(features: Vec<Tensor>) -> Self {
        Self::Features(features)
    }
}

/// The backbone/head network driven by the benches.
pub trait DetectionNet {
    /// Run the network on images, or the head alone on precomputed features.
    fn forward_t(&mut self, input: &NetInput, train: bool) -> Result<LevelOutputs>;
}

impl<N> DetectionNet for Box<N>
where
    N: DetectionNet + ?Sized,
{
    fn forward_t(&mut self, input: &NetInput, train: bool) -> Result<LevelOutputs> {
        (**self).forward_t(input, train)
    }
}

/// The raw per-level network outputs.
///
/// The entry at index `i` belongs to pyramid level `min_level + i`. Class
/// tensors have shape `[batch, anchors * classes, height, width]` and box
/// tensors have shape `[batch, anchors * 4, height, width]`.
#[derive(Debug, TensorLike)]
pub struct LevelOutputs {
    pub class_out: Vec<Tensor>,
    pub box_out: Vec<Tensor>,
}

impl LevelOutputs {
    pub fn num_levels(&self) -> usize {
        self.class_out.len()
    }

    pub fn batch_size(&self) -> Result<i64> {
        let first = self
            .class_out
            .first()
            .ok_or_else(|| format_err!("the network produced no output level"))?;
        let (batch_size, _, _, _) = first.size4()?;
        Ok(batch_size)
    }

    /// Concatenate class logits of all levels into `[batch, locations, num_classes]`.
    pub fn flatten_class(&self, num_classes: usize) -> Result<Tensor> {
        flatten_levels(&self.class_out, num_classes as i64)
            .with_context(|| "invalid class outputs")
    }

    /// Concatenate box regressions of all levels into `[batch, locations, 4]`.
    pub fn flatten_box(&self) -> Result<Tensor> {
        flatten_levels(&self.box_out, 4).with_context(|| "invalid box outputs")
    }
}

fn flatten_levels(levels: &[Tensor], num_entries: i64) -> Result<Tensor> {
    ensure!(!levels.is_empty(), "no output level");
    let (batch_size, _, _, _) = levels[0].size4()?;

    let flat: Vec<_> = levels
        .iter()
        .enumerate()
        .map(|(index, tensor)| -> Result<_> {
            let (level_batch_size, channels, _, _) = tensor.size4()?;
            ensure!(
                level_batch_size == batch_size,
                "level {} has batch size {}, but {} is expected",
                index,
                level_batch_size,
                batch_size
            );
            ensure!(
                channels % num_entries == 0,
                "level {} has {} channels, which is not a multiple of {}",
                index,
                channels,
                num_entries
            );

            // [batch, anchors * entries, h, w] -> [batch, h * w * anchors, entries]
            Ok(tensor
                .permute(&[0, 2, 3, 1])
                .reshape(&[batch_size, -1, num_entries]))
        })
        .try_collect()?;

    Ok(Tensor::cat(&flat, 1))
}
