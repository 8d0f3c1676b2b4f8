//! Batch collation of per-image annotations and images.

use crate::common::*;
use std::mem;

pub use batched_target::*;
pub use collator::*;
pub use target_record::*;

mod target_record {
    use super::*;

    /// A field value of a per-image annotation.
    #[derive(Debug)]
    pub enum TargetValue {
        /// Per-instance values. The first dimension indexes instances and
        /// the dtype is preserved.
        Tensor(Tensor),
        /// Per-instance values collated as float tensors.
        Array(ArrayD<f32>),
        /// A per-image integer.
        Int(i64),
        /// A per-image float.
        Float(f64),
        /// A short per-image integer sequence, such as an image size.
        IntSeq(Vec<i64>),
        /// A short per-image float sequence.
        FloatSeq(Vec<f64>),
    }

    impl TargetValue {
        pub(super) fn kind_name(&self) -> &'static str {
            match self {
                Self::Tensor(_) => "tensor",
                Self::Array(_) => "array",
                Self::Int(_) => "int",
                Self::Float(_) => "float",
                Self::IntSeq(_) => "int sequence",
                Self::FloatSeq(_) => "float sequence",
            }
        }
    }

    /// The annotation of one image.
    ///
    /// The fields `boxes`, `labels`, `img_scale` and `img_size` are expected
    /// by the benches. Additional fields are collated as well.
    #[derive(Debug, Default)]
    pub struct TargetRecord {
        fields: IndexMap<String, TargetValue>,
    }

    impl TargetRecord {
        /// Create a record with required fields.
        ///
        /// `boxes` has shape `[instances, 4]` in `[ymin, xmin, ymax, xmax]`
        /// order, `labels` has shape `[instances]` with 1-based classes, and
        /// `img_size` is `(width, height)`.
        pub fn new(
            boxes: Tensor,
            labels: Tensor,
            img_scale: f64,
            img_size: (i64, i64),
        ) -> Self {
            let (width, height) = img_size;
            let mut record = Self::default();
            record.insert("boxes", TargetValue::Tensor(boxes));
            record.insert("labels", TargetValue::Tensor(labels));
            record.insert("img_scale", TargetValue::Float(img_scale));
            record.insert("img_size", TargetValue::IntSeq(vec![width, height]));
            record
        }

        pub fn insert(
            &mut self,
            key: impl Into<String>,
            value: TargetValue,
        ) -> Option<TargetValue> {
            self.fields.insert(key.into(), value)
        }

        pub fn with(mut self, key: impl Into<String>, value: TargetValue) -> Self {
            self.insert(key, value);
            self
        }

        pub fn get(&self, key: &str) -> Option<&TargetValue> {
            self.fields.get(key)
        }

        pub fn len(&self) -> usize {
            self.fields.len()
        }

        pub fn is_empty(&self) -> bool {
            self.fields.is_empty()
        }

        pub fn iter(&self) -> impl Iterator<Item = (&str, &TargetValue)> {
            self.fields.iter().map(|(key, value)| (key.as_str(), value))
        }
    }
}

mod batched_target {
    use super::*;

    /// Fixed-shape batched annotations keyed by field name.
    #[derive(Debug)]
    pub struct BatchedTarget {
        pub(super) fields: IndexMap<String, Tensor>,
    }

    impl BatchedTarget {
        pub fn get(&self, key: &str) -> Result<&Tensor> {
            self.fields
                .get(key)
                .ok_or_else(|| format_err!("the batched target has no '{}' field", key))
        }

        /// Boxes in shape `[batch, max_instances, 4]`.
        pub fn boxes(&self) -> Result<&Tensor> {
            self.get("boxes")
        }

        /// Labels in shape `[batch, max_instances]`.
        pub fn labels(&self) -> Result<&Tensor> {
            self.get("labels")
        }

        /// Image scales in shape `[batch]`.
        pub fn img_scale(&self) -> Result<&Tensor> {
            self.get("img_scale")
        }

        /// Image `(width, height)` in shape `[batch, 2]`.
        pub fn img_size(&self) -> Result<&Tensor> {
            self.get("img_size")
        }

        pub fn keys(&self) -> impl Iterator<Item = &str> {
            self.fields.keys().map(|key| key.as_str())
        }

        pub fn to_device(&self, device: Device) -> Self {
            let fields = self
                .fields
                .iter()
                .map(|(key, tensor)| (key.clone(), tensor.to_device(device)))
                .collect();
            Self { fields }
        }

        pub fn into_inner(self) -> IndexMap<String, Tensor> {
            self.fields
        }
    }
}

mod collator {
    use super::*;

    /// Batch collator initializer.
    #[derive(Debug, Clone)]
    pub struct CollatorInit {
        /// The instance capacity of each image.
        pub max_instances: usize,
    }

    impl Default for CollatorInit {
        fn default() -> Self {
            Self { max_instances: 75 }
        }
    }

    impl CollatorInit {
        pub fn build(self) -> Result<Collator> {
            let Self { max_instances } = self;
            ensure!(max_instances > 0, "max_instances must be positive");
            Ok(Collator { max_instances })
        }
    }

    /// Pads per-image annotations into fixed-shape batched tensors.
    #[derive(Debug, Clone)]
    pub struct Collator {
        max_instances: usize,
    }

    impl Collator {
        pub fn max_instances(&self) -> usize {
            self.max_instances
        }

        /// Collate a batch of annotations.
        ///
        /// The field set, field kinds and dtypes follow the first record.
        /// Per-instance fields are zero-padded to `max_instances` rows.
        pub fn collate_targets(&self, targets: &[TargetRecord]) -> Result<BatchedTarget> {
            let first = targets
                .first()
                .ok_or_else(|| format_err!("cannot collate an empty batch"))?;
            let batch_size = targets.len() as i64;
            let max_instances = self.max_instances as i64;

            let fields: IndexMap<String, Tensor> = first
                .iter()
                .map(|(key, value)| -> Result<_> {
                    let tensor = match value {
                        TargetValue::Tensor(tensor) => {
                            let shape = tensor.size();
                            ensure!(
                                !shape.is_empty(),
                                "tensor field '{}' must have an instance dimension",
                                key
                            );
                            let batched_shape =
                                padded_shape(batch_size, max_instances, &shape[1..]);
                            Tensor::zeros(&batched_shape, (tensor.kind(), Device::Cpu))
                        }
                        TargetValue::Array(array) => {
                            ensure!(
                                array.ndim() > 0,
                                "array field '{}' must have an instance dimension",
                                key
                            );
                            let tail: Vec<i64> =
                                array.shape()[1..].iter().map(|&dim| dim as i64).collect();
                            let batched_shape = padded_shape(batch_size, max_instances, &tail);
                            Tensor::zeros(&batched_shape, (Kind::Float, Device::Cpu))
                        }
                        TargetValue::IntSeq(seq) => {
                            Tensor::zeros(&[batch_size, seq.len() as i64], (Kind::Int, Device::Cpu))
                        }
                        TargetValue::FloatSeq(seq) => Tensor::zeros(
                            &[batch_size, seq.len() as i64],
                            (Kind::Float, Device::Cpu),
                        ),
                        TargetValue::Int(_) => {
                            Tensor::zeros(&[batch_size], (Kind::Int64, Device::Cpu))
                        }
                        TargetValue::Float(_) => {
                            Tensor::zeros(&[batch_size], (Kind::Float, Device::Cpu))
                        }
                    };
                    Ok((key.to_string(), tensor))
                })
                .try_collect()?;

            for (index, record) in targets.iter().enumerate() {
                ensure!(
                    record.len() == first.len(),
                    "record {} has {} fields, but the first record has {}",
                    index,
                    record.len(),
                    first.len()
                );

                for (key, value) in record.iter() {
                    let expect = first.get(key).ok_or_else(|| {
                        format_err!(
                            "record {} has field '{}' absent in the first record",
                            index,
                            key
                        )
                    })?;
                    ensure!(
                        mem::discriminant(value) == mem::discriminant(expect),
                        "field '{}' of record {} is {}, but {} is expected",
                        key,
                        index,
                        value.kind_name(),
                        expect.kind_name()
                    );
                    let batched = &fields[key];
                    self.fill_row(batched, index as i64, key, value)?;
                }
            }

            if log::log_enabled!(log::Level::Debug) {
                if let Some(TargetValue::Tensor(_)) = first.get("labels") {
                    let counts: Vec<_> = targets
                        .iter()
                        .map(|record| match record.get("labels") {
                            Some(TargetValue::Tensor(labels)) => labels.size()[0],
                            _ => 0,
                        })
                        .collect();
                    debug!("collated {} images with instance counts {:?}", batch_size, counts);
                }
            }

            Ok(BatchedTarget { fields })
        }

        fn fill_row(
            &self,
            batched: &Tensor,
            index: i64,
            key: &str,
            value: &TargetValue,
        ) -> Result<()> {
            let mut row = batched.get(index);

            match value {
                TargetValue::Tensor(tensor) => {
                    let shape = tensor.size();
                    ensure!(
                        !shape.is_empty(),
                        "tensor field '{}' of record {} must have an instance dimension",
                        key,
                        index
                    );
                    self.copy_instances(&mut row, index, key, &shape, tensor)?;
                }
                TargetValue::Array(array) => {
                    let shape: Vec<i64> = array.shape().iter().map(|&dim| dim as i64).collect();
                    ensure!(
                        !shape.is_empty(),
                        "array field '{}' of record {} must have an instance dimension",
                        key,
                        index
                    );
                    let values: Vec<f32> = array.iter().cloned().collect();
                    let tensor = Tensor::of_slice(&values).reshape(&shape);
                    self.copy_instances(&mut row, index, key, &shape, &tensor)?;
                }
                TargetValue::IntSeq(seq) => {
                    let len = row.size()[0];
                    ensure!(
                        seq.len() as i64 == len,
                        "field '{}' of record {} has length {}, but {} is expected",
                        key,
                        index,
                        seq.len(),
                        len
                    );
                    row.copy_(&Tensor::of_slice(seq).to_kind(row.kind()));
                }
                TargetValue::FloatSeq(seq) => {
                    let len = row.size()[0];
                    ensure!(
                        seq.len() as i64 == len,
                        "field '{}' of record {} has length {}, but {} is expected",
                        key,
                        index,
                        seq.len(),
                        len
                    );
                    row.copy_(&Tensor::of_slice(seq).to_kind(row.kind()));
                }
                TargetValue::Int(value) => {
                    let _ = row.fill_(*value);
                }
                TargetValue::Float(value) => {
                    let _ = row.fill_(*value);
                }
            }

            Ok(())
        }

        fn copy_instances(
            &self,
            row: &mut Tensor,
            index: i64,
            key: &str,
            shape: &[i64],
            values: &Tensor,
        ) -> Result<()> {
            let num_instances = shape[0];
            ensure!(
                num_instances <= self.max_instances as i64,
                "record {} has {} instances in field '{}', exceeding the capacity {}",
                index,
                num_instances,
                key,
                self.max_instances
            );
            let row_shape = row.size();
            ensure!(
                shape[1..] == row_shape[1..],
                "field '{}' of record {} has shape {:?}, but trailing shape {:?} is expected",
                key,
                index,
                shape,
                &row_shape[1..]
            );

            if num_instances > 0 {
                let mut dst = row.narrow(0, 0, num_instances);
                dst.copy_(&values.to_kind(row.kind()).to_device(row.device()));
            }
            Ok(())
        }
    }

    fn padded_shape(batch_size: i64, max_instances: i64, tail: &[i64]) -> Vec<i64> {
        iter::once(batch_size)
            .chain(iter::once(max_instances))
            .chain(tail.iter().cloned())
            .collect()
    }
}

/// Stack images of identical shape into a batch.
///
/// The output dtype follows the first image.
pub fn collate_images(images: &[Tensor]) -> Result<Tensor> {
    let first = images
        .first()
        .ok_or_else(|| format_err!("cannot collate an empty image list"))?;
    let shape = first.size();
    let kind = first.kind();

    let images: Vec<_> = images
        .iter()
        .enumerate()
        .map(|(index, image)| -> Result<_> {
            ensure!(
                image.size() == shape,
                "image {} has shape {:?}, but {:?} is expected",
                index,
                image.size(),
                shape
            );
            Ok(image.to_kind(kind))
        })
        .try_collect()?;

    Ok(Tensor::stack(&images, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn record(num_instances: i64) -> TargetRecord {
        let boxes = Tensor::ones(&[num_instances, 4], (Kind::Float, Device::Cpu));
        let labels = Tensor::ones(&[num_instances], (Kind::Int64, Device::Cpu));
        TargetRecord::new(boxes, labels, 1.0, (512, 384))
    }

    #[test]
    fn full_and_empty_records() -> Result<()> {
        let collator = CollatorInit::default().build()?;
        let target = collator.collate_targets(&[record(75), record(0)])?;

        let boxes = target.boxes()?;
        let labels = target.labels()?;
        assert_eq!(boxes.size(), vec![2, 75, 4]);
        assert_eq!(labels.size(), vec![2, 75]);

        // a full record has no padding
        ensure!(bool::from(boxes.get(0).eq(1.0).all()));
        ensure!(bool::from(labels.get(0).eq(1i64).all()));

        // an empty record is all background
        ensure!(bool::from(boxes.get(1).eq(0.0).all()));
        ensure!(bool::from(labels.get(1).eq(0i64).all()));
        Ok(())
    }

    #[test]
    fn partial_record_is_zero_padded() -> Result<()> {
        let collator = CollatorInit { max_instances: 8 }.build()?;
        let target = collator.collate_targets(&[record(3)])?;

        let boxes = target.boxes()?;
        assert_eq!(boxes.size(), vec![1, 8, 4]);
        ensure!(bool::from(boxes.i((0, 0..3)).eq(1.0).all()));
        ensure!(bool::from(boxes.i((0, 3..)).eq(0.0).all()));
        Ok(())
    }

    #[test]
    fn reject_instance_overflow() -> Result<()> {
        let collator = CollatorInit::default().build()?;
        let result = collator.collate_targets(&[record(2), record(76)]);
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn field_dtypes() -> Result<()> {
        let collator = CollatorInit { max_instances: 4 }.build()?;
        let make = |scale: f64| {
            record(2)
                .with("image_id", TargetValue::Int(7))
                .with("area", TargetValue::Array(Array2::<f32>::ones((2, 1)).into_dyn()))
                .with("pad", TargetValue::FloatSeq(vec![0.5, 1.5]))
                .with("img_scale", TargetValue::Float(scale))
        };
        let target = collator.collate_targets(&[make(1.0), make(2.0)])?;

        assert_eq!(target.boxes()?.kind(), Kind::Float);
        assert_eq!(target.labels()?.kind(), Kind::Int64);
        assert_eq!(target.get("image_id")?.kind(), Kind::Int64);
        assert_eq!(target.get("image_id")?.size(), vec![2]);
        assert_eq!(target.get("area")?.kind(), Kind::Float);
        assert_eq!(target.get("area")?.size(), vec![2, 4, 1]);
        assert_eq!(target.get("pad")?.size(), vec![2, 2]);

        let img_size = target.img_size()?;
        assert_eq!(img_size.kind(), Kind::Int);
        assert_eq!(img_size.size(), vec![2, 2]);
        assert_eq!(img_size.int64_value(&[1, 0]), 512);
        assert_eq!(img_size.int64_value(&[1, 1]), 384);

        let img_scale = target.img_scale()?;
        assert_eq!(img_scale.kind(), Kind::Float);
        assert_abs_diff_eq!(img_scale.double_value(&[1]), 2.0);

        assert_eq!(
            target.keys().collect::<Vec<_>>(),
            vec!["boxes", "labels", "img_scale", "img_size", "image_id", "area", "pad"]
        );
        Ok(())
    }

    #[test]
    fn reject_field_kind_mismatch() -> Result<()> {
        let collator = CollatorInit::default().build()?;
        let lhs = record(1);
        let rhs = record(1).with("img_scale", TargetValue::Int(1));
        assert!(collator.collate_targets(&[lhs, rhs]).is_err());
        Ok(())
    }

    #[test]
    fn reject_scalar_instance_field() -> Result<()> {
        let collator = CollatorInit::default().build()?;
        let mut scalar = record(1);
        scalar.insert("labels", TargetValue::Tensor(Tensor::from(3i64)));
        assert!(collator.collate_targets(&[record(2), scalar]).is_err());
        Ok(())
    }

    #[test]
    fn stack_images() -> Result<()> {
        let images: Vec<_> = (0..3)
            .map(|index| Tensor::full(&[3, 8, 8], index as f64, (Kind::Float, Device::Cpu)))
            .collect();
        let batch = collate_images(&images)?;
        assert_eq!(batch.size(), vec![3, 3, 8, 8]);
        assert_abs_diff_eq!(batch.double_value(&[2, 0, 0, 0]), 2.0);

        let mismatched = vec![
            Tensor::zeros(&[3, 8, 8], (Kind::Float, Device::Cpu)),
            Tensor::zeros(&[3, 4, 8], (Kind::Float, Device::Cpu)),
        ];
        assert!(collate_images(&mismatched).is_err());
        assert!(collate_images(&[]).is_err());
        Ok(())
    }
}
