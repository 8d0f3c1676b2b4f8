/// A model possibly wrapped in training containers.
///
/// Wrappers nest to arbitrary depth, for example an EMA copy of a
/// data-parallel replica of a bench.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelWrapper<M> {
    Raw(M),
    /// Exponential moving average of model weights.
    Ema(Box<Self>),
    /// Data-parallel replica.
    Replica(Box<Self>),
    /// Detector bench.
    Bench(Box<Self>),
}

impl<M> ModelWrapper<M> {
    /// Strip one wrapper layer, or return `None` on a raw model.
    pub fn unwrap_once(&self) -> Option<&Self> {
        match self {
            Self::Raw(_) => None,
            Self::Ema(inner) | Self::Replica(inner) | Self::Bench(inner) => Some(&**inner),
        }
    }

    /// Strip all wrapper layers.
    pub fn unwrap_model(&self) -> &M {
        let mut wrapper = self;
        loop {
            match wrapper {
                Self::Raw(model) => return model,
                Self::Ema(inner) | Self::Replica(inner) | Self::Bench(inner) => {
                    wrapper = &**inner;
                }
            }
        }
    }

    pub fn unwrap_model_mut(&mut self) -> &mut M {
        match self {
            Self::Raw(model) => model,
            Self::Ema(inner) | Self::Replica(inner) | Self::Bench(inner) => {
                inner.unwrap_model_mut()
            }
        }
    }

    pub fn into_inner(self) -> M {
        let mut wrapper = self;
        loop {
            match wrapper {
                Self::Raw(model) => return model,
                Self::Ema(inner) | Self::Replica(inner) | Self::Bench(inner) => {
                    wrapper = *inner;
                }
            }
        }
    }

    /// The number of wrapper layers around the model.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut wrapper = self;
        while let Some(inner) = wrapper.unwrap_once() {
            depth += 1;
            wrapper = inner;
        }
        depth
    }
}

impl<M> From<M> for ModelWrapper<M> {
    fn from(model: M) -> Self {
        Self::Raw(model)
    }
}
