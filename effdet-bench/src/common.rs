pub use anyhow::{bail, ensure, format_err, Context as _, Result};
pub use approx::assert_abs_diff_eq;
pub use derivative::Derivative;
pub use getset::Getters;
pub use indexmap::IndexMap;
pub use itertools::{izip, Itertools as _};
pub use log::{debug, info, trace};
pub use ndarray::ArrayD;
pub use noisy_float::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{iter, path::Path};
pub use tch::{Device, IndexOp, Kind, Reduction, Tensor};
pub use tch_tensor_like::TensorLike;

unzip_n::unzip_n!(pub 3);
