//! Training losses of the detection heads.

mod detection_loss;
mod focal_loss;
mod huber_loss;

pub use detection_loss::*;
pub use focal_loss::*;
pub use huber_loss::*;

use crate::common::*;

fn reduce(loss: Tensor, reduction: Reduction) -> Result<Tensor> {
    let loss = match reduction {
        Reduction::None => loss,
        Reduction::Sum => loss.sum(Kind::Float),
        Reduction::Mean => loss.mean(Kind::Float),
        Reduction::Other(code) => bail!("unsupported reduction code {}", code),
    };
    Ok(loss)
}
