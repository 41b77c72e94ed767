#![forbid(unsafe_code)]

pub mod context_sum;
pub mod dice;

pub use context_sum::ContextSum;
pub use dice::{CostTable, DiceOperator, LogFactor};

use pw_tensor::TensorError;

// ── Estimator errors ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EstimatorError {
    /// A frame's axis does not address an existing dimension of the value
    /// accumulated under it. Indicates a caller bug in frame bookkeeping;
    /// not recoverable.
    FrameAxisOutOfRange {
        frame: String,
        axis: Option<i32>,
        rank: usize,
    },
    /// A sequentially enumerated site lacks its total-count metadata.
    MissingEnumTotal { site: String },
    /// A site has no entry in the ordinal lookup.
    MissingOrdinal { site: String },
    /// Broadcast or shape failure surfaced from the tensor collaborator.
    Tensor(TensorError),
}

impl std::fmt::Display for EstimatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FrameAxisOutOfRange { frame, axis, rank } => match axis {
                Some(axis) => write!(
                    f,
                    "frame {frame} axis {axis} does not address a dimension of a rank-{rank} value"
                ),
                None => write!(
                    f,
                    "vectorized frame {frame} carries no axis for a rank-{rank} value"
                ),
            },
            Self::MissingEnumTotal { site } => {
                write!(
                    f,
                    "sequentially enumerated site {site} is missing its enumeration total"
                )
            }
            Self::MissingOrdinal { site } => {
                write!(f, "site {site} has no ordinal in the supplied ordering")
            }
            Self::Tensor(err) => write!(f, "tensor operation failed: {err}"),
        }
    }
}

impl std::error::Error for EstimatorError {}

impl From<TensorError> for EstimatorError {
    fn from(err: TensorError) -> Self {
        Self::Tensor(err)
    }
}
