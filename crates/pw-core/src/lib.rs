#![forbid(unsafe_code)]

pub mod trace;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub use trace::{Enumerate, InferConfig, Site, SiteKind, Trace, TraceError, plate_stacks};

// ── Shapes and values ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub dims: Vec<u32>,
}

impl Shape {
    #[must_use]
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    #[must_use]
    pub fn vector(len: u32) -> Self {
        Self { dims: vec![len] }
    }

    #[must_use]
    pub fn of(dims: &[u32]) -> Self {
        Self {
            dims: dims.to_vec(),
        }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn element_count(&self) -> Option<u64> {
        self.dims
            .iter()
            .try_fold(1_u64, |acc, dim| acc.checked_mul(u64::from(*dim)))
    }

    /// Drop leading axes of extent one. These are broadcast no-ops, so two
    /// shapes that differ only in leading units describe interchangeable
    /// values.
    #[must_use]
    pub fn strip_leading_units(&self) -> Self {
        let first_kept = self.dims.iter().position(|&d| d != 1);
        match first_kept {
            Some(idx) => Self {
                dims: self.dims[idx..].to_vec(),
            },
            None => Self::scalar(),
        }
    }

    /// Resolve an axis index (negative means counted from the trailing
    /// dimension) to a concrete position, if it addresses an existing axis.
    #[must_use]
    pub fn resolve_axis(&self, axis: i32) -> Option<usize> {
        let rank = self.rank();
        if axis >= 0 {
            let idx = axis as usize;
            (idx < rank).then_some(idx)
        } else {
            let back = axis.unsigned_abs() as usize;
            (back <= rank).then(|| rank - back)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Shape,
    pub elements: Vec<f64>,
}

impl Tensor {
    pub fn new(shape: Shape, elements: Vec<f64>) -> Result<Self, ValueError> {
        let expected_count = shape.element_count().ok_or(ValueError::ShapeOverflow {
            shape: shape.clone(),
        })?;

        if expected_count != elements.len() as u64 {
            return Err(ValueError::ElementCountMismatch {
                shape,
                expected_count,
                actual_count: elements.len(),
            });
        }

        Ok(Self { shape, elements })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }
}

/// A scalar-or-tensor quantity. Log-probability terms, correction weights,
/// and costs all travel as `Value`s so scalar bookkeeping (for example a
/// summed log-denominator) and full tensors share one arithmetic surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Scalar(f64),
    Tensor(Tensor),
}

impl Value {
    #[must_use]
    pub fn scalar(value: f64) -> Self {
        Self::Scalar(value)
    }

    pub fn vector(values: &[f64]) -> Result<Self, ValueError> {
        Ok(Self::Tensor(Tensor::new(
            Shape::vector(values.len() as u32),
            values.to_vec(),
        )?))
    }

    pub fn tensor(dims: &[u32], elements: Vec<f64>) -> Result<Self, ValueError> {
        Ok(Self::Tensor(Tensor::new(Shape::of(dims), elements)?))
    }

    #[must_use]
    pub fn shape(&self) -> Shape {
        match self {
            Self::Scalar(_) => Shape::scalar(),
            Self::Tensor(t) => t.shape.clone(),
        }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        match self {
            Self::Scalar(_) => 0,
            Self::Tensor(t) => t.rank(),
        }
    }

    #[must_use]
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Self::Scalar(_) => None,
            Self::Tensor(tensor) => Some(tensor),
        }
    }

    /// Extract the single element of a scalar or one-element tensor.
    #[must_use]
    pub fn item(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            Self::Tensor(t) if t.len() == 1 => Some(t.elements[0]),
            Self::Tensor(_) => None,
        }
    }

    /// The exact-zero sentinel: a scalar bitwise zero marks a term that
    /// contributes nothing and is skipped outright. A tensor whose entries
    /// happen to all be zero is NOT the sentinel.
    #[must_use]
    pub fn is_identically_zero(&self) -> bool {
        matches!(self, Self::Scalar(v) if *v == 0.0)
    }

    /// Cut the value out of gradient tracking.
    ///
    /// This is the injected autograd capability: the host value type carries
    /// no tape, so detaching is value-identity here, but estimator code
    /// routes every stop-gradient point through this call so a tape-backed
    /// value type drops in behind the same surface.
    #[must_use]
    pub fn detach(&self) -> Self {
        self.clone()
    }
}

// ── Value errors ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    ShapeOverflow {
        shape: Shape,
    },
    ElementCountMismatch {
        shape: Shape,
        expected_count: u64,
        actual_count: usize,
    },
}

impl std::fmt::Display for ValueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShapeOverflow { shape } => {
                write!(f, "shape element count overflowed: {:?}", shape.dims)
            }
            Self::ElementCountMismatch {
                shape,
                expected_count,
                actual_count,
            } => {
                write!(
                    f,
                    "tensor element count mismatch for shape {:?}: expected {}, got {}",
                    shape.dims, expected_count, actual_count
                )
            }
        }
    }
}

impl std::error::Error for ValueError {}

// ── Plate frames ───────────────────────────────────────────────────

/// One vectorized (or sequential) conditionally-independent batch context.
///
/// A vectorized frame owns a tensor axis, indexed negatively from the
/// trailing dimension. A sequential frame is a bookkeeping context with no
/// axis. Identity (equality, hashing, ordering) is by `(name, dim)` only;
/// two frames with the same identity but different recorded sizes are the
/// same frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub name: String,
    pub dim: Option<i32>,
    pub size: u32,
    pub vectorized: bool,
}

impl Frame {
    #[must_use]
    pub fn vectorized(name: impl Into<String>, dim: i32, size: u32) -> Self {
        Self {
            name: name.into(),
            dim: Some(dim),
            size,
            vectorized: true,
        }
    }

    #[must_use]
    pub fn sequential(name: impl Into<String>, size: u32) -> Self {
        Self {
            name: name.into(),
            dim: None,
            size,
            vectorized: false,
        }
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.dim == other.dim
    }
}

impl Eq for Frame {}

impl PartialOrd for Frame {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Frame {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.name, self.dim).cmp(&(&other.name, other.dim))
    }
}

impl std::hash::Hash for Frame {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.dim.hash(state);
    }
}

// ── Ordinals ───────────────────────────────────────────────────────

/// The set of frames enclosing a site, partially ordered by inclusion.
///
/// `upstream_or_equal` is the partial order: `a.upstream_or_equal(&b)` holds
/// iff every frame of `a` also encloses `b`, i.e. quantities at `a` are
/// visible to (and correct) everything at `b`. The derived `Ord` is an
/// arbitrary total order used only for deterministic map iteration; it does
/// NOT encode upstream-ness.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Ordinal(BTreeSet<Frame>);

impl Ordinal {
    #[must_use]
    pub fn empty() -> Self {
        Self(BTreeSet::new())
    }

    pub fn from_frames(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self(frames.into_iter().collect())
    }

    /// Build an ordinal from a frame stack, keeping only vectorized frames.
    /// Sequential frames carry no tensor axis and never participate in
    /// context-keyed aggregation.
    pub fn vectorized_from<'a>(frames: impl IntoIterator<Item = &'a Frame>) -> Self {
        Self(
            frames
                .into_iter()
                .filter(|f| f.vectorized)
                .cloned()
                .collect(),
        )
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn contains(&self, frame: &Frame) -> bool {
        self.0.contains(frame)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.0.iter()
    }

    /// The subset partial order: true iff `self` ⊆ `other`, i.e. everything
    /// sampled at `self` is upstream of (or at) `other`.
    #[must_use]
    pub fn upstream_or_equal(&self, other: &Self) -> bool {
        self.0.is_subset(&other.0)
    }

    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self(self.0.union(&other.0).cloned().collect())
    }

    #[must_use]
    pub fn with(&self, frame: Frame) -> Self {
        let mut frames = self.0.clone();
        frames.insert(frame);
        Self(frames)
    }
}
