#![forbid(unsafe_code)]

pub mod sumproduct;

use pw_core::{Shape, Tensor, Value, ValueError};

pub use sumproduct::{Factor, FactorId, NaiveSumProduct, SharedMemo, SharedSession, SumProduct};

// ── Tensor errors ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
    /// Two shapes cannot be broadcast together.
    BroadcastMismatch { left: Shape, right: Shape },
    /// An axis index does not address an existing dimension.
    AxisOutOfRange { axis: i32, rank: usize },
    /// A mask does not share the shape of the value it selects from.
    MaskShapeMismatch { value: Shape, mask: Shape },
    /// Tensor construction error.
    Value(ValueError),
}

impl std::fmt::Display for TensorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BroadcastMismatch { left, right } => {
                write!(
                    f,
                    "cannot broadcast shapes {:?} and {:?}",
                    left.dims, right.dims
                )
            }
            Self::AxisOutOfRange { axis, rank } => {
                write!(f, "axis {axis} out of range for rank {rank}")
            }
            Self::MaskShapeMismatch { value, mask } => {
                write!(
                    f,
                    "mask shape {:?} does not match value shape {:?}",
                    mask.dims, value.dims
                )
            }
            Self::Value(err) => write!(f, "tensor value error: {err}"),
        }
    }
}

impl std::error::Error for TensorError {}

impl From<ValueError> for TensorError {
    fn from(err: ValueError) -> Self {
        Self::Value(err)
    }
}

// ── Index arithmetic ───────────────────────────────────────────────

fn strides_of(dims: &[u32]) -> Vec<usize> {
    let mut strides = vec![1_usize; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1] as usize;
    }
    strides
}

fn flat_to_multi(flat: usize, strides: &[usize]) -> Vec<usize> {
    let mut multi = Vec::with_capacity(strides.len());
    let mut remainder = flat;
    for &stride in strides {
        multi.push(remainder / stride);
        remainder %= stride;
    }
    multi
}

/// Flat index into a (possibly narrower) operand for an output coordinate,
/// right-aligned, with extent-one axes pinned at zero.
fn broadcast_index(multi: &[usize], dims: &[u32], strides: &[usize]) -> usize {
    let offset = multi.len() - dims.len();
    let mut idx = 0;
    for (i, &dim) in dims.iter().enumerate() {
        if dim != 1 {
            idx += multi[offset + i] * strides[i];
        }
    }
    idx
}

fn count_of(dims: &[u32]) -> usize {
    dims.iter().map(|d| *d as usize).product()
}

// ── Broadcasting ───────────────────────────────────────────────────

/// Right-aligned broadcast of two shapes: trailing axes must match or one
/// of them must have extent one.
pub fn broadcast_shapes(left: &Shape, right: &Shape) -> Result<Shape, TensorError> {
    let rank = left.rank().max(right.rank());
    let mut dims = vec![1_u32; rank];
    for i in 0..rank {
        let l = if i < left.rank() {
            left.dims[left.rank() - 1 - i]
        } else {
            1
        };
        let r = if i < right.rank() {
            right.dims[right.rank() - 1 - i]
        } else {
            1
        };
        dims[rank - 1 - i] = if l == r || r == 1 {
            l
        } else if l == 1 {
            r
        } else {
            return Err(TensorError::BroadcastMismatch {
                left: left.clone(),
                right: right.clone(),
            });
        };
    }
    Ok(Shape { dims })
}

/// Materialize `value` at exactly `target` (which must be reachable from
/// the value's shape by broadcasting).
pub fn broadcast_to(value: &Value, target: &Shape) -> Result<Value, TensorError> {
    let joined = broadcast_shapes(&value.shape(), target)?;
    if &joined != target {
        return Err(TensorError::BroadcastMismatch {
            left: value.shape(),
            right: target.clone(),
        });
    }

    if target.rank() == 0 {
        return Ok(value.clone());
    }

    let count = count_of(&target.dims);
    let out_strides = strides_of(&target.dims);
    let elements = match value {
        Value::Scalar(v) => vec![*v; count],
        Value::Tensor(t) => {
            let src_strides = strides_of(&t.shape.dims);
            let mut elements = Vec::with_capacity(count);
            for flat in 0..count {
                let multi = flat_to_multi(flat, &out_strides);
                elements.push(t.elements[broadcast_index(&multi, &t.shape.dims, &src_strides)]);
            }
            elements
        }
    };
    Ok(Value::Tensor(Tensor::new(target.clone(), elements)?))
}

/// Broadcast every value to the common joint shape.
pub fn broadcast_all(values: &[&Value]) -> Result<Vec<Value>, TensorError> {
    let mut joint = Shape::scalar();
    for value in values {
        joint = broadcast_shapes(&joint, &value.shape())?;
    }
    values.iter().map(|v| broadcast_to(v, &joint)).collect()
}

// ── Elementwise arithmetic ─────────────────────────────────────────

fn binary_elementwise(
    left: &Value,
    right: &Value,
    op: impl Fn(f64, f64) -> f64,
) -> Result<Value, TensorError> {
    match (left, right) {
        (Value::Scalar(l), Value::Scalar(r)) => Ok(Value::scalar(op(*l, *r))),
        (Value::Scalar(l), Value::Tensor(r)) => {
            let elements = r.elements.iter().map(|&x| op(*l, x)).collect();
            Ok(Value::Tensor(Tensor {
                shape: r.shape.clone(),
                elements,
            }))
        }
        (Value::Tensor(l), Value::Scalar(r)) => {
            let elements = l.elements.iter().map(|&x| op(x, *r)).collect();
            Ok(Value::Tensor(Tensor {
                shape: l.shape.clone(),
                elements,
            }))
        }
        (Value::Tensor(l), Value::Tensor(r)) => {
            if l.shape == r.shape {
                let elements = l
                    .elements
                    .iter()
                    .zip(r.elements.iter())
                    .map(|(&a, &b)| op(a, b))
                    .collect();
                return Ok(Value::Tensor(Tensor {
                    shape: l.shape.clone(),
                    elements,
                }));
            }

            let out_shape = broadcast_shapes(&l.shape, &r.shape)?;
            let out_strides = strides_of(&out_shape.dims);
            let l_strides = strides_of(&l.shape.dims);
            let r_strides = strides_of(&r.shape.dims);
            let count = count_of(&out_shape.dims);
            let mut elements = Vec::with_capacity(count);
            for flat in 0..count {
                let multi = flat_to_multi(flat, &out_strides);
                let a = l.elements[broadcast_index(&multi, &l.shape.dims, &l_strides)];
                let b = r.elements[broadcast_index(&multi, &r.shape.dims, &r_strides)];
                elements.push(op(a, b));
            }
            Ok(Value::Tensor(Tensor::new(out_shape, elements)?))
        }
    }
}

fn unary_elementwise(value: &Value, op: impl Fn(f64) -> f64) -> Value {
    match value {
        Value::Scalar(v) => Value::scalar(op(*v)),
        Value::Tensor(t) => Value::Tensor(Tensor {
            shape: t.shape.clone(),
            elements: t.elements.iter().map(|&x| op(x)).collect(),
        }),
    }
}

pub fn add(left: &Value, right: &Value) -> Result<Value, TensorError> {
    binary_elementwise(left, right, |a, b| a + b)
}

pub fn sub(left: &Value, right: &Value) -> Result<Value, TensorError> {
    binary_elementwise(left, right, |a, b| a - b)
}

pub fn mul(left: &Value, right: &Value) -> Result<Value, TensorError> {
    binary_elementwise(left, right, |a, b| a * b)
}

#[must_use]
pub fn exp(value: &Value) -> Value {
    unary_elementwise(value, f64::exp)
}

#[must_use]
pub fn neg(value: &Value) -> Value {
    unary_elementwise(value, |x| -x)
}

/// Elementwise `value > threshold` as a 0/1 mask of the same shape.
#[must_use]
pub fn gt_scalar(value: &Value, threshold: f64) -> Value {
    unary_elementwise(value, |x| if x > threshold { 1.0 } else { 0.0 })
}

// ── Reductions and axis ops ────────────────────────────────────────

/// Extent of the addressed axis.
pub fn axis_extent(value: &Value, axis: i32) -> Result<u32, TensorError> {
    match value {
        Value::Scalar(_) => Err(TensorError::AxisOutOfRange { axis, rank: 0 }),
        Value::Tensor(t) => {
            let idx = t
                .shape
                .resolve_axis(axis)
                .ok_or(TensorError::AxisOutOfRange {
                    axis,
                    rank: t.rank(),
                })?;
            Ok(t.shape.dims[idx])
        }
    }
}

/// Sum along one axis (negative axes count from the trailing dimension).
pub fn sum_axis(value: &Value, axis: i32, keepdim: bool) -> Result<Value, TensorError> {
    let tensor = match value {
        Value::Scalar(_) => return Err(TensorError::AxisOutOfRange { axis, rank: 0 }),
        Value::Tensor(t) => t,
    };
    let idx = tensor
        .shape
        .resolve_axis(axis)
        .ok_or(TensorError::AxisOutOfRange {
            axis,
            rank: tensor.rank(),
        })?;

    let mut out_dims = tensor.shape.dims.clone();
    if keepdim {
        out_dims[idx] = 1;
    } else {
        out_dims.remove(idx);
    }
    let out_shape = Shape { dims: out_dims };
    let out_strides = strides_of(&out_shape.dims);
    let in_strides = strides_of(&tensor.shape.dims);

    let mut out = vec![0.0_f64; count_of(&out_shape.dims)];
    for flat in 0..tensor.len() {
        let mut multi = flat_to_multi(flat, &in_strides);
        if keepdim {
            multi[idx] = 0;
        } else {
            multi.remove(idx);
        }
        let mut out_idx = 0;
        for (k, &m) in multi.iter().enumerate() {
            out_idx += m * out_strides[k];
        }
        out[out_idx] += tensor.elements[flat];
    }
    Ok(Value::Tensor(Tensor::new(out_shape, out)?))
}

/// Sum every element down to one scalar.
#[must_use]
pub fn sum_all(value: &Value) -> Value {
    match value {
        Value::Scalar(v) => Value::scalar(*v),
        Value::Tensor(t) => Value::scalar(t.elements.iter().sum()),
    }
}

/// Drop leading axes of extent one. A value squeezed all the way down
/// collapses to a scalar.
#[must_use]
pub fn squeeze_leading(value: &Value) -> Value {
    match value {
        Value::Scalar(_) => value.clone(),
        Value::Tensor(t) => {
            let shape = t.shape.strip_leading_units();
            if shape == t.shape {
                value.clone()
            } else if shape.rank() == 0 {
                Value::scalar(t.elements[0])
            } else {
                Value::Tensor(Tensor {
                    shape,
                    elements: t.elements.clone(),
                })
            }
        }
    }
}

#[must_use]
pub fn all_nonzero(mask: &Value) -> bool {
    match mask {
        Value::Scalar(v) => *v != 0.0,
        Value::Tensor(t) => t.elements.iter().all(|&x| x != 0.0),
    }
}

/// Keep the entries of `value` where `mask` is nonzero, flattened to a
/// vector. The mask must already share the value's shape; broadcast both
/// first.
pub fn masked_select(value: &Value, mask: &Value) -> Result<Value, TensorError> {
    if value.shape() != mask.shape() {
        return Err(TensorError::MaskShapeMismatch {
            value: value.shape(),
            mask: mask.shape(),
        });
    }
    let entries: &[f64] = match value {
        Value::Scalar(v) => std::slice::from_ref(v),
        Value::Tensor(t) => &t.elements,
    };
    let keeps: &[f64] = match mask {
        Value::Scalar(m) => std::slice::from_ref(m),
        Value::Tensor(t) => &t.elements,
    };
    let elements: Vec<f64> = entries
        .iter()
        .zip(keeps.iter())
        .filter(|(_, &keep)| keep != 0.0)
        .map(|(&x, _)| x)
        .collect();
    Ok(Value::Tensor(Tensor::new(
        Shape::vector(elements.len() as u32),
        elements,
    )?))
}

/// Reduce `value` down toward `target` so the result is broadcastable back
/// up to `target`: leading axes beyond the target's rank are summed out,
/// and right-aligned axes held at extent one by the target are collapsed
/// with keep-dim.
pub fn reduce_to_shape(value: &Value, target: &Shape) -> Result<Value, TensorError> {
    let mut v = value.clone();
    while v.rank() > target.rank() {
        v = sum_axis(&v, 0, false)?;
    }

    let offset = target.rank() - v.rank();
    for i in 0..v.rank() {
        let current = match &v {
            Value::Tensor(t) => t.shape.dims[i],
            Value::Scalar(_) => break,
        };
        let wanted = target.dims[offset + i];
        if wanted == 1 && current > 1 {
            v = sum_axis(&v, i as i32, true)?;
        } else if current != wanted && current != 1 && wanted != 1 {
            return Err(TensorError::BroadcastMismatch {
                left: value.shape(),
                right: target.clone(),
            });
        }
    }
    Ok(v)
}
