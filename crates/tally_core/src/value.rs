//! Typed values exchanged between parties: dense n-dimensional `f64` arrays.
//!
//! A [`Value`] is what a dataflow node resolves to. On the wire it is encoded
//! as CBOR, so any party implementation that speaks CBOR can read it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

/// A dense, row-major n-dimensional array. A scalar has an empty shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawValue")]
pub struct Value {
    shape: Vec<usize>,
    data: Vec<f64>,
}

/// Unchecked wire form; validated into [`Value`] on deserialization.
#[derive(Deserialize)]
struct RawValue {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl TryFrom<RawValue> for Value {
    type Error = String;

    fn try_from(raw: RawValue) -> Result<Self, Self::Error> {
        Value::from_vec(raw.shape, raw.data).map_err(|e| e.to_string())
    }
}

/// Element-wise binary operators supported by the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Add,
    Mul,
    Pow,
}

impl Operator {
    /// Short name used in node labels.
    pub fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Mul => "mul",
            Self::Pow => "pow",
        }
    }

    fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Add => a + b,
            Self::Mul => a * b,
            Self::Pow => a.powf(b),
        }
    }
}

impl Value {
    /// A zero-dimensional value.
    pub fn scalar(x: f64) -> Self {
        Self {
            shape: Vec::new(),
            data: vec![x],
        }
    }

    /// Build a value from a shape and row-major data.
    pub fn from_vec(shape: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        let expected = element_count(&shape)?;
        if expected != data.len() {
            return Err(RuntimeError::Shape(format!(
                "shape {shape:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// An `n x 1` column vector.
    pub fn column(values: &[f64]) -> Self {
        Self {
            shape: vec![values.len(), 1],
            data: values.to_vec(),
        }
    }

    /// A two-dimensional value from equally long rows.
    pub fn matrix<R: AsRef<[f64]>>(rows: &[R]) -> Result<Self> {
        let cols = rows.first().map_or(0, |r| r.as_ref().len());
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            if row.len() != cols {
                return Err(RuntimeError::Shape(format!(
                    "row {i} has {} columns, expected {cols}",
                    row.len()
                )));
            }
            data.extend_from_slice(row);
        }
        Self::from_vec(vec![rows.len(), cols], data)
    }

    /// A value of the given shape filled with ones.
    pub fn ones(shape: &[usize]) -> Result<Self> {
        let len = element_count(shape)?;
        Ok(Self {
            shape: shape.to_vec(),
            data: vec![1.0; len],
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }

    /// Element at a multi-dimensional index, if in bounds.
    pub fn get(&self, index: &[usize]) -> Option<f64> {
        if index.len() != self.shape.len() {
            return None;
        }
        let mut flat = 0;
        for (&i, &dim) in index.iter().zip(&self.shape) {
            if i >= dim {
                return None;
            }
            flat = flat * dim + i;
        }
        self.data.get(flat).copied()
    }

    /// Element-wise `self + other` with broadcasting.
    pub fn add(&self, other: &Value) -> Result<Value> {
        self.zip_with(other, Operator::Add)
    }

    /// Element-wise `self * other` with broadcasting.
    pub fn mul(&self, other: &Value) -> Result<Value> {
        self.zip_with(other, Operator::Mul)
    }

    /// Element-wise `self ** other` with broadcasting.
    pub fn pow(&self, other: &Value) -> Result<Value> {
        self.zip_with(other, Operator::Pow)
    }

    /// Apply `op` element-wise, broadcasting both operands to a common shape.
    pub fn zip_with(&self, other: &Value, op: Operator) -> Result<Value> {
        let shape = broadcast_shape(&self.shape, &other.shape)?;
        let lhs = broadcast_strides(&self.shape, &shape);
        let rhs = broadcast_strides(&other.shape, &shape);

        let len = element_count(&shape)?;
        let mut data = Vec::with_capacity(len);
        for flat in 0..len {
            let mut rem = flat;
            let (mut a, mut b) = (0, 0);
            for axis in (0..shape.len()).rev() {
                let idx = rem % shape[axis];
                rem /= shape[axis];
                a += idx * lhs[axis];
                b += idx * rhs[axis];
            }
            data.push(op.apply(self.data[a], other.data[b]));
        }
        Ok(Value { shape, data })
    }

    /// Encode as a CBOR payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_cbor::to_vec(self)?)
    }

    /// Decode a CBOR payload.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_cbor::from_slice(bytes)?)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::scalar(x)
    }
}

/// Number of elements in `shape`, or a `Shape` error if it overflows `usize`.
fn element_count(shape: &[usize]) -> Result<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| RuntimeError::Shape(format!("shape {shape:?} is too large")))
}

/// Right-aligned broadcast of two shapes.
fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let ndim = a.len().max(b.len());
    let mut out = vec![0; ndim];
    for axis in 0..ndim {
        let da = dim_from_right(a, ndim - 1 - axis);
        let db = dim_from_right(b, ndim - 1 - axis);
        out[axis] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => {
                return Err(RuntimeError::Shape(format!(
                    "operands could not be broadcast together with shapes {a:?} {b:?}"
                )));
            }
        };
    }
    Ok(out)
}

fn dim_from_right(shape: &[usize], from_right: usize) -> usize {
    if from_right < shape.len() {
        shape[shape.len() - 1 - from_right]
    } else {
        1
    }
}

/// Strides of `shape` viewed through `out`; broadcast axes get stride 0.
fn broadcast_strides(shape: &[usize], out: &[usize]) -> Vec<usize> {
    let offset = out.len() - shape.len();
    let mut own = vec![1; shape.len()];
    for k in (0..shape.len().saturating_sub(1)).rev() {
        own[k] = own[k + 1] * shape[k + 1];
    }
    (0..out.len())
        .map(|axis| {
            if axis < offset || shape[axis - offset] == 1 {
                0
            } else {
                own[axis - offset]
            }
        })
        .collect()
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn nested(f: &mut fmt::Formatter<'_>, shape: &[usize], data: &[f64]) -> fmt::Result {
            match shape.split_first() {
                None => write!(f, "{}", data[0]),
                Some((&dim, rest)) => {
                    let step: usize = rest.iter().product();
                    write!(f, "[")?;
                    for i in 0..dim {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        nested(f, rest, &data[i * step..(i + 1) * step])?;
                    }
                    write!(f, "]")
                }
            }
        }
        nested(f, &self.shape, &self.data)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_rejects_wrong_length() {
        assert!(Value::from_vec(vec![2, 2], vec![1.0; 3]).is_err());
        assert!(Value::from_vec(vec![2, 2], vec![1.0; 4]).is_ok());
    }

    #[test]
    fn test_matrix_rejects_ragged_rows() {
        let rows: Vec<Vec<f64>> = vec![vec![1.0, 2.0], vec![3.0]];
        assert!(Value::matrix(&rows).is_err());
    }

    #[test]
    fn test_broadcast_column_over_matrix() {
        let col = Value::column(&[1.0, 1.0, 1.0]);
        let m = Value::matrix(&[[1.0, 1.0, 1.0], [2.0, 2.0, 2.0], [3.0, 3.0, 3.0]]).unwrap();

        let sum = col.add(&m).unwrap();
        assert_eq!(sum.shape(), &[3, 3]);
        assert_eq!(
            sum,
            Value::matrix(&[[2.0, 2.0, 2.0], [3.0, 3.0, 3.0], [4.0, 4.0, 4.0]]).unwrap()
        );

        let prod = sum.mul(&Value::column(&[0.0, 1.0, 2.0])).unwrap();
        assert_eq!(
            prod,
            Value::matrix(&[[0.0, 0.0, 0.0], [3.0, 3.0, 3.0], [8.0, 8.0, 8.0]]).unwrap()
        );
    }

    #[test]
    fn test_broadcast_scalar_and_row() {
        let row = Value::from_vec(vec![3], vec![1.0, 2.0, 3.0]).unwrap();
        let squared = row.pow(&Value::scalar(2.0)).unwrap();
        assert_eq!(squared.data(), &[1.0, 4.0, 9.0]);

        let m = Value::ones(&[2, 3]).unwrap();
        let shifted = m.add(&row).unwrap();
        assert_eq!(shifted.shape(), &[2, 3]);
        assert_eq!(shifted.get(&[1, 2]), Some(4.0));
    }

    #[test]
    fn test_incompatible_shapes() {
        let a = Value::ones(&[3, 2]).unwrap();
        let b = Value::ones(&[3, 3]).unwrap();
        assert!(matches!(a.add(&b), Err(RuntimeError::Shape(_))));
    }

    #[test]
    fn test_get_out_of_bounds() {
        let m = Value::ones(&[2, 2]).unwrap();
        assert_eq!(m.get(&[2, 0]), None);
        assert_eq!(m.get(&[0]), None);
        assert_eq!(Value::scalar(5.0).get(&[]), Some(5.0));
    }

    #[test]
    fn test_cbor_payload_decodes_to_same_value() {
        let v = Value::matrix(&[[1.5, -2.0], [0.0, 8.25]]).unwrap();
        let bytes = v.encode().unwrap();
        assert_eq!(Value::decode(&bytes).unwrap(), v);
    }

    #[test]
    fn test_decode_rejects_inconsistent_shape() {
        #[derive(Serialize)]
        struct Bad {
            shape: Vec<usize>,
            data: Vec<f64>,
        }
        let bytes = serde_cbor::to_vec(&Bad {
            shape: vec![4],
            data: vec![1.0],
        })
        .unwrap();
        assert!(Value::decode(&bytes).is_err());
        assert!(Value::decode(&[]).is_err());
    }

    #[test]
    fn test_decode_rejects_overflowing_shape() {
        #[derive(Serialize)]
        struct Huge {
            shape: Vec<usize>,
            data: Vec<f64>,
        }
        let bytes = serde_cbor::to_vec(&Huge {
            shape: vec![1usize << 32, 1usize << 32],
            data: Vec::new(),
        })
        .unwrap();
        assert!(Value::decode(&bytes).is_err());

        assert!(matches!(
            Value::from_vec(vec![usize::MAX, 2], Vec::new()),
            Err(RuntimeError::Shape(_))
        ));
        assert!(matches!(Value::ones(&[usize::MAX, 2]), Err(RuntimeError::Shape(_))));
    }

    #[test]
    fn test_display_nested() {
        let m = Value::matrix(&[[0.0, 0.0], [3.0, 3.0]]).unwrap();
        assert_eq!(m.to_string(), "[[0, 0], [3, 3]]");
        assert_eq!(Value::scalar(2.5).to_string(), "2.5");
    }
}
