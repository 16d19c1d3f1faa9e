// Tensor element types and constant tensor data

use crate::{ExportError, Result};
use ndarray::{Array1, ArrayD, IxDyn};
use std::fmt;

/// Element types the exporter produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Float,
    Int64,
}

impl DataType {
    /// ONNX `TensorProto.DataType` code
    pub fn onnx_code(self) -> i32 {
        match self {
            DataType::Float => 1,
            DataType::Int64 => 7,
        }
    }

    pub fn from_onnx_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(DataType::Float),
            7 => Some(DataType::Int64),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Float => write!(f, "float32"),
            DataType::Int64 => write!(f, "int64"),
        }
    }
}

/// Concrete tensor contents (initializers, attribute tensors, runtime values)
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Float(ArrayD<f32>),
    Int64(ArrayD<i64>),
}

impl TensorData {
    pub fn from_f32(shape: &[usize], values: Vec<f32>) -> Result<Self> {
        ArrayD::from_shape_vec(IxDyn(shape), values)
            .map(TensorData::Float)
            .map_err(|e| ExportError::InvalidModel(format!("bad f32 tensor shape {:?}: {}", shape, e)))
    }

    pub fn from_i64(shape: &[usize], values: Vec<i64>) -> Result<Self> {
        ArrayD::from_shape_vec(IxDyn(shape), values)
            .map(TensorData::Int64)
            .map_err(|e| ExportError::InvalidModel(format!("bad i64 tensor shape {:?}: {}", shape, e)))
    }

    /// Rank-1 int64 tensor
    pub fn i64_vec(values: &[i64]) -> Self {
        TensorData::Int64(Array1::from(values.to_vec()).into_dyn())
    }

    /// Rank-1 f32 tensor
    pub fn f32_vec(values: &[f32]) -> Self {
        TensorData::Float(Array1::from(values.to_vec()).into_dyn())
    }

    pub fn scalar_f32(value: f32) -> Self {
        TensorData::Float(ArrayD::from_elem(IxDyn(&[]), value))
    }

    pub fn scalar_i64(value: i64) -> Self {
        TensorData::Int64(ArrayD::from_elem(IxDyn(&[]), value))
    }

    pub fn dtype(&self) -> DataType {
        match self {
            TensorData::Float(_) => DataType::Float,
            TensorData::Int64(_) => DataType::Int64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            TensorData::Float(a) => a.shape(),
            TensorData::Int64(a) => a.shape(),
        }
    }

    pub fn dims(&self) -> Vec<i64> {
        self.shape().iter().map(|&d| d as i64).collect()
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::Float(a) => a.len(),
            TensorData::Int64(a) => a.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_f32(&self) -> Option<&ArrayD<f32>> {
        match self {
            TensorData::Float(a) => Some(a),
            TensorData::Int64(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<&ArrayD<i64>> {
        match self {
            TensorData::Int64(a) => Some(a),
            TensorData::Float(_) => None,
        }
    }

    /// Flattened int64 values (row-major)
    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        self.as_i64().map(|a| a.iter().copied().collect())
    }

    /// Flattened f32 values (row-major)
    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        self.as_f32().map(|a| a.iter().copied().collect())
    }

    /// True when every element equals `value`
    pub fn all_equal(&self, value: f64) -> bool {
        match self {
            TensorData::Float(a) => a.iter().all(|&v| v as f64 == value),
            TensorData::Int64(a) => a.iter().all(|&v| v as f64 == value),
        }
    }

    /// Little-endian bytes in row-major order (ONNX `raw_data`)
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            TensorData::Float(a) => {
                let values: Vec<f32> = a.iter().copied().collect();
                if cfg!(target_endian = "little") {
                    bytemuck::cast_slice(&values).to_vec()
                } else {
                    values.iter().flat_map(|v| v.to_le_bytes()).collect()
                }
            }
            TensorData::Int64(a) => {
                let values: Vec<i64> = a.iter().copied().collect();
                if cfg!(target_endian = "little") {
                    bytemuck::cast_slice(&values).to_vec()
                } else {
                    values.iter().flat_map(|v| v.to_le_bytes()).collect()
                }
            }
        }
    }

    /// Decode little-endian `raw_data`
    pub fn from_le_bytes(dtype: DataType, shape: &[usize], bytes: &[u8]) -> Result<Self> {
        match dtype {
            DataType::Float => {
                let values = bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                Self::from_f32(shape, values)
            }
            DataType::Int64 => {
                let values = bytes
                    .chunks_exact(8)
                    .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect();
                Self::from_i64(shape, values)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_le_bytes() {
        let t = TensorData::from_f32(&[2, 2], vec![1.0, -2.0, 3.5, 0.0]).unwrap();
        let bytes = t.to_le_bytes();
        assert_eq!(bytes.len(), 16);
        let back = TensorData::from_le_bytes(DataType::Float, &[2, 2], &bytes).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn test_shape_mismatch_is_an_error() {
        assert!(TensorData::from_i64(&[3], vec![1, 2]).is_err());
    }

    #[test]
    fn test_scalar() {
        let s = TensorData::scalar_i64(2);
        assert!(s.shape().is_empty());
        assert_eq!(s.len(), 1);
        assert_eq!(s.to_i64_vec(), Some(vec![2]));
    }
}
