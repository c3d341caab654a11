// HostArray - dtype-tagged host ndarray fed into input blobs
//
// The push path snapshots caller data as a HostArray, and OfBlob buffers
// hold raw bytes that are reinterpreted with bytemuck on the way in and out.

use bytemuck::Pod;
use half::f16;
use ndarray::{ArrayD, Dimension, IxDyn};

use oxflow_core::{DType, Shape, WithDType};

use crate::{Error, Result};

/// Element types a HostArray can carry.
pub trait HostElement: WithDType + Pod {
    fn wrap(array: ArrayD<Self>) -> HostArray;
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostArray {
    F16(ArrayD<f16>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
    I8(ArrayD<i8>),
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
    U8(ArrayD<u8>),
}

macro_rules! host_element {
    ($ty:ty, $variant:ident) => {
        impl HostElement for $ty {
            fn wrap(array: ArrayD<Self>) -> HostArray {
                HostArray::$variant(array)
            }
        }
    };
}

host_element!(f16, F16);
host_element!(f32, F32);
host_element!(f64, F64);
host_element!(i8, I8);
host_element!(i32, I32);
host_element!(i64, I64);
host_element!(u8, U8);

macro_rules! each_variant {
    ($self:expr, $a:ident => $body:expr) => {
        match $self {
            HostArray::F16($a) => $body,
            HostArray::F32($a) => $body,
            HostArray::F64($a) => $body,
            HostArray::I8($a) => $body,
            HostArray::I32($a) => $body,
            HostArray::I64($a) => $body,
            HostArray::U8($a) => $body,
        }
    };
}

fn bytes_of<T: Pod>(array: &ArrayD<T>) -> Vec<u8> {
    let elems: Vec<T> = array.iter().copied().collect();
    bytemuck::cast_slice(&elems).to_vec()
}

fn from_raw<T: HostElement>(shape: &Shape, bytes: &[u8]) -> Result<HostArray> {
    let elems: Vec<T> = bytemuck::pod_collect_to_vec(bytes);
    let array = ArrayD::from_shape_vec(IxDyn(shape.dims()), elems)
        .map_err(|e| Error::PushMismatch(format!("cannot view buffer as {shape}: {e}")))?;
    Ok(T::wrap(array))
}

impl HostArray {
    pub fn dtype(&self) -> DType {
        match self {
            HostArray::F16(_) => DType::F16,
            HostArray::F32(_) => DType::F32,
            HostArray::F64(_) => DType::F64,
            HostArray::I8(_) => DType::I8,
            HostArray::I32(_) => DType::I32,
            HostArray::I64(_) => DType::I64,
            HostArray::U8(_) => DType::U8,
        }
    }

    pub fn shape(&self) -> Shape {
        each_variant!(self, a => Shape::from(a.shape()))
    }

    pub fn rank(&self) -> usize {
        each_variant!(self, a => a.ndim())
    }

    pub fn elem_count(&self) -> usize {
        each_variant!(self, a => a.len())
    }

    /// Row-major element bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        each_variant!(self, a => bytes_of(a))
    }

    /// Rebuild an array of `dtype` and `shape` from row-major bytes.
    pub fn from_bytes(dtype: DType, shape: &Shape, bytes: &[u8]) -> Result<Self> {
        let expected = shape.elem_count() * dtype.size_in_bytes();
        if bytes.len() != expected {
            return Err(Error::PushMismatch(format!(
                "{} bytes cannot hold {shape} of {dtype}",
                bytes.len()
            )));
        }
        match dtype {
            DType::F16 => from_raw::<f16>(shape, bytes),
            DType::F32 => from_raw::<f32>(shape, bytes),
            DType::F64 => from_raw::<f64>(shape, bytes),
            DType::I8 => from_raw::<i8>(shape, bytes),
            DType::I32 => from_raw::<i32>(shape, bytes),
            DType::I64 => from_raw::<i64>(shape, bytes),
            DType::U8 => from_raw::<u8>(shape, bytes),
        }
    }

    /// Elements converted to f64, row-major.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        each_variant!(self, a => a.iter().map(|v| WithDType::to_f64(*v)).collect())
    }

    pub fn as_array<T: HostElement>(&self) -> Option<ArrayD<T>> {
        if self.dtype() != T::DTYPE {
            return None;
        }
        let bytes = self.to_bytes();
        let elems: Vec<T> = bytemuck::pod_collect_to_vec(&bytes);
        ArrayD::from_shape_vec(IxDyn(self.shape().dims()), elems).ok()
    }
}

impl<T: HostElement, D: Dimension> From<ndarray::Array<T, D>> for HostArray {
    fn from(array: ndarray::Array<T, D>) -> Self {
        T::wrap(array.into_dyn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array};

    #[test]
    fn test_metadata() {
        let a = HostArray::from(Array::<f32, _>::zeros((2, 3)));
        assert_eq!(a.dtype(), DType::F32);
        assert_eq!(a.shape(), Shape::from((2, 3)));
        assert_eq!(a.rank(), 2);
        assert_eq!(a.elem_count(), 6);
    }

    #[test]
    fn test_bytes_follow_logical_order() {
        // a transposed view is not contiguous in memory
        let a = array![[1i32, 2], [3, 4]].reversed_axes();
        let h = HostArray::from(a.to_owned());
        let back = HostArray::from_bytes(DType::I32, &h.shape(), &h.to_bytes()).unwrap();
        assert_eq!(back.to_f64_vec(), vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_from_bytes_checks_length() {
        assert!(HostArray::from_bytes(DType::F64, &Shape::from(2), &[0u8; 8]).is_err());
    }

    #[test]
    fn test_half_and_typed_view() {
        let h = HostArray::from(array![f16::from_f32(1.5), f16::from_f32(-2.0)]);
        assert_eq!(h.dtype(), DType::F16);
        assert_eq!(h.to_f64_vec(), vec![1.5, -2.0]);
        assert!(h.as_array::<f32>().is_none());
        assert_eq!(h.as_array::<f16>().unwrap().len(), 2);
    }
}
