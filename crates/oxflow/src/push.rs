// Push path - feeding host arrays into input blobs
//
// A push is split in two halves so the caller's data can be released right
// away:
//
//   1. on the caller thread: validate, snapshot the arrays into a callback
//   2. on the VM worker: allocate the input op's OfBlob, run the callback
//      once, then signal the PushHandle
//
// Usage:
//
//   let cb = make_push_ndarray_callback(&HostArray::from(batch));
//   let handle = runtime.async_push("Input_0", cb)?;
//   handle.wait()?;

use std::sync::mpsc;

use oxflow_core::{BlobDesc, DType, Shape};

use crate::host_array::HostArray;
use crate::vm::{completion, Completion, JobInstance};
use crate::{Error, Result};

/// The destination buffer of one input op, as seen by a push callback.
#[derive(Debug, Clone)]
pub struct OfBlob {
    desc: BlobDesc,
    data: Vec<u8>,
    /// Shapes written by the last copy; one per array for tensor lists.
    shapes: Vec<Shape>,
}

impl OfBlob {
    /// A zeroed buffer sized for the static shape of `desc`.
    pub fn new(desc: BlobDesc) -> Result<Self> {
        let bytes = desc
            .shape
            .checked_elem_count()?
            .checked_mul(desc.data_type.size_in_bytes())
            .ok_or_else(|| Error::PushMismatch(format!("blob {} is too large", desc.shape)))?;
        Ok(Self {
            data: vec![0; bytes],
            shapes: Vec::new(),
            desc,
        })
    }

    pub fn static_shape(&self) -> &Shape {
        &self.desc.shape
    }

    pub fn data_type(&self) -> DType {
        self.desc.data_type
    }

    pub fn desc(&self) -> &BlobDesc {
        &self.desc
    }

    pub fn shapes(&self) -> &[Shape] {
        &self.shapes
    }

    pub fn is_filled(&self) -> bool {
        !self.shapes.is_empty()
    }

    fn check_array(&self, array: &HostArray) -> Result<()> {
        if array.dtype() != self.desc.data_type {
            return Err(Error::PushMismatch(format!(
                "array of {} pushed into blob of {}",
                array.dtype(),
                self.desc.data_type
            )));
        }
        if array.rank() != self.desc.shape.rank() {
            return Err(Error::RankMismatch {
                expected: self.desc.shape.rank(),
                got: array.rank(),
            });
        }
        Ok(())
    }

    fn check_capacity(&self, elem_count: usize) -> Result<()> {
        if elem_count > self.desc.shape.elem_count() {
            return Err(Error::Capacity {
                capacity: self.desc.shape.clone(),
                got: elem_count,
            });
        }
        Ok(())
    }

    pub fn copy_from_ndarray(&mut self, array: &HostArray) -> Result<()> {
        self.check_array(array)?;
        self.check_capacity(array.elem_count())?;
        let shape = array.shape();
        if !self.desc.is_dynamic && shape != self.desc.shape {
            return Err(Error::PushShape {
                expected: self.desc.shape.clone(),
                got: shape,
            });
        }
        let bytes = array.to_bytes();
        self.data[..bytes.len()].copy_from_slice(&bytes);
        self.shapes = vec![shape];
        Ok(())
    }

    /// Pack `arrays` back to back; their total size is bounded by the
    /// static shape.
    pub fn copy_from_ndarray_list(&mut self, arrays: &[HostArray]) -> Result<()> {
        for array in arrays {
            self.check_array(array)?;
        }
        self.check_capacity(arrays.iter().map(HostArray::elem_count).sum())?;
        let mut offset = 0;
        for array in arrays {
            let bytes = array.to_bytes();
            self.data[offset..offset + bytes.len()].copy_from_slice(&bytes);
            offset += bytes.len();
        }
        self.shapes = arrays.iter().map(HostArray::shape).collect();
        Ok(())
    }

    /// The arrays last copied in, in order.
    pub fn to_host_arrays(&self) -> Result<Vec<HostArray>> {
        let size = self.desc.data_type.size_in_bytes();
        let mut offset = 0;
        let mut out = Vec::with_capacity(self.shapes.len());
        for shape in &self.shapes {
            let len = shape.elem_count() * size;
            let bytes = self.data.get(offset..offset + len).ok_or_else(|| {
                Error::PushMismatch(format!("blob buffer too small for {shape}"))
            })?;
            out.push(HostArray::from_bytes(self.desc.data_type, shape, bytes)?);
            offset += len;
        }
        Ok(out)
    }

    /// The single array last copied in; the whole static buffer if none was.
    pub fn to_host_array(&self) -> Result<HostArray> {
        match self.shapes.as_slice() {
            [] => HostArray::from_bytes(self.desc.data_type, &self.desc.shape, &self.data),
            [_] => self
                .to_host_arrays()?
                .pop()
                .ok_or_else(|| Error::PushMismatch("blob holds no array".into())),
            many => Err(Error::PushMismatch(format!(
                "blob holds a list of {} arrays",
                many.len()
            ))),
        }
    }
}

/// Writes one push into its destination blob. Runs at most once.
pub type PushCallback = Box<dyn FnOnce(&mut OfBlob) -> Result<()> + Send>;

/// Snapshot `array`; the copy re-checks capacity against the real buffer.
pub fn make_push_ndarray_callback(array: &HostArray) -> PushCallback {
    let copied = array.clone();
    Box::new(move |blob: &mut OfBlob| blob.copy_from_ndarray(&copied))
}

pub fn make_push_ndarray_list_callback(arrays: &[HostArray]) -> PushCallback {
    let copied = arrays.to_vec();
    Box::new(move |blob: &mut OfBlob| blob.copy_from_ndarray_list(&copied))
}

/// Caller-side data for one ArgBlobDef push.
#[derive(Debug, Clone)]
pub enum PushData {
    /// Fixed blobs take one array of exactly the declared shape.
    Array(HostArray),
    /// Mirrored blobs take one array per sub-blob.
    ArrayList(Vec<HostArray>),
    /// Mirrored-list blobs take one list of arrays per sub-blob.
    ArrayLists(Vec<Vec<HostArray>>),
}

impl PushData {
    pub fn kind_name(&self) -> &'static str {
        match self {
            PushData::Array(_) => "array",
            PushData::ArrayList(_) => "array list",
            PushData::ArrayLists(_) => "list of array lists",
        }
    }
}

pub type PushHandle = Completion<()>;

/// The push job launched for one AsyncPush call.
pub struct PushJobInstance {
    job_name: String,
    callback: Option<PushCallback>,
    done: mpsc::Sender<Result<()>>,
}

impl PushJobInstance {
    pub fn new(job_name: impl Into<String>, callback: PushCallback) -> (Self, PushHandle) {
        let (done, handle) = completion();
        let instance = Self {
            job_name: job_name.into(),
            callback: Some(callback),
            done,
        };
        (instance, handle)
    }
}

impl JobInstance for PushJobInstance {
    fn job_name(&self) -> &str {
        &self.job_name
    }

    fn push_blob(&mut self, blob: &mut OfBlob) -> Result<()> {
        let callback = self
            .callback
            .take()
            .ok_or_else(|| Error::Dispatch(format!("push '{}' already ran", self.job_name)))?;
        callback(blob)
    }

    fn finish(self: Box<Self>, result: Result<()>) {
        let _ = self.done.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array};

    fn blob(dims: (usize, usize), dynamic: bool) -> OfBlob {
        let mut desc = BlobDesc::new(Shape::from(dims), DType::F32);
        desc.is_dynamic = dynamic;
        OfBlob::new(desc).unwrap()
    }

    #[test]
    fn test_oversized_blob_is_an_error() {
        let desc = BlobDesc::new(Shape::from((1usize << 62, 2)), DType::F32);
        assert!(matches!(OfBlob::new(desc), Err(Error::PushMismatch(_))));
    }

    #[test]
    fn test_fixed_blob_needs_exact_shape() {
        let mut b = blob((2, 3), false);
        let small = HostArray::from(Array::<f32, _>::zeros((1, 3)));
        assert!(matches!(
            b.copy_from_ndarray(&small),
            Err(Error::PushShape { .. })
        ));
        let exact = HostArray::from(Array::<f32, _>::ones((2, 3)));
        b.copy_from_ndarray(&exact).unwrap();
        assert_eq!(b.to_host_array().unwrap(), exact);
    }

    #[test]
    fn test_dynamic_blob_bounded_by_capacity() {
        let mut b = blob((2, 3), true);
        let small = HostArray::from(array![[1.0f32, 2.0, 3.0]]);
        b.copy_from_ndarray(&small).unwrap();
        assert_eq!(b.shapes(), &[Shape::from((1, 3))]);
        let big = HostArray::from(Array::<f32, _>::zeros((3, 3)));
        assert!(matches!(
            b.copy_from_ndarray(&big),
            Err(Error::Capacity { got: 9, .. })
        ));
        let wrong_rank = HostArray::from(array![1.0f32]);
        assert!(matches!(
            b.copy_from_ndarray(&wrong_rank),
            Err(Error::RankMismatch { .. })
        ));
        let wrong_type = HostArray::from(array![[1i32]]);
        assert!(matches!(
            b.copy_from_ndarray(&wrong_type),
            Err(Error::PushMismatch(_))
        ));
    }

    #[test]
    fn test_list_uses_aggregate_capacity() {
        let mut b = blob((2, 3), true);
        let a = HostArray::from(Array::<f32, _>::ones((1, 3)));
        let c = HostArray::from(Array::<f32, _>::zeros((1, 2)));
        b.copy_from_ndarray_list(&[a.clone(), c.clone()]).unwrap();
        assert_eq!(b.to_host_arrays().unwrap(), vec![a.clone(), c]);
        assert!(b.to_host_array().is_err());
        assert!(b.copy_from_ndarray_list(&[a.clone(), a.clone(), a]).is_err());
    }

    #[test]
    fn test_callback_snapshots_data() {
        let mut source = Array::<f32, _>::zeros((2, 3));
        let cb = make_push_ndarray_callback(&HostArray::from(source.clone()));
        source.fill(7.0);
        let mut b = blob((2, 3), false);
        cb(&mut b).unwrap();
        assert_eq!(b.to_host_array().unwrap().to_f64_vec(), vec![0.0; 6]);
    }

    #[test]
    fn test_push_instance_runs_callback_once() {
        let cb = make_push_ndarray_callback(&HostArray::from(Array::<f32, _>::ones((2, 3))));
        let (instance, handle) = PushJobInstance::new("System-Push-x", cb);
        let mut instance: Box<dyn JobInstance> = Box::new(instance);
        let mut b = blob((2, 3), false);
        instance.push_blob(&mut b).unwrap();
        assert!(instance.push_blob(&mut b).is_err());
        assert!(handle.try_wait().is_none());
        instance.finish(Ok(()));
        handle.wait().unwrap();
    }
}
