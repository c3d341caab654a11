// ArgBlobDef - placeholder descriptors for job inputs
//
// An ArgBlobDef declares the static shape, dtype and batch axis of one job
// input. Adding it to the open job registers an `Input` op named after the
// descriptor; pushing data later feeds that op (or its per-rank sub-ops).
//
//   Fixed         consistent input; pushed arrays must match the shape exactly
//   Mirrored      one array per rank, each bounded by the declared shape
//   MirroredList  one list of arrays per rank, whose total size is bounded
//                 by the declared shape
//
// Mirrored kinds learn their sub-blobs when added: the context expands the
// input into `parallel_num` consistent sub-inputs and the descriptor records
// them in rank order. Pushes go to the sub-inputs in that same order.
//
// A descriptor built without a name gets one (`Input_<n>`) from the runtime
// it is first added to; until then its op name is empty.
//
// Usage:
//
//   let mut images = ArgBlobDef::mirrored((2, 255, 255, 3), DType::F32, 0)?;
//   images.add_and_infer_op(&mut runtime)?;
//   ...
//   let handles = images.check_and_async_push(&mut runtime, &PushData::ArrayList(batches))?;

use oxflow_core::{
    DType, DeviceType, InterfaceBlobConf, LogicalBlobId, OpAttribute, OperatorConf, ParallelConf,
    Shape, OUTPUT_BN,
};

use crate::host_array::HostArray;
use crate::push::{make_push_ndarray_callback, make_push_ndarray_list_callback, PushData, PushHandle};
use crate::runtime::Runtime;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgBlobKind {
    Fixed,
    Mirrored,
    MirroredList,
}

/// How a Fixed input is spread over the ranks of its placement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Distribute {
    /// Split along the batch axis, if any.
    #[default]
    Auto,
    Broadcast,
    Split(i64),
}

/// A per-rank sub-input of a mirrored descriptor, addressed consistently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistentBlob {
    pub job_name: String,
    pub lbi: LogicalBlobId,
}

impl ConsistentBlob {
    pub fn op_name(&self) -> &str {
        &self.lbi.op_name
    }

    pub fn lbn(&self) -> String {
        self.lbi.lbn()
    }
}

#[derive(Debug)]
pub struct ArgBlobDef {
    kind: ArgBlobKind,
    lbi: LogicalBlobId,
    shape: Shape,
    dtype: DType,
    batch_axis: Option<i64>,
    distribute: Distribute,
    sub_blobs: Vec<ConsistentBlob>,
}

fn normalize_axis(axis: i64, rank: usize, what: &str) -> Result<i64> {
    let rank = rank as i64;
    let normalized = if axis < 0 { axis + rank } else { axis };
    if !(0..rank).contains(&normalized) {
        return Err(Error::InvalidArgBlobDef(format!(
            "{what} {axis} is out of range for rank {rank}"
        )));
    }
    Ok(normalized)
}

impl ArgBlobDef {
    fn build(
        kind: ArgBlobKind,
        shape: Shape,
        dtype: DType,
        batch_axis: Option<i64>,
        name: Option<String>,
    ) -> Result<Self> {
        shape.check_positive()?;
        let batch_axis = batch_axis
            .map(|a| normalize_axis(a, shape.rank(), "batch axis"))
            .transpose()?;
        if kind != ArgBlobKind::Fixed && batch_axis.is_none() {
            return Err(Error::InvalidArgBlobDef(
                "mirrored blob definitions require a batch axis".into(),
            ));
        }
        let name = match name {
            Some(n) if n.is_empty() || n.contains('/') => {
                return Err(Error::InvalidArgBlobDef(format!(
                    "'{n}' is not a valid op name"
                )));
            }
            Some(n) => n,
            None => String::new(),
        };
        Ok(Self {
            kind,
            lbi: LogicalBlobId::new(name, OUTPUT_BN),
            shape,
            dtype,
            batch_axis,
            distribute: Distribute::Auto,
            sub_blobs: Vec::new(),
        })
    }

    /// `batch_axis` may be negative; `None` declares an input without one.
    pub fn fixed(shape: impl Into<Shape>, dtype: DType, batch_axis: Option<i64>) -> Result<Self> {
        Self::build(ArgBlobKind::Fixed, shape.into(), dtype, batch_axis, None)
    }

    pub fn mirrored(shape: impl Into<Shape>, dtype: DType, batch_axis: i64) -> Result<Self> {
        Self::build(ArgBlobKind::Mirrored, shape.into(), dtype, Some(batch_axis), None)
    }

    pub fn mirrored_list(shape: impl Into<Shape>, dtype: DType, batch_axis: i64) -> Result<Self> {
        Self::build(
            ArgBlobKind::MirroredList,
            shape.into(),
            dtype,
            Some(batch_axis),
            None,
        )
    }

    /// Mirrored or Fixed, following the session's strategy stack.
    pub fn for_current_strategy(
        runtime: &Runtime,
        shape: impl Into<Shape>,
        dtype: DType,
        batch_axis: i64,
    ) -> Result<Self> {
        if runtime.is_mirrored_strategy_enabled()? {
            Self::mirrored(shape, dtype, batch_axis)
        } else {
            Self::fixed(shape, dtype, Some(batch_axis))
        }
    }

    pub fn with_name(self, name: impl Into<String>) -> Result<Self> {
        Self::build(
            self.kind,
            self.shape,
            self.dtype,
            self.batch_axis,
            Some(name.into()),
        )
        .map(|def| Self {
            distribute: self.distribute,
            ..def
        })
    }

    pub fn kind(&self) -> ArgBlobKind {
        self.kind
    }

    pub fn lbi(&self) -> &LogicalBlobId {
        &self.lbi
    }

    pub fn op_name(&self) -> &str {
        &self.lbi.op_name
    }

    pub fn is_named(&self) -> bool {
        !self.lbi.op_name.is_empty()
    }

    pub fn logical_blob_name(&self) -> String {
        self.lbi.lbn()
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn batch_axis(&self) -> Option<i64> {
        self.batch_axis
    }

    pub fn distribute(&self) -> Distribute {
        self.distribute
    }

    pub fn is_dynamic(&self) -> bool {
        self.kind != ArgBlobKind::Fixed
    }

    pub fn is_tensor_list(&self) -> bool {
        self.kind == ArgBlobKind::MirroredList
    }

    /// Sub-blobs in rank order; empty until added to a job.
    pub fn sub_blobs(&self) -> &[ConsistentBlob] {
        &self.sub_blobs
    }

    /// Same op name, new distribution. Sub-blobs are not carried over.
    /// Mirrored inputs are never split by distribution, so only Fixed
    /// descriptors use it.
    pub fn with_distribute(&self, distribute: Distribute) -> Result<Self> {
        let distribute = match distribute {
            Distribute::Split(axis) => {
                if self.batch_axis.is_none() {
                    return Err(Error::InvalidArgBlobDef(
                        "a split input must declare a batch axis".into(),
                    ));
                }
                Distribute::Split(normalize_axis(axis, self.shape.rank(), "split axis")?)
            }
            other => other,
        };
        let def = Self::build(
            self.kind,
            self.shape.clone(),
            self.dtype,
            self.batch_axis,
            self.is_named().then(|| self.lbi.op_name.clone()),
        )?;
        Ok(Self { distribute, ..def })
    }

    /// Fresh descriptor with the same declaration under `op_name`, or unnamed
    /// until it is added.
    pub fn clone_named(&self, op_name: Option<&str>) -> Result<Self> {
        let def = Self::build(
            self.kind,
            self.shape.clone(),
            self.dtype,
            self.batch_axis,
            op_name.map(str::to_string),
        )?;
        Ok(Self {
            distribute: self.distribute,
            ..def
        })
    }

    pub fn to_interface_blob_conf(&self) -> InterfaceBlobConf {
        let split_axis = match (self.kind, self.batch_axis) {
            (ArgBlobKind::Fixed, Some(batch)) => match self.distribute {
                Distribute::Auto => Some(batch),
                Distribute::Broadcast => None,
                Distribute::Split(axis) => Some(axis),
            },
            _ => None,
        };
        InterfaceBlobConf {
            shape: self.shape.clone(),
            data_type: self.dtype,
            is_dynamic: self.is_dynamic(),
            is_tensor_list: self.is_tensor_list(),
            batch_axis: self.batch_axis,
            split_axis,
        }
    }

    pub fn to_op_conf(&self) -> OperatorConf {
        OperatorConf::input(self.op_name(), self.to_interface_blob_conf())
    }

    /// Register the input op with the runtime's open job.
    pub fn add_and_infer_op(&mut self, runtime: &mut Runtime) -> Result<OpAttribute> {
        if !self.is_named() {
            self.lbi = LogicalBlobId::new(runtime.next_input_name(), OUTPUT_BN);
        }
        match self.kind {
            ArgBlobKind::Fixed => {
                let mut op = self.to_op_conf();
                if runtime.eager_execution_enabled()? {
                    let scope = runtime
                        .current_job_ctx()?
                        .job_conf()
                        .map(|conf| conf.default_parallel_conf.clone())
                        .unwrap_or_default();
                    op = op.with_parallel_conf(eager_input_placement(&scope)?);
                }
                runtime.add_and_infer_consistent_op(&op)
            }
            ArgBlobKind::Mirrored | ArgBlobKind::MirroredList => {
                if !self.sub_blobs.is_empty() {
                    return Err(Error::InvalidArgBlobDef(format!(
                        "'{}' was already added to job '{}'",
                        self.op_name(),
                        self.sub_blobs[0].job_name
                    )));
                }
                let attr = runtime.add_and_infer_mirrored_op(&self.to_op_conf())?;
                let job_name = runtime.current_job_name()?;
                let lbn = self.logical_blob_name();
                let num = runtime.mirrored_blob_num_sub_lbi(&job_name, &lbn)?;
                let mut subs = Vec::with_capacity(num);
                for i in 0..num {
                    subs.push(ConsistentBlob {
                        job_name: job_name.clone(),
                        lbi: runtime.mirrored_blob_sub_lbi(&job_name, &lbn, i)?,
                    });
                }
                self.sub_blobs = subs;
                Ok(attr)
            }
        }
    }

    fn check_array(&self, array: &HostArray) -> Result<()> {
        if array.dtype() != self.dtype {
            return Err(Error::PushMismatch(format!(
                "'{}' expects {}, got {}",
                self.op_name(),
                self.dtype,
                array.dtype()
            )));
        }
        if self.kind != ArgBlobKind::Fixed && array.rank() != self.shape.rank() {
            return Err(Error::RankMismatch {
                expected: self.shape.rank(),
                got: array.rank(),
            });
        }
        Ok(())
    }

    fn check_capacity(&self, elem_count: usize) -> Result<()> {
        if elem_count > self.shape.elem_count() {
            return Err(Error::Capacity {
                capacity: self.shape.clone(),
                got: elem_count,
            });
        }
        Ok(())
    }

    fn check_sub_count(&self, got: usize) -> Result<()> {
        if self.sub_blobs.is_empty() {
            return Err(Error::PushMismatch(format!(
                "'{}' has not been added to a job",
                self.op_name()
            )));
        }
        if got != self.sub_blobs.len() {
            return Err(Error::PushMismatch(format!(
                "'{}' has {} sub-blobs, got data for {got}",
                self.op_name(),
                self.sub_blobs.len()
            )));
        }
        Ok(())
    }

    /// Local validation of push data; nothing reaches the runtime.
    pub fn check_data(&self, data: &PushData) -> Result<()> {
        match (self.kind, data) {
            (ArgBlobKind::Fixed, PushData::Array(array)) => {
                self.check_array(array)?;
                if array.shape() != self.shape {
                    return Err(Error::PushShape {
                        expected: self.shape.clone(),
                        got: array.shape(),
                    });
                }
            }
            (ArgBlobKind::Mirrored, PushData::ArrayList(arrays)) => {
                self.check_sub_count(arrays.len())?;
                for array in arrays {
                    self.check_array(array)?;
                    self.check_capacity(array.elem_count())?;
                }
            }
            (ArgBlobKind::MirroredList, PushData::ArrayLists(lists)) => {
                self.check_sub_count(lists.len())?;
                for list in lists {
                    for array in list {
                        self.check_array(array)?;
                    }
                    self.check_capacity(list.iter().map(HostArray::elem_count).sum())?;
                }
            }
            (kind, data) => {
                return Err(Error::PushMismatch(format!(
                    "{kind:?} blob '{}' cannot take {}",
                    self.op_name(),
                    data.kind_name()
                )));
            }
        }
        Ok(())
    }

    /// Validate, snapshot and schedule pushes; one handle per destination,
    /// in sub-blob order.
    pub fn check_and_async_push(
        &self,
        runtime: &mut Runtime,
        data: &PushData,
    ) -> Result<Vec<PushHandle>> {
        self.check_data(data)?;
        match data {
            PushData::Array(array) => {
                let handle = runtime.async_push(self.op_name(), make_push_ndarray_callback(array))?;
                Ok(vec![handle])
            }
            PushData::ArrayList(arrays) => self
                .sub_blobs
                .iter()
                .zip(arrays)
                .map(|(sub, array)| {
                    runtime.async_push(sub.op_name(), make_push_ndarray_callback(array))
                })
                .collect(),
            PushData::ArrayLists(lists) => self
                .sub_blobs
                .iter()
                .zip(lists)
                .map(|(sub, list)| {
                    runtime.async_push(sub.op_name(), make_push_ndarray_list_callback(list))
                })
                .collect(),
        }
    }
}

/// Placement of a Fixed input added eagerly: the single gpu of the scope
/// when the scope is one gpu on machine 0, otherwise cpu 0:0.
pub fn eager_input_placement(scope: &ParallelConf) -> Result<ParallelConf> {
    let devices = scope.devices()?;
    match (scope.device_type()?, devices.as_slice()) {
        (DeviceType::Gpu, [(0, device)]) => Ok(ParallelConf::single(DeviceType::Gpu, 0, *device)),
        _ => Ok(ParallelConf::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;
    use rstest::rstest;

    #[rstest]
    #[case(ArgBlobKind::Fixed, false, false)]
    #[case(ArgBlobKind::Mirrored, true, false)]
    #[case(ArgBlobKind::MirroredList, true, true)]
    fn test_interface_conf_flags(
        #[case] kind: ArgBlobKind,
        #[case] dynamic: bool,
        #[case] tensor_list: bool,
    ) {
        let def = ArgBlobDef::build(kind, Shape::from((4, 5)), DType::I32, Some(-1), None).unwrap();
        let conf = def.to_interface_blob_conf();
        assert_eq!(conf.shape, Shape::from((4, 5)));
        assert_eq!(conf.data_type, DType::I32);
        assert_eq!(conf.is_dynamic, dynamic);
        assert_eq!(conf.is_tensor_list, tensor_list);
        assert_eq!(conf.batch_axis, Some(1));
        let split = if kind == ArgBlobKind::Fixed { Some(1) } else { None };
        assert_eq!(conf.split_axis, split);
    }

    #[test]
    fn test_fixed_without_batch_axis_clears_both() {
        let def = ArgBlobDef::fixed((2, 3), DType::F32, None).unwrap();
        let conf = def.to_interface_blob_conf();
        assert_eq!(conf.batch_axis, None);
        assert_eq!(conf.split_axis, None);
    }

    #[rstest]
    #[case(vec![2, 0], Some(0))]
    #[case(vec![], None)]
    #[case(vec![2, 3], Some(2))]
    #[case(vec![2, 3], Some(-3))]
    fn test_invalid_declarations(#[case] dims: Vec<usize>, #[case] batch: Option<i64>) {
        assert!(matches!(
            ArgBlobDef::fixed(dims, DType::F32, batch),
            Err(Error::InvalidArgBlobDef(_))
        ));
    }

    #[test]
    fn test_mirrored_requires_batch_axis() {
        let err = ArgBlobDef::build(ArgBlobKind::Mirrored, Shape::from(2), DType::F32, None, None);
        assert!(err.is_err());
    }

    #[test]
    fn test_clone_and_distribute_identity() {
        let def = ArgBlobDef::fixed((8, 4), DType::F32, Some(0))
            .unwrap()
            .with_name("images")
            .unwrap();
        let fresh = def.clone_named(None).unwrap();
        assert!(!fresh.is_named());
        assert!(fresh.sub_blobs().is_empty());
        assert_eq!(def.clone_named(Some("other")).unwrap().op_name(), "other");

        let broadcast = def.with_distribute(Distribute::Broadcast).unwrap();
        assert_eq!(broadcast.op_name(), "images");
        assert_eq!(broadcast.to_interface_blob_conf().split_axis, None);
        let split = def.with_distribute(Distribute::Split(-1)).unwrap();
        assert_eq!(split.to_interface_blob_conf().split_axis, Some(1));

        let no_batch = ArgBlobDef::fixed((8, 4), DType::F32, None).unwrap();
        assert!(no_batch.with_distribute(Distribute::Split(0)).is_err());
    }

    #[test]
    fn test_check_data_before_add() {
        let def = ArgBlobDef::fixed((2, 3), DType::F32, Some(0)).unwrap();
        let ok = PushData::Array(HostArray::from(Array::<f32, _>::zeros((2, 3))));
        def.check_data(&ok).unwrap();
        let wrong = PushData::Array(HostArray::from(Array::<f32, _>::zeros((3, 2))));
        assert!(matches!(def.check_data(&wrong), Err(Error::PushShape { .. })));
        let list = PushData::ArrayList(vec![]);
        assert!(matches!(def.check_data(&list), Err(Error::PushMismatch(_))));

        let mirrored = ArgBlobDef::mirrored((2, 3), DType::F32, 0).unwrap();
        assert!(mirrored
            .check_data(&PushData::ArrayList(vec![HostArray::from(Array::<f32, _>::zeros((1, 3)))]))
            .is_err());
    }

    #[rstest]
    #[case(ParallelConf::single(DeviceType::Gpu, 0, 3), ParallelConf::single(DeviceType::Gpu, 0, 3))]
    #[case(ParallelConf::new("gpu", vec!["0:0-1".into()]), ParallelConf::default())]
    #[case(ParallelConf::single(DeviceType::Gpu, 1, 0), ParallelConf::default())]
    #[case(ParallelConf::single(DeviceType::Cpu, 0, 0), ParallelConf::default())]
    fn test_eager_input_placement(#[case] scope: ParallelConf, #[case] expected: ParallelConf) {
        assert_eq!(eager_input_placement(&scope).unwrap(), expected);
    }
}
