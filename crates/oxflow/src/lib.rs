//! # oxflow
//!
//! Job building, blob inference and dispatch for distributed tensor jobs.
//!
//! A [`Runtime`] owns the environment and session state machine. Inside a
//! session, jobs are built operator by operator through a
//! job-build-and-infer context, inputs are declared with [`ArgBlobDef`],
//! and once the session starts the VM runs instruction batches and job
//! launches on a background worker fed by asynchronous pushes.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use oxflow::prelude::*;
//!
//! # fn main() -> oxflow::Result<()> {
//! let mut rt = Runtime::new();
//! rt.init_env(EnvConfig::default())?;
//! rt.init_global_session(SessionConfig::default())?;
//!
//! rt.open_job("train")?;
//! rt.set_job_conf(JobConfig::new("train"))?;
//! let mut x = ArgBlobDef::fixed((2, 3), DType::F32, Some(0))?.with_name("x")?;
//! x.add_and_infer_op(&mut rt)?;
//! rt.complete_job()?;
//! rt.close_job()?;
//!
//! rt.start_global_session()?;
//! let batch = HostArray::from(ndarray::Array::<f32, _>::zeros((2, 3)));
//! for handle in x.check_and_async_push(&mut rt, &PushData::Array(batch))? {
//!     handle.wait()?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`runtime`] | Environment/session lifecycle and every boundary call |
//! | [`job`] | Job-build-and-infer contexts and per-op inference |
//! | [`blob_def`] | Fixed, Mirrored and MirroredList input descriptors |
//! | [`vm`] | Id issuance, instruction batches, job launches |
//! | [`push`] | Destination blobs and push callbacks |
//! | [`api`] | The same calls over structured text |
//! | [`logging`] | `tracing` subscriber setup |

pub mod api;
pub mod blob_def;
pub mod env;
pub mod host_array;
pub mod job;
pub mod logging;
pub mod push;
pub mod runtime;
pub mod session;
pub mod vm;

pub use oxflow_core::{
    bail, BinaryOp, BlobAttr, BlobDesc, DType, DeviceType, EagerSymbol, EagerSymbolList,
    EnvConfig, Error, ErrorKind, ErrorStatus, InstructionList, InstructionProto,
    InterUserJobInfo, InterfaceBlobConf, Job, JobConfig, JobKind, JobSet, LogicalBlobId,
    OpAttribute, OpKind, Operand, OperatorConf, ParallelConf, Resource, Result, SessionConfig,
    Shape, SymbolPayload, TextMessage, UnaryOp, WithDType,
};

pub use blob_def::{ArgBlobDef, ArgBlobKind, ConsistentBlob, Distribute};
pub use env::Lifecycle;
pub use host_array::{HostArray, HostElement};
pub use job::{JobBuildAndInferCtx, JobBuildAndInferCtxMgr};
pub use logging::{init_tracing, LoggingConfig};
pub use push::{OfBlob, PushCallback, PushData, PushHandle};
pub use runtime::Runtime;
pub use vm::{Completion, InstructionHandler, JobInstance, NoopHandler, VmStats};

/// Prelude: the types most programs need.
pub mod prelude {
    pub use crate::push::{make_push_ndarray_callback, make_push_ndarray_list_callback};
    pub use crate::vm::{PullJobInstance, UserJobInstance};
    pub use crate::{
        ArgBlobDef, DType, Distribute, EnvConfig, HostArray, JobConfig, OpKind, OperatorConf,
        PushData, Runtime, SessionConfig, Shape,
    };
}
