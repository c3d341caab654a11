// Job building
//
//   ctx    - JobBuildAndInferCtx, one per job
//   infer  - per-op attribute inference rules
//   mgr    - the registry that tracks which job is open

pub mod ctx;
mod infer;
pub mod mgr;

pub use ctx::{mirrored_sub_op_name, BoxingEdge, JobBuildAndInferCtx, MirroredBlob};
pub use mgr::JobBuildAndInferCtxMgr;
