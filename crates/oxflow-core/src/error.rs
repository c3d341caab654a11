use std::fmt;

use crate::dtype::DType;
use crate::shape::Shape;
use crate::text_format::{TextMessage, TextNode};

// ErrorKind - Wire-level tag of every failure
//
// Each boundary call answers with an ErrorStatus whose `kind` is one of
// these tags, or absent on success. Kinds are grouped into the classes a
// caller reacts to differently:
//
//   Ordering            - lifecycle call out of sequence, no open context
//   GraphConstruction   - unknown blob, inference conflict, duplicate name
//   Validation          - CheckJob / Complete found a violated invariant
//   Capacity            - pushed data does not fit a declared blob
//   Dispatch            - instruction batch or launch rejected
//   Other               - codec, io and unclassified failures

/// Tag carried across the text boundary for a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Unknown,
    Io,
    Parse,
    Lifecycle,
    NoOpenJob,
    JobConf,
    JobCompleted,
    JobNameExist,
    JobNameNotFound,
    OpNameExist,
    OpConf,
    BlobNotFound,
    InvalidLogicalBlobName,
    ShapeMismatch,
    DTypeMismatch,
    Placement,
    SplitAxisInfer,
    MirroredView,
    Validation,
    Capacity,
    RankMismatch,
    InvalidArgBlobDef,
    Dispatch,
}

/// Coarse grouping of [`ErrorKind`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Ordering,
    GraphConstruction,
    Validation,
    Capacity,
    Dispatch,
    Other,
}

const ALL_KINDS: [ErrorKind; 23] = [
    ErrorKind::Unknown,
    ErrorKind::Io,
    ErrorKind::Parse,
    ErrorKind::Lifecycle,
    ErrorKind::NoOpenJob,
    ErrorKind::JobConf,
    ErrorKind::JobCompleted,
    ErrorKind::JobNameExist,
    ErrorKind::JobNameNotFound,
    ErrorKind::OpNameExist,
    ErrorKind::OpConf,
    ErrorKind::BlobNotFound,
    ErrorKind::InvalidLogicalBlobName,
    ErrorKind::ShapeMismatch,
    ErrorKind::DTypeMismatch,
    ErrorKind::Placement,
    ErrorKind::SplitAxisInfer,
    ErrorKind::MirroredView,
    ErrorKind::Validation,
    ErrorKind::Capacity,
    ErrorKind::RankMismatch,
    ErrorKind::InvalidArgBlobDef,
    ErrorKind::Dispatch,
];

impl ErrorKind {
    /// Name used in the text encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unknown => "UNKNOWN",
            ErrorKind::Io => "IO",
            ErrorKind::Parse => "PARSE",
            ErrorKind::Lifecycle => "LIFECYCLE",
            ErrorKind::NoOpenJob => "NO_OPEN_JOB",
            ErrorKind::JobConf => "JOB_CONF",
            ErrorKind::JobCompleted => "JOB_COMPLETED",
            ErrorKind::JobNameExist => "JOB_NAME_EXIST",
            ErrorKind::JobNameNotFound => "JOB_NAME_NOT_FOUND",
            ErrorKind::OpNameExist => "OP_NAME_EXIST",
            ErrorKind::OpConf => "OP_CONF",
            ErrorKind::BlobNotFound => "BLOB_NOT_FOUND",
            ErrorKind::InvalidLogicalBlobName => "INVALID_LOGICAL_BLOB_NAME",
            ErrorKind::ShapeMismatch => "SHAPE_MISMATCH",
            ErrorKind::DTypeMismatch => "DTYPE_MISMATCH",
            ErrorKind::Placement => "PLACEMENT",
            ErrorKind::SplitAxisInfer => "SPLIT_AXIS_INFER",
            ErrorKind::MirroredView => "MIRRORED_VIEW",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Capacity => "CAPACITY",
            ErrorKind::RankMismatch => "RANK_MISMATCH",
            ErrorKind::InvalidArgBlobDef => "INVALID_ARG_BLOB_DEF",
            ErrorKind::Dispatch => "DISPATCH",
        }
    }

    /// Inverse of [`ErrorKind::as_str`].
    pub fn from_name(name: &str) -> Option<Self> {
        ALL_KINDS.iter().copied().find(|k| k.as_str() == name)
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ErrorKind::Lifecycle
            | ErrorKind::NoOpenJob
            | ErrorKind::JobConf
            | ErrorKind::JobCompleted => ErrorClass::Ordering,
            ErrorKind::JobNameExist
            | ErrorKind::JobNameNotFound
            | ErrorKind::OpNameExist
            | ErrorKind::OpConf
            | ErrorKind::BlobNotFound
            | ErrorKind::InvalidLogicalBlobName
            | ErrorKind::ShapeMismatch
            | ErrorKind::DTypeMismatch
            | ErrorKind::Placement
            | ErrorKind::SplitAxisInfer
            | ErrorKind::MirroredView => ErrorClass::GraphConstruction,
            ErrorKind::Validation => ErrorClass::Validation,
            ErrorKind::Capacity | ErrorKind::RankMismatch | ErrorKind::InvalidArgBlobDef => {
                ErrorClass::Capacity
            }
            ErrorKind::Dispatch => ErrorClass::Dispatch,
            ErrorKind::Unknown | ErrorKind::Io | ErrorKind::Parse => ErrorClass::Other,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All errors that can occur while building, inferring or dispatching jobs.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A lifecycle transition was requested from the wrong state.
    #[error("cannot {action} while runtime is {state}")]
    Lifecycle { action: &'static str, state: String },

    #[error("no job build-and-infer context is open")]
    NoOpenJob,

    #[error("job '{current}' must be closed before opening job '{requested}'")]
    JobStillOpen { current: String, requested: String },

    #[error("invalid job conf for '{job}': {reason}")]
    JobConf { job: String, reason: String },

    #[error("job '{0}' is completed and can no longer be modified")]
    JobCompleted(String),

    #[error("job '{0}' is already open")]
    JobNameExist(String),

    #[error("job '{0}' not found")]
    JobNotFound(String),

    #[error("op '{op}' already exists in job '{job}'")]
    OpNameExist { job: String, op: String },

    #[error("invalid op conf '{op}': {reason}")]
    InvalidOpConf { op: String, reason: String },

    #[error("logical blob '{lbn}' not found in job '{job}'")]
    BlobNotFound { job: String, lbn: String },

    #[error("invalid logical blob name '{0}'")]
    InvalidLbn(String),

    #[error("shape mismatch in op '{op}': expected {expected}, got {got}")]
    ShapeMismatch {
        op: String,
        expected: Shape,
        got: Shape,
    },

    #[error("dtype mismatch in op '{op}': expected {expected}, got {got}")]
    DTypeMismatch {
        op: String,
        expected: DType,
        got: DType,
    },

    #[error("placement error in op '{op}': {reason}")]
    Placement { op: String, reason: String },

    /// A device name or tag that cannot be parsed.
    #[error("invalid placement: {0}")]
    InvalidPlacement(String),

    #[error("split axis conflict in op '{op}': {reason}")]
    SplitAxis { op: String, reason: String },

    #[error("logical blob '{lbn}' in job '{job}' is not mirrored")]
    NotMirrored { job: String, lbn: String },

    #[error("logical blob '{lbn}' in job '{job}' is mirrored; query it through the mirrored view")]
    IsMirrored { job: String, lbn: String },

    #[error("sub-blob index {index} out of range for '{lbn}' with {num} sub-blobs")]
    SubLbiOutOfRange { lbn: String, index: usize, num: usize },

    /// CheckJob / Complete found a violated invariant; carries the first one.
    #[error("job '{job}' failed validation: {reason}")]
    Validation { job: String, reason: String },

    #[error("invalid blob definition: {0}")]
    InvalidArgBlobDef(String),

    #[error("capacity exceeded: {got} elements do not fit static shape {capacity}")]
    Capacity { capacity: Shape, got: usize },

    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    #[error("pushed array shape {got} does not match declared shape {expected}")]
    PushShape { expected: Shape, got: Shape },

    #[error("push data mismatch: {0}")]
    PushMismatch(String),

    #[error("instruction dispatch rejected: {0}")]
    Dispatch(String),

    #[error("parse error at line {line}: {msg}")]
    Parse { line: usize, msg: String },

    /// A decoded message is missing a field or has the wrong value type.
    #[error("field '{field}': {reason}")]
    Schema { field: String, reason: String },

    #[error("io error: {0}")]
    Io(String),

    /// Error decoded from an [`ErrorStatus`] received over the boundary.
    #[error("{kind}: {msg}")]
    Remote { kind: ErrorKind, msg: String },

    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub fn schema(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Schema {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// The wire tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Lifecycle { .. } | Error::JobStillOpen { .. } => ErrorKind::Lifecycle,
            Error::NoOpenJob => ErrorKind::NoOpenJob,
            Error::JobConf { .. } => ErrorKind::JobConf,
            Error::JobCompleted(_) => ErrorKind::JobCompleted,
            Error::JobNameExist(_) => ErrorKind::JobNameExist,
            Error::JobNotFound(_) => ErrorKind::JobNameNotFound,
            Error::OpNameExist { .. } => ErrorKind::OpNameExist,
            Error::InvalidOpConf { .. } => ErrorKind::OpConf,
            Error::BlobNotFound { .. } | Error::SubLbiOutOfRange { .. } => ErrorKind::BlobNotFound,
            Error::InvalidLbn(_) => ErrorKind::InvalidLogicalBlobName,
            Error::ShapeMismatch { .. } => ErrorKind::ShapeMismatch,
            Error::DTypeMismatch { .. } => ErrorKind::DTypeMismatch,
            Error::Placement { .. } | Error::InvalidPlacement(_) => ErrorKind::Placement,
            Error::SplitAxis { .. } => ErrorKind::SplitAxisInfer,
            Error::NotMirrored { .. } | Error::IsMirrored { .. } => ErrorKind::MirroredView,
            Error::Validation { .. } => ErrorKind::Validation,
            Error::InvalidArgBlobDef(_) => ErrorKind::InvalidArgBlobDef,
            Error::Capacity { .. } | Error::PushShape { .. } | Error::PushMismatch(_) => {
                ErrorKind::Capacity
            }
            Error::RankMismatch { .. } => ErrorKind::RankMismatch,
            Error::Dispatch(_) => ErrorKind::Dispatch,
            Error::Parse { .. } | Error::Schema { .. } => ErrorKind::Parse,
            Error::Io(_) => ErrorKind::Io,
            Error::Remote { kind, .. } => *kind,
            Error::Msg(_) => ErrorKind::Unknown,
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.kind().class()
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

/// Convenience Result type used throughout oxflow.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}

// ErrorStatus - the envelope every boundary call answers with

/// Result envelope of a boundary call. No kind means success.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorStatus {
    pub kind: Option<ErrorKind>,
    pub msg: String,
}

impl ErrorStatus {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn from_error(err: &Error) -> Self {
        Self {
            kind: Some(err.kind()),
            msg: err.to_string(),
        }
    }

    pub fn from_result<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::ok(),
            Err(e) => Self::from_error(e),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.kind.is_none()
    }

    /// Turn a failed status into a typed error carrying the original payload.
    pub fn check(&self) -> Result<()> {
        match self.kind {
            None => Ok(()),
            Some(kind) => Err(Error::Remote {
                kind,
                msg: self.msg.clone(),
            }),
        }
    }
}

impl TextMessage for ErrorStatus {
    fn to_node(&self) -> TextNode {
        let mut node = TextNode::new();
        if let Some(kind) = self.kind {
            node.ident("error_type", kind.as_str());
            node.str("msg", &self.msg);
        }
        node
    }

    fn from_node(node: &TextNode) -> crate::Result<Self> {
        let kind = match node.get_ident("error_type")? {
            None => None,
            Some(name) => Some(ErrorKind::from_name(name).unwrap_or(ErrorKind::Unknown)),
        };
        Ok(Self {
            kind,
            msg: node.str_or("msg", "")?,
        })
    }
}
