//! # oxflow-core
//!
//! Schema layer shared by the oxflow engine and its runtime collaborator.
//!
//! This crate provides:
//! - [`Error`] / [`ErrorStatus`] - error taxonomy and the boundary result envelope
//! - [`DType`] / [`Shape`] - element types and static shapes
//! - [`LogicalBlobId`] - `(op_name, blob_name)` blob identity
//! - [`ParallelConf`] - placement: device tag plus machine/device ranks
//! - [`OperatorConf`] / [`OpAttribute`] - declared operators and their inferred attributes
//! - [`JobConfig`] / [`JobSet`] / [`InterUserJobInfo`] - job schema
//! - [`EnvConfig`] / [`SessionConfig`] - environment and session configuration
//! - [`InstructionList`] / [`EagerSymbolList`] - VM instruction batches
//! - [`text_format`] - the structured-text codec every message implements

pub mod config;
pub mod dtype;
pub mod error;
pub mod instruction;
pub mod job;
pub mod lbi;
pub mod op_attribute;
pub mod op_conf;
pub mod placement;
pub mod shape;
pub mod text_format;

pub use config::{EnvConfig, Machine, Resource, SessionConfig};
pub use dtype::{DType, WithDType};
pub use error::{Error, ErrorClass, ErrorKind, ErrorStatus, Result};
pub use instruction::{
    EagerSymbol, EagerSymbolList, InstructionList, InstructionProto, Operand, ParallelSelector,
    SymbolPayload,
};
pub use job::{InterUserJobInfo, Job, JobConfig, JobKind, JobSet};
pub use lbi::LogicalBlobId;
pub use op_attribute::{BlobAttr, BlobDesc, OpAttribute, OutputAttr};
pub use op_conf::{BinaryOp, InterfaceBlobConf, OpKind, OperatorConf, UnaryOp, OUTPUT_BN};
pub use placement::{DeviceType, MachineDeviceIds, ParallelConf};
pub use shape::Shape;
pub use text_format::{Int64List, OptInt64, TextMessage, TextNode, TextValue};
