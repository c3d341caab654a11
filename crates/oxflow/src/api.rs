// Text boundary - every runtime call with serialized arguments and results
//
// Each call answers with an `ErrorStatus` in text form; calls with a result
// answer `(payload, status)`. An ok status encodes as the empty string and a
// failed call leaves the payload empty. Payload encodings:
//
//   messages        structured text of the message (OpAttribute, JobSet, ...)
//   shapes          Int64List
//   optional axes   OptInt64 (empty when unset, never `value: 0`)
//   dtypes          the numeric code, e.g. "2" for f32
//   ints and bools  plain "42" / "true"
//
// The client half (`check_status`, `parse_payload`, `parse_scalar`) always
// inspects the status before it looks at the payload.
//
// Usage:
//
//   let status = api::open_job(&mut rt, "train");
//   api::check_status(&status)?;
//   let shape: Int64List = api::parse_payload(api::get_static_shape(&rt, "train", "x/out"))?;

use std::str::FromStr;

use oxflow_core::{
    BlobAttr, EagerSymbolList, EnvConfig, ErrorStatus, InstructionList, Int64List, JobConfig,
    LogicalBlobId, OperatorConf, OptInt64, SessionConfig, TextMessage,
};

use crate::runtime::Runtime;
use crate::vm::JobInstance;
use crate::{Error, Result};

/// `(payload, status)` of a call with a result.
pub type Reply = (String, String);

fn status(result: Result<()>) -> String {
    if let Err(e) = &result {
        tracing::debug!(error = %e, "boundary call failed");
    }
    ErrorStatus::from_result(&result).to_text()
}

fn reply<T>(result: Result<T>, encode: impl FnOnce(T) -> String) -> Reply {
    match result {
        Ok(v) => (encode(v), ErrorStatus::ok().to_text()),
        Err(e) => {
            tracing::debug!(error = %e, "boundary call failed");
            (String::new(), ErrorStatus::from_error(&e).to_text())
        }
    }
}

fn message<T: TextMessage>(v: T) -> String {
    v.to_text()
}

fn scalar<T: ToString>(v: T) -> String {
    v.to_string()
}

/// Raise the error carried by a status string, if any.
pub fn check_status(status: &str) -> Result<()> {
    ErrorStatus::from_text(status)?.check()
}

pub fn parse_payload<T: TextMessage>((payload, status): Reply) -> Result<T> {
    check_status(&status)?;
    T::from_text(&payload)
}

pub fn parse_scalar<T: FromStr>((payload, status): Reply) -> Result<T> {
    check_status(&status)?;
    payload
        .trim()
        .parse()
        .map_err(|_| Error::schema("payload", format!("cannot parse '{payload}'")))
}

// Environment

pub fn init_env(rt: &mut Runtime, env_conf: &str) -> String {
    status(EnvConfig::from_text(env_conf).and_then(|conf| rt.init_env(conf)))
}

pub fn is_env_inited(rt: &Runtime) -> Reply {
    reply(Ok(rt.is_env_inited()), scalar)
}

pub fn destroy_env(rt: &mut Runtime) -> String {
    status(rt.destroy_env())
}

pub fn current_resource(rt: &Runtime) -> Reply {
    reply(rt.current_resource(), message)
}

pub fn env_resource(rt: &Runtime) -> Reply {
    reply(rt.env_resource(), message)
}

pub fn current_machine_id(rt: &Runtime) -> Reply {
    reply(rt.current_machine_id(), scalar)
}

pub fn enable_eager_environment(rt: &mut Runtime, enabled: bool) -> String {
    status(rt.enable_eager_environment(enabled))
}

// Session

pub fn init_global_session(rt: &mut Runtime, session_conf: &str) -> String {
    status(SessionConfig::from_text(session_conf).and_then(|conf| rt.init_global_session(conf)))
}

pub fn is_session_inited(rt: &Runtime) -> Reply {
    reply(Ok(rt.is_session_inited()), scalar)
}

pub fn start_global_session(rt: &mut Runtime) -> String {
    status(rt.start_global_session())
}

pub fn stop_global_session(rt: &mut Runtime) -> String {
    status(rt.stop_global_session())
}

pub fn destroy_global_session(rt: &mut Runtime) -> String {
    status(rt.destroy_global_session())
}

pub fn enable_eager_session(rt: &mut Runtime, enabled: bool) -> String {
    status(rt.enable_eager_session(enabled))
}

pub fn eager_execution_enabled(rt: &Runtime) -> Reply {
    reply(rt.eager_execution_enabled(), scalar)
}

pub fn push_mirrored_strategy_enabled(rt: &mut Runtime, enabled: bool) -> String {
    status(rt.push_mirrored_strategy_enabled(enabled))
}

pub fn pop_mirrored_strategy_enabled(rt: &mut Runtime) -> Reply {
    reply(rt.pop_mirrored_strategy_enabled(), scalar)
}

pub fn is_mirrored_strategy_enabled(rt: &Runtime) -> Reply {
    reply(rt.is_mirrored_strategy_enabled(), scalar)
}

pub fn is_consistent_strategy_enabled(rt: &Runtime) -> Reply {
    reply(rt.is_consistent_strategy_enabled(), scalar)
}

// Job building

pub fn open_job(rt: &mut Runtime, job_name: &str) -> String {
    status(rt.open_job(job_name))
}

pub fn get_current_job_name(rt: &Runtime) -> Reply {
    reply(rt.current_job_name(), |name| name)
}

pub fn close_job(rt: &mut Runtime) -> String {
    status(rt.close_job())
}

pub fn set_job_conf(rt: &mut Runtime, job_conf: &str) -> String {
    status(JobConfig::from_text(job_conf).and_then(|conf| rt.set_job_conf(conf)))
}

pub fn has_job_conf(rt: &Runtime) -> Reply {
    reply(rt.has_job_conf(), scalar)
}

pub fn check_and_complete_op_conf(rt: &Runtime, op_conf: &str) -> Reply {
    let result = OperatorConf::from_text(op_conf).and_then(|op| rt.check_and_complete_op_conf(&op));
    reply(result, message)
}

pub fn infer_op_conf(rt: &Runtime, op_conf: &str) -> Reply {
    let result = OperatorConf::from_text(op_conf).and_then(|op| rt.infer_op_conf(&op));
    reply(result, message)
}

pub fn add_and_infer_consistent_op(rt: &mut Runtime, op_conf: &str) -> Reply {
    let result =
        OperatorConf::from_text(op_conf).and_then(|op| rt.add_and_infer_consistent_op(&op));
    reply(result, message)
}

pub fn add_and_infer_mirrored_op(rt: &mut Runtime, op_conf: &str) -> Reply {
    let result = OperatorConf::from_text(op_conf).and_then(|op| rt.add_and_infer_mirrored_op(&op));
    reply(result, message)
}

pub fn add_loss_logical_blob_name(rt: &mut Runtime, lbn: &str) -> String {
    status(rt.add_loss_logical_blob_name(lbn))
}

pub fn add_lbi_and_diff_watcher_uuid_pair(rt: &mut Runtime, lbi: &str, uuid: &str) -> String {
    status(
        LogicalBlobId::from_text(lbi)
            .and_then(|lbi| rt.add_lbi_and_diff_watcher_uuid_pair(&lbi, uuid)),
    )
}

pub fn check_job(rt: &Runtime) -> String {
    status(rt.check_job())
}

pub fn complete_job(rt: &mut Runtime) -> String {
    status(rt.complete_job())
}

pub fn get_job_set(rt: &Runtime) -> Reply {
    reply(rt.job_set(), message)
}

// Blob attribute queries, consistent and mirrored addressing

fn static_shape(attr: &BlobAttr) -> String {
    message(Int64List(attr.desc.shape.to_i64s()))
}

fn data_type(attr: &BlobAttr) -> String {
    scalar(attr.desc.data_type.code())
}

fn is_dynamic(attr: &BlobAttr) -> String {
    scalar(attr.desc.is_dynamic)
}

fn is_tensor_list(attr: &BlobAttr) -> String {
    scalar(attr.desc.is_tensor_list)
}

fn batch_axis(attr: &BlobAttr) -> String {
    message(OptInt64(attr.batch_axis))
}

fn split_axis(attr: &BlobAttr) -> String {
    message(OptInt64(attr.split_axis))
}

fn parallel_conf(attr: &BlobAttr) -> String {
    message(attr.parallel_conf.clone())
}

fn disable_boxing(attr: &BlobAttr) -> String {
    scalar(attr.disable_boxing)
}

macro_rules! blob_queries {
    ($($consistent:ident, $mirrored:ident => $encode:ident;)*) => {
        $(
            pub fn $consistent(rt: &Runtime, job_name: &str, lbn: &str) -> Reply {
                reply(rt.blob_attr(job_name, lbn), $encode)
            }

            pub fn $mirrored(rt: &Runtime, job_name: &str, lbn: &str) -> Reply {
                reply(rt.mirrored_blob_attr(job_name, lbn), $encode)
            }
        )*
    };
}

blob_queries! {
    get_static_shape, mirrored_blob_get_static_shape => static_shape;
    get_data_type, mirrored_blob_get_data_type => data_type;
    is_dynamic_blob, mirrored_blob_is_dynamic => is_dynamic;
    is_tensor_list_blob, mirrored_blob_is_tensor_list => is_tensor_list;
    get_batch_axis, mirrored_blob_get_batch_axis => batch_axis;
    get_split_axis_from_producer_view, mirrored_blob_get_split_axis_from_producer_view => split_axis;
    get_parallel_conf_from_producer_view, mirrored_blob_get_parallel_conf_from_producer_view => parallel_conf;
    disable_boxing_blob, mirrored_blob_disable_boxing => disable_boxing;
}

pub fn is_mirrored_blob(rt: &Runtime, job_name: &str, lbn: &str) -> Reply {
    reply(rt.is_mirrored_blob(job_name, lbn), scalar)
}

pub fn mirrored_blob_get_num_sub_lbi(rt: &Runtime, job_name: &str, lbn: &str) -> Reply {
    reply(rt.mirrored_blob_num_sub_lbi(job_name, lbn), scalar)
}

pub fn mirrored_blob_get_sub_lbi(rt: &Runtime, job_name: &str, lbn: &str, index: usize) -> Reply {
    reply(rt.mirrored_blob_sub_lbi(job_name, lbn, index), message)
}

pub fn get_op_attribute(rt: &Runtime, job_name: &str, op_name: &str) -> Reply {
    reply(rt.op_attribute(job_name, op_name).cloned(), message)
}

// Execution

pub fn new_logical_object_id(rt: &Runtime) -> Reply {
    reply(rt.new_logical_object_id(), scalar)
}

pub fn new_logical_symbol_id(rt: &Runtime) -> Reply {
    reply(rt.new_logical_symbol_id(), scalar)
}

pub fn new_physical_object_id(rt: &Runtime) -> Reply {
    reply(rt.new_physical_object_id(), scalar)
}

pub fn new_physical_symbol_id(rt: &Runtime) -> Reply {
    reply(rt.new_physical_symbol_id(), scalar)
}

fn batch(instructions: &str, symbols: &str) -> Result<(InstructionList, EagerSymbolList)> {
    Ok((
        InstructionList::from_text(instructions)?,
        EagerSymbolList::from_text(symbols)?,
    ))
}

pub fn run_logical_instruction(rt: &mut Runtime, instructions: &str, symbols: &str) -> String {
    status(batch(instructions, symbols).and_then(|(i, s)| rt.run_logical_instruction(i, s)))
}

pub fn run_physical_instruction(rt: &mut Runtime, instructions: &str, symbols: &str) -> String {
    status(batch(instructions, symbols).and_then(|(i, s)| rt.run_physical_instruction(i, s)))
}

pub fn launch_job(rt: &Runtime, instance: Box<dyn JobInstance>) -> String {
    status(rt.launch_job(instance))
}

pub fn get_inter_user_job_info(rt: &Runtime) -> Reply {
    reply(rt.inter_user_job_info(), message)
}
