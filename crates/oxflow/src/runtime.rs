// Runtime - the environment/session state machine and every boundary call
//
// One owned value replaces process-wide globals: tests create as many
// independent runtimes as they like. Calls are gated by the lifecycle:
//
//   ids                              env inited
//   job building (open, add, ...)    session inited or started
//   attribute queries                session inited, started or stopped
//   dispatch, launch, push, pull     session started
//
// Jobs completed before StartGlobalSession are registered with the VM when
// the session starts; jobs completed afterwards are registered as they
// complete. Each completed job gets one push job per input op
// (`System-Push-<op>`) and one pull job per return op (`System-Pull-<op>`).
//
// Usage:
//
//   let mut rt = Runtime::new();
//   rt.init_env(EnvConfig::default())?;
//   rt.init_global_session(SessionConfig::default())?;
//   rt.open_job("train")?;
//   rt.set_job_conf(JobConfig::new("train"))?;
//   ...
//   rt.complete_job()?;
//   rt.close_job()?;
//   rt.start_global_session()?;

use std::collections::HashMap;
use std::sync::Arc;

use oxflow_core::{
    BlobAttr, DType, EagerSymbolList, EnvConfig, InstructionList, InterUserJobInfo, JobConfig,
    JobSet, LogicalBlobId, OpAttribute, OperatorConf, Resource, SessionConfig, Shape,
};

use crate::env::{Lifecycle, Transition};
use crate::host_array::HostArray;
use crate::job::JobBuildAndInferCtx;
use crate::push::{PushCallback, PushHandle, PushJobInstance};
use crate::session::Session;
use crate::vm::{
    Completion, Flavour, IdIssuer, IdNamespace, InstructionHandler, JobInstance, JobPlan,
    NoopHandler, PullJobInstance, Vm, VmStats,
};
use crate::{Error, Result};

pub const PUSH_JOB_PREFIX: &str = "System-Push-";
pub const PULL_JOB_PREFIX: &str = "System-Pull-";
pub const MODEL_INIT_JOB_NAME: &str = "System-ModelInit";
pub const MODEL_SAVE_JOB_NAME: &str = "System-ModelSave";

pub struct Runtime {
    state: Lifecycle,
    env: Option<EnvConfig>,
    session: Option<Session>,
    ids: IdIssuer,
    input_names: usize,
    handler: Arc<dyn InstructionHandler>,
    vm: Option<Vm>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_handler(Arc::new(NoopHandler))
    }

    /// Runtime whose VM forwards compute work to `handler`.
    pub fn with_handler(handler: Arc<dyn InstructionHandler>) -> Self {
        Self {
            state: Lifecycle::default(),
            env: None,
            session: None,
            ids: IdIssuer::new(),
            input_names: 0,
            handler,
            vm: None,
        }
    }

    pub fn state(&self) -> Lifecycle {
        self.state
    }

    fn env(&self, action: &'static str) -> Result<&EnvConfig> {
        self.state.require_env(action)?;
        self.env.as_ref().ok_or_else(|| self.state.reject(action))
    }

    fn session(&self, action: &'static str) -> Result<&Session> {
        self.state.require_session(action)?;
        self.session.as_ref().ok_or_else(|| self.state.reject(action))
    }

    fn building(&mut self, action: &'static str) -> Result<&mut Session> {
        self.state.require_building(action)?;
        let state = self.state;
        self.session.as_mut().ok_or_else(|| state.reject(action))
    }

    fn vm(&self, action: &'static str) -> Result<&Vm> {
        self.state.require_started(action)?;
        self.vm.as_ref().ok_or_else(|| self.state.reject(action))
    }

    // Environment

    pub fn init_env(&mut self, config: EnvConfig) -> Result<()> {
        let next = self.state.next(Transition::InitEnv)?;
        config.validate()?;
        tracing::info!(
            machines = config.machines.len(),
            gpus = config.gpu_device_num,
            cpus = config.cpu_device_num,
            "env inited"
        );
        self.env = Some(config);
        self.state = next;
        Ok(())
    }

    pub fn is_env_inited(&self) -> bool {
        self.state.is_env_inited()
    }

    pub fn destroy_env(&mut self) -> Result<()> {
        self.state = self.state.next(Transition::DestroyEnv)?;
        self.env = None;
        tracing::info!("env destroyed");
        Ok(())
    }

    pub fn env_resource(&self) -> Result<Resource> {
        Ok(self.env("query env resource")?.resource())
    }

    /// Resource of the current session.
    pub fn current_resource(&self) -> Result<Resource> {
        Ok(self.session("query current resource")?.resource)
    }

    pub fn current_machine_id(&self) -> Result<i64> {
        Ok(self.env("query current machine id")?.current_machine_id)
    }

    pub fn enable_eager_environment(&mut self, enabled: bool) -> Result<()> {
        const ACTION: &str = "toggle eager environment";
        if self.state.is_session_started() {
            return Err(self.state.reject(ACTION));
        }
        self.state.require_env(ACTION)?;
        let state = self.state;
        let env = self.env.as_mut().ok_or_else(|| state.reject(ACTION))?;
        env.enable_eager_execution = enabled;
        Ok(())
    }

    // Session

    pub fn init_global_session(&mut self, config: SessionConfig) -> Result<()> {
        let next = self.state.next(Transition::InitSession)?;
        let env_resource = self.env("init global session")?.resource();
        let session = Session::new(config, &env_resource)?;
        tracing::info!(session_id = session.config.session_id, "global session inited");
        self.session = Some(session);
        self.state = next;
        Ok(())
    }

    pub fn is_session_inited(&self) -> bool {
        self.state.is_session_inited()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn start_global_session(&mut self) -> Result<()> {
        const ACTION: &str = "start global session";
        let next = self.state.next(Transition::StartSession)?;
        let session = self.session(ACTION)?;
        if let Ok(open) = session.jobs.current_job_name() {
            return Err(Error::Lifecycle {
                action: ACTION,
                state: format!("job '{open}' is still open"),
            });
        }
        let mut info = InterUserJobInfo {
            global_model_init_job_name: MODEL_INIT_JOB_NAME.to_string(),
            global_model_save_job_name: MODEL_SAVE_JOB_NAME.to_string(),
            ..InterUserJobInfo::default()
        };
        let mut plans = HashMap::from([
            (MODEL_INIT_JOB_NAME.to_string(), JobPlan::ModelInit),
            (MODEL_SAVE_JOB_NAME.to_string(), JobPlan::ModelSave),
        ]);
        for ctx in session.jobs.contexts().filter(|c| c.is_completed()) {
            for (name, plan) in job_plans(ctx, &mut info)? {
                if plans.insert(name.clone(), plan).is_some() {
                    return Err(Error::Dispatch(format!("job name '{name}' is used twice")));
                }
            }
        }
        let jobs = plans.len();
        let vm = Vm::start(self.handler.clone(), plans)?;
        if let Some(session) = self.session.as_mut() {
            session.inter_user_job_info = Some(info);
        }
        self.vm = Some(vm);
        self.state = next;
        tracing::info!(jobs, "global session started");
        Ok(())
    }

    pub fn stop_global_session(&mut self) -> Result<()> {
        self.state = self.state.next(Transition::StopSession)?;
        if let Some(vm) = self.vm.take() {
            if let Err(e) = vm.sync() {
                tracing::warn!(error = %e, "vm did not drain cleanly");
            }
        }
        tracing::info!("global session stopped");
        Ok(())
    }

    pub fn destroy_global_session(&mut self) -> Result<()> {
        self.state = self.state.next(Transition::DestroySession)?;
        self.session = None;
        tracing::info!("global session destroyed");
        Ok(())
    }

    pub fn enable_eager_session(&mut self, enabled: bool) -> Result<()> {
        const ACTION: &str = "toggle eager session";
        if self.state.is_session_started() {
            return Err(self.state.reject(ACTION));
        }
        self.building(ACTION)?.eager = Some(enabled);
        Ok(())
    }

    /// The session toggle when set, else the environment toggle.
    pub fn eager_execution_enabled(&self) -> Result<bool> {
        let env = self.env("query eager execution")?;
        let session = self.session.as_ref().and_then(|s| s.eager);
        Ok(session.unwrap_or(env.enable_eager_execution))
    }

    pub fn push_mirrored_strategy_enabled(&mut self, enabled: bool) -> Result<()> {
        self.building("push mirrored strategy")?
            .push_mirrored_strategy_enabled(enabled);
        Ok(())
    }

    pub fn pop_mirrored_strategy_enabled(&mut self) -> Result<bool> {
        self.building("pop mirrored strategy")?
            .pop_mirrored_strategy_enabled()
    }

    pub fn is_mirrored_strategy_enabled(&self) -> Result<bool> {
        Ok(self
            .session("query mirrored strategy")?
            .is_mirrored_strategy_enabled())
    }

    pub fn is_consistent_strategy_enabled(&self) -> Result<bool> {
        Ok(!self.is_mirrored_strategy_enabled()?)
    }

    // Job building

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn open_job(&mut self, job_name: &str) -> Result<()> {
        let eager = self.eager_execution_enabled()?;
        let session = self.building("open job")?;
        let resource = session.resource;
        session.jobs.open(job_name, &resource, eager)
    }

    pub fn current_job_name(&self) -> Result<String> {
        Ok(self
            .session("query current job")?
            .jobs
            .current_job_name()?
            .to_string())
    }

    pub fn current_job_ctx(&self) -> Result<&JobBuildAndInferCtx> {
        self.session("query current job")?.jobs.current_ctx()
    }

    fn current_ctx_mut(&mut self, action: &'static str) -> Result<&mut JobBuildAndInferCtx> {
        self.building(action)?.jobs.current_ctx_mut()
    }

    pub fn close_job(&mut self) -> Result<()> {
        self.building("close job")?.jobs.close()?;
        Ok(())
    }

    pub fn set_job_conf(&mut self, conf: JobConfig) -> Result<()> {
        self.current_ctx_mut("set job conf")?.set_job_conf(conf)
    }

    pub fn has_job_conf(&self) -> Result<bool> {
        Ok(self.current_job_ctx()?.has_job_conf())
    }

    pub fn check_and_complete_op_conf(&self, op: &OperatorConf) -> Result<OperatorConf> {
        self.current_job_ctx()?.check_and_complete_op_conf(op)
    }

    pub fn infer_op_conf(&self, op: &OperatorConf) -> Result<OpAttribute> {
        self.current_job_ctx()?.infer_op_conf(op)
    }

    pub fn add_and_infer_consistent_op(&mut self, op: &OperatorConf) -> Result<OpAttribute> {
        self.current_ctx_mut("add consistent op")?
            .add_and_infer_consistent_op(op)
    }

    pub fn add_and_infer_mirrored_op(&mut self, op: &OperatorConf) -> Result<OpAttribute> {
        self.current_ctx_mut("add mirrored op")?
            .add_and_infer_mirrored_op(op)
    }

    pub fn add_loss_logical_blob_name(&mut self, lbn: &str) -> Result<()> {
        self.current_ctx_mut("add loss")?.add_loss_lbn(lbn)
    }

    pub fn add_lbi_and_diff_watcher_uuid_pair(
        &mut self,
        lbi: &LogicalBlobId,
        uuid: &str,
    ) -> Result<()> {
        self.current_ctx_mut("add diff watcher")?
            .add_lbi_and_diff_watcher_uuid_pair(lbi, uuid)
    }

    pub fn check_job(&self) -> Result<()> {
        self.current_job_ctx()?.check_job()
    }

    /// Freeze the current job. Once the session has started, the job's push,
    /// pull and user plans are built and checked against the VM before the
    /// job is frozen, so a clash leaves the job open and editable.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn complete_job(&mut self) -> Result<()> {
        const ACTION: &str = "complete job";
        self.state.require_building(ACTION)?;
        let state = self.state;
        let session = self.session.as_mut().ok_or_else(|| state.reject(ACTION))?;
        let vm = if state.is_session_started() {
            Some(self.vm.as_ref().ok_or_else(|| state.reject(ACTION))?)
        } else {
            None
        };

        let ctx = session.jobs.current_ctx()?;
        let staged = match vm {
            Some(vm) => {
                ctx.check_job()?;
                let mut info = session.inter_user_job_info.clone().unwrap_or_default();
                let plans = job_plans(ctx, &mut info)?;
                vm.check_plans(&plans)?;
                Some((vm, plans, info))
            }
            None => None,
        };
        session.jobs.current_ctx_mut()?.complete()?;
        if let Some((vm, plans, info)) = staged {
            vm.register_plans(plans)?;
            session.inter_user_job_info = Some(info);
        }
        Ok(())
    }

    pub fn job_set(&self) -> Result<JobSet> {
        Ok(self.session("query job set")?.jobs.job_set())
    }

    // Attribute queries

    pub fn job_ctx(&self, job_name: &str) -> Result<&JobBuildAndInferCtx> {
        self.session("query job")?.jobs.ctx(job_name)
    }

    pub fn blob_attr(&self, job_name: &str, lbn: &str) -> Result<&BlobAttr> {
        self.job_ctx(job_name)?.blob_attr(lbn)
    }

    pub fn mirrored_blob_attr(&self, job_name: &str, lbn: &str) -> Result<&BlobAttr> {
        Ok(&self.job_ctx(job_name)?.mirrored_blob(lbn)?.attr)
    }

    pub fn static_shape(&self, job_name: &str, lbn: &str) -> Result<Shape> {
        Ok(self.blob_attr(job_name, lbn)?.desc.shape.clone())
    }

    pub fn data_type(&self, job_name: &str, lbn: &str) -> Result<DType> {
        Ok(self.blob_attr(job_name, lbn)?.desc.data_type)
    }

    pub fn is_mirrored_blob(&self, job_name: &str, lbn: &str) -> Result<bool> {
        self.job_ctx(job_name)?.is_mirrored_blob(lbn)
    }

    pub fn mirrored_blob_num_sub_lbi(&self, job_name: &str, lbn: &str) -> Result<usize> {
        Ok(self.job_ctx(job_name)?.mirrored_blob(lbn)?.sub_lbis.len())
    }

    pub fn mirrored_blob_sub_lbi(
        &self,
        job_name: &str,
        lbn: &str,
        index: usize,
    ) -> Result<LogicalBlobId> {
        Ok(self
            .job_ctx(job_name)?
            .mirrored_sub_lbi(lbn, index)?
            .clone())
    }

    pub fn op_attribute(&self, job_name: &str, op_name: &str) -> Result<&OpAttribute> {
        self.job_ctx(job_name)?.op_attribute(op_name)
    }

    // Execution

    pub fn new_logical_object_id(&self) -> Result<i64> {
        self.new_id(IdNamespace::LogicalObject)
    }

    pub fn new_logical_symbol_id(&self) -> Result<i64> {
        self.new_id(IdNamespace::LogicalSymbol)
    }

    pub fn new_physical_object_id(&self) -> Result<i64> {
        self.new_id(IdNamespace::PhysicalObject)
    }

    pub fn new_physical_symbol_id(&self) -> Result<i64> {
        self.new_id(IdNamespace::PhysicalSymbol)
    }

    fn new_id(&self, ns: IdNamespace) -> Result<i64> {
        self.state.require_env("issue id")?;
        Ok(self.ids.next(ns))
    }

    /// Next `Input_<n>` name for an unnamed input descriptor.
    pub fn next_input_name(&mut self) -> String {
        let name = format!("Input_{}", self.input_names);
        self.input_names += 1;
        name
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub fn run_logical_instruction(
        &mut self,
        instructions: InstructionList,
        symbols: EagerSymbolList,
    ) -> Result<()> {
        self.run_instructions(Flavour::Logical, instructions, symbols)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub fn run_physical_instruction(
        &mut self,
        instructions: InstructionList,
        symbols: EagerSymbolList,
    ) -> Result<()> {
        self.run_instructions(Flavour::Physical, instructions, symbols)
    }

    fn run_instructions(
        &mut self,
        flavour: Flavour,
        instructions: InstructionList,
        symbols: EagerSymbolList,
    ) -> Result<()> {
        const ACTION: &str = "run instructions";
        self.state.require_started(ACTION)?;
        let state = self.state;
        self.vm
            .as_mut()
            .ok_or_else(|| state.reject(ACTION))?
            .run_instructions(flavour, instructions, symbols)
    }

    pub fn launch_job(&self, instance: Box<dyn JobInstance>) -> Result<()> {
        self.vm("launch job")?.launch_job(instance)
    }

    /// Wait until everything accepted so far has executed.
    pub fn sync(&self) -> Result<()> {
        self.vm("sync")?.sync()
    }

    pub fn vm_stats(&self) -> Result<VmStats> {
        self.vm("query vm stats")?.stats()
    }

    pub fn inter_user_job_info(&self) -> Result<InterUserJobInfo> {
        const ACTION: &str = "query inter-user job info";
        self.state.require_started(ACTION)?;
        self.session(ACTION)?
            .inter_user_job_info
            .clone()
            .ok_or_else(|| self.state.reject(ACTION))
    }

    fn interface_job(&self, op_name: &str, push: bool) -> Result<String> {
        let info = self.inter_user_job_info()?;
        let map = if push {
            &info.input_or_var_op_name2push_job_name
        } else {
            &info.output_or_var_op_name2pull_job_name
        };
        map.get(op_name).cloned().ok_or_else(|| {
            Error::Dispatch(format!(
                "no {} job for op '{op_name}'",
                if push { "push" } else { "pull" }
            ))
        })
    }

    /// Feed the input op `op_name` of a completed job.
    pub fn async_push(&self, op_name: &str, callback: PushCallback) -> Result<PushHandle> {
        let job_name = self.interface_job(op_name, true)?;
        let (instance, handle) = PushJobInstance::new(job_name, callback);
        self.launch_job(Box::new(instance))?;
        Ok(handle)
    }

    /// Fetch what the return op `op_name` produced in the last run.
    pub fn async_pull(&self, op_name: &str) -> Result<Completion<Vec<HostArray>>> {
        let job_name = self.interface_job(op_name, false)?;
        let (instance, handle) = PullJobInstance::new(job_name);
        self.launch_job(Box::new(instance))?;
        Ok(handle)
    }
}

/// Plans for one completed job and its interface jobs; records the interface
/// jobs in `info`.
fn job_plans(ctx: &JobBuildAndInferCtx, info: &mut InterUserJobInfo) -> Result<Vec<(String, JobPlan)>> {
    let input_ops: Vec<String> = ctx.input_op_names().map(str::to_string).collect();
    let mut plans = Vec::new();
    for op in &input_ops {
        let push_job = format!("{PUSH_JOB_PREFIX}{op}");
        if info
            .input_or_var_op_name2push_job_name
            .insert(op.clone(), push_job.clone())
            .is_some()
        {
            return Err(Error::Dispatch(format!(
                "input op '{op}' appears in more than one job"
            )));
        }
        let desc = ctx.blob_attr(&format!("{op}/out"))?.desc.clone();
        plans.push((
            push_job,
            JobPlan::Push {
                op_name: op.clone(),
                desc,
            },
        ));
    }
    for op in ctx.return_op_names() {
        let pull_job = format!("{PULL_JOB_PREFIX}{op}");
        if info
            .output_or_var_op_name2pull_job_name
            .insert(op.to_string(), pull_job.clone())
            .is_some()
        {
            return Err(Error::Dispatch(format!(
                "return op '{op}' appears in more than one job"
            )));
        }
        plans.push((
            pull_job,
            JobPlan::Pull {
                op_name: op.to_string(),
            },
        ));
    }
    plans.push((
        ctx.job_name().to_string(),
        JobPlan::User {
            job: ctx.job(),
            input_ops,
        },
    ));
    Ok(plans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxflow_core::{InstructionProto, OpKind};

    fn session_runtime() -> Runtime {
        let mut rt = Runtime::new();
        rt.init_env(EnvConfig::default()).unwrap();
        rt.init_global_session(SessionConfig::default()).unwrap();
        rt
    }

    #[test]
    fn test_gating() {
        let mut rt = Runtime::new();
        assert!(rt.new_logical_object_id().is_err());
        assert!(rt.open_job("j").is_err());
        rt.init_env(EnvConfig::default()).unwrap();
        assert_eq!(rt.new_logical_object_id().unwrap(), 1);
        assert!(rt.open_job("j").is_err());
        assert!(matches!(
            rt.start_global_session(),
            Err(Error::Lifecycle { .. })
        ));
        rt.init_global_session(SessionConfig::default()).unwrap();
        assert!(rt
            .run_logical_instruction(InstructionList::default(), EagerSymbolList::default())
            .is_err());
        assert!(rt.inter_user_job_info().is_err());
    }

    #[test]
    fn test_start_rejects_open_job() {
        let mut rt = session_runtime();
        rt.open_job("j").unwrap();
        assert!(rt.start_global_session().is_err());
        rt.close_job().unwrap();
        rt.start_global_session().unwrap();
        let info = rt.inter_user_job_info().unwrap();
        assert_eq!(info.global_model_init_job_name, MODEL_INIT_JOB_NAME);
    }

    #[test]
    fn test_eager_toggles() {
        let mut rt = session_runtime();
        assert!(!rt.eager_execution_enabled().unwrap());
        rt.enable_eager_environment(true).unwrap();
        assert!(rt.eager_execution_enabled().unwrap());
        rt.enable_eager_session(false).unwrap();
        assert!(!rt.eager_execution_enabled().unwrap());
        rt.start_global_session().unwrap();
        assert!(rt.enable_eager_session(true).is_err());
        assert!(rt.enable_eager_environment(true).is_err());
    }

    #[test]
    fn test_job_completed_after_start_is_launchable() {
        let mut rt = session_runtime();
        rt.start_global_session().unwrap();
        rt.open_job("late").unwrap();
        rt.set_job_conf(JobConfig::new("late")).unwrap();
        let x = crate::ArgBlobDef::fixed(2usize, DType::F32, Some(0))
            .unwrap()
            .with_name("late_x")
            .unwrap();
        rt.add_and_infer_consistent_op(&x.to_op_conf()).unwrap();
        rt.add_and_infer_consistent_op(&OperatorConf::new(
            "late_ret",
            OpKind::Return {
                input: "late_x/out".into(),
            },
        ))
        .unwrap();
        rt.complete_job().unwrap();
        rt.close_job().unwrap();
        let info = rt.inter_user_job_info().unwrap();
        assert_eq!(
            info.input_or_var_op_name2push_job_name["late_x"],
            "System-Push-late_x"
        );
        assert_eq!(
            info.output_or_var_op_name2pull_job_name["late_ret"],
            "System-Pull-late_ret"
        );
    }

    fn input(op: &str) -> OperatorConf {
        let mut conf = oxflow_core::InterfaceBlobConf::new(Shape::from(2usize), DType::F32);
        conf.batch_axis = Some(0);
        OperatorConf::input(op, conf)
    }

    #[test]
    fn test_clashing_late_job_stays_open() {
        let mut rt = session_runtime();
        rt.open_job("first").unwrap();
        rt.set_job_conf(JobConfig::new("first")).unwrap();
        rt.add_and_infer_consistent_op(&input("x")).unwrap();
        rt.complete_job().unwrap();
        rt.close_job().unwrap();
        rt.start_global_session().unwrap();

        rt.open_job("second").unwrap();
        rt.set_job_conf(JobConfig::new("second")).unwrap();
        rt.add_and_infer_consistent_op(&input("x")).unwrap();
        assert!(matches!(rt.complete_job(), Err(Error::Dispatch(_))));
        assert!(!rt.current_job_ctx().unwrap().is_completed());

        // still editable, and nothing half-registered blocks a later attempt
        rt.add_and_infer_consistent_op(&input("y")).unwrap();
        assert!(rt.complete_job().is_err());
        rt.close_job().unwrap();
        let (run, _done) = crate::vm::UserJobInstance::new("second");
        assert!(rt.launch_job(Box::new(run)).is_err());

        rt.open_job("third").unwrap();
        rt.set_job_conf(JobConfig::new("third")).unwrap();
        rt.add_and_infer_consistent_op(&input("z")).unwrap();
        rt.complete_job().unwrap();
        let info = rt.inter_user_job_info().unwrap();
        assert_eq!(info.input_or_var_op_name2push_job_name["x"], "System-Push-x");
        assert_eq!(info.input_or_var_op_name2push_job_name["z"], "System-Push-z");
        assert!(!info.input_or_var_op_name2push_job_name.contains_key("y"));
    }

    #[test]
    fn test_instructions_after_start() {
        let mut rt = session_runtime();
        rt.start_global_session().unwrap();
        let id = rt.new_logical_symbol_id().unwrap();
        let list = InstructionList::new(vec![InstructionProto::new("NewSymbol")
            .with_operand(oxflow_core::Operand::Int64(id))
            .with_operand(oxflow_core::Operand::Int64(1))]);
        rt.run_logical_instruction(list.clone(), EagerSymbolList::default())
            .unwrap();
        assert!(rt
            .run_physical_instruction(list, EagerSymbolList::default())
            .is_err());
        rt.sync().unwrap();
        assert_eq!(rt.vm_stats().unwrap().batches, 1);
        rt.stop_global_session().unwrap();
        assert!(rt.sync().is_err());
    }
}
