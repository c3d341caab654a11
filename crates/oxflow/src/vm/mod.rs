// Vm - asynchronous instruction and job executor
//
// Submissions are validated on the caller thread and queued; a single
// background worker drains the queue in FIFO order. A submission that fails
// validation schedules nothing. Failures that only show up at execution time
// are logged and recorded in VmStats.
//
//   run_instructions(flavour, list, symbols)   atomic instruction batch
//   launch_job(instance)                       run a push/pull/user job
//   sync()                                     wait for everything queued so far
//
// The worker owns per-flavour object and symbol tables plus the input and
// output blob buffers that push, user and pull jobs pass between each other.
//
// Components:
//   id        - IdIssuer, four independent monotonic id namespaces
//   registry  - control instruction names and flavour checks
//   instance  - JobInstance and the completion handles

pub mod id;
pub mod instance;
pub mod registry;

use std::collections::{HashMap, HashSet};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread;

use oxflow_core::{
    BlobDesc, EagerSymbolList, InstructionList, InstructionProto, Job, OpKind, Operand,
    SymbolPayload, OUTPUT_BN,
};

use crate::push::OfBlob;
use crate::{Error, Result};

pub use id::{IdIssuer, IdNamespace};
pub use instance::{completion, Completion, JobInstance, PullJobInstance, UserJobInstance};
pub use registry::{classify, ControlOp, Flavour, InstrKind};

/// Symbols visible to an instruction, by id.
pub type SymbolTable = HashMap<i64, SymbolPayload>;

/// Executes compute instructions and user jobs. Kernels live behind this.
pub trait InstructionHandler: Send + Sync {
    fn execute(
        &self,
        flavour: Flavour,
        instr: &InstructionProto,
        symbols: &SymbolTable,
    ) -> Result<()>;

    /// Run `job` on the pushed input buffers, keyed by input op name.
    /// Returns output buffers keyed by return op name.
    fn run_job(&self, job: &Job, inputs: &HashMap<String, OfBlob>)
        -> Result<HashMap<String, OfBlob>>;
}

/// Runs no kernels. A return op reading an input op directly echoes that
/// input's buffer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl InstructionHandler for NoopHandler {
    fn execute(&self, _: Flavour, _: &InstructionProto, _: &SymbolTable) -> Result<()> {
        Ok(())
    }

    fn run_job(
        &self,
        job: &Job,
        inputs: &HashMap<String, OfBlob>,
    ) -> Result<HashMap<String, OfBlob>> {
        let mut outputs = HashMap::new();
        for op in &job.ops {
            if let OpKind::Return { input } = &op.kind {
                let source = input
                    .strip_suffix(OUTPUT_BN)
                    .and_then(|s| s.strip_suffix('/'))
                    .and_then(|name| inputs.get(name));
                if let Some(blob) = source {
                    outputs.insert(op.name.clone(), blob.clone());
                }
            }
        }
        Ok(outputs)
    }
}

/// What the worker does when a job of a given name is launched.
#[derive(Debug, Clone)]
pub enum JobPlan {
    User {
        job: Job,
        input_ops: Vec<String>,
    },
    Push {
        op_name: String,
        desc: BlobDesc,
    },
    Pull {
        op_name: String,
    },
    ModelInit,
    ModelSave,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmStats {
    pub batches: u64,
    pub instructions: u64,
    pub jobs: u64,
    pub failures: u64,
    pub last_error: Option<String>,
}

enum WorkItem {
    Batch {
        flavour: Flavour,
        instructions: InstructionList,
        symbols: EagerSymbolList,
    },
    Launch(Box<dyn JobInstance>),
    Sync(mpsc::Sender<()>),
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock()
        .map_err(|_| Error::Dispatch("vm state lock poisoned".into()))
}

fn check_plan_names(
    registered: &HashMap<String, JobPlan>,
    new_plans: &[(String, JobPlan)],
) -> Result<()> {
    let mut seen = HashSet::new();
    for (name, _) in new_plans {
        if registered.contains_key(name) || !seen.insert(name.as_str()) {
            return Err(Error::Dispatch(format!("job '{name}' is already registered")));
        }
    }
    Ok(())
}

pub struct Vm {
    sender: Option<mpsc::Sender<WorkItem>>,
    worker: Option<thread::JoinHandle<()>>,
    accepted_symbols: HashMap<Flavour, HashSet<i64>>,
    plans: Arc<Mutex<HashMap<String, JobPlan>>>,
    stats: Arc<Mutex<VmStats>>,
}

impl Vm {
    pub fn start(
        handler: Arc<dyn InstructionHandler>,
        plans: HashMap<String, JobPlan>,
    ) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let plans = Arc::new(Mutex::new(plans));
        let stats = Arc::new(Mutex::new(VmStats::default()));
        let mut worker = Worker {
            handler,
            plans: plans.clone(),
            stats: stats.clone(),
            objects: HashMap::new(),
            symbols: HashMap::new(),
            symbol_slots: HashMap::new(),
            input_buffers: HashMap::new(),
            output_buffers: HashMap::new(),
        };
        let handle = thread::Builder::new()
            .name("oxflow-vm".into())
            .spawn(move || worker.run(receiver))?;
        tracing::debug!("vm worker started");
        Ok(Self {
            sender: Some(sender),
            worker: Some(handle),
            accepted_symbols: HashMap::new(),
            plans,
            stats,
        })
    }

    fn send(&self, item: WorkItem) -> Result<()> {
        self.sender
            .as_ref()
            .ok_or_else(|| Error::Dispatch("vm is shut down".into()))?
            .send(item)
            .map_err(|_| Error::Dispatch("vm worker has stopped".into()))
    }

    pub fn register_plan(&self, job_name: impl Into<String>, plan: JobPlan) -> Result<()> {
        self.register_plans(vec![(job_name.into(), plan)])
    }

    /// Register every plan or none of them.
    pub fn register_plans(&self, new_plans: Vec<(String, JobPlan)>) -> Result<()> {
        let mut plans = lock(&self.plans)?;
        check_plan_names(&plans, &new_plans)?;
        plans.extend(new_plans);
        Ok(())
    }

    /// Fails if any of `new_plans` would clash with a registered job.
    pub fn check_plans(&self, new_plans: &[(String, JobPlan)]) -> Result<()> {
        check_plan_names(&*lock(&self.plans)?, new_plans)
    }

    pub fn has_plan(&self, job_name: &str) -> Result<bool> {
        Ok(lock(&self.plans)?.contains_key(job_name))
    }

    /// Validate and queue one batch. Nothing is queued when validation fails.
    pub fn run_instructions(
        &mut self,
        flavour: Flavour,
        instructions: InstructionList,
        symbols: EagerSymbolList,
    ) -> Result<()> {
        let accepted = self.accepted_symbols.entry(flavour).or_default();
        let mut batch_ids = HashSet::new();
        for symbol in &symbols.symbols {
            if accepted.contains(&symbol.symbol_id) || !batch_ids.insert(symbol.symbol_id) {
                return Err(Error::Dispatch(format!(
                    "symbol {} is already defined",
                    symbol.symbol_id
                )));
            }
        }
        let mut deleted = Vec::new();
        for (i, instr) in instructions.instructions.iter().enumerate() {
            let kind = classify(&instr.instr_type_name, flavour)?;
            let known = |id: &i64| batch_ids.contains(id) || accepted.contains(id);
            if let Some(id) = instr.symbol_refs().find(|id| !known(id)) {
                return Err(Error::Dispatch(format!(
                    "instruction {i} ('{}') references undefined symbol {id}",
                    instr.instr_type_name
                )));
            }
            for operand in &instr.operands {
                match operand {
                    Operand::InitSymbol(id) if !batch_ids.contains(id) => {
                        return Err(Error::Dispatch(format!(
                            "instruction {i} initialises symbol {id} missing from the batch"
                        )));
                    }
                    Operand::Object {
                        logical_object_id, ..
                    } if *logical_object_id < 0 => {
                        return Err(Error::Dispatch(format!(
                            "instruction {i} references negative object id {logical_object_id}"
                        )));
                    }
                    Operand::Symbol(id) if kind == InstrKind::Control(ControlOp::DeleteSymbol) => {
                        deleted.push(*id);
                    }
                    _ => {}
                }
            }
        }

        let count = instructions.instructions.len();
        self.send(WorkItem::Batch {
            flavour,
            instructions,
            symbols,
        })?;
        let accepted = self.accepted_symbols.entry(flavour).or_default();
        accepted.extend(batch_ids);
        for id in deleted {
            accepted.remove(&id);
        }
        tracing::debug!(%flavour, instructions = count, "instruction batch accepted");
        Ok(())
    }

    /// Queue a launch. Fails immediately when no plan has the instance's name.
    pub fn launch_job(&self, instance: Box<dyn JobInstance>) -> Result<()> {
        let name = instance.job_name().to_string();
        if !self.has_plan(&name)? {
            return Err(Error::Dispatch(format!("no job named '{name}' to launch")));
        }
        self.send(WorkItem::Launch(instance))?;
        tracing::debug!(job = %name, "job launch accepted");
        Ok(())
    }

    /// Block until every previously accepted item has executed.
    pub fn sync(&self) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        self.send(WorkItem::Sync(tx))?;
        rx.recv()
            .map_err(|_| Error::Dispatch("vm worker stopped before sync".into()))
    }

    pub fn stats(&self) -> Result<VmStats> {
        Ok(lock(&self.stats)?.clone())
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        // closing the channel ends the worker loop once the queue drains
        self.sender.take();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                tracing::error!("vm worker panicked");
            }
        }
    }
}

struct Worker {
    handler: Arc<dyn InstructionHandler>,
    plans: Arc<Mutex<HashMap<String, JobPlan>>>,
    stats: Arc<Mutex<VmStats>>,
    objects: HashMap<Flavour, HashSet<i64>>,
    symbols: HashMap<Flavour, SymbolTable>,
    /// Parallel num reserved by NewSymbol.
    symbol_slots: HashMap<Flavour, HashMap<i64, i64>>,
    input_buffers: HashMap<String, OfBlob>,
    output_buffers: HashMap<String, OfBlob>,
}

impl Worker {
    fn run(&mut self, receiver: mpsc::Receiver<WorkItem>) {
        for item in receiver {
            match item {
                WorkItem::Batch {
                    flavour,
                    instructions,
                    symbols,
                } => {
                    let result = self.run_batch(flavour, &instructions, symbols);
                    self.record(|s| {
                        s.batches += 1;
                        s.instructions += instructions.instructions.len() as u64;
                    });
                    if let Err(e) = result {
                        tracing::warn!(%flavour, error = %e, "instruction batch failed");
                        self.record_failure(&e);
                    }
                }
                WorkItem::Launch(instance) => {
                    let name = instance.job_name().to_string();
                    self.launch(instance);
                    self.record(|s| s.jobs += 1);
                    tracing::debug!(job = %name, "job finished");
                }
                WorkItem::Sync(done) => {
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!("vm worker stopped");
    }

    fn record(&self, f: impl FnOnce(&mut VmStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut stats);
    }

    fn record_failure(&self, e: &Error) {
        self.record(|s| {
            s.failures += 1;
            s.last_error = Some(e.to_string());
        });
    }

    fn run_batch(
        &mut self,
        flavour: Flavour,
        list: &InstructionList,
        symbols: EagerSymbolList,
    ) -> Result<()> {
        let table = self.symbols.entry(flavour).or_default();
        for symbol in symbols.symbols {
            table.insert(symbol.symbol_id, symbol.payload);
        }
        for instr in &list.instructions {
            match classify(&instr.instr_type_name, flavour)? {
                InstrKind::Control(op) => self.control(flavour, op, instr)?,
                InstrKind::Compute => {
                    let table = self.symbols.entry(flavour).or_default();
                    if let Some(id) = instr.symbol_refs().find(|id| !table.contains_key(id)) {
                        return Err(Error::Dispatch(format!(
                            "'{}' reads deleted symbol {id}",
                            instr.instr_type_name
                        )));
                    }
                    self.handler.execute(flavour, instr, table)?;
                }
            }
        }
        Ok(())
    }

    fn control(&mut self, flavour: Flavour, op: ControlOp, instr: &InstructionProto) -> Result<()> {
        let name = &instr.instr_type_name;
        match op {
            ControlOp::NewObject => {
                let objects = self.objects.entry(flavour).or_default();
                for operand in &instr.operands {
                    if let Operand::Int64(id) = operand {
                        if !objects.insert(*id) {
                            return Err(Error::Dispatch(format!("{name}: object {id} exists")));
                        }
                    }
                }
            }
            ControlOp::DeleteObject => {
                let objects = self.objects.entry(flavour).or_default();
                for operand in &instr.operands {
                    if let Operand::Object {
                        logical_object_id, ..
                    } = operand
                    {
                        if !objects.remove(logical_object_id) {
                            return Err(Error::Dispatch(format!(
                                "{name}: unknown object {logical_object_id}"
                            )));
                        }
                    }
                }
            }
            ControlOp::NewSymbol => match instr.operands.as_slice() {
                [Operand::Int64(id), Operand::Int64(parallel_num), ..] => {
                    let slots = self.symbol_slots.entry(flavour).or_default();
                    if slots.insert(*id, *parallel_num).is_some() {
                        return Err(Error::Dispatch(format!("{name}: symbol {id} exists")));
                    }
                }
                _ => {
                    return Err(Error::Dispatch(format!(
                        "{name} expects (symbol id, parallel num) operands"
                    )))
                }
            },
            ControlOp::InitSymbol => {
                let table = self.symbols.entry(flavour).or_default();
                for operand in &instr.operands {
                    if let Operand::InitSymbol(id) = operand {
                        if !table.contains_key(id) {
                            return Err(Error::Dispatch(format!("{name}: symbol {id} has no value")));
                        }
                    }
                }
            }
            ControlOp::DeleteSymbol => {
                let table = self.symbols.entry(flavour).or_default();
                let slots = self.symbol_slots.entry(flavour).or_default();
                for operand in &instr.operands {
                    if let Operand::Symbol(id) = operand {
                        slots.remove(id);
                        if table.remove(id).is_none() {
                            return Err(Error::Dispatch(format!("{name}: unknown symbol {id}")));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn launch(&mut self, mut instance: Box<dyn JobInstance>) {
        let plan = self
            .plans
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(instance.job_name())
            .cloned();
        let result = match plan {
            None => Err(Error::Dispatch(format!(
                "no job named '{}'",
                instance.job_name()
            ))),
            Some(JobPlan::Push { op_name, desc }) => OfBlob::new(desc).and_then(|mut blob| {
                instance.push_blob(&mut blob).map(|()| {
                    self.input_buffers.insert(op_name, blob);
                })
            }),
            Some(JobPlan::Pull { op_name }) => match self.output_buffers.remove(&op_name) {
                Some(blob) => instance.pull_blob(&blob),
                None => Err(Error::Dispatch(format!(
                    "no output is ready for return op '{op_name}'"
                ))),
            },
            Some(JobPlan::User { job, input_ops }) => self.run_user_job(&job, &input_ops),
            Some(JobPlan::ModelInit) | Some(JobPlan::ModelSave) => Ok(()),
        };
        if let Err(e) = &result {
            tracing::warn!(job = instance.job_name(), error = %e, "job failed");
            self.record_failure(e);
        }
        instance.finish(result);
    }

    fn run_user_job(&mut self, job: &Job, input_ops: &[String]) -> Result<()> {
        let mut inputs = HashMap::with_capacity(input_ops.len());
        for op in input_ops {
            let blob = self.input_buffers.remove(op).ok_or_else(|| {
                Error::Dispatch(format!(
                    "job '{}' launched before input '{op}' was pushed",
                    job.conf.job_name
                ))
            })?;
            inputs.insert(op.clone(), blob);
        }
        let outputs = self.handler.run_job(job, &inputs)?;
        self.output_buffers.extend(outputs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxflow_core::{DType, EagerSymbol, ParallelConf, Shape};

    fn vm() -> Vm {
        Vm::start(Arc::new(NoopHandler), HashMap::new()).unwrap()
    }

    fn symbols(ids: &[i64]) -> EagerSymbolList {
        EagerSymbolList {
            symbols: ids
                .iter()
                .map(|&symbol_id| EagerSymbol {
                    symbol_id,
                    payload: SymbolPayload::ParallelConf(ParallelConf::default()),
                })
                .collect(),
        }
    }

    fn list(instrs: Vec<InstructionProto>) -> InstructionList {
        InstructionList::new(instrs)
    }

    #[test]
    fn test_symbols_resolve_across_batches() {
        let mut vm = vm();
        let init = InstructionProto::new("InitSymbol").with_operand(Operand::InitSymbol(1));
        vm.run_instructions(Flavour::Logical, list(vec![init]), symbols(&[1]))
            .unwrap();
        let relu = InstructionProto::new("relu").with_parallel_desc(1);
        vm.run_instructions(Flavour::Logical, list(vec![relu.clone()]), symbols(&[]))
            .unwrap();
        // symbols do not leak across flavours
        assert!(vm
            .run_instructions(Flavour::Physical, list(vec![relu]), symbols(&[]))
            .is_err());
        vm.sync().unwrap();
        let stats = vm.stats().unwrap();
        assert_eq!(stats.batches, 2);
        assert_eq!(stats.failures, 0);
    }

    #[test]
    fn test_rejected_batch_schedules_nothing() {
        let mut vm = vm();
        let bad = list(vec![
            InstructionProto::new("relu"),
            InstructionProto::new("LocalNewObject"),
        ]);
        assert!(vm.run_instructions(Flavour::Logical, bad, symbols(&[2])).is_err());
        // symbol 2 was not recorded by the failed batch
        vm.run_instructions(Flavour::Logical, list(vec![]), symbols(&[2]))
            .unwrap();
        assert!(vm
            .run_instructions(Flavour::Logical, list(vec![]), symbols(&[2]))
            .is_err());
        vm.sync().unwrap();
        assert_eq!(vm.stats().unwrap().batches, 1);
    }

    #[test]
    fn test_negative_object_id_rejected() {
        let mut vm = vm();
        let instr = InstructionProto::new("relu").with_operand(Operand::Object {
            logical_object_id: -1,
            parallel: oxflow_core::ParallelSelector::AllMirrored,
            mutable: false,
        });
        assert!(vm
            .run_instructions(Flavour::Logical, list(vec![instr]), symbols(&[]))
            .is_err());
    }

    #[test]
    fn test_execution_failure_is_recorded() {
        let mut vm = vm();
        let delete = InstructionProto::new("LocalDeleteObject").with_operand(Operand::Object {
            logical_object_id: 7,
            parallel: oxflow_core::ParallelSelector::CurrentGlobalDevice,
            mutable: true,
        });
        vm.run_instructions(Flavour::Physical, list(vec![delete]), symbols(&[]))
            .unwrap();
        vm.sync().unwrap();
        let stats = vm.stats().unwrap();
        assert_eq!(stats.failures, 1);
        assert!(stats.last_error.unwrap().contains("unknown object 7"));
    }

    #[test]
    fn test_register_plans_is_all_or_nothing() {
        let vm = vm();
        vm.register_plan("System-Pull-a", JobPlan::Pull { op_name: "a".into() })
            .unwrap();
        let clash = vec![
            ("System-Pull-b".to_string(), JobPlan::Pull { op_name: "b".into() }),
            ("System-Pull-a".to_string(), JobPlan::Pull { op_name: "a".into() }),
        ];
        assert!(vm.check_plans(&clash).is_err());
        assert!(matches!(vm.register_plans(clash), Err(Error::Dispatch(_))));
        assert!(!vm.has_plan("System-Pull-b").unwrap());

        let twice = vec![
            ("System-Pull-c".to_string(), JobPlan::Pull { op_name: "c".into() }),
            ("System-Pull-c".to_string(), JobPlan::Pull { op_name: "c".into() }),
        ];
        assert!(vm.register_plans(twice).is_err());
        assert!(!vm.has_plan("System-Pull-c").unwrap());
    }

    #[test]
    fn test_push_then_pull_through_noop_handler() {
        let vm = vm();
        let desc = BlobDesc::new(Shape::from((1, 2)), DType::F32);
        vm.register_plan(
            "System-Push-x",
            JobPlan::Push {
                op_name: "x".into(),
                desc,
            },
        )
        .unwrap();
        vm.register_plan(
            "j",
            JobPlan::User {
                job: Job {
                    conf: oxflow_core::JobConfig::new("j"),
                    ops: vec![oxflow_core::OperatorConf::new(
                        "ret",
                        OpKind::Return {
                            input: "x/out".into(),
                        },
                    )],
                    loss_lbns: vec![],
                },
                input_ops: vec!["x".into()],
            },
        )
        .unwrap();
        vm.register_plan("System-Pull-ret", JobPlan::Pull { op_name: "ret".into() })
            .unwrap();

        let (user, done) = UserJobInstance::new("j");
        vm.launch_job(Box::new(user)).unwrap();
        assert!(done.wait().is_err(), "nothing was pushed yet");

        let array = crate::HostArray::from(ndarray::array![[1.0f32, 2.0]]);
        let cb = crate::push::make_push_ndarray_callback(&array);
        let (push, pushed) = crate::push::PushJobInstance::new("System-Push-x", cb);
        vm.launch_job(Box::new(push)).unwrap();
        let (user, done) = UserJobInstance::new("j");
        vm.launch_job(Box::new(user)).unwrap();
        let (pull, pulled) = PullJobInstance::new("System-Pull-ret");
        vm.launch_job(Box::new(pull)).unwrap();

        pushed.wait().unwrap();
        done.wait().unwrap();
        assert_eq!(pulled.wait().unwrap(), vec![array]);
        assert!(vm.launch_job(Box::new(UserJobInstance::new("nope").0)).is_err());
    }
}
