// JobBuildAndInferCtx - the per-job builder
//
// Accumulates operator confs for one job, infers the attribute of every
// output as ops are added, and answers attribute queries by logical blob
// name. Two addressing modes exist side by side:
//
//   consistent  - one logical blob per op output (`op/out`)
//   mirrored    - one logical name backed by N per-rank consistent sub-blobs,
//                 produced by sub-ops `System-Mirrored-<op>-<i>` placed on the
//                 i-th device of the op's placement
//
// An op is committed only when its whole inference succeeds; a failing op
// leaves the context exactly as it was. Complete() freezes the job; in lazy
// mode it first re-runs inference over the whole graph and plans the boxing
// edges between producers and consumers on different placements.

use std::collections::{BTreeMap, HashMap};

use oxflow_core::{
    BlobAttr, Job, JobConfig, LogicalBlobId, OpAttribute, OpKind, OperatorConf, OutputAttr,
    ParallelConf, Resource, OUTPUT_BN,
};

use super::infer::infer_op;
use crate::{Error, Result};

/// Prefix of the per-rank sub-ops of a mirrored op.
pub const MIRRORED_SUB_OP_PREFIX: &str = "System-Mirrored-";

/// A mirrored logical blob: its logical attribute plus its per-rank sub-blobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirroredBlob {
    pub attr: BlobAttr,
    pub sub_lbis: Vec<LogicalBlobId>,
}

/// A producer/consumer pair on different placements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoxingEdge {
    pub producer: LogicalBlobId,
    pub consumer_op: String,
    pub from: ParallelConf,
    pub to: ParallelConf,
}

#[derive(Debug)]
pub struct JobBuildAndInferCtx {
    job_name: String,
    conf: Option<JobConfig>,
    resource: Resource,
    eager: bool,
    /// Consistent ops in commit order, mirrored sub-ops included.
    ops: Vec<OperatorConf>,
    op_attrs: HashMap<String, OpAttribute>,
    blobs: HashMap<String, BlobAttr>,
    mirrored: HashMap<String, MirroredBlob>,
    loss_lbns: Vec<String>,
    diff_watchers: BTreeMap<String, LogicalBlobId>,
    boxing_edges: Vec<BoxingEdge>,
    completed: bool,
}

pub fn mirrored_sub_op_name(op_name: &str, index: usize) -> String {
    format!("{MIRRORED_SUB_OP_PREFIX}{op_name}-{index}")
}

impl JobBuildAndInferCtx {
    pub fn new(job_name: impl Into<String>, resource: Resource, eager: bool) -> Self {
        Self {
            job_name: job_name.into(),
            conf: None,
            resource,
            eager,
            ops: Vec::new(),
            op_attrs: HashMap::new(),
            blobs: HashMap::new(),
            mirrored: HashMap::new(),
            loss_lbns: Vec::new(),
            diff_watchers: BTreeMap::new(),
            boxing_edges: Vec::new(),
            completed: false,
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn is_eager(&self) -> bool {
        self.eager
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn ops(&self) -> &[OperatorConf] {
        &self.ops
    }

    pub fn loss_lbns(&self) -> &[String] {
        &self.loss_lbns
    }

    pub fn boxing_edges(&self) -> &[BoxingEdge] {
        &self.boxing_edges
    }

    pub fn diff_watchers(&self) -> &BTreeMap<String, LogicalBlobId> {
        &self.diff_watchers
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.completed {
            return Err(Error::JobCompleted(self.job_name.clone()));
        }
        Ok(())
    }

    fn job_conf_error(&self, reason: impl Into<String>) -> Error {
        Error::JobConf {
            job: self.job_name.clone(),
            reason: reason.into(),
        }
    }

    // Job conf

    pub fn set_job_conf(&mut self, mut conf: JobConfig) -> Result<()> {
        self.ensure_mutable()?;
        if self.conf.is_some() {
            return Err(self.job_conf_error("job conf is already set"));
        }
        if !self.ops.is_empty() || !self.op_attrs.is_empty() {
            return Err(self.job_conf_error("job conf must be set before any op is added"));
        }
        if conf.job_name.is_empty() {
            conf.job_name = self.job_name.clone();
        } else if conf.job_name != self.job_name {
            return Err(self.job_conf_error(format!(
                "job conf names job '{}'",
                conf.job_name
            )));
        }
        conf.default_parallel_conf
            .validate(&self.resource)
            .map_err(|e| self.job_conf_error(format!("default placement: {e}")))?;
        tracing::debug!(job = %self.job_name, kind = conf.kind.name(), "job conf set");
        self.conf = Some(conf);
        Ok(())
    }

    pub fn has_job_conf(&self) -> bool {
        self.conf.is_some()
    }

    pub fn job_conf(&self) -> Option<&JobConfig> {
        self.conf.as_ref()
    }

    // Op addition

    /// Validate the op name and fill the placement from the job conf.
    pub fn check_and_complete_op_conf(&self, op: &OperatorConf) -> Result<OperatorConf> {
        let conf = self
            .conf
            .as_ref()
            .ok_or_else(|| self.job_conf_error("job conf must be set before adding ops"))?;
        if op.name.is_empty() || op.name.contains('/') {
            return Err(Error::InvalidOpConf {
                op: op.name.clone(),
                reason: "op name must be non-empty and must not contain '/'".into(),
            });
        }
        let mut completed = op.clone();
        let pc = completed
            .parallel_conf
            .get_or_insert_with(|| conf.default_parallel_conf.clone());
        pc.validate(&self.resource).map_err(|e| Error::Placement {
            op: op.name.clone(),
            reason: e.to_string(),
        })?;
        Ok(completed)
    }

    /// Dry-run inference of a consistent op; nothing is committed.
    pub fn infer_op_conf(&self, op: &OperatorConf) -> Result<OpAttribute> {
        let op = self.check_and_complete_op_conf(op)?;
        self.infer_consistent(&op)
    }

    pub fn add_and_infer_consistent_op(&mut self, op: &OperatorConf) -> Result<OpAttribute> {
        self.ensure_mutable()?;
        let op = self.check_and_complete_op_conf(op)?;
        let attr = self.infer_consistent(&op)?;
        self.commit(attr.clone());
        tracing::debug!(job = %self.job_name, op = %op.name, kind = op.type_name(), "consistent op added");
        Ok(attr)
    }

    pub fn add_and_infer_mirrored_op(&mut self, op: &OperatorConf) -> Result<OpAttribute> {
        self.ensure_mutable()?;
        let op = self.check_and_complete_op_conf(op)?;
        self.ensure_new_op(&op.name)?;
        let pc = op.parallel_conf.clone().unwrap_or_default();
        let parallel_num = pc.parallel_num()?;

        let mut input_lbis = Vec::new();
        let mut mirrored_inputs = Vec::new();
        for lbn in op.input_lbns() {
            let lbi = LogicalBlobId::parse(lbn)?;
            let input = self.mirrored_blob(lbn)?;
            if input.sub_lbis.len() != parallel_num {
                return Err(Error::Placement {
                    op: op.name.clone(),
                    reason: format!(
                        "input '{lbn}' has {} sub-blobs but the op is placed on {parallel_num} devices",
                        input.sub_lbis.len()
                    ),
                });
            }
            input_lbis.push(lbi);
            mirrored_inputs.push((lbn.to_string(), &input.sub_lbis));
        }

        let mut subs = Vec::with_capacity(parallel_num);
        for i in 0..parallel_num {
            let sub_name = mirrored_sub_op_name(&op.name, i);
            let mut sub = op.remapped(sub_name, |lbn| {
                mirrored_inputs
                    .iter()
                    .find(|(name, _)| name == lbn)
                    .map(|(_, lbis)| lbis[i].lbn())
                    .unwrap_or_else(|| lbn.to_string())
            });
            sub.parallel_conf = Some(pc.device_at(i)?);
            let mut attr = self.infer_consistent(&sub)?;
            for out in &mut attr.outputs {
                out.attr.disable_boxing = true;
            }
            subs.push(attr);
        }

        let first = subs
            .first()
            .and_then(|s| s.output(OUTPUT_BN))
            .cloned()
            .ok_or_else(|| Error::Placement {
                op: op.name.clone(),
                reason: "mirrored op has no devices".into(),
            })?;
        for sub in &subs[1..] {
            let Some(other) = sub.output(OUTPUT_BN) else {
                continue;
            };
            if other.desc.shape != first.desc.shape {
                return Err(Error::ShapeMismatch {
                    op: op.name.clone(),
                    expected: first.desc.shape.clone(),
                    got: other.desc.shape.clone(),
                });
            }
            if other.desc.data_type != first.desc.data_type {
                return Err(Error::DTypeMismatch {
                    op: op.name.clone(),
                    expected: first.desc.data_type,
                    got: other.desc.data_type,
                });
            }
        }

        let mut logical = first.clone();
        if let Some(axis) = first.batch_axis {
            let axis = axis as usize;
            let dim = first.desc.shape.dim(axis).unwrap_or(1);
            let logical_dim = dim.checked_mul(parallel_num).ok_or_else(|| Error::InvalidOpConf {
                op: op.name.clone(),
                reason: format!("batch dim {dim} overflows across {parallel_num} devices"),
            })?;
            logical.desc.shape = first.desc.shape.with_dim(axis, logical_dim);
            logical
                .desc
                .shape
                .checked_elem_count()
                .map_err(|e| Error::InvalidOpConf {
                    op: op.name.clone(),
                    reason: e.to_string(),
                })?;
        }
        logical.split_axis = first.batch_axis;
        logical.parallel_conf = pc;
        logical.disable_boxing = true;

        let lbi = op.output_lbi();
        let sub_lbis: Vec<LogicalBlobId> = subs
            .iter()
            .filter_map(|s| s.outputs.first().map(|o| o.lbi.clone()))
            .collect();
        for sub in subs {
            self.commit(sub);
        }
        self.mirrored.insert(
            lbi.lbn(),
            MirroredBlob {
                attr: logical.clone(),
                sub_lbis,
            },
        );
        let attr = OpAttribute {
            op_conf: op.clone(),
            input_lbis,
            outputs: vec![OutputAttr {
                bn: OUTPUT_BN.to_string(),
                lbi,
                attr: logical,
            }],
            is_mirrored: true,
        };
        self.op_attrs.insert(op.name.clone(), attr.clone());
        tracing::debug!(
            job = %self.job_name,
            op = %op.name,
            parallel_num,
            "mirrored op added"
        );
        Ok(attr)
    }

    fn ensure_new_op(&self, name: &str) -> Result<()> {
        if self.op_attrs.contains_key(name) {
            return Err(Error::OpNameExist {
                job: self.job_name.clone(),
                op: name.to_string(),
            });
        }
        Ok(())
    }

    fn infer_consistent(&self, op: &OperatorConf) -> Result<OpAttribute> {
        self.ensure_new_op(&op.name)?;
        let mut input_lbis = Vec::new();
        let mut inputs = Vec::new();
        for lbn in op.input_lbns() {
            input_lbis.push(LogicalBlobId::parse(lbn)?);
            inputs.push(self.blob_attr(lbn)?);
        }
        let pc = op.parallel_conf.clone().unwrap_or_default();
        let attr = infer_op(op, &pc, &inputs)?;
        Ok(OpAttribute {
            op_conf: op.clone(),
            input_lbis,
            outputs: vec![OutputAttr {
                bn: OUTPUT_BN.to_string(),
                lbi: op.output_lbi(),
                attr,
            }],
            is_mirrored: false,
        })
    }

    fn commit(&mut self, attr: OpAttribute) {
        for out in &attr.outputs {
            self.blobs.insert(out.lbi.lbn(), out.attr.clone());
        }
        self.ops.push(attr.op_conf.clone());
        self.op_attrs.insert(attr.op_conf.name.clone(), attr);
    }

    // Job-level marks

    pub fn add_loss_lbn(&mut self, lbn: &str) -> Result<()> {
        self.ensure_mutable()?;
        self.resolve_any(lbn)?;
        self.loss_lbns.push(lbn.to_string());
        Ok(())
    }

    pub fn add_lbi_and_diff_watcher_uuid_pair(
        &mut self,
        lbi: &LogicalBlobId,
        uuid: &str,
    ) -> Result<()> {
        self.ensure_mutable()?;
        if uuid.is_empty() {
            return Err(self.job_conf_error("diff watcher uuid must not be empty"));
        }
        self.resolve_any(&lbi.lbn())?;
        if self.diff_watchers.contains_key(uuid) {
            return Err(self.job_conf_error(format!(
                "diff watcher uuid '{uuid}' is already registered"
            )));
        }
        self.diff_watchers.insert(uuid.to_string(), lbi.clone());
        Ok(())
    }

    // Validation and completion

    pub fn check_job(&self) -> Result<()> {
        let violation = |reason: String| Error::Validation {
            job: self.job_name.clone(),
            reason,
        };
        if self.conf.is_none() {
            return Err(violation("job conf is not set".into()));
        }
        for op in &self.ops {
            if op.parallel_conf.is_none() {
                return Err(violation(format!("op '{}' has no placement", op.name)));
            }
            for lbn in op.input_lbns() {
                if !self.blobs.contains_key(lbn) {
                    return Err(violation(format!(
                        "op '{}' consumes unknown blob '{lbn}'",
                        op.name
                    )));
                }
            }
        }
        for (lbn, attr) in &self.blobs {
            let rank = attr.desc.shape.rank() as i64;
            for (what, axis) in [("batch", attr.batch_axis), ("split", attr.split_axis)] {
                if let Some(a) = axis {
                    if a < 0 || a >= rank {
                        return Err(violation(format!(
                            "{what} axis {a} of '{lbn}' is out of range for rank {rank}"
                        )));
                    }
                }
            }
        }
        for (lbn, blob) in &self.mirrored {
            let expected = blob.attr.parallel_conf.parallel_num()?;
            if blob.sub_lbis.len() != expected {
                return Err(violation(format!(
                    "mirrored blob '{lbn}' has {} sub-blobs, expected {expected}",
                    blob.sub_lbis.len()
                )));
            }
        }
        for lbn in &self.loss_lbns {
            if self.resolve_any(lbn).is_err() {
                return Err(violation(format!("loss blob '{lbn}' does not resolve")));
            }
        }
        for (uuid, lbi) in &self.diff_watchers {
            if self.resolve_any(&lbi.lbn()).is_err() {
                return Err(violation(format!(
                    "diff watcher '{uuid}' watches unknown blob '{lbi}'"
                )));
            }
        }
        Ok(())
    }

    /// Freeze the job. Lazy jobs are re-inferred as a whole first.
    pub fn complete(&mut self) -> Result<()> {
        self.ensure_mutable()?;
        self.check_job()?;
        if !self.eager {
            self.boxing_edges = self.reinfer_and_plan_boxing()?;
        }
        self.completed = true;
        tracing::info!(
            job = %self.job_name,
            ops = self.ops.len(),
            boxing_edges = self.boxing_edges.len(),
            eager = self.eager,
            "job completed"
        );
        Ok(())
    }

    fn reinfer_and_plan_boxing(&self) -> Result<Vec<BoxingEdge>> {
        let violation = |reason: String| Error::Validation {
            job: self.job_name.clone(),
            reason,
        };
        let mut fresh: HashMap<String, BlobAttr> = HashMap::new();
        let mut edges = Vec::new();
        for op in &self.ops {
            let pc = op.parallel_conf.clone().unwrap_or_default();
            let mut inputs = Vec::new();
            for lbn in op.input_lbns() {
                let producer = fresh.get(lbn).ok_or_else(|| {
                    violation(format!("op '{}' consumes '{lbn}' before it is produced", op.name))
                })?;
                if !producer.parallel_conf.same_placement(&pc) {
                    if producer.disable_boxing {
                        return Err(violation(format!(
                            "op '{}' needs boxing from '{lbn}', whose producer disables boxing",
                            op.name
                        )));
                    }
                    edges.push(BoxingEdge {
                        producer: LogicalBlobId::parse(lbn)?,
                        consumer_op: op.name.clone(),
                        from: producer.parallel_conf.clone(),
                        to: pc.clone(),
                    });
                }
                inputs.push(producer);
            }
            let mut attr = infer_op(op, &pc, &inputs)?;
            let lbn = op.output_lbi().lbn();
            if let Some(stored) = self.blobs.get(&lbn) {
                attr.disable_boxing = stored.disable_boxing;
                if &attr != stored {
                    return Err(violation(format!(
                        "re-inference of '{lbn}' disagrees with the attribute inferred at add time"
                    )));
                }
            }
            fresh.insert(lbn, attr);
        }
        Ok(edges)
    }

    // Queries

    /// Consistent attribute of `lbn`.
    pub fn blob_attr(&self, lbn: &str) -> Result<&BlobAttr> {
        if let Some(attr) = self.blobs.get(lbn) {
            return Ok(attr);
        }
        LogicalBlobId::parse(lbn)?;
        if self.mirrored.contains_key(lbn) {
            return Err(Error::IsMirrored {
                job: self.job_name.clone(),
                lbn: lbn.to_string(),
            });
        }
        Err(self.not_found(lbn))
    }

    pub fn mirrored_blob(&self, lbn: &str) -> Result<&MirroredBlob> {
        if let Some(blob) = self.mirrored.get(lbn) {
            return Ok(blob);
        }
        LogicalBlobId::parse(lbn)?;
        if self.blobs.contains_key(lbn) {
            return Err(Error::NotMirrored {
                job: self.job_name.clone(),
                lbn: lbn.to_string(),
            });
        }
        Err(self.not_found(lbn))
    }

    pub fn is_mirrored_blob(&self, lbn: &str) -> Result<bool> {
        self.resolve_any(lbn)?;
        Ok(self.mirrored.contains_key(lbn))
    }

    pub fn mirrored_sub_lbi(&self, lbn: &str, index: usize) -> Result<&LogicalBlobId> {
        let blob = self.mirrored_blob(lbn)?;
        blob.sub_lbis
            .get(index)
            .ok_or_else(|| Error::SubLbiOutOfRange {
                lbn: lbn.to_string(),
                index,
                num: blob.sub_lbis.len(),
            })
    }

    pub fn op_attribute(&self, op_name: &str) -> Result<&OpAttribute> {
        self.op_attrs.get(op_name).ok_or_else(|| Error::InvalidOpConf {
            op: op_name.to_string(),
            reason: format!("no such op in job '{}'", self.job_name),
        })
    }

    fn resolve_any(&self, lbn: &str) -> Result<&BlobAttr> {
        match self.mirrored.get(lbn) {
            Some(blob) => Ok(&blob.attr),
            None => self.blob_attr(lbn),
        }
    }

    fn not_found(&self, lbn: &str) -> Error {
        Error::BlobNotFound {
            job: self.job_name.clone(),
            lbn: lbn.to_string(),
        }
    }

    /// Interface ops of the job, in commit order.
    pub fn input_op_names(&self) -> impl Iterator<Item = &str> {
        self.ops_of_kind(|k| matches!(k, OpKind::Input { .. }))
    }

    pub fn return_op_names(&self) -> impl Iterator<Item = &str> {
        self.ops_of_kind(|k| matches!(k, OpKind::Return { .. }))
    }

    pub fn variable_op_names(&self) -> impl Iterator<Item = &str> {
        self.ops_of_kind(|k| matches!(k, OpKind::Variable { .. }))
    }

    fn ops_of_kind(&self, pred: impl Fn(&OpKind) -> bool) -> impl Iterator<Item = &str> {
        self.ops
            .iter()
            .filter(move |op| pred(&op.kind))
            .map(|op| op.name.as_str())
    }

    pub fn job(&self) -> Job {
        Job {
            conf: self
                .conf
                .clone()
                .unwrap_or_else(|| JobConfig::new(self.job_name.clone())),
            ops: self.ops.clone(),
            loss_lbns: self.loss_lbns.clone(),
        }
    }
}
