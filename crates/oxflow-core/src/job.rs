// Job schema
//
//   JobConfig         - per-job settings attached by SetJobConf
//   Job               - a completed job: its config, ops and loss targets
//   JobSet            - every completed job of a session (GetJobSet)
//   InterUserJobInfo  - names of the system push/pull/model jobs that the
//                       caller uses to feed and fetch a launched user job

use std::collections::BTreeMap;

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::op_conf::OperatorConf;
use crate::placement::ParallelConf;
use crate::text_format::{TextMessage, TextNode};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum JobKind {
    Train,
    #[default]
    Predict,
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::Train => "train",
            JobKind::Predict => "predict",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "train" => Ok(JobKind::Train),
            "predict" => Ok(JobKind::Predict),
            other => Err(Error::schema("kind", format!("unknown job kind '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    pub job_name: String,
    pub kind: JobKind,
    pub default_data_type: DType,
    /// Placement for ops that do not name one.
    pub default_parallel_conf: ParallelConf,
    pub batch_size_hint: Option<i64>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            job_name: String::new(),
            kind: JobKind::Predict,
            default_data_type: DType::F32,
            default_parallel_conf: ParallelConf::default(),
            batch_size_hint: None,
        }
    }
}

impl JobConfig {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: JobKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_default_data_type(mut self, dtype: DType) -> Self {
        self.default_data_type = dtype;
        self
    }

    pub fn with_default_parallel_conf(mut self, parallel_conf: ParallelConf) -> Self {
        self.default_parallel_conf = parallel_conf;
        self
    }

    pub fn with_batch_size_hint(mut self, batch_size: i64) -> Self {
        self.batch_size_hint = Some(batch_size);
        self
    }
}

impl TextMessage for JobConfig {
    fn to_node(&self) -> TextNode {
        let mut node = TextNode::new();
        node.str("job_name", &self.job_name)
            .ident("kind", self.kind.name())
            .ident("default_data_type", self.default_data_type.name())
            .message("default_parallel_conf", self.default_parallel_conf.to_node())
            .set_opt_int("batch_size_hint", self.batch_size_hint);
        node
    }

    fn from_node(node: &TextNode) -> Result<Self> {
        let d = JobConfig::default();
        Ok(Self {
            job_name: node.str_or("job_name", "")?,
            kind: match node.get_ident("kind")? {
                Some(k) => JobKind::from_name(k)?,
                None => d.kind,
            },
            default_data_type: match node.get_ident("default_data_type")? {
                Some(name) => DType::from_name(name)?,
                None => d.default_data_type,
            },
            default_parallel_conf: match node.get_message("default_parallel_conf")? {
                Some(pc) => ParallelConf::from_node(pc)?,
                None => d.default_parallel_conf,
            },
            batch_size_hint: node.opt_int("batch_size_hint")?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Job {
    pub conf: JobConfig,
    pub ops: Vec<OperatorConf>,
    pub loss_lbns: Vec<String>,
}

impl TextMessage for Job {
    fn to_node(&self) -> TextNode {
        let mut node = TextNode::new();
        node.message("job_conf", self.conf.to_node());
        for op in &self.ops {
            node.message("op", op.to_node());
        }
        for lbn in &self.loss_lbns {
            node.str("loss_lbn", lbn);
        }
        node
    }

    fn from_node(node: &TextNode) -> Result<Self> {
        Ok(Self {
            conf: JobConfig::from_node(node.req_message("job_conf")?)?,
            ops: node
                .messages("op")?
                .into_iter()
                .map(OperatorConf::from_node)
                .collect::<Result<Vec<_>>>()?,
            loss_lbns: node.strs("loss_lbn")?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobSet {
    pub jobs: Vec<Job>,
}

impl TextMessage for JobSet {
    fn to_node(&self) -> TextNode {
        let mut node = TextNode::new();
        for job in &self.jobs {
            node.message("job", job.to_node());
        }
        node
    }

    fn from_node(node: &TextNode) -> Result<Self> {
        Ok(Self {
            jobs: node
                .messages("job")?
                .into_iter()
                .map(Job::from_node)
                .collect::<Result<Vec<_>>>()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterUserJobInfo {
    pub input_or_var_op_name2push_job_name: BTreeMap<String, String>,
    pub output_or_var_op_name2pull_job_name: BTreeMap<String, String>,
    pub global_model_init_job_name: String,
    pub global_model_save_job_name: String,
}

fn write_map(node: &mut TextNode, field: &str, map: &BTreeMap<String, String>) {
    for (k, v) in map {
        let mut entry = TextNode::new();
        entry.str("key", k).str("value", v);
        node.message(field, entry);
    }
}

fn read_map(node: &TextNode, field: &str) -> Result<BTreeMap<String, String>> {
    node.messages(field)?
        .into_iter()
        .map(|e| Ok((e.req_str("key")?, e.req_str("value")?)))
        .collect()
}

impl TextMessage for InterUserJobInfo {
    fn to_node(&self) -> TextNode {
        let mut node = TextNode::new();
        write_map(
            &mut node,
            "input_or_var_op_name2push_job_name",
            &self.input_or_var_op_name2push_job_name,
        );
        write_map(
            &mut node,
            "output_or_var_op_name2pull_job_name",
            &self.output_or_var_op_name2pull_job_name,
        );
        node.str("global_model_init_job_name", &self.global_model_init_job_name)
            .str("global_model_save_job_name", &self.global_model_save_job_name);
        node
    }

    fn from_node(node: &TextNode) -> Result<Self> {
        Ok(Self {
            input_or_var_op_name2push_job_name: read_map(
                node,
                "input_or_var_op_name2push_job_name",
            )?,
            output_or_var_op_name2pull_job_name: read_map(
                node,
                "output_or_var_op_name2pull_job_name",
            )?,
            global_model_init_job_name: node.str_or("global_model_init_job_name", "")?,
            global_model_save_job_name: node.str_or("global_model_save_job_name", "")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op_conf::OpKind;

    #[test]
    fn test_job_conf_defaults_from_empty_text() {
        let conf = JobConfig::from_text("job_name: \"j1\"").unwrap();
        assert_eq!(conf.kind, JobKind::Predict);
        assert_eq!(conf.default_data_type, DType::F32);
        assert_eq!(conf.batch_size_hint, None);
    }

    #[test]
    fn test_job_set_text() {
        let job = Job {
            conf: JobConfig::new("train_job")
                .with_kind(JobKind::Train)
                .with_batch_size_hint(32),
            ops: vec![OperatorConf::new(
                "ret",
                OpKind::Return {
                    input: "x/out".into(),
                },
            )],
            loss_lbns: vec!["x/out".into()],
        };
        let set = JobSet { jobs: vec![job] };
        assert_eq!(JobSet::from_text(&set.to_text()).unwrap(), set);
    }

    #[test]
    fn test_inter_user_job_info_text() {
        let mut info = InterUserJobInfo {
            global_model_init_job_name: "System-ModelInit".into(),
            global_model_save_job_name: "System-ModelSave".into(),
            ..Default::default()
        };
        info.input_or_var_op_name2push_job_name
            .insert("x".into(), "System-Push-x".into());
        assert_eq!(InterUserJobInfo::from_text(&info.to_text()).unwrap(), info);
    }
}
