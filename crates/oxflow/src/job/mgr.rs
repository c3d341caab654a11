// JobBuildAndInferCtxMgr - registry of job contexts, one open at a time
//
//   open(name)   creates a context (or resumes an unfinished one) and makes
//                it current
//   close()      clears "current"; the context stays queryable by name
//   job_set()    the completed jobs, in the order they were first opened

use std::collections::HashMap;

use oxflow_core::{JobSet, Resource};

use super::ctx::JobBuildAndInferCtx;
use crate::{Error, Result};

#[derive(Debug, Default)]
pub struct JobBuildAndInferCtxMgr {
    contexts: HashMap<String, JobBuildAndInferCtx>,
    order: Vec<String>,
    current: Option<String>,
}

impl JobBuildAndInferCtxMgr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, job_name: &str, resource: &Resource, eager: bool) -> Result<()> {
        if job_name.is_empty() {
            return Err(Error::JobConf {
                job: String::new(),
                reason: "job name must not be empty".into(),
            });
        }
        if let Some(current) = &self.current {
            if current == job_name {
                return Err(Error::JobNameExist(job_name.to_string()));
            }
            return Err(Error::JobStillOpen {
                current: current.clone(),
                requested: job_name.to_string(),
            });
        }
        match self.contexts.get(job_name) {
            Some(ctx) if ctx.is_completed() => {
                return Err(Error::JobCompleted(job_name.to_string()));
            }
            Some(_) => tracing::debug!(job = job_name, "resuming job"),
            None => {
                self.contexts.insert(
                    job_name.to_string(),
                    JobBuildAndInferCtx::new(job_name, *resource, eager),
                );
                self.order.push(job_name.to_string());
                tracing::debug!(job = job_name, eager, "job opened");
            }
        }
        self.current = Some(job_name.to_string());
        Ok(())
    }

    pub fn current_job_name(&self) -> Result<&str> {
        self.current.as_deref().ok_or(Error::NoOpenJob)
    }

    pub fn has_open_job(&self) -> bool {
        self.current.is_some()
    }

    pub fn close(&mut self) -> Result<String> {
        let name = self.current.take().ok_or(Error::NoOpenJob)?;
        tracing::debug!(job = %name, "job closed");
        Ok(name)
    }

    pub fn ctx(&self, job_name: &str) -> Result<&JobBuildAndInferCtx> {
        self.contexts
            .get(job_name)
            .ok_or_else(|| Error::JobNotFound(job_name.to_string()))
    }

    pub fn ctx_mut(&mut self, job_name: &str) -> Result<&mut JobBuildAndInferCtx> {
        self.contexts
            .get_mut(job_name)
            .ok_or_else(|| Error::JobNotFound(job_name.to_string()))
    }

    pub fn current_ctx(&self) -> Result<&JobBuildAndInferCtx> {
        let name = self.current_job_name()?;
        self.ctx(name)
    }

    pub fn current_ctx_mut(&mut self) -> Result<&mut JobBuildAndInferCtx> {
        let name = self.current.as_deref().ok_or(Error::NoOpenJob)?;
        self.contexts
            .get_mut(name)
            .ok_or_else(|| Error::JobNotFound(name.to_string()))
    }

    /// Contexts in the order they were opened.
    pub fn contexts(&self) -> impl Iterator<Item = &JobBuildAndInferCtx> {
        self.order.iter().filter_map(|name| self.contexts.get(name))
    }

    pub fn job_set(&self) -> JobSet {
        JobSet {
            jobs: self
                .contexts()
                .filter(|ctx| ctx.is_completed())
                .map(|ctx| ctx.job())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxflow_core::JobConfig;

    fn open(mgr: &mut JobBuildAndInferCtxMgr, name: &str) -> Result<()> {
        mgr.open(name, &Resource::default(), false)
    }

    #[test]
    fn test_one_open_job_at_a_time() {
        let mut mgr = JobBuildAndInferCtxMgr::new();
        assert!(matches!(mgr.current_job_name(), Err(Error::NoOpenJob)));
        open(&mut mgr, "j1").unwrap();
        assert!(matches!(open(&mut mgr, "j1"), Err(Error::JobNameExist(_))));
        assert!(matches!(
            open(&mut mgr, "j2"),
            Err(Error::JobStillOpen { .. })
        ));
        assert_eq!(mgr.close().unwrap(), "j1");
        assert!(matches!(mgr.close(), Err(Error::NoOpenJob)));
        open(&mut mgr, "j2").unwrap();
        assert_eq!(mgr.current_job_name().unwrap(), "j2");
    }

    #[test]
    fn test_completed_job_cannot_reopen() {
        let mut mgr = JobBuildAndInferCtxMgr::new();
        open(&mut mgr, "j1").unwrap();
        let ctx = mgr.current_ctx_mut().unwrap();
        ctx.set_job_conf(JobConfig::new("j1")).unwrap();
        ctx.complete().unwrap();
        mgr.close().unwrap();
        assert!(matches!(open(&mut mgr, "j1"), Err(Error::JobCompleted(_))));
        assert_eq!(mgr.job_set().jobs.len(), 1);
        assert!(mgr.ctx("j1").unwrap().is_completed());
        assert!(matches!(mgr.ctx("nope"), Err(Error::JobNotFound(_))));
    }

    #[test]
    fn test_unfinished_job_resumes() {
        let mut mgr = JobBuildAndInferCtxMgr::new();
        open(&mut mgr, "j1").unwrap();
        mgr.current_ctx_mut()
            .unwrap()
            .set_job_conf(JobConfig::new("j1"))
            .unwrap();
        mgr.close().unwrap();
        open(&mut mgr, "j1").unwrap();
        assert!(mgr.current_ctx().unwrap().has_job_conf());
        assert!(mgr.job_set().jobs.is_empty());
    }
}
