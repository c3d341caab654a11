// Session - state owned by one global session
//
// Holds the effective resource, the eager toggle, the mirrored-strategy stack
// consulted by the blob-def front end, the job registry, and (once started)
// the push/pull job mapping handed to callers.

use oxflow_core::{InterUserJobInfo, Resource, SessionConfig};

use crate::job::JobBuildAndInferCtxMgr;
use crate::{bail, Error, Result};

#[derive(Debug)]
pub struct Session {
    pub config: SessionConfig,
    pub resource: Resource,
    pub(crate) eager: Option<bool>,
    mirrored_strategy: Vec<bool>,
    pub(crate) jobs: JobBuildAndInferCtxMgr,
    pub(crate) inter_user_job_info: Option<InterUserJobInfo>,
}

impl Session {
    /// `env_resource` bounds what the session may ask for.
    pub fn new(config: SessionConfig, env_resource: &Resource) -> Result<Self> {
        let resource = config.resource.unwrap_or(*env_resource);
        if !resource.fits_in(env_resource) {
            return Err(Error::InvalidPlacement(format!(
                "session resource {resource:?} exceeds environment resource {env_resource:?}"
            )));
        }
        Ok(Self {
            eager: config.enable_eager_execution,
            config,
            resource,
            mirrored_strategy: Vec::new(),
            jobs: JobBuildAndInferCtxMgr::new(),
            inter_user_job_info: None,
        })
    }

    pub fn push_mirrored_strategy_enabled(&mut self, enabled: bool) {
        self.mirrored_strategy.push(enabled);
    }

    pub fn pop_mirrored_strategy_enabled(&mut self) -> Result<bool> {
        match self.mirrored_strategy.pop() {
            Some(enabled) => Ok(enabled),
            None => bail!("mirrored strategy stack is empty"),
        }
    }

    /// Top of the strategy stack; consistent when the stack is empty.
    pub fn is_mirrored_strategy_enabled(&self) -> bool {
        self.mirrored_strategy.last().copied().unwrap_or(false)
    }

    pub fn is_consistent_strategy_enabled(&self) -> bool {
        !self.is_mirrored_strategy_enabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_stack() {
        let mut s = Session::new(SessionConfig::default(), &Resource::default()).unwrap();
        assert!(s.is_consistent_strategy_enabled());
        s.push_mirrored_strategy_enabled(true);
        s.push_mirrored_strategy_enabled(false);
        assert!(!s.is_mirrored_strategy_enabled());
        assert!(!s.pop_mirrored_strategy_enabled().unwrap());
        assert!(s.is_mirrored_strategy_enabled());
        s.pop_mirrored_strategy_enabled().unwrap();
        assert!(s.pop_mirrored_strategy_enabled().is_err());
    }

    #[test]
    fn test_resource_bounded_by_env() {
        let env = Resource::default();
        let too_big = SessionConfig::default().with_resource(Resource {
            machine_num: 1,
            gpu_device_num: 4,
            cpu_device_num: 1,
        });
        assert!(Session::new(too_big, &env).is_err());
    }
}
