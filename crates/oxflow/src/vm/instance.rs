// Job instances handed to LaunchJob, and the completion handles that report
// back to the caller.

use std::sync::mpsc;

use crate::host_array::HostArray;
use crate::push::OfBlob;
use crate::{Error, Result};

/// One launch of a job. The worker calls `push_blob`/`pull_blob` as the job
/// plan requires, then `finish` exactly once.
pub trait JobInstance: Send {
    fn job_name(&self) -> &str;

    fn push_blob(&mut self, _blob: &mut OfBlob) -> Result<()> {
        Ok(())
    }

    fn pull_blob(&mut self, _blob: &OfBlob) -> Result<()> {
        Ok(())
    }

    fn finish(self: Box<Self>, result: Result<()>);
}

/// Receives the single result of an asynchronous operation.
#[derive(Debug)]
pub struct Completion<T> {
    rx: mpsc::Receiver<Result<T>>,
}

pub fn completion<T>() -> (mpsc::Sender<Result<T>>, Completion<T>) {
    let (tx, rx) = mpsc::channel();
    (tx, Completion { rx })
}

impl<T> Completion<T> {
    /// Block until the result arrives.
    pub fn wait(self) -> Result<T> {
        self.rx
            .recv()
            .map_err(|_| Error::Dispatch("job instance dropped before finishing".into()))?
    }

    pub fn try_wait(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => Some(Err(Error::Dispatch(
                "job instance dropped before finishing".into(),
            ))),
        }
    }
}

/// Launch of a user job; completes when the job has run.
pub struct UserJobInstance {
    job_name: String,
    done: mpsc::Sender<Result<()>>,
}

impl UserJobInstance {
    pub fn new(job_name: impl Into<String>) -> (Self, Completion<()>) {
        let (done, handle) = completion();
        let instance = Self {
            job_name: job_name.into(),
            done,
        };
        (instance, handle)
    }
}

impl JobInstance for UserJobInstance {
    fn job_name(&self) -> &str {
        &self.job_name
    }

    fn finish(self: Box<Self>, result: Result<()>) {
        let _ = self.done.send(result);
    }
}

/// Launch of a pull job; completes with the arrays held by the output blob.
pub struct PullJobInstance {
    job_name: String,
    pulled: Option<Vec<HostArray>>,
    done: mpsc::Sender<Result<Vec<HostArray>>>,
}

impl PullJobInstance {
    pub fn new(job_name: impl Into<String>) -> (Self, Completion<Vec<HostArray>>) {
        let (done, handle) = completion();
        let instance = Self {
            job_name: job_name.into(),
            pulled: None,
            done,
        };
        (instance, handle)
    }
}

impl JobInstance for PullJobInstance {
    fn job_name(&self) -> &str {
        &self.job_name
    }

    fn pull_blob(&mut self, blob: &OfBlob) -> Result<()> {
        self.pulled = Some(blob.to_host_arrays()?);
        Ok(())
    }

    fn finish(self: Box<Self>, result: Result<()>) {
        let Self {
            job_name,
            pulled,
            done,
        } = *self;
        let outcome = result.and_then(|()| {
            pulled.ok_or_else(|| Error::Dispatch(format!("pull '{job_name}' received no blob")))
        });
        let _ = done.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dropped_instance_reports_error() {
        let (instance, handle) = UserJobInstance::new("j1");
        drop(instance);
        assert!(matches!(handle.wait(), Err(Error::Dispatch(_))));
    }

    #[test]
    fn test_pull_without_blob_fails() {
        let (instance, handle) = PullJobInstance::new("System-Pull-ret");
        Box::new(instance).finish(Ok(()));
        assert!(handle.wait().is_err());
    }
}
