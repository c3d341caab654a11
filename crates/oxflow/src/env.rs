// Lifecycle - environment / session state machine
//
//   InitEnv               Uninitialized | EnvDestroyed     -> EnvInited
//   InitGlobalSession     EnvInited | SessionDestroyed     -> SessionInited
//   StartGlobalSession    SessionInited                    -> SessionStarted
//   StopGlobalSession     SessionStarted                   -> SessionStopped
//   DestroyGlobalSession  SessionInited | SessionStopped   -> SessionDestroyed
//   DestroyEnv            EnvInited | SessionDestroyed     -> EnvDestroyed
//
// A session that was initialised but never started may be destroyed
// directly. A destroyed session may be re-initialised inside the same
// environment, and a destroyed environment may be re-initialised. Every
// other call out of order fails with `Error::Lifecycle`.

use std::fmt;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Lifecycle {
    #[default]
    Uninitialized,
    EnvInited,
    SessionInited,
    SessionStarted,
    SessionStopped,
    SessionDestroyed,
    EnvDestroyed,
}

/// A guarded lifecycle call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    InitEnv,
    DestroyEnv,
    InitSession,
    StartSession,
    StopSession,
    DestroySession,
}

impl Transition {
    fn action(&self) -> &'static str {
        match self {
            Transition::InitEnv => "init env",
            Transition::DestroyEnv => "destroy env",
            Transition::InitSession => "init global session",
            Transition::StartSession => "start global session",
            Transition::StopSession => "stop global session",
            Transition::DestroySession => "destroy global session",
        }
    }
}

impl Lifecycle {
    pub fn name(&self) -> &'static str {
        match self {
            Lifecycle::Uninitialized => "uninitialized",
            Lifecycle::EnvInited => "env inited",
            Lifecycle::SessionInited => "session inited",
            Lifecycle::SessionStarted => "session started",
            Lifecycle::SessionStopped => "session stopped",
            Lifecycle::SessionDestroyed => "session destroyed",
            Lifecycle::EnvDestroyed => "env destroyed",
        }
    }

    pub fn is_env_inited(&self) -> bool {
        matches!(
            self,
            Lifecycle::EnvInited
                | Lifecycle::SessionInited
                | Lifecycle::SessionStarted
                | Lifecycle::SessionStopped
                | Lifecycle::SessionDestroyed
        )
    }

    pub fn is_session_inited(&self) -> bool {
        matches!(
            self,
            Lifecycle::SessionInited | Lifecycle::SessionStarted | Lifecycle::SessionStopped
        )
    }

    pub fn is_session_started(&self) -> bool {
        matches!(self, Lifecycle::SessionStarted)
    }

    /// The state after `t`, or a lifecycle error naming the current state.
    pub fn next(self, t: Transition) -> Result<Lifecycle> {
        use Lifecycle::*;
        let next = match (t, self) {
            (Transition::InitEnv, Uninitialized | EnvDestroyed) => EnvInited,
            (Transition::DestroyEnv, EnvInited | SessionDestroyed) => EnvDestroyed,
            (Transition::InitSession, EnvInited | SessionDestroyed) => SessionInited,
            (Transition::StartSession, SessionInited) => SessionStarted,
            (Transition::StopSession, SessionStarted) => SessionStopped,
            (Transition::DestroySession, SessionInited | SessionStopped) => SessionDestroyed,
            _ => return Err(self.reject(t.action())),
        };
        Ok(next)
    }

    pub(crate) fn reject(&self, action: &'static str) -> Error {
        Error::Lifecycle {
            action,
            state: self.name().to_string(),
        }
    }

    /// Fails unless a session is inited (started or not) and not yet stopped.
    pub(crate) fn require_building(&self, action: &'static str) -> Result<()> {
        match self {
            Lifecycle::SessionInited | Lifecycle::SessionStarted => Ok(()),
            _ => Err(self.reject(action)),
        }
    }

    pub(crate) fn require_session(&self, action: &'static str) -> Result<()> {
        if self.is_session_inited() {
            Ok(())
        } else {
            Err(self.reject(action))
        }
    }

    pub(crate) fn require_started(&self, action: &'static str) -> Result<()> {
        if self.is_session_started() {
            Ok(())
        } else {
            Err(self.reject(action))
        }
    }

    pub(crate) fn require_env(&self, action: &'static str) -> Result<()> {
        if self.is_env_inited() {
            Ok(())
        } else {
            Err(self.reject(action))
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_full_cycle() {
        let mut s = Lifecycle::default();
        for t in [
            Transition::InitEnv,
            Transition::InitSession,
            Transition::StartSession,
            Transition::StopSession,
            Transition::DestroySession,
            Transition::InitSession,
            Transition::DestroySession,
            Transition::DestroyEnv,
            Transition::InitEnv,
        ] {
            s = s.next(t).unwrap();
        }
        assert_eq!(s, Lifecycle::EnvInited);
    }

    #[rstest]
    #[case(Lifecycle::Uninitialized, Transition::InitSession)]
    #[case(Lifecycle::EnvInited, Transition::StartSession)]
    #[case(Lifecycle::EnvInited, Transition::InitEnv)]
    #[case(Lifecycle::SessionInited, Transition::InitSession)]
    #[case(Lifecycle::SessionInited, Transition::DestroyEnv)]
    #[case(Lifecycle::SessionStarted, Transition::DestroySession)]
    #[case(Lifecycle::SessionStarted, Transition::StartSession)]
    #[case(Lifecycle::SessionStopped, Transition::StartSession)]
    #[case(Lifecycle::EnvDestroyed, Transition::DestroyEnv)]
    fn test_out_of_order(#[case] state: Lifecycle, #[case] t: Transition) {
        assert!(matches!(state.next(t), Err(Error::Lifecycle { .. })));
    }
}
