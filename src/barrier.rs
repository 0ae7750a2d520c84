use crate::error::{LaunchError, Result};
use nix::{
    sys::{
        signal::{Signal, kill, raise},
        wait::{WaitPidFlag, WaitStatus, waitpid},
    },
    unistd::Pid,
};
use tracing::debug;

/// Two-process rendezvous built on job-control signals.
///
/// The helper side stops itself with `SIGSTOP`. The coordinator waits until the stop is
/// observable, does whatever must happen first, then resumes the helper with `SIGCONT` and reaps
/// it. Nothing the helper does after [`StopBarrier::park`] can run before the coordinator calls
/// [`StopBarrier::release_and_reap`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StopBarrier;

impl StopBarrier {
    /// Helper side: stop until resumed.
    pub fn park() -> Result<()> {
        raise(Signal::SIGSTOP).map_err(LaunchError::resource("raise(SIGSTOP)"))
    }

    /// Coordinator side: block until `pid` has stopped.
    pub fn await_parked(pid: Pid) -> Result<()> {
        match waitpid(pid, Some(WaitPidFlag::WUNTRACED)) {
            Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => {
                debug!(%pid, "helper parked");
                Ok(())
            }
            Ok(status) => Err(LaunchError::Helper(format!(
                "{pid} did not stop: {status:?}"
            ))),
            Err(errno) => Err(LaunchError::resource("waitpid")(errno)),
        }
    }

    /// Coordinator side: resume `pid` and require a clean exit.
    pub fn release_and_reap(pid: Pid) -> Result<()> {
        kill(pid, Signal::SIGCONT).map_err(LaunchError::resource("kill(SIGCONT)"))?;

        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, 0)) => {
                debug!(%pid, "helper finished");
                Ok(())
            }
            Ok(WaitStatus::Exited(_, code)) => {
                Err(LaunchError::Helper(format!("{pid} exited with status {code}")))
            }
            Ok(status) => Err(LaunchError::Helper(format!(
                "{pid} did not exit cleanly: {status:?}"
            ))),
            Err(errno) => Err(LaunchError::resource("waitpid")(errno)),
        }
    }
}
