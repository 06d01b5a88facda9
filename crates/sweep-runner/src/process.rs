//! Child processes with exactly one release path: every `ManagedChild` is
//! either reaped explicitly or killed and reaped on drop.

use anyhow::{Context, Result};
use std::process::{Child, Command, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How a graceful stop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process had already exited before the stop request.
    AlreadyExited,
    /// The process exited within the grace period after SIGTERM.
    Graceful,
    /// The grace period ran out and the process was killed.
    Killed,
}

pub struct ManagedChild {
    label: &'static str,
    pid: u32,
    child: Option<Child>,
}

impl ManagedChild {
    pub fn spawn(label: &'static str, cmd: &mut Command) -> Result<Self> {
        let child = cmd
            .spawn()
            .with_context(|| format!("failed to start {} ({:?})", label, cmd.get_program()))?;
        let pid = child.id();
        debug!(label, pid, "process started");
        Ok(Self {
            label,
            pid,
            child: Some(child),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Polls until the process exits or `timeout` elapses. `None` means the
    /// deadline passed and the process is still running.
    pub fn wait_with_deadline(
        &mut self,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            let Some(child) = self.child.as_mut() else {
                return Ok(None);
            };
            if let Some(status) = child
                .try_wait()
                .with_context(|| format!("waiting for {}", self.label))?
            {
                self.child = None;
                return Ok(Some(status));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(poll.min(deadline - now));
        }
    }

    /// Kills immediately and reaps.
    pub fn kill(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            child
                .wait()
                .with_context(|| format!("reaping {}", self.label))?;
            debug!(label = self.label, pid = self.pid, "process killed");
        }
        Ok(())
    }

    /// SIGTERM, bounded wait, then SIGKILL. The process is reaped on every
    /// branch.
    pub fn terminate(&mut self, grace: Duration, poll: Duration) -> Result<Termination> {
        let Some(child) = self.child.as_mut() else {
            return Ok(Termination::AlreadyExited);
        };
        if child
            .try_wait()
            .with_context(|| format!("checking {}", self.label))?
            .is_some()
        {
            self.child = None;
            return Ok(Termination::AlreadyExited);
        }

        send_sigterm(self.pid);
        if self.wait_with_deadline(grace, poll)?.is_some() {
            debug!(label = self.label, pid = self.pid, "process stopped after SIGTERM");
            return Ok(Termination::Graceful);
        }
        warn!(
            label = self.label,
            pid = self.pid,
            grace_ms = grace.as_millis() as u64,
            "process ignored SIGTERM, killing"
        );
        self.kill()?;
        Ok(Termination::Killed)
    }
}

impl Drop for ManagedChild {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        debug!(pid, error = %std::io::Error::last_os_error(), "SIGTERM not delivered");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}
