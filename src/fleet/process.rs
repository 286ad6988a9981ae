//! A single supervised child process.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use strum::Display;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use super::roles::FleetRole;

#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub role: FleetRole,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    /// Build from a whitespace-separated command line.
    pub fn from_command(role: FleetRole, command: &str) -> Result<Self, ProcessError> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or(ProcessError::EmptyCommand(role))?;
        Ok(Self {
            role,
            program,
            args: parts.collect(),
            env: Vec::new(),
        })
    }

    pub fn with_env(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(vars);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ProcessState {
    Starting,
    Running,
    Stopping,
    Stopped,
    /// Exited without being asked to.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyExited,
    Graceful,
    Killed,
}

pub struct ManagedProcess {
    role: FleetRole,
    pid: u32,
    child: Child,
    state: ProcessState,
    exit: Option<ExitStatus>,
}

impl ManagedProcess {
    /// Spawn in a new process group with stdout and stderr relayed to the
    /// log under the role's label.
    pub fn spawn(spec: &ProcessSpec) -> Result<Self, ProcessError> {
        let role = spec.role;
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|source| ProcessError::Spawn { role, source })?;
        let pid = child.id().ok_or(ProcessError::NoPid(role))?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(relay_output(role, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(relay_output(role, stderr));
        }

        Ok(Self {
            role,
            pid,
            child,
            state: ProcessState::Starting,
            exit: None,
        })
    }

    pub fn role(&self) -> FleetRole {
        self.role
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    /// Refresh the state from the OS. A live process moves to `Running`;
    /// one that exited on its own becomes `Failed`.
    pub fn poll(&mut self) -> ProcessState {
        if matches!(self.state, ProcessState::Starting | ProcessState::Running) {
            match self.child.try_wait() {
                Ok(None) => self.state = ProcessState::Running,
                Ok(Some(status)) => {
                    self.exit = Some(status);
                    self.state = ProcessState::Failed;
                }
                Err(e) => {
                    tracing::warn!(process = self.role.label(), pid = self.pid, error = %e, "Liveness check failed");
                    self.state = ProcessState::Failed;
                }
            }
        }
        self.state
    }

    pub fn is_alive(&mut self) -> bool {
        match self.state {
            ProcessState::Starting | ProcessState::Running => {
                self.poll() == ProcessState::Running
            }
            ProcessState::Stopping => matches!(self.child.try_wait(), Ok(None)),
            ProcessState::Stopped | ProcessState::Failed => false,
        }
    }

    /// Ask the process to exit, escalating to a kill of its whole group
    /// when `grace` runs out, then make sure the pid is really gone.
    pub async fn terminate(
        &mut self,
        grace: Duration,
        kill_wait: Duration,
    ) -> Result<StopOutcome, ProcessError> {
        let role = self.role;
        if let Some(status) = self
            .child
            .try_wait()
            .map_err(|source| ProcessError::Wait { role, source })?
        {
            self.exit = Some(status);
            self.state = ProcessState::Stopped;
            return Ok(StopOutcome::AlreadyExited);
        }

        self.state = ProcessState::Stopping;
        tracing::info!(process = role.label(), pid = self.pid, "Stopping");
        self.request_exit()?;

        if self.reap_within(grace).await? {
            return Ok(StopOutcome::Graceful);
        }

        tracing::warn!(process = role.label(), pid = self.pid, "Did not stop in time, killing process group");
        self.kill_group()?;
        if self.reap_within(kill_wait).await? {
            return Ok(StopOutcome::Killed);
        }

        if signals::is_alive(self.pid) {
            tracing::warn!(process = role.label(), pid = self.pid, "Still alive after group kill, killing pid");
            let _ = self.child.start_kill();
            if self.reap_within(kill_wait).await? {
                return Ok(StopOutcome::Killed);
            }
            self.state = ProcessState::Failed;
            return Err(ProcessError::StillAlive {
                role,
                pid: self.pid,
            });
        }

        self.state = ProcessState::Stopped;
        Ok(StopOutcome::Killed)
    }

    async fn reap_within(&mut self, limit: Duration) -> Result<bool, ProcessError> {
        match tokio::time::timeout(limit, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exit = Some(status);
                self.state = ProcessState::Stopped;
                Ok(true)
            }
            Ok(Err(source)) => Err(ProcessError::Wait {
                role: self.role,
                source,
            }),
            Err(_) => Ok(false),
        }
    }

    #[cfg(unix)]
    fn request_exit(&mut self) -> Result<(), ProcessError> {
        signals::terminate(self.pid).map_err(|e| ProcessError::Signal {
            role: self.role,
            reason: e.to_string(),
        })
    }

    #[cfg(not(unix))]
    fn request_exit(&mut self) -> Result<(), ProcessError> {
        self.child.start_kill().map_err(|e| ProcessError::Signal {
            role: self.role,
            reason: e.to_string(),
        })
    }

    #[cfg(unix)]
    fn kill_group(&mut self) -> Result<(), ProcessError> {
        signals::kill_group(self.pid).map_err(|e| ProcessError::Signal {
            role: self.role,
            reason: e.to_string(),
        })
    }

    #[cfg(not(unix))]
    fn kill_group(&mut self) -> Result<(), ProcessError> {
        self.request_exit()
    }
}

async fn relay_output<R>(role: FleetRole, stream: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::info!(process = role.label(), "{}", line),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(process = role.label(), error = %e, "Output relay stopped");
                break;
            }
        }
    }
}

#[cfg(unix)]
mod signals {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    fn pid(raw: u32) -> Pid {
        Pid::from_raw(raw as i32)
    }

    /// SIGTERM to the process itself. A vanished pid is not an error.
    pub fn terminate(raw: u32) -> Result<(), Errno> {
        match kill(pid(raw), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// SIGKILL to the process group led by `raw`.
    pub fn kill_group(raw: u32) -> Result<(), Errno> {
        match killpg(pid(raw), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn is_alive(raw: u32) -> bool {
        !matches!(kill(pid(raw), None), Err(Errno::ESRCH))
    }
}

#[cfg(not(unix))]
mod signals {
    pub fn is_alive(_raw: u32) -> bool {
        false
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("No command configured for {0}")]
    EmptyCommand(FleetRole),

    #[error("Failed to spawn {role}: {source}")]
    Spawn {
        role: FleetRole,
        #[source]
        source: std::io::Error,
    },

    #[error("Spawned {0} has no pid")]
    NoPid(FleetRole),

    #[error("Failed to signal {role}: {reason}")]
    Signal { role: FleetRole, reason: String },

    #[error("Failed waiting on {role}: {source}")]
    Wait {
        role: FleetRole,
        #[source]
        source: std::io::Error,
    },

    #[error("{role} (pid {pid}) is still running after kill")]
    StillAlive { role: FleetRole, pid: u32 },
}
