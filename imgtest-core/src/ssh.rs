//! OpenSSH-backed machines.
//!
//! Shells out to the system `ssh` binary; keys and agents must be set up
//! beforehand. A connection is an OpenSSH control master on a private
//! socket, and every session is one `ssh` process multiplexed over it.

use crate::config::{MachineConfig, SshConfig};
use crate::platform::{CombinedOutput, Machine, PlatformError, SshClient, SshSession};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Exit code `ssh` uses for its own (connection) errors. Remote commands
/// may exit with it too.
const SSH_TRANSPORT_EXIT: i32 = 255;

/// A machine reached through the system `ssh` binary.
#[derive(Debug, Clone)]
pub struct SshMachine {
    name: String,
    host: String,
    user: String,
    port: u16,
    options: SshConfig,
}

impl SshMachine {
    /// Create a machine from its configuration.
    pub fn new(machine: &MachineConfig, options: &SshConfig) -> Self {
        Self {
            name: machine.name.clone(),
            host: machine.host.clone(),
            user: machine.user.clone(),
            port: machine.port,
            options: options.clone(),
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// `ssh` with the options shared by every invocation.
    fn command(&self, control: &Path) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.options.connect_timeout_secs))
            .arg("-o")
            .arg(if self.options.strict_host_key_checking {
                "StrictHostKeyChecking=yes"
            } else {
                "StrictHostKeyChecking=no"
            });
        for option in &self.options.extra_options {
            cmd.arg("-o").arg(option);
        }
        cmd.arg("-p")
            .arg(self.port.to_string())
            .arg("-S")
            .arg(control);
        cmd
    }
}

impl Machine for SshMachine {
    fn id(&self) -> &str {
        &self.name
    }

    fn ssh_client(&self) -> Result<Box<dyn SshClient + '_>, PlatformError> {
        let base = std::env::temp_dir().join(format!(
            "imgtest-ssh-{}",
            uuid::Uuid::new_v4().simple()
        ));
        let socket = base.with_extension("sock");
        let log = base.with_extension("log");

        // the backgrounded master keeps inherited pipes open, so its
        // diagnostics go to a log file instead
        let status = self
            .command(&socket)
            .args(["-M", "-N", "-f", "-o", "ControlPersist=yes", "-E"])
            .arg(&log)
            .arg(self.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| PlatformError::Connect {
                machine: self.name.clone(),
                reason: format!("spawning ssh: {e}"),
            })?;

        if !status.success() {
            let reason = std::fs::read_to_string(&log)
                .map(|s| s.trim().to_string())
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| status.to_string());
            let _ = std::fs::remove_file(&log);
            return Err(PlatformError::Connect {
                machine: self.name.clone(),
                reason,
            });
        }

        tracing::debug!("connected to {} ({})", self.name, self.destination());
        Ok(Box::new(SshConnection {
            machine: self,
            socket,
            log,
        }))
    }
}

/// Control master connection. Dropping it stops the master.
struct SshConnection<'m> {
    machine: &'m SshMachine,
    socket: PathBuf,
    log: PathBuf,
}

impl SshClient for SshConnection<'_> {
    fn new_session(&self) -> Result<Box<dyn SshSession + '_>, PlatformError> {
        if !self.socket.exists() {
            return Err(PlatformError::Session {
                machine: self.machine.name.clone(),
                reason: format!("control socket {} is gone", self.socket.display()),
            });
        }
        Ok(Box::new(ProcessSession { connection: self }))
    }
}

impl Drop for SshConnection<'_> {
    fn drop(&mut self) {
        let result = self
            .machine
            .command(&self.socket)
            .args(["-O", "exit"])
            .arg(self.machine.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match result {
            Ok(status) if status.success() => {
                tracing::debug!("disconnected from {}", self.machine.name)
            }
            Ok(status) => tracing::warn!(
                "closing ssh connection to {}: {}",
                self.machine.name,
                status
            ),
            Err(e) => tracing::warn!(
                "closing ssh connection to {}: {}",
                self.machine.name,
                e
            ),
        }
        let _ = std::fs::remove_file(&self.log);
    }
}

struct ProcessSession<'c> {
    connection: &'c SshConnection<'c>,
}

impl ProcessSession<'_> {
    fn machine(&self) -> &SshMachine {
        self.connection.machine
    }

    fn remote(&self, command: &str) -> Command {
        let machine = self.machine();
        let mut cmd = machine.command(&self.connection.socket);
        cmd.arg(machine.destination()).arg(command);
        cmd
    }

    fn transport(&self, source: io::Error) -> PlatformError {
        PlatformError::Transport {
            machine: self.machine().name.clone(),
            source,
        }
    }

    /// `ssh` exits 255 both for its own failures and when the remote command
    /// does. Only a 255 with a complaint from `ssh` on stderr counts as a
    /// transport error; a silent 255 is the remote command's exit status.
    fn exit_error(&self, status: std::process::ExitStatus, stderr: &[u8]) -> PlatformError {
        let machine = self.machine().name.clone();
        let detail = String::from_utf8_lossy(stderr).trim().to_string();
        if status.code() == Some(SSH_TRANSPORT_EXIT) && !detail.is_empty() {
            return PlatformError::Transport {
                machine,
                source: io::Error::new(io::ErrorKind::ConnectionAborted, detail),
            };
        }
        PlatformError::Exit {
            machine,
            status: status.to_string(),
        }
    }
}

impl SshSession for ProcessSession<'_> {
    fn combined_output(&mut self, command: &str) -> CombinedOutput {
        // merge remote stderr into stdout so ordering is preserved
        let output = match self
            .remote(&format!("exec 2>&1; {command}"))
            .stdin(Stdio::null())
            .output()
        {
            Ok(output) => output,
            Err(e) => {
                return CombinedOutput {
                    bytes: Vec::new(),
                    status: Err(self.transport(e)),
                }
            }
        };

        // whatever is left on stderr came from ssh itself
        let mut bytes = output.stdout;
        bytes.extend_from_slice(&output.stderr);
        let status = if output.status.success() {
            Ok(())
        } else {
            Err(self.exit_error(output.status, &output.stderr))
        };
        CombinedOutput { bytes, status }
    }

    fn run_with_stdin(
        &mut self,
        command: &str,
        stdin: &mut dyn Read,
    ) -> Result<(), PlatformError> {
        let mut child = self
            .remote(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.transport(e))?;

        if let Some(mut pipe) = child.stdin.take() {
            if let Err(e) = io::copy(stdin, &mut pipe) {
                drop(pipe);
                let _ = child.wait();
                return Err(self.transport(e));
            }
        }

        let output = child.wait_with_output().map_err(|e| self.transport(e))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(self.exit_error(output.status, &output.stderr))
        }
    }
}
