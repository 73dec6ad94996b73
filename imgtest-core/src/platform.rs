//! Machine abstraction consumed by the dispatcher and the file distributor.
//!
//! A [`Machine`] opens an [`SshClient`] (a connection), which opens
//! [`SshSession`]s. Both are released by dropping them; a session borrows
//! its connection, so it is always released first.
//!
//! Machine lifetime itself (create, destroy) belongs to the platform
//! driver, not to this crate.

use std::io::Read;
use thiserror::Error;

/// Errors from machine operations.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// Could not open a connection to the machine.
    #[error("ssh connection to {machine}: {reason}")]
    Connect {
        /// Machine identifier.
        machine: String,
        /// Failure detail.
        reason: String,
    },

    /// Could not open a session on an open connection.
    #[error("ssh session on {machine}: {reason}")]
    Session {
        /// Machine identifier.
        machine: String,
        /// Failure detail.
        reason: String,
    },

    /// The remote command ran and exited unsuccessfully.
    #[error("command on {machine} failed: {status}")]
    Exit {
        /// Machine identifier.
        machine: String,
        /// Exit status description.
        status: String,
    },

    /// The command could not be carried over the connection.
    #[error("transport error on {machine}: {source}")]
    Transport {
        /// Machine identifier.
        machine: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Output of one remote command.
///
/// The bytes are kept even when the command failed, so callers can show
/// what the command printed before it died.
#[derive(Debug)]
pub struct CombinedOutput {
    /// Interleaved stdout and stderr.
    pub bytes: Vec<u8>,
    /// Whether the command ran and exited zero.
    pub status: Result<(), PlatformError>,
}

/// A machine that can be reached over SSH.
pub trait Machine: Send + Sync {
    /// Stable identifier used in logs and errors.
    fn id(&self) -> &str;

    /// Open a connection. Dropping the returned client closes it.
    fn ssh_client(&self) -> Result<Box<dyn SshClient + '_>, PlatformError>;
}

/// An open connection to a machine.
pub trait SshClient {
    /// Open a session. Dropping the returned session closes it.
    fn new_session(&self) -> Result<Box<dyn SshSession + '_>, PlatformError>;
}

/// One command execution context on a connection.
pub trait SshSession {
    /// Run `command` through the remote shell, capturing stdout and stderr
    /// as one stream.
    fn combined_output(&mut self, command: &str) -> CombinedOutput;

    /// Run `command` with `stdin` streamed to its standard input.
    fn run_with_stdin(&mut self, command: &str, stdin: &mut dyn Read)
        -> Result<(), PlatformError>;
}

/// Stream `source` into `name` (relative to the remote home directory) on
/// `machine`, with mode 0755.
pub fn install_file(
    source: &mut dyn Read,
    machine: &dyn Machine,
    name: &str,
) -> Result<(), PlatformError> {
    let client = machine.ssh_client()?;
    let mut session = client.new_session()?;
    let command = format!("install -m 0755 /dev/stdin {}", shell_words::quote(name));
    tracing::debug!("installing {} on {}", name, machine.id());
    session.run_with_stdin(&command, source)
}
