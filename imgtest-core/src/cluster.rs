//! Cluster view handed to tests: dispatch native payloads and drop files.
//!
//! [`Cluster`] is the platform-independent part of a set of machines.
//! [`TestCluster`] composes a test node, a cluster and the list of native
//! functions; it is rebuilt for every subtest and never persisted.

use crate::harness::TestNode;
use crate::platform::{install_file, Machine, PlatformError};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Payload invoked on machines unless configured otherwise.
pub const DEFAULT_PAYLOAD: &str = "./imgtest-agent";

/// Errors from distributing a file to a cluster.
#[derive(Debug, Error)]
pub enum DropError {
    /// The local file could not be opened.
    #[error("opening {path}: {source}")]
    Open {
        /// Local path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The local path has no file name to use remotely.
    #[error("{0} has no file name")]
    NoFileName(PathBuf),

    /// The shared handle could not be rewound.
    #[error("rewinding local file: {0}")]
    Rewind(#[source] std::io::Error),

    /// Transmission to a machine failed.
    #[error("installing on {machine}: {source}")]
    Install {
        /// Machine identifier.
        machine: String,
        /// Underlying platform error.
        source: PlatformError,
    },
}

/// A named, ordered set of machines.
#[derive(Clone)]
pub struct Cluster {
    name: String,
    machines: Vec<Arc<dyn Machine>>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.machines.iter().map(|m| m.id()).collect();
        f.debug_struct("Cluster")
            .field("name", &self.name)
            .field("machines", &ids)
            .finish()
    }
}

impl Cluster {
    /// Create a cluster from already-running machines.
    pub fn new(name: &str, machines: Vec<Arc<dyn Machine>>) -> Self {
        Self {
            name: name.to_string(),
            machines,
        }
    }

    /// Cluster identity.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Machines, in the order they were given.
    pub fn machines(&self) -> &[Arc<dyn Machine>] {
        &self.machines
    }

    /// Copy the file at `local` to the home directory of every machine,
    /// under its base name.
    pub fn drop_file(&self, local: &Path) -> Result<(), DropError> {
        let name = local
            .file_name()
            .ok_or_else(|| DropError::NoFileName(local.to_path_buf()))?
            .to_string_lossy()
            .into_owned();
        let mut file = File::open(local).map_err(|source| DropError::Open {
            path: local.to_path_buf(),
            source,
        })?;
        self.distribute(&mut file, &name)
    }

    /// Stream `source` to `remote_name` on every machine, one after
    /// another, rewinding before each transmission.
    ///
    /// Stops at the first failure; machines after it receive nothing.
    pub fn distribute<R: Read + Seek>(
        &self,
        source: &mut R,
        remote_name: &str,
    ) -> Result<(), DropError> {
        for machine in &self.machines {
            source.seek(SeekFrom::Start(0)).map_err(DropError::Rewind)?;
            install_file(source, machine.as_ref(), remote_name).map_err(|source| {
                DropError::Install {
                    machine: machine.id().to_string(),
                    source,
                }
            })?;
            tracing::debug!("dropped {} on {}", remote_name, machine.id());
        }
        tracing::info!(
            "dropped {} on {} machine(s)",
            remote_name,
            self.machines.len()
        );
        Ok(())
    }
}

/// What a test sees: its node, the cluster, and the native functions.
#[derive(Debug, Clone)]
pub struct TestCluster<'a> {
    node: TestNode,
    cluster: &'a Cluster,
    native_funcs: &'a [String],
    payload: &'a str,
}

impl<'a> TestCluster<'a> {
    /// Compose a view for the test `node`.
    pub fn new(node: TestNode, cluster: &'a Cluster, native_funcs: &'a [String]) -> Self {
        Self {
            node,
            cluster,
            native_funcs,
            payload: DEFAULT_PAYLOAD,
        }
    }

    /// Use a different payload path on the machines.
    pub fn with_payload(mut self, payload: &'a str) -> Self {
        self.payload = payload;
        self
    }

    /// The test node this view reports to.
    pub fn node(&self) -> &TestNode {
        &self.node
    }

    /// Full name of the test.
    pub fn name(&self) -> &str {
        self.node.name()
    }

    /// The underlying cluster.
    pub fn cluster(&self) -> &'a Cluster {
        self.cluster
    }

    /// Machines of the cluster.
    pub fn machines(&self) -> &'a [Arc<dyn Machine>] {
        self.cluster.machines()
    }

    /// Names of the functions the payload can run on machines.
    pub fn list_native_functions(&self) -> &'a [String] {
        self.native_funcs
    }

    /// Run `f` as a subtest and report whether it passed.
    pub fn run(&self, name: &str, f: impl FnOnce(TestCluster<'a>)) -> bool {
        self.node.run(name, |child| {
            f(TestCluster {
                node: child.clone(),
                ..self.clone()
            })
        })
    }

    /// Remote command that runs `func` for this test.
    ///
    /// Both arguments are shell-quoted; the remote shell sees exactly two
    /// words after `run`, whatever they contain.
    pub fn native_command(&self, func: &str) -> String {
        format!(
            "{} run {} {}",
            shell_words::quote(self.payload),
            shell_words::quote(self.name()),
            shell_words::quote(func)
        )
    }

    /// Run the native function `func` on `machine` as a subtest named
    /// `func`.
    ///
    /// Connection, session and execution failures fail the subtest only.
    pub fn run_native(&self, func: &str, machine: &dyn Machine) -> bool {
        let command = self.native_command(func);
        self.run(func, |t| t.dispatch(&command, machine))
    }

    fn dispatch(&self, command: &str, machine: &dyn Machine) {
        let client = match machine.ssh_client() {
            Ok(client) => client,
            Err(e) => {
                self.node.error(format!("payload SSH client: {e}"));
                return;
            }
        };
        let mut session = match client.new_session() {
            Ok(session) => session,
            Err(e) => {
                self.node.error(format!("payload SSH session: {e}"));
                return;
            }
        };

        tracing::debug!("{} on {}: {}", self.name(), machine.id(), command);
        let result = session.combined_output(command);
        let output = String::from_utf8_lossy(&result.bytes);
        let output = output.trim();
        if !output.is_empty() {
            tracing::info!("{} on {}:\n{}", self.name(), machine.id(), output);
            self.node.log(format!("payload on {}:\n{}", machine.id(), output));
        }
        if let Err(e) = result.status {
            self.node.error(format!("payload: {e}"));
        }

        drop(session);
        drop(client);
    }

    /// Copy `local` to every machine; see [`Cluster::drop_file`].
    pub fn drop_file(&self, local: &Path) -> Result<(), DropError> {
        self.cluster.drop_file(local)
    }
}
