//! In-memory doubles for machines and host tools.
//!
//! [`MockMachine`] records connection and session lifecycle events and the
//! commands it is asked to run. [`MockDiskTools`] records every host tool
//! call and simulates the OEM partition, so disk template runs can be
//! checked without root, loop devices or mounts.

use crate::platform::{CombinedOutput, Machine, PlatformError, SshClient, SshSession};
use crate::tools::{DiskTools, ToolError};
use std::collections::HashSet;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Lifecycle event observed by a [`MockMachine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineEvent {
    /// A connection was opened.
    Connected,
    /// A session was opened.
    SessionOpened,
    /// A session was released.
    SessionClosed,
    /// A connection was released.
    Disconnected,
}

/// Mock machine for testing.
///
/// Clones share state, so a test can keep a handle while the cluster owns
/// another.
#[derive(Debug, Clone)]
pub struct MockMachine {
    id: String,
    inner: Arc<Mutex<MockMachineInner>>,
}

#[derive(Debug, Default)]
struct MockMachineInner {
    events: Vec<MachineEvent>,
    commands: Vec<String>,
    installed: Vec<(String, Vec<u8>)>,
    output: Vec<u8>,
    fail_next_connect: Option<String>,
    fail_next_session: Option<String>,
    fail_next_exec: Option<String>,
    fail_next_install: Option<String>,
}

impl MockMachine {
    /// Create a mock machine with the given identifier.
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            inner: Arc::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockMachineInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Set the combined output returned by every command.
    pub fn set_output(&self, output: &[u8]) {
        self.lock().output = output.to_vec();
    }

    /// Cause the next `ssh_client()` to fail.
    pub fn fail_next_connect(&self, reason: &str) {
        self.lock().fail_next_connect = Some(reason.to_string());
    }

    /// Cause the next `new_session()` to fail.
    pub fn fail_next_session(&self, reason: &str) {
        self.lock().fail_next_session = Some(reason.to_string());
    }

    /// Cause the next `combined_output()` to report a nonzero exit.
    pub fn fail_next_exec(&self, reason: &str) {
        self.lock().fail_next_exec = Some(reason.to_string());
    }

    /// Cause the next `run_with_stdin()` to fail.
    pub fn fail_next_install(&self, reason: &str) {
        self.lock().fail_next_install = Some(reason.to_string());
    }

    /// All lifecycle events, in order.
    pub fn events(&self) -> Vec<MachineEvent> {
        self.lock().events.clone()
    }

    /// Commands passed to `combined_output()`.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Commands and stdin content passed to `run_with_stdin()`.
    pub fn installed(&self) -> Vec<(String, Vec<u8>)> {
        self.lock().installed.clone()
    }

    /// Connections plus sessions currently open.
    pub fn open_handles(&self) -> i64 {
        self.lock()
            .events
            .iter()
            .map(|e| match e {
                MachineEvent::Connected | MachineEvent::SessionOpened => 1,
                MachineEvent::SessionClosed | MachineEvent::Disconnected => -1,
            })
            .sum()
    }

    fn record(&self, event: MachineEvent) {
        self.lock().events.push(event);
    }
}

impl Machine for MockMachine {
    fn id(&self) -> &str {
        &self.id
    }

    fn ssh_client(&self) -> Result<Box<dyn SshClient + '_>, PlatformError> {
        let mut inner = self.lock();
        if let Some(reason) = inner.fail_next_connect.take() {
            return Err(PlatformError::Connect {
                machine: self.id.clone(),
                reason,
            });
        }
        inner.events.push(MachineEvent::Connected);
        Ok(Box::new(MockClient { machine: self }))
    }
}

struct MockClient<'m> {
    machine: &'m MockMachine,
}

impl SshClient for MockClient<'_> {
    fn new_session(&self) -> Result<Box<dyn SshSession + '_>, PlatformError> {
        let mut inner = self.machine.lock();
        if let Some(reason) = inner.fail_next_session.take() {
            return Err(PlatformError::Session {
                machine: self.machine.id.clone(),
                reason,
            });
        }
        inner.events.push(MachineEvent::SessionOpened);
        Ok(Box::new(MockSession {
            machine: self.machine,
        }))
    }
}

impl Drop for MockClient<'_> {
    fn drop(&mut self) {
        self.machine.record(MachineEvent::Disconnected);
    }
}

struct MockSession<'m> {
    machine: &'m MockMachine,
}

impl SshSession for MockSession<'_> {
    fn combined_output(&mut self, command: &str) -> CombinedOutput {
        let mut inner = self.machine.lock();
        inner.commands.push(command.to_string());
        let status = match inner.fail_next_exec.take() {
            Some(status) => Err(PlatformError::Exit {
                machine: self.machine.id.clone(),
                status,
            }),
            None => Ok(()),
        };
        CombinedOutput {
            bytes: inner.output.clone(),
            status,
        }
    }

    fn run_with_stdin(
        &mut self,
        command: &str,
        stdin: &mut dyn Read,
    ) -> Result<(), PlatformError> {
        if let Some(reason) = self.machine.lock().fail_next_install.take() {
            return Err(PlatformError::Exit {
                machine: self.machine.id.clone(),
                status: reason,
            });
        }
        let mut content = Vec::new();
        stdin
            .read_to_end(&mut content)
            .map_err(|source| PlatformError::Transport {
                machine: self.machine.id.clone(),
                source,
            })?;
        self.machine
            .lock()
            .installed
            .push((command.to_string(), content));
        Ok(())
    }
}

impl Drop for MockSession<'_> {
    fn drop(&mut self) {
        self.machine.record(MachineEvent::SessionClosed);
    }
}

/// Host tool operation, as recorded by [`MockDiskTools`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiskStep {
    /// Image copy.
    Copy,
    /// Scratch directory creation.
    ScratchDir,
    /// Partition mapping (add).
    MapPartitions,
    /// Mount of the OEM partition.
    Mount,
    /// Unmount of the scratch directory.
    Unmount,
    /// Partition mapping (delete).
    UnmapPartitions,
    /// Scratch directory removal.
    RemoveDir,
}

/// Default partition mapper listing: loop3 with OEM on partition 6.
pub const MOCK_KPARTX_OUTPUT: &str = "add map loop3p1 (253:0): 0 262144 linear /dev/loop3 4096\n\
add map loop3p6 (253:5): 0 262144 linear /dev/loop3 270336\n";

/// Mock host tools for testing the disk template builder.
///
/// Scratch directories are real directories under `root`. Mounting copies
/// the simulated OEM partition's `grub.cfg` into the mount point and
/// unmounting moves it back, so writes made while "mounted" persist.
#[derive(Debug)]
pub struct MockDiskTools {
    root: PathBuf,
    inner: Mutex<MockDiskInner>,
}

#[derive(Debug)]
struct MockDiskInner {
    steps: Vec<DiskStep>,
    calls: Vec<String>,
    failing: HashSet<DiskStep>,
    kpartx_output: String,
    oem_grub: Vec<u8>,
    scratch_count: usize,
}

impl MockDiskTools {
    /// Create mock tools keeping scratch directories under `root`.
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            inner: Mutex::new(MockDiskInner {
                steps: Vec::new(),
                calls: Vec::new(),
                failing: HashSet::new(),
                kpartx_output: MOCK_KPARTX_OUTPUT.to_string(),
                oem_grub: Vec::new(),
                scratch_count: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockDiskInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Make `step` fail whenever it runs.
    pub fn fail(&self, step: DiskStep) {
        self.lock().failing.insert(step);
    }

    /// Replace the partition mapper's output.
    pub fn set_kpartx_output(&self, output: &str) {
        self.lock().kpartx_output = output.to_string();
    }

    /// Seed the OEM partition's grub.cfg.
    pub fn set_oem_grub(&self, content: &[u8]) {
        self.lock().oem_grub = content.to_vec();
    }

    /// Current content of the OEM partition's grub.cfg.
    pub fn oem_grub(&self) -> Vec<u8> {
        self.lock().oem_grub.clone()
    }

    /// Steps that ran, in order.
    pub fn steps(&self) -> Vec<DiskStep> {
        self.lock().steps.clone()
    }

    /// Command lines of the steps that ran, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Record `step`; returns true if it is set to fail.
    fn enter(&self, step: DiskStep, call: String) -> bool {
        let mut inner = self.lock();
        inner.steps.push(step);
        inner.calls.push(call);
        inner.failing.contains(&step)
    }
}

fn injected(program: &str) -> ToolError {
    ToolError::Failed {
        program: program.to_string(),
        status: "exit status: 1".to_string(),
        stderr: "injected failure".to_string(),
    }
}

impl DiskTools for MockDiskTools {
    fn copy_sparse(&self, input: &Path, output: &Path) -> Result<(), ToolError> {
        if self.enter(
            DiskStep::Copy,
            format!("cp {} {}", input.display(), output.display()),
        ) {
            return Err(injected("cp"));
        }
        fs::copy(input, output)
            .map(|_| ())
            .map_err(|source| ToolError::Spawn {
                program: "cp".to_string(),
                source,
            })
    }

    fn make_scratch_dir(&self, prefix: &str) -> io::Result<PathBuf> {
        let dir = {
            let mut inner = self.lock();
            inner.scratch_count += 1;
            self.root.join(format!("{}{}", prefix, inner.scratch_count))
        };
        if self.enter(DiskStep::ScratchDir, format!("mkdir {}", dir.display())) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "injected failure"));
        }
        fs::create_dir(&dir)?;
        Ok(dir)
    }

    fn remove_dir(&self, dir: &Path) -> io::Result<()> {
        if self.enter(DiskStep::RemoveDir, format!("rmdir {}", dir.display())) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "injected failure"));
        }
        fs::remove_dir(dir)
    }

    fn map_partitions(&self, image: &Path) -> Result<String, ToolError> {
        if self.enter(
            DiskStep::MapPartitions,
            format!("kpartx -av {}", image.display()),
        ) {
            return Err(injected("kpartx"));
        }
        Ok(self.lock().kpartx_output.clone())
    }

    fn unmap_partitions(&self, image: &Path) -> Result<(), ToolError> {
        if self.enter(
            DiskStep::UnmapPartitions,
            format!("kpartx -d {}", image.display()),
        ) {
            return Err(injected("kpartx"));
        }
        Ok(())
    }

    fn mount(&self, device: &Path, target: &Path) -> Result<(), ToolError> {
        if self.enter(
            DiskStep::Mount,
            format!("mount {} {}", device.display(), target.display()),
        ) {
            return Err(injected("mount"));
        }
        let content = self.lock().oem_grub.clone();
        if !content.is_empty() {
            fs::write(target.join("grub.cfg"), content).map_err(|source| ToolError::Spawn {
                program: "mount".to_string(),
                source,
            })?;
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), ToolError> {
        if self.enter(DiskStep::Unmount, format!("umount {}", target.display())) {
            // still "mounted": grub.cfg stays in the scratch directory
            return Err(injected("umount"));
        }
        let grub = target.join("grub.cfg");
        if grub.exists() {
            let content = fs::read(&grub).map_err(|source| ToolError::Spawn {
                program: "umount".to_string(),
                source,
            })?;
            fs::remove_file(&grub).map_err(|source| ToolError::Spawn {
                program: "umount".to_string(),
                source,
            })?;
            self.lock().oem_grub = content;
        }
        Ok(())
    }
}
