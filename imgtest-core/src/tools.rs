//! Host tools used to specialize a disk image.
//!
//! [`DiskTools`] is the seam between the disk template pipeline and the
//! operating system. [`HostTools`] shells out to `cp`, `kpartx`, `mount`
//! and `umount`; tests use [`crate::mock::MockDiskTools`].

use crate::config::ToolPrograms;
use std::ffi::OsStr;
use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use thiserror::Error;

/// Errors from running a host tool.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The tool could not be started or its output could not be read.
    #[error("running {program}: {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The tool ran and exited unsuccessfully.
    #[error("{program} failed ({status}): {stderr}")]
    Failed {
        /// Program name.
        program: String,
        /// Exit status description.
        status: String,
        /// Captured standard error, trimmed.
        stderr: String,
    },
}

/// Operating system facilities needed to patch a disk image.
///
/// Every call blocks until the underlying tool exits.
pub trait DiskTools {
    /// Copy `input` to `output`, keeping holes and sharing extents where the
    /// filesystem allows. Overwrites `output`.
    fn copy_sparse(&self, input: &Path, output: &Path) -> Result<(), ToolError>;

    /// Create a private directory whose name starts with `prefix`.
    fn make_scratch_dir(&self, prefix: &str) -> io::Result<PathBuf>;

    /// Remove an empty directory.
    fn remove_dir(&self, dir: &Path) -> io::Result<()>;

    /// Bind `image` to a loop device and map its partitions.
    ///
    /// Returns the tool's standard output, which names the loop device.
    fn map_partitions(&self, image: &Path) -> Result<String, ToolError>;

    /// Delete the partition mappings of `image`.
    fn unmap_partitions(&self, image: &Path) -> Result<(), ToolError>;

    /// Mount `device` on `target`.
    fn mount(&self, device: &Path, target: &Path) -> Result<(), ToolError>;

    /// Unmount whatever is mounted on `target`.
    fn unmount(&self, target: &Path) -> Result<(), ToolError>;
}

/// [`DiskTools`] backed by real host programs.
#[derive(Debug, Clone, Default)]
pub struct HostTools {
    programs: ToolPrograms,
}

impl HostTools {
    /// Create host tools using the given program names.
    pub fn new(programs: ToolPrograms) -> Self {
        Self { programs }
    }

    fn run<I, S>(&self, program: &str, args: I) -> Result<Output, ToolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| ToolError::Spawn {
                program: program.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(ToolError::Failed {
                program: program.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

impl DiskTools for HostTools {
    fn copy_sparse(&self, input: &Path, output: &Path) -> Result<(), ToolError> {
        self.run(
            &self.programs.cp,
            [
                OsStr::new("--force"),
                OsStr::new("--sparse=always"),
                OsStr::new("--reflink=auto"),
                input.as_os_str(),
                output.as_os_str(),
            ],
        )?;
        Ok(())
    }

    fn make_scratch_dir(&self, prefix: &str) -> io::Result<PathBuf> {
        let dir = std::env::temp_dir().join(format!(
            "{}{}",
            prefix,
            uuid::Uuid::new_v4().simple()
        ));
        DirBuilder::new().mode(0o700).create(&dir)?;
        Ok(dir)
    }

    fn remove_dir(&self, dir: &Path) -> io::Result<()> {
        std::fs::remove_dir(dir)
    }

    fn map_partitions(&self, image: &Path) -> Result<String, ToolError> {
        let output = self.run(
            &self.programs.kpartx,
            [OsStr::new("-av"), image.as_os_str()],
        )?;
        let stdout = String::from_utf8(output.stdout).map_err(|e| ToolError::Spawn {
            program: self.programs.kpartx.clone(),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })?;
        tracing::debug!("{} output: {}", self.programs.kpartx, stdout.trim());
        Ok(stdout)
    }

    fn unmap_partitions(&self, image: &Path) -> Result<(), ToolError> {
        self.run(&self.programs.kpartx, [OsStr::new("-d"), image.as_os_str()])?;
        Ok(())
    }

    fn mount(&self, device: &Path, target: &Path) -> Result<(), ToolError> {
        self.run(&self.programs.mount, [device.as_os_str(), target.as_os_str()])?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), ToolError> {
        self.run(&self.programs.umount, [target.as_os_str()])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn programs_with_cp(cp: &str) -> ToolPrograms {
        ToolPrograms {
            cp: cp.to_string(),
            ..ToolPrograms::default()
        }
    }

    #[test]
    fn copy_sparse_copies_content() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("base.img");
        let output = dir.path().join("test.img");
        std::fs::write(&input, b"disk image").unwrap();

        HostTools::default().copy_sparse(&input, &output).unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), b"disk image");
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let tools = HostTools::new(programs_with_cp("imgtest-no-such-program"));
        let err = tools
            .copy_sparse(Path::new("/a"), Path::new("/b"))
            .unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }

    #[test]
    fn nonzero_exit_is_failed_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let err = HostTools::default()
            .copy_sparse(&dir.path().join("missing.img"), &dir.path().join("out.img"))
            .unwrap_err();
        match err {
            ToolError::Failed { program, stderr, .. } => {
                assert_eq!(program, "cp");
                assert!(!stderr.is_empty());
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn scratch_dir_is_private_and_removable() {
        use std::os::unix::fs::PermissionsExt;

        let tools = HostTools::default();
        let dir = tools.make_scratch_dir("imgtest-test-").unwrap();
        let name = dir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("imgtest-test-"));
        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        tools.remove_dir(&dir).unwrap();
        assert!(!dir.exists());
    }
}
