//! Disk template builder.
//!
//! Copies a base disk image and patches its OEM partition so machines
//! booted from the copy log to a serial console:
//!
//! 1. copy the image (sparse, reflink when possible)
//! 2. create a scratch mount point
//! 3. map the copy's partitions through a loop device
//! 4. mount the OEM partition on the scratch directory
//! 5. append the console setting to `grub.cfg`
//!
//! Stages 2-4 push their release action onto a [`CleanupStack`] right after
//! they succeed. Whatever happens, the stack is unwound in reverse order and
//! the first error (forward or release) is returned. If any stage after
//! the copy fails, the copy is deleted.

use crate::cleanup::{CleanupStack, FirstError};
use crate::config::DiskConfig;
use crate::tools::{DiskTools, HostTools, ToolError};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from building a disk template.
#[derive(Debug, Error)]
pub enum DiskError {
    /// Stage 1: the image copy failed.
    #[error("copying file: {0}")]
    Copy(#[source] ToolError),

    /// Stage 2: the scratch directory could not be created.
    #[error("making temporary directory: {0}")]
    ScratchDir(#[source] io::Error),

    /// Stage 3: the partition mapper failed.
    #[error("setting up partitions: {0}")]
    SetupPartitions(#[source] ToolError),

    /// Stage 3: the partition mapper did not name a loop device.
    #[error("couldn't obtain loop device name")]
    LoopDeviceNotFound,

    /// Stage 4: the OEM partition could not be mounted.
    #[error("mounting OEM partition {node} on {dir}: {source}")]
    MountOem {
        /// Mapper node of the OEM partition.
        node: PathBuf,
        /// Scratch mount point.
        dir: PathBuf,
        /// Underlying tool error.
        source: ToolError,
    },

    /// Stage 5: grub.cfg could not be opened.
    #[error("opening grub.cfg: {0}")]
    OpenGrub(#[source] io::Error),

    /// Stage 5: grub.cfg could not be written.
    #[error("writing grub.cfg: {0}")]
    WriteGrub(#[source] io::Error),

    /// Release of stage 4 failed.
    #[error("unmounting {dir}: {source}")]
    Unmount {
        /// Scratch mount point.
        dir: PathBuf,
        /// Underlying tool error.
        source: ToolError,
    },

    /// Release of stage 3 failed.
    #[error("tearing down partitions: {0}")]
    TeardownPartitions(#[source] ToolError),

    /// Release of stage 2 failed.
    #[error("deleting directory {dir}: {source}")]
    RemoveScratchDir {
        /// Scratch directory.
        dir: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
}

/// Extract the loop device name from the partition mapper's output.
///
/// Only the first line is examined. The first field of the form
/// `/dev/loopN` (optionally followed by `:`) yields `loopN`.
pub fn parse_loop_device(output: &str) -> Option<String> {
    let first = output.lines().next()?;
    first.split_whitespace().find_map(|field| {
        let name = field.strip_prefix("/dev/")?;
        let name = name.trim_end_matches(':');
        let digits = name.strip_prefix("loop")?;
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            Some(name.to_string())
        } else {
            None
        }
    })
}

/// Builds test-ready disk images.
pub struct DiskTemplateBuilder<'t> {
    tools: &'t dyn DiskTools,
    config: DiskConfig,
}

impl<'t> DiskTemplateBuilder<'t> {
    /// Create a builder over the given host tools.
    pub fn new(tools: &'t dyn DiskTools, config: DiskConfig) -> Self {
        Self { tools, config }
    }

    /// Copy `input` to `output` and patch the copy.
    ///
    /// On success `output` is the patched image. When patching fails the
    /// copy is removed again. A failed copy leaves whatever was already at
    /// `output` alone. Invocations on the same `output` must not overlap.
    pub fn build(&self, input: &Path, output: &Path) -> Result<(), DiskError> {
        tracing::info!(
            "building disk template {} from {}",
            output.display(),
            input.display()
        );

        if let Err(source) = self.tools.copy_sparse(input, output) {
            let err = DiskError::Copy(source);
            tracing::warn!("disk template {} failed: {}", output.display(), err);
            return Err(err);
        }

        let result = self.patch(output);
        if let Err(err) = &result {
            tracing::warn!("disk template {} failed: {}", output.display(), err);
            match std::fs::remove_file(output) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("removing {}: {}", output.display(), e),
            }
        } else {
            tracing::info!("disk template {} ready", output.display());
        }
        result
    }

    fn patch(&self, image: &Path) -> Result<(), DiskError> {
        let mut errors = FirstError::new();
        let mut cleanup = CleanupStack::new();
        if let Err(err) = acquire_and_patch(self.tools, &self.config, image, &mut cleanup) {
            errors.record(err);
        }
        let released = cleanup.unwind(&mut errors);
        tracing::debug!("released: {:?}", released);
        errors.into_result()
    }
}

fn acquire_and_patch<'a>(
    tools: &'a dyn DiskTools,
    config: &DiskConfig,
    image: &Path,
    cleanup: &mut CleanupStack<'a, DiskError>,
) -> Result<(), DiskError> {
    // scratch mount point
    let scratch = tools
        .make_scratch_dir(&config.scratch_prefix)
        .map_err(DiskError::ScratchDir)?;
    {
        let dir = scratch.clone();
        cleanup.push(format!("remove {}", dir.display()), move || {
            match tools.remove_dir(&dir) {
                Ok(()) => Ok(()),
                Err(source) => Err(DiskError::RemoveScratchDir { dir, source }),
            }
        });
    }

    // partitions
    let listing = tools
        .map_partitions(image)
        .map_err(DiskError::SetupPartitions)?;
    let Some(loop_name) = parse_loop_device(&listing) else {
        tracing::warn!(
            "no loop device in partition listing for {}, mappings left in place",
            image.display()
        );
        return Err(DiskError::LoopDeviceNotFound);
    };
    tracing::debug!("{} bound to {}", image.display(), loop_name);
    {
        let image = image.to_path_buf();
        cleanup.push(format!("unmap {}", loop_name), move || {
            tools
                .unmap_partitions(&image)
                .map_err(DiskError::TeardownPartitions)
        });
    }

    // OEM partition
    let node = config.oem_node(&loop_name);
    if let Err(source) = tools.mount(&node, &scratch) {
        return Err(DiskError::MountOem {
            node,
            dir: scratch,
            source,
        });
    }
    {
        let dir = scratch.clone();
        cleanup.push(format!("unmount {}", dir.display()), move || {
            match tools.unmount(&dir) {
                Ok(()) => Ok(()),
                Err(source) => Err(DiskError::Unmount { dir, source }),
            }
        });
    }

    // console settings; the file is closed before the unmount runs
    let mut grub = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o644)
        .open(scratch.join("grub.cfg"))
        .map_err(DiskError::OpenGrub)?;
    grub.write_all(config.grub_line().as_bytes())
        .map_err(DiskError::WriteGrub)?;
    Ok(())
}

/// Build a disk template with the default configuration and host tools.
pub fn make_disk_template(input: &Path, output: &Path) -> Result<(), DiskError> {
    let config = DiskConfig::default();
    let tools = HostTools::new(config.tools.clone());
    DiskTemplateBuilder::new(&tools, config).build(input, output)
}
