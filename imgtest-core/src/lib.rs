//! # imgtest-core
//!
//! Remote dispatch and boot-disk preparation for OS image tests.
//!
//! This crate is the engine behind the `imgtest` CLI:
//! - [`cluster`]: runs native test payloads on machines over SSH and folds
//!   the outcome into a [`harness::TestNode`] tree, and distributes files to
//!   every machine of a cluster
//! - [`disk`]: turns a base disk image into a test-ready image by patching
//!   its OEM partition, with ordered teardown of every acquired resource
//! - [`cleanup`]: the release stack and first-error accumulator the disk
//!   builder unwinds through
//!
//! ## Design
//!
//! Machines, sessions and host tools sit behind traits ([`platform::Machine`],
//! [`tools::DiskTools`]) so the dispatch and provisioning logic can be
//! exercised against the in-memory doubles in [`mock`].
//!
//! All work is synchronous. Callers that want parallel dispatch run each
//! call on its own thread; nothing in this crate shares mutable state
//! between dispatches.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cleanup;
pub mod cluster;
pub mod config;
pub mod disk;
pub mod harness;
pub mod mock;
pub mod native;
pub mod platform;
pub mod ssh;
pub mod tools;

pub use cleanup::{CleanupStack, FirstError};
pub use cluster::{Cluster, DropError, TestCluster, DEFAULT_PAYLOAD};
pub use config::{
    ClusterConfig, ConfigError, DiskConfig, HarnessConfig, MachineConfig, PayloadConfig,
    SshConfig, ToolPrograms,
};
pub use disk::{make_disk_template, parse_loop_device, DiskError, DiskTemplateBuilder};
pub use harness::{TestNode, TestReport};
pub use mock::{DiskStep, MachineEvent, MockDiskTools, MockMachine};
pub use native::{NativeContext, NativeError, NativeRegistry};
pub use platform::{install_file, CombinedOutput, Machine, PlatformError, SshClient, SshSession};
pub use ssh::SshMachine;
pub use tools::{DiskTools, HostTools, ToolError};
