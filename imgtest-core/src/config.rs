//! Configuration loading for imgtest.
//!
//! Configuration is loaded from a TOML file (default: `imgtest.toml`).
//! Every field has a default, so an empty file yields a usable (if
//! machine-less) configuration.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HarnessConfig {
    /// Cluster identity and the native functions to run.
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Test payload locations.
    #[serde(default)]
    pub payload: PayloadConfig,
    /// SSH client options shared by every machine.
    #[serde(default)]
    pub ssh: SshConfig,
    /// Machines of the cluster, in dispatch order.
    #[serde(default)]
    pub machines: Vec<MachineConfig>,
    /// Disk template parameters.
    #[serde(default)]
    pub disk: DiskConfig,
}

/// Cluster configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name, also the name of the enclosing test (default: "imgtest").
    #[serde(default = "default_cluster_name")]
    pub name: String,
    /// Native functions to run on every machine.
    #[serde(default)]
    pub native_functions: Vec<String>,
}

/// Payload configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PayloadConfig {
    /// Payload path on the machine, relative to the remote home directory
    /// (default: "./imgtest-agent").
    #[serde(default = "default_remote_payload")]
    pub remote_path: String,
    /// Local payload binary to drop onto every machine before dispatch.
    pub local_path: Option<PathBuf>,
}

/// SSH client options.
#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// Connection timeout in seconds (default: 30).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Verify host keys (default: false, test machines are ephemeral).
    #[serde(default)]
    pub strict_host_key_checking: bool,
    /// Extra `-o` options passed to every ssh invocation.
    #[serde(default)]
    pub extra_options: Vec<String>,
}

/// One machine of the cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct MachineConfig {
    /// Unique machine name.
    pub name: String,
    /// Host name or address.
    pub host: String,
    /// SSH user (default: "core").
    #[serde(default = "default_user")]
    pub user: String,
    /// SSH port (default: 22).
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Disk template parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct DiskConfig {
    /// Directory holding partition mapper nodes (default: "/dev/mapper").
    #[serde(default = "default_mapper_root")]
    pub mapper_root: PathBuf,
    /// Index of the OEM partition (default: 6).
    #[serde(default = "default_oem_partition")]
    pub oem_partition: u32,
    /// Kernel console setting written to grub.cfg (default: "ttyS0,115200").
    #[serde(default = "default_console")]
    pub console: String,
    /// Prefix of the scratch mount directory (default: "imgtest-qemu-").
    #[serde(default = "default_scratch_prefix")]
    pub scratch_prefix: String,
    /// Host tool program names.
    #[serde(default)]
    pub tools: ToolPrograms,
}

/// Host tool program names.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolPrograms {
    /// Sparse and reflink aware copy (default: "cp").
    #[serde(default = "default_cp")]
    pub cp: String,
    /// Partition mapper (default: "kpartx").
    #[serde(default = "default_kpartx")]
    pub kpartx: String,
    /// Mount tool (default: "mount").
    #[serde(default = "default_mount")]
    pub mount: String,
    /// Unmount tool (default: "umount").
    #[serde(default = "default_umount")]
    pub umount: String,
}

// Default value functions
fn default_cluster_name() -> String {
    "imgtest".to_string()
}

fn default_remote_payload() -> String {
    crate::cluster::DEFAULT_PAYLOAD.to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_user() -> String {
    "core".to_string()
}

fn default_port() -> u16 {
    22
}

fn default_mapper_root() -> PathBuf {
    PathBuf::from("/dev/mapper")
}

fn default_oem_partition() -> u32 {
    6
}

fn default_console() -> String {
    "ttyS0,115200".to_string()
}

fn default_scratch_prefix() -> String {
    "imgtest-qemu-".to_string()
}

fn default_cp() -> String {
    "cp".to_string()
}

fn default_kpartx() -> String {
    "kpartx".to_string()
}

fn default_mount() -> String {
    "mount".to_string()
}

fn default_umount() -> String {
    "umount".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            native_functions: Vec::new(),
        }
    }
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            remote_path: default_remote_payload(),
            local_path: None,
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            strict_host_key_checking: false,
            extra_options: Vec::new(),
        }
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            mapper_root: default_mapper_root(),
            oem_partition: default_oem_partition(),
            console: default_console(),
            scratch_prefix: default_scratch_prefix(),
            tools: ToolPrograms::default(),
        }
    }
}

impl Default for ToolPrograms {
    fn default() -> Self {
        Self {
            cp: default_cp(),
            kpartx: default_kpartx(),
            mount: default_mount(),
            umount: default_umount(),
        }
    }
}

impl DiskConfig {
    /// Line appended to the OEM grub.cfg.
    pub fn grub_line(&self) -> String {
        format!("set linux_console=\"console={}\"\n", self.console)
    }

    /// Mapper node of the OEM partition for a bound loop device.
    pub fn oem_node(&self, loop_name: &str) -> PathBuf {
        self.mapper_root
            .join(format!("{}p{}", loop_name, self.oem_partition))
    }
}

impl HarnessConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.name.trim().is_empty() {
            return Err(ConfigError::Invalid("cluster name must not be empty".into()));
        }
        if self.payload.remote_path.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "payload remote_path must not be empty".into(),
            ));
        }
        if self.disk.oem_partition == 0 {
            return Err(ConfigError::Invalid(
                "disk oem_partition is 1-based".into(),
            ));
        }
        let mut seen = HashSet::new();
        for machine in &self.machines {
            if !seen.insert(machine.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate machine name: {}",
                    machine.name
                )));
            }
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// Configuration parsed but is not usable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = HarnessConfig::default();
        assert_eq!(config.cluster.name, "imgtest");
        assert_eq!(config.payload.remote_path, "./imgtest-agent");
        assert_eq!(config.disk.oem_partition, 6);
        assert_eq!(config.disk.mapper_root, PathBuf::from("/dev/mapper"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[cluster]
name = "basic"
native_functions = ["CheckSerialConsole", "CheckHostname"]

[payload]
local_path = "target/release/imgtest-agent"

[ssh]
connect_timeout_secs = 5
extra_options = ["ServerAliveInterval=10"]

[[machines]]
name = "m1"
host = "10.0.0.2"

[[machines]]
name = "m2"
host = "10.0.0.3"
user = "root"
port = 2222

[disk]
console = "ttyS1,9600"
"#;

        let config: HarnessConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.cluster.name, "basic");
        assert_eq!(config.cluster.native_functions.len(), 2);
        assert_eq!(
            config.payload.local_path,
            Some(PathBuf::from("target/release/imgtest-agent"))
        );
        assert_eq!(config.ssh.connect_timeout_secs, 5);
        assert_eq!(config.machines[0].user, "core");
        assert_eq!(config.machines[0].port, 22);
        assert_eq!(config.machines[1].port, 2222);
        assert_eq!(config.disk.console, "ttyS1,9600");
        assert_eq!(config.disk.tools.kpartx, "kpartx");
    }

    #[test]
    fn example_config_parses() {
        let config: HarnessConfig =
            toml::from_str(include_str!("../../imgtest.example.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.machines.len(), 2);
        assert_eq!(config.cluster.native_functions[0], "CheckSerialConsole");
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config: HarnessConfig = toml::from_str("").unwrap();
        assert!(config.machines.is_empty());
        assert_eq!(config.ssh.connect_timeout_secs, 30);
        assert_eq!(config.disk.scratch_prefix, "imgtest-qemu-");
    }

    #[test]
    fn grub_line_and_oem_node() {
        let disk = DiskConfig::default();
        assert_eq!(
            disk.grub_line(),
            "set linux_console=\"console=ttyS0,115200\"\n"
        );
        assert_eq!(
            disk.oem_node("loop3"),
            PathBuf::from("/dev/mapper/loop3p6")
        );
    }

    #[test]
    fn duplicate_machine_names_rejected() {
        let toml = r#"
[[machines]]
name = "m1"
host = "a"

[[machines]]
name = "m1"
host = "b"
"#;
        let config: HarnessConfig = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate machine name: m1"));
    }

    #[test]
    fn zero_oem_partition_rejected() {
        let mut config = HarnessConfig::default();
        config.disk.oem_partition = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn from_file_reports_path_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[cluster\nname = 1").unwrap();

        let err = HarnessConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn from_file_missing_file() {
        let err = HarnessConfig::from_file(Path::new("/nonexistent/imgtest.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }
}
