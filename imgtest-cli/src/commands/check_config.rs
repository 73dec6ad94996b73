//! Validate and summarize a configuration file.

use imgtest_core::HarnessConfig;

/// Run the check-config command.
///
/// The configuration has already been parsed and validated; this prints
/// what a run would do with it.
pub fn run(config: &HarnessConfig) {
    println!("Cluster: {}", config.cluster.name);
    println!("Payload: {}", config.payload.remote_path);
    if let Some(local) = &config.payload.local_path {
        println!("  dropped from {}", local.display());
    }

    println!("Machines ({}):", config.machines.len());
    for m in &config.machines {
        println!("  {} -> {}@{}:{}", m.name, m.user, m.host, m.port);
    }

    println!("Native functions ({}):", config.cluster.native_functions.len());
    for f in &config.cluster.native_functions {
        println!("  {}", f);
    }

    println!(
        "Disk: OEM partition {} under {}, console {}",
        config.disk.oem_partition,
        config.disk.mapper_root.display(),
        config.disk.console
    );
}
