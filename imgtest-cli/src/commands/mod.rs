//! Command implementations.

pub mod check_config;
pub mod drop;
pub mod make_disk;
pub mod run;

use imgtest_core::{Cluster, HarnessConfig, Machine, MockMachine, SshMachine};
use std::sync::Arc;

/// Build the cluster described by `config`.
///
/// With `use_mock`, every machine is an in-memory [`MockMachine`] that
/// accepts any command.
pub fn build_cluster(config: &HarnessConfig, use_mock: bool) -> Cluster {
    let machines = config
        .machines
        .iter()
        .map(|m| -> Arc<dyn Machine> {
            if use_mock {
                let mock = MockMachine::new(&m.name);
                mock.set_output(format!("{}: mock payload ok", m.name).as_bytes());
                Arc::new(mock)
            } else {
                Arc::new(SshMachine::new(m, &config.ssh))
            }
        })
        .collect();
    Cluster::new(&config.cluster.name, machines)
}
