//! Run native test functions on every machine.

use anyhow::{Context, Result};
use imgtest_core::{Cluster, HarnessConfig, TestCluster, TestNode, TestReport};
use std::sync::Arc;

use super::build_cluster;

/// Run the run command and return the resulting test tree.
///
/// The payload is dropped first when `payload.local_path` is configured.
/// Dispatch failures are recorded in the tree, not returned.
pub async fn run(config: &HarnessConfig, use_mock: bool, parallel: bool) -> Result<TestReport> {
    let cluster = Arc::new(build_cluster(config, use_mock));
    if cluster.machines().is_empty() {
        anyhow::bail!("No machines configured");
    }

    if let Some(local) = config.payload.local_path.clone() {
        println!(
            "Dropping payload {} on {} machine(s)...",
            local.display(),
            cluster.machines().len()
        );
        let target = Arc::clone(&cluster);
        tokio::task::spawn_blocking(move || target.drop_file(&local))
            .await
            .context("Drop task panicked")?
            .context("Failed to drop payload")?;
    }

    tracing::info!(
        "dispatching {} function(s) on {} machine(s)",
        config.cluster.native_functions.len(),
        cluster.machines().len()
    );
    let root = TestNode::root(cluster.name());
    let funcs = Arc::new(config.cluster.native_functions.clone());
    let payload = Arc::new(config.payload.remote_path.clone());

    if parallel {
        let mut handles = Vec::new();
        for machine in cluster.machines() {
            for func in funcs.iter() {
                let job = Dispatch {
                    cluster: Arc::clone(&cluster),
                    root: root.clone(),
                    funcs: Arc::clone(&funcs),
                    payload: Arc::clone(&payload),
                };
                let machine = Arc::clone(machine);
                let func = func.clone();
                handles.push(tokio::task::spawn_blocking(move || {
                    job.view().run_native(&func, machine.as_ref())
                }));
            }
        }
        for handle in handles {
            handle.await.context("Dispatch task panicked")?;
        }
    } else {
        let job = Dispatch {
            cluster: Arc::clone(&cluster),
            root: root.clone(),
            funcs: Arc::clone(&funcs),
            payload: Arc::clone(&payload),
        };
        tokio::task::spawn_blocking(move || {
            let view = job.view();
            for machine in view.machines() {
                for func in view.list_native_functions() {
                    view.run_native(func, machine.as_ref());
                }
            }
        })
        .await
        .context("Dispatch task panicked")?;
    }

    Ok(root.report())
}

/// Owned state a dispatch thread builds its [`TestCluster`] view from.
struct Dispatch {
    cluster: Arc<Cluster>,
    root: TestNode,
    funcs: Arc<Vec<String>>,
    payload: Arc<String>,
}

impl Dispatch {
    fn view(&self) -> TestCluster<'_> {
        TestCluster::new(self.root.clone(), &self.cluster, &self.funcs).with_payload(&self.payload)
    }
}

/// Print the test tree, either as JSON or as one line per test.
pub fn print_report(report: &TestReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    print_node(report, 0);
    Ok(())
}

fn print_node(report: &TestReport, depth: usize) {
    let indent = "    ".repeat(depth);
    let status = if report.passed { "PASS" } else { "FAIL" };
    println!("{}--- {}: {}", indent, status, report.name);
    for line in &report.logs {
        for l in line.lines() {
            println!("{}    {}", indent, l);
        }
    }
    for sub in &report.subtests {
        print_node(sub, depth + 1);
    }
}
