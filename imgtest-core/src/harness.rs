//! Minimal hierarchical test tree.
//!
//! A [`TestNode`] is a cheap, cloneable handle. Subtests are created with
//! [`TestNode::run`]; a failing subtest marks its parent failed. Nodes are
//! thread-safe, so sibling subtests may run on different threads.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Handle to one node of the test tree.
#[derive(Debug, Clone)]
pub struct TestNode {
    inner: Arc<NodeInner>,
}

#[derive(Debug)]
struct NodeInner {
    name: String,
    state: Mutex<NodeState>,
}

#[derive(Debug, Default)]
struct NodeState {
    failed: bool,
    logs: Vec<String>,
    children: Vec<TestNode>,
}

/// Serializable snapshot of a test tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestReport {
    /// Full test name (`parent/child`).
    pub name: String,
    /// Whether the test and all its subtests passed.
    pub passed: bool,
    /// Log lines recorded on this test.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
    /// Subtests, in start order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subtests: Vec<TestReport>,
}

impl TestNode {
    /// Create a root test.
    pub fn root(name: &str) -> Self {
        Self::with_name(name.to_string())
    }

    fn with_name(name: String) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                name,
                state: Mutex::new(NodeState::default()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Full name of this test.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Run `f` as a subtest named `name` and report whether it passed.
    pub fn run(&self, name: &str, f: impl FnOnce(&TestNode)) -> bool {
        let child = Self::with_name(format!("{}/{}", self.name(), name));
        self.lock().children.push(child.clone());

        tracing::debug!("=== RUN {}", child.name());
        f(&child);

        let passed = !child.failed();
        if passed {
            tracing::info!("--- PASS {}", child.name());
        } else {
            tracing::warn!("--- FAIL {}", child.name());
            self.lock().failed = true;
        }
        passed
    }

    /// Record a log line.
    pub fn log(&self, message: impl Into<String>) {
        self.lock().logs.push(message.into());
    }

    /// Record a log line and mark the test failed.
    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{}: {}", self.name(), message);
        let mut state = self.lock();
        state.failed = true;
        state.logs.push(message);
    }

    /// Returns true if this test or any subtest failed.
    pub fn failed(&self) -> bool {
        self.lock().failed
    }

    /// Log lines recorded on this test.
    pub fn logs(&self) -> Vec<String> {
        self.lock().logs.clone()
    }

    /// Direct subtests, in start order.
    pub fn children(&self) -> Vec<TestNode> {
        self.lock().children.clone()
    }

    /// Snapshot of this test and its subtests.
    pub fn report(&self) -> TestReport {
        let (passed, logs, children) = {
            let state = self.lock();
            (!state.failed, state.logs.clone(), state.children.clone())
        };
        TestReport {
            name: self.name().to_string(),
            passed,
            logs,
            subtests: children.iter().map(TestNode::report).collect(),
        }
    }
}

impl TestReport {
    /// Number of failed leaf tests in this report.
    pub fn failed_leaves(&self) -> usize {
        if self.subtests.is_empty() {
            usize::from(!self.passed)
        } else {
            self.subtests.iter().map(TestReport::failed_leaves).sum()
        }
    }
}
