//! Registry of native test functions run by the on-machine payload.
//!
//! The payload builds one [`NativeRegistry`] at startup and dispatches
//! `run <test> <function>` invocations through it by function name.

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors from native function dispatch.
#[derive(Debug, Error)]
pub enum NativeError {
    /// No function with this name is registered.
    #[error("unknown native function: {0}")]
    UnknownFunction(String),

    /// The function ran and reported a failure.
    #[error("{function} failed: {reason}")]
    Failed {
        /// Function name.
        function: String,
        /// Failure detail.
        reason: String,
    },

    /// I/O error while the function ran.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NativeError {
    /// Shorthand for a failed check.
    pub fn failed(function: &str, reason: impl Into<String>) -> Self {
        Self::Failed {
            function: function.to_string(),
            reason: reason.into(),
        }
    }
}

/// Invocation context passed to every native function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeContext {
    /// Name of the test that requested the run.
    pub test: String,
    /// Name of the function being run.
    pub function: String,
}

type NativeFn = Box<dyn Fn(&NativeContext) -> Result<(), NativeError> + Send + Sync>;

/// Name-keyed table of native functions.
#[derive(Default)]
pub struct NativeRegistry {
    functions: BTreeMap<String, NativeFn>,
}

impl fmt::Debug for NativeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

impl NativeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f` under `name`, replacing any earlier registration.
    pub fn register(
        &mut self,
        name: &str,
        f: impl Fn(&NativeContext) -> Result<(), NativeError> + Send + Sync + 'static,
    ) -> &mut Self {
        if self.functions.insert(name.to_string(), Box::new(f)).is_some() {
            tracing::warn!("native function {} registered twice", name);
        }
        self
    }

    /// Registered function names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }

    /// Returns true if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Run the function `name` on behalf of `test`.
    pub fn run(&self, test: &str, name: &str) -> Result<(), NativeError> {
        let f = self
            .functions
            .get(name)
            .ok_or_else(|| NativeError::UnknownFunction(name.to_string()))?;
        let ctx = NativeContext {
            test: test.to_string(),
            function: name.to_string(),
        };
        tracing::debug!("running {} for {}", name, test);
        f(&ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn run_dispatches_by_name() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = NativeRegistry::new();
        {
            let calls = Arc::clone(&calls);
            registry.register("Count", move |ctx| {
                assert_eq!(ctx.test, "basic");
                assert_eq!(ctx.function, "Count");
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        registry.register("Fail", |ctx| Err(NativeError::failed(&ctx.function, "nope")));

        registry.run("basic", "Count").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let err = registry.run("basic", "Fail").unwrap_err();
        assert_eq!(err.to_string(), "Fail failed: nope");
    }

    #[test]
    fn unknown_function_is_an_error() {
        let registry = NativeRegistry::new();
        let err = registry.run("basic", "Missing").unwrap_err();
        assert!(matches!(err, NativeError::UnknownFunction(ref n) if n == "Missing"));
    }

    #[test]
    fn names_are_sorted() {
        let mut registry = NativeRegistry::new();
        registry
            .register("b", |_| Ok(()))
            .register("a", |_| Ok(()));
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
        assert!(registry.contains("a"));
        assert!(!registry.contains("c"));
    }
}
