//! Ordered release actions with first-error-wins reporting.
//!
//! Every successful acquisition pushes its release action onto a
//! [`CleanupStack`]. [`CleanupStack::unwind`] then drains the stack in
//! reverse push order, running every action even when an earlier one
//! failed. Failures go into a [`FirstError`], which keeps only the
//! chronologically first error and logs the rest.

use std::fmt;

/// Accumulator that keeps the first error it is given.
///
/// Forward-path failures and release failures both go through
/// [`record`](Self::record); whichever happens first becomes the result of
/// the whole operation.
#[derive(Debug)]
pub struct FirstError<E> {
    first: Option<E>,
}

impl<E> Default for FirstError<E> {
    fn default() -> Self {
        Self { first: None }
    }
}

impl<E: fmt::Display> FirstError<E> {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `err` if no error has been recorded yet.
    ///
    /// Returns `true` if `err` became the held error. A later error is
    /// logged at `warn` and dropped.
    pub fn record(&mut self, err: E) -> bool {
        if let Some(first) = &self.first {
            tracing::warn!("suppressed error: {} (first error: {})", err, first);
            return false;
        }
        self.first = Some(err);
        true
    }

    /// Returns true if an error has been recorded.
    pub fn is_set(&self) -> bool {
        self.first.is_some()
    }

    /// The held error, if any.
    pub fn get(&self) -> Option<&E> {
        self.first.as_ref()
    }

    /// Convert into the operation's result.
    pub fn into_result(self) -> Result<(), E> {
        match self.first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

type ReleaseFn<'a, E> = Box<dyn FnOnce() -> Result<(), E> + 'a>;

struct Release<'a, E> {
    label: String,
    action: ReleaseFn<'a, E>,
}

/// LIFO stack of release actions.
///
/// Each action runs exactly once: either during [`unwind`](Self::unwind),
/// or, if the stack is dropped without being unwound, from `Drop` with
/// errors logged.
pub struct CleanupStack<'a, E: fmt::Display> {
    actions: Vec<Release<'a, E>>,
}

impl<'a, E: fmt::Display> Default for CleanupStack<'a, E> {
    fn default() -> Self {
        Self {
            actions: Vec::new(),
        }
    }
}

impl<'a, E: fmt::Display> fmt::Debug for CleanupStack<'a, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupStack")
            .field("pending", &self.labels())
            .finish()
    }
}

impl<'a, E: fmt::Display> CleanupStack<'a, E> {
    /// Create an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push the release action for a resource that was just acquired.
    pub fn push(
        &mut self,
        label: impl Into<String>,
        action: impl FnOnce() -> Result<(), E> + 'a,
    ) {
        let label = label.into();
        tracing::trace!("cleanup: registered {}", label);
        self.actions.push(Release {
            label,
            action: Box::new(action),
        });
    }

    /// Number of pending release actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns true if no release action is pending.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Labels of pending release actions, in push order.
    pub fn labels(&self) -> Vec<&str> {
        self.actions.iter().map(|r| r.label.as_str()).collect()
    }

    /// Run every pending action in reverse push order.
    ///
    /// Failures are recorded into `errors`; they never stop the unwind.
    /// Returns the labels of the actions that ran, in execution order.
    pub fn unwind(mut self, errors: &mut FirstError<E>) -> Vec<String> {
        let mut ran = Vec::with_capacity(self.actions.len());
        while let Some(release) = self.actions.pop() {
            tracing::debug!("cleanup: {}", release.label);
            if let Err(err) = (release.action)() {
                errors.record(err);
            }
            ran.push(release.label);
        }
        ran
    }
}

impl<'a, E: fmt::Display> Drop for CleanupStack<'a, E> {
    fn drop(&mut self) {
        while let Some(release) = self.actions.pop() {
            if let Err(err) = (release.action)() {
                tracing::warn!("cleanup: {} failed: {}", release.label, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn first_error_keeps_earliest() {
        let mut errors = FirstError::new();
        assert!(!errors.is_set());
        assert!(errors.record("first".to_string()));
        assert!(!errors.record("second".to_string()));
        assert_eq!(errors.get().map(String::as_str), Some("first"));
        assert_eq!(errors.into_result(), Err("first".to_string()));
    }

    #[test]
    fn empty_accumulator_is_ok() {
        let errors: FirstError<String> = FirstError::new();
        assert_eq!(errors.into_result(), Ok(()));
    }

    #[test]
    fn unwind_runs_in_reverse_order() {
        let log = RefCell::new(Vec::new());
        let mut stack: CleanupStack<'_, String> = CleanupStack::new();
        for name in ["a", "b", "c"] {
            let log = &log;
            stack.push(name, move || {
                log.borrow_mut().push(name);
                Ok(())
            });
        }
        assert_eq!(stack.labels(), vec!["a", "b", "c"]);

        let mut errors = FirstError::new();
        let ran = stack.unwind(&mut errors);

        assert_eq!(ran, vec!["c", "b", "a"]);
        assert_eq!(*log.borrow(), vec!["c", "b", "a"]);
        assert!(!errors.is_set());
    }

    #[test]
    fn failing_release_does_not_stop_unwind() {
        let log = RefCell::new(Vec::new());
        let mut stack: CleanupStack<'_, String> = CleanupStack::new();
        stack.push("a", || {
            log.borrow_mut().push("a");
            Err("a failed".to_string())
        });
        stack.push("b", || {
            log.borrow_mut().push("b");
            Err("b failed".to_string())
        });
        stack.push("c", || {
            log.borrow_mut().push("c");
            Ok(())
        });

        let mut errors = FirstError::new();
        stack.unwind(&mut errors);

        assert_eq!(*log.borrow(), vec!["c", "b", "a"]);
        // b failed first chronologically
        assert_eq!(errors.into_result(), Err("b failed".to_string()));
    }

    #[test]
    fn forward_error_beats_release_errors() {
        let mut errors = FirstError::new();
        errors.record("forward".to_string());

        let ran_release = RefCell::new(false);
        let mut stack: CleanupStack<'_, String> = CleanupStack::new();
        stack.push("release", || {
            *ran_release.borrow_mut() = true;
            Err("release failed".to_string())
        });
        stack.unwind(&mut errors);

        assert!(*ran_release.borrow());
        assert_eq!(errors.into_result(), Err("forward".to_string()));
    }

    #[test]
    fn drop_runs_pending_actions_once() {
        let count = RefCell::new(0);
        {
            let mut stack: CleanupStack<'_, String> = CleanupStack::new();
            stack.push("x", || {
                *count.borrow_mut() += 1;
                Ok(())
            });
            stack.push("y", || {
                *count.borrow_mut() += 1;
                Err("ignored".to_string())
            });
            assert_eq!(stack.len(), 2);
        }
        assert_eq!(*count.borrow(), 2);
    }

    #[test]
    fn unwound_stack_does_not_rerun_on_drop() {
        let count = RefCell::new(0);
        let mut stack: CleanupStack<'_, String> = CleanupStack::new();
        stack.push("x", || {
            *count.borrow_mut() += 1;
            Ok(())
        });
        let mut errors = FirstError::new();
        stack.unwind(&mut errors);
        assert_eq!(*count.borrow(), 1);
    }
}
