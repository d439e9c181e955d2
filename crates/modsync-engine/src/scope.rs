//! Cancellation scopes and interrupt routing
//!
//! An interrupt is delivered to whichever scope is innermost when it arrives.
//! Ordinary phases cancel the run gracefully. The deletion phase pushes a
//! [`InterruptPolicy::HardAbort`] scope instead, which turns the interrupt into an
//! abort flag the deleting loop checks between files.

use modsync_types::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What an interrupt does while a scope is innermost
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptPolicy {
    /// Cancel the run cooperatively
    Graceful,
    /// Abort the scope's work with a fault
    HardAbort,
}

/// What an interrupt actually did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// The root token was cancelled
    Cancelled,
    /// The named hard-abort scope was flagged
    Aborted(String),
}

#[derive(Debug)]
struct ScopeEntry {
    id: u64,
    name: String,
    policy: InterruptPolicy,
    aborted: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct StackState {
    entries: Vec<ScopeEntry>,
    next_id: u64,
}

/// Stack of active cancellation scopes
#[derive(Debug, Clone)]
pub struct CancelScopeStack {
    state: Arc<Mutex<StackState>>,
    root: CancellationToken,
}

impl CancelScopeStack {
    /// Create an empty stack; interrupts with no scope pushed cancel `root`
    pub fn new(root: CancellationToken) -> Self {
        Self {
            state: Arc::new(Mutex::new(StackState::default())),
            root,
        }
    }

    /// The run's root cancellation token
    pub fn root_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Enter a scope; it is left when the guard drops
    pub fn push(&self, name: impl Into<String>, policy: InterruptPolicy) -> ScopeGuard {
        let name = name.into();
        let aborted = Arc::new(AtomicBool::new(false));
        let id = {
            let mut state = self.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.entries.push(ScopeEntry {
                id,
                name: name.clone(),
                policy,
                aborted: Arc::clone(&aborted),
            });
            id
        };
        debug!("Entered scope '{}' ({:?})", name, policy);
        ScopeGuard {
            stack: self.clone(),
            id,
            name,
            aborted,
        }
    }

    /// Route an interrupt to the innermost scope
    pub fn interrupt(&self) -> InterruptOutcome {
        let aborted = self
            .lock()
            .entries
            .last()
            .filter(|entry| entry.policy == InterruptPolicy::HardAbort)
            .map(|entry| {
                entry.aborted.store(true, Ordering::SeqCst);
                entry.name.clone()
            });
        match aborted {
            Some(scope) => InterruptOutcome::Aborted(scope),
            None => {
                self.root.cancel();
                InterruptOutcome::Cancelled
            }
        }
    }

    /// Number of scopes currently pushed
    pub fn depth(&self) -> usize {
        self.lock().entries.len()
    }

    /// Name and policy of the innermost scope
    pub fn current(&self) -> Option<(String, InterruptPolicy)> {
        self.lock()
            .entries
            .last()
            .map(|entry| (entry.name.clone(), entry.policy))
    }

    /// Forward every Ctrl-C to [`CancelScopeStack::interrupt`] until the task is aborted
    pub fn spawn_interrupt_listener(&self) -> JoinHandle<()> {
        let stack = self.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                match stack.interrupt() {
                    InterruptOutcome::Cancelled => {
                        warn!("Interrupt received, finishing up and cleaning partial files");
                    }
                    InterruptOutcome::Aborted(scope) => {
                        warn!("Interrupt received during {}, aborting it", scope);
                    }
                }
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop(&self, id: u64) {
        let mut state = self.lock();
        if let Some(index) = state.entries.iter().position(|entry| entry.id == id) {
            state.entries.remove(index);
        }
    }
}

/// Keeps a scope pushed for as long as it lives
#[derive(Debug)]
pub struct ScopeGuard {
    stack: CancelScopeStack,
    id: u64,
    name: String,
    aborted: Arc<AtomicBool>,
}

impl ScopeGuard {
    /// Whether an interrupt aborted this scope
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Fail if an interrupt aborted this scope
    pub fn ensure_not_aborted(&self) -> Result<()> {
        if self.is_aborted() {
            Err(Error::internal(format!("{} was aborted", self.name)))
        } else {
            Ok(())
        }
    }

    /// Scope name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.stack.pop(self.id);
        debug!("Left scope '{}'", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_without_scope_cancels_root() {
        let root = CancellationToken::new();
        let stack = CancelScopeStack::new(root.clone());
        assert_eq!(stack.interrupt(), InterruptOutcome::Cancelled);
        assert!(root.is_cancelled());
    }

    #[test]
    fn test_hard_abort_scope_intercepts_interrupt() {
        let root = CancellationToken::new();
        let stack = CancelScopeStack::new(root.clone());
        let _download = stack.push("download", InterruptPolicy::Graceful);
        let deletion = stack.push("File deletion", InterruptPolicy::HardAbort);

        assert_eq!(
            stack.interrupt(),
            InterruptOutcome::Aborted("File deletion".to_string())
        );
        assert!(!root.is_cancelled());
        assert!(deletion.is_aborted());
        assert_eq!(
            deletion.ensure_not_aborted().unwrap_err().to_string(),
            "Internal consistency fault: File deletion was aborted"
        );
    }

    #[test]
    fn test_guards_pop_on_drop() {
        let root = CancellationToken::new();
        let stack = CancelScopeStack::new(root.clone());
        {
            let _scan = stack.push("scan", InterruptPolicy::Graceful);
            {
                let _deletion = stack.push("File deletion", InterruptPolicy::HardAbort);
                assert_eq!(stack.depth(), 2);
                assert_eq!(stack.current().unwrap().1, InterruptPolicy::HardAbort);
            }
            assert_eq!(stack.current().unwrap().0, "scan");
        }
        assert_eq!(stack.depth(), 0);

        stack.interrupt();
        assert!(root.is_cancelled());
    }

    #[test]
    fn test_scope_passes_until_interrupted() {
        let stack = CancelScopeStack::new(CancellationToken::new());
        let deletion = stack.push("File deletion", InterruptPolicy::HardAbort);
        tokio_test::assert_ok!(deletion.ensure_not_aborted());
        stack.interrupt();
        tokio_test::assert_err!(deletion.ensure_not_aborted());
    }

    #[test]
    fn test_out_of_order_drop() {
        let stack = CancelScopeStack::new(CancellationToken::new());
        let outer = stack.push("outer", InterruptPolicy::Graceful);
        let inner = stack.push("inner", InterruptPolicy::HardAbort);
        drop(outer);
        assert_eq!(stack.current().unwrap().0, "inner");
        drop(inner);
        assert_eq!(stack.depth(), 0);
    }
}
