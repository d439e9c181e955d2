//! Runs a phase's worker pool and classifies how each worker ended

use crate::task::{TaskId, TaskOutcome, TaskStatus};
use modsync_types::{Error, ErrorKind, Result};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runs worker pools under a shared root cancellation token
///
/// Every phase gets a child of the root token. A fatal fault cancels the phase's
/// siblings without touching the root; cancelling the root (an interrupt) reaches
/// every phase.
#[derive(Debug, Clone)]
pub struct TaskOrchestrator {
    root: CancellationToken,
}

impl TaskOrchestrator {
    /// Create an orchestrator driven by `root`
    pub fn new(root: CancellationToken) -> Self {
        Self { root }
    }

    /// The root cancellation token
    pub fn root_token(&self) -> &CancellationToken {
        &self.root
    }

    /// Whether the run as a whole has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Spawn `workers` tasks built by `make` and wait for all of them
    ///
    /// Results are collected in completion order. A connection-level fault only
    /// takes its own worker down; any other fault cancels the remaining workers of
    /// the phase.
    pub async fn run_phase<F, Fut>(&self, name: &str, workers: usize, make: F) -> PhaseReport
    where
        F: Fn(usize, CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let started = Instant::now();
        let phase = self.root.child_token();
        let mut set = JoinSet::new();

        info!("Starting {} with {} worker(s)", name, workers);
        for worker in 0..workers {
            let task = make(worker, phase.clone());
            set.spawn(async move {
                let begun = Instant::now();
                let result = task.await;
                (worker, begun.elapsed(), result)
            });
        }

        let mut outcomes: Vec<Option<TaskOutcome>> = vec![None; workers];
        let mut faults = Vec::new();
        let mut aborted = false;

        while let Some(joined) = set.join_next().await {
            let (worker, elapsed, result) = match joined {
                Ok(finished) => finished,
                Err(join_error) => {
                    error!("A {} worker died: {}", name, join_error);
                    if join_error.is_panic() {
                        faults.push(Error::internal(format!("{name} worker panicked")));
                        aborted = true;
                        phase.cancel();
                    }
                    continue;
                }
            };

            let status = TaskStatus::from_result(&result);
            match result {
                Ok(()) => debug!("{} worker {} finished in {:?}", name, worker, elapsed),
                Err(error) if error.is_cancellation() => {
                    debug!("{} worker {} cancelled", name, worker);
                }
                Err(error) if error.kind() == ErrorKind::Connection => {
                    warn!("{} worker {} lost its connection: {}", name, worker, error);
                    faults.push(error);
                }
                Err(error) => {
                    error!("{} worker {} faulted: {}", name, worker, error);
                    faults.push(error);
                    if !phase.is_cancelled() {
                        aborted = true;
                        phase.cancel();
                    }
                }
            }
            if let Some(slot) = outcomes.get_mut(worker) {
                *slot = Some(TaskOutcome {
                    id: TaskId::new(),
                    worker,
                    status,
                    elapsed,
                });
            }
        }

        // Workers that never reported back panicked
        let outcomes = outcomes
            .into_iter()
            .enumerate()
            .map(|(worker, outcome)| {
                outcome.unwrap_or_else(|| TaskOutcome {
                    id: TaskId::new(),
                    worker,
                    status: TaskStatus::Faulted(ErrorKind::Internal),
                    elapsed: Duration::ZERO,
                })
            })
            .collect();

        let report = PhaseReport {
            name: name.to_string(),
            outcomes,
            faults,
            aborted,
            interrupted: self.root.is_cancelled(),
            elapsed: started.elapsed(),
        };
        info!("{}", report);
        report
    }
}

/// How a phase ended
#[derive(Debug)]
pub struct PhaseReport {
    /// Phase name, for logs
    pub name: String,
    /// One outcome per worker, in worker order
    pub outcomes: Vec<TaskOutcome>,
    /// Faults raised by the workers, in completion order
    pub faults: Vec<Error>,
    /// A fatal fault cancelled the remaining workers
    pub aborted: bool,
    /// The root token was cancelled while the phase ran
    pub interrupted: bool,
    /// Wall time of the phase
    pub elapsed: Duration,
}

impl PhaseReport {
    /// Number of workers that ran to completion
    pub fn succeeded(&self) -> usize {
        self.count(|status| *status == TaskStatus::Succeeded)
    }

    /// Number of workers that unwound on cancellation
    pub fn cancelled(&self) -> usize {
        self.count(|status| *status == TaskStatus::Cancelled)
    }

    /// Number of workers that faulted
    pub fn faulted(&self) -> usize {
        self.count(TaskStatus::is_faulted)
    }

    /// Every worker finished and nothing faulted
    pub fn is_clean(&self) -> bool {
        self.faults.is_empty() && self.succeeded() == self.outcomes.len()
    }

    /// Every worker faulted
    pub fn is_total_failure(&self) -> bool {
        !self.outcomes.is_empty() && self.faulted() == self.outcomes.len()
    }

    /// Some workers faulted, but not all of them
    pub fn is_partial(&self) -> bool {
        !self.faults.is_empty() && !self.is_total_failure()
    }

    /// All faults folded into one, if there were any
    pub fn into_fault(self) -> Option<Error> {
        if self.faults.is_empty() {
            None
        } else {
            Some(Error::aggregate(self.faults))
        }
    }

    fn count(&self, predicate: impl Fn(&TaskStatus) -> bool) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| predicate(&outcome.status))
            .count()
    }
}

impl std::fmt::Display for PhaseReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} finished in {:.1?}: {} succeeded, {} cancelled, {} faulted",
            self.name,
            self.elapsed,
            self.succeeded(),
            self.cancelled(),
            self.faulted()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn wait_for_cancel(token: CancellationToken) -> Result<()> {
        tokio::select! {
            () = token.cancelled() => Err(Error::Cancelled),
            () = tokio::time::sleep(Duration::from_secs(10)) => Ok(()),
        }
    }

    #[tokio::test]
    async fn test_all_workers_succeed() {
        let orchestrator = TaskOrchestrator::new(CancellationToken::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let report = orchestrator
            .run_phase("test", 4, |_, _| {
                let ran = Arc::clone(&ran);
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert_eq!(ran.load(Ordering::SeqCst), 4);
        assert!(report.is_clean());
        assert_eq!(report.outcomes.len(), 4);
        assert!(report.into_fault().is_none());
    }

    #[tokio::test]
    async fn test_connection_fault_spares_siblings() {
        let orchestrator = TaskOrchestrator::new(CancellationToken::new());
        let report = orchestrator
            .run_phase("download", 3, |worker, _token| async move {
                if worker == 0 {
                    Err(Error::connection("refused"))
                } else {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(())
                }
            })
            .await;

        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.faulted(), 1);
        assert!(report.is_partial());
        assert!(!report.aborted);
    }

    #[tokio::test]
    async fn test_fatal_fault_cancels_siblings() {
        let orchestrator = TaskOrchestrator::new(CancellationToken::new());
        let report = orchestrator
            .run_phase("download", 3, |worker, token| async move {
                if worker == 0 {
                    Err(Error::protocol(Some(550), "gone"))
                } else {
                    wait_for_cancel(token).await
                }
            })
            .await;

        assert!(report.aborted);
        assert_eq!(report.cancelled(), 2);
        assert_eq!(report.faulted(), 1);
        assert!(!report.is_total_failure());
        assert!(!report.interrupted);
        assert!(!orchestrator.is_cancelled());
    }

    #[tokio::test]
    async fn test_total_failure() {
        let orchestrator = TaskOrchestrator::new(CancellationToken::new());
        let report = orchestrator
            .run_phase("scan", 2, |_, _| async { Err(Error::connection("refused")) })
            .await;

        assert!(report.is_total_failure());
        let fault = report.into_fault().unwrap();
        assert_eq!(fault.faults().len(), 2);
    }

    #[tokio::test]
    async fn test_root_cancellation_reaches_workers() {
        let root = CancellationToken::new();
        let orchestrator = TaskOrchestrator::new(root.clone());
        let canceller = {
            let root = root.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                root.cancel();
            })
        };

        let report = orchestrator
            .run_phase("scan", 2, |_, token| wait_for_cancel(token))
            .await;
        canceller.await.unwrap();

        assert!(report.interrupted);
        assert_eq!(report.cancelled(), 2);
        assert!(report.faults.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_worker_is_an_internal_fault() {
        let orchestrator = TaskOrchestrator::new(CancellationToken::new());
        let report = orchestrator
            .run_phase("scan", 2, |worker, token| async move {
                if worker == 1 {
                    panic!("boom");
                }
                wait_for_cancel(token).await
            })
            .await;

        assert!(report.aborted);
        assert_eq!(report.outcomes[1].status, TaskStatus::Faulted(ErrorKind::Internal));
        assert_eq!(report.outcomes[0].status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_zero_workers() {
        let orchestrator = TaskOrchestrator::new(CancellationToken::new());
        let report = orchestrator
            .run_phase("download", 0, |_, _| async { Ok(()) })
            .await;
        assert!(report.is_clean());
        assert!(!report.is_total_failure());
    }
}
