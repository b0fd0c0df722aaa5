use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use ulid::Ulid;

type Runs = HashMap<u64, HashMap<Ulid, CancellationToken>>;

/// Cancellation handles for running jobs, keyed by job id.
///
/// The same id can be running more than once, e.g. when a redelivered job
/// lands on a second processor; each run is tracked separately.
#[derive(Debug, Clone, Default)]
pub struct CancelRegistry(Arc<Mutex<Runs>>);

/// One registered run of a job.
#[derive(Debug)]
pub(crate) struct RunHandle {
    id: u64,
    run: Ulid,
    pub(crate) token: CancellationToken,
}

impl CancelRegistry {
    fn lock(&self) -> MutexGuard<'_, Runs> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask every run of job `id` to stop. Returns `false` if it is not running here.
    pub fn cancel(&self, id: u64) -> bool {
        match self.lock().get(&id) {
            Some(runs) if !runs.is_empty() => {
                tracing::info!(id, runs = runs.len(), "Cancel requested");
                runs.values().for_each(CancellationToken::cancel);
                true
            }
            _ => false,
        }
    }

    /// Ids of the jobs currently running.
    pub fn running(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn register(&self, id: u64) -> RunHandle {
        let handle = RunHandle {
            id,
            run: Ulid::new(),
            token: CancellationToken::new(),
        };
        self.lock()
            .entry(id)
            .or_default()
            .insert(handle.run, handle.token.clone());
        handle
    }

    pub(crate) fn remove(&self, handle: &RunHandle) {
        let mut runs = self.lock();
        if let Some(by_run) = runs.get_mut(&handle.id) {
            by_run.remove(&handle.run);
            if by_run.is_empty() {
                runs.remove(&handle.id);
            }
        }
    }
}
