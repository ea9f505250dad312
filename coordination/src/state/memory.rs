//! In-process run store.
//!
//! Used by tests and single-node deployments. The atomic procedures hold the
//! map lock for their whole read-merge-write, which gives them the same
//! serialization a row lock gives the Postgres implementation.
//!
//! [`StoreFaults`] lets tests switch the procedures off (forcing the CAS
//! fallback), inject version conflicts, take the store down, and yield
//! between a read and the following write so concurrent writers interleave.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use super::store::{merge_round, merge_step, RunStore, StepMerge, StoreError, StoreResult};
use super::types::{
    AppendOutcome, DebateMerge, DebateSide, Message, RunId, RunPayload, StepChange, StepUpdate,
    VersionToken, VersionedRun,
};
use crate::phases::PhaseId;

struct StoredRun {
    payload: RunPayload,
    version: VersionToken,
    messages: Vec<Message>,
    fingerprints: HashSet<String>,
}

/// Fault switches for exercising the fallback and contention paths.
#[derive(Debug, Default)]
pub struct StoreFaults {
    procedures_down: AtomicBool,
    store_down: AtomicBool,
    interleave: AtomicBool,
    forced_conflicts: AtomicU32,
    conditional_writes: AtomicU64,
    procedure_calls: AtomicU64,
}

impl StoreFaults {
    /// Make both atomic procedures report [`StoreError::ProcedureUnavailable`].
    pub fn set_procedures_available(&self, available: bool) {
        self.procedures_down.store(!available, Ordering::SeqCst);
    }

    /// Make every call fail with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.store_down.store(!available, Ordering::SeqCst);
    }

    /// Yield to the scheduler after each read.
    pub fn set_interleaving(&self, on: bool) {
        self.interleave.store(on, Ordering::SeqCst);
    }

    /// The next `n` conditional writes report zero rows regardless of version.
    pub fn force_conflicts(&self, n: u32) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    /// Conditional writes attempted so far (including conflicts).
    pub fn conditional_write_count(&self) -> u64 {
        self.conditional_writes.load(Ordering::SeqCst)
    }

    /// Atomic procedure calls that ran.
    pub fn procedure_call_count(&self) -> u64 {
        self.procedure_calls.load(Ordering::SeqCst)
    }

    fn take_forced_conflict(&self) -> bool {
        self.forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Shared reference to an in-memory store
pub type SharedInMemoryStore = Arc<InMemoryStore>;

/// Mutex-guarded map of runs.
#[derive(Default)]
pub struct InMemoryStore {
    runs: Mutex<HashMap<RunId, StoredRun>>,
    faults: StoreFaults,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedInMemoryStore {
        Arc::new(self)
    }

    pub fn faults(&self) -> &StoreFaults {
        &self.faults
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, HashMap<RunId, StoredRun>>> {
        if self.faults.store_down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }
        self.runs.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn check_procedures(&self) -> StoreResult<()> {
        if self.faults.procedures_down.load(Ordering::SeqCst) {
            return Err(StoreError::ProcedureUnavailable(
                "procedures not installed".to_string(),
            ));
        }
        self.faults.procedure_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn entry<'a>(
    runs: &'a mut HashMap<RunId, StoredRun>,
    run_id: &str,
) -> StoreResult<&'a mut StoredRun> {
    runs.get_mut(run_id)
        .ok_or_else(|| StoreError::NotFound(run_id.to_string()))
}

#[async_trait]
impl RunStore for InMemoryStore {
    async fn insert_run(&self, run_id: &str, payload: &RunPayload) -> StoreResult<VersionToken> {
        let mut runs = self.lock()?;
        if runs.contains_key(run_id) {
            return Err(StoreError::AlreadyExists(run_id.to_string()));
        }
        let version = VersionToken::initial();
        runs.insert(
            run_id.to_string(),
            StoredRun {
                payload: payload.clone(),
                version,
                messages: Vec::new(),
                fingerprints: HashSet::new(),
            },
        );
        debug!(run_id, %version, "Inserted run");
        Ok(version)
    }

    async fn read_run(&self, run_id: &str) -> StoreResult<VersionedRun> {
        let snapshot = {
            let mut runs = self.lock()?;
            let run = entry(&mut runs, run_id)?;
            VersionedRun {
                run_id: run_id.to_string(),
                payload: run.payload.clone(),
                version: run.version,
            }
        };
        if self.faults.interleave.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        Ok(snapshot)
    }

    async fn conditional_write(
        &self,
        run_id: &str,
        payload: &RunPayload,
        expected: VersionToken,
    ) -> StoreResult<u64> {
        let mut runs = self.lock()?;
        self.faults.conditional_writes.fetch_add(1, Ordering::SeqCst);
        let run = entry(&mut runs, run_id)?;
        if self.faults.take_forced_conflict() || run.version != expected {
            return Ok(0);
        }
        run.payload = payload.clone();
        run.version = run.version.next();
        Ok(1)
    }

    async fn atomic_merge_step_status(
        &self,
        run_id: &str,
        phase: PhaseId,
        agent: &str,
        update: &StepUpdate,
    ) -> StoreResult<StepMerge> {
        self.check_procedures()?;
        let mut runs = self.lock()?;
        let run = entry(&mut runs, run_id)?;
        let change = merge_step(&mut run.payload, phase, agent, update, Utc::now())?;
        if change == StepChange::Applied {
            run.version = run.version.next();
        }
        Ok(StepMerge {
            change,
            version: run.version,
        })
    }

    async fn atomic_merge_debate_round(
        &self,
        run_id: &str,
        round: u32,
        side: DebateSide,
        text: &str,
        points: &[String],
    ) -> StoreResult<DebateMerge> {
        self.check_procedures()?;
        let mut runs = self.lock()?;
        let run = entry(&mut runs, run_id)?;
        let merged = merge_round(&mut run.payload, round, side, text, points, Utc::now());
        if merged.applied {
            run.version = run.version.next();
        }
        Ok(merged)
    }

    async fn append_message(&self, run_id: &str, message: &Message) -> StoreResult<AppendOutcome> {
        let mut runs = self.lock()?;
        let run = entry(&mut runs, run_id)?;
        if !message.fingerprint.is_empty() && !run.fingerprints.insert(message.fingerprint.clone())
        {
            return Ok(AppendOutcome::Duplicate);
        }
        run.messages.push(message.clone());
        run.version = run.version.next();
        Ok(AppendOutcome::Appended {
            seq: run.messages.len() as u64,
        })
    }

    async fn read_messages(&self, run_id: &str) -> StoreResult<Vec<Message>> {
        let mut runs = self.lock()?;
        Ok(entry(&mut runs, run_id)?.messages.clone())
    }
}
