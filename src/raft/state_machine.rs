use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// The consumer of committed commands.
///
/// `apply` is called exactly once per committed command, in strictly
/// increasing index order. Replicated queue and CRDT logic live behind this
/// trait; the consensus core treats commands as opaque bytes.
pub trait StateMachine: Send + 'static {
    fn apply(&mut self, index: u64, command: &[u8]);

    /// Serialize everything applied so far.
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replace the current state with a snapshot produced by [`snapshot`](Self::snapshot).
    fn restore(&mut self, data: &[u8]) -> Result<()>;

    /// Highest index this consumer has durably applied. A consumer without
    /// its own persistence returns 0 and is rebuilt from snapshot and log.
    fn last_applied(&self) -> u64 {
        0
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AppliedCommands {
    entries: Vec<(u64, Vec<u8>)>,
    last_applied: u64,
}

#[derive(Debug, Default)]
struct Inner {
    applied: AppliedCommands,
    apply_calls: u64,
    restores: u64,
    durable: bool,
}

/// Records every applied command in memory.
///
/// Clones observe the same contents. With [`durable`](Self::durable) the
/// recorded state outlives a node restart and is reported through
/// [`StateMachine::last_applied`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryStateMachine {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn durable() -> Self {
        let machine = Self::default();
        machine.lock().durable = true;
        machine
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applied `(index, command)` pairs in order
    pub fn entries(&self) -> Vec<(u64, Vec<u8>)> {
        self.lock().applied.entries.clone()
    }

    /// Applied commands without their indices
    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.lock()
            .applied
            .entries
            .iter()
            .map(|(_, command)| command.clone())
            .collect()
    }

    pub fn applied_index(&self) -> u64 {
        self.lock().applied.last_applied
    }

    /// Number of `apply` calls, including any repeated ones
    pub fn apply_calls(&self) -> u64 {
        self.lock().apply_calls
    }

    /// Number of snapshot restores
    pub fn restores(&self) -> u64 {
        self.lock().restores
    }
}

impl StateMachine for InMemoryStateMachine {
    fn apply(&mut self, index: u64, command: &[u8]) {
        let mut inner = self.lock();
        inner.apply_calls += 1;
        if index <= inner.applied.last_applied {
            tracing::warn!(index, "Command applied twice");
            return;
        }
        inner.applied.entries.push((index, command.to_vec()));
        inner.applied.last_applied = index;
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.lock().applied)?)
    }

    fn restore(&mut self, data: &[u8]) -> Result<()> {
        let applied: AppliedCommands = serde_json::from_slice(data)?;
        let mut inner = self.lock();
        inner.applied = applied;
        inner.restores += 1;
        Ok(())
    }

    fn last_applied(&self) -> u64 {
        let inner = self.lock();
        if inner.durable {
            inner.applied.last_applied
        } else {
            0
        }
    }
}
