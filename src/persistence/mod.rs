//! Durable execution records
//!
//! Records are saved after every state transition. Terminal records are
//! never overwritten. [`ExecutionStore::recover_interrupted`] is the
//! crash-recovery sweep: any record still marked in flight whose owner is
//! gone is failed with [`INTERRUPTED_REASON`].

mod db;
pub mod models;

pub use db::SqliteExecutionStore;
pub use models::{ExecutionState, ExecutionStatus};

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::{EngineError, Result};

pub const INTERRUPTED_REASON: &str = "interrupted by restart";

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert or update a record. Fails with `TerminalStateMutation` if the
    /// stored record is already terminal.
    async fn save(&self, state: &ExecutionState) -> Result<()>;

    async fn load(&self, id: &str) -> Result<Option<ExecutionState>>;

    async fn delete(&self, id: &str) -> Result<bool>;

    /// All records, most recently updated first
    async fn list(&self) -> Result<Vec<ExecutionState>>;

    async fn list_by_status(&self, statuses: &[ExecutionStatus]) -> Result<Vec<ExecutionState>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|state| statuses.contains(&state.status))
            .collect())
    }

    /// Fail every in-flight record whose executor is not alive. Liveness is
    /// checked after listing, so an execution registered as live before it
    /// first persisted is never swept. Returns the ids that were failed.
    async fn recover_interrupted(
        &self,
        is_live: &(dyn for<'a> Fn(&'a str) -> bool + Send + Sync),
    ) -> Result<Vec<String>> {
        let mut recovered = Vec::new();

        for mut state in self.list_by_status(&ExecutionStatus::IN_FLIGHT).await? {
            if is_live(&state.id) {
                continue;
            }
            state.fail(INTERRUPTED_REASON);
            match self.save(&state).await {
                Ok(()) => {
                    tracing::warn!(execution_id = %state.id, "recovered interrupted execution");
                    recovered.push(state.id);
                }
                // Finished between the listing and the save
                Err(EngineError::TerminalStateMutation(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(recovered)
    }
}

/// Store kept in process memory. Records do not survive a restart.
#[derive(Default)]
pub struct MemoryExecutionStore {
    records: RwLock<HashMap<String, ExecutionState>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn save(&self, state: &ExecutionState) -> Result<()> {
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(&state.id) {
            if existing.is_terminal() {
                return Err(EngineError::TerminalStateMutation(state.id.clone()));
            }
        }
        records.insert(state.id.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<ExecutionState>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.records.write().await.remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<ExecutionState>> {
        let mut states: Vec<_> = self.records.read().await.values().cloned().collect();
        states.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(states)
    }
}
