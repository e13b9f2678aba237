//! Process-wide exploration state cache
//!
//! One `ExplorationState` per task, shared across workers and status
//! readers. A global lock protects the map's keyset; a per-task lock
//! serializes construction and the initial load, double-checked inside.
//! This closes the race where two requests for the same task both build
//! fresh state and one overwrites the other.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::collaborators::EvidenceGraph;
use crate::config::Settings;
use crate::error::CoreResult;
use crate::research::state::ExplorationState;
use crate::storage::Database;

/// Cache of per-task exploration states
pub struct StateRegistry {
    db: Database,
    settings: Arc<Settings>,
    graph: Arc<dyn EvidenceGraph>,
    states: tokio::sync::Mutex<HashMap<String, Arc<ExplorationState>>>,
    init_locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl StateRegistry {
    #[must_use]
    pub fn new(db: Database, settings: Arc<Settings>, graph: Arc<dyn EvidenceGraph>) -> Self {
        Self {
            db,
            settings,
            graph,
            states: tokio::sync::Mutex::new(HashMap::new()),
            init_locks: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Get the state for a task, constructing and loading it on first use.
    pub async fn get_or_load(&self, task_id: &str) -> CoreResult<Arc<ExplorationState>> {
        // Fast path: already cached.
        {
            let states = self.states.lock().await;
            if let Some(state) = states.get(task_id) {
                return Ok(Arc::clone(state));
            }
        }

        // Per-task construction lock, created under the global lock.
        let init_lock = {
            let mut locks = self.init_locks.lock().await;
            Arc::clone(
                locks
                    .entry(task_id.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        let _guard = init_lock.lock().await;

        // Double-check: another caller may have built it while we waited.
        {
            let states = self.states.lock().await;
            if let Some(state) = states.get(task_id) {
                return Ok(Arc::clone(state));
            }
        }

        let state = Arc::new(ExplorationState::new(
            task_id,
            self.db.clone(),
            Arc::clone(&self.settings),
            Arc::clone(&self.graph),
            true,
            None,
        ));
        state.load_state().await?;

        self.states
            .lock()
            .await
            .insert(task_id.to_string(), Arc::clone(&state));
        debug!(task_id, "Constructed exploration state");
        Ok(state)
    }

    /// Drop a task's cached state (or everything). Test support.
    pub async fn evict(&self, task_id: Option<&str>) {
        let mut states = self.states.lock().await;
        match task_id {
            Some(id) => {
                states.remove(id);
            }
            None => states.clear(),
        }
    }

    /// Cached state without loading
    pub async fn peek(&self, task_id: &str) -> Option<Arc<ExplorationState>> {
        self.states.lock().await.get(task_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::evidence_graph::SqliteEvidenceGraph;

    #[tokio::test]
    async fn concurrent_gets_share_one_state() {
        let db = Database::open_in_memory().await.expect("db");
        let registry = Arc::new(StateRegistry::new(
            db.clone(),
            Arc::new(Settings::default()),
            Arc::new(SqliteEvidenceGraph::new(db)),
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.get_or_load("t1").await.expect("state")
            }));
        }

        let mut states = Vec::new();
        for handle in handles {
            states.push(handle.await.expect("join"));
        }
        for pair in states.windows(2) {
            assert!(Arc::ptr_eq(&pair[0], &pair[1]));
        }
    }
}
