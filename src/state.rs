use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;

use crate::config::ConsoleConfig;
use crate::db::Database;
use crate::models::{HostOutcome, RunResult, RunSummary};

#[derive(Clone)]
pub struct AppState {
    pub database: Arc<Mutex<Database>>,
    pub runs: RunRegistry,
    pub config: Arc<ConsoleConfig>,
}

impl AppState {
    pub fn new(database: Database, config: ConsoleConfig) -> Self {
        Self {
            database: Arc::new(Mutex::new(database)),
            runs: RunRegistry::default(),
            config: Arc::new(config),
        }
    }
}

/// Live runs keyed by run id, for pollers that want a result before it is
/// persisted.
#[derive(Clone, Default)]
pub struct RunRegistry {
    runs: Arc<AsyncMutex<HashMap<String, RunHandle>>>,
}

impl RunRegistry {
    pub async fn register(&self, summary: RunSummary) -> RunHandle {
        let handle = RunHandle::new(summary);
        self.runs
            .lock()
            .await
            .insert(handle.run_id.clone(), handle.clone());
        handle
    }

    pub async fn get(&self, run_id: &str) -> Option<RunHandle> {
        self.runs.lock().await.get(run_id).cloned()
    }
}

#[derive(Clone)]
pub struct RunHandle {
    pub run_id: String,
    pub data: Arc<AsyncMutex<RunData>>,
}

#[derive(Clone)]
pub struct RunData {
    pub summary: RunSummary,
    pub items: Vec<HostOutcome>,
}

impl RunHandle {
    fn new(summary: RunSummary) -> Self {
        Self {
            run_id: summary.run_id.clone(),
            data: Arc::new(AsyncMutex::new(RunData {
                summary,
                items: Vec::new(),
            })),
        }
    }

    /// Record outcomes from blocking pipeline code.
    pub fn record_blocking(&self, outcomes: &[HostOutcome]) {
        self.data.blocking_lock().items.extend_from_slice(outcomes);
    }

    pub async fn snapshot(&self) -> RunResult {
        let data = self.data.lock().await;
        RunResult {
            summary: data.summary.clone(),
            items: data.items.clone(),
        }
    }
}
