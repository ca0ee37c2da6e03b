use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::security::redact_text;
use crate::task_types::StepSnapshot;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Success,
    Warning,
    Fail,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressRecord {
    #[serde(rename_all = "camelCase")]
    Message {
        host_id: Option<u32>,
        level: LogLevel,
        message: String,
    },
    Step(StepSnapshot),
}

/// Destination for progress records, keyed by run id.
pub trait ProgressSink: Send + Sync {
    fn append(&self, run_id: &str, record: ProgressRecord);

    fn update(&self, run_id: &str, record: ProgressRecord);
}

/// Per-run handle passed to every component that reports progress.
#[derive(Clone)]
pub struct RunContext {
    run_id: String,
    sink: Arc<dyn ProgressSink>,
    secrets: Vec<String>,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            run_id: run_id.into(),
            sink,
            secrets: Vec::new(),
        }
    }

    pub fn with_secrets(mut self, secrets: Vec<String>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn log(&self, host_id: Option<u32>, level: LogLevel, message: impl AsRef<str>) {
        self.sink.append(
            &self.run_id,
            ProgressRecord::Message {
                host_id,
                level,
                message: redact_text(message.as_ref(), &self.secrets),
            },
        );
    }

    pub fn host(&self, host_id: u32, level: LogLevel, message: impl AsRef<str>) {
        self.log(Some(host_id), level, message);
    }

    pub fn step_started(&self, snapshot: StepSnapshot) {
        self.sink
            .append(&self.run_id, ProgressRecord::Step(self.redact_step(snapshot)));
    }

    pub fn step_updated(&self, snapshot: StepSnapshot) {
        self.sink
            .update(&self.run_id, ProgressRecord::Step(self.redact_step(snapshot)));
    }

    fn redact_step(&self, mut snapshot: StepSnapshot) -> StepSnapshot {
        snapshot.output = redact_text(&snapshot.output, &self.secrets);
        snapshot.error = redact_text(&snapshot.error, &self.secrets);
        snapshot
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn append(&self, run_id: &str, record: ProgressRecord) {
        match record {
            ProgressRecord::Message {
                host_id,
                level,
                message,
            } => match level {
                LogLevel::Debug => tracing::debug!(run_id, ?host_id, "{message}"),
                LogLevel::Info | LogLevel::Success => {
                    tracing::info!(run_id, ?host_id, ?level, "{message}")
                }
                LogLevel::Warning | LogLevel::Fail => {
                    tracing::warn!(run_id, ?host_id, ?level, "{message}")
                }
                LogLevel::Error => tracing::error!(run_id, ?host_id, "{message}"),
            },
            ProgressRecord::Step(step) => {
                tracing::debug!(run_id, step_id = %step.id, state = ?step.state, "{}", step.action)
            }
        }
    }

    fn update(&self, run_id: &str, record: ProgressRecord) {
        let finished = matches!(
            &record,
            ProgressRecord::Step(step) if step.state.map(|state| state.is_terminal()).unwrap_or(false)
        );
        if finished {
            self.append(run_id, record);
        }
    }
}

/// Keeps every record in memory. `update` replaces the step record with the
/// same id.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<BTreeMap<String, Vec<ProgressRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self, run_id: &str) -> Vec<ProgressRecord> {
        let records = self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        records.get(run_id).cloned().unwrap_or_default()
    }

    pub fn messages(&self, run_id: &str) -> Vec<(Option<u32>, LogLevel, String)> {
        self.records(run_id)
            .into_iter()
            .filter_map(|record| match record {
                ProgressRecord::Message {
                    host_id,
                    level,
                    message,
                } => Some((host_id, level, message)),
                ProgressRecord::Step(_) => None,
            })
            .collect()
    }

    pub fn steps(&self, run_id: &str) -> Vec<StepSnapshot> {
        self.records(run_id)
            .into_iter()
            .filter_map(|record| match record {
                ProgressRecord::Step(step) => Some(step),
                ProgressRecord::Message { .. } => None,
            })
            .collect()
    }
}

impl ProgressSink for MemorySink {
    fn append(&self, run_id: &str, record: ProgressRecord) {
        let mut records = self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        records.entry(run_id.to_string()).or_default().push(record);
    }

    fn update(&self, run_id: &str, record: ProgressRecord) {
        let mut records = self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entries = records.entry(run_id.to_string()).or_default();
        if let ProgressRecord::Step(step) = &record {
            let existing = entries.iter_mut().rev().find(|entry| {
                matches!(entry, ProgressRecord::Step(current) if current.id == step.id)
            });
            if let Some(existing) = existing {
                *existing = record;
                return;
            }
        }
        entries.push(record);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressAction {
    Append,
    Update,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub run_id: String,
    pub action: ProgressAction,
    pub record: ProgressRecord,
    pub timestamp: DateTime<Utc>,
}

/// Forwards records to a live viewer over an unbounded channel. Records are
/// dropped once the receiver is gone.
#[derive(Clone)]
pub struct ChannelProgressSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgressSink {
    pub fn new(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self { tx }
    }

    fn push(&self, run_id: &str, action: ProgressAction, record: ProgressRecord) {
        let _ = self.tx.send(ProgressEvent {
            run_id: run_id.to_string(),
            action,
            record,
            timestamp: Utc::now(),
        });
    }
}

impl ProgressSink for ChannelProgressSink {
    fn append(&self, run_id: &str, record: ProgressRecord) {
        self.push(run_id, ProgressAction::Append, record);
    }

    fn update(&self, run_id: &str, record: ProgressRecord) {
        self.push(run_id, ProgressAction::Update, record);
    }
}

pub struct FanoutSink {
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn ProgressSink>>) -> Self {
        Self { sinks }
    }
}

impl ProgressSink for FanoutSink {
    fn append(&self, run_id: &str, record: ProgressRecord) {
        for sink in &self.sinks {
            sink.append(run_id, record.clone());
        }
    }

    fn update(&self, run_id: &str, record: ProgressRecord) {
        for sink in &self.sinks {
            sink.update(run_id, record.clone());
        }
    }
}
