use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ProvisionError, Result};
use crate::models::Host;
use crate::os::OsFamily;
use crate::progress::{LogLevel, RunContext};
use crate::remote::{RemoteExecutor, RemoteSession};
use crate::task_helpers::{close_session, open_session, resolve_os};
use crate::task_types::{StepResult, StepSnapshot, StepState};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub expect: Option<String>,
    #[serde(default)]
    pub fail: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OsTasks {
    #[serde(default)]
    tasks: Vec<TaskSpec>,
}

/// Ordered task lists keyed by OS family (`ubuntu`, `centos`).
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    by_os: HashMap<String, OsTasks>,
}

impl TaskDescriptor {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let by_os = serde_yaml::from_str::<HashMap<String, OsTasks>>(text)
            .map_err(|error| ProvisionError::Descriptor(error.to_string()))?;
        Ok(Self { by_os })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|error| {
            ProvisionError::Descriptor(format!("Failed to read `{}`: {error}", path.display()))
        })?;
        Self::from_yaml(&text)
    }

    pub fn tasks_for(&self, family: OsFamily) -> Result<&[TaskSpec]> {
        self.by_os
            .get(family.descriptor_key())
            .map(|entry| entry.tasks.as_slice())
            .ok_or_else(|| {
                ProvisionError::Descriptor(format!(
                    "no tasks defined for `{}`",
                    family.descriptor_key()
                ))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Collect all output, then record the step once.
    Collect,
    /// Update the step record after every output chunk.
    Stream,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclarativeTask {
    pub id: String,
    pub name: String,
    pub command: String,
    pub expect: Option<String>,
    pub fail: Option<String>,
    pub output: String,
    pub error: String,
    pub state: Option<StepState>,
}

impl DeclarativeTask {
    pub fn new(spec: &TaskSpec) -> Self {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(8);
        Self {
            id,
            name: spec.name.clone(),
            command: spec.command.clone(),
            expect: spec.expect.clone(),
            fail: spec.fail.clone(),
            output: String::new(),
            error: String::new(),
            state: None,
        }
    }

    pub fn snapshot(&self) -> StepSnapshot {
        StepSnapshot {
            id: self.id.clone(),
            action: self.command.clone(),
            output: self.output.clone(),
            error: self.error.clone(),
            state: self.state,
        }
    }

    /// The finished result, once the task reached a terminal state.
    pub fn result(&self) -> Option<StepResult> {
        self.state
            .filter(|state| state.is_terminal())
            .map(|state| StepResult {
                stdout: self.output.clone(),
                stderr: self.error.clone(),
                state,
            })
    }

    fn finish(&mut self, stdout: String, stderr: String) {
        let result =
            StepResult::from_output(stdout, stderr, self.expect.as_deref(), self.fail.as_deref());
        self.output = result.stdout;
        self.error = result.stderr;
        self.state = Some(result.state);
    }

    pub fn execute(&mut self, context: &RunContext, session: &mut dyn RemoteSession) -> StepState {
        match session.run(&self.command) {
            Ok(result) => self.finish(result.stdout, result.stderr),
            Err(error) => {
                self.error = error.to_string();
                self.state = Some(StepState::Fail);
            }
        }
        context.step_started(self.snapshot());
        self.state.unwrap_or(StepState::Fail)
    }

    pub fn execute_streaming(
        &mut self,
        context: &RunContext,
        session: &mut dyn RemoteSession,
    ) -> StepState {
        self.state = Some(StepState::Running);
        context.step_started(self.snapshot());

        match session.run_streaming(&self.command) {
            Ok(chunks) => {
                for chunk in chunks {
                    match chunk {
                        Ok(text) => {
                            self.output.push_str(&text);
                            context.step_updated(self.snapshot());
                        }
                        Err(error) => {
                            self.error.push_str(&error.to_string());
                            break;
                        }
                    }
                }
                let stdout = std::mem::take(&mut self.output);
                let stderr = std::mem::take(&mut self.error);
                self.finish(stdout, stderr);
            }
            Err(error) => {
                self.error = error.to_string();
                self.state = Some(StepState::Fail);
            }
        }

        context.step_updated(self.snapshot());
        self.state.unwrap_or(StepState::Fail)
    }
}

pub struct DeclarativeTaskRunner<'a> {
    context: &'a RunContext,
    executor: &'a dyn RemoteExecutor,
}

impl<'a> DeclarativeTaskRunner<'a> {
    pub fn new(context: &'a RunContext, executor: &'a dyn RemoteExecutor) -> Self {
        Self { context, executor }
    }

    /// Run the descriptor's tasks for the host's OS in order. Every task runs
    /// regardless of earlier states.
    pub fn run(
        &self,
        descriptor: &TaskDescriptor,
        host: &Host,
        mode: ExecutionMode,
    ) -> Result<Vec<DeclarativeTask>> {
        let mut session = open_session(self.context, self.executor, host)?;
        let result = self.run_with(session.as_mut(), descriptor, host, mode);
        close_session(self.context, host, session);
        result
    }

    fn run_with(
        &self,
        session: &mut dyn RemoteSession,
        descriptor: &TaskDescriptor,
        host: &Host,
        mode: ExecutionMode,
    ) -> Result<Vec<DeclarativeTask>> {
        let os = resolve_os(session, host)?;
        let specs = descriptor.tasks_for(os.family)?;
        self.context.host(
            host.id,
            LogLevel::Info,
            format!("Running {} task(s) for {}", specs.len(), os.label()),
        );

        let mut tasks = specs.iter().map(DeclarativeTask::new).collect::<Vec<_>>();
        for task in &mut tasks {
            match mode {
                ExecutionMode::Collect => task.execute(self.context, session),
                ExecutionMode::Stream => task.execute_streaming(self.context, session),
            };
        }
        Ok(tasks)
    }
}
