//! Task engine
//!
//! A command is a fixed, ordered [`Tasks`] list. Each [`Task`] has an
//! optional predicate deciding whether it applies to the current state and
//! its own attempt budget. The first task that fails for good aborts the run.

pub mod nodes;
pub mod plans;

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::info;

use keel_common::retry::retry_with_backoff_if;
use keel_common::{Error, Result};

use crate::state::State;

/// Body of a task
pub type TaskFn = Arc<dyn Fn(State) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Decides whether a task applies
pub type Predicate = Arc<dyn Fn(&State) -> bool + Send + Sync>;

/// One named operation
#[derive(Clone)]
pub struct Task {
    operation: String,
    description: Option<String>,
    run: TaskFn,
    predicate: Option<Predicate>,
    retries: u32,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("operation", &self.operation)
            .field("retries", &self.retries)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

impl Task {
    /// A task running `f` under the default attempt budget
    pub fn new<F, Fut>(operation: impl Into<String>, f: F) -> Self
    where
        F: Fn(State) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            operation: operation.into(),
            description: None,
            run: Arc::new(move |state| f(state).boxed()),
            predicate: None,
            retries: 0,
        }
    }

    /// Only run when `predicate` holds
    pub fn when<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&State) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Attempt budget (0 keeps the run's budget)
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Text shown by `keel plan` (defaults to the operation name)
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Operation name errors are annotated with
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Human readable description
    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or(&self.operation)
    }

    /// The predicate holds (or there is none)
    pub fn is_active(&self, state: &State) -> bool {
        self.predicate.as_ref().map(|p| p(state)).unwrap_or(true)
    }

    /// Run with backoff; the final error names the operation
    pub async fn run(&self, state: &State) -> Result<()> {
        let config = state.options.backoff.attempts(self.retries);
        retry_with_backoff_if(
            &config,
            &self.operation,
            &state.cancel,
            |e: &Error| e.is_retryable(),
            || (self.run)(state.clone()),
        )
        .await
        .map_err(|e| {
            if state.cancel.is_cancelled() {
                Error::Cancelled.with_operation(&self.operation)
            } else {
                e.with_operation(&self.operation)
            }
        })
    }
}

/// An ordered plan
#[derive(Clone, Debug, Default)]
pub struct Tasks {
    tasks: Vec<Task>,
}

impl From<Vec<Task>> for Tasks {
    fn from(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }
}

impl Tasks {
    /// An empty plan
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one task at the end
    pub fn push(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// Add `other` at the end
    pub fn append(mut self, other: Tasks) -> Self {
        self.tasks.extend(other.tasks);
        self
    }

    /// Add `other` at the front
    pub fn prepend(self, other: Tasks) -> Self {
        other.append(self)
    }

    /// Number of tasks, active or not
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// No task at all
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Operation names in order
    pub fn operations(&self) -> Vec<&str> {
        self.tasks.iter().map(Task::operation).collect()
    }

    /// Descriptions of the tasks [`Tasks::run`] would execute against `state`
    pub fn descriptions(&self, state: &State) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| t.is_active(state))
            .map(|t| t.description().to_string())
            .collect()
    }

    /// Run every active task in order, stopping at the first failure
    pub async fn run(&self, state: &State) -> Result<()> {
        for task in &self.tasks {
            if !task.is_active(state) {
                continue;
            }
            if state.cancel.is_cancelled() {
                return Err(Error::Cancelled.with_operation(task.operation()));
            }
            info!(operation = %task.operation(), "{}", task.description());
            task.run(state).await?;
        }
        Ok(())
    }
}
