//! Decision and lifecycle event reporting

use std::sync::Arc;

use parking_lot::Mutex;

use crate::decision::Decision;

/// Events emitted while deciding and running tasks
#[derive(Debug, Clone, PartialEq)]
pub enum DecisionEvent {
    /// A decision was made for a task
    Decided { task: String, decision: Decision },
    /// A run was recorded as started
    RunStarted {
        task: String,
        outputs_version: u64,
        array_size: Option<usize>,
    },
    /// A run was recorded as succeeded and its fingerprints committed
    RunSucceeded { task: String, outputs_version: u64 },
    /// A run was recorded as failed
    RunFailed { task: String, error: String },
    /// Every record of a scope was removed
    Cleared { scope: String, removed: usize },
}

/// Trait for receiving decision events
pub trait DecisionReporter: Send + Sync {
    fn report(&self, event: &DecisionEvent);
}

impl<R: DecisionReporter + ?Sized> DecisionReporter for Arc<R> {
    fn report(&self, event: &DecisionEvent) {
        (**self).report(event);
    }
}

/// Reporter that logs via tracing
pub struct TracingReporter;

impl DecisionReporter for TracingReporter {
    fn report(&self, event: &DecisionEvent) {
        match event {
            DecisionEvent::Decided { task, decision } if decision.should_run() => {
                tracing::info!("{} will run: {}", task, decision.reason());
            }
            DecisionEvent::Decided { task, decision } => {
                tracing::info!("{} skipped: {}", task, decision.reason());
            }
            DecisionEvent::RunStarted {
                task,
                outputs_version,
                array_size: Some(size),
            } => {
                tracing::info!("{} started as {} subtasks (v{})", task, size, outputs_version);
            }
            DecisionEvent::RunStarted {
                task,
                outputs_version,
                ..
            } => {
                tracing::info!("{} started (v{})", task, outputs_version);
            }
            DecisionEvent::RunSucceeded {
                task,
                outputs_version,
            } => {
                tracing::info!("{} succeeded (v{})", task, outputs_version);
            }
            DecisionEvent::RunFailed { task, error } => {
                tracing::error!("{} failed: {}", task, error);
            }
            DecisionEvent::Cleared { scope, removed } => {
                tracing::info!("Cleared {} task records from {}", removed, scope);
            }
        }
    }
}

/// Reporter that collects events for later inspection
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<DecisionEvent>>,
}

impl CollectingReporter {
    pub fn events(&self) -> Vec<DecisionEvent> {
        self.events.lock().clone()
    }
}

impl DecisionReporter for CollectingReporter {
    fn report(&self, event: &DecisionEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Registry of decision reporters
pub struct DecisionReporterRegistry {
    reporters: Vec<Arc<dyn DecisionReporter>>,
}

impl DecisionReporterRegistry {
    pub fn new() -> Self {
        Self {
            reporters: vec![Arc::new(TracingReporter)],
        }
    }

    pub fn empty() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn register<R: DecisionReporter + 'static>(&mut self, reporter: R) {
        self.reporters.push(Arc::new(reporter));
    }

    pub fn all(&self) -> &[Arc<dyn DecisionReporter>] {
        &self.reporters
    }

    /// Broadcast an event to all registered reporters
    pub fn broadcast(&self, event: &DecisionEvent) {
        for reporter in &self.reporters {
            reporter.report(event);
        }
    }
}

impl Default for DecisionReporterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DecisionReporterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionReporterRegistry")
            .field("reporters", &self.reporters.len())
            .finish()
    }
}
