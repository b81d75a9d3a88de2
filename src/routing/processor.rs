//! Drives one message through its procedure. No store access: the router
//! persists whatever comes out.

use std::error::Error as _;
use std::fmt::{self, Write as _};
use std::sync::Arc;

use courier_plugin::{PluginError, Procedure, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::message::Message;
use crate::plugins::PluginManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepErrorKind {
    UnknownProcedure,
    NextStep,
    MapInput,
    ResolveTask,
    RunTask,
    MapOutput,
    /// Shutdown was requested between two steps.
    Interrupted,
}

impl fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepErrorKind::UnknownProcedure => "Unknown procedure.",
            StepErrorKind::NextStep => "Error finding next step.",
            StepErrorKind::MapInput => "Error mapping input.",
            StepErrorKind::ResolveTask => "Error resolving task.",
            StepErrorKind::RunTask => "Error running task.",
            StepErrorKind::MapOutput => "Error mapping output.",
            StepErrorKind::Interrupted => "Processing interrupted.",
        })
    }
}

/// A failed step, with the message as it was before the step started.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct StepError {
    pub kind: StepErrorKind,
    pub task: Option<String>,
    #[source]
    pub source: Option<PluginError>,
    pub message: Box<Message>,
}

impl StepError {
    fn new(kind: StepErrorKind, message: &Message) -> Self {
        Self {
            kind,
            task: None,
            source: None,
            message: Box::new(message.clone()),
        }
    }

    fn caused_by(mut self, source: PluginError) -> Self {
        self.source = Some(source);
        self
    }

    fn in_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    /// Trace text stored with a failed message.
    pub fn render(&self) -> String {
        let m = &self.message;
        let mut out = String::new();
        let _ = writeln!(out, "{}", self.kind);
        let _ = writeln!(out, "  correlation id: {}", m.correlation_id);
        let _ = writeln!(out, "  procedure: {}", m.procedure);
        let _ = writeln!(out, "  previous step: {}", m.previous_step.as_deref().unwrap_or("-"));
        let _ = writeln!(out, "  next step: {}", m.next_step.as_deref().unwrap_or("-"));
        if let Some(task) = &self.task {
            let _ = writeln!(out, "  task: {task}");
        }
        let mut cause = self.source();
        while let Some(err) = cause {
            let _ = writeln!(out, "Caused by: {err}");
            cause = err.source();
        }
        out
    }
}

#[derive(Clone)]
pub struct Processor {
    plugins: Arc<PluginManager>,
}

impl Processor {
    pub fn new(plugins: Arc<PluginManager>) -> Self {
        Self { plugins }
    }

    fn procedure(&self, message: &Message) -> Result<Arc<dyn Procedure>, StepError> {
        self.plugins
            .procedure(&message.procedure)
            .ok_or_else(|| StepError::new(StepErrorKind::UnknownProcedure, message))
    }

    /// Asks the procedure for the step to run next and stores it in
    /// `next_step`.
    pub fn get_next_step(&self, message: &mut Message) -> Result<(), StepError> {
        let procedure = self.procedure(message)?;
        let next = procedure
            .get_next_step(
                &message.correlation_id,
                message.previous_step.as_deref(),
                message.next_step.as_deref(),
                &message.payload,
            )
            .map_err(|e| StepError::new(StepErrorKind::NextStep, message).caused_by(e))?;
        debug!(correlation_id = %message.correlation_id, next_step = ?next, "next step");
        message.next_step = next;
        Ok(())
    }

    /// Runs `next_step`: map input, run the task, map output into the
    /// payload, then advance the cursor. The message is untouched on error.
    pub fn run_step(&self, message: &mut Message) -> Result<(), StepError> {
        let procedure = self.procedure(message)?;
        let Some(step) = message.next_step.clone() else {
            return Err(StepError::new(StepErrorKind::NextStep, message)
                .caused_by(PluginError::other("message has no next step")));
        };
        let cid = message.correlation_id.as_str();
        let previous = message.previous_step.as_deref();

        let input = procedure
            .map_input(cid, &step, previous, &message.payload)
            .map_err(|e| {
                error!(correlation_id = cid, %step, "Error mapping input: {e}");
                StepError::new(StepErrorKind::MapInput, message).caused_by(e)
            })?;

        let task_id = procedure
            .task_plugin_info(&step)
            .map_err(|e| StepError::new(StepErrorKind::ResolveTask, message).caused_by(e))?
            .id;
        let task = self.plugins.task(&task_id).ok_or_else(|| {
            StepError::new(StepErrorKind::ResolveTask, message)
                .in_task(&task_id)
                .caused_by(PluginError::other(format!("task '{task_id}' is not loaded")))
        })?;

        let output = task.run(cid, input).map_err(|e| {
            error!(correlation_id = cid, %step, task = %task_id, "Error running task: {e}");
            StepError::new(StepErrorKind::RunTask, message)
                .in_task(&task_id)
                .caused_by(e)
        })?;

        let payload = procedure
            .map_output(cid, &step, previous, output)
            .map_err(|e| {
                error!(correlation_id = cid, %step, "Error mapping output: {e}");
                StepError::new(StepErrorKind::MapOutput, message)
                    .in_task(&task_id)
                    .caused_by(e)
            })?;

        info!(
            target: "message",
            correlation_id = %message.correlation_id,
            procedure = %message.procedure,
            step = %step,
            task = %task_id,
            payload = %json(&payload),
            "step finished"
        );
        message.payload = payload;
        message.previous_step = Some(step);
        message.next_step = None;
        Ok(())
    }

    /// Runs steps until the procedure has none left. Cancellation is only
    /// honoured between steps.
    pub fn process(&self, message: Message, cancel: &CancellationToken) -> Result<Message, StepError> {
        let mut message = message;
        self.get_next_step(&mut message)?;
        while message.next_step.is_some() {
            if cancel.is_cancelled() {
                return Err(StepError::new(StepErrorKind::Interrupted, &message));
            }
            self.run_step(&mut message)?;
            self.get_next_step(&mut message)?;
        }
        Ok(message)
    }
}
