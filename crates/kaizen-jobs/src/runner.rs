//! In-process task execution for the command line.

use std::time::Instant;

use tracing::{info, warn};

use kaizen_core::{Result, TaskSpec};

use crate::tasks::{run_task, TaskEnv};

/// Runs one task in the calling task. Follow-up work still goes to the
/// queue through the environment's dispatcher.
#[derive(Clone)]
pub struct InlineRunner {
    env: TaskEnv,
}

impl InlineRunner {
    pub fn new(env: TaskEnv) -> Self {
        Self { env }
    }

    /// Run `spec`. A missing prerequisite is logged and treated as done.
    pub async fn run(&self, spec: &TaskSpec) -> Result<()> {
        let start = Instant::now();
        match run_task(&self.env, spec).await {
            Ok(()) => {
                info!(
                    subsystem = "jobs",
                    component = "runner",
                    task = %spec.task,
                    args = ?spec.args,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Task finished"
                );
                Ok(())
            }
            Err(e) if e.is_soft() => {
                warn!(
                    subsystem = "jobs",
                    component = "runner",
                    task = %spec.task,
                    args = ?spec.args,
                    error = %e,
                    "Task skipped"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
