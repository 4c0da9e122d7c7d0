//! C10 — the workflow engine: a list of steps run in three passes
//! (setup, execute, teardown), spec.md §4.10.

use crate::nodes::NodesBag;
use pgmoneta_utils::error::PgmonetaError;

pub trait Step {
    fn name(&self) -> &'static str;
    fn setup(&mut self, nodes: &mut NodesBag) -> Result<(), PgmonetaError>;
    fn execute(&mut self, nodes: &mut NodesBag) -> Result<(), PgmonetaError>;
    /// Responsible for cleaning up this step's own partial state; runs
    /// unconditionally regardless of whether `setup`/`execute` ran or
    /// failed.
    fn teardown(&mut self, nodes: &mut NodesBag);
}

pub struct Workflow {
    steps: Vec<Box<dyn Step>>,
}

impl Workflow {
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Workflow { steps }
    }

    /// Runs all `setup`s in order; if any fails, no `execute` runs at
    /// all. Runs all `execute`s in order. Runs all `teardown`s
    /// unconditionally, in order, regardless of outcome.
    pub fn run(&mut self, nodes: &mut NodesBag) -> Result<(), PgmonetaError> {
        let setup_result = self.run_setups(nodes);

        let execute_result = if setup_result.is_ok() {
            self.run_executes(nodes)
        } else {
            Ok(())
        };

        for step in &mut self.steps {
            tracing::debug!(step = step.name(), "running teardown");
            step.teardown(nodes);
        }

        setup_result.and(execute_result)
    }

    fn run_setups(&mut self, nodes: &mut NodesBag) -> Result<(), PgmonetaError> {
        for step in &mut self.steps {
            tracing::debug!(step = step.name(), "running setup");
            step.setup(nodes)?;
        }
        Ok(())
    }

    fn run_executes(&mut self, nodes: &mut NodesBag) -> Result<(), PgmonetaError> {
        for step in &mut self.steps {
            tracing::debug!(step = step.name(), "running execute");
            step.execute(nodes)?;
        }
        Ok(())
    }
}
