use std::collections::HashMap;

use crate::config::{default_workflow, OrcConfig};
use crate::error::OrcError;
use crate::types::{Task, Workflow};

/// Read-only lookup of the workflows a repository declares, plus the
/// built-in default. Workflows are authored externally; the core never
/// mutates them.
#[derive(Debug, Clone)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Workflow>,
}

impl WorkflowRegistry {
    pub fn from_config(config: &OrcConfig) -> Self {
        let mut workflows = config.build_workflows();
        workflows
            .entry("default".to_string())
            .or_insert_with(default_workflow);
        Self { workflows }
    }

    /// Build a registry from explicit workflows (tests and embedding).
    pub fn from_workflows(list: Vec<Workflow>) -> Self {
        Self {
            workflows: list.into_iter().map(|w| (w.id.clone(), w)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Workflow> {
        self.workflows.get(id)
    }

    /// Resolve the workflow a task traverses.
    ///
    /// A missing workflow id is `NotFound`; a present-but-empty workflow is
    /// `NoWorkflow` so the executor fails fast without touching state.
    pub fn resolve(&self, task: &Task) -> Result<&Workflow, OrcError> {
        let workflow = self
            .workflows
            .get(&task.workflow_id)
            .ok_or_else(|| OrcError::NotFound(format!("workflow {}", task.workflow_id)))?;
        if workflow.phases.is_empty() {
            return Err(OrcError::NoWorkflow(task.id.clone()));
        }
        Ok(workflow)
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.workflows.keys().map(|s| s.as_str()).collect();
        ids.sort();
        ids
    }
}
