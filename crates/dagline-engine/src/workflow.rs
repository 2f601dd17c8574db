use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use dagline_core::error::{DaglineError, Result};
use dagline_core::types::{DagRun, DagStep, EngineType};

/// A workflow template loaded from YAML.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSpec {
    pub dag_id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<StepSpec>,
}

/// One step of a workflow template.
#[derive(Debug, Clone, Deserialize)]
pub struct StepSpec {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Extra attempts after the first failure.
    #[serde(default)]
    pub retries: u32,
    /// Shell command to execute.
    #[serde(default)]
    pub run: Option<String>,
    /// Simulated work: sleep for this many milliseconds.
    #[serde(default)]
    pub sleep_ms: Option<u64>,
}

/// What a step actually does when executed.
#[derive(Debug, Clone)]
pub enum StepAction {
    Run(String),
    Sleep(u64),
    Noop,
}

impl StepSpec {
    pub fn action(&self) -> StepAction {
        if let Some(cmd) = &self.run {
            StepAction::Run(cmd.clone())
        } else if let Some(ms) = self.sleep_ms {
            StepAction::Sleep(ms)
        } else {
            StepAction::Noop
        }
    }

    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.clone())
    }
}

impl WorkflowSpec {
    /// Load and validate a template from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DaglineError::Workflow(format!("cannot read {}: {}", path.display(), e))
        })?;
        let spec: WorkflowSpec = serde_yaml::from_str(&content)
            .map_err(|e| DaglineError::Workflow(format!("{}: {}", path.display(), e)))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Structural checks: non-empty, unique step ids, known dependencies,
    /// acyclic.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(DaglineError::Workflow(format!(
                "workflow {} has no steps",
                self.dag_id
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(DaglineError::Workflow(format!(
                    "duplicate step id: {}",
                    step.id
                )));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if dep == &step.id {
                    return Err(DaglineError::Workflow(format!(
                        "step {} depends on itself",
                        step.id
                    )));
                }
                if !seen.contains(dep.as_str()) {
                    return Err(DaglineError::Workflow(format!(
                        "step {} depends on unknown step {}",
                        step.id, dep
                    )));
                }
            }
        }

        self.topological_order()?;
        Ok(())
    }

    /// Kahn's algorithm. Errors on a dependency cycle.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> = self
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s.depends_on.len()))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            for dep in &step.depends_on {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(step.id.as_str());
            }
        }

        // Seed with roots in template order for stable output
        let mut ready: Vec<&str> = self
            .steps
            .iter()
            .filter(|s| s.depends_on.is_empty())
            .map(|s| s.id.as_str())
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());

        while let Some(id) = ready.first().copied() {
            ready.remove(0);
            order.push(id.to_string());
            if let Some(next) = dependents.get(id) {
                for &n in next {
                    let d = in_degree.get_mut(n).expect("known step");
                    *d -= 1;
                    if *d == 0 {
                        ready.push(n);
                    }
                }
            }
        }

        if order.len() != self.steps.len() {
            return Err(DaglineError::Workflow(format!(
                "workflow {} has a dependency cycle",
                self.dag_id
            )));
        }
        Ok(order)
    }

    pub fn step(&self, id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Seed a run: every step pending, template identity in `conf`.
    pub fn to_run(&self, workflow_path: &str, engine_type: EngineType) -> DagRun {
        let mut run = DagRun::new(&self.dag_id);
        run.conf.insert(
            "workflow_path".to_string(),
            serde_json::Value::String(workflow_path.to_string()),
        );
        run.conf.insert(
            "engine_type".to_string(),
            serde_json::Value::String(engine_type.to_string()),
        );
        if let Some(desc) = &self.description {
            run.metadata.insert(
                "description".to_string(),
                serde_json::Value::String(desc.clone()),
            );
        }
        for step in &self.steps {
            run.steps.push(
                DagStep::new(&step.id, step.display_name())
                    .with_dependencies(step.depends_on.clone()),
            );
        }
        run
    }
}
