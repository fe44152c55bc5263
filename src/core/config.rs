//! Pipeline configuration from YAML

use crate::core::{
    context::placeholders,
    image::DEFAULT_TAG_TEMPLATE,
    step::StepAction,
    Pipeline,
};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Pipeline deadline when the file doesn't set one
pub const DEFAULT_TIMEOUT_SECS: u64 = 1200;

/// `wait_for` entry meaning "start immediately"
pub const NO_WAIT: &str = "-";

/// Top-level pipeline configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Global variables available to all steps
    #[serde(default)]
    variables: HashMap<String, Value>,

    /// Image built, pushed and deployed by this pipeline
    #[serde(default)]
    pub image: Option<ImageConfig>,

    /// Executables used by the built-in step actions
    #[serde(default)]
    pub tools: ToolPaths,

    /// Deadline for the whole run (in seconds)
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Machine class the runner is sized for (informational)
    #[serde(default)]
    pub machine_type: Option<String>,

    /// Pipeline steps
    pub steps: Vec<StepConfig>,
}

/// Image naming
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Repository template, e.g. `gcr.io/{{ project_id }}/ai-app`
    pub repository: String,

    /// Tag template; defaults to a per-run build number
    #[serde(default)]
    pub tag: Option<String>,
}

impl ImageConfig {
    pub fn tag_template(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG_TEMPLATE)
    }
}

/// Executables for the built-in actions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub git: String,
    pub docker: String,
    pub gcloud: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            git: "git".to_string(),
            docker: "docker".to_string(),
            gcloud: "gcloud".to_string(),
        }
    }
}

/// Step configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Unique step identifier
    pub id: String,

    /// Human-readable step name
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    /// Steps to wait for. Omitted: every earlier step. `["-"]`: none.
    #[serde(default, alias = "depends_on")]
    pub wait_for: Option<Vec<String>>,

    /// Working directory relative to the workspace
    #[serde(default)]
    pub dir: Option<String>,

    /// Executable override
    #[serde(default)]
    pub tool: Option<String>,

    /// Timeout for this step
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(flatten)]
    pub action: StepAction,
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse pipeline configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the pipeline configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("Pipeline name is empty");
        }

        if self.timeout_secs == Some(0) {
            bail!("timeout_secs must be greater than zero");
        }

        // Check that all step IDs are unique
        let mut seen_ids = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() || step.id == NO_WAIT {
                bail!("Invalid step ID: '{}'", step.id);
            }
            if !seen_ids.insert(&step.id) {
                bail!("Duplicate step ID: {}", step.id);
            }
        }

        for step in &self.steps {
            if let Some(wait_for) = &step.wait_for {
                if wait_for.iter().any(|w| w == NO_WAIT) && wait_for.len() > 1 {
                    bail!("Step '{}' mixes '-' with other wait_for entries", step.id);
                }
                for dep in wait_for.iter().filter(|w| *w != NO_WAIT) {
                    if dep == &step.id {
                        bail!("Step '{}' waits for itself", step.id);
                    }
                    if !seen_ids.contains(dep) {
                        bail!("Step '{}' depends on non-existent step '{}'", step.id, dep);
                    }
                }
            }

            if step.timeout_secs == Some(0) {
                bail!("Step '{}' timeout_secs must be greater than zero", step.id);
            }

            self.validate_action(step)?;
        }

        if let Some(image) = &self.image {
            if image.repository.trim().is_empty() {
                bail!("image.repository is empty");
            }
            if image.tag_template().trim().is_empty() {
                bail!("image.tag is empty");
            }
        }

        // Check for cycles in the dependency graph
        self.check_cycles()?;

        Ok(())
    }

    fn validate_action(&self, step: &StepConfig) -> Result<()> {
        if step.action.uses_image() && self.image.is_none() {
            bail!(
                "Step '{}' ({}) needs an image but the pipeline has no `image` section",
                step.id,
                step.action.kind()
            );
        }

        match &step.action {
            StepAction::FetchSource { repository, depth, dest, .. } => {
                if repository.trim().is_empty() {
                    bail!("Step '{}' has an empty repository", step.id);
                }
                if *depth == 0 {
                    bail!("Step '{}' clone depth must be at least 1", step.id);
                }
                if dest.trim().is_empty() {
                    bail!("Step '{}' has an empty clone destination", step.id);
                }
            }
            StepAction::BuildImage { build_file, .. } => {
                if build_file.trim().is_empty() {
                    bail!("Step '{}' has an empty build_file", step.id);
                }
            }
            StepAction::PushImage { .. } => {}
            StepAction::DeployService { service, region, port, .. } => {
                if service.trim().is_empty() {
                    bail!("Step '{}' has an empty service name", step.id);
                }
                if region.trim().is_empty() {
                    bail!("Step '{}' has an empty region", step.id);
                }
                if *port == Some(0) {
                    bail!("Step '{}' port must be non-zero", step.id);
                }
            }
            StepAction::CheckHealth { url, retries, .. } => {
                if url.trim().is_empty() {
                    bail!("Step '{}' has an empty health check url", step.id);
                }
                if *retries == Some(0) {
                    bail!("Step '{}' retries must be at least 1", step.id);
                }
            }
            StepAction::Run { program, .. } => {
                if program.trim().is_empty() {
                    bail!("Step '{}' has an empty program", step.id);
                }
            }
        }

        Ok(())
    }

    /// Dependencies of the step at `index`, applying `wait_for` defaults
    pub fn resolved_dependencies(&self, index: usize) -> Vec<String> {
        let step = &self.steps[index];
        match &step.wait_for {
            None => self.steps[..index].iter().map(|s| s.id.clone()).collect(),
            Some(wait_for) => wait_for
                .iter()
                .filter(|w| *w != NO_WAIT)
                .cloned()
                .collect(),
        }
    }

    /// Check for cycles in the step dependency graph
    fn check_cycles(&self) -> Result<()> {
        let mut visited = HashSet::new();
        let mut recursion_stack = HashSet::new();

        for step in &self.steps {
            if !visited.contains(&step.id) {
                self.dfs_check(&step.id, &mut visited, &mut recursion_stack)?;
            }
        }

        Ok(())
    }

    fn dfs_check(
        &self,
        step_id: &str,
        visited: &mut HashSet<String>,
        recursion_stack: &mut HashSet<String>,
    ) -> Result<()> {
        visited.insert(step_id.to_string());
        recursion_stack.insert(step_id.to_string());

        if let Some(index) = self.steps.iter().position(|s| s.id == step_id) {
            for dep in self.resolved_dependencies(index) {
                if recursion_stack.contains(&dep) {
                    bail!("Cycle detected in dependency graph involving step '{}'", dep);
                }
                if !visited.contains(&dep) {
                    self.dfs_check(&dep, visited, recursion_stack)?;
                }
            }
        }

        recursion_stack.remove(step_id);
        Ok(())
    }

    /// Variables as strings; non-string scalars are stringified
    pub fn variables_as_string_map(&self) -> HashMap<String, String> {
        self.variables
            .iter()
            .map(|(key, value)| {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    Value::Bool(b) => b.to_string(),
                    Value::Number(n) => n.to_string(),
                    Value::Null => String::new(),
                    other => serde_yaml::to_string(other)
                        .unwrap_or_default()
                        .trim_end()
                        .to_string(),
                };
                (key.clone(), rendered)
            })
            .collect()
    }

    /// Every variable name referenced by the pipeline's templates
    pub fn referenced_variables(&self) -> HashSet<String> {
        let yaml = serde_yaml::to_string(&self.steps).unwrap_or_default();
        let mut names: HashSet<String> = placeholders(&yaml).into_iter().collect();
        if let Some(image) = &self.image {
            names.extend(placeholders(&image.repository));
            names.extend(placeholders(image.tag_template()));
        }
        names
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)
    }

    /// Convert config to a Pipeline domain model
    pub fn to_pipeline(&self) -> Pipeline {
        Pipeline::from_config(self)
    }
}
