//! Pipeline domain model

use crate::core::{
    config::{ImageConfig, PipelineConfig, ToolPaths},
    context::{builtins, placeholders, PipelineContext},
    image::ImageReference,
    state::{ExecutionStatus, PipelineState, StepState},
    step::Step,
};
use anyhow::{bail, Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Per-run inputs that complete the pipeline's variables
#[derive(Debug, Clone, Default)]
pub struct RunInputs {
    /// Fresh workspace directory for this run
    pub workspace: PathBuf,

    /// Monotonic build number for this pipeline
    pub build_number: u64,

    pub project_id: Option<String>,

    /// `--var key=value` overrides
    pub overrides: HashMap<String, String>,
}

/// A pipeline definition
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Pipeline name
    pub name: String,

    /// Global variables available to all steps
    pub variables: HashMap<String, String>,

    /// Pipeline steps
    pub steps: HashMap<String, Step>,

    /// Execution state
    pub state: PipelineState,

    /// Image naming templates
    pub image: Option<ImageConfig>,

    pub tools: ToolPaths,

    /// Deadline for the whole run
    pub timeout: Duration,

    pub machine_type: Option<String>,

    /// Run context, filled in by [`Pipeline::prepare`]
    pub context: PipelineContext,

    /// Build number of this run, set by [`Pipeline::prepare`]
    pub build_number: u64,

    /// Step IDs in the order they were declared
    declaration_order: Vec<String>,

    /// Step execution order (topological sort)
    execution_order: Vec<String>,
}

impl Pipeline {
    /// Create a pipeline from configuration
    pub fn from_config(config: &PipelineConfig) -> Self {
        let steps: HashMap<String, Step> = config
            .steps
            .iter()
            .enumerate()
            .map(|(index, step_config)| {
                let step = Step::from_config(step_config, config.resolved_dependencies(index));
                (step.id.clone(), step)
            })
            .collect();

        let declaration_order: Vec<String> = config.steps.iter().map(|s| s.id.clone()).collect();
        let execution_order = Self::topological_sort(&declaration_order, &steps);

        Pipeline {
            name: config.name.clone(),
            variables: config.variables_as_string_map(),
            steps,
            state: PipelineState::new(),
            image: config.image.clone(),
            tools: config.tools.clone(),
            timeout: Duration::from_secs(config.timeout_secs()),
            machine_type: config.machine_type.clone(),
            context: PipelineContext::default(),
            build_number: 0,
            declaration_order,
            execution_order,
        }
    }

    /// Get a step by ID
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.get(id)
    }

    /// Get a mutable step by ID
    pub fn step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.get_mut(id)
    }

    /// IDs of steps that completed successfully
    pub fn completed_step_ids(&self) -> HashSet<String> {
        self.steps
            .values()
            .filter(|s| s.state.is_completed())
            .map(|s| s.id.clone())
            .collect()
    }

    /// Get steps ready to execute (dependencies completed), in execution order
    pub fn ready_steps(&self) -> Vec<&Step> {
        let completed = self.completed_step_ids();

        self.execution_order
            .iter()
            .filter_map(|id| self.steps.get(id))
            .filter(|s| matches!(s.state, StepState::Pending) && s.dependencies_met(&completed))
            .collect()
    }

    /// Get all currently running steps
    pub fn running_steps(&self) -> Vec<&Step> {
        self.steps.values().filter(|s| s.state.is_running()).collect()
    }

    /// Check if every step reached a terminal state
    pub fn is_complete(&self) -> bool {
        self.steps.values().all(|s| s.state.is_terminal())
    }

    /// Check if pipeline has failed
    pub fn has_failed(&self) -> bool {
        matches!(
            self.state.status,
            ExecutionStatus::Failed | ExecutionStatus::TimedOut
        )
    }

    /// Step IDs in declaration order
    pub fn declaration_order(&self) -> &[String] {
        &self.declaration_order
    }

    /// Get execution order (topological sort)
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Group steps into stages; every step's dependencies sit in earlier stages
    pub fn stages(&self) -> Vec<Vec<String>> {
        let mut placed: HashSet<String> = HashSet::new();
        let mut stages = Vec::new();

        while placed.len() < self.declaration_order.len() {
            let stage: Vec<String> = self
                .declaration_order
                .iter()
                .filter(|id| !placed.contains(*id))
                .filter(|id| {
                    self.steps[*id]
                        .dependencies
                        .iter()
                        .all(|dep| placed.contains(dep))
                })
                .cloned()
                .collect();

            // Config validation rejects cycles; guard against looping anyway
            if stage.is_empty() {
                break;
            }
            placed.extend(stage.iter().cloned());
            stages.push(stage);
        }

        stages
    }

    /// Calculate topological sort of steps, stable with respect to declaration order
    fn topological_sort(declaration_order: &[String], steps: &HashMap<String, Step>) -> Vec<String> {
        let mut result = Vec::new();
        let mut visited = HashSet::new();

        for step_id in declaration_order {
            Self::visit(step_id, steps, &mut visited, &mut result);
        }

        result
    }

    fn visit(
        step_id: &str,
        steps: &HashMap<String, Step>,
        visited: &mut HashSet<String>,
        result: &mut Vec<String>,
    ) {
        if !visited.insert(step_id.to_string()) {
            return;
        }

        if let Some(step) = steps.get(step_id) {
            for dep in &step.dependencies {
                Self::visit(dep, steps, visited, result);
            }
        }

        result.push(step_id.to_string());
    }

    /// Build the run context: variables, overrides, built-ins and the image
    pub fn prepare(&mut self, inputs: RunInputs) -> Result<()> {
        let mut context = PipelineContext::new(inputs.workspace);
        context.variables.extend(self.variables.clone());
        context.variables.extend(inputs.overrides);

        if let Some(project_id) = inputs.project_id {
            context.set_variable(builtins::PROJECT_ID, project_id);
        }
        context.set_variable(builtins::EXECUTION_ID, self.state.execution_id.to_string());
        context.set_variable(builtins::BUILD_NUMBER, inputs.build_number.to_string());
        context.set_variable(builtins::WORKSPACE, context.workspace.display().to_string());

        if let Some(image) = &self.image {
            let repository = context
                .render(&image.repository)
                .context("Failed to render image.repository")?;
            let tag = context
                .render(image.tag_template())
                .context("Failed to render image.tag")?;
            let image = ImageReference::new(repository, tag)?;
            debug!("Pipeline {} will ship {}", self.name, image);
            context.set_image(image);
        }

        let missing = self.unresolved_variables(&context);
        if !missing.is_empty() {
            bail!(
                "Pipeline '{}' references undefined variable(s): {}",
                self.name,
                missing.join(", ")
            );
        }

        self.context = context;
        self.build_number = inputs.build_number;
        Ok(())
    }

    /// Variables referenced by steps but absent from `context`, sorted
    pub fn unresolved_variables(&self, context: &PipelineContext) -> Vec<String> {
        let mut missing: Vec<String> = self
            .steps
            .values()
            .flat_map(|step| {
                let mut templates = vec![serde_yaml::to_string(&step.action).unwrap_or_default()];
                templates.extend(step.dir.clone());
                templates.extend(step.tool.clone());
                templates
            })
            .flat_map(|template| placeholders(&template))
            .filter(|name| !context.variables.contains_key(name))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        missing.sort();
        missing
    }

    /// Create execution context for a step
    pub fn create_context_for_step(&self, step_id: &str) -> PipelineContext {
        let mut context = self.context.clone();
        context.current_step_id = Some(step_id.to_string());
        context
    }
}
