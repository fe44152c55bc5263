//! Step domain model

use crate::core::{config::StepConfig, state::StepState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

fn default_depth() -> u32 {
    1
}

fn default_dest() -> String {
    "source".to_string()
}

fn default_build_file() -> String {
    "Dockerfile".to_string()
}

fn default_platform() -> String {
    "managed".to_string()
}

/// What a step does. Tagged by `action` in YAML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    /// Shallow-clone a repository into the run workspace
    FetchSource {
        repository: String,
        #[serde(default = "default_depth")]
        depth: u32,
        /// Branch or tag to check out
        #[serde(default)]
        reference: Option<String>,
        /// Destination directory, relative to the workspace
        #[serde(default = "default_dest")]
        dest: String,
    },

    /// Build the pipeline image from the fetched source
    BuildImage {
        /// Build file path, relative to the context directory
        #[serde(default = "default_build_file")]
        build_file: String,
        /// Build context, relative to the workspace (defaults to the fetch destination)
        #[serde(default)]
        context: Option<String>,
        #[serde(default)]
        build_args: BTreeMap<String, String>,
    },

    /// Upload the built image to its registry
    PushImage {
        /// Explicit image, overriding the pipeline image
        #[serde(default)]
        image: Option<String>,
    },

    /// Deploy the pushed image to a managed runtime
    DeployService {
        service: String,
        region: String,
        #[serde(default = "default_platform")]
        platform: String,
        #[serde(default)]
        allow_unauthenticated: bool,
        /// Container port (defaults to the service contract port)
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        env_vars: BTreeMap<String, String>,
        #[serde(default)]
        project: Option<String>,
    },

    /// Probe the deployed service's liveness endpoint
    CheckHealth {
        url: String,
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        interval_secs: Option<u64>,
        #[serde(default)]
        probe_timeout_secs: Option<u64>,
        #[serde(default)]
        start_period_secs: Option<u64>,
        #[serde(default)]
        retries: Option<u32>,
    },

    /// Run an arbitrary command inside the workspace
    Run {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
}

/// Step variant without its parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    FetchSource,
    BuildImage,
    PushImage,
    DeployService,
    CheckHealth,
    Run,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepKind::FetchSource => "fetch_source",
            StepKind::BuildImage => "build_image",
            StepKind::PushImage => "push_image",
            StepKind::DeployService => "deploy_service",
            StepKind::CheckHealth => "check_health",
            StepKind::Run => "run",
        };
        f.write_str(name)
    }
}

impl StepAction {
    pub fn kind(&self) -> StepKind {
        match self {
            StepAction::FetchSource { .. } => StepKind::FetchSource,
            StepAction::BuildImage { .. } => StepKind::BuildImage,
            StepAction::PushImage { .. } => StepKind::PushImage,
            StepAction::DeployService { .. } => StepKind::DeployService,
            StepAction::CheckHealth { .. } => StepKind::CheckHealth,
            StepAction::Run { .. } => StepKind::Run,
        }
    }

    /// Whether the action needs the pipeline image reference
    pub fn uses_image(&self) -> bool {
        match self {
            StepAction::BuildImage { .. } | StepAction::DeployService { .. } => true,
            StepAction::PushImage { image } => image.is_none(),
            _ => false,
        }
    }
}

/// A single step in a pipeline
#[derive(Debug, Clone)]
pub struct Step {
    /// Unique step identifier
    pub id: String,

    /// Human-readable name
    pub name: String,

    pub action: StepAction,

    /// Step IDs that must complete before this one starts
    pub dependencies: Vec<String>,

    /// Working directory relative to the workspace
    pub dir: Option<String>,

    /// Executable override for the step's tool
    pub tool: Option<String>,

    /// Per-step time limit, on top of the pipeline deadline
    pub timeout_secs: Option<u64>,

    /// Runtime state
    pub state: StepState,
}

impl Step {
    /// Create a step from its config and resolved dependencies
    pub fn from_config(config: &StepConfig, dependencies: Vec<String>) -> Self {
        Step {
            id: config.id.clone(),
            name: config.name.clone().unwrap_or_else(|| config.id.clone()),
            action: config.action.clone(),
            dependencies,
            dir: config.dir.clone(),
            tool: config.tool.clone(),
            timeout_secs: config.timeout_secs,
            state: StepState::Pending,
        }
    }

    pub fn kind(&self) -> StepKind {
        self.action.kind()
    }

    /// Check if all dependencies completed
    pub fn dependencies_met(&self, completed_steps: &HashSet<String>) -> bool {
        self.dependencies.iter().all(|dep| completed_steps.contains(dep))
    }
}
