//! Pipeline context - run-wide variables, workspace and image

use crate::core::image::ImageReference;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

/// Variables the runner defines for every run
pub mod builtins {
    pub const PROJECT_ID: &str = "project_id";
    pub const EXECUTION_ID: &str = "execution_id";
    pub const BUILD_NUMBER: &str = "build_number";
    pub const WORKSPACE: &str = "workspace";
    pub const IMAGE: &str = "image";
    pub const IMAGE_TAG: &str = "image_tag";
    pub const IMAGE_REPOSITORY: &str = "image_repository";
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unresolved variable(s): {}", .0.join(", "))]
pub struct UnresolvedVariables(pub Vec<String>);

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.-]*)\s*\}\}").expect("static regex is valid")
    })
}

/// Names referenced as `{{ name }}` in a template
pub fn placeholders(template: &str) -> Vec<String> {
    placeholder_regex()
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Execution context for a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineContext {
    /// Pipeline, override and built-in variables
    pub variables: HashMap<String, String>,

    /// Root of the run workspace
    pub workspace: PathBuf,

    /// Image built and shipped by this run
    pub image: Option<ImageReference>,

    /// The current step being executed (if any)
    pub current_step_id: Option<String>,
}

impl PipelineContext {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            variables: HashMap::new(),
            workspace: workspace.into(),
            image: None,
            current_step_id: None,
        }
    }

    pub fn set_variable(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(key.into(), value.into());
    }

    pub fn get_variable(&self, key: &str) -> Option<&String> {
        self.variables.get(key)
    }

    /// Attach the run image and expose it as variables
    pub fn set_image(&mut self, image: ImageReference) {
        self.set_variable(builtins::IMAGE, image.to_string());
        self.set_variable(builtins::IMAGE_TAG, image.tag.clone());
        self.set_variable(builtins::IMAGE_REPOSITORY, image.repository.clone());
        self.image = Some(image);
    }

    /// Substitute `{{ name }}` placeholders
    pub fn render(&self, template: &str) -> Result<String, UnresolvedVariables> {
        let mut missing = BTreeSet::new();
        let rendered = placeholder_regex().replace_all(template, |caps: &regex::Captures| {
            match self.variables.get(&caps[1]) {
                Some(value) => value.clone(),
                None => {
                    missing.insert(caps[1].to_string());
                    caps[0].to_string()
                }
            }
        });

        if missing.is_empty() {
            Ok(rendered.into_owned())
        } else {
            Err(UnresolvedVariables(missing.into_iter().collect()))
        }
    }

    /// Resolve a workspace-relative path; absolute paths pass through
    pub fn resolve_path(&self, relative: Option<&str>) -> PathBuf {
        match relative {
            Some(path) if Path::new(path).is_absolute() => PathBuf::from(path),
            Some(path) => self.workspace.join(path),
            None => self.workspace.clone(),
        }
    }
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new(".")
    }
}
