//! Rendering step actions into tool command lines

use crate::core::{
    buildfile::DEFAULT_SERVICE_PORT,
    config::ToolPaths,
    context::{PipelineContext, UnresolvedVariables},
    image::ImageReference,
    step::{Step, StepAction},
};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Build context used when a build step doesn't name one; matches the
/// fetch step's default destination.
pub const DEFAULT_SOURCE_DIR: &str = "source";

#[derive(Debug, Error)]
pub enum InvocationError {
    #[error(transparent)]
    Unresolved(#[from] UnresolvedVariables),

    #[error("no image reference for this run")]
    MissingImage,

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("step action runs in-process, not as a tool")]
    NotAProcess,
}

/// A fully rendered process invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory
    pub dir: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl Invocation {
    fn new(program: impl Into<String>, dir: PathBuf) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            dir,
            env: BTreeMap::new(),
        }
    }

    fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Shell-like rendering for logs and plans
    pub fn command_line(&self) -> String {
        let mut line = quote(&self.program);
        for arg in &self.args {
            let _ = write!(line, " {}", quote(arg));
        }
        line
    }
}

fn quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@%+{}".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

fn image_for(context: &PipelineContext) -> Result<String, InvocationError> {
    context
        .image
        .as_ref()
        .map(ToString::to_string)
        .ok_or(InvocationError::MissingImage)
}

fn working_dir(step: &Step, context: &PipelineContext) -> Result<PathBuf, InvocationError> {
    Ok(match &step.dir {
        Some(dir) => context.resolve_path(Some(&context.render(dir)?)),
        None => context.resolve_path(None),
    })
}

/// Build context directory and build file path for a build step, both
/// absolute. `None` for other actions.
pub fn build_paths(
    step: &Step,
    context: &PipelineContext,
) -> Result<Option<(PathBuf, PathBuf)>, InvocationError> {
    match &step.action {
        StepAction::BuildImage { build_file, context: build_context, .. } => {
            let build_context = match build_context {
                Some(c) => context.render(c)?,
                None => DEFAULT_SOURCE_DIR.to_string(),
            };
            let context_dir = working_dir(step, context)?.join(build_context);
            let build_file = context.render(build_file)?;
            let file = if Path::new(&build_file).is_absolute() {
                PathBuf::from(build_file)
            } else {
                context_dir.join(build_file)
            };
            Ok(Some((context_dir, file)))
        }
        _ => Ok(None),
    }
}

/// Render a step into the process that performs it
pub fn build_invocation(
    step: &Step,
    context: &PipelineContext,
    tools: &ToolPaths,
) -> Result<Invocation, InvocationError> {
    let dir = working_dir(step, context)?;
    let tool = |default: &str| -> Result<String, InvocationError> {
        match &step.tool {
            Some(tool) => Ok(context.render(tool)?),
            None => Ok(default.to_string()),
        }
    };

    let invocation = match &step.action {
        StepAction::FetchSource { repository, depth, reference, dest } => {
            let mut invocation = Invocation::new(tool(&tools.git)?, dir)
                .args(["clone", "--depth"])
                .arg(depth.to_string());
            if let Some(reference) = reference {
                invocation = invocation.arg("--branch").arg(context.render(reference)?);
            }
            invocation
                .arg(context.render(repository)?)
                .arg(context.render(dest)?)
        }

        StepAction::BuildImage { build_file, context: build_context, build_args } => {
            let build_context = match build_context {
                Some(c) => context.render(c)?,
                None => DEFAULT_SOURCE_DIR.to_string(),
            };
            let build_file = context.render(build_file)?;
            let build_file_path = if Path::new(&build_file).is_absolute() {
                build_file
            } else {
                Path::new(&build_context).join(build_file).display().to_string()
            };

            let mut invocation = Invocation::new(tool(&tools.docker)?, dir)
                .args(["build", "-t"])
                .arg(image_for(context)?)
                .arg("-f")
                .arg(build_file_path);
            for (key, value) in build_args {
                invocation = invocation
                    .arg("--build-arg")
                    .arg(format!("{}={}", key, context.render(value)?));
            }
            invocation.arg(build_context)
        }

        StepAction::PushImage { image } => {
            let image = match image {
                Some(image) => {
                    let rendered = context.render(image)?;
                    ImageReference::parse(&rendered)
                        .map_err(|e| InvocationError::InvalidImage(e.to_string()))?
                        .to_string()
                }
                None => image_for(context)?,
            };
            Invocation::new(tool(&tools.docker)?, dir).arg("push").arg(image)
        }

        StepAction::DeployService {
            service,
            region,
            platform,
            allow_unauthenticated,
            port,
            env_vars,
            project,
        } => {
            let mut invocation = Invocation::new(tool(&tools.gcloud)?, dir)
                .args(["run", "deploy"])
                .arg(context.render(service)?)
                .arg("--image")
                .arg(image_for(context)?)
                .arg("--region")
                .arg(context.render(region)?)
                .arg("--platform")
                .arg(context.render(platform)?)
                .arg("--port")
                .arg(port.unwrap_or(DEFAULT_SERVICE_PORT).to_string())
                .arg(if *allow_unauthenticated {
                    "--allow-unauthenticated"
                } else {
                    "--no-allow-unauthenticated"
                });

            if !env_vars.is_empty() {
                let mut pairs = Vec::with_capacity(env_vars.len());
                for (key, value) in env_vars {
                    pairs.push(format!("{}={}", key, context.render(value)?));
                }
                invocation = invocation.arg("--set-env-vars").arg(pairs.join(","));
            }
            if let Some(project) = project {
                invocation = invocation.arg("--project").arg(context.render(project)?);
            }
            invocation.arg("--quiet")
        }

        StepAction::Run { program, args, env } => {
            let program = match &step.tool {
                Some(tool) => context.render(tool)?,
                None => context.render(program)?,
            };
            let mut rendered = Vec::with_capacity(args.len());
            for arg in args {
                rendered.push(context.render(arg)?);
            }
            let mut invocation = Invocation::new(program, dir).args(rendered);
            for (key, value) in env {
                invocation.env.insert(key.clone(), context.render(value)?);
            }
            invocation
        }

        StepAction::CheckHealth { .. } => return Err(InvocationError::NotAProcess),
    };

    Ok(invocation)
}
