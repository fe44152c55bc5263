//! Container image references

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Tag template used when the pipeline doesn't name one
pub const DEFAULT_TAG_TEMPLATE: &str = "build-{{ build_number }}";

/// Tags that get overwritten on every run
const MUTABLE_TAGS: &[&str] = &["latest"];

/// A tagged image identifier, e.g. `gcr.io/my-project/ai-app:build-42`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    /// Registry host and path, e.g. `gcr.io/my-project/ai-app`
    pub repository: String,

    /// Version tag
    pub tag: String,
}

impl ImageReference {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Result<Self> {
        let repository = repository.into();
        let tag = tag.into();
        validate_repository(&repository)?;
        validate_tag(&tag)?;

        if MUTABLE_TAGS.contains(&tag.as_str()) {
            warn!(
                "Image {}:{} uses a mutable tag; each run overwrites the previous artifact",
                repository, tag
            );
        }

        Ok(Self { repository, tag })
    }

    /// Parse `repository[:tag]`; a missing tag is rejected since every image
    /// handed through the pipeline must carry an explicit version.
    pub fn parse(reference: &str) -> Result<Self> {
        // A colon before the last slash belongs to a registry port
        let last_slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
        match reference[last_slash..].rfind(':') {
            Some(pos) => {
                let split = last_slash + pos;
                Self::new(&reference[..split], &reference[split + 1..])
            }
            None => bail!("Image reference '{}' has no tag", reference),
        }
    }

    /// Whether the tag is reused across runs
    pub fn is_mutable(&self) -> bool {
        MUTABLE_TAGS.contains(&self.tag.as_str())
    }

    /// Final path component, e.g. `ai-app`
    pub fn name(&self) -> &str {
        self.repository.rsplit('/').next().unwrap_or(&self.repository)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

fn validate_repository(repository: &str) -> Result<()> {
    if repository.is_empty() {
        bail!("Image repository is empty");
    }
    if repository.contains(char::is_whitespace) {
        bail!("Image repository '{}' contains whitespace", repository);
    }
    if repository.starts_with('/') || repository.ends_with('/') || repository.contains("//") {
        bail!("Image repository '{}' has an empty path component", repository);
    }
    Ok(())
}

/// Docker tag grammar: `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`
fn validate_tag(tag: &str) -> Result<()> {
    let mut chars = tag.chars();
    let valid_first = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));

    if !valid_first || !valid_rest || tag.len() > 128 {
        bail!("Invalid image tag '{}'", tag);
    }
    Ok(())
}
