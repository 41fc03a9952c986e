//! Git source resolution ahead of dispatch.

use async_trait::async_trait;
use stagehand_core::ids::PipelineInstanceId;
use stagehand_core::pipeline::{GitSource, SourceDefinition};
use stagehand_core::ports::{ResolvedSource, SourceResolver};
use stagehand_core::{Error, Result};
use std::path::{Component, Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Clones git sources into `<workspace>/<instance>/<target_path>`.
pub struct GitSourceResolver {
    workspace_dir: PathBuf,
    git: String,
}

impl GitSourceResolver {
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
            git: "git".to_string(),
        }
    }

    /// Use a specific git executable.
    pub fn with_git(mut self, git: impl Into<String>) -> Self {
        self.git = git.into();
        self
    }

    /// Checkout directory of a source for one instance.
    pub fn checkout_dir(&self, instance_id: PipelineInstanceId, source: &GitSource) -> Result<PathBuf> {
        validate_url(&source.url)?;
        let target = Path::new(&source.target_path);
        let escapes = target.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if source.target_path.is_empty() || escapes {
            return Err(Error::SourceResolution(format!(
                "invalid target path '{}'",
                source.target_path
            )));
        }
        Ok(self
            .workspace_dir
            .join(instance_id.to_string())
            .join(target))
    }

    /// Arguments for `git clone`.
    pub fn clone_args(source: &GitSource, dest: &Path) -> Vec<String> {
        let mut args = vec!["clone".to_string()];
        if let Some(branch) = &source.branch {
            args.push("--branch".to_string());
            args.push(branch.clone());
        }
        if let Some(depth) = source.depth {
            args.push("--depth".to_string());
            args.push(depth.to_string());
        }
        args.push("--".to_string());
        args.push(source.url.clone());
        args.push(dest.display().to_string());
        args
    }

    async fn checkout(&self, instance_id: PipelineInstanceId, source: &GitSource) -> Result<ResolvedSource> {
        let dest = self.checkout_dir(instance_id, source)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!(url = %source.url, path = %dest.display(), "Cloning source");
        let output = Command::new(&self.git)
            .args(Self::clone_args(source, &dest))
            .output()
            .await
            .map_err(|e| Error::SourceResolution(format!("failed to run git clone: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::SourceResolution(format!(
                "git clone {} failed: {}",
                source.url,
                stderr.trim()
            )));
        }

        let revision = self.head_revision(&dest).await;
        debug!(url = %source.url, revision = ?revision, "Source cloned");

        Ok(ResolvedSource {
            url: source.url.clone(),
            path: dest.display().to_string(),
            revision,
        })
    }

    async fn head_revision(&self, checkout: &Path) -> Option<String> {
        let output = Command::new(&self.git)
            .args(["rev-parse", "HEAD"])
            .current_dir(checkout)
            .output()
            .await
            .ok()?;
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Reject urls git would read as an option.
pub fn validate_url(url: &str) -> Result<()> {
    if url.trim().is_empty() || url.starts_with('-') {
        return Err(Error::SourceResolution(format!("invalid git url '{}'", url)));
    }
    Ok(())
}

#[async_trait]
impl SourceResolver for GitSourceResolver {
    async fn resolve(
        &self,
        instance_id: PipelineInstanceId,
        sources: &[SourceDefinition],
    ) -> Result<Vec<ResolvedSource>> {
        let mut resolved = Vec::with_capacity(sources.len());
        for source in sources {
            match source {
                SourceDefinition::Git(git) => resolved.push(self.checkout(instance_id, git).await?),
            }
        }
        Ok(resolved)
    }
}
