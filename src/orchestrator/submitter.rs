//! Routes fleet improvement turns into the deployment pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::apps::{AppMetadata, is_valid_app_id};
use crate::deploy::{DeployRequest, DeploymentPipeline};
use crate::errors::{AppError, PipelineError};
use crate::fleet::IterationSubmitter;
use crate::queue::{Idea, Priority};

/// Submits a self-critique prompt under the application's own idea
/// identity, so the pipeline treats it like any human revision.
pub struct PipelineSubmitter {
    pipeline: Arc<DeploymentPipeline>,
}

impl PipelineSubmitter {
    pub fn new(pipeline: Arc<DeploymentPipeline>) -> Self {
        Self { pipeline }
    }

    fn identity_of(&self, app_id: &str) -> Option<String> {
        if !is_valid_app_id(app_id) {
            return None;
        }
        let dir = self.pipeline.apps_dir().join(app_id);
        match AppMetadata::load(&dir) {
            Ok(meta) => meta.and_then(|m| m.idea_key).filter(|key| !key.trim().is_empty()),
            Err(e) => {
                warn!(app_id = %app_id, error = %e, "unreadable metadata");
                None
            }
        }
    }
}

#[async_trait]
impl IterationSubmitter for PipelineSubmitter {
    fn has_app(&self, app_id: &str) -> bool {
        self.identity_of(app_id).is_some()
    }

    async fn iterate(&self, app_id: &str, task_id: &str, prompt: String) -> Result<String, PipelineError> {
        let identity = self
            .identity_of(app_id)
            .ok_or_else(|| AppError::NotFound(app_id.to_string()))?;
        let outcome = self
            .pipeline
            .deploy(DeployRequest {
                task_id: task_id.to_string(),
                idea: Idea::new(identity, prompt, Priority::Medium),
            })
            .await?;
        Ok(outcome.summary)
    }

    fn cancel(&self, task_id: &str) -> bool {
        self.pipeline.cancel(task_id)
    }
}
