use std::{fmt, path::Path, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use futures::future::try_join_all;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;

use crate::{PipelineKind, TaskDescriptor, TaskRegistry};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("model `{model}` failed to load: {reason}")]
    Load { model: String, reason: String },
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("engine request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to read input: {0}")]
    Io(#[from] std::io::Error),
}

/// A loaded model which can be invoked on a staged image.
///
/// Implementations are shared across concurrent requests without additional
/// locking.
#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn invoke(
        &self,
        input: &Path,
        parameters: &Map<String, Value>,
    ) -> Result<Value, PipelineError>;
}

/// Produces pipelines for task descriptors.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    async fn load(&self, task: &TaskDescriptor) -> Result<Arc<dyn Pipeline>, PipelineError>;
}

/// A task paired with its loaded pipeline.
#[derive(Clone)]
pub struct LoadedPipeline {
    task: Arc<TaskDescriptor>,
    pipeline: Arc<dyn Pipeline>,
}

impl LoadedPipeline {
    pub fn new(task: TaskDescriptor, pipeline: Arc<dyn Pipeline>) -> Self {
        Self {
            task: Arc::new(task),
            pipeline,
        }
    }

    pub fn name(&self) -> &str {
        &self.task.name
    }

    pub fn kind(&self) -> PipelineKind {
        self.task.kind
    }

    pub fn model(&self) -> &str {
        &self.task.model
    }

    pub fn path(&self) -> String {
        self.task.path()
    }

    /// Runs the pipeline with the task's configured invocation parameters.
    pub async fn invoke(&self, input: &Path) -> Result<Value, PipelineError> {
        self.pipeline.invoke(input, &self.task.parameters).await
    }
}

impl fmt::Debug for LoadedPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedPipeline")
            .field("task", &self.task)
            .finish_non_exhaustive()
    }
}

/// Every pipeline of a registry, in registry order.
#[derive(Debug, Clone)]
pub struct PipelineSet {
    pipelines: Vec<LoadedPipeline>,
}

impl PipelineSet {
    pub fn iter(&self) -> impl Iterator<Item = &LoadedPipeline> {
        self.pipelines.iter()
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}

/// Loads one pipeline per task, concurrently. Fails as soon as any load fails.
pub async fn load_pipelines(
    engine: &dyn InferenceEngine,
    registry: &TaskRegistry,
) -> anyhow::Result<PipelineSet> {
    let loads = registry
        .tasks()
        .iter()
        .map(|task| async move {
            info!("Loading model [{}] for task [{}]", task.model, task.name);
            let pipeline = engine.load(task).await.with_context(|| {
                format!(
                    "Failed to load model [{}] for task [{}]",
                    task.model, task.name
                )
            })?;
            info!(
                task = %task.name,
                kind = %task.kind,
                "Model [{}] loaded successfully", task.model
            );
            Ok(LoadedPipeline::new(task.clone(), pipeline)) as anyhow::Result<LoadedPipeline>
        })
        .collect::<Vec<_>>();
    let pipelines = try_join_all(loads).await?;
    info!("{} pipelines loaded successfully", pipelines.len());
    Ok(PipelineSet { pipelines })
}
