//! Pipelines backed by an upstream model server over HTTP.
//!
//! The upstream is expected to expose:
//! - `POST {base}/models/{model}/load` with `{"task": ..., "options": {...}}`
//! - `POST {base}/models/{model}/infer` with a multipart body of `file`,
//!   `task` and `parameters` (JSON), answering with the JSON result.
use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use reqwest::{
    multipart::{Form, Part},
    Client, RequestBuilder, Response,
};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::{
    pipeline::{InferenceEngine, Pipeline, PipelineError},
    PipelineKind, TaskDescriptor,
};

#[derive(Debug, Clone)]
struct Upstream {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl Upstream {
    fn model_url(&self, model: &str, action: &str) -> String {
        format!(
            "{}/models/{}/{}",
            self.base_url.trim_end_matches('/'),
            model.trim_matches('/'),
            action
        )
    }

    fn post(&self, url: &str) -> RequestBuilder {
        let builder = self.client.post(url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

/// Reads the body of a failed response for diagnostics.
async fn failure_reason(response: Response) -> String {
    let status = response.status();
    match response.text().await {
        Ok(body) if !body.is_empty() => format!("{status}: {body}"),
        _ => status.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct RemoteEngine {
    upstream: Upstream,
}

impl RemoteEngine {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, PipelineError> {
        let client = Client::builder().build()?;
        Ok(Self {
            upstream: Upstream {
                client,
                base_url: base_url.into(),
                token,
            },
        })
    }
}

#[async_trait]
impl InferenceEngine for RemoteEngine {
    async fn load(&self, task: &TaskDescriptor) -> Result<Arc<dyn Pipeline>, PipelineError> {
        let url = self.upstream.model_url(&task.model, "load");
        debug!(%url, "Requesting model load");
        let response = self
            .upstream
            .post(&url)
            .json(&json!({ "task": task.kind, "options": task.options }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PipelineError::Load {
                model: task.model.clone(),
                reason: failure_reason(response).await,
            });
        }
        Ok(Arc::new(RemotePipeline {
            upstream: self.upstream.clone(),
            infer_url: self.upstream.model_url(&task.model, "infer"),
            kind: task.kind,
        }))
    }
}

#[derive(Debug)]
pub struct RemotePipeline {
    upstream: Upstream,
    infer_url: String,
    kind: PipelineKind,
}

#[async_trait]
impl Pipeline for RemotePipeline {
    async fn invoke(
        &self,
        input: &Path,
        parameters: &Map<String, Value>,
    ) -> Result<Value, PipelineError> {
        let bytes = tokio::fs::read(input).await?;
        let file_name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let form = Form::new()
            .part("file", Part::bytes(bytes).file_name(file_name))
            .text("task", self.kind.to_string())
            .text("parameters", Value::Object(parameters.clone()).to_string());
        let response = self
            .upstream
            .post(&self.infer_url)
            .multipart(form)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PipelineError::Inference(failure_reason(response).await));
        }
        Ok(response.json::<Value>().await?)
    }
}
