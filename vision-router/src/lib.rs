use std::{collections::HashMap, fmt, path::Path};

use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub mod dispatch;
pub mod engine;
pub mod pipeline;
pub mod server;
pub mod staging;
pub mod tracing_utils;

/// Path segments served by the router itself.
pub const RESERVED_ROUTES: &[&str] = &["health", "routes"];

/// The kind of inference a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineKind {
    ImageToText,
    ObjectDetection,
    ImageClassification,
    ImageToImage,
}

impl PipelineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineKind::ImageToText => "image-to-text",
            PipelineKind::ObjectDetection => "object-detection",
            PipelineKind::ImageClassification => "image-classification",
            PipelineKind::ImageToImage => "image-to-image",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One named task bound to a model.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDescriptor {
    pub name: String,
    pub kind: PipelineKind,
    pub model: String,
    /// Passed to the engine when the pipeline is loaded.
    pub options: Map<String, Value>,
    /// Passed to the pipeline on every invocation.
    pub parameters: Map<String, Value>,
    /// Single path segment the task is served under.
    pub route: String,
}

impl TaskDescriptor {
    pub fn new(name: impl Into<String>, kind: PipelineKind, model: impl Into<String>) -> Self {
        let name = name.into();
        let route = derive_route(&name);
        Self {
            name,
            kind,
            model: model.into(),
            options: Map::new(),
            parameters: Map::new(),
            route,
        }
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = route.into();
        self
    }

    pub fn with_options(mut self, options: Map<String, Value>) -> Self {
        self.options = options;
        self
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Absolute request path, e.g. `/generate-caption`.
    pub fn path(&self) -> String {
        format!("/{}", self.route)
    }
}

/// Derives the path segment for a task name: lower-cased, with `_` and
/// whitespace mapped to `-`.
pub fn derive_route(task_name: &str) -> String {
    task_name
        .trim()
        .chars()
        .map(|c| match c {
            '_' => '-',
            c if c.is_whitespace() => '-',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

fn is_valid_route(route: &str) -> bool {
    !route.is_empty()
        && route
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("task registry contains no tasks")]
    Empty,
    #[error("task [{task}] has invalid route `{route}`: only a-z, 0-9 and - are allowed")]
    InvalidRoute { task: String, route: String },
    #[error("task [{task}] route `{route}` is reserved")]
    ReservedRoute { task: String, route: String },
    #[error("tasks [{first}] and [{second}] both resolve to route `{route}`")]
    DuplicateRoute {
        route: String,
        first: String,
        second: String,
    },
}

/// Task entry as written in the registry file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawTaskDescriptor {
    #[serde(rename = "type")]
    pub kind: PipelineKind,
    pub model: String,
    #[serde(default)]
    pub options: Map<String, Value>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub route: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawTaskRegistry {
    tasks: IndexMap<String, RawTaskDescriptor>,
}

/// Validated, ordered set of tasks. Task names are unique and every task
/// resolves to a distinct, non-reserved route.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawTaskRegistry")]
pub struct TaskRegistry {
    tasks: Vec<TaskDescriptor>,
}

impl TryFrom<RawTaskRegistry> for TaskRegistry {
    type Error = RegistryError;

    fn try_from(value: RawTaskRegistry) -> Result<Self, Self::Error> {
        let tasks = value
            .tasks
            .into_iter()
            .map(|(name, raw)| {
                let mut task = TaskDescriptor::new(name, raw.kind, raw.model)
                    .with_options(raw.options)
                    .with_parameters(raw.parameters);
                if let Some(route) = raw.route {
                    task = task.with_route(route);
                }
                task
            })
            .collect();
        TaskRegistry::new(tasks)
    }
}

impl TaskRegistry {
    pub fn new(tasks: Vec<TaskDescriptor>) -> Result<Self, RegistryError> {
        if tasks.is_empty() {
            return Err(RegistryError::Empty);
        }
        let mut seen: HashMap<&str, &str> = HashMap::with_capacity(tasks.len());
        for task in &tasks {
            if !is_valid_route(&task.route) {
                return Err(RegistryError::InvalidRoute {
                    task: task.name.clone(),
                    route: task.route.clone(),
                });
            }
            if RESERVED_ROUTES.contains(&task.route.as_str()) {
                return Err(RegistryError::ReservedRoute {
                    task: task.name.clone(),
                    route: task.route.clone(),
                });
            }
            if let Some(first) = seen.insert(&task.route, &task.name) {
                return Err(RegistryError::DuplicateRoute {
                    route: task.route.clone(),
                    first: first.to_string(),
                    second: task.name.clone(),
                });
            }
        }
        Ok(Self { tasks })
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to load task registry from {}", path.display()))?;
        let registry: TaskRegistry = serde_yaml::from_str(&s)
            .with_context(|| format!("Invalid task registry in {}", path.display()))?;
        tracing::info!("{} tasks configured", registry.len());
        Ok(registry)
    }

    pub fn tasks(&self) -> &[TaskDescriptor] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
