use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    body::Body,
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    handler::Handler,
    http::{Method, Request},
    routing::{on, MethodFilter},
    Json, Router,
};
use serde::Serialize;
use tokio::{net::TcpListener, signal};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    dispatch::process_file,
    pipeline::{load_pipelines, InferenceEngine, PipelineSet},
    staging::UploadPolicy,
    tracing_utils::make_request_span,
    TaskRegistry,
};

/// A registered endpoint, as reported by `GET /routes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteInfo {
    pub method: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Shared, read-only request context.
#[derive(Debug, Clone)]
pub struct AppState {
    policy: Arc<UploadPolicy>,
    inference_timeout: Option<Duration>,
    routes: Arc<[RouteInfo]>,
}

impl AppState {
    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    pub fn inference_timeout(&self) -> Option<Duration> {
        self.inference_timeout
    }

    pub fn routes(&self) -> &[RouteInfo] {
        &self.routes
    }
}

/// Records every route as it is added to the router.
struct RouteTable {
    router: Router<AppState>,
    entries: Vec<RouteInfo>,
}

impl RouteTable {
    fn new() -> Self {
        Self {
            router: Router::new(),
            entries: Vec::new(),
        }
    }

    fn get<H, T>(self, path: &str, handler: H) -> Self
    where
        H: Handler<T, AppState>,
        T: 'static,
    {
        self.add(Method::GET, MethodFilter::GET, path.to_string(), handler)
    }

    fn post<H, T>(self, path: String, handler: H) -> Self
    where
        H: Handler<T, AppState>,
        T: 'static,
    {
        self.add(Method::POST, MethodFilter::POST, path, handler)
    }

    fn add<H, T>(
        mut self,
        method: Method,
        filter: MethodFilter,
        path: String,
        handler: H,
    ) -> Self
    where
        H: Handler<T, AppState>,
        T: 'static,
    {
        self.router = self.router.route(&path, on(filter, handler));
        self.entries.push(RouteInfo {
            method: method.to_string(),
            path,
        });
        self
    }
}

/// Builds the HTTP surface: health, one POST route per pipeline, and the
/// route listing.
pub fn build_router(
    pipelines: &PipelineSet,
    policy: UploadPolicy,
    inference_timeout: Option<Duration>,
) -> Router {
    let mut table = RouteTable::new().get("/health", health);
    for pipeline in pipelines.iter() {
        let path = pipeline.path();
        info!("Registering POST {path} for task [{}]", pipeline.name());
        let pipeline = pipeline.clone();
        table = table.post(
            path,
            move |State(state): State<AppState>,
                  multipart: Result<Multipart, MultipartRejection>| {
                let pipeline = pipeline.clone();
                async move { process_file(state, pipeline, multipart).await }
            },
        );
    }

    let RouteTable { router, entries } = table;
    let body_limit = policy.body_limit();
    let state = AppState {
        policy: Arc::new(policy),
        inference_timeout,
        routes: entries.into(),
    };
    router
        .route("/routes", axum::routing::get(routes))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
            make_request_span(request)
        }))
        .with_state(state)
}

/// Loads every pipeline of the registry and builds the router. No router is
/// produced unless all pipelines load.
pub async fn build_app(
    engine: &dyn InferenceEngine,
    registry: &TaskRegistry,
    policy: UploadPolicy,
    inference_timeout: Option<Duration>,
) -> anyhow::Result<Router> {
    let pipelines = load_pipelines(engine, registry).await?;
    Ok(build_router(&pipelines, policy, inference_timeout))
}

pub async fn run(
    http_addr: SocketAddr,
    engine: &dyn InferenceEngine,
    registry: &TaskRegistry,
    policy: UploadPolicy,
    inference_timeout: Option<Duration>,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(policy.upload_dir())
        .await
        .with_context(|| {
            format!(
                "Failed to create upload directory {}",
                policy.upload_dir().display()
            )
        })?;
    info!(
        "Staging uploads in {} (max {} bytes)",
        policy.upload_dir().display(),
        policy.max_file_size()
    );

    let app = build_app(engine, registry, policy, inference_timeout).await?;

    let listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("Failed to bind {http_addr}"))?;
    info!("HTTP server started on {http_addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server crashed")
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

async fn routes(State(state): State<AppState>) -> Json<Vec<RouteInfo>> {
    Json(state.routes().to_vec())
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("signal received, starting graceful shutdown");
}
