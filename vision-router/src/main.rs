use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use clap::Parser;
use tracing::error;
use vision_router::{
    engine::RemoteEngine,
    server,
    staging::{UploadPolicy, DEFAULT_MAX_FILE_SIZE},
    tracing_utils::init_logging,
    TaskRegistry,
};

/// App Configuration
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST), long, env)]
    host: IpAddr,
    #[clap(default_value = "5000", long, short, env)]
    port: u16,
    #[clap(long, env)]
    task_registry_config: PathBuf,
    #[clap(
        default_value = "png,jpg,jpeg,webp",
        long,
        env,
        value_delimiter = ','
    )]
    allowed_extensions: Vec<String>,
    #[clap(default_value_t = DEFAULT_MAX_FILE_SIZE, long, env)]
    max_file_size: usize,
    #[clap(long, env)]
    upload_dir: Option<PathBuf>,
    #[clap(long, env)]
    inference_timeout_ms: Option<u64>,
    #[clap(default_value = "http://127.0.0.1:8080", long, env)]
    engine_url: String,
    #[clap(long, env)]
    engine_token: Option<String>,
    #[clap(long, env)]
    json_output: bool,
    #[clap(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
    #[clap(long, env = "OTEL_SERVICE_NAME", default_value = "vision-router")]
    otlp_service_name: String,
}

fn main() -> anyhow::Result<()> {
    //Get args
    let args = Args::parse();

    // Launch Tokio runtime
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async move {
            init_logging(
                args.otlp_service_name.clone(),
                args.json_output,
                args.otlp_endpoint.clone(),
            );
            serve(args).await.inspect_err(|e| error!("{e:#}"))
        })
}

async fn serve(args: Args) -> anyhow::Result<()> {
    let registry = TaskRegistry::load(&args.task_registry_config)?;
    let upload_dir = args
        .upload_dir
        .unwrap_or_else(|| std::env::temp_dir().join("vision-router-uploads"));
    let policy = UploadPolicy::new(&args.allowed_extensions, args.max_file_size, upload_dir);
    let engine = RemoteEngine::new(args.engine_url, args.engine_token)?;
    let http_addr = SocketAddr::new(args.host, args.port);

    server::run(
        http_addr,
        &engine,
        &registry,
        policy,
        args.inference_timeout_ms.map(Duration::from_millis),
    )
    .await
}
