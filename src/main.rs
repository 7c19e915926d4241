//! gRPC Mimic - CLI Entry Point

use anyhow::Result;
use clap::Parser;
use grpc_mimic::validator::MockValidator;
use grpc_mimic::{config, descriptor, Dispatcher, MockMatcher, MockServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "grpc-mimic",
    about = "Descriptor-driven gRPC mocking server - dynamic dispatch and request stubbing",
    version
)]
struct Args {
    /// Compiled proto descriptor set file (protoc --descriptor_set_out),
    /// repeatable
    #[arg(short, long = "descriptor", required = true)]
    descriptors: Vec<PathBuf>,

    /// Directory with mock definitions (json/yaml)
    #[arg(short, long)]
    mocks: Option<PathBuf>,

    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:51000")]
    listen: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Validate descriptors and mocks, then exit
    #[arg(long)]
    validate: bool,

    /// Seconds to wait for in-flight calls during shutdown
    #[arg(long, default_value_t = 10)]
    shutdown_grace_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let pool = descriptor::load_descriptor_sets(&args.descriptors)?;
    let registry = descriptor::MethodRegistry::from_pool(&pool);
    let mut methods: Vec<_> = registry.paths().collect();
    methods.sort_unstable();
    for method in methods {
        info!(method = %method, "register mock method");
    }

    let mut rules = match &args.mocks {
        Some(dir) => {
            info!(path = %dir.display(), "loading mocks");
            config::load_dir(dir)?
        }
        None => {
            info!("no mocks directory given, serving health check only");
            Vec::new()
        }
    };
    // Appended last so user-defined health mocks win.
    rules.push(config::default_health_rule());
    let rule_count = rules.len();

    let matcher = Arc::new(MockMatcher::new());
    matcher.load(rules).await;

    MockValidator::new(&registry).validate(&matcher.snapshot().await)?;

    if args.validate {
        println!("Configuration is valid ({rule_count} mocks defined)");
        return Ok(());
    }

    let dispatcher = Arc::new(Dispatcher::new(registry, Arc::clone(&matcher), pool));
    let server = MockServer::bind(
        args.listen,
        dispatcher,
        Duration::from_secs(args.shutdown_grace_secs),
    )
    .await?;
    info!(address = %args.listen, mocks = rule_count, "start server");

    server.serve(grpc_mimic::server::shutdown_signal()).await
}
