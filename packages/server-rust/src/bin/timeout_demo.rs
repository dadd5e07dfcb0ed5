use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use rpcguard_core::{interrupt, InterceptorLayer, MethodType, Status};
use rpcguard_server::{
    client_streaming_call, init_tracing, unary_call, CallOutcome, HandlerRegistry,
    InProcessServer, ServerCallTimeoutInterceptor, ServerTimeoutManager, TimeoutConfig,
};
use tower::ServiceBuilder;

const DOUBLE: &str = "demo.Work/Double";
const SUM: &str = "demo.Work/Sum";

/// Runs a unary and a client-streaming call through the timeout interceptor.
#[derive(Parser, Debug)]
#[command(name = "timeout-demo", version)]
struct Args {
    /// Timeout applied to every unary method, in milliseconds (0 disables).
    #[arg(long, env = "RPCGUARD_TIMEOUT_MS", default_value_t = 2_000)]
    timeout_ms: u64,

    /// How long each handler works before answering, in milliseconds.
    #[arg(long, env = "RPCGUARD_HANDLER_MS", default_value_t = 5_000)]
    handler_ms: u64,

    /// JSON timeout configuration; replaces --timeout-ms when given.
    #[arg(long, env = "RPCGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, env = "RPCGUARD_JSON_LOGS")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = match &args.config {
        Some(path) => TimeoutConfig::from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TimeoutConfig::with_timeout(Duration::from_millis(args.timeout_ms)),
    };
    tracing::info!(?config, handler_ms = args.handler_ms, "starting timeout demo");

    let runtime = tokio::runtime::Handle::current();
    let manager = Arc::new(ServerTimeoutManager::new(config, runtime.clone()));
    let interceptor = ServerCallTimeoutInterceptor::new(Arc::clone(&manager));
    let work = Duration::from_millis(args.handler_ms);

    let registry: Arc<HandlerRegistry<u64, u64>> = Arc::new(HandlerRegistry::new());
    registry.register(
        DOUBLE,
        MethodType::Unary,
        unary_call(move |n: u64| {
            interrupt::sleep(work)?;
            Ok::<_, Status>(n * 2)
        }),
    );
    // Streaming calls are never guarded, even with the interceptor in front.
    registry.register(
        SUM,
        MethodType::ClientStreaming,
        ServiceBuilder::new()
            .layer(InterceptorLayer::new(interceptor.clone()))
            .service(client_streaming_call(move |ns: Vec<u64>| {
                interrupt::sleep(work)?;
                Ok::<_, Status>(ns.iter().sum::<u64>())
            })),
    );

    let server = InProcessServer::new(registry, runtime).with_interceptor(interceptor);

    report(DOUBLE, server.unary(DOUBLE, 21).await);
    report(SUM, server.client_streaming(SUM, [1, 2, 3]).await);

    if !server.shutdown(work + Duration::from_secs(1)).await {
        tracing::warn!("calls still running at exit");
    }
    manager.shutdown();
    Ok(())
}

fn report(method: &str, outcome: CallOutcome<u64>) {
    let elapsed_ms = outcome.elapsed.as_millis();
    match outcome.into_result() {
        Ok(value) => println!("{method}: OK {value} after {elapsed_ms}ms"),
        Err(status) => println!("{method}: {status} after {elapsed_ms}ms"),
    }
}
