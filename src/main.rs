use axum::{
    Extension,
    routing::{get, post},
};
use partition_router::client::cache::Router;
use partition_router::client::handlers::{
    handle_get, handle_put, handle_remove, handle_scan, handle_stats, handle_topology_push,
};
use partition_router::config::RouterConfig;
use partition_router::dispatch::transport::HttpTransport;
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        // .with_max_level(tracing::Level::DEBUG)
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 5 {
        eprintln!(
            "Usage: {} --bind <addr:port> --server <host:port> [--server <host:port> ...]",
            args[0]
        );
        eprintln!("Options: --max-retries <n> --batch-size <n> --refresh-timeout-ms <ms>");
        eprintln!("         --request-timeout-ms <ms> --scan-timeout-ms <ms> --intelligence <basic|topology|hash>");
        eprintln!(
            "Example: {} --bind 127.0.0.1:7000 --server 127.0.0.1:11222 --server 127.0.0.1:11223",
            args[0]
        );

        std::process::exit(1);
    }

    let mut bind_addr: Option<SocketAddr> = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" if i + 1 < args.len() => {
                bind_addr = Some(args[i + 1].parse()?);
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }
    let bind_addr = bind_addr.ok_or_else(|| anyhow::anyhow!("--bind is required"))?;

    // 1. Configuration:
    let config = RouterConfig::from_args(&args[1..])?;
    tracing::info!("Starting router on {}", bind_addr);
    tracing::info!("Initial servers: {:?}", config.initial_servers);

    // 2. Routing core:
    let router = Router::new(config, Arc::new(HttpTransport::new()))?;

    // 3. HTTP Router:
    let app = axum::Router::new()
        .route("/topology/:cache", post(handle_topology_push))
        .route(
            "/cache/:cache/:key",
            get(handle_get).put(handle_put).delete(handle_remove),
        )
        .route("/cache/:cache", get(handle_scan))
        .route("/stats", get(handle_stats))
        .layer(Extension(router.clone()));

    // 4. Spawn stats reporter:
    let stats_router = router.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));

        loop {
            interval.tick().await;
            let stats = stats_router.stats();
            tracing::info!(
                "Router stats: {} retries, {} pending dispatches",
                stats.retries,
                stats.pending_dispatches
            );
            for cache in stats.caches {
                if let Some(topology) = cache.topology {
                    tracing::info!(
                        "  - {} v{} ({} partitions, {} servers)",
                        cache.name,
                        topology.version,
                        topology.partition_count,
                        topology.partitions_per_server.len()
                    );
                }
            }
        }
    });

    // 5. Start HTTP server:
    tracing::info!("HTTP server listening on {}", bind_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
