mod errors;
mod metrics;
mod routes;
mod services;

use std::env;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;
use warp::Filter;

use crate::metrics::SeriesRegistry;
use crate::routes::{health_check_route, metrics_route};

/// Entry point for the exporter.
///
/// Initializes and starts the Warp server. The server listens on
/// `127.0.0.1:3030` (override with `DOCKWATCH_PORT`) and provides the
/// following routes:
/// - `/metrics` (GET): Samples host and container usage and returns it in
///   the Prometheus text exposition format. Expect each scrape to take
///   about a second while the host CPU average settles.
/// - `/health` (GET): Provides a simple health check endpoint to verify the
///   server's status.
///
/// The series registry is created once here and handed to the scrape route;
/// it lives for the whole process.
///
/// # Example
///
/// To start the server, run the application and use the following curl
/// commands:
/// ```sh
/// # Health check
/// curl http://127.0.0.1:3030/health
///
/// # Scrape
/// curl http://127.0.0.1:3030/metrics
/// ```
#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let app_port: u16 = env::var("DOCKWATCH_PORT")
        .unwrap_or_else(|_| "3030".to_string())
        .parse()
        .unwrap_or(3030);

    let registry = Arc::new(SeriesRegistry::new());

    let api_routes = metrics_route(registry).or(health_check_route());

    info!("dockwatch listening on http://127.0.0.1:{}/metrics", app_port);

    warp::serve(api_routes)
        .run(([127, 0, 0, 1], app_port))
        .await;
}
