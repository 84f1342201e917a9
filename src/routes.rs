use std::convert::Infallible;
use std::sync::Arc;

use tracing::warn;
use warp::Filter;

use crate::metrics::SeriesRegistry;
use crate::services::helpers::{docker_helper, system_helper};
use crate::services::usage::resolve_usages;

/// Creates the metrics scrape route.
///
/// This route listens for GET requests at the `/metrics` path and returns
/// the current host and container usage in the Prometheus text exposition
/// format. Each request triggers a fresh scrape; see [`handle_metrics`].
///
/// Returns a boxed Warp filter that handles scrape requests.
pub fn metrics_route(
    registry: Arc<SeriesRegistry>,
) -> warp::filters::BoxedFilter<(impl warp::Reply,)> {
    warp::get()
        .and(warp::path("metrics"))
        .and(with_registry(registry))
        .and_then(handle_metrics)
        .boxed()
}

/// Creates the route for health checks.
///
/// This route listens for GET requests at the `/health` path.
/// It is used to verify the server's status and returns a JSON response "OK".
///
/// Returns a boxed Warp filter that handles health check requests.
pub fn health_check_route() -> warp::filters::BoxedFilter<(impl warp::Reply,)> {
    warp::get()
        .and(warp::path("health"))
        .map(|| warp::reply::json(&"OK"))
        .boxed()
}

fn with_registry(
    registry: Arc<SeriesRegistry>,
) -> impl Filter<Extract = (Arc<SeriesRegistry>,), Error = Infallible> + Clone {
    warp::any().map(move || registry.clone())
}

/// Handles one scrape.
///
/// Samples the host (this blocks the request for about a second while the
/// CPU average settles), then the container backend, and applies both to
/// the registry in one atomic step. A scrape always answers 200: when the
/// backend is unreachable the body degrades to host series only.
async fn handle_metrics(
    registry: Arc<SeriesRegistry>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let host = system_helper::sample_host().await;

    let containers = match docker_helper::sample_containers().await {
        Ok(samples) => Some(resolve_usages(samples)),
        Err(e) => {
            warn!("{}; exporting host metrics only", e);
            None
        }
    };

    let body = registry.apply_scrape(&host, containers.as_deref());

    Ok(warp::reply::with_header(
        String::from_utf8_lossy(&body).into_owned(),
        "content-type",
        prometheus::TEXT_FORMAT,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_check_returns_ok() {
        let res = warp::test::request()
            .method("GET")
            .path("/health")
            .reply(&health_check_route())
            .await;

        assert_eq!(res.status(), 200);
        assert_eq!(res.body(), "\"OK\"");
    }

    // Runs against whatever the test host offers: with no Docker daemon the
    // scrape degrades to host series, but the endpoint must still answer 200
    // with a well-formed exposition body.
    #[tokio::test]
    async fn metrics_endpoint_always_answers() {
        let registry = Arc::new(SeriesRegistry::new());
        let res = warp::test::request()
            .method("GET")
            .path("/metrics")
            .reply(&metrics_route(registry))
            .await;

        assert_eq!(res.status(), 200);
        assert_eq!(
            res.headers().get("content-type").map(|v| v.to_str().unwrap()),
            Some(prometheus::TEXT_FORMAT)
        );

        let body = String::from_utf8_lossy(res.body());
        assert!(body.contains("system_cpu_percent"));
        assert!(body.contains("system_memory_percent"));
        assert!(body.contains("system_disk_usage_percent"));
    }
}
