use thiserror::Error;

/// Errors raised while collecting container metrics.
///
/// A counter anomaly (cumulative CPU counters that fail to advance between
/// the two readings) is not represented here: the calculator recovers it in
/// place by reporting `0.0` for that container.
#[derive(Debug, Error)]
pub enum ScrapeError {
    /// The Docker daemon could not be reached or rejected the request.
    ///
    /// A scrape degrades to host-only metrics when this happens; it never
    /// turns into a failed HTTP response.
    #[error("container backend unavailable: {0}")]
    BackendUnavailable(#[from] bollard::errors::Error),

    /// A container reported a zero memory limit, so its memory percentage
    /// cannot be computed. The memory series is skipped for this scrape.
    #[error("invalid memory limit: {0}")]
    InvalidLimit(u64),
}
