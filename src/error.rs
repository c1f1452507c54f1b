//! Closed error taxonomy for the upgrader and the virtual loop.

use thiserror::Error;

/// Failures raised while negotiating a WebSocket upgrade.
///
/// Surfaced through the future returned by
/// [`Upgrader::build_upgrade_response`](crate::upgrade::Upgrader::build_upgrade_response);
/// the enclosing HTTP upgrade framework is responsible for turning either
/// variant into a 4xx response and closing the connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UpgradeError {
    /// A required upgrade header was missing, duplicated (e.g. supplied as a
    /// comma-separated list where exactly one value is required), or held an
    /// unsupported value. The field names the offending header.
    #[error("invalid or missing upgrade header: {0}")]
    InvalidUpgradeHeader(&'static str),

    /// The `should_upgrade` predicate declined the request.
    #[error("request was not accepted as a WebSocket upgrade target")]
    UnsupportedWebSocketTarget,
}

/// Failures raised by [`VirtualLoop`](crate::virtual_loop::VirtualLoop) operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LoopError {
    /// [`VirtualLoop::await_future`](crate::virtual_loop::VirtualLoop::await_future)
    /// did not observe completion within the given timeout.
    #[error("timed out awaiting future completion")]
    TimeoutAwaitingFuture,

    /// The loop is draining, or has finished draining; the task never ran.
    #[error("the loop is shutting down and can no longer accept work")]
    Shutdown,
}

/// Opaque error returned by pipeline-handler installation.
///
/// The pipeline itself is an external collaborator (see [`crate::pipeline`]);
/// this crate only needs to propagate whatever it reports, so it is boxed
/// the same way `tower::BoxError` boxes service errors.
pub type PipelineError = Box<dyn std::error::Error + Send + Sync + 'static>;
