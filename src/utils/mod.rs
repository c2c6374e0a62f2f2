//! Small shared helpers

pub mod throttle;

pub use throttle::LogThrottler;

use tokio::time::Instant;

/// Sleep until `deadline`, or forever when there is none
///
/// Lets an optional timer sit in a `tokio::select!` branch.
pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
