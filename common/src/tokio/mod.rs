//! Tokio re-exports used across the workspace.
//!
//! Crates depend on `discv5_common::tokio` instead of `tokio` directly so the
//! runtime features are configured in a single place.

use std::future::Future;

use log::trace;

pub use tokio::{net, select, sync, task, time};

/// Spawn a named task on the current runtime.
///
/// The name is only used for tracing; it makes task lifecycles readable in the logs.
pub fn spawn_task<F>(name: &'static str, future: F) -> task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    if log::log_enabled!(log::Level::Trace) {
        trace!("Spawning task: {}", name);
    }

    tokio::spawn(async move {
        let output = future.await;
        if log::log_enabled!(log::Level::Trace) {
            trace!("Task {} finished", name);
        }
        output
    })
}
