//! Bridges the executor's plain worker threads to the async `TaskStore`/
//! `TelemetrySink` collaborators. Grounded in the common pattern of
//! spawning a single lazily-created multi-thread tokio runtime and blocking
//! the calling thread on a channel until the async work completes, so sync
//! worker code never has to become `async fn` end to end.
use std::sync::OnceLock;

static RUNTIME: OnceLock<tokio::runtime::Runtime> = OnceLock::new();

fn runtime() -> &'static tokio::runtime::Runtime {
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("executor-bridge")
            .enable_all()
            .build()
            .expect("failed to build bridging runtime")
    })
}

/// Runs `fut` to completion on the shared bridging runtime and blocks the
/// calling thread for the result. Must not be called from within an async
/// context already driven by this runtime (it would deadlock); the
/// executor's worker threads are plain `std::thread`s, so this is safe at
/// every call site in this crate.
pub fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    runtime().block_on(fut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_on_returns_async_result() {
        let result = block_on(async { 1 + 1 });
        assert_eq!(result, 2);
    }
}
