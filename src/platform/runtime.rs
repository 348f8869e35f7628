use std::future::Future;
use std::time::Duration;

/// Spawns a background task on the ambient executor.
#[cfg(target_arch = "wasm32")]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    wasm_bindgen_futures::spawn_local(future);
}

/// Spawns a background task on the ambient executor.
///
/// Uses the current tokio runtime when called from inside one, otherwise a
/// lazily created single-threaded runtime that lives for the whole process.
#[cfg(not(target_arch = "wasm32"))]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    use std::sync::OnceLock;
    use tokio::runtime::{Builder, Handle, Runtime};

    static BACKGROUND_RUNTIME: OnceLock<Option<Runtime>> = OnceLock::new();

    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
        return;
    }

    let runtime = BACKGROUND_RUNTIME.get_or_init(|| {
        match Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
        {
            Ok(runtime) => Some(runtime),
            Err(err) => {
                log::error!(
                    target: "firestore::runtime",
                    "failed to build background runtime: {err}"
                );
                None
            }
        }
    });

    if let Some(runtime) = runtime {
        runtime.spawn(future);
    }
}

/// Waits for `duration` using the platform timer.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }

    sleep_impl(duration).await;
}

/// Drives a future to completion on the calling thread.
///
/// Only used by the deterministic scheduler, whose futures never wait on a
/// reactor.
pub fn block_on<F: Future>(future: F) -> F::Output {
    futures::executor::block_on(future)
}

#[cfg(target_arch = "wasm32")]
async fn sleep_impl(duration: Duration) {
    gloo_timers::future::sleep(duration).await;
}

#[cfg(not(target_arch = "wasm32"))]
async fn sleep_impl(duration: Duration) {
    tokio::time::sleep(duration).await;
}
