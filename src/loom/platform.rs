#[cfg(not(target_arch = "wasm32"))]
pub type BoxFuture<'a, T> = futures::future::BoxFuture<'a, T>;
#[cfg(target_arch = "wasm32")]
pub type BoxFuture<'a, T> = futures::future::LocalBoxFuture<'a, T>;

/// Runs a blocking closure off the calling task.
///
/// Uses the ambient tokio blocking pool if there is one, otherwise a plain thread.
#[cfg(not(target_arch = "wasm32"))]
pub fn spawn_blocking<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => _ = handle.spawn_blocking(f),
        Err(_) => _ = std::thread::spawn(f),
    }
}

#[cfg(target_arch = "wasm32")]
pub fn spawn_blocking<F>(f: F)
where
    F: FnOnce() + 'static,
{
    f()
}
