use std::future::Future;
use std::time::Duration;

use once_cell::sync::Lazy;
use tokio::runtime::{Builder, Handle};

/// Handle to a runtime driven by its own thread, used when the caller is not
/// inside a tokio context.
static BACKGROUND_HANDLE: Lazy<Option<Handle>> = Lazy::new(|| {
    let runtime = match Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            log::error!("failed to build background tokio runtime: {err}");
            return None;
        }
    };
    let handle = runtime.handle().clone();
    let spawned = std::thread::Builder::new()
        .name("firestore-sync-runtime".into())
        .spawn(move || runtime.block_on(std::future::pending::<()>()));
    match spawned {
        Ok(_) => Some(handle),
        Err(err) => {
            log::error!("failed to start background runtime thread: {err}");
            None
        }
    }
});

/// Spawns `future` on the current tokio runtime, or on the shared background
/// runtime when called from outside one.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
    } else if let Some(handle) = BACKGROUND_HANDLE.as_ref() {
        handle.spawn(future);
    } else {
        log::error!("no runtime available; dropping background task");
    }
}

/// Asynchronously waits for the provided duration.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    tokio::time::sleep(duration).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn spawns_outside_of_a_runtime() {
        let (tx, rx) = mpsc::channel();
        spawn_detached(async move {
            sleep(Duration::from_millis(1)).await;
            let _ = tx.send(42);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }
}
