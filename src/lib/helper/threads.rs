use std::thread;

use anyhow::{Context, Result};
use tracing::*;

/// Spawns an OS thread with a name, so it shows up in logs and profilers.
pub fn spawn_named<F, T>(name: impl Into<String>, f: F) -> Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let name = name.into();
    thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .with_context(|| format!("Failed spawning thread {name:?}"))
}

/// Joins a thread, logging instead of propagating a panic.
pub fn join_logged<T>(name: &str, handle: thread::JoinHandle<T>) -> Option<T> {
    match handle.join() {
        Ok(value) => {
            debug!("Thread {name:?} finished");
            Some(value)
        }
        Err(_) => {
            error!("Thread {name:?} panicked");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_thread_keeps_its_name() {
        let handle = spawn_named("sync-test", || {
            thread::current().name().map(str::to_string)
        })
        .unwrap();
        assert_eq!(join_logged("sync-test", handle).flatten().as_deref(), Some("sync-test"));
    }

    #[test]
    fn panicking_thread_is_reported() {
        let handle = spawn_named("sync-panic", || panic!("boom")).unwrap();
        assert!(join_logged::<()>("sync-panic", handle).is_none());
    }
}
