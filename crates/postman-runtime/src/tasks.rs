//! Spawning helpers that keep a panicking task from taking the daemon down.
//!
//! A panic inside a tokio task is caught by the runtime and surfaces as a
//! [`JoinError`]; these helpers log it instead of propagating it. The panic
//! hook installed by the binary records the backtrace.

use std::any::Any;
use std::future::Future;

use tokio::task::{JoinError, JoinHandle};

/// Spawn `fut` and log how it ends. The returned handle resolves once the
/// task has finished and its outcome has been logged.
pub fn spawn_supervised<F>(name: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let task = tokio::spawn(fut);
    tokio::spawn(async move {
        match task.await {
            Ok(()) => tracing::debug!(task = name, "task finished"),
            Err(e) => log_join_error(name, e),
        }
    })
}

/// Run blocking work on the blocking pool. A panic is logged and yields
/// `None`.
pub async fn run_blocking<T, F>(name: &'static str, f: F) -> Option<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => Some(value),
        Err(e) => {
            log_join_error(name, e);
            None
        }
    }
}

fn log_join_error(name: &'static str, e: JoinError) {
    if e.is_panic() {
        let payload = e.into_panic();
        tracing::error!(task = name, panic = %panic_message(payload.as_ref()), "task panicked");
    } else {
        tracing::debug!(task = name, "task cancelled");
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_supervised_panic_does_not_propagate() {
        let handle = spawn_supervised("boom", async {
            panic!("timer callback failed");
        });
        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn test_other_tasks_keep_running_after_panic() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        let failing = spawn_supervised("failing", async { panic!("boom") });
        let healthy = spawn_supervised("healthy", async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            flag.store(true, Ordering::SeqCst);
        });

        failing.await.unwrap();
        healthy.await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_blocking_returns_value_or_none() {
        assert_eq!(run_blocking("ok", || 7).await, Some(7));
        let none: Option<u8> = run_blocking("panics", || panic!("bad")).await;
        assert!(none.is_none());
    }

    #[test]
    fn test_panic_message_variants() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(5_u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }
}
