use anyhow::{Error as AnyError, Result as AnyResult};
use futures::FutureExt;
use std::future::Future;
use std::time::Duration;
use tokio::{spawn, task::JoinHandle};
use tracing::error;

#[macro_export]
macro_rules! require {
    ($condition:expr, $err:expr) => {
        if !$condition {
            return Err($err);
        }
    };
}

pub trait Any<A> {
    fn any(self) -> AnyResult<A>;
}

impl<A, B> Any<A> for Result<A, B>
where
    B: Into<AnyError>,
{
    fn any(self) -> AnyResult<A> {
        self.map_err(Into::into)
    }
}

pub trait AnyFlatten<A> {
    fn any_flatten(self) -> AnyResult<A>;
}

impl<A, B, C> AnyFlatten<A> for Result<Result<A, B>, C>
where
    B: Into<AnyError>,
    C: Into<AnyError>,
{
    fn any_flatten(self) -> AnyResult<A> {
        self.map_err(Into::into)
            .and_then(|inner| inner.map_err(Into::into))
    }
}

/// Spawn a task and abort the process if it resolves with an error. For
/// invariants whose violation means the process is in an unrecoverable
/// state (e.g. `ApplicationError` from a corrupt gas queue).
pub fn spawn_or_abort<F>(future: F) -> JoinHandle<()>
where
    F: Future<Output = AnyResult<()>> + Send + 'static,
{
    spawn(future.map(|result| {
        if let Err(error) = result {
            error!(?error, "Error in task");
            std::process::abort();
        }
    }))
}

/// Spawns a task that restarts `future_spawner()` with a fixed backoff
/// whenever it returns an error, until the process-wide shutdown signal
/// fires.
pub fn spawn_monitored_with_backoff<S, F>(future_spawner: S, backoff: Duration) -> JoinHandle<()>
where
    F: Future<Output = AnyResult<()>> + Send + 'static,
    S: Fn() -> F + Send + Sync + 'static,
{
    spawn(async move {
        loop {
            let task = future_spawner();
            tokio::select! {
                result = task => {
                    match result {
                        Ok(()) => return,
                        Err(error) => {
                            error!(?error, "Monitored task failed, restarting after backoff");
                            if crate::shutdown::is_shutting_down() {
                                return;
                            }
                            tokio::time::sleep(backoff).await;
                        }
                    }
                }
                () = crate::shutdown::await_shutdown() => return,
            }
        }
    })
}
