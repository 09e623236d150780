//! Spawned worker tasks with graceful stop and forced termination fallback.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A worker did not finish within its bounded join wait and was aborted.
#[derive(Debug, Error)]
#[error("{name} did not stop within {waited:?} and was terminated")]
pub struct StopTimeout {
    pub name: String,
    pub waited: Duration,
}

/// Handle to a running task whose loop observes a [`CancellationToken`].
pub struct Worker {
    name: String,
    stop: CancellationToken,
    join: JoinHandle<()>,
}

impl Worker {
    /// Spawn `fut` on the runtime. `fut` is expected to return soon after `stop` is set.
    pub fn spawn<F>(name: impl Into<String>, stop: CancellationToken, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        log::info!("starting {}", name);
        Self {
            name,
            stop,
            join: tokio::spawn(fut),
        }
    }

    /// Request a cooperative stop and wait at most `wait` for the task to end.
    /// On timeout the task is aborted and `StopTimeout` is returned. The aborted task gets another
    /// `wait` to unwind, so its resources are released by the time this returns.
    pub async fn stop(mut self, wait: Duration) -> Result<(), StopTimeout> {
        log::info!("stopping {}", self.name);
        self.stop.cancel();
        match tokio::time::timeout(wait, &mut self.join).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                log::warn!("{} ended abnormally: {}", self.name, e);
                Ok(())
            }
            Err(_) => {
                self.join.abort();
                if tokio::time::timeout(wait, &mut self.join).await.is_err() {
                    log::error!("{} did not unwind after abort", self.name);
                }
                Err(StopTimeout {
                    name: self.name,
                    waited: wait,
                })
            }
        }
    }
}
