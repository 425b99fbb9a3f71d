use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Result, ScanError};

/// A single point in time by which the whole scan must finish.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Fails if the deadline has already passed.
    pub fn check(&self, during: &'static str) -> Result<()> {
        if Instant::now() >= self.at {
            return Err(ScanError::DeadlineExceeded { during });
        }
        Ok(())
    }

    /// Awaits `fut`, dropping it when the deadline passes.
    pub async fn run<T, F>(&self, during: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check(during)?;
        tokio::time::timeout_at(self.at, fut)
            .await
            .map_err(|_| ScanError::DeadlineExceeded { during })?
    }

    /// Runs blocking work on the blocking pool under the deadline. On expiry
    /// the work is abandoned, not interrupted; whatever it wrote stays.
    pub async fn blocking<T, F>(&self, during: &'static str, work: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.run(during, async move {
            match tokio::task::spawn_blocking(work).await {
                Ok(result) => result,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => Err(ScanError::DeadlineExceeded { during }),
            }
        })
        .await
    }
}
