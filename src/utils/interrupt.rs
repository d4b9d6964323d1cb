// dbsnapshot/src/utils/interrupt.rs
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::errors::BackupError;

/// Per-invocation stop conditions: an external shutdown signal and a wall-clock deadline.
///
/// Stages call [`Interrupt::check`] at their boundaries and race long awaits against
/// [`Interrupt::triggered`].
#[derive(Debug, Clone)]
pub struct Interrupt {
    shutdown: CancellationToken,
    deadline: Instant,
    limit: Duration,
}

impl Interrupt {
    pub fn new(shutdown: CancellationToken, limit: Duration) -> Self {
        Self {
            shutdown,
            deadline: Instant::now() + limit,
            limit,
        }
    }

    /// A tighter budget for one stage, still bounded by the overall deadline.
    pub fn narrowed(&self, limit: Duration) -> Self {
        let candidate = Instant::now() + limit;
        if candidate < self.deadline {
            Self {
                shutdown: self.shutdown.clone(),
                deadline: candidate,
                limit,
            }
        } else {
            self.clone()
        }
    }

    pub fn check(&self) -> Result<(), BackupError> {
        if self.shutdown.is_cancelled() {
            return Err(BackupError::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(self.timeout());
        }
        Ok(())
    }

    /// Resolves once the invocation must stop, yielding the matching error.
    pub async fn triggered(&self) -> BackupError {
        tokio::select! {
            _ = self.shutdown.cancelled() => BackupError::Cancelled,
            _ = sleep_until(self.deadline) => self.timeout(),
        }
    }

    /// Runs `work` until it finishes or the invocation must stop, whichever comes first.
    ///
    /// `work` is dropped when the interrupt wins.
    pub async fn bound<T, F>(&self, work: F) -> Result<T, BackupError>
    where
        F: Future<Output = Result<T, BackupError>>,
    {
        tokio::select! {
            outcome = work => outcome,
            stop = self.triggered() => Err(stop),
        }
    }

    fn timeout(&self) -> BackupError {
        BackupError::Timeout {
            limit_secs: self.limit.as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[tokio::test]
    async fn cancelled_token_reports_cancelled() {
        let token = CancellationToken::new();
        let interrupt = Interrupt::new(token.clone(), Duration::from_secs(60));
        assert!(interrupt.check().is_ok());

        token.cancel();
        assert_eq!(interrupt.check().unwrap_err().kind(), ErrorKind::Cancelled);
        assert_eq!(interrupt.triggered().await.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn expired_deadline_reports_timeout() {
        let interrupt = Interrupt::new(CancellationToken::new(), Duration::ZERO);
        assert_eq!(interrupt.check().unwrap_err().kind(), ErrorKind::Timeout);
        assert_eq!(interrupt.triggered().await.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn bound_stops_work_that_never_finishes() {
        let interrupt = Interrupt::new(CancellationToken::new(), Duration::from_millis(50));
        let stopped = interrupt
            .bound(std::future::pending::<Result<(), BackupError>>())
            .await;
        assert_eq!(stopped.unwrap_err().kind(), ErrorKind::Timeout);

        let token = CancellationToken::new();
        let interrupt = Interrupt::new(token.clone(), Duration::from_secs(60));
        assert_eq!(interrupt.bound(async { Ok(7) }).await.unwrap(), 7);
        token.cancel();
        let stopped = interrupt
            .bound(std::future::pending::<Result<(), BackupError>>())
            .await;
        assert_eq!(stopped.unwrap_err().kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn narrowed_never_extends_the_deadline() {
        let outer = Interrupt::new(CancellationToken::new(), Duration::ZERO);
        let inner = outer.narrowed(Duration::from_secs(3600));
        assert_eq!(inner.check().unwrap_err().kind(), ErrorKind::Timeout);

        let outer = Interrupt::new(CancellationToken::new(), Duration::from_secs(3600));
        let inner = outer.narrowed(Duration::ZERO);
        assert!(outer.check().is_ok());
        assert!(inner.check().is_err());
    }
}
