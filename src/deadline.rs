use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{ChannelError, ChannelResult};

/// A point in time after which an operation must fail rather than keep waiting.
///
/// Deadlines propagate from the outermost message's finish time: nested operations
///  (handshake sub-steps, resend attempts) compute their remaining budget from the
///  shared deadline rather than resetting a fresh timeout of their own.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Deadline {
    finish: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Deadline {
        Deadline {
            finish: Instant::now() + budget,
            budget,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.finish
    }

    /// The budget left, or `None` once the deadline has elapsed.
    pub fn remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        if now >= self.finish {
            None
        }
        else {
            Some(self.finish - now)
        }
    }

    /// Fail fast with a `Timeout` if the deadline has already elapsed - callers use
    ///  this before attempting any carrier I/O.
    pub fn check(&self, operation: &'static str) -> ChannelResult<()> {
        if self.expired() {
            Err(self.timeout_error(operation))
        }
        else {
            Ok(())
        }
    }

    /// Run a future, failing with a `Timeout` when the deadline elapses first.
    pub async fn run<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = ChannelResult<T>>,
    ) -> ChannelResult<T> {
        match tokio::time::timeout_at(self.finish, fut).await {
            Ok(result) => result,
            Err(_) => Err(self.timeout_error(operation)),
        }
    }

    pub fn timeout_error(&self, operation: &'static str) -> ChannelError {
        ChannelError::Timeout {
            operation,
            budget: self.budget,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use rstest::*;

    #[rstest]
    fn test_check_before_io() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let deadline = Deadline::after(Duration::from_millis(10));
            assert!(deadline.check("send").is_ok());

            tokio::time::sleep(Duration::from_millis(11)).await;
            assert!(deadline.expired());
            assert_eq!(deadline.remaining(), None);

            let err = deadline.check("send").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Timeout);
        });
    }

    #[rstest]
    fn test_run_times_out() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let deadline = Deadline::after(Duration::from_millis(5));
            let result: ChannelResult<()> = deadline
                .run("wait", async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                })
                .await;
            assert_eq!(result.unwrap_err().kind(), ErrorKind::Timeout);
        });
    }

    #[rstest]
    fn test_run_completes_within_budget() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let deadline = Deadline::after(Duration::from_secs(1));
            let result = deadline.run("wait", async { Ok(42) }).await;
            assert_eq!(result.unwrap(), 42);
        });
    }
}
