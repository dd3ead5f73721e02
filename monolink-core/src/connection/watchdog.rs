//! Read-side idle detection.
//!
//! Each decode races two timers. The ceiling is counted from the start of the
//! read and, when it fires, shuts the socket down. The read deadline is pushed
//! to `now + heartbeat` every time a decode completes, so a peer that stays
//! silent past its heartbeat interval times out on its next read.
//!
//! Both durations are capped to [`MAX_TIMER_MS`]: the runtime's timer wheel
//! panics on deadlines too far ahead.

use std::{future::Future, io, time::Duration};

use monoio::time::Instant;

use crate::config::MAX_TIMER_MS;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdleTimeout {
    #[error("idle ceiling of {0:?} reached")]
    Ceiling(Duration),
    #[error("read deadline passed")]
    Deadline,
}

impl From<IdleTimeout> for io::Error {
    fn from(e: IdleTimeout) -> Self {
        io::Error::new(io::ErrorKind::TimedOut, e)
    }
}

#[derive(Debug)]
pub(crate) struct IdleWatchdog {
    interval: Duration,
    ceiling: Duration,
    deadline: Option<Instant>,
}

impl IdleWatchdog {
    pub(crate) fn new(interval: Duration, ceiling: Duration) -> Self {
        let max = Duration::from_millis(MAX_TIMER_MS);
        Self {
            interval: interval.min(max),
            ceiling: ceiling.min(max),
            deadline: None,
        }
    }

    /// Drives `read` under the watchdog. `on_ceiling` runs only when the
    /// ceiling fires.
    pub(crate) async fn watch<F, C>(
        &mut self,
        read: F,
        on_ceiling: C,
    ) -> Result<F::Output, IdleTimeout>
    where
        F: Future,
        C: FnOnce(),
    {
        let deadline = self.deadline;
        let ceiling = self.ceiling;
        let expired = async move {
            match deadline {
                Some(deadline) => monoio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        monoio::select! {
            out = read => {
                self.deadline = Instant::now().checked_add(self.interval);
                Ok(out)
            }
            _ = monoio::time::sleep(ceiling) => {
                on_ceiling();
                Err(IdleTimeout::Ceiling(ceiling))
            }
            _ = expired => Err(IdleTimeout::Deadline),
        }
    }
}
