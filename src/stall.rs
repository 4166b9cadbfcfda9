//! Bootstrap stall detection and the transport cascade.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::transport::Transport;

/// How long bootstrap may go without progress.
pub const LIVENESS_GRACE: Duration = Duration::from_secs(30);

/// Stall check interval.
pub const TICK: Duration = Duration::from_secs(1);

/// Deadline by which the connection must show signs of life.
#[derive(Debug)]
pub struct Liveness {
    deadline: Mutex<Instant>,
    grace: Duration,
}

impl Liveness {
    pub fn new(grace: Duration) -> Self {
        Self {
            deadline: Mutex::new(Instant::now() + grace),
            grace,
        }
    }

    /// Push the deadline out to now + grace.
    pub fn connection_alive(&self) {
        let mut deadline = self.deadline.lock().unwrap_or_else(|p| p.into_inner());
        *deadline = Instant::now() + self.grace;
    }

    pub fn is_stalled(&self) -> bool {
        let deadline = *self.deadline.lock().unwrap_or_else(|p| p.into_inner());
        Instant::now() > deadline
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new(LIVENESS_GRACE)
    }
}

/// What the guard does after handling a stall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallOutcome {
    Continue,
    GiveUp,
}

/// Next transport in the cascade, or `None` once all have been tried.
pub fn next_transport(current: Transport, has_custom_bridges: bool) -> Option<Transport> {
    match current {
        Transport::None => Some(Transport::Snowflake),
        Transport::Snowflake | Transport::SnowflakeAmp if has_custom_bridges => {
            Some(Transport::Custom)
        }
        Transport::Snowflake | Transport::SnowflakeAmp => Some(Transport::Obfs4),
        Transport::Custom => Some(Transport::Obfs4),
        Transport::Obfs4 => None,
    }
}

/// Periodic stall check.
///
/// Every tick where the liveness deadline has passed runs `on_stall`. The
/// task ends for good once `on_stall` returns [`StallOutcome::GiveUp`]. The
/// guard is aborted when dropped.
#[derive(Debug)]
pub struct StallGuard {
    task: JoinHandle<()>,
    finishing: Arc<AtomicBool>,
}

impl StallGuard {
    pub fn spawn<F, Fut>(liveness: Arc<Liveness>, tick: Duration, mut on_stall: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = StallOutcome> + Send + 'static,
    {
        let finishing = Arc::new(AtomicBool::new(false));
        let done = finishing.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if done.load(Ordering::SeqCst) {
                    break;
                }
                if !liveness.is_stalled() {
                    continue;
                }
                if on_stall().await == StallOutcome::GiveUp {
                    tracing::debug!("Stall guard giving up");
                    break;
                }
                if done.load(Ordering::SeqCst) {
                    break;
                }
            }
        });
        Self { task, finishing }
    }

    /// Abort immediately, even in the middle of a stall handler.
    pub fn stop(&self) {
        self.task.abort();
    }

    /// Stop checking for stalls. A handler already running completes first.
    pub fn finish(&self) {
        self.finishing.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for StallGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}
