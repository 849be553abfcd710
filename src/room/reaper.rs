#![forbid(unsafe_code)]

// Deferred room teardown after the owner's connection closes

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Teardown state of one room.
#[derive(Debug, Default)]
pub enum RoomPhase {
    /// No teardown pending
    #[default]
    Stable,
    /// Owner disconnected; the room is destroyed at the deadline unless reclaimed
    GracePeriod(GracePeriod),
}

impl RoomPhase {
    pub fn is_grace_period(&self) -> bool {
        matches!(self, RoomPhase::GracePeriod(_))
    }

    /// Whether the pending timer identified by `epoch` still owns this room
    pub fn is_current(&self, epoch: u64) -> bool {
        matches!(self, RoomPhase::GracePeriod(g) if g.epoch == epoch)
    }

    /// Returns to Stable, cancelling any running timer. True if a timer was cancelled.
    pub fn cancel(&mut self) -> bool {
        match std::mem::take(self) {
            RoomPhase::GracePeriod(grace) => {
                grace.token.cancel();
                true
            }
            RoomPhase::Stable => false,
        }
    }
}

/// A running grace timer. Cancelling the token stops the timer task before it
/// calls back; a timer that already fired is fenced by its epoch instead.
#[derive(Debug)]
pub struct GracePeriod {
    deadline: Instant,
    epoch: u64,
    token: CancellationToken,
}

impl GracePeriod {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Spawns one cancellable timer per room entering its grace period.
///
/// Whoever owns the room table decides what expiry means: the timer only
/// invokes the callback with its epoch, and the callback must check under the
/// table lock that the room is still in that same grace period. Cancellation
/// (`RoomPhase::cancel`) happens under that same lock, so a room is either
/// reclaimed or destroyed, never both.
pub struct DisconnectReaper {
    delay: Duration,
    next_epoch: AtomicU64,
}

impl DisconnectReaper {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            next_epoch: AtomicU64::new(1),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn start<F, Fut>(&self, room_id: &str, on_expire: F) -> GracePeriod
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + self.delay;
        let token = CancellationToken::new();

        let cancelled = token.clone();
        let room_id = room_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {
                    debug!("Grace timer {} for room {} cancelled", epoch, room_id);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    debug!("Grace timer {} for room {} fired", epoch, room_id);
                    on_expire(epoch).await;
                }
            }
        });

        GracePeriod {
            deadline,
            epoch,
            token,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let reaper = DisconnectReaper::new(Duration::from_secs(30));
        let fired = Arc::new(StdMutex::new(Vec::new()));

        let sink = fired.clone();
        let grace = reaper.start("r1", move |epoch| async move {
            sink.lock().unwrap().push(epoch);
        });

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(fired.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*fired.lock().unwrap(), vec![grace.epoch()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_callback() {
        let reaper = DisconnectReaper::new(Duration::from_secs(30));
        let fired = Arc::new(StdMutex::new(0));

        let sink = fired.clone();
        let mut phase = RoomPhase::GracePeriod(reaper.start("r1", move |_| async move {
            *sink.lock().unwrap() += 1;
        }));
        assert!(phase.is_grace_period());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(phase.cancel());
        assert!(!phase.cancel());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(*fired.lock().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_epochs_fence_stale_timers() {
        let reaper = DisconnectReaper::new(Duration::from_secs(1));
        let first = reaper.start("r1", |_| async {});
        let stale_epoch = first.epoch();
        let mut phase = RoomPhase::GracePeriod(first);
        phase.cancel();
        phase = RoomPhase::GracePeriod(reaper.start("r1", |_| async {}));

        assert!(!phase.is_current(stale_epoch));
        assert!(phase.is_current(stale_epoch + 1));
    }
}
