// Single-flight guard for the saved-notification reconciliation pass.

use std::time::Duration;

use tokio::sync::watch;

/// Outcome of [`ReconcileGuard::enter_or_wait`].
#[derive(Debug)]
pub enum Admission<'a> {
    /// No pass was running; the caller runs one and holds the permit until done.
    Leader(GuardPermit<'a>),
    /// Another pass was running and has finished. The caller did no work.
    Waited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("timed out after {0:?} waiting for the in-flight pass")]
pub struct GuardTimeout(pub Duration);

#[derive(Debug, Clone, Copy, Default)]
struct GuardState {
    active: bool,
    /// Bumped each time a pass ends.
    finished: u64,
}

/// At most one pass is active at a time. Callers arriving during a pass park on
/// a watch channel and are woken when that pass ends, so nothing polls.
#[derive(Debug)]
pub struct ReconcileGuard {
    state: watch::Sender<GuardState>,
}

impl Default for ReconcileGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconcileGuard {
    pub fn new() -> Self {
        let (state, _) = watch::channel(GuardState::default());
        Self { state }
    }

    pub fn is_active(&self) -> bool {
        self.state.borrow().active
    }

    /// Callers currently parked behind an active pass.
    pub fn waiting(&self) -> usize {
        self.state.receiver_count()
    }

    pub async fn enter_or_wait(&self, timeout: Duration) -> Result<Admission<'_>, GuardTimeout> {
        // Check-and-set happens under the channel's lock.
        let mut in_flight = 0;
        let entered = self.state.send_if_modified(|state| {
            if state.active {
                in_flight = state.finished;
                false
            } else {
                state.active = true;
                true
            }
        });
        if entered {
            return Ok(Admission::Leader(GuardPermit { state: &self.state }));
        }

        // Wait for the pass that was running to end, not for the flag to be
        // clear: a new leader may already have taken it by the time we run.
        let mut rx = self.state.subscribe();
        let wait = async {
            // The sender lives as long as `self`, so this cannot observe a close.
            let _ = rx.wait_for(|state| state.finished != in_flight).await;
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(()) => Ok(Admission::Waited),
            Err(_) => Err(GuardTimeout(timeout)),
        }
    }
}

/// Ends the pass when dropped, on every exit path of the pass.
#[derive(Debug)]
pub struct GuardPermit<'a> {
    state: &'a watch::Sender<GuardState>,
}

impl Drop for GuardPermit<'_> {
    fn drop(&mut self) {
        self.state.send_modify(|state| {
            state.active = false;
            state.finished = state.finished.wrapping_add(1);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const LONG: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn first_caller_leads_and_flag_clears_on_drop() {
        let guard = ReconcileGuard::new();
        assert!(!guard.is_active());

        let admission = guard.enter_or_wait(LONG).await.unwrap();
        assert!(matches!(admission, Admission::Leader(_)));
        assert!(guard.is_active());

        drop(admission);
        assert!(!guard.is_active());

        // A fresh caller leads again.
        let again = guard.enter_or_wait(LONG).await.unwrap();
        assert!(matches!(again, Admission::Leader(_)));
    }

    #[tokio::test]
    async fn second_caller_waits_for_leader_without_leading() {
        let guard = Arc::new(ReconcileGuard::new());
        let admission = guard.enter_or_wait(LONG).await.unwrap();

        let waiter = {
            let guard = guard.clone();
            tokio::spawn(async move {
                matches!(guard.enter_or_wait(LONG).await, Ok(Admission::Waited))
            })
        };

        while guard.waiting() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!waiter.is_finished());

        drop(admission);
        assert!(waiter.await.unwrap());
        assert!(!guard.is_active());
    }

    #[tokio::test]
    async fn waiting_caller_times_out_when_pass_never_ends() {
        let guard = ReconcileGuard::new();
        let _held = guard.enter_or_wait(LONG).await.unwrap();

        let err = guard
            .enter_or_wait(Duration::from_millis(20))
            .await
            .expect_err("should time out");
        assert_eq!(err, GuardTimeout(Duration::from_millis(20)));
        assert_eq!(guard.waiting(), 0);
    }

    #[tokio::test]
    async fn flag_clears_when_leader_future_is_cancelled() {
        let guard = Arc::new(ReconcileGuard::new());
        let task = {
            let guard = guard.clone();
            tokio::spawn(async move {
                let _permit = guard.enter_or_wait(LONG).await.unwrap();
                std::future::pending::<()>().await;
            })
        };
        while !guard.is_active() {
            tokio::task::yield_now().await;
        }

        task.abort();
        let _ = task.await;
        assert!(!guard.is_active());
    }

    #[tokio::test]
    async fn waiter_is_released_when_its_pass_ends_even_if_a_new_one_starts() {
        let guard = Arc::new(ReconcileGuard::new());
        let first = guard.enter_or_wait(LONG).await.unwrap();

        let waiter = {
            let guard = guard.clone();
            tokio::spawn(async move {
                matches!(
                    guard.enter_or_wait(Duration::from_secs(1)).await,
                    Ok(Admission::Waited)
                )
            })
        };
        while guard.waiting() == 0 {
            tokio::task::yield_now().await;
        }

        // Hand over to the next leader before the waiter gets to run.
        drop(first);
        let second = guard.enter_or_wait(LONG).await.unwrap();
        assert!(matches!(second, Admission::Leader(_)));

        assert!(waiter.await.unwrap());
        assert!(guard.is_active());
    }
}
