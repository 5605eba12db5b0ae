//! Per-request bookkeeping shared by the response body, its drop guard and
//! the stall watchdog.

use super::ConnectionCloser;
use crate::admission::AdmissionPermit;
use crate::range::{FetchPlan, ServingWindow};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// The client went away before the window was delivered.
    Disconnected,
    Stalled,
    Errored,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Disconnected | Outcome::Stalled => "aborted",
            Outcome::Errored => "errored",
        }
    }
}

pub(crate) struct Session {
    pub(crate) token_hash: String,
    pub(crate) client: String,
    pub(crate) object_id: String,
    pub(crate) window: ServingWindow,
    pub(crate) plan: FetchPlan,
    pub(crate) cancel: CancellationToken,
    connection: Option<ConnectionCloser>,
    bytes_written: AtomicU64,
    bytes_seen: AtomicU64,
    last_progress: Mutex<Instant>,
    started: Instant,
    /// Taken by the first cleanup; `None` afterwards.
    permit: Mutex<Option<AdmissionPermit>>,
    outcome: Mutex<Option<Outcome>>,
}

impl Session {
    pub(crate) fn new(
        token_hash: String,
        object_id: String,
        window: ServingWindow,
        plan: FetchPlan,
        permit: AdmissionPermit,
        connection: Option<ConnectionCloser>,
    ) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            token_hash,
            client: permit.client().to_string(),
            object_id,
            window,
            plan,
            cancel: CancellationToken::new(),
            connection,
            bytes_written: AtomicU64::new(0),
            bytes_seen: AtomicU64::new(0),
            last_progress: Mutex::new(now),
            started: now,
            permit: Mutex::new(Some(permit)),
            outcome: Mutex::new(None),
        })
    }

    pub(crate) fn record_seen(&self, n: usize) {
        self.bytes_seen.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_written(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
        *self.last_progress.lock() = Instant::now();
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.bytes_written() >= self.plan.chunk_size
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_progress.lock().elapsed()
    }

    pub(crate) fn outcome(&self) -> Option<Outcome> {
        *self.outcome.lock()
    }

    /// End the session. Only the first call has any effect, returning the
    /// admission slot before the session token is cancelled. A stalled
    /// session also closes its connection, since the body may never be
    /// polled again.
    pub(crate) fn cleanup(&self, outcome: Outcome) -> bool {
        let Some(permit) = self.permit.lock().take() else {
            return false;
        };
        *self.outcome.lock() = Some(outcome);
        permit.release();
        self.cancel.cancel();
        if outcome == Outcome::Stalled
            && let Some(connection) = &self.connection
        {
            connection.close();
        }

        info!(
            token = %self.token_hash,
            client = %self.client,
            object_id = %self.object_id,
            outcome = outcome.as_str(),
            reason = ?outcome,
            start = self.window.start,
            end = self.window.end,
            remote_offset = self.plan.remote_offset,
            bytes_written = self.bytes_written(),
            bytes_seen = self.bytes_seen.load(Ordering::Relaxed),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Stream session ended"
        );
        true
    }
}

/// Ends the session when the response body goes away, whether it finished,
/// failed, or was dropped by a disconnecting client.
pub(crate) struct SessionGuard(pub(crate) Arc<Session>);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let outcome = if self.0.is_complete() {
            Outcome::Completed
        } else {
            Outcome::Disconnected
        };
        self.0.cleanup(outcome);
    }
}

/// Abort the session once it makes no progress for `timeout`.
pub(crate) fn spawn_watchdog(session: Arc<Session>, check_interval: Duration, timeout: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + check_interval, check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = session.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let idle = session.idle_for();
                    if idle >= timeout && !session.is_complete() {
                        warn!(
                            token = %session.token_hash,
                            client = %session.client,
                            idle_ms = idle.as_millis() as u64,
                            "Stream stalled, aborting"
                        );
                        session.cleanup(Outcome::Stalled);
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AdmissionController, AdmissionLimits};
    use crate::range::{AlignmentPolicy, parse_range};

    fn session(controller: &AdmissionController) -> Arc<Session> {
        session_on(controller, None)
    }

    fn session_on(
        controller: &AdmissionController,
        connection: Option<ConnectionCloser>,
    ) -> Arc<Session> {
        let window = parse_range(Some("bytes=0-99"), 1000);
        let plan = AlignmentPolicy::default().plan(&window);
        let permit = controller.try_admit("token", "client").unwrap();
        Session::new("hash".into(), "obj".into(), window, plan, permit, connection)
    }

    fn controller() -> AdmissionController {
        AdmissionController::new(AdmissionLimits {
            max_per_token: 0,
            max_clients: 0,
            max_global: 0,
        })
    }

    #[test]
    fn test_cleanup_runs_once() {
        let controller = controller();
        let session = session(&controller);
        assert_eq!(controller.snapshot().active_streams, 1);

        assert!(session.cleanup(Outcome::Errored));
        assert!(!session.cleanup(Outcome::Completed));
        drop(SessionGuard(session.clone()));

        assert_eq!(controller.snapshot().active_streams, 0);
        assert_eq!(session.outcome(), Some(Outcome::Errored));
        assert!(session.cancel.is_cancelled());
    }

    #[test]
    fn test_guard_classifies_outcome() {
        let controller = controller();
        let partial = session(&controller);
        partial.record_written(40);
        drop(SessionGuard(partial.clone()));
        assert_eq!(partial.outcome(), Some(Outcome::Disconnected));

        let full = session(&controller);
        full.record_written(100);
        drop(SessionGuard(full.clone()));
        assert_eq!(full.outcome(), Some(Outcome::Completed));
    }

    #[test]
    fn test_only_stall_closes_connection() {
        let controller = controller();
        for outcome in [Outcome::Completed, Outcome::Disconnected, Outcome::Errored] {
            let connection = ConnectionCloser::new();
            session_on(&controller, Some(connection.clone())).cleanup(outcome);
            assert!(!connection.is_closed(), "{outcome:?}");
        }

        let connection = ConnectionCloser::new();
        session_on(&controller, Some(connection.clone())).cleanup(Outcome::Stalled);
        assert!(connection.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_closes_stalled_connection() {
        let controller = controller();
        let connection = ConnectionCloser::new();
        let session = session_on(&controller, Some(connection.clone()));
        spawn_watchdog(
            session.clone(),
            Duration::from_secs(1),
            Duration::from_secs(2),
        );

        tokio::time::timeout(Duration::from_secs(10), connection.closed())
            .await
            .unwrap();
        assert_eq!(session.outcome(), Some(Outcome::Stalled));
        assert_eq!(controller.snapshot().active_streams, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_aborts_idle_session() {
        let controller = controller();
        let session = session(&controller);
        spawn_watchdog(
            session.clone(),
            Duration::from_secs(30),
            Duration::from_secs(120),
        );

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(session.outcome(), None);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(session.outcome(), Some(Outcome::Stalled));
        assert_eq!(controller.snapshot().active_streams, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_spares_progressing_session() {
        let controller = controller();
        let session = session(&controller);
        spawn_watchdog(
            session.clone(),
            Duration::from_secs(30),
            Duration::from_secs(120),
        );

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_secs(60)).await;
            session.record_written(1);
        }
        assert_eq!(session.outcome(), None);
        session.cleanup(Outcome::Completed);
    }
}
