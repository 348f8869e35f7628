use std::sync::Arc;
use std::time::Duration;

use crate::firestore::error::FirestoreError;
use crate::firestore::remote::persistent_stream::{RemoteInput, RemoteScheduler, RemoteTimer};
use crate::firestore::util::{DelayedOperation, TimerId};

const LOG_TARGET: &str = "firestore::online_state";

/// Watch stream failures tolerated before the client is considered offline.
const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// Whether the client believes it can reach the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnlineState {
    /// No connection attempt has succeeded or failed conclusively yet.
    #[default]
    Unknown,
    Online,
    /// Listeners raise snapshots from cache instead of waiting.
    Offline,
}

/// Derives the [`OnlineState`] from watch stream health.
///
/// Every method returns the new state when it changed, so the caller can
/// broadcast it.
pub struct OnlineStateTracker {
    state: OnlineState,
    watch_stream_failures: u32,
    timer: Option<DelayedOperation>,
    timeout: Duration,
    should_warn_offline: bool,
    scheduler: Arc<dyn RemoteScheduler>,
}

impl OnlineStateTracker {
    pub fn new(scheduler: Arc<dyn RemoteScheduler>, timeout: Duration) -> Self {
        Self {
            state: OnlineState::Unknown,
            watch_stream_failures: 0,
            timer: None,
            timeout,
            should_warn_offline: true,
            scheduler,
        }
    }

    pub fn state(&self) -> OnlineState {
        self.state
    }

    /// Called whenever the watch stream is started. The first attempt moves
    /// to `Unknown` and arms a timer that gives up on it.
    pub fn handle_watch_stream_start(&mut self) -> Option<OnlineState> {
        if self.watch_stream_failures != 0 {
            return None;
        }
        let change = self.set_and_broadcast(OnlineState::Unknown);
        self.clear_timer();
        self.timer = Some(self.scheduler.deliver_after(
            TimerId::OnlineStateTimeout,
            self.timeout,
            RemoteInput::Timer(RemoteTimer::OnlineStateTimeout),
        ));
        change
    }

    pub fn handle_timeout(&mut self) -> Option<OnlineState> {
        self.timer = None;
        if self.state != OnlineState::Unknown {
            return None;
        }
        self.log_offline(&format!(
            "backend did not respond within {:?}",
            self.timeout
        ));
        self.set_and_broadcast(OnlineState::Offline)
    }

    pub fn handle_watch_stream_failure(&mut self, error: &FirestoreError) -> Option<OnlineState> {
        if self.state == OnlineState::Online {
            // Losing an established connection gets a fresh chance to
            // reconnect before going offline.
            return self.set_and_broadcast(OnlineState::Unknown);
        }

        self.watch_stream_failures += 1;
        if self.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
            self.clear_timer();
            self.log_offline(&format!(
                "connection failed {} times, most recent error: {error}",
                self.watch_stream_failures
            ));
            return self.set_and_broadcast(OnlineState::Offline);
        }
        None
    }

    /// Sets an explicit state, e.g. `Online` once the watch stream delivered
    /// data or `Offline` when the network is disabled.
    pub fn set(&mut self, state: OnlineState) -> Option<OnlineState> {
        self.clear_timer();
        self.watch_stream_failures = 0;
        if state == OnlineState::Online {
            self.should_warn_offline = false;
        }
        self.set_and_broadcast(state)
    }

    fn set_and_broadcast(&mut self, state: OnlineState) -> Option<OnlineState> {
        if state == self.state {
            return None;
        }
        log::debug!(target: LOG_TARGET, "online state {:?} -> {:?}", self.state, state);
        self.state = state;
        Some(state)
    }

    fn log_offline(&mut self, details: &str) {
        let message = format!(
            "Could not reach the backend: {details}. The client will operate in offline mode \
             until it can connect."
        );
        if self.should_warn_offline {
            log::warn!(target: LOG_TARGET, "{message}");
            self.should_warn_offline = false;
        } else {
            log::debug!(target: LOG_TARGET, "{message}");
        }
    }

    fn clear_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::unavailable;
    use crate::firestore::remote::persistent_stream::RemoteInputHandler;
    use crate::firestore::util::AsyncQueue;
    use crate::util::BackoffSettings;

    struct Recorder {
        tracker: Option<OnlineStateTracker>,
        changes: Vec<OnlineState>,
    }

    impl RemoteInputHandler for Recorder {
        fn handle_remote_input(&mut self, input: RemoteInput) {
            if let RemoteInput::Timer(RemoteTimer::OnlineStateTimeout) = input {
                if let Some(tracker) = self.tracker.as_mut() {
                    self.changes.extend(tracker.handle_timeout());
                }
            }
        }
    }

    fn recorder() -> (Recorder, crate::firestore::util::ManualDriver<Recorder>) {
        let (queue, driver) = AsyncQueue::manual(BackoffSettings::default());
        let tracker = OnlineStateTracker::new(Arc::new(queue), Duration::from_secs(10));
        let recorder = Recorder {
            tracker: Some(tracker),
            changes: Vec::new(),
        };
        (recorder, driver)
    }

    #[test]
    fn timeout_moves_unknown_to_offline() {
        let (mut recorder, driver) = recorder();
        let tracker = recorder.tracker.as_mut().unwrap();
        assert_eq!(tracker.handle_watch_stream_start(), None);
        assert!(driver.has_delayed(TimerId::OnlineStateTimeout));

        driver.run_delayed(&mut recorder, TimerId::OnlineStateTimeout);
        assert_eq!(recorder.changes, vec![OnlineState::Offline]);
    }

    #[test]
    fn going_online_cancels_the_timeout() {
        let (mut recorder, driver) = recorder();
        let tracker = recorder.tracker.as_mut().unwrap();
        tracker.handle_watch_stream_start();
        assert_eq!(tracker.set(OnlineState::Online), Some(OnlineState::Online));

        driver.run_all_delayed(&mut recorder);
        assert!(recorder.changes.is_empty());
        assert_eq!(recorder.tracker.as_ref().unwrap().state(), OnlineState::Online);
    }

    #[test]
    fn failures_degrade_online_to_unknown_then_offline() {
        let (mut recorder, _driver) = recorder();
        let tracker = recorder.tracker.as_mut().unwrap();
        tracker.set(OnlineState::Online);

        let error = unavailable("connection reset");
        assert_eq!(
            tracker.handle_watch_stream_failure(&error),
            Some(OnlineState::Unknown)
        );
        assert_eq!(
            tracker.handle_watch_stream_failure(&error),
            Some(OnlineState::Offline)
        );
        assert_eq!(tracker.handle_watch_stream_failure(&error), None);
    }
}
