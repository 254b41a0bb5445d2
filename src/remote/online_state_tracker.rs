/// Whether the client believes it can reach the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineState {
    /// Connecting, or the last attempt has not resolved yet.
    Unknown,
    Online,
    /// Views should be raised from cache without waiting for the backend.
    Offline,
}

/// Watch stream failures tolerated while `Unknown` before going `Offline`.
const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// Derives the [`OnlineState`] from watch stream health.
///
/// Pure state: every transition returns the new state when it changed, and
/// [`handle_watch_stream_start`](Self::handle_watch_stream_start) returns the id
/// of a timeout the caller must arm and later report through
/// [`handle_timeout`](Self::handle_timeout).
#[derive(Debug)]
pub struct OnlineStateTracker {
    state: OnlineState,
    watch_stream_failures: u32,
    pending_timer: Option<u64>,
    next_timer_id: u64,
    should_warn_client_is_offline: bool,
}

impl Default for OnlineStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl OnlineStateTracker {
    pub fn new() -> Self {
        Self {
            state: OnlineState::Unknown,
            watch_stream_failures: 0,
            pending_timer: None,
            next_timer_id: 1,
            should_warn_client_is_offline: true,
        }
    }

    pub fn state(&self) -> OnlineState {
        self.state
    }

    /// Called whenever the watch stream is (re)started. Once a failure was
    /// counted the state holds until a message arrives or [`set`](Self::set)
    /// is called.
    pub fn handle_watch_stream_start(&mut self) -> (Option<OnlineState>, Option<u64>) {
        if self.watch_stream_failures != 0 {
            return (None, None);
        }
        let changed = self.set_and_broadcast(OnlineState::Unknown);
        let timer_id = self.next_timer_id;
        self.next_timer_id += 1;
        self.pending_timer = Some(timer_id);
        (changed, Some(timer_id))
    }

    pub fn handle_timeout(&mut self, timer_id: u64) -> Option<OnlineState> {
        if self.pending_timer != Some(timer_id) {
            return None;
        }
        self.pending_timer = None;
        if self.state != OnlineState::Unknown {
            return None;
        }
        self.log_client_offline_warning_if_necessary("backend didn't respond within the online state timeout");
        self.set_and_broadcast(OnlineState::Offline)
    }

    pub fn handle_watch_stream_failure(&mut self, reason: &str) -> Option<OnlineState> {
        if self.state == OnlineState::Online {
            return self.set_and_broadcast(OnlineState::Unknown);
        }

        self.watch_stream_failures += 1;
        if self.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
            self.pending_timer = None;
            self.log_client_offline_warning_if_necessary(&format!(
                "connection failed {} times, most recent error: {reason}",
                self.watch_stream_failures
            ));
            return self.set_and_broadcast(OnlineState::Offline);
        }
        None
    }

    /// Forces a state, clearing failure counts and any pending timeout.
    pub fn set(&mut self, state: OnlineState) -> Option<OnlineState> {
        self.watch_stream_failures = 0;
        self.pending_timer = None;
        if state == OnlineState::Online {
            self.should_warn_client_is_offline = false;
        }
        self.set_and_broadcast(state)
    }

    fn set_and_broadcast(&mut self, state: OnlineState) -> Option<OnlineState> {
        if self.state == state {
            return None;
        }
        self.state = state;
        Some(state)
    }

    fn log_client_offline_warning_if_necessary(&mut self, details: &str) {
        if self.should_warn_client_is_offline {
            log::warn!("Could not reach the backend: {details}. The client will operate in offline mode.");
            self.should_warn_client_is_offline = false;
        } else {
            log::debug!("still offline: {details}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_failure_while_unknown_goes_offline() {
        let mut tracker = OnlineStateTracker::new();
        let (changed, timer) = tracker.handle_watch_stream_start();
        assert_eq!(changed, None);
        let timer = timer.unwrap();

        assert_eq!(tracker.handle_watch_stream_failure("unavailable"), Some(OnlineState::Offline));
        // The timeout no longer applies once the failure decided the state.
        assert_eq!(tracker.handle_timeout(timer), None);
    }

    #[test]
    fn timeout_while_unknown_goes_offline() {
        let mut tracker = OnlineStateTracker::new();
        let (_, timer) = tracker.handle_watch_stream_start();
        assert_eq!(tracker.handle_timeout(timer.unwrap()), Some(OnlineState::Offline));
    }

    #[test]
    fn failure_while_online_returns_to_unknown() {
        let mut tracker = OnlineStateTracker::new();
        let (_, timer) = tracker.handle_watch_stream_start();
        assert_eq!(tracker.set(OnlineState::Online), Some(OnlineState::Online));
        assert_eq!(tracker.handle_timeout(timer.unwrap()), None);

        assert_eq!(tracker.handle_watch_stream_failure("reset"), Some(OnlineState::Unknown));
        let (changed, timer) = tracker.handle_watch_stream_start();
        assert_eq!(changed, None);
        assert!(timer.is_some());
        assert_eq!(tracker.handle_watch_stream_failure("reset"), Some(OnlineState::Offline));
    }

    #[test]
    fn restart_after_failure_stays_offline() {
        let mut tracker = OnlineStateTracker::new();
        tracker.handle_watch_stream_start();
        assert_eq!(tracker.handle_watch_stream_failure("down"), Some(OnlineState::Offline));

        for _ in 0..3 {
            assert_eq!(tracker.handle_watch_stream_start(), (None, None));
            assert_eq!(tracker.handle_watch_stream_failure("still down"), None);
        }
        assert_eq!(tracker.state(), OnlineState::Offline);

        assert_eq!(tracker.set(OnlineState::Online), Some(OnlineState::Online));
        let (changed, timer) = tracker.handle_watch_stream_start();
        assert_eq!(changed, None);
        assert!(timer.is_some());
    }
}
