//! Connectivity and session observation

use tokio::sync::watch;

/// Snapshot of network and session status
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectivityState {
    /// Whether the network is reachable
    pub online: bool,
    /// Whether a user session is active
    pub authenticated: bool,
    /// Owner id scoping remote calls; present while authenticated
    pub user_id: Option<String>,
}

impl ConnectivityState {
    /// Whether remote calls are currently allowed
    #[must_use]
    pub const fn is_eligible(&self) -> bool {
        self.online && self.authenticated
    }
}

/// Broadcasts network and session changes to the sync layer
///
/// The monitor only observes and reports; it never performs sync work
/// itself. The coordinator subscribes and reacts to eligibility edges.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<ConnectivityState>,
}

impl ConnectivityMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tx: watch::channel(ConnectivityState::default()).0,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectivityState {
        self.tx.borrow().clone()
    }

    /// Subscribe to state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }

    /// Record a network status change
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|state| {
            if state.online == online {
                return false;
            }
            state.online = online;
            true
        });
    }

    /// Record a sign-in for the given account
    pub fn sign_in(&self, user_id: impl Into<String>) {
        let user_id = user_id.into();
        self.tx.send_if_modified(|state| {
            if state.authenticated && state.user_id.as_deref() == Some(user_id.as_str()) {
                return false;
            }
            state.authenticated = true;
            state.user_id = Some(user_id);
            true
        });
    }

    /// Record a sign-out
    pub fn sign_out(&self) {
        self.tx.send_if_modified(|state| {
            if !state.authenticated && state.user_id.is_none() {
                return false;
            }
            state.authenticated = false;
            state.user_id = None;
            true
        });
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_offline_and_signed_out() {
        let monitor = ConnectivityMonitor::new();
        let state = monitor.state();
        assert!(!state.online);
        assert!(!state.authenticated);
        assert!(!state.is_eligible());
    }

    #[test]
    fn test_eligible_requires_both() {
        let monitor = ConnectivityMonitor::new();

        monitor.set_online(true);
        assert!(!monitor.state().is_eligible());

        monitor.sign_in("user-1");
        assert!(monitor.state().is_eligible());

        monitor.set_online(false);
        assert!(!monitor.state().is_eligible());
    }

    #[test]
    fn test_sign_out_clears_user() {
        let monitor = ConnectivityMonitor::new();
        monitor.sign_in("user-1");
        monitor.sign_out();

        let state = monitor.state();
        assert!(!state.authenticated);
        assert_eq!(state.user_id, None);
    }

    #[test]
    fn test_no_notification_without_change() {
        let monitor = ConnectivityMonitor::new();
        let mut rx = monitor.subscribe();

        monitor.set_online(true);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        // Same value again must not wake subscribers
        monitor.set_online(true);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_repeat_sign_in_same_user_is_quiet() {
        let monitor = ConnectivityMonitor::new();
        let mut rx = monitor.subscribe();

        monitor.sign_in("user-1");
        rx.borrow_and_update();
        monitor.sign_in("user-1");
        assert!(!rx.has_changed().unwrap());

        monitor.sign_in("user-2");
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow().user_id.as_deref(), Some("user-2"));
    }
}
