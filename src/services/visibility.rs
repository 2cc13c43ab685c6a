use std::sync::{Arc, OnceLock};

use serde::Serialize;
use tokio::sync::watch;
use utoipa::ToSchema;

/// Foreground and connectivity flags of the hosting page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct GateState {
    /// Whether the tab is in the foreground.
    pub visible: bool,
    /// Whether the network (and backend) is reachable.
    pub online: bool,
}

impl GateState {
    /// Pollers only work while the page is both foregrounded and online.
    pub fn is_open(&self) -> bool {
        self.visible && self.online
    }
}

impl Default for GateState {
    fn default() -> Self {
        Self {
            visible: true,
            online: true,
        }
    }
}

/// Edge on which pending work should be flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resumption {
    /// Connectivity came back.
    Online,
    /// The tab was foregrounded again.
    Visible,
}

/// Detect a false-to-true edge on either flag. Connectivity wins when both flip.
pub fn resumption(previous: GateState, next: GateState) -> Option<Resumption> {
    if !previous.online && next.online {
        Some(Resumption::Online)
    } else if !previous.visible && next.visible {
        Some(Resumption::Visible)
    } else {
        None
    }
}

/// Process-wide "is this page foregrounded and online" predicate.
#[derive(Clone)]
pub struct VisibilityGate {
    state: Arc<watch::Sender<GateState>>,
}

static GLOBAL: OnceLock<VisibilityGate> = OnceLock::new();

impl VisibilityGate {
    /// Fresh gate, visible and online.
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(GateState::default());
        Self {
            state: Arc::new(sender),
        }
    }

    /// The gate shared by every poller in the process.
    pub fn global() -> &'static VisibilityGate {
        GLOBAL.get_or_init(VisibilityGate::new)
    }

    /// Current flags.
    pub fn state(&self) -> GateState {
        *self.state.borrow()
    }

    /// Whether pollers should do work right now.
    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Record a tab visibility change.
    pub fn set_visible(&self, visible: bool) {
        self.state.send_if_modified(|state| {
            let changed = state.visible != visible;
            state.visible = visible;
            changed
        });
    }

    /// Record a connectivity change.
    pub fn set_online(&self, online: bool) {
        self.state.send_if_modified(|state| {
            let changed = state.online != online;
            state.online = online;
            changed
        });
    }

    /// Watch flag changes.
    pub fn subscribe(&self) -> watch::Receiver<GateState> {
        self.state.subscribe()
    }

    /// Resolve once the gate is open.
    pub async fn opened(&self) {
        let mut receiver = self.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = receiver.wait_for(GateState::is_open).await;
    }
}

impl Default for VisibilityGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_when_hidden_or_offline() {
        let gate = VisibilityGate::new();
        assert!(gate.is_open());

        gate.set_visible(false);
        assert!(!gate.is_open());
        gate.set_visible(true);
        gate.set_online(false);
        assert!(!gate.is_open());
    }

    #[test]
    fn resumption_fires_on_rising_edges_only() {
        let online = GateState::default();
        let offline = GateState {
            online: false,
            ..online
        };
        let hidden = GateState {
            visible: false,
            ..online
        };

        assert_eq!(resumption(offline, online), Some(Resumption::Online));
        assert_eq!(resumption(hidden, online), Some(Resumption::Visible));
        assert_eq!(resumption(online, offline), None);
        assert_eq!(resumption(online, online), None);
    }

    #[tokio::test]
    async fn subscribers_only_see_real_changes() {
        let gate = VisibilityGate::new();
        let mut receiver = gate.subscribe();

        gate.set_visible(true);
        assert!(!receiver.has_changed().unwrap());

        gate.set_online(false);
        assert!(receiver.has_changed().unwrap());
        assert!(!receiver.borrow_and_update().online);
    }

    #[tokio::test]
    async fn opened_waits_for_both_flags() {
        let gate = VisibilityGate::new();
        gate.set_online(false);

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.opened().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        gate.set_online(true);
        waiter.await.unwrap();
    }
}
