use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::watch;
use utoipa::ToSchema;

use crate::backend::models::EngagementEntity;

/// Participant counts shown next to the quiz.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct EngagementSnapshot {
    /// Participants that joined.
    pub joined: u64,
    /// Participants that pre-joined.
    pub pre_joined: u64,
    /// Combined total, reported for slots only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

impl From<EngagementEntity> for EngagementSnapshot {
    fn from(value: EngagementEntity) -> Self {
        Self {
            joined: value.joined,
            pre_joined: value.pre_joined,
            total: value.total,
        }
    }
}

/// Latest engagement counts, fed by the poller and by change notifications.
///
/// Every fetch takes a ticket first; only the newest ticket may commit, so a
/// slow response never overwrites one issued after it.
pub struct EngagementTracker {
    issued: AtomicU64,
    latest: watch::Sender<Option<EngagementSnapshot>>,
}

impl EngagementTracker {
    /// Tracker without counts yet.
    pub fn new() -> Self {
        let (latest, _receiver) = watch::channel(None);
        Self {
            issued: AtomicU64::new(0),
            latest,
        }
    }

    /// Reserve a sequence number for a fetch about to start.
    pub fn ticket(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Store `snapshot` if `ticket` is still the newest one issued.
    pub fn commit(&self, ticket: u64, snapshot: EngagementSnapshot) -> bool {
        if self.issued.load(Ordering::SeqCst) != ticket {
            return false;
        }
        self.latest.send_replace(Some(snapshot));
        true
    }

    /// Most recent committed counts.
    pub fn current(&self) -> Option<EngagementSnapshot> {
        *self.latest.borrow()
    }

    /// Watch committed counts.
    pub fn subscribe(&self) -> watch::Receiver<Option<EngagementSnapshot>> {
        self.latest.subscribe()
    }

    /// Forget the counts and invalidate every outstanding ticket.
    pub fn reset(&self) {
        self.issued.fetch_add(1, Ordering::SeqCst);
        self.latest.send_replace(None);
    }
}

impl Default for EngagementTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(joined: u64) -> EngagementSnapshot {
        EngagementSnapshot {
            joined,
            ..Default::default()
        }
    }

    #[test]
    fn stale_ticket_is_discarded() {
        let tracker = EngagementTracker::new();
        let older = tracker.ticket();
        let newer = tracker.ticket();

        assert!(tracker.commit(newer, counts(5)));
        assert!(!tracker.commit(older, counts(3)));
        assert_eq!(tracker.current(), Some(counts(5)));
    }

    #[test]
    fn reset_invalidates_in_flight_fetches() {
        let tracker = EngagementTracker::new();
        let ticket = tracker.ticket();
        tracker.reset();

        assert!(!tracker.commit(ticket, counts(1)));
        assert_eq!(tracker.current(), None);
    }
}
