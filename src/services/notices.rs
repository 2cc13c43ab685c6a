use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use utoipa::ToSchema;
use uuid::Uuid;

/// Passive, user-facing messages raised by the engine.
///
/// Transient failures never surface here except for the first time an answer
/// is queued; everything else only reaches the logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    /// An answer could not be saved yet and will be retried.
    AnswerQueued {
        /// Question whose answer is waiting.
        question_id: Uuid,
    },
    /// An answer exhausted its retries and was not saved.
    AnswerDropped {
        /// Question whose answer was lost.
        question_id: Uuid,
    },
    /// Submission refused while answers are still waiting to sync.
    SyncPending {
        /// Answers still queued.
        pending: usize,
    },
    /// The backend reported the quiz as over.
    QuizEnded {
        /// Quiz that ended.
        quiz_id: Uuid,
    },
    /// The join was recorded as a pre-join and will be promoted later.
    JoinDeferred {
        /// Quiz the user was registered for.
        quiz_id: Uuid,
    },
    /// Answers were submitted.
    Submitted {
        /// Quiz the answers belong to.
        quiz_id: Uuid,
        /// Whether the submission was triggered by the quiz finishing.
        automatic: bool,
    },
    /// Time to show the results page.
    Redirect(Redirect),
}

/// One-shot navigation to the results view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct Redirect {
    /// Quiz the results belong to.
    pub quiz_id: Uuid,
    /// Results path, `/results/{quiz_id}`.
    pub path: String,
    /// When the redirect became due.
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub at: OffsetDateTime,
}

impl Redirect {
    /// Redirect to the results of `quiz_id`.
    pub fn to_results(quiz_id: Uuid, at: OffsetDateTime) -> Self {
        Self {
            quiz_id,
            path: format!("/results/{quiz_id}"),
            at,
        }
    }
}

/// Fan-out of [`Notice`]s to every interested listener.
#[derive(Clone)]
pub struct NoticeHub {
    sender: broadcast::Sender<Notice>,
}

impl NoticeHub {
    /// Construct a hub backed by a broadcast channel with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Register a listener for subsequent notices.
    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.sender.subscribe()
    }

    /// Publish a notice, ignoring the absence of listeners.
    pub fn publish(&self, notice: Notice) {
        tracing::debug!(?notice, "publishing notice");
        let _ = self.sender.send(notice);
    }
}

impl Default for NoticeHub {
    fn default() -> Self {
        Self::new(32)
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn redirect_points_at_the_results_page() {
        let quiz_id = Uuid::from_u128(9);
        let redirect = Redirect::to_results(quiz_id, datetime!(2026-01-01 10:05 UTC));
        assert_eq!(redirect.path, format!("/results/{quiz_id}"));

        let json = serde_json::to_value(Notice::Redirect(redirect)).unwrap();
        assert_eq!(json["kind"], "redirect");
        assert_eq!(json["at"], "2026-01-01T10:05:00Z");
    }

    #[tokio::test]
    async fn subscribers_receive_published_notices() {
        let hub = NoticeHub::default();
        let mut receiver = hub.subscribe();
        hub.publish(Notice::SyncPending { pending: 2 });
        assert_eq!(receiver.recv().await.unwrap(), Notice::SyncPending { pending: 2 });
    }
}
