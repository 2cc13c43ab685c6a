use std::{future::Future, pin::Pin};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use utoipa::ToSchema;
use uuid::Uuid;

/// Lifecycle status carried by a scheduled slot.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    /// Not started yet (also used for legacy quizzes which carry no status).
    #[default]
    Scheduled,
    /// Currently running.
    Active,
    /// Administratively paused.
    Paused,
    /// Ran to completion.
    Finished,
    /// Cancelled before it started.
    Skipped,
}

/// Aggregate participant counters stored on a slot row.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotCounters {
    /// Participants that joined.
    #[serde(default)]
    pub joined: u64,
    /// Participants that pre-joined.
    #[serde(default)]
    pub pre_joined: u64,
}

/// Scheduled instance of a quiz with its own mutable status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotEntity {
    /// Slot identifier.
    pub id: Uuid,
    /// Underlying quiz content identifier.
    pub quiz_id: Uuid,
    /// Display title.
    pub title: String,
    /// Optional category label.
    #[serde(default)]
    pub category: Option<String>,
    /// Opening time of the slot.
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    /// Closing time of the slot.
    #[serde(with = "time::serde::rfc3339")]
    pub end_time: OffsetDateTime,
    /// Current lifecycle status.
    pub status: SlotStatus,
    /// Ordered prize list (first place first).
    #[serde(default)]
    pub prizes: Vec<u64>,
    /// Unit the prizes are expressed in.
    #[serde(default)]
    pub prize_unit: String,
    /// Aggregate participant counters.
    #[serde(default)]
    pub participants: SlotCounters,
}

/// Legacy quiz row addressed directly by its own id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuizEntity {
    /// Quiz identifier.
    pub id: Uuid,
    /// Display title.
    pub title: String,
    /// Optional category label.
    #[serde(default)]
    pub category: Option<String>,
    /// Opening time of the quiz.
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    /// Closing time of the quiz.
    #[serde(with = "time::serde::rfc3339")]
    pub end_time: OffsetDateTime,
    /// Ordered prize list (first place first).
    #[serde(default)]
    pub prizes: Vec<u64>,
    /// Unit the prizes are expressed in.
    #[serde(default)]
    pub prize_unit: String,
}

/// The two shapes `fetch_quiz_or_slot` can resolve to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuizOrSlot {
    /// A scheduled slot.
    Slot(SlotEntity),
    /// A legacy quiz without a slot row.
    Legacy(QuizEntity),
}

/// One selectable option of a question. Correctness is never sent to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OptionEntity {
    /// Option identifier.
    pub id: Uuid,
    /// Display text.
    pub text: String,
}

/// Question row with its ordered options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionEntity {
    /// Question identifier.
    pub id: Uuid,
    /// Display text.
    pub text: String,
    /// Ordered options.
    pub options: Vec<OptionEntity>,
}

/// Answer row keyed by `(user_id, question_id)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnswerEntity {
    /// Answering user.
    pub user_id: Uuid,
    /// Answered question.
    pub question_id: Uuid,
    /// Selected option.
    pub option_id: Uuid,
}

/// Participation status as the backend stores it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ParticipationStatus {
    /// Intent recorded before the quiz opened.
    PreJoined,
    /// Joined while the quiz was active.
    Joined,
    /// Answers submitted.
    Completed,
}

/// Participant counts for a quiz or slot.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngagementEntity {
    /// Participants that joined.
    pub joined: u64,
    /// Participants that pre-joined.
    pub pre_joined: u64,
    /// Combined total (slot variant only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

/// Which row a join or pre-join targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum JoinTarget {
    /// Slot-specific join.
    Slot(Uuid),
    /// Quiz-specific join (legacy quizzes).
    Quiz(Uuid),
}

impl JoinTarget {
    /// Identifier of the targeted row.
    pub fn id(&self) -> Uuid {
        match self {
            JoinTarget::Slot(id) | JoinTarget::Quiz(id) => *id,
        }
    }
}

/// Table and row filter a change feed listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedTopic {
    /// Backend table name.
    pub table: String,
    /// Row filter, e.g. `quiz_id=eq.<uuid>`.
    pub filter: String,
}

impl FeedTopic {
    /// Topic filtering `table` rows whose `column` equals `id`.
    pub fn rows(table: &str, column: &str, id: Uuid) -> Self {
        Self {
            table: table.to_string(),
            filter: format!("{column}=eq.{id}"),
        }
    }
}

/// Notification that a row of a watched table changed.
///
/// The payload is kept for logging only; consumers re-fetch authoritative state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    /// Table the change happened in.
    pub table: String,
    /// Backend-reported change type (`INSERT`, `UPDATE`, ...).
    #[serde(default)]
    pub kind: String,
    /// Raw, untrusted payload.
    #[serde(default)]
    pub payload: Value,
}

/// Lifecycle signals emitted by an open change channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Subscription acknowledged by the backend.
    Joined,
    /// A watched row changed.
    Change(ChangeEvent),
    /// The channel failed.
    Error(String),
    /// The channel was closed by the remote side.
    Closed,
}

type Teardown = Pin<Box<dyn Future<Output = ()> + Send>>;

/// An open change subscription.
///
/// Dropping the channel without calling [`FeedChannel::remove`] leaves the
/// remote side to notice the closed receiver on its own.
pub struct FeedChannel {
    events: mpsc::Receiver<ChannelEvent>,
    teardown: Option<Teardown>,
}

impl FeedChannel {
    /// Wrap a receiver of channel events together with its removal future.
    pub fn new<F>(events: mpsc::Receiver<ChannelEvent>, teardown: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            events,
            teardown: Some(Box::pin(teardown)),
        }
    }

    /// Wait for the next event; `None` once the sender side is gone.
    pub async fn next(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Remove the channel from the backend. Only the first call does anything.
    pub async fn remove(&mut self) {
        self.events.close();
        if let Some(teardown) = self.teardown.take() {
            teardown.await;
        }
    }

    /// Whether [`FeedChannel::remove`] already ran.
    pub fn is_removed(&self) -> bool {
        self.teardown.is_none()
    }
}

impl std::fmt::Debug for FeedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedChannel")
            .field("removed", &self.is_removed())
            .finish()
    }
}
