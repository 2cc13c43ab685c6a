/// Backend error taxonomy.
pub mod error;
/// REST implementation of the backend surface.
#[cfg(feature = "http-backend")]
pub mod http;
/// Wire entities exchanged with the backend.
pub mod models;
#[cfg(test)]
pub(crate) mod scripted;

use futures::future::BoxFuture;
use uuid::Uuid;

use self::error::BackendResult;
use self::models::{
    AnswerEntity, EngagementEntity, FeedChannel, FeedTopic, JoinTarget, QuestionEntity, QuizOrSlot,
};

/// Everything the session engine needs from the quiz backend.
///
/// Quiz, slot and question storage, the participation ledger, engagement
/// counters and change notifications all live behind this trait.
pub trait QuizBackend: Send + Sync {
    /// Resolve an id to a slot, falling back to a legacy quiz.
    fn fetch_quiz_or_slot(&self, id: Uuid) -> BoxFuture<'static, BackendResult<QuizOrSlot>>;
    /// Ordered questions of a quiz, without correctness flags.
    fn fetch_questions(&self, quiz_id: Uuid) -> BoxFuture<'static, BackendResult<Vec<QuestionEntity>>>;
    /// Join an active quiz or slot.
    fn join(&self, target: JoinTarget) -> BoxFuture<'static, BackendResult<()>>;
    /// Record intent to participate before the quiz opens.
    fn pre_join(&self, target: JoinTarget) -> BoxFuture<'static, BackendResult<()>>;
    /// Idempotent write keyed by `(user_id, question_id)`; last write wins.
    fn upsert_answer(&self, answer: AnswerEntity) -> BoxFuture<'static, BackendResult<()>>;
    /// Mark the participation of `user_id` in `quiz_id` as completed.
    fn submit_participation(&self, user_id: Uuid, quiz_id: Uuid) -> BoxFuture<'static, BackendResult<()>>;
    /// Participant counts keyed by slot id (or quiz id for legacy quizzes).
    fn fetch_engagement(&self, key: Uuid) -> BoxFuture<'static, BackendResult<EngagementEntity>>;
    /// Open a change notification channel for a table/filter pair.
    fn subscribe_changes(&self, topic: FeedTopic) -> BoxFuture<'static, BackendResult<FeedChannel>>;
    /// Cheap reachability probe.
    fn health_check(&self) -> BoxFuture<'static, BackendResult<()>>;
}
