use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::backend::models::{
    JoinTarget, OptionEntity, QuestionEntity, QuizOrSlot, SlotCounters, SlotStatus,
};

/// The one canonical identity the engine reasons about.
///
/// Participation rows are keyed by quiz id while engagement counters and joins
/// are keyed by slot id; the projections below are the only places that split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QuizIdentity {
    /// Quiz content identifier.
    pub quiz_id: Uuid,
    /// Slot identifier when the quiz is scheduled through a slot.
    pub slot_id: Option<Uuid>,
}

impl QuizIdentity {
    /// Identity of a legacy quiz addressed directly.
    pub fn legacy(quiz_id: Uuid) -> Self {
        Self {
            quiz_id,
            slot_id: None,
        }
    }

    /// Identity of a slot-scheduled quiz.
    pub fn slot(quiz_id: Uuid, slot_id: Uuid) -> Self {
        Self {
            quiz_id,
            slot_id: Some(slot_id),
        }
    }

    /// Key of the participation row (always the quiz id).
    pub fn participation_key(&self) -> Uuid {
        self.quiz_id
    }

    /// Key of engagement and presence counters (slot id when present).
    pub fn engagement_key(&self) -> Uuid {
        self.slot_id.unwrap_or(self.quiz_id)
    }

    /// Row a join or pre-join is addressed to.
    pub fn join_target(&self) -> JoinTarget {
        match self.slot_id {
            Some(slot_id) => JoinTarget::Slot(slot_id),
            None => JoinTarget::Quiz(self.quiz_id),
        }
    }

    /// Key idempotency guards are scoped to.
    pub fn guard_key(&self) -> Uuid {
        self.engagement_key()
    }
}

/// Opening window of a quiz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuizWindow {
    /// Opening time.
    pub start: OffsetDateTime,
    /// Closing time, strictly after `start`.
    pub end: OffsetDateTime,
}

/// Normalized in-memory quiz record built from either backend shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuizRecord {
    /// Identity resolver for this quiz.
    pub identity: QuizIdentity,
    /// Display title.
    pub title: String,
    /// Optional category label.
    pub category: Option<String>,
    /// Authoritative opening window (slot times win over quiz times).
    pub window: QuizWindow,
    /// Slot status; legacy quizzes report [`SlotStatus::Scheduled`].
    pub status: SlotStatus,
    /// Ordered prize list.
    pub prizes: Vec<u64>,
    /// Unit the prizes are expressed in.
    pub prize_unit: String,
    /// Counters stored on the slot row, if any.
    pub counters: Option<SlotCounters>,
}

/// Rejected quiz payloads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuizRecordError {
    /// `end_time` is not after `start_time`.
    #[error("quiz `{id}` ends before it starts")]
    InvertedWindow {
        /// Offending quiz or slot id.
        id: Uuid,
    },
}

impl TryFrom<QuizOrSlot> for QuizRecord {
    type Error = QuizRecordError;

    fn try_from(value: QuizOrSlot) -> Result<Self, Self::Error> {
        let record = match value {
            QuizOrSlot::Slot(slot) => Self {
                identity: QuizIdentity::slot(slot.quiz_id, slot.id),
                title: slot.title,
                category: slot.category,
                window: QuizWindow {
                    start: slot.start_time,
                    end: slot.end_time,
                },
                status: slot.status,
                prizes: slot.prizes,
                prize_unit: slot.prize_unit,
                counters: Some(slot.participants),
            },
            QuizOrSlot::Legacy(quiz) => Self {
                identity: QuizIdentity::legacy(quiz.id),
                title: quiz.title,
                category: quiz.category,
                window: QuizWindow {
                    start: quiz.start_time,
                    end: quiz.end_time,
                },
                status: SlotStatus::Scheduled,
                prizes: quiz.prizes,
                prize_unit: quiz.prize_unit,
                counters: None,
            },
        };

        if record.window.end <= record.window.start {
            return Err(QuizRecordError::InvertedWindow {
                id: record.identity.guard_key(),
            });
        }

        Ok(record)
    }
}

impl QuizRecord {
    /// Whether an administrator paused the slot.
    pub fn is_paused(&self) -> bool {
        self.status == SlotStatus::Paused
    }
}

/// Question as presented to the player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Question identifier.
    pub id: Uuid,
    /// Display text.
    pub text: String,
    /// Ordered options.
    pub options: Vec<AnswerOption>,
}

/// A selectable option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerOption {
    /// Option identifier.
    pub id: Uuid,
    /// Display text.
    pub text: String,
}

impl From<OptionEntity> for AnswerOption {
    fn from(value: OptionEntity) -> Self {
        Self {
            id: value.id,
            text: value.text,
        }
    }
}

impl From<QuestionEntity> for Question {
    fn from(value: QuestionEntity) -> Self {
        Self {
            id: value.id,
            text: value.text,
            options: value.options.into_iter().map(Into::into).collect(),
        }
    }
}

impl Question {
    /// Whether `option_id` belongs to this question.
    pub fn has_option(&self, option_id: Uuid) -> bool {
        self.options.iter().any(|option| option.id == option_id)
    }
}

/// Immutable question set shared between the cache and sessions.
pub type QuestionSet = Arc<Vec<Question>>;
