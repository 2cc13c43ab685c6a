use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::{
    backend::models::{ParticipationStatus, SlotStatus},
    services::{join::PreJoinOutcome, notices::Redirect, visibility::GateState},
    state::{
        engagement::EngagementSnapshot,
        quiz::{Question, QuizRecord},
        session::ParticipationView,
        state_machine::SessionPhase,
    },
};

/// Everything a page needs to render the quiz session.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct SessionSnapshot {
    /// Top-level session phase.
    pub phase: SessionPhase,
    /// Incremented on every applied transition.
    pub version: usize,
    /// Whether a submission is in flight.
    pub submitting: bool,
    /// Countdown to the next boundary, in milliseconds.
    pub time_left_ms: u64,
    /// Loaded quiz, if any.
    pub quiz: Option<QuizSummary>,
    /// Questions once the user joined.
    pub questions: Vec<QuestionView>,
    /// Participation as displayed.
    pub participation: ParticipationView,
    /// Participation as the backend last confirmed it.
    pub backend_participation: Option<ParticipationStatus>,
    /// Local selections.
    pub answers: Vec<AnswerView>,
    /// Answers waiting for a retry.
    pub pending_sync: usize,
    /// Latest participant counts.
    pub engagement: Option<EngagementSnapshot>,
    /// Results redirect once due.
    pub redirect: Option<Redirect>,
    /// Load failure shown in the error phase.
    pub error: Option<String>,
    /// Visibility and connectivity flags.
    pub gate: GateState,
}

impl SessionSnapshot {
    /// Snapshot of a session that has not loaded anything yet.
    pub fn loading() -> Self {
        Self {
            phase: SessionPhase::Loading,
            version: 0,
            submitting: false,
            time_left_ms: 0,
            quiz: None,
            questions: Vec::new(),
            participation: ParticipationView::NotJoined,
            backend_participation: None,
            answers: Vec::new(),
            pending_sync: 0,
            engagement: None,
            redirect: None,
            error: None,
            gate: GateState::default(),
        }
    }
}

/// Quiz metadata as displayed.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct QuizSummary {
    /// Quiz content identifier.
    pub quiz_id: Uuid,
    /// Slot identifier for scheduled quizzes.
    pub slot_id: Option<Uuid>,
    /// Display title.
    pub title: String,
    /// Optional category.
    pub category: Option<String>,
    /// Opening time.
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    /// Closing time.
    #[serde(with = "time::serde::rfc3339")]
    pub end_time: OffsetDateTime,
    /// Slot status.
    pub status: SlotStatus,
    /// Ordered prizes.
    pub prizes: Vec<u64>,
    /// Prize unit.
    pub prize_unit: String,
}

impl From<&QuizRecord> for QuizSummary {
    fn from(value: &QuizRecord) -> Self {
        Self {
            quiz_id: value.identity.quiz_id,
            slot_id: value.identity.slot_id,
            title: value.title.clone(),
            category: value.category.clone(),
            start_time: value.window.start,
            end_time: value.window.end,
            status: value.status,
            prizes: value.prizes.clone(),
            prize_unit: value.prize_unit.clone(),
        }
    }
}

/// Question with its selectable options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct QuestionView {
    /// Question identifier.
    pub id: Uuid,
    /// Display text.
    pub text: String,
    /// Ordered options.
    pub options: Vec<OptionView>,
}

/// Selectable option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct OptionView {
    /// Option identifier.
    pub id: Uuid,
    /// Display text.
    pub text: String,
}

impl From<&Question> for QuestionView {
    fn from(value: &Question) -> Self {
        Self {
            id: value.id,
            text: value.text.clone(),
            options: value
                .options
                .iter()
                .map(|option| OptionView {
                    id: option.id,
                    text: option.text.clone(),
                })
                .collect(),
        }
    }
}

/// A local selection and whether it reached the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct AnswerView {
    /// Question identifier.
    pub question_id: Uuid,
    /// Selected option.
    pub option_id: Uuid,
    /// Whether the backend stored this selection.
    pub synced: bool,
}

/// Select an option for a question.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct SelectAnswerRequest {
    /// Question being answered.
    #[validate(custom(function = "validate_not_nil"))]
    pub question_id: Uuid,
    /// Chosen option.
    #[validate(custom(function = "validate_not_nil"))]
    pub option_id: Uuid,
}

/// What happened to a selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SelectOutcome {
    /// Stored by the backend.
    Saved,
    /// Recorded locally; the write will be retried.
    Queued,
    /// Superseded by a newer selection for the same question.
    Superseded,
    /// Ignored because answers are not accepted right now.
    Ignored,
}

/// Response to a selection.
#[derive(Debug, Serialize, ToSchema)]
pub struct SelectAnswerResponse {
    /// Outcome of the selection.
    pub outcome: SelectOutcome,
    /// Answers waiting for a retry.
    pub pending_sync: usize,
}

/// Response to an explicit join request.
#[derive(Debug, Serialize, ToSchema)]
pub struct JoinResponse {
    /// Backend outcome.
    pub outcome: PreJoinOutcome,
    /// Participation as displayed afterwards.
    pub participation: ParticipationView,
}

/// Page visibility and connectivity signals.
#[derive(Debug, Deserialize, ToSchema, Validate)]
#[validate(schema(function = "validate_any_signal"))]
pub struct VisibilityRequest {
    /// Whether the tab is foregrounded.
    #[serde(default)]
    pub visible: Option<bool>,
    /// Whether the browser reports being online.
    #[serde(default)]
    pub online: Option<bool>,
}

fn validate_not_nil(id: &Uuid) -> Result<(), ValidationError> {
    if id.is_nil() {
        let mut err = ValidationError::new("nil_uuid");
        err.message = Some("identifier must not be the nil UUID".into());
        return Err(err);
    }
    Ok(())
}

fn validate_any_signal(request: &VisibilityRequest) -> Result<(), ValidationError> {
    if request.visible.is_none() && request.online.is_none() {
        let mut err = ValidationError::new("empty_signal");
        err.message = Some("at least one of `visible` or `online` is required".into());
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_identifiers_are_rejected() {
        let request = SelectAnswerRequest {
            question_id: Uuid::nil(),
            option_id: Uuid::from_u128(1),
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn visibility_request_needs_a_signal() {
        let empty: VisibilityRequest = serde_json::from_str("{}").unwrap();
        assert!(empty.validate().is_err());

        let hidden: VisibilityRequest = serde_json::from_str(r#"{"visible": false}"#).unwrap();
        assert!(hidden.validate().is_ok());
    }
}
