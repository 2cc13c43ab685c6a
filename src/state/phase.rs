//! Quiz phase derivation: a pure function of the quiz window and the clock.

use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use utoipa::ToSchema;

use crate::state::quiz::QuizWindow;

/// Time-derived phase of a quiz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum QuizPhase {
    /// Before the opening time (or administratively paused).
    Waiting,
    /// Inside the opening window.
    Active,
    /// Past the closing time.
    Finished,
}

/// A phase together with the countdown to the next boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseReading {
    /// Derived phase.
    pub phase: QuizPhase,
    /// Time until the boundary that is still ahead; zero once finished.
    pub time_left: Duration,
}

fn until(now: OffsetDateTime, boundary: OffsetDateTime) -> Duration {
    (boundary - now).unsigned_abs()
}

/// Derive the phase for `now`.
///
/// `waiting` iff `now < start`, `active` iff `start <= now < end`, `finished`
/// otherwise. A paused quiz reads as `waiting` while keeping the countdown of
/// whichever boundary is still ahead.
pub fn read_phase(window: QuizWindow, paused: bool, now: OffsetDateTime) -> PhaseReading {
    let (phase, time_left) = if now < window.start {
        (QuizPhase::Waiting, until(now, window.start))
    } else if now < window.end {
        (QuizPhase::Active, until(now, window.end))
    } else {
        (QuizPhase::Finished, Duration::ZERO)
    };

    if paused {
        return PhaseReading {
            phase: QuizPhase::Waiting,
            time_left,
        };
    }

    PhaseReading { phase, time_left }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    fn window() -> QuizWindow {
        QuizWindow {
            start: datetime!(2026-05-10 18:00 UTC),
            end: datetime!(2026-05-10 18:05 UTC),
        }
    }

    #[test]
    fn countdown_scenario_across_the_window() {
        let before = read_phase(window(), false, datetime!(2026-05-10 17:59:50 UTC));
        assert_eq!(before.phase, QuizPhase::Waiting);
        assert_eq!(before.time_left, Duration::from_secs(10));

        let started = read_phase(window(), false, datetime!(2026-05-10 18:00:01 UTC));
        assert_eq!(started.phase, QuizPhase::Active);
        assert_eq!(started.time_left, Duration::from_secs(299));

        let closed = read_phase(window(), false, datetime!(2026-05-10 18:05 UTC));
        assert_eq!(closed.phase, QuizPhase::Finished);
        assert_eq!(closed.time_left, Duration::ZERO);
    }

    #[test]
    fn boundaries_are_half_open() {
        assert_eq!(
            read_phase(window(), false, window().start).phase,
            QuizPhase::Active
        );
        assert_eq!(
            read_phase(window(), false, window().end).phase,
            QuizPhase::Finished
        );
    }

    #[test]
    fn reading_does_not_depend_on_call_order() {
        let instants = [
            datetime!(2026-05-10 18:06 UTC),
            datetime!(2026-05-10 17:00 UTC),
            datetime!(2026-05-10 18:02 UTC),
            datetime!(2026-05-10 17:00 UTC),
        ];
        let phases: Vec<_> = instants
            .iter()
            .map(|now| read_phase(window(), false, *now).phase)
            .collect();
        assert_eq!(
            phases,
            vec![
                QuizPhase::Finished,
                QuizPhase::Waiting,
                QuizPhase::Active,
                QuizPhase::Waiting
            ]
        );
    }

    #[test]
    fn pause_forces_waiting_but_keeps_countdown() {
        let early = read_phase(window(), true, datetime!(2026-05-10 17:59 UTC));
        assert_eq!(early.phase, QuizPhase::Waiting);
        assert_eq!(early.time_left, Duration::from_secs(60));

        let mid = read_phase(window(), true, datetime!(2026-05-10 18:01 UTC));
        assert_eq!(mid.phase, QuizPhase::Waiting);
        assert_eq!(mid.time_left, Duration::from_secs(240));
    }
}
