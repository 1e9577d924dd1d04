//! Kiosk capture-loop state machine.
//!
//! The machine is deterministic and side-effect free: `step` maps
//! (current state, event) to the next state plus a list of effects for
//! the async driver to execute (start a verify call, start a mark
//! call, arm the auto-reset timer). Timers and network I/O live in the
//! driver and come back in as events.
//!
//! Every request and display window carries the generation it was
//! issued under. Cancel resets local state without cancelling the
//! in-flight call; a late response for an abandoned generation no
//! longer matches the current state and is dropped.

use std::time::Duration;

/// Hard ceiling on one verification round trip. Exceeding it is shown
/// exactly like a rejection, never a silent hang.
pub const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// How long rejection and confirmation screens stay up before the
/// kiosk resets itself for the next walk-up.
pub const DISPLAY_WINDOW: Duration = Duration::from_secs(3);

/// Both-eyes-open probability floor for the external face detector's
/// per-frame liveness verdict.
pub const LIVENESS_FLOOR: f32 = 0.5;

pub const TIMEOUT_MESSAGE: &str = "Student not found - verification timeout";

/// Liveness verdict for one analyzed frame: both eyes reported open
/// with probability strictly above [`LIVENESS_FLOOR`]. A missing
/// probability counts as closed.
pub fn is_live(left_eye_open: f32, right_eye_open: f32) -> bool {
    left_eye_open > LIVENESS_FLOOR && right_eye_open > LIVENESS_FLOOR
}

/// Identity shown to the operator after a successful match.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedStudent {
    pub student_id: String,
    pub name: String,
    pub confidence: f64,
}

/// The part of a `/gate/verify` response the state machine acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyReply {
    /// verified=true, not yet marked today — wait for the operator.
    Matched(MatchedStudent),
    /// verified=true but already marked; shown and auto-advanced.
    AlreadyMarked {
        student: MatchedStudent,
        attendance_time: Option<String>,
    },
    /// verified=false, whatever the reason (no face, no match, low
    /// confidence). The kiosk shows the message and resets.
    NotRecognized { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum State {
    /// Awaiting a live face in frame.
    Idle,
    Verifying {
        generation: u64,
    },
    /// Accepted match awaiting the operator's decision. The only state
    /// that requires human input: a misidentified face must not be
    /// granted attendance silently.
    Matched {
        generation: u64,
        student: MatchedStudent,
    },
    Marking {
        generation: u64,
        student: MatchedStudent,
    },
    /// Positive display (marked, or already marked); auto-resets.
    Confirmed {
        generation: u64,
        message: String,
    },
    /// Negative display (not recognized, timeout, failure); auto-resets.
    Rejected {
        generation: u64,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Verdict of the continuous liveness pre-filter for the most
    /// recent analyzed frame.
    FrameAnalyzed { live: bool },
    VerifyFinished { generation: u64, reply: VerifyReply },
    VerifyFailed { generation: u64, message: String },
    VerifyTimedOut { generation: u64 },
    OperatorMark,
    OperatorCancel,
    MarkFinished {
        generation: u64,
        success: bool,
        message: String,
    },
    MarkFailed { generation: u64, message: String },
    DisplayElapsed { generation: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Capture the current frame and race `/gate/verify` against
    /// [`VERIFY_TIMEOUT`].
    StartVerify { generation: u64 },
    StartMark {
        generation: u64,
        student_id: String,
        confidence: f64,
    },
    /// Arm the [`DISPLAY_WINDOW`] auto-reset timer.
    StartDisplayTimer { generation: u64 },
}

/// The capture-loop machine. One per kiosk; single active operation at
/// a time, enforced by the state itself rather than a lock.
#[derive(Debug)]
pub struct Machine {
    state: State,
    generation: u64,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            generation: 0,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn enter_rejected(&mut self, message: String) -> Vec<Effect> {
        let generation = self.next_generation();
        self.state = State::Rejected {
            generation,
            message,
        };
        vec![Effect::StartDisplayTimer { generation }]
    }

    fn enter_confirmed(&mut self, message: String) -> Vec<Effect> {
        let generation = self.next_generation();
        self.state = State::Confirmed {
            generation,
            message,
        };
        vec![Effect::StartDisplayTimer { generation }]
    }

    /// Advance the machine. Events that do not apply to the current
    /// state (stale generations, frames while busy, late timers) are
    /// ignored without a transition.
    pub fn step(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::FrameAnalyzed { live } => {
                // Fires a verification only from Idle: not while a call
                // is in flight, and not while any result is displayed.
                if live && self.state == State::Idle {
                    let generation = self.next_generation();
                    self.state = State::Verifying { generation };
                    vec![Effect::StartVerify { generation }]
                } else {
                    vec![]
                }
            }

            Event::VerifyFinished { generation, reply } => {
                if self.state != (State::Verifying { generation }) {
                    return vec![];
                }
                match reply {
                    VerifyReply::Matched(student) => {
                        self.state = State::Matched {
                            generation,
                            student,
                        };
                        vec![]
                    }
                    VerifyReply::AlreadyMarked { student, .. } => self.enter_confirmed(format!(
                        "{}: attendance already marked today",
                        student.name
                    )),
                    VerifyReply::NotRecognized { message } => self.enter_rejected(message),
                }
            }

            Event::VerifyFailed {
                generation,
                message,
            } => {
                if self.state != (State::Verifying { generation }) {
                    return vec![];
                }
                self.enter_rejected(message)
            }

            Event::VerifyTimedOut { generation } => {
                if self.state != (State::Verifying { generation }) {
                    return vec![];
                }
                self.enter_rejected(TIMEOUT_MESSAGE.to_string())
            }

            Event::OperatorMark => {
                let State::Matched { student, .. } = &self.state else {
                    return vec![];
                };
                let student = student.clone();
                let generation = self.next_generation();
                let effect = Effect::StartMark {
                    generation,
                    student_id: student.student_id.clone(),
                    confidence: student.confidence,
                };
                self.state = State::Marking {
                    generation,
                    student,
                };
                vec![effect]
            }

            Event::OperatorCancel => {
                // Immediate local reset; any in-flight call is
                // abandoned, not cancelled, and its response will find
                // a state it no longer matches.
                self.state = State::Idle;
                vec![]
            }

            Event::MarkFinished {
                generation,
                success,
                message,
            } => {
                let State::Marking {
                    generation: current, ..
                } = &self.state
                else {
                    return vec![];
                };
                if *current != generation {
                    return vec![];
                }
                // success=false here means "already marked today" —
                // still a confirmation at the gate, not an error.
                let _ = success;
                self.enter_confirmed(message)
            }

            Event::MarkFailed {
                generation,
                message,
            } => {
                let State::Marking {
                    generation: current, ..
                } = &self.state
                else {
                    return vec![];
                };
                if *current != generation {
                    return vec![];
                }
                self.enter_rejected(message)
            }

            Event::DisplayElapsed { generation } => {
                let applies = matches!(
                    &self.state,
                    State::Confirmed { generation: g, .. } | State::Rejected { generation: g, .. }
                        if *g == generation
                );
                if applies {
                    self.state = State::Idle;
                }
                vec![]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn student() -> MatchedStudent {
        MatchedStudent {
            student_id: "S100".into(),
            name: "Asha Rao".into(),
            confidence: 0.82,
        }
    }

    fn live_frame() -> Event {
        Event::FrameAnalyzed { live: true }
    }

    #[test]
    fn test_liveness_requires_both_eyes_open() {
        assert!(is_live(0.9, 0.8));
        assert!(!is_live(0.9, 0.3));
        assert!(!is_live(0.3, 0.9));
        // Floor is strict: exactly 0.5 does not pass.
        assert!(!is_live(0.5, 0.9));
    }

    #[test]
    fn test_live_frame_starts_exactly_one_verification() {
        let mut m = Machine::new();
        let effects = m.step(live_frame());
        assert_eq!(effects, vec![Effect::StartVerify { generation: 1 }]);
        assert_eq!(m.state(), &State::Verifying { generation: 1 });

        // The analysis stream keeps firing; the busy machine ignores it.
        assert!(m.step(live_frame()).is_empty());
        assert!(m.step(Event::FrameAnalyzed { live: false }).is_empty());
        assert_eq!(m.state(), &State::Verifying { generation: 1 });
    }

    #[test]
    fn test_non_live_frame_does_nothing() {
        let mut m = Machine::new();
        assert!(m.step(Event::FrameAnalyzed { live: false }).is_empty());
        assert_eq!(m.state(), &State::Idle);
    }

    #[test]
    fn test_match_waits_for_operator() {
        let mut m = Machine::new();
        m.step(live_frame());
        let effects = m.step(Event::VerifyFinished {
            generation: 1,
            reply: VerifyReply::Matched(student()),
        });
        // No timer: this state waits for a human.
        assert!(effects.is_empty());

        let effects = m.step(Event::OperatorMark);
        assert_eq!(
            effects,
            vec![Effect::StartMark {
                generation: 2,
                student_id: "S100".into(),
                confidence: 0.82,
            }]
        );

        let effects = m.step(Event::MarkFinished {
            generation: 2,
            success: true,
            message: "Attendance marked successfully".into(),
        });
        assert_eq!(effects, vec![Effect::StartDisplayTimer { generation: 3 }]);

        assert!(m.step(Event::DisplayElapsed { generation: 3 }).is_empty());
        assert_eq!(m.state(), &State::Idle);
    }

    #[test]
    fn test_already_marked_auto_advances() {
        let mut m = Machine::new();
        m.step(live_frame());
        let effects = m.step(Event::VerifyFinished {
            generation: 1,
            reply: VerifyReply::AlreadyMarked {
                student: student(),
                attendance_time: Some("2025-06-01T09:03:00Z".into()),
            },
        });
        assert_eq!(effects, vec![Effect::StartDisplayTimer { generation: 2 }]);
        assert!(matches!(m.state(), State::Confirmed { .. }));

        m.step(Event::DisplayElapsed { generation: 2 });
        assert_eq!(m.state(), &State::Idle);
    }

    #[test]
    fn test_rejection_displays_then_resets() {
        let mut m = Machine::new();
        m.step(live_frame());
        let effects = m.step(Event::VerifyFinished {
            generation: 1,
            reply: VerifyReply::NotRecognized {
                message: "Face not recognized".into(),
            },
        });
        assert_eq!(effects, vec![Effect::StartDisplayTimer { generation: 2 }]);

        // Frames during the display window must not re-trigger.
        assert!(m.step(live_frame()).is_empty());

        m.step(Event::DisplayElapsed { generation: 2 });
        assert_eq!(m.state(), &State::Idle);
    }

    #[test]
    fn test_timeout_treated_as_rejection() {
        let mut m = Machine::new();
        m.step(live_frame());
        let effects = m.step(Event::VerifyTimedOut { generation: 1 });
        assert_eq!(effects, vec![Effect::StartDisplayTimer { generation: 2 }]);
        assert_eq!(
            m.state(),
            &State::Rejected {
                generation: 2,
                message: TIMEOUT_MESSAGE.into(),
            }
        );
    }

    #[test]
    fn test_cancel_abandons_in_flight_verify() {
        let mut m = Machine::new();
        m.step(live_frame());
        m.step(Event::OperatorCancel);
        assert_eq!(m.state(), &State::Idle);

        // The abandoned call's late response must not apply.
        let effects = m.step(Event::VerifyFinished {
            generation: 1,
            reply: VerifyReply::Matched(student()),
        });
        assert!(effects.is_empty());
        assert_eq!(m.state(), &State::Idle);

        // A fresh session gets a fresh generation.
        let effects = m.step(live_frame());
        assert_eq!(effects, vec![Effect::StartVerify { generation: 2 }]);
    }

    #[test]
    fn test_stale_timeout_ignored_after_resolution() {
        let mut m = Machine::new();
        m.step(live_frame());
        m.step(Event::VerifyFinished {
            generation: 1,
            reply: VerifyReply::Matched(student()),
        });
        // The driver's timeout for generation 1 fires anyway.
        assert!(m.step(Event::VerifyTimedOut { generation: 1 }).is_empty());
        assert!(matches!(m.state(), State::Matched { .. }));
    }

    #[test]
    fn test_stale_display_timer_does_not_cut_new_session() {
        let mut m = Machine::new();
        m.step(live_frame());
        m.step(Event::VerifyTimedOut { generation: 1 }); // Rejected, gen 2
        m.step(Event::OperatorCancel); // operator clears it early
        m.step(live_frame()); // new session, gen 3

        // Old display timer fires mid-verification: ignored.
        assert!(m.step(Event::DisplayElapsed { generation: 2 }).is_empty());
        assert_eq!(m.state(), &State::Verifying { generation: 3 });
    }

    #[test]
    fn test_cancel_from_matched_discards_identity() {
        let mut m = Machine::new();
        m.step(live_frame());
        m.step(Event::VerifyFinished {
            generation: 1,
            reply: VerifyReply::Matched(student()),
        });
        m.step(Event::OperatorCancel);
        assert_eq!(m.state(), &State::Idle);

        // Mark without a displayed match is meaningless.
        assert!(m.step(Event::OperatorMark).is_empty());
    }

    #[test]
    fn test_mark_failure_is_rejected_with_message() {
        let mut m = Machine::new();
        m.step(live_frame());
        m.step(Event::VerifyFinished {
            generation: 1,
            reply: VerifyReply::Matched(student()),
        });
        m.step(Event::OperatorMark);
        let effects = m.step(Event::MarkFailed {
            generation: 2,
            message: "Failed to mark attendance: connection reset".into(),
        });
        assert_eq!(effects, vec![Effect::StartDisplayTimer { generation: 3 }]);
        assert!(matches!(m.state(), State::Rejected { .. }));
    }

    #[test]
    fn test_verify_failure_funnels_into_rejected() {
        let mut m = Machine::new();
        m.step(live_frame());
        let effects = m.step(Event::VerifyFailed {
            generation: 1,
            message: "verification failed".into(),
        });
        assert_eq!(effects, vec![Effect::StartDisplayTimer { generation: 2 }]);
        assert!(matches!(m.state(), State::Rejected { .. }));
    }
}
