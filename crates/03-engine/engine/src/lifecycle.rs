//! Lifecycle state machine: guarded transitions as a pure evaluation.
//!
//! `evaluate` never mutates anything; it maps (current state, action) to
//! either the transition to perform or the canonical rejection, with the
//! deciding guard in the error details. The scheduler applies effects and
//! commits the end state.

use engine_abi::{EngineError, ErrorCode, ErrorDetails, LifecycleCmd, LifecycleState, ResumeMode};

/// The effectful work the scheduler must do for an accepted transition.
#[derive(Clone, Debug, PartialEq)]
pub enum TransitionEffect {
    /// Construct the machine and start running.
    StartMachine,
    /// No side effects beyond the state commit.
    None,
    /// Full machine reset, counters preserved.
    ResetMachine,
    /// Save a snapshot; only on success commit `suspended`.
    SaveSnapshot { name: String },
    /// Restore a snapshot; only on success commit the resume state.
    RestoreSnapshot { snapshot_id: String },
    /// Tear the machine down.
    StopMachine,
}

/// An accepted transition: transient state, end state, and the effect.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    /// Intermediate state (`starting`/`stopping`) or the end state directly.
    pub via: Option<LifecycleState>,
    pub to: LifecycleState,
    pub effect: TransitionEffect,
}

fn reject(
    code: ErrorCode,
    guard_id: &'static str,
    cmd: &LifecycleCmd,
    current: LifecycleState,
) -> EngineError {
    EngineError::new(
        code,
        format!(
            "{} rejected in state {}",
            cmd.endpoint(),
            current.as_str()
        ),
    )
    .with_details(ErrorDetails::guard(guard_id, cmd.endpoint()).with("state", current.as_str()))
}

/// Evaluates one lifecycle action against the current state.
///
/// `has_session` distinguishes `ENGINE_NOT_RUNNING` (no session at all)
/// from `INVALID_SESSION_STATE` (session in the wrong state).
pub fn evaluate(
    current: LifecycleState,
    has_session: bool,
    cmd: &LifecycleCmd,
) -> Result<Transition, EngineError> {
    use LifecycleState::*;

    // Transient states accept nothing.
    if matches!(current, Starting | Stopping) {
        return Err(reject(
            ErrorCode::InvalidSessionState,
            "G-COMMON-01",
            cmd,
            current,
        ));
    }

    match cmd {
        LifecycleCmd::Start { machine, profile, rom_id } => {
            if has_session {
                return Err(reject(
                    ErrorCode::EngineAlreadyRunning,
                    "G-START-01",
                    cmd,
                    current,
                ));
            }
            if machine.is_empty() || profile.is_empty() || rom_id.as_deref() == Some("") {
                return Err(reject(
                    ErrorCode::MalformedRequest,
                    "G-START-02",
                    cmd,
                    current,
                ));
            }
            Ok(Transition {
                via: Some(Starting),
                to: Running,
                effect: TransitionEffect::StartMachine,
            })
        }
        _ if !has_session => Err(reject(
            ErrorCode::EngineNotRunning,
            "G-COMMON-01",
            cmd,
            current,
        )),
        LifecycleCmd::Pause => match current {
            Running => Ok(Transition {
                via: None,
                to: Paused,
                effect: TransitionEffect::None,
            }),
            _ => Err(reject(
                ErrorCode::InvalidSessionState,
                "G-PAUSE-01",
                cmd,
                current,
            )),
        },
        LifecycleCmd::Resume { target } => match current {
            Paused | Suspended => Ok(Transition {
                via: None,
                to: match target {
                    ResumeMode::Running => Running,
                    ResumeMode::Paused => Paused,
                },
                effect: TransitionEffect::None,
            }),
            _ => Err(reject(
                ErrorCode::InvalidSessionState,
                if matches!(target, ResumeMode::Running) {
                    "G-RESUME-01"
                } else {
                    "G-RESUME-02"
                },
                cmd,
                current,
            )),
        },
        LifecycleCmd::Reset => match current {
            Running | Paused => Ok(Transition {
                via: None,
                to: Running,
                effect: TransitionEffect::ResetMachine,
            }),
            _ => Err(reject(
                ErrorCode::InvalidSessionState,
                "G-RESET-01",
                cmd,
                current,
            )),
        },
        LifecycleCmd::SuspendSave { name } => match current {
            Running => Ok(Transition {
                via: None,
                to: Suspended,
                effect: TransitionEffect::SaveSnapshot { name: name.clone() },
            }),
            _ => Err(reject(
                ErrorCode::InvalidSessionState,
                "G-SUSPEND-01",
                cmd,
                current,
            )),
        },
        LifecycleCmd::RestoreResume {
            snapshot_id,
            resume_mode,
        } => match current {
            Suspended => Ok(Transition {
                via: None,
                to: match resume_mode {
                    ResumeMode::Running => Running,
                    ResumeMode::Paused => Paused,
                },
                effect: TransitionEffect::RestoreSnapshot {
                    snapshot_id: snapshot_id.clone(),
                },
            }),
            _ => Err(reject(
                ErrorCode::EngineNotSuspended,
                "G-RESTORE-01",
                cmd,
                current,
            )),
        },
        LifecycleCmd::Stop => match current {
            Running | Paused | Suspended | Faulted => Ok(Transition {
                via: Some(Stopping),
                to: Stopped,
                effect: TransitionEffect::StopMachine,
            }),
            _ => Err(reject(
                ErrorCode::InvalidSessionState,
                "G-STOP-01",
                cmd,
                current,
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn start_cmd() -> LifecycleCmd {
        LifecycleCmd::Start {
            machine: "atari_st".into(),
            profile: "st_520_pal".into(),
            rom_id: Some("rom.tos.1.04.uk".into()),
        }
    }

    #[test]
    fn start_from_stopped_runs() {
        let transition =
            evaluate(LifecycleState::Stopped, false, &start_cmd()).expect("accepted");
        assert_eq!(transition.via, Some(LifecycleState::Starting));
        assert_eq!(transition.to, LifecycleState::Running);
    }

    #[test]
    fn duplicate_start_is_already_running() {
        let err = evaluate(LifecycleState::Running, true, &start_cmd()).expect_err("dup");
        assert_eq!(err.code, ErrorCode::EngineAlreadyRunning);
        assert_eq!(err.details.guard_id, Some("G-START-01"));
    }

    #[test]
    fn pause_requires_running() {
        let err =
            evaluate(LifecycleState::Paused, true, &LifecycleCmd::Pause).expect_err("rejected");
        assert_eq!(err.code, ErrorCode::InvalidSessionState);
        assert_eq!(err.details.guard_id, Some("G-PAUSE-01"));
        assert!(!err.retryable);
    }

    #[test]
    fn commands_without_session_are_engine_not_running() {
        let err =
            evaluate(LifecycleState::Stopped, false, &LifecycleCmd::Pause).expect_err("no session");
        assert_eq!(err.code, ErrorCode::EngineNotRunning);
    }

    #[test]
    fn resume_targets_both_states() {
        let to_running = evaluate(
            LifecycleState::Suspended,
            true,
            &LifecycleCmd::Resume {
                target: ResumeMode::Running,
            },
        )
        .expect("resume running");
        assert_eq!(to_running.to, LifecycleState::Running);
        let to_paused = evaluate(
            LifecycleState::Paused,
            true,
            &LifecycleCmd::Resume {
                target: ResumeMode::Paused,
            },
        )
        .expect("resume paused");
        assert_eq!(to_paused.to, LifecycleState::Paused);
    }

    #[test]
    fn faulted_rejects_reset_but_accepts_stop() {
        let err =
            evaluate(LifecycleState::Faulted, true, &LifecycleCmd::Reset).expect_err("no reset");
        assert_eq!(err.code, ErrorCode::InvalidSessionState);
        let stop = evaluate(LifecycleState::Faulted, true, &LifecycleCmd::Stop).expect("stop");
        assert_eq!(stop.to, LifecycleState::Stopped);
    }

    #[test]
    fn restore_requires_suspended() {
        let err = evaluate(
            LifecycleState::Running,
            true,
            &LifecycleCmd::RestoreResume {
                snapshot_id: "snap".into(),
                resume_mode: ResumeMode::Paused,
            },
        )
        .expect_err("not suspended");
        assert_eq!(err.code, ErrorCode::EngineNotSuspended);
        assert_eq!(err.details.guard_id, Some("G-RESTORE-01"));
    }

    #[test]
    fn transient_states_reject_everything() {
        let err =
            evaluate(LifecycleState::Starting, true, &LifecycleCmd::Stop).expect_err("transient");
        assert_eq!(err.details.guard_id, Some("G-COMMON-01"));
    }
}
