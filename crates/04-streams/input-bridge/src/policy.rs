//! Capture policy state machine per (session, browser session).
//!
//! Guards run before any state mutation; every accepted request, no-ops
//! included, produces a policy-change event for the status stream. The
//! guard identifiers (`MO-GUARD-*`, `CT-GUARD-*`, `ER-GUARD-*`) travel in
//! rejection details so the transport can surface them verbatim.

use engine_abi::{
    CaptureMode, EngineError, ErrorCode, ErrorDetails, PolicyChangeEvent, PolicyHook, PolicySource,
    PolicyState, TransitionResult,
};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Escape-release configuration for `click_to_capture`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyConfig {
    pub escape_sequence: Vec<String>,
    pub escape_timeout_ms: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            escape_sequence: vec!["Escape".into(), "Escape".into()],
            escape_timeout_ms: 600,
        }
    }
}

/// One (session, browser session) policy instance.
#[derive(Clone, Debug)]
pub struct CapturePolicy {
    config: PolicyConfig,
    input_enabled: bool,
    capture_mode: CaptureMode,
    state: PolicyState,
    source: PolicySource,
    changed_at_us: u64,
    /// Timestamps of escape keys matched so far.
    escape_progress: Vec<u64>,
}

impl CapturePolicy {
    pub fn new(config: PolicyConfig) -> CapturePolicy {
        CapturePolicy {
            config,
            input_enabled: false,
            capture_mode: CaptureMode::ClickToCapture,
            state: PolicyState::Disabled,
            source: PolicySource::LifecycleTransition,
            changed_at_us: 0,
            escape_progress: Vec::new(),
        }
    }

    pub fn state(&self) -> PolicyState {
        self.state
    }

    pub fn capture_mode(&self) -> CaptureMode {
        self.capture_mode
    }

    pub fn capture_active(&self) -> bool {
        self.state.capture_active()
    }

    pub fn input_enabled(&self) -> bool {
        self.input_enabled
    }

    fn event(&self, result: TransitionResult, reason: &str) -> PolicyChangeEvent {
        PolicyChangeEvent {
            state: self.state,
            capture_active: self.capture_active(),
            source: self.source,
            reason: reason.to_owned(),
            transition_result: result,
            changed_at_us: self.changed_at_us,
        }
    }

    fn transition(
        &mut self,
        state: PolicyState,
        source: PolicySource,
        reason: &str,
        now_us: u64,
    ) -> PolicyChangeEvent {
        self.state = state;
        self.source = source;
        self.changed_at_us = now_us;
        self.escape_progress.clear();
        self.event(TransitionResult::Applied, reason)
    }

    /// Enables or disables input; idempotent re-enables are accepted no-ops.
    pub fn set_enabled(
        &mut self,
        enabled: bool,
        source: PolicySource,
        now_us: u64,
    ) -> PolicyChangeEvent {
        if enabled == self.input_enabled {
            return self.event(TransitionResult::NoOp, "enable_unchanged");
        }
        self.input_enabled = enabled;
        if enabled {
            self.transition(PolicyState::EnabledIdle, source, "input_enabled", now_us)
        } else {
            // Disabling always forces capture off.
            self.transition(PolicyState::Disabled, source, "input_disabled", now_us)
        }
    }

    /// Switches the capture mode; an active capture is released first.
    pub fn set_mode(
        &mut self,
        mode: CaptureMode,
        source: PolicySource,
        now_us: u64,
    ) -> PolicyChangeEvent {
        if mode == self.capture_mode {
            return self.event(TransitionResult::NoOp, "mode_unchanged");
        }
        self.capture_mode = mode;
        if self.state == PolicyState::EnabledCaptured {
            self.transition(PolicyState::EnabledIdle, source, "mode_changed", now_us)
        } else {
            self.changed_at_us = now_us;
            self.event(TransitionResult::Applied, "mode_changed")
        }
    }

    /// Feeds one browser-side hook through the mode's state machine.
    pub fn hook(
        &mut self,
        hook: PolicyHook,
        now_us: u64,
    ) -> Result<PolicyChangeEvent, EngineError> {
        if self.state == PolicyState::Disabled {
            // Disabled input suppresses acquisition without failing.
            return Ok(self.event(TransitionResult::NoOp, "input_disabled"));
        }
        match self.capture_mode {
            CaptureMode::MouseOver => self.mouse_over_hook(hook, now_us),
            CaptureMode::ClickToCapture => self.click_to_capture_hook(hook, now_us),
        }
    }

    fn mouse_over_hook(
        &mut self,
        hook: PolicyHook,
        now_us: u64,
    ) -> Result<PolicyChangeEvent, EngineError> {
        match hook {
            PolicyHook::PointerEnter => {
                if self.state == PolicyState::EnabledIdle {
                    Ok(self.transition(
                        PolicyState::EnabledCaptured,
                        PolicySource::UserRequest,
                        "pointer_enter",
                        now_us,
                    ))
                } else {
                    Ok(self.event(TransitionResult::NoOp, "pointer_enter"))
                }
            }
            PolicyHook::PointerLeave => {
                if self.state == PolicyState::EnabledCaptured {
                    Ok(self.transition(
                        PolicyState::EnabledIdle,
                        PolicySource::UserRequest,
                        "pointer_leave",
                        now_us,
                    ))
                } else {
                    Ok(self.event(TransitionResult::NoOp, "pointer_leave"))
                }
            }
            // Explicit release is a no-op in mouse-over mode.
            PolicyHook::ExplicitRelease => Ok(self.event(TransitionResult::NoOp, "release_noop")),
            PolicyHook::FocusLost | PolicyHook::FocusGained => {
                Ok(self.event(TransitionResult::NoOp, "focus_ignored"))
            }
            PolicyHook::CanvasClick | PolicyHook::EscapeKey { .. } => Err(EngineError::new(
                ErrorCode::InputPolicyModeInvalid,
                "click/escape hooks require click_to_capture mode",
            )
            .with_details(ErrorDetails::guard(
                "MO-GUARD-01",
                "/api/v2/input/policy/hook",
            ))),
        }
    }

    fn click_to_capture_hook(
        &mut self,
        hook: PolicyHook,
        now_us: u64,
    ) -> Result<PolicyChangeEvent, EngineError> {
        match hook {
            PolicyHook::CanvasClick => {
                if self.state == PolicyState::EnabledIdle {
                    Ok(self.transition(
                        PolicyState::EnabledCaptured,
                        PolicySource::UserRequest,
                        "canvas_click",
                        now_us,
                    ))
                } else {
                    Ok(self.event(TransitionResult::NoOp, "canvas_click"))
                }
            }
            PolicyHook::FocusLost => {
                if self.state == PolicyState::EnabledCaptured {
                    Ok(self.transition(
                        PolicyState::EnabledIdle,
                        PolicySource::SystemGuard,
                        "focus_loss",
                        now_us,
                    ))
                } else {
                    Ok(self.event(TransitionResult::NoOp, "focus_loss"))
                }
            }
            // Regaining focus never re-acquires by itself.
            PolicyHook::FocusGained => Ok(self.event(TransitionResult::NoOp, "focus_gained")),
            PolicyHook::ExplicitRelease => {
                if self.state == PolicyState::EnabledCaptured {
                    Ok(self.transition(
                        PolicyState::EnabledIdle,
                        PolicySource::UserRequest,
                        "explicit_release",
                        now_us,
                    ))
                } else {
                    Ok(self.event(TransitionResult::NoOp, "explicit_release"))
                }
            }
            PolicyHook::EscapeKey { code, at_us } => Ok(self.escape_key(&code, at_us)),
            PolicyHook::PointerEnter | PolicyHook::PointerLeave => Err(EngineError::new(
                ErrorCode::InputPolicyModeInvalid,
                "pointer hooks require mouse_over mode",
            )
            .with_details(ErrorDetails::guard(
                "CT-GUARD-01",
                "/api/v2/input/policy/hook",
            ))),
        }
    }

    /// Escape-sequence matcher; the whole sequence must land within the
    /// configured timeout to release capture.
    fn escape_key(&mut self, code: &str, at_us: u64) -> PolicyChangeEvent {
        if self.state != PolicyState::EnabledCaptured {
            self.escape_progress.clear();
            return self.event(TransitionResult::NoOp, "escape_sequence");
        }
        if let Some(&first) = self.escape_progress.first() {
            if at_us.saturating_sub(first) > self.config.escape_timeout_ms * 1_000 {
                // Too slow; this key restarts the sequence.
                self.escape_progress.clear();
            }
        }
        let expected = self
            .config
            .escape_sequence
            .get(self.escape_progress.len())
            .cloned();
        if expected.as_deref() != Some(code) {
            self.escape_progress.clear();
            return self.event(TransitionResult::NoOp, "escape_mismatch");
        }
        self.escape_progress.push(at_us);
        if self.escape_progress.len() >= self.config.escape_sequence.len() {
            self.transition(
                PolicyState::EnabledIdle,
                PolicySource::SystemGuard,
                "escape_sequence",
                at_us,
            )
        } else {
            self.event(TransitionResult::NoOp, "escape_progress")
        }
    }
}

/// Registry of capture policies keyed by (session, browser session).
pub struct PolicyRegistry {
    config: PolicyConfig,
    policies: Mutex<HashMap<(String, String), CapturePolicy>>,
}

impl PolicyRegistry {
    pub fn new(config: PolicyConfig) -> PolicyRegistry {
        PolicyRegistry {
            config,
            policies: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `f` against the policy for the pair, creating it on first use.
    pub fn with_policy<R>(
        &self,
        session: &str,
        browser: &str,
        f: impl FnOnce(&mut CapturePolicy) -> R,
    ) -> R {
        let mut policies = self.policies.lock();
        let policy = policies
            .entry((session.to_owned(), browser.to_owned()))
            .or_insert_with(|| CapturePolicy::new(self.config.clone()));
        f(policy)
    }

    /// Fails with the session guard when the pair was never registered.
    pub fn with_existing_policy<R>(
        &self,
        session: &str,
        browser: &str,
        f: impl FnOnce(&mut CapturePolicy) -> R,
    ) -> Result<R, EngineError> {
        let mut policies = self.policies.lock();
        match policies.get_mut(&(session.to_owned(), browser.to_owned())) {
            Some(policy) => Ok(f(policy)),
            None => Err(EngineError::new(
                ErrorCode::InputPolicySessionInvalid,
                format!("no capture policy for ({session}, {browser})"),
            )
            .with_details(ErrorDetails::guard(
                "ER-GUARD-01",
                "/api/v2/input/policy",
            ))),
        }
    }

    /// Lifecycle transition sweep: force-disable every policy of a session.
    pub fn disable_session(&self, session: &str, now_us: u64) -> Vec<PolicyChangeEvent> {
        let mut policies = self.policies.lock();
        policies
            .iter_mut()
            .filter(|((s, _), _)| s == session)
            .map(|(_, policy)| {
                policy.set_enabled(false, PolicySource::LifecycleTransition, now_us)
            })
            .collect()
    }
}
