//! Input mapping, capture policy, and translated event types.

use serde::{Deserialize, Serialize};

/// Host-side device classes producing normalized events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostDeviceType {
    Keyboard,
    Mouse,
    Gamepad,
}

/// Mouse buttons recognised by the translator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Right,
}

/// Edge phase of a mapped event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Down,
    Up,
    Move,
}

/// Host tuple a mapping entry keys on.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostEventKey {
    pub device_type: HostDeviceType,
    /// Normalized code, e.g. `KeyA`, `ArrowLeft`, `button_left`, `axis_x`.
    pub code: String,
    /// Modifier set, e.g. `shift`, `ctrl+alt`; `None` matches any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modifiers: Option<String>,
}

/// Normalized host event delivered by the browser collaborator.
#[derive(Clone, Debug, PartialEq)]
pub enum HostEvent {
    Key {
        code: String,
        modifiers: Option<String>,
        pressed: bool,
    },
    MouseMove {
        dx: i16,
        dy: i16,
    },
    MouseButton {
        button: MouseButton,
        pressed: bool,
    },
    GamepadButton {
        code: String,
        pressed: bool,
    },
}

impl HostEvent {
    /// Mapping key this event is looked up under.
    pub fn key(&self) -> HostEventKey {
        match self {
            HostEvent::Key {
                code, modifiers, ..
            } => HostEventKey {
                device_type: HostDeviceType::Keyboard,
                code: code.clone(),
                modifiers: modifiers.clone(),
            },
            HostEvent::MouseMove { .. } => HostEventKey {
                device_type: HostDeviceType::Mouse,
                code: "move".into(),
                modifiers: None,
            },
            HostEvent::MouseButton { button, .. } => HostEventKey {
                device_type: HostDeviceType::Mouse,
                code: match button {
                    MouseButton::Left => "button_left".into(),
                    MouseButton::Right => "button_right".into(),
                },
                modifiers: None,
            },
            HostEvent::GamepadButton { code, .. } => HostEventKey {
                device_type: HostDeviceType::Gamepad,
                code: code.clone(),
                modifiers: None,
            },
        }
    }

    /// Edge phase implied by the event itself.
    pub fn phase(&self) -> Phase {
        match self {
            HostEvent::Key { pressed, .. }
            | HostEvent::MouseButton { pressed, .. }
            | HostEvent::GamepadButton { pressed, .. } => {
                if *pressed {
                    Phase::Down
                } else {
                    Phase::Up
                }
            }
            HostEvent::MouseMove { .. } => Phase::Move,
        }
    }
}

/// Virtual machine-side targets an entry can map onto.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "arg")]
pub enum VirtualTarget {
    /// IKBD make/break scancode; break is `scancode | 0x80`.
    IkbdKey(u8),
    /// Relative mouse axis, 0 = X, 1 = Y.
    MouseAxis(u8),
    /// Mouse button bit in the IKBD mouse packet header.
    MouseButton(u8),
    /// Joystick direction bit (0..=3: up, down, left, right).
    JoystickDirection(u8),
    /// Joystick fire button.
    JoystickFire,
}

/// One `(host tuple) -> (virtual tuple)` mapping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub host: HostEventKey,
    pub target: VirtualTarget,
    pub value: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
}

/// Persisted mapping profile document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MappingProfile {
    pub mapping_profile_id: String,
    pub schema_version: u32,
    pub machine: String,
    pub profile: String,
    /// Monotonic; bumped only when the effective map changes.
    pub revision: u64,
    pub updated_at_us: u64,
    pub entries: Vec<MappingEntry>,
}

/// Capture acquisition modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    MouseOver,
    ClickToCapture,
}

/// Capture policy states per (session, browser session).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyState {
    Disabled,
    EnabledIdle,
    EnabledCaptured,
}

impl PolicyState {
    pub fn capture_active(self) -> bool {
        matches!(self, PolicyState::EnabledCaptured)
    }
}

/// Originator of a policy transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicySource {
    UserRequest,
    SystemGuard,
    LifecycleTransition,
}

/// Hooks the browser collaborator feeds into the policy machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PolicyHook {
    PointerEnter,
    PointerLeave,
    CanvasClick,
    FocusLost,
    FocusGained,
    ExplicitRelease,
    /// Key observed while captured, fed to escape-sequence matching.
    EscapeKey { code: String, at_us: u64 },
}

/// Whether an accepted policy request changed state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionResult {
    Applied,
    NoOp,
}

/// Policy-change event emitted for every accepted request, no-ops included.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PolicyChangeEvent {
    pub state: PolicyState,
    pub capture_active: bool,
    pub source: PolicySource,
    pub reason: String,
    pub transition_result: TransitionResult,
    pub changed_at_us: u64,
}

/// Translated virtual event published on the `input_translated` stream.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InputTranslatedEvent {
    pub target: VirtualTarget,
    pub value: i32,
    pub phase: Phase,
    pub host: HostEventKey,
}
