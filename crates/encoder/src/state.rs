//! Encoder session lifecycle.
//!
//! ```text
//!            configure            start              stop
//!   Idle ──────────────> Configured ──> PendingStart ──> Started ──> PendingStop ──> Stopped
//!    ^                       ^                            │  ^                          │
//!    │ configure             │ reset                pause │  │ resume                   │
//!  Error <── hardware fault  └──────────────────────  Paused ┘             reset ───────┘
//!
//!   any ──release──> PendingRelease ──> Released
//! ```
//!
//! [`plan`] is the pure decision table the session consults before touching
//! the hardware. It never mutates anything.

use std::fmt;

use ck_common::EncodeError;

/// Lifecycle state of an encoder session.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum SessionState {
    #[default]
    Idle,
    Configured,
    PendingStart,
    Started,
    Paused,
    PendingStop,
    Stopped,
    PendingRelease,
    Released,
    Error,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Configured => "configured",
            Self::PendingStart => "starting",
            Self::Started => "started",
            Self::Paused => "paused",
            Self::PendingStop => "stopping",
            Self::Stopped => "stopped",
            Self::PendingRelease => "releasing",
            Self::Released => "released",
            Self::Error => "in error",
        }
    }

    /// The hardware has been started and not yet stopped.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            Self::PendingStart | Self::Started | Self::Paused | Self::PendingStop
        )
    }

    pub fn is_released(self) -> bool {
        matches!(self, Self::PendingRelease | Self::Released)
    }

    /// Only a started session hands output to its listener.
    pub fn accepts_output(self) -> bool {
        self == Self::Started
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle operation requested by the caller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Configure,
    Start,
    Stop,
    Pause,
    Resume,
    Reset,
    Release,
}

impl Op {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configure => "configure",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Reset => "reset",
            Self::Release => "release",
        }
    }

    /// State a successful operation settles in.
    pub fn settled_state(self) -> SessionState {
        match self {
            Self::Configure | Self::Reset => SessionState::Configured,
            Self::Start | Self::Resume => SessionState::Started,
            Self::Stop => SessionState::Stopped,
            Self::Pause => SessionState::Paused,
            Self::Release => SessionState::Released,
        }
    }
}

/// Outcome of [`plan`].
#[derive(Clone, Debug, PartialEq)]
pub enum Transition {
    /// Perform the operation.
    Proceed,
    /// Already there (or the operation is meaningless here); succeed quietly.
    NoOp,
    /// Refuse with the given error.
    Reject(EncodeError),
}

fn illegal(op: Op, state: SessionState) -> Transition {
    Transition::Reject(EncodeError::IllegalState {
        op: op.as_str(),
        state: state.to_string(),
    })
}

/// Decide what `op` should do when the session is in `state`.
pub fn plan(state: SessionState, op: Op) -> Transition {
    use SessionState as S;

    if op == Op::Release {
        return if state.is_released() {
            Transition::NoOp
        } else {
            Transition::Proceed
        };
    }
    if state.is_released() {
        return Transition::Reject(EncodeError::Released);
    }

    match (op, state) {
        (Op::Configure, S::Idle | S::Error) => Transition::Proceed,
        (Op::Configure, _) => illegal(op, state),

        (Op::Start, S::Configured) => Transition::Proceed,
        (Op::Start, S::PendingStart | S::Started | S::Paused | S::Error) => Transition::NoOp,
        (Op::Start, _) => illegal(op, state),

        (Op::Stop, S::PendingStart | S::Started | S::Paused) => Transition::Proceed,
        (Op::Stop, _) => Transition::NoOp,

        (Op::Pause, S::Started) => Transition::Proceed,
        (Op::Pause, S::Paused) => Transition::NoOp,
        (Op::Pause, _) => illegal(op, state),

        (Op::Resume, S::Paused) => Transition::Proceed,
        (Op::Resume, S::Started) => Transition::NoOp,
        (Op::Resume, _) => illegal(op, state),

        (Op::Reset, S::Idle) => illegal(op, state),
        (Op::Reset, S::Configured) => Transition::NoOp,
        (Op::Reset, _) => Transition::Proceed,

        (Op::Release, _) => Transition::Proceed,
    }
}

/// How the session reacts to an asynchronous hardware fault.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultAction {
    /// Tell the listener, then try to reset back to `Configured`.
    NotifyAndReset,
    /// Stop best-effort, enter `Error`, tell the listener once.
    StopAndNotify,
    /// Already failing or shutting down; only log.
    LogOnly,
}

pub fn fault_action(state: SessionState) -> FaultAction {
    match state {
        SessionState::Configured => FaultAction::NotifyAndReset,
        s if s.is_running() => FaultAction::StopAndNotify,
        _ => FaultAction::LogOnly,
    }
}
