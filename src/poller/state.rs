//! Catalog session state machine.
//!
//! ```text
//!                Start / ReconnectDue
//! Disconnected ───────────────────────► Connecting ──Connected──► Connected
//!      ▲  ▲                                                          │ LogOnSent
//!      │  └──── LoggedOff ◄── LoggedOff / LogOnFailed ─┐             ▼
//!      │              │  ReconnectDue                  └──── Authenticating
//!      │              └──────────────► Connecting                    │ LoggedOn
//!      └──── Disconnected / FatalError (from any live state) ◄── LoggedOn
//! ```
//!
//! [`transition`] is pure; the poller executes the returned actions.

use std::fmt;

/// Where the catalog session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    LoggedOn,
    LoggedOff,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Something that happened to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionInput {
    Start,
    Connected,
    LogOnSent,
    LoggedOn,
    LoggedOff,
    LogOnFailed,
    Disconnected,
    FatalError,
    ReconnectDue,
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    Connect,
    LogOn,
    StartPolling,
    StopPolling,
    ScheduleReconnect,
}

/// Compute the next state and the actions to run.
///
/// Inputs that make no sense in the current state leave it unchanged and
/// produce no actions.
pub fn transition(state: SessionState, input: SessionInput) -> (SessionState, Vec<SessionAction>) {
    use SessionAction as A;
    use SessionInput as I;
    use SessionState as S;

    match (state, input) {
        (S::Disconnected | S::LoggedOff, I::Start | I::ReconnectDue) => (S::Connecting, vec![A::Connect]),

        (S::Connecting, I::Connected) => (S::Connected, vec![A::LogOn]),
        (S::Connected, I::LogOnSent) => (S::Authenticating, vec![]),
        (S::Connected | S::Authenticating, I::LoggedOn) => (S::LoggedOn, vec![A::StartPolling]),

        (S::Connected | S::Authenticating | S::LoggedOn, I::LoggedOff | I::LogOnFailed) => {
            (S::LoggedOff, vec![A::StopPolling, A::ScheduleReconnect])
        }

        (S::Connecting | S::Connected | S::Authenticating | S::LoggedOn, I::Disconnected | I::FatalError) => {
            (S::Disconnected, vec![A::StopPolling, A::ScheduleReconnect])
        }

        // Session dropped while waiting to reconnect: the reconnect is already scheduled
        (S::LoggedOff, I::Disconnected | I::FatalError) => (S::Disconnected, vec![]),

        (state, _) => (state, vec![]),
    }
}
