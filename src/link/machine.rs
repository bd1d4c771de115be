//! Connection lifecycle state machine
//! States: Disconnected, Connecting, Connected, Reconnecting, ShuttingDown

use embassy_time::Instant;
use log::debug;
use serde::Serialize;
use statig::prelude::*;

/// Externally visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// A reconnect is scheduled but has not started yet.
    Reconnecting,
    /// Terminal.
    ShuttingDown,
}

// Inputs to the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum LinkInput {
    ConnectStarted,
    ConnectSucceeded { at: Instant },
    ConnectFailed,
    /// Attempt dropped before it produced a result (cancelled, device not resolvable).
    ConnectAborted,
    ReconnectScheduled,
    TransportDisconnected,
    Shutdown,
}

/// Counters kept across the whole session.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinkStats {
    pub attempts: u32,
    pub total_disconnections: u32,
    pub last_success: Option<Instant>,
    pub connected_since: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct LinkMachine;

#[state_machine(
    initial = "State::disconnected()",
    state(derive(Debug)),
    on_transition = "Self::on_transition"
)]
impl LinkMachine {
    #[state]
    fn disconnected(context: &mut LinkStats, event: &LinkInput) -> Response<State> {
        use Response::*;

        match event {
            LinkInput::ConnectStarted => {
                context.attempts += 1;
                Transition(State::connecting())
            }
            LinkInput::ReconnectScheduled => Transition(State::reconnecting()),
            LinkInput::TransportDisconnected => {
                context.total_disconnections += 1;
                Handled
            }
            LinkInput::Shutdown => Transition(State::shutting_down()),
            _ => Handled,
        }
    }

    #[state]
    fn reconnecting(context: &mut LinkStats, event: &LinkInput) -> Response<State> {
        use Response::*;

        match event {
            LinkInput::ConnectStarted => {
                context.attempts += 1;
                Transition(State::connecting())
            }
            LinkInput::ConnectAborted | LinkInput::ConnectFailed => {
                Transition(State::disconnected())
            }
            LinkInput::TransportDisconnected => {
                context.total_disconnections += 1;
                Transition(State::disconnected())
            }
            LinkInput::Shutdown => Transition(State::shutting_down()),
            _ => Handled,
        }
    }

    #[state]
    fn connecting(context: &mut LinkStats, event: &LinkInput) -> Response<State> {
        use Response::*;

        match event {
            LinkInput::ConnectSucceeded { at } => {
                context.last_success = Some(*at);
                context.connected_since = Some(*at);
                Transition(State::connected())
            }
            LinkInput::ConnectFailed | LinkInput::ConnectAborted => {
                Transition(State::disconnected())
            }
            // a stale callback from an earlier link; the attempt in flight decides
            LinkInput::TransportDisconnected => {
                context.total_disconnections += 1;
                Handled
            }
            LinkInput::Shutdown => Transition(State::shutting_down()),
            _ => Handled,
        }
    }

    #[state]
    fn connected(context: &mut LinkStats, event: &LinkInput) -> Response<State> {
        use Response::*;

        match event {
            LinkInput::TransportDisconnected => {
                context.total_disconnections += 1;
                context.connected_since = None;
                Transition(State::disconnected())
            }
            LinkInput::Shutdown => {
                context.connected_since = None;
                Transition(State::shutting_down())
            }
            _ => Handled,
        }
    }

    #[state]
    fn shutting_down(event: &LinkInput) -> Response<State> {
        let _ = event;
        Response::Handled
    }
}

impl LinkMachine {
    fn on_transition(&mut self, source: &State, target: &State) {
        let source_state = Self::connection_state(source);
        let target_state = Self::connection_state(target);

        if source_state != target_state {
            debug!("🔄 Link state transition: {:?} -> {:?}", source_state, target_state);
        }
    }

    fn connection_state(state: &State) -> ConnectionState {
        match state {
            State::Disconnected {} => ConnectionState::Disconnected,
            State::Reconnecting {} => ConnectionState::Reconnecting,
            State::Connecting {} => ConnectionState::Connecting,
            State::Connected {} => ConnectionState::Connected,
            State::ShuttingDown {} => ConnectionState::ShuttingDown,
        }
    }
}

/// Machine plus the counters it maintains.
pub struct LinkStateMachine {
    machine: statig::prelude::StateMachine<LinkMachine>,
    stats: LinkStats,
}

impl Default for LinkStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkStateMachine {
    pub fn new() -> Self {
        Self {
            machine: LinkMachine::default().state_machine(),
            stats: LinkStats::default(),
        }
    }

    /// Feeds one input and returns the resulting state.
    pub fn handle(&mut self, input: LinkInput) -> ConnectionState {
        self.machine.handle_with_context(&input, &mut self.stats);
        self.state()
    }

    pub fn state(&self) -> ConnectionState {
        LinkMachine::connection_state(self.machine.state())
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }
}

impl std::fmt::Debug for LinkStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("LinkStateMachine")
            .field("state", &self.state())
            .field("stats", &self.stats)
            .finish()
    }
}
