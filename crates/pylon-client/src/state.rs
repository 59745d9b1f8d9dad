use std::time::Duration;

use crate::backoff::Backoff;

/// Finite connection states. `suspended` is entered while the page (or
/// embedding application) is hidden; no transport exists in that state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Suspended,
}

/// Inputs to the state machine, produced by the driver.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Transport established and subscription handshake completed.
    TransportOpen,
    /// Connect attempt failed before a session existed.
    TransportFailed,
    /// An established session ended abnormally.
    TransportClosed,
    /// One message delivered; `id` advances the client-owned watermark.
    Delivered { id: u64 },
    /// Page hidden — tear everything down, keep nothing in flight.
    Hidden,
    /// Page shown — reconnect after a short debounce.
    Shown,
    /// The reconnect backoff timer fired.
    RetryDue,
    /// The resume debounce timer fired.
    ResumeDue,
}

/// Outputs the driver must execute. At most one timer is ever pending:
/// every Schedule* replaces the previous timer, and CancelTimer clears it,
/// so duplicate concurrent connection attempts are impossible by shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    /// Open a transport and subscribe: `start-msg{start}` then
    /// `set-filter{filter}` — both before the session counts as subscribed.
    OpenTransport { start: u64, filter: Vec<String> },
    /// Dispose the session or in-flight connection attempt.
    CloseTransport,
    /// Re-issue `set-filter` on the live session.
    SendFilter { filter: Vec<String> },
    ScheduleRetry(Duration),
    ScheduleResume(Duration),
    CancelTimer,
}

/// Pure reconnect state machine. Owns the client-side `last_msg` watermark —
/// updated only from received message ids, never shared with the broker's
/// per-connection watermark.
#[derive(Debug)]
pub struct ClientCore {
    state: ClientState,
    last_msg: u64,
    channels: Vec<String>,
    backoff: Backoff,
    resume_debounce: Duration,
}

impl ClientCore {
    pub fn new(channels: Vec<String>, backoff: Backoff, resume_debounce: Duration) -> Self {
        Self {
            state: ClientState::Disconnected,
            last_msg: 0,
            channels,
            backoff,
            resume_debounce,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn last_msg(&self) -> u64 {
        self.last_msg
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// Begin connecting. Call once after construction.
    pub fn start(&mut self) -> Vec<ClientAction> {
        self.state = ClientState::Connecting;
        vec![self.open_action()]
    }

    /// Replace the channel interest set. A live session re-subscribes
    /// immediately; otherwise the new set is used on the next connect.
    pub fn set_channels(&mut self, channels: Vec<String>) -> Vec<ClientAction> {
        self.channels = channels.clone();
        match self.state {
            ClientState::Connected => vec![ClientAction::SendFilter { filter: channels }],
            _ => Vec::new(),
        }
    }

    pub fn handle(&mut self, event: ClientEvent) -> Vec<ClientAction> {
        use ClientEvent::*;
        use ClientState::*;

        match (self.state, event) {
            (Connecting, TransportOpen) => {
                self.state = Connected;
                self.backoff.reset();
                Vec::new()
            }
            (Connecting, TransportFailed) | (Connecting, TransportClosed) => {
                self.state = Disconnected;
                vec![ClientAction::ScheduleRetry(self.backoff.next_delay())]
            }
            (Connected, TransportClosed) | (Connected, TransportFailed) => {
                self.state = Disconnected;
                vec![ClientAction::ScheduleRetry(self.backoff.next_delay())]
            }
            (Connected, Delivered { id }) => {
                self.last_msg = self.last_msg.max(id);
                Vec::new()
            }
            (Disconnected, RetryDue) => {
                self.state = Connecting;
                vec![self.open_action()]
            }
            (Suspended, ResumeDue) => {
                self.state = Connecting;
                vec![self.open_action()]
            }
            (Suspended, Shown) => {
                // debounce before reconnecting; replaces any pending timer
                vec![ClientAction::ScheduleResume(self.resume_debounce)]
            }
            (Suspended, Hidden) => {
                // hidden again before the debounce fired
                vec![ClientAction::CancelTimer]
            }
            (Connecting, Hidden) | (Connected, Hidden) => {
                self.state = Suspended;
                vec![ClientAction::CancelTimer, ClientAction::CloseTransport]
            }
            (Disconnected, Hidden) => {
                self.state = Suspended;
                vec![ClientAction::CancelTimer]
            }
            // late transport events after teardown, spurious timers, Shown
            // while visible: all ignored
            _ => Vec::new(),
        }
    }

    fn open_action(&self) -> ClientAction {
        ClientAction::OpenTransport {
            start: self.last_msg,
            filter: self.channels.clone(),
        }
    }
}
