use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Lifecycle of the control channel. `ShuttingDown` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Open,
    Closed,
    Failed,
    ShuttingDown,
}

/// Session fields guarded by the manager's single lock
#[derive(Debug)]
pub struct ConnectionState {
    state: LinkState,
    pub current_message_id: u64,
    pub url: Option<String>,
    pub connected_since: Option<DateTime<Utc>>,
    /// Frames queued here are written by the network thread
    pub outbound: Option<mpsc::UnboundedSender<Message>>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            state: LinkState::Disconnected,
            current_message_id: 1,
            url: None,
            connected_since: None,
            outbound: None,
        }
    }
}

impl ConnectionState {
    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == LinkState::Open
    }

    /// Returns false when the transition is refused because shutdown began.
    pub fn transition(&mut self, next: LinkState) -> bool {
        if self.state == LinkState::ShuttingDown {
            return self.state == next;
        }
        if self.state != next {
            tracing::debug!("Link state {:?} -> {:?}", self.state, next);
        }
        self.state = next;
        true
    }

    /// Drop everything tied to the current session
    pub fn clear_session(&mut self) {
        self.current_message_id = 1;
        self.url = None;
        self.connected_since = None;
        self.outbound = None;
    }

    pub fn mark_open(&mut self, url: &str, outbound: mpsc::UnboundedSender<Message>) -> bool {
        if !self.transition(LinkState::Open) {
            return false;
        }
        self.current_message_id = 1;
        self.url = Some(url.to_string());
        self.connected_since = Some(Utc::now());
        self.outbound = Some(outbound);
        true
    }

    /// Close or failure of the current session. Returns whether it was open.
    pub fn mark_closed(&mut self, failed: bool) -> bool {
        let was_open = self.is_open();
        let next = if failed { LinkState::Failed } else { LinkState::Closed };
        self.transition(next);
        self.clear_session();
        was_open
    }

    /// Take the next outbound message id
    pub fn next_message_id(&mut self) -> u64 {
        let id = self.current_message_id;
        self.current_message_id += 1;
        id
    }
}

/// Point-in-time view of the connection for callers and the probe
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub state: LinkState,
    pub connected: bool,
    pub url: Option<String>,
    pub connected_since: Option<DateTime<Utc>>,
    pub current_message_id: u64,
    pub connection_failure_count: u32,
    pub sticky_target: bool,
}
