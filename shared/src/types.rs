use serde::{Deserialize, Serialize};
use crate::protocol::{WSS_SCHEME, WS_PATH, WS_SCHEME};

/// A VortiDeck companion endpoint found on the network.
/// Built once a PTR/SRV/A record set has been correlated; never mutated after.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Instance name from the PTR record, e.g. "studio._vortideck._tcp.local."
    pub name: String,

    /// WebSocket URL derived from address, port and the session TLS flag
    pub websocket_url: String,

    /// IPv4 address from the A record
    pub ip_address: String,

    /// TCP port from the SRV record
    pub port: u16,
}

impl ServiceInfo {
    pub fn new(name: impl Into<String>, ip_address: impl Into<String>, port: u16, tls_enabled: bool) -> Self {
        let ip_address = ip_address.into();
        let websocket_url = websocket_url(&ip_address, port, tls_enabled);
        Self {
            name: name.into(),
            websocket_url,
            ip_address,
            port,
        }
    }

    /// The default value stands for "no service found".
    pub fn is_empty(&self) -> bool {
        self.websocket_url.is_empty()
    }
}

/// Builds `ws://ip:port/ws` or `wss://ip:port/ws`.
pub fn websocket_url(ip_address: &str, port: u16, tls_enabled: bool) -> String {
    let scheme = if tls_enabled { WSS_SCHEME } else { WS_SCHEME };
    format!("{}://{}:{}{}", scheme, ip_address, port, WS_PATH)
}
