/// mDNS service type advertised by the VortiDeck companion app
pub const SERVICE_TYPE: &str = "_vortideck._tcp.local.";

/// Path of the control-channel WebSocket on the companion app
pub const WS_PATH: &str = "/ws";

/// URL schemes for plain and TLS WebSocket endpoints
pub const WS_SCHEME: &str = "ws";
pub const WSS_SCHEME: &str = "wss";

/// Endpoint used when nothing has been discovered or selected
pub const DEFAULT_FALLBACK_URL: &str = "ws://127.0.0.1:9001/ws";

/// Key stamped into every outbound message for request correlation
pub const MESSAGE_ID_KEY: &str = "msgId";

/// Path of the periodic status update message
pub const STATUS_PATH: &str = "/api/v1/integration/obs/status";
