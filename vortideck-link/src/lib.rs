pub mod config;
pub mod connection;
pub mod mdns;

pub use config::Config;
pub use connection::{ConnectionManager, ConnectionObserver, ConnectionStatus, LinkState, StatusReporter};
pub use mdns::resolver::{get_first_vortideck_service, is_vortideck_service_available, ServiceResolver};
pub use shared::types::ServiceInfo;
