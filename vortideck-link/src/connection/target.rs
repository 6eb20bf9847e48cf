use shared::types::ServiceInfo;
use crate::mdns::records::{is_valid_ip_address, is_valid_port};

/// Where a resolved connection URL came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetSource {
    Selected,
    LastConnected,
    Discovered,
    Fallback,
}

/// Candidate endpoints for the connection manager, fed by discovery and by
/// explicit selection.
#[derive(Debug)]
pub struct TargetRegistry {
    fallback_url: String,
    selected: Option<ServiceInfo>,
    sticky: bool,
    last_connected: Option<ServiceInfo>,
    /// One entry per instance name, most recently seen last
    discovered: Vec<ServiceInfo>,
}

pub fn is_usable(service: &ServiceInfo) -> bool {
    !service.is_empty() && is_valid_ip_address(&service.ip_address) && is_valid_port(service.port.into())
}

impl TargetRegistry {
    pub fn new(fallback_url: impl Into<String>) -> Self {
        Self {
            fallback_url: fallback_url.into(),
            selected: None,
            sticky: false,
            last_connected: None,
            discovered: Vec::new(),
        }
    }

    /// Pin a target; it wins over everything else until stickiness is dropped
    pub fn select(&mut self, service: ServiceInfo) {
        tracing::info!("Selected target {} ({})", service.name, service.websocket_url);
        self.selected = Some(service);
        self.sticky = true;
    }

    pub fn is_sticky(&self) -> bool {
        self.sticky
    }

    pub fn clear_sticky(&mut self) {
        if self.sticky {
            tracing::info!("Dropping sticky target, a new one may be selected");
        }
        self.sticky = false;
    }

    /// Remember a discovered service. Returns true if it is new or changed.
    pub fn record_discovered(&mut self, service: ServiceInfo) -> bool {
        if !is_usable(&service) {
            return false;
        }

        let changed = match self.discovered.iter().position(|s| s.name == service.name) {
            Some(idx) => self.discovered.remove(idx) != service,
            None => true,
        };

        if let Some(last) = &mut self.last_connected {
            if last.name == service.name && *last != service {
                tracing::info!("Last connected service {} moved to {}", last.name, service.websocket_url);
                *last = service.clone();
            }
        }

        self.discovered.push(service);
        changed
    }

    pub fn discovered(&self) -> Vec<ServiceInfo> {
        self.discovered.clone()
    }

    pub fn has_discovered(&self) -> bool {
        !self.discovered.is_empty()
    }

    pub fn has_last_connected(&self) -> bool {
        self.last_connected.as_ref().is_some_and(is_usable)
    }

    /// Note a successful handshake with `url`
    pub fn record_connected(&mut self, url: &str) {
        let known = self
            .selected
            .iter()
            .chain(self.discovered.iter().rev())
            .find(|s| s.websocket_url == url)
            .cloned();
        if let Some(service) = known {
            self.last_connected = Some(service);
        }
    }

    pub fn forget_last_connected(&mut self) {
        self.last_connected = None;
    }

    /// Sticky selection, then the last good service, then the newest
    /// discovery, then the static fallback.
    pub fn resolve(&self) -> (String, TargetSource) {
        if self.sticky {
            if let Some(selected) = self.selected.as_ref().filter(|s| !s.is_empty()) {
                return (selected.websocket_url.clone(), TargetSource::Selected);
            }
        }
        if let Some(last) = self.last_connected.as_ref().filter(|s| is_usable(s)) {
            return (last.websocket_url.clone(), TargetSource::LastConnected);
        }
        if let Some(latest) = self.discovered.last() {
            return (latest.websocket_url.clone(), TargetSource::Discovered);
        }
        (self.fallback_url.clone(), TargetSource::Fallback)
    }
}
