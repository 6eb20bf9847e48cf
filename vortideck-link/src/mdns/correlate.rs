//! PTR -> SRV -> A correlation for one discovery session.
//!
//! A session owns a single scratch context. Records for two instances that
//! interleave before either completes share that context and can mix fields
//! (one instance's port with the other's address). Records are expected in
//! PTR, SRV, A order; an A record seen before any SRV is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use shared::types::ServiceInfo;
use crate::mdns::records::{is_valid_ip_address, is_valid_port, MdnsRecord};

/// Callback invoked once per resolved service in async mode
pub type ServiceCallback = Box<dyn Fn(&ServiceInfo) + Send + Sync>;

/// Scratch state for the service currently being resolved
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ServiceParsingContext {
    pub service_name: String,
    pub hostname: String,
    pub port: u16,
    pub ip_address: String,
}

impl ServiceParsingContext {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_complete(&self) -> bool {
        !self.service_name.is_empty()
            && !self.hostname.is_empty()
            && self.port > 0
            && !self.ip_address.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Where resolved services go
pub enum DiscoverySink {
    Collect(Mutex<Vec<ServiceInfo>>),
    Notify(ServiceCallback),
}

/// Per-session configuration, result sink and scratch state
pub struct DiscoveryContext {
    tls_enabled: bool,
    should_stop: AtomicBool,
    sink: DiscoverySink,
    parsing: Mutex<ServiceParsingContext>,
}

impl DiscoveryContext {
    /// Synchronous mode: services are appended to a result list
    pub fn collecting(tls_enabled: bool) -> Self {
        Self::with_sink(DiscoverySink::Collect(Mutex::new(Vec::new())), tls_enabled)
    }

    /// Asynchronous mode: `callback` runs for every resolved service
    pub fn notifying(callback: ServiceCallback, tls_enabled: bool) -> Self {
        Self::with_sink(DiscoverySink::Notify(callback), tls_enabled)
    }

    fn with_sink(sink: DiscoverySink, tls_enabled: bool) -> Self {
        Self {
            tls_enabled,
            should_stop: AtomicBool::new(false),
            sink,
            parsing: Mutex::new(ServiceParsingContext::default()),
        }
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_enabled
    }

    pub fn request_stop(&self) {
        self.should_stop.store(true, Ordering::SeqCst);
    }

    pub fn should_stop(&self) -> bool {
        self.should_stop.load(Ordering::SeqCst)
    }

    pub fn is_collecting(&self) -> bool {
        matches!(self.sink, DiscoverySink::Collect(_))
    }

    pub fn has_services(&self) -> bool {
        match &self.sink {
            DiscoverySink::Collect(services) => {
                !services.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
            }
            DiscoverySink::Notify(_) => false,
        }
    }

    /// Drain the collected services; empty in async mode
    pub fn take_services(&self) -> Vec<ServiceInfo> {
        match &self.sink {
            DiscoverySink::Collect(services) => {
                std::mem::take(&mut *services.lock().unwrap_or_else(|e| e.into_inner()))
            }
            DiscoverySink::Notify(_) => Vec::new(),
        }
    }

    pub fn parsing_snapshot(&self) -> ServiceParsingContext {
        self.parsing.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn reset_parsing(&self) {
        self.parsing.lock().unwrap_or_else(|e| e.into_inner()).reset();
    }

    /// Feed one record into the state machine, emitting a service when the
    /// scratch context becomes complete.
    pub fn handle_record(&self, record: &MdnsRecord) {
        if self.should_stop() {
            return;
        }

        let completed = {
            let mut parsing = self.parsing.lock().unwrap_or_else(|e| e.into_inner());
            match record {
                MdnsRecord::Ptr { instance } => {
                    tracing::debug!("PTR {}", instance);
                    parsing.service_name = instance.clone();
                    None
                }
                MdnsRecord::Srv { target, port } => {
                    tracing::debug!("SRV {} port {}", target, port);
                    parsing.hostname = target.clone();
                    match u16::try_from(*port) {
                        Ok(port) if is_valid_port(port.into()) => parsing.port = port,
                        _ => tracing::warn!("Ignoring invalid SRV port {} for {}", port, target),
                    }
                    None
                }
                MdnsRecord::A { owner, address } => {
                    if parsing.hostname.is_empty() || !owner.contains(parsing.hostname.as_str()) {
                        None
                    } else if !is_valid_ip_address(address) {
                        tracing::warn!("Invalid IP address format: {}", address);
                        None
                    } else {
                        parsing.ip_address = address.clone();
                        if parsing.is_complete() {
                            let service = ServiceInfo::new(
                                parsing.service_name.clone(),
                                parsing.ip_address.clone(),
                                parsing.port,
                                self.tls_enabled,
                            );
                            parsing.reset();
                            Some(service)
                        } else {
                            None
                        }
                    }
                }
            }
        };

        if let Some(service) = completed {
            self.emit(service);
        }
    }

    fn emit(&self, service: ServiceInfo) {
        tracing::info!("Discovered VortiDeck service {} at {}", service.name, service.websocket_url);
        match &self.sink {
            DiscoverySink::Collect(services) => {
                services.lock().unwrap_or_else(|e| e.into_inner()).push(service);
            }
            DiscoverySink::Notify(callback) => {
                if !self.should_stop() {
                    callback(&service);
                }
            }
        }
    }
}
