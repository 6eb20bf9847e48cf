use std::net::IpAddr;
use std::time::{Duration, Instant};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use anyhow::{Context, Result};
use crate::mdns::records::MdnsRecord;
use crate::mdns::source::{RecordSource, RecordStream, MAX_BATCH_WAIT};

/// Record source backed by the `mdns-sd` daemon. Resolved services are
/// flattened back into PTR/SRV/A records so they run through the same
/// correlation as any other source.
pub struct MdnsSdSource {
    daemon: ServiceDaemon,
}

impl MdnsSdSource {
    /// Bring up the multicast socket, optionally restricted to one interface
    pub fn new(interface: Option<&str>) -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .context("Failed to create mDNS daemon")?;

        if let Some(interface) = interface {
            daemon
                .disable_interface(mdns_sd::IfKind::All)
                .context("Failed to disable default interfaces")?;
            daemon
                .enable_interface(interface)
                .with_context(|| format!("Failed to enable interface {}", interface))?;
        }

        Ok(Self { daemon })
    }

    pub fn daemon(&self) -> &ServiceDaemon {
        &self.daemon
    }
}

impl Drop for MdnsSdSource {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.shutdown() {
            tracing::debug!("mDNS daemon shutdown: {}", e);
        }
    }
}

impl RecordSource for MdnsSdSource {
    fn open(&self, service_type: &str) -> Result<Box<dyn RecordStream>> {
        tracing::info!("Executing mDNS query for: {}", service_type);
        let receiver = self
            .daemon
            .browse(service_type)
            .with_context(|| format!("Failed to browse {}", service_type))?;

        Ok(Box::new(BrowseStream {
            daemon: self.daemon.clone(),
            service_type: service_type.to_string(),
            receiver,
        }))
    }
}

struct BrowseStream {
    daemon: ServiceDaemon,
    service_type: String,
    receiver: flume::Receiver<ServiceEvent>,
}

impl RecordStream for BrowseStream {
    fn next_batch(&mut self, wait: Duration) -> Vec<MdnsRecord> {
        let deadline = Instant::now() + wait.min(MAX_BATCH_WAIT);
        let mut records = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receiver.recv_timeout(remaining) {
                Ok(ServiceEvent::ServiceResolved(info)) => {
                    records.extend(resolved_to_records(
                        info.get_fullname(),
                        info.get_hostname(),
                        info.get_port(),
                        info.get_addresses().iter().copied(),
                    ));
                }
                Ok(ServiceEvent::ServiceRemoved(_typ, fullname)) => {
                    tracing::debug!("Service removed: {}", fullname);
                }
                Ok(_) => {}
                Err(flume::RecvTimeoutError::Timeout) => break,
                Err(flume::RecvTimeoutError::Disconnected) => {
                    tracing::warn!("mDNS browse channel for {} closed", self.service_type);
                    std::thread::sleep(remaining);
                    break;
                }
            }
            if self.receiver.is_empty() {
                break;
            }
        }

        records
    }
}

impl Drop for BrowseStream {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.stop_browse(&self.service_type) {
            tracing::debug!("Failed to stop browsing {}: {}", self.service_type, e);
        }
    }
}

/// One resolved instance as PTR, SRV and one A record per IPv4 address.
fn resolved_to_records(
    fullname: &str,
    hostname: &str,
    port: u16,
    addresses: impl Iterator<Item = IpAddr>,
) -> Vec<MdnsRecord> {
    let mut records = vec![
        MdnsRecord::Ptr { instance: fullname.to_string() },
        MdnsRecord::Srv { target: hostname.to_string(), port: port.into() },
    ];

    for addr in addresses {
        match addr {
            IpAddr::V4(v4) => records.push(MdnsRecord::A {
                owner: hostname.to_string(),
                address: v4.to_string(),
            }),
            IpAddr::V6(v6) => tracing::debug!("Skipping IPv6 address {} for {}", v6, fullname),
        }
    }

    records
}
