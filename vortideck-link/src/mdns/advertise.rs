use std::collections::HashMap;
use mdns_sd::{ServiceDaemon, ServiceInfo};
use anyhow::{Context, Result};
use shared::protocol::{SERVICE_TYPE, WS_PATH};
use crate::config::AdvertiseConfig;

/// TXT key carrying the WebSocket path
pub const TXT_PATH: &str = "path";

fn instance_label(config: &AdvertiseConfig, hostname: &str) -> String {
    config
        .instance
        .clone()
        .unwrap_or_else(|| format!("vortideck-{}", hostname))
}

/// Advertise a companion endpoint, for standing in as the desktop app on a LAN
pub fn register_service(daemon: &ServiceDaemon, config: &AdvertiseConfig) -> Result<ServiceInfo> {
    let hostname = hostname::get()
        .context("Failed to get system hostname")?
        .to_string_lossy()
        .to_string();

    let instance_name = instance_label(config, &hostname);
    let host_fqdn = format!("{}.local.", hostname);

    let txt_records = HashMap::from([(TXT_PATH.to_string(), WS_PATH.to_string())]);

    let service_info = ServiceInfo::new(
        SERVICE_TYPE,
        &instance_name,
        &host_fqdn,
        config.address.as_str(),
        config.port,
        txt_records,
    )
    .context("Failed to create ServiceInfo")?;

    daemon
        .register(service_info.clone())
        .context("Failed to register mDNS service")?;

    tracing::info!(
        "Registered {} as {} on {}:{}",
        SERVICE_TYPE,
        instance_name,
        config.address,
        config.port
    );

    Ok(service_info)
}

pub fn unregister_service(daemon: &ServiceDaemon, service_info: &ServiceInfo) -> Result<()> {
    daemon
        .unregister(service_info.get_fullname())
        .context("Failed to unregister mDNS service")?;

    tracing::info!("Unregistered {}", service_info.get_fullname());
    Ok(())
}
