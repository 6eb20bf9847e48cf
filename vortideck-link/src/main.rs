use std::sync::Arc;
use std::time::{Duration, Instant};
use anyhow::{Context, Result};
use serde_json::{json, Value};
use vortideck_link::config::Config;
use vortideck_link::mdns::advertise;
use vortideck_link::mdns::browser::MdnsSdSource;
use vortideck_link::{
    get_first_vortideck_service, is_vortideck_service_available, ConnectionManager, ConnectionObserver,
    ServiceResolver, StatusReporter,
};

const DEFAULT_CONFIG_PATH: &str = "vortideck.toml";

/// Logs every connection event
struct LogObserver;

impl ConnectionObserver for LogObserver {
    fn on_open(&self, url: &str) {
        tracing::info!("Link open: {}", url);
    }

    fn on_close(&self) {
        tracing::info!("Link closed");
    }

    fn on_message(&self, text: &str) {
        tracing::info!("Message: {}", text);
    }
}

/// Reports how long the probe has been running
struct UptimeReporter {
    started: Instant,
}

impl StatusReporter for UptimeReporter {
    fn status_payload(&self) -> Value {
        json!({
            "client": "vortideck-probe",
            "uptimeSecs": self.started.elapsed().as_secs(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("vortideck_link=info,vortideck_probe=info"))
        )
        .init();

    // vortideck-probe [connect|advertise] [config]
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let mode = match args.first().map(String::as_str) {
        Some("connect") | Some("advertise") => args.remove(0),
        _ => "discover".to_string(),
    };
    let config_path = args.into_iter().next().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Starting vortideck-probe in {} mode", mode);

    match mode.as_str() {
        "connect" => connect(config).await,
        "advertise" => advertise(config).await,
        _ => discover(config).await,
    }
}

async fn discover(config: Config) -> Result<()> {
    let resolver = Arc::new(ServiceResolver::new(&config.discovery)?);
    let tls = config.discovery.tls;

    // Blocking scan, stops at the first hit
    let scan = resolver.clone();
    let found = tokio::task::spawn_blocking(move || scan.discover_services(Duration::from_secs(10), tls))
        .await
        .context("Discovery task failed")?;
    if let Some(service) = found.first() {
        tracing::info!("Found {} at {}", service.name, service.websocket_url);
    } else {
        tracing::info!("No service found within 10s, listening for {:?}", config.discovery.timeout());

        // Background session, reports every hit until timeout or ctrl-c
        let started = resolver.discover_services_async(
            |service| {
                tracing::info!(
                    "Discovered {} at {} ({}:{})",
                    service.name,
                    service.websocket_url,
                    service.ip_address,
                    service.port
                );
            },
            config.discovery.timeout(),
            tls,
        );
        if !started {
            anyhow::bail!("Failed to start background discovery");
        }

        tokio::select! {
            _ = tokio::time::sleep(config.discovery.timeout()) => {}
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for ctrl-c")?;
                tracing::info!("Shutdown signal received");
            }
        }
    }

    let stopper = resolver.clone();
    tokio::task::spawn_blocking(move || stopper.stop_discovery())
        .await
        .context("Failed to stop discovery")?;
    drop(resolver);

    let (first, available) = tokio::task::spawn_blocking(move || {
        let first = get_first_vortideck_service(Duration::from_secs(5), tls);
        let available = is_vortideck_service_available(Duration::from_secs(5));
        (first, available)
    })
    .await
    .context("Discovery task failed")?;

    if first.is_empty() {
        tracing::info!("First service: none");
    } else {
        tracing::info!("First service: {}", first.websocket_url);
    }
    tracing::info!("Service available: {}", available);
    Ok(())
}

async fn connect(config: Config) -> Result<()> {
    let manager = Arc::new(ConnectionManager::create(&config));
    manager.set_observer(Arc::new(LogObserver));
    manager.set_status_reporter(Arc::new(UptimeReporter { started: Instant::now() }));

    let worker = manager.clone();
    let connect_handle = tokio::task::spawn_blocking(move || worker.reconnect());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");
    tracing::info!("Final status: {}", serde_json::to_string(&manager.status())?);

    let stopper = manager.clone();
    tokio::task::spawn_blocking(move || stopper.shutdown())
        .await
        .context("Failed to shut down connection manager")?;

    let connected = connect_handle.await.context("Connect task failed")?;
    tracing::info!("Shutdown complete (was connected: {})", connected);
    Ok(())
}

async fn advertise(config: Config) -> Result<()> {
    let advertise_config = config
        .advertise
        .context("advertise mode needs an [advertise] section")?;

    let source = MdnsSdSource::new(config.discovery.interface.as_deref())?;
    let service_info = advertise::register_service(source.daemon(), &advertise_config)?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    if let Err(e) = advertise::unregister_service(source.daemon(), &service_info) {
        tracing::error!("Failed to unregister mDNS service: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
