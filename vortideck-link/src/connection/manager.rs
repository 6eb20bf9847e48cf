use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use shared::protocol::MESSAGE_ID_KEY;
use shared::types::ServiceInfo;
use crate::config::{Config, ConnectionConfig};
use crate::connection::network::NetworkThread;
use crate::connection::state::{ConnectionState, ConnectionStatus, LinkState};
use crate::connection::status_loop::StatusLoop;
use crate::connection::target::{TargetRegistry, TargetSource};
use crate::connection::{sleep_interruptible, ConnectionObserver, StatusReporter, WAIT_SLICE};
use crate::mdns::resolver::ServiceResolver;

/// State shared between the manager, the network thread and the status loop
pub(crate) struct Shared {
    pub(crate) config: ConnectionConfig,
    state: Mutex<ConnectionState>,
    /// Signalled whenever the open flag changes or shutdown begins
    state_changed: Condvar,
    shutting_down: AtomicBool,
    connection_failure_count: AtomicU32,
    targets: Arc<Mutex<TargetRegistry>>,
    observer: Mutex<Option<Arc<dyn ConnectionObserver>>>,
}

impl Shared {
    pub(crate) fn new(config: ConnectionConfig) -> Self {
        let targets = TargetRegistry::new(config.fallback_url.clone());
        Self {
            config,
            state: Mutex::new(ConnectionState::default()),
            state_changed: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            connection_failure_count: AtomicU32::new(0),
            targets: Arc::new(Mutex::new(targets)),
            observer: Mutex::new(None),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_targets(&self) -> MutexGuard<'_, TargetRegistry> {
        self.targets.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn observer(&self) -> Option<Arc<dyn ConnectionObserver>> {
        self.observer.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn shutdown_flag(&self) -> &AtomicBool {
        &self.shutting_down
    }

    pub(crate) fn is_open(&self) -> bool {
        self.lock_state().is_open()
    }

    pub(crate) fn resolve_target(&self) -> (String, TargetSource) {
        self.lock_targets().resolve()
    }

    pub(crate) fn set_state(&self, next: LinkState) {
        self.lock_state().transition(next);
        self.state_changed.notify_all();
    }

    /// Handshake completed. Returns false if shutdown raced the open.
    pub(crate) fn handle_open(&self, url: &str, outbound: mpsc::UnboundedSender<Message>) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        let opened = self.lock_state().mark_open(url, outbound);
        self.state_changed.notify_all();
        if !opened {
            return false;
        }

        tracing::info!("WebSocket connection opened to {}", url);
        self.connection_failure_count.store(0, Ordering::SeqCst);
        self.lock_targets().record_connected(url);
        if let Some(observer) = self.observer() {
            observer.on_open(url);
        }
        true
    }

    /// Session ended. Session ids are invalidated; reconnection is left to
    /// the network loop.
    pub(crate) fn handle_close(&self, failed: bool) {
        let was_open = {
            let mut state = self.lock_state();
            if state.is_open() {
                state.mark_closed(failed)
            } else {
                state.clear_session();
                false
            }
        };
        self.state_changed.notify_all();

        if was_open && !self.is_shutting_down() {
            tracing::info!("Connection lost - reconnection will be attempted by main loop");
            if let Some(observer) = self.observer() {
                observer.on_close();
            }
        }
    }

    pub(crate) fn handle_message(&self, text: &str) {
        tracing::debug!("Received payload: {}", text);
        if let Some(observer) = self.observer() {
            observer.on_message(text);
        }
    }

    /// Count a failure to build a connection. At the threshold the sticky
    /// target is dropped and the count starts over.
    pub(crate) fn record_creation_failure(&self) -> u32 {
        let failures = self.connection_failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.config.failure_threshold {
            tracing::warn!("{} consecutive connection failures, releasing target selection", failures);
            self.lock_targets().clear_sticky();
            self.connection_failure_count.store(0, Ordering::SeqCst);
            return 0;
        }
        failures
    }

    /// Stamp `msgId` and queue the frame. False when not open.
    pub(crate) fn send_message(&self, mut message: Value) -> bool {
        let mut state = self.lock_state();
        if !state.is_open() {
            return false;
        }
        let Some(outbound) = state.outbound.clone() else {
            return false;
        };
        let Some(object) = message.as_object_mut() else {
            tracing::warn!("Refusing to send non-object message");
            return false;
        };

        let id = state.next_message_id();
        object.insert(MESSAGE_ID_KEY.to_string(), Value::String(id.to_string()));
        outbound.send(Message::Text(message.to_string())).is_ok()
    }

    /// Wait for the open flag, in short slices so shutdown is seen promptly
    fn wait_for_open(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock_state();
        loop {
            if state.is_open() {
                return true;
            }
            if self.is_shutting_down() {
                return false;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    WAIT_SLICE.min(deadline - now)
                }
                None => WAIT_SLICE,
            };
            state = self
                .state_changed
                .wait_timeout(state, slice)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }
}

/// Owns the control channel to one VortiDeck companion: picks the target,
/// runs the network thread, and reconnects until shut down.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    resolver: Option<Arc<ServiceResolver>>,
    discovery_tls: bool,
    network: Mutex<Option<NetworkThread>>,
    status_loop: Mutex<Option<StatusLoop>>,
    reporter: Mutex<Option<Arc<dyn StatusReporter>>>,
}

impl ConnectionManager {
    /// Manager with its own mDNS resolver. Without multicast it still runs,
    /// using selected or fallback targets only.
    pub fn create(config: &Config) -> Self {
        let resolver = match ServiceResolver::new(&config.discovery) {
            Ok(resolver) => Some(Arc::new(resolver)),
            Err(e) => {
                tracing::error!("mDNS discovery disabled: {:#}", e);
                None
            }
        };
        Self::with_resolver(config.connection.clone(), resolver, config.discovery.tls)
    }

    pub fn with_resolver(
        config: ConnectionConfig,
        resolver: Option<Arc<ServiceResolver>>,
        discovery_tls: bool,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::new(config)),
            resolver,
            discovery_tls,
            network: Mutex::new(None),
            status_loop: Mutex::new(None),
            reporter: Mutex::new(None),
        }
    }

    pub fn set_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        *self.shared.observer.lock().unwrap_or_else(|e| e.into_inner()) = Some(observer);
    }

    pub fn set_status_reporter(&self, reporter: Arc<dyn StatusReporter>) {
        *self.reporter.lock().unwrap_or_else(|e| e.into_inner()) = Some(reporter);
    }

    /// Open the connection. False if already connected, shutting down, or
    /// the handshake did not complete within the connect timeout.
    pub fn connect(&self) -> bool {
        if self.shared.is_shutting_down() {
            tracing::info!("Not connecting - shutting down");
            return false;
        }
        if self.is_connected() {
            tracing::info!("Already connected");
            return false;
        }

        tracing::info!("Starting connection process...");
        {
            let mut state = self.shared.lock_state();
            state.transition(LinkState::Connecting);
            state.clear_session();
        }

        self.start_background_discovery();
        self.wait_for_target();

        if !self.ensure_network_thread() {
            self.shared.set_state(LinkState::Failed);
            return false;
        }

        if self.shared.wait_for_open(self.shared.config.connect_timeout()) {
            self.start_status_loop();
            tracing::info!("Connection established");
            return true;
        }

        if self.shared.is_shutting_down() {
            return false;
        }
        tracing::warn!(
            "Connection timeout after {:?} - cleaning up",
            self.shared.config.connect_timeout()
        );
        self.disconnect();
        false
    }

    /// Close the session and tear down the network thread. Safe to call
    /// repeatedly; does not prevent a later `connect()`.
    pub fn disconnect(&self) {
        let was_open = {
            let mut state = self.shared.lock_state();
            let was_open = state.is_open();
            state.transition(LinkState::Disconnected);
            state.clear_session();
            was_open
        };
        self.shared.state_changed.notify_all();

        self.stop_status_loop();

        let network = self.network.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(network) = network {
            if self.shared.is_shutting_down() {
                network.stop_fast(self.shared.config.shutdown_join_timeout());
            } else {
                network.stop_graceful(self.shared.config.join_timeout());
            }
            // A failed attempt may have raced the transition above
            self.shared.set_state(LinkState::Disconnected);
            tracing::info!("Disconnect: websocket thread cleanup complete");
        }

        if was_open && !self.shared.is_shutting_down() {
            if let Some(observer) = self.shared.observer() {
                observer.on_close();
            }
        }
    }

    /// Disconnect, then retry `connect()` until it succeeds or shutdown
    /// begins. There is no attempt limit.
    pub fn reconnect(&self) -> bool {
        if self.shared.is_shutting_down() {
            tracing::info!("Not attempting reconnection - shutting down");
            return false;
        }

        tracing::info!("Starting reconnection sequence...");
        self.disconnect();

        let mut attempt = 0u64;
        while !self.is_connected() && !self.shared.is_shutting_down() {
            attempt += 1;
            tracing::info!("Reconnection attempt {}", attempt);
            if self.connect() {
                tracing::info!("Reconnection successful");
                return true;
            }
            if !sleep_interruptible(self.shared.config.reconnect_delay(), self.shared.shutdown_flag()) {
                break;
            }
        }

        self.is_connected()
    }

    /// Enter the terminal state: stop discovery, wake every waiter, and tear
    /// down without blocking longer than the shutdown join timeout.
    pub fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::info!("Shutting down connection manager");
        self.shared.set_state(LinkState::ShuttingDown);

        if let Some(resolver) = &self.resolver {
            resolver.stop_discovery();
        }
        self.disconnect();
        tracing::info!("Connection manager shutdown complete");
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_open()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down()
    }

    /// URL of the open connection, or the one the next attempt would use
    pub fn get_connection_url(&self) -> String {
        if let Some(url) = self.shared.lock_state().url.clone() {
            return url;
        }
        self.shared.resolve_target().0
    }

    pub fn send_message(&self, message: Value) -> bool {
        self.shared.send_message(message)
    }

    /// Pin `service` as the target for every following attempt
    pub fn select_service(&self, service: ServiceInfo) {
        self.shared.lock_targets().select(service);
    }

    pub fn discovered_services(&self) -> Vec<ServiceInfo> {
        self.shared.lock_targets().discovered()
    }

    pub fn connection_failure_count(&self) -> u32 {
        self.shared.connection_failure_count.load(Ordering::SeqCst)
    }

    pub fn is_sticky(&self) -> bool {
        self.shared.lock_targets().is_sticky()
    }

    pub fn status(&self) -> ConnectionStatus {
        let sticky_target = self.is_sticky();
        let state = self.shared.lock_state();
        ConnectionStatus {
            state: state.state(),
            connected: state.is_open(),
            url: state.url.clone(),
            connected_since: state.connected_since,
            current_message_id: state.current_message_id,
            connection_failure_count: self.connection_failure_count(),
            sticky_target,
        }
    }

    fn start_background_discovery(&self) {
        if !self.shared.config.background_discovery {
            return;
        }
        let Some(resolver) = &self.resolver else {
            return;
        };
        if resolver.is_discovering() {
            return;
        }

        let targets = self.shared.targets.clone();
        resolver.discover_services_async(
            move |service| {
                let mut targets = targets.lock().unwrap_or_else(|e| e.into_inner());
                if targets.record_discovered(service.clone()) {
                    tracing::info!("Background discovery found {}", service.websocket_url);
                }
            },
            self.shared.config.background_discovery_timeout(),
            self.discovery_tls,
        );
    }

    /// With nothing better than the fallback, give background discovery a
    /// short head start. Without it nothing can fill the registry.
    fn wait_for_target(&self) {
        if self.resolver.is_none() || !self.shared.config.background_discovery {
            return;
        }
        let (_, source) = self.shared.resolve_target();
        if source != TargetSource::Fallback {
            return;
        }

        let deadline = Instant::now().checked_add(self.shared.config.discovery_wait());
        while deadline.map_or(true, |d| Instant::now() < d) && !self.shared.is_shutting_down() {
            if self.shared.lock_targets().has_discovered() {
                return;
            }
            std::thread::sleep(WAIT_SLICE);
        }
        tracing::info!("No service discovered yet, using {}", self.get_connection_url());
    }

    fn ensure_network_thread(&self) -> bool {
        if self.shared.is_shutting_down() {
            return false;
        }
        let mut network = self.network.lock().unwrap_or_else(|e| e.into_inner());
        if network.as_ref().is_some_and(|n| !n.is_finished()) {
            return true;
        }
        if let Some(finished) = network.take() {
            finished.stop_graceful(self.shared.config.join_timeout());
        }

        match NetworkThread::spawn(self.shared.clone()) {
            Ok(thread) => {
                *network = Some(thread);
                true
            }
            Err(e) => {
                tracing::error!("Failed to start network thread: {:#}", e);
                false
            }
        }
    }

    fn start_status_loop(&self) {
        let Some(interval) = self.shared.config.status_interval() else {
            return;
        };
        let Some(reporter) = self.reporter.lock().unwrap_or_else(|e| e.into_inner()).clone() else {
            return;
        };

        let mut status_loop = self.status_loop.lock().unwrap_or_else(|e| e.into_inner());
        if status_loop.is_some() {
            return;
        }
        match StatusLoop::start(self.shared.clone(), reporter, interval) {
            Ok(started) => *status_loop = Some(started),
            Err(e) => tracing::error!("Failed to start status loop: {:#}", e),
        }
    }

    fn stop_status_loop(&self) {
        let status_loop = self.status_loop.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(status_loop) = status_loop {
            status_loop.stop();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
