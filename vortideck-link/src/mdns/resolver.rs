use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use anyhow::{Context, Result};
use shared::types::ServiceInfo;
use crate::config::DiscoveryConfig;
use crate::mdns::browser::MdnsSdSource;
use crate::mdns::correlate::DiscoveryContext;
use crate::mdns::source::RecordSource;

/// Default discovery window
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One running (or just finished) discovery session
struct ActiveDiscovery {
    context: Arc<DiscoveryContext>,
    /// Set once the session's loop has returned or unwound
    done: Arc<AtomicBool>,
    /// Thread running the loop: the worker for async sessions, the caller for blocking scans
    thread: ThreadId,
    /// Only async sessions own a thread
    handle: Option<JoinHandle<()>>,
}

impl ActiveDiscovery {
    fn is_finished(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn on_current_thread(&self) -> bool {
        self.thread == thread::current().id()
    }

    /// Join a finished worker. A worker still running on this thread is detached.
    fn reap(self) {
        let Some(handle) = self.handle else {
            return;
        };
        if self.thread == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            tracing::error!("Discovery thread panicked");
        }
    }
}

/// Marks a session finished when dropped, unwinding included
struct SessionDone(Arc<AtomicBool>);

impl Drop for SessionDone {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn wait_done(done: &AtomicBool) {
    while !done.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(10));
    }
}

/// Finds VortiDeck companions by querying mDNS for the service type and
/// correlating the answers into `ServiceInfo`s. At most one discovery
/// session runs per resolver.
///
/// The session lock is only ever held to inspect or swap the session, never
/// while waiting for one to end, so callbacks may call back into the resolver.
pub struct ServiceResolver {
    source: Arc<dyn RecordSource>,
    service_type: String,
    poll_interval: Duration,
    active: Mutex<Option<ActiveDiscovery>>,
}

impl ServiceResolver {
    /// Resolver on the native mDNS daemon. Fails if multicast cannot be set up.
    pub fn new(config: &DiscoveryConfig) -> Result<Self> {
        let source = MdnsSdSource::new(config.interface.as_deref())
            .context("Failed to initialize mDNS networking")?;
        Ok(Self::with_source(Arc::new(source), config))
    }

    pub fn with_source(source: Arc<dyn RecordSource>, config: &DiscoveryConfig) -> Self {
        Self {
            source,
            service_type: config.service_type.clone(),
            poll_interval: config.poll_interval(),
            active: Mutex::new(None),
        }
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveDiscovery>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Blocking scan. Returns as soon as one service resolves, or empty once
    /// `timeout` passes or `stop_discovery` is called.
    pub fn discover_services(&self, timeout: Duration, tls_enabled: bool) -> Vec<ServiceInfo> {
        let context = Arc::new(DiscoveryContext::collecting(tls_enabled));
        let done = Arc::new(AtomicBool::new(false));
        let finished = SessionDone(done.clone());

        self.install(|| {
            Some(ActiveDiscovery {
                context: context.clone(),
                done: done.clone(),
                thread: thread::current().id(),
                handle: None,
            })
        });

        run_session(self.source.as_ref(), &self.service_type, &context, timeout, self.poll_interval);
        drop(finished);

        let mut active = self.lock_active();
        if active.as_ref().is_some_and(|a| Arc::ptr_eq(&a.done, &done)) {
            *active = None;
        }
        drop(active);

        context.take_services()
    }

    /// Runs discovery on a background thread, calling `on_found` for every
    /// service resolved until `timeout` passes or the session is stopped.
    /// A session already in progress is stopped first.
    pub fn discover_services_async<F>(&self, on_found: F, timeout: Duration, tls_enabled: bool) -> bool
    where
        F: Fn(&ServiceInfo) + Send + Sync + 'static,
    {
        let context = Arc::new(DiscoveryContext::notifying(Box::new(on_found), tls_enabled));
        let source = self.source.clone();
        let service_type = self.service_type.clone();
        let poll_interval = self.poll_interval;

        self.install(move || {
            let done = Arc::new(AtomicBool::new(false));
            let finished = SessionDone(done.clone());
            let worker_context = context.clone();

            let spawned = thread::Builder::new()
                .name("vortideck-mdns".to_string())
                .spawn(move || {
                    let _finished = finished;
                    run_session(source.as_ref(), &service_type, &worker_context, timeout, poll_interval);
                });

            match spawned {
                Ok(handle) => Some(ActiveDiscovery {
                    context,
                    done,
                    thread: handle.thread().id(),
                    handle: Some(handle),
                }),
                Err(e) => {
                    tracing::error!("Failed to spawn discovery thread: {}", e);
                    None
                }
            }
        })
    }

    /// Cancel the current session and wait for it to end. No callback runs
    /// after this returns, except when called from that callback itself.
    pub fn stop_discovery(&self) {
        let done = {
            let active = self.lock_active();
            let Some(current) = active.as_ref() else {
                return;
            };
            current.context.request_stop();
            if current.on_current_thread() {
                // Stopped from inside a callback; the loop exits on its next tick
                tracing::debug!("Discovery stopped from its own thread");
                return;
            }
            current.done.clone()
        };

        wait_done(&done);

        let finished = {
            let mut active = self.lock_active();
            if active.as_ref().is_some_and(|a| Arc::ptr_eq(&a.done, &done)) {
                active.take()
            } else {
                None
            }
        };
        if let Some(finished) = finished {
            finished.reap();
        }
    }

    pub fn is_discovering(&self) -> bool {
        self.lock_active().as_ref().is_some_and(|a| !a.is_finished())
    }

    /// First service found within `timeout`; `ServiceInfo::default()` if none
    pub fn first_service(&self, timeout: Duration, tls_enabled: bool) -> ServiceInfo {
        self.discover_services(timeout, tls_enabled)
            .into_iter()
            .next()
            .unwrap_or_default()
    }

    pub fn is_service_available(&self, timeout: Duration) -> bool {
        !self.first_service(timeout, false).is_empty()
    }

    /// Stop whatever session is running, then install the one `start` builds.
    /// Returns false if `start` produced nothing.
    fn install(&self, start: impl FnOnce() -> Option<ActiveDiscovery>) -> bool {
        loop {
            let done = {
                let mut active = self.lock_active();
                match active.as_ref() {
                    Some(current) if !current.is_finished() && !current.on_current_thread() => {
                        current.context.request_stop();
                        current.done.clone()
                    }
                    _ => {
                        if let Some(previous) = active.take() {
                            previous.context.request_stop();
                            previous.reap();
                        }
                        let session = start();
                        let started = session.is_some();
                        *active = session;
                        return started;
                    }
                }
            };
            wait_done(&done);
        }
    }
}

impl Drop for ServiceResolver {
    fn drop(&mut self) {
        self.stop_discovery();
    }
}

/// Query, then poll the stream in short slices until timeout, cancellation,
/// or (collecting mode) the first resolved service. A timeout too large to
/// represent means no deadline.
fn run_session(
    source: &dyn RecordSource,
    service_type: &str,
    context: &DiscoveryContext,
    timeout: Duration,
    poll_interval: Duration,
) {
    tracing::info!("Starting mDNS discovery for service: {}", service_type);
    context.reset_parsing();

    let deadline = Instant::now().checked_add(timeout);
    let mut stream = match source.open(service_type) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!("mDNS query failed: {:#}", e);
            return;
        }
    };

    tracing::info!("Listening for mDNS responses for {:?}", timeout);

    loop {
        if context.should_stop() {
            tracing::debug!("mDNS discovery cancelled");
            break;
        }

        let wait = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    tracing::info!("mDNS discovery timeout reached");
                    break;
                }
                poll_interval.min(deadline - now)
            }
            None => poll_interval,
        };

        for record in stream.next_batch(wait) {
            if context.should_stop() {
                break;
            }
            context.handle_record(&record);
        }

        if context.is_collecting() && context.has_services() {
            tracing::info!("Found VortiDeck service, stopping discovery");
            break;
        }
    }

    tracing::info!("mDNS discovery finished");
}

/// First service found within `timeout` on the native mDNS daemon;
/// `ServiceInfo::default()` if none
pub fn get_first_vortideck_service(timeout: Duration, tls_enabled: bool) -> ServiceInfo {
    match ServiceResolver::new(&DiscoveryConfig::default()) {
        Ok(resolver) => resolver.first_service(timeout, tls_enabled),
        Err(e) => {
            tracing::error!("mDNS discovery unavailable: {:#}", e);
            ServiceInfo::default()
        }
    }
}

pub fn is_vortideck_service_available(timeout: Duration) -> bool {
    !get_first_vortideck_service(timeout, false).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use crate::mdns::records::MdnsRecord;
    use crate::mdns::source::{LogLineSource, RecordStream};

    /// Returns the same records on every poll
    struct RepeatingSource {
        records: Vec<MdnsRecord>,
        opened: AtomicUsize,
    }

    impl RepeatingSource {
        fn new(records: Vec<MdnsRecord>) -> Arc<Self> {
            Arc::new(Self { records, opened: AtomicUsize::new(0) })
        }
    }

    struct RepeatingStream {
        records: Vec<MdnsRecord>,
    }

    impl RecordSource for RepeatingSource {
        fn open(&self, _service_type: &str) -> Result<Box<dyn RecordStream>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(RepeatingStream { records: self.records.clone() }))
        }
    }

    impl RecordStream for RepeatingStream {
        fn next_batch(&mut self, wait: Duration) -> Vec<MdnsRecord> {
            if self.records.is_empty() {
                thread::sleep(wait);
            } else {
                thread::sleep(wait.min(Duration::from_millis(10)));
            }
            self.records.clone()
        }
    }

    struct FailingSource;

    impl RecordSource for FailingSource {
        fn open(&self, service_type: &str) -> Result<Box<dyn RecordStream>> {
            anyhow::bail!("no multicast route for {}", service_type)
        }
    }

    fn service_records(name: &str, host: &str, port: u32, ip: &str) -> Vec<MdnsRecord> {
        vec![
            MdnsRecord::Ptr { instance: name.to_string() },
            MdnsRecord::Srv { target: host.to_string(), port },
            MdnsRecord::A { owner: host.to_string(), address: ip.to_string() },
        ]
    }

    fn resolver(source: Arc<dyn RecordSource>) -> ServiceResolver {
        ServiceResolver::with_source(source, &DiscoveryConfig::default())
    }

    #[test]
    fn test_sync_discovery_stops_at_first_service() {
        let source = RepeatingSource::new(service_records("a._vortideck._tcp.local.", "a.local.", 9001, "10.0.0.5"));
        let resolver = resolver(source.clone());

        let started = Instant::now();
        let services = resolver.discover_services(Duration::from_secs(10), false);

        assert_eq!(services.len(), 1);
        assert_eq!(services[0].websocket_url, "ws://10.0.0.5:9001/ws");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!resolver.is_discovering());
        assert_eq!(source.opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_timeout_returns_promptly() {
        let resolver = resolver(RepeatingSource::new(Vec::new()));

        let started = Instant::now();
        let services = resolver.discover_services(Duration::ZERO, false);

        assert!(services.is_empty());
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_nothing_found_within_timeout() {
        let resolver = resolver(RepeatingSource::new(Vec::new()));

        let started = Instant::now();
        let services = resolver.discover_services(Duration::from_millis(300), false);

        assert!(services.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_query_failure_yields_empty_result() {
        let resolver = resolver(Arc::new(FailingSource));
        assert!(resolver.discover_services(Duration::from_secs(5), false).is_empty());
        assert!(!resolver.is_discovering());
    }

    #[test]
    fn test_sync_discovery_over_log_lines() {
        let (source, sink) = LogLineSource::new();
        let resolver = resolver(Arc::new(source));

        sink.push("answer _vortideck._tcp.local. PTR foo._vortideck._tcp.local.");
        sink.push("additional foo._vortideck._tcp.local. SRV vortideck.local. priority 0 weight 0 port 9001");
        sink.push("additional vortideck.local. A 10.0.0.5");

        let services = resolver.discover_services(Duration::from_secs(5), true);
        assert_eq!(services, vec![ServiceInfo::new("foo._vortideck._tcp.local.", "10.0.0.5", 9001, true)]);
    }

    #[test]
    fn test_stop_interrupts_blocking_scan() {
        let resolver = Arc::new(resolver(RepeatingSource::new(Vec::new())));
        let stopper = resolver.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            stopper.stop_discovery();
        });

        let started = Instant::now();
        let services = resolver.discover_services(Duration::from_secs(10), false);
        handle.join().unwrap();

        assert!(services.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_async_discovery_reports_every_hit() {
        let source = RepeatingSource::new(service_records("a._vortideck._tcp.local.", "a.local.", 9001, "10.0.0.5"));
        let resolver = resolver(source);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        assert!(resolver.discover_services_async(
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_secs(10),
            false,
        ));
        thread::sleep(Duration::from_millis(300));

        assert!(resolver.is_discovering());
        assert!(hits.load(Ordering::SeqCst) > 1, "async mode must not stop at the first hit");
        resolver.stop_discovery();
    }

    #[test]
    fn test_no_callbacks_after_stop() {
        let source = RepeatingSource::new(service_records("a._vortideck._tcp.local.", "a.local.", 9001, "10.0.0.5"));
        let resolver = resolver(source);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        resolver.discover_services_async(
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_secs(10),
            false,
        );
        thread::sleep(Duration::from_millis(200));
        resolver.stop_discovery();

        assert!(!resolver.is_discovering());
        let after_stop = hits.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(200));
        assert_eq!(hits.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_new_async_session_cancels_previous() {
        let source = RepeatingSource::new(service_records("a._vortideck._tcp.local.", "a.local.", 9001, "10.0.0.5"));
        let resolver = resolver(source.clone());
        let first = Arc::new(AtomicUsize::new(0));
        let first_counter = first.clone();

        resolver.discover_services_async(
            move |_| {
                first_counter.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_secs(10),
            false,
        );
        thread::sleep(Duration::from_millis(100));
        resolver.discover_services_async(|_| {}, Duration::from_secs(10), false);

        let frozen = first.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(200));
        assert_eq!(first.load(Ordering::SeqCst), frozen);
        assert_eq!(source.opened.load(Ordering::SeqCst), 2);
        resolver.stop_discovery();
    }

    #[test]
    fn test_async_session_ends_at_timeout() {
        let resolver = resolver(RepeatingSource::new(Vec::new()));
        resolver.discover_services_async(|_| {}, Duration::from_millis(200), false);

        let started = Instant::now();
        while resolver.is_discovering() && started.elapsed() < Duration::from_secs(3) {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!resolver.is_discovering());
    }

    #[test]
    fn test_stop_from_inside_callback() {
        let source = RepeatingSource::new(service_records("a._vortideck._tcp.local.", "a.local.", 9001, "10.0.0.5"));
        let resolver = Arc::new(resolver(source));
        let weak = Arc::downgrade(&resolver);

        resolver.discover_services_async(
            move |_| {
                if let Some(resolver) = weak.upgrade() {
                    resolver.stop_discovery();
                }
            },
            Duration::from_secs(10),
            false,
        );

        let started = Instant::now();
        while resolver.is_discovering() && started.elapsed() < Duration::from_secs(3) {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!resolver.is_discovering());
    }

    /// Opens fine, then panics on the first poll
    struct PanickingSource;

    struct PanickingStream;

    impl RecordSource for PanickingSource {
        fn open(&self, _service_type: &str) -> Result<Box<dyn RecordStream>> {
            Ok(Box::new(PanickingStream))
        }
    }

    impl RecordStream for PanickingStream {
        fn next_batch(&mut self, _wait: Duration) -> Vec<MdnsRecord> {
            panic!("record stream failed");
        }
    }

    #[test]
    fn test_callback_stop_races_external_stop() {
        let source = RepeatingSource::new(service_records("a._vortideck._tcp.local.", "a.local.", 9001, "10.0.0.5"));
        let resolver = Arc::new(resolver(source));
        let weak = Arc::downgrade(&resolver);
        let (hit_tx, hit_rx) = flume::bounded::<()>(1);
        let inner_stops = Arc::new(AtomicUsize::new(0));
        let inner_counter = inner_stops.clone();

        resolver.discover_services_async(
            move |_| {
                let _ = hit_tx.try_send(());
                thread::sleep(Duration::from_millis(200));
                if let Some(resolver) = weak.upgrade() {
                    resolver.stop_discovery();
                    inner_counter.fetch_add(1, Ordering::SeqCst);
                }
            },
            Duration::from_secs(10),
            false,
        );

        hit_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let (stopped_tx, stopped_rx) = flume::bounded::<()>(1);
        let stopper = resolver.clone();
        thread::spawn(move || {
            stopper.stop_discovery();
            let _ = stopped_tx.send(());
        });

        assert!(stopped_rx.recv_timeout(Duration::from_secs(3)).is_ok(), "external stop never returned");
        assert!(!resolver.is_discovering());
        assert_eq!(inner_stops.load(Ordering::SeqCst), 1, "stop inside the callback returned too");
    }

    #[test]
    fn test_unbounded_timeout_runs_until_stopped() {
        let resolver = Arc::new(resolver(RepeatingSource::new(Vec::new())));
        let scanner = resolver.clone();
        let handle = thread::spawn(move || scanner.discover_services(Duration::MAX, false));

        let started = Instant::now();
        while !resolver.is_discovering() && started.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(resolver.is_discovering());

        resolver.stop_discovery();
        let services = handle.join().expect("scan with unbounded timeout panicked");
        assert!(services.is_empty());
        assert!(!resolver.is_discovering());
    }

    #[test]
    fn test_unbounded_async_timeout() {
        let resolver = resolver(RepeatingSource::new(Vec::new()));
        assert!(resolver.discover_services_async(|_| {}, Duration::MAX, false));
        thread::sleep(Duration::from_millis(150));

        assert!(resolver.is_discovering());
        resolver.stop_discovery();
        assert!(!resolver.is_discovering());
    }

    #[test]
    fn test_panicking_scan_leaves_resolver_usable() {
        let resolver = Arc::new(resolver(Arc::new(PanickingSource)));
        let scanner = resolver.clone();
        assert!(thread::spawn(move || scanner.discover_services(Duration::from_secs(5), false)).join().is_err());

        assert!(!resolver.is_discovering());
        resolver.stop_discovery();

        assert!(resolver.discover_services_async(|_| {}, Duration::from_secs(5), false));
        let started = Instant::now();
        while resolver.is_discovering() && started.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!resolver.is_discovering(), "panicked worker still counted as running");
        resolver.stop_discovery();
    }

    #[test]
    fn test_restart_after_self_stop_stays_discovering() {
        let source = RepeatingSource::new(service_records("a._vortideck._tcp.local.", "a.local.", 9001, "10.0.0.5"));
        let resolver = Arc::new(resolver(source.clone()));
        let weak = Arc::downgrade(&resolver);

        // The first session stops itself on its first hit and lingers in the callback
        resolver.discover_services_async(
            move |_| {
                if let Some(resolver) = weak.upgrade() {
                    resolver.stop_discovery();
                }
                thread::sleep(Duration::from_millis(200));
            },
            Duration::from_secs(10),
            false,
        );
        thread::sleep(Duration::from_millis(50));

        assert!(resolver.discover_services_async(|_| {}, Duration::from_secs(10), false));
        thread::sleep(Duration::from_millis(400));

        assert!(resolver.is_discovering(), "old session's exit must not end the new one");
        assert_eq!(source.opened.load(Ordering::SeqCst), 2);
        resolver.stop_discovery();
        assert!(!resolver.is_discovering());
    }

    #[test]
    fn test_first_service_found() {
        let resolver = resolver(RepeatingSource::new(service_records("a._vortideck._tcp.local.", "a.local.", 9001, "10.0.0.5")));

        let first = resolver.first_service(Duration::from_secs(5), true);
        assert_eq!(first.websocket_url, "wss://10.0.0.5:9001/ws");
        assert!(resolver.is_service_available(Duration::from_secs(5)));
    }

    #[test]
    fn test_first_service_not_found_is_default() {
        let resolver = resolver(RepeatingSource::new(Vec::new()));

        assert_eq!(resolver.first_service(Duration::from_millis(100), false), ServiceInfo::default());
        assert!(!resolver.is_service_available(Duration::from_millis(100)));

        let failing = ServiceResolver::with_source(Arc::new(FailingSource), &DiscoveryConfig::default());
        assert!(failing.first_service(Duration::from_secs(1), false).is_empty());
    }
}
