//! The network thread: a single-threaded tokio runtime that keeps trying to
//! hold one WebSocket session open until it is cancelled.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use crate::connection::manager::Shared;
use crate::connection::state::LinkState;
use crate::connection::WAIT_SLICE;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub(crate) struct NetworkThread {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
    /// Disconnects when the thread body returns
    done: flume::Receiver<()>,
}

impl NetworkThread {
    pub(crate) fn spawn(shared: Arc<Shared>) -> Result<Self> {
        let cancel = CancellationToken::new();
        let (done_tx, done) = flume::bounded::<()>(1);
        let thread_cancel = cancel.clone();

        let handle = thread::Builder::new()
            .name("vortideck-ws".to_string())
            .spawn(move || {
                let _done = done_tx;
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        tracing::error!("Failed to build network runtime: {}", e);
                        return;
                    }
                };
                runtime.block_on(run_forever(shared, thread_cancel));
            })
            .context("Failed to spawn network thread")?;

        Ok(Self { handle, cancel, done })
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel and wait up to `timeout` for the loop to exit, then join.
    /// A thread that does not exit in time is left detached.
    pub(crate) fn stop_graceful(self, timeout: Duration) {
        tracing::info!("Disconnect: requesting network thread stop");
        self.cancel.cancel();
        if self.handle.thread().id() == thread::current().id() {
            return;
        }
        if self.wait_done(timeout) {
            if self.handle.join().is_err() {
                tracing::error!("Disconnect: network thread panicked");
            } else {
                tracing::info!("Disconnect: network thread joined");
            }
        } else {
            tracing::warn!("Disconnect: network thread still running after {:?}, detaching", timeout);
        }
    }

    /// Shutdown path: cancel, wait at most `timeout`, never join.
    pub(crate) fn stop_fast(self, timeout: Duration) {
        self.cancel.cancel();
        if self.handle.thread().id() == thread::current().id() {
            return;
        }
        if !self.wait_done(timeout) {
            tracing::warn!("Shutdown: network thread still running after {:?}, detaching", timeout);
        }
    }

    /// True once the thread body has returned. An unrepresentable deadline waits indefinitely.
    fn wait_done(&self, timeout: Duration) -> bool {
        let outcome = match Instant::now().checked_add(timeout) {
            Some(deadline) => self.done.recv_deadline(deadline),
            None => self.done.recv().map_err(|_| flume::RecvTimeoutError::Disconnected),
        };
        !matches!(outcome, Err(flume::RecvTimeoutError::Timeout))
    }
}

/// Building the handshake request is what can fail before any I/O happens
fn create_connection(url: &str) -> Result<Request> {
    url.into_client_request()
        .with_context(|| format!("Invalid WebSocket URL {:?}", url))
}

/// Sleep up to `total` in short slices. False once cancelled or shutting down.
async fn pause(shared: &Shared, cancel: &CancellationToken, total: Duration) -> bool {
    let deadline = tokio::time::Instant::now().checked_add(total);
    loop {
        if cancel.is_cancelled() || shared.is_shutting_down() {
            return false;
        }
        let slice = match deadline {
            Some(deadline) => {
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    return true;
                }
                WAIT_SLICE.min(deadline - now)
            }
            None => WAIT_SLICE,
        };
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(slice) => {}
        }
    }
}

async fn run_forever(shared: Arc<Shared>, cancel: CancellationToken) {
    tracing::info!("Network loop started");

    while !shared.is_shutting_down() && !cancel.is_cancelled() {
        let (url, source) = shared.resolve_target();
        let request = match create_connection(&url) {
            Ok(request) => request,
            Err(e) => {
                let failures = shared.record_creation_failure();
                tracing::warn!("Failed to create connection: {:#} ({} consecutive)", e, failures);
                if !pause(&shared, &cancel, shared.config.retry_delay()).await {
                    break;
                }
                continue;
            }
        };

        tracing::info!("Connecting to {} ({:?})", url, source);
        shared.set_state(LinkState::Connecting);

        let attempt = tokio::select! {
            _ = cancel.cancelled() => break,
            attempt = tokio::time::timeout(shared.config.connect_timeout(), connect_async(request)) => attempt,
        };

        match attempt {
            Ok(Ok((socket, _response))) => run_session(&shared, &cancel, socket, &url).await,
            Ok(Err(e)) => {
                tracing::warn!("WebSocket connection to {} failed: {}", url, e);
                shared.set_state(LinkState::Failed);
            }
            Err(_) => {
                tracing::warn!("WebSocket handshake with {} timed out", url);
                shared.set_state(LinkState::Failed);
            }
        }

        if shared.is_shutting_down() || cancel.is_cancelled() {
            break;
        }
        if !pause(&shared, &cancel, shared.config.retry_delay()).await {
            break;
        }
    }

    tracing::info!("Network loop exited");
}

/// Pump one open socket until it closes, fails, or the loop is cancelled
async fn run_session(shared: &Shared, cancel: &CancellationToken, socket: Socket, url: &str) {
    let (mut write, mut read) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    if !shared.handle_open(url, tx) {
        let _ = write.send(Message::Close(None)).await;
        return;
    }

    let mut failed = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            Some(frame) = rx.recv() => {
                if let Err(e) = write.send(frame).await {
                    tracing::warn!("Failed to send message: {}", e);
                    failed = true;
                    break;
                }
            }
            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => shared.handle_message(&text),
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!("WebSocket closed by peer: {:?}", frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error: {}", e);
                        failed = true;
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    shared.handle_close(failed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;

    fn shared(fallback_url: &str) -> Arc<Shared> {
        Arc::new(Shared::new(ConnectionConfig {
            fallback_url: fallback_url.to_string(),
            retry_delay_ms: 50,
            background_discovery: false,
            ..ConnectionConfig::default()
        }))
    }

    #[test]
    fn test_unbounded_pause_ends_on_cancel() {
        let shared = shared("ws://127.0.0.1:1/ws");
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();

        let started = Instant::now();
        let completed = runtime.block_on(async {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                canceller.cancel();
            });
            pause(&shared, &cancel, Duration::MAX).await
        });

        assert!(!completed);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_stop_with_unbounded_timeout_joins() {
        let network = NetworkThread::spawn(shared("not a url")).unwrap();
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        network.stop_graceful(Duration::MAX);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_create_connection_accepts_ws_urls() {
        assert!(create_connection("ws://10.0.0.5:9001/ws").is_ok());
        assert!(create_connection("wss://10.0.0.5:9443/ws").is_ok());
    }

    #[test]
    fn test_create_connection_rejects_garbage() {
        assert!(create_connection("").is_err());
        assert!(create_connection("not a url").is_err());
    }
}
