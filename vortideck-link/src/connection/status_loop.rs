use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use anyhow::{Context, Result};
use serde_json::json;
use shared::protocol::STATUS_PATH;
use crate::connection::manager::Shared;
use crate::connection::{sleep_interruptible, StatusReporter};

/// Periodically pushes the reporter's payload while the link is open
pub(crate) struct StatusLoop {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl StatusLoop {
    pub(crate) fn start(shared: Arc<Shared>, reporter: Arc<dyn StatusReporter>, interval: Duration) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        let handle = thread::Builder::new()
            .name("vortideck-status".to_string())
            .spawn(move || {
                tracing::debug!("Status loop started, every {:?}", interval);
                while sleep_interruptible(interval, &thread_stop) {
                    if shared.is_shutting_down() {
                        break;
                    }
                    if !shared.is_open() {
                        continue;
                    }
                    let message = json!({
                        "path": STATUS_PATH,
                        "verb": "SET",
                        "payload": reporter.status_payload(),
                    });
                    if !shared.send_message(message) {
                        tracing::debug!("Status update skipped, link not open");
                    }
                }
                tracing::debug!("Status loop exited");
            })
            .context("Failed to spawn status thread")?;

        Ok(Self { stop, handle })
    }

    pub(crate) fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        if self.handle.thread().id() == thread::current().id() {
            return;
        }
        if self.handle.join().is_err() {
            tracing::error!("Status loop thread panicked");
        }
    }
}
