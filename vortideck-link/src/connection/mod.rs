pub mod manager;
pub mod network;
pub mod state;
pub mod status_loop;
pub mod target;

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

pub use manager::ConnectionManager;
pub use state::{ConnectionStatus, LinkState};
pub use target::TargetSource;

/// Granularity at which every wait in this module re-checks for shutdown
pub const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Hooks for the application layer. Called on the network thread, in order.
pub trait ConnectionObserver: Send + Sync {
    fn on_open(&self, _url: &str) {}
    fn on_close(&self) {}
    fn on_message(&self, _text: &str) {}
}

/// Supplies the payload of the periodic status message
pub trait StatusReporter: Send + Sync {
    fn status_payload(&self) -> serde_json::Value;
}

/// Sleep for `total` in `WAIT_SLICE` steps. Returns false as soon as `stop` is set.
/// A `total` past the end of representable time sleeps until stopped.
pub(crate) fn sleep_interruptible(total: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now().checked_add(total);
    loop {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        thread::sleep(match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return true;
                }
                WAIT_SLICE.min(deadline - now)
            }
            None => WAIT_SLICE,
        });
    }
}
