use std::time::{Duration, Instant};
use anyhow::Result;
use crate::mdns::records::{parse_log_line, MdnsRecord};

/// Something that can issue an mDNS query and hand back the records it hears.
pub trait RecordSource: Send + Sync {
    /// Issue a query for `service_type` and start collecting answers
    fn open(&self, service_type: &str) -> Result<Box<dyn RecordStream>>;
}

/// Longest single `next_batch` wait; longer requests return early and the
/// caller polls again.
pub const MAX_BATCH_WAIT: Duration = Duration::from_secs(60);

/// Records arriving for one open query. Dropping the stream ends the query.
pub trait RecordStream: Send {
    /// Records received within `wait`; empty when nothing arrived.
    fn next_batch(&mut self, wait: Duration) -> Vec<MdnsRecord>;
}

/// Producer half of a [`LogLineSource`], handed to whatever emits log lines.
#[derive(Clone)]
pub struct LogLineSink {
    tx: flume::Sender<String>,
}

impl LogLineSink {
    pub fn push(&self, line: impl Into<String>) {
        // A closed channel only means the source was dropped
        let _ = self.tx.send(line.into());
    }
}

/// Record source fed by text lines in the mdns log format.
pub struct LogLineSource {
    rx: flume::Receiver<String>,
}

impl LogLineSource {
    pub fn new() -> (Self, LogLineSink) {
        let (tx, rx) = flume::unbounded();
        (Self { rx }, LogLineSink { tx })
    }
}

impl RecordSource for LogLineSource {
    fn open(&self, service_type: &str) -> Result<Box<dyn RecordStream>> {
        Ok(Box::new(LogLineStream {
            rx: self.rx.clone(),
            service_type: service_type.to_string(),
        }))
    }
}

struct LogLineStream {
    rx: flume::Receiver<String>,
    service_type: String,
}

impl RecordStream for LogLineStream {
    fn next_batch(&mut self, wait: Duration) -> Vec<MdnsRecord> {
        let deadline = Instant::now() + wait.min(MAX_BATCH_WAIT);
        let mut records = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let line = match self.rx.recv_timeout(remaining) {
                Ok(line) => line,
                Err(flume::RecvTimeoutError::Timeout) => break,
                Err(flume::RecvTimeoutError::Disconnected) => {
                    // No producer left; still honour the poll slice
                    std::thread::sleep(remaining);
                    break;
                }
            };
            tracing::debug!("[mDNS] {}", line.trim_end());
            if let Some(record) = parse_log_line(&line, &self.service_type) {
                records.push(record);
            }
            // Hand back what arrived so far as soon as the queue is drained
            if self.rx.is_empty() {
                break;
            }
        }

        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TYPE: &str = "_vortideck._tcp.local.";

    #[test]
    fn test_lines_become_records() {
        let (source, sink) = LogLineSource::new();
        let mut stream = source.open(TYPE).unwrap();

        sink.push("Opened 1 socket for mDNS query");
        sink.push("answer _vortideck._tcp.local. PTR foo._vortideck._tcp.local.");
        sink.push("additional vortideck.local. A 10.0.0.5");

        let records = stream.next_batch(Duration::from_millis(100));
        assert_eq!(records, vec![
            MdnsRecord::Ptr { instance: "foo._vortideck._tcp.local.".to_string() },
            MdnsRecord::A { owner: "vortideck.local.".to_string(), address: "10.0.0.5".to_string() },
        ]);
    }

    #[test]
    fn test_empty_batch_after_wait() {
        let (source, _sink) = LogLineSource::new();
        let mut stream = source.open(TYPE).unwrap();

        let started = Instant::now();
        assert!(stream.next_batch(Duration::from_millis(50)).is_empty());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_sink_outlives_source() {
        let (source, sink) = LogLineSource::new();
        drop(source);
        sink.push("answer _vortideck._tcp.local. PTR foo._vortideck._tcp.local.");
    }
}
