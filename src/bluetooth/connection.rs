// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The two I/O loops bound to an open transport.
//!
//! The receive loop turns inbound bytes into telemetry events; the send loop
//! drains the outbound queue onto the wire. Neither closes the transport on
//! its own: each returns a [`LoopExit`] and the link manager tears the whole
//! session down.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::protocol::TelemetryEvent;
use super::transport::{BoxedReader, BoxedWriter};

/// Receives decoded telemetry.
///
/// Called on the receive loop's task; implementations must return quickly.
pub trait TelemetryListener: Send + Sync {
    fn on_telemetry(&self, event: TelemetryEvent);
}

impl<F> TelemetryListener for F
where
    F: Fn(TelemetryEvent) + Send + Sync,
{
    fn on_telemetry(&self, event: TelemetryEvent) {
        self(event)
    }
}

/// The single listener registration, shared with the running receive loop.
pub(crate) type ListenerSlot = Arc<RwLock<Option<Arc<dyn TelemetryListener>>>>;

/// A pre-encoded message waiting in the send queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    payload: String,
}

impl OutboundMessage {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }
}

/// Why an I/O loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// The peer closed its side.
    EndOfStream,
    /// A read or write failed.
    Failed(String),
    /// The queue was closed by the link manager.
    Closed,
}

/// Counters shared by the loops and the link manager.
#[derive(Debug, Default)]
pub struct LinkStats {
    records_received: AtomicU64,
    unrecognized_records: AtomicU64,
    messages_enqueued: AtomicU64,
    messages_written: AtomicU64,
    sessions_opened: AtomicU64,
}

/// Point-in-time copy of [`LinkStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStatsSnapshot {
    pub records_received: u64,
    pub unrecognized_records: u64,
    pub messages_enqueued: u64,
    pub messages_written: u64,
    pub sessions_opened: u64,
}

impl LinkStats {
    pub fn snapshot(&self) -> LinkStatsSnapshot {
        LinkStatsSnapshot {
            records_received: self.records_received.load(Ordering::Relaxed),
            unrecognized_records: self.unrecognized_records.load(Ordering::Relaxed),
            messages_enqueued: self.messages_enqueued.load(Ordering::Relaxed),
            messages_written: self.messages_written.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_enqueued(&self) {
        self.messages_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_session(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }
}

/// Split one read chunk into trimmed, non-empty records.
///
/// A chunk without line breaks is a single record.
pub fn split_records(chunk: &str) -> impl Iterator<Item = &str> {
    chunk
        .split(|c| c == '\n' || c == '\r')
        .map(str::trim)
        .filter(|record| !record.is_empty())
}

/// Read until the stream ends or fails, delivering telemetry as it arrives.
pub(crate) async fn receive_loop(
    mut reader: BoxedReader,
    listener: ListenerSlot,
    stats: Arc<LinkStats>,
    buffer_size: usize,
) -> LoopExit {
    debug!("Receive loop started");
    let mut buf = vec![0u8; buffer_size.max(1)];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                info!("Connection closed by remote");
                return LoopExit::EndOfStream;
            }
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]);
                debug!("Received: {}", chunk.trim());

                for record in split_records(&chunk) {
                    dispatch_record(record, &listener, &stats);
                }
            }
            Err(e) => {
                error!("Read error: {}", e);
                return LoopExit::Failed(e.to_string());
            }
        }
    }
}

fn dispatch_record(record: &str, listener: &ListenerSlot, stats: &LinkStats) {
    stats.records_received.fetch_add(1, Ordering::Relaxed);

    let event = TelemetryEvent::parse(record);
    if !event.is_recognized() {
        stats.unrecognized_records.fetch_add(1, Ordering::Relaxed);
        warn!("Ignoring unrecognized record: {}", record);
        return;
    }

    // Clone out of the lock so a listener may re-register from its callback.
    let current = listener.read().clone();
    match current {
        Some(listener) => listener.on_telemetry(event),
        None => debug!("No telemetry listener, dropping {:?}", event),
    }
}

/// Write queued messages in order until the queue closes or a write fails.
pub(crate) async fn send_loop(
    mut writer: BoxedWriter,
    mut queue: mpsc::UnboundedReceiver<OutboundMessage>,
    stats: Arc<LinkStats>,
) -> LoopExit {
    debug!("Send loop started");

    while let Some(message) = queue.recv().await {
        debug!("Sending: {}", message.payload().trim());

        if let Err(e) = write_message(&mut writer, &message).await {
            error!("Write error: {}", e);
            return LoopExit::Failed(e.to_string());
        }
        stats.messages_written.fetch_add(1, Ordering::Relaxed);
    }

    let _ = writer.shutdown().await;
    LoopExit::Closed
}

async fn write_message(writer: &mut BoxedWriter, message: &OutboundMessage) -> std::io::Result<()> {
    writer.write_all(message.payload().as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn collecting_slot() -> (ListenerSlot, Arc<Mutex<Vec<TelemetryEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let listener: Arc<dyn TelemetryListener> =
            Arc::new(move |event: TelemetryEvent| sink.lock().push(event));
        (Arc::new(RwLock::new(Some(listener))), events)
    }

    #[test]
    fn test_split_records() {
        let records: Vec<_> = split_records("  BATTERY:85  ").collect();
        assert_eq!(records, vec!["BATTERY:85"]);

        let records: Vec<_> = split_records("BATTERY:85\r\nSPRAY:7\n\nPROGRESS:1\n").collect();
        assert_eq!(records, vec!["BATTERY:85", "SPRAY:7", "PROGRESS:1"]);

        assert_eq!(split_records(" \r\n ").count(), 0);
    }

    #[tokio::test]
    async fn test_receive_loop_dispatches_and_survives_garbage() {
        let (mut remote, local) = duplex(256);
        let (slot, events) = collecting_slot();
        let stats = Arc::new(LinkStats::default());

        let task = tokio::spawn(receive_loop(Box::new(local), slot, stats.clone(), 1024));

        remote.write_all(b"BATTERY:85\ngarbage\nSPRAY:7\n").await.unwrap();
        remote.write_all(b"PROGRESS:bad\n").await.unwrap();
        remote.write_all(b"PROGRESS:100\n").await.unwrap();
        drop(remote);

        assert_eq!(task.await.unwrap(), LoopExit::EndOfStream);
        assert_eq!(
            *events.lock(),
            vec![
                TelemetryEvent::Battery(85),
                TelemetryEvent::SprayLevel(7),
                TelemetryEvent::Progress(100),
            ]
        );

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.records_received, 5);
        assert_eq!(snapshot.unrecognized_records, 2);
    }

    #[tokio::test]
    async fn test_receive_loop_without_listener() {
        let (mut remote, local) = duplex(64);
        let slot: ListenerSlot = Arc::new(RwLock::new(None));
        let stats = Arc::new(LinkStats::default());

        let task = tokio::spawn(receive_loop(Box::new(local), slot, stats.clone(), 16));
        remote.write_all(b"BATTERY:10\n").await.unwrap();
        drop(remote);

        assert_eq!(task.await.unwrap(), LoopExit::EndOfStream);
        assert_eq!(stats.snapshot().records_received, 1);
    }

    #[tokio::test]
    async fn test_send_loop_preserves_order() {
        let (mut remote, local) = duplex(1024);
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(LinkStats::default());

        for payload in ["A", "B", "C"] {
            tx.send(OutboundMessage::new(payload)).unwrap();
        }
        drop(tx);

        let exit = send_loop(Box::new(local), rx, stats.clone()).await;
        assert_eq!(exit, LoopExit::Closed);

        let mut written = String::new();
        remote.read_to_string(&mut written).await.unwrap();
        assert_eq!(written, "ABC");
        assert_eq!(stats.snapshot().messages_written, 3);
    }

    #[tokio::test]
    async fn test_send_loop_stops_on_write_error() {
        let (remote, local) = duplex(64);
        drop(remote);

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(OutboundMessage::new("FORWARD")).unwrap();

        let exit = send_loop(Box::new(local), rx, Arc::new(LinkStats::default())).await;
        assert!(matches!(exit, LoopExit::Failed(_)));
    }
}
