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

//! In-memory platform backed by `tokio::io::duplex` pipes.
//!
//! Every transport it hands out has a matching [`DuplexStream`] that plays
//! the robot's side of the link.

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use tokio::io::{duplex, AsyncWrite, DuplexStream};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use super::transport::{
    channel_stream, AdapterStatus, BluetoothPlatform, Peer, Transport, TransportAcceptor,
};

const PIPE_CAPACITY: usize = 4096;

/// Scriptable [`BluetoothPlatform`].
pub struct MockPlatform {
    status: Mutex<AdapterStatus>,
    refuse_connections: AtomicBool,
    fail_listen: AtomicBool,
    hold_connects: AtomicBool,
    break_writes: AtomicBool,
    connect_gate: Notify,
    discovery_tx: Mutex<Option<mpsc::UnboundedSender<Peer>>>,
    remote_tx: mpsc::UnboundedSender<DuplexStream>,
    remote_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
    incoming_tx: Mutex<Option<mpsc::UnboundedSender<Transport>>>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        Self {
            status: Mutex::new(AdapterStatus::Ready),
            refuse_connections: AtomicBool::new(false),
            fail_listen: AtomicBool::new(false),
            hold_connects: AtomicBool::new(false),
            break_writes: AtomicBool::new(false),
            connect_gate: Notify::new(),
            discovery_tx: Mutex::new(None),
            remote_tx,
            remote_rx: tokio::sync::Mutex::new(remote_rx),
            incoming_tx: Mutex::new(None),
        }
    }
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_adapter_status(&self, status: AdapterStatus) {
        *self.status.lock() = status;
    }

    /// Make client connects fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Make `listen` fail.
    pub fn fail_listen(&self, fail: bool) {
        self.fail_listen.store(fail, Ordering::SeqCst);
    }

    /// Park client connects until [`release_connect`](Self::release_connect).
    pub fn hold_connects(&self, hold: bool) {
        self.hold_connects.store(hold, Ordering::SeqCst);
    }

    /// Hand out client transports whose every write fails with `BrokenPipe`.
    /// Reads still come from the robot side.
    pub fn break_writes(&self, broken: bool) {
        self.break_writes.store(broken, Ordering::SeqCst);
    }

    /// Let one parked connect complete.
    pub fn release_connect(&self) {
        self.connect_gate.notify_one();
    }

    /// Report a peer to the running discovery. Returns false if none runs.
    pub fn announce(&self, peer: Peer) -> bool {
        match self.discovery_tx.lock().as_ref() {
            Some(tx) => tx.send(peer).is_ok(),
            None => false,
        }
    }

    /// Robot side of the next client transport.
    pub async fn next_remote(&self) -> Option<DuplexStream> {
        self.remote_rx.lock().await.recv().await
    }

    /// Whether a server endpoint is currently open.
    pub fn is_listening(&self) -> bool {
        self.incoming_tx
            .lock()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Tear the server endpoint down from the platform side.
    pub fn close_listener(&self) {
        self.incoming_tx.lock().take();
    }

    /// Connect to the open server endpoint as `peer`.
    ///
    /// Returns the robot side of the new transport, or `None` when nothing
    /// is listening.
    pub fn dial_in(&self, peer: Peer) -> Option<DuplexStream> {
        let (local, remote) = duplex(PIPE_CAPACITY);
        let incoming = self.incoming_tx.lock();
        let tx = incoming.as_ref()?;
        tx.send(Transport::from_stream(peer, local)).ok()?;
        Some(remote)
    }
}

impl BluetoothPlatform for MockPlatform {
    fn adapter_status(&self) -> BoxFuture<'_, AdapterStatus> {
        let status = *self.status.lock();
        Box::pin(async move { status })
    }

    fn discover(&self) -> BoxFuture<'_, Result<BoxStream<'static, Peer>>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.discovery_tx.lock() = Some(tx);
            Ok(channel_stream(rx))
        })
    }

    fn connect(&self, peer: Peer, _service: Uuid) -> BoxFuture<'_, Result<Transport>> {
        Box::pin(async move {
            if self.refuse_connections.load(Ordering::SeqCst) {
                return Err(anyhow!("Connection refused by {}", peer.address));
            }

            let (local, remote) = duplex(PIPE_CAPACITY);
            self.remote_tx
                .send(remote)
                .map_err(|_| anyhow!("Remote end receiver dropped"))?;

            if self.hold_connects.load(Ordering::SeqCst) {
                self.connect_gate.notified().await;
            }

            if self.break_writes.load(Ordering::SeqCst) {
                let (reader, _) = tokio::io::split(local);
                return Ok(Transport::new(peer, reader, BrokenWriter));
            }

            Ok(Transport::from_stream(peer, local))
        })
    }

    fn listen(
        &self,
        _service: Uuid,
        _name: String,
    ) -> BoxFuture<'_, Result<Box<dyn TransportAcceptor>>> {
        Box::pin(async move {
            if self.fail_listen.load(Ordering::SeqCst) {
                return Err(anyhow!("Failed to register service"));
            }

            let (tx, rx) = mpsc::unbounded_channel();
            *self.incoming_tx.lock() = Some(tx);
            Ok(Box::new(MockAcceptor { incoming: rx }) as Box<dyn TransportAcceptor>)
        })
    }
}

struct MockAcceptor {
    incoming: mpsc::UnboundedReceiver<Transport>,
}

impl TransportAcceptor for MockAcceptor {
    fn accept(&mut self) -> BoxFuture<'_, Result<Option<Transport>>> {
        Box::pin(async move { Ok(self.incoming.recv().await) })
    }
}

/// Writer for a link whose outbound direction is dead.
struct BrokenWriter;

impl AsyncWrite for BrokenWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
