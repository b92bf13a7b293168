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

//! Link manager: discovery, connection lifecycle and the send/receive loops.
//!
//! One [`LinkManager`] owns at most one open transport. It is a cheap handle;
//! clone it into whatever needs to drive the link. All methods must be
//! called from within a tokio runtime.

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::connection::{
    receive_loop, send_loop, LinkStats, LinkStatsSnapshot, ListenerSlot, LoopExit,
    OutboundMessage, TelemetryListener,
};
use super::protocol::SERVICE_UUID;
use super::transport::{AdapterStatus, BluetoothPlatform, Peer, Transport};
use crate::error::LinkError;

/// State of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Listening,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Listening => "Waiting for robot...",
            ConnectionState::Connected => "Connected",
        }
    }
}

/// Tunables for the link manager.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Service the client connects to and the server advertises.
    pub service_uuid: Uuid,
    /// SDP service name used in server mode.
    pub server_name: String,
    /// Size of a single read on the inbound stream.
    pub read_buffer_size: usize,
    /// How long one discovery cycle runs.
    pub discovery_window: Duration,
    /// Pause after a failed accept before listening again.
    pub accept_retry_delay: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            service_uuid: SERVICE_UUID,
            server_name: "FieldPainterBot".to_string(),
            read_buffer_size: 1024,
            discovery_window: Duration::from_secs(12),
            accept_retry_delay: Duration::from_secs(1),
        }
    }
}

/// An open transport and the two tasks bound to it.
struct Session {
    id: u64,
    peer: Peer,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    receiver: JoinHandle<()>,
    sender: JoinHandle<()>,
}

impl Session {
    /// Stop both loops. Their stream halves drop with them, closing the transport.
    fn close(self) {
        self.receiver.abort();
        self.sender.abort();
    }
}

/// Everything guarded by the slot lock.
#[derive(Default)]
struct LinkSlot {
    /// Bumped by every connect and disconnect. Work started under an older
    /// epoch must not install a transport.
    epoch: u64,
    connecting: bool,
    session: Option<Session>,
    next_session_id: u64,
    discovery: Option<JoinHandle<()>>,
    discovery_cycle: u64,
    acceptor: Option<JoinHandle<()>>,
}

struct LinkInner {
    platform: Arc<dyn BluetoothPlatform>,
    config: LinkConfig,
    state_tx: watch::Sender<ConnectionState>,
    peers_tx: watch::Sender<Arc<Vec<Peer>>>,
    listener: ListenerSlot,
    stats: Arc<LinkStats>,
    slot: Mutex<LinkSlot>,
}

/// Handle to the Bluetooth link.
#[derive(Clone)]
pub struct LinkManager {
    inner: Arc<LinkInner>,
}

impl LinkManager {
    /// Create a new link manager on top of a platform.
    pub fn new(platform: Arc<dyn BluetoothPlatform>, config: LinkConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (peers_tx, _) = watch::channel(Arc::new(Vec::new()));

        Self {
            inner: Arc::new(LinkInner {
                platform,
                config,
                state_tx,
                peers_tx,
                listener: Arc::new(RwLock::new(None)),
                stats: Arc::new(LinkStats::default()),
                slot: Mutex::new(LinkSlot::default()),
            }),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Stream of state changes. The current value is seen immediately.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Snapshot of peers found in the current discovery cycle.
    pub fn peers(&self) -> Arc<Vec<Peer>> {
        Arc::clone(&self.inner.peers_tx.borrow())
    }

    /// Stream of discovered-peer snapshots.
    pub fn subscribe_peers(&self) -> watch::Receiver<Arc<Vec<Peer>>> {
        self.inner.peers_tx.subscribe()
    }

    /// Peer of the open transport, if any.
    pub fn connected_peer(&self) -> Option<Peer> {
        self.inner
            .slot
            .lock()
            .session
            .as_ref()
            .map(|session| session.peer.clone())
    }

    pub fn stats(&self) -> LinkStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Register the telemetry sink, replacing any previous one.
    pub fn set_listener(&self, listener: Arc<dyn TelemetryListener>) {
        let previous = self.inner.listener.write().replace(listener);
        if previous.is_some() {
            debug!("Telemetry listener replaced");
        }
    }

    /// Remove the telemetry sink. Events are dropped until a new one is set.
    pub fn clear_listener(&self) {
        self.inner.listener.write().take();
    }

    /// Start a discovery cycle.
    ///
    /// Fails without touching the radio when the adapter is missing, off or
    /// inaccessible; the link is then forced to `Disconnected`. Rejected with
    /// [`LinkError::Busy`] while a client connect is running.
    pub async fn start_discovery(&self) -> Result<(), LinkError> {
        if self.inner.slot.lock().connecting {
            warn!("Discovery rejected while connecting");
            return Err(LinkError::Busy);
        }

        if let Err(e) = self.inner.check_adapter().await {
            warn!("Discovery rejected: {}", e);
            self.disconnect();
            return Err(e);
        }

        let mut slot = self.inner.slot.lock();
        if slot.connecting {
            warn!("Discovery rejected while connecting");
            return Err(LinkError::Busy);
        }
        if let Some(previous) = slot.discovery.take() {
            previous.abort();
        }
        slot.discovery_cycle += 1;
        self.inner.peers_tx.send_replace(Arc::new(Vec::new()));

        let inner = Arc::clone(&self.inner);
        let cycle = slot.discovery_cycle;
        slot.discovery = Some(tokio::spawn(async move {
            inner.run_discovery(cycle).await;
        }));

        info!("Discovery started");
        Ok(())
    }

    /// Stop the running discovery cycle, if any. Found peers are kept.
    pub fn stop_discovery(&self) {
        let mut slot = self.inner.slot.lock();
        slot.discovery_cycle += 1;
        if let Some(discovery) = slot.discovery.take() {
            discovery.abort();
            info!("Discovery stopped");
        }
    }

    /// Connect to a peer as client.
    ///
    /// Returns immediately; progress is reported through the state stream.
    /// Does nothing while a transport is open or another connect is running.
    /// Never retries on its own.
    pub fn connect(&self, peer: Peer) -> JoinHandle<()> {
        let epoch = {
            let mut slot = self.inner.slot.lock();
            if slot.session.is_some() || slot.connecting {
                debug!("Connect to {} ignored, link already active", peer);
                return tokio::spawn(async {});
            }

            slot.epoch += 1;
            slot.connecting = true;

            // Discovery and connecting contend for the radio.
            slot.discovery_cycle += 1;
            if let Some(discovery) = slot.discovery.take() {
                discovery.abort();
                info!("Discovery cancelled before connecting");
            }
            if let Some(acceptor) = slot.acceptor.take() {
                acceptor.abort();
                info!("Server stopped, switching to client role");
            }

            self.inner.set_state(ConnectionState::Connecting);
            slot.epoch
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run_connect(epoch, peer).await;
        })
    }

    /// Listen for the robot to connect to us.
    ///
    /// Idempotent. The accept loop keeps running across sessions until
    /// [`disconnect`](Self::disconnect); each new client replaces the
    /// previous transport.
    pub fn start_server(&self) {
        let mut slot = self.inner.slot.lock();
        if slot.acceptor.is_some() {
            debug!("Server already running");
            return;
        }
        if slot.connecting {
            warn!("Server start ignored while a connect is in progress");
            return;
        }

        let inner = Arc::clone(&self.inner);
        let epoch = slot.epoch;
        slot.acceptor = Some(tokio::spawn(async move {
            inner.run_accept_loop(epoch).await;
        }));

        if slot.session.is_none() {
            self.inner.set_state(ConnectionState::Listening);
        }
    }

    /// Queue a message for the send loop.
    ///
    /// Never blocks. Success means the message is queued, not yet written.
    pub fn try_send(&self, message: impl Into<String>) -> Result<(), LinkError> {
        let slot = self.inner.slot.lock();
        let session = slot.session.as_ref().ok_or(LinkError::NotConnected)?;

        session
            .outbound
            .send(OutboundMessage::new(message))
            .map_err(|_| LinkError::NotConnected)?;
        self.inner.stats.record_enqueued();
        Ok(())
    }

    /// Callback form of [`try_send`](Self::try_send). Exactly one callback
    /// runs, on the caller's task, before this returns.
    pub fn send<S, E>(&self, message: impl Into<String>, on_ok: S, on_err: E)
    where
        S: FnOnce(),
        E: FnOnce(LinkError),
    {
        match self.try_send(message) {
            Ok(()) => on_ok(),
            Err(e) => {
                warn!("Cannot send message: {}", e);
                on_err(e);
            }
        }
    }

    /// Tear everything down and return to `Disconnected`.
    ///
    /// Safe from any state, any number of times. A connect still in flight
    /// is abandoned: its transport is closed as soon as it opens.
    pub fn disconnect(&self) {
        let mut slot = self.inner.slot.lock();
        slot.epoch += 1;
        slot.connecting = false;

        if let Some(acceptor) = slot.acceptor.take() {
            acceptor.abort();
            debug!("Accept loop cancelled");
        }
        if let Some(session) = slot.session.take() {
            info!("Disconnecting from {}", session.peer);
            session.close();
        }

        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Disconnect and stop discovery.
    pub fn shutdown(&self) {
        self.stop_discovery();
        self.disconnect();
    }
}

impl LinkInner {
    /// Publish a state change. Callers hold the slot lock.
    fn set_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            info!("Link state: {}", state.as_str());
        }
    }

    async fn check_adapter(&self) -> Result<(), LinkError> {
        match self.platform.adapter_status().await {
            AdapterStatus::Ready => Ok(()),
            AdapterStatus::PoweredOff | AdapterStatus::Unavailable => Err(LinkError::NoAdapter),
            AdapterStatus::PermissionDenied => Err(LinkError::PermissionDenied),
        }
    }

    async fn run_discovery(&self, cycle: u64) {
        let mut peers = match self.platform.discover().await {
            Ok(peers) => peers,
            Err(e) => {
                error!("Failed to start discovery: {}", e);
                return;
            }
        };

        let window = tokio::time::sleep(self.config.discovery_window);
        tokio::pin!(window);

        loop {
            tokio::select! {
                _ = &mut window => {
                    info!("Discovery window elapsed");
                    break;
                }
                peer = peers.next() => match peer {
                    Some(peer) => self.record_peer(cycle, peer),
                    None => break,
                },
            }
        }

        let mut slot = self.slot.lock();
        if slot.discovery_cycle == cycle {
            slot.discovery = None;
        }
        debug!("Discovery finished with {} peers", self.peers_tx.borrow().len());
    }

    /// Add a peer to the current snapshot, deduplicated by address.
    fn record_peer(&self, cycle: u64, peer: Peer) {
        let slot = self.slot.lock();
        if slot.discovery_cycle != cycle {
            return;
        }

        let current = Arc::clone(&self.peers_tx.borrow());
        let mut next = (*current).clone();

        match next.iter_mut().find(|known| known.address == peer.address) {
            Some(known) => {
                if known.name.is_some() || peer.name.is_none() {
                    return;
                }
                debug!("Peer {} reported name {:?}", peer.address, peer.name);
                known.name = peer.name;
            }
            None => {
                info!("Discovered {}", peer);
                next.push(peer);
            }
        }

        self.peers_tx.send_replace(Arc::new(next));
        drop(slot);
    }

    async fn run_connect(self: Arc<Self>, epoch: u64, peer: Peer) {
        if let Err(e) = self.check_adapter().await {
            warn!("Connect to {} rejected: {}", peer, e);
            self.connect_failed(epoch);
            return;
        }

        info!("Connecting to {}", peer);
        match self.platform.connect(peer.clone(), self.config.service_uuid).await {
            Ok(transport) => {
                let mut slot = self.slot.lock();
                if slot.epoch != epoch {
                    warn!("Connection to {} abandoned, closing", peer);
                    drop(transport);
                    return;
                }
                slot.connecting = false;
                self.open_session(&mut slot, transport);
            }
            Err(e) => {
                error!("Connection to {} failed: {}", peer, e);
                self.connect_failed(epoch);
            }
        }
    }

    fn connect_failed(&self, epoch: u64) {
        let mut slot = self.slot.lock();
        if slot.epoch == epoch {
            slot.connecting = false;
            self.set_state(ConnectionState::Disconnected);
        }
    }

    async fn run_accept_loop(self: Arc<Self>, epoch: u64) {
        let mut acceptor = match self
            .platform
            .listen(self.config.service_uuid, self.config.server_name.clone())
            .await
        {
            Ok(acceptor) => acceptor,
            Err(e) => {
                error!("Failed to start server: {}", e);
                self.server_stopped(epoch);
                return;
            }
        };

        info!(
            "Waiting for connections (service {})...",
            self.config.service_uuid
        );

        loop {
            match acceptor.accept().await {
                Ok(Some(transport)) => {
                    info!("Connection from: {}", transport.peer());
                    let mut slot = self.slot.lock();
                    if slot.epoch != epoch {
                        warn!("Connection from {} arrived after shutdown", transport.peer());
                        return;
                    }
                    self.open_session(&mut slot, transport);
                }
                Ok(None) => {
                    error!("Server endpoint closed");
                    self.server_stopped(epoch);
                    return;
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                    // Continue listening despite errors
                    tokio::time::sleep(self.config.accept_retry_delay).await;
                }
            }
        }
    }

    /// The accept loop ended for good. An open session stays up.
    fn server_stopped(&self, epoch: u64) {
        let mut slot = self.slot.lock();
        if slot.epoch != epoch {
            return;
        }
        slot.acceptor = None;
        if slot.session.is_none() {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Bind the loops to a fresh transport, closing any previous one first.
    fn open_session(self: &Arc<Self>, slot: &mut LinkSlot, transport: Transport) {
        if let Some(previous) = slot.session.take() {
            info!("Replacing link to {}", previous.peer);
            previous.close();
        }

        slot.next_session_id += 1;
        let id = slot.next_session_id;
        let (peer, reader, writer) = transport.into_parts();
        let (outbound, queue) = mpsc::unbounded_channel();

        let receiver = {
            let inner = Arc::clone(self);
            let listener = Arc::clone(&self.listener);
            let stats = Arc::clone(&self.stats);
            let buffer_size = self.config.read_buffer_size;
            tokio::spawn(async move {
                let exit = receive_loop(reader, listener, stats, buffer_size).await;
                inner.session_ended(id, exit);
            })
        };

        let sender = {
            let inner = Arc::clone(self);
            let stats = Arc::clone(&self.stats);
            tokio::spawn(async move {
                let exit = send_loop(writer, queue, stats).await;
                inner.session_ended(id, exit);
            })
        };

        info!("Connected to {}", peer);
        slot.session = Some(Session {
            id,
            peer,
            outbound,
            receiver,
            sender,
        });
        self.stats.record_session();
        self.set_state(ConnectionState::Connected);
    }

    /// A loop stopped on its own. Tear the session down, both loops included.
    fn session_ended(&self, id: u64, exit: LoopExit) {
        let mut slot = self.slot.lock();
        let current = slot.session.as_ref().is_some_and(|session| session.id == id);
        if !current {
            return;
        }

        if let Some(session) = slot.session.take() {
            warn!("Link to {} lost: {:?}", session.peer, exit);
            session.close();
        }

        let next = if slot.acceptor.is_some() {
            ConnectionState::Listening
        } else {
            ConnectionState::Disconnected
        };
        self.set_state(next);
    }
}
