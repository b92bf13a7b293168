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

//! Peers, transports and the platform seam underneath the link manager.

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Bluetooth device address (`AA:BB:CC:DD:EE:FF`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerAddress([u8; 6]);

impl PeerAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

impl FromStr for PeerAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 6];
        let mut parts = s.trim().split(':');

        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| anyhow!("Address too short: {}", s))?;
            if part.len() != 2 {
                return Err(anyhow!("Invalid address octet '{}' in {}", part, s));
            }
            *byte = u8::from_str_radix(part, 16)?;
        }

        if parts.next().is_some() {
            return Err(anyhow!("Address too long: {}", s));
        }

        Ok(Self(bytes))
    }
}

impl TryFrom<String> for PeerAddress {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PeerAddress> for String {
    fn from(address: PeerAddress) -> Self {
        address.to_string()
    }
}

/// A remote device seen during discovery or met on an accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub address: PeerAddress,
    /// Human-readable name. Many devices never report one.
    pub name: Option<String>,
}

impl Peer {
    pub fn new(address: PeerAddress, name: Option<String>) -> Self {
        Self { address, name }
    }

    /// Name to show in lists, falling back to the address.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => self.address.to_string(),
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An open byte stream to one peer.
///
/// Split into its read and write halves when a session starts; the socket
/// closes once both halves are dropped.
pub struct Transport {
    peer: Peer,
    reader: BoxedReader,
    writer: BoxedWriter,
}

impl Transport {
    pub fn new<R, W>(peer: Peer, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            peer,
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Wrap a bidirectional stream.
    pub fn from_stream<S>(peer: Peer, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(peer, reader, writer)
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub(crate) fn into_parts(self) -> (Peer, BoxedReader, BoxedWriter) {
        (self.peer, self.reader, self.writer)
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").field("peer", &self.peer).finish()
    }
}

/// What the platform reports about the local adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterStatus {
    /// Present, powered and accessible.
    Ready,
    /// Present but switched off.
    PoweredOff,
    /// No adapter on this system.
    Unavailable,
    /// The adapter exists but access was refused.
    PermissionDenied,
}

/// Bluetooth operations the link manager needs from the host.
pub trait BluetoothPlatform: Send + Sync + 'static {
    /// Current adapter state. Checked before discovery and connects.
    fn adapter_status(&self) -> BoxFuture<'_, AdapterStatus>;

    /// Start an inquiry. Dropping the stream ends it.
    fn discover(&self) -> BoxFuture<'_, Result<BoxStream<'static, Peer>>>;

    /// Open a client connection to the service on `peer`.
    fn connect(&self, peer: Peer, service: Uuid) -> BoxFuture<'_, Result<Transport>>;

    /// Advertise the service and return an endpoint for incoming connections.
    fn listen(
        &self,
        service: Uuid,
        name: String,
    ) -> BoxFuture<'_, Result<Box<dyn TransportAcceptor>>>;
}

/// A listening endpoint. Dropping it stops advertising.
pub trait TransportAcceptor: Send {
    /// Wait for the next incoming connection.
    ///
    /// `Ok(None)` means the endpoint is gone and will never accept again.
    /// Errors are per-connection and the caller may keep accepting.
    fn accept(&mut self) -> BoxFuture<'_, Result<Option<Transport>>>;
}

/// Adapt an unbounded receiver into a boxed stream.
pub(crate) fn channel_stream<T: Send + 'static>(
    rx: mpsc::UnboundedReceiver<T>,
) -> BoxStream<'static, T> {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}
