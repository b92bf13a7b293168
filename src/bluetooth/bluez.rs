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

//! BlueZ platform: classic discovery and RFCOMM through the profile API.

use anyhow::{anyhow, Result};
use bluer::rfcomm::{ConnectRequest, Profile, ProfileHandle, Role};
use bluer::{Adapter, AdapterEvent, Address, ErrorKind, Session};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::transport::{
    channel_stream, AdapterStatus, BluetoothPlatform, Peer, PeerAddress, Transport,
    TransportAcceptor,
};

/// Bluetooth access through the system BlueZ daemon.
pub struct BluezPlatform {
    session: Session,
    adapter: Adapter,
    connect_timeout: Duration,
}

impl BluezPlatform {
    /// Open a BlueZ session on the default adapter.
    pub async fn new(connect_timeout: Duration) -> Result<Self> {
        info!("Initializing Bluetooth platform...");

        // Create BlueZ session
        let session = bluer::Session::new().await?;
        info!("BlueZ session created");

        // Get the default adapter
        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        Ok(Self {
            session,
            adapter,
            connect_timeout,
        })
    }

    async fn peer_for(adapter: &Adapter, address: Address) -> Peer {
        let name = match adapter.device(address) {
            Ok(device) => device.name().await.unwrap_or(None),
            Err(_) => None,
        };
        Peer::new(PeerAddress::new(address.0), name)
    }

    async fn open_client(&self, peer: &Peer, service: Uuid) -> Result<Transport> {
        let address = Address::new(peer.address.bytes());

        let profile = Profile {
            uuid: service,
            role: Some(Role::Client),
            require_authentication: Some(false),
            require_authorization: Some(false),
            auto_connect: Some(false),
            ..Default::default()
        };
        let mut handle = self.session.register_profile(profile).await?;
        debug!("Client profile registered for {}", service);

        let device = self.adapter.device(address)?;
        let connecting: JoinHandle<bluer::Result<()>> =
            tokio::spawn(async move { device.connect_profile(&service).await });
        let abort = connecting.abort_handle();

        let request = tokio::time::timeout(
            self.connect_timeout,
            await_request(&mut handle, connecting),
        )
        .await;

        let request = match request {
            Ok(request) => request?,
            Err(_) => {
                abort.abort();
                return Err(anyhow!("Connection to {} timed out", peer.address));
            }
        };

        let stream = request.accept()?;
        let (reader, writer) = stream.into_split();
        Ok(Transport::new(peer.clone(), reader, writer))
    }
}

/// Wait for BlueZ to hand the new connection to our profile.
///
/// `ConnectProfile` only returns once the profile has taken the connection,
/// so both have to be driven at the same time.
async fn await_request(
    handle: &mut ProfileHandle,
    mut connecting: JoinHandle<bluer::Result<()>>,
) -> Result<ConnectRequest> {
    let mut profile_connected = false;

    loop {
        tokio::select! {
            request = handle.next() => {
                return request.ok_or_else(|| anyhow!("Profile unregistered"));
            }
            joined = &mut connecting, if !profile_connected => {
                joined??;
                profile_connected = true;
            }
        }
    }
}

fn status_from_error(e: &bluer::Error) -> AdapterStatus {
    match e.kind {
        ErrorKind::NotAuthorized | ErrorKind::NotPermitted => AdapterStatus::PermissionDenied,
        _ => AdapterStatus::Unavailable,
    }
}

impl BluetoothPlatform for BluezPlatform {
    fn adapter_status(&self) -> BoxFuture<'_, AdapterStatus> {
        Box::pin(async move {
            match self.adapter.is_powered().await {
                Ok(true) => AdapterStatus::Ready,
                Ok(false) => AdapterStatus::PoweredOff,
                Err(e) => {
                    warn!("Adapter status unavailable: {}", e);
                    status_from_error(&e)
                }
            }
        })
    }

    fn discover(&self) -> BoxFuture<'_, Result<BoxStream<'static, Peer>>> {
        Box::pin(async move {
            let adapter = self.adapter.clone();
            let (tx, rx) = mpsc::unbounded_channel();

            // The inquiry lives as long as this task; it ends once the
            // returned stream is dropped.
            tokio::spawn(async move {
                let events = match adapter.discover_devices().await {
                    Ok(events) => events,
                    Err(e) => {
                        error!("Discovery failed: {}", e);
                        return;
                    }
                };
                tokio::pin!(events);

                loop {
                    tokio::select! {
                        _ = tx.closed() => break,
                        event = events.next() => match event {
                            Some(AdapterEvent::DeviceAdded(address)) => {
                                let peer = Self::peer_for(&adapter, address).await;
                                if tx.send(peer).is_err() {
                                    break;
                                }
                            }
                            Some(_) => {}
                            None => break,
                        },
                    }
                }
                debug!("Inquiry stopped");
            });

            Ok(channel_stream(rx))
        })
    }

    fn connect(&self, peer: Peer, service: Uuid) -> BoxFuture<'_, Result<Transport>> {
        Box::pin(async move { self.open_client(&peer, service).await })
    }

    fn listen(
        &self,
        service: Uuid,
        name: String,
    ) -> BoxFuture<'_, Result<Box<dyn TransportAcceptor>>> {
        Box::pin(async move {
            // Make adapter discoverable
            self.adapter.set_discoverable(true).await?;
            self.adapter.set_pairable(true).await?;
            info!("Adapter is discoverable and pairable");

            let profile = Profile {
                uuid: service,
                name: Some(name),
                role: Some(Role::Server),
                require_authentication: Some(false),
                require_authorization: Some(false),
                ..Default::default()
            };
            let handle = self.session.register_profile(profile).await?;
            info!("Serial service registered (UUID: {})", service);

            Ok(Box::new(BluezAcceptor {
                handle,
                adapter: self.adapter.clone(),
            }) as Box<dyn TransportAcceptor>)
        })
    }
}

/// Server-role profile registration. Dropping it unregisters the service.
struct BluezAcceptor {
    handle: ProfileHandle,
    adapter: Adapter,
}

impl TransportAcceptor for BluezAcceptor {
    fn accept(&mut self) -> BoxFuture<'_, Result<Option<Transport>>> {
        Box::pin(async move {
            let Some(request) = self.handle.next().await else {
                warn!("Serial profile unregistered");
                return Ok(None);
            };

            let peer = BluezPlatform::peer_for(&self.adapter, request.device()).await;
            let stream = request.accept()?;
            let (reader, writer) = stream.into_split();
            Ok(Some(Transport::new(peer, reader, writer)))
        })
    }
}
