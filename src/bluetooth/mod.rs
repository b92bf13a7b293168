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

//! Bluetooth communication module.
//!
//! Handles the RFCOMM serial link to the robot, as client or server.

#[cfg(feature = "bluez")]
mod bluez;
mod connection;
mod manager;
pub mod mock;
pub mod protocol;
mod transport;

#[cfg(feature = "bluez")]
pub use bluez::BluezPlatform;
pub use connection::{
    split_records, LinkStatsSnapshot, LoopExit, OutboundMessage, TelemetryListener,
};
pub use manager::{ConnectionState, LinkConfig, LinkManager};
pub use protocol::{ButtonState, Command, ControlMessage, TelemetryEvent, SERVICE_UUID};
pub use transport::{
    AdapterStatus, BluetoothPlatform, BoxedReader, BoxedWriter, Peer, PeerAddress, Transport,
    TransportAcceptor,
};
