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

//! Errors surfaced by the link manager to its callers.
//!
//! Transport failures never show up here; they only move the connection
//! state back to `Disconnected`.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// No usable adapter, or the adapter is powered off.
    #[error("bluetooth adapter unavailable")]
    NoAdapter,

    /// The platform refused access to the adapter.
    #[error("bluetooth permission denied")]
    PermissionDenied,

    /// A client connect is in progress and owns the radio.
    #[error("connection attempt in progress")]
    Busy,

    /// No open send loop to take the message.
    #[error("not connected")]
    NotConnected,

    /// A control message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(String),

    /// A field pattern document failed validation.
    #[error("invalid field pattern: {0}")]
    InvalidPattern(String),
}
