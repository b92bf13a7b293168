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

//! Wire protocol spoken with the robot firmware.
//!
//! Inbound telemetry is a colon format (`BATTERY:85`), outbound control
//! commands are single-line JSON objects.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Standard SPP UUID, advertised by the robot and used by both roles.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);

const BATTERY_PREFIX: &str = "BATTERY";
const SPRAY_PREFIX: &str = "SPRAY";
const PROGRESS_PREFIX: &str = "PROGRESS";

/// A status report decoded from one telemetry record.
///
/// Levels are passed through as sent; the firmware reports 0-100 but no
/// clamping happens here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryEvent {
    /// Battery charge.
    Battery(i32),
    /// Paint tank level.
    SprayLevel(i32),
    /// Progress of the current painting task.
    Progress(i32),
    /// Anything else. Never an error.
    Unrecognized,
}

impl TelemetryEvent {
    /// Parse a single trimmed record.
    ///
    /// The prefix match is case-sensitive and the payload is the field right
    /// after the first `:`; further fields are ignored.
    pub fn parse(record: &str) -> Self {
        let mut fields = record.split(':');
        let kind = fields.next().unwrap_or_default();

        let ctor: fn(i32) -> Self = match kind {
            BATTERY_PREFIX => Self::Battery,
            SPRAY_PREFIX => Self::SprayLevel,
            PROGRESS_PREFIX => Self::Progress,
            _ => return Self::Unrecognized,
        };

        match fields.next().map(str::parse::<i32>) {
            Some(Ok(level)) => ctor(level),
            Some(Err(_)) => {
                debug!("Invalid telemetry payload: {}", record);
                Self::Unrecognized
            }
            None => Self::Unrecognized,
        }
    }

    /// Whether this event carries a level.
    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unrecognized)
    }
}

/// Controls on the manual-drive pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    #[serde(rename = "FORWARD")]
    Forward,
    #[serde(rename = "BACK")]
    Back,
    #[serde(rename = "LEFT")]
    Left,
    #[serde(rename = "RIGHT")]
    Right,
    #[serde(rename = "SPRAY")]
    Spray,
}

impl Command {
    /// All commands, in pad order.
    pub const ALL: [Command; 5] = [
        Self::Forward,
        Self::Back,
        Self::Left,
        Self::Right,
        Self::Spray,
    ];

    /// Parse from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "FORWARD" => Some(Self::Forward),
            "BACK" => Some(Self::Back),
            "LEFT" => Some(Self::Left),
            "RIGHT" => Some(Self::Right),
            "SPRAY" => Some(Self::Spray),
            _ => None,
        }
    }

    /// Convert to string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forward => "FORWARD",
            Self::Back => "BACK",
            Self::Left => "LEFT",
            Self::Right => "RIGHT",
            Self::Spray => "SPRAY",
        }
    }
}

/// Whether a pad control went down or came back up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ButtonState {
    Pressed,
    Released,
}

/// One control record sent to the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub command: Command,
    pub state: ButtonState,
}

impl ControlMessage {
    pub fn new(command: Command, state: ButtonState) -> Self {
        Self { command, state }
    }

    pub fn pressed(command: Command) -> Self {
        Self::new(command, ButtonState::Pressed)
    }

    pub fn released(command: Command) -> Self {
        Self::new(command, ButtonState::Released)
    }

    /// Serialize to JSON string with newline delimiter.
    pub fn to_wire(&self) -> Result<String> {
        let json = serde_json::to_string(self)?;
        Ok(format!("{}\n", json))
    }

    /// Parse from JSON string.
    pub fn from_wire(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json.trim())?)
    }
}
