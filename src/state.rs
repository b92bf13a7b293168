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

//! Last known robot status, fed by telemetry.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::bluetooth::{TelemetryEvent, TelemetryListener};

/// Battery shown while no report has arrived.
pub const DEFAULT_BATTERY_DISPLAY: i32 = 70;

/// Spray level shown while no report has arrived.
pub const DEFAULT_SPRAY_DISPLAY: i32 = 100;

/// Coarse level used to pick a gauge icon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelBucket {
    Full,
    ThreeQuarters,
    Half,
    Quarter,
    Empty,
}

impl LevelBucket {
    pub fn from_level(level: i32) -> Self {
        match level {
            l if l >= 80 => LevelBucket::Full,
            l if l >= 60 => LevelBucket::ThreeQuarters,
            l if l >= 40 => LevelBucket::Half,
            l if l >= 20 => LevelBucket::Quarter,
            _ => LevelBucket::Empty,
        }
    }

    pub fn percent(&self) -> u8 {
        match self {
            LevelBucket::Full => 100,
            LevelBucket::ThreeQuarters => 75,
            LevelBucket::Half => 50,
            LevelBucket::Quarter => 25,
            LevelBucket::Empty => 0,
        }
    }
}

/// Level to display: clamped to 0-100, `fallback` when never reported.
pub fn display_level(value: Option<i32>, fallback: i32) -> i32 {
    value.unwrap_or(fallback).clamp(0, 100)
}

/// Robot status as last reported.
///
/// Values survive a disconnect; `None` means never reported.
#[derive(Debug, Default)]
pub struct RobotStatus {
    battery: RwLock<Option<i32>>,
    spray: RwLock<Option<i32>>,
    progress: RwLock<Option<i32>>,
}

/// Copy of [`RobotStatus`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub battery: Option<i32>,
    pub spray: Option<i32>,
    pub progress: Option<i32>,
}

impl StatusSnapshot {
    pub fn battery_display(&self) -> i32 {
        display_level(self.battery, DEFAULT_BATTERY_DISPLAY)
    }

    pub fn spray_display(&self) -> i32 {
        display_level(self.spray, DEFAULT_SPRAY_DISPLAY)
    }

    pub fn progress_display(&self) -> i32 {
        display_level(self.progress, 0)
    }

    /// The painting task reported completion.
    pub fn is_complete(&self) -> bool {
        self.progress.is_some_and(|p| p >= 100)
    }
}

impl RobotStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn apply(&self, event: TelemetryEvent) {
        match event {
            TelemetryEvent::Battery(level) => *self.battery.write() = Some(level),
            TelemetryEvent::SprayLevel(level) => *self.spray.write() = Some(level),
            TelemetryEvent::Progress(level) => *self.progress.write() = Some(level),
            TelemetryEvent::Unrecognized => {}
        }
    }

    pub fn battery(&self) -> Option<i32> {
        *self.battery.read()
    }

    pub fn spray(&self) -> Option<i32> {
        *self.spray.read()
    }

    pub fn progress(&self) -> Option<i32> {
        *self.progress.read()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            battery: self.battery(),
            spray: self.spray(),
            progress: self.progress(),
        }
    }
}

impl TelemetryListener for RobotStatus {
    fn on_telemetry(&self, event: TelemetryEvent) {
        self.apply(event);
    }
}
