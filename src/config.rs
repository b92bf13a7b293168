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

//! Configuration module.
//!
//! Handles loading and saving application settings.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::bluetooth::{LinkConfig, PeerAddress, SERVICE_UUID};

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// File this configuration was loaded from.
    #[serde(skip)]
    pub path: PathBuf,

    /// Link settings.
    pub link: LinkSettings,

    /// Robot settings.
    pub robot: RobotSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// Serial service UUID shared with the robot firmware.
    pub service_uuid: Uuid,

    /// Bytes requested per read on the inbound stream.
    pub read_buffer_size: usize,

    /// Length of one discovery cycle in seconds.
    pub discovery_window_secs: u64,

    /// Pause after a failed accept in milliseconds.
    pub accept_retry_delay_ms: u64,

    /// Transport-level timeout for client connects in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            service_uuid: SERVICE_UUID,
            read_buffer_size: 1024,
            discovery_window_secs: 12,
            accept_retry_delay_ms: 1000,
            connect_timeout_secs: 15,
        }
    }
}

impl LinkSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotSettings {
    /// Robot connected to most recently.
    pub last_peer: Option<PeerAddress>,

    /// Service name advertised in server mode.
    pub server_name: String,
}

impl Default for RobotSettings {
    fn default() -> Self {
        Self {
            last_peer: None,
            server_name: "FieldPainterBot".to_string(),
        }
    }
}

impl Config {
    /// Default location of the configuration file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fieldpainter")
            .join("config.toml")
    }

    /// Load configuration from the default file or create it.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load configuration from `path`, writing defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            let config = Self::default();
            let content = toml::to_string_pretty(&config)?;
            std::fs::write(path, content)?;
            config
        };

        config.path = path.to_path_buf();
        Ok(config)
    }

    /// Save configuration to the file it was loaded from.
    pub fn save(&self) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }

    /// Settings for the link manager.
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            service_uuid: self.link.service_uuid,
            server_name: self.robot.server_name.clone(),
            read_buffer_size: self.link.read_buffer_size,
            discovery_window: Duration::from_secs(self.link.discovery_window_secs),
            accept_retry_delay: Duration::from_millis(self.link.accept_retry_delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.path, path);
        assert_eq!(config.link.read_buffer_size, 1024);
        assert_eq!(config.link.service_uuid, SERVICE_UUID);
        assert!(config.robot.last_peer.is_none());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::load_from(&path).unwrap();
        config.robot.last_peer = Some("B8:27:EB:00:11:22".parse().unwrap());
        config.link.discovery_window_secs = 30;
        config.save().unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.robot.last_peer, config.robot.last_peer);
        assert_eq!(reloaded.link.discovery_window_secs, 30);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[link]\nread_buffer_size = 256\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.link.read_buffer_size, 256);
        assert_eq!(config.link.accept_retry_delay_ms, 1000);
        assert_eq!(config.robot.server_name, "FieldPainterBot");

        let link = config.link_config();
        assert_eq!(link.read_buffer_size, 256);
        assert_eq!(link.accept_retry_delay, Duration::from_secs(1));
    }
}
