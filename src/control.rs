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

//! Robot control on top of the link: manual drive and field pattern upload.

use serde_json::Value;
use tracing::{debug, info};

use crate::bluetooth::{ButtonState, Command, ControlMessage, LinkManager};
use crate::error::LinkError;

/// Sends control traffic to the robot.
#[derive(Clone)]
pub struct RobotController {
    link: LinkManager,
}

impl RobotController {
    pub fn new(link: LinkManager) -> Self {
        Self { link }
    }

    /// A pad control went down.
    pub fn press(&self, command: Command) -> Result<(), LinkError> {
        self.send_control(ControlMessage::new(command, ButtonState::Pressed))
    }

    /// A pad control came back up.
    pub fn release(&self, command: Command) -> Result<(), LinkError> {
        self.send_control(ControlMessage::new(command, ButtonState::Released))
    }

    pub fn send_control(&self, message: ControlMessage) -> Result<(), LinkError> {
        let wire = message
            .to_wire()
            .map_err(|e| LinkError::Encode(e.to_string()))?;

        self.link.try_send(wire)?;
        debug!("Control sent: {:?} {:?}", message.command, message.state);
        Ok(())
    }

    /// Send a field pattern to the robot.
    ///
    /// `on_complete` runs only once the pattern is queued; validation or send
    /// failures run `on_error` instead, so callers can gate the switch to
    /// their "painting" view on `on_complete` alone.
    pub fn upload_pattern<S, E>(&self, pattern: &str, on_complete: S, on_error: E)
    where
        S: FnOnce(),
        E: FnOnce(LinkError),
    {
        let payload = match encode_pattern(pattern) {
            Ok(payload) => payload,
            Err(e) => {
                on_error(e);
                return;
            }
        };

        let size = payload.len();
        self.link.send(
            payload,
            || {
                info!("Field pattern queued ({} bytes)", size);
                on_complete();
            },
            on_error,
        );
    }
}

/// Validate a field pattern document and compact it onto a single line.
///
/// The robot expects a JSON object holding an `items` array of instructions.
pub fn encode_pattern(pattern: &str) -> Result<String, LinkError> {
    let document: Value =
        serde_json::from_str(pattern).map_err(|e| LinkError::InvalidPattern(e.to_string()))?;

    match document.get("items") {
        Some(Value::Array(_)) => Ok(format!("{}\n", document)),
        Some(_) => Err(LinkError::InvalidPattern("'items' is not an array".into())),
        None => Err(LinkError::InvalidPattern("missing 'items'".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_pattern_compacts() {
        let pattern = r#"{
            "items": [
                {"Instruction Order": "1", "Quantity of Movement": "50", "Type of Movement": "walk"},
                {}
            ]
        }"#;

        let encoded = encode_pattern(pattern).unwrap();
        assert!(encoded.ends_with('\n'));
        assert_eq!(encoded.matches('\n').count(), 1);

        let reparsed: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(reparsed["items"][0]["Type of Movement"], "walk");
    }

    #[test]
    fn test_encode_pattern_rejects_bad_documents() {
        assert!(matches!(
            encode_pattern("not json"),
            Err(LinkError::InvalidPattern(_))
        ));
        assert!(matches!(
            encode_pattern(r#"{"steps": []}"#),
            Err(LinkError::InvalidPattern(_))
        ));
        assert!(matches!(
            encode_pattern(r#"{"items": 3}"#),
            Err(LinkError::InvalidPattern(_))
        ));
        assert!(matches!(
            encode_pattern("[1, 2]"),
            Err(LinkError::InvalidPattern(_))
        ));
    }
}
