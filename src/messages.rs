// Message types exchanged between callers, the session and the controller

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RelayError;

/// Motion command understood by the controller firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Command {
    Forward,
    Backward,
    Left,
    Right,
    Stop,
}

impl Command {
    pub const ALL: [Command; 5] = [
        Command::Forward,
        Command::Backward,
        Command::Left,
        Command::Right,
        Command::Stop,
    ];

    /// Token written to the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Forward => "FORWARD",
            Command::Backward => "BACKWARD",
            Command::Left => "LEFT",
            Command::Right => "RIGHT",
            Command::Stop => "STOP",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Accepts canonical names and the FWD/BWD/REVERSE synonyms, any case, surrounding whitespace ignored
impl FromStr for Command {
    type Err = RelayError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let token = raw.trim().to_ascii_uppercase();
        match token.as_str() {
            "FORWARD" | "FWD" => Ok(Command::Forward),
            "BACKWARD" | "BWD" | "REVERSE" => Ok(Command::Backward),
            "LEFT" => Ok(Command::Left),
            "RIGHT" => Ok(Command::Right),
            "STOP" => Ok(Command::Stop),
            _ => Err(RelayError::InvalidCommand(raw.trim().to_string())),
        }
    }
}

/// Result of one exchange with the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "response", rename_all = "snake_case")]
pub enum Outcome {
    /// Controller replied with `OK:` or with informational text
    Acknowledged(String),
    /// Controller replied with `ERROR:`
    Rejected(String),
    /// Command was written but no reply arrived in time
    Unanswered,
}

impl Outcome {
    /// Classify a non-empty reply line
    pub fn from_reply(line: String) -> Self {
        if line.starts_with("ERROR:") {
            Outcome::Rejected(line)
        } else {
            // `OK:` and anything else the firmware prints count as acknowledged
            Outcome::Acknowledged(line)
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        matches!(self, Outcome::Acknowledged(_))
    }
}

/// Connection state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Ready,
}

/// How the connect handshake ended. Both variants leave the link usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Handshake {
    Ready,
    /// Readiness marker never arrived (firmware may already be running)
    Incomplete,
}

/// Snapshot published for health/status reporting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayStatus {
    pub connected: bool,
    pub link_state: LinkState,
    pub port: Option<String>,
    pub seconds_since_last_command: Option<f64>,
}
