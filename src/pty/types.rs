//! Terminal session types and wire messages

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use utoipa::ToSchema;

use super::process::TerminalSize;
use crate::errors::LiveError;

/// Session lifecycle. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Initializing,
    Active,
    Closing,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ExitCause {
    /// The process exited on its own.
    ProcessExited,
    /// The attached client went away.
    ClientDisconnected,
    /// No data in either direction for the idle window.
    IdleTimeout,
    /// Explicit close by the client or an operator.
    Closed,
    /// Daemon shutdown.
    Shutdown,
}

/// Exit record for a finished session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExitInfo {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub cause: ExitCause,
}

impl ExitInfo {
    /// A process that ended on its own with anything but a clean zero exit.
    pub fn crashed(&self) -> bool {
        self.cause == ExitCause::ProcessExited
            && !(self.exit_code == Some(0) && self.signal.is_none())
    }

    /// `ProcessCrashed` with the exit detail, if the process crashed.
    pub fn crash_error(&self) -> Option<LiveError> {
        if !self.crashed() {
            return None;
        }
        let detail = match (&self.signal, self.exit_code) {
            (Some(signal), _) => format!("terminated by {signal}"),
            (None, Some(code)) => format!("exit code {code}"),
            (None, None) => "unknown exit status".to_string(),
        };
        Some(LiveError::ProcessCrashed(detail))
    }
}

/// Terminal session information
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Session ID (UUID)
    pub id: String,
    pub host_ref: String,
    /// Owner of the session
    pub user_id: String,
    pub state: SessionState,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    /// Seconds since data last moved in either direction
    pub idle_secs: u64,
    /// Bytes forwarded from the client to the process
    pub bytes_in: u64,
    /// Bytes forwarded from the process to the client
    pub bytes_out: u64,
    pub attached: bool,
    pub exit: Option<ExitInfo>,
}

/// Client → session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientInput {
    Data(Vec<u8>),
    Resize(TerminalSize),
    Close,
}

/// Session → client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    Output(Vec<u8>),
    /// Sent exactly once, last.
    Ended(ExitInfo),
}

/// The session's half of a client channel.
pub struct ClientChannel {
    pub input: mpsc::Receiver<ClientInput>,
    pub output: mpsc::Sender<TerminalEvent>,
}

/// The transport's half of a client channel.
pub struct ClientEnd {
    pub input: mpsc::Sender<ClientInput>,
    pub output: mpsc::Receiver<TerminalEvent>,
}

impl ClientChannel {
    pub fn pair(capacity: usize) -> (ClientChannel, ClientEnd) {
        let (input_tx, input_rx) = mpsc::channel(capacity.max(1));
        let (output_tx, output_rx) = mpsc::channel(capacity.max(1));
        (
            ClientChannel {
                input: input_rx,
                output: output_tx,
            },
            ClientEnd {
                input: input_tx,
                output: output_rx,
            },
        )
    }
}

/// Text frames a terminal client may send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Init {
        #[serde(rename = "authToken")]
        auth_token: String,
        #[serde(rename = "hostRef", alias = "applianceId", deserialize_with = "host_ref_string")]
        host_ref: String,
    },
    /// Keystrokes as text; binary frames carry raw bytes.
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    Ping,
    Close,
}

/// Dashboard clients send appliance ids as numbers.
fn host_ref_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) if !s.is_empty() => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "hostRef must be a non-empty string or a number, got {other}"
        ))),
    }
}

/// Text frames the server sends to a terminal client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Connected {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "hostRef")]
        host_ref: String,
    },
    Error {
        code: String,
        error: String,
    },
    Pong,
    Exit {
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
        signal: Option<String>,
        crashed: bool,
        cause: ExitCause,
    },
}

impl From<&ExitInfo> for ServerMessage {
    fn from(exit: &ExitInfo) -> Self {
        ServerMessage::Exit {
            exit_code: exit.exit_code,
            signal: exit.signal.clone(),
            crashed: exit.crashed(),
            cause: exit.cause,
        }
    }
}
