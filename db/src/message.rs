use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::models::Command;

/// Outbound protocol commands delivered through channel queues and the
/// subscription broker. Wire names are snake_case on both the JSON and the
/// string side.
#[derive(
    Display, EnumString, Deserialize, Serialize, Debug, Clone, PartialEq, Eq,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CommandMethod {
    Dial,
    Accept,
    Terminate,
    Mute,
    CallFwdSetup,
    CallFwdAck,
    CallFwdEstablished,
    CallFwdTerminated,
    Message,
    SyncContacts,
    Resync,
}

impl CommandMethod {
    /// Reset/bootstrap kinds: a new command of this kind replaces an
    /// earlier one still undelivered in the same queue.
    pub fn consolidates(&self) -> bool {
        matches!(self, CommandMethod::SyncContacts | CommandMethod::Resync)
    }
}

/// Inbound command envelope, already authenticated by the boundary layer.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Envelope {
    pub method: String,
    pub sequence_number: Option<i64>,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// One entry of a poll response.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PollItem {
    pub method: CommandMethod,
    pub sequence: i64,
    pub params: serde_json::Value,
}

impl From<&Command> for PollItem {
    fn from(command: &Command) -> Self {
        Self {
            method: command.method.clone(),
            sequence: command.sequence,
            params: command.params.clone(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DialRequest {
    pub user: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CallRequest {
    pub call: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MuteRequest {
    pub call: String,
    #[serde(default)]
    pub video_off: bool,
    #[serde(default)]
    pub sound_off: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct FwdSetupRequest {
    pub from_user: String,
    pub to_user: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct FwdRequest {
    pub fwd: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct FwdTerminateRequest {
    pub fwd: String,
    #[serde(default)]
    pub failed: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SendMessageRequest {
    pub user: String,
    pub body: serde_json::Value,
}
