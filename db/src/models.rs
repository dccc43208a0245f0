use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::message::CommandMethod;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct User {
    pub id: String,
    pub name: String,
}

impl User {
    pub fn new(name: &str) -> Self {
        Self {
            id: beacon_utils::uuid(),
            name: name.to_string(),
        }
    }
}

/// A per-device polling endpoint. The channel owns its command queue;
/// `last_sequence_issued` is the next sequence to assign (sequence 0 is
/// reserved for always-deliver markers), `last_sequence_exec` the last
/// sequence the client acknowledged through a poll, and
/// `last_sequence_delivered` the highest sequence ever returned by a poll
/// (commands at or below it are no longer eligible for consolidation).
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Channel {
    pub id: String,
    pub user_id: String,
    pub instance_id: String,
    pub enabled: bool,
    pub badge: i64,
    pub last_sequence_issued: i64,
    pub last_sequence_exec: i64,
    pub last_sequence_delivered: i64,
}

impl Channel {
    pub fn new(user_id: &str, instance_id: &str) -> Self {
        Self {
            id: beacon_utils::uuid(),
            user_id: user_id.to_string(),
            instance_id: instance_id.to_string(),
            enabled: true,
            badge: 0,
            last_sequence_issued: 1,
            last_sequence_exec: 0,
            last_sequence_delivered: 0,
        }
    }
}

/// Immutable once assigned. Sequence numbers are unique and monotonic per
/// channel; markers carry sequence 0 and survive acknowledgement.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Command {
    pub id: String,
    pub channel_id: String,
    pub sequence: i64,
    pub method: CommandMethod,
    pub params: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Command {
    pub fn new(
        channel_id: &str,
        sequence: i64,
        method: CommandMethod,
        params: serde_json::Value,
    ) -> Self {
        Self {
            id: beacon_utils::uuid(),
            channel_id: channel_id.to_string(),
            sequence,
            method,
            params,
            created_at: Utc::now(),
        }
    }
}

#[derive(
    Display, EnumString, Deserialize, Serialize, Debug, Clone, PartialEq, Eq,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Ringing,
    Confirmed,
    Terminated,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Call {
    pub id: String,
    pub state: CallState,
    pub from_user: String,
    pub from_channel: String,
    pub to_user: String,
    /// Bound on accept; the callee's other channels get a cancel instead.
    pub to_channel: Option<String>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
    pub forward: bool,
}

impl Call {
    pub fn new(from_user: &str, from_channel: &str, to_user: &str) -> Self {
        Self {
            id: beacon_utils::uuid(),
            state: CallState::Ringing,
            from_user: from_user.to_string(),
            from_channel: from_channel.to_string(),
            to_user: to_user.to_string(),
            to_channel: None,
            accepted_at: None,
            duration: None,
            forward: false,
        }
    }
}

#[derive(
    Display, EnumString, Deserialize, Serialize, Debug, Clone, PartialEq, Eq,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CallForwardState {
    Setup,
    Ack,
    Established,
    Terminated,
}

/// Operator-mediated transfer joining two confirmed calls. The channel ids
/// pin the transfer to the devices actually on the calls; signals never fan
/// out to the users' other channels.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CallForward {
    pub id: String,
    pub state: CallForwardState,
    pub dispatcher_user: String,
    pub dispatcher_channel: String,
    pub caller_user: String,
    pub caller_channel: String,
    pub callee_user: String,
    pub callee_channel: String,
    pub failed: bool,
}
