use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_COMMAND_DURATION_MS: u64 = 3_000;
pub const DEFAULT_LOCATION: &str = "unknown";

/// Single-letter actuation codes understood by the device's `/set` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ActionCode {
    Light,
    Fan,
    Feed,
    Water,
    Buzzer,
    PirAlarm,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseActionError {
    #[error("action must not be empty")]
    Empty,
    #[error("unknown action '{0}'")]
    Unknown(String),
}

impl ActionCode {
    pub const ALL: [ActionCode; 6] = [
        Self::Light,
        Self::Fan,
        Self::Feed,
        Self::Water,
        Self::Buzzer,
        Self::PirAlarm,
    ];

    pub fn letter(self) -> char {
        match self {
            Self::Light => 'A',
            Self::Fan => 'B',
            Self::Feed => 'C',
            Self::Water => 'D',
            Self::Buzzer => 'E',
            Self::PirAlarm => 'P',
        }
    }

    pub fn kind(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Fan => "fan",
            Self::Feed => "feed",
            Self::Water => "water",
            Self::Buzzer => "buzzer",
            Self::PirAlarm => "pir_alarm",
        }
    }

    /// Accepts either the device letter (any case) or a named action.
    pub fn parse_token(token: &str) -> Result<Self, ParseActionError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ParseActionError::Empty);
        }

        let lower = token.to_ascii_lowercase();
        let code = match lower.as_str() {
            "a" | "light" | "led" => Self::Light,
            "b" | "fan" => Self::Fan,
            "c" | "feed" | "feeding" => Self::Feed,
            "d" | "water" | "watering" => Self::Water,
            "e" | "buzzer" => Self::Buzzer,
            "p" | "pir_alarm" | "alarm" => Self::PirAlarm,
            _ => return Err(ParseActionError::Unknown(token.to_string())),
        };
        Ok(code)
    }
}

impl fmt::Display for ActionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl FromStr for ActionCode {
    type Err = ParseActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_token(s)
    }
}

impl TryFrom<String> for ActionCode {
    type Error = ParseActionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse_token(&value)
    }
}

impl From<ActionCode> for String {
    fn from(code: ActionCode) -> Self {
        code.letter().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    #[serde(alias = "acknowledged")]
    Ack,
    #[serde(alias = "executed")]
    Completed,
    #[serde(alias = "failed")]
    Error,
}

impl CommandStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ack => "ack",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Completed and failed commands will not be picked up again.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl FromStr for CommandStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "ack" | "acknowledged" => Ok(Self::Ack),
            "completed" | "executed" => Ok(Self::Completed),
            "error" | "failed" => Ok(Self::Error),
            other => Err(format!("unknown command status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub id: u64,
    pub device_id: String,
    pub action: ActionCode,
    pub duration_ms: u64,
    pub location: String,
    #[serde(default)]
    pub metadata: Value,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Body of `POST /api/device-commands`. Everything but `action` has a default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueCommandRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandRequestError {
    #[error("Missing required field: action")]
    MissingAction,
    #[error(transparent)]
    InvalidAction(#[from] ParseActionError),
}

/// A validated command, ready to be stored with an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCommand {
    pub device_id: String,
    pub action: ActionCode,
    pub duration_ms: u64,
    pub location: String,
    pub metadata: Value,
}

impl QueueCommandRequest {
    pub fn validate(
        self,
        default_device: &str,
        default_duration_ms: u64,
    ) -> Result<NewCommand, CommandRequestError> {
        let raw = self
            .action
            .filter(|action| !action.trim().is_empty())
            .ok_or(CommandRequestError::MissingAction)?;
        let action = ActionCode::parse_token(&raw)?;

        Ok(NewCommand {
            device_id: non_empty_or(self.device_id, default_device),
            action,
            duration_ms: self.duration_ms.unwrap_or(default_duration_ms),
            location: non_empty_or(self.location, DEFAULT_LOCATION),
            metadata: self.metadata.unwrap_or(Value::Null),
        })
    }
}

impl NewCommand {
    pub fn into_record(self, id: u64, now: DateTime<Utc>) -> CommandRecord {
        CommandRecord {
            id,
            device_id: self.device_id,
            action: self.action,
            duration_ms: self.duration_ms,
            location: self.location,
            metadata: self.metadata,
            status: CommandStatus::Pending,
            created_at: now,
            updated_at: None,
            completed_at: None,
        }
    }

    /// History row written next to the queued command.
    pub fn audit_entry(&self) -> NewActionLog {
        NewActionLog {
            device_id: Some(self.device_id.clone()),
            action_type: Some(self.action.kind().to_string()),
            command: Some(self.action.letter().to_string()),
            duration_ms: Some(self.duration_ms),
            location: Some(self.location.clone()),
            metadata: Some(self.metadata.clone()),
        }
    }
}

/// Body of `PATCH /api/device-commands`, sent by the device once it ran a command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandUpdate {
    #[serde(default)]
    pub command_id: Option<u64>,
    #[serde(default)]
    pub status: Option<CommandStatus>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub id: u64,
    pub device_id: String,
    pub action_type: String,
    pub command: String,
    pub duration_ms: Option<u64>,
    pub location: String,
    #[serde(default)]
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewActionLog {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl NewActionLog {
    /// Fills gaps the caller left open. `action_type` is derived from the
    /// command letter when it is missing.
    pub fn into_entry(self, id: u64, default_device: &str, now: DateTime<Utc>) -> ActionLogEntry {
        let command = self.command.unwrap_or_default();
        let action_type = self.action_type.unwrap_or_else(|| {
            ActionCode::parse_token(&command)
                .map(|code| code.kind().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        });

        ActionLogEntry {
            id,
            device_id: non_empty_or(self.device_id, default_device),
            action_type,
            command,
            duration_ms: self.duration_ms,
            location: non_empty_or(self.location, DEFAULT_LOCATION),
            metadata: self.metadata.unwrap_or(Value::Null),
            timestamp: now,
        }
    }
}

fn non_empty_or(value: Option<String>, default: &str) -> String {
    value
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}
