use crate::device::Mutation;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const TURN_EV_CHARGING_ON: &str = "TurnEvChargingOn";
pub const TURN_EV_CHARGING_OFF: &str = "TurnEvChargingOff";

/// Why an inbound payload could not be decoded. Unknown commands are not
/// errors; they decode to [`Mutation::NoOp`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] core::str::Utf8Error),
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("payload is JSON but not an object")]
    NotAnObject,
}

/// Commands the remote control surface knows how to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteCommand {
    TurnEvChargingOn,
    TurnEvChargingOff,
}

impl RemoteCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            RemoteCommand::TurnEvChargingOn => TURN_EV_CHARGING_ON,
            RemoteCommand::TurnEvChargingOff => TURN_EV_CHARGING_OFF,
        }
    }

    pub fn mutation(self) -> Mutation {
        match self {
            RemoteCommand::TurnEvChargingOn => Mutation::SetCharging(true),
            RemoteCommand::TurnEvChargingOff => Mutation::SetCharging(false),
        }
    }

    /// Wire payload: `{"message":"<command>"}`.
    pub fn to_payload(self) -> Vec<u8> {
        InboundCommand {
            message: Some(self.as_str().to_string()),
        }
        .to_payload()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl InboundCommand {
    pub fn to_payload(&self) -> Vec<u8> {
        // A struct with one optional string field always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn mutation(&self) -> Mutation {
        match self.message.as_deref() {
            Some(TURN_EV_CHARGING_ON) => Mutation::SetCharging(true),
            Some(TURN_EV_CHARGING_OFF) => Mutation::SetCharging(false),
            _ => Mutation::NoOp,
        }
    }
}

/// Decodes the payload as UTF-8, then as a JSON object, and maps its
/// `message` field to a mutation. A `message` that is missing, not a string,
/// or not a known command yields [`Mutation::NoOp`].
pub fn interpret(raw: &[u8]) -> Result<Mutation, DecodeError> {
    decode(raw).map(|command| command.mutation())
}

pub fn decode(raw: &[u8]) -> Result<InboundCommand, DecodeError> {
    let text = core::str::from_utf8(raw)?;
    let value: Value = serde_json::from_str(text)?;
    let object = value.as_object().ok_or(DecodeError::NotAnObject)?;

    Ok(InboundCommand {
        message: object
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}
