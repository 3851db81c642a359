//! Driver ↔ client control protocol.
//!
//! Commands flow client → driver over the many-to-one command ring;
//! events flow driver → clients over the broadcast buffer. Each record
//! carries a message-type id from [`msg_type`] and a postcard-serialized
//! body. Every command carries the client's id (for liveness tracking)
//! and a correlation id that the driver echoes in exactly one response.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Record type ids on the command ring and the broadcast buffer.
pub mod msg_type {
    pub const ADD_PUBLICATION: u32 = 0x01;
    pub const REMOVE_PUBLICATION: u32 = 0x02;
    pub const ADD_SUBSCRIPTION: u32 = 0x03;
    pub const REMOVE_SUBSCRIPTION: u32 = 0x04;
    pub const CLIENT_KEEPALIVE: u32 = 0x05;

    pub const ON_NEW_PUBLICATION: u32 = 0x10;
    pub const ON_NEW_IMAGE: u32 = 0x11;
    pub const OPERATION_SUCCEEDED: u32 = 0x12;
    pub const ERROR_RESPONSE: u32 = 0x13;
    pub const ON_INACTIVE_IMAGE: u32 = 0x14;
}

/// Errors surfaced to a specific client, echoing its correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    PublicationChannelAlreadyExists,
    InvalidDestinationInPublication,
    PublicationChannelUnknown,
    GenericError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::PublicationChannelAlreadyExists => "publication channel already exists",
            Self::InvalidDestinationInPublication => "invalid destination in publication",
            Self::PublicationChannelUnknown => "publication channel unknown",
            Self::GenericError => "generic error",
        };
        f.write_str(name)
    }
}

/// Errors encoding or decoding control records.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control codec: {0}")]
    Codec(#[from] postcard::Error),
    #[error("unknown control message type 0x{0:02x}")]
    UnknownMsgType(u32),
}

/// `ADD_PUBLICATION` / `REMOVE_PUBLICATION` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationCommand {
    pub client_id: u64,
    pub correlation_id: u64,
    pub channel: String,
    pub stream_id: u32,
}

/// `ADD_SUBSCRIPTION` / `REMOVE_SUBSCRIPTION` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionCommand {
    pub client_id: u64,
    pub correlation_id: u64,
    pub channel: String,
    pub stream_id: u32,
}

/// `CLIENT_KEEPALIVE` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepaliveCommand {
    pub client_id: u64,
}

/// A decoded client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    AddPublication(PublicationCommand),
    RemovePublication(PublicationCommand),
    AddSubscription(SubscriptionCommand),
    RemoveSubscription(SubscriptionCommand),
    ClientKeepalive(KeepaliveCommand),
}

impl ClientCommand {
    /// Decodes a ring record into a command.
    pub fn decode(msg_type_id: u32, body: &[u8]) -> Result<Self, ControlError> {
        Ok(match msg_type_id {
            msg_type::ADD_PUBLICATION => Self::AddPublication(postcard::from_bytes(body)?),
            msg_type::REMOVE_PUBLICATION => Self::RemovePublication(postcard::from_bytes(body)?),
            msg_type::ADD_SUBSCRIPTION => Self::AddSubscription(postcard::from_bytes(body)?),
            msg_type::REMOVE_SUBSCRIPTION => Self::RemoveSubscription(postcard::from_bytes(body)?),
            msg_type::CLIENT_KEEPALIVE => Self::ClientKeepalive(postcard::from_bytes(body)?),
            other => return Err(ControlError::UnknownMsgType(other)),
        })
    }
}

/// `ON_NEW_PUBLICATION` body: everything a publisher needs to map and
/// drive its log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPublicationEvent {
    pub correlation_id: u64,
    pub session_id: u32,
    pub stream_id: u32,
    pub channel: String,
    pub initial_term_id: u32,
    pub log_dir: String,
    pub sender_position_counter: u32,
    pub limit_counter: u32,
}

/// `ON_NEW_IMAGE` body: a connected subscription's log and counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewImageEvent {
    pub correlation_id: u64,
    pub session_id: u32,
    pub stream_id: u32,
    pub channel: String,
    pub initial_term_id: u32,
    pub join_position: u64,
    pub log_dir: String,
    pub subscriber_position_counter: u32,
    pub source: String,
}

/// `ON_INACTIVE_IMAGE` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InactiveImageEvent {
    pub correlation_id: u64,
    pub session_id: u32,
    pub stream_id: u32,
    pub channel: String,
}

/// `OPERATION_SUCCEEDED` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSucceededEvent {
    pub correlation_id: u64,
}

/// `ERROR_RESPONSE` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponseEvent {
    pub correlation_id: u64,
    pub code: ErrorCode,
    pub message: String,
}

/// A decoded driver event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    NewPublication(NewPublicationEvent),
    NewImage(NewImageEvent),
    InactiveImage(InactiveImageEvent),
    OperationSucceeded(OperationSucceededEvent),
    ErrorResponse(ErrorResponseEvent),
}

impl DriverEvent {
    /// Decodes a broadcast record into an event.
    pub fn decode(msg_type_id: u32, body: &[u8]) -> Result<Self, ControlError> {
        Ok(match msg_type_id {
            msg_type::ON_NEW_PUBLICATION => Self::NewPublication(postcard::from_bytes(body)?),
            msg_type::ON_NEW_IMAGE => Self::NewImage(postcard::from_bytes(body)?),
            msg_type::ON_INACTIVE_IMAGE => Self::InactiveImage(postcard::from_bytes(body)?),
            msg_type::OPERATION_SUCCEEDED => Self::OperationSucceeded(postcard::from_bytes(body)?),
            msg_type::ERROR_RESPONSE => Self::ErrorResponse(postcard::from_bytes(body)?),
            other => return Err(ControlError::UnknownMsgType(other)),
        })
    }
}

/// Serializes a control body to bytes.
pub fn encode<T: Serialize>(body: &T) -> Result<Vec<u8>, ControlError> {
    Ok(postcard::to_stdvec(body)?)
}
