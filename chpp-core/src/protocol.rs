//! CHPP app layer: message types, error codes and reserved handles.

use serde::{Deserialize, Serialize};

/// Handle value meaning "no handle assigned".
pub const HANDLE_NONE: u8 = 0x00;
/// Reserved handle of the loopback endpoint.
pub const HANDLE_LOOPBACK: u8 = 0x01;
/// Reserved handle of the time-sync endpoint.
pub const HANDLE_TIMESYNC: u8 = 0x02;
/// Reserved handle of the discovery endpoint.
pub const HANDLE_DISCOVERY: u8 = 0x0F;
/// First handle handed out to negotiated (registered) services.
pub const HANDLE_NEGOTIATED_RANGE_START: u8 = 0x10;

/// Handle of the service registered at `index`. `None` past the end of the handle space.
pub fn service_handle_of_index(index: usize) -> Option<u8> {
    u8::try_from(index)
        .ok()
        .and_then(|i| HANDLE_NEGOTIATED_RANGE_START.checked_add(i))
}

/// Registration index of the service owning `handle`, if it is a negotiated handle.
pub fn service_index_of_handle(handle: u8) -> Option<usize> {
    handle
        .checked_sub(HANDLE_NEGOTIATED_RANGE_START)
        .map(usize::from)
}

/// All app-layer message kinds. Encoded as one byte; a response is always `request + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MessageType {
    /// Request from a client to a service.
    ClientRequest = 0,
    /// Response from a service to a client request.
    ServiceResponse = 1,
    /// Notification from a client to a service.
    ClientNotification = 2,
    /// Notification from a service to a client.
    ServiceNotification = 3,
    /// Request from a service to a client.
    ServiceRequest = 4,
    /// Response from a client to a service request.
    ClientResponse = 5,
}

impl MessageType {
    /// Response type answering this request type. `None` for responses and notifications.
    pub fn response_type(self) -> Option<MessageType> {
        match self {
            MessageType::ClientRequest => Some(MessageType::ServiceResponse),
            MessageType::ServiceRequest => Some(MessageType::ClientResponse),
            _ => None,
        }
    }

    pub fn is_request(self) -> bool {
        matches!(self, MessageType::ClientRequest | MessageType::ServiceRequest)
    }

    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageType::ServiceResponse | MessageType::ClientResponse
        )
    }
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        t as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = UnknownMessageType;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => MessageType::ClientRequest,
            1 => MessageType::ServiceResponse,
            2 => MessageType::ClientNotification,
            3 => MessageType::ServiceNotification,
            4 => MessageType::ServiceRequest,
            5 => MessageType::ClientResponse,
            other => return Err(UnknownMessageType(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown message type {0:#04x}")]
pub struct UnknownMessageType(pub u8);

/// Application-level error carried in every header. `None` on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", from = "u8")]
#[repr(u8)]
pub enum AppErrorCode {
    None = 0,
    InvalidCommand = 1,
    InvalidArg = 2,
    Busy = 3,
    OutOfMemory = 4,
    Unsupported = 5,
    /// Synthesised locally when no response arrived before the request deadline.
    Timeout = 6,
    Disabled = 7,
    RateLimited = 8,
    Blocked = 9,
    InvalidLength = 10,
    NotReady = 11,
    BeyondChre = 12,
    /// Synthesised locally for requests still outstanding when the link resets.
    Aborted = 13,
    Unspecified = 0xFF,
}

impl AppErrorCode {
    pub fn is_error(self) -> bool {
        self != AppErrorCode::None
    }
}

impl From<AppErrorCode> for u8 {
    fn from(e: AppErrorCode) -> u8 {
        e as u8
    }
}

/// Unknown codes from the remote side collapse into `Unspecified`.
impl From<u8> for AppErrorCode {
    fn from(v: u8) -> Self {
        match v {
            0 => AppErrorCode::None,
            1 => AppErrorCode::InvalidCommand,
            2 => AppErrorCode::InvalidArg,
            3 => AppErrorCode::Busy,
            4 => AppErrorCode::OutOfMemory,
            5 => AppErrorCode::Unsupported,
            6 => AppErrorCode::Timeout,
            7 => AppErrorCode::Disabled,
            8 => AppErrorCode::RateLimited,
            9 => AppErrorCode::Blocked,
            10 => AppErrorCode::InvalidLength,
            11 => AppErrorCode::NotReady,
            12 => AppErrorCode::BeyondChre,
            13 => AppErrorCode::Aborted,
            _ => AppErrorCode::Unspecified,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_is_request_plus_one() {
        for t in [MessageType::ClientRequest, MessageType::ServiceRequest] {
            let r = t.response_type().unwrap();
            assert_eq!(u8::from(r), u8::from(t) + 1);
            assert!(r.is_response());
        }
        assert_eq!(MessageType::ServiceResponse.response_type(), None);
        assert_eq!(MessageType::ClientNotification.response_type(), None);
    }

    #[test]
    fn unknown_message_type_rejected() {
        assert_eq!(MessageType::try_from(6), Err(UnknownMessageType(6)));
    }

    #[test]
    fn unknown_error_code_is_unspecified() {
        assert_eq!(AppErrorCode::from(0x42), AppErrorCode::Unspecified);
        assert_eq!(AppErrorCode::from(6), AppErrorCode::Timeout);
    }

    #[test]
    fn service_handles_start_at_negotiated_range() {
        assert_eq!(service_handle_of_index(0), Some(0x10));
        assert_eq!(service_handle_of_index(239), Some(0xFF));
        assert_eq!(service_handle_of_index(240), None);
        assert_eq!(service_handle_of_index(usize::MAX), None);
        assert_eq!(service_index_of_handle(0x12), Some(2));
        assert_eq!(service_index_of_handle(HANDLE_DISCOVERY), None);
    }
}
