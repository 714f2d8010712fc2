//! Builders for header-prefixed datagrams: requests, responses, notifications.

use serde::{de::DeserializeOwned, Serialize};

use crate::endpoint::{Endpoint, EndpointKind};
use crate::protocol::AppErrorCode;
use crate::wire::{AppHeader, HeaderDecodeError, HeaderEncodeError, HEADER_LEN};

/// Request on `command` from `endpoint` with a zeroed payload of `payload_len` bytes.
/// Takes the endpoint's next transaction id.
pub fn request(
    endpoint: &Endpoint,
    command: u16,
    payload_len: usize,
) -> Result<Vec<u8>, MessageError> {
    let (handle, transaction) = endpoint.next_transaction();
    let header = AppHeader {
        handle,
        message_type: endpoint.kind().request_type(),
        transaction,
        error: AppErrorCode::None,
        command,
    };
    with_zeroed_payload(&header, payload_len)
}

/// Request whose payload is a fixed part followed by `count` array elements.
pub fn request_array(
    endpoint: &Endpoint,
    command: u16,
    fixed_len: usize,
    count: usize,
    element_len: usize,
) -> Result<Vec<u8>, MessageError> {
    let tail = count
        .checked_mul(element_len)
        .and_then(|t| t.checked_add(fixed_len))
        .ok_or(MessageError::TooLarge)?;
    request(endpoint, command, tail)
}

/// Request carrying `payload` serialised with bincode.
pub fn request_typed<T: Serialize>(
    endpoint: &Endpoint,
    command: u16,
    payload: &T,
) -> Result<Vec<u8>, MessageError> {
    let body = bincode::serialize(payload).map_err(MessageError::Payload)?;
    let mut out = request(endpoint, command, 0)?;
    out.extend_from_slice(&body);
    Ok(out)
}

/// Response answering `request_header`: same handle, transaction and command, error `None`.
pub fn response(request_header: &AppHeader, payload_len: usize) -> Result<Vec<u8>, MessageError> {
    with_zeroed_payload(&response_header(request_header)?, payload_len)
}

/// Response answering `request_header` with an error code and no payload.
pub fn error_response(
    request_header: &AppHeader,
    error: AppErrorCode,
) -> Result<Vec<u8>, MessageError> {
    let header = AppHeader {
        error,
        ..response_header(request_header)?
    };
    with_zeroed_payload(&header, 0)
}

/// Response carrying `payload` serialised with bincode.
pub fn response_typed<T: Serialize>(
    request_header: &AppHeader,
    payload: &T,
) -> Result<Vec<u8>, MessageError> {
    let body = bincode::serialize(payload).map_err(MessageError::Payload)?;
    let mut out = response(request_header, 0)?;
    out.extend_from_slice(&body);
    Ok(out)
}

/// Unsolicited notification from an endpoint of `kind`.
pub fn notification(
    kind: EndpointKind,
    handle: u8,
    command: u16,
    payload_len: usize,
) -> Result<Vec<u8>, MessageError> {
    let header = AppHeader {
        handle,
        message_type: kind.notification_type(),
        transaction: 0,
        error: AppErrorCode::None,
        command,
    };
    with_zeroed_payload(&header, payload_len)
}

/// Decode the bincode payload that follows the header.
pub fn read_payload<T: DeserializeOwned>(datagram: &[u8]) -> Result<T, MessageError> {
    if datagram.len() < HEADER_LEN {
        return Err(MessageError::Header(HeaderDecodeError::TooShort(
            datagram.len(),
        )));
    }
    bincode::deserialize(&datagram[HEADER_LEN..]).map_err(MessageError::Payload)
}

fn response_header(request_header: &AppHeader) -> Result<AppHeader, MessageError> {
    let message_type = request_header
        .message_type
        .response_type()
        .ok_or(MessageError::NotARequest)?;
    Ok(AppHeader {
        message_type,
        error: AppErrorCode::None,
        ..*request_header
    })
}

fn with_zeroed_payload(header: &AppHeader, payload_len: usize) -> Result<Vec<u8>, MessageError> {
    let total = HEADER_LEN
        .checked_add(payload_len)
        .ok_or(MessageError::TooLarge)?;
    let mut out = vec![0u8; total];
    header.write_into(&mut out)?;
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("message size overflows")]
    TooLarge,
    #[error("header is not a request")]
    NotARequest,
    #[error("payload codec error: {0}")]
    Payload(bincode::Error),
    #[error(transparent)]
    HeaderEncode(#[from] HeaderEncodeError),
    #[error(transparent)]
    Header(#[from] HeaderDecodeError),
}
