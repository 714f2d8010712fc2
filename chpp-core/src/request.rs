//! Per-command request slots: outgoing (we asked, awaiting an answer) and incoming (we were asked).

use std::time::Duration;

use tracing::{debug, error, warn};

use crate::time::{RequestTimeout, Timestamp};
use crate::wire::AppHeader;

/// Bookkeeping for the latest request sent on one command slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutgoingRequestState {
    /// When the request was sent; `None` if the slot never carried one (or it was cancelled).
    pub request_time: Option<Timestamp>,
    /// When the matching response arrived; `None` while outstanding.
    pub response_time: Option<Timestamp>,
    /// Absolute deadline; `Timestamp::MAX` when none is pending.
    pub timeout: Timestamp,
    /// Transaction id the response must echo.
    pub transaction: u8,
}

impl OutgoingRequestState {
    pub const IDLE: OutgoingRequestState = OutgoingRequestState {
        request_time: None,
        response_time: None,
        timeout: Timestamp::MAX,
        transaction: 0,
    };

    /// Sent and not yet answered.
    pub fn is_outstanding(&self) -> bool {
        self.request_time.is_some() && self.response_time.is_none()
    }

    /// Round-trip time of the last answered request.
    pub fn rtt(&self) -> Option<Duration> {
        match (self.request_time, self.response_time) {
            (Some(req), Some(resp)) => Some(resp - req),
            _ => None,
        }
    }

    /// Start tracking a new request. Returns the transaction it supersedes, if one was still pending.
    pub(crate) fn record_request(
        &mut self,
        transaction: u8,
        now: Timestamp,
        timeout: RequestTimeout,
    ) -> Option<u8> {
        let superseded = self.is_outstanding().then_some(self.transaction);
        self.request_time = Some(now);
        self.response_time = None;
        self.timeout = timeout.deadline_from(now);
        self.transaction = transaction;
        superseded
    }

    /// Accept the response to the outstanding request. Rejections leave the slot untouched.
    pub(crate) fn record_response(
        &mut self,
        header: &AppHeader,
        now: Timestamp,
    ) -> Result<Duration, ResponseError> {
        let Some(sent_at) = self.request_time else {
            return Err(ResponseError::NoOutstandingRequest {
                handle: header.handle,
                command: header.command,
            });
        };
        if self.response_time.is_some() {
            return Err(ResponseError::Duplicate {
                handle: header.handle,
                command: header.command,
                transaction: header.transaction,
            });
        }
        if header.transaction != self.transaction {
            return Err(ResponseError::TransactionMismatch {
                handle: header.handle,
                command: header.command,
                expected: self.transaction,
                received: header.transaction,
            });
        }
        self.response_time = Some(now);
        self.timeout = Timestamp::MAX;
        Ok(now - sent_at)
    }

    /// Forget the outstanding request without recording a response.
    pub(crate) fn clear(&mut self) {
        self.request_time = None;
        self.response_time = None;
        self.timeout = Timestamp::MAX;
    }
}

impl Default for OutgoingRequestState {
    fn default() -> Self {
        Self::IDLE
    }
}

/// Why a response was not matched to a request.
#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    #[error("response H#{handle} cmd={command} with no outstanding request")]
    NoOutstandingRequest { handle: u8, command: u16 },
    #[error("response H#{handle} cmd={command} ID={received} does not match pending ID={expected}")]
    TransactionMismatch {
        handle: u8,
        command: u16,
        expected: u8,
        received: u8,
    },
    #[error("duplicate response H#{handle} cmd={command} ID={transaction}")]
    Duplicate {
        handle: u8,
        command: u16,
        transaction: u8,
    },
    #[error("no endpoint holds handle H#{0}")]
    UnknownHandle(u8),
    #[error("H#{handle} has no request slot for cmd={command}")]
    InvalidCommand { handle: u8, command: u16 },
    #[error("response of {len} bytes shorter than minimum {min}")]
    TooShort { len: usize, min: usize },
    #[error("datagram is not a response")]
    NotAResponse,
    #[error(transparent)]
    Header(#[from] crate::wire::HeaderDecodeError),
}

/// Bookkeeping for the latest request received on one command slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IncomingRequestState {
    pub request_time: Option<Timestamp>,
    pub response_time: Option<Timestamp>,
    pub transaction: u8,
}

impl IncomingRequestState {
    pub(crate) fn record_request(&mut self, header: &AppHeader, now: Timestamp) {
        if let (Some(t), None) = (self.request_time, self.response_time) {
            error!(
                handle = header.handle,
                command = header.command,
                previous_ms = t.as_millis(),
                "RX dupe request"
            );
        }
        self.request_time = Some(now);
        self.response_time = None;
        self.transaction = header.transaction;
    }

    pub(crate) fn record_response(&mut self, header: &AppHeader, now: Timestamp) {
        let previous = self.response_time.replace(now);
        match (self.request_time, previous) {
            (None, _) => error!(
                handle = header.handle,
                command = header.command,
                "TX response with no request"
            ),
            (Some(_), Some(prev)) => warn!(
                handle = header.handle,
                command = header.command,
                previous_ms = prev.as_millis(),
                "TX additional response"
            ),
            (Some(req), None) => debug!(
                handle = header.handle,
                command = header.command,
                service_time_ns = (now - req).as_nanos() as u64,
                "TX initial response"
            ),
        }
    }
}
