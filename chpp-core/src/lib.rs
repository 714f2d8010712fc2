//! CHPP app-layer request/response correlation.
//! Transport-agnostic: the host supplies a [`Transport`] and a [`Clock`], feeds inbound
//! responses to [`AppContext::process_response`] and polls for synthesised timeouts.

pub mod app;
pub mod config;
pub mod endpoint;
pub mod message;
pub mod protocol;
pub mod request;
pub mod time;
pub mod transport;
pub mod wire;

mod scheduler;

#[cfg(test)]
mod testing;

pub use app::{AppContext, RegistrationError, RequestError};
pub use config::{Config, ConfigError};
pub use endpoint::{Endpoint, EndpointDescriptor, EndpointKind, OpenState, Version};
pub use protocol::{AppErrorCode, MessageType};
pub use request::{IncomingRequestState, OutgoingRequestState, ResponseError};
pub use time::{Clock, ManualClock, MonotonicClock, RequestTimeout, Timestamp};
pub use transport::{Transport, TransportError};
pub use wire::{AppHeader, HEADER_LEN};
