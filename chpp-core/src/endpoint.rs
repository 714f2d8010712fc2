//! Endpoints (clients and services): descriptors, open state, request slots and the sync-wait primitive.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use uuid::Uuid;

use crate::protocol::MessageType;
use crate::request::OutgoingRequestState;
use crate::time::Timestamp;

/// Which side of a client/service pair an endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    Client,
    Service,
}

impl EndpointKind {
    /// Type stamped on requests this endpoint sends.
    pub fn request_type(self) -> MessageType {
        match self {
            EndpointKind::Client => MessageType::ClientRequest,
            EndpointKind::Service => MessageType::ServiceRequest,
        }
    }

    /// Type of the responses answering this endpoint's requests.
    pub fn incoming_response_type(self) -> MessageType {
        match self {
            EndpointKind::Client => MessageType::ServiceResponse,
            EndpointKind::Service => MessageType::ClientResponse,
        }
    }

    pub fn notification_type(self) -> MessageType {
        match self {
            EndpointKind::Client => MessageType::ClientNotification,
            EndpointKind::Service => MessageType::ServiceNotification,
        }
    }

    /// Category whose requests a response of type `t` answers.
    pub fn answered_by(t: MessageType) -> Option<EndpointKind> {
        match t {
            MessageType::ServiceResponse => Some(EndpointKind::Client),
            MessageType::ClientResponse => Some(EndpointKind::Service),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u16,
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Static description of a client or service, supplied at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub uuid: Uuid,
    pub name: String,
    pub version: Version,
    /// Responses shorter than this are rejected.
    pub min_length: usize,
    /// Number of distinct request commands (one outgoing slot each).
    pub out_request_count: usize,
    /// Command whose response drives the open handshake, if the endpoint has one.
    pub open_command: Option<u16>,
}

impl EndpointDescriptor {
    pub fn new(name: impl Into<String>, uuid: Uuid, out_request_count: usize) -> Self {
        Self {
            uuid,
            name: name.into(),
            version: Version::default(),
            min_length: crate::wire::HEADER_LEN,
            out_request_count,
            open_command: None,
        }
    }

    pub fn with_version(mut self, major: u8, minor: u8, patch: u16) -> Self {
        self.version = Version {
            major,
            minor,
            patch,
        };
        self
    }

    pub fn with_min_length(mut self, min_length: usize) -> Self {
        self.min_length = min_length;
        self
    }

    pub fn with_open_command(mut self, command: u16) -> Self {
        assert!(
            usize::from(command) < self.out_request_count,
            "open command {command} outside {} request slots",
            self.out_request_count
        );
        self.open_command = Some(command);
        self
    }
}

/// Open handshake progress of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenState {
    #[default]
    Closed,
    /// Open request sent, response pending.
    Opening,
    /// A caller observed `Opening` and was let through without a second open request.
    WaitingToOpen,
    Opened,
}

/// Mutable endpoint record. Guarded by `Endpoint::state`; taken after the category lock.
#[derive(Debug)]
pub(crate) struct EndpointState {
    pub(crate) handle: u8,
    pub(crate) open_state: OpenState,
    pub(crate) initialized: bool,
    pub(crate) ever_initialized: bool,
    pub(crate) pseudo_open: bool,
    pub(crate) next_transaction: u8,
    pub(crate) out_reqs: Vec<OutgoingRequestState>,
    /// Earliest deadline among this endpoint's slots.
    pub(crate) next_timer_timeout: Timestamp,
}

impl EndpointState {
    pub(crate) fn slot_mut(&mut self, command: u16) -> &mut OutgoingRequestState {
        let count = self.out_reqs.len();
        self.out_reqs.get_mut(usize::from(command)).unwrap_or_else(|| {
            panic!("cmd={command} outside {count} request slots")
        })
    }

    pub(crate) fn refresh_next_timer_timeout(&mut self) {
        self.next_timer_timeout = self
            .out_reqs
            .iter()
            .map(|s| s.timeout)
            .min()
            .unwrap_or(Timestamp::MAX);
    }
}

/// Ready flag + condition variable a blocking sender parks on.
#[derive(Debug, Default)]
pub(crate) struct SyncResponse {
    ready: Mutex<bool>,
    cond: Condvar,
}

impl SyncResponse {
    pub(crate) fn reset(&self) {
        *self.ready.lock() = false;
    }

    pub(crate) fn notify(&self) {
        let mut ready = self.ready.lock();
        *ready = true;
        self.cond.notify_all();
    }

    /// Block until notified or `timeout` elapses. Returns whether the flag was set.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut ready = self.ready.lock();
        while !*ready {
            match deadline {
                Some(d) => {
                    if self.cond.wait_until(&mut ready, d).timed_out() {
                        break;
                    }
                }
                None => self.cond.wait(&mut ready),
            }
        }
        *ready
    }
}

/// A registered client or service.
///
/// Owned by its [`AppContext`](crate::app::AppContext) registry and shared with the
/// caller as `Arc<Endpoint>`. All operations go through the context.
#[derive(Debug)]
pub struct Endpoint {
    kind: EndpointKind,
    index: usize,
    owner: u64,
    descriptor: EndpointDescriptor,
    pub(crate) state: Mutex<EndpointState>,
    sync: OnceLock<SyncResponse>,
}

impl Endpoint {
    pub(crate) fn new(
        kind: EndpointKind,
        index: usize,
        owner: u64,
        handle: u8,
        descriptor: EndpointDescriptor,
    ) -> Self {
        let out_reqs = vec![OutgoingRequestState::IDLE; descriptor.out_request_count];
        Self {
            kind,
            index,
            owner,
            descriptor,
            state: Mutex::new(EndpointState {
                handle,
                open_state: OpenState::Closed,
                initialized: false,
                ever_initialized: false,
                pseudo_open: false,
                next_transaction: 0,
                out_reqs,
                next_timer_timeout: Timestamp::MAX,
            }),
            sync: OnceLock::new(),
        }
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    /// Position in the registration table of its category.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    /// `HANDLE_NONE` for a client that was never matched.
    pub fn handle(&self) -> u8 {
        self.state.lock().handle
    }

    pub fn open_state(&self) -> OpenState {
        self.state.lock().open_state
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    pub fn is_pseudo_open(&self) -> bool {
        self.state.lock().pseudo_open
    }

    /// Snapshot of the slot for `command`. Panics if the endpoint has no such slot.
    pub fn request_state(&self, command: u16) -> OutgoingRequestState {
        *self.state.lock().slot_mut(command)
    }

    /// Earliest pending deadline of this endpoint, `None` if nothing is pending.
    pub fn next_timer_timeout(&self) -> Option<Timestamp> {
        let t = self.state.lock().next_timer_timeout;
        (t != Timestamp::MAX).then_some(t)
    }

    pub(crate) fn owner(&self) -> u64 {
        self.owner
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EndpointState> {
        self.state.lock()
    }

    /// Create the sync-wait primitive. Only the first call has an effect.
    pub(crate) fn init_sync(&self) {
        let _ = self.sync.get_or_init(SyncResponse::default);
    }

    pub(crate) fn sync(&self) -> Option<&SyncResponse> {
        self.sync.get()
    }

    /// Take the next transaction id for an outgoing request.
    pub(crate) fn next_transaction(&self) -> (u8, u8) {
        let mut st = self.state.lock();
        let id = st.next_transaction;
        st.next_transaction = id.wrapping_add(1);
        (st.handle, id)
    }
}
