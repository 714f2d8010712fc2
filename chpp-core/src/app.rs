//! App-layer context: endpoint registration, the open handshake, request/response
//! correlation and timeout synthesis.
//!
//! Callers (one thread per API invocation) send requests; the transport worker
//! delivers responses through [`AppContext::process_response`] and polls
//! [`AppContext::get_request_timeout_response`] before it blocks, using
//! [`AppContext::next_request_timeout`] as its wake deadline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigError};
use crate::endpoint::{Endpoint, EndpointDescriptor, EndpointKind, OpenState};
use crate::message::{self, MessageError};
use crate::protocol::{self, AppErrorCode, HANDLE_NONE};
use crate::request::{IncomingRequestState, ResponseError};
use crate::scheduler::RequestScheduler;
use crate::time::{Clock, RequestTimeout, Timestamp};
use crate::transport::{Transport, TransportError};
use crate::wire::{AppHeader, HeaderDecodeError};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Owns the client and service registries and the collaborators they talk through.
pub struct AppContext<T: Transport, C: Clock> {
    id: u64,
    config: Config,
    transport: T,
    clock: C,
    clients: Mutex<RequestScheduler>,
    services: Mutex<RequestScheduler>,
}

impl<T: Transport, C: Clock> AppContext<T, C> {
    /// Fails if `config` does not validate.
    pub fn new(config: Config, transport: T, clock: C) -> Result<Self, ConfigError> {
        config.validate()?;
        let clients = RequestScheduler::new(EndpointKind::Client, config.max_clients);
        let services = RequestScheduler::new(EndpointKind::Service, config.max_services);
        Ok(Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            config,
            transport,
            clock,
            clients: Mutex::new(clients),
            services: Mutex::new(services),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    fn scheduler(&self, kind: EndpointKind) -> &Mutex<RequestScheduler> {
        match kind {
            EndpointKind::Client => &self.clients,
            EndpointKind::Service => &self.services,
        }
    }

    fn check_owner(&self, endpoint: &Endpoint) {
        assert_eq!(
            endpoint.owner(),
            self.id,
            "{:?} #{} belongs to another app context",
            endpoint.kind(),
            endpoint.index()
        );
    }

    /// Add a client to the registration table. It gets a handle when matched ([`init_client`](Self::init_client)).
    pub fn register_client(
        &self,
        descriptor: EndpointDescriptor,
    ) -> Result<Arc<Endpoint>, RegistrationError> {
        self.register(EndpointKind::Client, descriptor)
    }

    /// Add a service to the registration table. Services get their handle and
    /// sync-wait primitive immediately since they are never matched.
    pub fn register_service(
        &self,
        descriptor: EndpointDescriptor,
    ) -> Result<Arc<Endpoint>, RegistrationError> {
        self.register(EndpointKind::Service, descriptor)
    }

    fn register(
        &self,
        kind: EndpointKind,
        descriptor: EndpointDescriptor,
    ) -> Result<Arc<Endpoint>, RegistrationError> {
        let mut sched = self.scheduler(kind).lock();
        if sched.is_full() {
            error!(
                ?kind,
                max = sched.capacity(),
                name = %descriptor.name,
                "Max endpoints registered"
            );
            return Err(RegistrationError::Full {
                kind,
                capacity: sched.capacity(),
            });
        }
        let index = sched.len();
        let handle = match kind {
            EndpointKind::Client => Some(HANDLE_NONE),
            EndpointKind::Service => protocol::service_handle_of_index(index),
        };
        let Some(handle) = handle else {
            error!(index, name = %descriptor.name, "No service handle left");
            return Err(RegistrationError::Full { kind, capacity: index });
        };
        let endpoint = Arc::new(Endpoint::new(kind, index, self.id, handle, descriptor));
        if kind == EndpointKind::Service {
            endpoint.init_sync();
            let mut st = endpoint.lock();
            st.initialized = true;
            st.ever_initialized = true;
        }
        sched.push(endpoint.clone());
        let d = endpoint.descriptor();
        debug!(
            ?kind,
            index,
            handle,
            name = %d.name,
            uuid = %d.uuid,
            version = %d.version,
            min_len = d.min_length,
            "Registered endpoint"
        );
        Ok(endpoint)
    }

    /// Registered endpoints of `kind`, in registration order.
    pub fn endpoints(&self, kind: EndpointKind) -> Vec<Arc<Endpoint>> {
        self.scheduler(kind).lock().endpoints().to_vec()
    }

    /// Initialised client currently holding `handle`.
    pub fn client_by_handle(&self, handle: u8) -> Option<Arc<Endpoint>> {
        self.clients
            .lock()
            .endpoints()
            .iter()
            .find(|ep| {
                let st = ep.lock();
                st.initialized && st.handle == handle
            })
            .cloned()
    }

    pub fn service_by_handle(&self, handle: u8) -> Option<Arc<Endpoint>> {
        let index = protocol::service_index_of_handle(handle)?;
        self.services.lock().get(index).cloned()
    }

    /// Bind a matched client to `handle`. Panics if the client is already initialised.
    pub fn init_client(&self, client: &Endpoint, handle: u8) {
        self.check_owner(client);
        assert_eq!(client.kind(), EndpointKind::Client, "init_client on a service");
        let mut st = client.lock();
        assert!(!st.initialized, "Client H#{handle} already initialized");
        if !st.ever_initialized {
            client.init_sync();
            st.ever_initialized = true;
        }
        st.handle = handle;
        st.initialized = true;
        debug!(index = client.index(), handle, "Client initialized");
    }

    /// Unbind a client: drop its outstanding requests and close it.
    pub fn deinit_client(&self, client: &Endpoint) {
        self.check_owner(client);
        assert!(
            client.is_initialized(),
            "Client #{} deinit while not initialized",
            client.index()
        );
        self.clients.lock().clear_endpoint(client);
        let mut st = client.lock();
        st.initialized = false;
        st.open_state = OpenState::Closed;
        st.pseudo_open = false;
        debug!(index = client.index(), handle = st.handle, "Client deinitialized");
    }

    /// Whether `endpoint` may send a request now.
    ///
    /// A client seen `Opening` is let through once and moved to `WaitingToOpen`,
    /// so an overlapping caller rides along the in-flight open.
    /// Services have no handshake and are ready once registered.
    pub fn is_api_ready(&self, endpoint: &Endpoint) -> bool {
        self.check_owner(endpoint);
        let mut st = endpoint.lock();
        if endpoint.kind() == EndpointKind::Service {
            return st.initialized;
        }
        let ready = st.initialized
            && match st.open_state {
                OpenState::Closed | OpenState::WaitingToOpen => false,
                OpenState::Opened => true,
                OpenState::Opening => {
                    st.open_state = OpenState::WaitingToOpen;
                    true
                }
            };
        if !ready {
            error!(
                handle = st.handle,
                ever_initialized = st.ever_initialized,
                initialized = st.initialized,
                open_state = ?st.open_state,
                "Client not ready"
            );
        }
        ready
    }

    /// Gate a send on [`is_api_ready`](Self::is_api_ready). A closed client that
    /// claims to be initialised points to a broken link: the transport is reset.
    fn ensure_ready(&self, endpoint: &Endpoint) -> Result<(), RequestError> {
        if self.is_api_ready(endpoint) {
            return Ok(());
        }
        let (handle, state, initialized) = {
            let st = endpoint.lock();
            (st.handle, st.open_state, st.initialized)
        };
        if initialized && state == OpenState::Closed {
            warn!(handle, "Request on closed client, resetting transport");
            self.transport.force_reset();
            return Err(RequestError::LinkClosed { handle });
        }
        Err(RequestError::NotReady { handle, state })
    }

    /// Timestamp `datagram` as an outstanding request on its command slot and enqueue it.
    ///
    /// Fails without enqueueing when the endpoint is not ready; fails and leaves the
    /// slot idle when the transport rejects the datagram.
    pub fn send_timestamped_request(
        &self,
        endpoint: &Endpoint,
        datagram: Vec<u8>,
        timeout: RequestTimeout,
    ) -> Result<(), RequestError> {
        self.check_owner(endpoint);
        let header = AppHeader::decode(&datagram)?;
        self.ensure_ready(endpoint)?;
        self.send_tracked(endpoint, &header, datagram, timeout)
    }

    /// Blocking send with the configured default wait.
    pub fn send_timestamped_request_and_wait(
        &self,
        endpoint: &Endpoint,
        datagram: Vec<u8>,
    ) -> Result<(), RequestError> {
        let wait = self.config.default_request_timeout();
        self.send_timestamped_request_and_wait_timeout(endpoint, datagram, wait)
    }

    /// Send with no scheduler deadline and block until the response arrives or `wait` elapses.
    ///
    /// Giving up the wait does not cancel the request: a late response still resolves the slot.
    pub fn send_timestamped_request_and_wait_timeout(
        &self,
        endpoint: &Endpoint,
        datagram: Vec<u8>,
        wait: Duration,
    ) -> Result<(), RequestError> {
        self.send_timestamped_request(endpoint, datagram, RequestTimeout::Infinite)?;
        self.wait_for_response(endpoint, wait)
    }

    fn wait_for_response(&self, endpoint: &Endpoint, wait: Duration) -> Result<(), RequestError> {
        let Some(sync) = endpoint.sync() else {
            return Err(RequestError::NotReady {
                handle: endpoint.handle(),
                state: endpoint.open_state(),
            });
        };
        if sync.wait(wait) {
            Ok(())
        } else {
            error!(
                handle = endpoint.handle(),
                wait_ms = wait.as_millis() as u64,
                "Response timeout"
            );
            Err(RequestError::ResponseTimeout(wait))
        }
    }

    fn send_tracked(
        &self,
        endpoint: &Endpoint,
        header: &AppHeader,
        datagram: Vec<u8>,
        timeout: RequestTimeout,
    ) -> Result<(), RequestError> {
        assert_eq!(
            header.message_type,
            endpoint.kind().request_type(),
            "{:?} #{} sending a {:?}",
            endpoint.kind(),
            endpoint.index(),
            header.message_type
        );
        assert_eq!(
            header.handle,
            endpoint.handle(),
            "{:?} #{} request built for another handle",
            endpoint.kind(),
            endpoint.index()
        );
        let now = self.clock.now();
        self.scheduler(endpoint.kind()).lock().track(
            endpoint,
            header.command,
            header.transaction,
            now,
            timeout,
        );
        if let Some(sync) = endpoint.sync() {
            sync.reset();
        }
        if let Err(e) = self.transport.enqueue(datagram) {
            error!(
                handle = header.handle,
                command = header.command,
                transaction = header.transaction,
                error = %e,
                "Enqueue failed"
            );
            self.scheduler(endpoint.kind()).lock().cancel(
                endpoint,
                header.command,
                header.transaction,
            );
            return Err(RequestError::Transport(e));
        }
        Ok(())
    }

    /// Start the open handshake of a client.
    ///
    /// The open request itself bypasses the readiness gate; the client sits in
    /// `Opening` until the response arrives. Blocking: waits for the response and
    /// returns whether the client ended `Opened`, forcing `Closed` otherwise.
    /// Non-blocking: the response (or its synthesised timeout) sets the state later.
    pub fn send_open_request(&self, client: &Endpoint, blocking: bool) -> Result<(), RequestError> {
        self.check_owner(client);
        let open_command = client.descriptor().open_command.unwrap_or_else(|| {
            panic!("{} has no open command", client.descriptor().name)
        });
        {
            let st = client.lock();
            assert_ne!(
                st.open_state,
                OpenState::Opened,
                "Client H#{} already opened",
                st.handle
            );
            if !st.initialized {
                error!(index = client.index(), "Open on uninitialized client");
                return Err(RequestError::NotReady {
                    handle: st.handle,
                    state: st.open_state,
                });
            }
        }
        let datagram = message::request(client, open_command, 0)?;
        let header = AppHeader::decode(&datagram)?;
        client.lock().open_state = OpenState::Opening;
        info!(handle = header.handle, blocking, "Opening client");

        let timeout = if blocking {
            RequestTimeout::Infinite
        } else {
            RequestTimeout::After(self.config.open_timeout())
        };
        let mut result = self.send_tracked(client, &header, datagram, timeout);
        if blocking && result.is_ok() {
            result = self
                .wait_for_response(client, self.config.open_timeout())
                .and_then(|()| match client.open_state() {
                    OpenState::Opened => Ok(()),
                    state => Err(RequestError::OpenFailed { state }),
                });
        }
        if result.is_err() {
            client.lock().open_state = OpenState::Closed;
        }
        result
    }

    /// Apply an open response: `Opened` on success, `Closed` on any app error.
    pub fn process_open_response(&self, client: &Endpoint, header: &AppHeader) {
        self.check_owner(client);
        let mut st = client.lock();
        if header.error.is_error() {
            error!(handle = st.handle, error = ?header.error, "Service open failed at service");
            st.open_state = OpenState::Closed;
        } else {
            info!(handle = st.handle, "Service open succeeded at service");
            st.open_state = OpenState::Opened;
            st.pseudo_open = false;
        }
    }

    /// Mark a closed client to be opened without a handshake on the next reset.
    pub fn pseudo_open(&self, client: &Endpoint) {
        self.check_owner(client);
        let mut st = client.lock();
        debug!(handle = st.handle, "Pseudo-opening client");
        st.pseudo_open = true;
    }

    pub fn close(&self, endpoint: &Endpoint) {
        self.check_owner(endpoint);
        let mut st = endpoint.lock();
        st.open_state = OpenState::Closed;
        st.pseudo_open = false;
    }

    /// Match `header` against the outstanding request on its slot and wake blocked senders.
    ///
    /// Accepts exactly once per request; stale, mismatched and duplicate responses are
    /// rejected without touching any state. Returns the round-trip time.
    pub fn timestamp_incoming_response(
        &self,
        endpoint: &Endpoint,
        header: &AppHeader,
    ) -> Result<Duration, ResponseError> {
        self.check_owner(endpoint);
        let now = self.clock.now();
        let result = self
            .scheduler(endpoint.kind())
            .lock()
            .resolve(endpoint, header, now);
        match &result {
            Ok(rtt) => self.complete(endpoint, header, *rtt),
            Err(e) => error!(error = %e, "Response rejected"),
        }
        result
    }

    /// Post-acceptance: drive the open state machine and release the waiter.
    fn complete(&self, endpoint: &Endpoint, header: &AppHeader, rtt: Duration) {
        debug!(
            handle = header.handle,
            command = header.command,
            transaction = header.transaction,
            error = ?header.error,
            rtt_ns = rtt.as_nanos() as u64,
            "Response accepted"
        );
        if endpoint.kind() == EndpointKind::Client
            && endpoint.descriptor().open_command == Some(header.command)
        {
            self.process_open_response(endpoint, header);
        }
        if let Some(sync) = endpoint.sync() {
            sync.notify();
        }
    }

    /// Route an inbound response datagram to its endpoint and slot, then correlate it.
    pub fn process_response(&self, datagram: &[u8]) -> Result<Duration, ResponseError> {
        let header = AppHeader::decode(datagram)?;
        let kind = EndpointKind::answered_by(header.message_type).ok_or(ResponseError::NotAResponse)?;
        let endpoint = match kind {
            EndpointKind::Client => self.client_by_handle(header.handle),
            EndpointKind::Service => self.service_by_handle(header.handle),
        }
        .ok_or(ResponseError::UnknownHandle(header.handle))?;

        let descriptor = endpoint.descriptor();
        if usize::from(header.command) >= descriptor.out_request_count {
            error!(handle = header.handle, command = header.command, "Response to invalid command");
            return Err(ResponseError::InvalidCommand {
                handle: header.handle,
                command: header.command,
            });
        }
        if !header.error.is_error() && datagram.len() < descriptor.min_length {
            error!(
                handle = header.handle,
                len = datagram.len(),
                min = descriptor.min_length,
                "Response too short"
            );
            return Err(ResponseError::TooShort {
                len: datagram.len(),
                min: descriptor.min_length,
            });
        }
        self.timestamp_incoming_response(&endpoint, &header)
    }

    /// Earliest pending request deadline of `kind`; the transport's wake deadline.
    pub fn next_request_timeout(&self, kind: EndpointKind) -> Option<Timestamp> {
        let t = self.scheduler(kind).lock().next_timeout();
        (t != Timestamp::MAX).then_some(t)
    }

    /// If a request of `kind` is past its deadline, resolve it with a synthesised
    /// `Timeout` response and return that response. `None` when nothing has expired.
    pub fn get_request_timeout_response(&self, kind: EndpointKind) -> Option<Vec<u8>> {
        let now = self.clock.now();
        let (endpoint, header, rtt) = {
            let mut sched = self.scheduler(kind).lock();
            let (endpoint, header) = sched.first_expired(now)?;
            match sched.resolve(&endpoint, &header, now) {
                Ok(rtt) => (endpoint, header, rtt),
                Err(e) => {
                    error!(error = %e, "Could not resolve expired request");
                    return None;
                }
            }
        };
        warn!(
            handle = header.handle,
            command = header.command,
            transaction = header.transaction,
            after_ms = rtt.as_millis() as u64,
            "Request timed out"
        );
        self.complete(&endpoint, &header, rtt);
        encode_or_log(&header)
    }

    /// Resolve every outstanding request of `endpoint`.
    ///
    /// `clear_only` drops them silently; otherwise each is answered with a synthesised
    /// `Aborted` response, which is also returned for the endpoint's dispatcher.
    pub fn abort_requests(&self, endpoint: &Endpoint, clear_only: bool) -> Vec<Vec<u8>> {
        self.check_owner(endpoint);
        let kind = endpoint.kind();
        if clear_only {
            let cleared = self.scheduler(kind).lock().clear_endpoint(endpoint);
            for (command, transaction) in cleared {
                warn!(handle = endpoint.handle(), command, transaction, "Cleared open request");
            }
            return Vec::new();
        }

        let now = self.clock.now();
        let resolved: Vec<(AppHeader, Duration)> = {
            let mut sched = self.scheduler(kind).lock();
            let pending: Vec<AppHeader> = {
                let st = endpoint.lock();
                let pending = st
                    .out_reqs
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.is_outstanding())
                    .map(|(command, s)| AppHeader {
                        handle: st.handle,
                        message_type: kind.incoming_response_type(),
                        transaction: s.transaction,
                        error: AppErrorCode::Aborted,
                        command: command as u16,
                    })
                    .collect();
                pending
            };
            pending
                .into_iter()
                .filter_map(|h| sched.resolve(endpoint, &h, now).ok().map(|rtt| (h, rtt)))
                .collect()
        };
        resolved
            .into_iter()
            .filter_map(|(header, rtt)| {
                warn!(
                    handle = header.handle,
                    command = header.command,
                    transaction = header.transaction,
                    "Aborting open request"
                );
                self.complete(endpoint, &header, rtt);
                encode_or_log(&header)
            })
            .collect()
    }

    /// Link reset: abort everything in flight, then bring clients back.
    ///
    /// Pseudo-opened clients become `Opened` without a handshake; clients that were
    /// `Opened` re-send a non-blocking open; the rest stay `Closed`.
    /// Returns the synthesised `Aborted` responses.
    pub fn process_reset(&self) -> Vec<Vec<u8>> {
        let mut aborted = Vec::new();
        for client in self.endpoints(EndpointKind::Client) {
            if !client.is_initialized() {
                continue;
            }
            let was_open = client.open_state() == OpenState::Opened;
            aborted.extend(self.abort_requests(&client, false));

            let mut st = client.lock();
            if st.pseudo_open {
                info!(handle = st.handle, "Pseudo-opened client now open");
                st.pseudo_open = false;
                st.open_state = OpenState::Opened;
            } else if was_open && client.descriptor().open_command.is_some() {
                info!(handle = st.handle, "Client reopening");
                st.open_state = OpenState::Closed;
                drop(st);
                if let Err(e) = self.send_open_request(&client, false) {
                    error!(handle = client.handle(), error = %e, "Reopen failed");
                }
            } else if !was_open {
                warn!(handle = st.handle, "Client reset but wasn't open");
                st.open_state = OpenState::Closed;
            }
        }
        for service in self.endpoints(EndpointKind::Service) {
            aborted.extend(self.abort_requests(&service, false));
        }
        aborted
    }

    /// Record a request received on an endpoint's incoming slot.
    pub fn timestamp_incoming_request(&self, state: &mut IncomingRequestState, header: &AppHeader) {
        if !header.message_type.is_request() {
            error!(handle = header.handle, message_type = ?header.message_type, "Not a request");
            return;
        }
        state.record_request(header, self.clock.now());
    }

    /// Timestamp a response to an incoming request and enqueue it.
    pub fn send_timestamped_response(
        &self,
        state: &mut IncomingRequestState,
        datagram: Vec<u8>,
    ) -> Result<(), RequestError> {
        let header = AppHeader::decode(&datagram)?;
        state.record_response(&header, self.clock.now());
        self.transport.enqueue(datagram)?;
        Ok(())
    }
}

fn encode_or_log(header: &AppHeader) -> Option<Vec<u8>> {
    match header.encode() {
        Ok(d) => Some(d),
        Err(e) => {
            error!(error = %e, "Could not encode synthesised response");
            None
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("all {capacity} {kind:?} slots are registered")]
    Full { kind: EndpointKind, capacity: usize },
}

/// Why a request was not sent or not answered.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("H#{handle} not ready (open state {state:?})")]
    NotReady { handle: u8, state: OpenState },
    #[error("H#{handle} initialized but closed; transport reset")]
    LinkClosed { handle: u8 },
    #[error("enqueue failed: {0}")]
    Transport(#[from] TransportError),
    #[error("no response within {0:?}")]
    ResponseTimeout(Duration),
    #[error("open handshake ended {state:?}")]
    OpenFailed { state: OpenState },
    #[error("malformed datagram: {0}")]
    Header(#[from] HeaderDecodeError),
    #[error(transparent)]
    Message(#[from] MessageError),
}
