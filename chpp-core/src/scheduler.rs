//! Per-category endpoint registry and request deadline tracking.
//!
//! One `RequestScheduler` exists for clients and one for services. It owns the
//! registration table and the earliest deadline across every outstanding request
//! of its category. Lock order is always scheduler first, then endpoint.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::endpoint::{Endpoint, EndpointKind};
use crate::protocol::AppErrorCode;
use crate::request::ResponseError;
use crate::time::{RequestTimeout, Timestamp};
use crate::wire::AppHeader;

pub(crate) struct RequestScheduler {
    kind: EndpointKind,
    capacity: usize,
    endpoints: Vec<Arc<Endpoint>>,
    /// min over all endpoints' `next_timer_timeout`; `Timestamp::MAX` if nothing is pending.
    next_timeout: Timestamp,
}

impl RequestScheduler {
    pub(crate) fn new(kind: EndpointKind, capacity: usize) -> Self {
        Self {
            kind,
            capacity,
            endpoints: Vec::with_capacity(capacity),
            next_timeout: Timestamp::MAX,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.endpoints.len() >= self.capacity
    }

    pub(crate) fn push(&mut self, endpoint: Arc<Endpoint>) {
        debug_assert_eq!(endpoint.index(), self.endpoints.len());
        self.endpoints.push(endpoint);
    }

    pub(crate) fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub(crate) fn get(&self, index: usize) -> Option<&Arc<Endpoint>> {
        self.endpoints.get(index)
    }

    pub(crate) fn next_timeout(&self) -> Timestamp {
        self.next_timeout
    }

    /// Start tracking a request on `command`. A pending request on the same slot is superseded.
    pub(crate) fn track(
        &mut self,
        endpoint: &Endpoint,
        command: u16,
        transaction: u8,
        now: Timestamp,
        timeout: RequestTimeout,
    ) {
        let (previous_deadline, superseded, deadline) = {
            let mut st = endpoint.lock();
            let handle = st.handle;
            let slot = st.slot_mut(command);
            let previous_deadline = slot.timeout;
            let previous_sent = slot.request_time;
            let superseded = slot.record_request(transaction, now, timeout);
            let deadline = slot.timeout;
            if let Some(old) = superseded {
                error!(
                    handle,
                    command,
                    transaction,
                    superseded = old,
                    sent_ms = previous_sent.map(Timestamp::as_millis),
                    "Dupe request, superseding pending one"
                );
            }
            st.refresh_next_timer_timeout();
            (previous_deadline, superseded, deadline)
        };
        if superseded.is_some() && previous_deadline == self.next_timeout {
            self.recalculate();
        } else if deadline < self.next_timeout {
            self.next_timeout = deadline;
        }
    }

    /// Match a response to the outstanding request on its slot.
    pub(crate) fn resolve(
        &mut self,
        endpoint: &Endpoint,
        header: &AppHeader,
        now: Timestamp,
    ) -> Result<Duration, ResponseError> {
        let (previous_deadline, result) = {
            let mut st = endpoint.lock();
            let slot = st.slot_mut(header.command);
            let previous_deadline = slot.timeout;
            let result = slot.record_response(header, now);
            st.refresh_next_timer_timeout();
            (previous_deadline, result)
        };
        if result.is_ok() {
            self.release(previous_deadline);
        }
        result
    }

    /// Drop the request `transaction` on `command` as if it had never been sent.
    pub(crate) fn cancel(&mut self, endpoint: &Endpoint, command: u16, transaction: u8) {
        let previous_deadline = {
            let mut st = endpoint.lock();
            let slot = st.slot_mut(command);
            if !slot.is_outstanding() || slot.transaction != transaction {
                return;
            }
            let previous_deadline = slot.timeout;
            slot.clear();
            st.refresh_next_timer_timeout();
            previous_deadline
        };
        self.release(previous_deadline);
    }

    /// Clear every outstanding slot of `endpoint`. Returns `(command, transaction)` of each.
    pub(crate) fn clear_endpoint(&mut self, endpoint: &Endpoint) -> Vec<(u16, u8)> {
        let cleared: Vec<(u16, u8)> = {
            let mut st = endpoint.lock();
            let cleared = st
                .out_reqs
                .iter_mut()
                .enumerate()
                .filter(|(_, s)| s.is_outstanding())
                .map(|(cmd, s)| {
                    let t = s.transaction;
                    s.clear();
                    (cmd as u16, t)
                })
                .collect();
            st.refresh_next_timer_timeout();
            cleared
        };
        if !cleared.is_empty() && self.next_timeout != Timestamp::MAX {
            self.recalculate();
        }
        cleared
    }

    /// Header of the first outstanding request whose deadline has passed, in registration/slot order.
    pub(crate) fn first_expired(&self, now: Timestamp) -> Option<(Arc<Endpoint>, AppHeader)> {
        if now < self.next_timeout {
            return None;
        }
        for endpoint in &self.endpoints {
            let st = endpoint.lock();
            let expired = st
                .out_reqs
                .iter()
                .enumerate()
                .find(|(_, s)| s.is_outstanding() && s.timeout <= now);
            if let Some((command, slot)) = expired {
                let header = AppHeader {
                    handle: st.handle,
                    message_type: self.kind.incoming_response_type(),
                    transaction: slot.transaction,
                    error: AppErrorCode::Timeout,
                    command: command as u16,
                };
                drop(st);
                return Some((endpoint.clone(), header));
            }
        }
        None
    }

    /// A deadline left the table. Rescan only if it was the one holding the minimum.
    fn release(&mut self, deadline: Timestamp) {
        if deadline != Timestamp::MAX && deadline == self.next_timeout {
            self.recalculate();
        }
    }

    fn recalculate(&mut self) {
        let next = self
            .endpoints
            .iter()
            .map(|ep| ep.lock().next_timer_timeout)
            .min()
            .unwrap_or(Timestamp::MAX);
        debug!(
            kind = ?self.kind,
            previous_ms = self.next_timeout.as_millis(),
            next_ms = next.as_millis(),
            "Recalculated next request timeout"
        );
        self.next_timeout = next;
    }
}
