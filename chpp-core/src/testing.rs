//! Test doubles: in-memory transports, descriptors and a responder thread.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::app::AppContext;
use crate::config::Config;
use crate::endpoint::EndpointDescriptor;
use crate::message;
use crate::protocol::AppErrorCode;
use crate::time::{Clock, ManualClock, Timestamp};
use crate::transport::{Transport, TransportError};
use crate::wire::AppHeader;

pub(crate) type TestContext = AppContext<Arc<RecordingTransport>, Arc<ManualClock>>;

/// Keeps every enqueued datagram; can be told to reject.
#[derive(Debug, Default)]
pub(crate) struct RecordingTransport {
    sent: Mutex<Vec<Vec<u8>>>,
    reject: AtomicBool,
    resets: AtomicUsize,
}

impl RecordingTransport {
    pub(crate) fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    pub(crate) fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub(crate) fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub(crate) fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

impl Transport for RecordingTransport {
    fn enqueue(&self, datagram: Vec<u8>) -> Result<(), TransportError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(TransportError::QueueFull);
        }
        self.sent.lock().push(datagram);
        Ok(())
    }

    fn force_reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// Forwards datagrams to a peer thread.
pub(crate) struct ChannelTransport {
    tx: Mutex<Sender<Vec<u8>>>,
}

impl ChannelTransport {
    pub(crate) fn new(tx: Sender<Vec<u8>>) -> Self {
        Self { tx: Mutex::new(tx) }
    }
}

impl Transport for ChannelTransport {
    fn enqueue(&self, datagram: Vec<u8>) -> Result<(), TransportError> {
        self.tx
            .lock()
            .send(datagram)
            .map_err(|_| TransportError::LinkDown)
    }

    fn force_reset(&self) {}
}

pub(crate) fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

pub(crate) fn context() -> (TestContext, Arc<RecordingTransport>, Arc<ManualClock>) {
    let transport = Arc::new(RecordingTransport::default());
    let clock = Arc::new(ManualClock::new(Timestamp::from_nanos(1_000_000)));
    let ctx = AppContext::new(Config::default(), transport.clone(), clock.clone()).unwrap();
    (ctx, transport, clock)
}

pub(crate) fn client_descriptor(name: &str, slots: usize) -> EndpointDescriptor {
    EndpointDescriptor::new(name, Uuid::new_v4(), slots)
}

/// Client whose command 0 is the open handshake.
pub(crate) fn open_client_descriptor(name: &str, slots: usize) -> EndpointDescriptor {
    client_descriptor(name, slots).with_open_command(0)
}

pub(crate) fn service_descriptor(name: &str, slots: usize) -> EndpointDescriptor {
    EndpointDescriptor::new(name, Uuid::new_v4(), slots).with_version(1, 0, 0)
}

/// Answer the next `count` requests arriving on `rx` with `error`, feeding the
/// responses back into `ctx`.
pub(crate) fn responder<T, C>(
    ctx: Arc<AppContext<T, C>>,
    rx: Receiver<Vec<u8>>,
    count: usize,
    error: AppErrorCode,
) -> JoinHandle<()>
where
    T: Transport + 'static,
    C: Clock + 'static,
{
    thread::spawn(move || {
        for _ in 0..count {
            let Ok(datagram) = rx.recv_timeout(Duration::from_secs(5)) else {
                return;
            };
            let request = AppHeader::decode(&datagram).unwrap();
            thread::sleep(ms(5));
            let response = if error.is_error() {
                message::error_response(&request, error).unwrap()
            } else {
                message::response(&request, 0).unwrap()
            };
            ctx.process_response(&response).unwrap();
        }
    })
}
