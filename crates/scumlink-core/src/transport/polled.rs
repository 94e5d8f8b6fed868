//! Polled transport
//!
//! Owns the receive buffer and the poll thread. The poll thread is the only
//! writer of the buffer; [`Transport::read`] drains it. Every tick that
//! produced bytes raises one `on_data_available`.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use super::channel::is_timeout_class;
use super::{
    CommunicationChannel, FileLink, FileSettings, SerialLink, SerialSettings, Transport,
    TransportListener, DEFAULT_POLL_INTERVAL_MS, RECEIVE_BUFFER_SIZE,
};
use crate::protocol::ProtocolError;

/// Physical side of a polled transport
pub trait Link: Send + Sync {
    /// Open a channel to the current endpoint
    fn open(&self) -> Result<Box<dyn CommunicationChannel>, ProtocolError>;

    /// Candidate endpoints; empty when the endpoint is fixed
    fn endpoints(&self) -> Vec<String> {
        Vec::new()
    }

    /// Switch the endpoint used by the next [`open`](Link::open)
    fn select_endpoint(&self, _endpoint: &str) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// Current endpoint, for logs and progress messages
    fn describe(&self) -> String;
}

/// Fixed capacity byte buffer between the poll thread and readers
struct ReceiveBuffer {
    data: Vec<u8>,
}

impl ReceiveBuffer {
    fn new() -> Self {
        Self {
            data: Vec::with_capacity(RECEIVE_BUFFER_SIZE),
        }
    }

    fn free(&self) -> usize {
        RECEIVE_BUFFER_SIZE - self.data.len()
    }

    fn append(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(self.free());
        self.data.extend_from_slice(&bytes[..n]);
    }

    fn drain(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}

/// One connect..disconnect cycle
struct Session {
    id: u64,
    alive: Arc<AtomicBool>,
    writer: Box<dyn CommunicationChannel>,
    worker: Option<JoinHandle<()>>,
}

struct Inner {
    name: String,
    link: Box<dyn Link>,
    poll_interval: Duration,
    session: Mutex<Option<Session>>,
    buffer: Mutex<ReceiveBuffer>,
    listener: RwLock<Option<Weak<dyn TransportListener>>>,
    next_session: AtomicU64,
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn buffer(&self) -> MutexGuard<'_, ReceiveBuffer> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn listener(&self) -> Option<Arc<dyn TransportListener>> {
        self.listener
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Tear down a session; `only` restricts it to one session id
    fn close(&self, only: Option<u64>) -> bool {
        let session = {
            let mut guard = self.session();
            match guard.as_ref() {
                Some(s) if only.map_or(true, |id| id == s.id) => guard.take(),
                _ => None,
            }
        };

        let Some(mut session) = session else {
            return false;
        };

        session.alive.store(false, Ordering::Release);
        if let Some(worker) = session.worker.take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
        drop(session.writer);
        self.buffer().drain();
        info!("{}: disconnected from {}", self.name, self.link.describe());

        if let Some(listener) = self.listener() {
            listener.on_disconnected();
        }
        true
    }

    /// One poll tick; returns the number of bytes added to the buffer
    fn poll_once(
        &self,
        reader: &mut dyn CommunicationChannel,
        chunk: &mut [u8],
    ) -> std::io::Result<usize> {
        let free = self.buffer().free();
        if free == 0 {
            return Ok(0);
        }
        let n = reader.read(&mut chunk[..free])?;
        if n > 0 {
            self.buffer().append(&chunk[..n]);
        }
        Ok(n)
    }

    fn poll_loop(
        self: Arc<Self>,
        mut reader: Box<dyn CommunicationChannel>,
        alive: Arc<AtomicBool>,
        session_id: u64,
    ) {
        let mut chunk = vec![0u8; RECEIVE_BUFFER_SIZE];
        debug!("{}: poll loop started", self.name);

        while alive.load(Ordering::Acquire) {
            match self.poll_once(reader.as_mut(), &mut chunk) {
                Ok(0) => thread::sleep(self.poll_interval),
                Ok(n) => {
                    trace!("{}: buffered {} bytes", self.name, n);
                    if !alive.load(Ordering::Acquire) {
                        break;
                    }
                    if let Some(listener) = self.listener() {
                        listener.on_data_available();
                    }
                }
                Err(ref e) if is_timeout_class(e) => {}
                Err(e) => {
                    warn!("{}: read failed, closing: {}", self.name, e);
                    drop(reader);
                    self.close(Some(session_id));
                    return;
                }
            }
        }

        debug!("{}: poll loop stopped", self.name);
    }
}

/// Transport that polls a [`Link`] on a background thread
pub struct PolledTransport {
    inner: Arc<Inner>,
}

impl PolledTransport {
    /// Create a transport over any link
    pub fn new(name: impl Into<String>, link: Box<dyn Link>, poll_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                link,
                poll_interval,
                session: Mutex::new(None),
                buffer: Mutex::new(ReceiveBuffer::new()),
                listener: RwLock::new(None),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Serial port transport
    pub fn serial(settings: SerialSettings) -> Self {
        Self::new(
            "serial",
            Box::new(SerialLink::new(settings)),
            Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        )
    }

    /// File pair transport
    pub fn file(settings: FileSettings) -> Self {
        Self::new(
            "file",
            Box::new(FileLink::new(settings)),
            Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        )
    }

    /// Number of bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.inner.buffer().data.len()
    }
}

impl Transport for PolledTransport {
    fn connect(&self) -> Result<(), ProtocolError> {
        let inner = &self.inner;
        let mut guard = inner.session();
        if guard.is_some() {
            return Err(ProtocolError::AlreadyConnected);
        }

        let writer = inner
            .link
            .open()
            .map_err(|e| ProtocolError::ConnectionFailed(e.to_string()))?;
        let reader = writer.try_clone()?;
        inner.buffer().drain();

        let id = inner.next_session.fetch_add(1, Ordering::Relaxed);
        let alive = Arc::new(AtomicBool::new(true));
        let worker = {
            let inner = inner.clone();
            let alive = alive.clone();
            thread::Builder::new()
                .name(format!("{}-poll", inner.name))
                .spawn(move || inner.poll_loop(reader, alive, id))?
        };

        *guard = Some(Session {
            id,
            alive,
            writer,
            worker: Some(worker),
        });
        info!("{}: connected to {}", inner.name, inner.link.describe());
        Ok(())
    }

    fn disconnect(&self) -> bool {
        self.inner.close(None)
    }

    fn is_connected(&self) -> bool {
        self.inner.session().is_some()
    }

    fn write(&self, data: &[u8]) {
        let failed = {
            let mut guard = self.inner.session();
            let Some(session) = guard.as_mut() else {
                trace!("{}: write while disconnected ignored", self.inner.name);
                return;
            };
            match session
                .writer
                .write_all(data)
                .and_then(|_| session.writer.flush())
            {
                Ok(()) => false,
                Err(ref e) if is_timeout_class(e) => {
                    debug!("{}: write timed out: {}", self.inner.name, e);
                    false
                }
                Err(e) => {
                    warn!("{}: write failed, closing: {}", self.inner.name, e);
                    true
                }
            }
        };

        if failed {
            self.inner.close(None);
        }
    }

    fn read(&self) -> Vec<u8> {
        self.inner.buffer().drain()
    }

    fn set_listener(&self, listener: Option<Weak<dyn TransportListener>>) {
        *self
            .inner
            .listener
            .write()
            .unwrap_or_else(|e| e.into_inner()) = listener;
    }

    fn endpoints(&self) -> Vec<String> {
        self.inner.link.endpoints()
    }

    fn select_endpoint(&self, endpoint: &str) -> Result<(), ProtocolError> {
        if self.is_connected() {
            return Err(ProtocolError::EndpointLocked);
        }
        self.inner.link.select_endpoint(endpoint)
    }

    fn endpoint(&self) -> String {
        self.inner.link.describe()
    }
}

impl Drop for PolledTransport {
    fn drop(&mut self) {
        self.inner.close(None);
    }
}
