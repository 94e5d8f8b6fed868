//! Messenger
//!
//! Sits between a [`Transport`] and the application. Inbound bytes are
//! decoded on the transport's poll thread; a decoded command either
//! resolves the one outstanding request or goes to the receive queue, which
//! a worker drains into the [`CommandDispatcher`]. Outbound commands are
//! written directly ([`Messenger::send_command`]) or through the send queue
//! ([`Messenger::queue_command`]).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::{
    Command, CommandDispatcher, CommandQueue, FrameDecoder, FrameFormat, ProtocolError,
    QueueStrategy, ReceivedCommand,
};
use crate::events::EventHub;
use crate::transport::{Transport, TransportListener};

/// Traffic notifications, mostly for logging
#[derive(Debug, Clone)]
pub enum MessengerEvent {
    /// A command was written to the transport
    LineSent(Command),
    /// A command was decoded from the transport
    LineReceived(ReceivedCommand),
}

/// Single-slot handoff between the poll thread and a blocked request
#[derive(Default)]
struct ReplySlot {
    expected: Option<i32>,
    reply: Option<ReceivedCommand>,
    aborted: bool,
}

struct Queue<T> {
    items: Mutex<CommandQueue<T>>,
    signal: Condvar,
}

impl<T: super::QueueItem> Queue<T> {
    fn new() -> Self {
        Self {
            items: Mutex::new(CommandQueue::new()),
            signal: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CommandQueue<T>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, item: T, strategy: QueueStrategy) {
        self.lock().enqueue(item, strategy);
        self.signal.notify_one();
    }

    /// Block until an item is available or `running` turns false
    fn next(&self, running: &AtomicBool) -> Option<T> {
        let mut items = self.lock();
        loop {
            if !running.load(Ordering::Acquire) {
                return None;
            }
            if let Some(item) = items.pop() {
                return Some(item);
            }
            items = self
                .signal
                .wait(items)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn wake_all(&self) {
        let _items = self.lock();
        self.signal.notify_all();
    }
}

struct MessengerCore {
    transport: Arc<dyn Transport>,
    format: FrameFormat,
    decoder: Mutex<FrameDecoder>,
    dispatcher: CommandDispatcher,
    events: EventHub<MessengerEvent>,
    reply: Mutex<ReplySlot>,
    reply_signal: Condvar,
    request_gate: Mutex<()>,
    send_queue: Queue<Command>,
    receive_queue: Queue<ReceivedCommand>,
    running: AtomicBool,
    last_received: Mutex<Option<Instant>>,
}

impl MessengerCore {
    fn slot(&self) -> MutexGuard<'_, ReplySlot> {
        self.reply.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn abort_pending(&self) {
        let mut slot = self.slot();
        if slot.expected.is_some() && slot.reply.is_none() {
            debug!("aborting pending request for {:?}", slot.expected);
            slot.aborted = true;
            self.reply_signal.notify_all();
        }
    }

    fn write_command(&self, command: &Command) -> bool {
        if !self.transport.is_connected() {
            debug!("not connected, dropping command {}", command);
            return false;
        }
        let frame = self.format.encode(command);
        self.events.emit(&MessengerEvent::LineSent(command.clone()));
        self.transport.write(&frame);
        trace!("sent {}", command);
        true
    }

    fn send(
        &self,
        command: &Command,
        send_strategy: QueueStrategy,
        receive_strategy: QueueStrategy,
    ) -> ReceivedCommand {
        let reply_id = command.reply().map_or(command.id(), |e| e.reply_id);
        self.send_queue.lock().apply(send_strategy, command.id());
        self.receive_queue.lock().apply(receive_strategy, reply_id);

        let Some(expectation) = command.reply() else {
            return if self.write_command(command) {
                ReceivedCommand::new(command.id(), Vec::new())
            } else {
                ReceivedCommand::not_ok(command.id())
            };
        };

        // Queues are already trimmed; only the wire exchange is serialized.
        let _gate = self
            .request_gate
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        *self.slot() = ReplySlot {
            expected: Some(expectation.reply_id),
            reply: None,
            aborted: false,
        };

        if !self.write_command(command) {
            *self.slot() = ReplySlot::default();
            return ReceivedCommand::not_ok(expectation.reply_id);
        }

        let deadline = Instant::now() + expectation.timeout;
        let mut slot = self.slot();
        while slot.reply.is_none() && !slot.aborted {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            slot = self
                .reply_signal
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }

        let result = slot.reply.take();
        let aborted = slot.aborted;
        *slot = ReplySlot::default();
        drop(slot);

        match result {
            Some(reply) => reply,
            None => {
                if aborted {
                    debug!("request {} aborted", command.id());
                } else {
                    debug!(
                        "request {} timed out after {:?} waiting for {}",
                        command.id(),
                        expectation.timeout,
                        expectation.reply_id
                    );
                }
                ReceivedCommand::not_ok(expectation.reply_id)
            }
        }
    }

    /// Hand a decoded command to the waiter or the receive queue
    fn route(&self, command: ReceivedCommand) {
        self.events
            .emit(&MessengerEvent::LineReceived(command.clone()));

        let command = {
            let mut slot = self.slot();
            if slot.expected == Some(command.id()) && slot.reply.is_none() && !slot.aborted {
                slot.reply = Some(command);
                self.reply_signal.notify_all();
                return;
            }
            command
        };

        self.receive_queue.push(command, QueueStrategy::None);
    }

    fn send_worker(self: Arc<Self>) {
        while let Some(command) = self.send_queue.next(&self.running) {
            if command.expects_reply() {
                let reply = self.send(&command, QueueStrategy::None, QueueStrategy::None);
                if reply.ok() {
                    self.dispatcher.dispatch(reply);
                }
            } else {
                self.write_command(&command);
            }
        }
        trace!("send worker stopped");
    }

    fn receive_worker(self: Arc<Self>) {
        while let Some(command) = self.receive_queue.next(&self.running) {
            self.dispatcher.dispatch(command);
        }
        trace!("receive worker stopped");
    }
}

impl TransportListener for MessengerCore {
    fn on_data_available(&self) {
        let bytes = self.transport.read();
        if bytes.is_empty() {
            return;
        }
        *self
            .last_received
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());

        let decoded = self
            .decoder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .feed(&bytes);

        for result in decoded {
            match result {
                Ok(command) => self.route(command),
                Err(e) => warn!("dropped inbound frame: {}", e),
            }
        }
    }

    fn on_disconnected(&self) {
        self.abort_pending();
        self.decoder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reset();
    }
}

/// Command messenger over a transport
pub struct Messenger {
    core: Arc<MessengerCore>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Messenger {
    /// Attach a messenger to `transport` using `format` for framing
    pub fn new(transport: Arc<dyn Transport>, format: FrameFormat) -> Result<Self, ProtocolError> {
        format.validate()?;

        let core = Arc::new(MessengerCore {
            transport,
            decoder: Mutex::new(FrameDecoder::new(format)),
            format,
            dispatcher: CommandDispatcher::new(),
            events: EventHub::new(),
            reply: Mutex::new(ReplySlot::default()),
            reply_signal: Condvar::new(),
            request_gate: Mutex::new(()),
            send_queue: Queue::new(),
            receive_queue: Queue::new(),
            running: AtomicBool::new(true),
            last_received: Mutex::new(None),
        });

        let listener: Weak<dyn TransportListener> = Arc::downgrade(&core) as Weak<MessengerCore>;
        core.transport.set_listener(Some(listener));

        let mut workers = Vec::with_capacity(2);
        {
            let core = core.clone();
            workers.push(
                thread::Builder::new()
                    .name("messenger-send".to_string())
                    .spawn(move || core.send_worker())?,
            );
        }
        {
            let core = core.clone();
            workers.push(
                thread::Builder::new()
                    .name("messenger-receive".to_string())
                    .spawn(move || core.receive_worker())?,
            );
        }

        Ok(Self {
            core,
            workers: Mutex::new(workers),
        })
    }

    /// Messenger with the default `,` `;` `/` framing
    pub fn with_default_format(transport: Arc<dyn Transport>) -> Result<Self, ProtocolError> {
        Self::new(transport, FrameFormat::default())
    }

    /// The underlying transport
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.core.transport
    }

    /// Framing in use
    pub fn format(&self) -> &FrameFormat {
        &self.core.format
    }

    /// Callback table for inbound commands
    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.core.dispatcher
    }

    /// Traffic events
    pub fn events(&self) -> &EventHub<MessengerEvent> {
        &self.core.events
    }

    /// Open the transport
    pub fn connect(&self) -> Result<(), ProtocolError> {
        self.core
            .decoder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reset();
        self.core.transport.connect()
    }

    /// Close the transport; a blocked request resolves as not ok
    pub fn disconnect(&self) -> bool {
        self.core.abort_pending();
        self.core.transport.disconnect()
    }

    /// Whether the transport is open
    pub fn is_connected(&self) -> bool {
        self.core.transport.is_connected()
    }

    /// When bytes last arrived from the device
    pub fn last_received(&self) -> Option<Instant> {
        *self
            .core
            .last_received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Time since bytes last arrived, if they ever did
    pub fn idle_time(&self) -> Option<Duration> {
        self.last_received().map(|t| t.elapsed())
    }

    /// Send a command without touching either queue
    ///
    /// For a request this blocks until the reply arrives (`ok() == true`)
    /// or the timeout elapses (`ok() == false`). A fire-and-forget command
    /// returns immediately, `ok()` telling whether it was written.
    pub fn send_command(&self, command: &Command) -> ReceivedCommand {
        self.send_command_with(command, QueueStrategy::None, QueueStrategy::None)
    }

    /// Send a command after applying strategies to the send and receive queues
    pub fn send_command_with(
        &self,
        command: &Command,
        send_strategy: QueueStrategy,
        receive_strategy: QueueStrategy,
    ) -> ReceivedCommand {
        self.core.send(command, send_strategy, receive_strategy)
    }

    /// Hand a command to the send worker
    ///
    /// A queued request still waits for its reply on the worker; the reply
    /// is then dispatched like any other inbound command.
    pub fn queue_command(&self, command: Command, strategy: QueueStrategy) {
        self.core.send_queue.push(command, strategy);
    }

    /// Number of commands waiting for the send worker
    pub fn pending_sends(&self) -> usize {
        self.core.send_queue.lock().len()
    }

    /// Number of inbound commands waiting for dispatch
    pub fn pending_receives(&self) -> usize {
        self.core.receive_queue.lock().len()
    }

    /// Resolve the outstanding request, if any, as not ok
    pub fn abort_pending(&self) {
        self.core.abort_pending();
    }

    fn dispose(&self) {
        if !self.core.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.core.abort_pending();
        self.core.transport.set_listener(None);
        self.core.send_queue.wake_all();
        self.core.receive_queue.wake_all();

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for worker in workers {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
        self.core.send_queue.lock().clear();
        self.core.receive_queue.lock().clear();
        self.core.events.clear();
        self.core.dispatcher.clear();
        debug!("messenger disposed");
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        self.dispose();
    }
}
