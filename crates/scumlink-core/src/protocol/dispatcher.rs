//! Command dispatch
//!
//! Maps command ids to callbacks. Commands with no registered callback go
//! to the default (unknown command) callback. Callbacks never run directly:
//! they are handed to an [`Invoker`], which decides on which thread they
//! execute.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, RwLock};

use tracing::{debug, trace};

use super::ReceivedCommand;

/// Callback for a decoded command
pub type CommandCallback = Arc<dyn Fn(ReceivedCommand) + Send + Sync>;

/// A callback bound to its command, ready to run
pub type Job = Box<dyn FnOnce() + Send>;

/// Runs dispatched callbacks on some execution context
pub trait Invoker: Send + Sync {
    /// Run or schedule `job`
    fn invoke(&self, job: Job);
}

/// Runs callbacks on the dispatching thread
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectInvoker;

impl Invoker for DirectInvoker {
    fn invoke(&self, job: Job) {
        job();
    }
}

/// Forwards callbacks to whichever thread drains the paired [`Receiver`]
///
/// Useful when callbacks must run on an application's main loop.
pub struct ChannelInvoker {
    sender: std::sync::Mutex<Sender<Job>>,
}

impl ChannelInvoker {
    /// Create the invoker and the receiving end the owner thread polls
    pub fn new() -> (Self, Receiver<Job>) {
        let (sender, receiver) = mpsc::channel();
        (
            Self {
                sender: std::sync::Mutex::new(sender),
            },
            receiver,
        )
    }
}

impl Invoker for ChannelInvoker {
    fn invoke(&self, job: Job) {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        if sender.send(job).is_err() {
            debug!("invoker receiver dropped, discarding callback");
        }
    }
}

/// Command id → callback table
pub struct CommandDispatcher {
    callbacks: RwLock<HashMap<i32, CommandCallback>>,
    default_callback: RwLock<Option<CommandCallback>>,
    invoker: RwLock<Arc<dyn Invoker>>,
}

impl CommandDispatcher {
    /// Create an empty dispatcher that runs callbacks inline
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(HashMap::new()),
            default_callback: RwLock::new(None),
            invoker: RwLock::new(Arc::new(DirectInvoker)),
        }
    }

    /// Register the callback for `id`, replacing any previous one
    pub fn attach(&self, id: i32, callback: impl Fn(ReceivedCommand) + Send + Sync + 'static) {
        let mut callbacks = self.callbacks.write().unwrap_or_else(|e| e.into_inner());
        if callbacks.insert(id, Arc::new(callback)).is_some() {
            debug!("replaced callback for command {}", id);
        }
    }

    /// Register the callback for commands without their own callback
    pub fn attach_default(&self, callback: impl Fn(ReceivedCommand) + Send + Sync + 'static) {
        *self
            .default_callback
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(callback));
    }

    /// Remove the callback for `id`
    pub fn detach(&self, id: i32) -> bool {
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some()
    }

    /// Remove every callback, including the default one
    pub fn clear(&self) {
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        *self
            .default_callback
            .write()
            .unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Whether `id` has its own callback
    pub fn is_attached(&self, id: i32) -> bool {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&id)
    }

    /// Choose where callbacks run
    pub fn set_invoker(&self, invoker: Arc<dyn Invoker>) {
        *self.invoker.write().unwrap_or_else(|e| e.into_inner()) = invoker;
    }

    /// Route a command to its callback; returns false if nobody handled it
    pub fn dispatch(&self, command: ReceivedCommand) -> bool {
        let callback = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&command.id())
            .cloned()
            .or_else(|| {
                self.default_callback
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone()
            });

        let Some(callback) = callback else {
            trace!("no callback for command {}, dropping", command.id());
            return false;
        };

        let invoker = self
            .invoker
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        invoker.invoke(Box::new(move || callback(command)));
        true
    }
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
