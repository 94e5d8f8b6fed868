//! Command queues
//!
//! [`CommandQueue`] is the pending list behind both the send worker and the
//! receive worker of the messenger. A [`QueueStrategy`] is applied as part
//! of the enqueue, so no other party can observe the queue between the
//! strategy and the append.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::{Command, ReceivedCommand};

/// How an enqueue modifies the pending queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QueueStrategy {
    /// Append at the back
    #[default]
    None,
    /// Drop everything pending, then append
    ClearQueue,
    /// Replace a pending command with the same id in place, or append
    Collapse,
}

/// Anything that can sit in a command queue
pub trait QueueItem {
    /// Id used to find duplicates for [`QueueStrategy::Collapse`]
    fn command_id(&self) -> i32;
}

impl QueueItem for Command {
    fn command_id(&self) -> i32 {
        self.id()
    }
}

impl QueueItem for ReceivedCommand {
    fn command_id(&self) -> i32 {
        self.id()
    }
}

/// FIFO of pending commands
#[derive(Debug)]
pub struct CommandQueue<T> {
    items: VecDeque<T>,
}

impl<T: QueueItem> CommandQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    /// Add an item using the given strategy
    pub fn enqueue(&mut self, item: T, strategy: QueueStrategy) {
        match strategy {
            QueueStrategy::None => self.items.push_back(item),
            QueueStrategy::ClearQueue => {
                self.items.clear();
                self.items.push_back(item);
            }
            QueueStrategy::Collapse => {
                let id = item.command_id();
                match self.items.iter_mut().find(|pending| pending.command_id() == id) {
                    Some(slot) => *slot = item,
                    None => self.items.push_back(item),
                }
            }
        }
    }

    /// Apply a strategy without adding anything
    ///
    /// `ClearQueue` empties the queue, `Collapse` drops pending items with
    /// `id`, since the caller is about to supersede them.
    pub fn apply(&mut self, strategy: QueueStrategy, id: i32) {
        match strategy {
            QueueStrategy::None => {}
            QueueStrategy::ClearQueue => self.items.clear(),
            QueueStrategy::Collapse => self.items.retain(|pending| pending.command_id() != id),
        }
    }

    /// Take the oldest item
    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Number of pending items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop everything pending
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Pending items, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

impl<T: QueueItem> Default for CommandQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
