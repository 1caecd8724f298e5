//! Fixed-capacity FIFO that overwrites its oldest entry when full and can be blocked
//! behind a particular message.

/// Error returned by [`BoundedQueue`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue is empty")]
    Empty,
    #[error("queue is blocked")]
    Blocked,
}

/// Block point set by a blocking push.
#[derive(Debug, Clone, Copy)]
struct Block {
    /// Write position just after the blocking message.
    cursor: usize,
    /// Messages that may still be popped before the block takes effect.
    readable: usize,
}

/// Ring buffer of messages.
///
/// A push with `block_after` set makes every later push fail until [`BoundedQueue::deblock`],
/// and pops fail once the blocking message itself has been read. With capacity one the
/// blocking message occupies the only slot, so the first pop after it still succeeds.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    slots: Vec<Option<T>>,
    push_at: usize,
    pop_at: usize,
    len: usize,
    block: Option<Block>,
}

impl<T> BoundedQueue<T> {
    /// Create a queue. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            push_at: 0,
            pop_at: 0,
            len: 0,
            block: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// True while a blocking push is in effect.
    pub fn is_blocked(&self) -> bool {
        self.block.is_some()
    }

    /// Write position recorded by the last blocking push, if any.
    pub fn block_cursor(&self) -> Option<usize> {
        self.block.map(|b| b.cursor)
    }

    /// Append `item`, overwriting the oldest entry if full.
    pub fn push(&mut self, item: T, block_after: bool) -> Result<(), QueueError> {
        if self.block.is_some() {
            return Err(QueueError::Blocked);
        }
        let cap = self.capacity();
        self.slots[self.push_at] = Some(item);
        self.push_at = (self.push_at + 1) % cap;
        if self.len == cap {
            // Oldest entry was overwritten.
            self.pop_at = self.push_at;
        } else {
            self.len += 1;
        }
        if block_after {
            self.block = Some(Block {
                cursor: self.push_at,
                readable: self.len,
            });
        }
        Ok(())
    }

    /// Remove the oldest entry.
    pub fn pop(&mut self) -> Result<T, QueueError> {
        if self.len == 0 {
            return Err(QueueError::Empty);
        }
        if matches!(self.block, Some(b) if b.readable == 0) {
            return Err(QueueError::Blocked);
        }
        let item = self.slots[self.pop_at].take();
        self.pop_at = (self.pop_at + 1) % self.capacity();
        self.len -= 1;
        if let Some(b) = self.block.as_mut() {
            b.readable -= 1;
        }
        item.ok_or(QueueError::Empty)
    }

    /// Drop the block point. Queued messages are kept.
    pub fn deblock(&mut self) {
        self.block = None;
    }

    /// Empty the queue and drop any block point.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.push_at = 0;
        self.pop_at = 0;
        self.len = 0;
        self.block = None;
    }
}
