//! Output pump: one thread per physical link draining a bounded queue into the sink.

use std::io::{self, Write};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::LinkError;
use crate::queue::BoundedQueue;
use crate::wait::{lock, wait_while};

struct PumpState {
    queue: BoundedQueue<Vec<u8>>,
    stopped: bool,
    finished: bool,
}

struct Shared {
    state: Mutex<PumpState>,
    /// Signalled when a message is queued or the pump is stopped.
    wake: Condvar,
    /// Signalled when a message leaves the queue or the pump finishes.
    drained: Condvar,
}

/// Serializes every outbound message of one physical link.
///
/// Messages are written in queue order. After [`OutputPump::stop`] the pump writes whatever
/// is still readable in the queue, flushes and exits.
pub struct OutputPump {
    name: String,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl OutputPump {
    /// Start a pump writing to `sink`.
    pub fn spawn(
        name: impl Into<String>,
        sink: Box<dyn Write + Send>,
        capacity: usize,
        flush_after_write: bool,
    ) -> io::Result<Self> {
        let name = name.into();
        let shared = Arc::new(Shared {
            state: Mutex::new(PumpState {
                queue: BoundedQueue::new(capacity),
                stopped: false,
                finished: false,
            }),
            wake: Condvar::new(),
            drained: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(format!("comlink-pump-{name}"))
            .spawn(move || run(thread_shared, sink, flush_after_write, thread_name))?;
        Ok(Self {
            name,
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a message. With `block_after` set, later writes fail until [`OutputPump::deblock`].
    pub fn write(&self, message: Vec<u8>, block_after: bool) -> Result<(), LinkError> {
        let mut st = lock(&self.shared.state);
        if st.finished || st.stopped {
            return Err(LinkError::ConnectionClosed);
        }
        st.queue.push(message, block_after)?;
        self.shared.wake.notify_all();
        Ok(())
    }

    pub fn deblock(&self) {
        let mut st = lock(&self.shared.state);
        st.queue.deblock();
        self.shared.wake.notify_all();
    }

    pub fn is_blocked(&self) -> bool {
        lock(&self.shared.state).queue.is_blocked()
    }

    /// True when nothing is waiting to be written.
    pub fn is_idle(&self) -> bool {
        lock(&self.shared.state).queue.is_empty()
    }

    /// Wait until the queue has room for another message without overwriting.
    /// Returns false on timeout or if the pump finished.
    pub fn wait_for_room(&self, timeout: Duration) -> bool {
        let st = lock(&self.shared.state);
        let (st, _) = wait_while(&self.shared.drained, st, timeout, |s| {
            !s.finished && s.queue.is_full()
        });
        !st.finished && !st.queue.is_full()
    }

    /// Ask the pump to drain and exit. Later writes fail.
    pub fn stop(&self) {
        let mut st = lock(&self.shared.state);
        st.stopped = true;
        self.shared.wake.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        lock(&self.shared.state).finished
    }

    /// Wait for the pump thread to exit. Returns true if it did within `timeout`.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        let st = lock(&self.shared.state);
        let (st, _) = wait_while(&self.shared.drained, st, timeout, |s| !s.finished);
        let finished = st.finished;
        drop(st);
        if finished {
            if let Some(handle) = lock(&self.handle).take() {
                let _ = handle.join();
            }
        }
        finished
    }

    /// Stop, then wait for the drain to complete.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.stop();
        let done = self.wait_finished(timeout);
        if !done {
            warn!(pump = %self.name, "output pump did not drain in time");
        }
        done
    }
}

impl Drop for OutputPump {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: Arc<Shared>, mut sink: Box<dyn Write + Send>, flush_after_write: bool, name: String) {
    loop {
        let next = {
            let mut st = lock(&shared.state);
            loop {
                match st.queue.pop() {
                    Ok(msg) => {
                        shared.drained.notify_all();
                        break Some(msg);
                    }
                    Err(_) if st.stopped => break None,
                    Err(_) => {
                        st = shared.wake.wait(st).unwrap_or_else(PoisonError::into_inner);
                    }
                }
            }
        };
        let Some(msg) = next else { break };
        let res = sink
            .write_all(&msg)
            .and_then(|()| if flush_after_write { sink.flush() } else { Ok(()) });
        if let Err(e) = res {
            warn!(pump = %name, error = %e, "write failed, output pump exits");
            break;
        }
    }
    let _ = sink.flush();
    drop(sink);
    let mut st = lock(&shared.state);
    st.finished = true;
    st.queue.clear();
    shared.drained.notify_all();
    debug!(pump = %name, "output pump finished");
}
