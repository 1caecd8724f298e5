//! Periodic push of a local reading over a link.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::LinkError;
use crate::event::EventKind;
use crate::link::VirtualLink;
use crate::provider::ValueProvider;
use crate::wait::{lock, wait_while};

/// Which local reading a sender pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reading {
    Degree,
    Light,
}

impl Reading {
    pub fn event_kind(self) -> EventKind {
        match self {
            Reading::Degree => EventKind::Degree,
            Reading::Light => EventKind::Light,
        }
    }
}

#[derive(Default)]
struct StopFlag {
    stopped: Mutex<bool>,
    cv: Condvar,
}

/// Background thread writing one reading every `interval` until stopped or the link
/// closes. A full queue or an unreadable sensor skips one cycle.
pub struct ValueSender {
    stop: Arc<StopFlag>,
    handle: Option<JoinHandle<()>>,
}

impl ValueSender {
    pub fn spawn(
        link: Arc<VirtualLink>,
        provider: Arc<dyn ValueProvider>,
        reading: Reading,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(StopFlag::default());
        let thread_stop = stop.clone();
        let handle = thread::Builder::new()
            .name(format!("comlink-send-{}", link.remote_name()))
            .spawn(move || run(&link, provider.as_ref(), reading, interval, &thread_stop))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread and wait for it to exit.
    pub fn stop(&mut self) {
        *lock(&self.stop.stopped) = true;
        self.stop.cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ValueSender {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    link: &VirtualLink,
    provider: &dyn ValueProvider,
    reading: Reading,
    interval: Duration,
    stop: &StopFlag,
) {
    info!(link = %link, ?reading, ?interval, "value sender started");
    let mut sent: u64 = 0;
    loop {
        let value = match reading {
            Reading::Degree => provider.degree(),
            Reading::Light => provider.light_value(),
        };
        let res = match value {
            Ok(v) => match reading {
                Reading::Degree => link.write_degree(v),
                Reading::Light => link.write_light_value(v),
            },
            Err(_) => {
                debug!(link = %link, ?reading, "reading unavailable, cycle skipped");
                Ok(())
            }
        };
        match res {
            Ok(()) => sent += 1,
            Err(LinkError::QueueBlocked) => debug!(link = %link, "queue blocked, cycle skipped"),
            Err(LinkError::ConnectionClosed) => break,
            Err(e) => {
                warn!(link = %link, error = %e, "value sender stopped");
                break;
            }
        }
        let st = lock(&stop.stopped);
        if *st {
            break;
        }
        // A zero interval would wait forever here.
        let (st, _) = wait_while(&stop.cv, st, interval.max(Duration::from_millis(1)), |s| !*s);
        if *st {
            break;
        }
    }
    info!(link = %link, ?reading, sent, "value sender finished");
}
