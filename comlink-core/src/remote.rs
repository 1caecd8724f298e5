//! Polling view of a reading on the other end of a link.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::LinkError;
use crate::event::{Event, LinkObserver, Waiter};
use crate::link::VirtualLink;
use crate::sender::Reading;
use crate::wait::lock;

/// Requests a remote reading on demand, at most once per `min_interval`, and waits for the
/// answer.
pub struct RemoteValue {
    link: Arc<VirtualLink>,
    reading: Reading,
    waiter: Arc<Waiter>,
    observer: Arc<dyn LinkObserver>,
    min_interval: Duration,
    wait: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RemoteValue {
    /// `wait` bounds each [`RemoteValue::fetch`]; zero waits indefinitely.
    pub fn subscribe(
        link: Arc<VirtualLink>,
        reading: Reading,
        min_interval: Duration,
        wait: Duration,
    ) -> Result<Self, LinkError> {
        if link.is_closed() {
            return Err(LinkError::ConnectionClosed);
        }
        let waiter = Waiter::new();
        let observer: Arc<dyn LinkObserver> = waiter.clone();
        link.register(observer.clone(), reading.event_kind());
        Ok(Self {
            link,
            reading,
            waiter,
            observer,
            min_interval,
            wait,
            last_request: Mutex::new(None),
        })
    }

    /// Last value received, without asking.
    pub fn latest(&self) -> Option<f32> {
        match self.reading {
            Reading::Degree => self.link.remote_degree(),
            Reading::Light => self.link.remote_light_value(),
        }
    }

    /// Ask the peer for a fresh value. Within `min_interval` of the last request the cached
    /// value is returned instead.
    pub fn fetch(&self) -> Result<f32, LinkError> {
        {
            let mut last = lock(&self.last_request);
            if let (Some(at), Some(v)) = (*last, self.latest()) {
                if at.elapsed() < self.min_interval {
                    return Ok(v);
                }
            }
            *last = Some(Instant::now());
        }
        let seen = self.waiter.generation();
        match self.reading {
            Reading::Degree => self.link.request_degree(None)?,
            Reading::Light => self.link.request_light_value(None)?,
        }
        if !self.waiter.wait_past(seen, self.wait) {
            debug!(link = %self.link, reading = ?self.reading, "remote value timed out");
            return Err(LinkError::Timeout);
        }
        if self.waiter.saw_close() {
            return Err(LinkError::ConnectionClosed);
        }
        match self.waiter.last_event() {
            Some(Event::Degree(v)) | Some(Event::Light(v)) => Ok(v),
            Some(Event::Rejected { value, .. }) => Err(LinkError::UnexpectedResponse(format!(
                "{:?} out of range: {value}",
                self.reading
            ))),
            other => Err(LinkError::UnexpectedResponse(format!("{other:?}"))),
        }
    }
}

impl Drop for RemoteValue {
    fn drop(&mut self) {
        self.link.unregister_all(&self.observer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::provider::{Providers, SharedReadings};
    use crate::transport::PhysicalLink;
    use std::net::{TcpListener, TcpStream};

    fn pair() -> (Arc<VirtualLink>, Arc<VirtualLink>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let a = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (b, _) = listener.accept().unwrap();
        let config = LinkConfig::default();
        let open = |local: &str, remote: &str, s: TcpStream| {
            VirtualLink::open_direct(
                local,
                remote,
                PhysicalLink::from_tcp(s).unwrap(),
                config.clone(),
                Providers::new(&config),
            )
            .unwrap()
        };
        (open("A", "B", a), open("B", "A", b))
    }

    #[test]
    fn fetch_asks_the_peer() {
        let (a, b) = pair();
        let readings = SharedReadings::new();
        readings.set_degree(270.0);
        b.set_value_provider(readings.clone());
        let remote =
            RemoteValue::subscribe(a.clone(), Reading::Degree, Duration::ZERO, Duration::from_secs(5))
                .unwrap();
        assert_eq!(remote.latest(), None);
        assert_eq!(remote.fetch().unwrap(), 270.0);
        readings.set_degree(15.0);
        assert_eq!(remote.fetch().unwrap(), 15.0);
        assert_eq!(remote.latest(), Some(15.0));
        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn fetch_within_interval_uses_cache() {
        let (a, b) = pair();
        let readings = SharedReadings::new();
        readings.set_light_value(20.0);
        b.set_value_provider(readings.clone());
        let remote = RemoteValue::subscribe(
            a.clone(),
            Reading::Light,
            Duration::from_secs(60),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(remote.fetch().unwrap(), 20.0);
        readings.set_light_value(80.0);
        assert_eq!(remote.fetch().unwrap(), 20.0);
        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn unavailable_reading_is_rejected() {
        let (a, b) = pair();
        let remote =
            RemoteValue::subscribe(a.clone(), Reading::Light, Duration::ZERO, Duration::from_secs(5))
                .unwrap();
        // No provider on B: it answers with the -1 sentinel.
        assert!(matches!(remote.fetch(), Err(LinkError::UnexpectedResponse(_))));
        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn dropping_unregisters() {
        let (a, b) = pair();
        let remote =
            RemoteValue::subscribe(a.clone(), Reading::Degree, Duration::ZERO, Duration::ZERO)
                .unwrap();
        assert_eq!(a.observer_count(crate::event::EventKind::Degree), 1);
        drop(remote);
        assert_eq!(a.observer_count(crate::event::EventKind::Degree), 0);
        a.shutdown();
        b.shutdown();
    }
}
