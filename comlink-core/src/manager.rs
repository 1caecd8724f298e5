//! Device-side connection manager.
//!
//! In direct mode every peer gets its own physical link. In managed mode the device has a
//! single physical link to the relay and every connection is routed over it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::event::{Event, EventKind, LinkObserver};
use crate::link::{VirtualLink, CLOSE_RETRY_PAUSE};
use crate::protocol::RouteCode;
use crate::provider::{FileLocalizer, Providers, ValueProvider};
use crate::routing::{self, RouteHandler, RoutedFrame};
use crate::transport::{PhysicalLink, Radio, Shutdown};
use crate::wait::{lock, wait_while, Deadline};
use crate::writer::OutputPump;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Direct,
    Managed,
}

struct Uplink {
    relay: String,
    pump: Arc<OutputPump>,
    shutdown: Mutex<Option<Shutdown>>,
}

#[derive(Default)]
struct Negotiation {
    /// Peers someone is waiting on, with the admin code that settled them.
    outcomes: HashMap<String, Option<RouteCode>>,
    uplink_lost: bool,
    physical_close_declined: bool,
}

struct Inner {
    name: String,
    config: LinkConfig,
    providers: Mutex<Providers>,
    radio: Option<Arc<dyn Radio>>,
    uplink: Option<Uplink>,
    links: Mutex<HashMap<String, Arc<VirtualLink>>>,
    accepted: Mutex<Vec<Arc<VirtualLink>>>,
    negotiation: Mutex<Negotiation>,
    negotiation_cv: Condvar,
    janitor: Arc<dyn LinkObserver>,
    closed: AtomicBool,
}

/// Drops closed links from the registry.
struct Janitor(Weak<Inner>);

impl LinkObserver for Janitor {
    fn on_event(&self, _link: &VirtualLink, _event: &Event) {}

    fn on_closed(&self, link: &VirtualLink) {
        if let Some(inner) = self.0.upgrade() {
            inner.forget(link);
        }
    }
}

/// Owns every connection of one device.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    fn with_inner(
        name: String,
        config: LinkConfig,
        radio: Option<Arc<dyn Radio>>,
        uplink: Option<Uplink>,
    ) -> Arc<Inner> {
        let providers = Providers::new(&config);
        Arc::new_cyclic(|weak| Inner {
            name,
            config,
            providers: Mutex::new(providers),
            radio,
            uplink,
            links: Mutex::new(HashMap::new()),
            accepted: Mutex::new(Vec::new()),
            negotiation: Mutex::new(Negotiation::default()),
            negotiation_cv: Condvar::new(),
            janitor: Arc::new(Janitor(weak.clone())),
            closed: AtomicBool::new(false),
        })
    }

    /// Manager that dials and accepts physical links itself.
    pub fn direct(name: impl Into<String>, config: LinkConfig, radio: Arc<dyn Radio>) -> Self {
        let inner = Self::with_inner(name.into(), config, Some(radio), None);
        info!(manager = %inner.name, "connection manager started in direct mode");
        Self { inner }
    }

    /// Wait for the relay to open the uplink, then run in managed mode.
    pub fn managed(
        name: impl Into<String>,
        config: LinkConfig,
        radio: &dyn Radio,
    ) -> Result<Self, LinkError> {
        let name = name.into();
        info!(manager = %name, "waiting for the relay");
        let Some((relay, physical)) = radio.accept(config.connect_timeout())? else {
            return Err(LinkError::Timeout);
        };
        Self::over_uplink(name, relay, config, physical)
    }

    /// Run in managed mode over an already open uplink to `relay`.
    pub fn over_uplink(
        name: impl Into<String>,
        relay: impl Into<String>,
        config: LinkConfig,
        physical: PhysicalLink,
    ) -> Result<Self, LinkError> {
        let name = name.into();
        let relay = relay.into();
        let PhysicalLink {
            reader,
            writer,
            shutdown,
        } = physical;
        let pump = Arc::new(OutputPump::spawn(
            format!("{name}->{relay}"),
            writer,
            config.uplink_queue_capacity,
            config.flush_after_write,
        )?);
        let uplink = Uplink {
            relay: relay.clone(),
            pump,
            shutdown: Mutex::new(shutdown),
        };
        let inner = Self::with_inner(name, config, None, Some(uplink));
        if let Err(e) = routing::spawn_routing_reader(inner.name.clone(), reader, inner.clone()) {
            inner.lose_uplink("routing reader could not start");
            return Err(e.into());
        }
        info!(manager = %inner.name, %relay, "connection manager started in managed mode");
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn mode(&self) -> Mode {
        if self.inner.uplink.is_some() {
            Mode::Managed
        } else {
            Mode::Direct
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// False once the uplink to the relay is gone. Always true in direct mode.
    pub fn has_uplink(&self) -> bool {
        self.inner.uplink.is_some() && !lock(&self.inner.negotiation).uplink_lost
    }

    /// Provider for connections opened from now on, and for the open ones.
    pub fn set_value_provider(&self, provider: Arc<dyn ValueProvider>) {
        lock(&self.inner.providers).values = Some(provider.clone());
        for link in self.connections() {
            link.set_value_provider(provider.clone());
        }
    }

    pub fn set_file_localizer(&self, localizer: Arc<dyn FileLocalizer>) {
        lock(&self.inner.providers).files = localizer.clone();
        for link in self.connections() {
            link.set_file_localizer(localizer.clone());
        }
    }

    /// Every open connection, dialed or accepted.
    pub fn connections(&self) -> Vec<Arc<VirtualLink>> {
        let mut out: Vec<_> = lock(&self.inner.links).values().cloned().collect();
        out.extend(lock(&self.inner.accepted).iter().cloned());
        out
    }

    /// Open link to `peer`, if any. Does not count a user.
    pub fn connection_to(&self, peer: &str) -> Option<Arc<VirtualLink>> {
        lock(&self.inner.links)
            .get(peer)
            .filter(|l| !l.is_closed())
            .cloned()
    }

    /// Connect to `peer` over a dedicated physical link, reusing an open one.
    pub fn direct_connection(&self, peer: &str) -> Result<Arc<VirtualLink>, LinkError> {
        self.inner.ensure_open()?;
        let Some(radio) = &self.inner.radio else {
            return Err(LinkError::WrongMode("managed"));
        };
        if let Some(link) = self.inner.reuse(peer) {
            debug!(manager = %self.inner.name, %peer, users = link.users(), "connection reused");
            return Ok(link);
        }
        let physical = radio.connect(peer)?;
        let link = VirtualLink::open_direct(
            self.inner.name.clone(),
            peer,
            physical,
            self.inner.config.clone(),
            self.inner.providers(),
        )?;
        self.inner.adopt(peer, link.clone());
        Ok(link)
    }

    /// Accept one incoming direct connection. `None` on timeout; zero waits indefinitely.
    pub fn accept_direct(&self, timeout: Duration) -> Result<Option<Arc<VirtualLink>>, LinkError> {
        self.inner.ensure_open()?;
        let Some(radio) = &self.inner.radio else {
            return Err(LinkError::WrongMode("managed"));
        };
        let Some((peer, physical)) = radio.accept(timeout)? else {
            return Ok(None);
        };
        let link = VirtualLink::open_direct(
            self.inner.name.clone(),
            peer,
            physical,
            self.inner.config.clone(),
            self.inner.providers(),
        )?;
        self.inner.watch(&link);
        lock(&self.inner.accepted).push(link.clone());
        Ok(Some(link))
    }

    /// Open a routed connection to `peer` through the relay.
    pub fn managed_connection(
        &self,
        peer: &str,
        timeout: Duration,
    ) -> Result<Arc<VirtualLink>, LinkError> {
        self.inner.ensure_open()?;
        let uplink = self.inner.uplink()?;
        if let Some(link) = self.inner.reuse(peer) {
            return Ok(link);
        }
        self.inner.expect(peer);
        let request = routing::encode_control(&self.inner.name, peer, RouteCode::ConnectRequest);
        if let Err(e) = uplink.pump.write(request, false) {
            self.inner.settle(peer, None);
            return Err(e);
        }
        info!(manager = %self.inner.name, %peer, "connect request sent");
        self.inner.finish_negotiation(peer, timeout)
    }

    /// Wait for `peer` to open a routed connection to us.
    pub fn await_managed_connection(
        &self,
        peer: &str,
        timeout: Duration,
    ) -> Result<Arc<VirtualLink>, LinkError> {
        self.inner.ensure_open()?;
        self.inner.uplink()?;
        if let Some(link) = self.inner.reuse(peer) {
            return Ok(link);
        }
        self.inner.expect(peer);
        debug!(manager = %self.inner.name, %peer, "waiting for connect request");
        self.inner.finish_negotiation(peer, timeout)
    }

    /// Close every connection gracefully, then the uplink. Links that do not close in
    /// time are torn down.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let timeout = self.inner.config.close_timeout();
        for link in self.connections() {
            let mut ok = true;
            while ok && !link.is_closed() {
                ok = link.close_gracefully(timeout);
            }
            if !link.is_closed() {
                link.shutdown();
            }
        }
        lock(&self.inner.accepted).clear();
        if self.inner.uplink.is_some() {
            self.inner.close_uplink(timeout);
        }
        info!(manager = %self.inner.name, "connection manager closed");
    }
}

impl Inner {
    fn ensure_open(&self) -> Result<(), LinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::ConnectionClosed);
        }
        Ok(())
    }

    fn uplink(&self) -> Result<&Uplink, LinkError> {
        let uplink = self.uplink.as_ref().ok_or(LinkError::WrongMode("direct"))?;
        if lock(&self.negotiation).uplink_lost {
            return Err(LinkError::ConnectionClosed);
        }
        Ok(uplink)
    }

    fn providers(&self) -> Providers {
        lock(&self.providers).clone()
    }

    fn watch(&self, link: &Arc<VirtualLink>) {
        link.register(self.janitor.clone(), EventKind::Close);
    }

    fn adopt(&self, peer: &str, link: Arc<VirtualLink>) {
        self.watch(&link);
        lock(&self.links).insert(peer.to_string(), link);
    }

    /// An open link to `peer` with one more user.
    fn reuse(&self, peer: &str) -> Option<Arc<VirtualLink>> {
        let mut links = lock(&self.links);
        match links.get(peer) {
            Some(link) if !link.is_closed() => {
                link.add_user();
                Some(link.clone())
            }
            Some(_) => {
                links.remove(peer);
                None
            }
            None => None,
        }
    }

    fn forget(&self, link: &VirtualLink) {
        let same = |l: &Arc<VirtualLink>| std::ptr::eq(Arc::as_ptr(l), link);
        lock(&self.links).retain(|_, l| !same(l));
        lock(&self.accepted).retain(|l| !same(l));
    }

    fn open_routed(&self, peer: &str) -> Result<Arc<VirtualLink>, LinkError> {
        let uplink = self.uplink()?;
        let link = VirtualLink::routed(
            &self.name,
            peer,
            uplink.pump.clone(),
            self.config.clone(),
            self.providers(),
            false,
        );
        self.adopt(peer, link.clone());
        info!(manager = %self.name, %peer, "routed connection opened");
        Ok(link)
    }

    fn expect(&self, peer: &str) {
        lock(&self.negotiation).outcomes.insert(peer.to_string(), None);
    }

    /// Record the answer for `peer`, or drop the wait with `None`. False if nobody was
    /// waiting.
    fn settle(&self, peer: &str, code: Option<RouteCode>) -> bool {
        let mut neg = lock(&self.negotiation);
        if !matches!(neg.outcomes.get(peer), Some(None)) {
            return false;
        }
        match code {
            Some(c) => {
                neg.outcomes.insert(peer.to_string(), Some(c));
            }
            None => {
                neg.outcomes.remove(peer);
            }
        }
        self.negotiation_cv.notify_all();
        true
    }

    fn is_expected(&self, peer: &str) -> bool {
        matches!(lock(&self.negotiation).outcomes.get(peer), Some(None))
    }

    fn finish_negotiation(&self, peer: &str, timeout: Duration) -> Result<Arc<VirtualLink>, LinkError> {
        let neg = lock(&self.negotiation);
        let (mut neg, _) = wait_while(&self.negotiation_cv, neg, timeout, |n| {
            !n.uplink_lost && matches!(n.outcomes.get(peer), Some(None))
        });
        let outcome = neg.outcomes.remove(peer).flatten();
        let lost = neg.uplink_lost;
        drop(neg);
        match outcome {
            Some(RouteCode::ConnectAck) | Some(RouteCode::ConnectRequest) => lock(&self.links)
                .get(peer)
                .cloned()
                .ok_or(LinkError::ConnectionClosed),
            Some(RouteCode::ConnectDecline) => Err(LinkError::Declined(peer.to_string())),
            Some(RouteCode::ReceiverNotKnown) => Err(LinkError::ReceiverNotKnown(peer.to_string())),
            Some(other) => Err(LinkError::UnexpectedResponse(format!("{other:?}"))),
            None if lost => Err(LinkError::ConnectionClosed),
            None => Err(LinkError::Timeout),
        }
    }

    fn write_control(&self, to: &str, code: RouteCode, block_after: bool) -> Result<(), LinkError> {
        let uplink = self.uplink.as_ref().ok_or(LinkError::WrongMode("direct"))?;
        uplink
            .pump
            .write(routing::encode_control(&self.name, to, code), block_after)
    }

    fn on_connect_request(&self, from: &str) -> Result<(), LinkError> {
        if self.is_expected(from) {
            self.open_routed(from)?;
            self.settle(from, Some(RouteCode::ConnectRequest));
            self.write_control(from, RouteCode::ConnectAck, false)
        } else {
            info!(manager = %self.name, peer = %from, "unexpected connect request declined");
            self.write_control(from, RouteCode::ConnectDecline, false)
        }
    }

    fn receiving_file(&self) -> bool {
        lock(&self.links).values().any(|l| l.is_receiving_file())
    }

    fn on_close_physical(&self, from: &str) -> Result<(), LinkError> {
        if self.receiving_file() {
            info!(manager = %self.name, "physical close declined during file transfer");
            return self.write_control(from, RouteCode::ClosePhysicalDecline, false);
        }
        if let Some(uplink) = &self.uplink {
            uplink.pump.deblock();
        }
        let ack = self.write_control(from, RouteCode::ClosePhysicalAck, true);
        self.lose_uplink("relay closed the physical link");
        ack
    }

    /// Tear the uplink down and every link routed over it.
    fn lose_uplink(&self, reason: &str) {
        {
            let mut neg = lock(&self.negotiation);
            if neg.uplink_lost {
                return;
            }
            neg.uplink_lost = true;
            self.negotiation_cv.notify_all();
        }
        info!(manager = %self.name, %reason, "physical link to relay closed");
        let links: Vec<_> = lock(&self.links).drain().map(|(_, l)| l).collect();
        for link in links {
            link.terminate(reason);
        }
        if let Some(uplink) = &self.uplink {
            uplink.pump.shutdown(self.config.shutdown_timeout());
            if let Some(f) = lock(&uplink.shutdown).take() {
                f();
            }
        }
    }

    fn close_uplink(&self, timeout: Duration) {
        let Some(uplink) = &self.uplink else {
            return;
        };
        let deadline = Deadline::after(timeout);
        loop {
            {
                let mut neg = lock(&self.negotiation);
                if neg.uplink_lost {
                    return;
                }
                neg.physical_close_declined = false;
            }
            match self.write_control(&uplink.relay, RouteCode::ClosePhysical, true) {
                Ok(()) | Err(LinkError::QueueBlocked) => {}
                Err(e) => {
                    warn!(manager = %self.name, error = %e, "cannot request physical close");
                    break;
                }
            }
            let neg = lock(&self.negotiation);
            let (neg, _) = wait_while(&self.negotiation_cv, neg, deadline.remaining(), |n| {
                !n.uplink_lost && !n.physical_close_declined
            });
            if neg.uplink_lost {
                return;
            }
            let declined = neg.physical_close_declined;
            drop(neg);
            if !declined || deadline.expired() {
                break;
            }
            thread::sleep(CLOSE_RETRY_PAUSE);
        }
        self.lose_uplink("physical close timed out");
    }
}

impl RouteHandler for Inner {
    fn on_frame(&self, frame: RoutedFrame) -> Result<(), LinkError> {
        if frame.to != self.name {
            return Err(LinkError::UnexpectedResponse(format!(
                "frame for {} reached {}",
                frame.to, self.name
            )));
        }
        let from = frame.from.as_str();
        match frame.code {
            RouteCode::Data => {
                let link = lock(&self.links).get(from).cloned();
                match link {
                    Some(link) => link.feed(&frame.payload),
                    None => debug!(manager = %self.name, peer = %from, "data without connection dropped"),
                }
                Ok(())
            }
            RouteCode::ConnectRequest => self.on_connect_request(from),
            RouteCode::ConnectAck => {
                if !self.is_expected(from) {
                    return Err(LinkError::UnexpectedResponse(format!("connect ACK from {from}")));
                }
                self.open_routed(from)?;
                self.settle(from, Some(RouteCode::ConnectAck));
                Ok(())
            }
            RouteCode::ConnectDecline => {
                if !self.settle(from, Some(RouteCode::ConnectDecline)) {
                    debug!(manager = %self.name, peer = %from, "late connect decline ignored");
                }
                Ok(())
            }
            RouteCode::ReceiverNotKnown => {
                let stale = lock(&self.links).remove(from);
                if let Some(link) = stale {
                    link.terminate("receiver not known to the relay");
                }
                self.settle(from, Some(RouteCode::ReceiverNotKnown));
                Ok(())
            }
            RouteCode::ClosePhysical => self.on_close_physical(from),
            RouteCode::ClosePhysicalAck => {
                self.lose_uplink("physical close acknowledged");
                Ok(())
            }
            RouteCode::ClosePhysicalDecline => {
                if let Some(uplink) = &self.uplink {
                    uplink.pump.deblock();
                }
                let mut neg = lock(&self.negotiation);
                neg.physical_close_declined = true;
                self.negotiation_cv.notify_all();
                Ok(())
            }
        }
    }

    fn on_link_lost(&self, reason: &str) {
        self.lose_uplink(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TcpRadio;

    #[test]
    fn direct_manager_refuses_managed_operations() {
        let radio: Arc<dyn Radio> = Arc::new(TcpRadio::new("NXT1"));
        let m = ConnectionManager::direct("NXT1", LinkConfig::default(), radio);
        assert_eq!(m.mode(), Mode::Direct);
        assert!(matches!(
            m.managed_connection("NXT2", Duration::from_millis(10)),
            Err(LinkError::WrongMode("direct"))
        ));
    }

    #[test]
    fn closed_manager_refuses_new_connections() {
        let radio: Arc<dyn Radio> = Arc::new(TcpRadio::new("NXT1"));
        let m = ConnectionManager::direct("NXT1", LinkConfig::default(), radio);
        m.close();
        assert!(m.is_closed());
        assert!(matches!(
            m.direct_connection("NXT2"),
            Err(LinkError::ConnectionClosed)
        ));
    }

    #[test]
    fn unknown_peer_surfaces_radio_error() {
        let radio: Arc<dyn Radio> = Arc::new(TcpRadio::new("NXT1"));
        let m = ConnectionManager::direct("NXT1", LinkConfig::default(), radio);
        assert!(matches!(m.direct_connection("nobody"), Err(LinkError::Io(_))));
    }
}
