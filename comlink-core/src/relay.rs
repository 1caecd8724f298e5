//! Relay: holds one physical link per device and forwards routed traffic between them.
//!
//! The relay is also an endpoint itself. Each device port carries a relay-hosted link whose
//! conversation opens with a connect handshake and can end without dropping the physical
//! link.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::link::{VirtualLink, CLOSE_RETRY_PAUSE};
use crate::protocol::RouteCode;
use crate::provider::{FileLocalizer, Providers, ValueProvider};
use crate::routing::{self, RouteHandler, RoutedFrame};
use crate::transport::{PhysicalLink, Radio, Shutdown};
use crate::wait::{lock, wait_while, Deadline};
use crate::writer::OutputPump;

#[derive(Debug, Default)]
struct PortState {
    closing: bool,
    closed: bool,
    close_declined: bool,
}

/// One device's physical link.
struct DevicePort {
    device: String,
    pump: Arc<OutputPump>,
    link: Arc<VirtualLink>,
    shutdown: Mutex<Option<Shutdown>>,
    state: Mutex<PortState>,
    cv: Condvar,
}

impl DevicePort {
    fn send(&self, from: &str, code: RouteCode, block_after: bool) -> Result<(), LinkError> {
        self.pump.write(
            routing::encode_control(from, &self.device, code),
            block_after,
        )
    }
}

struct RelayInner {
    name: String,
    config: LinkConfig,
    providers: Mutex<Providers>,
    ports: Mutex<HashMap<String, Arc<DevicePort>>>,
    /// Devices the relay itself is connecting to.
    negotiation: Mutex<HashMap<String, Option<RouteCode>>>,
    negotiation_cv: Condvar,
    closing: AtomicBool,
}

/// Routing reader for one port.
struct PortReader {
    relay: Arc<RelayInner>,
    port: Arc<DevicePort>,
}

/// Relay manager.
pub struct RelayManager {
    inner: Arc<RelayInner>,
}

impl RelayManager {
    pub fn new(name: impl Into<String>, config: LinkConfig) -> Self {
        let providers = Providers::new(&config);
        Self {
            inner: Arc::new(RelayInner {
                name: name.into(),
                config,
                providers: Mutex::new(providers),
                ports: Mutex::new(HashMap::new()),
                negotiation: Mutex::new(HashMap::new()),
                negotiation_cv: Condvar::new(),
                closing: AtomicBool::new(false),
            }),
        }
    }

    /// Dial every device in `devices`. Unreachable devices are logged and skipped.
    pub fn start(
        name: impl Into<String>,
        config: LinkConfig,
        radio: &dyn Radio,
        devices: &[String],
    ) -> Self {
        let relay = Self::new(name, config);
        for device in devices {
            match radio.connect(device) {
                Ok(physical) => {
                    if let Err(e) = relay.attach(device, physical) {
                        warn!(%device, error = %e, "cannot attach device");
                    }
                }
                Err(e) => warn!(%device, error = %e, "device unreachable"),
            }
        }
        info!(relay = %relay.inner.name, devices = relay.devices().len(), "relay started");
        relay
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Serve `device` over `physical`. An existing port for the device is closed.
    pub fn attach(&self, device: &str, physical: PhysicalLink) -> Result<(), LinkError> {
        if self.inner.closing.load(Ordering::SeqCst) {
            return Err(LinkError::ConnectionClosed);
        }
        let PhysicalLink {
            reader,
            writer,
            shutdown,
        } = physical;
        let cfg = &self.inner.config;
        let pump = Arc::new(OutputPump::spawn(
            format!("{}->{device}", self.inner.name),
            writer,
            cfg.uplink_queue_capacity,
            cfg.flush_after_write,
        )?);
        let link = VirtualLink::routed(
            &self.inner.name,
            device,
            pump.clone(),
            cfg.clone(),
            lock(&self.inner.providers).clone(),
            true,
        );
        let port = Arc::new(DevicePort {
            device: device.to_string(),
            pump,
            link,
            shutdown: Mutex::new(shutdown),
            state: Mutex::new(PortState::default()),
            cv: Condvar::new(),
        });
        let previous = lock(&self.inner.ports).insert(device.to_string(), port.clone());
        if let Some(old) = previous {
            self.inner.close_port(&old, "replaced by a new physical link");
        }
        let handler = Arc::new(PortReader {
            relay: self.inner.clone(),
            port: port.clone(),
        });
        if let Err(e) = routing::spawn_routing_reader(format!("relay-{device}"), reader, handler) {
            self.inner.close_port(&port, "routing reader could not start");
            return Err(e.into());
        }
        info!(relay = %self.inner.name, %device, "device attached");
        Ok(())
    }

    /// Attach one device that dials in. `None` on timeout; zero waits indefinitely.
    pub fn accept(&self, radio: &dyn Radio, timeout: Duration) -> Result<Option<String>, LinkError> {
        let Some((device, physical)) = radio.accept(timeout)? else {
            return Ok(None);
        };
        self.attach(&device, physical)?;
        Ok(Some(device))
    }

    /// Names of the attached devices, sorted.
    pub fn devices(&self) -> Vec<String> {
        let mut names: Vec<_> = lock(&self.inner.ports).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    pub fn set_value_provider(&self, provider: Arc<dyn ValueProvider>) {
        lock(&self.inner.providers).values = Some(provider.clone());
        for port in self.inner.ports_snapshot() {
            port.link.set_value_provider(provider.clone());
        }
    }

    pub fn set_file_localizer(&self, localizer: Arc<dyn FileLocalizer>) {
        lock(&self.inner.providers).files = localizer.clone();
        for port in self.inner.ports_snapshot() {
            port.link.set_file_localizer(localizer.clone());
        }
    }

    /// The relay's own connection to `device`, running the connect handshake if no
    /// conversation is open.
    pub fn connection(&self, device: &str, timeout: Duration) -> Result<Arc<VirtualLink>, LinkError> {
        if self.is_closing() {
            return Err(LinkError::ConnectionClosed);
        }
        let port = lock(&self.inner.ports)
            .get(device)
            .cloned()
            .ok_or_else(|| LinkError::ReceiverNotKnown(device.to_string()))?;
        if !port.link.is_closed() {
            port.link.add_user();
            return Ok(port.link.clone());
        }
        lock(&self.inner.negotiation).insert(device.to_string(), None);
        if let Err(e) = port.send(&self.inner.name, RouteCode::ConnectRequest, false) {
            lock(&self.inner.negotiation).remove(device);
            return Err(e);
        }
        let neg = lock(&self.inner.negotiation);
        let (mut neg, _) = wait_while(&self.inner.negotiation_cv, neg, timeout, |n| {
            matches!(n.get(device), Some(None))
        });
        let outcome = neg.remove(device).flatten();
        drop(neg);
        match outcome {
            Some(RouteCode::ConnectAck) | Some(RouteCode::ConnectRequest) => Ok(port.link.clone()),
            Some(RouteCode::ConnectDecline) => Err(LinkError::Declined(device.to_string())),
            Some(RouteCode::ReceiverNotKnown) => Err(LinkError::ReceiverNotKnown(device.to_string())),
            Some(other) => Err(LinkError::UnexpectedResponse(format!("{other:?}"))),
            None => Err(LinkError::Timeout),
        }
    }

    /// Stop forwarding, close the relay's own conversations, then every physical link.
    pub fn close(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(relay = %self.inner.name, "relay closing");
        for port in self.inner.ports_snapshot() {
            self.inner.close_device(&port);
        }
        info!(relay = %self.inner.name, "relay closed");
    }
}

impl RelayInner {
    fn ports_snapshot(&self) -> Vec<Arc<DevicePort>> {
        lock(&self.ports).values().cloned().collect()
    }

    /// Record the answer for `device`. False if nobody was waiting.
    fn settle(&self, device: &str, code: RouteCode) -> bool {
        let mut neg = lock(&self.negotiation);
        if !matches!(neg.get(device), Some(None)) {
            return false;
        }
        neg.insert(device.to_string(), Some(code));
        self.negotiation_cv.notify_all();
        true
    }

    fn is_expected(&self, device: &str) -> bool {
        matches!(lock(&self.negotiation).get(device), Some(None))
    }

    fn forward(&self, port: &DevicePort, frame: RoutedFrame) -> Result<(), LinkError> {
        if frame.code.is_physical_command() {
            return Err(LinkError::UnexpectedResponse(format!(
                "physical command from {} addressed to {}",
                frame.from, frame.to
            )));
        }
        if self.closing.load(Ordering::SeqCst) {
            debug!(from = %frame.from, to = %frame.to, "relay closing, frame dropped");
            return Ok(());
        }
        let target = lock(&self.ports).get(&frame.to).cloned();
        match target {
            Some(target) => {
                target.pump.write(routing::encode_routed(&frame), false)?;
                if self.config.log_traffic {
                    debug!(from = %frame.from, to = %frame.to, code = ?frame.code, "frame forwarded");
                }
                Ok(())
            }
            None => {
                info!(from = %frame.from, to = %frame.to, "receiver not known");
                port.pump.write(
                    routing::encode_control(&frame.to, &frame.from, RouteCode::ReceiverNotKnown),
                    false,
                )
            }
        }
    }

    fn on_own_frame(&self, port: &DevicePort, frame: RoutedFrame) -> Result<(), LinkError> {
        match frame.code {
            RouteCode::Data => {
                port.link.feed(&frame.payload);
                Ok(())
            }
            RouteCode::ConnectRequest => {
                port.link.reopen_conversation();
                port.send(&self.name, RouteCode::ConnectAck, false)?;
                info!(relay = %self.name, device = %port.device, "device connected to the relay");
                self.settle(&port.device, RouteCode::ConnectRequest);
                Ok(())
            }
            RouteCode::ConnectAck => {
                if !self.is_expected(&port.device) {
                    return Err(LinkError::UnexpectedResponse("connect ACK without request".into()));
                }
                port.link.reopen_conversation();
                self.settle(&port.device, RouteCode::ConnectAck);
                Ok(())
            }
            RouteCode::ConnectDecline | RouteCode::ReceiverNotKnown => {
                if !self.settle(&port.device, frame.code) {
                    debug!(device = %port.device, code = ?frame.code, "late admin answer ignored");
                }
                Ok(())
            }
            RouteCode::ClosePhysical => {
                if port.link.is_receiving_file() {
                    info!(device = %port.device, "physical close declined during file transfer");
                    return port.send(&self.name, RouteCode::ClosePhysicalDecline, false);
                }
                port.pump.deblock();
                let ack = port.send(&self.name, RouteCode::ClosePhysicalAck, true);
                self.close_port(port, "device closed the physical link");
                ack
            }
            RouteCode::ClosePhysicalAck => {
                self.close_port(port, "physical close acknowledged");
                Ok(())
            }
            RouteCode::ClosePhysicalDecline => {
                port.pump.deblock();
                lock(&port.state).close_declined = true;
                port.cv.notify_all();
                Ok(())
            }
        }
    }

    /// Close the relay's conversation on `port`, then ask the device to drop the physical
    /// link, retrying on decline until the close timeout.
    fn close_device(&self, port: &DevicePort) {
        let timeout = self.config.close_timeout();
        let mut ok = true;
        while ok && !port.link.is_closed() {
            ok = port.link.close_gracefully(timeout);
        }
        let deadline = Deadline::after(timeout);
        loop {
            {
                let mut st = lock(&port.state);
                if st.closing || st.closed {
                    return;
                }
                st.close_declined = false;
            }
            match port.send(&self.name, RouteCode::ClosePhysical, true) {
                Ok(()) | Err(LinkError::QueueBlocked) => {}
                Err(e) => {
                    warn!(device = %port.device, error = %e, "cannot request physical close");
                    break;
                }
            }
            let st = lock(&port.state);
            let (st, _) = wait_while(&port.cv, st, deadline.remaining(), |s| {
                !s.closed && !s.close_declined
            });
            if st.closed {
                return;
            }
            let declined = st.close_declined;
            drop(st);
            if !declined || deadline.expired() {
                break;
            }
            thread::sleep(CLOSE_RETRY_PAUSE);
        }
        self.close_port(port, "physical close timed out");
    }

    /// Drop a port: ends its link, drains its pump and shuts the physical link down.
    fn close_port(&self, port: &DevicePort, reason: &str) {
        {
            let mut st = lock(&port.state);
            if st.closing {
                return;
            }
            st.closing = true;
        }
        {
            let mut ports = lock(&self.ports);
            if ports
                .get(&port.device)
                .is_some_and(|p| std::ptr::eq(Arc::as_ptr(p), port))
            {
                ports.remove(&port.device);
            }
        }
        info!(relay = %self.name, device = %port.device, %reason, "physical link closed");
        port.link.terminate(reason);
        port.pump.shutdown(self.config.shutdown_timeout());
        if let Some(f) = lock(&port.shutdown).take() {
            f();
        }
        self.settle(&port.device, RouteCode::ReceiverNotKnown);
        lock(&port.state).closed = true;
        port.cv.notify_all();
    }
}

impl RouteHandler for PortReader {
    fn on_frame(&self, frame: RoutedFrame) -> Result<(), LinkError> {
        if frame.to == self.relay.name {
            self.relay.on_own_frame(&self.port, frame)
        } else {
            self.relay.forward(&self.port, frame)
        }
    }

    fn on_link_lost(&self, reason: &str) {
        self.relay.close_port(&self.port, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_device_has_no_connection() {
        let relay = RelayManager::new("PC", LinkConfig::default());
        assert!(relay.devices().is_empty());
        assert!(matches!(
            relay.connection("NXT9", Duration::from_millis(10)),
            Err(LinkError::ReceiverNotKnown(_))
        ));
    }

    #[test]
    fn closed_relay_refuses_new_devices() {
        let relay = RelayManager::new("PC", LinkConfig::default());
        relay.close();
        assert!(relay.is_closing());
        let physical = PhysicalLink::new(
            Box::new(std::io::empty()),
            Box::new(std::io::sink()),
            None,
        );
        assert!(matches!(
            relay.attach("NXT1", physical),
            Err(LinkError::ConnectionClosed)
        ));
    }
}
