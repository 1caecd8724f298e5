//! Virtual connection between two named endpoints.
//!
//! A link either owns its physical link (direct) or shares a relay uplink with other links
//! (routed). Both kinds speak the same frames and run the same close handshake.

use std::fmt;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::event::{Event, EventKind, LinkObserver, ObserverRegistry, Waiter};
use crate::file_transfer;
use crate::protocol::{Command, Frame};
use crate::provider::{FileLocalizer, Providers, ValueProvider};
use crate::reader::MessageReader;
use crate::routing::RoutedOutbound;
use crate::transport::{PhysicalLink, Shutdown};
use crate::wait::{lock, Deadline};
use crate::wire;
use crate::writer::OutputPump;

/// Pause before asking again after the peer declined a close.
pub(crate) const CLOSE_RETRY_PAUSE: Duration = Duration::from_millis(50);

pub(crate) enum LinkTransport {
    Direct {
        pump: OutputPump,
        shutdown: Mutex<Option<Shutdown>>,
    },
    Routed(RoutedOutbound),
}

#[derive(Debug)]
struct LinkState {
    closed: bool,
    /// Conversation ended while the physical link stays up. Only meaningful on relay-hosted
    /// links, which start out directly closed until a device connects.
    directly_closed: bool,
    users: usize,
    close_requested: bool,
    close_acknowledged: bool,
}

/// One virtual connection.
pub struct VirtualLink {
    local: String,
    remote: String,
    transport: LinkTransport,
    relay_hosted: bool,
    state: Mutex<LinkState>,
    reader: MessageReader,
    observers: ObserverRegistry,
    providers: Mutex<Providers>,
    config: LinkConfig,
    /// Keeps multi-frame writes (file parts, close) from interleaving.
    send_lock: Mutex<()>,
}

impl fmt::Display for VirtualLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.local, self.remote)
    }
}

impl VirtualLink {
    fn build(
        local: String,
        remote: String,
        transport: LinkTransport,
        relay_hosted: bool,
        config: LinkConfig,
        providers: Providers,
    ) -> Self {
        Self {
            local,
            remote,
            transport,
            relay_hosted,
            state: Mutex::new(LinkState {
                closed: false,
                directly_closed: relay_hosted,
                users: if relay_hosted { 0 } else { 1 },
                close_requested: false,
                close_acknowledged: false,
            }),
            reader: MessageReader::new(),
            observers: ObserverRegistry::new(),
            providers: Mutex::new(providers),
            config,
            send_lock: Mutex::new(()),
        }
    }

    /// Open a link that owns `physical`. Starts its reader thread and output pump.
    pub fn open_direct(
        local: impl Into<String>,
        remote: impl Into<String>,
        physical: PhysicalLink,
        config: LinkConfig,
        providers: Providers,
    ) -> Result<Arc<Self>, LinkError> {
        let local = local.into();
        let remote = remote.into();
        let PhysicalLink {
            reader,
            writer,
            shutdown,
        } = physical;
        let pump = OutputPump::spawn(
            format!("{local}->{remote}"),
            writer,
            config.queue_capacity,
            config.flush_after_write,
        )?;
        let transport = LinkTransport::Direct {
            pump,
            shutdown: Mutex::new(shutdown),
        };
        let link = Arc::new(Self::build(local, remote, transport, false, config, providers));
        let reader_link = link.clone();
        let spawned = thread::Builder::new()
            .name(format!("comlink-reader-{}", link.remote))
            .spawn(move || MessageReader::run(reader_link, reader));
        if let Err(e) = spawned {
            link.terminate("reader thread could not start");
            return Err(e.into());
        }
        info!(link = %link, "direct connection opened");
        Ok(link)
    }

    /// A link multiplexed over a shared uplink. Frames arrive through [`VirtualLink::feed`].
    pub(crate) fn routed(
        local: &str,
        remote: &str,
        uplink: Arc<OutputPump>,
        config: LinkConfig,
        providers: Providers,
        relay_hosted: bool,
    ) -> Arc<Self> {
        let transport = LinkTransport::Routed(RoutedOutbound::new(local, remote, uplink));
        let link = Arc::new(Self::build(
            local.to_string(),
            remote.to_string(),
            transport,
            relay_hosted,
            config,
            providers,
        ));
        debug!(link = %link, relay_hosted, "routed connection created");
        link
    }

    pub fn local_name(&self) -> &str {
        &self.local
    }

    pub fn remote_name(&self) -> &str {
        &self.remote
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.transport, LinkTransport::Direct { .. })
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// True once no more frames can be sent. For a relay-hosted link this is also the case
    /// between conversations.
    pub fn is_closed(&self) -> bool {
        let st = lock(&self.state);
        st.closed || (self.relay_hosted && st.directly_closed)
    }

    /// True once the link is gone for good.
    pub fn is_terminated(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn is_directly_closed(&self) -> bool {
        lock(&self.state).directly_closed
    }

    pub fn users(&self) -> usize {
        lock(&self.state).users
    }

    /// Count another user of a shared link.
    pub fn add_user(&self) {
        lock(&self.state).users += 1;
    }

    pub fn set_value_provider(&self, provider: Arc<dyn ValueProvider>) {
        lock(&self.providers).values = Some(provider);
    }

    pub fn set_file_localizer(&self, localizer: Arc<dyn FileLocalizer>) {
        lock(&self.providers).files = localizer;
    }

    /// Last valid degree the peer sent.
    pub fn remote_degree(&self) -> Option<f32> {
        self.reader.remote_degree()
    }

    pub fn remote_light_value(&self) -> Option<f32> {
        self.reader.remote_light_value()
    }

    /// Local path of the last file the peer sent; empty if it had none.
    pub fn remote_file_name(&self) -> Option<String> {
        self.reader.remote_file_name()
    }

    /// True while a multi-part file is half received.
    pub fn is_receiving_file(&self) -> bool {
        self.reader.is_receiving_file()
    }

    pub fn register(&self, observer: Arc<dyn LinkObserver>, kind: EventKind) {
        self.observers.register(observer, kind);
    }

    pub fn unregister(&self, observer: &Arc<dyn LinkObserver>, kind: EventKind) {
        self.observers.unregister(observer, kind);
    }

    pub fn unregister_all(&self, observer: &Arc<dyn LinkObserver>) {
        self.observers.unregister_all(observer);
    }

    pub fn observer_count(&self, kind: EventKind) -> usize {
        self.observers.count(kind)
    }

    pub fn write_degree(&self, degree: f32) -> Result<(), LinkError> {
        self.send(&Frame::Degree(degree), false)
    }

    pub fn write_light_value(&self, value: f32) -> Result<(), LinkError> {
        self.send(&Frame::Light(value), false)
    }

    /// Send a local file. Fails if the name cannot be localized or read, or if the queue
    /// has no room for the next part within `part_wait_timeout_ms`.
    pub fn write_file(&self, name: &str) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::ConnectionClosed);
        }
        let path = self.localize(name).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{name} cannot be localized"))
        })?;
        let data = fs::read(&path)?;
        self.send_file(name, &data)
    }

    /// Send a raw close handshake command.
    pub fn write_command(&self, command: Command, block_after: bool) -> Result<(), LinkError> {
        self.send(&Frame::Command(command), block_after)
    }

    /// Ask the peer for its degree. `observer`, if given, is registered for the answer.
    pub fn request_degree(&self, observer: Option<&Arc<dyn LinkObserver>>) -> Result<(), LinkError> {
        self.request(Frame::RequestDegree, EventKind::Degree, observer)
    }

    pub fn request_light_value(
        &self,
        observer: Option<&Arc<dyn LinkObserver>>,
    ) -> Result<(), LinkError> {
        self.request(Frame::RequestLight, EventKind::Light, observer)
    }

    pub fn request_file(
        &self,
        name: &str,
        observer: Option<&Arc<dyn LinkObserver>>,
    ) -> Result<(), LinkError> {
        let frame = Frame::RequestFile {
            name: name.to_string(),
        };
        self.request(frame, EventKind::File, observer)
    }

    fn request(
        &self,
        frame: Frame,
        kind: EventKind,
        observer: Option<&Arc<dyn LinkObserver>>,
    ) -> Result<(), LinkError> {
        if let Some(o) = observer {
            self.observers.register_once(o, kind);
        }
        self.send(&frame, false)
    }

    /// Ask the peer to close. `observer` hears about the close or a decline.
    ///
    /// On a link with several users this only drops one user and reports the close to
    /// `observer` right away.
    pub fn request_close(&self, observer: &Arc<dyn LinkObserver>) -> Result<(), LinkError> {
        let _guard = lock(&self.send_lock);
        {
            let mut st = lock(&self.state);
            if st.closed || (self.relay_hosted && st.directly_closed) {
                return Err(LinkError::ConnectionClosed);
            }
            if st.close_requested {
                return Err(LinkError::QueueBlocked);
            }
            if st.users > 1 {
                st.users -= 1;
                let users = st.users;
                drop(st);
                debug!(link = %self, users, "released one user of a shared connection");
                observer.on_closed(self);
                return Ok(());
            }
            st.close_requested = true;
        }
        self.observers.register_once(observer, EventKind::Close);
        self.observers.register_once(observer, EventKind::CloseDeclined);
        let close = wire::encode_frame(&Frame::Command(Command::Close));
        if let Err(e) = self.enqueue(close, true) {
            lock(&self.state).close_requested = false;
            return Err(e);
        }
        info!(link = %self, "close requested");
        Ok(())
    }

    /// Keep requesting a close until the link closes, a user is released, or `timeout`
    /// passes. Zero waits indefinitely. True on success.
    pub fn close_gracefully(&self, timeout: Duration) -> bool {
        let waiter = Waiter::new();
        let observer: Arc<dyn LinkObserver> = waiter.clone();
        let users_before = self.users();
        let released = |link: &Self| link.is_closed() || link.users() < users_before;
        let deadline = Deadline::after(timeout);
        let done = loop {
            if released(self) {
                break true;
            }
            if deadline.expired() {
                break false;
            }
            let seen = waiter.generation();
            match self.request_close(&observer) {
                Ok(()) | Err(LinkError::QueueBlocked) => {}
                Err(LinkError::ConnectionClosed) => break true,
                Err(e) => {
                    warn!(link = %self, error = %e, "close request failed");
                    break false;
                }
            }
            if released(self) {
                break true;
            }
            waiter.wait_past(seen, deadline.remaining());
            if matches!(waiter.last_event(), Some(Event::CloseDeclined)) && !released(self) {
                thread::sleep(CLOSE_RETRY_PAUSE);
            }
        };
        self.observers.unregister_all(&observer);
        if !done {
            warn!(link = %self, "graceful close timed out");
        }
        done
    }

    /// Tear the link down now, without a handshake.
    pub fn shutdown(&self) {
        self.terminate("shut down locally");
    }

    pub(crate) fn reader(&self) -> &MessageReader {
        &self.reader
    }

    pub(crate) fn providers(&self) -> Providers {
        lock(&self.providers).clone()
    }

    pub(crate) fn localize(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() {
            return None;
        }
        let files = lock(&self.providers).files.clone();
        files.path_for(name)
    }

    pub(crate) fn notify(&self, event: &Event) {
        self.observers.notify(self, event);
    }

    fn enqueue(&self, bytes: Vec<u8>, block_after: bool) -> Result<(), LinkError> {
        match &self.transport {
            LinkTransport::Direct { pump, .. } => pump.write(bytes, block_after),
            LinkTransport::Routed(out) => out.write(bytes, block_after),
        }
    }

    /// Queue one frame.
    pub(crate) fn send(&self, frame: &Frame, block_after: bool) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::ConnectionClosed);
        }
        self.enqueue(wire::encode_frame(frame), block_after)?;
        if self.config.log_traffic {
            debug!(link = %self, op = ?frame.opcode(), "frame queued");
        }
        Ok(())
    }

    fn wait_for_room(&self) -> bool {
        let timeout = self.config.part_wait_timeout();
        match &self.transport {
            LinkTransport::Direct { pump, .. } => pump.wait_for_room(timeout),
            LinkTransport::Routed(out) => out.uplink().wait_for_room(timeout),
        }
    }

    fn send_file(&self, name: &str, data: &[u8]) -> Result<(), LinkError> {
        let frames = file_transfer::file_frames(name, data, self.config.file_part_size);
        let _guard = lock(&self.send_lock);
        for frame in &frames {
            if !self.wait_for_room() {
                if self.is_closed() {
                    return Err(LinkError::ConnectionClosed);
                }
                warn!(link = %self, file = %name, "outbound queue stayed full, file transfer aborted");
                return Err(LinkError::Timeout);
            }
            self.send(frame, false)?;
        }
        info!(link = %self, file = %name, bytes = data.len(), parts = frames.len(), "file queued");
        Ok(())
    }

    /// Answer a file request. Anything that goes wrong locally is answered with an empty
    /// file.
    pub(crate) fn answer_file_request(&self, name: &str) {
        let data = self.localize(name).and_then(|path| match fs::read(&path) {
            Ok(d) => Some(d),
            Err(e) => {
                debug!(link = %self, path = %path.display(), error = %e, "requested file unreadable");
                None
            }
        });
        let res = match data {
            Some(d) => self.send_file(name, &d),
            None => self.send(&Frame::FileEmpty, false),
        };
        if let Err(e) = res {
            warn!(link = %self, file = %name, error = %e, "cannot answer file request");
        }
    }

    pub(crate) fn answer(&self, frame: Frame) {
        if let Err(e) = self.send(&frame, false) {
            warn!(link = %self, op = ?frame.opcode(), error = %e, "cannot answer request");
        }
    }

    /// (close requested, close acknowledged)
    pub(crate) fn close_flags(&self) -> (bool, bool) {
        let st = lock(&self.state);
        (st.close_requested, st.close_acknowledged)
    }

    pub(crate) fn mark_close_acknowledged(&self) {
        lock(&self.state).close_acknowledged = true;
    }

    /// Forget our own close request and let writes through again.
    pub(crate) fn abandon_close_request(&self) {
        lock(&self.state).close_requested = false;
        self.deblock();
    }

    fn deblock(&self) {
        match &self.transport {
            LinkTransport::Direct { pump, .. } => pump.deblock(),
            LinkTransport::Routed(out) => out.deblock(),
        }
    }

    /// End the current conversation: terminal for ordinary links, reversible for
    /// relay-hosted ones.
    pub(crate) fn close_connection(&self, reason: &str) {
        if self.relay_hosted {
            self.end_conversation(reason);
        } else {
            self.terminate(reason);
        }
    }

    /// Close for good and release the transport. Observers hear about it once.
    pub(crate) fn terminate(&self, reason: &str) {
        {
            let mut st = lock(&self.state);
            if st.closed {
                return;
            }
            st.closed = true;
            st.directly_closed = true;
            st.users = 0;
            st.close_requested = false;
            st.close_acknowledged = false;
        }
        info!(link = %self, %reason, "connection closed");
        match &self.transport {
            LinkTransport::Direct { pump, shutdown } => {
                pump.shutdown(self.config.shutdown_timeout());
                if let Some(f) = lock(shutdown).take() {
                    f();
                }
            }
            LinkTransport::Routed(out) => {
                out.deblock();
                self.reader.salvage(self);
            }
        }
        self.observers.notify_closed(self);
    }

    fn end_conversation(&self, reason: &str) {
        {
            let mut st = lock(&self.state);
            if st.closed || st.directly_closed {
                return;
            }
            st.directly_closed = true;
            st.users = 0;
            st.close_requested = false;
            st.close_acknowledged = false;
        }
        self.deblock();
        info!(link = %self, %reason, "conversation closed, physical link kept");
        self.observers.notify_closed(self);
    }

    /// Start a new conversation on a relay-hosted link. False if it is already open or gone.
    pub(crate) fn reopen_conversation(&self) -> bool {
        let mut st = lock(&self.state);
        if st.closed || !st.directly_closed {
            return false;
        }
        st.directly_closed = false;
        st.users = 1;
        true
    }

    /// Dispatch every frame in a routed payload.
    pub(crate) fn feed(&self, data: &[u8]) {
        let mut src = Cursor::new(data);
        while (src.position() as usize) < data.len() {
            if self.is_closed() {
                debug!(link = %self, "data for a closed connection dropped");
                return;
            }
            let mut code = [0u8; 1];
            if src.read_exact(&mut code).is_err() {
                return;
            }
            self.reader.handle(self, code[0], &mut src);
        }
    }
}
