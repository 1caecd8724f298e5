//! Physical links and the radio that opens them.
//!
//! [`TcpRadio`] stands in for the packet radio: peers are looked up by name and every new
//! stream starts with a hello carrying the protocol version and the sender's name.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown as NetShutdown, SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::protocol::PROTOCOL_VERSION;
use crate::wait::Deadline;
use crate::wire;

/// Tears the physical link down so a blocked reader returns.
pub type Shutdown = Box<dyn FnOnce() + Send>;

/// One open bidirectional byte stream to a peer.
pub struct PhysicalLink {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub shutdown: Option<Shutdown>,
}

impl PhysicalLink {
    pub fn new(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        shutdown: Option<Shutdown>,
    ) -> Self {
        Self {
            reader,
            writer,
            shutdown,
        }
    }

    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;
        Ok(Self::new(
            Box::new(reader),
            Box::new(writer),
            Some(Box::new(move || {
                let _ = stream.shutdown(NetShutdown::Both);
            })),
        ))
    }
}

/// Opens physical links to named peers and accepts incoming ones.
pub trait Radio: Send + Sync {
    fn connect(&self, peer: &str) -> io::Result<PhysicalLink>;

    /// Wait for an incoming link. Zero waits indefinitely; `None` on timeout.
    fn accept(&self, timeout: Duration) -> io::Result<Option<(String, PhysicalLink)>>;
}

/// Radio over TCP with a static name directory.
pub struct TcpRadio {
    name: String,
    listener: Option<TcpListener>,
    directory: HashMap<String, SocketAddr>,
    hello_timeout: Duration,
}

const ACCEPT_POLL: Duration = Duration::from_millis(10);
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

impl TcpRadio {
    /// A radio that can only dial out.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            listener: None,
            directory: HashMap::new(),
            hello_timeout: HELLO_TIMEOUT,
        }
    }

    /// A radio that also accepts links on `addr`.
    pub fn bind(name: impl Into<String>, addr: SocketAddr) -> io::Result<Self> {
        let mut radio = Self::new(name);
        radio.listener = Some(TcpListener::bind(addr)?);
        Ok(radio)
    }

    pub fn with_peer(mut self, name: impl Into<String>, addr: SocketAddr) -> Self {
        self.directory.insert(name.into(), addr);
        self
    }

    /// How long a new link may take to send its hello. Zero waits indefinitely.
    pub fn with_hello_timeout(mut self, timeout: Duration) -> Self {
        self.hello_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read the peer's hello, giving up after the hello timeout.
    fn timed_hello(&self, stream: &mut TcpStream) -> io::Result<String> {
        let timeout = (!self.hello_timeout.is_zero()).then_some(self.hello_timeout);
        stream.set_read_timeout(timeout)?;
        let remote = read_hello(stream);
        stream.set_read_timeout(None)?;
        remote
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.listener {
            Some(l) => l.local_addr(),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "radio is not listening")),
        }
    }

    fn accept_stream(&self, listener: &TcpListener, timeout: Duration) -> io::Result<Option<TcpStream>> {
        if timeout.is_zero() {
            return listener.accept().map(|(s, _)| Some(s));
        }
        let deadline = Deadline::after(timeout);
        listener.set_nonblocking(true)?;
        let res = loop {
            match listener.accept() {
                Ok((s, _)) => break Ok(Some(s)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if deadline.expired() {
                        break Ok(None);
                    }
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => break Err(e),
            }
        };
        listener.set_nonblocking(false)?;
        res
    }
}

fn write_hello(stream: &mut TcpStream, name: &str) -> io::Result<()> {
    let hello = wire::concat(&[&[PROTOCOL_VERSION], &wire::encode_str(name)]);
    stream.write_all(&hello)?;
    stream.flush()
}

fn read_hello(stream: &mut TcpStream) -> io::Result<String> {
    let mut version = [0u8; 1];
    stream.read_exact(&mut version)?;
    if version[0] != PROTOCOL_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("protocol version {} not supported", version[0]),
        ));
    }
    wire::read_string(stream).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

impl Radio for TcpRadio {
    fn connect(&self, peer: &str) -> io::Result<PhysicalLink> {
        let addr = self.directory.get(peer).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address for {peer}"))
        })?;
        let mut stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        write_hello(&mut stream, &self.name)?;
        let remote = self.timed_hello(&mut stream)?;
        if remote != peer {
            debug!(expected = %peer, got = %remote, "peer answered with a different name");
        }
        info!(peer = %peer, %addr, "physical link opened");
        PhysicalLink::from_tcp(stream)
    }

    fn accept(&self, timeout: Duration) -> io::Result<Option<(String, PhysicalLink)>> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "radio is not listening"))?;
        let Some(mut stream) = self.accept_stream(listener, timeout)? else {
            return Ok(None);
        };
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let remote = self.timed_hello(&mut stream)?;
        write_hello(&mut stream, &self.name)?;
        info!(peer = %remote, "physical link accepted");
        Ok(Some((remote, PhysicalLink::from_tcp(stream)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_exchanges_names() {
        let listener = TcpRadio::bind("NXT1", "127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let dialer = TcpRadio::new("PC").with_peer("NXT1", addr);
        let t = thread::spawn(move || dialer.connect("NXT1").map(|_| ()));
        let (name, _link) = listener.accept(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(name, "PC");
        t.join().unwrap().unwrap();
    }

    #[test]
    fn silent_client_does_not_stall_accept() {
        let radio = TcpRadio::bind("PC", "127.0.0.1:0".parse().unwrap())
            .unwrap()
            .with_hello_timeout(Duration::from_millis(100));
        let addr = radio.local_addr().unwrap();
        let _silent = TcpStream::connect(addr).unwrap();
        let start = std::time::Instant::now();
        assert!(radio.accept(Duration::from_secs(5)).is_err());
        assert!(start.elapsed() < Duration::from_secs(4));

        let dialer = TcpRadio::new("NXT1").with_peer("PC", addr);
        let t = thread::spawn(move || dialer.connect("PC").map(|_| ()));
        let (name, _link) = radio.accept(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(name, "NXT1");
        t.join().unwrap().unwrap();
    }

    #[test]
    fn accept_times_out() {
        let radio = TcpRadio::bind("NXT1", "127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(radio.accept(Duration::from_millis(30)).unwrap().is_none());
    }

    #[test]
    fn unknown_peer_is_not_found() {
        let radio = TcpRadio::new("PC");
        let err = radio.connect("nobody").err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
