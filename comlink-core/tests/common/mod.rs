#![allow(dead_code)]

use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use comlink_core::{LinkConfig, PhysicalLink, Providers, VirtualLink};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    client.set_nodelay(true).unwrap();
    server.set_nodelay(true).unwrap();
    (client, server)
}

pub fn config_in(dir: &Path) -> LinkConfig {
    LinkConfig {
        file_dir: dir.to_path_buf(),
        close_timeout_ms: 5_000,
        shutdown_timeout_ms: 5_000,
        ..LinkConfig::default()
    }
}

pub fn open(local: &str, remote: &str, stream: TcpStream, config: LinkConfig) -> Arc<VirtualLink> {
    let providers = Providers::new(&config);
    VirtualLink::open_direct(local, remote, PhysicalLink::from_tcp(stream).unwrap(), config, providers)
        .unwrap()
}

/// Two direct links talking to each other: `A->B` and `B->A`.
pub fn linked_pair(a_dir: &Path, b_dir: &Path) -> (Arc<VirtualLink>, Arc<VirtualLink>) {
    let (a, b) = tcp_pair();
    (open("A", "B", a, config_in(a_dir)), open("B", "A", b, config_in(b_dir)))
}

pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < WAIT {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
